//! The deferred pipeline: owner of every GPU object and the per-frame API.
//!
//! A frame is driven by the render graph nodes in this order:
//!
//! ```text
//! render_shadows -> begin_geometry_pass / draw_mesh* / end
//!                -> update_clusters
//!                -> begin_lighting_pass / render_lighting / end
//! ```
//!
//! [`FrameSequencer`] rejects anything else. Nodes only get `&World`, so the
//! methods used during graph execution take `&self`; everything that
//! reallocates (`init`, `resize`, `destroy`) takes `&mut self` and runs from
//! prepare or cleanup systems.

use std::sync::Mutex;

use bevy::prelude::*;
use bevy::render::{
    render_phase::TrackedRenderPass,
    render_resource::{
        BindGroup, LoadOp, Operations, PipelineCache, RenderPassColorAttachment,
        RenderPassDescriptor, RenderPipeline, StoreOp, TextureFormat,
    },
    renderer::{RenderContext, RenderDevice, RenderQueue},
    view::ViewTarget,
};

use super::cluster::LightClusterer;
use super::config::DeferredConfig;
use super::error::{DeferredError, DeferredResult};
use super::gbuffer::{GBuffer, GeometryViewUniform};
use super::light::{LightStore, PointLight};
use super::light_buffers::LightBuffers;
use super::lighting::{FrameCamera, LightingViewUniform};
use super::mesh::{DeferredMeshCache, DrawInstance, DrawScratch, ExtractedDraw, GpuMesh};
use super::pipelines::{DeferredBindings, DeferredPipelineKind, DeferredPipelines};
use super::sequencer::{FramePhase, FrameSequencer};
use super::shadow::ShadowCubeArray;

/// Compilation state of the render pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PipelineStatus {
    #[default]
    Uninitialized,
    Compiling,
    Ready,
    Failed,
}

/// Shadow draws need exactly one instance per mesh.
pub fn check_shadow_inputs<M, I>(meshes: &[M], instances: &[I]) -> DeferredResult<()> {
    if meshes.len() != instances.len() {
        return Err(DeferredError::MismatchedShadowInputs {
            meshes: meshes.len(),
            transforms: instances.len(),
        });
    }
    Ok(())
}

/// Render-world resource owning the deferred lighting GPU state.
#[derive(Resource)]
pub struct DeferredPipeline {
    config: DeferredConfig,
    sequencer: FrameSequencer,
    clusterer: Mutex<LightClusterer>,
    camera: Option<FrameCamera>,
    frame_index: usize,
    frame_count: u64,
    active_view: Option<Entity>,
    status: PipelineStatus,
    // Created in this order by `init`, released in reverse by `destroy`
    gbuffer: Option<GBuffer>,
    lights: Option<LightBuffers>,
    shadows: Option<ShadowCubeArray>,
    bindings: Option<DeferredBindings>,
    pipelines: Option<DeferredPipelines>,
    scratch: Option<DrawScratch>,
    render_device: Option<RenderDevice>,
}

impl DeferredPipeline {
    pub fn new(config: DeferredConfig) -> Self {
        Self {
            clusterer: Mutex::new(LightClusterer::new(config.cluster)),
            config,
            sequencer: FrameSequencer::default(),
            camera: None,
            frame_index: 0,
            frame_count: 0,
            active_view: None,
            status: PipelineStatus::Uninitialized,
            gbuffer: None,
            lights: None,
            shadows: None,
            bindings: None,
            pipelines: None,
            scratch: None,
            render_device: None,
        }
    }

    /// Create every GPU object for a `size` G-buffer resolving into `target_format`.
    ///
    /// On error the pipeline is left partially built; call [`destroy`](Self::destroy).
    pub fn init(
        &mut self,
        render_device: &RenderDevice,
        pipeline_cache: &PipelineCache,
        asset_server: &AssetServer,
        size: UVec2,
        target_format: TextureFormat,
    ) -> DeferredResult<()> {
        self.destroy();
        self.config.validate()?;
        self.render_device = Some(render_device.clone());

        let gbuffer = self.gbuffer.insert(GBuffer::new(render_device, size)?);
        let lights = self.lights.insert(LightBuffers::new(render_device, &self.config)?);
        let shadows = self
            .shadows
            .insert(ShadowCubeArray::new(render_device, &self.config.shadow)?);
        let bindings = self
            .bindings
            .insert(DeferredBindings::new(render_device, gbuffer, lights, shadows));
        self.pipelines = Some(DeferredPipelines::new(
            pipeline_cache,
            asset_server,
            bindings,
            shadows,
            target_format,
        ));
        self.scratch = Some(DrawScratch::default());

        self.status = PipelineStatus::Compiling;
        self.frame_index = 0;

        info!(
            "Deferred lighting initialized: {}x{} G-buffer, {}x{}x{} clusters, {} shadow casters, {} frames in flight",
            size.x,
            size.y,
            self.config.cluster.tiles_x,
            self.config.cluster.tiles_y,
            self.config.cluster.slices_z,
            self.config.shadow.max_casters,
            self.config.frames_in_flight,
        );
        Ok(())
    }

    /// Poll pipeline compilation. Returns true once every pipeline is usable.
    pub fn refresh_status(
        &mut self,
        pipeline_cache: &PipelineCache,
        asset_server: &AssetServer,
    ) -> DeferredResult<bool> {
        if self.status == PipelineStatus::Ready {
            return Ok(true);
        }
        let pipelines = self
            .pipelines
            .as_ref()
            .ok_or(DeferredError::NotInitialized("render pipelines"))?;

        match pipelines.status(pipeline_cache, asset_server) {
            Ok(true) => {
                self.status = PipelineStatus::Ready;
                info!("Deferred lighting pipelines compiled");
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                self.status = PipelineStatus::Failed;
                Err(err)
            }
        }
    }

    /// Move to the next frame-in-flight slot.
    pub fn advance_frame(&mut self) {
        let frames = self.config.frames_in_flight.max(1) as usize;
        self.frame_index = (self.frame_index + 1) % frames;
        self.frame_count += 1;
    }

    /// Supply this frame's camera. Must be called while no frame is in progress.
    pub fn set_view_projection(&mut self, queue: &RenderQueue, camera: FrameCamera) -> DeferredResult<()> {
        self.sequencer.expect_idle("set_view_projection")?;
        let lights = self
            .lights
            .as_ref()
            .ok_or(DeferredError::NotInitialized("light buffers"))?;

        lights.write_views(
            queue,
            self.frame_index,
            &GeometryViewUniform::new(&camera),
            &LightingViewUniform::new(&camera, &self.config.cluster, &self.config.shadow),
        )?;
        self.camera = Some(camera);
        Ok(())
    }

    /// Build this frame's draw instances. Returns how many are drawable.
    pub fn prepare_draws(
        &mut self,
        render_device: &RenderDevice,
        draws: &[ExtractedDraw],
        meshes: &DeferredMeshCache,
    ) -> DeferredResult<usize> {
        self.sequencer.expect_idle("prepare_draws")?;
        let (Some(bindings), Some(scratch)) = (&self.bindings, &mut self.scratch) else {
            return Err(DeferredError::NotInitialized("draw scratch"));
        };
        scratch.rebuild(render_device, &bindings.instance_layout, draws, meshes);
        Ok(scratch.instances.len())
    }

    /// Render the cube shadow maps of the leading lights. Starts the frame.
    ///
    /// Returns the number of shadow casters rendered.
    pub fn render_shadows(
        &self,
        render_context: &mut RenderContext,
        pipeline_cache: &PipelineCache,
        queue: &RenderQueue,
        lights: &[PointLight],
        meshes: &[&GpuMesh],
        instances: &[DrawInstance],
    ) -> DeferredResult<usize> {
        check_shadow_inputs(meshes, instances)?;
        self.sequencer.render_shadows()?;

        let (shadows, pipeline) = match self.shadow_resources(pipeline_cache) {
            Ok(resources) => resources,
            Err(err) => {
                self.sequencer.fault();
                return Err(err);
            }
        };

        let lights = &lights[..lights.len().min(self.config.max_lights as usize)];
        let casters = shadows.write_faces(queue, lights);
        shadows.render(render_context, pipeline, casters, meshes, instances);
        Ok(casters)
    }

    /// Open the G-buffer pass. All four color targets and depth are cleared.
    pub fn begin_geometry_pass<'a>(
        &'a self,
        render_context: &'a mut RenderContext<'_>,
        pipeline_cache: &'a PipelineCache,
    ) -> DeferredResult<GeometryPass<'a>> {
        self.sequencer.begin_geometry()?;

        let (gbuffer, view, pipeline) = match self.geometry_resources(pipeline_cache) {
            Ok(resources) => resources,
            Err(err) => {
                self.sequencer.fault();
                return Err(err);
            }
        };

        let color_attachments = gbuffer.color_attachments();
        let mut render_pass = render_context.begin_tracked_render_pass(RenderPassDescriptor {
            label: Some("gbuffer_pass"),
            color_attachments: &color_attachments,
            depth_stencil_attachment: Some(gbuffer.depth_attachment()),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        render_pass.set_render_pipeline(pipeline);
        render_pass.set_bind_group(0, view, &[]);

        Ok(GeometryPass {
            sequencer: &self.sequencer,
            render_pass,
            draws: 0,
            ended: false,
        })
    }

    /// Upload the light store and rebuild the cluster tables for this frame's camera.
    ///
    /// Returns the number of light indices written.
    pub fn update_clusters(&self, queue: &RenderQueue, store: &LightStore) -> DeferredResult<usize> {
        self.sequencer.update_clusters()?;

        let result = self.cluster_lights(queue, store);
        if result.is_err() {
            self.sequencer.fault();
        }
        result
    }

    fn cluster_lights(&self, queue: &RenderQueue, store: &LightStore) -> DeferredResult<usize> {
        let camera = self
            .camera
            .as_ref()
            .ok_or(DeferredError::NotInitialized("view projection"))?;
        let buffers = self
            .lights
            .as_ref()
            .ok_or(DeferredError::NotInitialized("light buffers"))?;

        let lights = &store.lights()[..store.len().min(self.config.max_lights as usize)];
        let casters = self.config.shadow_caster_count(lights.len());
        buffers.upload_lights(queue, self.frame_index, store, camera.position, casters)?;

        let mut clusterer = self
            .clusterer
            .lock()
            .map_err(|_| DeferredError::Poisoned("light clusterer"))?;
        clusterer.update_clusters(lights, camera.view, camera.projection, camera.near, camera.far)?;
        buffers.upload_clusters(queue, self.frame_index, &clusterer)?;

        if clusterer.saturated_cells() > 0 {
            debug!(
                "{} clusters hit the {} light cap",
                clusterer.saturated_cells(),
                self.config.cluster.max_lights_per_cluster
            );
        }
        Ok(clusterer.total_indices())
    }

    /// Open the fullscreen resolve pass into `target`.
    pub fn begin_lighting_pass<'a>(
        &'a self,
        render_context: &'a mut RenderContext<'_>,
        pipeline_cache: &'a PipelineCache,
        target: &'a ViewTarget,
    ) -> DeferredResult<LightingPass<'a>> {
        self.sequencer.begin_lighting()?;

        let (camera, bind_group, pipeline) = match self.lighting_resources(pipeline_cache) {
            Ok(resources) => resources,
            Err(err) => {
                self.sequencer.fault();
                return Err(err);
            }
        };

        let mut render_pass = render_context.begin_tracked_render_pass(RenderPassDescriptor {
            label: Some("deferred_lighting_pass"),
            color_attachments: &[Some(RenderPassColorAttachment {
                view: target.main_texture_view(),
                resolve_target: None,
                ops: Operations {
                    load: LoadOp::Clear(wgpu::Color::BLACK),
                    store: StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        render_pass.set_viewport(
            camera.viewport_origin.x as f32,
            camera.viewport_origin.y as f32,
            camera.viewport_size.x as f32,
            camera.viewport_size.y as f32,
            0.0,
            1.0,
        );
        render_pass.set_render_pipeline(pipeline);
        render_pass.set_bind_group(0, bind_group, &[]);

        Ok(LightingPass {
            sequencer: &self.sequencer,
            render_pass,
            ended: false,
        })
    }

    /// Recreate the G-buffer at `size`. Only valid between frames.
    ///
    /// Returns false if the size did not change.
    pub fn resize(&mut self, render_device: &RenderDevice, size: UVec2) -> DeferredResult<bool> {
        self.sequencer.expect_idle("resize")?;
        let (Some(gbuffer), Some(lights), Some(shadows), Some(bindings)) = (
            &mut self.gbuffer,
            &self.lights,
            &self.shadows,
            &mut self.bindings,
        ) else {
            return Err(DeferredError::NotInitialized("gbuffer"));
        };
        if gbuffer.size() == size {
            return Ok(false);
        }

        // Previous frames may still sample the old targets
        wait_for_idle(render_device, "resize");

        let old = gbuffer.size();
        gbuffer.resize(render_device, size)?;
        bindings.rebuild_lighting(render_device, gbuffer, lights, shadows);
        debug!(
            "Deferred G-buffer resized {}x{} -> {}x{}",
            old.x, old.y, size.x, size.y
        );
        Ok(true)
    }

    /// Release every GPU object, in reverse creation order. Safe to call
    /// repeatedly and on a partially initialized pipeline.
    pub fn destroy(&mut self) {
        if let Some(render_device) = self.render_device.take() {
            wait_for_idle(&render_device, "destroy");
        }

        self.scratch.take();
        self.pipelines.take();
        self.bindings.take();
        self.shadows.take();
        self.lights.take();
        self.gbuffer.take();

        self.camera = None;
        self.status = PipelineStatus::Uninitialized;
        self.sequencer.reset();
    }

    /// Log a failed pass and fault the frame.
    pub fn abort_frame(&self, stage: &str, err: &DeferredError) {
        error!("Deferred {} failed: {}", stage, err);
        self.sequencer.fault();
    }

    fn shadow_resources<'a>(
        &'a self,
        pipeline_cache: &'a PipelineCache,
    ) -> DeferredResult<(&'a ShadowCubeArray, &'a RenderPipeline)> {
        let shadows = self
            .shadows
            .as_ref()
            .ok_or(DeferredError::NotInitialized("shadow cube array"))?;
        let pipeline = self.require_pipeline(pipeline_cache, DeferredPipelineKind::Shadow)?;
        Ok((shadows, pipeline))
    }

    fn geometry_resources<'a>(
        &'a self,
        pipeline_cache: &'a PipelineCache,
    ) -> DeferredResult<(&'a GBuffer, &'a BindGroup, &'a RenderPipeline)> {
        let gbuffer = self
            .gbuffer
            .as_ref()
            .ok_or(DeferredError::NotInitialized("gbuffer"))?;
        let view = self
            .bindings
            .as_ref()
            .ok_or(DeferredError::NotInitialized("bindings"))?
            .geometry_view(self.frame_index)?;
        let pipeline = self.require_pipeline(pipeline_cache, DeferredPipelineKind::Geometry)?;
        Ok((gbuffer, view, pipeline))
    }

    fn lighting_resources<'a>(
        &'a self,
        pipeline_cache: &'a PipelineCache,
    ) -> DeferredResult<(&'a FrameCamera, &'a BindGroup, &'a RenderPipeline)> {
        let camera = self
            .camera
            .as_ref()
            .ok_or(DeferredError::NotInitialized("view projection"))?;
        let bind_group = self
            .bindings
            .as_ref()
            .ok_or(DeferredError::NotInitialized("bindings"))?
            .lighting(self.frame_index)?;
        let pipeline = self.require_pipeline(pipeline_cache, DeferredPipelineKind::Lighting)?;
        Ok((camera, bind_group, pipeline))
    }

    fn require_pipeline<'a>(
        &self,
        pipeline_cache: &'a PipelineCache,
        kind: DeferredPipelineKind,
    ) -> DeferredResult<&'a RenderPipeline> {
        self.pipelines
            .as_ref()
            .ok_or(DeferredError::NotInitialized("render pipelines"))?
            .require(pipeline_cache, kind)
    }

    pub fn is_initialized(&self) -> bool {
        self.gbuffer.is_some()
            && self.lights.is_some()
            && self.shadows.is_some()
            && self.bindings.is_some()
            && self.pipelines.is_some()
            && self.scratch.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.status == PipelineStatus::Ready && self.is_initialized()
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn phase(&self) -> FramePhase {
        self.sequencer.phase()
    }

    pub fn sequencer(&self) -> &FrameSequencer {
        &self.sequencer
    }

    pub fn config(&self) -> &DeferredConfig {
        &self.config
    }

    pub fn camera(&self) -> Option<&FrameCamera> {
        self.camera.as_ref()
    }

    pub fn gbuffer_size(&self) -> Option<UVec2> {
        self.gbuffer.as_ref().map(GBuffer::size)
    }

    pub fn frame_slot(&self) -> usize {
        self.frame_index
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// The view rendered through this pipeline.
    pub fn active_view(&self) -> Option<Entity> {
        self.active_view
    }

    pub fn set_active_view(&mut self, view: Option<Entity>) {
        self.active_view = view;
    }

    pub fn draw_instances(&self) -> &[DrawInstance] {
        self.scratch
            .as_ref()
            .map(|scratch| scratch.instances.as_slice())
            .unwrap_or_default()
    }

    /// This frame's draws as parallel mesh and instance slices.
    pub fn frame_draws<'a>(&'a self, cache: &'a DeferredMeshCache) -> (Vec<&'a GpuMesh>, &'a [DrawInstance]) {
        match &self.scratch {
            Some(scratch) => (scratch.meshes(cache), scratch.instances.as_slice()),
            None => (Vec::new(), &[]),
        }
    }

    /// Run `f` on the clusterer tables of the last `update_clusters`.
    pub fn with_clusterer<R>(&self, f: impl FnOnce(&LightClusterer) -> R) -> DeferredResult<R> {
        let clusterer = self
            .clusterer
            .lock()
            .map_err(|_| DeferredError::Poisoned("light clusterer"))?;
        Ok(f(&clusterer))
    }
}

/// Block until the device finishes submitted work. A failed wait is logged;
/// the caller carries on since there is nothing left to wait for.
fn wait_for_idle(render_device: &RenderDevice, stage: &str) -> bool {
    log_poll(render_device.wgpu_device().poll(wgpu::PollType::wait()), stage)
}

fn log_poll<T>(result: Result<T, wgpu::PollError>, stage: &str) -> bool {
    match result {
        Ok(_) => true,
        Err(err) => {
            warn!("Waiting for the GPU during {} failed: {}", stage, err);
            false
        }
    }
}

/// The pipeline, if it is ready to render `view` this frame.
///
/// Returns `None` after an earlier pass faulted the frame, so later nodes
/// stay quiet until cleanup tears the pipeline down.
pub fn frame_pipeline(world: &World, view: Entity) -> Option<&DeferredPipeline> {
    let pipeline = world.get_resource::<DeferredPipeline>()?;
    if !pipeline.is_ready()
        || pipeline.active_view() != Some(view)
        || pipeline.phase() == FramePhase::Faulted
    {
        return None;
    }
    Some(pipeline)
}

impl Drop for DeferredPipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// An open G-buffer pass. Must be closed with [`end`](Self::end); dropping it
/// open faults the frame.
pub struct GeometryPass<'a> {
    sequencer: &'a FrameSequencer,
    render_pass: TrackedRenderPass<'a>,
    draws: usize,
    ended: bool,
}

impl<'a> GeometryPass<'a> {
    /// Draw one mesh with its instance transform and material.
    ///
    /// Returns false for an empty mesh, which is skipped.
    pub fn draw_mesh(&mut self, mesh: &'a GpuMesh, instance: &'a DrawInstance) -> DeferredResult<bool> {
        self.sequencer.expect_geometry_open("draw_mesh")?;
        if !mesh.is_drawable() {
            return Ok(false);
        }
        self.render_pass.set_bind_group(1, instance.bind_group(), &[]);
        let drawn = mesh.draw(&mut self.render_pass);
        if drawn {
            self.draws += 1;
        }
        Ok(drawn)
    }

    pub fn draw_count(&self) -> usize {
        self.draws
    }

    pub fn end(mut self) -> DeferredResult<()> {
        self.ended = true;
        self.sequencer.end_geometry()
    }
}

impl Drop for GeometryPass<'_> {
    fn drop(&mut self) {
        if !self.ended {
            error!("Geometry pass dropped without end(); faulting frame");
            self.sequencer.fault();
        }
    }
}

/// An open lighting resolve pass.
pub struct LightingPass<'a> {
    sequencer: &'a FrameSequencer,
    render_pass: TrackedRenderPass<'a>,
    ended: bool,
}

impl LightingPass<'_> {
    /// Draw the fullscreen triangle that shades every G-buffer texel.
    pub fn render_lighting(&mut self) -> DeferredResult<()> {
        self.sequencer.expect_lighting_open("render_lighting")?;
        self.render_pass.draw(0..3, 0..1);
        Ok(())
    }

    pub fn end(mut self) -> DeferredResult<()> {
        self.ended = true;
        self.sequencer.end_lighting()
    }
}

impl Drop for LightingPass<'_> {
    fn drop(&mut self) {
        if !self.ended {
            error!("Lighting pass dropped without end(); faulting frame");
            self.sequencer.fault();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroy_is_idempotent() {
        let mut pipeline = DeferredPipeline::new(DeferredConfig::default());
        assert!(!pipeline.is_initialized());

        pipeline.destroy();
        pipeline.destroy();
        assert_eq!(pipeline.status(), PipelineStatus::Uninitialized);
        assert_eq!(pipeline.phase(), FramePhase::Idle);
        assert!(pipeline.draw_instances().is_empty());
    }

    #[test]
    fn test_destroy_clears_faulted_frame() {
        let mut pipeline = DeferredPipeline::new(DeferredConfig::default());
        pipeline.sequencer().render_shadows().unwrap();
        pipeline.sequencer().fault();
        assert_eq!(pipeline.phase(), FramePhase::Faulted);

        pipeline.destroy();
        assert_eq!(pipeline.phase(), FramePhase::Idle);
    }

    #[test]
    fn test_shadow_input_lengths_must_match() {
        let meshes = [0u8; 3];
        let transforms = [Mat4::IDENTITY; 2];
        assert_eq!(
            check_shadow_inputs(&meshes, &transforms),
            Err(DeferredError::MismatchedShadowInputs {
                meshes: 3,
                transforms: 2
            })
        );
        assert!(check_shadow_inputs(&meshes[..2], &transforms).is_ok());
        assert!(check_shadow_inputs::<u8, Mat4>(&[], &[]).is_ok());
    }

    #[test]
    fn test_advance_frame_cycles_slots() {
        let mut config = DeferredConfig::default();
        config.frames_in_flight = 3;
        let mut pipeline = DeferredPipeline::new(config);

        let slots: Vec<usize> = (0..6)
            .map(|_| {
                pipeline.advance_frame();
                pipeline.frame_slot()
            })
            .collect();
        assert_eq!(slots, vec![1, 2, 0, 1, 2, 0]);
        assert_eq!(pipeline.frame_count(), 6);
    }

    #[test]
    fn test_uninitialized_pipeline_is_not_ready() {
        let pipeline = DeferredPipeline::new(DeferredConfig::default());
        assert!(!pipeline.is_ready());
        assert!(pipeline.camera().is_none());
        assert!(pipeline.gbuffer_size().is_none());
        assert_eq!(pipeline.with_clusterer(|c| c.total_indices()), Ok(0));
    }

    #[test]
    fn test_failed_gpu_wait_is_reported() {
        assert!(log_poll(Ok(()), "resize"));
        assert!(!log_poll::<()>(Err(wgpu::PollError::Timeout), "destroy"));
    }

    #[test]
    fn test_clusterer_uses_configured_grid() {
        let mut config = DeferredConfig::default();
        config.cluster.slices_z = 4;
        let pipeline = DeferredPipeline::new(config);
        let grid = pipeline.with_clusterer(|c| c.grid()).unwrap();
        assert_eq!(grid.slices_z, 4);
        assert_eq!(grid.tiles_x, 16);
    }
}
