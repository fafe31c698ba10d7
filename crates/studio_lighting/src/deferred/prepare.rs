//! Render-world systems that create, feed, and tear down the [`DeferredPipeline`].
//!
//! ```text
//! Prepare: prepare_deferred_meshes -> init_deferred_pipeline -> prepare_deferred_frame
//! Cleanup: cleanup_deferred_frame
//! ```

use bevy::core_pipeline::tonemapping::Tonemapping;
use bevy::prelude::*;
use bevy::render::{
    camera::ExtractedCamera,
    render_resource::PipelineCache,
    renderer::{RenderDevice, RenderQueue},
    view::{ExtractedView, ViewTarget},
};

use super::config::DeferredConfig;
use super::error::{DeferredError, DeferredResult};
use super::gbuffer::DeferredCamera;
use super::lighting::FrameCamera;
use super::mesh::{DeferredMeshCache, ExtractedDraws};
use super::pipeline::DeferredPipeline;

/// Present once initialization failed; stops the pipeline from being rebuilt
/// every frame.
#[derive(Resource, Debug)]
pub struct DeferredDisabled {
    pub reason: DeferredError,
}

/// Camera data for the frame, in the render world's conventions.
pub fn frame_camera(
    camera: &ExtractedCamera,
    view: &ExtractedView,
    deferred: &DeferredCamera,
    viewport_size: UVec2,
) -> FrameCamera {
    let world_from_view = view.world_from_view.to_matrix();
    FrameCamera {
        view: world_from_view.inverse(),
        projection: view.clip_from_view,
        position: view.world_from_view.translation(),
        near: deferred.near,
        far: deferred.far,
        viewport_origin: camera
            .viewport
            .as_ref()
            .map(|viewport| viewport.physical_position)
            .unwrap_or(UVec2::ZERO),
        viewport_size,
    }
}

/// Reject views whose main target the lighting pass cannot resolve into:
/// multisampled targets, HDR targets, and views Bevy tone maps a second time.
pub fn check_view_compatibility(
    msaa: Option<&Msaa>,
    tonemapping: Option<&Tonemapping>,
    hdr: bool,
) -> DeferredResult<()> {
    if msaa.is_some_and(|msaa| msaa.samples() > 1) {
        return Err(DeferredError::IncompatibleView("MSAA must be off"));
    }
    if hdr {
        return Err(DeferredError::IncompatibleView("HDR targets are not supported"));
    }
    if tonemapping.is_some_and(|tonemapping| *tonemapping != Tonemapping::None) {
        return Err(DeferredError::IncompatibleView("Tonemapping must be None"));
    }
    Ok(())
}

fn disable(commands: &mut Commands, pipeline: Option<&mut DeferredPipeline>, reason: DeferredError) {
    error!("Deferred lighting disabled: {}", reason);
    if let Some(pipeline) = pipeline {
        pipeline.destroy();
        commands.remove_resource::<DeferredPipeline>();
    }
    commands.insert_resource(DeferredDisabled { reason });
}

/// Create the pipeline for the first deferred camera that has a viewport.
#[allow(clippy::too_many_arguments)]
pub fn init_deferred_pipeline(
    mut commands: Commands,
    config: Res<DeferredConfig>,
    existing: Option<Res<DeferredPipeline>>,
    disabled: Option<Res<DeferredDisabled>>,
    render_device: Res<RenderDevice>,
    pipeline_cache: Res<PipelineCache>,
    asset_server: Res<AssetServer>,
    views: Query<
        (
            Entity,
            &ExtractedCamera,
            &ViewTarget,
            Option<&Msaa>,
            Option<&Tonemapping>,
        ),
        With<DeferredCamera>,
    >,
) {
    // Only initialize once
    if existing.is_some() || disabled.is_some() {
        return;
    }

    let usable = views
        .iter()
        .filter(|(entity, _, target, msaa, tonemapping)| {
            match check_view_compatibility(*msaa, *tonemapping, target.is_hdr()) {
                Ok(()) => true,
                Err(err) => {
                    warn_once!("Skipping deferred camera {:?}: {}", entity, err);
                    false
                }
            }
        })
        .find_map(|(entity, camera, target, _, _)| {
            camera
                .physical_viewport_size
                .filter(|size| size.x > 0 && size.y > 0)
                .map(|size| (entity, size, target.main_texture_format()))
        });
    let Some((entity, size, format)) = usable else {
        return;
    };

    let mut pipeline = DeferredPipeline::new((*config).clone());
    match pipeline.init(&render_device, &pipeline_cache, &asset_server, size, format) {
        Ok(()) => {
            pipeline.set_active_view(Some(entity));
            commands.insert_resource(pipeline);
        }
        Err(err) => disable(&mut commands, Some(&mut pipeline), err),
    }
}

/// Per-frame setup: pipeline readiness, resize, frame slot, camera, and draws.
#[allow(clippy::too_many_arguments)]
pub fn prepare_deferred_frame(
    mut commands: Commands,
    pipeline: Option<ResMut<DeferredPipeline>>,
    render_device: Res<RenderDevice>,
    render_queue: Res<RenderQueue>,
    pipeline_cache: Res<PipelineCache>,
    asset_server: Res<AssetServer>,
    draws: Res<ExtractedDraws>,
    meshes: Res<DeferredMeshCache>,
    views: Query<(&ExtractedCamera, &ExtractedView, &DeferredCamera)>,
) {
    let Some(mut pipeline) = pipeline else {
        return;
    };

    match pipeline.refresh_status(&pipeline_cache, &asset_server) {
        Ok(true) => {}
        // Pipelines still compiling
        Ok(false) => return,
        Err(err) => {
            disable(&mut commands, Some(&mut *pipeline), err);
            return;
        }
    }

    let active = pipeline
        .active_view()
        .and_then(|entity| views.get(entity).ok());
    let Some((camera, view, deferred)) = active else {
        // Camera went away; build again for whichever deferred camera exists next frame
        debug!("Deferred camera no longer present; releasing pipeline");
        pipeline.destroy();
        commands.remove_resource::<DeferredPipeline>();
        return;
    };
    let Some(size) = camera
        .physical_viewport_size
        .filter(|size| size.x > 0 && size.y > 0)
    else {
        return;
    };

    let camera = frame_camera(camera, view, deferred, size);
    match begin_frame(&mut pipeline, &render_device, &render_queue, camera, &draws, &meshes) {
        Ok(count) if count < draws.draws.len() => {
            debug!(
                "{} of {} deferred draws are waiting on mesh upload",
                draws.draws.len() - count,
                draws.draws.len()
            );
        }
        Ok(_) => {}
        Err(err) => disable(&mut commands, Some(&mut *pipeline), err),
    }
}

fn begin_frame(
    pipeline: &mut DeferredPipeline,
    render_device: &RenderDevice,
    render_queue: &RenderQueue,
    camera: FrameCamera,
    draws: &ExtractedDraws,
    meshes: &DeferredMeshCache,
) -> DeferredResult<usize> {
    pipeline.resize(render_device, camera.viewport_size)?;
    pipeline.advance_frame();
    pipeline.set_view_projection(render_queue, camera)?;
    pipeline.prepare_draws(render_device, &draws.draws, meshes)
}

/// Tear down a pipeline whose frame did not return to idle. It is rebuilt
/// from scratch on the next frame.
pub fn cleanup_deferred_frame(mut commands: Commands, pipeline: Option<ResMut<DeferredPipeline>>) {
    let Some(mut pipeline) = pipeline else {
        return;
    };
    if pipeline.sequencer().is_idle() {
        return;
    }

    warn!(
        "Deferred frame ended in {:?}; rebuilding the pipeline",
        pipeline.phase()
    );
    pipeline.destroy();
    commands.remove_resource::<DeferredPipeline>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy::ecs::system::RunSystemOnce;

    #[test]
    fn test_view_compatibility() {
        assert!(check_view_compatibility(Some(&Msaa::Off), Some(&Tonemapping::None), false).is_ok());
        assert!(check_view_compatibility(None, None, false).is_ok());

        assert_eq!(
            check_view_compatibility(Some(&Msaa::Sample4), Some(&Tonemapping::None), false),
            Err(DeferredError::IncompatibleView("MSAA must be off"))
        );
        assert!(matches!(
            check_view_compatibility(Some(&Msaa::Off), None, true),
            Err(DeferredError::IncompatibleView(_))
        ));
        assert!(matches!(
            check_view_compatibility(Some(&Msaa::Off), Some(&Tonemapping::TonyMcMapface), false),
            Err(DeferredError::IncompatibleView(_))
        ));
    }

    #[test]
    fn test_cleanup_keeps_idle_pipeline() {
        let mut world = World::new();
        world.insert_resource(DeferredPipeline::new(DeferredConfig::default()));

        world.run_system_once(cleanup_deferred_frame).unwrap();
        assert!(world.contains_resource::<DeferredPipeline>());
    }

    #[test]
    fn test_cleanup_removes_unfinished_frame() {
        let mut world = World::new();
        let pipeline = DeferredPipeline::new(DeferredConfig::default());
        pipeline.sequencer().render_shadows().unwrap();
        world.insert_resource(pipeline);

        world.run_system_once(cleanup_deferred_frame).unwrap();
        assert!(!world.contains_resource::<DeferredPipeline>());
    }
}
