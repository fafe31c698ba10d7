//! Bind group layouts, bind groups, and render pipelines.
//!
//! ```text
//! geometry: group 0 = GeometryView        group 1 = DrawInstance
//! shadow:   group 0 = ShadowFace          group 1 = DrawInstance
//! lighting: group 0 = G-buffer + lights + clusters + shadow cube array + LightingView
//! ```

use bevy::asset::LoadState;
use bevy::prelude::*;
use bevy::shader::ShaderDefVal;
use bevy::render::{
    render_resource::{
        BindGroup, BindGroupEntry, BindGroupLayout, BindGroupLayoutEntry, BindingResource,
        BindingType, BufferBindingType, CachedPipelineState, CachedRenderPipelineId,
        ColorTargetState, ColorWrites, CompareFunction, DepthBiasState, DepthStencilState,
        FragmentState, MultisampleState, PipelineCache, PrimitiveState, RenderPipeline,
        RenderPipelineDescriptor, SamplerBindingType, ShaderStages, StencilState,
        TextureFormat, TextureSampleType, TextureViewDimension, VertexState,
    },
    renderer::RenderDevice,
};

use super::error::{DeferredError, DeferredResult};
use super::gbuffer::{gbuffer_color_targets, GBuffer, GBUFFER_DEPTH_FORMAT};
use super::light_buffers::LightBuffers;
use super::mesh::DeferredVertex;
use super::shadow::{ShadowCubeArray, SHADOW_DEPTH_FORMAT};

pub const GBUFFER_SHADER: &str = "shaders/gbuffer.wgsl";
pub const SHADOW_SHADER: &str = "shaders/point_shadow_depth.wgsl";
pub const LIGHTING_SHADER: &str = "shaders/deferred_lighting.wgsl";

fn uniform_entry(binding: u32, visibility: ShaderStages) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::FRAGMENT,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(
    binding: u32,
    sample_type: TextureSampleType,
    view_dimension: TextureViewDimension,
) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::FRAGMENT,
        ty: BindingType::Texture {
            sample_type,
            view_dimension,
            multisampled: false,
        },
        count: None,
    }
}

/// Layout of the lighting pass bind group.
pub fn lighting_layout_entries() -> Vec<BindGroupLayoutEntry> {
    let unfiltered = TextureSampleType::Float { filterable: false };
    vec![
        // G-buffer: position, normal, albedo_ao, material, depth
        texture_entry(0, unfiltered, TextureViewDimension::D2),
        texture_entry(1, unfiltered, TextureViewDimension::D2),
        texture_entry(2, unfiltered, TextureViewDimension::D2),
        texture_entry(3, unfiltered, TextureViewDimension::D2),
        texture_entry(4, TextureSampleType::Depth, TextureViewDimension::D2),
        // Lights and cluster tables
        storage_entry(5),
        uniform_entry(6, ShaderStages::FRAGMENT),
        storage_entry(7),
        storage_entry(8),
        // Point shadows
        texture_entry(9, TextureSampleType::Depth, TextureViewDimension::CubeArray),
        BindGroupLayoutEntry {
            binding: 10,
            visibility: ShaderStages::FRAGMENT,
            ty: BindingType::Sampler(SamplerBindingType::NonFiltering),
            count: None,
        },
        uniform_entry(11, ShaderStages::FRAGMENT),
    ]
}

/// Layouts plus the per-frame-slot bind groups built from them.
pub struct DeferredBindings {
    pub geometry_view_layout: BindGroupLayout,
    pub instance_layout: BindGroupLayout,
    pub lighting_layout: BindGroupLayout,
    geometry_view_groups: Vec<BindGroup>,
    lighting_groups: Vec<BindGroup>,
}

impl DeferredBindings {
    pub fn new(
        render_device: &RenderDevice,
        gbuffer: &GBuffer,
        lights: &LightBuffers,
        shadows: &ShadowCubeArray,
    ) -> Self {
        let geometry_view_layout = render_device.create_bind_group_layout(
            "deferred_geometry_view_layout",
            &[uniform_entry(0, ShaderStages::VERTEX_FRAGMENT)],
        );
        let instance_layout = render_device.create_bind_group_layout(
            "deferred_draw_instance_layout",
            &[uniform_entry(0, ShaderStages::VERTEX_FRAGMENT)],
        );
        let lighting_layout = render_device
            .create_bind_group_layout("deferred_lighting_layout", &lighting_layout_entries());

        let geometry_view_groups = lights
            .slots()
            .iter()
            .map(|slot| {
                render_device.create_bind_group(
                    Some("deferred_geometry_view_bind_group"),
                    &geometry_view_layout,
                    &[BindGroupEntry {
                        binding: 0,
                        resource: slot.geometry_view.as_entire_binding(),
                    }],
                )
            })
            .collect();

        let lighting_groups =
            Self::create_lighting_groups(render_device, &lighting_layout, gbuffer, lights, shadows);

        Self {
            geometry_view_layout,
            instance_layout,
            lighting_layout,
            geometry_view_groups,
            lighting_groups,
        }
    }

    fn create_lighting_groups(
        render_device: &RenderDevice,
        layout: &BindGroupLayout,
        gbuffer: &GBuffer,
        lights: &LightBuffers,
        shadows: &ShadowCubeArray,
    ) -> Vec<BindGroup> {
        lights
            .slots()
            .iter()
            .map(|slot| {
                render_device.create_bind_group(
                    Some("deferred_lighting_bind_group"),
                    layout,
                    &[
                        BindGroupEntry {
                            binding: 0,
                            resource: BindingResource::TextureView(gbuffer.position.view()),
                        },
                        BindGroupEntry {
                            binding: 1,
                            resource: BindingResource::TextureView(gbuffer.normal.view()),
                        },
                        BindGroupEntry {
                            binding: 2,
                            resource: BindingResource::TextureView(gbuffer.albedo_ao.view()),
                        },
                        BindGroupEntry {
                            binding: 3,
                            resource: BindingResource::TextureView(gbuffer.material.view()),
                        },
                        BindGroupEntry {
                            binding: 4,
                            resource: BindingResource::TextureView(gbuffer.depth.view()),
                        },
                        BindGroupEntry {
                            binding: 5,
                            resource: slot.lights.as_entire_binding(),
                        },
                        BindGroupEntry {
                            binding: 6,
                            resource: slot.light_uniforms.as_entire_binding(),
                        },
                        BindGroupEntry {
                            binding: 7,
                            resource: slot.clusters.as_entire_binding(),
                        },
                        BindGroupEntry {
                            binding: 8,
                            resource: slot.light_indices.as_entire_binding(),
                        },
                        BindGroupEntry {
                            binding: 9,
                            resource: BindingResource::TextureView(shadows.cube_view()),
                        },
                        BindGroupEntry {
                            binding: 10,
                            resource: BindingResource::Sampler(shadows.sampler()),
                        },
                        BindGroupEntry {
                            binding: 11,
                            resource: slot.lighting_view.as_entire_binding(),
                        },
                    ],
                )
            })
            .collect()
    }

    /// Rebuild the lighting bind groups after the G-buffer was recreated.
    pub fn rebuild_lighting(
        &mut self,
        render_device: &RenderDevice,
        gbuffer: &GBuffer,
        lights: &LightBuffers,
        shadows: &ShadowCubeArray,
    ) {
        self.lighting_groups = Self::create_lighting_groups(
            render_device,
            &self.lighting_layout,
            gbuffer,
            lights,
            shadows,
        );
    }

    pub fn geometry_view(&self, slot: usize) -> DeferredResult<&BindGroup> {
        self.geometry_view_groups
            .get(slot)
            .ok_or(DeferredError::NotInitialized("geometry view bind group"))
    }

    pub fn lighting(&self, slot: usize) -> DeferredResult<&BindGroup> {
        self.lighting_groups
            .get(slot)
            .ok_or(DeferredError::NotInitialized("lighting bind group"))
    }
}

/// Shader defs for the lighting pipeline writing to `target_format`.
pub fn lighting_shader_defs(target_format: TextureFormat) -> Vec<ShaderDefVal> {
    if target_format.is_srgb() {
        vec![]
    } else {
        vec!["MANUAL_GAMMA".into()]
    }
}

/// The three render pipelines of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeferredPipelineKind {
    Shadow,
    Geometry,
    Lighting,
}

impl DeferredPipelineKind {
    pub const ALL: [DeferredPipelineKind; 3] = [
        DeferredPipelineKind::Shadow,
        DeferredPipelineKind::Geometry,
        DeferredPipelineKind::Lighting,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DeferredPipelineKind::Shadow => "point_shadow_depth_pipeline",
            DeferredPipelineKind::Geometry => "gbuffer_geometry_pipeline",
            DeferredPipelineKind::Lighting => "deferred_lighting_pipeline",
        }
    }
}

/// Queued render pipelines and the shaders they were built from.
pub struct DeferredPipelines {
    shadow: CachedRenderPipelineId,
    geometry: CachedRenderPipelineId,
    lighting: CachedRenderPipelineId,
    shadow_shader: Handle<Shader>,
    geometry_shader: Handle<Shader>,
    lighting_shader: Handle<Shader>,
    target_format: TextureFormat,
}

impl DeferredPipelines {
    pub fn new(
        pipeline_cache: &PipelineCache,
        asset_server: &AssetServer,
        bindings: &DeferredBindings,
        shadows: &ShadowCubeArray,
        target_format: TextureFormat,
    ) -> Self {
        let shadow_shader: Handle<Shader> = asset_server.load(SHADOW_SHADER);
        let geometry_shader: Handle<Shader> = asset_server.load(GBUFFER_SHADER);
        let lighting_shader: Handle<Shader> = asset_server.load(LIGHTING_SHADER);

        // Depth-only pass writing linear light distance; bias is applied in the shader
        let shadow = pipeline_cache.queue_render_pipeline(RenderPipelineDescriptor {
            label: Some(DeferredPipelineKind::Shadow.name().into()),
            layout: vec![
                shadows.face_layout().clone(),
                bindings.instance_layout.clone(),
            ],
            push_constant_ranges: vec![],
            vertex: VertexState {
                shader: shadow_shader.clone(),
                shader_defs: vec![],
                entry_point: Some("vs_main".into()),
                buffers: vec![DeferredVertex::vertex_buffer_layout()],
            },
            primitive: PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                // Face projections flip Y, which mirrors winding
                front_face: wgpu::FrontFace::Cw,
                cull_mode: Some(wgpu::Face::Front),
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: Some(DepthStencilState {
                format: SHADOW_DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: CompareFunction::LessEqual,
                stencil: StencilState::default(),
                bias: DepthBiasState::default(),
            }),
            multisample: MultisampleState::default(),
            fragment: Some(FragmentState {
                shader: shadow_shader.clone(),
                shader_defs: vec![],
                entry_point: Some("fs_main".into()),
                targets: vec![],
            }),
            zero_initialize_workgroup_memory: false,
        });

        let geometry = pipeline_cache.queue_render_pipeline(RenderPipelineDescriptor {
            label: Some(DeferredPipelineKind::Geometry.name().into()),
            layout: vec![
                bindings.geometry_view_layout.clone(),
                bindings.instance_layout.clone(),
            ],
            push_constant_ranges: vec![],
            vertex: VertexState {
                shader: geometry_shader.clone(),
                shader_defs: vec![],
                entry_point: Some("vertex".into()),
                buffers: vec![DeferredVertex::vertex_buffer_layout()],
            },
            primitive: PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: Some(wgpu::Face::Back),
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: Some(DepthStencilState {
                format: GBUFFER_DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: CompareFunction::GreaterEqual, // Reverse-Z
                stencil: StencilState::default(),
                bias: DepthBiasState::default(),
            }),
            multisample: MultisampleState::default(),
            fragment: Some(FragmentState {
                shader: geometry_shader.clone(),
                shader_defs: vec![],
                entry_point: Some("fragment".into()),
                targets: gbuffer_color_targets(),
            }),
            zero_initialize_workgroup_memory: false,
        });

        let lighting = pipeline_cache.queue_render_pipeline(RenderPipelineDescriptor {
            label: Some(DeferredPipelineKind::Lighting.name().into()),
            layout: vec![bindings.lighting_layout.clone()],
            push_constant_ranges: vec![],
            vertex: VertexState {
                shader: lighting_shader.clone(),
                shader_defs: vec![],
                entry_point: Some("vs_main".into()),
                buffers: vec![],
            },
            primitive: PrimitiveState::default(),
            depth_stencil: None,
            multisample: MultisampleState::default(),
            fragment: Some(FragmentState {
                shader: lighting_shader.clone(),
                shader_defs: lighting_shader_defs(target_format),
                entry_point: Some("fs_main".into()),
                targets: vec![Some(ColorTargetState {
                    format: target_format,
                    blend: None,
                    write_mask: ColorWrites::ALL,
                })],
            }),
            zero_initialize_workgroup_memory: false,
        });

        Self {
            shadow,
            geometry,
            lighting,
            shadow_shader,
            geometry_shader,
            lighting_shader,
            target_format,
        }
    }

    pub fn id(&self, kind: DeferredPipelineKind) -> CachedRenderPipelineId {
        match kind {
            DeferredPipelineKind::Shadow => self.shadow,
            DeferredPipelineKind::Geometry => self.geometry,
            DeferredPipelineKind::Lighting => self.lighting,
        }
    }

    fn shader(&self, kind: DeferredPipelineKind) -> &Handle<Shader> {
        match kind {
            DeferredPipelineKind::Shadow => &self.shadow_shader,
            DeferredPipelineKind::Geometry => &self.geometry_shader,
            DeferredPipelineKind::Lighting => &self.lighting_shader,
        }
    }

    pub fn target_format(&self) -> TextureFormat {
        self.target_format
    }

    /// Compiled pipeline, or `None` while it is still being built.
    pub fn get<'a>(
        &self,
        pipeline_cache: &'a PipelineCache,
        kind: DeferredPipelineKind,
    ) -> Option<&'a RenderPipeline> {
        pipeline_cache.get_render_pipeline(self.id(kind))
    }

    /// Compiled pipeline, or an error naming the missing one.
    pub fn require<'a>(
        &self,
        pipeline_cache: &'a PipelineCache,
        kind: DeferredPipelineKind,
    ) -> DeferredResult<&'a RenderPipeline> {
        self.get(pipeline_cache, kind)
            .ok_or(DeferredError::NotInitialized(kind.name()))
    }

    /// True once all pipelines are compiled. A shader that failed to load or
    /// a pipeline that failed to build is an error.
    pub fn status(&self, pipeline_cache: &PipelineCache, asset_server: &AssetServer) -> DeferredResult<bool> {
        let mut ready = true;
        for kind in DeferredPipelineKind::ALL {
            if let LoadState::Failed(err) = asset_server.load_state(self.shader(kind).id()) {
                return Err(DeferredError::PipelineCreation {
                    pipeline: kind.name(),
                    message: err.to_string(),
                });
            }
            match pipeline_cache.get_render_pipeline_state(self.id(kind)) {
                CachedPipelineState::Ok(_) => {}
                CachedPipelineState::Err(err) => {
                    return Err(DeferredError::PipelineCreation {
                        pipeline: kind.name(),
                        message: err.to_string(),
                    });
                }
                _ => ready = false,
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lighting_layout_bindings() {
        let entries = lighting_layout_entries();
        let bindings: Vec<u32> = entries.iter().map(|e| e.binding).collect();
        assert_eq!(bindings, (0..12).collect::<Vec<_>>());

        assert!(matches!(
            entries[9].ty,
            BindingType::Texture {
                sample_type: TextureSampleType::Depth,
                view_dimension: TextureViewDimension::CubeArray,
                ..
            }
        ));
        // Manual depth compare: no comparison sampler
        assert!(matches!(
            entries[10].ty,
            BindingType::Sampler(SamplerBindingType::NonFiltering)
        ));
    }

    #[test]
    fn test_manual_gamma_only_for_linear_targets() {
        assert!(lighting_shader_defs(TextureFormat::Rgba8UnormSrgb).is_empty());
        assert_eq!(lighting_shader_defs(TextureFormat::Rgba8Unorm).len(), 1);
    }

    #[test]
    fn test_pipeline_names_are_distinct() {
        let names: Vec<_> = DeferredPipelineKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names.len(), 3);
        assert!(names[0] != names[1] && names[1] != names[2] && names[0] != names[2]);
    }
}
