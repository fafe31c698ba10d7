//! Omnidirectional point light shadows.
//!
//! Each shadow-casting light renders the scene 6 times, one 90° perspective
//! per cube face, into a slice of a single depth cube-map array. The stored
//! value is the linear light-to-surface distance divided by the light radius,
//! and the lighting pass compares against it manually (no comparison sampler).
//!
//! ```text
//! layer = caster_slot * 6 + face      faces: +X, -X, +Y, -Y, +Z, -Z
//! caster_slot i  <->  light at dense index i   (first `max_casters` lights)
//! ```

use bevy::prelude::*;
use bevy::render::{
    render_resource::{
        BindGroup, BindGroupEntry, BindGroupLayout, BindGroupLayoutEntry, BindingType, Buffer,
        BufferBindingType, BufferDescriptor, BufferUsages, Extent3d, FilterMode, LoadOp,
        Operations, RenderPassDepthStencilAttachment, RenderPassDescriptor, RenderPipeline,
        Sampler, SamplerDescriptor, ShaderStages, StoreOp, Texture, TextureDescriptor,
        TextureDimension, TextureFormat, TextureUsages, TextureView, TextureViewDescriptor,
        TextureViewDimension,
    },
    renderer::{RenderContext, RenderDevice, RenderQueue},
};

use super::config::ShadowConfig;
use super::error::{allocation_scope, DeferredResult};
use super::light::PointLight;
use super::mesh::{DrawInstance, GpuMesh};

pub const SHADOW_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// Look direction and up vector of one cube face.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CubeFace {
    pub direction: Vec3,
    pub up: Vec3,
    pub label: &'static str,
}

/// Faces in cube-map layer order.
pub const CUBE_FACES: [CubeFace; 6] = [
    CubeFace {
        direction: Vec3::X,
        up: Vec3::NEG_Y,
        label: "+X",
    },
    CubeFace {
        direction: Vec3::NEG_X,
        up: Vec3::NEG_Y,
        label: "-X",
    },
    CubeFace {
        direction: Vec3::Y,
        up: Vec3::Z,
        label: "+Y",
    },
    CubeFace {
        direction: Vec3::NEG_Y,
        up: Vec3::NEG_Z,
        label: "-Y",
    },
    CubeFace {
        direction: Vec3::Z,
        up: Vec3::NEG_Y,
        label: "+Z",
    },
    CubeFace {
        direction: Vec3::NEG_Z,
        up: Vec3::NEG_Y,
        label: "-Z",
    },
];

/// Array layer of `face` for the light in caster slot `slot`.
pub fn face_layer(slot: usize, face: usize) -> u32 {
    (slot * 6 + face) as u32
}

/// View matrix for one cube face of a light at `position`.
pub fn face_view(position: Vec3, face: usize) -> Mat4 {
    let CubeFace { direction, up, .. } = CUBE_FACES[face % 6];
    Mat4::look_at_rh(position, position + direction, up)
}

/// 90° square projection shared by all faces.
///
/// Y is flipped: wgpu rasterizes with a top-left origin while cube-map faces
/// are addressed with +Y pointing down the face, so without the flip every
/// face would be sampled upside down. The flip mirrors triangle winding, which
/// the shadow pipeline accounts for with clockwise front faces.
pub fn face_projection(near: f32, far: f32) -> Mat4 {
    Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0))
        * Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, near, far)
}

/// View-projection matrices for all 6 faces.
#[derive(Clone, Copy, Debug)]
pub struct CubeFaceMatrices {
    pub view: [Mat4; 6],
    pub view_proj: [Mat4; 6],
}

impl CubeFaceMatrices {
    pub fn new(light_pos: Vec3, near: f32, far: f32) -> Self {
        let projection = face_projection(near, far);
        let view = std::array::from_fn(|face| face_view(light_pos, face));
        let view_proj = std::array::from_fn(|face| projection * view[face]);
        Self { view, view_proj }
    }
}

/// Per-face uniform. Must match `ShadowFace` in point_shadow_depth.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ShadowFaceUniform {
    pub view_proj: [[f32; 4]; 4],
    /// Light position (xyz) and far plane (w). The far plane is the light radius.
    pub light_pos_far: [f32; 4],
    /// x = constant bias, y = slope-scaled bias.
    pub bias: [f32; 4],
}

/// Far plane used for a light's faces; never closer than the near plane.
pub fn shadow_far_plane(light: &PointLight, config: &ShadowConfig) -> f32 {
    light.radius.max(config.near_plane * 2.0)
}

/// Uniforms for all 6 faces of one light.
pub fn face_uniforms(light: &PointLight, config: &ShadowConfig) -> [ShadowFaceUniform; 6] {
    let far = shadow_far_plane(light, config);
    let matrices = CubeFaceMatrices::new(light.position, config.near_plane, far);
    std::array::from_fn(|face| ShadowFaceUniform {
        view_proj: matrices.view_proj[face].to_cols_array_2d(),
        light_pos_far: light.position.extend(far).to_array(),
        bias: [config.depth_bias_constant, config.depth_bias_slope, 0.0, 0.0],
    })
}

/// Depth cube-map array plus the per-face resources used to render into it.
pub struct ShadowCubeArray {
    config: ShadowConfig,
    _texture: Texture,
    face_views: Vec<TextureView>,
    cube_view: TextureView,
    sampler: Sampler,
    face_layout: BindGroupLayout,
    face_buffers: Vec<Buffer>,
    face_bind_groups: Vec<BindGroup>,
}

impl ShadowCubeArray {
    pub fn new(render_device: &RenderDevice, config: &ShadowConfig) -> DeferredResult<Self> {
        let capacity = config.max_casters as usize;
        let layers = (capacity * 6) as u32;

        let face_layout = render_device.create_bind_group_layout(
            "point_shadow_face_layout",
            &[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::VERTEX | ShaderStages::FRAGMENT,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        );

        let texture = allocation_scope(render_device, "shadow cube array", || {
            render_device.create_texture(&TextureDescriptor {
                label: Some("point_shadow_cube_array"),
                size: Extent3d {
                    width: config.resolution,
                    height: config.resolution,
                    depth_or_array_layers: layers,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: TextureDimension::D2,
                format: SHADOW_DEPTH_FORMAT,
                usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
        })?;

        let face_views = (0..layers)
            .map(|layer| {
                texture.create_view(&TextureViewDescriptor {
                    label: Some("point_shadow_face_view"),
                    dimension: Some(TextureViewDimension::D2),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..default()
                })
            })
            .collect();

        let cube_view = texture.create_view(&TextureViewDescriptor {
            label: Some("point_shadow_cube_array_view"),
            dimension: Some(TextureViewDimension::CubeArray),
            base_array_layer: 0,
            array_layer_count: Some(layers),
            ..default()
        });

        let sampler = render_device.create_sampler(&SamplerDescriptor {
            label: Some("point_shadow_sampler"),
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            ..default()
        });

        let face_buffers: Vec<Buffer> = allocation_scope(render_device, "shadow face uniforms", || {
            (0..layers)
                .map(|_| {
                    render_device.create_buffer(&BufferDescriptor {
                        label: Some("point_shadow_face_uniform"),
                        size: std::mem::size_of::<ShadowFaceUniform>() as u64,
                        usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
                        mapped_at_creation: false,
                    })
                })
                .collect()
        })?;

        let face_bind_groups = face_buffers
            .iter()
            .map(|buffer| {
                render_device.create_bind_group(
                    Some("point_shadow_face_bind_group"),
                    &face_layout,
                    &[BindGroupEntry {
                        binding: 0,
                        resource: buffer.as_entire_binding(),
                    }],
                )
            })
            .collect();

        Ok(Self {
            config: *config,
            _texture: texture,
            face_views,
            cube_view,
            sampler,
            face_layout,
            face_buffers,
            face_bind_groups,
        })
    }

    /// Number of caster slots.
    pub fn capacity(&self) -> usize {
        self.config.max_casters as usize
    }

    pub fn cube_view(&self) -> &TextureView {
        &self.cube_view
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn face_layout(&self) -> &BindGroupLayout {
        &self.face_layout
    }

    /// Write face uniforms for the leading lights. Returns the caster count.
    pub fn write_faces(&self, queue: &RenderQueue, lights: &[PointLight]) -> usize {
        let casters = lights.len().min(self.capacity());
        for (slot, light) in lights.iter().take(casters).enumerate() {
            for (face, uniform) in face_uniforms(light, &self.config).iter().enumerate() {
                let layer = face_layer(slot, face) as usize;
                queue.write_buffer(&self.face_buffers[layer], 0, bytemuck::bytes_of(uniform));
            }
        }
        casters
    }

    /// One depth-only pass per caster face, drawing every mesh.
    ///
    /// `meshes` and `instances` are parallel slices.
    pub fn render(
        &self,
        render_context: &mut RenderContext,
        pipeline: &RenderPipeline,
        casters: usize,
        meshes: &[&GpuMesh],
        instances: &[DrawInstance],
    ) {
        let resolution = self.config.resolution as f32;
        let layers = casters.min(self.capacity()) * 6;

        for layer in 0..layers {
            let mut render_pass = render_context.begin_tracked_render_pass(RenderPassDescriptor {
                label: Some("point_shadow_pass"),
                color_attachments: &[],
                depth_stencil_attachment: Some(RenderPassDepthStencilAttachment {
                    view: &self.face_views[layer],
                    depth_ops: Some(Operations {
                        load: LoadOp::Clear(1.0),
                        store: StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            render_pass.set_viewport(0.0, 0.0, resolution, resolution, 0.0, 1.0);
            render_pass.set_render_pipeline(pipeline);
            render_pass.set_bind_group(0, &self.face_bind_groups[layer], &[]);

            for (mesh, instance) in meshes.iter().zip(instances) {
                render_pass.set_bind_group(1, instance.bind_group(), &[]);
                mesh.draw(&mut render_pass);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plus_x_face_looks_down_forward_axis() {
        let view = face_view(Vec3::ZERO, 0);
        let p = view.transform_point3(Vec3::X);
        // Right-handed view space looks down -Z
        assert!(p.z < 0.0);
        assert!((p - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-6);
    }

    #[test]
    fn test_face_up_vectors() {
        assert_eq!(CUBE_FACES[2].up, Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(CUBE_FACES[3].up, Vec3::new(0.0, 0.0, -1.0));
        for face in [0, 1, 4, 5] {
            assert_eq!(CUBE_FACES[face].up, Vec3::new(0.0, -1.0, 0.0));
        }
    }

    #[test]
    fn test_every_face_centers_its_direction() {
        let light = Vec3::new(3.0, 4.0, -2.0);
        let matrices = CubeFaceMatrices::new(light, 0.1, 10.0);
        for (face, cube_face) in CUBE_FACES.iter().enumerate() {
            let clip = matrices.view_proj[face] * (light + cube_face.direction * 5.0).extend(1.0);
            let ndc = clip.truncate() / clip.w;
            assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5, "face {}", cube_face.label);
            assert!(ndc.z > 0.0 && ndc.z < 1.0);

            // Points behind the face are clipped
            let behind = matrices.view_proj[face] * (light - cube_face.direction).extend(1.0);
            assert!(behind.w < 0.0);
        }
    }

    #[test]
    fn test_projection_flips_y() {
        let projection = face_projection(0.1, 10.0);
        let clip = projection * Vec4::new(0.0, 1.0, -2.0, 1.0);
        assert!(clip.y / clip.w < 0.0);

        let near = projection * Vec4::new(0.0, 0.0, -0.1, 1.0);
        let far = projection * Vec4::new(0.0, 0.0, -10.0, 1.0);
        assert!((near.z / near.w).abs() < 1e-5);
        assert!((far.z / far.w - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_face_uniforms_carry_radius_and_bias() {
        let light = PointLight::new(Vec3::new(0.0, 5.0, 0.0), Vec3::ONE, 1.0, 10.0);
        let config = ShadowConfig::default();
        let uniforms = face_uniforms(&light, &config);
        for uniform in &uniforms {
            assert_eq!(uniform.light_pos_far, [0.0, 5.0, 0.0, 10.0]);
            assert_eq!(uniform.bias[0], 1.25);
            assert_eq!(uniform.bias[1], 1.75);
        }

        let tiny = PointLight::new(Vec3::ZERO, Vec3::ONE, 1.0, 0.0);
        assert!(shadow_far_plane(&tiny, &config) > config.near_plane);
    }

    #[test]
    fn test_face_layers() {
        assert_eq!(face_layer(0, 0), 0);
        assert_eq!(face_layer(0, 5), 5);
        assert_eq!(face_layer(7, 5), 47);
        assert_eq!(std::mem::size_of::<ShadowFaceUniform>(), 96);
    }
}
