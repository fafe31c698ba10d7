//! G-Buffer render targets.
//!
//! - position (RGBA16F): XYZ = world position, W = 1 where geometry was written
//! - normal (RGBA16F): XYZ = world-space normal
//! - albedo_ao (RGBA8): RGB = albedo, A = ambient occlusion
//! - material (RG8): R = roughness, G = metallic
//! - depth (Depth32F): reverse-Z, cleared to 0.0
//!
//! All five targets share one size and are always recreated together.

use bevy::core_pipeline::tonemapping::Tonemapping;
use bevy::prelude::*;
use bevy::render::{
    extract_component::ExtractComponent,
    render_resource::{
        ColorTargetState, ColorWrites, Extent3d, LoadOp, Operations, RenderPassColorAttachment,
        RenderPassDepthStencilAttachment, StoreOp, Texture, TextureDescriptor, TextureDimension,
        TextureFormat, TextureUsages, TextureView, TextureViewDescriptor,
    },
    renderer::RenderDevice,
};

use super::error::{allocation_scope, DeferredError, DeferredResult};
use super::lighting::FrameCamera;

pub const GBUFFER_POSITION_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
pub const GBUFFER_NORMAL_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
pub const GBUFFER_ALBEDO_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
pub const GBUFFER_MATERIAL_FORMAT: TextureFormat = TextureFormat::Rg8Unorm;
pub const GBUFFER_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// Color target formats in attachment order.
pub const GBUFFER_COLOR_FORMATS: [TextureFormat; 4] = [
    GBUFFER_POSITION_FORMAT,
    GBUFFER_NORMAL_FORMAT,
    GBUFFER_ALBEDO_FORMAT,
    GBUFFER_MATERIAL_FORMAT,
];

/// Clear values in attachment order. Material clears to mid roughness.
pub const GBUFFER_CLEAR_COLORS: [wgpu::Color; 4] = [
    wgpu::Color::TRANSPARENT,
    wgpu::Color::TRANSPARENT,
    wgpu::Color::TRANSPARENT,
    wgpu::Color {
        r: 0.5,
        g: 0.0,
        b: 0.0,
        a: 0.0,
    },
];

/// Reverse-Z: the far plane is 0.
pub const GBUFFER_DEPTH_CLEAR: f32 = 0.0;

/// Marks the camera rendered through the deferred pipeline.
///
/// `near` and `far` bound the cluster grid's depth range. The lighting pass
/// resolves into a single-sample target and tone maps itself, so the camera
/// also gets `Msaa::Off` and `Tonemapping::None` unless they are set explicitly.
#[derive(Component, Clone, Copy, Debug, ExtractComponent)]
#[require(Msaa = Msaa::Off, Tonemapping = Tonemapping::None)]
pub struct DeferredCamera {
    pub near: f32,
    pub far: f32,
}

impl Default for DeferredCamera {
    fn default() -> Self {
        Self {
            near: 0.1,
            far: 100.0,
        }
    }
}

/// Geometry pass view block. Must match `GeometryView` in gbuffer.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GeometryViewUniform {
    pub view_proj: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
}

impl GeometryViewUniform {
    pub fn new(camera: &FrameCamera) -> Self {
        Self {
            view_proj: camera.view_proj().to_cols_array_2d(),
            camera_position: camera.position.extend(1.0).to_array(),
        }
    }
}

/// Color targets for the geometry pipeline.
pub fn gbuffer_color_targets() -> Vec<Option<ColorTargetState>> {
    GBUFFER_COLOR_FORMATS
        .iter()
        .map(|&format| {
            Some(ColorTargetState {
                format,
                blend: None,
                write_mask: ColorWrites::ALL,
            })
        })
        .collect()
}

pub struct GBufferTarget {
    _texture: Texture,
    view: TextureView,
}

impl GBufferTarget {
    fn new(render_device: &RenderDevice, label: &'static str, size: Extent3d, format: TextureFormat) -> Self {
        let texture = render_device.create_texture(&TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&TextureViewDescriptor::default());
        Self {
            _texture: texture,
            view,
        }
    }

    pub fn view(&self) -> &TextureView {
        &self.view
    }
}

/// The G-buffer attachment set.
pub struct GBuffer {
    size: UVec2,
    pub position: GBufferTarget,
    pub normal: GBufferTarget,
    pub albedo_ao: GBufferTarget,
    pub material: GBufferTarget,
    pub depth: GBufferTarget,
}

impl GBuffer {
    pub fn new(render_device: &RenderDevice, size: UVec2) -> DeferredResult<Self> {
        if size.x == 0 || size.y == 0 {
            return Err(DeferredError::InvalidExtent {
                width: size.x,
                height: size.y,
            });
        }

        let extent = Extent3d {
            width: size.x,
            height: size.y,
            depth_or_array_layers: 1,
        };

        allocation_scope(render_device, "gbuffer", || Self {
            size,
            position: GBufferTarget::new(render_device, "gbuffer_position", extent, GBUFFER_POSITION_FORMAT),
            normal: GBufferTarget::new(render_device, "gbuffer_normal", extent, GBUFFER_NORMAL_FORMAT),
            albedo_ao: GBufferTarget::new(render_device, "gbuffer_albedo_ao", extent, GBUFFER_ALBEDO_FORMAT),
            material: GBufferTarget::new(render_device, "gbuffer_material", extent, GBUFFER_MATERIAL_FORMAT),
            depth: GBufferTarget::new(render_device, "gbuffer_depth", extent, GBUFFER_DEPTH_FORMAT),
        })
    }

    /// Replace every target with one of the new size. On failure the old
    /// targets are kept.
    pub fn resize(&mut self, render_device: &RenderDevice, size: UVec2) -> DeferredResult<()> {
        *self = GBuffer::new(render_device, size)?;
        Ok(())
    }

    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn color_attachments(&self) -> [Option<RenderPassColorAttachment<'_>>; 4] {
        let targets = [&self.position, &self.normal, &self.albedo_ao, &self.material];
        std::array::from_fn(|i| {
            Some(RenderPassColorAttachment {
                view: targets[i].view(),
                resolve_target: None,
                ops: Operations {
                    load: LoadOp::Clear(GBUFFER_CLEAR_COLORS[i]),
                    store: StoreOp::Store,
                },
                depth_slice: None,
            })
        })
    }

    pub fn depth_attachment(&self) -> RenderPassDepthStencilAttachment<'_> {
        RenderPassDepthStencilAttachment {
            view: self.depth.view(),
            depth_ops: Some(Operations {
                load: LoadOp::Clear(GBUFFER_DEPTH_CLEAR),
                store: StoreOp::Store,
            }),
            stencil_ops: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_targets_match_formats() {
        let targets = gbuffer_color_targets();
        assert_eq!(targets.len(), 4);
        let formats: Vec<_> = targets.iter().flatten().map(|t| t.format).collect();
        assert_eq!(
            formats,
            vec![
                TextureFormat::Rgba16Float,
                TextureFormat::Rgba16Float,
                TextureFormat::Rgba8Unorm,
                TextureFormat::Rg8Unorm,
            ]
        );
    }

    #[test]
    fn test_clear_values() {
        assert_eq!(GBUFFER_CLEAR_COLORS[3].r, 0.5);
        assert!(GBUFFER_CLEAR_COLORS[..3].iter().all(|c| c.r == 0.0 && c.a == 0.0));
        assert_eq!(GBUFFER_DEPTH_CLEAR, 0.0);
    }

    #[test]
    fn test_default_camera_range() {
        let camera = DeferredCamera::default();
        assert!(camera.near > 0.0 && camera.far > camera.near);
    }

    #[test]
    fn test_camera_requires_single_sample_untonemapped_view() {
        let mut world = World::new();
        let camera = world.spawn(DeferredCamera::default()).id();

        assert_eq!(world.get::<Msaa>(camera), Some(&Msaa::Off));
        assert_eq!(world.get::<Tonemapping>(camera), Some(&Tonemapping::None));
    }

    #[test]
    fn test_explicit_camera_settings_are_kept() {
        let mut world = World::new();
        let camera = world
            .spawn((DeferredCamera::default(), Msaa::Sample4))
            .id();
        assert_eq!(world.get::<Msaa>(camera), Some(&Msaa::Sample4));
    }
}
