//! Mesh boundary for the deferred passes.
//!
//! Bevy `Mesh` assets are converted into a fixed vertex layout
//! ([`DeferredVertex`]: position, normal, color) with u32 indices and uploaded
//! once into [`DeferredMeshCache`]. The geometry and shadow passes only ever see
//! [`GpuMesh`] and the per-frame [`DrawInstance`]s built from
//! [`DeferredRenderable`] entities.

use std::collections::HashMap;

use bevy::mesh::{Indices, PrimitiveTopology, VertexAttributeValues};
use bevy::prelude::*;
use bevy::render::{
    render_phase::TrackedRenderPass,
    render_resource::{
        BindGroup, BindGroupEntry, BindGroupLayout, Buffer, BufferInitDescriptor, BufferUsages,
        IndexFormat,
    },
    renderer::RenderDevice,
};
use bevy_mesh::{VertexBufferLayout, VertexFormat};
use bytemuck::{Pod, Zeroable};

/// Vertex format shared by the geometry and shadow pipelines.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct DeferredVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 4],
}

impl DeferredVertex {
    pub fn vertex_buffer_layout() -> VertexBufferLayout {
        VertexBufferLayout::from_vertex_formats(
            wgpu::VertexStepMode::Vertex,
            [
                VertexFormat::Float32x3, // Position
                VertexFormat::Float32x3, // Normal
                VertexFormat::Float32x4, // Color
            ],
        )
    }
}

/// CPU-side mesh in the deferred vertex layout.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<DeferredVertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Convert a Bevy mesh. Anything that is not an indexed or plain triangle
    /// list with positions and normals comes back empty.
    pub fn from_mesh(mesh: &Mesh) -> Self {
        if mesh.primitive_topology() != PrimitiveTopology::TriangleList {
            return Self::default();
        }

        let Some(VertexAttributeValues::Float32x3(positions)) =
            mesh.attribute(Mesh::ATTRIBUTE_POSITION)
        else {
            return Self::default();
        };
        let Some(VertexAttributeValues::Float32x3(normals)) = mesh.attribute(Mesh::ATTRIBUTE_NORMAL)
        else {
            return Self::default();
        };
        let colors = match mesh.attribute(Mesh::ATTRIBUTE_COLOR) {
            Some(VertexAttributeValues::Float32x4(colors)) => Some(colors),
            _ => None,
        };

        let vertices = positions
            .iter()
            .zip(normals)
            .enumerate()
            .map(|(i, (position, normal))| DeferredVertex {
                position: *position,
                normal: *normal,
                color: colors
                    .and_then(|colors| colors.get(i).copied())
                    .unwrap_or([1.0; 4]),
            })
            .collect::<Vec<_>>();

        let indices = match mesh.indices() {
            Some(Indices::U32(indices)) => indices.clone(),
            Some(Indices::U16(indices)) => indices.iter().map(|&i| i as u32).collect(),
            None => (0..vertices.len() as u32).collect(),
        };

        if indices.iter().any(|&i| i as usize >= vertices.len()) {
            return Self::default();
        }

        Self { vertices, indices }
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }
}

/// Uploaded mesh. Empty meshes keep no buffers and are skipped at draw time.
#[derive(Debug, Default)]
pub struct GpuMesh {
    vertex_buffer: Option<Buffer>,
    index_buffer: Option<Buffer>,
    index_count: u32,
}

impl GpuMesh {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn upload(render_device: &RenderDevice, data: &MeshData) -> Self {
        if data.is_empty() {
            return Self::empty();
        }

        let vertex_buffer = render_device.create_buffer_with_data(&BufferInitDescriptor {
            label: Some("deferred_mesh_vertices"),
            contents: bytemuck::cast_slice(&data.vertices),
            usage: BufferUsages::VERTEX,
        });
        let index_buffer = render_device.create_buffer_with_data(&BufferInitDescriptor {
            label: Some("deferred_mesh_indices"),
            contents: bytemuck::cast_slice(&data.indices),
            usage: BufferUsages::INDEX,
        });

        Self {
            vertex_buffer: Some(vertex_buffer),
            index_buffer: Some(index_buffer),
            index_count: data.indices.len() as u32,
        }
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn is_drawable(&self) -> bool {
        self.index_count > 0 && self.vertex_buffer.is_some() && self.index_buffer.is_some()
    }

    /// Bind and draw. Returns false, drawing nothing, for an empty mesh.
    pub fn draw<'a>(&'a self, pass: &mut TrackedRenderPass<'a>) -> bool {
        let (Some(vertices), Some(indices)) = (&self.vertex_buffer, &self.index_buffer) else {
            return false;
        };
        if self.index_count == 0 {
            return false;
        }
        pass.set_vertex_buffer(0, vertices.slice(..));
        pass.set_index_buffer(indices.slice(..), 0, IndexFormat::Uint32);
        pass.draw_indexed(0..self.index_count, 0, 0..1);
        true
    }
}

/// Render-world cache of uploaded meshes.
#[derive(Resource, Default)]
pub struct DeferredMeshCache {
    meshes: HashMap<AssetId<Mesh>, GpuMesh>,
}

impl DeferredMeshCache {
    pub fn get(&self, id: AssetId<Mesh>) -> Option<&GpuMesh> {
        self.meshes.get(&id)
    }

    pub fn contains(&self, id: AssetId<Mesh>) -> bool {
        self.meshes.contains_key(&id)
    }

    pub fn insert(&mut self, id: AssetId<Mesh>, mesh: GpuMesh) {
        self.meshes.insert(id, mesh);
    }

    pub fn remove(&mut self, id: AssetId<Mesh>) -> Option<GpuMesh> {
        self.meshes.remove(&id)
    }

    /// Forget a mesh asset that was modified, removed, or is no longer used,
    /// along with any upload still pending for it. A modified mesh is
    /// converted again the next time a draw references it.
    ///
    /// Returns true if anything was dropped.
    pub fn apply_asset_event(
        &mut self,
        pending: &mut PendingMeshUploads,
        event: &AssetEvent<Mesh>,
    ) -> bool {
        let id = match *event {
            AssetEvent::Modified { id } | AssetEvent::Removed { id } | AssetEvent::Unused { id } => id,
            AssetEvent::Added { .. } | AssetEvent::LoadedWithDependencies { .. } => return false,
        };
        let cached = self.remove(id).is_some();
        cached | pending.discard(id)
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

/// Meshes converted during extraction, waiting for upload in prepare.
#[derive(Resource, Default)]
pub struct PendingMeshUploads {
    pub meshes: Vec<(AssetId<Mesh>, MeshData)>,
}

impl PendingMeshUploads {
    pub fn contains(&self, id: AssetId<Mesh>) -> bool {
        self.meshes.iter().any(|(pending, _)| *pending == id)
    }

    /// Drop a queued upload. Returns true if one was queued.
    pub fn discard(&mut self, id: AssetId<Mesh>) -> bool {
        let before = self.meshes.len();
        self.meshes.retain(|(pending, _)| *pending != id);
        self.meshes.len() != before
    }
}

/// Marks a `Mesh3d` entity for the deferred geometry and shadow passes.
///
/// ```rust,ignore
/// commands.spawn((
///     Mesh3d(meshes.add(Cuboid::new(1.0, 1.0, 1.0))),
///     DeferredRenderable { albedo: Color::srgb(0.8, 0.2, 0.2), ..default() },
///     Transform::from_xyz(0.0, 0.5, 0.0),
/// ));
/// ```
#[derive(Component, Clone, Debug)]
pub struct DeferredRenderable {
    pub albedo: Color,
    pub roughness: f32,
    pub metallic: f32,
    pub ambient_occlusion: f32,
}

impl Default for DeferredRenderable {
    fn default() -> Self {
        Self {
            albedo: Color::WHITE,
            roughness: 0.5,
            metallic: 0.0,
            ambient_occlusion: 1.0,
        }
    }
}

/// One renderable as seen by the render world this frame.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedDraw {
    pub mesh: AssetId<Mesh>,
    pub model: Mat4,
    /// Linear RGBA.
    pub albedo: Vec4,
    pub roughness: f32,
    pub metallic: f32,
    pub ambient_occlusion: f32,
}

impl ExtractedDraw {
    pub fn new(mesh: AssetId<Mesh>, model: Mat4, renderable: &DeferredRenderable) -> Self {
        let albedo = renderable.albedo.to_linear();
        Self {
            mesh,
            model,
            albedo: Vec4::new(albedo.red, albedo.green, albedo.blue, albedo.alpha),
            roughness: renderable.roughness,
            metallic: renderable.metallic,
            ambient_occlusion: renderable.ambient_occlusion,
        }
    }
}

#[derive(Resource, Default)]
pub struct ExtractedDraws {
    pub draws: Vec<ExtractedDraw>,
}

/// Per-draw uniform, bound at group 1 by both the geometry and shadow pipelines.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct DrawInstanceUniform {
    pub model: [[f32; 4]; 4],
    pub normal_matrix: [[f32; 4]; 4],
    pub albedo: [f32; 4],
    /// x = roughness, y = metallic, z = ambient occlusion.
    pub material: [f32; 4],
}

impl DrawInstanceUniform {
    pub fn from_draw(draw: &ExtractedDraw) -> Self {
        Self {
            model: draw.model.to_cols_array_2d(),
            normal_matrix: normal_matrix(draw.model).to_cols_array_2d(),
            albedo: draw.albedo.to_array(),
            material: [
                draw.roughness.clamp(0.0, 1.0),
                draw.metallic.clamp(0.0, 1.0),
                draw.ambient_occlusion.clamp(0.0, 1.0),
                0.0,
            ],
        }
    }
}

/// Inverse transpose of the model matrix, identity for degenerate transforms.
pub fn normal_matrix(model: Mat4) -> Mat4 {
    if model.determinant().abs() <= f32::EPSILON {
        return Mat4::IDENTITY;
    }
    model.inverse().transpose()
}

/// A draw ready for the geometry and shadow passes.
pub struct DrawInstance {
    pub mesh: AssetId<Mesh>,
    pub model: Mat4,
    bind_group: BindGroup,
    _buffer: Buffer,
}

impl DrawInstance {
    pub fn new(render_device: &RenderDevice, layout: &BindGroupLayout, draw: &ExtractedDraw) -> Self {
        let uniform = DrawInstanceUniform::from_draw(draw);
        let buffer = render_device.create_buffer_with_data(&BufferInitDescriptor {
            label: Some("deferred_draw_instance_uniform"),
            contents: bytemuck::bytes_of(&uniform),
            usage: BufferUsages::UNIFORM,
        });
        let bind_group = render_device.create_bind_group(
            Some("deferred_draw_instance_bind_group"),
            layout,
            &[BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        );

        Self {
            mesh: draw.mesh,
            model: draw.model,
            bind_group,
            _buffer: buffer,
        }
    }

    pub fn bind_group(&self) -> &BindGroup {
        &self.bind_group
    }
}

/// Draw instances rebuilt every frame.
#[derive(Default)]
pub struct DrawScratch {
    pub instances: Vec<DrawInstance>,
}

impl DrawScratch {
    /// Rebuild from this frame's draws, dropping draws whose mesh is not uploaded yet.
    pub fn rebuild(
        &mut self,
        render_device: &RenderDevice,
        layout: &BindGroupLayout,
        draws: &[ExtractedDraw],
        meshes: &DeferredMeshCache,
    ) {
        self.instances.clear();
        self.instances.extend(
            draws
                .iter()
                .filter(|draw| meshes.contains(draw.mesh))
                .map(|draw| DrawInstance::new(render_device, layout, draw)),
        );
    }

    /// Meshes matching `instances` one to one.
    pub fn meshes<'a>(&self, cache: &'a DeferredMeshCache) -> Vec<&'a GpuMesh> {
        self.instances
            .iter()
            .filter_map(|instance| cache.get(instance.mesh))
            .collect()
    }
}
