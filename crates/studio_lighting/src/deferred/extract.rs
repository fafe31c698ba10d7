//! Extraction systems for deferred rendering.
//!
//! Copies renderables from the main world into [`ExtractedDraws`] and
//! converts any mesh asset the render world has not seen yet into
//! [`MeshData`] for upload during prepare. Mesh asset events evict cached
//! meshes that were edited or dropped.

use bevy::prelude::*;
use bevy::render::{renderer::RenderDevice, Extract};

use super::mesh::{
    DeferredMeshCache, DeferredRenderable, ExtractedDraw, ExtractedDraws, GpuMesh, MeshData,
    PendingMeshUploads,
};

/// Collect every visible `Mesh3d` + [`DeferredRenderable`] for this frame.
pub fn extract_deferred_draws(
    mut extracted: ResMut<ExtractedDraws>,
    renderables: Extract<
        Query<(
            &Mesh3d,
            &DeferredRenderable,
            &GlobalTransform,
            &ViewVisibility,
        )>,
    >,
) {
    extracted.draws.clear();

    for (mesh, renderable, transform, visibility) in renderables.iter() {
        // Skip invisible meshes
        if !visibility.get() {
            continue;
        }
        extracted
            .draws
            .push(ExtractedDraw::new(mesh.0.id(), transform.to_matrix(), renderable));
    }
}

/// Queue conversion of meshes referenced this frame that are not cached yet.
///
/// Modified meshes are evicted first so they convert again here. Assets that
/// are still loading are retried next frame.
pub fn extract_deferred_meshes(
    extracted: Res<ExtractedDraws>,
    mut cache: ResMut<DeferredMeshCache>,
    mut pending: ResMut<PendingMeshUploads>,
    mut events: Extract<MessageReader<AssetEvent<Mesh>>>,
    meshes: Extract<Res<Assets<Mesh>>>,
) {
    for event in events.read() {
        if cache.apply_asset_event(&mut pending, event) {
            debug!("Evicted deferred mesh after {:?}", event);
        }
    }

    for draw in &extracted.draws {
        if cache.contains(draw.mesh) || pending.contains(draw.mesh) {
            continue;
        }
        let Some(mesh) = meshes.get(draw.mesh) else {
            continue;
        };
        pending.meshes.push((draw.mesh, MeshData::from_mesh(mesh)));
    }
}

/// Upload meshes converted during extraction into the render-world cache.
pub fn prepare_deferred_meshes(
    render_device: Res<RenderDevice>,
    mut pending: ResMut<PendingMeshUploads>,
    mut cache: ResMut<DeferredMeshCache>,
) {
    for (id, data) in pending.meshes.drain(..) {
        if data.is_empty() {
            warn_once!(
                "Mesh {:?} has no triangle-list positions and normals; it will not be drawn",
                id
            );
        }
        cache.insert(id, GpuMesh::upload(&render_device, &data));
    }
}
