//! GPU mirror of the light store and cluster tables.
//!
//! Every buffer the CPU rewrites each frame is duplicated per frame in flight,
//! so frame N+1 never writes a buffer frame N may still be reading:
//!
//! ```text
//! slot 0: lights | light uniforms | clusters | light indices | geometry view | lighting view
//! slot 1: lights | light uniforms | clusters | light indices | geometry view | lighting view
//! ```
//!
//! The light array is only re-uploaded when the store's revision differs from
//! the one that slot last received.

use std::sync::atomic::{AtomicU64, Ordering};

use bevy::render::{
    render_resource::{Buffer, BufferDescriptor, BufferUsages},
    renderer::{RenderDevice, RenderQueue},
};

use super::cluster::{LightCluster, LightClusterer};
use super::config::DeferredConfig;
use super::error::{allocation_scope, DeferredError, DeferredResult};
use super::gbuffer::GeometryViewUniform;
use super::light::{GpuPointLight, LightStore, LightUniforms};
use super::lighting::LightingViewUniform;

const NEVER_UPLOADED: u64 = u64::MAX;

/// Last light-store revision each frame slot received.
#[derive(Debug)]
pub struct RevisionTracker {
    revisions: Vec<AtomicU64>,
}

impl RevisionTracker {
    pub fn new(slots: usize) -> Self {
        Self {
            revisions: (0..slots).map(|_| AtomicU64::new(NEVER_UPLOADED)).collect(),
        }
    }

    /// Record `revision` for `slot`. Returns true when it differs from the
    /// previous one, meaning an upload is needed.
    pub fn mark(&self, slot: usize, revision: u64) -> bool {
        match self.revisions.get(slot) {
            Some(last) => last.swap(revision, Ordering::AcqRel) != revision,
            None => false,
        }
    }
}

/// The light uniform block as uploaded: the light count is capped at the GPU
/// array size and never fewer lights than shadow casters are reported.
pub fn frame_uniforms(
    store: &LightStore,
    camera_position: bevy::math::Vec3,
    shadow_casters: usize,
    max_lights: usize,
) -> LightUniforms {
    let mut uniforms = store.uniforms(camera_position, shadow_casters);
    uniforms.num_lights = uniforms.num_lights.min(max_lights as u32);
    uniforms.num_shadow_casters = uniforms.num_shadow_casters.min(uniforms.num_lights);
    uniforms
}

/// Buffers owned by one frame in flight.
pub struct FrameSlot {
    pub lights: Buffer,
    pub light_uniforms: Buffer,
    pub clusters: Buffer,
    pub light_indices: Buffer,
    pub geometry_view: Buffer,
    pub lighting_view: Buffer,
}

fn storage_buffer(render_device: &RenderDevice, label: &'static str, size: usize) -> Buffer {
    render_device.create_buffer(&BufferDescriptor {
        label: Some(label),
        size: size.max(16) as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn uniform_buffer(render_device: &RenderDevice, label: &'static str, size: usize) -> Buffer {
    render_device.create_buffer(&BufferDescriptor {
        label: Some(label),
        size: size as u64,
        usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

impl FrameSlot {
    fn new(render_device: &RenderDevice, config: &DeferredConfig) -> Self {
        Self {
            lights: storage_buffer(
                render_device,
                "deferred_lights",
                config.max_lights as usize * std::mem::size_of::<GpuPointLight>(),
            ),
            light_uniforms: uniform_buffer(
                render_device,
                "deferred_light_uniforms",
                std::mem::size_of::<LightUniforms>(),
            ),
            clusters: storage_buffer(
                render_device,
                "deferred_clusters",
                config.cluster.cell_count() * std::mem::size_of::<LightCluster>(),
            ),
            light_indices: storage_buffer(
                render_device,
                "deferred_light_indices",
                config.cluster.index_capacity() * std::mem::size_of::<u32>(),
            ),
            geometry_view: uniform_buffer(
                render_device,
                "deferred_geometry_view",
                std::mem::size_of::<GeometryViewUniform>(),
            ),
            lighting_view: uniform_buffer(
                render_device,
                "deferred_lighting_view",
                std::mem::size_of::<LightingViewUniform>(),
            ),
        }
    }
}

/// Per-frame-in-flight light, cluster, and view buffers.
pub struct LightBuffers {
    slots: Vec<FrameSlot>,
    uploaded: RevisionTracker,
    max_lights: usize,
}

impl LightBuffers {
    pub fn new(render_device: &RenderDevice, config: &DeferredConfig) -> DeferredResult<Self> {
        let frames = config.frames_in_flight as usize;
        let slots = allocation_scope(render_device, "light buffers", || {
            (0..frames)
                .map(|_| FrameSlot::new(render_device, config))
                .collect::<Vec<_>>()
        })?;

        Ok(Self {
            slots,
            uploaded: RevisionTracker::new(frames),
            max_lights: config.max_lights as usize,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> DeferredResult<&FrameSlot> {
        self.slots
            .get(index)
            .ok_or(DeferredError::NotInitialized("frame slot"))
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// Rewrite the light uniform block, and the light array if it changed.
    ///
    /// Returns true when the light array was uploaded.
    pub fn upload_lights(
        &self,
        queue: &RenderQueue,
        slot: usize,
        store: &LightStore,
        camera_position: bevy::math::Vec3,
        shadow_casters: usize,
    ) -> DeferredResult<bool> {
        let frame = self.slot(slot)?;
        let uniforms = frame_uniforms(store, camera_position, shadow_casters, self.max_lights);
        queue.write_buffer(&frame.light_uniforms, 0, bytemuck::bytes_of(&uniforms));

        if !self.uploaded.mark(slot, store.revision()) {
            return Ok(false);
        }

        let lights = store.gpu_lights();
        let count = lights.len().min(self.max_lights);
        if count > 0 {
            queue.write_buffer(&frame.lights, 0, bytemuck::cast_slice(&lights[..count]));
        }
        Ok(true)
    }

    /// Upload the cluster and index tables of the last clustering.
    pub fn upload_clusters(
        &self,
        queue: &RenderQueue,
        slot: usize,
        clusterer: &LightClusterer,
    ) -> DeferredResult<()> {
        let frame = self.slot(slot)?;
        queue.write_buffer(&frame.clusters, 0, bytemuck::cast_slice(clusterer.clusters()));
        if clusterer.total_indices() > 0 {
            queue.write_buffer(
                &frame.light_indices,
                0,
                bytemuck::cast_slice(clusterer.light_indices()),
            );
        }
        Ok(())
    }

    pub fn write_views(
        &self,
        queue: &RenderQueue,
        slot: usize,
        geometry: &GeometryViewUniform,
        lighting: &LightingViewUniform,
    ) -> DeferredResult<()> {
        let frame = self.slot(slot)?;
        queue.write_buffer(&frame.geometry_view, 0, bytemuck::bytes_of(geometry));
        queue.write_buffer(&frame.lighting_view, 0, bytemuck::bytes_of(lighting));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_slot_uploads_each_revision_once() {
        let tracker = RevisionTracker::new(2);
        assert!(tracker.mark(0, 7));
        assert!(!tracker.mark(0, 7));

        // The other slot has its own copy and still needs the data
        assert!(tracker.mark(1, 7));
        assert!(!tracker.mark(1, 7));

        assert!(tracker.mark(0, 8));
        assert!(tracker.mark(1, 8));
    }

    #[test]
    fn test_unknown_slot_never_uploads() {
        let tracker = RevisionTracker::new(1);
        assert!(!tracker.mark(4, 1));
    }

    #[test]
    fn test_frame_uniforms_truncate_to_gpu_array() {
        let mut store = LightStore::with_capacity(16);
        for i in 0..10 {
            store
                .add_light(crate::deferred::PointLight::new(
                    bevy::math::Vec3::new(i as f32, 0.0, 0.0),
                    bevy::math::Vec3::ONE,
                    1.0,
                    5.0,
                ))
                .unwrap();
        }

        let uniforms = frame_uniforms(&store, bevy::math::Vec3::ZERO, 8, 4);
        assert_eq!(uniforms.num_lights, 4);
        assert_eq!(uniforms.num_shadow_casters, 4);

        let uniforms = frame_uniforms(&store, bevy::math::Vec3::ZERO, 8, 256);
        assert_eq!(uniforms.num_lights, 10);
        assert_eq!(uniforms.num_shadow_casters, 8);
    }

    #[test]
    fn test_store_revision_drives_uploads() {
        let tracker = RevisionTracker::new(1);
        let mut store = LightStore::default();
        assert!(tracker.mark(0, store.revision()));
        assert!(!tracker.mark(0, store.revision()));

        store.set_ambient(bevy::math::Vec3::ONE, 0.2);
        assert!(!tracker.mark(0, store.revision()));

        store.add_light(crate::deferred::PointLight::default()).unwrap();
        assert!(tracker.mark(0, store.revision()));
    }
}
