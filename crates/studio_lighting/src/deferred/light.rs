//! Point lights and the light store.
//!
//! The [`LightStore`] is the single CPU-side owner of point light data. It keeps
//! lights in a dense array (the order the GPU sees) and hands out generation
//! checked [`LightHandle`]s, so a handle stays valid when other lights are removed
//! and is rejected once its own light is gone.
//!
//! ```text
//!  slots:   [ gen 3 -> dense 0 ][ gen 1 -> free ][ gen 0 -> dense 1 ]
//!  dense:   [ light A          ][ light B        ]
//!  owners:  [ slot 0           ][ slot 2         ]
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! // Direct store access
//! let handle = store.add_light(PointLight::new(Vec3::new(0.0, 5.0, 0.0), Vec3::ONE, 1.0, 10.0))?;
//! store.set_light_intensity(handle, 4.0)?;
//!
//! // Or as a component, kept in sync by `sync_point_lights`
//! commands.spawn((DeferredPointLight::default(), Transform::from_xyz(0.0, 5.0, 0.0)));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bevy::prelude::*;
use bevy::render::extract_resource::ExtractResource;

use super::error::{DeferredError, DeferredResult};

/// Default light store capacity; must match the GPU light array size.
pub const MAX_POINT_LIGHTS: usize = 256;

/// Revisions are process-wide so two different stores never share one.
static NEXT_REVISION: AtomicU64 = AtomicU64::new(1);

fn next_revision() -> u64 {
    NEXT_REVISION.fetch_add(1, Ordering::Relaxed)
}

/// A point light with a hard attenuation cutoff at `radius`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    /// Distance at which the light's contribution reaches exactly zero.
    pub radius: f32,
    /// Linear RGB.
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            radius: 10.0,
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }
}

impl PointLight {
    pub fn new(position: Vec3, color: Vec3, intensity: f32, radius: f32) -> Self {
        Self {
            position,
            radius,
            color,
            intensity,
        }
    }

    pub fn to_gpu(&self) -> GpuPointLight {
        GpuPointLight {
            position: self.position.to_array(),
            radius: self.radius,
            color: self.color.to_array(),
            intensity: self.intensity,
        }
    }
}

/// Scene-wide ambient light.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AmbientTerm {
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for AmbientTerm {
    fn default() -> Self {
        Self {
            color: Vec3::splat(0.03),
            intensity: 1.0,
        }
    }
}

impl AmbientTerm {
    /// Premultiplied color as uploaded to the shader.
    pub fn radiance(&self) -> Vec3 {
        self.color * self.intensity
    }
}

/// Stable reference to a light in a [`LightStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LightHandle {
    slot: u32,
    generation: u32,
}

impl LightHandle {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    generation: u32,
    dense: Option<u32>,
}

/// CPU-side point light list plus the ambient term.
///
/// Lives in the main world and is extracted to the render world whenever it
/// changes. Every change to the light array bumps [`LightStore::revision`],
/// which the GPU mirror uses to skip re-uploading an unchanged array. The
/// ambient term only feeds the uniform block and leaves the revision alone.
#[derive(Resource, Clone, Debug, ExtractResource)]
pub struct LightStore {
    capacity: usize,
    lights: Vec<PointLight>,
    owners: Vec<u32>,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    ambient: AmbientTerm,
    revision: u64,
}

impl Default for LightStore {
    fn default() -> Self {
        Self::with_capacity(MAX_POINT_LIGHTS)
    }
}

impl LightStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            lights: Vec::with_capacity(capacity),
            owners: Vec::with_capacity(capacity),
            slots: Vec::new(),
            free_slots: Vec::new(),
            ambient: AmbientTerm::default(),
            revision: next_revision(),
        }
    }

    /// Append a light. Fails without touching the store when it is full.
    pub fn add_light(&mut self, light: PointLight) -> DeferredResult<LightHandle> {
        if self.lights.len() >= self.capacity {
            warn!(
                "Light store full ({} lights), rejecting light at {:?}",
                self.capacity, light.position
            );
            return Err(DeferredError::CapacityExhausted {
                capacity: self.capacity,
            });
        }

        let dense = self.lights.len() as u32;
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot as usize].dense = Some(dense);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    dense: Some(dense),
                });
                (self.slots.len() - 1) as u32
            }
        };

        self.lights.push(light);
        self.owners.push(slot);
        self.touch();

        Ok(LightHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        })
    }

    /// Remove a light, keeping the relative order of the remaining lights.
    pub fn remove_light(&mut self, handle: LightHandle) -> DeferredResult<PointLight> {
        let dense = self.resolve(handle, "remove_light")?;

        let light = self.lights.remove(dense);
        self.owners.remove(dense);
        for &owner in &self.owners[dense..] {
            if let Some(index) = self.slots[owner as usize].dense.as_mut() {
                *index -= 1;
            }
        }

        let slot = &mut self.slots[handle.slot as usize];
        slot.dense = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(handle.slot);
        self.touch();

        Ok(light)
    }

    pub fn set_light_position(&mut self, handle: LightHandle, position: Vec3) -> DeferredResult<()> {
        let dense = self.resolve(handle, "set_light_position")?;
        self.lights[dense].position = position;
        self.touch();
        Ok(())
    }

    pub fn set_light_color(&mut self, handle: LightHandle, color: Vec3) -> DeferredResult<()> {
        let dense = self.resolve(handle, "set_light_color")?;
        self.lights[dense].color = color;
        self.touch();
        Ok(())
    }

    pub fn set_light_intensity(&mut self, handle: LightHandle, intensity: f32) -> DeferredResult<()> {
        let dense = self.resolve(handle, "set_light_intensity")?;
        self.lights[dense].intensity = intensity;
        self.touch();
        Ok(())
    }

    pub fn set_light_radius(&mut self, handle: LightHandle, radius: f32) -> DeferredResult<()> {
        let dense = self.resolve(handle, "set_light_radius")?;
        self.lights[dense].radius = radius;
        self.touch();
        Ok(())
    }

    /// Replace every field of a light at once.
    pub fn update_light(&mut self, handle: LightHandle, light: PointLight) -> DeferredResult<()> {
        let dense = self.resolve(handle, "update_light")?;
        if self.lights[dense] != light {
            self.lights[dense] = light;
            self.touch();
        }
        Ok(())
    }

    /// Does not bump the revision; the uniform block is rewritten every frame.
    pub fn set_ambient(&mut self, color: Vec3, intensity: f32) {
        self.ambient = AmbientTerm { color, intensity };
    }

    /// Remove every light. Outstanding handles become invalid.
    pub fn clear_lights(&mut self) {
        for &owner in &self.owners {
            let slot = &mut self.slots[owner as usize];
            slot.dense = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free_slots.push(owner);
        }
        self.lights.clear();
        self.owners.clear();
        self.touch();
    }

    pub fn get(&self, handle: LightHandle) -> Option<&PointLight> {
        self.dense_index(handle).map(|dense| &self.lights[dense])
    }

    pub fn contains(&self, handle: LightHandle) -> bool {
        self.dense_index(handle).is_some()
    }

    /// Position of the light in the dense (GPU) array.
    pub fn dense_index(&self, handle: LightHandle) -> Option<usize> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.dense.map(|dense| dense as usize)
    }

    /// Handles in dense order.
    pub fn handles(&self) -> impl Iterator<Item = LightHandle> + '_ {
        self.owners.iter().map(|&slot| LightHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        })
    }

    pub fn lights(&self) -> &[PointLight] {
        &self.lights
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ambient(&self) -> AmbientTerm {
        self.ambient
    }

    /// Changes whenever the light array changes.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Uniform block for the lighting pass.
    pub fn uniforms(&self, camera_position: Vec3, shadow_casters: usize) -> LightUniforms {
        let ambient = self.ambient.radiance();
        LightUniforms {
            camera_position: camera_position.extend(1.0).to_array(),
            ambient_color: [ambient.x, ambient.y, ambient.z, self.ambient.intensity],
            num_lights: self.lights.len() as u32,
            num_shadow_casters: shadow_casters.min(self.lights.len()) as u32,
            _padding: [0; 2],
        }
    }

    /// GPU copy of the dense light array.
    pub fn gpu_lights(&self) -> Vec<GpuPointLight> {
        self.lights.iter().map(PointLight::to_gpu).collect()
    }

    fn resolve(&self, handle: LightHandle, operation: &'static str) -> DeferredResult<usize> {
        match self.dense_index(handle) {
            Some(dense) => Ok(dense),
            None => {
                warn!("{}: ignoring stale or unknown light handle {:?}", operation, handle);
                Err(DeferredError::InvalidLight(handle))
            }
        }
    }

    fn touch(&mut self) {
        self.revision = next_revision();
    }
}

/// GPU-side point light. Must match `PointLight` in deferred_lighting.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuPointLight {
    pub position: [f32; 3],
    pub radius: f32,
    pub color: [f32; 3],
    pub intensity: f32,
}

/// Per-frame light uniform block. Must match `LightUniforms` in deferred_lighting.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightUniforms {
    /// Camera world position (xyz), w = 1.
    pub camera_position: [f32; 4],
    /// Ambient color premultiplied by intensity (xyz), w = intensity.
    pub ambient_color: [f32; 4],
    pub num_lights: u32,
    /// Lights `0..num_shadow_casters` have a cube map in the shadow array.
    pub num_shadow_casters: u32,
    pub _padding: [u32; 2],
}

/// Point light component, mirrored into the [`LightStore`] by [`sync_point_lights`].
///
/// The light position comes from the entity's `GlobalTransform`.
#[derive(Component, Clone, Debug)]
pub struct DeferredPointLight {
    pub color: Color,
    pub intensity: f32,
    pub radius: f32,
}

impl Default for DeferredPointLight {
    fn default() -> Self {
        Self {
            color: Color::WHITE,
            intensity: 1.0,
            radius: 10.0,
        }
    }
}

impl DeferredPointLight {
    pub fn new(color: Color, intensity: f32, radius: f32) -> Self {
        Self {
            color,
            intensity,
            radius,
        }
    }

    pub fn to_point_light(&self, position: Vec3) -> PointLight {
        let linear = self.color.to_linear();
        PointLight {
            position,
            radius: self.radius,
            color: Vec3::new(linear.red, linear.green, linear.blue),
            intensity: self.intensity,
        }
    }
}

/// Keep the [`LightStore`] in step with `DeferredPointLight` components.
///
/// Spawned lights are appended, changed lights are rewritten in place, and
/// despawned lights are removed.
pub fn sync_point_lights(
    mut store: ResMut<LightStore>,
    mut registered: Local<HashMap<Entity, LightHandle>>,
    lights: Query<(Entity, Ref<DeferredPointLight>, Ref<GlobalTransform>)>,
    mut removed: RemovedComponents<DeferredPointLight>,
) {
    for entity in removed.read() {
        if let Some(handle) = registered.remove(&entity) {
            if store.contains(handle) {
                let _ = store.remove_light(handle);
            }
        }
    }

    for (entity, light, transform) in &lights {
        let point_light = light.to_point_light(transform.translation());

        if let Some(&handle) = registered.get(&entity) {
            if store.contains(handle) {
                if light.is_changed() || transform.is_changed() {
                    let _ = store.update_light(handle, point_light);
                }
                continue;
            }
            // Store was cleared or replaced underneath us; register again.
            registered.remove(&entity);
        }

        match store.add_light(point_light) {
            Ok(handle) => {
                registered.insert(entity, handle);
            }
            Err(err) => {
                warn_once!("DeferredPointLight on {:?} not registered: {}", entity, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light_at(x: f32) -> PointLight {
        PointLight::new(Vec3::new(x, 0.0, 0.0), Vec3::ONE, 1.0, 5.0)
    }

    #[test]
    fn test_add_until_full() {
        let mut store = LightStore::with_capacity(4);
        for i in 0..4 {
            let handle = store.add_light(light_at(i as f32)).unwrap();
            assert_eq!(store.dense_index(handle), Some(i));
        }

        let revision = store.revision();
        let err = store.add_light(light_at(99.0)).unwrap_err();
        assert_eq!(err, DeferredError::CapacityExhausted { capacity: 4 });
        assert_eq!(store.len(), 4);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn test_remove_preserves_order_and_handles() {
        let mut store = LightStore::default();
        let a = store.add_light(light_at(0.0)).unwrap();
        let b = store.add_light(light_at(1.0)).unwrap();
        let c = store.add_light(light_at(2.0)).unwrap();

        let removed = store.remove_light(a).unwrap();
        assert_eq!(removed.position.x, 0.0);

        assert_eq!(store.dense_index(b), Some(0));
        assert_eq!(store.dense_index(c), Some(1));
        assert_eq!(store.get(c).unwrap().position.x, 2.0);
        assert_eq!(
            store.lights().iter().map(|l| l.position.x).collect::<Vec<_>>(),
            vec![1.0, 2.0]
        );
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut store = LightStore::default();
        let a = store.add_light(light_at(0.0)).unwrap();
        store.remove_light(a).unwrap();

        // Slot gets reused with a new generation
        let b = store.add_light(light_at(1.0)).unwrap();
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a.generation(), b.generation());

        let before = store.clone();
        assert_eq!(
            store.set_light_intensity(a, 7.0),
            Err(DeferredError::InvalidLight(a))
        );
        assert!(store.remove_light(a).is_err());
        assert_eq!(store.lights(), before.lights());
        assert_eq!(store.get(b).unwrap().intensity, 1.0);
    }

    #[test]
    fn test_stale_handle_leaves_revision_alone() {
        let mut store = LightStore::default();
        let a = store.add_light(light_at(0.0)).unwrap();
        store.add_light(light_at(1.0)).unwrap();
        store.remove_light(a).unwrap();
        let revision = store.revision();

        let invalid = Err(DeferredError::InvalidLight(a));
        assert_eq!(store.set_light_position(a, Vec3::ONE), invalid);
        assert_eq!(store.set_light_color(a, Vec3::ZERO), invalid);
        assert_eq!(store.set_light_intensity(a, 9.0), invalid);
        assert_eq!(store.set_light_radius(a, 2.0), invalid);
        assert_eq!(store.update_light(a, light_at(3.0)), invalid);
        assert_eq!(store.remove_light(a).map(|_| ()), invalid);

        assert_eq!(store.revision(), revision);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_setters_update_fields() {
        let mut store = LightStore::default();
        let handle = store.add_light(PointLight::default()).unwrap();

        store.set_light_position(handle, Vec3::new(1.0, 2.0, 3.0)).unwrap();
        store.set_light_color(handle, Vec3::new(1.0, 0.5, 0.25)).unwrap();
        store.set_light_intensity(handle, 3.0).unwrap();
        store.set_light_radius(handle, 12.0).unwrap();

        let light = store.get(handle).unwrap();
        assert_eq!(light.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(light.color, Vec3::new(1.0, 0.5, 0.25));
        assert_eq!(light.intensity, 3.0);
        assert_eq!(light.radius, 12.0);
    }

    #[test]
    fn test_revision_changes_on_mutation() {
        let mut store = LightStore::default();
        let r0 = store.revision();
        let handle = store.add_light(PointLight::default()).unwrap();
        let r1 = store.revision();
        assert_ne!(r0, r1);

        // Identical update is not a change
        store.update_light(handle, PointLight::default()).unwrap();
        assert_eq!(store.revision(), r1);

        store.set_light_radius(handle, 4.0).unwrap();
        assert_ne!(store.revision(), r1);
        let r2 = store.revision();

        // Ambient lives in the uniform block only
        store.set_ambient(Vec3::ONE, 0.5);
        assert_eq!(store.revision(), r2);
        assert_eq!(store.ambient().radiance(), Vec3::splat(0.5));

        // Separate stores never share a revision
        assert_ne!(LightStore::default().revision(), LightStore::default().revision());
    }

    #[test]
    fn test_clear_lights_invalidates_handles() {
        let mut store = LightStore::default();
        let handles: Vec<_> = (0..3)
            .map(|i| store.add_light(light_at(i as f32)).unwrap())
            .collect();
        store.clear_lights();

        assert!(store.is_empty());
        assert!(handles.iter().all(|h| !store.contains(*h)));

        let again = store.add_light(light_at(5.0)).unwrap();
        assert_eq!(store.dense_index(again), Some(0));
    }

    #[test]
    fn test_handles_follow_dense_order() {
        let mut store = LightStore::default();
        let a = store.add_light(light_at(0.0)).unwrap();
        let b = store.add_light(light_at(1.0)).unwrap();
        let c = store.add_light(light_at(2.0)).unwrap();
        store.remove_light(b).unwrap();
        assert_eq!(store.handles().collect::<Vec<_>>(), vec![a, c]);
    }

    #[test]
    fn test_uniforms_layout() {
        let mut store = LightStore::default();
        store.set_ambient(Vec3::new(0.2, 0.4, 0.6), 0.5);
        for i in 0..10 {
            store.add_light(light_at(i as f32)).unwrap();
        }

        let uniforms = store.uniforms(Vec3::new(1.0, 2.0, 3.0), 8);
        assert_eq!(uniforms.camera_position, [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(uniforms.ambient_color, [0.1, 0.2, 0.3, 0.5]);
        assert_eq!(uniforms.num_lights, 10);
        assert_eq!(uniforms.num_shadow_casters, 8);
        assert_eq!(std::mem::size_of::<LightUniforms>(), 48);
        assert_eq!(std::mem::size_of::<GpuPointLight>(), 32);
    }

    #[test]
    fn test_shadow_casters_never_exceed_lights() {
        let config = crate::deferred::DeferredConfig::default();
        assert_eq!(config.shadow.max_casters, 8);

        let mut store = LightStore::default();
        for i in 0..3 {
            store.add_light(light_at(i as f32)).unwrap();
        }

        let casters = config.shadow_caster_count(store.len());
        let uniforms = store.uniforms(Vec3::ZERO, casters);
        assert_eq!(casters, 3);
        assert_eq!(uniforms.num_lights, 3);
        assert_eq!(uniforms.num_shadow_casters, 3);

        // A caller asking for more casters than lights is clamped too
        assert_eq!(store.uniforms(Vec3::ZERO, 8).num_shadow_casters, 3);
    }

    #[test]
    fn test_default_ambient_and_light() {
        let ambient = AmbientTerm::default();
        assert_eq!(ambient.radiance(), Vec3::splat(0.03));

        let light = PointLight::default();
        assert_eq!(light.radius, 10.0);
        assert_eq!(light.to_gpu().color, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_sync_point_lights_tracks_components() {
        let mut app = App::new();
        app.init_resource::<LightStore>();
        app.add_systems(Update, sync_point_lights);

        let entity = app
            .world_mut()
            .spawn((
                DeferredPointLight::new(Color::WHITE, 2.0, 8.0),
                GlobalTransform::from_translation(Vec3::new(1.0, 2.0, 3.0)),
            ))
            .id();
        app.update();

        let store = app.world().resource::<LightStore>();
        assert_eq!(store.len(), 1);
        assert_eq!(store.lights()[0].position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(store.lights()[0].intensity, 2.0);

        app.world_mut()
            .entity_mut(entity)
            .get_mut::<DeferredPointLight>()
            .unwrap()
            .intensity = 5.0;
        app.update();
        assert_eq!(app.world().resource::<LightStore>().lights()[0].intensity, 5.0);

        app.world_mut().despawn(entity);
        app.update();
        assert!(app.world().resource::<LightStore>().is_empty());
    }
}
