//! Deferred lighting plugin for Bevy.
//!
//! Wires the light store, extraction, prepare systems, and the four passes
//! into the `Core3d` render graph:
//!
//! ```text
//! StartMainPass -> ShadowPass -> GBufferPass -> ClusterUpdate -> MainOpaquePass
//! MainOpaquePass -> LightingPass -> MainTransparentPass
//! ```

use bevy::core_pipeline::core_3d::graph::{Core3d, Node3d};
use bevy::prelude::*;
use bevy::render::{
    extract_component::ExtractComponentPlugin,
    extract_resource::ExtractResourcePlugin,
    render_graph::{RenderGraphExt, ViewNodeRunner},
    ExtractSchedule, Render, RenderApp, RenderSystems,
};
use bevy::transform::TransformSystems;

use super::cluster_node::ClusterUpdateNode;
use super::config::DeferredConfig;
use super::extract::{extract_deferred_draws, extract_deferred_meshes, prepare_deferred_meshes};
use super::gbuffer::DeferredCamera;
use super::gbuffer_node::GBufferPassNode;
use super::labels::DeferredLabel;
use super::light::{sync_point_lights, LightStore};
use super::lighting_node::LightingPassNode;
use super::mesh::{DeferredMeshCache, ExtractedDraws, PendingMeshUploads};
use super::prepare::{cleanup_deferred_frame, init_deferred_pipeline, prepare_deferred_frame};
use super::shadow_node::ShadowPassNode;

/// Plugin that renders [`DeferredCamera`] views through the clustered
/// deferred lighting pipeline.
///
/// ## Usage
///
/// ```rust,ignore
/// app.add_plugins(DeferredLightingPlugin::default());
///
/// // Views with MSAA, tone mapping, or an HDR target are skipped
/// commands.spawn((Camera3d::default(), DeferredCamera::default(), Msaa::Off, Tonemapping::None));
/// commands.spawn((
///     Mesh3d(meshes.add(Cuboid::new(1.0, 1.0, 1.0))),
///     DeferredRenderable::default(),
///     Transform::default(),
/// ));
/// commands.spawn((
///     DeferredPointLight::new(Color::WHITE, 2.0, 8.0),
///     Transform::from_xyz(0.0, 3.0, 0.0),
/// ));
/// ```
#[derive(Default)]
pub struct DeferredLightingPlugin {
    pub config: DeferredConfig,
}

impl DeferredLightingPlugin {
    pub fn new(config: DeferredConfig) -> Self {
        Self { config }
    }
}

impl Plugin for DeferredLightingPlugin {
    fn build(&self, app: &mut App) {
        if let Err(err) = self.config.validate() {
            error!("Deferred lighting disabled: {}", err);
            return;
        }

        // Main app resources
        app.insert_resource(self.config.clone());
        app.insert_resource(LightStore::with_capacity(self.config.max_lights as usize));

        // DeferredPointLight entities feed the store once transforms are final
        app.add_systems(
            PostUpdate,
            sync_point_lights.after(TransformSystems::Propagate),
        );

        app.add_plugins(ExtractComponentPlugin::<DeferredCamera>::default());
        app.add_plugins(ExtractResourcePlugin::<LightStore>::default());

        // Get render app
        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            warn!("RenderApp not found - deferred lighting disabled");
            return;
        };

        render_app
            .insert_resource(self.config.clone())
            .init_resource::<ExtractedDraws>()
            .init_resource::<DeferredMeshCache>()
            .init_resource::<PendingMeshUploads>();

        render_app.add_systems(
            ExtractSchedule,
            (extract_deferred_draws, extract_deferred_meshes).chain(),
        );

        render_app.add_systems(
            Render,
            (
                (
                    prepare_deferred_meshes,
                    init_deferred_pipeline,
                    prepare_deferred_frame,
                )
                    .chain()
                    .in_set(RenderSystems::Prepare),
                cleanup_deferred_frame.in_set(RenderSystems::Cleanup),
            ),
        );

        // Add render graph nodes
        render_app
            .add_render_graph_node::<ViewNodeRunner<ShadowPassNode>>(
                Core3d,
                DeferredLabel::ShadowPass,
            )
            .add_render_graph_node::<ViewNodeRunner<GBufferPassNode>>(
                Core3d,
                DeferredLabel::GBufferPass,
            )
            .add_render_graph_node::<ViewNodeRunner<ClusterUpdateNode>>(
                Core3d,
                DeferredLabel::ClusterUpdate,
            )
            .add_render_graph_node::<ViewNodeRunner<LightingPassNode>>(
                Core3d,
                DeferredLabel::LightingPass,
            );

        // Shadows, G-buffer and clustering run before the main opaque pass,
        // lighting resolves after it and before transparents
        render_app.add_render_graph_edges(
            Core3d,
            (
                Node3d::StartMainPass,
                DeferredLabel::ShadowPass,
                DeferredLabel::GBufferPass,
                DeferredLabel::ClusterUpdate,
                Node3d::MainOpaquePass,
            ),
        );
        render_app.add_render_graph_edges(
            Core3d,
            (
                Node3d::MainOpaquePass,
                DeferredLabel::LightingPass,
                Node3d::MainTransparentPass,
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::{DeferredPointLight, LightStore};

    fn headless_app(config: DeferredConfig) -> App {
        let mut app = App::new();
        app.add_plugins((MinimalPlugins, bevy::transform::TransformPlugin));
        app.add_plugins(DeferredLightingPlugin::new(config));
        app
    }

    #[test]
    fn test_plugin_inserts_store_with_configured_capacity() {
        let mut config = DeferredConfig::default();
        config.max_lights = 12;
        let app = headless_app(config);

        let store = app.world().resource::<LightStore>();
        assert_eq!(store.capacity(), 12);
        assert_eq!(app.world().resource::<DeferredConfig>().max_lights, 12);
    }

    #[test]
    fn test_point_light_entities_reach_the_store() {
        let mut app = headless_app(DeferredConfig::default());
        let entity = app
            .world_mut()
            .spawn((
                DeferredPointLight::new(Color::WHITE, 3.0, 6.0),
                Transform::from_xyz(1.0, 2.0, 3.0),
            ))
            .id();
        app.update();

        let store = app.world().resource::<LightStore>();
        assert_eq!(store.len(), 1);
        assert_eq!(store.lights()[0].position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(store.lights()[0].radius, 6.0);

        app.world_mut().entity_mut(entity).despawn();
        app.update();
        assert!(app.world().resource::<LightStore>().is_empty());
    }

    #[test]
    fn test_invalid_config_adds_nothing() {
        let mut config = DeferredConfig::default();
        config.frames_in_flight = 0;
        let app = headless_app(config);
        assert!(!app.world().contains_resource::<LightStore>());
    }
}
