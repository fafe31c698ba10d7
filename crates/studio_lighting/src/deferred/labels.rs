//! Render graph labels for the deferred lighting passes.

use bevy::render::render_graph::RenderLabel;

/// Labels for deferred lighting nodes in the `Core3d` graph, in execution order.
#[derive(Debug, Hash, PartialEq, Eq, Clone, RenderLabel)]
pub enum DeferredLabel {
    /// Cube shadow maps for the leading point lights
    ShadowPass,
    /// G-Buffer pass: MRT position, normal, albedo/AO, material + depth
    GBufferPass,
    /// CPU light clustering and light/cluster buffer uploads
    ClusterUpdate,
    /// Fullscreen resolve into the view target
    LightingPass,
}
