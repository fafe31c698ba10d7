//! Clustered deferred lighting.
//!
//! A frame renders point light cube shadows, fills a G-buffer, bins lights
//! into a froxel grid on the CPU, and resolves every pixel in one fullscreen
//! pass with Cook-Torrance shading, Reinhard tone mapping and gamma.
//!
//! Main world: add [`DeferredLightingPlugin`], put [`DeferredCamera`] on a
//! `Camera3d`, [`DeferredRenderable`] on `Mesh3d` entities, and
//! [`DeferredPointLight`] on lights (or edit the [`LightStore`] directly).

mod cluster;
mod cluster_node;
mod config;
mod error;
mod extract;
mod gbuffer;
mod gbuffer_node;
mod labels;
mod light;
mod light_buffers;
mod lighting;
mod lighting_node;
mod mesh;
mod pipeline;
mod pipelines;
mod plugin;
mod prepare;
mod sequencer;
mod shadow;
mod shadow_node;

pub use cluster::{depth_slice, slice_depth_bounds, LightCluster, LightClusterer};
pub use cluster_node::ClusterUpdateNode;
pub use config::{ClusterGridConfig, DeferredConfig, ShadowConfig};
pub use error::{DeferredError, DeferredResult};
pub use extract::{extract_deferred_draws, extract_deferred_meshes, prepare_deferred_meshes};
pub use gbuffer::{
    gbuffer_color_targets, DeferredCamera, GBuffer, GeometryViewUniform, GBUFFER_ALBEDO_FORMAT,
    GBUFFER_CLEAR_COLORS, GBUFFER_COLOR_FORMATS, GBUFFER_DEPTH_CLEAR, GBUFFER_DEPTH_FORMAT,
    GBUFFER_MATERIAL_FORMAT, GBUFFER_NORMAL_FORMAT, GBUFFER_POSITION_FORMAT,
};
pub use gbuffer_node::GBufferPassNode;
pub use labels::DeferredLabel;
pub use light::{
    sync_point_lights, AmbientTerm, DeferredPointLight, GpuPointLight, LightHandle, LightStore,
    LightUniforms, PointLight, MAX_POINT_LIGHTS,
};
pub use light_buffers::{frame_uniforms, FrameSlot, LightBuffers, RevisionTracker};
pub use lighting::{
    attenuation, distribution_ggx, fresnel_schlick, gamma_encode, geometry_smith, luminance,
    reinhard, resolve_color, shade_point, shadow_visibility, FrameCamera, LightingResolver,
    LightingViewUniform, SurfaceSample, GAMMA,
};
pub use lighting_node::LightingPassNode;
pub use mesh::{
    normal_matrix, DeferredMeshCache, DeferredRenderable, DeferredVertex, DrawInstance,
    DrawInstanceUniform, ExtractedDraw, ExtractedDraws, GpuMesh, MeshData, PendingMeshUploads,
};
pub use pipeline::{
    check_shadow_inputs, frame_pipeline, DeferredPipeline, GeometryPass, LightingPass,
    PipelineStatus,
};
pub use pipelines::{
    lighting_layout_entries, lighting_shader_defs, DeferredBindings, DeferredPipelineKind,
    DeferredPipelines, GBUFFER_SHADER, LIGHTING_SHADER, SHADOW_SHADER,
};
pub use plugin::DeferredLightingPlugin;
pub use prepare::{
    check_view_compatibility, cleanup_deferred_frame, frame_camera, init_deferred_pipeline,
    prepare_deferred_frame, DeferredDisabled,
};
pub use sequencer::{FramePhase, FrameSequencer};
pub use shadow::{
    face_layer, face_projection, face_uniforms, face_view, shadow_far_plane, CubeFace,
    CubeFaceMatrices, ShadowCubeArray, ShadowFaceUniform, CUBE_FACES, SHADOW_DEPTH_FORMAT,
};
pub use shadow_node::ShadowPassNode;
