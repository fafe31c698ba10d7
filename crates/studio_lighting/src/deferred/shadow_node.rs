//! Point light shadow pass render graph node.
//!
//! Starts the deferred frame: renders 6 depth passes per shadow-casting light
//! into the cube-map array sampled by the lighting pass.

use bevy::prelude::*;
use bevy::render::{
    render_graph::{NodeRunError, RenderGraphContext, ViewNode},
    render_resource::PipelineCache,
    renderer::{RenderContext, RenderQueue},
};

use super::light::LightStore;
use super::mesh::DeferredMeshCache;
use super::pipeline::frame_pipeline;

#[derive(Default)]
pub struct ShadowPassNode;

impl ViewNode for ShadowPassNode {
    type ViewQuery = Entity;

    fn run<'w>(
        &self,
        _graph: &mut RenderGraphContext,
        render_context: &mut RenderContext<'w>,
        view: bevy::ecs::query::QueryItem<'w, '_, Self::ViewQuery>,
        world: &'w World,
    ) -> Result<(), NodeRunError> {
        let Some(pipeline) = frame_pipeline(world, view) else {
            return Ok(());
        };
        let (Some(store), Some(meshes)) = (
            world.get_resource::<LightStore>(),
            world.get_resource::<DeferredMeshCache>(),
        ) else {
            return Ok(());
        };
        let pipeline_cache = world.resource::<PipelineCache>();
        let queue = world.resource::<RenderQueue>();

        let (gpu_meshes, instances) = pipeline.frame_draws(meshes);
        if let Err(err) = pipeline.render_shadows(
            render_context,
            pipeline_cache,
            queue,
            store.lights(),
            &gpu_meshes,
            instances,
        ) {
            pipeline.abort_frame("shadow pass", &err);
        }

        Ok(())
    }
}
