//! G-Buffer render graph node.
//!
//! Draws every prepared mesh into the four G-buffer color targets and depth.

use bevy::prelude::*;
use bevy::render::{
    render_graph::{NodeRunError, RenderGraphContext, ViewNode},
    render_resource::PipelineCache,
    renderer::RenderContext,
};

use super::error::DeferredResult;
use super::mesh::DeferredMeshCache;
use super::pipeline::{frame_pipeline, DeferredPipeline};

#[derive(Default)]
pub struct GBufferPassNode;

impl ViewNode for GBufferPassNode {
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
        let Some(meshes) = world.get_resource::<DeferredMeshCache>() else {
            return Ok(());
        };
        let pipeline_cache = world.resource::<PipelineCache>();

        if let Err(err) = draw_gbuffer(pipeline, render_context, pipeline_cache, meshes) {
            pipeline.abort_frame("geometry pass", &err);
        }

        Ok(())
    }
}

fn draw_gbuffer<'a>(
    pipeline: &'a DeferredPipeline,
    render_context: &'a mut RenderContext<'_>,
    pipeline_cache: &'a PipelineCache,
    meshes: &'a DeferredMeshCache,
) -> DeferredResult<()> {
    let (gpu_meshes, instances) = pipeline.frame_draws(meshes);
    let mut pass = pipeline.begin_geometry_pass(render_context, pipeline_cache)?;
    for (mesh, instance) in gpu_meshes.into_iter().zip(instances) {
        pass.draw_mesh(mesh, instance)?;
    }
    pass.end()
}
