//! Deferred lighting render graph node.
//!
//! This node performs a fullscreen pass that:
//! 1. Reads the G-buffer with exact texel loads
//! 2. Shades each pixel with the lights of its cluster (Cook-Torrance)
//! 3. Applies point shadows and the ambient term
//! 4. Tone maps (Reinhard) and outputs to the view target

use bevy::prelude::*;
use bevy::render::{
    render_graph::{NodeRunError, RenderGraphContext, ViewNode},
    render_resource::PipelineCache,
    renderer::RenderContext,
    view::ViewTarget,
};

use super::error::DeferredResult;
use super::pipeline::{frame_pipeline, DeferredPipeline};

/// Draws a fullscreen triangle that resolves the G-buffer into the view target.
#[derive(Default)]
pub struct LightingPassNode;

impl ViewNode for LightingPassNode {
    type ViewQuery = (Entity, &'static ViewTarget);

    fn run<'w>(
        &self,
        _graph: &mut RenderGraphContext,
        render_context: &mut RenderContext<'w>,
        (view, target): bevy::ecs::query::QueryItem<'w, '_, Self::ViewQuery>,
        world: &'w World,
    ) -> Result<(), NodeRunError> {
        let Some(pipeline) = frame_pipeline(world, view) else {
            return Ok(());
        };
        let pipeline_cache = world.resource::<PipelineCache>();

        if let Err(err) = resolve(pipeline, render_context, pipeline_cache, target) {
            pipeline.abort_frame("lighting pass", &err);
        }

        Ok(())
    }
}

fn resolve<'a>(
    pipeline: &'a DeferredPipeline,
    render_context: &'a mut RenderContext<'_>,
    pipeline_cache: &'a PipelineCache,
    target: &'a ViewTarget,
) -> DeferredResult<()> {
    let mut pass = pipeline.begin_lighting_pass(render_context, pipeline_cache, target)?;
    pass.render_lighting()?;
    pass.end()
}
