//! Light clustering render graph node.
//!
//! Runs between the geometry and lighting passes. Records no GPU commands;
//! it uploads the light array and rebuilds the cluster tables for this
//! frame's slot.

use bevy::prelude::*;
use bevy::render::{
    render_graph::{NodeRunError, RenderGraphContext, ViewNode},
    renderer::{RenderContext, RenderQueue},
};

use super::light::LightStore;
use super::pipeline::frame_pipeline;

#[derive(Default)]
pub struct ClusterUpdateNode;

impl ViewNode for ClusterUpdateNode {
    type ViewQuery = Entity;

    fn run<'w>(
        &self,
        _graph: &mut RenderGraphContext,
        _render_context: &mut RenderContext<'w>,
        view: bevy::ecs::query::QueryItem<'w, '_, Self::ViewQuery>,
        world: &'w World,
    ) -> Result<(), NodeRunError> {
        let Some(pipeline) = frame_pipeline(world, view) else {
            return Ok(());
        };
        let Some(store) = world.get_resource::<LightStore>() else {
            return Ok(());
        };
        let queue = world.resource::<RenderQueue>();

        if let Err(err) = pipeline.update_clusters(queue, store) {
            pipeline.abort_frame("cluster update", &err);
        }

        Ok(())
    }
}
