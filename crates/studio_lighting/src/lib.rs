//! Lighting Studio: a clustered deferred lighting core for Bevy.
//!
//! See [`deferred`] for the pipeline and [`DeferredLightingPlugin`] for
//! the entry point.

pub mod deferred;

pub use deferred::{
    AmbientTerm, DeferredCamera, DeferredConfig, DeferredError, DeferredLightingPlugin,
    DeferredPointLight, DeferredRenderable, DeferredResult, LightHandle, LightStore, PointLight,
};
