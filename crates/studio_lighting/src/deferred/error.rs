//! Error types for the deferred lighting core.

use bevy::render::renderer::RenderDevice;

use super::light::LightHandle;
use super::sequencer::FramePhase;

/// Errors raised by the deferred lighting pipeline and its subsystems.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredError {
    /// The light store already holds `capacity` lights.
    CapacityExhausted { capacity: usize },
    /// The handle does not name a live light (removed, or from another store).
    InvalidLight(LightHandle),
    /// `render_shadows` was given a different number of meshes and transforms.
    MismatchedShadowInputs { meshes: usize, transforms: usize },
    /// A pass operation was invoked in the wrong frame phase.
    OutOfOrder {
        operation: &'static str,
        phase: FramePhase,
    },
    /// A subsystem was used before `init` created it.
    NotInitialized(&'static str),
    /// Render targets cannot have a zero-sized extent.
    InvalidExtent { width: u32, height: u32 },
    /// The view's camera settings conflict with the lighting resolve target.
    IncompatibleView(&'static str),
    /// Clustering needs `0 < near < far`.
    InvalidClipRange { near: f32, far: f32 },
    /// The device rejected a buffer, texture, or view allocation.
    ResourceCreation {
        resource: &'static str,
        message: String,
    },
    /// A render pipeline or one of its shaders failed to build.
    PipelineCreation {
        pipeline: &'static str,
        message: String,
    },
    /// Configuration values out of range.
    InvalidConfig(String),
    /// Configuration file could not be read or parsed.
    ConfigIo(String),
    /// A lock guarding per-frame state was poisoned by a panic.
    Poisoned(&'static str),
}

impl std::fmt::Display for DeferredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeferredError::CapacityExhausted { capacity } => {
                write!(f, "Light store is full ({} lights)", capacity)
            }
            DeferredError::InvalidLight(handle) => write!(f, "Invalid light handle: {:?}", handle),
            DeferredError::MismatchedShadowInputs { meshes, transforms } => write!(
                f,
                "Shadow pass needs one transform per mesh (got {} meshes, {} transforms)",
                meshes, transforms
            ),
            DeferredError::OutOfOrder { operation, phase } => {
                write!(f, "`{}` called out of order (frame phase: {:?})", operation, phase)
            }
            DeferredError::NotInitialized(what) => write!(f, "{} is not initialized", what),
            DeferredError::InvalidExtent { width, height } => {
                write!(f, "Invalid render target size {}x{}", width, height)
            }
            DeferredError::IncompatibleView(reason) => {
                write!(f, "View cannot use deferred lighting: {}", reason)
            }
            DeferredError::InvalidClipRange { near, far } => {
                write!(f, "Invalid cluster depth range near={} far={}", near, far)
            }
            DeferredError::ResourceCreation { resource, message } => {
                write!(f, "Failed to create {}: {}", resource, message)
            }
            DeferredError::PipelineCreation { pipeline, message } => {
                write!(f, "Failed to create pipeline {}: {}", pipeline, message)
            }
            DeferredError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            DeferredError::ConfigIo(msg) => write!(f, "Config error: {}", msg),
            DeferredError::Poisoned(what) => write!(f, "Lock poisoned: {}", what),
        }
    }
}

impl std::error::Error for DeferredError {}

impl From<serde_json::Error> for DeferredError {
    fn from(e: serde_json::Error) -> Self {
        DeferredError::ConfigIo(e.to_string())
    }
}

impl From<std::io::Error> for DeferredError {
    fn from(e: std::io::Error) -> Self {
        DeferredError::ConfigIo(e.to_string())
    }
}

/// Result type for deferred lighting operations.
pub type DeferredResult<T> = Result<T, DeferredError>;

/// Run `create` inside wgpu error scopes and turn any captured
/// out-of-memory or validation error into [`DeferredError::ResourceCreation`].
///
/// wgpu reports allocation failures asynchronously through error scopes
/// rather than through return values, so this is how `init` learns that a
/// texture or buffer was rejected.
pub(crate) fn allocation_scope<T>(
    render_device: &RenderDevice,
    resource: &'static str,
    create: impl FnOnce() -> T,
) -> DeferredResult<T> {
    let device = render_device.wgpu_device();
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let value = create();

    let validation = bevy::tasks::block_on(device.pop_error_scope());
    let out_of_memory = bevy::tasks::block_on(device.pop_error_scope());

    match validation.or(out_of_memory) {
        Some(err) => Err(DeferredError::ResourceCreation {
            resource,
            message: err.to_string(),
        }),
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = DeferredError::CapacityExhausted { capacity: 256 };
        assert_eq!(err.to_string(), "Light store is full (256 lights)");

        let err = DeferredError::MismatchedShadowInputs {
            meshes: 3,
            transforms: 2,
        };
        assert!(err.to_string().contains("3 meshes, 2 transforms"));

        let err = DeferredError::OutOfOrder {
            operation: "begin_geometry_pass",
            phase: FramePhase::Idle,
        };
        assert!(err.to_string().contains("begin_geometry_pass"));
        assert!(err.to_string().contains("Idle"));
    }

    #[test]
    fn test_from_json_error() {
        let parse = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: DeferredError = parse.into();
        assert!(matches!(err, DeferredError::ConfigIo(_)));
    }
}
