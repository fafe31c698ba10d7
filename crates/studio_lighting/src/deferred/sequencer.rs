//! Frame phase guard.
//!
//! A frame walks through a fixed sequence of phases:
//!
//! ```text
//! Idle -> ShadowPass -> GeometryPass(open) -> GeometryPass(closed)
//!      -> ClusterUpdate -> LightingResolve(open) -> Idle
//! ```
//!
//! Any other transition is rejected with [`DeferredError::OutOfOrder`]. Render
//! graph nodes only see `&World`, so the state is a single atomic byte.

use std::sync::atomic::{AtomicU8, Ordering};

use super::error::{DeferredError, DeferredResult};

/// Where the current frame is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FramePhase {
    Idle,
    ShadowPass,
    GeometryPass,
    ClusterUpdate,
    LightingResolve,
    /// A contract violation happened mid-frame. Only `reset` leaves this state.
    Faulted,
}

const OPEN_BIT: u8 = 0x80;

impl FramePhase {
    fn to_bits(self) -> u8 {
        match self {
            FramePhase::Idle => 0,
            FramePhase::ShadowPass => 1,
            FramePhase::GeometryPass => 2,
            FramePhase::ClusterUpdate => 3,
            FramePhase::LightingResolve => 4,
            FramePhase::Faulted => 5,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & !OPEN_BIT {
            0 => FramePhase::Idle,
            1 => FramePhase::ShadowPass,
            2 => FramePhase::GeometryPass,
            3 => FramePhase::ClusterUpdate,
            4 => FramePhase::LightingResolve,
            _ => FramePhase::Faulted,
        }
    }
}

fn encode(phase: FramePhase, open: bool) -> u8 {
    phase.to_bits() | if open { OPEN_BIT } else { 0 }
}

/// Atomic frame state machine.
#[derive(Debug)]
pub struct FrameSequencer {
    state: AtomicU8,
}

impl Default for FrameSequencer {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(encode(FramePhase::Idle, false)),
        }
    }
}

impl FrameSequencer {
    pub fn phase(&self) -> FramePhase {
        FramePhase::from_bits(self.state.load(Ordering::Acquire))
    }

    /// True while a geometry or lighting pass is open.
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) & OPEN_BIT != 0
    }

    pub fn is_idle(&self) -> bool {
        self.state.load(Ordering::Acquire) == encode(FramePhase::Idle, false)
    }

    /// Idle -> ShadowPass. Starts a frame.
    pub fn render_shadows(&self) -> DeferredResult<()> {
        self.transition(
            "render_shadows",
            (FramePhase::Idle, false),
            (FramePhase::ShadowPass, false),
        )
    }

    /// ShadowPass -> GeometryPass(open).
    pub fn begin_geometry(&self) -> DeferredResult<()> {
        self.transition(
            "begin_geometry_pass",
            (FramePhase::ShadowPass, false),
            (FramePhase::GeometryPass, true),
        )
    }

    /// Fails unless the geometry pass is open.
    pub fn expect_geometry_open(&self, operation: &'static str) -> DeferredResult<()> {
        self.expect(operation, FramePhase::GeometryPass, true)
    }

    /// GeometryPass(open) -> GeometryPass(closed).
    pub fn end_geometry(&self) -> DeferredResult<()> {
        self.transition(
            "end_geometry_pass",
            (FramePhase::GeometryPass, true),
            (FramePhase::GeometryPass, false),
        )
    }

    /// GeometryPass(closed) -> ClusterUpdate.
    pub fn update_clusters(&self) -> DeferredResult<()> {
        self.transition(
            "update_clusters",
            (FramePhase::GeometryPass, false),
            (FramePhase::ClusterUpdate, false),
        )
    }

    /// ClusterUpdate -> LightingResolve(open).
    pub fn begin_lighting(&self) -> DeferredResult<()> {
        self.transition(
            "begin_lighting_pass",
            (FramePhase::ClusterUpdate, false),
            (FramePhase::LightingResolve, true),
        )
    }

    /// Fails unless the lighting pass is open.
    pub fn expect_lighting_open(&self, operation: &'static str) -> DeferredResult<()> {
        self.expect(operation, FramePhase::LightingResolve, true)
    }

    /// LightingResolve(open) -> Idle. Ends the frame.
    pub fn end_lighting(&self) -> DeferredResult<()> {
        self.transition(
            "end_lighting_pass",
            (FramePhase::LightingResolve, true),
            (FramePhase::Idle, false),
        )
    }

    /// Fails unless no frame is in progress.
    pub fn expect_idle(&self, operation: &'static str) -> DeferredResult<()> {
        self.expect(operation, FramePhase::Idle, false)
    }

    pub fn fault(&self) {
        self.state
            .store(encode(FramePhase::Faulted, false), Ordering::Release);
    }

    /// Back to Idle, whatever the current phase.
    pub fn reset(&self) {
        self.state
            .store(encode(FramePhase::Idle, false), Ordering::Release);
    }

    fn expect(&self, operation: &'static str, phase: FramePhase, open: bool) -> DeferredResult<()> {
        let bits = self.state.load(Ordering::Acquire);
        if bits == encode(phase, open) {
            Ok(())
        } else {
            Err(DeferredError::OutOfOrder {
                operation,
                phase: FramePhase::from_bits(bits),
            })
        }
    }

    fn transition(
        &self,
        operation: &'static str,
        from: (FramePhase, bool),
        to: (FramePhase, bool),
    ) -> DeferredResult<()> {
        self.state
            .compare_exchange(
                encode(from.0, from.1),
                encode(to.0, to.1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|actual| DeferredError::OutOfOrder {
                operation,
                phase: FramePhase::from_bits(actual),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_frame(seq: &FrameSequencer) {
        seq.render_shadows().unwrap();
        seq.begin_geometry().unwrap();
        seq.expect_geometry_open("draw_mesh").unwrap();
        seq.end_geometry().unwrap();
        seq.update_clusters().unwrap();
        seq.begin_lighting().unwrap();
        seq.expect_lighting_open("render_lighting").unwrap();
        seq.end_lighting().unwrap();
    }

    #[test]
    fn test_full_frame_returns_to_idle() {
        let seq = FrameSequencer::default();
        assert!(seq.is_idle());
        run_frame(&seq);
        assert!(seq.is_idle());
        run_frame(&seq);
        assert_eq!(seq.phase(), FramePhase::Idle);
    }

    #[test]
    fn test_out_of_order_reports_phase() {
        let seq = FrameSequencer::default();
        let err = seq.begin_geometry().unwrap_err();
        assert_eq!(
            err,
            DeferredError::OutOfOrder {
                operation: "begin_geometry_pass",
                phase: FramePhase::Idle,
            }
        );
        // State untouched by the failed call
        assert!(seq.is_idle());

        seq.render_shadows().unwrap();
        assert!(seq.update_clusters().is_err());
        assert!(seq.begin_lighting().is_err());
        assert_eq!(seq.phase(), FramePhase::ShadowPass);
    }

    #[test]
    fn test_reentrant_begin_rejected() {
        let seq = FrameSequencer::default();
        seq.render_shadows().unwrap();
        seq.begin_geometry().unwrap();
        assert!(seq.is_open());
        assert!(seq.begin_geometry().is_err());

        // Lighting cannot start while geometry is still open
        assert!(seq.update_clusters().is_err());
        seq.end_geometry().unwrap();
        assert!(!seq.is_open());
        assert!(seq.expect_geometry_open("draw_mesh").is_err());
    }

    #[test]
    fn test_resize_only_when_idle() {
        let seq = FrameSequencer::default();
        assert!(seq.expect_idle("resize").is_ok());
        seq.render_shadows().unwrap();
        assert!(matches!(
            seq.expect_idle("resize"),
            Err(DeferredError::OutOfOrder {
                phase: FramePhase::ShadowPass,
                ..
            })
        ));
    }

    #[test]
    fn test_fault_is_sticky_until_reset() {
        let seq = FrameSequencer::default();
        seq.render_shadows().unwrap();
        seq.fault();
        assert_eq!(seq.phase(), FramePhase::Faulted);
        assert!(seq.render_shadows().is_err());
        assert!(seq.begin_geometry().is_err());

        seq.reset();
        run_frame(&seq);
    }
}
