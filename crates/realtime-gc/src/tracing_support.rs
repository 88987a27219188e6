//! Collector tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for the collector loop's phases. Disabled, it compiles
//! to nothing, and the `tracing` dependency is not pulled in at all.

#[cfg(feature = "tracing")]
pub mod internal {
    use tracing::{span, Level};

    /// One phase of a single collection cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CollectorPhase {
        Flip,
        RootScan,
        GrayDrain,
        WriteVectorDrain,
        Sweep,
        Coalesce,
    }

    impl CollectorPhase {
        pub(crate) const fn name(self) -> &'static str {
            match self {
                Self::Flip => "flip",
                Self::RootScan => "root_scan",
                Self::GrayDrain => "gray_drain",
                Self::WriteVectorDrain => "write_vector_drain",
                Self::Sweep => "sweep",
                Self::Coalesce => "coalesce",
            }
        }
    }

    /// Open a span for `phase`, held by the caller for the phase's duration.
    pub fn trace_phase(phase: CollectorPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = phase.name()).entered()
    }

    /// Log a phase's entry.
    pub fn log_phase_start(phase: CollectorPhase) {
        tracing::debug!(phase = phase.name(), "phase_start");
    }

    /// Log a phase's exit along with whatever count best summarizes its work
    /// (objects grayed, objects recycled, pages coalesced).
    pub fn log_phase_end(phase: CollectorPhase, count: usize) {
        tracing::debug!(phase = phase.name(), count, "phase_end");
    }
}
