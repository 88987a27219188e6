//! Error types surfaced by the collector's embedding API.

use std::fmt;

/// Failures the collector can report.
///
/// [`GcError::OutOfMemory`] is the only failure an
/// embedder is expected to handle at the call site; [`GcError::InvariantViolation`]
/// and [`GcError::WhiteEscape`] indicate the collector's own invariants have
/// been broken (a bug in the collector, or in an embedder that bypassed the
/// write barrier) and are fatal once detected — callers on the hot allocation
/// path get a `Result` so tests can observe them, but `RealtimeHeap`'s public
/// entry points turn them into a diagnostic dump followed by a process abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// The heap partition (or a specific size group) could not satisfy a
    /// request: every empty page is in use and no hole is large enough.
    OutOfMemory {
        requested: usize,
        group: Option<usize>,
    },
    /// An internal consistency check failed: a counter disagreed with a list
    /// walk, a link pointed outside the partition, or a color transition that
    /// should be impossible was observed.
    InvariantViolation(&'static str),
    /// A write observed storing a white pointer into a black object outside
    /// of a protected barrier call. Only ever constructed when the
    /// `strict-white-escape` feature is enabled; without it the barrier
    /// silently retains the pointer instead.
    WhiteEscape { address: usize },
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                group: Some(group),
            } => write!(
                f,
                "out of memory: could not satisfy a {requested}-byte request in group {group}"
            ),
            Self::OutOfMemory {
                requested,
                group: None,
            } => write!(
                f,
                "out of memory: could not satisfy a {requested}-byte large-object request"
            ),
            Self::InvariantViolation(what) => write!(f, "gc invariant violated: {what}"),
            Self::WhiteEscape { address } => {
                write!(f, "white pointer escaped the write barrier at {address:#x}")
            }
        }
    }
}

impl std::error::Error for GcError {}

pub type GcResult<T> = Result<T, GcError>;
