//! Segment lifecycle state.

use crate::error::{CoreError, CoreResult};
use std::fmt;

/// Lifecycle state of a segment.
///
/// ```text
/// Writing ──► Finalized ──► Deletable
///    │            │             ▲
///    └──────► Quarantined ──────┘
/// ```
///
/// All state changes go through [`SegmentState::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Accepting appends.
    Writing,
    /// Sealed; no further appends.
    Finalized,
    /// Corruption detected; only a prefix of entries is readable.
    Quarantined,
    /// Detached from the deque and about to be removed.
    Deletable,
}

impl SegmentState {
    /// Moves to `to`, rejecting transitions the lifecycle does not allow.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` for a disallowed transition.
    pub fn transition(self, to: Self) -> CoreResult<Self> {
        use SegmentState::{Deletable, Finalized, Quarantined, Writing};
        let allowed = matches!(
            (self, to),
            (Writing, Finalized)
                | (Writing, Quarantined)
                | (Finalized, Quarantined)
                | (Finalized, Deletable)
                | (Quarantined, Deletable)
                | (Finalized, Finalized)
                | (Quarantined, Quarantined)
        );
        if allowed {
            Ok(to)
        } else {
            Err(CoreError::invariant(format!(
                "segment cannot move from {self} to {to}"
            )))
        }
    }

    /// Returns true once the segment accepts no more appends.
    #[must_use]
    pub const fn is_sealed(self) -> bool {
        !matches!(self, Self::Writing)
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Writing => "writing",
            Self::Finalized => "finalized",
            Self::Quarantined => "quarantined",
            Self::Deletable => "deletable",
        };
        f.write_str(name)
    }
}
