//! Core type definitions for the deque.

use crate::error::{CoreError, CoreResult};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a segment file.
///
/// Segment ids order segments physically and logically: a cursor reads
/// segments in ascending id order. Ids are allocated sparsely so that
/// bulk-prepended and back-filled segments can be placed between existing
/// ones. They are unrelated to entry ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// Creates a new segment ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg:{}", self.0)
    }
}

/// An inclusive range of application-supplied entry ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdRange {
    /// First id covered by the entry.
    pub start: i64,
    /// Last id covered by the entry.
    pub end: i64,
}

impl IdRange {
    /// Creates a validated id range.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` if `start` is negative or `end < start`.
    pub fn new(start: i64, end: i64) -> CoreResult<Self> {
        if start < 0 || end < start {
            return Err(CoreError::invariant(format!(
                "invalid id range [{start}, {end}]"
            )));
        }
        Ok(Self { start, end })
    }

    /// Returns true if `id` falls within the range.
    #[must_use]
    pub const fn contains(&self, id: i64) -> bool {
        self.start <= id && id <= self.end
    }

    /// Returns true if the ranges share at least one id.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns the smallest range covering both.
    #[must_use]
    pub fn span(self, other: Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_id_ordering() {
        assert!(SegmentId::new(2) > SegmentId::new(1));
        assert_eq!(SegmentId::new(9).to_string(), "seg:9");
    }

    #[test]
    fn id_range_validation() {
        assert!(IdRange::new(0, 0).is_ok());
        assert!(IdRange::new(-1, 10).is_err());
        assert!(IdRange::new(10, -1).is_err());
        assert!(IdRange::new(10, 8).is_err());
        assert!(IdRange::new(-1, -1).is_err());
    }

    #[test]
    fn id_range_relations() {
        let a = IdRange::new(1, 10).unwrap();
        let b = IdRange::new(10, 20).unwrap();
        let c = IdRange::new(11, 20).unwrap();
        assert!(a.contains(1) && a.contains(10) && !a.contains(11));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.span(c), IdRange::new(1, 20).unwrap());
    }
}
