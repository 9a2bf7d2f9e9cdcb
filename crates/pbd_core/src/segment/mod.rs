//! Segment files: header, entry framing and lifecycle.
//!
//! A segment file is laid out as:
//!
//! ```text
//! | segment header (40 bytes) | extra header blob | entry | entry | ... |
//! ```
//!
//! See [`header`] and [`entry`] for the byte layouts.

pub mod entry;
mod file;
pub mod header;
mod state;

pub(crate) use file::{Frame, FrameWalk, Segment, WalkStop};
pub use state::SegmentState;

use crate::types::{IdRange, SegmentId};
use std::path::PathBuf;

/// Point-in-time description of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Segment id.
    pub id: SegmentId,
    /// Lifecycle state.
    pub state: SegmentState,
    /// Readable entries.
    pub entries: u32,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Id range covered by the readable entries.
    pub ids: Option<IdRange>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_ms: i64,
    /// Timestamp of the newest readable entry.
    pub newest_timestamp: Option<i64>,
    /// Length of the extra header blob.
    pub extra_header_len: usize,
    /// Polled entries from this segment not yet released.
    pub outstanding: u32,
    /// Current file path.
    pub path: PathBuf,
}
