//! # PBD Core
//!
//! A persistent binary deque: a durable, segmented log of binary entries
//! read by any number of independent cursors.
//!
//! This crate provides:
//! - Segment files with CRC-framed, optionally LZ4-compressed entries
//! - Rollover by size or age, and `push` of entries before the head
//! - Named cursors, transient or durable, with reference-counted reads
//! - Deletion of segments once every durable cursor has passed them
//! - Crash recovery, truncation and quarantine of damaged segments
//! - Byte and age retention enforced by a background scheduler
//! - A gap writer for back-filling skipped id ranges
//!
//! ## Example
//!
//! ```no_run
//! use pbd_core::BinaryDeque;
//!
//! let deque = BinaryDeque::open("/var/lib/export", "orders")?;
//! deque.offer(b"first")?;
//!
//! let cursor = deque.open_for_read("replica", false)?;
//! while let Some(entry) = cursor.poll()? {
//!     println!("{} bytes", entry.payload().len());
//!     entry.discard();
//! }
//! # Ok::<(), pbd_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod cursor;
mod deque;
pub mod dir;
mod error;
mod extra;
mod gap;
mod offline;
mod recovery;
mod retention;
pub mod segment;
mod stats;
mod types;

pub use config::{DequeConfig, RetentionConfig};
pub use cursor::{
    decode_cursors, encode_cursors, PersistedCursor, PolledEntry, ReadCursor, SeekErrorRule,
};
pub use deque::{BinaryDeque, DeferredDeleter, DeletionTask, DequeBuilder};
pub use dir::DequeDir;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use extra::ExtraHeaderSerializer;
pub use gap::GapWriter;
pub use offline::{inspect_directory, read_entries, DirectoryReport, SegmentReport};
pub use recovery::{EntryView, TruncatorResponse};
pub use retention::{RetentionPolicy, RetentionScheduler};
pub use segment::{SegmentInfo, SegmentState};
pub use stats::{DequeStats, StatsSnapshot};
pub use types::{IdRange, SegmentId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
