//! Test fixtures and deque helpers.
//!
//! Provides convenience functions for setting up deques in temporary
//! directories and common test scenarios.

use pbd_core::{BinaryDeque, DequeConfig, SegmentInfo};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Nonce used by fixtures unless a test picks its own.
pub const TEST_NONCE: &str = "test";

/// A deque in a temporary directory, removed when dropped.
pub struct TestDeque {
    /// The deque instance.
    pub deque: BinaryDeque,
    config: DequeConfig,
    nonce: String,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TestDeque {
    /// Creates a deque with the default configuration.
    pub fn new() -> Self {
        Self::with_config(DequeConfig::default())
    }

    /// Creates a deque with `config`.
    pub fn with_config(config: DequeConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let deque = BinaryDeque::open_with_config(temp_dir.path(), TEST_NONCE, config.clone())
            .expect("Failed to open deque");
        Self {
            deque,
            config,
            nonce: TEST_NONCE.to_string(),
            _temp_dir: temp_dir,
        }
    }

    /// Creates a deque whose segments roll over at `max_segment_size` bytes.
    pub fn small_segments(max_segment_size: u64) -> Self {
        Self::with_config(DequeConfig::default().max_segment_size(max_segment_size))
    }

    /// Returns the deque directory.
    pub fn dir(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Returns the nonce the deque was opened with.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Closes the deque and opens it again from disk, running recovery.
    pub fn reopen(self) -> Self {
        let Self {
            deque,
            config,
            nonce,
            _temp_dir: temp_dir,
        } = self;
        deque.close().expect("Failed to close deque");
        drop(deque);
        let deque = BinaryDeque::open_with_config(temp_dir.path(), nonce.as_str(), config.clone())
            .expect("Failed to reopen deque");
        Self {
            deque,
            config,
            nonce,
            _temp_dir: temp_dir,
        }
    }

    /// Closes the deque, lets `damage` modify the files, then reopens.
    pub fn reopen_after<F>(self, damage: F) -> Self
    where
        F: FnOnce(&Path, &str),
    {
        let Self {
            deque,
            config,
            nonce,
            _temp_dir: temp_dir,
        } = self;
        deque.close().expect("Failed to close deque");
        drop(deque);
        damage(temp_dir.path(), &nonce);
        let deque = BinaryDeque::open_with_config(temp_dir.path(), nonce.as_str(), config.clone())
            .expect("Failed to reopen deque");
        Self {
            deque,
            config,
            nonce,
            _temp_dir: temp_dir,
        }
    }

    /// Paths of the segment files currently on disk, oldest first.
    pub fn segment_files(&self) -> Vec<PathBuf> {
        crate::corruption::segment_files(self.dir(), &self.nonce)
    }

    /// Segments tracked by the open deque.
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.deque.segments().expect("Failed to list segments")
    }

    /// Sum of the sizes of all segment files on disk.
    pub fn bytes_on_disk(&self) -> u64 {
        self.segment_files()
            .iter()
            .map(|p| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0))
            .sum()
    }
}

impl Default for TestDeque {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDeque {
    type Target = BinaryDeque;

    fn deref(&self) -> &Self::Target {
        &self.deque
    }
}

/// Runs a test with a deque in a temporary directory.
///
/// # Example
///
/// ```rust,ignore
/// use pbd_testkit::with_temp_deque;
///
/// #[test]
/// fn my_test() {
///     with_temp_deque(|deque| {
///         deque.offer(b"entry").unwrap();
///     });
/// }
/// ```
pub fn with_temp_deque<F, R>(f: F) -> R
where
    F: FnOnce(&BinaryDeque) -> R,
{
    let test_deque = TestDeque::new();
    f(&test_deque.deque)
}

/// Runs a test with a deque and its directory.
pub fn with_temp_deque_dir<F, R>(config: DequeConfig, f: F) -> R
where
    F: FnOnce(&BinaryDeque, &Path) -> R,
{
    let test_deque = TestDeque::with_config(config);
    f(&test_deque.deque, test_deque.dir())
}

/// Drains a cursor, returning every payload in read order.
pub fn drain(deque: &BinaryDeque, cursor_name: &str, transient: bool) -> Vec<Vec<u8>> {
    let cursor = deque
        .open_for_read(cursor_name, transient)
        .expect("Failed to open cursor");
    let mut out = Vec::new();
    while let Some(entry) = cursor.poll().expect("Failed to poll") {
        out.push(entry.payload().to_vec());
    }
    out
}

/// Drains a transient cursor, returning the start id of every entry.
pub fn drain_start_ids(deque: &BinaryDeque) -> Vec<i64> {
    let cursor = deque
        .open_for_read("fixture-ids", true)
        .expect("Failed to open cursor");
    let mut out = Vec::new();
    while let Some(entry) = cursor.poll().expect("Failed to poll") {
        out.push(entry.ids().expect("Entry has no ids").start);
    }
    out
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a deque holding `count` entries with contiguous single ids
    /// starting at `first_id`. Entry `i` carries payload `[i as u8; len]`.
    pub fn tracked_deque(count: usize, len: usize, first_id: i64) -> TestDeque {
        let test_deque = TestDeque::new();
        fill_tracked(&test_deque, count, len, first_id);
        test_deque
    }

    /// Appends `count` tracked entries to an existing deque.
    pub fn fill_tracked(deque: &BinaryDeque, count: usize, len: usize, first_id: i64) {
        for i in 0..count {
            let id = first_id + i as i64;
            deque
                .offer_with_ids(&vec![i as u8; len], id, id)
                .expect("Failed to offer entry");
        }
    }

    /// Creates a deque spread over several small segments.
    ///
    /// Every entry has a `payload_len` byte payload and contiguous ids, so
    /// `entries_per_segment` entries fit before each rollover.
    pub fn multi_segment_deque(
        segments: usize,
        entries_per_segment: usize,
        payload_len: usize,
    ) -> TestDeque {
        let max = segment_size_for(entries_per_segment, payload_len);
        let test_deque = TestDeque::small_segments(max);
        fill_tracked(&test_deque, segments * entries_per_segment, payload_len, 0);
        test_deque
    }

    /// Smallest segment size holding exactly `entries` entries of
    /// `payload_len` bytes with no extra header.
    pub fn segment_size_for(entries: usize, payload_len: usize) -> u64 {
        use pbd_core::segment::{entry::ENTRY_HEADER_SIZE, header::SEGMENT_HEADER_SIZE};
        (SEGMENT_HEADER_SIZE + entries * (ENTRY_HEADER_SIZE + payload_len)) as u64
    }
}
