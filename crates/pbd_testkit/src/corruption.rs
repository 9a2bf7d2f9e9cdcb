//! On-disk damage for recovery tests.
//!
//! These helpers edit segment files directly, simulating torn writes,
//! bit rot and crashes before a segment was sealed. They must only be used
//! while no deque has the directory open.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pbd_testkit::prelude::*;
//!
//! let test_deque = scenarios::tracked_deque(10, 16, 0);
//! let test_deque = test_deque.reopen_after(|dir, nonce| {
//!     let path = &segment_files(dir, nonce)[0];
//!     corrupt_entry_length(path, 4, -1);
//! });
//! ```

use pbd_core::segment::entry::ENTRY_HEADER_SIZE;
use pbd_core::segment::header::{HeaderFlags, SegmentHeader, SEGMENT_HEADER_SIZE};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Paths of the segment files of `nonce` in `dir`, oldest first.
pub fn segment_files(dir: &Path, nonce: &str) -> Vec<PathBuf> {
    pbd_core::dir::list_segment_files(dir, nonce)
        .expect("Failed to list segment files")
        .into_iter()
        .map(|f| f.path)
        .collect()
}

/// Decodes the header of a segment file.
pub fn read_header(path: &Path) -> SegmentHeader {
    let raw = fs::read(path).expect("Failed to read segment");
    SegmentHeader::decode(&raw[..SEGMENT_HEADER_SIZE]).expect("Failed to decode segment header")
}

/// Byte offsets of every entry frame in a segment, in file order.
///
/// Walks the stored lengths only; checksums are not verified. Stops at the
/// first frame that does not fit in the file.
pub fn entry_offsets(path: &Path) -> Vec<u64> {
    let raw = fs::read(path).expect("Failed to read segment");
    let header = SegmentHeader::decode(&raw[..SEGMENT_HEADER_SIZE])
        .expect("Failed to decode segment header");
    let mut offset = SEGMENT_HEADER_SIZE + header.extra_len as usize;
    let mut offsets = Vec::new();
    while offset + ENTRY_HEADER_SIZE <= raw.len() {
        let stored = i32::from_le_bytes([
            raw[offset],
            raw[offset + 1],
            raw[offset + 2],
            raw[offset + 3],
        ]);
        if stored < 0 {
            break;
        }
        let end = offset + ENTRY_HEADER_SIZE + stored as usize;
        if end > raw.len() {
            break;
        }
        offsets.push(offset as u64);
        offset = end;
    }
    offsets
}

/// Overwrites bytes at `offset`.
pub fn poke(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .expect("Failed to open segment for writing");
    file.seek(SeekFrom::Start(offset)).expect("Failed to seek");
    file.write_all(bytes).expect("Failed to write");
    file.sync_all().expect("Failed to sync");
}

/// Sets the stored length of entry `index` to `value`.
pub fn corrupt_entry_length(path: &Path, index: usize, value: i32) {
    let offset = entry_offset(path, index);
    poke(path, offset, &value.to_le_bytes());
}

/// Inverts the first payload byte of entry `index`.
///
/// The entry keeps its framing, so only the checksum notices.
pub fn flip_payload_byte(path: &Path, index: usize) {
    let offset = entry_offset(path, index) + ENTRY_HEADER_SIZE as u64;
    let raw = fs::read(path).expect("Failed to read segment");
    let byte = *raw
        .get(offset as usize)
        .expect("Entry has an empty payload");
    poke(path, offset, &[byte ^ 0xFF]);
}

/// Cuts `bytes` off the end of the file.
pub fn tear_tail(path: &Path, bytes: u64) {
    let len = fs::metadata(path).expect("Failed to stat segment").len();
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .expect("Failed to open segment for writing");
    file.set_len(len.saturating_sub(bytes))
        .expect("Failed to truncate segment");
    file.sync_all().expect("Failed to sync");
}

/// Makes a sealed segment look like it was still being written when the
/// process died.
pub fn unseal(path: &Path) {
    let mut header = read_header(path);
    header.flags = HeaderFlags::from_bits(header.flags.bits() & !HeaderFlags::FINALIZED.bits());
    header.entry_count = 0;
    poke(path, 0, &header.encode());
}

/// Appends raw garbage after the last entry.
pub fn append_garbage(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .expect("Failed to open segment for appending");
    file.write_all(bytes).expect("Failed to write");
    file.sync_all().expect("Failed to sync");
}

fn entry_offset(path: &Path, index: usize) -> u64 {
    let offsets = entry_offsets(path);
    *offsets.get(index).unwrap_or_else(|| {
        panic!(
            "segment {} has {} entries, wanted index {index}",
            path.display(),
            offsets.len()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::scenarios;

    #[test]
    fn test_entry_offsets_follow_framing() {
        let test_deque = scenarios::tracked_deque(3, 10, 0);
        test_deque.close().unwrap();
        let path = &test_deque.segment_files()[0];
        let frame = (ENTRY_HEADER_SIZE + 10) as u64;
        let start = SEGMENT_HEADER_SIZE as u64;
        assert_eq!(
            entry_offsets(path),
            vec![start, start + frame, start + 2 * frame]
        );
    }

    #[test]
    fn test_unseal_clears_finalized() {
        let test_deque = scenarios::tracked_deque(2, 4, 0);
        test_deque.close().unwrap();
        let path = &test_deque.segment_files()[0];
        assert!(read_header(path).is_finalized());
        unseal(path);
        let header = read_header(path);
        assert!(!header.is_finalized());
        assert_eq!(header.entry_count, 0);
    }

    #[test]
    fn test_tear_tail_shortens_file() {
        let test_deque = scenarios::tracked_deque(2, 4, 0);
        test_deque.close().unwrap();
        let path = &test_deque.segment_files()[0];
        let before = fs::metadata(path).unwrap().len();
        tear_tail(path, 3);
        assert_eq!(fs::metadata(path).unwrap().len(), before - 3);
        assert_eq!(entry_offsets(path).len(), 1);
    }
}
