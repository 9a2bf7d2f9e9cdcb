//! A single segment file.

use crate::error::{CoreError, CoreResult};
use crate::segment::entry::{decode_payload, EncodedEntry, EntryHeader, ENTRY_HEADER_SIZE};
use crate::segment::header::{HeaderFlags, SegmentHeader, SEGMENT_HEADER_SIZE};
use crate::segment::state::SegmentState;
use crate::segment::SegmentInfo;
use crate::types::{IdRange, SegmentId};
use bytes::Bytes;
use pbd_storage::StorageBackend;
use std::path::{Path, PathBuf};

/// What lies at an offset of a segment.
#[derive(Debug)]
pub(crate) enum Frame {
    /// A well-formed entry header whose payload fits in the file.
    Entry(EntryHeader),
    /// Clean end of the file.
    End,
    /// The remaining bytes are too short for the header or payload.
    Torn,
    /// The header cannot be valid.
    Corrupt(String),
}

/// Why a walk over a segment's frames stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WalkStop {
    /// Reached the end of the file.
    Clean,
    /// Reached the requested entry limit.
    Limit,
    /// A frame runs past the end of the file.
    Torn,
    /// A frame header is garbage.
    Corrupt(String),
    /// A payload failed verification; `tail` is set when it was the last frame.
    Checksum { tail: bool },
}

/// Result of walking frames from the start of a segment.
#[derive(Debug, Clone)]
pub(crate) struct FrameWalk {
    pub(crate) count: u32,
    pub(crate) end: u64,
    pub(crate) ids: Option<IdRange>,
    pub(crate) newest: Option<i64>,
    pub(crate) untracked: bool,
    pub(crate) stop: WalkStop,
}

/// An open segment file.
///
/// `count` and `end` describe the readable entries: every entry for a
/// writing or finalized segment, the valid prefix for a quarantined one.
pub(crate) struct Segment {
    id: SegmentId,
    path: PathBuf,
    backend: Box<dyn StorageBackend>,
    header: SegmentHeader,
    extra: Bytes,
    state: SegmentState,
    data_start: u64,
    count: u32,
    end: u64,
    file_size: u64,
    ids: Option<IdRange>,
    newest: Option<i64>,
    untracked: bool,
    outstanding: u32,
}

impl Segment {
    /// Writes the header and extra blob of a new segment.
    pub(crate) fn create(
        id: SegmentId,
        path: PathBuf,
        mut backend: Box<dyn StorageBackend>,
        prev: Option<SegmentId>,
        extra: Bytes,
        created_ms: i64,
    ) -> CoreResult<Self> {
        let header = SegmentHeader::new(&extra, created_ms, prev.map_or(0, SegmentId::as_u64));
        backend.append(&header.encode())?;
        backend.append(&extra)?;
        backend.sync()?;

        let data_start = (SEGMENT_HEADER_SIZE + extra.len()) as u64;
        Ok(Self {
            id,
            path,
            backend,
            header,
            extra,
            state: SegmentState::Writing,
            data_start,
            count: 0,
            end: data_start,
            file_size: data_start,
            ids: None,
            newest: None,
            untracked: false,
            outstanding: 0,
        })
    }

    /// Opens an existing segment, validating its header and extra blob.
    ///
    /// Entry counts start at zero; the caller walks the frames and applies
    /// the result with [`Segment::apply_walk`].
    pub(crate) fn open(
        id: SegmentId,
        path: PathBuf,
        backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let file_size = backend.size()?;
        if file_size < SEGMENT_HEADER_SIZE as u64 {
            return Err(CoreError::segment_corruption(format!(
                "{} holds {file_size} bytes, shorter than a segment header",
                path.display()
            )));
        }

        let header = SegmentHeader::decode(&backend.read_at(0, SEGMENT_HEADER_SIZE)?)?;
        let data_start = SEGMENT_HEADER_SIZE as u64 + u64::from(header.extra_len);
        if data_start > file_size {
            return Err(CoreError::segment_corruption(format!(
                "extra header of {} bytes runs past end of {}",
                header.extra_len,
                path.display()
            )));
        }
        let extra = backend.read_at(SEGMENT_HEADER_SIZE as u64, header.extra_len as usize)?;
        let actual = crc32fast::hash(&extra);
        if actual != header.extra_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: header.extra_crc,
                actual,
            });
        }

        let state = if header.is_quarantined() {
            SegmentState::Quarantined
        } else if header.is_finalized() {
            SegmentState::Finalized
        } else {
            SegmentState::Writing
        };

        Ok(Self {
            id,
            path,
            backend,
            header,
            extra: Bytes::from(extra),
            state,
            data_start,
            count: 0,
            end: data_start,
            file_size,
            ids: None,
            newest: None,
            untracked: false,
            outstanding: 0,
        })
    }

    /// Wraps a file whose header cannot be read at all.
    ///
    /// The segment is quarantined with nothing readable.
    pub(crate) fn unreadable(
        id: SegmentId,
        path: PathBuf,
        backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let file_size = backend.size()?;
        let mut header = SegmentHeader::new(&[], 0, 0);
        header.flags = HeaderFlags::QUARANTINED;
        Ok(Self {
            id,
            path,
            backend,
            header,
            extra: Bytes::new(),
            state: SegmentState::Quarantined,
            data_start: file_size,
            count: 0,
            end: file_size,
            file_size,
            ids: None,
            newest: None,
            untracked: false,
            outstanding: 0,
        })
    }

    pub(crate) fn id(&self) -> SegmentId {
        self.id
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    pub(crate) fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub(crate) fn extra(&self) -> &Bytes {
        &self.extra
    }

    pub(crate) fn state(&self) -> SegmentState {
        self.state
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.state == SegmentState::Writing
    }

    pub(crate) fn is_quarantined(&self) -> bool {
        self.state == SegmentState::Quarantined
    }

    pub(crate) fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Number of readable entries.
    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    /// Offset just past the last readable entry.
    pub(crate) fn end(&self) -> u64 {
        self.end
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.file_size
    }

    pub(crate) fn ids(&self) -> Option<IdRange> {
        self.ids
    }

    pub(crate) fn has_untracked_entries(&self) -> bool {
        self.untracked
    }

    pub(crate) fn created_ms(&self) -> i64 {
        self.header.created_ms
    }

    /// Timestamp of the newest readable entry, or the creation time.
    pub(crate) fn newest_timestamp(&self) -> i64 {
        self.newest.unwrap_or(self.header.created_ms)
    }

    pub(crate) fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub(crate) fn acquire(&mut self) {
        self.outstanding += 1;
    }

    pub(crate) fn release(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Bytes of readable entry data after `offset`.
    pub(crate) fn remaining_bytes(&self, offset: u64) -> u64 {
        self.end.saturating_sub(offset.max(self.data_start))
    }

    /// Inspects the frame starting at `offset`.
    pub(crate) fn frame_at(&self, offset: u64) -> CoreResult<Frame> {
        if offset >= self.file_size {
            return Ok(Frame::End);
        }
        if self.file_size - offset < ENTRY_HEADER_SIZE as u64 {
            return Ok(Frame::Torn);
        }

        let raw = self.backend.read_at(offset, ENTRY_HEADER_SIZE)?;
        let header = match EntryHeader::decode(&raw) {
            Ok(header) => header,
            Err(reason) => return Ok(Frame::Corrupt(reason)),
        };
        if offset + header.frame_len() > self.file_size {
            return Ok(Frame::Torn);
        }
        Ok(Frame::Entry(header))
    }

    /// Reads and verifies the payload of the entry at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the CRC or compression block is bad.
    pub(crate) fn read_payload(&self, offset: u64, header: &EntryHeader) -> CoreResult<Vec<u8>> {
        let frame = self.backend.read_at(offset, header.frame_len() as usize)?;
        decode_payload(header, &frame)
    }

    /// Walks frames from the start of the data section.
    ///
    /// With `verify` set every payload CRC is checked; otherwise only the
    /// headers are read.
    pub(crate) fn walk(&self, limit: Option<u32>, verify: bool) -> CoreResult<FrameWalk> {
        let mut walk = FrameWalk {
            count: 0,
            end: self.data_start,
            ids: None,
            newest: None,
            untracked: false,
            stop: WalkStop::Clean,
        };

        loop {
            if limit.is_some_and(|l| walk.count >= l) {
                walk.stop = WalkStop::Limit;
                return Ok(walk);
            }
            let header = match self.frame_at(walk.end)? {
                Frame::Entry(header) => header,
                Frame::End => return Ok(walk),
                Frame::Torn => {
                    walk.stop = WalkStop::Torn;
                    return Ok(walk);
                }
                Frame::Corrupt(reason) => {
                    walk.stop = WalkStop::Corrupt(reason);
                    return Ok(walk);
                }
            };
            let next = walk.end + header.frame_len();
            if verify {
                if let Err(e) = self.read_payload(walk.end, &header) {
                    if !e.is_corruption() {
                        return Err(e);
                    }
                    walk.stop = WalkStop::Checksum {
                        tail: next == self.file_size,
                    };
                    return Ok(walk);
                }
            }

            walk.count += 1;
            walk.end = next;
            walk.newest = Some(walk.newest.map_or(header.timestamp, |t| t.max(header.timestamp)));
            match header.ids {
                Some(ids) => walk.ids = Some(walk.ids.map_or(ids, |r| r.span(ids))),
                None => walk.untracked = true,
            }
        }
    }

    /// Adopts the readable entries found by a walk.
    pub(crate) fn apply_walk(&mut self, walk: &FrameWalk) {
        self.count = walk.count;
        self.end = walk.end;
        self.ids = walk.ids;
        self.newest = walk.newest;
        self.untracked = walk.untracked;
    }

    /// Returns the byte offset of entry `index`.
    pub(crate) fn offset_of(&self, index: u32) -> CoreResult<u64> {
        if index >= self.count {
            return Ok(self.end);
        }
        let walk = self.walk(Some(index), false)?;
        if walk.count < index {
            return Err(CoreError::segment_corruption(format!(
                "{} has only {} readable entries, wanted {index}",
                self.id, walk.count
            )));
        }
        Ok(walk.end)
    }

    /// Appends an encoded entry to a writing segment.
    pub(crate) fn append(&mut self, entry: &EncodedEntry) -> CoreResult<()> {
        if !self.is_writing() {
            return Err(CoreError::invariant(format!(
                "append to {} segment {}",
                self.state, self.id
            )));
        }
        self.backend.append(&entry.bytes)?;
        self.file_size += entry.bytes.len() as u64;
        self.count += 1;
        self.end = self.file_size;
        self.newest = Some(self.newest.map_or(entry.header.timestamp, |t| {
            t.max(entry.header.timestamp)
        }));
        match entry.header.ids {
            Some(ids) => self.ids = Some(self.ids.map_or(ids, |r| r.span(ids))),
            None => self.untracked = true,
        }
        Ok(())
    }

    /// Flushes and fsyncs the file.
    pub(crate) fn sync(&mut self) -> CoreResult<()> {
        self.backend.flush()?;
        self.backend.sync()?;
        Ok(())
    }

    /// Seals the segment, recording its entry count in the header.
    pub(crate) fn finalize(&mut self) -> CoreResult<()> {
        self.state = self.state.transition(SegmentState::Finalized)?;
        self.header.flags = self.header.flags.with(HeaderFlags::FINALIZED);
        self.header.entry_count = self.count;
        self.write_header()
    }

    /// Quarantines the segment keeping the first `prefix` entries readable.
    pub(crate) fn quarantine(&mut self, prefix: u32) -> CoreResult<()> {
        self.state = self.state.transition(SegmentState::Quarantined)?;
        let walk = self.walk(Some(prefix), false)?;
        self.apply_walk(&walk);
        self.header.flags = self.header.flags.with(HeaderFlags::QUARANTINED);
        self.header.entry_count = self.count;
        if self.file_size >= SEGMENT_HEADER_SIZE as u64 {
            self.write_header()?;
        }
        Ok(())
    }

    /// Cuts the file at `offset`, which must be a frame boundary, and
    /// optionally writes `replacement` as the new last entry.
    ///
    /// Works in any state; sealed segments get their header rewritten.
    pub(crate) fn replace_tail(
        &mut self,
        offset: u64,
        replacement: Option<&EncodedEntry>,
    ) -> CoreResult<()> {
        self.backend.truncate(offset)?;
        self.file_size = offset;
        if let Some(entry) = replacement {
            self.backend.append(&entry.bytes)?;
            self.file_size += entry.bytes.len() as u64;
        }
        self.sync()?;
        let walk = self.walk(None, false)?;
        self.apply_walk(&walk);
        if self.state.is_sealed() {
            self.header.entry_count = self.count;
            self.write_header()?;
        }
        Ok(())
    }

    /// Marks the segment as detached from its deque.
    pub(crate) fn mark_deletable(&mut self) -> CoreResult<()> {
        if self.is_writing() {
            self.finalize()?;
        }
        self.state = self.state.transition(SegmentState::Deletable)?;
        Ok(())
    }

    fn write_header(&mut self) -> CoreResult<()> {
        self.backend.write_at(0, &self.header.encode())?;
        self.sync()
    }

    pub(crate) fn info(&self) -> SegmentInfo {
        SegmentInfo {
            id: self.id,
            state: self.state,
            entries: self.count,
            size_bytes: self.file_size,
            ids: self.ids,
            created_ms: self.header.created_ms,
            newest_timestamp: self.newest,
            extra_header_len: self.extra.len(),
            outstanding: self.outstanding,
            path: self.path.clone(),
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("count", &self.count)
            .field("file_size", &self.file_size)
            .field("outstanding", &self.outstanding)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::entry::encode_entry;
    use pbd_storage::InMemoryBackend;

    fn new_segment(extra: &'static [u8]) -> Segment {
        Segment::create(
            SegmentId::new(7),
            PathBuf::from("q_7.pbd"),
            Box::new(InMemoryBackend::new()),
            Some(SegmentId::new(3)),
            Bytes::from_static(extra),
            1_000,
        )
        .unwrap()
    }

    fn offer(seg: &mut Segment, payload: &[u8], ids: Option<(i64, i64)>) {
        let ids = ids.map(|(s, e)| IdRange::new(s, e).unwrap());
        seg.append(&encode_entry(payload, ids, 500, false)).unwrap();
    }

    fn reopen(seg: &Segment) -> Segment {
        let data = seg.backend.read_at(0, seg.file_size as usize).unwrap();
        Segment::open(
            seg.id,
            seg.path.clone(),
            Box::new(InMemoryBackend::with_data(data)),
        )
        .unwrap()
    }

    #[test]
    fn create_writes_header_and_extra() {
        let seg = new_segment(b"extra!");
        assert_eq!(seg.data_start(), (SEGMENT_HEADER_SIZE + 6) as u64);
        assert_eq!(seg.file_size(), seg.data_start());
        assert_eq!(seg.count(), 0);
        assert!(seg.is_writing());

        let reopened = reopen(&seg);
        assert_eq!(reopened.extra().as_ref(), b"extra!");
        assert_eq!(reopened.header().prev_id, 3);
        assert_eq!(reopened.state(), SegmentState::Writing);
    }

    #[test]
    fn append_tracks_ids_and_counts() {
        let mut seg = new_segment(b"");
        offer(&mut seg, b"a", Some((1, 10)));
        offer(&mut seg, b"bb", Some((11, 12)));

        assert_eq!(seg.count(), 2);
        assert_eq!(seg.ids(), Some(IdRange::new(1, 12).unwrap()));
        assert_eq!(seg.newest_timestamp(), 500);
        assert!(!seg.has_untracked_entries());
        assert_eq!(seg.end(), seg.file_size());
    }

    #[test]
    fn finalize_records_count() {
        let mut seg = new_segment(b"");
        offer(&mut seg, b"a", None);
        offer(&mut seg, b"b", None);
        seg.finalize().unwrap();

        let reopened = reopen(&seg);
        assert!(reopened.header().is_finalized());
        assert_eq!(reopened.header().entry_count, 2);
        assert_eq!(reopened.state(), SegmentState::Finalized);

        let mut seg = seg;
        assert!(seg
            .append(&encode_entry(b"late", None, 0, false))
            .is_err());
    }

    #[test]
    fn walk_reads_frames() {
        let mut seg = new_segment(b"x");
        for i in 0..5u8 {
            offer(&mut seg, &[i; 10], None);
        }
        let reopened = reopen(&seg);
        let walk = reopened.walk(None, true).unwrap();
        assert_eq!(walk.count, 5);
        assert_eq!(walk.stop, WalkStop::Clean);
        assert_eq!(walk.end, seg.file_size());
        assert!(walk.untracked);

        let limited = reopened.walk(Some(2), false).unwrap();
        assert_eq!(limited.count, 2);
        assert_eq!(limited.stop, WalkStop::Limit);
        assert_eq!(reopened.offset_of(2).unwrap(), limited.end);
    }

    #[test]
    fn walk_detects_torn_tail() {
        let mut seg = new_segment(b"");
        offer(&mut seg, b"complete", None);
        let keep = seg.file_size();
        offer(&mut seg, b"partial write", None);

        let data = seg.backend.read_at(0, (seg.file_size() - 4) as usize).unwrap();
        let torn = Segment::open(seg.id, seg.path.clone(), Box::new(InMemoryBackend::with_data(data))).unwrap();
        let walk = torn.walk(None, true).unwrap();
        assert_eq!(walk.count, 1);
        assert_eq!(walk.end, keep);
        assert_eq!(walk.stop, WalkStop::Torn);
    }

    #[test]
    fn walk_detects_negative_length() {
        let mut seg = new_segment(b"");
        offer(&mut seg, b"one", None);
        let second = seg.file_size();
        offer(&mut seg, b"two", None);
        offer(&mut seg, b"three", None);

        seg.backend
            .write_at(second, &(-1i32).to_le_bytes())
            .unwrap();
        let walk = seg.walk(None, false).unwrap();
        assert_eq!(walk.count, 1);
        assert!(matches!(walk.stop, WalkStop::Corrupt(ref r) if r.contains("negative")));
    }

    #[test]
    fn walk_distinguishes_tail_checksum() {
        let mut seg = new_segment(b"");
        offer(&mut seg, b"one", None);
        offer(&mut seg, b"two", None);
        let last = seg.file_size() - 1;
        seg.backend.write_at(last, b"X").unwrap();

        let walk = seg.walk(None, true).unwrap();
        assert_eq!(walk.count, 1);
        assert_eq!(walk.stop, WalkStop::Checksum { tail: true });
    }

    #[test]
    fn quarantine_keeps_prefix() {
        let mut seg = new_segment(b"");
        offer(&mut seg, b"a", Some((1, 1)));
        offer(&mut seg, b"b", Some((2, 2)));
        offer(&mut seg, b"c", Some((3, 3)));
        seg.finalize().unwrap();
        seg.quarantine(2).unwrap();

        assert!(seg.is_quarantined());
        assert_eq!(seg.count(), 2);
        assert_eq!(seg.ids(), Some(IdRange::new(1, 2).unwrap()));

        let reopened = reopen(&seg);
        assert!(reopened.header().is_quarantined());
        assert_eq!(reopened.header().entry_count, 2);
    }

    #[test]
    fn truncate_drops_entries() {
        let mut seg = new_segment(b"");
        offer(&mut seg, b"a", Some((1, 1)));
        let cut = seg.file_size();
        offer(&mut seg, b"b", Some((2, 2)));
        seg.finalize().unwrap();

        seg.replace_tail(cut, None).unwrap();
        assert_eq!(seg.count(), 1);
        assert_eq!(seg.ids(), Some(IdRange::new(1, 1).unwrap()));
        assert_eq!(reopen(&seg).header().entry_count, 1);
    }

    #[test]
    fn replace_tail_in_sealed_segment() {
        let mut seg = new_segment(b"");
        offer(&mut seg, b"a", Some((1, 1)));
        let cut = seg.file_size();
        offer(&mut seg, b"long payload", Some((2, 9)));
        seg.finalize().unwrap();

        let shorter = encode_entry(b"short", Some(IdRange::new(2, 4).unwrap()), 500, false);
        seg.replace_tail(cut, Some(&shorter)).unwrap();
        assert_eq!(seg.count(), 2);
        assert_eq!(seg.ids(), Some(IdRange::new(1, 4).unwrap()));

        let reopened = reopen(&seg);
        assert_eq!(reopened.header().entry_count, 2);
        let walk = reopened.walk(None, true).unwrap();
        assert_eq!(walk.stop, WalkStop::Clean);
        assert_eq!(walk.count, 2);
    }

    #[test]
    fn outstanding_counter() {
        let mut seg = new_segment(b"");
        seg.acquire();
        seg.acquire();
        seg.release();
        assert_eq!(seg.outstanding(), 1);
        seg.release();
        seg.release();
        assert_eq!(seg.outstanding(), 0);
    }
}
