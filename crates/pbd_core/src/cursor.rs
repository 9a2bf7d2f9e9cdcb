//! Named read cursors and polled entries.
//!
//! A cursor position is `(segment, entry index, byte offset)`. A position
//! without a segment means "start of the oldest segment"; a position naming
//! a segment that no longer exists resolves to the start of the next one.
//!
//! Durable positions are persisted when a cursor crosses a segment
//! boundary, seeks, skips, is closed or dropped, and on `sync`. After a
//! crash a durable cursor resumes from the start of the segment it was
//! reading, so delivery is at-least-once.
//!
//! Cursor file layout:
//!
//! ```text
//! | magic "PBDC" | version u16 | count u32 |
//! | name_len u16 | name | has_segment u8 | segment u64 | index u32 | ... |
//! | crc32 u32 |
//! ```

use crate::deque::{close_cursor, IdMode, Inner, Shared};
use crate::error::{CoreError, CoreResult};
use crate::segment::{Frame, Segment, SegmentInfo};
use crate::types::{IdRange, SegmentId};
use bytes::Bytes;
use std::ops::Bound;
use std::sync::Arc;
use tracing::warn;

const CURSOR_MAGIC: &[u8; 4] = b"PBDC";
const CURSOR_VERSION: u16 = 1;

/// What `seek_to_segment` does when no segment contains the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekErrorRule {
    /// Move to the nearest segment holding smaller ids.
    SeekBefore,
    /// Move to the nearest segment holding larger ids.
    SeekAfter,
    /// Fail with `NoSuchOffset`.
    Throw,
}

/// A durable cursor position as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedCursor {
    /// Cursor name.
    pub name: String,
    /// Segment being read; `None` for the start of the deque.
    pub segment: Option<SegmentId>,
    /// Index of the next entry inside `segment`.
    pub index: u32,
}

/// Encodes the cursor table.
#[must_use]
pub fn encode_cursors(cursors: &[PersistedCursor]) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + cursors.len() * 32);
    out.extend_from_slice(CURSOR_MAGIC);
    out.extend_from_slice(&CURSOR_VERSION.to_le_bytes());
    out.extend_from_slice(&(cursors.len() as u32).to_le_bytes());
    for cursor in cursors {
        let name = cursor.name.as_bytes();
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        out.push(u8::from(cursor.segment.is_some()));
        out.extend_from_slice(&cursor.segment.map_or(0, SegmentId::as_u64).to_le_bytes());
        out.extend_from_slice(&cursor.index.to_le_bytes());
    }
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Decodes the cursor table.
///
/// # Errors
///
/// `ChecksumMismatch` or `SegmentCorruption` for damaged files,
/// `InvalidFormat` for an unknown version.
pub fn decode_cursors(data: &[u8]) -> CoreResult<Vec<PersistedCursor>> {
    if data.len() < 14 {
        return Err(CoreError::segment_corruption("cursor file too short"));
    }
    let (body, crc) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }
    if &body[..4] != CURSOR_MAGIC {
        return Err(CoreError::segment_corruption("bad cursor file magic"));
    }
    let version = u16::from_le_bytes([body[4], body[5]]);
    if version != CURSOR_VERSION {
        return Err(CoreError::invalid_format(format!(
            "unsupported cursor file version {version}"
        )));
    }

    let count = u32::from_le_bytes([body[6], body[7], body[8], body[9]]);
    let mut reader = Reader {
        data: body,
        pos: 10,
    };
    let mut cursors = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let len = u16::from_le_bytes(reader.take::<2>()?) as usize;
        let name = reader.slice(len)?;
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| CoreError::segment_corruption("cursor name is not UTF-8"))?;
        let has_segment = reader.take::<1>()?[0] != 0;
        let segment = u64::from_le_bytes(reader.take::<8>()?);
        let index = u32::from_le_bytes(reader.take::<4>()?);
        cursors.push(PersistedCursor {
            name,
            segment: has_segment.then_some(SegmentId::new(segment)),
            index,
        });
    }
    if reader.pos != body.len() {
        return Err(CoreError::segment_corruption("trailing bytes in cursor file"));
    }
    Ok(cursors)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn slice(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(CoreError::segment_corruption("cursor file truncated"));
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(N)?);
        Ok(out)
    }
}

/// A cursor position inside the segment map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Position {
    pub(crate) segment: Option<SegmentId>,
    pub(crate) index: u32,
    pub(crate) offset: u64,
}

impl Position {
    /// Start of the oldest segment.
    pub(crate) const HEAD: Self = Self {
        segment: None,
        index: 0,
        offset: 0,
    };

    pub(crate) const fn at(segment: SegmentId, index: u32, offset: u64) -> Self {
        Self {
            segment: Some(segment),
            index,
            offset,
        }
    }
}

/// Book-keeping for one named cursor.
#[derive(Debug, Clone)]
pub(crate) struct CursorState {
    pub(crate) transient: bool,
    /// A handle is open; durable cursors stay in the table while detached.
    pub(crate) attached: bool,
    pub(crate) position: Position,
}

impl CursorState {
    pub(crate) const fn new(transient: bool) -> Self {
        Self {
            transient,
            attached: true,
            position: Position::HEAD,
        }
    }
}

/// An entry taken from a segment by `poll`.
pub(crate) struct Polled {
    payload: Bytes,
    ids: Option<IdRange>,
    timestamp: i64,
    extra: Bytes,
    segment: SegmentId,
}

impl Inner {
    /// Resolves a position to `(segment, index, offset)` of an existing
    /// segment, or `None` if there is nothing to read from.
    pub(crate) fn resolve(&self, position: Position) -> Option<(SegmentId, u32, u64)> {
        match position.segment {
            None => self
                .segments
                .first_key_value()
                .map(|(id, seg)| (*id, 0, seg.data_start())),
            Some(id) if self.segments.contains_key(&id) => {
                Some((id, position.index, position.offset))
            }
            Some(id) => self
                .segments
                .range(id..)
                .next()
                .map(|(id, seg)| (*id, 0, seg.data_start())),
        }
    }

    /// Whether `position` lies beyond the last entry of `segment`.
    pub(crate) fn is_past(&self, position: Position, segment: SegmentId) -> bool {
        let Some((id, index, _)) = self.resolve(position) else {
            return true;
        };
        match id.cmp(&segment) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self
                .segments
                .get(&id)
                .is_some_and(|seg| !seg.is_writing() && index >= seg.count()),
        }
    }

    fn next_segment_start(&self, id: SegmentId) -> Option<Position> {
        self.segments
            .range((Bound::Excluded(id), Bound::Unbounded))
            .next()
            .map(|(next, seg)| Position::at(*next, 0, seg.data_start()))
    }

    /// Durable cursor positions in their on-disk form.
    pub(crate) fn persisted_cursors(&self) -> Vec<PersistedCursor> {
        self.cursors
            .iter()
            .filter(|(_, cursor)| !cursor.transient)
            .map(|(name, cursor)| {
                let (segment, index) = match cursor.position.segment {
                    None => (None, 0),
                    Some(_) => match self.resolve(cursor.position) {
                        Some((id, index, _)) => (Some(id), index),
                        None => (cursor.position.segment, 0),
                    },
                };
                PersistedCursor {
                    name: name.clone(),
                    segment,
                    index,
                }
            })
            .collect()
    }

    /// Loads persisted cursors as detached durable cursors.
    pub(crate) fn restore_cursors(&mut self, persisted: Vec<PersistedCursor>) {
        for cursor in persisted {
            let position = match cursor.segment {
                None => Position::HEAD,
                Some(id) => match self.segments.get(&id) {
                    Some(seg) => {
                        let index = cursor.index.min(seg.count());
                        match seg.offset_of(index) {
                            Ok(offset) => Position::at(id, index, offset),
                            Err(e) => {
                                warn!(cursor = %cursor.name, segment = %id, error = %e,
                                    "cursor position unreadable, restarting segment");
                                Position::at(id, 0, seg.data_start())
                            }
                        }
                    }
                    None => Position::at(id, 0, 0),
                },
            };
            self.cursors.insert(
                cursor.name,
                CursorState {
                    transient: false,
                    attached: false,
                    position,
                },
            );
        }
    }

    /// Records that cursor `name` moved; durable cursors persist and may
    /// free segments.
    fn after_move(&mut self, shared: &Shared, name: &str) -> CoreResult<Vec<Segment>> {
        if self.cursor(name)?.transient {
            return Ok(Vec::new());
        }
        shared.save_cursors(self)?;
        self.collect_deletable(shared)
    }

    /// Takes the next entry for cursor `name`.
    pub(crate) fn poll(
        &mut self,
        shared: &Shared,
        name: &str,
        max_size: Option<u64>,
    ) -> CoreResult<(Option<Polled>, Vec<Segment>)> {
        let mut detached = Vec::new();
        loop {
            let position = self.cursor(name)?.position;
            let Some((id, index, offset)) = self.resolve(position) else {
                return Ok((None, detached));
            };
            let seg = self
                .segments
                .get(&id)
                .ok_or_else(|| CoreError::invariant(format!("cursor points at missing {id}")))?;

            if index >= seg.count() {
                match self.next_segment_start(id) {
                    Some(next) => {
                        self.cursor_mut(name)?.position = next;
                        detached.extend(self.after_move(shared, name)?);
                        continue;
                    }
                    None => {
                        self.cursor_mut(name)?.position = Position::at(id, index, offset);
                        return Ok((None, detached));
                    }
                }
            }

            let header = match seg.frame_at(offset)? {
                Frame::Entry(header) => header,
                Frame::Corrupt(reason) => {
                    self.quarantine_at(shared, id, index, &reason)?;
                    continue;
                }
                Frame::End | Frame::Torn => {
                    self.quarantine_at(shared, id, index, "entry runs past end of segment")?;
                    continue;
                }
            };
            if max_size.is_some_and(|max| u64::from(header.logical_len) > max) {
                self.cursor_mut(name)?.position = Position::at(id, index, offset);
                return Ok((None, detached));
            }
            let payload = match seg.read_payload(offset, &header) {
                Ok(payload) => payload,
                Err(e) if e.is_corruption() => {
                    self.quarantine_at(shared, id, index, &e.to_string())?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let extra = seg.extra().clone();

            if let Some(seg) = self.segments.get_mut(&id) {
                seg.acquire();
            }
            self.cursor_mut(name)?.position =
                Position::at(id, index + 1, offset + header.frame_len());
            shared.stats.record_poll(payload.len() as u64);
            let polled = Polled {
                payload: Bytes::from(payload),
                ids: header.ids,
                timestamp: header.timestamp,
                extra,
                segment: id,
            };
            return Ok((Some(polled), detached));
        }
    }

    /// Moves cursor `name` past every entry starting at or before `id`.
    pub(crate) fn skip_past(
        &mut self,
        shared: &Shared,
        name: &str,
        id: i64,
    ) -> CoreResult<Vec<Segment>> {
        match self.id_mode {
            IdMode::Untracked => {
                return Err(CoreError::invalid_operation("deque does not track ids"))
            }
            IdMode::Unknown => return Ok(Vec::new()),
            IdMode::Tracked => {}
        }

        loop {
            let position = self.cursor(name)?.position;
            let Some((seg_id, index, offset)) = self.resolve(position) else {
                break;
            };
            let seg = self
                .segments
                .get(&seg_id)
                .ok_or_else(|| CoreError::invariant(format!("cursor points at missing {seg_id}")))?;

            if index >= seg.count() {
                match self.next_segment_start(seg_id) {
                    Some(next) => {
                        self.cursor_mut(name)?.position = next;
                        continue;
                    }
                    None => break,
                }
            }
            if seg.ids().is_some_and(|r| r.end <= id) {
                let end = Position::at(seg_id, seg.count(), seg.end());
                self.cursor_mut(name)?.position = end;
                continue;
            }
            match seg.frame_at(offset)? {
                Frame::Entry(header) => {
                    if !header.ids.is_some_and(|r| r.start <= id) {
                        break;
                    }
                    self.cursor_mut(name)?.position =
                        Position::at(seg_id, index + 1, offset + header.frame_len());
                }
                Frame::Corrupt(reason) => self.quarantine_at(shared, seg_id, index, &reason)?,
                Frame::End | Frame::Torn => {
                    self.quarantine_at(shared, seg_id, index, "entry runs past end of segment")?;
                }
            }
        }
        self.after_move(shared, name)
    }

    /// Positions cursor `name` at the start of the segment holding `id`.
    pub(crate) fn seek_to_segment(
        &mut self,
        shared: &Shared,
        name: &str,
        id: i64,
        rule: SeekErrorRule,
    ) -> CoreResult<Vec<Segment>> {
        self.cursor(name)?;
        let candidates: Vec<(IdRange, Position)> = self
            .segments
            .values()
            .filter(|seg| !seg.is_quarantined() && seg.count() > 0)
            .filter_map(|seg| {
                seg.ids()
                    .map(|r| (r, Position::at(seg.id(), 0, seg.data_start())))
            })
            .collect();

        let target = candidates
            .iter()
            .find(|(range, _)| range.contains(id))
            .or_else(|| match rule {
                SeekErrorRule::Throw => None,
                SeekErrorRule::SeekBefore => candidates.iter().rev().find(|(r, _)| r.end < id),
                SeekErrorRule::SeekAfter => candidates.iter().find(|(r, _)| r.start > id),
            })
            .map(|(_, position)| *position)
            .ok_or(CoreError::NoSuchOffset { id })?;

        self.cursor_mut(name)?.position = target;
        self.after_move(shared, name)
    }

    /// Entries and bytes left for cursor `name`.
    pub(crate) fn remaining(&self, name: &str) -> CoreResult<(u64, u64)> {
        let position = self.cursor(name)?.position;
        let Some((id, index, offset)) = self.resolve(position) else {
            return Ok((0, 0));
        };
        let mut entries = 0u64;
        let mut bytes = 0u64;
        for (seg_id, seg) in self.segments.range(id..) {
            if *seg_id == id {
                entries += u64::from(seg.count().saturating_sub(index));
                bytes += seg.remaining_bytes(offset);
            } else {
                entries += u64::from(seg.count());
                bytes += seg.remaining_bytes(seg.data_start());
            }
        }
        Ok((entries, bytes))
    }
}

/// A handle on one named cursor.
///
/// Dropping the handle keeps a durable cursor's position for the next
/// [`open_for_read`](crate::BinaryDeque::open_for_read); a transient cursor
/// is forgotten.
pub struct ReadCursor {
    shared: Arc<Shared>,
    name: String,
    closed: bool,
}

impl ReadCursor {
    pub(crate) fn new(shared: Arc<Shared>, name: String) -> Self {
        Self {
            shared,
            name,
            closed: false,
        }
    }

    /// Returns the cursor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks whether the cursor blocks segment deletion.
    ///
    /// # Errors
    ///
    /// `CursorNotFound` once the cursor was closed.
    pub fn is_transient(&self) -> CoreResult<bool> {
        Ok(self.shared.lock_open()?.cursor(&self.name)?.transient)
    }

    /// Takes the next entry, or `None` at the end of the deque.
    ///
    /// # Errors
    ///
    /// `DequeClosed`, `CursorNotFound`, or I/O errors. Corrupt entries do
    /// not fail the call; their segment is quarantined and reading
    /// continues with the next segment.
    pub fn poll(&self) -> CoreResult<Option<PolledEntry>> {
        self.poll_inner(None)
    }

    /// Takes the next entry if its payload is at most `max_size` bytes.
    ///
    /// Returns `None` without consuming anything when the next entry is
    /// larger.
    ///
    /// # Errors
    ///
    /// See [`poll`](Self::poll).
    pub fn poll_entry(&self, max_size: u64) -> CoreResult<Option<PolledEntry>> {
        self.poll_inner(Some(max_size))
    }

    fn poll_inner(&self, max_size: Option<u64>) -> CoreResult<Option<PolledEntry>> {
        let (polled, detached) = {
            let mut inner = self.shared.lock_open()?;
            inner.poll(&self.shared, &self.name, max_size)?
        };
        self.shared.dispose(detached, true);
        Ok(polled.map(|p| PolledEntry {
            shared: Arc::clone(&self.shared),
            payload: p.payload,
            ids: p.ids,
            timestamp: p.timestamp,
            extra: p.extra,
            segment: p.segment,
        }))
    }

    /// Checks whether nothing is left to read.
    ///
    /// # Errors
    ///
    /// `DequeClosed` or `CursorNotFound`.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.num_objects()? == 0)
    }

    /// Number of entries left to read.
    ///
    /// # Errors
    ///
    /// `DequeClosed` or `CursorNotFound`.
    pub fn num_objects(&self) -> CoreResult<u64> {
        Ok(self.shared.lock_open()?.remaining(&self.name)?.0)
    }

    /// Encoded bytes left to read, entry framing included.
    ///
    /// # Errors
    ///
    /// `DequeClosed` or `CursorNotFound`.
    pub fn size_in_bytes(&self) -> CoreResult<u64> {
        Ok(self.shared.lock_open()?.remaining(&self.name)?.1)
    }

    /// Skips every entry whose id range starts at or before `id`.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` on deques that do not track ids.
    pub fn skip_past(&self, id: i64) -> CoreResult<()> {
        let detached = {
            let mut inner = self.shared.lock_open()?;
            inner.skip_past(&self.shared, &self.name, id)?
        };
        self.shared.dispose(detached, true);
        Ok(())
    }

    /// Moves to the start of the segment whose id range contains `id`.
    ///
    /// Quarantined and empty segments are never seek targets.
    ///
    /// # Errors
    ///
    /// `NoSuchOffset` if no segment qualifies under `rule`.
    pub fn seek_to_segment(&self, id: i64, rule: SeekErrorRule) -> CoreResult<()> {
        let detached = {
            let mut inner = self.shared.lock_open()?;
            inner.seek_to_segment(&self.shared, &self.name, id, rule)?
        };
        self.shared.dispose(detached, true);
        Ok(())
    }

    /// Describes the segment the next poll reads from.
    ///
    /// # Errors
    ///
    /// `DequeClosed` or `CursorNotFound`.
    pub fn current_segment(&self) -> CoreResult<Option<SegmentInfo>> {
        let inner = self.shared.lock_open()?;
        let position = inner.cursor(&self.name)?.position;
        Ok(inner
            .resolve(position)
            .and_then(|(id, _, _)| inner.segments.get(&id))
            .map(Segment::info))
    }

    /// Closes the cursor, forgetting its position.
    ///
    /// See [`BinaryDeque::close_cursor`](crate::BinaryDeque::close_cursor).
    ///
    /// # Errors
    ///
    /// `DequeClosed` or `CursorNotFound`.
    pub fn close(mut self, purge_if_last: bool) -> CoreResult<()> {
        self.closed = true;
        close_cursor(&self.shared, &self.name, purge_if_last)
    }
}

impl Drop for ReadCursor {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return;
        }
        let Some(cursor) = inner.cursors.get_mut(&self.name) else {
            return;
        };
        if cursor.transient {
            inner.cursors.remove(&self.name);
            return;
        }
        cursor.attached = false;
        if let Err(e) = self.shared.save_cursors(&inner) {
            warn!(cursor = %self.name, error = %e, "failed to persist cursor position");
        }
    }
}

impl std::fmt::Debug for ReadCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCursor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// An entry returned by a cursor.
///
/// The segment it came from stays on disk until the entry is dropped or
/// [`discard`](Self::discard)ed.
pub struct PolledEntry {
    shared: Arc<Shared>,
    payload: Bytes,
    ids: Option<IdRange>,
    timestamp: i64,
    extra: Bytes,
    segment: SegmentId,
}

impl PolledEntry {
    /// The payload, decompressed.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The id range, for deques that track ids.
    #[must_use]
    pub fn ids(&self) -> Option<IdRange> {
        self.ids
    }

    /// Offer time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Extra header of the segment holding the entry.
    #[must_use]
    pub fn extra_header(&self) -> &Bytes {
        &self.extra
    }

    /// The segment holding the entry.
    #[must_use]
    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    /// Releases the entry.
    pub fn discard(self) {}
}

impl Drop for PolledEntry {
    fn drop(&mut self) {
        self.shared.release_buffer(self.segment);
    }
}

impl std::fmt::Debug for PolledEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolledEntry")
            .field("segment", &self.segment)
            .field("len", &self.payload.len())
            .field("ids", &self.ids)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DequeConfig;
    use crate::BinaryDeque;
    use tempfile::tempdir;

    fn tracked(dir: &std::path::Path, per_segment: i64, segments: i64) -> BinaryDeque {
        let deque = BinaryDeque::open(dir, "q").unwrap();
        let mut next = 0;
        for s in 0..segments {
            if s > 0 {
                deque.update_extra_header(Bytes::new()).unwrap();
            }
            for _ in 0..per_segment {
                deque.offer_with_ids(b"entry", next, next + 9).unwrap();
                next += 10;
            }
            // Leave a hole of 100 ids between segments.
            next += 100;
        }
        deque
    }

    #[test]
    fn cursor_codec_rejects_damage() {
        let cursors = vec![PersistedCursor {
            name: "a".into(),
            segment: Some(SegmentId::new(5)),
            index: 2,
        }];
        let mut data = encode_cursors(&cursors);
        assert_eq!(decode_cursors(&data).unwrap(), cursors);

        data[8] ^= 1;
        assert!(decode_cursors(&data).unwrap_err().is_corruption());
        assert!(decode_cursors(b"short").is_err());
        assert!(decode_cursors(&encode_cursors(&[])).unwrap().is_empty());
    }

    #[test]
    fn cursors_are_independent() {
        let temp = tempdir().unwrap();
        let deque = BinaryDeque::open(temp.path(), "q").unwrap();
        for i in 0..5u8 {
            deque.offer(&[i]).unwrap();
        }
        let a = deque.open_for_read("a", false).unwrap();
        let b = deque.open_for_read("b", true).unwrap();

        assert_eq!(a.poll().unwrap().unwrap().payload().as_ref(), &[0]);
        assert_eq!(a.poll().unwrap().unwrap().payload().as_ref(), &[1]);
        assert_eq!(b.poll().unwrap().unwrap().payload().as_ref(), &[0]);
        assert_eq!(a.num_objects().unwrap(), 3);
        assert_eq!(b.num_objects().unwrap(), 4);
    }

    #[test]
    fn cursor_sees_entries_offered_later() {
        let temp = tempdir().unwrap();
        let deque = BinaryDeque::open(temp.path(), "q").unwrap();
        let cursor = deque.open_for_read("r", true).unwrap();
        assert!(cursor.poll().unwrap().is_none());

        deque.offer(b"late").unwrap();
        assert_eq!(cursor.poll().unwrap().unwrap().payload().as_ref(), b"late");
    }

    #[test]
    fn poll_entry_respects_max_size() {
        let temp = tempdir().unwrap();
        let deque = BinaryDeque::open(temp.path(), "q").unwrap();
        deque.offer(&[0u8; 50]).unwrap();
        let cursor = deque.open_for_read("r", true).unwrap();

        assert!(cursor.poll_entry(49).unwrap().is_none());
        assert_eq!(cursor.num_objects().unwrap(), 1);
        assert_eq!(cursor.poll_entry(50).unwrap().unwrap().payload().len(), 50);
    }

    #[test]
    fn size_in_bytes_counts_frames() {
        let temp = tempdir().unwrap();
        let deque = BinaryDeque::open(temp.path(), "q").unwrap();
        let written = deque.offer(&[0u8; 10]).unwrap() + deque.offer(&[0u8; 20]).unwrap();
        let cursor = deque.open_for_read("r", true).unwrap();
        assert_eq!(cursor.size_in_bytes().unwrap(), written as u64);
        cursor.poll().unwrap();
        assert_eq!(
            cursor.size_in_bytes().unwrap(),
            (20 + crate::segment::entry::ENTRY_HEADER_SIZE) as u64
        );
    }

    #[test]
    fn compressed_entries_read_back() {
        let temp = tempdir().unwrap();
        let config = DequeConfig::default().compression(true);
        let deque = BinaryDeque::open_with_config(temp.path(), "q", config).unwrap();
        let payload = vec![b'z'; 8192];
        let written = deque.offer(&payload).unwrap();
        assert!(written < payload.len());

        let cursor = deque.open_for_read("r", true).unwrap();
        assert_eq!(cursor.poll().unwrap().unwrap().payload().as_ref(), payload.as_slice());
    }

    #[test]
    fn opening_twice_fails() {
        let temp = tempdir().unwrap();
        let deque = BinaryDeque::open(temp.path(), "q").unwrap();
        let _a = deque.open_for_read("a", false).unwrap();
        assert!(matches!(
            deque.open_for_read("a", false),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn dropped_durable_cursor_resumes() {
        let temp = tempdir().unwrap();
        let deque = BinaryDeque::open(temp.path(), "q").unwrap();
        for i in 0..3u8 {
            deque.offer(&[i]).unwrap();
        }
        {
            let cursor = deque.open_for_read("a", false).unwrap();
            cursor.poll().unwrap();
        }
        let cursor = deque.open_for_read("a", false).unwrap();
        assert_eq!(cursor.poll().unwrap().unwrap().payload().as_ref(), &[1]);
        assert!(matches!(
            deque.open_for_read("a", true),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn dropped_transient_cursor_is_forgotten() {
        let temp = tempdir().unwrap();
        let deque = BinaryDeque::open(temp.path(), "q").unwrap();
        deque.offer(b"x").unwrap();
        {
            let cursor = deque.open_for_read("t", true).unwrap();
            cursor.poll().unwrap();
        }
        let cursor = deque.open_for_read("t", true).unwrap();
        assert_eq!(cursor.num_objects().unwrap(), 1);
    }

    #[test]
    fn closed_cursor_handles_fail() {
        let temp = tempdir().unwrap();
        let deque = BinaryDeque::open(temp.path(), "q").unwrap();
        let cursor = deque.open_for_read("a", false).unwrap();
        deque.close_cursor("a", false).unwrap();
        assert!(matches!(cursor.poll(), Err(CoreError::CursorNotFound { .. })));
        assert!(matches!(
            deque.close_cursor("a", false),
            Err(CoreError::CursorNotFound { .. })
        ));
    }

    #[test]
    fn seek_and_skip() {
        let temp = tempdir().unwrap();
        // Segments hold ids 0..=29, 130..=159 and 260..=289.
        let deque = tracked(temp.path(), 3, 3);
        let cursor = deque.open_for_read("r", true).unwrap();

        cursor.seek_to_segment(145, SeekErrorRule::Throw).unwrap();
        assert_eq!(cursor.poll().unwrap().unwrap().ids().unwrap().start, 130);

        assert!(matches!(
            cursor.seek_to_segment(100, SeekErrorRule::Throw),
            Err(CoreError::NoSuchOffset { id: 100 })
        ));
        cursor.seek_to_segment(100, SeekErrorRule::SeekBefore).unwrap();
        assert_eq!(cursor.poll().unwrap().unwrap().ids().unwrap().start, 0);
        cursor.seek_to_segment(100, SeekErrorRule::SeekAfter).unwrap();
        assert_eq!(cursor.poll().unwrap().unwrap().ids().unwrap().start, 130);
        assert!(cursor.seek_to_segment(1000, SeekErrorRule::SeekAfter).is_err());

        cursor.seek_to_segment(0, SeekErrorRule::Throw).unwrap();
        cursor.skip_past(15).unwrap();
        assert_eq!(cursor.poll().unwrap().unwrap().ids().unwrap().start, 20);
        cursor.skip_past(200).unwrap();
        assert_eq!(cursor.poll().unwrap().unwrap().ids().unwrap().start, 260);
    }

    #[test]
    fn seek_on_empty_deque_fails() {
        let temp = tempdir().unwrap();
        let deque = BinaryDeque::open(temp.path(), "q").unwrap();
        let cursor = deque.open_for_read("r", true).unwrap();
        for rule in [SeekErrorRule::SeekBefore, SeekErrorRule::SeekAfter, SeekErrorRule::Throw] {
            assert!(matches!(
                cursor.seek_to_segment(5, rule),
                Err(CoreError::NoSuchOffset { id: 5 })
            ));
        }
    }

    #[test]
    fn skip_past_needs_ids() {
        let temp = tempdir().unwrap();
        let deque = BinaryDeque::open(temp.path(), "q").unwrap();
        deque.offer(b"plain").unwrap();
        let cursor = deque.open_for_read("r", true).unwrap();
        assert!(matches!(
            cursor.skip_past(3),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn current_segment_follows_reads() {
        let temp = tempdir().unwrap();
        let deque = tracked(temp.path(), 1, 2);
        let cursor = deque.open_for_read("r", true).unwrap();
        let segments = deque.segments().unwrap();

        assert_eq!(cursor.current_segment().unwrap().unwrap().id, segments[0].id);
        cursor.poll().unwrap();
        cursor.poll().unwrap();
        assert_eq!(cursor.current_segment().unwrap().unwrap().id, segments[1].id);
    }
}
