//! Open-time recovery, entry scanning and truncation.
//!
//! Recovery classifies each segment file:
//!
//! ```text
//! header unreadable ──► newest and shorter than a header? remove : quarantine (empty)
//! quarantined       ──► keep the recorded readable prefix
//! finalized         ──► count and framing must match, else quarantine prefix
//! writing           ──► torn tail: truncate + finalize
//!                       damage before the tail: quarantine prefix
//! ```
//!
//! Every surviving segment ends up sealed; the caller then creates a fresh
//! write segment.

use crate::deque::{Inner, Shared};
use crate::dir::{remove_segment_file, DequeDir, SegmentFile};
use crate::error::{CoreError, CoreResult};
use crate::segment::entry::encode_entry;
use crate::segment::header::SEGMENT_HEADER_SIZE;
use crate::segment::{Frame, Segment, SegmentState, WalkStop};
use crate::stats::DequeStats;
use crate::types::{IdRange, SegmentId};
use bytes::Bytes;
use pbd_storage::{FileBackend, StorageBackend};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// One entry as seen by a scanner or truncator.
#[derive(Debug, Clone, Copy)]
pub struct EntryView<'a> {
    /// Segment holding the entry.
    pub segment: SegmentId,
    /// Position of the entry inside its segment.
    pub index: u32,
    /// Decompressed payload.
    pub payload: &'a [u8],
    /// Id range, for deques that track ids.
    pub ids: Option<IdRange>,
    /// Offer time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Extra header of the segment.
    pub extra_header: &'a [u8],
}

/// Decision of a truncator for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruncatorResponse {
    /// Keep the entry and continue.
    NoTruncate,
    /// Replace the entry with `payload` and drop everything after it.
    ///
    /// On deques that track ids `end_id` becomes the new end of the
    /// entry's range; `None` keeps the original end.
    Partial {
        /// Replacement payload.
        payload: Vec<u8>,
        /// New end id.
        end_id: Option<i64>,
    },
    /// Drop this entry and everything after it.
    Full,
}

/// Segments found on disk.
pub(crate) struct Recovered {
    pub(crate) segments: BTreeMap<SegmentId, Segment>,
    /// Extra header of the newest segment, if any was found.
    pub(crate) newest_extra: Option<Bytes>,
    /// Id of a newest empty segment that was removed.
    pub(crate) removed_newest: Option<SegmentId>,
}

/// Opens, validates and seals every segment of the deque.
pub(crate) fn recover_segments(dir: &DequeDir, stats: &DequeStats) -> CoreResult<Recovered> {
    let files = dir.list_segments()?;
    let newest = files.last().map(|f| f.id);
    let mut segments = BTreeMap::new();
    let mut newest_extra = None;
    let mut removed_newest = None;
    let mut truncated = 0usize;
    let mut quarantined = 0usize;

    for file in files {
        let is_newest = Some(file.id) == newest;
        let backend = FileBackend::open(&file.path)?;
        if is_newest && !file.quarantined && backend.size()? < SEGMENT_HEADER_SIZE as u64 {
            drop(backend);
            remove_segment_file(dir.path(), &file.path)?;
            warn!(segment = %file.id, "removed partially created segment");
            removed_newest = Some(file.id);
            continue;
        }

        let (segment, outcome) = recover_one(dir, &file, Box::new(backend))?;
        match outcome {
            Outcome::Clean => {}
            Outcome::Truncated => {
                truncated += 1;
                stats.record_truncation();
            }
            Outcome::Quarantined => {
                quarantined += 1;
                stats.record_quarantine();
            }
        }
        if is_newest {
            newest_extra = Some(segment.extra().clone());
        }
        segments.insert(file.id, segment);
    }

    check_chain(&segments)?;

    // The newest segment is dropped if it never received an entry.
    let empty_newest = segments
        .last_key_value()
        .filter(|(_, seg)| seg.count() == 0 && !seg.is_quarantined() && seg.outstanding() == 0)
        .map(|(id, _)| *id);
    if let Some(id) = empty_newest {
        if let Some(seg) = segments.remove(&id) {
            newest_extra = Some(seg.extra().clone());
            let path = seg.path().to_path_buf();
            drop(seg);
            remove_segment_file(dir.path(), &path)?;
            removed_newest = Some(id);
            debug!(segment = %id, "removed empty newest segment");
        }
    }

    info!(
        segments = segments.len(),
        truncated,
        quarantined,
        "recovered deque segments"
    );
    Ok(Recovered {
        segments,
        newest_extra,
        removed_newest,
    })
}

enum Outcome {
    Clean,
    Truncated,
    Quarantined,
}

fn recover_one(
    dir: &DequeDir,
    file: &SegmentFile,
    backend: Box<dyn StorageBackend>,
) -> CoreResult<(Segment, Outcome)> {
    let mut segment = match Segment::open(file.id, file.path.clone(), backend) {
        Ok(segment) => segment,
        Err(e) if e.is_corruption() => {
            warn!(segment = %file.id, error = %e, "segment header unreadable");
            let path = dir.quarantine_file(file.id, &file.path)?;
            let backend = FileBackend::open(&path)?;
            let segment = Segment::unreadable(file.id, path, Box::new(backend))?;
            let outcome = if file.quarantined {
                Outcome::Clean
            } else {
                Outcome::Quarantined
            };
            return Ok((segment, outcome));
        }
        Err(e) => return Err(e),
    };

    let mut outcome = match segment.state() {
        SegmentState::Quarantined => {
            let walk = segment.walk(Some(segment.header().entry_count), false)?;
            segment.apply_walk(&walk);
            Outcome::Clean
        }
        SegmentState::Finalized => {
            let walk = segment.walk(None, false)?;
            let expected = segment.header().entry_count;
            segment.apply_walk(&walk);
            if walk.stop == WalkStop::Clean && walk.count == expected {
                Outcome::Clean
            } else {
                warn!(
                    segment = %file.id,
                    expected,
                    found = walk.count,
                    stop = ?walk.stop,
                    "finalized segment does not match its header"
                );
                segment.quarantine(walk.count.min(expected))?;
                Outcome::Quarantined
            }
        }
        SegmentState::Deletable => {
            return Err(CoreError::invariant(format!(
                "segment {} opened as deletable",
                file.id
            )))
        }
        SegmentState::Writing => {
            let walk = segment.walk(None, true)?;
            segment.apply_walk(&walk);
            match walk.stop {
                WalkStop::Clean | WalkStop::Limit => {
                    segment.finalize()?;
                    Outcome::Clean
                }
                WalkStop::Torn | WalkStop::Checksum { tail: true } => {
                    warn!(
                        segment = %file.id,
                        kept = walk.count,
                        at = walk.end,
                        "truncating torn tail"
                    );
                    segment.replace_tail(walk.end, None)?;
                    segment.finalize()?;
                    Outcome::Truncated
                }
                WalkStop::Corrupt(ref reason) => {
                    warn!(segment = %file.id, reason = %reason, "corrupt entry in open segment");
                    segment.quarantine(walk.count)?;
                    Outcome::Quarantined
                }
                WalkStop::Checksum { tail: false } => {
                    warn!(segment = %file.id, index = walk.count, "checksum failure in open segment");
                    segment.quarantine(walk.count)?;
                    Outcome::Quarantined
                }
            }
        }
    };

    if file.quarantined && !segment.is_quarantined() {
        warn!(segment = %file.id, "segment named as quarantined; quarantining");
        segment.quarantine(segment.count())?;
        outcome = Outcome::Quarantined;
    }
    if segment.is_quarantined() {
        let path = dir.quarantine_file(file.id, segment.path())?;
        segment.set_path(path);
    }
    Ok((segment, outcome))
}

/// Fails if a segment names a predecessor that should sit between it and
/// the segment before it.
fn check_chain(segments: &BTreeMap<SegmentId, Segment>) -> CoreResult<()> {
    let mut previous: Option<SegmentId> = None;
    for (id, seg) in segments {
        let prev = seg.header().prev_id;
        if let Some(before) = previous {
            if prev != 0 && prev > before.as_u64() && prev < id.as_u64() {
                return Err(CoreError::invalid_format(format!(
                    "segment {} is missing before {id}",
                    SegmentId::new(prev)
                )));
            }
        }
        previous = Some(*id);
    }
    Ok(())
}

/// A cut found by a truncator.
struct Cut {
    segment: SegmentId,
    index: u32,
    offset: u64,
    replacement: Option<crate::segment::entry::EncodedEntry>,
}

impl Inner {
    /// Visits readable entries oldest first.
    pub(crate) fn scan_entries<F>(&mut self, shared: &Shared, mut scanner: F) -> CoreResult<u64>
    where
        F: FnMut(&EntryView<'_>) -> CoreResult<bool>,
    {
        let ids: Vec<SegmentId> = self.segments.keys().copied().collect();
        let mut visited = 0;
        for id in ids {
            let mut index = 0;
            let mut offset = match self.segments.get(&id) {
                Some(seg) => seg.data_start(),
                None => continue,
            };
            loop {
                let Some(seg) = self.segments.get(&id) else {
                    break;
                };
                // A quarantined segment counts only its readable prefix.
                if index >= seg.count() {
                    break;
                }
                match read_entry(seg, offset)? {
                    Ok((header, payload)) => {
                        let view = EntryView {
                            segment: id,
                            index,
                            payload: &payload,
                            ids: header.ids,
                            timestamp: header.timestamp,
                            extra_header: seg.extra(),
                        };
                        if !scanner(&view)? {
                            return Ok(visited);
                        }
                        visited += 1;
                        index += 1;
                        offset += header.frame_len();
                    }
                    Err(reason) => {
                        self.quarantine_at(shared, id, index, &reason)?;
                        break;
                    }
                }
            }
        }
        Ok(visited)
    }

    /// Applies a truncator and returns the detached segments.
    pub(crate) fn parse_and_truncate<F>(
        &mut self,
        shared: &Shared,
        mut truncator: F,
    ) -> CoreResult<Vec<crate::segment::Segment>>
    where
        F: FnMut(&EntryView<'_>) -> TruncatorResponse,
    {
        if self.gap_writer_open {
            return Err(CoreError::invalid_operation(
                "cannot truncate while a gap writer is open",
            ));
        }
        if self.segments.values().any(|s| s.outstanding() > 0) {
            return Err(CoreError::invalid_operation(
                "cannot truncate while polled entries are outstanding",
            ));
        }

        let Some(cut) = self.find_cut(shared, &mut truncator)? else {
            return Ok(Vec::new());
        };
        self.apply_cut(shared, cut)
    }

    fn find_cut<F>(&mut self, shared: &Shared, truncator: &mut F) -> CoreResult<Option<Cut>>
    where
        F: FnMut(&EntryView<'_>) -> TruncatorResponse,
    {
        let ids: Vec<SegmentId> = self.segments.keys().copied().collect();
        for id in ids {
            let mut index = 0;
            let mut offset = match self.segments.get(&id) {
                Some(seg) => seg.data_start(),
                None => continue,
            };
            loop {
                let Some(seg) = self.segments.get(&id) else {
                    break;
                };
                // A quarantined segment counts only its readable prefix.
                if index >= seg.count() {
                    break;
                }
                let (header, payload) = match read_entry(seg, offset)? {
                    Ok(entry) => entry,
                    Err(reason) => {
                        self.quarantine_at(shared, id, index, &reason)?;
                        break;
                    }
                };
                let view = EntryView {
                    segment: id,
                    index,
                    payload: &payload,
                    ids: header.ids,
                    timestamp: header.timestamp,
                    extra_header: seg.extra(),
                };
                let replacement = match truncator(&view) {
                    TruncatorResponse::NoTruncate => {
                        index += 1;
                        offset += header.frame_len();
                        continue;
                    }
                    TruncatorResponse::Full => None,
                    TruncatorResponse::Partial { payload, end_id } => {
                        let ids = match (header.ids, end_id) {
                            (Some(range), Some(end)) => Some(IdRange::new(range.start, end)?),
                            (ids, _) => ids,
                        };
                        Some(encode_entry(
                            &payload,
                            ids,
                            header.timestamp,
                            shared.config.compression,
                        ))
                    }
                };
                return Ok(Some(Cut {
                    segment: id,
                    index,
                    offset,
                    replacement,
                }));
            }
        }
        Ok(None)
    }

    fn apply_cut(&mut self, shared: &Shared, cut: Cut) -> CoreResult<Vec<Segment>> {
        let later: Vec<SegmentId> = self
            .segments
            .range(cut.segment..)
            .skip(1)
            .map(|(id, _)| *id)
            .collect();
        let mut detached = Vec::with_capacity(later.len() + 1);
        for id in later {
            if let Some(mut seg) = self.segments.remove(&id) {
                seg.mark_deletable()?;
                self.retired_floor = self.retired_floor.max(id.as_u64());
                detached.push(seg);
            }
        }

        let seg = self
            .segments
            .get_mut(&cut.segment)
            .ok_or_else(|| CoreError::invariant("truncated segment vanished"))?;
        seg.replace_tail(cut.offset, cut.replacement.as_ref())?;
        if seg.is_writing() {
            seg.finalize()?;
        }
        let (kept, end) = (seg.count(), seg.end());
        if kept == 0 {
            if let Some(mut seg) = self.segments.remove(&cut.segment) {
                seg.mark_deletable()?;
                self.retired_floor = self.retired_floor.max(cut.segment.as_u64());
                detached.push(seg);
            }
        }
        shared.stats.record_deleted(detached.len() as u64);

        let prev = self.segments.last_key_value().map(|(id, _)| *id);
        let id = self.next_regular_id()?;
        self.create_segment(shared, id, prev)?;
        self.write_segment = Some(id);
        let write_start = self.write_seg()?.data_start();

        // Nothing after the cut may be observed.
        let removed: Vec<SegmentId> = detached.iter().map(Segment::id).collect();
        for cursor in self.cursors.values_mut() {
            let Some(at) = cursor.position.segment else {
                continue;
            };
            if at == cut.segment && kept > 0 {
                if cursor.position.index > kept {
                    cursor.position = crate::cursor::Position::at(at, kept, end);
                }
            } else if removed.contains(&at) {
                cursor.position = crate::cursor::Position::at(id, 0, write_start);
            }
        }
        self.refresh_last_end_id();
        shared.save_cursors(self)?;
        shared.stats.record_truncation();
        warn!(
            segment = %cut.segment,
            index = cut.index,
            kept,
            deleted = detached.len(),
            "truncated deque"
        );
        Ok(detached)
    }
}

/// Reads the entry at `offset`; the inner error describes corruption.
#[allow(clippy::type_complexity)]
pub(crate) fn read_entry(
    seg: &Segment,
    offset: u64,
) -> CoreResult<Result<(crate::segment::entry::EntryHeader, Vec<u8>), String>> {
    let header = match seg.frame_at(offset)? {
        Frame::Entry(header) => header,
        Frame::Corrupt(reason) => return Ok(Err(reason)),
        Frame::End | Frame::Torn => return Ok(Err("entry runs past end of segment".into())),
    };
    match seg.read_payload(offset, &header) {
        Ok(payload) => Ok(Ok((header, payload))),
        Err(e) if e.is_corruption() => Ok(Err(e.to_string())),
        Err(e) => Err(e),
    }
}
