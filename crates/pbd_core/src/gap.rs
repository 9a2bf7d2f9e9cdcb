//! Back-filling id ranges that were skipped at segment boundaries.
//!
//! Gap entries go into their own segments, placed between the two existing
//! segments whose ids surround the hole:
//!
//! ```text
//!   [0 ..= 9]   [gap 10 ..= 14][gap 15 ..= 19]   [100 ..= 109]
//!      pred      ▲ contiguous offers extend one      succ
//! ```

use crate::deque::{check_entry_size, IdMode, Shared};
use crate::error::{CoreError, CoreResult};
use crate::segment::entry::encode_entry;
use crate::segment::header::SEGMENT_HEADER_SIZE;
use crate::types::{now_millis, IdRange, SegmentId};
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest distance between a gap segment id and its predecessor.
const GAP_ID_STEP: u64 = 1 << 10;

/// Writer for entries whose ids fall into holes of an id-tracked deque.
///
/// Only one gap writer may be open per deque. Cursors already positioned
/// past the insertion point do not see back-filled entries.
pub struct GapWriter {
    shared: Arc<Shared>,
    current: Option<SegmentId>,
    closed: bool,
}

impl GapWriter {
    pub(crate) fn open(shared: Arc<Shared>) -> CoreResult<Self> {
        {
            let mut inner = shared.lock_open()?;
            if inner.id_mode != IdMode::Tracked {
                return Err(CoreError::invalid_operation(
                    "gap writer needs a deque that tracks ids",
                ));
            }
            if inner.gap_writer_open {
                return Err(CoreError::invalid_operation("a gap writer is already open"));
            }
            inner.gap_writer_open = true;
        }
        Ok(Self {
            shared,
            current: None,
            closed: false,
        })
    }

    /// Writes an entry covering `start_id..=end_id` into the hole it
    /// belongs to. Returns the bytes written.
    ///
    /// # Errors
    ///
    /// - `InvariantViolation` if the range overlaps a stored segment or
    ///   lies after the newest stored id
    /// - `InvalidOperation` if no segment id is free before the successor
    /// - `EntryTooLarge` for oversized payloads
    pub fn offer(
        &mut self,
        payload: &[u8],
        start_id: i64,
        end_id: i64,
        timestamp_ms: Option<i64>,
    ) -> CoreResult<usize> {
        if self.closed {
            return Err(CoreError::invalid_operation("gap writer is closed"));
        }
        let range = IdRange::new(start_id, end_id)?;
        let shared = &self.shared;
        let config = &shared.config;
        check_entry_size(payload.len(), config)?;
        let entry = encode_entry(
            payload,
            Some(range),
            timestamp_ms.unwrap_or_else(now_millis),
            config.compression,
        );
        let frame_len = entry.bytes.len() as u64;

        let mut inner = shared.lock_open()?;
        if inner.last_end_id.map_or(true, |last| range.end > last) {
            return Err(CoreError::invariant(format!(
                "gap range {range} lies after the newest stored id"
            )));
        }
        if let Some((id, _)) = inner
            .segments
            .iter()
            .find(|(_, seg)| seg.ids().is_some_and(|ids| ids.overlaps(&range)))
        {
            return Err(CoreError::invariant(format!(
                "gap range {range} overlaps segment {id}"
            )));
        }
        let succ = inner
            .segments
            .iter()
            .find(|(_, seg)| seg.ids().is_some_and(|ids| ids.start > range.end))
            .map(|(id, _)| *id)
            .ok_or_else(|| CoreError::invariant(format!("no segment follows gap range {range}")))?;

        let extend = self.current.filter(|id| {
            let Some(seg) = inner.segments.get(id) else {
                return false;
            };
            let next = inner
                .segments
                .range((Bound::Excluded(*id), Bound::Unbounded))
                .next()
                .map(|(next, _)| *next);
            seg.is_writing()
                && next == Some(succ)
                && seg.ids().is_some_and(|ids| ids.end.checked_add(1) == Some(range.start))
                && seg.file_size() + frame_len <= config.max_segment_size
        });

        let target = match extend {
            Some(id) => id,
            None => {
                if let Some(old) = self.current.take() {
                    if let Some(seg) = inner.segments.get_mut(&old) {
                        if seg.is_writing() {
                            seg.finalize()?;
                        }
                    }
                }
                let overhead = (SEGMENT_HEADER_SIZE + inner.next_extra.len()) as u64;
                if overhead + frame_len > config.max_segment_size {
                    return Err(CoreError::EntryTooLarge {
                        size: frame_len,
                        max: config.max_segment_size.saturating_sub(overhead),
                    });
                }
                let (lower, upper) = inner.free_ids_before(succ);
                if upper - lower < 2 {
                    return Err(CoreError::invalid_operation(format!(
                        "no free segment ids before {succ}"
                    )));
                }
                let id = SegmentId::new(lower + GAP_ID_STEP.min((upper - lower) / 2));
                let pred = inner.segments.range(..succ).next_back().map(|(id, _)| *id);
                inner.create_segment(shared, id, pred)?;
                debug!(segment = %id, before = %succ, "created gap segment");
                id
            }
        };
        self.current = Some(target);

        let seg = inner
            .segments
            .get_mut(&target)
            .ok_or_else(|| CoreError::invariant("gap segment vanished"))?;
        seg.append(&entry)?;
        if config.sync_on_write {
            seg.sync()?;
        }
        shared.stats.record_offer(frame_len);
        Ok(entry.bytes.len())
    }

    /// Finalizes the current gap segment and releases the writer slot.
    ///
    /// # Errors
    ///
    /// I/O errors while finalizing.
    pub fn close(mut self) -> CoreResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> CoreResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut inner = self.shared.inner.lock();
        inner.gap_writer_open = false;
        if inner.closed {
            return Ok(());
        }
        if let Some(id) = self.current.take() {
            if let Some(seg) = inner.segments.get_mut(&id) {
                if seg.is_writing() {
                    seg.finalize()?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for GapWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(error = %e, "failed to close gap writer");
        }
    }
}

impl std::fmt::Debug for GapWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapWriter")
            .field("current", &self.current)
            .field("closed", &self.closed)
            .finish()
    }
}
