//! The deque handle, its shared state and the deletion engine.
//!
//! All mutable state lives in [`Inner`] behind one mutex. Handles
//! ([`BinaryDeque`], [`ReadCursor`], [`PolledEntry`], [`GapWriter`]) hold an
//! `Arc` of [`Shared`]. Segments that become deletable are detached from
//! the map while the lock is held; their files are removed after it is
//! released, optionally on a caller supplied executor.
//!
//! ```text
//!   head                                             tail
//!   ┌────────┐ ┌────────┐ ┌────────┐      ┌──────────────┐
//!   │ seg  a │ │ seg  b │ │ seg  c │ .... │ write segment│ ◄── offer
//!   └────────┘ └────────┘ └────────┘      └──────────────┘
//!       ▲ push                 ▲ cursor x          ▲ cursor y
//! ```

use crate::config::DequeConfig;
use crate::cursor::{CursorState, Position, ReadCursor};
use crate::dir::{remove_segment_file, DequeDir};
use crate::error::{CoreError, CoreResult};
use crate::extra::ExtraHeaderSerializer;
use crate::gap::GapWriter;
use crate::recovery::{recover_segments, EntryView, TruncatorResponse};
use crate::retention::{RetentionControl, RetentionPolicy, RetentionScheduler};
use crate::segment::entry::{encode_entry, EncodedEntry};
use crate::segment::header::SEGMENT_HEADER_SIZE;
use crate::segment::{Segment, SegmentInfo};
use crate::stats::{DequeStats, StatsSnapshot};
use crate::types::{now_millis, IdRange, SegmentId};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use pbd_storage::FileBackend;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Id of the first segment of a fresh deque.
pub(crate) const FIRST_SEGMENT_ID: u64 = 1 << 40;
/// Distance between consecutively rolled segments.
pub(crate) const SEGMENT_ID_STRIDE: u64 = 1 << 20;

/// A file removal handed to a [`DeferredDeleter`].
pub type DeletionTask = Box<dyn FnOnce() + Send + 'static>;

/// Executor for segment file removal.
///
/// Registered with [`BinaryDeque::register_deferred_deleter`] so that the
/// thread discarding the last buffer of a segment does no file I/O.
pub trait DeferredDeleter: Send + Sync {
    /// Runs `task` at some later point.
    fn defer(&self, task: DeletionTask);
}

/// Whether the deque tracks entry ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdMode {
    /// Nothing has been written yet.
    Unknown,
    Tracked,
    Untracked,
}

/// Deque state guarded by [`Shared::inner`].
pub(crate) struct Inner {
    pub(crate) segments: BTreeMap<SegmentId, Segment>,
    pub(crate) write_segment: Option<SegmentId>,
    pub(crate) cursors: BTreeMap<String, CursorState>,
    pub(crate) id_mode: IdMode,
    pub(crate) last_end_id: Option<i64>,
    /// Extra header for segments created from now on.
    pub(crate) next_extra: Bytes,
    /// Highest segment id ever used by this handle.
    pub(crate) highest_id: u64,
    /// Highest segment id detached for deletion; ids at or below it are
    /// never handed out again.
    pub(crate) retired_floor: u64,
    pub(crate) gap_writer_open: bool,
    pub(crate) closed: bool,
}

/// State shared by every handle of one deque.
pub(crate) struct Shared {
    pub(crate) dir: DequeDir,
    pub(crate) config: DequeConfig,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) stats: DequeStats,
    pub(crate) retention: Mutex<RetentionControl>,
    deleter: RwLock<Option<Arc<dyn DeferredDeleter>>>,
}

impl Shared {
    /// Locks the deque state, failing once the deque is closed.
    pub(crate) fn lock_open(&self) -> CoreResult<MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(CoreError::DequeClosed);
        }
        Ok(inner)
    }

    /// Fails with `DequeClosed` once the deque is closed.
    pub(crate) fn ensure_open(&self) -> CoreResult<()> {
        if self.inner.lock().closed {
            return Err(CoreError::DequeClosed);
        }
        Ok(())
    }

    /// Removes the files of detached segments.
    ///
    /// Must be called without the deque lock held.
    pub(crate) fn dispose(&self, segments: Vec<Segment>, allow_defer: bool) {
        if segments.is_empty() {
            return;
        }
        let dir = self.dir.path().to_path_buf();
        let task = move || {
            for segment in segments {
                let id = segment.id();
                let path = segment.path().to_path_buf();
                drop(segment);
                match remove_segment_file(&dir, &path) {
                    Ok(()) => debug!(segment = %id, "removed segment file"),
                    Err(e) => warn!(segment = %id, error = %e, "failed to remove segment file"),
                }
            }
        };

        if allow_defer {
            if let Some(deleter) = self.deleter.read().clone() {
                deleter.defer(Box::new(task));
                return;
            }
        }
        task();
    }

    /// Writes the durable cursor table.
    ///
    /// Skips the write for deques that never had a durable cursor.
    pub(crate) fn save_cursors(&self, inner: &Inner) -> CoreResult<()> {
        let cursors = inner.persisted_cursors();
        if cursors.is_empty() && !self.dir.cursor_path().exists() {
            return Ok(());
        }
        self.dir.save_cursors(&cursors)
    }

    /// Releases one outstanding buffer and re-evaluates deletion.
    pub(crate) fn release_buffer(&self, segment: SegmentId) {
        let detached = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            if let Some(seg) = inner.segments.get_mut(&segment) {
                seg.release();
            }
            match inner.collect_deletable(self) {
                Ok(detached) => detached,
                Err(e) => {
                    warn!(segment = %segment, error = %e, "deletion check failed");
                    return;
                }
            }
        };
        self.dispose(detached, true);
    }

    /// Closes the deque. Idempotent.
    pub(crate) fn shutdown(&self) -> CoreResult<()> {
        let result = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.close(self)
        };
        self.stop_retention();
        self.dir.release_lock();
        info!(dir = %self.dir.path().display(), nonce = self.dir.nonce(), "closed deque");
        result
    }
}

impl Inner {
    pub(crate) fn write_seg(&self) -> CoreResult<&Segment> {
        self.write_segment
            .and_then(|id| self.segments.get(&id))
            .ok_or_else(|| CoreError::invariant("deque has no write segment"))
    }

    pub(crate) fn write_seg_mut(&mut self) -> CoreResult<&mut Segment> {
        let id = self.write_segment;
        id.and_then(|id| self.segments.get_mut(&id))
            .ok_or_else(|| CoreError::invariant("deque has no write segment"))
    }

    pub(crate) fn cursor(&self, name: &str) -> CoreResult<&CursorState> {
        self.cursors
            .get(name)
            .ok_or_else(|| CoreError::cursor_not_found(name))
    }

    pub(crate) fn cursor_mut(&mut self, name: &str) -> CoreResult<&mut CursorState> {
        self.cursors
            .get_mut(name)
            .ok_or_else(|| CoreError::cursor_not_found(name))
    }

    /// Creates, registers and returns the id of a new writing segment.
    pub(crate) fn create_segment(
        &mut self,
        shared: &Shared,
        id: SegmentId,
        prev: Option<SegmentId>,
    ) -> CoreResult<SegmentId> {
        let path = shared.dir.segment_path(id, false);
        let backend = FileBackend::create_new(&path)?;
        let segment = Segment::create(
            id,
            path,
            Box::new(backend),
            prev,
            self.next_extra.clone(),
            now_millis(),
        )?;
        shared.dir.sync()?;
        self.segments.insert(id, segment);
        self.highest_id = self.highest_id.max(id.as_u64());
        Ok(id)
    }

    /// Id for the next regularly rolled segment.
    pub(crate) fn next_regular_id(&self) -> CoreResult<SegmentId> {
        let last = self
            .segments
            .last_key_value()
            .map_or(0, |(id, _)| id.as_u64())
            .max(self.highest_id);
        if last == 0 {
            return Ok(SegmentId::new(FIRST_SEGMENT_ID));
        }
        last.checked_add(SEGMENT_ID_STRIDE)
            .map(SegmentId::new)
            .ok_or_else(|| CoreError::invalid_operation("segment id space exhausted"))
    }

    /// Open interval of ids free for segments placed directly before `succ`.
    pub(crate) fn free_ids_before(&self, succ: SegmentId) -> (u64, u64) {
        let pred = self
            .segments
            .range(..succ)
            .next_back()
            .map_or(0, |(id, _)| id.as_u64());
        let succ_prev = self
            .segments
            .get(&succ)
            .map_or(0, |s| s.header().prev_id);
        let lower = pred.max(self.retired_floor).max(succ_prev.min(succ.as_u64()));
        (lower, succ.as_u64())
    }

    /// Finalizes the write segment and starts a new one.
    pub(crate) fn roll_over(&mut self, shared: &Shared) -> CoreResult<()> {
        if let Some(old) = self.write_segment {
            if let Some(seg) = self.segments.get_mut(&old) {
                if seg.is_writing() {
                    seg.finalize()?;
                }
            }
        }
        let prev = self.segments.last_key_value().map(|(id, _)| *id);
        let id = self.next_regular_id()?;
        self.create_segment(shared, id, prev)?;
        self.write_segment = Some(id);
        shared.stats.record_rollover();
        debug!(segment = %id, "rolled over to new write segment");
        Ok(())
    }

    fn check_id_mode(&self, ids: Option<IdRange>) -> CoreResult<()> {
        match (self.id_mode, ids) {
            (IdMode::Tracked, None) => Err(CoreError::invariant(
                "deque tracks ids; every entry needs an id range",
            )),
            (IdMode::Untracked, Some(_)) => {
                Err(CoreError::invariant("deque does not track ids"))
            }
            _ => Ok(()),
        }
    }

    fn check_continuity(&self, ids: Option<IdRange>, fresh: bool) -> CoreResult<()> {
        let Some(range) = ids else {
            return Ok(());
        };
        let in_segment = if fresh { None } else { self.write_seg()?.ids() };
        match in_segment {
            Some(prev) => {
                let expected = prev.end.checked_add(1);
                if expected != Some(range.start) {
                    return Err(CoreError::invariant(format!(
                        "entry ids {range} must continue the write segment ending at {}",
                        prev.end
                    )));
                }
            }
            None => {
                if let Some(last) = self.last_end_id {
                    if range.start <= last {
                        return Err(CoreError::invariant(format!(
                            "entry ids {range} do not follow the last stored id {last}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn note_written(&mut self, ids: Option<IdRange>) {
        if self.id_mode == IdMode::Unknown {
            self.id_mode = if ids.is_some() {
                IdMode::Tracked
            } else {
                IdMode::Untracked
            };
        }
        if let Some(range) = ids {
            self.last_end_id = Some(self.last_end_id.map_or(range.end, |e| e.max(range.end)));
        }
    }

    /// Appends one entry to the write segment, rolling over first if needed.
    pub(crate) fn offer(
        &mut self,
        shared: &Shared,
        payload: &[u8],
        ids: Option<IdRange>,
        timestamp: i64,
    ) -> CoreResult<Appended> {
        let config = &shared.config;
        self.check_id_mode(ids)?;
        check_entry_size(payload.len(), config)?;

        let entry = encode_entry(payload, ids, timestamp, config.compression);
        let frame_len = entry.bytes.len() as u64;
        let overhead = (SEGMENT_HEADER_SIZE + self.next_extra.len()) as u64;
        if overhead + frame_len > config.max_segment_size {
            return Err(CoreError::EntryTooLarge {
                size: frame_len,
                max: config.max_segment_size.saturating_sub(overhead),
            });
        }

        let ws = self.write_seg()?;
        let roll = ws.count() > 0
            && (ws.file_size() + frame_len > config.max_segment_size
                || segment_expired(ws, config, now_millis()));
        let fresh = roll || ws.count() == 0;
        self.check_continuity(ids, fresh)?;

        if roll {
            self.roll_over(shared)?;
        }
        let ws = self.write_seg_mut()?;
        ws.append(&entry)?;
        if config.sync_on_write {
            ws.sync()?;
        }
        self.note_written(ids);
        shared.stats.record_offer(frame_len);

        let detached = if roll {
            self.collect_deletable(shared)?
        } else {
            Vec::new()
        };
        Ok(Appended {
            written: entry.bytes.len(),
            rolled: roll,
            detached,
        })
    }

    /// Writes entries into new finalized segments before the head.
    pub(crate) fn push(&mut self, shared: &Shared, entries: Vec<EncodedEntry>) -> CoreResult<usize> {
        if self.id_mode == IdMode::Tracked {
            return Err(CoreError::invalid_operation(
                "push is only supported on deques that do not track ids",
            ));
        }
        if entries.is_empty() {
            return Ok(0);
        }

        let max = shared.config.max_segment_size;
        let overhead = (SEGMENT_HEADER_SIZE + self.next_extra.len()) as u64;
        let mut groups: Vec<Vec<EncodedEntry>> = Vec::new();
        let mut current = Vec::new();
        let mut size = overhead;
        for entry in entries {
            let len = entry.bytes.len() as u64;
            if overhead + len > max {
                return Err(CoreError::EntryTooLarge {
                    size: len,
                    max: max.saturating_sub(overhead),
                });
            }
            if !current.is_empty() && size + len > max {
                groups.push(std::mem::take(&mut current));
                size = overhead;
            }
            size += len;
            current.push(entry);
        }
        groups.push(current);

        let head = self
            .segments
            .first_key_value()
            .map(|(id, _)| *id)
            .ok_or_else(|| CoreError::invariant("deque has no segments"))?;
        let (lower, upper) = self.free_ids_before(head);
        let needed = groups.len() as u64;
        if upper - lower <= needed {
            return Err(CoreError::invalid_operation(format!(
                "no free segment ids before {head}"
            )));
        }

        let mut written = 0;
        for (i, group) in groups.into_iter().enumerate() {
            let id = SegmentId::new(upper - needed + i as u64);
            self.create_segment(shared, id, None)?;
            let seg = self
                .segments
                .get_mut(&id)
                .ok_or_else(|| CoreError::invariant("pushed segment vanished"))?;
            for entry in &group {
                seg.append(entry)?;
                written += entry.bytes.len();
                shared.stats.record_offer(entry.bytes.len() as u64);
            }
            seg.finalize()?;
        }
        if self.id_mode == IdMode::Unknown {
            self.id_mode = IdMode::Untracked;
        }

        // Cursors waiting at the start of the old head read the pushed
        // entries first.
        for cursor in self.cursors.values_mut() {
            if cursor.position.segment == Some(head) && cursor.position.index == 0 {
                cursor.position = Position::HEAD;
            }
        }
        debug!(before = %head, bytes = written, "pushed entries before head");
        Ok(written)
    }

    /// Sets the extra header for new segments and starts one.
    pub(crate) fn update_extra_header(&mut self, shared: &Shared, extra: Bytes) -> CoreResult<()> {
        self.next_extra = extra;
        let ws = self.write_seg()?;
        if ws.count() > 0 || ws.outstanding() > 0 {
            return self.roll_over(shared);
        }

        // An empty write segment is replaced in place.
        let id = ws.id();
        let prev = match ws.header().prev_id {
            0 => None,
            prev => Some(SegmentId::new(prev)),
        };
        if let Some(old) = self.segments.remove(&id) {
            let path = old.path().to_path_buf();
            drop(old);
            remove_segment_file(shared.dir.path(), &path)?;
        }
        self.create_segment(shared, id, prev)?;
        let data_start = self.write_seg()?.data_start();
        for cursor in self.cursors.values_mut() {
            if cursor.position.segment == Some(id) {
                cursor.position = Position::at(id, 0, data_start);
            }
        }
        Ok(())
    }

    /// Positions of every durable cursor, open or dormant.
    pub(crate) fn durable_positions(&self) -> Vec<Position> {
        self.cursors
            .values()
            .filter(|c| !c.transient)
            .map(|c| c.position)
            .collect()
    }

    /// Detaches deletable head segments.
    ///
    /// Nothing is deleted while no durable cursor exists.
    pub(crate) fn collect_deletable(&mut self, shared: &Shared) -> CoreResult<Vec<Segment>> {
        let positions = self.durable_positions();
        self.collect_deletable_with(shared, &positions)
    }

    /// Detaches head segments every one of `positions` has passed.
    pub(crate) fn collect_deletable_with(
        &mut self,
        shared: &Shared,
        positions: &[Position],
    ) -> CoreResult<Vec<Segment>> {
        let mut detached = Vec::new();
        if self.closed || positions.is_empty() {
            return Ok(detached);
        }
        while let Some((&head, seg)) = self.segments.first_key_value() {
            if !self.head_removable(head, seg) {
                break;
            }
            if !positions.iter().all(|p| self.is_past(*p, head)) {
                break;
            }
            detached.push(self.detach_head(shared)?);
        }
        self.reposition_detached();
        Ok(detached)
    }

    /// Whether the head segment is free of writers and buffers.
    pub(crate) fn head_removable(&self, head: SegmentId, seg: &Segment) -> bool {
        Some(head) != self.write_segment && !seg.is_writing() && seg.outstanding() == 0
    }

    /// Removes the head segment from the map and marks it deletable.
    pub(crate) fn detach_head(&mut self, shared: &Shared) -> CoreResult<Segment> {
        let (id, mut seg) = self
            .segments
            .pop_first()
            .ok_or_else(|| CoreError::invariant("no head segment to detach"))?;
        seg.mark_deletable()?;
        self.retired_floor = self.retired_floor.max(id.as_u64());
        shared.stats.record_deleted(1);
        debug!(segment = %id, entries = seg.count(), "detached segment for deletion");
        Ok(seg)
    }

    /// Moves cursors whose segment was detached to the head.
    pub(crate) fn reposition_detached(&mut self) {
        let floor = self.retired_floor;
        for cursor in self.cursors.values_mut() {
            if let Some(id) = cursor.position.segment {
                if id.as_u64() <= floor && !self.segments.contains_key(&id) {
                    cursor.position = Position::HEAD;
                }
            }
        }
    }

    /// Quarantines `id`, keeping its first `prefix` entries readable.
    pub(crate) fn quarantine_at(
        &mut self,
        shared: &Shared,
        id: SegmentId,
        prefix: u32,
        reason: &str,
    ) -> CoreResult<()> {
        if self.write_segment == Some(id) {
            self.roll_over(shared)?;
        }
        let seg = self
            .segments
            .get_mut(&id)
            .ok_or_else(|| CoreError::invalid_operation(format!("no segment {id}")))?;
        let already = seg.is_quarantined();
        if already && prefix >= seg.count() {
            return Ok(());
        }
        seg.quarantine(prefix)?;
        let path = shared.dir.quarantine_file(id, seg.path())?;
        seg.set_path(path);
        let (count, end) = (seg.count(), seg.end());
        if !already {
            shared.stats.record_quarantine();
        }
        warn!(segment = %id, readable = count, reason, "quarantined segment");
        self.clamp_cursors(id, count, end);
        Ok(())
    }

    /// Pulls cursors inside `id` back to at most `count` entries.
    pub(crate) fn clamp_cursors(&mut self, id: SegmentId, count: u32, end: u64) {
        for cursor in self.cursors.values_mut() {
            if cursor.position.segment == Some(id) && cursor.position.index > count {
                cursor.position = Position::at(id, count, end);
            }
        }
    }

    /// Recomputes the newest stored id.
    pub(crate) fn refresh_last_end_id(&mut self) {
        self.last_end_id = self
            .segments
            .values()
            .filter_map(|s| s.ids().map(|r| r.end))
            .max();
    }

    /// Deletes head segments whose entries all end at or before `id`.
    pub(crate) fn delete_to_entry_id(&mut self, shared: &Shared, id: i64) -> CoreResult<Vec<Segment>> {
        let mut detached = Vec::new();
        while let Some((&head, seg)) = self.segments.first_key_value() {
            if !self.head_removable(head, seg) {
                break;
            }
            let covered = match seg.ids() {
                Some(range) => range.end <= id,
                None => seg.count() == 0,
            };
            if !covered {
                break;
            }
            detached.push(self.detach_head(shared)?);
        }
        self.reposition_detached();
        Ok(detached)
    }

    fn close(&mut self, shared: &Shared) -> CoreResult<()> {
        let mut first_error = None;
        for seg in self.segments.values_mut() {
            if seg.is_writing() {
                if let Err(e) = seg.finalize() {
                    first_error.get_or_insert(e);
                }
            }
        }
        for cursor in self.cursors.values_mut() {
            cursor.attached = false;
        }
        if let Err(e) = shared.save_cursors(self) {
            first_error.get_or_insert(e);
        }
        self.closed = true;
        self.segments.clear();
        self.cursors.clear();
        self.write_segment = None;
        first_error.map_or(Ok(()), Err)
    }
}

/// Result of appending through [`Inner::offer`].
pub(crate) struct Appended {
    pub(crate) written: usize,
    pub(crate) rolled: bool,
    pub(crate) detached: Vec<Segment>,
}

pub(crate) fn check_entry_size(len: usize, config: &DequeConfig) -> CoreResult<()> {
    if len as u64 > config.max_entry_size {
        return Err(CoreError::EntryTooLarge {
            size: len as u64,
            max: config.max_entry_size,
        });
    }
    Ok(())
}

fn segment_expired(seg: &Segment, config: &DequeConfig, now: i64) -> bool {
    config.segment_roll_time_limit.is_some_and(|limit| {
        let limit = i64::try_from(limit.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(seg.created_ms()) >= limit
    })
}

/// Builder for [`BinaryDeque`].
pub struct DequeBuilder {
    path: PathBuf,
    nonce: String,
    config: DequeConfig,
    initial_extra: Option<Bytes>,
    scheduler: Option<Arc<RetentionScheduler>>,
    policy: Option<RetentionPolicy>,
}

impl DequeBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: DequeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the extra header of the first segment written by this handle.
    ///
    /// Without it the newest segment's extra header is carried over.
    #[must_use]
    pub fn initial_extra_header(mut self, extra: impl Into<Bytes>) -> Self {
        self.initial_extra = Some(extra.into());
        self
    }

    /// Sets a typed initial extra header.
    #[must_use]
    pub fn initial_extra_header_with<S: ExtraHeaderSerializer>(
        self,
        serializer: &S,
        header: &S::Header,
    ) -> Self {
        self.initial_extra_header(serializer.encode(header))
    }

    /// Shares a retention scheduler between several deques.
    #[must_use]
    pub fn retention_scheduler(mut self, scheduler: Arc<RetentionScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Sets the retention policy; enforcement still has to be started.
    #[must_use]
    pub fn retention_policy(mut self, policy: RetentionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Opens the deque, recovering whatever is on disk.
    ///
    /// # Errors
    ///
    /// - `DequeLocked` if another handle has the deque open
    /// - `InvalidFormat` for unusable directories or a missing interior segment
    /// - I/O errors
    pub fn build(self) -> CoreResult<BinaryDeque> {
        let dir = DequeDir::open(&self.path, &self.nonce, self.config.create_if_missing)?;
        let stats = DequeStats::new();
        let recovered = recover_segments(&dir, &stats)?;

        let mut id_mode = IdMode::Unknown;
        if recovered.segments.values().any(|s| s.ids().is_some()) {
            id_mode = IdMode::Tracked;
        } else if recovered.segments.values().any(|s| s.count() > 0) {
            id_mode = IdMode::Untracked;
        }
        let highest_id = recovered
            .segments
            .last_key_value()
            .map_or(0, |(id, _)| id.as_u64())
            .max(recovered.removed_newest.map_or(0, SegmentId::as_u64));

        let mut inner = Inner {
            segments: recovered.segments,
            write_segment: None,
            cursors: BTreeMap::new(),
            id_mode,
            last_end_id: None,
            next_extra: self
                .initial_extra
                .or(recovered.newest_extra)
                .unwrap_or_default(),
            highest_id,
            retired_floor: 0,
            gap_writer_open: false,
            closed: false,
        };
        inner.refresh_last_end_id();
        let persisted = match dir.load_cursors() {
            Ok(persisted) => persisted,
            Err(e) if e.is_corruption() => {
                warn!(error = %e, "cursor file damaged, durable cursors restart from the head");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        inner.restore_cursors(persisted);

        let shared = Arc::new(Shared {
            dir,
            config: self.config,
            inner: Mutex::new(inner),
            stats,
            retention: Mutex::new(RetentionControl::new(self.scheduler, self.policy)),
            deleter: RwLock::new(None),
        });

        {
            let mut inner = shared.inner.lock();
            let prev = inner.segments.last_key_value().map(|(id, _)| *id);
            let id = inner.next_regular_id()?;
            inner.create_segment(&shared, id, prev)?;
            inner.write_segment = Some(id);
            shared.save_cursors(&inner)?;

            info!(
                dir = %shared.dir.path().display(),
                nonce = shared.dir.nonce(),
                segments = inner.segments.len(),
                cursors = inner.cursors.len(),
                write_segment = %id,
                "opened deque"
            );
        }

        Ok(BinaryDeque { shared })
    }
}

/// A persistent, segmented, multi-reader binary deque.
///
/// Producers append with [`offer`](Self::offer); each named cursor opened
/// with [`open_for_read`](Self::open_for_read) walks the entries forward
/// independently. Segments are deleted once every durable cursor has read
/// past them and no polled buffer refers to them.
///
/// # Example
///
/// ```rust,ignore
/// use pbd_core::BinaryDeque;
/// use std::path::Path;
///
/// let deque = BinaryDeque::open(Path::new("queue"), "orders")?;
/// deque.offer(b"first")?;
///
/// let cursor = deque.open_for_read("export", false)?;
/// while let Some(entry) = cursor.poll()? {
///     handle(entry.payload());
/// }
/// deque.close()?;
/// ```
pub struct BinaryDeque {
    shared: Arc<Shared>,
}

impl BinaryDeque {
    /// Starts building a deque stored in `path` under `nonce`.
    pub fn builder(path: impl AsRef<Path>, nonce: impl Into<String>) -> DequeBuilder {
        DequeBuilder {
            path: path.as_ref().to_path_buf(),
            nonce: nonce.into(),
            config: DequeConfig::default(),
            initial_extra: None,
            scheduler: None,
            policy: None,
        }
    }

    /// Opens or creates a deque with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`DequeBuilder::build`].
    pub fn open(path: impl AsRef<Path>, nonce: impl Into<String>) -> CoreResult<Self> {
        Self::builder(path, nonce).build()
    }

    /// Opens or creates a deque with a custom configuration.
    ///
    /// # Errors
    ///
    /// See [`DequeBuilder::build`].
    pub fn open_with_config(
        path: impl AsRef<Path>,
        nonce: impl Into<String>,
        config: DequeConfig,
    ) -> CoreResult<Self> {
        Self::builder(path, nonce).config(config).build()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Returns the directory holding the deque.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.shared.dir.path()
    }

    /// Returns the nonce.
    #[must_use]
    pub fn nonce(&self) -> &str {
        self.shared.dir.nonce()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DequeConfig {
        &self.shared.config
    }

    /// Checks whether the deque has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    /// Appends an entry to a deque that does not track ids.
    ///
    /// Returns the number of bytes written, framing included.
    ///
    /// # Errors
    ///
    /// - `EntryTooLarge` if the payload exceeds the configured limits
    /// - `InvariantViolation` if the deque tracks ids
    pub fn offer(&self, payload: &[u8]) -> CoreResult<usize> {
        self.offer_at(payload, None, now_millis())
    }

    /// Appends an entry covering ids `start_id..=end_id`.
    ///
    /// Within a segment `start_id` must be one past the previous entry's
    /// `end_id`; the first entry of a new segment may jump forward.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` for invalid or non-monotonic ranges.
    pub fn offer_with_ids(&self, payload: &[u8], start_id: i64, end_id: i64) -> CoreResult<usize> {
        let ids = IdRange::new(start_id, end_id)?;
        self.offer_at(payload, Some(ids), now_millis())
    }

    /// Appends an entry with an explicit timestamp in milliseconds.
    ///
    /// # Errors
    ///
    /// Same as [`offer`](Self::offer) and [`offer_with_ids`](Self::offer_with_ids).
    pub fn offer_at(
        &self,
        payload: &[u8],
        ids: Option<IdRange>,
        timestamp_ms: i64,
    ) -> CoreResult<usize> {
        let appended = {
            let mut inner = self.shared.lock_open()?;
            inner.offer(&self.shared, payload, ids, timestamp_ms)?
        };
        self.shared.dispose(appended.detached, true);
        if appended.rolled {
            self.shared.wake_retention();
        }
        Ok(appended.written)
    }

    /// Writes `payloads` before every stored entry.
    ///
    /// Cursors positioned at the start of the deque read the pushed entries
    /// first, in the order given.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` on deques that track ids.
    pub fn push<I, B>(&self, payloads: I) -> CoreResult<usize>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let config = &self.shared.config;
        let now = now_millis();
        let mut entries = Vec::new();
        for payload in payloads {
            let payload = payload.as_ref();
            check_entry_size(payload.len(), config)?;
            entries.push(encode_entry(payload, None, now, config.compression));
        }
        let mut inner = self.shared.lock_open()?;
        inner.push(&self.shared, entries)
    }

    /// Starts a new segment carrying `extra` as its extra header.
    ///
    /// # Errors
    ///
    /// I/O errors while finalizing or creating segments.
    pub fn update_extra_header(&self, extra: impl Into<Bytes>) -> CoreResult<()> {
        {
            let mut inner = self.shared.lock_open()?;
            inner.update_extra_header(&self.shared, extra.into())?;
        }
        self.shared.wake_retention();
        Ok(())
    }

    /// Starts a new segment carrying a typed extra header.
    ///
    /// # Errors
    ///
    /// See [`update_extra_header`](Self::update_extra_header).
    pub fn update_extra_header_with<S: ExtraHeaderSerializer>(
        &self,
        serializer: &S,
        header: &S::Header,
    ) -> CoreResult<()> {
        self.update_extra_header(serializer.encode(header))
    }

    /// Fsyncs the write segment and persists durable cursor positions.
    ///
    /// # Errors
    ///
    /// I/O errors.
    pub fn sync(&self) -> CoreResult<()> {
        let mut inner = self.shared.lock_open()?;
        inner.write_seg_mut()?.sync()?;
        self.shared.save_cursors(&inner)
    }

    /// Finalizes the write segment, persists cursors and releases the lock.
    ///
    /// Closing twice is a no-op; every other operation fails with
    /// `DequeClosed` afterwards.
    ///
    /// # Errors
    ///
    /// The first I/O error hit while finalizing; the deque is closed anyway.
    pub fn close(&self) -> CoreResult<()> {
        self.shared.shutdown()
    }

    /// Opens the cursor `name`.
    ///
    /// A durable cursor that was closed or dropped earlier, in this process
    /// or a previous one, resumes from its recorded position. New cursors
    /// start at the oldest entry.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the cursor is already open, or if a durable
    /// cursor of that name exists and `transient` is requested.
    pub fn open_for_read(&self, name: &str, transient: bool) -> CoreResult<ReadCursor> {
        let mut inner = self.shared.lock_open()?;
        match inner.cursors.get_mut(name) {
            Some(cursor) if cursor.attached => {
                return Err(CoreError::invalid_operation(format!(
                    "cursor {name:?} is already open"
                )));
            }
            Some(cursor) => {
                if transient {
                    return Err(CoreError::invalid_operation(format!(
                        "cursor {name:?} is durable"
                    )));
                }
                cursor.attached = true;
                debug!(cursor = name, "resumed durable cursor");
            }
            None => {
                inner
                    .cursors
                    .insert(name.to_string(), CursorState::new(transient));
                if !transient {
                    self.shared.save_cursors(&inner)?;
                }
                debug!(cursor = name, transient, "opened cursor");
            }
        }
        Ok(ReadCursor::new(Arc::clone(&self.shared), name.to_string()))
    }

    /// Removes the cursor `name`.
    ///
    /// With `purge_if_last` set, segments now behind every remaining durable
    /// cursor are deleted; when `name` was the last durable cursor its own
    /// final position decides. Transient cursors never purge.
    ///
    /// # Errors
    ///
    /// `CursorNotFound` if no such cursor exists.
    pub fn close_cursor(&self, name: &str, purge_if_last: bool) -> CoreResult<()> {
        close_cursor(&self.shared, name, purge_if_last)
    }

    /// Opens the gap writer.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the deque does not track ids or a gap writer
    /// is already open.
    pub fn open_gap_writer(&self) -> CoreResult<GapWriter> {
        GapWriter::open(Arc::clone(&self.shared))
    }

    /// Sets the retention policy.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` while enforcement is running.
    pub fn set_retention_policy(&self, policy: RetentionPolicy) -> CoreResult<()> {
        self.shared.retention.lock().set_policy(policy)
    }

    /// Returns the current retention policy.
    #[must_use]
    pub fn retention_policy(&self) -> Option<RetentionPolicy> {
        self.shared.retention.lock().policy()
    }

    /// Starts periodic enforcement of the retention policy.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if no policy is set; errors spawning the scheduler.
    pub fn start_retention_policy_enforcement(&self) -> CoreResult<()> {
        self.shared.ensure_open()?;
        let weak = Arc::downgrade(&self.shared);
        self.shared.retention.lock().start(weak)
    }

    /// Stops periodic enforcement.
    pub fn stop_retention_policy_enforcement(&self) {
        self.shared.stop_retention();
    }

    /// Runs one retention pass and returns the number of deleted segments.
    ///
    /// # Errors
    ///
    /// I/O errors while detaching segments.
    pub fn apply_retention_policy(&self) -> CoreResult<usize> {
        self.shared.ensure_open()?;
        self.shared.enforce_retention()
    }

    /// Visits every readable entry oldest first, including the readable
    /// prefix of quarantined segments.
    ///
    /// `scanner` returns `Ok(false)` to stop early. Returns the number of
    /// entries visited. The callback runs under the deque lock.
    ///
    /// # Errors
    ///
    /// Errors returned by `scanner`, and I/O errors.
    pub fn scan_entries<F>(&self, scanner: F) -> CoreResult<u64>
    where
        F: FnMut(&EntryView<'_>) -> CoreResult<bool>,
    {
        let mut inner = self.shared.lock_open()?;
        inner.scan_entries(&self.shared, scanner)
    }

    /// Walks entries oldest first and cuts the deque where `truncator` asks.
    ///
    /// The walk covers the same entries readers see. A cut inside a
    /// quarantined prefix shortens that prefix; later segments are dropped.
    /// Returns the number of segments deleted.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` while polled buffers are outstanding or a gap
    /// writer is open.
    pub fn parse_and_truncate<F>(&self, truncator: F) -> CoreResult<usize>
    where
        F: FnMut(&EntryView<'_>) -> TruncatorResponse,
    {
        let detached = {
            let mut inner = self.shared.lock_open()?;
            inner.parse_and_truncate(&self.shared, truncator)?
        };
        let count = detached.len();
        self.shared.dispose(detached, false);
        Ok(count)
    }

    /// Quarantines a segment; none of its entries remain readable.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if no such segment exists.
    pub fn quarantine_segment(&self, id: SegmentId) -> CoreResult<()> {
        let detached = {
            let mut inner = self.shared.lock_open()?;
            inner.quarantine_at(&self.shared, id, 0, "quarantined on request")?;
            inner.collect_deletable(&self.shared)?
        };
        self.shared.dispose(detached, true);
        Ok(())
    }

    /// Deletes head segments whose entries all end at or before `id`,
    /// regardless of cursor positions.
    ///
    /// Returns the number of deleted segments.
    ///
    /// # Errors
    ///
    /// I/O errors.
    pub fn delete_segments_to_entry_id(&self, id: i64) -> CoreResult<usize> {
        let detached = {
            let mut inner = self.shared.lock_open()?;
            let detached = inner.delete_to_entry_id(&self.shared, id)?;
            if !detached.is_empty() {
                self.shared.save_cursors(&inner)?;
            }
            detached
        };
        let count = detached.len();
        self.shared.dispose(detached, false);
        Ok(count)
    }

    /// Snapshot of every segment, oldest first.
    ///
    /// # Errors
    ///
    /// `DequeClosed` after close.
    pub fn segments(&self) -> CoreResult<Vec<SegmentInfo>> {
        let inner = self.shared.lock_open()?;
        Ok(inner.segments.values().map(Segment::info).collect())
    }

    /// Id of the current write segment.
    ///
    /// # Errors
    ///
    /// `DequeClosed` after close.
    pub fn write_segment_id(&self) -> CoreResult<SegmentId> {
        let inner = self.shared.lock_open()?;
        Ok(inner.write_seg()?.id())
    }

    /// Returns counters for this handle.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Routes segment file removal through `deleter`.
    pub fn register_deferred_deleter(&self, deleter: Arc<dyn DeferredDeleter>) {
        *self.shared.deleter.write() = Some(deleter);
    }
}

impl Drop for BinaryDeque {
    fn drop(&mut self) {
        if let Err(e) = self.shared.shutdown() {
            warn!(error = %e, "failed to close deque cleanly");
        }
    }
}

impl std::fmt::Debug for BinaryDeque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryDeque")
            .field("path", &self.shared.dir.path())
            .field("nonce", &self.shared.dir.nonce())
            .finish_non_exhaustive()
    }
}

/// Closes a cursor and applies the purge rule.
pub(crate) fn close_cursor(shared: &Shared, name: &str, purge_if_last: bool) -> CoreResult<()> {
    let detached = {
        let mut inner = shared.lock_open()?;
        let state = inner
            .cursors
            .remove(name)
            .ok_or_else(|| CoreError::cursor_not_found(name))?;
        if state.transient {
            debug!(cursor = name, "closed transient cursor");
            return Ok(());
        }
        shared.save_cursors(&inner)?;
        debug!(cursor = name, purge_if_last, "closed durable cursor");
        if !purge_if_last {
            return Ok(());
        }
        let remaining = inner.durable_positions();
        if remaining.is_empty() {
            inner.collect_deletable_with(shared, &[state.position])?
        } else {
            inner.collect_deletable_with(shared, &remaining)?
        }
    };
    shared.dispose(detached, true);
    Ok(())
}
