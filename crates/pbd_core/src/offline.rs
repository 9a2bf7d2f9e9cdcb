//! Read-only access to a deque directory without opening the deque.
//!
//! Nothing here takes the directory lock, renames, truncates or quarantines
//! a file. Maintenance tools use it to look at a deque that may be open in
//! another process or that crashed and has not been recovered yet.

use crate::cursor::PersistedCursor;
use crate::dir::{list_segment_files, read_cursor_file};
use crate::error::CoreResult;
use crate::recovery::{read_entry, EntryView};
use crate::segment::{Segment, SegmentState, WalkStop};
use crate::types::{IdRange, SegmentId};
use pbd_storage::FileBackend;
use std::path::{Path, PathBuf};

/// What was found in one segment file.
#[derive(Debug, Clone)]
pub struct SegmentReport {
    /// Segment id.
    pub id: SegmentId,
    /// File path.
    pub path: PathBuf,
    /// Header state; `None` when the header cannot be read.
    pub state: Option<SegmentState>,
    /// Entry count recorded in a sealed header.
    pub declared_entries: Option<u32>,
    /// Entries readable from the start of the file.
    pub entries: u32,
    /// File size.
    pub size_bytes: u64,
    /// Id range of the readable entries.
    pub ids: Option<IdRange>,
    /// Length of the extra header.
    pub extra_header_len: usize,
    /// Id of the preceding segment recorded in the header, if any.
    pub prev_id: Option<SegmentId>,
    /// The last frame of an open segment was cut short.
    pub torn_tail: bool,
    /// Damage found in the file.
    pub problem: Option<String>,
}

impl SegmentReport {
    /// Whether the file is usable as is.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.problem.is_none() && self.state != Some(SegmentState::Quarantined)
    }
}

/// Contents of a deque directory.
#[derive(Debug, Clone)]
pub struct DirectoryReport {
    /// Segment files in id order.
    pub segments: Vec<SegmentReport>,
    /// Durable cursors from the cursor file.
    pub cursors: Vec<PersistedCursor>,
    /// Why the cursor file could not be read.
    pub cursor_problem: Option<String>,
}

impl DirectoryReport {
    /// Whether every segment and the cursor file are intact.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.cursor_problem.is_none() && self.segments.iter().all(SegmentReport::is_healthy)
    }

    /// Sum of readable entries.
    #[must_use]
    pub fn total_entries(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.entries)).sum()
    }

    /// Sum of file sizes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }
}

/// Examines every segment file of `nonce` in `path`.
///
/// With `verify` set every payload checksum is checked; otherwise only
/// framing is read.
///
/// # Errors
///
/// I/O errors listing or opening files. Damaged data is reported, not
/// returned as an error.
pub fn inspect_directory(path: &Path, nonce: &str, verify: bool) -> CoreResult<DirectoryReport> {
    let mut segments = Vec::new();
    for file in list_segment_files(path, nonce)? {
        segments.push(inspect_segment(file.id, file.path, verify)?);
    }
    let (cursors, cursor_problem) = match read_cursor_file(path, nonce) {
        Ok(cursors) => (cursors, None),
        Err(e) if e.is_corruption() => (Vec::new(), Some(e.to_string())),
        Err(e) => return Err(e),
    };
    Ok(DirectoryReport {
        segments,
        cursors,
        cursor_problem,
    })
}

fn inspect_segment(id: SegmentId, path: PathBuf, verify: bool) -> CoreResult<SegmentReport> {
    let backend = FileBackend::open_read_only(&path)?;
    let mut report = SegmentReport {
        id,
        path: path.clone(),
        state: None,
        declared_entries: None,
        entries: 0,
        size_bytes: 0,
        ids: None,
        extra_header_len: 0,
        prev_id: None,
        torn_tail: false,
        problem: None,
    };
    let segment = match Segment::open(id, path, Box::new(backend)) {
        Ok(segment) => segment,
        Err(e) if e.is_corruption() => {
            report.size_bytes = std::fs::metadata(&report.path)?.len();
            report.problem = Some(format!("unreadable header: {e}"));
            return Ok(report);
        }
        Err(e) => return Err(e),
    };

    let header = segment.header();
    let state = segment.state();
    report.state = Some(state);
    report.size_bytes = segment.file_size();
    report.extra_header_len = segment.extra().len();
    report.prev_id = (header.prev_id != 0).then(|| SegmentId::new(header.prev_id));
    let limit = (state == SegmentState::Quarantined).then_some(header.entry_count);
    if state.is_sealed() {
        report.declared_entries = Some(header.entry_count);
    }

    let walk = segment.walk(limit, verify)?;
    report.entries = walk.count;
    report.ids = walk.ids;
    match (&walk.stop, state) {
        (WalkStop::Clean | WalkStop::Limit, _) => {}
        (WalkStop::Torn | WalkStop::Checksum { tail: true }, SegmentState::Writing) => {
            report.torn_tail = true;
        }
        (WalkStop::Torn, _) => {
            report.problem = Some(format!("frame {} runs past end of file", walk.count));
        }
        (WalkStop::Corrupt(reason), _) => {
            report.problem = Some(format!("frame {}: {reason}", walk.count));
        }
        (WalkStop::Checksum { .. }, _) => {
            report.problem = Some(format!("frame {} fails its checksum", walk.count));
        }
    }
    if state == SegmentState::Finalized
        && report.problem.is_none()
        && walk.count != header.entry_count
    {
        report.problem = Some(format!(
            "header records {} entries, found {}",
            header.entry_count, walk.count
        ));
    }
    Ok(report)
}

/// Visits the readable entries of every segment in id order.
///
/// Quarantined segments contribute their recorded prefix; reading a segment
/// stops at its first damaged frame. `visitor` returns `Ok(false)` to stop.
/// Returns the number of entries visited.
///
/// # Errors
///
/// Errors returned by `visitor`, and I/O errors.
pub fn read_entries<F>(path: &Path, nonce: &str, mut visitor: F) -> CoreResult<u64>
where
    F: FnMut(&EntryView<'_>) -> CoreResult<bool>,
{
    let mut visited = 0;
    for file in list_segment_files(path, nonce)? {
        let backend = FileBackend::open_read_only(&file.path)?;
        let mut segment = match Segment::open(file.id, file.path, Box::new(backend)) {
            Ok(segment) => segment,
            Err(e) if e.is_corruption() => continue,
            Err(e) => return Err(e),
        };
        let limit = segment
            .is_quarantined()
            .then_some(segment.header().entry_count);
        let walk = segment.walk(limit, false)?;
        segment.apply_walk(&walk);

        let mut offset = segment.data_start();
        for index in 0..segment.count() {
            let Ok((header, payload)) = read_entry(&segment, offset)? else {
                break;
            };
            let view = EntryView {
                segment: file.id,
                index,
                payload: &payload,
                ids: header.ids,
                timestamp: header.timestamp,
                extra_header: segment.extra(),
            };
            if !visitor(&view)? {
                return Ok(visited);
            }
            visited += 1;
            offset += header.frame_len();
        }
    }
    Ok(visited)
}
