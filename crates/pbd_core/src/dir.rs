//! Deque directory management.
//!
//! A directory may hold several deques; each one owns the files carrying
//! its nonce as prefix:
//!
//! ```text
//! <dir>/
//! ├─ <nonce>.lock          # Advisory lock for single-process access
//! ├─ <nonce>.cursors       # Durable cursor positions
//! ├─ <nonce>_<id>.pbd      # Segment files
//! └─ <nonce>_<id>_q.pbd    # Quarantined segment files
//! ```
//!
//! Segment ids are written in plain decimal, so listings are ordered by the
//! parsed id rather than by file name.

use crate::cursor::{decode_cursors, encode_cursors, PersistedCursor};
use crate::error::{CoreError, CoreResult};
use crate::types::SegmentId;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "pbd";
const QUARANTINE_SUFFIX: &str = "_q";
const CURSOR_EXTENSION: &str = "cursors";
const LOCK_EXTENSION: &str = "lock";

/// A segment file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    /// Segment id parsed from the name.
    pub id: SegmentId,
    /// Full path.
    pub path: PathBuf,
    /// Whether the name carries the quarantine marker.
    pub quarantined: bool,
}

/// The files of one deque inside a directory, with the deque lock held.
#[derive(Debug)]
pub struct DequeDir {
    path: PathBuf,
    nonce: String,
    lock: Mutex<Option<File>>,
}

impl DequeDir {
    /// Opens a deque directory and takes the exclusive lock for `nonce`.
    ///
    /// # Errors
    ///
    /// - `InvalidFormat` if the path is missing (and may not be created)
    ///   or is not a directory, or the nonce cannot be used in file names
    /// - `DequeLocked` if another handle holds the lock
    pub fn open(path: &Path, nonce: &str, create_if_missing: bool) -> CoreResult<Self> {
        validate_nonce(nonce)?;

        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "deque directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(format!("{nonce}.{LOCK_EXTENSION}")))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DequeLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            nonce: nonce.to_string(),
            lock: Mutex::new(Some(lock_file)),
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the deque nonce.
    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Returns the path of a segment file.
    #[must_use]
    pub fn segment_path(&self, id: SegmentId, quarantined: bool) -> PathBuf {
        segment_path(&self.path, &self.nonce, id, quarantined)
    }

    /// Lists this deque's segment files in id order.
    pub fn list_segments(&self) -> CoreResult<Vec<SegmentFile>> {
        list_segment_files(&self.path, &self.nonce)
    }

    /// Renames a segment file to its quarantined name.
    pub(crate) fn quarantine_file(&self, id: SegmentId, current: &Path) -> CoreResult<PathBuf> {
        let target = self.segment_path(id, true);
        if current != target {
            fs::rename(current, &target)?;
            self.sync()?;
        }
        Ok(target)
    }

    /// Returns the path of the cursor file.
    #[must_use]
    pub fn cursor_path(&self) -> PathBuf {
        cursor_path(&self.path, &self.nonce)
    }

    /// Loads durable cursor positions.
    ///
    /// Returns an empty list if no cursor file exists.
    pub fn load_cursors(&self) -> CoreResult<Vec<PersistedCursor>> {
        read_cursor_file(&self.path, &self.nonce)
    }

    /// Saves durable cursor positions atomically.
    ///
    /// Uses write-then-rename:
    /// 1. Write to a temporary file
    /// 2. Sync the temporary file
    /// 3. Rename it over the cursor file
    /// 4. Fsync the directory so the rename is durable
    pub fn save_cursors(&self, cursors: &[PersistedCursor]) -> CoreResult<()> {
        let final_path = self.cursor_path();
        let temp_path = self.path.join(format!("{}.{CURSOR_EXTENSION}.tmp", self.nonce));

        let data = encode_cursors(cursors);
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &final_path)?;
        self.sync()
    }

    /// Releases the exclusive lock.
    pub(crate) fn release_lock(&self) {
        if let Some(file) = self.lock.lock().take() {
            let _ = FileExt::unlock(&file);
        }
    }

    /// Syncs the directory so that creates, renames and deletes are durable.
    pub(crate) fn sync(&self) -> CoreResult<()> {
        sync_directory(&self.path)
    }
}

impl Drop for DequeDir {
    fn drop(&mut self) {
        self.release_lock();
    }
}

/// Returns the file name of a segment.
#[must_use]
pub fn segment_file_name(nonce: &str, id: SegmentId, quarantined: bool) -> String {
    let marker = if quarantined { QUARANTINE_SUFFIX } else { "" };
    format!("{nonce}_{}{marker}.{SEGMENT_EXTENSION}", id.as_u64())
}

fn segment_path(dir: &Path, nonce: &str, id: SegmentId, quarantined: bool) -> PathBuf {
    dir.join(segment_file_name(nonce, id, quarantined))
}

fn cursor_path(dir: &Path, nonce: &str) -> PathBuf {
    dir.join(format!("{nonce}.{CURSOR_EXTENSION}"))
}

/// Parses a segment file name belonging to `nonce`.
///
/// Returns the segment id and whether the file is quarantined, or `None`
/// for files of other deques and unrelated files.
#[must_use]
pub fn parse_segment_file_name(nonce: &str, name: &str) -> Option<(SegmentId, bool)> {
    let rest = name.strip_prefix(nonce)?.strip_prefix('_')?;
    let rest = rest.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
    let (digits, quarantined) = match rest.strip_suffix(QUARANTINE_SUFFIX) {
        Some(digits) => (digits, true),
        None => (rest, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits
        .parse::<u64>()
        .ok()
        .map(|id| (SegmentId::new(id), quarantined))
}

/// Lists the segment files of `nonce` in `dir`, ordered by segment id.
///
/// # Errors
///
/// Returns `InvalidFormat` if two files carry the same segment id.
pub fn list_segment_files(dir: &Path, nonce: &str) -> CoreResult<Vec<SegmentFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some((id, quarantined)) = parse_segment_file_name(nonce, name) {
            files.push(SegmentFile {
                id,
                path: entry.path(),
                quarantined,
            });
        }
    }

    files.sort_by_key(|f| f.id);
    if let Some(pair) = files.windows(2).find(|w| w[0].id == w[1].id) {
        return Err(CoreError::invalid_format(format!(
            "two files for {}: {} and {}",
            pair[0].id,
            pair[0].path.display(),
            pair[1].path.display()
        )));
    }
    Ok(files)
}

/// Reads the cursor file of `nonce` without taking the deque lock.
pub fn read_cursor_file(dir: &Path, nonce: &str) -> CoreResult<Vec<PersistedCursor>> {
    let path = cursor_path(dir, nonce);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read(&path)?;
    if data.is_empty() {
        return Ok(Vec::new());
    }
    decode_cursors(&data)
}

/// Removes a segment file and makes the removal durable.
pub(crate) fn remove_segment_file(dir: &Path, file: &Path) -> CoreResult<()> {
    match fs::remove_file(file) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    sync_directory(dir)
}

fn validate_nonce(nonce: &str) -> CoreResult<()> {
    let bad = nonce.is_empty()
        || nonce.starts_with('.')
        || nonce.contains(['/', '\\', '\0']);
    if bad {
        return Err(CoreError::invalid_format(format!(
            "nonce {nonce:?} cannot be used as a file name prefix"
        )));
    }
    Ok(())
}

/// On Windows, NTFS journaling covers metadata durability and directories
/// cannot be fsynced, so this is a no-op there.
#[cfg(unix)]
fn sync_directory(path: &Path) -> CoreResult<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> CoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("queue");

        let dir = DequeDir::open(&path, "orders", true).unwrap();
        assert!(path.is_dir());
        assert!(path.join("orders.lock").exists());
        assert_eq!(dir.nonce(), "orders");
    }

    #[test]
    fn open_missing_without_create_fails() {
        let temp = tempdir().unwrap();
        let result = DequeDir::open(&temp.path().join("missing"), "orders", false);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn open_file_path_fails() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("plain");
        fs::write(&file, b"not a dir").unwrap();
        let result = DequeDir::open(&file, "orders", true);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _first = DequeDir::open(temp.path(), "orders", true).unwrap();
        let second = DequeDir::open(temp.path(), "orders", true);
        assert!(matches!(second, Err(CoreError::DequeLocked)));

        // A different nonce in the same directory is independent.
        assert!(DequeDir::open(temp.path(), "audit", true).is_ok());
    }

    #[test]
    fn lock_released_on_request() {
        let temp = tempdir().unwrap();
        let first = DequeDir::open(temp.path(), "orders", true).unwrap();
        first.release_lock();
        assert!(DequeDir::open(temp.path(), "orders", true).is_ok());
    }

    #[test]
    fn bad_nonce_rejected() {
        let temp = tempdir().unwrap();
        for nonce in ["", "a/b", ".hidden"] {
            assert!(DequeDir::open(temp.path(), nonce, true).is_err(), "{nonce:?}");
        }
    }

    #[test]
    fn file_name_parsing() {
        let id = SegmentId::new(1_099_511_627_776);
        let name = segment_file_name("my_queue", id, false);
        assert_eq!(name, "my_queue_1099511627776.pbd");
        assert_eq!(parse_segment_file_name("my_queue", &name), Some((id, false)));

        let q = segment_file_name("my_queue", id, true);
        assert_eq!(q, "my_queue_1099511627776_q.pbd");
        assert_eq!(parse_segment_file_name("my_queue", &q), Some((id, true)));

        assert_eq!(parse_segment_file_name("my", &name), None);
        assert_eq!(parse_segment_file_name("my_queue", "my_queue.cursors"), None);
        assert_eq!(parse_segment_file_name("my_queue", "my_queue_12.tmp"), None);
        assert_eq!(parse_segment_file_name("my_queue", "my_queue__q.pbd"), None);
    }

    #[test]
    fn listing_is_numeric() {
        let temp = tempdir().unwrap();
        let dir = DequeDir::open(temp.path(), "q", true).unwrap();
        for (id, quarantined) in [(100u64, false), (9, true), (20, false)] {
            fs::write(dir.segment_path(SegmentId::new(id), quarantined), b"").unwrap();
        }
        fs::write(temp.path().join("other_5.pbd"), b"").unwrap();

        let ids: Vec<_> = dir
            .list_segments()
            .unwrap()
            .iter()
            .map(|f| (f.id.as_u64(), f.quarantined))
            .collect();
        assert_eq!(ids, vec![(9, true), (20, false), (100, false)]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let temp = tempdir().unwrap();
        let dir = DequeDir::open(temp.path(), "q", true).unwrap();
        fs::write(dir.segment_path(SegmentId::new(4), false), b"").unwrap();
        fs::write(dir.segment_path(SegmentId::new(4), true), b"").unwrap();
        assert!(matches!(
            dir.list_segments(),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn quarantine_rename() {
        let temp = tempdir().unwrap();
        let dir = DequeDir::open(temp.path(), "q", true).unwrap();
        let id = SegmentId::new(3);
        let path = dir.segment_path(id, false);
        fs::write(&path, b"data").unwrap();

        let moved = dir.quarantine_file(id, &path).unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read(&moved).unwrap(), b"data");
        assert_eq!(dir.quarantine_file(id, &moved).unwrap(), moved);
    }

    #[test]
    fn cursor_file_roundtrip() {
        let temp = tempdir().unwrap();
        let dir = DequeDir::open(temp.path(), "q", true).unwrap();
        assert!(dir.load_cursors().unwrap().is_empty());

        let cursors = vec![
            PersistedCursor {
                name: "export".into(),
                segment: Some(SegmentId::new(12)),
                index: 4,
            },
            PersistedCursor {
                name: "dr".into(),
                segment: None,
                index: 0,
            },
        ];
        dir.save_cursors(&cursors).unwrap();
        assert_eq!(dir.load_cursors().unwrap(), cursors);
        assert!(!temp.path().join("q.cursors.tmp").exists());
    }

    #[test]
    fn remove_missing_file_is_ok() {
        let temp = tempdir().unwrap();
        remove_segment_file(temp.path(), &temp.path().join("gone.pbd")).unwrap();
    }
}
