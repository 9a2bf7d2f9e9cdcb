//! Truncate-to command implementation.

use pbd_core::{BinaryDeque, DequeConfig, TruncatorResponse};
use std::path::Path;

/// Runs the truncate-to command.
///
/// Entries whose ids start after `entry_id` are dropped together with
/// everything behind them. An entry whose range straddles `entry_id` is
/// kept whole. Entries without ids are never cut.
pub fn run(dir: &Path, nonce: &str, entry_id: i64) -> Result<(), Box<dyn std::error::Error>> {
    let deleted = truncate_to(dir, nonce, entry_id)?;
    println!("Truncated deque {nonce} after entry id {entry_id}");
    println!("  Segments deleted: {deleted}");
    Ok(())
}

/// Truncates and returns the number of deleted segments.
pub fn truncate_to(
    dir: &Path,
    nonce: &str,
    entry_id: i64,
) -> Result<usize, Box<dyn std::error::Error>> {
    let config = DequeConfig::default().create_if_missing(false);
    let deque = BinaryDeque::open_with_config(dir, nonce, config)?;
    let deleted = deque.parse_and_truncate(|entry| match entry.ids {
        Some(range) if range.start > entry_id => TruncatorResponse::Full,
        _ => TruncatorResponse::NoTruncate,
    })?;
    deque.close()?;
    Ok(deleted)
}
