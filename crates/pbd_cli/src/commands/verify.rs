//! Verify command implementation.

use super::inspect::format_size;
use pbd_core::{inspect_directory, DirectoryReport, SegmentState};
use std::path::Path;

/// Runs the verify command.
///
/// Fails when any segment is damaged or quarantined, or the cursor file
/// cannot be read.
pub fn run(dir: &Path, nonce: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying deque {nonce} at {:?}", dir);
    println!();

    let report = inspect_directory(dir, nonce, true)?;
    print_report(&report);

    println!();
    if report.is_healthy() {
        println!("✓ Deque verification passed");
        Ok(())
    } else {
        println!("✗ Deque verification failed");
        Err("Verification failed".into())
    }
}

fn print_report(report: &DirectoryReport) {
    let mut quarantined = 0;
    let mut damaged = 0;
    let mut torn = 0;
    for seg in &report.segments {
        let status = if let Some(problem) = &seg.problem {
            damaged += 1;
            format!("DAMAGED: {problem}")
        } else if seg.state == Some(SegmentState::Quarantined) {
            quarantined += 1;
            "quarantined".to_string()
        } else if seg.torn_tail {
            torn += 1;
            "ok (torn tail, repaired on next open)".to_string()
        } else {
            "ok".to_string()
        };
        println!(
            "  [{}] {} entries, {}: {}",
            seg.id,
            seg.entries,
            format_size(seg.size_bytes),
            status
        );
    }
    println!();
    println!("Segments checked: {}", report.segments.len());
    println!("Entries verified: {}", report.total_entries());
    println!("Damaged:          {damaged}");
    println!("Quarantined:      {quarantined}");
    println!("Torn tails:       {torn}");
    match &report.cursor_problem {
        Some(problem) => println!("Cursor file:      DAMAGED: {problem}"),
        None => println!("Cursor file:      ok ({} cursors)", report.cursors.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbd_core::BinaryDeque;
    use tempfile::tempdir;

    #[test]
    fn clean_deque_passes() {
        let temp = tempdir().unwrap();
        {
            let deque = BinaryDeque::open(temp.path(), "v").unwrap();
            deque.offer(b"payload").unwrap();
        }
        assert!(run(temp.path(), "v").is_ok());
    }

    #[test]
    fn quarantined_segment_fails() {
        let temp = tempdir().unwrap();
        {
            let deque = BinaryDeque::open(temp.path(), "v").unwrap();
            deque.offer(b"payload").unwrap();
            let id = deque.write_segment_id().unwrap();
            deque.quarantine_segment(id).unwrap();
        }
        assert!(run(temp.path(), "v").is_err());
    }
}
