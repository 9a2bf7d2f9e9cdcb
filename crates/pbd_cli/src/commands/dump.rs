//! Dump command implementation.

use pbd_core::{read_entries, EntryView};
use std::path::Path;

/// Bytes of each payload shown in the dump.
const PREVIEW_LEN: usize = 16;

/// Runs the dump command.
pub fn run(dir: &Path, nonce: &str, limit: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let lines = collect(dir, nonce, limit)?;
    for line in &lines {
        println!("{line}");
    }
    println!();
    println!("{} entries", lines.len());
    Ok(())
}

/// Formats up to `limit` entries, one line each.
pub fn collect(
    dir: &Path,
    nonce: &str,
    limit: Option<usize>,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let max = limit.unwrap_or(usize::MAX);
    let mut lines = Vec::new();
    if max == 0 {
        return Ok(lines);
    }
    read_entries(dir, nonce, |entry| {
        lines.push(format_entry(entry));
        Ok(lines.len() < max)
    })?;
    Ok(lines)
}

fn format_entry(entry: &EntryView<'_>) -> String {
    let ids = match entry.ids {
        Some(range) => format!("{}..={}", range.start, range.end),
        None => "-".to_string(),
    };
    let preview: String = entry
        .payload
        .iter()
        .take(PREVIEW_LEN)
        .map(|b| format!("{b:02x}"))
        .collect();
    let more = if entry.payload.len() > PREVIEW_LEN { ".." } else { "" };
    format!(
        "{}:{:<6} ids={:<14} ts={} len={} {}{}",
        entry.segment,
        entry.index,
        ids,
        entry.timestamp,
        entry.payload.len(),
        preview,
        more
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbd_core::BinaryDeque;
    use tempfile::tempdir;

    #[test]
    fn dump_respects_limit() {
        let temp = tempdir().unwrap();
        {
            let deque = BinaryDeque::open(temp.path(), "d").unwrap();
            for i in 0..5i64 {
                deque.offer_with_ids(&[i as u8; 20], i, i).unwrap();
            }
        }
        let all = collect(temp.path(), "d", None).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all[0].contains("ids=0..=0"));
        assert!(all[0].ends_with(".."));

        let some = collect(temp.path(), "d", Some(2)).unwrap();
        assert_eq!(some.len(), 2);
        assert!(collect(temp.path(), "d", Some(0)).unwrap().is_empty());
    }
}
