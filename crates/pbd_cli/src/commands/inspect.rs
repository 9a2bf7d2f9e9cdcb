//! Inspect command implementation.

use pbd_core::{inspect_directory, DirectoryReport, SegmentReport, SegmentState};
use serde::Serialize;
use std::path::Path;

/// Deque inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Deque directory.
    pub path: String,
    /// File name prefix.
    pub nonce: String,
    /// Number of segment files.
    pub segment_count: usize,
    /// Readable entries across all segments.
    pub entry_count: u64,
    /// Total size in bytes.
    pub total_size: u64,
    /// Per-segment details.
    pub segments: Vec<SegmentSummary>,
    /// Durable cursors.
    pub cursors: Vec<CursorSummary>,
    /// Why the cursor file could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_problem: Option<String>,
}

/// One segment in the inspection output.
#[derive(Debug, Serialize)]
pub struct SegmentSummary {
    /// Segment id.
    pub id: u64,
    /// Lifecycle state, or `unreadable`.
    pub state: String,
    /// Readable entries.
    pub entries: u32,
    /// File size in bytes.
    pub size: u64,
    /// First entry id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_id: Option<i64>,
    /// Last entry id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_id: Option<i64>,
    /// Extra header length.
    pub extra_header_len: usize,
    /// Problem found while reading framing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

/// One durable cursor in the inspection output.
#[derive(Debug, Serialize)]
pub struct CursorSummary {
    /// Cursor name.
    pub name: String,
    /// Segment being read; absent at the start of the deque.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment: Option<u64>,
    /// Next entry index in that segment.
    pub index: u32,
}

/// Runs the inspect command.
pub fn run(dir: &Path, nonce: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.is_dir() {
        return Err(format!("No deque directory at {:?}", dir).into());
    }

    let report = inspect_directory(dir, nonce, false)?;
    let result = summarize(dir, nonce, &report);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Builds the printable summary of a directory report.
pub fn summarize(dir: &Path, nonce: &str, report: &DirectoryReport) -> InspectResult {
    InspectResult {
        path: dir.display().to_string(),
        nonce: nonce.to_string(),
        segment_count: report.segments.len(),
        entry_count: report.total_entries(),
        total_size: report.total_bytes(),
        segments: report.segments.iter().map(segment_summary).collect(),
        cursors: report
            .cursors
            .iter()
            .map(|c| CursorSummary {
                name: c.name.clone(),
                segment: c.segment.map(|s| s.as_u64()),
                index: c.index,
            })
            .collect(),
        cursor_problem: report.cursor_problem.clone(),
    }
}

fn segment_summary(segment: &SegmentReport) -> SegmentSummary {
    let state = match segment.state {
        Some(SegmentState::Writing) => "writing",
        Some(SegmentState::Finalized) => "finalized",
        Some(SegmentState::Quarantined) => "quarantined",
        Some(SegmentState::Deletable) => "deletable",
        None => "unreadable",
    };
    SegmentSummary {
        id: segment.id.as_u64(),
        state: state.to_string(),
        entries: segment.entries,
        size: segment.size_bytes,
        start_id: segment.ids.map(|r| r.start),
        end_id: segment.ids.map(|r| r.end),
        extra_header_len: segment.extra_header_len,
        problem: segment.problem.clone(),
    }
}

fn print_text_output(result: &InspectResult) {
    println!("PBD Deque Inspection");
    println!("====================");
    println!();
    println!("Path:  {}", result.path);
    println!("Nonce: {}", result.nonce);
    println!();
    println!("Storage:");
    println!("  Segments:   {}", result.segment_count);
    println!("  Entries:    {}", result.entry_count);
    println!("  Total size: {}", format_size(result.total_size));
    println!();
    println!("Segments:");
    for seg in &result.segments {
        let ids = match (seg.start_id, seg.end_id) {
            (Some(start), Some(end)) => format!("ids {start}..={end}"),
            _ => "no ids".to_string(),
        };
        println!(
            "  [{}] {:<11} {:>6} entries  {:>10}  {}",
            seg.id,
            seg.state,
            seg.entries,
            format_size(seg.size),
            ids
        );
        if let Some(problem) = &seg.problem {
            println!("        ! {problem}");
        }
    }

    println!();
    println!("Cursors:");
    if result.cursors.is_empty() {
        println!("  (none)");
    }
    for cursor in &result.cursors {
        match cursor.segment {
            Some(segment) => println!("  {} at segment {} entry {}", cursor.name, segment, cursor.index),
            None => println!("  {} at start", cursor.name),
        }
    }
    if let Some(problem) = &result.cursor_problem {
        println!("  ! cursor file unreadable: {problem}");
    }
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
