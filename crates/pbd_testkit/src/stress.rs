//! Stress tests for the deque.
//!
//! These helpers drive one deque from many threads at once and report
//! throughput.

use pbd_core::BinaryDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Entries offered by each writer thread.
    pub entries_per_writer: usize,
    /// Number of writer threads.
    pub writers: usize,
    /// Number of reader threads, each with its own durable cursor.
    pub readers: usize,
    /// Payload size in bytes.
    pub payload_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            entries_per_writer: 1_000,
            writers: 4,
            readers: 2,
            payload_size: 256,
        }
    }
}

/// Payload written by `writer` for its `seq`-th entry.
///
/// The first 8 bytes identify the writer and sequence so readers can check
/// per-writer ordering.
pub fn stress_payload(writer: usize, seq: usize, size: usize) -> Vec<u8> {
    let mut payload = vec![writer as u8; size.max(8)];
    payload[..4].copy_from_slice(&(writer as u32).to_le_bytes());
    payload[4..8].copy_from_slice(&(seq as u32).to_le_bytes());
    payload
}

fn decode_stress_payload(payload: &[u8]) -> (usize, usize) {
    let writer = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let seq = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    (writer as usize, seq as usize)
}

/// Runs concurrent writers and readers against `deque`.
///
/// Every reader drains until it has seen every entry, checking that each
/// writer's entries arrive in the order they were offered. Reads that
/// arrive out of order count as failures.
pub fn run_concurrent_stress(deque: Arc<BinaryDeque>, config: &StressConfig) -> StressTestResult {
    let expected = config.writers * config.entries_per_writer;
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let writers_done = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let readers: Vec<_> = (0..config.readers)
        .map(|r| {
            let cursor = deque
                .open_for_read(&format!("stress-reader-{r}"), false)
                .expect("Failed to open cursor");
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let writers_done = Arc::clone(&writers_done);
            let writers = config.writers;
            thread::spawn(move || {
                let mut next_seq = vec![0usize; writers];
                let mut seen = 0;
                while seen < expected {
                    match cursor.poll() {
                        Ok(Some(entry)) => {
                            seen += 1;
                            let (writer, seq) = decode_stress_payload(entry.payload());
                            if writer < writers && next_seq[writer] == seq {
                                next_seq[writer] += 1;
                                successful.fetch_add(1, Ordering::Relaxed);
                            } else {
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Ok(None) => {
                            if writers_done.load(Ordering::Acquire)
                                && cursor.is_empty().unwrap_or(true)
                            {
                                break;
                            }
                            thread::yield_now();
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                    }
                }
                cursor.close(true).ok();
            })
        })
        .collect();

    let writers: Vec<_> = (0..config.writers)
        .map(|w| {
            let deque = Arc::clone(&deque);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let per_writer = config.entries_per_writer;
            let size = config.payload_size;
            thread::spawn(move || {
                for seq in 0..per_writer {
                    match deque.offer(&stress_payload(w, seq, size)) {
                        Ok(_) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for handle in writers {
        handle.join().expect("Writer thread panicked");
    }
    writers_done.store(true, Ordering::Release);
    for handle in readers {
        handle.join().expect("Reader thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Runs a sequential offer stress test.
pub fn run_sequential_offers(deque: &BinaryDeque, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0;
    let mut failed = 0;
    for seq in 0..config.entries_per_writer {
        match deque.offer(&stress_payload(0, seq, config.payload_size)) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }
    StressTestResult::new(successful, failed, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestDeque;

    #[test]
    fn test_sequential_offers() {
        let test_deque = TestDeque::new();
        let config = StressConfig {
            entries_per_writer: 200,
            ..Default::default()
        };
        let result = run_sequential_offers(&test_deque, &config);
        assert_eq!(result.successful_ops, 200);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_stress_payload_roundtrip() {
        let payload = stress_payload(3, 77, 32);
        assert_eq!(payload.len(), 32);
        assert_eq!(decode_stress_payload(&payload), (3, 77));
    }
}
