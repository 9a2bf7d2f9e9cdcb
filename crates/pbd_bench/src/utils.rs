//! Benchmark utilities.

use pbd_core::{BinaryDeque, DequeConfig};
use rand::Rng;
use tempfile::TempDir;

/// Generate random payload data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate a batch of payloads with the specified size.
pub fn generate_payloads(count: usize, payload_size: usize) -> Vec<Vec<u8>> {
    (0..count).map(|_| random_data(payload_size)).collect()
}

/// Open a deque in a fresh temporary directory.
///
/// The directory lives as long as the returned guard.
pub fn temp_deque(config: DequeConfig) -> (BinaryDeque, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let deque =
        BinaryDeque::open_with_config(dir.path(), "bench", config).expect("Failed to open deque");
    (deque, dir)
}

/// Open a deque pre-filled with `count` payloads of `payload_size` bytes.
pub fn filled_deque(config: DequeConfig, count: usize, payload_size: usize) -> (BinaryDeque, TempDir) {
    let (deque, dir) = temp_deque(config);
    let payload = random_data(payload_size);
    for _ in 0..count {
        deque.offer(&payload).expect("Failed to offer");
    }
    (deque, dir)
}
