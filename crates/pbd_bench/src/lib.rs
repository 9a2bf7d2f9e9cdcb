//! Shared helpers for the deque benchmarks.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod utils;
