//! # PBD Testkit
//!
//! Test utilities for the persistent binary deque.
//!
//! This crate provides:
//! - Temporary deque fixtures and common scenarios
//! - On-disk corruption helpers for recovery tests
//! - Property-based test generators using proptest
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pbd_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_deque() {
//!     with_temp_deque(|deque| {
//!         deque.offer(b"hello").unwrap();
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod corruption;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::corruption::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use corruption::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
