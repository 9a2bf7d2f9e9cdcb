//! # PBD Storage
//!
//! Byte-store backends underneath persistent binary deque segments.
//!
//! A backend is an **opaque byte store**. It knows nothing about segment
//! headers, entry framing or checksums; `pbd_core` owns all format
//! interpretation. Each segment file of a deque is backed by one backend.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - one OS file per segment
//! - [`InMemoryBackend`] - for tests and tooling that builds segment images
//!
//! ## Example
//!
//! ```rust
//! use pbd_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! backend.write_at(0, b"j").unwrap();
//! assert_eq!(&backend.read_at(offset, 5).unwrap(), b"jello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
