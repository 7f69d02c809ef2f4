//! Loghouse Core
//!
//! Shared building blocks for the loghouse log storage service:
//!
//! - [`LogLine`]: the fundamental unit of data, one timestamped line of
//!   CI build or test output, with its `[epoch_seconds, text]` wire format.
//! - [`LogLineItem`]: a line as it appears in a merged view, carrying a
//!   provenance flag (global build log vs. test-owned log).
//! - [`group_lines`]: the chunking engine that partitions a batch of lines
//!   into size-bounded chunks while preserving order exactly.
//! - [`build_id`] / [`new_test_id`]: owner identifier derivation.
//!
//! Everything here is synchronous and storage-agnostic; the storage crate
//! decides where chunks live, this crate decides what a chunk is.

pub mod chunk;
pub mod error;
pub mod ids;
pub mod line;

pub use chunk::{group_lines, ChunkPayload};
pub use error::{Error, Result};
pub use ids::{build_id, new_test_id};
pub use line::{LogLine, LogLineItem};
