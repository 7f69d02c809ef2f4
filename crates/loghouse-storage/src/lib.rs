//! Loghouse Storage Layer
//!
//! Persistence for chunked CI logs behind a single trait with two
//! interchangeable backends:
//!
//! - [`SqliteLogStore`]: the primary transactional store. Holds build and
//!   test metadata, chunk rows, and the per-owner sequence counters whose
//!   atomic reservation makes concurrent appends safe.
//! - [`BucketLogStore`]: the object-store tier, layered over any
//!   [`object_store::ObjectStore`] (Amazon S3 in production, the in-memory
//!   store in tests). Builds flagged at creation are additionally written
//!   here and read exclusively from here.
//!
//! Reads are lazy: [`LogStore::log_lines`] hands back a pull-based stream
//! that fetches one chunk at a time in sequence order, so an arbitrarily
//! large log is never materialized. The [`merge`] module reconstructs
//! time-ordered views across owners from these streams.

pub mod bucket;
pub mod error;
pub mod merge;
pub mod sqlite;
pub mod types;

pub use bucket::BucketLogStore;
pub use error::{Error, Result};
pub use merge::{all_build_logs, execution_window_end, merge_line_streams, merged_test_logs};
pub use sqlite::SqliteLogStore;
pub use types::{Build, BuildInfo, StorageTier, Test, TestInfo};

use async_trait::async_trait;
use futures::stream::BoxStream;
use loghouse_core::{ChunkPayload, LogLine};

/// A lazily produced, sequence-ordered stream of one owner's lines.
///
/// Finite, not restartable, and safe to drop early: dropping the stream
/// releases the underlying backend resources without draining them.
pub type LineStream = BoxStream<'static, Result<LogLine>>;

/// The capability set exposed identically by both storage tiers.
///
/// An owner is either a build's global log (`test_id` absent) or one
/// test's log (`test_id` present); chunks and sequence numbers are tracked
/// per owner. Implementations must never overwrite an existing sequence
/// number; appends are insert-only.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Idempotent upsert of a build's descriptive metadata.
    async fn upload_build_metadata(&self, build: &Build) -> Result<()>;

    /// Idempotent upsert of a test's descriptive metadata.
    async fn upload_test_metadata(&self, test: &Test) -> Result<()>;

    /// Append pre-grouped chunks for one owner.
    ///
    /// `last_seq` is the owner's counter value *after* reservation; chunk
    /// `k` of the batch is stored under `last_seq - len + k + 1`, so a
    /// reserved range is laid down exactly once and gaps from failed
    /// inserts are never reused.
    async fn insert_chunks(
        &self,
        build_id: &str,
        test_id: Option<&str>,
        last_seq: i64,
        chunks: &[ChunkPayload],
    ) -> Result<()>;

    async fn find_build(&self, build_id: &str) -> Result<Option<Build>>;

    async fn find_test(&self, build_id: &str, test_id: &str) -> Result<Option<Test>>;

    /// All tests under a build, sorted by `started` ascending.
    async fn find_tests_for_build(&self, build_id: &str) -> Result<Vec<Test>>;

    /// Stream one owner's lines in (sequence, within-chunk) order.
    ///
    /// Each call produces a fresh stream; streams are not shared between
    /// calls.
    async fn log_lines(&self, build_id: &str, test_id: Option<&str>) -> Result<LineStream>;

    /// Remove a build, its tests, and every chunk under either.
    ///
    /// All-or-nothing from the caller's perspective: transient failures
    /// leave the build eligible for a retried whole-build delete. Returns
    /// the number of records removed, for sweep accounting.
    async fn delete_build(&self, build_id: &str) -> Result<u64>;
}
