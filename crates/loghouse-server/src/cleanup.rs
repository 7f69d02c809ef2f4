//! Retention sweep and delete-build worker queue
//!
//! Expired builds are deleted in the background: the sweep finds
//! candidates and enqueues jobs, a fixed pool of workers executes them,
//! and nothing on the sweep path ever waits for a deletion to finish.
//!
//! - The sweep runs only on the elected leader (the [`Leader`] seam is an
//!   external collaborator; a single-node deployment is always leader),
//!   re-checked every cycle.
//! - Candidates are streamed oldest-first with a keyset cursor and capped
//!   at a batch per cycle so the backlog stays bounded.
//! - Each job is retried a fixed number of times on failure, then logged
//!   as permanent and skipped, never fatal to the sweep or the workers.
//! - Failed builds are never candidates; they are retained for manual
//!   inspection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use loghouse_storage::{LogStore, SqliteLogStore, StorageTier};

/// Leadership status, re-checked each sweep cycle.
pub trait Leader: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Single-node deployment: always the leader.
pub struct SingleNodeLeader;

impl Leader for SingleNodeLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

/// Point-in-time queue counters, surfaced on `/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct DeleteBuildJob {
    build_id: String,
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

/// Fixed-size worker pool executing whole-build deletions.
pub struct CleanupQueue {
    tx: mpsc::Sender<DeleteBuildJob>,
    counters: Arc<Counters>,
    workers: Vec<JoinHandle<()>>,
}

impl CleanupQueue {
    /// Spawn `workers` workers deleting through `primary` (and `bucket`
    /// for builds on the object-store tier). `capacity` bounds the number
    /// of queued-but-unstarted jobs; `retries` is per job.
    pub fn new(
        primary: Arc<dyn LogStore>,
        bucket: Option<Arc<dyn LogStore>>,
        workers: usize,
        capacity: usize,
        retries: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<DeleteBuildJob>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let counters = Arc::clone(&counters);
                let primary = Arc::clone(&primary);
                let bucket = bucket.clone();

                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else {
                            // Queue dropped; workers drain and exit.
                            return;
                        };

                        // running before pending, so the pair never reads
                        // as fully idle while a job is in hand.
                        counters.running.fetch_add(1, Ordering::Relaxed);
                        counters.pending.fetch_sub(1, Ordering::Relaxed);

                        let outcome =
                            run_delete_job(&*primary, bucket.as_deref(), &job, retries).await;
                        counters.running.fetch_sub(1, Ordering::Relaxed);
                        match outcome {
                            Ok(removed) => {
                                counters.completed.fetch_add(1, Ordering::Relaxed);
                                tracing::info!(
                                    worker,
                                    build_id = %job.build_id,
                                    removed,
                                    "deleted expired build"
                                );
                            }
                            Err(e) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                tracing::error!(
                                    worker,
                                    build_id = %job.build_id,
                                    error = %e,
                                    "delete-build job failed permanently"
                                );
                            }
                        }
                    }
                })
            })
            .collect();

        Self {
            tx,
            counters,
            workers: handles,
        }
    }

    /// Fire-and-forget enqueue; fails only when the queue is full or shut
    /// down, in which case the build stays eligible for the next cycle.
    pub fn enqueue(&self, build_id: String) -> Result<(), String> {
        // Counted before the send so a worker picking the job up
        // immediately can never drive `pending` below zero.
        self.counters.pending.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(DeleteBuildJob { build_id }) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.counters.pending.fetch_sub(1, Ordering::Relaxed);
                Err(e.to_string())
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.counters.pending.load(Ordering::Relaxed),
            running: self.counters.running.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every enqueued job to finish. Used by tests and graceful
    /// shutdown; the sweep itself never calls this.
    pub async fn wait_idle(&self) {
        loop {
            let stats = self.stats();
            if stats.pending == 0 && stats.running == 0 {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn run_delete_job(
    primary: &dyn LogStore,
    bucket: Option<&dyn LogStore>,
    job: &DeleteBuildJob,
    retries: usize,
) -> Result<u64, loghouse_storage::Error> {
    let mut last_err = None;

    for attempt in 0..=retries {
        match delete_build_everywhere(primary, bucket, &job.build_id).await {
            Ok(removed) => return Ok(removed),
            Err(e) => {
                tracing::warn!(
                    build_id = %job.build_id,
                    attempt,
                    error = %e,
                    "delete-build attempt failed"
                );
                last_err = Some(e);
            }
        }
    }

    Err(last_err.expect("at least one attempt ran"))
}

/// Delete a build from every tier it lives on. Object-store objects go
/// first so a partial failure leaves the build discoverable (and the job
/// retryable) through the primary store.
async fn delete_build_everywhere(
    primary: &dyn LogStore,
    bucket: Option<&dyn LogStore>,
    build_id: &str,
) -> Result<u64, loghouse_storage::Error> {
    let mut removed = 0;

    if let Some(bucket) = bucket {
        let on_bucket_tier = primary
            .find_build(build_id)
            .await?
            .map_or(false, |b| b.tier == StorageTier::Bucket);
        if on_bucket_tier {
            removed += bucket.delete_build(build_id).await?;
        }
    }

    removed += primary.delete_build(build_id).await?;
    Ok(removed)
}

/// One sweep cycle: if leader, enqueue up to `batch_size` expired
/// non-failed builds. Returns how many were enqueued.
pub async fn sweep_once(
    store: &SqliteLogStore,
    queue: &CleanupQueue,
    leader: &dyn Leader,
    retention: Duration,
    batch_size: usize,
) -> usize {
    if !leader.is_leader() {
        return 0;
    }

    let cutoff = Utc::now()
        - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(30));
    let mut candidates = store.old_builds(cutoff);
    let mut enqueued = 0;

    while enqueued < batch_size {
        match candidates.next().await {
            Some(Ok(build)) => {
                if let Err(e) = queue.enqueue(build.id.clone()) {
                    tracing::warn!(build_id = %build.id, error = %e, "cleanup queue rejected job");
                    break;
                }
                enqueued += 1;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "streaming retention candidates failed");
                break;
            }
            None => break,
        }
    }

    enqueued
}

/// Spawn the periodic sweep loop.
pub fn start_sweep(
    store: Arc<SqliteLogStore>,
    queue: Arc<CleanupQueue>,
    leader: Arc<dyn Leader>,
    interval: Duration,
    retention: Duration,
    batch_size: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let enqueued = sweep_once(&store, &queue, &*leader, retention, batch_size).await;
            if enqueued > 0 {
                tracing::info!(enqueued, "retention sweep enqueued expired builds");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use loghouse_core::ChunkPayload;
    use loghouse_storage::{
        Build, BuildInfo, Error as StorageError, LineStream, Result as StorageResult, Test,
    };
    use std::sync::atomic::AtomicUsize;

    struct NotLeader;

    impl Leader for NotLeader {
        fn is_leader(&self) -> bool {
            false
        }
    }

    fn build(id: &str, started_ms: i64, failed: bool) -> Build {
        Build {
            id: id.to_string(),
            builder: format!("builder-{}", id),
            buildnum: 1,
            name: String::new(),
            started: Utc.timestamp_millis_opt(started_ms).unwrap(),
            info: BuildInfo::default(),
            failed,
            seq: 0,
            tier: StorageTier::Primary,
        }
    }

    async fn seeded_store() -> Arc<SqliteLogStore> {
        let store = Arc::new(SqliteLogStore::new_in_memory().await.unwrap());
        store
            .create_build(&build("expired", 1_000_000_000_000, false))
            .await
            .unwrap();
        store
            .create_build(&build("expired-failed", 1_000_000_000_000, true))
            .await
            .unwrap();
        let recent = build("recent", Utc::now().timestamp_millis(), false);
        store.create_build(&recent).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired_non_failed_builds() {
        let store = seeded_store().await;
        let queue = CleanupQueue::new(store.clone(), None, 2, 16, 0);

        let enqueued = sweep_once(
            &store,
            &queue,
            &SingleNodeLeader,
            Duration::from_secs(24 * 60 * 60),
            100,
        )
        .await;
        assert_eq!(enqueued, 1);
        queue.wait_idle().await;

        assert!(store.find_build("expired").await.unwrap().is_none());
        assert!(store.find_build("expired-failed").await.unwrap().is_some());
        assert!(store.find_build("recent").await.unwrap().is_some());
        assert_eq!(queue.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_sweep_is_leader_gated() {
        let store = seeded_store().await;
        let queue = CleanupQueue::new(store.clone(), None, 1, 16, 0);

        let enqueued = sweep_once(
            &store,
            &queue,
            &NotLeader,
            Duration::from_secs(24 * 60 * 60),
            100,
        )
        .await;
        assert_eq!(enqueued, 0);
        assert!(store.find_build("expired").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_respects_batch_size() {
        let store = Arc::new(SqliteLogStore::new_in_memory().await.unwrap());
        for i in 0..5 {
            store
                .create_build(&build(&format!("old-{}", i), 1_000_000_000_000 + i, false))
                .await
                .unwrap();
        }
        let queue = CleanupQueue::new(store.clone(), None, 1, 16, 0);

        let enqueued = sweep_once(
            &store,
            &queue,
            &SingleNodeLeader,
            Duration::from_secs(60),
            3,
        )
        .await;
        assert_eq!(enqueued, 3);
    }

    /// A store whose delete fails a set number of times before working;
    /// everything else delegates to a real in-memory store.
    struct FlakyStore {
        inner: Arc<SqliteLogStore>,
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LogStore for FlakyStore {
        async fn upload_build_metadata(&self, b: &Build) -> StorageResult<()> {
            self.inner.upload_build_metadata(b).await
        }
        async fn upload_test_metadata(&self, t: &Test) -> StorageResult<()> {
            self.inner.upload_test_metadata(t).await
        }
        async fn insert_chunks(
            &self,
            build_id: &str,
            test_id: Option<&str>,
            last_seq: i64,
            chunks: &[ChunkPayload],
        ) -> StorageResult<()> {
            self.inner
                .insert_chunks(build_id, test_id, last_seq, chunks)
                .await
        }
        async fn find_build(&self, build_id: &str) -> StorageResult<Option<Build>> {
            self.inner.find_build(build_id).await
        }
        async fn find_test(&self, build_id: &str, test_id: &str) -> StorageResult<Option<Test>> {
            self.inner.find_test(build_id, test_id).await
        }
        async fn find_tests_for_build(&self, build_id: &str) -> StorageResult<Vec<Test>> {
            self.inner.find_tests_for_build(build_id).await
        }
        async fn log_lines(
            &self,
            build_id: &str,
            test_id: Option<&str>,
        ) -> StorageResult<LineStream> {
            self.inner.log_lines(build_id, test_id).await
        }
        async fn delete_build(&self, build_id: &str) -> StorageResult<u64> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let should_fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(StorageError::BuildNotFound(format!(
                    "injected transient failure for {}",
                    build_id
                )));
            }
            self.inner.delete_build(build_id).await
        }
    }

    #[tokio::test]
    async fn test_job_retries_then_succeeds() {
        let inner = Arc::new(SqliteLogStore::new_in_memory().await.unwrap());
        inner
            .create_build(&build("b0", 1_000_000_000_000, false))
            .await
            .unwrap();
        let flaky = Arc::new(FlakyStore {
            inner: inner.clone(),
            failures_left: AtomicUsize::new(2),
            attempts: AtomicUsize::new(0),
        });

        let queue = CleanupQueue::new(flaky.clone(), None, 1, 4, 3);
        queue.enqueue("b0".to_string()).unwrap();
        queue.wait_idle().await;

        assert_eq!(queue.stats().completed, 1);
        assert_eq!(queue.stats().failed, 0);
        assert!(inner.find_build("b0").await.unwrap().is_none());
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_job_reports_permanent_failure_and_worker_survives() {
        let inner = Arc::new(SqliteLogStore::new_in_memory().await.unwrap());
        inner
            .create_build(&build("b0", 1_000_000_000_000, false))
            .await
            .unwrap();
        inner
            .create_build(&build("b1", 1_000_000_000_001, false))
            .await
            .unwrap();
        let flaky = Arc::new(FlakyStore {
            inner: inner.clone(),
            failures_left: AtomicUsize::new(usize::MAX / 2),
            attempts: AtomicUsize::new(0),
        });

        let queue = CleanupQueue::new(flaky.clone(), None, 1, 4, 1);
        queue.enqueue("b0".to_string()).unwrap();
        queue.wait_idle().await;
        assert_eq!(queue.stats().failed, 1);
        assert!(inner.find_build("b0").await.unwrap().is_some());

        // The worker survived the permanent failure and keeps draining.
        queue.enqueue("b1".to_string()).unwrap();
        queue.wait_idle().await;
        assert_eq!(queue.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_bucket_tier_build_is_deleted_from_both_tiers() {
        use loghouse_storage::BucketLogStore;
        use object_store::memory::InMemory;

        let primary = Arc::new(SqliteLogStore::new_in_memory().await.unwrap());
        let bucket = Arc::new(BucketLogStore::new(Arc::new(InMemory::new())));

        let mut b = build("b0", 1_000_000_000_000, false);
        b.tier = StorageTier::Bucket;
        primary.create_build(&b).await.unwrap();
        bucket.upload_build_metadata(&b).await.unwrap();

        let queue = CleanupQueue::new(
            primary.clone() as Arc<dyn LogStore>,
            Some(bucket.clone() as Arc<dyn LogStore>),
            1,
            4,
            0,
        );
        queue.enqueue("b0".to_string()).unwrap();
        queue.wait_idle().await;

        assert!(primary.find_build("b0").await.unwrap().is_none());
        assert!(bucket.find_build("b0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_fails_when_queue_full() {
        let store = Arc::new(SqliteLogStore::new_in_memory().await.unwrap());
        // Zero workers: nothing drains the channel.
        let queue = CleanupQueue::new(store as Arc<dyn LogStore>, None, 0, 1, 0);

        assert!(queue.enqueue("a".to_string()).is_ok());
        assert!(queue.enqueue("b".to_string()).is_err());
        assert_eq!(queue.stats().pending, 1);
    }

    #[test]
    fn test_single_node_leader() {
        assert!(SingleNodeLeader.is_leader());
    }
}
