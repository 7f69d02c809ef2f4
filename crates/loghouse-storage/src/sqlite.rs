//! SQLite primary store
//!
//! The transactional tier: builds, tests, and chunk rows live in one
//! SQLite database behind an `sqlx` pool. This implementation uses runtime
//! queries (`sqlx::query` + `Row::try_get`) rather than the compile-time
//! macros so the crate builds without a DATABASE_URL and both backends can
//! compile together.
//!
//! Two properties the rest of the system leans on are enforced here:
//!
//! - **Atomic sequence reservation**: `increment_build_seq` /
//!   `increment_test_seq` are a single `UPDATE … SET seq = seq + n
//!   RETURNING seq` round trip, so two concurrent appenders can never be
//!   handed overlapping sequence ranges.
//! - **Append-only chunks**: the `(build_id, test_id, seq)` primary key
//!   makes overwriting an existing sequence number a constraint violation
//!   rather than a silent data loss.

use std::collections::VecDeque;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use loghouse_core::{ChunkPayload, LogLine};

use crate::error::{Error, Result};
use crate::types::{Build, BuildInfo, StorageTier, Test, TestInfo};
use crate::{LineStream, LogStore};

/// Rows fetched per page when streaming retention candidates.
const OLD_BUILDS_PAGE: i64 = 100;

const SCHEMA_BUILDS: &str = r#"
CREATE TABLE IF NOT EXISTS builds (
    id TEXT PRIMARY KEY,
    builder TEXT NOT NULL,
    buildnum INTEGER NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    started INTEGER NOT NULL,
    task_id TEXT NOT NULL DEFAULT '',
    failed INTEGER NOT NULL DEFAULT 0,
    seq INTEGER NOT NULL DEFAULT 0,
    storage_tier TEXT NOT NULL DEFAULT 'primary'
)
"#;

const INDEX_BUILDS_BUILDER: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_builds_builder_num ON builds(builder, buildnum)";

const INDEX_BUILDS_RETENTION: &str =
    "CREATE INDEX IF NOT EXISTS idx_builds_retention ON builds(failed, started)";

const SCHEMA_TESTS: &str = r#"
CREATE TABLE IF NOT EXISTS tests (
    id TEXT PRIMARY KEY,
    build_id TEXT NOT NULL,
    build_name TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    command TEXT NOT NULL DEFAULT '',
    phase TEXT NOT NULL DEFAULT '',
    started INTEGER NOT NULL,
    ended INTEGER,
    task_id TEXT NOT NULL DEFAULT '',
    failed INTEGER NOT NULL DEFAULT 0,
    seq INTEGER NOT NULL DEFAULT 0
)
"#;

const INDEX_TESTS_BUILD: &str =
    "CREATE INDEX IF NOT EXISTS idx_tests_build_started ON tests(build_id, started)";

// test_id is '' for the build's global log; the primary key doubles as the
// append-only guard on sequence numbers.
const SCHEMA_CHUNKS: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    build_id TEXT NOT NULL,
    test_id TEXT NOT NULL DEFAULT '',
    seq INTEGER NOT NULL,
    lines TEXT NOT NULL,
    PRIMARY KEY (build_id, test_id, seq)
)
"#;

/// Primary-tier store over a SQLite database.
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    /// Open (or create) a file-backed store.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests. Pinned to a single connection: each
    /// SQLite `:memory:` connection is its own database.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA_BUILDS).execute(&self.pool).await?;
        sqlx::query(INDEX_BUILDS_BUILDER).execute(&self.pool).await?;
        sqlx::query(INDEX_BUILDS_RETENTION).execute(&self.pool).await?;
        sqlx::query(SCHEMA_TESTS).execute(&self.pool).await?;
        sqlx::query(INDEX_TESTS_BUILD).execute(&self.pool).await?;
        sqlx::query(SCHEMA_CHUNKS).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a freshly created build. Fails if the id (or the
    /// builder/buildnum pair) already exists.
    pub async fn create_build(&self, build: &Build) -> Result<()> {
        sqlx::query(
            "INSERT INTO builds (id, builder, buildnum, name, started, task_id, failed, seq, storage_tier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&build.id)
        .bind(&build.builder)
        .bind(build.buildnum)
        .bind(&build.name)
        .bind(to_millis(build.started))
        .bind(&build.info.task_id)
        .bind(build.failed)
        .bind(build.seq)
        .bind(build.tier.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a freshly created test under an existing build.
    pub async fn create_test(&self, test: &Test) -> Result<()> {
        sqlx::query(
            "INSERT INTO tests (id, build_id, build_name, name, command, phase, started, ended, task_id, failed, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&test.id)
        .bind(&test.build_id)
        .bind(&test.build_name)
        .bind(&test.name)
        .bind(&test.command)
        .bind(&test.phase)
        .bind(to_millis(test.started))
        .bind(test.ended.map(to_millis))
        .bind(&test.info.task_id)
        .bind(test.failed)
        .bind(test.seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look a build up by its builder name and build number, the
    /// idempotency key for build creation.
    pub async fn find_build_by_builder(
        &self,
        builder: &str,
        buildnum: i64,
    ) -> Result<Option<Build>> {
        let row = sqlx::query("SELECT * FROM builds WHERE builder = ?1 AND buildnum = ?2")
            .bind(builder)
            .bind(buildnum)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| build_from_row(&r)).transpose()
    }

    /// Atomically reserve `count` sequence numbers on a build's global log
    /// and return the new counter value.
    pub async fn increment_build_seq(&self, build_id: &str, count: i64) -> Result<i64> {
        let row = sqlx::query("UPDATE builds SET seq = seq + ?1 WHERE id = ?2 RETURNING seq")
            .bind(count)
            .bind(build_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(r.try_get("seq")?),
            None => Err(Error::BuildNotFound(build_id.to_string())),
        }
    }

    /// Atomically reserve `count` sequence numbers on a test's log and
    /// return the new counter value.
    pub async fn increment_test_seq(&self, test_id: &str, count: i64) -> Result<i64> {
        let row = sqlx::query("UPDATE tests SET seq = seq + ?1 WHERE id = ?2 RETURNING seq")
            .bind(count)
            .bind(test_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(r.try_get("seq")?),
            None => Err(Error::TestNotFound(test_id.to_string())),
        }
    }

    /// Record an explicit failure report. Failed builds are retained
    /// indefinitely.
    pub async fn update_failed_build(&self, build_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE builds SET failed = 1 WHERE id = ?1")
            .bind(build_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::BuildNotFound(build_id.to_string()));
        }
        Ok(())
    }

    /// Stream retention candidates: non-failed builds started before
    /// `cutoff`, oldest first, fetched page by page with a keyset cursor
    /// so the sweep never holds more than a small working set.
    pub fn old_builds(&self, cutoff: DateTime<Utc>) -> BoxStream<'static, Result<Build>> {
        let pool = self.pool.clone();
        let cutoff_ms = to_millis(cutoff);

        struct State {
            pool: SqlitePool,
            cursor: (i64, String),
            buffer: VecDeque<Build>,
            exhausted: bool,
        }

        let state = State {
            pool,
            cursor: (i64::MIN, String::new()),
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::try_unfold(state, move |mut state| async move {
            if state.buffer.is_empty() && !state.exhausted {
                let rows = sqlx::query(
                    "SELECT * FROM builds
                     WHERE failed = 0 AND started < ?1
                       AND (started > ?2 OR (started = ?2 AND id > ?3))
                     ORDER BY started ASC, id ASC
                     LIMIT ?4",
                )
                .bind(cutoff_ms)
                .bind(state.cursor.0)
                .bind(&state.cursor.1)
                .bind(OLD_BUILDS_PAGE)
                .fetch_all(&state.pool)
                .await?;

                state.exhausted = (rows.len() as i64) < OLD_BUILDS_PAGE;
                for row in &rows {
                    let build = build_from_row(row)?;
                    state.cursor = (to_millis(build.started), build.id.clone());
                    state.buffer.push_back(build);
                }
            }

            Ok(state.buffer.pop_front().map(|build| (build, state)))
        })
        .boxed()
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn upload_build_metadata(&self, build: &Build) -> Result<()> {
        // Upsert everything except the sequence counter, which only the
        // reservation path may touch.
        sqlx::query(
            "INSERT INTO builds (id, builder, buildnum, name, started, task_id, failed, seq, storage_tier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 builder = excluded.builder,
                 buildnum = excluded.buildnum,
                 name = excluded.name,
                 started = excluded.started,
                 task_id = excluded.task_id,
                 failed = excluded.failed,
                 storage_tier = excluded.storage_tier",
        )
        .bind(&build.id)
        .bind(&build.builder)
        .bind(build.buildnum)
        .bind(&build.name)
        .bind(to_millis(build.started))
        .bind(&build.info.task_id)
        .bind(build.failed)
        .bind(build.seq)
        .bind(build.tier.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upload_test_metadata(&self, test: &Test) -> Result<()> {
        sqlx::query(
            "INSERT INTO tests (id, build_id, build_name, name, command, phase, started, ended, task_id, failed, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 build_id = excluded.build_id,
                 build_name = excluded.build_name,
                 name = excluded.name,
                 command = excluded.command,
                 phase = excluded.phase,
                 started = excluded.started,
                 ended = excluded.ended,
                 task_id = excluded.task_id,
                 failed = excluded.failed",
        )
        .bind(&test.id)
        .bind(&test.build_id)
        .bind(&test.build_name)
        .bind(&test.name)
        .bind(&test.command)
        .bind(&test.phase)
        .bind(to_millis(test.started))
        .bind(test.ended.map(to_millis))
        .bind(&test.info.task_id)
        .bind(test.failed)
        .bind(test.seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_chunks(
        &self,
        build_id: &str,
        test_id: Option<&str>,
        last_seq: i64,
        chunks: &[ChunkPayload],
    ) -> Result<()> {
        let base = last_seq - chunks.len() as i64;
        let mut tx = self.pool.begin().await?;

        for (k, chunk) in chunks.iter().enumerate() {
            let lines = serde_json::to_string(&chunk.lines)?;
            sqlx::query(
                "INSERT INTO chunks (build_id, test_id, seq, lines) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(build_id)
            .bind(test_id.unwrap_or(""))
            .bind(base + k as i64 + 1)
            .bind(lines)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_build(&self, build_id: &str) -> Result<Option<Build>> {
        let row = sqlx::query("SELECT * FROM builds WHERE id = ?1")
            .bind(build_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| build_from_row(&r)).transpose()
    }

    async fn find_test(&self, build_id: &str, test_id: &str) -> Result<Option<Test>> {
        let row = sqlx::query("SELECT * FROM tests WHERE id = ?1 AND build_id = ?2")
            .bind(test_id)
            .bind(build_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| test_from_row(&r)).transpose()
    }

    async fn find_tests_for_build(&self, build_id: &str) -> Result<Vec<Test>> {
        let rows = sqlx::query("SELECT * FROM tests WHERE build_id = ?1 ORDER BY started ASC")
            .bind(build_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(test_from_row).collect()
    }

    async fn log_lines(&self, build_id: &str, test_id: Option<&str>) -> Result<LineStream> {
        let pool = self.pool.clone();
        let build_id = build_id.to_string();
        let test_id = test_id.unwrap_or("").to_string();

        // Pull one chunk row per step, keyed on the last seen sequence
        // number, then flatten each chunk's lines into the stream.
        let chunks = stream::try_unfold(
            (pool, build_id, test_id, 0i64),
            |(pool, build_id, test_id, cursor)| async move {
                let row = sqlx::query(
                    "SELECT seq, lines FROM chunks
                     WHERE build_id = ?1 AND test_id = ?2 AND seq > ?3
                     ORDER BY seq ASC
                     LIMIT 1",
                )
                .bind(&build_id)
                .bind(&test_id)
                .bind(cursor)
                .fetch_optional(&pool)
                .await?;

                match row {
                    Some(row) => {
                        let seq: i64 = row.try_get("seq")?;
                        let raw: String = row.try_get("lines")?;
                        let lines: Vec<LogLine> = serde_json::from_str(&raw)?;
                        Ok::<_, crate::Error>(Some((lines, (pool, build_id, test_id, seq))))
                    }
                    None => Ok::<_, crate::Error>(None),
                }
            },
        );

        Ok(chunks
            .map_ok(|lines| stream::iter(lines.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    async fn delete_build(&self, build_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let chunks = sqlx::query("DELETE FROM chunks WHERE build_id = ?1")
            .bind(build_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let tests = sqlx::query("DELETE FROM tests WHERE build_id = ?1")
            .bind(build_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let builds = sqlx::query("DELETE FROM builds WHERE id = ?1")
            .bind(build_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        tracing::debug!(
            build_id = %build_id,
            chunks,
            tests,
            "removed build from primary store"
        );
        Ok(chunks + tests + builds)
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(Error::InvalidTimestamp(ms))
}

fn build_from_row(row: &SqliteRow) -> Result<Build> {
    Ok(Build {
        id: row.try_get("id")?,
        builder: row.try_get("builder")?,
        buildnum: row.try_get("buildnum")?,
        name: row.try_get("name")?,
        started: from_millis(row.try_get("started")?)?,
        info: BuildInfo {
            task_id: row.try_get("task_id")?,
        },
        failed: row.try_get("failed")?,
        seq: row.try_get("seq")?,
        tier: StorageTier::parse(row.try_get::<String, _>("storage_tier")?.as_str()),
    })
}

fn test_from_row(row: &SqliteRow) -> Result<Test> {
    Ok(Test {
        id: row.try_get("id")?,
        build_id: row.try_get("build_id")?,
        build_name: row.try_get("build_name")?,
        name: row.try_get("name")?,
        command: row.try_get("command")?,
        phase: row.try_get("phase")?,
        started: from_millis(row.try_get("started")?)?,
        ended: row
            .try_get::<Option<i64>, _>("ended")?
            .map(from_millis)
            .transpose()?,
        info: TestInfo {
            task_id: row.try_get("task_id")?,
        },
        failed: row.try_get("failed")?,
        seq: row.try_get("seq")?,
    })
}
