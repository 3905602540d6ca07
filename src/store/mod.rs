// src/store/mod.rs
//! SQLite-backed persistent store.
//!
//! The queue database is the `main` schema of every pooled connection and the
//! dedup database is attached as `dedup`. Both live in separate files, yet a
//! single transaction can write to both: this is what makes "mark seen" and
//! "enqueue" one atomic step.
//!
//! The journal stays in rollback mode. In WAL mode SQLite commits each attached
//! file on its own, which would reopen the gap between the two writes.

pub mod dedup;
pub mod queue;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::StorageError;
use crate::item::Item;

pub use dedup::{DedupCache, DedupVerdict};
pub use queue::{ArchivedEntry, PendingQueue, QueueEntry, QueueStats};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS dedup.seen (
        fingerprint   TEXT PRIMARY KEY NOT NULL,
        source_id     TEXT NOT NULL,
        first_seen_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS dedup.seen_by_age ON seen (first_seen_at)",
    r#"
    CREATE TABLE IF NOT EXISTS main.queue (
        fingerprint     TEXT PRIMARY KEY NOT NULL,
        source_id       TEXT NOT NULL,
        payload         TEXT NOT NULL,
        first_seen_at   INTEGER NOT NULL,
        state           TEXT NOT NULL,
        attempt_count   INTEGER NOT NULL DEFAULT 0,
        next_attempt_at INTEGER NOT NULL,
        leased_until    INTEGER,
        last_error      TEXT,
        acked_channels  TEXT NOT NULL DEFAULT '[]',
        receipt         TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS main.queue_ready ON queue (next_attempt_at, first_seen_at)",
    r#"
    CREATE TABLE IF NOT EXISTS main.archive (
        fingerprint   TEXT PRIMARY KEY NOT NULL,
        source_id     TEXT NOT NULL,
        payload       TEXT NOT NULL,
        first_seen_at INTEGER NOT NULL,
        state         TEXT NOT NULL,
        attempt_count INTEGER NOT NULL,
        last_error    TEXT,
        receipt       TEXT,
        finished_at   INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS main.archive_by_state ON archive (state, finished_at)",
];

/// Where the two persisted halves live and how the pool behaves.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub dedup_path: PathBuf,
    pub queue_path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    /// Lease length handed to the pending queue.
    pub visibility_timeout: Duration,
}

impl StoreOptions {
    pub fn new(dedup_path: impl Into<PathBuf>, queue_path: impl Into<PathBuf>) -> Self {
        Self {
            dedup_path: dedup_path.into(),
            queue_path: queue_path.into(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            visibility_timeout: queue::DEFAULT_VISIBILITY,
        }
    }
}

/// Result of the atomic dedup-then-enqueue step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    AlreadySeen,
}

/// Retention limits applied by [`Store::maintain`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Retention {
    pub dedup_max_records: Option<u64>,
    pub archive_max_records: Option<u64>,
}

/// Handle to both persisted locations. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    dedup: DedupCache,
    queue: PendingQueue,
}

impl Store {
    pub async fn open(opts: &StoreOptions) -> Result<Self, StorageError> {
        for path in [&opts.dedup_path, &opts.queue_path] {
            ensure_parent_dir(path).await?;
        }

        let connect = SqliteConnectOptions::new()
            .filename(&opts.queue_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(opts.busy_timeout);

        let dedup_path = opts.dedup_path.to_string_lossy().into_owned();
        let pool = SqlitePoolOptions::new()
            .max_connections(opts.max_connections.max(1))
            .after_connect(move |conn, _meta| {
                let dedup_path = dedup_path.clone();
                Box::pin(async move {
                    sqlx::query("ATTACH DATABASE ?1 AS dedup")
                        .bind(dedup_path)
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA dedup.journal_mode = DELETE")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA dedup.synchronous = FULL")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(connect)
            .await?;

        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }

        info!(
            dedup = %opts.dedup_path.display(),
            queue = %opts.queue_path.display(),
            "store opened"
        );

        Ok(Self {
            dedup: DedupCache::new(pool.clone()),
            queue: PendingQueue::new(pool.clone()).with_visibility_timeout(opts.visibility_timeout),
            pool,
        })
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    /// Record the fingerprint and enqueue the item in one transaction.
    ///
    /// Exactly one of any number of concurrent callers with the same
    /// fingerprint gets `Accepted`. Nothing is queued for `AlreadySeen`.
    pub async fn admit(&self, item: &Item) -> Result<Admission, StorageError> {
        let mut tx = self.pool.begin().await?;

        let verdict =
            dedup::record_on(&mut *tx, &item.fingerprint, &item.source_id, item.first_seen_at)
                .await?;
        if verdict == DedupVerdict::AlreadySeen {
            tx.rollback().await?;
            return Ok(Admission::AlreadySeen);
        }

        if !queue::insert_on(&mut *tx, item).await? {
            // Dedup file was reset while the queue still holds the entry.
            tx.rollback().await?;
            return Ok(Admission::AlreadySeen);
        }
        tx.commit().await?;
        Ok(Admission::Accepted)
    }

    /// Apply retention trims. Returns (dedup rows removed, archive rows removed).
    pub async fn maintain(&self, retention: Retention) -> Result<(u64, u64), StorageError> {
        let dedup_removed = match retention.dedup_max_records {
            Some(max) => self.dedup.trim_to(max).await?,
            None => 0,
        };
        let archive_removed = match retention.archive_max_records {
            Some(max) => self.queue.trim_archive(max).await?,
            None => 0,
        };
        if dedup_removed > 0 || archive_removed > 0 {
            info!(dedup_removed, archive_removed, "retention trim");
        }
        Ok((dedup_removed, archive_removed))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn ensure_parent_dir(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}
