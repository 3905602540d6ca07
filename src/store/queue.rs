// src/store/queue.rs
//! Durable queue of accepted items awaiting delivery.
//!
//! A row exists from admission until the item reaches a terminal state, at
//! which point it moves to `archive` in the same transaction. Leasing stamps
//! `leased_until`; an entry whose lease lapses (crash, cancelled dispatch)
//! becomes leasable again, so delivery is at-least-once.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::StorageError;
use crate::item::{from_millis, to_millis, Fingerprint, Item, ItemState, Payload};

pub(crate) const DEFAULT_VISIBILITY: Duration = Duration::from_secs(300);

const QUEUE_COLUMNS: &str = "fingerprint, source_id, payload, first_seen_at, state, attempt_count, \
     next_attempt_at, leased_until, last_error, acked_channels, receipt";

const ARCHIVE_COLUMNS: &str = "fingerprint, source_id, payload, first_seen_at, state, attempt_count, \
     last_error, receipt, finished_at";

/// A queued item plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    pub fingerprint: Fingerprint,
    pub source_id: String,
    pub payload: Payload,
    pub first_seen_at: DateTime<Utc>,
    pub state: ItemState,
    /// Attempts started so far, including one currently leased.
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub leased_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Channels that already acknowledged this item.
    pub acked_channels: Vec<String>,
    /// Receipt returned by the last acknowledging channel (e.g. published URL).
    pub receipt: Option<String>,
}

impl QueueEntry {
    pub fn item(&self) -> Item {
        Item {
            fingerprint: self.fingerprint.clone(),
            source_id: self.source_id.clone(),
            payload: self.payload.clone(),
            first_seen_at: self.first_seen_at,
            state: self.state,
        }
    }

    pub fn is_acked_by(&self, channel: &str) -> bool {
        self.acked_channels.iter().any(|c| c == channel)
    }
}

/// A terminal (`DELIVERED` or `FAILED`) entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedEntry {
    pub fingerprint: Fingerprint,
    pub source_id: String,
    pub payload: Payload,
    pub first_seen_at: DateTime<Utc>,
    pub state: ItemState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub receipt: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Due now and not leased.
    pub ready: u64,
    /// Lease still valid.
    pub leased: u64,
    /// Backing off until a later `next_attempt_at`.
    pub waiting: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    fingerprint: String,
    source_id: String,
    payload: String,
    first_seen_at: i64,
    state: String,
    attempt_count: i64,
    next_attempt_at: i64,
    leased_until: Option<i64>,
    last_error: Option<String>,
    acked_channels: String,
    receipt: Option<String>,
}

impl TryFrom<QueueRow> for QueueEntry {
    type Error = StorageError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StorageError::Corrupt {
            fingerprint: row.fingerprint.clone(),
            reason,
        };
        let payload: Payload =
            serde_json::from_str(&row.payload).map_err(|e| corrupt(format!("payload: {e}")))?;
        let acked_channels: Vec<String> = serde_json::from_str(&row.acked_channels)
            .map_err(|e| corrupt(format!("acked_channels: {e}")))?;
        let state = ItemState::parse(&row.state)
            .ok_or_else(|| corrupt(format!("unknown state {}", row.state)))?;

        Ok(Self {
            fingerprint: Fingerprint::from_stored(row.fingerprint),
            source_id: row.source_id,
            payload,
            first_seen_at: from_millis(row.first_seen_at),
            state,
            attempt_count: clamp_count(row.attempt_count),
            next_attempt_at: from_millis(row.next_attempt_at),
            leased_until: row.leased_until.map(from_millis),
            last_error: row.last_error,
            acked_channels,
            receipt: row.receipt,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ArchiveRow {
    fingerprint: String,
    source_id: String,
    payload: String,
    first_seen_at: i64,
    state: String,
    attempt_count: i64,
    last_error: Option<String>,
    receipt: Option<String>,
    finished_at: i64,
}

impl TryFrom<ArchiveRow> for ArchivedEntry {
    type Error = StorageError;

    fn try_from(row: ArchiveRow) -> Result<Self, Self::Error> {
        let payload: Payload =
            serde_json::from_str(&row.payload).map_err(|e| StorageError::Corrupt {
                fingerprint: row.fingerprint.clone(),
                reason: format!("payload: {e}"),
            })?;
        let state = ItemState::parse(&row.state).ok_or_else(|| StorageError::Corrupt {
            fingerprint: row.fingerprint.clone(),
            reason: format!("unknown state {}", row.state),
        })?;

        Ok(Self {
            fingerprint: Fingerprint::from_stored(row.fingerprint),
            source_id: row.source_id,
            payload,
            first_seen_at: from_millis(row.first_seen_at),
            state,
            attempt_count: clamp_count(row.attempt_count),
            last_error: row.last_error,
            receipt: row.receipt,
            finished_at: from_millis(row.finished_at),
        })
    }
}

fn clamp_count(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Insert a fresh `QUEUED` row. Returns `false` if the fingerprint is already queued.
pub(crate) async fn insert_on(conn: &mut SqliteConnection, item: &Item) -> Result<bool, StorageError> {
    let payload = serde_json::to_string(&item.payload).map_err(|e| StorageError::Corrupt {
        fingerprint: item.fingerprint.to_string(),
        reason: format!("payload does not serialize: {e}"),
    })?;
    let first_seen = to_millis(item.first_seen_at);

    let result = sqlx::query(
        r#"
        INSERT INTO main.queue (fingerprint, source_id, payload, first_seen_at, state, attempt_count, next_attempt_at)
        VALUES ($1, $2, $3, $4, $5, 0, $4)
        ON CONFLICT (fingerprint) DO NOTHING
        "#,
    )
    .bind(item.fingerprint.as_str())
    .bind(&item.source_id)
    .bind(payload)
    .bind(first_seen)
    .bind(ItemState::Queued.as_str())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Move a queue row into the archive with a terminal state.
async fn archive_on(
    conn: &mut SqliteConnection,
    fingerprint: &str,
    state: ItemState,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let sql = format!(
        "INSERT OR REPLACE INTO main.archive ({ARCHIVE_COLUMNS}) \
         SELECT fingerprint, source_id, payload, first_seen_at, $2, attempt_count, last_error, receipt, $3 \
         FROM main.queue WHERE fingerprint = $1"
    );
    let copied = sqlx::query(&sql)
        .bind(fingerprint)
        .bind(state.as_str())
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;
    if copied.rows_affected() == 0 {
        return Ok(false);
    }
    sqlx::query("DELETE FROM main.queue WHERE fingerprint = $1")
        .bind(fingerprint)
        .execute(&mut *conn)
        .await?;
    Ok(true)
}

/// Handle to the pending queue. Cheap to clone.
#[derive(Clone)]
pub struct PendingQueue {
    pool: SqlitePool,
    visibility: Duration,
}

impl PendingQueue {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            visibility: DEFAULT_VISIBILITY,
        }
    }

    /// How long a lease hides an entry from other dispatch passes.
    pub fn with_visibility_timeout(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    /// Enqueue outside the dedup gate. A second call for a fingerprint that is
    /// still queued is a no-op and returns `false`.
    pub async fn enqueue(&self, item: &Item) -> Result<bool, StorageError> {
        let mut conn = self.pool.acquire().await?;
        insert_on(&mut conn, item).await
    }

    /// Claim up to `max_n` due entries, oldest-ready first.
    ///
    /// Claimed entries are hidden from other callers until the visibility
    /// timeout lapses. Each lease counts as one started attempt.
    pub async fn lease_batch(
        &self,
        max_n: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        if max_n == 0 {
            return Ok(Vec::new());
        }
        let now_ms = to_millis(now);
        let sql = format!(
            r#"
            UPDATE main.queue
            SET state = $1, leased_until = $2, attempt_count = attempt_count + 1
            WHERE fingerprint IN (
                SELECT fingerprint FROM main.queue
                WHERE next_attempt_at <= $3
                  AND (leased_until IS NULL OR leased_until <= $3)
                ORDER BY next_attempt_at ASC, first_seen_at ASC, fingerprint ASC
                LIMIT $4
            )
            RETURNING {QUEUE_COLUMNS}
            "#
        );
        let rows = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(ItemState::Delivering.as_str())
            .bind(now_ms.saturating_add(duration_ms(self.visibility)))
            .bind(now_ms)
            .bind(i64::from(max_n))
            .fetch_all(&self.pool)
            .await?;

        let mut entries = rows
            .into_iter()
            .map(QueueEntry::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the subquery order.
        entries.sort_by(|a, b| {
            (a.next_attempt_at, a.first_seen_at, &a.fingerprint)
                .cmp(&(b.next_attempt_at, b.first_seen_at, &b.fingerprint))
        });
        Ok(entries)
    }

    /// Persist that `channel` acknowledged the item, so a retry skips it.
    pub async fn record_ack(
        &self,
        fingerprint: &Fingerprint,
        channel: &str,
        receipt: Option<&str>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE main.queue
            SET acked_channels = json_insert(acked_channels, '$[#]', $2),
                receipt = COALESCE($3, receipt)
            WHERE fingerprint = $1
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(channel)
        .bind(receipt)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal success: archive as `DELIVERED`.
    pub async fn complete(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let done = archive_on(&mut *tx, fingerprint.as_str(), ItemState::Delivered, now).await?;
        tx.commit().await?;
        Ok(done)
    }

    /// Release the lease and schedule a retry `backoff` after `now`.
    pub async fn fail(
        &self,
        fingerprint: &Fingerprint,
        error: &str,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let next = to_millis(now).saturating_add(duration_ms(backoff));
        let result = sqlx::query(
            r#"
            UPDATE main.queue
            SET state = $2, leased_until = NULL, last_error = $3, next_attempt_at = $4
            WHERE fingerprint = $1
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(ItemState::Queued.as_str())
        .bind(error)
        .bind(next)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal failure: record `error` and archive as `FAILED`.
    pub async fn fail_permanently(
        &self,
        fingerprint: &Fingerprint,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE main.queue SET last_error = $2 WHERE fingerprint = $1")
            .bind(fingerprint.as_str())
            .bind(error)
            .execute(&mut *tx)
            .await?;
        let done = archive_on(&mut *tx, fingerprint.as_str(), ItemState::Failed, now).await?;
        tx.commit().await?;
        Ok(done)
    }

    /// Fail entries whose lease lapsed after their last permitted attempt.
    /// Such an entry was leased `max_attempts` times and never settled.
    pub async fn reap_exhausted(
        &self,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<ArchivedEntry>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let reaped: Vec<String> = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE main.queue
            SET last_error = COALESCE(last_error || '; ', '') || 'lease expired after final attempt'
            WHERE leased_until IS NOT NULL AND leased_until <= $1 AND attempt_count >= $2
            RETURNING fingerprint
            "#,
        )
        .bind(to_millis(now))
        .bind(i64::from(max_attempts))
        .fetch_all(&mut *tx)
        .await?;

        for fp in &reaped {
            archive_on(&mut *tx, fp, ItemState::Failed, now).await?;
        }
        tx.commit().await?;

        let mut out = Vec::with_capacity(reaped.len());
        for fp in reaped {
            if let Some(entry) = self.archived(&Fingerprint::from_stored(fp)).await? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<QueueEntry>, StorageError> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM main.queue WHERE fingerprint = $1");
        sqlx::query_as::<_, QueueRow>(&sql)
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(QueueEntry::try_from)
            .transpose()
    }

    pub async fn archived(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ArchivedEntry>, StorageError> {
        let sql = format!("SELECT {ARCHIVE_COLUMNS} FROM main.archive WHERE fingerprint = $1");
        sqlx::query_as::<_, ArchiveRow>(&sql)
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(ArchivedEntry::try_from)
            .transpose()
    }

    /// Most recent terminal failures first.
    pub async fn failed(&self, limit: u32) -> Result<Vec<ArchivedEntry>, StorageError> {
        let sql = format!(
            "SELECT {ARCHIVE_COLUMNS} FROM main.archive WHERE state = $1 \
             ORDER BY finished_at DESC, fingerprint ASC LIMIT $2"
        );
        sqlx::query_as::<_, ArchiveRow>(&sql)
            .bind(ItemState::Failed.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ArchivedEntry::try_from)
            .collect()
    }

    /// Number of non-terminal entries.
    pub async fn len(&self) -> Result<u64, StorageError> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM main.queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StorageError> {
        let (ready, leased, waiting): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN (leased_until IS NULL OR leased_until <= $1) AND next_attempt_at <= $1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN leased_until > $1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN (leased_until IS NULL OR leased_until <= $1) AND next_attempt_at > $1 THEN 1 ELSE 0 END), 0)
            FROM main.queue
            "#,
        )
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await?;

        let (delivered, failed): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN state = 'DELIVERED' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'FAILED' THEN 1 ELSE 0 END), 0)
            FROM main.archive
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            ready: ready.max(0) as u64,
            leased: leased.max(0) as u64,
            waiting: waiting.max(0) as u64,
            delivered: delivered.max(0) as u64,
            failed: failed.max(0) as u64,
        })
    }

    /// Keep at most `max_records` archived entries, dropping the oldest.
    pub async fn trim_archive(&self, max_records: u64) -> Result<u64, StorageError> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM main.archive")
            .fetch_one(&self.pool)
            .await?
            .max(0) as u64;
        if total <= max_records {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM main.archive WHERE fingerprint IN (
                SELECT fingerprint FROM main.archive ORDER BY finished_at ASC LIMIT $1
            )
            "#,
        )
        .bind((total - max_records) as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
