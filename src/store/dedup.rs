// src/store/dedup.rs
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::StorageError;
use crate::item::{from_millis, to_millis, Fingerprint};

/// Answer of [`DedupCache::check_and_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    Accepted,
    AlreadySeen,
}

/// Append-only record of every fingerprint ever accepted.
#[derive(Clone)]
pub struct DedupCache {
    pool: SqlitePool,
}

/// Insert-if-absent on an open connection or transaction.
pub(crate) async fn record_on(
    conn: &mut SqliteConnection,
    fingerprint: &Fingerprint,
    source_id: &str,
    seen_at: DateTime<Utc>,
) -> Result<DedupVerdict, sqlx::Error> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO dedup.seen (fingerprint, source_id, first_seen_at) VALUES ($1, $2, $3)",
    )
    .bind(fingerprint.as_str())
    .bind(source_id)
    .bind(to_millis(seen_at))
    .execute(conn)
    .await?;

    Ok(if result.rows_affected() == 1 {
        DedupVerdict::Accepted
    } else {
        DedupVerdict::AlreadySeen
    })
}

impl DedupCache {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record `fingerprint` and report whether this call was the first.
    ///
    /// The uniqueness constraint decides, so concurrent callers never both win.
    pub async fn check_and_record(
        &self,
        fingerprint: &Fingerprint,
        source_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<DedupVerdict, StorageError> {
        let mut conn = self.pool.acquire().await?;
        Ok(record_on(&mut conn, fingerprint, source_id, seen_at).await?)
    }

    pub async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, StorageError> {
        Ok(self.first_seen(fingerprint).await?.is_some())
    }

    pub async fn first_seen(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let ms = sqlx::query_scalar::<_, i64>(
            "SELECT first_seen_at FROM dedup.seen WHERE fingerprint = $1",
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(ms.map(from_millis))
    }

    pub async fn len(&self) -> Result<u64, StorageError> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dedup.seen")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    /// Retention trim: delete the oldest records until at most `max_records`
    /// remain. Fingerprints still present in the queue are never removed.
    pub async fn trim_to(&self, max_records: u64) -> Result<u64, StorageError> {
        let len = self.len().await?;
        if len <= max_records {
            return Ok(0);
        }
        let excess = (len - max_records) as i64;

        // Read victims first; the delete then locks only the dedup file.
        let victims = sqlx::query_scalar::<_, String>(
            r#"
            SELECT s.fingerprint FROM dedup.seen AS s
            WHERE NOT EXISTS (SELECT 1 FROM main.queue AS q WHERE q.fingerprint = s.fingerprint)
            ORDER BY s.first_seen_at ASC
            LIMIT $1
            "#,
        )
        .bind(excess)
        .fetch_all(&self.pool)
        .await?;
        if victims.is_empty() {
            return Ok(0);
        }

        let list = serde_json::Value::from(victims).to_string();
        let result = sqlx::query(
            "DELETE FROM dedup.seen WHERE fingerprint IN (SELECT value FROM json_each($1))",
        )
        .bind(list)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
