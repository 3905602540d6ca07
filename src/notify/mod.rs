// src/notify/mod.rs
//! Operator alerts for items that ended in FAILED.

pub mod slack;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::store::{ArchivedEntry, QueueEntry};

/// One terminal delivery failure.
#[derive(Debug, Clone)]
pub struct FailureNotice {
    pub fingerprint: String,
    pub source_id: String,
    pub title: String,
    pub attempts: u32,
    pub last_error: String,
    pub ts: DateTime<Utc>,
}

impl FailureNotice {
    pub fn from_entry(entry: &QueueEntry, error: &str, ts: DateTime<Utc>) -> Self {
        Self {
            fingerprint: entry.fingerprint.to_string(),
            source_id: entry.source_id.clone(),
            title: entry.payload.title.clone(),
            attempts: entry.attempt_count,
            last_error: error.to_string(),
            ts,
        }
    }

    pub fn from_archived(entry: &ArchivedEntry) -> Self {
        Self {
            fingerprint: entry.fingerprint.to_string(),
            source_id: entry.source_id.clone(),
            title: entry.payload.title.clone(),
            attempts: entry.attempt_count,
            last_error: entry
                .last_error
                .clone()
                .unwrap_or_else(|| "lease expired after final attempt".to_string()),
            ts: entry.finished_at,
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notice: &FailureNotice) -> Result<()>;
}

/// Fans a notice out to every configured notifier. The error log line is
/// always written, even with no notifier configured.
#[derive(Clone, Default)]
pub struct NotifierMux {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl NotifierMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let mut mux = Self::new();
        if std::env::var("SLACK_WEBHOOK_URL").is_ok_and(|v| !v.trim().is_empty()) {
            mux = mux.with(Arc::new(slack::SlackNotifier::from_env()));
        }
        mux
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn notify(&self, notice: &FailureNotice) {
        tracing::error!(
            fingerprint = %notice.fingerprint,
            source = %notice.source_id,
            attempts = notice.attempts,
            error = %notice.last_error,
            title = %notice.title,
            "delivery failed permanently"
        );
        for sink in &self.sinks {
            if let Err(e) = sink.send(notice).await {
                tracing::warn!(error = ?e, "failure notifier error");
            }
        }
    }
}
