// src/item.rs
//! Canonical item record shared by the intake, the store and the dispatcher.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identity of an item; the unique key of the dedup cache and the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash `scope` and `identity` into a hex SHA-256 digest.
    ///
    /// `scope` is the source id for per-source dedup, or `*` for global dedup.
    pub fn derive(scope: &str, identity: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(scope.as_bytes());
        hasher.update(b"\n");
        hasher.update(identity.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an already computed fingerprint (e.g. read back from storage).
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether the same canonical URL seen from two sources is one item or two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    #[default]
    PerSource,
    Global,
}

impl DedupScope {
    pub fn scope_key<'a>(&self, source_id: &'a str) -> &'a str {
        match self {
            DedupScope::PerSource => source_id,
            DedupScope::Global => "*",
        }
    }
}

/// Content handed to delivery channels untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Payload {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// `NEW -> QUEUED -> DELIVERING -> DELIVERED | FAILED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    New,
    Queued,
    Delivering,
    Delivered,
    Failed,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::New => "NEW",
            ItemState::Queued => "QUEUED",
            ItemState::Delivering => "DELIVERING",
            ItemState::Delivered => "DELIVERED",
            ItemState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(ItemState::New),
            "QUEUED" => Some(ItemState::Queued),
            "DELIVERING" => Some(ItemState::Delivering),
            "DELIVERED" => Some(ItemState::Delivered),
            "FAILED" => Some(ItemState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Delivered | ItemState::Failed)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub fingerprint: Fingerprint,
    pub source_id: String,
    pub payload: Payload,
    pub first_seen_at: DateTime<Utc>,
    pub state: ItemState,
}

/// Unix milliseconds, the storage representation of every timestamp.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_depends_on_scope() {
        let a = Fingerprint::derive("bbc", "https://example.test/a");
        let b = Fingerprint::derive("star", "https://example.test/a");
        let a2 = Fingerprint::derive("bbc", "https://example.test/a");
        assert_ne!(a, b);
        assert_eq!(a, a2);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn state_round_trips_through_str() {
        for st in [
            ItemState::New,
            ItemState::Queued,
            ItemState::Delivering,
            ItemState::Delivered,
            ItemState::Failed,
        ] {
            assert_eq!(ItemState::parse(st.as_str()), Some(st));
        }
        assert_eq!(ItemState::parse("bogus"), None);
        assert!(ItemState::Failed.is_terminal());
        assert!(!ItemState::Delivering.is_terminal());
    }

    #[test]
    fn global_scope_ignores_source() {
        assert_eq!(DedupScope::Global.scope_key("bbc"), "*");
        assert_eq!(DedupScope::PerSource.scope_key("bbc"), "bbc");
    }
}
