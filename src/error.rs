// src/error.rs
//! Error taxonomy. Fetch and delivery errors stay local to one source or one
//! queue entry; storage errors abort the current cycle.

use std::time::Duration;

use thiserror::Error;

/// Source unreachable or malformed. Retried on the next schedule tick.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} answered HTTP {status}")]
    Status { status: u16, url: String },
    #[error("could not parse source content: {0}")]
    Parse(String),
    #[error("fetch timed out after {0:?}")]
    TimedOut(Duration),
}

/// Persistent store unavailable or returning data we cannot read back.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt queue row {fingerprint}: {reason}")]
    Corrupt { fingerprint: String, reason: String },
}

/// Outcome of a failed delivery call, as classified by the channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Network error, 5xx, rate limit. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// The collaborator refused the item. Never retried.
    #[error("rejected: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            DeliveryError::Transient(r) | DeliveryError::Permanent(r) => r,
        }
    }
}

/// Why a scrape or dispatch cycle was abandoned.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("cycle exceeded its budget of {0:?}")]
    TimedOut(Duration),
}

impl CycleError {
    pub fn is_storage(&self) -> bool {
        matches!(self, CycleError::Storage(_))
    }
}

/// Raw scraper output that cannot become an `Item`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("item has neither a usable url nor any text to hash")]
    MissingIdentity,
    #[error("item has an empty title")]
    EmptyTitle,
}
