// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod deliver;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod item;
pub mod metrics;
pub mod notify;
pub mod scheduler;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::AppConfig;
pub use crate::deliver::{Ack, ChannelRegistry, DeliveryChannel, DeliveryContext, Routes};
pub use crate::dispatch::{DispatchReport, Dispatcher, DispatcherOptions, RetryPolicy};
pub use crate::error::{CycleError, DeliveryError, FetchError, NormalizeError, StorageError};
pub use crate::ingest::types::{RawItem, Scraper};
pub use crate::ingest::{CycleReport, Intake, Normalizer};
pub use crate::item::{DedupScope, Fingerprint, Item, ItemState, Payload};
pub use crate::notify::{FailureNotice, Notifier, NotifierMux};
pub use crate::scheduler::{CycleGate, Scheduler, SourceSpec, TriggerOutcome};
pub use crate::store::{Admission, Retention, Store, StoreOptions};
