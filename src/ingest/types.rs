// src/ingest/types.rs
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::FetchError;

/// Scraper output before normalization.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RawItem {
    pub url: Option<String>,
    pub title: String,
    pub summary: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub links: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Lazy, finite sequence of raw items. An `Err` ends the cycle for that source.
pub type RawItemStream<'a> = BoxStream<'a, Result<RawItem, FetchError>>;

/// Anything that can produce raw items for a source: feed readers, page
/// scrapers, browser-rendered pages.
pub trait Scraper: Send + Sync {
    fn produce(&self) -> RawItemStream<'_>;
    fn name(&self) -> &str;
}
