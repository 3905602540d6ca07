// src/ingest/providers/mod.rs
pub mod rss;

use std::sync::Arc;

use crate::config::{SourceConfig, SourceKind};
use crate::ingest::types::Scraper;

/// Build the scraper for a configured source.
pub fn build_scraper(source: &SourceConfig) -> Arc<dyn Scraper> {
    match source.kind {
        SourceKind::Rss => Arc::new(rss::RssFeedScraper::from_url(&source.id, &source.url)),
    }
}
