// tests/common/mod.rs
//
// Shared helpers: temp stores, stub scrapers and scripted delivery channels.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};

use news_relay::error::{DeliveryError, FetchError};
use news_relay::ingest::types::{RawItem, RawItemStream, Scraper};
use news_relay::notify::{FailureNotice, Notifier};
use news_relay::{Ack, DeliveryChannel, DeliveryContext, Item, Normalizer, Store, StoreOptions};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

pub fn store_options(dir: &Path) -> StoreOptions {
    StoreOptions::new(dir.join("dedup.sqlite"), dir.join("queue.sqlite"))
}

pub async fn open_store(dir: &Path) -> Store {
    Store::open(&store_options(dir)).await.expect("open store")
}

pub fn raw(n: usize) -> RawItem {
    RawItem {
        url: Some(format!("https://news.example.test/story/{n}")),
        title: format!("Story {n}"),
        summary: Some(format!("Summary of story {n}")),
        ..Default::default()
    }
}

pub fn item_at(source: &str, n: usize, at: DateTime<Utc>) -> Item {
    Normalizer::default()
        .normalize(source, raw(n), at)
        .expect("normalize")
}

/// Admit `n` items (0..n) for `source`, first seen one second apart from `t0`.
pub async fn admit_many(store: &Store, source: &str, n: usize) -> Vec<Item> {
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let it = item_at(source, i, t0() + secs(i as i64));
        store.admit(&it).await.expect("admit");
        out.push(it);
    }
    out
}

/// Yields fixed raw items, optionally failing after `fail_after` of them.
pub struct StubScraper {
    pub name: String,
    pub items: Vec<RawItem>,
    pub fail_after: Option<usize>,
}

impl StubScraper {
    pub fn new(name: &str, items: Vec<RawItem>) -> Self {
        Self {
            name: name.into(),
            items,
            fail_after: None,
        }
    }

    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl Scraper for StubScraper {
    fn produce(&self) -> RawItemStream<'_> {
        let mut out: Vec<Result<RawItem, FetchError>> = Vec::new();
        for (i, it) in self.items.iter().enumerate() {
            if self.fail_after == Some(i) {
                out.push(Err(FetchError::Parse("listing page changed".into())));
                break;
            }
            out.push(Ok(it.clone()));
        }
        stream::iter(out).boxed()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Pops scripted results; acks once the script runs out.
#[derive(Default)]
pub struct ScriptedChannel {
    script: Mutex<VecDeque<Result<Ack, DeliveryError>>>,
    calls: AtomicUsize,
    receipts: Mutex<Vec<Option<String>>>,
}

impl ScriptedChannel {
    pub fn new(script: Vec<Result<Ack, DeliveryError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn acking() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Receipt seen on each call, in call order.
    pub fn receipts(&self) -> Vec<Option<String>> {
        self.receipts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedChannel {
    async fn deliver(&self, _item: &Item, ctx: &DeliveryContext<'_>) -> Result<Ack, DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.receipts
            .lock()
            .unwrap()
            .push(ctx.receipt.map(str::to_string));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Ack::default()))
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }
}

/// Rejects items whose title is listed, acks everything else.
pub struct PickyChannel {
    pub reject_titles: Vec<String>,
}

#[async_trait]
impl DeliveryChannel for PickyChannel {
    async fn deliver(&self, item: &Item, _ctx: &DeliveryContext<'_>) -> Result<Ack, DeliveryError> {
        if self.reject_titles.iter().any(|t| *t == item.payload.title) {
            return Err(DeliveryError::Permanent("HTTP 422: rejected".into()));
        }
        Ok(Ack::default())
    }

    fn kind(&self) -> &'static str {
        "picky"
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<FailureNotice>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.notices.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notice: &FailureNotice) -> anyhow::Result<()> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}
