// tests/scrape_cycle.rs
mod common;

use common::*;
use news_relay::error::CycleError;
use news_relay::{DedupScope, Intake, Normalizer, RawItem};

#[tokio::test]
async fn rescraping_the_same_listing_queues_each_item_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let intake = Intake::new(store.clone(), Normalizer::default());
    let scraper = StubScraper::new("bbc", (0..5).map(raw).collect());

    let first = intake.run_cycle("bbc", &scraper, 100).await.unwrap();
    assert_eq!((first.produced, first.accepted, first.already_seen), (5, 5, 0));

    let second = intake.run_cycle("bbc", &scraper, 100).await.unwrap();
    assert_eq!((second.accepted, second.already_seen), (0, 5));
    assert_eq!(store.queue().len().await.unwrap(), 5);
}

#[tokio::test]
async fn tracking_params_do_not_create_new_items() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let intake = Intake::new(store.clone(), Normalizer::default());

    let mut tagged = raw(1);
    tagged.url = Some("https://news.example.test/story/1/?utm_source=rss#comments".into());
    let scraper = StubScraper::new("bbc", vec![raw(1), tagged]);

    let r = intake.run_cycle("bbc", &scraper, 100).await.unwrap();
    assert_eq!((r.accepted, r.already_seen), (1, 1));
}

#[tokio::test]
async fn fetch_error_keeps_items_admitted_before_it() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let intake = Intake::new(store.clone(), Normalizer::default());
    let scraper = StubScraper::new("bbc", (0..5).map(raw).collect()).failing_after(3);

    let err = intake.run_cycle("bbc", &scraper, 100).await.unwrap_err();
    assert!(matches!(err, CycleError::Fetch(_)));
    assert!(!err.is_storage());
    assert_eq!(store.queue().len().await.unwrap(), 3);
}

#[tokio::test]
async fn max_items_and_invalid_items() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let intake = Intake::new(store.clone(), Normalizer::default());

    let mut items: Vec<RawItem> = (0..10).map(raw).collect();
    items[1].title = "  ".into();
    let scraper = StubScraper::new("bbc", items);

    let r = intake.run_cycle("bbc", &scraper, 4).await.unwrap();
    assert_eq!((r.produced, r.accepted, r.invalid), (4, 3, 1));
    assert_eq!(store.queue().len().await.unwrap(), 3);
}

#[tokio::test]
async fn global_scope_merges_sources() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let intake = Intake::new(store.clone(), Normalizer::new(DedupScope::Global));

    let a = StubScraper::new("bbc", vec![raw(1)]);
    let b = StubScraper::new("reuters", vec![raw(1)]);
    assert_eq!(intake.run_cycle("bbc", &a, 100).await.unwrap().accepted, 1);
    assert_eq!(intake.run_cycle("reuters", &b, 100).await.unwrap().already_seen, 1);
}

#[tokio::test]
async fn storage_failure_ends_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let intake = Intake::new(store.clone(), Normalizer::default());
    let scraper = StubScraper::new("bbc", (0..3).map(raw).collect());

    store.close().await;
    let err = intake.run_cycle("bbc", &scraper, 100).await.unwrap_err();
    assert!(matches!(err, CycleError::Storage(_)));
    assert!(err.is_storage());

    let reopened = open_store(dir.path()).await;
    assert_eq!(reopened.queue().len().await.unwrap(), 0);
    assert!(reopened.dedup().is_empty().await.unwrap());
}
