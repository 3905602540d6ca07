// tests/dedup_cache.rs
mod common;

use common::*;
use news_relay::store::DedupVerdict;
use news_relay::{Admission, Fingerprint};

#[tokio::test]
async fn concurrent_admits_have_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let item = item_at("bbc", 1, t0());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            let item = item.clone();
            tokio::spawn(async move { store.admit(&item).await })
        })
        .collect();

    let mut accepted = 0;
    for h in handles {
        if h.await.unwrap().unwrap() == Admission::Accepted {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(store.queue().len().await.unwrap(), 1);
    assert_eq!(store.dedup().len().await.unwrap(), 1);
}

#[tokio::test]
async fn check_and_record_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let fp = Fingerprint::derive("bbc", "news.example.test/a");

    let first = store.dedup().check_and_record(&fp, "bbc", t0()).await.unwrap();
    assert_eq!(first, DedupVerdict::Accepted);
    for _ in 0..3 {
        let again = store
            .dedup()
            .check_and_record(&fp, "bbc", t0() + secs(60))
            .await
            .unwrap();
        assert_eq!(again, DedupVerdict::AlreadySeen);
    }
    // first sighting wins
    assert_eq!(store.dedup().first_seen(&fp).await.unwrap(), Some(t0()));
}

#[tokio::test]
async fn seen_set_survives_restart_and_blocks_requeue() {
    let dir = tempfile::tempdir().unwrap();
    let item = item_at("bbc", 7, t0());
    {
        let store = open_store(dir.path()).await;
        assert_eq!(store.admit(&item).await.unwrap(), Admission::Accepted);
        // delivered and gone from the queue
        let leased = store.queue().lease_batch(10, t0()).await.unwrap();
        assert_eq!(leased.len(), 1);
        store.queue().complete(&item.fingerprint, t0()).await.unwrap();
        store.close().await;
    }

    let store = open_store(dir.path()).await;
    assert!(store.dedup().contains(&item.fingerprint).await.unwrap());
    assert_eq!(store.admit(&item).await.unwrap(), Admission::AlreadySeen);
    assert!(store.queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn trim_keeps_fingerprints_still_queued() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let items = admit_many(&store, "bbc", 4).await;

    // deliver the two oldest
    let leased = store.queue().lease_batch(2, t0() + secs(10)).await.unwrap();
    for e in &leased {
        store.queue().complete(&e.fingerprint, t0() + secs(10)).await.unwrap();
    }

    let removed = store.dedup().trim_to(1).await.unwrap();
    assert_eq!(removed, 2);
    assert!(!store.dedup().contains(&items[0].fingerprint).await.unwrap());
    assert!(store.dedup().contains(&items[2].fingerprint).await.unwrap());
    assert!(store.dedup().contains(&items[3].fingerprint).await.unwrap());
}

#[tokio::test]
async fn trim_runs_alongside_admits() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    admit_many(&store, "bbc", 10).await;
    for e in store.queue().lease_batch(10, t0() + secs(60)).await.unwrap() {
        store.queue().complete(&e.fingerprint, t0() + secs(60)).await.unwrap();
    }

    let admits: Vec<_> = (100..112)
        .map(|n| {
            let store = store.clone();
            tokio::spawn(async move { store.admit(&item_at("bbc", n, t0() + secs(120))).await })
        })
        .collect();
    let trims: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.dedup().trim_to(5).await })
        })
        .collect();

    for h in admits {
        h.await.unwrap().expect("admit during trim");
    }
    for h in trims {
        h.await.unwrap().expect("trim during admit");
    }

    assert_eq!(store.queue().len().await.unwrap(), 12);
    for n in 100..112 {
        let it = item_at("bbc", n, t0());
        assert!(store.dedup().contains(&it.fingerprint).await.unwrap());
    }
}
