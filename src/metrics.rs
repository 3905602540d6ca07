// src/metrics.rs
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metric descriptions, so series show up on /metrics with help text.
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("news_relay_scrape_cycles_total", "Scrape cycles started, by source and outcome.");
        describe_counter!("news_relay_cycles_skipped_total", "Triggers skipped because the previous cycle was still running.");
        describe_counter!("news_relay_items_accepted_total", "Items accepted by the dedup cache and queued.");
        describe_counter!("news_relay_items_already_seen_total", "Items rejected by the dedup cache.");
        describe_counter!("news_relay_items_invalid_total", "Raw items the normalizer could not use.");
        describe_counter!("news_relay_fetch_errors_total", "Scraper fetch/parse errors.");
        describe_counter!("news_relay_storage_errors_total", "Persistent store errors that aborted a cycle.");
        describe_counter!("news_relay_delivery_attempts_total", "Delivery calls, by channel.");
        describe_counter!("news_relay_deliveries_acked_total", "Items fully delivered.");
        describe_counter!("news_relay_retries_scheduled_total", "Transient failures scheduled for retry.");
        describe_counter!("news_relay_deliveries_failed_total", "Items moved to FAILED.");
        describe_gauge!("news_relay_queue_ready", "Queue entries due and not leased.");
        describe_gauge!("news_relay_queue_leased", "Queue entries under a valid lease.");
        describe_gauge!("news_relay_queue_waiting", "Queue entries backing off.");
        describe_gauge!("news_relay_last_scrape_ts", "Unix ts of the last finished scrape cycle.");
        describe_gauge!("news_relay_last_dispatch_ts", "Unix ts of the last finished dispatch pass.");
        describe_histogram!("news_relay_delivery_ms", "Delivery call duration in milliseconds.");
        describe_histogram!("news_relay_feed_parse_ms", "Feed XML parse duration in milliseconds.");
    });
}

/// Install the Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
    ensure_described();
    Ok(handle)
}
