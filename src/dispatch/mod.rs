// src/dispatch/mod.rs
//! Lease, deliver, settle. At-least-once delivery of queued items to their
//! routed channels, with per-entry settlement.

pub mod backoff;

pub use backoff::RetryPolicy;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, gauge, histogram};
use tracing::{debug, info, warn};

use crate::deliver::{ChannelRegistry, DeliveryContext, Routes};
use crate::error::{DeliveryError, StorageError};
use crate::notify::{FailureNotice, NotifierMux};
use crate::store::{QueueEntry, Retention, Store};

/// Tunables of a [`Dispatcher`].
#[derive(Debug, Clone, Copy)]
pub struct DispatcherOptions {
    pub batch_size: u32,
    pub concurrency: usize,
    /// Upper bound on one channel call.
    pub delivery_timeout: Duration,
    /// Batches leased by one [`Dispatcher::run_cycle`].
    pub max_batches_per_cycle: u32,
    pub retention: Retention,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            batch_size: 20,
            concurrency: 4,
            delivery_timeout: Duration::from_secs(30),
            max_batches_per_cycle: 10,
            retention: Retention::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub leased: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    /// Entries failed because their final lease expired unsettled.
    pub reaped: usize,
    /// Entries left leased because settling them hit a store error.
    pub unsettled: usize,
}

impl DispatchReport {
    fn absorb(&mut self, other: DispatchReport) {
        self.leased += other.leased;
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.failed += other.failed;
        self.reaped += other.reaped;
        self.unsettled += other.unsettled;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Retried,
    Failed,
}

pub struct Dispatcher {
    store: Store,
    channels: ChannelRegistry,
    routes: Routes,
    policy: RetryPolicy,
    notifier: NotifierMux,
    opts: DispatcherOptions,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        channels: ChannelRegistry,
        routes: Routes,
        policy: RetryPolicy,
        notifier: NotifierMux,
        opts: DispatcherOptions,
    ) -> Self {
        Self {
            store,
            channels,
            routes,
            policy,
            notifier,
            opts,
        }
    }

    /// One pass: reap dead final leases, lease a batch due at `now`, deliver
    /// every entry and settle each one on its own.
    ///
    /// Only a failure to reap or lease is an error. A store error while
    /// settling one entry leaves that entry leased; it comes back once the
    /// lease lapses.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DispatchReport, StorageError> {
        crate::metrics::ensure_described();
        let queue = self.store.queue();
        let mut report = DispatchReport::default();

        for entry in queue.reap_exhausted(self.policy.max_attempts, now).await? {
            counter!("news_relay_deliveries_failed_total").increment(1);
            self.notifier.notify(&FailureNotice::from_archived(&entry)).await;
            report.reaped += 1;
        }

        let batch = queue.lease_batch(self.opts.batch_size, now).await?;
        report.leased = batch.len();
        if batch.is_empty() {
            return Ok(report);
        }
        debug!(leased = batch.len(), "dispatch batch leased");

        let leased_at = Instant::now();
        let outcomes: Vec<Result<Outcome, StorageError>> = stream::iter(batch)
            .map(|entry| self.handle(entry, now, leased_at))
            .buffer_unordered(self.opts.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(Outcome::Delivered) => report.delivered += 1,
                Ok(Outcome::Retried) => report.retried += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Err(e) => {
                    warn!(error = %e, "could not settle leased entry");
                    counter!("news_relay_storage_errors_total").increment(1);
                    report.unsettled += 1;
                }
            }
        }
        Ok(report)
    }

    /// Drain due entries in up to `max_batches_per_cycle` passes, then apply
    /// retention and refresh the queue gauges.
    pub async fn run_cycle(&self) -> Result<DispatchReport, StorageError> {
        let mut total = DispatchReport::default();
        for _ in 0..self.opts.max_batches_per_cycle.max(1) {
            let pass = self.run_once(Utc::now()).await?;
            let drained = pass.leased < self.opts.batch_size as usize;
            total.absorb(pass);
            if drained {
                break;
            }
        }

        self.store.maintain(self.opts.retention).await?;

        let now = Utc::now();
        let stats = self.store.queue().stats(now).await?;
        gauge!("news_relay_queue_ready").set(stats.ready as f64);
        gauge!("news_relay_queue_leased").set(stats.leased as f64);
        gauge!("news_relay_queue_waiting").set(stats.waiting as f64);
        gauge!("news_relay_last_dispatch_ts").set(now.timestamp() as f64);

        if total.leased > 0 || total.reaped > 0 {
            info!(
                leased = total.leased,
                delivered = total.delivered,
                retried = total.retried,
                failed = total.failed,
                reaped = total.reaped,
                "dispatch cycle finished"
            );
        }
        Ok(total)
    }

    async fn handle(
        &self,
        entry: QueueEntry,
        now: DateTime<Utc>,
        leased_at: Instant,
    ) -> Result<Outcome, StorageError> {
        let queue = self.store.queue();
        let route = self.routes.route(&entry.source_id);
        if route.is_empty() {
            let reason = format!("no delivery channel routed for source {}", entry.source_id);
            let at = settle_time(now, leased_at);
            return self.settle_failure(&entry, DeliveryError::Permanent(reason), at).await;
        }

        let item = entry.item();
        let mut receipt = entry.receipt.clone();

        for channel_id in route {
            if entry.is_acked_by(channel_id) {
                continue;
            }
            let Some(channel) = self.channels.get(channel_id) else {
                let reason = format!("unknown channel {channel_id}");
                let at = settle_time(now, leased_at);
                return self.settle_failure(&entry, DeliveryError::Permanent(reason), at).await;
            };

            let ctx = DeliveryContext {
                attempt: entry.attempt_count,
                receipt: receipt.as_deref(),
            };
            counter!("news_relay_delivery_attempts_total", "channel" => channel_id.clone()).increment(1);
            let t0 = Instant::now();
            let result = match tokio::time::timeout(self.opts.delivery_timeout, channel.deliver(&item, &ctx)).await {
                Ok(r) => r,
                Err(_) => Err(DeliveryError::Transient(format!(
                    "timed out after {:?}",
                    self.opts.delivery_timeout
                ))),
            };
            histogram!("news_relay_delivery_ms", "channel" => channel_id.clone())
                .record(t0.elapsed().as_secs_f64() * 1_000.0);

            match result {
                Ok(ack) => {
                    queue
                        .record_ack(&entry.fingerprint, channel_id, ack.receipt.as_deref())
                        .await?;
                    debug!(
                        fingerprint = entry.fingerprint.short(),
                        channel = %channel_id,
                        kind = channel.kind(),
                        "channel acked"
                    );
                    if ack.receipt.is_some() {
                        receipt = ack.receipt;
                    }
                }
                Err(e) => {
                    let e = match e {
                        DeliveryError::Transient(r) => DeliveryError::Transient(format!("{channel_id}: {r}")),
                        DeliveryError::Permanent(r) => DeliveryError::Permanent(format!("{channel_id}: {r}")),
                    };
                    debug!(
                        fingerprint = entry.fingerprint.short(),
                        channel = %channel_id,
                        kind = channel.kind(),
                        error = e.reason(),
                        "channel refused"
                    );
                    return self.settle_failure(&entry, e, settle_time(now, leased_at)).await;
                }
            }
        }

        queue.complete(&entry.fingerprint, settle_time(now, leased_at)).await?;
        counter!("news_relay_deliveries_acked_total", "source" => entry.source_id.clone()).increment(1);
        info!(
            fingerprint = entry.fingerprint.short(),
            source = %entry.source_id,
            attempt = entry.attempt_count,
            "delivered"
        );
        Ok(Outcome::Delivered)
    }

    /// `now` is the settle time; backoff is measured from it.
    async fn settle_failure(
        &self,
        entry: &QueueEntry,
        error: DeliveryError,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StorageError> {
        let queue = self.store.queue();
        let attempt = entry.attempt_count;

        if error.is_transient() && !self.policy.exhausted(attempt) {
            let delay = self.policy.delay_after(attempt);
            queue.fail(&entry.fingerprint, error.reason(), delay, now).await?;
            counter!("news_relay_retries_scheduled_total").increment(1);
            warn!(
                fingerprint = entry.fingerprint.short(),
                source = %entry.source_id,
                attempt,
                retry_in_secs = delay.as_secs(),
                error = error.reason(),
                "delivery failed, retry scheduled"
            );
            return Ok(Outcome::Retried);
        }

        let reason = if error.is_transient() {
            format!("gave up after {attempt} attempt(s): {}", error.reason())
        } else {
            error.reason().to_string()
        };
        queue.fail_permanently(&entry.fingerprint, &reason, now).await?;
        counter!("news_relay_deliveries_failed_total").increment(1);
        self.notifier
            .notify(&FailureNotice::from_entry(entry, &reason, now))
            .await;
        Ok(Outcome::Failed)
    }
}

/// Lease time advanced by the wall time spent delivering, so a slow batch
/// does not settle against the clock it was leased with.
fn settle_time(leased: DateTime<Utc>, leased_at: Instant) -> DateTime<Utc> {
    leased + chrono::Duration::from_std(leased_at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
}
