// src/scheduler.rs
//! Recurring scrape and dispatch cycles. Each source (and the dispatcher) has
//! a [`CycleGate`]; a trigger that finds its gate taken is skipped, never queued.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::CycleError;
use crate::ingest::types::Scraper;
use crate::ingest::{CycleReport, Intake};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;

/// Per-source state token: `Idle` or `Running`, flipped by compare-and-swap.
#[derive(Debug, Default)]
pub struct CycleGate(AtomicU8);

impl CycleGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(IDLE)))
    }

    /// Claim the gate. `None` if a cycle already holds it.
    pub fn try_enter(self: &Arc<Self>) -> Option<CycleGuard> {
        self.0
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard(Arc::clone(self)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }
}

/// Holds a gate open; releases it on drop, whether the cycle returned,
/// failed, timed out or panicked.
#[derive(Debug)]
pub struct CycleGuard(Arc<CycleGate>);

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.0 .0.store(IDLE, Ordering::Release);
    }
}

#[derive(Debug)]
pub enum TriggerOutcome<T> {
    Started(JoinHandle<T>),
    /// The previous cycle of this source is still running.
    Skipped,
    UnknownSource,
}

impl<T> TriggerOutcome<T> {
    pub fn is_started(&self) -> bool {
        matches!(self, TriggerOutcome::Started(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TriggerOutcome::Skipped)
    }
}

/// A scrape job registered with the scheduler.
pub struct SourceSpec {
    pub id: String,
    pub scraper: Arc<dyn Scraper>,
    pub interval: Duration,
    /// Wall-clock limit of one cycle.
    pub budget: Duration,
    pub max_items: usize,
}

struct SourceSlot {
    spec: SourceSpec,
    gate: Arc<CycleGate>,
}

pub type ScrapeResult = Result<CycleReport, CycleError>;
pub type DispatchResult = Result<DispatchReport, CycleError>;

pub struct Scheduler {
    intake: Intake,
    dispatcher: Arc<Dispatcher>,
    sources: Vec<Arc<SourceSlot>>,
    dispatch_interval: Duration,
    dispatch_budget: Duration,
    dispatch_gate: Arc<CycleGate>,
}

impl Scheduler {
    pub fn new(intake: Intake, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            intake,
            dispatcher,
            sources: Vec::new(),
            dispatch_interval: Duration::from_secs(60),
            dispatch_budget: Duration::from_secs(600),
            dispatch_gate: CycleGate::new(),
        }
    }

    pub fn with_source(mut self, spec: SourceSpec) -> Self {
        self.sources.push(Arc::new(SourceSlot {
            spec,
            gate: CycleGate::new(),
        }));
        self
    }

    pub fn with_dispatch(mut self, interval: Duration, budget: Duration) -> Self {
        self.dispatch_interval = interval;
        self.dispatch_budget = budget;
        self
    }

    /// Start one scrape cycle for `source_id` unless one is already running.
    pub fn trigger_scrape(&self, source_id: &str) -> TriggerOutcome<ScrapeResult> {
        let Some(slot) = self.sources.iter().find(|s| s.spec.id == source_id) else {
            return TriggerOutcome::UnknownSource;
        };
        let Some(guard) = slot.gate.try_enter() else {
            counter!("news_relay_cycles_skipped_total", "cycle" => source_id.to_string()).increment(1);
            debug!(source = source_id, "previous scrape cycle still running, skipped");
            return TriggerOutcome::Skipped;
        };

        let slot = Arc::clone(slot);
        let intake = self.intake.clone();
        TriggerOutcome::Started(tokio::spawn(async move {
            let _guard = guard;
            let spec = &slot.spec;
            let run = intake.run_cycle(&spec.id, spec.scraper.as_ref(), spec.max_items);
            let result = match tokio::time::timeout(spec.budget, run).await {
                Ok(r) => r,
                Err(_) => Err(CycleError::TimedOut(spec.budget)),
            };
            record_scrape_outcome(&spec.id, &result);
            result
        }))
    }

    /// Start one dispatch cycle unless one is already running.
    pub fn trigger_dispatch(&self) -> TriggerOutcome<DispatchResult> {
        let Some(guard) = self.dispatch_gate.try_enter() else {
            counter!("news_relay_cycles_skipped_total", "cycle" => "dispatch").increment(1);
            debug!("previous dispatch cycle still running, skipped");
            return TriggerOutcome::Skipped;
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let budget = self.dispatch_budget;
        TriggerOutcome::Started(tokio::spawn(async move {
            let _guard = guard;
            let result = match tokio::time::timeout(budget, dispatcher.run_cycle()).await {
                Ok(r) => r.map_err(CycleError::from),
                Err(_) => Err(CycleError::TimedOut(budget)),
            };
            if let Err(e) = &result {
                error!(error = %e, "dispatch cycle failed");
            }
            result
        }))
    }

    /// Run every source and the dispatcher on their intervals until
    /// `shutdown` flips to `true`. The first cycles start immediately.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut loops = Vec::with_capacity(self.sources.len() + 1);

        for slot in &self.sources {
            let this = Arc::clone(self);
            let id = slot.spec.id.clone();
            let every = slot.spec.interval;
            let shutdown = shutdown.clone();
            loops.push(tokio::spawn(async move {
                tick_loop(every, shutdown, || {
                    let _ = this.trigger_scrape(&id);
                })
                .await;
            }));
        }

        let this = Arc::clone(self);
        let every = self.dispatch_interval;
        loops.push(tokio::spawn(async move {
            tick_loop(every, shutdown, || {
                let _ = this.trigger_dispatch();
            })
            .await;
        }));

        info!(
            sources = self.sources.len(),
            dispatch_every_secs = self.dispatch_interval.as_secs(),
            "scheduler started"
        );
        loops
    }

    /// Wait until no cycle is running, or `max_wait` passes.
    pub async fn drain(&self, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let busy = self.dispatch_gate.is_running() || self.sources.iter().any(|s| s.gate.is_running());
            if !busy {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("cycles still running at shutdown");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn tick_loop(every: Duration, mut shutdown: watch::Receiver<bool>, mut fire: impl FnMut()) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => fire(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn record_scrape_outcome(source_id: &str, result: &ScrapeResult) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(CycleError::Fetch(_)) => "fetch_error",
        Err(CycleError::Storage(_)) => "storage_error",
        Err(CycleError::TimedOut(_)) => "timed_out",
    };
    counter!("news_relay_scrape_cycles_total", "source" => source_id.to_string(), "outcome" => outcome)
        .increment(1);
    match result {
        Ok(_) => {}
        Err(e) if e.is_storage() => error!(source = source_id, error = %e, "scrape cycle failed"),
        Err(e) => warn!(source = source_id, error = %e, "scrape cycle failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_one_holder_at_a_time() {
        let gate = CycleGate::new();
        let first = gate.try_enter();
        assert!(first.is_some());
        assert!(gate.is_running());
        assert!(gate.try_enter().is_none());
        drop(first);
        assert!(!gate.is_running());
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let gate = CycleGate::new();
        let guards: Vec<Option<CycleGuard>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let g = Arc::clone(&gate);
                    s.spawn(move || g.try_enter())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(guards.iter().filter(|g| g.is_some()).count(), 1);
        drop(guards);
        assert!(!gate.is_running());
    }
}
