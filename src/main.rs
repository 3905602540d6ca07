//! news-relay binary: scheduled scraping, dedup and delivery.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use news_relay::api::{self, ApiState};
use news_relay::ingest::providers::build_scraper;
use news_relay::{
    AppConfig, Dispatcher, Intake, Normalizer, NotifierMux, Scheduler, SourceSpec, Store,
    TriggerOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "news-relay", author, version, about)]
struct Cli {
    /// Config file (defaults to $NEWS_RELAY_CONFIG, then config/news-relay.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all sources and the dispatcher on their schedules until Ctrl-C.
    Run,
    /// Run one scrape cycle for a source and exit.
    Scrape { source: String },
    /// Run one dispatch cycle and exit.
    Dispatch,
    /// Print queue counts.
    Status,
    /// List the most recent failed deliveries.
    Failed {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("news_relay=info,warn"));
    let json = std::env::var("NEWS_RELAY_LOG_JSON").is_ok_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_current_span(false)).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(p) => AppConfig::load_from(p)?,
        None => AppConfig::load_default()?,
    };

    let store = Store::open(&cfg.store_options())
        .await
        .context("opening persistent store")?;

    let result = match cli.command {
        Command::Run => run(&cfg, store.clone()).await,
        Command::Scrape { source } => scrape(&cfg, store.clone(), &source).await,
        Command::Dispatch => dispatch(&cfg, store.clone()).await,
        Command::Status => status(&store).await,
        Command::Failed { limit } => failed(&store, limit).await,
    };
    store.close().await;
    result
}

fn build_scheduler(cfg: &AppConfig, store: Store) -> Scheduler {
    let intake = Intake::new(store.clone(), Normalizer::new(cfg.dedup.scope));
    let channels = cfg.build_channels();
    if channels.is_empty() {
        tracing::warn!("no delivery channels configured, queued items will fail as unroutable");
    }
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        channels,
        cfg.routes(),
        cfg.retry_policy(),
        NotifierMux::from_env(),
        cfg.dispatcher_options(),
    ));

    cfg.enabled_sources().fold(
        Scheduler::new(intake, dispatcher).with_dispatch(
            Duration::from_secs(cfg.dispatch.interval_secs),
            Duration::from_secs(cfg.dispatch.cycle_budget_secs),
        ),
        |s, src| {
            s.with_source(SourceSpec {
                id: src.id.clone(),
                scraper: build_scraper(src),
                interval: src.interval(),
                budget: src.budget(),
                max_items: src.max_items,
            })
        },
    )
}

async fn run(cfg: &AppConfig, store: Store) -> Result<()> {
    let metrics = match news_relay::metrics::install_recorder() {
        Ok(h) => Some(h),
        Err(e) => {
            tracing::warn!(error = ?e, "metrics recorder not installed");
            None
        }
    };

    let scheduler = Arc::new(build_scheduler(cfg, store.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = scheduler.start(shutdown_rx.clone());

    let server = match &cfg.http {
        Some(http) => {
            let listener = tokio::net::TcpListener::bind(&http.bind)
                .await
                .with_context(|| format!("binding {}", http.bind))?;
            tracing::info!(bind = %http.bind, "operator http listening");
            let app = api::router(ApiState { store, metrics });
            let mut rx = shutdown_rx;
            Some(tokio::spawn(async move {
                let graceful = axum::serve(listener, app).with_graceful_shutdown(async move {
                    let _ = rx.wait_for(|stop| *stop).await;
                });
                if let Err(e) = graceful.await {
                    tracing::error!(error = ?e, "operator http server failed");
                }
            }))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    for h in loops {
        let _ = h.await;
    }
    if let Some(h) = server {
        let _ = h.await;
    }
    scheduler.drain(Duration::from_secs(30)).await;
    Ok(())
}

async fn scrape(cfg: &AppConfig, store: Store, source: &str) -> Result<()> {
    if cfg.source(source).is_none() {
        bail!("unknown source {source:?}");
    }
    let scheduler = build_scheduler(cfg, store);
    match scheduler.trigger_scrape(source) {
        TriggerOutcome::Started(h) => {
            let report = h.await.context("scrape task")??;
            println!(
                "{source}: produced={} accepted={} already_seen={} invalid={}",
                report.produced, report.accepted, report.already_seen, report.invalid
            );
            Ok(())
        }
        TriggerOutcome::Skipped => bail!("a cycle for {source:?} is already running"),
        TriggerOutcome::UnknownSource => bail!("source {source:?} is disabled"),
    }
}

async fn dispatch(cfg: &AppConfig, store: Store) -> Result<()> {
    let scheduler = build_scheduler(cfg, store);
    match scheduler.trigger_dispatch() {
        TriggerOutcome::Started(h) => {
            let r = h.await.context("dispatch task")??;
            println!(
                "leased={} delivered={} retried={} failed={} reaped={}",
                r.leased, r.delivered, r.retried, r.failed, r.reaped
            );
            Ok(())
        }
        _ => bail!("dispatch cycle already running"),
    }
}

async fn status(store: &Store) -> Result<()> {
    let stats = store.queue().stats(Utc::now()).await?;
    let seen = store.dedup().len().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("dedup records: {seen}");
    Ok(())
}

async fn failed(store: &Store, limit: u32) -> Result<()> {
    for e in store.queue().failed(limit).await? {
        println!(
            "{}  {}  {}  attempts={}  {}\n    {}",
            e.finished_at.to_rfc3339(),
            e.source_id,
            e.fingerprint.short(),
            e.attempt_count,
            e.payload.title,
            e.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
