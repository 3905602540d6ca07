// src/config/mod.rs
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::deliver::news_service::NewsServiceChannel;
use crate::deliver::telegram::TelegramChannel;
use crate::deliver::{ChannelRegistry, Routes};
use crate::dispatch::{DispatcherOptions, RetryPolicy};
use crate::item::DedupScope;
use crate::store::{Retention, StoreOptions};

const ENV_PATH: &str = "NEWS_RELAY_CONFIG";
const DEFAULT_PATH: &str = "config/news-relay.toml";
const SECRET_PREFIX: &str = "env:";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub dedup: DedupConfig,
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub http: Option<HttpConfig>,
    pub channels: BTreeMap<String, ChannelConfig>,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub dedup_path: PathBuf,
    pub queue_path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dedup_path: PathBuf::from("data/dedup.sqlite"),
            queue_path: PathBuf::from("data/queue.sqlite"),
            max_connections: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub scope: DedupScope,
    /// Trim the oldest fingerprints beyond this many records.
    pub max_records: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub interval_secs: u64,
    pub batch_size: u32,
    pub concurrency: usize,
    pub visibility_timeout_secs: u64,
    pub delivery_timeout_secs: u64,
    pub cycle_budget_secs: u64,
    pub max_batches_per_cycle: u32,
    pub archive_retention: Option<u64>,
    /// Route for sources without their own `channels`.
    pub default_channels: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            batch_size: 20,
            concurrency: 4,
            visibility_timeout_secs: 300,
            delivery_timeout_secs: 30,
            cycle_budget_secs: 600,
            max_batches_per_cycle: 10,
            archive_retention: Some(10_000),
            default_channels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_secs: u64,
    pub cap_secs: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_secs: 30,
            cap_secs: 3_600,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    NewsService {
        base_url: String,
        api_key: String,
        author_id: String,
    },
    Telegram {
        token: String,
        chat_id: String,
        #[serde(default)]
        api_base: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rss,
}

fn default_source_interval() -> u64 {
    900
}
fn default_max_items() -> usize {
    100
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default = "default_source_interval")]
    pub interval_secs: u64,
    /// Defaults to the interval: a cycle never outlives its own period.
    #[serde(default)]
    pub cycle_budget_secs: Option<u64>,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SourceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.cycle_budget_secs.unwrap_or(self.interval_secs))
    }
}

/// Resolve `env:VAR` indirection; anything else is taken literally.
fn resolve_secret(value: &str) -> Result<String> {
    match value.trim().strip_prefix(SECRET_PREFIX) {
        Some(var) => std::env::var(var.trim())
            .map_err(|_| anyhow!("missing {} env var", var.trim())),
        None => Ok(value.to_string()),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{name} is not a valid value: {v:?}")),
        _ => Ok(None),
    }
}

impl AppConfig {
    /// Parse TOML and resolve secrets. No env overrides, no validation.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: AppConfig = toml::from_str(s).context("parsing news-relay config")?;
        cfg.resolve_secrets()?;
        Ok(cfg)
    }

    /// Load an explicit file, apply env overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut cfg = Self::from_toml_str(&content)
            .with_context(|| format!("loading {}", path.display()))?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load using env var + fallbacks:
    /// 1) $NEWS_RELAY_CONFIG
    /// 2) config/news-relay.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            bail!("{ENV_PATH} points to non-existent path {}", pb.display());
        }
        let default_p = PathBuf::from(DEFAULT_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_secrets(&mut self) -> Result<()> {
        for (id, ch) in self.channels.iter_mut() {
            match ch {
                ChannelConfig::NewsService { api_key, .. } => {
                    *api_key = resolve_secret(api_key).with_context(|| format!("channel {id}"))?;
                }
                ChannelConfig::Telegram { token, chat_id, .. } => {
                    *token = resolve_secret(token).with_context(|| format!("channel {id}"))?;
                    *chat_id = resolve_secret(chat_id).with_context(|| format!("channel {id}"))?;
                }
            }
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(p) = env_parse::<PathBuf>("NEWS_RELAY_DEDUP_PATH")? {
            self.storage.dedup_path = p;
        }
        if let Some(p) = env_parse::<PathBuf>("NEWS_RELAY_QUEUE_PATH")? {
            self.storage.queue_path = p;
        }
        if let Some(n) = env_parse::<u64>("NEWS_RELAY_DISPATCH_INTERVAL_SECS")? {
            self.dispatch.interval_secs = n;
        }
        if let Some(n) = env_parse::<u32>("NEWS_RELAY_BATCH_SIZE")? {
            self.dispatch.batch_size = n;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if d.interval_secs == 0 {
            bail!("dispatch.interval_secs must be > 0");
        }
        if d.batch_size == 0 {
            bail!("dispatch.batch_size must be > 0");
        }
        if d.concurrency == 0 {
            bail!("dispatch.concurrency must be > 0");
        }
        if d.visibility_timeout_secs <= d.delivery_timeout_secs {
            bail!(
                "dispatch.visibility_timeout_secs ({}) must exceed delivery_timeout_secs ({})",
                d.visibility_timeout_secs,
                d.delivery_timeout_secs
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be > 0");
        }
        if self.retry.base_secs > self.retry.cap_secs {
            bail!("retry.base_secs must not exceed retry.cap_secs");
        }
        if self.storage.dedup_path == self.storage.queue_path {
            bail!("storage.dedup_path and storage.queue_path must differ");
        }

        for ch in &d.default_channels {
            if !self.channels.contains_key(ch) {
                bail!("dispatch.default_channels names unknown channel {ch:?}");
            }
        }

        let mut seen = HashSet::new();
        for s in &self.sources {
            if s.id.trim().is_empty() {
                bail!("source with empty id");
            }
            if !seen.insert(s.id.as_str()) {
                bail!("duplicate source id {:?}", s.id);
            }
            if s.interval_secs == 0 {
                bail!("source {:?}: interval_secs must be > 0", s.id);
            }
            if s.cycle_budget_secs == Some(0) {
                bail!("source {:?}: cycle_budget_secs must be > 0", s.id);
            }
            for ch in &s.channels {
                if !self.channels.contains_key(ch) {
                    bail!("source {:?} routes to unknown channel {ch:?}", s.id);
                }
            }
            if s.enabled && s.channels.is_empty() && d.default_channels.is_empty() {
                bail!("source {:?} has no channels and no dispatch.default_channels", s.id);
            }
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn store_options(&self) -> StoreOptions {
        let mut opts = StoreOptions::new(&self.storage.dedup_path, &self.storage.queue_path);
        opts.max_connections = self.storage.max_connections;
        opts.busy_timeout = Duration::from_millis(self.storage.busy_timeout_ms);
        opts.visibility_timeout = Duration::from_secs(self.dispatch.visibility_timeout_secs);
        opts
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry.base_secs),
            Duration::from_secs(self.retry.cap_secs),
            self.retry.max_attempts,
        )
    }

    pub fn dispatcher_options(&self) -> DispatcherOptions {
        let d = &self.dispatch;
        DispatcherOptions {
            batch_size: d.batch_size,
            concurrency: d.concurrency,
            delivery_timeout: Duration::from_secs(d.delivery_timeout_secs),
            max_batches_per_cycle: d.max_batches_per_cycle,
            retention: Retention {
                dedup_max_records: self.dedup.max_records,
                archive_max_records: d.archive_retention,
            },
        }
    }

    pub fn routes(&self) -> Routes {
        self.sources
            .iter()
            .fold(Routes::new(self.dispatch.default_channels.clone()), |r, s| {
                r.with_route(s.id.clone(), s.channels.clone())
            })
    }

    pub fn build_channels(&self) -> ChannelRegistry {
        let timeout = Duration::from_secs(self.dispatch.delivery_timeout_secs);
        let mut reg = ChannelRegistry::new();
        for (id, ch) in &self.channels {
            match ch {
                ChannelConfig::NewsService {
                    base_url,
                    api_key,
                    author_id,
                } => reg.insert(
                    id.clone(),
                    Arc::new(NewsServiceChannel::new(base_url, api_key, author_id).with_timeout(timeout)),
                ),
                ChannelConfig::Telegram {
                    token,
                    chat_id,
                    api_base,
                } => {
                    let mut tg = TelegramChannel::new(token, chat_id).with_timeout(timeout);
                    if let Some(base) = api_base {
                        tg = tg.with_api_base(base);
                    }
                    reg.insert(id.clone(), Arc::new(tg));
                }
            }
        }
        reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[storage]
dedup_path = "state/dedup.sqlite"
queue_path = "state/queue.sqlite"

[dedup]
scope = "global"
max_records = 50000

[dispatch]
interval_secs = 30
default_channels = ["news", "chat"]

[retry]
base_secs = 10
cap_secs = 600
max_attempts = 4

[channels.news]
kind = "news_service"
base_url = "https://news.example.test"
api_key = "literal-key"
author_id = "bot"

[channels.chat]
kind = "telegram"
token = "123:abc"
chat_id = "-100200"

[[sources]]
id = "bbc"
kind = "rss"
url = "https://feeds.example.test/bbc.xml"

[[sources]]
id = "ircc"
kind = "rss"
url = "https://feeds.example.test/ircc.xml"
interval_secs = 3600
channels = ["chat"]
max_items = 20
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.dedup.scope, DedupScope::Global);
        assert_eq!(cfg.dispatch.batch_size, 20);
        assert_eq!(cfg.sources[0].max_items, 100);
        assert_eq!(cfg.sources[0].interval_secs, 900);
        assert_eq!(cfg.sources[1].budget(), Duration::from_secs(3600));
        assert_eq!(cfg.routes().route("ircc"), ["chat".to_string()]);
        assert_eq!(cfg.routes().route("bbc").len(), 2);
        assert_eq!(cfg.build_channels().len(), 2);
        assert_eq!(cfg.retry_policy().delay_after(2), Duration::from_secs(20));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        cfg.retry.base_secs = 1_000;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        cfg.dispatch.visibility_timeout_secs = cfg.dispatch.delivery_timeout_secs;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        cfg.sources[1].channels = vec!["pager".into()];
        assert!(cfg.validate().unwrap_err().to_string().contains("pager"));

        let mut cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        cfg.sources[1].id = "bbc".into();
        assert!(cfg.validate().unwrap_err().to_string().contains("duplicate"));

        let mut cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        cfg.storage.queue_path = cfg.storage.dedup_path.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_channel_kind_is_a_parse_error() {
        let s = "[channels.x]\nkind = \"pigeon\"\n";
        assert!(AppConfig::from_toml_str(s).is_err());
    }

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }
}
