// tests/config.rs
use std::{env, fs};

use serial_test::serial;

use news_relay::config::{AppConfig, ChannelConfig};

const ENV_VARS: &[&str] = &[
    "NEWS_RELAY_CONFIG",
    "NEWS_RELAY_DEDUP_PATH",
    "NEWS_RELAY_QUEUE_PATH",
    "NEWS_RELAY_DISPATCH_INTERVAL_SECS",
    "NEWS_RELAY_BATCH_SIZE",
    "TEST_NEWS_API_KEY",
];

fn clear_env() {
    for v in ENV_VARS {
        env::remove_var(v);
    }
}

const CONFIG: &str = r#"
[dispatch]
batch_size = 5
default_channels = ["news"]

[channels.news]
kind = "news_service"
base_url = "https://news.example.test"
api_key = "env:TEST_NEWS_API_KEY"
author_id = "relay-bot"

[[sources]]
id = "bbc"
kind = "rss"
url = "https://feeds.example.test/bbc.xml"
"#;

#[test]
#[serial]
fn env_path_then_overrides() {
    clear_env();
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("relay.toml");
    fs::write(&path, CONFIG).unwrap();

    env::set_var("NEWS_RELAY_CONFIG", &path);
    env::set_var("TEST_NEWS_API_KEY", "s3cret");
    env::set_var("NEWS_RELAY_BATCH_SIZE", "7");
    env::set_var("NEWS_RELAY_QUEUE_PATH", tmp.path().join("q.sqlite"));

    let cfg = AppConfig::load_default().unwrap();
    assert_eq!(cfg.dispatch.batch_size, 7);
    assert_eq!(cfg.storage.queue_path, tmp.path().join("q.sqlite"));
    match &cfg.channels["news"] {
        ChannelConfig::NewsService { api_key, .. } => assert_eq!(api_key, "s3cret"),
        other => panic!("unexpected channel {other:?}"),
    }
    clear_env();
}

#[test]
#[serial]
fn missing_secret_is_an_error() {
    clear_env();
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("relay.toml");
    fs::write(&path, CONFIG).unwrap();

    let err = AppConfig::load_from(&path).unwrap_err();
    assert!(format!("{err:#}").contains("TEST_NEWS_API_KEY"));
}

#[test]
#[serial]
fn env_path_must_exist() {
    clear_env();
    env::set_var("NEWS_RELAY_CONFIG", "/definitely/not/here.toml");
    assert!(AppConfig::load_default().is_err());
    clear_env();
}

#[test]
#[serial]
fn falls_back_to_defaults_without_files() {
    clear_env();
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();

    let cfg = AppConfig::load_default();
    env::set_current_dir(old).unwrap();

    let cfg = cfg.unwrap();
    assert!(cfg.sources.is_empty());
    assert!(cfg.http.is_none());
    assert_eq!(cfg.retry.max_attempts, 5);
}

#[test]
#[serial]
fn bad_override_is_rejected() {
    clear_env();
    env::set_var("NEWS_RELAY_BATCH_SIZE", "many");
    let mut cfg = AppConfig::default();
    assert!(cfg.apply_env_overrides().is_err());

    env::set_var("NEWS_RELAY_BATCH_SIZE", "0");
    let mut cfg = AppConfig::default();
    cfg.apply_env_overrides().unwrap();
    assert!(cfg.validate().is_err());
    clear_env();
}
