// src/notify/slack.rs
use anyhow::{Context, Result};
use reqwest::Client;

use super::{FailureNotice, Notifier};

pub struct SlackNotifier {
    webhook_url: Option<String>,
    client: Client,
}

impl SlackNotifier {
    pub fn from_env() -> Self {
        Self {
            webhook_url: std::env::var("SLACK_WEBHOOK_URL").ok(),
            client: Client::new(),
        }
    }

    pub fn new(url: String) -> Self {
        Self {
            webhook_url: Some(url),
            client: Client::new(),
        }
    }
}

pub(crate) fn render(notice: &FailureNotice) -> String {
    format!(
        "*news-relay:* delivery FAILED after {} attempt(s)\n*{}* ({})\nError: {}\nFingerprint: `{}` @ {}",
        notice.attempts,
        notice.title,
        notice.source_id,
        notice.last_error,
        notice.fingerprint,
        notice.ts.to_rfc3339()
    )
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, notice: &FailureNotice) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("Slack disabled (no SLACK_WEBHOOK_URL)");
            return Ok(());
        };

        let body = serde_json::json!({ "text": render(notice) });

        self.client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }
}
