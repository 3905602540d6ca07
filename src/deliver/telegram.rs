// src/deliver/telegram.rs
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;

use super::{Ack, DeliveryChannel, DeliveryContext};
use crate::error::DeliveryError;
use crate::item::Item;

const TITLE_LIMIT: usize = 100;
const SUMMARY_LIMIT: usize = 500;
const MESSAGE_LIMIT: usize = 4000;
const SOURCE_LIMIT: usize = 64;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^<]+?>").unwrap());
static BLANK_LINES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").unwrap());

/// Bot API `sendMessage` to one chat.
#[derive(Clone)]
pub struct TelegramChannel {
    api_base: String,
    token: String,
    chat_id: String,
    client: Client,
    timeout: Duration,
}

impl TelegramChannel {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            token: token.into(),
            chat_id: chat_id.into(),
            client: Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Point at a different Bot API host (local bot server, test double).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn clean(text: &str) -> String {
    let stripped = TAG_RE.replace_all(text, "");
    BLANK_LINES_RE.replace_all(stripped.trim(), "\n\n").into_owned()
}

/// HTML-escape `text`, keeping at most `limit` source chars and at most
/// `room` output chars. A cut lands between whole chars, never inside an
/// entity, and ends in `...`.
fn escape_within(text: &str, limit: usize, room: usize) -> String {
    let full = html_escape::encode_text(text);
    if text.chars().count() <= limit && full.chars().count() <= room {
        return full.into_owned();
    }

    let budget = room.saturating_sub(3);
    let mut out = String::new();
    let mut used = 0;
    let mut buf = [0u8; 4];
    for c in text.chars().take(limit) {
        let piece = html_escape::encode_text(c.encode_utf8(&mut buf));
        let n = piece.chars().count();
        if used + n > budget {
            break;
        }
        out.push_str(&piece);
        used += n;
    }
    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    out.push_str("...");
    out
}

/// HTML message body for an item. `link` wins over the item's own URL, so a
/// chained delivery can point readers at the already published article.
///
/// The message never exceeds [`MESSAGE_LIMIT`] chars. The summary gives way
/// first; a link too long to fit is left out rather than cut.
pub fn format_message(item: &Item, link: Option<&str>) -> String {
    let p = &item.payload;
    let head = format!(
        "<b>{}</b>\n\n",
        escape_within(&clean(&p.title), TITLE_LIMIT, usize::MAX)
    );

    let mut footer = format!(
        "<b>Source:</b> {}\n",
        escape_within(&item.source_id, SOURCE_LIMIT, usize::MAX)
    );
    if let Some(url) = link.or(p.url.as_deref()) {
        let anchor = format!(
            "<a href=\"{}\">Read more</a>",
            html_escape::encode_double_quoted_attribute(url)
        );
        let fixed = head.chars().count() + footer.chars().count();
        if fixed + anchor.chars().count() <= MESSAGE_LIMIT {
            footer.push_str(&anchor);
        }
    }

    let mut msg = head;
    if let Some(summary) = p.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        let room = MESSAGE_LIMIT
            .saturating_sub(msg.chars().count() + footer.chars().count() + 2);
        if room > 3 {
            msg.push_str(&escape_within(&clean(summary), SUMMARY_LIMIT, room));
            msg.push_str("\n\n");
        }
    }
    msg.push_str(&footer);
    msg
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    /// The chat API reports every failure as retryable.
    async fn deliver(&self, item: &Item, ctx: &DeliveryContext<'_>) -> Result<Ack, DeliveryError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": format_message(item, ctx.receipt),
            "parse_mode": "HTML",
            "disable_web_page_preview": false,
        });

        let resp = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("telegram request failed: {}", e.without_url())))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(DeliveryError::Transient(format!(
                "telegram HTTP {}: {}",
                status.as_u16(),
                snippet.trim()
            )));
        }
        Ok(Ack::default())
    }

    fn kind(&self) -> &'static str {
        "telegram"
    }
}
