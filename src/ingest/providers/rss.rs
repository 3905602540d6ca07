// src/ingest/providers/rss.rs
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::error::FetchError;
use crate::ingest::types::{RawItem, RawItemStream, Scraper};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<FeedItem>,
}
#[derive(Debug, Deserialize)]
struct FeedItem {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    enclosure: Option<Enclosure>,
}
#[derive(Debug, Deserialize)]
struct Enclosure {
    #[serde(rename = "@url")]
    url: Option<String>,
    #[serde(rename = "@type")]
    kind: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    match OffsetDateTime::parse(ts.trim(), &Rfc2822) {
        Ok(dt) => DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), dt.nanosecond()),
        // Named zones ("GMT", "EST") are common in feeds.
        Err(_) => DateTime::parse_from_rfc2822(ts.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

/// RSS 2.0 feed, fetched over HTTP or read from a fixture string.
pub struct RssFeedScraper {
    name: String,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        url: String,
        client: reqwest::Client,
        timeout: Duration,
    },
}

impl RssFeedScraper {
    pub fn from_fixture(name: impl Into<String>, xml: &str) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn from_url(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Http {
                url: url.into(),
                client: reqwest::Client::new(),
                timeout: Duration::from_secs(30),
            },
        }
    }

    pub fn with_timeout(mut self, t: Duration) -> Self {
        if let Mode::Http { timeout, .. } = &mut self.mode {
            *timeout = t;
        }
        self
    }

    pub fn parse_items_from_str(s: &str) -> Result<Vec<RawItem>, FetchError> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(s);
        let rss: Rss = from_str(&xml_clean).map_err(|e| FetchError::Parse(format!("rss xml: {e}")))?;

        let out: Vec<RawItem> = rss
            .channel
            .item
            .into_iter()
            .map(|it| {
                let image_url = it
                    .enclosure
                    .filter(|e| e.kind.as_deref().map_or(true, |k| k.starts_with("image/")))
                    .and_then(|e| e.url);
                RawItem {
                    url: it.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()),
                    title: it.title.unwrap_or_default(),
                    summary: it.description,
                    image_url,
                    links: Vec::new(),
                    published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
                }
            })
            .collect();

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("news_relay_feed_parse_ms").record(ms);
        Ok(out)
    }

    async fn fetch_all(&self) -> Result<Vec<RawItem>, FetchError> {
        match &self.mode {
            Mode::Fixture(s) => Self::parse_items_from_str(s),
            Mode::Http { url, client, timeout } => {
                let resp = client.get(url.as_str()).timeout(*timeout).send().await.map_err(|e| {
                    tracing::warn!(error = ?e, source = %self.name, "feed http error");
                    FetchError::Http(e)
                })?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(FetchError::Status {
                        status: status.as_u16(),
                        url: url.clone(),
                    });
                }
                let body = resp.text().await?;
                Self::parse_items_from_str(&body)
            }
        }
    }
}

impl Scraper for RssFeedScraper {
    fn produce(&self) -> RawItemStream<'_> {
        stream::once(self.fetch_all())
            .map_ok(|items| stream::iter(items.into_iter().map(Ok::<RawItem, FetchError>)))
            .try_flatten()
            .boxed()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc2822_dates() {
        let dt = parse_rfc2822("Tue, 10 Jun 2025 14:30:00 +0200").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-06-10T12:30:00+00:00");
        let gmt = parse_rfc2822("Tue, 10 Jun 2025 14:30:00 GMT").unwrap();
        assert_eq!(gmt.to_rfc3339(), "2025-06-10T14:30:00+00:00");
        assert!(parse_rfc2822("yesterday").is_none());
    }

    #[test]
    fn empty_channel_is_ok() {
        let xml = "<rss><channel><title>x</title></channel></rss>";
        assert!(RssFeedScraper::parse_items_from_str(xml).unwrap().is_empty());
    }
}
