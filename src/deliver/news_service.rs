// src/deliver/news_service.rs
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{classify_status, Ack, DeliveryChannel, DeliveryContext};
use crate::error::DeliveryError;
use crate::item::Item;

/// Publishes items to the news service's bulk post endpoint.
#[derive(Clone)]
pub struct NewsServiceChannel {
    base_url: String,
    api_key: String,
    author_id: String,
    client: Client,
    timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewsPost<'a> {
    text: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    author: &'a str,
    children: [(); 0],
    title: &'a str,
    media_urls: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    news_original_url: Option<&'a str>,
    news_source: String,
}

#[derive(Serialize)]
struct NewsRequest<'a> {
    posts: [NewsPost<'a>; 1],
}

impl NewsServiceChannel {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, author_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            author_id: author_id.into(),
            client: Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/en/api/news", self.base_url)
    }

    /// Public URL of a published post, from the `insertedPosts` reply.
    fn receipt_from(&self, body: &str) -> Option<String> {
        let v: serde_json::Value = serde_json::from_str(body).ok()?;
        let post = v.get("insertedPosts")?.get(0)?;
        let id = post
            .get("_id")
            .or_else(|| post.get("slug"))
            .and_then(|x| x.as_str())?;
        Some(format!("{}/uk/news/{}", self.base_url, id))
    }
}

#[async_trait]
impl DeliveryChannel for NewsServiceChannel {
    async fn deliver(&self, item: &Item, _ctx: &DeliveryContext<'_>) -> Result<Ack, DeliveryError> {
        let p = &item.payload;
        let request = NewsRequest {
            posts: [NewsPost {
                text: p.summary.as_deref().unwrap_or(&p.title),
                kind: "news",
                author: &self.author_id,
                children: [],
                title: &p.title,
                media_urls: p.image_url.as_deref().into_iter().collect(),
                news_original_url: p.url.as_deref(),
                news_source: item.source_id.to_ascii_uppercase(),
            }],
        };

        let resp = self
            .client
            .post(self.endpoint())
            .query(&[("apiKey", self.api_key.as_str())])
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("news service request failed: {}", e.without_url())))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| DeliveryError::Transient(format!("news service body: {}", e.without_url())))?;
        classify_status(status, &body)?;

        let receipt = self.receipt_from(&body);
        if receipt.is_none() {
            tracing::warn!(fingerprint = item.fingerprint.short(), "news service reply carried no post id");
        }
        Ok(Ack { receipt })
    }

    fn kind(&self) -> &'static str {
        "news_service"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_uses_id_then_slug() {
        let ch = NewsServiceChannel::new("https://news.example.test/", "k", "a");
        assert_eq!(
            ch.receipt_from(r#"{"insertedPosts":[{"_id":"abc123"}]}"#).as_deref(),
            Some("https://news.example.test/uk/news/abc123")
        );
        assert_eq!(
            ch.receipt_from(r#"{"insertedPosts":[{"slug":"visa-rules"}]}"#).as_deref(),
            Some("https://news.example.test/uk/news/visa-rules")
        );
        assert_eq!(ch.receipt_from(r#"{"message":"Success"}"#), None);
        assert_eq!(ch.receipt_from("not json"), None);
    }

    #[tokio::test]
    async fn network_error_is_transient_and_hides_api_key() {
        use crate::item::{DedupScope, Fingerprint, ItemState, Payload};

        let ch = NewsServiceChannel::new("http://127.0.0.1:1", "SECRET-KEY", "author")
            .with_timeout(Duration::from_secs(5));
        let item = Item {
            fingerprint: Fingerprint::derive(DedupScope::PerSource.scope_key("bbc"), "x"),
            source_id: "bbc".into(),
            payload: Payload {
                title: "Rates held".into(),
                ..Default::default()
            },
            first_seen_at: chrono::Utc::now(),
            state: ItemState::Delivering,
        };
        let ctx = DeliveryContext {
            attempt: 1,
            receipt: None,
        };

        let err = ch.deliver(&item, &ctx).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.reason().contains("news service request failed"));
        assert!(!err.reason().contains("SECRET-KEY"), "{}", err.reason());
        assert!(!err.reason().contains("apiKey"), "{}", err.reason());
    }
}
