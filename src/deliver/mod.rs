// src/deliver/mod.rs
//! Delivery channels: the downstream collaborators the dispatcher publishes to.

pub mod news_service;
pub mod telegram;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::item::Item;

/// Successful delivery. `receipt` is whatever the channel wants later
/// channels to see, e.g. the URL of the published article.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    pub receipt: Option<String>,
}

impl Ack {
    pub fn with_receipt(receipt: impl Into<String>) -> Self {
        Self {
            receipt: Some(receipt.into()),
        }
    }
}

/// Per-call context handed to a channel.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryContext<'a> {
    /// 1-based attempt number of the queue entry.
    pub attempt: u32,
    /// Receipt left by an earlier channel in the route.
    pub receipt: Option<&'a str>,
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, item: &Item, ctx: &DeliveryContext<'_>) -> Result<Ack, DeliveryError>;
    fn kind(&self) -> &'static str;
}

/// Classify an HTTP status from a downstream API.
///
/// Rate limits, timeouts and 5xx are worth retrying; any other 4xx means the
/// collaborator will never accept this payload.
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }
    let snippet: String = body.chars().take(200).collect();
    let reason = format!("HTTP {}: {}", status.as_u16(), snippet.trim());
    match status.as_u16() {
        408 | 425 | 429 => Err(DeliveryError::Transient(reason)),
        400..=499 => Err(DeliveryError::Permanent(reason)),
        _ => Err(DeliveryError::Transient(reason)),
    }
}

/// Channels by id.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn DeliveryChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, id: impl Into<String>, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.insert(id, channel);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, channel: Arc<dyn DeliveryChannel>) {
        self.channels.insert(id.into(), channel);
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn DeliveryChannel>> {
        self.channels.get(id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Ordered channel list per source, with a fallback for sources that have none.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    by_source: HashMap<String, Vec<String>>,
    default: Vec<String>,
}

impl Routes {
    pub fn new(default: Vec<String>) -> Self {
        Self {
            by_source: HashMap::new(),
            default,
        }
    }

    pub fn with_route(mut self, source_id: impl Into<String>, channels: Vec<String>) -> Self {
        self.by_source.insert(source_id.into(), channels);
        self
    }

    pub fn route(&self, source_id: &str) -> &[String] {
        match self.by_source.get(source_id) {
            Some(chs) if !chs.is_empty() => chs,
            _ => &self.default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::CREATED, "").is_ok());
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            Err(DeliveryError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            Err(DeliveryError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad title"),
            Err(DeliveryError::Permanent(r)) if r.contains("bad title")
        ));
    }

    #[test]
    fn routes_fall_back_to_default() {
        let routes = Routes::new(vec!["news".into(), "chat".into()])
            .with_route("ircc", vec!["chat".into()])
            .with_route("empty", vec![]);
        assert_eq!(routes.route("ircc"), ["chat".to_string()]);
        assert_eq!(routes.route("bbc").len(), 2);
        assert_eq!(routes.route("empty").len(), 2);
    }
}
