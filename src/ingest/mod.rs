// src/ingest/mod.rs
pub mod providers;
pub mod types;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::error::{CycleError, NormalizeError};
use crate::ingest::types::{RawItem, Scraper};
use crate::item::{DedupScope, Fingerprint, Item, ItemState, Payload};
use crate::store::{Admission, Store};

/// Query parameters that only carry click attribution.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "ocid", "cmpid", "ref", "at_medium", "at_campaign"];

/// Normalize text: decode entities, strip tags, fold quotes, collapse whitespace.
/// Used to build the content identity of items without a stable URL.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // Trailing sentence punctuation differs between listing and article pages.
    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '?' | '.' | ',') {
            out.pop();
        } else {
            break;
        }
    }
    out
}

/// Canonical form of an article URL, or `None` if it is not an absolute http(s) URL.
///
/// Drops the fragment, tracking parameters and a trailing slash, and sorts the
/// remaining query pairs so that equivalent links hash identically.
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut parsed = url::Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return None;
    }
    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }
    // Scheme is not part of the identity: http and https links are the same article.
    let s = parsed.to_string();
    Some(
        s.strip_prefix("https://")
            .or_else(|| s.strip_prefix("http://"))
            .unwrap_or(&s)
            .to_string(),
    )
}

/// Turns raw scraper output into canonical `Item`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    scope: DedupScope,
}

impl Normalizer {
    pub fn new(scope: DedupScope) -> Self {
        Self { scope }
    }

    pub fn normalize(
        &self,
        source_id: &str,
        raw: RawItem,
        now: DateTime<Utc>,
    ) -> Result<Item, NormalizeError> {
        let title = raw.title.trim().to_string();
        if title.is_empty() {
            return Err(NormalizeError::EmptyTitle);
        }

        let identity = match raw.url.as_deref().and_then(canonical_url) {
            Some(u) => u,
            None => {
                let body = raw.summary.as_deref().map(normalize_text).unwrap_or_default();
                let text = normalize_text(&title).to_lowercase();
                if text.is_empty() && body.is_empty() {
                    return Err(NormalizeError::MissingIdentity);
                }
                format!("content:{text}\n{}", body.to_lowercase())
            }
        };

        Ok(Item {
            fingerprint: Fingerprint::derive(self.scope.scope_key(source_id), &identity),
            source_id: source_id.to_string(),
            payload: Payload {
                title,
                summary: raw.summary,
                url: raw.url.map(|u| u.trim().to_string()),
                image_url: raw.image_url,
                links: raw.links,
                published_at: raw.published_at,
            },
            first_seen_at: now,
            state: ItemState::New,
        })
    }
}

/// Counts from one scrape cycle of one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleReport {
    pub produced: usize,
    pub accepted: usize,
    pub already_seen: usize,
    pub invalid: usize,
}

/// Scrape-side half of the pipeline: normalizer plus the atomic dedup gate.
#[derive(Clone)]
pub struct Intake {
    store: Store,
    normalizer: Normalizer,
}

impl Intake {
    pub fn new(store: Store, normalizer: Normalizer) -> Self {
        Self { store, normalizer }
    }

    /// Run one scrape cycle: consume at most `max_items` raw items from the
    /// scraper and admit the new ones into the queue.
    ///
    /// A fetch error ends the cycle; items admitted before it stay queued.
    /// A storage error ends the cycle immediately.
    pub async fn run_cycle(
        &self,
        source_id: &str,
        scraper: &dyn Scraper,
        max_items: usize,
    ) -> Result<CycleReport, CycleError> {
        crate::metrics::ensure_described();
        let mut report = CycleReport::default();
        let mut stream = scraper.produce().take(max_items);

        while let Some(next) = stream.next().await {
            let raw = match next {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(source = source_id, scraper = scraper.name(), error = %e, "fetch failed");
                    counter!("news_relay_fetch_errors_total", "source" => source_id.to_string())
                        .increment(1);
                    return Err(e.into());
                }
            };
            report.produced += 1;

            let item = match self.normalizer.normalize(source_id, raw, Utc::now()) {
                Ok(item) => item,
                Err(e) => {
                    debug!(source = source_id, error = %e, "skipping raw item");
                    report.invalid += 1;
                    continue;
                }
            };

            match self.store.admit(&item).await {
                Ok(Admission::Accepted) => {
                    debug!(source = source_id, fingerprint = item.fingerprint.short(), title = %item.payload.title, "queued");
                    report.accepted += 1;
                }
                Ok(Admission::AlreadySeen) => report.already_seen += 1,
                Err(e) => {
                    counter!("news_relay_storage_errors_total").increment(1);
                    return Err(e.into());
                }
            }
        }

        counter!("news_relay_items_accepted_total", "source" => source_id.to_string())
            .increment(report.accepted as u64);
        counter!("news_relay_items_already_seen_total", "source" => source_id.to_string())
            .increment(report.already_seen as u64);
        counter!("news_relay_items_invalid_total", "source" => source_id.to_string())
            .increment(report.invalid as u64);
        gauge!("news_relay_last_scrape_ts", "source" => source_id.to_string())
            .set(Utc::now().timestamp() as f64);

        info!(
            source = source_id,
            produced = report.produced,
            accepted = report.accepted,
            already_seen = report.already_seen,
            invalid = report.invalid,
            "scrape cycle finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_collapses_ws_and_punct() {
        let s = "  Hello,&nbsp;&nbsp; <b>world</b>!!!  ";
        assert_eq!(normalize_text(s), "Hello, world");
    }

    #[test]
    fn canonical_url_strips_tracking_and_fragment() {
        let a = canonical_url("https://www.bbc.com/news/articles/abc/?at_medium=RSS&utm_source=x#top");
        let b = canonical_url("http://WWW.BBC.com/news/articles/abc");
        assert_eq!(a.as_deref(), Some("www.bbc.com/news/articles/abc"));
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_url_keeps_meaningful_query_sorted() {
        let a = canonical_url("https://example.test/story?id=7&page=2").unwrap();
        let b = canonical_url("https://example.test/story?page=2&id=7").unwrap();
        assert_eq!(a, b);
        assert!(a.contains("id=7"));
    }

    #[test]
    fn relative_and_non_http_urls_are_not_canonical() {
        assert_eq!(canonical_url("/news/world-123"), None);
        assert_eq!(canonical_url("mailto:desk@example.test"), None);
    }

    #[test]
    fn items_without_url_fall_back_to_content_hash() {
        let n = Normalizer::default();
        let now = Utc::now();
        let a = n
            .normalize(
                "ircc",
                RawItem {
                    title: "New  visa rules.".into(),
                    summary: Some("<p>Effective today</p>".into()),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        let b = n
            .normalize(
                "ircc",
                RawItem {
                    title: "new visa rules".into(),
                    summary: Some("Effective today".into()),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        // payload is passed through as scraped
        assert_eq!(a.payload.summary.as_deref(), Some("<p>Effective today</p>"));
    }

    #[test]
    fn empty_title_is_rejected() {
        let n = Normalizer::default();
        let err = n
            .normalize(
                "bbc",
                RawItem {
                    title: "   ".into(),
                    url: Some("https://example.test/a".into()),
                    ..Default::default()
                },
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err, NormalizeError::EmptyTitle);
    }

    #[test]
    fn scope_controls_cross_source_identity() {
        let raw = RawItem {
            title: "Same story".into(),
            url: Some("https://example.test/story".into()),
            ..Default::default()
        };
        let now = Utc::now();
        let per_source = Normalizer::new(DedupScope::PerSource);
        let global = Normalizer::new(DedupScope::Global);
        assert_ne!(
            per_source.normalize("a", raw.clone(), now).unwrap().fingerprint,
            per_source.normalize("b", raw.clone(), now).unwrap().fingerprint
        );
        assert_eq!(
            global.normalize("a", raw.clone(), now).unwrap().fingerprint,
            global.normalize("b", raw, now).unwrap().fingerprint
        );
    }
}
