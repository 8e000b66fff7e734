//! One HTML page split into items by a CSS selector.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use url::Url;

use strata_shared::{RawItem, Result, SourceType, StrataError, WebPageSourceConfig};

use crate::source::{RateLimit, RateLimiter, Source, http_client};

/// Elements with less text than this are navigation noise.
const MIN_TEXT_LEN: usize = 20;

pub struct WebPageSource {
    config: WebPageSourceConfig,
    page_url: Url,
    client: Client,
    limiter: RateLimiter,
}

impl WebPageSource {
    pub fn new(config: WebPageSourceConfig) -> Result<Self> {
        let page_url = Url::parse(&config.url).map_err(|e| {
            StrataError::config(format!("webpage source {}: invalid url: {e}", config.name))
        })?;
        parse_selector(&config.selector)?;

        let limiter = RateLimiter::new(&config.name, config.rate_limit.map(RateLimit::from));
        Ok(Self {
            config,
            page_url,
            client: http_client()?,
            limiter,
        })
    }
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| StrataError::config(format!("invalid CSS selector {selector:?}: {e}")))
}

/// Stable external id for an element: the hash of its text.
fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest[..12].iter().map(|b| format!("{b:02x}")).collect()
}

fn element_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a page into raw items. Sync so the parsed DOM never crosses an await.
fn extract_items(html: &str, config: &WebPageSourceConfig, page_url: &Url) -> Result<Vec<RawItem>> {
    let document = Html::parse_document(html);
    let selector = parse_selector(&config.selector)?;
    let heading = parse_selector("h1, h2, h3")?;
    let link = parse_selector("a[href]")?;

    let fetched_at = Utc::now();
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for element in document.select(&selector) {
        let text = element_text(&element);
        if text.len() < MIN_TEXT_LEN {
            continue;
        }
        let external_id = content_hash(&text);
        if !seen.insert(external_id.clone()) {
            continue;
        }

        let url = element
            .select(&link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| page_url.join(href).ok())
            .unwrap_or_else(|| page_url.clone());

        let mut item = RawItem::new(
            &config.name,
            &external_id,
            &config.item_type,
            text,
            fetched_at,
        )
        .with_metadata("url", url.to_string())
        .with_metadata("page", page_url.to_string());
        if let Some(title) = element.select(&heading).next().map(|h| element_text(&h)) {
            item = item.with_metadata("title", title);
        }
        items.push(item);
    }

    Ok(items)
}

#[async_trait]
impl Source for WebPageSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn source_type(&self) -> SourceType {
        SourceType::News
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    fn priority(&self) -> u8 {
        self.config.priority
    }

    fn rate_limit(&self) -> Option<RateLimit> {
        self.limiter.limit()
    }

    #[instrument(skip_all, fields(source = %self.config.name, url = %self.page_url))]
    async fn fetch(&self) -> Result<Vec<RawItem>> {
        self.limiter.try_acquire()?;

        let response = self
            .client
            .get(self.page_url.clone())
            .send()
            .await
            .map_err(|e| StrataError::source_fetch(&self.config.name, e.to_string()))?;

        if !response.status().is_success() {
            return Err(StrataError::source_fetch(
                &self.config.name,
                format!("HTTP {}", response.status()),
            ));
        }

        let html = response
            .text()
            .await
            .map_err(|e| StrataError::source_fetch(&self.config.name, e.to_string()))?;

        let items = extract_items(&html, &self.config, &self.page_url)?;
        debug!(count = items.len(), "extracted page items");
        Ok(items)
    }
}
