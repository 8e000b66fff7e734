//! Hacker News stories via the Algolia search API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use strata_shared::{HackerNewsSourceConfig, RawItem, Result, SourceType, StrataError};

use crate::source::{RateLimit, RateLimiter, Source, http_client};

/// Stories requested per fetch.
const HITS_PER_PAGE: u32 = 50;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "objectID")]
    object_id: String,
    title: Option<String>,
    url: Option<String>,
    author: Option<String>,
    points: Option<i64>,
    num_comments: Option<i64>,
    created_at_i: Option<i64>,
    story_text: Option<String>,
}

pub struct HackerNewsSource {
    config: HackerNewsSourceConfig,
    client: Client,
    limiter: RateLimiter,
}

impl HackerNewsSource {
    pub fn new(config: HackerNewsSourceConfig) -> Result<Self> {
        let limiter = RateLimiter::new(&config.name, config.rate_limit.map(RateLimit::from));
        Ok(Self {
            config,
            client: http_client()?,
            limiter,
        })
    }

    fn to_raw_item(&self, hit: Hit) -> Option<RawItem> {
        let title = hit.title.filter(|t| !t.trim().is_empty())?;
        let content = match hit.story_text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => format!("{title}\n\n{text}"),
            _ => title.clone(),
        };
        let timestamp = hit
            .created_at_i
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);
        let discussion = format!("https://news.ycombinator.com/item?id={}", hit.object_id);

        let mut item = RawItem::new(&self.config.name, &hit.object_id, "story", content, timestamp)
            .with_metadata("title", title)
            .with_metadata("url", hit.url.unwrap_or_else(|| discussion.clone()))
            .with_metadata("discussionUrl", discussion)
            .with_metadata("points", hit.points.unwrap_or(0))
            .with_metadata("comments", hit.num_comments.unwrap_or(0));
        if let Some(author) = hit.author {
            item = item.with_metadata("author", author);
        }
        Some(item)
    }
}

#[async_trait]
impl Source for HackerNewsSource {
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

    #[instrument(skip_all, fields(source = %self.config.name))]
    async fn fetch(&self) -> Result<Vec<RawItem>> {
        self.limiter.try_acquire()?;

        let url = format!(
            "{}/api/v1/search_by_date",
            self.config.base_url.trim_end_matches('/')
        );
        let hits_per_page = HITS_PER_PAGE.to_string();
        let mut query = vec![("tags", "story"), ("hitsPerPage", hits_per_page.as_str())];
        if let Some(q) = self.config.query.as_deref().filter(|q| !q.is_empty()) {
            query.push(("query", q));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| StrataError::source_fetch(&self.config.name, e.to_string()))?;

        if !response.status().is_success() {
            return Err(StrataError::source_fetch(
                &self.config.name,
                format!("HTTP {}", response.status()),
            ));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| StrataError::source_fetch(&self.config.name, e.to_string()))?;

        let items: Vec<RawItem> = body
            .hits
            .into_iter()
            .filter_map(|hit| self.to_raw_item(hit))
            .collect();
        debug!(count = items.len(), "fetched stories");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(base_url: &str) -> HackerNewsSourceConfig {
        HackerNewsSourceConfig {
            base_url: base_url.to_string(),
            query: Some("rust".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fetch_maps_hits_to_raw_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/search_by_date"))
            .and(query_param("tags", "story"))
            .and(query_param("query", "rust"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "hits": [
                    {
                        "objectID": "101",
                        "title": "Show HN: A Rust database",
                        "url": "https://example.com/db",
                        "author": "alice",
                        "points": 120,
                        "num_comments": 45,
                        "created_at_i": 1_700_000_000
                    },
                    { "objectID": "102", "title": null }
                ]
            })))
            .mount(&server)
            .await;

        let source = HackerNewsSource::new(config(&server.uri())).unwrap();
        let items = source.fetch().await.unwrap();

        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.source, "hackernews");
        assert_eq!(item.kind, "story");
        assert_eq!(item.content, "Show HN: A Rust database");
        assert_eq!(item.metadata["points"], 120);
        assert_eq!(item.metadata["comments"], 45);
        assert_eq!(item.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(item.id, strata_shared::raw_item_id("hackernews", "101"));
    }

    #[tokio::test]
    async fn refetching_yields_the_same_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/search_by_date"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "hits": [{ "objectID": "7", "title": "Same story" }]
            })))
            .mount(&server)
            .await;

        let source = HackerNewsSource::new(config(&server.uri())).unwrap();
        let first = source.fetch().await.unwrap();
        let second = source.fetch().await.unwrap();
        assert_eq!(first[0].id, second[0].id);
    }

    #[tokio::test]
    async fn http_error_is_a_source_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = HackerNewsSource::new(config(&server.uri())).unwrap();
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, StrataError::SourceFetch { .. }));
    }
}
