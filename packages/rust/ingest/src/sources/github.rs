//! Releases of a GitHub repository.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use strata_shared::{GithubSourceConfig, RawItem, Result, SourceType, StrataError};

use crate::source::{RateLimit, RateLimiter, Source, http_client};

const RELEASES_PER_PAGE: u32 = 30;

#[derive(Debug, Deserialize)]
struct Release {
    id: u64,
    tag_name: String,
    name: Option<String>,
    body: Option<String>,
    html_url: Option<String>,
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    reactions: Option<Reactions>,
}

#[derive(Debug, Deserialize)]
struct Reactions {
    #[serde(default)]
    total_count: i64,
}

pub struct GithubSource {
    config: GithubSourceConfig,
    client: Client,
    limiter: RateLimiter,
    token: Option<String>,
}

impl GithubSource {
    pub fn new(config: GithubSourceConfig) -> Result<Self> {
        if !config.repo.contains('/') {
            return Err(StrataError::config(format!(
                "github source {}: repo must be owner/name, got {:?}",
                config.name, config.repo
            )));
        }

        // A missing token only lowers GitHub's own limit, so it is not fatal.
        let token = config.token_env.as_deref().and_then(|var| {
            let token = std::env::var(var).ok().filter(|v| !v.is_empty());
            if token.is_none() {
                warn!(var, "github token variable not set, using anonymous access");
            }
            token
        });

        let limiter = RateLimiter::new(&config.name, config.rate_limit.map(RateLimit::from));
        Ok(Self {
            config,
            client: http_client()?,
            limiter,
            token,
        })
    }

    fn to_raw_item(&self, release: Release) -> RawItem {
        let title = release
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| release.tag_name.clone());
        let content = match release.body.as_deref().map(str::trim) {
            Some(body) if !body.is_empty() => {
                format!("{} {title} released\n\n{body}", self.config.repo)
            }
            _ => format!("{} {title} released", self.config.repo),
        };

        let mut item = RawItem::new(
            &self.config.name,
            &release.id.to_string(),
            "release",
            content,
            release.published_at.unwrap_or_else(Utc::now),
        )
        .with_metadata("repo", self.config.repo.clone())
        .with_metadata("tag", release.tag_name)
        .with_metadata("prerelease", release.prerelease);
        if let Some(url) = release.html_url {
            item = item.with_metadata("url", url);
        }
        if let Some(reactions) = release.reactions {
            item = item.with_metadata("reactions", reactions.total_count);
        }
        item
    }
}

#[async_trait]
impl Source for GithubSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn source_type(&self) -> SourceType {
        SourceType::Github
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

    #[instrument(skip_all, fields(source = %self.config.name, repo = %self.config.repo))]
    async fn fetch(&self) -> Result<Vec<RawItem>> {
        self.limiter.try_acquire()?;

        let url = format!(
            "{}/repos/{}/releases",
            self.config.base_url.trim_end_matches('/'),
            self.config.repo
        );
        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .query(&[("per_page", RELEASES_PER_PAGE)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StrataError::source_fetch(&self.config.name, e.to_string()))?;

        if !response.status().is_success() {
            return Err(StrataError::source_fetch(
                &self.config.name,
                format!("HTTP {}", response.status()),
            ));
        }

        let releases: Vec<Release> = response
            .json()
            .await
            .map_err(|e| StrataError::source_fetch(&self.config.name, e.to_string()))?;

        let items: Vec<RawItem> = releases
            .into_iter()
            .filter(|r| !r.draft)
            .map(|r| self.to_raw_item(r))
            .collect();
        debug!(count = items.len(), "fetched releases");
        Ok(items)
    }
}
