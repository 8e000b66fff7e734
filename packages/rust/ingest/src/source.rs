//! The [`Source`] trait and its source-local rate limiter.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;

use strata_shared::{RateLimitConfig, RawItem, Result, SourceType, StrataError};

/// User-Agent string for source requests.
pub(crate) const USER_AGENT: &str = concat!("strata/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client shared by the built-in sources.
pub(crate) fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| StrataError::Network(format!("failed to build HTTP client: {e}")))
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A rate-limited fetcher for one external origin.
#[async_trait]
pub trait Source: Send + Sync {
    /// Unique name, also the `RawItem.source` of everything it produces.
    fn name(&self) -> &str;

    /// Broad category used for registry filtering.
    fn source_type(&self) -> SourceType;

    /// How often the scheduler should poll this source.
    fn interval(&self) -> Duration;

    /// Higher runs first during a full ingest.
    fn priority(&self) -> u8;

    /// Optional request budget per window.
    fn rate_limit(&self) -> Option<RateLimit> {
        None
    }

    /// Fetch the current batch of raw items.
    ///
    /// Fails fast with [`StrataError::RateLimitExceeded`] when the budget is spent.
    async fn fetch(&self) -> Result<Vec<RawItem>>;
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// `requests` allowed per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub window: Duration,
}

impl From<RateLimitConfig> for RateLimit {
    fn from(config: RateLimitConfig) -> Self {
        Self {
            requests: config.requests,
            window: Duration::from_millis(config.window_ms),
        }
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
}

/// Fixed-window token counter local to one source.
///
/// The window restarts once more than `window` has elapsed since it opened.
/// An attempt beyond the budget fails immediately; nothing ever waits.
#[derive(Debug)]
pub struct RateLimiter {
    source: String,
    limit: Option<RateLimit>,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(source: impl Into<String>, limit: Option<RateLimit>) -> Self {
        Self {
            source: source.into(),
            limit,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    pub fn limit(&self) -> Option<RateLimit> {
        self.limit
    }

    /// Take one token or fail with [`StrataError::RateLimitExceeded`].
    pub fn try_acquire(&self) -> Result<()> {
        let Some(limit) = self.limit else {
            return Ok(());
        };

        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = window.started.elapsed();
        if elapsed > limit.window {
            window.started = Instant::now();
            window.used = 0;
        }

        if window.used >= limit.requests {
            let retry_after = limit.window.saturating_sub(window.started.elapsed());
            return Err(StrataError::RateLimitExceeded {
                source_name: self.source.clone(),
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }

        window.used += 1;
        Ok(())
    }
}
