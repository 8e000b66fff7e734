//! Built-in [`Source`] implementations.

mod github;
mod hackernews;
mod webpage;

use std::sync::Arc;

use strata_shared::{Result, SourceConfig};

use crate::source::Source;

pub use github::GithubSource;
pub use hackernews::HackerNewsSource;
pub use webpage::WebPageSource;

/// Instantiate one source per `[[sources]]` entry.
pub fn build_source(config: &SourceConfig) -> Result<Arc<dyn Source>> {
    let source: Arc<dyn Source> = match config {
        SourceConfig::Hackernews(c) => Arc::new(HackerNewsSource::new(c.clone())?),
        SourceConfig::Github(c) => Arc::new(GithubSource::new(c.clone())?),
        SourceConfig::Webpage(c) => Arc::new(WebPageSource::new(c.clone())?),
    };
    Ok(source)
}

/// Instantiate every configured source. A bad entry fails the whole set.
pub fn build_sources(configs: &[SourceConfig]) -> Result<Vec<Arc<dyn Source>>> {
    configs.iter().map(build_source).collect()
}
