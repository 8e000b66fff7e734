//! Static lookup tables keyed by source type and raw item type.

use strata_shared::{ContentType, SourceType};

/// Credibility used for source types missing from [`SOURCE_PROFILES`].
pub const DEFAULT_CREDIBILITY: f64 = 50.0;

/// Decay rate used for source types missing from [`SOURCE_PROFILES`].
pub const DEFAULT_DECAY_RATE: f64 = 0.5;

/// Static facts about a known source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceProfile {
    pub source_type: SourceType,
    /// In `[0, 100]`.
    pub credibility: f64,
    /// In `[0, 1]`.
    pub decay_rate: f64,
}

const SOURCE_PROFILES: &[(SourceType, SourceProfile)] = &[
    (SourceType::News, profile(SourceType::News, 70.0, 0.5)),
    (SourceType::Github, profile(SourceType::Github, 80.0, 0.3)),
    (SourceType::Research, profile(SourceType::Research, 85.0, 0.1)),
    (SourceType::Market, profile(SourceType::Market, 75.0, 0.9)),
    (SourceType::Onchain, profile(SourceType::Onchain, 90.0, 0.6)),
];

const fn profile(source_type: SourceType, credibility: f64, decay_rate: f64) -> SourceProfile {
    SourceProfile {
        source_type,
        credibility,
        decay_rate,
    }
}

/// Look up a source type, falling back to social / 50 / 0.5.
pub fn source_profile(source_type: SourceType) -> SourceProfile {
    SOURCE_PROFILES
        .iter()
        .find(|(kind, _)| *kind == source_type)
        .map(|(_, p)| *p)
        .unwrap_or(SourceProfile {
            source_type,
            credibility: DEFAULT_CREDIBILITY,
            decay_rate: DEFAULT_DECAY_RATE,
        })
}

/// Map a `(source, raw type)` pair to a content type, defaulting to article.
pub fn content_type(source: &str, kind: &str) -> ContentType {
    match (source.to_ascii_lowercase().as_str(), kind.to_ascii_lowercase().as_str()) {
        ("github", "issue") | ("github", "pull_request") => ContentType::Discussion,
        (_, "story" | "comment" | "discussion" | "thread") => ContentType::Discussion,
        (_, "release") => ContentType::Release,
        (_, "commit" | "code" | "snippet") => ContentType::Code,
        (_, "tweet" | "post" | "cast") => ContentType::Post,
        (_, "paper" | "preprint") => ContentType::Paper,
        (_, "price" | "ticker") => ContentType::Price,
        (_, "transaction" | "tx" | "transfer") => ContentType::Transaction,
        _ => ContentType::Article,
    }
}
