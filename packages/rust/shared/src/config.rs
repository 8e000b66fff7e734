//! Application configuration for strata.
//!
//! User config lives at `~/.strata/strata.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "strata.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".strata";

// ---------------------------------------------------------------------------
// Config structs (matching strata.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where snapshots and embedded databases live.
    #[serde(default)]
    pub data: DataConfig,

    /// Vector index backend and flush policy.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Embedding backend.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Language-analysis backend.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Ingestion limits.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Pattern mining cadence.
    #[serde(default)]
    pub learning: LearningConfig,

    /// Prediction evaluation cadence.
    #[serde(default)]
    pub prediction: PredictionConfig,

    /// Registered sources.
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            analyzer: AnalyzerConfig::default(),
            ingest: IngestConfig::default(),
            learning: LearningConfig::default(),
            prediction: PredictionConfig::default(),
            sources: default_sources(),
        }
    }
}

impl AppConfig {
    /// Resolve the data directory, expanding a leading `~`.
    pub fn data_dir(&self) -> Result<PathBuf> {
        expand_home(&self.data.dir)
    }
}

fn default_sources() -> Vec<SourceConfig> {
    vec![SourceConfig::Hackernews(HackerNewsSourceConfig::default())]
}

/// `[data]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.strata/data".into()
}

/// Which vector index implementation backs the knowledge store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackendKind {
    /// File-backed in-memory index (`vectors.json`).
    #[default]
    Local,
    /// Qdrant over its REST API.
    Qdrant,
    /// libSQL / Turso with native vector columns.
    Libsql,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: VectorBackendKind,

    /// Seconds between flushes of dirty snapshots.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default)]
    pub qdrant: QdrantConfig,

    #[serde(default)]
    pub libsql: LibsqlConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackendKind::Local,
            flush_interval_secs: default_flush_interval(),
            qdrant: QdrantConfig::default(),
            libsql: LibsqlConfig::default(),
        }
    }
}

fn default_flush_interval() -> u64 {
    30
}

/// `[storage.qdrant]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    #[serde(default = "default_qdrant_url")]
    pub url: String,

    #[serde(default = "default_collection")]
    pub collection: String,

    /// Name of the env var holding the API key, if the server requires one.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: default_qdrant_url(),
            collection: default_collection(),
            api_key_env: None,
        }
    }
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".into()
}
fn default_collection() -> String {
    "knowledge".into()
}

/// `[storage.libsql]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibsqlConfig {
    /// `libsql://` / `https://` for a remote database, otherwise a file path
    /// relative to the data directory.
    #[serde(default = "default_libsql_url")]
    pub url: String,

    /// Name of the env var holding the auth token for remote databases.
    #[serde(default = "default_libsql_token_env")]
    pub auth_token_env: String,
}

impl Default for LibsqlConfig {
    fn default() -> Self {
        Self {
            url: default_libsql_url(),
            auth_token_env: default_libsql_token_env(),
        }
    }
}

impl LibsqlConfig {
    pub fn is_remote(&self) -> bool {
        self.url.starts_with("libsql://")
            || self.url.starts_with("https://")
            || self.url.starts_with("http://")
    }
}

fn default_libsql_url() -> String {
    "knowledge.db".into()
}
fn default_libsql_token_env() -> String {
    "LIBSQL_AUTH_TOKEN".into()
}

/// Embedding provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Deterministic seeded vectors only.
    #[default]
    None,
    /// OpenAI-compatible `/embeddings` endpoint.
    Openai,
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Vector length for this deployment.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::None,
            model: default_embedding_model(),
            dimension: default_dimension(),
            api_key_env: default_openai_key_env(),
            base_url: default_openai_base_url(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_dimension() -> usize {
    1536
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".into()
}

/// Language-analysis provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerProvider {
    /// Rule-based extraction and extractive summaries.
    #[default]
    Local,
    /// Hosted chat model through OpenRouter.
    Openrouter,
}

/// `[analyzer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default)]
    pub provider: AnalyzerProvider,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for extraction, summaries and prediction text.
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_openrouter_base_url")]
    pub base_url: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            provider: AnalyzerProvider::Local,
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_openrouter_base_url(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

/// `[ingest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Sources fetched at once during a full ingest.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Capacity of the recent raw items ring buffer.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}
fn default_buffer_capacity() -> usize {
    1000
}

/// `[learning]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_learning_interval")]
    pub interval_secs: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_learning_interval(),
        }
    }
}

fn default_learning_interval() -> u64 {
    3600
}

/// `[prediction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    #[serde(default = "default_prediction_interval")]
    pub interval_secs: u64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_prediction_interval(),
        }
    }
}

fn default_prediction_interval() -> u64 {
    900
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Optional `{requests, window_ms}` limit for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window_ms: u64,
}

/// `[[sources]]` entry, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Hackernews(HackerNewsSourceConfig),
    Github(GithubSourceConfig),
    Webpage(WebPageSourceConfig),
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Hackernews(c) => &c.name,
            Self::Github(c) => &c.name,
            Self::Webpage(c) => &c.name,
        }
    }
}

/// Hacker News via the Algolia search API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HackerNewsSourceConfig {
    #[serde(default = "default_hn_name")]
    pub name: String,
    /// Optional search query; empty means latest stories.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_hn_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_hn_priority")]
    pub priority: u8,
    #[serde(default = "default_hn_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for HackerNewsSourceConfig {
    fn default() -> Self {
        Self {
            name: default_hn_name(),
            query: None,
            interval_ms: default_hn_interval(),
            priority: default_hn_priority(),
            base_url: default_hn_base_url(),
            rate_limit: None,
        }
    }
}

fn default_hn_name() -> String {
    "hackernews".into()
}
fn default_hn_interval() -> u64 {
    15 * 60 * 1000
}
fn default_hn_priority() -> u8 {
    7
}
fn default_hn_base_url() -> String {
    "https://hn.algolia.com".into()
}

/// Releases of one GitHub repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubSourceConfig {
    #[serde(default = "default_github_name")]
    pub name: String,
    /// `owner/repo`.
    pub repo: String,
    #[serde(default = "default_github_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_github_priority")]
    pub priority: u8,
    #[serde(default = "default_github_base_url")]
    pub base_url: String,
    /// Name of the env var holding a token (optional, raises GitHub's limit).
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_github_rate_limit")]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_github_name() -> String {
    "github".into()
}
fn default_github_interval() -> u64 {
    60 * 60 * 1000
}
fn default_github_priority() -> u8 {
    6
}
fn default_github_base_url() -> String {
    "https://api.github.com".into()
}
fn default_github_rate_limit() -> Option<RateLimitConfig> {
    Some(RateLimitConfig {
        requests: 60,
        window_ms: 60 * 60 * 1000,
    })
}

/// One HTML page split into items by a CSS selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebPageSourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_selector")]
    pub selector: String,
    /// Raw item type reported for each element.
    #[serde(default = "default_webpage_kind")]
    pub item_type: String,
    #[serde(default = "default_webpage_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_webpage_priority")]
    pub priority: u8,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_selector() -> String {
    "article".into()
}
fn default_webpage_kind() -> String {
    "article".into()
}
fn default_webpage_interval() -> u64 {
    30 * 60 * 1000
}
fn default_webpage_priority() -> u8 {
    5
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.strata/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| StrataError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.strata/strata.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| StrataError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| StrataError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| StrataError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| StrataError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a required secret from the named env var.
pub fn require_env_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(StrataError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| StrataError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("flush_interval_secs"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("hackernews"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.ingest.concurrency, 5);
        assert_eq!(parsed.storage.backend, VectorBackendKind::Local);
        assert_eq!(parsed.analyzer.api_key_env, "OPENROUTER_API_KEY");
        assert_eq!(parsed.sources.len(), 1);
    }

    #[test]
    fn config_with_sources() {
        let toml_str = r#"
[storage]
backend = "qdrant"

[storage.qdrant]
url = "http://qdrant:6333"

[[sources]]
kind = "github"
repo = "solana-labs/solana"

[[sources]]
kind = "webpage"
name = "blog"
url = "https://example.com/blog"
selector = "div.post"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.storage.backend, VectorBackendKind::Qdrant);
        assert_eq!(config.storage.qdrant.collection, "knowledge");
        assert_eq!(config.sources.len(), 2);
        match &config.sources[0] {
            SourceConfig::Github(g) => {
                assert_eq!(g.repo, "solana-labs/solana");
                assert_eq!(g.rate_limit.map(|r| r.requests), Some(60));
            }
            other => panic!("unexpected source: {other:?}"),
        }
        assert_eq!(config.sources[1].name(), "blog");
    }

    #[test]
    fn libsql_remote_detection() {
        let mut libsql = LibsqlConfig::default();
        assert!(!libsql.is_remote());
        libsql.url = "libsql://db-org.turso.io".into();
        assert!(libsql.is_remote());
    }

    #[test]
    fn missing_env_key_is_config_error() {
        // Use a unique env var name to avoid interfering with other tests
        let result = require_env_key("STRATA_TEST_NONEXISTENT_KEY_12345");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
