//! Cached text embeddings with a deterministic seeded fallback.
//!
//! Without a backend (or when it fails) every text maps to a pseudo-random
//! unit vector seeded from its content hash, so identical text always gets
//! bit-identical vectors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use strata_shared::{
    EmbedText, EmbeddingConfig, EmbeddingProvider, Result, StrataError, require_env_key,
};

use crate::content_hash;

/// Texts per embeddings request.
pub const MAX_BATCH_SIZE: usize = 100;

const CACHE_CAPACITY: usize = 10_000;

/// A remote embedding model.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Embed up to [`MAX_BATCH_SIZE`] texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible backend
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// `POST {base_url}/embeddings` client.
pub struct OpenAiEmbeddings {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| StrataError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbeddings {
    fn name(&self) -> &str {
        "openai"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| StrataError::Network(format!("embeddings request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StrataError::Network(format!(
                "embeddings API returned {status}: {body}"
            )));
        }

        let mut body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| StrataError::Serialization(format!("embeddings response: {e}")))?;
        if body.data.len() != texts.len() {
            return Err(StrataError::Network(format!(
                "embeddings API returned {} vectors for {} inputs",
                body.data.len(),
                texts.len()
            )));
        }
        body.data.sort_by_key(|d| d.index);
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ---------------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------------

/// Deterministic unit vector of length `dimension` seeded from `text`.
pub fn seeded_vector(text: &str, dimension: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    let mut rng = StdRng::from_seed(seed);

    let mut vector: Vec<f32> = (0..dimension).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    normalize(&mut vector);
    vector
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

pub struct Embedder {
    dimension: usize,
    backend: Option<Arc<dyn EmbeddingBackend>>,
    cache: Mutex<HashMap<String, Vec<f32>>>,
    degraded: AtomicU64,
}

impl Embedder {
    /// Seeded vectors only.
    pub fn local(dimension: usize) -> Self {
        Self {
            dimension,
            backend: None,
            cache: Mutex::new(HashMap::new()),
            degraded: AtomicU64::new(0),
        }
    }

    pub fn with_backend(dimension: usize, backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::local(dimension)
        }
    }

    /// Build from `[embedding]`. A configured provider without its key is a config error.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        if config.dimension == 0 {
            return Err(StrataError::config("embedding.dimension must be positive"));
        }
        let embedder = match config.provider {
            EmbeddingProvider::None => Self::local(config.dimension),
            EmbeddingProvider::Openai => {
                let api_key = require_env_key(&config.api_key_env)?;
                Self::with_backend(
                    config.dimension,
                    Arc::new(OpenAiEmbeddings::new(config, api_key)?),
                )
            }
        };
        info!(
            provider = embedder.backend.as_ref().map_or("seeded", |b| b.name()),
            dimension = config.dimension,
            "embedder ready"
        );
        Ok(embedder)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Times a backend failure fell back to the seeded vector.
    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Embed one text. Never fails: backend errors fall back to [`seeded_vector`].
    pub async fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vectors = self.embed_many(&[text.to_string()]).await;
        vectors.pop().unwrap_or_else(|| seeded_vector(text, self.dimension))
    }

    /// Embed many texts in order, hitting the backend in chunks of [`MAX_BATCH_SIZE`].
    pub async fn embed_many(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let keys: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            keys.iter().map(|k| cache.get(k).cloned()).collect()
        };

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| out[i].is_none()).collect();
        if !missing.is_empty() {
            debug!(hits = texts.len() - missing.len(), misses = missing.len(), "embedding cache lookup");
        }

        for chunk in missing.chunks(MAX_BATCH_SIZE) {
            let batch: Vec<String> = chunk.iter().map(|&i| texts[i].clone()).collect();
            let (vectors, fell_back) = self.embed_uncached(&batch).await;
            if fell_back {
                for (&i, vector) in chunk.iter().zip(vectors) {
                    out[i] = Some(vector);
                }
                continue;
            }

            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if cache.len() + chunk.len() > CACHE_CAPACITY {
                cache.clear();
            }
            for (&i, vector) in chunk.iter().zip(vectors) {
                cache.insert(keys[i].clone(), vector.clone());
                out[i] = Some(vector);
            }
        }

        out.into_iter()
            .zip(texts)
            .map(|(v, t)| v.unwrap_or_else(|| seeded_vector(t, self.dimension)))
            .collect()
    }

    /// The flag is set when a configured backend failed and seeded vectors
    /// stand in; those are kept out of the cache so a recovered backend wins.
    async fn embed_uncached(&self, texts: &[String]) -> (Vec<Vec<f32>>, bool) {
        let seeded = || -> Vec<Vec<f32>> {
            texts.iter().map(|t| seeded_vector(t, self.dimension)).collect()
        };
        let Some(backend) = &self.backend else {
            return (seeded(), false);
        };

        match backend.embed_batch(texts).await {
            Ok(vectors) if vectors.iter().all(|v| v.len() == self.dimension) => (vectors, false),
            Ok(vectors) => {
                warn!(
                    backend = backend.name(),
                    expected = self.dimension,
                    got = vectors.first().map_or(0, Vec::len),
                    "embedding dimension mismatch, using seeded vectors"
                );
                self.degraded.fetch_add(texts.len() as u64, Ordering::Relaxed);
                (seeded(), true)
            }
            Err(e) => {
                debug!(backend = backend.name(), error = %e, "embedding degraded to seeded vectors");
                self.degraded.fetch_add(texts.len() as u64, Ordering::Relaxed);
                (seeded(), true)
            }
        }
    }
}

#[async_trait]
impl EmbedText for Embedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_one(text).await)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[tokio::test]
    async fn seeded_vectors_are_deterministic_unit_vectors() {
        let a = Embedder::local(64);
        let b = Embedder::local(64);
        let va = a.embed_one("solana airdrop").await;
        let vb = b.embed_one("solana airdrop").await;

        assert_eq!(va.len(), 64);
        assert_eq!(va, vb);
        assert!((norm(&va) - 1.0).abs() < 1e-5);
        assert_ne!(va, a.embed_one("something else").await);
    }

    #[tokio::test]
    async fn backend_vectors_are_used_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    { "index": 1, "embedding": [0.0, 1.0, 0.0] },
                    { "index": 0, "embedding": [1.0, 0.0, 0.0] }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            provider: EmbeddingProvider::Openai,
            dimension: 3,
            base_url: server.uri(),
            ..Default::default()
        };
        let backend = OpenAiEmbeddings::new(&config, "k".into()).unwrap();
        let embedder = Embedder::with_backend(3, Arc::new(backend));

        let texts = vec!["first".to_string(), "second".to_string()];
        let vectors = embedder.embed_many(&texts).await;
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0, 0.0]);

        // Served from cache; the mock expects exactly one request.
        assert_eq!(embedder.embed_one("second").await, vec![0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn backend_failure_degrades_to_seeded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            provider: EmbeddingProvider::Openai,
            dimension: 8,
            base_url: server.uri(),
            ..Default::default()
        };
        let backend = OpenAiEmbeddings::new(&config, "k".into()).unwrap();
        let embedder = Embedder::with_backend(8, Arc::new(backend));

        let vector = embedder.embed_one("hello").await;
        assert_eq!(vector, seeded_vector("hello", 8));
        assert_eq!(embedder.degraded_count(), 1);
    }

    #[tokio::test]
    async fn recovered_backend_replaces_fallback_vectors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "index": 0, "embedding": [0.0, 0.0, 1.0] }]
            })))
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            provider: EmbeddingProvider::Openai,
            dimension: 3,
            base_url: server.uri(),
            ..Default::default()
        };
        let backend = OpenAiEmbeddings::new(&config, "k".into()).unwrap();
        let embedder = Embedder::with_backend(3, Arc::new(backend));

        assert_eq!(embedder.embed_one("flaky").await, seeded_vector("flaky", 3));
        assert_eq!(embedder.embed_one("flaky").await, vec![0.0, 0.0, 1.0]);
        assert_eq!(embedder.degraded_count(), 1);
    }
}
