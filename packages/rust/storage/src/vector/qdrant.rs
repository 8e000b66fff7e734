//! Qdrant backend over its REST API.
//!
//! Each point's payload is the full knowledge item, so `init` can rebuild the
//! local id cache by scrolling the collection.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use strata_shared::{KnowledgeItem, QdrantConfig, Result, ScoredKnowledge, StrataError};

use super::cache::ItemCache;
use super::{ItemPredicate, VectorStore, WRITE_BATCH_SIZE};

const SCROLL_PAGE: usize = 256;

/// Namespace for point ids derived from non-uuid item ids.
const POINT_NAMESPACE: Uuid = Uuid::from_u128(0x3b8e_51f2_0c4a_4d97_b6e1_9a2f_7c05_d813);

#[derive(Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct ScoredPoint {
    score: f64,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<Record>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
struct Record {
    #[serde(default)]
    payload: Option<Value>,
}

/// Qdrant point ids must be uuids or integers.
fn point_id(id: &str) -> String {
    match Uuid::parse_str(id) {
        Ok(uuid) => uuid.to_string(),
        Err(_) => Uuid::new_v5(&POINT_NAMESPACE, id.as_bytes()).to_string(),
    }
}

fn decode_payload(payload: Option<Value>) -> Option<KnowledgeItem> {
    let payload = payload?;
    match serde_json::from_value(payload) {
        Ok(item) => Some(item),
        Err(e) => {
            warn!(error = %e, "skipping undecodable qdrant payload");
            None
        }
    }
}

pub struct QdrantVectorStore {
    client: Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
    dimension: usize,
    cache: ItemCache,
}

impl QdrantVectorStore {
    /// A configured `api_key_env` that is unset is a config error.
    pub fn new(config: &QdrantConfig, dimension: usize) -> Result<Self> {
        let api_key = config
            .api_key_env
            .as_deref()
            .map(strata_shared::require_env_key)
            .transpose()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StrataError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            api_key,
            dimension,
            cache: ItemCache::new("qdrant"),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/collections/{}{path}", self.base_url, self.collection);
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder, what: &str) -> Result<T> {
        let response = builder
            .send()
            .await
            .map_err(|e| StrataError::Storage(format!("qdrant {what}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StrataError::Storage(format!(
                "qdrant {what} returned {status}: {body}"
            )));
        }
        let body: QdrantResponse<T> = response
            .json()
            .await
            .map_err(|e| StrataError::Serialization(format!("qdrant {what}: {e}")))?;
        Ok(body.result)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let response = self
            .request(Method::GET, "")
            .send()
            .await
            .map_err(|e| StrataError::Storage(format!("qdrant collection lookup: {e}")))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => self.create_collection().await,
            status => Err(StrataError::Storage(format!(
                "qdrant collection lookup returned {status}"
            ))),
        }
    }

    async fn create_collection(&self) -> Result<()> {
        let body = json!({ "vectors": { "size": self.dimension, "distance": "Cosine" } });
        let _: Value = self
            .send(self.request(Method::PUT, "").json(&body), "create collection")
            .await?;
        info!(collection = %self.collection, dimension = self.dimension, "qdrant collection created");
        Ok(())
    }

    async fn warm_cache(&self) -> Result<usize> {
        let mut offset: Option<Value> = None;
        let mut loaded = 0;
        loop {
            let mut body = json!({
                "limit": SCROLL_PAGE,
                "with_payload": true,
                "with_vector": false,
            });
            if let Some(offset) = offset.take() {
                body["offset"] = offset;
            }
            let page: ScrollResult = self
                .send(
                    self.request(Method::POST, "/points/scroll").json(&body),
                    "scroll",
                )
                .await?;

            let items: Vec<KnowledgeItem> =
                page.points.into_iter().filter_map(|p| decode_payload(p.payload)).collect();
            loaded += items.len();
            self.cache.insert_many(items).await;

            match page.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => return Ok(loaded),
            }
        }
    }

    async fn upsert(&self, items: &[KnowledgeItem]) -> Result<()> {
        let points = items
            .iter()
            .map(|item| {
                Ok(json!({
                    "id": point_id(&item.id),
                    "vector": item.embedding,
                    "payload": serde_json::to_value(item)?,
                }))
            })
            .collect::<Result<Vec<Value>>>()?;

        let _: Value = self
            .send(
                self.request(Method::PUT, "/points?wait=true")
                    .json(&json!({ "points": points })),
                "upsert",
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    fn name(&self) -> &str {
        "qdrant"
    }

    async fn init(&self) -> Result<()> {
        let _guard = self.cache.init_guard().await;
        if self.cache.is_initialized() {
            return Ok(());
        }

        self.ensure_collection().await?;
        let loaded = self.warm_cache().await?;
        info!(collection = %self.collection, items = loaded, "qdrant store ready");
        self.cache.mark_initialized();
        Ok(())
    }

    async fn add(&self, item: KnowledgeItem) -> Result<()> {
        self.cache.ensure_init()?;
        self.upsert(std::slice::from_ref(&item)).await?;
        self.cache.insert(item).await;
        Ok(())
    }

    async fn add_batch(&self, items: Vec<KnowledgeItem>) -> Result<usize> {
        self.cache.ensure_init()?;
        for chunk in items.chunks(WRITE_BATCH_SIZE) {
            self.upsert(chunk).await?;
            debug!(points = chunk.len(), "qdrant batch upserted");
        }
        let count = items.len();
        self.cache.insert_many(items).await;
        Ok(count)
    }

    async fn get(&self, id: &str) -> Result<Option<KnowledgeItem>> {
        self.cache.ensure_init()?;
        Ok(self.cache.get(id).await)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.cache.ensure_init()?;
        let _: Value = self
            .send(
                self.request(Method::POST, "/points/delete?wait=true")
                    .json(&json!({ "points": [point_id(id)] })),
                "delete",
            )
            .await?;
        Ok(self.cache.remove(id).await)
    }

    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredKnowledge>> {
        self.cache.ensure_init()?;
        let body = json!({
            "vector": embedding,
            "limit": limit,
            "score_threshold": min_score,
            "with_payload": true,
        });
        let points: Vec<ScoredPoint> = self
            .send(
                self.request(Method::POST, "/points/search").json(&body),
                "search",
            )
            .await?;

        Ok(points
            .into_iter()
            .filter(|p| p.score >= min_score)
            .filter_map(|p| {
                decode_payload(p.payload).map(|item| ScoredKnowledge {
                    item,
                    score: p.score,
                })
            })
            .collect())
    }

    async fn filter(&self, predicate: ItemPredicate<'_>) -> Result<Vec<KnowledgeItem>> {
        self.cache.ensure_init()?;
        Ok(self.cache.filter(predicate).await)
    }

    async fn get_all(&self) -> Result<Vec<KnowledgeItem>> {
        self.cache.ensure_init()?;
        Ok(self.cache.all().await)
    }

    async fn count(&self) -> Result<usize> {
        self.cache.ensure_init()?;
        Ok(self.cache.len().await)
    }

    async fn save(&self) -> Result<()> {
        // Writes use wait=true and are durable once acknowledged.
        self.cache.ensure_init()
    }

    async fn clear(&self) -> Result<()> {
        self.cache.ensure_init()?;
        let _: Value = self
            .send(self.request(Method::DELETE, ""), "drop collection")
            .await?;
        self.create_collection().await?;
        self.cache.clear().await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
