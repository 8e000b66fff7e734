//! Fixtures shared by the unit tests of this crate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use strata_processing::Embedder;
use strata_shared::{ContentType, EmbedText, KnowledgeContent, KnowledgeItem, KnowledgeSource, SourceType};
use strata_storage::{LocalVectorStore, MemoryStore, StorageOrchestrator};

pub(crate) const DIM: usize = 64;

pub(crate) fn knowledge(id: &str, raw: &str, embedding: Vec<f32>) -> KnowledgeItem {
    KnowledgeItem {
        id: id.to_string(),
        source: KnowledgeSource {
            kind: SourceType::News,
            name: "hackernews".into(),
            url: None,
            credibility: 70.0,
        },
        content: KnowledgeContent {
            raw: raw.to_string(),
            summary: raw.to_string(),
            kind: ContentType::Discussion,
        },
        embedding,
        entities: Vec::new(),
        relationships: Vec::new(),
        topics: ["crypto".to_string()].into(),
        sentiment: 0.0,
        importance: 50.0,
        timestamp: Utc::now(),
        expires_at: None,
        decay_rate: 0.5,
        processed: true,
        quality: 50.0,
    }
}

/// Initialized storage over a fresh temp directory.
pub(crate) async fn storage() -> Arc<StorageOrchestrator> {
    let dir = std::env::temp_dir().join(format!("strata-core-{}", Uuid::now_v7()));
    let storage = Arc::new(StorageOrchestrator::new(
        Arc::new(LocalVectorStore::new(dir.join("vectors.json"))),
        Arc::new(MemoryStore::in_memory()),
        Duration::from_secs(3600),
    ));
    storage.init().await.expect("storage init");
    storage
}

pub(crate) fn embedder() -> Arc<dyn EmbedText> {
    Arc::new(Embedder::local(DIM))
}
