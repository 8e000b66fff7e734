//! libSQL / Turso backend using native `F32_BLOB` vector columns.
//!
//! The database is embedded (a file under the data directory) unless the
//! configured URL is remote. Each row keeps the full item as JSON in `payload`
//! so `init` can warm the id cache.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use strata_shared::{
    KnowledgeItem, LibsqlConfig, Result, ScoredKnowledge, StrataError, require_env_key,
};

use super::cache::ItemCache;
use super::{ItemPredicate, VectorStore, WRITE_BATCH_SIZE};
use crate::migrations;

const UPSERT_SQL: &str = "INSERT INTO knowledge_index (id, embedding, payload, updated_at)
     VALUES (?1, vector32(?2), ?3, ?4)
     ON CONFLICT(id) DO UPDATE SET
        embedding = excluded.embedding,
        payload = excluded.payload,
        updated_at = excluded.updated_at";

enum Target {
    Local(PathBuf),
    Remote { url: String, token: String },
}

struct Handle {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

fn storage_err(e: libsql::Error) -> StrataError {
    StrataError::Storage(e.to_string())
}

pub struct LibsqlVectorStore {
    target: Target,
    dimension: usize,
    handle: OnceCell<Handle>,
    cache: ItemCache,
}

impl LibsqlVectorStore {
    /// Relative file URLs resolve under `data_dir`. A remote URL needs its
    /// auth token variable set.
    pub fn new(config: &LibsqlConfig, data_dir: &Path, dimension: usize) -> Result<Self> {
        let target = if config.is_remote() {
            Target::Remote {
                url: config.url.clone(),
                token: require_env_key(&config.auth_token_env)?,
            }
        } else {
            Target::Local(data_dir.join(&config.url))
        };
        Ok(Self {
            target,
            dimension,
            handle: OnceCell::new(),
            cache: ItemCache::new("libsql"),
        })
    }

    fn conn(&self) -> Result<&Connection> {
        self.handle
            .get()
            .map(|h| &h.conn)
            .ok_or_else(|| StrataError::not_initialized("libsql"))
    }

    async fn open(&self) -> Result<Handle> {
        let db = match &self.target {
            Target::Local(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| StrataError::io(parent, e))?;
                }
                libsql::Builder::new_local(path)
                    .build()
                    .await
                    .map_err(storage_err)?
            }
            Target::Remote { url, token } => {
                libsql::Builder::new_remote(url.clone(), token.clone())
                    .build()
                    .await
                    .map_err(storage_err)?
            }
        };
        let conn = db.connect().map_err(storage_err)?;
        Ok(Handle { db, conn })
    }

    async fn run_migrations(conn: &Connection, dimension: usize) -> Result<()> {
        let current_version = Self::schema_version(conn).await;

        for migration in migrations::all_migrations(dimension) {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(&migration.sql).await.map_err(|e| {
                    StrataError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// 0 when no migration has been applied yet.
    async fn schema_version(conn: &Connection) -> u32 {
        match conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await
        {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    async fn load_all(conn: &Connection) -> Result<Vec<KnowledgeItem>> {
        let mut rows = conn
            .query("SELECT id, payload FROM knowledge_index", params![])
            .await
            .map_err(storage_err)?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let id: String = row.get(0).map_err(storage_err)?;
            let payload: String = row.get(1).map_err(storage_err)?;
            match serde_json::from_str::<KnowledgeItem>(&payload) {
                Ok(item) => items.push(item),
                Err(e) => warn!(id = %id, error = %e, "skipping undecodable knowledge row"),
            }
        }
        Ok(items)
    }

    async fn write(&self, items: &[KnowledgeItem]) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction().await.map_err(storage_err)?;
        for item in items {
            let embedding = serde_json::to_string(&item.embedding)?;
            let payload = serde_json::to_string(item)?;
            tx.execute(
                UPSERT_SQL,
                params![item.id.as_str(), embedding, payload, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)
    }
}

#[async_trait]
impl VectorStore for LibsqlVectorStore {
    fn name(&self) -> &str {
        "libsql"
    }

    async fn init(&self) -> Result<()> {
        let _guard = self.cache.init_guard().await;
        if self.cache.is_initialized() {
            return Ok(());
        }

        if self.handle.get().is_none() {
            let handle = self.open().await?;
            Self::run_migrations(&handle.conn, self.dimension).await?;
            // Guarded by the init lock, so the cell is still empty.
            let _ = self.handle.set(handle);
        }

        let items = Self::load_all(self.conn()?).await?;
        info!(items = items.len(), "libsql store ready");
        self.cache.insert_many(items).await;
        self.cache.mark_initialized();
        Ok(())
    }

    async fn add(&self, item: KnowledgeItem) -> Result<()> {
        self.cache.ensure_init()?;
        self.write(std::slice::from_ref(&item)).await?;
        self.cache.insert(item).await;
        Ok(())
    }

    async fn add_batch(&self, items: Vec<KnowledgeItem>) -> Result<usize> {
        self.cache.ensure_init()?;
        for chunk in items.chunks(WRITE_BATCH_SIZE) {
            self.write(chunk).await?;
            debug!(rows = chunk.len(), "libsql batch written");
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
        self.conn()?
            .execute("DELETE FROM knowledge_index WHERE id = ?1", params![id])
            .await
            .map_err(storage_err)?;
        Ok(self.cache.remove(id).await)
    }

    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredKnowledge>> {
        self.cache.ensure_init()?;
        let query = serde_json::to_string(embedding)?;
        let mut rows = self
            .conn()?
            .query(
                "SELECT payload, vector_distance_cos(embedding, vector32(?1)) AS distance
                 FROM knowledge_index
                 ORDER BY distance ASC
                 LIMIT ?2",
                params![query, limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let payload: String = row.get(0).map_err(storage_err)?;
            let distance: f64 = row.get(1).map_err(storage_err)?;
            let score = 1.0 - distance;
            if score < min_score {
                continue;
            }
            match serde_json::from_str::<KnowledgeItem>(&payload) {
                Ok(item) => results.push(ScoredKnowledge { item, score }),
                Err(e) => warn!(error = %e, "skipping undecodable search hit"),
            }
        }
        Ok(results)
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
        // Every write commits its own transaction.
        self.cache.ensure_init()
    }

    async fn clear(&self) -> Result<()> {
        self.cache.ensure_init()?;
        self.conn()?
            .execute("DELETE FROM knowledge_index", params![])
            .await
            .map_err(storage_err)?;
        self.cache.clear().await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::super::testing::item;
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("strata-libsql-{}", Uuid::now_v7()))
    }

    fn store(dir: &Path) -> LibsqlVectorStore {
        LibsqlVectorStore::new(&LibsqlConfig::default(), dir, 2).unwrap()
    }

    #[tokio::test]
    async fn requires_init() {
        let dir = temp_dir();
        let store = store(&dir);
        assert!(matches!(
            store.get("a").await.unwrap_err(),
            StrataError::NotInitialized { .. }
        ));
    }

    #[tokio::test]
    async fn add_and_search_with_native_vectors() {
        let dir = temp_dir();
        let store = store(&dir);
        store.init().await.unwrap();
        store
            .add_batch(vec![
                item("same", vec![1.0, 0.0]),
                item("orthogonal", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.0], 5, 0.5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item.id, "same");
        assert!((results[0].score - 1.0).abs() < 1e-4);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn reopen_warms_cache_from_payload() {
        let dir = temp_dir();
        {
            let store = store(&dir);
            store.init().await.unwrap();
            store.add(item("a", vec![0.6, 0.8])).await.unwrap();
            store.add(item("b", vec![1.0, 0.0])).await.unwrap();
            assert!(store.delete("b").await.unwrap());
            store.shutdown().await.unwrap();
        }

        let reopened = store(&dir);
        reopened.init().await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        assert_eq!(
            reopened.get("a").await.unwrap().unwrap().embedding,
            vec![0.6, 0.8]
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn remote_url_needs_token() {
        let config = LibsqlConfig {
            url: "libsql://example.turso.io".into(),
            auth_token_env: "STRATA_TEST_MISSING_LIBSQL_TOKEN".into(),
        };
        let err = LibsqlVectorStore::new(&config, Path::new("/tmp"), 2)
            .err()
            .unwrap();
        assert!(matches!(err, StrataError::Config { .. }));
    }
}
