//! Patterns, predictions and short/long-term key/value memory.
//!
//! Short-term entries carry a ttl and expire lazily on read; `compact` sweeps
//! the rest. All state sits behind one lock so `promote` never exposes a key
//! in both tiers. Patterns and predictions are snapshotted to
//! `patterns.json` / `predictions.json`; key/value memory is process-local.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use strata_shared::{MemoryEntry, Pattern, Prediction, PredictionOutcome, Result, StrataError};

use crate::vector::local::write_atomic;

const PATTERNS_FILE: &str = "patterns.json";
const PREDICTIONS_FILE: &str = "predictions.json";

#[derive(Default)]
struct MemoryState {
    short_term: HashMap<String, MemoryEntry>,
    long_term: HashMap<String, MemoryEntry>,
    patterns: HashMap<String, Pattern>,
    predictions: HashMap<String, Prediction>,
    dirty: bool,
}

/// Entry and record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub short_term: usize,
    pub long_term: usize,
    pub patterns: usize,
    pub predictions: usize,
    pub pending_predictions: usize,
}

pub struct MemoryStore {
    dir: Option<PathBuf>,
    state: Mutex<MemoryState>,
    initialized: AtomicBool,
}

impl MemoryStore {
    /// Persist snapshots under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            state: Mutex::new(MemoryState::default()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Never touches disk.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            state: Mutex::new(MemoryState::default()),
            initialized: AtomicBool::new(false),
        }
    }

    fn ensure_init(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StrataError::not_initialized("memory"))
        }
    }

    /// Load snapshots. Safe to call more than once.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(dir) = &self.dir {
            let patterns: Vec<Pattern> = load_records(&dir.join(PATTERNS_FILE)).await?;
            let predictions: Vec<Prediction> = load_records(&dir.join(PREDICTIONS_FILE)).await?;
            info!(
                patterns = patterns.len(),
                predictions = predictions.len(),
                "memory store loaded"
            );
            state.patterns = patterns.into_iter().map(|p| (p.id.clone(), p)).collect();
            state.predictions = predictions.into_iter().map(|p| (p.id.clone(), p)).collect();
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Key/value memory
    // -----------------------------------------------------------------------

    /// Store a short-term entry that expires after `ttl`.
    pub async fn remember(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.ensure_init()?;
        let now = Utc::now();
        let entry = MemoryEntry {
            key: key.to_string(),
            value,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            ttl_ms: Some(ttl.as_millis().min(u64::MAX as u128) as u64),
        };
        let mut state = self.state.lock().await;
        state.long_term.remove(key);
        state.short_term.insert(key.to_string(), entry);
        Ok(())
    }

    /// Store a long-term entry.
    pub async fn remember_long(&self, key: &str, value: Value) -> Result<()> {
        self.ensure_init()?;
        let now = Utc::now();
        let entry = MemoryEntry {
            key: key.to_string(),
            value,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            ttl_ms: None,
        };
        let mut state = self.state.lock().await;
        state.short_term.remove(key);
        state.long_term.insert(key.to_string(), entry);
        Ok(())
    }

    /// Read an entry, short-term first. Expired entries are dropped on the way.
    pub async fn recall(&self, key: &str) -> Result<Option<MemoryEntry>> {
        self.ensure_init()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if state
            .short_term
            .get(key)
            .is_some_and(|entry| entry.is_expired(now))
        {
            debug!(key, "short-term entry expired");
            state.short_term.remove(key);
        }

        let MemoryState {
            short_term,
            long_term,
            ..
        } = &mut *state;
        let entry = short_term.get_mut(key).or_else(|| long_term.get_mut(key));
        Ok(entry.map(|entry| {
            entry.accessed_at = now;
            entry.access_count += 1;
            entry.clone()
        }))
    }

    /// Move a live short-term entry to long-term, dropping its ttl.
    ///
    /// Returns `false` when there is no live short-term entry for `key`.
    pub async fn promote(&self, key: &str) -> Result<bool> {
        self.ensure_init()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(mut entry) = state.short_term.remove(key) else {
            return Ok(false);
        };
        if entry.is_expired(now) {
            return Ok(false);
        }
        entry.ttl_ms = None;
        state.long_term.insert(key.to_string(), entry);
        Ok(true)
    }

    pub async fn forget(&self, key: &str) -> Result<bool> {
        self.ensure_init()?;
        let mut state = self.state.lock().await;
        let short = state.short_term.remove(key).is_some();
        let long = state.long_term.remove(key).is_some();
        Ok(short || long)
    }

    /// Drop every expired short-term entry. Returns how many were removed.
    pub async fn compact(&self) -> Result<usize> {
        self.ensure_init()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let before = state.short_term.len();
        state.short_term.retain(|_, entry| !entry.is_expired(now));
        let removed = before - state.short_term.len();
        if removed > 0 {
            debug!(removed, "compacted short-term memory");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Patterns
    // -----------------------------------------------------------------------

    /// Insert a pattern, or merge it into the stored one with the same id.
    /// Returns the stored result.
    pub async fn upsert_pattern(&self, pattern: Pattern) -> Result<Pattern> {
        self.ensure_init()?;
        let mut state = self.state.lock().await;
        let stored = match state.patterns.get_mut(&pattern.id) {
            Some(existing) => {
                existing.merge(&pattern);
                existing.clone()
            }
            None => {
                state.patterns.insert(pattern.id.clone(), pattern.clone());
                pattern
            }
        };
        state.dirty = true;
        Ok(stored)
    }

    pub async fn get_pattern(&self, id: &str) -> Result<Option<Pattern>> {
        self.ensure_init()?;
        Ok(self.state.lock().await.patterns.get(id).cloned())
    }

    /// All patterns, most confident first.
    pub async fn patterns(&self) -> Result<Vec<Pattern>> {
        self.ensure_init()?;
        let mut patterns: Vec<Pattern> = self.state.lock().await.patterns.values().cloned().collect();
        patterns.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(patterns)
    }

    // -----------------------------------------------------------------------
    // Predictions
    // -----------------------------------------------------------------------

    /// Insert or replace a prediction by id.
    pub async fn save_prediction(&self, prediction: Prediction) -> Result<()> {
        self.ensure_init()?;
        let mut state = self.state.lock().await;
        state.predictions.insert(prediction.id.clone(), prediction);
        state.dirty = true;
        Ok(())
    }

    /// Set a prediction's outcome unless it already has one.
    ///
    /// Returns `false` when the id is unknown or the prediction was already
    /// evaluated, so concurrent evaluators score each prediction once.
    pub async fn record_outcome(&self, id: &str, outcome: PredictionOutcome) -> Result<bool> {
        self.ensure_init()?;
        let mut state = self.state.lock().await;
        let Some(prediction) = state.predictions.get_mut(id) else {
            return Ok(false);
        };
        if prediction.outcome.is_some() {
            return Ok(false);
        }
        prediction.outcome = Some(outcome);
        state.dirty = true;
        Ok(true)
    }

    pub async fn get_prediction(&self, id: &str) -> Result<Option<Prediction>> {
        self.ensure_init()?;
        Ok(self.state.lock().await.predictions.get(id).cloned())
    }

    /// All predictions, newest first.
    pub async fn predictions(&self) -> Result<Vec<Prediction>> {
        self.ensure_init()?;
        let mut predictions: Vec<Prediction> =
            self.state.lock().await.predictions.values().cloned().collect();
        predictions.sort_by(|a, b| b.made_at.cmp(&a.made_at).then_with(|| a.id.cmp(&b.id)));
        Ok(predictions)
    }

    pub async fn pending_predictions(&self) -> Result<Vec<Prediction>> {
        Ok(self
            .predictions()
            .await?
            .into_iter()
            .filter(Prediction::is_pending)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write both snapshots if anything changed since the last save.
    pub async fn save(&self) -> Result<()> {
        self.ensure_init()?;
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let (patterns, predictions) = {
            let mut state = self.state.lock().await;
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            let mut patterns: Vec<Pattern> = state.patterns.values().cloned().collect();
            patterns.sort_by(|a, b| a.id.cmp(&b.id));
            let mut predictions: Vec<Prediction> = state.predictions.values().cloned().collect();
            predictions.sort_by(|a, b| a.made_at.cmp(&b.made_at).then_with(|| a.id.cmp(&b.id)));
            (patterns, predictions)
        };

        let result = async {
            write_atomic(&dir.join(PATTERNS_FILE), &serde_json::to_vec_pretty(&patterns)?).await?;
            write_atomic(&dir.join(PREDICTIONS_FILE), &serde_json::to_vec_pretty(&predictions)?)
                .await
        }
        .await;

        if let Err(e) = result {
            self.state.lock().await.dirty = true;
            return Err(e);
        }
        debug!(
            patterns = patterns.len(),
            predictions = predictions.len(),
            "memory snapshots saved"
        );
        Ok(())
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        self.ensure_init()?;
        let state = self.state.lock().await;
        Ok(MemoryStats {
            short_term: state.short_term.len(),
            long_term: state.long_term.len(),
            patterns: state.patterns.len(),
            predictions: state.predictions.len(),
            pending_predictions: state.predictions.values().filter(|p| p.is_pending()).count(),
        })
    }
}

/// Load a JSON list, skipping records that fail to decode.
async fn load_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StrataError::io(path, e)),
    };
    let records: Vec<Value> = serde_json::from_str(&text)
        .map_err(|e| StrataError::Serialization(format!("{}: {e}", path.display())))?;

    let mut out = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        match serde_json::from_value(record) {
            Ok(item) => out.push(item),
            Err(e) => warn!(path = %path.display(), index, error = %e, "skipping undecodable record"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use strata_shared::{
        Condition, ConditionType, Operator, PredictionBasis, PredictionDetail, PredictionOutcome,
        PredictionType,
    };
    use uuid::Uuid;

    use super::*;

    async fn store() -> MemoryStore {
        let store = MemoryStore::in_memory();
        store.init().await.unwrap();
        store
    }

    fn pattern(id: &str, occurrences: u64, confidence: f64) -> Pattern {
        let now = Utc::now();
        Pattern {
            id: id.to_string(),
            name: id.to_string(),
            description: "test".into(),
            conditions: vec![Condition {
                kind: ConditionType::Correlation,
                field: "topics".into(),
                operator: Operator::Contains,
                value: json!("crypto"),
                timeframe: None,
            }],
            occurrences,
            accuracy: 0.7,
            last_seen: now,
            suggested_actions: Vec::new(),
            discovered: now,
            confidence,
            evolving: false,
        }
    }

    fn prediction(offset_hours: i64) -> Prediction {
        Prediction::new(
            PredictionType::Content,
            PredictionDetail {
                outcome: "ai keeps trending".into(),
                probability: 0.6,
                confidence: 60.0,
                timeframe: "24h".into(),
            },
            PredictionBasis::default(),
            Some("ai".into()),
            Utc::now() + ChronoDuration::hours(offset_hours),
        )
    }

    #[tokio::test]
    async fn uninitialized_store_rejects_calls() {
        let store = MemoryStore::in_memory();
        assert!(matches!(
            store.patterns().await.unwrap_err(),
            StrataError::NotInitialized { .. }
        ));
    }

    #[tokio::test]
    async fn short_term_entries_expire_lazily() {
        let store = store().await;
        store
            .remember("fresh", json!(1), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .remember("stale", json!(2), Duration::from_millis(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let fresh = store.recall("fresh").await.unwrap().unwrap();
        assert_eq!(fresh.value, json!(1));
        assert_eq!(fresh.access_count, 1);
        assert!(store.recall("stale").await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().short_term, 1);
    }

    #[tokio::test]
    async fn promote_moves_entry_atomically() {
        let store = store().await;
        store
            .remember("k", json!("v"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.promote("k").await.unwrap());
        let stats = store.stats().await.unwrap();
        assert_eq!((stats.short_term, stats.long_term), (0, 1));
        assert_eq!(store.recall("k").await.unwrap().unwrap().ttl_ms, None);

        assert!(!store.promote("k").await.unwrap());
        assert!(!store.promote("missing").await.unwrap());
    }

    #[tokio::test]
    async fn compact_sweeps_expired_entries() {
        let store = store().await;
        store.remember("a", json!(1), Duration::ZERO).await.unwrap();
        store.remember("b", json!(2), Duration::ZERO).await.unwrap();
        store
            .remember("c", json!(3), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(store.compact().await.unwrap(), 2);
        assert_eq!(store.stats().await.unwrap().short_term, 1);
    }

    #[tokio::test]
    async fn rediscovered_pattern_merges() {
        let store = store().await;
        store.upsert_pattern(pattern("p", 3, 0.4)).await.unwrap();
        let merged = store.upsert_pattern(pattern("p", 4, 0.8)).await.unwrap();

        assert_eq!(merged.occurrences, 7);
        assert!((merged.confidence - 0.6).abs() < 1e-9);
        assert!(merged.evolving);
        assert_eq!(store.patterns().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_predictions_exclude_evaluated() {
        let store = store().await;
        let open = prediction(0);
        let mut done = prediction(-1);
        done.outcome = Some(PredictionOutcome {
            correct: true,
            actual: "ai still trending".into(),
            evaluated_at: Utc::now(),
        });
        store.save_prediction(open.clone()).await.unwrap();
        store.save_prediction(done).await.unwrap();

        let all = store.predictions().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, open.id);
        let pending = store.pending_predictions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, open.id);
    }

    #[tokio::test]
    async fn outcome_is_recorded_once() {
        let store = MemoryStore::in_memory();
        store.init().await.unwrap();
        let p = prediction(-1);
        store.save_prediction(p.clone()).await.unwrap();

        let outcome = |correct| PredictionOutcome {
            correct,
            actual: "checked".into(),
            evaluated_at: Utc::now(),
        };
        assert!(store.record_outcome(&p.id, outcome(true)).await.unwrap());
        assert!(!store.record_outcome(&p.id, outcome(false)).await.unwrap());
        assert!(!store.record_outcome("missing", outcome(true)).await.unwrap());

        let stored = store.get_prediction(&p.id).await.unwrap().unwrap();
        assert!(stored.outcome.unwrap().correct);
        assert!(store.pending_predictions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshots_round_trip_through_disk() {
        let dir = std::env::temp_dir().join(format!("strata-memory-{}", Uuid::now_v7()));
        let store = MemoryStore::new(&dir);
        store.init().await.unwrap();
        store.upsert_pattern(pattern("p", 3, 0.3)).await.unwrap();
        let p = prediction(0);
        store.save_prediction(p.clone()).await.unwrap();
        store
            .remember_long("session", json!({"a": 1}))
            .await
            .unwrap();
        store.save().await.unwrap();

        assert!(dir.join("patterns.json").exists());
        assert!(dir.join("predictions.json").exists());

        let reopened = MemoryStore::new(&dir);
        reopened.init().await.unwrap();
        assert_eq!(reopened.get_pattern("p").await.unwrap().unwrap().occurrences, 3);
        assert_eq!(reopened.get_prediction(&p.id).await.unwrap(), Some(p));
        // Key/value memory is process-local.
        assert!(reopened.recall("session").await.unwrap().is_none());

        std::fs::remove_dir_all(&dir).ok();
    }
}
