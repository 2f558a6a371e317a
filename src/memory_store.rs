//! Per-conversation structured long-term memory: category files of
//! [`MemoryShard`]s under `<memory-root>/<cid>/<category>.json`.
//!
//! The store exclusively owns its files. Reads and writes go through a
//! per-category in-process cache so that a single turn's repeated
//! `resolve_path` calls don't re-read the same file; `apply_changes`
//! invalidates the cache entries it touches and writes back atomically
//! (write-temp + rename).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};

/// A single atomic record of long-term user knowledge within a category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryShard {
    pub key: String,
    pub category: String,
    pub payload: serde_json::Value,
    pub importance: i64,
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub trigger_count: u64,
    pub created_at: String,
    pub updated_at: String,
    pub last_triggered: String,
}

/// `{action, key, category, ...fields}` as produced by the Memory Shards
/// agent.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeOp {
    pub action: ChangeAction,
    pub key: Option<String>,
    pub category: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub importance: Option<i64>,
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Del,
}

/// Result of [`MemoryStore::apply_changes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug)]
pub enum MemoryStoreError {
    Io(std::io::Error),
    InvalidPath(String),
}

impl fmt::Display for MemoryStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryStoreError::Io(e) => write!(f, "memory store I/O error: {}", e),
            MemoryStoreError::InvalidPath(p) => write!(f, "invalid shard path: {}", p),
        }
    }
}

impl Error for MemoryStoreError {}

impl From<std::io::Error> for MemoryStoreError {
    fn from(e: std::io::Error) -> Self {
        MemoryStoreError::Io(e)
    }
}

/// A category-file backed memory store scoped to one conversation.
pub struct MemoryStore {
    root: PathBuf,
    cache: Arc<RwLock<HashMap<String, Vec<MemoryShard>>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Open the memory subtree for a given conversation under `memory_root`,
    /// timestamping shard changes with the real system clock.
    pub fn new(memory_root: impl Into<PathBuf>, cid: &str) -> Self {
        Self::with_clock(memory_root, cid, Arc::new(SystemClock))
    }

    /// Like [`MemoryStore::new`], but with an injected [`Clock`] — used in
    /// tests that need a fixed `created_at`/`updated_at` to assert against.
    pub fn with_clock(memory_root: impl Into<PathBuf>, cid: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: memory_root.into().join(cid),
            cache: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    fn category_path(&self, category: &str) -> PathBuf {
        self.root.join(format!("{}.json", category))
    }

    /// List category files and their shard counts without materialising
    /// payloads.
    pub async fn scan_outlines(&self) -> Result<HashMap<String, usize>, MemoryStoreError> {
        let mut outlines = HashMap::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(outlines),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let shards = self.load_category(stem).await;
            outlines.insert(stem.to_string(), shards.len());
        }
        Ok(outlines)
    }

    /// Load and parse a single category. Empty, missing, or malformed files
    /// yield an empty list with a logged warning, never an error.
    pub async fn load_category(&self, category: &str) -> Vec<MemoryShard> {
        if let Some(cached) = self.cache.read().await.get(category) {
            return cached.clone();
        }

        let shards = self.load_category_uncached(category).await;
        self.cache
            .write()
            .await
            .insert(category.to_string(), shards.clone());
        shards
    }

    async fn load_category_uncached(&self, category: &str) -> Vec<MemoryShard> {
        let path = self.category_path(category);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                log::warn!("failed to read memory category {}: {}", category, e);
                return Vec::new();
            }
        };
        if content.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Vec<MemoryShard>>(&content) {
            Ok(shards) => shards,
            Err(e) => {
                log::warn!("malformed memory category file {}: {}", category, e);
                Vec::new()
            }
        }
    }

    /// Resolve `<category>.<key>` to a single shard. Any other path arity
    /// is invalid.
    pub async fn resolve_path(
        &self,
        path: &str,
    ) -> Result<Option<MemoryShard>, MemoryStoreError> {
        let parts: Vec<&str> = path.splitn(2, '.').collect();
        if parts.len() != 2 {
            return Err(MemoryStoreError::InvalidPath(path.to_string()));
        }
        let (category, key) = (parts[0], parts[1]);
        let shards = self.load_category(category).await;
        Ok(shards.into_iter().find(|s| s.key == key))
    }

    /// Validate, group by category, and apply a batch of change ops,
    /// writing each touched category back atomically. Ops failing
    /// validation are dropped with a warning and do not block siblings.
    pub async fn apply_changes(
        &self,
        ops: Vec<ChangeOp>,
    ) -> Result<ApplyStats, MemoryStoreError> {
        let mut stats = ApplyStats::default();
        let now = self.clock.now().format("%Y-%m-%dT%H:%M:%S").to_string();

        let mut by_category: HashMap<String, Vec<ChangeOp>> = HashMap::new();
        for op in ops {
            let Some(category) = op.category.clone() else {
                log::warn!("dropping change op with no category: {:?}", op.key);
                continue;
            };
            if !validate(&op) {
                continue;
            }
            by_category.entry(category).or_default().push(op);
        }

        for (category, category_ops) in by_category {
            let existing = self.load_category(&category).await;
            let mut by_key: HashMap<String, MemoryShard> = existing
                .into_iter()
                .map(|s| (s.key.clone(), s))
                .collect();

            for op in category_ops {
                let Some(key) = op.key.clone() else { continue };
                match op.action {
                    ChangeAction::Add => {
                        if let Some(old) = by_key.get(&key) {
                            let created_at = old.created_at.clone();
                            let trigger_count = old.trigger_count + 1;
                            by_key.insert(
                                key.clone(),
                                MemoryShard {
                                    key: key.clone(),
                                    category: category.clone(),
                                    payload: op.payload.unwrap_or(serde_json::Value::Null),
                                    importance: op.importance.unwrap_or(0),
                                    source: op.source.unwrap_or_default(),
                                    tags: op.tags,
                                    trigger_count,
                                    created_at,
                                    updated_at: now.clone(),
                                    last_triggered: now.clone(),
                                },
                            );
                            stats.updated += 1;
                        } else {
                            by_key.insert(
                                key.clone(),
                                MemoryShard {
                                    key: key.clone(),
                                    category: category.clone(),
                                    payload: op.payload.unwrap_or(serde_json::Value::Null),
                                    importance: op.importance.unwrap_or(0),
                                    source: op.source.unwrap_or_default(),
                                    tags: op.tags,
                                    trigger_count: 1,
                                    created_at: now.clone(),
                                    updated_at: now.clone(),
                                    last_triggered: now.clone(),
                                },
                            );
                            stats.added += 1;
                        }
                    }
                    ChangeAction::Del => {
                        if by_key.remove(&key).is_some() {
                            stats.deleted += 1;
                        } else {
                            log::warn!("delete of missing shard {}.{}", category, key);
                        }
                    }
                }
            }

            let shards: Vec<MemoryShard> = by_key.into_values().collect();
            self.save_category(&category, &shards).await?;
            self.cache
                .write()
                .await
                .insert(category.clone(), shards);
        }

        Ok(stats)
    }

    async fn save_category(
        &self,
        category: &str,
        shards: &[MemoryShard],
    ) -> Result<(), MemoryStoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.category_path(category);
        let tmp_path = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(shards)
            .expect("MemoryShard serialization is infallible");
        tokio::fs::write(&tmp_path, body).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

fn validate(op: &ChangeOp) -> bool {
    match op.action {
        ChangeAction::Add => {
            if op.key.is_none() || op.category.is_none() {
                log::warn!("dropping add op missing key/category");
                return false;
            }
            if op.importance.is_none() || op.source.is_none() {
                log::warn!("dropping add op for {:?} missing importance/source", op.key);
                return false;
            }
            true
        }
        ChangeAction::Del => {
            if op.key.is_none() || op.category.is_none() {
                log::warn!("dropping del op missing key/category");
                return false;
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_op(key: &str, category: &str, payload: serde_json::Value) -> ChangeOp {
        ChangeOp {
            action: ChangeAction::Add,
            key: Some(key.to_string()),
            category: Some(category.to_string()),
            payload: Some(payload),
            importance: Some(5),
            source: Some("user".to_string()),
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn add_then_update_preserves_created_at_and_bumps_trigger_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path(), "conv1");

        let stats = store
            .apply_changes(vec![add_op("k1", "prefs", serde_json::json!("dark mode"))])
            .await
            .unwrap();
        assert_eq!(stats.added, 1);

        let shard = store.resolve_path("prefs.k1").await.unwrap().unwrap();
        assert_eq!(shard.trigger_count, 1);
        assert_eq!(shard.created_at, shard.updated_at);

        let stats = store
            .apply_changes(vec![add_op("k1", "prefs", serde_json::json!("light mode"))])
            .await
            .unwrap();
        assert_eq!(stats.updated, 1);

        let shard2 = store.resolve_path("prefs.k1").await.unwrap().unwrap();
        assert_eq!(shard2.trigger_count, 2);
        assert_eq!(shard2.created_at, shard.created_at);
    }

    #[tokio::test]
    async fn delete_missing_key_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path(), "conv1");
        let stats = store
            .apply_changes(vec![ChangeOp {
                action: ChangeAction::Del,
                key: Some("nope".into()),
                category: Some("prefs".into()),
                payload: None,
                importance: None,
                source: None,
                tags: vec![],
            }])
            .await
            .unwrap();
        assert_eq!(stats.deleted, 0);
    }

    #[tokio::test]
    async fn invalid_path_arity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path(), "conv1");
        assert!(store.resolve_path("no_dot_here").await.is_err());
        assert!(store.resolve_path("a.b.c").await.is_err());
    }

    #[tokio::test]
    async fn scan_outlines_reports_counts_without_loading_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path(), "conv1");
        store
            .apply_changes(vec![
                add_op("k1", "prefs", serde_json::json!("a")),
                add_op("k2", "prefs", serde_json::json!("b")),
            ])
            .await
            .unwrap();
        let outlines = store.scan_outlines().await.unwrap();
        assert_eq!(outlines.get("prefs"), Some(&2));
    }

    #[tokio::test]
    async fn with_clock_stamps_shards_with_the_injected_instant() {
        use crate::clock::TestClock;
        use chrono::{TimeZone, Utc};

        let dir = tempfile::tempdir().unwrap();
        let fixed = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let store = MemoryStore::with_clock(dir.path(), "conv1", Arc::new(TestClock(fixed)));

        store
            .apply_changes(vec![add_op("k1", "prefs", serde_json::json!("dark"))])
            .await
            .unwrap();
        let shard = store.resolve_path("prefs.k1").await.unwrap().unwrap();
        assert_eq!(shard.created_at, "2026-01-01T00:00:00");
    }

    #[tokio::test]
    async fn validation_drops_bad_ops_without_blocking_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path(), "conv1");
        let bad = ChangeOp {
            action: ChangeAction::Add,
            key: Some("k1".into()),
            category: Some("prefs".into()),
            payload: Some(serde_json::json!("x")),
            importance: None, // missing required field
            source: None,
            tags: vec![],
        };
        let good = add_op("k2", "prefs", serde_json::json!("y"));
        let stats = store.apply_changes(vec![bad, good]).await.unwrap();
        assert_eq!(stats.added, 1);
        assert!(store.resolve_path("prefs.k1").await.unwrap().is_none());
    }
}
