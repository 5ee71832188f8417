use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Completed runs kept per participant; the oldest entry is evicted once the
/// bound is reached.
pub const HISTORY_LIMIT: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to encode progress payload: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("progress backend failure: {detail}")]
    Backend { detail: String },
}

/// Key-value persistence boundary for in-flight progress and completed-run
/// history. Payloads are JSON values so backends stay schema-agnostic; the
/// engine owns the shape of what it writes.
pub trait ProgressStore: Send + Sync {
    fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError>;
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;
    fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// One archived completed run. The snapshot is stored as raw JSON so old
/// entries survive report-shape evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub assessment: String,
    pub completed_at: DateTime<Utc>,
    pub snapshot: serde_json::Value,
}

/// Append a completed run to the bounded history list under `key`.
pub fn append_history(
    store: &dyn ProgressStore,
    key: &str,
    entry: HistoryEntry,
) -> Result<(), StoreError> {
    let mut entries = load_history(store, key)?;
    entries.push(entry);
    while entries.len() > HISTORY_LIMIT {
        entries.remove(0);
    }
    store.save(key, &serde_json::to_value(&entries)?)
}

/// Read the history list under `key`; a malformed payload counts as empty
/// rather than poisoning future appends.
pub fn load_history(store: &dyn ProgressStore, key: &str) -> Result<Vec<HistoryEntry>, StoreError> {
    let Some(raw) = store.load(key)? else {
        return Ok(Vec::new());
    };
    match serde_json::from_value(raw) {
        Ok(entries) => Ok(entries),
        Err(error) => {
            tracing::warn!(%key, %error, "discarding unreadable history payload");
            Ok(Vec::new())
        }
    }
}

/// Process-local store used by the service and in tests. Clones share the
/// same underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProgressStore {
    inner: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend {
                detail: "progress store mutex poisoned".to_string(),
            })?
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend {
                detail: "progress store mutex poisoned".to_string(),
            })?
            .get(key)
            .cloned())
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend {
                detail: "progress store mutex poisoned".to_string(),
            })?
            .remove(key);
        Ok(())
    }
}
