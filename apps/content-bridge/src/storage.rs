use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Keys left behind by a previous page that must not leak into this one.
pub const STALE_STATE_KEYS: &[&str] = &[
    "pendingPushState",
    "lastUploadStatus",
    "changedFilesSnapshot",
];

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("store error: {0}")]
    Store(String),
}

/// Extension key/value storage.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns only the keys that are present.
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>, StorageError>;

    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError>;
}

/// In-memory adapter for tests and the simulator.
#[derive(Default)]
pub struct InMemoryStorage {
    values: Mutex<HashMap<String, Value>>,
    failing: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.values.lock().await.insert(key.into(), value);
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.values.lock().await.contains_key(key)
    }

    /// Makes every call fail until switched off again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Store("storage unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>, StorageError> {
        self.check()?;
        let guard = self.values.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| guard.get(*key).map(|value| (key.to_string(), value.clone())))
            .collect())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        self.check()?;
        let mut guard = self.values.lock().await;
        for key in keys {
            guard.remove(*key);
        }
        Ok(())
    }
}

/// Removes leftover cross-navigation state. Failures are logged and
/// reported as zero keys removed.
pub async fn discard_stale_state(storage: &dyn Storage) -> usize {
    let present = match storage.get(STALE_STATE_KEYS).await {
        Ok(present) => present,
        Err(err) => {
            warn!(target: "bridge.host", error = %err, "failed to read stale state");
            return 0;
        }
    };
    if present.is_empty() {
        return 0;
    }
    let keys: Vec<&str> = present.keys().map(String::as_str).collect();
    match storage.remove(&keys).await {
        Ok(()) => {
            debug!(target: "bridge.host", removed = keys.len(), "discarded stale state");
            keys.len()
        }
        Err(err) => {
            warn!(target: "bridge.host", error = %err, "failed to discard stale state");
            0
        }
    }
}
