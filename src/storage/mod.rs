//! Debounced crash-recovery persistence.
//!
//! One JSON state file per runner under the workspace-scoped
//! `.orchestrator/` directory. Writes are debounced and asynchronous; a
//! write error keeps the snapshot pending so the next debounce cycle
//! retries, and a shutdown hook flushes synchronously. Writes are atomic
//! (temp file + rename) and serialized by an `is_persisting` flag.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Debounce window for the job runner's writes.
pub const JOBS_DEBOUNCE: Duration = Duration::from_millis(100);
/// Debounce window for the plan runner's writes.
pub const PLANS_DEBOUNCE: Duration = Duration::from_millis(1000);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct StateStore<T> {
    inner: Arc<StoreInner<T>>,
}

struct StoreInner<T> {
    path: PathBuf,
    debounce: Duration,
    pending: Mutex<Option<T>>,
    timer_armed: AtomicBool,
    is_persisting: AtomicBool,
}

impl<T> Clone for StateStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> StateStore<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: path.into(),
                debounce,
                pending: Mutex::new(None),
                timer_armed: AtomicBool::new(false),
                is_persisting: AtomicBool::new(false),
            }),
        }
    }

    /// Store under `<workspace>/.orchestrator/<kind>/state.json`.
    pub fn workspace_scoped(workspace: &Path, kind: &str, debounce: Duration) -> Self {
        Self::new(
            workspace.join(".orchestrator").join(kind).join("state.json"),
            debounce,
        )
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Load the persisted state, if any.
    pub fn load(&self) -> Result<Option<T>, StorageError> {
        self.load_migrated(|_| {})
    }

    /// Load with a schema-migration hook applied to the raw JSON before
    /// typed deserialization (forward compatibility shims live in callers).
    pub fn load_migrated(
        &self,
        migrate: impl FnOnce(&mut serde_json::Value),
    ) -> Result<Option<T>, StorageError> {
        if !self.inner.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.inner.path)?;
        let mut value: serde_json::Value = serde_json::from_str(&raw)?;
        migrate(&mut value);
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Record the latest snapshot and arm the debounce timer. Later calls
    /// within the window replace the snapshot; only the newest is written.
    pub fn schedule_save(&self, snapshot: T) {
        *self.inner.pending.lock().unwrap() = Some(snapshot);
        if self.inner.timer_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            inner.timer_armed.store(false, Ordering::SeqCst);
            if let Err(e) = Self::write_pending(&inner).await {
                warn!(
                    "state write to {} failed (will retry on next save): {e}",
                    inner.path.display()
                );
            }
        });
    }

    /// Write any pending snapshot now.
    pub async fn flush(&self) -> Result<(), StorageError> {
        Self::write_pending(&self.inner).await
    }

    /// Synchronous flush for shutdown paths.
    pub fn flush_sync(&self) -> Result<(), StorageError> {
        let Some(snapshot) = self.inner.pending.lock().unwrap().take() else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp = self.inner.path.with_extension("json.tmp");
        std::fs::write(&temp, &json)?;
        std::fs::rename(&temp, &self.inner.path)?;
        debug!("flushed state to {}", self.inner.path.display());
        Ok(())
    }

    async fn write_pending(inner: &Arc<StoreInner<T>>) -> Result<(), StorageError> {
        // A write already in progress keeps the snapshot pending; the next
        // schedule_save arms a fresh timer which retries.
        if inner.is_persisting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = Self::write_locked(inner).await;
        inner.is_persisting.store(false, Ordering::SeqCst);
        result
    }

    async fn write_locked(inner: &Arc<StoreInner<T>>) -> Result<(), StorageError> {
        let Some(snapshot) = inner.pending.lock().unwrap().take() else {
            return Ok(());
        };
        let json = match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                *inner.pending.lock().unwrap() = Some(snapshot);
                return Err(e.into());
            }
        };

        let write = async {
            if let Some(parent) = inner.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let temp = inner.path.with_extension("json.tmp");
            tokio::fs::write(&temp, &json).await?;
            tokio::fs::rename(&temp, &inner.path).await?;
            Ok::<(), std::io::Error>(())
        };

        match write.await {
            Ok(()) => {
                debug!("persisted state to {}", inner.path.display());
                Ok(())
            }
            Err(e) => {
                // Keep the snapshot so a later cycle retries, unless a newer
                // one has already replaced it.
                let mut pending = inner.pending.lock().unwrap();
                if pending.is_none() {
                    *pending = Some(snapshot);
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Demo {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store: StateStore<Demo> =
            StateStore::workspace_scoped(dir.path(), "jobs", Duration::from_millis(1));

        store.schedule_save(Demo {
            name: "a".into(),
            count: 2,
        });
        store.flush().await.unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.name, "a");
        assert_eq!(loaded.count, 2);
        assert!(store.path().ends_with(".orchestrator/jobs/state.json"));
    }

    #[tokio::test]
    async fn debounce_keeps_only_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store: StateStore<Demo> = StateStore::new(
            dir.path().join("state.json"),
            Duration::from_millis(20),
        );

        for count in 0..5 {
            store.schedule_save(Demo {
                name: "x".into(),
                count,
            });
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.count, 4);
    }

    #[tokio::test]
    async fn sync_flush_writes_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store: StateStore<Demo> = StateStore::new(
            dir.path().join("state.json"),
            Duration::from_secs(3600),
        );

        store.schedule_save(Demo {
            name: "shutdown".into(),
            count: 1,
        });
        // Timer is far in the future; the shutdown path must not wait on it.
        store.flush_sync().unwrap();
        assert_eq!(store.load().unwrap().unwrap().name, "shutdown");
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store: StateStore<Demo> =
            StateStore::new(dir.path().join("state.json"), Duration::from_millis(1));
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn migration_hook_rewrites_raw_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"name":"legacy"}"#).unwrap();

        let store: StateStore<Demo> = StateStore::new(&path, Duration::from_millis(1));
        let loaded = store
            .load_migrated(|value| {
                if value.get("count").is_none() {
                    value["count"] = serde_json::json!(0);
                }
            })
            .unwrap()
            .unwrap();
        assert_eq!(loaded, Demo { name: "legacy".into(), count: 0 });
    }
}
