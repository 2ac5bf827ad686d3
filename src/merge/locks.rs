//! Per-(repo, target-branch) merge gates.
//!
//! An acquirer awaits the gate installed under its key, holds it for the
//! duration of the merge, and the release path deletes the map entry once
//! no waiter holds a reference. Tokio's mutex queues waiters, so a
//! submitted waiter is never starved.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type GateMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Clone, Default)]
pub struct MergeLocks {
    gates: GateMap,
}

impl MergeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(repo: &Path, branch: &str) -> String {
        format!("{}:{branch}", repo.display())
    }

    pub async fn acquire(&self, repo: &Path, branch: &str) -> MergeLockGuard {
        let key = Self::key(repo, branch);
        let gate = {
            let mut map = self.gates.lock().unwrap();
            Arc::clone(map.entry(key.clone()).or_default())
        };
        let permit = Arc::clone(&gate).lock_owned().await;
        MergeLockGuard {
            key,
            gate,
            permit: Some(permit),
            gates: Arc::clone(&self.gates),
        }
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().unwrap().len()
    }
}

pub struct MergeLockGuard {
    key: String,
    gate: Arc<AsyncMutex<()>>,
    permit: Option<OwnedMutexGuard<()>>,
    gates: GateMap,
}

impl Drop for MergeLockGuard {
    fn drop(&mut self) {
        self.permit.take();
        let mut map = self.gates.lock().unwrap();
        // Waiters each hold a clone of the gate; only delete the entry when
        // the map's reference and ours are the last two.
        if Arc::strong_count(&self.gate) == 2 {
            map.remove(&self.key);
        }
    }
}
