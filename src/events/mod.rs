//! Coalesced change notifications.
//!
//! State-changing operations publish a lightweight hash of the visible
//! scheduler state; the bus fires only when the hash differs from the last
//! fired one, so bursts of pump activity collapse into a single event.
//! Events carry no payload: subscribers re-read through the cached public
//! snapshot, which owners invalidate whenever `publish` reports a fire.

use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub state_hash: String,
}

pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
    last_hash: Mutex<Option<String>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            last_hash: Mutex::new(None),
        }
    }

    /// Fire iff `state_hash` differs from the last fired hash. Returns
    /// whether an event went out (callers invalidate snapshot caches on
    /// true).
    pub fn publish(&self, state_hash: String) -> bool {
        let mut last = self.last_hash.lock().unwrap();
        if last.as_deref() == Some(state_hash.as_str()) {
            return false;
        }
        *last = Some(state_hash.clone());
        // Receiver count may be zero; that is not an error.
        let _ = self.tx.send(ChangeEvent { state_hash });
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
