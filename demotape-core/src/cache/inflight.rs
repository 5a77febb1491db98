//! At most one build per cache key.
//!
//! The first caller for a key becomes the leader and receives the sender of a
//! watch channel; later callers get a receiver and wait for the leader's
//! outcome. The slot is released when the leader publishes its outcome.

use super::{CacheEntry, CacheError, CacheKey};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

pub type BuildOutcome = Result<CacheEntry, CacheError>;

type OutcomeSlot = Option<BuildOutcome>;

/// Role assigned to a caller by `InFlight::join`.
pub enum Slot {
    Leader {
        tx: watch::Sender<OutcomeSlot>,
        rx: watch::Receiver<OutcomeSlot>,
    },
    Follower {
        rx: watch::Receiver<OutcomeSlot>,
    },
}

#[derive(Default)]
pub struct InFlight {
    builds: Mutex<HashMap<CacheKey, watch::Receiver<OutcomeSlot>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the running build for `key`, or register a new one.
    pub fn join(&self, key: &CacheKey) -> Slot {
        let mut builds = self.builds.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rx) = builds.get(key) {
            // A closed channel means the leader died without reporting
            if rx.has_changed().is_ok() {
                debug!("Joining in-flight build for {}", key);
                return Slot::Follower { rx: rx.clone() };
            }
        }

        let (tx, rx) = watch::channel(None);
        builds.insert(key.clone(), rx.clone());
        Slot::Leader { tx, rx }
    }

    /// Release the slot for `key` and wake every waiter with `outcome`.
    pub fn finish(&self, key: &CacheKey, tx: watch::Sender<OutcomeSlot>, outcome: BuildOutcome) {
        self.builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        let _ = tx.send(Some(outcome));
    }

    /// Number of builds currently registered.
    pub fn len(&self) -> usize {
        self.builds.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wait for a build outcome, giving up after `timeout`.
pub async fn wait(mut rx: watch::Receiver<OutcomeSlot>, timeout: Duration) -> BuildOutcome {
    match tokio::time::timeout(timeout, rx.wait_for(|slot| slot.is_some())).await {
        Ok(Ok(slot)) => slot.clone().unwrap_or(Err(CacheError::BuildAborted)),
        Ok(Err(_)) => Err(CacheError::BuildAborted),
        Err(_) => Err(CacheError::BuildTimeout(timeout)),
    }
}
