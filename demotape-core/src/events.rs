use crate::cache::CacheKey;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::trace;

/// Events emitted when cache contents change.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheEvent {
    /// A new entry was published.
    Created {
        key: CacheKey,
        path: PathBuf,
        size_bytes: u64,
    },
    /// A cached file was deleted (invalidation, failed integrity check, or sweep).
    Deleted { key: Option<CacheKey>, path: PathBuf },
    /// The retention sweeper cleared the purchased area.
    Swept { removed: usize },
}

/// Fan-out channel for cache events.
///
/// Sending never blocks and never fails; events are dropped when nobody listens.
#[derive(Clone, Debug)]
pub struct CacheEvents {
    tx: broadcast::Sender<CacheEvent>,
}

impl Default for CacheEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CacheEvent) {
        trace!("cache event: {:?}", event);
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let events = CacheEvents::new();
        let mut rx = events.subscribe();
        events.emit(CacheEvent::Swept { removed: 3 });
        assert_eq!(rx.recv().await.unwrap(), CacheEvent::Swept { removed: 3 });
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        CacheEvents::new().emit(CacheEvent::Swept { removed: 0 });
    }
}
