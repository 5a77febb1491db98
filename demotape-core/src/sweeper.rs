//! Time-boxed invalidation of the purchased-cache area.
//!
//! Full copies fetched for buyers are only kept for a day. The time of the
//! last sweep is persisted so restarts do not reset the clock.

use crate::cache::CacheKey;
use crate::cache_dir::{is_marker, write_markers, CacheDir, CacheVariant};
use crate::events::{CacheEvent, CacheEvents};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often `spawn_periodic` checks whether a sweep is due.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionInterval {
    #[default]
    Daily,
    Never,
}

impl RetentionInterval {
    pub fn period(&self) -> Option<chrono::Duration> {
        match self {
            Self::Daily => Some(chrono::Duration::hours(24)),
            Self::Never => None,
        }
    }
}

impl std::str::FromStr for RetentionInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown retention interval: {other}")),
        }
    }
}

#[derive(Clone)]
pub struct RetentionSweeper {
    dir: CacheDir,
    events: CacheEvents,
    running: Arc<Mutex<()>>,
}

impl RetentionSweeper {
    pub fn new(dir: CacheDir, events: CacheEvents) -> Self {
        Self {
            dir,
            events,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Sweep the purchased area if `policy` says one is due now.
    ///
    /// Returns the number of entries removed, or `None` when nothing was due.
    pub async fn run_if_due(&self, policy: RetentionInterval) -> Result<Option<usize>, SweepError> {
        self.run_if_due_at(policy, Utc::now()).await
    }

    pub async fn run_if_due_at(
        &self,
        policy: RetentionInterval,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>, SweepError> {
        let Some(period) = policy.period() else {
            return Ok(None);
        };

        let _guard = self.running.lock().await;
        if let Some(last) = self.last_swept().await {
            if now - last < period {
                debug!("Purchased cache swept at {}, not due", last);
                return Ok(None);
            }
        }

        let removed = self.sweep().await?;
        tokio::fs::write(self.dir.last_sweep_path(), now.to_rfc3339()).await?;
        info!("Swept {} purchased entries", removed);
        self.events.emit(CacheEvent::Swept { removed });
        Ok(Some(removed))
    }

    /// When the purchased area was last swept. Missing or unreadable means never.
    pub async fn last_swept(&self) -> Option<DateTime<Utc>> {
        let path = self.dir.last_sweep_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!("Ignoring corrupt sweep timestamp in {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Check `policy` every `check_every` until `shutdown` fires.
    pub fn spawn_periodic(
        self,
        policy: RetentionInterval,
        check_every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_if_due(policy).await {
                            warn!("Retention sweep failed: {}", e);
                        }
                    }
                }
            }
            debug!("Retention sweeper stopped");
        })
    }

    /// Delete the purchased subtree and recreate it with its markers.
    async fn sweep(&self) -> Result<usize, SweepError> {
        let root = self.dir.purchased_dir();
        let doomed = entries_in(&root).await?;

        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&root).await?;
        write_markers(&root).await?;

        for path in &doomed {
            let key = path
                .file_name()
                .and_then(|n| CacheKey::from_file_name(&n.to_string_lossy(), CacheVariant::Purchased));
            self.events.emit(CacheEvent::Deleted {
                key,
                path: path.clone(),
            });
        }
        Ok(doomed.len())
    }
}

async fn entries_in(root: &std::path::Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut read_dir = match tokio::fs::read_dir(root).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut paths = Vec::new();
    while let Some(dirent) = read_dir.next_entry().await? {
        let name = dirent.file_name().to_string_lossy().into_owned();
        if is_marker(&name) || name.starts_with('.') {
            continue;
        }
        paths.push(dirent.path());
    }
    Ok(paths)
}
