//! Demo cache: content-addressable store of generated demos.
//!
//! `DemoCache::get_or_create` returns the cached demo for a (source, percent)
//! pair, building it on a miss: fetch the source, truncate it, publish the
//! result under its key. Builds run in a detached task so a client that hangs
//! up does not abort work other requests are waiting on.
mod inflight;
mod key;
mod store;

pub use inflight::{BuildOutcome, InFlight, Slot};
pub use key::{canonicalize, CacheKey};
pub use store::{CacheStore, LocalCacheStore};

use crate::cache_dir::CacheVariant;
use crate::events::{CacheEvent, CacheEvents};
use crate::fetch::SourceFetcher;
use crate::locator::{sniff_file, SourceDescriptor};
use crate::truncate::{TruncateError, Truncator};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_BUILD_WAIT: Duration =
    Duration::from_secs(crate::config::DEFAULT_BUILD_WAIT_TIMEOUT_SECS);

/// Percent every verbatim copy is keyed under.
const FULL: u8 = 100;

#[derive(Debug, Error, Clone)]
pub enum CacheError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("Truncation failed: {0}")]
    Truncation(String),
    #[error("Invalid truncation percent: {0} (must be 0-100)")]
    InvalidPercent(u8),
    #[error("Cached file failed integrity check: {0}")]
    IntegrityCheckFailed(String),
    #[error("Timed out after {0:?} waiting for demo build")]
    BuildTimeout(Duration),
    #[error("Demo build aborted")]
    BuildAborted,
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// A published cache entry. Never mutated after publication.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Content-addressable demo cache with single-flight builds.
#[derive(Clone)]
pub struct DemoCache {
    store: Arc<dyn CacheStore>,
    fetcher: SourceFetcher,
    truncator: Arc<Truncator>,
    inflight: Arc<InFlight>,
    events: CacheEvents,
    direct_mode: bool,
    wait_timeout: Duration,
    shutdown: CancellationToken,
}

impl DemoCache {
    pub fn new(store: Arc<dyn CacheStore>, fetcher: SourceFetcher, events: CacheEvents) -> Self {
        Self {
            store,
            fetcher,
            truncator: Arc::new(Truncator::new()),
            inflight: Arc::new(InFlight::new()),
            events,
            direct_mode: false,
            wait_timeout: DEFAULT_BUILD_WAIT,
            shutdown: CancellationToken::new(),
        }
    }

    /// Serve uploaded demos verbatim instead of truncating.
    pub fn with_direct_mode(mut self, direct_mode: bool) -> Self {
        self.direct_mode = direct_mode;
        self
    }

    /// Upper bound on how long a caller waits for a build.
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn truncator(&self) -> &Arc<Truncator> {
        &self.truncator
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn direct_mode(&self) -> bool {
        self.direct_mode
    }

    /// Cancel every running build. Cancelled builds publish nothing.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The demo of `source` keeping `percent`% of its bytes.
    pub async fn get_or_create(
        &self,
        source: &SourceDescriptor,
        percent: u8,
    ) -> Result<CacheEntry, CacheError> {
        self.get_or_create_variant(source, percent, CacheVariant::Demo)
            .await
    }

    /// A full copy of a remote source in the purchased area.
    pub async fn get_or_create_purchased(
        &self,
        source: &SourceDescriptor,
    ) -> Result<CacheEntry, CacheError> {
        self.get_or_create_variant(source, FULL, CacheVariant::Purchased)
            .await
    }

    pub async fn get_or_create_variant(
        &self,
        source: &SourceDescriptor,
        percent: u8,
        variant: CacheVariant,
    ) -> Result<CacheEntry, CacheError> {
        if percent > 100 {
            return Err(CacheError::InvalidPercent(percent));
        }

        let direct = self.direct_mode && variant == CacheVariant::Demo;
        let percent = if direct { FULL } else { percent };
        let key = self.key_for(source, percent, variant);

        if direct {
            if let Some(path) = source.local_path() {
                // Uploaded demo on disk: nothing to build
                return direct_entry(key, path).await;
            }
        }

        if let Some(entry) = self.check(&key).await? {
            debug!("Cache hit for {}", key);
            return Ok(entry);
        }

        let rx = match self.inflight.join(&key) {
            Slot::Follower { rx } => rx,
            Slot::Leader { tx, rx } => {
                let this = self.clone();
                let source = source.clone();
                let build_key = key.clone();
                tokio::spawn(async move {
                    let outcome = this.build(&build_key, &source, percent).await;
                    if let Err(e) = &outcome {
                        warn!("Build for {} failed: {}", build_key, e);
                    }
                    this.inflight.finish(&build_key, tx, outcome);
                });
                rx
            }
        };

        inflight::wait(rx, self.wait_timeout).await
    }

    pub fn key_for(&self, source: &SourceDescriptor, percent: u8, variant: CacheVariant) -> CacheKey {
        CacheKey::derive(&source.uri, percent, variant, source.content_type.extension())
    }

    /// Remove every entry derived from `source`, in both areas and at every percent.
    pub async fn invalidate_source(&self, source: &SourceDescriptor) -> Result<usize, CacheError> {
        let mut removed = 0;
        for variant in [CacheVariant::Demo, CacheVariant::Purchased] {
            for percent in 0..=FULL {
                let key = self.key_for(source, percent, variant);
                if self.invalidate_key(&key).await? {
                    removed += 1;
                }
            }
        }
        info!("Invalidated {} cache entries for {}", removed, source.uri);
        Ok(removed)
    }

    /// Remove one entry. Returns whether anything was deleted.
    pub async fn invalidate_key(&self, key: &CacheKey) -> Result<bool, CacheError> {
        match self.store.remove(key).await? {
            Some(path) => {
                debug!("Removed cache entry {}", key);
                self.events.emit(CacheEvent::Deleted {
                    key: Some(key.clone()),
                    path,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Look up `key` and verify the stored file. Corrupt entries are deleted and reported as a miss.
    async fn check(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let Some(entry) = self.store.lookup(key).await? else {
            return Ok(None);
        };

        match verify_entry(&entry).await {
            Ok(()) => Ok(Some(entry)),
            Err(CacheError::IntegrityCheckFailed(reason)) => {
                warn!("Discarding cache entry {}: {}", key, reason);
                self.invalidate_key(key).await?;
                Ok(None)
            }
            Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted under us (sweep or invalidation)
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn build(
        &self,
        key: &CacheKey,
        source: &SourceDescriptor,
        percent: u8,
    ) -> Result<CacheEntry, CacheError> {
        // Another leader may have published between our check and join
        if let Some(entry) = self.check(key).await? {
            return Ok(entry);
        }

        info!("Building {} from {} at {}%", key, source.uri, percent);
        let copy = self
            .fetcher
            .fetch(source, &self.shutdown)
            .await
            .map_err(|e| CacheError::SourceUnavailable(e.to_string()))?;

        let staged = self.store.staging_path(key);
        if let Some(parent) = staged.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staged_result = if percent == FULL {
            copy_verbatim(copy.path(), &staged).await
        } else {
            self.truncator
                .truncate(copy.path(), &staged, percent, &self.shutdown)
                .await
                .map(|_| ())
                .map_err(|e| match e {
                    TruncateError::InvalidPercent(p) => CacheError::InvalidPercent(p),
                    other => CacheError::Truncation(other.to_string()),
                })
        };
        drop(copy);

        if let Err(e) = staged_result {
            discard(&staged).await;
            return Err(e);
        }

        let entry = match self.store.publish(key, &staged).await {
            Ok(entry) => entry,
            Err(e) => {
                discard(&staged).await;
                return Err(e);
            }
        };

        self.events.emit(CacheEvent::Created {
            key: key.clone(),
            path: entry.file_path.clone(),
            size_bytes: entry.size_bytes,
        });
        Ok(entry)
    }
}

/// Non-zero size and not a text/error payload.
async fn verify_entry(entry: &CacheEntry) -> Result<(), CacheError> {
    if entry.size_bytes == 0 {
        return Err(CacheError::IntegrityCheckFailed("empty file".into()));
    }
    match sniff_file(&entry.file_path).await? {
        Some(ct) if ct.is_text() => Err(CacheError::IntegrityCheckFailed(format!(
            "content looks like {ct}"
        ))),
        _ => Ok(()),
    }
}

async fn direct_entry(key: CacheKey, path: PathBuf) -> Result<CacheEntry, CacheError> {
    let meta = tokio::fs::metadata(&path).await.map_err(|e| {
        CacheError::SourceUnavailable(format!("{}: {e}", path.display()))
    })?;
    let created_at = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(CacheEntry {
        key,
        file_path: path,
        size_bytes: meta.len(),
        created_at,
    })
}

async fn copy_verbatim(from: &Path, to: &Path) -> Result<(), CacheError> {
    tokio::fs::copy(from, to).await?;
    let file = tokio::fs::OpenOptions::new().write(true).open(to).await?;
    file.sync_all().await?;
    Ok(())
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove staged file {}: {}", path.display(), e),
    }
}
