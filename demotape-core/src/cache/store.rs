//! Backing stores for cache entries.

use super::{CacheEntry, CacheError, CacheKey};
use crate::cache_dir::{is_marker, CacheDir, CacheVariant};
use crate::truncate::temp_path_for;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Content-addressable store of published cache entries.
///
/// Entries become visible only through `publish`, which must be atomic: a
/// concurrent `lookup` sees either nothing or the complete file.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// The entry stored under `key`, if present.
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Local path where a build should write its output before publishing.
    fn staging_path(&self, key: &CacheKey) -> PathBuf;

    /// Make a fully written staged file visible under `key`.
    async fn publish(&self, key: &CacheKey, staged: &Path) -> Result<CacheEntry, CacheError>;

    /// Delete the entry under `key`. Returns the removed path, or `None` if nothing was stored.
    async fn remove(&self, key: &CacheKey) -> Result<Option<PathBuf>, CacheError>;

    /// All entries in one cache area.
    async fn list(&self, variant: CacheVariant) -> Result<Vec<CacheEntry>, CacheError>;
}

/// Filesystem store: `{base}/{cache|purchased}/{hash}.{ext}`.
#[derive(Clone, Debug)]
pub struct LocalCacheStore {
    dir: CacheDir,
}

impl LocalCacheStore {
    pub fn new(dir: CacheDir) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &CacheDir {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.entry_path(key.variant(), key.hash(), key.ext())
    }
}

async fn entry_at(key: CacheKey, path: PathBuf) -> Result<Option<CacheEntry>, CacheError> {
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {
            let created_at = meta
                .created()
                .or_else(|_| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Ok(Some(CacheEntry {
                key,
                file_path: path,
                size_bytes: meta.len(),
                created_at,
            }))
        }
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CacheStore for LocalCacheStore {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        entry_at(key.clone(), self.path_for(key)).await
    }

    /// Staged builds live in `tmp/`, outside any area the sweeper removes.
    fn staging_path(&self, key: &CacheKey) -> PathBuf {
        let name = format!("{}.{}", key.hash(), key.ext());
        temp_path_for(&self.dir.work_dir().join(name))
    }

    async fn publish(&self, key: &CacheKey, staged: &Path) -> Result<CacheEntry, CacheError> {
        let path = self.path_for(key);
        let area = self.dir.variant_dir(key.variant());
        tokio::fs::create_dir_all(&area).await?;
        if let Err(e) = tokio::fs::rename(staged, &path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
            // Area swept between create_dir_all and rename
            debug!("{} disappeared during publish, recreating", area.display());
            tokio::fs::create_dir_all(&area).await?;
            tokio::fs::rename(staged, &path).await?;
        }
        debug!("Published {}", path.display());

        entry_at(key.clone(), path.clone())
            .await?
            .ok_or_else(|| {
                CacheError::Io(std::sync::Arc::new(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("entry vanished right after publish: {}", path.display()),
                )))
            })
    }

    async fn remove(&self, key: &CacheKey) -> Result<Option<PathBuf>, CacheError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(Some(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, variant: CacheVariant) -> Result<Vec<CacheEntry>, CacheError> {
        let root = self.dir.variant_dir(variant);
        let mut read_dir = match tokio::fs::read_dir(&root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(dirent) = read_dir.next_entry().await? {
            let name = dirent.file_name().to_string_lossy().into_owned();
            if is_marker(&name) || name.starts_with('.') {
                continue;
            }
            let Some(key) = CacheKey::from_file_name(&name, variant) else {
                continue;
            };
            // Tolerate entries deleted while listing
            if let Some(entry) = entry_at(key, dirent.path()).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
