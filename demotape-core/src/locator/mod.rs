//! Asset location: from an opaque asset reference to a fetchable source.
//!
//! The catalog stores whatever URI the merchant entered (local path, plain
//! URL, or a cloud share link). `AssetLocator` turns that into a
//! `SourceDescriptor` the cache and streamer can act on.

pub mod cloud;

use crate::content_type::{ContentType, MediaType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub use cloud::{normalize_cloud_url, CloudProvider, NormalizedUrl};

/// Bytes read from a local file when sniffing its type.
const SNIFF_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("No source registered for asset {0}")]
    NotFound(AssetReference),
    #[error("Invalid asset reference: {0}")]
    InvalidReference(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Catalog error: {0}")]
    Catalog(String),
}

/// Identifies one purchasable track: a product and the track's position in it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetReference {
    pub product_id: u64,
    pub track_index: u32,
}

impl AssetReference {
    pub fn new(product_id: u64, track_index: u32) -> Self {
        Self {
            product_id,
            track_index,
        }
    }
}

impl std::fmt::Display for AssetReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.product_id, self.track_index)
    }
}

/// Parses `"{product_id}:{track_index}"`, or a bare product id meaning track 0.
impl FromStr for AssetReference {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LocatorError::InvalidReference(s.to_string());
        let (product, track) = s.split_once(':').unwrap_or((s, "0"));
        let product_id = product.trim().parse().map_err(|_| invalid())?;
        let track_index = track.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(product_id, track_index))
    }
}

/// A resolved, fetchable source for an asset.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceDescriptor {
    pub uri: String,
    pub is_remote: bool,
    pub provider: CloudProvider,
    pub media_type: MediaType,
    pub content_type: ContentType,
}

impl SourceDescriptor {
    /// Filesystem path for local sources.
    pub fn local_path(&self) -> Option<PathBuf> {
        if self.is_remote {
            None
        } else {
            Some(local_path_of(&self.uri))
        }
    }
}

/// Lookup from asset reference to the stored source URI.
#[async_trait]
pub trait AssetCatalog: Send + Sync {
    /// The URI stored for `reference`, if any.
    async fn source_uri(&self, reference: &AssetReference) -> Result<Option<String>, LocatorError>;
}

/// One catalog row as stored in a catalog YAML file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub product_id: u64,
    #[serde(default)]
    pub track_index: u32,
    pub uri: String,
}

/// Catalog held in memory, optionally loaded from a YAML list of `CatalogEntry`.
#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    entries: Arc<RwLock<HashMap<AssetReference, String>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let map = entries
            .into_iter()
            .map(|e| (AssetReference::new(e.product_id, e.track_index), e.uri))
            .collect();
        Self {
            entries: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn from_yaml_file(path: &Path) -> Result<Self, LocatorError> {
        let contents = tokio::fs::read_to_string(path).await?;
        let entries: Vec<CatalogEntry> = serde_yaml::from_str(&contents)
            .map_err(|e| LocatorError::Catalog(format!("{}: {e}", path.display())))?;
        info!("Loaded {} catalog entries from {}", entries.len(), path.display());
        Ok(Self::from_entries(entries))
    }

    /// Register or replace the URI for an asset. Returns the previous URI.
    pub async fn insert(&self, reference: AssetReference, uri: impl Into<String>) -> Option<String> {
        self.entries.write().await.insert(reference, uri.into())
    }

    pub async fn remove(&self, reference: &AssetReference) -> Option<String> {
        self.entries.write().await.remove(reference)
    }
}

#[async_trait]
impl AssetCatalog for InMemoryCatalog {
    async fn source_uri(&self, reference: &AssetReference) -> Result<Option<String>, LocatorError> {
        Ok(self.entries.read().await.get(reference).cloned())
    }
}

/// Resolves asset references to source descriptors.
#[derive(Clone)]
pub struct AssetLocator {
    catalog: Arc<dyn AssetCatalog>,
    default_extension_fallback: bool,
}

impl AssetLocator {
    pub fn new(catalog: Arc<dyn AssetCatalog>, default_extension_fallback: bool) -> Self {
        Self {
            catalog,
            default_extension_fallback,
        }
    }

    /// Look up the stored URI for `reference`, normalize cloud links, and classify it.
    pub async fn resolve_source(
        &self,
        reference: &AssetReference,
    ) -> Result<SourceDescriptor, LocatorError> {
        let stored = self
            .catalog
            .source_uri(reference)
            .await?
            .ok_or(LocatorError::NotFound(*reference))?;

        let NormalizedUrl { uri, provider } = normalize_cloud_url(&stored);
        let is_remote = is_remote_uri(&uri);
        let content_type = self.classify(&uri, is_remote, provider).await;
        debug!(
            "Resolved {} -> {} (remote={}, provider={}, type={})",
            reference,
            uri,
            is_remote,
            provider.as_str(),
            content_type
        );

        Ok(SourceDescriptor {
            media_type: content_type.media_type(),
            uri,
            is_remote,
            provider,
            content_type,
        })
    }

    /// Media class of a URI: by extension, then sniffing for local files,
    /// then the lenient audio default for remote sources.
    pub async fn classify_media(&self, uri: &str) -> MediaType {
        let NormalizedUrl { uri, provider } = normalize_cloud_url(uri);
        self.classify(&uri, is_remote_uri(&uri), provider)
            .await
            .media_type()
    }

    async fn classify(&self, uri: &str, is_remote: bool, provider: CloudProvider) -> ContentType {
        if let Some(ct) = extension_of(uri)
            .map(|ext| ContentType::from_extension(&ext))
            .filter(|ct| *ct != ContentType::OctetStream)
        {
            return ct;
        }

        if is_remote {
            // Extensionless cloud links default to audio
            if provider != CloudProvider::None || self.default_extension_fallback {
                return ContentType::Mpeg;
            }
            return ContentType::OctetStream;
        }

        match sniff_file(&local_path_of(uri)).await {
            Ok(Some(ct)) => ct,
            Ok(None) => ContentType::OctetStream,
            Err(e) => {
                debug!("Could not sniff {}: {}", uri, e);
                ContentType::OctetStream
            }
        }
    }
}

pub fn is_remote_uri(uri: &str) -> bool {
    let lower = uri.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Filesystem path of a local URI. `file://` URIs are percent-decoded; bare
/// paths are taken verbatim.
pub fn local_path_of(uri: &str) -> PathBuf {
    match uri.strip_prefix("file://") {
        Some(path) => urlencoding::decode(path)
            .map(|p| PathBuf::from(p.into_owned()))
            .unwrap_or_else(|_| PathBuf::from(path)),
        None => PathBuf::from(uri),
    }
}

/// Lowercased extension of the last path segment, ignoring query and fragment.
pub fn extension_of(uri: &str) -> Option<String> {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let last = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > 5
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Sniff the content type of a local file from its first bytes.
pub async fn sniff_file(path: &Path) -> Result<Option<ContentType>, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);
    Ok(ContentType::sniff(&head))
}
