use crate::cache_dir::CacheVariant;
use crate::locator::is_remote_uri;
use sha2::{Digest, Sha256};

/// Content address of a cache entry.
///
/// The hash covers the canonical source URI, the truncation percent, and the
/// variant. `ext` only names the file on disk and is not part of identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    hash: String,
    variant: CacheVariant,
    ext: String,
}

impl CacheKey {
    pub fn derive(uri: &str, percent: u8, variant: CacheVariant, ext: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonicalize(uri).as_bytes());
        hasher.update([0u8]);
        hasher.update([percent]);
        hasher.update([0u8]);
        hasher.update(variant.as_str().as_bytes());
        Self {
            hash: hex::encode(hasher.finalize()),
            variant,
            ext: ext.to_string(),
        }
    }

    /// Rebuild a key from an on-disk `{hash}.{ext}` name.
    pub fn from_file_name(name: &str, variant: CacheVariant) -> Option<Self> {
        let (hash, ext) = name.rsplit_once('.')?;
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            hash: hash.to_string(),
            variant,
            ext: ext.to_string(),
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn variant(&self) -> CacheVariant {
        self.variant
    }

    pub fn ext(&self) -> &str {
        &self.ext
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.hash, self.ext)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.variant.as_str(), self.file_name())
    }
}

/// Stable form of a source URI for hashing.
///
/// Remote URIs get a lowercased scheme and host and lose their fragment;
/// local paths are used verbatim apart from surrounding whitespace.
pub fn canonicalize(uri: &str) -> String {
    let uri = uri.trim();
    if !is_remote_uri(uri) {
        return uri.to_string();
    }

    let without_fragment = uri.split('#').next().unwrap_or(uri);
    let Some((scheme, rest)) = without_fragment.split_once("://") else {
        return without_fragment.to_string();
    };
    let host_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (host, tail) = rest.split_at(host_end);
    format!(
        "{}://{}{}",
        scheme.to_ascii_lowercase(),
        host.to_ascii_lowercase(),
        tail
    )
}
