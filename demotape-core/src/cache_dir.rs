use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Listing-deny markers written into every cache root.
const MARKER_FILES: &[(&str, &str)] = &[("index.html", ""), (".htaccess", "Deny from all\n")];

/// Which cache area an entry lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheVariant {
    /// Truncated demos served to requesters without entitlement.
    Demo,
    /// Entitlement-linked copies, cleared by the retention sweeper.
    Purchased,
}

impl CacheVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Demo => "demo",
            Self::Purchased => "purchased",
        }
    }
}

/// Typed wrapper for the engine's base directory.
///
/// Centralizes the on-disk layout so callers use methods instead of
/// ad-hoc `path.join("cache")` etc.
#[derive(Clone, Debug)]
pub struct CacheDir {
    path: PathBuf,
}

impl CacheDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join("demotape.yaml")
    }

    pub fn demo_dir(&self) -> PathBuf {
        self.path.join("cache")
    }

    pub fn purchased_dir(&self) -> PathBuf {
        self.path.join("purchased")
    }

    /// Working copies of fetched sources live here until truncated.
    pub fn work_dir(&self) -> PathBuf {
        self.path.join("tmp")
    }

    pub fn variant_dir(&self, variant: CacheVariant) -> PathBuf {
        match variant {
            CacheVariant::Demo => self.demo_dir(),
            CacheVariant::Purchased => self.purchased_dir(),
        }
    }

    /// `{area}/{hash}.{ext}`
    pub fn entry_path(&self, variant: CacheVariant, hash: &str, ext: &str) -> PathBuf {
        self.variant_dir(variant).join(format!("{hash}.{ext}"))
    }

    /// Persisted timestamp of the last retention sweep.
    pub fn last_sweep_path(&self) -> PathBuf {
        self.path.join(".last_sweep")
    }

    /// All directories that must exist before serving.
    pub fn all_dirs(&self) -> Vec<PathBuf> {
        vec![self.demo_dir(), self.purchased_dir(), self.work_dir()]
    }

    /// Create every directory and the protective markers in each cache root.
    pub async fn ensure_layout(&self) -> Result<(), std::io::Error> {
        for dir in self.all_dirs() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        write_markers(&self.demo_dir()).await?;
        write_markers(&self.purchased_dir()).await?;
        Ok(())
    }
}

/// Write the listing-deny markers into `dir` unless already present.
pub async fn write_markers(dir: &Path) -> Result<(), std::io::Error> {
    for (name, contents) in MARKER_FILES {
        let path = dir.join(name);
        if tokio::fs::try_exists(&path).await? {
            continue;
        }
        tokio::fs::write(&path, contents).await?;
        debug!("Wrote marker {}", path.display());
    }
    Ok(())
}

/// Whether a file name is one of the protective markers rather than a cache entry.
pub fn is_marker(name: &str) -> bool {
    MARKER_FILES.iter().any(|(marker, _)| *marker == name)
}

impl Deref for CacheDir {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for CacheDir {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl From<PathBuf> for CacheDir {
    fn from(path: PathBuf) -> Self {
        Self { path }
    }
}
