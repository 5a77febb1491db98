//! Fetching a source into a local working copy.
//!
//! Local sources are used in place. Remote sources are downloaded into the
//! work directory with a bounded timeout; the download is removed when the
//! working copy is dropped.

use crate::content_type::ContentType;
use crate::locator::SourceDescriptor;
use crate::truncate::temp_path_for;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Download timed out after {0:?}")]
    Timeout(Duration),
    #[error("Source returned HTTP {0}")]
    Status(u16),
    #[error("Source returned {0} instead of media")]
    UnexpectedContent(String),
    #[error("Local source missing: {0}")]
    Missing(PathBuf),
    #[error("Fetch cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A local file holding the full source bytes.
#[derive(Debug)]
pub struct WorkingCopy {
    path: PathBuf,
    /// Downloaded copies belong to us and are deleted on drop.
    owned: bool,
}

impl WorkingCopy {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_download(&self) -> bool {
        self.owned
    }
}

impl Drop for WorkingCopy {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed working copy {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove working copy {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Produces working copies of sources.
#[derive(Clone, Debug)]
pub struct SourceFetcher {
    client: reqwest::Client,
    work_dir: PathBuf,
    timeout: Duration,
}

impl SourceFetcher {
    pub fn new(work_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            work_dir: work_dir.into(),
            timeout,
        })
    }

    /// Make the full bytes of `source` available on local disk.
    pub async fn fetch(
        &self,
        source: &SourceDescriptor,
        cancel: &CancellationToken,
    ) -> Result<WorkingCopy, FetchError> {
        match source.local_path() {
            Some(path) => {
                if !tokio::fs::try_exists(&path).await? {
                    return Err(FetchError::Missing(path));
                }
                Ok(WorkingCopy { path, owned: false })
            }
            None => self.download(&source.uri, cancel).await,
        }
    }

    async fn download(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkingCopy, FetchError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let copy = WorkingCopy {
            path: temp_path_for(&self.work_dir.join("download")),
            owned: true,
        };

        debug!("Downloading {} -> {}", uri, copy.path.display());
        let written = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = self.stream_to(uri, &copy.path) => result.map_err(|e| match e {
                FetchError::Http(e) if e.is_timeout() => FetchError::Timeout(self.timeout),
                other => other,
            })?,
        };

        info!("Downloaded {} bytes from {}", written, uri);
        Ok(copy)
    }

    async fn stream_to(&self, uri: &str, dest: &Path) -> Result<u64, FetchError> {
        let response = self.client.get(uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        // Share links that need a login or a virus-scan confirmation answer with HTML
        if let Some(ct) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if ContentType::from_mime(ct).is_text() {
                return Err(FetchError::UnexpectedContent(ct.to_string()));
            }
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}
