//! Byte-prefix truncation of media files.
//!
//! Keeps the leading `percent` of a file's bytes. This approximates "percent
//! of the track" only for constant-bitrate streams; compressed formats may be
//! cut mid-frame.

use crate::retry::retry_with_backoff;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Copy chunk size.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Total attempts per truncation (one retry).
const MAX_ATTEMPTS: u32 = 2;

const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TruncateError {
    #[error("Invalid truncation percent: {0} (must be 0-100)")]
    InvalidPercent(u8),
    #[error("Truncation cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// `floor(original * percent / 100)`
pub fn truncated_size(original: u64, percent: u8) -> u64 {
    ((original as u128 * percent as u128) / 100) as u64
}

/// Copies a leading fraction of a file into a new file.
///
/// Counts invocations so callers can assert how many demos were actually built.
#[derive(Debug, Default)]
pub struct Truncator {
    invocations: AtomicU64,
}

impl Truncator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `truncate` calls made so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Write the first `percent`% of `source` to `target`.
    ///
    /// The prefix is written to a temp file beside `target` and renamed into
    /// place, so `target` never holds partial content. `source` and `target`
    /// may be the same path. Returns the number of bytes written.
    pub async fn truncate(
        &self,
        source: &Path,
        target: &Path,
        percent: u8,
        cancel: &CancellationToken,
    ) -> Result<u64, TruncateError> {
        if percent > 100 {
            return Err(TruncateError::InvalidPercent(percent));
        }
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let label = format!("truncate {}", source.display());
        let written = retry_with_backoff(
            MAX_ATTEMPTS,
            RETRY_DELAY,
            &label,
            |e: &TruncateError| matches!(e, TruncateError::Io(_)),
            || attempt(source, target, percent, cancel),
        )
        .await?;

        info!(
            "Truncated {} to {}% ({} bytes) -> {}",
            source.display(),
            percent,
            written,
            target.display()
        );
        Ok(written)
    }

    /// Truncate a file in place.
    pub async fn truncate_in_place(
        &self,
        path: &Path,
        percent: u8,
        cancel: &CancellationToken,
    ) -> Result<u64, TruncateError> {
        self.truncate(path, path, percent, cancel).await
    }
}

/// Temp path in the same directory as `target`, so the final rename stays on one filesystem.
pub(crate) fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "entry".to_string());
    let tmp_name = format!(".{}.{}.part", name, uuid::Uuid::new_v4().simple());
    match target.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

async fn attempt(
    source: &Path,
    target: &Path,
    percent: u8,
    cancel: &CancellationToken,
) -> Result<u64, TruncateError> {
    let tmp = temp_path_for(target);
    match copy_prefix(source, &tmp, percent, cancel).await {
        Ok(written) => {
            if let Err(e) = tokio::fs::rename(&tmp, target).await {
                discard(&tmp).await;
                return Err(e.into());
            }
            Ok(written)
        }
        Err(e) => {
            discard(&tmp).await;
            Err(e)
        }
    }
}

async fn copy_prefix(
    source: &Path,
    tmp: &Path,
    percent: u8,
    cancel: &CancellationToken,
) -> Result<u64, TruncateError> {
    let mut input = tokio::fs::File::open(source).await?;
    let original_size = input.metadata().await?.len();
    let new_size = truncated_size(original_size, percent);
    debug!(
        "Copying {} of {} bytes from {}",
        new_size,
        original_size,
        source.display()
    );

    let mut output = tokio::fs::File::create(tmp).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;

    while written < new_size {
        if cancel.is_cancelled() {
            return Err(TruncateError::Cancelled);
        }
        let want = (new_size - written).min(CHUNK_SIZE as u64) as usize;
        let n = input.read(&mut buf[..want]).await?;
        if n == 0 {
            // Source shrank underneath us
            return Err(TruncateError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended after {written} of {new_size} bytes"),
            )));
        }
        output.write_all(&buf[..n]).await?;
        written += n as u64;
    }

    output.flush().await?;
    output.sync_all().await?;
    Ok(written)
}

async fn discard(tmp: &Path) {
    match tokio::fs::remove_file(tmp).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove temp file {}: {}", tmp.display(), e),
    }
}
