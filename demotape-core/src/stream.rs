//! Serving files with HTTP byte-range support.

use crate::content_type::ContentType;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

/// Read size for streamed bodies.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

const CACHE_CONTROL: &str = "no-cache, must-revalidate";

/// A single `bytes=start-end` range. `end` is inclusive; `None` means end of file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Clamp to a file of `size` bytes. `None` if the range lies outside it.
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if size == 0 || self.start >= size {
            return None;
        }
        let last = size - 1;
        let end = self.end.map_or(last, |end| end.min(last));
        Some((self.start, end))
    }
}

/// Parse a `Range: bytes=start-end` or `bytes=start-` header.
///
/// Suffix ranges, multiple ranges and other units are not supported.
pub fn parse_range_header(header: &str) -> Option<ByteRange> {
    let byte_ranges = header.trim().strip_prefix("bytes=")?;
    if byte_ranges.contains(',') {
        return None;
    }
    let (start_str, end_str) = byte_ranges.split_once('-')?;

    let start: u64 = start_str.trim().parse().ok()?;
    let end_str = end_str.trim();
    let end = if end_str.is_empty() {
        None
    } else {
        Some(end_str.parse::<u64>().ok()?)
    };

    if end.is_some_and(|end| start > end) {
        return None;
    }

    Some(ByteRange { start, end })
}

/// Serve `path` honoring an optional `Range` header.
///
/// A missing or unusable range yields the whole file with 200. Errors are
/// returned only when the file cannot be opened, so the caller can decide
/// whether to regenerate it.
pub async fn serve(
    path: &Path,
    range_header: Option<&str>,
    content_type: &ContentType,
    head_only: bool,
) -> Result<Response, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();

    let range = range_header.and_then(|h| {
        let parsed = parse_range_header(h).and_then(|r| r.resolve(size));
        if parsed.is_none() {
            debug!("Ignoring range header {:?} for {} byte file", h, size);
        }
        parsed
    });

    let (status, start, len) = match range {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        None => (StatusCode::OK, 0, size),
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type.as_str())
        .header(header::CONTENT_LENGTH, len.to_string())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, CACHE_CONTROL);

    if let Some((start, end)) = range {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, size),
        );
    }

    let body = if head_only {
        Body::empty()
    } else {
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        let reader = file.take(len);
        Body::from_stream(ReaderStream::with_capacity(reader, STREAM_CHUNK_SIZE))
    };

    Ok(builder.body(body).unwrap_or_else(|e| {
        error!("Failed to build response for {}: {}", path.display(), e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }))
}
