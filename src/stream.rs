//! Range-aware artifact streaming.
//!
//! Serves a finished file honoring a single `bytes=start-end` range
//! request. The routing layer in front of this engine only has to copy the
//! prepared status, headers and body stream into its response type.
//!
//! Semantics:
//! * no range header: status 200, whole file, `Accept-Ranges: bytes`
//! * `bytes=start-` or `bytes=start-end`: status 206 with
//!   `Content-Range: bytes start-end/fileSize`, end clamped to the file
//! * `start >= fileSize`: range not satisfiable (416)
//! * a malformed range header is ignored and the whole file is served
//!
//! Bodies are streamed in fixed 1 MiB chunks.

use std::{io::SeekFrom, path::Path};

use http::{
    header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE},
    HeaderMap, HeaderValue, StatusCode,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, Take},
};
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};

/// Chunk size for streamed bodies.
const CHUNK_SIZE: usize = 1024 * 1024;

/// An inclusive byte window within a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes in the window; inclusive, so never zero.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A prepared streaming response.
pub struct ArtifactStream {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ReaderStream<Take<File>>,
}

/// Parses a `bytes=start-end` header into `(start, Option<end>)`.
///
/// Returns `None` for anything that is not a single well-formed byte
/// range; the caller then serves the whole file.
#[must_use]
pub fn parse_range(header: &str) -> Option<(u64, Option<u64>)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse::<u64>().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().ok()?)
    };
    Some((start, end))
}

/// Resolves a parsed range against the file size.
///
/// A missing end means "to the end of the file"; an oversized end is
/// clamped.
///
/// # Errors
///
/// Returns [`Error::RangeNotSatisfiable`] when `start` is at or past the
/// end of the file.
pub fn resolve_range(start: u64, end: Option<u64>, file_size: u64) -> Result<ByteRange> {
    if start >= file_size {
        return Err(Error::RangeNotSatisfiable { start, file_size });
    }
    let end = end.unwrap_or(file_size - 1).min(file_size - 1);
    Ok(ByteRange { start, end })
}

/// Media type for a served artifact, from its file extension.
#[must_use]
pub fn media_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Opens `path` and prepares a streaming response for it.
///
/// # Errors
///
/// Returns [`Error::RangeNotSatisfiable`] for an unsatisfiable range and
/// I/O errors for a missing or unreadable file.
pub async fn serve(path: &Path, range_header: Option<&str>) -> Result<ArtifactStream> {
    let mut file = File::open(path).await?;
    let file_size = file.metadata().await?.len();

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(media_type(path)));

    let range = range_header.and_then(parse_range);
    if let Some((start, end)) = range {
        let range = resolve_range(start, end, file_size)?;

        headers.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&format!(
                "bytes {}-{}/{file_size}",
                range.start, range.end
            ))
            .expect("header value from digits"),
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(range.len()));

        file.seek(SeekFrom::Start(range.start)).await?;
        let body = ReaderStream::with_capacity(file.take(range.len()), CHUNK_SIZE);

        return Ok(ArtifactStream {
            status: StatusCode::PARTIAL_CONTENT,
            headers,
            body,
        });
    }

    headers.insert(CONTENT_LENGTH, HeaderValue::from(file_size));
    let body = ReaderStream::with_capacity(file.take(file_size), CHUNK_SIZE);

    Ok(ArtifactStream {
        status: StatusCode::OK,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use futures_util::StreamExt;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("biliget-stream-{}-{name}", uuid::Uuid::new_v4()))
    }

    async fn collect(mut stream: ReaderStream<Take<File>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.expect("chunk"));
        }
        out
    }

    #[test]
    fn parses_open_and_closed_ranges() {
        assert_eq!(parse_range("bytes=0-"), Some((0, None)));
        assert_eq!(parse_range("bytes=100-199"), Some((100, Some(199))));
        assert_eq!(parse_range("bytes=-500"), None);
        assert_eq!(parse_range("chunks=0-1"), None);
        assert_eq!(parse_range("bytes=abc-"), None);
    }

    #[test]
    fn resolve_clamps_and_rejects() {
        assert_eq!(
            resolve_range(0, None, 1000).unwrap(),
            ByteRange { start: 0, end: 999 }
        );
        assert_eq!(
            resolve_range(100, Some(5000), 1000).unwrap(),
            ByteRange { start: 100, end: 999 }
        );
        assert!(matches!(
            resolve_range(1000, None, 1000),
            Err(Error::RangeNotSatisfiable { start: 1000, file_size: 1000 })
        ));
    }

    #[test]
    fn media_types_from_extension() {
        assert_eq!(media_type(Path::new("a.mp3")), "audio/mpeg");
        assert_eq!(media_type(Path::new("a.M4A")), "audio/mp4");
        assert_eq!(media_type(Path::new("a.xyz")), "application/octet-stream");
        assert_eq!(media_type(Path::new("noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn open_range_covers_whole_file() {
        let path = scratch("open.bin");
        tokio::fs::write(&path, vec![7u8; 1000]).await.unwrap();

        let response = serve(&path, Some("bytes=0-")).await.expect("serve");
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers.get(CONTENT_RANGE).unwrap(),
            "bytes 0-999/1000"
        );
        assert_eq!(response.headers.get(CONTENT_LENGTH).unwrap(), "1000");
        assert_eq!(response.headers.get(ACCEPT_RANGES).unwrap(), "bytes");
        assert_eq!(collect(response.body).await.len(), 1000);

        let _ = tokio::fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn start_at_file_size_is_unsatisfiable() {
        let path = scratch("416.bin");
        tokio::fs::write(&path, vec![0u8; 1000]).await.unwrap();

        let result = serve(&path, Some("bytes=1000-")).await;
        assert!(matches!(result, Err(Error::RangeNotSatisfiable { .. })));

        let _ = tokio::fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn inner_window_returns_exact_bytes() {
        let path = scratch("window.bin");
        let data: Vec<u8> = (0..=255).cycle().take(1000).map(|b| b as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let response = serve(&path, Some("bytes=200-299")).await.expect("serve");
        assert_eq!(
            response.headers.get(CONTENT_RANGE).unwrap(),
            "bytes 200-299/1000"
        );
        assert_eq!(response.headers.get(CONTENT_LENGTH).unwrap(), "100");
        assert_eq!(collect(response.body).await, &data[200..300]);

        let _ = tokio::fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn no_range_streams_whole_file_with_200() {
        let path = scratch("full.mp3");
        tokio::fs::write(&path, vec![1u8; 321]).await.unwrap();

        let response = serve(&path, None).await.expect("serve");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get(CONTENT_LENGTH).unwrap(), "321");
        assert_eq!(response.headers.get(CONTENT_TYPE).unwrap(), "audio/mpeg");
        assert!(response.headers.get(CONTENT_RANGE).is_none());
        assert_eq!(collect(response.body).await.len(), 321);

        let _ = tokio::fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn malformed_range_falls_back_to_full_file() {
        let path = scratch("fallback.bin");
        tokio::fs::write(&path, vec![2u8; 10]).await.unwrap();

        let response = serve(&path, Some("bytes=oops")).await.expect("serve");
        assert_eq!(response.status, StatusCode::OK);

        let _ = tokio::fs::remove_file(path).await;
    }
}
