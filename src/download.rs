//! Segment and cover downloads.
//!
//! One segment is streamed chunk by chunk to a local file, with a byte
//! count callback per chunk so the orchestrator can forward progress into
//! the task registry. Implausibly small payloads are rejected: a truncated
//! or placeholder response must not end up in the merged artifact.

use std::path::Path;

use futures_util::StreamExt;
use tokio::{fs::File, io::AsyncWriteExt};

use crate::error::{Error, Result};

/// Smallest plausible segment payload.
///
/// Anything under 500 KiB is considered a truncated or placeholder
/// response and is skipped rather than merged.
pub const SIZE_FLOOR: u64 = 500 * 1024;

/// Streams one segment to `path`, reporting `(downloaded, total)` after
/// every chunk.
///
/// `total` is the advertised content length, `0` when the upstream does
/// not report one. Returns the number of bytes written.
///
/// # Errors
///
/// Returns [`Error::SegmentTooSmall`] when the advertised or actual size
/// falls below [`SIZE_FLOOR`]; the caller skips the segment. Transport and
/// I/O failures propagate as their own variants. On every failure path the
/// partial file is removed again, best effort.
pub async fn segment<F>(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    mut on_progress: F,
) -> Result<u64>
where
    F: FnMut(u64, u64),
{
    let response = client.get(url).send().await?.error_for_status()?;
    let total = response.content_length().unwrap_or(0);

    if total > 0 && total < SIZE_FLOOR {
        return Err(Error::SegmentTooSmall {
            size: total,
            floor: SIZE_FLOOR,
        });
    }

    match stream_to_file(response, path, &mut on_progress).await {
        Ok(downloaded) if downloaded >= SIZE_FLOOR => {
            debug!("downloaded {downloaded} bytes to {}", path.display());
            Ok(downloaded)
        }
        Ok(downloaded) => {
            // A rejected or interrupted payload must not linger in the temp
            // directory; removal is best effort.
            let _ = tokio::fs::remove_file(path).await;
            Err(Error::SegmentTooSmall {
                size: downloaded,
                floor: SIZE_FLOOR,
            })
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(path).await;
            Err(e)
        }
    }
}

async fn stream_to_file<F>(
    response: reqwest::Response,
    path: &Path,
    on_progress: &mut F,
) -> Result<u64>
where
    F: FnMut(u64, u64),
{
    let total = response.content_length().unwrap_or(0);
    let mut file = File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        on_progress(downloaded, total);
    }
    file.flush().await?;

    Ok(downloaded)
}

/// Downloads a cover image to `path`.
///
/// Best effort: the caller logs a failure and leaves the cover unset.
///
/// # Errors
///
/// Returns [`Error::AuxiliaryFetch`] on any transport or I/O failure.
pub async fn cover(client: &reqwest::Client, url: &str, path: &Path) -> Result<()> {
    let fetch = async {
        let response = client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        tokio::fs::write(path, &bytes).await?;
        Ok::<(), Error>(())
    };

    fetch
        .await
        .map_err(|e| Error::AuxiliaryFetch(format!("cover from {url}: {e}")))
}
