//! Merging downloaded segments into one artifact.
//!
//! The merge is a byte-order concatenation of the surviving segments; real
//! transcoding or remuxing is outside this engine. Sub-progress is
//! reported through a callback on a 0-100 scale: loading the segments
//! covers 0 to 30, concatenation lands at 35, writing the result walks
//! from 40 to 100.
//!
//! After the write, the artifact is probed with symphonia to recover its
//! total duration. The probe is best effort; a stream the decoder cannot
//! time leaves the duration unset.

use std::path::{Path, PathBuf};

use symphonia::core::{
    formats::FormatOptions,
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
};
use tokio::{fs, io::AsyncWriteExt};

use crate::error::{Error, Result};

/// Write granularity for the merged artifact.
const WRITE_CHUNK: usize = 4 * 1024 * 1024;

/// Result of a completed merge.
#[derive(Debug)]
pub struct MergeOutcome {
    /// Where the merged artifact was written.
    pub path: PathBuf,

    /// Size of the merged artifact in bytes.
    pub bytes: u64,

    /// Probed duration in seconds, when the artifact could be timed.
    pub duration_seconds: Option<f64>,
}

/// Concatenates `segments` in order into `output`.
///
/// `on_progress` receives `(percent, message)` pairs as the merge
/// advances.
///
/// # Errors
///
/// Returns [`Error::Merge`] when there are no segments, or when any read
/// or write fails.
pub async fn merge_segments<F>(
    segments: &[PathBuf],
    output: &Path,
    mut on_progress: F,
) -> Result<MergeOutcome>
where
    F: FnMut(f64, String),
{
    if segments.is_empty() {
        return Err(Error::Merge("no segments to merge".to_owned()));
    }

    // Load phase: 0 to 30.
    let mut buffers: Vec<Vec<u8>> = Vec::with_capacity(segments.len());
    for (idx, segment) in segments.iter().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let percent = ((idx + 1) as f64 / segments.len() as f64) * 30.0;
        on_progress(
            percent,
            format!("loading segment {}/{}", idx + 1, segments.len()),
        );
        let buffer = fs::read(segment)
            .await
            .map_err(|e| Error::Merge(format!("reading {}: {e}", segment.display())))?;
        buffers.push(buffer);
    }

    let total: u64 = buffers.iter().map(|b| b.len() as u64).sum();
    on_progress(35.0, format!("concatenating {} segments", buffers.len()));

    // Write phase: 40 to 100.
    on_progress(40.0, "writing merged artifact".to_owned());
    let mut file = fs::File::create(output)
        .await
        .map_err(|e| Error::Merge(format!("creating {}: {e}", output.display())))?;
    let mut written: u64 = 0;
    for buffer in &buffers {
        for chunk in buffer.chunks(WRITE_CHUNK) {
            file.write_all(chunk)
                .await
                .map_err(|e| Error::Merge(format!("writing {}: {e}", output.display())))?;
            written += chunk.len() as u64;
            #[allow(clippy::cast_precision_loss)]
            let percent = 40.0 + (written as f64 / total as f64) * 60.0;
            on_progress(percent, "writing merged artifact".to_owned());
        }
    }
    file.flush()
        .await
        .map_err(|e| Error::Merge(format!("flushing {}: {e}", output.display())))?;
    drop(file);

    on_progress(100.0, "merge complete".to_owned());

    let probe_path = output.to_path_buf();
    let duration_seconds = tokio::task::spawn_blocking(move || probe_duration(&probe_path))
        .await
        .unwrap_or_default();
    if let Some(duration) = duration_seconds {
        debug!("merged artifact runs {duration:.1}s");
    }

    Ok(MergeOutcome {
        path: output.to_path_buf(),
        bytes: written,
        duration_seconds,
    })
}

/// Probes an audio file for its total duration.
///
/// Returns `None` when the container cannot be read or carries no frame
/// count.
fn probe_duration(path: &Path) -> Option<f64> {
    let file = std::fs::File::open(path).ok()?;
    let stream = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .ok()?;

    let track = probed.format.default_track()?;
    let time_base = track.codec_params.time_base?;
    let n_frames = track.codec_params.n_frames?;
    let time = time_base.calc_time(n_frames);

    #[allow(clippy::cast_precision_loss)]
    Some(time.seconds as f64 + time.frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("biliget-merge-{}-{name}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn concatenates_in_order() {
        let a = scratch("a.bin");
        let b = scratch("b.bin");
        let out = scratch("out.bin");
        fs::write(&a, b"first-").await.unwrap();
        fs::write(&b, b"second").await.unwrap();

        let outcome = merge_segments(&[a.clone(), b.clone()], &out, |_, _| {})
            .await
            .expect("merge");
        assert_eq!(outcome.bytes, 12);
        assert_eq!(fs::read(&out).await.unwrap(), b"first-second");
        // Raw bytes are not a timeable audio stream.
        assert!(outcome.duration_seconds.is_none());

        for path in [a, b, out] {
            let _ = fs::remove_file(path).await;
        }
    }

    #[tokio::test]
    async fn reports_monotonic_progress_ending_at_100() {
        let a = scratch("p.bin");
        let out = scratch("pout.bin");
        fs::write(&a, vec![0u8; 1024]).await.unwrap();

        let mut percents: Vec<f64> = Vec::new();
        merge_segments(&[a.clone()], &out, |p, _| percents.push(p))
            .await
            .expect("merge");

        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.first().copied(), Some(30.0));
        assert_eq!(percents.last().copied(), Some(100.0));

        let _ = fs::remove_file(a).await;
        let _ = fs::remove_file(out).await;
    }

    #[tokio::test]
    async fn empty_input_is_a_merge_failure() {
        let out = scratch("empty.bin");
        let result = merge_segments(&[], &out, |_, _| {}).await;
        assert!(matches!(result, Err(Error::Merge(_))));
    }

    #[tokio::test]
    async fn missing_segment_is_a_merge_failure() {
        let out = scratch("missing-out.bin");
        let missing = scratch("not-there.bin");
        let result = merge_segments(&[missing], &out, |_, _| {}).await;
        assert!(matches!(result, Err(Error::Merge(_))));
    }
}
