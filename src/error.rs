//! Error handling for biliget.
//!
//! One crate-wide [`enum@Error`] covers the whole download pipeline. The
//! variants follow the failure taxonomy of the engine:
//!
//! * Transport and upstream protocol failures, retried locally by the
//!   component that hit them and only surfaced once the retry budget is
//!   exhausted.
//! * Fatal task failures (`MetadataUnavailable`, `LinkUnavailable`,
//!   `SignatureUnavailable`, `NoViableSegments`, `Merge`) that move the
//!   owning task to the `error` status.
//! * Non-fatal conditions (`SegmentTooSmall`, `AuxiliaryFetch`) that are
//!   handled inline and never abort a task by themselves.
//! * `RangeNotSatisfiable`, a client error of the artifact streamer.

use thiserror::Error;

/// Standard result type for biliget operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Network or timeout failure talking to the upstream platform.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The upstream API answered with a non-zero protocol status code.
    #[error("upstream rejected request: code {code}: {message}")]
    UpstreamRejection { code: i64, message: String },

    /// Signing keys could never be obtained from the discovery endpoint.
    #[error("signing keys unavailable: {0}")]
    SignatureUnavailable(String),

    /// Item metadata could not be resolved within the retry budget.
    #[error("metadata unavailable for {0}")]
    MetadataUnavailable(String),

    /// No download link could be resolved for a segment within the retry
    /// budget.
    #[error("no download link for page {page} (segment {segment_id})")]
    LinkUnavailable { page: u32, segment_id: u64 },

    /// A downloaded segment fell below the plausibility size floor.
    #[error("segment of {size} bytes is below the {floor} byte floor")]
    SegmentTooSmall { size: u64, floor: u64 },

    /// Every segment of a task failed the size floor or the download.
    #[error("no viable segments downloaded")]
    NoViableSegments,

    /// Merging the surviving segments failed.
    #[error("merge failed: {0}")]
    Merge(String),

    /// Best-effort cover or transcript fetch failed.
    #[error("auxiliary fetch failed: {0}")]
    AuxiliaryFetch(String),

    /// A byte-range request started at or past the end of the file.
    #[error("range not satisfiable: start {start} >= file size {file_size}")]
    RangeNotSatisfiable { start: u64, file_size: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing JSON error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("parsing URL failed: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    /// Whether this error leaves the task salvageable.
    ///
    /// Non-fatal errors are handled where they occur: a too-small segment is
    /// skipped, a failed cover or transcript leaves its path unset.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::SegmentTooSmall { .. } | Self::AuxiliaryFetch(_) | Self::RangeNotSatisfiable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_and_best_effort_errors_are_not_fatal() {
        assert!(!Error::SegmentTooSmall { size: 1, floor: 2 }.is_fatal());
        assert!(!Error::AuxiliaryFetch("cover".to_owned()).is_fatal());
        assert!(Error::NoViableSegments.is_fatal());
        assert!(Error::MetadataUnavailable("BV1".to_owned()).is_fatal());
    }
}
