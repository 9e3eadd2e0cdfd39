//! Client for the signed upstream API.
//!
//! Owns the HTTP client and the signing key cache. Keys are fetched once
//! from the discovery endpoint and reused process-wide; there is no
//! TTL-based expiry. A signature-rejection response from a protected
//! endpoint forces a refresh and a re-sign before the next attempt.
//!
//! Retry policy follows the upstream contract: metadata is retried up to 5
//! times with a fixed 5 second delay, link resolution up to 5 times per
//! segment with a fixed 3 second delay. Retryable failures never surface
//! past this module until the budget is exhausted.

use std::{collections::BTreeMap, future::Future, path::Path, time::Duration};

use reqwest::header::{HeaderValue, REFERER};
use tokio::sync::Mutex;
use url::Url;

use crate::{
    config::Config,
    download,
    error::{Error, Result},
    http::Client as HttpClient,
    protocol::{Conclusion, Nav, PlayUrl, Response, View},
    transcript,
    util::now_from_epoch,
    wbi::{self, SigningKeys},
};

pub struct Gateway {
    http_client: HttpClient,
    keys: Mutex<Option<SigningKeys>>,
}

impl Gateway {
    /// Key discovery endpoint.
    const NAV_URL: &'static str = "https://api.bilibili.com/x/web-interface/nav";

    /// Item metadata endpoint (unsigned).
    const VIEW_URL: &'static str = "https://api.bilibili.com/x/web-interface/view";

    /// Signed link-resolution endpoint.
    const PLAYURL_URL: &'static str = "https://api.bilibili.com/x/player/wbi/playurl";

    /// Signed AI summary endpoint.
    const CONCLUSION_URL: &'static str =
        "https://api.bilibili.com/x/web-interface/view/conclusion/get";

    /// Protocol code signalling that the request signature was rejected.
    const SIGNATURE_REJECTED: i64 = -403;

    /// Metadata retry budget and pacing.
    const METADATA_ATTEMPTS: u32 = 5;
    const METADATA_RETRY_DELAY: Duration = Duration::from_secs(5);

    /// Link-resolution retry budget and pacing, per segment.
    const LINK_ATTEMPTS: u32 = 5;
    const LINK_RETRY_DELAY: Duration = Duration::from_secs(3);

    /// Creates a new gateway client.
    ///
    /// Keys are not fetched here; the first signed call pulls them in.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http_client: HttpClient::new(config)?,
            keys: Mutex::new(None),
        })
    }

    /// The raw HTTP client for segment byte transfers.
    #[must_use]
    pub fn byte_client(&self) -> &reqwest::Client {
        &self.http_client.unlimited
    }

    /// Returns the cached signing keys, fetching them on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureUnavailable`] when discovery fails; the
    /// cache stays empty and the next signed call triggers another fetch.
    pub async fn ensure_keys(&self) -> Result<SigningKeys> {
        let mut cache = self.keys.lock().await;
        if let Some(keys) = cache.as_ref() {
            return Ok(keys.clone());
        }

        let keys = self.fetch_keys().await?;
        debug!(
            "signing keys obtained: img_key={}..., sub_key={}...",
            &keys.img_key[..keys.img_key.len().min(8)],
            &keys.sub_key[..keys.sub_key.len().min(8)]
        );
        *cache = Some(keys.clone());
        Ok(keys)
    }

    /// Drops the cached keys and fetches fresh ones.
    ///
    /// Called after a signature rejection; the stale keys must not be
    /// reused for the re-signed attempt.
    pub async fn force_refresh_keys(&self) -> Result<SigningKeys> {
        let mut cache = self.keys.lock().await;
        *cache = None;
        let keys = self.fetch_keys().await?;
        *cache = Some(keys.clone());
        Ok(keys)
    }

    async fn fetch_keys(&self) -> Result<SigningKeys> {
        let fetch = async {
            let url = Url::parse(Self::NAV_URL)?;
            let request = self.http_client.get(url);
            let response = self.http_client.execute(request).await?;
            // The navigation call reports a non-zero code for anonymous
            // sessions while still carrying the key material, so the
            // envelope code is ignored here.
            let nav = response.json::<Response<Nav>>().await?;
            Ok::<Option<Nav>, Error>(nav.data)
        };

        match fetch.await {
            Ok(Some(nav)) => nav
                .wbi_img
                .keys()
                .ok_or_else(|| Error::SignatureUnavailable("malformed key URLs".to_owned())),
            Ok(None) => Err(Error::SignatureUnavailable(
                "discovery response without key data".to_owned(),
            )),
            Err(e) => {
                error!("signing key discovery failed: {e}");
                Err(Error::SignatureUnavailable(e.to_string()))
            }
        }
    }

    /// Signs `params` with the cached keys and the current wall clock.
    async fn signed_params(&self, params: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        let keys = self.ensure_keys().await?;
        Ok(wbi::sign(params, &keys, now_from_epoch()))
    }

    /// Resolves an item id to its metadata and ordered segment list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MetadataUnavailable`] after the retry budget is
    /// exhausted.
    pub async fn media_info(&self, source_id: &str) -> Result<View> {
        let fetch = move || async move {
            let url = Url::parse_with_params(Self::VIEW_URL, [("bvid", source_id)])?;
            let request = self.http_client.get(url);
            let response = self.http_client.execute(request).await?;
            let envelope = response.json::<Response<View>>().await?;
            envelope.into_data()
        };

        retry(
            Self::METADATA_ATTEMPTS,
            Self::METADATA_RETRY_DELAY,
            "metadata fetch",
            fetch,
            || async {},
        )
        .await
        .map_err(|e| {
            error!("metadata for {source_id} unavailable: {e}");
            Error::MetadataUnavailable(source_id.to_owned())
        })
    }

    /// Resolves the direct audio download URL for one segment.
    ///
    /// Picks the DASH audio variant with the highest reported bandwidth.
    /// A signature rejection forces a key refresh and a re-sign within the
    /// same retry loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LinkUnavailable`] after the retry budget is
    /// exhausted or when the stream listing carries no audio at all.
    pub async fn audio_link(&self, source_id: &str, page: u32, segment_id: u64) -> Result<String> {
        let params: BTreeMap<String, String> = [
            ("bvid", source_id.to_owned()),
            ("cid", segment_id.to_string()),
            // 1080 quality hint; DASH with separated audio; 4K allowed.
            ("qn", "80".to_owned()),
            ("fnval", "16".to_owned()),
            ("fnver", "0".to_owned()),
            ("fourk", "1".to_owned()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();

        let params = &params;
        let resolve = move || async move {
            let signed = self.signed_params(params).await?;
            let url = Url::parse_with_params(Self::PLAYURL_URL, signed.iter())?;
            let mut request = self.http_client.get(url);
            request.headers_mut().insert(
                REFERER,
                HeaderValue::from_str(&format!("https://www.bilibili.com/video/{source_id}"))
                    .unwrap_or(HeaderValue::from_static("https://www.bilibili.com/")),
            );
            let response = self.http_client.execute(request).await?;
            let envelope = response.json::<Response<PlayUrl>>().await?;
            envelope.into_data()
        };
        let refresh = move || async move {
            if let Err(e) = self.force_refresh_keys().await {
                warn!("key refresh failed: {e}");
            }
        };

        let result = retry(
            Self::LINK_ATTEMPTS,
            Self::LINK_RETRY_DELAY,
            "link resolution",
            resolve,
            refresh,
        )
        .await;

        match result {
            Ok(playurl) => match playurl.best_audio() {
                Some(variant) => {
                    debug!(
                        "resolved page {page} (segment {segment_id}) to a {} bps variant",
                        variant.bandwidth
                    );
                    Ok(variant.base_url.clone())
                }
                None => {
                    error!("stream listing for page {page} carries no audio variants");
                    Err(Error::LinkUnavailable { page, segment_id })
                }
            },
            Err(e) => {
                error!("link resolution for page {page} exhausted its budget: {e}");
                Err(Error::LinkUnavailable { page, segment_id })
            }
        }
    }

    /// Fetches and renders the AI transcript for one segment.
    ///
    /// Returns `Ok(None)` when the item has no generated summary; that is
    /// absence, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuxiliaryFetch`] on transport or parse failure;
    /// the caller treats the transcript as best effort.
    pub async fn transcript(&self, source_id: &str, segment_id: u64) -> Result<Option<String>> {
        let params: BTreeMap<String, String> = [
            ("bvid".to_owned(), source_id.to_owned()),
            ("cid".to_owned(), segment_id.to_string()),
            ("up_mid".to_owned(), String::new()),
        ]
        .into_iter()
        .collect();

        let result = async {
            let signed = self.signed_params(&params).await?;
            let url = Url::parse_with_params(Self::CONCLUSION_URL, signed.iter())?;
            let mut request = self.http_client.get(url);
            request.headers_mut().insert(
                REFERER,
                HeaderValue::from_str(&format!("https://www.bilibili.com/video/{source_id}"))
                    .unwrap_or(HeaderValue::from_static("https://www.bilibili.com/")),
            );
            let response = self.http_client.execute(request).await?;
            let envelope = response.json::<Response<Conclusion>>().await?;
            Ok::<Response<Conclusion>, Error>(envelope)
        }
        .await
        .map_err(|e| Error::AuxiliaryFetch(format!("transcript for {source_id}: {e}")))?;

        if result.code != 0 {
            info!(
                "no transcript for {source_id} (segment {segment_id}): code {}: {}",
                result.code, result.message
            );
            return Ok(None);
        }

        let rendered = result
            .data
            .and_then(|conclusion| conclusion.model_result)
            .as_ref()
            .and_then(transcript::render);
        Ok(rendered)
    }

    /// Streams one segment to disk. See [`download::segment`].
    ///
    /// # Errors
    ///
    /// Propagates the downloader's errors, including the size-floor skip.
    pub async fn download_segment(
        &self,
        url: &str,
        path: &Path,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<u64> {
        download::segment(self.byte_client(), url, path, on_progress).await
    }

    /// Downloads a cover image. See [`download::cover`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuxiliaryFetch`] on failure.
    pub async fn download_cover(&self, url: &str, path: &Path) -> Result<()> {
        download::cover(self.byte_client(), url, path).await
    }
}

/// Runs `op` up to `attempts` times with a fixed delay between attempts.
///
/// When an attempt fails with the signature-rejection code, `on_rejected`
/// runs before the delay so the next attempt re-signs with fresh key
/// material. The rejection still consumes an attempt from the same budget.
/// The final attempt's error is returned as is.
async fn retry<T, F, Fut, R, RFut>(
    attempts: u32,
    delay: Duration,
    what: &str,
    mut op: F,
    mut on_rejected: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut() -> RFut,
    RFut: Future<Output = ()>,
{
    for attempt in 1..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{what} failed (attempt {attempt}/{attempts}): {e}");
                if matches!(e, Error::UpstreamRejection { code, .. } if code == Gateway::SIGNATURE_REJECTED)
                {
                    on_rejected().await;
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
    op().await
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;

    fn rejection(code: i64) -> Error {
        Error::UpstreamRejection {
            code,
            message: "rejected".to_owned(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_budget() {
        let calls = Cell::new(0u32);
        let calls = &calls;
        let result = retry(
            5,
            Duration::from_secs(3),
            "op",
            move || {
                let attempt = calls.get() + 1;
                calls.set(attempt);
                async move {
                    if attempt < 3 {
                        Err(rejection(-500))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            || async {},
        )
        .await;

        assert_eq!(result.expect("value"), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_returns_the_last_error() {
        let calls = Cell::new(0u32);
        let calls = &calls;
        let result: Result<()> = retry(
            5,
            Duration::from_secs(3),
            "op",
            move || {
                calls.set(calls.get() + 1);
                async { Err(rejection(-500)) }
            },
            || async {},
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::UpstreamRejection { code: -500, .. })
        ));
        assert_eq!(calls.get(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn signature_rejection_refreshes_before_the_next_attempt() {
        let calls = Cell::new(0u32);
        let refreshes = Cell::new(0u32);
        let (calls, refreshes) = (&calls, &refreshes);
        let result = retry(
            5,
            Duration::from_secs(3),
            "op",
            move || {
                let attempt = calls.get() + 1;
                calls.set(attempt);
                let refreshed = refreshes.get();
                async move {
                    if attempt == 1 {
                        Err(rejection(Gateway::SIGNATURE_REJECTED))
                    } else {
                        Ok(refreshed)
                    }
                }
            },
            move || async move {
                refreshes.set(refreshes.get() + 1);
            },
        )
        .await;

        // The second attempt already observes one completed refresh.
        assert_eq!(result.expect("value"), 1);
        assert_eq!(calls.get(), 2);
        assert_eq!(refreshes.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn plain_failures_do_not_refresh() {
        let refreshes = Cell::new(0u32);
        let refreshes = &refreshes;
        let result: Result<()> = retry(
            2,
            Duration::from_secs(1),
            "op",
            || async { Err(rejection(-500)) },
            move || async move {
                refreshes.set(refreshes.get() + 1);
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(refreshes.get(), 0);
    }
}
