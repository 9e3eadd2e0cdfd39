//! HTTP client with rate limiting and session cookie management.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting so the engine does not hammer the upstream API
//! * A cookie jar carrying the session cookie for the API origin
//! * Consistent timeouts, referer and user agent headers
//!
//! Segment byte transfers go through [`Client::unlimited`]: they are a
//! handful of long-lived streams, not API calls, and must not burn quota.

use std::{future::Future, num::NonZeroU32, sync::Arc, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    self,
    cookie::Jar,
    header::{HeaderValue, REFERER},
    Method, Url,
};

use crate::{config::Config, error::Result};

/// The cookie origin of the upstream platform.
///
/// What matters is that the domain matches `bilibili.com` so the session
/// cookie is sent to both the API and the web origin.
const COOKIE_ORIGIN: &str = "https://www.bilibili.com";

/// Referer expected by the protected endpoints.
const DEFAULT_REFERER: &str = "https://www.bilibili.com/";

/// HTTP client with built-in rate limiting and session cookie support.
pub struct Client {
    /// Unlimited request client for segment byte transfers.
    ///
    /// Direct access to the underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    /// Rate limiter applied to API calls.
    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Rolling window over which API calls are limited.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum API calls per interval.
    ///
    /// The platform publishes no quota; this stays well under observed
    /// throttling thresholds.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 20;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for individual network reads.
    ///
    /// Bounds stalls on both API calls and segment byte streams without
    /// capping the total duration of a long download.
    const READ_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a new client from the configuration.
    ///
    /// The session cookie, when configured, is seeded into the jar for the
    /// platform's cookie origin.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        let cookie_jar = Jar::default();
        let cookie_origin = Url::parse(COOKIE_ORIGIN)?;
        if let Some(ref sessdata) = config.sessdata {
            let cookie = format!(
                "SESSDATA={sessdata}; Domain=bilibili.com; Path=/; Secure; HttpOnly"
            );
            cookie_jar.add_cookie_str(&cookie, &cookie_origin);
        }

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_static(DEFAULT_REFERER));

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .default_headers(headers)
            .user_agent(&config.user_agent)
            .cookie_provider(Arc::new(cookie_jar));

        // Rate limit own requests as to not DoS the upstream infrastructure.
        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Builds a GET request for the given URL.
    pub fn get<U>(&self, url: U) -> reqwest::Request
    where
        U: Into<Url>,
    {
        reqwest::Request::new(Method::GET, url.into())
    }

    /// Executes a request with rate limiting.
    ///
    /// Applies the API quota before executing the request.
    ///
    /// # Errors
    ///
    /// Returns error if request execution fails or a network error occurs.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        // No need to await with jitter because the level of concurrency is low.
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }
}
