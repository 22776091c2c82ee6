//! Durable upsert storage + rate-limited HTTP fetch utilities for the Pollen sync.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

mod db;

pub use db::{MemoryStore, PgStore, Store, StoreError, StoredRow};

pub const CRATE_NAME: &str = "pollen-storage";

/// Fixed-wait retry: `max_attempts` tries with `wait` slept between consecutive tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait: Duration::from_secs(3 * 60),
        }
    }
}

impl RetryPolicy {
    /// A single attempt; failures surface immediately.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            wait: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

impl RateLimit {
    pub fn one_per(interval: Duration) -> Self {
        Self { burst: 1, interval }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            headers: Vec::new(),
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Token bucket that hands out `burst` slots and refills one slot per `interval`.
#[derive(Debug)]
pub struct RateLimiter {
    burst: u32,
    interval: Duration,
    state: Mutex<RateLimiterState>,
}

#[derive(Debug, Clone, Copy)]
struct RateLimiterState {
    tokens: u32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let burst = limit.burst.max(1);
        Self {
            burst,
            interval: limit.interval,
            state: Mutex::new(RateLimiterState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a slot is available and consumes it.
    pub async fn take(&self) {
        if self.interval.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_refill);
            let refills = elapsed.as_nanos() / self.interval.as_nanos();
            if refills > 0 {
                let refilled = u128::from(state.tokens) + refills;
                if refilled >= u128::from(self.burst) {
                    state.tokens = self.burst;
                    state.last_refill = now;
                } else {
                    // refills < burst here, so the cast cannot truncate
                    state.tokens = refilled as u32;
                    state.last_refill += self.interval * refills as u32;
                }
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self
                .interval
                .saturating_sub(now.saturating_duration_since(state.last_refill));
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },
}

/// One GET round trip returning the raw body of a successful response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::InvalidHeader { name: name.clone() })?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| FetchError::InvalidHeader { name: name.clone() })?;
            headers.insert(header_name, header_value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Rate-limited JSON fetcher with a fixed retry policy, one per upstream.
#[derive(Clone)]
pub struct HttpFetcher {
    transport: Arc<dyn Transport>,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("limiter", &self.limiter)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(Arc::new(transport), &config))
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: &HttpClientConfig) -> Self {
        Self {
            transport,
            limiter: config.rate_limit.map(|limit| Arc::new(RateLimiter::new(limit))),
            retry: config.retry,
        }
    }

    /// GET `url` and decode the body as `T`, retrying per the fetcher's policy.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let max_attempts = self.retry.max_attempts.max(1);
            let mut attempt = 1;
            loop {
                match self.attempt(url).await {
                    Ok(value) => {
                        if attempt > 1 {
                            debug!(attempt, "fetch succeeded after retry");
                        }
                        return Ok(value);
                    }
                    Err(err) if attempt < max_attempts => {
                        warn!(
                            attempt,
                            max_attempts,
                            error = %err,
                            wait_secs = self.retry.wait.as_secs(),
                            "fetch failed; retrying"
                        );
                        tokio::time::sleep(self.retry.wait).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        if let Some(limiter) = &self.limiter {
            limiter.take().await;
        }
        let body = self.transport.get(url).await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedTransport {
        calls: AtomicUsize,
        call_times: Mutex<Vec<Instant>>,
        responses: Mutex<VecDeque<Result<Vec<u8>, u16>>>,
    }

    impl ScriptedTransport {
        fn failing() -> Self {
            Self::default()
        }

        async fn push(&self, response: Result<&str, u16>) {
            self.responses
                .lock()
                .await
                .push_back(response.map(|body| body.as_bytes().to_vec()));
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().await.push(Instant::now());
            match self.responses.lock().await.pop_front() {
                Some(Ok(body)) => Ok(body),
                Some(Err(status)) => Err(FetchError::HttpStatus {
                    status,
                    url: url.to_string(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn config(retry: RetryPolicy) -> HttpClientConfig {
        HttpClientConfig {
            retry,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_takes_three_attempts_with_fixed_waits() {
        let transport = Arc::new(ScriptedTransport::failing());
        let fetcher = HttpFetcher::with_transport(transport.clone(), &config(RetryPolicy::default()));

        let started = Instant::now();
        let result = fetcher.fetch_json::<serde_json::Value>("http://upstream/flowers").await;

        assert!(matches!(result, Err(FetchError::HttpStatus { status: 503, .. })));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        let times = transport.call_times.lock().await.clone();
        assert_eq!(times[1] - times[0], Duration::from_secs(180));
        assert_eq!(times[2] - times[1], Duration::from_secs(180));
        assert_eq!(started.elapsed(), Duration::from_secs(360));
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failure_is_retried_like_a_transport_failure() {
        let transport = Arc::new(ScriptedTransport::failing());
        transport.push(Ok("<html>bad gateway</html>")).await;
        transport.push(Ok(r#"{"ok": true}"#)).await;
        let fetcher = HttpFetcher::with_transport(transport.clone(), &config(RetryPolicy::default()));

        let value: serde_json::Value = fetcher
            .fetch_json("http://upstream/flowers")
            .await
            .expect("second attempt decodes");

        assert_eq!(value["ok"], serde_json::Value::Bool(true));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_policy_fails_on_first_error() {
        let transport = Arc::new(ScriptedTransport::failing());
        transport.push(Err(429)).await;
        let fetcher = HttpFetcher::with_transport(transport.clone(), &config(RetryPolicy::none()));

        let started = Instant::now();
        let result = fetcher.fetch_json::<serde_json::Value>("http://geocoder/reverse").await;

        assert!(matches!(result, Err(FetchError::HttpStatus { status: 429, .. })));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_requests_by_interval() {
        let limiter = RateLimiter::new(RateLimit::one_per(Duration::from_millis(500)));
        let started = Instant::now();
        for _ in 0..3 {
            limiter.take().await;
        }
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_does_not_bank_idle_time_beyond_burst() {
        let limiter = RateLimiter::new(RateLimit::one_per(Duration::from_millis(1000)));
        tokio::time::sleep(Duration::from_secs(10)).await;
        let started = Instant::now();
        limiter.take().await;
        limiter.take().await;
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_passes_through_the_limiter() {
        let transport = Arc::new(ScriptedTransport::failing());
        let fetcher = HttpFetcher::with_transport(
            transport.clone(),
            &HttpClientConfig {
                retry: RetryPolicy {
                    max_attempts: 3,
                    wait: Duration::ZERO,
                },
                rate_limit: Some(RateLimit::one_per(Duration::from_millis(500))),
                ..Default::default()
            },
        );

        let started = Instant::now();
        let _ = fetcher.fetch_json::<serde_json::Value>("http://upstream/hex").await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }
}
