//! HTTP transport: rate limiting, per-request timeout, retries with jittered backoff, and
//! charset normalization. Every wait point observes the caller's cancellation token.

use crate::config::{SiteConfig, DEFAULT_RETRIES, DEFAULT_TIMEOUT_SECS};
use crate::source::charset::decode_html;
use crate::source::error::SourceError;
use crate::source::limiter::RateLimiter;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{StatusCode, Url};
use scraper::Html;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; sonovel/0.1; +https://github.com/sonovel/sonovel)";
const MAX_REDIRECTS: usize = 10;

const BASE_BACKOFF_MS: u64 = 300;
const MAX_BACKOFF_MS: u64 = 3000;

/// Un-jittered backoff before retry number `attempt` (0-based): `min(3s, 300ms * 2^attempt)`.
pub fn backoff_base(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(16);
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

/// [backoff_base] scaled by a uniform factor in `[0.5, 1.5)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
    backoff_base(attempt).mul_f64(jitter)
}

/// A decoded page plus the URL it was actually served from (after redirects).
///
/// Relative links inside the page resolve against `url`.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub url: Url,
    pub text: String,
    pub raw: Vec<u8>,
}

impl FetchedDocument {
    pub fn parse(&self) -> Html {
        Html::parse_document(&self.text)
    }
}

/// HTTP client shared by every call on one source. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    limiter: Arc<RateLimiter>,
    retries: u32,
    default_headers: HeaderMap,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Client configured from a site's timeout, proxy, retry and rate-limit settings.
    pub fn from_config(config: &SiteConfig) -> Result<Self, SourceError> {
        let mut builder = Self::builder()
            .timeout(config.timeout())
            .retries(config.retries())
            .limiter(Arc::new(RateLimiter::new(
                config.rate_limit.rps,
                config.rate_limit.burst,
            )));
        if let Some(proxy) = config.proxy() {
            builder = builder.proxy(proxy);
        }
        builder.build()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Replace the shared limiter, e.g. to share one bucket across several sources.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Fetch `url` and decode it. `headers` take precedence over the client's defaults.
    pub async fn fetch_document(
        &self,
        url: &str,
        headers: &HeaderMap,
        charset: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<FetchedDocument, SourceError> {
        let parsed = Url::parse(url).map_err(|e| SourceError::InvalidUrl {
            input: url.to_string(),
            reason: e.to_string(),
        })?;
        let (final_url, raw) = self.get_with_retry(parsed, headers, cancel).await?;
        let (text, encoding) = decode_html(&raw, charset);
        tracing::debug!(url = %final_url, bytes = raw.len(), charset = encoding.name(), "fetched");
        let text = text.into_owned();
        Ok(FetchedDocument {
            url: final_url,
            text,
            raw,
        })
    }

    /// GET with retries for transient failures.
    ///
    /// Retries on: timeout, connection errors, HTTP 5xx, and HTTP 429. Other statuses and
    /// errors are returned immediately. Returns the final URL and body bytes.
    async fn get_with_retry(
        &self,
        url: Url,
        headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<(Url, Vec<u8>), SourceError> {
        let headers = self.merge_headers(headers);
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire(cancel).await?;
            tracing::debug!(url = %url, attempt, "GET");

            let request = self.inner.get(url.clone()).headers(headers.clone());
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                r = request.send() => r,
            };

            let failure = match sent {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let final_url = response.url().clone();
                        let body = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                            b = response.bytes() => b,
                        };
                        match body {
                            Ok(bytes) => return Ok((final_url, bytes.to_vec())),
                            Err(e) if is_transient(&e) => classify(e, &url),
                            Err(e) => return Err(classify(e, &url)),
                        }
                    } else {
                        let err = SourceError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        };
                        if !is_retryable_status(status) {
                            return Err(err);
                        }
                        err
                    }
                }
                Err(e) if is_transient(&e) => classify(e, &url),
                Err(e) => return Err(classify(e, &url)),
            };

            if attempt >= self.retries {
                return Err(failure);
            }
            let delay = backoff_delay(attempt);
            tracing::warn!(url = %url, attempt, error = %failure, delay_ms = delay.as_millis() as u64, "retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn merge_headers(&self, headers: &HeaderMap) -> HeaderMap {
        let mut merged = headers.clone();
        for (name, value) in &self.default_headers {
            if !merged.contains_key(name) {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Timeouts, failed connects, connections dropped mid-request, and truncated bodies.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
}

fn classify(e: reqwest::Error, url: &Url) -> SourceError {
    if e.is_timeout() {
        SourceError::Timeout {
            url: url.to_string(),
        }
    } else {
        SourceError::Network {
            url: url.to_string(),
            source: e,
        }
    }
}

/// Builder for HttpClient with optional User-Agent, timeout, proxy, retry and limiter settings.
#[derive(Debug)]
pub struct HttpClientBuilder {
    user_agent: Option<String>,
    timeout: Duration,
    retries: u32,
    proxy: Option<String>,
    limiter: Option<Arc<RateLimiter>>,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retries: DEFAULT_RETRIES,
            proxy: None,
            limiter: None,
        }
    }
}

impl HttpClientBuilder {
    /// Default User-Agent, sent only when the caller's headers don't set one.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Per-attempt timeout. Default 15s.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retries beyond the first attempt. Default 3.
    pub fn retries(mut self, n: u32) -> Self {
        self.retries = n;
        self
    }

    /// HTTP proxy for all schemes.
    pub fn proxy(mut self, url: impl Into<String>) -> Self {
        self.proxy = Some(url.into());
        self
    }

    /// Shared rate limiter. Default: unlimited.
    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn build(self) -> Result<HttpClient, SourceError> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let user_agent =
            HeaderValue::from_str(&user_agent).map_err(|e| SourceError::InvalidConfig {
                field: "user_agent",
                reason: e.to_string(),
            })?;
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, user_agent);

        let mut inner = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS));
        if let Some(proxy) = self.proxy {
            let proxy = reqwest::Proxy::all(&proxy).map_err(|e| SourceError::InvalidConfig {
                field: "proxy",
                reason: e.to_string(),
            })?;
            inner = inner.proxy(proxy);
        }
        let inner = inner
            .build()
            .map_err(|e| SourceError::ClientBuild { source: e })?;

        Ok(HttpClient {
            inner,
            limiter: self
                .limiter
                .unwrap_or_else(|| Arc::new(RateLimiter::unlimited())),
            retries: self.retries,
            default_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::REFERER;

    #[test]
    fn backoff_base_doubles_then_caps() {
        assert_eq!(backoff_base(0), Duration::from_millis(300));
        assert_eq!(backoff_base(1), Duration::from_millis(600));
        assert_eq!(backoff_base(2), Duration::from_millis(1200));
        assert_eq!(backoff_base(3), Duration::from_millis(2400));
        assert_eq!(backoff_base(4), Duration::from_millis(3000));
        assert_eq!(backoff_base(u32::MAX), Duration::from_millis(3000));
    }

    #[test]
    fn backoff_delay_stays_within_jitter_bounds() {
        for attempt in 0..40 {
            let base = backoff_base(attempt);
            for _ in 0..50 {
                let d = backoff_delay(attempt);
                assert!(d >= base.mul_f64(0.5), "attempt {}: {:?}", attempt, d);
                assert!(d <= base.mul_f64(1.5), "attempt {}: {:?}", attempt, d);
            }
        }
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn caller_headers_win_over_defaults() {
        let client = HttpClient::builder().user_agent("Default/1.0").build().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("Site/2.0"));
        headers.insert(REFERER, HeaderValue::from_static("https://demo.test/"));
        let merged = client.merge_headers(&headers);
        assert_eq!(merged.get(USER_AGENT).unwrap(), "Site/2.0");
        assert_eq!(merged.get(REFERER).unwrap(), "https://demo.test/");

        let merged = client.merge_headers(&HeaderMap::new());
        assert_eq!(merged.get(USER_AGENT).unwrap(), "Default/1.0");
    }

    #[test]
    fn with_limiter_replaces_the_bucket() {
        let shared = Arc::new(RateLimiter::new(1.0, 1));
        let client = HttpClient::builder().build().unwrap();
        assert!(!client.limiter().is_enabled());
        let client = client.with_limiter(Arc::clone(&shared));
        assert!(Arc::ptr_eq(client.limiter(), &shared));
        assert!(client.clone().limiter().is_enabled());
    }

    #[test]
    fn invalid_proxy_is_a_configuration_error() {
        let err = HttpClient::builder().proxy("::not a proxy::").build().unwrap_err();
        assert_eq!(err.kind(), crate::source::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn malformed_url_fails_without_network() {
        let client = HttpClient::builder().build().unwrap();
        let err = client
            .fetch_document("not a url", &HeaderMap::new(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidUrl { .. }));
        assert_eq!(err.kind(), crate::source::ErrorKind::Network);
    }
}
