//! Retrying HTTP fetch + document store gateway for match ingestion.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use matchsync_core::FailureClass;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PgConnector;
pub use store::{
    Aggregation, DocumentStore, Filter, FindOptions, InsertOutcome, Projection, Sort,
    SortDirection, StoreConnector, StoreError, StoreGateway, StoreResult,
};

pub const CRATE_NAME: &str = "matchsync-storage";

/// Errors that know whether another attempt could succeed.
pub trait Retryable: fmt::Display + Sized {
    fn failure_class(&self) -> FailureClass;

    /// Wrap the last failure once the attempt ceiling is reached.
    fn exhausted(attempts: usize, last: Self) -> Self;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(4),
            multiplier: 1,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the failed attempt `attempt_index` (zero based).
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .saturating_mul(self.multiplier.max(1))
            .saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempt ceiling is hit. `op` receives the 1-based attempt number.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.failure_class().is_retryable() {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(operation, attempts = attempt, error = %err, "retries exhausted");
            return Err(E::exhausted(attempt, err));
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure; backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    /// Minimum spacing between consecutive requests; providers throttle hard.
    pub min_request_interval: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
            min_request_interval: None,
        }
    }
}

/// Decoded body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient failure fetching {url}: {source}")]
    Transient {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {0}")]
    Http(u16),
    #[error("transport failure fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("undecodable json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("authentication required: {0}")]
    Unauthenticated(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Transient { .. } | Self::RetriesExhausted { .. } => FailureClass::Transient,
            Self::Http(_)
            | Self::Transport { .. }
            | Self::InvalidRequest(_)
            | Self::Unauthenticated(_) => FailureClass::Permanent,
            Self::Decode { .. } => FailureClass::DataShape,
        }
    }
}

impl Retryable for FetchError {
    fn failure_class(&self) -> FailureClass {
        // An exhausted chain must not be retried again by an outer loop.
        match self {
            Self::RetriesExhausted { .. } => FailureClass::Permanent,
            other => other.class(),
        }
    }

    fn exhausted(attempts: usize, last: Self) -> Self {
        Self::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }
    }
}

fn classify_reqwest_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() {
        FetchError::Transient {
            url: url.to_string(),
            source: err,
        }
    } else if err.is_decode() {
        FetchError::Decode {
            url: url.to_string(),
            source: err,
        }
    } else {
        FetchError::Transport {
            url: url.to_string(),
            source: err,
        }
    }
}

/// Render a URL for logs with credential query parameters masked.
pub fn redact_url(url: &Url) -> String {
    if !url.query_pairs().any(|(k, _)| k == "key") {
        return url.to_string();
    }
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "key" { "REDACTED".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    min_request_interval: Option<Duration>,
    last_request: Mutex<Option<Instant>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
            min_request_interval: config.min_request_interval,
            last_request: Mutex::new(None),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn fetch(&self, source_id: &str, url: &Url) -> Result<Payload, FetchError> {
        self.fetch_with_headers(source_id, url, &HeaderMap::new()).await
    }

    /// GET `url`, retrying connection failures and timeouts under the
    /// configured policy. HTTP error statuses fail on the first attempt.
    pub async fn fetch_with_headers(
        &self,
        source_id: &str,
        url: &Url,
        headers: &HeaderMap,
    ) -> Result<Payload, FetchError> {
        let shown = redact_url(url);
        let span = info_span!("http_fetch", source_id, url = %shown);

        with_retry(&self.retry, "http_fetch", |attempt| {
            let shown = shown.as_str();
            async move {
                self.pace().await;
                debug!(attempt, "sending request");
                self.send_once(url, shown, headers).await
            }
        })
        .instrument(span)
        .await
    }

    async fn send_once(
        &self,
        url: &Url,
        shown: &str,
        headers: &HeaderMap,
    ) -> Result<Payload, FetchError> {
        let resp = self
            .client
            .get(url.clone())
            .headers(headers.clone())
            .send()
            .await
            .map_err(|err| classify_reqwest_error(shown, err))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "upstream returned error status");
            return Err(FetchError::Http(status.as_u16()));
        }

        let is_json = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));

        if is_json {
            let value = resp
                .json::<Value>()
                .await
                .map_err(|err| classify_reqwest_error(shown, err))?;
            Ok(Payload::Json(value))
        } else {
            let text = resp
                .text()
                .await
                .map_err(|err| classify_reqwest_error(shown, err))?;
            Ok(Payload::Text(text))
        }
    }

    async fn pace(&self) {
        let Some(interval) = self.min_request_interval else {
            return;
        };
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            multiplier: 1,
            max_delay: Duration::from_millis(20),
        }
    }

    fn fetcher(timeout: Duration) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout,
            retry: fast_policy(),
            ..Default::default()
        })
        .expect("client")
    }

    fn url(base: &str, route: &str) -> Url {
        Url::parse(&format!("{base}{route}")).expect("url")
    }

    #[test]
    fn default_policy_matches_documented_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 1,
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn redact_masks_only_the_key_parameter() {
        let u = Url::parse("https://api.example/x?key=secret&language=en_us").unwrap();
        let shown = redact_url(&u);
        assert!(!shown.contains("secret"));
        assert!(shown.contains("key=REDACTED"));
        assert!(shown.contains("language=en_us"));

        let plain = Url::parse("https://api.example/x?min_rank=10").unwrap();
        assert_eq!(redact_url(&plain), plain.to_string());
    }

    #[tokio::test]
    async fn json_content_type_decodes_structured_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/publicMatches"))
            .and(query_param("min_rank", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"match_id": 1}])))
            .expect(1)
            .mount(&server)
            .await;

        let payload = fetcher(Duration::from_secs(2))
            .fetch("test", &url(&server.uri(), "/api/publicMatches?min_rank=50"))
            .await
            .expect("payload");
        assert_eq!(payload, Payload::Json(json!([{"match_id": 1}])));
    }

    #[tokio::test]
    async fn non_json_content_type_returns_raw_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let payload = fetcher(Duration::from_secs(2))
            .fetch("test", &url(&server.uri(), "/status"))
            .await
            .expect("payload");
        assert_eq!(payload, Payload::Text("maintenance".into()));
        assert!(payload.as_json().is_none());
    }

    #[tokio::test]
    async fn server_error_fails_fast_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher(Duration::from_secs(2))
            .fetch("test", &url(&server.uri(), "/boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Http(500)));
        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher(Duration::from_secs(2))
            .fetch("test", &url(&server.uri(), "/forbidden"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Http(403)));
    }

    #[tokio::test]
    async fn timeouts_are_retried_exactly_three_times() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .expect(3)
            .mount(&server)
            .await;

        let err = fetcher(Duration::from_millis(50))
            .fetch("test", &url(&server.uri(), "/slow"))
            .await
            .unwrap_err();
        match err {
            FetchError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, FetchError::Transient { .. }));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_exhausts_after_three_attempts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = fetcher(Duration::from_secs(1))
            .fetch("test", &url(&format!("http://127.0.0.1:{port}"), "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.class(), FailureClass::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_holds_back_the_next_request() {
        let paced = HttpFetcher::new(HttpClientConfig {
            min_request_interval: Some(Duration::from_secs(2)),
            ..Default::default()
        })
        .expect("client");

        let started = Instant::now();
        paced.pace().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        paced.pace().await;
        assert!(started.elapsed() >= Duration::from_secs(2));

        let unpaced = fetcher(Duration::from_secs(1));
        let started = Instant::now();
        unpaced.pace().await;
        unpaced.pace().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn consecutive_fetches_respect_the_minimum_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(2)
            .mount(&server)
            .await;

        let paced = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            retry: fast_policy(),
            min_request_interval: Some(Duration::from_millis(150)),
            ..Default::default()
        })
        .expect("client");
        let target = url(&server.uri(), "/api/publicMatches");

        let started = std::time::Instant::now();
        paced.fetch("test", &target).await.expect("first");
        paced.fetch("test", &target).await.expect("second");
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn retry_stops_after_first_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<&str, FetchError> = with_retry(&fast_policy(), "op", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 1 {
                    Err(FetchError::Transient {
                        url: "x".into(),
                        source: transient_reqwest_error().await,
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_short_circuit_the_retry_driver() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), FetchError> = with_retry(&fast_policy(), "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Unauthenticated("no key".into())) }
        })
        .await;
        assert!(matches!(result, Err(FetchError::Unauthenticated(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    async fn transient_reqwest_error() -> reqwest::Error {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        reqwest::get(format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap_err()
    }
}
