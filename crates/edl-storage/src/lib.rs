//! HTTP fetch utilities plus the source-table and match-sink collaborators for EDL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub mod sink;
pub mod source_table;

pub use reqwest::StatusCode;
pub use sink::{FixtureMatchSink, MatchSink, PgMatchSink};
pub use source_table::{
    FixtureSourceTable, PgSourceTable, SourceQuery, SourceScope, SourceTable, SourceTableError,
};

pub const CRATE_NAME: &str = "edl-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// No waiting between attempts; used by tests and fixture runs.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub max_in_flight: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            max_in_flight: 1,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request budget that keeps the client under the directory's rate limit.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json(status: StatusCode, final_url: impl Into<String>, body: &serde_json::Value) -> Self {
        Self {
            status,
            final_url: final_url.into(),
            body: body.to_string().into_bytes(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    /// The connection dropped while the body was being read.
    #[error("reading response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    pub fn retry_disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Body { .. } => RetryDisposition::Retryable,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.retry_disposition() == RetryDisposition::Retryable
    }
}

/// Single-attempt GET client. Retrying is the caller's job so every failed
/// attempt can be reported with the record that caused it.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    bearer_token: Option<String>,
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            token_bucket,
            bearer_token: config.bearer_token,
        })
    }

    /// Issue one GET with query parameters.
    ///
    /// Successful and non-retryable responses are returned as-is so the caller
    /// can inspect error payloads; retryable statuses (429, 5xx) become
    /// [`FetchError::HttpStatus`].
    pub async fn get_with_query(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("directory_fetch", url);
        self.send_once(url, query).instrument(span).await
    }

    async fn send_once(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        debug!(status = status.as_u16(), "directory response received");

        if !status.is_success() && classify_status(status) == RetryDisposition::Retryable {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = match resp.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(source) => return Err(FetchError::Body { url: final_url, source }),
        };
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Answers every connection with a 200 whose body stops well short of its
    /// declared length.
    async fn truncated_body_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 500\r\n\r\n{\"total\": 1, \"bus",
                    )
                    .await;
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(BackoffPolicy::immediate(3).delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(FetchError::HttpStatus { status: 503, url: "x".into() }.is_transient());
        assert!(FetchError::HttpStatus { status: 429, url: "x".into() }.is_transient());
        assert!(!FetchError::HttpStatus { status: 404, url: "x".into() }.is_transient());
    }

    #[tokio::test]
    async fn sends_query_and_bearer_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/phone_search")
                    .query_param("phone", "2125550100")
                    .header("authorization", "Bearer secret");
                then.status(200).json_body(serde_json::json!({ "total": 0 }));
            })
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            bearer_token: Some("secret".into()),
            ..Default::default()
        })
        .expect("fetcher");
        let resp = fetcher
            .get_with_query(&server.url("/phone_search"), &[("phone", "2125550100".into())])
            .await
            .expect("response");

        mock.assert_async().await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, br#"{"total":0}"#.to_vec());
    }

    #[tokio::test]
    async fn client_errors_keep_their_payload() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/search");
                then.status(400)
                    .json_body(serde_json::json!({ "error": { "id": "UNAVAILABLE_FOR_LOCATION" } }));
            })
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let resp = fetcher
            .get_with_query(&server.url("/search"), &[])
            .await
            .expect("400 is handed back");
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn server_errors_are_reported_as_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/search");
                then.status(503);
            })
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let err = fetcher
            .get_with_query(&server.url("/search"), &[])
            .await
            .expect_err("503 is an error");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn cut_off_body_is_a_transient_error() {
        let base = truncated_body_server().await;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .expect("fetcher");

        let err = fetcher
            .get_with_query(&format!("{base}/search"), &[])
            .await
            .expect_err("short body is an error");
        assert!(matches!(err, FetchError::Body { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn in_flight_cap_serializes_requests() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/search");
                then.status(200)
                    .json_body(serde_json::json!({ "total": 0 }))
                    .delay(Duration::from_millis(200));
            })
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            max_in_flight: 1,
            ..Default::default()
        })
        .expect("fetcher");
        let url = server.url("/search");

        let started = Instant::now();
        let (first, second) = tokio::join!(
            fetcher.get_with_query(&url, &[]),
            fetcher.get_with_query(&url, &[])
        );
        first.expect("first response");
        second.expect("second response");
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn token_bucket_waits_once_drained() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_millis(200));

        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_millis(100));

        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
