use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

/// How many times the catalog endpoint is tried and how long to pause between
/// tries. Pauses grow linearly and are only taken while they still fit inside
/// the overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub max_attempts: u32,
    pub pause_step: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            pause_step: Duration::from_secs(2),
        }
    }
}

impl RetryBudget {
    /// Pause before attempt `next_attempt` (1-based), or `None` when the budget
    /// is spent or the pause would run past the deadline.
    pub fn pause_before(&self, next_attempt: u32, remaining: Duration) -> Option<Duration> {
        if next_attempt < 2 || next_attempt > self.max_attempts {
            return None;
        }
        let pause = self.pause_step.saturating_mul(next_attempt - 1);
        (pause < remaining).then_some(pause)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Wall-clock bound for the whole fetch, retries and pauses included.
    pub deadline: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryBudget,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(60),
            user_agent: None,
            retry: RetryBudget::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no complete response within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::DeadlineExceeded(_) => true,
            Self::Request(err) => err.is_timeout(),
            Self::HttpStatus { .. } => false,
        }
    }

    /// Failures worth another attempt: the server was unreachable or said so
    /// itself (5xx, 429). Timeouts never are.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DeadlineExceeded(_) => false,
            Self::Request(err) => !err.is_timeout() && (err.is_connect() || err.is_request()),
            Self::HttpStatus { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
        }
    }
}

/// GET of a single endpoint under one overall deadline.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    deadline: Duration,
    retry: RetryBudget,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            deadline: config.deadline,
            retry: config.retry,
        })
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_until_deadline(url).instrument(span).await
    }

    async fn fetch_until_deadline(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let deadline = Instant::now() + self.deadline;
        let mut attempt = 1u32;
        loop {
            let err = match timeout_at(deadline, self.attempt(url)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => err,
                Err(_) => return Err(FetchError::DeadlineExceeded(self.deadline)),
            };
            if !err.is_transient() {
                return Err(err);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(pause) = self.retry.pause_before(attempt + 1, remaining) else {
                return Err(err);
            };
            warn!(error = %err, attempt, pause_ms = pause.as_millis() as u64, "catalog fetch failed; retrying");
            tokio::time::sleep(pause).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fetcher(deadline: Duration, retry: RetryBudget) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            deadline,
            user_agent: Some("cfpick-test".into()),
            retry,
        })
        .expect("client")
    }

    /// Answers the first `failures` connections with 503, then with `body`.
    async fn flaky_server(failures: usize, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}/api/problemset.problems", listener.local_addr().expect("addr"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let reply = if seen < failures {
                    "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string()
                } else {
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    )
                };
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (url, hits)
    }

    #[test]
    fn pauses_grow_and_stop_at_the_budget_or_deadline() {
        let budget = RetryBudget {
            max_attempts: 3,
            pause_step: Duration::from_millis(100),
        };
        let plenty = Duration::from_secs(10);

        assert_eq!(budget.pause_before(1, plenty), None);
        assert_eq!(budget.pause_before(2, plenty), Some(Duration::from_millis(100)));
        assert_eq!(budget.pause_before(3, plenty), Some(Duration::from_millis(200)));
        assert_eq!(budget.pause_before(4, plenty), None);
        assert_eq!(budget.pause_before(3, Duration::from_millis(150)), None);
    }

    #[tokio::test]
    async fn service_unavailable_is_retried_until_success() {
        let (url, hits) = flaky_server(1, r#"{"status":"OK"}"#).await;
        let retry = RetryBudget {
            max_attempts: 3,
            pause_step: Duration::from_millis(20),
        };
        let response = fetcher(Duration::from_secs(5), retry)
            .fetch_bytes(Uuid::new_v4(), &url)
            .await
            .expect("second attempt succeeds");
        assert_eq!(response.body, br#"{"status":"OK"}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn spent_budget_reports_the_last_status() {
        let (url, hits) = flaky_server(usize::MAX, "").await;
        let retry = RetryBudget {
            max_attempts: 2,
            pause_step: Duration::from_millis(20),
        };
        let err = fetcher(Duration::from_secs(5), retry)
            .fetch_bytes(Uuid::new_v4(), &url)
            .await
            .expect_err("always unavailable");
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert!(!err.is_timeout());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_request_error() {
        let retry = RetryBudget {
            max_attempts: 1,
            ..RetryBudget::default()
        };
        let result = fetcher(Duration::from_secs(2), retry)
            .fetch_bytes(Uuid::new_v4(), "http://127.0.0.1:9/")
            .await;
        assert!(matches!(result, Err(FetchError::Request(_))));
    }
}
