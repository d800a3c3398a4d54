//! HTTP delivery for the ingestion pipeline. The transport never raises:
//! every outcome, including connect and TLS failures, is reported as a
//! [`Response`] value and retried according to the backoff policy.

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use reqwest::{StatusCode, Url};

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{LIB_NAME, LIB_VERSION};

/// Status used for failures that never produced an HTTP response.
pub(crate) const NETWORK_ERROR_STATUS: i32 = -1;

/// Outcome of a delivery attempt (or a whole retry sequence).
#[derive(Debug, Clone, Default)]
pub(crate) struct Response {
    pub status: i32,
    pub body: Option<String>,
    pub error: Option<String>,
    pub retry_after: Option<Duration>,
}

impl Response {
    pub fn network_error(message: impl Into<String>) -> Self {
        Response {
            status: NETWORK_ERROR_STATUS,
            error: Some(message.into()),
            ..Response::default()
        }
    }

    pub fn success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn rate_limited(&self) -> bool {
        self.status == 429
    }

    pub fn client_error(&self) -> bool {
        (400..500).contains(&self.status) && !self.rate_limited()
    }

    pub fn server_error(&self) -> bool {
        self.status >= 500
    }

    pub fn is_network_error(&self) -> bool {
        self.status < 0
    }

    pub fn should_retry(&self) -> bool {
        self.rate_limited() || self.server_error() || self.is_network_error()
    }

    pub fn error_message(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        match &self.body {
            Some(body) if !body.is_empty() => format!("HTTP {}: {}", self.status, body),
            _ => format!("HTTP {}", self.status),
        }
    }
}

/// Delivery seam between the worker and the network. Tests substitute a
/// recording implementation.
pub(crate) trait Transport: Send + Sync {
    /// Deliver one encoded batch payload, retrying as configured. Must not
    /// panic; every failure becomes a `Response`.
    fn send_batch(&self, payload: &str) -> Response;

    /// Release the underlying connection. Called once on client shutdown.
    fn shutdown(&self) {}
}

pub(crate) struct HttpTransport {
    // One request is in flight at a time, so a current-thread runtime that
    // the caller blocks on is sufficient.
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    endpoint: Url,
    max_retries: u32,
}

pub(crate) fn user_agent() -> String {
    format!("{LIB_NAME}/{LIB_VERSION}")
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.skip_tls_verification)
            .build()?;
        let endpoint = Url::parse(&format!("{}/batch", config.host.trim_end_matches('/')))
            .map_err(Error::InvalidHost)?;
        Ok(HttpTransport {
            runtime,
            client,
            endpoint,
            max_retries: config.max_retries,
        })
    }

    async fn post_once(&self, payload: &str) -> Response {
        let result = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, user_agent())
            .body(payload.to_owned())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16() as i32;
                let retry_after = if response.status() == StatusCode::TOO_MANY_REQUESTS {
                    parse_retry_after(&response)
                } else {
                    None
                };
                let body = response.text().await.ok();
                Response {
                    status,
                    body,
                    error: None,
                    retry_after,
                }
            }
            Err(err) => Response::network_error(err.to_string()),
        }
    }

    async fn send_with_retries(&self, payload: &str) -> Response {
        let mut backoff = BackoffPolicy::with_max_retries(self.max_retries);
        let mut attempt = 0u32;
        loop {
            let response = self.post_once(payload).await;
            if response.success() || !response.should_retry() {
                return response;
            }
            attempt += 1;
            if !backoff.should_retry(attempt) {
                log::warn!(
                    target: "posthog",
                    "giving up on batch after {attempt} attempts: {}",
                    response.error_message()
                );
                return response;
            }
            let delay = match response.retry_after {
                // A Retry-After header on 429 overrides the backoff.
                Some(retry_after) if response.rate_limited() => retry_after,
                _ => backoff.next_interval(),
            };
            log::debug!(
                target: "posthog",
                "retrying batch in {delay:?} (attempt {attempt}, status {})",
                response.status
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Transport for HttpTransport {
    fn send_batch(&self, payload: &str) -> Response {
        self.runtime.block_on(self.send_with_retries(payload))
    }
}
