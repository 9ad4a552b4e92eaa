//! Retrying HTTP client used to read the upstream catalog collaborator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

/// How many times a catalog read is retried and how long to wait in between.
#[derive(Debug, Clone, Copy)]
pub struct RetryPlan {
    pub retries: usize,
    pub first_delay: Duration,
    /// Upper bound for doubled delays and for server `Retry-After` hints.
    pub max_delay: Duration,
}

impl Default for RetryPlan {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPlan {
    /// Wait before retry number `retry` (0-based). A server hint replaces the
    /// doubling schedule but is still capped.
    pub fn wait(&self, retry: usize, hint: Option<Duration>) -> Duration {
        let doubled = u32::try_from(retry)
            .ok()
            .and_then(|r| 1u32.checked_shl(r))
            .map_or(self.max_delay, |factor| self.first_delay.saturating_mul(factor));
        hint.unwrap_or(doubled).min(self.max_delay)
    }
}

/// What to do with one catalog response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    Accept,
    /// Transient upstream trouble; `hint` carries a parsed `Retry-After`.
    Retry { hint: Option<Duration> },
    Reject,
}

/// Throttling, upstream overload and gateway errors are worth another try.
/// A 404 is a definite answer for single-record reads.
pub fn classify_response(status: StatusCode, headers: &HeaderMap) -> ResponseAction {
    if status.is_success() {
        return ResponseAction::Accept;
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => ResponseAction::Retry {
            hint: retry_after(headers),
        },
        StatusCode::REQUEST_TIMEOUT => ResponseAction::Retry { hint: None },
        s if s.is_server_error() => ResponseAction::Retry { hint: None },
        _ => ResponseAction::Reject,
    }
}

/// Delta-seconds form only; HTTP-date hints fall back to the doubling schedule.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Connection-level failures are retried; body and redirect errors are not.
fn transport_is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Concurrent catalog requests across all feed requests.
    pub max_in_flight: usize,
    pub retry: RetryPlan,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            retry: RetryPlan::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("catalog answered {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    retry: RetryPlan,
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
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            retry: config.retry,
        })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("catalog_fetch", url);
        async {
            // Never closed, so acquisition cannot fail.
            let _permit = self.in_flight.acquire().await.ok();
            let mut retry = 0usize;
            loop {
                let hint = match self.client.get(url).send().await {
                    Ok(resp) => match classify_response(resp.status(), resp.headers()) {
                        ResponseAction::Accept => return Ok(resp.bytes().await?.to_vec()),
                        ResponseAction::Retry { hint } if retry < self.retry.retries => {
                            warn!(status = resp.status().as_u16(), retry, ?hint, "catalog busy, retrying");
                            hint
                        }
                        ResponseAction::Retry { .. } | ResponseAction::Reject => {
                            return Err(FetchError::HttpStatus {
                                status: resp.status().as_u16(),
                                url: resp.url().to_string(),
                            });
                        }
                    },
                    Err(err) if transport_is_transient(&err) && retry < self.retry.retries => {
                        warn!(%err, retry, "catalog unreachable, retrying");
                        None
                    }
                    Err(err) => return Err(FetchError::Request(err)),
                };
                let wait = self.retry.wait(retry, hint);
                debug!(?wait, "waiting before next catalog attempt");
                tokio::time::sleep(wait).await;
                retry += 1;
            }
        }
        .instrument(span)
        .await
    }

    /// Decodes a JSON body; a 404 maps to `None`.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, FetchError> {
        match self.get_bytes(url).await {
            Ok(body) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|source| FetchError::Decode {
                    url: url.to_string(),
                    source,
                }),
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
