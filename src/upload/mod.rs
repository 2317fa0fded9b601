//! Sends one compressed batch to the ingest backend and classifies the
//! response. Grounded in the teacher's `LangSmithClient::post_run`/`patch_run`
//! request-building style (`src/client/http.rs`, now superseded), generalized
//! to the multipart + retry contract of spec §4.7/§6.3.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::compress::{CompressedBatch, MULTIPART_BOUNDARY};
use crate::config::Config;
use crate::error::{LangSmithError, Result};

/// Outcome of a single upload attempt, enough for the caller to decide
/// whether to release the batch's byte-budget permits and whether to retry.
#[derive(Debug)]
pub enum UploadOutcome {
    /// 2xx/3xx-followed: batch accepted, byte counter should be released.
    Accepted,
    /// Non-retryable 4xx (anything but 408/429): batch dropped, counter
    /// still released (the bytes are gone either way), error logged once.
    Rejected(LangSmithError),
    /// Retries exhausted on a retryable condition: batch dropped as a last
    /// resort so the pipeline doesn't stall forever on one bad batch.
    GaveUp(LangSmithError),
}

pub struct Uploader {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    service_key: Option<String>,
    retry_max_attempts: u32,
    retry_max_backoff: Duration,
    use_batch_endpoint: bool,
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Parses a `Retry-After` header value: either a number of seconds or an
/// HTTP-date (spec §4.7).
fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
        .and_then(|date| {
            let now = Utc::now();
            (date > now).then(|| (date - now).to_std().unwrap_or_default())
        })
}

/// Builds the jittered exponential backoff used between retry attempts
/// (spec §4.7: "exponential backoff with jitter"). `max_elapsed_time` is
/// left unset because attempts are capped by `retry_max_attempts`, not by
/// wall-clock budget.
fn new_backoff(cap: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_interval: cap,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

impl Uploader {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            service_key: config.service_key.clone(),
            retry_max_attempts: config.retry_max_attempts,
            retry_max_backoff: Duration::from_secs(config.retry_max_backoff_secs),
            use_batch_endpoint: false,
        }
    }

    /// Switches between `/runs/multipart` and the server-advertised
    /// `/runs/batch` endpoint (spec §4.7).
    pub fn set_batch_endpoint(&mut self, use_batch_endpoint: bool) {
        self.use_batch_endpoint = use_batch_endpoint;
    }

    fn path(&self) -> &'static str {
        if self.use_batch_endpoint {
            "/runs/batch"
        } else {
            "/runs/multipart"
        }
    }

    fn build_request(&self, batch: &CompressedBatch) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.endpoint, self.path());
        let mut request = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("content-encoding", "zstd")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
            )
            .header("trace-context", batch.trace_context_header.clone())
            .body(batch.body.clone());

        if let Some(service_key) = &self.service_key {
            request = request.header("x-service-key", service_key);
        }
        request
    }

    /// Sends `batch`, retrying per spec §4.7 until it either succeeds,
    /// receives a non-retryable rejection, or exhausts
    /// `retry_max_attempts`. Never returns an `Err` to the caller — the
    /// pipeline never raises into the background worker for post-enqueue
    /// failures (spec §7); instead the outcome variant tells the worker
    /// whether to log-drop or keep the batch for one more attempt.
    pub async fn upload(&self, batch: &CompressedBatch) -> UploadOutcome {
        let mut attempt = 0u32;
        let mut backoff = new_backoff(self.retry_max_backoff);
        loop {
            let response = self.build_request(batch).send().await;
            match response {
                Ok(resp) if resp.status().is_success() => {
                    debug!(op_count = batch.op_count, "batch accepted");
                    return UploadOutcome::Accepted;
                }
                Ok(resp) if resp.status().is_redirection() => {
                    // Follow once per spec §4.7.
                    if let Some(location) = resp
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string())
                    {
                        if let Ok(followed) = self.http.post(location).body(batch.body.clone()).send().await {
                            if followed.status().is_success() {
                                return UploadOutcome::Accepted;
                            }
                        }
                    }
                    return UploadOutcome::GaveUp(LangSmithError::Transport {
                        status: Some(resp.status().as_u16()),
                        retryable: false,
                        message: "redirect could not be followed".to_string(),
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !is_retryable(status) {
                        let message = resp.text().await.unwrap_or_default();
                        warn!(%status, %message, "non-retryable rejection, dropping batch");
                        return UploadOutcome::Rejected(LangSmithError::ServerRejection {
                            status: status.as_u16(),
                            message,
                        });
                    }

                    attempt += 1;
                    if attempt >= self.retry_max_attempts {
                        let message = resp.text().await.unwrap_or_default();
                        return UploadOutcome::GaveUp(LangSmithError::Transport {
                            status: Some(status.as_u16()),
                            retryable: true,
                            message,
                        });
                    }

                    let delay = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after)
                        .unwrap_or_else(|| backoff.next_backoff().unwrap_or(self.retry_max_backoff));
                    tokio::time::sleep(delay.min(self.retry_max_backoff)).await;
                }
                Err(transport_err) => {
                    attempt += 1;
                    if attempt >= self.retry_max_attempts {
                        return UploadOutcome::GaveUp(LangSmithError::Transport {
                            status: None,
                            retryable: true,
                            message: transport_err.to_string(),
                        });
                    }
                    let delay = backoff.next_backoff().unwrap_or(self.retry_max_backoff);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
