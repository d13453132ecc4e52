//! HTTP transport to the billing system with bounded concurrency and retry/backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use billsync_core::{DateRange, SyncError};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

use crate::JobId;

/// Status and body of an upstream response, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }
}

/// Result of a credential exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[async_trait]
pub trait CredentialExchange: Send + Sync {
    async fn exchange(&self) -> Result<TokenGrant, SyncError>;
}

/// Raw calls to the billing API. Network failures and exhausted retries are
/// errors; every HTTP status that made it back is returned for classification.
#[async_trait]
pub trait BillingTransport: Send + Sync {
    async fn submit_report(&self, token: &str, range: &DateRange) -> Result<RawResponse, SyncError>;

    async fn poll_report(&self, token: &str, job: &JobId) -> Result<RawResponse, SyncError>;

    async fn download_report(&self, token: &str, job: &JobId) -> Result<RawResponse, SyncError>;

    async fn list_activities(
        &self,
        token: &str,
        range: &DateRange,
        offset: usize,
        limit: usize,
    ) -> Result<RawResponse, SyncError>;
}

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
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

#[derive(Debug)]
pub struct HttpBillingTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
    in_flight: Arc<Semaphore>,
}

impl HttpBillingTransport {
    pub fn new(config: HttpTransportConfig) -> anyhow::Result<Self> {
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
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// Sends with retries on 5xx/429 and transient network errors.
    async fn send(
        &self,
        what: &'static str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<RawResponse, SyncError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| SyncError::UpstreamUnavailable("transport closed".into()))?;

        let backoff = self.config.backoff;
        let span = info_span!("billing_http", what);
        async move {
            for attempt in 0..=backoff.max_retries {
                match build().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < backoff.max_retries
                        {
                            debug!(attempt, %status, "retrying billing request");
                            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                            return Err(SyncError::UpstreamUnavailable(format!(
                                "{what} returned {status} after {} attempts",
                                attempt + 1
                            )));
                        }
                        let body = resp.text().await.map_err(|err| {
                            SyncError::UpstreamUnavailable(format!("{what} body: {err}"))
                        })?;
                        return Ok(RawResponse::new(status.as_u16(), body));
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < backoff.max_retries
                        {
                            debug!(attempt, error = %err, "retrying billing request");
                            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(SyncError::UpstreamUnavailable(format!("{what}: {err}")));
                    }
                }
            }
            Err(SyncError::UpstreamUnavailable(format!("{what}: retries exhausted")))
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl CredentialExchange for HttpBillingTransport {
    async fn exchange(&self) -> Result<TokenGrant, SyncError> {
        let resp = self
            .send("token_exchange", || {
                self.client.post(&self.config.token_url).form(&[
                    ("grant_type", "refresh_token"),
                    ("client_id", self.config.client_id.as_str()),
                    ("client_secret", self.config.client_secret.as_str()),
                    ("refresh_token", self.config.refresh_token.as_str()),
                ])
            })
            .await
            .map_err(|err| SyncError::Credential(err.to_string()))?;
        if !resp.is_success() {
            return Err(SyncError::Credential(format!(
                "token endpoint returned {}",
                resp.status
            )));
        }
        serde_json::from_str(&resp.body)
            .map_err(|err| SyncError::Credential(format!("unreadable token response: {err}")))
    }
}

#[async_trait]
impl BillingTransport for HttpBillingTransport {
    async fn submit_report(&self, token: &str, range: &DateRange) -> Result<RawResponse, SyncError> {
        let body = serde_json::json!({
            "data": {
                "kind": "payments_collected",
                "format": "json",
                "start_date": range.start.to_string(),
                "end_date": range.end.to_string(),
            }
        });
        self.send("submit_report", || {
            self.client.post(self.url("reports")).bearer_auth(token).json(&body)
        })
        .await
    }

    async fn poll_report(&self, token: &str, job: &JobId) -> Result<RawResponse, SyncError> {
        let url = self.url(&format!("reports/{}", job.0));
        self.send("poll_report", || self.client.get(&url).bearer_auth(token))
            .await
    }

    async fn download_report(&self, token: &str, job: &JobId) -> Result<RawResponse, SyncError> {
        let url = self.url(&format!("reports/{}/download", job.0));
        self.send("download_report", || self.client.get(&url).bearer_auth(token))
            .await
    }

    async fn list_activities(
        &self,
        token: &str,
        range: &DateRange,
        offset: usize,
        limit: usize,
    ) -> Result<RawResponse, SyncError> {
        let url = self.url("activities");
        let query = [
            ("start_date", range.start.to_string()),
            ("end_date", range.end.to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
            (
                "fields",
                "id,type,date,quantity_in_hours,total,note,user{name},matter{display_number}".to_string(),
            ),
        ];
        self.send("list_activities", || {
            self.client.get(&url).bearer_auth(token).query(&query)
        })
        .await
    }
}
