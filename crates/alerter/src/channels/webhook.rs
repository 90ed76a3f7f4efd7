//! Generic JSON webhook alerter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::alert::{AlertStatus, Operation, OperationRequest, Outcome};
use crate::error::AlerterError;
use crate::Alerter;

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest response body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// POSTs every operation as a JSON document to a single URL.
///
/// Response mapping:
/// - 2xx: success, the JSON body (or raw text) becomes the payload
/// - 429: [`AlerterError::RateLimited`], honoring `Retry-After`
/// - 5xx: [`AlerterError::Retryable`]
/// - other: [`AlerterError::Rejected`]
pub struct WebhookAlerter {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookAlerter {
    /// Create a webhook alerter with the default timeout.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self, AlerterError> {
        Self::with_timeout(name, url, DEFAULT_TIMEOUT)
    }

    /// Create a webhook alerter with a specific request timeout.
    pub fn with_timeout(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AlerterError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }

    fn format_payload(request: &OperationRequest) -> WebhookPayload<'_> {
        WebhookPayload {
            operation: request.operation,
            action: request.action.as_deref(),
            reason: &request.reason,
            attempt: request.attempt,
            alert: WebhookAlert {
                id: &request.alert.id,
                status: request.alert.status,
                text: &request.alert.text,
                tags: &request.alert.tags,
            },
            sent_at: Utc::now(),
        }
    }

    async fn post(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        let payload = Self::format_payload(request);

        debug!(
            alerter = %self.name,
            operation = %request.operation,
            alert_id = %request.alert.id,
            "Posting webhook"
        );

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            let payload = serde_json::from_str(&body)
                .unwrap_or_else(|_| serde_json::Value::String(body));
            return Ok(Outcome::success(payload));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(1);
            return Err(AlerterError::RateLimited { retry_after_secs });
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        warn!(
            alerter = %self.name,
            status = %status,
            body = %body,
            "Webhook request failed"
        );

        if status.is_server_error() {
            Err(AlerterError::Retryable(format!("{status}: {body}")))
        } else {
            Err(AlerterError::Rejected(format!("{status}: {body}")))
        }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_event(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        self.post(request).await
    }

    async fn recovery(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        self.post(request).await
    }

    async fn action(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        self.post(request).await
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'a str>,
    reason: &'a str,
    attempt: u32,
    alert: WebhookAlert<'a>,
    sent_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct WebhookAlert<'a> {
    id: &'a str,
    status: AlertStatus,
    text: &'a str,
    tags: &'a [String],
}
