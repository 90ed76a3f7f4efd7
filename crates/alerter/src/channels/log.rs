//! Alerter that only writes to the log.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::alert::{OperationRequest, Outcome};
use crate::error::AlerterError;
use crate::Alerter;

/// Logs every operation and reports success. Accepts any action name.
pub struct LogAlerter {
    name: String,
}

impl LogAlerter {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn record(&self, request: &OperationRequest) -> Outcome {
        info!(
            alerter = %self.name,
            alert_id = %request.alert.id,
            operation = %request.operation,
            action = request.action.as_deref().unwrap_or(""),
            attempt = request.attempt,
            "{}",
            request.reason
        );

        Outcome::success(json!({
            "alerter": self.name,
            "operation": request.operation,
            "logged_at": chrono::Utc::now(),
        }))
    }
}

#[async_trait]
impl Alerter for LogAlerter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_event(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        Ok(self.record(request))
    }

    async fn recovery(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        Ok(self.record(request))
    }

    async fn action(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        Ok(self.record(request))
    }
}
