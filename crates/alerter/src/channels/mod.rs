//! Alerter implementations.

pub mod log;
pub mod webhook;

use async_trait::async_trait;

use crate::alert::{Operation, OperationRequest, Outcome};
use crate::error::AlerterError;

/// A named notification channel (e-mail, chat, ticketing, ...).
///
/// One method per [`Operation`]; [`Alerter::execute`] picks the right one.
/// `Ok` with `success == false` is a reported failure, `Err` is raised and
/// classified with [`AlerterError::is_retryable`].
#[async_trait]
pub trait Alerter: Send + Sync {
    /// Name the alerter is registered under.
    fn name(&self) -> &str;

    /// Notify about a new occurrence.
    async fn new_event(&self, request: &OperationRequest) -> Result<Outcome, AlerterError>;

    /// Notify that the alert cleared.
    async fn recovery(&self, request: &OperationRequest) -> Result<Outcome, AlerterError>;

    /// Re-notify about a still-open alert. Sends a new event by default.
    async fn repeat(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        self.new_event(request).await
    }

    /// Run an operator-requested action.
    async fn action(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        Err(AlerterError::Unsupported {
            alerter: self.name().to_string(),
            operation: request
                .action
                .clone()
                .unwrap_or_else(|| request.operation.to_string()),
        })
    }

    /// Dispatch to the method matching `request.operation`.
    async fn execute(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        match request.operation {
            Operation::NewEvent => self.new_event(request).await,
            Operation::Recovery => self.recovery(request).await,
            Operation::Repeat => self.repeat(request).await,
            Operation::Action => self.action(request).await,
        }
    }
}
