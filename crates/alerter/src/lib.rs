//! Alerter collaborator surface for alert dispatch.
//!
//! An alerter is a named notification channel (chat, e-mail, ticketing, ...).
//! The dispatch core decides *when* an operation runs; this crate defines
//! *what* it calls to run it.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use alerter::{AlerterRegistry, LogAlerter, WebhookAlerter};
//!
//! let mut registry = AlerterRegistry::new();
//! registry.register(Arc::new(LogAlerter::new("log")));
//! registry.register(Arc::new(
//!     WebhookAlerter::new("oncall", "https://hooks.example.com/oncall").unwrap(),
//! ));
//!
//! assert!(registry.get("oncall").is_some());
//! ```
//!
//! # Architecture
//!
//! - [`Alerter`] trait: one method per [`Operation`], dispatched by [`Alerter::execute`]
//! - [`AlerterError`]: raised failures, split into retryable and fatal
//! - [`AlerterRegistry`]: alerters by name, as referenced from jobs

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alert;
pub mod channels;
pub mod error;

pub use alert::{Alert, AlertStatus, Operation, OperationRequest, Outcome, DO_NOT_RETRY_TAG};
pub use channels::log::LogAlerter;
pub use channels::webhook::WebhookAlerter;
pub use channels::Alerter;
pub use error::AlerterError;

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Alerters by name.
///
/// Jobs only carry the alerter's name, so the registry is how a worker
/// finds the implementation again after a job was persisted and redelivered.
#[derive(Clone, Default)]
pub struct AlerterRegistry {
    alerters: BTreeMap<String, Arc<dyn Alerter>>,
}

impl AlerterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with specific alerters.
    #[must_use]
    pub fn with_alerters(alerters: Vec<Arc<dyn Alerter>>) -> Self {
        let mut registry = Self::new();
        for alerter in alerters {
            registry.register(alerter);
        }
        registry
    }

    /// Register an alerter under its own name, replacing any previous one.
    pub fn register(&mut self, alerter: Arc<dyn Alerter>) {
        let name = alerter.name().to_string();
        if self.alerters.insert(name.clone(), alerter).is_some() {
            warn!(alerter = %name, "Replaced previously registered alerter");
        } else {
            info!(alerter = %name, "Alerter registered");
        }
    }

    /// Look up an alerter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Alerter>> {
        self.alerters.get(name).cloned()
    }

    /// Registered alerter names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.alerters.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.alerters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alerters.is_empty()
    }
}
