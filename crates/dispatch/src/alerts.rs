//! Read access to the externally owned alert records.

use alerter::Alert;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Supplies the current alert record (status, text, tags) at execution time.
#[async_trait]
pub trait AlertSource: Send + Sync {
    async fn alert(&self, alert_id: &str) -> Result<Option<Alert>, StoreError>;
}

/// Alert records held in memory.
#[derive(Default)]
pub struct MemoryAlerts {
    alerts: RwLock<HashMap<String, Alert>>,
}

impl MemoryAlerts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an alert.
    pub async fn upsert(&self, alert: Alert) {
        self.alerts.write().await.insert(alert.id.clone(), alert);
    }

    /// Apply `f` to a stored alert. Returns false if the alert is unknown.
    pub async fn modify<F>(&self, alert_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Alert) + Send,
    {
        match self.alerts.write().await.get_mut(alert_id) {
            Some(alert) => {
                f(alert);
                alert.updated_at = chrono::Utc::now();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl AlertSource for MemoryAlerts {
    async fn alert(&self, alert_id: &str) -> Result<Option<Alert>, StoreError> {
        Ok(self.alerts.read().await.get(alert_id).cloned())
    }
}
