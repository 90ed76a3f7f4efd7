//! Dispatch configuration: queue, priority and backoff per operation class.
//!
//! Loaded from YAML, then overridden from the environment:
//!
//! - `ALERT_DISPATCH_INCLUDE_TRACEBACK`: store the error chain on fatal failures
//! - `ALERT_DISPATCH_CHAIN_DELAY_SECS`: delay before a chained follow-up runs
//! - `ALERT_DISPATCH_CONCURRENCY`: jobs run in parallel by the worker loop

use alerter::{Alert, Operation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::backoff::{secs_to_duration, BackoffPolicy};
use crate::error::ConfigError;
use crate::scheduler::JobSpec;

const ENV_INCLUDE_TRACEBACK: &str = "ALERT_DISPATCH_INCLUDE_TRACEBACK";
const ENV_CHAIN_DELAY_SECS: &str = "ALERT_DISPATCH_CHAIN_DELAY_SECS";
const ENV_CONCURRENCY: &str = "ALERT_DISPATCH_CONCURRENCY";

/// Settings of one operation class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSettings {
    pub queue: String,
    pub priority: u8,
    /// Countdown before a freshly scheduled job runs
    #[serde(default)]
    pub delay_secs: f64,
    pub backoff: BackoffPolicy,
}

impl OperationSettings {
    #[must_use]
    pub fn spec(&self) -> JobSpec {
        JobSpec {
            queue: self.queue.clone(),
            priority: self.priority,
            policy: self.backoff.clone(),
        }
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        secs_to_duration(self.delay_secs)
    }

    fn apply(&mut self, over: &SettingsOverride) {
        if let Some(queue) = &over.queue {
            self.queue.clone_from(queue);
        }
        if let Some(priority) = over.priority {
            self.priority = priority;
        }
        if let Some(delay) = over.delay_secs {
            self.delay_secs = delay;
        }
        if let Some(backoff) = &over.backoff {
            backoff.apply(&mut self.backoff);
        }
    }

    fn validate(&self, operation: Operation, scope: &str) -> Result<(), ConfigError> {
        if self.queue.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{scope}.{operation}: queue must not be empty"
            )));
        }
        if !self.delay_secs.is_finite() || self.delay_secs < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "{scope}.{operation}: delay_secs must be a finite, non-negative number"
            )));
        }
        self.backoff
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("{scope}.{operation}.backoff: {e}")))
    }
}

/// Default settings for each operation class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationTable {
    pub new_event: OperationSettings,
    pub recovery: OperationSettings,
    pub repeat: OperationSettings,
    pub action: OperationSettings,
}

impl OperationTable {
    #[must_use]
    pub fn get(&self, operation: Operation) -> &OperationSettings {
        match operation {
            Operation::NewEvent => &self.new_event,
            Operation::Recovery => &self.recovery,
            Operation::Repeat => &self.repeat,
            Operation::Action => &self.action,
        }
    }
}

impl Default for OperationTable {
    fn default() -> Self {
        let alerts = OperationSettings {
            queue: "alerts".to_string(),
            priority: 5,
            delay_secs: 0.0,
            backoff: BackoffPolicy::default(),
        };
        Self {
            new_event: alerts.clone(),
            recovery: alerts,
            repeat: OperationSettings {
                queue: "repeats".to_string(),
                priority: 3,
                delay_secs: 0.0,
                backoff: BackoffPolicy {
                    max_retries: 2,
                    exponential: false,
                    first_interval: 2.0,
                    step: 5.0,
                    max_interval: 10.0,
                    jitter: false,
                },
            },
            action: OperationSettings {
                queue: "actions".to_string(),
                priority: 7,
                delay_secs: 0.0,
                backoff: BackoffPolicy {
                    max_retries: 3,
                    exponential: true,
                    first_interval: 5.0,
                    step: 5.0,
                    max_interval: 120.0,
                    jitter: false,
                },
            },
        }
    }
}

/// Partial backoff policy; unset fields keep the inherited value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffOverride {
    pub max_retries: Option<u32>,
    pub exponential: Option<bool>,
    pub first_interval: Option<f64>,
    pub step: Option<f64>,
    pub max_interval: Option<f64>,
    pub jitter: Option<bool>,
}

impl BackoffOverride {
    fn apply(&self, policy: &mut BackoffPolicy) {
        if let Some(v) = self.max_retries {
            policy.max_retries = v;
        }
        if let Some(v) = self.exponential {
            policy.exponential = v;
        }
        if let Some(v) = self.first_interval {
            policy.first_interval = v;
        }
        if let Some(v) = self.step {
            policy.step = v;
        }
        if let Some(v) = self.max_interval {
            policy.max_interval = v;
        }
        if let Some(v) = self.jitter {
            policy.jitter = v;
        }
    }
}

/// Partial operation settings; unset fields keep the inherited value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsOverride {
    pub queue: Option<String>,
    pub priority: Option<u8>,
    pub delay_secs: Option<f64>,
    pub backoff: Option<BackoffOverride>,
}

/// Overrides for one alerter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlerterOverrides {
    pub new_event: Option<SettingsOverride>,
    pub recovery: Option<SettingsOverride>,
    pub repeat: Option<SettingsOverride>,
    pub action: Option<SettingsOverride>,
}

impl AlerterOverrides {
    #[must_use]
    pub fn get(&self, operation: Operation) -> Option<&SettingsOverride> {
        match operation {
            Operation::NewEvent => self.new_event.as_ref(),
            Operation::Recovery => self.recovery.as_ref(),
            Operation::Repeat => self.repeat.as_ref(),
            Operation::Action => self.action.as_ref(),
        }
    }
}

/// Supplies per-operation settings for an (alert, alerter) pair.
///
/// [`DispatchConfig`] resolves per alerter; a richer implementation can
/// resolve per alert as well.
pub trait ConfigSource: Send + Sync {
    fn settings(&self, alert: &Alert, alerter: &str, operation: Operation) -> OperationSettings;

    /// Store the full error chain on fatal failures.
    fn include_traceback(&self) -> bool;

    /// Delay before a chained follow-up runs.
    fn chain_delay(&self) -> Duration;
}

/// Top-level dispatch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub include_traceback: bool,
    pub chain_delay_secs: f64,
    pub concurrency: usize,
    pub operations: OperationTable,
    pub alerters: BTreeMap<String, AlerterOverrides>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            include_traceback: false,
            chain_delay_secs: 2.0,
            concurrency: 16,
            operations: OperationTable::default(),
            alerters: BTreeMap::new(),
        }
    }
}

impl DispatchConfig {
    /// Parse YAML, apply environment overrides and validate.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded dispatch configuration");
        Self::from_yaml(&yaml)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn invalid(key: &str, value: &str) -> ConfigError {
            ConfigError::Env {
                key: key.to_string(),
                value: value.to_string(),
            }
        }

        if let Some(v) = lookup(ENV_INCLUDE_TRACEBACK) {
            self.include_traceback = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => return Err(invalid(ENV_INCLUDE_TRACEBACK, &v)),
            };
        }
        if let Some(v) = lookup(ENV_CHAIN_DELAY_SECS) {
            self.chain_delay_secs = v
                .trim()
                .parse()
                .map_err(|_| invalid(ENV_CHAIN_DELAY_SECS, &v))?;
        }
        if let Some(v) = lookup(ENV_CONCURRENCY) {
            self.concurrency = v.trim().parse().map_err(|_| invalid(ENV_CONCURRENCY, &v))?;
        }
        Ok(())
    }

    /// Effective settings for an alerter, before any per-alert resolution.
    #[must_use]
    pub fn resolve(&self, alerter: &str, operation: Operation) -> OperationSettings {
        let mut settings = self.operations.get(operation).clone();
        if let Some(over) = self.alerters.get(alerter).and_then(|o| o.get(operation)) {
            settings.apply(over);
        }
        settings
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if !self.chain_delay_secs.is_finite() || self.chain_delay_secs < 0.0 {
            return Err(ConfigError::Invalid(
                "chain_delay_secs must be a finite, non-negative number".into(),
            ));
        }
        for operation in Operation::ALL {
            self.operations.get(operation).validate(operation, "operations")?;
            for alerter in self.alerters.keys() {
                self.resolve(alerter, operation)
                    .validate(operation, &format!("alerters.{alerter}"))?;
            }
        }
        Ok(())
    }
}

impl ConfigSource for DispatchConfig {
    fn settings(&self, _alert: &Alert, alerter: &str, operation: Operation) -> OperationSettings {
        self.resolve(alerter, operation)
    }

    fn include_traceback(&self) -> bool {
        self.include_traceback
    }

    fn chain_delay(&self) -> Duration {
        secs_to_duration(self.chain_delay_secs)
    }
}
