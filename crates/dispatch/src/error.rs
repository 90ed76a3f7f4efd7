//! Error types for the dispatch core.

use thiserror::Error;

/// Errors raised by a [`Store`](crate::store::Store) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unavailable or failed
    #[error("store backend failed: {0}")]
    Backend(String),
}

/// Errors raised by a [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The queue no longer accepts jobs
    #[error("scheduler is closed")]
    Closed,

    /// The queue rejected the job
    #[error("submit failed: {0}")]
    Submit(String),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {key}: {value}")]
    Env { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("alert not found: {0}")]
    AlertNotFound(String),

    #[error("unknown alerter: {0}")]
    UnknownAlerter(String),

    /// Status kept changing under the dispatcher
    #[error("status of {pair} changed concurrently {attempts} times, giving up")]
    Contention { pair: String, attempts: usize },
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
