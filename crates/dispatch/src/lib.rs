//! Per-alert, per-alerter operation dispatch.
//!
//! Every (alert, alerter) pair moves through a small state machine driven by
//! four operations: new event, recovery, repeat and action. Triggers go
//! through [`Dispatcher::schedule`], which consults the pair's status and
//! either submits a job, chains onto the running one, or ignores the trigger.
//! Jobs come back through [`Dispatcher::run_job`], which claims the pair,
//! calls the [`alerter::Alerter`] and settles the status.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use alerter::{Alert, AlerterRegistry, LogAlerter, Operation};
//! use dispatch::{DispatchConfig, Dispatcher, LocalScheduler, MemoryAlerts, MemoryStore, ScheduleRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), dispatch::DispatchError> {
//! let alerts = Arc::new(MemoryAlerts::new());
//! alerts.upsert(Alert::open("disk-full", "disk usage above 95%")).await;
//!
//! let (scheduler, jobs) = LocalScheduler::new();
//! let dispatcher = Arc::new(Dispatcher::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(scheduler),
//!     alerts,
//!     AlerterRegistry::with_alerters(vec![Arc::new(LogAlerter::new("log"))]),
//!     Arc::new(DispatchConfig::default()),
//! ));
//! tokio::spawn(Arc::clone(&dispatcher).run_worker(jobs, 16, CancellationToken::new()));
//!
//! dispatcher
//!     .schedule(ScheduleRequest::new(Operation::NewEvent, "disk-full", "log", "opened"))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Guarantees
//!
//! - Exactly one job finalizes a pair into `Processed` or `Recovered` per cycle.
//! - A chained follow-up runs only after its predecessor succeeded; when the
//!   predecessor fails the follow-up is recorded as skipped.
//! - Redelivering a finished job changes nothing.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alerts;
pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
mod operations;
pub mod record;
pub mod scheduler;
pub mod status;
pub mod store;
mod task;

pub use alerts::{AlertSource, MemoryAlerts};
pub use backoff::BackoffPolicy;
pub use config::{ConfigSource, DispatchConfig, OperationSettings};
pub use dispatcher::{AlerterProgress, Dispatcher, ScheduleOutcome, ScheduleRequest};
pub use error::{ConfigError, DispatchError, Result, SchedulerError, StoreError};
pub use record::{ChainPayload, OperationRecord, RecordId};
pub use scheduler::{Job, JobId, JobReceiver, JobSpec, LocalScheduler, Scheduler};
pub use status::{PairKey, Status, StatusRecord};
pub use store::{MemoryStore, RecordUpdate, Store};
pub use task::JobReport;
