//! Scheduler façade over the job queue.
//!
//! The queue delivers at least once and passes the attempt number along with
//! the job. Revocation is best effort: a revoked job may still be delivered,
//! which is why every claim re-checks the pair's status.

use alerter::Operation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::error::SchedulerError;
use crate::status::PairKey;

/// Queue-level job identifier. Retries keep the id and bump the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Where and how a job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub queue: String,
    pub priority: u8,
    pub policy: BackoffPolicy,
}

/// One unit of work on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub operation: Operation,
    pub alert_id: String,
    pub alerter: String,
    /// Execution index of the operation record this job drives
    pub execution: u32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// 0 on first delivery, incremented on every retry
    #[serde(default)]
    pub attempt: u32,
    pub spec: JobSpec,
}

impl Job {
    #[must_use]
    pub fn pair(&self) -> PairKey {
        PairKey::new(&self.alert_id, &self.alerter)
    }

    /// The same job, one attempt later.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Submits, delays and revokes jobs on the durable queue.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Deliver `job` after `delay`. Returns the job id.
    async fn submit(&self, job: Job, delay: Duration) -> Result<JobId, SchedulerError>;

    /// Best-effort cancellation of a not-yet-delivered job.
    /// Returns whether a pending job was found.
    async fn revoke(&self, job_id: JobId) -> Result<bool, SchedulerError>;
}

/// Jobs delivered by a [`LocalScheduler`].
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<Job>,
    queued: Arc<AtomicUsize>,
}

impl JobReceiver {
    /// Next delivered job, or `None` once every scheduler handle is gone.
    pub async fn recv(&mut self) -> Option<Job> {
        let job = self.rx.recv().await?;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }
}

/// In-process scheduler: one timer task per submitted job.
///
/// Queues and priorities are carried on the job but not used for ordering;
/// delivery order is timer order.
#[derive(Clone)]
pub struct LocalScheduler {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<Mutex<HashMap<JobId, JoinHandle<()>>>>,
    /// Fired but not yet taken off the channel
    queued: Arc<AtomicUsize>,
}

impl LocalScheduler {
    #[must_use]
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                pending: Arc::new(Mutex::new(HashMap::new())),
                queued: Arc::clone(&queued),
            },
            JobReceiver { rx, queued },
        )
    }

    /// Jobs submitted but not yet taken by the receiver, whether still
    /// waiting on their delay or sitting in the channel.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let timers = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        timers.len() + self.queued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn submit(&self, job: Job, delay: Duration) -> Result<JobId, SchedulerError> {
        if self.tx.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let id = job.id;
        debug!(
            job_id = %id,
            operation = %job.operation,
            queue = %job.spec.queue,
            priority = job.spec.priority,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            "Job submitted"
        );

        // Held across spawn so the timer task cannot remove its entry before it exists.
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = self.tx.clone();
        let registry = Arc::clone(&self.pending);
        let queued = Arc::clone(&self.queued);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                // Moved under the lock so the pending count never dips.
                let mut timers = registry.lock().unwrap_or_else(PoisonError::into_inner);
                timers.remove(&id);
                queued.fetch_add(1, Ordering::SeqCst);
            }
            if tx.send(job).is_err() {
                queued.fetch_sub(1, Ordering::SeqCst);
                warn!(job_id = %id, "Job receiver dropped, job lost");
            }
        });
        if let Some(previous) = pending.insert(id, handle) {
            // A retry of a job whose earlier timer never fired.
            previous.abort();
        }

        Ok(id)
    }

    async fn revoke(&self, job_id: JobId) -> Result<bool, SchedulerError> {
        let handle = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
        match handle {
            Some(handle) => {
                handle.abort();
                debug!(job_id = %job_id, "Job revoked");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
