//! Shared fixtures: a scheduler that records instead of delivering, and
//! alerters whose answers are scripted per call.

#![allow(dead_code)]

use alerter::{Alert, Alerter, AlerterError, AlerterRegistry, Operation, OperationRequest, Outcome};
use async_trait::async_trait;
use dispatch::{
    DispatchConfig, Dispatcher, Job, JobId, JobReport, MemoryAlerts, MemoryStore, OperationRecord,
    PairKey, RecordId, ScheduleOutcome, ScheduleRequest, Scheduler, SchedulerError, Status, Store,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

// =============================================================================
// Recording scheduler
// =============================================================================

/// Keeps submitted jobs so a test can deliver them one at a time.
#[derive(Default)]
pub struct RecordingScheduler {
    submitted: Mutex<VecDeque<(Job, Duration)>>,
    revoked: Mutex<Vec<JobId>>,
    refuse: Mutex<u32>,
}

impl RecordingScheduler {
    /// Oldest submission not yet taken.
    pub fn next(&self) -> Option<(Job, Duration)> {
        self.submitted.lock().unwrap().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn revoked(&self) -> Vec<JobId> {
        self.revoked.lock().unwrap().clone()
    }

    /// Make the next `count` submissions fail.
    pub fn refuse_next(&self, count: u32) {
        *self.refuse.lock().unwrap() = count;
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn submit(&self, job: Job, delay: Duration) -> Result<JobId, SchedulerError> {
        {
            let mut refuse = self.refuse.lock().unwrap();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(SchedulerError::Submit("queue unavailable".into()));
            }
        }
        let id = job.id;
        self.submitted.lock().unwrap().push_back((job, delay));
        Ok(id)
    }

    async fn revoke(&self, job_id: JobId) -> Result<bool, SchedulerError> {
        self.revoked.lock().unwrap().push(job_id);
        let mut submitted = self.submitted.lock().unwrap();
        let before = submitted.len();
        submitted.retain(|(job, _)| job.id != job_id);
        Ok(submitted.len() != before)
    }
}

// =============================================================================
// Scripted alerter
// =============================================================================

/// Answer of one alerter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeed,
    /// `Ok` with `success == false`
    Report,
    Retryable,
    /// Rate limited, asking for the given number of seconds
    Throttled(u64),
    Fatal,
}

/// Pauses a call until the test releases it.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Alerter that answers from a script and records every call.
/// Calls beyond the script succeed.
pub struct ScriptedAlerter {
    name: String,
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<(Operation, u32, String)>>,
    gate: Option<Arc<Gate>>,
}

impl ScriptedAlerter {
    pub fn new(name: &str, script: &[Step]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.iter().copied().collect()),
            calls: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    pub fn gated(name: &str, script: &[Step]) -> (Arc<Self>, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        let alerter = Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.iter().copied().collect()),
            calls: Mutex::new(Vec::new()),
            gate: Some(Arc::clone(&gate)),
        });
        (alerter, gate)
    }

    /// (operation, attempt, reason) of every call so far.
    pub fn calls(&self) -> Vec<(Operation, u32, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _, _)| *op == operation)
            .count()
    }

    async fn answer(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        self.calls.lock().unwrap().push((
            request.operation,
            request.attempt,
            request.reason.clone(),
        ));
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => Ok(Outcome::success(json!({ "sent": true }))),
            Step::Report => Ok(Outcome::failure(json!({ "sent": false }))),
            Step::Retryable => Err(AlerterError::Connection("connection refused".into())),
            Step::Throttled(secs) => Err(AlerterError::RateLimited {
                retry_after_secs: secs,
            }),
            Step::Fatal => Err(AlerterError::Rejected("401 unauthorized".into())),
        }
    }
}

#[async_trait]
impl Alerter for ScriptedAlerter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_event(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        self.answer(request).await
    }

    async fn recovery(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        self.answer(request).await
    }

    async fn repeat(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        self.answer(request).await
    }

    async fn action(&self, request: &OperationRequest) -> Result<Outcome, AlerterError> {
        self.answer(request).await
    }
}

// =============================================================================
// Harness
// =============================================================================

pub const ALERT: &str = "disk-full";

pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<MemoryStore>,
    pub scheduler: Arc<RecordingScheduler>,
    pub alerts: Arc<MemoryAlerts>,
}

impl Harness {
    pub async fn new(alerters: &[Arc<ScriptedAlerter>]) -> Self {
        Self::with_config(alerters, DispatchConfig::default()).await
    }

    pub async fn with_config(alerters: &[Arc<ScriptedAlerter>], config: DispatchConfig) -> Self {
        let alerters = alerters
            .iter()
            .map(|a| a.clone() as Arc<dyn Alerter>)
            .collect();
        Self::build(alerters, config).await
    }

    pub async fn build(alerters: Vec<Arc<dyn Alerter>>, config: DispatchConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let alerts = Arc::new(MemoryAlerts::new());
        alerts
            .upsert(Alert::open(ALERT, "disk usage above 95%"))
            .await;

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            scheduler.clone(),
            alerts.clone(),
            AlerterRegistry::with_alerters(alerters),
            Arc::new(config),
        ));
        Self {
            dispatcher,
            store,
            scheduler,
            alerts,
        }
    }

    pub async fn trigger(&self, operation: Operation, alerter: &str, text: &str) -> ScheduleOutcome {
        self.dispatcher
            .schedule(ScheduleRequest::new(operation, ALERT, alerter, text))
            .await
            .unwrap()
    }

    pub async fn action(&self, alerter: &str, action: &str) -> ScheduleOutcome {
        self.dispatcher
            .schedule(
                ScheduleRequest::new(Operation::Action, ALERT, alerter, "operator").with_action(action),
            )
            .await
            .unwrap()
    }

    /// Take the oldest submitted job; panics if there is none.
    pub fn next_job(&self) -> (Job, Duration) {
        self.scheduler.next().expect("a submitted job")
    }

    /// Deliver the oldest submitted job.
    pub async fn run_next(&self) -> JobReport {
        let (job, _) = self.next_job();
        self.dispatcher.run_job(job).await.unwrap()
    }

    pub async fn status(&self, alerter: &str) -> Status {
        self.dispatcher.status(ALERT, alerter).await.unwrap()
    }

    pub async fn record(&self, alerter: &str, operation: Operation, execution: u32) -> OperationRecord {
        let key = PairKey::new(ALERT, alerter);
        self.store
            .operation(&RecordId::new(&key, operation, execution))
            .await
            .unwrap()
            .expect("operation record")
    }

    pub async fn repeat_count(&self, alerter: &str) -> u32 {
        self.store
            .status(&PairKey::new(ALERT, alerter))
            .await
            .unwrap()
            .map_or(0, |s| s.repeat_count)
    }

    /// Run New-Event to completion so the pair sits in `Processed`.
    pub async fn processed(&self, alerter: &str) {
        self.trigger(Operation::NewEvent, alerter, "opened").await;
        let report = self.run_next().await;
        assert_eq!(report, JobReport::Succeeded { chained: None });
        assert_eq!(self.status(alerter).await, Status::Processed);
    }
}
