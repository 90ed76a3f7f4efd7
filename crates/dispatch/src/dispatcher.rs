//! Trigger handling and the worker loop.

use alerter::{AlerterRegistry, Operation};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::alerts::AlertSource;
use crate::config::{ConfigSource, OperationSettings};
use crate::error::{DispatchError, Result};
use crate::record::{ChainPayload, OperationRecord, RecordId};
use crate::scheduler::{Job, JobId, JobReceiver, JobSpec, Scheduler};
use crate::status::{PairKey, Status, StatusRecord};
use crate::store::Store;
use crate::task::CLAIM_ROUNDS;

/// A trigger: run `operation` for one alert on one alerter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub operation: Operation,
    pub alert_id: String,
    pub alerter: String,
    /// Free text describing why the trigger fired
    pub text: String,
    /// Action name, for [`Operation::Action`]
    pub action: Option<String>,
}

impl ScheduleRequest {
    #[must_use]
    pub fn new(
        operation: Operation,
        alert_id: impl Into<String>,
        alerter: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            alert_id: alert_id.into(),
            alerter: alerter.into(),
            text: text.into(),
            action: None,
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    fn chain(&self, spec: JobSpec) -> ChainPayload {
        ChainPayload {
            text: self.text.clone(),
            operation: self.operation,
            action: self.action.clone(),
            spec,
        }
    }
}

/// What a trigger turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A job was put on the queue.
    Submitted(JobId),
    /// Attached to the in-flight operation; runs when it finishes.
    Chained(Operation),
    /// Absorbed by the not-yet-started New-Event, which will record the recovery.
    Deferred,
    /// Nothing to do in the current status.
    Ignored(&'static str),
}

/// Where one alerter stands for an alert.
#[derive(Debug, Clone, Serialize)]
pub struct AlerterProgress {
    pub alerter: String,
    pub status: Status,
    pub repeat_count: u32,
    /// Latest record of each operation
    pub latest: BTreeMap<Operation, OperationRecord>,
}

/// Drives every (alert, alerter) pair through its operations.
///
/// All state lives in the [`Store`]; any number of dispatchers, in one
/// process or several, can serve the same pairs as long as they share it.
pub struct Dispatcher {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) alerts: Arc<dyn AlertSource>,
    pub(crate) alerters: AlerterRegistry,
    pub(crate) config: Arc<dyn ConfigSource>,
    running: AtomicUsize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Arc<dyn Scheduler>,
        alerts: Arc<dyn AlertSource>,
        alerters: AlerterRegistry,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            store,
            scheduler,
            alerts,
            alerters,
            config,
            running: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn alerters(&self) -> &AlerterRegistry {
        &self.alerters
    }

    /// Jobs taken by [`Dispatcher::run_worker`] and not yet finished,
    /// including those waiting for a free slot.
    #[must_use]
    pub fn running_jobs(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Apply a trigger to the pair's status and submit, chain or drop it.
    ///
    /// Never blocks on the alerter. A lost compare-and-set re-evaluates
    /// against the fresh status.
    #[instrument(
        skip(self, request),
        fields(
            alert_id = %request.alert_id,
            alerter = %request.alerter,
            operation = %request.operation,
        )
    )]
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduleOutcome> {
        if self.alerters.get(&request.alerter).is_none() {
            return Err(DispatchError::UnknownAlerter(request.alerter));
        }
        let alert = self
            .alerts
            .alert(&request.alert_id)
            .await?
            .ok_or_else(|| DispatchError::AlertNotFound(request.alert_id.clone()))?;
        let settings = self
            .config
            .settings(&alert, &request.alerter, request.operation);
        let key = PairKey::new(&request.alert_id, &request.alerter);

        for _ in 0..CLAIM_ROUNDS {
            let status = self.current_status(&key).await?;
            if let Some(outcome) = self.try_schedule(&key, &request, &settings, status).await? {
                match &outcome {
                    ScheduleOutcome::Ignored(reason) => {
                        debug!(%status, reason, "Trigger ignored");
                    }
                    outcome => info!(%status, ?outcome, "Trigger scheduled"),
                }
                return Ok(outcome);
            }
            debug!(%status, "Status changed while scheduling, re-evaluating");
        }
        Err(DispatchError::Contention {
            pair: key.to_string(),
            attempts: CLAIM_ROUNDS,
        })
    }

    /// One evaluation of the schedule rules. `None` means a compare-and-set
    /// was lost.
    async fn try_schedule(
        &self,
        key: &PairKey,
        request: &ScheduleRequest,
        settings: &OperationSettings,
        status: Status,
    ) -> Result<Option<ScheduleOutcome>> {
        let operation = request.operation;
        let submit = || {
            self.enqueue(
                key,
                &request.text,
                operation,
                request.action.clone(),
                settings.spec(),
                settings.delay(),
            )
        };

        let outcome = match (operation, status) {
            (Operation::NewEvent, Status::New) => {
                if !self.store.transition(key, status, Status::Scheduled).await? {
                    return Ok(None);
                }
                self.submitted(key, Status::Scheduled, status, submit().await)
                    .await?
            }
            (Operation::NewEvent, Status::Recovered) => {
                // Re-opened alert: a fresh cycle.
                self.store.clear(key).await?;
                if !self.store.transition(key, Status::New, Status::Scheduled).await? {
                    return Ok(None);
                }
                self.submitted(key, Status::Scheduled, Status::New, submit().await)
                    .await?
            }
            (Operation::NewEvent, _) => ScheduleOutcome::Ignored("already dispatched"),

            (Operation::Recovery, Status::Scheduled) => {
                if !self.store.transition(key, status, Status::Recovering).await? {
                    return Ok(None);
                }
                let id = RecordId::new(key, Operation::NewEvent, 0);
                let chain = request.chain(settings.spec());
                self.store
                    .update_operation(
                        &id,
                        Box::new(move |record| {
                            if !record.is_finished() {
                                record.chain = Some(chain);
                            }
                        }),
                    )
                    .await?;
                ScheduleOutcome::Deferred
            }
            (Operation::Recovery, Status::Processing | Status::Repeating | Status::Actioning) => {
                if !self.store.transition(key, status, Status::Recovering).await? {
                    return Ok(None);
                }
                self.divert(key, request, settings).await?
            }
            (Operation::Recovery, Status::Processed) => {
                if !self.store.transition(key, status, Status::Recovering).await? {
                    return Ok(None);
                }
                self.submitted(key, Status::Recovering, status, submit().await)
                    .await?
            }
            (Operation::Recovery, _) => ScheduleOutcome::Ignored("nothing to recover"),

            (Operation::Repeat, Status::Processed) => {
                if !self.store.transition(key, status, Status::Repeating).await? {
                    return Ok(None);
                }
                self.submitted(key, Status::Repeating, status, submit().await)
                    .await?
            }
            (Operation::Repeat, _) => ScheduleOutcome::Ignored("pair not idle"),

            (Operation::Action, Status::Processed) => {
                if !self.store.transition(key, status, Status::Actioning).await? {
                    return Ok(None);
                }
                self.submitted(key, Status::Actioning, status, submit().await)
                    .await?
            }
            (Operation::Action, Status::Processing | Status::Repeating) => {
                if !self.store.transition(key, status, Status::Actioning).await? {
                    return Ok(None);
                }
                self.divert(key, request, settings).await?
            }
            (Operation::Action, Status::Actioning) => {
                self.divert(key, request, settings).await?
            }
            (Operation::Action, _) => ScheduleOutcome::Ignored("pair not active"),
        };
        Ok(Some(outcome))
    }

    /// Route a trigger around the operation in flight.
    ///
    /// A Repeat or Action that has not started yet is revoked and skipped and
    /// the trigger submitted directly. Otherwise the trigger rides along as the
    /// in-flight record's chain, or is submitted directly if that record
    /// finished in the meantime. A direct submit that fails leaves the pair
    /// processed, as nothing else is in flight then.
    async fn divert(
        &self,
        key: &PairKey,
        request: &ScheduleRequest,
        settings: &OperationSettings,
    ) -> Result<ScheduleOutcome> {
        let claimed = Status::running(request.operation);
        let direct = || async move {
            let job = self
                .enqueue(
                    key,
                    &request.text,
                    request.operation,
                    request.action.clone(),
                    settings.spec(),
                    settings.delay(),
                )
                .await;
            self.submitted(key, claimed, Status::Processed, job).await
        };
        let Some(record) = self.active_record(key).await? else {
            return direct().await;
        };
        let running = record.id.operation;

        let may_supersede = !matches!(
            (running, request.operation),
            (Operation::NewEvent, _) | (Operation::Action, Operation::Action)
        );
        if may_supersede {
            let mut superseded = false;
            let mut dropped = None;
            let response = json!({ "message": format!("superseded by {}", request.operation) });
            self.store
                .update_operation(
                    &record.id,
                    Box::new(|current| {
                        if current.started_at.is_none() && !current.is_finished() {
                            current.finish(false, true, response.clone(), None);
                            dropped = current.chain.take();
                            superseded = true;
                        }
                    }),
                )
                .await?;
            if superseded {
                if let Some(job_id) = record.job_id {
                    let revoked = self.scheduler.revoke(job_id).await?;
                    debug!(%job_id, revoked, "Pending {running} superseded");
                }
                if let Some(chain) = dropped {
                    let follow_up = chain.operation;
                    let execution = self.next_execution(key, follow_up).await?;
                    let skipped = OperationRecord::skipped(
                        RecordId::new(key, follow_up, execution),
                        chain.text,
                        response,
                    )
                    .with_action(chain.action);
                    self.store.put_operation(skipped).await?;
                    debug!(%follow_up, "Follow-up of superseded {running} skipped");
                }
                return direct().await;
            }
        }

        let chain = request.chain(settings.spec());
        let mut attached = false;
        let mut busy = false;
        self.store
            .update_operation(
                &record.id,
                Box::new(|current| {
                    if current.is_finished() {
                        return;
                    }
                    // A recovery replaces a pending action, never the other way round.
                    busy = current.chain.as_ref().is_some_and(|existing| {
                        existing.operation == Operation::Recovery
                            || chain.operation != Operation::Recovery
                    });
                    if !busy {
                        current.chain = Some(chain);
                        attached = true;
                    }
                }),
            )
            .await?;

        if attached {
            Ok(ScheduleOutcome::Chained(running))
        } else if busy {
            Ok(ScheduleOutcome::Ignored("follow-up already pending"))
        } else {
            direct().await
        }
    }

    /// The unfinished record of a pair, i.e. the one whose job is in flight.
    async fn active_record(&self, key: &PairKey) -> Result<Option<OperationRecord>> {
        Ok(self
            .store
            .operations(key)
            .await?
            .into_iter()
            .filter(|record| !record.is_finished())
            .max_by_key(|record| record.received_at))
    }

    /// Write a received record for a new job and put the job on the queue.
    pub(crate) async fn enqueue(
        &self,
        key: &PairKey,
        text: &str,
        operation: Operation,
        action: Option<String>,
        spec: JobSpec,
        delay: Duration,
    ) -> Result<JobId> {
        let execution = self.next_execution(key, operation).await?;
        let job = Job {
            id: JobId::new(),
            operation,
            alert_id: key.alert_id.clone(),
            alerter: key.alerter.clone(),
            execution,
            text: text.to_string(),
            action: action.clone(),
            attempt: 0,
            spec,
        };
        let id = RecordId::new(key, operation, execution);
        let record = OperationRecord::received(id.clone(), job.id, text).with_action(action);
        self.store.put_operation(record).await?;

        match self.scheduler.submit(job, delay).await {
            Ok(job_id) => Ok(job_id),
            Err(error) => {
                let reason = error.to_string();
                let response = json!({ "error": reason });
                self.store
                    .update_operation(
                        &id,
                        Box::new(move |record| record.finish(false, false, response, Some(reason))),
                    )
                    .await?;
                Err(error.into())
            }
        }
    }

    /// Outcome of a submit made after moving the pair from `restore` to
    /// `claimed`. A failed submit moves the pair back so a later trigger can
    /// start over.
    async fn submitted(
        &self,
        key: &PairKey,
        claimed: Status,
        restore: Status,
        job: Result<JobId>,
    ) -> Result<ScheduleOutcome> {
        let error = match job {
            Ok(job_id) => return Ok(ScheduleOutcome::Submitted(job_id)),
            Err(error) => error,
        };
        match self.store.transition(key, claimed, restore).await {
            Ok(true) => {
                warn!(%error, from = %claimed, to = %restore, "Submit failed, status rolled back");
            }
            Ok(false) => warn!(%error, "Submit failed, status already moved on"),
            Err(store_error) => {
                error!(%error, %store_error, "Submit failed and status rollback failed");
            }
        }
        Err(error)
    }

    /// Execution index for a new record of `operation`.
    pub(crate) async fn next_execution(&self, key: &PairKey, operation: Operation) -> Result<u32> {
        if !operation.keeps_history() {
            return Ok(0);
        }
        Ok(self
            .store
            .latest_operation(key, operation)
            .await?
            .map_or(1, |record| record.id.execution + 1))
    }

    pub(crate) async fn current_status(&self, key: &PairKey) -> Result<Status> {
        Ok(self
            .store
            .status(key)
            .await?
            .map(|record| record.status)
            .unwrap_or_default())
    }

    /// Current status of a pair; `New` if it was never touched.
    pub async fn status(&self, alert_id: &str, alerter: &str) -> Result<Status> {
        self.current_status(&PairKey::new(alert_id, alerter)).await
    }

    /// Every operation record of a pair.
    pub async fn operations(&self, alert_id: &str, alerter: &str) -> Result<Vec<OperationRecord>> {
        Ok(self
            .store
            .operations(&PairKey::new(alert_id, alerter))
            .await?)
    }

    /// Status and latest records of an alert on every registered alerter.
    pub async fn progress(&self, alert_id: &str) -> Result<Vec<AlerterProgress>> {
        let mut progress = Vec::with_capacity(self.alerters.len());
        for alerter in self.alerters.names() {
            let key = PairKey::new(alert_id, &alerter);
            let StatusRecord {
                status,
                repeat_count,
                ..
            } = self
                .store
                .status(&key)
                .await?
                .unwrap_or_else(|| StatusRecord::new(Status::New));
            let mut latest = BTreeMap::new();
            for record in self.store.operations(&key).await? {
                // Records come ordered by execution, so the last one wins.
                latest.insert(record.id.operation, record);
            }
            progress.push(AlerterProgress {
                alerter,
                status,
                repeat_count,
                latest,
            });
        }
        Ok(progress)
    }

    /// Forget a pair entirely, e.g. when the alert is deleted.
    pub async fn clear(&self, alert_id: &str, alerter: &str) -> Result<()> {
        let key = PairKey::new(alert_id, alerter);
        self.store.clear(&key).await?;
        info!(pair = %key, "Pair cleared");
        Ok(())
    }

    /// Pull jobs from `jobs` and run up to `concurrency` at once until the
    /// receiver closes or `shutdown` fires, then wait for running jobs.
    pub async fn run_worker(
        self: Arc<Self>,
        mut jobs: JobReceiver,
        concurrency: usize,
        shutdown: CancellationToken,
    ) {
        let concurrency = concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        info!(concurrency, "Dispatch worker started");

        loop {
            let job = tokio::select! {
                () = shutdown.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            // Counted while it waits for a permit too.
            self.running.fetch_add(1, Ordering::SeqCst);
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                self.running.fetch_sub(1, Ordering::SeqCst);
                break;
            };

            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                let job_id = job.id;
                if let Err(e) = dispatcher.run_job(job).await {
                    error!(%job_id, error = %e, "Job run failed");
                }
                dispatcher.running.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        if let Ok(all) = permits.acquire_many(concurrency as u32).await {
            drop(all);
        }
        info!("Dispatch worker stopped");
    }
}
