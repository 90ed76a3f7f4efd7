//! The job template: one run of one operation for one pair.
//!
//! Every operation goes through the same steps. Check the delivery is fresh,
//! claim the pair, mark the record started, call the alerter, then finalize.
//! The per-operation differences live in [`crate::operations`].

use alerter::{Alert, AlerterError, Operation, OperationRequest};
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::operations::{self, Abort, Claim, Next};
use crate::record::{ChainPayload, OperationRecord, RecordId};
use crate::scheduler::{Job, JobId};
use crate::status::{PairKey, Status};

/// Times a claim re-reads the status after losing a compare-and-set.
pub(crate) const CLAIM_ROUNDS: usize = 5;

const RECOVERED_BEFORE_ALERTING: &str = "recovered before alerting";

/// How a job run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobReport {
    /// Nothing was written: stale delivery, superseded record or duplicate.
    Dropped(&'static str),
    /// The operation was abandoned in favor of another and recorded as skipped.
    Skipped { handed_to: Option<Operation> },
    Succeeded { chained: Option<Operation> },
    Failed { dropped: Option<Operation> },
    RetryScheduled { attempt: u32, delay: Duration },
}

/// Identity of the job being run.
pub(crate) struct JobContext<'a> {
    pub job: &'a Job,
    pub key: PairKey,
    pub record_id: RecordId,
}

impl<'a> JobContext<'a> {
    fn new(job: &'a Job) -> Self {
        let key = job.pair();
        let record_id = RecordId::new(&key, job.operation, job.execution);
        Self {
            job,
            key,
            record_id,
        }
    }

    fn operation(&self) -> Operation {
        self.job.operation
    }
}

struct Failure {
    reason: String,
    response: Value,
}

impl Failure {
    fn fatal(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            response: json!({ "error": reason }),
            reason,
        }
    }

    fn reported(payload: Value) -> Self {
        Self {
            reason: "alerter reported failure".to_string(),
            response: payload,
        }
    }

    fn raised(error: &AlerterError, note: Option<&str>, include_traceback: bool) -> Self {
        let reason = match note {
            Some(note) => format!("{error} ({note})"),
            None => error.to_string(),
        };
        let mut response = json!({
            "error": reason,
            "retryable": error.is_retryable(),
        });
        if include_traceback {
            response["traceback"] = json!(traceback(error));
        }
        Self { reason, response }
    }
}

fn traceback(error: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut frames = vec![format!("{error:?}")];
    let mut source = error.source();
    while let Some(cause) = source {
        frames.push(cause.to_string());
        source = cause.source();
    }
    frames
}

impl Dispatcher {
    /// Run one delivered job to completion.
    ///
    /// Safe to call again with the same job: a redelivery of finished work is
    /// dropped without writes. Errors are store or scheduler failures; alerter
    /// failures end up on the operation record instead.
    #[instrument(
        skip(self, job),
        fields(
            job_id = %job.id,
            alert_id = %job.alert_id,
            alerter = %job.alerter,
            operation = %job.operation,
            attempt = job.attempt,
        )
    )]
    pub async fn run_job(&self, job: Job) -> Result<JobReport> {
        let ctx = JobContext::new(&job);

        let Some(record) = self.store.operation(&ctx.record_id).await? else {
            debug!("Operation record gone, dropping delivery");
            return Ok(JobReport::Dropped("record missing"));
        };
        if record.job_id != Some(job.id) {
            debug!("Record owned by another job, dropping delivery");
            return Ok(JobReport::Dropped("superseded"));
        }
        if record.is_finished() {
            debug!("Operation already finished, dropping delivery");
            return Ok(JobReport::Dropped("already finished"));
        }
        if job.attempt < record.retries {
            debug!(retries = record.retries, "Stale attempt, dropping delivery");
            return Ok(JobReport::Dropped("stale attempt"));
        }
        let redelivery = job.attempt > 0;

        match self.claim(&ctx, redelivery).await? {
            Ok(status) => debug!(%status, redelivery, "Pair claimed"),
            Err((status, abort)) => return self.abort(&ctx, status, abort).await,
        }

        if let Some(reason) = self.mark_started(&ctx).await? {
            debug!(reason, "Start refused, dropping delivery");
            return Ok(JobReport::Dropped(reason));
        }

        let Some(alert) = self.alerts.alert(&job.alert_id).await? else {
            warn!("Alert vanished before execution");
            return self
                .fail(&ctx, Failure::fatal(format!("alert not found: {}", job.alert_id)))
                .await;
        };
        let Some(alerter) = self.alerters.get(&job.alerter) else {
            warn!("Alerter no longer registered");
            return self
                .fail(&ctx, Failure::fatal(format!("unknown alerter: {}", job.alerter)))
                .await;
        };

        let request = OperationRequest {
            operation: job.operation,
            alert: alert.clone(),
            reason: job.text.clone(),
            action: job.action.clone(),
            attempt: job.attempt,
        };
        match alerter.execute(&request).await {
            Ok(outcome) if outcome.success => self.succeed(&ctx, outcome.payload).await,
            Ok(outcome) => {
                info!("Alerter reported failure");
                self.fail(&ctx, Failure::reported(outcome.payload)).await
            }
            Err(error) if error.is_retryable() => self.retry_or_fail(&ctx, &alert, &error).await,
            Err(error) => {
                warn!(%error, "Alerter failed");
                let failure = Failure::raised(&error, None, self.config.include_traceback());
                self.fail(&ctx, failure).await
            }
        }
    }

    /// Move the pair into the operation's running status. `Err` carries the
    /// observed status and the reason to stop.
    async fn claim(
        &self,
        ctx: &JobContext<'_>,
        redelivery: bool,
    ) -> Result<std::result::Result<Status, (Status, Abort)>> {
        for _ in 0..CLAIM_ROUNDS {
            let status = self.current_status(&ctx.key).await?;
            match operations::claim(ctx.operation(), status, redelivery) {
                Claim::Proceed(next) if next == status => return Ok(Ok(next)),
                Claim::Proceed(next) => {
                    if self.store.transition(&ctx.key, status, next).await? {
                        return Ok(Ok(next));
                    }
                    debug!(%status, "Lost claim race, re-reading status");
                }
                Claim::Abort(abort) => return Ok(Err((status, abort))),
            }
        }
        Err(DispatchError::Contention {
            pair: ctx.key.to_string(),
            attempts: CLAIM_ROUNDS,
        })
    }

    /// Stamp start metadata and take the attempt. Returns why the start was
    /// refused: the record was finished or handed to another job, or another
    /// delivery of this attempt already started it.
    async fn mark_started(&self, ctx: &JobContext<'_>) -> Result<Option<&'static str>> {
        let job_id = ctx.job.id;
        let attempt = ctx.job.attempt;
        let repeat_start = ctx.operation() == Operation::Repeat && attempt == 0;
        let now = Utc::now();
        let mut refused = None;
        let mut first_start = false;

        let updated = self
            .store
            .update_operation(
                &ctx.record_id,
                Box::new(|record| {
                    if record.is_finished() || record.job_id != Some(job_id) {
                        refused = Some("superseded before start");
                        return;
                    }
                    if record.attempt_started.is_some_and(|taken| taken >= attempt) {
                        refused = Some("attempt already started");
                        return;
                    }
                    first_start = record.started_at.is_none();
                    if repeat_start && first_start {
                        record.reset_terminal();
                    }
                    record.received_at.get_or_insert(now);
                    record.started_at.get_or_insert(now);
                    record.attempt_started = Some(attempt);
                }),
            )
            .await?;
        if updated.is_none() {
            return Ok(Some("record missing"));
        }
        if refused.is_some() {
            return Ok(refused);
        }

        if repeat_start && first_start {
            let repetition = self.store.increment_repeats(&ctx.key).await?;
            self.store
                .update_operation(
                    &ctx.record_id,
                    Box::new(move |record| record.repetition = Some(repetition)),
                )
                .await?;
            debug!(repetition, "Repetition counted");
        }
        Ok(None)
    }

    async fn abort(&self, ctx: &JobContext<'_>, status: Status, abort: Abort) -> Result<JobReport> {
        match abort {
            Abort::Duplicate => {
                debug!(%status, "Duplicate trigger, nothing to do");
                Ok(JobReport::Dropped("duplicate"))
            }
            Abort::RecoveredBeforeAlerting => {
                info!("Alert recovered before it was ever sent");
                let response = json!({ "message": RECOVERED_BEFORE_ALERTING });
                let finished = self
                    .finish_record(ctx, false, true, response.clone(), None)
                    .await?;
                let text = finished
                    .and_then(|record| record.chain)
                    .map_or_else(|| RECOVERED_BEFORE_ALERTING.to_string(), |chain| chain.text);
                self.store
                    .put_operation(OperationRecord::skipped(
                        RecordId::new(&ctx.key, Operation::Recovery, 0),
                        text,
                        response,
                    ))
                    .await?;
                self.settle(&ctx.key, Status::Recovering, Status::Recovered)
                    .await?;
                Ok(JobReport::Skipped { handed_to: None })
            }
            Abort::DeferToRecovery => {
                info!("Pair is recovering, handing over to recovery");
                let response = json!({ "message": "superseded by recovery" });
                let finished = self.finish_record(ctx, false, true, response, None).await?;
                match finished.and_then(|record| record.chain) {
                    Some(chain) if chain.operation == Operation::Recovery => {
                        self.submit_follow_up(&ctx.key, chain, Duration::ZERO)
                            .await?;
                        Ok(JobReport::Skipped {
                            handed_to: Some(Operation::Recovery),
                        })
                    }
                    _ => Ok(JobReport::Skipped { handed_to: None }),
                }
            }
            Abort::RetryCancelled(moved_to) => {
                info!(status = %moved_to, "Status moved during backoff, cancelling retry");
                let failure = Failure::fatal(format!("retry cancelled: status changed to {moved_to}"));
                self.fail(ctx, failure).await
            }
        }
    }

    async fn retry_or_fail(
        &self,
        ctx: &JobContext<'_>,
        alert: &Alert,
        error: &AlerterError,
    ) -> Result<JobReport> {
        let job = ctx.job;
        let traceback = self.config.include_traceback();

        if alert.do_not_retry() {
            info!(%error, "Retryable failure on a do-not-retry alert");
            return self
                .fail(ctx, Failure::raised(error, Some("retries disabled for this alert"), traceback))
                .await;
        }
        if !job.spec.policy.should_retry(job.attempt) {
            warn!(%error, max_retries = job.spec.policy.max_retries, "Retries exhausted");
            return self
                .fail(ctx, Failure::raised(error, Some("retries exhausted"), traceback))
                .await;
        }

        let has_chain = self
            .store
            .operation(&ctx.record_id)
            .await?
            .is_some_and(|record| record.chain.is_some());
        let status = self.current_status(&ctx.key).await?;
        if !operations::on_retryable(job.operation, status, has_chain) {
            info!(%status, has_chain, "Race detected, retry cancelled");
            return self
                .fail(ctx, Failure::raised(error, Some("retry cancelled by race"), traceback))
                .await;
        }

        let mut delay = job.spec.policy.delay(job.attempt);
        if let AlerterError::RateLimited { retry_after_secs } = error {
            delay = delay.max(Duration::from_secs(*retry_after_secs));
        }
        let next = job.next_attempt();
        let reason = error.to_string();
        let retries = next.attempt;
        self.store
            .update_operation(
                &ctx.record_id,
                Box::new(move |record| {
                    record.retries = retries;
                    record.failure_reason = Some(reason);
                }),
            )
            .await?;
        self.scheduler.submit(next, delay).await?;

        info!(
            %error,
            next_attempt = retries,
            delay_secs = delay.as_secs_f64(),
            "Retry scheduled"
        );
        Ok(JobReport::RetryScheduled {
            attempt: retries,
            delay,
        })
    }

    async fn succeed(&self, ctx: &JobContext<'_>, payload: Value) -> Result<JobReport> {
        let finished = self.finish_record(ctx, true, false, payload, None).await?;
        let chain = finished.and_then(|record| record.chain);
        let status = self.current_status(&ctx.key).await?;

        let next = operations::on_success(ctx.operation(), status, chain);
        let chained = self.apply(ctx, next).await?;
        info!(chained = ?chained, "Operation succeeded");
        Ok(JobReport::Succeeded { chained })
    }

    async fn fail(&self, ctx: &JobContext<'_>, failure: Failure) -> Result<JobReport> {
        let finished = self
            .finish_record(ctx, false, false, failure.response, Some(failure.reason))
            .await?;
        let chain = finished.and_then(|record| record.chain);
        let status = self.current_status(&ctx.key).await?;

        let next = operations::on_failure(ctx.operation(), status, chain);
        let dropped = self.apply(ctx, next).await?;
        info!(dropped = ?dropped, "Operation failed");
        Ok(JobReport::Failed { dropped })
    }

    /// Apply a finalize decision. Returns the follow-up operation it touched.
    async fn apply(&self, ctx: &JobContext<'_>, next: Next) -> Result<Option<Operation>> {
        match next {
            Next::Terminal(terminal) => {
                self.settle(&ctx.key, Status::running(ctx.operation()), terminal)
                    .await?;
                Ok(None)
            }
            Next::Chain(chain) => {
                let operation = chain.operation;
                self.submit_follow_up(&ctx.key, chain, self.config.chain_delay())
                    .await?;
                info!(follow_up = %operation, "Chained follow-up submitted");
                Ok(Some(operation))
            }
            Next::DropChain {
                chain,
                from,
                terminal,
            } => {
                let operation = chain.operation;
                let execution = self.next_execution(&ctx.key, operation).await?;
                let response = json!({ "message": format!("{} failed", ctx.operation()) });
                let record = OperationRecord::skipped(
                    RecordId::new(&ctx.key, operation, execution),
                    chain.text,
                    response,
                )
                .with_action(chain.action);
                self.store.put_operation(record).await?;
                self.settle(&ctx.key, from, terminal).await?;
                info!(follow_up = %operation, "Chained follow-up dropped");
                Ok(Some(operation))
            }
            Next::Leave => {
                debug!("Status owned elsewhere, leaving it");
                Ok(None)
            }
        }
    }

    /// Submit a follow-up that already holds the pair in its running status.
    /// If the queue refuses it the pair falls back to processed.
    async fn submit_follow_up(
        &self,
        key: &PairKey,
        chain: ChainPayload,
        delay: Duration,
    ) -> Result<JobId> {
        let ChainPayload {
            text,
            operation,
            action,
            spec,
        } = chain;
        match self.enqueue(key, &text, operation, action, spec, delay).await {
            Ok(job_id) => Ok(job_id),
            Err(error) => {
                warn!(%error, follow_up = %operation, "Follow-up submit failed");
                self.settle(key, Status::running(operation), Status::Processed)
                    .await?;
                Err(error)
            }
        }
    }

    async fn finish_record(
        &self,
        ctx: &JobContext<'_>,
        success: bool,
        skipped: bool,
        response: Value,
        failure_reason: Option<String>,
    ) -> Result<Option<OperationRecord>> {
        Ok(self
            .store
            .update_operation(
                &ctx.record_id,
                Box::new(move |record| record.finish(success, skipped, response, failure_reason)),
            )
            .await?)
    }

    /// Compare-and-set that tolerates losing: someone else owns the status then.
    async fn settle(&self, key: &PairKey, from: Status, to: Status) -> Result<()> {
        if self.store.transition(key, from, to).await? {
            debug!(%from, %to, "Status settled");
        } else {
            debug!(%from, %to, "Status moved on, not settling");
        }
        Ok(())
    }
}
