//! Operation records: what was attempted for a pair, and how it ended.

use alerter::Operation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::scheduler::{JobId, JobSpec};
use crate::status::PairKey;

/// Identifies one operation record.
///
/// New-Event and Recovery always use execution 0, so a new execution replaces
/// the previous record. Repeat and Action get increasing executions and keep
/// their history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub alert_id: String,
    pub alerter: String,
    pub operation: Operation,
    pub execution: u32,
}

impl RecordId {
    #[must_use]
    pub fn new(key: &PairKey, operation: Operation, execution: u32) -> Self {
        Self {
            alert_id: key.alert_id.clone(),
            alerter: key.alerter.clone(),
            operation,
            execution,
        }
    }

    #[must_use]
    pub fn pair(&self) -> PairKey {
        PairKey::new(&self.alert_id, &self.alerter)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.alert_id, self.alerter, self.operation, self.execution
        )
    }
}

/// A follow-up operation deferred until the in-flight job finalizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainPayload {
    /// Trigger text for the follow-up
    pub text: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Queue, priority and backoff the follow-up job runs with
    pub spec: JobSpec,
}

/// History and result of one operation execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: RecordId,
    /// Job that owns this record; retries keep the same id
    pub job_id: Option<JobId>,
    pub received_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub skipped: bool,
    /// Retries scheduled so far
    pub retries: u32,
    /// Last attempt that began executing
    pub attempt_started: Option<u32>,
    #[serde(default)]
    pub response: serde_json::Value,
    pub failure_reason: Option<String>,
    /// Trigger text the operation runs with
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Repetition number, for Repeat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainPayload>,
}

impl OperationRecord {
    /// A record for a job that has been submitted but not yet run.
    #[must_use]
    pub fn received(id: RecordId, job_id: JobId, text: impl Into<String>) -> Self {
        Self {
            id,
            job_id: Some(job_id),
            received_at: Some(Utc::now()),
            started_at: None,
            finished_at: None,
            success: false,
            skipped: false,
            retries: 0,
            attempt_started: None,
            response: serde_json::Value::Null,
            failure_reason: None,
            text: text.into(),
            action: None,
            repetition: None,
            chain: None,
        }
    }

    /// A finished, skipped record that no job ever ran.
    #[must_use]
    pub fn skipped(id: RecordId, text: impl Into<String>, response: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            job_id: None,
            received_at: Some(now),
            finished_at: Some(now),
            skipped: true,
            response,
            ..Self::received(id, JobId::nil(), text)
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: Option<String>) -> Self {
        self.action = action;
        self
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Clear everything a previous run of this record left behind.
    pub fn reset_terminal(&mut self) {
        self.started_at = None;
        self.finished_at = None;
        self.success = false;
        self.skipped = false;
        self.response = serde_json::Value::Null;
        self.failure_reason = None;
    }

    /// Mark the record finished with the given result.
    pub fn finish(
        &mut self,
        success: bool,
        skipped: bool,
        response: serde_json::Value,
        failure_reason: Option<String>,
    ) {
        self.finished_at = Some(Utc::now());
        self.success = success;
        self.skipped = skipped;
        self.response = response;
        self.failure_reason = failure_reason;
    }
}
