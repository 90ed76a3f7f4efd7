//! Per-(alert, alerter) status, the single source of truth for race detection.

use alerter::Operation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one (alert, alerter) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub alert_id: String,
    pub alerter: String,
}

impl PairKey {
    #[must_use]
    pub fn new(alert_id: impl Into<String>, alerter: impl Into<String>) -> Self {
        Self {
            alert_id: alert_id.into(),
            alerter: alerter.into(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.alert_id, self.alerter)
    }
}

/// Dispatch status of one pair.
///
/// ```text
/// New -> Scheduled -> Processing -> Processed
/// Processing | Processed -> Recovering -> Recovered
/// Processed -> Repeating -> Processed
/// Processing | Processed -> Actioning -> Processed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    New,
    Scheduled,
    Processing,
    Processed,
    Recovering,
    Recovered,
    Repeating,
    Actioning,
}

impl Status {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Recovering => "recovering",
            Self::Recovered => "recovered",
            Self::Repeating => "repeating",
            Self::Actioning => "actioning",
        }
    }

    /// Status an operation holds while its job runs.
    #[must_use]
    pub const fn running(operation: Operation) -> Self {
        match operation {
            Operation::NewEvent => Self::Processing,
            Operation::Recovery => Self::Recovering,
            Operation::Repeat => Self::Repeating,
            Operation::Action => Self::Actioning,
        }
    }

    /// Status an operation leaves behind when it completes without a race.
    #[must_use]
    pub const fn terminal(operation: Operation) -> Self {
        match operation {
            Operation::Recovery => Self::Recovered,
            Operation::NewEvent | Operation::Repeat | Operation::Action => Self::Processed,
        }
    }

    /// Statuses a later trigger can move a running job's pair into.
    #[must_use]
    pub const fn is_race_target(&self) -> bool {
        matches!(self, Self::Recovering | Self::Actioning)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored status of one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: Status,
    /// Number of repeat executions claimed so far
    #[serde(default)]
    pub repeat_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    #[must_use]
    pub fn new(status: Status) -> Self {
        Self {
            status,
            repeat_count: 0,
            updated_at: Utc::now(),
        }
    }
}
