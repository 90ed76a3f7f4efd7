//! Alert records and the operation kinds an alerter executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tag that suppresses every retry for an alert, whatever the backoff policy says.
pub const DO_NOT_RETRY_TAG: &str = "do-not-retry";

/// Lifecycle state of the monitored condition, as owned by the alert store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// The condition is active
    Open,
    /// The condition cleared
    Closed,
}

/// The externally owned alert record, reduced to what dispatch needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub status: AlertStatus,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    /// Create an open alert with no tags.
    #[must_use]
    pub fn open(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: AlertStatus::Open,
            text: text.into(),
            tags: vec![],
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether the alert opted out of retries.
    #[must_use]
    pub fn do_not_retry(&self) -> bool {
        self.has_tag(DO_NOT_RETRY_TAG)
    }
}

/// The closed set of operations dispatched per (alert, alerter) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// First notification for a new occurrence
    NewEvent,
    /// The alert cleared
    Recovery,
    /// Re-notification of a still-open alert
    Repeat,
    /// Operator-triggered action
    Action,
}

impl Operation {
    pub const ALL: [Self; 4] = [Self::NewEvent, Self::Recovery, Self::Repeat, Self::Action];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NewEvent => "new_event",
            Self::Recovery => "recovery",
            Self::Repeat => "repeat",
            Self::Action => "action",
        }
    }

    /// Whether every execution keeps its own record (history) rather than
    /// overwriting the previous one.
    #[must_use]
    pub const fn keeps_history(&self) -> bool {
        matches!(self, Self::Repeat | Self::Action)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_event" | "new-event" => Ok(Self::NewEvent),
            "recovery" => Ok(Self::Recovery),
            "repeat" => Ok(Self::Repeat),
            "action" => Ok(Self::Action),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// Everything an alerter gets to see for one execution.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub operation: Operation,
    pub alert: Alert,
    /// Why the operation was triggered (free text from the trigger)
    pub reason: String,
    /// Name of the requested action, for [`Operation::Action`]
    pub action: Option<String>,
    /// 0 for the first attempt
    pub attempt: u32,
}

/// Result of an alerter call that did not raise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// Opaque response payload, stored on the operation record
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Outcome {
    #[must_use]
    pub fn success(payload: serde_json::Value) -> Self {
        Self {
            success: true,
            payload,
        }
    }

    #[must_use]
    pub fn failure(payload: serde_json::Value) -> Self {
        Self {
            success: false,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert_eq!("new-event".parse::<Operation>().unwrap(), Operation::NewEvent);
        assert!("escalate".parse::<Operation>().is_err());

        let json = serde_json::to_string(&Operation::NewEvent).unwrap();
        assert_eq!(json, "\"new_event\"");
    }

    #[test]
    fn test_history_kinds() {
        assert!(!Operation::NewEvent.keeps_history());
        assert!(!Operation::Recovery.keeps_history());
        assert!(Operation::Repeat.keeps_history());
        assert!(Operation::Action.keeps_history());
    }

    #[test]
    fn test_do_not_retry_tag() {
        let mut alert = Alert::open("a-1", "disk full");
        assert!(!alert.do_not_retry());
        alert.tags.push(DO_NOT_RETRY_TAG.to_string());
        assert!(alert.do_not_retry());
    }
}
