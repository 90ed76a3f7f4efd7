//! Claim and finalize rules of the four operations.
//!
//! Pure functions of the observed status; the template in `task.rs` does the
//! reading and writing around them.

use alerter::Operation;

use crate::record::ChainPayload;
use crate::status::Status;

/// Result of claiming a pair before any external work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// Move the pair to this status and execute.
    Proceed(Status),
    Abort(Abort),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Abort {
    /// Another delivery already owns or finished this state. No writes.
    Duplicate,
    /// The alert closed before New-Event ever ran.
    RecoveredBeforeAlerting,
    /// Repeat or Action found the pair recovering; hand over to Recovery.
    DeferToRecovery,
    /// A retry found the pair moved to a race target; fail without calling out.
    RetryCancelled(Status),
}

/// What to do with the pair's status once the record is finished.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Next {
    /// Compare-and-set from the running status to this one.
    Terminal(Status),
    /// Leave the race target in place and run the follow-up.
    Chain(ChainPayload),
    /// Record the follow-up as skipped and move from `from` to `terminal`.
    DropChain {
        chain: ChainPayload,
        from: Status,
        terminal: Status,
    },
    /// Status belongs to someone else now.
    Leave,
}

pub(crate) fn claim(operation: Operation, status: Status, redelivery: bool) -> Claim {
    use Status::{Actioning, New, Processing, Recovering, Repeating, Scheduled};

    match (operation, status) {
        (Operation::NewEvent, _) if redelivery && status.is_race_target() => {
            Claim::Abort(Abort::RetryCancelled(status))
        }
        (Operation::NewEvent, Recovering) => Claim::Abort(Abort::RecoveredBeforeAlerting),
        (Operation::NewEvent, New | Scheduled) if !redelivery => Claim::Proceed(Processing),
        (Operation::NewEvent, Processing) if redelivery => Claim::Proceed(Processing),

        (Operation::Recovery, Recovering) => Claim::Proceed(Recovering),

        (Operation::Repeat, Recovering) => Claim::Abort(Abort::DeferToRecovery),
        (Operation::Repeat, Repeating) => Claim::Proceed(Repeating),
        (Operation::Repeat, Actioning) if redelivery => Claim::Abort(Abort::RetryCancelled(status)),

        (Operation::Action, Recovering) => Claim::Abort(Abort::DeferToRecovery),
        (Operation::Action, Actioning | Repeating) => Claim::Proceed(Actioning),

        _ => Claim::Abort(Abort::Duplicate),
    }
}

pub(crate) fn on_success(operation: Operation, status: Status, chain: Option<ChainPayload>) -> Next {
    if operation == Operation::Recovery {
        return settle(operation, status);
    }
    match chain {
        Some(chain) => Next::Chain(chain),
        None => settle(operation, status),
    }
}

pub(crate) fn on_failure(operation: Operation, status: Status, chain: Option<ChainPayload>) -> Next {
    if operation == Operation::Recovery {
        return settle(operation, status);
    }
    match chain {
        Some(chain) => {
            let terminal = match chain.operation {
                Operation::Recovery => Status::Recovered,
                Operation::NewEvent | Operation::Repeat | Operation::Action => Status::Processed,
            };
            Next::DropChain {
                chain,
                from: status,
                terminal,
            }
        }
        None => settle(operation, status),
    }
}

/// Whether a retryable failure may be retried: only while nothing raced in.
pub(crate) fn on_retryable(operation: Operation, status: Status, has_chain: bool) -> bool {
    status == Status::running(operation) && (operation == Operation::Recovery || !has_chain)
}

fn settle(operation: Operation, status: Status) -> Next {
    if status == Status::running(operation) {
        Next::Terminal(Status::terminal(operation))
    } else {
        Next::Leave
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::scheduler::JobSpec;

    fn chain(operation: Operation) -> ChainPayload {
        ChainPayload {
            text: "closed".into(),
            operation,
            action: None,
            spec: JobSpec {
                queue: "alerts".into(),
                priority: 5,
                policy: BackoffPolicy::default(),
            },
        }
    }

    #[test]
    fn test_new_event_claim() {
        use Status::*;
        let op = Operation::NewEvent;
        assert_eq!(claim(op, Scheduled, false), Claim::Proceed(Processing));
        assert_eq!(claim(op, New, false), Claim::Proceed(Processing));
        assert_eq!(claim(op, Processing, true), Claim::Proceed(Processing));
        assert_eq!(
            claim(op, Recovering, false),
            Claim::Abort(Abort::RecoveredBeforeAlerting)
        );
        assert_eq!(
            claim(op, Recovering, true),
            Claim::Abort(Abort::RetryCancelled(Recovering))
        );
        assert_eq!(
            claim(op, Actioning, true),
            Claim::Abort(Abort::RetryCancelled(Actioning))
        );
        // Duplicate triggers.
        assert_eq!(claim(op, Processing, false), Claim::Abort(Abort::Duplicate));
        assert_eq!(claim(op, Processed, false), Claim::Abort(Abort::Duplicate));
        assert_eq!(claim(op, Processed, true), Claim::Abort(Abort::Duplicate));
        assert_eq!(claim(op, Recovered, false), Claim::Abort(Abort::Duplicate));
    }

    #[test]
    fn test_recovery_claim_requires_recovering() {
        use Status::*;
        let op = Operation::Recovery;
        assert_eq!(claim(op, Recovering, false), Claim::Proceed(Recovering));
        assert_eq!(claim(op, Recovering, true), Claim::Proceed(Recovering));
        for status in [New, Scheduled, Processing, Processed, Recovered, Repeating, Actioning] {
            assert_eq!(claim(op, status, false), Claim::Abort(Abort::Duplicate));
        }
    }

    #[test]
    fn test_repeat_and_action_claim() {
        use Status::*;
        assert_eq!(claim(Operation::Repeat, Repeating, false), Claim::Proceed(Repeating));
        assert_eq!(
            claim(Operation::Repeat, Recovering, false),
            Claim::Abort(Abort::DeferToRecovery)
        );
        assert_eq!(claim(Operation::Repeat, Processed, false), Claim::Abort(Abort::Duplicate));

        assert_eq!(claim(Operation::Action, Actioning, false), Claim::Proceed(Actioning));
        assert_eq!(claim(Operation::Action, Repeating, false), Claim::Proceed(Actioning));
        assert_eq!(
            claim(Operation::Action, Recovering, true),
            Claim::Abort(Abort::DeferToRecovery)
        );
        assert_eq!(claim(Operation::Action, Processed, false), Claim::Abort(Abort::Duplicate));
    }

    #[test]
    fn test_success_chains_follow_up() {
        let next = on_success(
            Operation::NewEvent,
            Status::Recovering,
            Some(chain(Operation::Recovery)),
        );
        assert_eq!(next, Next::Chain(chain(Operation::Recovery)));

        let next = on_success(Operation::NewEvent, Status::Processing, None);
        assert_eq!(next, Next::Terminal(Status::Processed));

        // Recovery was submitted directly by someone else.
        let next = on_success(Operation::Repeat, Status::Recovering, None);
        assert_eq!(next, Next::Leave);
    }

    #[test]
    fn test_failure_drops_follow_up() {
        let next = on_failure(
            Operation::NewEvent,
            Status::Recovering,
            Some(chain(Operation::Recovery)),
        );
        assert_eq!(
            next,
            Next::DropChain {
                chain: chain(Operation::Recovery),
                from: Status::Recovering,
                terminal: Status::Recovered,
            }
        );

        let next = on_failure(
            Operation::Repeat,
            Status::Actioning,
            Some(chain(Operation::Action)),
        );
        assert!(matches!(
            next,
            Next::DropChain {
                terminal: Status::Processed,
                ..
            }
        ));
    }

    #[test]
    fn test_recovery_always_settles_to_recovered() {
        assert_eq!(
            on_success(Operation::Recovery, Status::Recovering, None),
            Next::Terminal(Status::Recovered)
        );
        assert_eq!(
            on_failure(Operation::Recovery, Status::Recovering, None),
            Next::Terminal(Status::Recovered)
        );
    }

    #[test]
    fn test_retry_only_without_race() {
        assert!(on_retryable(Operation::NewEvent, Status::Processing, false));
        assert!(!on_retryable(Operation::NewEvent, Status::Processing, true));
        assert!(!on_retryable(Operation::NewEvent, Status::Recovering, false));
        assert!(on_retryable(Operation::Recovery, Status::Recovering, false));
        assert!(!on_retryable(Operation::Action, Status::Recovering, true));
    }
}
