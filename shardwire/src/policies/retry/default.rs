use tracing::debug;

use crate::errors::{DbError, RequestAttemptError, WriteType};

use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};

/// Retries when there is a high chance that a retry might help, and at
/// most once per kind of timeout or unavailability.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::default())
    }
}

/// Failures that get a single retry per request.
#[derive(Debug, Clone, Copy)]
enum Budget {
    Unavailable = 0b001,
    ReadTimeout = 0b010,
    WriteTimeout = 0b100,
}

/// Where to retry a failed attempt, and which single-retry budget that
/// spends, if any. `None` if the failure is not worth retrying.
fn plan_retry(info: &RequestInfo) -> Option<(RetryDecision, Option<Budget>)> {
    let next = RetryDecision::RetryNextTarget(None);
    let same = RetryDecision::RetrySameTarget(None);
    let RequestAttemptError::DbError(db_error, _) = info.error else {
        return match info.error {
            // All stream ids of the connection are taken.
            RequestAttemptError::UnableToAllocStreamId => Some((next, None)),
            RequestAttemptError::BrokenConnectionError(_) if info.is_idempotent => {
                Some((next, None))
            }
            _ => None,
        };
    };

    match db_error {
        // Something is wrong with this node; another one may do better.
        DbError::Overloaded | DbError::ServerError | DbError::TruncateError => {
            info.is_idempotent.then_some((next, None))
        }
        DbError::IsBootstrapping => Some((next, None)),
        // The coordinator may be partitioned from the replicas, and two
        // such coordinators at once are unlikely.
        DbError::Unavailable { .. } => Some((next, Some(Budget::Unavailable))),
        // Enough replicas answered, but only with digests. The retry gets
        // data now that the coordinator knows the data replica is slow.
        DbError::ReadTimeout {
            received,
            required,
            data_present,
            ..
        } => {
            let digests_only = received >= required && !*data_present;
            digests_only.then_some((same, Some(Budget::ReadTimeout)))
        }
        // Only the batch log write is safe to repeat.
        DbError::WriteTimeout { write_type, .. } => {
            let batch_log = info.is_idempotent && *write_type == WriteType::BatchLog;
            batch_log.then_some((same, Some(Budget::WriteTimeout)))
        }
        _ => None,
    }
}

/// Implementation of [RetrySession] for [DefaultRetryPolicy].
#[derive(Debug, Default)]
pub struct DefaultRetrySession {
    // Bits of the budgets already spent.
    spent: u8,
}

impl DefaultRetrySession {
    fn spend(&mut self, budget: Budget) -> bool {
        let bit = budget as u8;
        let available = self.spent & bit == 0;
        self.spent |= bit;
        available
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        if request_info.consistency.is_serial() {
            return RetryDecision::DontRetry;
        }
        match plan_retry(&request_info) {
            Some((decision, None)) => decision,
            Some((decision, Some(budget))) if self.spend(budget) => decision,
            Some((_, Some(budget))) => {
                debug!(?budget, "Already retried once for this failure, not retrying");
                RetryDecision::DontRetry
            }
            None => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        *self = DefaultRetrySession::default();
    }
}
