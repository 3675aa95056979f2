use tracing::debug;

use crate::errors::{DbError, RequestAttemptError};

use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};

const DEFAULT_MAX_RETRIES: usize = 3;

/// Retries transient failures up to a fixed number of times.
///
/// Write timeouts of non-idempotent requests are not retried, since the
/// write may have been applied, unless
/// [`retry_non_idempotent_write_timeouts`](Self::retry_non_idempotent_write_timeouts)
/// is set.
#[derive(Debug, Clone)]
pub struct SimpleRetryPolicy {
    max_retries: usize,
    retry_non_idempotent_write_timeouts: bool,
}

impl SimpleRetryPolicy {
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_non_idempotent_write_timeouts: false,
        }
    }

    /// Maximum number of retries of one request, not counting the first attempt.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Also retry write timeouts of requests not marked idempotent.
    pub fn retry_non_idempotent_write_timeouts(mut self, enabled: bool) -> Self {
        self.retry_non_idempotent_write_timeouts = enabled;
        self
    }
}

impl Default for SimpleRetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(SimpleRetrySession {
            policy: self.clone(),
        })
    }
}

/// Implementation of [RetrySession] for [SimpleRetryPolicy].
pub struct SimpleRetrySession {
    policy: SimpleRetryPolicy,
}

impl RetrySession for SimpleRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        if request_info.attempt >= self.policy.max_retries {
            debug!(
                attempt = request_info.attempt,
                "Retry limit reached, not retrying"
            );
            return RetryDecision::DontRetry;
        }

        match request_info.error {
            RequestAttemptError::BrokenConnectionError(_)
            | RequestAttemptError::DbError(DbError::Overloaded, _)
            | RequestAttemptError::DbError(DbError::ServerError, _) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            RequestAttemptError::DbError(DbError::Unavailable { .. }, _)
            | RequestAttemptError::DbError(DbError::IsBootstrapping, _)
            | RequestAttemptError::UnableToAllocStreamId => RetryDecision::RetryNextTarget(None),
            RequestAttemptError::DbError(DbError::ReadTimeout { .. }, _) => {
                RetryDecision::RetrySameTarget(None)
            }
            RequestAttemptError::DbError(DbError::WriteTimeout { .. }, _) => {
                if request_info.is_idempotent || self.policy.retry_non_idempotent_write_timeouts {
                    RetryDecision::RetrySameTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            _ => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::WriteType;
    use crate::statement::Consistency;
    use crate::test_utils::setup_tracing;

    fn write_timeout() -> RequestAttemptError {
        RequestAttemptError::DbError(
            DbError::WriteTimeout {
                consistency: Consistency::Quorum,
                received: 1,
                required: 2,
                write_type: WriteType::Simple,
            },
            String::new(),
        )
    }

    fn decide(
        policy: &SimpleRetryPolicy,
        error: &RequestAttemptError,
        is_idempotent: bool,
        attempt: usize,
    ) -> RetryDecision {
        policy.new_session().decide_should_retry(RequestInfo {
            error,
            is_idempotent,
            consistency: Consistency::Quorum,
            attempt,
        })
    }

    #[test]
    fn non_idempotent_write_timeout_needs_opt_in() {
        setup_tracing();
        let error = write_timeout();

        let policy = SimpleRetryPolicy::new();
        assert_eq!(decide(&policy, &error, false, 0), RetryDecision::DontRetry);
        assert_eq!(
            decide(&policy, &error, true, 0),
            RetryDecision::RetrySameTarget(None)
        );

        let opted_in = SimpleRetryPolicy::new().retry_non_idempotent_write_timeouts(true);
        assert_eq!(
            decide(&opted_in, &error, false, 0),
            RetryDecision::RetrySameTarget(None)
        );
    }

    #[test]
    fn retries_are_bounded() {
        setup_tracing();
        let policy = SimpleRetryPolicy::new().with_max_retries(2);
        let error = RequestAttemptError::DbError(DbError::IsBootstrapping, String::new());

        assert_eq!(
            decide(&policy, &error, false, 1),
            RetryDecision::RetryNextTarget(None)
        );
        assert_eq!(decide(&policy, &error, false, 2), RetryDecision::DontRetry);
    }

    #[test]
    fn request_errors_are_not_retried() {
        setup_tracing();
        let policy = SimpleRetryPolicy::new();
        let error = RequestAttemptError::DbError(DbError::SyntaxError, String::new());
        assert_eq!(decide(&policy, &error, true, 0), RetryDecision::DontRetry);
    }
}
