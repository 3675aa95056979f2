use tracing::debug;

use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};
use crate::errors::{DbError, RequestAttemptError, WriteType};
use crate::statement::Consistency;

/// Retries with a lower consistency level when the error shows the
/// requested one cannot be reached, and otherwise behaves like
/// [`DefaultRetryPolicy`](super::DefaultRetryPolicy).
///
/// Lowering consistency weakens guarantees silently; only use this policy
/// when availability matters more than consistency.
#[derive(Debug, Default)]
pub struct DowngradingConsistencyRetryPolicy;

impl DowngradingConsistencyRetryPolicy {
    pub fn new() -> DowngradingConsistencyRetryPolicy {
        DowngradingConsistencyRetryPolicy
    }
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DowngradingConsistencyRetrySession::default())
    }
}

/// Implementation of [RetrySession] for [DowngradingConsistencyRetryPolicy].
#[derive(Debug, Default)]
pub struct DowngradingConsistencyRetrySession {
    was_retry: bool,
}

/// The highest consistency level `known_ok` replicas can satisfy.
fn downgraded_consistency(known_ok: i32, previous: Consistency) -> RetryDecision {
    let consistency = match known_ok {
        n if n >= 3 => Consistency::Three,
        2 => Consistency::Two,
        // EACH_QUORUM reports no global count of alive replicas, so there
        // may be live ones in other datacenters.
        n if n == 1 || previous == Consistency::EachQuorum => Consistency::One,
        _ => return RetryDecision::DontRetry,
    };
    debug!(
        "Lowering consistency from {} to {} for a retry",
        previous, consistency
    );
    RetryDecision::RetrySameTarget(Some(consistency))
}

impl DowngradingConsistencyRetrySession {
    fn decide_for_db_error(
        &mut self,
        db_error: &DbError,
        is_idempotent: bool,
        consistency: Consistency,
    ) -> RetryDecision {
        match db_error {
            DbError::Overloaded | DbError::ServerError | DbError::TruncateError => {
                if is_idempotent {
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            DbError::IsBootstrapping => RetryDecision::RetryNextTarget(None),
            _ if self.was_retry => RetryDecision::DontRetry,
            DbError::Unavailable { alive, .. } => {
                self.was_retry = true;
                downgraded_consistency(*alive, consistency)
            }
            DbError::ReadTimeout {
                received,
                required,
                data_present,
                ..
            } => {
                if received < required {
                    self.was_retry = true;
                    downgraded_consistency(*received, consistency)
                } else if !*data_present {
                    self.was_retry = true;
                    RetryDecision::RetrySameTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            DbError::WriteTimeout {
                write_type,
                received,
                ..
            } if is_idempotent => {
                self.was_retry = true;
                match write_type {
                    // At least one replica has the write; it will spread.
                    WriteType::Simple | WriteType::Batch if *received > 0 => {
                        RetryDecision::IgnoreWriteError
                    }
                    // Part of the batch may be missing; write it all again
                    // at a level that can succeed.
                    WriteType::UnloggedBatch => downgraded_consistency(*received, consistency),
                    WriteType::BatchLog => RetryDecision::RetrySameTarget(None),
                    _ => RetryDecision::DontRetry,
                }
            }
            _ => RetryDecision::DontRetry,
        }
    }
}

impl RetrySession for DowngradingConsistencyRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        if request_info.consistency.is_serial() {
            // A serial failure happened in the paxos phase; the coordinator
            // may be the one cut off from the others.
            return match request_info.error {
                RequestAttemptError::DbError(DbError::Unavailable { .. }, _) => {
                    RetryDecision::RetryNextTarget(None)
                }
                _ => RetryDecision::DontRetry,
            };
        }

        match request_info.error {
            // Whether the request was applied is unknown.
            RequestAttemptError::BrokenConnectionError(_) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            RequestAttemptError::DbError(db_error, _) => self.decide_for_db_error(
                db_error,
                request_info.is_idempotent,
                request_info.consistency,
            ),
            RequestAttemptError::UnableToAllocStreamId => RetryDecision::RetryNextTarget(None),
            RequestAttemptError::SerializationError(_)
            | RequestAttemptError::ResponseParseError(_)
            | RequestAttemptError::FrameError(_)
            | RequestAttemptError::UnexpectedResponse(_) => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        *self = DowngradingConsistencyRetrySession::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_tracing;

    fn decide_with(
        session: &mut dyn RetrySession,
        error: &RequestAttemptError,
        is_idempotent: bool,
        consistency: Consistency,
    ) -> RetryDecision {
        session.decide_should_retry(RequestInfo {
            error,
            is_idempotent,
            consistency,
            attempt: 0,
        })
    }

    fn db(error: DbError) -> RequestAttemptError {
        RequestAttemptError::DbError(error, String::new())
    }

    #[test]
    fn unavailable_downgrades_to_alive_replicas() {
        setup_tracing();
        for (alive, expected) in [
            (5, RetryDecision::RetrySameTarget(Some(Consistency::Three))),
            (2, RetryDecision::RetrySameTarget(Some(Consistency::Two))),
            (1, RetryDecision::RetrySameTarget(Some(Consistency::One))),
            (0, RetryDecision::DontRetry),
        ] {
            let error = db(DbError::Unavailable {
                consistency: Consistency::All,
                required: 6,
                alive,
            });
            let mut session = DowngradingConsistencyRetryPolicy::new().new_session();
            assert_eq!(
                decide_with(session.as_mut(), &error, false, Consistency::All),
                expected
            );
            // Only one retry per request.
            assert_eq!(
                decide_with(session.as_mut(), &error, false, Consistency::All),
                RetryDecision::DontRetry
            );
        }
    }

    #[test]
    fn each_quorum_downgrades_without_alive_replicas() {
        setup_tracing();
        let error = db(DbError::Unavailable {
            consistency: Consistency::EachQuorum,
            required: 2,
            alive: 0,
        });
        let mut session = DowngradingConsistencyRetryPolicy::new().new_session();
        assert_eq!(
            decide_with(session.as_mut(), &error, false, Consistency::EachQuorum),
            RetryDecision::RetrySameTarget(Some(Consistency::One))
        );
    }

    #[test]
    fn read_timeout_decisions() {
        setup_tracing();
        let timeout = |received, data_present| {
            db(DbError::ReadTimeout {
                consistency: Consistency::Three,
                received,
                required: 3,
                data_present,
            })
        };
        let decide_once = |error: &RequestAttemptError| {
            let mut session = DowngradingConsistencyRetryPolicy::new().new_session();
            decide_with(session.as_mut(), error, false, Consistency::Three)
        };

        assert_eq!(
            decide_once(&timeout(2, false)),
            RetryDecision::RetrySameTarget(Some(Consistency::Two))
        );
        assert_eq!(
            decide_once(&timeout(3, false)),
            RetryDecision::RetrySameTarget(None)
        );
        assert_eq!(decide_once(&timeout(3, true)), RetryDecision::DontRetry);
    }

    #[test]
    fn write_timeout_decisions() {
        setup_tracing();
        let timeout = |write_type, received| {
            db(DbError::WriteTimeout {
                consistency: Consistency::Quorum,
                received,
                required: 3,
                write_type,
            })
        };
        let decide_once = |error: &RequestAttemptError, is_idempotent| {
            let mut session = DowngradingConsistencyRetryPolicy::new().new_session();
            decide_with(session.as_mut(), error, is_idempotent, Consistency::Quorum)
        };

        assert_eq!(
            decide_once(&timeout(WriteType::Simple, 1), false),
            RetryDecision::DontRetry
        );
        assert_eq!(
            decide_once(&timeout(WriteType::Simple, 1), true),
            RetryDecision::IgnoreWriteError
        );
        assert_eq!(
            decide_once(&timeout(WriteType::Simple, 0), true),
            RetryDecision::DontRetry
        );
        assert_eq!(
            decide_once(&timeout(WriteType::UnloggedBatch, 2), true),
            RetryDecision::RetrySameTarget(Some(Consistency::Two))
        );
        assert_eq!(
            decide_once(&timeout(WriteType::BatchLog, 0), true),
            RetryDecision::RetrySameTarget(None)
        );
        assert_eq!(
            decide_once(&timeout(WriteType::Counter, 2), true),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn serial_unavailable_moves_to_next_target() {
        setup_tracing();
        let error = db(DbError::Unavailable {
            consistency: Consistency::Serial,
            required: 2,
            alive: 1,
        });
        let mut session = DowngradingConsistencyRetryPolicy::new().new_session();
        assert_eq!(
            decide_with(session.as_mut(), &error, false, Consistency::Serial),
            RetryDecision::RetryNextTarget(None)
        );
        assert_eq!(
            decide_with(
                session.as_mut(),
                &db(DbError::Overloaded),
                true,
                Consistency::LocalSerial
            ),
            RetryDecision::DontRetry
        );
    }
}
