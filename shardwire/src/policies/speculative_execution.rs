//! Speculative execution sends the same request to further hosts of the
//! plan when the current one takes too long, and takes the first answer.
//! Only idempotent requests are executed speculatively.

use std::future::Future;
use std::time::Duration;

use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{trace_span, Instrument};

use crate::errors::{DbError, ExecutionError, RequestAttemptError};

/// Decides whether, and how often, to start speculative executions.
pub trait SpeculativeExecutionPolicy: std::fmt::Debug + Send + Sync {
    /// The maximum number of speculative executions that will be triggered
    /// for a given request (does not include the initial request)
    fn max_retry_count(&self) -> usize;

    /// The delay between each speculative execution
    fn retry_interval(&self) -> Duration;
}

/// Schedules a given number of speculative executions, separated by a
/// fixed delay.
#[derive(Debug, Clone)]
pub struct SimpleSpeculativeExecutionPolicy {
    /// The maximum number of speculative executions that will be triggered
    /// for a given request (does not include the initial request)
    pub max_retry_count: usize,

    /// The delay between each speculative execution
    pub retry_interval: Duration,
}

impl SpeculativeExecutionPolicy for SimpleSpeculativeExecutionPolicy {
    fn max_retry_count(&self) -> usize {
        self.max_retry_count
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

/// Whether a failure of one fiber says nothing about the other fibers, so
/// that their results are still worth waiting for.
fn can_be_ignored<ResT>(result: &Result<ResT, ExecutionError>) -> bool {
    match result {
        Ok(_) => false,
        Err(ExecutionError::ConnectionPoolError(_)) => true,
        Err(ExecutionError::LastAttemptError(e))
        | Err(ExecutionError::AllAttemptsFailed { last_error: e, .. }) => match e {
            RequestAttemptError::BrokenConnectionError(_)
            | RequestAttemptError::UnableToAllocStreamId => true,
            RequestAttemptError::DbError(db_error, _) => can_speculative_retry(db_error),
            RequestAttemptError::SerializationError(_)
            | RequestAttemptError::ResponseParseError(_)
            | RequestAttemptError::FrameError(_)
            | RequestAttemptError::UnexpectedResponse(_) => false,
        },
        Err(_) => false,
    }
}

/// Errors specific to the node that returned them.
fn can_speculative_retry(db_error: &DbError) -> bool {
    matches!(
        db_error,
        DbError::Unavailable { .. }
            | DbError::Overloaded
            | DbError::IsBootstrapping
            | DbError::TruncateError
            | DbError::ReadTimeout { .. }
            | DbError::WriteTimeout { .. }
            | DbError::ReadFailure { .. }
            | DbError::WriteFailure { .. }
            | DbError::ServerError
    )
}

/// Runs fibers produced by `fiber_generator`: the first one immediately and
/// another one every `retry_interval`, at most `max_retry_count` extra.
///
/// A fiber returns `None` when it found the plan exhausted; no further
/// fibers are started then. The first result that is not an ignorable
/// error wins, and the remaining fibers are dropped.
pub(crate) async fn execute<FiberFut, ResT>(
    policy: &dyn SpeculativeExecutionPolicy,
    mut fiber_generator: impl FnMut(bool) -> FiberFut,
) -> Result<ResT, ExecutionError>
where
    FiberFut: Future<Output = Option<Result<ResT, ExecutionError>>>,
{
    let mut retries_remaining = policy.max_retry_count();
    let retry_interval = policy.retry_interval();

    let mut fibers = FuturesUnordered::new();
    fibers.push(fiber_generator(false).instrument(trace_span!("Speculative execution: original request")));

    let sleep = tokio::time::sleep(retry_interval).fuse();
    tokio::pin!(sleep);

    let mut last_error = None;
    loop {
        futures::select! {
            _ = &mut sleep => {
                if retries_remaining > 0 {
                    fibers.push(fiber_generator(true).instrument(trace_span!(
                        "Speculative execution",
                        retries_remaining = retries_remaining
                    )));
                    retries_remaining -= 1;

                    sleep.set(tokio::time::sleep(retry_interval).fuse());
                }
            }
            res = fibers.select_next_some() => {
                match res {
                    Some(r) if !can_be_ignored(&r) => return r,
                    Some(r) => last_error = Some(r),
                    // The plan is exhausted; running fibers may still succeed.
                    None => retries_remaining = 0,
                }
                if fibers.is_empty() && retries_remaining == 0 {
                    return last_error.unwrap_or(Err(ExecutionError::EmptyPlan));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::{execute, SimpleSpeculativeExecutionPolicy};
    use crate::errors::{ExecutionError, RequestAttemptError};

    fn ignorable_error() -> Option<Result<usize, ExecutionError>> {
        Some(Err(ExecutionError::LastAttemptError(
            RequestAttemptError::UnableToAllocStreamId,
        )))
    }

    // The clock starts paused, so sleeps complete in virtual time.
    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn first_success_wins() {
        let policy = SimpleSpeculativeExecutionPolicy {
            max_retry_count: 3,
            retry_interval: Duration::from_secs(1),
        };
        let started = Arc::new(AtomicUsize::new(0));

        let generator = {
            let started = started.clone();
            move |is_speculative: bool| {
                let idx = started.fetch_add(1, Ordering::SeqCst);
                assert_eq!(is_speculative, idx > 0);
                async move {
                    // The original is slow; the first speculative fiber is fast.
                    let delay = if idx == 0 { 10 } else { 1 };
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    Some(Ok(idx))
                }
            }
        };

        let now = tokio::time::Instant::now();
        let res = execute(&policy, generator).await;
        assert_matches!(res, Ok(1));
        assert_eq!(now.elapsed(), Duration::from_secs(2));
        // Fiber 2 was started at 2s, just before fiber 1 answered.
        assert!(started.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausted_plan_waits_for_running_fibers() {
        let policy = SimpleSpeculativeExecutionPolicy {
            max_retry_count: 5,
            retry_interval: Duration::from_secs(1),
        };

        let generator = {
            let mut counter = 0;
            move |_is_speculative: bool| {
                let fiber_idx = counter;
                counter += 1;
                async move {
                    match fiber_idx {
                        0..=3 => {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            ignorable_error()
                        }
                        4 => None,
                        _ => panic!("Too many speculative executions - expected 4"),
                    }
                }
            }
        };

        let now = tokio::time::Instant::now();
        let res = execute(&policy, generator).await;
        assert_matches!(
            res,
            Err(ExecutionError::LastAttemptError(
                RequestAttemptError::UnableToAllocStreamId
            ))
        );
        // The last fiber was started at 3s and finished 5s later.
        assert_eq!(now.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn non_ignorable_error_is_returned_at_once() {
        let policy = SimpleSpeculativeExecutionPolicy {
            max_retry_count: 2,
            retry_interval: Duration::from_secs(1),
        };

        let generator = |_is_speculative: bool| async {
            Some(Err::<usize, _>(ExecutionError::SessionClosed))
        };

        let res = execute(&policy, generator).await;
        assert_matches!(res, Err(ExecutionError::SessionClosed));
    }
}
