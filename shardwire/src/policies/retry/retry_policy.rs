use crate::errors::RequestAttemptError;
use crate::statement::Consistency;

/// Information about a failed attempt of a request.
#[derive(Debug)]
pub struct RequestInfo<'a> {
    /// The error with which the attempt failed.
    pub error: &'a RequestAttemptError,
    /// A request is idempotent if it can be applied multiple times without
    /// changing the result of the initial application.
    /// `false` means it is unknown whether it is idempotent.
    pub is_idempotent: bool,
    /// Consistency with which the attempt was sent.
    pub consistency: Consistency,
    /// Number of the failed attempt within this request, starting at 0.
    pub attempt: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send again to the same host. `None` keeps the consistency.
    RetrySameTarget(Option<Consistency>),
    /// Send to the next host of the plan. `None` keeps the consistency.
    RetryNextTarget(Option<Consistency>),
    DontRetry,
    /// Treat a write error as success.
    IgnoreWriteError,
}

/// Specifies a policy used to decide when to retry a request.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called for each new request, starts a session of deciding about retries.
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Decides about retries of a single request.
pub trait RetrySession: Send + Sync {
    /// Called after an attempt failed.
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision;

    /// Reset before using for a new request.
    fn reset(&mut self);
}
