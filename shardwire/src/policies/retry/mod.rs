//! Retry policies decide, after each failed attempt, whether a request is
//! sent again and where.

mod default;
mod downgrading_consistency;
mod retry_policy;
mod simple;

pub use default::{DefaultRetryPolicy, DefaultRetrySession};
pub use downgrading_consistency::{
    DowngradingConsistencyRetryPolicy, DowngradingConsistencyRetrySession,
};
pub use retry_policy::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};
pub use simple::{SimpleRetryPolicy, SimpleRetrySession};
