//! Statements: the text of a request together with its execution options.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use shardwire_cql::value::SerializedValues;
use thiserror::Error;

use crate::policies::retry::RetryPolicy;
use crate::policies::speculative_execution::SpeculativeExecutionPolicy;
use crate::routing::Token;

pub mod batch;

pub use shardwire_cql::frame::types::{Consistency, SerialConsistency};

/// Default number of rows per page of a paged query.
const DEFAULT_PAGE_SIZE: i32 = 5000;

/// Per-request options. Everything left `None` falls back to the session's
/// configuration.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<Option<SerialConsistency>>,

    pub(crate) is_idempotent: bool,

    pub(crate) tracing: bool,
    pub(crate) timestamp: Option<i64>,
    pub(crate) request_timeout: Option<Duration>,

    pub(crate) custom_payload: Option<HashMap<String, Option<Bytes>>>,

    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
}

impl StatementConfig {
    #[must_use]
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }
}

/// Where a statement should be routed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StatementRouting {
    /// Keyspace whose replication strategy decides the replicas. The
    /// session's current keyspace is used if unset.
    pub(crate) keyspace: Option<String>,
    /// Serialized partition key columns, hashed by the cluster's partitioner.
    pub(crate) partition_key: Option<SerializedValues>,
    /// A precomputed token; takes precedence over `partition_key`.
    pub(crate) token: Option<Token>,
}

/// Number of rows per page, always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageSize(i32);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Page size must be positive, got {0}")]
pub struct InvalidPageSize(i32);

impl PageSize {
    #[inline]
    pub(crate) fn new(size: i32) -> Result<Self, InvalidPageSize> {
        if size > 0 {
            Ok(PageSize(size))
        } else {
            Err(InvalidPageSize(size))
        }
    }

    #[inline]
    pub(crate) fn inner(&self) -> i32 {
        self.0
    }
}

impl Default for PageSize {
    #[inline]
    fn default() -> Self {
        PageSize(DEFAULT_PAGE_SIZE)
    }
}

/// An unprepared CQL statement with its execution options.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) config: StatementConfig,
    pub(crate) routing: StatementRouting,

    /// CQL text sent in the `QUERY` frame.
    pub contents: String,
    page_size: PageSize,
}

impl Statement {
    /// A statement with default options, for the given CQL text.
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            contents: query_text.into(),
            page_size: PageSize::default(),
            config: Default::default(),
            routing: Default::default(),
        }
    }

    /// Builder form of [`set_page_size`](Self::set_page_size).
    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.set_page_size(page_size);
        self
    }

    /// Sets the page size used by `query_single_page` and `query_iter`.
    ///
    /// Panics unless `page_size` is positive.
    pub fn set_page_size(&mut self, page_size: i32) {
        self.page_size =
            PageSize::new(page_size).unwrap_or_else(|err| panic!("Statement::set_page_size: {err}"));
    }

    pub(crate) fn get_validated_page_size(&self) -> PageSize {
        self.page_size
    }

    pub fn get_page_size(&self) -> i32 {
        self.page_size.inner()
    }

    /// Overrides the session's default consistency for this statement.
    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = Some(c);
    }

    /// Reverts to the session's default consistency.
    pub fn unset_consistency(&mut self) {
        self.config.consistency = None;
    }

    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    /// Consistency of the Paxos round of a conditional statement; the
    /// server ignores it for other statements. `None` sends no serial
    /// consistency at all.
    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = Some(sc);
    }

    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.config.serial_consistency.flatten()
    }

    /// Marks the statement as idempotent: applying it several times has the
    /// same effect as applying it once.
    ///
    /// Only idempotent statements are speculatively executed, and retry
    /// policies refuse to retry writes of non-idempotent ones after a timeout.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    /// Enable or disable server-side tracing for this statement.
    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    pub fn get_tracing(&self) -> bool {
        self.config.tracing
    }

    /// Write timestamp in microseconds since the epoch; the server picks one
    /// if unset.
    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp
    }

    pub fn get_timestamp(&self) -> Option<i64> {
        self.config.timestamp
    }

    /// Sets the client-side timeout for this statement, covering all
    /// attempts and retries. `None` means the session default.
    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.config.request_timeout = timeout
    }

    pub fn get_request_timeout(&self) -> Option<Duration> {
        self.config.request_timeout
    }

    /// Attaches a custom payload, sent to the server along with the request.
    pub fn set_custom_payload(&mut self, payload: Option<HashMap<String, Option<Bytes>>>) {
        self.config.custom_payload = payload;
    }

    pub fn get_custom_payload(&self) -> Option<&HashMap<String, Option<Bytes>>> {
        self.config.custom_payload.as_ref()
    }

    /// Overrides the session's retry policy when `Some`.
    #[inline]
    pub fn set_retry_policy(&mut self, retry_policy: Option<Arc<dyn RetryPolicy>>) {
        self.config.retry_policy = retry_policy;
    }

    #[inline]
    pub fn get_retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.config.retry_policy.as_ref()
    }

    /// Overrides the session's speculative execution policy when `Some`.
    #[inline]
    pub fn set_speculative_execution_policy(
        &mut self,
        policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    ) {
        self.config.speculative_execution_policy = policy;
    }

    /// Routes the statement to the replicas of the partition whose key
    /// columns are serialized in `partition_key`.
    pub fn set_partition_key(&mut self, keyspace: Option<String>, partition_key: SerializedValues) {
        self.routing.keyspace = keyspace;
        self.routing.partition_key = Some(partition_key);
    }

    /// Routes the statement to the replicas of `token`.
    pub fn set_token(&mut self, keyspace: Option<String>, token: Token) {
        self.routing.keyspace = keyspace;
        self.routing.token = Some(token);
    }
}

impl From<String> for Statement {
    fn from(s: String) -> Statement {
        Statement::new(s)
    }
}

impl<'a> From<&'a str> for Statement {
    fn from(s: &'a str) -> Statement {
        Statement::new(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let mut statement = Statement::new("SELECT * FROM ks.t");
        assert_eq!(statement.get_page_size(), 5000);
        assert!(!statement.get_is_idempotent());
        assert_eq!(
            statement.config.determine_consistency(Consistency::LocalQuorum),
            Consistency::LocalQuorum
        );

        statement.set_consistency(Consistency::One);
        statement.set_serial_consistency(Some(SerialConsistency::LocalSerial));
        assert_eq!(
            statement.config.determine_consistency(Consistency::LocalQuorum),
            Consistency::One
        );
        assert_eq!(
            statement.get_serial_consistency(),
            Some(SerialConsistency::LocalSerial)
        );
    }

    #[test]
    fn page_size_must_be_positive() {
        assert_eq!(PageSize::new(0), Err(InvalidPageSize(0)));
        assert_eq!(PageSize::new(10).map(|p| p.inner()), Ok(10));
        let result = std::panic::catch_unwind(|| Statement::new("x").with_page_size(-1));
        assert!(result.is_err());
    }
}
