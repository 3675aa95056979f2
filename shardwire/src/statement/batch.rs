//! Batches of unprepared statements, executed atomically (logged) or as a
//! single round trip (unlogged, counter).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use shardwire_cql::value::SerializedValues;

pub use shardwire_cql::frame::request::BatchType;

use super::{Consistency, SerialConsistency, Statement, StatementConfig, StatementRouting};
use crate::policies::retry::RetryPolicy;
use crate::routing::Token;

/// One statement of a batch together with its bound values.
#[derive(Debug, Clone)]
pub struct BatchStatement {
    pub(crate) statement: Statement,
    pub(crate) values: SerializedValues,
}

/// A batch of statements.
///
/// Only the batch's own options are used; the options of the statements
/// it contains are ignored. The first statement's routing is used when the
/// batch itself has none.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub(crate) config: StatementConfig,
    pub(crate) routing: StatementRouting,

    statements: Vec<BatchStatement>,
    batch_type: BatchType,
}

impl Batch {
    /// Creates a new, empty batch of the given type.
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            ..Default::default()
        }
    }

    /// Appends a statement with its bound values.
    pub fn append_statement(&mut self, statement: impl Into<Statement>, values: SerializedValues) {
        self.statements.push(BatchStatement {
            statement: statement.into(),
            values,
        });
    }

    pub fn get_type(&self) -> BatchType {
        self.batch_type
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub(crate) fn statements(&self) -> &[BatchStatement] {
        &self.statements
    }

    /// Routing of the batch: its own if set, otherwise the first statement's.
    pub(crate) fn effective_routing(&self) -> &StatementRouting {
        if self.routing != StatementRouting::default() {
            return &self.routing;
        }
        self.statements
            .first()
            .map(|s| &s.statement.routing)
            .unwrap_or(&self.routing)
    }

    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = Some(c);
    }

    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = Some(sc);
    }

    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.config.serial_consistency.flatten()
    }

    /// A batch is idempotent if all the statements in it are.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp;
    }

    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.config.request_timeout = timeout
    }

    pub fn set_custom_payload(&mut self, payload: Option<HashMap<String, Option<Bytes>>>) {
        self.config.custom_payload = payload;
    }

    pub fn set_retry_policy(&mut self, retry_policy: Option<Arc<dyn RetryPolicy>>) {
        self.config.retry_policy = retry_policy;
    }

    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    pub fn set_partition_key(&mut self, keyspace: Option<String>, partition_key: SerializedValues) {
        self.routing.keyspace = keyspace;
        self.routing.partition_key = Some(partition_key);
    }

    pub fn set_token(&mut self, keyspace: Option<String>, token: Token) {
        self.routing.keyspace = keyspace;
        self.routing.token = Some(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_falls_back_to_first_statement() {
        let mut first = Statement::new("INSERT INTO ks.t (a) VALUES (1)");
        first.set_token(Some("ks".to_owned()), Token::new(42));

        let mut batch = Batch::new(BatchType::Unlogged);
        assert!(batch.is_empty());
        batch.append_statement(first, SerializedValues::new());
        batch.append_statement("INSERT INTO ks.t (a) VALUES (2)", SerializedValues::new());
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.effective_routing().token, Some(Token::new(42)));

        batch.set_token(Some("ks".to_owned()), Token::new(7));
        assert_eq!(batch.effective_routing().token, Some(Token::new(7)));
    }
}
