//! Types for representing results of requests.

use std::collections::HashMap;

use bytes::Bytes;
use shardwire_cql::frame::response::result::{ColumnSpec, Row, Rows};
use thiserror::Error;
use uuid::Uuid;

use super::Coordinator;

/// Result of a single request to the database. It represents any kind of
/// RESULT frame: rows, a keyspace change, a schema change or nothing.
///
/// For paged requests this holds exactly one page.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// `None` only for results of the driver's internal requests.
    request_coordinator: Option<Coordinator>,
    rows: Option<Rows>,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
    custom_payload: Option<HashMap<String, Option<Bytes>>>,
}

impl QueryResult {
    pub(crate) fn new(
        request_coordinator: Option<Coordinator>,
        rows: Option<Rows>,
        tracing_id: Option<Uuid>,
        warnings: Vec<String>,
        custom_payload: Option<HashMap<String, Option<Bytes>>>,
    ) -> Self {
        Self {
            request_coordinator,
            rows,
            tracing_id,
            warnings,
            custom_payload,
        }
    }

    /// The node and shard that served the request.
    #[inline]
    pub fn request_coordinator(&self) -> Option<&Coordinator> {
        self.request_coordinator.as_ref()
    }

    /// Warnings emitted by the database.
    #[inline]
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }

    /// Tracing ID associated with this request, if tracing was enabled.
    #[inline]
    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    /// Custom payload sent back by the server, if any.
    #[inline]
    pub fn custom_payload(&self) -> Option<&HashMap<String, Option<Bytes>>> {
        self.custom_payload.as_ref()
    }

    #[inline]
    pub fn is_rows(&self) -> bool {
        self.rows.is_some()
    }

    /// `Ok` for results that carry no rows, such as the result of an `INSERT`.
    #[inline]
    pub fn result_not_rows(&self) -> Result<(), ResultNotRowsError> {
        match &self.rows {
            Some(_) => Err(ResultNotRowsError),
            None => Ok(()),
        }
    }

    /// Number of rows, if this is a rows result.
    #[inline]
    pub fn rows_num(&self) -> Option<usize> {
        self.rows.as_ref().map(|rows| rows.rows.len())
    }

    /// Column specifications, if this is a rows result.
    pub fn column_specs(&self) -> Option<&[ColumnSpec]> {
        self.rows.as_ref().map(|rows| rows.metadata.col_specs())
    }

    /// Borrows the rows, if this is a rows result.
    pub fn rows(&self) -> Option<&[Row]> {
        self.rows.as_ref().map(|rows| &rows.rows[..])
    }

    /// Takes the rows out, giving `self` back if this is not a rows result.
    #[allow(clippy::result_large_err)]
    pub fn into_rows_result(self) -> Result<Rows, IntoRowsResultError> {
        match self.rows {
            Some(rows) => Ok(rows),
            None => Err(IntoRowsResultError::ResultNotRows(self)),
        }
    }

    /// The only row of the result.
    pub fn single_row(&self) -> Result<&Row, SingleRowError> {
        let rows = self.rows().ok_or(SingleRowError::ResultNotRows)?;
        match rows {
            [row] => Ok(row),
            _ => Err(SingleRowError::UnexpectedRowCount(rows.len())),
        }
    }
}

/// An error returned by [`QueryResult::into_rows_result`]. Carries the
/// original result, which would otherwise be lost.
#[derive(Debug, Error, Clone)]
pub enum IntoRowsResultError {
    #[error("Result is not of Rows kind")]
    ResultNotRows(QueryResult),
}

/// An error returned by [`QueryResult::single_row`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SingleRowError {
    #[error("Result is not of Rows kind")]
    ResultNotRows,

    #[error("Expected a single row, but got {0} rows")]
    UnexpectedRowCount(usize),
}

/// It indicates that response to the request was, unexpectedly, of Rows kind.
#[derive(Debug, Error)]
#[error("The request response was, unexpectedly, of Rows kind")]
pub struct ResultNotRowsError;
