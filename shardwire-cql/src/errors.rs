//! Errors the database can send back in an `ERROR` response.

use crate::Consistency;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;

/// Per-replica failure reasons attached to `READ_FAILURE` and `WRITE_FAILURE`.
///
/// Only protocol version 5 and newer report which replica failed and why.
/// On older versions the map is always empty and only the failure count is known.
pub type ErrorReasonMap = HashMap<IpAddr, FailureReason>;

/// The error carried by an `ERROR` response, one variant per error code.
///
/// Variants with fields carry the code-specific body of the response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Syntax error in the statement")]
    SyntaxError,

    #[error("Statement rejected as invalid")]
    Invalid,

    /// `CREATE` of a keyspace or table that exists. `table` is empty for a
    /// keyspace.
    #[error("{keyspace}.{table} already exists")]
    AlreadyExists { keyspace: String, table: String },

    #[error("Function {keyspace}.{function}({arg_types:?}) failed")]
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    #[error("Credentials rejected")]
    AuthenticationError,

    #[error("Not authorized to run the statement")]
    Unauthorized,

    #[error("Statement conflicts with the server configuration")]
    ConfigError,

    /// The coordinator knew up front that too few replicas were alive.
    #[error("Only {alive} of {required} replicas needed for {consistency} are alive")]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    #[error("Coordinator overloaded")]
    Overloaded,

    #[error("Coordinator still bootstrapping")]
    IsBootstrapping,

    #[error("Truncate failed")]
    TruncateError,

    /// `data_present` tells whether the replica asked for the data itself
    /// (not just a digest) answered.
    #[error(
        "Read timed out at {consistency}: {received} of {required} replicas answered \
        (data present: {data_present})"
    )]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },

    #[error(
        "{write_type} write timed out at {consistency}: \
        {received} of {required} replicas acknowledged"
    )]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    /// Replicas failed the read for a reason other than a timeout.
    #[error(
        "Read failed at {consistency} on {numfailures} replicas: {received} of {required} \
        answered (data present: {data_present})"
    )]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        /// Empty before protocol v5.
        reasons: ErrorReasonMap,
        data_present: bool,
    },

    #[error(
        "{write_type} write failed at {consistency} on {numfailures} replicas: \
        {received} of {required} acknowledged"
    )]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        /// Empty before protocol v5.
        reasons: ErrorReasonMap,
        write_type: WriteType,
    },

    /// The coordinator does not know the prepared statement id.
    #[error("Unknown prepared statement {statement_id:?}")]
    Unprepared { statement_id: Bytes },

    #[error("Internal server error")]
    ServerError,

    /// The server could not make sense of a request we sent.
    #[error("Server reported a protocol error")]
    ProtocolError,

    #[error("Error code {0:#06x} not defined by the protocol")]
    Other(i32),
}

impl DbError {
    /// The numeric error code this error is transmitted with.
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::ReadFailure { .. } => 0x1300,
            DbError::FunctionFailure { .. } => 0x1400,
            DbError::WriteFailure { .. } => 0x1500,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }

    /// Per-replica failure reasons, if this error carries them.
    pub fn reasons(&self) -> Option<&ErrorReasonMap> {
        match self {
            DbError::ReadFailure { reasons, .. } | DbError::WriteFailure { reasons, .. } => {
                Some(reasons)
            }
            _ => None,
        }
    }
}

/// Why a single replica failed a read or a write (protocol v5 reason map).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The replica did not say.
    Unknown,
    /// Too many tombstones were read.
    ReadTooManyTombstones,
    /// A secondary index was not available.
    IndexNotAvailable,
    /// Writing to CDC-tracked data failed.
    CdcWriteFailure,
    /// A reason code this crate does not know.
    Other(u16),
}

impl From<u16> for FailureReason {
    fn from(code: u16) -> Self {
        match code {
            0x0000 => FailureReason::Unknown,
            0x0001 => FailureReason::ReadTooManyTombstones,
            0x0002 => FailureReason::IndexNotAvailable,
            0x0003 => FailureReason::CdcWriteFailure,
            other => FailureReason::Other(other),
        }
    }
}

/// The kind of write a `WRITE_TIMEOUT` or `WRITE_FAILURE` concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    Simple,
    /// Logged batch whose batch log write succeeded.
    Batch,
    UnloggedBatch,
    Counter,
    /// Logged batch that timed out writing its batch log.
    BatchLog,
    /// Paxos phase of a conditional update.
    Cas,
    /// Materialized view update that could not take its lock in time.
    View,
    /// Write rejected because CDC log space ran out.
    Cdc,
    Other(String),
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<&str> for WriteType {
    fn from(write_type_str: &str) -> WriteType {
        match write_type_str {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            _ => WriteType::Other(write_type_str.to_string()),
        }
    }
}

impl WriteType {
    /// The string this write type is transmitted as.
    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other(s) => s.as_str(),
        }
    }
}

/// Opcode of a response, for error reporting.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CqlResponseKind {
    Error,
    Ready,
    Authenticate,
    Supported,
    Result,
    Event,
    AuthChallenge,
    AuthSuccess,
}

impl std::fmt::Display for CqlResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            CqlResponseKind::Error => "ERROR",
            CqlResponseKind::Ready => "READY",
            CqlResponseKind::Authenticate => "AUTHENTICATE",
            CqlResponseKind::Supported => "SUPPORTED",
            CqlResponseKind::Result => "RESULT",
            CqlResponseKind::Event => "EVENT",
            CqlResponseKind::AuthChallenge => "AUTH_CHALLENGE",
            CqlResponseKind::AuthSuccess => "AUTH_SUCCESS",
        };

        f.write_str(kind_str)
    }
}

#[cfg(test)]
mod tests {
    use super::{DbError, FailureReason, WriteType};
    use crate::Consistency;

    #[test]
    fn write_type_from_str() {
        let test_cases: [(&str, WriteType); 9] = [
            ("SIMPLE", WriteType::Simple),
            ("BATCH", WriteType::Batch),
            ("UNLOGGED_BATCH", WriteType::UnloggedBatch),
            ("COUNTER", WriteType::Counter),
            ("BATCH_LOG", WriteType::BatchLog),
            ("CAS", WriteType::Cas),
            ("VIEW", WriteType::View),
            ("CDC", WriteType::Cdc),
            ("SOMEOTHER", WriteType::Other("SOMEOTHER".to_string())),
        ];

        for (wire, expected) in &test_cases {
            let parsed = WriteType::from(*wire);
            assert_eq!(parsed, *expected);
            assert_eq!(parsed.as_str(), *wire);
        }
    }

    #[test]
    fn failure_reason_codes() {
        assert_eq!(FailureReason::from(0), FailureReason::Unknown);
        assert_eq!(FailureReason::from(3), FailureReason::CdcWriteFailure);
        assert_eq!(FailureReason::from(77), FailureReason::Other(77));
    }

    #[test]
    fn unavailable_code_and_message() {
        let err = DbError::Unavailable {
            consistency: Consistency::LocalQuorum,
            required: 2,
            alive: 1,
        };
        assert_eq!(err.code(), 0x1000);
        assert_eq!(
            err.to_string(),
            "Only 1 of 2 replicas needed for LocalQuorum are alive"
        );
    }
}
