//! Errors of frame reading, request serialization and response parsing.

use super::TryFromPrimitiveError;
use crate::errors::CqlResponseKind;
use std::sync::Arc;
use thiserror::Error;

/// An error that occurred while reading a frame or its header from the socket.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received frame marked as coming from the server")]
    FrameFromServer,
    #[error("Received a frame from version {0}, but only versions 3 to 5 are supported")]
    VersionNotSupported(u8),
    #[error("Frame body of {0} bytes exceeds the maximum frame size")]
    BodyTooLarge(usize),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame is compressed, but compression is not supported")]
    CompressionNotSupported,
    #[error("Unrecognized opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("Malformed frame body extensions: {0}")]
    BodyExtensions(LowLevelDeserializationError),
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
}

/// An error that occurred while serializing a request body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestSerializationError {
    #[error("A length does not fit into its wire representation: {0}")]
    LengthOverflow(#[from] std::num::TryFromIntError),
    #[error("Too many values bound to a statement: {0}")]
    TooManyValues(usize),
    #[error("Too many statements in a batch: {0}")]
    TooManyStatements(usize),
}

/// An error that occurred while parsing a request body (used by test servers).
#[derive(Error, Debug, Clone)]
pub enum RequestDeserializationError {
    #[error("Malformed request body: {0}")]
    Malformed(#[from] LowLevelDeserializationError),
    #[error("Unknown request opcode {0:#04x}")]
    UnknownOpcode(u8),
}

/// An error that occurred while parsing the body of a response.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResponseParseError {
    /// A generic failure, attributed to the kind of the response.
    #[error("Malformed {kind} response: {err}")]
    Malformed {
        kind: CqlResponseKind,
        err: LowLevelDeserializationError,
    },
    /// One field of an ERROR response could not be read.
    #[error("Malformed field {field} of {db_error} error: {err}")]
    MalformedErrorField {
        db_error: &'static str,
        field: &'static str,
        err: LowLevelDeserializationError,
    },
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Unknown topology change type: {0}")]
    UnknownTopologyChangeType(String),
    #[error("Unknown status change type: {0}")]
    UnknownStatusChangeType(String),
    #[error("Unknown schema change target: {0}")]
    UnknownSchemaChangeTarget(String),
    #[error("Unknown RESULT kind: {0}")]
    UnknownResultKind(i32),
    #[error("Unsupported RESULT kind: {0}")]
    UnsupportedResultKind(&'static str),
}

impl ResponseParseError {
    pub(crate) fn malformed(
        kind: CqlResponseKind,
        err: impl Into<LowLevelDeserializationError>,
    ) -> Self {
        ResponseParseError::Malformed {
            kind,
            err: err.into(),
        }
    }
}

/// A low level deserialization error.
///
/// Returned by the `read_*` primitives of [`super::types`].
#[derive(Error, Debug, Clone)]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error("Failed to convert slice into array: {0}")]
    TryFromSliceError(#[from] std::array::TryFromSliceError),
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
    #[error("Unknown column type id: {0:#06x}")]
    UnknownColumnType(u16),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}
