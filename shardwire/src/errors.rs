//! This module contains the errors which can be returned by `shardwire::Session`
//! and by the components it is built from.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub use shardwire_cql::errors::{CqlResponseKind, DbError, ErrorReasonMap, FailureReason, WriteType};
use shardwire_cql::frame::frame_errors::{FrameError, RequestSerializationError, ResponseParseError};
use shardwire_cql::frame::request::RequestOpcode;
use shardwire_cql::frame::response::Error as CqlError;
use thiserror::Error;

use crate::routing::partitioner::TokenCalculationError;

/// Error that occurred during a query execution.
///
/// This is the only error a caller of `query_*` and `batch` sees: every
/// failed attempt either gets retried or ends up inside one of these.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The load balancing policy produced a plan with no hosts in it.
    #[error("Load balancing policy returned an empty plan")]
    EmptyPlan,

    /// Caller passed an invalid request.
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// The retry policy decided not to retry; this is the error of the
    /// last attempt, unchanged.
    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),

    /// Every host in the plan was tried and none succeeded.
    #[error("All {n} attempts failed, last error: {last_error}", n = .attempts.len())]
    AllAttemptsFailed {
        last_error: RequestAttemptError,
        /// Hosts tried, in order, together with the error each one returned.
        attempts: Vec<(SocketAddr, RequestAttemptError)>,
    },

    /// None of the hosts in the plan had a usable connection.
    #[error("No connections in the pool: {0}")]
    ConnectionPoolError(#[from] ConnectionPoolError),

    /// Client-side timeout elapsed before any attempt succeeded.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The session was closed while the request was in flight.
    #[error("The session has been closed")]
    SessionClosed,

    /// The request succeeded and changed the schema, but waiting for schema
    /// agreement afterwards failed.
    #[error("Failed to await schema agreement: {0}")]
    SchemaAgreementError(#[from] SchemaAgreementError),

    /// The request changed the keyspace, but propagating it to the pools failed.
    #[error("Failed to use keyspace: {0}")]
    UseKeyspaceError(#[from] UseKeyspaceError),
}

/// Error of a single attempt of sending a request over a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// ERROR response: the decoded error and the server's own reason text.
    #[error("Server error: {0} (reason: {1})")]
    DbError(DbError, String),

    #[error("Failed to serialize the request: {0}")]
    SerializationError(#[from] RequestSerializationError),

    #[error("Failed to deserialize the response: {0}")]
    ResponseParseError(#[from] ResponseParseError),

    #[error("Malformed response frame: {0}")]
    FrameError(Arc<FrameError>),

    #[error(
        "Received unexpected response from the server: {0}. Expected RESULT or ERROR response."
    )]
    UnexpectedResponse(CqlResponseKind),

    #[error(transparent)]
    BrokenConnectionError(#[from] BrokenConnectionError),

    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,
}

impl From<CqlError> for RequestAttemptError {
    fn from(error: CqlError) -> RequestAttemptError {
        RequestAttemptError::DbError(error.error, error.reason)
    }
}

impl From<FrameError> for RequestAttemptError {
    fn from(error: FrameError) -> RequestAttemptError {
        RequestAttemptError::FrameError(Arc::new(error))
    }
}

/// Error caused by caller creating an invalid request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BadQuery {
    #[error("Failed to compute the routing token: {0}")]
    TokenCalculation(#[from] TokenCalculationError),

    /// Passed invalid keyspace name to use
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// A batch needs at least one statement.
    #[error("Batch has no statements")]
    EmptyBatch,
}

/// Invalid keyspace name given to `Session::use_keyspace()`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BadKeyspaceName {
    /// Keyspace name is empty
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// Error that occurred during `Session::use_keyspace()`.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error("USE request failed: {0}")]
    RequestError(#[from] RequestAttemptError),

    #[error("Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, received: {result_keyspace_name_lowercase}")]
    KeyspaceNameMismatch {
        expected_keyspace_name_lowercase: String,
        result_keyspace_name_lowercase: String,
    },

    #[error("USE request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("The session has been closed")]
    SessionClosed,
}

/// Error of establishing a connection, including its setup handshake.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Input/Output error has occurred, connection broken etc.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// None of the source ports mapping to the shard could be bound.
    #[error("Could not find free source port for shard {0}")]
    NoSourcePortForShard(u32),

    /// Address translation failed
    #[error("Address translation failed: {0}")]
    TranslationError(#[from] TranslationError),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    #[error(transparent)]
    ConnectionSetupRequestError(#[from] ConnectionSetupRequestError),

    #[error("Failed to set the keyspace on a new connection: {0}")]
    UseKeyspaceError(#[from] UseKeyspaceError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

impl ConnectionError {
    /// Checks if this error indicates that a chosen source port/address cannot be bound.
    /// This is caused by one of the following:
    /// - The source address is already used by another socket,
    /// - The source address is reserved and the process does not have sufficient privileges to use it.
    pub fn is_address_unavailable_for_use(&self) -> bool {
        if let ConnectionError::IoError(io_error) = self {
            match io_error.kind() {
                ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable | ErrorKind::PermissionDenied => {
                    return true
                }
                _ => {}
            }
        }

        false
    }
}

/// A request of the connection setup (OPTIONS, STARTUP, AUTH_RESPONSE,
/// REGISTER) failed.
#[derive(Error, Debug, Clone)]
#[error("Failed to perform a connection setup request. Request: {request:?}, reason: {error}")]
pub struct ConnectionSetupRequestError {
    request: RequestOpcode,
    error: ConnectionSetupRequestErrorKind,
}

impl ConnectionSetupRequestError {
    pub(crate) fn new(request: RequestOpcode, error: impl Into<ConnectionSetupRequestErrorKind>) -> Self {
        ConnectionSetupRequestError {
            request,
            error: error.into(),
        }
    }

    pub fn request(&self) -> RequestOpcode {
        self.request
    }

    pub fn error(&self) -> &ConnectionSetupRequestErrorKind {
        &self.error
    }
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupRequestErrorKind {
    #[error(transparent)]
    RequestFailed(#[from] RequestAttemptError),

    #[error("Server requires authentication with {0}, but no authenticator was configured")]
    MissingAuthentication(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

/// An error that breaks a connection: every request in flight on it fails
/// with a clone of this error and the owning pool opens a replacement.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(kind: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(kind))
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    #[error("Failed to read a frame: {0}")]
    FrameError(#[from] FrameError),

    #[error("Failed to write to the socket: {0}")]
    WriteError(std::io::Error),

    #[error("Timed out while waiting for response to keepalive request on connection to node {0}")]
    KeepaliveTimeout(SocketAddr),

    #[error("Failed to execute keepalive request: {0}")]
    KeepaliveRequestError(RequestAttemptError),

    #[error("Received response for unknown stream id {0}")]
    UnknownStreamId(i16),

    #[error("Failed to handle server event: {0}")]
    EventHandlingError(ResponseParseError),

    #[error("Received a server event of kind {0}, which is not an EVENT")]
    UnexpectedEventKind(CqlResponseKind),

    #[error("Failed to deliver a server event: the receiving side is gone")]
    EventChannelClosed,

    #[error("The connection's router task has stopped")]
    ChannelError,
}

/// Selected node's connection pool is in invalid state.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    #[error("The pool is broken; Last connection failed with: {last_connection_error}")]
    Broken {
        last_connection_error: ConnectionError,
    },

    #[error("Pool is still being initialized")]
    Initializing,

    #[error("The node is down or has been disabled by the host filter")]
    NodeDisabled,
}

/// Error of waiting for schema agreement.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SchemaAgreementError {
    #[error("Failed to read schema version: {0}")]
    RequestError(#[from] RequestAttemptError),

    #[error("No connection to read schema version with: {0}")]
    ConnectionPoolError(#[from] ConnectionPoolError),

    #[error("Schema version row is missing or malformed")]
    MalformedSchemaVersion,

    #[error("Schema agreement exceeded {0:?}")]
    Timeout(Duration),

    #[error("Waiting for schema agreement was canceled")]
    Canceled,

    #[error("The session has been closed")]
    SessionClosed,
}

/// Error of reading cluster metadata through the control connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    #[error("Control connection failed: {0}")]
    ConnectionError(#[from] ConnectionError),

    #[error("Metadata query failed: {0}")]
    RequestError(#[from] RequestAttemptError),

    #[error("Query to {table} returned no rows")]
    NoRows { table: &'static str },

    #[error("Malformed row in {table}: {reason}")]
    MalformedRow { table: &'static str, reason: String },

    #[error("Address translation failed: {0}")]
    TranslationError(#[from] TranslationError),

    #[error("No known host may be used for the control connection")]
    NoEligibleHosts,

    #[error("The cluster worker has stopped")]
    WorkerStopped,
}

/// Error caused by failed address translation done before establishing connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TranslationError {
    #[error("No rule for address {0}")]
    NoRuleForAddress(SocketAddr),
    #[error("Invalid address in rule: {0}")]
    InvalidAddressInRule(String),
}

/// Error that occurred during session creation
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// Failed to resolve hostname passed in Session creation
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// List of known nodes passed to Session constructor is empty
    /// There needs to be at least one node to connect to
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// No contact point accepted the control connection, or reading
    /// metadata through it failed.
    #[error("Failed to read cluster metadata: {0}")]
    MetadataError(#[from] MetadataError),

    #[error("Failed to use the initial keyspace: {0}")]
    UseKeyspaceError(#[from] UseKeyspaceError),
}
