use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use shardwire_cql::frame::request::{self, options, RequestOpcode, SerializableRequest};
use shardwire_cql::frame::response::authenticate::Authenticate;
use shardwire_cql::frame::response::event::Event;
use shardwire_cql::frame::response::result::Rows;
use shardwire_cql::frame::response::{self as response, Response, ResponseOpcode};
use shardwire_cql::frame::server_event_type::EventType;
use shardwire_cql::frame::{self, FrameParams, ProtocolVersion, SerializedRequest};
use shardwire_cql::value::{CqlValue, SerializedValues};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    ConnectionSetupRequestError, ConnectionSetupRequestErrorKind, RequestAttemptError,
    SchemaAgreementError, UseKeyspaceError,
};
use crate::response::{NonErrorAuthResponse, NonErrorStartupResponse, PagingState, QueryResponse};
use crate::routing::{Shard, ShardInfo, Sharder, ShardingError};
use crate::statement::batch::Batch;
use crate::statement::{Consistency, PageSize, SerialConsistency, Statement};

// Query for schema agreement
const LOCAL_VERSION: &str = "SELECT schema_version FROM system.local WHERE key='local'";

/// One TCP connection speaking the binary protocol, with requests
/// multiplexed over stream ids.
///
/// All I/O happens on a router task owned by the connection; dropping the
/// connection stops it. Requests in flight when the connection breaks fail
/// with a [`BrokenConnectionError`], which is also reported once through the
/// [`ErrorReceiver`] returned at creation.
pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    features: ConnectionFeatures,
    router_handle: Arc<RouterHandle>,
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,
    protocol_version: ProtocolVersion,
}

impl RouterHandle {
    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        custom_payload: Option<&HashMap<String, Option<Bytes>>>,
        tracing: bool,
    ) -> Result<TaskResponse, RequestAttemptError> {
        let serialized_request =
            SerializedRequest::make(request, self.protocol_version, custom_payload, tracing)?;

        let (response_sender, receiver) = oneshot::channel();

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler: response_sender,
            })
            .await
            .map_err(|_| -> BrokenConnectionError { BrokenConnectionErrorKind::ChannelError.into() })?;

        // If the caller gives up waiting, the stream id stays allocated until
        // the response arrives; the reader then drops the response.
        receiver.await.map_err(|_| -> BrokenConnectionError {
            BrokenConnectionErrorKind::ChannelError.into()
        })?
    }
}

#[derive(Default)]
pub(crate) struct ConnectionFeatures {
    shard_info: Option<ShardInfo>,
    shard_aware_port: Option<u16>,
}

type ResponseHandler = oneshot::Sender<Result<TaskResponse, RequestAttemptError>>;

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

/// Configuration of a single connection.
#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) connect_timeout: Duration,
    pub(crate) tcp_nodelay: bool,
    /// Idle time before the OS starts sending TCP keepalive probes.
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    /// Interval of OPTIONS heartbeats sent over an idle connection.
    pub(crate) keepalive_interval: Option<Duration>,
    /// Time after which an unanswered heartbeat breaks the connection.
    pub(crate) keepalive_timeout: Option<Duration>,
    /// Set for control connections: server events are sent here. The
    /// reader never waits on it, so the channel is unbounded.
    pub(crate) event_sender: Option<mpsc::UnboundedSender<Event>>,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::default(),
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            tcp_keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            event_sender: None,
            authenticator: None,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("protocol_version", &self.protocol_version)
            .field("connect_timeout", &self.connect_timeout)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("is_control", &self.event_sender.is_some())
            .field("has_authenticator", &self.authenticator.is_some())
            .finish()
    }
}

// Used to listen for fatal error in connection
pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

impl Connection {
    /// Opens a TCP connection and spawns its router, but does not send any
    /// frames yet (no OPTIONS/STARTUP handshake nor REGISTER requests).
    async fn new(
        connect_address: SocketAddr,
        source_port: Option<u16>,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream = tokio::time::timeout(
            config.connect_timeout,
            connect_with_source_port(connect_address, source_port),
        )
        .await
        .map_err(|_| ConnectionError::ConnectTimeout)??;
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            protocol_version: config.protocol_version,
        });

        let (task, _worker_handle) = Self::router(
            config.clone(),
            stream,
            receiver,
            error_sender,
            router_handle.clone(),
            connect_address,
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle,
            config,
            features: Default::default(),
            connect_address,
            router_handle,
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // "time" in socket2 terms is the idle time before probes start,
        // which is what our "interval" means.
        let tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
        let tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        let tcp_keepalive = tcp_keepalive.with_retries(10);

        SockRef::from(stream).set_tcp_keepalive(&tcp_keepalive)
    }

    async fn get_options(&self) -> Result<response::Supported, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::Options, kind)
        };

        let response = self
            .send_request(&request::Options, None, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Supported(supported) => Ok(supported),
            Response::Error(error) => Err(err(RequestAttemptError::from(error).into())),
            other => Err(err(
                RequestAttemptError::UnexpectedResponse(other.to_response_kind()).into(),
            )),
        }
    }

    async fn startup(
        &self,
        options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<NonErrorStartupResponse, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::Startup, kind)
        };

        let response = self
            .send_request(&request::Startup { options }, None, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Ready => Ok(NonErrorStartupResponse::Ready),
            Response::Authenticate(auth) => Ok(NonErrorStartupResponse::Authenticate(auth)),
            Response::Error(error) => Err(err(RequestAttemptError::from(error).into())),
            other => Err(err(
                RequestAttemptError::UnexpectedResponse(other.to_response_kind()).into(),
            )),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::AuthResponse, kind)
        };

        let authenticator = authenticate.authenticator_name.as_str();
        let Some(provider) = self.config.authenticator.as_ref() else {
            return Err(err(ConnectionSetupRequestErrorKind::MissingAuthentication(
                authenticator.to_owned(),
            )));
        };

        let (mut response, mut auth_session) = provider
            .start_authentication_session(authenticator)
            .await
            .map_err(|e| err(ConnectionSetupRequestErrorKind::AuthenticationFailed(e)))?;

        loop {
            match self.authenticate_response(response).await? {
                NonErrorAuthResponse::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(|e| err(ConnectionSetupRequestErrorKind::AuthenticationFailed(e)))?;
                }
                NonErrorAuthResponse::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(|e| err(ConnectionSetupRequestErrorKind::AuthenticationFailed(e)))?;
                    return Ok(());
                }
            }
        }
    }

    async fn authenticate_response(
        &self,
        response: Option<Vec<u8>>,
    ) -> Result<NonErrorAuthResponse, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::AuthResponse, kind)
        };

        let response = self
            .send_request(&request::AuthResponse { response }, None, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::AuthSuccess(success) => Ok(NonErrorAuthResponse::AuthSuccess(success)),
            Response::AuthChallenge(challenge) => {
                Ok(NonErrorAuthResponse::AuthChallenge(challenge))
            }
            Response::Error(error) => Err(err(RequestAttemptError::from(error).into())),
            other => Err(err(
                RequestAttemptError::UnexpectedResponse(other.to_response_kind()).into(),
            )),
        }
    }

    async fn register(
        &self,
        event_types_to_register_for: Vec<EventType>,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::Register, kind)
        };

        let register_frame = request::Register {
            event_types_to_register_for,
        };

        let response = self
            .send_request(&register_frame, None, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Ready => Ok(()),
            Response::Error(error) => Err(err(RequestAttemptError::from(error).into())),
            other => Err(err(
                RequestAttemptError::UnexpectedResponse(other.to_response_kind()).into(),
            )),
        }
    }

    /// Sends a statement without paging, with consistency `ONE`.
    /// Used for the driver's own requests.
    pub(crate) async fn query_raw_unpaged(
        &self,
        statement: &Statement,
    ) -> Result<QueryResponse, RequestAttemptError> {
        self.query_raw_with_consistency(
            statement,
            SerializedValues::EMPTY,
            statement.config.determine_consistency(Consistency::One),
            statement.get_serial_consistency(),
            None,
            PagingState::start(),
        )
        .await
    }

    /// Reads all rows of an internal query.
    pub(crate) async fn query_rows(&self, query: &str) -> Result<Rows, RequestAttemptError> {
        self.query_raw_unpaged(&Statement::new(query))
            .await?
            .into_rows()
    }

    pub(crate) async fn query_raw_with_consistency(
        &self,
        statement: &Statement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        page_size: Option<PageSize>,
        paging_state: PagingState,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let query_frame = request::Query {
            contents: Cow::Borrowed(&statement.contents),
            parameters: request::QueryParameters {
                consistency,
                serial_consistency,
                values: Cow::Borrowed(values),
                page_size: page_size.map(|size| size.inner()),
                paging_state: paging_state.into_raw(),
                skip_metadata: false,
                timestamp: statement.get_timestamp(),
            },
        };

        self.send_request(
            &query_frame,
            statement.config.custom_payload.as_ref(),
            statement.config.tracing,
        )
        .await
    }

    pub(crate) async fn batch_with_consistency(
        &self,
        batch: &Batch,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let statements: Vec<request::BatchStatement<'_>> = batch
            .statements()
            .iter()
            .map(|s| request::BatchStatement {
                text: Cow::Borrowed(s.statement.contents.as_str()),
                values: Cow::Borrowed(&s.values),
            })
            .collect();

        let batch_frame = request::Batch {
            statements: Cow::Owned(statements),
            batch_type: batch.get_type(),
            consistency,
            serial_consistency,
            timestamp: batch.config.timestamp,
        };

        self.send_request(
            &batch_frame,
            batch.config.custom_payload.as_ref(),
            batch.config.tracing,
        )
        .await
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        // Keyspace names cannot be bound values, so they are inlined.
        let query: Statement = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()).into(),
            false => format!("USE {}", keyspace_name.as_str()).into(),
        };

        let query_response = self
            .query_raw_unpaged(&query)
            .await?
            .into_non_error_query_response()?;

        match query_response.as_set_keyspace() {
            Some(set_keyspace) => {
                if !set_keyspace
                    .keyspace_name
                    .eq_ignore_ascii_case(keyspace_name.as_str())
                {
                    return Err(UseKeyspaceError::KeyspaceNameMismatch {
                        expected_keyspace_name_lowercase: keyspace_name.as_str().to_lowercase(),
                        result_keyspace_name_lowercase: set_keyspace.keyspace_name.to_lowercase(),
                    });
                }
                Ok(())
            }
            None => Err(UseKeyspaceError::RequestError(
                RequestAttemptError::UnexpectedResponse(
                    query_response.response.to_response_kind(),
                ),
            )),
        }
    }

    pub(crate) async fn fetch_schema_version(&self) -> Result<Uuid, SchemaAgreementError> {
        let rows = self.query_rows(LOCAL_VERSION).await?;
        rows.rows
            .into_iter()
            .next()
            .and_then(|mut row| row.columns.get_mut(0).and_then(Option::take))
            .as_ref()
            .and_then(CqlValue::as_uuid)
            .ok_or(SchemaAgreementError::MalformedSchemaVersion)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        custom_payload: Option<&HashMap<String, Option<Bytes>>>,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let task_response = self
            .router_handle
            .send_request(request, custom_payload, tracing)
            .await?;

        Self::parse_response(task_response, self.config.protocol_version)
    }

    fn parse_response(
        task_response: TaskResponse,
        version: ProtocolVersion,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let body_with_ext =
            frame::parse_response_body_extensions(task_response.params.flags, task_response.body)?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response =
            Response::deserialize(version, task_response.opcode, &mut &*body_with_ext.body)?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
            custom_payload: body_with_ext.custom_payload,
        })
    }

    async fn router(
        config: ConnectionConfig,
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        router_handle: Arc<RouterHandle>,
        node_address: SocketAddr,
    ) {
        let (read_half, write_half) = split(stream);
        // Reader and writer run on the same task and never hold the lock
        // across an .await, so it is never contended.
        let handler_map = StdMutex::new(ResponseHandlerMap::new());

        let k = Self::keepaliver(
            router_handle,
            config.keepalive_interval,
            config.keepalive_timeout,
            node_address,
        );

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            config.event_sender,
            config.protocol_version,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            receiver,
        );

        let error: BrokenConnectionError = match futures::try_join!(r, w, k) {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };

        debug!(node = %node_address, error = %error, "Connection broken");

        // Respond to all pending requests with the error
        let response_handlers = handler_map
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_handlers();

        for (_, handler) in response_handlers {
            // Ignore sending error, request was dropped
            let _ = handler.send(Err(error.clone().into()));
        }

        // If someone is listening for connection errors notify them
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        event_sender: Option<mpsc::UnboundedSender<Event>>,
        version: ProtocolVersion,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(BrokenConnectionErrorKind::FrameError)?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&-1) {
                Ordering::Less => {
                    // Negative streams other than -1 are reserved; nothing uses them.
                    continue;
                }
                Ordering::Equal => {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(response, version, event_sender)?;
                    }
                    continue;
                }
                _ => {}
            }

            let handler = handler_map
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .lookup(params.stream);

            match handler {
                Some(handler) => {
                    // The requester may have stopped waiting; that is fine.
                    let _ = handler.send(Ok(response));
                }
                None => {
                    // Unsolicited frame. This indicates a bug either in the
                    // driver or in the database.
                    debug!(
                        "Received response with unexpected StreamId {}",
                        params.stream
                    );
                    return Err(BrokenConnectionErrorKind::UnknownStreamId(params.stream).into());
                }
            }
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        let mut handler_map_guard = handler_map.lock().unwrap_or_else(PoisonError::into_inner);
        match handler_map_guard.allocate(response_handler) {
            Ok(stream_id) => Some(stream_id),
            Err(response_handler) => {
                error!("Could not allocate stream id");
                let _ = response_handler.send(Err(RequestAttemptError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection is dropped, the sender half of the channel is
        // dropped too, the loop ends and the whole router stops.
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            while let Some(stream_id) = Self::alloc_stream_id(handler_map, task.response_handler) {
                let mut req = task.serialized_request;
                req.set_stream(stream_id);
                let req_data: &[u8] = req.get_data();
                total_sent += req_data.len();
                num_requests += 1;
                write_half
                    .write_all(req_data)
                    .await
                    .map_err(BrokenConnectionErrorKind::WriteError)?;
                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => break,
                }
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    async fn keepaliver(
        router_handle: Arc<RouterHandle>,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
        node_address: SocketAddr,
    ) -> Result<(), BrokenConnectionError> {
        let Some(keepalive_interval) = keepalive_interval else {
            // No keepalives are to be sent.
            return Ok(());
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // Use up the first, instant tick.

        // Default behaviour (Burst) is not suitable for sending keepalives.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let keepalive_query = router_handle.send_request(&request::Options, None, false);
            let query_result = match keepalive_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, keepalive_query).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(
                            node = %node_address,
                            "Timed out while waiting for response to keepalive request"
                        );
                        return Err(BrokenConnectionErrorKind::KeepaliveTimeout(node_address).into());
                    }
                },
                None => keepalive_query.await,
            };

            if let Err(err) = query_result {
                warn!(node = %node_address, error = %err, "Failed to execute keepalive request");
                return Err(BrokenConnectionErrorKind::KeepaliveRequestError(err).into());
            }

            trace!(node = %node_address, "Keepalive request successful");
        }
    }

    fn handle_event(
        task_response: TaskResponse,
        version: ProtocolVersion,
        event_sender: &mpsc::UnboundedSender<Event>,
    ) -> Result<(), BrokenConnectionError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            task_response.body,
        )
        .map_err(BrokenConnectionErrorKind::FrameError)?;

        let response =
            Response::deserialize(version, task_response.opcode, &mut &*body_with_ext.body)
                .map_err(BrokenConnectionErrorKind::EventHandlingError)?;

        let event = match response {
            Response::Event(event) => event,
            other => {
                error!("Expected to receive Event response, got {:?}", other);
                return Err(
                    BrokenConnectionErrorKind::UnexpectedEventKind(other.to_response_kind()).into(),
                );
            }
        };

        event_sender
            .send(event)
            .map_err(|_| BrokenConnectionErrorKind::EventChannelClosed.into())
    }

    pub(crate) fn get_shard_info(&self) -> &Option<ShardInfo> {
        &self.features.shard_info
    }

    pub(crate) fn get_shard_aware_port(&self) -> Option<u16> {
        self.features.shard_aware_port
    }

    fn set_features(&mut self, features: ConnectionFeatures) {
        self.features = features;
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .field("shard", &self.features.shard_info.as_ref().map(|s| s.shard))
            .finish_non_exhaustive()
    }
}

/// Opens a connection and performs its setup on protocol level:
/// - performs the OPTIONS/STARTUP handshake, authenticating if asked to;
/// - registers for all event types using REGISTER request (if this is a
///   control connection).
pub(crate) async fn open_connection(
    addr: SocketAddr,
    source_port: Option<u16>,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let (mut connection, error_receiver) =
        Connection::new(addr, source_port, config.clone()).await?;

    // Get OPTIONS SUPPORTED by the cluster.
    let mut supported = connection.get_options().await?;

    // Sharded nodes report how the connection was assigned.
    let shard_info = match ShardInfo::try_from(&supported.options) {
        Ok(info) => Some(info),
        Err(ShardingError::NoShardInfo) => {
            trace!(node = %addr, "No sharding information received");
            None
        }
        Err(e) => {
            error!(
                node = %addr,
                error = %e,
                "Error while parsing sharding information. Proceeding with no sharding info."
            );
            None
        }
    };
    let shard_aware_port = supported
        .options
        .remove(options::SCYLLA_SHARD_AWARE_PORT)
        .unwrap_or_default()
        .first()
        .and_then(|p| p.parse::<u16>().ok());

    connection.set_features(ConnectionFeatures {
        shard_info,
        shard_aware_port,
    });

    let mut options = HashMap::new();
    options.insert(
        Cow::Borrowed(options::CQL_VERSION),
        Cow::Borrowed(options::DEFAULT_CQL_VERSION),
    );
    options.insert(
        Cow::Borrowed(options::DRIVER_NAME),
        Cow::Borrowed(options::DEFAULT_DRIVER_NAME),
    );
    options.insert(
        Cow::Borrowed(options::DRIVER_VERSION),
        Cow::Borrowed(options::DEFAULT_DRIVER_VERSION),
    );

    match connection.startup(options).await? {
        NonErrorStartupResponse::Ready => {}
        NonErrorStartupResponse::Authenticate(authenticate) => {
            connection.perform_authenticate(&authenticate).await?;
        }
    }

    if connection.config.event_sender.is_some() {
        let all_event_types = vec![
            EventType::TopologyChange,
            EventType::StatusChange,
            EventType::SchemaChange,
        ];
        connection.register(all_event_types).await?;
    }

    Ok((connection, error_receiver))
}

/// Opens a connection to the shard-aware port, choosing the source port so
/// that the node assigns it to `shard`. Ports that cannot be bound are skipped.
pub(crate) async fn open_connection_to_shard_aware_port(
    addr: SocketAddr,
    shard: Shard,
    sharder: Sharder,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    for port in sharder.iter_source_ports_for_shard(shard) {
        match open_connection(addr, Some(port), config).await {
            Err(err) if err.is_address_unavailable_for_use() => continue,
            result => return result,
        }
    }

    // Tried all source ports for that shard, give up
    Err(ConnectionError::NoSourcePortForShard(shard))
}

async fn connect_with_source_port(
    connect_address: SocketAddr,
    source_port: Option<u16>,
) -> Result<TcpStream, std::io::Error> {
    // Binding to port 0 is equivalent to choosing random ephemeral port.
    let source_port = source_port.unwrap_or(0);

    let socket = match connect_address {
        SocketAddr::V4(_) => {
            let socket = TcpSocket::new_v4()?;
            socket.bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), source_port))?;
            socket
        }
        SocketAddr::V6(_) => {
            let socket = TcpSocket::new_v6()?;
            socket.bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), source_port))?;
            socket
        }
    };
    socket.connect(connect_address).await
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,
}

impl ResponseHandlerMap {
    fn new() -> Self {
        Self {
            stream_set: StreamIdSet::new(),
            handlers: HashMap::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        match self.stream_set.allocate() {
            Some(stream_id) => {
                self.handlers.insert(stream_id, response_handler);
                Ok(stream_id)
            }
            None => Err(response_handler),
        }
    }

    fn lookup(&mut self, stream_id: i16) -> Option<ResponseHandler> {
        let handler = self.handlers.remove(&stream_id)?;
        self.stream_set.free(stream_id);
        Some(handler)
    }

    // Used after the connection breaks, to fail every pending request.
    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

struct StreamIdSet {
    used_bitmap: Box<[u64]>,
}

impl StreamIdSet {
    fn new() -> Self {
        const BITMAP_SIZE: usize = (i16::MAX as usize + 1) / 64;
        Self {
            used_bitmap: vec![0; BITMAP_SIZE].into_boxed_slice(),
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                *block |= 1u64 << off;
                let stream_id = off as i16 + block_id as i16 * 64;
                return Some(stream_id);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
    }
}

/// A keyspace name that passed validation, ready to be inlined into `USE`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Up to 48 characters, alphanumeric or underscore. Servers also accept
    // an underscore as the first character, so we do too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let keyspace_name_len = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        if let Some(illegal) = keyspace_name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(BadKeyspaceName::IllegalCharacter(
                keyspace_name.to_string(),
                illegal,
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use shardwire_cql::errors::DbError;
    use shardwire_cql::frame::response::event::{Event, StatusChangeEvent};
    use tokio::sync::mpsc;

    use super::*;
    use crate::authentication::PlainTextAuthenticator;
    use crate::test_utils::mock_server::{MockCluster, MockNodeConfig};
    use crate::test_utils::setup_tracing;

    #[test]
    fn stream_ids_are_reused_after_free() {
        let mut set = StreamIdSet::new();
        assert_eq!(set.allocate(), Some(0));
        assert_eq!(set.allocate(), Some(1));
        set.free(0);
        assert_eq!(set.allocate(), Some(0));
        assert_eq!(set.allocate(), Some(2));
    }

    #[test]
    fn stream_ids_run_out() {
        let mut set = StreamIdSet::new();
        for expected in 0..=i16::MAX {
            assert_eq!(set.allocate(), Some(expected));
        }
        assert_eq!(set.allocate(), None);
        set.free(1234);
        assert_eq!(set.allocate(), Some(1234));
    }

    #[test]
    fn keyspace_name_validation() {
        assert!(VerifiedKeyspaceName::new("ks_1".to_owned(), false).is_ok());
        assert!(VerifiedKeyspaceName::new("_ks".to_owned(), false).is_ok());
        assert_eq!(
            VerifiedKeyspaceName::new(String::new(), false),
            Err(BadKeyspaceName::Empty)
        );
        let long = "a".repeat(49);
        assert_eq!(
            VerifiedKeyspaceName::new(long.clone(), false),
            Err(BadKeyspaceName::TooLong(long, 49))
        );
        assert_eq!(
            VerifiedKeyspaceName::new("ks-1".to_owned(), false),
            Err(BadKeyspaceName::IllegalCharacter("ks-1".to_owned(), '-'))
        );
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn handshake_and_system_queries() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig::sharded(3)]).await;
        let node = &cluster.nodes()[0];

        let (conn, _errors) = open_connection(node.addr(), None, &ConnectionConfig::default())
            .await
            .unwrap();

        let shard_info = conn.get_shard_info().clone().unwrap();
        assert_eq!(shard_info.nr_shards.get(), 3);
        assert_eq!(conn.get_shard_aware_port(), node.shard_aware_port());

        let rows = conn
            .query_rows("SELECT host_id FROM system.local WHERE key='local'")
            .await
            .unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert_eq!(
            conn.fetch_schema_version().await.unwrap(),
            cluster.schema_version()
        );

        let ks = VerifiedKeyspaceName::new("my_ks".to_owned(), false).unwrap();
        conn.use_keyspace(&ks).await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn shard_aware_port_selects_shard() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig::sharded(4)]).await;
        let node = &cluster.nodes()[0];

        let (probe, _) = open_connection(node.addr(), None, &ConnectionConfig::default())
            .await
            .unwrap();
        let sharder = probe.get_shard_info().as_ref().unwrap().get_sharder();
        let port = probe.get_shard_aware_port().unwrap();
        let shard_aware_addr = SocketAddr::new(node.addr().ip(), port);

        for shard in 0..4 {
            let (conn, _) = open_connection_to_shard_aware_port(
                shard_aware_addr,
                shard,
                sharder.clone(),
                &ConnectionConfig::default(),
            )
            .await
            .unwrap();
            assert_eq!(conn.get_shard_info().as_ref().unwrap().shard as Shard, shard);
        }
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn server_errors_and_events() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig::default()]).await;
        cluster.set_query_error("SELECT * FROM ks.broken", DbError::Overloaded);
        let node = &cluster.nodes()[0];

        let (event_sender, mut events) = mpsc::unbounded_channel();
        let config = ConnectionConfig {
            event_sender: Some(event_sender),
            ..Default::default()
        };
        let (conn, _errors) = open_connection(node.addr(), None, &config).await.unwrap();
        assert!(conn.get_shard_info().is_none());

        let err = conn
            .query_raw_unpaged(&Statement::new("SELECT * FROM ks.broken"))
            .await
            .unwrap()
            .into_non_error_query_response()
            .unwrap_err();
        assert_matches!(err, RequestAttemptError::DbError(DbError::Overloaded, _));

        let down = Event::StatusChange(StatusChangeEvent::Down(node.addr()));
        cluster.push_event(down.clone());
        assert_eq!(events.recv().await, Some(down));
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn authentication() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig {
            credentials: Some(("user".to_owned(), "pass".to_owned())),
            ..Default::default()
        }])
        .await;
        let addr = cluster.nodes()[0].addr();

        let err = open_connection(addr, None, &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert_matches!(
            err,
            ConnectionError::ConnectionSetupRequestError(e)
                if matches!(e.error(), ConnectionSetupRequestErrorKind::MissingAuthentication(_))
        );

        let wrong = ConnectionConfig {
            authenticator: Some(Arc::new(PlainTextAuthenticator::new("user", "nope"))),
            ..Default::default()
        };
        assert!(open_connection(addr, None, &wrong).await.is_err());

        let right = ConnectionConfig {
            authenticator: Some(Arc::new(PlainTextAuthenticator::new("user", "pass"))),
            ..Default::default()
        };
        assert!(open_connection(addr, None, &right).await.is_ok());
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn connection_breaks_when_node_stops() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig::default()]).await;
        let node = &cluster.nodes()[0];

        let config = ConnectionConfig {
            keepalive_interval: Some(Duration::from_millis(50)),
            keepalive_timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let (conn, errors) = open_connection(node.addr(), None, &config).await.unwrap();

        node.stop();
        assert!(errors.await.is_ok());
        assert_matches!(
            conn.query_rows("SELECT * FROM system.local").await,
            Err(RequestAttemptError::BrokenConnectionError(_))
        );
    }
}
