//! An in-process cluster of fake nodes speaking just enough of the binary
//! protocol for the driver to connect, discover the topology, route and
//! page through results.
//!
//! Node `k` listens on `127.0.0.{k + 1}`; all nodes share one port, so the
//! addresses they list in `system.peers` are reachable as-is.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use shardwire_cql::errors::DbError;
use shardwire_cql::frame::request::{options, DeserializableRequest, Query, RequestOpcode};
use shardwire_cql::frame::response::event::{
    Event, SchemaChangeEvent, SchemaChangeTarget, SchemaChangeType,
};
use shardwire_cql::frame::response::result::{
    self, ColumnSpec, ResultMetadata, Row, Rows, SchemaChange, SetKeyspace, TableSpec,
};
use shardwire_cql::frame::response::{Error, ResponseOpcode, Supported};
use shardwire_cql::frame::{self, types, FrameParams, ProtocolVersion};
use shardwire_cql::value::{ColumnType, CqlValue};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use uuid::Uuid;

const MURMUR3: &str = "org.apache.cassandra.dht.Murmur3Partitioner";
const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

/// What a node does with its shard-aware port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShardAwarePort {
    Listen,
    /// Advertised in SUPPORTED, but nothing listens there.
    Unreachable,
    Disabled,
}

#[derive(Debug, Clone)]
pub(crate) struct MockNodeConfig {
    /// Defaults to a host id derived from the node's position.
    pub(crate) host_id: Option<Uuid>,
    pub(crate) datacenter: String,
    pub(crate) rack: String,
    /// Defaults to a single token derived from the node's position.
    pub(crate) tokens: Vec<i64>,
    pub(crate) nr_shards: Option<u16>,
    pub(crate) shard_aware_port: ShardAwarePort,
    /// Pretends a NAT sits in front of the shard-aware port: every
    /// connection to it lands on shard 0.
    pub(crate) nat: bool,
    pub(crate) credentials: Option<(String, String)>,
}

impl Default for MockNodeConfig {
    fn default() -> Self {
        Self {
            host_id: None,
            datacenter: "dc1".to_owned(),
            rack: "r1".to_owned(),
            tokens: Vec::new(),
            nr_shards: None,
            shard_aware_port: ShardAwarePort::Listen,
            nat: false,
            credentials: None,
        }
    }
}

impl MockNodeConfig {
    pub(crate) fn sharded(nr_shards: u16) -> Self {
        Self {
            nr_shards: Some(nr_shards),
            ..Default::default()
        }
    }

    pub(crate) fn in_dc(datacenter: &str) -> Self {
        Self {
            datacenter: datacenter.to_owned(),
            ..Default::default()
        }
    }
}

struct NodeState {
    config: MockNodeConfig,
    host_id: Uuid,
    tokens: Vec<i64>,
    addr: SocketAddr,
    shard_aware_port: Option<u16>,
    schema_version: Uuid,
    listed: bool,
    delay: Duration,
    running: watch::Sender<bool>,
    user_queries: usize,
    open_per_shard: Vec<usize>,
    shard_aware_accepted: usize,
    next_shard: u16,
}

impl NodeState {
    fn assign_shard(&mut self, via_shard_aware_port: bool, source_port: u16) -> u16 {
        let Some(nr_shards) = self.config.nr_shards else {
            return 0;
        };
        if via_shard_aware_port {
            if self.config.nat {
                0
            } else {
                source_port % nr_shards
            }
        } else {
            let shard = self.next_shard;
            self.next_shard = (self.next_shard + 1) % nr_shards;
            shard
        }
    }
}

#[derive(Default)]
struct ModelState {
    nodes: Vec<NodeState>,
    keyspaces: Vec<(String, Vec<(String, String)>)>,
    query_errors: HashMap<String, DbError>,
    query_rows: HashMap<String, Rows>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ModelState>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, ModelState> {
        self.state.lock().unwrap()
    }
}

/// Handle to a running fake cluster. Dropping it shuts every node down.
pub(crate) struct MockCluster {
    shared: Arc<Shared>,
    nodes: Vec<MockNode>,
    schema_version: Uuid,
    _shutdown: watch::Sender<()>,
}

impl MockCluster {
    pub(crate) async fn start(configs: Vec<MockNodeConfig>) -> MockCluster {
        assert!(!configs.is_empty());
        let shared = Arc::new(Shared::default());
        let schema_version = Uuid::new_v4();
        let (shutdown_sender, shutdown) = watch::channel(());

        shared.lock().keyspaces = vec![
            (
                "system".to_owned(),
                vec![(
                    "class".to_owned(),
                    "org.apache.cassandra.locator.LocalStrategy".to_owned(),
                )],
            ),
            (
                "ks".to_owned(),
                vec![
                    ("class".to_owned(), "SimpleStrategy".to_owned()),
                    ("replication_factor".to_owned(), "1".to_owned()),
                ],
            ),
        ];

        let mut port = 0;
        let mut nodes = Vec::with_capacity(configs.len());
        for (idx, config) in configs.into_iter().enumerate() {
            let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, idx as u8 + 1));
            let listener = TcpListener::bind(SocketAddr::new(ip, port)).await.unwrap();
            let addr = listener.local_addr().unwrap();
            port = addr.port();

            let (shard_aware_listener, shard_aware_port) =
                match (config.nr_shards, config.shard_aware_port) {
                    (Some(_), ShardAwarePort::Listen) => {
                        let l = TcpListener::bind(SocketAddr::new(ip, 0)).await.unwrap();
                        let p = l.local_addr().unwrap().port();
                        (Some(l), Some(p))
                    }
                    (Some(_), ShardAwarePort::Unreachable) => {
                        let l = TcpListener::bind(SocketAddr::new(ip, 0)).await.unwrap();
                        let p = l.local_addr().unwrap().port();
                        (None, Some(p))
                    }
                    _ => (None, None),
                };

            let host_id = config
                .host_id
                .unwrap_or_else(|| Uuid::from_u128(idx as u128 + 1));
            let tokens = if config.tokens.is_empty() {
                vec![(idx as i64 + 1) * 1000]
            } else {
                config.tokens.clone()
            };
            let shard_slots = config.nr_shards.unwrap_or(1) as usize;
            shared.lock().nodes.push(NodeState {
                config,
                host_id,
                tokens,
                addr,
                shard_aware_port,
                schema_version,
                listed: true,
                delay: Duration::ZERO,
                running: watch::channel(true).0,
                user_queries: 0,
                open_per_shard: vec![0; shard_slots],
                shard_aware_accepted: 0,
                next_shard: 0,
            });

            tokio::spawn(serve_listener(
                shared.clone(),
                idx,
                listener,
                false,
                shutdown.clone(),
            ));
            if let Some(l) = shard_aware_listener {
                tokio::spawn(serve_listener(shared.clone(), idx, l, true, shutdown.clone()));
            }

            nodes.push(MockNode {
                shared: shared.clone(),
                idx,
                addr,
                host_id,
                shard_aware_port,
            });
        }

        MockCluster {
            shared,
            nodes,
            schema_version,
            _shutdown: shutdown_sender,
        }
    }

    pub(crate) fn nodes(&self) -> &[MockNode] {
        &self.nodes
    }

    pub(crate) fn known_node(&self) -> SocketAddr {
        self.nodes[0].addr
    }

    /// Schema version all nodes report unless told otherwise.
    pub(crate) fn schema_version(&self) -> Uuid {
        self.schema_version
    }

    /// Makes every node answer `query` with the given error.
    pub(crate) fn set_query_error(&self, query: &str, error: DbError) {
        self.shared
            .lock()
            .query_errors
            .insert(query.to_owned(), error);
    }

    pub(crate) fn clear_query_error(&self, query: &str) {
        self.shared.lock().query_errors.remove(query);
    }

    /// Makes every node answer `query` with these rows, paged according to
    /// the request's page size.
    pub(crate) fn set_rows(&self, query: &str, rows: Rows) {
        self.shared.lock().query_rows.insert(query.to_owned(), rows);
    }

    pub(crate) fn add_keyspace(&self, name: &str, replication: &[(&str, &str)]) {
        self.shared.lock().keyspaces.push((
            name.to_owned(),
            replication
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
    }

    /// Sends an event to every connection registered for events.
    pub(crate) fn push_event(&self, event: Event) {
        let mut body = Vec::new();
        event.serialize(&mut body).unwrap();
        let params = FrameParams {
            version: 0x80 | ProtocolVersion::V4.as_u8(),
            flags: 0,
            stream: -1,
        };
        let frame = frame::make_frame(params, ResponseOpcode::Event as u8, &body).unwrap();
        self.shared
            .lock()
            .subscribers
            .retain(|s| s.send(frame.clone()).is_ok());
    }

    pub(crate) fn total_user_queries(&self) -> usize {
        self.nodes.iter().map(MockNode::user_queries).sum()
    }
}

/// Handle to one node of a [`MockCluster`].
#[derive(Clone)]
pub(crate) struct MockNode {
    shared: Arc<Shared>,
    idx: usize,
    addr: SocketAddr,
    host_id: Uuid,
    shard_aware_port: Option<u16>,
}

impl MockNode {
    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn host_id(&self) -> Uuid {
        self.host_id
    }

    pub(crate) fn shard_aware_port(&self) -> Option<u16> {
        self.shard_aware_port
    }

    /// Closes all connections and refuses new ones until [`MockNode::start`].
    pub(crate) fn stop(&self) {
        self.shared.lock().nodes[self.idx].running.send_replace(false);
    }

    pub(crate) fn start(&self) {
        self.shared.lock().nodes[self.idx].running.send_replace(true);
    }

    pub(crate) fn set_schema_version(&self, version: Uuid) {
        self.shared.lock().nodes[self.idx].schema_version = version;
    }

    /// Delays answers to non-system queries.
    pub(crate) fn set_delay(&self, delay: Duration) {
        self.shared.lock().nodes[self.idx].delay = delay;
    }

    /// Controls whether other nodes list this one in `system.peers`.
    pub(crate) fn set_listed(&self, listed: bool) {
        self.shared.lock().nodes[self.idx].listed = listed;
    }

    /// Queries served that did not target system tables.
    pub(crate) fn user_queries(&self) -> usize {
        self.shared.lock().nodes[self.idx].user_queries
    }

    /// Currently open connections, per shard.
    pub(crate) fn open_connections_per_shard(&self) -> Vec<usize> {
        self.shared.lock().nodes[self.idx].open_per_shard.clone()
    }

    /// Connections ever accepted on the shard-aware port.
    pub(crate) fn shard_aware_connections(&self) -> usize {
        self.shared.lock().nodes[self.idx].shard_aware_accepted
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.open_connections_per_shard().iter().sum()
    }
}

async fn serve_listener(
    shared: Arc<Shared>,
    idx: usize,
    listener: TcpListener,
    via_shard_aware_port: bool,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(_) => return,
            },
            _ = shutdown.changed() => return,
        };

        let (running, shard) = {
            let mut state = shared.lock();
            let node = &mut state.nodes[idx];
            let running = node.running.subscribe();
            if !*running.borrow() {
                trace!(node = idx, "Refusing connection of a stopped node");
                continue;
            }
            let shard = node.assign_shard(via_shard_aware_port, peer.port());
            node.open_per_shard[shard as usize] += 1;
            if via_shard_aware_port {
                node.shard_aware_accepted += 1;
            }
            (running, shard)
        };

        tokio::spawn(serve_connection(
            shared.clone(),
            idx,
            stream,
            shard,
            running,
            shutdown.clone(),
        ));
    }
}

struct OpenConnectionGuard {
    shared: Arc<Shared>,
    idx: usize,
    shard: u16,
}

impl Drop for OpenConnectionGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.nodes[self.idx].open_per_shard[self.shard as usize] -= 1;
        }
    }
}

async fn serve_connection(
    shared: Arc<Shared>,
    idx: usize,
    stream: TcpStream,
    shard: u16,
    mut running: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<()>,
) {
    let _guard = OpenConnectionGuard {
        shared: shared.clone(),
        idx,
        shard,
    };
    let (mut read_half, mut write_half) = stream.into_split();
    let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = async move {
        while let Some(frame) = receiver.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = read_requests(&shared, idx, shard, &mut read_half, sender) => {}
        _ = writer => {}
        _ = running.wait_for(|up| !*up) => {}
        _ = shutdown.changed() => {}
    }
    debug!(node = idx, shard, "Mock connection closed");
}

async fn read_requests(
    shared: &Arc<Shared>,
    idx: usize,
    shard: u16,
    read_half: &mut OwnedReadHalf,
    sender: mpsc::UnboundedSender<Vec<u8>>,
) {
    while let Ok((params, opcode, body)) = frame::read_request_frame(read_half).await {
        let Ok(version) = ProtocolVersion::try_from(params.version & 0x7F) else {
            return;
        };
        let mut buf = &body[..];

        let custom_payload = if params.flags & frame::FLAG_CUSTOM_PAYLOAD != 0 {
            match types::read_bytes_map(&mut buf) {
                Ok(payload) => Some(payload),
                Err(_) => return,
            }
        } else {
            None
        };
        let extensions = Extensions {
            trace_id: (params.flags & frame::FLAG_TRACING != 0).then(Uuid::new_v4),
            custom_payload,
        };

        let (reply, delay) = match RequestOpcode::try_from(opcode) {
            Ok(RequestOpcode::Options) => (supported(shared, idx, shard), Duration::ZERO),
            Ok(RequestOpcode::Startup) => (startup(shared, idx), Duration::ZERO),
            Ok(RequestOpcode::AuthResponse) => (auth_response(shared, idx, buf), Duration::ZERO),
            Ok(RequestOpcode::Register) => {
                shared.lock().subscribers.push(sender.clone());
                ((ResponseOpcode::Ready, Vec::new()), Duration::ZERO)
            }
            Ok(RequestOpcode::Query) => match Query::deserialize(version, &mut buf) {
                Ok(query) => query_reply(shared, idx, &query),
                Err(_) => (error_reply(DbError::ProtocolError, "bad query"), Duration::ZERO),
            },
            Ok(RequestOpcode::Batch) => {
                let delay = {
                    let mut state = shared.lock();
                    state.nodes[idx].user_queries += 1;
                    state.nodes[idx].delay
                };
                (result_reply(&result::Result::Void), delay)
            }
            _ => (
                error_reply(DbError::ProtocolError, "unsupported opcode"),
                Duration::ZERO,
            ),
        };

        let frame = encode_response(params, &extensions, reply.0, &reply.1);
        if delay.is_zero() {
            if sender.send(frame).is_err() {
                return;
            }
        } else {
            let sender = sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = sender.send(frame);
            });
        }
    }
}

struct Extensions {
    trace_id: Option<Uuid>,
    custom_payload: Option<HashMap<String, Option<Bytes>>>,
}

fn encode_response(
    request: FrameParams,
    extensions: &Extensions,
    opcode: ResponseOpcode,
    body: &[u8],
) -> Vec<u8> {
    let mut params = request.for_response();
    let mut full_body = Vec::with_capacity(body.len());
    if let Some(trace_id) = extensions.trace_id {
        params.flags |= frame::FLAG_TRACING;
        types::write_uuid(&trace_id, &mut full_body);
    }
    if let Some(payload) = &extensions.custom_payload {
        params.flags |= frame::FLAG_CUSTOM_PAYLOAD;
        types::write_bytes_map(payload, &mut full_body).unwrap();
    }
    full_body.extend_from_slice(body);
    frame::make_frame(params, opcode as u8, &full_body).unwrap()
}

type Reply = (ResponseOpcode, Vec<u8>);

fn error_reply(error: DbError, reason: &str) -> Reply {
    let mut body = Vec::new();
    Error {
        error,
        reason: reason.to_owned(),
    }
    .serialize(&mut body)
    .unwrap();
    (ResponseOpcode::Error, body)
}

fn result_reply(result: &result::Result) -> Reply {
    let mut body = Vec::new();
    result.serialize(&mut body).unwrap();
    (ResponseOpcode::Result, body)
}

fn supported(shared: &Shared, idx: usize, shard: u16) -> Reply {
    let state = shared.lock();
    let node = &state.nodes[idx];

    let mut opts: HashMap<String, Vec<String>> = HashMap::new();
    opts.insert(options::CQL_VERSION.to_owned(), vec!["3.0.0".to_owned()]);
    if let Some(nr_shards) = node.config.nr_shards {
        let mut put = |k: &str, v: String| {
            opts.insert(k.to_owned(), vec![v]);
        };
        put(options::SCYLLA_SHARD, shard.to_string());
        put(options::SCYLLA_NR_SHARDS, nr_shards.to_string());
        put(options::SCYLLA_SHARDING_IGNORE_MSB, "12".to_owned());
        put(options::SCYLLA_PARTITIONER, MURMUR3.to_owned());
        put(
            options::SCYLLA_SHARDING_ALGORITHM,
            "biased-token-round-robin".to_owned(),
        );
        if let Some(port) = node.shard_aware_port {
            put(options::SCYLLA_SHARD_AWARE_PORT, port.to_string());
        }
    }

    let mut body = Vec::new();
    Supported { options: opts }.serialize(&mut body).unwrap();
    (ResponseOpcode::Supported, body)
}

fn startup(shared: &Shared, idx: usize) -> Reply {
    if shared.lock().nodes[idx].config.credentials.is_none() {
        return (ResponseOpcode::Ready, Vec::new());
    }
    let mut body = Vec::new();
    types::write_string(PASSWORD_AUTHENTICATOR, &mut body).unwrap();
    (ResponseOpcode::Authenticate, body)
}

fn auth_response(shared: &Shared, idx: usize, mut buf: &[u8]) -> Reply {
    let credentials = shared.lock().nodes[idx].config.credentials.clone();
    let token = types::read_bytes_opt(&mut buf).ok().flatten();
    let expected = credentials.map(|(user, pass)| format!("\0{user}\0{pass}").into_bytes());

    match (token, expected) {
        (Some(token), Some(expected)) if token == expected.as_slice() => {
            let mut body = Vec::new();
            types::write_bytes_opt(None::<&[u8]>, &mut body).unwrap();
            (ResponseOpcode::AuthSuccess, body)
        }
        _ => error_reply(DbError::AuthenticationError, "Bad credentials"),
    }
}

fn query_reply(shared: &Shared, idx: usize, query: &Query<'_>) -> (Reply, Duration) {
    let contents = query.contents.trim();
    let mut state = shared.lock();

    if let Some(error) = state.query_errors.get(contents) {
        let error = error.clone();
        state.nodes[idx].user_queries += 1;
        let delay = state.nodes[idx].delay;
        return (error_reply(error, "Injected error"), delay);
    }

    if contents.contains("FROM system.local") {
        return (result_reply(&system_local(&state, idx, contents)), Duration::ZERO);
    }
    if contents.contains("FROM system.peers") {
        return (result_reply(&system_peers(&state, idx, contents)), Duration::ZERO);
    }
    if contents.contains("FROM system_schema.keyspaces") {
        return (result_reply(&system_keyspaces(&state, contents)), Duration::ZERO);
    }

    state.nodes[idx].user_queries += 1;
    let delay = state.nodes[idx].delay;

    if let Some(keyspace) = contents.strip_prefix("USE ") {
        let keyspace_name = keyspace.trim().trim_matches('"').to_owned();
        let reply = result_reply(&result::Result::SetKeyspace(SetKeyspace { keyspace_name }));
        return (reply, delay);
    }

    if let Some(event) = schema_change_for(contents) {
        let reply = result_reply(&result::Result::SchemaChange(SchemaChange { event }));
        return (reply, delay);
    }

    if let Some(rows) = state.query_rows.get(contents) {
        let page = page_of(rows, &query.parameters);
        return (result_reply(&result::Result::Rows(page)), delay);
    }

    let reply = if contents.to_ascii_uppercase().starts_with("SELECT") {
        result_reply(&result::Result::Rows(Rows::default()))
    } else {
        result_reply(&result::Result::Void)
    };
    (reply, delay)
}

fn page_of(rows: &Rows, parameters: &shardwire_cql::frame::request::QueryParameters<'_>) -> Rows {
    let offset = parameters
        .paging_state
        .as_ref()
        .and_then(|state| <[u8; 4]>::try_from(&state[..]).ok())
        .map_or(0, |raw| u32::from_be_bytes(raw) as usize);
    let page_size = parameters
        .page_size
        .filter(|size| *size > 0)
        .map_or(usize::MAX, |size| size as usize);

    let end = offset.saturating_add(page_size).min(rows.rows.len());
    let paging_state = (end < rows.rows.len())
        .then(|| Bytes::copy_from_slice(&(end as u32).to_be_bytes()));

    Rows {
        metadata: ResultMetadata {
            col_count: rows.metadata.col_count,
            paging_state,
            col_specs: rows.metadata.col_specs.clone(),
        },
        rows: rows.rows[offset.min(end)..end].to_vec(),
    }
}

fn schema_change_for(contents: &str) -> Option<SchemaChangeEvent> {
    let words: Vec<&str> = contents.split_whitespace().collect();
    let change_type = match words.first()?.to_ascii_uppercase().as_str() {
        "CREATE" => SchemaChangeType::Created,
        "ALTER" => SchemaChangeType::Updated,
        "DROP" => SchemaChangeType::Dropped,
        _ => return None,
    };
    let kind = words.get(1)?.to_ascii_uppercase();
    let name = words
        .iter()
        .skip(2)
        .find(|w| !matches!(w.to_ascii_uppercase().as_str(), "IF" | "NOT" | "EXISTS"))?
        .trim_end_matches(';')
        .trim_end_matches('(');

    let (keyspace_name, target) = match kind.as_str() {
        "KEYSPACE" => (name.to_owned(), SchemaChangeTarget::Keyspace),
        "TABLE" => match name.split_once('.') {
            Some((ks, table)) => (ks.to_owned(), SchemaChangeTarget::Table(table.to_owned())),
            None => ("ks".to_owned(), SchemaChangeTarget::Table(name.to_owned())),
        },
        _ => return None,
    };

    Some(SchemaChangeEvent {
        change_type,
        keyspace_name,
        target,
    })
}

fn spec(table: &str, name: &str, typ: ColumnType) -> ColumnSpec {
    let (ks_name, table_name) = table.split_once('.').unwrap_or(("system", table));
    ColumnSpec {
        table_spec: TableSpec {
            ks_name: ks_name.to_owned(),
            table_name: table_name.to_owned(),
        },
        name: name.to_owned(),
        typ,
    }
}

/// Keeps only the columns listed between `SELECT` and `FROM`, in that order.
fn project(contents: &str, specs: Vec<ColumnSpec>, rows: Vec<Vec<Option<CqlValue>>>) -> result::Result {
    let selected: Option<Vec<&str>> = contents
        .split_once(" FROM ")
        .map(|(head, _)| head.trim_start_matches("SELECT").trim())
        .filter(|cols| *cols != "*")
        .map(|cols| cols.split(',').map(str::trim).collect());

    let indices: Vec<usize> = match selected {
        Some(names) => names
            .iter()
            .filter_map(|name| specs.iter().position(|s| s.name == *name))
            .collect(),
        None => (0..specs.len()).collect(),
    };

    let col_specs: Vec<ColumnSpec> = indices.iter().map(|&i| specs[i].clone()).collect();
    let rows = rows
        .into_iter()
        .map(|mut row| Row {
            columns: indices.iter().map(|&i| row[i].take()).collect(),
        })
        .collect();

    result::Result::Rows(Rows {
        metadata: ResultMetadata {
            col_count: col_specs.len(),
            paging_state: None,
            col_specs,
        },
        rows,
    })
}

fn node_columns(table: &str) -> Vec<ColumnSpec> {
    vec![
        spec(table, "host_id", ColumnType::Uuid),
        spec(table, "rpc_address", ColumnType::Inet),
        spec(table, "data_center", ColumnType::Text),
        spec(table, "rack", ColumnType::Text),
        spec(table, "tokens", ColumnType::Set(Box::new(ColumnType::Text))),
        spec(table, "schema_version", ColumnType::Uuid),
        spec(table, "release_version", ColumnType::Text),
    ]
}

fn node_row(node: &NodeState) -> Vec<Option<CqlValue>> {
    vec![
        Some(CqlValue::Uuid(node.host_id)),
        Some(CqlValue::Inet(node.addr.ip())),
        Some(CqlValue::Text(node.config.datacenter.clone())),
        Some(CqlValue::Text(node.config.rack.clone())),
        Some(CqlValue::Set(
            node.tokens
                .iter()
                .map(|t| CqlValue::Text(t.to_string()))
                .collect(),
        )),
        Some(CqlValue::Uuid(node.schema_version)),
        Some(CqlValue::Text("5.0.0-mock".to_owned())),
    ]
}

fn system_local(state: &ModelState, idx: usize, contents: &str) -> result::Result {
    let mut specs = node_columns("system.local");
    specs.push(spec("system.local", "partitioner", ColumnType::Text));
    let mut row = node_row(&state.nodes[idx]);
    row.push(Some(CqlValue::Text(MURMUR3.to_owned())));
    project(contents, specs, vec![row])
}

fn system_peers(state: &ModelState, idx: usize, contents: &str) -> result::Result {
    let rows = state
        .nodes
        .iter()
        .enumerate()
        .filter(|(i, node)| *i != idx && node.listed)
        .map(|(_, node)| node_row(node))
        .collect();
    project(contents, node_columns("system.peers"), rows)
}

fn system_keyspaces(state: &ModelState, contents: &str) -> result::Result {
    let table = "system_schema.keyspaces";
    let specs = vec![
        spec(table, "keyspace_name", ColumnType::Text),
        spec(
            table,
            "replication",
            ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Text)),
        ),
    ];
    let rows = state
        .keyspaces
        .iter()
        .map(|(name, replication)| {
            vec![
                Some(CqlValue::Text(name.clone())),
                Some(CqlValue::Map(
                    replication
                        .iter()
                        .map(|(k, v)| (CqlValue::Text(k.clone()), CqlValue::Text(v.clone())))
                        .collect(),
                )),
            ]
        })
        .collect();
    project(contents, specs, rows)
}

/// Rows with a single `Int` column named `v`, holding `0..n`.
pub(crate) fn int_rows(n: i32) -> Rows {
    Rows {
        metadata: ResultMetadata {
            col_count: 1,
            paging_state: None,
            col_specs: vec![spec("ks.t", "v", ColumnType::Int)],
        },
        rows: (0..n)
            .map(|i| Row {
                columns: vec![Some(CqlValue::Int(i))],
            })
            .collect(),
    }
}
