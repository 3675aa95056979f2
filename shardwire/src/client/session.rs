//! `Session` is the main object used in the driver.\
//! It manages all connections to the cluster and allows to execute CQL requests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use shardwire_cql::frame::ProtocolVersion;
use shardwire_cql::value::SerializedValues;
use tracing::debug;
use uuid::Uuid;

use super::executor::{ExecutorConfig, RequestExecutor};
use super::pager::QueryPager;
use crate::authentication::AuthenticatorProvider;
use crate::cluster::worker::{Cluster, ClusterConfig};
use crate::cluster::{ClusterState, KnownNode};
use crate::errors::{
    ExecutionError, MetadataError, NewSessionError, SchemaAgreementError, UseKeyspaceError,
};
use crate::network::{ConnectionConfig, PoolConfig, PoolSize};
use crate::policies::address_translator::AddressTranslator;
use crate::policies::host_filter::HostFilter;
use crate::policies::host_listener::HostListener;
use crate::policies::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy, TokenAwarePolicy};
use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::policies::speculative_execution::SpeculativeExecutionPolicy;
use crate::response::query_result::QueryResult;
use crate::response::{PagingState, PagingStateResponse};
use crate::statement::batch::Batch;
use crate::statement::{Consistency, SerialConsistency, Statement};

/// `Session` manages connections to the cluster and allows to execute CQL requests.
///
/// Cloning is not supported; share it behind an `Arc` instead. Pagers
/// created by a session keep working until they are dropped or the session
/// is closed.
pub struct Session {
    executor: Arc<RequestExecutor>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cluster", self.executor.cluster())
            .field("keyspace", &self.executor.keyspace())
            .field("closed", &self.executor.is_closed())
            .finish_non_exhaustive()
    }
}

/// Configuration options for [`Session`].
/// Can be created manually, but usually it's easier to use
/// [SessionBuilder](super::session_builder::SessionBuilder)
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// List of database servers known on Session startup.
    /// Session will connect to these nodes to retrieve information about other nodes in the cluster.
    /// Each node can be represented as a hostname or an IP address.
    pub known_nodes: Vec<KnownNode>,

    /// Protocol version proposed in STARTUP. Defaults to v4.
    pub protocol_version: ProtocolVersion,

    /// Timeout of opening a connection, including the handshake.
    pub connect_timeout: Duration,

    /// Whether to set the nodelay TCP flag.
    pub tcp_nodelay: bool,

    /// TCP keepalive interval, which means how often keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    /// If `None`, no TCP keepalive messages are sent.
    pub tcp_keepalive_interval: Option<Duration>,

    /// How often an idle connection sends an OPTIONS heartbeat.
    /// If `None`, no heartbeats are sent.
    pub keepalive_interval: Option<Duration>,

    /// How long to wait for a heartbeat response before the connection is
    /// considered broken.
    pub keepalive_timeout: Option<Duration>,

    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// Number of connections kept to each node, or to each shard of it.
    pub connection_pool_size: PoolSize,

    /// If true, the driver will never use the shard-aware port, even if
    /// the server advertises one.
    pub disallow_shard_aware_port: bool,

    /// Connections through the shard-aware port that may land on a wrong
    /// shard before the pool gives up on that port.
    pub shard_aware_retry_limit: usize,

    /// Keyspace to be used on all connections.
    /// Each connection will send `"USE <keyspace_name>"` before sending any requests.
    /// This can be later changed with [`Session::use_keyspace`].
    pub used_keyspace: Option<String>,

    /// Whether the keyspace name is case-sensitive.
    pub keyspace_case_sensitive: bool,

    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,

    /// Hosts rejected by the filter are known but never connected to.
    pub host_filter: Option<Arc<dyn HostFilter>>,
    pub address_translator: Option<Arc<dyn AddressTranslator>>,
    pub host_listener: Option<Arc<dyn HostListener>>,

    pub default_consistency: Consistency,
    pub default_serial_consistency: Option<SerialConsistency>,

    /// Client-side timeout of a request, covering all its attempts.
    /// `None` means no timeout.
    pub request_timeout: Option<Duration>,

    /// Interval between schema agreement checks.
    pub schema_agreement_interval: Duration,

    /// Maximum time spent waiting for schema agreement.
    pub schema_agreement_timeout: Duration,

    /// Whether to wait for schema agreement after a request changed the schema.
    pub schema_agreement_automatic_waiting: bool,

    /// Whether to refresh metadata once an automatic wait for schema
    /// agreement succeeded.
    pub refresh_metadata_on_auto_schema_agreement: bool,

    /// How often the cluster metadata is re-read.
    pub cluster_metadata_refresh_interval: Duration,

    /// How often hosts marked down are probed with a new connection.
    pub down_host_probe_interval: Duration,
}

impl SessionConfig {
    /// Creates a [`SessionConfig`] with default configuration
    /// # Default configuration
    /// * Protocol version: v4
    /// * Load balancing: token aware round robin
    /// * Consistency: `LocalQuorum`
    /// * Request timeout: 30 seconds
    ///
    /// # Example
    /// ```
    /// # use shardwire::client::session::SessionConfig;
    /// let config = SessionConfig::new();
    /// ```
    pub fn new() -> Self {
        let connection_defaults = ConnectionConfig::default();
        SessionConfig {
            known_nodes: Vec::new(),
            protocol_version: connection_defaults.protocol_version,
            connect_timeout: connection_defaults.connect_timeout,
            tcp_nodelay: connection_defaults.tcp_nodelay,
            tcp_keepalive_interval: connection_defaults.tcp_keepalive_interval,
            keepalive_interval: connection_defaults.keepalive_interval,
            keepalive_timeout: connection_defaults.keepalive_timeout,
            authenticator: None,
            connection_pool_size: Default::default(),
            disallow_shard_aware_port: false,
            shard_aware_retry_limit: 3,
            used_keyspace: None,
            keyspace_case_sensitive: false,
            load_balancing: Arc::new(TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new()))),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            speculative_execution_policy: None,
            host_filter: None,
            address_translator: None,
            host_listener: None,
            default_consistency: Consistency::LocalQuorum,
            default_serial_consistency: Some(SerialConsistency::LocalSerial),
            request_timeout: Some(Duration::from_secs(30)),
            schema_agreement_interval: Duration::from_millis(200),
            schema_agreement_timeout: Duration::from_secs(60),
            schema_agreement_automatic_waiting: true,
            refresh_metadata_on_auto_schema_agreement: true,
            cluster_metadata_refresh_interval: Duration::from_secs(60),
            down_host_probe_interval: Duration::from_secs(10),
        }
    }

    /// Adds a known database server with a hostname.
    /// If the port is not explicitly specified, 9042 is used as default
    /// # Example
    /// ```
    /// # use shardwire::client::session::SessionConfig;
    /// let mut config = SessionConfig::new();
    /// config.add_known_node("127.0.0.1");
    /// config.add_known_node("db1.example.com:9042");
    /// ```
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_string()));
    }

    /// Adds a known database server with an IP address
    pub fn add_known_node_addr(&mut self, node_addr: std::net::SocketAddr) {
        self.known_nodes.push(KnownNode::Address(node_addr));
    }

    /// Adds a list of known database server with hostnames.
    pub fn add_known_nodes(&mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) {
        for hostname in hostnames {
            self.add_known_node(hostname);
        }
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            protocol_version: self.protocol_version,
            connect_timeout: self.connect_timeout,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_interval: self.tcp_keepalive_interval,
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            event_sender: None,
            authenticator: self.authenticator.clone(),
        }
    }

    fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            known_nodes: self.known_nodes.clone(),
            pool_config: PoolConfig {
                connection_config: self.connection_config(),
                pool_size: self.connection_pool_size,
                can_use_shard_aware_port: !self.disallow_shard_aware_port,
                shard_aware_retry_limit: self.shard_aware_retry_limit,
            },
            load_balancing: self.load_balancing.clone(),
            host_filter: self.host_filter.clone(),
            address_translator: self.address_translator.clone(),
            host_listener: self.host_listener.clone(),
            metadata_refresh_interval: self.cluster_metadata_refresh_interval,
            down_host_probe_interval: self.down_host_probe_interval,
        }
    }

    fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            default_consistency: self.default_consistency,
            default_serial_consistency: self.default_serial_consistency,
            request_timeout: self.request_timeout,
            load_balancing: self.load_balancing.clone(),
            retry_policy: self.retry_policy.clone(),
            speculative_execution_policy: self.speculative_execution_policy.clone(),
            schema_agreement_interval: self.schema_agreement_interval,
            schema_agreement_timeout: self.schema_agreement_timeout,
            schema_agreement_automatic_waiting: self.schema_agreement_automatic_waiting,
            refresh_metadata_on_auto_schema_agreement: self
                .refresh_metadata_on_auto_schema_agreement,
        }
    }
}

/// Creates default [`SessionConfig`], same as [`SessionConfig::new`]
impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Establishes a CQL session with the database
    ///
    /// Usually it's easier to use [SessionBuilder](super::session_builder::SessionBuilder)
    /// instead of calling `Session::connect` directly, because it's more convenient.
    /// # Arguments
    /// * `config` - Connection configuration - known nodes, policies, timeouts, etc.
    ///   Must contain at least one known node.
    pub async fn connect(config: SessionConfig) -> Result<Self, NewSessionError> {
        let cluster = Cluster::new(config.cluster_config()).await?;
        let executor = RequestExecutor::new(cluster, config.executor_config());

        let session = Session {
            executor: Arc::new(executor),
        };

        if let Some(keyspace_name) = config.used_keyspace {
            session
                .use_keyspace(keyspace_name, config.keyspace_case_sensitive)
                .await?;
        }

        debug!("Session connected");
        Ok(session)
    }

    /// Executes an unpaged statement: all rows come in a single response.
    ///
    /// As all results come in one response (no paging is done!), the memory
    /// footprint and latency may be huge for statements returning many rows.
    /// For such statements use [query_iter](Session::query_iter) or
    /// [query_single_page](Session::query_single_page).
    ///
    /// # Arguments
    /// * `statement` - statement to be executed, can be just a `&str` or the [`Statement`] struct.
    /// * `values` - values bound to the statement.
    pub async fn query_unpaged(
        &self,
        statement: impl Into<Statement>,
        values: &SerializedValues,
    ) -> Result<QueryResult, ExecutionError> {
        let statement = statement.into();
        let (result, _) = self
            .executor
            .query_page(&statement, values, None, PagingState::start())
            .await?;
        Ok(result)
    }

    /// Fetches a single page of the result, starting from `paging_state`.
    ///
    /// The page size is that of the statement. The returned
    /// [`PagingStateResponse`] tells whether there are more pages and holds
    /// the state to fetch the next one with.
    pub async fn query_single_page(
        &self,
        statement: impl Into<Statement>,
        values: &SerializedValues,
        paging_state: PagingState,
    ) -> Result<(QueryResult, PagingStateResponse), ExecutionError> {
        let statement = statement.into();
        let page_size = statement.get_validated_page_size();
        self.executor
            .query_page(&statement, values, Some(page_size), paging_state)
            .await
    }

    /// Runs a paged query, returning a stream over the rows of all pages.
    ///
    /// Pages are fetched in the background, one ahead of the consumer. The
    /// first page is fetched before this returns.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use shardwire::client::session::Session;
    /// # use shardwire_cql::value::SerializedValues;
    /// # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    /// use futures::stream::StreamExt;
    ///
    /// let mut rows_stream = session
    ///     .query_iter("SELECT a, b FROM ks.t", SerializedValues::new())
    ///     .await?;
    ///
    /// while let Some(row) = rows_stream.next().await {
    ///     println!("{:?}", row?.columns);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query_iter(
        &self,
        statement: impl Into<Statement>,
        values: SerializedValues,
    ) -> Result<QueryPager, ExecutionError> {
        QueryPager::new(self.executor.clone(), statement.into(), values).await
    }

    /// Executes a batch. Its statements are sent as a single BATCH request.
    ///
    /// An empty batch is rejected without contacting any node.
    pub async fn batch(&self, batch: &Batch) -> Result<QueryResult, ExecutionError> {
        self.executor.batch(batch).await
    }

    /// Sends `USE <keyspace_name>` request on all connections\
    /// This allows to write `SELECT * FROM table` instead of `SELECT * FROM keyspace.table`\
    ///
    /// Note that even failed `use_keyspace` can change currently used keyspace - the request is sent on all connections and
    /// can overwrite previously used keyspace.
    ///
    /// Call only one `use_keyspace` at a time.\
    /// Trying to do two `use_keyspace` requests simultaneously with different names
    /// can end with some connections using one keyspace and the rest using the other.
    ///
    /// # Arguments
    ///
    /// * `keyspace_name` - keyspace name to use,
    ///   keyspace names can have up to 48 alphanumeric characters and contain underscores
    /// * `case_sensitive` - if set to true the generated request will put keyspace name in quotes
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        self.executor
            .use_keyspace(keyspace_name, case_sensitive)
            .await
    }

    /// The keyspace set by the last successful `use_keyspace`, if any.
    pub fn get_keyspace(&self) -> Option<Arc<String>> {
        self.executor.keyspace()
    }

    /// Awaits schema agreement among all reachable nodes.
    ///
    /// Issues an agreement check each `schema_agreement_interval`.
    /// If agreement is not reached in `schema_agreement_timeout`,
    /// `SchemaAgreementError::Timeout` is returned.
    pub async fn await_schema_agreement(&self) -> Result<Uuid, SchemaAgreementError> {
        self.executor
            .await_schema_agreement(std::future::pending())
            .await
    }

    /// Like [`Session::await_schema_agreement`], but gives up with
    /// `SchemaAgreementError::Canceled` as soon as `cancel` resolves.
    pub async fn await_schema_agreement_with_cancel(
        &self,
        cancel: impl Future<Output = ()>,
    ) -> Result<Uuid, SchemaAgreementError> {
        self.executor.await_schema_agreement(cancel).await
    }

    /// Checks once whether all reachable nodes report the same schema
    /// version. Returns it if so.
    pub async fn check_schema_agreement(&self) -> Result<Option<Uuid>, SchemaAgreementError> {
        self.executor.check_schema_agreement().await
    }

    /// Access cluster state visible by the driver.
    ///
    /// Driver collects various information about network topology or schema.
    /// It can be read using this method.
    pub fn get_cluster_state(&self) -> Arc<ClusterState> {
        self.executor.cluster().get_state()
    }

    /// Forces a refresh of the cluster metadata.
    pub async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        self.executor.refresh_metadata().await
    }

    /// Closes the session: stops following the cluster and closes every
    /// connection. Pending and later requests fail with a "session closed"
    /// error. Idempotent.
    pub fn close(&self) {
        self.executor.close();
    }

    pub fn is_closed(&self) -> bool {
        self.executor.is_closed()
    }
}
