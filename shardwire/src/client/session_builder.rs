//! Fluent construction of a [`Session`](super::session::Session).

use std::borrow::Borrow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use shardwire_cql::frame::ProtocolVersion;

use super::session::{Session, SessionConfig};
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::errors::NewSessionError;
use crate::network::PoolSize;
use crate::policies::address_translator::AddressTranslator;
use crate::policies::host_filter::HostFilter;
use crate::policies::host_listener::HostListener;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::RetryPolicy;
use crate::policies::speculative_execution::SpeculativeExecutionPolicy;
use crate::statement::{Consistency, SerialConsistency};

/// Collects [`SessionConfig`] options and connects a [`Session`] with them.
/// # Example
///
/// ```
/// # use shardwire::client::session::Session;
/// # use shardwire::client::session_builder::SessionBuilder;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .use_keyspace("my_keyspace", false)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// A builder holding the defaults of [`SessionConfig::new`].
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Adds a contact point given as `host` or `host:port`; port 9042 is
    /// assumed if missing.
    /// # Examples
    /// ```
    /// # use shardwire::client::session::Session;
    /// # use shardwire::client::session_builder::SessionBuilder;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("db1.example.com")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    /// Adds a contact point given as a socket address.
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    /// Like [`known_node`](Self::known_node), for each of `hostnames`.
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.config.add_known_nodes(hostnames);
        self
    }

    /// Like [`known_node_addr`](Self::known_node_addr), for each address.
    pub fn known_nodes_addr(
        mut self,
        node_addrs: impl IntoIterator<Item = impl Borrow<SocketAddr>>,
    ) -> Self {
        for address in node_addrs {
            self.config.add_known_node_addr(*address.borrow());
        }
        self
    }

    /// Authenticates with a username and a password, if a server asks for it.
    ///
    /// # Example
    /// ```
    /// # use shardwire::client::session::Session;
    /// # use shardwire::client::session_builder::SessionBuilder;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .user("cassandra", "cassandra")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn user(mut self, username: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(
            username.into(),
            passwd.into(),
        )));
        self
    }

    /// Set custom authenticator provider to create an authenticator instance
    /// for every connection that the server asks to authenticate.
    pub fn authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    /// Set the protocol version proposed to the servers.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Limits the time of opening a connection, handshake included.
    /// 5 seconds by default.
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// Disables Nagle's algorithm on every socket when `true` (the default).
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Idle time after which the OS starts probing the connection.
    /// `Some(30s)` by default, `None` disables TCP keepalive.
    ///
    /// Setting it to a second or less may make connections unstable,
    /// so such values are rejected with a panic.
    pub fn tcp_keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        if let Some(interval) = interval {
            assert!(
                interval > Duration::from_secs(1),
                "TCP keepalive interval must be longer than one second"
            );
        }
        self.config.tcp_keepalive_interval = interval;
        self
    }

    /// Set the interval of heartbeats sent on idle connections.
    /// `None` disables them.
    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set how long an unanswered heartbeat may wait before the connection
    /// is closed.
    pub fn keepalive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.keepalive_timeout = timeout;
        self
    }

    /// How many connections to keep per node, or per shard of a sharded node.
    /// One per shard by default.
    ///
    /// # Example
    /// ```
    /// # use shardwire::client::session::Session;
    /// # use shardwire::client::session_builder::SessionBuilder;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// use std::num::NonZeroUsize;
    /// use shardwire::network::PoolSize;
    ///
    /// // Four connections to every shard.
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .pool_size(PoolSize::PerShard(NonZeroUsize::new(4).unwrap()))
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn pool_size(mut self, size: PoolSize) -> Self {
        self.config.connection_pool_size = size;
        self
    }

    /// Connect only through the regular port, even to nodes advertising a
    /// shard-aware one.
    ///
    /// Connections to the regular port land on a shard chosen by the
    /// server, so filling every shard may take more attempts.
    pub fn disallow_shard_aware_port(mut self, disallow: bool) -> Self {
        self.config.disallow_shard_aware_port = disallow;
        self
    }

    /// How many connections to the shard-aware port may land on a shard
    /// other than the requested one before the pool stops using that port.
    pub fn shard_aware_retry_limit(mut self, limit: usize) -> Self {
        self.config.shard_aware_retry_limit = limit;
        self
    }

    /// The keyspace switched to right after connecting, as if by
    /// [`Session::use_keyspace`].
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some(keyspace_name.into());
        self.config.keyspace_case_sensitive = case_sensitive;
        self
    }

    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing = policy;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Enables speculative execution of idempotent statements.
    pub fn speculative_execution(mut self, policy: Arc<dyn SpeculativeExecutionPolicy>) -> Self {
        self.config.speculative_execution_policy = Some(policy);
        self
    }

    /// Hosts rejected by `filter` stay known but get no pool, and the
    /// control connection avoids them.
    ///
    /// # Example
    /// ```
    /// # use shardwire::client::session::Session;
    /// # use shardwire::client::session_builder::SessionBuilder;
    /// # use shardwire::policies::host_filter::DcHostFilter;
    /// # use std::sync::Arc;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Only nodes of "my-local-dc" get connections.
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .host_filter(Arc::new(DcHostFilter::new("my-local-dc".to_string())))
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn host_filter(mut self, filter: Arc<dyn HostFilter>) -> Self {
        self.config.host_filter = Some(filter);
        self
    }

    /// Maps addresses advertised in `system.peers` to the ones to connect to.
    /// Nothing is translated by default.
    pub fn address_translator(mut self, translator: Arc<dyn AddressTranslator>) -> Self {
        self.config.address_translator = Some(translator);
        self
    }

    /// Registers a listener notified about hosts being added, removed,
    /// going up or down.
    pub fn host_listener(mut self, listener: Arc<dyn HostListener>) -> Self {
        self.config.host_listener = Some(listener);
        self
    }

    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    pub fn default_serial_consistency(
        mut self,
        serial_consistency: Option<SerialConsistency>,
    ) -> Self {
        self.config.default_serial_consistency = serial_consistency;
        self
    }

    /// Sets the client-side timeout of requests. `None` disables it.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the delay between schema agreement checks.
    /// The default is 200ms.
    pub fn schema_agreement_interval(mut self, interval: Duration) -> Self {
        self.config.schema_agreement_interval = interval;
        self
    }

    /// Set the maximum time to wait for schema agreement.
    /// The default is 60s.
    pub fn schema_agreement_timeout(mut self, timeout: Duration) -> Self {
        self.config.schema_agreement_timeout = timeout;
        self
    }

    /// Whether a request that changed the schema returns only once all
    /// nodes agree on the new version. On by default.
    pub fn auto_await_schema_agreement(mut self, enabled: bool) -> Self {
        self.config.schema_agreement_automatic_waiting = enabled;
        self
    }

    /// If true, a successful automatic wait for schema agreement is
    /// followed by a metadata refresh. By default, it is enabled.
    pub fn refresh_metadata_on_auto_schema_agreement(mut self, refresh_metadata: bool) -> Self {
        self.config.refresh_metadata_on_auto_schema_agreement = refresh_metadata;
        self
    }

    /// Period of re-reading the cluster metadata; 60 seconds by default.
    pub fn cluster_metadata_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.cluster_metadata_refresh_interval = interval;
        self
    }

    /// Set how often hosts marked down are probed.
    /// The default is 10 seconds.
    pub fn down_host_probe_interval(mut self, interval: Duration) -> Self {
        self.config.down_host_probe_interval = interval;
        self
    }

    /// Connects a session with the collected configuration.
    ///
    /// Returns once the initial metadata was read and every pool made its
    /// first fill attempt.
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        SessionBuilder::new()
    }
}
