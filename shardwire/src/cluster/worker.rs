//! The cluster worker keeps the host registry, the connection pools and
//! the published [`ClusterState`] in line with the actual cluster.
//!
//! It owns the control connection. Metadata is re-read periodically, on
//! request, and whenever the server reports a topology or schema change.
//! Status events and pool health move hosts between up and down; down
//! hosts are probed until they accept connections again.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::{join_all, BoxFuture, RemoteHandle};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use rand::seq::SliceRandom;
use shardwire_cql::frame::response::event::{Event, StatusChangeEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::control_connection::{
    resolve_contact_points, ControlConnection, KnownNode, ReconnectBackoff,
};
use super::host::{HostInfo, HostStatus};
use super::metadata::{Keyspace, Metadata, NodeAddr, Peer};
use super::registry::{HostRegistry, RegistrySnapshot};
use super::state::ClusterState;
use crate::errors::{
    ConnectionError, ConnectionPoolError, MetadataError, NewSessionError, RequestAttemptError,
    SchemaAgreementError, TranslationError, UseKeyspaceError,
};
use crate::network::connection::open_connection;
use crate::network::{
    ConnectionConfig, NodeConnectionPool, PoolConfig, PoolEvent, PoolManager, VerifiedKeyspaceName,
};
use crate::policies::address_translator::AddressTranslator;
use crate::policies::host_filter::HostFilter;
use crate::policies::host_listener::HostListener;
use crate::policies::load_balancing::{LoadBalancingPolicy, RoutingInfo};
use crate::routing::partitioner::PartitionerName;

/// Everything needed to discover and follow a cluster.
#[derive(Clone)]
pub(crate) struct ClusterConfig {
    pub(crate) known_nodes: Vec<KnownNode>,
    pub(crate) pool_config: PoolConfig,
    pub(crate) load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub(crate) host_filter: Option<Arc<dyn HostFilter>>,
    pub(crate) address_translator: Option<Arc<dyn AddressTranslator>>,
    pub(crate) host_listener: Option<Arc<dyn HostListener>>,
    pub(crate) metadata_refresh_interval: Duration,
    pub(crate) down_host_probe_interval: Duration,
}

struct RefreshRequest {
    response_chan: oneshot::Sender<Result<(), MetadataError>>,
}

struct ProbeOutcome {
    host_id: Uuid,
    address: SocketAddr,
    result: Result<(), ConnectionError>,
}

/// Handle to the cluster worker and to what it maintains.
///
/// Dropping it (or calling [`Cluster::close`]) stops the worker.
pub(crate) struct Cluster {
    state: Arc<ArcSwap<ClusterState>>,
    registry: Arc<HostRegistry>,
    pool_manager: Arc<PoolManager>,

    refresh_channel: mpsc::Sender<RefreshRequest>,
    worker_handle: Mutex<Option<RemoteHandle<()>>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("state", &*self.state.load())
            .field("pool_manager", &self.pool_manager)
            .finish_non_exhaustive()
    }
}

struct ClusterWorker {
    state: Arc<ArcSwap<ClusterState>>,
    registry: Arc<HostRegistry>,
    pool_manager: Arc<PoolManager>,

    load_balancing: Arc<dyn LoadBalancingPolicy>,
    host_filter: Option<Arc<dyn HostFilter>>,
    address_translator: Option<Arc<dyn AddressTranslator>>,

    contact_points: Vec<SocketAddr>,
    control_connection: Option<ControlConnection>,
    control_connection_config: ConnectionConfig,
    probe_connection_config: ConnectionConfig,
    reconnect_backoff: ReconnectBackoff,

    // Schema part of the last read metadata.
    keyspaces: HashMap<String, Keyspace>,
    partitioner: PartitionerName,

    refresh_channel: mpsc::Receiver<RefreshRequest>,
    server_events_channel: mpsc::UnboundedReceiver<Event>,
    pool_events_channel: mpsc::UnboundedReceiver<PoolEvent>,

    probes: FuturesUnordered<BoxFuture<'static, ProbeOutcome>>,
    probing: HashSet<Uuid>,

    metadata_refresh_interval: Duration,
    down_host_probe_interval: Duration,
}

impl Cluster {
    /// Resolves the contact points, reads the initial metadata, opens pools
    /// to every usable host and starts the worker.
    pub(crate) async fn new(config: ClusterConfig) -> Result<Cluster, NewSessionError> {
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }
        let (mut contact_points, hostnames) = resolve_contact_points(&config.known_nodes).await;
        if contact_points.is_empty() {
            return Err(NewSessionError::FailedToResolveAnyHostname(hostnames));
        }
        contact_points.shuffle(&mut rand::rng());

        let (refresh_sender, refresh_receiver) = mpsc::channel(32);
        // The control connection's reader pushes events without waiting;
        // replies to metadata queries travel behind them on the same socket.
        let (server_events_sender, server_events_receiver) = mpsc::unbounded_channel();
        // Refillers report from many pools at once and must never block on it.
        let (pool_events_sender, pool_events_receiver) = mpsc::unbounded_channel();

        let registry = Arc::new(HostRegistry::new());
        let pool_manager = Arc::new(PoolManager::new(
            config.pool_config.clone(),
            Some(pool_events_sender),
        ));
        registry.subscribe(pool_manager.clone());
        if let Some(listener) = &config.host_listener {
            registry.subscribe(listener.clone());
        }

        let mut control_connection_config = config.pool_config.connection_config.clone();
        control_connection_config.event_sender = Some(server_events_sender);
        let probe_connection_config = config.pool_config.connection_config.clone();

        let state = Arc::new(ArcSwap::from_pointee(ClusterState::new(
            &RegistrySnapshot::default(),
            HashMap::new(),
            PartitionerName::default(),
        )));

        let mut worker = ClusterWorker {
            state: state.clone(),
            registry: registry.clone(),
            pool_manager: pool_manager.clone(),
            load_balancing: config.load_balancing,
            host_filter: config.host_filter,
            address_translator: config.address_translator,
            contact_points,
            control_connection: None,
            control_connection_config,
            probe_connection_config,
            reconnect_backoff: ReconnectBackoff::default(),
            keyspaces: HashMap::new(),
            partitioner: PartitionerName::default(),
            refresh_channel: refresh_receiver,
            server_events_channel: server_events_receiver,
            pool_events_channel: pool_events_receiver,
            probes: FuturesUnordered::new(),
            probing: HashSet::new(),
            metadata_refresh_interval: config.metadata_refresh_interval,
            down_host_probe_interval: config.down_host_probe_interval,
        };

        let metadata = worker.reconnect_and_read_metadata().await?;
        worker.apply_metadata(metadata).await;
        worker.ensure_control_connection_accepted().await;
        pool_manager.wait_until_all_pools_initialized().await;

        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        Ok(Cluster {
            state,
            registry,
            pool_manager,
            refresh_channel: refresh_sender,
            worker_handle: Mutex::new(Some(worker_handle)),
        })
    }

    /// The last published state. Never blocks.
    pub(crate) fn get_state(&self) -> Arc<ClusterState> {
        self.state.load_full()
    }

    pub(crate) fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub(crate) fn pool_for(&self, host_id: &Uuid) -> Option<NodeConnectionPool> {
        self.pool_manager.pool_for(host_id)
    }

    pub(crate) fn pool_manager(&self) -> &PoolManager {
        &self.pool_manager
    }

    /// Makes the worker re-read metadata now, and waits until it is applied.
    pub(crate) async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        let (response_sender, response_receiver) = oneshot::channel();
        self.refresh_channel
            .send(RefreshRequest {
                response_chan: response_sender,
            })
            .await
            .map_err(|_| MetadataError::WorkerStopped)?;

        response_receiver
            .await
            .unwrap_or(Err(MetadataError::WorkerStopped))
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        self.pool_manager.use_keyspace(keyspace_name).await
    }

    /// Asks one connection of every usable host for its schema version.
    /// Returns the version if all reachable hosts agree on it.
    ///
    /// Hosts whose pool or connection is broken do not take part. It is an
    /// error if no host could be asked at all.
    pub(crate) async fn check_schema_agreement(
        &self,
    ) -> Result<Option<Uuid>, SchemaAgreementError> {
        let state = self.get_state();
        let pools: Vec<NodeConnectionPool> = state
            .get_nodes_info()
            .iter()
            .filter(|host| host.is_usable())
            .filter_map(|host| self.pool_manager.pool_for(&host.host_id))
            .collect();

        let results = join_all(pools.iter().map(read_schema_version)).await;

        let mut versions = Vec::with_capacity(results.len());
        let mut skipped_error = None;
        for result in results {
            match result {
                Ok(version) => versions.push(version),
                Err(
                    err @ (SchemaAgreementError::ConnectionPoolError(_)
                    | SchemaAgreementError::RequestError(
                        RequestAttemptError::BrokenConnectionError(_),
                    )),
                ) => skipped_error = Some(err),
                Err(err) => return Err(err),
            }
        }

        let Some(first) = versions.first().copied() else {
            return Err(skipped_error.unwrap_or(SchemaAgreementError::ConnectionPoolError(
                ConnectionPoolError::Initializing,
            )));
        };
        let agreed = versions.iter().all(|version| *version == first);
        trace!(versions = ?versions, agreed, "Checked schema versions");
        Ok(agreed.then_some(first))
    }

    /// Checks schema agreement every `interval` until it is reached, the
    /// `timeout` elapses or `cancel` resolves.
    pub(crate) async fn await_schema_agreement(
        &self,
        interval: Duration,
        timeout: Duration,
        cancel: impl Future<Output = ()>,
    ) -> Result<Uuid, SchemaAgreementError> {
        tokio::select! {
            biased;
            () = cancel => Err(SchemaAgreementError::Canceled),
            result = tokio::time::timeout(timeout, self.poll_schema_agreement(interval)) => {
                result.unwrap_or(Err(SchemaAgreementError::Timeout(timeout)))
            }
        }
    }

    async fn poll_schema_agreement(&self, interval: Duration) -> Result<Uuid, SchemaAgreementError> {
        loop {
            if let Some(version) = self.check_schema_agreement().await? {
                return Ok(version);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Stops the worker and closes every pool. Idempotent.
    pub(crate) fn close(&self) {
        let handle = self
            .worker_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if handle.is_some() {
            debug!("Stopping the cluster worker");
        }
        drop(handle);
        self.pool_manager.close_all();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_schema_version(pool: &NodeConnectionPool) -> Result<Uuid, SchemaAgreementError> {
    let connection = pool.random_connection()?;
    connection.fetch_schema_version().await
}

async fn open_and_read(
    address: SocketAddr,
    config: &ConnectionConfig,
) -> Result<(ControlConnection, Metadata), MetadataError> {
    let control_connection = ControlConnection::open(address, config).await?;
    let metadata = control_connection.query_metadata().await?;
    Ok((control_connection, metadata))
}

async fn translate(
    translator: Option<&Arc<dyn AddressTranslator>>,
    peer: &Peer,
) -> Result<SocketAddr, TranslationError> {
    match (peer.address, translator) {
        (NodeAddr::Translatable(_), Some(translator)) => translator.translate_address(peer).await,
        (address, _) => Ok(address.into_inner()),
    }
}

/// Resolves when the control connection breaks; pending while there is none.
async fn broken_control_connection(
    control_connection: &mut Option<ControlConnection>,
) -> ConnectionError {
    match control_connection {
        Some(control_connection) => control_connection.broken().await,
        None => std::future::pending().await,
    }
}

impl ClusterWorker {
    async fn work(mut self) {
        let mut next_refresh = Instant::now() + self.metadata_refresh_interval;
        let mut probe_timer = tokio::time::interval_at(
            Instant::now() + self.down_host_probe_interval,
            self.down_host_probe_interval,
        );
        probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let mut refresh_request = None;

            tokio::select! {
                _ = tokio::time::sleep_until(next_refresh) => {}
                request = self.refresh_channel.recv() => match request {
                    Some(request) => refresh_request = Some(request),
                    // The Cluster handle was dropped.
                    None => return,
                },
                Some(event) = self.server_events_channel.recv() => {
                    // A burst of events costs one refresh.
                    let mut needs_refresh = self.handle_server_event(event);
                    while let Ok(event) = self.server_events_channel.try_recv() {
                        needs_refresh |= self.handle_server_event(event);
                    }
                    if !needs_refresh {
                        continue;
                    }
                }
                Some(event) = self.pool_events_channel.recv() => {
                    self.handle_pool_event(event);
                    continue;
                }
                error = broken_control_connection(&mut self.control_connection) => {
                    warn!(error = %error, "Control connection broke, reconnecting");
                    self.control_connection = None;
                }
                _ = probe_timer.tick() => {
                    self.probe_down_hosts();
                    continue;
                }
                Some(outcome) = self.probes.next(), if !self.probes.is_empty() => {
                    self.handle_probe_outcome(outcome);
                    continue;
                }
            }

            let result = self.perform_refresh().await;
            next_refresh = match &result {
                Ok(()) => Instant::now() + self.metadata_refresh_interval,
                Err(_) if self.control_connection.is_none() => {
                    Instant::now() + self.reconnect_backoff.next_delay()
                }
                Err(_) => Instant::now() + self.metadata_refresh_interval,
            };

            if let Some(request) = refresh_request {
                // The requester may have given up waiting.
                let _ = request.response_chan.send(result);
            }
        }
    }

    async fn perform_refresh(&mut self) -> Result<(), MetadataError> {
        debug!("Refreshing cluster metadata");
        let metadata = self.read_metadata().await?;
        self.apply_metadata(metadata).await;
        self.ensure_control_connection_accepted().await;
        Ok(())
    }

    async fn read_metadata(&mut self) -> Result<Metadata, MetadataError> {
        if let Some(control_connection) = &self.control_connection {
            match control_connection.query_metadata().await {
                Ok(metadata) => return Ok(metadata),
                Err(error) => {
                    warn!(
                        control_connection_address = %control_connection.get_connect_address(),
                        error = %error,
                        "Failed to fetch metadata using current control connection"
                    );
                    self.control_connection = None;
                }
            }
        }
        self.reconnect_and_read_metadata().await
    }

    /// Opens a new control connection to the first candidate that accepts
    /// it and serves metadata.
    async fn reconnect_and_read_metadata(&mut self) -> Result<Metadata, MetadataError> {
        let mut last_error = MetadataError::NoEligibleHosts;
        let config = self.control_connection_config.clone();
        for address in self.control_connection_candidates() {
            match open_and_read(address, &config).await {
                Ok((control_connection, metadata)) => {
                    self.control_connection = Some(control_connection);
                    self.reconnect_backoff.reset();
                    return Ok(metadata);
                }
                Err(error) => {
                    warn!(node = %address, error = %error, "Failed to establish control connection");
                    last_error = error;
                }
            }
        }

        error!(error = %last_error, "Could not fetch metadata from any node");
        Err(last_error)
    }

    /// Hosts the load balancing policy would pick, restricted to known and
    /// accepted ones, followed by the contact points.
    fn control_connection_candidates(&self) -> Vec<SocketAddr> {
        let state = self.state.load();
        let mut candidates: Vec<SocketAddr> = self
            .load_balancing
            .plan(&RoutingInfo::default())
            .filter(|host| {
                state
                    .get_host(&host.host_id)
                    .is_some_and(|known| known.is_enabled())
            })
            .map(|host| host.address)
            .collect();

        let rejected: HashSet<SocketAddr> = state
            .get_nodes_info()
            .iter()
            .filter(|host| !host.is_enabled())
            .map(|host| host.address)
            .collect();
        for contact_point in &self.contact_points {
            if !rejected.contains(contact_point) && !candidates.contains(contact_point) {
                candidates.push(*contact_point);
            }
        }
        candidates
    }

    fn is_accepted(&self, host: &HostInfo) -> bool {
        self.host_filter
            .as_ref()
            .map_or(true, |filter| filter.accept(host))
    }

    /// Merges freshly read metadata into the registry and publishes a new
    /// state.
    async fn apply_metadata(&mut self, metadata: Metadata) {
        let mut seen = HashSet::with_capacity(metadata.peers.len());
        let translator = self.address_translator.clone();

        for peer in &metadata.peers {
            let address = match translate(translator.as_ref(), peer).await {
                Ok(address) => address,
                Err(error) => {
                    warn!(
                        host_id = %peer.host_id,
                        address = %peer.untranslated_address(),
                        error = %error,
                        "Address translation failed, skipping the node"
                    );
                    continue;
                }
            };

            let status = self
                .registry
                .get(&peer.host_id)
                .map_or(HostStatus::Up, |known| known.status);
            let mut host = HostInfo {
                host_id: peer.host_id,
                address,
                broadcast_address: peer.untranslated_address(),
                datacenter: peer.datacenter.clone(),
                rack: peer.rack.clone(),
                tokens: peer.tokens.clone(),
                status,
                schema_version: peer.schema_version,
                release_version: peer.release_version.clone(),
                enabled: true,
            };
            host.enabled = self.is_accepted(&host);

            seen.insert(peer.host_id);
            self.registry.add_or_update(host);
        }

        let gone: Vec<Uuid> = self
            .registry
            .snapshot()
            .iter()
            .map(|host| host.host_id)
            .filter(|host_id| !seen.contains(host_id))
            .collect();
        for host_id in gone {
            self.registry.remove(&host_id);
        }

        let snapshot = self.registry.snapshot();
        if !snapshot.hosts().is_empty() && snapshot.iter().all(|host| !host.is_enabled()) {
            error!(
                "The host filter rejected every node of the cluster; no requests can be sent"
            );
        }

        self.keyspaces = metadata.keyspaces;
        self.partitioner = metadata.partitioner;
        self.pool_manager.reconcile(&snapshot);
        self.publish_state();
    }

    /// Moves the control connection off a node the host filter rejected,
    /// if an accepted node can be reached.
    async fn ensure_control_connection_accepted(&mut self) {
        let Some(control_connection) = &self.control_connection else {
            return;
        };
        let address = control_connection.get_connect_address();
        let state = self.state.load_full();
        let on_rejected_host = state
            .get_nodes_info()
            .iter()
            .any(|host| host.address == address && !host.is_enabled());
        if !on_rejected_host {
            return;
        }

        warn!(
            control_connection_address = %address,
            "The host filter rejected the node of the control connection, moving it"
        );
        let config = self.control_connection_config.clone();
        for candidate in self.control_connection_candidates() {
            match ControlConnection::open(candidate, &config).await {
                Ok(control_connection) => {
                    self.control_connection = Some(control_connection);
                    return;
                }
                Err(error) => {
                    debug!(node = %candidate, error = %error, "Node refused the control connection")
                }
            }
        }
        warn!("No accepted node took the control connection, keeping the current one");
    }

    fn publish_state(&self) {
        let state = Arc::new(ClusterState::new(
            &self.registry.snapshot(),
            self.keyspaces.clone(),
            self.partitioner.clone(),
        ));
        trace!(version = state.version(), "Publishing cluster state");
        self.state.store(state.clone());
        self.load_balancing.on_topology_change(&state);
    }

    fn set_status(&self, host_id: &Uuid, status: HostStatus) {
        if let Some(host) = self.registry.set_status(host_id, status) {
            info!(host = %host, status = ?status, "Host status changed");
            self.publish_state();
        }
    }

    /// Finds the host an event is about. Events name the broadcast address,
    /// possibly with a port other than the one connected to.
    fn host_by_event_address(&self, addr: SocketAddr) -> Option<Arc<HostInfo>> {
        self.registry.find_by_address(addr).or_else(|| {
            self.registry
                .snapshot()
                .iter()
                .find(|host| host.broadcast_address.ip() == addr.ip())
                .cloned()
        })
    }

    /// Returns whether the event calls for a metadata refresh.
    fn handle_server_event(&mut self, event: Event) -> bool {
        debug!(event = ?event, "Received server event");
        match event {
            Event::TopologyChange(_) | Event::SchemaChange(_) => true,
            Event::StatusChange(StatusChangeEvent::Down(addr)) => {
                match self.host_by_event_address(addr) {
                    Some(host) => self.set_status(&host.host_id, HostStatus::Down),
                    None => trace!(address = %addr, "DOWN event for an unknown node"),
                }
                false
            }
            Event::StatusChange(StatusChangeEvent::Up(addr)) => {
                match self.host_by_event_address(addr) {
                    // Possibly a node that just joined.
                    None => true,
                    Some(host) => {
                        if !host.is_up() && host.is_enabled() {
                            self.start_probe(&host);
                        }
                        false
                    }
                }
            }
        }
    }

    fn handle_pool_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Broken {
                host_id,
                last_error,
            } => {
                // A pool replaced or removed since then says nothing.
                let still_broken = self
                    .pool_manager
                    .pool_for(&host_id)
                    .is_some_and(|pool| !pool.is_connected());
                if still_broken {
                    warn!(host_id = %host_id, error = %last_error, "Host unreachable, marking it down");
                    self.set_status(&host_id, HostStatus::Down);
                }
            }
            PoolEvent::Recovered { host_id } => self.set_status(&host_id, HostStatus::Up),
        }
    }

    fn probe_down_hosts(&mut self) {
        let down: Vec<Arc<HostInfo>> = self
            .registry
            .snapshot()
            .iter()
            .filter(|host| host.is_enabled() && !host.is_up())
            .cloned()
            .collect();
        for host in down {
            self.start_probe(&host);
        }
    }

    /// Tries to open a single connection to `host`, unless a probe of it
    /// is already running.
    fn start_probe(&mut self, host: &HostInfo) {
        if !self.probing.insert(host.host_id) {
            return;
        }
        trace!(host = %host, "Probing host");

        let config = self.probe_connection_config.clone();
        let (host_id, address) = (host.host_id, host.address);
        self.probes.push(
            async move {
                let result = open_connection(address, None, &config)
                    .await
                    .map(|_connection| ());
                ProbeOutcome {
                    host_id,
                    address,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn handle_probe_outcome(&mut self, outcome: ProbeOutcome) {
        self.probing.remove(&outcome.host_id);
        match outcome.result {
            Ok(()) => {
                let same_host = self
                    .registry
                    .get(&outcome.host_id)
                    .is_some_and(|host| host.address == outcome.address);
                if same_host {
                    self.set_status(&outcome.host_id, HostStatus::Up);
                }
            }
            Err(error) => debug!(
                host_id = %outcome.host_id,
                address = %outcome.address,
                error = %error,
                "Host still unreachable"
            ),
        }
    }
}
