use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::RemoteHandle;
use futures::stream::FuturesUnordered;
use futures::{Future, FutureExt, StreamExt};
use itertools::Itertools;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::connection::{
    open_connection, open_connection_to_shard_aware_port, Connection, ConnectionConfig,
    ErrorReceiver, VerifiedKeyspaceName,
};
use super::pool_manager::use_keyspace_result;
use crate::errors::{
    BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError, UseKeyspaceError,
};
use crate::routing::{Shard, ShardCount, Sharder, Token};

/// The target size of a per-node connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSize {
    /// Establish this many connections to the node, whatever shards they land on.
    PerHost(NonZeroUsize),

    /// Establish this many connections to each shard of the node.
    /// Unsharded nodes are treated as if they had a single shard.
    ///
    /// One connection per shard is the recommended setting.
    PerShard(NonZeroUsize),
}

impl Default for PoolSize {
    fn default() -> Self {
        PoolSize::PerShard(NonZeroUsize::MIN)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) pool_size: PoolSize,
    pub(crate) can_use_shard_aware_port: bool,
    /// Connections to the shard-aware port that may land on a shard other
    /// than the requested one before the pool stops using that port.
    pub(crate) shard_aware_retry_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: Default::default(),
            pool_size: Default::default(),
            can_use_shard_aware_port: true,
            shard_aware_retry_limit: 3,
        }
    }
}

/// Notifications a pool sends to whoever manages it.
#[derive(Debug, Clone)]
pub(crate) enum PoolEvent {
    /// Every connection is gone and the latest attempt to open one failed.
    Broken {
        host_id: Uuid,
        last_error: ConnectionError,
    },
    /// The pool got its first connection after being broken.
    Recovered { host_id: Uuid },
}

enum MaybePoolConnections {
    // First fill still running.
    Initializing,

    // Nothing usable after a fill attempt; the refiller keeps trying.
    // Holds the error of the latest attempt.
    Broken(ConnectionError),

    // At least one connection, possibly about to be dropped as broken.
    Ready(PoolConnections),

    // The pool was closed and will not open connections anymore.
    Closed,
}

impl std::fmt::Debug for MaybePoolConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaybePoolConnections::Initializing => write!(f, "Initializing"),
            MaybePoolConnections::Broken(err) => write!(f, "Broken({err:?})"),
            MaybePoolConnections::Ready(conns) => write!(f, "{conns:?}"),
            MaybePoolConnections::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Clone)]
enum PoolConnections {
    NotSharded(Vec<Arc<Connection>>),
    Sharded {
        sharder: Sharder,
        connections: Vec<Vec<Arc<Connection>>>,
    },
}

impl std::fmt::Debug for PoolConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolConnections::NotSharded(conns) => {
                write!(f, "non-sharded: {} connections", conns.len())
            }
            PoolConnections::Sharded {
                sharder,
                connections,
            } => write!(
                f,
                "sharded(nr_shards:{}, msb_ignore_bits:{}): [{}]",
                sharder.nr_shards,
                sharder.msb_ignore,
                connections.iter().map(Vec::len).join(", ")
            ),
        }
    }
}

/// Connections to a single node.
///
/// Filling and refilling happens on a background refiller task, which
/// stops when the last clone of the pool is dropped or [`Self::close`] is
/// called. Picking a connection never waits for the refiller.
#[derive(Clone)]
pub(crate) struct NodeConnectionPool {
    host_id: Uuid,
    address: SocketAddr,
    conns: Arc<ArcSwap<MaybePoolConnections>>,
    use_keyspace_request_sender: mpsc::Sender<UseKeyspaceRequest>,
    close_sender: Arc<mpsc::Sender<()>>,
    _refiller_handle: Arc<RemoteHandle<()>>,
    pool_updated_notify: Arc<Notify>,
    shard_aware_disabled: Arc<AtomicBool>,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("host_id", &self.host_id)
            .field("address", &self.address)
            .field("conns", &self.conns)
            .finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    pub(crate) fn new(
        host_id: Uuid,
        address: SocketAddr,
        pool_config: &PoolConfig,
        current_keyspace: Option<VerifiedKeyspaceName>,
        pool_event_sender: Option<mpsc::UnboundedSender<PoolEvent>>,
    ) -> Self {
        let (use_keyspace_request_sender, use_keyspace_request_receiver) = mpsc::channel(1);
        let (close_sender, close_receiver) = mpsc::channel(1);
        let pool_updated_notify = Arc::new(Notify::new());
        let shard_aware_disabled = Arc::new(AtomicBool::new(false));

        let refiller = PoolRefiller::new(
            host_id,
            address,
            pool_config.clone(),
            current_keyspace,
            pool_updated_notify.clone(),
            shard_aware_disabled.clone(),
            pool_event_sender,
        );

        let conns = refiller.get_shared_connections();
        let (fut, refiller_handle) = refiller
            .run(use_keyspace_request_receiver, close_receiver)
            .remote_handle();
        tokio::spawn(fut);

        Self {
            host_id,
            address,
            conns,
            use_keyspace_request_sender,
            close_sender: Arc::new(close_sender),
            _refiller_handle: Arc::new(refiller_handle),
            pool_updated_notify,
            shard_aware_disabled,
        }
    }

    pub(crate) fn host_id(&self) -> Uuid {
        self.host_id
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    /// Whether both handles refer to the same pool.
    #[cfg(test)]
    pub(crate) fn is_same_pool(&self, other: &NodeConnectionPool) -> bool {
        Arc::ptr_eq(&self.conns, &other.conns)
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(**self.conns.load(), MaybePoolConnections::Ready(_))
    }

    /// Number of connections currently in the pool.
    pub(crate) fn size(&self) -> usize {
        self.with_connections(|pool_conns| match pool_conns {
            PoolConnections::NotSharded(conns) => conns.len(),
            PoolConnections::Sharded { connections, .. } => {
                connections.iter().map(Vec::len).sum()
            }
        })
        .unwrap_or(0)
    }

    /// Sharding parameters of the node, known once a connection was made.
    pub(crate) fn sharder(&self) -> Option<Sharder> {
        self.with_connections(|pool_conns| match pool_conns {
            PoolConnections::NotSharded(_) => None,
            PoolConnections::Sharded { sharder, .. } => Some(sharder.clone()),
        })
        .unwrap_or(None)
    }

    /// Whether the pool gave up on the shard-aware port after too many
    /// connections landed on unexpected shards.
    pub(crate) fn is_shard_aware_port_disabled(&self) -> bool {
        self.shard_aware_disabled.load(Ordering::Relaxed)
    }

    /// Picks a connection to `shard`, or to any other shard if that slot is empty.
    pub(crate) fn connection_for_shard(
        &self,
        shard: Shard,
    ) -> Result<Arc<Connection>, ConnectionPoolError> {
        trace!(shard = shard, "Selecting connection for shard");
        self.with_connections(|pool_conns| match pool_conns {
            PoolConnections::NotSharded(conns) => Self::choose_random_connection_from_slice(conns),
            PoolConnections::Sharded {
                connections,
                sharder,
            } => {
                let shard = u16::try_from(shard).unwrap_or_else(|_| {
                    warn!(shard, "Shard number does not fit u16; using shard 0");
                    0
                });
                Self::connection_for_shard_helper(shard, sharder.nr_shards, connections)
            }
        })?
        .ok_or(ConnectionPoolError::Initializing)
    }

    /// Picks a connection to the shard owning `token`.
    pub(crate) fn connection_for_token(
        &self,
        token: Token,
    ) -> Result<Arc<Connection>, ConnectionPoolError> {
        match self.sharder() {
            Some(sharder) => self.connection_for_shard(sharder.shard_of(token)),
            None => self.random_connection(),
        }
    }

    pub(crate) fn random_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        trace!("Selecting random connection");
        self.with_connections(|pool_conns| match pool_conns {
            PoolConnections::NotSharded(conns) => Self::choose_random_connection_from_slice(conns),
            PoolConnections::Sharded {
                sharder,
                connections,
            } => {
                let shard: u16 = rand::rng().random_range(0..sharder.nr_shards.get());
                Self::connection_for_shard_helper(shard, sharder.nr_shards, connections)
            }
        })?
        .ok_or(ConnectionPoolError::Initializing)
    }

    // Tries to get a connection to given shard, if there is none returns any working connection
    fn connection_for_shard_helper(
        shard: u16,
        nr_shards: ShardCount,
        shard_conns: &[Vec<Arc<Connection>>],
    ) -> Option<Arc<Connection>> {
        if let Some(conn) = shard_conns
            .get(shard as usize)
            .or_else(|| {
                warn!(shard, "Requested shard is out of bounds, targeting another one");
                None
            })
            .and_then(|conns| Self::choose_random_connection_from_slice(conns))
        {
            trace!(shard, "Found connection for the target shard");
            return Some(conn);
        }

        // Try the remaining shards in random order.
        let mut shards_to_try: Vec<u16> = (0..nr_shards.get()).filter(|s| *s != shard).collect();
        while !shards_to_try.is_empty() {
            let idx = rand::rng().random_range(0..shards_to_try.len());
            let other = shards_to_try.swap_remove(idx);

            if let Some(conn) = shard_conns
                .get(other as usize)
                .and_then(|conns| Self::choose_random_connection_from_slice(conns))
            {
                trace!(
                    orig_shard = shard,
                    shard = other,
                    "Choosing connection for a different shard"
                );
                return Some(conn);
            }
        }

        None
    }

    fn choose_random_connection_from_slice(v: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        match v.len() {
            0 => None,
            1 => Some(v[0].clone()),
            len => Some(v[rand::rng().random_range(0..len)].clone()),
        }
    }

    /// Sets the keyspace on every connection, and on connections opened later.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let (response_sender, response_receiver) = oneshot::channel();

        // The refiller only stops once every clone of the pool is gone or
        // the pool was closed; in both cases there is nothing to set.
        self.use_keyspace_request_sender
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_sender,
            })
            .await
            .map_err(|_| UseKeyspaceError::SessionClosed)?;

        response_receiver
            .await
            .unwrap_or(Err(UseKeyspaceError::SessionClosed))
    }

    /// Waits until the first fill either produced a connection or failed.
    pub(crate) async fn wait_until_initialized(&self) {
        // Register for the notification first, so that it is not missed.
        let notified = self.pool_updated_notify.notified();

        if let MaybePoolConnections::Initializing = **self.conns.load() {
            notified.await;
        }
    }

    /// Drops all connections and stops the refiller. Picking from a closed
    /// pool fails with [`ConnectionPoolError::NodeDisabled`].
    pub(crate) fn close(&self) {
        self.conns.store(Arc::new(MaybePoolConnections::Closed));
        let _ = self.close_sender.try_send(());
        self.pool_updated_notify.notify_waiters();
    }

    fn with_connections<T>(
        &self,
        f: impl FnOnce(&PoolConnections) -> T,
    ) -> Result<T, ConnectionPoolError> {
        let conns = self.conns.load_full();
        match &*conns {
            MaybePoolConnections::Ready(pool_connections) => Ok(f(pool_connections)),
            MaybePoolConnections::Broken(err) => Err(ConnectionPoolError::Broken {
                last_connection_error: err.clone(),
            }),
            MaybePoolConnections::Initializing => Err(ConnectionPoolError::Initializing),
            MaybePoolConnections::Closed => Err(ConnectionPoolError::NodeDisabled),
        }
    }
}

const EXCESS_CONNECTION_BOUND_PER_SHARD_MULTIPLIER: usize = 10;

const MIN_FILL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_FILL_BACKOFF: Duration = Duration::from_secs(10);
const FILL_BACKOFF_MULTIPLIER: u32 = 2;

/// Exponential backoff between pool refills.
struct RefillDelayStrategy {
    current_delay: Duration,
}

impl RefillDelayStrategy {
    fn new() -> Self {
        Self {
            current_delay: MIN_FILL_BACKOFF,
        }
    }

    fn get_delay(&self) -> Duration {
        self.current_delay
    }

    fn on_successful_fill(&mut self) {
        self.current_delay = MIN_FILL_BACKOFF;
    }

    fn on_fill_error(&mut self) {
        self.current_delay = std::cmp::min(
            MAX_FILL_BACKOFF,
            self.current_delay * FILL_BACKOFF_MULTIPLIER,
        );
    }
}

type BoxedEventFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

struct PoolRefiller {
    host_id: Uuid,
    address: SocketAddr,
    pool_config: PoolConfig,

    // Following fields are updated with information from OPTIONS
    shard_aware_port: Option<u16>,
    sharder: Option<Sharder>,

    // Shard-aware connections that landed on another shard, in a row.
    shard_mismatches: usize,
    shard_aware_disabled: Arc<AtomicBool>,

    // `shared_conns` is updated only after `conns` change
    shared_conns: Arc<ArcSwap<MaybePoolConnections>>,
    conns: Vec<Vec<Arc<Connection>>>,

    // Set to true if there was an error since the last refill,
    // set to false when refilling starts.
    had_error_since_last_refill: bool,
    refill_delay_strategy: RefillDelayStrategy,

    ready_connections: FuturesUnordered<BoxedEventFuture<OpenedConnectionEvent>>,
    connection_errors: FuturesUnordered<BoxedEventFuture<BrokenConnectionEvent>>,

    // A node assigns a connection made to its regular port to its least
    // loaded shard. Connections that land on an already full shard are kept
    // here while the pool fills, so that the node spreads the next ones.
    // Bounded by a multiple of the shard count and dropped once the pool is full.
    excess_connections: Vec<Arc<Connection>>,

    current_keyspace: Option<VerifiedKeyspaceName>,

    pool_updated_notify: Arc<Notify>,
    pool_event_sender: Option<mpsc::UnboundedSender<PoolEvent>>,
    is_broken: bool,
}

#[derive(Debug)]
struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
}

impl PoolRefiller {
    fn new(
        host_id: Uuid,
        address: SocketAddr,
        pool_config: PoolConfig,
        current_keyspace: Option<VerifiedKeyspaceName>,
        pool_updated_notify: Arc<Notify>,
        shard_aware_disabled: Arc<AtomicBool>,
        pool_event_sender: Option<mpsc::UnboundedSender<PoolEvent>>,
    ) -> Self {
        // Until the first connection says otherwise, the node has one shard.
        let conns = vec![Vec::new()];
        let shared_conns = Arc::new(ArcSwap::new(Arc::new(MaybePoolConnections::Initializing)));

        Self {
            host_id,
            address,
            pool_config,

            shard_aware_port: None,
            sharder: None,

            shard_mismatches: 0,
            shard_aware_disabled,

            shared_conns,
            conns,

            had_error_since_last_refill: false,
            refill_delay_strategy: RefillDelayStrategy::new(),

            ready_connections: FuturesUnordered::new(),
            connection_errors: FuturesUnordered::new(),

            excess_connections: Vec::new(),

            current_keyspace,

            pool_updated_notify,
            pool_event_sender,
            is_broken: false,
        }
    }

    fn get_shared_connections(&self) -> Arc<ArcSwap<MaybePoolConnections>> {
        self.shared_conns.clone()
    }

    // The main loop of the pool refiller
    async fn run(
        mut self,
        mut use_keyspace_request_receiver: mpsc::Receiver<UseKeyspaceRequest>,
        mut close_receiver: mpsc::Receiver<()>,
    ) {
        debug!(node = %self.address, "Started asynchronous pool worker");

        let mut next_refill_time = tokio::time::Instant::now();
        let mut refill_scheduled = true;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_refill_time), if refill_scheduled => {
                    self.had_error_since_last_refill = false;
                    self.start_filling();
                    refill_scheduled = false;
                }

                evt = self.ready_connections.select_next_some(), if !self.ready_connections.is_empty() => {
                    self.handle_ready_connection(evt);

                    if self.is_full() {
                        debug!(
                            node = %self.address,
                            "Pool is full, clearing {} excess connections",
                            self.excess_connections.len()
                        );
                        self.excess_connections.clear();
                    }
                }

                evt = self.connection_errors.select_next_some(), if !self.connection_errors.is_empty() => {
                    if let Some(conn) = evt.connection.upgrade() {
                        debug!(node = %self.address, error = %evt.error, "Connection {:p} broke", Arc::as_ptr(&conn));
                        self.remove_connection(conn, evt.error);
                    }
                }

                req = use_keyspace_request_receiver.recv() => {
                    match req {
                        Some(req) => {
                            debug!(node = %self.address, keyspace = req.keyspace_name.as_str(), "Requested keyspace change");
                            self.use_keyspace(req.keyspace_name, req.response_sender);
                        }
                        // Every clone of the pool is gone.
                        None => {
                            trace!(node = %self.address, "Pool dropped, stopping asynchronous pool worker");
                            return;
                        }
                    }
                }

                _ = close_receiver.recv() => {
                    debug!(node = %self.address, "Pool closed, stopping asynchronous pool worker");
                    return;
                }
            }

            if !refill_scheduled && self.need_filling() {
                if self.had_error_since_last_refill {
                    self.refill_delay_strategy.on_fill_error();
                } else {
                    self.refill_delay_strategy.on_successful_fill();
                }
                let delay = self.refill_delay_strategy.get_delay();
                debug!(
                    node = %self.address,
                    "Scheduling next refill in {} ms",
                    delay.as_millis(),
                );

                next_refill_time = tokio::time::Instant::now() + delay;
                refill_scheduled = true;
            }
        }
    }

    fn is_filling(&self) -> bool {
        !self.ready_connections.is_empty()
    }

    fn is_full(&self) -> bool {
        match self.pool_config.pool_size {
            PoolSize::PerHost(target) => self.active_connection_count() >= target.get(),
            PoolSize::PerShard(target) => {
                self.conns.iter().all(|conns| conns.len() >= target.get())
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.conns.iter().all(|conns| conns.is_empty())
    }

    fn need_filling(&self) -> bool {
        !self.is_filling() && !self.is_full()
    }

    fn can_use_shard_aware_port(&self) -> bool {
        self.sharder.is_some()
            && self.shard_aware_port.is_some()
            && self.pool_config.can_use_shard_aware_port
            && !self.shard_aware_disabled.load(Ordering::Relaxed)
    }

    // Begins opening a number of connections in order to fill the pool.
    // Results arrive on `ready_connections` and are handled in the main loop.
    fn start_filling(&mut self) {
        if self.is_empty() {
            // An empty pool most likely means the node is down; one
            // connection is enough to find out.
            trace!(node = %self.address, "Will open the first connection to the node");
            self.start_opening_connection(None);
            return;
        }

        if self.can_use_shard_aware_port() {
            // Only use the shard-aware port if we have a PerShard strategy
            if let PoolSize::PerShard(target) = self.pool_config.pool_size {
                for (shard_id, shard_conns) in self.conns.iter().enumerate() {
                    let to_open_count = target.get().saturating_sub(shard_conns.len());
                    if to_open_count == 0 {
                        continue;
                    }
                    trace!(
                        node = %self.address,
                        shard = shard_id,
                        "Will open {} connections to shard",
                        to_open_count,
                    );
                    for _ in 0..to_open_count {
                        self.start_opening_connection(Some(shard_id as Shard));
                    }
                }
                return;
            }
        }

        let to_open_count = match self.pool_config.pool_size {
            PoolSize::PerHost(target) => {
                target.get().saturating_sub(self.active_connection_count())
            }
            PoolSize::PerShard(target) => self
                .conns
                .iter()
                .map(|conns| target.get().saturating_sub(conns.len()))
                .sum::<usize>(),
        };
        // The node picks the shards of these; several refills may be needed.
        trace!(
            node = %self.address,
            "Will open {} non-shard-aware connections",
            to_open_count,
        );
        for _ in 0..to_open_count {
            self.start_opening_connection(None);
        }
    }

    // Counts connections to the shard-aware port that missed their shard,
    // and stops using the port once there were too many in a row.
    fn record_shard_aware_outcome(&mut self, requested: Shard, actual: Shard) {
        if requested == actual {
            self.shard_mismatches = 0;
            return;
        }

        self.shard_mismatches += 1;
        debug!(
            node = %self.address,
            requested_shard = requested,
            actual_shard = actual,
            mismatches = self.shard_mismatches,
            "Shard-aware port connection landed on another shard"
        );
        if self.shard_mismatches >= self.pool_config.shard_aware_retry_limit
            && !self.shard_aware_disabled.swap(true, Ordering::Relaxed)
        {
            warn!(
                node = %self.address,
                "Connections to the shard-aware port keep landing on unexpected shards, \
                probably because of NAT; falling back to the regular port"
            );
        }
    }

    // Handles a newly opened connection and decides what to do with it.
    fn handle_ready_connection(&mut self, evt: OpenedConnectionEvent) {
        match evt.result {
            Err(err) => {
                if evt.requested_shard.is_some() {
                    // The shard-aware port may be unreachable while the
                    // regular one works, so this does not count as a fill
                    // error and does not grow the backoff.
                    debug!(
                        node = %self.address,
                        error = %err,
                        "Failed to open connection to the shard-aware port, will retry with regular port",
                    );
                    self.start_opening_connection(None);
                } else {
                    self.had_error_since_last_refill = true;
                    debug!(
                        node = %self.address,
                        error = %err,
                        "Failed to open connection to the non-shard-aware port",
                    );

                    // If all connection attempts in this fill attempt failed
                    // and the pool is empty, report this error.
                    if !self.is_filling() && self.is_empty() {
                        self.update_shared_conns(Some(err));
                    }
                }
            }
            Ok((connection, error_receiver)) => {
                let shard_info = connection.get_shard_info().as_ref();
                let sharder = shard_info.map(|s| s.get_sharder());
                let shard_id = shard_info.map_or(0, |s| s.shard as usize);
                self.maybe_reshard(sharder);

                if self.shard_aware_port != connection.get_shard_aware_port() {
                    debug!(
                        node = %self.address,
                        "Updating shard aware port: {:?}",
                        connection.get_shard_aware_port(),
                    );
                    self.shard_aware_port = connection.get_shard_aware_port();
                }

                // The keyspace must be set before the connection is put in
                // the pool; it then comes back through here.
                if let Some(keyspace) = &self.current_keyspace {
                    if evt.keyspace_name.as_ref() != Some(keyspace) {
                        self.start_setting_keyspace_for_connection(
                            connection,
                            error_receiver,
                            evt.requested_shard,
                        );
                        return;
                    }
                }

                if let Some(requested) = evt.requested_shard {
                    self.record_shard_aware_outcome(requested, shard_id as Shard);
                }

                if shard_id >= self.conns.len() {
                    warn!(
                        node = %self.address,
                        shard = shard_id,
                        "Node reported a shard outside its shard count; dropping the connection"
                    );
                    return;
                }

                let can_be_accepted = match self.pool_config.pool_size {
                    PoolSize::PerHost(target) => self.active_connection_count() < target.get(),
                    PoolSize::PerShard(target) => self.conns[shard_id].len() < target.get(),
                };

                if can_be_accepted {
                    // A shard-aware connection that missed its shard still
                    // fills a free slot, so it is kept.
                    let conn = Arc::new(connection);
                    trace!(
                        node = %self.address,
                        shard = shard_id,
                        "Adding connection {:p} to shard pool, now there are {} for the shard, total {}",
                        Arc::as_ptr(&conn),
                        self.conns[shard_id].len() + 1,
                        self.active_connection_count() + 1,
                    );

                    self.connection_errors
                        .push(wait_for_error(Arc::downgrade(&conn), error_receiver).boxed());
                    self.conns[shard_id].push(conn);

                    self.update_shared_conns(None);
                } else if evt.requested_shard.is_some() {
                    // A shard-aware connection missed its shard and the shard
                    // it got is full. Let the node pick instead.
                    debug!(
                        node = %self.address,
                        shard = shard_id,
                        "Excess shard-aware port connection; will retry with non-shard-aware port",
                    );
                    self.start_opening_connection(None);
                } else {
                    let conn = Arc::new(connection);
                    trace!(
                        node = %self.address,
                        shard = shard_id,
                        "Storing excess connection {:p}",
                        Arc::as_ptr(&conn),
                    );

                    self.connection_errors
                        .push(wait_for_error(Arc::downgrade(&conn), error_receiver).boxed());
                    self.excess_connections.push(conn);

                    let excess_connection_limit = self.excess_connection_limit();
                    if self.excess_connections.len() > excess_connection_limit {
                        debug!(
                            node = %self.address,
                            "Excess connection pool exceeded limit of {} connections - clearing",
                            excess_connection_limit,
                        );
                        self.excess_connections.clear();
                    }
                }
            }
        }
    }

    // Starts opening a new connection in the background. With a shard given
    // and the shard-aware port known, the connection targets that shard.
    fn start_opening_connection(&self, shard: Option<Shard>) {
        let cfg = self.pool_config.connection_config.clone();
        let address = self.address;

        let fut = match (self.sharder.clone(), self.shard_aware_port, shard) {
            (Some(sharder), Some(port), Some(shard)) => async move {
                let shard_aware_address = SocketAddr::new(address.ip(), port);
                let result =
                    open_connection_to_shard_aware_port(shard_aware_address, shard, sharder, &cfg)
                        .await;
                OpenedConnectionEvent {
                    result,
                    requested_shard: Some(shard),
                    keyspace_name: None,
                }
            }
            .boxed(),
            _ => async move {
                let result = open_connection(address, None, &cfg).await;
                OpenedConnectionEvent {
                    result,
                    requested_shard: None,
                    keyspace_name: None,
                }
            }
            .boxed(),
        };
        self.ready_connections.push(fut);
    }

    fn maybe_reshard(&mut self, new_sharder: Option<Sharder>) {
        if self.sharder == new_sharder {
            return;
        }

        debug!(
            node = %self.address,
            "New sharder: {:?}, clearing all connections",
            new_sharder,
        );

        self.sharder.clone_from(&new_sharder);

        // All connections to one live node share its sharder; the old
        // ones belong to a previous incarnation of the node.
        self.conns.clear();

        let shard_count = new_sharder.map_or(1, |s| s.nr_shards.get() as usize);
        self.conns.resize_with(shard_count, Vec::new);

        self.excess_connections.clear();
        self.shard_mismatches = 0;
    }

    // Updates `shared_conns` based on `conns`.
    // `last_error` must not be `None` if there is a possibility of the pool
    // being empty.
    fn update_shared_conns(&mut self, last_error: Option<ConnectionError>) {
        let new_conns = if self.is_empty() {
            let last_error = last_error.unwrap_or_else(|| {
                ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
            });
            if !self.is_broken {
                self.is_broken = true;
                self.send_event(PoolEvent::Broken {
                    host_id: self.host_id,
                    last_error: last_error.clone(),
                });
            }
            MaybePoolConnections::Broken(last_error)
        } else {
            if self.is_broken {
                self.is_broken = false;
                self.send_event(PoolEvent::Recovered {
                    host_id: self.host_id,
                });
            }
            let new_conns = match self.sharder.as_ref() {
                Some(sharder) => {
                    debug_assert_eq!(self.conns.len(), sharder.nr_shards.get() as usize);
                    PoolConnections::Sharded {
                        sharder: sharder.clone(),
                        connections: self.conns.clone(),
                    }
                }
                None => {
                    debug_assert_eq!(self.conns.len(), 1);
                    PoolConnections::NotSharded(self.conns[0].clone())
                }
            };
            MaybePoolConnections::Ready(new_conns)
        };

        self.shared_conns.store(Arc::new(new_conns));
        self.pool_updated_notify.notify_waiters();
    }

    fn send_event(&self, event: PoolEvent) {
        if let Some(sender) = &self.pool_event_sender {
            // The manager may already be gone during shutdown.
            let _ = sender.send(event);
        }
    }

    // Removes given connection from the pool. It looks both into active
    // connections and excess connections.
    fn remove_connection(&mut self, connection: Arc<Connection>, last_error: ConnectionError) {
        let ptr = Arc::as_ptr(&connection);

        let maybe_remove_in_vec = |v: &mut Vec<Arc<Connection>>| -> bool {
            match v.iter().position(|other| Arc::ptr_eq(&connection, other)) {
                Some(idx) => {
                    v.swap_remove(idx);
                    true
                }
                None => false,
            }
        };

        // We might have resharded, so the bucket might not exist anymore
        let shard_id = connection
            .get_shard_info()
            .as_ref()
            .map_or(0, |s| s.shard as usize);
        if shard_id < self.conns.len() && maybe_remove_in_vec(&mut self.conns[shard_id]) {
            trace!(
                node = %self.address,
                shard = shard_id,
                "Connection {:p} removed from shard pool, now there are {} for the shard, total {}",
                ptr,
                self.conns[shard_id].len(),
                self.active_connection_count(),
            );
            self.update_shared_conns(Some(last_error));
            return;
        }

        if maybe_remove_in_vec(&mut self.excess_connections) {
            trace!(node = %self.address, "Connection {:p} removed from excess connection pool", ptr);
            return;
        }

        trace!(node = %self.address, "Connection {:p} was already removed", ptr);
    }

    // Switches open connections to `keyspace_name`. Connections opened
    // later get it applied before they join the pool.
    fn use_keyspace(
        &mut self,
        keyspace_name: VerifiedKeyspaceName,
        response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
    ) {
        self.current_keyspace = Some(keyspace_name.clone());

        let conns: Vec<Arc<Connection>> = self.conns.iter().flatten().cloned().collect();
        let address = self.address;
        let connect_timeout = self.pool_config.connection_config.connect_timeout;

        let fut = async move {
            if conns.is_empty() {
                return Ok(());
            }

            let use_keyspace_futures = conns.iter().map(|conn| conn.use_keyspace(&keyspace_name));
            let use_keyspace_results: Vec<Result<(), UseKeyspaceError>> = tokio::time::timeout(
                connect_timeout,
                futures::future::join_all(use_keyspace_futures),
            )
            .await
            .map_err(|_| UseKeyspaceError::RequestTimeout(connect_timeout))?;

            use_keyspace_result(use_keyspace_results.into_iter())
        };

        tokio::task::spawn(async move {
            let res = fut.await;
            match &res {
                Ok(()) => debug!(node = %address, "Successfully changed current keyspace"),
                Err(err) => warn!(node = %address, error = %err, "Failed to change keyspace"),
            }
            let _ = response_sender.send(res);
        });
    }

    // Requires the keyspace to be set
    // Requires that the event is for a successful connection
    fn start_setting_keyspace_for_connection(
        &mut self,
        connection: Connection,
        error_receiver: ErrorReceiver,
        requested_shard: Option<Shard>,
    ) {
        let Some(keyspace_name) = self.current_keyspace.clone() else {
            return;
        };
        let connect_timeout = self.pool_config.connection_config.connect_timeout;
        self.ready_connections.push(
            async move {
                let result =
                    tokio::time::timeout(connect_timeout, connection.use_keyspace(&keyspace_name))
                        .await
                        .unwrap_or(Err(UseKeyspaceError::RequestTimeout(connect_timeout)));
                if let Err(err) = result {
                    warn!(
                        node = %connection.get_connect_address(),
                        error = %err,
                        "Failed to set keyspace for new connection",
                    );
                }
                OpenedConnectionEvent {
                    result: Ok((connection, error_receiver)),
                    requested_shard,
                    keyspace_name: Some(keyspace_name),
                }
            }
            .boxed(),
        );
    }

    fn active_connection_count(&self) -> usize {
        self.conns.iter().map(Vec::len).sum::<usize>()
    }

    fn excess_connection_limit(&self) -> usize {
        match self.pool_config.pool_size {
            PoolSize::PerShard(_) => {
                EXCESS_CONNECTION_BOUND_PER_SHARD_MULTIPLIER
                    * self
                        .sharder
                        .as_ref()
                        .map_or(1, |s| s.nr_shards.get() as usize)
            }

            // In PerHost mode we do not need to keep excess connections
            PoolSize::PerHost(_) => 0,
        }
    }
}

struct BrokenConnectionEvent {
    connection: Weak<Connection>,
    error: ConnectionError,
}

async fn wait_for_error(
    connection: Weak<Connection>,
    error_receiver: ErrorReceiver,
) -> BrokenConnectionEvent {
    BrokenConnectionEvent {
        connection,
        error: error_receiver.await.unwrap_or_else(|_| {
            ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
        }),
    }
}

struct OpenedConnectionEvent {
    result: Result<(Connection, ErrorReceiver), ConnectionError>,
    requested_shard: Option<Shard>,
    keyspace_name: Option<VerifiedKeyspaceName>,
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    use super::{NodeConnectionPool, PoolConfig, PoolEvent, PoolSize};
    use crate::errors::ConnectionPoolError;
    use crate::network::connection::VerifiedKeyspaceName;
    use crate::test_utils::mock_server::{MockCluster, MockNodeConfig, ShardAwarePort};
    use crate::test_utils::{setup_tracing, wait_until};

    fn pool_for(cluster: &MockCluster, config: &PoolConfig) -> NodeConnectionPool {
        let node = &cluster.nodes()[0];
        NodeConnectionPool::new(node.host_id(), node.addr(), config, None, None)
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn fills_one_connection_per_shard() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig::sharded(3)]).await;
        let node = cluster.nodes()[0].clone();
        let pool = pool_for(&cluster, &PoolConfig::default());

        wait_until(|| pool.size() == 3).await;
        wait_until(|| node.open_connections_per_shard() == vec![1, 1, 1]).await;
        assert!(node.shard_aware_connections() > 0);
        assert!(!pool.is_shard_aware_port_disabled());

        for shard in 0..3 {
            let conn = pool.connection_for_shard(shard).unwrap();
            assert_eq!(conn.get_shard_info().as_ref().unwrap().shard as u32, shard);
        }
        // A shard past the shard count still gets a connection to a real shard.
        let conn = pool.connection_for_shard(7).unwrap();
        assert!(conn.get_shard_info().as_ref().unwrap().shard < 3);
        assert_eq!(pool.sharder().unwrap().nr_shards.get(), 3);

        // No reconnections in steady state.
        let accepted = node.shard_aware_connections();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(node.shard_aware_connections(), accepted);
        assert_eq!(node.open_connections_per_shard(), vec![1, 1, 1]);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn per_host_size_ignores_shards() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig::sharded(4)]).await;
        let config = PoolConfig {
            pool_size: PoolSize::PerHost(NonZeroUsize::new(2).unwrap()),
            ..Default::default()
        };
        let pool = pool_for(&cluster, &config);

        wait_until(|| pool.size() == 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.size(), 2);
        assert_eq!(cluster.nodes()[0].shard_aware_connections(), 0);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn nat_makes_the_pool_give_up_on_the_shard_aware_port() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig {
            nat: true,
            ..MockNodeConfig::sharded(4)
        }])
        .await;
        let node = cluster.nodes()[0].clone();
        let pool = pool_for(&cluster, &PoolConfig::default());

        wait_until(|| pool.size() == 4).await;
        assert!(pool.is_shard_aware_port_disabled());

        // Only the three attempts that revealed the NAT used the port.
        let accepted = node.shard_aware_connections();
        assert_eq!(accepted, 3);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(node.shard_aware_connections(), accepted);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn unreachable_shard_aware_port_falls_back_to_regular_port() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig {
            shard_aware_port: ShardAwarePort::Unreachable,
            ..MockNodeConfig::sharded(2)
        }])
        .await;
        let pool = pool_for(&cluster, &PoolConfig::default());

        wait_until(|| pool.size() == 2).await;
        assert_eq!(cluster.nodes()[0].open_connections_per_shard(), vec![1, 1]);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn disallowed_shard_aware_port_is_not_used() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig::sharded(3)]).await;
        let config = PoolConfig {
            can_use_shard_aware_port: false,
            ..Default::default()
        };
        let pool = pool_for(&cluster, &config);

        wait_until(|| pool.size() == 3).await;
        assert_eq!(cluster.nodes()[0].shard_aware_connections(), 0);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn broken_pool_reports_and_recovers() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig::default()]).await;
        let node = cluster.nodes()[0].clone();
        node.stop();

        let (events_sender, mut events) = mpsc::unbounded_channel();
        let pool = NodeConnectionPool::new(
            node.host_id(),
            node.addr(),
            &PoolConfig::default(),
            None,
            Some(events_sender),
        );
        pool.wait_until_initialized().await;

        assert_matches!(
            pool.random_connection(),
            Err(ConnectionPoolError::Broken { .. })
        );
        assert_matches!(
            events.recv().await,
            Some(PoolEvent::Broken { host_id, .. }) if host_id == node.host_id()
        );

        node.start();
        assert_matches!(
            events.recv().await,
            Some(PoolEvent::Recovered { host_id }) if host_id == node.host_id()
        );
        assert!(pool.is_connected());

        pool.close();
        assert_matches!(
            pool.random_connection(),
            Err(ConnectionPoolError::NodeDisabled)
        );
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn keyspace_is_set_on_current_and_future_connections() {
        setup_tracing();
        let cluster = MockCluster::start(vec![MockNodeConfig::sharded(2)]).await;
        let node = cluster.nodes()[0].clone();
        let pool = pool_for(&cluster, &PoolConfig::default());
        wait_until(|| pool.size() == 2).await;

        let ks = VerifiedKeyspaceName::new("my_ks".to_owned(), false).unwrap();
        pool.use_keyspace(ks).await.unwrap();
        let after_use = node.user_queries();
        assert!(after_use >= 2);

        // Replacement connections get the keyspace before joining the pool.
        node.stop();
        wait_until(|| !pool.is_connected()).await;
        node.start();
        wait_until(|| pool.size() == 2).await;
        assert!(node.user_queries() >= after_use + 2);
    }
}
