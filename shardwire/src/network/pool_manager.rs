//! The set of per-host connection pools, kept in line with the host registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::connection::VerifiedKeyspaceName;
use super::connection_pool::{NodeConnectionPool, PoolConfig, PoolEvent};
use crate::cluster::host::HostInfo;
use crate::cluster::registry::RegistrySnapshot;
use crate::errors::{RequestAttemptError, UseKeyspaceError};
use crate::policies::host_listener::{HostEvent, HostEventContext, HostListener};

/// Owns one [`NodeConnectionPool`] per usable host.
///
/// A pool exists for a host exactly when the host is up and enabled. Pools
/// are created without waiting for any connection, so a slow node never
/// holds up topology processing.
pub(crate) struct PoolManager {
    pools: RwLock<HashMap<Uuid, NodeConnectionPool>>,
    pool_config: PoolConfig,
    // Keyspace set on pools created from now on.
    current_keyspace: RwLock<Option<VerifiedKeyspaceName>>,
    pool_event_sender: Option<mpsc::UnboundedSender<PoolEvent>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("PoolManager")
            .field("pools", &*pools)
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    pub(crate) fn new(
        pool_config: PoolConfig,
        pool_event_sender: Option<mpsc::UnboundedSender<PoolEvent>>,
    ) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            pool_config,
            current_keyspace: RwLock::new(None),
            pool_event_sender,
        }
    }

    /// Returns the pool of `host`, creating it if needed. Hosts that are
    /// down or disabled get no pool, and an existing one is closed.
    ///
    /// A pool opened against an outdated address is replaced.
    pub(crate) fn ensure_pool(&self, host: &HostInfo) -> Option<NodeConnectionPool> {
        if !host.is_usable() {
            self.remove_pool(&host.host_id);
            return None;
        }

        if let Some(pool) = self.pool_for(&host.host_id) {
            if pool.address() == host.address {
                return Some(pool);
            }
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have won the race since the read above.
        if let Some(pool) = pools.get(&host.host_id) {
            if pool.address() == host.address {
                return Some(pool.clone());
            }
            debug!(host = %host, old_address = %pool.address(), "Host moved, replacing its pool");
            pool.close();
        }

        debug!(host = %host, "Creating connection pool");
        let keyspace = self
            .current_keyspace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let pool = NodeConnectionPool::new(
            host.host_id,
            host.address,
            &self.pool_config,
            keyspace,
            self.pool_event_sender.clone(),
        );
        pools.insert(host.host_id, pool.clone());
        Some(pool)
    }

    /// Closes and forgets the pool of a host.
    pub(crate) fn remove_pool(&self, host_id: &Uuid) -> Option<NodeConnectionPool> {
        let removed = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host_id);
        if let Some(pool) = &removed {
            debug!(host_id = %host_id, address = %pool.address(), "Closing connection pool");
            pool.close();
        }
        removed
    }

    pub(crate) fn pool_for(&self, host_id: &Uuid) -> Option<NodeConnectionPool> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host_id)
            .cloned()
    }

    pub(crate) fn all_pools(&self) -> HashMap<Uuid, NodeConnectionPool> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Brings the set of pools in line with a registry snapshot: creates
    /// missing pools and drops those of hosts no longer usable or known.
    pub(crate) fn reconcile(&self, snapshot: &RegistrySnapshot) {
        for host in snapshot.iter() {
            self.ensure_pool(host);
        }

        let stale: Vec<Uuid> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|host_id| snapshot.get(host_id).is_none())
            .copied()
            .collect();
        for host_id in stale {
            self.remove_pool(&host_id);
        }
    }

    /// Waits until every current pool finished its first fill.
    pub(crate) async fn wait_until_all_pools_initialized(&self) {
        let pools = self.all_pools();
        join_all(pools.values().map(NodeConnectionPool::wait_until_initialized)).await;
    }

    /// Sets the keyspace on every pool, and on pools created later.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        *self
            .current_keyspace
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(keyspace_name.clone());

        let pools = self.all_pools();
        if pools.is_empty() {
            return Ok(());
        }
        let results = join_all(
            pools
                .values()
                .map(|pool| pool.use_keyspace(keyspace_name.clone())),
        )
        .await;

        use_keyspace_result(results.into_iter())
    }

    pub(crate) fn close_all(&self) {
        let pools = std::mem::take(&mut *self.pools.write().unwrap_or_else(PoisonError::into_inner));
        for pool in pools.values() {
            pool.close();
        }
    }
}

impl HostListener for PoolManager {
    fn on_event(&self, ctx: &HostEventContext, event: &HostEvent) {
        match event {
            HostEvent::Added | HostEvent::Up | HostEvent::AddressChanged { .. } => {
                self.ensure_pool(ctx.host());
            }
            HostEvent::Down | HostEvent::Removed => {
                self.remove_pool(&ctx.host_id());
            }
        }
    }
}

/// Folds per-connection results of a keyspace change into one.
///
/// Succeeds if at least one connection switched and all others are broken;
/// broken connections pick the keyspace up when they are replaced. Any
/// other error is returned as is.
pub(crate) fn use_keyspace_result(
    use_keyspace_results: impl Iterator<Item = Result<(), UseKeyspaceError>>,
) -> Result<(), UseKeyspaceError> {
    let mut was_ok = false;
    let mut broken_conn_error: Option<UseKeyspaceError> = None;

    for result in use_keyspace_results {
        match result {
            Ok(()) => was_ok = true,
            Err(err @ UseKeyspaceError::RequestError(RequestAttemptError::BrokenConnectionError(_))) => {
                broken_conn_error = Some(err)
            }
            Err(err) => return Err(err),
        }
    }

    match broken_conn_error {
        Some(err) if !was_ok => Err(err),
        _ => Ok(()),
    }
}
