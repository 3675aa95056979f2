use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;
use uuid::Uuid;

use crate::cluster::host::{HostInfo, HostStatus};
use crate::policies::host_listener::{HostEvent, HostEventContext, HostListener};

/// The authoritative map of known hosts.
///
/// Every mutation replaces the affected `Arc<HostInfo>` and bumps the
/// version, so structures derived from a snapshot can tell they are stale.
/// Subscribed listeners are notified synchronously after each mutation,
/// in the order mutations were applied; they must not mutate the registry
/// from within the callback.
pub struct HostRegistry {
    inner: RwLock<RegistryInner>,
    listeners: RwLock<Vec<Arc<dyn HostListener>>>,
    // Held across a mutation and its notifications, so that listeners
    // observe events in the order they were applied.
    apply_lock: Mutex<()>,
}

#[derive(Default)]
struct RegistryInner {
    hosts: HashMap<Uuid, Arc<HostInfo>>,
    version: u64,
}

/// A consistent copy of the registry at one version.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    version: u64,
    hosts: HashMap<Uuid, Arc<HostInfo>>,
}

impl RegistrySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn hosts(&self) -> &HashMap<Uuid, Arc<HostInfo>> {
        &self.hosts
    }

    pub fn get(&self, host_id: &Uuid) -> Option<&Arc<HostInfo>> {
        self.hosts.get(host_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<HostInfo>> {
        self.hosts.values()
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("HostRegistry")
            .field("version", &inner.version)
            .field("hosts", &inner.hosts.len())
            .finish_non_exhaustive()
    }
}

impl HostRegistry {
    pub fn new() -> Self {
        HostRegistry {
            inner: RwLock::new(RegistryInner::default()),
            listeners: RwLock::new(Vec::new()),
            apply_lock: Mutex::new(()),
        }
    }

    /// Registers a listener for all subsequent host events.
    pub fn subscribe(&self, listener: Arc<dyn HostListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn version(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        RegistrySnapshot {
            version: inner.version,
            hosts: inner.hosts.clone(),
        }
    }

    pub fn get(&self, host_id: &Uuid) -> Option<Arc<HostInfo>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hosts
            .get(host_id)
            .cloned()
    }

    /// Finds a host by the address it advertises or the one the driver
    /// connects to. Server events carry the former.
    pub fn find_by_address(&self, addr: SocketAddr) -> Option<Arc<HostInfo>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .hosts
            .values()
            .find(|host| host.broadcast_address == addr)
            .or_else(|| inner.hosts.values().find(|host| host.address == addr))
            .cloned()
    }

    /// Inserts a new host or replaces a known one.
    ///
    /// Emits `Added` for new hosts, and `AddressChanged`, `Up` or `Down` for
    /// the respective changes of known ones. Returns the stored host.
    pub fn add_or_update(&self, host: HostInfo) -> Arc<HostInfo> {
        let _apply = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut events = Vec::new();
        let host = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            match inner.hosts.get(&host.host_id) {
                None => events.push(HostEvent::Added),
                Some(old) if **old == host => return old.clone(),
                Some(old) => {
                    if old.address != host.address {
                        events.push(HostEvent::AddressChanged {
                            old_address: old.address,
                            new_address: host.address,
                        });
                    }
                    if old.status != host.status {
                        events.push(status_event(host.status));
                    }
                }
            }
            let host = Arc::new(host);
            inner.hosts.insert(host.host_id, host.clone());
            inner.version += 1;
            host
        };

        debug!(host = %host, events = ?events, "Host registry updated");
        self.notify(&host, &events);
        host
    }

    /// Removes a host. A host that was up is first reported `Down`, then `Removed`.
    pub fn remove(&self, host_id: &Uuid) -> Option<Arc<HostInfo>> {
        let _apply = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let removed = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let removed = inner.hosts.remove(host_id)?;
            inner.version += 1;
            removed
        };

        debug!(host = %removed, "Host removed from registry");
        if removed.is_up() {
            let down = Arc::new(removed.with_status(HostStatus::Down));
            self.notify(&down, &[HostEvent::Down, HostEvent::Removed]);
        } else {
            self.notify(&removed, &[HostEvent::Removed]);
        }
        Some(removed)
    }

    /// Marks a known host up or down. Returns the new host value if the
    /// status actually changed.
    pub fn set_status(&self, host_id: &Uuid, status: HostStatus) -> Option<Arc<HostInfo>> {
        let _apply = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let host = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let old = inner.hosts.get(host_id)?;
            if old.status == status {
                return None;
            }
            let host = Arc::new(old.with_status(status));
            inner.hosts.insert(*host_id, host.clone());
            inner.version += 1;
            host
        };

        debug!(host = %host, status = ?status, "Host status changed");
        self.notify(&host, &[status_event(status)]);
        Some(host)
    }

    fn notify(&self, host: &Arc<HostInfo>, events: &[HostEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let ctx = HostEventContext { host: host.clone() };
        for event in events {
            for listener in &listeners {
                listener.on_event(&ctx, event);
            }
        }
    }
}

fn status_event(status: HostStatus) -> HostEvent {
    match status {
        HostStatus::Up => HostEvent::Up,
        HostStatus::Down => HostEvent::Down,
    }
}
