//! Notifications about hosts joining, leaving, moving or changing status.
//!
//! Listeners are registered with
//! [`HostRegistry::subscribe`](crate::cluster::registry::HostRegistry::subscribe)
//! and notified synchronously, in the order the registry applied the changes.

use std::net::SocketAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::cluster::host::HostInfo;

/// What a [HostListener] gets to know about the host an event concerns.
#[non_exhaustive]
#[derive(Debug)]
pub struct HostEventContext {
    pub(crate) host: Arc<HostInfo>,
}

impl HostEventContext {
    pub fn host_id(&self) -> Uuid {
        self.host.host_id
    }

    /// Connect address of the host, after translation.
    pub fn addr(&self) -> SocketAddr {
        self.host.address
    }

    /// State of the host right after the event.
    pub fn host(&self) -> &Arc<HostInfo> {
        &self.host
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// The host appeared in metadata for the first time, or was reported
    /// by a topology event.
    Added,

    /// The host is gone from metadata. A host that was up is first
    /// reported as [`HostEvent::Down`].
    Removed,

    /// Same host id, different connect address.
    AddressChanged {
        old_address: SocketAddr,
        new_address: SocketAddr,
    },

    /// A status event said so, or a reconnection probe succeeded.
    Up,

    /// A status event said so, or the host's pool could not open any
    /// connection.
    Down,
}

/// Receives every [`HostEvent`] of the registry it subscribed to.
///
/// A host goes `Up` and `Down` alternately; repeated status reports do not
/// produce repeated events.
///
/// Handlers run while topology is being applied, so they should only
/// enqueue work or do short non-blocking updates.
pub trait HostListener: Send + Sync {
    fn on_event(&self, ctx: &HostEventContext, event: &HostEvent);
}
