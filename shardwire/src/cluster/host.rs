use std::fmt;
use std::net::SocketAddr;

use uuid::Uuid;

use crate::routing::Token;

/// Liveness of a host as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostStatus {
    Up,
    Down,
}

/// Everything the driver knows about one node of the cluster.
///
/// Values are never mutated in place: the registry replaces the whole
/// `Arc<HostInfo>` on every change, so a reader holding an `Arc` keeps
/// a consistent view of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    /// Identifier of the node, stable across address changes.
    pub host_id: Uuid,
    /// Address the driver connects to, after address translation.
    pub address: SocketAddr,
    /// Address the node advertises in system tables and events.
    pub broadcast_address: SocketAddr,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub tokens: Vec<Token>,
    pub status: HostStatus,
    pub schema_version: Option<Uuid>,
    pub release_version: Option<String>,
    /// `false` if the host filter rejected this host. Disabled hosts stay
    /// in metadata, but the driver never opens connections to them.
    pub enabled: bool,
}

impl HostInfo {
    #[inline]
    pub fn is_up(&self) -> bool {
        self.status == HostStatus::Up
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether queries may be sent to this host.
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.is_up() && self.is_enabled()
    }

    /// A copy of this host with a different status.
    pub(crate) fn with_status(&self, status: HostStatus) -> HostInfo {
        HostInfo {
            status,
            ..self.clone()
        }
    }

    /// Whether `self` and `other` differ in anything but status.
    pub(crate) fn metadata_differs(&self, other: &HostInfo) -> bool {
        self.address != other.address
            || self.broadcast_address != other.broadcast_address
            || self.datacenter != other.datacenter
            || self.rack != other.rack
            || self.tokens != other.tokens
            || self.schema_version != other.schema_version
            || self.release_version != other.release_version
            || self.enabled != other.enabled
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.host_id)
    }
}
