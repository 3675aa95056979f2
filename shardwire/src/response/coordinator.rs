use std::net::SocketAddr;
use std::sync::Arc;

use crate::cluster::host::HostInfo;
use crate::routing::Shard;

/// The node and shard that served a request.
#[derive(Debug, Clone)]
pub struct Coordinator {
    connection_address: SocketAddr,
    host: Arc<HostInfo>,
    shard: Option<Shard>,
}

impl Coordinator {
    pub(crate) fn new(host: Arc<HostInfo>, shard: Option<Shard>, connection_address: SocketAddr) -> Self {
        Self {
            connection_address,
            host,
            shard,
        }
    }

    /// Address the connection was opened against, after translation.
    #[inline]
    pub fn connection_address(&self) -> SocketAddr {
        self.connection_address
    }

    #[inline]
    pub fn host(&self) -> &Arc<HostInfo> {
        &self.host
    }

    /// Shard of the connection, for sharded nodes.
    #[inline]
    pub fn shard(&self) -> Option<Shard> {
        self.shard
    }
}
