//! Host filters are predicates over [`HostInfo`]. Hosts a filter rejects
//! stay in the cluster metadata, marked disabled, but the driver never
//! opens connections to them nor routes requests to them.

use std::collections::HashSet;
use std::io::Error;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::cluster::host::HostInfo;

pub trait HostFilter: Send + Sync {
    /// Returns whether a host should be accepted or not.
    fn accept(&self, host: &HostInfo) -> bool;
}

/// Unconditionally accepts all hosts.
#[derive(Debug, Default)]
pub struct AcceptAllHostFilter;

impl HostFilter for AcceptAllHostFilter {
    fn accept(&self, _host: &HostInfo) -> bool {
        true
    }
}

/// Accepts hosts whose advertised or connect address is on an allow list.
#[derive(Debug)]
pub struct AllowListHostFilter {
    allowed: HashSet<SocketAddr>,
}

impl AllowListHostFilter {
    /// Resolves every entry of `allowed_iter` into the allow list.
    pub fn new<I, A>(allowed_iter: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = A>,
        A: ToSocketAddrs,
    {
        let mut allowed = HashSet::new();
        for item in allowed_iter {
            allowed.extend(item.to_socket_addrs()?);
        }

        Ok(Self { allowed })
    }
}

impl HostFilter for AllowListHostFilter {
    fn accept(&self, host: &HostInfo) -> bool {
        self.allowed.contains(&host.broadcast_address) || self.allowed.contains(&host.address)
    }
}

/// Accepts hosts of one datacenter.
#[derive(Debug)]
pub struct DcHostFilter {
    local_dc: String,
}

impl DcHostFilter {
    pub fn new(local_dc: String) -> Self {
        Self { local_dc }
    }
}

impl HostFilter for DcHostFilter {
    fn accept(&self, host: &HostInfo) -> bool {
        host.datacenter.as_ref() == Some(&self.local_dc)
    }
}

impl<F> HostFilter for F
where
    F: Fn(&HostInfo) -> bool + Send + Sync,
{
    fn accept(&self, host: &HostInfo) -> bool {
        self(host)
    }
}
