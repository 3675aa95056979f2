use itertools::Itertools;

use super::TokenRing;
use crate::cluster::host::HostInfo;
use crate::routing::Token;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// The ring restricted to the hosts of one datacenter.
#[derive(Debug, Clone)]
struct DatacenterRing {
    ring: TokenRing<Arc<HostInfo>>,
    unique_hosts: usize,
    rack_count: usize,
}

static EMPTY_DATACENTER_RING: DatacenterRing = DatacenterRing {
    ring: TokenRing::new_empty(),
    unique_hosts: 0,
    rack_count: 0,
};

/// Global and per-datacenter rings, the input of replica computation.
#[derive(Debug, Clone)]
pub(super) struct ReplicationInfo {
    global_ring: TokenRing<Arc<HostInfo>>,
    unique_hosts: Vec<Arc<HostInfo>>,
    datacenters: HashMap<String, DatacenterRing>,
}

impl ReplicationInfo {
    pub(super) fn new(ring_iter: impl Iterator<Item = (Token, Arc<HostInfo>)>) -> Self {
        let global_ring = TokenRing::new(ring_iter);

        let unique_hosts: Vec<Arc<HostInfo>> = global_ring
            .iter()
            .map(|(_, host)| host)
            .unique_by(|host| host.host_id)
            .cloned()
            .collect();

        let datacenters = global_ring
            .iter()
            .filter_map(|(token, host)| Some((host.datacenter.clone()?, (*token, host.clone()))))
            .into_group_map()
            .into_iter()
            .map(|(dc, members)| {
                let ring = TokenRing::new(members.into_iter());
                let unique_hosts = ring.iter().unique_by(|(_, h)| h.host_id).count();
                // Hosts without a rack count as one more rack.
                let rack_count = ring.iter().map(|(_, h)| h.rack.as_deref()).unique().count();
                (
                    dc,
                    DatacenterRing {
                        ring,
                        unique_hosts,
                        rack_count,
                    },
                )
            })
            .collect();

        Self {
            global_ring,
            unique_hosts,
            datacenters,
        }
    }

    pub(super) fn global_ring(&self) -> &TokenRing<Arc<HostInfo>> {
        &self.global_ring
    }

    pub(super) fn unique_hosts(&self) -> &[Arc<HostInfo>] {
        &self.unique_hosts
    }

    pub(super) fn simple_strategy_replicas(
        &self,
        token: Token,
        replication_factor: usize,
    ) -> impl Iterator<Item = &Arc<HostInfo>> {
        self.global_ring
            .ring_range(token)
            .unique_by(|host| host.host_id)
            .take(replication_factor.min(self.unique_hosts.len()))
    }

    /// Replicas in one datacenter: walk the datacenter ring, taking hosts
    /// from racks not used yet. Once every rack is used, the remaining
    /// replicas are taken in ring order regardless of rack.
    pub(super) fn nts_replicas_in_datacenter<'a>(
        &'a self,
        token: Token,
        datacenter: &str,
        replication_factor: usize,
    ) -> Vec<&'a Arc<HostInfo>> {
        let dc = self
            .datacenters
            .get(datacenter)
            .unwrap_or(&EMPTY_DATACENTER_RING);

        let wanted = replication_factor.min(dc.unique_hosts);
        let mut acceptable_repeats = replication_factor.saturating_sub(dc.rack_count);
        let mut used_racks: BTreeSet<Option<&str>> = BTreeSet::new();
        let mut replicas = Vec::with_capacity(wanted);

        for host in dc.ring.ring_range(token).unique_by(|host| host.host_id) {
            if replicas.len() == wanted {
                break;
            }
            if used_racks.insert(host.rack.as_deref()) {
                replicas.push(host);
            } else if acceptable_repeats > 0 {
                acceptable_repeats -= 1;
                replicas.push(host);
            }
        }
        replicas
    }
}
