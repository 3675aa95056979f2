use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::warn;

use super::{rotated, usable_hosts, LoadBalancingPolicy, Plan, RoutingInfo};
use crate::cluster::host::HostInfo;
use crate::cluster::ClusterState;

#[derive(Debug, Default)]
struct DcView {
    local: Arc<Vec<Arc<HostInfo>>>,
    remote: Arc<Vec<Arc<HostInfo>>>,
}

/// Round robin over the hosts of the local datacenter, followed by the
/// hosts of other datacenters, also rotated.
///
/// Remote hosts are skipped altogether when
/// [`include_remote_nodes`](Self::include_remote_nodes) is disabled, and
/// for requests with a datacenter-local consistency.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    include_remote_nodes: bool,
    view: ArcSwap<DcView>,
    cursor: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: impl Into<String>) -> Self {
        Self {
            local_dc: local_dc.into(),
            include_remote_nodes: true,
            view: ArcSwap::default(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Whether hosts outside the local datacenter end the plan.
    pub fn include_remote_nodes(mut self, include: bool) -> Self {
        self.include_remote_nodes = include;
        self
    }

    pub fn local_dc(&self) -> &str {
        &self.local_dc
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn plan<'a>(&'a self, routing_info: &RoutingInfo<'_>) -> Plan<'a> {
        let view = self.view.load_full();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        let local = rotated(view.local.clone(), start);
        if !self.include_remote_nodes || routing_info.consistency.is_dc_local() {
            return Box::new(local);
        }
        Box::new(local.chain(rotated(view.remote.clone(), start)))
    }

    fn on_topology_change(&self, cluster: &Arc<ClusterState>) {
        let (local, remote): (Vec<_>, Vec<_>) = usable_hosts(cluster)
            .into_iter()
            .partition(|host| host.datacenter.as_deref() == Some(self.local_dc.as_str()));
        if local.is_empty() && !remote.is_empty() {
            warn!(
                local_dc = self.local_dc.as_str(),
                "No usable hosts in the local datacenter"
            );
        }
        self.view.store(Arc::new(DcView {
            local: Arc::new(local),
            remote: Arc::new(remote),
        }));
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::host::tests::mock_host_info;
    use crate::cluster::state::tests::mock_cluster_state;
    use crate::policies::load_balancing::tests::ids;
    use crate::statement::Consistency;

    fn two_dc_state() -> Arc<ClusterState> {
        Arc::new(mock_cluster_state(
            vec![
                mock_host_info(1, "dc1", "r1", &[100]),
                mock_host_info(2, "dc2", "r1", &[200]),
                mock_host_info(3, "dc1", "r1", &[300]),
                mock_host_info(4, "dc2", "r1", &[400]),
            ],
            1,
        ))
    }

    fn quorum() -> RoutingInfo<'static> {
        RoutingInfo {
            consistency: Consistency::Quorum,
            ..Default::default()
        }
    }

    #[test]
    fn local_hosts_come_first() {
        let policy = DcAwareRoundRobinPolicy::new("dc1");
        policy.on_topology_change(&two_dc_state());

        for _ in 0..4 {
            let plan = ids(policy.plan(&quorum()));
            assert_eq!(plan.len(), 4);
            let (local, remote) = plan.split_at(2);
            assert!(local.iter().all(|id| [1, 3].contains(id)));
            assert!(remote.iter().all(|id| [2, 4].contains(id)));
        }
    }

    #[test]
    fn remote_hosts_can_be_excluded() {
        let policy = DcAwareRoundRobinPolicy::new("dc1").include_remote_nodes(false);
        policy.on_topology_change(&two_dc_state());
        assert_eq!(ids(policy.plan(&quorum())).len(), 2);

        let policy = DcAwareRoundRobinPolicy::new("dc1");
        policy.on_topology_change(&two_dc_state());
        let local_one = RoutingInfo {
            consistency: Consistency::LocalOne,
            ..Default::default()
        };
        assert_eq!(ids(policy.plan(&local_one)).len(), 2);
    }
}
