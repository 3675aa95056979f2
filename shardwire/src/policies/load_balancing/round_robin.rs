use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::{rotated, usable_hosts, LoadBalancingPolicy, Plan, RoutingInfo};
use crate::cluster::host::HostInfo;
use crate::cluster::ClusterState;

/// Cycles through all usable hosts. Every plan contains each host once,
/// and consecutive plans start at consecutive hosts.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    hosts: ArcSwap<Vec<Arc<HostInfo>>>,
    cursor: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn plan<'a>(&'a self, _routing_info: &RoutingInfo<'_>) -> Plan<'a> {
        let hosts = self.hosts.load_full();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        Box::new(rotated(hosts, start))
    }

    fn on_topology_change(&self, cluster: &Arc<ClusterState>) {
        self.hosts.store(Arc::new(usable_hosts(cluster)));
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::cluster::host::tests::mock_host_info;
    use crate::cluster::state::tests::mock_cluster_state;
    use crate::policies::load_balancing::tests::ids;

    #[test]
    fn each_host_once_per_cycle() {
        let policy = RoundRobinPolicy::new();
        let state = mock_cluster_state(
            (1..=4)
                .map(|id| mock_host_info(id, "dc1", "r1", &[id as i64 * 100]))
                .collect(),
            1,
        );
        policy.on_topology_change(&Arc::new(state));

        let info = RoutingInfo::default();
        let firsts: Vec<u128> = (0..4)
            .map(|_| ids(policy.plan(&info))[0])
            .collect();
        assert_eq!(firsts.iter().collect::<HashSet<_>>().len(), 4);

        for _ in 0..8 {
            let plan = ids(policy.plan(&info));
            assert_eq!(plan.len(), 4);
            assert_eq!(plan.iter().collect::<HashSet<_>>().len(), 4);
        }
    }

    #[test]
    fn empty_before_first_topology() {
        let policy = RoundRobinPolicy::new();
        assert!(ids(policy.plan(&RoutingInfo::default())).is_empty());
    }
}
