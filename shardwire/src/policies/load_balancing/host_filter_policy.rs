use std::sync::Arc;

use super::{LoadBalancingPolicy, Plan, RoutingInfo};
use crate::cluster::ClusterState;
use crate::policies::host_filter::HostFilter;

/// Wraps a policy so that hosts rejected by a [`HostFilter`] are neither
/// part of the wrapped policy's view nor of any plan.
pub struct HostFilterPolicy {
    child: Arc<dyn LoadBalancingPolicy>,
    filter: Arc<dyn HostFilter>,
}

impl std::fmt::Debug for HostFilterPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFilterPolicy")
            .field("child", &self.child)
            .finish_non_exhaustive()
    }
}

impl HostFilterPolicy {
    pub fn new(child: Arc<dyn LoadBalancingPolicy>, filter: Arc<dyn HostFilter>) -> Self {
        Self { child, filter }
    }
}

impl LoadBalancingPolicy for HostFilterPolicy {
    fn plan<'a>(&'a self, routing_info: &RoutingInfo<'_>) -> Plan<'a> {
        Box::new(
            self.child
                .plan(routing_info)
                .filter(|host| self.filter.accept(host)),
        )
    }

    fn on_topology_change(&self, cluster: &Arc<ClusterState>) {
        let retained = cluster.retain_hosts(|host| self.filter.accept(host));
        self.child.on_topology_change(&Arc::new(retained));
    }

    fn name(&self) -> String {
        format!("HostFilterPolicy{{child: {}}}", self.child.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::host::tests::mock_host_info;
    use crate::cluster::state::tests::mock_cluster_state;
    use crate::policies::host_filter::DcHostFilter;
    use crate::policies::load_balancing::tests::ids;
    use crate::policies::load_balancing::{RoundRobinPolicy, TokenAwarePolicy};
    use crate::routing::Token;

    #[test]
    fn rejected_hosts_never_appear() {
        let policy = HostFilterPolicy::new(
            Arc::new(TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new()))),
            Arc::new(DcHostFilter::new("dc1".to_owned())),
        );
        let state = mock_cluster_state(
            vec![
                mock_host_info(1, "dc1", "r1", &[100]),
                mock_host_info(2, "dc2", "r1", &[200]),
                mock_host_info(3, "dc1", "r1", &[300]),
            ],
            1,
        );
        policy.on_topology_change(&Arc::new(state));

        // Token 150 belongs to host 2 in the full ring, but host 2 is not
        // part of the filtered view; host 3 takes over.
        let info = RoutingInfo {
            token: Some(Token::new(150)),
            keyspace: Some("ks"),
            ..Default::default()
        };
        for _ in 0..3 {
            let plan = ids(policy.plan(&info));
            assert_eq!(plan, vec![3, 1]);
        }
        assert_eq!(
            ids(policy.plan(&RoutingInfo::default())).len(),
            2
        );
    }
}
