use std::sync::Arc;

use arc_swap::ArcSwapOption;
use uuid::Uuid;

use super::{LoadBalancingPolicy, Plan, RoutingInfo};
use crate::cluster::ClusterState;

/// Sends requests to the replicas of their token first, in ring order
/// starting from the primary replica, then to the remaining hosts in the
/// order of the wrapped policy.
///
/// Requests without a token are planned by the wrapped policy alone. The
/// keyspace of the request picks the replication strategy; without one,
/// only the primary replica is preferred.
#[derive(Debug)]
pub struct TokenAwarePolicy {
    child: Arc<dyn LoadBalancingPolicy>,
    cluster: ArcSwapOption<ClusterState>,
}

impl TokenAwarePolicy {
    pub fn new(child: Arc<dyn LoadBalancingPolicy>) -> Self {
        Self {
            child,
            cluster: ArcSwapOption::empty(),
        }
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn plan<'a>(&'a self, routing_info: &RoutingInfo<'_>) -> Plan<'a> {
        let cluster = self.cluster.load_full();
        let (Some(token), Some(cluster)) = (routing_info.token, cluster) else {
            return self.child.plan(routing_info);
        };

        let replicas: Vec<_> = cluster
            .get_token_endpoints(routing_info.keyspace.unwrap_or_default(), token)
            .into_iter()
            .filter(|host| host.is_usable())
            .collect();
        let replica_ids: Vec<Uuid> = replicas.iter().map(|host| host.host_id).collect();

        let rest = self
            .child
            .plan(routing_info)
            .filter(move |host| !replica_ids.contains(&host.host_id));
        Box::new(replicas.into_iter().chain(rest))
    }

    fn on_topology_change(&self, cluster: &Arc<ClusterState>) {
        self.cluster.store(Some(cluster.clone()));
        self.child.on_topology_change(cluster);
    }

    fn name(&self) -> String {
        format!("TokenAwarePolicy{{child: {}}}", self.child.name())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::cluster::host::tests::mock_host_info;
    use crate::cluster::host::HostStatus;
    use crate::cluster::state::tests::mock_cluster_state;
    use crate::policies::load_balancing::tests::ids;
    use crate::policies::load_balancing::RoundRobinPolicy;
    use crate::routing::Token;

    fn five_hosts(down: Option<u128>) -> Arc<ClusterState> {
        let hosts = (1..=5)
            .map(|id| {
                let mut host = mock_host_info(id, "dc1", "r1", &[id as i64 * 100]);
                if Some(id) == down {
                    host.status = HostStatus::Down;
                }
                host
            })
            .collect();
        Arc::new(mock_cluster_state(hosts, 3))
    }

    fn routed(token: i64) -> RoutingInfo<'static> {
        RoutingInfo {
            token: Some(Token::new(token)),
            keyspace: Some("ks"),
            ..Default::default()
        }
    }

    #[test]
    fn replicas_first_then_child_order() {
        let policy = TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new()));
        policy.on_topology_change(&five_hosts(None));

        for _ in 0..5 {
            let plan = ids(policy.plan(&routed(150)));
            assert_eq!(plan[..3], [2, 3, 4]);
            assert_eq!(plan[3..].iter().collect::<HashSet<_>>(), [1, 5].iter().collect());
        }

        // The ring wraps around.
        let plan = ids(policy.plan(&routed(450)));
        assert_eq!(plan[..3], [5, 1, 2]);
    }

    #[test]
    fn down_replicas_are_skipped() {
        let policy = TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new()));
        policy.on_topology_change(&five_hosts(Some(3)));

        let plan = ids(policy.plan(&routed(150)));
        assert_eq!(plan[..2], [2, 4]);
        assert_eq!(plan.len(), 4);
        assert!(!plan.contains(&3));
    }

    #[test]
    fn without_token_the_child_decides() {
        let policy = TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new()));
        policy.on_topology_change(&five_hosts(None));
        assert_eq!(ids(policy.plan(&RoutingInfo::default())).len(), 5);

        // No keyspace: the primary replica only.
        let no_keyspace = RoutingInfo {
            token: Some(Token::new(150)),
            ..Default::default()
        };
        let plan = ids(policy.plan(&no_keyspace));
        assert_eq!(plan[0], 2);
        assert_eq!(plan.len(), 5);
    }
}
