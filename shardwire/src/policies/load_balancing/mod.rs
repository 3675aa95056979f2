//! Load balancing policies decide which hosts a request goes to, and in
//! which order.
//!
//! A [`Session`](crate::client::session::Session) can use any type that
//! implements [`LoadBalancingPolicy`]. The built-in ones compose: a
//! [`TokenAwarePolicy`] puts replicas first and defers the remaining order
//! to a child, and a [`HostFilterPolicy`] removes hosts from whatever its
//! child produces.

use std::sync::Arc;

use crate::cluster::host::HostInfo;
use crate::cluster::ClusterState;
use crate::routing::Token;
use crate::statement::{Consistency, SerialConsistency};

mod dc_aware;
mod host_filter_policy;
mod round_robin;
mod token_aware;

pub use dc_aware::DcAwareRoundRobinPolicy;
pub use host_filter_policy::HostFilterPolicy;
pub use round_robin::RoundRobinPolicy;
pub use token_aware::TokenAwarePolicy;

/// What a policy may know about a request when planning it.
#[derive(Default, Clone, Debug)]
pub struct RoutingInfo<'a> {
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,

    /// Token of the partition the request targets, if known.
    pub token: Option<Token>,
    /// Keyspace whose replication strategy places the token.
    pub keyspace: Option<&'a str>,
}

/// Hosts to try for one request, most preferred first. Each host appears
/// at most once. Plans are computed lazily; usually only the first host
/// is ever needed.
pub type Plan<'a> = Box<dyn Iterator<Item = Arc<HostInfo>> + Send + Sync + 'a>;

/// Produces an ordered sequence of hosts for each request.
///
/// A policy keeps its own view of the cluster, derived from the
/// [`ClusterState`] passed to [`on_topology_change`](Self::on_topology_change).
/// The cluster worker calls it right after publishing every new state, and
/// once before the first request, so that a plan never names a host the
/// driver does not know. Host liveness is never tracked separately: plans
/// only contain hosts that were up and enabled in the last state seen.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Returns the hosts to contact for a request.
    fn plan<'a>(&'a self, routing_info: &RoutingInfo<'_>) -> Plan<'a>;

    /// Rebuilds the policy's view of the cluster.
    fn on_topology_change(&self, cluster: &Arc<ClusterState>);

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}

/// Hosts of a state that requests may be sent to, in the state's order.
pub(crate) fn usable_hosts(cluster: &ClusterState) -> Vec<Arc<HostInfo>> {
    cluster
        .get_nodes_info()
        .iter()
        .filter(|host| host.is_usable())
        .cloned()
        .collect()
}

/// Iterates `hosts` once, starting at `start` and wrapping around.
pub(crate) fn rotated(
    hosts: Arc<Vec<Arc<HostInfo>>>,
    start: usize,
) -> impl Iterator<Item = Arc<HostInfo>> + Send + Sync {
    let len = hosts.len();
    (0..len).map(move |i| hosts[(start + i) % len].clone())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::host::HostStatus;
    use crate::cluster::state::tests::mock_cluster_state;

    pub(crate) fn ids(plan: Plan<'_>) -> Vec<u128> {
        plan.map(|host| host.host_id.as_u128()).collect()
    }

    #[test]
    fn only_usable_hosts_are_planned() {
        use crate::cluster::host::tests::mock_host_info;

        let mut down = mock_host_info(2, "dc1", "r1", &[200]);
        down.status = HostStatus::Down;
        let mut disabled = mock_host_info(3, "dc1", "r1", &[300]);
        disabled.enabled = false;
        let state = Arc::new(mock_cluster_state(
            vec![mock_host_info(1, "dc1", "r1", &[100]), down, disabled],
            1,
        ));

        let hosts = usable_hosts(&state);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].host_id.as_u128(), 1);
    }

    #[test]
    fn rotation_visits_each_host_once() {
        use crate::cluster::host::tests::mock_host;

        let hosts = Arc::new(vec![
            mock_host(1, "dc1", "r1", &[]),
            mock_host(2, "dc1", "r1", &[]),
            mock_host(3, "dc1", "r1", &[]),
        ]);
        let ids: Vec<u128> = rotated(hosts, 4)
            .map(|host| host.host_id.as_u128())
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }
}
