use std::collections::HashMap;
use std::sync::Arc;

use shardwire_cql::value::SerializedValues;
use uuid::Uuid;

use super::host::HostInfo;
use super::metadata::{Keyspace, Strategy};
use super::registry::RegistrySnapshot;
use crate::routing::locator::{ReplicaLocator, ReplicaSet};
use crate::routing::partitioner::{
    calculate_token_for_partition_key, PartitionerName, TokenCalculationError,
};
use crate::routing::Token;

/// Represents the state of the cluster: known hosts, keyspaces and the
/// replica locator built from them.
///
/// It is immutable after creation, and is replaced atomically whenever the
/// host registry changes or metadata is refreshed.
/// Can be accessed through [Session::get_cluster_state()](crate::client::session::Session::get_cluster_state).
#[derive(Clone)]
pub struct ClusterState {
    /// Registry version this state was built from.
    pub(crate) version: u64,

    /// All hosts known to be part of the cluster, accessible by their host ID.
    pub(crate) known_hosts: HashMap<Uuid, Arc<HostInfo>>,

    /// Same hosts as `known_hosts`, in a stable order (by address).
    /// Hosts without tokens are here, but not in the locator.
    pub(crate) all_hosts: Vec<Arc<HostInfo>>,

    /// All keyspaces in the cluster, accessible by their name.
    pub(crate) keyspaces: HashMap<String, Keyspace>,

    pub(crate) partitioner: PartitionerName,

    pub(crate) locator: ReplicaLocator,
}

/// Enables printing [ClusterState] struct in a neat way, skipping the clutter involved by
/// the ring being large and keyspaces debug print being verbose.
impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct RingSizePrinter(usize);
        impl std::fmt::Debug for RingSizePrinter {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "<size={}>", self.0)
            }
        }

        f.debug_struct("ClusterState")
            .field("version", &self.version)
            .field("known_hosts", &self.all_hosts)
            .field("ring", &RingSizePrinter(self.locator.ring().len()))
            .field("keyspaces", &self.keyspaces.keys())
            .finish_non_exhaustive()
    }
}

impl ClusterState {
    /// Builds the state out of a registry snapshot and the last read schema.
    pub(crate) fn new(
        snapshot: &RegistrySnapshot,
        keyspaces: HashMap<String, Keyspace>,
        partitioner: PartitionerName,
    ) -> Self {
        Self::from_hosts(
            snapshot.version(),
            snapshot.hosts().clone(),
            keyspaces,
            partitioner,
        )
    }

    fn from_hosts(
        version: u64,
        known_hosts: HashMap<Uuid, Arc<HostInfo>>,
        keyspaces: HashMap<String, Keyspace>,
        partitioner: PartitionerName,
    ) -> Self {
        let mut all_hosts: Vec<Arc<HostInfo>> = known_hosts.values().cloned().collect();
        all_hosts.sort_by_key(|host| (host.address, host.host_id));

        let ring = all_hosts
            .iter()
            .flat_map(|host| host.tokens.iter().map(move |token| (*token, host.clone())));
        let locator = ReplicaLocator::new(ring);

        ClusterState {
            version,
            known_hosts,
            all_hosts,
            keyspaces,
            partitioner,
            locator,
        }
    }

    /// A state with only the hosts satisfying `predicate`. The locator is
    /// rebuilt, so replicas are computed among the remaining hosts only.
    pub(crate) fn retain_hosts(&self, predicate: impl Fn(&HostInfo) -> bool) -> ClusterState {
        let known_hosts = self
            .known_hosts
            .iter()
            .filter(|(_, host)| predicate(host))
            .map(|(id, host)| (*id, host.clone()))
            .collect();
        Self::from_hosts(
            self.version,
            known_hosts,
            self.keyspaces.clone(),
            self.partitioner.clone(),
        )
    }

    /// Registry version this state was built from.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Access keyspace details collected by the driver.
    pub fn get_keyspace(&self, keyspace: impl AsRef<str>) -> Option<&Keyspace> {
        self.keyspaces.get(keyspace.as_ref())
    }

    /// Returns an iterator over keyspaces.
    pub fn keyspaces_iter(&self) -> impl Iterator<Item = (&str, &Keyspace)> {
        self.keyspaces.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Access details about hosts known to the driver
    pub fn get_nodes_info(&self) -> &[Arc<HostInfo>] {
        &self.all_hosts
    }

    pub fn get_host(&self, host_id: &Uuid) -> Option<&Arc<HostInfo>> {
        self.known_hosts.get(host_id)
    }

    /// Name of the partitioner, as reported by `system.local`.
    pub fn partitioner(&self) -> &PartitionerName {
        &self.partitioner
    }

    /// Compute the token of a partition key.
    ///
    /// `partition_key` holds the serialized values of all partition key
    /// columns, in the order of the table definition.
    pub fn compute_token(
        &self,
        partition_key: &SerializedValues,
    ) -> Result<Token, TokenCalculationError> {
        calculate_token_for_partition_key(partition_key, &self.partitioner)
    }

    /// Replicas owning a given token in a keyspace, primary replica first.
    /// An unknown keyspace is routed to the primary replica only.
    pub fn get_token_endpoints(&self, keyspace: &str, token: Token) -> ReplicaSet {
        let strategy = self
            .keyspaces
            .get(keyspace)
            .map(|k| &k.strategy)
            .unwrap_or(&Strategy::LocalStrategy);
        self.locator.replicas_for_token(token, strategy)
    }

    /// Access replica location info
    pub fn replica_locator(&self) -> &ReplicaLocator {
        &self.locator
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::host::tests::mock_host_info;
    use crate::cluster::registry::HostRegistry;

    /// A cluster state over `hosts`, with one keyspace `ks` replicated
    /// with SimpleStrategy(rf).
    pub(crate) fn mock_cluster_state(hosts: Vec<HostInfo>, rf: usize) -> ClusterState {
        let registry = HostRegistry::new();
        for host in hosts {
            registry.add_or_update(host);
        }
        let keyspaces = [(
            "ks".to_owned(),
            Keyspace {
                strategy: Strategy::SimpleStrategy {
                    replication_factor: rf,
                },
            },
        )]
        .into_iter()
        .collect();
        ClusterState::new(&registry.snapshot(), keyspaces, PartitionerName::Murmur3)
    }

    #[test]
    fn token_endpoints_follow_keyspace_strategy() {
        let state = mock_cluster_state(
            vec![
                mock_host_info(1, "dc1", "r1", &[100]),
                mock_host_info(2, "dc1", "r1", &[200]),
                mock_host_info(3, "dc1", "r1", &[300]),
            ],
            2,
        );

        let ids = |set: ReplicaSet| set.iter().map(|h| h.host_id.as_u128()).collect::<Vec<_>>();
        assert_eq!(ids(state.get_token_endpoints("ks", Token::new(150))), vec![2, 3]);
        assert_eq!(ids(state.get_token_endpoints("ks", Token::new(301))), vec![1, 2]);
        // Unknown keyspace: primary replica only.
        assert_eq!(ids(state.get_token_endpoints("other", Token::new(150))), vec![2]);
    }

    #[test]
    fn retained_state_drops_hosts_from_ring() {
        let state = mock_cluster_state(
            vec![
                mock_host_info(1, "dc1", "r1", &[100]),
                mock_host_info(2, "dc2", "r1", &[200]),
            ],
            1,
        );
        let dc1 = state.retain_hosts(|h| h.datacenter.as_deref() == Some("dc1"));
        assert_eq!(dc1.get_nodes_info().len(), 1);
        assert_eq!(dc1.replica_locator().ring().len(), 1);
        assert_eq!(
            dc1.get_token_endpoints("ks", Token::new(150))[0].host_id.as_u128(),
            1
        );
        assert_eq!(dc1.version(), state.version());
    }
}
