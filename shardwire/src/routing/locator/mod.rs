//! Replica location: the token ring and the replica sets of tokens under
//! each replication strategy.

mod replication_info;

use std::collections::HashSet;
use std::sync::Arc;

use itertools::Itertools;
use smallvec::SmallVec;
use tracing::debug;
use uuid::Uuid;

use crate::cluster::host::HostInfo;
use crate::cluster::metadata::Strategy;
use crate::routing::Token;
use replication_info::ReplicationInfo;

/// Replicas of one token, ordered by their ring position starting at the
/// primary replica.
pub type ReplicaSet = SmallVec<[Arc<HostInfo>; 8]>;

/// A ring of elements sorted by token.
#[derive(Debug, Clone)]
pub struct TokenRing<ElemT> {
    ring: Vec<(Token, ElemT)>,
}

impl<ElemT> TokenRing<ElemT> {
    pub(crate) const fn new_empty() -> TokenRing<ElemT> {
        Self { ring: Vec::new() }
    }

    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, ElemT)>) -> TokenRing<ElemT> {
        let mut ring: Vec<(Token, ElemT)> = ring_iter.collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        TokenRing { ring }
    }

    /// Iterates over all members of the ring starting at the lowest token.
    pub fn iter(&self) -> impl Iterator<Item = &(Token, ElemT)> {
        self.ring.iter()
    }

    /// Members of the ring starting at the first one whose token is not
    /// lower than `token`, wrapping around once.
    pub fn ring_range_full(&self, token: Token) -> impl Iterator<Item = &(Token, ElemT)> {
        let start = self.ring.partition_point(|(t, _)| *t < token);
        self.ring[start..]
            .iter()
            .chain(self.ring[..start].iter())
    }

    /// Same as [`Self::ring_range_full`], without the tokens.
    pub fn ring_range(&self, token: Token) -> impl Iterator<Item = &ElemT> {
        self.ring_range_full(token).map(|(_t, e)| e)
    }

    /// The member owning `token`: the first one at or after it on the ring.
    pub fn get_elem_for_token(&self, token: Token) -> Option<&ElemT> {
        self.ring_range(token).next()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Computes replica sets of tokens for the hosts of one cluster snapshot.
#[derive(Debug, Clone)]
pub struct ReplicaLocator {
    replication_info: ReplicationInfo,
}

impl ReplicaLocator {
    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, Arc<HostInfo>)>) -> Self {
        Self {
            replication_info: ReplicationInfo::new(ring_iter),
        }
    }

    /// The global token ring.
    pub fn ring(&self) -> &TokenRing<Arc<HostInfo>> {
        self.replication_info.global_ring()
    }

    /// Each host owning at least one token, in ring order.
    pub fn unique_hosts_in_ring(&self) -> &[Arc<HostInfo>] {
        self.replication_info.unique_hosts()
    }

    /// Replicas of `token` under `strategy`, primary replica first, then in
    /// ring order.
    ///
    /// `LocalStrategy` and unknown strategies are treated as
    /// `SimpleStrategy` with replication factor 1.
    pub fn replicas_for_token(&self, token: Token, strategy: &Strategy) -> ReplicaSet {
        match strategy {
            Strategy::SimpleStrategy { replication_factor } => self
                .replication_info
                .simple_strategy_replicas(token, *replication_factor)
                .cloned()
                .collect(),
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            } => {
                let chosen: HashSet<Uuid> = datacenter_repfactors
                    .iter()
                    .flat_map(|(dc, rf)| {
                        self.replication_info
                            .nts_replicas_in_datacenter(token, dc, *rf)
                    })
                    .map(|host| host.host_id)
                    .collect();

                self.ring()
                    .ring_range(token)
                    .unique_by(|host| host.host_id)
                    .filter(|host| chosen.contains(&host.host_id))
                    .take(chosen.len())
                    .cloned()
                    .collect()
            }
            Strategy::LocalStrategy => self.replicas_for_token(
                token,
                &Strategy::SimpleStrategy {
                    replication_factor: 1,
                },
            ),
            Strategy::Other { name, .. } => {
                debug!(
                    strategy = name.as_str(),
                    "Unknown replication strategy, routing to the primary replica only"
                );
                self.replicas_for_token(
                    token,
                    &Strategy::SimpleStrategy {
                        replication_factor: 1,
                    },
                )
            }
        }
    }
}
