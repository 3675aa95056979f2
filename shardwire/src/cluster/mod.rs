//! This module holds entities that represent the cluster as a whole,
//! nodes in the cluster (together with a pool of connections),
//! the cluster's state, and logic for ruling out specific nodes.
//!
//! This includes:
//! - node's representation ([HostInfo](host::HostInfo)),
//! - [registry of known hosts](registry::HostRegistry),
//! - [metadata representation, fetching and management](metadata),
//! - [cluster state snapshots](ClusterState) published by the cluster worker.

pub(crate) mod control_connection;
pub mod host;
pub mod metadata;
pub mod registry;
pub(crate) mod state;
pub(crate) mod worker;

pub use control_connection::KnownNode;
pub use state::ClusterState;
