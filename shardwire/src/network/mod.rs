//! Connections to nodes: a single multiplexed connection, the per-node
//! pool of them, and the manager owning one pool per usable node.

pub(crate) mod connection;
pub(crate) mod connection_pool;
pub(crate) mod pool_manager;

pub(crate) use connection::{Connection, ConnectionConfig, VerifiedKeyspaceName};
pub use connection_pool::PoolSize;
pub(crate) use connection_pool::{NodeConnectionPool, PoolConfig, PoolEvent};
pub(crate) use pool_manager::PoolManager;
