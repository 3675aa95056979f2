//! This module holds entities that represent the whole configurable
//! driver session with the cluster.
//! The following abstractions are involved:
//! - [Session](session::Session) - the main entity of the driver. It:
//!   - contains and manages all driver configuration,
//!   - launches and communicates with the cluster worker, which keeps
//!     track of the nodes and of the connection pools to them,
//!   - enables executing CQL requests, taking all configuration into consideration.
//! - [SessionBuilder](session_builder::SessionBuilder) - just a convenient builder for a `Session`.
//! - [QueryPager](pager::QueryPager) - a stream over the rows of a paged query.

pub(crate) mod executor;
pub mod pager;
pub mod session;
pub mod session_builder;

#[cfg(test)]
mod session_test;

pub use crate::network::PoolSize;
