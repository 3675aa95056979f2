//! Async driver for token-partitioned database clusters speaking the CQL
//! binary protocol, with per-shard connection affinity for shard-per-core
//! servers.
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Session]\
//! `Session` is created by specifying a few known nodes and connecting to them:
//!
//! ```rust,no_run
//! use shardwire::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!    let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .known_node("1.2.3.4:9876")
//!         .build()
//!         .await?;
//!
//!    Ok(())
//! }
//! ```
//! From the known nodes the driver learns the whole cluster: every node,
//! its tokens, its datacenter and rack, and the replication of every
//! keyspace. It keeps one connection pool per node, and for sharded
//! servers one or more connections per shard.
//!
//! ### Making queries
//! * [Unpaged](crate::Session::query_unpaged): all rows in a single response
//! * [Single page](crate::Session::query_single_page): one page, resumable with a paging state
//! * [Paged](crate::Session::query_iter): a stream over rows of all pages
//! * [Batch](crate::Session::batch)
//!
//! Every request goes through the configured
//! [load balancing](crate::policies::load_balancing), [retry](crate::policies::retry)
//! and [speculative execution](crate::policies::speculative_execution) policies.

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;
pub(crate) mod utils;

#[cfg(test)]
pub(crate) use utils::test_utils;

pub use client::pager::QueryPager;
pub use client::session::{Session, SessionConfig};
pub use client::session_builder::SessionBuilder;
pub use statement::batch;
pub use statement::{Consistency, SerialConsistency, Statement};

/// Values bound to statements and values read from rows.
pub mod value {
    pub use shardwire_cql::frame::response::result::{ColumnSpec, Row};
    pub use shardwire_cql::value::{CqlValue, SerializedValues};
}
