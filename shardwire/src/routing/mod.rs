//! Routing: everything needed to send a request to a node (and a shard)
//! that actually owns the data.
//!
//! This includes:
//! - token representation,
//! - shard computation from tokens and from source ports,
//! - the Murmur3 partitioner, computing tokens from partition keys,
//! - the token ring and replica computation per replication strategy.

pub mod locator;
pub mod partitioner;
mod sharding;

pub use sharding::{Shard, ShardCount, Sharder};
pub(crate) use sharding::{ShardInfo, ShardingError};

/// A partition token: the hash of a partition key, placing it on the ring.
///
/// `i64::MIN` is reserved by servers to mean "minus infinity", so it is
/// normalized to `i64::MAX` on construction.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Token {
    value: i64,
}

impl Token {
    #[inline]
    pub fn new(value: i64) -> Self {
        Self {
            value: if value == i64::MIN { i64::MAX } else { value },
        }
    }

    #[inline]
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl std::str::FromStr for Token {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Token, std::num::ParseIntError> {
        Ok(Token::new(s.parse()?))
    }
}
