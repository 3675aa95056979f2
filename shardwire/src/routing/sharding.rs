use std::collections::HashMap;
use std::num::NonZeroU16;

use rand::Rng as _;
use shardwire_cql::frame::request::options;
use thiserror::Error;

use super::Token;

pub type Shard = u32;
pub type ShardCount = NonZeroU16;

/// Lowest port of the ephemeral range used when drawing shard-targeted source ports.
const MIN_SOURCE_PORT: u16 = 49152;
const MAX_SOURCE_PORT: u16 = 65535;

/// Sharding parameters a node reports in SUPPORTED, together with the shard
/// that serves the connection they were reported on.
#[derive(PartialEq, Eq, Clone, Debug)]
pub(crate) struct ShardInfo {
    pub(crate) shard: u16,
    pub(crate) nr_shards: ShardCount,
    pub(crate) msb_ignore: u8,
}

/// Maps tokens and source ports to shards of one node.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Sharder {
    pub nr_shards: ShardCount,
    pub msb_ignore: u8,
}

impl ShardInfo {
    pub(crate) fn get_sharder(&self) -> Sharder {
        Sharder::new(self.nr_shards, self.msb_ignore)
    }
}

impl Sharder {
    pub fn new(nr_shards: ShardCount, msb_ignore: u8) -> Self {
        Sharder {
            nr_shards,
            msb_ignore,
        }
    }

    pub fn shard_of(&self, token: Token) -> Shard {
        let mut biased_token = (token.value() as u64).wrapping_add(1u64 << 63);
        biased_token <<= self.msb_ignore;
        (((biased_token as u128) * (self.nr_shards.get() as u128)) >> 64) as Shard
    }

    /// Shard the server assigns to a connection made to its shard-aware port
    /// from the given source port.
    pub fn shard_of_source_port(&self, source_port: u16) -> Shard {
        (source_port % self.nr_shards.get()) as Shard
    }

    fn first_source_port_for_shard(&self, shard: Shard) -> u16 {
        let n = self.nr_shards.get();
        (MIN_SOURCE_PORT + n - 1) / n * n + shard as u16
    }

    /// Source ports `p` with `shard_of_source_port(p) == shard`, starting at a
    /// random one and wrapping around once. Each port is yielded once.
    ///
    /// Yields nothing if `shard` is out of range for this sharder.
    pub fn iter_source_ports_for_shard(&self, shard: Shard) -> impl Iterator<Item = u16> {
        let n = self.nr_shards.get();
        let valid = shard < n as Shard;
        let first = self.first_source_port_for_shard(shard.min(n as Shard - 1));

        let slots = (MAX_SOURCE_PORT - first) / n + 1;
        let start = first + rand::rng().random_range(0..slots) * n;

        let before_wrap = (start..=MAX_SOURCE_PORT).step_by(n.into());
        let after_wrap = (first..start).step_by(n.into());

        before_wrap.chain(after_wrap).filter(move |_| valid)
    }
}

#[derive(Clone, Error, Debug)]
pub(crate) enum ShardingError {
    #[error("No sharding information in SUPPORTED options")]
    NoShardInfo,
    #[error("Sharding option {0} present, but empty")]
    EmptyOption(&'static str),
    #[error("Sharding information reports zero shards")]
    ZeroShards,
    #[error("Failed to parse sharding option: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),
}

fn first_value<'a>(
    options: &'a HashMap<String, Vec<String>>,
    key: &'static str,
) -> Result<&'a str, ShardingError> {
    options
        .get(key)
        .ok_or(ShardingError::NoShardInfo)?
        .first()
        .map(String::as_str)
        .ok_or(ShardingError::EmptyOption(key))
}

impl TryFrom<&HashMap<String, Vec<String>>> for ShardInfo {
    type Error = ShardingError;

    fn try_from(options: &HashMap<String, Vec<String>>) -> Result<Self, Self::Error> {
        let shard = first_value(options, options::SCYLLA_SHARD)?.parse::<u16>()?;
        let nr_shards = first_value(options, options::SCYLLA_NR_SHARDS)?.parse::<u16>()?;
        let nr_shards = ShardCount::new(nr_shards).ok_or(ShardingError::ZeroShards)?;
        let msb_ignore = match options.get(options::SCYLLA_SHARDING_IGNORE_MSB) {
            Some(values) => values
                .first()
                .ok_or(ShardingError::EmptyOption(
                    options::SCYLLA_SHARDING_IGNORE_MSB,
                ))?
                .parse::<u8>()?,
            None => 0,
        };
        Ok(ShardInfo {
            shard,
            nr_shards,
            msb_ignore,
        })
    }
}
