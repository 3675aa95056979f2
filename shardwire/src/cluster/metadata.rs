//! Cluster metadata read from system tables: peers with their tokens, and
//! the replication strategy of each keyspace.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use rand::Rng as _;
use shardwire_cql::frame::response::result::{Row, Rows};
use shardwire_cql::value::CqlValue;
use thiserror::Error;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::errors::MetadataError;
use crate::network::Connection;
use crate::routing::partitioner::PartitionerName;
use crate::routing::Token;

const LOCAL_QUERY: &str = "SELECT host_id, rpc_address, data_center, rack, tokens, \
     schema_version, release_version, partitioner FROM system.local WHERE key='local'";
const PEERS_QUERY: &str = "SELECT host_id, rpc_address, data_center, rack, tokens, \
     schema_version, release_version FROM system.peers";
const KEYSPACES_QUERY: &str = "SELECT keyspace_name, replication FROM system_schema.keyspaces";

/// Describes all metadata retrieved from the cluster
#[derive(Debug, Clone)]
pub(crate) struct Metadata {
    pub(crate) peers: Vec<Peer>,
    pub(crate) keyspaces: HashMap<String, Keyspace>,
    pub(crate) partitioner: PartitionerName,
}

/// Address of a node as read from system tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeAddr {
    /// Address advertised by a peer; subject to address translation.
    Translatable(SocketAddr),
    /// The address the control connection is connected to; used as is.
    Untranslatable(SocketAddr),
}

impl NodeAddr {
    pub fn into_inner(self) -> SocketAddr {
        match self {
            NodeAddr::Translatable(addr) | NodeAddr::Untranslatable(addr) => addr,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.into_inner().ip()
    }
}

/// A node as described by `system.local` or `system.peers`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Peer {
    pub host_id: Uuid,
    pub address: NodeAddr,
    pub tokens: Vec<Token>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub schema_version: Option<Uuid>,
    pub release_version: Option<String>,
}

impl Peer {
    /// The advertised address with the connect port, before translation.
    pub fn untranslated_address(&self) -> SocketAddr {
        self.address.into_inner()
    }
}

/// Describes a keyspace in the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Keyspace {
    pub strategy: Strategy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
#[allow(clippy::enum_variant_names)]
pub enum Strategy {
    SimpleStrategy {
        replication_factor: usize,
    },
    NetworkTopologyStrategy {
        // Replication factors of datacenters with given names
        datacenter_repfactors: HashMap<String, usize>,
    },
    LocalStrategy, // replication_factor == 1
    Other {
        name: String,
        data: HashMap<String, String>,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum KeyspaceStrategyError {
    #[error("Keyspace strategy definition is missing a 'class' field")]
    MissingClassForStrategyDefinition,
    #[error("Missing replication factor field for SimpleStrategy")]
    MissingReplicationFactorForSimpleStrategy,
    #[error("Failed to parse a replication factor as unsigned integer: {0}")]
    ReplicationFactorParseError(std::num::ParseIntError),
    #[error("Unexpected NetworkTopologyStrategy option: '{key}': '{value}'")]
    UnexpectedNetworkTopologyStrategyOption { key: String, value: String },
}

#[derive(Clone, Copy)]
enum NodeInfoSource {
    Local,
    Peer,
}

impl NodeInfoSource {
    fn describe(&self) -> &'static str {
        match self {
            Self::Local => "local node",
            Self::Peer => "peer",
        }
    }
}

/// Positions of named columns in a result set. Columns the server did not
/// return read as null.
struct Columns<const N: usize> {
    indices: [Option<usize>; N],
}

impl<const N: usize> Columns<N> {
    fn new(rows: &Rows, names: [&str; N]) -> Self {
        Columns {
            indices: names.map(|name| rows.metadata.column_index(name)),
        }
    }

    fn take(&self, row: &mut Row, column: usize) -> Option<CqlValue> {
        let idx = self.indices[column]?;
        row.columns.get_mut(idx)?.take()
    }
}

/// Reads peers, keyspaces and the partitioner through a control connection.
///
/// `connect_port` is the port peers are reached on; system tables only
/// carry IP addresses.
pub(crate) async fn query_metadata(
    conn: &Connection,
    connect_port: u16,
) -> Result<Metadata, MetadataError> {
    let (peers, keyspaces) =
        tokio::try_join!(query_peers(conn, connect_port), query_keyspaces(conn))?;
    let (peers, partitioner) = peers;

    // There must be at least one peer
    if peers.is_empty() {
        return Err(MetadataError::NoRows {
            table: "system.local",
        });
    }

    Ok(Metadata {
        peers,
        keyspaces,
        partitioner,
    })
}

async fn query_peers(
    conn: &Connection,
    connect_port: u16,
) -> Result<(Vec<Peer>, PartitionerName), MetadataError> {
    let (local_rows, peers_rows) =
        tokio::try_join!(conn.query_rows(LOCAL_QUERY), conn.query_rows(PEERS_QUERY))?;

    let local_address = SocketAddr::new(conn.get_connect_address().ip(), connect_port);

    let local_columns = Columns::new(&local_rows, ["partitioner"]);
    let partitioner = local_rows
        .rows
        .first()
        .cloned()
        .and_then(|mut row| local_columns.take(&mut row, 0))
        .and_then(CqlValue::into_string)
        .map(|name| PartitionerName::from_class_name(&name))
        .unwrap_or_default();

    let mut peers = Vec::with_capacity(local_rows.rows.len() + peers_rows.rows.len());
    for (source, rows) in [
        (NodeInfoSource::Local, local_rows),
        (NodeInfoSource::Peer, peers_rows),
    ] {
        let columns = Columns::new(
            &rows,
            [
                "host_id",
                "rpc_address",
                "data_center",
                "rack",
                "tokens",
                "schema_version",
                "release_version",
            ],
        );
        for row in rows.rows {
            if let Some(peer) = create_peer_from_row(source, &columns, row, local_address) {
                peers.push(peer);
            }
        }
    }

    Ok((peers, partitioner))
}

fn create_peer_from_row(
    source: NodeInfoSource,
    columns: &Columns<7>,
    mut row: Row,
    local_address: SocketAddr,
) -> Option<Peer> {
    let host_id = columns.take(&mut row, 0).and_then(|v| v.as_uuid());
    let rpc_address = columns.take(&mut row, 1).and_then(|v| v.as_inet());
    let datacenter = columns.take(&mut row, 2).and_then(CqlValue::into_string);
    let rack = columns.take(&mut row, 3).and_then(CqlValue::into_string);
    let tokens = columns.take(&mut row, 4).and_then(CqlValue::into_vec);
    let schema_version = columns.take(&mut row, 5).and_then(|v| v.as_uuid());
    let release_version = columns.take(&mut row, 6).and_then(CqlValue::into_string);

    let Some(host_id) = host_id else {
        warn!(
            "{} (untranslated ip: {:?}, dc: {:?}, rack: {:?}) has Host ID set to null; skipping node.",
            source.describe(),
            rpc_address,
            datacenter,
            rack
        );
        return None;
    };

    let address = match source {
        // rpc_address in system.local can be wrong (e.g. 0.0.0.0), so the
        // address of the control connection is used instead.
        NodeInfoSource::Local => NodeAddr::Untranslatable(local_address),
        NodeInfoSource::Peer => match rpc_address {
            Some(ip) => NodeAddr::Translatable(SocketAddr::new(ip, local_address.port())),
            None => {
                warn!(
                    host_id = %host_id,
                    "Peer has no rpc_address; skipping node."
                );
                return None;
            }
        },
    };

    let tokens_str: Vec<String> = tokens
        .unwrap_or_default()
        .into_iter()
        .filter_map(CqlValue::into_string)
        .collect();

    // Parse string representation of tokens as integer values
    let tokens: Vec<Token> = match tokens_str
        .iter()
        .map(|s| Token::from_str(s))
        .collect::<Result<Vec<Token>, _>>()
    {
        Ok(parsed) => parsed,
        Err(e) => {
            trace!("Couldn't parse tokens as 64-bit integers: {}, proceeding with a dummy token. If you're using a partitioner with different token size, consider migrating to murmur3", e);
            vec![Token::new(rand::rng().random::<i64>())]
        }
    };

    Some(Peer {
        host_id,
        address,
        tokens,
        datacenter,
        rack,
        schema_version,
        release_version,
    })
}

async fn query_keyspaces(conn: &Connection) -> Result<HashMap<String, Keyspace>, MetadataError> {
    let rows = conn.query_rows(KEYSPACES_QUERY).await?;
    let columns = Columns::new(&rows, ["keyspace_name", "replication"]);

    let mut keyspaces = HashMap::with_capacity(rows.rows.len());
    for mut row in rows.rows {
        let Some(name) = columns.take(&mut row, 0).and_then(CqlValue::into_string) else {
            return Err(MetadataError::MalformedRow {
                table: "system_schema.keyspaces",
                reason: "keyspace_name is null".to_owned(),
            });
        };
        let replication: HashMap<String, String> = columns
            .take(&mut row, 1)
            .and_then(CqlValue::into_pair_vec)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| Some((k.into_string()?, v.into_string()?)))
            .collect();

        match strategy_from_string_map(replication) {
            Ok(strategy) => {
                keyspaces.insert(name, Keyspace { strategy });
            }
            Err(err) => {
                warn!(
                    keyspace = name.as_str(),
                    "Invalid replication strategy, skipping keyspace: {}", err
                );
            }
        }
    }

    Ok(keyspaces)
}

fn strategy_from_string_map(
    mut strategy_map: HashMap<String, String>,
) -> Result<Strategy, KeyspaceStrategyError> {
    let strategy_name: String = strategy_map
        .remove("class")
        .ok_or(KeyspaceStrategyError::MissingClassForStrategyDefinition)?;

    let strategy: Strategy = match strategy_name.as_str() {
        "org.apache.cassandra.locator.SimpleStrategy" | "SimpleStrategy" => {
            let rep_factor_str: String = strategy_map
                .remove("replication_factor")
                .ok_or(KeyspaceStrategyError::MissingReplicationFactorForSimpleStrategy)?;

            let replication_factor: usize = usize::from_str(&rep_factor_str)
                .map_err(KeyspaceStrategyError::ReplicationFactorParseError)?;

            Strategy::SimpleStrategy { replication_factor }
        }
        "org.apache.cassandra.locator.NetworkTopologyStrategy" | "NetworkTopologyStrategy" => {
            let mut datacenter_repfactors: HashMap<String, usize> =
                HashMap::with_capacity(strategy_map.len());

            for (key, value) in strategy_map.drain() {
                // Only 'class' and per-dc replication factors are expected.
                let rep_factor: usize = usize::from_str(&value).map_err(|_| {
                    KeyspaceStrategyError::UnexpectedNetworkTopologyStrategyOption {
                        key: key.clone(),
                        value,
                    }
                })?;

                datacenter_repfactors.insert(key, rep_factor);
            }

            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            }
        }
        "org.apache.cassandra.locator.LocalStrategy" | "LocalStrategy" => Strategy::LocalStrategy,
        _ => Strategy::Other {
            name: strategy_name,
            data: strategy_map,
        },
    };

    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_tracing;
    use assert_matches::assert_matches;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn strategies_are_parsed_from_replication_maps() {
        setup_tracing();
        assert_eq!(
            strategy_from_string_map(map(&[
                ("class", "org.apache.cassandra.locator.SimpleStrategy"),
                ("replication_factor", "3"),
            ])),
            Ok(Strategy::SimpleStrategy {
                replication_factor: 3
            })
        );

        assert_eq!(
            strategy_from_string_map(map(&[
                ("class", "NetworkTopologyStrategy"),
                ("dc1", "3"),
                ("dc2", "2"),
            ])),
            Ok(Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: [("dc1".to_owned(), 3), ("dc2".to_owned(), 2)]
                    .into_iter()
                    .collect()
            })
        );

        assert_eq!(
            strategy_from_string_map(map(&[("class", "org.apache.cassandra.locator.LocalStrategy")])),
            Ok(Strategy::LocalStrategy)
        );

        assert_matches!(
            strategy_from_string_map(map(&[("class", "EverywhereStrategy"), ("x", "y")])),
            Ok(Strategy::Other { name, data }) if name == "EverywhereStrategy" && data.len() == 1
        );
    }

    #[test]
    fn malformed_strategies_are_rejected() {
        setup_tracing();
        assert_eq!(
            strategy_from_string_map(map(&[("replication_factor", "3")])),
            Err(KeyspaceStrategyError::MissingClassForStrategyDefinition)
        );
        assert_eq!(
            strategy_from_string_map(map(&[("class", "SimpleStrategy")])),
            Err(KeyspaceStrategyError::MissingReplicationFactorForSimpleStrategy)
        );
        assert_matches!(
            strategy_from_string_map(map(&[
                ("class", "NetworkTopologyStrategy"),
                ("durable_writes", "yes"),
            ])),
            Err(KeyspaceStrategyError::UnexpectedNetworkTopologyStrategyOption { key, .. })
                if key == "durable_writes"
        );
    }
}
