//! Specially treated single connection used to fetch metadata
//! and receive events from the cluster.

use std::net::SocketAddr;
use std::time::Duration;

use itertools::Itertools;
use rand::Rng;
use tokio::net::{lookup_host, ToSocketAddrs};
use tracing::{debug, warn};

use super::metadata::{query_metadata, Metadata};
use crate::errors::{BrokenConnectionErrorKind, ConnectionError, MetadataError};
use crate::network::connection::{open_connection, ErrorReceiver};
use crate::network::{Connection, ConnectionConfig};

/// Port assumed for hostnames given without one.
const DEFAULT_PORT: u16 = 9042;

/// Describes a database server known on `Session` startup.
///
/// The name derives from SessionBuilder's `known_node()` family of methods.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by its hostname, with or without a port.
    Hostname(String),
    /// A node identified by its IP address + a port.
    Address(SocketAddr),
}

async fn lookup_first(host: impl ToSocketAddrs) -> std::io::Result<Option<SocketAddr>> {
    // IPv4 addresses are preferred, if there are any.
    Ok(lookup_host(host)
        .await?
        .find_or_last(|addr| matches!(addr, SocketAddr::V4(_))))
}

async fn resolve_hostname(hostname: &str) -> std::io::Result<Option<SocketAddr>> {
    match lookup_first(hostname).await {
        Ok(addr) => Ok(addr),
        // No port in the string; retry with the default one, but report
        // the original error if that fails too.
        Err(err) => lookup_first((hostname, DEFAULT_PORT)).await.or(Err(err)),
    }
}

/// Resolves the initial contact points. Returns the resolved addresses and
/// all hostnames that had to be resolved, for error reporting.
pub(crate) async fn resolve_contact_points(
    known_nodes: &[KnownNode],
) -> (Vec<SocketAddr>, Vec<String>) {
    let mut addresses = Vec::with_capacity(known_nodes.len());
    let mut hostnames = Vec::new();

    for node in known_nodes {
        match node {
            KnownNode::Address(address) => addresses.push(*address),
            KnownNode::Hostname(hostname) => hostnames.push(hostname.clone()),
        }
    }

    let resolved = futures::future::join_all(hostnames.iter().map(|hostname| async move {
        match resolve_hostname(hostname).await {
            Ok(Some(addr)) => Some(addr),
            Ok(None) => {
                warn!("Empty address list returned by DNS for {}", hostname);
                None
            }
            Err(e) => {
                warn!("Hostname resolution failed for {}: {}", hostname, e);
                None
            }
        }
    }))
    .await;
    addresses.extend(resolved.into_iter().flatten());
    let addresses = addresses.into_iter().unique().collect();

    (addresses, hostnames)
}

/// The single connection used to fetch metadata and receive events from the cluster.
///
/// Events are delivered through the `event_sender` of the configuration it
/// was opened with.
pub(super) struct ControlConnection {
    conn: Connection,
    error_receiver: Option<ErrorReceiver>,
}

impl ControlConnection {
    /// Connects, performs the handshake and registers for events.
    pub(super) async fn open(
        addr: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        debug_assert!(config.event_sender.is_some());
        let (conn, error_receiver) = open_connection(addr, None, config).await?;
        debug!(node = %addr, "Control connection established");
        Ok(Self {
            conn,
            error_receiver: Some(error_receiver),
        })
    }

    pub(super) fn get_connect_address(&self) -> SocketAddr {
        self.conn.get_connect_address()
    }

    pub(super) async fn query_metadata(&self) -> Result<Metadata, MetadataError> {
        query_metadata(&self.conn, self.get_connect_address().port()).await
    }

    /// Resolves once the connection breaks. Never resolves again after that.
    /// Cancel safe: the receiver is only consumed once it has resolved.
    pub(super) async fn broken(&mut self) -> ConnectionError {
        let Some(receiver) = self.error_receiver.as_mut() else {
            return std::future::pending().await;
        };
        let error = receiver.await.unwrap_or_else(|_| {
            ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
        });
        self.error_receiver = None;
        error
    }
}

/// Delays between attempts to re-establish the control connection:
/// exponential, capped, with jitter.
#[derive(Debug, Clone)]
pub(crate) struct ReconnectBackoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl ReconnectBackoff {
    /// Relative spread of each delay around the nominal value.
    const JITTER: f64 = 0.2;

    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: None,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let nominal = match self.current {
            None => self.min,
            Some(prev) => prev.saturating_mul(2).min(self.max),
        };
        self.current = Some(nominal);

        let factor = rand::rng().random_range((1.0 - Self::JITTER)..=(1.0 + Self::JITTER));
        nominal.mul_f64(factor).min(self.max)
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let mut backoff = ReconnectBackoff::default();
        let mut nominal = Duration::from_millis(100);
        for _ in 0..12 {
            let delay = backoff.next_delay();
            assert!(delay >= nominal.mul_f64(0.79), "{delay:?} < {nominal:?}");
            assert!(delay <= nominal.mul_f64(1.21).min(Duration::from_secs(10)));
            nominal = (nominal * 2).min(Duration::from_secs(10));
        }

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(121));
    }

    #[tokio::test]
    async fn addresses_need_no_resolution() {
        let addr: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let (resolved, hostnames) = resolve_contact_points(&[
            KnownNode::Address(addr),
            KnownNode::Hostname("127.0.0.2:19042".to_owned()),
            KnownNode::Hostname("127.0.0.3".to_owned()),
        ])
        .await;
        assert_eq!(
            resolved,
            vec![
                addr,
                "127.0.0.2:19042".parse().unwrap(),
                "127.0.0.3:9042".parse().unwrap()
            ]
        );
        assert_eq!(hostnames.len(), 2);
    }

    #[tokio::test]
    async fn repeated_contact_points_are_kept_once() {
        let first: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let second: SocketAddr = "127.0.0.2:9042".parse().unwrap();
        let (resolved, _) = resolve_contact_points(&[
            KnownNode::Address(first),
            KnownNode::Address(second),
            KnownNode::Address(first),
            KnownNode::Hostname("127.0.0.2".to_owned()),
            KnownNode::Hostname("127.0.0.1:9042".to_owned()),
        ])
        .await;
        assert_eq!(resolved, vec![first, second]);
    }
}
