use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr as _;

use async_trait::async_trait;

use crate::cluster::metadata::Peer;
use crate::errors::TranslationError;

/// Translates the addresses nodes advertise into addresses the driver can
/// reach, for example when nodes sit behind NAT.
///
/// Only addresses learned from the cluster are translated. Contact points
/// given to the session builder are used as they are.
#[async_trait]
pub trait AddressTranslator: Send + Sync {
    async fn translate_address(&self, peer: &Peer) -> Result<SocketAddr, TranslationError>;
}

#[async_trait]
impl AddressTranslator for HashMap<SocketAddr, SocketAddr> {
    async fn translate_address(&self, peer: &Peer) -> Result<SocketAddr, TranslationError> {
        self.get(&peer.untranslated_address())
            .copied()
            .ok_or(TranslationError::NoRuleForAddress(peer.untranslated_address()))
    }
}

#[async_trait]
impl AddressTranslator for HashMap<&'static str, &'static str> {
    async fn translate_address(&self, peer: &Peer) -> Result<SocketAddr, TranslationError> {
        let untranslated = peer.untranslated_address();
        let rule = self
            .iter()
            .find(|(rule_addr, _)| SocketAddr::from_str(rule_addr).ok() == Some(untranslated));
        match rule {
            Some((_, translated)) => SocketAddr::from_str(translated)
                .map_err(|_| TranslationError::InvalidAddressInRule((*translated).to_owned())),
            None => Err(TranslationError::NoRuleForAddress(untranslated)),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use uuid::Uuid;

    use super::*;
    use crate::cluster::metadata::NodeAddr;

    fn peer(addr: &str) -> Peer {
        Peer {
            host_id: Uuid::from_u128(1),
            address: NodeAddr::Translatable(addr.parse().unwrap()),
            tokens: vec![],
            datacenter: None,
            rack: None,
            schema_version: None,
            release_version: None,
        }
    }

    #[tokio::test]
    async fn map_translators() {
        let rules: HashMap<SocketAddr, SocketAddr> =
            [("10.0.0.1:9042".parse().unwrap(), "1.2.3.4:19042".parse().unwrap())].into();
        assert_eq!(
            rules.translate_address(&peer("10.0.0.1:9042")).await,
            Ok("1.2.3.4:19042".parse().unwrap())
        );
        assert_matches!(
            rules.translate_address(&peer("10.0.0.2:9042")).await,
            Err(TranslationError::NoRuleForAddress(_))
        );

        let str_rules: HashMap<&'static str, &'static str> =
            [("10.0.0.1:9042", "not an address")].into();
        assert_matches!(
            str_rules.translate_address(&peer("10.0.0.1:9042")).await,
            Err(TranslationError::InvalidAddressInRule(_))
        );
    }
}
