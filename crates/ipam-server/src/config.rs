//! Environment configuration.

use crate::error::ServerError;
use ipam::allocator::quorum_for;
use ipam::{AllocatorConfig, Cidr, PeerName};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_UNIVERSE: &str = "10.32.0.0/12";
const DEFAULT_DB_DIR: &str = "/var/lib/ipam";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:6784";
const DEFAULT_GOSSIP_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub peer_name: PeerName,
    pub nickname: String,
    pub universe: Cidr,
    pub default_subnet: Cidr,
    pub seed: Vec<PeerName>,
    pub consensus_peers: usize,
    pub observer: bool,
    /// Gossip endpoints of the other peers, by name.
    pub peers: BTreeMap<PeerName, String>,
    pub db_dir: PathBuf,
    pub listen_addr: SocketAddr,
    pub gossip_interval: Duration,
}

impl ServerConfig {
    /// Reads the `IPAM_*` environment variables.
    ///
    /// # Errors
    ///
    /// `Configuration` for missing or malformed values.
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    ///
    /// # Errors
    ///
    /// `Configuration` for missing or malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let peer_name = get("IPAM_PEER_NAME")
            .map(PeerName::new)
            .ok_or_else(|| ServerError::Configuration("IPAM_PEER_NAME environment variable is required".to_string()))?;
        let nickname = get("IPAM_NICKNAME").unwrap_or_else(|| peer_name.to_string());

        let universe = parse_subnet("IPAM_UNIVERSE", &get("IPAM_UNIVERSE").unwrap_or_else(|| DEFAULT_UNIVERSE.to_string()))?;
        let default_subnet = match get("IPAM_DEFAULT_SUBNET") {
            Some(text) => parse_subnet("IPAM_DEFAULT_SUBNET", &text)?,
            None => universe,
        };
        if universe.family != default_subnet.family || !universe.range().contains_range(&default_subnet.range()) {
            return Err(ServerError::Configuration(format!(
                "IPAM_DEFAULT_SUBNET {default_subnet} is not inside IPAM_UNIVERSE {universe}"
            )));
        }

        let seed = get("IPAM_SEED")
            .map(|s| split_list(&s).map(PeerName::new).collect())
            .unwrap_or_default();
        let consensus_peers = match get("IPAM_CONSENSUS_PEERS") {
            Some(n) => n
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ServerError::Configuration(format!("IPAM_CONSENSUS_PEERS must be a positive integer, got {n:?}")))?,
            None => 1,
        };
        let observer = get("IPAM_OBSERVER").is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let mut peers = BTreeMap::new();
        if let Some(list) = get("IPAM_PEERS") {
            for pair in split_list(&list) {
                let (name, url) = pair.split_once('=').ok_or_else(|| {
                    ServerError::Configuration(format!("IPAM_PEERS entry {pair:?} is not name=url"))
                })?;
                peers.insert(PeerName::new(name.trim()), url.trim().trim_end_matches('/').to_string());
            }
        }
        peers.remove(&peer_name);

        let listen_addr = get("IPAM_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .map_err(|e| ServerError::Configuration(format!("IPAM_LISTEN_ADDR: {e}")))?;
        let gossip_interval = match get("IPAM_GOSSIP_INTERVAL_SECS") {
            Some(secs) => secs
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| {
                    ServerError::Configuration(format!("IPAM_GOSSIP_INTERVAL_SECS must be a positive integer, got {secs:?}"))
                })?,
            None => DEFAULT_GOSSIP_INTERVAL_SECS,
        };

        Ok(Self {
            peer_name,
            nickname,
            universe,
            default_subnet,
            seed,
            consensus_peers,
            observer,
            peers,
            db_dir: get("IPAM_DB_DIR").map_or_else(|| PathBuf::from(DEFAULT_DB_DIR), PathBuf::from),
            listen_addr,
            gossip_interval: Duration::from_secs(gossip_interval),
        })
    }

    #[must_use]
    pub fn allocator_config(&self) -> AllocatorConfig {
        let mut config = AllocatorConfig::new(self.peer_name.clone(), self.universe);
        config.our_nickname.clone_from(&self.nickname);
        config.seed.clone_from(&self.seed);
        config.quorum = quorum_for(self.consensus_peers);
        config.is_observer = self.observer;
        config
    }
}

fn parse_subnet(key: &str, text: &str) -> Result<Cidr, ServerError> {
    Cidr::parse_subnet(text).map_err(|e| ServerError::Configuration(format!("{key}: {e}")))
}

fn split_list(text: &str) -> impl Iterator<Item = &str> {
    text.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[("IPAM_PEER_NAME", "peer-a")])).expect("config");
        assert_eq!(config.universe.to_string(), "10.32.0.0/12");
        assert_eq!(config.default_subnet, config.universe);
        assert_eq!(config.nickname, "peer-a");
        assert_eq!(config.consensus_peers, 1);
        assert_eq!(config.listen_addr.port(), 6784);
        assert_eq!(config.gossip_interval, Duration::from_secs(30));
        assert!(!config.observer);
        assert_eq!(config.allocator_config().quorum, 1);
    }

    #[test]
    fn test_full_configuration() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("IPAM_PEER_NAME", "a"),
            ("IPAM_NICKNAME", "host-a"),
            ("IPAM_UNIVERSE", "10.0.0.0/16"),
            ("IPAM_DEFAULT_SUBNET", "10.0.4.0/22"),
            ("IPAM_SEED", "a, b ,c"),
            ("IPAM_CONSENSUS_PEERS", "3"),
            ("IPAM_OBSERVER", "TRUE"),
            ("IPAM_PEERS", "a=http://a:6784,b=http://b:6784/, c=http://c:6784"),
            ("IPAM_DB_DIR", "/tmp/ipam"),
            ("IPAM_GOSSIP_INTERVAL_SECS", "5"),
        ]))
        .expect("config");

        assert_eq!(config.seed, vec![PeerName::from("a"), PeerName::from("b"), PeerName::from("c")]);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[&PeerName::from("b")], "http://b:6784");
        assert!(config.observer);
        assert_eq!(config.db_dir, PathBuf::from("/tmp/ipam"));

        let alloc = config.allocator_config();
        assert_eq!(alloc.quorum, 2);
        assert_eq!(alloc.our_nickname, "host-a");
        assert!(alloc.is_observer);
    }

    #[test]
    fn test_rejects_bad_values() {
        let missing = ServerConfig::from_lookup(lookup(&[]));
        assert!(matches!(missing, Err(ServerError::Configuration(_))));

        for (key, value) in [
            ("IPAM_UNIVERSE", "10.0.0.1/24"),
            ("IPAM_UNIVERSE", "10.0.0.0/31"),
            ("IPAM_DEFAULT_SUBNET", "192.168.0.0/24"),
            ("IPAM_CONSENSUS_PEERS", "0"),
            ("IPAM_PEERS", "just-a-name"),
            ("IPAM_LISTEN_ADDR", "nowhere"),
        ] {
            let result = ServerConfig::from_lookup(lookup(&[("IPAM_PEER_NAME", "a"), (key, value)]));
            assert!(matches!(result, Err(ServerError::Configuration(_))), "{key}={value} accepted");
        }
    }
}
