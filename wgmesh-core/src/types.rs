//! Wire and in-memory data model shared across modules (`spec.md` §3).

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

/// An external endpoint that supports both IP hosts (we never hand out
/// hostnames on the wire, but round-tripping through `SocketAddr` keeps this
/// honest about what "host:port" parsing actually needs to handle).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint(pub SocketAddr);

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Endpoint)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Endpoint {
    pub fn resolve(s: &str) -> Option<SocketAddr> {
        s.to_socket_addrs().ok().and_then(|mut it| it.next())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    Unknown,
    Cone,
    Symmetric,
}

impl Default for NatType {
    fn default() -> Self {
        NatType::Unknown
    }
}

/// State owned and mutated by the orchestrator; never cloned out to a
/// caller who might hold a long-lived pointer to its endpoint (`spec.md`
/// §3, §9 — only `get_endpoint()`/`set_endpoint()` are exposed, in
/// `orchestrator.rs`).
#[derive(Clone, Debug)]
pub struct LocalNode {
    pub public_key: String,
    pub hostname: String,
    pub mesh_ipv4: IpAddr,
    pub mesh_ipv6: IpAddr,
    pub introducer: bool,
    pub routable_networks: Vec<String>,
    pub nat_type: NatType,
    /// The WireGuard data-plane endpoint we advertise to peers, `ip:wg_listen_port`.
    /// Mutated only by STUN refresh and by REPLY observed-endpoint reflection
    /// (`spec.md` §3's "mutation is serialized, single writer semantics").
    pub endpoint: Option<SocketAddr>,
}

/// A peer discovered through any channel. `LastSeen` is monotonically
/// non-decreasing per invariant 6; `discovered_via` is a union-append set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub public_key: String,
    pub hostname: Option<String>,
    pub mesh_ipv4: Option<IpAddr>,
    pub mesh_ipv6: Option<IpAddr>,
    pub endpoint: Option<SocketAddr>,
    /// The source address a datagram from this peer last arrived from — the
    /// control-plane (gossip-port) endpoint rendezvous uses to reach this
    /// peer, distinct from `endpoint` (its advertised WireGuard data port).
    pub control_endpoint: Option<SocketAddr>,
    pub introducer: bool,
    pub nat_type: NatType,
    pub routable_networks: Vec<String>,
    pub last_seen_unix: u64,
    pub discovered_via: BTreeSet<String>,
}

impl PeerInfo {
    pub fn new(public_key: String) -> Self {
        Self {
            public_key,
            hostname: None,
            mesh_ipv4: None,
            mesh_ipv6: None,
            endpoint: None,
            control_endpoint: None,
            introducer: false,
            nat_type: NatType::Unknown,
            routable_networks: Vec::new(),
            last_seen_unix: now_unix(),
            discovered_via: BTreeSet::new(),
        }
    }

    /// Field-level LWW merge: non-empty fields from `other` win, `last_seen`
    /// takes the max, `discovered_via` is the union (`spec.md` §4.4, §9 —
    /// explicit field merge, never a hidden whole-struct LWW). `source_addr`
    /// is the UDP source of the datagram carrying `other`, when known; it
    /// both resolves a wildcard `wg_endpoint` (§4.5.1) and records the
    /// sender's control-plane endpoint for the rendezvous engine.
    pub fn merge_from(&mut self, other: &PeerAnnouncement, via: &str, source_addr: Option<SocketAddr>) {
        if let Some(hostname) = &other.hostname {
            self.hostname = Some(hostname.clone());
        }
        self.mesh_ipv4 = Some(other.mesh_ip);
        if let Some(v6) = other.mesh_ipv6 {
            self.mesh_ipv6 = Some(v6);
        }
        if let Some(resolved) = resolve_endpoint(&other.wg_endpoint, source_addr.map(|a| a.ip())) {
            self.endpoint = Some(resolved);
        }
        if let Some(addr) = source_addr {
            self.control_endpoint = Some(addr);
        }
        if let Some(introducer) = other.introducer {
            self.introducer = introducer;
        }
        if let Some(nat_type) = other.nat_type {
            self.nat_type = nat_type;
        }
        if let Some(networks) = &other.routable_networks {
            self.routable_networks = networks.clone();
        }
        self.last_seen_unix = self.last_seen_unix.max(now_unix());
        self.discovered_via.insert(via.to_string());
    }

    pub fn is_active(&self, active_timeout_secs: u64) -> bool {
        now_unix().saturating_sub(self.last_seen_unix) <= active_timeout_secs
    }

    /// Merge variant for announcements arriving over LAN multicast
    /// (`spec.md` §4.9): the datagram's LAN source IP is preferred over the
    /// peer's advertised endpoint, since that endpoint may be a public/STUN
    /// mapping unreachable from the local subnet while the LAN source
    /// always is reachable directly.
    pub fn merge_from_lan(&mut self, other: &PeerAnnouncement, via: &str, source_addr: SocketAddr) {
        self.merge_from(other, via, Some(source_addr));
        let port = Endpoint::resolve(&other.wg_endpoint)
            .map(|addr| addr.port())
            .unwrap_or_else(|| source_addr.port());
        self.endpoint = Some(SocketAddr::new(source_addr.ip(), port));
    }
}

/// Endpoint resolution rule from `spec.md` §4.5.1: an explicit, non-wildcard
/// host wins outright; otherwise substitute the observing source IP while
/// keeping the advertised port; if the advertised string doesn't parse at
/// all, fall back to `source_ip:default_wg_port` when a source is known.
pub fn resolve_endpoint(advertised: &str, source_ip: Option<IpAddr>) -> Option<SocketAddr> {
    const DEFAULT_WG_PORT: u16 = 51820;

    let host_is_wildcard = |host: &str| host.is_empty() || host == "0.0.0.0" || host == "::";

    if let Some(addr) = Endpoint::resolve(advertised) {
        let host_str = addr.ip().to_string();
        if !host_is_wildcard(&host_str) {
            return Some(addr);
        }
        return source_ip.map(|ip| SocketAddr::new(ip, addr.port()));
    }

    // Unparsable advertised string: try to salvage just the port.
    if let Some(port) = advertised.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()) {
        return source_ip.map(|ip| SocketAddr::new(ip, port));
    }

    source_ip.map(|ip| SocketAddr::new(ip, DEFAULT_WG_PORT))
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A reduced `PeerInfo` carried inside an announcement's `known_peers` list
/// (`spec.md` §3 — `KnownPeer` is `PeerAnnouncement` minus `timestamp`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnownPeer {
    pub wg_pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub mesh_ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_ipv6: Option<IpAddr>,
    pub wg_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub introducer: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routable_networks: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nat_type: Option<NatType>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub protocol: String,
    pub wg_pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub mesh_ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_ipv6: Option<IpAddr>,
    pub wg_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub introducer: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routable_networks: Option<Vec<String>>,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_peers: Option<Vec<KnownPeer>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nat_type: Option<NatType>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GoodbyePayload {
    pub protocol: String,
    pub timestamp: u64,
    pub wg_pubkey: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RendezvousCandidate {
    pub wg_pubkey: String,
    pub control_endpoint: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RendezvousOffer {
    pub protocol: String,
    pub timestamp: u64,
    pub pair_id: u64,
    pub from_pubkey: String,
    pub target_pubkey: String,
    pub candidates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub introducer_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RendezvousStart {
    pub protocol: String,
    pub timestamp: u64,
    pub pair_id: u64,
    pub peer_pubkey: String,
    pub peer_candidates: Vec<String>,
    pub start_at_unix_ms: u64,
    pub introducer_key: String,
}

pub const PROTOCOL_VERSION: &str = "wgmesh-v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Hello,
    Reply,
    Announce,
    Goodbye,
    RendezvousOffer,
    RendezvousStart,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_endpoint_prefers_explicit_host() {
        let resolved = resolve_endpoint("203.0.113.5:51820", Some("198.51.100.1".parse().unwrap()));
        assert_eq!(resolved, Some("203.0.113.5:51820".parse().unwrap()));
    }

    #[test]
    fn resolve_endpoint_substitutes_wildcard_host() {
        let resolved = resolve_endpoint("0.0.0.0:51820", Some("198.51.100.1".parse().unwrap()));
        assert_eq!(resolved, Some("198.51.100.1:51820".parse().unwrap()));
    }

    #[test]
    fn resolve_endpoint_falls_back_to_default_port() {
        let resolved = resolve_endpoint("not-an-endpoint", Some("198.51.100.1".parse().unwrap()));
        assert_eq!(resolved, Some("198.51.100.1:51820".parse().unwrap()));
    }

    #[test]
    fn peer_info_merge_unions_discovered_via() {
        let mut peer = PeerInfo::new("abc".into());
        let announcement = PeerAnnouncement {
            protocol: PROTOCOL_VERSION.into(),
            wg_pubkey: "abc".into(),
            hostname: None,
            mesh_ip: "10.0.0.2".parse().unwrap(),
            mesh_ipv6: None,
            wg_endpoint: "203.0.113.9:51820".into(),
            introducer: None,
            routable_networks: None,
            timestamp: now_unix(),
            known_peers: None,
            observed_endpoint: None,
            nat_type: None,
        };
        peer.merge_from(&announcement, "dht", None);
        peer.merge_from(&announcement, "gossip", None);
        assert!(peer.discovered_via.contains("dht"));
        assert!(peer.discovered_via.contains("gossip"));
    }

    #[test]
    fn merge_from_lan_prefers_source_ip_over_advertised_host() {
        let mut peer = PeerInfo::new("abc".into());
        let announcement = PeerAnnouncement {
            protocol: PROTOCOL_VERSION.into(),
            wg_pubkey: "abc".into(),
            hostname: None,
            mesh_ip: "10.0.0.2".parse().unwrap(),
            mesh_ipv6: None,
            // Advertised as a public/STUN-mapped endpoint, unreachable on the LAN.
            wg_endpoint: "203.0.113.9:51820".into(),
            introducer: None,
            routable_networks: None,
            timestamp: now_unix(),
            known_peers: None,
            observed_endpoint: None,
            nat_type: None,
        };
        let lan_source: SocketAddr = "192.168.1.42:51821".parse().unwrap();
        peer.merge_from_lan(&announcement, "lan", lan_source);
        assert_eq!(peer.endpoint, Some("192.168.1.42:51820".parse().unwrap()));
        assert!(peer.discovered_via.contains("lan"));
    }
}
