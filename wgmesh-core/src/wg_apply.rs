//! Drives the OS WireGuard interface through `wireguard-control`, the
//! collaborator `spec.md` §6 calls `wg_configurator`: `apply(peer_info)`,
//! `remove(pubkey)`, `latest_handshakes()`. Everything else about
//! programming the interface (address assignment, routing, `up`/`down`) is
//! out of scope per §1's non-goals; only peer-table maintenance lives here,
//! grounded on `shared::wg::up`'s `DeviceUpdate`/`PeerConfigBuilder` call
//! shape.

use ipnet::IpNet;
use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

use crate::{error::MeshError, types::PeerInfo};

/// Keepalive interval applied to every peer, matching `shared::wg::up`'s
/// hardcoded `25` (NAT mappings this mesh relies on otherwise expire well
/// under WireGuard's own handshake cadence).
const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

pub struct WgConfigurator {
    interface: InterfaceName,
    backend: Backend,
    psk: Key,
}

impl WgConfigurator {
    pub fn new(interface: InterfaceName, backend: Backend, psk: [u8; 32]) -> Self {
        Self {
            interface,
            backend,
            psk: Key(psk),
        }
    }

    /// Adds or updates `peer` on the interface: allowed IPs are its mesh
    /// IPv4/IPv6 addresses plus any routable networks it advertises, the PSK
    /// is the mesh-wide derived key (`spec.md` §3's `PSK`), and the endpoint
    /// is whatever this crate's discovery/rendezvous machinery has learned
    /// so far (may be absent before the first successful exchange).
    pub fn apply(&self, peer: &PeerInfo) -> Result<(), MeshError> {
        let public_key =
            Key::from_base64(&peer.public_key).map_err(|_| MeshError::WireGuard(format!("invalid peer pubkey {}", peer.public_key)))?;

        let mut builder = PeerConfigBuilder::new(&public_key)
            .replace_allowed_ips()
            .set_preshared_key(self.psk.clone())
            .set_persistent_keepalive_interval(PERSISTENT_KEEPALIVE_SECS);

        if let Some(v4) = peer.mesh_ipv4 {
            builder = builder.add_allowed_ip(v4, 32);
        }
        if let Some(v6) = peer.mesh_ipv6 {
            builder = builder.add_allowed_ip(v6, 128);
        }
        for network in &peer.routable_networks {
            if let Ok(net) = network.parse::<IpNet>() {
                builder = builder.add_allowed_ip(net.addr(), net.prefix_len());
            }
        }
        if let Some(endpoint) = peer.endpoint {
            builder = builder.set_endpoint(endpoint);
        }

        DeviceUpdate::new().add_peer(builder).apply(&self.interface, self.backend).map_err(MeshError::Io)
    }

    /// Drops `pubkey` from the interface entirely, for a confirmed GOODBYE or
    /// a staleness-sweep expiry.
    pub fn remove(&self, pubkey: &str) -> Result<(), MeshError> {
        let key = Key::from_base64(pubkey).map_err(|_| MeshError::WireGuard(format!("invalid peer pubkey {pubkey}")))?;
        DeviceUpdate::new()
            .remove_peer_by_key(&key)
            .apply(&self.interface, self.backend)
            .map_err(MeshError::Io)
    }

    pub fn set_private_key_and_port(&self, private_key: Key, listen_port: u16) -> Result<(), MeshError> {
        DeviceUpdate::new()
            .set_private_key(private_key)
            .set_listen_port(listen_port)
            .apply(&self.interface, self.backend)
            .map_err(MeshError::Io)
    }

    /// Reads the interface's current peer table and returns each peer's last
    /// WireGuard handshake as unix seconds (`spec.md` §6's
    /// `latest_handshakes() -> map<pubkey, unix_seconds>`), used by the
    /// rendezvous engine's stale-handshake sweep (§4.6) to decide whether a
    /// peer needs another punch attempt.
    pub fn latest_handshakes(&self) -> Result<HashMap<String, u64>, MeshError> {
        let device = Device::get(&self.interface, self.backend).map_err(MeshError::Io)?;
        Ok(device
            .peers
            .into_iter()
            .filter_map(|peer| {
                let handshake = peer.stats.last_handshake_time?;
                let secs = handshake.duration_since(UNIX_EPOCH).ok()?.as_secs();
                Some((peer.config.public_key.to_base64(), secs))
            })
            .collect())
    }
}
