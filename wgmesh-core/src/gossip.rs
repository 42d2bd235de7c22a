//! Intra-mesh gossip (`spec.md` §4.8): once peers are already connected over
//! the WireGuard mesh itself, periodically re-exchange ANNOUNCE messages
//! over their mesh IPs rather than relying solely on DHT/STUN. This keeps
//! the peer store warm even if external discovery quiets down.

use rand::Rng;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::{peer_exchange::PeerExchange, peer_store::PeerStore, types::PeerInfo};

const GOSSIP_INTERVAL: Duration = Duration::from_secs(10);
const GOSSIP_PORT_DEFAULT: u16 = 51821;

pub struct MeshGossip {
    exchange: Arc<PeerExchange>,
    store: PeerStore,
    active_timeout_secs: u64,
    gossip_port: u16,
}

impl MeshGossip {
    pub fn new(exchange: Arc<PeerExchange>, store: PeerStore, active_timeout_secs: u64, gossip_port: u16) -> Self {
        Self {
            exchange,
            store,
            active_timeout_secs,
            gossip_port,
        }
    }

    async fn gossip_once(&self) {
        let active = self.store.active(self.active_timeout_secs);
        let Some(peer) = pick_gossip_peer(&active, &mut rand::thread_rng()) else {
            return;
        };
        let Some(mesh_ip) = peer.mesh_ipv4.or(peer.mesh_ipv6) else {
            return;
        };
        let addr = std::net::SocketAddr::new(mesh_ip, self.gossip_port);
        if self.exchange.send_announce(addr).await.is_err() {
            log::debug!("gossip announce to {addr} failed");
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(GOSSIP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.gossip_once().await,
            }
        }
    }
}

pub const DEFAULT_GOSSIP_PORT: u16 = GOSSIP_PORT_DEFAULT;

/// Picks one peer at random per tick rather than fanning out to everyone
/// active, keeping gossip traffic flat as the mesh grows (`spec.md` §4.8).
fn pick_gossip_peer<'a>(active: &'a [PeerInfo], rng: &mut impl Rng) -> Option<&'a PeerInfo> {
    if active.is_empty() {
        None
    } else {
        active.get(rng.gen_range(0..active.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer(pubkey: &str) -> PeerInfo {
        let mut peer = PeerInfo::new(pubkey.to_string());
        peer.mesh_ipv4 = Some("10.42.0.2".parse().unwrap());
        peer
    }

    #[test]
    fn pick_gossip_peer_empty_store_yields_none() {
        let active: Vec<PeerInfo> = Vec::new();
        assert!(pick_gossip_peer(&active, &mut rand::thread_rng()).is_none());
    }

    #[test]
    fn pick_gossip_peer_single_peer_always_chosen() {
        let active = vec![sample_peer("a")];
        let picked = pick_gossip_peer(&active, &mut rand::thread_rng()).unwrap();
        assert_eq!(picked.public_key, "a");
    }

    #[test]
    fn pick_gossip_peer_returns_one_of_the_active_set() {
        let active = vec![sample_peer("a"), sample_peer("b"), sample_peer("c")];
        for _ in 0..20 {
            let picked = pick_gossip_peer(&active, &mut rand::thread_rng()).unwrap();
            assert!(["a", "b", "c"].contains(&picked.public_key.as_str()));
        }
    }
}
