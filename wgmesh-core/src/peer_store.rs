//! In-memory peer registry (`spec.md` §4.4). Keyed by WireGuard public key,
//! merged field-by-field on every update, with a bounded, non-blocking
//! pub/sub fan-out for subscribers that want to react to peer churn (the
//! gossip and rendezvous loops both subscribe).
//!
//! Mirrors the teacher's `Db`/`Endpoints` pattern of wrapping shared state in
//! `parking_lot::RwLock` rather than a tokio mutex, since lock hold times
//! here are always short and non-blocking (`server/src/lib.rs`).

use parking_lot::RwLock;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;

use crate::types::{PeerAnnouncement, PeerInfo};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub enum PeerEvent {
    Discovered(PeerInfo),
    Updated(PeerInfo),
    Expired(String),
}

struct Inner {
    peers: HashMap<String, PeerInfo>,
    subscribers: Vec<mpsc::Sender<PeerEvent>>,
}

/// Shared, cloneable handle to the registry. Cloning is cheap (an `Arc`
/// bump); every module that needs to read or update peers holds one.
#[derive(Clone)]
pub struct PeerStore {
    inner: Arc<RwLock<Inner>>,
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                peers: HashMap::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    /// Applies an announcement to the stored `PeerInfo`, creating it if this
    /// is the first time we've seen `wg_pubkey`, and publishes the resulting
    /// `Discovered`/`Updated` event to subscribers.
    pub fn apply_announcement(&self, announcement: &PeerAnnouncement, via: &str, source_addr: Option<SocketAddr>) {
        let mut inner = self.inner.write();
        let is_new = !inner.peers.contains_key(&announcement.wg_pubkey);
        let entry = inner
            .peers
            .entry(announcement.wg_pubkey.clone())
            .or_insert_with(|| PeerInfo::new(announcement.wg_pubkey.clone()));
        entry.merge_from(announcement, via, source_addr);
        let snapshot = entry.clone();

        let event = if is_new {
            PeerEvent::Discovered(snapshot)
        } else {
            PeerEvent::Updated(snapshot)
        };
        Self::publish_locked(&mut inner, event);
    }

    /// As `apply_announcement`, but preferring the LAN datagram's source IP
    /// over the peer's advertised endpoint (`spec.md` §4.9).
    pub fn apply_announcement_lan(&self, announcement: &PeerAnnouncement, via: &str, source_addr: SocketAddr) {
        let mut inner = self.inner.write();
        let is_new = !inner.peers.contains_key(&announcement.wg_pubkey);
        let entry = inner
            .peers
            .entry(announcement.wg_pubkey.clone())
            .or_insert_with(|| PeerInfo::new(announcement.wg_pubkey.clone()));
        entry.merge_from_lan(announcement, via, source_addr);
        let snapshot = entry.clone();

        let event = if is_new {
            PeerEvent::Discovered(snapshot)
        } else {
            PeerEvent::Updated(snapshot)
        };
        Self::publish_locked(&mut inner, event);
    }

    pub fn remove(&self, wg_pubkey: &str) {
        let mut inner = self.inner.write();
        if inner.peers.remove(wg_pubkey).is_some() {
            Self::publish_locked(&mut inner, PeerEvent::Expired(wg_pubkey.to_string()));
        }
    }

    pub fn get(&self, wg_pubkey: &str) -> Option<PeerInfo> {
        self.inner.read().peers.get(wg_pubkey).cloned()
    }

    pub fn all(&self) -> Vec<PeerInfo> {
        self.inner.read().peers.values().cloned().collect()
    }

    pub fn active(&self, active_timeout_secs: u64) -> Vec<PeerInfo> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| p.is_active(active_timeout_secs))
            .cloned()
            .collect()
    }

    pub fn introducers(&self, active_timeout_secs: u64) -> Vec<PeerInfo> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| p.introducer && p.is_active(active_timeout_secs))
            .cloned()
            .collect()
    }

    /// Sweeps peers that haven't been seen within `active_timeout_secs` and
    /// emits an `Expired` event for each (the GOODBYE staleness check in
    /// §4.6 reuses this rather than trusting an unauthenticated GOODBYE
    /// alone).
    pub fn expire_stale(&self, active_timeout_secs: u64) -> Vec<String> {
        let mut inner = self.inner.write();
        let stale: Vec<String> = inner
            .peers
            .iter()
            .filter(|(_, p)| !p.is_active(active_timeout_secs))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            inner.peers.remove(key);
            Self::publish_locked(&mut inner, PeerEvent::Expired(key.clone()));
        }
        stale
    }

    /// Subscribes to peer-store events. The returned channel is bounded and
    /// non-blocking on the publish side: a slow subscriber that lets its
    /// channel fill up simply misses events rather than stalling every
    /// other writer (`spec.md` §4.4, §5).
    pub fn subscribe(&self) -> mpsc::Receiver<PeerEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.inner.write().subscribers.push(tx);
        rx
    }

    fn publish_locked(inner: &mut Inner, event: PeerEvent) {
        inner.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_unix, PROTOCOL_VERSION};

    fn announcement(pubkey: &str, hostname: &str) -> PeerAnnouncement {
        PeerAnnouncement {
            protocol: PROTOCOL_VERSION.into(),
            wg_pubkey: pubkey.into(),
            hostname: Some(hostname.into()),
            mesh_ip: "10.0.0.5".parse().unwrap(),
            mesh_ipv6: None,
            wg_endpoint: "203.0.113.1:51820".into(),
            introducer: Some(false),
            routable_networks: None,
            timestamp: now_unix(),
            known_peers: None,
            observed_endpoint: None,
            nat_type: None,
        }
    }

    #[test]
    fn first_announcement_creates_discovered_event() {
        let store = PeerStore::new();
        let mut rx = store.subscribe();
        store.apply_announcement(&announcement("key-a", "node-a"), "dht", None);
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, PeerEvent::Discovered(_)));
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn second_announcement_emits_updated_not_discovered() {
        let store = PeerStore::new();
        store.apply_announcement(&announcement("key-a", "node-a"), "dht", None);
        let mut rx = store.subscribe();
        store.apply_announcement(&announcement("key-a", "node-a-renamed"), "gossip", None);
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, PeerEvent::Updated(_)));
        assert_eq!(store.get("key-a").unwrap().hostname.as_deref(), Some("node-a-renamed"));
    }

    #[test]
    fn expire_stale_removes_and_emits() {
        let store = PeerStore::new();
        store.apply_announcement(&announcement("key-a", "node-a"), "dht", None);
        {
            let mut inner = store.inner.write();
            inner.peers.get_mut("key-a").unwrap().last_seen_unix = 0;
        }
        let mut rx = store.subscribe();
        let expired = store.expire_stale(60);
        assert_eq!(expired, vec!["key-a".to_string()]);
        assert!(store.get("key-a").is_none());
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Expired(_)));
    }

    #[test]
    fn slow_subscriber_does_not_block_publish() {
        let store = PeerStore::new();
        let _rx = store.subscribe();
        for i in 0..SUBSCRIBER_CHANNEL_CAPACITY + 10 {
            store.apply_announcement(&announcement(&format!("key-{i}"), "node"), "dht", None);
        }
        assert_eq!(store.all().len(), SUBSCRIBER_CHANNEL_CAPACITY + 10);
    }
}
