//! UDP control protocol (`spec.md` §4.5): HELLO/REPLY/ANNOUNCE/GOODBYE
//! exchange over the gossip port, with peer-as-STUN reflection (a REPLY
//! carries the sender's own `observed_endpoint`) and retransmission-driven
//! NAT punching modeled on the candidate-cycling shape of the teacher's
//! `NatTraverse` (`client/src/nat.rs`).

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    envelope::{self, EnvelopePayload, EnvelopeError},
    keys::DerivedKeys,
    peer_store::PeerStore,
    types::{now_unix, GoodbyePayload, KnownPeer, LocalNode, MessageType, NatType, PeerAnnouncement, PeerInfo, PROTOCOL_VERSION},
};

/// How long a HELLO candidate is retransmitted for before being abandoned,
/// mirroring the teacher's `NatTraverse::STEP_INTERVAL` cadence.
const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(2);
const RETRANSMIT_ATTEMPTS: u32 = 5;
const MAX_UDP_PAYLOAD: usize = 1500;
const DEFAULT_WG_LISTEN_PORT: u16 = 51820;
const DEFAULT_ACTIVE_TIMEOUT_SECS: u64 = 300;
/// Bound on the channel forwarding rendezvous frames to the rendezvous
/// engine; a slow engine simply drops the oldest offers rather than
/// backpressuring the socket's receive loop.
const RENDEZVOUS_CHANNEL_CAPACITY: usize = 64;
/// Per-source-IP token bucket gating decryption attempts (`spec.md` §4.8,
/// §5): one HELLO/ANNOUNCE retransmission burst fits comfortably under the
/// capacity, but a flood from a single address starts getting dropped
/// before it reaches `envelope::open`.
const RATE_LIMIT_BUCKET_CAPACITY: f64 = 20.0;
const RATE_LIMIT_REFILL_PER_SEC: f64 = 10.0;
/// Bound on tracked source IPs before the rate limiter starts evicting
/// buckets that are back at full capacity, so a scan from many addresses
/// can't grow the map without bound.
const RATE_LIMIT_MAX_TRACKED: usize = 4096;

struct PendingHello {
    started_at: Instant,
    attempts: u32,
    /// Why we dialed this address (`"dht"`, `"dht-transitive"`,
    /// `"dht-rendezvous"`, `"lan"`, ...), applied to the store when the
    /// matching REPLY comes back so `PeerInfo::discovered_via` reflects the
    /// mechanism that actually found the peer rather than a generic
    /// "we got a packet" tag (`spec.md` §3, §4.7, §4.9).
    via: &'static str,
}

/// A per-source-IP token bucket, refilled continuously and spent one token
/// per decryption attempt. Guarded by a single `Mutex` rather than one lock
/// per bucket since the whole map is touched on every datagram anyway.
struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns whether `ip` has a token to spend on this decryption attempt,
    /// refilling its bucket for elapsed time first.
    fn allow(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock();
        if buckets.len() >= RATE_LIMIT_MAX_TRACKED && !buckets.contains_key(&ip) {
            buckets.retain(|_, bucket| bucket.tokens < RATE_LIMIT_BUCKET_CAPACITY);
        }
        let now = Instant::now();
        let bucket = buckets.entry(ip).or_insert_with(|| TokenBucket {
            tokens: RATE_LIMIT_BUCKET_CAPACITY,
            last_refill: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * RATE_LIMIT_REFILL_PER_SEC).min(RATE_LIMIT_BUCKET_CAPACITY);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct PeerExchange {
    socket: Arc<UdpSocket>,
    gossip_key: [u8; 32],
    wg_listen_port: u16,
    active_timeout_secs: u64,
    local: Arc<Mutex<LocalNode>>,
    store: PeerStore,
    pending: Mutex<HashMap<SocketAddr, PendingHello>>,
    rendezvous_tx: Mutex<Option<mpsc::Sender<(SocketAddr, MessageType, Vec<u8>)>>>,
    rate_limiter: RateLimiter,
}

impl PeerExchange {
    pub async fn bind(keys: &DerivedKeys, local: Arc<Mutex<LocalNode>>, store: PeerStore) -> std::io::Result<Self> {
        Self::bind_with_wg_port(keys, local, store, DEFAULT_WG_LISTEN_PORT, DEFAULT_ACTIVE_TIMEOUT_SECS).await
    }

    pub async fn bind_with_wg_port(
        keys: &DerivedKeys,
        local: Arc<Mutex<LocalNode>>,
        store: PeerStore,
        wg_listen_port: u16,
        active_timeout_secs: u64,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", keys.gossip_port)).await?;
        Self::from_socket(socket, keys.gossip_key, wg_listen_port, active_timeout_secs, local, store)
    }

    fn from_socket(
        socket: UdpSocket,
        gossip_key: [u8; 32],
        wg_listen_port: u16,
        active_timeout_secs: u64,
        local: Arc<Mutex<LocalNode>>,
        store: PeerStore,
    ) -> std::io::Result<Self> {
        Ok(Self {
            socket: Arc::new(socket),
            gossip_key,
            wg_listen_port,
            active_timeout_secs,
            local,
            store,
            pending: Mutex::new(HashMap::new()),
            rendezvous_tx: Mutex::new(None),
            rate_limiter: RateLimiter::new(),
        })
    }

    #[cfg(test)]
    async fn bind_ephemeral(keys: &DerivedKeys, local: Arc<Mutex<LocalNode>>, store: PeerStore) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
        Self::from_socket(
            socket,
            keys.gossip_key,
            DEFAULT_WG_LISTEN_PORT,
            DEFAULT_ACTIVE_TIMEOUT_SECS,
            local,
            store,
        )
    }

    /// Registers the rendezvous engine's inbound channel. Called once by the
    /// orchestrator after both the exchange and the engine exist, since each
    /// needs a handle to the other (the engine sends through the exchange's
    /// socket; the exchange forwards rendezvous frames to the engine).
    pub fn install_rendezvous_channel(&self) -> mpsc::Receiver<(SocketAddr, MessageType, Vec<u8>)> {
        let (tx, rx) = mpsc::channel(RENDEZVOUS_CHANNEL_CAPACITY);
        *self.rendezvous_tx.lock() = Some(tx);
        rx
    }

    /// Seals and sends an arbitrary envelope payload, for use by callers
    /// outside this module (the rendezvous engine sends `RendezvousOffer`/
    /// `RendezvousStart` frames this way).
    pub async fn send_sealed<P: EnvelopePayload>(&self, kind: MessageType, payload: &P, addr: SocketAddr) -> Result<(), EnvelopeError> {
        let frame = envelope::seal(kind, payload, &self.gossip_key)?;
        let _ = self.socket.send_to(&frame, addr).await;
        Ok(())
    }

    pub fn gossip_key(&self) -> [u8; 32] {
        self.gossip_key
    }

    /// Returns our best-known public endpoint, if one has been learned
    /// (§4.5.2 reflection or STUN), so callers (rendezvous) can advertise it
    /// as a punch candidate.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local.lock().endpoint
    }

    fn announcement_payload(&self, observed_endpoint: Option<String>) -> PeerAnnouncement {
        let local = self.local.lock();
        let wg_endpoint = local
            .endpoint
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.wg_listen_port));
        PeerAnnouncement {
            protocol: PROTOCOL_VERSION.into(),
            wg_pubkey: local.public_key.clone(),
            hostname: Some(local.hostname.clone()),
            mesh_ip: local.mesh_ipv4,
            mesh_ipv6: Some(local.mesh_ipv6),
            wg_endpoint,
            introducer: Some(local.introducer),
            routable_networks: Some(local.routable_networks.clone()),
            timestamp: now_unix(),
            known_peers: None,
            observed_endpoint,
            nat_type: Some(local.nat_type),
        }
    }

    /// Peer-as-STUN reflection (`spec.md` §4.5.2): a REPLY's
    /// `observed_endpoint` is the sender's view of our UDP source address. If
    /// that IP is public unicast and we don't already have a public IPv6
    /// endpoint (never downgrade a reachable v6 endpoint to a reflected v4
    /// one), adopt its IP while keeping our own WG listen port — the
    /// observed port is a control-plane port, not the WG data port
    /// (invariant 7).
    fn reflect_observed_endpoint(&self, observed_endpoint: &str) {
        let Some(observed) = crate::types::Endpoint::resolve(observed_endpoint) else {
            return;
        };
        self.update_public_ip(observed.ip());
    }

    /// Adopts `ip` as our advertised public IP, keeping the WG listen port,
    /// unless it isn't public unicast or we already hold a public IPv6
    /// endpoint (never downgrade it to a v4 address, per the same guard
    /// `reflect_observed_endpoint` applies). Shared by REPLY reflection
    /// (§4.5.2) and the STUN refresh loop (§4.3, §4.7) so both update
    /// `LocalNode::endpoint` through one rule.
    pub fn update_public_ip(&self, ip: std::net::IpAddr) {
        if !is_public_unicast(ip) {
            return;
        }
        let mut local = self.local.lock();
        let already_public_v6 = matches!(local.endpoint, Some(SocketAddr::V6(v6)) if is_public_unicast(std::net::IpAddr::V6(*v6.ip())));
        if already_public_v6 {
            return;
        }
        local.endpoint = Some(SocketAddr::new(ip, self.wg_listen_port));
    }

    /// Sends a HELLO to `addr` and registers it for retransmission tracking;
    /// the retransmit loop (`run_retransmit_loop`) resends until a REPLY
    /// arrives or the attempt budget is exhausted. `via` tags why we're
    /// dialing this address so the eventual REPLY can stamp the store with
    /// the mechanism that actually found the peer (`spec.md` §3's
    /// `discovered_via`), e.g. `"dht"`, `"dht-transitive"`,
    /// `"dht-rendezvous"`, `"lan"`.
    pub async fn send_hello(&self, addr: SocketAddr, via: &'static str) -> Result<(), EnvelopeError> {
        let mut payload = self.announcement_payload(None);
        // §4.5 outbound step 2: HELLO carries a known-peers list derived
        // from the active store, the same transitive-learning path ANNOUNCE
        // provides over gossip, so a pure-DHT swarm can still learn
        // peers-of-peers through the control channel alone.
        payload.known_peers = Some(known_peers_from(self.store.active(self.active_timeout_secs)));
        let frame = envelope::seal(MessageType::Hello, &payload, &self.gossip_key)?;
        let _ = self.socket.send_to(&frame, addr).await;
        self.pending.lock().insert(
            addr,
            PendingHello {
                started_at: Instant::now(),
                attempts: 1,
                via,
            },
        );
        Ok(())
    }

    /// Replies to a HELLO/REPLY with our own REPLY, including the sender's
    /// address as our observation of their public endpoint (§4.5.2).
    async fn send_reply(&self, to: SocketAddr) -> Result<(), EnvelopeError> {
        let payload = self.announcement_payload(Some(to.to_string()));
        let frame = envelope::seal(MessageType::Reply, &payload, &self.gossip_key)?;
        let _ = self.socket.send_to(&frame, to).await;
        Ok(())
    }

    pub async fn send_announce(&self, addr: SocketAddr) -> Result<(), EnvelopeError> {
        let mut payload = self.announcement_payload(None);
        payload.known_peers = Some(known_peers_from(self.store.all()));
        let frame = envelope::seal(MessageType::Announce, &payload, &self.gossip_key)?;
        let _ = self.socket.send_to(&frame, addr).await;
        Ok(())
    }

    pub async fn send_goodbye(&self, addr: SocketAddr) -> Result<(), EnvelopeError> {
        let payload = GoodbyePayload {
            protocol: PROTOCOL_VERSION.into(),
            timestamp: now_unix(),
            wg_pubkey: self.local.lock().public_key.clone(),
        };
        let frame = envelope::seal(MessageType::Goodbye, &payload, &self.gossip_key)?;
        let _ = self.socket.send_to(&frame, addr).await;
        Ok(())
    }

    /// Processes one inbound datagram. Any failure to open the envelope is
    /// swallowed: foreign traffic on this port is expected and must never
    /// be logged above debug (`spec.md` §7).
    /// Entry point for datagrams received on a socket other than this
    /// exchange's own (LAN discovery shares the same envelope/dispatch
    /// logic but listens on the multicast group socket instead).
    pub async fn handle_lan_datagram(&self, data: &[u8], from: SocketAddr) {
        self.handle_datagram_inner(data, from, true).await
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        self.handle_datagram_inner(data, from, false).await
    }

    async fn handle_datagram_inner(&self, data: &[u8], from: SocketAddr, via_lan: bool) {
        // §4.8/§5: a per-source-IP token bucket gates every decryption
        // attempt, on both the control socket and the LAN multicast socket,
        // so a flood from one address can't run up CPU cost before a single
        // AES-GCM open is even attempted.
        if !self.rate_limiter.allow(from.ip()) {
            log::debug!("rate-limiting datagram from {from}");
            return;
        }

        // Peek the message kind from the still-encrypted frame so GOODBYE can
        // be decoded with its own tighter replay window (§7) instead of the
        // general one every other payload type uses.
        let kind = match envelope::open_raw(data, &self.gossip_key) {
            Ok((kind, _)) => kind,
            Err(_) => {
                log::debug!("discarding undecryptable datagram from {from}");
                return;
            }
        };

        if kind == MessageType::Goodbye {
            match envelope::open_with_window::<GoodbyePayload>(data, &self.gossip_key, envelope::GOODBYE_REPLAY_WINDOW) {
                Ok((_, payload)) => self.store.remove(&payload.wg_pubkey),
                Err(_) => log::debug!("discarding invalid GOODBYE from {from}"),
            }
            return;
        }

        // RENDEZVOUS_OFFER/START don't fit PeerAnnouncement's schema; forward
        // the still-sealed frame to the rendezvous engine, which owns the
        // matching EnvelopePayload impls and opens it itself.
        if kind == MessageType::RendezvousOffer || kind == MessageType::RendezvousStart {
            if let Some(tx) = self.rendezvous_tx.lock().clone() {
                if tx.try_send((from, kind, data.to_vec())).is_err() {
                    log::debug!("rendezvous channel full or closed, dropping frame from {from}");
                }
            }
            return;
        }

        let (kind, payload) = match envelope::open::<PeerAnnouncement>(data, &self.gossip_key) {
            Ok(result) => result,
            Err(_) => {
                log::debug!("discarding undecryptable datagram from {from}");
                return;
            }
        };

        // Invariant 2: never store a `PeerInfo` for our own pubkey. A HELLO
        // loops back to us over a `multicast_loop`-enabled LAN socket, and a
        // transitive ANNOUNCE can legitimately name us in someone else's
        // `known_peers`; both must be dropped before they reach the store.
        let local_pubkey = self.local.lock().public_key.clone();
        if payload.wg_pubkey == local_pubkey {
            return;
        }

        let apply = |payload: &PeerAnnouncement, via: &str| {
            if via_lan {
                self.store.apply_announcement_lan(payload, via, from);
            } else {
                self.store.apply_announcement(payload, via, Some(from));
            }
        };

        match kind {
            MessageType::Hello => {
                // We didn't dial this address ourselves, so the sender was
                // discovered directly rather than via a pending HELLO we
                // sent (`"lan"` if it arrived on the multicast socket,
                // `"dht"` otherwise — the control channel has no other way
                // for an unsolicited HELLO to reach us).
                apply(&payload, if via_lan { "lan" } else { "dht" });
                // §4.5 inbound HELLO: ingest `known_peers` as transitive
                // entries, the same path ANNOUNCE's `known_peers` already
                // feeds, so a pure-DHT swarm still learns peers-of-peers
                // over the control channel.
                let transitive_via = if via_lan { "lan" } else { "dht-transitive" };
                self.ingest_known_peers(&payload, transitive_via);
                if self.send_reply(from).await.is_err() {
                    log::debug!("failed to reply to HELLO from {from}");
                }
            }
            MessageType::Reply => {
                // This REPLY answers a HELLO we sent ourselves, so the
                // pending entry's `via` tag is the actual discovery method
                // (`spec.md` §4.7's "stored with 'dht' or 'dht-transitive'").
                let via = self
                    .pending
                    .lock()
                    .remove(&from)
                    .map(|p| p.via)
                    .unwrap_or(if via_lan { "lan" } else { "dht" });
                apply(&payload, via);
                if let Some(observed) = &payload.observed_endpoint {
                    self.reflect_observed_endpoint(observed);
                }
            }
            MessageType::Announce => {
                // ANNOUNCE is the mesh-gossip message type (`spec.md` §4.8).
                let via = if via_lan { "lan" } else { "gossip" };
                apply(&payload, via);
                let transitive_via = if via_lan { "lan" } else { "gossip-transitive" };
                self.ingest_known_peers(&payload, transitive_via);
            }
            MessageType::Goodbye | MessageType::RendezvousOffer | MessageType::RendezvousStart => unreachable!(
                "handled above before the generic PeerAnnouncement open"
            ),
        }
    }

    /// Applies each entry of `payload.known_peers` to the store as a
    /// transitive discovery tagged `via`, skipping ourselves. Shared by the
    /// HELLO and ANNOUNCE inbound arms, which both carry a `known_peers`
    /// list but reached us over different message types.
    fn ingest_known_peers(&self, payload: &PeerAnnouncement, via: &str) {
        let Some(known_peers) = &payload.known_peers else {
            return;
        };
        let local_pubkey = self.local.lock().public_key.clone();
        for peer in known_peers {
            if peer.wg_pubkey == local_pubkey {
                continue;
            }
            let announcement = PeerAnnouncement {
                protocol: PROTOCOL_VERSION.into(),
                wg_pubkey: peer.wg_pubkey.clone(),
                hostname: peer.hostname.clone(),
                mesh_ip: peer.mesh_ip,
                mesh_ipv6: peer.mesh_ipv6,
                wg_endpoint: peer.wg_endpoint.clone(),
                introducer: peer.introducer,
                routable_networks: peer.routable_networks.clone(),
                timestamp: now_unix(),
                known_peers: None,
                observed_endpoint: None,
                nat_type: peer.nat_type,
            };
            self.store.apply_announcement(&announcement, via, None);
        }
    }

    pub async fn run_receive_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = [0u8; MAX_UDP_PAYLOAD];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => log::debug!("peer exchange recv error: {e}"),
                    }
                }
            }
        }
    }

    /// Retransmits outstanding HELLOs until they're acknowledged by a REPLY
    /// or the attempt budget runs out, at which point the candidate is
    /// dropped (mirrors `NatTraverse::step`'s exhaustion handling).
    pub async fn run_retransmit_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(RETRANSMIT_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired: Vec<SocketAddr> = {
                        let mut pending = self.pending.lock();
                        let mut retry = Vec::new();
                        let mut drop = Vec::new();
                        for (addr, state) in pending.iter_mut() {
                            if state.started_at.elapsed() < RETRANSMIT_INTERVAL {
                                continue;
                            }
                            if state.attempts >= RETRANSMIT_ATTEMPTS {
                                drop.push(*addr);
                            } else {
                                state.attempts += 1;
                                state.started_at = Instant::now();
                                retry.push(*addr);
                            }
                        }
                        for addr in &drop {
                            pending.remove(addr);
                        }
                        retry
                    };
                    for addr in expired {
                        let mut payload = self.announcement_payload(None);
                        payload.known_peers = Some(known_peers_from(self.store.active(self.active_timeout_secs)));
                        if let Ok(frame) = envelope::seal(MessageType::Hello, &payload, &self.gossip_key) {
                            let _ = self.socket.send_to(&frame, addr).await;
                        }
                    }
                }
            }
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn update_nat_type(&self, nat_type: NatType) {
        self.local.lock().nat_type = nat_type;
    }
}

/// Reduces a `PeerStore` snapshot to the `KnownPeer` list carried in a
/// HELLO/ANNOUNCE's `known_peers` field. Peers without a resolved mesh IPv4
/// yet are skipped; they haven't finished their own handshake and have
/// nothing useful to transitively introduce.
fn known_peers_from(peers: Vec<PeerInfo>) -> Vec<KnownPeer> {
    peers
        .into_iter()
        .filter_map(|p| {
            Some(KnownPeer {
                wg_pubkey: p.public_key,
                hostname: p.hostname,
                mesh_ip: p.mesh_ipv4?,
                mesh_ipv6: p.mesh_ipv6,
                wg_endpoint: p.endpoint.map(|e| e.to_string()).unwrap_or_default(),
                introducer: Some(p.introducer),
                routable_networks: Some(p.routable_networks),
                nat_type: Some(p.nat_type),
            })
        })
        .collect()
}

/// Not loopback, link-local, documentation/private (RFC 1918), ULA, or
/// unspecified — the class of address a REPLY's `observed_endpoint` must
/// fall into before it's trusted to update our advertised endpoint (§4.5.2).
fn is_public_unicast(ip: std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => {
            !(v4.is_loopback() || v4.is_link_local() || v4.is_private() || v4.is_unspecified() || v4.is_broadcast())
        }
        std::net::IpAddr::V6(v6) => {
            !(v6.is_loopback() || v6.is_unspecified() || is_unique_local(&v6) || is_link_local_v6(&v6))
        }
    }
}

/// `fc00::/7` (ULA, the `fd00::/8` half of which the mesh's own prefix lives
/// in), checked manually since `Ipv6Addr::is_unique_local` isn't stable.
fn is_unique_local(v6: &std::net::Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

/// `fe80::/10`, checked manually since `Ipv6Addr::is_unicast_link_local`
/// isn't stable.
fn is_link_local_v6(v6: &std::net::Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    fn make_local(pubkey: &str) -> Arc<Mutex<LocalNode>> {
        Arc::new(Mutex::new(LocalNode {
            public_key: pubkey.into(),
            hostname: "node".into(),
            mesh_ipv4: "10.10.0.2".parse().unwrap(),
            mesh_ipv6: "fd00::2".parse().unwrap(),
            introducer: false,
            routable_networks: Vec::new(),
            nat_type: NatType::Unknown,
            endpoint: None,
        }))
    }

    #[tokio::test]
    async fn hello_reply_round_trip_updates_both_stores() {
        let derived = keys::derive("integration-test-secret-value!!").unwrap();

        let store_a = PeerStore::new();
        let exchange_a = Arc::new(
            PeerExchange::bind_ephemeral(&derived, make_local("key-a"), store_a.clone())
                .await
                .unwrap(),
        );
        let store_b = PeerStore::new();
        let exchange_b = Arc::new(
            PeerExchange::bind_ephemeral(&derived, make_local("key-b"), store_b.clone())
                .await
                .unwrap(),
        );

        let addr_b = exchange_b.local_addr().unwrap();
        exchange_a.send_hello(addr_b, "dht").await.unwrap();

        let mut buf = [0u8; MAX_UDP_PAYLOAD];
        let (len, from) = exchange_b.socket.recv_from(&mut buf).await.unwrap();
        exchange_b.handle_datagram(&buf[..len], from).await;

        assert!(store_b.get("key-a").is_some());

        let (len, from) = exchange_a.socket.recv_from(&mut buf).await.unwrap();
        exchange_a.handle_datagram(&buf[..len], from).await;

        assert!(store_a.get("key-b").is_some());
        assert!(exchange_a.pending.lock().is_empty());
    }

    #[test]
    fn rate_limiter_exhausts_then_refills() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        for _ in 0..RATE_LIMIT_BUCKET_CAPACITY as u32 {
            assert!(limiter.allow(ip));
        }
        assert!(!limiter.allow(ip), "bucket should be empty after its capacity is spent");

        // Manually age the bucket past one refill interval instead of
        // sleeping, since a token bucket's whole point is not to block.
        limiter.buckets.lock().get_mut(&ip).unwrap().last_refill -= Duration::from_secs(1);
        assert!(limiter.allow(ip), "a bucket a full second old should have refilled at least one token");
    }

    #[test]
    fn rate_limiter_tracks_buckets_independently_per_ip() {
        let limiter = RateLimiter::new();
        let a: IpAddr = "203.0.113.5".parse().unwrap();
        let b: IpAddr = "203.0.113.6".parse().unwrap();

        for _ in 0..RATE_LIMIT_BUCKET_CAPACITY as u32 {
            assert!(limiter.allow(a));
        }
        assert!(!limiter.allow(a));
        assert!(limiter.allow(b), "a flood from one address must not rate-limit another");
    }

    #[tokio::test]
    async fn hello_carries_and_ingests_known_peers_as_dht_transitive() {
        let derived = keys::derive("integration-test-secret-value!!").unwrap();

        let store_a = PeerStore::new();
        let exchange_a = Arc::new(
            PeerExchange::bind_ephemeral(&derived, make_local("key-a"), store_a.clone())
                .await
                .unwrap(),
        );
        // Seed A's store with a third peer so A's outbound HELLO carries it
        // as a known-peer entry.
        let known = PeerAnnouncement {
            protocol: PROTOCOL_VERSION.into(),
            wg_pubkey: "key-c".into(),
            hostname: Some("node-c".into()),
            mesh_ip: "10.10.0.3".parse().unwrap(),
            mesh_ipv6: Some("fd00::3".parse().unwrap()),
            wg_endpoint: "203.0.113.9:51820".into(),
            introducer: Some(false),
            routable_networks: Some(Vec::new()),
            timestamp: now_unix(),
            known_peers: None,
            observed_endpoint: None,
            nat_type: Some(NatType::Unknown),
        };
        store_a.apply_announcement(&known, "dht", None);

        let store_b = PeerStore::new();
        let exchange_b = Arc::new(
            PeerExchange::bind_ephemeral(&derived, make_local("key-b"), store_b.clone())
                .await
                .unwrap(),
        );

        let addr_b = exchange_b.local_addr().unwrap();
        exchange_a.send_hello(addr_b, "dht").await.unwrap();

        let mut buf = [0u8; MAX_UDP_PAYLOAD];
        let (len, from) = exchange_b.socket.recv_from(&mut buf).await.unwrap();
        exchange_b.handle_datagram(&buf[..len], from).await;

        let learned = store_b.get("key-c").expect("B should learn about C transitively from A's HELLO");
        assert!(learned.discovered_via.contains("dht-transitive"));
    }
}
