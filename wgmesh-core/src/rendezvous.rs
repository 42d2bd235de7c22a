//! Rendezvous engine (`spec.md` §4.6): deterministic pair-scheduled
//! synchronized punch windows, introducer selection, the three-party
//! handshake, and exponential backoff for failed pairs.

use fnv::FnvHasher;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    hash::Hasher,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    envelope,
    peer_exchange::PeerExchange,
    peer_store::{PeerEvent, PeerStore},
    types::{now_unix, LocalNode, MessageType, PeerInfo, RendezvousOffer, RendezvousStart, PROTOCOL_VERSION},
    wg_apply::WgConfigurator,
};

/// `spec.md` §4.6: clamped to `[RendezvousMinBackoff, RendezvousMaxBackoff]` ≈ 3s–30s.
const MIN_BACKOFF: Duration = Duration::from_secs(3);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const BACKOFF_MULTIPLIER: u32 = 2;

/// Spec defaults (`spec.md` §4.6): a ~20s synchronized window divided into
/// ~4s phases, a ~1.2s lead time for the introducer's `start_at`, a ~20s
/// session TTL, and a ~15s per-pair punch cooldown.
const RENDEZVOUS_WINDOW_SECS: u64 = 20;
const RENDEZVOUS_PHASE_SECS: u64 = 4;
const RENDEZVOUS_START_LEAD_TIME: Duration = Duration::from_millis(1200);
const RENDEZVOUS_SESSION_TTL: Duration = Duration::from_secs(20);
const RENDEZVOUS_PUNCH_COOLDOWN: Duration = Duration::from_secs(15);
const MAX_INTRODUCERS: usize = 3;
/// A peer is eligible as an "automatic" introducer if it has a recent
/// WireGuard handshake (read through `wg_apply::WgConfigurator`, `spec.md`
/// §4.6, §6). When no handshake has been recorded yet — or the engine was
/// built without a configurator handle — recent direct contact serves as
/// the fallback signal.
/// Fallback freshness proxy used when no `wg_configurator` handle is wired
/// in (e.g. in unit tests building the engine directly), or when a given
/// peer has no recorded WireGuard handshake yet.
const AUTOMATIC_INTRODUCER_FRESHNESS_SECS: u64 = 120;
const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Deterministic per-pair identifier, order-independent so either side
/// computes the same value: `FNV-64a(min(A,B) || 0x00 || max(A,B))`
/// (`spec.md` invariant 5, §4.6's scheduling formula). Hashed via
/// `Hasher::write` directly over the raw bytes rather than the derived
/// `Hash` impls on `str`, which inject their own length terminators and
/// wouldn't reproduce the literal byte formula.
pub fn pair_id(a_pubkey: &str, b_pubkey: &str) -> u64 {
    let (lo, hi) = if a_pubkey <= b_pubkey {
        (a_pubkey, b_pubkey)
    } else {
        (b_pubkey, a_pubkey)
    };
    let mut hasher = FnvHasher::default();
    hasher.write(lo.as_bytes());
    hasher.write(&[0u8]);
    hasher.write(hi.as_bytes());
    hasher.finish()
}

/// The synchronized punch window a pair should next attempt, expressed as
/// seconds-since-epoch: both sides compute `pair_id mod window_secs` as a
/// fixed phase offset, then find the next occurrence of that phase
/// (`spec.md` §4.6).
pub fn next_punch_window(pair_id: u64, window_secs: u64, now_unix: u64) -> u64 {
    let phase = pair_id % window_secs;
    let current_window_start = (now_unix / window_secs) * window_secs;
    let candidate = current_window_start + phase;
    if candidate > now_unix {
        candidate
    } else {
        candidate + window_secs
    }
}

/// Deterministically picks an introducer from the set of known, active
/// introducer peers for a given pair, so both sides converge on the same
/// choice without communicating first (`spec.md` §4.6's introducer
/// selection). Filters out the pair's own two endpoints, since a peer can't
/// introduce itself.
pub fn select_introducer<'a>(
    introducers: &'a [PeerInfo],
    pair_id: u64,
    exclude: &[&str],
) -> Option<&'a PeerInfo> {
    let mut candidates: Vec<&PeerInfo> = introducers
        .iter()
        .filter(|p| !exclude.contains(&p.public_key.as_str()))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(|a, b| a.public_key.cmp(&b.public_key));
    let index = (pair_id as usize) % candidates.len();
    Some(candidates[index])
}

/// Full introducer candidate filter + selection from `spec.md` §4.6: drop
/// ourselves, the target, peers without DHT reachability or a control
/// endpoint, non-public endpoints, and (when IPv6 is disabled) IPv6-only
/// candidates; sort explicit introducers first then by pubkey; pick up to
/// `MAX_INTRODUCERS` starting from a deterministic `pair_id`-derived offset.
pub fn select_introducers<'a>(
    candidates: &'a [PeerInfo],
    pair_id: u64,
    self_pubkey: &str,
    target_pubkey: &str,
    disable_ipv6: bool,
) -> Vec<&'a PeerInfo> {
    let mut eligible: Vec<&PeerInfo> = candidates
        .iter()
        .filter(|p| p.public_key != self_pubkey && p.public_key != target_pubkey)
        .filter(|p| p.control_endpoint.is_some())
        .filter(|p| p.control_endpoint.map(|a| is_public(a)).unwrap_or(false))
        .filter(|p| !(disable_ipv6 && matches!(p.control_endpoint, Some(SocketAddr::V6(_)))))
        .filter(|p| p.introducer || p.discovered_via.iter().any(|via| via.starts_with("dht")))
        .collect();

    eligible.sort_by(|a, b| match (b.introducer, a.introducer) {
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        _ => a.public_key.cmp(&b.public_key),
    });

    if eligible.is_empty() {
        return Vec::new();
    }
    let take = MAX_INTRODUCERS.min(eligible.len());
    let offset = (pair_id as usize) % eligible.len();
    eligible.into_iter().cycle().skip(offset).take(take).collect()
}

fn is_public(addr: SocketAddr) -> bool {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => {
            !(v4.is_loopback() || v4.is_link_local() || v4.is_private() || v4.is_unspecified() || v4.is_broadcast())
        }
        std::net::IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            let is_link_local = (seg0 & 0xffc0) == 0xfe80;
            let is_unique_local = (seg0 & 0xfe00) == 0xfc00;
            !(v6.is_loopback() || v6.is_unspecified() || is_link_local || is_unique_local)
        }
    }
}

/// Tracks retry state for one pair's rendezvous attempts: exponential
/// backoff clamped to `[MIN_BACKOFF, MAX_BACKOFF]`, reset on success.
#[derive(Clone, Debug)]
pub struct BackoffState {
    pub current: Duration,
    pub failures: u32,
    pub attempted_at: Option<tokio::time::Instant>,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            current: MIN_BACKOFF,
            failures: 0,
            attempted_at: None,
        }
    }
}

impl BackoffState {
    pub fn on_failure(&mut self) -> Duration {
        self.failures += 1;
        let next_millis = self.current.as_millis().saturating_mul(BACKOFF_MULTIPLIER as u128);
        self.current = Duration::from_millis(next_millis.min(MAX_BACKOFF.as_millis()) as u64).max(MIN_BACKOFF);
        self.attempted_at = Some(tokio::time::Instant::now());
        self.current
    }

    pub fn on_success(&mut self) {
        self.current = MIN_BACKOFF;
        self.failures = 0;
        self.attempted_at = None;
    }

    /// A rendezvous is never attempted while its backoff is in effect
    /// (`spec.md` §4.6).
    pub fn attempt_allowed(&self) -> bool {
        match self.attempted_at {
            None => true,
            Some(at) => at.elapsed() >= self.current,
        }
    }
}

/// Registry of in-flight pair backoff state, keyed by `pair_id`.
#[derive(Default)]
pub struct BackoffTable {
    entries: HashMap<u64, BackoffState>,
}

impl BackoffTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, pair: u64) -> Duration {
        self.entries.entry(pair).or_default().on_failure()
    }

    pub fn record_success(&mut self, pair: u64) {
        if let Some(state) = self.entries.get_mut(&pair) {
            state.on_success();
        }
    }

    pub fn current_backoff(&self, pair: u64) -> Duration {
        self.entries.get(&pair).map(|s| s.current).unwrap_or(MIN_BACKOFF)
    }

    pub fn attempt_allowed(&self, pair: u64) -> bool {
        self.entries.get(&pair).map(|s| s.attempt_allowed()).unwrap_or(true)
    }
}

/// Three-party handshake state machine from the introducer's perspective:
/// having received a `RendezvousOffer` from one side, it pairs it with the
/// other side's known candidates and hands both a synchronized
/// `RendezvousStart`.
pub fn build_start_payloads(
    pair: u64,
    introducer_key: &str,
    peer_a: (&str, &[SocketAddr]),
    peer_b: (&str, &[SocketAddr]),
    start_at_unix_ms: u64,
    protocol: &str,
    now_unix_secs: u64,
) -> (crate::types::RendezvousStart, crate::types::RendezvousStart) {
    let (a_key, a_candidates) = peer_a;
    let (b_key, b_candidates) = peer_b;

    let to_a = crate::types::RendezvousStart {
        protocol: protocol.into(),
        timestamp: now_unix_secs,
        pair_id: pair,
        peer_pubkey: b_key.into(),
        peer_candidates: b_candidates.iter().map(|a| a.to_string()).collect(),
        start_at_unix_ms,
        introducer_key: introducer_key.into(),
    };
    let to_b = crate::types::RendezvousStart {
        protocol: protocol.into(),
        timestamp: now_unix_secs,
        pair_id: pair,
        peer_pubkey: a_key.into(),
        peer_candidates: a_candidates.iter().map(|a| a.to_string()).collect(),
        start_at_unix_ms,
        introducer_key: introducer_key.into(),
    };
    (to_a, to_b)
}

struct PendingIntroducerSession {
    /// Candidates offered so far, keyed by the offering peer's pubkey.
    candidates: HashMap<String, Vec<SocketAddr>>,
    created_at: tokio::time::Instant,
}

/// Drives the rendezvous protocol end to end: reacts to new/updated peers by
/// attempting a punch, plays introducer for offers addressed to us, and
/// carries out the synchronized punch once a `RendezvousStart` arrives
/// (`spec.md` §4.6).
pub struct RendezvousEngine {
    exchange: Arc<PeerExchange>,
    store: PeerStore,
    local: Arc<Mutex<LocalNode>>,
    gossip_port: u16,
    active_timeout_secs: u64,
    disable_ipv6: bool,
    backoff: Mutex<BackoffTable>,
    sessions: Mutex<HashMap<u64, PendingIntroducerSession>>,
    cooldowns: Mutex<HashMap<u64, tokio::time::Instant>>,
    wg: Option<Arc<WgConfigurator>>,
}

impl RendezvousEngine {
    pub fn new(
        exchange: Arc<PeerExchange>,
        store: PeerStore,
        local: Arc<Mutex<LocalNode>>,
        gossip_port: u16,
        active_timeout_secs: u64,
        disable_ipv6: bool,
    ) -> Self {
        Self::with_wg_configurator(exchange, store, local, gossip_port, active_timeout_secs, disable_ipv6, None)
    }

    /// Same as `new`, but also wired to the interface's real WireGuard
    /// handshake state for introducer-freshness decisions (`spec.md` §4.6).
    pub fn with_wg_configurator(
        exchange: Arc<PeerExchange>,
        store: PeerStore,
        local: Arc<Mutex<LocalNode>>,
        gossip_port: u16,
        active_timeout_secs: u64,
        disable_ipv6: bool,
        wg: Option<Arc<WgConfigurator>>,
    ) -> Self {
        Self {
            exchange,
            store,
            local,
            gossip_port,
            active_timeout_secs,
            disable_ipv6,
            backoff: Mutex::new(BackoffTable::new()),
            sessions: Mutex::new(HashMap::new()),
            wg,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    fn self_pubkey(&self) -> String {
        self.local.lock().public_key.clone()
    }

    fn pair_with(&self, target_pubkey: &str) -> u64 {
        pair_id(&self.self_pubkey(), target_pubkey)
    }

    /// True only inside this pair's ~`RENDEZVOUS_PHASE_SECS`-wide slot of the
    /// shared ~`RENDEZVOUS_WINDOW_SECS` window (`spec.md` §4.6's pair
    /// scheduling), so both sides attempt at the same moment without
    /// coordinating first.
    fn in_punch_window(&self, pair: u64) -> bool {
        let phase = pair % RENDEZVOUS_WINDOW_SECS;
        let pos = now_unix() % RENDEZVOUS_WINDOW_SECS;
        let delta = (pos + RENDEZVOUS_WINDOW_SECS - phase) % RENDEZVOUS_WINDOW_SECS;
        delta < RENDEZVOUS_PHASE_SECS
    }

    fn on_cooldown(&self, pair: u64) -> bool {
        self.cooldowns
            .lock()
            .get(&pair)
            .map(|t| t.elapsed() < RENDEZVOUS_PUNCH_COOLDOWN)
            .unwrap_or(false)
    }

    fn set_cooldown(&self, pair: u64) {
        self.cooldowns.lock().insert(pair, tokio::time::Instant::now());
    }

    fn gc_sessions(&self) {
        self.sessions.lock().retain(|_, s| s.created_at.elapsed() < RENDEZVOUS_SESSION_TTL);
        self.cooldowns.lock().retain(|_, t| t.elapsed() < RENDEZVOUS_PUNCH_COOLDOWN * 4);
    }

    /// Our own control-plane (gossip-port) candidate addresses to offer a
    /// target through an introducer: the IP we've learned is publicly
    /// reachable (via STUN or peer reflection), paired with our gossip port
    /// rather than the WG data port `LocalNode::endpoint` otherwise carries.
    fn my_control_candidates(&self) -> Vec<SocketAddr> {
        self.exchange
            .local_endpoint()
            .map(|e| vec![SocketAddr::new(e.ip(), self.gossip_port)])
            .unwrap_or_default()
    }

    /// Peers eligible as introducers for `target_pubkey`, built fresh from
    /// the store on every call since introducer fitness (freshness, known
    /// control endpoint) changes constantly (`spec.md` §4.6).
    fn eligible_introducers(&self, pair: u64, target_pubkey: &str) -> Vec<PeerInfo> {
        let self_pubkey = self.self_pubkey();
        let now = now_unix();
        let handshakes = self.wg.as_ref().and_then(|wg| wg.latest_handshakes().ok());
        let candidates: Vec<PeerInfo> = self
            .store
            .active(self.active_timeout_secs)
            .into_iter()
            .map(|mut p| {
                // Automatic introducer eligibility: a recent WireGuard
                // handshake if we can read one, else the direct-contact
                // proxy (see AUTOMATIC_INTRODUCER_FRESHNESS_SECS doc comment).
                let fresh = match handshakes.as_ref().and_then(|h| h.get(&p.public_key)) {
                    Some(handshake_secs) => now.saturating_sub(*handshake_secs) <= AUTOMATIC_INTRODUCER_FRESHNESS_SECS,
                    None => now.saturating_sub(p.last_seen_unix) <= AUTOMATIC_INTRODUCER_FRESHNESS_SECS,
                };
                if !p.introducer && fresh {
                    p.introducer = true;
                }
                p
            })
            .collect();
        select_introducers(&candidates, pair, &self_pubkey, target_pubkey, self.disable_ipv6)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Attempts a rendezvous with `target` if its pair is in its punch
    /// window, isn't cooling down, and isn't backed off. Sends
    /// `RendezvousOffer` to up to `MAX_INTRODUCERS` introducers, or falls
    /// back to a direct `ExchangeWithPeer` against the target's known
    /// control endpoint when no introducer is available.
    pub async fn try_rendezvous_for_peer(&self, target: &PeerInfo) {
        let self_pubkey = self.self_pubkey();
        if target.public_key == self_pubkey || target.public_key.is_empty() {
            return;
        }
        let pair = self.pair_with(&target.public_key);
        if !self.backoff.lock().attempt_allowed(pair) || !self.in_punch_window(pair) || self.on_cooldown(pair) {
            return;
        }

        let introducers = self.eligible_introducers(pair, &target.public_key);
        if introducers.is_empty() {
            if let Some(control) = target.control_endpoint {
                log::debug!("no introducer available for {}, trying direct exchange", target.public_key);
                if self.exchange.send_hello(control, "dht-rendezvous").await.is_err() {
                    self.backoff.lock().record_failure(pair);
                }
            }
            return;
        }

        let my_candidates = self.my_control_candidates();
        if my_candidates.is_empty() {
            log::debug!("no known control candidate to offer for pair with {}", target.public_key);
            return;
        }

        let offer = RendezvousOffer {
            protocol: PROTOCOL_VERSION.into(),
            timestamp: now_unix(),
            pair_id: pair,
            from_pubkey: self_pubkey,
            target_pubkey: target.public_key.clone(),
            candidates: my_candidates.iter().map(|a| a.to_string()).collect(),
            observed_addr: self.exchange.local_endpoint().map(|e| e.to_string()),
            introducer_key: None,
        };
        for introducer in &introducers {
            if let Some(addr) = introducer.control_endpoint {
                if self.exchange.send_sealed(MessageType::RendezvousOffer, &offer, addr).await.is_err() {
                    log::debug!("failed to send rendezvous offer to introducer {}", introducer.public_key);
                }
            }
        }
        self.set_cooldown(pair);
    }

    /// Introducer-side: records an offer, and either pairs it immediately
    /// with a previously-received offer for the other side of the same
    /// pair, or synthesizes the other side's candidate from what the store
    /// already knows about it (`spec.md` §4.6's "or when B's side can be
    /// synthesized from the store").
    async fn handle_offer(&self, data: &[u8]) {
        let Ok((_, offer)) = envelope::open::<RendezvousOffer>(data, &self.exchange.gossip_key()) else {
            return;
        };
        let candidates: Vec<SocketAddr> = offer.candidates.iter().filter_map(|c| c.parse().ok()).collect();
        if candidates.is_empty() {
            return;
        }
        let introducer_key = self.self_pubkey();

        let paired = {
            let mut sessions = self.sessions.lock();
            let session = sessions.entry(offer.pair_id).or_insert_with(|| PendingIntroducerSession {
                candidates: HashMap::new(),
                created_at: tokio::time::Instant::now(),
            });
            session.candidates.insert(offer.from_pubkey.clone(), candidates.clone());
            session.candidates.get(&offer.target_pubkey).cloned()
        };

        if let Some(other_candidates) = paired {
            self.sessions.lock().remove(&offer.pair_id);
            self.dispatch_start(
                offer.pair_id,
                &introducer_key,
                (&offer.from_pubkey, &candidates),
                (&offer.target_pubkey, &other_candidates),
            )
            .await;
            return;
        }

        if let Some(target_peer) = self.store.get(&offer.target_pubkey) {
            if let Some(control) = target_peer.control_endpoint {
                self.sessions.lock().remove(&offer.pair_id);
                self.dispatch_start(
                    offer.pair_id,
                    &introducer_key,
                    (&offer.from_pubkey, &candidates),
                    (&offer.target_pubkey, std::slice::from_ref(&control)),
                )
                .await;
            }
        }
    }

    async fn dispatch_start(&self, pair: u64, introducer_key: &str, a: (&str, &[SocketAddr]), b: (&str, &[SocketAddr])) {
        let start_at = now_unix() * 1000 + RENDEZVOUS_START_LEAD_TIME.as_millis() as u64;
        let (to_a, to_b) = build_start_payloads(pair, introducer_key, a, b, start_at, PROTOCOL_VERSION, now_unix());

        if let Some(&dest) = a.1.first() {
            if self.exchange.send_sealed(MessageType::RendezvousStart, &to_a, dest).await.is_err() {
                log::debug!("failed to send rendezvous start to {}", a.0);
            }
        }
        if let Some(&dest) = b.1.first() {
            if self.exchange.send_sealed(MessageType::RendezvousStart, &to_b, dest).await.is_err() {
                log::debug!("failed to send rendezvous start to {}", b.0);
            }
        }
    }

    /// Responder-side: waits until `start_at_unix_ms`, then initiates
    /// `ExchangeWithPeer` against each candidate in order (`spec.md` §4.6
    /// step 3).
    async fn handle_start(&self, data: &[u8]) {
        let Ok((_, start)) = envelope::open::<RendezvousStart>(data, &self.exchange.gossip_key()) else {
            return;
        };
        if self.on_cooldown(start.pair_id) {
            return;
        }
        self.set_cooldown(start.pair_id);

        let candidates: Vec<SocketAddr> = start.peer_candidates.iter().filter_map(|c| c.parse().ok()).collect();
        let exchange = self.exchange.clone();
        tokio::spawn(async move {
            let now_ms = now_unix().saturating_mul(1000);
            if start.start_at_unix_ms > now_ms {
                tokio::time::sleep(Duration::from_millis(start.start_at_unix_ms - now_ms)).await;
            }
            for candidate in candidates {
                if exchange.send_hello(candidate, "dht-rendezvous").await.is_err() {
                    log::debug!("punch attempt to {candidate} failed to send");
                }
            }
        });
    }

    /// Drives the engine until cancelled: dispatches rendezvous frames
    /// forwarded by `PeerExchange`, reacts to new/updated peers by
    /// attempting a punch, and periodically retries peers whose rendezvous
    /// hasn't succeeded recently while garbage-collecting expired
    /// introducer sessions (`spec.md` §4.6, §4.7's stale-handshake sweep).
    pub async fn run(
        self: Arc<Self>,
        mut rendezvous_rx: mpsc::Receiver<(SocketAddr, MessageType, Vec<u8>)>,
        cancel: CancellationToken,
    ) {
        let mut peer_events = self.store.subscribe();
        let mut stale_ticker = tokio::time::interval(STALE_CHECK_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rendezvous_rx.recv() => {
                    match frame {
                        Some((_from, MessageType::RendezvousOffer, data)) => self.handle_offer(&data).await,
                        Some((_from, MessageType::RendezvousStart, data)) => self.handle_start(&data).await,
                        Some(_) => {}
                        None => break,
                    }
                }
                event = peer_events.recv() => {
                    match event {
                        Some(PeerEvent::Discovered(peer)) | Some(PeerEvent::Updated(peer)) => {
                            self.try_rendezvous_for_peer(&peer).await;
                        }
                        Some(PeerEvent::Expired(_)) => {}
                        None => break,
                    }
                }
                _ = stale_ticker.tick() => {
                    self.gc_sessions();
                    for peer in self.store.active(self.active_timeout_secs) {
                        self.try_rendezvous_for_peer(&peer).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NatType;
    use std::collections::BTreeSet;

    fn peer(pubkey: &str, introducer: bool) -> PeerInfo {
        PeerInfo {
            public_key: pubkey.into(),
            hostname: None,
            mesh_ipv4: None,
            mesh_ipv6: None,
            endpoint: None,
            control_endpoint: None,
            introducer,
            nat_type: NatType::Unknown,
            routable_networks: Vec::new(),
            last_seen_unix: 0,
            discovered_via: BTreeSet::new(),
        }
    }

    #[test]
    fn pair_id_is_order_independent() {
        assert_eq!(pair_id("alice", "bob"), pair_id("bob", "alice"));
    }

    #[test]
    fn pair_id_matches_fnv_64a_of_concatenated_bytes() {
        // "alice" < "bob" lexicographically, so the formula's min/max are
        // already in argument order here.
        let mut expected = FnvHasher::default();
        expected.write(b"alice");
        expected.write(&[0u8]);
        expected.write(b"bob");
        assert_eq!(pair_id("alice", "bob"), expected.finish());
    }

    #[test]
    fn pair_id_differs_across_pubkey_pairs() {
        assert_ne!(pair_id("alice", "bob"), pair_id("alice", "carol"));
    }

    #[test]
    fn next_punch_window_is_in_the_future() {
        let pair = pair_id("alice", "bob");
        let now = 1_000_000u64;
        let window = next_punch_window(pair, 60, now);
        assert!(window > now);
        assert!(window - now <= 60);
    }

    #[test]
    fn next_punch_window_is_deterministic_for_same_inputs() {
        let pair = pair_id("alice", "bob");
        let a = next_punch_window(pair, 60, 1_000_000);
        let b = next_punch_window(pair, 60, 1_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn select_introducer_excludes_pair_members() {
        let introducers = vec![peer("alice", true), peer("bob", true), peer("carol", true)];
        let chosen = select_introducer(&introducers, 42, &["alice", "bob"]).unwrap();
        assert_eq!(chosen.public_key, "carol");
    }

    #[test]
    fn select_introducer_returns_none_when_exhausted() {
        let introducers = vec![peer("alice", true), peer("bob", true)];
        assert!(select_introducer(&introducers, 42, &["alice", "bob"]).is_none());
    }

    #[test]
    fn backoff_grows_and_clamps() {
        let mut state = BackoffState::default();
        let first = state.on_failure();
        assert!(first >= MIN_BACKOFF);
        for _ in 0..20 {
            state.on_failure();
        }
        assert!(state.current <= MAX_BACKOFF);
    }

    #[test]
    fn backoff_resets_on_success() {
        let mut state = BackoffState::default();
        state.on_failure();
        state.on_failure();
        assert!(state.current > MIN_BACKOFF);
        state.on_success();
        assert_eq!(state.current, MIN_BACKOFF);
        assert_eq!(state.failures, 0);
    }

    #[test]
    fn backoff_table_blocks_until_interval_elapses() {
        let mut table = BackoffTable::new();
        assert!(table.attempt_allowed(7));
        table.record_failure(7);
        assert!(!table.attempt_allowed(7));
        table.record_success(7);
        assert!(table.attempt_allowed(7));
    }

    fn peer_with_control(pubkey: &str, introducer: bool, addr: &str, via: &str) -> PeerInfo {
        let mut p = peer(pubkey, introducer);
        p.control_endpoint = Some(addr.parse().unwrap());
        p.discovered_via.insert(via.into());
        p
    }

    #[test]
    fn select_introducers_excludes_self_target_and_private_endpoints() {
        let candidates = vec![
            peer_with_control("self", true, "203.0.113.1:4000", "dht"),
            peer_with_control("target", true, "203.0.113.2:4000", "dht"),
            peer_with_control("private", true, "192.168.1.5:4000", "dht"),
            peer_with_control("good", true, "203.0.113.9:4000", "dht"),
        ];
        let chosen = select_introducers(&candidates, 1, "self", "target", false);
        let keys: Vec<&str> = chosen.iter().map(|p| p.public_key.as_str()).collect();
        assert_eq!(keys, vec!["good"]);
    }

    #[test]
    fn select_introducers_requires_introducer_flag_or_dht_discovery() {
        let candidates = vec![
            peer_with_control("no-flag", false, "203.0.113.9:4000", "peer_exchange"),
            peer_with_control("via-dht", false, "203.0.113.10:4000", "dht_v4"),
        ];
        let chosen = select_introducers(&candidates, 1, "self", "target", false);
        let keys: Vec<&str> = chosen.iter().map(|p| p.public_key.as_str()).collect();
        assert_eq!(keys, vec!["via-dht"]);
    }

    #[test]
    fn select_introducers_drops_ipv6_only_when_disabled() {
        let candidates = vec![peer_with_control("v6-only", true, "[2001:db8::1]:4000", "dht")];
        assert!(select_introducers(&candidates, 1, "self", "target", true).is_empty());
        assert_eq!(select_introducers(&candidates, 1, "self", "target", false).len(), 1);
    }

    #[test]
    fn select_introducers_caps_at_max_and_rotates_by_pair_id() {
        let candidates: Vec<PeerInfo> = (0..6)
            .map(|i| peer_with_control(&format!("node-{i}"), true, &format!("203.0.113.{}:4000", 10 + i), "dht"))
            .collect();
        let first = select_introducers(&candidates, 0, "self", "target", false);
        let second = select_introducers(&candidates, 1, "self", "target", false);
        assert_eq!(first.len(), MAX_INTRODUCERS);
        assert_eq!(second.len(), MAX_INTRODUCERS);
        assert_ne!(
            first.iter().map(|p| p.public_key.clone()).collect::<Vec<_>>(),
            second.iter().map(|p| p.public_key.clone()).collect::<Vec<_>>()
        );
    }
}
