//! Top-level wiring and lifecycle (`spec.md` §5, §9). Owns every long-running
//! loop behind its own `CancellationToken`, joined in a single `JoinSet` so a
//! graceful shutdown can broadcast GOODBYE before every task is asked to
//! stop, mirroring the teacher's `#[tokio::main]` + `pretty_env_logger::init`
//! entry point in `server/src/main.rs` scaled up to multiple cooperating
//! loops instead of one axum server.

use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use wireguard_control::{Backend, InterfaceName, Key};

use crate::{
    config::Config,
    dht::{self, DhtDiscovery},
    error::MeshError,
    gossip::MeshGossip,
    keys::{self, DerivedKeys},
    lan::LanDiscovery,
    peer_exchange::PeerExchange,
    peer_store::{PeerEvent, PeerStore},
    rendezvous::RendezvousEngine,
    types::{LocalNode, NatType},
    wg_apply::WgConfigurator,
};

const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Orchestrator {
    config: Config,
    keys: DerivedKeys,
    local: Arc<Mutex<LocalNode>>,
    store: PeerStore,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    exchange: Option<Arc<PeerExchange>>,
    rendezvous: Option<Arc<RendezvousEngine>>,
    wg: Option<Arc<WgConfigurator>>,
    private_key: Key,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        private_key: Key,
        public_key: String,
        mesh_ipv4: std::net::IpAddr,
        mesh_ipv6: std::net::IpAddr,
    ) -> Result<Self, MeshError> {
        let secret = config.resolve_secret()?;
        let keys = keys::derive(&secret)?;

        let local = Arc::new(Mutex::new(LocalNode {
            public_key,
            hostname: config.node.hostname.clone(),
            mesh_ipv4,
            mesh_ipv6,
            introducer: config.node.introducer,
            routable_networks: config.node.routable_networks.clone(),
            nat_type: NatType::Unknown,
            endpoint: None,
        }));

        Ok(Self {
            config,
            keys,
            local,
            store: PeerStore::new(),
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            exchange: None,
            rendezvous: None,
            wg: None,
            private_key,
        })
    }

    pub fn peer_store(&self) -> PeerStore {
        self.store.clone()
    }

    /// The WireGuard data-plane endpoint we currently advertise, if any has
    /// been learned via STUN or peer reflection (`spec.md` §9).
    pub fn get_endpoint(&self) -> Option<std::net::SocketAddr> {
        self.local.lock().endpoint
    }

    /// Overrides the advertised endpoint, e.g. after a manual STUN probe or
    /// on initial configuration of a static port-forward.
    pub fn set_endpoint(&self, endpoint: std::net::SocketAddr) {
        self.local.lock().endpoint = Some(endpoint);
    }

    /// Spawns every discovery/exchange loop and returns once they're all
    /// running; call `shutdown()` to stop them.
    pub async fn run(&mut self) -> Result<(), MeshError> {
        let exchange = Arc::new(
            PeerExchange::bind_with_wg_port(
                &self.keys,
                self.local.clone(),
                self.store.clone(),
                self.config.node.wg_listen_port,
                self.config.discovery.active_timeout_secs,
            )
            .await
            .map_err(MeshError::Io)?,
        );

        self.exchange = Some(exchange.clone());

        let interface: InterfaceName = self
            .config
            .node
            .interface
            .parse()
            .map_err(|_| MeshError::WireGuard(format!("invalid interface name {}", self.config.node.interface)))?;
        let wg = Arc::new(WgConfigurator::new(interface, Backend::default(), self.keys.psk));
        wg.set_private_key_and_port(self.private_key.clone(), self.config.node.wg_listen_port)?;
        self.wg = Some(wg.clone());

        let mut peer_events = self.store.subscribe();
        let apply_cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = apply_cancel.cancelled() => break,
                    event = peer_events.recv() => {
                        match event {
                            Some(PeerEvent::Discovered(peer)) | Some(PeerEvent::Updated(peer)) => {
                                if let Err(e) = wg.apply(&peer) {
                                    log::warn!("failed to apply peer {} to wireguard: {e}", peer.public_key);
                                }
                            }
                            Some(PeerEvent::Expired(pubkey)) => {
                                if let Err(e) = wg.remove(&pubkey) {
                                    log::debug!("failed to remove expired peer {pubkey} from wireguard: {e}");
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        self.tasks
            .spawn(exchange.clone().run_receive_loop(self.cancel.clone()));
        self.tasks
            .spawn(exchange.clone().run_retransmit_loop(self.cancel.clone()));

        if !self.config.node.disable_punching {
            let rendezvous_rx = exchange.install_rendezvous_channel();
            let engine = Arc::new(RendezvousEngine::with_wg_configurator(
                exchange.clone(),
                self.store.clone(),
                self.local.clone(),
                self.keys.gossip_port,
                self.config.discovery.active_timeout_secs,
                self.config.node.disable_ipv6,
                self.wg.clone(),
            ));
            self.rendezvous = Some(engine.clone());
            self.tasks.spawn(engine.run(rendezvous_rx, self.cancel.clone()));
        }

        if !self.config.node.disable_ipv6 {
            if let Some(ipv6_endpoint) = crate::stun::discover_ipv6_endpoint(self.config.node.wg_listen_port) {
                // A routable IPv6 endpoint bypasses NAT traversal entirely
                // (`spec.md` §4.3), so it always wins over a STUN-learned
                // mapping once discovered.
                self.local.lock().endpoint = Some(ipv6_endpoint);
            }
        }

        if self.config.discovery.dht_discovery {
            let secret = self.config.resolve_secret()?;
            dht::ensure_state_dir(&self.config.node.state_dir).map_err(MeshError::Io)?;
            let routing_table_path = Some(dht::default_routing_table_path(
                &self.config.node.state_dir,
                &self.config.node.interface,
                &self.keys.network_id,
            ));
            let dht = DhtDiscovery::new(
                secret.as_bytes(),
                exchange.local_addr().map_err(MeshError::Io)?.port(),
                routing_table_path,
                &self.config.discovery.dht_bootstrap_nodes,
            )?;
            self.tasks
                .spawn(dht.run(exchange.clone(), self.store.clone(), self.cancel.clone()));

            let stun_servers = self.config.stun_socket_addrs();
            if stun_servers.len() >= 2 {
                let stun_socket = Arc::new(
                    tokio::net::UdpSocket::bind(("0.0.0.0", 0))
                        .await
                        .map_err(MeshError::Io)?,
                );
                self.tasks.spawn(dht::run_stun_refresh_loop(
                    exchange.clone(),
                    stun_socket,
                    stun_servers,
                    self.config.node.wg_listen_port,
                    self.config.node.disable_ipv6,
                    self.cancel.clone(),
                ));
            }
        }

        if self.config.discovery.lan_discovery {
            let lan = LanDiscovery::bind(&self.keys, exchange.clone()).map_err(MeshError::Io)?;
            self.tasks.spawn(lan.run(self.cancel.clone()));
        }

        if self.config.discovery.enable_gossip {
            let gossip = MeshGossip::new(
                exchange.clone(),
                self.store.clone(),
                self.config.discovery.active_timeout_secs,
                self.keys.gossip_port,
            );
            self.tasks.spawn(gossip.run(self.cancel.clone()));
        }

        let store_for_sweep = self.store.clone();
        let active_timeout = self.config.discovery.active_timeout_secs;
        let sweep_cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(STALE_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = store_for_sweep.expire_stale(active_timeout);
                        if !expired.is_empty() {
                            log::debug!("expired {} stale peers", expired.len());
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Broadcasts GOODBYE to every currently-known active peer's control
    /// endpoint (`spec.md` §5 — the WireGuard data port has no listener for
    /// control-channel traffic), then cancels every loop and waits for them
    /// to finish. GOODBYE itself carries no cryptographic proof of intent
    /// beyond the envelope's own authentication, so receivers corroborate it
    /// against the peer store's own staleness sweep rather than trusting it
    /// unconditionally (§7).
    pub async fn shutdown(mut self) {
        if let Some(exchange) = &self.exchange {
            let active_timeout = self.config.discovery.active_timeout_secs;
            for peer in self.store.active(active_timeout) {
                if let Some(control_endpoint) = peer.control_endpoint {
                    if exchange.send_goodbye(control_endpoint).await.is_err() {
                        log::debug!("goodbye to {control_endpoint} failed during shutdown");
                    }
                }
            }
        }
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
    }

    pub fn get_nat_type(&self) -> NatType {
        self.local.lock().nat_type
    }
}
