//! Zero-coordination peer discovery and NAT traversal for WireGuard meshes.
//!
//! Every network parameter a mesh needs — its DHT infohash, its gossip key,
//! its mesh subnet and multicast group — is derived deterministically from a
//! single shared secret (`keys`). Peers find each other over BEP-5 DHT
//! (`dht`), LAN multicast (`lan`), and gossip over the mesh itself
//! (`gossip`), authenticate every message with an AEAD envelope
//! (`envelope`), and punch through NAT via STUN (`stun`) and a synchronized
//! three-party rendezvous (`rendezvous`). `orchestrator` wires all of it
//! together behind cancellable tasks.

pub mod config;
pub mod dht;
pub mod envelope;
pub mod error;
pub mod gossip;
pub mod keys;
pub mod lan;
pub mod orchestrator;
pub mod peer_exchange;
pub mod peer_store;
pub mod rendezvous;
pub mod stun;
pub mod types;
pub mod wg_apply;

pub use config::Config;
pub use error::MeshError;
pub use keys::DerivedKeys;
pub use orchestrator::Orchestrator;
pub use peer_store::{PeerEvent, PeerStore};
pub use rendezvous::RendezvousEngine;
pub use types::{LocalNode, NatType, PeerInfo};
pub use wg_apply::WgConfigurator;
