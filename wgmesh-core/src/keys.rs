//! Deterministic derivation of every network parameter from the shared secret.
//!
//! Every field is pulled from HKDF-SHA256 with an empty salt and a per-field
//! info string; the info strings are the only source of domain separation
//! (see `spec.md` §4.1 — older revisions of the source this was distilled
//! from mixed up salt/info usage across fields, so this module treats
//! `salt = empty, info = domain string` as the one true contract).

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const MIN_SECRET_LEN: usize = 16;

const INFO_GOSSIP_KEY: &[u8] = b"wgmesh-gossip-v1";
const INFO_SUBNET: &[u8] = b"wgmesh-subnet-v1";
const INFO_IPV6_PREFIX: &[u8] = b"wgmesh-ipv6-prefix-v1";
const INFO_MULTICAST: &[u8] = b"wgmesh-mcast-v1";
const INFO_PSK: &[u8] = b"wgmesh-wg-psk-v1";
const INFO_GOSSIP_PORT: &[u8] = b"wgmesh-gossip-port-v1";
const INFO_MEMBERSHIP: &[u8] = b"wgmesh-membership-v1";
const INFO_EPOCH: &[u8] = b"wgmesh-epoch-v1";

const GOSSIP_PORT_BASE: u16 = 51821;
const GOSSIP_PORT_RANGE: u16 = 1000;

#[derive(Debug, Error)]
pub enum KeyDerivationError {
    #[error("shared secret must be at least {MIN_SECRET_LEN} bytes, got {0}")]
    SecretTooShort(usize),
    #[error("HKDF expand failed for field {0}")]
    HkdfExpand(&'static str),
}

/// All network parameters derived from the shared secret. Created once at
/// startup and never mutated for the life of the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedKeys {
    pub network_id: [u8; 20],
    pub gossip_key: [u8; 32],
    pub subnet: [u8; 2],
    pub mesh_prefix_v6: [u8; 8],
    pub multicast_id: [u8; 4],
    pub psk: [u8; 32],
    pub gossip_port: u16,
    pub rendezvous_id: [u8; 8],
    pub membership_key: [u8; 32],
    pub epoch_seed: [u8; 32],
}

fn hkdf_expand(secret: &[u8], info: &'static str, out: &mut [u8]) -> Result<(), KeyDerivationError> {
    let hk = Hkdf::<Sha256>::new(None, secret);
    hk.expand(info.as_bytes(), out)
        .map_err(|_| KeyDerivationError::HkdfExpand(info))
}

/// SHA-256(secret)[0..20], the base DHT infohash before hourly rotation.
fn network_id_base(secret: &[u8]) -> [u8; 20] {
    let digest = Sha256::digest(secret);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[..20]);
    out
}

pub fn derive(secret: &str) -> Result<DerivedKeys, KeyDerivationError> {
    derive_bytes(secret.as_bytes())
}

pub fn derive_bytes(secret: &[u8]) -> Result<DerivedKeys, KeyDerivationError> {
    if secret.len() < MIN_SECRET_LEN {
        return Err(KeyDerivationError::SecretTooShort(secret.len()));
    }

    let mut gossip_key = [0u8; 32];
    hkdf_expand(secret, "gossip-key", &mut gossip_key)?;

    let mut subnet = [0u8; 2];
    hkdf_expand(secret, "subnet", &mut subnet)?;

    let mut ipv6_tail = [0u8; 7];
    hkdf_expand(secret, "ipv6-prefix", &mut ipv6_tail)?;
    let mut mesh_prefix_v6 = [0u8; 8];
    mesh_prefix_v6[0] = 0xfd;
    mesh_prefix_v6[1..].copy_from_slice(&ipv6_tail);

    let mut multicast_id = [0u8; 4];
    hkdf_expand(secret, "multicast", &mut multicast_id)?;

    let mut psk = [0u8; 32];
    hkdf_expand(secret, "psk", &mut psk)?;

    let mut port_bytes = [0u8; 2];
    hkdf_expand(secret, "gossip-port", &mut port_bytes)?;
    let gossip_port = GOSSIP_PORT_BASE + (u16::from_be_bytes(port_bytes) % GOSSIP_PORT_RANGE);

    let mut membership_key = [0u8; 32];
    hkdf_expand(secret, "membership", &mut membership_key)?;

    let mut epoch_seed = [0u8; 32];
    hkdf_expand(secret, "epoch", &mut epoch_seed)?;

    let mut rendezvous_preimage = Vec::with_capacity(secret.len() + 2);
    rendezvous_preimage.extend_from_slice(secret);
    rendezvous_preimage.extend_from_slice(b"rv");
    let rendezvous_digest = Sha256::digest(&rendezvous_preimage);
    let mut rendezvous_id = [0u8; 8];
    rendezvous_id.copy_from_slice(&rendezvous_digest[..8]);

    Ok(DerivedKeys {
        network_id: network_id_base(secret),
        gossip_key,
        subnet,
        mesh_prefix_v6,
        multicast_id,
        psk,
        gossip_port,
        rendezvous_id,
        membership_key,
        epoch_seed,
    })
}

/// Hour-rotating infohash: `SHA-256(secret || "||" || floor(unix/3600))[0..20]`.
///
/// The DHT layer always announces/queries both the current and previous
/// hour's id during the transition window.
pub fn network_id_for_hour(secret: &[u8], hour: u64) -> [u8; 20] {
    let mut preimage = Vec::with_capacity(secret.len() + 2 + 20);
    preimage.extend_from_slice(secret);
    preimage.extend_from_slice(b"||");
    preimage.extend_from_slice(hour.to_string().as_bytes());
    let digest = Sha256::digest(&preimage);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[..20]);
    out
}

pub fn current_hour() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 3600
}

/// Returns `(current_hour_id, previous_hour_id)`, the pair the DHT layer
/// should always announce/query against.
pub fn rotating_network_ids(secret: &[u8]) -> ([u8; 20], [u8; 20]) {
    let hour = current_hour();
    (
        network_id_for_hour(secret, hour),
        network_id_for_hour(secret, hour.saturating_sub(1)),
    )
}

/// Deterministic mesh IPv4 third/fourth octet derivation for a given peer's
/// WireGuard public key. The external WG configurator combines this with
/// `subnet[0]` to build the full `10.x.y.z` address.
pub fn derive_mesh_ipv4_octets(wg_pubkey: &[u8], secret: &[u8], subnet: &[u8; 2]) -> (u8, u8) {
    let mut preimage = Vec::with_capacity(wg_pubkey.len() + secret.len());
    preimage.extend_from_slice(wg_pubkey);
    preimage.extend_from_slice(secret);
    let hash = Sha256::digest(&preimage);

    let third = hash[0] ^ subnet[1];
    let fourth = hash[1].clamp(1, 254);
    (third, fourth)
}

/// Derives the interface identifier half of a peer's mesh IPv6 address
/// (the /64 network half comes from `DerivedKeys::mesh_prefix_v6`).
pub fn derive_mesh_ipv6_iface_id(wg_pubkey: &[u8], secret: &[u8]) -> [u8; 8] {
    let mut preimage = Vec::with_capacity(wg_pubkey.len() + 1 + secret.len() + 6);
    preimage.extend_from_slice(wg_pubkey);
    preimage.push(b'|');
    preimage.extend_from_slice(secret);
    preimage.extend_from_slice(b"|ipv6");
    let digest = Sha256::digest(&preimage);

    let mut iface = [0u8; 8];
    iface.copy_from_slice(&digest[..8]);
    iface[0] = (iface[0] | 0x02) & 0xFE;
    if iface == [0u8; 8] {
        iface[7] = 0x01;
    }
    iface
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET_A: &str = "test-secret-that-is-long-enough";
    const SECRET_B: &str = "a-completely-different-secret!!";

    #[test]
    fn derive_is_deterministic() {
        let a = derive(SECRET_A).unwrap();
        let b = derive(SECRET_A).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_secrets_yield_distinct_material() {
        let a = derive(SECRET_A).unwrap();
        let b = derive(SECRET_B).unwrap();
        assert_ne!(a.network_id, b.network_id);
        assert_ne!(a.gossip_key, b.gossip_key);
        assert_ne!(a.membership_key, b.membership_key);
        assert_ne!(a.rendezvous_id, b.rendezvous_id);
    }

    #[test]
    fn gossip_port_in_range() {
        for secret in [SECRET_A, SECRET_B, "yet-another-shared-secret-here!"] {
            let keys = derive(secret).unwrap();
            assert!(keys.gossip_port >= 51821 && keys.gossip_port < 52821);
        }
    }

    #[test]
    fn secret_too_short_is_rejected() {
        assert!(matches!(
            derive("short"),
            Err(KeyDerivationError::SecretTooShort(5))
        ));
    }

    #[test]
    fn rendezvous_id_fixture() {
        let keys = derive(SECRET_A).unwrap();
        let mut preimage = SECRET_A.as_bytes().to_vec();
        preimage.extend_from_slice(b"rv");
        let expected = Sha256::digest(&preimage);
        assert_eq!(&keys.rendezvous_id[..], &expected[..8]);
    }

    #[test]
    fn mesh_ipv4_last_octet_in_range() {
        let secret = SECRET_A.as_bytes();
        let subnet = [0x12, 0x34];
        for i in 0u8..=255 {
            let pubkey = [i; 32];
            let (_third, fourth) = derive_mesh_ipv4_octets(&pubkey, secret, &subnet);
            assert!((1..=254).contains(&fourth));
        }
    }

    #[test]
    fn mesh_ipv4_third_octet_depends_on_subnet() {
        let secret = SECRET_A.as_bytes();
        let pubkey = [7u8; 32];
        let (third_a, _) = derive_mesh_ipv4_octets(&pubkey, secret, &[0x00, 0x01]);
        let (third_b, _) = derive_mesh_ipv4_octets(&pubkey, secret, &[0x00, 0x02]);
        assert_ne!(third_a, third_b);
    }

    #[test]
    fn mesh_ipv6_iface_id_is_locally_administered() {
        let iface = derive_mesh_ipv6_iface_id(b"some-pubkey-bytes", SECRET_A.as_bytes());
        assert_eq!(iface[0] & 0x01, 0); // multicast bit clear
        assert_eq!(iface[0] & 0x02, 0x02); // local bit set
    }

    #[test]
    fn rotating_ids_differ_hour_to_hour() {
        let secret = SECRET_A.as_bytes();
        let a = network_id_for_hour(secret, 1000);
        let b = network_id_for_hour(secret, 1001);
        assert_ne!(a, b);
        // but stable for the same hour
        assert_eq!(a, network_id_for_hour(secret, 1000));
    }
}
