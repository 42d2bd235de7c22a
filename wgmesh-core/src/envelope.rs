//! Authenticated envelope protocol (`spec.md` §4.2): AES-256-GCM sealing with
//! a random 12-byte nonce, a replay guard on the embedded timestamp, and
//! structural payload validation. A single decryption or parsing failure is
//! always silent — traffic foreign to this mesh is indistinguishable from
//! garbage and must never surface above `debug` (§7).

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

use crate::types::{
    now_unix, GoodbyePayload, MessageType, PeerAnnouncement, RendezvousOffer, RendezvousStart,
    PROTOCOL_VERSION,
};

pub const NONCE_LEN: usize = 12;
pub const REPLAY_WINDOW: Duration = Duration::from_secs(10 * 60);
/// GOODBYE mutates the peer store destructively, so it gets a tighter replay
/// window than other messages (`spec.md` §7).
pub const GOODBYE_REPLAY_WINDOW: Duration = Duration::from_secs(60);
const MAX_HOSTNAME_LEN: usize = 253;
const MAX_ROUTABLE_NETWORKS: usize = 100;
const MAX_KNOWN_PEERS: usize = 1000;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("ciphertext too short or malformed")]
    Malformed,
    #[error("nonce must be exactly {NONCE_LEN} bytes")]
    BadNonceLength,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("payload is not valid JSON")]
    InvalidPayload,
    #[error("unrecognized protocol version")]
    WrongProtocol,
    #[error("timestamp outside the replay window")]
    Replay,
    #[error("payload failed structural validation: {0}")]
    InvalidFields(&'static str),
    #[error("frame serialization failed")]
    Serialize,
}

#[derive(Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: MessageType,
    nonce: String,
    ciphertext: String,
}

/// Any payload carried inside an envelope must expose `protocol`/`timestamp`
/// at the top level (`spec.md` §6) so `open()` can apply the replay guard
/// uniformly before the caller even looks at the typed fields.
pub trait EnvelopePayload: Serialize + DeserializeOwned {
    fn protocol(&self) -> &str;
    fn timestamp(&self) -> u64;

    /// Structural field validation beyond protocol/timestamp (`spec.md`
    /// §4.2). The default accepts everything; payload types that embed
    /// pubkeys/endpoints/known-peers override this.
    fn validate_fields(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

pub fn seal<P: EnvelopePayload>(
    kind: MessageType,
    payload: &P,
    key: &[u8; 32],
) -> Result<Vec<u8>, EnvelopeError> {
    let plaintext = serde_json::to_vec(payload).map_err(|_| EnvelopeError::Serialize)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| EnvelopeError::Serialize)?;

    let frame = Frame {
        kind,
        nonce: BASE64.encode(nonce_bytes),
        ciphertext: BASE64.encode(ciphertext),
    };
    serde_json::to_vec(&frame).map_err(|_| EnvelopeError::Serialize)
}

/// Decrypts and validates a frame, returning the message type and raw JSON
/// payload bytes. The caller deserializes into the concrete payload type it
/// expects for `kind` and must still call `validate::<P>` on it.
pub fn open_raw(frame_bytes: &[u8], key: &[u8; 32]) -> Result<(MessageType, Vec<u8>), EnvelopeError> {
    let frame: Frame = serde_json::from_slice(frame_bytes).map_err(|_| EnvelopeError::Malformed)?;

    let nonce_bytes = BASE64.decode(&frame.nonce).map_err(|_| EnvelopeError::Malformed)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(EnvelopeError::BadNonceLength);
    }
    let ciphertext = BASE64.decode(&frame.ciphertext).map_err(|_| EnvelopeError::Malformed)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|_| EnvelopeError::DecryptionFailed)?;

    Ok((frame.kind, plaintext))
}

/// Full open: decrypt, deserialize into `P`, and apply the replay guard plus
/// field validation. Returns the validated payload. Uses the general
/// ±10 minute replay window; GOODBYE uses the tighter `±60s` window via
/// `open_with_window` since its effect (peer removal) is destructive.
pub fn open<P: EnvelopePayload>(frame_bytes: &[u8], key: &[u8; 32]) -> Result<(MessageType, P), EnvelopeError> {
    open_with_window(frame_bytes, key, REPLAY_WINDOW)
}

pub fn open_with_window<P: EnvelopePayload>(
    frame_bytes: &[u8],
    key: &[u8; 32],
    window: Duration,
) -> Result<(MessageType, P), EnvelopeError> {
    let (kind, plaintext) = open_raw(frame_bytes, key)?;
    let payload: P = serde_json::from_slice(&plaintext).map_err(|_| EnvelopeError::InvalidPayload)?;

    if payload.protocol() != PROTOCOL_VERSION {
        return Err(EnvelopeError::WrongProtocol);
    }

    let now = now_unix();
    let ts = payload.timestamp();
    let window_secs = window.as_secs();
    let too_old = now.saturating_sub(ts) > window_secs;
    let too_new = ts.saturating_sub(now) > window_secs;
    if too_old || too_new {
        return Err(EnvelopeError::Replay);
    }

    payload
        .validate_fields()
        .map_err(EnvelopeError::InvalidFields)?;

    Ok((kind, payload))
}

/// Shared structural checks for any payload embedding a pubkey / mesh IP /
/// WG endpoint / hostname / routable-networks / known-peers combination
/// (`spec.md` §4.2's validation bullet list).
pub fn validate_wg_pubkey(pubkey: &str) -> Result<(), &'static str> {
    let decoded = BASE64.decode(pubkey).map_err(|_| "wg_pubkey is not valid base64")?;
    if decoded.len() != 32 {
        return Err("wg_pubkey must decode to exactly 32 bytes");
    }
    Ok(())
}

pub fn validate_ip(s: &str) -> Result<(), &'static str> {
    s.parse::<IpAddr>().map(|_| ()).map_err(|_| "invalid IP address")
}

pub fn validate_endpoint(s: &str) -> Result<(), &'static str> {
    let (host, port) = s.rsplit_once(':').ok_or("endpoint must be host:port")?;
    let port: u16 = port.parse().map_err(|_| "endpoint port must be numeric")?;
    if port == 0 {
        return Err("endpoint port must be in [1, 65535]");
    }
    host.parse::<IpAddr>().map_err(|_| "endpoint host must be a valid IP")?;
    Ok(())
}

pub fn validate_hostname(hostname: &str) -> Result<(), &'static str> {
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err("hostname exceeds 253 bytes");
    }
    if !hostname.bytes().all(|b| (0x20..0x7f).contains(&b)) {
        return Err("hostname must be printable ASCII");
    }
    Ok(())
}

pub fn validate_routable_networks(networks: &[String]) -> Result<(), &'static str> {
    if networks.len() > MAX_ROUTABLE_NETWORKS {
        return Err("too many routable networks");
    }
    for network in networks {
        network
            .parse::<ipnet::IpNet>()
            .map_err(|_| "invalid CIDR in routable_networks")?;
    }
    Ok(())
}

pub fn validate_known_peers_len(len: usize) -> Result<(), &'static str> {
    if len > MAX_KNOWN_PEERS {
        return Err("known_peers exceeds 1000 entries");
    }
    Ok(())
}

impl EnvelopePayload for PeerAnnouncement {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn validate_fields(&self) -> Result<(), &'static str> {
        validate_wg_pubkey(&self.wg_pubkey)?;
        validate_ip(&self.mesh_ip.to_string())?;
        validate_endpoint(&self.wg_endpoint)?;
        if let Some(hostname) = &self.hostname {
            validate_hostname(hostname)?;
        }
        if let Some(networks) = &self.routable_networks {
            validate_routable_networks(networks)?;
        }
        if let Some(known) = &self.known_peers {
            validate_known_peers_len(known.len())?;
        }
        Ok(())
    }
}

impl EnvelopePayload for GoodbyePayload {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn validate_fields(&self) -> Result<(), &'static str> {
        validate_wg_pubkey(&self.wg_pubkey)
    }
}

impl EnvelopePayload for RendezvousOffer {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn validate_fields(&self) -> Result<(), &'static str> {
        validate_wg_pubkey(&self.from_pubkey)?;
        validate_wg_pubkey(&self.target_pubkey)?;
        if self.candidates.len() > MAX_ROUTABLE_NETWORKS {
            return Err("too many rendezvous candidates");
        }
        for candidate in &self.candidates {
            validate_endpoint(candidate)?;
        }
        Ok(())
    }
}

impl EnvelopePayload for RendezvousStart {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn validate_fields(&self) -> Result<(), &'static str> {
        validate_wg_pubkey(&self.peer_pubkey)?;
        validate_wg_pubkey(&self.introducer_key)?;
        for candidate in &self.peer_candidates {
            validate_endpoint(candidate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_announcement() -> PeerAnnouncement {
        PeerAnnouncement {
            protocol: PROTOCOL_VERSION.into(),
            wg_pubkey: BASE64.encode([7u8; 32]),
            hostname: Some("node-a".into()),
            mesh_ip: "10.1.2.3".parse().unwrap(),
            mesh_ipv6: None,
            wg_endpoint: "203.0.113.1:51820".into(),
            introducer: Some(true),
            routable_networks: None,
            timestamp: now_unix(),
            known_peers: None,
            observed_endpoint: Some("198.51.100.7:54321".into()),
            nat_type: None,
        }
    }

    #[test]
    fn round_trip_preserves_fields() {
        let key = [1u8; 32];
        let payload = sample_announcement();
        let sealed = seal(MessageType::Hello, &payload, &key).unwrap();
        let (kind, opened): (MessageType, PeerAnnouncement) = open(&sealed, &key).unwrap();
        assert_eq!(kind, MessageType::Hello);
        assert_eq!(opened.wg_pubkey, payload.wg_pubkey);
        assert_eq!(opened.observed_endpoint, payload.observed_endpoint);
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let key = [1u8; 32];
        let mut payload = sample_announcement();
        payload.timestamp = now_unix() - 11 * 60;
        let sealed = seal(MessageType::Hello, &payload, &key).unwrap();
        let result: Result<(MessageType, PeerAnnouncement), _> = open(&sealed, &key);
        assert!(matches!(result, Err(EnvelopeError::Replay)));
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let key = [1u8; 32];
        let mut payload = sample_announcement();
        payload.timestamp = now_unix() + 11 * 60;
        let sealed = seal(MessageType::Hello, &payload, &key).unwrap();
        let result: Result<(MessageType, PeerAnnouncement), _> = open(&sealed, &key);
        assert!(matches!(result, Err(EnvelopeError::Replay)));
    }

    #[test]
    fn wrong_key_fails_silently() {
        let key_a = [1u8; 32];
        let key_b = [2u8; 32];
        let payload = sample_announcement();
        let sealed = seal(MessageType::Hello, &payload, &key_a).unwrap();
        let result: Result<(MessageType, PeerAnnouncement), _> = open(&sealed, &key_b);
        assert!(matches!(result, Err(EnvelopeError::DecryptionFailed)));
    }

    #[test]
    fn wrong_protocol_is_rejected() {
        let key = [1u8; 32];
        let mut payload = sample_announcement();
        payload.protocol = "some-other-mesh-v1".into();
        let sealed = seal(MessageType::Hello, &payload, &key).unwrap();
        let result: Result<(MessageType, PeerAnnouncement), _> = open(&sealed, &key);
        assert!(matches!(result, Err(EnvelopeError::WrongProtocol)));
    }
}
