//! Minimal RFC 5389 STUN binding client and NAT classification (`spec.md`
//! §4.3). Only the binding-request/binding-response subset is implemented —
//! no TURN, no long-term credentials. Style mirrors the raw byte-level DNS
//! packet construction in the teacher's public-IP client.

use rand::RngCore;
use std::{
    io::{Cursor, Error, ErrorKind, Read},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};
use thiserror::Error as ThisError;
use tokio::{net::UdpSocket, time::timeout};

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

const REQUEST_TIMEOUT: Duration = Duration::from_millis(750);

#[derive(Debug, ThisError)]
pub enum StunError {
    #[error("socket error: {0}")]
    Io(#[from] Error),
    #[error("request timed out")]
    Timeout,
    #[error("malformed STUN response: {0}")]
    Malformed(&'static str),
}

/// A resolved mapped address plus which server answered, so the caller can
/// compare two servers' answers for NAT classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingResult {
    pub mapped: SocketAddr,
}

/// Sends a single STUN binding request over `socket` to `server` and waits
/// for the response, retrying transport errors is the caller's job (the
/// peer-exchange retransmission loop already does this for peer-as-STUN
/// reflection; this function itself attempts exactly once).
pub async fn bind(socket: &UdpSocket, server: SocketAddr) -> Result<BindingResult, StunError> {
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);

    let request = encode_binding_request(&transaction_id);
    socket.send_to(&request, server).await?;

    let mut buf = [0u8; 1500];
    let (len, from) = timeout(REQUEST_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| StunError::Timeout)??;

    if from != server {
        return Err(StunError::Malformed("response from unexpected address"));
    }

    let mapped = decode_binding_response(&buf[..len], &transaction_id)?;
    Ok(BindingResult { mapped })
}

fn encode_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // message length, no attributes
    out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    out.extend_from_slice(transaction_id);
    out
}

fn decode_binding_response(response: &[u8], expected_txn: &[u8; 12]) -> Result<SocketAddr, StunError> {
    if response.len() < 20 {
        return Err(StunError::Malformed("response shorter than STUN header"));
    }

    let mut cursor = Cursor::new(response);
    let message_type = read_u16(&mut cursor)?;
    if message_type != BINDING_RESPONSE {
        return Err(StunError::Malformed("not a binding success response"));
    }
    let message_len = read_u16(&mut cursor)? as usize;
    let cookie = read_u32(&mut cursor)?;
    if cookie != MAGIC_COOKIE {
        return Err(StunError::Malformed("bad magic cookie"));
    }
    let mut txn = [0u8; 12];
    cursor.read_exact(&mut txn).map_err(|_| StunError::Malformed("truncated transaction id"))?;
    if &txn != expected_txn {
        return Err(StunError::Malformed("transaction id mismatch"));
    }

    if response.len() < 20 + message_len {
        return Err(StunError::Malformed("attributes shorter than declared length"));
    }

    let mut remaining = message_len;
    let mut xor_mapped: Option<SocketAddr> = None;
    let mut mapped: Option<SocketAddr> = None;

    while remaining >= 4 {
        let attr_type = read_u16(&mut cursor)?;
        let attr_len = read_u16(&mut cursor)? as usize;
        let padded = (attr_len + 3) & !3;
        if padded > remaining.saturating_sub(4) {
            return Err(StunError::Malformed("attribute length overruns message"));
        }

        let start = cursor.position() as usize;
        let attr_bytes = &response[start..start + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                xor_mapped = Some(decode_xor_mapped_address(attr_bytes, &txn)?);
            }
            ATTR_MAPPED_ADDRESS => {
                mapped = Some(decode_mapped_address(attr_bytes)?);
            }
            _ => {}
        }

        cursor.set_position((start + padded) as u64);
        remaining -= 4 + padded;
    }

    xor_mapped
        .or(mapped)
        .ok_or(StunError::Malformed("no mapped address attribute present"))
}

fn decode_xor_mapped_address(attr: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr, StunError> {
    if attr.len() < 4 {
        return Err(StunError::Malformed("XOR-MAPPED-ADDRESS too short"));
    }
    let family = attr[1];
    let xport = u16::from_be_bytes([attr[2], attr[3]]);
    let port = xport ^ ((MAGIC_COOKIE >> 16) as u16);

    match family {
        FAMILY_IPV4 => {
            if attr.len() < 8 {
                return Err(StunError::Malformed("XOR-MAPPED-ADDRESS v4 too short"));
            }
            let cookie_bytes = MAGIC_COOKIE.to_be_bytes();
            let octets = [
                attr[4] ^ cookie_bytes[0],
                attr[5] ^ cookie_bytes[1],
                attr[6] ^ cookie_bytes[2],
                attr[7] ^ cookie_bytes[3],
            ];
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        FAMILY_IPV6 => {
            if attr.len() < 20 {
                return Err(StunError::Malformed("XOR-MAPPED-ADDRESS v6 too short"));
            }
            let mut xor_key = [0u8; 16];
            xor_key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_key[4..].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = attr[4 + i] ^ xor_key[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(StunError::Malformed("unknown address family")),
    }
}

fn decode_mapped_address(attr: &[u8]) -> Result<SocketAddr, StunError> {
    if attr.len() < 4 {
        return Err(StunError::Malformed("MAPPED-ADDRESS too short"));
    }
    let family = attr[1];
    let port = u16::from_be_bytes([attr[2], attr[3]]);
    match family {
        FAMILY_IPV4 => {
            if attr.len() < 8 {
                return Err(StunError::Malformed("MAPPED-ADDRESS v4 too short"));
            }
            let octets = [attr[4], attr[5], attr[6], attr[7]];
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        FAMILY_IPV6 => {
            if attr.len() < 20 {
                return Err(StunError::Malformed("MAPPED-ADDRESS v6 too short"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&attr[4..20]);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(StunError::Malformed("unknown address family")),
    }
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, StunError> {
    let mut buf = [0u8; 2];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| StunError::Malformed("truncated while reading u16"))?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, StunError> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| StunError::Malformed("truncated while reading u32"))?;
    Ok(u32::from_be_bytes(buf))
}

/// Classifies NAT behavior by comparing the mapped endpoint reported by two
/// distinct STUN servers from the same local socket (`spec.md` §4.3): equal
/// mappings indicate a cone (or no) NAT, differing mappings indicate
/// symmetric NAT, and any failure leaves the type `Unknown` rather than
/// guessing. Also returns the reflected IP callers should advertise, when
/// one is known — both servers' (agreeing) mapping for cone, either one for
/// symmetric, and "the one successful address" when exactly one server
/// answered (`spec.md` §4.3).
pub async fn classify_nat(
    socket: &UdpSocket,
    server_a: SocketAddr,
    server_b: SocketAddr,
) -> (crate::types::NatType, Option<SocketAddr>) {
    let (a, b) = tokio::join!(bind(socket, server_a), bind(socket, server_b));
    match (a, b) {
        (Ok(a), Ok(b)) if a.mapped == b.mapped => (crate::types::NatType::Cone, Some(a.mapped)),
        (Ok(a), Ok(_)) => (crate::types::NatType::Symmetric, Some(a.mapped)),
        (Ok(a), Err(_)) => (crate::types::NatType::Unknown, Some(a.mapped)),
        (Err(_), Ok(b)) => (crate::types::NatType::Unknown, Some(b.mapped)),
        (Err(_), Err(_)) => (crate::types::NatType::Unknown, None),
    }
}

/// Ranks candidate endpoints for a peer, preferring a routable IPv6 endpoint
/// over anything discovered through STUN (`spec.md` §4.3's ranking
/// heuristic — IPv6 endpoints bypass NAT traversal machinery entirely when
/// reachable, so they sort first).
pub fn rank_candidates(candidates: &mut [SocketAddr]) {
    candidates.sort_by_key(|addr| match addr {
        SocketAddr::V6(v6) if !v6.ip().is_unicast_link_local() && !v6.ip().is_loopback() => 0,
        SocketAddr::V4(_) => 1,
        _ => 2,
    });
}

/// Unicast-global filter for IPv6, reusing the exclusion list the teacher's
/// `shared::get_local_addrs` applies (documentation/ULA/link-local/
/// multicast/loopback all fail), since `Ipv6Addr::is_unicast_global` isn't
/// stable.
fn is_unicast_global(ip: &Ipv6Addr) -> bool {
    !((ip.segments()[0] & 0xff00) == 0xff00 // multicast
        || ip.is_loopback()
        || ip.is_unspecified()
        || (ip.segments()[0] == 0x2001 && ip.segments()[1] == 0xdb8) // documentation
        || (ip.segments()[0] & 0xffc0) == 0xfe80 // unicast link local
        || (ip.segments()[0] & 0xfe00) == 0xfc00) // unique local
}

/// `spec.md` §4.3's ranking rule for `DiscoverIPv6Endpoint`: base score 10,
/// +20 inside the current global-unicast allocation `2000::/3`, -5 when the
/// interface id looks EUI-64 (`*ff:fe*` at bytes 11-12) since those encode
/// the NIC's MAC address rather than a stable identifier.
fn score_ipv6_candidate(ip: &Ipv6Addr) -> i32 {
    let mut score = 10;
    if (ip.segments()[0] & 0xe000) == 0x2000 {
        score += 20;
    }
    let octets = ip.octets();
    if octets[11] == 0xff && octets[12] == 0xfe {
        score -= 5;
    }
    score
}

/// Picks the highest-scoring global-unicast IPv6 address among local
/// interfaces, tie-broken lexicographically, paired with the WireGuard
/// listen port (`spec.md` §4.3). Returns `None` if no interface carries a
/// usable address or enumeration itself fails.
pub fn discover_ipv6_endpoint(wg_port: u16) -> Option<SocketAddr> {
    let candidates = local_ipv6_addrs().ok()?;
    best_ipv6_candidate(candidates.into_iter()).map(|ip| SocketAddr::new(IpAddr::V6(ip), wg_port))
}

fn best_ipv6_candidate(candidates: impl Iterator<Item = Ipv6Addr>) -> Option<Ipv6Addr> {
    candidates
        .filter(is_unicast_global)
        .max_by(|a, b| score_ipv6_candidate(a).cmp(&score_ipv6_candidate(b)).then(b.cmp(a)))
}

/// Enumerates local interface addresses via `nix::ifaddrs`, the same call
/// the teacher's `shared::_get_local_addrs` uses on macOS
/// (`shared/src/lib.rs`); generalized here to every unix target this crate
/// supports, since interface enumeration (unlike WireGuard device
/// programming) doesn't need Linux's netlink-specific path.
#[cfg(unix)]
fn local_ipv6_addrs() -> std::io::Result<Vec<Ipv6Addr>> {
    use nix::sys::socket::SockAddr;

    let addrs = nix::ifaddrs::getifaddrs().map_err(|e| Error::new(ErrorKind::Other, e))?;
    Ok(addrs
        .filter_map(|ifa| ifa.address)
        .filter_map(|addr| match addr {
            SockAddr::Inet(inet) => match inet.to_std().ip() {
                IpAddr::V6(ip) => Some(ip),
                IpAddr::V4(_) => None,
            },
            _ => None,
        })
        .collect())
}

#[cfg(not(unix))]
fn local_ipv6_addrs() -> std::io::Result<Vec<Ipv6Addr>> {
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response(transaction_id: &[u8; 12], mapped: SocketAddr) -> Vec<u8> {
        let (family, addr_bytes, xor_bytes): (u8, Vec<u8>, Vec<u8>) = match mapped {
            SocketAddr::V4(v4) => {
                let cookie = MAGIC_COOKIE.to_be_bytes();
                let octets = v4.ip().octets();
                let xored: Vec<u8> = octets.iter().zip(cookie.iter()).map(|(o, c)| o ^ c).collect();
                (FAMILY_IPV4, octets.to_vec(), xored)
            }
            SocketAddr::V6(_) => unreachable!("test only exercises v4"),
        };
        let _ = addr_bytes;

        let port = mapped.port();
        let xport = port ^ ((MAGIC_COOKIE >> 16) as u16);

        let mut attr = Vec::new();
        attr.push(0u8);
        attr.push(family);
        attr.extend_from_slice(&xport.to_be_bytes());
        attr.extend_from_slice(&xor_bytes);

        let mut body = Vec::new();
        body.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        body.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        body.extend_from_slice(&attr);

        let mut out = Vec::new();
        out.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(transaction_id);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn decode_xor_mapped_address_roundtrip() {
        let txn = [9u8; 12];
        let mapped: SocketAddr = "203.0.113.9:4567".parse().unwrap();
        let response = sample_response(&txn, mapped);
        let decoded = decode_binding_response(&response, &txn).unwrap();
        assert_eq!(decoded, mapped);
    }

    #[test]
    fn rejects_mismatched_transaction_id() {
        let txn = [9u8; 12];
        let other_txn = [1u8; 12];
        let mapped: SocketAddr = "203.0.113.9:4567".parse().unwrap();
        let response = sample_response(&txn, mapped);
        let result = decode_binding_response(&response, &other_txn);
        assert!(matches!(result, Err(StunError::Malformed(_))));
    }

    #[test]
    fn rank_candidates_prefers_ipv6() {
        let mut candidates = vec![
            "203.0.113.1:51820".parse().unwrap(),
            "[2001:db8::1]:51820".parse().unwrap(),
        ];
        rank_candidates(&mut candidates);
        assert!(matches!(candidates[0], SocketAddr::V6(_)));
    }

    #[test]
    fn unicast_global_excludes_special_ranges() {
        let link_local: Ipv6Addr = "fe80::1".parse().unwrap();
        let unique_local: Ipv6Addr = "fd00::1".parse().unwrap();
        let loopback: Ipv6Addr = "::1".parse().unwrap();
        let multicast: Ipv6Addr = "ff02::1".parse().unwrap();
        let global: Ipv6Addr = "2603:1000::1".parse().unwrap();

        assert!(!is_unicast_global(&link_local));
        assert!(!is_unicast_global(&unique_local));
        assert!(!is_unicast_global(&loopback));
        assert!(!is_unicast_global(&multicast));
        assert!(is_unicast_global(&global));
    }

    #[test]
    fn score_prefers_global_allocation_over_eui64() {
        let plain_global: Ipv6Addr = "2603:1000::1".parse().unwrap();
        let eui64_global: Ipv6Addr = "2603:1000::aabb:ccff:fe00:1".parse().unwrap();
        let non_global: Ipv6Addr = "fd00::1".parse().unwrap();

        assert!(score_ipv6_candidate(&plain_global) > score_ipv6_candidate(&eui64_global));
        assert!(score_ipv6_candidate(&plain_global) > score_ipv6_candidate(&non_global));
    }

    #[test]
    fn best_ipv6_candidate_filters_and_picks_highest_score() {
        let link_local: Ipv6Addr = "fe80::1".parse().unwrap();
        let eui64_global: Ipv6Addr = "2603:1000::aabb:ccff:fe00:1".parse().unwrap();
        let plain_global: Ipv6Addr = "2603:1000::2".parse().unwrap();

        let best = best_ipv6_candidate(vec![link_local, eui64_global, plain_global].into_iter());
        assert_eq!(best, Some(plain_global));
    }

    #[test]
    fn best_ipv6_candidate_none_when_all_excluded() {
        let link_local: Ipv6Addr = "fe80::1".parse().unwrap();
        let unique_local: Ipv6Addr = "fd00::1".parse().unwrap();
        assert_eq!(best_ipv6_candidate(vec![link_local, unique_local].into_iter()), None);
    }

    #[test]
    fn best_ipv6_candidate_breaks_ties_lexicographically() {
        let a: Ipv6Addr = "2603:1000::1".parse().unwrap();
        let b: Ipv6Addr = "2603:1000::2".parse().unwrap();
        // Equal score, so the tie-break picks the lexicographically smaller address.
        assert_eq!(best_ipv6_candidate(vec![b, a].into_iter()), Some(a));
    }
}
