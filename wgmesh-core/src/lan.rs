//! LAN discovery (`spec.md` §4.9): a multicast beacon so peers on the same
//! local network find each other without touching the DHT at all. Uses
//! `socket2` directly for multicast group membership, since `tokio::net`
//! doesn't expose `IP_ADD_MEMBERSHIP`-style options on its `UdpSocket`.

use socket2::{Domain, Protocol, Socket, Type};
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::{keys::DerivedKeys, peer_exchange::PeerExchange};

const BEACON_INTERVAL: Duration = Duration::from_secs(15);
const MULTICAST_PORT: u16 = 51822;

/// Derives a multicast group address in the 239.0.0.0/8 administratively
/// scoped range from `multicast_id`, so distinct meshes don't collide on
/// the same LAN segment.
pub fn multicast_group(multicast_id: &[u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(239, multicast_id[1], multicast_id[2], multicast_id[3])
}

pub struct LanDiscovery {
    socket: Arc<UdpSocket>,
    group: Ipv4Addr,
    exchange: Arc<PeerExchange>,
}

impl LanDiscovery {
    pub fn bind(keys: &DerivedKeys, exchange: Arc<PeerExchange>) -> std::io::Result<Self> {
        let group = multicast_group(&keys.multicast_id);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_multicast_loop_v4(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT)).into())?;
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;

        Ok(Self {
            socket: Arc::new(socket),
            group,
            exchange,
        })
    }

    async fn beacon_once(&self) {
        let target = SocketAddr::new(self.group.into(), MULTICAST_PORT);
        if self.exchange.send_hello(target, "lan").await.is_err() {
            log::debug!("lan beacon to {target} failed");
        }
    }

    /// Beacons periodically and forwards anything received on the multicast
    /// socket to the shared peer-exchange handler, so a LAN-discovered peer
    /// gets merged into the same `PeerStore` as DHT/gossip-discovered ones.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(BEACON_INTERVAL);
        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.beacon_once().await,
                result = self.socket.recv_from(&mut buf) => {
                    if let Ok((len, from)) = result {
                        self.exchange.handle_lan_datagram(&buf[..len], from).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multicast_group_stays_within_administratively_scoped_range() {
        let group = multicast_group(&[9, 10, 20, 30]);
        assert_eq!(group.octets()[0], 239);
        assert_eq!(group, Ipv4Addr::new(239, 10, 20, 30));
    }
}
