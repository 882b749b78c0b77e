//! Multiaddr helpers: priority address selection, `/p2p/` suffix handling
//! and conversion from socket addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use super::transport::AddrInfo;

/// Reachability class of an address. Higher is better.
fn reachability(addr: &Multiaddr) -> u8 {
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) => return ipv4_class(ip),
            Protocol::Ip6(ip) => return ipv6_class(ip),
            Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_) => return 2,
            _ => {}
        }
    }
    0
}

fn ipv4_class(ip: Ipv4Addr) -> u8 {
    if ip.is_unspecified() {
        0
    } else if ip.is_loopback() {
        1
    } else if ip.is_private() || ip.is_link_local() {
        2
    } else {
        3
    }
}

fn ipv6_class(ip: Ipv6Addr) -> u8 {
    let first = ip.segments()[0];
    if ip.is_unspecified() {
        0
    } else if ip.is_loopback() {
        1
    } else if (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80 {
        // unique local or link local
        2
    } else {
        3
    }
}

/// Whether `addr` carries a wildcard IP (`0.0.0.0` or `::`). Such an
/// address is a bind target, never something a remote can dial.
pub fn is_unspecified(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| match p {
        Protocol::Ip4(ip) => ip.is_unspecified(),
        Protocol::Ip6(ip) => ip.is_unspecified(),
        _ => false,
    })
}

fn is_tcp(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::Tcp(_)))
}

/// Picks the address other peers are most likely to reach us at: public
/// over private over loopback, TCP before other transports. Among equals
/// the first one wins, so the choice is stable for the same input.
pub fn priority_address(addrs: &[Multiaddr]) -> Option<Multiaddr> {
    let mut best: Option<(&Multiaddr, (u8, bool))> = None;
    for addr in addrs {
        let score = (reachability(addr), is_tcp(addr));
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((addr, score)),
        }
    }
    best.map(|(addr, _)| addr.clone())
}

/// Orders `addrs` for advertisement: the priority address first, then the
/// others in their original order. Duplicates are dropped.
pub fn advertised_addrs(addrs: Vec<Multiaddr>) -> Vec<Multiaddr> {
    let mut ordered: Vec<Multiaddr> = priority_address(&addrs).into_iter().collect();
    for addr in addrs {
        if !ordered.contains(&addr) {
            ordered.push(addr);
        }
    }
    ordered
}

/// Splits `/ip4/…/tcp/…/p2p/<peer-id>` into the peer id and the transport
/// address. Returns `None` when the address carries no trailing `/p2p/`.
pub fn split_peer_id(addr: &Multiaddr) -> Option<(PeerId, Multiaddr)> {
    let mut transport = addr.clone();
    match transport.pop() {
        Some(Protocol::P2p(peer_id)) => Some((peer_id, transport)),
        _ => None,
    }
}

/// Groups `/p2p/`-suffixed addresses by peer, preserving first-seen order.
/// Addresses without a peer id are skipped.
pub fn addr_infos(addrs: &[Multiaddr]) -> Vec<AddrInfo> {
    let mut infos: Vec<AddrInfo> = Vec::new();
    for (peer_id, transport) in addrs.iter().filter_map(split_peer_id) {
        match infos.iter_mut().find(|info| info.peer_id == peer_id) {
            Some(info) => info.addrs.push(transport),
            None => infos.push(AddrInfo::new(peer_id, vec![transport])),
        }
    }
    infos
}

/// Builds the `/ip4|ip6/…/tcp/…` multiaddr of a socket address.
pub fn tcp_multiaddr(addr: SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => Protocol::Ip4(v4),
        IpAddr::V6(v6) => Protocol::Ip6(v6),
    };
    Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
}
