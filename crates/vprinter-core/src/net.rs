//! Local network address helpers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Public address used only as a routing probe; no packet is ever sent.
const ROUTE_PROBE: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Local source address the kernel would use to reach `target`.
///
/// Connecting a UDP socket performs the route lookup without sending
/// anything, so this works offline as long as a route exists.
pub fn route_source_address(target: IpAddr) -> std::io::Result<IpAddr> {
    let bind: SocketAddr = match target {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect((target, 9))?;
    Ok(socket.local_addr()?.ip())
}

/// The machine's primary LAN address, if it has a default route.
pub fn local_lan_address() -> Option<IpAddr> {
    route_source_address(IpAddr::V4(ROUTE_PROBE))
        .ok()
        .filter(|ip| !ip.is_unspecified())
}

/// Address to advertise for a listener bound to `bind`.
///
/// A wildcard bind is replaced with the LAN address; loopback is the last
/// resort so that local tests still get something routable.
pub fn advertise_address(bind: IpAddr) -> IpAddr {
    if bind.is_unspecified() {
        local_lan_address().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    } else {
        bind
    }
}

/// Collapse an IPv4-mapped IPv6 address to plain IPv4.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn route_to_loopback_is_loopback() {
        let ip = route_source_address(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn explicit_bind_is_advertised_verbatim() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        assert_eq!(advertise_address(ip), ip);
    }

    #[test]
    fn wildcard_bind_is_never_advertised() {
        let ip = advertise_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(!ip.is_unspecified());
    }

    #[test]
    fn mapped_ipv6_collapses() {
        let mapped: IpAddr = "::ffff:192.168.1.9".parse().unwrap();
        assert_eq!(canonical_ip(mapped), "192.168.1.9".parse::<IpAddr>().unwrap());
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(canonical_ip(v6), v6);
    }
}
