//! Self-address discovery
//!
//! A server binds a wildcard address but has to report a concrete one to
//! its peers. Interfaces are ranked: globally routable addresses first, then
//! site-local or link-local ones, then loopback. The first interface found in
//! the best class wins. Servers listen on IPv4, so only IPv4 addresses are
//! advertised. The result is not guaranteed to be reachable from outside a
//! NAT; port forwarding is left to the operator.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Reachability class of an interface address, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressScope {
    Public,
    Local,
    Loopback,
}

/// Classify an address. Unspecified and multicast addresses are unusable.
pub fn address_scope(addr: &IpAddr) -> Option<AddressScope> {
    if addr.is_unspecified() || addr.is_multicast() {
        return None;
    }
    if addr.is_loopback() {
        return Some(AddressScope::Loopback);
    }
    let local = match addr {
        IpAddr::V4(v4) => is_local_v4(v4),
        IpAddr::V6(v6) => is_local_v6(v6),
    };
    Some(if local {
        AddressScope::Local
    } else {
        AddressScope::Public
    })
}

fn is_local_v4(addr: &Ipv4Addr) -> bool {
    // 100.64.0.0/10 is carrier-grade NAT space, not routable either
    let [a, b, ..] = addr.octets();
    addr.is_private() || addr.is_link_local() || (a == 100 && (64..128).contains(&b))
}

fn is_local_v6(addr: &Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    // fe80::/10 link-local, fec0::/10 site-local, fc00::/7 unique local
    (first & 0xffc0) == 0xfe80 || (first & 0xffc0) == 0xfec0 || (first & 0xfe00) == 0xfc00
}

/// Pick the preferred address among candidates, falling back to loopback
pub fn select_address<I>(candidates: I) -> IpAddr
where
    I: IntoIterator<Item = IpAddr>,
{
    let mut best: Option<(AddressScope, IpAddr)> = None;
    for addr in candidates {
        let Some(scope) = address_scope(&addr) else {
            continue;
        };
        match best {
            Some((current, _)) if current <= scope => {}
            _ => best = Some((scope, addr)),
        }
        if scope == AddressScope::Public {
            break;
        }
    }
    best.map(|(_, addr)| addr)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Like [`select_address`], restricted to IPv4 candidates
pub fn select_ipv4_address<I>(candidates: I) -> IpAddr
where
    I: IntoIterator<Item = IpAddr>,
{
    select_address(candidates.into_iter().filter(IpAddr::is_ipv4))
}

/// Enumerate local interface addresses
pub fn interface_addresses() -> Vec<(String, IpAddr)> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .map(|iface| {
                let ip = iface.ip();
                (iface.name, ip)
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Could not enumerate network interfaces: {}", e);
            Vec::new()
        }
    }
}

/// Discover the IPv4 address this host should advertise
pub fn find_local_address() -> IpAddr {
    let addr = select_ipv4_address(interface_addresses().into_iter().map(|(_, ip)| ip));
    tracing::debug!("Selected local address {}", addr);
    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_scopes() {
        assert_eq!(address_scope(&ip("127.0.0.1")), Some(AddressScope::Loopback));
        assert_eq!(address_scope(&ip("::1")), Some(AddressScope::Loopback));
        assert_eq!(address_scope(&ip("192.168.0.4")), Some(AddressScope::Local));
        assert_eq!(address_scope(&ip("10.1.2.3")), Some(AddressScope::Local));
        assert_eq!(address_scope(&ip("169.254.3.3")), Some(AddressScope::Local));
        assert_eq!(address_scope(&ip("fe80::1")), Some(AddressScope::Local));
        assert_eq!(address_scope(&ip("fd12::1")), Some(AddressScope::Local));
        assert_eq!(address_scope(&ip("8.8.8.8")), Some(AddressScope::Public));
        assert_eq!(address_scope(&ip("2001:db8::1")), Some(AddressScope::Public));
        assert_eq!(address_scope(&ip("0.0.0.0")), None);
    }

    #[test]
    fn test_public_preferred_over_local_and_loopback() {
        let chosen = select_address(vec![
            ip("127.0.0.1"),
            ip("192.168.1.2"),
            ip("203.0.113.9"),
        ]);
        assert_eq!(chosen, ip("203.0.113.9"));
    }

    #[test]
    fn test_first_of_best_class_wins() {
        let chosen = select_address(vec![ip("127.0.0.1"), ip("10.0.0.7"), ip("192.168.1.2")]);
        assert_eq!(chosen, ip("10.0.0.7"));
    }

    #[test]
    fn test_ipv4_selection_skips_v6() {
        let chosen = select_ipv4_address(vec![ip("2001:db8::1"), ip("127.0.0.1"), ip("192.168.1.2")]);
        assert_eq!(chosen, ip("192.168.1.2"));
        assert_eq!(select_ipv4_address(vec![ip("2001:db8::1"), ip("::1")]), ip("127.0.0.1"));
    }

    #[test]
    fn test_loopback_fallback() {
        assert_eq!(select_address(vec![ip("::1")]), ip("::1"));
        assert_eq!(select_address(Vec::new()), ip("127.0.0.1"));
        assert_eq!(select_address(vec![ip("0.0.0.0")]), ip("127.0.0.1"));
    }
}
