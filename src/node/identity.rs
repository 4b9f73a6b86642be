//! Node identity
//!
//! A node is identified by its socket address only. The display name is
//! carried along for humans but never takes part in equality or hashing.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// A uniquely addressable session participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    name: String,
    address: IpAddr,
    port: u16,
}

impl Node {
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            address,
            port,
        }
    }

    pub fn from_socket_addr(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self::new(name, addr.ip(), addr.port())
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Account name without the " (n)" disambiguation suffix added at admission
    pub fn real_name(&self) -> &str {
        real_name(&self.name)
    }

    /// Case-insensitive ordering by display name, for sorting player lists.
    /// Not an `Ord` impl: nodes with equal names may still be distinct.
    pub fn cmp_by_name(&self, other: &Node) -> Ordering {
        name_key(&self.name).cmp(&name_key(&other.name))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.socket_addr())
    }
}

/// Case-folded form under which names collide
pub fn name_key(name: &str) -> String {
    name.to_lowercase()
}

/// Whether two names collide, ignoring case
pub fn same_name(a: &str, b: &str) -> bool {
    name_key(a) == name_key(b)
}

/// Strip the uniqueness suffix from an admitted name: "Bob (2)" -> "Bob"
pub fn real_name(name: &str) -> &str {
    name.split(' ').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    const LAN: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));

    #[test]
    fn test_equality_ignores_name() {
        let a = Node::new("alice", LAN, 4000);
        let b = Node::new("bob", LAN, 4000);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_different_port_is_different_node() {
        let a = Node::new("alice", LAN, 4000);
        let b = Node::new("alice", LAN, 4001);
        assert_ne!(a, b);
    }

    #[test]
    fn test_name_ordering_is_case_insensitive() {
        let a = Node::new("alice", LAN, 1);
        let b = Node::new("Bob", LAN, 2);
        assert_eq!(a.cmp_by_name(&b), Ordering::Less);

        let mut nodes = vec![b.clone(), a.clone()];
        nodes.sort_by(Node::cmp_by_name);
        assert_eq!(nodes[0].name(), "alice");
    }

    #[test]
    fn test_name_folding_covers_non_ascii() {
        assert!(same_name("ÉMILE", "émile"));
        assert!(same_name("Host (1)", "host (1)"));
        assert!(!same_name("Host", "Host (1)"));
    }

    #[test]
    fn test_real_name() {
        assert_eq!(real_name("Host (2)"), "Host");
        assert_eq!(real_name("Host"), "Host");
        let node = Node::new("Bob (1)", LAN, 9);
        assert_eq!(node.real_name(), "Bob");
    }
}
