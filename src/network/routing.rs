//! Server routing table
//!
//! A bijection between admitted nodes and the channels they arrived on.
//! Lookups go straight to the concurrent maps. Inserts and removals take a
//! short lock so both directions change together; the lock is never held
//! across I/O.

use dashmap::DashMap;
use parking_lot::Mutex;

use super::transport::ChannelId;
use crate::node::{same_name, Node};

#[derive(Default)]
pub struct RoutingTable {
    by_node: DashMap<Node, ChannelId>,
    by_channel: DashMap<ChannelId, Node>,
    write_lock: Mutex<()>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an admitted node. Fails if the node or the channel is already routed.
    pub fn insert(&self, node: Node, channel: ChannelId) -> bool {
        let _guard = self.write_lock.lock();
        if self.by_node.contains_key(&node) || self.by_channel.contains_key(&channel) {
            return false;
        }
        self.by_channel.insert(channel, node.clone());
        self.by_node.insert(node, channel);
        true
    }

    /// Remove a node and its channel together
    pub fn remove_node(&self, node: &Node) -> Option<(Node, ChannelId)> {
        let _guard = self.write_lock.lock();
        let (stored, channel) = self.by_node.remove(node)?;
        self.by_channel.remove(&channel);
        Some((stored, channel))
    }

    pub fn channel_of(&self, node: &Node) -> Option<ChannelId> {
        self.by_node.get(node).map(|entry| *entry.value())
    }

    /// Node admitted on a channel, with the name it was admitted under
    pub fn node_of(&self, channel: ChannelId) -> Option<Node> {
        self.by_channel.get(&channel).map(|entry| entry.value().clone())
    }

    /// The stored node equal to `node`, carrying its admitted name
    pub fn resolve(&self, node: &Node) -> Option<Node> {
        self.by_node.get(node).map(|entry| entry.key().clone())
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.by_node.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.by_channel.iter().map(|entry| *entry.key()).collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Node> {
        self.by_node
            .iter()
            .find(|entry| same_name(entry.key().name(), name))
            .map(|entry| entry.key().clone())
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, port: u16) -> Node {
        Node::new(name, "10.0.0.2".parse().unwrap(), port)
    }

    fn table_with(entries: &[(Node, u64)]) -> (RoutingTable, Vec<ChannelId>) {
        let table = RoutingTable::new();
        let ids: Vec<ChannelId> = entries.iter().map(|(_, id)| channel(*id)).collect();
        for ((n, _), id) in entries.iter().zip(&ids) {
            assert!(table.insert(n.clone(), *id));
        }
        (table, ids)
    }

    fn channel(raw: u64) -> ChannelId {
        ChannelId::from_raw(raw)
    }

    #[test]
    fn test_bijection() {
        let (table, ids) = table_with(&[(node("a", 1), 1), (node("b", 2), 2)]);

        assert_eq!(table.channel_of(&node("renamed", 1)), Some(ids[0]));
        assert_eq!(table.node_of(ids[1]).unwrap().name(), "b");
        assert!(!table.insert(node("c", 1), channel(3)));
        assert!(!table.insert(node("c", 3), ids[0]));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_is_single_shot() {
        let (table, ids) = table_with(&[(node("a", 1), 1)]);

        let (removed, id) = table.remove_node(&node("a", 1)).unwrap();
        assert_eq!(removed.name(), "a");
        assert_eq!(id, ids[0]);
        assert!(table.remove_node(&node("a", 1)).is_none());
        assert!(table.node_of(ids[0]).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_find_by_name_ignores_case() {
        let (table, _) = table_with(&[(node("Alice", 1), 1)]);
        assert_eq!(table.find_by_name("alice"), Some(node("x", 1)));
        assert!(table.find_by_name("bob").is_none());
    }

    #[test]
    fn test_find_by_name_folds_non_ascii() {
        let (table, _) = table_with(&[(node("Émile", 1), 1)]);
        assert_eq!(table.find_by_name("ÉMILE"), Some(node("x", 1)));
        assert_eq!(table.find_by_name("émile"), Some(node("x", 1)));
    }
}
