//! Arena of peer sessions with lookup indexes by node key, disco key and
//! address.

use crate::session::PeerSession;
use meshpath_crypto::{DiscoPublicKey, NodePublicKey};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

/// Sessions live in dense slots; indexes hold slot numbers. A freed slot is
/// reused by the next insert.
#[derive(Debug, Default)]
pub struct PeerMap {
    slots: Vec<Option<PeerSession>>,
    free: Vec<usize>,
    by_node: HashMap<NodePublicKey, usize>,
    by_disco: HashMap<DiscoPublicKey, BTreeSet<usize>>,
    by_addr: HashMap<SocketAddr, usize>,
}

impl PeerMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, replacing any with the same node key. Returns its
    /// slot.
    pub fn insert(&mut self, session: PeerSession) -> usize {
        if let Some(old) = self.by_node.get(&session.node_key()).copied() {
            self.remove(old);
        }
        let node = session.node_key();
        let disco = session.disco_key();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(session);
                slot
            }
            None => {
                self.slots.push(Some(session));
                self.slots.len() - 1
            }
        };
        self.by_node.insert(node, slot);
        if let Some(d) = disco {
            self.by_disco.entry(d).or_default().insert(slot);
        }
        slot
    }

    /// Remove the session in `slot` and its index entries.
    pub fn remove(&mut self, slot: usize) -> Option<PeerSession> {
        let session = self.slots.get_mut(slot)?.take()?;
        self.by_node.remove(&session.node_key());
        if let Some(d) = session.disco_key() {
            self.unindex_disco(&d, slot);
        }
        for c in session.book().iter() {
            if self.by_addr.get(&c.addr) == Some(&slot) {
                self.by_addr.remove(&c.addr);
            }
        }
        self.free.push(slot);
        Some(session)
    }

    fn unindex_disco(&mut self, disco: &DiscoPublicKey, slot: usize) {
        if let Some(set) = self.by_disco.get_mut(disco) {
            set.remove(&slot);
            if set.is_empty() {
                self.by_disco.remove(disco);
            }
        }
    }

    /// Move `slot` from `old` to `new` in the disco index.
    pub fn reindex_disco(&mut self, slot: usize, old: Option<DiscoPublicKey>, new: Option<DiscoPublicKey>) {
        if let Some(d) = old {
            self.unindex_disco(&d, slot);
        }
        if let Some(d) = new {
            self.by_disco.entry(d).or_default().insert(slot);
        }
    }

    /// Session in `slot`.
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&PeerSession> {
        self.slots.get(slot)?.as_ref()
    }

    /// Mutable session in `slot`.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut PeerSession> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Slot of `node`.
    #[must_use]
    pub fn slot_of(&self, node: &NodePublicKey) -> Option<usize> {
        self.by_node.get(node).copied()
    }

    /// Slots of every peer using `disco`.
    #[must_use]
    pub fn slots_with_disco(&self, disco: &DiscoPublicKey) -> Vec<usize> {
        self.by_disco
            .get(disco)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any peer uses `disco`.
    #[must_use]
    pub fn has_disco(&self, disco: &DiscoPublicKey) -> bool {
        self.by_disco.contains_key(disco)
    }

    /// Slot of the peer last confirmed at `addr`.
    #[must_use]
    pub fn slot_for_addr(&self, addr: &SocketAddr) -> Option<usize> {
        self.by_addr.get(addr).copied()
    }

    /// Attribute packets from `addr` to `slot`.
    pub fn set_addr_owner(&mut self, addr: SocketAddr, slot: usize) {
        self.by_addr.insert(addr, slot);
    }

    /// Drop address attributions of `slot` for `addrs`.
    pub fn forget_addrs(&mut self, slot: usize, addrs: &[SocketAddr]) {
        for a in addrs {
            if self.by_addr.get(a) == Some(&slot) {
                self.by_addr.remove(a);
            }
        }
    }

    /// Occupied slots.
    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
    }

    /// Sessions with their slots.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PeerSession)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    /// Node keys of all peers.
    #[must_use]
    pub fn node_keys(&self) -> Vec<NodePublicKey> {
        self.by_node.keys().copied().collect()
    }

    /// Number of peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    /// Whether there are no peers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoConfig;
    use crate::session::policy::HeartbeatPolicy;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn session(node: u8, disco: u8) -> PeerSession {
        session_at(node, disco, &[])
    }

    fn session_at(node: u8, disco: u8, endpoints: &[SocketAddr]) -> PeerSession {
        let mut s = PeerSession::new(
            NodePublicKey::from_bytes([node; 32]),
            Arc::new(DiscoConfig::default()),
            Arc::new(HeartbeatPolicy),
            8,
        );
        s.update_from_network_map(Some(DiscoPublicKey::from_bytes([disco; 32])), endpoints, None, Instant::now());
        s
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut m = PeerMap::new();
        let a = m.insert(session(1, 10));
        let b = m.insert(session(2, 10));
        assert_ne!(a, b);
        assert_eq!(m.slot_of(&NodePublicKey::from_bytes([2; 32])), Some(b));
        assert_eq!(m.slots_with_disco(&DiscoPublicKey::from_bytes([10; 32])), vec![a, b]);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_remove_clears_indexes_and_reuses_slot() {
        let mut m = PeerMap::new();
        let addr: SocketAddr = "1.2.3.4:5".parse().unwrap();
        let a = m.insert(session_at(1, 10, &[addr]));
        m.set_addr_owner(addr, a);
        assert!(m.remove(a).is_some());
        assert!(!m.has_disco(&DiscoPublicKey::from_bytes([10; 32])));
        assert_eq!(m.slot_for_addr(&addr), None);
        assert!(m.remove(a).is_none());
        assert_eq!(m.insert(session(3, 11)), a);
    }

    #[test]
    fn test_remove_keeps_other_owners() {
        let mut m = PeerMap::new();
        let shared: SocketAddr = "1.2.3.4:5".parse().unwrap();
        let other: SocketAddr = "5.6.7.8:9".parse().unwrap();
        let a = m.insert(session_at(1, 10, &[shared]));
        let b = m.insert(session_at(2, 11, &[shared, other]));
        m.set_addr_owner(shared, b);
        m.set_addr_owner(other, b);

        m.remove(a);
        assert_eq!(m.slot_for_addr(&shared), Some(b));
        assert_eq!(m.slot_for_addr(&other), Some(b));
        m.remove(b);
        assert_eq!(m.slot_for_addr(&shared), None);
        assert_eq!(m.slot_for_addr(&other), None);
    }

    #[test]
    fn test_insert_replaces_same_node() {
        let mut m = PeerMap::new();
        m.insert(session(1, 10));
        m.insert(session(1, 11));
        assert_eq!(m.len(), 1);
        assert!(!m.has_disco(&DiscoPublicKey::from_bytes([10; 32])));
        assert!(m.has_disco(&DiscoPublicKey::from_bytes([11; 32])));
    }

    #[test]
    fn test_reindex_disco() {
        let mut m = PeerMap::new();
        let a = m.insert(session(1, 10));
        m.reindex_disco(
            a,
            Some(DiscoPublicKey::from_bytes([10; 32])),
            Some(DiscoPublicKey::from_bytes([12; 32])),
        );
        assert!(!m.has_disco(&DiscoPublicKey::from_bytes([10; 32])));
        assert_eq!(m.slots_with_disco(&DiscoPublicKey::from_bytes([12; 32])), vec![a]);
    }

    #[test]
    fn test_forget_addrs_only_own() {
        let mut m = PeerMap::new();
        let a = m.insert(session(1, 10));
        let b = m.insert(session(2, 11));
        let addr: SocketAddr = "1.2.3.4:5".parse().unwrap();
        m.set_addr_owner(addr, b);
        m.forget_addrs(a, &[addr]);
        assert_eq!(m.slot_for_addr(&addr), Some(b));
        m.forget_addrs(b, &[addr]);
        assert_eq!(m.slot_for_addr(&addr), None);
    }
}
