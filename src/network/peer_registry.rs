use crate::error::{NodeError, Result};
use crate::network::message::PeerInfo;
use log::{info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

/// Parse faults tolerated before a peer is dropped
const MAX_PARSE_FAULTS: u32 = 3;
/// Consecutive stale intervals before a peer is dropped
const MAX_STALE_INTERVALS: u32 = 3;

/// Where a peer sits in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Connecting,
    Ready,
    Stale,
    Dropped,
}

/// Everything we track about one peer, keyed by its advertised listen address
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub address: SocketAddr,
    pub node_id: Option<String>,
    pub version: Option<String>,
    pub last_seen: i64,
    pub liveness: Liveness,
    stale_intervals: u32,
    parse_faults: u32,
    consensus_faults: u32,
    /// Current chain-reconciliation backtrack for this peer, zero when idle
    pub backtrack: u64,
}

impl PeerEntry {
    fn new(address: SocketAddr, now: i64) -> PeerEntry {
        PeerEntry {
            address,
            node_id: None,
            version: None,
            last_seen: now,
            liveness: Liveness::Connecting,
            stale_intervals: 0,
            parse_faults: 0,
            consensus_faults: 0,
            backtrack: 0,
        }
    }
}

/// Registry of known peers with liveness aging and fault accounting.
/// Independent of ledger state, so its lock never contends with appends.
pub struct PeerRegistry {
    inner: RwLock<HashMap<SocketAddr, PeerEntry>>,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> PeerRegistry {
        PeerRegistry {
            inner: RwLock::new(HashMap::new()),
            max_peers,
        }
    }

    /// Track a peer we are dialing or that just dialed us
    pub fn add_connecting(&self, address: SocketAddr, now: i64) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on peer registry - this should never happen");
        if inner.contains_key(&address) {
            return Ok(());
        }
        if inner.len() >= self.max_peers {
            return Err(NodeError::Resource(format!(
                "peer registry full at {} entries",
                self.max_peers
            )));
        }
        inner.insert(address, PeerEntry::new(address, now));
        Ok(())
    }

    /// Promote a peer after a completed handshake
    pub fn mark_ready(&self, address: SocketAddr, node_id: &str, version: &str, now: i64) {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on peer registry - this should never happen");
        let entry = inner
            .entry(address)
            .or_insert_with(|| PeerEntry::new(address, now));
        entry.node_id = Some(node_id.to_string());
        entry.version = Some(version.to_string());
        entry.last_seen = now;
        entry.liveness = Liveness::Ready;
        entry.stale_intervals = 0;
        info!("Peer {address} ready (node {node_id}, version {version})");
    }

    /// Record proof of life; a stale peer returns to ready
    pub fn touch(&self, address: SocketAddr, now: i64) {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on peer registry - this should never happen");
        if let Some(entry) = inner.get_mut(&address) {
            entry.last_seen = now;
            entry.stale_intervals = 0;
            if entry.liveness == Liveness::Stale {
                entry.liveness = Liveness::Ready;
            }
        }
    }

    pub fn remove(&self, address: &SocketAddr) {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on peer registry - this should never happen");
        if inner.remove(address).is_some() {
            info!("Removed peer {address}");
        }
    }

    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.inner
            .read()
            .expect("Failed to acquire read lock on peer registry - this should never happen")
            .contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("Failed to acquire read lock on peer registry - this should never happen")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addresses of peers that completed the handshake
    pub fn ready_peers(&self) -> Vec<SocketAddr> {
        self.inner
            .read()
            .expect("Failed to acquire read lock on peer registry - this should never happen")
            .values()
            .filter(|entry| entry.liveness == Liveness::Ready)
            .map(|entry| entry.address)
            .collect()
    }

    /// Descriptor list served to GET_PEERS
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.inner
            .read()
            .expect("Failed to acquire read lock on peer registry - this should never happen")
            .values()
            .map(|entry| PeerInfo {
                address: entry.address.to_string(),
                node_id: entry.node_id.clone(),
                version: entry.version.clone(),
                last_seen: entry.last_seen,
            })
            .collect()
    }

    /// Age peers against the ping interval: one silent interval pair marks a
    /// peer stale, three stale intervals drop it. Returns the dropped
    /// addresses so callers can log or clean up.
    pub fn age_peers(&self, now: i64, ping_interval_ms: i64) -> Vec<SocketAddr> {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on peer registry - this should never happen");

        let mut dropped = Vec::new();
        for entry in inner.values_mut() {
            if now - entry.last_seen > 2 * ping_interval_ms {
                entry.stale_intervals += 1;
                entry.liveness = Liveness::Stale;
                if entry.stale_intervals >= MAX_STALE_INTERVALS {
                    entry.liveness = Liveness::Dropped;
                    dropped.push(entry.address);
                }
            }
        }

        for address in &dropped {
            warn!("Peer {address} dropped after {MAX_STALE_INTERVALS} stale intervals");
            inner.remove(address);
        }
        dropped
    }

    /// Count a malformed message. Returns true when the peer crossed the
    /// fault threshold and was dropped.
    pub fn record_parse_fault(&self, address: &SocketAddr) -> bool {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on peer registry - this should never happen");
        if let Some(entry) = inner.get_mut(address) {
            entry.parse_faults += 1;
            if entry.parse_faults >= MAX_PARSE_FAULTS {
                inner.remove(address);
                warn!("Peer {address} dropped after repeated parse faults");
                return true;
            }
        }
        false
    }

    /// Count an invalid block or rejected fork from this peer
    pub fn record_consensus_fault(&self, address: &SocketAddr) {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on peer registry - this should never happen");
        if let Some(entry) = inner.get_mut(address) {
            entry.consensus_faults += 1;
            warn!(
                "Peer {address} consensus fault #{}",
                entry.consensus_faults
            );
        }
    }

    pub fn set_backtrack(&self, address: &SocketAddr, backtrack: u64) {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on peer registry - this should never happen");
        if let Some(entry) = inner.get_mut(address) {
            entry.backtrack = backtrack;
        }
    }

    pub fn get_backtrack(&self, address: &SocketAddr) -> u64 {
        self.inner
            .read()
            .expect("Failed to acquire read lock on peer registry - this should never happen")
            .get(address)
            .map(|entry| entry.backtrack)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_handshake_lifecycle() {
        let registry = PeerRegistry::new(8);
        let peer = addr(7001);

        registry.add_connecting(peer, 0).unwrap();
        assert!(registry.ready_peers().is_empty());

        registry.mark_ready(peer, "node-1", "1.0.0", 10);
        assert_eq!(registry.ready_peers(), vec![peer]);
    }

    #[test]
    fn test_registry_capacity() {
        let registry = PeerRegistry::new(2);
        registry.add_connecting(addr(7001), 0).unwrap();
        registry.add_connecting(addr(7002), 0).unwrap();
        assert!(registry.add_connecting(addr(7003), 0).is_err());
        // Known peers are accepted regardless
        registry.add_connecting(addr(7001), 0).unwrap();
    }

    #[test]
    fn test_liveness_decay_and_recovery() {
        let registry = PeerRegistry::new(8);
        let peer = addr(7001);
        registry.mark_ready(peer, "node-1", "1.0.0", 0);

        // Two silent intervals: stale but retained
        let dropped = registry.age_peers(70_000, 30_000);
        assert!(dropped.is_empty());
        assert!(registry.ready_peers().is_empty());
        assert!(registry.contains(&peer));

        // A pong brings it back
        registry.touch(peer, 71_000);
        assert_eq!(registry.ready_peers(), vec![peer]);

        // Three consecutive stale intervals drop it
        registry.age_peers(140_000, 30_000);
        registry.age_peers(210_000, 30_000);
        let dropped = registry.age_peers(280_000, 30_000);
        assert_eq!(dropped, vec![peer]);
        assert!(!registry.contains(&peer));
    }

    #[test]
    fn test_parse_faults_drop_peer() {
        let registry = PeerRegistry::new(8);
        let peer = addr(7001);
        registry.mark_ready(peer, "node-1", "1.0.0", 0);

        assert!(!registry.record_parse_fault(&peer));
        assert!(!registry.record_parse_fault(&peer));
        assert!(registry.record_parse_fault(&peer));
        assert!(!registry.contains(&peer));
    }
}
