//! Peer registry: live connections and the routing ids assigned to them.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::PeerConnection;
use crate::identity::{NodeVersion, PeerId, RoutingId};

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Stream established, tasks not yet running.
    Connecting,
    /// Waiting for the remote capability message.
    AwaitingHandshake,
    /// Messages flow in both directions.
    Active,
    Disconnected,
}

/// Point-in-time view of a peer, safe to hand out of the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    /// The remote end of the stream.
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
    /// Whether the peer connected to us.
    pub inbound: bool,
    pub state: PeerState,
    pub connected_at: DateTime<Utc>,
    /// Routing id we assigned; the peer prefixes its datagrams with it.
    pub routing_id: Option<RoutingId>,
    /// Routing id the peer assigned to us.
    pub remote_routing_id: Option<RoutingId>,
    pub datagram_healthy: bool,
    /// Round-trip time of the last acknowledged probe.
    pub latency_ms: Option<u64>,
    pub remote_version: Option<NodeVersion>,
    /// Number of entities this peer has introduced.
    pub introduced_entities: usize,
}

/// Allocates datagram routing ids. Ids are unique among live peers, 0 is never
/// handed out, and the lowest free id is always chosen so released ids are
/// reused.
#[derive(Debug, Default)]
pub struct RoutingTable {
    assigned: BTreeMap<RoutingId, PeerId>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign an id to `peer`. A peer that already holds one keeps it.
    /// Returns `None` only when every id is taken.
    pub fn assign(&mut self, peer: PeerId) -> Option<RoutingId> {
        if let Some((id, _)) = self.assigned.iter().find(|(_, owner)| **owner == peer) {
            return Some(*id);
        }
        let id = (1..=u16::MAX)
            .filter_map(RoutingId::new)
            .find(|id| !self.assigned.contains_key(id))?;
        self.assigned.insert(id, peer);
        Some(id)
    }

    pub fn release(&mut self, id: RoutingId) -> Option<PeerId> {
        self.assigned.remove(&id)
    }

    /// Resolve the raw prefix of a received datagram.
    pub fn lookup(&self, raw: u16) -> Option<PeerId> {
        let id = RoutingId::new(raw)?;
        self.assigned.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}

/// Live connections keyed by peer id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Arc<PeerConnection>>,
    routing: RoutingTable,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection: Arc<PeerConnection>) {
        self.peers.insert(connection.id(), connection);
    }

    /// Remove a peer and free its routing id.
    pub fn remove(&mut self, peer: &PeerId) -> Option<Arc<PeerConnection>> {
        let connection = self.peers.remove(peer)?;
        if let Some(id) = connection.local_routing_id() {
            self.routing.release(id);
        }
        Some(connection)
    }

    pub fn get(&self, peer: &PeerId) -> Option<Arc<PeerConnection>> {
        self.peers.get(peer).cloned()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.values().cloned().collect()
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<Arc<PeerConnection>> {
        self.peers
            .values()
            .find(|conn| conn.remote_addr() == addr)
            .cloned()
    }

    /// Assign a routing id to a registered peer and record it on the connection.
    pub fn assign_routing(&mut self, peer: &PeerId) -> Option<RoutingId> {
        let connection = self.peers.get(peer)?;
        let id = self.routing.assign(*peer)?;
        connection.set_local_routing_id(id);
        Some(id)
    }

    /// The connection whose routing id matches a datagram prefix.
    pub fn by_routing_id(&self, raw: u16) -> Option<Arc<PeerConnection>> {
        let peer = self.routing.lookup(raw)?;
        self.get(&peer)
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop every entry, returning the connections.
    pub fn drain(&mut self) -> Vec<Arc<PeerConnection>> {
        self.routing = RoutingTable::new();
        self.peers.drain().map(|(_, conn)| conn).collect()
    }
}

// ---------------------------------------------------------------------------
// Serde helper for SocketAddr
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionObserver, ConnectionSettings};
    use crate::events::EventSink;
    use std::sync::Weak;

    fn connection(port: u16) -> Arc<PeerConnection> {
        let observer: Weak<dyn ConnectionObserver> = Weak::<NoObserver>::new();
        Arc::new(PeerConnection::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            true,
            Box::new(tokio::io::sink()),
            ConnectionSettings::default(),
            EventSink::new(4),
            observer,
        ))
    }

    struct NoObserver;

    #[async_trait::async_trait]
    impl ConnectionObserver for NoObserver {
        async fn on_message(&self, _: &PeerConnection, _: crate::message::Message) {}
        async fn on_disconnected(&self, _: &PeerConnection, _: &crate::connection::DisconnectReason) {}
    }

    #[test]
    fn test_routing_ids_start_at_one_and_reuse_lowest() {
        let mut table = RoutingTable::new();
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::generate()).collect();
        let ids: Vec<u16> = peers
            .iter()
            .map(|p| table.assign(*p).unwrap().get())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);

        assert_eq!(table.release(RoutingId::new(2).unwrap()), Some(peers[1]));
        let newcomer = PeerId::generate();
        assert_eq!(table.assign(newcomer).unwrap().get(), 2);
        assert_eq!(table.assign(PeerId::generate()).unwrap().get(), 4);
    }

    #[test]
    fn test_routing_assign_is_idempotent_per_peer() {
        let mut table = RoutingTable::new();
        let peer = PeerId::generate();
        let first = table.assign(peer).unwrap();
        assert_eq!(table.assign(peer), Some(first));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_routing_lookup_rejects_zero() {
        let mut table = RoutingTable::new();
        let peer = PeerId::generate();
        table.assign(peer);
        assert_eq!(table.lookup(0), None);
        assert_eq!(table.lookup(1), Some(peer));
        assert_eq!(table.lookup(2), None);
    }

    #[tokio::test]
    async fn test_registry_routes_and_releases() {
        let mut registry = PeerRegistry::new();
        let a = connection(4000);
        let b = connection(4001);
        registry.insert(Arc::clone(&a));
        registry.insert(Arc::clone(&b));

        let id_a = registry.assign_routing(&a.id()).unwrap();
        let id_b = registry.assign_routing(&b.id()).unwrap();
        assert_eq!((id_a.get(), id_b.get()), (1, 2));
        assert_eq!(a.local_routing_id(), Some(id_a));
        assert_eq!(registry.by_routing_id(2).unwrap().id(), b.id());

        registry.remove(&a.id());
        assert!(registry.by_routing_id(1).is_none());
        assert_eq!(registry.len(), 1);

        let c = connection(4002);
        registry.insert(Arc::clone(&c));
        assert_eq!(registry.assign_routing(&c.id()).unwrap().get(), 1);
        assert!(registry.find_by_addr("127.0.0.1:4002".parse().unwrap()).is_some());
    }

    #[test]
    fn test_assign_routing_requires_registration() {
        let mut registry = PeerRegistry::new();
        assert!(registry.assign_routing(&PeerId::generate()).is_none());
        assert!(registry.routing().is_empty());
    }

    #[tokio::test]
    async fn test_peer_info_serializes_addr_as_string() {
        let info = connection(4100).info();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["addr"], "127.0.0.1:4100");
        assert_eq!(json["state"], "connecting");
        assert_eq!(json["inbound"], true);
    }
}
