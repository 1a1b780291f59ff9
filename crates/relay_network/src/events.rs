//! Structured event sink. Every lifecycle transition and every failure in the
//! mesh is published here.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::FailureKind;
use crate::identity::{NodeVersion, PeerId, RoutingId};

/// Something that happened in the mesh.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    ListenerStarted { port: u16 },
    ListenerStopped,
    /// A stream connection was accepted or established.
    PeerConnected {
        peer: PeerId,
        addr: SocketAddr,
        inbound: bool,
    },
    /// The peer passed its capability handshake (or needed none).
    PeerActive {
        peer: PeerId,
        version: Option<NodeVersion>,
    },
    PeerDisconnected { peer: PeerId, reason: String },
    RoutingAssigned { peer: PeerId, routing_id: RoutingId },
    DatagramHealthChanged {
        peer: PeerId,
        healthy: bool,
        rtt: Option<Duration>,
    },
    /// An entity announced itself with an identity component.
    EntityIntroduced {
        id: Uuid,
        name: String,
        via: Option<PeerId>,
    },
    EntityUpdated { id: Uuid, via: Option<PeerId> },
    EntityRemoved {
        id: Uuid,
        /// The last known display name, if the entity was in the table.
        name: Option<String>,
        via: Option<PeerId>,
    },
    GenericMessage { from: PeerId, payload: Bytes },
    OpaqueUnhandled {
        from: PeerId,
        sub_type: String,
        payload: Bytes,
    },
    Failure {
        kind: FailureKind,
        peer: Option<PeerId>,
        detail: String,
    },
}

/// Cloneable publisher over a broadcast channel. Publishing never blocks and
/// never fails; events sent while nobody subscribes are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<NetworkEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: NetworkEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    /// Log a failure and publish it.
    pub fn failure(&self, kind: FailureKind, peer: Option<PeerId>, detail: impl Into<String>) {
        let detail = detail.into();
        match peer {
            Some(peer) => tracing::warn!("{kind:?} failure on peer {peer}: {detail}"),
            None => tracing::warn!("{kind:?} failure: {detail}"),
        }
        self.emit(NetworkEvent::Failure { kind, peer, detail });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
