//! A single peer connection: a reliable stream plus an optional datagram route.
//!
//! The connection owns the stream's write half, the handshake gate, and the
//! datagram health state. It runs three tasks: the stream read loop, the
//! handshake timeout (outbound connections only), and the datagram health
//! probe. Decoded messages are handed to a [`ConnectionObserver`], normally
//! the network manager.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::config::NetworkConfig;
use crate::error::{FailureKind, HandshakeError, NetworkError};
use crate::events::{EventSink, NetworkEvent};
use crate::handshake::{GateState, HandshakeGate, Offer};
use crate::health::{DatagramHealth, HealthTransition};
use crate::identity::{NodeVersion, PeerId, RoutingId};
use crate::message::{Message, MessageType, Transport};
use crate::payload::{DatagramHandshake, HealthProbe};
use crate::peer::{PeerInfo, PeerState};

/// Write half of the stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-connection timing and size limits.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub local_version: NodeVersion,
    pub handshake_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub max_failed_probes: u32,
    pub max_datagram_size: usize,
    pub write_timeout: Duration,
}

impl From<&NetworkConfig> for ConnectionSettings {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            local_version: NodeVersion::current(),
            handshake_timeout: config.handshake_timeout,
            probe_interval: config.probe_interval,
            probe_timeout: config.probe_timeout,
            max_failed_probes: config.max_failed_probes,
            max_datagram_size: config.max_datagram_size,
            write_timeout: config.write_timeout,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local caller asked for it.
    Requested,
    /// The node is shutting down or stopped hosting.
    Shutdown,
    /// The remote side closed the stream.
    Closed,
    Transport(String),
    /// The stream could no longer be framed.
    Protocol(String),
    Handshake(HandshakeError),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("disconnect requested"),
            Self::Shutdown => f.write_str("shutting down"),
            Self::Closed => f.write_str("closed by remote"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Handshake(e) => write!(f, "handshake failed: {e}"),
        }
    }
}

/// Receives everything a connection delivers.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// A message passed the handshake gate.
    async fn on_message(&self, connection: &PeerConnection, message: Message);

    /// The connection was torn down. Called exactly once, after timers are
    /// cancelled and the stream is closed.
    async fn on_disconnected(&self, connection: &PeerConnection, reason: &DisconnectReason);
}

#[derive(Debug, Clone, Copy)]
struct DatagramRoute {
    routing_id: RoutingId,
    target: SocketAddr,
}

pub struct PeerConnection {
    id: PeerId,
    remote_addr: SocketAddr,
    inbound: bool,
    connected_at: DateTime<Utc>,
    settings: ConnectionSettings,
    state: Mutex<PeerState>,
    closed: AtomicBool,
    gate: HandshakeGate,
    handshake_failure: Mutex<Option<HandshakeError>>,
    remote_version: Mutex<Option<NodeVersion>>,
    health: Mutex<DatagramHealth>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    socket: Option<Arc<UdpSocket>>,
    local_routing_id: Mutex<Option<RoutingId>>,
    remote_route: Mutex<Option<DatagramRoute>>,
    introduced: Mutex<HashSet<Uuid>>,
    shutdown_tx: watch::Sender<bool>,
    handshake_timer: Mutex<Option<JoinHandle<()>>>,
    probe_timer: Mutex<Option<JoinHandle<()>>>,
    events: EventSink,
    observer: Weak<dyn ConnectionObserver>,
}

impl PeerConnection {
    /// Create a connection around an established stream. Outbound connections
    /// wait for the remote capability message; inbound ones do not.
    pub fn new(
        remote_addr: SocketAddr,
        inbound: bool,
        writer: BoxedWriter,
        settings: ConnectionSettings,
        events: EventSink,
        observer: Weak<dyn ConnectionObserver>,
    ) -> Self {
        let gate = if inbound {
            HandshakeGate::not_required()
        } else {
            HandshakeGate::required()
        };
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id: PeerId::generate(),
            remote_addr,
            inbound,
            connected_at: Utc::now(),
            health: Mutex::new(DatagramHealth::new(settings.max_failed_probes)),
            settings,
            state: Mutex::new(PeerState::Connecting),
            closed: AtomicBool::new(false),
            gate,
            handshake_failure: Mutex::new(None),
            remote_version: Mutex::new(None),
            writer: tokio::sync::Mutex::new(Some(writer)),
            socket: None,
            local_routing_id: Mutex::new(None),
            remote_route: Mutex::new(None),
            introduced: Mutex::new(HashSet::new()),
            shutdown_tx,
            handshake_timer: Mutex::new(None),
            probe_timer: Mutex::new(None),
            events,
            observer,
        }
    }

    /// Attach the node's shared datagram socket.
    pub fn with_datagram_socket(mut self, socket: Option<Arc<UdpSocket>>) -> Self {
        self.socket = socket;
        self
    }

    /// Spawn the read loop and timers. Returns the read loop's handle.
    pub fn start<R>(self: &Arc<Self>, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if self.gate.state() == GateState::Pending {
            self.set_state(PeerState::AwaitingHandshake);
            let conn = Arc::clone(self);
            *self.handshake_timer.lock() = Some(tokio::spawn(conn.handshake_deadline()));
        } else {
            self.set_state(PeerState::Active);
        }

        if self.socket.is_some() {
            let conn = Arc::clone(self);
            *self.probe_timer.lock() = Some(tokio::spawn(conn.probe_loop()));
        }

        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(Arc::clone(self).read_loop(reader, shutdown))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    fn set_state(&self, state: PeerState) {
        let mut current = self.state.lock();
        if *current != PeerState::Disconnected {
            *current = state;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    /// Why the handshake failed, if it did.
    pub fn handshake_failure(&self) -> Option<HandshakeError> {
        self.handshake_failure.lock().clone()
    }

    pub fn remote_version(&self) -> Option<NodeVersion> {
        self.remote_version.lock().clone()
    }

    /// Routing id this node assigned to the peer.
    pub fn local_routing_id(&self) -> Option<RoutingId> {
        *self.local_routing_id.lock()
    }

    pub fn set_local_routing_id(&self, id: RoutingId) {
        *self.local_routing_id.lock() = Some(id);
    }

    /// Routing id the peer told us to prefix our datagrams with.
    pub fn remote_routing_id(&self) -> Option<RoutingId> {
        self.remote_route.lock().map(|route| route.routing_id)
    }

    pub fn datagram_healthy(&self) -> bool {
        self.health.lock().is_healthy()
    }

    /// Whether a datagram-preferring send would currently use the datagram path.
    pub fn prefers_datagram(&self) -> bool {
        self.socket.is_some() && self.datagram_healthy() && self.remote_route.lock().is_some()
    }

    pub fn record_introduced(&self, entity: Uuid) {
        self.introduced.lock().insert(entity);
    }

    pub fn forget_introduced(&self, entity: &Uuid) -> bool {
        self.introduced.lock().remove(entity)
    }

    pub fn has_introduced(&self, entity: &Uuid) -> bool {
        self.introduced.lock().contains(entity)
    }

    pub fn introduced_entities(&self) -> Vec<Uuid> {
        self.introduced.lock().iter().copied().collect()
    }

    pub fn info(&self) -> PeerInfo {
        let (datagram_healthy, rtt) = {
            let health = self.health.lock();
            (health.is_healthy(), health.last_rtt())
        };
        PeerInfo {
            id: self.id,
            addr: self.remote_addr,
            inbound: self.inbound,
            state: self.state(),
            connected_at: self.connected_at,
            routing_id: self.local_routing_id(),
            remote_routing_id: self.remote_routing_id(),
            datagram_healthy,
            latency_ms: rtt.map(|rtt| rtt.as_millis() as u64),
            remote_version: self.remote_version(),
            introduced_entities: self.introduced.lock().len(),
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Wait until the handshake is accepted or has failed.
    pub async fn wait_handshake(&self) -> GateState {
        self.gate.wait().await
    }

    /// Check the remote capability message. On acceptance returns the held
    /// inbound messages in arrival order; returns `Ok(None)` when no
    /// handshake was pending.
    pub fn complete_handshake(
        &self,
        remote: NodeVersion,
    ) -> Result<Option<Vec<Message>>, HandshakeError> {
        if self.gate.state() != GateState::Pending {
            debug!(
                "Ignoring capability message from {} (protocol {}): no handshake pending",
                self.id, remote.protocol_version
            );
            return Ok(None);
        }

        let local = &self.settings.local_version;
        if !local.is_compatible_with(&remote) {
            let err = HandshakeError::VersionMismatch {
                local: local.clone(),
                remote,
            };
            if self.gate.reject() {
                *self.handshake_failure.lock() = Some(err.clone());
            }
            return Err(err);
        }

        let Some(released) = self.gate.accept() else {
            return Ok(None);
        };
        if let Some(timer) = self.handshake_timer.lock().take() {
            timer.abort();
        }
        info!(
            "Handshake with {} accepted (protocol {}, implementation {})",
            self.id, remote.protocol_version, remote.implementation_version
        );
        *self.remote_version.lock() = Some(remote);
        self.set_state(PeerState::Active);
        Ok(Some(released))
    }

    async fn handshake_deadline(self: Arc<Self>) {
        let timeout = self.settings.handshake_timeout;
        tokio::time::sleep(timeout).await;
        if !self.gate.reject() {
            return;
        }
        let err = HandshakeError::Timeout(timeout);
        *self.handshake_failure.lock() = Some(err.clone());
        self.events
            .failure(FailureKind::Handshake, Some(self.id), err.to_string());
        // Teardown aborts this timer, so it runs on its own task.
        tokio::spawn(async move {
            self.disconnect(DisconnectReason::Handshake(err)).await;
        });
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    async fn read_loop<R>(self: Arc<Self>, mut reader: R, mut shutdown: watch::Receiver<bool>)
    where
        R: AsyncRead + Send + Unpin,
    {
        if *shutdown.borrow_and_update() {
            return;
        }

        let reason = loop {
            tokio::select! {
                _ = shutdown.changed() => break None,
                result = codec::read_message(&mut reader) => match result {
                    Ok(message) => self.handle_inbound(message).await,
                    Err(NetworkError::Protocol(e)) if !e.desynchronizes_stream() => {
                        self.events.failure(
                            FailureKind::Protocol,
                            Some(self.id),
                            format!("Dropped malformed message: {e}"),
                        );
                    }
                    Err(NetworkError::Protocol(e)) => {
                        self.events.failure(FailureKind::Protocol, Some(self.id), e.to_string());
                        break Some(DisconnectReason::Protocol(e.to_string()));
                    }
                    Err(NetworkError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        break Some(DisconnectReason::Closed);
                    }
                    Err(e) => {
                        self.events.failure(FailureKind::Transport, Some(self.id), e.to_string());
                        break Some(DisconnectReason::Transport(e.to_string()));
                    }
                }
            }
        };

        if let Some(reason) = reason {
            self.disconnect(reason).await;
        }
        debug!("Read loop for {} finished", self.id);
    }

    /// Feed a decoded message from either transport through the handshake
    /// gate. Capability messages bypass the gate.
    pub async fn handle_inbound(&self, message: Message) {
        if self.is_closed() {
            return;
        }
        let message = if message.kind() == MessageType::CapabilityHandshake {
            message
        } else {
            match self.gate.offer(message) {
                Offer::Deliver(message) => message,
                Offer::Queued => {
                    debug!("Holding message from {} until handshake completes", self.id);
                    return;
                }
                Offer::Dropped => return,
            }
        };
        if let Some(observer) = self.observer.upgrade() {
            observer.on_message(self, message).await;
        }
    }

    /// Record where the peer wants our datagrams. Port 0 means the port of the
    /// stream we reached it on.
    pub fn set_remote_route(&self, handshake: DatagramHandshake) {
        let port = if handshake.port == 0 {
            self.remote_addr.port()
        } else {
            handshake.port
        };
        let target = SocketAddr::new(self.remote_addr.ip(), port);
        *self.remote_route.lock() = Some(DatagramRoute {
            routing_id: handshake.routing_id,
            target,
        });
        info!(
            "Peer {} datagram route set: routing id {} -> {target}",
            self.id, handshake.routing_id
        );
    }

    /// Answer a probe, or record an acknowledgment.
    pub async fn on_probe(&self, probe: HealthProbe) -> Result<(), NetworkError> {
        if probe.is_response {
            let transition = self.health.lock().on_ack(probe.sequence, Instant::now().into_std());
            self.report_health(transition);
            return Ok(());
        }
        self.send(&probe.response().to_message()).await
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Send a message. Datagram-preferring messages use the datagram path when
    /// it is healthy and routed, falling back to the stream on failure.
    /// Messages sent before the handshake completes are dropped.
    pub async fn send(&self, message: &Message) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::PeerDisconnected(self.id));
        }
        if !self.gate.is_open() {
            debug!(
                "Dropping outbound {} to {}: handshake not completed",
                message.kind(),
                self.id
            );
            return Ok(());
        }

        if message.transport() == Transport::Datagram && self.prefers_datagram() {
            match self.send_datagram(message).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!("Datagram to {} failed, retrying over stream: {e}", self.id),
            }
        }
        self.send_stream(message).await
    }

    /// Write one frame, bounded by the write timeout. A failed or timed out
    /// write closes the stream so later senders do not queue behind it.
    async fn send_stream(&self, message: &Message) -> Result<(), NetworkError> {
        let limit = self.settings.write_timeout;
        let result = {
            let mut slot = self.writer.lock().await;
            let Some(writer) = slot.as_mut() else {
                return Err(NetworkError::PeerDisconnected(self.id));
            };
            let result = tokio::time::timeout(limit, codec::write_message(writer, message))
                .await
                .unwrap_or(Err(NetworkError::Timeout(limit)));
            let broken = matches!(&result, Err(e) if !matches!(e, NetworkError::Protocol(_)));
            if broken || self.is_closed() {
                // Dropping the write half shuts the socket's sending side.
                slot.take();
            }
            result
        };

        match result {
            Err(NetworkError::Protocol(e)) => Err(e.into()),
            Err(e) => {
                self.events
                    .failure(FailureKind::Transport, Some(self.id), e.to_string());
                self.disconnect(DisconnectReason::Transport(e.to_string()))
                    .await;
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn send_datagram(&self, message: &Message) -> Result<(), NetworkError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| NetworkError::DatagramUnavailable("no datagram socket".into()))?;
        let route = (*self.remote_route.lock()).ok_or_else(|| {
            NetworkError::DatagramUnavailable("peer has not announced a datagram route".into())
        })?;

        let datagram = codec::encode_datagram(route.routing_id, message)?;
        if datagram.len() > self.settings.max_datagram_size {
            return Err(NetworkError::DatagramUnavailable(format!(
                "{} bytes exceeds the {} byte datagram limit",
                datagram.len(),
                self.settings.max_datagram_size
            )));
        }
        socket.send_to(&datagram, route.target).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Health probing
    // -----------------------------------------------------------------------

    async fn probe_loop(self: Arc<Self>) {
        let start = Instant::now() + self.settings.probe_timeout;
        let mut ticker = tokio::time::interval_at(start, self.settings.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.remote_route.lock().is_none() {
                continue;
            }

            let sequence = self.health.lock().begin_probe(Instant::now().into_std());
            let probe = HealthProbe::request(sequence).to_message();
            if let Err(e) = self.send_datagram(&probe).await {
                debug!("Probe {sequence} to {} not sent: {e}", self.id);
                let transition = self.health.lock().expire(sequence);
                self.report_health(transition);
                continue;
            }

            tokio::time::sleep(self.settings.probe_timeout).await;
            let transition = self.health.lock().expire(sequence);
            self.report_health(transition);
        }
    }

    fn report_health(&self, transition: Option<HealthTransition>) {
        let Some(transition) = transition else {
            return;
        };
        let (healthy, rtt) = {
            let health = self.health.lock();
            (health.is_healthy(), health.last_rtt())
        };
        match transition {
            HealthTransition::Restored => {
                info!("Datagram path to {} is healthy (rtt {rtt:?})", self.id)
            }
            HealthTransition::Lost => warn!(
                "Datagram path to {} lost after {} missed probes, using stream",
                self.id, self.settings.max_failed_probes
            ),
        }
        self.events.emit(NetworkEvent::DatagramHealthChanged {
            peer: self.id,
            healthy,
            rtt,
        });
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Tear the connection down. Timers are cancelled before the stream is
    /// closed, and the observer is notified last. Only the first call has any
    /// effect.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(timer) = self.handshake_timer.lock().take() {
            timer.abort();
        }
        if let Some(timer) = self.probe_timer.lock().take() {
            timer.abort();
        }
        if self.gate.reject() {
            let failure = match &reason {
                DisconnectReason::Handshake(e) => e.clone(),
                _ => HandshakeError::Aborted,
            };
            *self.handshake_failure.lock() = Some(failure);
        }
        *self.state.lock() = PeerState::Disconnected;
        self.shutdown_tx.send_replace(true);

        // A write stuck on a peer that stopped reading holds the writer until
        // its own timeout fires, then drops it.
        let limit = self.settings.write_timeout;
        match tokio::time::timeout(limit, self.writer.lock()).await {
            Ok(mut slot) => {
                if let Some(mut writer) = slot.take() {
                    match tokio::time::timeout(limit, writer.shutdown()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("Closing stream to {} failed: {e}", self.id),
                        Err(_) => debug!("Closing stream to {} timed out", self.id),
                    }
                }
            }
            Err(_) => debug!("Stream to {} busy, leaving it to the pending write", self.id),
        }

        info!("Peer {} ({}) disconnected: {reason}", self.id, self.remote_addr);
        if let Some(observer) = self.observer.upgrade() {
            observer.on_disconnected(self, &reason).await;
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("inbound", &self.inbound)
            .field("state", &self.state())
            .field("routing_id", &self.local_routing_id())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
