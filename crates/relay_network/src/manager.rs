//! NetworkManager: top-level coordinator for the relay mesh.
//!
//! [`NetworkManager`] is the primary public API for relay_network. It owns:
//! - the stream listener and its accept loop (host role)
//! - outbound connections (joiner role)
//! - the shared datagram sockets (one per address family) and their receive loops
//! - the peer registry, routing ids and the recent-id relay cache
//! - the replicated entity table and the local entity
//!
//! Inbound messages flow from each [`PeerConnection`] through the
//! [`MessageDispatcher`], then through the relay decision.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::config::{AdvertisedAddress, NetworkConfig};
use crate::connection::{ConnectionObserver, ConnectionSettings, DisconnectReason, PeerConnection};
use crate::dedup::RecentIds;
use crate::dispatcher::{DispatchContext, DispatchOutcome, MessageDispatcher, OpaqueHandler, OpaqueMessage};
use crate::entity::{EntitySnapshot, EntityTable};
use crate::error::{FailureKind, HandshakeError, NetworkError};
use crate::events::{EventSink, NetworkEvent};
use crate::handshake::GateState;
use crate::identity::{NodeVersion, PeerId};
use crate::message::{Message, Transport};
use crate::payload::{CapabilityHandshake, DatagramHandshake, EntityRemoval};
use crate::peer::{PeerInfo, PeerRegistry};
use crate::port_mapper::{PortMapper, PortProtocol};
use crate::transport::{self, PeerAddress};

/// Largest datagram the receive loop accepts.
const RECV_BUFFER_SIZE: usize = 65_535;

/// The relay mesh node.
///
/// Create one per process. Call [`start_listening`](Self::start_listening) to
/// host, [`connect`](Self::connect) to join, and [`shutdown`](Self::shutdown)
/// before dropping it.
pub struct NetworkManager {
    inner: Arc<ManagerInner>,
}

struct ListenerHandle {
    port: u16,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// One shared datagram socket per address family.
struct DatagramEndpoint {
    socket: Arc<UdpSocket>,
    port: u16,
    ipv4: bool,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    config: NetworkConfig,
    settings: ConnectionSettings,
    events: EventSink,
    entities: EntityTable,
    dispatcher: MessageDispatcher,
    peers: RwLock<PeerRegistry>,
    recent: Mutex<RecentIds>,
    local_entity: RwLock<Option<EntitySnapshot>>,
    listener: Mutex<Option<ListenerHandle>>,
    datagram: Mutex<Vec<DatagramEndpoint>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    port_mapper: Option<Arc<dyn PortMapper>>,
    self_ref: Weak<ManagerInner>,
}

/// Snapshot of the node's hosting state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub is_host: bool,
    pub port: Option<u16>,
    pub local_ip: Option<IpAddr>,
    pub external_ip: Option<IpAddr>,
    pub peer_count: usize,
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_unknown<T: fmt::Display>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map_or_else(|| "unknown".to_string(), ToString::to_string)
        }
        writeln!(f, "Is host: {}", self.is_host)?;
        writeln!(f, "Port: {}", or_unknown(&self.port))?;
        writeln!(f, "Local IP: {}", or_unknown(&self.local_ip))?;
        writeln!(f, "External IP: {}", or_unknown(&self.external_ip))?;
        write!(f, "Connected peers: {}", self.peer_count)
    }
}

impl NetworkManager {
    /// Create a manager. Fails if the config is out of range.
    pub fn new(config: NetworkConfig) -> Result<Self, NetworkError> {
        Self::build(config, None)
    }

    /// Create a manager that opens gateway ports through `mapper` when hosting.
    pub fn with_port_mapper(
        config: NetworkConfig,
        mapper: Arc<dyn PortMapper>,
    ) -> Result<Self, NetworkError> {
        Self::build(config, Some(mapper))
    }

    fn build(
        config: NetworkConfig,
        port_mapper: Option<Arc<dyn PortMapper>>,
    ) -> Result<Self, NetworkError> {
        config.validate()?;
        let inner = Arc::new_cyclic(|self_ref| ManagerInner {
            settings: ConnectionSettings::from(&config),
            events: EventSink::new(config.event_capacity),
            entities: EntityTable::new(),
            dispatcher: MessageDispatcher::new(),
            peers: RwLock::new(PeerRegistry::new()),
            recent: Mutex::new(RecentIds::new(config.dedup_capacity)),
            local_entity: RwLock::new(None),
            listener: Mutex::new(None),
            datagram: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            port_mapper,
            self_ref: self_ref.clone(),
            config,
        });
        Ok(Self { inner })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub fn version(&self) -> &NodeVersion {
        &self.inner.settings.local_version
    }

    /// Subscribe to mesh events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Hosting
    // -----------------------------------------------------------------------

    /// Start hosting. Tries `preferred_port` and the following ports up to the
    /// configured sweep width; 0 picks an ephemeral port. Returns the bound port.
    pub async fn start_listening(&self, preferred_port: u16) -> Result<u16, NetworkError> {
        self.inner
            .start_listening(preferred_port)
            .await
            .inspect_err(|e| {
                self.inner
                    .events
                    .failure(e.failure_kind(), None, format!("Cannot start hosting: {e}"))
            })
    }

    /// Stop hosting. Disconnects every peer. Returns `false` if not hosting.
    pub async fn stop_listening(&self) -> bool {
        self.inner.stop_listening().await
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening_port().is_some()
    }

    pub fn listening_port(&self) -> Option<u16> {
        self.inner.listening_port()
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    /// Connect to `address` (`host`, `host:port`, `[v6]:port`) and wait for
    /// the capability handshake. Never retried.
    pub async fn connect(&self, address: &str) -> Result<PeerId, NetworkError> {
        self.inner.connect(address).await.inspect_err(|e| {
            // Handshake failures were already reported by the connection.
            if !matches!(e, NetworkError::Handshake(_)) {
                self.inner.events.failure(
                    e.failure_kind(),
                    None,
                    format!("Connect to {address} failed: {e}"),
                );
            }
        })
    }

    /// Disconnect one peer. Gives up after the shutdown grace if the peer's
    /// stream is stuck, dropping it from the registry anyway.
    pub async fn disconnect(&self, peer: PeerId) -> Result<(), NetworkError> {
        let conn = self
            .inner
            .peers
            .read()
            .get(&peer)
            .ok_or(NetworkError::PeerNotFound(peer))?;
        let grace = self.inner.config.shutdown_grace;
        if tokio::time::timeout(grace, conn.disconnect(DisconnectReason::Requested))
            .await
            .is_err()
        {
            warn!("Disconnecting {peer} did not finish within {grace:?}");
            self.inner.peers.write().remove(&peer);
            return Err(NetworkError::Timeout(grace));
        }
        Ok(())
    }

    pub fn current_peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner
            .peers
            .read()
            .connections()
            .iter()
            .map(|conn| conn.info())
            .collect()
    }

    pub fn peer_info(&self, peer: PeerId) -> Option<PeerInfo> {
        self.inner.peers.read().get(&peer).map(|conn| conn.info())
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Send a locally originated message to every peer. Returns the number of
    /// peers it was handed to.
    pub async fn broadcast(&self, message: Message) -> usize {
        self.inner.remember(&message);
        self.inner.broadcast_except(&message, None).await
    }

    /// Register the handler for an opaque sub-type.
    pub fn on_opaque<F, Fut>(&self, sub_type: impl Into<String>, handler: F)
    where
        F: Fn(OpaqueMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: OpaqueHandler = Arc::new(
            move |msg: OpaqueMessage| -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(handler(msg))
            },
        );
        self.inner.dispatcher.register(sub_type, handler);
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    /// Set this node's own entity without sending anything. Sent to peers
    /// that join later.
    pub fn set_local_entity(&self, snapshot: EntitySnapshot) {
        *self.inner.local_entity.write() = Some(snapshot.with_new_introduction(false));
    }

    pub fn local_entity(&self) -> Option<EntitySnapshot> {
        self.inner.local_entity.read().clone()
    }

    /// Publish this node's entity. Only components that changed since the
    /// last publish are sent; a different entity id replaces the stored one
    /// and is sent in full. Returns `false` when nothing changed.
    pub async fn publish_local_entity(&self, snapshot: EntitySnapshot, transport: Transport) -> bool {
        let outgoing = {
            let mut local = self.inner.local_entity.write();
            match local.as_mut() {
                Some(stored) if stored.id() == snapshot.id() => {
                    match snapshot.delta_against(stored) {
                        Some(delta) => {
                            stored.merge(&delta);
                            Some(delta.with_new_introduction(snapshot.is_new_introduction()))
                        }
                        None => None,
                    }
                }
                _ => {
                    *local = Some(snapshot.clone().with_new_introduction(false));
                    Some(snapshot)
                }
            }
        };
        let Some(outgoing) = outgoing else {
            return false;
        };

        let message = outgoing.to_message().with_transport(transport);
        self.broadcast(message).await;
        true
    }

    /// Every entity known from the mesh (the local entity excluded).
    pub fn entities(&self) -> Vec<EntitySnapshot> {
        self.inner.entities.snapshots()
    }

    pub fn entity(&self, id: &Uuid) -> Option<EntitySnapshot> {
        self.inner.entities.get(id)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn status_summary(&self) -> StatusSummary {
        let (local_ip, external_ip) = self.inner.addresses().await;
        StatusSummary {
            is_host: self.is_listening(),
            port: self.listening_port(),
            local_ip,
            external_ip,
            peer_count: self.current_peer_count(),
        }
    }

    /// The address a remote user should dial, per the advertised-address
    /// setting. The port is appended while hosting. `None` when the address
    /// is unknown.
    pub async fn connection_address(&self) -> Option<String> {
        let host = match &self.inner.config.advertised_address {
            AdvertisedAddress::Literal(host) => host.clone(),
            AdvertisedAddress::Local => format_ip(self.inner.addresses().await.0?),
            AdvertisedAddress::External => {
                let (local, external) = self.inner.addresses().await;
                format_ip(external.or(local)?)
            }
        };
        Some(match self.listening_port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        })
    }

    /// Stop hosting, disconnect every peer, stop the datagram loop and wait
    /// (bounded by the shutdown grace) for background tasks.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

fn format_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => format!("[{v6}]"),
        IpAddr::V4(v4) => v4.to_string(),
    }
}

impl ManagerInner {
    fn listening_port(&self) -> Option<u16> {
        self.listener.lock().as_ref().map(|l| l.port)
    }

    fn is_host(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// The datagram socket able to reach `peer`.
    fn datagram_socket(&self, peer: IpAddr) -> Option<(Arc<UdpSocket>, u16)> {
        self.datagram
            .lock()
            .iter()
            .find(|d| d.ipv4 == peer.is_ipv4())
            .map(|d| (Arc::clone(&d.socket), d.port))
    }

    fn local_entity_id(&self) -> Option<Uuid> {
        self.local_entity.read().as_ref().map(EntitySnapshot::id)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn addresses(&self) -> (Option<IpAddr>, Option<IpAddr>) {
        let Some(mapper) = &self.port_mapper else {
            return (transport::local_ip().await, None);
        };
        let local = match mapper.local_address().await {
            Some(ip) => Some(ip),
            None => transport::local_ip().await,
        };
        (local, mapper.external_address().await)
    }

    // -----------------------------------------------------------------------
    // Hosting
    // -----------------------------------------------------------------------

    async fn start_listening(&self, preferred: u16) -> Result<u16, NetworkError> {
        if let Some(port) = self.listening_port() {
            return Err(NetworkError::AlreadyListening(port));
        }

        let listener =
            transport::bind_with_sweep(self.config.bind_address, preferred, self.config.port_sweep)
                .await?;
        let port = listener.local_addr()?.port();

        if self.datagram_socket(self.config.bind_address).is_none() {
            match transport::bind_datagram(self.config.bind_address, port).await {
                Ok(socket) => {
                    self.install_datagram(socket);
                }
                Err(e) => warn!("Cannot bind datagram socket on port {port}, running stream-only: {e}"),
            }
        }

        if let Some(mapper) = &self.port_mapper {
            for protocol in [PortProtocol::Tcp, PortProtocol::Udp] {
                if mapper.open(port, protocol).await {
                    info!("Opened {protocol} port {port} on the gateway");
                } else {
                    warn!("Gateway refused to map {protocol} port {port}");
                }
            }
        }

        {
            let mut slot = self.listener.lock();
            if let Some(existing) = slot.as_ref() {
                return Err(NetworkError::AlreadyListening(existing.port));
            }
            let Some(this) = self.self_ref.upgrade() else {
                return Err(NetworkError::Transport("manager dropped".into()));
            };
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let task = tokio::spawn(this.accept_loop(listener, shutdown_rx));
            *slot = Some(ListenerHandle {
                port,
                shutdown_tx,
                task,
            });
        }

        info!("Hosting on port {port}");
        self.events.emit(NetworkEvent::ListenerStarted { port });
        Ok(port)
    }

    async fn stop_listening(&self) -> bool {
        let handle = self.listener.lock().take();
        let Some(handle) = handle else {
            return false;
        };
        let _ = handle.shutdown_tx.send(());
        self.track(handle.task);

        self.disconnect_all(DisconnectReason::Shutdown).await;
        self.close_datagram();

        if let Some(mapper) = &self.port_mapper {
            for protocol in [PortProtocol::Tcp, PortProtocol::Udp] {
                if !mapper.close(handle.port, protocol).await {
                    debug!("Gateway did not release {protocol} port {}", handle.port);
                }
            }
        }

        self.entities.clear();
        info!("Stopped hosting on port {}", handle.port);
        self.events.emit(NetworkEvent::ListenerStopped);
        true
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => match self.register(stream, addr, true) {
                        Ok(conn) => {
                            let greeter = Arc::clone(&self);
                            self.track(tokio::spawn(async move { greeter.greet(conn).await }));
                        }
                        Err(e) => debug!("Rejected inbound {addr}: {e}"),
                    },
                    Err(e) => {
                        self.events.failure(FailureKind::Transport, None, format!("Accept failed: {e}"));
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }
        debug!("Accept loop finished");
    }

    /// Host side of a new connection: capability message, routing id, then
    /// every known entity.
    async fn greet(&self, conn: Arc<PeerConnection>) {
        let capability = CapabilityHandshake::new(self.settings.local_version.clone()).to_message();
        if let Err(e) = conn.send(&capability).await {
            debug!("Greeting {} failed: {e}", conn.id());
            return;
        }
        self.assign_routing(&conn).await;

        let mut snapshots: Vec<EntitySnapshot> = self.local_entity.read().iter().cloned().collect();
        snapshots.extend(self.entities.snapshots());
        for snapshot in snapshots {
            let message = snapshot.with_new_introduction(false).to_message();
            if let Err(e) = conn.send(&message).await {
                debug!("Initial sync to {} stopped: {e}", conn.id());
                return;
            }
        }

        self.events.emit(NetworkEvent::PeerActive {
            peer: conn.id(),
            version: None,
        });
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    async fn connect(&self, address: &str) -> Result<PeerId, NetworkError> {
        let target = PeerAddress::parse(address, self.config.default_port)?;
        let addr = target.resolve().await?;

        let local_ips = self.local_ips().await;
        if transport::is_self_address(addr, self.listening_port(), &local_ips) {
            return Err(NetworkError::SelfConnection(addr));
        }
        if self.peers.read().find_by_addr(addr).is_some() {
            return Err(NetworkError::AlreadyConnected(addr));
        }

        let stream = transport::connect(addr, self.config.connect_timeout).await?;
        info!("Connected to {target} ({addr}), awaiting handshake");
        self.ensure_datagram_socket(addr.ip()).await;
        let conn = self.register(stream, addr, false)?;

        match conn.wait_handshake().await {
            GateState::Accepted | GateState::NotRequired => Ok(conn.id()),
            GateState::Pending | GateState::Rejected => {
                let failure = conn.handshake_failure().unwrap_or(HandshakeError::Aborted);
                conn.disconnect(DisconnectReason::Handshake(failure.clone())).await;
                Err(NetworkError::Handshake(failure))
            }
        }
    }

    async fn local_ips(&self) -> Vec<IpAddr> {
        let mut ips = Vec::new();
        if !self.config.bind_address.is_unspecified() {
            ips.push(self.config.bind_address);
        }
        if let Some(ip) = transport::local_ip().await {
            ips.push(ip);
        }
        if let Some(mapper) = &self.port_mapper {
            ips.extend(mapper.local_address().await);
        }
        ips
    }

    /// Wrap a stream in a connection, register it and start its tasks. An
    /// outbound stream to an endpoint that is already registered is dropped;
    /// the check and the insert share one registry lock.
    fn register(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        inbound: bool,
    ) -> Result<Arc<PeerConnection>, NetworkError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cannot disable Nagle for {addr}: {e}");
        }
        let (reader, writer) = stream.into_split();
        let observer: Weak<dyn ConnectionObserver> = self.self_ref.clone();
        let conn = Arc::new(
            PeerConnection::new(
                addr,
                inbound,
                Box::new(writer),
                self.settings.clone(),
                self.events.clone(),
                observer,
            )
            .with_datagram_socket(self.datagram_socket(addr.ip()).map(|(socket, _)| socket)),
        );

        {
            let mut peers = self.peers.write();
            if !inbound && peers.find_by_addr(addr).is_some() {
                return Err(NetworkError::AlreadyConnected(addr));
            }
            peers.insert(Arc::clone(&conn));
        }
        self.track(conn.start(reader));

        info!(
            "Peer {} {} {addr}",
            conn.id(),
            if inbound { "connected from" } else { "reached at" }
        );
        self.events.emit(NetworkEvent::PeerConnected {
            peer: conn.id(),
            addr,
            inbound,
        });
        Ok(conn)
    }

    /// Assign the lowest free routing id and tell the peer how to reach our
    /// datagram socket.
    async fn assign_routing(&self, conn: &PeerConnection) {
        let assigned = self.peers.write().assign_routing(&conn.id());
        let Some(routing_id) = assigned else {
            if !conn.is_closed() {
                self.events
                    .failure(FailureKind::Resource, Some(conn.id()), "No free routing id");
            }
            return;
        };
        debug!("Assigned routing id {routing_id} to {}", conn.id());
        self.events.emit(NetworkEvent::RoutingAssigned {
            peer: conn.id(),
            routing_id,
        });

        let Some((_, datagram_port)) = self.datagram_socket(conn.remote_addr().ip()) else {
            debug!("No datagram socket, {} stays on the stream", conn.id());
            return;
        };
        // Port 0 tells the peer to reuse the port it dialled.
        let port = if conn.is_inbound() && self.listening_port() == Some(datagram_port) {
            0
        } else {
            datagram_port
        };
        let message = DatagramHandshake::new(routing_id, port).to_message();
        if let Err(e) = conn.send(&message).await {
            debug!("Datagram handshake to {} failed: {e}", conn.id());
        }
    }

    /// Joiner side of a completed handshake: routing id, then announce our
    /// own entity.
    async fn on_handshake_accepted(&self, conn: &PeerConnection, version: NodeVersion) {
        self.events.emit(NetworkEvent::PeerActive {
            peer: conn.id(),
            version: Some(version),
        });
        self.assign_routing(conn).await;

        let local = self.local_entity.read().clone();
        if let Some(local) = local {
            let message = local.with_new_introduction(true).to_message();
            self.remember(&message);
            if let Err(e) = conn.send(&message).await {
                debug!("Announcing local entity to {} failed: {e}", conn.id());
            }
        }
    }

    /// Empty the registry and tear every connection down concurrently, each
    /// bounded by the shutdown grace.
    async fn disconnect_all(&self, reason: DisconnectReason) {
        let conns = self.peers.write().drain();
        let grace = self.config.shutdown_grace;
        let teardowns = conns.iter().map(|conn| {
            let reason = reason.clone();
            async move {
                if tokio::time::timeout(grace, conn.disconnect(reason)).await.is_err() {
                    warn!("Peer {} did not disconnect within {grace:?}", conn.id());
                }
            }
        });
        futures::future::join_all(teardowns).await;
    }

    // -----------------------------------------------------------------------
    // Datagram endpoint
    // -----------------------------------------------------------------------

    /// Bind a datagram socket for `peer`'s address family if none exists.
    async fn ensure_datagram_socket(&self, peer: IpAddr) {
        if self.datagram_socket(peer).is_some() {
            return;
        }
        let Some(ip) = transport::datagram_bind_ip(self.config.bind_address, peer) else {
            warn!(
                "Bind address {} cannot reach {peer} over datagrams, running stream-only",
                self.config.bind_address
            );
            return;
        };
        match transport::bind_datagram(ip, 0).await {
            Ok(socket) => {
                self.install_datagram(socket);
            }
            Err(e) => self.events.failure(
                FailureKind::Resource,
                None,
                format!("Cannot bind datagram socket on {ip}, running stream-only: {e}"),
            ),
        }
    }

    /// Install `socket` as the shared datagram socket for its address family
    /// unless one exists, and start its receive loop.
    fn install_datagram(&self, socket: UdpSocket) {
        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(e) => {
                warn!("Datagram socket has no local address, dropping it: {e}");
                return;
            }
        };
        let mut endpoints = self.datagram.lock();
        if endpoints.iter().any(|d| d.ipv4 == local.is_ipv4()) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let socket = Arc::new(socket);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(this.datagram_loop(Arc::clone(&socket), shutdown_rx));
        endpoints.push(DatagramEndpoint {
            socket,
            port: local.port(),
            ipv4: local.is_ipv4(),
            shutdown_tx,
            task,
        });
        info!("Datagram socket bound on {local}");
    }

    fn close_datagram(&self) {
        let endpoints = std::mem::take(&mut *self.datagram.lock());
        for endpoint in endpoints {
            let _ = endpoint.shutdown_tx.send(());
            self.track(endpoint.task);
            debug!("Datagram socket on port {} closed", endpoint.port);
        }
    }

    async fn datagram_loop(self: Arc<Self>, socket: Arc<UdpSocket>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                    Err(e) => debug!("Datagram receive failed: {e}"),
                },
                _ = shutdown.recv() => break,
            }
        }
        debug!("Datagram loop finished");
    }

    async fn on_datagram(&self, data: &[u8], from: SocketAddr) {
        let (raw_id, body) = match codec::split_datagram(data) {
            Ok(parts) => parts,
            Err(e) => {
                self.events
                    .failure(FailureKind::Protocol, None, format!("Datagram from {from}: {e}"));
                return;
            }
        };

        let conn = self.peers.read().by_routing_id(raw_id);
        let Some(conn) = conn else {
            let err = NetworkError::UnknownRoutingId(raw_id);
            self.events
                .failure(err.failure_kind(), None, format!("Datagram from {from}: {err}"));
            return;
        };

        match codec::decode(body, Transport::Datagram) {
            Ok(message) => conn.handle_inbound(message).await,
            Err(e) => self.events.failure(
                FailureKind::Protocol,
                Some(conn.id()),
                format!("Dropped datagram: {e}"),
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch and relay
    // -----------------------------------------------------------------------

    /// Dispatch one message, then decide whether to relay it. Returns
    /// messages released by a completed handshake.
    async fn process(&self, conn: &PeerConnection, message: Message) -> Option<Vec<Message>> {
        let ctx = DispatchContext {
            peer: conn,
            entities: &self.entities,
            events: &self.events,
            local_entity: self.local_entity_id(),
        };
        let outcome = match self.dispatcher.dispatch(&ctx, &message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.events.failure(
                    e.failure_kind(),
                    Some(conn.id()),
                    format!("Dropped {} message: {e}", message.kind()),
                );
                return None;
            }
        };

        match outcome {
            DispatchOutcome::HandshakeAccepted { version, released } => {
                self.on_handshake_accepted(conn, version).await;
                Some(released)
            }
            DispatchOutcome::HandshakeRejected(err) => {
                self.events
                    .failure(FailureKind::Handshake, Some(conn.id()), err.to_string());
                conn.disconnect(DisconnectReason::Handshake(err)).await;
                None
            }
            DispatchOutcome::Handled | DispatchOutcome::Ignored => {
                self.relay(conn.id(), &message).await;
                None
            }
        }
    }

    /// Flood `message` to everyone but its sender when hosting, the type
    /// forwards, and the id has not been seen.
    async fn relay(&self, from: PeerId, message: &Message) {
        if !self.is_host() || !message.kind().forwards() {
            return;
        }
        let Some(id) = message.dedup_id() else {
            return;
        };
        if !self.recent.lock().insert(id) {
            debug!("Not relaying duplicate {} {id}", message.kind());
            return;
        }
        let sent = self.broadcast_except(message, Some(from)).await;
        debug!("Relayed {} {id} from {from} to {sent} peers", message.kind());
    }

    /// Record the dedup id of a locally originated message.
    fn remember(&self, message: &Message) {
        if !message.kind().forwards() {
            return;
        }
        if let Some(id) = message.dedup_id() {
            self.recent.lock().insert(id);
        }
    }

    async fn broadcast_except(&self, message: &Message, exclude: Option<PeerId>) -> usize {
        let targets: Vec<Arc<PeerConnection>> = self
            .peers
            .read()
            .connections()
            .into_iter()
            .filter(|conn| Some(conn.id()) != exclude)
            .collect();

        let mut sent = 0;
        for conn in targets {
            match conn.send(message).await {
                Ok(()) => sent += 1,
                Err(e) => debug!("Broadcast to {} failed: {e}", conn.id()),
            }
        }
        sent
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    async fn shutdown(&self) {
        info!("Shutting down relay network");
        let grace = self.config.shutdown_grace;
        let teardown = async {
            self.stop_listening().await;
            self.disconnect_all(DisconnectReason::Shutdown).await;
        };
        if tokio::time::timeout(grace, teardown).await.is_err() {
            let stranded = self.peers.write().drain();
            warn!(
                "Peer teardown still running after {grace:?}, dropping {} peers",
                stranded.len()
            );
        }
        self.close_datagram();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("Background tasks still running after {grace:?}, aborting them");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Relay network stopped");
    }
}

#[async_trait]
impl ConnectionObserver for ManagerInner {
    async fn on_message(&self, connection: &PeerConnection, message: Message) {
        let mut pending = VecDeque::from([message]);
        while let Some(message) = pending.pop_front() {
            if let Some(released) = self.process(connection, message).await {
                pending.extend(released);
            }
        }
    }

    async fn on_disconnected(&self, connection: &PeerConnection, reason: &DisconnectReason) {
        let removed = self.peers.write().remove(&connection.id());
        if removed.is_none() {
            debug!("Peer {} was not registered", connection.id());
        }
        self.events.emit(NetworkEvent::PeerDisconnected {
            peer: connection.id(),
            reason: reason.to_string(),
        });

        let others = self.peers.read().connections();
        for entity in connection.introduced_entities() {
            let shared = others.iter().any(|other| other.has_introduced(&entity));
            if shared || !self.entities.contains(&entity) {
                connection.forget_introduced(&entity);
                continue;
            }
            debug!("Entity {entity} left with peer {}", connection.id());
            let removal = EntityRemoval::new(entity).to_message();
            self.process(connection, removal).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
