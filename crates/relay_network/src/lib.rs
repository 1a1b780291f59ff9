//! Relay Network: peer-to-peer mesh relay for replicated entity state.
//!
//! One node hosts; others join it. Every node keeps a table of entity
//! snapshots built from composable components and receives updates, removals
//! and application payloads from its peers. The host floods forward-eligible
//! messages to everyone else, deduplicated by message id.
//!
//! # Architecture
//!
//! - **Codec**: compact big-endian binary envelope shared by both transports.
//! - **Transport**: a reliable TCP stream per peer plus one shared UDP socket,
//!   demultiplexed by a 16-bit routing id. Datagrams are used only while the
//!   path answers health probes.
//! - **Handshake**: joiners hold inbound traffic until the host's capability
//!   message proves a compatible protocol version.
//! - **Dispatch**: typed handling of each message kind; opaque payloads go to
//!   handlers registered by sub-type.
//! - **Events**: every lifecycle change and failure is published on a
//!   broadcast channel.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use relay_network::{NetworkConfig, NetworkManager, Transport};
//! use relay_network::entity::{EntitySnapshot, Identity};
//!
//! # async fn example() -> Result<(), relay_network::NetworkError> {
//! let host = NetworkManager::new(NetworkConfig::default())?;
//! let port = host.start_listening(25566).await?;
//!
//! let joiner = NetworkManager::new(NetworkConfig::default())?;
//! joiner.connect(&format!("127.0.0.1:{port}")).await?;
//!
//! let me = EntitySnapshot::new(uuid::Uuid::new_v4()).with(Identity::new("Ada", 0x3366FF));
//! joiner.publish_local_entity(me, Transport::Stream).await;
//!
//! joiner.shutdown().await;
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod events;
pub mod handshake;
pub mod health;
pub mod identity;
pub mod logging;
pub mod manager;
pub mod message;
pub mod payload;
pub mod peer;
pub mod port_mapper;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{AdvertisedAddress, NetworkConfig};
pub use dispatcher::{OpaqueHandler, OpaqueMessage};
pub use entity::{EntitySnapshot, EntityTable};
pub use error::{FailureKind, HandshakeError, NetworkError, ProtocolError};
pub use events::NetworkEvent;
pub use identity::{NodeVersion, PeerId, RoutingId};
pub use manager::{NetworkManager, StatusSummary};
pub use message::{Message, MessageType, Transport};
pub use peer::{PeerInfo, PeerState};
pub use port_mapper::{PortMapper, PortProtocol};
