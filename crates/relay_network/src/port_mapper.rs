//! External port mapping seam (UPnP or similar). The manager only opens and
//! closes mappings and reads back addresses; the mechanism lives elsewhere.

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

/// Opens ports on the gateway and reports addresses. Failures are reported
/// as `false`/`None`; the mesh keeps working without a mapping.
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn open(&self, port: u16, protocol: PortProtocol) -> bool;

    async fn close(&self, port: u16, protocol: PortProtocol) -> bool;

    /// LAN address of this host as seen by the gateway.
    async fn local_address(&self) -> Option<IpAddr>;

    /// Public address of the gateway.
    async fn external_address(&self) -> Option<IpAddr>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
