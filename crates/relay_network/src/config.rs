//! Network configuration for a relay node.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dedup;
use crate::error::NetworkError;
use crate::transport::DEFAULT_PORT;

/// Which address `connection_address()` hands out.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertisedAddress {
    /// The port mapper's external address.
    #[default]
    External,
    /// The LAN address.
    Local,
    /// A fixed host name or address.
    Literal(String),
}

/// Configuration for the relay networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface the listener and datagram socket bind to.
    pub bind_address: IpAddr,

    /// Port tried first when hosting, and the port assumed when an address
    /// omits one.
    pub default_port: u16,

    /// Number of consecutive ports tried when the preferred one is taken.
    pub port_sweep: u16,

    /// Timeout for establishing an outbound stream.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// How long a joiner waits for the host's capability message.
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Interval between datagram health probes.
    #[serde(with = "duration_ms")]
    pub probe_interval: Duration,

    /// How long a probe may stay unanswered before it counts as missed.
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,

    /// Consecutive missed probes before the datagram path is abandoned.
    pub max_failed_probes: u32,

    /// Capacity of the recently-seen message id cache.
    pub dedup_capacity: usize,

    /// Largest datagram sent, routing prefix included.
    pub max_datagram_size: usize,

    /// Longest a single stream write may block before the peer is dropped.
    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,

    /// Upper bound on each shutdown phase: disconnecting peers, then waiting
    /// for background tasks.
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,

    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,

    pub advertised_address: AdvertisedAddress,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            default_port: DEFAULT_PORT,
            port_sweep: 100,
            connect_timeout: Duration::from_millis(6000),
            handshake_timeout: Duration::from_millis(6000),
            probe_interval: Duration::from_millis(5000),
            probe_timeout: Duration::from_millis(2000),
            max_failed_probes: 3,
            dedup_capacity: dedup::DEFAULT_CAPACITY,
            max_datagram_size: 1450,
            write_timeout: Duration::from_millis(5000),
            shutdown_grace: Duration::from_secs(5),
            event_capacity: 256,
            advertised_address: AdvertisedAddress::default(),
        }
    }
}

/// Accepted handshake timeout range.
pub const HANDSHAKE_TIMEOUT_RANGE_MS: (u64, u64) = (50, 100_000);

/// Smallest datagram limit that still fits a routing prefix and an envelope
/// header.
pub const MIN_DATAGRAM_SIZE: usize = 64;

impl NetworkConfig {
    /// Check every value is within its safe range.
    pub fn validate(&self) -> Result<(), NetworkError> {
        let (min, max) = HANDSHAKE_TIMEOUT_RANGE_MS;
        let handshake_ms = self.handshake_timeout.as_millis();
        if handshake_ms < u128::from(min) || handshake_ms > u128::from(max) {
            return Err(NetworkError::Config(format!(
                "handshake_timeout must be {min}..={max} ms, got {handshake_ms}"
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(NetworkError::Config("connect_timeout must be positive".into()));
        }
        if self.write_timeout.is_zero() {
            return Err(NetworkError::Config("write_timeout must be positive".into()));
        }
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(NetworkError::Config(
                "probe_interval and probe_timeout must be positive".into(),
            ));
        }
        if self.max_failed_probes == 0 {
            return Err(NetworkError::Config("max_failed_probes must be at least 1".into()));
        }
        if self.dedup_capacity == 0 {
            return Err(NetworkError::Config("dedup_capacity must be at least 1".into()));
        }
        if self.max_datagram_size < MIN_DATAGRAM_SIZE || self.max_datagram_size > 65_507 {
            return Err(NetworkError::Config(format!(
                "max_datagram_size must be {MIN_DATAGRAM_SIZE}..=65507, got {}",
                self.max_datagram_size
            )));
        }
        if self.event_capacity == 0 {
            return Err(NetworkError::Config("event_capacity must be at least 1".into()));
        }
        if let AdvertisedAddress::Literal(host) = &self.advertised_address {
            if host.trim().is_empty() {
                return Err(NetworkError::Config("advertised literal address is empty".into()));
            }
        }
        Ok(())
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing, unreadable or out of range.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => match config.validate() {
                        Ok(()) => return config,
                        Err(e) => tracing::warn!("Rejected config file, using defaults: {e}"),
                    },
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
