//! Socket plumbing: address parsing, listener port sweep, outbound connects
//! and the shared datagram socket.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::debug;

use crate::error::NetworkError;

/// Port used when an address omits one, and the default hosting port.
pub const DEFAULT_PORT: u16 = 25566;

/// A user-supplied peer address before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    /// Parse `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6 literal.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, NetworkError> {
        let input = input.trim();
        let invalid = || NetworkError::InvalidAddress(input.to_string());
        if input.is_empty() {
            return Err(invalid());
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(invalid)?),
            };
            (host, port)
        } else if input.parse::<Ipv6Addr>().is_ok() {
            (input, None)
        } else if let Some((host, port)) = input.rsplit_once(':') {
            (host, Some(port))
        } else {
            (input, None)
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }
        let port = match port {
            Some(raw) => raw.parse::<u16>().map_err(|_| invalid())?,
            None => default_port,
        };
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Resolve through DNS (or parse a literal). The first result wins.
    pub async fn resolve(&self) -> Result<SocketAddr, NetworkError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| NetworkError::InvalidAddress(format!("{self}: {e}")))?;
        addrs
            .next()
            .ok_or_else(|| NetworkError::InvalidAddress(format!("{self}: no addresses found")))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Bind a listener on the first free port in `preferred .. preferred + sweep`.
/// A preferred port of 0 asks the OS for an ephemeral port.
pub async fn bind_with_sweep(
    ip: IpAddr,
    preferred: u16,
    sweep: u16,
) -> Result<TcpListener, NetworkError> {
    if preferred == 0 {
        return Ok(TcpListener::bind((ip, 0)).await?);
    }

    let end = (u32::from(preferred) + u32::from(sweep.max(1))).min(u32::from(u16::MAX) + 1);
    for port in u32::from(preferred)..end {
        let port = port as u16;
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => {
                if port != preferred {
                    debug!("Port {preferred} unavailable, bound {port} instead");
                }
                return Ok(listener);
            }
            Err(e) => debug!("Cannot bind {ip}:{port}: {e}"),
        }
    }

    Err(NetworkError::NoAvailablePort {
        start: preferred,
        end: (end - 1) as u16,
    })
}

/// Bind the shared datagram socket.
pub async fn bind_datagram(ip: IpAddr, port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind((ip, port)).await
}

/// Address to bind a datagram socket on for reaching `peer`: the bind
/// address when its family matches, the unspecified address of the peer's
/// family when the bind address is a wildcard, otherwise `None`.
pub fn datagram_bind_ip(bind: IpAddr, peer: IpAddr) -> Option<IpAddr> {
    if bind.is_ipv4() == peer.is_ipv4() {
        return Some(bind);
    }
    if !bind.is_unspecified() {
        return None;
    }
    Some(match peer {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    })
}

/// Open a stream to `addr` within `timeout`. The error carries the cause.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, NetworkError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Cannot disable Nagle on {addr}: {e}");
            }
            Ok(stream)
        }
        Ok(Err(source)) => Err(NetworkError::ConnectFailed { addr, source }),
        Err(_) => Err(NetworkError::ConnectFailed {
            addr,
            source: io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no response within {timeout:?}"),
            ),
        }),
    }
}

/// The address of the interface used for outbound traffic. No packets are sent.
pub async fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Best-effort check whether `target` is this node's own listener.
pub fn is_self_address(target: SocketAddr, listen_port: Option<u16>, local_ips: &[IpAddr]) -> bool {
    let Some(port) = listen_port else {
        return false;
    };
    if target.port() != port {
        return false;
    }
    let ip = target.ip();
    ip.is_loopback() || ip.is_unspecified() || local_ips.contains(&ip)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<PeerAddress, NetworkError> {
        PeerAddress::parse(input, DEFAULT_PORT)
    }

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(parse("example.org").unwrap().port, DEFAULT_PORT);
        let addr = parse("10.0.0.2:4000").unwrap();
        assert_eq!((addr.host.as_str(), addr.port), ("10.0.0.2", 4000));

        let v6 = parse("[::1]:4001").unwrap();
        assert_eq!((v6.host.as_str(), v6.port), ("::1", 4001));
        assert_eq!(parse("[fe80::1]").unwrap().port, DEFAULT_PORT);
        assert_eq!(parse("fe80::1").unwrap().host, "fe80::1");
        assert_eq!(v6.to_string(), "[::1]:4001");
    }

    #[test]
    fn test_parse_address_rejects_bad_input() {
        for bad in ["", "  ", "host:0", "host:70000", "host:abc", "[::1", "[::1]x", ":25566"] {
            assert!(
                matches!(parse(bad), Err(NetworkError::InvalidAddress(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let addr = parse("127.0.0.1:4002").unwrap().resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:4002".parse().unwrap());
    }

    #[tokio::test]
    async fn test_sweep_skips_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let ip: IpAddr = Ipv4Addr::LOCALHOST.into();

        let err = bind_with_sweep(ip, port, 1).await.unwrap_err();
        assert!(matches!(err, NetworkError::NoAvailablePort { start, end } if start == port && end == port));

        let listener = bind_with_sweep(ip, port, 20).await.unwrap();
        let bound = listener.local_addr().unwrap().port();
        assert!(bound > port && bound < port.saturating_add(20));
    }

    #[tokio::test]
    async fn test_sweep_zero_is_ephemeral() {
        let listener = bind_with_sweep(Ipv4Addr::LOCALHOST.into(), 0, 100).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_carries_cause() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        match connect(addr, Duration::from_secs(2)).await {
            Err(NetworkError::ConnectFailed { addr: failed, source }) => {
                assert_eq!(failed, addr);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_self_address_heuristic() {
        let lan: IpAddr = "192.168.1.20".parse().unwrap();
        let me = |s: &str| is_self_address(s.parse().unwrap(), Some(25566), &[lan]);

        assert!(me("127.0.0.1:25566"));
        assert!(me("192.168.1.20:25566"));
        assert!(me("0.0.0.0:25566"));
        assert!(!me("127.0.0.1:25567"));
        assert!(!me("192.168.1.21:25566"));
        assert!(!is_self_address("127.0.0.1:25566".parse().unwrap(), None, &[]));
    }

    #[test]
    fn test_datagram_bind_follows_peer_family() {
        let any4 = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let v4: IpAddr = "10.0.0.7".parse().unwrap();
        let v6: IpAddr = "2001:db8::7".parse().unwrap();

        assert_eq!(datagram_bind_ip(any4, v4), Some(any4));
        assert_eq!(
            datagram_bind_ip(any4, v6),
            Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        );
        let lo: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(datagram_bind_ip(lo, v4), Some(lo));
        assert_eq!(datagram_bind_ip(lo, v6), None);
    }
}
