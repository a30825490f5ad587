//! Endpoint: immutable IPv4 address + port, resolution, 6-byte wire form, local outward address.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Deserializer};

/// Encoded size: 4 address bytes + 2 port bytes, both network order.
pub const ENCODED_LEN: usize = 6;

/// Address of a peer. Value type: equality, hash and order are structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    address: Ipv4Addr,
    port: u16,
}

impl Endpoint {
    pub const fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    /// Resolve `hostname` and keep the first IPv4 result. Hosts with only IPv6 records fail.
    pub fn resolve(hostname: &str, port: u16) -> Result<Self, EndpointError> {
        let mut addrs = (hostname, port)
            .to_socket_addrs()
            .map_err(|source| EndpointError::Lookup {
                host: hostname.to_string(),
                source,
            })?;
        addrs
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(Self::from(v4)),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| EndpointError::Resolution(hostname.to_string()))
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn encode(&self) -> [u8; ENCODED_LEN] {
        let mut out = [0u8; ENCODED_LEN];
        out[..4].copy_from_slice(&self.address.octets());
        out[4..].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    /// Append the encoded form to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.encode());
    }

    /// Decode from the front of `bytes`; extra trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, EndpointError> {
        if bytes.len() < ENCODED_LEN {
            return Err(EndpointError::Truncated(bytes.len()));
        }
        let address = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Ok(Self { address, port })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl From<Endpoint> for SocketAddrV4 {
    fn from(e: Endpoint) -> Self {
        SocketAddrV4::new(e.address, e.port)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(e: Endpoint) -> Self {
        SocketAddr::V4(e.into())
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddrV4>().map(Self::from)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("lookup of {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no IPv4 address for {0}")]
    Resolution(String),
    #[error("truncated endpoint: {0} of 6 bytes")]
    Truncated(usize),
}

/// One address record of a network interface, as reported by the OS.
#[derive(Debug, Clone)]
pub struct InterfaceAddr {
    pub name: String,
    pub ip: IpAddr,
    pub loopback: bool,
    pub up: bool,
    pub running: bool,
}

/// Pick the first non-loopback interface that is up and running with an IPv4 address.
/// Records are in OS order; an interface may contribute several.
pub fn select_outward_address<I>(records: I) -> Option<(String, Ipv4Addr)>
where
    I: IntoIterator<Item = InterfaceAddr>,
{
    records
        .into_iter()
        .filter(|r| !r.loopback && r.up && r.running)
        .find_map(|r| match r.ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some((r.name, v4)),
            _ => None,
        })
}

#[cfg(unix)]
fn scan_interfaces() -> Option<Vec<InterfaceAddr>> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let interfaces = match getifaddrs() {
        Ok(i) => i,
        Err(e) => {
            tracing::warn!(error = %e, "interface scan failed");
            return None;
        }
    };
    Some(
        interfaces
            .filter_map(|iface| {
                let sin = iface.address.as_ref()?.as_sockaddr_in()?;
                Some(InterfaceAddr {
                    ip: IpAddr::V4(sin.ip()),
                    loopback: iface.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                    up: iface.flags.contains(InterfaceFlags::IFF_UP),
                    running: iface.flags.contains(InterfaceFlags::IFF_RUNNING),
                    name: iface.interface_name,
                })
            })
            .collect(),
    )
}

#[cfg(not(unix))]
fn scan_interfaces() -> Option<Vec<InterfaceAddr>> {
    None
}

static LOCAL_ADDRESS: OnceLock<Ipv4Addr> = OnceLock::new();

/// This host's outward IPv4 address. Scanned once; a failed scan is not cached, so the next call retries.
pub fn local_outward_address() -> Option<Ipv4Addr> {
    if let Some(addr) = LOCAL_ADDRESS.get() {
        return Some(*addr);
    }
    let (interface, found) = select_outward_address(scan_interfaces()?)?;
    let addr = *LOCAL_ADDRESS.get_or_init(|| found);
    tracing::info!(%addr, %interface, "local outward address");
    Some(addr)
}
