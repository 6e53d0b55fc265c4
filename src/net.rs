//! Network destinations and their wire encoding.
//!
//! Addresses are type tagged: `0x01` IPv4 (4 bytes), `0x02` domain (1 byte
//! length + name), `0x03` IPv6 (16 bytes), each followed by a big-endian
//! port.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x02;
const ADDR_IPV6: u8 = 0x03;

/// Longest domain name the address encoding can carry.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Transport network of a destination.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// Stream transport
    Tcp = 0x01,
    /// Datagram transport
    Udp = 0x02,
}

impl TryFrom<u8> for Network {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Tcp),
            0x02 => Ok(Self::Udp),
            _ => Err(Error::UnknownNetwork(v)),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// Host part of a destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Literal IP address
    Ip(IpAddr),
    /// Domain name, resolved by whoever dials it
    Domain(String),
}

impl Address {
    /// Parse a host string, preferring an IP literal.
    pub fn parse(host: &str) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Domain(host.to_string()),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Address::Ip(IpAddr::V4(_)) => 1 + 4,
            Address::Ip(IpAddr::V6(_)) => 1 + 16,
            Address::Domain(d) => 1 + 1 + d.len(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Domain(d) => f.write_str(d),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }
}

/// Network target of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Transport network
    pub network: Network,
    /// Host
    pub address: Address,
    /// Port
    pub port: u16,
}

impl Destination {
    /// TCP destination.
    pub fn tcp(address: impl Into<Address>, port: u16) -> Self {
        Self {
            network: Network::Tcp,
            address: address.into(),
            port,
        }
    }

    /// UDP destination.
    pub fn udp(address: impl Into<Address>, port: u16) -> Self {
        Self {
            network: Network::Udp,
            address: address.into(),
            port,
        }
    }

    /// Parse `host:port` for the given network.
    pub fn parse(network: Network, s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::invalid_target(format!("missing port in {:?}", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::invalid_target(format!("bad port in {:?}: {}", s, e)))?;
        Ok(Self {
            network,
            address: Address::parse(host),
            port,
        })
    }

    /// A destination is valid when it can be encoded and dialed: non-zero
    /// port and, for domains, a name of 1..=255 bytes.
    pub fn is_valid(&self) -> bool {
        if self.port == 0 {
            return false;
        }
        match &self.address {
            Address::Ip(_) => true,
            Address::Domain(d) => !d.is_empty() && d.len() <= MAX_DOMAIN_LEN,
        }
    }

    /// Socket address when the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.address {
            Address::Ip(ip) => Some(SocketAddr::new(ip, self.port)),
            Address::Domain(_) => None,
        }
    }

    /// Bytes `put_address_port` will write.
    pub fn encoded_len(&self) -> usize {
        self.address.encoded_len() + 2
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.network, self.address, self.port)
    }
}

/// Write the type-tagged address followed by the port.
pub fn put_address_port<B: BufMut>(buf: &mut B, address: &Address, port: u16) -> Result<()> {
    match address {
        Address::Ip(IpAddr::V4(ip)) => {
            buf.put_u8(ADDR_IPV4);
            buf.put_slice(&ip.octets());
        }
        Address::Ip(IpAddr::V6(ip)) => {
            buf.put_u8(ADDR_IPV6);
            buf.put_slice(&ip.octets());
        }
        Address::Domain(d) => {
            if d.is_empty() || d.len() > MAX_DOMAIN_LEN {
                return Err(Error::invalid_target(format!(
                    "domain length {} out of range",
                    d.len()
                )));
            }
            buf.put_u8(ADDR_DOMAIN);
            buf.put_u8(d.len() as u8);
            buf.put_slice(d.as_bytes());
        }
    }
    buf.put_u16(port);
    Ok(())
}

/// Read a type-tagged address and port written by [`put_address_port`].
pub fn get_address_port<B: Buf>(buf: &mut B) -> Result<(Address, u16)> {
    if buf.remaining() < 1 {
        return Err(Error::invalid_frame("address type missing"));
    }
    let address = match buf.get_u8() {
        ADDR_IPV4 => {
            ensure(buf, 4 + 2, "IPv4 address too short")?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Address::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ADDR_IPV6 => {
            ensure(buf, 16 + 2, "IPv6 address too short")?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Address::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        ADDR_DOMAIN => {
            ensure(buf, 1, "domain length missing")?;
            let len = buf.get_u8() as usize;
            ensure(buf, len + 2, "domain address truncated")?;
            let mut name = vec![0u8; len];
            buf.copy_to_slice(&mut name);
            let name = String::from_utf8(name)
                .map_err(|_| Error::invalid_frame("domain is not valid UTF-8"))?;
            if name.is_empty() {
                return Err(Error::invalid_frame("empty domain"));
            }
            Address::Domain(name)
        }
        other => {
            return Err(Error::invalid_frame(format!(
                "unknown address type: 0x{:02x}",
                other
            )))
        }
    };
    Ok((address, buf.get_u16()))
}

fn ensure<B: Buf>(buf: &B, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::invalid_frame(what));
    }
    Ok(())
}
