//! Connection addresses, address families and protocol list indices.
//!
//! A [`ConnAddr`] is the opaque byte form the connection lists compare:
//!
//! ```text
//! IPv4: | port (2) | IPv4 address (4)  |            6 bytes
//! IPv6: | port (2) | IPv6 address (16) |           18 bytes
//! ```
//!
//! Both fields are stored in network byte order, so list comparisons are
//! plain byte-slice equality.

use crate::error::{NetError, NetResult};
use crate::ipv4::{Ipv4Addr, IPV4_ADDR_LEN};
use crate::ipv6::{Ipv6Addr, IPV6_ADDR_LEN};

/// Port field length
pub const CONN_ADDR_PORT_LEN: usize = 2;
/// Encoded IPv4 connection address length
pub const CONN_ADDR_LEN_V4: usize = CONN_ADDR_PORT_LEN + IPV4_ADDR_LEN;
/// Encoded IPv6 connection address length
pub const CONN_ADDR_LEN_V6: usize = CONN_ADDR_PORT_LEN + IPV6_ADDR_LEN;
/// Largest encoded connection address
pub const CONN_ADDR_LEN_MAX: usize = CONN_ADDR_LEN_V6;

// ============================================================================
// IP Address
// ============================================================================

/// Version-tagged IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl IpAddr {
    pub fn is_unspecified(&self) -> bool {
        match self {
            IpAddr::V4(a) => a.is_unspecified(),
            IpAddr::V6(a) => a.is_unspecified(),
        }
    }

    pub fn family(&self) -> ConnFamily {
        match self {
            IpAddr::V4(_) => ConnFamily::Ipv4Sock,
            IpAddr::V6(_) => ConnFamily::Ipv6Sock,
        }
    }
}

impl From<Ipv4Addr> for IpAddr {
    fn from(a: Ipv4Addr) -> Self {
        IpAddr::V4(a)
    }
}

impl From<Ipv6Addr> for IpAddr {
    fn from(a: Ipv6Addr) -> Self {
        IpAddr::V6(a)
    }
}

impl core::fmt::Display for IpAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IpAddr::V4(a) => write!(f, "{}", a),
            IpAddr::V6(a) => write!(f, "[{}]", a),
        }
    }
}

// ============================================================================
// Family / Protocol Index
// ============================================================================

/// Socket address family of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnFamily {
    Ipv4Sock,
    Ipv6Sock,
}

/// Selects one of the connection lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnProtoIx {
    Ipv4Tcp,
    Ipv4Udp,
    Ipv6Tcp,
    Ipv6Udp,
}

/// Number of connection lists
pub const CONN_PROTO_IX_NBR: usize = 4;

impl ConnProtoIx {
    pub const ALL: [ConnProtoIx; CONN_PROTO_IX_NBR] = [
        ConnProtoIx::Ipv4Tcp,
        ConnProtoIx::Ipv4Udp,
        ConnProtoIx::Ipv6Tcp,
        ConnProtoIx::Ipv6Udp,
    ];

    /// List table index
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn family(self) -> ConnFamily {
        match self {
            ConnProtoIx::Ipv4Tcp | ConnProtoIx::Ipv4Udp => ConnFamily::Ipv4Sock,
            ConnProtoIx::Ipv6Tcp | ConnProtoIx::Ipv6Udp => ConnFamily::Ipv6Sock,
        }
    }

    pub fn is_tcp(self) -> bool {
        matches!(self, ConnProtoIx::Ipv4Tcp | ConnProtoIx::Ipv6Tcp)
    }

    /// Whether this list was compiled in.
    pub fn is_available(self) -> bool {
        let family_ok = match self.family() {
            ConnFamily::Ipv4Sock => cfg!(feature = "ipv4"),
            ConnFamily::Ipv6Sock => cfg!(feature = "ipv6"),
        };
        // UDP connections only use the list index; TCP needs the state machine.
        family_ok && (!self.is_tcp() || cfg!(feature = "tcp"))
    }

    /// Index of the TCP list for `family`.
    pub fn tcp_for(family: ConnFamily) -> ConnProtoIx {
        match family {
            ConnFamily::Ipv4Sock => ConnProtoIx::Ipv4Tcp,
            ConnFamily::Ipv6Sock => ConnProtoIx::Ipv6Tcp,
        }
    }
}

// ============================================================================
// Connection Address
// ============================================================================

/// Port + IP address in network byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnAddr {
    len: u8,
    buf: [u8; CONN_ADDR_LEN_MAX],
}

impl ConnAddr {
    pub fn from_v4(ip: Ipv4Addr, port: u16) -> Self {
        let mut buf = [0u8; CONN_ADDR_LEN_MAX];
        buf[..2].copy_from_slice(&port.to_be_bytes());
        buf[2..CONN_ADDR_LEN_V4].copy_from_slice(&ip.0);
        ConnAddr {
            len: CONN_ADDR_LEN_V4 as u8,
            buf,
        }
    }

    pub fn from_v6(ip: Ipv6Addr, port: u16) -> Self {
        let mut buf = [0u8; CONN_ADDR_LEN_MAX];
        buf[..2].copy_from_slice(&port.to_be_bytes());
        buf[2..CONN_ADDR_LEN_V6].copy_from_slice(&ip.0);
        ConnAddr {
            len: CONN_ADDR_LEN_V6 as u8,
            buf,
        }
    }

    pub fn new(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(a) => Self::from_v4(a, port),
            IpAddr::V6(a) => Self::from_v6(a, port),
        }
    }

    /// Decode from raw bytes; only the two encoded lengths are accepted.
    pub fn from_bytes(bytes: &[u8]) -> NetResult<Self> {
        if bytes.len() != CONN_ADDR_LEN_V4 && bytes.len() != CONN_ADDR_LEN_V6 {
            return Err(NetError::InvalidArg);
        }
        let mut buf = [0u8; CONN_ADDR_LEN_MAX];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(ConnAddr {
            len: bytes.len() as u8,
            buf,
        })
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn port(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    /// Raw port bytes, as compared by the list search.
    #[inline]
    pub fn port_bytes(&self) -> [u8; 2] {
        [self.buf[0], self.buf[1]]
    }

    #[inline]
    pub fn ip_bytes(&self) -> &[u8] {
        &self.buf[CONN_ADDR_PORT_LEN..self.len as usize]
    }

    pub fn ip(&self) -> IpAddr {
        if self.is_v6() {
            let mut a = [0u8; IPV6_ADDR_LEN];
            a.copy_from_slice(self.ip_bytes());
            IpAddr::V6(Ipv6Addr(a))
        } else {
            let mut a = [0u8; IPV4_ADDR_LEN];
            a.copy_from_slice(self.ip_bytes());
            IpAddr::V4(Ipv4Addr(a))
        }
    }

    #[inline]
    pub fn is_v6(&self) -> bool {
        self.len as usize == CONN_ADDR_LEN_V6
    }

    pub fn family(&self) -> ConnFamily {
        if self.is_v6() {
            ConnFamily::Ipv6Sock
        } else {
            ConnFamily::Ipv4Sock
        }
    }

    /// Same port, unspecified IP.
    pub fn wildcard(&self) -> Self {
        let mut w = *self;
        w.buf[CONN_ADDR_PORT_LEN..].fill(0);
        w
    }

    /// True when the IP part is unspecified.
    pub fn is_wildcard(&self) -> bool {
        self.ip_bytes().iter().all(|&b| b == 0)
    }
}

impl core::fmt::Debug for ConnAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port())
    }
}

impl core::fmt::Display for ConnAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_layout() {
        let a = ConnAddr::from_v4(Ipv4Addr::new(10, 0, 0, 1), 80);
        assert_eq!(a.as_bytes(), &[0, 80, 10, 0, 0, 1]);
        assert_eq!(a.port(), 80);
        assert_eq!(a.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(a.family(), ConnFamily::Ipv4Sock);
        assert!(!a.is_wildcard());
    }

    #[test]
    fn test_wildcard_keeps_port() {
        let a = ConnAddr::from_v6(Ipv6Addr::LOCALHOST, 443);
        let w = a.wildcard();
        assert_eq!(w.port(), 443);
        assert!(w.is_wildcard());
        assert_eq!(w.len(), CONN_ADDR_LEN_V6);
        assert_ne!(a, w);
    }

    #[test]
    fn test_from_bytes_length() {
        assert_eq!(ConnAddr::from_bytes(&[0; 5]), Err(NetError::InvalidArg));
        let a = ConnAddr::from_bytes(&[0x1f, 0x90, 192, 168, 1, 2]).unwrap();
        assert_eq!(a.port(), 8080);
    }

    #[test]
    fn test_proto_ix() {
        assert_eq!(ConnProtoIx::Ipv6Udp.family(), ConnFamily::Ipv6Sock);
        assert!(ConnProtoIx::Ipv4Tcp.is_tcp());
        assert_eq!(ConnProtoIx::tcp_for(ConnFamily::Ipv6Sock), ConnProtoIx::Ipv6Tcp);
        for (i, ix) in ConnProtoIx::ALL.iter().enumerate() {
            assert_eq!(ix.index(), i);
        }
    }
}
