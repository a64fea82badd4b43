//! IPv6 addressing and per-connection IPv6 transmit parameters.
//!
//! # References
//! - RFC 8200: Internet Protocol, Version 6

use crate::error::{NetError, NetResult};

/// IPv6 address length in bytes
pub const IPV6_ADDR_LEN: usize = 16;

/// Flow label is a 20-bit field
pub const IPV6_FLOW_LABEL_MAX: u32 = 0x000F_FFFF;

/// Default traffic class
pub const IPV6_TRAFFIC_CLASS_DEFAULT: u8 = 0;

/// Default hop limit
pub const IPV6_HOP_LIMIT_DEFAULT: u8 = 128;

/// IPv6 address (16 bytes, network order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv6Addr(pub [u8; 16]);

impl Ipv6Addr {
    /// `::`
    pub const UNSPECIFIED: Ipv6Addr = Ipv6Addr([0; 16]);

    /// `::1`
    pub const LOCALHOST: Ipv6Addr = Ipv6Addr([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    /// Build from eight 16-bit groups
    pub const fn from_segments(seg: [u16; 8]) -> Self {
        let mut out = [0u8; 16];
        let mut i = 0;
        while i < 8 {
            out[2 * i] = (seg[i] >> 8) as u8;
            out[2 * i + 1] = seg[i] as u8;
            i += 1;
        }
        Ipv6Addr(out)
    }

    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 16]
    }

    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }

    #[inline]
    pub fn octets(&self) -> [u8; 16] {
        self.0
    }
}

impl core::fmt::Display for Ipv6Addr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, pair) in self.0.chunks_exact(2).enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{:x}", u16::from_be_bytes([pair[0], pair[1]]))?;
        }
        Ok(())
    }
}

/// IPv6 header fields a connection applies to every datagram it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6TxParams {
    pub traffic_class: u8,
    /// 20-bit flow label
    pub flow_label: u32,
    pub hop_limit: u8,
}

impl Default for Ipv6TxParams {
    fn default() -> Self {
        Self {
            traffic_class: IPV6_TRAFFIC_CLASS_DEFAULT,
            flow_label: 0,
            hop_limit: IPV6_HOP_LIMIT_DEFAULT,
        }
    }
}

/// Validate a flow label: must fit in 20 bits.
pub fn validate_flow_label(label: u32) -> NetResult<()> {
    if label > IPV6_FLOW_LABEL_MAX {
        return Err(NetError::InvalidArg);
    }
    Ok(())
}

/// Validate a hop limit: zero is never transmittable.
pub fn validate_hop_limit(hop_limit: u8) -> NetResult<()> {
    if hop_limit == 0 {
        return Err(NetError::InvalidArg);
    }
    Ok(())
}
