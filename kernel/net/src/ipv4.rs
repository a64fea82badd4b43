//! IPv4 addressing, Internet checksum and per-connection IPv4 transmit
//! parameters.
//!
//! Fragmentation, reassembly and ICMP belong to the IP layer proper; this
//! module only carries what connection records and TCP segments need.
//!
//! # References
//! - RFC 791: Internet Protocol
//! - RFC 1071: Computing the Internet Checksum

use crate::error::{NetError, NetResult};

/// IPv4 address length in bytes
pub const IPV4_ADDR_LEN: usize = 4;

/// Don't Fragment flag (in the flags/fragment-offset field position)
pub const IPV4_FLAG_DONT_FRAG: u16 = 0x4000;

/// More Fragments flag; never valid as a per-connection transmit flag
pub const IPV4_FLAG_MORE_FRAG: u16 = 0x2000;

/// Reserved flag bit, must be zero
pub const IPV4_FLAG_RESERVED: u16 = 0x8000;

/// Type-of-service "must be zero" bit (RFC 1349)
pub const IPV4_TOS_MBZ_MASK: u8 = 0x01;

/// Default type of service (routine, normal delay/throughput/reliability)
pub const IPV4_TOS_DEFAULT: u8 = 0x00;

/// Minimum transmit TTL
pub const IPV4_TTL_MIN: u8 = 1;

/// Default transmit TTL
pub const IPV4_TTL_DEFAULT: u8 = 128;

// ============================================================================
// IPv4 Address
// ============================================================================

/// IPv4 address (4 bytes, network order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// Create from 4 octets
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Addr([a, b, c, d])
    }

    /// All zeros (0.0.0.0), the wildcard "any interface" address
    pub const UNSPECIFIED: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

    /// Loopback (127.0.0.1)
    pub const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    /// Broadcast (255.255.255.255)
    pub const BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

    /// Check if this is a multicast address (224.0.0.0/4)
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 0xe0
    }

    /// Check if this is the broadcast address
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [255, 255, 255, 255]
    }

    /// Check if this is the unspecified address (0.0.0.0)
    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0, 0, 0, 0]
    }

    /// Get the raw bytes
    #[inline]
    pub fn octets(&self) -> [u8; 4] {
        self.0
    }
}

impl core::fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

// ============================================================================
// Transmit Parameters
// ============================================================================

/// IPv4 header fields a connection applies to every datagram it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4TxParams {
    /// Type of service
    pub tos: u8,
    /// Time to live
    pub ttl: u8,
    /// Transmit flags (only Don't Fragment is allowed)
    pub flags: u16,
}

impl Default for Ipv4TxParams {
    fn default() -> Self {
        Self {
            tos: IPV4_TOS_DEFAULT,
            ttl: IPV4_TTL_DEFAULT,
            flags: 0,
        }
    }
}

/// Validate a type-of-service value: the MBZ bit must be clear.
pub fn validate_tos(tos: u8) -> NetResult<()> {
    if tos & IPV4_TOS_MBZ_MASK != 0 {
        return Err(NetError::InvalidArg);
    }
    Ok(())
}

/// Validate a transmit TTL: zero would be discarded by the first hop.
pub fn validate_ttl(ttl: u8) -> NetResult<()> {
    if ttl < IPV4_TTL_MIN {
        return Err(NetError::InvalidArg);
    }
    Ok(())
}

/// Validate transmit flags: only Don't Fragment may be requested.
pub fn validate_flags(flags: u16) -> NetResult<()> {
    if flags & !IPV4_FLAG_DONT_FRAG != 0 {
        return Err(NetError::InvalidArg);
    }
    Ok(())
}

// ============================================================================
// Internet Checksum (RFC 1071)
// ============================================================================

/// Add `data` as big-endian 16-bit words to a running 32-bit sum.
///
/// An odd trailing byte is padded with a zero low byte.  The sum is not
/// folded; callers chain several regions and fold once.
pub fn checksum_accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold a 32-bit running sum to 16 bits and return its one's complement.
pub fn checksum_finish(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Compute the Internet checksum over the first `len` bytes of `data`.
pub fn compute_checksum(data: &[u8], len: usize) -> u16 {
    let capped = core::cmp::min(data.len(), len);
    checksum_finish(checksum_accumulate(0, &data[..capped]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_rfc1071_example() {
        // RFC 1071 section 3 example words: 0001 f203 f4f5 f6f7
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(compute_checksum(&data, data.len()), !0xddf2);
    }

    #[test]
    fn test_checksum_odd_length() {
        let data = [0x12, 0x34, 0x56];
        let sum = checksum_accumulate(0, &data);
        assert_eq!(sum, 0x1234 + 0x5600);
    }

    #[test]
    fn test_tx_param_validation() {
        assert!(validate_tos(0x10).is_ok());
        assert_eq!(validate_tos(0x11), Err(NetError::InvalidArg));
        assert_eq!(validate_ttl(0), Err(NetError::InvalidArg));
        assert!(validate_ttl(64).is_ok());
        assert!(validate_flags(IPV4_FLAG_DONT_FRAG).is_ok());
        assert!(validate_flags(0).is_ok());
        assert_eq!(validate_flags(IPV4_FLAG_MORE_FRAG), Err(NetError::InvalidArg));
        assert_eq!(validate_flags(IPV4_FLAG_RESERVED), Err(NetError::InvalidArg));
    }

    #[test]
    fn test_unspecified() {
        assert!(Ipv4Addr::UNSPECIFIED.is_unspecified());
        assert!(!Ipv4Addr::LOCALHOST.is_unspecified());
        assert!(Ipv4Addr::new(224, 0, 0, 1).is_multicast());
    }
}
