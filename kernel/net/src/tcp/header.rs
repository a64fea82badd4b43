//! TCP header and option codec, pseudo-header checksums, segment builder.
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Source Port           |       Destination Port        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                        Sequence Number                        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                     Acknowledgment Number                     |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Data  |           |U|A|P|R|S|F|                               |
//! | Offs  | Reserved  |R|C|S|S|Y|I|            Window             |
//! |       |           |G|K|H|T|N|N|                               |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |           Checksum            |         Urgent Pointer        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Options (if data offset > 5)               |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```

use alloc::vec;
use alloc::vec::Vec;

use super::{TcpError, TcpResult};
use crate::addr::IpAddr;
use crate::ipv4::{checksum_accumulate, checksum_finish};
use crate::ipv6::Ipv6Addr;

/// Minimum TCP header size (no options)
pub const TCP_HEADER_MIN_LEN: usize = 20;

/// Maximum TCP header size (with 40 bytes of options)
pub const TCP_HEADER_MAX_LEN: usize = 60;

/// IP protocol number for TCP
pub const TCP_PROTO: u8 = 6;

/// FIN flag - no more data from sender
pub const TCP_FLAG_FIN: u8 = 0x01;
/// SYN flag - synchronize sequence numbers
pub const TCP_FLAG_SYN: u8 = 0x02;
/// RST flag - reset the connection
pub const TCP_FLAG_RST: u8 = 0x04;
/// PSH flag - push function
pub const TCP_FLAG_PSH: u8 = 0x08;
/// ACK flag - acknowledgment field significant
pub const TCP_FLAG_ACK: u8 = 0x10;
/// URG flag - urgent pointer field significant
pub const TCP_FLAG_URG: u8 = 0x20;

/// Mask of the six RFC 793 control bits
pub const TCP_FLAG_MASK: u8 = 0x3F;

// Option kinds
const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WSCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_SACK: u8 = 5;
const OPT_ECHO: u8 = 6;
const OPT_ECHO_REPLY: u8 = 7;
const OPT_TIMESTAMP: u8 = 8;

// ============================================================================
// TCP Header
// ============================================================================

/// Parsed TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    /// Acknowledgment number (valid if ACK flag set)
    pub ack_num: u32,
    /// Data offset in 32-bit words (5-15)
    pub data_offset: u8,
    /// Control flags (low six bits)
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    /// Urgent pointer; never acted on and always sent as zero
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Create a new TCP header with the given parameters
    pub fn new(
        src_port: u16,
        dst_port: u16,
        seq_num: u32,
        ack_num: u32,
        flags: u8,
        window: u16,
    ) -> Self {
        Self {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            data_offset: 5,
            flags,
            window,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    /// Get the header length in bytes
    pub fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }

    pub fn is_psh(&self) -> bool {
        self.flags & TCP_FLAG_PSH != 0
    }

    /// Serialize the fixed 20-byte header (checksum as stored)
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_MIN_LEN] {
        let mut bytes = [0u8; TCP_HEADER_MIN_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.seq_num.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack_num.to_be_bytes());
        bytes[12] = self.data_offset << 4;
        bytes[13] = self.flags & TCP_FLAG_MASK;
        bytes[14..16].copy_from_slice(&self.window.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        bytes
    }
}

/// Parse the fixed TCP header.
///
/// Validates the data offset against the buffer; does not verify the
/// checksum.
pub fn parse_tcp_header(data: &[u8]) -> TcpResult<TcpHeader> {
    if data.len() < TCP_HEADER_MIN_LEN {
        return Err(TcpError::Truncated);
    }

    let data_offset = data[12] >> 4;
    if data_offset < 5 {
        return Err(TcpError::InvalidHeaderLen);
    }
    if data.len() < (data_offset as usize) * 4 {
        return Err(TcpError::Truncated);
    }

    Ok(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: data[13] & TCP_FLAG_MASK,
        window: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

// ============================================================================
// TCP Options
// ============================================================================

/// TCP option kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOptionKind {
    /// End of option list
    EndOfList,
    /// No-operation (padding)
    Nop,
    /// Maximum Segment Size
    Mss(u16),
    /// Window Scale (RFC 7323)
    WindowScale(u8),
    /// Selective Acknowledgment Permitted (RFC 2018)
    SackPermitted,
}

/// Options seen on a received segment.
///
/// Only the MSS is acted on; the rest are recognised so their lengths can
/// be validated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub sack_blocks: u8,
    pub echo: Option<u32>,
    pub echo_reply: Option<u32>,
    pub timestamps: Option<(u32, u32)>,
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Parse the option area of a validated header.
///
/// A recognised option with a wrong length, or any option running past
/// the header, rejects the whole segment.  Unknown options are skipped by
/// their length field.
pub fn parse_tcp_options(data: &[u8], header: &TcpHeader) -> TcpResult<TcpOptions> {
    let mut options = TcpOptions::default();
    let opts = &data[TCP_HEADER_MIN_LEN..header.header_len()];
    let mut i = 0;

    while i < opts.len() {
        let kind = opts[i];
        match kind {
            OPT_END => break,
            OPT_NOP => {
                i += 1;
                continue;
            }
            _ => {}
        }

        let len = *opts.get(i + 1).ok_or(TcpError::InvalidOption)? as usize;
        if len < 2 || i + len > opts.len() {
            return Err(TcpError::InvalidOption);
        }
        let body = &opts[i + 2..i + len];

        match kind {
            OPT_MSS if len == 4 => options.mss = Some(u16::from_be_bytes([body[0], body[1]])),
            OPT_WSCALE if len == 3 => options.window_scale = Some(body[0]),
            OPT_SACK_PERMITTED if len == 2 => options.sack_permitted = true,
            OPT_SACK if len >= 10 && (len - 2) % 8 == 0 => {
                options.sack_blocks = ((len - 2) / 8) as u8;
            }
            OPT_ECHO if len == 6 => options.echo = Some(be32(body)),
            OPT_ECHO_REPLY if len == 6 => options.echo_reply = Some(be32(body)),
            OPT_TIMESTAMP if len == 10 => {
                options.timestamps = Some((be32(&body[0..4]), be32(&body[4..8])));
            }
            OPT_MSS | OPT_WSCALE | OPT_SACK_PERMITTED | OPT_SACK | OPT_ECHO | OPT_ECHO_REPLY
            | OPT_TIMESTAMP => return Err(TcpError::InvalidOption),
            _ => {}
        }
        i += len;
    }

    Ok(options)
}

/// Serialize a single TCP option.
pub fn serialize_tcp_option(option: &TcpOptionKind) -> Vec<u8> {
    match *option {
        TcpOptionKind::EndOfList => vec![OPT_END],
        TcpOptionKind::Nop => vec![OPT_NOP],
        TcpOptionKind::Mss(mss) => {
            let m = mss.to_be_bytes();
            vec![OPT_MSS, 4, m[0], m[1]]
        }
        TcpOptionKind::WindowScale(scale) => vec![OPT_WSCALE, 3, scale],
        TcpOptionKind::SackPermitted => vec![OPT_SACK_PERMITTED, 2],
    }
}

/// Serialize options, terminated and zero-padded to a 32-bit boundary.
pub fn serialize_tcp_options(options: &[TcpOptionKind]) -> Vec<u8> {
    if options.is_empty() {
        return Vec::new();
    }

    let mut bytes = Vec::new();
    for opt in options {
        bytes.extend_from_slice(&serialize_tcp_option(opt));
        if matches!(opt, TcpOptionKind::EndOfList) {
            break;
        }
    }
    if bytes.len() % 4 != 0 {
        bytes.push(OPT_END);
    }
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
}

// ============================================================================
// Checksum
// ============================================================================

fn ipv6_form(addr: &IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V6(a) => *a,
        IpAddr::V4(a) => {
            let mut out = [0u8; 16];
            out[10] = 0xff;
            out[11] = 0xff;
            out[12..].copy_from_slice(&a.0);
            Ipv6Addr(out)
        }
    }
}

/// Running sum of the TCP pseudo-header.
///
/// IPv4: src(4) dst(4) zero(1) protocol(1) length(2).
/// IPv6: src(16) dst(16) length(4) zero(3) next-header(1).
fn pseudo_header_sum(src: &IpAddr, dst: &IpAddr, tcp_len: usize) -> u32 {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let mut pseudo = [0u8; 12];
            pseudo[0..4].copy_from_slice(&s.0);
            pseudo[4..8].copy_from_slice(&d.0);
            pseudo[9] = TCP_PROTO;
            pseudo[10..12].copy_from_slice(&(tcp_len as u16).to_be_bytes());
            checksum_accumulate(0, &pseudo)
        }
        _ => {
            let mut pseudo = [0u8; 40];
            pseudo[0..16].copy_from_slice(&ipv6_form(src).0);
            pseudo[16..32].copy_from_slice(&ipv6_form(dst).0);
            pseudo[32..36].copy_from_slice(&(tcp_len as u32).to_be_bytes());
            pseudo[39] = TCP_PROTO;
            checksum_accumulate(0, &pseudo)
        }
    }
}

/// Compute the checksum of a complete segment (checksum field zeroed).
pub fn compute_tcp_checksum(src: &IpAddr, dst: &IpAddr, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src, dst, segment.len());
    checksum_finish(checksum_accumulate(sum, segment))
}

/// Verify the checksum of a received segment.
pub fn verify_tcp_checksum(src: &IpAddr, dst: &IpAddr, segment: &[u8]) -> bool {
    compute_tcp_checksum(src, dst, segment) == 0
}

// ============================================================================
// Segment Builder
// ============================================================================

/// Build a complete segment: header, padded options, payload, checksum.
pub fn build_tcp_segment(
    src: &IpAddr,
    dst: &IpAddr,
    mut header: TcpHeader,
    options: &[TcpOptionKind],
    payload: &[u8],
) -> Vec<u8> {
    let options_bytes = serialize_tcp_options(options);
    let header_len = TCP_HEADER_MIN_LEN + options_bytes.len();
    debug_assert!(header_len <= TCP_HEADER_MAX_LEN, "TCP options too long");

    header.data_offset = (header_len / 4) as u8;
    header.checksum = 0;
    header.urgent_ptr = 0;

    let mut segment = Vec::with_capacity(header_len + payload.len());
    segment.extend_from_slice(&header.to_bytes());
    segment.extend_from_slice(&options_bytes);
    segment.extend_from_slice(payload);

    let checksum = compute_tcp_checksum(src, dst, &segment);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());
    segment
}
