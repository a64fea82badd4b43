//! Sequence number arithmetic (RFC 793 Section 3.3).
//!
//! All comparisons are modulo 2^32: `a` precedes `b` when the signed
//! distance from `b` to `a` is negative.

/// Check if sequence number a is less than b (with wraparound)
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Check if sequence number a is less than or equal to b (with wraparound)
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// Check if sequence number a is greater than b (with wraparound)
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Check if sequence number a is greater than or equal to b (with wraparound)
#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Check if sequence number seq is within window [left, left+size)
#[inline]
pub fn seq_in_window(seq: u32, left: u32, size: u32) -> bool {
    size != 0 && seq.wrapping_sub(left) < size
}

/// RFC 793 segment acceptability test against the receive window.
///
/// `seg_len` counts SYN and FIN.  A zero-length segment is acceptable at
/// `rcv_nxt` even with a closed window.
pub fn seg_acceptable(seg_seq: u32, seg_len: u32, rcv_nxt: u32, rcv_wnd: u32) -> bool {
    match (seg_len, rcv_wnd) {
        (0, 0) => seg_seq == rcv_nxt,
        (0, _) => seq_in_window(seg_seq, rcv_nxt, rcv_wnd),
        (_, 0) => false,
        (_, _) => {
            let last = seg_seq.wrapping_add(seg_len - 1);
            seq_in_window(seg_seq, rcv_nxt, rcv_wnd) || seq_in_window(last, rcv_nxt, rcv_wnd)
        }
    }
}
