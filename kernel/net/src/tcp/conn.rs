//! TCP connection record: sequence space, windows, queues and timers.
//!
//! The helpers here only touch the record itself.  Anything that needs the
//! connection table or the IP layer lives on `NetCore` (see `input`,
//! `output`, `app`).

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::congestion::CongestionCtl;
use super::rtt::RttEstimator;
use super::seq::{seq_ge, seq_gt, seq_le, seq_lt};
use super::timer::TcpTimers;
use super::{TcpConnId, TcpState, TCP_FLAG_FIN, TCP_FLAG_SYN};
use crate::config::TcpCfg;
use crate::conn::ConnId;
use crate::error::NetError;
use crate::kal::WaitQueue;

// ============================================================================
// Queued Segments
// ============================================================================

/// A sent, not yet acknowledged segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    /// Sequence number of the first octet (or of the SYN)
    pub seq: u32,
    pub data: Vec<u8>,
    /// SYN and/or FIN
    pub flags: u8,
    /// Time of the first transmission
    pub sent_at: u64,
    /// Number of times retransmitted
    pub retx_cnt: u8,
}

impl TcpSegment {
    /// Sequence space consumed: text plus one for each of SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.data.len() as u32;
        if self.flags & TCP_FLAG_SYN != 0 {
            len += 1;
        }
        if self.flags & TCP_FLAG_FIN != 0 {
            len += 1;
        }
        len
    }

    #[inline]
    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }
}

/// An out-of-order segment held for reassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReasmSeg {
    pub seq: u32,
    pub data: Vec<u8>,
    pub fin: bool,
}

/// What an acknowledgment did to the retransmit queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckUpdate {
    /// Newly acknowledged sequence space
    pub newly_acked: u32,
    /// Karn-valid RTT sample, if one was taken
    pub rtt_sample: Option<u64>,
    /// Our SYN is now acknowledged
    pub syn_acked: bool,
    /// Our FIN is now acknowledged
    pub fin_acked: bool,
}

// ============================================================================
// TCP Connection
// ============================================================================

/// Per-connection TCP state
pub struct TcpConn {
    pub(crate) id: TcpConnId,
    pub(crate) used: bool,
    pub(crate) id_conn: Option<ConnId>,
    pub(crate) state: TcpState,

    // === Send sequence space ===
    /// ISS
    pub(crate) tx_seq_sync: u32,
    /// SND.UNA
    pub(crate) tx_seq_unacked: u32,
    /// SND.NXT
    pub(crate) tx_seq_next: u32,
    /// Highest sequence number sent
    pub(crate) tx_seq_last: u32,
    /// Recovery point after a retransmission timeout
    pub(crate) tx_seq_recover: Option<u32>,
    /// SND.WL1
    pub(crate) tx_win_seq_last: u32,
    /// SND.WL2
    pub(crate) tx_win_ack_last: u32,

    // === Receive sequence space ===
    /// IRS
    pub(crate) rx_seq_sync: u32,
    /// RCV.NXT
    pub(crate) rx_seq_next: u32,

    // === Windows ===
    pub(crate) rx_win_cfg: u16,
    /// Right edge of the last advertised receive window
    pub(crate) rx_win_adv_edge: u32,
    pub(crate) tx_win_cfg: u16,
    /// Peer window (SND.WND)
    pub(crate) tx_win_remote: u32,
    /// Largest window the peer ever advertised
    pub(crate) tx_win_remote_max: u32,
    pub(crate) mss_local: u16,
    pub(crate) mss_remote: u16,

    pub(crate) cc: CongestionCtl,
    pub(crate) rtt: RttEstimator,
    /// Consecutive retransmission timeouts without progress
    pub(crate) retx_cnt: u8,
    pub(crate) persist_backoff: u8,
    pub(crate) sws_override: bool,

    // === Queues ===
    pub(crate) tx_q: VecDeque<u8>,
    pub(crate) retx_q: VecDeque<TcpSegment>,
    pub(crate) rx_q: VecDeque<u8>,
    pub(crate) reasm_q: Vec<ReasmSeg>,
    /// Listener: children that completed the handshake
    pub(crate) accept_q: VecDeque<ConnId>,
    /// Listener: children still in the handshake
    pub(crate) syn_q: Vec<ConnId>,
    pub(crate) backlog: usize,
    /// Child: the listening connection it was spawned from
    pub(crate) listener: Option<ConnId>,

    // === Flags ===
    pub(crate) fin_pending: bool,
    pub(crate) fin_sent: bool,
    pub(crate) fin_rxd: bool,
    /// The application closed; received text is acknowledged and dropped
    pub(crate) app_closed: bool,
    /// Full-size segments received since the last ACK we sent
    pub(crate) rx_full_segs: u8,
    pub(crate) close_reason: Option<NetError>,

    pub(crate) timers: TcpTimers,
    pub(crate) rx_wait: Arc<WaitQueue>,
}

impl TcpConn {
    pub(crate) fn new(id: TcpConnId, cfg: &TcpCfg) -> Self {
        TcpConn {
            id,
            used: false,
            id_conn: None,
            state: TcpState::Free,
            tx_seq_sync: 0,
            tx_seq_unacked: 0,
            tx_seq_next: 0,
            tx_seq_last: 0,
            tx_seq_recover: None,
            tx_win_seq_last: 0,
            tx_win_ack_last: 0,
            rx_seq_sync: 0,
            rx_seq_next: 0,
            rx_win_cfg: cfg.rx_win,
            rx_win_adv_edge: 0,
            tx_win_cfg: cfg.tx_win,
            tx_win_remote: 0,
            tx_win_remote_max: 0,
            mss_local: cfg.mss,
            mss_remote: super::TCP_DEFAULT_MSS,
            cc: CongestionCtl::new(super::TCP_DEFAULT_MSS),
            rtt: RttEstimator::new(cfg.rto_ceiling_ms()),
            retx_cnt: 0,
            persist_backoff: 0,
            sws_override: false,
            tx_q: VecDeque::new(),
            retx_q: VecDeque::new(),
            rx_q: VecDeque::new(),
            reasm_q: Vec::new(),
            accept_q: VecDeque::new(),
            syn_q: Vec::new(),
            backlog: 0,
            listener: None,
            fin_pending: false,
            fin_sent: false,
            fin_rxd: false,
            app_closed: false,
            rx_full_segs: 0,
            close_reason: None,
            timers: TcpTimers::default(),
            rx_wait: Arc::new(WaitQueue::new()),
        }
    }

    /// Back to the freshly-constructed state with a new wait queue.
    pub(crate) fn reset(&mut self, cfg: &TcpCfg) {
        let id = self.id;
        *self = TcpConn::new(id, cfg);
    }

    #[inline]
    pub fn id(&self) -> TcpConnId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TcpState {
        self.state
    }

    #[inline]
    pub fn id_conn(&self) -> Option<ConnId> {
        self.id_conn
    }

    pub fn rto_ms(&self) -> u64 {
        self.rtt.rto_ms()
    }

    pub fn cwnd(&self) -> u32 {
        self.cc.cwnd()
    }

    pub fn ssthresh(&self) -> u32 {
        self.cc.ssthresh()
    }

    pub fn peer_window(&self) -> u32 {
        self.tx_win_remote
    }

    pub fn rx_queued(&self) -> usize {
        self.rx_q.len()
    }

    pub fn tx_queued(&self) -> usize {
        self.tx_q.len()
    }

    pub fn retx_queued(&self) -> usize {
        self.retx_q.len()
    }

    pub fn accept_queued(&self) -> usize {
        self.accept_q.len()
    }

    pub fn timers(&self) -> &TcpTimers {
        &self.timers
    }

    /// Sequence space sent and not yet acknowledged.
    #[inline]
    pub fn flight(&self) -> u32 {
        self.tx_seq_next.wrapping_sub(self.tx_seq_unacked)
    }

    /// Octets held for the application: queued plus unacknowledged.
    pub fn tx_buffered(&self) -> usize {
        self.tx_q.len() + self.retx_q.iter().map(|s| s.data.len()).sum::<usize>()
    }

    /// Room left in the transmit buffer.
    pub fn tx_space(&self) -> usize {
        (self.tx_win_cfg as usize).saturating_sub(self.tx_buffered())
    }

    pub fn fin_acked(&self) -> bool {
        self.fin_sent && self.tx_seq_unacked == self.tx_seq_next
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    /// Choose the ISS and reset the send sequence space around it.
    pub(crate) fn init_send_seq(&mut self, iss: u32) {
        self.tx_seq_sync = iss;
        self.tx_seq_unacked = iss;
        self.tx_seq_next = iss;
        self.tx_seq_last = iss;
    }

    /// Record the peer's SYN: IRS, its MSS option and the initial window.
    pub(crate) fn init_recv_seq(&mut self, irs: u32, peer_mss: Option<u16>, window: u16) {
        self.rx_seq_sync = irs;
        self.rx_seq_next = irs.wrapping_add(1);
        self.rx_win_adv_edge = self.rx_seq_next.wrapping_add(self.rx_win_cfg as u32);

        let mss = peer_mss
            .filter(|&m| m > 0)
            .unwrap_or(super::TCP_DEFAULT_MSS)
            .min(self.mss_local);
        self.mss_remote = mss;
        self.cc.set_mss(mss);

        self.tx_win_remote = window as u32;
        self.tx_win_remote_max = window as u32;
        self.tx_win_seq_last = irs;
    }

    // ========================================================================
    // Receive Window
    // ========================================================================

    /// Free receive buffer space.
    #[inline]
    pub fn rx_win_avail(&self) -> u32 {
        (self.rx_win_cfg as usize).saturating_sub(self.rx_q.len()) as u32
    }

    /// Window the peer currently believes it may fill (RCV.WND).
    #[inline]
    pub fn rx_win_current(&self) -> u32 {
        self.rx_win_adv_edge.wrapping_sub(self.rx_seq_next)
    }

    /// Smallest window increase worth advertising: min(rx_win/2, MSS).
    #[inline]
    pub fn rx_win_sws_th(&self) -> u32 {
        core::cmp::min(self.rx_win_cfg as u32 / 2, self.mss_local as u32)
    }

    /// Right edge the free buffer would allow.
    fn rx_win_edge_avail(&self) -> u32 {
        self.rx_seq_next.wrapping_add(self.rx_win_avail())
    }

    /// Whether reading from the receive queue opened the window far enough
    /// to send an update on its own.
    pub fn rx_win_update_due(&self) -> bool {
        let edge = self.rx_win_edge_avail();
        seq_gt(edge, self.rx_win_adv_edge)
            && edge.wrapping_sub(self.rx_win_adv_edge) >= self.rx_win_sws_th()
    }

    /// Window to place in an outgoing segment.
    ///
    /// The right edge only moves forward, and only by at least the
    /// silly-window threshold.
    pub(crate) fn rx_win_advertise(&mut self) -> u16 {
        let edge = self.rx_win_edge_avail();
        if seq_lt(self.rx_win_adv_edge, self.rx_seq_next) {
            self.rx_win_adv_edge = self.rx_seq_next;
        }
        if seq_gt(edge, self.rx_win_adv_edge)
            && edge.wrapping_sub(self.rx_win_adv_edge) >= self.rx_win_sws_th()
        {
            self.rx_win_adv_edge = edge;
        }
        self.rx_win_current().min(u16::MAX as u32) as u16
    }

    // ========================================================================
    // Send Window
    // ========================================================================

    /// Octets the windows allow to be sent now.
    pub fn tx_usable(&self) -> u32 {
        let wnd = core::cmp::min(self.tx_win_remote, self.cc.cwnd());
        wnd.saturating_sub(self.flight())
    }

    /// Sender silly-window avoidance (RFC 1122 4.2.3.4): send `len` octets
    /// only if the segment is full-sized, covers half the peer's largest
    /// window, or drains the queue with nothing outstanding.
    pub fn tx_sws_ok(&self, len: usize) -> bool {
        if len == 0 {
            return false;
        }
        if len >= self.mss_remote as usize || self.sws_override {
            return true;
        }
        if self.tx_win_remote_max > 0 && len as u32 >= self.tx_win_remote_max / 2 {
            return true;
        }
        len == self.tx_q.len() && self.flight() == 0
    }

    /// Apply a window advertisement if the segment is newer than the last
    /// one used (SND.WL1/SND.WL2 rule).  Returns true if the window changed.
    pub(crate) fn tx_win_update(&mut self, seq: u32, ack: u32, window: u16) -> bool {
        if seq_lt(self.tx_win_seq_last, seq)
            || (self.tx_win_seq_last == seq && seq_le(self.tx_win_ack_last, ack))
        {
            let old = self.tx_win_remote;
            self.tx_win_remote = window as u32;
            self.tx_win_remote_max = self.tx_win_remote_max.max(window as u32);
            self.tx_win_seq_last = seq;
            self.tx_win_ack_last = ack;
            return old != self.tx_win_remote;
        }
        false
    }

    // ========================================================================
    // Acknowledgment
    // ========================================================================

    /// Drop acknowledged sequence space from the retransmit queue.
    ///
    /// `ack` must already be known to lie in (SND.UNA, SND.NXT].  A partly
    /// acknowledged segment is trimmed in place.  RTT is sampled only from
    /// segments that were never retransmitted (Karn).
    pub(crate) fn ack_retx_q(&mut self, ack: u32, now_ms: u64) -> AckUpdate {
        let mut update = AckUpdate {
            newly_acked: ack.wrapping_sub(self.tx_seq_unacked),
            ..AckUpdate::default()
        };

        while let Some(seg) = self.retx_q.front_mut() {
            if seq_ge(ack, seg.end()) {
                if seg.flags & TCP_FLAG_SYN != 0 {
                    update.syn_acked = true;
                }
                if seg.flags & TCP_FLAG_FIN != 0 {
                    update.fin_acked = true;
                }
                if update.rtt_sample.is_none() && seg.retx_cnt == 0 {
                    update.rtt_sample = Some(now_ms.saturating_sub(seg.sent_at));
                }
                self.retx_q.pop_front();
                continue;
            }

            if seq_gt(ack, seg.seq) {
                let mut cut = ack.wrapping_sub(seg.seq);
                if seg.flags & TCP_FLAG_SYN != 0 {
                    seg.flags &= !TCP_FLAG_SYN;
                    update.syn_acked = true;
                    cut -= 1;
                }
                let cut = (cut as usize).min(seg.data.len());
                seg.data.drain(..cut);
                seg.seq = ack;
            }
            break;
        }

        self.tx_seq_unacked = ack;
        update
    }

    // ========================================================================
    // Reassembly
    // ========================================================================

    /// Hold an out-of-order segment that starts after RCV.NXT.
    pub(crate) fn reasm_insert(&mut self, seq: u32, data: &[u8], fin: bool) {
        if self
            .reasm_q
            .iter()
            .any(|s| s.seq == seq && s.data.len() >= data.len() && (s.fin || !fin))
        {
            return;
        }
        let base = self.rx_seq_next;
        let pos = self
            .reasm_q
            .iter()
            .position(|s| s.seq.wrapping_sub(base) > seq.wrapping_sub(base))
            .unwrap_or(self.reasm_q.len());
        self.reasm_q.insert(
            pos,
            ReasmSeg {
                seq,
                data: data.to_vec(),
                fin,
            },
        );
    }

    /// Move every segment that became in-order into the receive queue.
    ///
    /// Returns the octets delivered and whether a FIN was reached.  When
    /// `keep` is false the text is acknowledged but discarded.
    pub(crate) fn reasm_drain(&mut self, keep: bool) -> (usize, bool) {
        let mut delivered = 0;
        let mut fin = false;

        while let Some(first) = self.reasm_q.first() {
            if seq_gt(first.seq, self.rx_seq_next) {
                break;
            }
            let seg = self.reasm_q.remove(0);
            let end = seg.seq.wrapping_add(seg.data.len() as u32);
            if seq_lt(end, self.rx_seq_next) || (end == self.rx_seq_next && !seg.fin) {
                continue;
            }
            let skip = self.rx_seq_next.wrapping_sub(seg.seq) as usize;
            let text = &seg.data[skip.min(seg.data.len())..];
            if keep {
                self.rx_q.extend(text.iter().copied());
            }
            delivered += text.len();
            self.rx_seq_next = self.rx_seq_next.wrapping_add(text.len() as u32);
            if seg.fin {
                fin = true;
                self.reasm_q.clear();
                break;
            }
        }
        (delivered, fin)
    }

    pub fn reasm_queued(&self) -> usize {
        self.reasm_q.iter().map(|s| s.data.len()).sum()
    }
}
