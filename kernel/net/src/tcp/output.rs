//! Segment transmission: control segments, data output, retransmission.

use alloc::vec::Vec;

use super::conn::TcpSegment;
use super::header::{build_tcp_segment, TcpHeader, TcpOptionKind};
use super::timer::TCP_SWS_OVERRIDE_MS;
use super::{
    bump, TcpConnId, TcpState, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST,
    TCP_FLAG_SYN,
};
use crate::addr::{ConnAddr, ConnFamily};
use crate::stack::{IpTxParams, NetCore, TxSegment};

impl NetCore {
    /// Build and transmit one segment on connection `tid`.
    ///
    /// The acknowledgment number and window are filled from the record.
    /// Sending an ACK cancels any delayed acknowledgment.  A refusal by the
    /// IP layer is logged; the retransmit queue recovers the data.
    pub(crate) fn tcp_tx_seg(
        &mut self,
        tid: TcpConnId,
        seq: u32,
        flags: u8,
        payload: &[u8],
        options: &[TcpOptionKind],
    ) {
        let Some(cid) = self.tcp.rec(tid).id_conn else {
            return;
        };
        let conn = self.conns.rec(cid);
        let (local, remote) = (conn.addr_local, conn.addr_remote);
        let params = IpTxParams::of(conn);
        let if_nbr = conn.if_nbr;

        let tcb = self.tcp.rec_mut(tid);
        let ack = if flags & TCP_FLAG_ACK != 0 {
            tcb.rx_full_segs = 0;
            tcb.timers.ack_delay.stop();
            tcb.rx_seq_next
        } else {
            0
        };
        let window = if flags & TCP_FLAG_RST != 0 {
            0
        } else {
            tcb.rx_win_advertise()
        };

        let header = TcpHeader::new(local.port(), remote.port(), seq, ack, flags, window);
        let bytes = build_tcp_segment(&local.ip(), &remote.ip(), header, options, payload);
        self.ip_tx_segment(local, remote, if_nbr, params, &bytes);
    }

    fn ip_tx_segment(
        &self,
        local: ConnAddr,
        remote: ConnAddr,
        if_nbr: Option<u8>,
        params: IpTxParams,
        bytes: &[u8],
    ) {
        bump(&self.tcp.stats().tx_segments);
        let seg = TxSegment {
            src: local.ip(),
            dst: remote.ip(),
            if_nbr,
            params,
            segment: bytes,
        };
        if let Err(e) = self.ip_tx.tx(&seg) {
            klog!(Debug, "tcp tx {} -> {} failed: {}", local, remote, e);
        }
    }

    // ========================================================================
    // Control Segments
    // ========================================================================

    /// Send (or resend) our SYN; SYN-ACK once the peer's SYN is known.
    pub(crate) fn tcp_send_syn(&mut self, tid: TcpConnId) {
        let now = self.now_ms;
        let tcb = self.tcp.rec_mut(tid);
        let iss = tcb.tx_seq_sync;
        let mss = tcb.mss_local;
        if tcb.retx_q.is_empty() {
            tcb.retx_q.push_back(TcpSegment {
                seq: iss,
                data: Vec::new(),
                flags: TCP_FLAG_SYN,
                sent_at: now,
                retx_cnt: 0,
            });
            tcb.tx_seq_next = iss.wrapping_add(1);
            tcb.tx_seq_last = tcb.tx_seq_next;
        }
        let rto = tcb.rtt.rto_ms();
        tcb.timers.retx.start_if_stopped(now, rto);

        let flags = if tcb.state == TcpState::SyncTxd {
            TCP_FLAG_SYN
        } else {
            TCP_FLAG_SYN | TCP_FLAG_ACK
        };
        self.tcp_tx_seg(tid, iss, flags, &[], &[TcpOptionKind::Mss(mss)]);
    }

    /// Send a bare acknowledgment.
    pub(crate) fn tcp_send_ack(&mut self, tid: TcpConnId) {
        let seq = self.tcp.rec(tid).tx_seq_next;
        self.tcp_tx_seg(tid, seq, TCP_FLAG_ACK, &[], &[]);
    }

    /// Reset the connection's peer.
    pub(crate) fn tcp_send_rst(&mut self, tid: TcpConnId) {
        let tcb = self.tcp.rec(tid);
        let seq = tcb.tx_seq_next;
        let flags = if tcb.state.is_synchronized() || tcb.state.is_sync_rxd() {
            TCP_FLAG_RST | TCP_FLAG_ACK
        } else {
            TCP_FLAG_RST
        };
        bump(&self.tcp.stats().rst_sent);
        self.tcp_tx_seg(tid, seq, flags, &[], &[]);
    }

    /// Answer a segment that no connection accepts (RFC 793 "Reset
    /// Generation").  Never answers a reset.
    pub(crate) fn tcp_send_rst_reply(
        &mut self,
        local: ConnAddr,
        remote: ConnAddr,
        if_nbr: Option<u8>,
        header: &TcpHeader,
        seg_len: u32,
    ) {
        if header.is_rst() {
            return;
        }
        let (seq, ack, flags) = if header.is_ack() {
            (header.ack_num, 0, TCP_FLAG_RST)
        } else {
            (
                0,
                header.seq_num.wrapping_add(seg_len),
                TCP_FLAG_RST | TCP_FLAG_ACK,
            )
        };
        let reply = TcpHeader::new(local.port(), remote.port(), seq, ack, flags, 0);
        let bytes = build_tcp_segment(&local.ip(), &remote.ip(), reply, &[], &[]);
        let family: ConnFamily = local.family();
        bump(&self.tcp.stats().rst_sent);
        self.ip_tx_segment(local, remote, if_nbr, IpTxParams::default_for(family), &bytes);
    }

    // ========================================================================
    // Data Output
    // ========================================================================

    /// Whether `state` may still put new data or our FIN on the wire.
    fn tcp_may_send(state: TcpState, fin_sent: bool) -> bool {
        match state {
            TcpState::Conn | TcpState::CloseWait => true,
            TcpState::FinWait1 | TcpState::LastAck => !fin_sent,
            _ => false,
        }
    }

    /// Send as much queued data as the windows and silly-window avoidance
    /// allow, then our FIN if the application closed and the queue is
    /// empty.
    pub(crate) fn tcp_output(&mut self, tid: TcpConnId) {
        let now = self.now_ms;
        loop {
            let tcb = self.tcp.rec(tid);
            if !Self::tcp_may_send(tcb.state, tcb.fin_sent) {
                return;
            }

            let len = (tcb.tx_q.len() as u32)
                .min(tcb.tx_usable())
                .min(tcb.mss_remote as u32) as usize;
            if len > 0 {
                if !tcb.tx_sws_ok(len) {
                    self.tcp
                        .rec_mut(tid)
                        .timers
                        .silly_win
                        .start_if_stopped(now, TCP_SWS_OVERRIDE_MS);
                    return;
                }
                self.tcp_send_data(tid, len);
                continue;
            }

            if tcb.tx_q.is_empty() {
                if tcb.fin_pending && !tcb.fin_sent {
                    self.tcp_send_fin(tid);
                }
                return;
            }

            // Data is queued but the peer's window is closed.
            if tcb.tx_win_remote == 0 && tcb.retx_q.is_empty() {
                let rto = tcb.rtt.rto_ms();
                let tcb = self.tcp.rec_mut(tid);
                if !tcb.timers.persist.is_running() {
                    tcb.persist_backoff = 0;
                    tcb.timers.persist.start(now, rto);
                }
            }
            return;
        }
    }

    /// Move `len` octets from the transmit queue into one segment.
    fn tcp_send_data(&mut self, tid: TcpConnId, len: usize) {
        let now = self.now_ms;
        let tcb = self.tcp.rec_mut(tid);
        let data: Vec<u8> = tcb.tx_q.drain(..len).collect();
        let seq = tcb.tx_seq_next;

        let mut flags = TCP_FLAG_ACK;
        let mut seg_flags = 0;
        if tcb.tx_q.is_empty() {
            flags |= TCP_FLAG_PSH;
            if tcb.fin_pending {
                flags |= TCP_FLAG_FIN;
                seg_flags |= TCP_FLAG_FIN;
                tcb.fin_sent = true;
            }
        }

        let seg = TcpSegment {
            seq,
            data: data.clone(),
            flags: seg_flags,
            sent_at: now,
            retx_cnt: 0,
        };
        tcb.tx_seq_next = seg.end();
        tcb.tx_seq_last = tcb.tx_seq_next;
        tcb.retx_q.push_back(seg);
        tcb.timers.silly_win.stop();
        if !tcb.timers.persist.is_running() {
            let rto = tcb.rtt.rto_ms();
            tcb.timers.retx.start_if_stopped(now, rto);
        }

        self.tcp_tx_seg(tid, seq, flags, &data, &[]);
    }

    fn tcp_send_fin(&mut self, tid: TcpConnId) {
        let now = self.now_ms;
        let tcb = self.tcp.rec_mut(tid);
        let seq = tcb.tx_seq_next;
        tcb.retx_q.push_back(TcpSegment {
            seq,
            data: Vec::new(),
            flags: TCP_FLAG_FIN,
            sent_at: now,
            retx_cnt: 0,
        });
        tcb.tx_seq_next = seq.wrapping_add(1);
        tcb.tx_seq_last = tcb.tx_seq_next;
        tcb.fin_sent = true;
        let rto = tcb.rtt.rto_ms();
        tcb.timers.retx.start_if_stopped(now, rto);

        klog!(Trace, "{} FIN sent (seq {})", tid, seq);
        self.tcp_tx_seg(tid, seq, TCP_FLAG_FIN | TCP_FLAG_ACK, &[], &[]);
    }

    /// Send a one-octet zero-window probe, or resend the outstanding one.
    pub(crate) fn tcp_send_probe(&mut self, tid: TcpConnId) {
        let now = self.now_ms;
        let tcb = self.tcp.rec_mut(tid);
        if !tcb.retx_q.is_empty() {
            self.tcp_retransmit_first(tid);
            return;
        }
        let Some(octet) = tcb.tx_q.pop_front() else {
            return;
        };
        let seq = tcb.tx_seq_next;
        tcb.retx_q.push_back(TcpSegment {
            seq,
            data: alloc::vec![octet],
            flags: 0,
            sent_at: now,
            retx_cnt: 0,
        });
        tcb.tx_seq_next = seq.wrapping_add(1);
        tcb.tx_seq_last = tcb.tx_seq_next;

        bump(&self.tcp.stats().zero_win_probes);
        self.tcp_tx_seg(tid, seq, TCP_FLAG_ACK | TCP_FLAG_PSH, &[octet], &[]);
    }

    // ========================================================================
    // Retransmission
    // ========================================================================

    /// Resend the first unacknowledged segment.
    pub(crate) fn tcp_retransmit_first(&mut self, tid: TcpConnId) {
        let tcb = self.tcp.rec_mut(tid);
        let state = tcb.state;
        let mss = tcb.mss_local;
        let Some(seg) = tcb.retx_q.front_mut() else {
            return;
        };
        seg.retx_cnt = seg.retx_cnt.saturating_add(1);
        let seq = seg.seq;
        let data = seg.data.clone();
        let seg_flags = seg.flags;

        bump(&self.tcp.stats().retransmissions);
        klog!(Trace, "{} retransmit seq {} ({} octets)", tid, seq, data.len());

        if seg_flags & TCP_FLAG_SYN != 0 {
            let flags = if state == TcpState::SyncTxd {
                TCP_FLAG_SYN
            } else {
                TCP_FLAG_SYN | TCP_FLAG_ACK
            };
            self.tcp_tx_seg(tid, seq, flags, &data, &[TcpOptionKind::Mss(mss)]);
        } else {
            let mut flags = TCP_FLAG_ACK | (seg_flags & TCP_FLAG_FIN);
            if !data.is_empty() {
                flags |= TCP_FLAG_PSH;
            }
            self.tcp_tx_seg(tid, seq, flags, &data, &[]);
        }
    }
}
