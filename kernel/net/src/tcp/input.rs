//! Segment reception (RFC 793 3.9 "SEGMENT ARRIVES").
//!
//! A segment is validated, demultiplexed through the connection lists and
//! then handled according to the state of the connection it reached:
//!
//! - `Listen`: a SYN spawns a child connection in `SyncRxdPassive`
//! - `SyncTxd`: the peer's SYN (with or without our SYN's ACK)
//! - everything else: acceptability, RST, SYN, ACK, text, FIN, in order

use super::congestion::CongestionAction;
use super::header::{parse_tcp_header, parse_tcp_options, verify_tcp_checksum};
use super::seq::{seg_acceptable, seq_gt, seq_le, seq_lt};
use super::{bump, TcpConnId, TcpError, TcpHeader, TcpOptions, TcpResult, TcpState};
use crate::addr::{ConnAddr, ConnProtoIx, IpAddr};
use crate::conn::{ConnId, ConnMatch, SrchResult};
use crate::error::NetError;
use crate::stack::NetCore;

/// A validated incoming segment.
struct RxSeg<'a> {
    hdr: TcpHeader,
    opts: TcpOptions,
    payload: &'a [u8],
    local: ConnAddr,
    remote: ConnAddr,
    if_nbr: Option<u8>,
}

impl RxSeg<'_> {
    /// SEG.LEN: text plus SYN and FIN
    fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.hdr.is_syn() as u32 + self.hdr.is_fin() as u32
    }
}

fn addr_is_unicast(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => !a.is_multicast() && !a.is_broadcast() && !a.is_unspecified(),
        IpAddr::V6(a) => !a.is_multicast() && !a.is_unspecified(),
    }
}

impl NetCore {
    /// Entry point from the IP layer.  `segment` starts at the TCP header.
    ///
    /// Dropped segments are counted and reported through the error; the
    /// application never sees them.
    pub fn rx_segment(
        &mut self,
        src: IpAddr,
        dst: IpAddr,
        if_nbr: Option<u8>,
        segment: &[u8],
    ) -> TcpResult<()> {
        let stats = self.tcp.stats();
        bump(&stats.rx_segments);

        let result = self.tcp_rx_dispatch(src, dst, if_nbr, segment);
        if let Err(err) = result {
            let stats = self.tcp.stats();
            bump(&stats.rx_dropped);
            match err {
                TcpError::BadChecksum => bump(&stats.checksum_errors),
                TcpError::Truncated
                | TcpError::InvalidHeaderLen
                | TcpError::InvalidOption
                | TcpError::InvalidFlags => bump(&stats.header_errors),
                _ => {}
            }
            klog!(Trace, "tcp segment {} -> {} dropped: {:?}", src, dst, err);
        }
        result
    }

    fn tcp_rx_dispatch(
        &mut self,
        src: IpAddr,
        dst: IpAddr,
        if_nbr: Option<u8>,
        bytes: &[u8],
    ) -> TcpResult<()> {
        if src.family() != dst.family() || !addr_is_unicast(&src) || !addr_is_unicast(&dst) {
            return Err(TcpError::InvalidAddr);
        }
        let hdr = parse_tcp_header(bytes)?;
        if !verify_tcp_checksum(&src, &dst, bytes) {
            return Err(TcpError::BadChecksum);
        }
        let opts = parse_tcp_options(bytes, &hdr)?;
        if hdr.is_syn() && (hdr.is_fin() || hdr.is_rst()) {
            return Err(TcpError::InvalidFlags);
        }
        if hdr.src_port == 0 || hdr.dst_port == 0 {
            return Err(TcpError::InvalidAddr);
        }

        let seg = RxSeg {
            hdr,
            opts,
            payload: &bytes[hdr.header_len()..],
            local: ConnAddr::new(dst, hdr.dst_port),
            remote: ConnAddr::new(src, hdr.src_port),
            if_nbr,
        };

        let ix = ConnProtoIx::tcp_for(dst.family());
        if !ix.is_available() {
            return Err(TcpError::NoConnection);
        }

        let SrchResult { found, stale } = self.conns.srch(ix, &seg.local, &seg.remote);
        for id in stale {
            klog!(Debug, "{} local address no longer valid, closing", id);
            self.close_conn_forced(id, None, NetError::ConnClosed);
        }

        let target = found.and_then(|(cid, kind)| Some((cid, kind, self.tcp_of(cid)?)));
        let Some((cid, kind, tid)) = target else {
            self.tcp_send_rst_reply(seg.local, seg.remote, seg.if_nbr, &seg.hdr, seg.seq_len());
            return Err(TcpError::NoConnection);
        };

        let state = self.tcp.rec(tid).state;
        if state == TcpState::Listen {
            return self.tcp_rx_listen(cid, tid, &seg);
        }
        if matches!(kind, ConnMatch::Half | ConnMatch::HalfWildcard) || state.is_closed() {
            self.tcp_send_rst_reply(seg.local, seg.remote, seg.if_nbr, &seg.hdr, seg.seq_len());
            return Err(TcpError::NoConnection);
        }

        let conn = self.conns.rec_mut(cid);
        if conn.if_nbr.is_none() {
            conn.if_nbr = seg.if_nbr;
        }

        if state == TcpState::SyncTxd {
            self.tcp_rx_syn_sent(tid, &seg)
        } else {
            self.tcp_rx_sync(tid, &seg)
        }
    }

    // ========================================================================
    // LISTEN
    // ========================================================================

    fn tcp_rx_listen(&mut self, lcid: ConnId, ltid: TcpConnId, seg: &RxSeg<'_>) -> TcpResult<()> {
        if seg.hdr.is_rst() {
            return Ok(());
        }
        if seg.hdr.is_ack() {
            self.tcp_send_rst_reply(seg.local, seg.remote, seg.if_nbr, &seg.hdr, seg.seq_len());
            return Err(TcpError::Unacceptable);
        }
        if !seg.hdr.is_syn() {
            return Err(TcpError::Unacceptable);
        }

        let listener = self.tcp.rec(ltid);
        if listener.syn_q.len() + listener.accept_q.len() >= listener.backlog {
            klog!(Debug, "{} backlog full, SYN from {} dropped", lcid, seg.remote);
            return Err(TcpError::BacklogFull);
        }

        let parent = self.conns.rec(lcid);
        let (family, ix, app) = (parent.family, parent.proto_ix, parent.id_app);
        let (ipv4, ipv6) = (parent.ipv4, parent.ipv6);

        let child = self.conns.get(family, ix)?;
        let ctid = match self.tcp.get() {
            Ok(t) => t,
            Err(e) => {
                self.conns.free(child, None);
                return Err(e.into());
            }
        };
        {
            let c = self.conns.rec_mut(child);
            c.ipv4 = ipv4;
            c.ipv6 = ipv6;
            c.if_nbr = seg.if_nbr;
            c.id_app_clone = app;
            c.id_transport = Some(ctid);
        }
        let addrs = self
            .conns
            .addr_remote_set(child, seg.remote, false)
            .and_then(|_| self.conns.addr_local_set(child, seg.local, false));
        if let Err(e) = addrs {
            self.tcp.free(ctid);
            let c = self.conns.rec_mut(child);
            c.id_transport = None;
            c.id_app_clone = None;
            self.conns.free(child, None);
            return Err(e.into());
        }

        let now = self.now_ms;
        let iss = self.tcp.generate_iss(&seg.local, &seg.remote, now);
        let tcb = self.tcp.rec_mut(ctid);
        tcb.id_conn = Some(child);
        tcb.listener = Some(lcid);
        tcb.state = TcpState::SyncRxdPassive;
        tcb.init_send_seq(iss);
        tcb.init_recv_seq(seg.hdr.seq_num, seg.opts.mss, seg.hdr.window);
        self.tcp.rec_mut(ltid).syn_q.push(child);

        klog!(Debug, "{} passive open {} <- {}", child, seg.local, seg.remote);
        self.tcp_send_syn(ctid);
        Ok(())
    }

    // ========================================================================
    // SYN-SENT
    // ========================================================================

    fn tcp_rx_syn_sent(&mut self, tid: TcpConnId, seg: &RxSeg<'_>) -> TcpResult<()> {
        let hdr = &seg.hdr;
        let tcb = self.tcp.rec(tid);
        let ack_ok = hdr.is_ack()
            && seq_gt(hdr.ack_num, tcb.tx_seq_sync)
            && seq_le(hdr.ack_num, tcb.tx_seq_next);

        if hdr.is_ack() && !ack_ok {
            self.tcp_send_rst_reply(seg.local, seg.remote, seg.if_nbr, hdr, seg.seq_len());
            return Err(TcpError::Unacceptable);
        }
        if hdr.is_rst() {
            if !ack_ok {
                return Err(TcpError::Unacceptable);
            }
            klog!(Info, "{} connection refused by {}", tid, seg.remote);
            bump(&self.tcp.stats().conn_reset);
            self.tcp_close_conn(tid, Some(NetError::ConnReset));
            return Ok(());
        }
        if !hdr.is_syn() {
            return Err(TcpError::Unacceptable);
        }

        let now = self.now_ms;
        let tcb = self.tcp.rec_mut(tid);
        tcb.init_recv_seq(hdr.seq_num, seg.opts.mss, hdr.window);

        if ack_ok {
            let up = tcb.ack_retx_q(hdr.ack_num, now);
            if let Some(rtt) = up.rtt_sample {
                tcb.rtt.sample(rtt);
            }
            tcb.retx_cnt = 0;
            tcb.tx_win_ack_last = hdr.ack_num;
            if tcb.retx_q.is_empty() {
                tcb.timers.retx.stop();
            }
            self.tcp_established(tid);
            self.tcp_send_ack(tid);
            self.tcp_output(tid);
        } else {
            // Simultaneous open: our SYN is answered with a SYN-ACK.
            tcb.state = TcpState::SyncRxdActive;
            if let Some(syn) = tcb.retx_q.front_mut() {
                syn.retx_cnt = syn.retx_cnt.saturating_add(1);
            }
            self.tcp_send_syn(tid);
        }
        Ok(())
    }

    // ========================================================================
    // Synchronized States
    // ========================================================================

    fn tcp_rx_sync(&mut self, tid: TcpConnId, seg: &RxSeg<'_>) -> TcpResult<()> {
        let now = self.now_ms;
        let hdr = &seg.hdr;
        let tcb = self.tcp.rec(tid);
        let state = tcb.state;
        let rcv_nxt = tcb.rx_seq_next;
        let rcv_wnd = tcb.rx_win_current();

        // 1. Sequence number check
        if !seg_acceptable(hdr.seq_num, seg.seq_len(), rcv_nxt, rcv_wnd) {
            if !hdr.is_rst() {
                if state == TcpState::TimeWait && hdr.is_fin() {
                    let tw = self.tcp.cfg().time_wait_ms();
                    self.tcp.rec_mut(tid).timers.time_wait.start(now, tw);
                }
                self.tcp_send_ack(tid);
            }
            return Err(TcpError::Unacceptable);
        }

        // 2. RST
        if hdr.is_rst() {
            self.tcp_rx_rst(tid, state);
            return Ok(());
        }

        // 3. SYN inside the window
        if hdr.is_syn() {
            klog!(Debug, "{} SYN in window, resetting", tid);
            self.tcp_send_rst(tid);
            bump(&self.tcp.stats().conn_reset);
            self.tcp_close_conn(tid, Some(NetError::ConnReset));
            return Ok(());
        }

        // 4. ACK
        if !hdr.is_ack() {
            return Err(TcpError::Unacceptable);
        }

        // Trim text already received and text beyond the window.
        let mut seq = hdr.seq_num;
        let mut text = seg.payload;
        let mut fin = hdr.is_fin();
        if seq_lt(seq, rcv_nxt) {
            let dup = rcv_nxt.wrapping_sub(seq) as usize;
            if dup >= text.len() {
                let fin_seq = seq.wrapping_add(text.len() as u32);
                if seq_lt(fin_seq, rcv_nxt) {
                    fin = false;
                }
                text = &[];
            } else {
                text = &text[dup..];
            }
            seq = rcv_nxt;
        }
        let room = (rcv_wnd as usize).saturating_sub(seq.wrapping_sub(rcv_nxt) as usize);
        if text.len() > room {
            text = &text[..room];
            fin = false;
        }

        if state.is_sync_rxd() {
            let tcb = self.tcp.rec(tid);
            if !(seq_gt(hdr.ack_num, tcb.tx_seq_unacked) && seq_le(hdr.ack_num, tcb.tx_seq_next)) {
                self.tcp_send_rst_reply(seg.local, seg.remote, seg.if_nbr, hdr, seg.seq_len());
                return Err(TcpError::Unacceptable);
            }
            let tcb = self.tcp.rec_mut(tid);
            let up = tcb.ack_retx_q(hdr.ack_num, now);
            if let Some(rtt) = up.rtt_sample {
                tcb.rtt.sample(rtt);
            }
            tcb.retx_cnt = 0;
            tcb.tx_win_update(hdr.seq_num, hdr.ack_num, hdr.window);
            if tcb.retx_q.is_empty() {
                tcb.timers.retx.stop();
            }
            self.tcp_established(tid);
        } else if !self.tcp_rx_ack(tid, seg, !text.is_empty() || fin)? {
            // Connection finished (LAST-ACK)
            return Ok(());
        }

        // 5. Text and FIN
        let state = self.tcp.rec(tid).state;
        if state.can_receive() && (!text.is_empty() || fin) {
            self.tcp_rx_data(tid, seq, text, fin);
        } else if fin && seq == self.tcp.rec(tid).rx_seq_next {
            // Retransmitted FIN in CLOSE-WAIT, CLOSING or LAST-ACK
            self.tcp_send_ack(tid);
        }

        if self.tcp.is_used(tid) {
            let idle = self.tcp.cfg().idle_timeout_ms;
            let tcb = self.tcp.rec_mut(tid);
            if tcb.timers.idle.is_running() {
                tcb.timers.idle.start(now, idle);
            }
            self.tcp_output(tid);
        }
        Ok(())
    }

    /// The handshake completed.  A passive child moves to its listener's
    /// accept queue.
    fn tcp_established(&mut self, tid: TcpConnId) {
        let now = self.now_ms;
        let idle = self.tcp.cfg().idle_timeout_ms;
        let tcb = self.tcp.rec_mut(tid);
        tcb.state = if tcb.fin_pending {
            TcpState::FinWait1
        } else {
            TcpState::Conn
        };
        tcb.timers.idle.start(now, idle);
        tcb.rx_wait.wake_all();
        let (cid, listener) = (tcb.id_conn, tcb.listener);
        bump(&self.tcp.stats().conn_established);
        klog!(Debug, "{} established", tid);

        let (Some(cid), Some(l)) = (cid, listener) else {
            return;
        };
        let Some(ltid) = self.tcp_of(l) else {
            return;
        };
        let lt = self.tcp.rec_mut(ltid);
        lt.syn_q.retain(|&c| c != cid);
        lt.accept_q.push_back(cid);
        lt.rx_wait.wake_one();
        if let Some(app) = self.conns.rec(l).id_app {
            self.hooks.accept_ready(app, l);
        }
    }

    fn tcp_rx_rst(&mut self, tid: TcpConnId, state: TcpState) {
        match state {
            TcpState::SyncRxdPassive => {
                klog!(Debug, "{} reset during passive open", tid);
                self.tcp_close_conn(tid, None);
            }
            TcpState::SyncRxdActive
            | TcpState::Conn
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait => {
                klog!(Debug, "{} reset by peer in {:?}", tid, state);
                bump(&self.tcp.stats().conn_reset);
                self.tcp_close_conn(tid, Some(NetError::ConnReset));
            }
            _ => self.tcp_close_conn(tid, None),
        }
    }

    /// ACK processing for established and closing states.
    ///
    /// Returns `Ok(false)` when the acknowledgment completed the close and
    /// the record is gone.
    fn tcp_rx_ack(&mut self, tid: TcpConnId, seg: &RxSeg<'_>, has_data: bool) -> TcpResult<bool> {
        let now = self.now_ms;
        let hdr = &seg.hdr;
        let ack = hdr.ack_num;
        let tcb = self.tcp.rec_mut(tid);

        if seq_gt(ack, tcb.tx_seq_next) {
            self.tcp_send_ack(tid);
            return Err(TcpError::Unacceptable);
        }

        let flight = tcb.flight();
        let mut retransmit = false;
        let mut fast_retx = false;

        if seq_gt(ack, tcb.tx_seq_unacked) {
            let up = tcb.ack_retx_q(ack, now);
            match up.rtt_sample {
                Some(rtt) => tcb.rtt.sample(rtt),
                None => tcb.rtt.reset_backoff(),
            }
            tcb.retx_cnt = 0;
            tcb.cc.on_ack(up.newly_acked);

            if let Some(recover) = tcb.tx_seq_recover {
                if seq_lt(ack, recover) && !tcb.retx_q.is_empty() {
                    retransmit = true;
                } else {
                    tcb.tx_seq_recover = None;
                }
            }

            tcb.tx_win_update(hdr.seq_num, ack, hdr.window);
            if tcb.retx_q.is_empty() {
                tcb.timers.retx.stop();
            } else if !tcb.timers.persist.is_running() {
                let rto = tcb.rtt.rto_ms();
                tcb.timers.retx.start(now, rto);
            }
        } else if ack == tcb.tx_seq_unacked {
            let win_changed = tcb.tx_win_update(hdr.seq_num, ack, hdr.window);
            let dup = !has_data
                && !win_changed
                && flight > 0
                && !tcb.timers.persist.is_running();
            if dup && tcb.cc.on_dup_ack(flight) == CongestionAction::FastRetransmit {
                fast_retx = true;
            }
        }

        if tcb.tx_win_remote > 0 && tcb.timers.persist.is_running() {
            tcb.timers.persist.stop();
            tcb.persist_backoff = 0;
            if !tcb.retx_q.is_empty() {
                let rto = tcb.rtt.rto_ms();
                tcb.timers.retx.start_if_stopped(now, rto);
            }
        }

        if fast_retx {
            klog!(Debug, "{} fast retransmit, cwnd {}", tid, tcb.cc.cwnd());
            bump(&self.tcp.stats().fast_retransmits);
            self.tcp_retransmit_first(tid);
        } else if retransmit {
            self.tcp_retransmit_first(tid);
        }

        let tcb = self.tcp.rec_mut(tid);
        if tcb.fin_acked() {
            match tcb.state {
                TcpState::FinWait1 => {
                    let fw2 = self.tcp.cfg().fin_wait2_timeout_ms;
                    let tcb = self.tcp.rec_mut(tid);
                    tcb.state = TcpState::FinWait2;
                    tcb.timers.fin_wait2.start(now, fw2);
                }
                TcpState::Closing => self.tcp_enter_time_wait(tid),
                TcpState::LastAck => {
                    self.tcp_close_conn(tid, None);
                    return Ok(false);
                }
                _ => {}
            }
        }
        Ok(true)
    }

    /// Queue in-window text and process a FIN that follows it.
    fn tcp_rx_data(&mut self, tid: TcpConnId, seq: u32, text: &[u8], fin: bool) {
        let now = self.now_ms;
        let ack_delay = self.tcp.cfg().ack_delay_ms;
        let tcb = self.tcp.rec_mut(tid);
        let keep = !tcb.app_closed;

        let mut ack_now = false;
        let mut fin_reached = false;
        let mut out_of_order = false;
        let mut delivered = 0;

        if seq == tcb.rx_seq_next {
            if keep {
                tcb.rx_q.extend(text.iter().copied());
            }
            tcb.rx_seq_next = tcb.rx_seq_next.wrapping_add(text.len() as u32);
            delivered += text.len();
            if text.len() >= tcb.mss_local as usize {
                tcb.rx_full_segs = tcb.rx_full_segs.saturating_add(1);
            }
            fin_reached = fin;
            if !fin_reached && !tcb.reasm_q.is_empty() {
                let (n, f) = tcb.reasm_drain(keep);
                delivered += n;
                fin_reached = f;
                ack_now = true;
            }
        } else {
            tcb.reasm_insert(seq, text, fin);
            out_of_order = true;
            ack_now = true;
        }

        if fin_reached {
            tcb.rx_seq_next = tcb.rx_seq_next.wrapping_add(1);
            tcb.fin_rxd = true;
            ack_now = true;
            match tcb.state {
                TcpState::Conn => tcb.state = TcpState::CloseWait,
                TcpState::FinWait1 => {
                    if tcb.fin_acked() {
                        self.tcp_enter_time_wait(tid);
                    } else {
                        self.tcp.rec_mut(tid).state = TcpState::Closing;
                    }
                }
                TcpState::FinWait2 => self.tcp_enter_time_wait(tid),
                _ => {}
            }
            klog!(Trace, "{} FIN received", tid);
        }

        if out_of_order {
            bump(&self.tcp.stats().out_of_order);
        }
        let tcb = self.tcp.rec_mut(tid);
        if tcb.rx_full_segs >= 2 {
            ack_now = true;
        }
        if ack_now {
            self.tcp_send_ack(tid);
        } else if delivered > 0 {
            tcb.timers.ack_delay.start_if_stopped(now, ack_delay);
        }

        if (delivered > 0 && keep) || fin_reached {
            let tcb = self.tcp.rec(tid);
            if fin_reached {
                tcb.rx_wait.wake_all();
            } else {
                tcb.rx_wait.wake_one();
            }
            if let Some(cid) = tcb.id_conn {
                if let Some(app) = self.conns.rec(cid).id_app {
                    self.hooks.data_ready(app, cid);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use crate::addr::ConnFamily;
    use crate::conn::ConnId;
    use crate::error::NetError;
    use crate::stack::test_support::*;
    use crate::tcp::{
        TcpConnId, TcpError, TcpOptionKind, TcpState, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH,
        TCP_FLAG_RST, TCP_FLAG_SYN,
    };

    const ACK: u8 = TCP_FLAG_ACK;

    fn tid(h: &Harness, id: ConnId) -> TcpConnId {
        h.core.conns().conn(id).unwrap().id_transport().unwrap()
    }

    fn state(h: &Harness, id: ConnId) -> TcpState {
        h.core.tcp().conn(tid(h, id)).unwrap().state()
    }

    /// Listener on :80 plus an established child; returns (listener,
    /// child, our ISS + 1, peer's next sequence number).
    fn established(h: &mut Harness) -> (ConnId, ConnId, u32, u32) {
        let l = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(l, local(80)).unwrap();
        h.core.listen(l, 8).unwrap();

        h.seg(peer(5000), local(80), 1000, 0, TCP_FLAG_SYN, 8192, &[TcpOptionKind::Mss(1000)], &[])
            .unwrap();
        let synack = h.tx.take().pop().unwrap();
        let our = synack.header.seq_num.wrapping_add(1);
        h.seg(peer(5000), local(80), 1001, our, ACK, 8192, &[], &[]).unwrap();
        let child = h.core.accept(l, 2).unwrap().unwrap();
        h.hooks.take();
        (l, child, our, 1001)
    }

    #[test]
    fn test_no_connection_gets_reset() {
        let mut h = Harness::new();
        assert_eq!(
            h.seg(peer(5000), local(81), 77, 0, TCP_FLAG_SYN, 100, &[], &[]),
            Err(TcpError::NoConnection)
        );
        let rst = h.tx.take().pop().unwrap();
        assert_eq!(rst.header.flags, TCP_FLAG_RST | TCP_FLAG_ACK);
        assert_eq!(rst.header.seq_num, 0);
        assert_eq!(rst.header.ack_num, 78);
        assert_eq!(rst.dst, peer(5000).ip());

        // ACK-bearing segment: reset uses its ACK as sequence number
        let _ = h.seg(peer(5000), local(81), 77, 4242, ACK, 100, &[], b"xy");
        let rst = h.tx.take().pop().unwrap();
        assert_eq!(rst.header.flags, TCP_FLAG_RST);
        assert_eq!(rst.header.seq_num, 4242);

        // A reset is never answered
        let _ = h.seg(peer(5000), local(81), 77, 0, TCP_FLAG_RST, 0, &[], &[]);
        assert!(h.tx.take().is_empty());
        assert_eq!(h.core.tcp().snapshot().rst_sent, 2);
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let mut h = Harness::new();
        let header = crate::tcp::TcpHeader::new(5000, 80, 1, 0, TCP_FLAG_SYN, 100);
        let mut bytes = crate::tcp::header::build_tcp_segment(
            &peer(5000).ip(),
            &local(80).ip(),
            header,
            &[],
            &[],
        );
        bytes[4] ^= 1;
        assert_eq!(
            h.core.rx_segment(peer(5000).ip(), local(80).ip(), None, &bytes),
            Err(TcpError::BadChecksum)
        );
        let snap = h.core.tcp().snapshot();
        assert_eq!(snap.checksum_errors, 1);
        assert_eq!(snap.rx_dropped, 1);
        assert!(h.tx.take().is_empty());
    }

    #[test]
    fn test_passive_open_creates_child() {
        let mut h = Harness::new();
        let l = h.core.conn_open(ConnFamily::Ipv4Sock, 9).unwrap();
        h.core.bind(l, local(80)).unwrap();
        h.core.listen(l, 2).unwrap();

        h.seg(peer(5000), local(80), 1000, 0, TCP_FLAG_SYN, 4000, &[TcpOptionKind::Mss(600)], &[])
            .unwrap();
        let synack = h.tx.take().pop().unwrap();
        assert_eq!(synack.header.flags, TCP_FLAG_SYN | TCP_FLAG_ACK);
        assert_eq!(synack.header.ack_num, 1001);
        assert_eq!(synack.options.mss, Some(1460));
        assert_eq!(state(&h, l), TcpState::Listen);

        // The child is found by full match before the listener
        let ids = h.core.conns().list_ids(crate::addr::ConnProtoIx::Ipv4Tcp);
        assert_eq!(ids.len(), 2);
        let child = ids.iter().copied().find(|&id| id != l).unwrap();
        assert_eq!(h.core.conns().id_app_clone_get(child), Ok(Some(9)));
        assert_eq!(state(&h, child), TcpState::SyncRxdPassive);
        assert_eq!(h.core.tcp().conn(tid(&h, child)).unwrap().mss_remote, 600);

        // Not acceptable before the handshake completes
        assert_eq!(h.core.accept(l, 3), Ok(None));

        let our = synack.header.seq_num.wrapping_add(1);
        h.seg(peer(5000), local(80), 1001, our, ACK, 4000, &[], &[]).unwrap();
        assert_eq!(state(&h, child), TcpState::Conn);
        assert_eq!(h.hooks.take(), alloc::vec![Event::AcceptReady(9, l)]);
        assert_eq!(h.core.accept(l, 3), Ok(Some(child)));
        assert_eq!(h.core.conns().id_app_get(child), Ok(Some(3)));
        assert_eq!(h.core.tcp().snapshot().conn_established, 1);
    }

    #[test]
    fn test_backlog_limits_children() {
        let mut h = Harness::new();
        let l = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(l, local(80)).unwrap();
        h.core.listen(l, 1).unwrap();

        h.seg(peer(5000), local(80), 1, 0, TCP_FLAG_SYN, 4000, &[], &[]).unwrap();
        assert_eq!(
            h.seg(peer(5001), local(80), 1, 0, TCP_FLAG_SYN, 4000, &[], &[]),
            Err(TcpError::BacklogFull)
        );
        // A retransmitted SYN reaches the existing child, not the listener
        assert_eq!(
            h.seg(peer(5000), local(80), 1, 0, TCP_FLAG_SYN, 4000, &[], &[]),
            Err(TcpError::Unacceptable)
        );
    }

    #[test]
    fn test_listener_answers_ack_with_reset() {
        let mut h = Harness::new();
        let l = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(l, local(80)).unwrap();
        h.core.listen(l, 1).unwrap();
        assert_eq!(
            h.seg(peer(5000), local(80), 10, 999, ACK, 100, &[], &[]),
            Err(TcpError::Unacceptable)
        );
        let rst = h.tx.take().pop().unwrap();
        assert_eq!(rst.header.flags, TCP_FLAG_RST);
        assert_eq!(rst.header.seq_num, 999);
    }

    #[test]
    fn test_active_open() {
        let mut h = Harness::new();
        let c = h.core.conn_open(ConnFamily::Ipv4Sock, 4).unwrap();
        h.core.bind(c, local(4000)).unwrap();
        h.core.connect(c, peer(80)).unwrap();
        let syn = h.tx.take().pop().unwrap();
        assert_eq!(syn.header.flags, TCP_FLAG_SYN);
        assert_eq!(state(&h, c), TcpState::SyncTxd);
        let iss = syn.header.seq_num;

        // Wrong ACK: reset, state unchanged
        assert_eq!(
            h.seg(peer(80), local(4000), 500, iss.wrapping_add(5), TCP_FLAG_SYN | ACK, 1000, &[], &[]),
            Err(TcpError::Unacceptable)
        );
        assert_eq!(h.tx.take().pop().unwrap().header.flags, TCP_FLAG_RST);

        h.core.set_now_ms(40);
        h.seg(peer(80), local(4000), 500, iss.wrapping_add(1), TCP_FLAG_SYN | ACK, 1000, &[], &[])
            .unwrap();
        assert_eq!(state(&h, c), TcpState::Conn);
        let ack = h.tx.take().pop().unwrap();
        assert_eq!(ack.header.flags, ACK);
        assert_eq!(ack.header.ack_num, 501);

        let tcb = h.core.tcp().conn(tid(&h, c)).unwrap();
        assert_eq!(tcb.peer_window(), 1000);
        // 40 ms first sample: 40 + max(100, 80)
        assert_eq!(tcb.rto_ms(), 140);
        assert!(!tcb.timers().retx.is_running());
    }

    #[test]
    fn test_connection_refused() {
        let mut h = Harness::new();
        let c = h.core.conn_open(ConnFamily::Ipv4Sock, 4).unwrap();
        h.core.bind(c, local(4000)).unwrap();
        h.core.connect(c, peer(80)).unwrap();
        let iss = h.tx.take().pop().unwrap().header.seq_num;

        h.seg(peer(80), local(4000), 0, iss.wrapping_add(1), TCP_FLAG_RST | ACK, 0, &[], &[])
            .unwrap();
        assert_eq!(
            h.hooks.take(),
            alloc::vec![Event::Closed(4, c, Some(NetError::ConnReset))]
        );
        assert!(!h.core.conns().is_used(c));
    }

    #[test]
    fn test_simultaneous_open() {
        let mut h = Harness::new();
        let c = h.core.conn_open(ConnFamily::Ipv4Sock, 4).unwrap();
        h.core.bind(c, local(4000)).unwrap();
        h.core.connect(c, peer(80)).unwrap();
        let iss = h.tx.take().pop().unwrap().header.seq_num;

        h.seg(peer(80), local(4000), 700, 0, TCP_FLAG_SYN, 1000, &[], &[]).unwrap();
        assert_eq!(state(&h, c), TcpState::SyncRxdActive);
        let synack = h.tx.take().pop().unwrap();
        assert_eq!(synack.header.flags, TCP_FLAG_SYN | ACK);
        assert_eq!(synack.header.seq_num, iss);
        assert_eq!(synack.header.ack_num, 701);

        h.seg(peer(80), local(4000), 701, iss.wrapping_add(1), ACK, 1000, &[], &[]).unwrap();
        assert_eq!(state(&h, c), TcpState::Conn);
    }

    #[test]
    fn test_in_order_data_and_delayed_ack() {
        let mut h = Harness::new();
        let (_, child, our, peer_seq) = established(&mut h);

        h.core.set_now_ms(1000);
        h.seg(peer(5000), local(80), peer_seq, our, ACK | TCP_FLAG_PSH, 8192, &[], b"hello")
            .unwrap();
        assert!(h.tx.take().is_empty());
        assert_eq!(h.hooks.take(), alloc::vec![Event::DataReady(2, child)]);

        // Delayed ACK fires after 200 ms
        assert_eq!(h.tick(1199), 0);
        h.tick(1200);
        let ack = h.tx.take().pop().unwrap();
        assert_eq!(ack.header.ack_num, peer_seq + 5);
        assert_eq!(ack.header.window, 8192 - 5);

        let mut buf = [0u8; 16];
        assert_eq!(h.core.tcp_rx(child, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(h.core.tcp_rx(child, &mut buf), Err(NetError::WouldBlock));
    }

    #[test]
    fn test_every_second_full_segment_acked() {
        let mut h = Harness::new();
        let (_, _, our, peer_seq) = established(&mut h);
        let full = [7u8; 1460];

        h.seg(peer(5000), local(80), peer_seq, our, ACK, 8192, &[], &full).unwrap();
        assert!(h.tx.take().is_empty());
        h.seg(peer(5000), local(80), peer_seq + 1460, our, ACK, 8192, &[], &full).unwrap();
        let ack = h.tx.take().pop().unwrap();
        assert_eq!(ack.header.ack_num, peer_seq + 2920);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut h = Harness::new();
        let (_, child, our, p) = established(&mut h);

        h.seg(peer(5000), local(80), p + 3, our, ACK, 8192, &[], b"def").unwrap();
        let dup = h.tx.take().pop().unwrap();
        assert_eq!(dup.header.ack_num, p);

        h.seg(peer(5000), local(80), p, our, ACK, 8192, &[], b"abc").unwrap();
        let ack = h.tx.take().pop().unwrap();
        assert_eq!(ack.header.ack_num, p + 6);

        let mut buf = [0u8; 16];
        assert_eq!(h.core.tcp_rx(child, &mut buf), Ok(6));
        assert_eq!(&buf[..6], b"abcdef");
        assert_eq!(h.core.tcp().snapshot().out_of_order, 1);
    }

    #[test]
    fn test_out_of_window_segment_acked_and_dropped() {
        let mut h = Harness::new();
        let (_, child, our, p) = established(&mut h);
        assert_eq!(
            h.seg(peer(5000), local(80), p + 100_000, our, ACK, 8192, &[], b"zz"),
            Err(TcpError::Unacceptable)
        );
        assert_eq!(h.tx.take().pop().unwrap().header.ack_num, p);
        let mut buf = [0u8; 4];
        assert_eq!(h.core.tcp_rx(child, &mut buf), Err(NetError::WouldBlock));
    }

    #[test]
    fn test_peer_close_then_local_close() {
        let mut h = Harness::new();
        let (_, child, our, p) = established(&mut h);

        h.seg(peer(5000), local(80), p, our, ACK | TCP_FLAG_FIN, 8192, &[], b"bye").unwrap();
        assert_eq!(state(&h, child), TcpState::CloseWait);
        assert_eq!(h.tx.take().pop().unwrap().header.ack_num, p + 4);

        let mut buf = [0u8; 8];
        assert_eq!(h.core.tcp_rx(child, &mut buf), Ok(3));
        assert_eq!(h.core.tcp_rx(child, &mut buf), Ok(0));

        h.core.tcp_close(child).unwrap();
        let fin = h.tx.take().pop().unwrap();
        assert_eq!(fin.header.flags, TCP_FLAG_FIN | ACK);
        assert_eq!(fin.header.seq_num, our);
        // Application detached; the transport still holds the record
        assert!(h.core.conns().is_used(child));
        assert_eq!(h.core.conns().id_app_get(child), Ok(None));

        h.seg(peer(5000), local(80), p + 4, our + 1, ACK, 8192, &[], &[]).unwrap();
        assert!(!h.core.conns().is_used(child));
        assert!(h.hooks.take().iter().all(|e| !matches!(e, Event::Closed(..))));
    }

    #[test]
    fn test_local_close_through_time_wait() {
        let mut h = Harness::new();
        let (_, child, our, p) = established(&mut h);
        let t = tid(&h, child);

        h.core.tcp_close(child).unwrap();
        let fin = h.tx.take().pop().unwrap();
        assert_eq!(fin.header.flags, TCP_FLAG_FIN | ACK);
        assert_eq!(h.core.tcp().rec(t).state, TcpState::FinWait1);

        h.seg(peer(5000), local(80), p, our + 1, ACK, 8192, &[], &[]).unwrap();
        assert_eq!(h.core.tcp().rec(t).state, TcpState::FinWait2);
        assert!(h.core.tcp().rec(t).timers.fin_wait2.is_running());

        h.core.set_now_ms(5_000);
        h.seg(peer(5000), local(80), p, our + 1, ACK | TCP_FLAG_FIN, 8192, &[], &[]).unwrap();
        assert_eq!(h.core.tcp().rec(t).state, TcpState::TimeWait);
        assert_eq!(h.tx.take().pop().unwrap().header.ack_num, p + 1);

        // 2 x MSL
        h.tick(5_000 + 119_999);
        assert!(h.core.conns().is_used(child));
        h.tick(5_000 + 120_000);
        assert!(!h.core.conns().is_used(child));
        assert!(!h.core.tcp().is_used(t));
    }

    #[test]
    fn test_simultaneous_close() {
        let mut h = Harness::new();
        let (_, child, our, p) = established(&mut h);
        let t = tid(&h, child);

        h.core.tcp_close(child).unwrap();
        h.tx.take();
        // Peer's FIN crosses ours
        h.seg(peer(5000), local(80), p, our, ACK | TCP_FLAG_FIN, 8192, &[], &[]).unwrap();
        assert_eq!(h.core.tcp().rec(t).state, TcpState::Closing);
        h.seg(peer(5000), local(80), p + 1, our + 1, ACK, 8192, &[], &[]).unwrap();
        assert_eq!(h.core.tcp().rec(t).state, TcpState::TimeWait);
    }

    #[test]
    fn test_reset_with_unread_data() {
        let mut h = Harness::new();
        let (_, child, our, p) = established(&mut h);

        h.seg(peer(5000), local(80), p, our, ACK, 8192, &[], b"last words").unwrap();
        h.hooks.take();
        h.seg(peer(5000), local(80), p + 10, 0, TCP_FLAG_RST, 0, &[], &[]).unwrap();
        assert_eq!(state(&h, child), TcpState::ClosingDataAvail);
        assert!(h.hooks.take().is_empty());

        let mut buf = [0u8; 4];
        assert_eq!(h.core.tcp_tx(child, b"x"), Err(NetError::ConnReset));
        assert_eq!(h.core.tcp_rx(child, &mut buf), Ok(4));
        assert_eq!(h.core.tcp_rx(child, &mut buf), Ok(4));
        assert_eq!(h.core.tcp_rx(child, &mut buf), Ok(2));
        // Drained: the close completes and the socket is told why
        assert_eq!(
            h.hooks.take(),
            alloc::vec![Event::Closed(2, child, Some(NetError::ConnReset))]
        );
        assert_eq!(h.core.tcp_rx(child, &mut buf), Err(NetError::InvalidHandle));
    }

    #[test]
    fn test_reset_without_data_closes_immediately() {
        let mut h = Harness::new();
        let (_, child, our, p) = established(&mut h);
        let _ = our;
        h.seg(peer(5000), local(80), p, 0, TCP_FLAG_RST, 0, &[], &[]).unwrap();
        assert_eq!(
            h.hooks.take(),
            alloc::vec![Event::Closed(2, child, Some(NetError::ConnReset))]
        );
        assert!(!h.core.conns().is_used(child));
        assert_eq!(h.core.tcp().snapshot().conn_reset, 1);
    }

    #[test]
    fn test_syn_in_window_resets() {
        let mut h = Harness::new();
        let (_, child, our, p) = established(&mut h);
        h.seg(peer(5000), local(80), p + 1, our, TCP_FLAG_SYN, 8192, &[], &[]).unwrap();
        let sent: Vec<_> = h.tx.take();
        assert_ne!(sent.last().unwrap().header.flags & TCP_FLAG_RST, 0);
        assert!(!h.core.conns().is_used(child));
    }

    #[test]
    fn test_unacceptable_ack_in_syn_received() {
        let mut h = Harness::new();
        let l = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(l, local(80)).unwrap();
        h.core.listen(l, 4).unwrap();
        h.seg(peer(5000), local(80), 1000, 0, TCP_FLAG_SYN, 8192, &[], &[]).unwrap();
        let synack = h.tx.take().pop().unwrap();

        let bogus = synack.header.seq_num.wrapping_add(50);
        assert_eq!(
            h.seg(peer(5000), local(80), 1001, bogus, ACK, 8192, &[], &[]),
            Err(TcpError::Unacceptable)
        );
        let rst = h.tx.take().pop().unwrap();
        assert_eq!(rst.header.flags, TCP_FLAG_RST);
        assert_eq!(rst.header.seq_num, bogus);
    }
}
