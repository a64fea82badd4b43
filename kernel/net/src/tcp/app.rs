//! Application-facing TCP operations: open, bind, listen, connect, accept,
//! send, receive, close and abort.
//!
//! Each entry validates the connection handle once; the helpers below it
//! trust the ids they are given.

use super::{TcpConnId, TcpState};
use crate::addr::{ConnAddr, ConnFamily, ConnProtoIx};
use crate::config::{TCP_BACKLOG_MAX, TCP_BACKLOG_MIN};
use crate::conn::{AppId, ConnId};
use crate::error::{NetError, NetResult};
use crate::stack::NetCore;

impl NetCore {
    /// The application's hold on `id`; gone once it closed the connection
    /// or the transport closed it underneath.
    fn app_conn(&self, id: ConnId) -> NetResult<()> {
        match self.conns.conn(id)?.id_app {
            Some(_) => Ok(()),
            None => Err(NetError::InvalidHandle),
        }
    }

    /// TCP record of an application's connection.
    fn app_tcp(&self, id: ConnId) -> NetResult<TcpConnId> {
        self.app_conn(id)?;
        self.tcp_of(id).ok_or(NetError::InvalidHandle)
    }

    /// Whether another record of list `ix` already uses this address pair.
    fn addr_in_use(&self, ix: ConnProtoIx, id: ConnId, local: ConnAddr, remote: Option<ConnAddr>) -> bool {
        self.conns.list_ids(ix).into_iter().any(|other| {
            let rec = self.conns.rec(other);
            other != id && rec.local() == Some(local) && rec.remote() == remote
        })
    }

    /// Allocate a connection record and its TCP record for `app`.
    pub fn conn_open(&mut self, family: ConnFamily, app: AppId) -> NetResult<ConnId> {
        let id = self.conns.get(family, ConnProtoIx::tcp_for(family))?;
        let tid = match self.tcp.get() {
            Ok(tid) => tid,
            Err(e) => {
                self.conns.free(id, None);
                return Err(e);
            }
        };
        self.tcp.rec_mut(tid).id_conn = Some(id);
        let conn = self.conns.rec_mut(id);
        conn.id_transport = Some(tid);
        conn.id_app = Some(app);
        klog!(Trace, "{} open ({}) for app {}", id, tid, app);
        Ok(id)
    }

    pub fn bind(&mut self, id: ConnId, local: ConnAddr) -> NetResult<()> {
        let tid = self.app_tcp(id)?;
        if !matches!(self.tcp.rec(tid).state, TcpState::None | TcpState::Closed) {
            return Err(NetError::InvalidState);
        }
        let conn = self.conns.rec(id);
        if local.port() == 0 || local.family() != conn.family {
            return Err(NetError::InvalidArg);
        }
        if self.addr_in_use(conn.proto_ix, id, local, None) {
            return Err(NetError::AlreadyExists);
        }
        self.conns.addr_local_set(id, local, false)
    }

    /// Passive open.
    pub fn listen(&mut self, id: ConnId, backlog: usize) -> NetResult<()> {
        let tid = self.app_tcp(id)?;
        if !(TCP_BACKLOG_MIN..=TCP_BACKLOG_MAX).contains(&backlog) {
            return Err(NetError::InvalidArg);
        }
        if !matches!(self.tcp.rec(tid).state, TcpState::None | TcpState::Closed) {
            return Err(NetError::InvalidState);
        }
        let local = self.conns.addr_local_get(id)?;
        if self.conns.rec(id).remote().is_some() {
            return Err(NetError::InvalidState);
        }

        let tcb = self.tcp.rec_mut(tid);
        tcb.state = TcpState::Listen;
        tcb.backlog = backlog;
        klog!(Debug, "{} listening on {} (backlog {})", id, local, backlog);
        Ok(())
    }

    /// Active open: send our SYN.  Completion is reported through
    /// [`NetCore::is_connected`].
    pub fn connect(&mut self, id: ConnId, remote: ConnAddr) -> NetResult<()> {
        let tid = self.app_tcp(id)?;
        if !matches!(self.tcp.rec(tid).state, TcpState::None | TcpState::Closed) {
            return Err(NetError::InvalidState);
        }
        let local = self.conns.addr_local_get(id)?;
        if local.ip().is_unspecified()
            || remote.family() != local.family()
            || remote.port() == 0
            || remote.ip().is_unspecified()
        {
            return Err(NetError::InvalidArg);
        }
        let ix = self.conns.rec(id).proto_ix;
        if self.addr_in_use(ix, id, local, Some(remote)) {
            return Err(NetError::AlreadyExists);
        }
        self.conns.addr_remote_set(id, remote, true)?;

        let iss = self.tcp.generate_iss(&local, &remote, self.now_ms);
        let tcb = self.tcp.rec_mut(tid);
        tcb.init_send_seq(iss);
        tcb.state = TcpState::SyncTxd;
        klog!(Debug, "{} connecting {} -> {}", id, local, remote);
        self.tcp_send_syn(tid);
        Ok(())
    }

    /// `Ok(true)` once the handshake completed, `Ok(false)` while it is in
    /// progress.
    pub fn is_connected(&self, id: ConnId) -> NetResult<bool> {
        let tid = self.app_tcp(id)?;
        match self.tcp.rec(tid).state {
            TcpState::SyncTxd | TcpState::SyncRxdActive | TcpState::SyncRxdPassive => Ok(false),
            TcpState::ClosingDataAvail => Ok(true),
            s if s.is_synchronized() => Ok(true),
            _ => Err(NetError::InvalidState),
        }
    }

    /// Hand the oldest completed child of `listener` to `app`.
    pub fn accept(&mut self, listener: ConnId, app: AppId) -> NetResult<Option<ConnId>> {
        let ltid = self.app_tcp(listener)?;
        if self.tcp.rec(ltid).state != TcpState::Listen {
            return Err(NetError::InvalidState);
        }
        while let Some(child) = self.tcp.rec_mut(ltid).accept_q.pop_front() {
            let Some(ctid) = self.tcp_of(child) else {
                continue;
            };
            self.tcp.rec_mut(ctid).listener = None;
            let conn = self.conns.rec_mut(child);
            conn.id_app = Some(app);
            conn.id_app_clone = None;
            klog!(Debug, "{} accepted on {} by app {}", child, listener, app);
            return Ok(Some(child));
        }
        Ok(None)
    }

    /// Queue application data.  Returns the octets taken, which may be
    /// fewer than offered when the transmit window is nearly full.
    pub fn tcp_tx(&mut self, id: ConnId, data: &[u8]) -> NetResult<usize> {
        let tid = self.app_tcp(id)?;
        let now = self.now_ms;
        let idle = self.tcp.cfg().idle_timeout_ms;
        let tcb = self.tcp.rec_mut(tid);
        match tcb.state {
            TcpState::SyncTxd
            | TcpState::SyncRxdActive
            | TcpState::SyncRxdPassive
            | TcpState::Conn
            | TcpState::CloseWait => {}
            TcpState::None | TcpState::Closed | TcpState::Listen | TcpState::Free => {
                return Err(NetError::InvalidState)
            }
            TcpState::ClosingDataAvail => {
                return Err(tcb.close_reason.unwrap_or(NetError::ConnClosed))
            }
            _ => return Err(NetError::ConnClosed),
        }
        if tcb.fin_pending {
            return Err(NetError::ConnClosed);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let n = tcb.tx_space().min(data.len());
        if n == 0 {
            return Err(NetError::WouldBlock);
        }
        tcb.tx_q.extend(data[..n].iter().copied());
        if tcb.timers.idle.is_running() {
            tcb.timers.idle.start(now, idle);
        }
        self.tcp_output(tid);
        Ok(n)
    }

    /// Copy received data into `buf`.
    ///
    /// `Ok(0)` marks the end of the peer's stream; `WouldBlock` means
    /// nothing has arrived yet.
    pub fn tcp_rx(&mut self, id: ConnId, buf: &mut [u8]) -> NetResult<usize> {
        let tid = self.app_tcp(id)?;
        let tcb = self.tcp.rec_mut(tid);
        let state = tcb.state;
        if matches!(state, TcpState::None | TcpState::Closed | TcpState::Listen) {
            return Err(NetError::InvalidState);
        }

        if tcb.rx_q.is_empty() {
            if tcb.fin_rxd {
                return Ok(0);
            }
            if state == TcpState::ClosingDataAvail {
                let reason = tcb.close_reason;
                self.tcp_close_conn(tid, reason);
                return Err(reason.unwrap_or(NetError::ConnClosed));
            }
            return Err(NetError::WouldBlock);
        }

        let n = buf.len().min(tcb.rx_q.len());
        for (dst, octet) in buf.iter_mut().zip(tcb.rx_q.drain(..n)) {
            *dst = octet;
        }

        if state == TcpState::ClosingDataAvail {
            if tcb.rx_q.is_empty() {
                let reason = tcb.close_reason;
                self.tcp_close_conn(tid, reason);
            }
        } else if state.can_receive() && tcb.rx_win_update_due() {
            self.tcp_send_ack(tid);
        }
        Ok(n)
    }

    /// Graceful close.  The application lets go of the connection at once;
    /// the transport sends our FIN behind any queued data and finishes the
    /// close on its own.
    pub fn tcp_close(&mut self, id: ConnId) -> NetResult<()> {
        self.app_conn(id)?;
        let Some(tid) = self.tcp_of(id) else {
            return self.close_from_app_inner(id, false, None);
        };
        let tcb = self.tcp.rec_mut(tid);
        match tcb.state {
            TcpState::None
            | TcpState::Closed
            | TcpState::Listen
            | TcpState::SyncTxd
            | TcpState::ClosingDataAvail => return self.close_from_app_inner(id, true, None),
            TcpState::SyncRxdPassive | TcpState::SyncRxdActive => tcb.fin_pending = true,
            TcpState::Conn => {
                tcb.fin_pending = true;
                tcb.state = TcpState::FinWait1;
            }
            TcpState::CloseWait => {
                tcb.fin_pending = true;
                tcb.state = TcpState::LastAck;
            }
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::TimeWait
            | TcpState::LastAck => {}
            TcpState::Free => return Err(NetError::InvalidState),
        }
        klog!(Debug, "{} closing ({:?})", id, tcb.state);
        self.tcp_output(tid);
        self.close_from_app_inner(id, false, None)
    }

    /// Abortive close: reset the peer and free everything now.
    pub fn tcp_abort(&mut self, id: ConnId) -> NetResult<()> {
        self.app_conn(id)?;
        klog!(Debug, "{} aborted by application", id);
        self.close_from_app_inner(id, true, None)
    }
}

#[cfg(test)]
mod tests {
    use crate::addr::{ConnAddr, ConnFamily, IpAddr};
    use crate::config::NetCfg;
    use crate::error::NetError;
    use crate::ipv4::Ipv4Addr;
    use crate::stack::test_support::*;
    use crate::tcp::{TcpState, TCP_FLAG_ACK, TCP_FLAG_PSH, TCP_FLAG_SYN};

    const ACK: u8 = TCP_FLAG_ACK;

    /// Active open to peer:80 completed at t = 1 s with a peer window of
    /// `window`.  The 1 s handshake sample puts the RTO at 3 s.
    fn connected(h: &mut Harness, window: u16) -> (crate::conn::ConnId, u32, u32) {
        let c = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(c, local(4000)).unwrap();
        h.core.connect(c, peer(80)).unwrap();
        let iss = h.tx.take().pop().unwrap().header.seq_num;
        h.core.set_now_ms(1_000);
        h.seg(
            peer(80),
            local(4000),
            9000,
            iss.wrapping_add(1),
            TCP_FLAG_SYN | ACK,
            window,
            &[crate::tcp::TcpOptionKind::Mss(1000)],
            &[],
        )
        .unwrap();
        h.tx.take();
        (c, iss.wrapping_add(1), 9001)
    }

    #[test]
    fn test_bind_rules() {
        let mut h = Harness::new();
        let a = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        let b = h.core.conn_open(ConnFamily::Ipv4Sock, 2).unwrap();
        assert_eq!(h.core.bind(a, local(0)), Err(NetError::InvalidArg));
        h.core.bind(a, local(80)).unwrap();
        assert_eq!(h.core.bind(b, local(80)), Err(NetError::AlreadyExists));
        // Same port on the wildcard address is a different local address
        h.core.bind(b, ConnAddr::from_v4(Ipv4Addr([0, 0, 0, 0]), 80)).unwrap();
        assert_eq!(h.core.bind(a, local(81)), Err(NetError::AlreadyExists));
    }

    #[test]
    fn test_listen_and_connect_checks() {
        let mut h = Harness::new();
        let a = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        assert_eq!(h.core.listen(a, 4), Err(NetError::NotFound));
        h.core.bind(a, local(80)).unwrap();
        assert_eq!(h.core.listen(a, 0), Err(NetError::InvalidArg));
        assert_eq!(h.core.listen(a, 129), Err(NetError::InvalidArg));
        h.core.listen(a, 128).unwrap();
        assert_eq!(h.core.connect(a, peer(80)), Err(NetError::InvalidState));
        assert_eq!(h.core.is_connected(a), Err(NetError::InvalidState));

        let w = h.core.conn_open(ConnFamily::Ipv4Sock, 2).unwrap();
        h.core.bind(w, ConnAddr::from_v4(Ipv4Addr([0, 0, 0, 0]), 90)).unwrap();
        assert_eq!(h.core.connect(w, peer(80)), Err(NetError::InvalidArg));
        assert!(h.tx.take().is_empty());
    }

    #[test]
    fn test_send_respects_peer_window_and_sws() {
        let mut h = Harness::new();
        let (c, snd, rcv) = connected(&mut h, 4000);
        assert_eq!(h.core.is_connected(c), Ok(true));

        // One full segment goes out; the 500-octet tail waits: it is not
        // full-sized, the queue is not otherwise idle, and 500 < 4000 / 2.
        assert_eq!(h.core.tcp_tx(c, &[1u8; 1500]), Ok(1500));
        let sent = h.tx.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.seq_num, snd);
        assert_eq!(sent[0].payload.len(), 1000);
        assert_eq!(sent[0].header.flags, ACK);

        // ACK of the first segment: the remainder now drains the queue
        // with nothing outstanding.
        h.seg(peer(80), local(4000), rcv, snd + 1000, ACK, 4000, &[], &[]).unwrap();
        let sent = h.tx.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.len(), 500);
        assert_eq!(sent[0].header.flags, ACK | TCP_FLAG_PSH);
    }

    #[test]
    fn test_silly_window_timer_forces_small_segment() {
        let mut h = Harness::new();
        let (c, _, _) = connected(&mut h, 4000);
        h.core.tcp_tx(c, &[1u8; 1500]).unwrap();
        h.tx.take();
        h.tick(1_499);
        assert!(h.tx.take().is_empty());
        h.tick(1_500);
        let sent = h.tx.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.len(), 500);
    }

    #[test]
    fn test_send_space_limited_by_tx_window() {
        let mut cfg = NetCfg::default();
        cfg.tcp.tx_win = 2000;
        let mut h = Harness::with_cfg(cfg);
        let (c, _, _) = connected(&mut h, 0);
        assert_eq!(h.core.tcp_tx(c, &[0u8; 1500]), Ok(1500));
        assert_eq!(h.core.tcp_tx(c, &[0u8; 1500]), Ok(500));
        assert_eq!(h.core.tcp_tx(c, &[0u8; 1]), Err(NetError::WouldBlock));
    }

    #[test]
    fn test_zero_window_probe() {
        let mut h = Harness::new();
        let (c, snd, rcv) = connected(&mut h, 0);
        h.core.tcp_tx(c, b"abc").unwrap();
        assert!(h.tx.take().is_empty());

        // Persist fires one RTO later with a one-octet probe
        h.tick(4_000);
        let probe = h.tx.take();
        assert_eq!(probe.len(), 1);
        assert_eq!(probe[0].payload, b"a");
        assert_eq!(probe[0].header.seq_num, snd);
        assert_eq!(h.core.tcp().snapshot().zero_win_probes, 1);

        // Still closed: the same octet again after a doubled interval
        h.seg(peer(80), local(4000), rcv, snd, ACK, 0, &[], &[]).unwrap();
        h.tick(4_000 + 5_999);
        assert!(h.tx.take().is_empty());
        h.tick(10_000);
        let again = h.tx.take();
        assert_eq!(again[0].payload, b"a");
        assert_eq!(again[0].header.seq_num, snd);

        // Window opens: probe octet acknowledged, the rest follows
        h.seg(peer(80), local(4000), rcv, snd + 1, ACK, 1000, &[], &[]).unwrap();
        let rest = h.tx.take();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, b"bc");
        assert_eq!(rest[0].header.seq_num, snd + 1);
    }

    #[test]
    fn test_fast_retransmit() {
        let mut h = Harness::new();
        let (c, snd, rcv) = connected(&mut h, 60_000);
        h.core.tcp_tx(c, &[7u8; 2000]).unwrap();
        let sent = h.tx.take();
        assert_eq!(sent.len(), 2);

        let tid = h.core.conns().conn(c).unwrap().id_transport().unwrap();
        for _ in 0..2 {
            h.seg(peer(80), local(4000), rcv, snd, ACK, 60_000, &[], &[]).unwrap();
        }
        assert!(h.tx.take().is_empty());
        h.seg(peer(80), local(4000), rcv, snd, ACK, 60_000, &[], &[]).unwrap();
        let retx = h.tx.take();
        assert_eq!(retx.len(), 1);
        assert_eq!(retx[0].header.seq_num, snd);
        assert_eq!(retx[0].payload.len(), 1000);

        let tcb = h.core.tcp().conn(tid).unwrap();
        // flight 2000: ssthresh = max(1000, 2000), cwnd = ssthresh + 3 MSS
        assert_eq!(tcb.ssthresh(), 2000);
        assert_eq!(tcb.cwnd(), 5000);
        assert_eq!(h.core.tcp().snapshot().fast_retransmits, 1);

        // New ACK leaves fast recovery
        h.seg(peer(80), local(4000), rcv, snd + 2000, ACK, 60_000, &[], &[]).unwrap();
        assert_eq!(h.core.tcp().conn(tid).unwrap().cwnd(), 2000);
    }

    #[test]
    fn test_retransmit_then_abort_after_threshold() {
        let mut cfg = NetCfg::default();
        cfg.tcp.retx_th = 2;
        let mut h = Harness::with_cfg(cfg);
        let (c, snd, _) = connected(&mut h, 4000);
        h.core.tcp_tx(c, b"ping").unwrap();
        h.tx.take();

        h.tick(4_000);
        let retx = h.tx.take();
        assert_eq!(retx.len(), 1);
        assert_eq!(retx[0].header.seq_num, snd);
        assert_eq!(retx[0].payload, b"ping");

        // Backed off to 6 s
        h.tick(9_999);
        assert!(h.tx.take().is_empty());
        h.tick(10_000);
        assert_eq!(h.tx.take().len(), 1);

        // Third expiry exceeds the threshold
        h.tick(22_000);
        let rst = h.tx.take().pop().unwrap();
        assert_ne!(rst.header.flags & crate::tcp::TCP_FLAG_RST, 0);
        assert_eq!(h.hooks.take(), alloc::vec![Event::Closed(1, c, Some(NetError::Timeout))]);
        assert!(!h.core.conns().is_used(c));
        assert_eq!(h.core.tcp().snapshot().conn_timeouts, 1);
        assert_eq!(h.core.tcp_tx(c, b"x"), Err(NetError::InvalidHandle));
    }

    #[test]
    fn test_syn_retransmitted_until_threshold() {
        let mut cfg = NetCfg::default();
        cfg.tcp.retx_th = 1;
        let mut h = Harness::with_cfg(cfg);
        let c = h.core.conn_open(ConnFamily::Ipv4Sock, 3).unwrap();
        h.core.bind(c, local(4000)).unwrap();
        h.core.connect(c, peer(80)).unwrap();
        h.tx.take();

        h.tick(3_000);
        let syn = h.tx.take().pop().unwrap();
        assert_eq!(syn.header.flags, TCP_FLAG_SYN);
        assert_eq!(syn.options.mss, Some(1460));

        h.tick(9_000);
        // Never synchronized: no RST, just the timeout
        assert!(h.tx.take().is_empty());
        assert_eq!(h.hooks.take(), alloc::vec![Event::Closed(3, c, Some(NetError::Timeout))]);
    }

    #[test]
    fn test_close_before_connect_frees() {
        let mut h = Harness::new();
        let c = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(c, local(4000)).unwrap();
        h.core.tcp_close(c).unwrap();
        assert!(!h.core.conns().is_used(c));
        assert_eq!(h.core.tcp().snapshot().pool.in_use, 0);
        assert!(h.tx.take().is_empty());
        assert_eq!(h.core.tcp_close(c), Err(NetError::InvalidHandle));
    }

    #[test]
    fn test_close_flushes_queue_before_fin() {
        let mut h = Harness::new();
        let (c, snd, rcv) = connected(&mut h, 0);
        h.core.tcp_tx(c, b"tail").unwrap();
        h.core.tcp_close(c).unwrap();
        assert!(h.tx.take().is_empty());

        // Window opens: data and FIN leave together
        h.seg(peer(80), local(4000), rcv, snd, ACK, 1000, &[], &[]).unwrap();
        let sent = h.tx.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"tail");
        assert_ne!(sent[0].header.flags & crate::tcp::TCP_FLAG_FIN, 0);

        let tid = h.core.conns().conn(c).unwrap().id_transport().unwrap();
        assert_eq!(h.core.tcp().conn(tid).unwrap().state(), TcpState::FinWait1);
        assert_eq!(h.core.tcp_tx(c, b"more"), Err(NetError::InvalidHandle));
    }

    #[test]
    fn test_recv_window_update_after_read() {
        let mut cfg = NetCfg::default();
        cfg.tcp.rx_win = 2000;
        let mut h = Harness::with_cfg(cfg);
        let (c, snd, rcv) = connected(&mut h, 4000);

        h.seg(peer(80), local(4000), rcv, snd, ACK, 4000, &[], &[5u8; 1460]).unwrap();
        h.tick(1_200);
        let ack = h.tx.take().pop().unwrap();
        assert_eq!(ack.header.window, 540);

        // Reading frees 1460 octets, well past min(1000, 1460)
        let mut buf = [0u8; 2000];
        assert_eq!(h.core.tcp_rx(c, &mut buf), Ok(1460));
        let update = h.tx.take().pop().unwrap();
        assert_eq!(update.header.window, 2000);
        assert_eq!(update.header.ack_num, rcv + 1460);
    }

    #[test]
    fn test_ipv6_family_mismatch() {
        let mut h = Harness::new();
        let c = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        let v6 = ConnAddr::new(IpAddr::V6(crate::ipv6::Ipv6Addr::UNSPECIFIED), 80);
        assert_eq!(h.core.bind(c, v6), Err(NetError::InvalidArg));
    }
}
