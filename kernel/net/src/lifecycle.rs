//! Connection lifecycle: coordinated close from the application and
//! transport sides, and bulk close when an interface or address goes away.
//!
//! A connection record is shared by two owners.  The socket layer holds it
//! through `id_app`, the TCP layer through `id_transport`.  Either side may
//! close first; the record returns to the pool once both handles are clear.
//!
//! ```text
//!   close_from_app(id, close_transport)     close_from_transport(id, close_app)
//!        │                                        │
//!        ├─ [close_transport] discard TCP         ├─ release TCP
//!        ├─ clear id_app                          ├─ [close_app] notify socket
//!        │                                        ├─ clear id_transport
//!        └────────── free_if_unreferenced ◄───────┘
//! ```

use alloc::vec::Vec;

use crate::addr::{ConnProtoIx, IpAddr};
use crate::conn::{Conn, ConnId, ListCursor};
use crate::error::{NetError, NetResult};
use crate::stack::NetCore;
use crate::tcp::TcpState;

impl NetCore {
    // ========================================================================
    // Close Protocol
    // ========================================================================

    /// Close `id` on behalf of the application.
    ///
    /// With `close_transport` the TCP connection is aborted (the peer is
    /// reset if synchronized) and released.  Without it, a connection still
    /// exchanging segments finishes on its own and frees the record when it
    /// is done; one with nothing left to exchange is released now.
    pub fn close_from_app(&mut self, id: ConnId, close_transport: bool) -> NetResult<()> {
        self.close_from_app_inner(id, close_transport, None)
    }

    pub(crate) fn close_from_app_inner(
        &mut self,
        id: ConnId,
        close_transport: bool,
        mut cursor: Option<&mut ListCursor>,
    ) -> NetResult<()> {
        self.conns.conn(id)?;
        let tid = self.tcp_of(id);

        if close_transport {
            if let Some(tid) = tid {
                self.tcp_discard(tid, cursor.as_deref_mut());
            }
            if self.conns.is_used(id) {
                self.conns.rec_mut(id).id_transport = None;
            }
        } else if let Some(tid) = tid {
            if Self::tcp_done_without_app(self.tcp.rec(tid).state) {
                self.tcp_release(tid, cursor.as_deref_mut());
                if self.conns.is_used(id) {
                    self.conns.rec_mut(id).id_transport = None;
                }
            } else {
                self.tcp.rec_mut(tid).app_closed = true;
            }
        }

        if !self.conns.is_used(id) {
            return Ok(());
        }
        let conn = self.conns.rec_mut(id);
        conn.id_app = None;
        conn.id_app_clone = None;
        klog!(Trace, "{} closed from app (transport {})", id, close_transport);
        self.free_if_unreferenced(id, cursor);
        Ok(())
    }

    /// Whether the transport has nothing left to do once the application
    /// lets go.  `ClosingDataAvail` only holds unread data for it.
    fn tcp_done_without_app(state: TcpState) -> bool {
        matches!(
            state,
            TcpState::None
                | TcpState::Free
                | TcpState::Closed
                | TcpState::Listen
                | TcpState::ClosingDataAvail
        )
    }

    /// Close `id` on behalf of the transport.
    ///
    /// The TCP record is released.  With `close_app` the socket layer is
    /// told through [`SockHooks::conn_closed`](crate::stack::SockHooks) and
    /// its handle dropped.
    pub fn close_from_transport(&mut self, id: ConnId, close_app: bool) -> NetResult<()> {
        self.conns.conn(id)?;
        if let Some(tid) = self.tcp_of(id) {
            self.tcp_release(tid, None);
        }
        self.close_from_transport_inner(id, close_app, None, None)
    }

    /// Transport-side close once the TCP record is gone.  `reason` is
    /// passed to the socket layer.
    pub(crate) fn close_from_transport_inner(
        &mut self,
        id: ConnId,
        close_app: bool,
        reason: Option<NetError>,
        cursor: Option<&mut ListCursor>,
    ) -> NetResult<()> {
        self.conns.conn(id)?;

        if close_app {
            let conn = self.conns.rec_mut(id);
            conn.id_app_clone = None;
            if let Some(app) = conn.id_app.take() {
                klog!(Debug, "{} closed by transport ({:?}), notifying app {}", id, reason, app);
                self.hooks.conn_closed(app, id, reason);
            }
        }

        // The socket layer may have closed the record from its hook.
        if !self.conns.is_used(id) {
            return Ok(());
        }
        self.conns.rec_mut(id).id_transport = None;
        self.free_if_unreferenced(id, cursor);
        Ok(())
    }

    /// Return `id` to the pool once neither layer holds it.
    fn free_if_unreferenced(&mut self, id: ConnId, cursor: Option<&mut ListCursor>) {
        if !self.conns.is_used(id) {
            return;
        }
        let conn = self.conns.rec(id);
        if conn.id_app.is_none() && conn.id_transport.is_none() {
            self.conns.free(id, cursor);
        }
    }

    /// Force `id` through the whole cascade: transport discarded, socket
    /// layer notified with `reason`, record freed.
    pub(crate) fn close_conn_forced(
        &mut self,
        id: ConnId,
        mut cursor: Option<&mut ListCursor>,
        reason: NetError,
    ) {
        if !self.conns.is_used(id) {
            return;
        }
        if let Some(tid) = self.tcp_of(id) {
            self.tcp_discard(tid, cursor.as_deref_mut());
        }
        if !self.conns.is_used(id) {
            return;
        }

        let conn = self.conns.rec_mut(id);
        conn.id_transport = None;
        conn.id_app_clone = None;
        if let Some(app) = conn.id_app.take() {
            self.hooks.conn_closed(app, id, Some(reason));
        }
        self.conns.free(id, cursor);
    }

    // ========================================================================
    // Bulk Close
    // ========================================================================

    /// Close every connection.
    pub fn close_all_conns(&mut self) {
        let n = self.close_matching(|_| true);
        klog!(Debug, "closed all connections ({})", n);
    }

    /// Close every connection bound to interface `if_nbr`.
    pub fn close_all_conns_by_if(&mut self, if_nbr: u8) {
        let n = self.close_matching(|c| c.if_nbr == Some(if_nbr));
        klog!(Debug, "closed {} connections on interface {}", n, if_nbr);
    }

    /// Close every connection whose local address is `addr`.
    pub fn close_all_conns_by_addr(&mut self, addr: IpAddr) {
        let n = self.close_matching(|c| c.addr_local_valid && c.addr_local.ip() == addr);
        klog!(Debug, "closed {} connections on {}", n, addr);
    }

    /// Walk every list with a cursor, then sweep unlinked records, forcing
    /// each match closed.  Returns the number closed.
    fn close_matching(&mut self, pred: impl Fn(&Conn) -> bool) -> usize {
        let mut closed = 0;

        for ix in ConnProtoIx::ALL {
            let mut cursor = ListCursor {
                next_chain: self.conns.list_head(ix),
                next_conn: None,
            };
            loop {
                let id = match cursor.next_conn {
                    Some(id) => id,
                    None => match cursor.next_chain {
                        Some(head) => {
                            cursor.next_chain = self.conns.rec(head).next_chain;
                            head
                        }
                        None => break,
                    },
                };
                let rec = self.conns.rec(id);
                cursor.next_conn = rec.next_conn;
                if pred(rec) {
                    self.close_conn_forced(id, Some(&mut cursor), NetError::ConnClosed);
                    closed += 1;
                }
            }
        }

        // Opened but never bound, or unlinked as stale.
        let unlinked: Vec<ConnId> = self
            .conns
            .used_ids()
            .into_iter()
            .filter(|&id| !self.conns.rec(id).is_linked())
            .collect();
        for id in unlinked {
            if self.conns.is_used(id) && pred(self.conns.rec(id)) {
                self.close_conn_forced(id, None, NetError::ConnClosed);
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use crate::addr::{ConnAddr, ConnFamily, ConnProtoIx, IpAddr};
    use crate::config::NetCfg;
    use crate::conn::ConnId;
    use crate::error::NetError;
    use crate::ipv4::Ipv4Addr;
    use crate::stack::test_support::*;
    use crate::tcp::{TcpOptionKind, TcpState, TCP_FLAG_ACK, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN};

    /// Listener :80 (app 1) with one accepted child (app 2), one child
    /// waiting in the SYN queue and one waiting to be accepted, plus an
    /// active open from :4000 (app 3).
    struct Setup {
        l: ConnId,
        accepted: ConnId,
        c: ConnId,
    }

    /// Open from `peer(port)` to the listener on :80; returns our ISS + 1.
    fn handshake(h: &mut Harness, port: u16, complete: bool) -> u32 {
        h.seg(peer(port), local(80), 1000, 0, TCP_FLAG_SYN, 8192, &[TcpOptionKind::Mss(1000)], &[])
            .unwrap();
        let synack = h.tx.take().pop().unwrap();
        let our = synack.header.seq_num.wrapping_add(1);
        if complete {
            h.seg(peer(port), local(80), 1001, our, TCP_FLAG_ACK, 8192, &[], &[]).unwrap();
        }
        our
    }

    fn setup(h: &mut Harness) -> Setup {
        let l = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(l, local(80)).unwrap();
        h.core.listen(l, 8).unwrap();

        handshake(h, 5000, true);
        let accepted = h.core.accept(l, 2).unwrap().unwrap();
        handshake(h, 5001, false);
        handshake(h, 5002, true);

        let c = h.core.conn_open(ConnFamily::Ipv4Sock, 3).unwrap();
        h.core.bind(c, local(4000)).unwrap();
        h.core.connect(c, peer(80)).unwrap();

        h.tx.take();
        h.hooks.take();
        Setup { l, accepted, c }
    }

    fn closed_events(h: &Harness) -> Vec<(usize, ConnId, Option<NetError>)> {
        h.hooks
            .take()
            .into_iter()
            .filter_map(|e| match e {
                Event::Closed(app, id, reason) => Some((app, id, reason)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_close_app_then_transport() {
        let mut h = Harness::new();
        let id = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(id, local(7)).unwrap();
        let frees = h.core.conns().snapshot().pool.frees;

        h.core.close_from_app(id, true).unwrap();
        assert!(!h.core.conns().is_used(id));
        assert_eq!(h.core.close_from_transport(id, true), Err(NetError::InvalidHandle));
        assert_eq!(h.core.conns().snapshot().pool.frees, frees + 1);
        assert_eq!(h.core.tcp().snapshot().pool.in_use, 0);
        assert!(h.core.conns().list_ids(ConnProtoIx::Ipv4Tcp).is_empty());
        // The app asked for the close; it is not told about it
        assert!(h.hooks.take().is_empty());
    }

    #[test]
    fn test_close_transport_then_app() {
        let mut h = Harness::new();
        let id = h.core.conn_open(ConnFamily::Ipv4Sock, 4).unwrap();
        let frees = h.core.conns().snapshot().pool.frees;

        h.core.close_from_transport(id, true).unwrap();
        assert_eq!(h.hooks.take(), vec![Event::Closed(4, id, None)]);
        assert!(!h.core.conns().is_used(id));
        assert_eq!(h.core.close_from_app(id, true), Err(NetError::InvalidHandle));
        assert_eq!(h.core.conns().snapshot().pool.frees, frees + 1);
    }

    #[test]
    fn test_record_held_until_both_sides_close() {
        let mut h = Harness::new();
        let id = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(id, local(4000)).unwrap();
        h.core.connect(id, peer(80)).unwrap();

        // The SYN is still outstanding; the transport keeps the record
        h.core.close_from_app(id, false).unwrap();
        assert!(h.core.conns().is_used(id));
        assert_eq!(h.core.conns().id_app_get(id), Ok(None));
        assert!(h.core.conns().id_transport_get(id).unwrap().is_some());

        h.core.close_from_transport(id, true).unwrap();
        assert!(!h.core.conns().is_used(id));
        assert!(h.hooks.take().is_empty());
    }

    #[test]
    fn test_app_close_of_unopened_conn_frees() {
        let mut h = Harness::new();
        let id = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(id, local(7)).unwrap();

        h.core.close_from_app(id, false).unwrap();
        assert!(!h.core.conns().is_used(id));
        assert_eq!(h.core.tcp().snapshot().pool.in_use, 0);
        assert!(h.tx.take().is_empty());
    }

    #[test]
    fn test_transport_close_after_record_gone() {
        let mut h = Harness::new();
        let id = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(id, local(4000)).unwrap();
        h.core.connect(id, peer(80)).unwrap();
        let tid = h.core.conns().id_transport_get(id).unwrap().unwrap();

        let conn = h.core.conns.rec_mut(id);
        conn.id_app = None;
        conn.id_transport = None;
        h.core.conns.free(id, None);

        // The TCB still names the dead record; closing it only logs
        h.core.tcp_close_conn(tid, None);
        assert!(!h.core.tcp().is_used(tid));
        assert_eq!(h.core.tcp().snapshot().pool.in_use, 0);
        assert!(h.hooks.take().is_empty());
    }

    #[test]
    fn test_app_close_after_reset_with_unread_data_frees() {
        let mut h = Harness::new();
        let l = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(l, local(80)).unwrap();
        h.core.listen(l, 4).unwrap();
        let our = handshake(&mut h, 5000, true);
        let child = h.core.accept(l, 2).unwrap().unwrap();

        h.seg(peer(5000), local(80), 1001, our, TCP_FLAG_ACK | TCP_FLAG_PSH, 8192, &[], b"abcdef")
            .unwrap();
        h.seg(peer(5000), local(80), 1007, 0, TCP_FLAG_RST, 0, &[], &[]).unwrap();
        let tid = h.core.conns().conn(child).unwrap().id_transport().unwrap();
        assert_eq!(h.core.tcp().conn(tid).unwrap().state(), TcpState::ClosingDataAvail);
        h.hooks.take();

        // Nothing else would ever drain the queue
        h.core.close_from_app(child, false).unwrap();
        assert!(!h.core.conns().is_used(child));
        assert_eq!(h.core.conns().snapshot().pool.in_use, 1);
        assert_eq!(h.core.tcp().snapshot().pool.in_use, 1);
        assert!(closed_events(&h).is_empty());
        assert!(h.core.conns().is_used(l));
    }

    #[test]
    fn test_close_all_with_promoted_listener() {
        let mut cfg = NetCfg::default();
        cfg.conn.accessed_th = 10;
        let mut h = Harness::with_cfg(cfg);
        let s = setup(&mut h);

        // Reset-only hits promote the listener ahead of its children
        for _ in 0..11 {
            h.seg(peer(6000), local(80), 1, 0, TCP_FLAG_RST, 0, &[], &[]).unwrap();
        }
        let ids = h.core.conns().list_ids(ConnProtoIx::Ipv4Tcp);
        assert_eq!(ids.len(), 5);
        assert!(h.core.conns().chain_heads(ConnProtoIx::Ipv4Tcp).contains(&s.l));

        h.core.close_all_conns();

        assert_eq!(h.core.conns().snapshot().pool.in_use, 0);
        assert_eq!(h.core.tcp().snapshot().pool.in_use, 0);
        for id in ids {
            assert!(!h.core.conns().is_used(id));
        }

        let events = closed_events(&h);
        assert_eq!(events.len(), 3);
        for expected in [
            (1, s.l, Some(NetError::ConnClosed)),
            (2, s.accepted, Some(NetError::ConnClosed)),
            (3, s.c, Some(NetError::ConnClosed)),
        ] {
            assert!(events.contains(&expected));
        }

        // Established and half-open children are reset; the listener and
        // the unanswered SYN are not.
        let rsts = h
            .tx
            .take()
            .into_iter()
            .filter(|s| s.header.flags & TCP_FLAG_RST != 0)
            .count();
        assert_eq!(rsts, 3);
    }

    #[test]
    fn test_close_all_includes_unbound() {
        let mut h = Harness::new();
        let id = h.core.conn_open(ConnFamily::Ipv4Sock, 9).unwrap();
        h.core.close_all_conns();
        assert!(!h.core.conns().is_used(id));
        assert_eq!(closed_events(&h), vec![(9, id, Some(NetError::ConnClosed))]);
    }

    #[test]
    fn test_close_by_if() {
        let mut h = Harness::new();
        let s = setup(&mut h);

        h.core.close_all_conns_by_if(2);
        assert!(closed_events(&h).is_empty());
        assert_eq!(h.core.conns().list_ids(ConnProtoIx::Ipv4Tcp).len(), 5);

        // Only the passive children learned their interface from a segment
        h.core.close_all_conns_by_if(1);
        assert_eq!(closed_events(&h), vec![(2, s.accepted, Some(NetError::ConnClosed))]);
        assert!(h.core.conns().is_used(s.l));
        assert!(h.core.conns().is_used(s.c));
        assert_eq!(h.core.conns().list_ids(ConnProtoIx::Ipv4Tcp).len(), 2);
    }

    #[test]
    fn test_close_by_addr() {
        let mut h = Harness::new();
        let s = setup(&mut h);
        let other = h.core.conn_open(ConnFamily::Ipv4Sock, 5).unwrap();
        h.core
            .bind(other, ConnAddr::from_v4(Ipv4Addr([10, 0, 0, 9]), 4001))
            .unwrap();

        h.core.close_all_conns_by_addr(IpAddr::V4(LOCAL_IP));
        assert!(h.core.conns().is_used(other));
        assert_eq!(h.core.conns().list_ids(ConnProtoIx::Ipv4Tcp), vec![other]);
        assert!(!h.core.conns().is_used(s.l));
        assert!(!h.core.conns().is_used(s.accepted));
        assert!(!h.core.conns().is_used(s.c));
        assert_eq!(closed_events(&h).len(), 3);
    }

    #[test]
    fn test_stale_listener_closed_on_search() {
        let mut h = Harness::new();
        let l = h.core.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        h.core.bind(l, local(80)).unwrap();
        h.core.listen(l, 4).unwrap();
        h.core.conns_mut().addr_local_invalidate(l).unwrap();

        assert!(h
            .seg(peer(5000), local(80), 1000, 0, TCP_FLAG_SYN, 8192, &[], &[])
            .is_err());
        assert!(!h.core.conns().is_used(l));
        assert_eq!(h.hooks.take(), vec![Event::Closed(1, l, Some(NetError::ConnClosed))]);

        let sent = h.tx.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.flags, TCP_FLAG_RST | TCP_FLAG_ACK);
    }
}
