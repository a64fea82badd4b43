//! Transport-side teardown of TCP records.

use alloc::vec::Vec;

use super::{TcpConnId, TcpState};
use crate::conn::{ConnId, ListCursor};
use crate::error::NetError;
use crate::stack::NetCore;

impl NetCore {
    /// TCP record paired with connection `cid`, if both are live.
    pub(crate) fn tcp_of(&self, cid: ConnId) -> Option<TcpConnId> {
        let tid = self.conns.conn(cid).ok()?.id_transport?;
        self.tcp.is_used(tid).then_some(tid)
    }

    pub(crate) fn tcp_enter_time_wait(&mut self, tid: TcpConnId) {
        let now = self.now_ms;
        let tw = self.tcp.cfg().time_wait_ms();
        let tcb = self.tcp.rec_mut(tid);
        tcb.state = TcpState::TimeWait;
        tcb.timers.stop_all();
        tcb.timers.time_wait.start(now, tw);
        klog!(Trace, "{} TIME-WAIT until {}", tid, now + tw);
    }

    /// Whether tearing down `state` must tell the peer with a RST.
    fn tcp_needs_rst(state: TcpState) -> bool {
        (state.is_synchronized() && state != TcpState::TimeWait) || state.is_sync_rxd()
    }

    /// The transport is done with `tid`.
    ///
    /// If the application still has unread data the record parks in
    /// `ClosingDataAvail` and the close completes from `tcp_rx` once the
    /// receive queue drains.  Otherwise the TCP record is released and the
    /// connection closed from the transport side, telling the socket layer
    /// `reason`.
    pub(crate) fn tcp_close_conn(&mut self, tid: TcpConnId, reason: Option<NetError>) {
        if !self.tcp.is_used(tid) {
            return;
        }
        let tcb = self.tcp.rec(tid);
        let cid = tcb.id_conn;
        let has_app = cid
            .and_then(|c| self.conns.conn(c).ok())
            .is_some_and(|c| c.id_app.is_some());

        if has_app && !tcb.rx_q.is_empty() && tcb.state != TcpState::ClosingDataAvail {
            let tcb = self.tcp.rec_mut(tid);
            tcb.state = TcpState::ClosingDataAvail;
            tcb.close_reason = reason;
            tcb.timers.stop_all();
            tcb.tx_q.clear();
            tcb.retx_q.clear();
            tcb.reasm_q.clear();
            tcb.rx_wait.wake_all();
            klog!(Debug, "{} closed with {} octets unread", tid, tcb.rx_q.len());
            return;
        }

        self.tcp_release(tid, None);
        if let Some(cid) = cid {
            if let Err(e) = self.close_from_transport_inner(cid, true, reason, None) {
                klog!(Trace, "{} already closed: {}", cid, e);
            }
        }
    }

    /// Reset the peer if needed, then close with `reason`.
    pub(crate) fn tcp_abort_transport(&mut self, tid: TcpConnId, reason: NetError) {
        if Self::tcp_needs_rst(self.tcp.rec(tid).state) {
            self.tcp_send_rst(tid);
        }
        self.tcp_close_conn(tid, Some(reason));
    }

    /// Application-side teardown of the transport: reset the peer if the
    /// connection is synchronized, then release the record.
    pub(crate) fn tcp_discard(&mut self, tid: TcpConnId, cursor: Option<&mut ListCursor>) {
        if Self::tcp_needs_rst(self.tcp.rec(tid).state) {
            self.tcp_send_rst(tid);
        }
        self.tcp_release(tid, cursor);
    }

    /// Return `tid` to the pool.
    ///
    /// A listener's queued children are closed with it; a child still
    /// queued on its listener is removed from the queues.  The paired
    /// connection record is left to the caller.
    pub(crate) fn tcp_release(&mut self, tid: TcpConnId, mut cursor: Option<&mut ListCursor>) {
        if !self.tcp.is_used(tid) {
            return;
        }
        let tcb = self.tcp.rec_mut(tid);
        let children: Vec<ConnId> = tcb.syn_q.drain(..).chain(tcb.accept_q.drain(..)).collect();
        let listener = tcb.listener.take();
        let cid = tcb.id_conn;

        for child in children {
            self.tcp_close_child(child, cursor.as_deref_mut());
        }

        if let (Some(l), Some(cid)) = (listener, cid) {
            if let Some(ltid) = self.tcp_of(l) {
                let lt = self.tcp.rec_mut(ltid);
                lt.syn_q.retain(|&c| c != cid);
                lt.accept_q.retain(|&c| c != cid);
            }
        }

        klog!(Trace, "{} released", tid);
        self.tcp.free(tid);
    }

    /// Close a child nobody accepted yet.
    fn tcp_close_child(&mut self, child: ConnId, mut cursor: Option<&mut ListCursor>) {
        if !self.conns.is_used(child) {
            return;
        }
        if let Some(ctid) = self.tcp_of(child) {
            self.tcp.rec_mut(ctid).listener = None;
            self.tcp_discard(ctid, cursor.as_deref_mut());
        }
        let conn = self.conns.rec_mut(child);
        conn.id_transport = None;
        conn.id_app_clone = None;
        if conn.id_app.is_none() {
            self.conns.free(child, cursor);
        }
    }
}
