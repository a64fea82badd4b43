//! Network stack core: the global lock and the layer entry points.
//!
//! All connection-table and TCP state lives in a [`NetCore`] behind one
//! `spin::Mutex`.  Code holding the core manipulates the arenas without
//! further synchronisation and never blocks; the blocking calls on
//! [`NetStack`] drop the lock before waiting on a connection's queue.
//!
//! ```text
//!   IP layer ── rx_segment ──┐
//!   timer task ─ tick ───────┤      ┌──────────── NetCore ────────────┐
//!   socket layer ─ send/recv ┴─►lock│ ConnTable   TcpLayer   now_ms   │
//!                                   └──┬───────────────────────┬──────┘
//!                                      ▼ IpTx::tx               ▼ SockHooks
//! ```

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU16, Ordering};

use spin::{Mutex, MutexGuard, Once};

use crate::addr::IpAddr;
use crate::config::{validate_accessed_th, NetCfg};
use crate::conn::{AppId, Conn, ConnId, ConnTable};
use crate::error::{NetError, NetResult};
use crate::ipv4::Ipv4TxParams;
use crate::ipv6::Ipv6TxParams;
use crate::kal::WaitQueue;
use crate::tcp::TcpLayer;
use crate::addr::ConnFamily;

// ============================================================================
// Collaborators
// ============================================================================

/// IP-layer parameters for one outgoing segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpTxParams {
    V4(Ipv4TxParams),
    V6(Ipv6TxParams),
}

impl IpTxParams {
    pub(crate) fn of(conn: &Conn) -> Self {
        match conn.family {
            ConnFamily::Ipv4Sock => IpTxParams::V4(conn.ipv4),
            ConnFamily::Ipv6Sock => IpTxParams::V6(conn.ipv6),
        }
    }

    pub(crate) fn default_for(family: ConnFamily) -> Self {
        match family {
            ConnFamily::Ipv4Sock => IpTxParams::V4(Ipv4TxParams::default()),
            ConnFamily::Ipv6Sock => IpTxParams::V6(Ipv6TxParams::default()),
        }
    }
}

/// A complete TCP segment handed to the IP layer.
#[derive(Debug)]
pub struct TxSegment<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Interface the connection is bound to, if known
    pub if_nbr: Option<u8>,
    pub params: IpTxParams,
    /// TCP header, options and payload with the checksum filled in
    pub segment: &'a [u8],
}

/// IP layer transmit path.
///
/// Called with the stack lock held; implementations queue the datagram and
/// return without re-entering the stack.
pub trait IpTx: Send + Sync {
    fn tx(&self, seg: &TxSegment<'_>) -> NetResult<()>;
}

/// Socket-layer notifications.
///
/// Called with the stack lock held; implementations must not call back
/// into [`NetStack`].
pub trait SockHooks: Send + Sync {
    /// The transport closed `conn`; the application handle is now invalid.
    /// `reason` is `None` for an orderly close.
    fn conn_closed(&self, app: AppId, conn: ConnId, reason: Option<NetError>);

    /// A child of `listener` completed its handshake and can be accepted.
    fn accept_ready(&self, _app: AppId, _listener: ConnId) {}

    /// Data or end-of-stream is ready on `conn`.
    fn data_ready(&self, _app: AppId, _conn: ConnId) {}
}

/// Hooks for a stack without a socket layer.
pub struct NoSockHooks;

impl SockHooks for NoSockHooks {
    fn conn_closed(&self, _app: AppId, _conn: ConnId, _reason: Option<NetError>) {}
}

// ============================================================================
// Core
// ============================================================================

/// Everything protected by the stack lock.
pub struct NetCore {
    pub(crate) conns: ConnTable,
    pub(crate) tcp: TcpLayer,
    pub(crate) ip_tx: Arc<dyn IpTx>,
    pub(crate) hooks: Arc<dyn SockHooks>,
    pub(crate) now_ms: u64,
}

impl NetCore {
    pub fn new(cfg: &NetCfg, ip_tx: Arc<dyn IpTx>, hooks: Arc<dyn SockHooks>) -> NetResult<Self> {
        cfg.validate()?;
        Ok(NetCore {
            conns: ConnTable::new(&cfg.conn)?,
            tcp: TcpLayer::new(&cfg.tcp)?,
            ip_tx,
            hooks,
            now_ms: 0,
        })
    }

    #[inline]
    pub fn conns(&self) -> &ConnTable {
        &self.conns
    }

    #[inline]
    pub fn conns_mut(&mut self) -> &mut ConnTable {
        &mut self.conns
    }

    #[inline]
    pub fn tcp(&self) -> &TcpLayer {
        &self.tcp
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Advance the clock without running timers.
    pub fn set_now_ms(&mut self, now_ms: u64) {
        self.now_ms = self.now_ms.max(now_ms);
    }

    /// Wait queue signalled when `id` becomes readable (or acceptable).
    pub fn rx_wait_queue(&self, id: ConnId) -> NetResult<Arc<WaitQueue>> {
        let tid = self.conns.conn(id)?.id_transport.ok_or(NetError::InvalidHandle)?;
        Ok(self.tcp.conn(tid)?.rx_wait.clone())
    }
}

// ============================================================================
// Stack
// ============================================================================

/// The lock-protected stack plus the lock-free promotion threshold.
pub struct NetStack {
    core: Mutex<NetCore>,
    accessed_th: Arc<AtomicU16>,
}

impl NetStack {
    pub fn new(cfg: &NetCfg, ip_tx: Arc<dyn IpTx>, hooks: Arc<dyn SockHooks>) -> NetResult<Self> {
        let core = NetCore::new(cfg, ip_tx, hooks)?;
        let accessed_th = core.conns.accessed_th_handle();
        Ok(NetStack {
            core: Mutex::new(core),
            accessed_th,
        })
    }

    /// Take the global lock.
    pub fn lock(&self) -> MutexGuard<'_, NetCore> {
        self.core.lock()
    }

    /// Set the chain/connection promotion threshold without the lock.
    pub fn cfg_accessed_th(&self, th: u16) -> NetResult<()> {
        validate_accessed_th(th)?;
        self.accessed_th.store(th, Ordering::Relaxed);
        Ok(())
    }

    pub fn accessed_th(&self) -> u16 {
        self.accessed_th.load(Ordering::Relaxed)
    }

    // ========================================================================
    // IP Layer / Timer Entry Points
    // ========================================================================

    /// Deliver a received TCP segment (header onwards).
    pub fn rx_segment(
        &self,
        src: IpAddr,
        dst: IpAddr,
        if_nbr: Option<u8>,
        segment: &[u8],
    ) -> crate::tcp::TcpResult<()> {
        self.core.lock().rx_segment(src, dst, if_nbr, segment)
    }

    /// Run every connection timer due at `now_ms`.  Returns the number of
    /// timers that fired.
    pub fn handle_timer_tick(&self, now_ms: u64) -> usize {
        self.core.lock().handle_timer_tick(now_ms)
    }

    // ========================================================================
    // Application Entry Points
    // ========================================================================

    pub fn conn_open(&self, family: ConnFamily, app: AppId) -> NetResult<ConnId> {
        self.core.lock().conn_open(family, app)
    }

    pub fn bind(&self, id: ConnId, local: crate::addr::ConnAddr) -> NetResult<()> {
        self.core.lock().bind(id, local)
    }

    pub fn listen(&self, id: ConnId, backlog: usize) -> NetResult<()> {
        self.core.lock().listen(id, backlog)
    }

    /// Start an active open.  Does not wait for the handshake.
    pub fn connect(&self, id: ConnId, remote: crate::addr::ConnAddr) -> NetResult<()> {
        self.core.lock().connect(id, remote)
    }

    /// Wait until an active or passive open reaches ESTABLISHED.
    pub fn wait_connected(&self, id: ConnId, timeout_ms: Option<u64>) -> NetResult<()> {
        loop {
            let wait = {
                let core = self.core.lock();
                match core.is_connected(id) {
                    Ok(true) => return Ok(()),
                    Ok(false) if timeout_ms != Some(0) => core.rx_wait_queue(id)?,
                    Ok(false) => return Err(NetError::WouldBlock),
                    Err(e) => return Err(e),
                }
            };
            Result::<(), NetError>::from(wait.wait_with_timeout(timeout_ms))?;
        }
    }

    /// Take a completed connection from `listener`, handing it to `app`.
    ///
    /// `timeout_ms`: `Some(0)` never blocks, `None` waits indefinitely.
    pub fn accept(
        &self,
        listener: ConnId,
        app: AppId,
        timeout_ms: Option<u64>,
    ) -> NetResult<ConnId> {
        loop {
            let wait = {
                let mut core = self.core.lock();
                match core.accept(listener, app)? {
                    Some(child) => return Ok(child),
                    None if timeout_ms == Some(0) => return Err(NetError::WouldBlock),
                    None => core.rx_wait_queue(listener)?,
                }
            };
            Result::<(), NetError>::from(wait.wait_with_timeout(timeout_ms))?;
        }
    }

    pub fn send(&self, id: ConnId, data: &[u8]) -> NetResult<usize> {
        self.core.lock().tcp_tx(id, data)
    }

    /// Read received data.  `Ok(0)` means the peer closed its side.
    pub fn recv(&self, id: ConnId, buf: &mut [u8], timeout_ms: Option<u64>) -> NetResult<usize> {
        loop {
            let wait = {
                let mut core = self.core.lock();
                match core.tcp_rx(id, buf) {
                    Err(NetError::WouldBlock) if timeout_ms != Some(0) => core.rx_wait_queue(id)?,
                    other => return other,
                }
            };
            Result::<(), NetError>::from(wait.wait_with_timeout(timeout_ms))?;
        }
    }

    pub fn close(&self, id: ConnId) -> NetResult<()> {
        self.core.lock().tcp_close(id)
    }

    pub fn abort(&self, id: ConnId) -> NetResult<()> {
        self.core.lock().tcp_abort(id)
    }

    pub fn close_all_conns(&self) {
        self.core.lock().close_all_conns()
    }

    pub fn close_all_conns_by_if(&self, if_nbr: u8) {
        self.core.lock().close_all_conns_by_if(if_nbr)
    }

    pub fn close_all_conns_by_addr(&self, addr: IpAddr) {
        self.core.lock().close_all_conns_by_addr(addr)
    }
}

// ============================================================================
// Global Instance
// ============================================================================

static NET_STACK: Once<NetStack> = Once::new();

/// Build the kernel's stack.  Only the first call constructs it.
pub fn init(
    cfg: &NetCfg,
    ip_tx: Arc<dyn IpTx>,
    hooks: Arc<dyn SockHooks>,
) -> NetResult<&'static NetStack> {
    if let Some(stack) = NET_STACK.get() {
        return Ok(stack);
    }
    let stack = NetStack::new(cfg, ip_tx, hooks)?;
    klog_always!(
        "netconn: {} connections, {} tcp connections",
        cfg.conn.conn_nbr,
        cfg.tcp.conn_nbr
    );
    Ok(NET_STACK.call_once(|| stack))
}

/// The kernel's stack, once [`init`] has run.
pub fn net_stack() -> Option<&'static NetStack> {
    NET_STACK.get()
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use alloc::vec::Vec;

    use crate::addr::ConnAddr;
    use crate::ipv4::Ipv4Addr;
    use crate::tcp::header::{build_tcp_segment, parse_tcp_header, parse_tcp_options};
    use crate::tcp::{TcpHeader, TcpOptionKind, TcpOptions};

    /// A transmitted segment, decoded.
    #[derive(Debug, Clone)]
    pub struct Sent {
        pub src: IpAddr,
        pub dst: IpAddr,
        pub header: TcpHeader,
        pub options: TcpOptions,
        pub payload: Vec<u8>,
    }

    #[derive(Default)]
    pub struct CaptureTx {
        pub sent: Mutex<Vec<Sent>>,
    }

    impl CaptureTx {
        pub fn take(&self) -> Vec<Sent> {
            core::mem::take(&mut *self.sent.lock())
        }
    }

    impl IpTx for CaptureTx {
        fn tx(&self, seg: &TxSegment<'_>) -> NetResult<()> {
            let header = parse_tcp_header(seg.segment).map_err(|_| NetError::TxFailed)?;
            let options = parse_tcp_options(seg.segment, &header).map_err(|_| NetError::TxFailed)?;
            assert!(crate::tcp::header::verify_tcp_checksum(&seg.src, &seg.dst, seg.segment));
            self.sent.lock().push(Sent {
                src: seg.src,
                dst: seg.dst,
                header,
                options,
                payload: seg.segment[header.header_len()..].to_vec(),
            });
            Ok(())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Event {
        Closed(AppId, ConnId, Option<NetError>),
        AcceptReady(AppId, ConnId),
        DataReady(AppId, ConnId),
    }

    #[derive(Default)]
    pub struct RecordHooks {
        pub events: Mutex<Vec<Event>>,
    }

    impl RecordHooks {
        pub fn take(&self) -> Vec<Event> {
            core::mem::take(&mut *self.events.lock())
        }
    }

    impl SockHooks for RecordHooks {
        fn conn_closed(&self, app: AppId, conn: ConnId, reason: Option<NetError>) {
            self.events.lock().push(Event::Closed(app, conn, reason));
        }

        fn accept_ready(&self, app: AppId, listener: ConnId) {
            self.events.lock().push(Event::AcceptReady(app, listener));
        }

        fn data_ready(&self, app: AppId, conn: ConnId) {
            self.events.lock().push(Event::DataReady(app, conn));
        }
    }

    pub struct Harness {
        pub core: NetCore,
        pub tx: Arc<CaptureTx>,
        pub hooks: Arc<RecordHooks>,
    }

    pub const LOCAL_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 1]);
    pub const PEER_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 2]);

    pub fn local(port: u16) -> ConnAddr {
        ConnAddr::from_v4(LOCAL_IP, port)
    }

    pub fn peer(port: u16) -> ConnAddr {
        ConnAddr::from_v4(PEER_IP, port)
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_cfg(NetCfg::default())
        }

        pub fn with_cfg(cfg: NetCfg) -> Self {
            let tx = Arc::new(CaptureTx::default());
            let hooks = Arc::new(RecordHooks::default());
            let core = NetCore::new(&cfg, tx.clone(), hooks.clone()).unwrap();
            Harness { core, tx, hooks }
        }

        /// Feed a segment from `from` to `to`.
        #[allow(clippy::too_many_arguments)]
        pub fn seg(
            &mut self,
            from: ConnAddr,
            to: ConnAddr,
            seq: u32,
            ack: u32,
            flags: u8,
            window: u16,
            options: &[TcpOptionKind],
            payload: &[u8],
        ) -> crate::tcp::TcpResult<()> {
            let header = TcpHeader::new(from.port(), to.port(), seq, ack, flags, window);
            let bytes = build_tcp_segment(&from.ip(), &to.ip(), header, options, payload);
            self.core.rx_segment(from.ip(), to.ip(), Some(1), &bytes)
        }

        pub fn tick(&mut self, now_ms: u64) -> usize {
            self.core.handle_timer_tick(now_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use alloc::vec;
    use crate::tcp::{TcpState, TCP_FLAG_ACK, TCP_FLAG_RST, TCP_FLAG_SYN};

    fn stack() -> (NetStack, Arc<CaptureTx>, Arc<RecordHooks>) {
        let tx = Arc::new(CaptureTx::default());
        let hooks = Arc::new(RecordHooks::default());
        let stack = NetStack::new(&NetCfg::default(), tx.clone(), hooks.clone()).unwrap();
        (stack, tx, hooks)
    }

    #[test]
    fn test_invalid_cfg_rejected() {
        let mut cfg = NetCfg::default();
        cfg.tcp.retx_th = 0;
        let tx = Arc::new(CaptureTx::default());
        assert!(NetStack::new(&cfg, tx, Arc::new(NoSockHooks)).is_err());
    }

    #[test]
    fn test_accessed_th_outside_lock() {
        let (stack, _, _) = stack();
        assert_eq!(stack.accessed_th(), 100);
        assert_eq!(stack.cfg_accessed_th(5), Err(NetError::InvalidArg));
        stack.cfg_accessed_th(50).unwrap();
        assert_eq!(stack.lock().conns().accessed_th(), 50);
    }

    #[test]
    fn test_nonblocking_calls() {
        let (stack, tx, _) = stack();
        let l = stack.conn_open(ConnFamily::Ipv4Sock, 1).unwrap();
        stack.bind(l, local(80)).unwrap();
        stack.listen(l, 4).unwrap();
        assert_eq!(stack.accept(l, 2, Some(0)), Err(NetError::WouldBlock));

        let c = stack.conn_open(ConnFamily::Ipv4Sock, 3).unwrap();
        stack.bind(c, local(4000)).unwrap();
        stack.connect(c, peer(80)).unwrap();
        assert_eq!(stack.wait_connected(c, Some(0)), Err(NetError::WouldBlock));
        let syn = tx.take();
        assert_eq!(syn.len(), 1);
        assert_eq!(syn[0].header.flags, TCP_FLAG_SYN);

        let mut buf = [0u8; 8];
        assert_eq!(stack.recv(c, &mut buf, Some(0)), Err(NetError::WouldBlock));
        // No scheduler hooks: a blocking wait times out at once
        assert_eq!(stack.recv(c, &mut buf, Some(10)), Err(NetError::Timeout));
    }

    #[test]
    fn test_handshake_through_stack() {
        let (stack, tx, hooks) = stack();
        let l = stack.conn_open(ConnFamily::Ipv4Sock, 7).unwrap();
        stack.bind(l, local(80)).unwrap();
        stack.listen(l, 4).unwrap();

        let syn = TcpHeaderBytes::new(peer(5555), local(80), 1000, 0, TCP_FLAG_SYN);
        stack.rx_segment(peer(5555).ip(), local(80).ip(), Some(1), &syn.0).unwrap();
        let synack = tx.take().pop().unwrap();
        assert_eq!(synack.header.flags, TCP_FLAG_SYN | TCP_FLAG_ACK);
        assert_eq!(synack.header.ack_num, 1001);

        let ack = TcpHeaderBytes::new(
            peer(5555),
            local(80),
            1001,
            synack.header.seq_num.wrapping_add(1),
            TCP_FLAG_ACK,
        );
        stack.rx_segment(peer(5555).ip(), local(80).ip(), Some(1), &ack.0).unwrap();
        assert_eq!(hooks.take(), vec![Event::AcceptReady(7, l)]);

        let child = stack.accept(l, 8, Some(0)).unwrap();
        stack.wait_connected(child, Some(0)).unwrap();
        {
            let core = stack.lock();
            let tid = core.conns().conn(child).unwrap().id_transport().unwrap();
            assert_eq!(core.tcp().conn(tid).unwrap().state(), TcpState::Conn);
            assert_eq!(core.conns().id_app_get(child), Ok(Some(8)));
        }

        stack.abort(child).unwrap();
        let rst = tx.take().pop().unwrap();
        assert_ne!(rst.header.flags & TCP_FLAG_RST, 0);
        assert!(!stack.lock().conns().is_used(child));
    }

    /// A segment built for `rx_segment`.
    struct TcpHeaderBytes(alloc::vec::Vec<u8>);

    impl TcpHeaderBytes {
        fn new(
            from: crate::addr::ConnAddr,
            to: crate::addr::ConnAddr,
            seq: u32,
            ack: u32,
            flags: u8,
        ) -> Self {
            let header = crate::tcp::TcpHeader::new(from.port(), to.port(), seq, ack, flags, 8192);
            TcpHeaderBytes(crate::tcp::header::build_tcp_segment(
                &from.ip(),
                &to.ip(),
                header,
                &[],
                &[],
            ))
        }
    }
}
