//! Connection records and the connection table.
//!
//! A connection record ties an application handle (socket) and a transport
//! handle (TCP connection) to a local/remote address pair.  Records live in
//! a fixed arena; [`ConnTable::get`] hands one out and [`ConnTable::free`]
//! returns it once neither the application nor the transport refers to it.
//!
//! Records with a valid local address are additionally linked into one of
//! the per-protocol lists (see [`list`]) so incoming datagrams can be
//! demultiplexed.
//!
//! The table performs no locking.  Every method is called with the stack
//! lock held; only the promotion threshold is shared outside it.

pub mod list;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use crate::addr::{ConnAddr, ConnFamily, ConnProtoIx, CONN_PROTO_IX_NBR};
use crate::config::{validate_accessed_th, ConnCfg};
use crate::error::{NetError, NetResult};
use crate::ipv4::{self, Ipv4TxParams};
use crate::ipv6::{self, Ipv6TxParams};
use crate::pool::{IdPool, PoolStatsSnapshot};
use crate::tcp::TcpConnId;

pub use list::{ConnMatch, ListCursor, SrchResult};

/// Index of a connection record in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u16);

impl core::fmt::Display for ConnId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Application-layer handle (socket descriptor) a connection reports to.
pub type AppId = usize;

// ============================================================================
// Connection Record
// ============================================================================

/// One entry of the connection arena.
#[derive(Debug, Clone)]
pub struct Conn {
    pub(crate) id: ConnId,
    pub(crate) used: bool,
    pub(crate) family: ConnFamily,
    pub(crate) proto_ix: ConnProtoIx,

    pub(crate) id_app: Option<AppId>,
    pub(crate) id_app_clone: Option<AppId>,
    pub(crate) id_transport: Option<TcpConnId>,

    pub(crate) addr_local: ConnAddr,
    pub(crate) addr_local_valid: bool,
    pub(crate) addr_remote: ConnAddr,
    pub(crate) addr_remote_valid: bool,

    pub(crate) if_nbr: Option<u8>,

    // List linkage.  Chain links are only meaningful on a chain head.
    pub(crate) conn_list: Option<ConnProtoIx>,
    pub(crate) prev_chain: Option<ConnId>,
    pub(crate) next_chain: Option<ConnId>,
    pub(crate) prev_conn: Option<ConnId>,
    pub(crate) next_conn: Option<ConnId>,
    pub(crate) chain_accessed_ctr: u16,
    pub(crate) conn_accessed_ctr: u16,

    pub(crate) ipv4: Ipv4TxParams,
    pub(crate) ipv6: Ipv6TxParams,
}

impl Conn {
    fn new(id: ConnId) -> Self {
        let unset = ConnAddr::from_v4(crate::ipv4::Ipv4Addr::UNSPECIFIED, 0);
        Conn {
            id,
            used: false,
            family: ConnFamily::Ipv4Sock,
            proto_ix: ConnProtoIx::Ipv4Tcp,
            id_app: None,
            id_app_clone: None,
            id_transport: None,
            addr_local: unset,
            addr_local_valid: false,
            addr_remote: unset,
            addr_remote_valid: false,
            if_nbr: None,
            conn_list: None,
            prev_chain: None,
            next_chain: None,
            prev_conn: None,
            next_conn: None,
            chain_accessed_ctr: 0,
            conn_accessed_ctr: 0,
            ipv4: Ipv4TxParams::default(),
            ipv6: Ipv6TxParams::default(),
        }
    }

    fn clear(&mut self) {
        *self = Conn::new(self.id);
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn family(&self) -> ConnFamily {
        self.family
    }

    #[inline]
    pub fn proto_ix(&self) -> ConnProtoIx {
        self.proto_ix
    }

    /// Local address, if set and not invalidated
    pub fn local(&self) -> Option<ConnAddr> {
        self.addr_local_valid.then_some(self.addr_local)
    }

    /// Remote address, if set
    pub fn remote(&self) -> Option<ConnAddr> {
        self.addr_remote_valid.then_some(self.addr_remote)
    }

    #[inline]
    pub fn id_app(&self) -> Option<AppId> {
        self.id_app
    }

    #[inline]
    pub fn id_transport(&self) -> Option<TcpConnId> {
        self.id_transport
    }

    #[inline]
    pub fn if_nbr(&self) -> Option<u8> {
        self.if_nbr
    }

    /// Whether the record is linked into a connection list
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.conn_list.is_some()
    }

    fn addr_len_matches(&self, addr: &ConnAddr) -> bool {
        addr.family() == self.family
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Connection table counters.
#[derive(Debug, Default)]
pub struct ConnStats {
    /// Searches that found a connection
    pub srch_hits: AtomicU64,
    /// Searches that found nothing
    pub srch_misses: AtomicU64,
    /// Chains moved to the head of their list
    pub chain_promotions: AtomicU64,
    /// Connections moved to the head of their chain
    pub conn_promotions: AtomicU64,
    /// Stale records unlinked during a search
    pub stale_unlinked: AtomicU64,
}

/// Point-in-time copy of the connection table counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStatsSnapshot {
    pub pool: PoolStatsSnapshot,
    pub srch_hits: u64,
    pub srch_misses: u64,
    pub chain_promotions: u64,
    pub conn_promotions: u64,
    pub stale_unlinked: u64,
}

// ============================================================================
// Connection Table
// ============================================================================

/// Fixed arena of connection records plus the per-protocol list heads.
pub struct ConnTable {
    conns: Vec<Conn>,
    pool: IdPool,
    lists: [Option<ConnId>; CONN_PROTO_IX_NBR],
    accessed_th: Arc<AtomicU16>,
    stats: ConnStats,
}

impl ConnTable {
    /// Build a table from a validated configuration.
    pub fn new(cfg: &ConnCfg) -> NetResult<Self> {
        cfg.validate()?;
        let conns = (0..cfg.conn_nbr as u16).map(|i| Conn::new(ConnId(i))).collect();
        Ok(ConnTable {
            conns,
            pool: IdPool::new(cfg.conn_nbr),
            lists: [None; CONN_PROTO_IX_NBR],
            accessed_th: Arc::new(AtomicU16::new(cfg.accessed_th)),
            stats: ConnStats::default(),
        })
    }

    #[inline]
    pub(crate) fn rec(&self, id: ConnId) -> &Conn {
        &self.conns[id.0 as usize]
    }

    #[inline]
    pub(crate) fn rec_mut(&mut self, id: ConnId) -> &mut Conn {
        &mut self.conns[id.0 as usize]
    }

    /// Validated access to an in-use record.
    pub fn conn(&self, id: ConnId) -> NetResult<&Conn> {
        match self.conns.get(id.0 as usize) {
            Some(c) if c.used => Ok(c),
            _ => Err(NetError::InvalidHandle),
        }
    }

    fn conn_mut(&mut self, id: ConnId) -> NetResult<&mut Conn> {
        match self.conns.get_mut(id.0 as usize) {
            Some(c) if c.used => Ok(c),
            _ => Err(NetError::InvalidHandle),
        }
    }

    pub fn is_used(&self, id: ConnId) -> bool {
        self.conn(id).is_ok()
    }

    /// Number of records in the arena.
    pub fn capacity(&self) -> usize {
        self.conns.len()
    }

    // ========================================================================
    // Pool
    // ========================================================================

    /// Take a record from the pool for `family` on list `proto_ix`.
    pub fn get(&mut self, family: ConnFamily, proto_ix: ConnProtoIx) -> NetResult<ConnId> {
        if proto_ix.family() != family || !proto_ix.is_available() {
            return Err(NetError::InvalidArg);
        }

        let id = match self.pool.alloc() {
            Some(ix) => ConnId(ix),
            None => {
                klog!(Warn, "connection pool empty ({} in use)", self.pool.in_use());
                return Err(NetError::PoolEmpty);
            }
        };

        let conn = self.rec_mut(id);
        conn.clear();
        conn.used = true;
        conn.family = family;
        conn.proto_ix = proto_ix;
        if family == ConnFamily::Ipv6Sock {
            let unset = ConnAddr::from_v6(crate::ipv6::Ipv6Addr::UNSPECIFIED, 0);
            conn.addr_local = unset;
            conn.addr_remote = unset;
        }
        klog!(Trace, "{} get ({:?})", id, proto_ix);
        Ok(id)
    }

    /// Unlink a record, clear it and return it to the pool.
    ///
    /// Both the application and transport handles must already be cleared;
    /// freeing a referenced record panics.  `cursor` is advanced past the
    /// record first if a bulk traversal currently points at it.
    pub fn free(&mut self, id: ConnId, cursor: Option<&mut ListCursor>) {
        let conn = self.rec(id);
        if !conn.used {
            return;
        }
        if conn.id_app.is_some() || conn.id_transport.is_some() {
            klog_force!(
                "{} freed while still referenced (app {:?}, transport {:?})",
                id,
                conn.id_app,
                conn.id_transport
            );
            panic!("{} freed while still referenced", id);
        }
        self.list_unlink(id, cursor);
        self.rec_mut(id).clear();
        self.pool.free(id.0);
        klog!(Trace, "{} free", id);
    }

    // ========================================================================
    // Handles
    // ========================================================================

    pub fn id_app_get(&self, id: ConnId) -> NetResult<Option<AppId>> {
        Ok(self.conn(id)?.id_app)
    }

    pub fn id_app_set(&mut self, id: ConnId, app: Option<AppId>) -> NetResult<()> {
        self.conn_mut(id)?.id_app = app;
        Ok(())
    }

    pub fn id_app_clone_get(&self, id: ConnId) -> NetResult<Option<AppId>> {
        Ok(self.conn(id)?.id_app_clone)
    }

    pub fn id_app_clone_set(&mut self, id: ConnId, app: Option<AppId>) -> NetResult<()> {
        self.conn_mut(id)?.id_app_clone = app;
        Ok(())
    }

    pub fn id_transport_get(&self, id: ConnId) -> NetResult<Option<TcpConnId>> {
        Ok(self.conn(id)?.id_transport)
    }

    pub fn id_transport_set(&mut self, id: ConnId, transport: Option<TcpConnId>) -> NetResult<()> {
        self.conn_mut(id)?.id_transport = transport;
        Ok(())
    }

    pub fn if_nbr_get(&self, id: ConnId) -> NetResult<Option<u8>> {
        Ok(self.conn(id)?.if_nbr)
    }

    pub fn if_nbr_set(&mut self, id: ConnId, if_nbr: Option<u8>) -> NetResult<()> {
        self.conn_mut(id)?.if_nbr = if_nbr;
        Ok(())
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    /// Set the local address and link the record into its list.
    ///
    /// An already-set address is only replaced when `overwrite` is true.
    pub fn addr_local_set(&mut self, id: ConnId, addr: ConnAddr, overwrite: bool) -> NetResult<()> {
        let conn = self.conn(id)?;
        if !conn.addr_len_matches(&addr) {
            return Err(NetError::InvalidArg);
        }
        if conn.addr_local_valid && !overwrite {
            return Err(NetError::AlreadyExists);
        }

        if conn.is_linked() {
            self.list_unlink(id, None);
        }
        let conn = self.rec_mut(id);
        conn.addr_local = addr;
        conn.addr_local_valid = true;
        self.list_add(id)
    }

    pub fn addr_local_get(&self, id: ConnId) -> NetResult<ConnAddr> {
        self.conn(id)?.local().ok_or(NetError::NotFound)
    }

    /// Mark the local address invalid.
    ///
    /// The record stays linked; the next search that reaches it unlinks it
    /// and reports it for closing.
    pub fn addr_local_invalidate(&mut self, id: ConnId) -> NetResult<()> {
        self.conn_mut(id)?.addr_local_valid = false;
        Ok(())
    }

    pub fn addr_remote_set(&mut self, id: ConnId, addr: ConnAddr, overwrite: bool) -> NetResult<()> {
        let conn = self.conn_mut(id)?;
        if !conn.addr_len_matches(&addr) {
            return Err(NetError::InvalidArg);
        }
        if conn.addr_remote_valid && !overwrite {
            return Err(NetError::AlreadyExists);
        }
        conn.addr_remote = addr;
        conn.addr_remote_valid = true;
        Ok(())
    }

    pub fn addr_remote_get(&self, id: ConnId) -> NetResult<ConnAddr> {
        self.conn(id)?.remote().ok_or(NetError::NotFound)
    }

    // ========================================================================
    // IP Transmit Parameters
    // ========================================================================

    fn conn_v4_mut(&mut self, id: ConnId) -> NetResult<&mut Conn> {
        let conn = self.conn_mut(id)?;
        if conn.family != ConnFamily::Ipv4Sock {
            return Err(NetError::InvalidArg);
        }
        Ok(conn)
    }

    fn conn_v6_mut(&mut self, id: ConnId) -> NetResult<&mut Conn> {
        let conn = self.conn_mut(id)?;
        if conn.family != ConnFamily::Ipv6Sock {
            return Err(NetError::InvalidArg);
        }
        Ok(conn)
    }

    pub fn ipv4_tx_params_get(&self, id: ConnId) -> NetResult<Ipv4TxParams> {
        let conn = self.conn(id)?;
        if conn.family != ConnFamily::Ipv4Sock {
            return Err(NetError::InvalidArg);
        }
        Ok(conn.ipv4)
    }

    pub fn ipv4_tos_set(&mut self, id: ConnId, tos: u8) -> NetResult<()> {
        ipv4::validate_tos(tos)?;
        self.conn_v4_mut(id)?.ipv4.tos = tos;
        Ok(())
    }

    pub fn ipv4_ttl_set(&mut self, id: ConnId, ttl: u8) -> NetResult<()> {
        ipv4::validate_ttl(ttl)?;
        self.conn_v4_mut(id)?.ipv4.ttl = ttl;
        Ok(())
    }

    pub fn ipv4_flags_set(&mut self, id: ConnId, flags: u16) -> NetResult<()> {
        ipv4::validate_flags(flags)?;
        self.conn_v4_mut(id)?.ipv4.flags = flags;
        Ok(())
    }

    pub fn ipv6_tx_params_get(&self, id: ConnId) -> NetResult<Ipv6TxParams> {
        let conn = self.conn(id)?;
        if conn.family != ConnFamily::Ipv6Sock {
            return Err(NetError::InvalidArg);
        }
        Ok(conn.ipv6)
    }

    pub fn ipv6_traffic_class_set(&mut self, id: ConnId, traffic_class: u8) -> NetResult<()> {
        self.conn_v6_mut(id)?.ipv6.traffic_class = traffic_class;
        Ok(())
    }

    pub fn ipv6_flow_label_set(&mut self, id: ConnId, label: u32) -> NetResult<()> {
        ipv6::validate_flow_label(label)?;
        self.conn_v6_mut(id)?.ipv6.flow_label = label;
        Ok(())
    }

    pub fn ipv6_hop_limit_set(&mut self, id: ConnId, hop_limit: u8) -> NetResult<()> {
        ipv6::validate_hop_limit(hop_limit)?;
        self.conn_v6_mut(id)?.ipv6.hop_limit = hop_limit;
        Ok(())
    }

    // ========================================================================
    // Promotion Threshold
    // ========================================================================

    /// Set the number of search hits after which a chain or connection is
    /// moved to the front.
    pub fn cfg_accessed_th(&self, th: u16) -> NetResult<()> {
        validate_accessed_th(th)?;
        self.accessed_th.store(th, Ordering::Relaxed);
        Ok(())
    }

    #[inline]
    pub fn accessed_th(&self) -> u16 {
        self.accessed_th.load(Ordering::Relaxed)
    }

    /// Shared handle so the threshold can be read and set without the
    /// stack lock.
    pub fn accessed_th_handle(&self) -> Arc<AtomicU16> {
        Arc::clone(&self.accessed_th)
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    pub fn snapshot(&self) -> ConnStatsSnapshot {
        ConnStatsSnapshot {
            pool: self.pool.snapshot(),
            srch_hits: self.stats.srch_hits.load(Ordering::Relaxed),
            srch_misses: self.stats.srch_misses.load(Ordering::Relaxed),
            chain_promotions: self.stats.chain_promotions.load(Ordering::Relaxed),
            conn_promotions: self.stats.conn_promotions.load(Ordering::Relaxed),
            stale_unlinked: self.stats.stale_unlinked.load(Ordering::Relaxed),
        }
    }

    /// Ids of every in-use record, in arena order.
    pub fn used_ids(&self) -> Vec<ConnId> {
        self.conns.iter().filter(|c| c.used).map(|c| c.id).collect()
    }
}
