//! TCP (Transmission Control Protocol) connection state machine.
//!
//! Each TCP connection record is paired with a connection record (see
//! [`crate::conn`]) that carries its addresses and list linkage.  Segments
//! are demultiplexed through the connection lists, then run through the
//! RFC 793 state machine:
//!
//! ```text
//!                              +---------+ ---------\      active OPEN
//!                              |  CLOSED |            \    -----------
//!                              +---------+<---------\   \   snd SYN
//!                                |     ^              \   \
//!                   passive OPEN |     |   CLOSE        \   \
//!                                V     |                  \   \
//!                              +---------+            CLOSE  |    \
//!                              |  LISTEN |          -------- |     |
//!                              +---------+                   |     |
//!                   rcv SYN      |     |     SEND            |     |
//!                  -----------   |     |    -------          |     V
//! +---------+      snd SYN,ACK  /       \   snd SYN        +---------+
//! |   SYN   |<-----------------           ---------------->|   SYN   |
//! |   RCVD  |<-----------------------------------------------|   SENT  |
//! |         |                    rcv SYN, snd SYN,ACK       |         |
//! +---------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +---------+
//!   |                            V     V     snd ACK
//!   |  CLOSE                   +---------+
//!   | -------                  |  ESTAB  |
//!   | snd FIN                  +---------+
//!   |                   ...FIN-WAIT / CLOSE-WAIT / TIME-WAIT...
//! ```
//!
//! A passive open creates a *child* connection in `SyncRxdPassive`; the
//! listener keeps listening and queues the child for `accept` once the
//! handshake completes.  A simultaneous open moves `SyncTxd` to
//! `SyncRxdActive`.  `ClosingDataAvail` keeps a transport-closed connection
//! around until the application has read what is left in its receive queue.
//!
//! # References
//!
//! - RFC 793: Transmission Control Protocol
//! - RFC 1122: Requirements for Internet Hosts
//! - RFC 5681: TCP Congestion Control
//! - RFC 6298: Computing TCP's Retransmission Timer
//! - RFC 6528: Defending Against Sequence Number Attacks

pub mod app;
mod close;
pub mod congestion;
pub mod conn;
pub mod header;
pub mod input;
pub mod output;
pub mod rtt;
pub mod seq;
pub mod timer;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::addr::ConnAddr;
use crate::config::TcpCfg;
use crate::error::{NetError, NetResult};
use crate::pool::{IdPool, PoolStatsSnapshot};

pub use congestion::{CongestionAction, CongestionCtl};
pub use conn::{TcpConn, TcpSegment};
pub use header::{
    TcpHeader, TcpOptionKind, TcpOptions, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST,
    TCP_FLAG_SYN, TCP_HEADER_MIN_LEN,
};
pub use rtt::RttEstimator;
pub use timer::{TcpTimerKind, TcpTimers};

/// Segment size assumed when the peer sends no MSS option (RFC 1122)
pub const TCP_DEFAULT_MSS: u16 = 536;

// ============================================================================
// Identity
// ============================================================================

/// Index of a TCP connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TcpConnId(pub u16);

impl core::fmt::Display for TcpConnId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "tcp#{}", self.0)
    }
}

// ============================================================================
// TCP State Machine
// ============================================================================

/// TCP connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Allocated, not yet opened
    None,
    /// In the pool
    Free,
    /// Transport finished; waiting for the record to be released
    Closed,
    /// Waiting for a connection request from any remote TCP
    Listen,
    /// SYN received on a listener; SYN-ACK sent (child connection)
    SyncRxdPassive,
    /// SYN received after sending our own SYN (simultaneous open)
    SyncRxdActive,
    /// SYN sent, waiting for the peer's SYN
    SyncTxd,
    /// Established; data flows both ways
    Conn,
    /// Local close, FIN sent
    FinWait1,
    /// FIN acknowledged, waiting for the peer's FIN
    FinWait2,
    /// Both sides sent FIN simultaneously
    Closing,
    /// Waiting 2×MSL before the record is released
    TimeWait,
    /// Peer closed, waiting for the local close
    CloseWait,
    /// Local close after the peer's, waiting for the FIN's ACK
    LastAck,
    /// Transport closed with received data still unread
    ClosingDataAvail,
}

impl TcpState {
    /// Application data may be queued for transmission
    pub fn can_send(&self) -> bool {
        matches!(self, TcpState::Conn | TcpState::CloseWait)
    }

    /// Segment text is accepted into the receive queue
    pub fn can_receive(&self) -> bool {
        matches!(
            self,
            TcpState::Conn | TcpState::FinWait1 | TcpState::FinWait2
        )
    }

    /// Sequence numbers of both sides are known
    pub fn is_synchronized(&self) -> bool {
        matches!(
            self,
            TcpState::Conn
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::TimeWait
                | TcpState::CloseWait
                | TcpState::LastAck
        )
    }

    pub fn is_sync_rxd(&self) -> bool {
        matches!(self, TcpState::SyncRxdPassive | TcpState::SyncRxdActive)
    }

    /// No segment should reach the state machine in this state
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            TcpState::None | TcpState::Free | TcpState::Closed | TcpState::ClosingDataAvail
        )
    }
}

// ============================================================================
// TCP Errors
// ============================================================================

/// Reasons a received segment was dropped.
///
/// These never reach the application; they are counted and returned to the
/// IP layer for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    /// Packet is too short
    Truncated,
    /// Invalid header length (data offset)
    InvalidHeaderLen,
    /// Malformed option length
    InvalidOption,
    /// Invalid flags combination
    InvalidFlags,
    /// Checksum verification failed
    BadChecksum,
    /// Source and destination families differ, or a port is zero
    InvalidAddr,
    /// No connection accepts the segment (a reset was sent if allowed)
    NoConnection,
    /// Outside the receive window or otherwise unacceptable in this state
    Unacceptable,
    /// Listener backlog full
    BacklogFull,
    /// No connection records for a passive open
    NoResources,
}

/// Result type for segment processing
pub type TcpResult<T> = Result<T, TcpError>;

impl From<NetError> for TcpError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::PoolEmpty => TcpError::NoResources,
            NetError::InvalidArg => TcpError::InvalidAddr,
            _ => TcpError::NoConnection,
        }
    }
}

// ============================================================================
// TCP Statistics
// ============================================================================

/// TCP layer counters
#[derive(Debug, Default)]
pub struct TcpStats {
    pub rx_segments: AtomicU64,
    pub tx_segments: AtomicU64,
    /// Segments dropped for any reason
    pub rx_dropped: AtomicU64,
    pub checksum_errors: AtomicU64,
    /// Malformed headers or options
    pub header_errors: AtomicU64,
    pub conn_established: AtomicU64,
    /// Connections reset by the peer
    pub conn_reset: AtomicU64,
    /// Connections aborted after the retransmission threshold or idle timeout
    pub conn_timeouts: AtomicU64,
    pub retransmissions: AtomicU64,
    pub fast_retransmits: AtomicU64,
    pub out_of_order: AtomicU64,
    pub rst_sent: AtomicU64,
    pub zero_win_probes: AtomicU64,
}

/// Point-in-time copy of [`TcpStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStatsSnapshot {
    pub pool: PoolStatsSnapshot,
    pub rx_segments: u64,
    pub tx_segments: u64,
    pub rx_dropped: u64,
    pub checksum_errors: u64,
    pub header_errors: u64,
    pub conn_established: u64,
    pub conn_reset: u64,
    pub conn_timeouts: u64,
    pub retransmissions: u64,
    pub fast_retransmits: u64,
    pub out_of_order: u64,
    pub rst_sent: u64,
    pub zero_win_probes: u64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// TCP Layer
// ============================================================================

/// Arena of TCP connection records plus layer-wide state.
pub struct TcpLayer {
    conns: Vec<TcpConn>,
    pool: IdPool,
    cfg: TcpCfg,
    stats: TcpStats,
    iss_secret: u64,
    iss_ctr: u32,
}

impl TcpLayer {
    pub fn new(cfg: &TcpCfg) -> NetResult<Self> {
        cfg.validate()?;
        let conns = (0..cfg.conn_nbr as u16)
            .map(|i| TcpConn::new(TcpConnId(i), cfg))
            .collect();
        Ok(TcpLayer {
            conns,
            pool: IdPool::new(cfg.conn_nbr),
            cfg: *cfg,
            stats: TcpStats::default(),
            iss_secret: 0x6a09_e667_f3bc_c908,
            iss_ctr: 0,
        })
    }

    #[inline]
    pub fn cfg(&self) -> &TcpCfg {
        &self.cfg
    }

    #[inline]
    pub fn stats(&self) -> &TcpStats {
        &self.stats
    }

    #[inline]
    pub(crate) fn rec(&self, id: TcpConnId) -> &TcpConn {
        &self.conns[id.0 as usize]
    }

    #[inline]
    pub(crate) fn rec_mut(&mut self, id: TcpConnId) -> &mut TcpConn {
        &mut self.conns[id.0 as usize]
    }

    /// Validated access to an in-use record.
    pub fn conn(&self, id: TcpConnId) -> NetResult<&TcpConn> {
        match self.conns.get(id.0 as usize) {
            Some(c) if c.used => Ok(c),
            _ => Err(NetError::InvalidHandle),
        }
    }

    pub fn is_used(&self, id: TcpConnId) -> bool {
        self.conn(id).is_ok()
    }

    /// Take a TCP record from the pool, initialised in state `None`.
    pub fn get(&mut self) -> NetResult<TcpConnId> {
        let Some(ix) = self.pool.alloc() else {
            klog!(Warn, "tcp connection pool empty ({} in use)", self.pool.in_use());
            return Err(NetError::PoolEmpty);
        };
        let id = TcpConnId(ix);
        let cfg = self.cfg;
        let rec = self.rec_mut(id);
        rec.reset(&cfg);
        rec.used = true;
        rec.state = TcpState::None;
        Ok(id)
    }

    /// Return a record to the pool.  Blocked readers see the queue closed.
    pub fn free(&mut self, id: TcpConnId) {
        let cfg = self.cfg;
        let rec = self.rec_mut(id);
        if !rec.used {
            return;
        }
        rec.rx_wait.close();
        rec.reset(&cfg);
        rec.used = false;
        rec.state = TcpState::Free;
        self.pool.free(id.0);
    }

    /// Ids of every in-use record.
    pub fn used_ids(&self) -> Vec<TcpConnId> {
        self.conns.iter().filter(|c| c.used).map(|c| c.id).collect()
    }

    /// Replace the initial-sequence-number secret.
    pub fn seed_iss(&mut self, secret: u64) {
        self.iss_secret = secret;
    }

    /// Initial sequence number for a connection (RFC 6528):
    /// ISN = M + F(local, remote, secret), M a 4 µs-ish clock.
    pub fn generate_iss(&mut self, local: &ConnAddr, remote: &ConnAddr, now_ms: u64) -> u32 {
        self.iss_ctr = self.iss_ctr.wrapping_add(1);

        let mut v0 = self.iss_secret;
        let mut v1 = 0u64;
        for (i, b) in local.as_bytes().iter().chain(remote.as_bytes()).enumerate() {
            v1 = v1.rotate_left(8) ^ (*b as u64) ^ ((i as u64) << 56);
            v0 = v0.wrapping_add(v1);
            v1 = v1.rotate_left(13) ^ v0;
            v0 = v0.rotate_left(32);
        }
        let mixed = v0.wrapping_add(v1).wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(23);
        let f = (mixed >> 32) as u32 ^ mixed as u32;

        let m = (now_ms.wrapping_mul(250) as u32).wrapping_add(self.iss_ctr.wrapping_mul(64_000));
        f.wrapping_add(m)
    }

    pub fn snapshot(&self) -> TcpStatsSnapshot {
        let s = &self.stats;
        let ld = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TcpStatsSnapshot {
            pool: self.pool.snapshot(),
            rx_segments: ld(&s.rx_segments),
            tx_segments: ld(&s.tx_segments),
            rx_dropped: ld(&s.rx_dropped),
            checksum_errors: ld(&s.checksum_errors),
            header_errors: ld(&s.header_errors),
            conn_established: ld(&s.conn_established),
            conn_reset: ld(&s.conn_reset),
            conn_timeouts: ld(&s.conn_timeouts),
            retransmissions: ld(&s.retransmissions),
            fast_retransmits: ld(&s.fast_retransmits),
            out_of_order: ld(&s.out_of_order),
            rst_sent: ld(&s.rst_sent),
            zero_win_probes: ld(&s.zero_win_probes),
        }
    }
}
