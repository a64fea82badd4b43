//! Construction-time configuration for the connection table and TCP layer.
//!
//! Every tunable has a named MIN/MAX pair.  Defaults are checked against
//! their range at compile time; values supplied by the kernel are checked
//! by `validate()` when the stack is built.

use static_assertions::const_assert;

use crate::error::{NetError, NetResult};

// ============================================================================
// Connection Table
// ============================================================================

/// Minimum number of connection records
pub const CONN_NBR_MIN: usize = 1;
/// Maximum number of connection records (ids are 16-bit)
pub const CONN_NBR_MAX: usize = u16::MAX as usize;
/// Default number of connection records
pub const CONN_NBR_DEFAULT: usize = 20;

/// Minimum search hits before a chain/connection is promoted
pub const CONN_ACCESSED_TH_MIN: u16 = 10;
/// Maximum search hits before a chain/connection is promoted
pub const CONN_ACCESSED_TH_MAX: u16 = 65000;
/// Default promotion threshold
pub const CONN_ACCESSED_TH_DEFAULT: u16 = 100;

const_assert!(CONN_NBR_DEFAULT >= CONN_NBR_MIN && CONN_NBR_DEFAULT <= CONN_NBR_MAX);
const_assert!(
    CONN_ACCESSED_TH_DEFAULT >= CONN_ACCESSED_TH_MIN
        && CONN_ACCESSED_TH_DEFAULT <= CONN_ACCESSED_TH_MAX
);

/// Validate a promotion threshold.
pub fn validate_accessed_th(th: u16) -> NetResult<()> {
    if !(CONN_ACCESSED_TH_MIN..=CONN_ACCESSED_TH_MAX).contains(&th) {
        return Err(NetError::InvalidArg);
    }
    Ok(())
}

/// Connection table configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnCfg {
    /// Number of connection records in the arena
    pub conn_nbr: usize,
    /// Initial promotion threshold
    pub accessed_th: u16,
}

impl Default for ConnCfg {
    fn default() -> Self {
        Self {
            conn_nbr: CONN_NBR_DEFAULT,
            accessed_th: CONN_ACCESSED_TH_DEFAULT,
        }
    }
}

impl ConnCfg {
    pub fn validate(&self) -> NetResult<()> {
        if !(CONN_NBR_MIN..=CONN_NBR_MAX).contains(&self.conn_nbr) {
            return Err(NetError::InvalidArg);
        }
        validate_accessed_th(self.accessed_th)
    }
}

// ============================================================================
// TCP
// ============================================================================

/// Minimum number of TCP connection records
pub const TCP_CONN_NBR_MIN: usize = 1;
/// Maximum number of TCP connection records
pub const TCP_CONN_NBR_MAX: usize = u16::MAX as usize;
/// Default number of TCP connection records
pub const TCP_CONN_NBR_DEFAULT: usize = 20;

/// Smallest segment size every host must accept (RFC 879)
pub const TCP_MSS_MIN: u16 = 536;
/// Ethernet-sized segments
pub const TCP_MSS_MAX: u16 = 1460;
/// Default local MSS
pub const TCP_MSS_DEFAULT: u16 = 1460;

/// Minimum receive/transmit window (one minimum-size segment)
pub const TCP_WIN_MIN: u16 = TCP_MSS_MIN;
/// Maximum unscaled window
pub const TCP_WIN_MAX: u16 = u16::MAX;
/// Default receive/transmit window
pub const TCP_WIN_DEFAULT: u16 = 8192;

/// Minimum idle timeout
pub const TCP_IDLE_TIMEOUT_MIN_MS: u64 = 1_000;
/// Maximum idle timeout
pub const TCP_IDLE_TIMEOUT_MAX_MS: u64 = 7_200_000;
/// Default idle timeout (one hour)
pub const TCP_IDLE_TIMEOUT_DEFAULT_MS: u64 = 3_600_000;

/// Minimum FIN-WAIT-2 timeout
pub const TCP_FIN_WAIT_2_MIN_MS: u64 = 1_000;
/// Maximum FIN-WAIT-2 timeout
pub const TCP_FIN_WAIT_2_MAX_MS: u64 = 600_000;
/// Default FIN-WAIT-2 timeout
pub const TCP_FIN_WAIT_2_DEFAULT_MS: u64 = 60_000;

/// Minimum delayed-ACK timeout
pub const TCP_ACK_DELAY_MIN_MS: u64 = 1;
/// Maximum delayed-ACK timeout (RFC 1122 4.2.3.2)
pub const TCP_ACK_DELAY_MAX_MS: u64 = 500;
/// Default delayed-ACK timeout
pub const TCP_ACK_DELAY_DEFAULT_MS: u64 = 200;

/// Minimum maximum segment lifetime
pub const TCP_MSL_MIN_MS: u64 = 1_000;
/// Maximum maximum segment lifetime
pub const TCP_MSL_MAX_MS: u64 = 120_000;
/// Default maximum segment lifetime; TIME-WAIT lasts twice this
pub const TCP_MSL_DEFAULT_MS: u64 = 60_000;

/// Lowest allowed RTO ceiling
pub const TCP_RTO_MAX_MIN_MS: u64 = 1_000;
/// Highest allowed RTO ceiling
pub const TCP_RTO_MAX_MAX_MS: u64 = 240_000;
/// Default RTO ceiling
pub const TCP_RTO_MAX_DEFAULT_MS: u64 = 64_000;

/// Minimum retransmissions before the connection is aborted
pub const TCP_RETX_TH_MIN: u8 = 1;
/// Maximum retransmissions before the connection is aborted
pub const TCP_RETX_TH_MAX: u8 = 32;
/// Default retransmission threshold
pub const TCP_RETX_TH_DEFAULT: u8 = 12;

/// Minimum listen backlog
pub const TCP_BACKLOG_MIN: usize = 1;
/// Maximum listen backlog
pub const TCP_BACKLOG_MAX: usize = 128;

const_assert!(TCP_CONN_NBR_DEFAULT >= TCP_CONN_NBR_MIN && TCP_CONN_NBR_DEFAULT <= TCP_CONN_NBR_MAX);
const_assert!(TCP_MSS_DEFAULT >= TCP_MSS_MIN && TCP_MSS_DEFAULT <= TCP_MSS_MAX);
const_assert!(TCP_WIN_DEFAULT >= TCP_WIN_MIN);
const_assert!(
    TCP_IDLE_TIMEOUT_DEFAULT_MS >= TCP_IDLE_TIMEOUT_MIN_MS
        && TCP_IDLE_TIMEOUT_DEFAULT_MS <= TCP_IDLE_TIMEOUT_MAX_MS
);
const_assert!(
    TCP_FIN_WAIT_2_DEFAULT_MS >= TCP_FIN_WAIT_2_MIN_MS
        && TCP_FIN_WAIT_2_DEFAULT_MS <= TCP_FIN_WAIT_2_MAX_MS
);
const_assert!(
    TCP_ACK_DELAY_DEFAULT_MS >= TCP_ACK_DELAY_MIN_MS
        && TCP_ACK_DELAY_DEFAULT_MS <= TCP_ACK_DELAY_MAX_MS
);
const_assert!(TCP_MSL_DEFAULT_MS >= TCP_MSL_MIN_MS && TCP_MSL_DEFAULT_MS <= TCP_MSL_MAX_MS);
const_assert!(
    TCP_RTO_MAX_DEFAULT_MS >= TCP_RTO_MAX_MIN_MS && TCP_RTO_MAX_DEFAULT_MS <= TCP_RTO_MAX_MAX_MS
);
const_assert!(TCP_RETX_TH_DEFAULT >= TCP_RETX_TH_MIN && TCP_RETX_TH_DEFAULT <= TCP_RETX_TH_MAX);

/// TCP layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpCfg {
    /// Number of TCP connection records
    pub conn_nbr: usize,
    /// Local maximum segment size advertised in SYNs
    pub mss: u16,
    /// Receive window
    pub rx_win: u16,
    /// Transmit window (bytes the application may queue)
    pub tx_win: u16,
    /// Connection idle timeout
    pub idle_timeout_ms: u64,
    /// FIN-WAIT-2 timeout
    pub fin_wait2_timeout_ms: u64,
    /// Delayed-ACK timeout
    pub ack_delay_ms: u64,
    /// Maximum segment lifetime
    pub msl_ms: u64,
    /// Upper bound on the retransmission timeout
    pub rto_max_ms: u64,
    /// Retransmissions tolerated before abort
    pub retx_th: u8,
}

impl Default for TcpCfg {
    fn default() -> Self {
        Self {
            conn_nbr: TCP_CONN_NBR_DEFAULT,
            mss: TCP_MSS_DEFAULT,
            rx_win: TCP_WIN_DEFAULT,
            tx_win: TCP_WIN_DEFAULT,
            idle_timeout_ms: TCP_IDLE_TIMEOUT_DEFAULT_MS,
            fin_wait2_timeout_ms: TCP_FIN_WAIT_2_DEFAULT_MS,
            ack_delay_ms: TCP_ACK_DELAY_DEFAULT_MS,
            msl_ms: TCP_MSL_DEFAULT_MS,
            rto_max_ms: TCP_RTO_MAX_DEFAULT_MS,
            retx_th: TCP_RETX_TH_DEFAULT,
        }
    }
}

fn check<T: PartialOrd>(value: T, min: T, max: T) -> NetResult<()> {
    if value < min || value > max {
        return Err(NetError::InvalidArg);
    }
    Ok(())
}

impl TcpCfg {
    pub fn validate(&self) -> NetResult<()> {
        check(self.conn_nbr, TCP_CONN_NBR_MIN, TCP_CONN_NBR_MAX)?;
        check(self.mss, TCP_MSS_MIN, TCP_MSS_MAX)?;
        check(self.rx_win, TCP_WIN_MIN, TCP_WIN_MAX)?;
        check(self.tx_win, TCP_WIN_MIN, TCP_WIN_MAX)?;
        check(
            self.idle_timeout_ms,
            TCP_IDLE_TIMEOUT_MIN_MS,
            TCP_IDLE_TIMEOUT_MAX_MS,
        )?;
        check(
            self.fin_wait2_timeout_ms,
            TCP_FIN_WAIT_2_MIN_MS,
            TCP_FIN_WAIT_2_MAX_MS,
        )?;
        check(self.ack_delay_ms, TCP_ACK_DELAY_MIN_MS, TCP_ACK_DELAY_MAX_MS)?;
        check(self.msl_ms, TCP_MSL_MIN_MS, TCP_MSL_MAX_MS)?;
        check(self.rto_max_ms, TCP_RTO_MAX_MIN_MS, TCP_RTO_MAX_MAX_MS)?;
        check(self.retx_th, TCP_RETX_TH_MIN, TCP_RETX_TH_MAX)
    }

    /// Effective RTO ceiling: never longer than two segment lifetimes.
    pub fn rto_ceiling_ms(&self) -> u64 {
        core::cmp::min(self.rto_max_ms, 2 * self.msl_ms)
    }

    /// TIME-WAIT duration (2×MSL).
    pub fn time_wait_ms(&self) -> u64 {
        2 * self.msl_ms
    }
}

// ============================================================================
// Stack
// ============================================================================

/// Complete configuration handed to [`crate::stack::NetStack::new`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetCfg {
    pub conn: ConnCfg,
    pub tcp: TcpCfg,
}

impl NetCfg {
    pub fn validate(&self) -> NetResult<()> {
        self.conn.validate()?;
        self.tcp.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert_eq!(NetCfg::default().validate(), Ok(()));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut cfg = NetCfg::default();
        cfg.conn.accessed_th = 9;
        assert_eq!(cfg.validate(), Err(NetError::InvalidArg));

        let mut cfg = NetCfg::default();
        cfg.tcp.ack_delay_ms = 501;
        assert_eq!(cfg.validate(), Err(NetError::InvalidArg));

        let mut cfg = NetCfg::default();
        cfg.tcp.rx_win = 100;
        assert_eq!(cfg.validate(), Err(NetError::InvalidArg));

        let mut cfg = NetCfg::default();
        cfg.conn.conn_nbr = 0;
        assert_eq!(cfg.validate(), Err(NetError::InvalidArg));
    }

    #[test]
    fn test_accessed_th_bounds() {
        assert!(validate_accessed_th(10).is_ok());
        assert!(validate_accessed_th(65000).is_ok());
        assert_eq!(validate_accessed_th(65001), Err(NetError::InvalidArg));
    }

    #[test]
    fn test_rto_ceiling() {
        let mut cfg = TcpCfg::default();
        assert_eq!(cfg.rto_ceiling_ms(), 64_000);
        cfg.msl_ms = 10_000;
        assert_eq!(cfg.rto_ceiling_ms(), 20_000);
        assert_eq!(cfg.time_wait_ms(), 20_000);
    }
}
