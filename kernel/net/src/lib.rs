//! Zero-OS Network Connection Core
//!
//! Connection management for the Zero-OS TCP/IP stack:
//! - A fixed pool of connection records shared by the socket and transport
//!   layers, with a symmetric close protocol between them
//! - Per-protocol connection lists indexed by local port, searched for the
//!   best full, wildcard or half match with self-organising promotion
//! - The RFC 793 TCP state machine with retransmission, congestion control,
//!   delayed acknowledgments, zero-window probing and silly-window avoidance
//!
//! # Design
//!
//! All mutable state lives in a [`NetCore`] behind the single lock of a
//! [`NetStack`].  The IP layer feeds segments in through
//! [`NetStack::rx_segment`] and receives them through [`IpTx`]; a periodic
//! task drives [`NetStack::handle_timer_tick`]; the socket layer calls the
//! application entry points and is told about asynchronous closes through
//! [`SockHooks`].
//!
//! # Example
//!
//! ```ignore
//! let stack = netconn::init(&NetCfg::default(), ip_tx, sock_hooks)?;
//!
//! let l = stack.conn_open(ConnFamily::Ipv4Sock, app)?;
//! stack.bind(l, ConnAddr::from_v4(Ipv4Addr([10, 0, 0, 1]), 80))?;
//! stack.listen(l, 16)?;
//! let child = stack.accept(l, app, None)?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate klog;

pub mod addr;
pub mod config;
pub mod conn;
pub mod error;
pub mod ipv4;
pub mod ipv6;
pub mod kal;
mod lifecycle;
pub mod pool;
pub mod stack;
pub mod tcp;

pub use addr::{ConnAddr, ConnFamily, ConnProtoIx, IpAddr};
pub use config::{ConnCfg, NetCfg, TcpCfg};
pub use conn::{AppId, Conn, ConnId, ConnMatch, ConnStatsSnapshot, ConnTable, ListCursor, SrchResult};
pub use error::{NetError, NetResult};
pub use ipv4::{Ipv4Addr, Ipv4TxParams};
pub use ipv6::{Ipv6Addr, Ipv6TxParams};
pub use kal::{register_kal_hooks, KalHooks, WaitOutcome, WaitQueue};
pub use pool::PoolStatsSnapshot;
pub use stack::{
    init, net_stack, IpTx, IpTxParams, NetCore, NetStack, NoSockHooks, SockHooks, TxSegment,
};
pub use tcp::{TcpConnId, TcpError, TcpLayer, TcpResult, TcpState, TcpStatsSnapshot};
