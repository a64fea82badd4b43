//! Per-connection TCP timers.
//!
//! Timers are plain deadlines on the stack's millisecond clock.  The timer
//! task calls `NetStack::handle_timer_tick`, which asks each connection for
//! its expired timers and runs the matching handlers under the stack lock.

use alloc::vec::Vec;

use super::{bump, TcpConnId, TcpState};
use crate::error::NetError;
use crate::stack::NetCore;

/// Silly-window override: hold back a small segment at most this long
/// (RFC 1122 4.2.3.4 suggests 0.1 to 1 s)
pub const TCP_SWS_OVERRIDE_MS: u64 = 500;

/// Every timer a connection can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpTimerKind {
    /// Retransmission timeout
    Retx,
    /// Delayed acknowledgment
    AckDelay,
    /// Zero-window probe (persist)
    Persist,
    /// Silly-window-avoidance override
    SillyWin,
    /// Connection idle timeout
    Idle,
    /// FIN-WAIT-2 timeout
    FinWait2,
    /// TIME-WAIT (2×MSL)
    TimeWait,
}

impl TcpTimerKind {
    /// Evaluation order within one tick; terminal timers run last.
    pub const ALL: [TcpTimerKind; 7] = [
        TcpTimerKind::AckDelay,
        TcpTimerKind::Retx,
        TcpTimerKind::Persist,
        TcpTimerKind::SillyWin,
        TcpTimerKind::Idle,
        TcpTimerKind::FinWait2,
        TcpTimerKind::TimeWait,
    ];
}

/// A one-shot deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpTimer {
    deadline: Option<u64>,
}

impl TcpTimer {
    pub fn start(&mut self, now_ms: u64, duration_ms: u64) {
        self.deadline = Some(now_ms.saturating_add(duration_ms));
    }

    /// Start only if not already running.
    pub fn start_if_stopped(&mut self, now_ms: u64, duration_ms: u64) {
        if self.deadline.is_none() {
            self.start(now_ms, duration_ms);
        }
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    #[inline]
    pub fn expired(&self, now_ms: u64) -> bool {
        matches!(self.deadline, Some(d) if d <= now_ms)
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }
}

/// The full timer set of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpTimers {
    pub retx: TcpTimer,
    pub ack_delay: TcpTimer,
    pub persist: TcpTimer,
    pub silly_win: TcpTimer,
    pub idle: TcpTimer,
    pub fin_wait2: TcpTimer,
    pub time_wait: TcpTimer,
}

impl TcpTimers {
    pub fn get(&self, kind: TcpTimerKind) -> &TcpTimer {
        match kind {
            TcpTimerKind::Retx => &self.retx,
            TcpTimerKind::AckDelay => &self.ack_delay,
            TcpTimerKind::Persist => &self.persist,
            TcpTimerKind::SillyWin => &self.silly_win,
            TcpTimerKind::Idle => &self.idle,
            TcpTimerKind::FinWait2 => &self.fin_wait2,
            TcpTimerKind::TimeWait => &self.time_wait,
        }
    }

    pub fn get_mut(&mut self, kind: TcpTimerKind) -> &mut TcpTimer {
        match kind {
            TcpTimerKind::Retx => &mut self.retx,
            TcpTimerKind::AckDelay => &mut self.ack_delay,
            TcpTimerKind::Persist => &mut self.persist,
            TcpTimerKind::SillyWin => &mut self.silly_win,
            TcpTimerKind::Idle => &mut self.idle,
            TcpTimerKind::FinWait2 => &mut self.fin_wait2,
            TcpTimerKind::TimeWait => &mut self.time_wait,
        }
    }

    pub fn stop_all(&mut self) {
        *self = TcpTimers::default();
    }

    /// Timers due at `now_ms`, in evaluation order.
    pub fn expired(&self, now_ms: u64) -> Vec<TcpTimerKind> {
        TcpTimerKind::ALL
            .iter()
            .copied()
            .filter(|&k| self.get(k).expired(now_ms))
            .collect()
    }
}

// ============================================================================
// Handlers
// ============================================================================

impl NetCore {
    /// Advance the clock to `now_ms` and run every due timer.  Returns the
    /// number of timers that fired.
    pub fn handle_timer_tick(&mut self, now_ms: u64) -> usize {
        self.set_now_ms(now_ms);
        let now = self.now_ms;
        let mut fired = 0;

        for tid in self.tcp.used_ids() {
            for kind in TcpTimerKind::ALL {
                // An earlier handler may have closed the record or stopped
                // this timer.
                if !self.tcp.is_used(tid) {
                    break;
                }
                let timer = self.tcp.rec_mut(tid).timers.get_mut(kind);
                if !timer.expired(now) {
                    continue;
                }
                timer.stop();
                fired += 1;
                klog!(Trace, "{} {:?} timer expired", tid, kind);
                self.tcp_timer_expired(tid, kind);
            }
        }
        fired
    }

    fn tcp_timer_expired(&mut self, tid: TcpConnId, kind: TcpTimerKind) {
        let state = self.tcp.rec(tid).state;
        match kind {
            TcpTimerKind::AckDelay => {
                if state.is_synchronized() {
                    self.tcp_send_ack(tid);
                }
            }
            TcpTimerKind::Retx => self.tcp_retx_expired(tid),
            TcpTimerKind::Persist => self.tcp_persist_expired(tid),
            TcpTimerKind::SillyWin => {
                self.tcp.rec_mut(tid).sws_override = true;
                self.tcp_output(tid);
                self.tcp.rec_mut(tid).sws_override = false;
            }
            TcpTimerKind::Idle => {
                klog!(Info, "{} idle timeout", tid);
                bump(&self.tcp.stats().conn_timeouts);
                self.tcp_abort_transport(tid, NetError::Timeout);
            }
            TcpTimerKind::FinWait2 => {
                if state == TcpState::FinWait2 {
                    klog!(Debug, "{} FIN-WAIT-2 timeout", tid);
                    self.tcp_close_conn(tid, None);
                }
            }
            TcpTimerKind::TimeWait => self.tcp_close_conn(tid, None),
        }
    }

    /// Retransmission timeout: back off and resend the oldest segment, or
    /// give up once the threshold is exceeded.
    fn tcp_retx_expired(&mut self, tid: TcpConnId) {
        let now = self.now_ms;
        let retx_th = self.tcp.cfg().retx_th;
        let tcb = self.tcp.rec_mut(tid);
        if tcb.retx_q.is_empty() {
            return;
        }

        tcb.retx_cnt = tcb.retx_cnt.saturating_add(1);
        if tcb.retx_cnt > retx_th {
            klog!(Info, "{} retransmission limit reached in {:?}", tid, tcb.state);
            bump(&self.tcp.stats().conn_timeouts);
            self.tcp_abort_transport(tid, NetError::Timeout);
            return;
        }

        if tcb.state.is_synchronized() {
            let flight = tcb.flight();
            tcb.cc.on_rto(flight);
        }
        tcb.rtt.back_off();
        tcb.tx_seq_recover = Some(tcb.tx_seq_last);
        let rto = tcb.rtt.rto_ms();
        tcb.timers.retx.start(now, rto);
        klog!(Debug, "{} RTO, retry {} (next in {} ms)", tid, tcb.retx_cnt, rto);
        self.tcp_retransmit_first(tid);
    }

    /// Zero-window probe, backing off like the retransmission timer.
    fn tcp_persist_expired(&mut self, tid: TcpConnId) {
        let now = self.now_ms;
        let ceiling = self.tcp.cfg().rto_ceiling_ms();
        let tcb = self.tcp.rec(tid);
        if tcb.tx_win_remote > 0 {
            self.tcp.rec_mut(tid).persist_backoff = 0;
            self.tcp_output(tid);
            return;
        }
        if tcb.tx_q.is_empty() && tcb.retx_q.is_empty() {
            return;
        }

        self.tcp_send_probe(tid);
        let tcb = self.tcp.rec_mut(tid);
        tcb.persist_backoff = tcb.persist_backoff.saturating_add(1);
        let interval = tcb
            .rtt
            .rto_ms()
            .saturating_mul(1 << tcb.persist_backoff.min(16))
            .min(ceiling);
        tcb.timers.persist.start(now, interval);
    }
}
