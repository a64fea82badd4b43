//! Congestion control (RFC 5681): slow start, congestion avoidance,
//! fast retransmit and fast recovery.

/// Initial slow-start threshold (largest unscaled window)
pub const TCP_INITIAL_SSTHRESH: u32 = 65_535;

/// Duplicate ACKs that trigger fast retransmit
pub const TCP_DUP_ACK_TH: u8 = 3;

/// Initial congestion window: two full segments.
#[inline]
pub fn initial_cwnd(mss: u16) -> u32 {
    2 * mss as u32
}

/// What the caller must do after feeding an ACK to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionAction {
    /// Nothing beyond normal output
    None,
    /// Retransmit the first unacknowledged segment now
    FastRetransmit,
}

/// Per-connection congestion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionCtl {
    mss: u32,
    cwnd_init: u32,
    cwnd: u32,
    /// Bytes acknowledged since the last congestion-avoidance increase
    cwnd_calc: u32,
    ssthresh: u32,
    dup_ack_ctr: u8,
    fast_recovery: bool,
}

impl CongestionCtl {
    pub fn new(mss: u16) -> Self {
        CongestionCtl {
            mss: mss as u32,
            cwnd_init: initial_cwnd(mss),
            cwnd: initial_cwnd(mss),
            cwnd_calc: 0,
            ssthresh: TCP_INITIAL_SSTHRESH,
            dup_ack_ctr: 0,
            fast_recovery: false,
        }
    }

    /// Adopt the MSS negotiated during the handshake.
    pub fn set_mss(&mut self, mss: u16) {
        self.mss = mss as u32;
        self.cwnd_init = initial_cwnd(mss);
        self.cwnd = self.cwnd_init;
    }

    #[inline]
    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    #[inline]
    pub fn cwnd_init(&self) -> u32 {
        self.cwnd_init
    }

    #[inline]
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    #[inline]
    pub fn dup_ack_ctr(&self) -> u8 {
        self.dup_ack_ctr
    }

    #[inline]
    pub fn in_fast_recovery(&self) -> bool {
        self.fast_recovery
    }

    #[inline]
    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    /// `acked` new bytes were acknowledged.
    pub fn on_ack(&mut self, acked: u32) {
        self.dup_ack_ctr = 0;

        if self.fast_recovery {
            self.fast_recovery = false;
            self.cwnd = self.ssthresh;
            self.cwnd_calc = 0;
            return;
        }

        if self.in_slow_start() {
            self.cwnd = self.cwnd.saturating_add(core::cmp::min(acked, self.mss));
        } else {
            // One MSS per cwnd worth of acknowledged data, i.e. per RTT.
            self.cwnd_calc = self.cwnd_calc.saturating_add(acked);
            if self.cwnd_calc >= self.cwnd {
                self.cwnd_calc -= self.cwnd;
                self.cwnd = self.cwnd.saturating_add(self.mss);
            }
        }
    }

    /// A duplicate ACK arrived while `flight` bytes were outstanding.
    pub fn on_dup_ack(&mut self, flight: u32) -> CongestionAction {
        self.dup_ack_ctr = self.dup_ack_ctr.saturating_add(1);

        if self.fast_recovery {
            self.cwnd = self.cwnd.saturating_add(self.mss);
            return CongestionAction::None;
        }

        if self.dup_ack_ctr == TCP_DUP_ACK_TH {
            self.ssthresh = core::cmp::max(flight / 2, 2 * self.mss);
            self.cwnd = self.ssthresh + 3 * self.mss;
            self.cwnd_calc = 0;
            self.fast_recovery = true;
            return CongestionAction::FastRetransmit;
        }

        CongestionAction::None
    }

    /// Retransmission timer expired with `flight` bytes outstanding.
    pub fn on_rto(&mut self, flight: u32) {
        self.ssthresh = core::cmp::max(flight / 2, 2 * self.mss);
        self.cwnd = self.mss;
        self.cwnd_calc = 0;
        self.dup_ack_ctr = 0;
        self.fast_recovery = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u16 = 1000;

    #[test]
    fn test_initial_window() {
        let cc = CongestionCtl::new(MSS);
        assert_eq!(cc.cwnd(), 2000);
        assert_eq!(cc.cwnd_init(), 2000);
        assert!(cc.in_slow_start());
    }

    #[test]
    fn test_slow_start_growth_capped_per_ack() {
        let mut cc = CongestionCtl::new(MSS);
        cc.on_ack(500);
        assert_eq!(cc.cwnd(), 2500);
        cc.on_ack(3000);
        assert_eq!(cc.cwnd(), 3500);
    }

    #[test]
    fn test_congestion_avoidance_one_mss_per_window() {
        let mut cc = CongestionCtl::new(MSS);
        cc.on_rto(8000);
        // ssthresh 4000, cwnd 1000: grow to ssthresh first
        for _ in 0..3 {
            cc.on_ack(1000);
        }
        assert_eq!(cc.cwnd(), 4000);
        assert!(!cc.in_slow_start());

        for _ in 0..3 {
            cc.on_ack(1000);
        }
        assert_eq!(cc.cwnd(), 4000);
        cc.on_ack(1000);
        assert_eq!(cc.cwnd(), 5000);
    }

    #[test]
    fn test_fast_retransmit_arithmetic() {
        let mut cc = CongestionCtl::new(MSS);
        let flight = 10_000;
        assert_eq!(cc.on_dup_ack(flight), CongestionAction::None);
        assert_eq!(cc.on_dup_ack(flight), CongestionAction::None);
        assert_eq!(cc.on_dup_ack(flight), CongestionAction::FastRetransmit);
        assert_eq!(cc.ssthresh(), 5000);
        assert_eq!(cc.cwnd(), 8000);
        assert!(cc.in_fast_recovery());

        assert_eq!(cc.on_dup_ack(flight), CongestionAction::None);
        assert_eq!(cc.cwnd(), 9000);

        cc.on_ack(1000);
        assert!(!cc.in_fast_recovery());
        assert_eq!(cc.cwnd(), 5000);
        assert_eq!(cc.dup_ack_ctr(), 0);
    }

    #[test]
    fn test_small_flight_uses_two_mss_floor() {
        let mut cc = CongestionCtl::new(MSS);
        for _ in 0..3 {
            cc.on_dup_ack(1500);
        }
        assert_eq!(cc.ssthresh(), 2000);
        assert_eq!(cc.cwnd(), 5000);
    }

    #[test]
    fn test_rto_collapses_window() {
        let mut cc = CongestionCtl::new(MSS);
        cc.on_ack(1000);
        cc.on_rto(3000);
        assert_eq!(cc.cwnd(), 1000);
        assert_eq!(cc.ssthresh(), 2000);
    }
}
