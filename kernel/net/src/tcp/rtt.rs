//! Round-trip time estimation and retransmission timeout (RFC 6298).
//!
//! SRTT and RTTVAR are kept in milliseconds scaled by 8 so the 1/8 and 1/4
//! gains stay exact in integer arithmetic:
//!
//! - first sample R:  SRTT = R, RTTVAR = R/2
//! - later samples:   RTTVAR += (|SRTT - R| - RTTVAR) / 4
//!                    SRTT   += (R - SRTT) / 8
//! - RTO = SRTT + max(G, 4 × RTTVAR), clamped to [floor, ceiling]

/// Retransmission timeout before any RTT sample (RFC 1122)
pub const TCP_RTO_INIT_MS: u64 = 3_000;

/// Lower bound on the computed RTO
pub const TCP_RTO_MIN_MS: u64 = 100;

/// Clock granularity G
pub const TCP_RTO_CLOCK_GRANULARITY_MS: u64 = 100;

/// Multiplier K for the variance term
const RTT_K: u64 = 4;

/// Samples beyond ten minutes are discarded.
const RTT_SAMPLE_MAX_MS: u64 = 600_000;

/// Per-connection RTT estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttEstimator {
    /// Smoothed RTT × 8 (0 until the first sample)
    srtt_x8: u64,
    /// RTT variance × 8
    rttvar_x8: u64,
    /// RTO before backoff
    rto_base_ms: u64,
    /// Current RTO including backoff
    rto_ms: u64,
    /// Retransmissions since the last valid sample
    backoff: u8,
    /// Upper bound: min(configured max, 2 × MSL)
    ceiling_ms: u64,
}

impl RttEstimator {
    pub fn new(ceiling_ms: u64) -> Self {
        let rto = TCP_RTO_INIT_MS.clamp(TCP_RTO_MIN_MS, ceiling_ms.max(TCP_RTO_MIN_MS));
        RttEstimator {
            srtt_x8: 0,
            rttvar_x8: 0,
            rto_base_ms: rto,
            rto_ms: rto,
            backoff: 0,
            ceiling_ms: ceiling_ms.max(TCP_RTO_MIN_MS),
        }
    }

    #[inline]
    pub fn rto_ms(&self) -> u64 {
        self.rto_ms
    }

    /// Smoothed RTT in ms, `None` before the first sample
    pub fn srtt_ms(&self) -> Option<u64> {
        (self.srtt_x8 != 0).then_some(self.srtt_x8 / 8)
    }

    pub fn rttvar_ms(&self) -> u64 {
        self.rttvar_x8 / 8
    }

    #[inline]
    pub fn backoff(&self) -> u8 {
        self.backoff
    }

    /// Feed one RTT sample (never from a retransmitted segment).
    pub fn sample(&mut self, rtt_ms: u64) {
        if rtt_ms > RTT_SAMPLE_MAX_MS {
            return;
        }
        // A sub-tick sample still counts; treat it as one ms.
        let r_x8 = rtt_ms.max(1) * 8;

        if self.srtt_x8 == 0 {
            self.srtt_x8 = r_x8;
            self.rttvar_x8 = r_x8 / 2;
        } else {
            let err = self.srtt_x8.abs_diff(r_x8);
            self.rttvar_x8 = (self.rttvar_x8 * 3 + err) / 4;
            self.srtt_x8 = (self.srtt_x8 * 7 + r_x8) / 8;
        }

        let var_term = core::cmp::max(TCP_RTO_CLOCK_GRANULARITY_MS * 8, RTT_K * self.rttvar_x8);
        let rto = (self.srtt_x8 + var_term) / 8;
        self.rto_base_ms = rto.clamp(TCP_RTO_MIN_MS, self.ceiling_ms);
        self.rto_ms = self.rto_base_ms;
        self.backoff = 0;
    }

    /// Double the RTO after a retransmission timeout.
    pub fn back_off(&mut self) {
        self.backoff = self.backoff.saturating_add(1);
        self.rto_ms = self.rto_ms.saturating_mul(2).min(self.ceiling_ms);
    }

    /// Restore the un-backed-off RTO once new data is acknowledged.
    pub fn reset_backoff(&mut self) {
        self.backoff = 0;
        self.rto_ms = self.rto_base_ms;
    }
}
