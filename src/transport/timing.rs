//! Monotonic timestamps, RTT estimation, and the timestamp-echo scheme.
//!
//! Every packet carries a 16-bit millisecond timestamp and an echo of the
//! peer's most recent timestamp, corrected for local hold time. The echo
//! yields one RTT sample per round trip without any per-packet send-time
//! bookkeeping.

use std::sync::OnceLock;
use std::time::Instant;

use crate::core::constants::{
    CONGESTION_TIMESTAMP_PENALTY_MS, MAX_RTO_MS, MIN_RTO_MS, RTTVAR_BETA, RTT_SAMPLE_CEILING_MS,
    SRTT_ALPHA, TIMESTAMP_NONE, TIMESTAMP_REPLY_HOLD_MS,
};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Clock base. Zero-initialized "last seen" state must read as ancient,
/// so the clock cannot start near zero.
const STARTUP_OFFSET_MS: u64 = 1 << 32;

/// Milliseconds on the process-wide monotonic clock.
pub fn timestamp() -> u64 {
    STARTUP_OFFSET_MS + EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// The monotonic clock truncated to 16 bits, avoiding the sentinel.
pub fn timestamp16() -> u16 {
    let ts = timestamp() as u16;
    if ts == TIMESTAMP_NONE {
        ts.wrapping_add(1)
    } else {
        ts
    }
}

/// Difference between two 16-bit timestamps, `(tsnew - tsold) mod 65536`.
pub fn timestamp_diff(tsnew: u16, tsold: u16) -> u16 {
    tsnew.wrapping_sub(tsold)
}

/// RTT estimator in the RFC 6298 family.
///
/// Starts from a pessimistic prior (SRTT 1000 ms, RTTVAR 500 ms) until the
/// first sample arrives; samples at or above the ceiling are discarded,
/// since they usually mean the peer was suspended rather than slow.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: f64,
    rttvar: f64,
    rtt_hit: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Create an estimator with the pessimistic prior.
    pub fn new() -> Self {
        Self {
            srtt: 1000.0,
            rttvar: 500.0,
            rtt_hit: false,
        }
    }

    /// Fold in one RTT sample in milliseconds.
    pub fn observe(&mut self, sample_ms: f64) {
        if sample_ms >= RTT_SAMPLE_CEILING_MS {
            return;
        }

        if !self.rtt_hit {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
            self.rtt_hit = true;
        } else {
            self.rttvar = (1.0 - RTTVAR_BETA) * self.rttvar + RTTVAR_BETA * (self.srtt - sample_ms).abs();
            self.srtt = (1.0 - SRTT_ALPHA) * self.srtt + SRTT_ALPHA * sample_ms;
        }
    }

    /// Current smoothed RTT in milliseconds.
    pub fn srtt(&self) -> f64 {
        self.srtt
    }

    /// Current retransmission timeout: `ceil(srtt + 4 * rttvar)` clamped
    /// to [MIN_RTO, MAX_RTO].
    pub fn rto(&self) -> u64 {
        ((self.srtt + 4.0 * self.rttvar).ceil() as u64).clamp(MIN_RTO_MS, MAX_RTO_MS)
    }
}

/// The peer timestamp held for echoing, shared by both transports.
#[derive(Debug, Clone)]
pub(crate) struct SavedTimestamp {
    ts: u16,
    received_at: u64,
}

impl SavedTimestamp {
    pub fn new() -> Self {
        Self {
            ts: TIMESTAMP_NONE,
            received_at: 0,
        }
    }

    /// Remember the peer's timestamp and when it arrived.
    pub fn record(&mut self, ts: u16) {
        self.ts = ts;
        self.received_at = timestamp();
    }

    /// Skew the held timestamp backwards so the peer reads an inflated
    /// RTT and slows its frame rate.
    pub fn penalize(&mut self) {
        self.ts = self.ts.wrapping_sub(CONGESTION_TIMESTAMP_PENALTY_MS);
    }

    /// The echo for the next outgoing packet: the held timestamp advanced
    /// by how long we held it, or the sentinel if it has gone stale.
    pub fn take_reply(&mut self) -> u16 {
        let now = timestamp();
        if self.received_at != 0 && now - self.received_at < TIMESTAMP_REPLY_HOLD_MS {
            let reply = self.ts.wrapping_add((now - self.received_at) as u16);
            self.ts = TIMESTAMP_NONE;
            self.received_at = 0;
            reply
        } else {
            TIMESTAMP_NONE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimator_prior() {
        let est = RttEstimator::new();
        assert_eq!(est.srtt(), 1000.0);
        // ceil(1000 + 4 * 500) clamps to MAX_RTO
        assert_eq!(est.rto(), MAX_RTO_MS);
    }

    #[test]
    fn test_first_sample() {
        let mut est = RttEstimator::new();
        est.observe(100.0);
        assert_eq!(est.srtt(), 100.0);
        assert_eq!(est.rttvar, 50.0);
        // ceil(100 + 4 * 50) = 300
        assert_eq!(est.rto(), 300);
    }

    #[test]
    fn test_subsequent_samples_smooth() {
        let mut est = RttEstimator::new();
        est.observe(100.0);
        est.observe(120.0);

        // rttvar = 0.75 * 50 + 0.25 * 20, srtt = 0.875 * 100 + 0.125 * 120
        assert!((est.rttvar - 42.5).abs() < 1e-9);
        assert!((est.srtt() - 102.5).abs() < 1e-9);
    }

    #[test]
    fn test_huge_sample_discarded() {
        let mut est = RttEstimator::new();
        est.observe(100.0);
        let before = est.srtt();
        est.observe(5000.0);
        est.observe(60_000.0);
        assert_eq!(est.srtt(), before);
    }

    #[test]
    fn test_rto_clamps_low() {
        let mut est = RttEstimator::new();
        est.observe(1.0);
        for _ in 0..100 {
            est.observe(1.0);
        }
        assert_eq!(est.rto(), MIN_RTO_MS);
    }

    #[test]
    fn test_rto_formula_midrange() {
        let mut est = RttEstimator::new();
        est.observe(80.0);
        let expected = ((est.srtt + 4.0 * est.rttvar).ceil() as u64).clamp(MIN_RTO_MS, MAX_RTO_MS);
        assert_eq!(est.rto(), expected);
    }

    #[test]
    fn test_timestamp_diff_wraps() {
        assert_eq!(timestamp_diff(5, 0xFFFB), 10);
        assert_eq!(timestamp_diff(100, 40), 60);
    }

    #[test]
    fn test_timestamp_diff_antisymmetry() {
        for (a, b) in [(0u16, 0u16), (1, 0xFFFF), (12345, 54321), (7, 7)] {
            let sum = timestamp_diff(a, b).wrapping_add(timestamp_diff(b, a));
            assert!(sum == 0);
        }
    }

    #[test]
    fn test_timestamp16_avoids_sentinel() {
        // Cannot force the clock, but the transform itself is checkable.
        let ts = timestamp16();
        assert_ne!(ts, TIMESTAMP_NONE);
    }

    #[test]
    fn test_saved_timestamp_echo() {
        let mut saved = SavedTimestamp::new();
        assert_eq!(saved.take_reply(), TIMESTAMP_NONE);

        saved.record(1000);
        let reply = saved.take_reply();
        assert_ne!(reply, TIMESTAMP_NONE);
        // Advanced by at most the hold window.
        assert!(timestamp_diff(reply, 1000) < TIMESTAMP_REPLY_HOLD_MS as u16);

        // Taking the reply clears the saved state.
        assert_eq!(saved.take_reply(), TIMESTAMP_NONE);
    }

    #[test]
    fn test_saved_timestamp_penalty() {
        let mut saved = SavedTimestamp::new();
        saved.record(1000);
        saved.penalize();
        let reply = saved.take_reply();
        // Reply sits roughly one penalty behind the recorded timestamp.
        let lag = timestamp_diff(1000, reply);
        assert!(lag <= CONGESTION_TIMESTAMP_PENALTY_MS);
        assert!(lag > CONGESTION_TIMESTAMP_PENALTY_MS - 100);
    }
}
