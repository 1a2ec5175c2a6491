//! RTT estimation and retransmission timeout.
//!
//! Implements the RFC 2988 estimator: `RTO = SRTT + 4 * RTTVAR`, clamped to
//! `[MIN_RTO, MAX_RTO]`, with exponential backoff on expiry.

use std::time::Duration;

use crate::core::{INITIAL_RTO, MAX_BACKOFFS, MAX_RTO, MIN_RTO};

/// Alpha for SRTT smoothing (1/8).
const SRTT_ALPHA: f64 = 0.125;

/// Beta for RTTVAR smoothing (1/4).
const RTTVAR_BETA: f64 = 0.25;

/// K multiplier for the RTO calculation.
const RTO_K: f64 = 4.0;

/// RTT estimator.
///
/// Only segments transmitted exactly once may be sampled (Karn's algorithm);
/// enforcing that is the caller's job.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT in milliseconds.
    srtt: f64,
    /// RTT variance in milliseconds.
    rttvar: f64,
    /// Current retransmission timeout.
    rto: Duration,
    /// Whether SRTT/RTTVAR hold a trustworthy sample.
    initialized: bool,
    /// Consecutive backoffs since the last valid acknowledgment.
    backoffs: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Create a new RTT estimator with initial values.
    pub fn new() -> Self {
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: INITIAL_RTO,
            initialized: false,
            backoffs: 0,
        }
    }

    /// Update the estimate with a new sample.
    ///
    /// - First measurement: SRTT = sample, RTTVAR = sample / 2
    /// - Subsequent: RTTVAR = 0.75 * RTTVAR + 0.25 * |SRTT - sample|,
    ///   then SRTT = 0.875 * SRTT + 0.125 * sample
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;

        if !self.initialized {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
            self.initialized = true;
        } else {
            self.rttvar =
                (1.0 - RTTVAR_BETA) * self.rttvar + RTTVAR_BETA * (self.srtt - sample_ms).abs();
            self.srtt = (1.0 - SRTT_ALPHA) * self.srtt + SRTT_ALPHA * sample_ms;
        }

        self.rto = self.computed_rto();
    }

    fn computed_rto(&self) -> Duration {
        let rto_ms = (self.srtt + RTO_K * self.rttvar)
            .clamp(MIN_RTO.as_millis() as f64, MAX_RTO.as_millis() as f64);
        Duration::from_secs_f64(rto_ms / 1000.0)
    }

    /// Get the current smoothed RTT.
    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt / 1000.0)
    }

    /// Get the current RTT variance.
    pub fn rttvar(&self) -> Duration {
        Duration::from_secs_f64(self.rttvar / 1000.0)
    }

    /// Get the current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Check if the estimator holds a valid sample.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Consecutive backoffs since the last valid acknowledgment.
    pub fn backoffs(&self) -> u32 {
        self.backoffs
    }

    /// Apply exponential backoff after a retransmission timer expired.
    ///
    /// After [`MAX_BACKOFFS`] consecutive backoffs the smoothed estimates are
    /// discarded; the next sample starts over. Returns the new RTO.
    pub fn backoff(&mut self) -> Duration {
        self.rto = self.rto.saturating_mul(2).min(MAX_RTO);
        self.backoffs += 1;
        if self.backoffs >= MAX_BACKOFFS && self.initialized {
            tracing::debug!(backoffs = self.backoffs, "discarding stale RTT estimate");
            self.initialized = false;
            self.srtt = 0.0;
            self.rttvar = 0.0;
        }
        self.rto
    }

    /// A valid acknowledgment arrived; stop counting consecutive backoffs.
    ///
    /// The backed-off RTO itself is kept until the next RTT sample.
    pub fn reset_backoff(&mut self) {
        self.backoffs = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_estimator_initial() {
        let estimator = RttEstimator::new();
        assert!(!estimator.is_initialized());
        assert_eq!(estimator.rto(), INITIAL_RTO);
    }

    #[test]
    fn test_rtt_estimator_first_sample() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));

        assert!(estimator.is_initialized());
        assert!((estimator.srtt - 100.0).abs() < 0.01);
        assert!((estimator.rttvar - 50.0).abs() < 0.01);
        // 100 + 4 * 50
        assert_eq!(estimator.rto(), Duration::from_millis(300));
    }

    #[test]
    fn test_rtt_estimator_second_sample() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));
        estimator.update(Duration::from_millis(200));

        // RTTVAR = 0.75 * 50 + 0.25 * 100 = 62.5
        assert!((estimator.rttvar - 62.5).abs() < 0.01);
        // SRTT = 0.875 * 100 + 0.125 * 200 = 112.5
        assert!((estimator.srtt - 112.5).abs() < 0.01);
        // RTO = 112.5 + 250
        assert_eq!(estimator.rto().as_micros(), 362_500);
    }

    #[test]
    fn test_rtt_estimator_min_rto() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_micros(100));
        assert_eq!(estimator.rto(), MIN_RTO);
    }

    #[test]
    fn test_rtt_estimator_max_rto() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_secs(100));
        assert_eq!(estimator.rto(), MAX_RTO);
    }

    #[test]
    fn test_backoff_monotonic_to_cap() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));

        let mut previous = estimator.rto();
        for _ in 0..20 {
            let next = estimator.backoff();
            assert!(next >= previous);
            assert!(next <= MAX_RTO);
            previous = next;
        }
        assert_eq!(estimator.rto(), MAX_RTO);
    }

    #[test]
    fn test_backoff_invalidates_estimate() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));

        for _ in 0..MAX_BACKOFFS - 1 {
            estimator.backoff();
        }
        assert!(estimator.is_initialized());

        estimator.backoff();
        assert!(!estimator.is_initialized());

        // The next sample is treated as a first measurement.
        estimator.update(Duration::from_millis(40));
        assert!((estimator.srtt - 40.0).abs() < 0.01);
        assert!((estimator.rttvar - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_reset_backoff() {
        let mut estimator = RttEstimator::new();
        estimator.backoff();
        estimator.backoff();
        assert_eq!(estimator.backoffs(), 2);

        estimator.reset_backoff();
        assert_eq!(estimator.backoffs(), 0);
        assert_eq!(estimator.rto(), INITIAL_RTO * 4);
    }
}
