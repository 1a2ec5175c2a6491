//! Congestion control.
//!
//! Reno-style window counted in segments: slow start, congestion avoidance,
//! fast retransmit / fast recovery on the third duplicate acknowledgment, and
//! collapse to one segment on retransmission timeout.

use crate::core::DUP_ACK_THRESHOLD;

/// Congestion window state.
#[derive(Debug, Clone)]
pub struct CongestionController {
    cwnd: f64,
    ssthresh: f64,
    duplicate_acks: u32,
    in_recovery: bool,
}

impl CongestionController {
    /// Create a controller with the given initial window and threshold.
    pub fn new(initial_cwnd: f64, initial_ssthresh: f64) -> Self {
        Self {
            cwnd: initial_cwnd,
            ssthresh: initial_ssthresh,
            duplicate_acks: 0,
            in_recovery: false,
        }
    }

    /// Whether one more segment may be put in flight.
    pub fn can_send(&self, in_flight: usize) -> bool {
        self.cwnd >= in_flight as f64 + 1.0
    }

    /// An acknowledgment advanced the send window.
    pub fn on_ack(&mut self) {
        self.duplicate_acks = 0;
        if self.in_recovery {
            self.in_recovery = false;
            self.cwnd = self.ssthresh;
            tracing::debug!(cwnd = self.cwnd, "fast recovery complete");
        } else if self.cwnd < self.ssthresh {
            self.cwnd += 1.0;
        } else {
            self.cwnd += 1.0 / self.cwnd;
        }
    }

    /// A duplicate acknowledgment arrived with `in_flight` segments outstanding.
    ///
    /// Returns `true` exactly when fast retransmit should fire.
    pub fn on_duplicate_ack(&mut self, in_flight: usize) -> bool {
        self.duplicate_acks += 1;
        if self.duplicate_acks == DUP_ACK_THRESHOLD {
            self.ssthresh = half_of(in_flight);
            self.cwnd = self.ssthresh + 3.0;
            self.in_recovery = true;
            tracing::debug!(
                cwnd = self.cwnd,
                ssthresh = self.ssthresh,
                "fast retransmit"
            );
            true
        } else {
            if self.duplicate_acks > DUP_ACK_THRESHOLD {
                self.cwnd += 1.0;
            }
            false
        }
    }

    /// The retransmission timer expired with `in_flight` segments outstanding.
    pub fn on_timeout(&mut self, in_flight: usize) {
        if in_flight > 0 {
            self.ssthresh = half_of(in_flight);
            self.cwnd = 1.0;
        }
        self.duplicate_acks = 0;
        self.in_recovery = false;
    }

    /// Congestion window in segments.
    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    /// Slow-start threshold in segments.
    pub fn ssthresh(&self) -> f64 {
        self.ssthresh
    }

    /// Whether fast recovery is active.
    pub fn in_recovery(&self) -> bool {
        self.in_recovery
    }

    /// Consecutive duplicate acknowledgments seen.
    pub fn duplicate_acks(&self) -> u32 {
        self.duplicate_acks
    }
}

fn half_of(in_flight: usize) -> f64 {
    (in_flight as f64 / 2.0).max(2.0)
}
