//! Connection configuration.

use super::constants::*;
use super::error::ConfigError;

/// Local tunables for a connection.
///
/// Protocol constants that both peers must agree on are not configurable;
/// see [`MAX_PAYLOAD_SIZE`] and the other `core` constants.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Maximum outbound bytes held (unsent plus in flight).
    pub send_buffer_size: usize,

    /// Receive buffer capacity; bounds the advertised window.
    pub recv_buffer_size: usize,

    /// The advertised window edge is aligned down to a multiple of this.
    pub window_step: u64,

    /// Maximum number of outstanding timers.
    pub max_timers: usize,

    /// A new timer is only registered if its delay is below the earliest
    /// pending delay multiplied by this factor.
    pub timer_reduction: f64,

    /// Retransmissions of a single segment before the connection fails.
    pub max_retries: u32,

    /// Initial congestion window, in segments.
    pub initial_cwnd: f64,

    /// Initial slow-start threshold, in segments.
    pub initial_ssthresh: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            recv_buffer_size: DEFAULT_BUFFER_SIZE,
            window_step: DEFAULT_WINDOW_STEP,
            max_timers: DEFAULT_MAX_TIMERS,
            timer_reduction: DEFAULT_TIMER_REDUCTION,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_cwnd: DEFAULT_INITIAL_CWND,
            initial_ssthresh: DEFAULT_INITIAL_SSTHRESH,
        }
    }
}

impl StreamConfig {
    /// Check that all values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_step == 0 {
            return Err(ConfigError::OutOfRange {
                name: "window_step",
                reason: "must be non-zero",
            });
        }

        let min = self.window_step as usize + MAX_PAYLOAD_SIZE;
        for (name, size) in [
            ("send", self.send_buffer_size),
            ("receive", self.recv_buffer_size),
        ] {
            if size < min {
                return Err(ConfigError::BufferTooSmall { name, size, min });
            }
        }

        if self.max_timers == 0 {
            return Err(ConfigError::OutOfRange {
                name: "max_timers",
                reason: "at least one timer is required",
            });
        }
        if !(self.timer_reduction > 0.0 && self.timer_reduction <= 1.0) {
            return Err(ConfigError::OutOfRange {
                name: "timer_reduction",
                reason: "must be in (0, 1]",
            });
        }
        if self.initial_cwnd < 1.0 {
            return Err(ConfigError::OutOfRange {
                name: "initial_cwnd",
                reason: "must be at least one segment",
            });
        }
        if self.initial_ssthresh < 2.0 {
            return Err(ConfigError::OutOfRange {
                name: "initial_ssthresh",
                reason: "must be at least two segments",
            });
        }
        Ok(())
    }
}

/// Builder for [`StreamConfig`].
#[derive(Debug, Clone, Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both buffer sizes.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.send_buffer_size = size;
        self.config.recv_buffer_size = size;
        self
    }

    /// Set the send buffer size.
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.config.send_buffer_size = size;
        self
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.config.recv_buffer_size = size;
        self
    }

    /// Set the window advertisement step.
    pub fn window_step(mut self, step: u64) -> Self {
        self.config.window_step = step;
        self
    }

    /// Set the timer pool cap.
    pub fn max_timers(mut self, cap: usize) -> Self {
        self.config.max_timers = cap;
        self
    }

    /// Set the timer reduction factor.
    pub fn timer_reduction(mut self, factor: f64) -> Self {
        self.config.timer_reduction = factor;
        self
    }

    /// Set the per-segment retransmission limit.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the initial congestion window and slow-start threshold.
    pub fn congestion(mut self, cwnd: f64, ssthresh: f64) -> Self {
        self.config.initial_cwnd = cwnd;
        self.config.initial_ssthresh = ssthresh;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<StreamConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
