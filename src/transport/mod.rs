//! Transport engine.
//!
//! A sans-IO implementation of the reliable stream. Nothing in this module
//! touches a socket or a clock: callers pass the current [`Instant`] into
//! every operation and move datagrams in and out themselves, which keeps all
//! of the algorithms deterministic under test.
//!
//! - **Datagram codec**: [`Packet`], [`PacketFlags`] and canonical varints
//! - **Send engine**: [`SendBuffer`] (unsent FIFO + in-flight segments)
//! - **Receive engine**: [`RecvBuffer`] (contiguous buffer + reassembly queue)
//! - **RTO estimation**: [`RttEstimator`] implementing RFC 6298
//! - **Congestion control**: [`CongestionController`] (Reno)
//! - **Timer pool**: [`TimerManager`]
//! - **State machine**: [`Connection`] tying the above together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Consumer / Producer pipeline       │
//! ├─────────────────────────────────────────┤
//! │            Connection                   │  ← This module
//! │  send/recv engines, RTO, cwnd, timers   │
//! ├─────────────────────────────────────────┤
//! │       PacketKeys (HMAC-SHA1)            │
//! ├─────────────────────────────────────────┤
//! │                UDP                      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! [`Instant`]: std::time::Instant

mod congestion;
mod connection;
mod frame;
mod recv;
mod send;
mod timers;
mod timing;

pub use congestion::CongestionController;
pub use connection::*;
pub use frame::*;
pub use recv::{Arrival, RecvBuffer};
pub use send::{AckOutcome, Segment, SendBuffer};
pub use timers::{TimerId, TimerManager};
pub use timing::RttEstimator;
