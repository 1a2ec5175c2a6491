//! Byte-stream boundary traits.
//!
//! A [`Connection`](crate::transport::Connection) sits between two pipeline
//! components:
//!
//! ```text
//!  upstream Producer ──consume()──▶ Connection ──consume()──▶ downstream Consumer
//!                    ◀─can_produce()─            ◀─can_produce()─
//! ```
//!
//! The connection itself offers the mirror image of both traits as inherent
//! methods (`consume`, `end_of_input`, `abort_output` for outbound bytes;
//! `can_produce`, `abort_input` for inbound bytes).
//!
//! # Threading
//!
//! Every callback is invoked from the task that owns the connection. Callbacks
//! must not block.

use std::net::SocketAddr;

use super::error::StreamError;

/// Downstream component that receives the connection's inbound bytes.
pub trait Consumer: Send {
    /// Deliver contiguous stream bytes.
    ///
    /// Returns the new limit: how many more bytes this consumer is willing to
    /// accept before it calls `can_produce` again. Returning an error aborts
    /// the input direction of the connection.
    fn consume(&mut self, data: &[u8]) -> Result<usize, StreamError>;

    /// The inbound stream ended. `clean` is false if it was cut short.
    fn end_of_input(&mut self, clean: bool);

    /// The connection failed; no more data will arrive.
    fn abort(&mut self);

    /// The connection was validated with `peer`.
    fn connection_established(&mut self, peer: SocketAddr) {
        let _ = peer;
    }
}

/// Upstream component that feeds the connection's outbound bytes.
pub trait Producer: Send {
    /// The connection can accept up to `limit` more bytes.
    fn can_produce(&mut self, limit: usize);

    /// The connection failed or its output was aborted; stop producing.
    fn abort(&mut self);

    /// The connection was validated with `peer`.
    fn connection_established(&mut self, peer: SocketAddr) {
        let _ = peer;
    }
}
