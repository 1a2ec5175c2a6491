//! Error types for udpstream.
//!
//! The taxonomy keeps recoverable outcomes ([`AuthError`], [`StreamError`])
//! apart from conditions that are fatal to a connection
//! ([`ProtocolViolation`], [`FailReason`]).

use thiserror::Error;

/// Errors that can occur when parsing a datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Datagram shorter than the fixed overhead.
    #[error("datagram too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Datagram larger than the maximum segment size.
    #[error("datagram too large: {actual} bytes exceeds {max}")]
    TooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A varint ran past the end of the header.
    #[error("truncated varint")]
    VarintTruncated,

    /// A varint used more bytes than necessary.
    #[error("non-canonical varint encoding")]
    NonCanonicalVarint,

    /// A varint length prefix is out of range.
    #[error("varint length prefix {0} out of range")]
    VarintOverflow(u8),

    /// Reserved flag bits are set.
    #[error("invalid flags: 0x{0:02x} (reserved bits must be 0)")]
    InvalidFlags(u8),

    /// The segment would end past the largest stream position.
    #[error("segment at {0} overflows the sequence space")]
    SequenceOverflow(u64),
}

/// Authentication failures. Always recoverable: the datagram is dropped.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// The trailing MAC does not match the receive key.
    #[error("invalid datagram authentication")]
    InvalidMac,

    /// Too short to even contain a MAC.
    #[error("datagram shorter than its MAC")]
    Truncated,
}

/// Peer behaviour that violates the protocol. Always fatal to the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// An authenticated datagram could not be parsed.
    #[error("malformed datagram: {0}")]
    Malformed(#[from] FrameError),

    /// Data extends past the advertised receive window.
    #[error("segment [{seq}, {end}) exceeds receive window ending at {window_end}")]
    WindowExceeded {
        /// Segment start.
        seq: u64,
        /// Segment end.
        end: u64,
        /// Advertised window edge.
        window_end: u64,
    },

    /// A window probe carried more than one byte.
    #[error("window probe of {0} bytes")]
    ProbeTooLong(usize),

    /// Segment overlaps buffered or queued data inconsistently.
    #[error("segment at {0} overlaps buffered data")]
    Overlap(u64),

    /// Data extends past the declared close position.
    #[error("data past close position {close_pos} (segment ends at {end})")]
    PastClose {
        /// Declared close position.
        close_pos: u64,
        /// Segment end.
        end: u64,
    },

    /// A second CLOSE declared a different position.
    #[error("close position changed from {first} to {second}")]
    CloseMismatch {
        /// First declared position.
        first: u64,
        /// Conflicting position.
        second: u64,
    },

    /// Acknowledgment does not end on a segment boundary.
    #[error("ack {0} not aligned to any in-flight segment")]
    UnalignedAck(u64),

    /// Acknowledgment covers data never sent.
    #[error("ack {ack} beyond sent position {sent}")]
    AckBeyondSent {
        /// Acknowledgment number.
        ack: u64,
        /// Highest position sent.
        sent: u64,
    },

    /// The peer's stream did not start with the hello token.
    #[error("hello token mismatch")]
    HelloMismatch,

    /// ACK_CLOSE received while local output had not finished.
    #[error("premature ACK_CLOSE")]
    PrematureAckClose,

    /// The peer sent a FAIL datagram.
    #[error("peer aborted the connection")]
    PeerFailed,
}

impl ProtocolViolation {
    /// Protocol violations always terminate the connection.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// Why a connection entered the failed state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// The peer violated the protocol (or sent FAIL).
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Socket send/receive failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// A segment was retransmitted too many times.
    #[error("retransmission limit exceeded")]
    RetriesExhausted,

    /// The local application aborted the stream.
    #[error("aborted locally")]
    LocalAbort,
}

/// Errors reported synchronously to the caller of a single operation.
///
/// None of these fail the connection by themselves.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The send buffer could not take all bytes; `accepted` were queued.
    #[error("send buffer full ({accepted} bytes accepted)")]
    BufferFull {
        /// Bytes actually queued.
        accepted: usize,
    },

    /// End of output was already signalled.
    #[error("output already closed")]
    OutputClosed,

    /// A consumer or producer is already attached.
    #[error("already attached")]
    AlreadyAttached,

    /// No consumer or producer is attached.
    #[error("not attached")]
    NotAttached,

    /// The connection has failed.
    #[error("connection failed")]
    Failed,
}

/// Invalid configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Buffer smaller than one window step plus one segment.
    #[error("{name} buffer of {size} bytes is below the minimum of {min}")]
    BufferTooSmall {
        /// Which buffer.
        name: &'static str,
        /// Configured size.
        size: usize,
        /// Minimum size.
        min: usize,
    },

    /// A parameter is out of its valid range.
    #[error("invalid {name}: {reason}")]
    OutOfRange {
        /// Parameter name.
        name: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}
