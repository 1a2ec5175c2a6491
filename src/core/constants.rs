//! Protocol constants.
//!
//! These values are part of the wire protocol and MUST be identical on both
//! peers. Tunables that only affect local behaviour live in
//! [`StreamConfig`](super::StreamConfig) instead.

use std::time::Duration;

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Token queued as the first bytes of every outbound stream.
///
/// A connection only becomes validated after the peer's stream starts with
/// exactly these bytes and the peer has acknowledged ours.
pub const HELLO_TOKEN: &[u8] = b"udpstream/1 hello\n";

/// Receive window advertised before the connection is validated.
///
/// Just large enough for the peer's hello token, so no user data can arrive
/// before both sides proved they are attached to the right socket.
pub const HANDSHAKE_WINDOW: u64 = HELLO_TOKEN.len() as u64;

// =============================================================================
// DATAGRAM LAYOUT
// =============================================================================

/// Datagram flag: the sender has no data beyond the end of this segment.
pub const FLAG_CLOSE: u8 = 0x80;

/// Datagram flag: the sender received the peer's CLOSE in full.
pub const FLAG_ACK_CLOSE: u8 = 0x40;

/// Datagram flag: the sender aborted the connection.
pub const FLAG_FAIL: u8 = 0x20;

/// Mask of all defined flag bits; the remaining bits must be zero.
pub const FLAG_MASK: u8 = FLAG_CLOSE | FLAG_ACK_CLOSE | FLAG_FAIL;

/// HMAC-SHA1 output size.
pub const MAC_SIZE: usize = 20;

/// Largest encoded varint (prefix byte + 8 value bytes).
pub const MAX_VARINT_SIZE: usize = 9;

/// Worst-case header size: flags + seq + ack + window.
pub const MAX_HEADER_OVERHEAD: usize = 1 + 3 * MAX_VARINT_SIZE;

/// Largest datagram either side may emit or accept.
///
/// IPv4 safe datagram size (576) minus the IPv4 (20) and UDP (8) headers.
pub const MAX_DATAGRAM_SIZE: usize = 576 - 20 - 8;

/// Largest payload carried by a single segment.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - MAX_HEADER_OVERHEAD - MAC_SIZE;

// =============================================================================
// RETRANSMISSION TIMING
// =============================================================================

/// Retransmission timeout before the first RTT sample.
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(200);

/// Maximum retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_millis(60000);

/// Consecutive RTO backoffs after which SRTT/RTTVAR are discarded.
pub const MAX_BACKOFFS: u32 = 4;

/// Duplicate acknowledgments that trigger fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

// =============================================================================
// DEFAULT TUNABLES
// =============================================================================

/// Default send and receive buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 65535;

/// Default window advertisement step.
pub const DEFAULT_WINDOW_STEP: u64 = 2048;

/// Default cap on outstanding timers.
pub const DEFAULT_MAX_TIMERS: usize = 8;

/// Default timer reduction factor.
pub const DEFAULT_TIMER_REDUCTION: f64 = 0.75;

/// Default retransmission limit per segment.
pub const DEFAULT_MAX_RETRIES: u32 = 12;

/// Default initial congestion window, in segments.
pub const DEFAULT_INITIAL_CWND: f64 = 2.0;

/// Default initial slow-start threshold, in segments.
pub const DEFAULT_INITIAL_SSTHRESH: f64 = 64.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_budget() {
        assert_eq!(MAX_DATAGRAM_SIZE, 548);
        assert_eq!(MAX_PAYLOAD_SIZE, 500);
        assert!(MAX_HEADER_OVERHEAD + MAX_PAYLOAD_SIZE + MAC_SIZE <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_hello_fits_one_segment() {
        assert!(HELLO_TOKEN.len() <= MAX_PAYLOAD_SIZE);
        assert_eq!(HANDSHAKE_WINDOW, HELLO_TOKEN.len() as u64);
    }

    #[test]
    fn test_flags_disjoint() {
        assert_eq!(FLAG_CLOSE & FLAG_ACK_CLOSE, 0);
        assert_eq!(FLAG_CLOSE & FLAG_FAIL, 0);
        assert_eq!(FLAG_ACK_CLOSE & FLAG_FAIL, 0);
    }
}
