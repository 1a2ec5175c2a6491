//! Send engine buffers.
//!
//! Outbound bytes live in two places: the unsent FIFO and the in-flight
//! table of transmitted segments keyed by stream position. Together they
//! hold the stream from `acked` onward with no gaps or overlaps.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::core::{ProtocolViolation, MAX_PAYLOAD_SIZE};

/// A transmitted, not yet acknowledged segment.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Stream bytes.
    pub payload: Vec<u8>,
    /// Most recent transmission.
    pub sent_at: Instant,
    /// Wait before the next retransmission.
    pub delay: Duration,
    /// Retransmissions counted against the retry limit.
    pub retries: u32,
    /// Total transmissions; RTT is only sampled when this is one.
    pub transmissions: u32,
}

impl Segment {
    /// When this segment is due for retransmission.
    pub fn deadline(&self) -> Instant {
        self.sent_at + self.delay
    }
}

/// Result of processing an acknowledgment number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Older than what was already acknowledged.
    Stale,
    /// Equal to the current acknowledged position.
    Unchanged,
    /// New data acknowledged.
    Advanced {
        /// Segments removed from the in-flight table.
        segments: usize,
        /// Round-trip sample from the segment that ended at the ack.
        rtt: Option<Duration>,
    },
}

/// Outbound stream state.
#[derive(Debug)]
pub struct SendBuffer {
    unsent: VecDeque<u8>,
    in_flight: BTreeMap<u64, Segment>,
    /// Stream position of the first unsent byte.
    next_seq: u64,
    /// Highest position acknowledged by the peer.
    acked: u64,
    /// Peer's advertised window edge.
    limit: u64,
    capacity: usize,
    /// Position after the last byte, once end of output was signalled.
    close_pos: Option<u64>,
    /// Start of an outstanding zero-window probe.
    probe: Option<u64>,
}

impl SendBuffer {
    /// Create an empty buffer with `capacity` bytes and an initial peer
    /// window edge.
    pub fn new(capacity: usize, initial_limit: u64) -> Self {
        Self {
            unsent: VecDeque::new(),
            in_flight: BTreeMap::new(),
            next_seq: 0,
            acked: 0,
            limit: initial_limit,
            capacity,
            close_pos: None,
            probe: None,
        }
    }

    /// Queue as many of `data` as fit. Returns the number accepted.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.headroom());
        self.unsent.extend(&data[..n]);
        n
    }

    /// Bytes that can still be queued.
    pub fn headroom(&self) -> usize {
        let held = self.unsent.len() + (self.next_seq - self.acked) as usize;
        self.capacity.saturating_sub(held)
    }

    /// Mark end of output at the current end of the buffered stream.
    pub fn finish(&mut self) -> u64 {
        *self
            .close_pos
            .get_or_insert(self.next_seq + self.unsent.len() as u64)
    }

    /// Position after the final byte, if end of output was signalled.
    pub fn close_pos(&self) -> Option<u64> {
        self.close_pos
    }

    /// Bytes the peer's window still admits.
    pub fn window_remaining(&self) -> u64 {
        self.limit.saturating_sub(self.next_seq)
    }

    /// Take the next new segment (at most one maximum payload) and record it
    /// as in flight with retransmission delay `rto`.
    pub fn next_segment(&mut self, now: Instant, rto: Duration) -> Option<(u64, Vec<u8>)> {
        let n = (self.unsent.len() as u64)
            .min(self.window_remaining())
            .min(MAX_PAYLOAD_SIZE as u64) as usize;
        if n == 0 {
            return None;
        }
        Some(self.transmit(n, now, rto))
    }

    /// Send one byte past an exhausted window.
    ///
    /// The byte becomes an ordinary in-flight segment: the receiver discards
    /// it, and its retransmissions keep probing with backoff.
    pub fn probe_segment(&mut self, now: Instant, rto: Duration) -> Option<(u64, Vec<u8>)> {
        if self.unsent.is_empty() || self.window_remaining() > 0 || !self.in_flight.is_empty() {
            return None;
        }
        self.probe = Some(self.next_seq);
        Some(self.transmit(1, now, rto))
    }

    fn transmit(&mut self, n: usize, now: Instant, rto: Duration) -> (u64, Vec<u8>) {
        let seq = self.next_seq;
        let payload: Vec<u8> = self.unsent.drain(..n).collect();
        self.in_flight.insert(
            seq,
            Segment {
                payload: payload.clone(),
                sent_at: now,
                delay: rto,
                retries: 0,
                transmissions: 1,
            },
        );
        self.next_seq += n as u64;
        (seq, payload)
    }

    /// Retransmit the segment at `seq`, doubling its delay up to `cap`.
    ///
    /// Returns the payload and the segment's retry count after this resend.
    pub fn resend(&mut self, seq: u64, now: Instant, cap: Duration) -> Option<(Vec<u8>, u32)> {
        let segment = self.in_flight.get_mut(&seq)?;
        segment.retries += 1;
        segment.transmissions += 1;
        segment.delay = segment.delay.saturating_mul(2).min(cap);
        segment.sent_at = now;
        Some((segment.payload.clone(), segment.retries))
    }

    /// Process an acknowledgment number.
    ///
    /// An ack beyond what was sent, or one that does not end exactly on an
    /// in-flight segment boundary, is a protocol violation.
    pub fn on_ack(&mut self, ack: u64, now: Instant) -> Result<AckOutcome, ProtocolViolation> {
        if ack > self.next_seq {
            return Err(ProtocolViolation::AckBeyondSent {
                ack,
                sent: self.next_seq,
            });
        }
        if ack < self.acked {
            return Ok(AckOutcome::Stale);
        }
        if ack == self.acked {
            return Ok(AckOutcome::Unchanged);
        }

        let rtt = match self.in_flight.range(..ack).next_back() {
            Some((&seq, segment)) if seq + segment.payload.len() as u64 == ack => {
                (segment.transmissions == 1).then(|| now.saturating_duration_since(segment.sent_at))
            }
            _ => return Err(ProtocolViolation::UnalignedAck(ack)),
        };

        let remaining = self.in_flight.split_off(&ack);
        let segments = std::mem::replace(&mut self.in_flight, remaining).len();
        self.acked = ack;
        if self.probe.is_some_and(|p| p < ack) {
            self.probe = None;
        }
        Ok(AckOutcome::Advanced { segments, rtt })
    }

    /// Raise the peer window edge. Returns the start of a probe segment the
    /// peer discarded, which is now inside the window and should be resent.
    pub fn update_limit(&mut self, edge: u64) -> Option<u64> {
        if edge <= self.limit {
            return None;
        }
        self.limit = edge;
        match self.probe {
            Some(seq) if seq < edge => {
                self.probe = None;
                Some(seq)
            }
            _ => None,
        }
    }

    /// The peer answered the outstanding probe, so it is not lost: its
    /// retries no longer count toward the retry limit.
    pub fn probe_acknowledged(&mut self) {
        if let Some(seq) = self.probe
            && let Some(segment) = self.in_flight.get_mut(&seq)
        {
            segment.retries = 0;
        }
    }

    /// Oldest in-flight segment.
    pub fn oldest(&self) -> Option<u64> {
        self.in_flight.keys().next().copied()
    }

    /// Segments whose retransmission deadline has passed, oldest first.
    pub fn overdue(&self, now: Instant) -> Vec<u64> {
        self.in_flight
            .iter()
            .filter(|(_, segment)| segment.deadline() <= now)
            .map(|(&seq, _)| seq)
            .collect()
    }

    /// Soonest retransmission deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(Segment::deadline).min()
    }

    /// Look up an in-flight segment.
    pub fn segment(&self, seq: u64) -> Option<&Segment> {
        self.in_flight.get(&seq)
    }

    /// Discard everything queued and in flight.
    pub fn clear(&mut self) {
        self.unsent.clear();
        self.in_flight.clear();
        self.probe = None;
    }

    /// Number of in-flight segments.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of unsent bytes.
    pub fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    /// Bytes transmitted but not acknowledged.
    pub fn in_flight_bytes(&self) -> u64 {
        self.next_seq - self.acked
    }

    /// Stream position of the next new byte (`sbuf_pos`).
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Highest acknowledged position.
    pub fn acked(&self) -> u64 {
        self.acked
    }

    /// Peer's window edge.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Whether a probe byte is outstanding.
    pub fn is_probing(&self) -> bool {
        self.probe.is_some()
    }

    /// Nothing unsent and nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.unsent.is_empty() && self.in_flight.is_empty()
    }
}
