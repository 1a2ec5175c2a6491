//! Receive engine buffers.
//!
//! In-order bytes accumulate in a contiguous buffer starting at the first
//! undelivered stream position. Segments that arrive ahead of it wait in a
//! reassembly queue until the gap closes.

use std::collections::{BTreeMap, VecDeque};

use crate::core::ProtocolViolation;

/// How an inbound segment was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Appended to the contiguous buffer (possibly draining the queue).
    InOrder,
    /// Queued ahead of a gap.
    OutOfOrder,
    /// Already received; ignored.
    Duplicate,
    /// One byte exactly at the window edge; ignored.
    Probe,
}

impl Arrival {
    /// Whether the arrival calls for an immediate acknowledgment.
    pub fn forces_ack(self) -> bool {
        !matches!(self, Arrival::InOrder)
    }
}

/// Inbound stream state.
#[derive(Debug)]
pub struct RecvBuffer {
    data: VecDeque<u8>,
    /// Stream position of `data[0]` (`rbuf_spos`).
    start: u64,
    queue: BTreeMap<u64, Vec<u8>>,
    capacity: usize,
    step: u64,
    window_end: u64,
    close_pos: Option<u64>,
}

impl RecvBuffer {
    /// Create an empty buffer advertising `initial_window` bytes.
    pub fn new(capacity: usize, step: u64, initial_window: u64) -> Self {
        Self {
            data: VecDeque::new(),
            start: 0,
            queue: BTreeMap::new(),
            capacity,
            step,
            window_end: initial_window,
            close_pos: None,
        }
    }

    /// Classify and store a data segment.
    pub fn insert(&mut self, seq: u64, payload: &[u8]) -> Result<Arrival, ProtocolViolation> {
        let len = payload.len() as u64;
        let Some(end) = seq.checked_add(len) else {
            return Err(ProtocolViolation::WindowExceeded {
                seq,
                end: u64::MAX,
                window_end: self.window_end,
            });
        };

        if let Some(close_pos) = self.close_pos
            && end > close_pos
        {
            return Err(ProtocolViolation::PastClose { close_pos, end });
        }

        if seq == self.window_end {
            if len == 1 {
                return Ok(Arrival::Probe);
            }
            return Err(ProtocolViolation::ProbeTooLong(payload.len()));
        }
        if end > self.window_end {
            return Err(ProtocolViolation::WindowExceeded {
                seq,
                end,
                window_end: self.window_end,
            });
        }

        let expected = self.contiguous_end();
        if seq < expected {
            return Ok(Arrival::Duplicate);
        }
        if seq == expected {
            self.data.extend(payload);
            self.drain_queue()?;
            return Ok(Arrival::InOrder);
        }

        if let Some((&prev, block)) = self.queue.range(..=seq).next_back() {
            if prev == seq && block.as_slice() == payload {
                return Ok(Arrival::Duplicate);
            }
            if prev + block.len() as u64 > seq {
                return Err(ProtocolViolation::Overlap(seq));
            }
        }
        if let Some((&next, _)) = self.queue.range(seq + 1..).next()
            && end > next
        {
            return Err(ProtocolViolation::Overlap(seq));
        }

        self.queue.insert(seq, payload.to_vec());
        Ok(Arrival::OutOfOrder)
    }

    fn drain_queue(&mut self) -> Result<(), ProtocolViolation> {
        loop {
            let end = self.contiguous_end();
            let Some(entry) = self.queue.first_entry() else {
                break;
            };
            let seq = *entry.key();
            if seq > end {
                break;
            }
            if seq < end {
                return Err(ProtocolViolation::Overlap(seq));
            }
            self.data.extend(entry.remove());
        }
        Ok(())
    }

    /// Record the peer's declared end of stream.
    ///
    /// Returns `true` the first time a position is recorded.
    pub fn record_close(&mut self, pos: u64) -> Result<bool, ProtocolViolation> {
        match self.close_pos {
            Some(first) if first != pos => Err(ProtocolViolation::CloseMismatch { first, second: pos }),
            Some(_) => Ok(false),
            None => {
                let received_end = self
                    .queue
                    .last_key_value()
                    .map(|(&seq, block)| seq + block.len() as u64)
                    .unwrap_or(0)
                    .max(self.contiguous_end());
                if received_end > pos {
                    return Err(ProtocolViolation::PastClose {
                        close_pos: pos,
                        end: received_end,
                    });
                }
                self.close_pos = Some(pos);
                Ok(true)
            }
        }
    }

    /// Every byte up to the peer's close position has arrived in order.
    pub fn close_complete(&self) -> bool {
        self.close_pos == Some(self.contiguous_end())
    }

    /// The peer's stream is complete and fully delivered.
    pub fn is_finished(&self) -> bool {
        self.close_complete() && self.data.is_empty()
    }

    /// Contiguous bytes not yet delivered, as two slices.
    pub fn peek(&self) -> (&[u8], &[u8]) {
        self.data.as_slices()
    }

    /// Release `n` delivered bytes from the front of the buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
        self.start += n as u64;
    }

    /// Drop every contiguous byte and the reassembly queue.
    pub fn discard(&mut self) {
        self.consume(self.data.len());
        self.queue.clear();
    }

    /// Recompute the full advertised window edge. Returns `true` if it moved.
    ///
    /// The edge is aligned down to the window step and never retreats.
    pub fn update_window(&mut self) -> bool {
        let edge = (self.start + self.capacity as u64) / self.step * self.step;
        if edge > self.window_end {
            self.window_end = edge;
            true
        } else {
            false
        }
    }

    /// Next expected stream position; the acknowledgment number.
    pub fn contiguous_end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    /// Stream position of the first undelivered byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Advertised window edge.
    pub fn window_end(&self) -> u64 {
        self.window_end
    }

    /// Peer's close position, if declared.
    pub fn close_pos(&self) -> Option<u64> {
        self.close_pos
    }

    /// Contiguous bytes awaiting delivery.
    pub fn buffered(&self) -> usize {
        self.data.len()
    }

    /// Out-of-order blocks awaiting a gap fill.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> RecvBuffer {
        RecvBuffer::new(4096, 1024, 4096)
    }

    fn contents(buf: &RecvBuffer) -> Vec<u8> {
        let (a, b) = buf.peek();
        [a, b].concat()
    }

    #[test]
    fn test_in_order() {
        let mut buf = buffer();
        assert_eq!(buf.insert(0, b"abc").unwrap(), Arrival::InOrder);
        assert_eq!(buf.insert(3, b"def").unwrap(), Arrival::InOrder);
        assert_eq!(contents(&buf), b"abcdef");
        assert_eq!(buf.contiguous_end(), 6);
    }

    #[test]
    fn test_reassembly() {
        let mut buf = buffer();
        assert_eq!(buf.insert(6, b"ghi").unwrap(), Arrival::OutOfOrder);
        assert_eq!(buf.insert(3, b"def").unwrap(), Arrival::OutOfOrder);
        assert_eq!(buf.queued(), 2);
        assert_eq!(buf.contiguous_end(), 0);

        assert_eq!(buf.insert(0, b"abc").unwrap(), Arrival::InOrder);
        assert_eq!(contents(&buf), b"abcdefghi");
        assert_eq!(buf.queued(), 0);
    }

    #[test]
    fn test_duplicates() {
        let mut buf = buffer();
        buf.insert(0, b"abc").unwrap();
        buf.insert(6, b"ghi").unwrap();

        assert_eq!(buf.insert(0, b"abc").unwrap(), Arrival::Duplicate);
        assert_eq!(buf.insert(6, b"ghi").unwrap(), Arrival::Duplicate);
        assert!(Arrival::Duplicate.forces_ack());
        assert_eq!(contents(&buf), b"abc");
    }

    #[test]
    fn test_queue_overlap_is_fatal() {
        let mut buf = buffer();
        buf.insert(10, b"0123456789").unwrap();
        assert_eq!(buf.insert(15, b"xx"), Err(ProtocolViolation::Overlap(15)));
        assert_eq!(buf.insert(8, b"xxx"), Err(ProtocolViolation::Overlap(8)));
        assert_eq!(buf.insert(10, b"different!"), Err(ProtocolViolation::Overlap(10)));
    }

    #[test]
    fn test_drain_overlap_is_fatal() {
        let mut buf = buffer();
        buf.insert(5, b"fgh").unwrap();
        assert_eq!(buf.insert(0, b"abcdefg"), Err(ProtocolViolation::Overlap(5)));
    }

    #[test]
    fn test_window() {
        let mut buf = RecvBuffer::new(4096, 1024, 18);
        assert_eq!(buf.insert(18, b"x").unwrap(), Arrival::Probe);
        assert_eq!(buf.insert(18, b"xy"), Err(ProtocolViolation::ProbeTooLong(2)));
        assert!(matches!(
            buf.insert(10, b"0123456789"),
            Err(ProtocolViolation::WindowExceeded { window_end: 18, .. })
        ));

        assert!(buf.update_window());
        assert_eq!(buf.window_end(), 4096);
        assert!(!buf.update_window());
    }

    #[test]
    fn test_sequence_overflow_is_window_violation() {
        let mut buf = buffer();
        assert_eq!(
            buf.insert(u64::MAX - 2, b"12345"),
            Err(ProtocolViolation::WindowExceeded {
                seq: u64::MAX - 2,
                end: u64::MAX,
                window_end: 4096,
            })
        );
        assert_eq!(buf.queued(), 0);
        assert_eq!(buf.contiguous_end(), 0);
    }

    #[test]
    fn test_window_advances_in_steps() {
        let mut buf = RecvBuffer::new(4096, 1024, 4096);
        buf.insert(0, &[0u8; 1000]).unwrap();
        buf.consume(1000);
        assert!(!buf.update_window());
        assert_eq!(buf.window_end(), 4096);

        buf.insert(1000, &[0u8; 100]).unwrap();
        buf.consume(100);
        assert!(buf.update_window());
        assert_eq!(buf.window_end(), 5120);
    }

    #[test]
    fn test_close() {
        let mut buf = buffer();
        buf.insert(0, b"abc").unwrap();
        assert_eq!(buf.record_close(5), Ok(true));
        assert_eq!(buf.record_close(5), Ok(false));
        assert_eq!(
            buf.record_close(6),
            Err(ProtocolViolation::CloseMismatch { first: 5, second: 6 })
        );
        assert!(matches!(buf.insert(3, b"def"), Err(ProtocolViolation::PastClose { .. })));

        assert!(!buf.close_complete());
        buf.insert(3, b"de").unwrap();
        assert!(buf.close_complete());
        assert!(!buf.is_finished());
        buf.consume(5);
        assert!(buf.is_finished());
    }

    #[test]
    fn test_close_before_received_data() {
        let mut buf = buffer();
        buf.insert(10, b"late").unwrap();
        assert_eq!(
            buf.record_close(12),
            Err(ProtocolViolation::PastClose { close_pos: 12, end: 14 })
        );
    }

    #[test]
    fn test_discard() {
        let mut buf = buffer();
        buf.insert(0, b"abc").unwrap();
        buf.insert(10, b"xyz").unwrap();
        buf.discard();
        assert_eq!(buf.buffered(), 0);
        assert_eq!(buf.queued(), 0);
        assert_eq!(buf.start(), 3);
    }
}
