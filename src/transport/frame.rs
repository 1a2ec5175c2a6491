//! Datagram encoding and decoding.
//!
//! Wire format:
//! ```text
//! +--------+-----------+-----------+--------------+-----------+----------+
//! | Flags  | Seq       | Ack       | Window       | Payload   | MAC      |
//! | 1 byte | varint    | varint    | varint       | 0..500    | 20 bytes |
//! +--------+-----------+-----------+--------------+-----------+----------+
//! ```
//!
//! The MAC covers every byte before it. Varints are canonical: values below
//! `0x80` take one byte; larger values take a prefix byte `0x80 | n`
//! followed by the `n` significant big-endian bytes.

use crate::core::{
    FrameError, FLAG_ACK_CLOSE, FLAG_CLOSE, FLAG_FAIL, FLAG_MASK, MAC_SIZE, MAX_DATAGRAM_SIZE,
    MAX_VARINT_SIZE,
};
use crate::crypto::PacketKeys;

/// Datagram flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// No data follows the end of this segment.
    pub const CLOSE: Self = Self(FLAG_CLOSE);
    /// The peer's CLOSE was received in full.
    pub const ACK_CLOSE: Self = Self(FLAG_ACK_CLOSE);
    /// The sender aborted the connection.
    pub const FAIL: Self = Self(FLAG_FAIL);

    /// Create flags from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if CLOSE is set.
    pub fn is_close(self) -> bool {
        self.0 & FLAG_CLOSE != 0
    }

    /// Check if ACK_CLOSE is set.
    pub fn is_ack_close(self) -> bool {
        self.0 & FLAG_ACK_CLOSE != 0
    }

    /// Check if FAIL is set.
    pub fn is_fail(self) -> bool {
        self.0 & FLAG_FAIL != 0
    }

    /// Set CLOSE.
    pub fn with_close(self) -> Self {
        Self(self.0 | FLAG_CLOSE)
    }

    /// Set ACK_CLOSE.
    pub fn with_ack_close(self) -> Self {
        Self(self.0 | FLAG_ACK_CLOSE)
    }

    /// Check that reserved bits are zero.
    pub fn is_valid(self) -> bool {
        self.0 & !FLAG_MASK == 0
    }
}

/// Number of bytes `value` occupies as a varint.
pub fn varint_len(value: u64) -> usize {
    if value < 0x80 {
        1
    } else {
        1 + significant_bytes(value)
    }
}

fn significant_bytes(value: u64) -> usize {
    8 - (value.leading_zeros() as usize / 8)
}

/// Append `value` as a canonical varint.
pub fn put_varint(buf: &mut Vec<u8>, value: u64) {
    if value < 0x80 {
        buf.push(value as u8);
        return;
    }
    let n = significant_bytes(value);
    buf.push(0x80 | n as u8);
    buf.extend_from_slice(&value.to_be_bytes()[8 - n..]);
}

/// Read a canonical varint from the front of `buf`, advancing it.
pub fn get_varint(buf: &mut &[u8]) -> Result<u64, FrameError> {
    let (&first, rest) = buf.split_first().ok_or(FrameError::VarintTruncated)?;
    if first < 0x80 {
        *buf = rest;
        return Ok(first as u64);
    }

    let n = (first & 0x7f) as usize;
    if n == 0 || n > MAX_VARINT_SIZE - 1 {
        return Err(FrameError::VarintOverflow(first));
    }
    if rest.len() < n {
        return Err(FrameError::VarintTruncated);
    }

    let mut bytes = [0u8; 8];
    bytes[8 - n..].copy_from_slice(&rest[..n]);
    let value = u64::from_be_bytes(bytes);
    if varint_len(value) != n + 1 {
        return Err(FrameError::NonCanonicalVarint);
    }

    *buf = &rest[n..];
    Ok(value)
}

/// A decoded (or to-be-encoded) datagram.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    /// Datagram flags.
    pub flags: PacketFlags,
    /// Stream position of the first payload byte.
    pub seq: u64,
    /// Next stream position the sender expects from us.
    pub ack: u64,
    /// Receive window beyond `ack` the sender advertises.
    pub window: u64,
    /// Stream bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Size of the datagram once encoded and sealed.
    pub fn encoded_len(&self) -> usize {
        1 + varint_len(self.seq)
            + varint_len(self.ack)
            + varint_len(self.window)
            + self.payload.len()
            + MAC_SIZE
    }

    /// Serialize and authenticate the datagram.
    pub fn seal(&self, keys: &PacketKeys) -> Result<Vec<u8>, FrameError> {
        let len = self.encoded_len();
        if len > MAX_DATAGRAM_SIZE {
            return Err(FrameError::TooLarge {
                max: MAX_DATAGRAM_SIZE,
                actual: len,
            });
        }

        let mut buf = Vec::with_capacity(len);
        buf.push(self.flags.as_byte());
        put_varint(&mut buf, self.seq);
        put_varint(&mut buf, self.ack);
        put_varint(&mut buf, self.window);
        buf.extend_from_slice(&self.payload);
        keys.seal(&mut buf);
        Ok(buf)
    }

    /// Parse an authenticated datagram body (MAC already stripped).
    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() + MAC_SIZE > MAX_DATAGRAM_SIZE {
            return Err(FrameError::TooLarge {
                max: MAX_DATAGRAM_SIZE,
                actual: body.len() + MAC_SIZE,
            });
        }

        let (&flags, mut rest) = body.split_first().ok_or(FrameError::TooShort {
            expected: 1 + MAC_SIZE,
            actual: MAC_SIZE,
        })?;
        let flags = PacketFlags::from_byte(flags);
        if !flags.is_valid() {
            return Err(FrameError::InvalidFlags(flags.as_byte()));
        }

        let seq = get_varint(&mut rest)?;
        let ack = get_varint(&mut rest)?;
        let window = get_varint(&mut rest)?;
        if seq.checked_add(rest.len() as u64).is_none() {
            return Err(FrameError::SequenceOverflow(seq));
        }

        Ok(Self {
            flags,
            seq,
            ack,
            window,
            payload: rest.to_vec(),
        })
    }

    /// End of this segment in stream space.
    ///
    /// Decoded packets never overflow; a hand-built one saturates.
    pub fn end(&self) -> u64 {
        self.seq.saturating_add(self.payload.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AuthError, MAX_PAYLOAD_SIZE};

    fn encode(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        put_varint(&mut buf, value);
        buf
    }

    #[test]
    fn test_varint_small_values_one_byte() {
        assert_eq!(encode(0), [0x00]);
        assert_eq!(encode(0x7f), [0x7f]);
    }

    #[test]
    fn test_varint_length_prefixed() {
        assert_eq!(encode(0x80), [0x81, 0x80]);
        assert_eq!(encode(0x1234), [0x82, 0x12, 0x34]);
        assert_eq!(encode(65535), [0x82, 0xff, 0xff]);
        assert_eq!(encode(u64::MAX), [0x88, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(varint_len(u64::MAX), MAX_VARINT_SIZE);
    }

    #[test]
    fn test_varint_decode_advances() {
        let bytes = [0x82, 0x12, 0x34, 0x05];
        let mut buf = &bytes[..];
        assert_eq!(get_varint(&mut buf).unwrap(), 0x1234);
        assert_eq!(get_varint(&mut buf).unwrap(), 5);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_varint_rejects_non_canonical() {
        // 5 encoded with a length prefix
        let mut buf = &[0x81, 0x05][..];
        assert_eq!(get_varint(&mut buf), Err(FrameError::NonCanonicalVarint));

        // 0x80 padded to two bytes
        let mut buf = &[0x82, 0x00, 0x80][..];
        assert_eq!(get_varint(&mut buf), Err(FrameError::NonCanonicalVarint));
    }

    #[test]
    fn test_varint_truncated_and_overflow() {
        let mut buf = &[0x83, 0x01][..];
        assert_eq!(get_varint(&mut buf), Err(FrameError::VarintTruncated));

        let mut buf = &[][..];
        assert_eq!(get_varint(&mut buf), Err(FrameError::VarintTruncated));

        let mut buf = &[0x89, 0, 0, 0, 0, 0, 0, 0, 0, 1][..];
        assert_eq!(get_varint(&mut buf), Err(FrameError::VarintOverflow(0x89)));

        let mut buf = &[0x80][..];
        assert_eq!(get_varint(&mut buf), Err(FrameError::VarintOverflow(0x80)));
    }

    #[test]
    fn test_packet_wire_layout() {
        let keys = PacketKeys::derive(b"a", b"b");
        let packet = Packet {
            flags: PacketFlags::CLOSE,
            seq: 300,
            ack: 5,
            window: 2048,
            payload: b"xy".to_vec(),
        };

        let datagram = packet.seal(&keys).unwrap();
        assert_eq!(datagram.len(), packet.encoded_len());
        assert_eq!(
            hex::encode(&datagram[..datagram.len() - MAC_SIZE]),
            "8082012c058208007879"
        );

        let body = keys.reversed().open(&datagram).unwrap();
        assert_eq!(Packet::decode(body).unwrap(), packet);
    }

    #[test]
    fn test_packet_wrong_key() {
        let keys = PacketKeys::derive(b"a", b"b");
        let datagram = Packet::default().seal(&keys).unwrap();
        let other = PacketKeys::derive(b"b", b"c");
        assert_eq!(other.open(&datagram), Err(AuthError::InvalidMac));
    }

    #[test]
    fn test_packet_too_large() {
        let keys = PacketKeys::derive(b"a", b"b");
        let packet = Packet {
            seq: u64::MAX / 2,
            ack: u64::MAX / 2,
            window: u64::MAX / 2,
            payload: vec![0u8; MAX_PAYLOAD_SIZE + 1],
            ..Default::default()
        };
        assert!(matches!(packet.seal(&keys), Err(FrameError::TooLarge { .. })));

        let body = vec![0u8; MAX_DATAGRAM_SIZE];
        assert!(matches!(Packet::decode(&body), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn test_max_payload_always_fits() {
        let keys = PacketKeys::derive(b"a", b"b");
        let packet = Packet {
            flags: PacketFlags::CLOSE.with_ack_close(),
            seq: u64::MAX - 1000,
            ack: u64::MAX - 1000,
            window: u64::MAX - 1000,
            payload: vec![0u8; MAX_PAYLOAD_SIZE],
        };
        assert_eq!(packet.seal(&keys).unwrap().len(), MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_packet_malformed() {
        assert_eq!(Packet::decode(&[0x01, 0, 0, 0]), Err(FrameError::InvalidFlags(0x01)));
        assert_eq!(Packet::decode(&[0x00, 0x05]), Err(FrameError::VarintTruncated));
        assert!(matches!(Packet::decode(&[]), Err(FrameError::TooShort { .. })));
    }

    #[test]
    fn test_packet_sequence_overflow() {
        let keys = PacketKeys::derive(b"a", b"b");
        let packet = Packet {
            flags: PacketFlags::NONE,
            seq: u64::MAX - 2,
            ack: 0,
            window: 0,
            payload: b"12345".to_vec(),
        };
        assert_eq!(packet.end(), u64::MAX);

        let datagram = packet.seal(&keys).unwrap();
        let body = keys.reversed().open(&datagram).unwrap();
        assert_eq!(
            Packet::decode(body),
            Err(FrameError::SequenceOverflow(u64::MAX - 2))
        );
    }

    #[test]
    fn test_flags() {
        let flags = PacketFlags::NONE.with_close().with_ack_close();
        assert!(flags.is_close());
        assert!(flags.is_ack_close());
        assert!(!flags.is_fail());
        assert!(flags.is_valid());
        assert_eq!(flags.as_byte(), 0xc0);
        assert!(PacketFlags::FAIL.is_fail());
    }
}
