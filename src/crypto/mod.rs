//! Security layer.
//!
//! Datagrams are authenticated, not encrypted: every datagram carries an
//! HMAC-SHA1 trailer computed with a directional key derived from the two
//! secrets established out of band (e.g. by a rendezvous service).
//! Confidentiality, if needed, belongs to the layer above the byte stream.

mod keys;

pub use keys::PacketKeys;
