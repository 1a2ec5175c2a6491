//! # udpstream
//!
//! Reliable, ordered, authenticated byte streams over UDP.
//!
//! Two peers that already share a pair of secrets and each other's address
//! (typically after NAT traversal through a rendezvous service) get a
//! TCP-like stream over a plain UDP socket:
//!
//! - **Reliability**: cumulative acks, RTO retransmission (RFC 6298), fast
//!   retransmit on the third duplicate ack
//! - **Flow control**: receive-window advertisement with zero-window probes
//! - **Congestion control**: Reno slow start and congestion avoidance
//! - **Authentication**: HMAC-SHA1 on every datagram with directional keys
//! - **Half-close**: each direction ends independently with CLOSE / ACK_CLOSE
//!
//! ## Feature Flags
//!
//! - `crypto` (default): datagram authentication and the transport engine
//! - `runtime` (default): Tokio driver task and the async [`UdpStream`] handle
//!
//! ## Modules
//!
//! - [`core`]: constants, errors, configuration and pipeline traits (always included)
//! - [`crypto`]: directional HMAC keys (requires `crypto`)
//! - [`transport`]: sans-IO connection state machine (requires `crypto`)
//! - [`stream`]: Tokio runtime (requires `runtime`)
//!
//! ## Example
//!
//! ```no_run
//! use udpstream::prelude::*;
//!
//! # async fn run() -> Result<(), TransportError> {
//! let local = "0.0.0.0:40000".parse().unwrap();
//! let peer = "203.0.113.7:40000".parse().unwrap();
//! let mut stream =
//!     UdpStream::bind(local, peer, b"my secret", b"their secret", StreamConfig::default()).await?;
//!
//! stream.write_all(b"ping").await?;
//! stream.shutdown().await?;
//! let reply = stream.read_to_end().await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Authentication (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

// Transport engine (needs authentication)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod transport;

// Tokio runtime (feature-gated)
#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub mod stream;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        Consumer, FailReason, Producer, ProtocolViolation, StreamConfig, StreamConfigBuilder,
        StreamError,
    };

    #[cfg(feature = "crypto")]
    pub use crate::crypto::PacketKeys;

    #[cfg(feature = "crypto")]
    pub use crate::transport::{Connection, ConnectionPhase, ConnectionStats, Incoming};

    #[cfg(feature = "runtime")]
    pub use crate::stream::{StreamState, TransportError, TransportResult, UdpStream};
}

// Re-export commonly used items at crate root
pub use crate::core::{StreamConfig, StreamError};

#[cfg(feature = "crypto")]
pub use transport::{Connection, ConnectionPhase};

#[cfg(feature = "runtime")]
pub use stream::{TransportError, UdpStream};
