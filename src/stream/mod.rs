//! Tokio runtime for [`Connection`](crate::transport::Connection).
//!
//! [`UdpStream::open`] spawns a driver task that owns the UDP socket and the
//! connection. The task waits on the socket, the handle's commands and the
//! connection's next deadline, and feeds each event to the connection:
//!
//! ```text
//!   UdpStream ──Command──▶ ┌────────┐ ◀──datagrams──▶ DatagramSocket
//!   (handle)  ◀─Inbound─── │ Driver │
//!             ◀─state───── └────────┘ ──sleep_until(next_deadline)
//! ```

mod driver;
mod error;
mod handle;
mod socket;

pub use error::{TransportError, TransportResult};
pub use handle::{StreamState, UdpStream};
pub use socket::{DatagramSocket, RECV_BUFFER_SIZE};
