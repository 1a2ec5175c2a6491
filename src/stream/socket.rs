//! UDP socket bound to a single peer.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

/// Receive buffer size.
///
/// Large enough for any UDP datagram, so oversized datagrams are seen whole
/// and rejected by the codec instead of being silently truncated.
pub const RECV_BUFFER_SIZE: usize = 65535;

/// Tokio UDP socket that only talks to one peer.
///
/// The socket is not `connect`ed: a NAT-traversed socket may be shared
/// with whatever punched the hole, so datagrams from other sources are
/// skipped rather than refused by the kernel.
#[derive(Debug)]
pub struct DatagramSocket {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl DatagramSocket {
    /// Bind a new socket to `local` for talking to `peer`.
    pub async fn bind(local: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::new(socket, peer))
    }

    /// Wrap an already bound socket.
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Get the peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Wait for the next datagram from the peer.
    ///
    /// Returns its length in `buf`.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (len, from) = self.socket.recv_from(buf).await?;
            if from == self.peer {
                return Ok(len);
            }
            tracing::trace!(%from, len, "ignoring datagram from unexpected source");
        }
    }

    /// Try to send a datagram to the peer without blocking.
    ///
    /// Returns `Ok(false)` if the socket is not writable right now.
    pub fn try_send(&self, datagram: &[u8]) -> io::Result<bool> {
        match self.socket.try_send_to(datagram, self.peer) {
            Ok(_) => Ok(true),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Wait until the socket may be writable.
    pub async fn writable(&self) -> io::Result<()> {
        self.socket.writable().await
    }

    /// Get a reference to the underlying socket.
    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }

    /// Release the underlying socket.
    pub fn into_inner(self) -> UdpSocket {
        self.socket
    }
}
