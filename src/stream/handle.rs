//! Async stream handle.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};

use crate::core::{FailReason, StreamConfig, StreamError};
use crate::crypto::PacketKeys;
use crate::transport::{Connection, ConnectionStats};

use super::driver::{ChannelConsumer, ChannelProducer, Command, Credit, Driver, Inbound};
use super::error::{TransportError, TransportResult};
use super::socket::DatagramSocket;

/// Depth of the command queue between the handle and its driver.
const COMMAND_QUEUE: usize = 32;

/// Externally visible connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for the peer's hello.
    Connecting,
    /// Validated with the given peer.
    Established(SocketAddr),
    /// At least one direction is closing.
    Closing,
    /// Both directions closed cleanly.
    Closed,
    /// The connection failed.
    Failed(FailReason),
}

impl StreamState {
    /// Closed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Failed(_))
    }
}

/// A reliable byte stream to one peer over a UDP socket.
///
/// Created with [`UdpStream::open`], which spawns a driver task owning the
/// socket. The handle talks to that task over channels.
///
/// Dropping the handle ends the output cleanly and stops reading. The driver
/// keeps running until the peer closes its side too, then releases the
/// socket.
///
/// # Example
///
/// ```no_run
/// use udpstream::prelude::*;
///
/// # async fn run() -> Result<(), TransportError> {
/// let socket = tokio::net::UdpSocket::bind("0.0.0.0:40000").await?;
/// let peer = "203.0.113.7:40000".parse().unwrap();
/// let mut stream = UdpStream::open(socket, peer, b"my secret", b"their secret", StreamConfig::default())?;
///
/// stream.established().await?;
/// stream.write_all(b"hello over udp").await?;
/// stream.shutdown().await?;
///
/// while let Some(chunk) = stream.read().await? {
///     println!("{} bytes", chunk.len());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct UdpStream {
    commands: mpsc::Sender<Command>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    state: watch::Receiver<StreamState>,
    credit: Credit,
    local_addr: SocketAddr,
    peer: SocketAddr,
    input_done: bool,
}

impl UdpStream {
    /// Start a stream over `socket` to `peer`.
    ///
    /// Both sides must use the same two secrets, each passing its own first.
    /// Must be called from within a Tokio runtime.
    pub fn open(
        socket: UdpSocket,
        peer: SocketAddr,
        local_secret: &[u8],
        peer_secret: &[u8],
        config: StreamConfig,
    ) -> TransportResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(io::Error::other)?;
        let local_addr = socket.local_addr()?;
        let budget = config.recv_buffer_size;
        let now = Instant::now();

        let mut conn = Connection::new(peer, PacketKeys::derive(local_secret, peer_secret), config, now)?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(StreamState::Connecting);
        let credit = Credit::default();
        let capacity = Arc::new(AtomicUsize::new(0));

        conn.attach_consumer(
            now,
            Box::new(ChannelConsumer {
                tx: inbound_tx,
                credit: credit.clone(),
                budget,
            }),
        )?;
        conn.attach_producer(
            now,
            Box::new(ChannelProducer {
                capacity: capacity.clone(),
            }),
        )?;
        conn.can_produce(now, budget);

        let driver = Driver::new(
            conn,
            DatagramSocket::new(socket, peer),
            commands_rx,
            state_tx,
            credit.clone(),
            budget,
            capacity,
        );
        runtime.spawn(driver.run());
        tracing::debug!(%local_addr, %peer, "stream opened");

        Ok(Self {
            commands: commands_tx,
            inbound: inbound_rx,
            state: state_rx,
            credit,
            local_addr,
            peer,
            input_done: false,
        })
    }

    /// Bind a new socket to `local` and start a stream to `peer`.
    pub async fn bind(
        local: SocketAddr,
        peer: SocketAddr,
        local_secret: &[u8],
        peer_secret: &[u8],
        config: StreamConfig,
    ) -> TransportResult<Self> {
        let socket = UdpSocket::bind(local).await?;
        Self::open(socket, peer, local_secret, peer_secret, config)
    }

    /// Wait until both hello tokens have been exchanged.
    pub async fn established(&mut self) -> TransportResult<SocketAddr> {
        let state = match self
            .state
            .wait_for(|state| *state != StreamState::Connecting)
            .await
        {
            Ok(state) => (*state).clone(),
            Err(_) => return Err(TransportError::Closed),
        };
        match state {
            StreamState::Established(peer) => Ok(peer),
            StreamState::Failed(reason) => Err(TransportError::ConnectionFailed(reason)),
            StreamState::Connecting | StreamState::Closing | StreamState::Closed => Ok(self.peer),
        }
    }

    /// Queue bytes for sending.
    ///
    /// Waits while the send buffer is full, then returns how many bytes were
    /// taken (at least one unless `data` is empty).
    pub async fn write(&mut self, data: &[u8]) -> TransportResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let (reply, rx) = oneshot::channel();
        let command = Command::Write {
            data: data.to_vec(),
            reply,
        };
        if self.commands.send(command).await.is_err() {
            return Err(self.terminal_error().await);
        }
        match rx.await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(StreamError::Failed)) | Err(_) => Err(self.terminal_error().await),
            Ok(Err(err)) => Err(err.into()),
        }
    }

    /// Queue all of `data` for sending.
    pub async fn write_all(&mut self, mut data: &[u8]) -> TransportResult<()> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Receive the next chunk of the inbound stream.
    ///
    /// Returns `Ok(None)` once the peer has closed its output and every byte
    /// was read.
    pub async fn read(&mut self) -> TransportResult<Option<Vec<u8>>> {
        if self.input_done {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(Inbound::Data(chunk)) => {
                self.credit.release(chunk.len());
                Ok(Some(chunk))
            }
            Some(Inbound::End) => {
                self.input_done = true;
                Ok(None)
            }
            Some(Inbound::Abort) | None => Err(self.terminal_error().await),
        }
    }

    /// Read until the peer closes its output.
    pub async fn read_to_end(&mut self) -> TransportResult<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(chunk) = self.read().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// End the output cleanly once everything queued is delivered.
    ///
    /// Reading continues to work until the peer closes its side.
    pub async fn shutdown(&mut self) -> TransportResult<()> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_err() {
            return Err(self.terminal_error().await);
        }
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(StreamError::Failed)) | Err(_) => Err(self.terminal_error().await),
            Ok(Err(err)) => Err(err.into()),
        }
    }

    /// Abort the connection. The peer is notified with FAIL.
    pub async fn abort(&mut self) {
        let _ = self.commands.send(Command::Abort).await;
    }

    /// Wait until both directions are closed.
    pub async fn closed(&mut self) -> TransportResult<()> {
        match self.terminal_state().await {
            Some(StreamState::Failed(reason)) => Err(TransportError::ConnectionFailed(reason)),
            _ => Ok(()),
        }
    }

    /// Snapshot of the connection counters.
    pub async fn stats(&mut self) -> TransportResult<ConnectionStats> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stats { reply }).await.is_err() {
            return Err(self.terminal_error().await);
        }
        rx.await.map_err(|_| TransportError::Closed)
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.state.borrow().clone()
    }

    /// Check if the connection is closed or failed.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn terminal_state(&mut self) -> Option<StreamState> {
        self.state
            .wait_for(StreamState::is_terminal)
            .await
            .ok()
            .map(|state| (*state).clone())
    }

    async fn terminal_error(&mut self) -> TransportError {
        match self.terminal_state().await {
            Some(StreamState::Failed(reason)) => TransportError::ConnectionFailed(reason),
            _ => TransportError::Closed,
        }
    }
}
