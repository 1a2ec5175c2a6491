//! Connection driver task.
//!
//! One task per stream owns the socket and the [`Connection`]. Application
//! calls arrive as [`Command`]s over a channel; inbound bytes leave through
//! the [`ChannelConsumer`]. Every connection entry point therefore runs on
//! the same task, one event at a time.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch, Notify};

use crate::core::{Consumer, FailReason, Producer, StreamError};
use crate::transport::{Connection, ConnectionPhase, ConnectionStats};

use super::handle::StreamState;
use super::socket::{DatagramSocket, RECV_BUFFER_SIZE};

/// Request from the handle to the driver.
pub(crate) enum Command {
    Write {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<usize, StreamError>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Abort,
    Stats {
        reply: oneshot::Sender<ConnectionStats>,
    },
}

/// Inbound stream event delivered to the handle.
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Vec<u8>),
    End,
    Abort,
}

/// Bytes delivered to the handle but not yet read, shared with the handle.
///
/// The consumer limit is the read budget minus this, so the unbounded
/// inbound channel never holds more than one budget's worth of data.
#[derive(Debug, Clone, Default)]
pub(crate) struct Credit {
    pub(crate) queued: Arc<AtomicUsize>,
    pub(crate) notify: Arc<Notify>,
}

impl Credit {
    /// The handle read `n` bytes.
    pub(crate) fn release(&self, n: usize) {
        self.queued.fetch_sub(n, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn remaining(&self, budget: usize) -> usize {
        budget.saturating_sub(self.queued.load(Ordering::SeqCst))
    }
}

/// Forwards inbound bytes to the handle.
pub(crate) struct ChannelConsumer {
    pub(crate) tx: mpsc::UnboundedSender<Inbound>,
    pub(crate) credit: Credit,
    pub(crate) budget: usize,
}

impl Consumer for ChannelConsumer {
    fn consume(&mut self, data: &[u8]) -> Result<usize, StreamError> {
        self.tx
            .send(Inbound::Data(data.to_vec()))
            .map_err(|_| StreamError::NotAttached)?;
        self.credit.queued.fetch_add(data.len(), Ordering::SeqCst);
        Ok(self.credit.remaining(self.budget))
    }

    fn end_of_input(&mut self, clean: bool) {
        let event = if clean { Inbound::End } else { Inbound::Abort };
        let _ = self.tx.send(event);
    }

    fn abort(&mut self) {
        let _ = self.tx.send(Inbound::Abort);
    }
}

/// Records the send capacity the connection announces.
pub(crate) struct ChannelProducer {
    pub(crate) capacity: Arc<AtomicUsize>,
}

impl Producer for ChannelProducer {
    fn can_produce(&mut self, limit: usize) {
        self.capacity.store(limit, Ordering::SeqCst);
    }

    fn abort(&mut self) {
        self.capacity.store(0, Ordering::SeqCst);
    }
}

struct PendingWrite {
    data: Vec<u8>,
    reply: oneshot::Sender<Result<usize, StreamError>>,
}

pub(crate) struct Driver {
    conn: Connection,
    socket: DatagramSocket,
    buf: Vec<u8>,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    state: watch::Sender<StreamState>,
    credit: Credit,
    budget: usize,
    capacity: Arc<AtomicUsize>,
    /// Datagram that hit a full socket buffer.
    stash: Option<Vec<u8>>,
    /// Write waiting for send buffer space.
    parked: Option<PendingWrite>,
}

impl Driver {
    pub(crate) fn new(
        conn: Connection,
        socket: DatagramSocket,
        commands: mpsc::Receiver<Command>,
        state: watch::Sender<StreamState>,
        credit: Credit,
        budget: usize,
        capacity: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            conn,
            socket,
            buf: vec![0u8; RECV_BUFFER_SIZE],
            commands,
            commands_open: true,
            state,
            credit,
            budget,
            capacity,
            stash: None,
            parked: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            if let Err(err) = self.transmit() {
                tracing::warn!(%err, peer = %self.socket.peer(), "send failed");
                self.conn.handle_io_error(&err);
                let _ = self.transmit();
            }
            self.retry_parked();
            self.publish();

            if self.conn.poll_release() {
                self.finish().await;
                return;
            }

            let deadline = self.conn.next_deadline();
            let sleep = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                result = self.socket.recv(&mut self.buf) => match result {
                    Ok(len) => {
                        self.conn.handle_datagram(Instant::now(), &self.buf[..len]);
                    }
                    Err(err) => {
                        tracing::warn!(%err, peer = %self.socket.peer(), "receive failed");
                        self.conn.handle_io_error(&err);
                    }
                },
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        // Handle dropped: finish the output cleanly.
                        self.commands_open = false;
                        let _ = self.conn.end_of_input(Instant::now(), true);
                    }
                },
                () = self.credit.notify.notified() => {
                    let limit = self.credit.remaining(self.budget);
                    self.conn.can_produce(Instant::now(), limit);
                },
                () = sleep => self.conn.handle_timeout(Instant::now()),
                result = self.socket.writable(), if self.stash.is_some() => {
                    if let Err(err) = result {
                        self.conn.handle_io_error(&err);
                    }
                },
            }
        }
    }

    fn transmit(&mut self) -> io::Result<()> {
        if let Some(datagram) = self.stash.take()
            && !self.socket.try_send(&datagram)?
        {
            self.stash = Some(datagram);
            return Ok(());
        }
        while let Some(datagram) = self.conn.poll_transmit() {
            if !self.socket.try_send(&datagram)? {
                self.stash = Some(datagram);
                break;
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Write { data, reply } => self.write(now, data, reply),
            Command::Shutdown { reply } => {
                let result = self.conn.end_of_input(now, true);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Abort => self.conn.abort_output(),
            Command::Stats { reply } => {
                let _ = reply.send(self.conn.stats());
            }
        }
    }

    fn write(
        &mut self,
        now: Instant,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<usize, StreamError>>,
    ) {
        let result = match self.conn.consume(now, &data) {
            Ok(_) => Ok(data.len()),
            Err(StreamError::BufferFull { accepted: 0 }) => {
                self.capacity.store(0, Ordering::SeqCst);
                self.parked = Some(PendingWrite { data, reply });
                return;
            }
            Err(StreamError::BufferFull { accepted }) => Ok(accepted),
            Err(err) => Err(err),
        };
        self.publish();
        let _ = reply.send(result);
    }

    fn retry_parked(&mut self) {
        if self.conn.is_closed() {
            if let Some(pending) = self.parked.take() {
                let _ = pending.reply.send(Err(StreamError::Failed));
            }
            return;
        }
        if self.capacity.load(Ordering::SeqCst) > 0
            && let Some(pending) = self.parked.take()
        {
            self.write(Instant::now(), pending.data, pending.reply);
        }
    }

    fn publish(&self) {
        let next = StreamState::of(&self.conn);
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                tracing::debug!(state = ?next, "stream state");
                *current = next;
                true
            }
        });
    }

    async fn finish(mut self) {
        if let Some(datagram) = self.stash.take()
            && self.socket.writable().await.is_ok()
        {
            let _ = self.socket.try_send(&datagram);
        }
        self.publish();
        tracing::debug!(peer = %self.socket.peer(), "driver finished");
    }
}

impl StreamState {
    pub(crate) fn of(conn: &Connection) -> Self {
        match conn.phase() {
            ConnectionPhase::Handshaking => StreamState::Connecting,
            ConnectionPhase::Established => StreamState::Established(conn.peer()),
            ConnectionPhase::Closing => StreamState::Closing,
            ConnectionPhase::Closed => StreamState::Closed,
            ConnectionPhase::Failed => StreamState::Failed(
                conn.fail_reason().cloned().unwrap_or(FailReason::LocalAbort),
            ),
        }
    }
}
