//! Connection state machine.
//!
//! A [`Connection`] owns every piece of per-peer state: both stream buffers,
//! the RTT estimator, the congestion window and the timer pool. It performs
//! no I/O. The owner feeds it datagrams and timer expiries, and drains the
//! datagrams it wants sent:
//!
//! ```text
//!  socket ──handle_datagram()──▶ ┌────────────┐ ──poll_transmit()──▶ socket
//!  timer  ──handle_timeout()───▶ │ Connection │ ──next_deadline()──▶ timer
//!  producer ──consume()────────▶ └────────────┘ ──Consumer::consume()──▶ consumer
//! ```
//!
//! All entry points take the current time explicitly and must be called from
//! a single task.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::core::{
    AuthError, ConfigError, Consumer, FailReason, Producer, ProtocolViolation, StreamConfig,
    StreamError, HANDSHAKE_WINDOW, HELLO_TOKEN, MAX_RTO,
};
use crate::crypto::PacketKeys;

use super::congestion::CongestionController;
use super::frame::{Packet, PacketFlags};
use super::recv::RecvBuffer;
use super::send::{AckOutcome, SendBuffer};
use super::timers::TimerManager;
use super::timing::RttEstimator;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Hello tokens not yet exchanged in both directions.
    Handshaking,
    /// Validated; data flows both ways.
    Established,
    /// Validated, and at least one direction has started closing.
    Closing,
    /// Both directions closed; the socket may be released.
    Closed,
    /// Aborted locally or by the peer.
    Failed,
}

/// What happened to an inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    /// Authenticated and processed (possibly failing the connection).
    Accepted,
    /// Failed authentication; no state changed.
    Dropped(AuthError),
    /// The connection is already closed or failed.
    Ignored,
}

/// Diagnostic hook invoked with the claimed source of each datagram that
/// fails authentication.
pub type AuthFailureHook = Box<dyn FnMut(SocketAddr) + Send>;

/// Snapshot of connection counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    /// Congestion window (segments).
    pub cwnd: f64,
    /// Slow-start threshold (segments).
    pub ssthresh: f64,
    /// Smoothed round-trip time.
    pub srtt: Duration,
    /// Current retransmission timeout.
    pub rto: Duration,
    /// Segments in flight.
    pub in_flight: usize,
    /// Application bytes acknowledged by the peer.
    pub bytes_acked: u64,
    /// Application bytes received in order.
    pub bytes_received: u64,
    /// Datagrams emitted.
    pub datagrams_sent: u64,
    /// Authenticated datagrams processed.
    pub datagrams_received: u64,
    /// Segment retransmissions.
    pub retransmissions: u64,
    /// Retransmission timer expiries.
    pub timeouts: u64,
    /// Datagrams dropped for failing authentication.
    pub auth_failures: u64,
}

#[derive(Debug, Clone, Copy)]
struct CloseTimer {
    sent_at: Instant,
    delay: Duration,
    retries: u32,
}

impl CloseTimer {
    fn deadline(&self) -> Instant {
        self.sent_at + self.delay
    }
}

/// Reliable, authenticated byte stream with one peer.
pub struct Connection {
    peer: SocketAddr,
    keys: PacketKeys,
    config: StreamConfig,
    phase: ConnectionPhase,

    send: SendBuffer,
    recv: RecvBuffer,
    rtt: RttEstimator,
    cc: CongestionController,
    timers: TimerManager,
    outbox: VecDeque<Vec<u8>>,

    /// Bytes of the peer's hello verified so far.
    hello_verified: usize,
    validated: bool,
    input_closed: bool,
    input_clean: bool,
    /// Input was aborted; inbound data is acknowledged and discarded.
    input_sink: bool,
    output_closed: bool,
    /// The peer's stream is complete; every packet carries ACK_CLOSE.
    peer_close_acked: bool,
    peer_failed: bool,
    failure: Option<FailReason>,
    release_pending: bool,

    force_ack: bool,
    force_resend: Option<u64>,
    close_timer: Option<CloseTimer>,
    persist_deadline: Option<Instant>,
    /// Ack number carried by the last datagram sent.
    recv_acked: u64,
    /// Window edge carried by the last datagram sent.
    advertised_edge: u64,

    consumer: Option<Box<dyn Consumer>>,
    consumer_limit: usize,
    producer: Option<Box<dyn Producer>>,
    announced: usize,
    auth_hook: Option<AuthFailureHook>,
    stats: ConnectionStats,
}

impl Connection {
    /// Create a connection and queue the hello token.
    ///
    /// The first datagram is ready in [`poll_transmit`](Self::poll_transmit)
    /// when this returns.
    pub fn new(
        peer: SocketAddr,
        keys: PacketKeys,
        config: StreamConfig,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut conn = Self {
            peer,
            keys,
            phase: ConnectionPhase::Handshaking,
            send: SendBuffer::new(config.send_buffer_size, HANDSHAKE_WINDOW),
            recv: RecvBuffer::new(config.recv_buffer_size, config.window_step, HANDSHAKE_WINDOW),
            rtt: RttEstimator::new(),
            cc: CongestionController::new(config.initial_cwnd, config.initial_ssthresh),
            timers: TimerManager::new(config.max_timers, config.timer_reduction),
            outbox: VecDeque::new(),
            hello_verified: 0,
            validated: false,
            input_closed: false,
            input_clean: false,
            input_sink: false,
            output_closed: false,
            peer_close_acked: false,
            peer_failed: false,
            failure: None,
            release_pending: false,
            force_ack: false,
            force_resend: None,
            close_timer: None,
            persist_deadline: None,
            recv_acked: 0,
            advertised_edge: HANDSHAKE_WINDOW,
            consumer: None,
            consumer_limit: 0,
            producer: None,
            announced: 0,
            auth_hook: None,
            stats: ConnectionStats::default(),
            config,
        };

        conn.send.push(HELLO_TOKEN);
        conn.flush(now);
        Ok(conn)
    }

    // ---------------------------------------------------------------------
    // Driver surface
    // ---------------------------------------------------------------------

    /// Process one datagram received from the peer.
    pub fn handle_datagram(&mut self, now: Instant, datagram: &[u8]) -> Incoming {
        if self.is_terminal() {
            return Incoming::Ignored;
        }

        let body = match self.keys.open(datagram) {
            Ok(body) => body,
            Err(err) => {
                self.stats.auth_failures += 1;
                tracing::warn!(peer = %self.peer, %err, len = datagram.len(), "dropping datagram");
                if let Some(hook) = self.auth_hook.as_mut() {
                    hook(self.peer);
                }
                return Incoming::Dropped(err);
            }
        };

        self.stats.datagrams_received += 1;
        let result = Packet::decode(body)
            .map_err(ProtocolViolation::from)
            .and_then(|packet| self.process(now, packet));
        match result {
            Ok(()) => self.flush(now),
            Err(violation) => self.fail(FailReason::Protocol(violation)),
        }
        Incoming::Accepted
    }

    /// Run whatever the timer pool says is due.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.is_terminal() {
            return;
        }
        self.timers.expire(now);

        // A lone window probe only backs off its own delay.
        let overdue = self.send.overdue(now);
        if !overdue.is_empty() && !self.send.is_probing() {
            self.cc.on_timeout(self.send.in_flight_len());
            let rto = self.rtt.backoff();
            self.stats.timeouts += 1;
            tracing::debug!(segments = overdue.len(), ?rto, "retransmission timeout");
        }
        for seq in overdue {
            if !self.retransmit(now, seq, MAX_RTO) {
                return;
            }
        }

        if self.close_deadline().is_some_and(|deadline| deadline <= now) && !self.retransmit_close(now) {
            return;
        }

        if self.persist_deadline.is_some_and(|deadline| deadline <= now) {
            self.persist_deadline = None;
            if let Some((seq, payload)) = self.send.probe_segment(now, self.rtt.rto()) {
                tracing::debug!(seq, "window probe");
                let flags = self.close_flag(seq + payload.len() as u64);
                self.emit(flags, seq, payload);
                if flags.is_close() {
                    self.note_close_sent(now);
                }
            }
        }

        self.flush(now);
    }

    /// A socket operation failed; the connection cannot continue.
    pub fn handle_io_error(&mut self, err: &io::Error) {
        self.fail(FailReason::Io(err.to_string()));
    }

    /// Next datagram to put on the wire.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.outbox.pop_front()
    }

    /// Datagrams waiting in the outbox.
    pub fn pending_transmits(&self) -> usize {
        self.outbox.len()
    }

    /// When [`handle_timeout`](Self::handle_timeout) should next be called.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_terminal() {
            None
        } else {
            self.timers.next_deadline()
        }
    }

    /// Returns `true` exactly once, after the connection closed or failed.
    ///
    /// The driver releases the socket when it sees this, after draining
    /// [`poll_transmit`](Self::poll_transmit).
    pub fn poll_release(&mut self) -> bool {
        std::mem::take(&mut self.release_pending)
    }

    // ---------------------------------------------------------------------
    // Outbound byte stream (the connection as a consumer)
    // ---------------------------------------------------------------------

    /// Queue outbound bytes.
    ///
    /// Returns the new production limit. If only part of `data` fits,
    /// returns [`StreamError::BufferFull`] with the number of bytes taken.
    pub fn consume(&mut self, now: Instant, data: &[u8]) -> Result<usize, StreamError> {
        if self.failure.is_some() {
            return Err(StreamError::Failed);
        }
        if self.output_closed || self.send.close_pos().is_some() {
            return Err(StreamError::OutputClosed);
        }

        let accepted = self.send.push(data);
        self.announced = self.send.headroom();
        self.flush(now);
        if accepted < data.len() {
            return Err(StreamError::BufferFull { accepted });
        }
        Ok(self.send_capacity())
    }

    /// The outbound stream ended. A clean end sends CLOSE once everything
    /// queued is delivered; an unclean one aborts the output.
    pub fn end_of_input(&mut self, now: Instant, clean: bool) -> Result<(), StreamError> {
        if self.failure.is_some() {
            return Err(StreamError::Failed);
        }
        if !clean {
            self.abort_output();
            return Ok(());
        }
        if self.send.close_pos().is_none() {
            let close_pos = self.send.finish();
            tracing::debug!(close_pos, "output finished");
            self.flush(now);
        }
        Ok(())
    }

    /// Abort the outbound stream.
    ///
    /// A byte stream cannot be truncated in place, so this fails the whole
    /// connection and notifies the peer with FAIL.
    pub fn abort_output(&mut self) {
        self.fail(FailReason::LocalAbort);
    }

    // ---------------------------------------------------------------------
    // Inbound byte stream (the connection as a producer)
    // ---------------------------------------------------------------------

    /// The attached consumer will accept up to `limit` more bytes.
    pub fn can_produce(&mut self, now: Instant, limit: usize) {
        self.consumer_limit = limit;
        self.flush(now);
    }

    /// Stop delivering inbound bytes.
    ///
    /// Buffered data is discarded and the consumer is aborted. Later inbound
    /// data is still acknowledged, then dropped, so the peer can finish.
    pub fn abort_input(&mut self, now: Instant) {
        if self.is_terminal() {
            return;
        }
        self.discard_input();
        self.flush(now);
    }

    fn discard_input(&mut self) {
        if self.input_sink {
            return;
        }
        tracing::debug!(peer = %self.peer, "input aborted");
        self.input_sink = true;
        self.recv.discard();
        if !self.input_closed {
            self.input_closed = true;
            self.input_clean = false;
            if let Some(consumer) = self.consumer.as_mut() {
                consumer.abort();
            }
        }
    }

    // ---------------------------------------------------------------------
    // Attachment
    // ---------------------------------------------------------------------

    /// Attach the downstream consumer of inbound bytes.
    ///
    /// Nothing is delivered until [`can_produce`](Self::can_produce) grants a
    /// limit.
    pub fn attach_consumer(
        &mut self,
        now: Instant,
        mut consumer: Box<dyn Consumer>,
    ) -> Result<(), StreamError> {
        if self.consumer.is_some() {
            return Err(StreamError::AlreadyAttached);
        }
        if self.failure.is_some() {
            consumer.abort();
            return Err(StreamError::Failed);
        }
        if self.validated {
            consumer.connection_established(self.peer);
        }
        if self.input_closed {
            if self.input_clean {
                consumer.end_of_input(true);
            } else {
                consumer.abort();
            }
        }
        self.consumer = Some(consumer);
        self.consumer_limit = 0;
        self.flush(now);
        Ok(())
    }

    /// Detach the consumer.
    pub fn detach_consumer(&mut self) -> Result<Box<dyn Consumer>, StreamError> {
        let consumer = self.consumer.take().ok_or(StreamError::NotAttached)?;
        self.consumer_limit = 0;
        Ok(consumer)
    }

    /// Attach the upstream producer of outbound bytes.
    pub fn attach_producer(
        &mut self,
        now: Instant,
        mut producer: Box<dyn Producer>,
    ) -> Result<(), StreamError> {
        if self.producer.is_some() {
            return Err(StreamError::AlreadyAttached);
        }
        if self.failure.is_some() {
            producer.abort();
            return Err(StreamError::Failed);
        }
        if self.validated {
            producer.connection_established(self.peer);
        }
        self.producer = Some(producer);
        self.announced = 0;
        self.flush(now);
        Ok(())
    }

    /// Detach the producer.
    pub fn detach_producer(&mut self) -> Result<Box<dyn Producer>, StreamError> {
        self.producer.take().ok_or(StreamError::NotAttached)
    }

    /// Install a hook called on every authentication failure.
    pub fn set_auth_failure_hook(&mut self, hook: AuthFailureHook) {
        self.auth_hook = Some(hook);
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        match self.phase {
            ConnectionPhase::Established
                if self.input_closed
                    || self.output_closed
                    || self.send.close_pos().is_some()
                    || self.recv.close_pos().is_some() =>
            {
                ConnectionPhase::Closing
            }
            phase => phase,
        }
    }

    /// Both hello tokens were exchanged.
    pub fn is_established(&self) -> bool {
        self.validated && !self.is_terminal()
    }

    /// Closed or failed.
    pub fn is_closed(&self) -> bool {
        self.is_terminal()
    }

    /// Why the connection failed, if it did.
    pub fn fail_reason(&self) -> Option<&FailReason> {
        self.failure.as_ref()
    }

    /// Inbound direction closed (cleanly or not).
    pub fn is_input_closed(&self) -> bool {
        self.input_closed
    }

    /// Outbound direction closed (cleanly or not).
    pub fn is_output_closed(&self) -> bool {
        self.output_closed
    }

    /// Peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Connection configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Outbound bytes that can be queued right now.
    ///
    /// Zero until the connection is validated.
    pub fn send_capacity(&self) -> usize {
        if self.validated && !self.is_terminal() {
            self.send.headroom()
        } else {
            0
        }
    }

    /// Next outbound stream position (`sbuf_pos`).
    pub fn send_pos(&self) -> u64 {
        self.send.next_seq()
    }

    /// Highest outbound position the peer acknowledged.
    pub fn send_acked(&self) -> u64 {
        self.send.acked()
    }

    /// Peer's advertised window edge.
    pub fn send_limit(&self) -> u64 {
        self.send.limit()
    }

    /// Next expected inbound position.
    pub fn recv_pos(&self) -> u64 {
        self.recv.contiguous_end()
    }

    /// Advertised receive window edge.
    pub fn recv_window_end(&self) -> u64 {
        self.recv.window_end()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ConnectionStats {
        let hello = HELLO_TOKEN.len() as u64;
        ConnectionStats {
            cwnd: self.cc.cwnd(),
            ssthresh: self.cc.ssthresh(),
            srtt: self.rtt.srtt(),
            rto: self.rtt.rto(),
            in_flight: self.send.in_flight_len(),
            bytes_acked: self.send.acked().saturating_sub(hello),
            bytes_received: self.recv.contiguous_end().saturating_sub(hello),
            ..self.stats.clone()
        }
    }

    // ---------------------------------------------------------------------
    // Inbound processing
    // ---------------------------------------------------------------------

    fn process(&mut self, now: Instant, packet: Packet) -> Result<(), ProtocolViolation> {
        tracing::trace!(
            seq = packet.seq,
            ack = packet.ack,
            window = packet.window,
            len = packet.payload.len(),
            flags = packet.flags.as_byte(),
            "recv"
        );

        if packet.flags.is_fail() {
            self.peer_failed = true;
            return Err(ProtocolViolation::PeerFailed);
        }

        let edge = packet.ack.saturating_add(packet.window);
        let previous_limit = self.send.limit();
        match self.send.on_ack(packet.ack, now)? {
            AckOutcome::Advanced { segments, rtt } => {
                if let Some(sample) = rtt {
                    self.rtt.update(sample);
                }
                self.rtt.reset_backoff();
                self.cc.on_ack();
                tracing::trace!(ack = packet.ack, segments, "acknowledged");
            }
            AckOutcome::Unchanged => {
                if self.send.is_probing() {
                    self.send.probe_acknowledged();
                }
                let in_flight = self.send.in_flight_len();
                if packet.payload.is_empty()
                    && edge == previous_limit
                    && in_flight > 0
                    && !self.send.is_probing()
                    && self.cc.on_duplicate_ack(in_flight)
                {
                    self.force_resend = self.send.oldest();
                }
            }
            AckOutcome::Stale => {}
        }
        if let Some(seq) = self.send.update_limit(edge) {
            self.force_resend = Some(seq);
        }

        if packet.flags.is_ack_close() && !self.output_closed {
            if self.close_timer.is_some() && self.send.is_drained() {
                self.output_closed = true;
                tracing::debug!(peer = %self.peer, "output closed");
            } else {
                return Err(ProtocolViolation::PrematureAckClose);
            }
        }

        if !packet.payload.is_empty() {
            let arrival = self.recv.insert(packet.seq, &packet.payload)?;
            if arrival.forces_ack() {
                self.force_ack = true;
            }
        }

        if packet.flags.is_close() {
            let close_pos = packet.end();
            if close_pos < HELLO_TOKEN.len() as u64 {
                return Err(ProtocolViolation::HelloMismatch);
            }
            if self.recv.record_close(close_pos)? {
                tracing::debug!(close_pos, "peer finished output");
            }
        }

        self.verify_hello()?;

        if !self.peer_close_acked && self.recv.close_complete() {
            self.peer_close_acked = true;
            self.force_ack = true;
        }

        self.check_validated();
        Ok(())
    }

    /// Check and strip the peer's hello from the front of the inbound stream.
    fn verify_hello(&mut self) -> Result<(), ProtocolViolation> {
        while self.hello_verified < HELLO_TOKEN.len() {
            let (head, _) = self.recv.peek();
            if head.is_empty() {
                break;
            }
            let expected = &HELLO_TOKEN[self.hello_verified..];
            let n = head.len().min(expected.len());
            if head[..n] != expected[..n] {
                return Err(ProtocolViolation::HelloMismatch);
            }
            self.recv.consume(n);
            self.hello_verified += n;
        }
        Ok(())
    }

    fn check_validated(&mut self) {
        if self.phase != ConnectionPhase::Handshaking
            || self.hello_verified < HELLO_TOKEN.len()
            || self.send.acked() == 0
        {
            return;
        }

        self.phase = ConnectionPhase::Established;
        self.validated = true;
        self.recv.update_window();
        self.force_ack = true;
        tracing::debug!(peer = %self.peer, "connection validated");

        if let Some(consumer) = self.consumer.as_mut() {
            consumer.connection_established(self.peer);
        }
        if let Some(producer) = self.producer.as_mut() {
            producer.connection_established(self.peer);
        }
    }

    fn deliver(&mut self) {
        if !self.validated {
            return;
        }
        if self.input_sink {
            self.recv.discard();
            self.recv.update_window();
            return;
        }
        if self.input_closed {
            return;
        }

        while self.consumer_limit > 0 {
            let Some(consumer) = self.consumer.as_mut() else {
                break;
            };
            let (head, _) = self.recv.peek();
            if head.is_empty() {
                break;
            }
            let n = head.len().min(self.consumer_limit);
            match consumer.consume(&head[..n]) {
                Ok(limit) => {
                    self.recv.consume(n);
                    self.consumer_limit = limit;
                }
                Err(err) => {
                    tracing::warn!(%err, "consumer rejected data");
                    self.discard_input();
                    return;
                }
            }
        }
        self.recv.update_window();

        if self.recv.is_finished() {
            self.input_closed = true;
            self.input_clean = true;
            tracing::debug!(peer = %self.peer, "input closed");
            if let Some(consumer) = self.consumer.as_mut() {
                consumer.end_of_input(true);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Outbound processing
    // ---------------------------------------------------------------------

    /// Deliver what can be delivered, send what can be sent, and rearm the
    /// timers.
    fn flush(&mut self, now: Instant) {
        if self.is_terminal() {
            return;
        }
        self.deliver();

        if let Some(seq) = self.force_resend.take()
            && !self.retransmit(now, seq, self.rtt.rto())
        {
            return;
        }

        let sent_before = self.stats.datagrams_sent;
        while self.cc.can_send(self.send.in_flight_len()) {
            let Some((seq, payload)) = self.send.next_segment(now, self.rtt.rto()) else {
                break;
            };
            let flags = self.close_flag(seq + payload.len() as u64);
            self.emit(flags, seq, payload);
            if flags.is_close() {
                self.note_close_sent(now);
            }
        }

        if let Some(close_pos) = self.send.close_pos()
            && self.close_timer.is_none()
            && self.send.unsent_len() == 0
            && close_pos == self.send.next_seq()
        {
            self.emit(PacketFlags::CLOSE, close_pos, Vec::new());
            self.note_close_sent(now);
        }

        if self.send.window_remaining() == 0
            && self.send.unsent_len() > 0
            && self.send.in_flight_len() == 0
        {
            self.persist_deadline.get_or_insert(now + self.rtt.rto());
        } else {
            self.persist_deadline = None;
        }

        let closing = self.input_closed && self.output_closed;
        if closing {
            self.force_ack = true;
        }
        if self.stats.datagrams_sent == sent_before && self.needs_ack() {
            self.emit(PacketFlags::NONE, self.send.next_seq(), Vec::new());
        }

        if closing {
            tracing::debug!(peer = %self.peer, "connection closed");
            self.phase = ConnectionPhase::Closed;
            self.timers.clear();
            self.persist_deadline = None;
            self.release_pending = true;
            return;
        }

        self.announce_capacity();
        self.schedule_next(now);
    }

    fn needs_ack(&self) -> bool {
        self.force_ack
            || self.recv.contiguous_end() != self.recv_acked
            || self.recv.window_end() != self.advertised_edge
    }

    fn close_flag(&self, end: u64) -> PacketFlags {
        if self.send.close_pos() == Some(end) {
            PacketFlags::CLOSE
        } else {
            PacketFlags::NONE
        }
    }

    fn note_close_sent(&mut self, now: Instant) {
        if self.close_timer.is_none() {
            self.close_timer = Some(CloseTimer {
                sent_at: now,
                delay: self.rtt.rto(),
                retries: 0,
            });
        }
    }

    /// CLOSE is only retransmitted on its own once no data is in flight;
    /// until then it rides on the final data segment.
    fn close_deadline(&self) -> Option<Instant> {
        if self.output_closed || self.send.in_flight_len() > 0 {
            return None;
        }
        self.close_timer.as_ref().map(CloseTimer::deadline)
    }

    fn retransmit(&mut self, now: Instant, seq: u64, cap: Duration) -> bool {
        let Some((payload, retries)) = self.send.resend(seq, now, cap) else {
            return true;
        };
        if retries > self.config.max_retries {
            self.fail(FailReason::RetriesExhausted);
            return false;
        }
        self.stats.retransmissions += 1;
        tracing::trace!(seq, retries, "retransmit");
        let flags = self.close_flag(seq + payload.len() as u64);
        self.emit(flags, seq, payload);
        true
    }

    fn retransmit_close(&mut self, now: Instant) -> bool {
        let (Some(mut timer), Some(close_pos)) = (self.close_timer, self.send.close_pos()) else {
            return true;
        };
        timer.retries += 1;
        if timer.retries > self.config.max_retries {
            self.fail(FailReason::RetriesExhausted);
            return false;
        }
        timer.delay = timer.delay.saturating_mul(2).min(MAX_RTO);
        timer.sent_at = now;
        self.close_timer = Some(timer);
        tracing::debug!(close_pos, retries = timer.retries, "retransmit close");
        self.emit(PacketFlags::CLOSE, close_pos, Vec::new());
        true
    }

    fn emit(&mut self, flags: PacketFlags, seq: u64, payload: Vec<u8>) {
        let flags = if self.peer_close_acked {
            flags.with_ack_close()
        } else {
            flags
        };
        let ack = self.recv.contiguous_end();
        let window_end = self.recv.window_end();
        let packet = Packet {
            flags,
            seq,
            ack,
            window: window_end.saturating_sub(ack),
            payload,
        };

        match packet.seal(&self.keys) {
            Ok(datagram) => {
                tracing::trace!(
                    seq,
                    ack,
                    window = packet.window,
                    len = packet.payload.len(),
                    flags = flags.as_byte(),
                    "send"
                );
                self.recv_acked = ack;
                self.advertised_edge = window_end;
                self.force_ack = false;
                self.stats.datagrams_sent += 1;
                self.outbox.push_back(datagram);
            }
            Err(err) => tracing::error!(%err, seq, "dropping unencodable datagram"),
        }
    }

    fn announce_capacity(&mut self) {
        if !self.validated || self.send.close_pos().is_some() {
            return;
        }
        let capacity = self.send.headroom();
        if capacity > self.announced
            && let Some(producer) = self.producer.as_mut()
        {
            producer.can_produce(capacity);
            self.announced = capacity;
        }
    }

    fn schedule_next(&mut self, now: Instant) {
        let deadline = [
            self.send.next_deadline(),
            self.close_deadline(),
            self.persist_deadline,
        ]
        .into_iter()
        .flatten()
        .min();
        if let Some(deadline) = deadline
            && let Some(id) = self.timers.schedule(now, deadline)
        {
            tracing::trace!(
                peer = %self.peer,
                ?id,
                delay = ?deadline.saturating_duration_since(now),
                pending = self.timers.len(),
                "timer armed"
            );
        }
    }

    // ---------------------------------------------------------------------
    // Failure
    // ---------------------------------------------------------------------

    fn is_terminal(&self) -> bool {
        matches!(self.phase, ConnectionPhase::Closed | ConnectionPhase::Failed)
    }

    fn fail(&mut self, reason: FailReason) {
        if self.is_terminal() {
            return;
        }
        match &reason {
            FailReason::LocalAbort => tracing::debug!(peer = %self.peer, "connection aborted"),
            reason => tracing::warn!(peer = %self.peer, %reason, "connection failed"),
        }

        self.outbox.clear();
        if !self.peer_failed {
            self.emit(PacketFlags::FAIL, self.send.next_seq(), Vec::new());
        }

        self.send.clear();
        self.recv.discard();
        self.timers.clear();
        self.force_resend = None;
        self.persist_deadline = None;

        if !self.input_closed
            && let Some(consumer) = self.consumer.as_mut()
        {
            consumer.abort();
        }
        if !self.output_closed
            && let Some(producer) = self.producer.as_mut()
        {
            producer.abort();
        }
        self.input_closed = true;
        self.output_closed = true;

        self.failure = Some(reason);
        self.phase = ConnectionPhase::Failed;
        self.release_pending = true;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("phase", &self.phase())
            .field("send_pos", &self.send.next_seq())
            .field("send_acked", &self.send.acked())
            .field("send_limit", &self.send.limit())
            .field("recv_pos", &self.recv.contiguous_end())
            .field("recv_window_end", &self.recv.window_end())
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}
