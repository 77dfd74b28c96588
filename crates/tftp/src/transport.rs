//! Per-transfer UDP transport
//!
//! A [`Connection`] owns the one UDP socket a transfer runs on. It locks onto
//! the first endpoint that answers, retransmits through a [`Retransmitter`]
//! and tracks the transfer lifecycle as an explicit [`State`].
//!
//! The window engines never touch the socket: they talk to the
//! [`Transport`] trait, which the connection implements and which tests can
//! implement in memory. The client and server drivers plug into the shared
//! event loop in [`run`], which multiplexes datagrams, the retransmission
//! deadline, local input and the abort signal, handling one event at a time.

use std::collections::VecDeque;
use std::future::pending;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::{Instant, sleep_until};

use crate::abort::AbortSignal;
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{Packet, build_ack, build_data, build_error, build_error_kind};
use crate::retransmitter::{Expiry, Retransmitter};
use crate::stream::{Sink, Source};
use crate::writer::Writer;

/// Largest datagram a peer can legally send: a DATA packet at the maximum
/// block size
const RECV_BUFFER_LEN: usize = 65536;

/// Capabilities the window engines need from a transport
pub trait Transport {
    /// Send one DATA packet
    fn send_block(&mut self, block: u16, data: &Bytes);

    /// Send one ACK packet
    fn send_ack(&mut self, block: u16);

    /// Hand received payload to the local side, in order
    fn deliver(&mut self, data: Bytes);

    /// Start the retransmission timer over from now
    fn arm_timer(&mut self);

    /// Finish the transfer
    fn close(&mut self, result: Result<()>);

    /// Send an ERROR for `kind` and finish with it
    fn fail(&mut self, kind: ErrorKind);

    /// Cancel locally, telling the peer why
    fn abort(&mut self, reason: Option<&str>);

    fn is_closed(&self) -> bool;
}

/// Transfer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// RRQ/WRQ sent, waiting for the first reply
    RequestSent,
    /// OACK sent by the server, waiting for the client to take it
    OackSent,
    /// Last message sent was an ACK
    AckSent,
    /// Last message sent was a DATA block
    BlockSent,
    Closed,
    Aborted,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted | Self::Failed)
    }
}

/// What the local byte sink has to see, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Size(Option<u64>),
    Data(Bytes),
}

/// Create an ephemeral UDP socket appropriate for the peer address family
pub async fn bind_ephemeral(peer: SocketAddr, local_bind: Option<IpAddr>) -> io::Result<UdpSocket> {
    let bind_addr = match (local_bind, peer) {
        (Some(ip), _) => SocketAddr::new(ip, 0),
        (None, SocketAddr::V4(_)) => SocketAddr::from(([0, 0, 0, 0], 0)),
        (None, SocketAddr::V6(_)) => SocketAddr::from(([0u16; 8], 0)),
    };

    let sock = UdpSocket::bind(bind_addr).await?;
    tracing::debug!("Transfer socket bound to {}", sock.local_addr()?);
    Ok(sock)
}

/// One transfer's socket and state machine
#[derive(Debug)]
pub struct Connection {
    socket: UdpSocket,
    local_addr: SocketAddr,
    /// Where requests go until someone answers
    target: SocketAddr,
    /// The transfer identifier, fixed by the first reply
    peer: Option<SocketAddr>,
    retransmitter: Retransmitter,
    /// Message resent on timeout while negotiating
    pending: Option<Bytes>,
    state: State,
    outcome: Option<Result<()>>,
    outbox: VecDeque<Delivery>,
    /// Datagrams waiting for [`Connection::transmit`], in send order
    outgoing: VecDeque<(Bytes, SocketAddr)>,
}

impl Connection {
    /// Wrap a bound socket that will talk to `target`
    pub fn new(socket: UdpSocket, target: SocketAddr, retries: u32, timeout: Duration) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            target,
            peer: None,
            retransmitter: Retransmitter::new(retries, timeout),
            pending: None,
            state: State::RequestSent,
            outcome: None,
            outbox: VecDeque::new(),
            outgoing: VecDeque::new(),
        })
    }

    /// Wrap a socket already dedicated to a known peer (server side)
    pub fn locked(socket: UdpSocket, peer: SocketAddr, retries: u32, timeout: Duration) -> io::Result<Self> {
        let mut conn = Self::new(socket, peer, retries, timeout)?;
        conn.peer = Some(peer);
        conn.state = State::OackSent;
        Ok(conn)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The locked peer, or the request target before anyone answered
    pub fn remote_addr(&self) -> SocketAddr {
        self.peer.unwrap_or(self.target)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.retransmitter.set_timeout(timeout);
    }

    fn send_to(&mut self, buf: Bytes, dest: SocketAddr) {
        self.outgoing.push_back((buf, dest));
    }

    fn send(&mut self, buf: Bytes) {
        let dest = self.remote_addr();
        self.send_to(buf, dest);
    }

    /// Put every queued datagram on the wire
    ///
    /// A failed send is logged and otherwise left to the retransmission
    /// timer.
    pub async fn transmit(&mut self) {
        while let Some((buf, dest)) = self.outgoing.pop_front() {
            if let Err(e) = self.socket.send_to(&buf, dest).await {
                tracing::debug!("Send to {} failed: {}", dest, e);
            }
        }
    }

    /// Check the sender of an inbound datagram against the locked peer
    ///
    /// The first sender becomes the peer. Anyone else gets an `ESOCKET`
    /// error and is otherwise ignored.
    pub fn accept_from(&mut self, from: SocketAddr) -> bool {
        match self.peer {
            None => {
                tracing::debug!("Transfer locked onto {}", from);
                self.peer = Some(from);
                true
            }
            Some(peer) if peer == from => true,
            Some(_) => {
                tracing::debug!("Rejecting datagram from foreign endpoint {}", from);
                self.send_to(build_error_kind(ErrorKind::Socket), from);
                false
            }
        }
    }

    /// Forget the peer so the next request goes to the original target
    pub fn unlock_peer(&mut self) {
        self.peer = None;
    }

    /// Send a negotiation message and keep it for retransmission
    pub fn send_pending(&mut self, buf: Bytes) {
        if self.state.is_terminal() {
            return;
        }
        self.send(buf.clone());
        self.pending = Some(buf);
        self.retransmitter.refill();
        self.retransmitter.restart();
    }

    /// Resend the kept negotiation message
    pub fn resend_pending(&mut self) {
        if let Some(buf) = self.pending.clone() {
            self.send(buf);
        }
    }

    /// Negotiation is over; nothing left to resend on its behalf
    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Valid traffic from the peer restores the retry budget
    ///
    /// The deadline is left alone; engines restart it when the transfer
    /// moves forward.
    pub fn refill_retries(&mut self) {
        self.retransmitter.refill();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.retransmitter.deadline()
    }

    /// Queue the total size announcement for the local sink
    pub fn declare_size(&mut self, size: Option<u64>) {
        self.outbox.push_back(Delivery::Size(size));
    }

    pub fn take_delivery(&mut self) -> Option<Delivery> {
        self.outbox.pop_front()
    }

    /// Send one error and finish with a possibly different local error
    ///
    /// Used for the size guard, which answers `EDENY` but reports `EFBIG`.
    pub fn reject(&mut self, sent: ErrorKind, reported: ErrorKind) {
        if self.state.is_terminal() {
            return;
        }
        self.send(build_error_kind(sent));
        self.close(Err(reported.into()));
    }

    /// Queue an ERROR that mirrors `err`, leaving the state alone
    pub fn notify(&mut self, err: &Error) {
        let buf = match err {
            Error::Remote { code, message } => build_error(*code, message),
            Error::Aborted(reason) => build_error(0, reason),
            other => build_error_kind(other.kind().unwrap_or(ErrorKind::Io)),
        };
        self.send(buf);
    }

    /// The local byte stream failed: tell the peer `EIO`, report the cause
    ///
    /// A transfer that already completed on the wire is turned into a
    /// failure as long as its last datagrams are still queued, so the peer
    /// sees `EIO` instead of the final ACK.
    pub fn fail_io(&mut self, err: io::Error) {
        tracing::debug!("Local stream failed: {}", err);
        match self.state {
            State::Aborted | State::Failed => {}
            State::Closed => {
                self.outgoing.clear();
                self.send(build_error_kind(ErrorKind::Io));
                self.state = State::Failed;
                self.outcome = Some(Err(Error::Io(err)));
            }
            _ => {
                self.send(build_error_kind(ErrorKind::Io));
                self.close(Err(Error::Io(err)));
            }
        }
    }

    /// Final result, once the state is terminal
    pub fn take_outcome(&mut self) -> Result<()> {
        self.outcome.take().unwrap_or(Ok(()))
    }

    fn on_expired(&mut self) -> Expiry {
        let expiry = self.retransmitter.on_expired();
        if expiry == Expiry::Exhausted {
            tracing::debug!("Retries exhausted talking to {}", self.remote_addr());
            self.close(Err(ErrorKind::Time.into()));
        }
        expiry
    }
}

impl Transport for Connection {
    fn send_block(&mut self, block: u16, data: &Bytes) {
        if self.state.is_terminal() {
            return;
        }
        self.send(build_data(block, data));
        self.state = State::BlockSent;
    }

    fn send_ack(&mut self, block: u16) {
        if self.state.is_terminal() {
            return;
        }
        self.send(build_ack(block));
        self.state = State::AckSent;
    }

    fn deliver(&mut self, data: Bytes) {
        self.outbox.push_back(Delivery::Data(data));
    }

    fn arm_timer(&mut self) {
        if !self.state.is_terminal() {
            self.retransmitter.restart();
        }
    }

    fn close(&mut self, result: Result<()>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = if result.is_ok() { State::Closed } else { State::Failed };
        self.outcome = Some(result);
        self.pending = None;
        self.retransmitter.disarm();
    }

    fn fail(&mut self, kind: ErrorKind) {
        if self.state.is_terminal() {
            return;
        }
        self.send(build_error_kind(kind));
        self.close(Err(kind.into()));
    }

    fn abort(&mut self, reason: Option<&str>) {
        if self.state.is_terminal() {
            return;
        }
        let reason = reason.unwrap_or(ErrorKind::Abort.message());
        self.send(build_error(0, reason));
        self.state = State::Aborted;
        self.outcome = Some(Err(Error::Aborted(reason.to_string())));
        self.pending = None;
        self.retransmitter.disarm();
    }

    fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Protocol logic plugged into [`run`]
pub(crate) trait Driver {
    /// A decoded packet from the locked peer
    fn on_packet(&mut self, conn: &mut Connection, packet: Packet);

    /// The retransmission deadline passed with retries left
    fn on_timeout(&mut self, conn: &mut Connection);

    /// The outbound engine, once one is running
    fn writer(&mut self) -> Option<&mut Writer>;
}

/// Local ends of a transfer
pub(crate) struct Endpoints<'a> {
    pub source: Option<&'a mut (dyn Source + 'a)>,
    pub sink: Option<&'a mut (dyn Sink + 'a)>,
    pub abort: Option<AbortSignal>,
}

async fn wait_abort(signal: &mut Option<AbortSignal>) -> String {
    match signal {
        Some(signal) => signal.aborted().await,
        None => pending().await,
    }
}

async fn read_input<D: Driver>(source: &mut Option<&mut (dyn Source + '_)>, driver: &mut D) -> io::Result<usize> {
    match (source.as_deref_mut(), driver.writer()) {
        (Some(source), Some(writer)) => source.read_buf(writer.input()).await,
        _ => pending().await,
    }
}

/// Drive one transfer until it reaches a terminal state
///
/// Each loop turn handles exactly one event, writes whatever the engines
/// delivered into the sink and only then puts the queued datagrams on the
/// wire. The last ACK of a transfer therefore leaves once its payload is
/// flushed, and a sink failure replaces it with `EIO`.
pub(crate) async fn run<D: Driver>(conn: &mut Connection, driver: &mut D, mut ends: Endpoints<'_>) -> Result<()> {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    if let Some(signal) = &ends.abort
        && let Some(reason) = signal.reason()
    {
        conn.abort(Some(&reason));
    }
    conn.transmit().await;

    while !conn.is_closed() {
        let deadline = conn.deadline();
        let needs_input = ends.source.is_some() && driver.writer().is_some_and(|w| w.needs_input());

        tokio::select! {
            received = conn.socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    if conn.accept_from(from) {
                        conn.refill_retries();
                        match Packet::parse(Bytes::copy_from_slice(&buf[..n])) {
                            Ok(packet) => {
                                tracing::debug!("Received {} from {}", packet.opcode(), from);
                                driver.on_packet(conn, packet);
                            }
                            Err(e) => {
                                tracing::debug!("Undecodable datagram from {}: {}", from, e);
                                conn.fail(e.kind().unwrap_or(ErrorKind::BadMsg));
                            }
                        }
                    }
                }
                // ICMP unreachable and friends surface here; keep waiting
                Err(e) => tracing::debug!("Receive failed: {}", e),
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if conn.on_expired() == Expiry::Retry {
                    tracing::debug!("Timeout, retransmitting to {}", conn.remote_addr());
                    driver.on_timeout(conn);
                }
            }
            read = read_input(&mut ends.source, driver), if needs_input => {
                if let Some(writer) = driver.writer() {
                    match read {
                        Ok(0) => writer.finish_input(conn),
                        Ok(_) => writer.on_input(conn),
                        Err(e) => conn.fail_io(e),
                    }
                }
            }
            reason = wait_abort(&mut ends.abort) => {
                conn.abort(Some(&reason));
                ends.abort = None;
            }
        }

        write_deliveries(conn, &mut ends.sink).await;
        if conn.state() == State::Closed
            && let Some(sink) = ends.sink.as_deref_mut()
            && let Err(e) = sink.flush().await
        {
            conn.fail_io(e);
        }
        conn.transmit().await;
    }

    let result = conn.take_outcome();
    if let Err(err) = &result {
        if let Some(sink) = ends.sink.as_deref_mut() {
            sink.abort(err).await;
        }
        if let Some(source) = ends.source.as_deref_mut() {
            source.abort(err).await;
        }
    }
    result
}

/// Push queued deliveries into the sink, failing the transfer on error
async fn write_deliveries(conn: &mut Connection, sink: &mut Option<&mut (dyn Sink + '_)>) {
    while let Some(delivery) = conn.take_delivery() {
        let Some(sink) = sink.as_deref_mut() else {
            continue;
        };
        match delivery {
            Delivery::Size(size) => sink.declare_size(size),
            Delivery::Data(data) => {
                if let Err(e) = sink.write_all(&data).await {
                    conn.fail_io(e);
                    return;
                }
            }
        }
    }
}
