use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::config::TransportConfig;
use super::connection::ConnectionState;
use super::dispatch::Dispatcher;
use super::error::{ProtocolError, TransportError};
use super::protocol::{
    DATAGRAM_SIZE, Direction, Disconnect, Handshake, Message, Nack, Ping, Pong, encode_message,
    is_handshake,
};
use super::stats::{
    BandwidthHistory, BandwidthSample, NetworkStats, PacketLossSimulation, RttEstimator,
    StatCounters,
};
use super::window::{ReceiveWindow, SendWindow};
use crate::bits::BitBuffer;

/// What a datagram asks of the endpoint that owns the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerSignal {
    Handshake,
    Disconnect,
}

/// One side of a connection: the remote address plus the send and receive
/// state for it. Sends from any thread are serialized by the send lock.
pub struct Peer {
    remote: SocketAddr,
    socket: Arc<UdpSocket>,
    direction: Direction,
    state: Mutex<ConnectionState>,
    send: Mutex<SendWindow>,
    receive: Mutex<ReceiveWindow>,
    counters: StatCounters,
    rtt: Mutex<RttEstimator>,
    bandwidth: Mutex<BandwidthHistory>,
    loss: PacketLossSimulation,
    last_receive: Mutex<Instant>,
    max_nack_range: u32,
    handshake_sequence: u32,
    epoch: Instant,
}

impl Peer {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        direction: Direction,
        config: &TransportConfig,
    ) -> Self {
        let initial_sequence = rand::random::<u32>();
        Self {
            remote,
            socket,
            direction,
            state: Mutex::new(ConnectionState::Connecting),
            send: Mutex::new(SendWindow::new(initial_sequence, config.retransmit_capacity)),
            receive: Mutex::new(ReceiveWindow::new(
                config.max_nack_range,
                config.retransmit_capacity,
            )),
            counters: StatCounters::default(),
            rtt: Mutex::new(RttEstimator::default()),
            bandwidth: Mutex::new(BandwidthHistory::default()),
            loss: PacketLossSimulation::new(config.drop_probability),
            last_receive: Mutex::new(Instant::now()),
            max_nack_range: config.max_nack_range,
            handshake_sequence: initial_sequence,
            epoch: Instant::now(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Direction of the messages this peer receives.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn send<M: Message>(&self, message: &M) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(TransportError::NotConnected);
        }
        self.send_payload(&encode_message(message), message.should_retransmit())
    }

    fn send_payload(&self, payload: &BitBuffer, retransmit: bool) -> Result<(), TransportError> {
        let mut window = self.send.lock();
        for datagram in window.prepare(payload, retransmit)? {
            self.transmit(&datagram.bytes)?;
        }
        Ok(())
    }

    fn transmit(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let sent = self.socket.send_to(bytes, self.remote)?;
        self.counters.record_sent(sent);
        Ok(())
    }

    /// Sends the stored datagrams for a NACKed range again.
    pub(crate) fn resend(&self, first: u32, count: u32) {
        let count = if count > self.max_nack_range {
            log::warn!(
                "{}: {}",
                self.remote,
                ProtocolError::NackRangeTooLarge { count }
            );
            self.max_nack_range
        } else {
            count
        };

        let window = self.send.lock();
        let datagrams = window.resend(first, count);
        log::debug!(
            "{}: nack for {first}+{count}, resending {}",
            self.remote,
            datagrams.len()
        );
        for datagram in &datagrams {
            match self.transmit(&datagram.bytes) {
                Ok(()) => {
                    self.counters.packets_resent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("{}: resend of {} failed: {e}", self.remote, datagram.sequence);
                }
            }
        }
    }

    fn request(&self, first: u32, count: u32) {
        if let Err(e) = self.send(&Nack { first, count }) {
            log::warn!("{}: failed to send nack: {e}", self.remote);
        }
    }

    pub(crate) fn handle_datagram(
        self: &Arc<Self>,
        bytes: &[u8],
        dispatcher: &Dispatcher,
    ) -> Vec<PeerSignal> {
        self.counters.record_received(bytes.len());
        *self.last_receive.lock() = Instant::now();

        let body = BitBuffer::from_bytes(bytes);
        let Some(sequence) = body.read::<u32>() else {
            log::warn!(
                "{}: {}",
                self.remote,
                ProtocolError::Malformed("datagram shorter than its sequence number")
            );
            return Vec::new();
        };

        let handshake = is_handshake(&body);
        let outcome = {
            let mut window = self.receive.lock();
            if window.is_initialized() && self.loss.should_drop() {
                log::debug!("{}: simulated loss of {sequence}", self.remote);
                window.lose(sequence)
            } else {
                window.receive(sequence, body)
            }
        };

        if outcome.duplicate {
            log::debug!("{}: duplicate datagram {sequence}", self.remote);
            self.counters
                .packets_duplicated
                .fetch_add(1, Ordering::Relaxed);
            // The remote is still retrying, so it never saw ours.
            if handshake {
                self.resend(self.handshake_sequence, 1);
            }
        }
        self.counters
            .packets_lost
            .fetch_add(u64::from(outcome.lost), Ordering::Relaxed);
        for error in &outcome.errors {
            log::warn!("{}: {error}", self.remote);
        }
        for (first, count) in outcome.nacks {
            log::debug!("{}: missing {first}+{count}", self.remote);
            self.request(first, count);
        }

        let mut signals = Vec::new();
        if outcome.handshake {
            signals.push(PeerSignal::Handshake);
        }
        for message in outcome.messages {
            if let Some(signal) = self.handle_message(&message, dispatcher) {
                signals.push(signal);
            }
        }
        signals
    }

    fn handle_message(
        self: &Arc<Self>,
        message: &BitBuffer,
        dispatcher: &Dispatcher,
    ) -> Option<PeerSignal> {
        let id = message.peek::<u32>()?;
        if id == Handshake::id() {
            return None;
        }
        if id == Disconnect::id() {
            return Some(PeerSignal::Disconnect);
        }
        if id == Nack::id() || id == Ping::id() || id == Pong::id() {
            message.skip(32);
            self.handle_control(id, message);
            return None;
        }

        match dispatcher.dispatch(message, self, self.direction) {
            Ok(()) => {}
            Err(ProtocolError::UnknownMessage(id)) => {
                log::debug!("{}: no handler for message {id:#010x}", self.remote);
            }
            Err(e) => log::warn!("{}: dropped message: {e}", self.remote),
        }
        None
    }

    fn handle_control(&self, id: u32, message: &BitBuffer) {
        if id == Nack::id() {
            if let Some(nack) = Nack::deserialize(message) {
                self.resend(nack.first, nack.count);
            }
        } else if id == Ping::id() {
            if let Some(ping) = Ping::deserialize(message) {
                if let Err(e) = self.send(&Pong {
                    sent_at_us: ping.sent_at_us,
                }) {
                    log::warn!("{}: failed to answer ping: {e}", self.remote);
                }
            }
        } else if let Some(pong) = Pong::deserialize(message) {
            let elapsed = self.now_us().saturating_sub(pong.sent_at_us);
            self.rtt.lock().update(Duration::from_micros(elapsed));
        }
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Must be the first message sent to the peer.
    pub(crate) fn send_handshake(&self) -> Result<(), TransportError> {
        self.send_payload(&encode_message(&Handshake), true)
    }

    pub(crate) fn resend_handshake(&self) {
        self.resend(self.handshake_sequence, 1);
    }

    pub(crate) fn send_disconnect(&self) {
        if let Err(e) = self.send_payload(&encode_message(&Disconnect), false) {
            log::debug!("{}: disconnect not sent: {e}", self.remote);
        }
    }

    /// Periodic upkeep: ping, re-request anything still missing and roll
    /// the bandwidth history.
    pub(crate) fn heartbeat(&self) {
        if self.state() == ConnectionState::Connecting {
            self.resend_handshake();
        }
        if self.is_connected() {
            if let Err(e) = self.send(&Ping {
                sent_at_us: self.now_us(),
            }) {
                log::warn!("{}: ping failed: {e}", self.remote);
            }
            let outstanding = self.receive.lock().outstanding();
            for (first, count) in outstanding {
                self.request(first, count);
            }
        }
        let totals = self.stats();
        self.bandwidth.lock().rollover(&totals);
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive.lock().elapsed() > timeout
    }

    pub fn stats(&self) -> NetworkStats {
        self.counters.snapshot(&self.rtt.lock())
    }

    pub fn bandwidth(&self) -> Vec<BandwidthSample> {
        self.bandwidth.lock().samples().copied().collect()
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_secs_f32(self.rtt.lock().srtt().max(0.0) / 1000.0)
    }

    pub fn drop_probability(&self) -> f32 {
        self.loss.drop_probability()
    }

    pub fn set_drop_probability(&self, probability: f32) {
        self.loss.set_drop_probability(probability);
    }

    pub fn next_sequence(&self) -> u32 {
        self.send.lock().next_sequence()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

/// Blocks on the socket with its read timeout until `running` clears,
/// handing each datagram to `on_datagram`.
pub(crate) fn receive_loop(
    socket: &UdpSocket,
    running: &AtomicBool,
    mut on_datagram: impl FnMut(&[u8], SocketAddr),
) -> io::Result<()> {
    let mut buffer = [0u8; DATAGRAM_SIZE];
    while running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buffer) {
            Ok((size, addr)) => on_datagram(&buffer[..size], addr),
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            // An ICMP port-unreachable from an earlier send.
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
