use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::config::TransportConfig;
use super::dispatch::Dispatcher;
use super::error::TransportError;
use super::event::{DisconnectReason, EventQueue, TransportEvent};
use super::peer::{Peer, PeerSignal, receive_loop};
use super::protocol::{Direction, Message};
use super::stats::NetworkStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client side of a connection: one socket, one peer and a receive thread
/// that runs until the connection is closed.
pub struct Connection {
    peer: Arc<Peer>,
    events: Arc<EventQueue>,
    connected: Arc<AtomicBool>,
    config: TransportConfig,
    local_addr: SocketAddr,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn connect(
        addr: &str,
        dispatcher: Arc<Dispatcher>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let remote = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress(addr.to_string()))?;
        let bind: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(config.poll_timeout()))?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;

        let peer = Arc::new(Peer::new(
            Arc::clone(&socket),
            remote,
            Direction::ServerToClient,
            &config,
        ));
        let events = Arc::new(EventQueue::default());
        let connected = Arc::new(AtomicBool::new(true));

        let receiver = {
            let peer = Arc::clone(&peer);
            let events = Arc::clone(&events);
            let connected = Arc::clone(&connected);
            thread::Builder::new()
                .name(format!("strata-client-{local_addr}"))
                .spawn(move || {
                    let result = receive_loop(&socket, &connected, |bytes, from| {
                        if from != remote {
                            log::debug!("ignoring datagram from {from}");
                            return;
                        }
                        for signal in peer.handle_datagram(bytes, &dispatcher) {
                            match signal {
                                PeerSignal::Handshake => {
                                    if peer.state() == ConnectionState::Connecting {
                                        log::info!("connected to {remote}");
                                        peer.set_state(ConnectionState::Connected);
                                        events.push(TransportEvent::Connected(remote));
                                    }
                                }
                                PeerSignal::Disconnect => {
                                    log::info!("{remote} closed the connection");
                                    peer.set_state(ConnectionState::Disconnected);
                                    connected.store(false, Ordering::Release);
                                    events.push(TransportEvent::Disconnected {
                                        addr: remote,
                                        reason: DisconnectReason::Remote,
                                    });
                                }
                            }
                        }
                    });
                    if let Err(e) = result {
                        log::warn!("socket error on connection to {remote}: {e}");
                        peer.set_state(ConnectionState::Disconnected);
                        connected.store(false, Ordering::Release);
                        events.push(TransportEvent::Disconnected {
                            addr: remote,
                            reason: DisconnectReason::SocketError(e.to_string()),
                        });
                    }
                })?
        };

        let connection = Self {
            peer,
            events,
            connected,
            config,
            local_addr,
            receiver: Mutex::new(Some(receiver)),
        };
        log::info!("connecting to {remote} from {local_addr}");
        connection.peer.send_handshake()?;
        Ok(connection)
    }

    pub fn state(&self) -> ConnectionState {
        self.peer.state()
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_connected()
    }

    /// Polls until the handshake completes or `timeout` passes.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            match self.state() {
                ConnectionState::Connected => return true,
                ConnectionState::Disconnected => return false,
                ConnectionState::Connecting => thread::sleep(Duration::from_millis(1)),
            }
        }
        self.is_connected()
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.peer.remote_addr()
    }

    pub fn send<M: Message>(&self, message: &M) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.peer.send(message)
    }

    pub fn stats(&self) -> NetworkStats {
        self.peer.stats()
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.drain()
    }

    /// Heartbeat and idle timeout; run it from a scheduler.
    pub fn tick(&self) {
        if !self.connected.load(Ordering::Acquire) {
            return;
        }
        if self.peer.is_timed_out(self.config.connection_timeout()) {
            log::info!("connection to {} timed out", self.remote_addr());
            self.close(DisconnectReason::TimedOut);
            return;
        }
        self.peer.heartbeat();
    }

    pub fn disconnect(&self) {
        self.close(DisconnectReason::Local);
    }

    fn close(&self, reason: DisconnectReason) {
        if self.connected.swap(false, Ordering::AcqRel) {
            if reason == DisconnectReason::Local {
                self.peer.send_disconnect();
            }
            self.peer.set_state(ConnectionState::Disconnected);
            self.events.push(TransportEvent::Disconnected {
                addr: self.remote_addr(),
                reason,
            });
        }
        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::warn!("receive thread for {} panicked", self.remote_addr());
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr)
            .field("peer", &self.peer)
            .finish()
    }
}
