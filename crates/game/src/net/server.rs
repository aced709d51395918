use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::config::TransportConfig;
use super::connection::ConnectionState;
use super::dispatch::Dispatcher;
use super::error::TransportError;
use super::event::{DisconnectReason, EventQueue, TransportEvent};
use super::peer::{Peer, PeerSignal, receive_loop};
use super::protocol::{Direction, Message, is_handshake};
use crate::bits::BitBuffer;

type PeerMap = Mutex<HashMap<SocketAddr, Arc<Peer>>>;

/// Server side: one socket multiplexed across peers by remote address.
pub struct Server {
    local_addr: SocketAddr,
    peers: Arc<PeerMap>,
    events: Arc<EventQueue>,
    running: Arc<AtomicBool>,
    config: TransportConfig,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        dispatcher: Arc<Dispatcher>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(config.poll_timeout()))?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;

        let peers: Arc<PeerMap> = Arc::new(Mutex::new(HashMap::new()));
        let events = Arc::new(EventQueue::default());
        let running = Arc::new(AtomicBool::new(true));

        let listener = {
            let socket = Arc::clone(&socket);
            let peers = Arc::clone(&peers);
            let events = Arc::clone(&events);
            let running = Arc::clone(&running);
            let config = config.clone();
            thread::Builder::new()
                .name(format!("strata-server-{local_addr}"))
                .spawn(move || {
                    let result = receive_loop(&socket, &running, |bytes, from| {
                        Self::on_datagram(
                            &socket,
                            &peers,
                            &events,
                            &dispatcher,
                            &config,
                            bytes,
                            from,
                        );
                    });
                    if let Err(e) = result {
                        log::error!("server socket {local_addr} failed: {e}");
                        running.store(false, Ordering::Release);
                        let dropped: Vec<_> = peers.lock().drain().collect();
                        for (addr, peer) in dropped {
                            peer.set_state(ConnectionState::Disconnected);
                            events.push(TransportEvent::Disconnected {
                                addr,
                                reason: DisconnectReason::SocketError(e.to_string()),
                            });
                        }
                    }
                })?
        };

        log::info!("listening on {local_addr}");
        Ok(Self {
            local_addr,
            peers,
            events,
            running,
            config,
            listener: Mutex::new(Some(listener)),
        })
    }

    fn on_datagram(
        socket: &Arc<UdpSocket>,
        peers: &PeerMap,
        events: &EventQueue,
        dispatcher: &Dispatcher,
        config: &TransportConfig,
        bytes: &[u8],
        from: SocketAddr,
    ) {
        let known = peers.lock().get(&from).cloned();
        let peer = match known {
            Some(peer) => peer,
            None => {
                let body = BitBuffer::from_bytes(bytes);
                body.skip(32);
                if !is_handshake(&body) {
                    log::debug!("ignoring datagram from unknown {from}");
                    return;
                }
                let peer = Arc::new(Peer::new(
                    Arc::clone(socket),
                    from,
                    Direction::ClientToServer,
                    config,
                ));
                if let Err(e) = peer.send_handshake() {
                    log::warn!("handshake to {from} failed: {e}");
                    return;
                }
                peers.lock().insert(from, Arc::clone(&peer));
                peer
            }
        };

        for signal in peer.handle_datagram(bytes, dispatcher) {
            match signal {
                PeerSignal::Handshake => {
                    if peer.state() == ConnectionState::Connecting {
                        log::info!("{from} connected");
                        peer.set_state(ConnectionState::Connected);
                        events.push(TransportEvent::Connected(from));
                    }
                }
                PeerSignal::Disconnect => {
                    log::info!("{from} disconnected");
                    peer.set_state(ConnectionState::Disconnected);
                    peers.lock().remove(&from);
                    events.push(TransportEvent::Disconnected {
                        addr: from,
                        reason: DisconnectReason::Remote,
                    });
                }
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.peers.lock().get(addr).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .lock()
            .values()
            .filter(|peer| peer.is_connected())
            .count()
    }

    pub fn send_to<M: Message>(
        &self,
        addr: &SocketAddr,
        message: &M,
    ) -> Result<(), TransportError> {
        self.peer(addr)
            .ok_or(TransportError::NotConnected)?
            .send(message)
    }

    /// Sends to every connected peer; returns how many accepted it.
    pub fn broadcast<M: Message>(&self, message: &M) -> usize {
        let mut sent = 0;
        for peer in self.peers() {
            if !peer.is_connected() {
                continue;
            }
            match peer.send(message) {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("broadcast to {} failed: {e}", peer.remote_addr()),
            }
        }
        sent
    }

    pub fn kick(&self, addr: &SocketAddr) -> bool {
        let Some(peer) = self.peers.lock().remove(addr) else {
            return false;
        };
        log::info!("kicking {addr}");
        peer.send_disconnect();
        peer.set_state(ConnectionState::Disconnected);
        self.events.push(TransportEvent::Disconnected {
            addr: *addr,
            reason: DisconnectReason::Kicked,
        });
        true
    }

    pub fn set_drop_probability(&self, addr: &SocketAddr, probability: f32) -> bool {
        match self.peer(addr) {
            Some(peer) => {
                peer.set_drop_probability(probability);
                true
            }
            None => false,
        }
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.drain()
    }

    /// Heartbeats every peer and drops the ones that went quiet.
    pub fn tick(&self) {
        let timeout = self.config.connection_timeout();
        let timed_out: Vec<SocketAddr> = {
            let mut peers = self.peers.lock();
            let timed_out: Vec<SocketAddr> = peers
                .iter()
                .filter(|(_, peer)| peer.is_timed_out(timeout))
                .map(|(&addr, _)| addr)
                .collect();
            for addr in &timed_out {
                if let Some(peer) = peers.remove(addr) {
                    peer.set_state(ConnectionState::Disconnected);
                }
            }
            timed_out
        };
        for addr in timed_out {
            log::info!("{addr} timed out");
            self.events.push(TransportEvent::Disconnected {
                addr,
                reason: DisconnectReason::TimedOut,
            });
        }

        for peer in self.peers() {
            peer.heartbeat();
        }
    }

    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            for peer in self.peers() {
                peer.send_disconnect();
                peer.set_state(ConnectionState::Disconnected);
            }
            self.peers.lock().clear();
            log::info!("server on {} shut down", self.local_addr);
        }
        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::warn!("server receive thread panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("peers", &self.peers.lock().len())
            .finish()
    }
}
