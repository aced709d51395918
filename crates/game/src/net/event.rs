use std::collections::VecDeque;
use std::net::SocketAddr;

use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side sent a disconnect.
    Remote,
    /// This side closed the connection.
    Local,
    TimedOut,
    Kicked,
    SocketError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(SocketAddr),
    Disconnected {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
}

/// Transport events waiting for the application to drain them.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<TransportEvent>>,
}

impl EventQueue {
    pub fn push(&self, event: TransportEvent) {
        self.events.lock().push_back(event);
    }

    pub fn drain(&self) -> Vec<TransportEvent> {
        self.events.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
