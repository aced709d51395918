mod config;
mod connection;
mod dispatch;
mod error;
mod event;
mod peer;
mod protocol;
mod scheduler;
mod server;
mod stats;
mod window;

pub use config::TransportConfig;
pub use connection::{Connection, ConnectionState};
pub use dispatch::Dispatcher;
pub use error::{ProtocolError, TransportError};
pub use event::{DisconnectReason, EventQueue, TransportEvent};
pub use peer::Peer;
pub use protocol::{
    DATAGRAM_SIZE, DEFAULT_PORT, Direction, Disconnect, FIRST_FRAGMENT_BITS, FRAGMENT_BITS,
    Handshake, MAX_MESSAGE_BITS, Message, Nack, Ping, Pong, encode_message, sequence_greater_than,
};
pub use scheduler::{Scheduler, TaskId};
pub use server::Server;
pub use stats::{BandwidthSample, NetworkStats, PacketLossSimulation, RttEstimator};
pub use window::{Datagram, ReceiveOutcome, ReceiveWindow, SendWindow};
