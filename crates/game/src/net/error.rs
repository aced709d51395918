use std::io;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("message of {bits} bits does not fit the frame")]
    MessageTooLarge { bits: usize },
    #[error("not connected")]
    NotConnected,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("needed {needed} bits, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unknown message type {0:#010x}")]
    UnknownMessage(u32),
    #[error("message declared {declared} bits but decoding consumed {consumed}")]
    LengthMismatch { declared: usize, consumed: usize },
    #[error("nack range of {count} sequences is too large")]
    NackRangeTooLarge { count: u32 },
    #[error("reorder buffer full, dropped datagram {sequence}")]
    ReorderOverflow { sequence: u32 },
    #[error("malformed datagram: {0}")]
    Malformed(&'static str),
}
