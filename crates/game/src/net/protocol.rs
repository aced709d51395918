use crate::bits::BitBuffer;
use crate::reflect::type_hash;

/// Largest datagram put on the wire, header included.
pub const DATAGRAM_SIZE: usize = 1300;
pub const DEFAULT_PORT: u16 = 27015;

pub const SEQUENCE_BITS: u32 = 32;
pub const LENGTH_BITS: u32 = 16;
pub const MESSAGE_ID_BITS: u32 = 32;

pub const DATAGRAM_BITS: usize = DATAGRAM_SIZE * 8;
/// Payload room in a message's first datagram, after sequence and length.
pub const FIRST_FRAGMENT_BITS: usize = DATAGRAM_BITS - (SEQUENCE_BITS + LENGTH_BITS) as usize;
/// Payload room in every following datagram.
pub const FRAGMENT_BITS: usize = DATAGRAM_BITS - SEQUENCE_BITS as usize;
/// The length prefix bounds a message, type id included.
pub const MAX_MESSAGE_BITS: usize = u16::MAX as usize;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// A logical message. On the wire its payload is the 32-bit [`id`](Message::id)
/// followed by whatever [`serialize`](Message::serialize) writes.
pub trait Message: Sized + Send + 'static {
    fn id() -> u32 {
        type_hash::<Self>()
    }

    fn serialize(&self, buffer: &BitBuffer);

    fn deserialize(buffer: &BitBuffer) -> Option<Self>;

    /// Whether a lost datagram of this message is sent again on NACK.
    /// Messages that are not retransmitted must fit a single datagram.
    fn should_retransmit(&self) -> bool {
        true
    }
}

pub fn encode_message<M: Message>(message: &M) -> BitBuffer {
    let buffer = BitBuffer::new();
    buffer.write(&M::id());
    message.serialize(&buffer);
    buffer
}

/// Opens the connection and fixes the sender's sequence baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Handshake;

impl Message for Handshake {
    fn serialize(&self, _buffer: &BitBuffer) {}

    fn deserialize(_buffer: &BitBuffer) -> Option<Self> {
        Some(Handshake)
    }
}

/// Requests `count` datagrams starting at `first`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nack {
    pub first: u32,
    pub count: u32,
}

impl Message for Nack {
    fn serialize(&self, buffer: &BitBuffer) {
        buffer.write(&self.first);
        buffer.write(&self.count);
    }

    fn deserialize(buffer: &BitBuffer) -> Option<Self> {
        Some(Nack {
            first: buffer.read()?,
            count: buffer.read()?,
        })
    }

    fn should_retransmit(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub sent_at_us: u64,
}

impl Message for Ping {
    fn serialize(&self, buffer: &BitBuffer) {
        buffer.write(&self.sent_at_us);
    }

    fn deserialize(buffer: &BitBuffer) -> Option<Self> {
        Some(Ping {
            sent_at_us: buffer.read()?,
        })
    }

    fn should_retransmit(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub sent_at_us: u64,
}

impl Message for Pong {
    fn serialize(&self, buffer: &BitBuffer) {
        buffer.write(&self.sent_at_us);
    }

    fn deserialize(buffer: &BitBuffer) -> Option<Self> {
        Some(Pong {
            sent_at_us: buffer.read()?,
        })
    }

    fn should_retransmit(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Disconnect;

impl Message for Disconnect {
    fn serialize(&self, _buffer: &BitBuffer) {}

    fn deserialize(_buffer: &BitBuffer) -> Option<Self> {
        Some(Disconnect)
    }

    fn should_retransmit(&self) -> bool {
        false
    }
}

/// True when a datagram body (positioned after the sequence number) starts
/// a handshake message.
pub fn is_handshake(body: &BitBuffer) -> bool {
    let Some(header) = body.peek_bits(LENGTH_BITS + MESSAGE_ID_BITS) else {
        return false;
    };
    let length = header >> MESSAGE_ID_BITS;
    let id = (header & u64::from(u32::MAX)) as u32;
    length >= u64::from(MESSAGE_ID_BITS) && id == Handshake::id()
}
