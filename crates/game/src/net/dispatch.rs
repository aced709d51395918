use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::error::ProtocolError;
use super::peer::Peer;
use super::protocol::{Direction, MESSAGE_ID_BITS, Message};
use crate::bits::BitBuffer;

type Handler =
    Arc<dyn Fn(&BitBuffer, &Arc<Peer>, Direction) -> Result<(), ProtocolError> + Send + Sync>;

/// Maps message type ids to the handlers that decode and act on them.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<u32, Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `M`, replacing any earlier one.
    pub fn on<M, F>(&self, handler: F)
    where
        M: Message,
        F: Fn(M, &Arc<Peer>, Direction) + Send + Sync + 'static,
    {
        let erased: Handler = Arc::new(
            move |payload: &BitBuffer, peer: &Arc<Peer>, direction: Direction| {
                let declared = payload.len();
                let message = M::deserialize(payload).ok_or(ProtocolError::Truncated {
                    needed: declared,
                    available: payload.remaining(),
                })?;
                if payload.remaining() != 0 {
                    return Err(ProtocolError::LengthMismatch {
                        declared,
                        consumed: payload.read_position(),
                    });
                }
                handler(message, peer, direction);
                Ok(())
            },
        );
        self.handlers.write().insert(M::id(), erased);
    }

    pub fn remove<M: Message>(&self) -> bool {
        self.handlers.write().remove(&M::id()).is_some()
    }

    pub fn handles(&self, id: u32) -> bool {
        self.handlers.read().contains_key(&id)
    }

    /// Decodes the type id at the front of `message` and runs its handler.
    pub fn dispatch(
        &self,
        message: &BitBuffer,
        peer: &Arc<Peer>,
        direction: Direction,
    ) -> Result<(), ProtocolError> {
        let id = message.read::<u32>().ok_or(ProtocolError::Truncated {
            needed: MESSAGE_ID_BITS as usize,
            available: message.remaining(),
        })?;
        let handler = self
            .handlers
            .read()
            .get(&id)
            .cloned()
            .ok_or(ProtocolError::UnknownMessage(id))?;
        handler(message, peer, direction)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}
