use crate::bits::BitBuffer;
use crate::history::ChangeSet;
use crate::net::{MAX_MESSAGE_BITS, Message};
use crate::reflect::SceneId;

/// History changes of one scene for frames in `(from, to]`.
///
/// A full snapshot, sent to a peer that has nothing yet, has `from == to`
/// and every change tagged with `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSync {
    pub scene: SceneId,
    pub from: u64,
    pub to: u64,
    pub changes: ChangeSet,
}

/// Message id, scene and the two timestamps.
const HEADER_BITS: usize = 32 + 32 + 64 + 64;

impl StateSync {
    pub fn is_snapshot(&self) -> bool {
        self.from == self.to
    }

    /// Splits `changes` over as many messages as it takes to stay within
    /// the largest message the transport carries.
    pub fn chunked(scene: SceneId, from: u64, to: u64, changes: ChangeSet) -> Vec<StateSync> {
        changes
            .split(MAX_MESSAGE_BITS - HEADER_BITS)
            .into_iter()
            .map(|changes| StateSync {
                scene,
                from,
                to,
                changes,
            })
            .collect()
    }
}

impl Message for StateSync {
    fn serialize(&self, buffer: &BitBuffer) {
        buffer.write(&self.scene);
        buffer.write(&self.from);
        buffer.write(&self.to);
        buffer.write(&self.changes);
    }

    fn deserialize(buffer: &BitBuffer) -> Option<Self> {
        Some(StateSync {
            scene: buffer.read()?,
            from: buffer.read()?,
            to: buffer.read()?,
            changes: buffer.read()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::FieldChange;
    use crate::net::encode_message;
    use crate::reflect::ObjectId;

    fn changes(count: u64) -> ChangeSet {
        (0..count)
            .map(|i| {
                let value = BitBuffer::new();
                value.write(&(i as f32));
                FieldChange {
                    timestamp: 5,
                    object: ObjectId(i),
                    type_hash: 0xabcd,
                    field: "transform.position".to_string(),
                    value,
                }
            })
            .collect()
    }

    #[test]
    fn test_state_sync_wire_form() {
        let message = StateSync {
            scene: SceneId(2),
            from: 0,
            to: 5,
            changes: changes(3),
        };
        let payload = encode_message(&message);
        assert_eq!(payload.read::<u32>(), Some(StateSync::id()));

        let decoded = StateSync::deserialize(&payload).unwrap();
        assert_eq!(payload.remaining(), 0);
        assert_eq!(decoded, message);
        assert!(!decoded.is_snapshot());
    }

    #[test]
    fn test_chunks_fit_one_message() {
        let parts = StateSync::chunked(SceneId(2), 5, 5, changes(2000));
        assert!(parts.len() > 1);
        assert_eq!(parts.iter().map(|part| part.changes.len()).sum::<usize>(), 2000);
        for part in &parts {
            assert!(part.is_snapshot());
            assert!(encode_message(part).len() <= MAX_MESSAGE_BITS);
        }
    }

    #[test]
    fn test_empty_change_set_makes_no_messages() {
        assert!(StateSync::chunked(SceneId(2), 0, 1, ChangeSet::new()).is_empty());
    }
}
