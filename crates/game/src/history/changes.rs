use std::collections::BTreeSet;

use crate::bits::{BitBuffer, BitReader, BitWriter, Bits};
use crate::reflect::ObjectId;

/// A field value tagged with the frame it was recorded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub timestamp: u64,
    pub object: ObjectId,
    pub type_hash: u32,
    pub field: String,
    pub value: BitBuffer,
}

impl Bits for FieldChange {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        self.timestamp.encode(writer);
        self.object.encode(writer);
        self.type_hash.encode(writer);
        self.field.encode(writer);
        self.value.encode(writer);
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        Some(Self {
            timestamp: u64::decode(reader)?,
            object: ObjectId::decode(reader)?,
            type_hash: u32::decode(reader)?,
            field: String::decode(reader)?,
            value: BitBuffer::decode(reader)?,
        })
    }
}

/// Field changes ordered by timestamp, then object, then field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<FieldChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: FieldChange) {
        let key = (change.timestamp, change.object, change.field.as_str());
        let index = self
            .changes
            .partition_point(|c| (c.timestamp, c.object, c.field.as_str()) <= key);
        self.changes.insert(index, change);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldChange> {
        self.changes.iter()
    }

    pub fn latest_timestamp(&self) -> Option<u64> {
        self.changes.last().map(|change| change.timestamp)
    }

    pub fn objects(&self) -> BTreeSet<ObjectId> {
        self.changes.iter().map(|change| change.object).collect()
    }

    pub fn timestamps(&self) -> BTreeSet<u64> {
        self.changes.iter().map(|change| change.timestamp).collect()
    }

    pub fn find(&self, object: ObjectId, field: &str) -> impl Iterator<Item = &FieldChange> {
        self.changes
            .iter()
            .filter(move |change| change.object == object && change.field == field)
    }

    /// Splits into consecutive sets whose encoded size stays within
    /// `max_bits`. A change larger than that on its own gets its own set.
    pub fn split(self, max_bits: usize) -> Vec<ChangeSet> {
        let budget = max_bits.saturating_sub(COUNT_BITS);
        let mut sets = Vec::new();
        let mut current = ChangeSet::new();
        let mut used = 0;
        for change in self.changes {
            let size = encoded_bits(&change);
            if !current.is_empty() && used + size > budget {
                sets.push(std::mem::take(&mut current));
                used = 0;
            }
            used += size;
            current.changes.push(change);
        }
        if !current.is_empty() {
            sets.push(current);
        }
        sets
    }
}

const COUNT_BITS: usize = 32;

fn encoded_bits<T: Bits>(value: &T) -> usize {
    let buffer = BitBuffer::new();
    buffer.write(value);
    buffer.len()
}

impl FromIterator<FieldChange> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = FieldChange>>(iter: I) -> Self {
        let mut changes: Vec<FieldChange> = iter.into_iter().collect();
        changes.sort_by(|a, b| {
            (a.timestamp, a.object, &a.field).cmp(&(b.timestamp, b.object, &b.field))
        });
        Self { changes }
    }
}

impl IntoIterator for ChangeSet {
    type Item = FieldChange;
    type IntoIter = std::vec::IntoIter<FieldChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a FieldChange;
    type IntoIter = std::slice::Iter<'a, FieldChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl Bits for ChangeSet {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        writer.write_uint(self.changes.len() as u64, COUNT_BITS as u32);
        for change in &self.changes {
            change.encode(writer);
        }
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        let count = u32::decode(reader)?;
        let mut changes = Vec::new();
        for _ in 0..count {
            changes.push(FieldChange::decode(reader)?);
        }
        Some(changes.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(timestamp: u64, object: u64, field: &str, value: f32) -> FieldChange {
        let buffer = BitBuffer::new();
        buffer.write(&value);
        FieldChange {
            timestamp,
            object: ObjectId(object),
            type_hash: 0x1234,
            field: field.to_string(),
            value: buffer,
        }
    }

    #[test]
    fn test_push_keeps_order() {
        let mut set = ChangeSet::new();
        set.push(change(30, 1, "x", 3.0));
        set.push(change(10, 2, "x", 1.0));
        set.push(change(10, 1, "y", 2.0));
        set.push(change(10, 1, "x", 0.5));

        let order: Vec<(u64, u64, &str)> = set
            .iter()
            .map(|c| (c.timestamp, c.object.0, c.field.as_str()))
            .collect();
        assert_eq!(order, vec![(10, 1, "x"), (10, 1, "y"), (10, 2, "x"), (30, 1, "x")]);
        assert_eq!(set.latest_timestamp(), Some(30));
        assert_eq!(set.objects().len(), 2);
    }

    #[test]
    fn test_change_set_through_buffer() {
        let set: ChangeSet = vec![change(20, 4, "position.x", 1.5), change(10, 4, "health", 80.0)]
            .into_iter()
            .collect();

        let buffer = BitBuffer::new();
        buffer.write(&set);
        buffer.write(&true);

        let decoded = buffer.read::<ChangeSet>().unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.iter().next().unwrap().field, "health");
        let position = decoded.find(ObjectId(4), "position.x").next().unwrap();
        assert_eq!(position.value.peek::<f32>(), Some(1.5));
        assert_eq!(buffer.read::<bool>(), Some(true));
    }

    #[test]
    fn test_split_respects_budget() {
        let set: ChangeSet = (0..40).map(|i| change(i, 1, "position.x", i as f32)).collect();
        let total = encoded_bits(&set);
        let sets = set.clone().split(total / 3);

        assert!(sets.len() >= 3);
        assert!(sets.iter().all(|part| encoded_bits(part) <= total / 3));
        let rejoined: ChangeSet = sets.into_iter().flatten().collect();
        assert_eq!(rejoined, set);
    }

    #[test]
    fn test_truncated_change_set() {
        let set: ChangeSet = vec![change(1, 1, "x", 1.0)].into_iter().collect();
        let buffer = BitBuffer::new();
        buffer.write(&set);
        buffer.trim(8);

        assert!(buffer.read::<ChangeSet>().is_none());
        assert_eq!(buffer.read_position(), 0);
    }
}
