use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::bits::BitBuffer;
use crate::reflect::ObjectId;

/// One stored field value and the time since the field's previous record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRecord {
    pub delta_time: u64,
    pub value: BitBuffer,
}

impl FieldRecord {
    pub fn new(delta_time: u64, value: BitBuffer) -> Self {
        Self { delta_time, value }
    }
}

/// The fields of one object that changed in a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRecord {
    pub type_hash: u32,
    pub fields: BTreeMap<String, FieldRecord>,
}

impl ComponentRecord {
    pub fn new(type_hash: u32) -> Self {
        Self {
            type_hash,
            fields: BTreeMap::new(),
        }
    }
}

/// Everything recorded at one timestamp of a scene.
#[derive(Debug)]
pub struct Frame {
    timestamp: u64,
    components: RwLock<BTreeMap<ObjectId, ComponentRecord>>,
}

impl Frame {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            components: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.components.read().is_empty()
    }

    pub fn object_count(&self) -> usize {
        self.components.read().len()
    }

    pub fn field_count(&self) -> usize {
        self.components
            .read()
            .values()
            .map(|component| component.fields.len())
            .sum()
    }

    pub fn objects(&self) -> Vec<ObjectId> {
        self.components.read().keys().copied().collect()
    }

    pub fn type_of(&self, object: ObjectId) -> Option<u32> {
        self.components
            .read()
            .get(&object)
            .map(|component| component.type_hash)
    }

    /// The record for `field` and the owning object's type.
    pub fn record(&self, object: ObjectId, field: &str) -> Option<(u32, FieldRecord)> {
        let components = self.components.read();
        let component = components.get(&object)?;
        let record = component.fields.get(field)?;
        Some((component.type_hash, record.clone()))
    }

    pub fn component(&self, object: ObjectId) -> Option<ComponentRecord> {
        self.components.read().get(&object).cloned()
    }

    pub fn components(&self) -> Vec<(ObjectId, ComponentRecord)> {
        self.components
            .read()
            .iter()
            .map(|(&id, component)| (id, component.clone()))
            .collect()
    }

    /// Every `(object, type, field)` key with a record in this frame.
    pub fn keys(&self) -> Vec<(ObjectId, u32, String)> {
        let components = self.components.read();
        let mut keys = Vec::new();
        for (&id, component) in components.iter() {
            for field in component.fields.keys() {
                keys.push((id, component.type_hash, field.clone()));
            }
        }
        keys
    }

    pub(crate) fn insert(
        &self,
        object: ObjectId,
        type_hash: u32,
        field: &str,
        record: FieldRecord,
    ) {
        let mut components = self.components.write();
        let component = components
            .entry(object)
            .or_insert_with(|| ComponentRecord::new(type_hash));
        component.type_hash = type_hash;
        component.fields.insert(field.to_string(), record);
    }

    /// Returns `false` when the frame has no record for the field.
    pub(crate) fn set_delta(&self, object: ObjectId, field: &str, delta_time: u64) -> bool {
        let mut components = self.components.write();
        match components
            .get_mut(&object)
            .and_then(|component| component.fields.get_mut(field))
        {
            Some(record) => {
                record.delta_time = delta_time;
                true
            }
            None => false,
        }
    }
}
