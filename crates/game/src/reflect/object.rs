use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bits::{BitReader, BitWriter, Bits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SceneId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scene {}", self.0)
    }
}

impl Bits for ObjectId {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        self.0.encode(writer);
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        u64::decode(reader).map(ObjectId)
    }
}

impl Bits for SceneId {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        self.0.encode(writer);
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        u32::decode(reader).map(SceneId)
    }
}

/// An object whose fields are described in a
/// [`TypeRegistry`](super::TypeRegistry) and can be replicated.
///
/// Use [`impl_replicable!`](crate::impl_replicable) for the boilerplate.
pub trait Replicable: Any + Send + Sync {
    fn type_hash(&self) -> u32;

    /// Runs once after the registry factory creates the object.
    fn init(&mut self) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[macro_export]
macro_rules! impl_replicable {
    ($ty:ty) => {
        impl $crate::reflect::Replicable for $ty {
            fn type_hash(&self) -> u32 {
                $crate::reflect::type_hash::<$ty>()
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }
        }
    };
}

/// The live object container that history logs from and applies into.
///
/// Implementations hold their own lock for the duration of
/// `for_each_object` so a log pass sees a consistent set of objects.
pub trait Scene: Send + Sync {
    fn id(&self) -> SceneId;

    fn for_each_object(&self, visit: &mut dyn FnMut(ObjectId, &dyn Replicable));

    /// Returns `false` when no object has this id.
    fn with_object_mut(&self, id: ObjectId, apply: &mut dyn FnMut(&mut dyn Replicable)) -> bool;

    fn spawn(&self, id: ObjectId, object: Box<dyn Replicable>);
}

