use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;

use glam::{Quat, Vec2, Vec3};

use super::hash::type_hash;
use super::hooks::{Accumulator, Comparator, Difference, FieldHooks, Interpolator, MutationHook};
use super::object::Replicable;
use crate::bits::{BitBuffer, Bits};

#[derive(Debug, thiserror::Error)]
pub enum ReflectError {
    #[error("unknown type {0:#010x}")]
    UnknownType(u32),
    #[error("type {type_hash:#010x} has no field `{path}`")]
    UnknownField { type_hash: u32, path: String },
    #[error("value does not have type {type_hash:#010x}")]
    TypeMismatch { type_hash: u32 },
    #[error("type {0:#010x} has no value codec")]
    MissingCodec(u32),
    #[error("reference `{0}` is empty")]
    NullReference(String),
    #[error("not enough bits to decode type {type_hash:#010x}")]
    Truncated { type_hash: u32 },
}

/// Borrows a part of an object: a field, a base, or the target of a
/// reference.
pub trait Project: Send + Sync {
    fn project<'a>(&self, object: &'a dyn Any) -> Option<&'a dyn Any>;
    fn project_mut<'a>(&self, object: &'a mut dyn Any) -> Option<&'a mut dyn Any>;
}

pub struct FieldProjection<T, V> {
    get: fn(&T) -> &V,
    get_mut: fn(&mut T) -> &mut V,
}

impl<T: Any, V: Any> Project for FieldProjection<T, V> {
    fn project<'a>(&self, object: &'a dyn Any) -> Option<&'a dyn Any> {
        let object = object.downcast_ref::<T>()?;
        Some((self.get)(object) as &dyn Any)
    }

    fn project_mut<'a>(&self, object: &'a mut dyn Any) -> Option<&'a mut dyn Any> {
        let object = object.downcast_mut::<T>()?;
        Some((self.get_mut)(object) as &mut dyn Any)
    }
}

pub struct ReferenceProjection<T, V> {
    get: fn(&T) -> Option<&V>,
    get_mut: fn(&mut T) -> Option<&mut V>,
}

impl<T: Any, V: Any> Project for ReferenceProjection<T, V> {
    fn project<'a>(&self, object: &'a dyn Any) -> Option<&'a dyn Any> {
        let object = object.downcast_ref::<T>()?;
        (self.get)(object).map(|value| value as &dyn Any)
    }

    fn project_mut<'a>(&self, object: &'a mut dyn Any) -> Option<&'a mut dyn Any> {
        let object = object.downcast_mut::<T>()?;
        (self.get_mut)(object).map(|value| value as &mut dyn Any)
    }
}

/// Moves a leaf value in and out of a buffer.
pub trait ValueCodec: Send + Sync {
    fn write(&self, value: &dyn Any, buffer: &BitBuffer) -> Result<(), ReflectError>;
    fn read(&self, value: &mut dyn Any, buffer: &BitBuffer) -> Result<(), ReflectError>;
    /// Consumes one encoded value without storing it.
    fn skip(&self, buffer: &BitBuffer) -> Result<(), ReflectError>;
}

pub struct BitsCodec<T>(PhantomData<fn() -> T>);

impl<T> Default for BitsCodec<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Bits + Any> ValueCodec for BitsCodec<T> {
    fn write(&self, value: &dyn Any, buffer: &BitBuffer) -> Result<(), ReflectError> {
        let value = value.downcast_ref::<T>().ok_or(ReflectError::TypeMismatch {
            type_hash: type_hash::<T>(),
        })?;
        buffer.write(value);
        Ok(())
    }

    fn read(&self, value: &mut dyn Any, buffer: &BitBuffer) -> Result<(), ReflectError> {
        let type_hash = type_hash::<T>();
        let slot = value
            .downcast_mut::<T>()
            .ok_or(ReflectError::TypeMismatch { type_hash })?;
        *slot = buffer
            .read::<T>()
            .ok_or(ReflectError::Truncated { type_hash })?;
        Ok(())
    }

    fn skip(&self, buffer: &BitBuffer) -> Result<(), ReflectError> {
        buffer.read::<T>().map(drop).ok_or(ReflectError::Truncated {
            type_hash: type_hash::<T>(),
        })
    }
}

pub type Factory = fn() -> Box<dyn Replicable>;

#[derive(Clone)]
pub struct BaseDescriptor {
    pub type_hash: u32,
    pub offset: usize,
    projection: Arc<dyn Project>,
}

#[derive(Clone)]
pub struct FieldDescriptor {
    pub value_type: u32,
    pub offset: usize,
    pub is_reference: bool,
    pub hooks: FieldHooks,
    projection: Arc<dyn Project>,
}

pub struct TypeDescriptor {
    pub type_hash: u32,
    pub name: &'static str,
    pub size_bits: usize,
    pub is_replicable: bool,
    bases: Vec<BaseDescriptor>,
    fields: BTreeMap<String, FieldDescriptor>,
    codec: Option<Arc<dyn ValueCodec>>,
    factory: Option<Factory>,
}

impl TypeDescriptor {
    fn new<T: Any>() -> Self {
        Self {
            type_hash: type_hash::<T>(),
            name: std::any::type_name::<T>(),
            size_bits: std::mem::size_of::<T>() * 8,
            is_replicable: false,
            bases: Vec::new(),
            fields: BTreeMap::new(),
            codec: None,
            factory: None,
        }
    }

    pub fn bases(&self) -> &[BaseDescriptor] {
        &self.bases
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldDescriptor)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    /// Values with a codec and no fields of their own.
    pub fn is_leaf(&self) -> bool {
        self.codec.is_some() || (self.fields.is_empty() && self.bases.is_empty())
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("type_hash", &self.type_hash)
            .field("name", &self.name)
            .field("size_bits", &self.size_bits)
            .field("is_replicable", &self.is_replicable)
            .field(
                "bases",
                &self.bases.iter().map(|b| (b.type_hash, b.offset)).collect::<Vec<_>>(),
            )
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A field located by dotted path from some root type.
#[derive(Clone)]
pub struct ResolvedField {
    pub path: String,
    pub value_type: u32,
    /// Byte offset from the innermost object reached without following a
    /// reference. Base and embedded-field offsets add up along the path.
    pub offset: usize,
    pub is_reference: bool,
    /// Some step of the path follows a reference, so the value may be absent.
    pub nullable: bool,
    pub hooks: FieldHooks,
    chain: Vec<Arc<dyn Project>>,
}

impl std::fmt::Debug for ResolvedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedField")
            .field("path", &self.path)
            .field("value_type", &self.value_type)
            .field("offset", &self.offset)
            .field("is_reference", &self.is_reference)
            .field("nullable", &self.nullable)
            .finish()
    }
}

struct Step {
    offset: usize,
    chain: Vec<Arc<dyn Project>>,
    field: FieldDescriptor,
}

/// Reflection metadata for every replicated type.
///
/// Built with `&mut self` during startup and then shared behind an `Arc`;
/// lookups take `&self` and need no locking.
pub struct TypeRegistry {
    types: HashMap<u32, TypeDescriptor>,
}

impl TypeRegistry {
    /// A registry with codecs for the built-in value types.
    pub fn new() -> Self {
        let mut registry = Self {
            types: HashMap::new(),
        };
        registry
            .register_value::<bool>()
            .register_value::<u8>()
            .register_value::<u16>()
            .register_value::<u32>()
            .register_value::<u64>()
            .register_value::<i8>()
            .register_value::<i16>()
            .register_value::<i32>()
            .register_value::<i64>()
            .register_value::<f32>()
            .register_value::<f64>()
            .register_value::<String>()
            .register_value::<Vec2>()
            .register_value::<Vec3>()
            .register_value::<Quat>();
        registry
    }

    pub fn register<T: Any>(&mut self) -> &mut Self {
        self.descriptor_mut::<T>();
        self
    }

    pub fn register_value<T: Bits + Any>(&mut self) -> &mut Self {
        self.descriptor_mut::<T>().codec = Some(Arc::new(BitsCodec::<T>::default()));
        self
    }

    pub fn register_replicable<T: Replicable + Default>(&mut self) -> &mut Self {
        let factory: Factory = || Box::new(T::default());
        let descriptor = self.descriptor_mut::<T>();
        descriptor.is_replicable = true;
        descriptor.factory = Some(factory);
        self
    }

    fn descriptor_mut<T: Any>(&mut self) -> &mut TypeDescriptor {
        self.types
            .entry(type_hash::<T>())
            .or_insert_with(TypeDescriptor::new::<T>)
    }

    /// Declares `B` as a base of `T`, embedded at `offset`.
    pub fn add_base<T: Any, B: Any>(
        &mut self,
        offset: usize,
        get: fn(&T) -> &B,
        get_mut: fn(&mut T) -> &mut B,
    ) -> &mut Self {
        let base = BaseDescriptor {
            type_hash: type_hash::<B>(),
            offset,
            projection: Arc::new(FieldProjection { get, get_mut }),
        };
        let descriptor = self.descriptor_mut::<T>();
        descriptor.bases.retain(|existing| existing.type_hash != base.type_hash);
        descriptor.bases.push(base);
        self
    }

    pub fn add_field<T: Any, V: Any>(
        &mut self,
        name: &str,
        offset: usize,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> &mut Self {
        self.insert_field::<T>(
            name,
            FieldDescriptor {
                value_type: type_hash::<V>(),
                offset,
                is_reference: false,
                hooks: FieldHooks::default(),
                projection: Arc::new(FieldProjection { get, get_mut }),
            },
        )
    }

    /// A field that may point at a `V` owned elsewhere in the object,
    /// such as an `Option<Box<V>>`.
    pub fn add_reference_field<T: Any, V: Any>(
        &mut self,
        name: &str,
        offset: usize,
        get: fn(&T) -> Option<&V>,
        get_mut: fn(&mut T) -> Option<&mut V>,
    ) -> &mut Self {
        self.insert_field::<T>(
            name,
            FieldDescriptor {
                value_type: type_hash::<V>(),
                offset,
                is_reference: true,
                hooks: FieldHooks::default(),
                projection: Arc::new(ReferenceProjection { get, get_mut }),
            },
        )
    }

    fn insert_field<T: Any>(&mut self, name: &str, field: FieldDescriptor) -> &mut Self {
        self.descriptor_mut::<T>()
            .fields
            .insert(name.to_string(), field);
        self
    }

    fn hooks_mut<T: Any>(&mut self, field: &str) -> Result<&mut FieldHooks, ReflectError> {
        let type_hash = type_hash::<T>();
        self.types
            .get_mut(&type_hash)
            .ok_or(ReflectError::UnknownType(type_hash))?
            .fields
            .get_mut(field)
            .map(|field| &mut field.hooks)
            .ok_or_else(|| ReflectError::UnknownField {
                type_hash,
                path: field.to_string(),
            })
    }

    pub fn set_comparator<T: Any>(
        &mut self,
        field: &str,
        comparator: Comparator,
    ) -> Result<(), ReflectError> {
        self.hooks_mut::<T>(field)?.comparator = Some(comparator);
        Ok(())
    }

    pub fn set_interpolator<T: Any>(
        &mut self,
        field: &str,
        interpolator: Interpolator,
    ) -> Result<(), ReflectError> {
        self.hooks_mut::<T>(field)?.interpolator = Some(interpolator);
        Ok(())
    }

    pub fn set_difference<T: Any>(
        &mut self,
        field: &str,
        difference: Difference,
    ) -> Result<(), ReflectError> {
        self.hooks_mut::<T>(field)?.difference = Some(difference);
        Ok(())
    }

    pub fn set_accumulator<T: Any>(
        &mut self,
        field: &str,
        accumulator: Accumulator,
    ) -> Result<(), ReflectError> {
        self.hooks_mut::<T>(field)?.accumulator = Some(accumulator);
        Ok(())
    }

    pub fn set_pre_hook<T: Any>(
        &mut self,
        field: &str,
        hook: MutationHook,
    ) -> Result<(), ReflectError> {
        self.hooks_mut::<T>(field)?.pre_hook = Some(hook);
        Ok(())
    }

    pub fn set_post_hook<T: Any>(
        &mut self,
        field: &str,
        hook: MutationHook,
    ) -> Result<(), ReflectError> {
        self.hooks_mut::<T>(field)?.post_hook = Some(hook);
        Ok(())
    }

    pub fn get_type(&self, type_hash: u32) -> Option<&TypeDescriptor> {
        self.types.get(&type_hash)
    }

    pub fn contains(&self, type_hash: u32) -> bool {
        self.types.contains_key(&type_hash)
    }

    /// Every base reachable from `type_hash` with its accumulated offset,
    /// nearest first.
    pub fn bases(&self, type_hash: u32) -> Vec<(u32, usize)> {
        let mut found = Vec::new();
        let mut seen = HashSet::from([type_hash]);
        let mut queue = VecDeque::from([(type_hash, 0usize)]);
        while let Some((current, offset)) = queue.pop_front() {
            let Some(descriptor) = self.types.get(&current) else {
                continue;
            };
            for base in &descriptor.bases {
                if seen.insert(base.type_hash) {
                    found.push((base.type_hash, offset + base.offset));
                    queue.push_back((base.type_hash, offset + base.offset));
                }
            }
        }
        found
    }

    pub fn has_base(&self, type_hash: u32, base: u32) -> bool {
        self.base_offset(type_hash, base).is_some()
    }

    pub fn base_offset(&self, type_hash: u32, base: u32) -> Option<usize> {
        self.bases(type_hash)
            .into_iter()
            .find(|(hash, _)| *hash == base)
            .map(|(_, offset)| offset)
    }

    /// Finds `name` on `type_hash` itself, else breadth-first through its
    /// bases. Offsets and projections accumulate along the way.
    fn find_field(&self, type_hash: u32, name: &str) -> Option<Step> {
        let mut seen = HashSet::from([type_hash]);
        let mut queue = VecDeque::from([(type_hash, 0usize, Vec::<Arc<dyn Project>>::new())]);
        while let Some((current, offset, chain)) = queue.pop_front() {
            let Some(descriptor) = self.types.get(&current) else {
                continue;
            };
            if let Some(field) = descriptor.fields.get(name) {
                let mut chain = chain;
                chain.push(field.projection.clone());
                return Some(Step {
                    offset: offset + field.offset,
                    chain,
                    field: field.clone(),
                });
            }
            for base in &descriptor.bases {
                if seen.insert(base.type_hash) {
                    let mut next = chain.clone();
                    next.push(base.projection.clone());
                    queue.push_back((base.type_hash, offset + base.offset, next));
                }
            }
        }
        None
    }

    /// Resolves a `.`-separated path such as `transform.position`.
    pub fn resolve_field(&self, type_hash: u32, path: &str) -> Result<ResolvedField, ReflectError> {
        if !self.types.contains_key(&type_hash) {
            return Err(ReflectError::UnknownType(type_hash));
        }
        let unknown = || ReflectError::UnknownField {
            type_hash,
            path: path.to_string(),
        };

        let mut current = type_hash;
        let mut offset = 0;
        let mut chain = Vec::new();
        let mut last: Option<FieldDescriptor> = None;
        let mut nullable = false;
        for segment in path.split('.') {
            if let Some(previous) = &last {
                if previous.is_reference {
                    offset = 0;
                }
                current = previous.value_type;
            }
            let step = self.find_field(current, segment).ok_or_else(unknown)?;
            offset += step.offset;
            chain.extend(step.chain);
            nullable |= step.field.is_reference;
            last = Some(step.field);
        }

        let field = last.ok_or_else(unknown)?;
        Ok(ResolvedField {
            path: path.to_string(),
            value_type: field.value_type,
            offset,
            is_reference: field.is_reference,
            nullable,
            hooks: field.hooks,
            chain,
        })
    }

    /// Dotted names of every field reachable from `type_hash`. Composite
    /// fields are expanded; their own names are listed only when
    /// `only_leaves` is false.
    pub fn enumerate_fields(&self, type_hash: u32, only_leaves: bool) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let mut stack = vec![type_hash];
        self.collect_fields(type_hash, "", only_leaves, &mut stack, &mut names);
        names
    }

    fn collect_fields(
        &self,
        type_hash: u32,
        prefix: &str,
        only_leaves: bool,
        stack: &mut Vec<u32>,
        names: &mut BTreeSet<String>,
    ) {
        let mut visible: BTreeMap<&str, u32> = BTreeMap::new();
        let mut layers = vec![type_hash];
        layers.extend(self.bases(type_hash).into_iter().map(|(hash, _)| hash));
        for layer in layers {
            let Some(descriptor) = self.types.get(&layer) else {
                continue;
            };
            for (name, field) in &descriptor.fields {
                visible.entry(name.as_str()).or_insert(field.value_type);
            }
        }

        for (name, value_type) in visible {
            let path = format!("{prefix}{name}");
            let composite = self
                .types
                .get(&value_type)
                .is_some_and(|descriptor| !descriptor.is_leaf());
            if !composite {
                names.insert(path);
                continue;
            }
            if !only_leaves {
                names.insert(path.clone());
            }
            if stack.contains(&value_type) {
                log::debug!("skipping recursive field {path}");
                continue;
            }
            stack.push(value_type);
            self.collect_fields(value_type, &format!("{path}."), only_leaves, stack, names);
            stack.pop();
        }
    }

    fn codec(&self, value_type: u32) -> Result<&Arc<dyn ValueCodec>, ReflectError> {
        self.types
            .get(&value_type)
            .ok_or(ReflectError::UnknownType(value_type))?
            .codec
            .as_ref()
            .ok_or(ReflectError::MissingCodec(value_type))
    }

    fn project<'a>(
        field: &ResolvedField,
        object: &'a dyn Any,
        depth: usize,
    ) -> Result<&'a dyn Any, ReflectError> {
        let mut current = object;
        for projection in &field.chain[..depth] {
            current = projection
                .project(current)
                .ok_or_else(|| Self::projection_error(field))?;
        }
        Ok(current)
    }

    fn project_mut<'a>(
        field: &ResolvedField,
        object: &'a mut dyn Any,
        depth: usize,
    ) -> Result<&'a mut dyn Any, ReflectError> {
        let mut current = object;
        for projection in &field.chain[..depth] {
            current = match projection.project_mut(current) {
                Some(next) => next,
                None => return Err(Self::projection_error(field)),
            };
        }
        Ok(current)
    }

    fn projection_error(field: &ResolvedField) -> ReflectError {
        if field.chain.len() > 1 || field.is_reference {
            ReflectError::NullReference(field.path.clone())
        } else {
            ReflectError::TypeMismatch {
                type_hash: field.value_type,
            }
        }
    }

    /// Serializes the current value at `path` into a fresh buffer.
    pub fn read_field(
        &self,
        object: &dyn Replicable,
        path: &str,
    ) -> Result<BitBuffer, ReflectError> {
        let field = self.resolve_field(object.type_hash(), path)?;
        self.read_resolved(object, &field)
    }

    pub fn read_resolved(
        &self,
        object: &dyn Replicable,
        field: &ResolvedField,
    ) -> Result<BitBuffer, ReflectError> {
        let codec = self.codec(field.value_type)?;
        let value = Self::project(field, object.as_any(), field.chain.len())?;
        let buffer = BitBuffer::new();
        codec.write(value, &buffer)?;
        Ok(buffer)
    }

    /// Decodes a value from `buffer`'s read cursor into the field at
    /// `path`, running the field's pre- and post-mutation hooks on the
    /// object that owns it.
    pub fn write_field(
        &self,
        object: &mut dyn Replicable,
        path: &str,
        buffer: &BitBuffer,
    ) -> Result<(), ReflectError> {
        let field = self.resolve_field(object.type_hash(), path)?;
        self.write_resolved(object, &field, buffer)
    }

    pub fn write_resolved(
        &self,
        object: &mut dyn Replicable,
        field: &ResolvedField,
        buffer: &BitBuffer,
    ) -> Result<(), ReflectError> {
        let codec = self.codec(field.value_type)?;
        let depth = field.chain.len();
        let owner = Self::project_mut(field, object.as_any_mut(), depth - 1)?;
        if let Some(hook) = &field.hooks.pre_hook {
            hook(&mut *owner);
        }
        let value = field.chain[depth - 1]
            .project_mut(&mut *owner)
            .ok_or_else(|| Self::projection_error(field))?;
        let result = codec.read(value, buffer);
        if let Some(hook) = &field.hooks.post_hook {
            hook(&mut *owner);
        }
        result
    }

    /// Every leaf field with its resolution, in path order.
    pub fn leaf_fields(&self, type_hash: u32) -> Result<Vec<ResolvedField>, ReflectError> {
        self.enumerate_fields(type_hash, true)
            .into_iter()
            .map(|path| self.resolve_field(type_hash, &path))
            .collect()
    }

    /// Writes every leaf field in path order. Leaves behind a reference
    /// get a presence bit first.
    pub fn serialize_object(
        &self,
        object: &dyn Replicable,
        buffer: &BitBuffer,
    ) -> Result<(), ReflectError> {
        for field in self.leaf_fields(object.type_hash())? {
            match self.read_resolved(object, &field) {
                Ok(value) => {
                    if field.nullable {
                        buffer.write(&true);
                    }
                    buffer.append(&value);
                }
                Err(ReflectError::NullReference(_)) if field.nullable => buffer.write(&false),
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Reads every leaf field written by [`serialize_object`](Self::serialize_object).
    /// A value sent for a reference that is empty here is consumed and dropped.
    pub fn deserialize_object(
        &self,
        object: &mut dyn Replicable,
        buffer: &BitBuffer,
    ) -> Result<(), ReflectError> {
        for field in self.leaf_fields(object.type_hash())? {
            if field.nullable {
                let present = buffer.read::<bool>().ok_or(ReflectError::Truncated {
                    type_hash: field.value_type,
                })?;
                if !present {
                    continue;
                }
            }
            match self.write_resolved(object, &field, buffer) {
                Ok(()) => {}
                Err(ReflectError::NullReference(path)) if field.nullable => {
                    log::debug!("dropping value for empty reference {path}");
                    self.codec(field.value_type)?.skip(buffer)?;
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Builds a default instance of a replicable type and runs its `init`.
    pub fn create(&self, type_hash: u32) -> Option<Box<dyn Replicable>> {
        let factory = self.types.get(&type_hash)?.factory?;
        let mut object = factory();
        object.init();
        Some(object)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[macro_export]
macro_rules! reflect_field {
    ($registry:expr, $ty:ty, $field:ident) => {
        $registry.add_field::<$ty, _>(
            stringify!($field),
            ::std::mem::offset_of!($ty, $field),
            |object: &$ty| &object.$field,
            |object: &mut $ty| &mut object.$field,
        )
    };
}

#[macro_export]
macro_rules! reflect_base {
    ($registry:expr, $ty:ty, $field:ident) => {
        $registry.add_base::<$ty, _>(
            ::std::mem::offset_of!($ty, $field),
            |object: &$ty| &object.$field,
            |object: &mut $ty| &mut object.$field,
        )
    };
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::reflect::hooks::lerp;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Transform {
        position: Vec3,
        rotation: Quat,
    }

    #[derive(Debug, Default)]
    struct Body {
        transform: Transform,
        mass: f32,
    }

    #[derive(Debug, Default)]
    struct Ship {
        body: Body,
        name: String,
        mass: u16,
        target: Option<Box<Transform>>,
        edits: u32,
    }

    crate::impl_replicable!(Ship);

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        crate::reflect_field!(registry, Transform, position);
        crate::reflect_field!(registry, Transform, rotation);
        crate::reflect_field!(registry, Body, transform);
        crate::reflect_field!(registry, Body, mass);
        registry.register_replicable::<Ship>();
        crate::reflect_base!(registry, Ship, body);
        crate::reflect_field!(registry, Ship, name);
        crate::reflect_field!(registry, Ship, mass);
        registry.add_reference_field::<Ship, Transform>(
            "target",
            offset_of!(Ship, target),
            |ship| ship.target.as_deref(),
            |ship| ship.target.as_deref_mut(),
        );
        registry
    }

    #[test]
    fn test_registration_is_idempotent() {
        let mut registry = registry();
        let before = registry.enumerate_fields(type_hash::<Ship>(), false);
        registry.register::<Ship>().register::<Transform>();
        assert_eq!(registry.enumerate_fields(type_hash::<Ship>(), false), before);
        assert!(registry.get_type(type_hash::<Ship>()).unwrap().is_replicable);
    }

    #[test]
    fn test_own_field_shadows_base() {
        let registry = registry();
        let field = registry.resolve_field(type_hash::<Ship>(), "mass").unwrap();
        assert_eq!(field.value_type, type_hash::<u16>());
        assert_eq!(field.offset, offset_of!(Ship, mass));
    }

    #[test]
    fn test_inherited_offsets_add_up() {
        let registry = registry();
        let field = registry
            .resolve_field(type_hash::<Ship>(), "transform.position")
            .unwrap();
        let expected =
            offset_of!(Ship, body) + offset_of!(Body, transform) + offset_of!(Transform, position);
        assert_eq!(field.offset, expected);
        assert_eq!(field.value_type, type_hash::<Vec3>());
        assert!(registry.has_base(type_hash::<Ship>(), type_hash::<Body>()));
        assert_eq!(
            registry.base_offset(type_hash::<Ship>(), type_hash::<Body>()),
            Some(offset_of!(Ship, body))
        );
    }

    #[test]
    fn test_enumerate_fields() {
        let registry = registry();
        let leaves: Vec<_> = registry
            .enumerate_fields(type_hash::<Ship>(), true)
            .into_iter()
            .collect();
        assert_eq!(
            leaves,
            vec![
                "mass",
                "name",
                "target.position",
                "target.rotation",
                "transform.position",
                "transform.rotation",
            ]
        );

        let all = registry.enumerate_fields(type_hash::<Ship>(), false);
        assert!(all.contains("transform"));
        assert!(all.contains("target"));
        assert!(all.contains("transform.rotation"));
    }

    #[test]
    fn test_unknown_lookups() {
        let registry = registry();
        assert!(matches!(
            registry.resolve_field(type_hash::<Ship>(), "hull"),
            Err(ReflectError::UnknownField { .. })
        ));
        assert!(matches!(
            registry.resolve_field(0xdead_beef, "mass"),
            Err(ReflectError::UnknownType(0xdead_beef))
        ));
        assert!(registry.get_type(0xdead_beef).is_none());
    }

    #[test]
    fn test_read_and_write_nested_field() {
        let registry = registry();
        let mut ship = Ship::default();
        ship.body.transform.position = Vec3::new(1.0, 2.0, 3.0);

        let value = registry.read_field(&ship, "transform.position").unwrap();
        assert_eq!(value.peek::<Vec3>(), Some(Vec3::new(1.0, 2.0, 3.0)));

        let update = BitBuffer::new();
        update.write(&Vec3::new(4.0, 5.0, 6.0));
        registry.write_field(&mut ship, "transform.position", &update).unwrap();
        assert_eq!(ship.body.transform.position, Vec3::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn test_empty_reference() {
        let registry = registry();
        let mut ship = Ship::default();
        assert!(matches!(
            registry.read_field(&ship, "target.position"),
            Err(ReflectError::NullReference(_))
        ));

        ship.target = Some(Box::new(Transform {
            position: Vec3::X,
            rotation: Quat::IDENTITY,
        }));
        let value = registry.read_field(&ship, "target.position").unwrap();
        assert_eq!(value.peek::<Vec3>(), Some(Vec3::X));
    }

    #[test]
    fn test_mutation_hooks_wrap_write() {
        static PRE: AtomicUsize = AtomicUsize::new(0);

        let mut registry = registry();
        registry
            .set_pre_hook::<Ship>(
                "name",
                Arc::new(|_owner: &mut dyn Any| {
                    PRE.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        registry
            .set_post_hook::<Ship>(
                "name",
                Arc::new(|owner: &mut dyn Any| {
                    if let Some(ship) = owner.downcast_mut::<Ship>() {
                        ship.edits += 1;
                    }
                }),
            )
            .unwrap();

        let mut ship = Ship::default();
        let update = BitBuffer::new();
        update.write(&String::from("skiff"));
        registry.write_field(&mut ship, "name", &update).unwrap();

        assert_eq!(ship.name, "skiff");
        assert_eq!(ship.edits, 1);
        assert_eq!(PRE.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hooks_need_existing_field() {
        let mut registry = registry();
        assert!(registry.set_interpolator::<Transform>("position", lerp::<Vec3>()).is_ok());
        assert!(registry.set_interpolator::<Transform>("scale", lerp::<Vec3>()).is_err());
        let field = registry
            .resolve_field(type_hash::<Ship>(), "transform.position")
            .unwrap();
        assert!(field.hooks.interpolator.is_some());
    }

    #[test]
    fn test_object_serialization() {
        let registry = registry();
        let mut ship = Ship::default();
        ship.name = "ark".into();
        ship.mass = 7;
        ship.body.transform.rotation = Quat::from_rotation_x(1.0);

        let buffer = BitBuffer::new();
        registry.serialize_object(&ship, &buffer).unwrap();

        let mut copy = registry.create(type_hash::<Ship>()).unwrap();
        registry.deserialize_object(copy.as_mut(), &buffer).unwrap();
        let copy = copy.as_any().downcast_ref::<Ship>().unwrap();

        assert_eq!(copy.name, "ark");
        assert_eq!(copy.mass, 7);
        assert_eq!(copy.body.transform, ship.body.transform);
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn test_empty_reference_keeps_later_fields_aligned() {
        let registry = registry();
        let mut with_target = Ship::default();
        with_target.name = "tug".into();
        with_target.mass = 3;
        with_target.target = Some(Box::new(Transform {
            position: Vec3::Y,
            rotation: Quat::IDENTITY,
        }));
        let mut without_target = Ship::default();
        without_target.name = "barge".into();
        without_target.mass = 9;
        without_target.body.transform.position = Vec3::Z;

        // Sender has a target, receiver does not.
        let buffer = BitBuffer::new();
        registry.serialize_object(&with_target, &buffer).unwrap();
        let mut copy = Ship::default();
        registry.deserialize_object(&mut copy, &buffer).unwrap();
        assert_eq!(copy.name, "tug");
        assert_eq!(copy.mass, 3);
        assert!(copy.target.is_none());
        assert_eq!(buffer.remaining(), 0);

        // Sender has none, receiver keeps its own.
        let buffer = BitBuffer::new();
        registry.serialize_object(&without_target, &buffer).unwrap();
        let mut copy = Ship {
            target: Some(Box::new(Transform::default())),
            ..Default::default()
        };
        registry.deserialize_object(&mut copy, &buffer).unwrap();
        assert_eq!(copy.name, "barge");
        assert_eq!(copy.mass, 9);
        assert_eq!(copy.body.transform.position, Vec3::Z);
        assert_eq!(copy.target.as_deref(), Some(&Transform::default()));
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn test_create_requires_factory() {
        let registry = registry();
        assert!(registry.create(type_hash::<Transform>()).is_none());
        assert!(registry.create(type_hash::<Ship>()).is_some());
    }
}
