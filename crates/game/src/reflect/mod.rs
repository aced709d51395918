mod hash;
mod hooks;
mod object;
mod registry;

pub use hash::{hash_name, type_hash};
pub use hooks::{
    Accumulator, Comparator, Difference, FieldHooks, Interpolator, Lerp, MutationHook, accumulate,
    approx_equality, bit_equality, difference, lerp,
};
pub use object::{ObjectId, Replicable, Scene, SceneId};
pub use registry::{
    BaseDescriptor, BitsCodec, Factory, FieldDescriptor, FieldProjection, Project,
    ReferenceProjection, ReflectError, ResolvedField, TypeDescriptor, TypeRegistry, ValueCodec,
};
