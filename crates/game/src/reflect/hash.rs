const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub const fn hash_name(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Stable identifier of `T`, derived from its fully qualified name so
/// registration order never matters.
pub fn type_hash<T: ?Sized + 'static>() -> u32 {
    hash_name(std::any::type_name::<T>())
}
