use glam::{Quat, Vec2, Vec3};

use super::buffer::{BitBuffer, BitReader, BitWriter};

/// Bits spent on the length prefix of strings and nested buffers.
pub const LENGTH_PREFIX_BITS: u32 = 16;

/// A value with a fixed bit-level encoding.
///
/// `decode` must consume nothing observable on failure; the owning buffer
/// discards the reader position when it returns `None`.
pub trait Bits: Sized {
    fn encode(&self, writer: &mut BitWriter<'_>);
    fn decode(reader: &mut BitReader<'_>) -> Option<Self>;
}

impl Bits for bool {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        writer.write_bit(*self);
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        reader.read_bit()
    }
}

macro_rules! impl_bits_unsigned {
    ($($ty:ty),*) => {
        $(
            impl Bits for $ty {
                fn encode(&self, writer: &mut BitWriter<'_>) {
                    writer.write_uint(u64::from(*self), <$ty>::BITS);
                }

                fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
                    reader.read_uint(<$ty>::BITS).map(|value| value as $ty)
                }
            }
        )*
    };
}

macro_rules! impl_bits_signed {
    ($($ty:ty => $unsigned:ty),*) => {
        $(
            impl Bits for $ty {
                fn encode(&self, writer: &mut BitWriter<'_>) {
                    writer.write_uint(u64::from(*self as $unsigned), <$ty>::BITS);
                }

                fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
                    reader
                        .read_uint(<$ty>::BITS)
                        .map(|value| value as $unsigned as $ty)
                }
            }
        )*
    };
}

impl_bits_unsigned!(u8, u16, u32, u64);
impl_bits_signed!(i8 => u8, i16 => u16, i32 => u32, i64 => u64);

impl Bits for f32 {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        self.to_bits().encode(writer);
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        u32::decode(reader).map(f32::from_bits)
    }
}

impl Bits for f64 {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        self.to_bits().encode(writer);
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        u64::decode(reader).map(f64::from_bits)
    }
}

/// 16-bit byte length followed by UTF-8 bytes. Longer strings are cut at the
/// last char boundary that fits.
impl Bits for String {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        let mut len = self.len().min(u16::MAX as usize);
        while !self.is_char_boundary(len) {
            len -= 1;
        }
        writer.write_uint(len as u64, LENGTH_PREFIX_BITS);
        writer.write_bytes(&self.as_bytes()[..len], len * 8);
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        let len = reader.read_uint(LENGTH_PREFIX_BITS)? as usize;
        let bytes = reader.read_bytes(len * 8)?;
        String::from_utf8(bytes).ok()
    }
}

impl Bits for Vec2 {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        self.x.encode(writer);
        self.y.encode(writer);
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        Some(Vec2::new(f32::decode(reader)?, f32::decode(reader)?))
    }
}

impl Bits for Vec3 {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        self.x.encode(writer);
        self.y.encode(writer);
        self.z.encode(writer);
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        Some(Vec3::new(
            f32::decode(reader)?,
            f32::decode(reader)?,
            f32::decode(reader)?,
        ))
    }
}

impl Bits for Quat {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        for component in self.to_array() {
            component.encode(writer);
        }
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        Some(Quat::from_xyzw(
            f32::decode(reader)?,
            f32::decode(reader)?,
            f32::decode(reader)?,
            f32::decode(reader)?,
        ))
    }
}

/// Most bits a nested buffer can carry behind its length prefix.
pub const MAX_NESTED_BITS: usize = u16::MAX as usize;

/// A nested buffer: 16-bit bit count, then the unread bits of the source.
/// The source's read cursor does not move. Only the first
/// [`MAX_NESTED_BITS`] unread bits are written; the prefix always matches
/// what follows, so the enclosing stream stays decodable.
impl Bits for BitBuffer {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        let unread = self.unread_storage();
        let len = unread.bit_len().min(MAX_NESTED_BITS);
        if len < unread.bit_len() {
            log::warn!(
                "nested buffer of {} bits cut to {MAX_NESTED_BITS}",
                unread.bit_len()
            );
        }
        writer.write_uint(len as u64, LENGTH_PREFIX_BITS);
        writer.write_bytes(unread.as_bytes(), len);
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        let len = reader.read_uint(LENGTH_PREFIX_BITS)? as usize;
        let bytes = reader.read_bytes(len)?;
        let nested = BitBuffer::new();
        nested.write_bytes(&bytes, len);
        Some(nested)
    }
}

impl<T: Bits> Bits for Option<T> {
    fn encode(&self, writer: &mut BitWriter<'_>) {
        writer.write_bit(self.is_some());
        if let Some(value) = self {
            value.encode(writer);
        }
    }

    fn decode(reader: &mut BitReader<'_>) -> Option<Self> {
        if reader.read_bit()? {
            T::decode(reader).map(Some)
        } else {
            Some(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_values_keep_sign() {
        let buffer = BitBuffer::new();
        buffer.write(&-5i16);
        buffer.write(&i64::MIN);

        assert_eq!(buffer.len(), 80);
        assert_eq!(buffer.read::<i16>(), Some(-5));
        assert_eq!(buffer.read::<i64>(), Some(i64::MIN));
    }

    #[test]
    fn test_string_has_length_prefix() {
        let buffer = BitBuffer::new();
        buffer.write(&String::from("hey"));

        assert_eq!(buffer.len(), 16 + 24);
        assert_eq!(buffer.peek_bits(16), Some(3));
        assert_eq!(buffer.read::<String>().as_deref(), Some("hey"));
    }

    #[test]
    fn test_truncated_string_is_not_consumed() {
        let buffer = BitBuffer::new();
        buffer.write_bits(10, 16);
        buffer.write_bytes(b"abc", 24);

        assert_eq!(buffer.read::<String>(), None);
        assert_eq!(buffer.read_position(), 0);
    }

    #[test]
    fn test_nested_buffer_keeps_bit_length() {
        let inner = BitBuffer::new();
        inner.write_bits(0b10110, 5);

        let outer = BitBuffer::new();
        outer.write_bool(true);
        outer.write(&inner);
        outer.write_bool(false);

        assert_eq!(outer.len(), 1 + 16 + 5 + 1);
        assert_eq!(outer.read_bool(), Some(true));
        let decoded: BitBuffer = outer.read().unwrap();
        assert_eq!(decoded, inner);
        assert_eq!(outer.read_bool(), Some(false));
    }

    #[test]
    fn test_vectors_and_quaternions() {
        let buffer = BitBuffer::new();
        buffer.write(&Vec3::new(1.0, -2.5, 3.25));
        buffer.write(&Quat::from_rotation_y(0.5));

        assert_eq!(buffer.read::<Vec3>(), Some(Vec3::new(1.0, -2.5, 3.25)));
        assert_eq!(buffer.read::<Quat>(), Some(Quat::from_rotation_y(0.5)));
    }

    #[test]
    fn test_optional_values() {
        let buffer = BitBuffer::new();
        buffer.write(&Some(7u8));
        buffer.write(&None::<u8>);

        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.read::<Option<u8>>(), Some(Some(7)));
        assert_eq!(buffer.read::<Option<u8>>(), Some(None));
    }

    #[test]
    fn test_oversized_nested_buffer_is_cut_at_limit() {
        let inner = BitBuffer::new();
        inner.write_bytes(&vec![0xa5; 8200], MAX_NESTED_BITS + 7);

        let outer = BitBuffer::new();
        outer.write(&inner);
        outer.write(&0xbeefu16);

        assert_eq!(outer.len(), 16 + MAX_NESTED_BITS + 16);
        let decoded: BitBuffer = outer.read().unwrap();
        assert_eq!(decoded.len(), MAX_NESTED_BITS);
        assert_eq!(outer.read::<u16>(), Some(0xbeef));
        assert_eq!(inner.read_position(), 0);
    }
}
