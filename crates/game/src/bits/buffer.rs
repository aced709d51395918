use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use super::codec::Bits;

const STARTING_CAPACITY: usize = 64;
const BYTE_BITS: usize = 8;

/// Backing store shared by writers and readers. Bits are packed most
/// significant first; bits past `bits` in the last byte are always zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Storage {
    bytes: Vec<u8>,
    bits: usize,
}

impl Storage {
    fn with_capacity(bytes: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bytes),
            bits: 0,
        }
    }

    pub(crate) fn bit_len(&self) -> usize {
        self.bits
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    fn bit(&self, index: usize) -> bool {
        self.bytes[index / BYTE_BITS] & (0x80 >> (index % BYTE_BITS)) != 0
    }

    fn truncate(&mut self, bits: usize) {
        let bits = bits.min(self.bits);
        self.bytes.truncate(bits.div_ceil(BYTE_BITS));
        let tail = bits % BYTE_BITS;
        if tail != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= 0xFFu8 << (BYTE_BITS - tail);
            }
        }
        self.bits = bits;
    }

    fn copy_range(&self, start: usize, count: usize) -> Storage {
        let mut out = Storage::with_capacity(count.div_ceil(BYTE_BITS));
        let mut writer = BitWriter::new(&mut out);
        if start % BYTE_BITS == 0 {
            let first = start / BYTE_BITS;
            let full = count / BYTE_BITS;
            writer.write_aligned(&self.bytes[first..first + full]);
            for index in start + full * BYTE_BITS..start + count {
                writer.write_bit(self.bit(index));
            }
        } else {
            for index in start..start + count {
                writer.write_bit(self.bit(index));
            }
        }
        out
    }
}

/// Appends bits to a [`Storage`]. Handed to [`Bits::encode`].
pub struct BitWriter<'a> {
    storage: &'a mut Storage,
}

impl<'a> BitWriter<'a> {
    pub(crate) fn new(storage: &'a mut Storage) -> Self {
        Self { storage }
    }

    pub fn bits_written(&self) -> usize {
        self.storage.bits
    }

    pub fn write_bit(&mut self, bit: bool) {
        let offset = self.storage.bits % BYTE_BITS;
        if offset == 0 {
            self.storage.bytes.push(0);
        }
        if bit {
            if let Some(last) = self.storage.bytes.last_mut() {
                *last |= 0x80 >> offset;
            }
        }
        self.storage.bits += 1;
    }

    /// Writes the low `bits` bits of `value`, most significant first.
    pub fn write_uint(&mut self, value: u64, bits: u32) {
        let bits = bits.min(u64::BITS);
        self.storage
            .bytes
            .reserve((bits as usize).div_ceil(BYTE_BITS));
        for shift in (0..bits).rev() {
            self.write_bit((value >> shift) & 1 == 1);
        }
    }

    /// Writes the first `bits` bits of `bytes`; a partial last byte
    /// contributes its leading bits.
    pub fn write_bytes(&mut self, bytes: &[u8], bits: usize) {
        let bits = bits.min(bytes.len() * BYTE_BITS);
        let full = bits / BYTE_BITS;
        if self.storage.bits % BYTE_BITS == 0 {
            self.write_aligned(&bytes[..full]);
        } else {
            for byte in &bytes[..full] {
                self.write_uint(u64::from(*byte), 8);
            }
        }
        for bit in 0..bits % BYTE_BITS {
            self.write_bit(bytes[full] & (0x80 >> bit) != 0);
        }
    }

    fn write_aligned(&mut self, bytes: &[u8]) {
        debug_assert_eq!(self.storage.bits % BYTE_BITS, 0);
        self.storage.bytes.extend_from_slice(bytes);
        self.storage.bits += bytes.len() * BYTE_BITS;
    }

    pub(crate) fn write_storage(&mut self, source: &Storage) {
        self.write_bytes(&source.bytes, source.bits);
    }
}

/// Consumes bits from a [`Storage`] starting at a cursor. Handed to
/// [`Bits::decode`]; the owning buffer commits the cursor only when decoding
/// succeeds.
pub struct BitReader<'a> {
    storage: &'a Storage,
    cursor: usize,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(storage: &'a Storage, cursor: usize) -> Self {
        Self { storage, cursor }
    }

    pub fn remaining(&self) -> usize {
        self.storage.bits.saturating_sub(self.cursor)
    }

    pub fn read_bit(&mut self) -> Option<bool> {
        if self.remaining() == 0 {
            return None;
        }
        let bit = self.storage.bit(self.cursor);
        self.cursor += 1;
        Some(bit)
    }

    pub fn read_uint(&mut self, bits: u32) -> Option<u64> {
        let bits = bits.min(u64::BITS);
        if self.remaining() < bits as usize {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..bits {
            value = (value << 1) | u64::from(self.storage.bit(self.cursor));
            self.cursor += 1;
        }
        Some(value)
    }

    /// Reads `bits` bits into bytes; a partial last byte is left-aligned.
    pub fn read_bytes(&mut self, bits: usize) -> Option<Vec<u8>> {
        if self.remaining() < bits {
            return None;
        }
        let copied = self.storage.copy_range(self.cursor, bits);
        self.cursor += bits;
        Some(copied.bytes)
    }

    pub(crate) fn read_storage(&mut self, bits: usize) -> Option<Storage> {
        if self.remaining() < bits {
            return None;
        }
        let copied = self.storage.copy_range(self.cursor, bits);
        self.cursor += bits;
        Some(copied)
    }
}

/// A growable, bit-addressable buffer with independent read and write
/// cursors.
///
/// Writes append at the end and take the write side of the storage lock;
/// reads take the cursor lock and then the read side of the storage lock.
/// Every operation holds its locks only for its own duration, so a buffer
/// can be shared between a producer and a consumer thread.
pub struct BitBuffer {
    storage: RwLock<Storage>,
    read_cursor: Mutex<usize>,
    bit_count: AtomicUsize,
}

impl BitBuffer {
    pub fn new() -> Self {
        Self::from_storage(Storage::with_capacity(STARTING_CAPACITY), 0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_storage(
            Storage {
                bytes: bytes.to_vec(),
                bits: bytes.len() * BYTE_BITS,
            },
            0,
        )
    }

    fn from_storage(storage: Storage, cursor: usize) -> Self {
        let bits = storage.bits;
        Self {
            storage: RwLock::new(storage),
            read_cursor: Mutex::new(cursor.min(bits)),
            bit_count: AtomicUsize::new(bits),
        }
    }

    /// Number of valid bits in the buffer.
    pub fn len(&self) -> usize {
        self.bit_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> usize {
        let cursor = self.read_cursor.lock();
        self.len().saturating_sub(*cursor)
    }

    pub fn read_position(&self) -> usize {
        *self.read_cursor.lock()
    }

    pub fn set_read_position(&self, bit: usize) {
        let mut cursor = self.read_cursor.lock();
        *cursor = bit.min(self.len());
    }

    pub fn write<T: Bits>(&self, value: &T) {
        // Encode outside the lock so a value that reads another buffer
        // (or this one) never nests storage locks.
        let mut scratch = Storage::default();
        value.encode(&mut BitWriter::new(&mut scratch));
        self.append_storage(&scratch);
    }

    pub fn write_bits(&self, value: u64, size_bits: u32) {
        let mut storage = self.storage.write();
        BitWriter::new(&mut storage).write_uint(value, size_bits);
        self.bit_count.store(storage.bits, Ordering::Release);
    }

    pub fn write_bool(&self, value: bool) {
        let mut storage = self.storage.write();
        BitWriter::new(&mut storage).write_bit(value);
        self.bit_count.store(storage.bits, Ordering::Release);
    }

    pub fn write_bytes(&self, bytes: &[u8], size_bits: usize) {
        let mut storage = self.storage.write();
        BitWriter::new(&mut storage).write_bytes(bytes, size_bits);
        self.bit_count.store(storage.bits, Ordering::Release);
    }

    /// Copies the unread bits of `other` onto the end of this buffer without
    /// moving `other`'s read cursor.
    pub fn append(&self, other: &BitBuffer) {
        let unread = other.unread_storage();
        self.append_storage(&unread);
    }

    fn append_storage(&self, source: &Storage) {
        let mut storage = self.storage.write();
        BitWriter::new(&mut storage).write_storage(source);
        self.bit_count.store(storage.bits, Ordering::Release);
    }

    pub(crate) fn unread_storage(&self) -> Storage {
        let cursor = self.read_cursor.lock();
        let storage = self.storage.read();
        storage.copy_range(*cursor, storage.bits - *cursor)
    }

    /// Decodes a value at the read cursor. Returns `None` and leaves the
    /// cursor untouched when too few bits remain.
    pub fn read<T: Bits>(&self) -> Option<T> {
        self.read_with(true, T::decode)
    }

    /// Like [`read`](Self::read) but never advances the cursor.
    pub fn peek<T: Bits>(&self) -> Option<T> {
        self.read_with(false, T::decode)
    }

    pub fn read_bits(&self, size_bits: u32) -> Option<u64> {
        self.read_with(true, |reader| reader.read_uint(size_bits))
    }

    pub fn peek_bits(&self, size_bits: u32) -> Option<u64> {
        self.read_with(false, |reader| reader.read_uint(size_bits))
    }

    pub fn read_bool(&self) -> Option<bool> {
        self.read_with(true, |reader| reader.read_bit())
    }

    pub fn read_bytes(&self, size_bits: usize) -> Option<Vec<u8>> {
        self.read_with(true, |reader| reader.read_bytes(size_bits))
    }

    /// Moves the next `size_bits` unread bits into a new buffer.
    pub fn take(&self, size_bits: usize) -> Option<BitBuffer> {
        self.read_with(true, |reader| reader.read_storage(size_bits))
            .map(|storage| BitBuffer::from_storage(storage, 0))
    }

    fn read_with<T>(
        &self,
        commit: bool,
        decode: impl FnOnce(&mut BitReader<'_>) -> Option<T>,
    ) -> Option<T> {
        let mut cursor = self.read_cursor.lock();
        let storage = self.storage.read();
        let mut reader = BitReader::new(&storage, *cursor);
        let value = decode(&mut reader)?;
        if commit {
            *cursor = reader.cursor;
        }
        Some(value)
    }

    /// Advances the read cursor by up to `bits`.
    pub fn skip(&self, bits: usize) {
        let mut cursor = self.read_cursor.lock();
        let len = self.len();
        *cursor += bits.min(len.saturating_sub(*cursor));
    }

    /// Drops up to `bits` bits from the end of the buffer.
    pub fn trim(&self, bits: usize) {
        let mut cursor = self.read_cursor.lock();
        let mut storage = self.storage.write();
        let keep = storage.bits - bits.min(storage.bits);
        storage.truncate(keep);
        *cursor = (*cursor).min(storage.bits);
        self.bit_count.store(storage.bits, Ordering::Release);
    }

    pub fn clear(&self) {
        let mut cursor = self.read_cursor.lock();
        let mut storage = self.storage.write();
        storage.bytes.clear();
        storage.bits = 0;
        *cursor = 0;
        self.bit_count.store(0, Ordering::Release);
    }

    /// Copy of the backing bytes; the last byte is zero-padded.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.storage.read().bytes.clone()
    }

    pub fn byte_range(&self, offset: usize, length: usize) -> Vec<u8> {
        let storage = self.storage.read();
        if offset >= storage.bytes.len() {
            return Vec::new();
        }
        let end = offset + length.min(storage.bytes.len() - offset);
        storage.bytes[offset..end].to_vec()
    }
}

impl Default for BitBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for BitBuffer {
    fn clone(&self) -> Self {
        let cursor = self.read_cursor.lock();
        let storage = self.storage.read();
        Self::from_storage(storage.clone(), *cursor)
    }
}

impl PartialEq for BitBuffer {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if self.len() != other.len() {
            return false;
        }
        *self.storage.read() == *other.storage.read()
    }
}

impl Eq for BitBuffer {}

impl fmt::Debug for BitBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = self.storage.read();
        f.debug_struct("BitBuffer")
            .field("bits", &storage.bits)
            .field("read", &*self.read_cursor.lock())
            .field("bytes", &storage.bytes)
            .finish()
    }
}
