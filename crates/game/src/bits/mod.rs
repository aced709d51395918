mod buffer;
mod codec;

pub use buffer::{BitBuffer, BitReader, BitWriter};
pub use codec::{Bits, LENGTH_PREFIX_BITS, MAX_NESTED_BITS};
