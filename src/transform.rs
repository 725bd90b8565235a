/// Byte-order codec for multi-byte numeric views over register memory
///
/// Registers store big-endian words. Devices disagree on how wider values
/// are spread across consecutive words, so numeric access goes through a
/// [`DataFormat`] that reorders bytes before the big-endian conversion.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Word and byte ordering of a multi-byte value in register memory
///
/// Letters name the bytes of the big-endian value, most significant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataFormat {
    /// Big-endian, as transmitted on the wire
    #[default]
    Abcd,
    /// Bytes swapped inside each word
    Badc,
    /// Words swapped, bytes kept
    Cdab,
    /// Little-endian
    Dcba,
}

impl DataFormat {
    /// Reorder `bytes` between memory layout and big-endian layout.
    ///
    /// Every format is its own inverse, so the same call serves both
    /// directions.
    pub fn reorder(self, bytes: &mut [u8]) {
        match self {
            DataFormat::Abcd => {}
            DataFormat::Badc => {
                for word in bytes.chunks_exact_mut(2) {
                    word.swap(0, 1);
                }
            }
            DataFormat::Cdab => {
                let words = bytes.len() / 2;
                for i in 0..words / 2 {
                    let j = words - 1 - i;
                    bytes.swap(i * 2, j * 2);
                    bytes.swap(i * 2 + 1, j * 2 + 1);
                }
            }
            DataFormat::Dcba => bytes.reverse(),
        }
    }

    /// Decode a value from its memory representation
    pub fn decode<T: WireValue>(self, bytes: &[u8]) -> ServerResult<T> {
        if bytes.len() < T::SIZE {
            return Err(ServerError::invalid_data(format!(
                "Need {} bytes to decode value, got {}",
                T::SIZE,
                bytes.len()
            )));
        }
        let mut buf = bytes[..T::SIZE].to_vec();
        self.reorder(&mut buf);
        Ok(T::read_be(&buf))
    }

    /// Encode a value into its memory representation
    pub fn encode<T: WireValue>(self, value: T) -> Vec<u8> {
        let mut buf = vec![0u8; T::SIZE];
        value.write_be(&mut buf);
        self.reorder(&mut buf);
        buf
    }
}

/// Encode text two characters per register, padding odd lengths with NUL
///
/// With `reverse` the two bytes of every register are swapped, for devices
/// that store the first character in the low byte.
pub fn encode_string(text: &str, reverse: bool) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    if bytes.len() % 2 == 1 {
        bytes.push(0);
    }
    if reverse {
        DataFormat::Badc.reorder(&mut bytes);
    }
    bytes
}

/// Decode text from register memory, dropping trailing NUL padding
pub fn decode_string(bytes: &[u8], reverse: bool) -> String {
    let mut bytes = bytes.to_vec();
    if reverse {
        DataFormat::Badc.reorder(&mut bytes);
    }
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Numeric types that can be stored in register memory
pub trait WireValue: Copy + Send + 'static {
    /// Encoded width in bytes
    const SIZE: usize;

    /// Read from a big-endian slice of exactly `SIZE` bytes
    fn read_be(bytes: &[u8]) -> Self;

    /// Write into a big-endian slice of exactly `SIZE` bytes
    fn write_be(self, out: &mut [u8]);
}

macro_rules! impl_wire_value {
    ($ty:ty, $size:expr, $read:ident, $write:ident) => {
        impl WireValue for $ty {
            const SIZE: usize = $size;

            fn read_be(bytes: &[u8]) -> Self {
                BigEndian::$read(bytes)
            }

            fn write_be(self, out: &mut [u8]) {
                BigEndian::$write(out, self)
            }
        }
    };
}

impl_wire_value!(u16, 2, read_u16, write_u16);
impl_wire_value!(i16, 2, read_i16, write_i16);
impl_wire_value!(u32, 4, read_u32, write_u32);
impl_wire_value!(i32, 4, read_i32, write_i32);
impl_wire_value!(f32, 4, read_f32, write_f32);
impl_wire_value!(u64, 8, read_u64, write_u64);
impl_wire_value!(i64, 8, read_i64, write_i64);
impl_wire_value!(f64, 8, read_f64, write_f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_layouts() {
        let value = 0x1122_3344u32;
        assert_eq!(DataFormat::Abcd.encode(value), vec![0x11, 0x22, 0x33, 0x44]);
        assert_eq!(DataFormat::Badc.encode(value), vec![0x22, 0x11, 0x44, 0x33]);
        assert_eq!(DataFormat::Cdab.encode(value), vec![0x33, 0x44, 0x11, 0x22]);
        assert_eq!(DataFormat::Dcba.encode(value), vec![0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn test_u64_word_swap() {
        let bytes = DataFormat::Cdab.encode(0x0102_0304_0506_0708u64);
        assert_eq!(bytes, vec![0x07, 0x08, 0x05, 0x06, 0x03, 0x04, 0x01, 0x02]);
    }

    #[test]
    fn test_decode_matches_encode() {
        for format in [DataFormat::Abcd, DataFormat::Badc, DataFormat::Cdab, DataFormat::Dcba] {
            let bytes = format.encode(-12.5f32);
            assert_eq!(format.decode::<f32>(&bytes).unwrap(), -12.5);

            let bytes = format.encode(-2i16);
            assert_eq!(format.decode::<i16>(&bytes).unwrap(), -2);
        }
    }

    #[test]
    fn test_string_layouts() {
        assert_eq!(encode_string("ABC", false), vec![b'A', b'B', b'C', 0]);
        assert_eq!(encode_string("ABC", true), vec![b'B', b'A', 0, b'C']);
        assert_eq!(decode_string(&[b'B', b'A', 0, b'C', 0, 0], true), "ABC");
        assert_eq!(decode_string(&[0, 0], false), "");
    }

    #[test]
    fn test_decode_short_input() {
        assert!(DataFormat::Abcd.decode::<u32>(&[0x00, 0x01]).is_err());
    }
}
