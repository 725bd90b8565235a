/// Thread-safe fixed-capacity byte memory
///
/// One `AddressSpace` backs each register class of the data pool. Every
/// accessor takes the instance lock for the whole call and hands back copies,
/// so a reader never observes a partially applied write. The raw buffer is
/// never exposed.
///
/// Bit addressing packs eight bits per byte, least significant bit first:
/// bit `i` lives in byte `i / 8` at offset `i % 8`.

use std::sync::{Mutex, MutexGuard};

use crate::error::{ServerError, ServerResult};
use crate::transform::{DataFormat, WireValue};

/// Fixed-capacity byte buffer guarded by a single lock
#[derive(Debug)]
pub struct AddressSpace {
    capacity: usize,
    buffer: Mutex<Vec<u8>>,
}

impl AddressSpace {
    /// Create a zero-filled address space of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffer: Mutex::new(vec![0u8; capacity]),
        }
    }

    /// Size of the buffer in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of addressable bits
    pub fn bit_capacity(&self) -> usize {
        self.capacity * 8
    }

    fn lock(&self) -> ServerResult<MutexGuard<'_, Vec<u8>>> {
        self.buffer
            .lock()
            .map_err(|_| ServerError::internal("Failed to lock address space"))
    }

    fn check_range(index: usize, length: usize, limit: usize) -> ServerResult<()> {
        match index.checked_add(length) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(ServerError::invalid_address(index, length, limit)),
        }
    }

    /// Read one bit
    pub fn get_bit(&self, index: usize) -> ServerResult<bool> {
        Self::check_range(index, 1, self.bit_capacity())?;
        let buffer = self.lock()?;
        Ok(read_bit(&buffer, index))
    }

    /// Write one bit, leaving the other seven bits of its byte untouched
    pub fn set_bit(&self, index: usize, value: bool) -> ServerResult<()> {
        Self::check_range(index, 1, self.bit_capacity())?;
        let mut buffer = self.lock()?;
        write_bit(&mut buffer, index, value);
        Ok(())
    }

    /// Read `count` consecutive bits starting at bit `index`
    pub fn get_bits(&self, index: usize, count: usize) -> ServerResult<Vec<bool>> {
        Self::check_range(index, count, self.bit_capacity())?;
        let buffer = self.lock()?;
        Ok((index..index + count).map(|i| read_bit(&buffer, i)).collect())
    }

    /// Write consecutive bits starting at bit `index`
    ///
    /// The whole range is validated before any byte is modified.
    pub fn set_bits(&self, index: usize, values: &[bool]) -> ServerResult<()> {
        Self::check_range(index, values.len(), self.bit_capacity())?;
        let mut buffer = self.lock()?;
        for (offset, &value) in values.iter().enumerate() {
            write_bit(&mut buffer, index + offset, value);
        }
        Ok(())
    }

    /// Read one byte
    pub fn get_byte(&self, index: usize) -> ServerResult<u8> {
        Self::check_range(index, 1, self.capacity)?;
        let buffer = self.lock()?;
        Ok(buffer[index])
    }

    /// Write one byte
    pub fn set_byte(&self, index: usize, value: u8) -> ServerResult<()> {
        Self::check_range(index, 1, self.capacity)?;
        let mut buffer = self.lock()?;
        buffer[index] = value;
        Ok(())
    }

    /// Copy `length` bytes starting at `index`
    pub fn get_bytes(&self, index: usize, length: usize) -> ServerResult<Vec<u8>> {
        Self::check_range(index, length, self.capacity)?;
        let buffer = self.lock()?;
        Ok(buffer[index..index + length].to_vec())
    }

    /// Write `data` at `index`, truncated to fit
    ///
    /// Bytes that would fall past the end of the buffer are discarded
    /// without error. Returns the number of bytes actually written, which is
    /// zero when `index` is at or beyond the capacity.
    pub fn set_bytes(&self, data: &[u8], index: usize) -> ServerResult<usize> {
        self.set_bytes_len(data, index, data.len())
    }

    /// Write at most `length` bytes of `data` at `index`, truncated to fit
    pub fn set_bytes_len(&self, data: &[u8], index: usize, length: usize) -> ServerResult<usize> {
        let mut buffer = self.lock()?;
        Ok(copy_truncated(&mut buffer, data, index, length))
    }

    /// Write `data` at `index` and return the range before and after the write
    ///
    /// Old value, write and new value happen under one lock acquisition, so
    /// the pair describes exactly this write and nothing interleaved with it.
    /// The write is truncated like [`AddressSpace::set_bytes`]; both returned
    /// vectors cover only the bytes that were written.
    pub fn replace_bytes(&self, data: &[u8], index: usize) -> ServerResult<(Vec<u8>, Vec<u8>)> {
        let mut buffer = self.lock()?;
        let start = index.min(self.capacity);
        let end = start + data.len().min(self.capacity - start);
        let before = buffer[start..end].to_vec();
        copy_truncated(&mut buffer, data, index, data.len());
        let after = buffer[start..end].to_vec();
        Ok((before, after))
    }

    /// Decode a numeric value stored at `index`
    pub fn get_value<T: WireValue>(&self, index: usize, format: DataFormat) -> ServerResult<T> {
        let bytes = self.get_bytes(index, T::SIZE)?;
        format.decode(&bytes)
    }

    /// Encode a numeric value at `index`, truncated to fit like `set_bytes`
    pub fn set_value<T: WireValue>(&self, index: usize, value: T, format: DataFormat) -> ServerResult<usize> {
        self.set_bytes(&format.encode(value), index)
    }

    /// Copy of the entire buffer
    pub fn dump(&self) -> ServerResult<Vec<u8>> {
        let buffer = self.lock()?;
        Ok(buffer.clone())
    }

    /// Replace the entire buffer
    ///
    /// Fails if `data` is shorter than the capacity; extra trailing bytes are
    /// ignored.
    pub fn load(&self, data: &[u8]) -> ServerResult<()> {
        if data.len() < self.capacity {
            return Err(ServerError::snapshot(self.capacity, data.len()));
        }
        let mut buffer = self.lock()?;
        buffer.copy_from_slice(&data[..self.capacity]);
        Ok(())
    }
}

fn read_bit(buffer: &[u8], index: usize) -> bool {
    buffer[index / 8] & (1u8 << (index % 8)) != 0
}

fn write_bit(buffer: &mut [u8], index: usize, value: bool) {
    let mask = 1u8 << (index % 8);
    let byte = &mut buffer[index / 8];
    if value {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
}

fn copy_truncated(buffer: &mut [u8], data: &[u8], index: usize, length: usize) -> usize {
    if index >= buffer.len() {
        return 0;
    }
    let count = length.min(data.len()).min(buffer.len() - index);
    buffer[index..index + count].copy_from_slice(&data[..count]);
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;

    fn random_space(capacity: usize) -> AddressSpace {
        let space = AddressSpace::new(capacity);
        let mut rng = rand::thread_rng();
        let data: Vec<u8> = (0..capacity).map(|_| rng.gen()).collect();
        space.set_bytes(&data, 0).unwrap();
        space
    }

    #[test]
    fn test_bit_isolation_exhaustive() {
        for capacity in 1..=4 {
            let space = random_space(capacity);
            for i in 0..space.bit_capacity() {
                let before = space.get_bits(0, space.bit_capacity()).unwrap();

                space.set_bit(i, true).unwrap();
                assert!(space.get_bit(i).unwrap());
                space.set_bit(i, false).unwrap();
                assert!(!space.get_bit(i).unwrap());

                let after = space.get_bits(0, space.bit_capacity()).unwrap();
                for j in 0..space.bit_capacity() {
                    if j != i {
                        assert_eq!(before[j], after[j], "bit {} disturbed by writing bit {}", j, i);
                    }
                }
                space.set_bit(i, before[i]).unwrap();
            }
        }
    }

    #[test]
    fn test_bit_isolation_large_space() {
        let space = random_space(65536);
        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let i = rng.gen_range(0..space.bit_capacity());
            let byte_index = i / 8;
            let byte_before = space.get_byte(byte_index).unwrap();
            let value = rng.gen::<bool>();

            space.set_bit(i, value).unwrap();

            let byte_after = space.get_byte(byte_index).unwrap();
            let mask = 1u8 << (i % 8);
            assert_eq!(byte_before & !mask, byte_after & !mask);
            assert_eq!(byte_after & mask != 0, value);
        }
    }

    #[test]
    fn test_set_bits_packing() {
        let space = AddressSpace::new(4);
        space.set_bits(3, &[true, true, false, true, true, true, true, true, true]).unwrap();
        assert_eq!(space.get_bytes(0, 3).unwrap(), vec![0b1101_1000, 0b0000_1111, 0x00]);
        assert_eq!(space.get_bits(3, 4).unwrap(), vec![true, true, false, true]);
    }

    #[test]
    fn test_bit_range_rejected() {
        let space = AddressSpace::new(2);
        assert!(space.get_bit(16).is_err());
        assert!(space.set_bit(16, true).is_err());
        assert!(space.set_bits(10, &[true; 7]).is_err());
        // A rejected batch leaves memory untouched
        assert_eq!(space.dump().unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_truncation_policy() {
        let space = AddressSpace::new(16);
        let written = space.set_bytes(&[0xAA; 10], 10).unwrap();
        assert_eq!(written, 6);
        assert_eq!(space.get_bytes(10, 6).unwrap(), vec![0xAA; 6]);
        assert_eq!(space.get_bytes(0, 10).unwrap(), vec![0x00; 10]);

        assert_eq!(space.set_bytes(&[0x55; 4], 16).unwrap(), 0);
        assert_eq!(space.set_bytes(&[0x55; 4], 100).unwrap(), 0);
        assert_eq!(space.set_bytes_len(&[0x11; 8], 0, 3).unwrap(), 3);
        assert_eq!(space.get_bytes(0, 4).unwrap(), vec![0x11, 0x11, 0x11, 0x00]);
    }

    #[test]
    fn test_get_bytes_out_of_range() {
        let space = AddressSpace::new(8);
        assert!(space.get_bytes(4, 5).is_err());
        assert!(space.get_bytes(usize::MAX, 2).is_err());
        assert_eq!(space.get_bytes(8, 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_replace_bytes() {
        let space = AddressSpace::new(6);
        space.set_bytes(&[1, 2, 3, 4, 5, 6], 0).unwrap();
        let (before, after) = space.replace_bytes(&[9, 9, 9], 4).unwrap();
        assert_eq!(before, vec![5, 6]);
        assert_eq!(after, vec![9, 9]);
    }

    #[test]
    fn test_numeric_views() {
        let space = AddressSpace::new(8);
        space.set_value(2, 1234.5f32, DataFormat::Cdab).unwrap();
        assert_eq!(space.get_value::<f32>(2, DataFormat::Cdab).unwrap(), 1234.5);
        space.set_value(0, -3i16, DataFormat::Abcd).unwrap();
        assert_eq!(space.get_bytes(0, 2).unwrap(), vec![0xFF, 0xFD]);
        assert!(space.get_value::<u64>(4, DataFormat::Abcd).is_err());
    }

    #[test]
    fn test_dump_load() {
        let space = random_space(32);
        let blob = space.dump().unwrap();

        let fresh = AddressSpace::new(32);
        fresh.load(&blob).unwrap();
        assert_eq!(fresh.get_bytes(0, 32).unwrap(), blob);

        let err = fresh.load(&blob[..31]).unwrap_err();
        assert!(matches!(err, ServerError::Snapshot { expected: 32, actual: 31 }));
    }

    #[test]
    fn test_reads_never_see_partial_writes() {
        let space = Arc::new(AddressSpace::new(64));
        std::thread::scope(|scope| {
            for value in [0x00u8, 0xFF] {
                let space = space.clone();
                scope.spawn(move || {
                    for _ in 0..500 {
                        space.set_bytes(&[value; 64], 0).unwrap();
                    }
                });
            }
            for _ in 0..500 {
                let snapshot = space.get_bytes(0, 64).unwrap();
                assert!(snapshot.iter().all(|&b| b == snapshot[0]));
            }
        });
    }
}
