//! Per-connection receive pool.
//!
//! Every connection owns a fixed-capacity pool. The router copies each
//! delivered message into a slice of the recipient's pool and queues the
//! slice's offset; the recipient reads the slice and frees it by offset.
//!
//! Offsets are the only handles handed out. A freed or never-allocated
//! offset is rejected with [`BusError::InvalidHandle`], so a double free or a
//! read after free is detected rather than touching another message.
//!
//! # Invariants
//!
//! - Live slices never overlap.
//! - The pool never grows past its capacity; running out of space is a
//!   [`BusError::PoolExhausted`] for that one delivery.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{BusError, BusResult};
use crate::item::align8;

/// Fixed-capacity slice allocator with its backing bytes.
#[derive(Debug)]
pub struct Pool {
    capacity: u64,
    /// Backing storage, grown lazily up to `capacity`.
    buf: Vec<u8>,
    /// Live slices: offset -> requested length.
    slices: BTreeMap<u64, u64>,
    /// Bytes reserved by live slices (aligned).
    used: u64,
}

impl Pool {
    /// Creates an empty pool.
    #[must_use]
    pub const fn new(capacity: u64) -> Self {
        Self {
            capacity,
            buf: Vec::new(),
            slices: BTreeMap::new(),
            used: 0,
        }
    }

    /// Pool capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes not reserved by live slices.
    #[must_use]
    pub const fn available(&self) -> u64 {
        self.capacity - self.used
    }

    /// Number of live slices.
    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Reserves `size` bytes and returns the slice offset.
    ///
    /// First fit over the gaps between live slices; never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidArgument`] for a zero size and
    /// [`BusError::PoolExhausted`] when no gap is large enough.
    pub fn allocate(&mut self, size: u64) -> BusResult<u64> {
        if size == 0 {
            return Err(BusError::invalid_argument("zero-sized pool allocation"));
        }
        let needed = align8(size);

        let mut cursor = 0u64;
        let mut found = None;
        for (&offset, &len) in &self.slices {
            if offset - cursor >= needed {
                found = Some(cursor);
                break;
            }
            cursor = offset + align8(len);
        }
        let offset = match found {
            Some(offset) => offset,
            None if self.capacity.saturating_sub(cursor) >= needed => cursor,
            None => {
                return Err(BusError::PoolExhausted {
                    requested: size,
                    available: self.available(),
                });
            },
        };

        let end = usize::try_from(offset + needed)
            .map_err(|_| BusError::invalid_argument("pool offset does not fit in memory"))?;
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.slices.insert(offset, size);
        self.used += needed;
        Ok(offset)
    }

    /// Releases the slice starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] if no live slice starts there.
    pub fn free(&mut self, offset: u64) -> BusResult<()> {
        let len = self
            .slices
            .remove(&offset)
            .ok_or(BusError::InvalidHandle { handle: offset })?;
        self.used -= align8(len);
        Ok(())
    }

    /// Copies `data` into a live slice at `dest_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] unless the whole destination range
    /// lies inside one live slice.
    pub fn write_vec(&mut self, dest_offset: u64, data: &[u8]) -> BusResult<()> {
        let range = self.checked_range(dest_offset, data.len() as u64)?;
        self.buf[range].copy_from_slice(data);
        Ok(())
    }

    /// Reads `size` bytes at `offset`.
    ///
    /// The range may start anywhere inside a live slice, which is how payload
    /// offsets embedded in a delivered message are resolved.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] unless the range lies inside one
    /// live slice.
    pub fn read(&self, offset: u64, size: u64) -> BusResult<Bytes> {
        let range = self.checked_range(offset, size)?;
        Ok(Bytes::copy_from_slice(&self.buf[range]))
    }

    /// Reads the whole slice starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] if no live slice starts there.
    pub fn read_slice(&self, offset: u64) -> BusResult<Bytes> {
        let len = self
            .slices
            .get(&offset)
            .copied()
            .ok_or(BusError::InvalidHandle { handle: offset })?;
        self.read(offset, len)
    }

    fn checked_range(&self, offset: u64, size: u64) -> BusResult<std::ops::Range<usize>> {
        let invalid = BusError::InvalidHandle { handle: offset };
        let (&start, &len) = self
            .slices
            .range(..=offset)
            .next_back()
            .ok_or_else(|| invalid.clone())?;
        let end = offset.checked_add(size).ok_or_else(|| invalid.clone())?;
        if end > start + len {
            return Err(invalid);
        }
        // Slices live inside `buf`, which fits in memory.
        Ok(offset as usize..end as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_do_not_overlap() {
        let mut pool = Pool::new(1024);
        let a = pool.allocate(10).unwrap();
        let b = pool.allocate(10).unwrap();
        let c = pool.allocate(100).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 16);
        assert_eq!(c, 32);
        assert_eq!(pool.available(), 1024 - 16 - 16 - 104);
    }

    #[test]
    fn test_exhaustion_is_an_error_not_growth() {
        let mut pool = Pool::new(64);
        pool.allocate(48).unwrap();
        let err = pool.allocate(32).unwrap_err();
        assert_eq!(
            err,
            BusError::PoolExhausted {
                requested: 32,
                available: 16,
            }
        );
        assert_eq!(pool.capacity(), 64);
    }

    #[test]
    fn test_freed_gap_is_reused() {
        let mut pool = Pool::new(64);
        let a = pool.allocate(16).unwrap();
        let _b = pool.allocate(16).unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.allocate(8).unwrap(), a);
    }

    #[test]
    fn test_double_free_is_invalid_handle() {
        let mut pool = Pool::new(64);
        let a = pool.allocate(16).unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.free(a), Err(BusError::InvalidHandle { handle: a }));
    }

    #[test]
    fn test_read_after_free_is_invalid_handle() {
        let mut pool = Pool::new(64);
        let a = pool.allocate(4).unwrap();
        pool.write_vec(a, b"abcd").unwrap();
        assert_eq!(pool.read_slice(a).unwrap(), Bytes::from_static(b"abcd"));
        pool.free(a).unwrap();
        assert!(pool.read_slice(a).is_err());
    }

    #[test]
    fn test_write_past_slice_rejected() {
        let mut pool = Pool::new(64);
        let a = pool.allocate(4).unwrap();
        assert!(pool.write_vec(a, b"abcdefgh").is_err());
    }

    #[test]
    fn test_read_inside_slice() {
        let mut pool = Pool::new(64);
        let a = pool.allocate(8).unwrap();
        pool.write_vec(a, b"abcdefgh").unwrap();
        assert_eq!(pool.read(a + 2, 3).unwrap(), Bytes::from_static(b"cde"));
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut pool = Pool::new(64);
        assert!(matches!(
            pool.allocate(0),
            Err(BusError::InvalidArgument { .. })
        ));
    }
}
