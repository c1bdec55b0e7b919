//! Sealable shared-memory objects for large payloads.
//!
//! A memfd is created by one connection, filled, sealed and then attached to
//! a message as a `PAYLOAD_MEMFD` item. Delivery hands the recipient another
//! reference to the same object instead of copying the bytes through its
//! pool.
//!
//! Once sealed a memfd is read-only and fixed-size for the rest of its life;
//! size changes and writes are rejected with [`BusError::SealedReadOnly`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::error::{BusError, BusResult};

/// A sealable, resizable shared memory region.
#[derive(Debug)]
pub struct Memfd {
    handle: u32,
    state: RwLock<MemfdState>,
}

#[derive(Debug, Default)]
struct MemfdState {
    data: Vec<u8>,
    sealed: bool,
}

impl Memfd {
    /// Creates an unsealed memfd of `size` zero bytes.
    #[must_use]
    pub fn new(handle: u32, size: usize) -> Self {
        Self {
            handle,
            state: RwLock::new(MemfdState {
                data: vec![0; size],
                sealed: false,
            }),
        }
    }

    /// Bus-wide handle.
    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle
    }

    /// Current size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.read().expect("lock poisoned").data.len() as u64
    }

    /// Returns `true` once sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.state.read().expect("lock poisoned").sealed
    }

    /// Resizes the region, zero-filling growth.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SealedReadOnly`] after [`Memfd::seal`].
    pub fn set_size(&self, size: usize) -> BusResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.sealed {
            return Err(self.sealed_error());
        }
        state.data.resize(size, 0);
        Ok(())
    }

    /// Writes `data` at `offset`, growing the region if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SealedReadOnly`] after [`Memfd::seal`].
    pub fn write(&self, offset: usize, data: &[u8]) -> BusResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.sealed {
            return Err(self.sealed_error());
        }
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| BusError::invalid_argument("memfd write overflows"))?;
        if state.data.len() < end {
            state.data.resize(end, 0);
        }
        state.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Makes the memfd immutable. Sealing twice is a no-op.
    pub fn seal(&self) {
        self.state.write().expect("lock poisoned").sealed = true;
    }

    /// Snapshot of the contents.
    #[must_use]
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.read().expect("lock poisoned").data)
    }

    const fn sealed_error(&self) -> BusError {
        BusError::SealedReadOnly {
            handle: self.handle as u64,
        }
    }
}

/// The memfds one connection holds a reference to.
#[derive(Debug, Default)]
pub struct MemfdTable {
    held: HashMap<u32, Arc<Memfd>>,
}

impl MemfdTable {
    /// Adds a reference.
    pub fn insert(&mut self, memfd: Arc<Memfd>) {
        self.held.insert(memfd.handle(), memfd);
    }

    /// Looks up a held memfd.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] if this connection does not hold
    /// `handle`.
    pub fn get(&self, handle: u32) -> BusResult<Arc<Memfd>> {
        self.held
            .get(&handle)
            .cloned()
            .ok_or(BusError::InvalidHandle {
                handle: u64::from(handle),
            })
    }

    /// Drops this connection's reference.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] if `handle` is not held.
    pub fn remove(&mut self, handle: u32) -> BusResult<()> {
        self.held
            .remove(&handle)
            .map(drop)
            .ok_or(BusError::InvalidHandle {
                handle: u64::from(handle),
            })
    }

    /// Number of held memfds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Returns `true` if no memfd is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_before_seal() {
        let memfd = Memfd::new(1, 16);
        memfd.set_size(64).unwrap();
        assert_eq!(memfd.size(), 64);
        assert!(!memfd.is_sealed());
    }

    #[test]
    fn test_sealed_rejects_resize_and_write() {
        let memfd = Memfd::new(3, 8);
        memfd.write(0, b"payload!").unwrap();
        memfd.seal();
        assert!(memfd.is_sealed());

        assert_eq!(
            memfd.set_size(4),
            Err(BusError::SealedReadOnly { handle: 3 })
        );
        assert_eq!(
            memfd.write(0, b"x"),
            Err(BusError::SealedReadOnly { handle: 3 })
        );
        assert_eq!(memfd.contents(), Bytes::from_static(b"payload!"));
        assert_eq!(memfd.size(), 8);
    }

    #[test]
    fn test_write_grows_region() {
        let memfd = Memfd::new(2, 0);
        memfd.write(4, b"ab").unwrap();
        assert_eq!(memfd.contents(), Bytes::from_static(b"\0\0\0\0ab"));
    }

    #[test]
    fn test_table_shares_object() {
        let memfd = Arc::new(Memfd::new(9, 4));
        let mut a = MemfdTable::default();
        let mut b = MemfdTable::default();
        a.insert(Arc::clone(&memfd));
        b.insert(Arc::clone(&memfd));

        a.get(9).unwrap().write(0, b"abcd").unwrap();
        assert_eq!(b.get(9).unwrap().contents(), Bytes::from_static(b"abcd"));

        a.remove(9).unwrap();
        assert!(a.get(9).is_err());
        assert!(b.get(9).is_ok());
        assert!(a.remove(9).is_err());
    }
}
