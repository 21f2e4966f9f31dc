//! Fixed-capacity buffers handed out by a [BufferPool](crate::buffers::buffer_pool::BufferPool).
//!
//! Their salient points are:
//!
//! * backed by a fixed-length, pre-allocated storage vector that goes back to its pool when the
//!   last owner lets go of it
//! * [PooledBuf] is the unique, writable stage: it is filled (implementing `BufMut` to fit into
//!   the `bytes` ecosystem) and then frozen
//! * [SharedBuf] is the frozen, read-only stage: cloning it takes a reference, dropping a clone
//!   releases that reference. There is no other way to release a buffer, so a reference cannot
//!   be released twice, and a released buffer cannot be reached anymore.

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use bytes::buf::UninitSlice;
use crate::buffers::buffer_pool::BufferPool;

/// A fixed-capacity buffer owned exclusively by its holder
pub struct PooledBuf {
    // `None` only transiently during drop
    storage: Option<Vec<u8>>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    pub(crate) fn new(storage: Vec<u8>, pool: Arc<BufferPool>) -> PooledBuf {
        PooledBuf {
            storage: Some(storage),
            len: 0,
            pool,
        }
    }

    fn storage(&self) -> &[u8] {
        self.storage.as_deref().unwrap_or_default()
    }

    fn storage_mut(&mut self) -> &mut [u8] {
        self.storage.as_deref_mut().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.storage().len()
    }

    /// make the entire underlying buffer available through as_mut(), e.g. for receiving a datagram
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Turns this buffer into its shared, read-only form with a single reference
    pub fn freeze(self) -> SharedBuf {
        SharedBuf {
            inner: Arc::new(self),
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.release(storage);
        }
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.storage()[..self.len]
    }
}

impl AsMut<[u8]> for PooledBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.storage_mut()[..len]
    }
}

impl Debug for PooledBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

unsafe impl bytes::BufMut for PooledBuf {
    fn remaining_mut(&self) -> usize {
        self.capacity() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        let len = self.len;
        UninitSlice::new(&mut self.storage_mut()[len..])
    }
}


/// A reference to a frozen pool buffer. `clone()` takes an additional reference, `drop()`
///  releases one; the storage returns to the pool when the last reference is dropped.
#[derive(Clone)]
pub struct SharedBuf {
    inner: Arc<PooledBuf>,
}

impl SharedBuf {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl AsRef<[u8]> for SharedBuf {
    fn as_ref(&self) -> &[u8] {
        (*self.inner).as_ref()
    }
}

impl Borrow<[u8]> for SharedBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl PartialEq for SharedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}
impl Eq for SharedBuf {}

impl Debug for SharedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}
