use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};
use crate::buffers::fixed_buffer::PooledBuf;

/// A pool of fixed-size byte buffers backing all wire I/O.
///
/// Buffers are handed out as [PooledBuf] and find their way back here when their last owner
///  drops them. The pool keeps at most `max_pool_size` idle buffers - buffers in excess of this
///  number are discarded when they are returned.
///
/// NB: The pool is shared by all connections of an end point and is deliberately independent of
///      any connection-level lock
pub struct BufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
    num_acquired: AtomicU64,
    num_released: AtomicU64,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
            num_acquired: AtomicU64::new(0),
            num_released: AtomicU64::new(0),
        })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    fn idle_buffers(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        // the protected data is a plain list of buffers, so a panic while holding the lock cannot
        //  leave it in an inconsistent state
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        self.num_acquired.fetch_add(1, Ordering::AcqRel);

        if let Some(storage) = self.idle_buffers().pop() {
            trace!("returning buffer from pool");
            return PooledBuf::new(storage, self.clone());
        }

        debug!("no buffer in pool: creating new buffer");
        PooledBuf::new(vec![0; self.buf_size], self.clone())
    }

    /// called exactly once per acquired buffer, when its last owner drops it
    pub(crate) fn release(&self, storage: Vec<u8>) {
        self.num_released.fetch_add(1, Ordering::AcqRel);

        if storage.len() != self.buf_size {
            debug!("returned buffer does not have the regular size of {} bytes - discarding", self.buf_size);
            return;
        }

        let mut buffers = self.idle_buffers();
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(storage);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    /// number of buffers that were acquired and not released yet
    pub fn outstanding(&self) -> u64 {
        let released = self.num_released.load(Ordering::Acquire);
        self.num_acquired.load(Ordering::Acquire).saturating_sub(released)
    }

    pub fn num_pooled(&self) -> usize {
        self.idle_buffers().len()
    }
}
