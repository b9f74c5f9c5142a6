use std::fmt::Debug;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::Notify;
use tracing::trace;

/// Called once when a buffer is returned to a pool that previously had
/// none to give.
pub type BufferWaiter = Arc<dyn Fn() + Send + Sync>;

struct PoolState {
    free: Vec<(usize, BytesMut)>,
    waiters: Vec<BufferWaiter>,
}

struct PoolInner {
    buffer_size: usize,
    count: usize,
    state: Mutex<PoolState>,
    notify: Notify,
}

/// Fixed set of equally sized buffers. Handing out more leases than
/// `count` is impossible, a caller asking for more is told to wait.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("count", &self.inner.count)
            .field("available", &self.available())
            .finish()
    }
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let count = count.max(1);
        let free = (0..count)
            .rev()
            .map(|slot| (slot, BytesMut::with_capacity(buffer_size)))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                count,
                state: Mutex::new(PoolState {
                    free,
                    waiters: vec![],
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn count(&self) -> usize {
        self.inner.count
    }

    pub fn available(&self) -> usize {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        self.inner.state.lock().unwrap().free.len()
    }

    /// Takes a buffer if one is free. Otherwise `waiter` is remembered and
    /// called when a buffer comes back.
    pub fn try_lease(&self, waiter: Option<&BufferWaiter>) -> Option<BufferLease> {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut state = self.inner.state.lock().unwrap();
        match state.free.pop() {
            Some((slot, buffer)) => Some(BufferLease {
                slot,
                buffer: Some(buffer),
                pool: self.inner.clone(),
            }),
            None => {
                if let Some(waiter) = waiter {
                    if !state.waiters.iter().any(|w| Arc::ptr_eq(w, waiter)) {
                        state.waiters.push(waiter.clone());
                    }
                }
                None
            }
        }
    }

    pub async fn lease(&self) -> BufferLease {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(lease) = self.try_lease(None) {
                return lease;
            }
            notified.await;
        }
    }

    pub fn remove_waiter(&self, waiter: &BufferWaiter) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut state = self.inner.state.lock().unwrap();
        state.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
    }
}

/// Exclusive use of one pool buffer until dropped.
pub struct BufferLease {
    slot: usize,
    buffer: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl BufferLease {
    /// Index of the buffer in the pool, stable for the pool's lifetime.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Byte offset of this buffer inside a region holding all buffers of
    /// the pool back to back.
    pub fn region_offset(&self) -> u64 {
        (self.slot * self.pool.buffer_size) as u64
    }

    pub fn capacity(&self) -> usize {
        self.pool.buffer_size
    }

    pub fn spare(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }
}

impl Debug for BufferLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("slot", &self.slot)
            .field("len", &self.len())
            .finish()
    }
}

impl Deref for BufferLease {
    type Target = BytesMut;

    #[allow(clippy::unwrap_used, reason = "only taken in drop")]
    fn deref(&self) -> &Self::Target {
        self.buffer.as_ref().unwrap()
    }
}

impl DerefMut for BufferLease {
    #[allow(clippy::unwrap_used, reason = "only taken in drop")]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_mut().unwrap()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        let Some(mut buffer) = self.buffer.take() else {
            return;
        };
        buffer.clear();
        let waiter = {
            #[allow(clippy::unwrap_used, reason = "panic on poison")]
            let mut state = self.pool.state.lock().unwrap();
            state.free.push((self.slot, buffer));
            (!state.waiters.is_empty()).then(|| state.waiters.remove(0))
        };
        trace!(slot = self.slot, "Buffer returned");
        self.pool.notify.notify_one();
        if let Some(waiter) = waiter {
            waiter();
        }
    }
}
