//! Reusable receive buffers.
//!
//! The transport checks a buffer out for every socket read and returns it
//! once the handler has seen the datagram. A warmed pool never allocates.

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use simwire_core::wire::MAX_PACKET_SIZE;

/// One datagram's worth of storage plus where it came from.
#[derive(Debug)]
pub struct PacketBuffer {
    data: Box<[u8]>,
    len: usize,
    remote: Option<SocketAddr>,
}

impl PacketBuffer {
    fn with_capacity(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            len: 0,
            remote: None,
        }
    }

    /// Occupied bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Sender of the datagram, once filled.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Whole backing storage, for the socket to write into.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record a completed read of `len` bytes from `remote`.
    pub fn filled(&mut self, len: usize, remote: SocketAddr) {
        self.len = len.min(self.data.len());
        self.remote = Some(remote);
    }

    fn reset(&mut self) {
        self.len = 0;
        self.remote = None;
    }
}

#[derive(Debug)]
struct PoolInner {
    buffer_size: usize,
    free: Mutex<Vec<PacketBuffer>>,
    allocated: AtomicUsize,
}

/// Mutex-guarded free list of [`PacketBuffer`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self::with_preallocated(buffer_size, 0)
    }

    /// A pool with `count` buffers ready up front.
    pub fn with_preallocated(buffer_size: usize, count: usize) -> Self {
        let free = (0..count)
            .map(|_| PacketBuffer::with_capacity(buffer_size))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                free: Mutex::new(free),
                allocated: AtomicUsize::new(count),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Take a free buffer, allocating one if the free list is empty.
    ///
    /// The buffer goes back to the pool when the guard drops.
    pub fn acquire(&self) -> PooledBuffer {
        let reused = lock(&self.inner.free).pop();
        let buffer = match reused {
            Some(buffer) => buffer,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(size = self.inner.buffer_size, "pool allocating buffer");
                PacketBuffer::with_capacity(self.inner.buffer_size)
            }
        };
        PooledBuffer {
            buffer: Some(buffer),
            pool: self.clone(),
        }
    }

    /// Return a buffer to the free list. Its occupied length is reset.
    pub fn release(&self, mut buffer: PacketBuffer) {
        buffer.reset();
        lock(&self.inner.free).push(buffer);
    }

    /// Total buffers this pool has ever created.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Buffers currently on the free list.
    pub fn available(&self) -> usize {
        lock(&self.inner.free).len()
    }
}

/// Poisoning only means another thread panicked mid-push; the list is still valid.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A checked-out buffer. Dereferences to [`PacketBuffer`].
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<PacketBuffer>,
    pool: BufferPool,
}

impl PooledBuffer {
    /// Detach the buffer from the pool. It will not be returned on drop.
    pub fn into_inner(mut self) -> PacketBuffer {
        match self.buffer.take() {
            Some(buffer) => buffer,
            None => unreachable!("buffer is only taken on drop or here"),
        }
    }
}

impl Deref for PooledBuffer {
    type Target = PacketBuffer;

    fn deref(&self) -> &PacketBuffer {
        match &self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("buffer is only taken on drop or into_inner"),
        }
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut PacketBuffer {
        match &mut self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("buffer is only taken on drop or into_inner"),
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}
