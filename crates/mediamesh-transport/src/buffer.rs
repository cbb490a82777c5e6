//! Pre-registered buffer pool.
//!
//! One contiguous page-aligned block is carved into `queue_depth` fixed-size
//! buffers, each registered with the fabric once at pool creation. Buffers
//! circulate between the free FIFO, the fabric (posted) and at most one
//! holder; the block itself is freed only when the pool and every
//! outstanding lease are gone.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::warn;

use crate::context::{Context, WaitOutcome};
use crate::error::{Result, TransportError};
use crate::fabric::{FabricEndpoint, MrHandle, DEFAULT_POLL_TIMEOUT};

/// Allocation granularity of the buffer block.
pub const PAGE_SIZE: usize = 4096;

fn round_to_page(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

struct BufferBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Safety: the block is plain memory; slices handed out by the pool never
// overlap because each buffer index owns a disjoint range.
unsafe impl Send for BufferBlock {}
unsafe impl Sync for BufferBlock {}

impl BufferBlock {
    fn allocate(total: usize) -> Result<Self> {
        let layout = Layout::from_size_align(total, PAGE_SIZE).map_err(|e| {
            TransportError::MemoryRegistrationFailed {
                reason: format!("bad block layout: {e}"),
            }
        })?;
        // Safety: layout has non-zero size (validated by the caller).
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| TransportError::MemoryRegistrationFailed {
            reason: format!("allocation of {total} bytes failed"),
        })?;
        Ok(BufferBlock { ptr, layout })
    }
}

impl Drop for BufferBlock {
    fn drop(&mut self) {
        // Safety: allocated with this exact layout in `allocate`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Number of buffers in the pool.
    pub capacity: usize,
    /// Buffers currently in the free FIFO.
    pub available: usize,
    /// Total successful acquires since creation.
    pub acquired_total: u64,
    /// Total releases since creation.
    pub released_total: u64,
    /// Whether the pool has been closed.
    pub closed: bool,
}

struct PoolInner {
    free: VecDeque<usize>,
    closed: bool,
}

/// Fixed-count pool of fabric-registered buffers.
pub struct BufferPool {
    block: BufferBlock,
    buf_size: usize,
    count: usize,
    endpoint: Arc<dyn FabricEndpoint>,
    mrs: Vec<MrHandle>,
    inner: Mutex<PoolInner>,
    cv: Condvar,
    // Lets a wait-free fast path skip the mutex when the pool is known
    // non-empty.
    available: AtomicBool,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
}

impl BufferPool {
    /// Allocate one `count x buffer_size` block (size rounded up to a page),
    /// register every buffer with `endpoint`, and seed the free FIFO.
    ///
    /// On registration failure every already-registered buffer is
    /// unregistered before the error is returned.
    pub fn init(
        endpoint: Arc<dyn FabricEndpoint>,
        count: usize,
        buffer_size: usize,
    ) -> Result<Arc<BufferPool>> {
        if count == 0 || buffer_size == 0 {
            return Err(TransportError::bad_argument(
                "pool requires non-zero count and buffer size",
            ));
        }
        let buf_size = round_to_page(buffer_size);
        let block = BufferBlock::allocate(buf_size * count)?;

        let mut mrs = Vec::with_capacity(count);
        for index in 0..count {
            let addr = block.ptr.as_ptr() as u64 + (index * buf_size) as u64;
            match endpoint.register_memory(addr, buf_size) {
                Ok(mr) => mrs.push(mr),
                Err(e) => {
                    for mr in mrs {
                        let _ = endpoint.unregister_memory(mr);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Arc::new(BufferPool {
            block,
            buf_size,
            count,
            endpoint,
            mrs,
            inner: Mutex::new(PoolInner {
                free: (0..count).collect(),
                closed: false,
            }),
            cv: Condvar::new(),
            available: AtomicBool::new(true),
            acquired_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
        }))
    }

    /// Number of buffers in the pool.
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Usable size of each buffer (the configured size rounded to a page).
    pub fn buffer_size(&self) -> usize {
        self.buf_size
    }

    /// Wait-free check whether the free FIFO was non-empty when last
    /// observed.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub(crate) fn addr_of(&self, index: usize) -> u64 {
        debug_assert!(index < self.count);
        self.block.ptr.as_ptr() as u64 + (index * self.buf_size) as u64
    }

    pub(crate) fn mr_of(&self, index: usize) -> MrHandle {
        self.mrs[index]
    }

    fn take_front(&self, inner: &mut PoolInner) -> Option<usize> {
        let index = inner.free.pop_front()?;
        if inner.free.is_empty() {
            self.available.store(false, Ordering::SeqCst);
        }
        self.acquired_total.fetch_add(1, Ordering::SeqCst);
        Some(index)
    }

    /// Block until a buffer is available, the context is cancelled
    /// (`Cancelled`) or the pool is closed (`ConnClosed`). FIFO order.
    pub fn acquire(self: &Arc<Self>, ctx: &Context) -> Result<PooledBuffer> {
        let guard = self.inner.lock().unwrap();
        let (mut guard, outcome) = ctx.wait(&self.cv, guard, DEFAULT_POLL_TIMEOUT, |inner| {
            inner.closed || !inner.free.is_empty()
        });
        match outcome {
            WaitOutcome::Cancelled => Err(TransportError::Cancelled),
            WaitOutcome::Signalled => {
                if guard.closed {
                    return Err(TransportError::ConnClosed);
                }
                let index = self.take_front(&mut guard).ok_or(TransportError::NoBuffer)?;
                Ok(PooledBuffer {
                    pool: Arc::clone(self),
                    index,
                    len: 0,
                })
            }
        }
    }

    /// Non-blocking acquire; `NoBuffer` if the free FIFO is empty.
    pub fn try_acquire(self: &Arc<Self>) -> Result<PooledBuffer> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(TransportError::ConnClosed);
        }
        let index = self.take_front(&mut inner).ok_or(TransportError::NoBuffer)?;
        Ok(PooledBuffer {
            pool: Arc::clone(self),
            index,
            len: 0,
        })
    }

    /// Pop a free buffer index without constructing a guard. Used by the
    /// workers when handing buffers straight to the fabric.
    pub(crate) fn try_pop(&self) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return None;
        }
        self.take_front(&mut inner)
    }

    /// Return a buffer to the free FIFO and wake one waiter. No-op after
    /// close.
    pub(crate) fn release_index(&self, index: usize) {
        debug_assert!(index < self.count);
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        debug_assert!(!inner.free.contains(&index), "double release of buffer");
        inner.free.push_back(index);
        self.available.store(true, Ordering::SeqCst);
        self.released_total.fetch_add(1, Ordering::SeqCst);
        self.cv.notify_one();
    }

    /// Close the pool: wake every waiter with `ConnClosed` and unregister
    /// the buffers. The block itself is freed once the last lease drops.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.free.clear();
            self.available.store(false, Ordering::SeqCst);
            self.cv.notify_all();
        }
        for mr in &self.mrs {
            if let Err(e) = self.endpoint.unregister_memory(*mr) {
                warn!(error = %e, "failed to unregister buffer memory");
            }
        }
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> BufferPoolStats {
        let inner = self.inner.lock().unwrap();
        BufferPoolStats {
            capacity: self.count,
            available: inner.free.len(),
            acquired_total: self.acquired_total.load(Ordering::SeqCst),
            released_total: self.released_total.load(Ordering::SeqCst),
            closed: inner.closed,
        }
    }

    pub(crate) fn lease(self: &Arc<Self>, index: usize, len: usize) -> FrameLease {
        FrameLease {
            pool: Arc::clone(self),
            index,
            len: len.min(self.buf_size),
        }
    }
}

/// A writable buffer checked out of the pool. Returned to the free FIFO on
/// drop unless it is [`detach`]ed for posting to the fabric.
///
/// [`detach`]: PooledBuffer::detach
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    index: usize,
    len: usize,
}

impl PooledBuffer {
    /// Index of this buffer within the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Fabric address of the buffer start.
    pub fn addr(&self) -> u64 {
        self.pool.addr_of(self.index)
    }

    /// Memory-region handle registered for this buffer.
    pub fn mr(&self) -> MrHandle {
        self.pool.mr_of(self.index)
    }

    /// Buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.pool.buf_size
    }

    /// Bytes of payload written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no payload has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `payload` into the buffer. The caller has validated the length
    /// against the transfer size.
    pub fn fill(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= self.capacity());
        let dst = self.pool.addr_of(self.index) as *mut u8;
        // Safety: the buffer's range is disjoint from every other index and
        // this guard is its only holder.
        unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, payload.len()) };
        self.len = payload.len();
    }

    /// Hand ownership of the buffer to the fabric. The completion reaper
    /// releases it by index once the matching completion arrives.
    pub fn detach(self) -> usize {
        let index = self.index;
        std::mem::forget(self);
        index
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release_index(self.index);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let ptr = self.pool.addr_of(self.index) as *const u8;
        // Safety: exclusive holder of a disjoint range; see `fill`.
        unsafe { std::slice::from_raw_parts(ptr, self.len) }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let ptr = self.pool.addr_of(self.index) as *mut u8;
        // Safety: exclusive holder of a disjoint range; see `fill`.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.len) }
    }
}

/// A received payload, still living in its pool buffer.
///
/// Dropping the lease releases the buffer back to the pool; the receive
/// worker then re-posts it to the fabric. Holding leases therefore
/// backpressures the sender once the pool drains.
pub struct FrameLease {
    pool: Arc<BufferPool>,
    index: usize,
    len: usize,
}

impl FrameLease {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for FrameLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let ptr = self.pool.addr_of(self.index) as *const u8;
        // Safety: the buffer is in-flight to exactly this lease until drop,
        // and the block outlives the lease via the pool Arc.
        unsafe { std::slice::from_raw_parts(ptr, self.len) }
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        self.pool.release_index(self.index);
    }
}

impl std::fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLease")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric_sim::SimFabric;
    use crate::fabric::{EndpointConfig, EndpointRole, FabricProvider};
    use std::thread;
    use std::time::Duration;

    fn test_endpoint() -> Arc<dyn FabricEndpoint> {
        let fabric = SimFabric::with_defaults();
        let device = fabric.device_init("0000:31:00.0").unwrap();
        device
            .endpoint_init(&EndpointConfig {
                role: EndpointRole::Transmit,
                local: "127.0.0.1:9100".to_string(),
                remote: "127.0.0.1:9101".to_string(),
                buffer_size: 4096,
                queue_depth: 4,
            })
            .unwrap()
    }

    #[test]
    fn test_init_registers_every_buffer() {
        let fabric = SimFabric::with_defaults();
        let device = fabric.device_init("0000:31:00.0").unwrap();
        let endpoint = device
            .endpoint_init(&EndpointConfig {
                role: EndpointRole::Receive,
                local: "127.0.0.1:9102".to_string(),
                remote: "127.0.0.1:9103".to_string(),
                buffer_size: 4096,
                queue_depth: 4,
            })
            .unwrap();
        let pool = BufferPool::init(endpoint, 4, 1000).unwrap();
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.buffer_size(), PAGE_SIZE);
        assert_eq!(fabric.stats().registrations, 4);
    }

    #[test]
    fn test_acquire_release_fifo_order() {
        let pool = BufferPool::init(test_endpoint(), 3, 64).unwrap();
        let ctx = Context::background();

        let a = pool.acquire(&ctx).unwrap();
        let b = pool.acquire(&ctx).unwrap();
        let first = a.index();
        let second = b.index();
        drop(b);
        drop(a);

        // FIFO: b went back before a.
        let c = pool.acquire(&ctx).unwrap();
        let d = pool.acquire(&ctx).unwrap();
        assert_eq!(c.index(), second);
        assert_eq!(d.index(), first);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = BufferPool::init(test_endpoint(), 1, 64).unwrap();
        let ctx = Context::background();
        let held = pool.acquire(&ctx).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let ctx = ctx.clone();
            thread::spawn(move || pool.acquire(&ctx).map(|b| b.index()))
        };

        thread::sleep(Duration::from_millis(20));
        let index = held.index();
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), index);
    }

    #[test]
    fn test_acquire_returns_cancelled() {
        let pool = BufferPool::init(test_endpoint(), 1, 64).unwrap();
        let (ctx, handle) = Context::with_cancel(&Context::background());
        let _held = pool.acquire(&ctx).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let ctx = ctx.clone();
            thread::spawn(move || pool.acquire(&ctx).err().unwrap())
        };
        thread::sleep(Duration::from_millis(10));
        handle.cancel();
        assert!(matches!(waiter.join().unwrap(), TransportError::Cancelled));
    }

    #[test]
    fn test_close_drains_waiters() {
        let pool = BufferPool::init(test_endpoint(), 1, 64).unwrap();
        let ctx = Context::background();
        let _held = pool.acquire(&ctx).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let ctx = ctx.clone();
            thread::spawn(move || pool.acquire(&ctx).err().unwrap())
        };
        thread::sleep(Duration::from_millis(10));
        pool.close();
        assert!(matches!(waiter.join().unwrap(), TransportError::ConnClosed));
    }

    #[test]
    fn test_try_acquire_no_buffer() {
        let pool = BufferPool::init(test_endpoint(), 1, 64).unwrap();
        let _held = pool.try_acquire().unwrap();
        assert!(matches!(
            pool.try_acquire().err().unwrap(),
            TransportError::NoBuffer
        ));
    }

    #[test]
    fn test_available_flag_tracks_fifo() {
        let pool = BufferPool::init(test_endpoint(), 1, 64).unwrap();
        assert!(pool.is_available());
        let held = pool.try_acquire().unwrap();
        assert!(!pool.is_available());
        drop(held);
        assert!(pool.is_available());
    }

    #[test]
    fn test_fill_and_read_back() {
        let pool = BufferPool::init(test_endpoint(), 2, 64).unwrap();
        let ctx = Context::background();
        let mut buf = pool.acquire(&ctx).unwrap();
        buf.fill(b"payload");
        assert_eq!(&buf[..], b"payload");
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn test_detach_keeps_buffer_out_of_pool() {
        let pool = BufferPool::init(test_endpoint(), 1, 64).unwrap();
        let buf = pool.try_acquire().unwrap();
        let index = buf.detach();
        assert!(matches!(
            pool.try_acquire().err().unwrap(),
            TransportError::NoBuffer
        ));
        pool.release_index(index);
        assert_eq!(pool.try_acquire().unwrap().index(), index);
    }

    #[test]
    fn test_lease_drop_releases() {
        let pool = BufferPool::init(test_endpoint(), 1, 64).unwrap();
        let index = pool.try_pop().unwrap();
        let lease = pool.lease(index, 16);
        assert_eq!(lease.len(), 16);
        drop(lease);
        assert_eq!(pool.try_pop(), Some(index));
    }

    #[test]
    fn test_stats_reflect_activity() {
        let pool = BufferPool::init(test_endpoint(), 2, 64).unwrap();
        let ctx = Context::background();
        let a = pool.acquire(&ctx).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.acquired_total, 1);
        drop(a);
        let stats = pool.stats();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.released_total, 1);
        assert!(!stats.closed);
    }

    #[test]
    fn test_release_after_close_is_noop() {
        let pool = BufferPool::init(test_endpoint(), 1, 64).unwrap();
        let buf = pool.try_acquire().unwrap();
        pool.close();
        drop(buf);
        let stats = pool.stats();
        assert!(stats.closed);
        assert_eq!(stats.available, 0);
    }
}
