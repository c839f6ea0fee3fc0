use bytes::BytesMut;
use std::sync::Mutex;
use tracing::{debug, trace, warn};

/// Allocation seam for live-heap payload buffers. The returned buffer is
///  owned by the recipient (the live heap) until the heap is consumed;
///  callers that want recycling hand buffers back via `release`.
pub trait MemoryAllocator: Send + Sync + 'static {
    /// Allocate a buffer with at least `size` bytes of capacity.
    fn allocate(&self, size: usize) -> BytesMut;

    /// Give a no-longer-needed buffer back to the allocator. The default
    ///  implementation just drops it.
    fn release(&self, _buffer: BytesMut) {}
}

/// Plain heap allocation, used when no pool is configured.
pub struct DefaultAllocator;

impl MemoryAllocator for DefaultAllocator {
    fn allocate(&self, size: usize) -> BytesMut {
        BytesMut::with_capacity(size)
    }
}

/// Allocator that recycles buffers for requests in a configured size band.
///  Requests inside `[lower, upper]` are served with `upper`-sized buffers so
///  that any pooled buffer fits any eligible request; requests outside the
///  band fall through to plain allocation.
pub struct MemoryPool {
    lower: usize,
    upper: usize,
    max_free: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl MemoryPool {
    pub fn new(lower: usize, upper: usize, max_free: usize, initial: usize) -> MemoryPool {
        assert!(lower <= upper, "lower bound must not exceed upper bound");
        let initial = initial.min(max_free);
        let free = (0..initial).map(|_| BytesMut::with_capacity(upper)).collect();
        MemoryPool {
            lower,
            upper,
            max_free,
            free: Mutex::new(free),
        }
    }
}

impl MemoryAllocator for MemoryPool {
    fn allocate(&self, size: usize) -> BytesMut {
        if size < self.lower || size > self.upper {
            trace!("request of {} bytes outside pool range - allocating directly", size);
            return BytesMut::with_capacity(size);
        }

        if let Some(buffer) = self.free.lock().unwrap().pop() {
            trace!("returning pooled buffer for request of {} bytes", size);
            return buffer;
        }

        debug!("memory pool exhausted: allocating new buffer of {} bytes", self.upper);
        BytesMut::with_capacity(self.upper)
    }

    fn release(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.upper {
            warn!(
                "returned buffer of capacity {} is smaller than the pool size {} - discarding",
                buffer.capacity(),
                self.upper
            );
            return;
        }
        buffer.clear();

        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_free {
            free.push(buffer);
        }
        else {
            trace!("pool is full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_pooled_buffer_is_recycled() {
        let pool = MemoryPool::new(100, 1000, 4, 0);

        let mut buffer = pool.allocate(500);
        assert!(buffer.capacity() >= 1000);
        buffer.put_slice(&[1, 2, 3]);

        pool.release(buffer);
        let recycled = pool.allocate(100);
        assert!(recycled.is_empty());
        assert!(recycled.capacity() >= 1000);
    }

    #[test]
    fn test_out_of_band_request_is_not_pooled() {
        let pool = MemoryPool::new(100, 1000, 4, 2);
        let buffer = pool.allocate(5000);
        assert!(buffer.capacity() >= 5000);
        assert_eq!(pool.free.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_excess_returns_are_discarded() {
        let pool = MemoryPool::new(0, 64, 1, 0);
        pool.release(BytesMut::with_capacity(64));
        pool.release(BytesMut::with_capacity(64));
        assert_eq!(pool.free.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_undersized_return_is_discarded() {
        let pool = MemoryPool::new(0, 64, 4, 0);
        pool.release(BytesMut::with_capacity(8));
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }
}
