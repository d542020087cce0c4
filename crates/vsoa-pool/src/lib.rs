//! Fixed-size slab of outbound frame buffers, shared by the server/client and the parallel
//! sender. Grounded on `vsoa_pmem_t`: a packet travelling to many subscribers is written once
//! and refcounted out to every destination's send queue instead of being copied per recipient.

use slog::Logger;
use std::sync::{Arc, Mutex, Weak};
use vsoa_codec::MAX_PACKET_LENGTH;
use vsoa_support::error::{VsoaError, VsoaErrorKind, VsoaResult};

struct PoolInner {
    free: Mutex<Vec<Box<[u8; MAX_PACKET_LENGTH]>>>,
    capacity: usize,
    log: Logger,
}

/// A packet memory pool sized for `capacity` in-flight buffers.
#[derive(Clone)]
pub struct Pool(Arc<PoolInner>);

impl Pool {
    pub fn new(capacity: usize, log: Logger) -> Pool {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(Box::new([0u8; MAX_PACKET_LENGTH]));
        }
        Pool(Arc::new(PoolInner {
            free: Mutex::new(free),
            capacity,
            log,
        }))
    }

    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    pub fn available(&self) -> usize {
        self.0.free.lock().expect("pool lock poisoned").len()
    }

    /// Allocates a buffer able to hold `length` bytes (must be `<= MAX_PACKET_LENGTH`).
    /// Fails with `PoolExhausted` when the slab has no free slots.
    pub fn alloc(&self, length: usize) -> VsoaResult<PacketBuf> {
        if length > MAX_PACKET_LENGTH {
            return Err(VsoaError::Fatal(VsoaErrorKind::PacketTooLarge));
        }

        let buffer = {
            let mut free = self.0.free.lock().expect("pool lock poisoned");
            match free.pop() {
                Some(buf) => buf,
                None => {
                    slog::warn!(self.0.log, "packet pool exhausted"; "capacity" => self.0.capacity);
                    return Err(VsoaError::Fatal(VsoaErrorKind::PoolExhausted));
                }
            }
        };

        Ok(PacketBuf(Arc::new(PooledBytes {
            pool: Arc::downgrade(&self.0),
            buffer: Some(buffer),
            length,
        })))
    }
}

struct PooledBytes {
    pool: Weak<PoolInner>,
    buffer: Option<Box<[u8; MAX_PACKET_LENGTH]>>,
    length: usize,
}

impl Drop for PooledBytes {
    fn drop(&mut self) {
        if let (Some(pool), Some(buffer)) = (self.pool.upgrade(), self.buffer.take()) {
            pool.free.lock().expect("pool lock poisoned").push(buffer);
        }
    }
}

/// A refcounted packet buffer. Cloning is the `vsoa_pmem_ref` operation; the buffer returns to
/// its pool once the last clone is dropped.
#[derive(Clone)]
pub struct PacketBuf(Arc<PooledBytes>);

impl PacketBuf {
    #[inline]
    pub fn len(&self) -> usize {
        self.0.length
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.0.buffer.as_ref().expect("buffer taken while refs outstanding")[..self.0.length]
    }

    /// Mutable access, available only while this is the sole owner (right after `alloc`, before
    /// fanning the buffer out to multiple send queues).
    pub fn payload_mut(&mut self) -> Option<&mut [u8]> {
        let length = self.0.length;
        Arc::get_mut(&mut self.0).map(|inner| &mut inner.buffer.as_mut().expect("buffer present")[..length])
    }

    /// Number of outstanding references to this buffer (>1 once fanned out to subscribers).
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_recycle() {
        let pool = Pool::new(2, vsoa_support::logging::default_logger());
        assert_eq!(pool.available(), 2);

        let mut a = pool.alloc(16).unwrap();
        assert_eq!(pool.available(), 1);
        a.payload_mut().unwrap()[0] = 0x42;
        assert_eq!(a.payload()[0], 0x42);

        drop(a);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn exhaustion_is_reported() {
        let pool = Pool::new(1, vsoa_support::logging::default_logger());
        let _a = pool.alloc(16).unwrap();
        assert_eq!(
            pool.alloc(16).unwrap_err(),
            VsoaError::Fatal(VsoaErrorKind::PoolExhausted)
        );
    }

    #[test]
    fn refcount_tracks_fanout_clones() {
        let pool = Pool::new(1, vsoa_support::logging::default_logger());
        let a = pool.alloc(16).unwrap();
        assert_eq!(a.refcount(), 1);
        let b = a.clone();
        assert_eq!(a.refcount(), 2);
        drop(b);
        assert_eq!(a.refcount(), 1);
    }
}
