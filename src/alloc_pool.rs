//! Component A: fixed-block allocator.
//!
//! A preallocated pool of `N` blocks sized to hold one [`crate::frame::Frame`]
//! plus its metadata header. `alloc`/`free` never touch the general
//! allocator and never block on I/O, so they remain safe to call from the
//! interrupt-dispatch thread (component H) — in this user-space port there
//! is no literal hardware interrupt context, so "ISR-safe" means: the
//! critical section is a plain mutex held only across a `Vec::pop`/`push`,
//! never across anything that can block or reenter the allocator.

use std::sync::Mutex;

use crate::error::{DriverError, Result};
use crate::frame::Frame;

/// One preallocated block, large enough to hold a frame plus the
/// per-frame `frame_len` tail used by TX-completion accounting .
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub frame: Frame,
    pub frame_len: u8,
}

pub struct FixedBlockPool {
    free_list: Mutex<Vec<Block>>,
    capacity: usize,
}

impl FixedBlockPool {
    /// `capacity` should be chosen so that the worst-case in-flight frame
    /// count (sum of all TX+RX queue capacities plus any ISR-side
    /// transient) fits, per .
    pub fn new(capacity: usize) -> Self {
        let mut free_list = Vec::with_capacity(capacity);
        free_list.resize_with(capacity, Block::default);
        FixedBlockPool {
            free_list: Mutex::new(free_list),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pops a block under a short mutex. Never blocks on I/O; returns
    /// [`DriverError::QueueFull`]-shaped exhaustion as `None` rather than
    /// panicking, since pool exhaustion is an expected backpressure signal
    /// rather than a fatal condition.
    pub fn alloc(&self) -> Option<Block> {
        self.free_list.lock().unwrap().pop()
    }

    pub fn free(&self, block: Block) {
        let mut guard = self.free_list.lock().unwrap();
        // Cap growth: a `free` of a block the pool didn't issue would
        // otherwise let the list grow without bound.
        if guard.len() < self.capacity {
            guard.push(block);
        }
    }

    pub fn available(&self) -> usize {
        self.free_list.lock().unwrap().len()
    }
}

/// Tries to allocate a block, producing the canonical  error variant on
/// exhaustion so callers outside the ISR path can propagate it uniformly.
pub fn try_alloc(pool: &FixedBlockPool) -> Result<Block> {
    pool.alloc().ok_or(DriverError::QueueFull)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let pool = FixedBlockPool::new(4);
        assert_eq!(pool.available(), 4);
        let b = pool.alloc().unwrap();
        assert_eq!(pool.available(), 3);
        pool.free(b);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = FixedBlockPool::new(1);
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        pool.free(b);
        assert!(pool.alloc().is_some());
    }
}
