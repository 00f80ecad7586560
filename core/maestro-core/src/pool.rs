//! Fixed byte budget backing the session arena.
//!
//! Nothing is actually allocated here. The pool is an accounting device: app
//! records and the OSK buffer charge their footprint against it so the
//! coordinator refuses new work once the configured budget is spent.

use crate::error::{MaestroError, Result};

/// Smallest pool the coordinator will run with.
pub const MIN_POOL_BYTES: usize = 4 * 1024;

/// Fixed cost charged per app record on top of its strings.
pub const RECORD_OVERHEAD_BYTES: usize = 256;

#[derive(Debug)]
pub struct MemoryPool {
    capacity: usize,
    used: usize,
}

impl MemoryPool {
    pub fn create(capacity: usize) -> Result<Self> {
        if capacity < MIN_POOL_BYTES {
            return Err(MaestroError::PoolTooSmall {
                requested: capacity,
                minimum: MIN_POOL_BYTES,
            });
        }
        Ok(Self { capacity, used: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used
    }

    pub fn reserve(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.available() {
            return Err(MaestroError::PoolExhausted {
                requested: bytes,
                available: self.available(),
            });
        }
        self.used += bytes;
        Ok(())
    }

    pub fn release(&mut self, bytes: usize) {
        self.used = self.used.saturating_sub(bytes);
    }

    /// Swaps an existing charge for a new one, leaving the pool untouched on
    /// failure.
    pub fn recharge(&mut self, old_bytes: usize, new_bytes: usize) -> Result<()> {
        self.release(old_bytes);
        if let Err(err) = self.reserve(new_bytes) {
            self.used += old_bytes;
            return Err(err);
        }
        Ok(())
    }
}
