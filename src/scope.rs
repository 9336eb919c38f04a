//! # Resource-Scoped Buffers
//!
//! Every stream operation claims its memory through a [`ServiceScope`]:
//!
//! ```text
//! ServiceScope::acquire(size)
//!   ├── reserve `size` bytes (total limit, per-service limit)
//!   ├── take a pooled buffer of exactly `size` bytes
//!   └── ScopedBuffer ── drop ──► release reservation, then return buffer
//! ```
//!
//! A refused reservation is backpressure on the one stream that asked for it;
//! nothing is reserved and no buffer leaves the pool.
//!
//! The [`ResourceManager`] is owned by a service instance. Tests create as
//! many independent managers as they need.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::error::ResourceError;

/// Buffers larger than this are never pooled.
const MAX_POOLED_BUFFER: usize = 16 * 1024 * 1024;

/// Idle buffers kept per size class.
const MAX_POOLED_PER_CLASS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Bytes reservable across all services.
    pub total_memory: usize,
    /// Bytes reservable by any single service.
    pub per_service_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            total_memory: 512 * 1024 * 1024,
            per_service_memory: 256 * 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    /// Check that one service can hold an inbound message of `max_message_size`.
    pub fn check_message_size(&self, max_message_size: usize) -> Result<(), ResourceError> {
        let limit = self.total_memory.min(self.per_service_memory);
        if limit < max_message_size {
            return Err(ResourceError::LimitBelowMessageSize {
                limit,
                required: max_message_size,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Buffer pool
// ============================================================================

/// Free lists of byte buffers keyed by exact length.
#[derive(Default)]
pub struct BufferPool {
    free: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, Vec<Vec<u8>>>> {
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A zeroed buffer of exactly `size` bytes.
    pub fn get(&self, size: usize) -> Vec<u8> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let reused = self.lock().get_mut(&size).and_then(Vec::pop);
        match reused {
            Some(mut buf) => {
                buf.fill(0);
                buf
            }
            None => vec![0u8; size],
        }
    }

    pub fn put(&self, buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let size = buf.len();
        if size == 0 || size > MAX_POOLED_BUFFER {
            return;
        }
        let mut free = self.lock();
        let class = free.entry(size).or_default();
        if class.len() < MAX_POOLED_PER_CLASS {
            class.push(buf);
        }
    }

    /// Buffers handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("outstanding", &self.outstanding())
            .field("idle", &self.idle())
            .finish()
    }
}

// ============================================================================
// Accounting
// ============================================================================

#[derive(Debug, Default)]
struct Accounting {
    reserved: usize,
    per_service: HashMap<String, usize>,
    reservations: usize,
    acquired: u64,
    released: u64,
}

/// Point-in-time view of a [`ResourceManager`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub reserved_bytes: usize,
    pub outstanding_reservations: usize,
    pub acquired_total: u64,
    pub released_total: u64,
    pub outstanding_buffers: usize,
}

#[derive(Debug)]
pub struct ResourceManager {
    limits: ResourceLimits,
    pool: BufferPool,
    accounting: Mutex<Accounting>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Arc<Self> {
        Arc::new(Self {
            limits,
            pool: BufferPool::new(),
            accounting: Mutex::new(Accounting::default()),
        })
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Attach to the logical service `service`.
    pub fn scope(self: &Arc<Self>, service: impl Into<String>) -> ServiceScope {
        ServiceScope {
            manager: Arc::clone(self),
            service: service.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Accounting> {
        self.accounting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reserve(&self, service: &str, size: usize) -> Result<(), ResourceError> {
        let mut acc = self.lock();

        if acc.reserved.saturating_add(size) > self.limits.total_memory {
            return Err(ResourceError::MemoryLimitExceeded {
                requested: size,
                reserved: acc.reserved,
                limit: self.limits.total_memory,
            });
        }
        let used = acc.per_service.get(service).copied().unwrap_or(0);
        if used.saturating_add(size) > self.limits.per_service_memory {
            return Err(ResourceError::ServiceLimitExceeded {
                service: service.to_string(),
                requested: size,
                reserved: used,
                limit: self.limits.per_service_memory,
            });
        }

        acc.reserved += size;
        *acc.per_service.entry(service.to_string()).or_insert(0) += size;
        acc.reservations += 1;
        acc.acquired += 1;
        Ok(())
    }

    fn release(&self, service: &str, size: usize) {
        let mut acc = self.lock();
        acc.reserved = acc.reserved.saturating_sub(size);
        if let Some(used) = acc.per_service.get_mut(service) {
            *used = used.saturating_sub(size);
            if *used == 0 {
                acc.per_service.remove(service);
            }
        }
        acc.reservations = acc.reservations.saturating_sub(1);
        acc.released += 1;
    }

    pub fn reserved_bytes(&self) -> usize {
        self.lock().reserved
    }

    pub fn outstanding_reservations(&self) -> usize {
        self.lock().reservations
    }

    pub fn service_usage(&self, service: &str) -> usize {
        self.lock().per_service.get(service).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> ResourceStats {
        let acc = self.lock();
        ResourceStats {
            reserved_bytes: acc.reserved,
            outstanding_reservations: acc.reservations,
            acquired_total: acc.acquired,
            released_total: acc.released,
            outstanding_buffers: self.pool.outstanding(),
        }
    }
}

// ============================================================================
// Scopes
// ============================================================================

#[derive(Clone, Debug)]
pub struct ServiceScope {
    manager: Arc<ResourceManager>,
    service: String,
}

impl ServiceScope {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Reserve `size` bytes and take a pooled buffer of exactly that length.
    pub fn acquire(&self, size: usize) -> Result<ScopedBuffer, ResourceError> {
        self.manager.reserve(&self.service, size)?;
        let buf = self.manager.pool.get(size);
        trace!(service = %self.service, size, "scope acquired");
        Ok(ScopedBuffer {
            buf: Some(buf),
            size,
            scope: self.clone(),
        })
    }
}

/// A reserved, pooled buffer. Dropping it releases the reservation and then
/// returns the buffer to the pool.
pub struct ScopedBuffer {
    buf: Option<Vec<u8>>,
    size: usize,
    scope: ServiceScope,
}

impl ScopedBuffer {
    /// Bytes reserved for this buffer.
    pub fn reserved(&self) -> usize {
        self.size
    }
}

impl Deref for ScopedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for ScopedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for ScopedBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let manager = &self.scope.manager;
            manager.release(&self.scope.service, self.size);
            manager.pool.put(buf);
            trace!(service = %self.scope.service, size = self.size, "scope released");
        }
    }
}

impl fmt::Debug for ScopedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedBuffer")
            .field("service", &self.scope.service)
            .field("size", &self.size)
            .finish()
    }
}
