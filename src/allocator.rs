//! Allocator-facing interface.
//!
//! The allocator owns region and item lifecycle, naming, permissions, and
//! the server-side CAS-lock service. The engine consults it for bootstrap
//! (memory server addresses), for server-offloaded copies, and for the
//! mutual exclusion backing emulated 128-bit atomics.

use std::fmt;

use crate::descriptor::FamDescriptor;

/// Opaque handle for a server-offloaded copy in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyToken(pub u64);

/// Failure reported by the allocator.
#[derive(Debug)]
pub struct AllocatorError {
    message: String,
}

impl AllocatorError {
    /// Create a new allocator error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AllocatorError {}

/// Result type for allocator calls.
pub type AllocResult<T> = std::result::Result<T, AllocatorError>;

/// The allocator surface consumed by the engine.
pub trait FamAllocator: Send + Sync {
    /// Length in bytes of the server's raw fabric address name.
    fn addr_size(&self, memserver_id: u64) -> AllocResult<usize>;

    /// Fill `buf` with the server's raw fabric address name. `buf` is the
    /// length reported by [`addr_size`](FamAllocator::addr_size).
    fn addr(&self, buf: &mut [u8], memserver_id: u64) -> AllocResult<()>;

    /// Start a server-offloaded copy of `nbytes` from `src` to `dest`.
    fn copy(
        &self,
        src: &FamDescriptor,
        src_offset: u64,
        dest: &FamDescriptor,
        dest_offset: u64,
        nbytes: u64,
    ) -> AllocResult<CopyToken>;

    /// Block until an offloaded copy completes.
    fn wait_for_copy(&self, token: CopyToken) -> AllocResult<()>;

    /// Acquire the server-side mutual-exclusion lease for `descriptor`'s
    /// item. Blocks until granted.
    fn acquire_cas_lock(&self, descriptor: &FamDescriptor) -> AllocResult<()>;

    /// Release the lease taken by
    /// [`acquire_cas_lock`](FamAllocator::acquire_cas_lock).
    fn release_cas_lock(&self, descriptor: &FamDescriptor) -> AllocResult<()>;
}
