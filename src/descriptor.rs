//! Item and region descriptors.
//!
//! A descriptor is a handle into remote memory: which server owns it, which
//! region it lives in, and the access key the server issued for it. The top
//! bits of a region id encode the owning memory server, so a descriptor can
//! always be resolved back to an address-registry index.

use std::sync::{Arc, OnceLock};

use crate::context::FamContext;

/// Number of low bits of a region id holding the region index; the bits
/// above encode the owning memory server.
pub const MEMSERVER_ID_SHIFT: u32 = 20;

/// Build a region id owned by `memserver_id`.
#[inline]
pub fn make_region_id(memserver_id: u64, region_index: u64) -> u64 {
    (memserver_id << MEMSERVER_ID_SHIFT) | region_index
}

/// Handle for a data item in fabric-attached memory.
///
/// Immutable after creation except for the cached context back-reference,
/// which is a lazy memoisation set at most once by the context manager. The
/// descriptor never owns the context; at engine teardown contexts are
/// released through the context tables alone.
#[derive(Debug)]
pub struct FamDescriptor {
    region_id: u64,
    item_offset: u64,
    key: u64,
    context: OnceLock<Arc<FamContext>>,
}

impl FamDescriptor {
    /// Create a descriptor for the item at `item_offset` within `region_id`,
    /// accessed with `key`.
    pub fn new(region_id: u64, item_offset: u64, key: u64) -> Self {
        Self {
            region_id,
            item_offset,
            key,
            context: OnceLock::new(),
        }
    }

    /// Region this item belongs to.
    #[inline]
    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    /// Base offset of the item within its region; identifies the item to the
    /// allocator's CAS-lock service.
    #[inline]
    pub fn item_offset(&self) -> u64 {
        self.item_offset
    }

    /// Access key issued by the owning memory server.
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Id of the memory server owning this item, recovered from the region
    /// id encoding.
    #[inline]
    pub fn memserver_id(&self) -> u64 {
        self.region_id >> MEMSERVER_ID_SHIFT
    }

    pub(crate) fn cached_context(&self) -> Option<&Arc<FamContext>> {
        self.context.get()
    }

    pub(crate) fn cache_context(&self, context: Arc<FamContext>) {
        let _ = self.context.set(context);
    }
}

/// Handle for an entire region; used for scoped fence and quiet.
#[derive(Debug)]
pub struct FamRegionDescriptor {
    region_id: u64,
    context: OnceLock<Arc<FamContext>>,
}

impl FamRegionDescriptor {
    /// Create a region descriptor for `region_id`.
    pub fn new(region_id: u64) -> Self {
        Self {
            region_id,
            context: OnceLock::new(),
        }
    }

    /// The region id.
    #[inline]
    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    /// Id of the memory server owning this region.
    #[inline]
    pub fn memserver_id(&self) -> u64 {
        self.region_id >> MEMSERVER_ID_SHIFT
    }

    pub(crate) fn cached_context(&self) -> Option<&Arc<FamContext>> {
        self.context.get()
    }

    pub(crate) fn cache_context(&self, context: Arc<FamContext>) {
        let _ = self.context.set(context);
    }
}
