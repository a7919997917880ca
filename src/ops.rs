//! The data-path engine: operation dispatch over fabric-attached memory.
//!
//! `FamOps` owns the fabric handles, the address registry, and the context
//! tables. Every public operation resolves its descriptor to an access key,
//! a fabric address, and a context, then emits the matching fabric verb.
//! 128-bit atomics, which the fabric cannot express natively, are
//! synthesised on top of the allocator's CAS-lock service.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::allocator::{AllocatorError, CopyToken, FamAllocator};
use crate::config::{FamConfig, FamContextModel};
use crate::context::{ContextTables, FamContext};
use crate::descriptor::{FamDescriptor, FamRegionDescriptor, MEMSERVER_ID_SHIFT};
use crate::error::{Error, Result};
use crate::fabric::{
    AccessFlags, AtomicDatatype, AtomicOp, EndpointType, Fabric, FabricAddr, FabricError,
    MrHandle, RemoteIov,
};

/// Widest native scalar handled by the atomic dispatch paths.
const SCALAR_MAX: usize = 8;

mod sealed {
    pub trait Sealed {}
}

/// Scalar element type supported by the fabric's native atomic verbs.
///
/// Carries the wire datatype code, the wire width, the little-endian codec,
/// and arithmetic negation (wrapping on the unsigned widths, so subtraction
/// expressed as `add(negated)` wraps modularly).
pub trait FamScalar: sealed::Sealed + Copy + PartialEq + Send + Sync + 'static {
    /// Fabric datatype code for this scalar.
    const DATATYPE: AtomicDatatype;
    /// Width in bytes on the wire.
    const SIZE: usize;
    /// Arithmetic negation; wraps on unsigned integers.
    fn negated(self) -> Self;
    /// Little-endian encode into the front of `buf`.
    fn store(self, buf: &mut [u8]);
    /// Little-endian decode from the front of `buf`.
    fn load(buf: &[u8]) -> Self;
}

macro_rules! fam_scalar {
    ($ty:ty, $datatype:ident, $size:expr, $neg:expr) => {
        impl sealed::Sealed for $ty {}

        impl FamScalar for $ty {
            const DATATYPE: AtomicDatatype = AtomicDatatype::$datatype;
            const SIZE: usize = $size;

            #[inline]
            fn negated(self) -> Self {
                $neg(self)
            }

            #[inline]
            fn store(self, buf: &mut [u8]) {
                buf[..$size].copy_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn load(buf: &[u8]) -> Self {
                let mut bytes = [0u8; $size];
                bytes.copy_from_slice(&buf[..$size]);
                <$ty>::from_le_bytes(bytes)
            }
        }
    };
}

fam_scalar!(i32, Int32, 4, i32::wrapping_neg);
fam_scalar!(i64, Int64, 8, i64::wrapping_neg);
fam_scalar!(u32, Uint32, 4, u32::wrapping_neg);
fam_scalar!(u64, Uint64, 8, u64::wrapping_neg);
fam_scalar!(f32, Float, 4, |v: f32| -v);
fam_scalar!(f64, Double, 8, |v: f64| -v);

/// Unsigned scalar accepted by the bitwise atomic verbs.
pub trait FamBitwise: FamScalar {}

impl FamBitwise for u32 {}
impl FamBitwise for u64 {}

/// Scalar accepted by the native compare-swap verb.
pub trait FamCompareSwap: FamScalar {}

impl FamCompareSwap for i32 {}
impl FamCompareSwap for i64 {}
impl FamCompareSwap for u32 {}
impl FamCompareSwap for u64 {}

fn map_fabric(fabric: &dyn Fabric, call: &'static str, err: FabricError) -> Error {
    match err {
        FabricError::Timeout => Error::Timeout { call },
        FabricError::Failed(code) => Error::Datapath {
            call,
            detail: fabric.strerror(code),
        },
    }
}

fn map_alloc(call: &'static str, err: AllocatorError) -> Error {
    Error::Allocator {
        call,
        detail: err.to_string(),
    }
}

fn create_context(fabric: &dyn Fabric) -> Result<Arc<FamContext>> {
    let ep = fabric
        .open_endpoint()
        .map_err(|e| map_fabric(fabric, "fabric_open_endpoint", e))?;
    if let Err(e) = fabric.enable_endpoint(ep) {
        fabric.close_endpoint(ep);
        return Err(map_fabric(fabric, "fabric_enable_bind_ep", e));
    }
    Ok(Arc::new(FamContext::new(ep)))
}

/// Scope of the CAS-lock lease backing an emulated 128-bit atomic. Releases
/// on drop, so the lease is returned exactly once on every exit path.
struct CasLockGuard<'a> {
    allocator: &'a dyn FamAllocator,
    descriptor: &'a FamDescriptor,
}

impl<'a> CasLockGuard<'a> {
    fn acquire(allocator: &'a dyn FamAllocator, descriptor: &'a FamDescriptor) -> Result<Self> {
        allocator
            .acquire_cas_lock(descriptor)
            .map_err(|e| map_alloc("acquire_CAS_lock", e))?;
        Ok(Self {
            allocator,
            descriptor,
        })
    }
}

impl Drop for CasLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.release_cas_lock(self.descriptor) {
            tracing::warn!(error = %e, "CAS-lock release failed");
        }
    }
}

fn stride_chunk(
    first_element: u64,
    stride: u64,
    element_size: u64,
    start: u64,
    count: u64,
) -> Vec<RemoteIov> {
    (start..start + count)
        .map(|i| RemoteIov {
            offset: (first_element + i * stride) * element_size,
            len: element_size,
        })
        .collect()
}

fn index_chunk(indexes: &[u64], element_size: u64) -> Vec<RemoteIov> {
    indexes
        .iter()
        .map(|&i| RemoteIov {
            offset: i * element_size,
            len: element_size,
        })
        .collect()
}

/// The client-side data-path engine.
///
/// Shared by the application's worker threads; the engine creates no
/// threads of its own and all blocking operations block the caller. See
/// [`FamConfig`] for the construction options.
pub struct FamOps {
    fabric: Arc<dyn Fabric>,
    allocator: Option<Arc<dyn FamAllocator>>,
    config: FamConfig,
    /// Frozen after construction; indexed by memory server id.
    addrs: Vec<FabricAddr>,
    contexts: ContextTables,
    /// Registered memory regions, server mode only.
    mrs: Mutex<BTreeMap<u64, MrHandle>>,
    iov_limit: usize,
    server_address: Option<Vec<u8>>,
    finalized: bool,
}

impl FamOps {
    /// Construct and initialise the engine.
    ///
    /// Client mode fetches every memory server's raw fabric address from
    /// the allocator and inserts it into the address vector; server mode
    /// instead publishes this process's own endpoint name (see
    /// [`server_address`](Self::server_address)). Under the
    /// [`Node`](FamContextModel::Node) policy the per-server default
    /// contexts are created eagerly here.
    pub fn new(
        config: FamConfig,
        fabric: Arc<dyn Fabric>,
        allocator: Option<Arc<dyn FamAllocator>>,
    ) -> Result<Self> {
        let Some(first_server) = config.memory_servers.values().next() else {
            return Err(Error::InvalidConfig("no memory servers configured".into()));
        };
        if !config.is_source && allocator.is_none() {
            return Err(Error::InvalidConfig(
                "allocator required in client mode".into(),
            ));
        }
        for (expected, &id) in config.memory_servers.keys().enumerate() {
            if id != expected as u64 {
                return Err(Error::InvalidConfig(format!(
                    "memory server ids must be contiguous from 0, found {}",
                    id
                )));
            }
        }

        let info = fabric
            .initialize(
                first_server,
                &config.service,
                &config.provider,
                config.is_source,
                config.thread_model,
            )
            .map_err(|e| map_fabric(fabric.as_ref(), "fabric_initialize", e))?;
        if info.endpoint_type == EndpointType::ReliableDatagram {
            fabric
                .initialize_address_vector()
                .map_err(|e| map_fabric(fabric.as_ref(), "fabric_initialize_av", e))?;
        }
        tracing::debug!(
            servers = config.memory_servers.len(),
            provider = %config.provider,
            "fabric initialised"
        );

        let mut addrs = Vec::with_capacity(config.memory_servers.len());
        let mut contexts = ContextTables::new();
        let mut server_address = None;

        for &node_id in config.memory_servers.keys() {
            if !config.is_source {
                let alloc = allocator.as_deref().ok_or_else(|| {
                    Error::InvalidConfig("allocator required in client mode".into())
                })?;
                let len = alloc
                    .addr_size(node_id)
                    .map_err(|e| map_alloc("get_addr_size", e))?;
                if len == 0 {
                    return Err(Error::Allocator {
                        call: "get_addr_size",
                        detail: format!("zero-length address for memory server {}", node_id),
                    });
                }
                let mut raw = vec![0u8; len];
                alloc
                    .addr(&mut raw, node_id)
                    .map_err(|e| map_alloc("get_addr", e))?;
                let addr = fabric
                    .insert_address(&raw)
                    .map_err(|e| map_fabric(fabric.as_ref(), "fabric_insert_av", e))?;
                addrs.push(addr);
                tracing::trace!(node_id, "memory server address inserted");
            } else if server_address.is_none() {
                // Publish our own endpoint name for peers to discover.
                let probe = create_context(fabric.as_ref())?;
                let name = match fabric.endpoint_name(probe.endpoint()) {
                    Ok(name) if !name.is_empty() => name,
                    Ok(_) => {
                        fabric.close_endpoint(probe.endpoint());
                        return Err(Error::Datapath {
                            call: "fabric_getname",
                            detail: "empty endpoint name".into(),
                        });
                    }
                    Err(e) => {
                        fabric.close_endpoint(probe.endpoint());
                        return Err(map_fabric(fabric.as_ref(), "fabric_getname", e));
                    }
                };
                fabric.close_endpoint(probe.endpoint());
                server_address = Some(name);
            }

            if config.context_model == FamContextModel::Node {
                let ctx = create_context(fabric.as_ref())?;
                contexts.default_table.insert(node_id, ctx);
            }
        }

        Ok(Self {
            fabric,
            allocator,
            config,
            addrs,
            contexts,
            mrs: Mutex::new(BTreeMap::new()),
            iov_limit: info.iov_limit.max(1),
            server_address,
            finalized: false,
        })
    }

    /// Engine configuration.
    #[inline]
    pub fn config(&self) -> &FamConfig {
        &self.config
    }

    /// The fabric's per-operation IOV limit; gather and scatter chunk to
    /// this bound.
    #[inline]
    pub fn iov_limit(&self) -> usize {
        self.iov_limit
    }

    /// Raw endpoint name published in server mode, for peers to insert
    /// into their address vectors.
    pub fn server_address(&self) -> Option<&[u8]> {
        self.server_address.as_deref()
    }

    fn check<T>(&self, call: &'static str, result: std::result::Result<T, FabricError>) -> Result<T> {
        result.map_err(|e| map_fabric(self.fabric.as_ref(), call, e))
    }

    fn addr_for(&self, memserver_id: u64) -> Result<FabricAddr> {
        self.addrs
            .get(memserver_id as usize)
            .copied()
            .ok_or_else(|| Error::Datapath {
                call: "get_addr",
                detail: format!("unknown memory server {}", memserver_id),
            })
    }

    /// Supply the context carrying `descriptor`'s operations.
    ///
    /// Under the [`Node`](FamContextModel::Node) policy this is the default
    /// context of the owning server. Under
    /// [`Region`](FamContextModel::Region) the descriptor's cached context
    /// is the lock-free fast path; otherwise the region table is consulted
    /// under its mutex and the context is created, enabled, and published
    /// on first access. Repeated calls return the same context; concurrent
    /// callers for one region never create duplicates.
    pub fn context_for(&self, descriptor: &FamDescriptor) -> Result<Arc<FamContext>> {
        match self.config.context_model {
            FamContextModel::Node => {
                let node_id = descriptor.memserver_id();
                self.contexts
                    .default_table
                    .get(&node_id)
                    .cloned()
                    .ok_or_else(|| Error::Datapath {
                        call: "get_context",
                        detail: format!("unknown memory server {}", node_id),
                    })
            }
            FamContextModel::Region => {
                if let Some(ctx) = descriptor.cached_context() {
                    return Ok(ctx.clone());
                }
                let region_id = descriptor.region_id();
                let mut table = self.contexts.region_table.lock().unwrap();
                let ctx = match table.get(&region_id) {
                    Some(ctx) => ctx.clone(),
                    None => {
                        let ctx = create_context(self.fabric.as_ref())?;
                        table.insert(region_id, ctx.clone());
                        tracing::debug!(region_id, "region context created");
                        ctx
                    }
                };
                descriptor.cache_context(ctx.clone());
                Ok(ctx)
            }
        }
    }

    fn resolve(&self, descriptor: &FamDescriptor) -> Result<(u64, FabricAddr, Arc<FamContext>)> {
        let key = descriptor.key();
        let addr = self.addr_for(descriptor.memserver_id())?;
        let ctx = self.context_for(descriptor)?;
        Ok((key, addr, ctx))
    }

    // ------------------------------------------------------------------
    // Bulk transfers
    // ------------------------------------------------------------------

    /// Blocking write of `local` into the item at `offset`. Returns after
    /// remote completion.
    pub fn put_blocking(
        &self,
        local: &[u8],
        descriptor: &FamDescriptor,
        offset: u64,
    ) -> Result<()> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        self.check(
            "fabric_write",
            self.fabric.write(key, local, offset, addr, ctx.endpoint()),
        )
    }

    /// Blocking read from the item at `offset` into `local`.
    pub fn get_blocking(
        &self,
        local: &mut [u8],
        descriptor: &FamDescriptor,
        offset: u64,
    ) -> Result<()> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        self.check(
            "fabric_read",
            self.fabric.read(key, local, offset, addr, ctx.endpoint()),
        )
    }

    /// Post a write without waiting for completion; errors after posting
    /// surface at the next fence or quiet over the context.
    ///
    /// # Safety
    ///
    /// The `nbytes` at `local` must stay valid and unmodified until the
    /// next successful [`quiet`](Self::quiet) covering this descriptor's
    /// context.
    pub unsafe fn put_nonblocking(
        &self,
        local: *const u8,
        descriptor: &FamDescriptor,
        offset: u64,
        nbytes: u64,
    ) -> Result<()> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        self.check("fabric_write", unsafe {
            self.fabric
                .write_nonblocking(key, local, nbytes as usize, offset, addr, ctx.endpoint())
        })?;
        ctx.note_writes_posted(1);
        Ok(())
    }

    /// Post a read without waiting for completion.
    ///
    /// # Safety
    ///
    /// The `nbytes` at `local` must stay valid, and must not be read or
    /// written by the caller, until the next successful
    /// [`quiet`](Self::quiet) covering this descriptor's context.
    pub unsafe fn get_nonblocking(
        &self,
        local: *mut u8,
        descriptor: &FamDescriptor,
        offset: u64,
        nbytes: u64,
    ) -> Result<()> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        self.check("fabric_read", unsafe {
            self.fabric
                .read_nonblocking(key, local, nbytes as usize, offset, addr, ctx.endpoint())
        })?;
        ctx.note_reads_posted(1);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Gather / scatter
    // ------------------------------------------------------------------

    /// Blocking strided gather: collect `n_elements` elements of
    /// `element_size` bytes, starting at element `first_element` and
    /// stepping by `stride` elements, into the contiguous `local` buffer.
    pub fn gather_stride_blocking(
        &self,
        local: &mut [u8],
        descriptor: &FamDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> Result<()> {
        assert!(
            local.len() as u64 >= n_elements * element_size,
            "local buffer too small for gather"
        );
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let mut done = 0u64;
        while done < n_elements {
            let count = (n_elements - done).min(self.iov_limit as u64);
            let remote = stride_chunk(first_element, stride, element_size, done, count);
            let lo = (done * element_size) as usize;
            let hi = ((done + count) * element_size) as usize;
            self.check(
                "fabric_gather_stride",
                self.fabric
                    .read_vector(key, &mut local[lo..hi], &remote, addr, ctx.endpoint()),
            )?;
            done += count;
        }
        Ok(())
    }

    /// Blocking indexed gather: collect the elements at `element_index`
    /// (element granularity) into the contiguous `local` buffer.
    pub fn gather_index_blocking(
        &self,
        local: &mut [u8],
        descriptor: &FamDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> Result<()> {
        assert!(
            local.len() >= element_index.len() * element_size as usize,
            "local buffer too small for gather"
        );
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let mut done = 0usize;
        for chunk in element_index.chunks(self.iov_limit) {
            let remote = index_chunk(chunk, element_size);
            let lo = done * element_size as usize;
            let hi = (done + chunk.len()) * element_size as usize;
            self.check(
                "fabric_gather_index",
                self.fabric
                    .read_vector(key, &mut local[lo..hi], &remote, addr, ctx.endpoint()),
            )?;
            done += chunk.len();
        }
        Ok(())
    }

    /// Blocking strided scatter: spread the contiguous `local` buffer over
    /// `n_elements` remote elements, starting at `first_element`, stepping
    /// by `stride` elements.
    pub fn scatter_stride_blocking(
        &self,
        local: &[u8],
        descriptor: &FamDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> Result<()> {
        assert!(
            local.len() as u64 >= n_elements * element_size,
            "local buffer too small for scatter"
        );
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let mut done = 0u64;
        while done < n_elements {
            let count = (n_elements - done).min(self.iov_limit as u64);
            let remote = stride_chunk(first_element, stride, element_size, done, count);
            let lo = (done * element_size) as usize;
            let hi = ((done + count) * element_size) as usize;
            self.check(
                "fabric_scatter_stride",
                self.fabric
                    .write_vector(key, &local[lo..hi], &remote, addr, ctx.endpoint()),
            )?;
            done += count;
        }
        Ok(())
    }

    /// Blocking indexed scatter: spread the contiguous `local` buffer over
    /// the remote elements at `element_index`.
    pub fn scatter_index_blocking(
        &self,
        local: &[u8],
        descriptor: &FamDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> Result<()> {
        assert!(
            local.len() >= element_index.len() * element_size as usize,
            "local buffer too small for scatter"
        );
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let mut done = 0usize;
        for chunk in element_index.chunks(self.iov_limit) {
            let remote = index_chunk(chunk, element_size);
            let lo = done * element_size as usize;
            let hi = (done + chunk.len()) * element_size as usize;
            self.check(
                "fabric_scatter_index",
                self.fabric
                    .write_vector(key, &local[lo..hi], &remote, addr, ctx.endpoint()),
            )?;
            done += chunk.len();
        }
        Ok(())
    }

    /// Post a strided gather without waiting; one post per IOV chunk.
    ///
    /// # Safety
    ///
    /// `n_elements * element_size` bytes at `local` must stay valid, and
    /// untouched by the caller, until the next successful quiet covering
    /// this descriptor's context.
    pub unsafe fn gather_stride_nonblocking(
        &self,
        local: *mut u8,
        descriptor: &FamDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> Result<()> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let mut done = 0u64;
        while done < n_elements {
            let count = (n_elements - done).min(self.iov_limit as u64);
            let remote = stride_chunk(first_element, stride, element_size, done, count);
            self.check("fabric_gather_stride", unsafe {
                self.fabric.read_vector_nonblocking(
                    key,
                    local.add((done * element_size) as usize),
                    &remote,
                    addr,
                    ctx.endpoint(),
                )
            })?;
            ctx.note_reads_posted(1);
            done += count;
        }
        Ok(())
    }

    /// Post an indexed gather without waiting; one post per IOV chunk.
    ///
    /// # Safety
    ///
    /// As for [`gather_stride_nonblocking`](Self::gather_stride_nonblocking)
    /// with `element_index.len()` elements.
    pub unsafe fn gather_index_nonblocking(
        &self,
        local: *mut u8,
        descriptor: &FamDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> Result<()> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let mut done = 0usize;
        for chunk in element_index.chunks(self.iov_limit) {
            let remote = index_chunk(chunk, element_size);
            self.check("fabric_gather_index", unsafe {
                self.fabric.read_vector_nonblocking(
                    key,
                    local.add(done * element_size as usize),
                    &remote,
                    addr,
                    ctx.endpoint(),
                )
            })?;
            ctx.note_reads_posted(1);
            done += chunk.len();
        }
        Ok(())
    }

    /// Post a strided scatter without waiting; one post per IOV chunk.
    ///
    /// # Safety
    ///
    /// `n_elements * element_size` bytes at `local` must stay valid and
    /// unmodified until the next successful quiet covering this
    /// descriptor's context.
    pub unsafe fn scatter_stride_nonblocking(
        &self,
        local: *const u8,
        descriptor: &FamDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> Result<()> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let mut done = 0u64;
        while done < n_elements {
            let count = (n_elements - done).min(self.iov_limit as u64);
            let remote = stride_chunk(first_element, stride, element_size, done, count);
            self.check("fabric_scatter_stride", unsafe {
                self.fabric.write_vector_nonblocking(
                    key,
                    local.add((done * element_size) as usize),
                    &remote,
                    addr,
                    ctx.endpoint(),
                )
            })?;
            ctx.note_writes_posted(1);
            done += count;
        }
        Ok(())
    }

    /// Post an indexed scatter without waiting; one post per IOV chunk.
    ///
    /// # Safety
    ///
    /// As for [`scatter_stride_nonblocking`](Self::scatter_stride_nonblocking)
    /// with `element_index.len()` elements.
    pub unsafe fn scatter_index_nonblocking(
        &self,
        local: *const u8,
        descriptor: &FamDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> Result<()> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let mut done = 0usize;
        for chunk in element_index.chunks(self.iov_limit) {
            let remote = index_chunk(chunk, element_size);
            self.check("fabric_scatter_index", unsafe {
                self.fabric.write_vector_nonblocking(
                    key,
                    local.add(done * element_size as usize),
                    &remote,
                    addr,
                    ctx.endpoint(),
                )
            })?;
            ctx.note_writes_posted(1);
            done += chunk.len();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Offloaded copy
    // ------------------------------------------------------------------

    /// Start a server-offloaded copy; wait with
    /// [`wait_for_copy`](Self::wait_for_copy).
    pub fn copy(
        &self,
        src: &FamDescriptor,
        src_offset: u64,
        dest: &FamDescriptor,
        dest_offset: u64,
        nbytes: u64,
    ) -> Result<CopyToken> {
        let alloc = self.require_allocator()?;
        alloc
            .copy(src, src_offset, dest, dest_offset, nbytes)
            .map_err(|e| map_alloc("copy", e))
    }

    /// Block until an offloaded copy completes.
    pub fn wait_for_copy(&self, token: CopyToken) -> Result<()> {
        let alloc = self.require_allocator()?;
        alloc
            .wait_for_copy(token)
            .map_err(|e| map_alloc("wait_for_copy", e))
    }

    // ------------------------------------------------------------------
    // Ordering: fence & quiet
    // ------------------------------------------------------------------

    /// Enforce ordering of subsequent writes with respect to prior writes
    /// on the scoped contexts. Does not wait for completion. `None` scopes
    /// every context of the active policy; a region descriptor scopes just
    /// that region's context (a no-op if it does not exist yet).
    pub fn fence(&self, scope: Option<&FamRegionDescriptor>) -> Result<()> {
        match self.config.context_model {
            FamContextModel::Node => {
                for (&node_id, ctx) in &self.contexts.default_table {
                    let addr = self.addr_for(node_id)?;
                    self.check("fabric_fence", self.fabric.fence(addr, ctx.endpoint()))?;
                }
                Ok(())
            }
            FamContextModel::Region => {
                let table = self.contexts.region_table.lock().unwrap();
                match scope {
                    Some(region) => {
                        let Some(ctx) = Self::region_context(&table, region) else {
                            return Ok(());
                        };
                        let addr = self.addr_for(region.memserver_id())?;
                        self.check("fabric_fence", self.fabric.fence(addr, ctx.endpoint()))
                    }
                    None => {
                        for (&region_id, ctx) in table.iter() {
                            let addr = self.addr_for(region_id >> MEMSERVER_ID_SHIFT)?;
                            self.check("fabric_fence", self.fabric.fence(addr, ctx.endpoint()))?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    /// Block until every operation previously posted on the scoped contexts
    /// has completed. Scoping as for [`fence`](Self::fence).
    pub fn quiet(&self, scope: Option<&FamRegionDescriptor>) -> Result<()> {
        match self.config.context_model {
            FamContextModel::Node => {
                for ctx in self.contexts.default_table.values() {
                    self.quiet_context(ctx)?;
                }
                Ok(())
            }
            FamContextModel::Region => {
                let table = self.contexts.region_table.lock().unwrap();
                match scope {
                    Some(region) => match Self::region_context(&table, region) {
                        Some(ctx) => self.quiet_context(&ctx),
                        None => Ok(()),
                    },
                    None => {
                        for ctx in table.values() {
                            self.quiet_context(ctx)?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    /// Resolve a region descriptor against its cache, falling back to the
    /// already-locked region table. Never takes `ctxLock` itself, so it is
    /// safe to call from fence/quiet iteration.
    fn region_context(
        table: &BTreeMap<u64, Arc<FamContext>>,
        region: &FamRegionDescriptor,
    ) -> Option<Arc<FamContext>> {
        if let Some(ctx) = region.cached_context() {
            return Some(ctx.clone());
        }
        let ctx = table.get(&region.region_id()).cloned()?;
        region.cache_context(ctx.clone());
        Some(ctx)
    }

    fn quiet_context(&self, ctx: &Arc<FamContext>) -> Result<()> {
        self.check("fabric_quiet", self.fabric.quiet(ctx.endpoint()))?;
        ctx.clear_pending();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Native atomics
    // ------------------------------------------------------------------

    fn post_atomic<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        op: AtomicOp,
        value: T,
    ) -> Result<()> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let mut buf = [0u8; SCALAR_MAX];
        value.store(&mut buf);
        self.check(
            "fabric_atomic",
            self.fabric.atomic(
                key,
                &buf[..T::SIZE],
                offset,
                op,
                T::DATATYPE,
                addr,
                ctx.endpoint(),
            ),
        )
    }

    fn post_fetch_atomic<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        op: AtomicOp,
        value: T,
    ) -> Result<T> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let mut input = [0u8; SCALAR_MAX];
        let mut output = [0u8; SCALAR_MAX];
        value.store(&mut input);
        self.check(
            "fabric_fetch_atomic",
            self.fabric.fetch_atomic(
                key,
                &input[..T::SIZE],
                &mut output[..T::SIZE],
                offset,
                op,
                T::DATATYPE,
                addr,
                ctx.endpoint(),
            ),
        )?;
        Ok(T::load(&output))
    }

    fn post_compare_atomic<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        compare: T,
        swap: T,
    ) -> Result<T> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let mut cmp = [0u8; SCALAR_MAX];
        let mut new = [0u8; SCALAR_MAX];
        let mut output = [0u8; SCALAR_MAX];
        compare.store(&mut cmp);
        swap.store(&mut new);
        self.check(
            "fabric_compare_atomic",
            self.fabric.compare_atomic(
                key,
                &cmp[..T::SIZE],
                &mut output[..T::SIZE],
                &new[..T::SIZE],
                offset,
                AtomicOp::CompareSwap,
                T::DATATYPE,
                addr,
                ctx.endpoint(),
            ),
        )?;
        Ok(T::load(&output))
    }

    /// Atomically overwrite the scalar at `offset`.
    pub fn atomic_set<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<()> {
        self.post_atomic(descriptor, offset, AtomicOp::Write, value)
    }

    /// Atomically add `value` to the scalar at `offset`.
    pub fn atomic_add<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<()> {
        self.post_atomic(descriptor, offset, AtomicOp::Sum, value)
    }

    /// Atomically subtract `value`; expressed as addition of the negation,
    /// wrapping modularly on unsigned widths.
    pub fn atomic_subtract<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<()> {
        self.atomic_add(descriptor, offset, value.negated())
    }

    /// Atomic minimum.
    pub fn atomic_min<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<()> {
        self.post_atomic(descriptor, offset, AtomicOp::Min, value)
    }

    /// Atomic maximum.
    pub fn atomic_max<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<()> {
        self.post_atomic(descriptor, offset, AtomicOp::Max, value)
    }

    /// Atomic bitwise and.
    pub fn atomic_and<T: FamBitwise>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<()> {
        self.post_atomic(descriptor, offset, AtomicOp::And, value)
    }

    /// Atomic bitwise or.
    pub fn atomic_or<T: FamBitwise>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<()> {
        self.post_atomic(descriptor, offset, AtomicOp::Or, value)
    }

    /// Atomic bitwise xor.
    pub fn atomic_xor<T: FamBitwise>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<()> {
        self.post_atomic(descriptor, offset, AtomicOp::Xor, value)
    }

    /// Atomically replace the scalar at `offset`, returning the prior
    /// value.
    pub fn swap<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<T> {
        self.post_fetch_atomic(descriptor, offset, AtomicOp::Write, value)
    }

    /// Atomically write `new_value` if the scalar at `offset` equals
    /// `old_value`. Returns the prior value either way.
    pub fn compare_swap<T: FamCompareSwap>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        old_value: T,
        new_value: T,
    ) -> Result<T> {
        self.post_compare_atomic(descriptor, offset, old_value, new_value)
    }

    /// Atomic read of the scalar at `offset`.
    pub fn atomic_fetch<T: FamScalar>(&self, descriptor: &FamDescriptor, offset: u64) -> Result<T> {
        let zero = T::load(&[0u8; SCALAR_MAX]);
        self.post_fetch_atomic(descriptor, offset, AtomicOp::Read, zero)
    }

    /// Atomic add returning the prior value.
    pub fn atomic_fetch_add<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<T> {
        self.post_fetch_atomic(descriptor, offset, AtomicOp::Sum, value)
    }

    /// Atomic subtract returning the prior value; wraps modularly on
    /// unsigned widths.
    pub fn atomic_fetch_subtract<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<T> {
        self.atomic_fetch_add(descriptor, offset, value.negated())
    }

    /// Atomic minimum returning the prior value.
    pub fn atomic_fetch_min<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<T> {
        self.post_fetch_atomic(descriptor, offset, AtomicOp::Min, value)
    }

    /// Atomic maximum returning the prior value.
    pub fn atomic_fetch_max<T: FamScalar>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<T> {
        self.post_fetch_atomic(descriptor, offset, AtomicOp::Max, value)
    }

    /// Atomic bitwise and returning the prior value.
    pub fn atomic_fetch_and<T: FamBitwise>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<T> {
        self.post_fetch_atomic(descriptor, offset, AtomicOp::And, value)
    }

    /// Atomic bitwise or returning the prior value.
    pub fn atomic_fetch_or<T: FamBitwise>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<T> {
        self.post_fetch_atomic(descriptor, offset, AtomicOp::Or, value)
    }

    /// Atomic bitwise xor returning the prior value.
    pub fn atomic_fetch_xor<T: FamBitwise>(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: T,
    ) -> Result<T> {
        self.post_fetch_atomic(descriptor, offset, AtomicOp::Xor, value)
    }

    // ------------------------------------------------------------------
    // 128-bit atomics (emulated)
    // ------------------------------------------------------------------

    fn require_allocator(&self) -> Result<&dyn FamAllocator> {
        self.allocator
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("no allocator configured".into()))
    }

    /// Atomically overwrite the 16-byte operand at `offset`, under the
    /// item's CAS-lock. The value is an opaque little-endian blob;
    /// endianness of its interpretation is the caller's concern.
    pub fn atomic_set_i128(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        value: i128,
    ) -> Result<()> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let alloc = self.require_allocator()?;
        let _lock = CasLockGuard::acquire(alloc, descriptor)?;
        self.check(
            "fabric_write",
            self.fabric
                .write(key, &value.to_le_bytes(), offset, addr, ctx.endpoint()),
        )
    }

    /// Atomic read of the 16-byte operand at `offset`, under the item's
    /// CAS-lock.
    pub fn atomic_fetch_i128(&self, descriptor: &FamDescriptor, offset: u64) -> Result<i128> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let alloc = self.require_allocator()?;
        let _lock = CasLockGuard::acquire(alloc, descriptor)?;
        let mut local = [0u8; 16];
        self.check(
            "fabric_read",
            self.fabric
                .read(key, &mut local, offset, addr, ctx.endpoint()),
        )?;
        Ok(i128::from_le_bytes(local))
    }

    /// Compare-and-swap on the 16-byte operand at `offset`: under the
    /// item's CAS-lock, read the operand, write `new_value` if it equals
    /// `old_value`, and return the pre-read value either way.
    pub fn compare_swap_i128(
        &self,
        descriptor: &FamDescriptor,
        offset: u64,
        old_value: i128,
        new_value: i128,
    ) -> Result<i128> {
        let (key, addr, ctx) = self.resolve(descriptor)?;
        let alloc = self.require_allocator()?;
        let _lock = CasLockGuard::acquire(alloc, descriptor)?;
        let mut local = [0u8; 16];
        self.check(
            "fabric_read",
            self.fabric
                .read(key, &mut local, offset, addr, ctx.endpoint()),
        )?;
        let current = i128::from_le_bytes(local);
        if current == old_value {
            self.check(
                "fabric_write",
                self.fabric
                    .write(key, &new_value.to_le_bytes(), offset, addr, ctx.endpoint()),
            )?;
        }
        Ok(current)
    }

    // ------------------------------------------------------------------
    // Miscellaneous
    // ------------------------------------------------------------------

    /// Declared by the operation surface but not supported.
    pub fn abort(&self, _status: i32) -> Result<()> {
        Err(Error::Unimplemented("abort"))
    }

    /// Register local memory for remote access under `key` (server mode).
    /// The mapping is append-only for the life of the session.
    pub fn register_memory(
        &self,
        key: u64,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<()> {
        let mut mrs = self.mrs.lock().unwrap();
        if mrs.contains_key(&key) {
            return Err(Error::InvalidConfig(format!(
                "access key {} already registered",
                key
            )));
        }
        let mr = self.check(
            "fabric_register_mr",
            self.fabric.register_mr(addr, len, key, access),
        )?;
        mrs.insert(key, mr);
        tracing::debug!(key, len, "memory region registered");
        Ok(())
    }

    /// Release every engine-owned fabric resource, in reverse order of
    /// acquisition: memory regions, region contexts, default contexts,
    /// then the fabric itself. Idempotent; also invoked on drop. Cached
    /// context references held by descriptors are not followed.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let mut mrs = self.mrs.lock().unwrap();
        for (_, mr) in std::mem::take(&mut *mrs) {
            self.fabric.close_mr(mr);
        }
        drop(mrs);

        let mut regions = self.contexts.region_table.lock().unwrap();
        for (_, ctx) in std::mem::take(&mut *regions) {
            self.fabric.close_endpoint(ctx.endpoint());
        }
        drop(regions);

        for (_, ctx) in std::mem::take(&mut self.contexts.default_table) {
            self.fabric.close_endpoint(ctx.endpoint());
        }

        self.fabric.finalize();
        tracing::debug!("engine finalised");
    }
}

impl Drop for FamOps {
    fn drop(&mut self) {
        self.finalize();
    }
}
