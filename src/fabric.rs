//! Portable fabric binding consumed by the engine.
//!
//! This is the narrow adapter over the RDMA library: endpoint lifecycle,
//! address-vector management, one-sided reads and writes (blocking and
//! nonblocking, contiguous and IOV-vectored), atomics, and the fence/quiet
//! ordering verbs. The engine talks only to this trait; a production binding
//! wraps the provider library, and tests supply an in-memory loopback.

use bitflags::bitflags;

use crate::config::FamThreadModel;

/// Opaque fabric address token: one entry of the address vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FabricAddr(pub u64);

/// Opaque handle to an endpoint and its completion-queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub u64);

/// Opaque handle to a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrHandle(pub u64);

bitflags! {
    /// Remote access rights for a registered memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Remote peers may read.
        const READ = 1;
        /// Remote peers may write.
        const WRITE = 1 << 1;
        /// Remote peers may issue atomics.
        const ATOMIC = 1 << 2;
    }
}

/// Endpoint type reported by the fabric at initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    /// Reliable datagram with RDMA; requires an address vector.
    ReliableDatagram,
    /// Connection-oriented; addresses are implicit in the connection.
    Messaging,
}

/// Properties reported by the fabric at initialisation.
#[derive(Debug, Clone)]
pub struct FabricInfo {
    /// Maximum number of remote IO vectors in a single RMA operation.
    pub iov_limit: usize,
    /// Endpoint type of the provider.
    pub endpoint_type: EndpointType,
}

/// One remote span of an IOV-vectored RMA operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteIov {
    /// Byte offset within the registered region.
    pub offset: u64,
    /// Span length in bytes.
    pub len: u64,
}

/// Atomic operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    /// Atomic read of the operand.
    Read,
    /// Atomic overwrite of the operand.
    Write,
    /// Addition.
    Sum,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Compare-and-swap; only meaningful with [`Fabric::compare_atomic`].
    CompareSwap,
}

/// Scalar datatype code for atomic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicDatatype {
    Int32,
    Int64,
    Uint32,
    Uint64,
    Float,
    Double,
}

/// Fabric-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricError {
    /// The verb exceeded its deadline.
    Timeout,
    /// Any other transport failure, as a provider error code. Translate
    /// with [`Fabric::strerror`].
    Failed(i32),
}

/// Result type for fabric verbs.
pub type FabricResult<T> = std::result::Result<T, FabricError>;

/// The portable fabric surface.
///
/// Nonblocking verbs post the operation and return; completion is observed
/// only through a later [`quiet`](Fabric::quiet) on the same endpoint.
/// Implementations must be shareable across threads when initialised with
/// [`FamThreadModel::Multiple`].
pub trait Fabric: Send + Sync {
    /// Initialise the fabric for `server` on `service` with `provider`.
    /// Returns the provider's properties.
    fn initialize(
        &self,
        server: &str,
        service: &str,
        provider: &str,
        is_source: bool,
        thread_model: FamThreadModel,
    ) -> FabricResult<FabricInfo>;

    /// Create the address vector. Called only when the endpoint type is
    /// [`EndpointType::ReliableDatagram`].
    fn initialize_address_vector(&self) -> FabricResult<()>;

    /// Insert a raw peer address into the address vector.
    fn insert_address(&self, raw: &[u8]) -> FabricResult<FabricAddr>;

    /// Create an endpoint together with its completion-queue pair.
    fn open_endpoint(&self) -> FabricResult<EndpointId>;

    /// Enable the endpoint and bind it to the address vector and event
    /// queue. Must be called exactly once before the endpoint carries
    /// operations.
    fn enable_endpoint(&self, ep: EndpointId) -> FabricResult<()>;

    /// Raw local address name of an enabled endpoint, for peers to insert
    /// into their address vectors.
    fn endpoint_name(&self, ep: EndpointId) -> FabricResult<Vec<u8>>;

    /// Release an endpoint and its completion queues.
    fn close_endpoint(&self, ep: EndpointId);

    /// Register local memory for remote access under `key`.
    fn register_mr(
        &self,
        addr: u64,
        len: usize,
        key: u64,
        access: AccessFlags,
    ) -> FabricResult<MrHandle>;

    /// Release a registered memory region.
    fn close_mr(&self, mr: MrHandle);

    /// Blocking one-sided write of `local` at `offset` within the remote
    /// region keyed by `key`. Returns after remote completion.
    fn write(
        &self,
        key: u64,
        local: &[u8],
        offset: u64,
        addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()>;

    /// Blocking one-sided read into `local` from `offset` within the remote
    /// region keyed by `key`.
    fn read(
        &self,
        key: u64,
        local: &mut [u8],
        offset: u64,
        addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()>;

    /// Post a one-sided write without waiting for completion.
    ///
    /// # Safety
    ///
    /// The `nbytes` at `local` must stay valid and unmodified until the next
    /// successful [`quiet`](Fabric::quiet) on `ep`.
    unsafe fn write_nonblocking(
        &self,
        key: u64,
        local: *const u8,
        nbytes: usize,
        offset: u64,
        addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()>;

    /// Post a one-sided read without waiting for completion.
    ///
    /// # Safety
    ///
    /// The `nbytes` at `local` must stay valid, and must not be read or
    /// written by the caller, until the next successful
    /// [`quiet`](Fabric::quiet) on `ep`.
    unsafe fn read_nonblocking(
        &self,
        key: u64,
        local: *mut u8,
        nbytes: usize,
        offset: u64,
        addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()>;

    /// Blocking vectored write: scatter the contiguous `local` span across
    /// the `remote` spans, in order. The caller keeps `remote.len()` within
    /// the provider's IOV limit; span lengths sum to `local.len()`.
    fn write_vector(
        &self,
        key: u64,
        local: &[u8],
        remote: &[RemoteIov],
        addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()>;

    /// Blocking vectored read: gather the `remote` spans into the
    /// contiguous `local` span, in order.
    fn read_vector(
        &self,
        key: u64,
        local: &mut [u8],
        remote: &[RemoteIov],
        addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()>;

    /// Post a vectored write without waiting for completion.
    ///
    /// # Safety
    ///
    /// As for [`write_nonblocking`](Fabric::write_nonblocking); the live
    /// span is the sum of the `remote` lengths starting at `local`.
    unsafe fn write_vector_nonblocking(
        &self,
        key: u64,
        local: *const u8,
        remote: &[RemoteIov],
        addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()>;

    /// Post a vectored read without waiting for completion.
    ///
    /// # Safety
    ///
    /// As for [`read_nonblocking`](Fabric::read_nonblocking); the live span
    /// is the sum of the `remote` lengths starting at `local`.
    unsafe fn read_vector_nonblocking(
        &self,
        key: u64,
        local: *mut u8,
        remote: &[RemoteIov],
        addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()>;

    /// One-way atomic: apply `op` with operand `value` (little-endian
    /// `datatype` scalar) at `offset`. Returns after completion.
    fn atomic(
        &self,
        key: u64,
        value: &[u8],
        offset: u64,
        op: AtomicOp,
        datatype: AtomicDatatype,
        addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()>;

    /// Fetching atomic: apply `op` with operand `value` and place the prior
    /// remote value in `result`.
    fn fetch_atomic(
        &self,
        key: u64,
        value: &[u8],
        result: &mut [u8],
        offset: u64,
        op: AtomicOp,
        datatype: AtomicDatatype,
        addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()>;

    /// Compare atomic: write `swap` if the remote value equals `compare`;
    /// the prior remote value is placed in `result` either way.
    fn compare_atomic(
        &self,
        key: u64,
        compare: &[u8],
        result: &mut [u8],
        swap: &[u8],
        offset: u64,
        op: AtomicOp,
        datatype: AtomicDatatype,
        addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()>;

    /// Order subsequent writes on `ep` after prior ones. Does not wait for
    /// completion.
    fn fence(&self, addr: FabricAddr, ep: EndpointId) -> FabricResult<()>;

    /// Block until every operation previously posted on `ep` has completed.
    fn quiet(&self, ep: EndpointId) -> FabricResult<()>;

    /// Human-readable translation of a provider error code.
    fn strerror(&self, code: i32) -> String;

    /// Release fabric-global resources. Endpoints and memory regions are
    /// closed individually beforehand.
    fn finalize(&self);
}
