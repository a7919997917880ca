//! famops - client-side data-path engine for fabric-attached memory.
//!
//! The engine maps high-level memory operations (bulk transfers,
//! gather/scatter, atomics, ordering primitives) onto one-sided fabric
//! verbs against memory regions exported by a pool of memory servers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          FamOps                              │
//! │  ┌───────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │ Address       │  │ Context      │  │ MR handle table  │   │
//! │  │ registry      │  │ tables       │  │ (server mode)    │   │
//! │  │ Vec<Addr>     │  │ node│region  │  │                  │   │
//! │  └───────────────┘  └──────────────┘  └──────────────────┘   │
//! │                                                              │
//! │  op(descriptor) → key + address + context → fabric verb      │
//! └──────────────────────────────────────────────────────────────┘
//!            │                                    │
//!            ▼                                    ▼
//!     Fabric (trait)                       FamAllocator (trait)
//!     one-sided RDMA verbs                 bootstrap addresses,
//!     fence / quiet                        offloaded copy, CAS-lock
//! ```
//!
//! - **Contexts** (endpoint + completion-queue pair) are the unit of
//!   ordering: one per memory server under the default policy, or one per
//!   region, created lazily, under the region policy.
//! - **Nonblocking** operations post and return; completion is reaped by a
//!   later [`FamOps::quiet`] over the scope. [`FamOps::fence`] orders
//!   writes without waiting.
//! - **128-bit atomics** are synthesised over the allocator's server-side
//!   CAS-lock, since the fabric's native atomics stop at 64 bits.
//!
//! ## Usage
//!
//! ```ignore
//! use famops::{FamConfig, FamContextModel, FamDescriptor, FamOps};
//!
//! let config = FamConfig::new()
//!     .with_memory_server(0, "fam-node-0")
//!     .with_context_model(FamContextModel::Region);
//! let engine = FamOps::new(config, fabric, Some(allocator))?;
//!
//! let item = FamDescriptor::new(region_id, 0, access_key);
//! engine.put_blocking(&payload, &item, 0)?;
//! let old: u64 = engine.atomic_fetch_add(&item, 0, 5)?;
//! engine.quiet(None)?;
//! ```

pub mod allocator;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod fabric;
pub mod ops;

pub use allocator::{AllocResult, AllocatorError, CopyToken, FamAllocator};
pub use config::{FamConfig, FamContextModel, FamThreadModel};
pub use context::FamContext;
pub use descriptor::{make_region_id, FamDescriptor, FamRegionDescriptor, MEMSERVER_ID_SHIFT};
pub use error::{Error, Result};
pub use fabric::{
    AccessFlags, AtomicDatatype, AtomicOp, EndpointId, EndpointType, Fabric, FabricAddr,
    FabricError, FabricInfo, FabricResult, MrHandle, RemoteIov,
};
pub use ops::{FamBitwise, FamCompareSwap, FamOps, FamScalar};
