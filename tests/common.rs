//! Common test utilities: an in-memory fabric and allocator.
//!
//! `TestFabric` implements the `Fabric` trait over a process-local byte
//! store. Blocking verbs complete immediately; nonblocking verbs are queued
//! per endpoint and applied, in post order, by `quiet`, which makes the
//! quiet/fence semantics observable. `TestAllocator` supplies memory server
//! addresses, region/item bookkeeping with sizes, a blocking CAS-lock
//! service, and offloaded copies.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use famops::{
    make_region_id, AccessFlags, AllocResult, AllocatorError, AtomicDatatype, AtomicOp,
    CopyToken, EndpointId, EndpointType, Fabric, FabricAddr, FabricError, FabricInfo,
    FabricResult, FamAllocator, FamConfig, FamContextModel, FamDescriptor, FamOps,
    FamRegionDescriptor, MrHandle, RemoteIov,
};

/// Provider code for an access key with no registered memory.
pub const ERR_KEY: i32 = -2;
/// Provider code for an out-of-bounds access.
pub const ERR_BOUNDS: i32 = -3;
/// Provider code for an endpoint refusing to enable.
pub const ERR_ENABLE: i32 = -4;

const DEFAULT_IOV_LIMIT: usize = 64;

enum PendingOp {
    Write {
        key: u64,
        src: usize,
        len: usize,
        offset: u64,
    },
    Read {
        key: u64,
        dst: usize,
        len: usize,
        offset: u64,
    },
    WriteVector {
        key: u64,
        src: usize,
        remote: Vec<RemoteIov>,
    },
    ReadVector {
        key: u64,
        dst: usize,
        remote: Vec<RemoteIov>,
    },
}

struct FabricState {
    iov_limit: usize,
    memory: HashMap<u64, Vec<u8>>,
    addrs: Vec<Vec<u8>>,
    next_ep: u64,
    open: HashSet<u64>,
    enabled: HashSet<u64>,
    ever_opened: u64,
    pending: HashMap<u64, Vec<PendingOp>>,
    fences: Vec<(FabricAddr, EndpointId)>,
    quiets: BTreeMap<u64, u64>,
    vector_lens: Vec<usize>,
    mrs: HashMap<u64, u64>,
    next_mr: u64,
    finalized: bool,
    inject: Option<FabricError>,
    fail_enable: bool,
}

/// In-memory loopback fabric.
pub struct TestFabric {
    state: Mutex<FabricState>,
}

impl TestFabric {
    pub fn new() -> Self {
        Self::with_iov_limit(DEFAULT_IOV_LIMIT)
    }

    pub fn with_iov_limit(iov_limit: usize) -> Self {
        Self {
            state: Mutex::new(FabricState {
                iov_limit,
                memory: HashMap::new(),
                addrs: Vec::new(),
                next_ep: 0,
                open: HashSet::new(),
                enabled: HashSet::new(),
                ever_opened: 0,
                pending: HashMap::new(),
                fences: Vec::new(),
                quiets: BTreeMap::new(),
                vector_lens: Vec::new(),
                mrs: HashMap::new(),
                next_mr: 0,
                finalized: false,
                inject: None,
                fail_enable: false,
            }),
        }
    }

    /// Back `key` with `size` zeroed bytes of simulated server memory.
    pub fn create_memory(&self, key: u64, size: usize) {
        let mut state = self.state.lock().unwrap();
        state.memory.insert(key, vec![0u8; size]);
    }

    /// Snapshot of the bytes backing `key`.
    pub fn memory_snapshot(&self, key: u64) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state.memory[&key].clone()
    }

    /// Server-side copy between backing stores, for the allocator.
    pub fn copy_bytes(
        &self,
        src_key: u64,
        src_offset: u64,
        dst_key: u64,
        dst_offset: u64,
        nbytes: u64,
    ) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        let data = {
            let src = state
                .memory
                .get(&src_key)
                .ok_or_else(|| format!("no memory for key {}", src_key))?;
            let lo = src_offset as usize;
            let hi = lo + nbytes as usize;
            if hi > src.len() {
                return Err("source out of bounds".into());
            }
            src[lo..hi].to_vec()
        };
        let dst = state
            .memory
            .get_mut(&dst_key)
            .ok_or_else(|| format!("no memory for key {}", dst_key))?;
        let lo = dst_offset as usize;
        let hi = lo + nbytes as usize;
        if hi > dst.len() {
            return Err("destination out of bounds".into());
        }
        dst[lo..hi].copy_from_slice(&data);
        Ok(())
    }

    /// Total endpoints ever opened.
    pub fn open_endpoint_count(&self) -> u64 {
        self.state.lock().unwrap().ever_opened
    }

    /// Endpoints currently open.
    pub fn live_endpoints(&self) -> usize {
        self.state.lock().unwrap().open.len()
    }

    /// Posted-but-unreaped operations on `ep`.
    pub fn pending_posts(&self, ep: EndpointId) -> usize {
        let state = self.state.lock().unwrap();
        state.pending.get(&ep.0).map_or(0, |ops| ops.len())
    }

    /// Every fence issued, in order.
    pub fn fence_log(&self) -> Vec<(FabricAddr, EndpointId)> {
        self.state.lock().unwrap().fences.clone()
    }

    /// Total quiets across all endpoints.
    pub fn total_quiets(&self) -> u64 {
        self.state.lock().unwrap().quiets.values().sum()
    }

    /// The remote IOV count of every vectored call, in order.
    pub fn vector_call_lens(&self) -> Vec<usize> {
        self.state.lock().unwrap().vector_lens.clone()
    }

    /// Fail the next data-path verb with `err`.
    pub fn inject_error(&self, err: FabricError) {
        self.state.lock().unwrap().inject = Some(err);
    }

    /// Make endpoint enabling fail.
    pub fn fail_enable(&self, fail: bool) {
        self.state.lock().unwrap().fail_enable = fail;
    }

    pub fn is_finalized(&self) -> bool {
        self.state.lock().unwrap().finalized
    }
}

fn take_injected(state: &mut FabricState) -> FabricResult<()> {
    match state.inject.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn datatype_size(datatype: AtomicDatatype) -> usize {
    match datatype {
        AtomicDatatype::Int32 | AtomicDatatype::Uint32 | AtomicDatatype::Float => 4,
        AtomicDatatype::Int64 | AtomicDatatype::Uint64 | AtomicDatatype::Double => 8,
    }
}

fn apply_atomic(op: AtomicOp, datatype: AtomicDatatype, cur: &mut [u8], val: &[u8]) {
    macro_rules! int_op {
        ($ty:ty) => {{
            let c = <$ty>::from_le_bytes(cur.try_into().unwrap());
            let v = <$ty>::from_le_bytes(val.try_into().unwrap());
            let r = match op {
                AtomicOp::Write => v,
                AtomicOp::Read => c,
                AtomicOp::Sum => c.wrapping_add(v),
                AtomicOp::Min => c.min(v),
                AtomicOp::Max => c.max(v),
                AtomicOp::And => c & v,
                AtomicOp::Or => c | v,
                AtomicOp::Xor => c ^ v,
                AtomicOp::CompareSwap => unreachable!("compare handled separately"),
            };
            cur.copy_from_slice(&r.to_le_bytes());
        }};
    }
    macro_rules! float_op {
        ($ty:ty) => {{
            let c = <$ty>::from_le_bytes(cur.try_into().unwrap());
            let v = <$ty>::from_le_bytes(val.try_into().unwrap());
            let r = match op {
                AtomicOp::Write => v,
                AtomicOp::Read => c,
                AtomicOp::Sum => c + v,
                AtomicOp::Min => c.min(v),
                AtomicOp::Max => c.max(v),
                _ => unreachable!("bitwise op on float"),
            };
            cur.copy_from_slice(&r.to_le_bytes());
        }};
    }
    match datatype {
        AtomicDatatype::Int32 => int_op!(i32),
        AtomicDatatype::Int64 => int_op!(i64),
        AtomicDatatype::Uint32 => int_op!(u32),
        AtomicDatatype::Uint64 => int_op!(u64),
        AtomicDatatype::Float => float_op!(f32),
        AtomicDatatype::Double => float_op!(f64),
    }
}

fn region_span<'a>(
    state: &'a mut FabricState,
    key: u64,
    offset: u64,
    len: usize,
) -> FabricResult<&'a mut [u8]> {
    let region = state.memory.get_mut(&key).ok_or(FabricError::Failed(ERR_KEY))?;
    let lo = offset as usize;
    let hi = lo + len;
    if hi > region.len() {
        return Err(FabricError::Failed(ERR_BOUNDS));
    }
    Ok(&mut region[lo..hi])
}

fn apply_pending(state: &mut FabricState, op: PendingOp) -> FabricResult<()> {
    match op {
        PendingOp::Write {
            key,
            src,
            len,
            offset,
        } => {
            let data = unsafe { std::slice::from_raw_parts(src as *const u8, len) };
            region_span(state, key, offset, len)?.copy_from_slice(data);
        }
        PendingOp::Read {
            key,
            dst,
            len,
            offset,
        } => {
            let target = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, len) };
            target.copy_from_slice(region_span(state, key, offset, len)?);
        }
        PendingOp::WriteVector { key, src, remote } => {
            let total: u64 = remote.iter().map(|iov| iov.len).sum();
            let data = unsafe { std::slice::from_raw_parts(src as *const u8, total as usize) };
            let mut consumed = 0usize;
            for iov in remote {
                let span = region_span(state, key, iov.offset, iov.len as usize)?;
                span.copy_from_slice(&data[consumed..consumed + iov.len as usize]);
                consumed += iov.len as usize;
            }
        }
        PendingOp::ReadVector { key, dst, remote } => {
            let total: u64 = remote.iter().map(|iov| iov.len).sum();
            let target = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, total as usize) };
            let mut filled = 0usize;
            for iov in remote {
                let span = region_span(state, key, iov.offset, iov.len as usize)?;
                target[filled..filled + iov.len as usize].copy_from_slice(span);
                filled += iov.len as usize;
            }
        }
    }
    Ok(())
}

impl Fabric for TestFabric {
    fn initialize(
        &self,
        _server: &str,
        _service: &str,
        _provider: &str,
        _is_source: bool,
        _thread_model: famops::FamThreadModel,
    ) -> FabricResult<FabricInfo> {
        let state = self.state.lock().unwrap();
        Ok(FabricInfo {
            iov_limit: state.iov_limit,
            endpoint_type: EndpointType::ReliableDatagram,
        })
    }

    fn initialize_address_vector(&self) -> FabricResult<()> {
        Ok(())
    }

    fn insert_address(&self, raw: &[u8]) -> FabricResult<FabricAddr> {
        let mut state = self.state.lock().unwrap();
        state.addrs.push(raw.to_vec());
        Ok(FabricAddr(state.addrs.len() as u64 - 1))
    }

    fn open_endpoint(&self) -> FabricResult<EndpointId> {
        let mut state = self.state.lock().unwrap();
        state.next_ep += 1;
        state.ever_opened += 1;
        let ep = state.next_ep;
        state.open.insert(ep);
        Ok(EndpointId(ep))
    }

    fn enable_endpoint(&self, ep: EndpointId) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_enable {
            return Err(FabricError::Failed(ERR_ENABLE));
        }
        if !state.open.contains(&ep.0) {
            return Err(FabricError::Failed(-1));
        }
        state.enabled.insert(ep.0);
        Ok(())
    }

    fn endpoint_name(&self, ep: EndpointId) -> FabricResult<Vec<u8>> {
        Ok(format!("ep-{}", ep.0).into_bytes())
    }

    fn close_endpoint(&self, ep: EndpointId) {
        let mut state = self.state.lock().unwrap();
        state.open.remove(&ep.0);
        state.enabled.remove(&ep.0);
        state.pending.remove(&ep.0);
    }

    fn register_mr(
        &self,
        _addr: u64,
        _len: usize,
        key: u64,
        _access: AccessFlags,
    ) -> FabricResult<MrHandle> {
        let mut state = self.state.lock().unwrap();
        state.next_mr += 1;
        let mr = state.next_mr;
        state.mrs.insert(mr, key);
        Ok(MrHandle(mr))
    }

    fn close_mr(&self, mr: MrHandle) {
        let mut state = self.state.lock().unwrap();
        state.mrs.remove(&mr.0);
    }

    fn write(
        &self,
        key: u64,
        local: &[u8],
        offset: u64,
        _addr: FabricAddr,
        _ep: EndpointId,
    ) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        region_span(&mut state, key, offset, local.len())?.copy_from_slice(local);
        Ok(())
    }

    fn read(
        &self,
        key: u64,
        local: &mut [u8],
        offset: u64,
        _addr: FabricAddr,
        _ep: EndpointId,
    ) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        let len = local.len();
        local.copy_from_slice(region_span(&mut state, key, offset, len)?);
        Ok(())
    }

    unsafe fn write_nonblocking(
        &self,
        key: u64,
        local: *const u8,
        nbytes: usize,
        offset: u64,
        _addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        if !state.memory.contains_key(&key) {
            return Err(FabricError::Failed(ERR_KEY));
        }
        state.pending.entry(ep.0).or_default().push(PendingOp::Write {
            key,
            src: local as usize,
            len: nbytes,
            offset,
        });
        Ok(())
    }

    unsafe fn read_nonblocking(
        &self,
        key: u64,
        local: *mut u8,
        nbytes: usize,
        offset: u64,
        _addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        if !state.memory.contains_key(&key) {
            return Err(FabricError::Failed(ERR_KEY));
        }
        state.pending.entry(ep.0).or_default().push(PendingOp::Read {
            key,
            dst: local as usize,
            len: nbytes,
            offset,
        });
        Ok(())
    }

    fn write_vector(
        &self,
        key: u64,
        local: &[u8],
        remote: &[RemoteIov],
        _addr: FabricAddr,
        _ep: EndpointId,
    ) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        assert!(
            remote.len() <= state.iov_limit,
            "vectored write exceeds the IOV limit"
        );
        state.vector_lens.push(remote.len());
        let mut consumed = 0usize;
        for iov in remote {
            let span = region_span(&mut state, key, iov.offset, iov.len as usize)?;
            span.copy_from_slice(&local[consumed..consumed + iov.len as usize]);
            consumed += iov.len as usize;
        }
        Ok(())
    }

    fn read_vector(
        &self,
        key: u64,
        local: &mut [u8],
        remote: &[RemoteIov],
        _addr: FabricAddr,
        _ep: EndpointId,
    ) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        assert!(
            remote.len() <= state.iov_limit,
            "vectored read exceeds the IOV limit"
        );
        state.vector_lens.push(remote.len());
        let mut filled = 0usize;
        for iov in remote {
            let span = region_span(&mut state, key, iov.offset, iov.len as usize)?;
            local[filled..filled + iov.len as usize].copy_from_slice(span);
            filled += iov.len as usize;
        }
        Ok(())
    }

    unsafe fn write_vector_nonblocking(
        &self,
        key: u64,
        local: *const u8,
        remote: &[RemoteIov],
        _addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        assert!(
            remote.len() <= state.iov_limit,
            "vectored write exceeds the IOV limit"
        );
        state.vector_lens.push(remote.len());
        if !state.memory.contains_key(&key) {
            return Err(FabricError::Failed(ERR_KEY));
        }
        state
            .pending
            .entry(ep.0)
            .or_default()
            .push(PendingOp::WriteVector {
                key,
                src: local as usize,
                remote: remote.to_vec(),
            });
        Ok(())
    }

    unsafe fn read_vector_nonblocking(
        &self,
        key: u64,
        local: *mut u8,
        remote: &[RemoteIov],
        _addr: FabricAddr,
        ep: EndpointId,
    ) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        assert!(
            remote.len() <= state.iov_limit,
            "vectored read exceeds the IOV limit"
        );
        state.vector_lens.push(remote.len());
        if !state.memory.contains_key(&key) {
            return Err(FabricError::Failed(ERR_KEY));
        }
        state
            .pending
            .entry(ep.0)
            .or_default()
            .push(PendingOp::ReadVector {
                key,
                dst: local as usize,
                remote: remote.to_vec(),
            });
        Ok(())
    }

    fn atomic(
        &self,
        key: u64,
        value: &[u8],
        offset: u64,
        op: AtomicOp,
        datatype: AtomicDatatype,
        _addr: FabricAddr,
        _ep: EndpointId,
    ) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        let size = datatype_size(datatype);
        let span = region_span(&mut state, key, offset, size)?;
        apply_atomic(op, datatype, span, &value[..size]);
        Ok(())
    }

    fn fetch_atomic(
        &self,
        key: u64,
        value: &[u8],
        result: &mut [u8],
        offset: u64,
        op: AtomicOp,
        datatype: AtomicDatatype,
        _addr: FabricAddr,
        _ep: EndpointId,
    ) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        let size = datatype_size(datatype);
        let span = region_span(&mut state, key, offset, size)?;
        result[..size].copy_from_slice(span);
        apply_atomic(op, datatype, span, &value[..size]);
        Ok(())
    }

    fn compare_atomic(
        &self,
        key: u64,
        compare: &[u8],
        result: &mut [u8],
        swap: &[u8],
        offset: u64,
        _op: AtomicOp,
        datatype: AtomicDatatype,
        _addr: FabricAddr,
        _ep: EndpointId,
    ) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        let size = datatype_size(datatype);
        let span = region_span(&mut state, key, offset, size)?;
        result[..size].copy_from_slice(span);
        if *span == compare[..size] {
            span.copy_from_slice(&swap[..size]);
        }
        Ok(())
    }

    fn fence(&self, addr: FabricAddr, ep: EndpointId) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        state.fences.push((addr, ep));
        Ok(())
    }

    fn quiet(&self, ep: EndpointId) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        take_injected(&mut state)?;
        let ops = state.pending.remove(&ep.0).unwrap_or_default();
        for op in ops {
            apply_pending(&mut state, op)?;
        }
        *state.quiets.entry(ep.0).or_insert(0) += 1;
        Ok(())
    }

    fn strerror(&self, code: i32) -> String {
        match code {
            ERR_KEY => "unknown access key".into(),
            ERR_BOUNDS => "access out of bounds".into(),
            ERR_ENABLE => "endpoint enable refused".into(),
            _ => format!("provider error {}", code),
        }
    }

    fn finalize(&self) {
        self.state.lock().unwrap().finalized = true;
    }
}

struct RegionRecord {
    region_id: u64,
    size: u64,
    perms: u32,
    next_offset: u64,
}

struct ItemRecord {
    region_id: u64,
    item_offset: u64,
    key: u64,
    size: u64,
}

/// Fake allocator: address book, sized region/item bookkeeping, blocking
/// CAS-lock service, and copies offloaded onto the fabric's byte store.
pub struct TestAllocator {
    fabric: Arc<TestFabric>,
    addrs: Vec<Vec<u8>>,
    next_key: AtomicU64,
    next_region: AtomicU64,
    regions: Mutex<HashMap<String, RegionRecord>>,
    items: Mutex<HashMap<String, ItemRecord>>,
    locks: Mutex<HashSet<(u64, u64)>>,
    lock_cv: Condvar,
    lock_stats: Mutex<(u64, u64)>,
    copies: Mutex<Vec<bool>>,
    fail_addr: AtomicBool,
}

impl TestAllocator {
    pub fn new(n_servers: u64, fabric: Arc<TestFabric>) -> Self {
        let addrs = (0..n_servers)
            .map(|i| format!("raw-addr-{}", i).into_bytes())
            .collect();
        Self {
            fabric,
            addrs,
            next_key: AtomicU64::new(100),
            next_region: AtomicU64::new(1),
            regions: Mutex::new(HashMap::new()),
            items: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashSet::new()),
            lock_cv: Condvar::new(),
            lock_stats: Mutex::new((0, 0)),
            copies: Mutex::new(Vec::new()),
            fail_addr: AtomicBool::new(false),
        }
    }

    /// Create a named region of `size` bytes on `memserver_id`.
    pub fn create_region(
        &self,
        name: &str,
        size: u64,
        perms: u32,
        memserver_id: u64,
    ) -> FamRegionDescriptor {
        let index = self.next_region.fetch_add(1, Ordering::Relaxed);
        let region_id = make_region_id(memserver_id, index);
        self.regions.lock().unwrap().insert(
            name.to_string(),
            RegionRecord {
                region_id,
                size,
                perms,
                next_offset: 0,
            },
        );
        FamRegionDescriptor::new(region_id)
    }

    /// Allocate a named item of `size` bytes inside `region`, backing it
    /// with fabric memory under a fresh access key.
    pub fn allocate(
        &self,
        name: &str,
        size: u64,
        region: &FamRegionDescriptor,
    ) -> FamDescriptor {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut regions = self.regions.lock().unwrap();
        let item_offset = regions
            .values_mut()
            .find(|r| r.region_id == region.region_id())
            .map(|r| {
                let offset = r.next_offset;
                r.next_offset += size;
                offset
            })
            .unwrap_or(0);
        drop(regions);

        self.fabric.create_memory(key, size as usize);
        self.items.lock().unwrap().insert(
            name.to_string(),
            ItemRecord {
                region_id: region.region_id(),
                item_offset,
                key,
                size,
            },
        );
        FamDescriptor::new(region.region_id(), item_offset, key)
    }

    /// Size of a named region or item.
    pub fn fam_size(&self, name: &str) -> Option<u64> {
        if let Some(region) = self.regions.lock().unwrap().get(name) {
            return Some(region.size);
        }
        self.items.lock().unwrap().get(name).map(|item| item.size)
    }

    /// Look a named item up, returning a fresh descriptor and its size.
    pub fn lookup(&self, name: &str) -> Option<(FamDescriptor, u64)> {
        let items = self.items.lock().unwrap();
        let item = items.get(name)?;
        Some((
            FamDescriptor::new(item.region_id, item.item_offset, item.key),
            item.size,
        ))
    }

    /// (acquires, releases) seen by the CAS-lock service.
    pub fn cas_lock_stats(&self) -> (u64, u64) {
        *self.lock_stats.lock().unwrap()
    }

    /// Make the address book unavailable.
    pub fn fail_addr(&self, fail: bool) {
        self.fail_addr.store(fail, Ordering::Relaxed);
    }
}

impl FamAllocator for TestAllocator {
    fn addr_size(&self, memserver_id: u64) -> AllocResult<usize> {
        if self.fail_addr.load(Ordering::Relaxed) {
            return Err(AllocatorError::new("address service unavailable"));
        }
        self.addrs
            .get(memserver_id as usize)
            .map(|addr| addr.len())
            .ok_or_else(|| AllocatorError::new(format!("no memory server {}", memserver_id)))
    }

    fn addr(&self, buf: &mut [u8], memserver_id: u64) -> AllocResult<()> {
        let addr = self
            .addrs
            .get(memserver_id as usize)
            .ok_or_else(|| AllocatorError::new(format!("no memory server {}", memserver_id)))?;
        buf.copy_from_slice(addr);
        Ok(())
    }

    fn copy(
        &self,
        src: &FamDescriptor,
        src_offset: u64,
        dest: &FamDescriptor,
        dest_offset: u64,
        nbytes: u64,
    ) -> AllocResult<CopyToken> {
        self.fabric
            .copy_bytes(src.key(), src_offset, dest.key(), dest_offset, nbytes)
            .map_err(AllocatorError::new)?;
        let mut copies = self.copies.lock().unwrap();
        copies.push(true);
        Ok(CopyToken(copies.len() as u64 - 1))
    }

    fn wait_for_copy(&self, token: CopyToken) -> AllocResult<()> {
        let copies = self.copies.lock().unwrap();
        match copies.get(token.0 as usize) {
            Some(true) => Ok(()),
            _ => Err(AllocatorError::new("unknown copy token")),
        }
    }

    fn acquire_cas_lock(&self, descriptor: &FamDescriptor) -> AllocResult<()> {
        let lease = (descriptor.region_id(), descriptor.item_offset());
        let mut held = self.locks.lock().unwrap();
        while held.contains(&lease) {
            held = self.lock_cv.wait(held).unwrap();
        }
        held.insert(lease);
        self.lock_stats.lock().unwrap().0 += 1;
        Ok(())
    }

    fn release_cas_lock(&self, descriptor: &FamDescriptor) -> AllocResult<()> {
        let lease = (descriptor.region_id(), descriptor.item_offset());
        let mut held = self.locks.lock().unwrap();
        if !held.remove(&lease) {
            return Err(AllocatorError::new("releasing a lease that is not held"));
        }
        self.lock_cv.notify_all();
        self.lock_stats.lock().unwrap().1 += 1;
        Ok(())
    }
}

/// A client engine wired to the in-memory fabric and allocator.
pub struct TestRig {
    pub fabric: Arc<TestFabric>,
    pub allocator: Arc<TestAllocator>,
    pub engine: FamOps,
}

pub fn client_rig(n_servers: u64, model: FamContextModel) -> TestRig {
    client_rig_with_iov(n_servers, model, DEFAULT_IOV_LIMIT)
}

pub fn client_rig_with_iov(n_servers: u64, model: FamContextModel, iov_limit: usize) -> TestRig {
    let fabric = Arc::new(TestFabric::with_iov_limit(iov_limit));
    let allocator = Arc::new(TestAllocator::new(n_servers, fabric.clone()));

    let mut config = FamConfig::new().with_context_model(model);
    for i in 0..n_servers {
        config = config.with_memory_server(i, format!("fam-node-{}", i));
    }

    let engine = FamOps::new(
        config,
        fabric.clone() as Arc<dyn Fabric>,
        Some(allocator.clone() as Arc<dyn FamAllocator>),
    )
    .expect("engine construction");

    TestRig {
        fabric,
        allocator,
        engine,
    }
}
