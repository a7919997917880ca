//! Fabric contexts: the unit of ordering on the fabric.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::fabric::EndpointId;

/// An endpoint plus its completion-queue pair.
///
/// Operations on one context follow fabric-provided ordering; operations on
/// disjoint contexts have no ordering relation. The pending counters track
/// nonblocking posts that have not yet been reaped by a quiet over this
/// context; blocking operations complete before returning and are never
/// counted.
#[derive(Debug)]
pub struct FamContext {
    endpoint: EndpointId,
    pending_writes: AtomicU64,
    pending_reads: AtomicU64,
}

impl FamContext {
    pub(crate) fn new(endpoint: EndpointId) -> Self {
        Self {
            endpoint,
            pending_writes: AtomicU64::new(0),
            pending_reads: AtomicU64::new(0),
        }
    }

    /// The endpoint carrying this context's operations.
    #[inline]
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Nonblocking writes posted since the last quiet.
    #[inline]
    pub fn pending_writes(&self) -> u64 {
        self.pending_writes.load(Ordering::Relaxed)
    }

    /// Nonblocking reads posted since the last quiet.
    #[inline]
    pub fn pending_reads(&self) -> u64 {
        self.pending_reads.load(Ordering::Relaxed)
    }

    pub(crate) fn note_writes_posted(&self, n: u64) {
        self.pending_writes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn note_reads_posted(&self, n: u64) {
        self.pending_reads.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn clear_pending(&self) {
        self.pending_writes.store(0, Ordering::Relaxed);
        self.pending_reads.store(0, Ordering::Relaxed);
    }
}

/// The two context tables. Exactly one is populated for a given policy: the
/// default table (keyed by memory server, filled at initialisation) or the
/// region table (keyed by region, filled lazily under its mutex).
///
/// Ordered maps, so scope-wide fence and quiet walk entries in id order
/// against the address registry. A context published in either table is
/// never moved or replaced.
#[derive(Debug)]
pub(crate) struct ContextTables {
    pub(crate) default_table: BTreeMap<u64, Arc<FamContext>>,
    pub(crate) region_table: Mutex<BTreeMap<u64, Arc<FamContext>>>,
}

impl ContextTables {
    pub(crate) fn new() -> Self {
        Self {
            default_table: BTreeMap::new(),
            region_table: Mutex::new(BTreeMap::new()),
        }
    }
}
