//! Configuration types for famops.

use std::collections::BTreeMap;

/// Transport threading discipline, forwarded verbatim to the fabric binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamThreadModel {
    /// The fabric is driven by a single thread.
    Single,
    /// The fabric takes its own locks; the engine may be shared across
    /// application threads.
    Multiple,
}

/// Context selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamContextModel {
    /// One context per memory server, created eagerly at initialisation.
    Node,
    /// One context per region, created lazily on first access.
    Region,
}

/// Engine configuration.
///
/// Memory servers are keyed by id; ids must be contiguous from zero so the
/// address registry can be indexed directly.
#[derive(Debug, Clone)]
pub struct FamConfig {
    /// Memory server id to hostname map.
    pub memory_servers: BTreeMap<u64, String>,
    /// Transport service identifier (port string).
    /// Default: "7500"
    pub service: String,
    /// Transport provider name.
    /// Default: "sockets"
    pub provider: String,
    /// Threading discipline for the fabric.
    /// Default: Multiple
    pub thread_model: FamThreadModel,
    /// Context selection policy.
    /// Default: Node
    pub context_model: FamContextModel,
    /// True when this process is itself a memory server.
    /// Default: false
    pub is_source: bool,
}

impl Default for FamConfig {
    fn default() -> Self {
        Self {
            memory_servers: BTreeMap::new(),
            service: "7500".into(),
            provider: "sockets".into(),
            thread_model: FamThreadModel::Multiple,
            context_model: FamContextModel::Node,
            is_source: false,
        }
    }
}

impl FamConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a single memory server at id 0.
    pub fn single_server(hostname: impl Into<String>) -> Self {
        Self::default().with_memory_server(0, hostname)
    }

    /// Add a memory server to the map.
    pub fn with_memory_server(mut self, id: u64, hostname: impl Into<String>) -> Self {
        self.memory_servers.insert(id, hostname.into());
        self
    }

    /// Set the transport service identifier.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Set the transport provider name.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Set the threading discipline.
    pub fn with_thread_model(mut self, thread_model: FamThreadModel) -> Self {
        self.thread_model = thread_model;
        self
    }

    /// Set the context selection policy.
    pub fn with_context_model(mut self, context_model: FamContextModel) -> Self {
        self.context_model = context_model;
        self
    }

    /// Mark this process as a memory server.
    pub fn with_source(mut self, is_source: bool) -> Self {
        self.is_source = is_source;
        self
    }
}
