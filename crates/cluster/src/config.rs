//! Cluster node configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gridflow_ring::DEFAULT_REPLICAS;
use gridflow_runtime::backoff::serde_millis;
use gridflow_runtime::StorageRetry;

/// Journal backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum JournalBackend {
    /// In-memory journal; durability ends with the process
    Memory,

    /// File-backed journal rooted at the given directory
    Persistent { path: PathBuf },
}

/// Configuration for one cluster node
///
/// # Example
///
/// ```
/// use gridflow_cluster::ClusterConfig;
///
/// let config = ClusterConfig::new("node-1", "127.0.0.1:7800".parse().unwrap())
///     .with_seeds(vec!["127.0.0.1:7799".parse().unwrap()]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Identifier of this node; stable across restarts of the same
    /// logical node
    pub node_id: String,

    /// Address the transport binds to
    pub bind_addr: SocketAddr,

    /// Addresses contacted once at startup to learn the membership;
    /// seeds hold no privileged role afterwards
    pub seeds: Vec<SocketAddr>,

    /// Period of the gossip protocol tick
    #[serde(with = "serde_millis")]
    pub gossip_tick_period: Duration,

    /// How long to wait for a direct ping's ack
    #[serde(with = "serde_millis")]
    pub direct_ping_timeout: Duration,

    /// How long to wait for an indirect ack after ping-req fanout
    #[serde(with = "serde_millis")]
    pub indirect_ping_timeout: Duration,

    /// How long a suspect may remain unrefuted before it is declared dead
    #[serde(with = "serde_millis")]
    pub suspect_timeout: Duration,

    /// How long a dead member keeps receiving gossip
    ///
    /// A member that was partitioned rather than crashed only learns of
    /// its death sentence, and refutes it, if someone still talks to it.
    #[serde(with = "serde_millis")]
    pub dead_gossip_window: Duration,

    /// Virtual points each member contributes to the hash ring
    pub virtual_nodes_per_member: usize,

    /// How many updates piggyback on each outgoing protocol message
    pub gossip_update_fanout: usize,

    /// Per-update transmission cap; `None` derives `3 * ceil(log2(N+1))`
    /// from the current alive count
    pub max_transmissions: Option<u32>,

    /// Number of members asked to relay an indirect ping
    pub indirect_probe_count: usize,

    /// How long a forwarded submission waits for its ack
    #[serde(with = "serde_millis")]
    pub submit_ack_timeout: Duration,

    /// Journal backend for this node
    pub journal_backend: JournalBackend,

    /// Backoff policy for journal appends
    pub storage_retry: StorageRetry,
}

impl ClusterConfig {
    /// Create a configuration with protocol defaults
    pub fn new(node_id: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            bind_addr,
            seeds: vec![],
            gossip_tick_period: Duration::from_secs(1),
            direct_ping_timeout: Duration::from_millis(500),
            indirect_ping_timeout: Duration::from_secs(1),
            suspect_timeout: Duration::from_secs(5),
            dead_gossip_window: Duration::from_secs(30),
            virtual_nodes_per_member: DEFAULT_REPLICAS,
            gossip_update_fanout: 6,
            max_transmissions: None,
            indirect_probe_count: 3,
            submit_ack_timeout: Duration::from_secs(5),
            journal_backend: JournalBackend::Memory,
            storage_retry: StorageRetry::default(),
        }
    }

    /// Default config with a generated node id, mostly for tests
    pub fn ephemeral(bind_addr: SocketAddr) -> Self {
        Self::new(format!("node-{}", Uuid::now_v7()), bind_addr)
    }

    /// Set the seed addresses used on initial join
    pub fn with_seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Set the gossip tick period
    pub fn with_gossip_tick_period(mut self, period: Duration) -> Self {
        self.gossip_tick_period = period;
        self
    }

    /// Set the probe timeouts in one call
    pub fn with_probe_timeouts(mut self, direct: Duration, indirect: Duration) -> Self {
        self.direct_ping_timeout = direct;
        self.indirect_ping_timeout = indirect;
        self
    }

    /// Set the suspicion expiry timeout
    pub fn with_suspect_timeout(mut self, timeout: Duration) -> Self {
        self.suspect_timeout = timeout;
        self
    }

    /// Set the journal backend
    pub fn with_journal_backend(mut self, backend: JournalBackend) -> Self {
        self.journal_backend = backend;
        self
    }

    /// Set the forwarded-submission ack timeout
    pub fn with_submit_ack_timeout(mut self, timeout: Duration) -> Self {
        self.submit_ack_timeout = timeout;
        self
    }

    /// Set the per-update transmission cap
    pub fn with_max_transmissions(mut self, cap: u32) -> Self {
        self.max_transmissions = Some(cap);
        self
    }
}
