//! # Gridflow Cluster
//!
//! Cluster membership, failure detection, routing and workflow forwarding
//! for the gridflow durable runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ClusterNode                           │
//! │   submit(name, workflow_id, input) → local drive / forward   │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                     │
//!          ▼                   ▼                     ▼
//! ┌────────────────┐  ┌────────────────┐  ┌────────────────────┐
//! │    HashRing     │  │ MembershipTable │  │       Gossip        │
//! │ (projection of  │◀─│ (single source  │─▶│ (SWIM probes and    │
//! │  alive members) │  │  of truth)      │  │  dissemination)     │
//! └────────────────┘  └────────────────┘  └────────────────────┘
//!                                                   │
//!                                                   ▼
//!                                          ┌────────────────────┐
//!                                          │     Transport       │
//!                                          │ (udp / in-memory)   │
//!                                          └────────────────────┘
//! ```
//!
//! The membership table owns liveness truth; the ring is a projection fed
//! by membership events; gossip reads and writes the table through its
//! probe cycle. None of the three hold references to each other.

pub mod config;
pub mod gossip;
pub mod member;
pub mod membership;
pub mod node;
pub mod transport;

pub use config::{ClusterConfig, JournalBackend};
pub use gossip::Gossip;
pub use member::{GossipUpdate, MembershipEvent, NodeInfo, NodeState};
pub use membership::{MembershipTable, MergeOutcome};
pub use node::{ClusterError, ClusterNode};
pub use transport::{
    Envelope, MemoryHub, MemoryTransport, Message, Transport, TransportError, UdpTransport,
};
