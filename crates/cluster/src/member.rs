//! Membership data model: node states, records and gossip updates

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness state of a cluster member
///
/// At equal incarnation the higher-priority state wins a merge:
/// `Left > Dead > Suspect > Alive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Responding to probes
    Alive,

    /// Failed direct and indirect probes; awaiting refutation
    Suspect,

    /// Suspicion expired without refutation
    Dead,

    /// Announced a graceful departure
    Left,
}

impl NodeState {
    /// Conflict-resolution priority at equal incarnation
    pub fn priority(self) -> u8 {
        match self {
            Self::Alive => 0,
            Self::Suspect => 1,
            Self::Dead => 2,
            Self::Left => 3,
        }
    }

    /// Whether a member in this state belongs on the hash ring
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Alive)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alive => write!(f, "alive"),
            Self::Suspect => write!(f, "suspect"),
            Self::Dead => write!(f, "dead"),
            Self::Left => write!(f, "left"),
        }
    }
}

/// One member's record in the membership table
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Opaque identifier, stable across restarts of the same logical node
    pub id: String,

    /// Transport address
    pub addr: SocketAddr,

    /// Current derived state
    pub state: NodeState,

    /// Incarnation the state was asserted at; only the node itself may
    /// increase its own incarnation
    pub incarnation: u64,

    /// Last time this node was directly or indirectly confirmed
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeInfo {
    /// The gossip assertion equivalent to this record
    pub fn to_update(&self) -> GossipUpdate {
        GossipUpdate {
            node_id: self.id.clone(),
            addr: self.addr,
            state: self.state,
            incarnation: self.incarnation,
        }
    }
}

/// An assertion about one node, disseminated via gossip
///
/// Updates carry no causal order; conflicts resolve by
/// `(incarnation, state priority)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipUpdate {
    /// Subject of the assertion
    pub node_id: String,

    /// Subject's transport address
    pub addr: SocketAddr,

    /// Asserted state
    pub state: NodeState,

    /// Incarnation the assertion was made at
    pub incarnation: u64,
}

impl GossipUpdate {
    /// Whether this update beats an existing `(incarnation, state)` pair
    pub fn supersedes(&self, incarnation: u64, state: NodeState) -> bool {
        self.incarnation > incarnation
            || (self.incarnation == incarnation && self.state.priority() > state.priority())
    }
}

/// Notification emitted when a member enters or leaves the alive set
///
/// The hash ring is a projection of these events; nothing else mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Member became `Alive` and belongs on the ring
    MemberUp(String),

    /// Member stopped being `Alive` and leaves the ring
    MemberDown(String),
}
