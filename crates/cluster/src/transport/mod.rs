//! Cluster transport abstraction
//!
//! Best-effort, unordered delivery of protocol messages between nodes.
//! Duplicates are acceptable by design: gossip merge is idempotent and
//! workflow submission is keyed by workflow id. Reliability comes from
//! repetition at the protocol layer, never from the transport.

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use gridflow_runtime::SubmitOutcome;

use crate::member::GossipUpdate;

pub mod codec;
pub mod memory;
pub mod udp;

pub use memory::{MemoryHub, MemoryTransport};
pub use udp::UdpTransport;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Frame exceeds the wire-size bound
    #[error("frame of {0} bytes exceeds the {max} byte limit", max = codec::MAX_FRAME)]
    FrameTooLarge(usize),

    /// Message could not be encoded
    #[error("encode error: {0}")]
    Encode(String),

    /// Frame could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Socket could not be bound
    #[error("bind error: {0}")]
    Bind(String),

    /// Send failed at the socket layer
    #[error("send error: {0}")]
    Send(String),
}

/// Protocol messages
///
/// Wire framing is `[u32 LE length][u8 kind][payload]`; the payload is the
/// JSON body of the variant (see [`codec`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Direct liveness probe
    Ping {
        from_id: String,
        from_incarnation: u64,
        updates: Vec<GossipUpdate>,
    },

    /// Ask a third party to probe `target_id` on our behalf
    PingReq {
        from_id: String,
        target_id: String,
        target_addr: SocketAddr,
        updates: Vec<GossipUpdate>,
    },

    /// Probe answer, direct or relayed
    Ack {
        from_id: String,
        updates: Vec<GossipUpdate>,
    },

    /// Standalone update dissemination (leave, refutation blasts)
    Gossip {
        from_id: String,
        updates: Vec<GossipUpdate>,
    },

    /// Bootstrap request sent to a seed
    Join {
        from_id: String,
        from_addr: SocketAddr,
        incarnation: u64,
    },

    /// Seed's answer: full membership snapshot plus piggyback
    JoinResponse {
        snapshot: Vec<GossipUpdate>,
        updates: Vec<GossipUpdate>,
    },

    /// Forwarded workflow submission, keyed by workflow id
    WorkflowSubmit {
        workflow_id: String,
        workflow_name: String,
        input: serde_json::Value,
    },

    /// Outcome of a forwarded submission
    WorkflowSubmitAck {
        workflow_id: String,
        outcome: SubmitOutcome,
    },
}

impl Message {
    /// One-byte kind discriminator for the wire framing
    pub fn kind_byte(&self) -> u8 {
        match self {
            Self::Ping { .. } => 1,
            Self::PingReq { .. } => 2,
            Self::Ack { .. } => 3,
            Self::Gossip { .. } => 4,
            Self::Join { .. } => 5,
            Self::JoinResponse { .. } => 6,
            Self::WorkflowSubmit { .. } => 7,
            Self::WorkflowSubmitAck { .. } => 8,
        }
    }
}

/// An inbound message together with its sender address
#[derive(Debug)]
pub struct Envelope {
    /// Address the frame arrived from
    pub from: SocketAddr,

    /// Decoded message
    pub message: Message,
}

/// Message-passing substrate between cluster nodes
///
/// `send` is at-most-once per attempt: a frame is either delivered whole
/// or dropped. Implementations must drop rather than queue unboundedly on
/// the send side. Inbound traffic arrives on the `mpsc::Receiver<Envelope>`
/// handed out when the transport is constructed.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address peers should use to reach this node
    fn local_addr(&self) -> SocketAddr;

    /// Fire one message at a peer, best effort
    async fn send(&self, to: SocketAddr, message: Message) -> Result<(), TransportError>;
}
