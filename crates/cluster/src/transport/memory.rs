//! In-process transport registry for deterministic tests
//!
//! Not a production transport: a [`MemoryHub`] plays the network, routing
//! frames between bound addresses, and can partition an address to
//! simulate failures. Frames still pass through the real codec so size
//! bounds and serializability hold exactly as on the wire.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::debug;

use super::{codec, Envelope, Message, Transport, TransportError};

/// Per-address inbox capacity; overflow drops, it never queues unboundedly
const INBOX_CAPACITY: usize = 256;

/// In-process "network" shared by a set of [`MemoryTransport`]s
///
/// # Example
///
/// ```ignore
/// let hub = MemoryHub::new();
/// let (transport_a, inbox_a) = hub.bind("127.0.0.1:7800".parse().unwrap());
/// let (transport_b, inbox_b) = hub.bind("127.0.0.1:7801".parse().unwrap());
///
/// hub.partition("127.0.0.1:7801".parse().unwrap()); // drop all of b's traffic
/// hub.heal("127.0.0.1:7801".parse().unwrap());
/// ```
pub struct MemoryHub {
    inboxes: DashMap<SocketAddr, mpsc::Sender<Envelope>>,
    partitioned: RwLock<HashSet<SocketAddr>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: DashMap::new(),
            partitioned: RwLock::new(HashSet::new()),
        })
    }

    /// Bind an address, returning the transport and its inbound channel
    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> (Arc<MemoryTransport>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.insert(addr, tx);

        let transport = Arc::new(MemoryTransport {
            hub: self.clone(),
            local: addr,
        });
        (transport, rx)
    }

    /// Drop all traffic to and from an address until healed
    pub fn partition(&self, addr: SocketAddr) {
        self.partitioned.write().insert(addr);
    }

    /// Restore traffic for a previously partitioned address
    pub fn heal(&self, addr: SocketAddr) {
        self.partitioned.write().remove(&addr);
    }

    fn is_partitioned(&self, addr: SocketAddr) -> bool {
        self.partitioned.read().contains(&addr)
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, message: Message) {
        if self.is_partitioned(from) || self.is_partitioned(to) {
            debug!(%from, %to, "dropping frame across partition");
            return;
        }

        let Some(inbox) = self.inboxes.get(&to) else {
            debug!(%from, %to, "dropping frame to unbound address");
            return;
        };

        // A full or closed inbox drops the frame; the protocol repeats
        if inbox.try_send(Envelope { from, message }).is_err() {
            debug!(%from, %to, "dropping frame, inbox unavailable");
        }
    }
}

/// Transport endpoint registered with a [`MemoryHub`]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local: SocketAddr,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn send(&self, to: SocketAddr, message: Message) -> Result<(), TransportError> {
        // Encode and decode through the real codec so the memory transport
        // enforces the same frame bound and serializability as the wire.
        let frame = codec::encode(&message)?;
        let message = codec::decode(&frame)?;

        self.hub.deliver(self.local, to, message);
        Ok(())
    }
}
