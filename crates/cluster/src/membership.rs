//! Membership table: the single source of truth for cluster liveness
//!
//! Gossip reads and writes the table; the hash ring subscribes to the
//! table's events. Neither holds a reference to the other. Merge follows
//! the SWIM rule: an update applies iff it carries a higher incarnation,
//! or the same incarnation with a strictly higher state priority. Claims
//! that the local node is `Suspect` or `Dead` are refuted by advancing the
//! local incarnation past the claim.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::member::{GossipUpdate, MembershipEvent, NodeInfo, NodeState};

/// Result of merging one gossip update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The update superseded local knowledge and was applied
    Applied,

    /// Local knowledge already superseded the update
    Ignored,

    /// The update slandered the local node; incarnation was advanced and
    /// an `Alive` assertion queued in its place
    Refuted,
}

struct Entry {
    info: NodeInfo,
    suspected_at: Option<Instant>,
    dead_since: Option<Instant>,
}

struct QueuedUpdate {
    update: GossipUpdate,
    transmissions: u32,
}

/// Shared membership table with bounded-retransmission dissemination queue
pub struct MembershipTable {
    local_id: String,
    local_addr: SocketAddr,
    incarnation: AtomicU64,
    nodes: RwLock<HashMap<String, Entry>>,
    queue: Mutex<Vec<QueuedUpdate>>,
    events: mpsc::UnboundedSender<MembershipEvent>,
    max_transmissions: Option<u32>,
}

impl MembershipTable {
    /// Create a table seeded with the local node as `Alive` at incarnation 0
    ///
    /// `events` receives a notification whenever a member enters or leaves
    /// the alive set, the local node included.
    pub fn new(
        local_id: impl Into<String>,
        local_addr: SocketAddr,
        events: mpsc::UnboundedSender<MembershipEvent>,
        max_transmissions: Option<u32>,
    ) -> Self {
        let local_id = local_id.into();
        let table = Self {
            local_id: local_id.clone(),
            local_addr,
            incarnation: AtomicU64::new(0),
            nodes: RwLock::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
            events,
            max_transmissions,
        };

        table.nodes.write().insert(
            local_id.clone(),
            Entry {
                info: NodeInfo {
                    id: local_id.clone(),
                    addr: local_addr,
                    state: NodeState::Alive,
                    incarnation: 0,
                    last_heartbeat: Utc::now(),
                },
                suspected_at: None,
                dead_since: None,
            },
        );
        let _ = table.events.send(MembershipEvent::MemberUp(local_id));
        table
    }

    /// Local node id
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Local transport address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current local incarnation
    pub fn local_incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    /// The local node's current assertion about itself
    pub fn local_update(&self) -> GossipUpdate {
        GossipUpdate {
            node_id: self.local_id.clone(),
            addr: self.local_addr,
            state: NodeState::Alive,
            incarnation: self.local_incarnation(),
        }
    }

    /// Merge one incoming update
    pub fn merge(&self, update: GossipUpdate) -> MergeOutcome {
        if update.node_id == self.local_id {
            return self.merge_about_self(update);
        }

        let mut nodes = self.nodes.write();
        match nodes.get_mut(&update.node_id) {
            None => {
                let was_alive = false;
                let now_alive = update.state.is_alive();
                debug!(node = %update.node_id, state = %update.state, "learned of new member");
                nodes.insert(
                    update.node_id.clone(),
                    Entry {
                        info: NodeInfo {
                            id: update.node_id.clone(),
                            addr: update.addr,
                            state: update.state,
                            incarnation: update.incarnation,
                            last_heartbeat: Utc::now(),
                        },
                        suspected_at: suspicion_clock(update.state),
                        dead_since: death_clock(update.state),
                    },
                );
                drop(nodes);
                self.emit_transition(&update.node_id, was_alive, now_alive);
                self.enqueue(update);
                MergeOutcome::Applied
            }
            Some(entry) => {
                if !update.supersedes(entry.info.incarnation, entry.info.state) {
                    return MergeOutcome::Ignored;
                }

                let was_alive = entry.info.state.is_alive();
                let now_alive = update.state.is_alive();
                entry.info.addr = update.addr;
                entry.info.state = update.state;
                entry.info.incarnation = update.incarnation;
                entry.info.last_heartbeat = Utc::now();
                entry.suspected_at = suspicion_clock(update.state);
                entry.dead_since = death_clock(update.state);
                drop(nodes);

                self.emit_transition(&update.node_id, was_alive, now_alive);
                self.enqueue(update);
                MergeOutcome::Applied
            }
        }
    }

    /// Handle an assertion about the local node
    ///
    /// `Suspect`/`Dead` claims are refuted regardless of the claimed
    /// incarnation: the local incarnation jumps past the claim and an
    /// `Alive` assertion is queued. Only the node itself ever advances its
    /// own incarnation.
    fn merge_about_self(&self, update: GossipUpdate) -> MergeOutcome {
        match update.state {
            NodeState::Suspect | NodeState::Dead => {
                let previous = self
                    .incarnation
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                        Some(current.max(update.incarnation) + 1)
                    })
                    .unwrap_or_default();
                let refuted_at = previous.max(update.incarnation) + 1;

                {
                    let mut nodes = self.nodes.write();
                    if let Some(entry) = nodes.get_mut(&self.local_id) {
                        entry.info.state = NodeState::Alive;
                        entry.info.incarnation = refuted_at;
                        entry.info.last_heartbeat = Utc::now();
                        entry.suspected_at = None;
                    }
                }

                info!(
                    claimed = %update.state,
                    claimed_incarnation = update.incarnation,
                    incarnation = refuted_at,
                    "refuting false report about local node"
                );
                self.enqueue(self.local_update());
                MergeOutcome::Refuted
            }
            NodeState::Alive => {
                // Our own refutation echoing back; adopt the larger
                // incarnation so a restarted node catches up with what the
                // cluster remembers about it.
                let current = self.local_incarnation();
                if update.incarnation > current {
                    self.incarnation.store(update.incarnation, Ordering::SeqCst);
                    if let Some(entry) = self.nodes.write().get_mut(&self.local_id) {
                        entry.info.incarnation = update.incarnation;
                    }
                    MergeOutcome::Applied
                } else {
                    MergeOutcome::Ignored
                }
            }
            NodeState::Left => MergeOutcome::Ignored,
        }
    }

    /// Mark a member suspected at its last-known incarnation
    pub fn suspect(&self, node_id: &str) {
        if node_id == self.local_id {
            return;
        }

        let update = {
            let mut nodes = self.nodes.write();
            let Some(entry) = nodes.get_mut(node_id) else {
                return;
            };
            if entry.info.state != NodeState::Alive {
                return;
            }

            entry.info.state = NodeState::Suspect;
            entry.suspected_at = Some(Instant::now());
            entry.info.to_update()
        };

        info!(node = %node_id, "member suspected");
        self.emit_transition(node_id, true, false);
        self.enqueue(update);
    }

    /// Convert suspects older than `timeout` to `Dead`
    ///
    /// Returns the ids that were converted this pass.
    pub fn expire_suspects(&self, timeout: Duration) -> Vec<String> {
        let mut converted = Vec::new();
        let mut updates = Vec::new();

        {
            let mut nodes = self.nodes.write();
            for entry in nodes.values_mut() {
                let expired = entry.info.state == NodeState::Suspect
                    && entry
                        .suspected_at
                        .is_some_and(|since| since.elapsed() >= timeout);
                if expired {
                    entry.info.state = NodeState::Dead;
                    entry.suspected_at = None;
                    entry.dead_since = Some(Instant::now());
                    converted.push(entry.info.id.clone());
                    updates.push(entry.info.to_update());
                }
            }
        }

        for (id, update) in converted.iter().zip(updates) {
            info!(node = %id, "suspicion expired, member declared dead");
            self.enqueue(update);
        }
        converted
    }

    /// Record that a member answered a probe
    pub fn touch(&self, node_id: &str) {
        if let Some(entry) = self.nodes.write().get_mut(node_id) {
            entry.info.last_heartbeat = Utc::now();
        }
    }

    /// Current state of a member, if known
    pub fn state_of(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.read().get(node_id).map(|e| e.info.state)
    }

    /// Incarnation a member was last asserted at, if known
    pub fn incarnation_of(&self, node_id: &str) -> Option<u64> {
        self.nodes.read().get(node_id).map(|e| e.info.incarnation)
    }

    /// Transport address of a member, if known
    pub fn addr_of(&self, node_id: &str) -> Option<SocketAddr> {
        self.nodes.read().get(node_id).map(|e| e.info.addr)
    }

    /// Ids of members currently in the alive set
    pub fn alive_members(&self) -> Vec<String> {
        self.nodes
            .read()
            .values()
            .filter(|e| e.info.state.is_alive())
            .map(|e| e.info.id.clone())
            .collect()
    }

    /// Members worth probing: alive or suspected, excluding self
    ///
    /// Recently dead members stay in the set for `dead_window` after their
    /// death sentence. Without that grace, a symmetric partition leaves
    /// both sides considering the other dead with nobody ever messaging
    /// across the healed boundary, so no refutation could happen.
    pub fn probe_candidates(&self, dead_window: Duration) -> Vec<(String, SocketAddr)> {
        self.nodes
            .read()
            .values()
            .filter(|e| {
                if e.info.id == self.local_id {
                    return false;
                }
                match e.info.state {
                    NodeState::Alive | NodeState::Suspect => true,
                    NodeState::Dead => e
                        .dead_since
                        .is_some_and(|since| since.elapsed() < dead_window),
                    NodeState::Left => false,
                }
            })
            .map(|e| (e.info.id.clone(), e.info.addr))
            .collect()
    }

    /// Full table as gossip assertions (join snapshots)
    pub fn snapshot(&self) -> Vec<GossipUpdate> {
        self.nodes
            .read()
            .values()
            .map(|e| e.info.to_update())
            .collect()
    }

    /// Our current record about a peer, when it is not plainly alive
    ///
    /// Attached to acks so a slandered or forgotten peer learns what the
    /// cluster thinks of it and can refute.
    pub fn contested_record(&self, node_id: &str) -> Option<GossipUpdate> {
        self.nodes
            .read()
            .get(node_id)
            .filter(|e| !e.info.state.is_alive())
            .map(|e| e.info.to_update())
    }

    /// Queue an assertion for dissemination, replacing any queued
    /// assertion about the same node
    pub fn enqueue(&self, update: GossipUpdate) {
        let mut queue = self.queue.lock();
        queue.retain(|queued| queued.update.node_id != update.node_id);
        queue.push(QueuedUpdate {
            update,
            transmissions: 0,
        });
    }

    /// Take up to `fanout` updates to piggyback on an outgoing message
    ///
    /// Each taken update's transmission counter advances; an update is
    /// retired once it has been emitted `max_transmissions` times (default
    /// `3 * ceil(log2(N+1))` with N the current alive count), which bounds
    /// per-message overhead while reaching the whole cluster in `O(log N)`
    /// rounds.
    pub fn take_piggyback(&self, fanout: usize) -> Vec<GossipUpdate> {
        let max_transmissions = self.max_transmissions.unwrap_or_else(|| {
            let alive = self.alive_members().len().max(1);
            3 * ((alive + 1) as f64).log2().ceil() as u32
        });

        let mut queue = self.queue.lock();
        // Freshest first, so new updates propagate before nearly-retired ones
        queue.sort_by_key(|queued| queued.transmissions);

        let mut taken = Vec::new();
        for queued in queue.iter_mut().take(fanout) {
            taken.push(queued.update.clone());
            queued.transmissions += 1;
        }
        queue.retain(|queued| queued.transmissions < max_transmissions);
        taken
    }

    fn emit_transition(&self, node_id: &str, was_alive: bool, now_alive: bool) {
        let event = match (was_alive, now_alive) {
            (false, true) => MembershipEvent::MemberUp(node_id.to_string()),
            (true, false) => MembershipEvent::MemberDown(node_id.to_string()),
            _ => return,
        };
        let _ = self.events.send(event);
    }
}

fn suspicion_clock(state: NodeState) -> Option<Instant> {
    (state == NodeState::Suspect).then(Instant::now)
}

fn death_clock(state: NodeState) -> Option<Instant> {
    (state == NodeState::Dead).then(Instant::now)
}
