//! SWIM-style failure detector and update disseminator
//!
//! Each protocol tick probes one member of a shuffled rotation. A missed
//! direct ack escalates to indirect probes through `k` relays; a missed
//! indirect ack marks the target suspect at its last-known incarnation,
//! and an unrefuted suspicion expires to dead. Every outgoing message
//! piggybacks a bounded batch of membership updates.
//!
//! Protocol errors are logged at debug and suppressed; the protocol is
//! self-healing through repetition.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::member::{GossipUpdate, NodeState};
use crate::membership::{MembershipTable, MergeOutcome};
use crate::transport::{Message, Transport};

/// Gossip protocol driver over a shared membership table
pub struct Gossip {
    table: Arc<MembershipTable>,
    transport: Arc<dyn Transport>,
    config: ClusterConfig,
    pending_acks: DashMap<String, Vec<oneshot::Sender<()>>>,
    probe_rotation: Mutex<Vec<(String, SocketAddr)>>,
}

impl Gossip {
    /// Create a driver; call [`Gossip::spawn`] to start the tick loop
    pub fn new(
        table: Arc<MembershipTable>,
        transport: Arc<dyn Transport>,
        config: ClusterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            table,
            transport,
            config,
            pending_acks: DashMap::new(),
            probe_rotation: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the protocol tick loop; it stops when `shutdown` turns true
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let gossip = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(gossip.config.gossip_tick_period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => gossip.tick().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("gossip tick loop stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Contact the configured seeds to learn the initial membership
    pub async fn join(&self) {
        let join = Message::Join {
            from_id: self.table.local_id().to_string(),
            from_addr: self.table.local_addr(),
            incarnation: self.table.local_incarnation(),
        };

        for seed in &self.config.seeds {
            if *seed == self.table.local_addr() {
                continue;
            }
            info!(%seed, "joining via seed");
            self.send_quiet(*seed, join.clone()).await;
        }
    }

    /// Broadcast a graceful departure at the current incarnation
    pub async fn leave(&self) {
        let update = GossipUpdate {
            node_id: self.table.local_id().to_string(),
            addr: self.table.local_addr(),
            state: NodeState::Left,
            incarnation: self.table.local_incarnation(),
        };

        info!(incarnation = update.incarnation, "announcing graceful leave");
        for (_, addr) in self.table.probe_candidates(Duration::ZERO) {
            self.send_quiet(
                addr,
                Message::Gossip {
                    from_id: self.table.local_id().to_string(),
                    updates: vec![update.clone()],
                },
            )
            .await;
        }
    }

    /// One protocol tick: expire suspicions, then probe the next member
    async fn tick(&self) {
        for dead in self.table.expire_suspects(self.config.suspect_timeout) {
            debug!(node = %dead, "dissemination of death sentence queued");
        }

        let Some((target_id, target_addr)) = self.next_probe_target() else {
            return;
        };
        self.probe(target_id, target_addr).await;
    }

    /// Round-robin over a shuffled view of the probe candidates
    ///
    /// Recently dead members stay in the rotation for the dead-gossip
    /// window so a healed partition can be told what the cluster thinks
    /// of it and refute.
    fn next_probe_target(&self) -> Option<(String, SocketAddr)> {
        let mut rotation = self.probe_rotation.lock();
        if rotation.is_empty() {
            *rotation = self.table.probe_candidates(self.config.dead_gossip_window);
            rotation.shuffle(&mut rand::thread_rng());
        }
        rotation.pop()
    }

    /// Probe one member: direct ping, then indirect, then suspicion
    async fn probe(&self, target_id: String, target_addr: SocketAddr) {
        let mut updates = self.piggyback();
        // A suspected or buried target gets told so in the ping itself,
        // giving it the chance to refute.
        if let Some(contested) = self.table.contested_record(&target_id) {
            updates.push(contested);
        }

        let ack = self.register_ack_waiter(&target_id);
        self.send_quiet(
            target_addr,
            Message::Ping {
                from_id: self.table.local_id().to_string(),
                from_incarnation: self.table.local_incarnation(),
                updates,
            },
        )
        .await;

        if tokio::time::timeout(self.config.direct_ping_timeout, ack)
            .await
            .is_ok()
        {
            self.table.touch(&target_id);
            return;
        }

        // Ask k other members to probe on our behalf before concluding
        // anything; the target may be fine and the path to us lossy.
        let relays = self.pick_relays(&target_id);
        if !relays.is_empty() {
            let ack = self.register_ack_waiter(&target_id);
            for relay_addr in relays {
                self.send_quiet(
                    relay_addr,
                    Message::PingReq {
                        from_id: self.table.local_id().to_string(),
                        target_id: target_id.clone(),
                        target_addr,
                        updates: self.piggyback(),
                    },
                )
                .await;
            }

            if tokio::time::timeout(self.config.indirect_ping_timeout, ack)
                .await
                .is_ok()
            {
                self.table.touch(&target_id);
                return;
            }
        }

        debug!(node = %target_id, "no direct or indirect ack");
        self.table.suspect(&target_id);
    }

    fn pick_relays(&self, target_id: &str) -> Vec<SocketAddr> {
        let candidates: Vec<SocketAddr> = self
            .table
            .probe_candidates(self.config.dead_gossip_window)
            .into_iter()
            .filter(|(id, _)| id != target_id)
            .map(|(_, addr)| addr)
            .collect();

        candidates
            .choose_multiple(&mut rand::thread_rng(), self.config.indirect_probe_count)
            .copied()
            .collect()
    }

    /// Handle one inbound protocol message
    pub async fn handle(self: &Arc<Self>, from: SocketAddr, message: Message) {
        match message {
            Message::Ping {
                from_id,
                from_incarnation,
                updates,
            } => {
                self.merge_updates(updates).await;
                // The ping itself proves the sender is alive at its
                // advertised incarnation.
                self.merge_updates(vec![GossipUpdate {
                    node_id: from_id.clone(),
                    addr: from,
                    state: NodeState::Alive,
                    incarnation: from_incarnation,
                }])
                .await;

                let mut updates = self.piggyback();
                // Tell a peer we do not consider alive what we think of
                // it, so it can refute instead of staying a ghost.
                if let Some(contested) = self.table.contested_record(&from_id) {
                    updates.push(contested);
                }

                self.send_quiet(
                    from,
                    Message::Ack {
                        from_id: self.table.local_id().to_string(),
                        updates,
                    },
                )
                .await;
            }

            Message::PingReq {
                from_id,
                target_id,
                target_addr,
                updates,
            } => {
                self.merge_updates(updates).await;
                debug!(origin = %from_id, target = %target_id, "relaying indirect ping");
                let gossip = self.clone();
                tokio::spawn(async move {
                    gossip.relay_ping(from, target_id, target_addr).await;
                });
            }

            Message::Ack { from_id, updates } => {
                self.merge_updates(updates).await;
                self.table.touch(&from_id);
                self.complete_ack(&from_id);
            }

            Message::Gossip { updates, .. } => {
                self.merge_updates(updates).await;
            }

            Message::Join {
                from_id,
                from_addr,
                incarnation,
            } => {
                info!(node = %from_id, addr = %from_addr, "member joining");
                self.merge_updates(vec![GossipUpdate {
                    node_id: from_id,
                    addr: from_addr,
                    state: NodeState::Alive,
                    incarnation,
                }])
                .await;

                self.send_quiet(
                    from_addr,
                    Message::JoinResponse {
                        snapshot: self.table.snapshot(),
                        updates: self.piggyback(),
                    },
                )
                .await;
            }

            Message::JoinResponse { snapshot, updates } => {
                self.merge_updates(snapshot).await;
                self.merge_updates(updates).await;
            }

            // Workflow traffic is routed by the node facade, not here
            Message::WorkflowSubmit { .. } | Message::WorkflowSubmitAck { .. } => {
                debug!("workflow message reached gossip handler, ignoring");
            }
        }
    }

    /// Relay one ping on behalf of `origin` and forward the ack
    async fn relay_ping(&self, origin: SocketAddr, target_id: String, target_addr: SocketAddr) {
        let ack = self.register_ack_waiter(&target_id);
        self.send_quiet(
            target_addr,
            Message::Ping {
                from_id: self.table.local_id().to_string(),
                from_incarnation: self.table.local_incarnation(),
                updates: self.piggyback(),
            },
        )
        .await;

        if tokio::time::timeout(self.config.direct_ping_timeout, ack)
            .await
            .is_ok()
        {
            // Answer on the target's behalf so the origin's waiter keyed
            // by the target id completes.
            self.send_quiet(
                origin,
                Message::Ack {
                    from_id: target_id,
                    updates: self.piggyback(),
                },
            )
            .await;
        }
    }

    /// Merge a batch of updates; a refutation is blasted out immediately
    async fn merge_updates(&self, updates: Vec<GossipUpdate>) {
        let mut refuted = false;
        for update in updates {
            refuted |= self.table.merge(update) == MergeOutcome::Refuted;
        }

        if refuted {
            let alive = Message::Gossip {
                from_id: self.table.local_id().to_string(),
                updates: vec![self.table.local_update()],
            };
            for relay_addr in self.pick_relays(self.table.local_id()) {
                self.send_quiet(relay_addr, alive.clone()).await;
            }
        }
    }

    fn piggyback(&self) -> Vec<GossipUpdate> {
        self.table.take_piggyback(self.config.gossip_update_fanout)
    }

    fn register_ack_waiter(&self, node_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.pending_acks.entry(node_id.to_string()).or_default();
        waiters.retain(|waiter| !waiter.is_closed());
        waiters.push(tx);
        rx
    }

    /// One ack proves liveness for every open probe of that node
    fn complete_ack(&self, node_id: &str) {
        if let Some((_, waiters)) = self.pending_acks.remove(node_id) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    async fn send_quiet(&self, to: SocketAddr, message: Message) {
        if let Err(err) = self.transport.send(to, message).await {
            debug!(%to, error = %err, "protocol send failed");
        }
    }
}
