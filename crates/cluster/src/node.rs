//! Cluster node facade
//!
//! Wires journal, runtime, membership, ring and gossip together behind a
//! single entry point: `submit(workflow_name, workflow_id, input)`. The
//! hash ring decides whether the submission is driven locally or
//! forwarded to its owner over the transport.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gridflow_journal::{
    FailureInfo, FileJournal, JournalError, JournalStore, MemoryJournal, WorkflowStatus,
};
use gridflow_ring::HashRing;
use gridflow_runtime::{Runtime, RuntimeError, SubmitOutcome, WorkflowContext, WorkflowError};

use crate::config::{ClusterConfig, JournalBackend};
use crate::gossip::Gossip;
use crate::member::{MembershipEvent, NodeState};
use crate::membership::MembershipTable;
use crate::transport::{Envelope, Message, Transport, TransportError};

/// Errors surfaced by cluster submission
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The hash ring is empty; retry once the cluster has formed
    #[error("no nodes in the hash ring")]
    RingEmpty,

    /// A forwarded submission was dropped or timed out; safe to retry
    #[error("transient transport failure: {0}")]
    TransientTransport(String),

    /// Local runtime error
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Transport-layer error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Journal could not be opened at startup
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// One node of the durable workflow cluster
///
/// # Example
///
/// ```ignore
/// let (transport, inbox) = UdpTransport::bind(config.bind_addr).await?;
/// let node = ClusterNode::start(config, transport, inbox).await?;
///
/// node.register("bill-order", |ctx, order: Order| async move {
///     let receipt: Receipt = ctx
///         .side_effect("charge", || async { billing.charge(&order).await })
///         .await?;
///     Ok::<_, WorkflowError>(receipt)
/// });
///
/// let outcome = node.submit("bill-order", "order-42", input).await?;
/// ```
pub struct ClusterNode {
    config: ClusterConfig,
    journal: Arc<dyn JournalStore>,
    runtime: Arc<Runtime>,
    table: Arc<MembershipTable>,
    ring: Arc<RwLock<HashRing>>,
    gossip: Arc<Gossip>,
    transport: Arc<dyn Transport>,
    pending_submits: Arc<DashMap<String, oneshot::Sender<SubmitOutcome>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterNode {
    /// Start a node over an already-bound transport
    ///
    /// Spawns the ring projection, gossip tick and dispatch tasks, then
    /// contacts the configured seeds.
    pub async fn start(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        incoming: mpsc::Receiver<Envelope>,
    ) -> Result<Arc<Self>, ClusterError> {
        let journal: Arc<dyn JournalStore> = match &config.journal_backend {
            JournalBackend::Memory => Arc::new(MemoryJournal::new()),
            JournalBackend::Persistent { path } => Arc::new(FileJournal::open(path).await?),
        };

        let runtime = Arc::new(
            Runtime::new(journal.clone()).with_storage_retry(config.storage_retry.clone()),
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let table = Arc::new(MembershipTable::new(
            config.node_id.clone(),
            transport.local_addr(),
            events_tx,
            config.max_transmissions,
        ));

        let ring = Arc::new(RwLock::new(HashRing::new(config.virtual_nodes_per_member)));
        let gossip = Gossip::new(table.clone(), transport.clone(), config.clone());
        let (shutdown, _) = watch::channel(false);

        let node = Arc::new(Self {
            config,
            journal,
            runtime,
            table,
            ring,
            gossip,
            transport,
            pending_submits: Arc::new(DashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let ring_task = node.spawn_ring_projection(events_rx);
        let gossip_task = node.gossip.spawn(node.shutdown.subscribe());
        let dispatch_task = node.clone().spawn_dispatch(incoming);
        node.tasks
            .lock()
            .extend([ring_task, gossip_task, dispatch_task]);

        info!(node_id = %node.config.node_id, addr = %node.transport.local_addr(), "cluster node started");
        node.gossip.join().await;
        Ok(node)
    }

    /// Register a workflow function under a cluster-wide name
    pub fn register<In, Out, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        self.runtime.register(name, handler);
    }

    /// Submit a workflow keyed by `workflow_id`
    ///
    /// The ring maps the id to its owner: a locally-owned workflow is
    /// driven immediately, a remote one is forwarded and the owner's ack
    /// awaited. Resubmission with the same id is idempotent either way.
    pub async fn submit(
        &self,
        workflow_name: &str,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<SubmitOutcome, ClusterError> {
        let owner = self
            .ring
            .read()
            .owner(workflow_id)
            .map(str::to_string)
            .ok_or(ClusterError::RingEmpty)?;

        if owner == self.config.node_id {
            debug!(%workflow_id, "driving locally owned workflow");
            return Ok(self.runtime.submit(workflow_name, workflow_id, input).await?);
        }

        let owner_addr = self.table.addr_of(&owner).ok_or_else(|| {
            ClusterError::TransientTransport(format!("no address for owner {owner}"))
        })?;

        debug!(%workflow_id, %owner, "forwarding submission to owner");
        let (tx, rx) = oneshot::channel();
        self.pending_submits.insert(workflow_id.to_string(), tx);

        let sent = self
            .transport
            .send(
                owner_addr,
                Message::WorkflowSubmit {
                    workflow_id: workflow_id.to_string(),
                    workflow_name: workflow_name.to_string(),
                    input,
                },
            )
            .await;

        if let Err(err) = sent {
            self.pending_submits.remove(workflow_id);
            return Err(ClusterError::TransientTransport(err.to_string()));
        }

        match tokio::time::timeout(self.config.submit_ack_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            _ => {
                self.pending_submits.remove(workflow_id);
                Err(ClusterError::TransientTransport(format!(
                    "no ack from {owner} for {workflow_id}"
                )))
            }
        }
    }

    /// Re-drive a locally journaled workflow (crash recovery)
    pub async fn resume(
        &self,
        workflow_name: &str,
        workflow_id: &str,
    ) -> Result<SubmitOutcome, ClusterError> {
        Ok(self.runtime.resume(workflow_name, workflow_id).await?)
    }

    /// Re-drive every incomplete journaled workflow on this node
    ///
    /// Call after registering handlers on a restarted node with a
    /// persistent journal.
    pub async fn recover(&self) -> Result<Vec<(String, SubmitOutcome)>, ClusterError> {
        Ok(self.runtime.recover().await?)
    }

    /// Status of a workflow as known to this node's journal
    pub async fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, ClusterError> {
        Ok(self.runtime.status(workflow_id).await?)
    }

    /// This node's identifier
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Ids currently in this node's alive set
    pub fn alive_members(&self) -> Vec<String> {
        self.table.alive_members()
    }

    /// This node's view of a member's state
    pub fn member_state(&self, node_id: &str) -> Option<NodeState> {
        self.table.state_of(node_id)
    }

    /// This node's view of a member's incarnation
    pub fn member_incarnation(&self, node_id: &str) -> Option<u64> {
        self.table.incarnation_of(node_id)
    }

    /// Members currently on this node's hash ring, sorted
    pub fn ring_members(&self) -> Vec<String> {
        let mut members: Vec<String> =
            self.ring.read().members().map(str::to_string).collect();
        members.sort();
        members
    }

    /// Owner of a key according to this node's ring
    pub fn ring_owner(&self, key: &str) -> Option<String> {
        self.ring.read().owner(key).map(str::to_string)
    }

    /// The underlying runtime
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The underlying journal
    pub fn journal(&self) -> &Arc<dyn JournalStore> {
        &self.journal
    }

    /// Stop the node: halt the gossip timer, announce `Left`, release the
    /// journal — in that order
    pub async fn shutdown(&self) {
        info!(node_id = %self.config.node_id, "shutting down");
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.gossip.leave().await;
        // The journal needs no explicit close: every append was fsynced
        // before it returned, and remaining handles drop with the node.
    }

    /// Project membership events onto the hash ring
    fn spawn_ring_projection(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<MembershipEvent>,
    ) -> JoinHandle<()> {
        let ring = self.ring.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(MembershipEvent::MemberUp(id)) => {
                            debug!(node = %id, "adding member to ring");
                            ring.write().add(id);
                        }
                        Some(MembershipEvent::MemberDown(id)) => {
                            debug!(node = %id, "removing member from ring");
                            ring.write().remove(&id);
                        }
                        None => return,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Route inbound envelopes to gossip or the workflow layer
    fn spawn_dispatch(self: Arc<Self>, mut incoming: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = incoming.recv() => match envelope {
                        Some(Envelope { from, message }) => match message {
                            Message::WorkflowSubmit {
                                workflow_id,
                                workflow_name,
                                input,
                            } => {
                                let node = self.clone();
                                tokio::spawn(async move {
                                    node.handle_remote_submit(from, workflow_id, workflow_name, input)
                                        .await;
                                });
                            }
                            Message::WorkflowSubmitAck { workflow_id, outcome } => {
                                if let Some((_, waiter)) =
                                    self.pending_submits.remove(&workflow_id)
                                {
                                    let _ = waiter.send(outcome);
                                }
                            }
                            protocol => self.gossip.handle(from, protocol).await,
                        },
                        None => return,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Drive a forwarded submission and ack the sender
    async fn handle_remote_submit(
        &self,
        from: std::net::SocketAddr,
        workflow_id: String,
        workflow_name: String,
        input: serde_json::Value,
    ) {
        let outcome = match self.runtime.submit(&workflow_name, &workflow_id, input).await {
            Ok(outcome) => outcome,
            Err(RuntimeError::UnknownWorkflow(name)) => SubmitOutcome::Failed(FailureInfo::new(
                "unknown_workflow",
                format!("no workflow registered under {name}"),
            )),
            Err(err) => {
                // Not terminal: the submitter sees a pending outcome and
                // retries against a journal that will have healed.
                warn!(%workflow_id, error = %err, "forwarded submission stalled");
                SubmitOutcome::Pending
            }
        };

        let ack = Message::WorkflowSubmitAck {
            workflow_id,
            outcome,
        };
        if let Err(err) = self.transport.send(from, ack).await {
            debug!(%from, error = %err, "submit ack dropped");
        }
    }
}
