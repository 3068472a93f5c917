//! Journal events for workflow persistence

use serde::{Deserialize, Serialize};

/// Error payload recorded when a workflow fails permanently
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureInfo {
    /// Machine-readable error kind (e.g. "non_retryable", "unknown_workflow")
    pub kind: String,

    /// Human-readable message
    pub message: String,
}

impl FailureInfo {
    /// Create a new failure payload
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Events in a workflow's append-only journal
///
/// Each workflow owns an ordered event stream. The stream is used for:
/// - Persisting workflow progress
/// - Replaying workflows after a crash or restart
/// - Answering point queries (step results, latest state, terminal status)
///
/// Events are immutable once written. Invariants (enforced by the stores):
/// `Started` appears exactly once and first; at most one `SideEffectResult`
/// is ever written per `step_key`; `Completed`/`Failed` is terminal and
/// nothing is appended after it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEvent {
    /// Workflow was accepted with the given input
    Started {
        /// Registered name the workflow was submitted under; recorded so
        /// a restarted node can re-drive the workflow without being told
        /// the name again
        workflow_name: String,

        /// The input provided at first submission
        input: serde_json::Value,
    },

    /// Durable result of a named side-effect step
    SideEffectResult {
        /// Unique step identifier within the workflow
        step_key: String,

        /// Result returned by the step's thunk
        result: serde_json::Value,
    },

    /// A named piece of workflow-local state was written
    StateSet {
        /// State slot identifier
        state_key: String,

        /// New value for the slot
        value: serde_json::Value,
    },

    /// Workflow completed successfully
    Completed {
        /// The output value
        output: serde_json::Value,
    },

    /// Workflow failed with a non-retryable error
    Failed {
        /// Error details
        error: FailureInfo,
    },
}

impl JournalEvent {
    /// Get the step_key if this is a side-effect event
    pub fn step_key(&self) -> Option<&str> {
        match self {
            Self::SideEffectResult { step_key, .. } => Some(step_key),
            _ => None,
        }
    }

    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// One-byte discriminator used by the persistent backend's record framing
    pub fn kind_byte(&self) -> u8 {
        match self {
            Self::Started { .. } => 1,
            Self::SideEffectResult { .. } => 2,
            Self::StateSet { .. } => 3,
            Self::Completed { .. } => 4,
            Self::Failed { .. } => 5,
        }
    }
}

/// Terminal outcome derived from a journal
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalStatus {
    /// Workflow completed with the recorded output
    Completed(serde_json::Value),

    /// Workflow failed with the recorded error
    Failed(FailureInfo),
}

/// Current status derived from a journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// No `Started` event exists yet
    NotStarted,

    /// Accepted and not yet terminal
    Running,

    /// Completed successfully
    Completed,

    /// Failed permanently
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Materialized view of one workflow's journal
///
/// Built from a loaded event sequence; the stores themselves never hand out
/// mutable records.
#[derive(Debug, Clone)]
pub struct WorkflowRecord {
    /// Caller-assigned stable identifier
    pub workflow_id: String,

    /// Name from the `Started` event; `None` before the first event
    pub workflow_name: Option<String>,

    /// Events in append order
    pub events: Vec<JournalEvent>,

    /// Status derived from the event sequence
    pub status: WorkflowStatus,
}

impl WorkflowRecord {
    /// Derive a record from a loaded event sequence
    pub fn from_events(workflow_id: impl Into<String>, events: Vec<JournalEvent>) -> Self {
        let status = match events.last() {
            None => WorkflowStatus::NotStarted,
            Some(JournalEvent::Completed { .. }) => WorkflowStatus::Completed,
            Some(JournalEvent::Failed { .. }) => WorkflowStatus::Failed,
            Some(_) => WorkflowStatus::Running,
        };

        let workflow_name = events.iter().find_map(|event| match event {
            JournalEvent::Started { workflow_name, .. } => Some(workflow_name.clone()),
            _ => None,
        });

        Self {
            workflow_id: workflow_id.into(),
            workflow_name,
            events,
            status,
        }
    }

    /// Terminal outcome, if the workflow has reached one
    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        match self.events.last() {
            Some(JournalEvent::Completed { output }) => {
                Some(TerminalStatus::Completed(output.clone()))
            }
            Some(JournalEvent::Failed { error }) => Some(TerminalStatus::Failed(error.clone())),
            _ => None,
        }
    }
}
