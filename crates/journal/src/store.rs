//! JournalStore trait definition

use async_trait::async_trait;

use crate::event::{JournalEvent, TerminalStatus};

/// Error type for journal operations
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Backing storage is out of space
    #[error("storage full")]
    StorageFull,

    /// I/O failure talking to the backing storage
    #[error("journal i/o failure: {0}")]
    Io(String),

    /// A persisted record failed validation on read
    #[error("journal corrupted: {0}")]
    Corrupted(String),

    /// Append would violate a journal invariant
    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// Event could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for JournalError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            JournalError::StorageFull
        } else {
            JournalError::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(err: serde_json::Error) -> Self {
        JournalError::Serialization(err.to_string())
    }
}

/// Durable, ordered, append-only store of per-workflow journal events
///
/// Implementations must be thread-safe and support concurrent access;
/// appends are linearizable per workflow id, cross-workflow ordering is
/// unspecified. A successful `append` implies the event is visible to the
/// next `load` of the same workflow, even across a crash (modulo declared
/// in-memory backends).
#[async_trait]
pub trait JournalStore: Send + Sync + 'static {
    /// Atomically append one event to a workflow's journal
    ///
    /// Enforces the journal invariants: the first event must be `Started`
    /// and `Started` never recurs; at most one `SideEffectResult` per
    /// `step_key`; nothing follows a terminal event.
    async fn append(&self, workflow_id: &str, event: JournalEvent) -> Result<(), JournalError>;

    /// Load all events for a workflow in append order
    ///
    /// Returns an empty vec for an unknown workflow.
    async fn load(&self, workflow_id: &str) -> Result<Vec<JournalEvent>, JournalError>;

    /// Latest value written for a named state slot
    async fn latest_state(
        &self,
        workflow_id: &str,
        state_key: &str,
    ) -> Result<Option<serde_json::Value>, JournalError>;

    /// Recorded result of a named side-effect step
    async fn step_result(
        &self,
        workflow_id: &str,
        step_key: &str,
    ) -> Result<Option<serde_json::Value>, JournalError>;

    /// Terminal outcome, if one has been journaled
    async fn terminal_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<TerminalStatus>, JournalError>;

    /// Ids of every workflow with at least one journaled event
    ///
    /// Order is unspecified. Used by crash recovery to find workflows
    /// that were accepted but never reached a terminal state.
    async fn workflow_ids(&self) -> Result<Vec<String>, JournalError>;
}

/// Validate an append against the events already present
///
/// Shared by the backends so both enforce identical invariants.
pub(crate) fn validate_append(
    started: bool,
    terminal: bool,
    has_step: impl Fn(&str) -> bool,
    event: &JournalEvent,
) -> Result<(), JournalError> {
    if terminal {
        return Err(JournalError::InvalidAppend(
            "journal is terminal, nothing may follow".to_string(),
        ));
    }

    match event {
        JournalEvent::Started { .. } if started => Err(JournalError::InvalidAppend(
            "started event already present".to_string(),
        )),
        JournalEvent::Started { .. } => Ok(()),
        _ if !started => Err(JournalError::InvalidAppend(
            "first event must be started".to_string(),
        )),
        JournalEvent::SideEffectResult { step_key, .. } if has_step(step_key) => {
            Err(JournalError::InvalidAppend(format!(
                "side effect result already recorded for step {step_key}"
            )))
        }
        _ => Ok(()),
    }
}
