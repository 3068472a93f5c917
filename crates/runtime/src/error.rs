//! Error types and submission outcomes for the durable runtime

use gridflow_journal::{FailureInfo, JournalError};

/// Error raised by workflow code or side-effect thunks
///
/// Classification drives the state machine: a retryable error leaves the
/// workflow `Running` (the next drive re-enters it), a non-retryable error
/// journals `Failed` and the workflow becomes terminal. The default
/// classification is retryable.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct WorkflowError {
    /// Human-readable description
    pub message: String,

    /// Whether the workflow should be re-driven rather than failed
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a retryable error (the default classification)
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a fatal error; the workflow will be journaled as `Failed`
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the workflow should be re-driven
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub(crate) fn failure_info(&self) -> FailureInfo {
        FailureInfo::new("non_retryable", self.message.clone())
    }
}

impl From<JournalError> for WorkflowError {
    fn from(err: JournalError) -> Self {
        // Storage trouble inside a workflow is transient from the
        // workflow's point of view; the journal remains the commit point.
        WorkflowError::retryable(format!("journal error: {err}"))
    }
}

/// Total result of a submission
///
/// Once a workflow has been accepted for local execution the caller always
/// receives one of these; there is no panic or exception path out of
/// `submit`. Serializes with a `status` tag so remote submission acks can
/// carry it verbatim.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Accepted (or already running); not yet terminal
    Pending,

    /// Terminal success with the recorded output
    Completed(serde_json::Value),

    /// Terminal failure with the recorded error
    Failed(FailureInfo),
}

/// Errors from runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Submission references a name with no registered handler
    #[error("unknown workflow name: {0}")]
    UnknownWorkflow(String),

    /// Resume of a workflow id with no journaled start
    #[error("workflow {0} has not been started")]
    NotStarted(String),

    /// Journal error that survived bounded retries before acceptance
    #[error("workflow {workflow_id} stalled after {attempts} journal attempts")]
    Stalled { workflow_id: String, attempts: u32 },

    /// Journal error outside the retried append path
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classification_is_retryable() {
        let err = WorkflowError::retryable("downstream 503");
        assert!(err.is_retryable());

        let err = WorkflowError::non_retryable("bad input");
        assert!(!err.is_retryable());
        assert_eq!(err.failure_info().kind, "non_retryable");
    }

    #[test]
    fn test_journal_errors_map_to_retryable() {
        let err: WorkflowError = JournalError::Io("disk gone".to_string()).into();
        assert!(err.is_retryable());
        assert!(err.message.contains("disk gone"));
    }
}
