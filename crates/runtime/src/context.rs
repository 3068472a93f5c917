//! Workflow execution context
//!
//! The context is the only door between workflow code and the journal.
//! All observable non-determinism in a workflow (I/O, clocks, randomness,
//! remote calls) must go through [`WorkflowContext::side_effect`]; code
//! between side effects must be pure modulo `get_state`/`set_state`.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use gridflow_journal::{JournalError, JournalEvent, JournalStore};

use crate::backoff::StorageRetry;
use crate::error::WorkflowError;

/// Append, draining the retry schedule on storage errors
///
/// Storage errors are transient until the schedule runs dry; invariant
/// violations are never retried.
pub(crate) async fn append_with_retry(
    journal: &Arc<dyn JournalStore>,
    retry: &StorageRetry,
    workflow_id: &str,
    event: JournalEvent,
) -> Result<(), JournalError> {
    let mut delays = retry.delays();
    loop {
        let err = match journal.append(workflow_id, event.clone()).await {
            Ok(()) => return Ok(()),
            Err(err @ (JournalError::StorageFull | JournalError::Io(_))) => err,
            Err(err) => return Err(err),
        };

        let Some(delay) = delays.next() else {
            return Err(err);
        };
        warn!(%workflow_id, ?delay, error = %err, "journal append failed, backing off");
        tokio::time::sleep(delay).await;
    }
}

/// Context handed to a workflow function for one drive
///
/// Cheap to clone into side-effect thunks if needed; all methods borrow.
///
/// # Example
///
/// ```ignore
/// async fn ship_order(ctx: WorkflowContext, order: Order) -> Result<Receipt, WorkflowError> {
///     let charge: ChargeId = ctx
///         .side_effect("charge-card", || async { billing.charge(&order).await })
///         .await?;
///
///     ctx.set_state("charged", &true).await?;
///
///     let label: Label = ctx
///         .side_effect("print-label", || async { carrier.label(&order).await })
///         .await?;
///
///     Ok(Receipt { charge, label })
/// }
/// ```
#[derive(Clone)]
pub struct WorkflowContext {
    workflow_id: String,
    journal: Arc<dyn JournalStore>,
    retry: StorageRetry,
}

impl WorkflowContext {
    pub(crate) fn new(
        workflow_id: impl Into<String>,
        journal: Arc<dyn JournalStore>,
        retry: StorageRetry,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            journal,
            retry,
        }
    }

    /// The stable, caller-assigned workflow identifier
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Execute a named side-effect step durably
    ///
    /// If a result for `step_key` is already journaled the thunk is not
    /// invoked and the recorded result is returned. Otherwise the thunk
    /// runs, its result is journaled before this call returns, and every
    /// future replay observes that same result. A thunk error propagates
    /// with nothing journaled, so the step is retried on the next drive.
    ///
    /// `step_key` must be unique within the workflow; reusing a key at a
    /// semantically different point is a caller bug the runtime cannot
    /// detect.
    pub async fn side_effect<T, F, Fut>(
        &self,
        step_key: &str,
        thunk: F,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        if let Some(recorded) = self
            .journal
            .step_result(&self.workflow_id, step_key)
            .await?
        {
            debug!(workflow_id = %self.workflow_id, step_key, "replaying recorded side effect");
            return serde_json::from_value(recorded).map_err(|err| {
                WorkflowError::non_retryable(format!(
                    "recorded result for step {step_key} does not decode: {err}"
                ))
            });
        }

        let result = thunk().await?;
        let value = serde_json::to_value(&result).map_err(|err| {
            WorkflowError::non_retryable(format!("result of step {step_key} does not encode: {err}"))
        })?;

        append_with_retry(
            &self.journal,
            &self.retry,
            &self.workflow_id,
            JournalEvent::SideEffectResult {
                step_key: step_key.to_string(),
                result: value,
            },
        )
        .await?;

        Ok(result)
    }

    /// Read a named piece of persistent workflow-local state
    pub async fn get_state<T>(&self, state_key: &str) -> Result<Option<T>, WorkflowError>
    where
        T: DeserializeOwned,
    {
        match self.journal.latest_state(&self.workflow_id, state_key).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|err| {
                WorkflowError::non_retryable(format!(
                    "state {state_key} does not decode: {err}"
                ))
            }),
        }
    }

    /// Write a named piece of persistent workflow-local state
    ///
    /// Visible to subsequent `get_state` calls in the same run and to
    /// every replay.
    pub async fn set_state<T>(&self, state_key: &str, value: &T) -> Result<(), WorkflowError>
    where
        T: Serialize,
    {
        let value = serde_json::to_value(value).map_err(|err| {
            WorkflowError::non_retryable(format!("state {state_key} does not encode: {err}"))
        })?;

        append_with_retry(
            &self.journal,
            &self.retry,
            &self.workflow_id,
            JournalEvent::StateSet {
                state_key: state_key.to_string(),
                value,
            },
        )
        .await?;

        Ok(())
    }
}
