//! Durable runtime: record/replay drive loop
//!
//! The runtime drives registered workflow functions against the journal.
//! Submission is idempotent per workflow id, terminal outcomes are stable,
//! and a workflow that fails retryably simply stays `Running` until the
//! next drive. The journal append is the commit point throughout: a side
//! effect happened iff its record is on disk.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use gridflow_journal::{
    JournalError, JournalEvent, JournalStore, TerminalStatus, WorkflowRecord, WorkflowStatus,
};

use crate::context::{append_with_retry, WorkflowContext};
use crate::error::{RuntimeError, SubmitOutcome, WorkflowError};
use crate::registry::{WorkflowHandler, WorkflowRegistry};
use crate::backoff::StorageRetry;

/// Durable workflow runtime
///
/// # Example
///
/// ```ignore
/// let journal: Arc<dyn JournalStore> = Arc::new(MemoryJournal::new());
/// let runtime = Runtime::new(journal);
///
/// runtime.register("double", |_ctx, n: u64| async move {
///     Ok::<_, WorkflowError>(n * 2)
/// });
///
/// let outcome = runtime.submit("double", "wf-1", json!(21)).await?;
/// assert_eq!(outcome, SubmitOutcome::Completed(json!(42)));
/// ```
pub struct Runtime {
    journal: Arc<dyn JournalStore>,
    registry: Arc<WorkflowRegistry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    storage_retry: StorageRetry,
}

impl Runtime {
    /// Create a runtime over the given journal
    pub fn new(journal: Arc<dyn JournalStore>) -> Self {
        Self {
            journal,
            registry: Arc::new(WorkflowRegistry::new()),
            locks: DashMap::new(),
            storage_retry: StorageRetry::default(),
        }
    }

    /// Override the journal-append retry policy
    pub fn with_storage_retry(mut self, retry: StorageRetry) -> Self {
        self.storage_retry = retry;
        self
    }

    /// Register a workflow function (see [`WorkflowRegistry::register`])
    pub fn register<In, Out, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        let name = name.into();
        info!(workflow_name = %name, "registered workflow");
        self.registry.register(name, handler);
    }

    /// The handler registry
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// The underlying journal
    pub fn journal(&self) -> &Arc<dyn JournalStore> {
        &self.journal
    }

    /// Status of a workflow as derived from its journal
    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowStatus, RuntimeError> {
        let events = self.journal.load(workflow_id).await?;
        Ok(WorkflowRecord::from_events(workflow_id, events).status)
    }

    /// Submit a workflow for durable execution
    ///
    /// Terminal workflows short-circuit to their recorded outcome, which
    /// makes resubmission idempotent. A workflow already being driven on
    /// this node returns `Pending` without re-entering the function.
    #[instrument(skip(self, input))]
    pub async fn submit(
        &self,
        name: &str,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<SubmitOutcome, RuntimeError> {
        if let Some(terminal) = self.journal.terminal_status(workflow_id).await? {
            debug!(%workflow_id, "workflow already terminal");
            return Ok(outcome_from_terminal(terminal));
        }

        let handler = self
            .registry
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownWorkflow(name.to_string()))?;

        let input = self.ensure_started(name, workflow_id, input).await?;
        self.drive(handler, workflow_id, input).await
    }

    /// Re-drive an accepted workflow after a crash or retryable failure
    ///
    /// The input is taken from the journaled `Started` event; the caller
    /// supplies only the registered name.
    #[instrument(skip(self))]
    pub async fn resume(
        &self,
        name: &str,
        workflow_id: &str,
    ) -> Result<SubmitOutcome, RuntimeError> {
        if let Some(terminal) = self.journal.terminal_status(workflow_id).await? {
            return Ok(outcome_from_terminal(terminal));
        }

        let handler = self
            .registry
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownWorkflow(name.to_string()))?;

        let input = self
            .started_input(workflow_id)
            .await?
            .ok_or_else(|| RuntimeError::NotStarted(workflow_id.to_string()))?;

        self.drive(handler, workflow_id, input).await
    }

    /// Ids of journaled workflows that never reached a terminal state
    pub async fn incomplete_workflows(&self) -> Result<Vec<String>, RuntimeError> {
        let mut incomplete = Vec::new();
        for workflow_id in self.journal.workflow_ids().await? {
            if self.journal.terminal_status(&workflow_id).await?.is_none() {
                incomplete.push(workflow_id);
            }
        }
        Ok(incomplete)
    }

    /// Re-drive every incomplete journaled workflow
    ///
    /// Run after a restart, once handlers are registered. Each workflow's
    /// name comes from its own `Started` event; ids whose name has no
    /// registered handler are skipped and reported untouched, so a node
    /// that only registers a subset of workflows recovers just its own.
    ///
    /// Returns `(workflow_id, outcome)` for every workflow that was
    /// re-driven.
    pub async fn recover(&self) -> Result<Vec<(String, SubmitOutcome)>, RuntimeError> {
        let mut outcomes = Vec::new();
        for workflow_id in self.incomplete_workflows().await? {
            let events = self.journal.load(&workflow_id).await?;
            let record = WorkflowRecord::from_events(&workflow_id, events);
            let Some(name) = record.workflow_name else {
                continue;
            };

            if !self.registry.contains(&name) {
                warn!(%workflow_id, workflow_name = %name, "no handler registered, skipping recovery");
                continue;
            }

            info!(%workflow_id, workflow_name = %name, "recovering incomplete workflow");
            let outcome = self.resume(&name, &workflow_id).await?;
            outcomes.push((workflow_id, outcome));
        }
        Ok(outcomes)
    }

    /// Make sure `Started` is journaled; returns the authoritative input
    ///
    /// On resubmission the originally journaled input wins over whatever
    /// the caller passed this time.
    async fn ensure_started(
        &self,
        workflow_name: &str,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, RuntimeError> {
        if let Some(existing) = self.started_input(workflow_id).await? {
            return Ok(existing);
        }

        let append = append_with_retry(
            &self.journal,
            &self.storage_retry,
            workflow_id,
            JournalEvent::Started {
                workflow_name: workflow_name.to_string(),
                input: input.clone(),
            },
        )
        .await;

        match append {
            Ok(()) => Ok(input),
            // Lost the race against a concurrent first submission; the
            // journaled input is authoritative.
            Err(JournalError::InvalidAppend(_)) => Ok(self
                .started_input(workflow_id)
                .await?
                .unwrap_or(input)),
            Err(JournalError::StorageFull | JournalError::Io(_)) => Err(RuntimeError::Stalled {
                workflow_id: workflow_id.to_string(),
                attempts: self.storage_retry.attempts,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn started_input(
        &self,
        workflow_id: &str,
    ) -> Result<Option<serde_json::Value>, RuntimeError> {
        let events = self.journal.load(workflow_id).await?;
        Ok(events.into_iter().find_map(|event| match event {
            JournalEvent::Started { input, .. } => Some(input),
            _ => None,
        }))
    }

    /// Run the workflow function once under the per-workflow advisory lock
    async fn drive(
        &self,
        handler: WorkflowHandler,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<SubmitOutcome, RuntimeError> {
        let lock = self
            .locks
            .entry(workflow_id.to_string())
            .or_default()
            .clone();

        let Ok(_guard) = lock.try_lock() else {
            debug!(%workflow_id, "workflow already being driven, refusing second drive");
            return Ok(SubmitOutcome::Pending);
        };

        let ctx = WorkflowContext::new(
            workflow_id,
            self.journal.clone(),
            self.storage_retry.clone(),
        );

        match handler(ctx, input).await {
            Ok(output) => {
                let committed = self
                    .append_terminal(workflow_id, JournalEvent::Completed { output: output.clone() })
                    .await?;
                if committed {
                    info!(%workflow_id, "workflow completed");
                    Ok(SubmitOutcome::Completed(output))
                } else {
                    Ok(SubmitOutcome::Pending)
                }
            }
            Err(err) if err.is_retryable() => {
                debug!(%workflow_id, error = %err, "retryable failure, workflow stays running");
                Ok(SubmitOutcome::Pending)
            }
            Err(err) => {
                let failure = err.failure_info();
                let committed = self
                    .append_terminal(workflow_id, JournalEvent::Failed { error: failure.clone() })
                    .await?;
                if committed {
                    warn!(%workflow_id, error = %err, "workflow failed permanently");
                    Ok(SubmitOutcome::Failed(failure))
                } else {
                    Ok(SubmitOutcome::Pending)
                }
            }
        }
    }

    /// Append a terminal event; `Ok(false)` means storage was unavailable
    /// and the workflow stays `Running` for a later drive to finish.
    async fn append_terminal(
        &self,
        workflow_id: &str,
        event: JournalEvent,
    ) -> Result<bool, RuntimeError> {
        match append_with_retry(&self.journal, &self.storage_retry, workflow_id, event).await {
            Ok(()) => Ok(true),
            Err(JournalError::StorageFull | JournalError::Io(_)) => {
                warn!(%workflow_id, "terminal append stalled, workflow stays running");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn outcome_from_terminal(terminal: TerminalStatus) -> SubmitOutcome {
    match terminal {
        TerminalStatus::Completed(output) => SubmitOutcome::Completed(output),
        TerminalStatus::Failed(error) => SubmitOutcome::Failed(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_journal::MemoryJournal;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn runtime() -> Arc<Runtime> {
        let journal: Arc<dyn JournalStore> = Arc::new(MemoryJournal::new());
        Arc::new(Runtime::new(journal))
    }

    #[tokio::test]
    async fn test_submit_completes() {
        let runtime = runtime();
        runtime.register("double", |_ctx, n: u64| async move {
            Ok::<_, WorkflowError>(n * 2)
        });

        let outcome = runtime.submit("double", "wf-1", json!(21)).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Completed(json!(42)));
        assert_eq!(
            runtime.status("wf-1").await.unwrap(),
            WorkflowStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_submit_is_idempotent() {
        let runtime = runtime();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        runtime.register("count", move |_ctx, n: u64| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, WorkflowError>(n)
            }
        });

        let first = runtime.submit("count", "wf-1", json!(7)).await.unwrap();
        let second = runtime.submit("count", "wf-1", json!(999)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, SubmitOutcome::Completed(json!(7)));
        // Terminal short-circuit: the function ran exactly once
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_workflow_name() {
        let runtime = runtime();
        let err = runtime.submit("nope", "wf-1", json!({})).await.unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownWorkflow(_)));
        // Nothing was journaled for the rejected submission
        assert_eq!(
            runtime.status("wf-1").await.unwrap(),
            WorkflowStatus::NotStarted
        );
    }

    #[tokio::test]
    async fn test_retryable_error_keeps_running() {
        let runtime = runtime();
        let attempts = Arc::new(AtomicU32::new(0));
        let shared = attempts.clone();

        runtime.register("flaky", move |_ctx, (): ()| {
            let attempts = shared.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(WorkflowError::retryable("downstream 503"))
                } else {
                    Ok::<_, WorkflowError>("done".to_string())
                }
            }
        });

        let outcome = runtime.submit("flaky", "wf-1", json!(null)).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Pending);
        assert_eq!(
            runtime.status("wf-1").await.unwrap(),
            WorkflowStatus::Running
        );

        let outcome = runtime.resume("flaky", "wf-1").await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Completed(json!("done")));
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_terminally() {
        let runtime = runtime();
        runtime.register("doomed", |_ctx, (): ()| async move {
            Err::<(), _>(WorkflowError::non_retryable("bad input"))
        });

        let outcome = runtime.submit("doomed", "wf-1", json!(null)).await.unwrap();
        match &outcome {
            SubmitOutcome::Failed(info) => assert_eq!(info.message, "bad input"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        // Terminal stability across resubmission
        let again = runtime.submit("doomed", "wf-1", json!(null)).await.unwrap();
        assert_eq!(again, outcome);
    }

    #[tokio::test]
    async fn test_concurrent_drive_is_refused() {
        let runtime = runtime();
        runtime.register("slow", |_ctx, (): ()| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, WorkflowError>("slept".to_string())
        });

        let background = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.submit("slow", "wf-1", json!(null)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = runtime.submit("slow", "wf-1", json!(null)).await.unwrap();
        assert_eq!(second, SubmitOutcome::Pending);

        let first = background.await.unwrap().unwrap();
        assert_eq!(first, SubmitOutcome::Completed(json!("slept")));
    }

    #[tokio::test]
    async fn test_incomplete_workflows_listing() {
        let runtime = runtime();
        runtime.register("quick", |_ctx, (): ()| async move {
            Ok::<_, WorkflowError>(())
        });
        runtime.register("stuck", |_ctx, (): ()| async move {
            Err::<(), _>(WorkflowError::retryable("not yet"))
        });

        runtime.submit("quick", "wf-done", json!(null)).await.unwrap();
        runtime.submit("stuck", "wf-stuck", json!(null)).await.unwrap();

        let incomplete = runtime.incomplete_workflows().await.unwrap();
        assert_eq!(incomplete, vec!["wf-stuck".to_string()]);
    }

    #[tokio::test]
    async fn test_resume_unstarted_workflow() {
        let runtime = runtime();
        runtime.register("noop", |_ctx, (): ()| async move {
            Ok::<_, WorkflowError>(())
        });

        let err = runtime.resume("noop", "wf-never").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotStarted(_)));
    }
}
