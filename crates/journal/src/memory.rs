//! In-memory implementation of JournalStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::event::{JournalEvent, TerminalStatus};
use crate::store::{validate_append, JournalError, JournalStore};

/// Internal per-workflow state with point-query indexes
#[derive(Default)]
struct WorkflowEntry {
    events: Vec<JournalEvent>,
    steps: HashMap<String, serde_json::Value>,
    state: HashMap<String, serde_json::Value>,
    terminal: Option<TerminalStatus>,
}

impl WorkflowEntry {
    fn apply(&mut self, event: JournalEvent) {
        match &event {
            JournalEvent::SideEffectResult { step_key, result } => {
                self.steps.insert(step_key.clone(), result.clone());
            }
            JournalEvent::StateSet { state_key, value } => {
                self.state.insert(state_key.clone(), value.clone());
            }
            JournalEvent::Completed { output } => {
                self.terminal = Some(TerminalStatus::Completed(output.clone()));
            }
            JournalEvent::Failed { error } => {
                self.terminal = Some(TerminalStatus::Failed(error.clone()));
            }
            JournalEvent::Started { .. } => {}
        }
        self.events.push(event);
    }
}

/// In-memory implementation of JournalStore
///
/// Primarily for tests and for nodes that opt out of durability. Provides
/// the same contract as the persistent backend modulo durability across
/// process restarts.
///
/// # Example
///
/// ```
/// use gridflow_journal::MemoryJournal;
///
/// let journal = MemoryJournal::new();
/// ```
pub struct MemoryJournal {
    workflows: RwLock<HashMap<String, WorkflowEntry>>,
}

impl MemoryJournal {
    /// Create a new in-memory journal
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Number of workflows with at least one event
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JournalStore for MemoryJournal {
    async fn append(&self, workflow_id: &str, event: JournalEvent) -> Result<(), JournalError> {
        let mut workflows = self.workflows.write();
        let entry = workflows.entry(workflow_id.to_string()).or_default();

        validate_append(
            !entry.events.is_empty(),
            entry.terminal.is_some(),
            |key| entry.steps.contains_key(key),
            &event,
        )?;

        entry.apply(event);
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Vec<JournalEvent>, JournalError> {
        let workflows = self.workflows.read();
        Ok(workflows
            .get(workflow_id)
            .map(|e| e.events.clone())
            .unwrap_or_default())
    }

    async fn latest_state(
        &self,
        workflow_id: &str,
        state_key: &str,
    ) -> Result<Option<serde_json::Value>, JournalError> {
        let workflows = self.workflows.read();
        Ok(workflows
            .get(workflow_id)
            .and_then(|e| e.state.get(state_key).cloned()))
    }

    async fn step_result(
        &self,
        workflow_id: &str,
        step_key: &str,
    ) -> Result<Option<serde_json::Value>, JournalError> {
        let workflows = self.workflows.read();
        Ok(workflows
            .get(workflow_id)
            .and_then(|e| e.steps.get(step_key).cloned()))
    }

    async fn terminal_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<TerminalStatus>, JournalError> {
        let workflows = self.workflows.read();
        Ok(workflows.get(workflow_id).and_then(|e| e.terminal.clone()))
    }

    async fn workflow_ids(&self) -> Result<Vec<String>, JournalError> {
        let workflows = self.workflows.read();
        Ok(workflows
            .iter()
            .filter(|(_, entry)| !entry.events.is_empty())
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FailureInfo;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_load() {
        let journal = MemoryJournal::new();

        journal
            .append(
                "wf-1",
                JournalEvent::Started {
                    workflow_name: "demo".to_string(),
                    input: json!({"n": 3}),
                },
            )
            .await
            .unwrap();
        journal
            .append(
                "wf-1",
                JournalEvent::SideEffectResult {
                    step_key: "step-1".to_string(),
                    result: json!("a"),
                },
            )
            .await
            .unwrap();

        let events = journal.load("wf-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], JournalEvent::Started { .. }));

        // Unknown workflow loads empty
        assert!(journal.load("wf-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_point_queries() {
        let journal = MemoryJournal::new();

        journal
            .append(
                "wf-1",
                JournalEvent::Started {
                    workflow_name: "demo".to_string(),
                    input: json!({}),
                },
            )
            .await
            .unwrap();
        journal
            .append(
                "wf-1",
                JournalEvent::StateSet {
                    state_key: "counter".to_string(),
                    value: json!(1),
                },
            )
            .await
            .unwrap();
        journal
            .append(
                "wf-1",
                JournalEvent::StateSet {
                    state_key: "counter".to_string(),
                    value: json!(2),
                },
            )
            .await
            .unwrap();
        journal
            .append(
                "wf-1",
                JournalEvent::SideEffectResult {
                    step_key: "fetch".to_string(),
                    result: json!({"status": 200}),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            journal.latest_state("wf-1", "counter").await.unwrap(),
            Some(json!(2))
        );
        assert_eq!(journal.latest_state("wf-1", "other").await.unwrap(), None);
        assert_eq!(
            journal.step_result("wf-1", "fetch").await.unwrap(),
            Some(json!({"status": 200}))
        );
        assert_eq!(journal.terminal_status("wf-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_terminal_status_and_absorption() {
        let journal = MemoryJournal::new();

        journal
            .append(
                "wf-1",
                JournalEvent::Started {
                    workflow_name: "demo".to_string(),
                    input: json!({}),
                },
            )
            .await
            .unwrap();
        journal
            .append("wf-1", JournalEvent::Completed { output: json!("done") })
            .await
            .unwrap();

        assert_eq!(
            journal.terminal_status("wf-1").await.unwrap(),
            Some(TerminalStatus::Completed(json!("done")))
        );

        let err = journal
            .append(
                "wf-1",
                JournalEvent::StateSet {
                    state_key: "x".to_string(),
                    value: json!(1),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::InvalidAppend(_)));
    }

    #[tokio::test]
    async fn test_failed_terminal() {
        let journal = MemoryJournal::new();

        journal
            .append(
                "wf-1",
                JournalEvent::Started {
                    workflow_name: "demo".to_string(),
                    input: json!({}),
                },
            )
            .await
            .unwrap();
        journal
            .append(
                "wf-1",
                JournalEvent::Failed {
                    error: FailureInfo::new("non_retryable", "bad input"),
                },
            )
            .await
            .unwrap();

        match journal.terminal_status("wf-1").await.unwrap() {
            Some(TerminalStatus::Failed(info)) => assert_eq!(info.kind, "non_retryable"),
            other => panic!("unexpected terminal status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_is_monotonic() {
        let journal = MemoryJournal::new();
        journal
            .append(
                "wf-1",
                JournalEvent::Started {
                    workflow_name: "demo".to_string(),
                    input: json!({}),
                },
            )
            .await
            .unwrap();

        let mut previous = journal.load("wf-1").await.unwrap();
        for i in 0..5 {
            journal
                .append(
                    "wf-1",
                    JournalEvent::StateSet {
                        state_key: "i".to_string(),
                        value: json!(i),
                    },
                )
                .await
                .unwrap();

            // Every earlier load is a prefix of every later one
            let current = journal.load("wf-1").await.unwrap();
            assert_eq!(&current[..previous.len()], previous.as_slice());
            previous = current;
        }
    }

    #[tokio::test]
    async fn test_workflow_ids() {
        let journal = MemoryJournal::new();
        assert!(journal.workflow_ids().await.unwrap().is_empty());

        for id in ["wf-1", "wf-2"] {
            journal
                .append(
                    id,
                    JournalEvent::Started {
                        workflow_name: "demo".to_string(),
                        input: json!({}),
                    },
                )
                .await
                .unwrap();
        }

        let mut ids = journal.workflow_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["wf-1".to_string(), "wf-2".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_step_rejected() {
        let journal = MemoryJournal::new();

        journal
            .append(
                "wf-1",
                JournalEvent::Started {
                    workflow_name: "demo".to_string(),
                    input: json!({}),
                },
            )
            .await
            .unwrap();
        journal
            .append(
                "wf-1",
                JournalEvent::SideEffectResult {
                    step_key: "s".to_string(),
                    result: json!(1),
                },
            )
            .await
            .unwrap();

        let err = journal
            .append(
                "wf-1",
                JournalEvent::SideEffectResult {
                    step_key: "s".to_string(),
                    result: json!(2),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::InvalidAppend(_)));
    }
}
