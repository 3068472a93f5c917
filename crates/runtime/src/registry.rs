//! Workflow registry for type-erased handler dispatch
//!
//! Callers register async functions over typed inputs and outputs; the
//! registry erases the types at the serde boundary so the runtime only
//! ever moves `(name, JSON value)` pairs. Workflow names must be
//! consistent across the cluster for the same logical workflow.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::WorkflowContext;
use crate::error::WorkflowError;

/// Type-erased workflow handler: JSON in, JSON out
pub type WorkflowHandler = Arc<
    dyn Fn(WorkflowContext, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, WorkflowError>>
        + Send
        + Sync,
>;

/// Registry of workflow handlers keyed by name
///
/// # Example
///
/// ```ignore
/// let registry = WorkflowRegistry::new();
/// registry.register("greet", |ctx, name: String| async move {
///     let greeting: String = ctx
///         .side_effect("render", || async { Ok(format!("hello {name}")) })
///         .await?;
///     Ok::<_, WorkflowError>(greeting)
/// });
/// ```
pub struct WorkflowRegistry {
    handlers: RwLock<HashMap<String, WorkflowHandler>>,
}

impl WorkflowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a workflow function under a cluster-wide name
    ///
    /// The serde impls of `In` and `Out` are the codec pair: input blobs
    /// decode to `In` before the function runs, outputs encode from `Out`
    /// after it returns. Registering the same name again replaces the
    /// handler.
    pub fn register<In, Out, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: WorkflowHandler = Arc::new(move |ctx, input| {
            let handler = handler.clone();
            Box::pin(async move {
                let typed: In = serde_json::from_value(input).map_err(|err| {
                    WorkflowError::non_retryable(format!("workflow input does not decode: {err}"))
                })?;

                let output = handler(ctx, typed).await?;

                serde_json::to_value(&output).map_err(|err| {
                    WorkflowError::non_retryable(format!("workflow output does not encode: {err}"))
                })
            })
        });

        self.handlers.write().insert(name.into(), erased);
    }

    /// Look up a handler by name
    pub fn get(&self, name: &str) -> Option<WorkflowHandler> {
        self.handlers.read().get(name).cloned()
    }

    /// Whether a handler is registered under the name
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Registered workflow names
    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Number of registered workflows
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("names", &self.names())
            .finish()
    }
}
