//! # Gridflow Runtime
//!
//! Durable execution engine: workflow functions run against a per-workflow
//! journal such that any crash and restart produces the same
//! externally-visible effects and the same final output.
//!
//! ## Model
//!
//! A workflow is an async function `(WorkflowContext, In) -> Result<Out, WorkflowError>`.
//! All observable non-determinism must be wrapped in
//! [`WorkflowContext::side_effect`]; on replay, recorded side-effect
//! results are returned without re-invoking their thunks, which is what
//! makes external effects at-most-once while completion stays
//! at-least-once.
//!
//! ```text
//!     NotStarted ──submit──▶ Running ──normal return──▶ Completed
//!                              │
//!                              ├──retryable error──▶ Running (next drive retries)
//!                              │
//!                              └──non-retryable error──▶ Failed
//! ```
//!
//! Completed and Failed are terminal absorbing states.

pub mod backoff;
pub mod context;
pub mod error;
pub mod registry;
pub mod runtime;

pub use backoff::StorageRetry;
pub use context::WorkflowContext;
pub use error::{RuntimeError, SubmitOutcome, WorkflowError};
pub use registry::{WorkflowHandler, WorkflowRegistry};
pub use runtime::Runtime;
