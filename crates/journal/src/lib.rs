//! # Gridflow Journal
//!
//! Durable, ordered, append-only journal of per-workflow events. The
//! journal is the commit point for the durable runtime: a side effect is
//! observable exactly when its `SideEffectResult` record has been appended.
//!
//! Two backends share one contract:
//!
//! - [`MemoryJournal`] — in-process, for tests and durability-free nodes
//! - [`FileJournal`] — one crash-safe record stream per workflow, fsynced
//!   on append, with torn-tail truncation on open
//!
//! Cross-workflow ordering is unspecified; appends are linearizable per
//! workflow id.

pub mod event;
pub mod file;
pub mod memory;
pub mod store;

pub use event::{FailureInfo, JournalEvent, TerminalStatus, WorkflowRecord, WorkflowStatus};
pub use file::FileJournal;
pub use memory::MemoryJournal;
pub use store::{JournalError, JournalStore};
