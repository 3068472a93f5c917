//! Persistent file-backed implementation of JournalStore
//!
//! One record stream per workflow, stored as `<dir>/<hex(workflow_id)>.wal`.
//! Record framing: `[u32 LE length][u8 kind][payload][u32 LE crc32]` where
//! `length` counts the kind byte plus the payload, and the crc covers the
//! same bytes. A short tail is truncated on open (crash mid-append); a crc
//! mismatch on a complete record is surfaced as corruption.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::event::{JournalEvent, TerminalStatus};
use crate::store::{validate_append, JournalError, JournalStore};

/// Bytes of framing around each record payload: length prefix, kind, crc
const HEADER_LEN: usize = 4;
const TRAILER_LEN: usize = 4;

/// Hydrated state for one workflow's stream
#[derive(Default)]
struct StreamState {
    hydrated: bool,
    events: Vec<JournalEvent>,
    steps: HashMap<String, serde_json::Value>,
    state: HashMap<String, serde_json::Value>,
    terminal: Option<TerminalStatus>,
}

impl StreamState {
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

/// File-backed journal store
///
/// Appends are durable before returning (`sync_data`). Each workflow's
/// stream is guarded by its own async mutex, which linearizes appends per
/// workflow id without serializing unrelated workflows against each other.
///
/// # Example
///
/// ```ignore
/// let journal = FileJournal::open("/var/lib/gridflow/journal").await?;
/// ```
pub struct FileJournal {
    dir: PathBuf,
    streams: RwLock<HashMap<String, Arc<Mutex<StreamState>>>>,
}

impl FileJournal {
    /// Open a journal rooted at the given directory, creating it if needed
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        Ok(Self {
            dir,
            streams: RwLock::new(HashMap::new()),
        })
    }

    fn stream_path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{}.wal", hex::encode(workflow_id)))
    }

    fn stream_handle(&self, workflow_id: &str) -> Arc<Mutex<StreamState>> {
        if let Some(handle) = self.streams.read().get(workflow_id) {
            return handle.clone();
        }

        let mut streams = self.streams.write();
        streams
            .entry(workflow_id.to_string())
            .or_default()
            .clone()
    }

    /// Load the stream from disk into memory, truncating a torn tail
    async fn hydrate(
        &self,
        workflow_id: &str,
        state: &mut StreamState,
    ) -> Result<(), JournalError> {
        if state.hydrated {
            return Ok(());
        }

        let path = self.stream_path(workflow_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                state.hydrated = true;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let (events, valid_len) = decode_stream(&data)?;
        if valid_len < data.len() {
            warn!(
                %workflow_id,
                dropped = data.len() - valid_len,
                "truncating torn record at journal tail"
            );
            let file = OpenOptions::new().write(true).open(&path).await?;
            file.set_len(valid_len as u64).await?;
            file.sync_data().await?;
        }

        for event in events {
            state.apply(event);
        }
        state.hydrated = true;
        debug!(%workflow_id, events = state.events.len(), "hydrated journal stream");
        Ok(())
    }

    async fn write_record(&self, workflow_id: &str, event: &JournalEvent) -> Result<(), JournalError> {
        let record = encode_record(event)?;
        let path = self.stream_path(workflow_id);

        let mut file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&record).await?;
        file.sync_data().await?;
        Ok(())
    }
}

/// Encode one event as a framed record
fn encode_record(event: &JournalEvent) -> Result<Vec<u8>, JournalError> {
    let payload = serde_json::to_vec(event)?;
    let length = (1 + payload.len()) as u32;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[event.kind_byte()]);
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut record = Vec::with_capacity(HEADER_LEN + 1 + payload.len() + TRAILER_LEN);
    record.extend_from_slice(&length.to_le_bytes());
    record.push(event.kind_byte());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&crc.to_le_bytes());
    Ok(record)
}

/// Decode a stream, returning the events and the length of the valid prefix
///
/// A record cut short by a crash terminates the scan; everything before it
/// is kept. A complete record whose crc does not match is corruption.
fn decode_stream(data: &[u8]) -> Result<(Vec<JournalEvent>, usize), JournalError> {
    let mut events = Vec::new();
    let mut pos = 0usize;

    loop {
        let record_start = pos;
        if pos + HEADER_LEN > data.len() {
            return Ok((events, record_start));
        }

        let length =
            u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        pos += HEADER_LEN;

        if length == 0 || pos + length + TRAILER_LEN > data.len() {
            return Ok((events, record_start));
        }

        let body = &data[pos..pos + length];
        pos += length;
        let expected_crc =
            u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        pos += TRAILER_LEN;

        if crc32fast::hash(body) != expected_crc {
            return Err(JournalError::Corrupted(format!(
                "crc mismatch in record {} at offset {record_start}",
                events.len()
            )));
        }

        let kind = body[0];
        let event: JournalEvent = serde_json::from_slice(&body[1..])?;
        if event.kind_byte() != kind {
            return Err(JournalError::Corrupted(format!(
                "kind byte {kind} does not match payload in record {}",
                events.len()
            )));
        }

        events.push(event);
    }
}

#[async_trait]
impl JournalStore for FileJournal {
    async fn append(&self, workflow_id: &str, event: JournalEvent) -> Result<(), JournalError> {
        let handle = self.stream_handle(workflow_id);
        let mut state = handle.lock().await;
        self.hydrate(workflow_id, &mut state).await?;

        validate_append(
            !state.events.is_empty(),
            state.terminal.is_some(),
            |key| state.steps.contains_key(key),
            &event,
        )?;

        // Disk is the commit point; the index only advances after the write
        self.write_record(workflow_id, &event).await?;
        state.apply(event);
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Vec<JournalEvent>, JournalError> {
        let handle = self.stream_handle(workflow_id);
        let mut state = handle.lock().await;
        self.hydrate(workflow_id, &mut state).await?;
        Ok(state.events.clone())
    }

    async fn latest_state(
        &self,
        workflow_id: &str,
        state_key: &str,
    ) -> Result<Option<serde_json::Value>, JournalError> {
        let handle = self.stream_handle(workflow_id);
        let mut state = handle.lock().await;
        self.hydrate(workflow_id, &mut state).await?;
        Ok(state.state.get(state_key).cloned())
    }

    async fn step_result(
        &self,
        workflow_id: &str,
        step_key: &str,
    ) -> Result<Option<serde_json::Value>, JournalError> {
        let handle = self.stream_handle(workflow_id);
        let mut state = handle.lock().await;
        self.hydrate(workflow_id, &mut state).await?;
        Ok(state.steps.get(step_key).cloned())
    }

    async fn terminal_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<TerminalStatus>, JournalError> {
        let handle = self.stream_handle(workflow_id);
        let mut state = handle.lock().await;
        self.hydrate(workflow_id, &mut state).await?;
        Ok(state.terminal.clone())
    }

    async fn workflow_ids(&self) -> Result<Vec<String>, JournalError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".wal")) else {
                continue;
            };
            match hex::decode(stem).map(String::from_utf8) {
                Ok(Ok(id)) => ids.push(id),
                _ => debug!(file = ?name, "skipping foreign file in journal directory"),
            }
        }
        Ok(ids)
    }
}
