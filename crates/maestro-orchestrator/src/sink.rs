use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Result of the action a [`LogRecord`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Started,
    Success,
    Failure,
    Cached,
}

/// One line of the durable orchestration log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub task_id: String,
    pub role: String,
    pub action: String,
    pub status: LogStatus,
    pub metadata: Value,
    pub error: Option<String>,
}

impl LogRecord {
    pub fn new(
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        role: impl Into<String>,
        action: impl Into<String>,
        status: LogStatus,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
            role: role.into(),
            action: action.into(),
            status,
            metadata: Value::Object(Default::default()),
            error: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A piece of semantic context produced by a task (e.g. its output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub task_id: String,
    pub context_type: String,
    pub content: Value,
    pub metadata: Value,
}

/// Durable append-only log plus optional context store.
///
/// Failures are reported to the caller, which logs them and carries on: a
/// sink never aborts task execution.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn append_log(&self, record: LogRecord) -> MaestroResult<()>;

    async fn store_context(&self, record: ContextRecord) -> MaestroResult<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn append_log(&self, _record: LogRecord) -> MaestroResult<()> {
        Ok(())
    }

    async fn store_context(&self, _record: ContextRecord) -> MaestroResult<()> {
        Ok(())
    }
}

/// Keeps records in memory for inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    logs: Mutex<Vec<LogRecord>>,
    contexts: Mutex<Vec<ContextRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.logs.lock().clone()
    }

    pub fn contexts(&self) -> Vec<ContextRecord> {
        self.contexts.lock().clone()
    }

    /// Log records for one task, oldest first.
    pub fn logs_for(&self, task_id: &str) -> Vec<LogRecord> {
        self.logs
            .lock()
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn append_log(&self, record: LogRecord) -> MaestroResult<()> {
        self.logs.lock().push(record);
        Ok(())
    }

    async fn store_context(&self, record: ContextRecord) -> MaestroResult<()> {
        self.contexts.lock().push(record);
        Ok(())
    }
}

/// Line format of [`JsonlSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkEntry {
    Log(LogRecord),
    Context(ContextRecord),
}

/// Append-only JSONL file sink.
///
/// Records go through an unbounded channel to a background writer task, so
/// callers never wait on disk I/O.
pub struct JsonlSink {
    path: PathBuf,
    tx: Mutex<Option<mpsc::UnboundedSender<SinkEntry>>>,
    writer: Mutex<Option<JoinHandle<MaestroResult<()>>>>,
}

impl JsonlSink {
    /// File name used inside the log directory.
    pub const FILE_NAME: &'static str = "orchestration.jsonl";

    /// Spawn the writer for `log_dir/orchestration.jsonl`. Must be called within a tokio runtime.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let log_dir = log_dir.into();
        let path = log_dir.join(Self::FILE_NAME);
        let (tx, mut rx) = mpsc::unbounded_channel::<SinkEntry>();

        let file_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::fs::create_dir_all(&log_dir).await?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .await?;

            while let Some(entry) = rx.recv().await {
                let mut line = match serde_json::to_string(&entry) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Dropping unserializable sink entry");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(path = %file_path.display(), error = %e, "Sink write failed");
                }
            }
            file.flush().await?;
            Ok::<(), MaestroError>(())
        });

        info!(path = %path.display(), "JSONL sink started");
        Self {
            path,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn send(&self, entry: SinkEntry) -> MaestroResult<()> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(MaestroError::Sink("sink is closed".into()));
        };
        tx.send(entry)
            .map_err(|_| MaestroError::Sink("sink writer stopped".into()))
    }

    /// Stop accepting records and wait until everything queued is on disk.
    pub async fn close(&self) -> MaestroResult<()> {
        self.tx.lock().take();
        let writer = self.writer.lock().take();
        match writer {
            Some(handle) => handle
                .await
                .map_err(|e| MaestroError::Sink(format!("sink writer panicked: {e}")))?,
            None => Ok(()),
        }
    }

    /// Read every entry back from a JSONL file.
    pub async fn read_entries(path: impl AsRef<Path>) -> MaestroResult<Vec<SinkEntry>> {
        let content = tokio::fs::read_to_string(path).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(MaestroError::from))
            .collect()
    }
}

#[async_trait]
impl Sink for JsonlSink {
    async fn append_log(&self, record: LogRecord) -> MaestroResult<()> {
        self.send(SinkEntry::Log(record))
    }

    async fn store_context(&self, record: ContextRecord) -> MaestroResult<()> {
        self.send(SinkEntry::Context(record))
    }
}
