// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Audit Log Implementations
//!
//! | Type | Backend | Durability |
//! |------|---------|-----------|
//! | [`InMemoryAuditLog`] | `Vec` behind a lock | process lifetime |
//! | [`JsonlAuditLog`] | one JSON object per line | `fsync` before `append` returns |
//!
//! Both assign sequence numbers under the same lock that performs the write,
//! so sequence order equals persistence order.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::domain::agent::AgentId;
use crate::domain::audit::{AuditEntry, AuditRecord, SequenceNumber};
use crate::domain::repository::{AuditLog, AuditQueryError, AuditWriteError};
use crate::domain::task::TaskId;

fn select_range(entries: &[AuditEntry], from: SequenceNumber, to: Option<SequenceNumber>) -> Vec<AuditEntry> {
    // Sequences are dense and start at 1, so the slice start is computable.
    let start = (from.0.max(1) - 1) as usize;
    entries
        .iter()
        .skip(start)
        .take_while(|e| to.is_none_or(|to| e.sequence < to))
        .cloned()
        .collect()
}

fn select_agent(entries: &[AuditEntry], agent_id: AgentId, limit: usize) -> Vec<AuditEntry> {
    let mut found: Vec<_> = entries.iter().rev().filter(|e| e.agent_id == agent_id).take(limit).cloned().collect();
    found.reverse();
    found
}

#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry, oldest first.
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditWriteError> {
        let mut entries = self.entries.write();
        let sequence = SequenceNumber(entries.len() as u64 + 1);
        let entry = record.sequenced(sequence);
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn by_task(&self, task_id: TaskId) -> Result<Vec<AuditEntry>, AuditQueryError> {
        Ok(self.entries.read().iter().filter(|e| e.task_id == Some(task_id)).cloned().collect())
    }

    async fn by_agent(&self, agent_id: AgentId, limit: usize) -> Result<Vec<AuditEntry>, AuditQueryError> {
        Ok(select_agent(&self.entries.read(), agent_id, limit))
    }

    async fn range(&self, from: SequenceNumber, to: Option<SequenceNumber>) -> Result<Vec<AuditEntry>, AuditQueryError> {
        Ok(select_range(&self.entries.read(), from, to))
    }

    async fn latest_sequence(&self) -> Result<Option<SequenceNumber>, AuditQueryError> {
        Ok(self.entries.read().last().map(|e| e.sequence))
    }
}

/// Append target behind [`JsonlAuditLog`]. Implemented for `tokio::fs::File`.
#[async_trait]
pub trait AppendFile: Send + Sync + 'static {
    /// Current length once every earlier write has landed.
    async fn size(&mut self) -> std::io::Result<u64>;
    async fn append(&mut self, bytes: &[u8]) -> std::io::Result<()>;
    async fn sync(&mut self) -> std::io::Result<()>;
    async fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

#[async_trait]
impl AppendFile for tokio::fs::File {
    async fn size(&mut self) -> std::io::Result<u64> {
        self.flush().await?;
        Ok(self.metadata().await?.len())
    }

    async fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.write_all(bytes).await?;
        self.flush().await
    }

    async fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data().await
    }

    async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len).await?;
        self.sync_data().await
    }
}

struct Appender<F> {
    file: F,
    /// Set when a failed append could not be rolled back.
    poisoned: Option<String>,
}

/// Append-only JSON Lines audit store.
///
/// The full log is indexed in memory at open; appends write one line and
/// `fsync` before the entry becomes visible to queries. A failed append is
/// truncated away. If that also fails the store refuses further appends.
pub struct JsonlAuditLog<F = tokio::fs::File> {
    path: PathBuf,
    appender: Mutex<Appender<F>>,
    entries: RwLock<Vec<AuditEntry>>,
}

impl JsonlAuditLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditQueryError> {
        Self::open_with(path, |file| file).await
    }
}

impl<F: AppendFile> JsonlAuditLog<F> {
    /// Open the log and hand the append handle to `wrap`.
    pub async fn open_with(
        path: impl AsRef<Path>,
        wrap: impl FnOnce(tokio::fs::File) -> F + Send,
    ) -> Result<Self, AuditQueryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AuditQueryError::Io(e.to_string()))?;
        }

        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(AuditQueryError::Io(e.to_string())),
        };
        let (entries, valid_len) = parse(&existing)?;

        if valid_len < existing.len() {
            warn!(path = %path.display(), "Truncating incomplete trailing audit line");
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| AuditQueryError::Io(e.to_string()))?;
            file.set_len(valid_len as u64).map_err(|e| AuditQueryError::Io(e.to_string()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AuditQueryError::Io(e.to_string()))?;

        debug!(path = %path.display(), entries = entries.len(), "Opened JSONL audit log");
        Ok(Self {
            path,
            appender: Mutex::new(Appender { file: wrap(file), poisoned: None }),
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse complete lines. Returns the entries and the byte length of the
/// well-formed prefix. Only an unterminated final line may be dropped.
fn parse(content: &str) -> Result<(Vec<AuditEntry>, usize), AuditQueryError> {
    let mut entries: Vec<AuditEntry> = Vec::new();
    let mut offset = 0;
    for (index, line) in content.split_inclusive('\n').enumerate() {
        let terminated = line.ends_with('\n');
        let body = line.trim_end();
        if body.is_empty() {
            offset += line.len();
            continue;
        }
        let entry: AuditEntry = match serde_json::from_str(body) {
            Ok(entry) => entry,
            Err(_) if !terminated => break,
            Err(e) => return Err(AuditQueryError::Corrupt { line: index + 1, reason: e.to_string() }),
        };
        let expected = SequenceNumber(entries.len() as u64 + 1);
        if entry.sequence != expected {
            return Err(AuditQueryError::Corrupt {
                line: index + 1,
                reason: format!("expected sequence {expected}, found {}", entry.sequence),
            });
        }
        entries.push(entry);
        offset += line.len();
    }
    Ok((entries, offset))
}

#[async_trait]
impl<F: AppendFile> AuditLog for JsonlAuditLog<F> {
    async fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditWriteError> {
        let mut appender = self.appender.lock().await;
        if let Some(reason) = &appender.poisoned {
            return Err(AuditWriteError::Unavailable(reason.clone()));
        }
        let sequence = SequenceNumber(self.entries.read().len() as u64 + 1);
        let entry = record.sequenced(sequence);

        let mut line = serde_json::to_vec(&entry).map_err(|e| AuditWriteError::Encoding(e.to_string()))?;
        line.push(b'\n');

        let before = appender.file.size().await.map_err(|e| AuditWriteError::Io(e.to_string()))?;
        let written = match appender.file.append(&line).await {
            Ok(()) => appender.file.sync().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            match appender.file.truncate(before).await {
                Ok(()) => warn!(path = %self.path.display(), sequence = %sequence, error = %e, "Audit append rolled back"),
                Err(rollback) => {
                    error!(
                        path = %self.path.display(),
                        error = %e,
                        rollback_error = %rollback,
                        "Audit append could not be rolled back; refusing further appends"
                    );
                    appender.poisoned = Some(format!(
                        "{} may hold a partial entry {sequence}: {rollback}",
                        self.path.display()
                    ));
                }
            }
            return Err(AuditWriteError::Io(e.to_string()));
        }

        self.entries.write().push(entry.clone());
        Ok(entry)
    }

    async fn by_task(&self, task_id: TaskId) -> Result<Vec<AuditEntry>, AuditQueryError> {
        Ok(self.entries.read().iter().filter(|e| e.task_id == Some(task_id)).cloned().collect())
    }

    async fn by_agent(&self, agent_id: AgentId, limit: usize) -> Result<Vec<AuditEntry>, AuditQueryError> {
        Ok(select_agent(&self.entries.read(), agent_id, limit))
    }

    async fn range(&self, from: SequenceNumber, to: Option<SequenceNumber>) -> Result<Vec<AuditEntry>, AuditQueryError> {
        Ok(select_range(&self.entries.read(), from, to))
    }

    async fn latest_sequence(&self) -> Result<Option<SequenceNumber>, AuditQueryError> {
        Ok(self.entries.read().last().map(|e| e.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::Decision;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn record(agent: AgentId, task: TaskId, decision: Decision) -> AuditRecord {
        AuditRecord::new(agent, decision).task(task)
    }

    #[tokio::test]
    async fn test_in_memory_sequences_and_queries() {
        let log = InMemoryAuditLog::new();
        let prime = AgentId::new();
        let governor = AgentId::new();
        let task = TaskId::new();

        let first = log.append(record(prime, task, Decision::Admit)).await.unwrap();
        log.append(record(prime, task, Decision::Route)).await.unwrap();
        log.append(record(governor, task, Decision::ValidateAccept)).await.unwrap();
        log.append(record(prime, TaskId::new(), Decision::Admit)).await.unwrap();

        assert_eq!(first.sequence, SequenceNumber::FIRST);
        assert_eq!(log.by_task(task).await.unwrap().len(), 3);
        assert_eq!(log.latest_sequence().await.unwrap(), Some(SequenceNumber(4)));

        let prime_recent = log.by_agent(prime, 2).await.unwrap();
        assert_eq!(prime_recent.iter().map(|e| e.sequence.0).collect::<Vec<_>>(), vec![2, 4]);

        let window = log.range(SequenceNumber(2), Some(SequenceNumber(4))).await.unwrap();
        assert_eq!(window.iter().map(|e| e.sequence.0).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_distinct_sequences() {
        let log = std::sync::Arc::new(InMemoryAuditLog::new());
        let agent = AgentId::new();
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let log = log.clone();
                tokio::spawn(async move { log.append(record(agent, TaskId::new(), Decision::Admit)).await.unwrap() })
            })
            .collect();
        let mut seqs: Vec<u64> = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap().sequence.0);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_jsonl_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("codex-audit.jsonl");
        let agent = AgentId::new();
        let task = TaskId::new();

        {
            let log = JsonlAuditLog::open(&path).await.unwrap();
            log.append(record(agent, task, Decision::Admit)).await.unwrap();
            log.append(record(agent, task, Decision::Route)).await.unwrap();
        }

        let log = JsonlAuditLog::open(&path).await.unwrap();
        assert_eq!(log.latest_sequence().await.unwrap(), Some(SequenceNumber(2)));
        let next = log.append(record(agent, task, Decision::Retire)).await.unwrap();
        assert_eq!(next.sequence, SequenceNumber(3));
        assert_eq!(log.by_task(task).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_jsonl_drops_torn_final_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let agent = AgentId::new();
        {
            let log = JsonlAuditLog::open(&path).await.unwrap();
            log.append(record(agent, TaskId::new(), Decision::Admit)).await.unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"sequence\":2,\"times");
        std::fs::write(&path, content).unwrap();

        let log = JsonlAuditLog::open(&path).await.unwrap();
        assert_eq!(log.latest_sequence().await.unwrap(), Some(SequenceNumber(1)));
        let next = log.append(record(agent, TaskId::new(), Decision::Admit)).await.unwrap();
        assert_eq!(next.sequence, SequenceNumber(2));

        let reopened = JsonlAuditLog::open(&path).await.unwrap();
        assert_eq!(reopened.range(SequenceNumber::FIRST, None).await.unwrap().len(), 2);
    }

    /// Wraps the real file and fails on demand.
    #[derive(Clone, Default)]
    struct Faults {
        short_write: Arc<AtomicBool>,
        fail_sync: Arc<AtomicBool>,
        fail_truncate: Arc<AtomicBool>,
    }

    struct FlakyFile {
        inner: tokio::fs::File,
        faults: Faults,
    }

    #[async_trait]
    impl AppendFile for FlakyFile {
        async fn size(&mut self) -> std::io::Result<u64> {
            self.inner.size().await
        }

        async fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            if self.faults.short_write.load(Ordering::SeqCst) {
                self.inner.append(&bytes[..bytes.len() / 2]).await?;
                return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "device full"));
            }
            self.inner.append(bytes).await
        }

        async fn sync(&mut self) -> std::io::Result<()> {
            if self.faults.fail_sync.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("fsync failed"));
            }
            self.inner.sync().await
        }

        async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            if self.faults.fail_truncate.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("read-only filesystem"));
            }
            self.inner.truncate(len).await
        }
    }

    async fn flaky_log(path: &Path, faults: &Faults) -> JsonlAuditLog<FlakyFile> {
        let faults = faults.clone();
        JsonlAuditLog::open_with(path, move |inner| FlakyFile { inner, faults }).await.unwrap()
    }

    async fn reopened_sequences(path: &Path) -> Vec<u64> {
        let log = JsonlAuditLog::open(path).await.unwrap();
        log.range(SequenceNumber::FIRST, None).await.unwrap().iter().map(|e| e.sequence.0).collect()
    }

    #[tokio::test]
    async fn test_jsonl_failed_sync_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let faults = Faults::default();
        let agent = AgentId::new();
        let log = flaky_log(&path, &faults).await;

        log.append(record(agent, TaskId::new(), Decision::Admit)).await.unwrap();
        faults.fail_sync.store(true, Ordering::SeqCst);
        let err = log.append(record(agent, TaskId::new(), Decision::Admit)).await.unwrap_err();
        assert!(matches!(err, AuditWriteError::Io(_)));
        assert_eq!(log.latest_sequence().await.unwrap(), Some(SequenceNumber(1)));

        faults.fail_sync.store(false, Ordering::SeqCst);
        let next = log.append(record(agent, TaskId::new(), Decision::Route)).await.unwrap();
        assert_eq!(next.sequence, SequenceNumber(2));
        drop(log);

        assert_eq!(reopened_sequences(&path).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_jsonl_short_write_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let faults = Faults::default();
        let agent = AgentId::new();
        let log = flaky_log(&path, &faults).await;

        faults.short_write.store(true, Ordering::SeqCst);
        assert!(log.append(record(agent, TaskId::new(), Decision::Admit)).await.is_err());
        faults.short_write.store(false, Ordering::SeqCst);

        let first = log.append(record(agent, TaskId::new(), Decision::Admit)).await.unwrap();
        assert_eq!(first.sequence, SequenceNumber::FIRST);
        log.append(record(agent, TaskId::new(), Decision::Admit)).await.unwrap();
        drop(log);

        assert_eq!(reopened_sequences(&path).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_jsonl_refuses_appends_after_failed_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let faults = Faults::default();
        let agent = AgentId::new();
        let log = flaky_log(&path, &faults).await;

        log.append(record(agent, TaskId::new(), Decision::Admit)).await.unwrap();
        faults.fail_sync.store(true, Ordering::SeqCst);
        faults.fail_truncate.store(true, Ordering::SeqCst);
        assert!(matches!(
            log.append(record(agent, TaskId::new(), Decision::Admit)).await,
            Err(AuditWriteError::Io(_))
        ));

        faults.fail_sync.store(false, Ordering::SeqCst);
        faults.fail_truncate.store(false, Ordering::SeqCst);
        assert!(matches!(
            log.append(record(agent, TaskId::new(), Decision::Admit)).await,
            Err(AuditWriteError::Unavailable(_))
        ));
        assert_eq!(log.latest_sequence().await.unwrap(), Some(SequenceNumber(1)));
    }

    #[tokio::test]
    async fn test_jsonl_rejects_sequence_gap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let entry = AuditRecord::new(AgentId::new(), Decision::Halt).sequenced(SequenceNumber(2));
        std::fs::write(&path, format!("{}\n", serde_json::to_string(&entry).unwrap())).unwrap();

        let err = JsonlAuditLog::open(&path).await.err().unwrap();
        assert!(matches!(err, AuditQueryError::Corrupt { line: 1, .. }));
    }
}
