//! JSONL audit backend.
//!
//! One JSON object per line, appended to a single file. Suits the
//! single-operator deployment model: trivially greppable, no schema
//! migrations, and a crash can lose at most the event being written.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{AuditBackend, AuditEvent, EventFilter};

pub struct JsonlAuditBackend {
    path: PathBuf,
    /// Serialises appends so concurrent events never interleave mid-line.
    write_lock: Mutex<()>,
}

impl JsonlAuditBackend {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Create the backend, ensuring the parent directory exists.
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(Self::new(path))
    }

    /// Drop events older than the retention window by rewriting the file.
    /// Runs at startup; a failure is logged by the caller and never blocks
    /// serving.
    pub async fn prune_older_than(&self, retention_days: u32) -> anyhow::Result<u64> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days as i64);
        let events = self.read_all().await?;
        let kept: Vec<&AuditEvent> = events.iter().filter(|e| e.timestamp >= cutoff).collect();
        let dropped = (events.len() - kept.len()) as u64;
        if dropped == 0 {
            return Ok(0);
        }

        let mut out = String::new();
        for event in &kept {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        let _guard = self.write_lock.lock().await;
        tokio::fs::write(&self.path, out).await?;
        Ok(dropped)
    }

    async fn read_all(&self) -> anyhow::Result<Vec<AuditEvent>> {
        let path = self.path.clone();
        // File scan is blocking I/O — keep it off the event loop.
        tokio::task::spawn_blocking(move || {
            let file = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut events = Vec::new();
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEvent>(&line) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed audit line");
                    }
                }
            }
            Ok(events)
        })
        .await?
    }
}

#[async_trait]
impl AuditBackend for JsonlAuditBackend {
    async fn log_event(&self, event: AuditEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query_events(&self, filter: EventFilter) -> anyhow::Result<Vec<AuditEvent>> {
        let mut events: Vec<AuditEvent> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        // Newest first — scan ids sort lexicographically by creation time.
        events.sort_by(|a, b| b.scan_id.cmp(&a.scan_id));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn count_events(&self, filter: EventFilter) -> anyhow::Result<u64> {
        Ok(self
            .read_all()
            .await?
            .iter()
            .filter(|e| filter.matches(e))
            .count() as u64)
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Appends are flushed per event; nothing to drain.
        Ok(())
    }
}
