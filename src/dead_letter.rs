//! Dead-letter store: durable capture of tasks whose retries are exhausted.
//!
//! One JSON object per line, appended under the work directory and loaded
//! lazily. Entries only become reprocessable through an explicit
//! [`DeadLetterStore::mark_reprocessable`] call; nothing here retries them.

use crate::task::{AttemptRecord, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const FILE_NAME: &str = "dead-letter.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: Task,
    pub error_code: String,
    pub error_message: String,
    pub attempts: Vec<AttemptRecord>,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub reprocessable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub reprocessable: usize,
}

/// Append-only sink for exhausted tasks.
#[derive(Debug)]
pub struct DeadLetterStore {
    path: PathBuf,
    entries: Mutex<Option<Vec<DeadLetterEntry>>>,
}

impl DeadLetterStore {
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        Self {
            path: work_dir.as_ref().join(FILE_NAME),
            entries: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a task whose retries are exhausted.
    pub async fn capture(
        &self,
        task: &Task,
        error_code: &str,
        error_message: &str,
        attempts: &[AttemptRecord],
    ) -> io::Result<()> {
        let entry = DeadLetterEntry {
            task: task.clone(),
            error_code: error_code.to_string(),
            error_message: error_message.to_string(),
            attempts: attempts.to_vec(),
            captured_at: Utc::now(),
            reprocessable: false,
        };

        let line = serde_json::to_string(&entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            + "\n";

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        tracing::warn!(
            task_id = %entry.task.id,
            error = %entry.error_code,
            "task captured to dead-letter store"
        );

        let mut cached = self.entries.lock().await;
        if let Some(entries) = cached.as_mut() {
            entries.push(entry);
        }
        Ok(())
    }

    async fn ensure_loaded(
        &self,
        cached: &mut Option<Vec<DeadLetterEntry>>,
    ) -> io::Result<()> {
        if cached.is_some() {
            return Ok(());
        }
        let entries = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .filter_map(|line| match serde_json::from_str(line) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed dead-letter line");
                        None
                    }
                })
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        *cached = Some(entries);
        Ok(())
    }

    pub async fn entries(&self) -> io::Result<Vec<DeadLetterEntry>> {
        let mut cached = self.entries.lock().await;
        self.ensure_loaded(&mut cached).await?;
        Ok(cached.as_ref().cloned().unwrap_or_default())
    }

    pub async fn stats(&self) -> io::Result<DeadLetterStats> {
        let entries = self.entries().await?;
        Ok(DeadLetterStats {
            total: entries.len(),
            reprocessable: entries.iter().filter(|e| e.reprocessable).count(),
        })
    }

    pub async fn reprocessable_entries(&self) -> io::Result<Vec<DeadLetterEntry>> {
        Ok(self.entries().await?.into_iter().filter(|e| e.reprocessable).collect())
    }

    /// Flip an entry to reprocessable. Returns whether a matching task id was
    /// found. This is the only way an entry becomes reprocessable.
    pub async fn mark_reprocessable(&self, task_id: &str) -> io::Result<bool> {
        let mut cached = self.entries.lock().await;
        self.ensure_loaded(&mut cached).await?;
        let Some(entries) = cached.as_mut() else { return Ok(false) };

        let mut found = false;
        for entry in entries.iter_mut() {
            if entry.task.id == task_id {
                entry.reprocessable = true;
                found = true;
            }
        }
        if found {
            self.rewrite(entries).await?;
        }
        Ok(found)
    }

    pub async fn clear(&self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        *self.entries.lock().await = Some(Vec::new());
        Ok(())
    }

    async fn rewrite(&self, entries: &[DeadLetterEntry]) -> io::Result<()> {
        let mut contents = String::new();
        for entry in entries {
            contents.push_str(
                &serde_json::to_string(entry)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            );
            contents.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
