//! Optional per-session message trace.
//!
//! A ring buffer of the last N envelopes with timestamps and direction,
//! toggleable at runtime through the config watcher. The enabled flag is a
//! shared atomic: when the recorder is off, the per-message cost is one
//! relaxed load and nothing else.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub at: DateTime<Utc>,
    pub direction: Direction,
    /// `None` for broadcasts (egress to every participant).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<Uuid>,
    pub message_type: String,
}

pub struct DebugRecorder {
    enabled: Arc<AtomicBool>,
    capacity: usize,
    entries: VecDeque<TraceEntry>,
}

impl DebugRecorder {
    /// `enabled` is shared with the config watcher; flipping it takes effect
    /// on the next message.
    pub fn new(capacity: usize, enabled: Arc<AtomicBool>) -> Self {
        Self {
            enabled,
            capacity,
            entries: VecDeque::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn record_ingress(&mut self, connection_id: Uuid, message_type: &str) {
        self.push(Direction::Ingress, Some(connection_id), message_type);
    }

    pub fn record_egress(&mut self, connection_id: Option<Uuid>, message_type: &str) {
        self.push(Direction::Egress, connection_id, message_type);
    }

    fn push(&mut self, direction: Direction, connection_id: Option<Uuid>, message_type: &str) {
        if !self.is_enabled() || self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TraceEntry {
            at: Utc::now(),
            direction,
            connection_id,
            message_type: message_type.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
    }

    /// Append the buffered trace to a JSONL file. Called at session teardown;
    /// failures are the caller's to log — tracing must never take a session
    /// down.
    pub async fn dump_to(&self, path: &Path) -> anyhow::Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        file.write_all(out.as_bytes()).await?;
        Ok(())
    }
}
