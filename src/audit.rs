//! Per-run audit trail.
//!
//! Records accumulate in memory while a run executes and are written once,
//! as JSON Lines, to `{logs_dir}/monthly_audit_{run_id}.jsonl`:
//!
//! ```jsonl
//! {"timestamp":"2026-10-18T09:30:05Z","run_id":"gh-7-1","stage":"00","event":"list","count":1}
//! {"timestamp":"2026-10-18T09:30:06Z","run_id":"gh-7-1","stage":"00","event":"write",...}
//! ```
//!
//! Recording never fails. If the log cannot be written to the store, the
//! buffered lines are printed to stdout instead.

use crate::store::path::join;
use crate::store::{BlobStore, WriteMode};
use crate::util::iso_seconds;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Kinds of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    RunStart,
    List,
    Write,
    Move,
    Skip,
    Stop,
    Error,
    WriteState,
    RunEnd,
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RunStart => "run_start",
            Self::List => "list",
            Self::Write => "write",
            Self::Move => "move",
            Self::Skip => "skip",
            Self::Stop => "stop",
            Self::Error => "error",
            Self::WriteState => "write_state",
            Self::RunEnd => "run_end",
        };
        f.write_str(name)
    }
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// UTC, seconds precision.
    pub timestamp: String,
    pub run_id: String,
    /// Stage the event belongs to (`auto` before a stage is selected).
    pub stage: String,
    pub event: AuditEvent,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub src_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dst_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

/// Optional fields attached to an event.
#[derive(Debug, Clone, Default)]
pub struct AuditFields {
    src_path: Option<String>,
    dst_path: Option<String>,
    filename: Option<String>,
    size: Option<u64>,
    count: Option<usize>,
    message: Option<String>,
}

impl AuditFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src(mut self, path: impl Into<String>) -> Self {
        self.src_path = Some(path.into());
        self
    }

    pub fn dst(mut self, path: impl Into<String>) -> Self {
        self.dst_path = Some(path.into());
        self
    }

    pub fn filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// In-memory audit buffer for one run.
#[derive(Debug)]
pub struct AuditLog {
    run_id: String,
    records: Vec<AuditRecord>,
}

impl AuditLog {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            records: Vec::new(),
        }
    }

    /// Append one record stamped with the current UTC time.
    pub fn record(&mut self, stage: &str, event: AuditEvent, fields: AuditFields) {
        let record = AuditRecord {
            timestamp: iso_seconds(Utc::now()),
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            event,
            src_path: fields.src_path,
            dst_path: fields.dst_path,
            filename: fields.filename,
            size: fields.size,
            count: fields.count,
            message: fields.message,
        };
        tracing::debug!(
            stage = %record.stage,
            event = %record.event,
            src = record.src_path.as_deref().unwrap_or(""),
            dst = record.dst_path.as_deref().unwrap_or(""),
            "audit"
        );
        self.records.push(record);
    }

    #[cfg(test)]
    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    #[cfg(test)]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.records.iter().map(|record| record.event).collect()
    }

    /// Store path the log is written to.
    pub fn log_path(&self, logs_dir: &str) -> String {
        join(logs_dir, &format!("monthly_audit_{}.jsonl", self.run_id))
    }

    /// Render the buffered records as JSON Lines.
    pub fn to_jsonl(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            match serde_json::to_string(record) {
                Ok(line) => {
                    out.push_str(&line);
                    out.push('\n');
                }
                Err(err) => tracing::warn!(error = %err, "dropping unserializable audit record"),
            }
        }
        out
    }

    /// Write the log to the store.
    ///
    /// Returns the store path on success. On failure the lines go to stdout
    /// and `None` is returned.
    pub fn flush(&self, store: &dyn BlobStore, logs_dir: &str) -> Option<String> {
        let path = self.log_path(logs_dir);
        let body = self.to_jsonl();
        match store.write(&path, body.as_bytes(), WriteMode::Overwrite) {
            Ok(()) => {
                tracing::info!(path = %path, records = self.records.len(), "audit log written");
                Some(path)
            }
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "audit log upload failed; printing to stdout");
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(body.as_bytes());
                let _ = stdout.flush();
                None
            }
        }
    }
}

/// Parse a JSON Lines audit log, skipping blank lines.
#[cfg(test)]
pub fn parse_jsonl(text: &str) -> anyhow::Result<Vec<AuditRecord>> {
    use anyhow::Context;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).with_context(|| format!("parse audit line {}", idx + 1))
        })
        .collect()
}
