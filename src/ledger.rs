//! Persisted processed-set for idempotent stage passes.
//!
//! The ledger is a single JSON document in the store:
//!
//! ```json
//! {"processed": {"stage00:/00_inbox_raw/in/report.xlsx@015f": "stage00:gh-1-1"},
//!  "updated_at_utc": "2026-10-18T09:30:05Z"}
//! ```
//!
//! Loading never fails: a missing or unreadable ledger starts empty, and the
//! worst case is a file being processed again under a fresh output name.
use crate::stage::StageId;
use crate::store::{BlobStore, FileEntry, WriteMode};
use crate::util::{iso_seconds, sha256_hex};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Identity used to decide "already handled".
///
/// Keys are namespaced per stage so a file forwarded to the next stage is
/// tracked independently there.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessingKey(String);

impl ProcessingKey {
    /// `stage{id}:{path}@{revision}`; the path is lowercased because the
    /// remote store treats paths case-insensitively.
    pub fn from_revision(stage: &StageId, path: &str, revision: &str) -> Self {
        Self(format!("stage{stage}:{}@{revision}", path.to_lowercase()))
    }

    /// `stage{id}:{path}|sha256:{hash}` for stores without revision tokens.
    pub fn from_content(stage: &StageId, path: &str, bytes: &[u8]) -> Self {
        Self(format!(
            "stage{stage}:{}|sha256:{}",
            path.to_lowercase(),
            sha256_hex(bytes)
        ))
    }

    /// Key for a listed entry, if the store supplied a revision.
    pub fn for_entry(stage: &StageId, entry: &FileEntry) -> Option<Self> {
        entry
            .revision
            .as_deref()
            .filter(|rev| !rev.is_empty())
            .map(|rev| Self::from_revision(stage, &entry.path, rev))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// In-memory view of `state.json`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateLedger {
    processed: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at_utc: Option<String>,
    /// Unrecognized top-level fields, written back untouched.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl StateLedger {
    /// Load the ledger, treating any failure as an empty ledger.
    pub fn load(store: &dyn BlobStore, path: &str) -> Self {
        let bytes = match store.read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => {
                tracing::info!(path, "no state ledger yet; starting empty");
                return Self::default();
            }
            Err(err) => {
                tracing::warn!(path, error = %err, "state ledger unreadable; starting empty");
                return Self::default();
            }
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Self::from_value(value),
            Err(err) => {
                tracing::warn!(path, error = %err, "state ledger is not valid JSON; starting empty");
                Self::default()
            }
        }
    }

    /// Build a ledger from loosely-shaped JSON.
    ///
    /// Non-object documents yield an empty ledger; non-string markers are
    /// kept in their JSON text form.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self::default();
        };
        let processed = match map.remove("processed") {
            Some(Value::Object(entries)) => entries
                .into_iter()
                .map(|(key, marker)| {
                    let marker = match marker {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    (key, marker)
                })
                .collect(),
            _ => BTreeMap::new(),
        };
        let updated_at_utc = match map.remove("updated_at_utc") {
            Some(Value::String(text)) => Some(text),
            _ => None,
        };
        Self {
            processed,
            updated_at_utc,
            extra: map,
        }
    }

    pub fn is_processed(&self, key: &ProcessingKey) -> bool {
        self.processed.contains_key(key.as_str())
    }

    /// Record a key as handled. In-memory only.
    pub fn mark_processed(&mut self, key: &ProcessingKey, marker: &str) {
        self.processed
            .insert(key.as_str().to_string(), marker.to_string());
    }

    pub fn marker(&self, key: &ProcessingKey) -> Option<&str> {
        self.processed.get(key.as_str()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }

    /// Number of keys recorded for one stage.
    pub fn count_for_stage(&self, stage: &StageId) -> usize {
        let prefix = format!("stage{stage}:");
        self.processed
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .count()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("serialize state ledger")
    }

    /// Overwrite the ledger in the store, stamping `updated_at_utc`.
    pub fn save(&mut self, store: &dyn BlobStore, path: &str, now: DateTime<Utc>) -> Result<()> {
        self.updated_at_utc = Some(iso_seconds(now));
        let bytes = self.to_json()?;
        store
            .write(path, &bytes, WriteMode::Overwrite)
            .with_context(|| format!("write state ledger {path}"))?;
        Ok(())
    }
}
