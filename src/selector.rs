//! Pick the stage with pending work.
use crate::ledger::{ProcessingKey, StateLedger};
use crate::stage::{Pipeline, StageDescriptor, StageId};
use crate::store::{BlobStore, FileEntry, StoreResult};
use anyhow::{anyhow, Result};
use std::fmt;

/// Requested stage: a concrete id, or `auto` to scan from the first stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageHint {
    Auto,
    Stage(StageId),
}

impl StageHint {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        let trimmed = trimmed
            .strip_prefix("stage")
            .or_else(|| trimmed.strip_prefix("STAGE"))
            .unwrap_or(trimmed);
        Ok(Self::Stage(StageId::parse(trimmed)?))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Auto => "auto",
            Self::Stage(id) => id.as_str(),
        }
    }
}

impl fmt::Display for StageHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which listed files a stage cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    /// Lowercase extensions without the leading dot.
    extensions: Vec<String>,
}

impl Default for FileFilter {
    fn default() -> Self {
        Self {
            extensions: vec!["xlsx".to_string()],
        }
    }
}

impl FileFilter {
    /// Build from a comma-separated list such as `xlsx, .xlsm`.
    pub fn parse(raw: &str) -> Result<Self> {
        let extensions: Vec<String> = raw
            .split(',')
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        if extensions.is_empty() {
            return Err(anyhow!("no file extensions in {raw:?}"));
        }
        Ok(Self { extensions })
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Office lock files (`~$report.xlsx`) never match.
    pub fn matches(&self, name: &str) -> bool {
        if name.starts_with("~$") {
            return false;
        }
        let Some((stem, ext)) = name.rsplit_once('.') else {
            return false;
        };
        !stem.is_empty()
            && self
                .extensions
                .iter()
                .any(|wanted| ext.eq_ignore_ascii_case(wanted))
    }

    pub fn relevant(&self, entries: Vec<FileEntry>) -> Vec<FileEntry> {
        entries
            .into_iter()
            .filter(|entry| self.matches(&entry.name))
            .collect()
    }
}

/// Relevant files currently waiting in a stage's IN directory.
pub fn pending_files(
    store: &dyn BlobStore,
    stage: &StageDescriptor,
    filter: &FileFilter,
) -> StoreResult<Vec<FileEntry>> {
    Ok(filter.relevant(store.list(&stage.input_dir)?))
}

/// Entries a pass would attempt: those without a revision key, or whose key
/// the ledger has not seen.
pub fn unprocessed_count(
    stage: &StageDescriptor,
    entries: &[FileEntry],
    ledger: &StateLedger,
) -> usize {
    entries
        .iter()
        .filter(|entry| {
            !matches!(
                ProcessingKey::for_entry(&stage.id, entry),
                Some(key) if ledger.is_processed(&key)
            )
        })
        .count()
}

/// Scan stages from the hinted one, wrapping around, and return the first
/// with at least one unprocessed relevant input file.
///
/// `Ok(None)` means nothing is pending anywhere. A stage holding only files
/// already in the ledger is passed over. Listing failures skip the stage
/// unless they are fatal.
pub fn select_stage<'p>(
    store: &dyn BlobStore,
    pipeline: &'p Pipeline,
    hint: &StageHint,
    filter: &FileFilter,
    ledger: &StateLedger,
) -> Result<Option<&'p StageDescriptor>> {
    let start = match hint {
        StageHint::Auto => 0,
        StageHint::Stage(id) => pipeline
            .position(id)
            .ok_or_else(|| anyhow!("unknown stage {id} (known: {})", pipeline.ids().join(", ")))?,
    };
    let stages = pipeline.stages();
    let order = stages[start..].iter().chain(stages[..start].iter());
    for stage in order {
        match pending_files(store, stage, filter) {
            Ok(files) => {
                let unprocessed = unprocessed_count(stage, &files, ledger);
                if unprocessed > 0 {
                    tracing::info!(stage = %stage.id, pending = unprocessed, "selected stage");
                    return Ok(Some(stage));
                }
                tracing::debug!(stage = %stage.id, dir = %stage.input_dir, listed = files.len(), "no unprocessed files");
            }
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                tracing::warn!(stage = %stage.id, error = %err, "listing failed; skipping stage");
            }
        }
    }
    Ok(None)
}
