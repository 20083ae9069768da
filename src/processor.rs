//! One stage pass: list IN, transform each unseen file, write OUT, move the
//! original to DONE, forward to the next stage, mark it processed.
//!
//! Steps for a single file run strictly in that order, so a crash leaves at
//! most one file between "output written" and "original moved". Re-running
//! picks it up again and writes a fresh, differently named output.

use crate::audit::{AuditEvent, AuditFields, AuditLog};
use crate::ledger::{ProcessingKey, StateLedger};
use crate::selector::{pending_files, FileFilter};
use crate::stage::{Pipeline, StageDescriptor};
use crate::store::path::{join, split_ext};
use crate::store::{BlobStore, FileEntry, StoreError, StoreResult, WriteMode};
use crate::transform::Transform;
use crate::util::{file_safe, file_tag, short_hash};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

/// Attempts at a unique name before giving up on a conflicting target.
const MAX_NAME_ATTEMPTS: u32 = 50;

/// What a stage pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub listed: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Relevant files left unattempted because the cap was reached.
    pub deferred: usize,
}

/// Shared collaborators for a pass.
pub struct StageRun<'a> {
    pub store: &'a dyn BlobStore,
    pub pipeline: &'a Pipeline,
    pub filter: &'a FileFilter,
    pub max_files: usize,
    pub run_id: &'a str,
}

enum FileOutcome {
    Processed,
    /// Content key already in the ledger, with its marker.
    AlreadyDone(String),
}

/// First store error in an error chain, if any.
pub fn store_error(err: &anyhow::Error) -> Option<&StoreError> {
    err.chain().find_map(|cause| cause.downcast_ref::<StoreError>())
}

impl StageRun<'_> {
    /// Process up to `max_files` pending files of `stage`.
    ///
    /// Per-file failures are recorded and skipped. A fatal store error ends
    /// the pass and is returned after being recorded.
    pub fn run(
        &self,
        stage: &StageDescriptor,
        transform: &mut dyn Transform,
        ledger: &mut StateLedger,
        audit: &mut AuditLog,
    ) -> Result<PassReport> {
        let stage_id = stage.id.as_str();
        let entries = match pending_files(self.store, stage, self.filter) {
            Ok(entries) => entries,
            Err(err) => {
                audit.record(
                    stage_id,
                    AuditEvent::Error,
                    AuditFields::new()
                        .src(stage.input_dir.as_str())
                        .message(format!("list failed: {err}")),
                );
                if err.is_fatal() {
                    return Err(err).with_context(|| format!("list {}", stage.input_dir));
                }
                return Ok(PassReport::default());
            }
        };
        audit.record(
            stage_id,
            AuditEvent::List,
            AuditFields::new()
                .src(stage.input_dir.as_str())
                .count(entries.len()),
        );
        tracing::info!(stage = stage_id, dir = %stage.input_dir, files = entries.len(), "listed input");

        let mut report = PassReport {
            listed: entries.len(),
            ..PassReport::default()
        };
        let mut attempted = 0;
        for (idx, entry) in entries.iter().enumerate() {
            if let Some(key) = ProcessingKey::for_entry(&stage.id, entry) {
                if ledger.is_processed(&key) {
                    self.record_skip(stage_id, entry, ledger.marker(&key), audit);
                    report.skipped += 1;
                    continue;
                }
            }
            if attempted >= self.max_files {
                report.deferred = entries.len() - idx;
                audit.record(
                    stage_id,
                    AuditEvent::Stop,
                    AuditFields::new()
                        .count(report.deferred)
                        .message(format!(
                            "max_files_per_run={} reached; {} file(s) left for a later run",
                            self.max_files, report.deferred
                        )),
                );
                tracing::info!(stage = stage_id, limit = self.max_files, remaining = report.deferred, "file cap reached");
                break;
            }
            attempted += 1;

            match self.process_file(stage, entry, transform, ledger, audit) {
                Ok(FileOutcome::Processed) => report.processed += 1,
                Ok(FileOutcome::AlreadyDone(marker)) => {
                    self.record_skip(stage_id, entry, Some(&marker), audit);
                    report.skipped += 1;
                }
                Err(err) => {
                    report.failed += 1;
                    audit.record(
                        stage_id,
                        AuditEvent::Error,
                        AuditFields::new()
                            .src(entry.path.as_str())
                            .filename(entry.name.as_str())
                            .message(format!("{err:#}")),
                    );
                    tracing::warn!(stage = stage_id, path = %entry.path, error = %format!("{err:#}"), "file failed");
                    if store_error(&err).is_some_and(StoreError::is_fatal) {
                        return Err(err);
                    }
                }
            }
        }
        tracing::info!(
            stage = stage_id,
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            "stage pass complete"
        );
        Ok(report)
    }

    fn record_skip(
        &self,
        stage_id: &str,
        entry: &FileEntry,
        marker: Option<&str>,
        audit: &mut AuditLog,
    ) {
        let message = match marker {
            Some(marker) => format!("already processed ({marker})"),
            None => "already processed".to_string(),
        };
        audit.record(
            stage_id,
            AuditEvent::Skip,
            AuditFields::new()
                .src(entry.path.as_str())
                .filename(entry.name.as_str())
                .message(message),
        );
    }

    fn process_file(
        &self,
        stage: &StageDescriptor,
        entry: &FileEntry,
        transform: &mut dyn Transform,
        ledger: &mut StateLedger,
        audit: &mut AuditLog,
    ) -> Result<FileOutcome> {
        let stage_id = stage.id.as_str();
        let bytes = self
            .store
            .read(&entry.path)
            .with_context(|| format!("read {}", entry.path))?;
        let key = ProcessingKey::for_entry(&stage.id, entry)
            .unwrap_or_else(|| ProcessingKey::from_content(&stage.id, &entry.path, &bytes));
        if let Some(marker) = ledger.marker(&key) {
            return Ok(FileOutcome::AlreadyDone(marker.to_string()));
        }

        let output = transform
            .apply(&bytes, &entry.name)
            .with_context(|| format!("transform {}", entry.path))?;

        let tag = file_tag(Utc::now());
        let (base, ext) = split_ext(&entry.name);

        let out_name = format!("{base}__stage{stage_id}__{tag}{ext}");
        let out_path = write_unique(self.store, &stage.output_dir, &out_name, &output)
            .with_context(|| format!("write output for {}", entry.name))?;
        audit.record(
            stage_id,
            AuditEvent::Write,
            AuditFields::new()
                .src(entry.path.as_str())
                .dst(out_path.as_str())
                .filename(entry.name.as_str())
                .size(output.len() as u64),
        );

        let revision = entry
            .revision
            .clone()
            .filter(|rev| !rev.is_empty())
            .unwrap_or_else(|| short_hash(&bytes));
        let done_name = format!("{base}__rev-{}__{tag}{ext}", file_safe(&revision));
        let done_path = move_unique(self.store, &entry.path, &stage.done_dir, &done_name)
            .with_context(|| format!("move {} to done", entry.path))?;
        audit.record(
            stage_id,
            AuditEvent::Move,
            AuditFields::new()
                .src(entry.path.as_str())
                .dst(done_path.as_str())
                .filename(entry.name.as_str()),
        );

        if let Some(next) = self.pipeline.next(&stage.id) {
            let forward_path = join(&next.input_dir, &entry.name);
            if let Err(err) = self.store.write(&forward_path, &output, WriteMode::Overwrite) {
                let err = anyhow::Error::new(err)
                    .context(format!("forward {} to stage {}", entry.name, next.id));
                return Err(self.restore_original(stage_id, entry, &done_path, audit, err));
            }
            audit.record(
                next.id.as_str(),
                AuditEvent::Write,
                AuditFields::new()
                    .src(out_path.as_str())
                    .dst(forward_path.as_str())
                    .filename(entry.name.as_str())
                    .size(output.len() as u64)
                    .message(format!("forward stage{stage_id} -> stage{}", next.id)),
            );
        }

        ledger.mark_processed(&key, &stage.marker(self.run_id));
        tracing::info!(stage = stage_id, file = %entry.name, output = %out_path, "processed");
        Ok(FileOutcome::Processed)
    }

    /// Put the original back in IN so the whole file is retried next run.
    fn restore_original(
        &self,
        stage_id: &str,
        entry: &FileEntry,
        done_path: &str,
        audit: &mut AuditLog,
        err: anyhow::Error,
    ) -> anyhow::Error {
        match self.store.move_file(done_path, &entry.path) {
            Ok(()) => {
                audit.record(
                    stage_id,
                    AuditEvent::Move,
                    AuditFields::new()
                        .src(done_path)
                        .dst(entry.path.as_str())
                        .filename(entry.name.as_str())
                        .message("restored after failed forward"),
                );
                err
            }
            Err(restore) => {
                tracing::warn!(stage = stage_id, path = %done_path, error = %restore, "could not restore original");
                err.context(format!("original left at {done_path} ({restore})"))
            }
        }
    }
}

/// `name`, or `name` with `__2`, `__3`, ... before the extension.
fn candidate_name(name: &str, attempt: u32) -> String {
    if attempt <= 1 {
        return name.to_string();
    }
    let (base, ext) = split_ext(name);
    format!("{base}__{attempt}{ext}")
}

/// Write without clobbering, renaming on conflict. Returns the path used.
fn write_unique(store: &dyn BlobStore, dir: &str, name: &str, bytes: &[u8]) -> StoreResult<String> {
    let mut attempt = 1;
    loop {
        let path = join(dir, &candidate_name(name, attempt));
        match store.write(&path, bytes, WriteMode::Create) {
            Ok(()) => return Ok(path),
            Err(err) if err.is_conflict() && attempt < MAX_NAME_ATTEMPTS => attempt += 1,
            Err(err) => return Err(err),
        }
    }
}

/// Move without clobbering, renaming on conflict. Returns the path used.
fn move_unique(store: &dyn BlobStore, src: &str, dir: &str, name: &str) -> StoreResult<String> {
    let mut attempt = 1;
    loop {
        let path = join(dir, &candidate_name(name, attempt));
        match store.move_file(src, &path) {
            Ok(()) => return Ok(path),
            Err(err) if err.is_conflict() && attempt < MAX_NAME_ATTEMPTS => attempt += 1,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
