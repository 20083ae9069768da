//! The `run` command: one stage pass plus bookkeeping.
//!
//! Order of operations:
//! 1. record `run_start` and make sure the layout exists (best effort)
//! 2. load the ledger
//! 3. pick the stage with unprocessed work, if any
//! 4. run the stage pass
//! 5. save the ledger (`write_state`), record `run_end` ("nothing to do"
//!    when no stage was picked)
//! 6. flush the audit log
//!
//! Bookkeeping failures are recorded and logged, never escalated; only a
//! fatal store error during the pass marks the run as failed.
use super::{ensure_layout, RunContext};
use crate::audit::{AuditEvent, AuditFields, AuditLog};
use crate::config::RunConfig;
use crate::ledger::StateLedger;
use crate::processor::{PassReport, StageRun};
use crate::selector::select_stage;
use crate::stage::StageKind;
use crate::store::BlobStore;
use crate::transform::{FeedbackFill, PassThrough, Transform};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::time::Instant;

/// Outcome of one invocation, printed by `monthly run`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    /// Stage that ran, if any had pending work.
    pub stage: Option<String>,
    pub report: Option<PassReport>,
    pub state_saved: bool,
    /// Store path of the audit log, if it was written.
    pub audit_log: Option<String>,
    /// Set when a fatal store error cut the run short.
    pub fatal: Option<String>,
}

impl RunSummary {
    pub fn failed(&self) -> bool {
        self.fatal.is_some()
    }
}

/// Execute one run against `store`. Never fails; failures land in the
/// summary and the audit log.
pub fn execute(config: &RunConfig, store: &dyn BlobStore) -> RunSummary {
    let start = Instant::now();
    let hint = config.stage_hint.as_str();
    let mut audit = AuditLog::new(config.run_id.as_str());
    let mut summary = RunSummary {
        run_id: config.run_id.clone(),
        ..RunSummary::default()
    };
    audit.record(
        hint,
        AuditEvent::RunStart,
        AuditFields::new().message(format!(
            "store={} max_files_per_run={}",
            store.describe(),
            config.max_files_per_run
        )),
    );

    if let Err(err) = ensure_layout(config, store) {
        tracing::warn!(error = %err, "could not ensure stage directories");
        if err.is_fatal() {
            let message = format!("ensure layout: {err}");
            audit.record(hint, AuditEvent::Error, AuditFields::new().message(message.clone()));
            audit.record(hint, AuditEvent::RunEnd, AuditFields::new().message("aborted"));
            summary.fatal = Some(message);
            summary.audit_log = audit.flush(store, &config.logs_dir);
            return summary;
        }
    }
    let mut ledger = StateLedger::load(store, &config.state_path);

    let stage = match select_stage(
        store,
        &config.pipeline,
        &config.stage_hint,
        &config.filter,
        &ledger,
    ) {
        Ok(stage) => stage,
        Err(err) => {
            let message = format!("{err:#}");
            tracing::error!(error = %message, "stage selection failed");
            audit.record(hint, AuditEvent::Error, AuditFields::new().message(message.clone()));
            audit.record(hint, AuditEvent::RunEnd, AuditFields::new().message("aborted"));
            summary.fatal = Some(message);
            summary.audit_log = audit.flush(store, &config.logs_dir);
            return summary;
        }
    };
    let stage_id = stage.map_or(hint, |stage| stage.id.as_str());
    summary.stage = stage.map(|stage| stage.id.to_string());

    match stage {
        Some(stage) => {
            let mut transform: Box<dyn Transform> = match stage.kind {
                StageKind::PassThrough => Box::new(PassThrough),
                StageKind::FeedbackFill => Box::new(FeedbackFill::new(
                    config.feedback.clone(),
                    config.lm.clone(),
                )),
            };
            let pass = StageRun {
                store,
                pipeline: &config.pipeline,
                filter: &config.filter,
                max_files: config.max_files_per_run,
                run_id: &config.run_id,
            };
            match pass.run(stage, transform.as_mut(), &mut ledger, &mut audit) {
                Ok(report) => summary.report = Some(report),
                Err(err) => {
                    let message = format!("{err:#}");
                    tracing::error!(stage = stage_id, error = %message, "stage pass aborted");
                    summary.fatal = Some(message);
                }
            }
        }
        None => tracing::info!("no stage has pending files"),
    }

    match ledger.save(store, &config.state_path, Utc::now()) {
        Ok(()) => {
            summary.state_saved = true;
            audit.record(
                stage_id,
                AuditEvent::WriteState,
                AuditFields::new()
                    .dst(config.state_path.as_str())
                    .count(ledger.len()),
            );
        }
        Err(err) => {
            tracing::warn!(path = %config.state_path, error = %format!("{err:#}"), "state ledger not saved");
            audit.record(
                stage_id,
                AuditEvent::Error,
                AuditFields::new()
                    .dst(config.state_path.as_str())
                    .message(format!("state save failed: {err:#}")),
            );
        }
    }

    let end_message = match (&summary.report, stage) {
        (Some(report), _) => format!(
            "processed={} skipped={} failed={} deferred={}",
            report.processed, report.skipped, report.failed, report.deferred
        ),
        (None, None) => "nothing to do".to_string(),
        (None, Some(_)) => "aborted".to_string(),
    };
    let processed = summary.report.as_ref().map_or(0, |report| report.processed);
    audit.record(
        stage_id,
        AuditEvent::RunEnd,
        AuditFields::new().count(processed).message(end_message),
    );
    summary.audit_log = audit.flush(store, &config.logs_dir);
    tracing::info!(
        stage = stage_id,
        processed,
        elapsed_ms = start.elapsed().as_millis(),
        "run complete"
    );
    summary
}

/// Run the `run` command and print its summary.
pub fn run_run(ctx: &RunContext, json: bool) -> Result<RunSummary> {
    let summary = execute(&ctx.config, ctx.store.as_ref());
    if json {
        let text = serde_json::to_string_pretty(&summary).context("serialize run summary")?;
        println!("{text}");
        return Ok(summary);
    }
    match (&summary.stage, &summary.report) {
        (None, _) if summary.fatal.is_none() => println!("run {}: nothing to do", summary.run_id),
        (Some(stage), Some(report)) => println!(
            "run {}: stage {stage} processed {} (skipped {}, failed {}, deferred {})",
            summary.run_id, report.processed, report.skipped, report.failed, report.deferred
        ),
        _ => {}
    }
    if let Some(fatal) = &summary.fatal {
        eprintln!("run {} aborted: {fatal}", summary.run_id);
    }
    if let Some(path) = &summary.audit_log {
        println!("audit log: {path}");
    }
    Ok(summary)
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
