//! The `status` command: a read-only view of the pipeline.
use super::RunContext;
use crate::config::RunConfig;
use crate::ledger::StateLedger;
use crate::selector::{pending_files, unprocessed_count, StageHint};
use crate::stage::StageKind;
use crate::store::BlobStore;
use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub id: String,
    pub name: String,
    pub kind: StageKind,
    pub input_dir: String,
    pub output_dir: String,
    pub done_dir: String,
    /// Relevant files waiting in IN; `None` when listing failed.
    pub pending: Option<usize>,
    /// Pending files not yet in the ledger; only these make a stage runnable.
    pub unprocessed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Ledger entries recorded for this stage.
    pub processed_keys: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub store: String,
    pub stage_hint: String,
    pub max_files_per_run: usize,
    pub extensions: Vec<String>,
    pub state_path: String,
    pub ledger_entries: usize,
    pub stages: Vec<StageStatus>,
    /// Stage the next `run` would pick.
    pub next_stage: Option<String>,
}

/// Inspect every stage without changing anything.
///
/// Non-fatal listing failures are reported per stage; fatal ones abort.
pub fn status_summary(config: &RunConfig, store: &dyn BlobStore) -> Result<StatusSummary> {
    let ledger = StateLedger::load(store, &config.state_path);
    let mut stages = Vec::new();
    for stage in config.pipeline.stages() {
        let (pending, unprocessed, error) = match pending_files(store, stage, &config.filter) {
            Ok(files) => (
                Some(files.len()),
                Some(unprocessed_count(stage, &files, &ledger)),
                None,
            ),
            Err(err) if err.is_fatal() => {
                return Err(err).with_context(|| format!("list {}", stage.input_dir));
            }
            Err(err) => (None, None, Some(err.to_string())),
        };
        stages.push(StageStatus {
            id: stage.id.to_string(),
            name: stage.name.clone(),
            kind: stage.kind,
            input_dir: stage.input_dir.clone(),
            output_dir: stage.output_dir.clone(),
            done_dir: stage.done_dir.clone(),
            pending,
            unprocessed,
            error,
            processed_keys: ledger.count_for_stage(&stage.id),
        });
    }

    let start = match &config.stage_hint {
        StageHint::Auto => 0,
        StageHint::Stage(id) => config.pipeline.position(id).unwrap_or(0),
    };
    let next_stage = (0..stages.len())
        .map(|offset| &stages[(start + offset) % stages.len()])
        .find(|stage| stage.unprocessed.is_some_and(|count| count > 0))
        .map(|stage| stage.id.clone());

    Ok(StatusSummary {
        store: store.describe(),
        stage_hint: config.stage_hint.to_string(),
        max_files_per_run: config.max_files_per_run,
        extensions: config.filter.extensions().to_vec(),
        state_path: config.state_path.clone(),
        ledger_entries: ledger.len(),
        stages,
        next_stage,
    })
}

/// Run the status command.
pub fn run_status(ctx: &RunContext, json: bool) -> Result<()> {
    let summary = status_summary(&ctx.config, ctx.store.as_ref())?;
    if json {
        let text = serde_json::to_string_pretty(&summary).context("serialize status")?;
        println!("{text}");
        return Ok(());
    }

    println!("store: {}", summary.store);
    println!("extensions: {}", summary.extensions.join(", "));
    println!(
        "state: {} ({} entries)",
        summary.state_path, summary.ledger_entries
    );
    for stage in &summary.stages {
        let pending = match (&stage.pending, &stage.error) {
            (Some(count), _) => match stage.unprocessed {
                Some(fresh) if fresh < *count => format!("{count} pending ({fresh} new)"),
                _ => format!("{count} pending"),
            },
            (None, Some(err)) => format!("unavailable ({err})"),
            (None, None) => "unavailable".to_string(),
        };
        println!(
            "  stage {} {:<16} {:<13} {pending}, {} processed",
            stage.id,
            stage.name,
            stage.kind.as_str(),
            stage.processed_keys
        );
    }
    match &summary.next_stage {
        Some(id) => println!("next: stage {id} (cap {})", summary.max_files_per_run),
        None => println!("next: nothing to do"),
    }
    Ok(())
}
