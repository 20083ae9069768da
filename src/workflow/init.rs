//! Directory bootstrap.
use super::RunContext;
use crate::config::RunConfig;
use crate::store::{BlobStore, StoreResult};
use anyhow::{Context, Result};

/// Create every stage, log and state directory. Stops at the first failure.
pub fn ensure_layout(config: &RunConfig, store: &dyn BlobStore) -> StoreResult<Vec<String>> {
    let mut ensured = Vec::new();
    for dir in config.layout_dirs() {
        if dir == "/" {
            continue;
        }
        store.ensure_dir(&dir)?;
        ensured.push(dir);
    }
    Ok(ensured)
}

/// Run the init command.
pub fn run_init(ctx: &RunContext) -> Result<()> {
    let ensured = ensure_layout(&ctx.config, ctx.store.as_ref())
        .with_context(|| format!("create layout in {}", ctx.store.describe()))?;
    for dir in &ensured {
        println!("ensured {dir}");
    }
    tracing::info!(dirs = ensured.len(), "layout ready");
    Ok(())
}
