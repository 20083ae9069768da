use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod audit;
mod cli;
mod config;
mod ledger;
mod lm;
mod processor;
mod selector;
mod stage;
mod store;
mod transform;
mod util;
mod workflow;

use cli::{Command, RootArgs};
use config::Overrides;
use workflow::RunContext;

/// Configuration or store connection failed before any stage work.
const EXIT_SETUP: u8 = 2;

fn main() -> ExitCode {
    init_tracing();
    let args = RootArgs::parse();

    let overrides = match &args.command {
        Command::Run(run) => run.overrides(),
        Command::Status(status) => Overrides {
            stage: status.stage.clone(),
            ..Overrides::default()
        },
        Command::Init(_) => Overrides::default(),
    };
    let ctx = match RunContext::open(&args.store, &overrides) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(EXIT_SETUP);
        }
    };

    let result = match &args.command {
        Command::Run(run) => {
            workflow::run_run(&ctx, run.json).map(|summary| !summary.failed())
        }
        Command::Status(status) => workflow::run_status(&ctx, status.json).map(|()| true),
        Command::Init(_) => workflow::run_init(&ctx).map(|()| true),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
