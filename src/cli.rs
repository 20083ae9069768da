//! CLI argument parsing for the monthly relay.
//!
//! Flags mirror the environment variables the scheduled job uses; a flag
//! always wins over its variable so a local run can be re-pointed without
//! editing the environment.
use crate::config::Overrides;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "monthly",
    version,
    about = "Stage-by-stage relay for monthly report workbooks",
    after_help = "Commands:\n  run      Process one stage with pending files\n  status   Show pending files per stage\n  init     Create every stage, log and state directory\n\nExamples:\n  monthly run\n  monthly run --stage 20 --max-files 5\n  monthly --store local --root /tmp/monthly init\n  monthly --store local --root /tmp/monthly status --json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Status(StatusArgs),
    Init(InitArgs),
}

/// Which store backs the stage folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Dropbox,
    /// A local directory tree, for dry runs.
    Local,
}

#[derive(Args, Debug)]
pub struct StoreArgs {
    /// Storage backend
    #[arg(long, global = true, value_enum, default_value_t = StoreKind::Dropbox)]
    pub store: StoreKind,

    /// Root directory for the local store
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Process one stage with pending files")]
pub struct RunArgs {
    /// Stage to start scanning from (`auto`, `00`, `10`, ...); overrides MONTHLY_STAGE
    #[arg(long, value_name = "ID")]
    pub stage: Option<String>,

    /// Cap on files processed this run; overrides MAX_FILES_PER_RUN
    #[arg(long, value_name = "N")]
    pub max_files: Option<usize>,

    /// Completion model; overrides OPENAI_MODEL
    #[arg(long)]
    pub model: Option<String>,

    /// Feedback length (light, medium, heavy); overrides DEPTH
    #[arg(long)]
    pub depth: Option<String>,

    /// Completion request timeout in seconds; overrides OPENAI_TIMEOUT
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Prompt input cap; overrides MAX_INPUT_CHARS
    #[arg(long, value_name = "N")]
    pub max_input_chars: Option<usize>,

    /// Completion output cap; overrides OPENAI_MAX_OUTPUT_TOKENS
    #[arg(long, value_name = "N")]
    pub max_output_tokens: Option<u32>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            stage: self.stage.clone(),
            max_files: self.max_files,
            model: self.model.clone(),
            depth: self.depth.clone(),
            timeout_secs: self.timeout,
            max_input_chars: self.max_input_chars,
            max_output_tokens: self.max_output_tokens,
        }
    }
}

#[derive(Parser, Debug)]
#[command(about = "Show pending files per stage without changing anything")]
pub struct StatusArgs {
    /// Start the next-stage scan here instead of MONTHLY_STAGE
    #[arg(long, value_name = "ID")]
    pub stage: Option<String>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Create every stage, log and state directory")]
pub struct InitArgs {}
