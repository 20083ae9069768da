//! Command implementations.
//!
//! Each command gets a [`RunContext`] (configuration plus a connected
//! store) from `main` and keeps its own output formatting.
mod context;
mod init;
mod run;
mod status;

pub use context::RunContext;
pub use init::{ensure_layout, run_init};
pub use run::run_run;
pub use status::run_status;
