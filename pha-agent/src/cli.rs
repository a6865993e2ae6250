//! `phagentd` command-line surface: almost entirely a service binary, plus
//! a `doctor` subcommand for pre-flight diagnostics (mirrors the teacher's
//! `code speckit pm service doctor`, SPEC_FULL §11 test tooling).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "phagentd", version, about = "Privacy hardening policy agent")]
pub struct Cli {
    /// Override the config file path (default: the platform config dir's
    /// `phagentd/config.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent: start the IPC listener and the drift monitor. This
    /// is the default when no subcommand is given.
    Serve,
    /// Validate the configuration, catalog, and store without starting the
    /// IPC listener; exits non-zero on the first problem found.
    Doctor,
}
