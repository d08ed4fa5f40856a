//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    ForceCommand, GraphCommand, HistoryCommand, ListCommand, PushCommand, RunCommand, ValidateCommand,
};
use std::ffi::OsString;
use std::path::PathBuf;

/// Run builder pipelines defined as a trigger graph
#[derive(Debug, Parser, Clone)]
#[command(name = "jobgraph")]
#[command(author = "Jobgraph Contributors")]
#[command(version = "0.1.0")]
#[command(about = "A CI master that runs builder pipelines as a trigger graph", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the master configuration file
    #[arg(short, long, global = true, default_value = "jobgraph.yaml")]
    pub config: PathBuf,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Invoke a builder with properties
    Run(RunCommand),

    /// Fire a force scheduler
    Force(ForceCommand),

    /// Dispatch a push event to matching schedulers
    Push(PushCommand),

    /// Validate the master configuration
    Validate(ValidateCommand),

    /// Show the trigger graph
    Graph(GraphCommand),

    /// List builders and schedulers
    List(ListCommand),

    /// Show build history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
