//! CLI command definitions

use clap::Args;

/// Invoke a builder directly
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Builder to run
    pub builder: String,

    /// Property values (key=value)
    #[arg(short, long = "property", value_parser = parse_key_value)]
    pub properties: Vec<(String, String)>,

    /// Don't save the build to history
    #[arg(long)]
    pub no_history: bool,
}

/// Fire a force scheduler
#[derive(Debug, Args, Clone)]
pub struct ForceCommand {
    /// Force scheduler name
    pub scheduler: String,

    /// Property values (key=value)
    #[arg(short, long = "property", value_parser = parse_key_value)]
    pub properties: Vec<(String, String)>,

    /// Don't save the builds to history
    #[arg(long)]
    pub no_history: bool,
}

/// Simulate a push to a repository
#[derive(Debug, Args, Clone)]
pub struct PushCommand {
    /// Branch that was pushed
    pub branch: String,

    /// Repository URL
    #[arg(short, long, default_value = "")]
    pub repository: String,

    /// Pushed revision
    #[arg(long)]
    pub revision: Option<String>,

    /// Don't save the builds to history
    #[arg(long)]
    pub no_history: bool,
}

/// Validate a master configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the trigger graph
#[derive(Debug, Args, Clone)]
pub struct GraphCommand {
    /// Unfold the call tree below this builder (all roots when omitted)
    pub builder: Option<String>,
}

/// List builders and schedulers
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show build counts from history
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show build history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Builder name to filter by
    #[arg(short, long)]
    pub builder: Option<String>,

    /// Number of recent builds to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show full details
    #[arg(long)]
    pub details: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a single build by execution ID
    #[arg(long)]
    pub execution_id: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("Empty property name: {}", s)),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("Invalid key=value pair: {}", s)),
    }
}
