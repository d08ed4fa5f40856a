use anyhow::{bail, Context, Result};
use jobgraph::cli::commands::{
    ForceCommand, GraphCommand, HistoryCommand, ListCommand, PushCommand, RunCommand, ValidateCommand,
};
use jobgraph::cli::output::*;
use jobgraph::cli::{Cli, Command};
use jobgraph::core::config::MasterConfig;
use jobgraph::core::{BuildRecord, BuildResult, Master, PropertyBag, TriggerEvent};
use jobgraph::execution::ExecutionEngine;
use jobgraph::persistence::{summarize, BuildSummary, InMemoryPersistence, PersistenceBackend, SqliteHistoryStore};
use jobgraph::worker::WorkerPool;
use indicatif::ProgressBar;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    // Execute command
    let status = match &cli.command {
        Command::Run(cmd) => run_builder(&cli.config, cmd).await?,
        Command::Force(cmd) => force_scheduler(&cli.config, cmd).await?,
        Command::Push(cmd) => push_event(&cli.config, cmd).await?,
        Command::Validate(cmd) => validate_config(&cli.config, cmd)?,
        Command::Graph(cmd) => show_graph(&cli.config, cmd)?,
        Command::List(cmd) => list_builders(&cli.config, cmd).await?,
        Command::History(cmd) => show_history(&cli.config, cmd).await?,
    };

    if !status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn load_master(path: &Path) -> Result<Master> {
    let config = MasterConfig::from_file(path).context("Failed to load master configuration")?;
    println!("{} Loaded master: {}", INFO, style(&config.name).bold());
    Ok(config.to_master())
}

fn properties_from(pairs: &[(String, String)]) -> PropertyBag {
    for (key, value) in pairs {
        println!("{} Property: {} = {}", INFO, style(key).cyan(), style(value).dim());
    }
    PropertyBag::from_pairs(pairs.iter().cloned(), "Command")
}

async fn open_store(master: &Master, no_history: bool) -> Result<Arc<dyn PersistenceBackend>> {
    if no_history {
        return Ok(Arc::new(InMemoryPersistence::new()));
    }
    Ok(Arc::new(SqliteHistoryStore::open(master.settings.history_db.as_deref()).await?))
}

/// Create an engine that prints events and cancels on Ctrl-C
async fn create_engine(master: Master) -> (ExecutionEngine, ProgressBar) {
    let pool = WorkerPool::local(&master.settings);
    let engine = ExecutionEngine::new(master, pool);

    let spinner = create_spinner("running");
    let printer = EventPrinter::new();
    let output = spinner.clone();
    engine
        .add_event_handler(move |event| output.println(printer.format(&event)))
        .await;

    let cancel = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling builds");
            cancel.cancel();
        }
    });

    (engine, spinner)
}

/// Wait for detached builds, save history and print the outcome
async fn finish(
    engine: &ExecutionEngine,
    spinner: ProgressBar,
    store: Arc<dyn PersistenceBackend>,
    records: Vec<BuildRecord>,
    no_history: bool,
) -> Result<BuildResult> {
    let background = engine.wait_background().await;
    spinner.finish_and_clear();

    let mut status = BuildResult::Success;
    println!("\n{}", separator());
    for record in records.iter().chain(background.iter()) {
        print!("{}", format_build_tree(record));
        for build in record.flatten() {
            for step in build.steps.iter().filter(|s| s.result.is_failure() && !s.output.is_empty()) {
                println!("{} {} / {}:", WARN, style(&build.builder).bold(), step.name);
                println!("{}", format_output(&step.output, 10));
            }
        }
        for summary in summarize(record) {
            store.save_build(&summary).await?;
        }
    }
    // Only the requested builds decide the exit status
    for record in &records {
        status = status.worst(record.status);
    }

    if !no_history {
        println!("\n{} Builds saved to history", INFO);
    }

    if status.is_success() {
        println!("\n{} Completed {}", CHECK, style("successfully").green());
    } else {
        println!("\n{} Finished with status {}", CROSS, format_status(status));
    }
    Ok(status)
}

async fn run_builder(config: &Path, cmd: &RunCommand) -> Result<BuildResult> {
    let master = load_master(config)?;
    let store = open_store(&master, cmd.no_history).await?;
    let properties = properties_from(&cmd.properties);

    let (engine, spinner) = create_engine(master).await;
    println!();
    let record = engine.invoke(&cmd.builder, properties).await?;
    finish(&engine, spinner, store, vec![record], cmd.no_history).await
}

async fn force_scheduler(config: &Path, cmd: &ForceCommand) -> Result<BuildResult> {
    let master = load_master(config)?;
    let store = open_store(&master, cmd.no_history).await?;
    let properties = properties_from(&cmd.properties);

    let (engine, spinner) = create_engine(master).await;
    println!();
    let records = engine.force(&cmd.scheduler, properties).await?;
    finish(&engine, spinner, store, records, cmd.no_history).await
}

async fn push_event(config: &Path, cmd: &PushCommand) -> Result<BuildResult> {
    let master = load_master(config)?;
    let store = open_store(&master, cmd.no_history).await?;
    let event = TriggerEvent::Push {
        repository: cmd.repository.clone(),
        branch: cmd.branch.clone(),
        revision: cmd.revision.clone(),
    };

    let (engine, spinner) = create_engine(master).await;
    println!();
    let records = engine.dispatch(&event).await?;
    if records.is_empty() {
        println!("{} No scheduler matched branch {}", WARN, style(&cmd.branch).bold());
    }
    finish(&engine, spinner, store, records, cmd.no_history).await
}

fn validate_config(config: &Path, cmd: &ValidateCommand) -> Result<BuildResult> {
    println!("{} Validating configuration...", INFO);

    match MasterConfig::from_file(config) {
        Ok(master) => {
            println!("{} Configuration is valid!", CHECK);
            println!("  Name: {}", style(&master.name).bold());
            println!("  Workers: {}", style(master.settings.workers.len()).cyan());
            println!("  Builders: {}", style(master.builders.len()).cyan());
            println!("  Schedulers: {}", style(master.schedulers.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&master)?;
                println!("\n{}", json);
            }
            Ok(BuildResult::Success)
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            Ok(BuildResult::Failure)
        }
    }
}

fn show_graph(config: &Path, cmd: &GraphCommand) -> Result<BuildResult> {
    let master = load_master(config)?;

    let roots: Vec<String> = match &cmd.builder {
        Some(builder) => {
            if master.builder(builder).is_none() {
                bail!("Unknown builder '{}'", builder);
            }
            vec![builder.clone()]
        }
        None => master.graph.roots().into_iter().map(String::from).collect(),
    };

    for root in roots {
        print!("{}", format_call_tree(&master.graph.call_tree(&root)));
    }
    Ok(BuildResult::Success)
}

async fn list_builders(config: &Path, cmd: &ListCommand) -> Result<BuildResult> {
    let master = load_master(config)?;

    let store = if cmd.with_counts {
        Some(SqliteHistoryStore::open(master.settings.history_db.as_deref()).await?)
    } else {
        None
    };

    println!("{} Builders:", INFO);
    let mut json_builders = Vec::new();
    for builder in &master.builders {
        let history = match &store {
            Some(store) => store.list_builds(&builder.name).await?,
            None => Vec::new(),
        };
        if cmd.with_counts {
            let succeeded = history.iter().filter(|b| b.status.is_success()).count();
            println!(
                "  {} ({} builds: {} succeeded, {} not)",
                style(&builder.name).bold(),
                style(history.len()).cyan(),
                style(succeeded).green(),
                style(history.len() - succeeded).red()
            );
        } else {
            println!(
                "  {} {}",
                style(&builder.name).bold(),
                style(format!("{} steps", builder.steps.len())).dim()
            );
        }
        json_builders.push(serde_json::json!({
            "name": builder.name,
            "steps": builder.steps.len(),
            "tags": builder.tags,
            "build_count": history.len(),
        }));
    }

    println!("{} Schedulers:", INFO);
    for scheduler in &master.schedulers {
        println!(
            "  {} {} → {}",
            style(&scheduler.name).bold(),
            style(scheduler.kind.as_str()).dim(),
            scheduler.builders.join(", ")
        );
    }

    if cmd.json {
        let data = serde_json::json!({ "builders": json_builders });
        println!("\n{}", serde_json::to_string_pretty(&data)?);
    }

    Ok(BuildResult::Success)
}

async fn show_history(config: &Path, cmd: &HistoryCommand) -> Result<BuildResult> {
    // History stays readable when the configuration does not load
    let history_db = match MasterConfig::from_file(config) {
        Ok(master) => master.settings.history_db,
        Err(e) => {
            error!("{:#}", e);
            None
        }
    };
    let store = SqliteHistoryStore::open(history_db.as_deref()).await?;

    // If specific execution ID is requested
    if let Some(exec_id_str) = &cmd.execution_id {
        let exec_id = uuid::Uuid::parse_str(exec_id_str).context("Invalid execution ID format")?;
        match store.load_build(exec_id).await? {
            Some(summary) => print_build_details(&summary, cmd.details)?,
            None => println!("{} Build not found", WARN),
        }
        return Ok(BuildResult::Success);
    }

    let mut builds = Vec::new();
    match &cmd.builder {
        Some(builder) => builds.extend(store.list_builds(builder).await?),
        None => {
            for builder in store.list_builders().await? {
                builds.extend(store.list_builds(&builder).await?);
            }
        }
    }
    builds.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    builds.truncate(cmd.limit);

    if builds.is_empty() {
        println!("{} No builds found", INFO);
        return Ok(BuildResult::Success);
    }

    println!("{} Build history (showing latest {}):", INFO, cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "builds": builds });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        for summary in &builds {
            println!("  {}", format_build_summary(summary));
        }
    }

    Ok(BuildResult::Success)
}

fn print_build_details(summary: &BuildSummary, details: bool) -> Result<()> {
    println!("{} Build Details", INFO);
    println!("  ID: {}", style(summary.execution_id).cyan());
    println!("  Builder: {} #{}", style(&summary.builder).bold(), summary.build_number);
    println!("  Status: {}", format_status(summary.status));
    if let Some(parent) = summary.parent {
        println!("  Triggered by: {}", style(parent).dim());
    }
    if let Some(worker) = &summary.worker {
        println!("  Worker: {}", style(worker).cyan());
    }
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    println!("  Completed: {}", style(summary.completed_at.to_rfc3339()).dim());
    if let Ok(duration) = summary.completed_at.signed_duration_since(summary.started_at).to_std() {
        println!("  Duration: {}", style(format_duration(duration)).dim());
    }
    println!(
        "  Steps: {} ({}/{})",
        style(format!("{:.0}%", summary.progress() * 100.0)).cyan(),
        summary.executed_steps,
        summary.total_steps
    );
    if let Some(error) = &summary.error {
        println!("  Error: {}", style(error).red());
    }

    if details {
        println!("\n  {}", style("Full details:").bold());
        let json = serde_json::to_string_pretty(summary)?;
        for line in json.lines() {
            println!("    {}", line);
        }
    }

    Ok(())
}

fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
