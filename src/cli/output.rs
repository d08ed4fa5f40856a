//! CLI output formatting

use crate::{
    core::{graph::CallNode, state::BuildRecord, state::BuildResult},
    execution::ExecutionEvent,
    persistence::BuildSummary,
};
use console::{Emoji, Term};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static LOCK: Emoji<'_, '_> = Emoji("🔒 ", "# ");

/// Create a spinner shown while builds run
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        spinner.set_style(template);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// A horizontal rule as wide as the terminal
pub fn separator() -> String {
    let (_, width) = Term::stdout().size();
    "─".repeat(usize::from(width).clamp(20, 120))
}

/// Format a build result for display
pub fn format_status(status: BuildResult) -> String {
    match status {
        BuildResult::Success => style("SUCCESS").green().to_string(),
        BuildResult::Skipped => style("SKIPPED").dim().to_string(),
        BuildResult::Failure => style("FAILURE").red().to_string(),
        BuildResult::Exception => style("EXCEPTION").magenta().to_string(),
        BuildResult::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

fn status_icon(status: BuildResult) -> Emoji<'static, 'static> {
    match status {
        BuildResult::Success => CHECK,
        BuildResult::Skipped => SKIP,
        BuildResult::Cancelled => WARN,
        BuildResult::Failure | BuildResult::Exception => CROSS,
    }
}

fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a build summary for display
pub fn format_build_summary(summary: &BuildSummary) -> String {
    format!(
        "{} {} - {} #{} - {} ({}/{}) - {}",
        status_icon(summary.status),
        style(short_id(&summary.execution_id)).dim(),
        style(&summary.builder).bold(),
        summary.build_number,
        format_status(summary.status),
        summary.executed_steps,
        summary.total_steps,
        style(summary.worker.as_deref().unwrap_or("-")).cyan()
    )
}

/// Renders execution events, indented by trigger depth
#[derive(Default)]
pub struct EventPrinter {
    depths: Mutex<HashMap<Uuid, usize>>,
}

impl EventPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    fn depth(&self, id: &Uuid) -> usize {
        self.depths
            .lock()
            .map(|d| d.get(id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Format an execution event for display
    pub fn format(&self, event: &ExecutionEvent) -> String {
        let (depth, line) = match event {
            ExecutionEvent::BuildStarted {
                execution_id,
                builder,
                build_number,
                worker,
                parent,
            } => {
                let depth = parent.map(|p| self.depth(&p) + 1).unwrap_or(0);
                if let Ok(mut depths) = self.depths.lock() {
                    depths.insert(*execution_id, depth);
                }
                (
                    depth,
                    format!(
                        "{}{} #{} on {} ({})",
                        ROCKET,
                        style(builder).bold(),
                        build_number,
                        style(worker).cyan(),
                        style(short_id(execution_id)).dim()
                    ),
                )
            }
            ExecutionEvent::StepStarted { execution_id, step, .. } => (
                self.depth(execution_id) + 1,
                format!("{}{}", SPINNER, style(step).cyan()),
            ),
            ExecutionEvent::StepFinished {
                execution_id,
                step,
                result,
                reason,
                ..
            } => {
                let mut line = format!("{}{} {}", status_icon(*result), step, format_status(*result));
                if let Some(reason) = reason {
                    line.push_str(&format!(": {}", style(reason).dim()));
                }
                (self.depth(execution_id) + 1, line)
            }
            ExecutionEvent::StepSkipped {
                execution_id,
                step,
                reason,
                ..
            } => (
                self.depth(execution_id) + 1,
                format!("{}{} ({})", SKIP, style(step).dim(), style(reason).dim()),
            ),
            ExecutionEvent::BuildTriggered {
                parent,
                scheduler,
                builder,
                wait_for_finish,
                ..
            } => (
                self.depth(parent) + 1,
                format!(
                    "{}{} → {} {}",
                    INFO,
                    style(scheduler).dim(),
                    style(builder).bold(),
                    if *wait_for_finish { "(waiting)" } else { "(detached)" }
                ),
            ),
            ExecutionEvent::LocksAcquired { execution_id, keys } => (
                self.depth(execution_id) + 1,
                format!("{}locked {}", LOCK, style(keys.join(", ")).dim()),
            ),
            ExecutionEvent::LocksReleased { execution_id, keys } => (
                self.depth(execution_id) + 1,
                format!("{}released {}", LOCK, style(keys.join(", ")).dim()),
            ),
            ExecutionEvent::BuildFinished {
                execution_id,
                builder,
                build_number,
                status,
            } => (
                self.depth(execution_id),
                format!(
                    "{}{} #{} {}",
                    status_icon(*status),
                    style(builder).bold(),
                    build_number,
                    format_status(*status)
                ),
            ),
        };
        format!("{}{}", "  ".repeat(depth), line)
    }
}

/// Format the unfolded call tree below a builder
pub fn format_call_tree(node: &CallNode) -> String {
    let mut out = String::new();
    write_call_node(node, 0, &mut out);
    out
}

fn write_call_node(node: &CallNode, depth: usize, out: &mut String) {
    out.push_str(&"  ".repeat(depth));
    out.push_str(&style(&node.builder).bold().to_string());
    if let Some(edge) = &node.via {
        let mode = if edge.sync { "sync" } else { "async" };
        out.push_str(&format!(
            " {}",
            style(format!("[{} via {}, {}]", edge.step, edge.scheduler, mode)).dim()
        ));
        if edge.always_run {
            out.push_str(&format!(" {}", style("always").yellow()));
        }
    }
    if node.recursive {
        out.push_str(&format!(" {}", style("(recursive)").yellow()));
    }
    out.push('\n');
    for child in &node.children {
        write_call_node(child, depth + 1, out);
    }
}

/// Format a finished build and its synchronous children
pub fn format_build_tree(record: &BuildRecord) -> String {
    let mut out = String::new();
    write_build(record, 0, &mut out);
    out
}

fn write_build(record: &BuildRecord, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    out.push_str(&format!(
        "{}{}{} #{} {}\n",
        indent,
        status_icon(record.status),
        style(&record.builder).bold(),
        record.build_number,
        format_status(record.status)
    ));
    if let Some(error) = &record.error {
        out.push_str(&format!("{}  {}\n", indent, style(error).red()));
    }
    for step in &record.steps {
        out.push_str(&format!("{}  {}{}", indent, status_icon(step.result), step.name));
        if let Some(reason) = step.reason.as_deref().filter(|r| !r.is_empty()) {
            out.push_str(&format!(" {}", style(format!("({})", reason)).dim()));
        }
        out.push('\n');
        for child in record.children.iter().filter(|c| step.triggered.contains(&c.execution_id)) {
            write_build(child, depth + 2, out);
        }
    }
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}
