use crate::core::models::RunDirs;
use crate::core::state::{RunState, StageStatus};
use colored::*;

const RULE: &str = "═══════════════════════════════════════";

pub fn print_summary(state: &RunState, dirs: &RunDirs) {
    let headline = if state.aborted.is_some() {
        "skillcrawler Run Aborted".red().bold()
    } else {
        "skillcrawler Run Complete".green().bold()
    };
    eprintln!("\n{}", RULE.green().bold());
    eprintln!("{}", headline);
    eprintln!("{}", RULE.green().bold());

    eprintln!("\n{}: {}", "Pipeline".cyan().bold(), state.pipeline);
    eprintln!("{}: {}", "Run ID".cyan().bold(), state.run_id);
    eprintln!(
        "{}: {} initial, {} final",
        "Targets".cyan().bold(),
        state.initial_targets.len(),
        state.final_targets.len()
    );

    eprintln!("\n{}", "Stages:".yellow().bold());
    for stage in &state.stages {
        let status = match stage.status {
            StageStatus::Completed => "completed".green(),
            StageStatus::Skipped => "skipped".yellow(),
            StageStatus::Aborted => "aborted".red(),
            StageStatus::Pending | StageStatus::Running => "not run".dimmed(),
        };
        eprintln!(
            "  • {} [{}] cells {} ok / {} timeout / {} failed, records {} ({} assets, {} findings)",
            stage.name.cyan(),
            status,
            stage.completed.to_string().green().bold(),
            stage.timed_out,
            stage.failed,
            stage.records,
            stage.assets,
            stage.findings
        );
    }

    if !state.failures.is_empty() {
        eprintln!("\n{} {}", "Failures:".yellow().bold(), state.failures.len().to_string().red().bold());
        for failure in &state.failures {
            eprintln!("  • {}", failure);
        }
    }
    if !state.out_of_scope.is_empty() {
        eprintln!("{} {}", "Out of scope:".yellow().bold(), state.out_of_scope.len());
    }
    if !state.dropped_targets.is_empty() {
        eprintln!("{} {}", "Dropped by cap:".yellow().bold(), state.dropped_targets.len());
    }
    if let Some(reason) = &state.aborted {
        eprintln!("\n{} {}", "Aborted:".red().bold(), reason);
    }

    eprintln!(
        "\n{}",
        format!("{} records written to {}", state.records, dirs.log_file.display()).dimmed()
    );
}
