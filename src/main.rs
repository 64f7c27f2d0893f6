//! Metamorph CLI
//!
//! The entry point for the self-modification engine. Handles CLI args,
//! config loading, and dispatching submissions, rollbacks, and queries
//! to the engine.

use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

use metamorph::config;
use metamorph::engine::MutationEngine;
use metamorph::types::{ApplyOptions, Change, ModificationState, TransformDirective};

const VERSION: &str = "0.1.0";

/// Metamorph -- Runtime Self-Modification Engine
#[derive(Parser, Debug)]
#[command(
    name = "metamorph",
    version = VERSION,
    about = "Metamorph -- Runtime Self-Modification Engine"
)]
struct Cli {
    /// Apply a JSON change batch from FILE
    #[arg(long, value_name = "FILE")]
    apply: Option<String>,

    /// Run transformation directives from FILE and apply the result
    #[arg(long, value_name = "FILE")]
    transform: Option<String>,

    /// Stop after validation and backup, writing nothing
    #[arg(long)]
    dry_run: bool,

    /// Abort a transform batch on the first rejected directive
    #[arg(long)]
    fail_fast: bool,

    /// Bypass the rolling-hour rate limit
    #[arg(long)]
    force: bool,

    /// Roll back a committed modification by id
    #[arg(long, value_name = "ID")]
    rollback: Option<String>,

    /// Show engine status and history statistics
    #[arg(long)]
    status: bool,

    /// Show the most recent modifications
    #[arg(long)]
    history: bool,

    /// Print the audit report
    #[arg(long)]
    report: bool,
}

fn print_outcome(state: ModificationState, id: &str, error: Option<&str>) {
    match state {
        ModificationState::Committed => {
            println!("{}", format!("committed: {id}").green());
        }
        ModificationState::DryRun => {
            println!("{}", format!("dry run passed: {id} (nothing written)").yellow());
        }
        _ => {
            println!("{}", format!("failed: {id}").red());
            if let Some(error) = error {
                println!("{}", format!("  {error}").red());
            }
        }
    }
}

fn show_status(engine: &MutationEngine, config: &config::EngineConfig) -> Result<()> {
    let stats = engine.get_statistics()?;
    println!(
        r#"
=== METAMORPH STATUS ===
Workspace:   {}
Backups:     {}
DB Path:     {}
Concurrency: {}
Total:       {}
Committed:   {}
Failed:      {}
Active:      {}
========================
"#,
        config.workspace_root,
        config.backup_root,
        config.db_path,
        config.max_concurrent,
        stats.total,
        stats.committed,
        stats.failed,
        stats.active,
    );
    if !stats.most_common_types.is_empty() {
        println!("By classification:");
        for (classification, count) in &stats.most_common_types {
            println!("  {classification}: {count}");
        }
    }
    Ok(())
}

fn show_history(engine: &MutationEngine) -> Result<()> {
    let history = engine.get_history(20)?;
    if history.is_empty() {
        println!("No modifications recorded.");
        return Ok(());
    }
    for m in history {
        let state = match m.state {
            ModificationState::Committed => m.state.as_str().green(),
            ModificationState::Failed => m.state.as_str().red(),
            _ => m.state.as_str().yellow(),
        };
        println!(
            "[{}] {} {} ({}, {} change(s))",
            m.created_at,
            m.id,
            state,
            m.classification.as_str(),
            m.changes.len()
        );
        for file in &m.targets.files {
            println!("    {file}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().unwrap_or_else(config::default_config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let engine = MutationEngine::new(config.clone())?;
    let options = ApplyOptions {
        dry_run: cli.dry_run,
        force: cli.force,
        ..Default::default()
    };

    if let Some(file) = &cli.apply {
        let raw = fs::read_to_string(file).with_context(|| format!("failed to read {file}"))?;
        let changes: Vec<Change> =
            serde_json::from_str(&raw).with_context(|| format!("failed to parse {file}"))?;
        let outcome = engine.apply_modification(changes, options).await?;
        print_outcome(outcome.state, &outcome.modification_id, outcome.error.as_deref());
        return Ok(());
    }

    if let Some(file) = &cli.transform {
        let raw = fs::read_to_string(file).with_context(|| format!("failed to read {file}"))?;
        let directives: Vec<TransformDirective> =
            serde_json::from_str(&raw).with_context(|| format!("failed to parse {file}"))?;
        let result = engine
            .transform_and_apply(&directives, cli.fail_fast, options)
            .await?;
        for rejected in &result.rejected {
            println!(
                "{}",
                format!(
                    "rejected {} {}: {}",
                    rejected.kind, rejected.target, rejected.reason
                )
                .yellow()
            );
        }
        print_outcome(
            result.outcome.state,
            &result.outcome.modification_id,
            result.outcome.error.as_deref(),
        );
        return Ok(());
    }

    if let Some(id) = &cli.rollback {
        let outcome = engine.rollback_modification(id).await?;
        println!(
            "{}",
            format!("rolled back: {}", outcome.modification_id).green()
        );
        return Ok(());
    }

    if cli.status {
        return show_status(&engine, &config);
    }
    if cli.history {
        return show_history(&engine);
    }
    if cli.report {
        println!("{}", engine.generate_audit_report()?);
        return Ok(());
    }

    println!("Nothing to do. Try: metamorph --status");
    Ok(())
}
