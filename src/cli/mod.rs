//! Command-line interface for stagehand.
//!
//! Operator commands for inspecting and repairing run state: replaying and
//! verifying event logs, draining the telemetry outbox, probing the remote
//! service and re-submitting offline bundles.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::clients::{
    HttpTransport, MutationClient, ReqwestTransport, SubmittedBundle, TelemetryReporter,
};
use crate::config::{load_config, ResolvedConfig};
use crate::core::{audit, load_or_replay, read_events, replay, write_snapshot, EVENTS_FILE, SNAPSHOT_FILE};
use crate::domain::Snapshot;

/// stagehand - reliability substrate for multi-stage pipelines
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Rebuild a run's snapshot from its event log and print it
    Replay {
        /// Run directory (contains events.jsonl)
        run_dir: PathBuf,

        /// Also write the rebuilt snapshot to snapshot.json
        #[arg(long)]
        write: bool,
    },

    /// Summarize a run's current state
    Status {
        /// Run directory (contains events.jsonl)
        run_dir: PathBuf,
    },

    /// Verify a run's hash chain
    Verify {
        /// Run directory (contains events.jsonl)
        run_dir: PathBuf,
    },

    /// Inspect or drain the telemetry outbox
    Outbox {
        #[command(subcommand)]
        command: OutboxCommands,
    },

    /// Check that the remote mutation service is reachable
    Health,

    /// Re-issue a deferred offline bundle
    SubmitBundle {
        /// Bundle file (from offline_bundles/)
        path: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum OutboxCommands {
    /// Attempt delivery of every buffered record
    Flush,

    /// List buffered records
    Status,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Replay { run_dir, write } => replay_run(&run_dir, write).await,
            Commands::Status { run_dir } => show_status(&run_dir).await,
            Commands::Verify { run_dir } => verify_run(&run_dir).await,
            Commands::Outbox { command } => {
                let config = load_config()?;
                match command {
                    OutboxCommands::Flush => flush_outbox(&config).await,
                    OutboxCommands::Status => outbox_status(&config).await,
                }
            }
            Commands::Health => health(&load_config()?).await,
            Commands::SubmitBundle { path } => submit_bundle(&load_config()?, &path).await,
            Commands::Config => show_config(&load_config()?),
        }
    }
}

fn transport() -> Arc<dyn HttpTransport> {
    Arc::new(ReqwestTransport::new())
}

/// Run id from the log's first event, falling back to the directory name
async fn resolve_run_id(run_dir: &Path) -> Result<String> {
    let events = read_events(&run_dir.join(EVENTS_FILE))
        .await
        .with_context(|| format!("Failed to read event log in {}", run_dir.display()))?;

    if let Some(first) = events.first() {
        return Ok(first.run_id.clone());
    }

    run_dir
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("Cannot determine run id for {}", run_dir.display()))
}

async fn replay_run(run_dir: &Path, write: bool) -> Result<()> {
    let run_id = resolve_run_id(run_dir).await?;
    let snapshot = replay(&run_dir.join(EVENTS_FILE), &run_id)
        .await
        .with_context(|| format!("Failed to replay run {}", run_id))?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if write {
        let path = run_dir.join(SNAPSHOT_FILE);
        write_snapshot(&path, &snapshot)
            .await
            .with_context(|| format!("Failed to write snapshot: {}", path.display()))?;
        eprintln!("[Snapshot written to {}]", path.display());
    }

    Ok(())
}

async fn show_status(run_dir: &Path) -> Result<()> {
    let run_id = resolve_run_id(run_dir).await?;
    let snapshot = load_or_replay(run_dir, &run_id)
        .await
        .with_context(|| format!("Failed to load run {}", run_id))?;

    print_status(&snapshot);
    Ok(())
}

fn print_status(snapshot: &Snapshot) {
    println!("Run ID: {}", snapshot.run_id);
    println!("State: {}", snapshot.run_state);
    println!("Events applied: {}", snapshot.events_applied);
    if let Some(last) = &snapshot.last_event_id {
        println!("Last event: {}", last);
    }

    println!("\nWork items:");
    if snapshot.work_items.is_empty() {
        println!("  (none)");
    }
    for item in &snapshot.work_items {
        println!(
            "  {:<24} {:<16} {:?} (attempt {})",
            item.work_item_id, item.worker, item.status, item.attempt
        );
    }

    println!("\nArtifacts:");
    if snapshot.artifacts_index.is_empty() {
        println!("  (none)");
    }
    for (name, entry) in &snapshot.artifacts_index {
        println!("  {:<24} {}", name, entry.path);
    }

    let open: Vec<_> = snapshot.open_issues().collect();
    println!("\nOpen issues: {}", open.len());
    for issue in open {
        println!(
            "  {}: {}",
            issue.issue_id,
            issue.message.as_deref().unwrap_or("")
        );
    }
}

async fn verify_run(run_dir: &Path) -> Result<()> {
    let log_path = run_dir.join(EVENTS_FILE);
    match audit(&log_path).await {
        Ok(report) => {
            println!("Events:        {}", report.events);
            println!("Hashed events: {}", report.hashed_events);
            println!(
                "Last hash:     {}",
                report.last_hash.as_deref().unwrap_or("(none)")
            );
            println!("\n✓ Hash chain intact");
            Ok(())
        }
        Err(err) => {
            eprintln!("✗ Integrity check failed: {}", err);
            std::process::exit(1);
        }
    }
}

async fn flush_outbox(config: &ResolvedConfig) -> Result<()> {
    let reporter = TelemetryReporter::new(config.reporter_config(), transport());
    let summary = reporter
        .flush_outbox()
        .await
        .context("Failed to flush telemetry outbox")?;

    println!(
        "Delivered: {}  Still pending: {}  Discarded: {}",
        summary.succeeded, summary.failed, summary.discarded
    );
    Ok(())
}

async fn outbox_status(config: &ResolvedConfig) -> Result<()> {
    let reporter = TelemetryReporter::new(config.reporter_config(), transport());
    let pending = reporter
        .pending()
        .await
        .context("Failed to read telemetry outbox")?;

    println!("Outbox: {}", reporter.outbox().path().display());
    if pending.is_empty() {
        println!("No buffered records");
        return Ok(());
    }

    println!("{:<8} {:<48} {:<32}", "METHOD", "ENDPOINT", "BUFFERED AT");
    println!("{}", "-".repeat(90));
    for entry in pending {
        println!("{:<8} {:<48} {:<32}", entry.method, entry.endpoint, entry.timestamp);
    }

    Ok(())
}

async fn health(config: &ResolvedConfig) -> Result<()> {
    let client = MutationClient::new(config.mutation_config()?, transport());

    match client.health_check().await {
        Ok(true) if client.is_offline() => println!("✓ Offline mode (mutations are deferred)"),
        Ok(true) => println!("✓ Remote service healthy: {}", config.remote.base_url),
        Ok(false) => {
            eprintln!("✗ Remote service unhealthy: {}", config.remote.base_url);
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("✗ {} [{}]", err, err.code());
            std::process::exit(1);
        }
    }

    let bundles = client.list_bundles().await?;
    if !bundles.is_empty() {
        println!("\n{} deferred bundle(s):", bundles.len());
        for deferred in bundles {
            println!("  {}", deferred.path.display());
        }
    }

    Ok(())
}

async fn submit_bundle(config: &ResolvedConfig, path: &Path) -> Result<()> {
    let client = MutationClient::new(config.mutation_config()?, transport());

    let submitted = client
        .submit_bundle(path)
        .await
        .with_context(|| format!("Failed to submit bundle: {}", path.display()))?;

    match submitted {
        SubmittedBundle::Commit(result) => {
            println!("Commit {} on {}", result.commit_sha, result.branch_name);
        }
        SubmittedBundle::PullRequest(result) => {
            println!("PR #{}: {}", result.pr_number, result.pr_html_url);
        }
    }

    Ok(())
}

fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!("stagehand configuration");
    println!();
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:    {}", config.home.display());
    println!("  Runs:    {}", config.runs_dir().display());
    println!("  Outbox:  {}", config.outbox_path().display());
    println!("  Bundles: {}", config.bundle_dir().display());
    println!();
    println!("Event log:");
    println!("  Hash chain: {}", config.hash_chain);
    println!();
    println!("Telemetry:");
    println!("  URL:        {}", config.telemetry.base_url);
    println!("  Token:      {}", mask(config.telemetry.token.as_deref()));
    println!("  Timeout:    {}s", config.telemetry.timeout.as_secs());
    println!("  Outbox cap: {} bytes", config.telemetry.max_outbox_bytes);
    println!("  Attempts:   {}", config.telemetry.retry.max_attempts);
    println!();
    println!("Remote service:");
    println!("  URL:      {}", config.remote.base_url);
    println!("  Token:    {}", mask(config.remote.token.as_deref()));
    println!("  Offline:  {}", config.remote.offline);
    println!("  Timeout:  {}s", config.remote.timeout.as_secs());
    println!("  Attempts: {}", config.remote.retry.max_attempts);

    Ok(())
}

fn mask(token: Option<&str>) -> &'static str {
    match token {
        Some(_) => "(set)",
        None => "(not set)",
    }
}
