//! `rdt`: host surface for the rare-drop synchronization engine.
//!
//! Embedders drive the engine through [`run_cli`] with a parsed [`Cli`], or
//! through [`run_command`] against an explicit database path. Failures carry a
//! structured [`SyncError`] inside the `anyhow::Error`; [`error_envelope`]
//! renders them as the stable `{code, message}` shape printed by the binary.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rare_drop_core::{
    plan_drops, probability_table, BatchLimits, DegradationRule, DetectionReport, DropConfig,
    PlanSummary, ProgressUpdate, RegionMode, Strategy, SyncError, Tier,
    DEFAULT_DETECTION_SAMPLE, DEFAULT_PARAMETER_CEILING,
};
use rare_drop_store_sqlite::{
    spawn, sync_error, ApplyReport, DetectOptions, Operation, OperationReport, RestoreReport,
    SnapshotProvenance, SnapshotReport, SnapshotStatus, SqliteDropStore,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "rare_drop=info";

#[derive(Debug, Parser)]
#[command(name = "rdt")]
#[command(about = "Rare drop synchronization tool")]
pub struct Cli {
    #[arg(long, default_value = "./rare_drop.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Snapshot if needed, then replace every managed drop row.
    Apply(ApplyArgs),
    /// Read the catalog and summarize the plan without writing.
    Plan(PlanArgs),
    /// Infer the configuration that produced the current managed rows.
    Detect(DetectArgs),
    /// Preview effective probabilities per level.
    Rates(RatesArgs),
    Backup {
        #[command(subcommand)]
        command: Box<BackupCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum BackupCommand {
    Ensure(EnsureArgs),
    Status(JsonArgs),
    Restore(RestoreArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Enable the star tier, optionally overriding its probability.
    #[arg(long, num_args = 0..=1, conflicts_with = "config")]
    star: Option<Option<f64>>,
    #[arg(long, num_args = 0..=1, conflicts_with = "config")]
    moon: Option<Option<f64>>,
    #[arg(long, num_args = 0..=1, conflicts_with = "config")]
    sun: Option<Option<f64>>,
    #[arg(long, conflicts_with = "config")]
    distance: Option<u32>,
    #[arg(long, value_enum, conflicts_with = "config")]
    strategy: Option<StrategyArg>,
    /// Keep regions apart and suffix group names with the region code.
    #[arg(long, conflicts_with = "config")]
    region_aware: bool,
    #[arg(long, requires = "degrade_factor", conflicts_with = "config")]
    degrade_threshold: Option<u32>,
    #[arg(long, requires = "degrade_threshold", conflicts_with = "config")]
    degrade_factor: Option<f64>,
    /// JSON document holding a full drop configuration.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long, default_value_t = DEFAULT_PARAMETER_CEILING)]
    parameter_ceiling: usize,
    #[arg(long, default_value_t = 0)]
    safety_margin: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DetectArgs {
    #[arg(long, default_value_t = DEFAULT_DETECTION_SAMPLE)]
    sample_size: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RatesArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EnsureArgs {
    /// Recapture the snapshot from the current tables.
    #[arg(long)]
    refresh: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    /// Confirm that managed and foreign drop rows are replaced by the snapshot.
    #[arg(long)]
    yes: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StrategyArg {
    Owner,
    Legacy,
}

/// Installs the stderr `tracing` subscriber; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Runs one parsed `rdt` invocation against its `--db` database.
///
/// # Errors
/// Returns an error when configuration, store access, or the requested
/// operation fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command(&cli.db, cli.command)
}

/// Executes one command against the database at `db_path`.
///
/// # Errors
/// Returns an error when configuration, store access, or the requested
/// operation fails.
pub fn run_command(db_path: &Path, command: Command) -> Result<()> {
    match command {
        Command::Apply(args) => run_apply(db_path, &args),
        Command::Plan(args) => {
            let config = build_config(&args.config)?;
            let store = open_store(db_path)?;
            let catalog = store.load_catalog()?;
            let summary = plan_drops(&catalog, &config).summary();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_plan_summary(&summary);
            }
            Ok(())
        }
        Command::Detect(args) => {
            let store = open_store(db_path)?;
            let report = store.detect_configuration(&DetectOptions {
                sample_size: args.sample_size,
            })?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_detection(&report);
            }
            Ok(())
        }
        Command::Rates(args) => {
            let config = build_config(&args.config)?;
            let rows = probability_table(&config);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                let tiers = config.planned_tiers();
                print!("{:<8}", "level");
                for tier in &tiers {
                    print!(" {:<12}", tier.as_str());
                }
                println!();
                println!("{}", "-".repeat(8 + 13 * tiers.len()));
                for row in &rows {
                    print!("{:<8}", row.level);
                    for tier in &tiers {
                        let value = row.probabilities.get(tier).copied().unwrap_or(0.0);
                        print!(" {:<12}", format_percent(value));
                    }
                    println!();
                }
            }
            Ok(())
        }
        Command::Backup { command } => run_backup(db_path, *command),
    }
}

fn run_apply(db_path: &Path, args: &ApplyArgs) -> Result<()> {
    let config = build_config(&args.config)?;
    let limits = BatchLimits {
        parameter_ceiling: args.parameter_ceiling,
        safety_margin: args.safety_margin,
    };

    let report = run_job(db_path, Operation::Apply { config, limits })?;
    let OperationReport::Applied(applied) = report else {
        return Err(anyhow!("apply finished with an unexpected report"));
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&applied)?);
    } else {
        print_apply_report(&applied);
    }
    Ok(())
}

fn run_backup(db_path: &Path, command: BackupCommand) -> Result<()> {
    match command {
        BackupCommand::Ensure(args) => {
            let report = run_job(db_path, Operation::EnsureSnapshot { force: args.refresh })?;
            let OperationReport::Snapshot(snapshot) = report else {
                return Err(anyhow!("snapshot finished with an unexpected report"));
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_snapshot_report(&snapshot);
            }
            Ok(())
        }
        BackupCommand::Status(args) => {
            let store = open_store(db_path)?;
            let status = store.snapshot_status()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_snapshot_status(&status);
            }
            Ok(())
        }
        BackupCommand::Restore(args) => {
            if !args.yes {
                return Err(anyhow!(SyncError::Validation(
                    "restore replaces both drop tables with the snapshot; rerun with --yes"
                        .to_string()
                )));
            }
            let report = run_job(db_path, Operation::Restore)?;
            let OperationReport::Restored(restored) = report else {
                return Err(anyhow!("restore finished with an unexpected report"));
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&restored)?);
            } else {
                print_restore_report(&restored);
            }
            Ok(())
        }
    }
}

/// Opens the store for read-only commands; nothing is created.
fn open_store(db_path: &Path) -> Result<SqliteDropStore> {
    let store = SqliteDropStore::open(db_path)?;
    store.check_compatibility()?;
    Ok(store)
}

/// Runs `operation` on the engine worker and renders its progress to stderr.
fn run_job(db_path: &Path, operation: Operation) -> Result<OperationReport> {
    let handle = spawn(db_path.to_path_buf(), operation)?;
    let stderr = std::io::stderr();
    handle.wait(|update| {
        let mut out = stderr.lock();
        let _ = writeln!(out, "{}", format_progress(update));
    })
}

fn build_config(args: &ConfigArgs) -> Result<DropConfig> {
    if let Some(path) = &args.config {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let value: Value = serde_json::from_str(&body).map_err(|err| {
            anyhow!(SyncError::Validation(format!(
                "config {} is not valid JSON: {err}",
                path.display()
            )))
        })?;
        return DropConfig::from_json(&value).map_err(|err| anyhow!(SyncError::from(err)));
    }

    let mut config = DropConfig::default();
    let selected = [
        (Tier::Star, args.star),
        (Tier::Moon, args.moon),
        (Tier::Sun, args.sun),
    ];
    if selected.iter().any(|(_, flag)| flag.is_some()) {
        config.enabled_tiers = selected
            .iter()
            .filter(|(_, flag)| flag.is_some())
            .map(|(tier, _)| *tier)
            .collect();
    }
    for (tier, flag) in selected {
        if let Some(Some(probability)) = flag {
            config.probability_per_tier.insert(tier, probability);
        }
    }
    if let Some(distance) = args.distance {
        config.level_distance = distance;
    }
    if let Some(strategy) = args.strategy {
        config.strategy = match strategy {
            StrategyArg::Owner => Strategy::Owner,
            StrategyArg::Legacy => Strategy::Legacy,
        };
    }
    if args.region_aware {
        config.region_mode = RegionMode::Separated;
    }
    if let (Some(threshold_level), Some(factor)) = (args.degrade_threshold, args.degrade_factor) {
        config.degradation = Some(DegradationRule {
            threshold_level,
            factor,
        });
    }

    config
        .validate()
        .map_err(|err| anyhow!(SyncError::from(err)))?;
    Ok(config)
}

/// Stable `{code, message}` error shape; structured failures add `details`.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> Value {
    let message = format!("{err:#}");
    match sync_error(err) {
        Some(SyncError::EmptySnapshot {
            groups,
            assignments,
        }) => json!({
            "code": "empty_snapshot",
            "message": message,
            "details": { "group_rows": groups, "assignment_rows": assignments },
        }),
        Some(SyncError::PartialBatch {
            phase,
            chunk_index,
            chunks_total,
            rows_committed,
            ..
        }) => json!({
            "code": "partial_batch_failure",
            "message": message,
            "details": {
                "phase": phase.as_str(),
                "chunk_index": chunk_index,
                "chunks_total": chunks_total,
                "rows_committed": rows_committed,
            },
        }),
        Some(other) => json!({ "code": other.code(), "message": message }),
        None => json!({ "code": "internal_error", "message": message }),
    }
}

#[must_use]
pub fn format_eta(eta: Duration) -> String {
    let seconds = eta.as_secs();
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3_600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3_600, (seconds % 3_600) / 60)
    }
}

fn format_progress(update: &ProgressUpdate) -> String {
    let mut line = format!("[{:>3}%] {}", update.percent, update.message);
    if update.rows_total > 0 {
        line.push_str(&format!(" ({}/{})", update.rows_written, update.rows_total));
    }
    if let Some(eta) = update.eta {
        line.push_str(&format!(" eta {}", format_eta(eta)));
    }
    line
}

fn format_percent(probability: f64) -> String {
    format!("{:.4}%", probability * 100.0)
}

fn print_plan_summary(summary: &PlanSummary) {
    println!(
        "{:<8} {:<10} {:<12} {:<12}",
        "tier", "groups", "members", "assignments"
    );
    println!("{}", "-".repeat(46));
    for item in &summary.per_tier {
        let tier = item.tier.map_or("all", Tier::as_str);
        println!(
            "{:<8} {:<10} {:<12} {:<12}",
            tier, item.groups, item.member_rows, item.assignments
        );
    }
    println!(
        "total groups={} members={} assignments={}",
        summary.groups, summary.member_rows, summary.assignments
    );
}

fn print_detection(report: &DetectionReport) {
    let DetectionReport::Detected(detected) = report else {
        println!("status=not_detected");
        return;
    };
    let config = &detected.config;
    println!(
        "status=detected scheme={} confidence={} managed_groups={} samples={}",
        detected.scheme.as_str(),
        detected.confidence.as_str(),
        detected.managed_groups,
        detected.distance_samples
    );
    println!(
        "strategy={} region_mode={} distance={}",
        config.strategy.as_str(),
        config.region_mode.as_str(),
        config.level_distance
    );
    for tier in config.planned_tiers() {
        let probability = config.probability_per_tier.get(&tier).copied().unwrap_or(0.0);
        println!("{:<6} {}", tier.as_str(), format_percent(probability));
    }
    for note in &detected.notes {
        println!("note={note}");
    }
}

fn print_apply_report(report: &ApplyReport) {
    print_snapshot_report(&report.snapshot);
    print_plan_summary(&report.plan);
    let write = &report.write;
    println!(
        "deleted groups={} assignments={}",
        write.groups_deleted, write.assignments_deleted
    );
    println!(
        "written groups={} ({} chunks) assignments={} ({} chunks) max_parameters={}",
        write.group_rows_written,
        write.group_chunks,
        write.assignment_rows_written,
        write.assignment_chunks,
        write.max_parameters_per_statement
    );
}

fn print_snapshot_report(report: &SnapshotReport) {
    println!("snapshot action={}", report.action.as_str());
    print_snapshot_status(&report.status);
}

fn print_snapshot_status(status: &SnapshotStatus) {
    if !status.exists {
        println!("snapshot=none");
        return;
    }
    let captured_at = status
        .captured_at
        .and_then(|value| rare_drop_core::format_rfc3339(value).ok())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "snapshot={} captured_at={} provenance={} group_rows={} assignment_rows={} restorable={}",
        status.snapshot_id.as_deref().unwrap_or("untracked"),
        captured_at,
        status.provenance.map_or("unknown", SnapshotProvenance::as_str),
        status.group_rows,
        status.assignment_rows,
        if status.is_restorable() { "yes" } else { "no" }
    );
}

fn print_restore_report(report: &RestoreReport) {
    println!(
        "cleared groups={} assignments={}",
        report.groups_cleared, report.assignments_cleared
    );
    println!(
        "restored groups={} assignments={}",
        report.group_rows_restored, report.assignment_rows_restored
    );
}
