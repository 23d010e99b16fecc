//! lanekeeper CLI
//!
//! Deployment gates and budget inspection for lanekeeper.
//!
//! # Commands
//!
//! - `gate`: run every CI gate and exit with the deployment verdict
//! - `validate-keys`: check provider credentials per lane
//! - `check-budgets`: check one lane's budgets against provider latency
//! - `profiles`: print the loaded tier profiles
//! - `health`: provider health from an exported fallback event log
//!
//! Exit codes: 0 pass (or warn), 1 fail (or warn with `--strict`),
//! 2 configuration error. Reports go to stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use lanekeeper_core::{validate_budget_compliance, LaneKind};
use lanekeeper_runtime::providers::ConfiguredCredentials;
use lanekeeper_runtime::{
    load_health_events, FallbackMetrics, GateReport, GateRunner, KeyValidator, Settings,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

/// Exit code for unreadable or invalid configuration.
const EXIT_CONFIG_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "lanekeeper")]
#[command(version)]
#[command(about = "Deployment gates and budget inspection for multi-lane retrieval")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every CI gate and exit with the deployment verdict
    Gate(GateArgs),
    /// Check provider credentials for each lane
    ValidateKeys(ReportArgs),
    /// Check a lane's budgets against known provider latency
    CheckBudgets(CheckBudgetsArgs),
    /// Print the loaded tier profiles
    Profiles(CommonArgs),
    /// Provider health from an exported fallback event log
    Health(HealthArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Args)]
struct CommonArgs {
    /// Settings file (YAML or JSON); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Args)]
struct ReportArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Treat warnings as failures
    #[arg(long)]
    strict: bool,
}

#[derive(Args)]
struct GateArgs {
    #[command(flatten)]
    report: ReportArgs,

    /// Exported fallback events (JSON array) for the provider health gate
    #[arg(long)]
    health: Option<PathBuf>,
}

#[derive(Args)]
struct CheckBudgetsArgs {
    #[command(flatten)]
    report: ReportArgs,

    /// Lane to check
    #[arg(short, long)]
    lane: LaneKind,

    /// Only consider keyless providers
    #[arg(long)]
    keyless_only: bool,
}

#[derive(Args)]
struct HealthArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Exported fallback events (JSON array)
    #[arg(long)]
    events: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Gate(args) => run_gate(args),
        Commands::ValidateKeys(args) => run_validate_keys(args),
        Commands::CheckBudgets(args) => run_check_budgets(args),
        Commands::Profiles(args) => run_profiles(args),
        Commands::Health(args) => run_health(args),
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            EXIT_CONFIG_ERROR
        }
    };

    std::process::exit(exit_code);
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = Settings::load(path).with_context(|| match path {
        Some(path) => format!("failed to load settings from {}", path.display()),
        None => "failed to load built-in settings".to_string(),
    })?;
    tracing::info!(version = %settings.budgets.version, "Settings loaded");
    Ok(settings)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn fmt_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

fn print_list(title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("{}:", title);
    for item in items {
        println!("  - {}", item);
    }
}

fn run_gate(args: GateArgs) -> Result<i32> {
    let settings = load_settings(args.report.common.config.as_deref())?;
    let fallback = settings.runtime.fallback.clone();
    let mut runner = GateRunner::new(settings);

    if let Some(path) = &args.health {
        let events = load_health_events(path)
            .with_context(|| format!("failed to load health snapshot {}", path.display()))?;
        runner = runner.with_health(Arc::new(FallbackMetrics::from_events(fallback, events)));
    }

    let report = runner.run();
    match args.report.common.format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => print_gate_report(&report),
    }
    Ok(report.exit_code(args.report.strict))
}

fn print_gate_report(report: &GateReport) {
    println!("Overall: {}", report.overall_status);
    for gate in &report.gates {
        println!("  [{}] {} ({:?})", gate.effective_status(), gate.name, gate.severity);
    }
    if !report.per_lane_status.is_empty() {
        println!("Lanes:");
        for (lane, status) in &report.per_lane_status {
            println!("  {:<16} {}", lane.as_str(), status);
        }
    }
    print_list("Errors", &report.errors);
    print_list("Warnings", &report.warnings);
    print_list("Recommendations", &report.recommendations);
}

fn run_validate_keys(args: ReportArgs) -> Result<i32> {
    let settings = load_settings(args.common.config.as_deref())?;
    let credentials = ConfiguredCredentials::new(settings.runtime.credentials.clone());
    let report = KeyValidator::new(settings.runtime.requirements())
        .with_keyless_fallback(settings.runtime.keyless_fallback_enabled)
        .validate(&credentials);

    match args.common.format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            println!(
                "Overall: {} (keyless fallback {})",
                report.overall_status,
                if report.keyless_fallback_enabled { "enabled" } else { "disabled" }
            );
            for detail in &report.details {
                println!(
                    "  {:<16} {:<5} configured: [{}] fallbacks: [{}]",
                    detail.lane.as_str(),
                    detail.status.as_str(),
                    detail.configured.join(", "),
                    detail.fallbacks.join(", ")
                );
            }
            print_list("Errors", &report.errors);
            print_list("Warnings", &report.warnings);
            print_list("Recommendations", &report.recommendations);
        }
    }
    Ok(report.overall_status.exit_code(args.strict))
}

fn run_check_budgets(args: CheckBudgetsArgs) -> Result<i32> {
    let settings = load_settings(args.report.common.config.as_deref())?;
    let report = validate_budget_compliance(&settings.budgets, args.lane, args.keyless_only);

    match args.report.common.format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            println!(
                "Lane {}{}: {}",
                report.lane,
                if report.keyless_only { " (keyless only)" } else { "" },
                report.verdict
            );
            println!("  providers: [{}]", report.providers.join(", "));
            for finding in &report.findings {
                let tier = finding
                    .tier
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("  [{}] {}: {}", finding.verdict, tier, finding.message);
            }
        }
    }
    Ok(report.verdict.exit_code(args.report.strict))
}

fn run_profiles(args: CommonArgs) -> Result<i32> {
    let settings = load_settings(args.config.as_deref())?;

    match args.format {
        OutputFormat::Json => print_json(&settings.budgets)?,
        OutputFormat::Text => {
            println!("Budget document {}", settings.budgets.version);
            for (tier, profile) in &settings.budgets.tiers {
                println!(
                    "{}: global {}, ttfb {}, tolerance {:.0}%{}",
                    tier,
                    fmt_duration(profile.global_response_limit),
                    fmt_duration(profile.ttfb_limit),
                    profile.tolerance * 100.0,
                    if profile.strict { ", strict" } else { "" }
                );
                for (lane, allocation) in &profile.allocations {
                    println!("  {:<22} {}", lane.as_str(), fmt_duration(*allocation));
                }
            }
        }
    }
    Ok(0)
}

fn run_health(args: HealthArgs) -> Result<i32> {
    let settings = load_settings(args.common.config.as_deref())?;
    let events = load_health_events(&args.events)
        .with_context(|| format!("failed to load events {}", args.events.display()))?;
    let metrics = FallbackMetrics::from_events(settings.runtime.fallback, events);
    let summary = metrics.health_summary();

    match args.common.format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Text => {
            println!(
                "{} providers, demotion threshold {:.0}%",
                summary.providers.len(),
                summary.auto_demotion_threshold * 100.0
            );
            for health in &summary.providers {
                println!(
                    "  {:<16} {:<20} {:<9} calls {:>5}  failure {:>5.1}%  avg {:.0}ms{}",
                    health.lane.as_str(),
                    health.provider,
                    health.status.as_str(),
                    health.total,
                    health.failure_rate * 100.0,
                    health.avg_latency_ms,
                    if health.auto_demotion_eligible { "  demote" } else { "" }
                );
            }
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_budgets() {
        let cli = Cli::try_parse_from([
            "lanekeeper",
            "check-budgets",
            "--lane",
            "knowledge_graph",
            "--keyless-only",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::CheckBudgets(args) => {
                assert_eq!(args.lane, LaneKind::KnowledgeGraph);
                assert!(args.keyless_only);
                assert!(matches!(args.report.common.format, OutputFormat::Json));
            }
            _ => panic!("expected check-budgets"),
        }
    }

    #[test]
    fn test_unknown_lane_rejected() {
        assert!(Cli::try_parse_from(["lanekeeper", "check-budgets", "--lane", "fax"]).is_err());
    }

    #[test]
    fn test_missing_config_is_an_error() {
        assert!(load_settings(Some(Path::new("/nonexistent/lanekeeper.yaml"))).is_err());
    }
}
