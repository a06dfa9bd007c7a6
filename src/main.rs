//! crossbuild CLI
//!
//! Entry point for the `crossbuild` command-line tool.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Args, Parser, Subcommand};
use crossbuild_lane::config::{default_host_config_path, REPO_CONFIG_PATH};
use crossbuild_lane::publish::BundleFormat;
use crossbuild_lane::signal::SignalHandler;
use crossbuild_lane::summary::Status;
use crossbuild_lane::{
    EffectiveConfig, ExitCode, PipelineOrchestrator, PipelineSettings, PlatformMatrix, RunReport,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crossbuild")]
#[command(about = "Multi-architecture containerized build lane", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ConfigArgs {
    /// Path to repo config file (default: .crossbuild/pipeline.toml)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Path to host config file (default: ~/.config/crossbuild/config.toml)
    #[arg(long)]
    host_config: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Restrict the run to these platforms (comma-separated)
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,

    /// Maximum entries built at once
    #[arg(long)]
    parallel: Option<usize>,

    /// Overall per-build timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Bundle format (directory or tar)
    #[arg(long)]
    format: Option<BundleFormat>,

    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, collect and publish every enabled matrix entry
    Run(RunArgs),

    /// Print the container invocations of a run without executing
    Plan(RunArgs),

    /// List matrix entries
    Matrix {
        #[command(flatten)]
        config: ConfigArgs,

        /// Include disabled entries
        #[arg(long)]
        all: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration with provenance
    Config {
        #[command(flatten)]
        config: ConfigArgs,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run(args) => run_pipeline(args),
        Commands::Plan(args) => run_plan(args),
        Commands::Matrix { config, all, json } => run_matrix(config, all, json),
        Commands::Config { config, json } => run_config(config, json),
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn config_error(message: impl std::fmt::Display) -> ! {
    eprintln!("Configuration error: {}", message);
    process::exit(ExitCode::ConfigError.as_i32());
}

fn current_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|e| config_error(format!("cannot read working directory: {}", e)))
}

fn cli_overrides(args: &RunArgs) -> Option<Value> {
    let mut overrides = json!({});
    if let Some(parallel) = args.parallel {
        overrides["parallel"] = json!(parallel);
    }
    if let Some(timeout) = args.timeout {
        overrides["timeout"] = json!({ "overall_seconds": timeout });
    }
    if let Some(format) = args.format {
        overrides["bundle"] = json!({ "format": format });
    }
    match overrides.as_object() {
        Some(map) if !map.is_empty() => Some(overrides),
        _ => None,
    }
}

fn load_config(args: &ConfigArgs, overrides: Option<Value>) -> EffectiveConfig {
    let repo = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(REPO_CONFIG_PATH));
    // An explicitly named repo config must exist
    if args.config.is_some() && !repo.exists() {
        config_error(format!("{} not found", repo.display()));
    }
    let host = args.host_config.clone().or_else(default_host_config_path);

    EffectiveConfig::build(host.as_deref(), Some(repo.as_path()), overrides)
        .unwrap_or_else(|e| config_error(e))
}

fn load_settings(config: &EffectiveConfig) -> PipelineSettings {
    config
        .settings(&current_dir())
        .unwrap_or_else(|e| config_error(e))
}

fn selected_matrix(settings: &PipelineSettings, only: &[String]) -> PlatformMatrix {
    let matrix = settings
        .platform_matrix()
        .unwrap_or_else(|e| config_error(e));
    if only.is_empty() {
        return matrix;
    }
    matrix.filter(only).unwrap_or_else(|e| config_error(e))
}

fn run_pipeline(args: RunArgs) {
    let config = load_config(&args.config, cli_overrides(&args));
    let settings = load_settings(&config);
    let matrix = selected_matrix(&settings, &args.only);
    let spec = settings.artifact_spec().unwrap_or_else(|e| config_error(e));
    if !settings.entrypoint.is_file() {
        config_error(format!("entrypoint {} is not a file", settings.entrypoint.display()));
    }

    let handler = SignalHandler::new();
    if let Err(e) = handler.install() {
        eprintln!("Warning: failed to install signal handler: {}", e);
    }

    let image = settings.image.clone();
    let entrypoint = settings.entrypoint.clone();
    let orchestrator =
        PipelineOrchestrator::from_settings(settings, handler.coordinator()).with_effective_config(config);
    let report = orchestrator.run_all(&matrix, &image, &entrypoint, &spec);

    if args.json {
        match report.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error serializing report: {}", e),
        }
    } else {
        print_report(&report, &orchestrator.settings().work_root);
    }
    process::exit(report.exit_code);
}

fn print_report(report: &RunReport, work_root: &Path) {
    println!("Run {}: {}", report.run_id, report.human_summary);
    for entry in &report.entries {
        let label = format!("{} ({})", entry.platform, entry.arch);
        match entry.status {
            Status::Success => {
                let location = entry
                    .bundle
                    .as_ref()
                    .map(|b| format!("{} -> {}", b.bundle_name, b.location))
                    .unwrap_or_default();
                println!("  {:<28} success    {}", label, location);
            }
            status => {
                let stage = entry.stage.map(|s| s.to_string()).unwrap_or_default();
                let message = entry.message.clone().unwrap_or_default();
                let status = if status == Status::Cancelled { "cancelled" } else { "failed" };
                println!("  {:<28} {:<10} {}: {}", label, status, stage, message);
            }
        }
    }
    println!(
        "  report: {}",
        work_root.join(&report.run_id).join("run_report.json").display()
    );
}

fn run_plan(args: RunArgs) {
    let config = load_config(&args.config, cli_overrides(&args));
    let settings = load_settings(&config);
    let matrix = selected_matrix(&settings, &args.only);

    let orchestrator = PipelineOrchestrator::from_settings(settings, Default::default());
    let plan = orchestrator.plan(&matrix).unwrap_or_else(|e| config_error(e));

    if args.json {
        match serde_json::to_string_pretty(&plan) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing plan: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    println!(
        "Plan: {} entries, parallel {}, host {}",
        plan.entries.len(),
        plan.parallel,
        plan.host_arch
    );
    if plan.provision {
        println!("  emulation: register ({})", orchestrator.settings().emulation.image);
    }
    for entry in &plan.entries {
        let emulated = if entry.emulated { " [emulated]" } else { "" };
        println!("  {} ({}){}", entry.platform, entry.arch, emulated);
        println!("    {}", entry.command.join(" "));
    }
}

fn run_matrix(args: ConfigArgs, all: bool, json: bool) {
    let config = load_config(&args, None);
    let settings = load_settings(&config);
    let matrix = selected_matrix(&settings, &[]);
    let entries: Vec<_> = if all {
        matrix.declared().to_vec()
    } else {
        matrix.entries().cloned().collect()
    };

    if json {
        match serde_json::to_string_pretty(&entries) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error serializing matrix: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    if entries.is_empty() {
        println!("No matrix entries");
        return;
    }
    for entry in entries {
        let flag = if entry.enabled { "" } else { "  (disabled)" };
        println!("{:<20} {}{}", entry.platform, entry.arch, flag);
    }
}

fn run_config(args: ConfigArgs, json: bool) {
    let config = load_config(&args, None);

    if json {
        match config.to_json() {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error serializing config: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    println!("Sources (lowest precedence first):");
    for source in &config.sources {
        match (&source.path, &source.digest) {
            (Some(path), Some(digest)) => println!(
                "  {:?}: {} (sha256 {})",
                source.origin,
                path,
                &digest[..12.min(digest.len())]
            ),
            _ => println!("  {:?}", source.origin),
        }
    }
    if !config.redactions.is_empty() {
        println!("Redacted: {}", config.redactions.join(", "));
    }
    match serde_json::to_string_pretty(&config.config) {
        Ok(out) => println!("{}", out),
        Err(e) => eprintln!("Error serializing config: {}", e),
    }
}
