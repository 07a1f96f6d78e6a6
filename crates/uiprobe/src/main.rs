//! uiprobe CLI
//!
//! Thin wrapper over `uiprobe-core`:
//!
//! - `uiprobe classify <recording.json>`: replay a recording (or a saved
//!   report) through the glitch classifier.
//! - `uiprobe snapshot`: print tmux's authoritative snapshot as JSON.
//! - `uiprobe compare --rendered <snapshot.json>`: reconcile a rendered
//!   snapshot against tmux (or against `--authoritative <file>`).
//! - `uiprobe config`: print the effective configuration.
//!
//! Exit codes: 0 clean, 1 glitch or mismatch, 2 infrastructure or usage error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use uiprobe_core::config::{Config, LogFormat, resolve_config_path};
use uiprobe_core::logging::init_logging;
use uiprobe_core::oracle::{CompareOptions, ConsistencyOracle, ConsistencyResult};
use uiprobe_core::retry::RetryPolicy;
use uiprobe_core::snapshot::{JsonFileSnapshotter, Snapshotter};
use uiprobe_core::timeline::{format_summary, format_timeline};
use uiprobe_core::tmux::{TmuxCli, TmuxSnapshotter};
use uiprobe_core::{Error, GlitchReport, Recording, classify_recording};

/// Exit code for a glitch or mismatch verdict.
const EXIT_VERDICT: u8 = 1;
/// Exit code for infrastructure, input and usage errors.
const EXIT_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "uiprobe", version, about = "UI stability and tmux consistency oracle")]
struct Cli {
    /// Config file (default: $UIPROBE_CONFIG, ./uiprobe.toml, user config dir)
    #[arg(long, global = true, env = "UIPROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify a recorded mutation/size timeline
    Classify(ClassifyArgs),
    /// Capture the authoritative tmux snapshot
    Snapshot(TmuxArgs),
    /// Compare a rendered snapshot against tmux
    Compare(CompareArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    /// Recording or report JSON file
    recording: PathBuf,

    /// Override glitch.thresholds.size_jump_px
    #[arg(long)]
    size_jump_threshold: Option<f64>,

    /// Print the full report as JSON instead of the timeline
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct TmuxArgs {
    /// tmux session name
    #[arg(long)]
    session: Option<String>,

    /// tmux server socket name (-L)
    #[arg(long)]
    socket: Option<String>,

    /// Path to the tmux binary
    #[arg(long)]
    tmux_binary: Option<String>,

    /// Include pane content digests
    #[arg(long)]
    content: bool,

    /// Report hidden helper windows as group entities
    #[arg(long)]
    include_hidden: bool,
}

#[derive(Args, Debug)]
struct CompareArgs {
    /// Rendered snapshot JSON, re-read on every retry; a missing or partly
    /// written file is retried until the timeout
    #[arg(long)]
    rendered: PathBuf,

    /// Authoritative snapshot JSON instead of querying tmux
    #[arg(long)]
    authoritative: Option<PathBuf>,

    /// Override consistency.timeout_ms
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    tmux: TmuxArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            match err.downcast_ref::<Error>() {
                Some(core) => {
                    if let Some(remediation) = core.remediation() {
                        eprintln!("\n{}", remediation.render_plain());
                    }
                    ExitCode::from(exit_code_for(core))
                }
                None => ExitCode::from(EXIT_ERROR),
            }
        }
    }
}

fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::Instability { .. } | Error::Mismatch { .. } => EXIT_VERDICT,
        _ => EXIT_ERROR,
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Command::Classify(args) => classify(&config, &args),
        Command::Snapshot(args) => snapshot(&config, &args).await,
        Command::Compare(args) => compare(&config, &args).await,
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let config = Config::load_or_default(explicit)?;
    if let Some(path) = resolve_config_path(explicit) {
        debug!(path = %path.display(), "using config file");
    }
    Ok(config)
}

/// Accept either a raw recording or a previously saved report.
fn read_recording(path: &Path) -> Result<Recording> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(Error::from)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    if value.get("summary").is_some() {
        let report: GlitchReport = serde_json::from_value(value).map_err(Error::from)?;
        Ok(report.recording())
    } else {
        Ok(serde_json::from_value(value).map_err(Error::from)?)
    }
}

fn classify(config: &Config, args: &ClassifyArgs) -> Result<ExitCode> {
    let recording = read_recording(&args.recording)?;
    let mut thresholds = config.glitch.thresholds.clone();
    if let Some(px) = args.size_jump_threshold {
        thresholds = thresholds.with_size_jump_px(px);
    }
    thresholds.validate().map_err(Error::from)?;

    let report = classify_recording(&recording, &thresholds);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let timeline = format_timeline(&report);
        if !timeline.is_empty() {
            println!("{timeline}");
        }
        println!("{}", format_summary(&report));
    }

    Ok(match report.check(&config.glitch.budget) {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::from(EXIT_VERDICT),
    })
}

fn tmux_snapshotter(config: &Config, args: &TmuxArgs) -> TmuxSnapshotter<TmuxCli> {
    let tmux = &config.tmux;
    let cli = TmuxCli::new()
        .with_binary(args.tmux_binary.clone().unwrap_or_else(|| tmux.binary.clone()))
        .with_socket(args.socket.clone().or_else(|| tmux.socket.clone()))
        .with_timeout(Duration::from_millis(tmux.command_timeout_ms));
    TmuxSnapshotter::new(cli, args.session.clone().unwrap_or_else(|| tmux.session.clone()))
        .with_content(args.content || tmux.include_content)
        .with_hidden_windows(args.include_hidden || tmux.include_hidden_windows)
        .with_retry(RetryPolicy::tmux_cli())
}

async fn snapshot(config: &Config, args: &TmuxArgs) -> Result<ExitCode> {
    let snapshot = tmux_snapshotter(config, args).capture().await?.normalized();
    println!("{}", snapshot.to_json_pretty()?);
    Ok(ExitCode::SUCCESS)
}

async fn compare(config: &Config, args: &CompareArgs) -> Result<ExitCode> {
    let mut options = CompareOptions::from_config(&config.consistency)
        .with_content(config.consistency.compare_content || args.tmux.content);
    if let Some(ms) = args.timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }
    let rendered = JsonFileSnapshotter::new(&args.rendered);

    let result = match &args.authoritative {
        Some(path) => {
            let authoritative = JsonFileSnapshotter::new(path).capture().await?;
            ConsistencyOracle::compare(&authoritative, &rendered, &options).await?
        }
        None => {
            let tmux = tmux_snapshotter(config, &args.tmux);
            ConsistencyOracle::check(&tmux, &rendered, &options).await?
        }
    };

    print_result(&result, args.json)?;
    Ok(if result.is_match {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_VERDICT)
    })
}

fn print_result(result: &ConsistencyResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    if result.is_match {
        println!(
            "consistent: {} entities after {} attempt(s) in {}ms",
            result.authoritative_count,
            result.attempts,
            result.elapsed.as_millis()
        );
    } else {
        println!(
            "MISMATCH: {} difference(s) after {} attempt(s) in {}ms (tmux {} entities, rendered {})",
            result.mismatches.len(),
            result.attempts,
            result.elapsed.as_millis(),
            result.authoritative_count,
            result.rendered_count
        );
        for mismatch in &result.mismatches {
            println!("  {mismatch}");
        }
    }
    Ok(())
}
