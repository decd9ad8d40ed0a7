use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use reelqueue_core::completion::PollResult;
use reelqueue_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use reelqueue_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use reelqueue_core::server::{app_router, AppState};
use reelqueue_core::submission::SubmitRequest;

#[derive(Parser)]
#[command(
    name = "reelqueue",
    about = "Rate-limited, deduplicating front door for long-running video generation",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one prompt and poll until the video is ready.
    Generate(GenerateArgs),
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(long, help = "Text prompt describing the video")]
    prompt: String,
    #[arg(
        long = "param",
        value_name = "KEY=VALUE",
        help = "Generation parameter (repeatable, e.g. --param aspectRatio=9:16)"
    )]
    params: Vec<String>,
    #[arg(long, help = "Caller-supplied idempotency key")]
    dedup_key: Option<String>,
    #[arg(long, default_value_t = 10)]
    poll_interval_secs: u64,
    #[arg(long, default_value_t = 60)]
    max_polls: u32,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir, cli.command.is_some());

    match cli.command {
        Some(Commands::Generate(args)) => run_generate(args, resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        data_dir: None,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        default_log_filter: DEFAULT_LOG_FILTER.to_string(),
        noise_filter: noise_base.to_string(),
        include_noise_filter_when_implicit: true,
        retention_files: logging::DEFAULT_LOG_RETENTION_FILES,
    };

    logging::select_log_filter(&options)
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(ready.appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path, cli_mode: bool) {
    let cfg_path = config_path(data_dir);
    info!(
        mode = if cli_mode { "cli" } else { "server" },
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides();
    config
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = AppState::from_config(config)?;
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting reelqueue server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_generate(args: GenerateArgs, data_dir: PathBuf) -> Result<()> {
    let parameters = parse_params(&args.params)?;
    let state = AppState::from_config(load_config(&data_dir))?;

    let receipt = state
        .orchestrator()
        .submit(SubmitRequest {
            prompt: args.prompt,
            parameters,
            dedup_key: args.dedup_key,
        })
        .await
        .context("generation request was rejected")?;
    info!(
        operation = %receipt.operation_id,
        is_existing = receipt.is_existing,
        "Generation submitted"
    );

    let interval = Duration::from_secs(args.poll_interval_secs.max(1));
    for attempt in 1..=args.max_polls {
        let result = state.resolver().poll(&receipt.operation_id).await;
        match &result {
            PollResult::Processing => {
                info!(attempt, max_polls = args.max_polls, "Video still processing");
                tokio::time::sleep(interval).await;
            }
            PollResult::Complete { .. } => {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }
            PollResult::CompleteEmpty { reason } => {
                bail!(
                    "operation {} finished without a video ({})",
                    receipt.operation_id,
                    reason.as_deref().unwrap_or("no reason given")
                );
            }
            PollResult::Error(err) => {
                bail!("polling {} failed: {err}", receipt.operation_id);
            }
        }
    }

    bail!(
        "operation {} still processing after {} polls",
        receipt.operation_id,
        args.max_polls
    )
}

/// `KEY=VALUE` pairs; values that parse as JSON keep their type.
fn parse_params(raw_params: &[String]) -> Result<Map<String, Value>> {
    let mut parameters = Map::new();
    for item in raw_params {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("invalid --param format '{}' (expected KEY=VALUE)", item))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid --param format '{}' (empty key)", item);
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        parameters.insert(key.to_string(), value);
    }
    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_keep_json_types() {
        let params = parse_params(&[
            "sampleCount=2".to_string(),
            "aspectRatio=9:16".to_string(),
            "enhancePrompt=true".to_string(),
        ])
        .unwrap();
        assert_eq!(params["sampleCount"], 2);
        assert_eq!(params["aspectRatio"], "9:16");
        assert_eq!(params["enhancePrompt"], true);
    }

    #[test]
    fn param_without_equals_is_rejected() {
        let err = parse_params(&["sampleCount".to_string()]).unwrap_err();
        assert!(err.to_string().contains("expected KEY=VALUE"));
    }

    #[test]
    fn param_with_empty_key_is_rejected() {
        assert!(parse_params(&["=3".to_string()]).is_err());
    }

    #[test]
    fn generate_subcommand_parses_flags() {
        let cli = Cli::try_parse_from([
            "reelqueue",
            "generate",
            "--prompt",
            "a cat surfing",
            "--param",
            "sampleCount=2",
            "--dedup-key",
            "req-1",
            "--max-polls",
            "3",
        ])
        .unwrap();
        let Some(Commands::Generate(args)) = cli.command else {
            panic!("expected generate subcommand");
        };
        assert_eq!(args.prompt, "a cat surfing");
        assert_eq!(args.params, vec!["sampleCount=2"]);
        assert_eq!(args.dedup_key.as_deref(), Some("req-1"));
        assert_eq!(args.poll_interval_secs, 10);
        assert_eq!(args.max_polls, 3);
    }

    #[test]
    fn server_mode_is_default() {
        let cli = Cli::try_parse_from(["reelqueue", "--port", "3001", "-v"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(3001));
        assert_eq!(cli.verbose, 1);
    }
}

#[cfg(test)]
mod log_filter_tests {
    use super::*;

    const NOISE: &str = logging::DEFAULT_NOISE_FILTER;

    #[test]
    fn uses_noise_and_default_info_without_overrides() {
        let selected = select_log_filter(NOISE, None, 0, None);
        assert_eq!(selected, format!("{NOISE},info"));
    }

    #[test]
    fn uses_noise_with_rust_log_when_no_cli_overrides() {
        let selected = select_log_filter(NOISE, Some("debug"), 0, None);
        assert_eq!(selected, format!("{NOISE},debug"));
    }

    #[test]
    fn verbose_flag_overrides_rust_log() {
        let selected = select_log_filter(NOISE, Some("info"), 1, None);
        assert_eq!(selected, "debug");
    }

    #[test]
    fn double_verbose_enables_trace() {
        let selected = select_log_filter(NOISE, Some("info"), 2, None);
        assert_eq!(selected, "trace");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        let selected = select_log_filter(NOISE, Some("warn"), 2, Some("reelqueue_core=trace"));
        assert_eq!(selected, "reelqueue_core=trace");
    }
}
