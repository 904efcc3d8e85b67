use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use talkvid_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use talkvid_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
    DEFAULT_LOG_FILTER,
};
use talkvid_core::predictor::Predictor;
use talkvid_core::request::{
    PredictionRequest, DEFAULT_CFG_SCALE, DEFAULT_FPS, DEFAULT_NEGATIVE_PROMPT,
    DEFAULT_NUM_FRAMES, DEFAULT_PROMPT, DEFAULT_STEPS, RANDOM_SEED,
};
use talkvid_core::server::{self, AppState};
use talkvid_core::weights::{self, ProvisionReport, WeightManifest};

#[derive(Parser)]
#[command(
    name = "talkvid",
    about = "Audio-driven talking-head video generation on a ComfyUI host",
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

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision weights, then serve the prediction API (the default).
    Serve(ServeArgs),
    /// Provision weights and exit.
    Setup,
    /// Run a single prediction and print the output video path.
    Predict(PredictArgs),
}

#[derive(Args, Debug, Default, Clone)]
struct ServeArgs {
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, help = "Do not download missing weights before starting")]
    skip_setup: bool,
}

#[derive(Args, Debug, Clone)]
struct PredictArgs {
    #[arg(long, help = "Portrait image to animate")]
    image: PathBuf,

    #[arg(long, help = "Speech audio; the template's default clip is used when omitted")]
    audio: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,

    #[arg(long, default_value = DEFAULT_NEGATIVE_PROMPT)]
    negative_prompt: String,

    #[arg(long, default_value_t = DEFAULT_NUM_FRAMES)]
    num_frames: i64,

    #[arg(long, default_value_t = DEFAULT_FPS)]
    fps: i64,

    #[arg(long, default_value_t = DEFAULT_STEPS)]
    steps: i64,

    #[arg(long, default_value_t = DEFAULT_CFG_SCALE)]
    cfg_scale: f64,

    #[arg(long, default_value_t = RANDOM_SEED, allow_hyphen_values = true, help = "-1 picks a random seed")]
    seed: i64,

    #[arg(short = 'o', long, help = "Copy the generated video to this path")]
    output: Option<PathBuf>,

    #[arg(long, help = "Do not download missing weights before predicting")]
    skip_setup: bool,
}

impl PredictArgs {
    fn to_request(&self) -> PredictionRequest {
        PredictionRequest {
            input_image: self.image.clone(),
            audio_file: self.audio.clone(),
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            num_frames: self.num_frames,
            fps: self.fps,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            seed: self.seed,
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        None | Some(Commands::Serve(_)) => RuntimeLogMode::Server,
        Some(_) => RuntimeLogMode::Cli,
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, &resolved_data_dir);

    let config = load_config(&resolved_data_dir);

    match cli.command {
        Some(Commands::Setup) => {
            run_setup(&config).await?;
            Ok(())
        }
        Some(Commands::Predict(args)) => run_predict(config, args).await,
        Some(Commands::Serve(args)) => run_server(config, args).await,
        None => run_server(config, cli.serve).await,
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn build_manifest(config: &AppConfig) -> Result<WeightManifest> {
    let paths = config.paths.resolve();
    let mut manifest = WeightManifest::with_builtin_weights(paths.models_dir);
    if let Some(extra) = paths.weights_manifest.as_deref() {
        manifest.load_json_file(extra)?;
    }
    Ok(manifest)
}

async fn run_setup(config: &AppConfig) -> Result<ProvisionReport> {
    let manifest = build_manifest(config)?;
    let fetch = config.fetch.clone();
    info!(
        models_dir = %manifest.models_dir().display(),
        weights = manifest.list().len(),
        fetcher = fetch.command.as_deref().unwrap_or("http"),
        "Provisioning weights"
    );

    let report = tokio::task::spawn_blocking(move || {
        let fetcher = weights::fetcher_for(fetch.command.as_deref(), &fetch.args);
        weights::provision(&manifest, fetcher.as_ref())
    })
    .await
    .context("weight provisioning task failed")?
    .context("failed to provision weights")?;

    info!(
        fetched = report.fetched.len(),
        skipped = report.skipped.len(),
        "Weights ready"
    );
    Ok(report)
}

async fn run_predict(config: AppConfig, args: PredictArgs) -> Result<()> {
    if !args.skip_setup {
        run_setup(&config).await?;
    }

    let predictor = Predictor::from_config(&config)?;
    let request = args.to_request();
    let prediction = tokio::task::spawn_blocking(move || predictor.predict(request))
        .await
        .context("prediction task failed")??;

    info!(
        output = %prediction.output.display(),
        seed = prediction.seed,
        elapsed_secs = prediction.elapsed.as_secs_f64(),
        "Prediction complete"
    );

    let final_path = match args.output {
        Some(destination) => {
            copy_output(&prediction.output, &destination)?;
            destination
        }
        None => prediction.output,
    };
    println!("{}", final_path.display());
    Ok(())
}

fn copy_output(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(source, destination).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            destination.display()
        )
    })?;
    Ok(())
}

async fn run_server(config: AppConfig, args: ServeArgs) -> Result<()> {
    if args.skip_setup {
        info!("Skipping weight provisioning");
    } else {
        run_setup(&config).await?;
    }

    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = args.host.unwrap_or_else(|| config.server.host.clone());

    let manifest = build_manifest(&config)?;
    let predictor = Predictor::from_config(&config)?;
    info!(
        engine = %logging::redact_url(&config.engine.base_url),
        workflow = %predictor.paths().workflow.display(),
        "Predictor ready"
    );

    let addr = format!("{host}:{port}");
    server::serve(&addr, AppState::new(predictor, manifest)).await
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: crash report hook unavailable (path: {attempted}; reason: {reason}). Panics will not be persisted."
        );
    }

    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let fallback = match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_filter = parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(logging::redacting_make_writer(appender))
                    .with_filter(file_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
            None
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            Some((attempted_log_dir, reason))
        }
    };

    if let Some((attempted_log_dir, reason)) = fallback {
        let attempted = attempted_log_dir
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        warn!(
            attempted_log_dir = %attempted,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Crash report hook unavailable; continuing without crash reports"
        );
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

fn runtime_mode_name(mode: RuntimeLogMode) -> &'static str {
    match mode {
        RuntimeLogMode::Cli => "cli",
        RuntimeLogMode::Server => "server",
    }
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    let cfg_path = config_path(data_dir);
    info!(
        mode = runtime_mode_name(mode),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}


#[cfg(test)]
mod output_copy_tests {
    use super::*;

    #[test]
    fn copies_into_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("InfiniteTalk_00001.mp4");
        fs::write(&source, b"video").unwrap();
        let destination = dir.path().join("exports/nested/result.mp4");

        copy_output(&source, &destination).unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"video");
    }
}

#[cfg(test)]
mod log_filter_tests {
    use super::*;

    fn select_log_filter(rust_log_env: Option<&str>, verbose: u8, cli: Option<&str>) -> String {
        let options = LoggingInitOptions {
            verbose,
            cli_log_filter: cli.map(ToString::to_string),
            rust_log_env: rust_log_env.map(ToString::to_string),
            ..Default::default()
        };
        logging::compose_logging_filters(&options).console_filter
    }

    #[test]
    fn uses_noise_and_default_info_without_overrides() {
        assert_eq!(
            select_log_filter(None, 0, None),
            format!("{},info", logging::DEFAULT_NOISE_FILTER)
        );
    }

    #[test]
    fn verbose_flag_overrides_rust_log() {
        assert_eq!(select_log_filter(Some("info"), 1, None), "debug");
        assert_eq!(select_log_filter(Some("info"), 2, None), "trace");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        assert_eq!(
            select_log_filter(Some("warn"), 2, Some("talkvid_core=trace")),
            "talkvid_core=trace"
        );
    }
}
