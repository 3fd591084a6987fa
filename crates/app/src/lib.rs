use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use slomo_core::backend::Device;
use slomo_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig};
use slomo_core::job::{run_job, SlomoRequest};
use slomo_core::logging::{self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER};

#[derive(Parser, Debug)]
#[command(
    name = "slomo",
    about = "Convert a video to slow motion with neural frame interpolation"
)]
struct Cli {
    #[arg(long, help = "Path of the video to be converted")]
    video: PathBuf,

    #[arg(long, help = "Path to the trained checkpoint manifest (or its directory)")]
    checkpoint: PathBuf,

    #[arg(long, default_value_t = 30.0, help = "Frame rate of the output video")]
    fps: f64,

    #[arg(long = "sf", value_name = "N", help = "Slow-motion factor: frames per original interval")]
    factor: u32,

    #[arg(long, default_value = "output.mkv", help = "Output video path (.mkv)")]
    output: PathBuf,

    #[arg(long, value_name = "DIR", help = "Directory containing the ffmpeg binary")]
    ffmpeg_dir: Option<PathBuf>,

    #[arg(long, value_parser = parse_device, help = "Inference device: cpu, cuda or tensorrt")]
    device: Option<Device>,

    #[arg(long, value_name = "DIR", help = "Working directory for extracted frames")]
    work_dir: Option<PathBuf>,

    #[arg(long, help = "Keep the working directory after the run")]
    keep_temp: bool,

    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,
}

fn parse_device(value: &str) -> std::result::Result<Device, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "cpu" | "cuda" | "tensorrt" | "trt" => Ok(Device::from_str_lossy(value)),
        other => Err(format!("unknown device '{other}' (expected cpu, cuda or tensorrt)")),
    }
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    slomo_core::runtime::setup_runtime_libs();
    init_logging(Some(&resolved_data_dir), cli.verbose, cli.log_filter.as_deref());
    slomo_core::runtime::log_runtime_lib_status();

    let config = load_config(&resolved_data_dir);
    let request = build_request(&cli, &config, &resolved_data_dir);
    info!(
        video = %request.video.display(),
        output = %request.output.display(),
        factor = request.factor,
        fps = request.fps,
        device = %request.device,
        "Starting slow-motion conversion"
    );

    let mut progress = ProgressPrinter::new();
    let summary = run_job(&request, |written, total| progress.update(written, total));
    progress.finish();
    let summary = summary?;

    info!(
        output = %summary.output.display(),
        input_frames = summary.run.input_frames,
        output_frames = summary.run.output_frames,
        resolution = %summary.run.original,
        elapsed = %format_duration(summary.run.elapsed.as_secs_f64()),
        "Done"
    );
    Ok(())
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

/// Command-line flags win over `config.toml`.
fn build_request(cli: &Cli, config: &AppConfig, data_dir: &Path) -> SlomoRequest {
    SlomoRequest {
        video: cli.video.clone(),
        checkpoint: cli.checkpoint.clone(),
        output: cli.output.clone(),
        fps: cli.fps,
        factor: cli.factor,
        device: cli.device.unwrap_or(config.inference.device),
        normalize_on_cpu: config.inference.normalize_on_cpu,
        work_dir: cli
            .work_dir
            .clone()
            .unwrap_or_else(|| config.paths.work_dir.clone()),
        trt_cache_dir: resolve_relative_to(data_dir, &config.paths.trt_cache_dir),
        ffmpeg_dir: cli
            .ffmpeg_dir
            .clone()
            .or_else(|| config.paths.ffmpeg_dir.clone()),
        keep_temp: cli.keep_temp || config.pipeline.keep_temp,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let plan = logging::compose_logging_init_plan(&LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    });
    let console_filter = env_filter_or_default(&plan.filters.console_filter, "console");

    let installed = match plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_filter = env_filter_or_default(&plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_filter),
                );
            tracing::subscriber::set_global_default(subscriber)
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            );
            let installed = tracing::subscriber::set_global_default(subscriber);
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
            installed
        }
    };

    if let Err(error) = installed {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn env_filter_or_default(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;
/// The first frames include model warm-up and would skew the rate.
const FPS_WARMUP_FRAMES: usize = 2;

struct ProgressPrinter {
    start: Instant,
    rate_start: Option<Instant>,
    printed: bool,
}

impl ProgressPrinter {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            rate_start: None,
            printed: false,
        }
    }

    fn update(&mut self, written: usize, total: usize) {
        if self.rate_start.is_none() && written > FPS_WARMUP_FRAMES {
            self.rate_start = Some(Instant::now());
        }
        let rate_elapsed = self
            .rate_start
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        eprint!(
            "\r{}    ",
            progress_line(written, total, self.start.elapsed().as_secs_f64(), rate_elapsed)
        );
        self.printed = true;
    }

    fn finish(&self) {
        if self.printed {
            eprintln!();
        }
    }
}

fn output_fps(written: usize, rate_elapsed: f64) -> f64 {
    if rate_elapsed <= 0.0 || written <= FPS_WARMUP_FRAMES {
        return 0.0;
    }
    (written - FPS_WARMUP_FRAMES) as f64 / rate_elapsed
}

fn progress_line(written: usize, total: usize, elapsed: f64, rate_elapsed: f64) -> String {
    let fraction = if total > 0 {
        (written as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));

    let fps = output_fps(written, rate_elapsed);
    let eta = if fps > 0.0 {
        let remaining = total.saturating_sub(written) as f64;
        format!(" | ETA: {}", format_duration(remaining / fps))
    } else {
        String::new()
    };

    format!(
        "[{bar}] {:5.1}% | Frame {written}/{total} | {fps:.1} fps | Elapsed: {}{eta}",
        fraction * 100.0,
        format_duration(elapsed),
    )
}
