use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;

use hailoseg_core::accelerator::{ModelMetadata, OutputShape, QuantInfo, SimulatedAccelerator};
use hailoseg_core::config::{config_path, data_dir, initialize_data_dir, PipelineConfig};
use hailoseg_core::decoder::StubDecoder;
use hailoseg_core::frame::{FrameIdentifier, Rect};
use hailoseg_core::logging::{self, LoggingInitOptions};
use hailoseg_core::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "hailoseg", about = "YOLOv8 instance segmentation pipeline driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

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

    #[arg(long, global = true, help = "Data directory for config and logs")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline against the simulated accelerator, submitting
    /// synthetic frames and reporting stage statistics.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value_t = 50, help = "Number of synthetic frames to submit")]
    frames: u64,

    #[arg(long, default_value_t = 33, help = "Delay between submissions, in milliseconds")]
    interval_ms: u64,

    #[arg(long, default_value_t = 3, help = "Number of simulated accelerator output streams")]
    outputs: usize,

    #[arg(long, default_value_t = 1, help = "Camera id attached to every submitted frame")]
    camera_id: u32,

    #[arg(long, help = "Override the pipeline's default confidence threshold")]
    confidence: Option<f32>,

    #[arg(long, help = "Explicit config file path (defaults to <data-dir>/config.toml)")]
    config: Option<PathBuf>,

    #[arg(long, help = "PostProcess worker count (defaults to host core count)")]
    post_workers: Option<usize>,

    #[arg(long, help = "Callback worker count (defaults to the config value)")]
    callback_workers: Option<usize>,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let _log_guard = init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        tracing::warn!(error = %e, "failed to initialize data directory");
    }
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Run(args) => run_demo(args, &resolved_data_dir),
    }
}

fn init_logging(
    data_dir: &std::path::Path,
    verbose: u8,
    explicit_filter: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let options = LoggingInitOptions {
        log_dir: Some(data_dir.join(logging::DEFAULT_LOG_DIR_NAME)),
        verbose,
        explicit_filter: explicit_filter.map(ToString::to_string),
        ..Default::default()
    };
    logging::init(&options)
}

fn log_startup_metadata(data_dir: &std::path::Path) {
    let pid = std::process::id();
    let cfg_path = config_path(data_dir);
    info!(pid, data_dir = %data_dir.display(), config_path = %cfg_path.display(), "startup");
}

/// A representative YOLOv8-seg output layout: `n` detection heads spread
/// evenly over the configured strides, each carrying a fixed feature count.
fn synthetic_metadata(config: &PipelineConfig, n: usize) -> ModelMetadata {
    let n = n.max(1);
    let (width, height) = config.network_dims();
    let strides = config.strides;

    let mut output_names = Vec::with_capacity(n);
    let mut output_shapes = Vec::with_capacity(n);
    let mut output_quant = Vec::with_capacity(n);
    for i in 0..n {
        let stride = strides[i % strides.len()];
        output_names.push(format!("head{i}_stride{stride}"));
        output_shapes.push(OutputShape {
            width: width / stride,
            height: height / stride,
            features: 4 * config.regression_length + config.num_classes,
        });
        output_quant.push(QuantInfo { scale: 1.0, zero_point: 0 });
    }

    ModelMetadata {
        input_width: width,
        input_height: height,
        input_frame_size: i420_frame_size(width, height),
        output_names,
        output_shapes,
        output_quant,
    }
}

fn i420_frame_size(width: u32, height: u32) -> usize {
    (width as usize * height as usize * 3) / 2
}

fn run_demo(args: RunArgs, data_dir: &std::path::Path) -> Result<()> {
    let cfg_path = args.config.clone().unwrap_or_else(|| config_path(data_dir));
    let mut config = PipelineConfig::load_from_path(&cfg_path)
        .with_context(|| format!("failed to load config: {}", cfg_path.display()))?
        .with_env_overrides();
    if let Some(confidence) = args.confidence {
        config.default_confidence_threshold = confidence;
    }

    let metadata = synthetic_metadata(&config, args.outputs);
    let device = Box::new(SimulatedAccelerator::new(metadata, Duration::from_millis(5)));
    let decoder = Arc::new(StubDecoder::new(2, (160, 160)));

    let pipeline = Pipeline::load(device, decoder, config.clone()).context("failed to load pipeline")?;

    let delivered = Arc::new(AtomicU64::new(0));
    let segments_seen = Arc::new(AtomicU64::new(0));
    let delivered_cb = delivered.clone();
    let segments_cb = segments_seen.clone();

    pipeline
        .start(
            move |result| {
                delivered_cb.fetch_add(1, Ordering::Relaxed);
                segments_cb.fetch_add(result.len() as u64, Ordering::Relaxed);
                info!(
                    camera_id = result.id.camera_id,
                    frame_id = result.id.frame_id,
                    segments = result.len(),
                    uncertain = result.uncertain_counter,
                    "frame delivered"
                );
            },
            args.post_workers,
            args.callback_workers,
        )
        .context("failed to start pipeline")?;

    let frame = vec![128u8; i420_frame_size(config.network_width, config.network_height)];
    let roi = Rect::new(0, 0, config.network_width as i32, config.network_height as i32);

    for frame_id in 0..args.frames {
        pipeline.submit(&frame, roi, FrameIdentifier::new(args.camera_id, frame_id), None)?;
        thread::sleep(Duration::from_millis(args.interval_ms));
    }

    // Give the pipeline a moment to drain what's already in flight before
    // tearing worker threads down.
    thread::sleep(Duration::from_millis(args.interval_ms * 4 + 200));
    pipeline.stop();

    println!("{}", pipeline.stats().report());
    info!(
        delivered = delivered.load(Ordering::Relaxed),
        segments = segments_seen.load(Ordering::Relaxed),
        "run complete"
    );

    Ok(())
}
