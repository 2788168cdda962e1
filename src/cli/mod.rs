//! Command-line interface for the fusion pipeline.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::config::CalibrationMode;
use crate::core::calibration::DetectorCalibration;
use crate::core::loaders::{self, MergedDataPoint};
use crate::core::writers;
use crate::processors::frames;
use crate::processors::pipeline::{InputKind, MergeInput, MergePipeline, PipelineError};
use crate::visualization;
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "strip-fusion")]
#[command(about = "Strip detector calibration and multi-scan fusion", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the calibration and processing sections of the config.
#[derive(Args, Debug, Default)]
struct CalibrationArgs {
    /// Calibration mode
    #[arg(long, value_enum)]
    mode: Option<CalibrationMode>,
    /// Folder holding calibration, bad-channel and flat-field files
    #[arg(long)]
    calibration_folder: Option<PathBuf>,
    /// Worker threads for parallel file processing
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate raw files into processed .dat files
    Process {
        /// Raw file, or directory of frame files with --batch
        input: PathBuf,
        /// Output file (single-file mode; defaults to input with .dat extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Convert every frame file in the input directory
        #[arg(long)]
        batch: bool,
        /// Only convert frames of this scan number (batch mode)
        #[arg(long)]
        scan: Option<u64>,
        /// Detector encoder position (degrees)
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        encoder: f64,
        /// Write the 4-column form with channel numbers
        #[arg(long)]
        include_channel: bool,
        #[command(flatten)]
        calibration: CalibrationArgs,
    },

    /// Merge several acquisitions into one pattern
    Merge {
        /// Input files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Output merged .dat file
        #[arg(short, long)]
        output: PathBuf,
        /// Inputs are processed files instead of raw files
        #[arg(long)]
        processed: bool,
        /// Encoder position per raw input (one value for all, or one per input)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        encoder: Vec<f64>,
        /// Grid step (degrees)
        #[arg(long)]
        step: Option<f64>,
        /// Also export the pattern as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Also render the pattern as PNG
        #[arg(long)]
        plot: Option<PathBuf>,
        /// Write the 4-column form with grid indices
        #[arg(long)]
        include_channel: bool,
        #[command(flatten)]
        calibration: CalibrationArgs,
    },

    /// Bin several acquisitions onto a common grid for comparison
    Overlay {
        /// Input files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Output overlay file
        #[arg(short, long)]
        output: PathBuf,
        /// Inputs are processed files instead of raw files
        #[arg(long)]
        processed: bool,
        /// Encoder position per raw input (one value for all, or one per input)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        encoder: Vec<f64>,
        /// Bin width (degrees)
        #[arg(long)]
        bin_size: Option<f64>,
        /// Lower angle of the extracted range
        #[arg(long, requires = "max_angle", allow_negative_numbers = true)]
        min_angle: Option<f64>,
        /// Upper angle of the extracted range
        #[arg(long, requires = "min_angle", allow_negative_numbers = true)]
        max_angle: Option<f64>,
        /// Also render the overlay as PNG
        #[arg(long)]
        plot: Option<PathBuf>,
        #[command(flatten)]
        calibration: CalibrationArgs,
    },

    /// Plot a processed or merged file as PNG
    Plot {
        /// Input .dat file
        input: PathBuf,
        /// Output PNG file path (defaults to input with .png extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Draw error bars
        #[arg(long)]
        errors: bool,
    },

    /// Write a configuration file with default values
    InitConfig {
        /// Output YAML path
        #[arg(default_value = "pipeline.yaml")]
        output: PathBuf,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            let head: String = value.chars().take(36).collect();
            format!("{}...", head)
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                error!("Failed to load config from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => PipelineConfig::default(),
    };

    let result = match cli.command {
        Commands::Process { input, output, batch, scan, encoder, include_channel, calibration } => {
            cmd_process(&input, output, batch, scan, encoder, include_channel, &calibration, config)
        }
        Commands::Merge { inputs, output, processed, encoder, step, csv, plot, include_channel, calibration } => {
            cmd_merge(
                &inputs, &output, processed, &encoder, step, csv, plot, include_channel, &calibration, config,
            )
        }
        Commands::Overlay { inputs, output, processed, encoder, bin_size, min_angle, max_angle, plot, calibration } => {
            let range = min_angle.zip(max_angle);
            cmd_overlay(&inputs, &output, processed, &encoder, bin_size, range, plot, &calibration, config)
        }
        Commands::Plot { input, output, errors } => cmd_plot(&input, output, errors),
        Commands::InitConfig { output } => cmd_init_config(&output),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(mut config: PipelineConfig, args: &CalibrationArgs) -> PipelineConfig {
    if let Some(mode) = args.mode {
        config.calibration.mode = mode;
    }
    if let Some(folder) = &args.calibration_folder {
        config.calibration.folder = folder.clone();
    }
    if let Some(workers) = args.workers {
        config.processing.worker_threads = workers;
    }
    config
}

/// Attach the failure class to a pipeline error.
fn classified(e: PipelineError, what: &str) -> anyhow::Error {
    let kind = e.kind();
    anyhow::Error::new(e).context(format!("{} failed ({})", what, kind))
}

/// Each invocation loads its calibration once and shares it across workers.
fn load_calibration(config: &PipelineConfig) -> Result<Arc<DetectorCalibration>> {
    DetectorCalibration::load(&config.calibration, &config.detector)
        .map(Arc::new)
        .map_err(|e| classified(e.into(), "Loading calibration"))
}

fn build_pipeline(config: PipelineConfig) -> Result<MergePipeline> {
    let calibration = load_calibration(&config)?;
    MergePipeline::new(config, calibration).map_err(|e| classified(e, "Configuring pipeline"))
}

/// Pair input paths with encoder positions: none, one shared, or one each.
fn merge_inputs(paths: &[PathBuf], encoders: &[f64]) -> Result<Vec<MergeInput>> {
    let positions: Vec<f64> = match encoders.len() {
        0 => vec![0.0; paths.len()],
        1 => vec![encoders[0]; paths.len()],
        n if n == paths.len() => encoders.to_vec(),
        n => bail!("{} encoder positions given for {} inputs", n, paths.len()),
    };

    Ok(paths
        .iter()
        .zip(positions)
        .map(|(path, position)| MergeInput::new(path).with_encoder_position(position))
        .collect())
}

fn input_kind(processed: bool) -> InputKind {
    if processed {
        InputKind::Processed
    } else {
        InputKind::Raw
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_process(
    input: &Path,
    output: Option<PathBuf>,
    batch: bool,
    scan: Option<u64>,
    encoder: f64,
    include_channel: bool,
    args: &CalibrationArgs,
    config: PipelineConfig,
) -> Result<()> {
    let start = Instant::now();
    let config = apply_overrides(config, args);
    let include_channel = include_channel || config.output.include_channel;

    let pipeline = build_pipeline(config)?;

    if batch {
        println!("Converting frame files in batch mode...");
        println!("Input directory: {}", input.display());

        let prefix = scan.map(frames::scan_prefix);
        let frame_files = frames::find_frame_files(input, prefix.as_deref())?;
        if frame_files.is_empty() {
            bail!("No frame files found in {}", input.display());
        }

        let spinner = create_spinner(&format!("Calibrating {} frames...", frame_files.len()));
        let summary = frames::convert_frames(&pipeline, &frame_files, encoder, include_channel);
        spinner.finish_and_clear();
        let summary = summary?;

        print_summary(
            "Batch Conversion Complete",
            &[
                ("Input directory", input.display().to_string()),
                ("Frames found", summary.total().to_string()),
                ("Processed", summary.processed.len().to_string()),
                ("Failed", summary.failed.len().to_string()),
                ("Duration", format!("{:.2?}", start.elapsed())),
            ],
        );

        if !summary.failed.is_empty() {
            bail!("{} of {} frames failed", summary.failed.len(), summary.total());
        }
    } else {
        let output_path = output.unwrap_or_else(|| frames::processed_path_for(input));

        println!("Converting single file...");
        println!("Input: {}", input.display());
        println!("Output: {}", output_path.display());

        let spinner = create_spinner("Calibrating channels...");
        let dataset = pipeline.calibrate_file(input, encoder);
        spinner.finish_and_clear();
        let dataset = dataset.map_err(|e| classified(e, "Calibration"))?;

        writers::write_processed(&output_path, &dataset, include_channel)
            .with_context(|| format!("Failed to write {}", output_path.display()))?;

        print_summary(
            "Conversion Complete",
            &[
                ("Input file", input.display().to_string()),
                ("Output file", output_path.display().to_string()),
                ("Points written", dataset.len().to_string()),
                ("Mode", pipeline.calibration().model.mode().to_string()),
                ("Duration", format!("{:.2?}", start.elapsed())),
            ],
        );
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_merge(
    inputs: &[PathBuf],
    output: &Path,
    processed: bool,
    encoder: &[f64],
    step: Option<f64>,
    csv: Option<PathBuf>,
    plot: Option<PathBuf>,
    include_channel: bool,
    args: &CalibrationArgs,
    config: PipelineConfig,
) -> Result<()> {
    let start = Instant::now();
    let mut config = apply_overrides(config, args);
    if let Some(step) = step {
        config.alignment.step = step;
    }
    let include_channel = include_channel || config.output.include_channel;

    let merge_inputs = merge_inputs(inputs, encoder)?;
    let pipeline = build_pipeline(config)?;

    println!("Merging {} acquisitions...", merge_inputs.len());
    println!("Output: {}", output.display());

    let spinner = create_spinner("Loading, aligning and summing...");
    let merged = pipeline.merge(&merge_inputs, input_kind(processed));
    spinner.finish_and_clear();
    let merged = merged.map_err(|e| classified(e, "Merge"))?;

    writers::write_merged(output, &merged.points, include_channel)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if let Some(csv_path) = &csv {
        writers::write_merged_csv(csv_path, &merged.points)
            .with_context(|| format!("Failed to write {}", csv_path.display()))?;
    }
    if let Some(plot_path) = &plot {
        visualization::plot_merged(plot_path, &merged.points, false)
            .with_context(|| format!("Failed to plot {}", plot_path.display()))?;
    }

    let range = merged
        .angle_range()
        .map(|(min, max)| format!("{:.4} .. {:.4}", min, max))
        .unwrap_or_else(|| "empty".to_string());

    print_summary(
        "Merge Complete",
        &[
            ("Inputs", merge_inputs.len().to_string()),
            ("Output file", output.display().to_string()),
            ("Grid step", merged.step.to_string()),
            ("Points", merged.len().to_string()),
            ("Angle range", range),
            ("Max coverage", merged.max_contributors.to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_overlay(
    inputs: &[PathBuf],
    output: &Path,
    processed: bool,
    encoder: &[f64],
    bin_size: Option<f64>,
    range: Option<(f64, f64)>,
    plot: Option<PathBuf>,
    args: &CalibrationArgs,
    config: PipelineConfig,
) -> Result<()> {
    let start = Instant::now();
    let mut config = apply_overrides(config, args);
    if let Some(bin_size) = bin_size {
        config.binning.bin_size = bin_size;
    }

    let merge_inputs = merge_inputs(inputs, encoder)?;
    let pipeline = build_pipeline(config)?;

    let spinner = create_spinner("Binning acquisitions...");
    let grid = pipeline.overlay(&merge_inputs, input_kind(processed), range);
    spinner.finish_and_clear();
    let grid = grid.map_err(|e| classified(e, "Overlay"))?;

    writers::write_overlay(output, &grid.angles, &grid.series)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if let Some(plot_path) = &plot {
        visualization::plot_overlay(plot_path, &grid)
            .with_context(|| format!("Failed to plot {}", plot_path.display()))?;
    }

    let range_text = range
        .map(|(min, max)| format!("{} .. {}", min, max))
        .unwrap_or_else(|| "all".to_string());

    print_summary(
        "Overlay Complete",
        &[
            ("Inputs", merge_inputs.len().to_string()),
            ("Output file", output.display().to_string()),
            ("Bin size", pipeline.config().binning.bin_size.to_string()),
            ("Range", range_text),
            ("Bins", grid.len().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );

    Ok(())
}

fn cmd_plot(input: &Path, output: Option<PathBuf>, errors: bool) -> Result<()> {
    let start = Instant::now();

    let output_path = output.unwrap_or_else(|| input.with_extension("png"));

    let spinner = create_spinner("Loading data file...");
    let dataset = loaders::load_processed_dataset(input);
    let dataset = match dataset {
        Ok(d) => d,
        Err(e) => {
            spinner.finish_and_clear();
            return Err(e).with_context(|| format!("Failed to load {}", input.display()));
        }
    };

    let points: Vec<MergedDataPoint> = dataset
        .points
        .iter()
        .enumerate()
        .map(|(i, p)| MergedDataPoint {
            grid_index: p.channel.unwrap_or(i as i64),
            angle: p.angle,
            count: p.count,
            error: p.error,
        })
        .collect();

    spinner.set_message("Generating plot...");
    let result = visualization::plot_merged(&output_path, &points, errors);
    spinner.finish_and_clear();
    result.with_context(|| format!("Failed to plot {}", output_path.display()))?;

    print_summary(
        "Plot Complete",
        &[
            ("Input file", input.display().to_string()),
            ("Output PNG", output_path.display().to_string()),
            ("Points", points.len().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );

    Ok(())
}

fn cmd_init_config(output: &Path) -> Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }

    PipelineConfig::default()
        .to_yaml(output)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", output.display(), e))?;

    print_summary(
        "Config Written",
        &[("Output file", output.display().to_string())],
    );
    Ok(())
}
