//! End-to-end merge: load and calibrate files in parallel, align, aggregate.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

use crate::config::{ConfigError, PipelineConfig};
use crate::core::calibration::{AngleOffsets, CalibrationError, DetectorCalibration};
use crate::core::loaders::{self, LoaderError, ProcessedDataset};
use crate::core::writers::WriteError;
use super::aggregator::{aggregate, MergedPattern};
use super::aligner::{sort_within_modules, AlignmentError, GridAligner};
use super::binning::{Binner, BinningError, CommonGrid};
use super::boundaries::{resolve_module_boundaries, ModuleBoundary};
use super::calibrator::ChannelCalibrator;

/// Failure classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed calibration, bad-channel or pipeline settings
    Configuration,
    /// Malformed or inconsistent data records
    DataFormat,
    /// Data that cannot be interpolated or binned
    DegenerateInput,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::DataFormat => "data format error",
            ErrorKind::DegenerateInput => "degenerate input",
            ErrorKind::Io => "I/O error",
        };
        f.write_str(name)
    }
}

/// Errors that abort a pipeline invocation.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error("failed to calibrate '{path}': {source}")]
    CalibrateFile {
        path: PathBuf,
        #[source]
        source: CalibrationError,
    },

    #[error(transparent)]
    Alignment(#[from] AlignmentError),

    #[error(transparent)]
    Binning(#[from] BinningError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("no input files given")]
    NoInputs,

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

fn loader_kind(error: &LoaderError) -> ErrorKind {
    match error {
        LoaderError::Io { .. } => ErrorKind::Io,
        LoaderError::DataFormat { .. } | LoaderError::EmptyFile(_) => ErrorKind::DataFormat,
        LoaderError::Configuration { .. } => ErrorKind::Configuration,
    }
}

fn calibration_kind(error: &CalibrationError) -> ErrorKind {
    match error {
        CalibrationError::Loader(e) => loader_kind(e),
        _ => ErrorKind::Configuration,
    }
}

impl PipelineError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config(_) => ErrorKind::Configuration,
            PipelineError::Loader(e) => loader_kind(e),
            PipelineError::Calibration(e) => calibration_kind(e),
            PipelineError::CalibrateFile { source, .. } => calibration_kind(source),
            PipelineError::Alignment(e) => match e {
                AlignmentError::InvalidStep(_) => ErrorKind::Configuration,
                AlignmentError::LengthMismatch { .. } => ErrorKind::DataFormat,
                AlignmentError::UnsortedModule { .. }
                | AlignmentError::NonFiniteAngle { .. }
                | AlignmentError::ZeroWidthInterval { .. } => ErrorKind::DegenerateInput,
            },
            PipelineError::Binning(e) => match e {
                BinningError::InvalidBinSize(_) => ErrorKind::Configuration,
                BinningError::NonFiniteAngle { .. } => ErrorKind::DegenerateInput,
            },
            PipelineError::Write(e) => match e {
                WriteError::MissingChannel { .. } | WriteError::LengthMismatch { .. } => {
                    ErrorKind::DataFormat
                }
                _ => ErrorKind::Io,
            },
            PipelineError::NoInputs | PipelineError::ThreadPool(_) => ErrorKind::Configuration,
        }
    }
}

/// How input files are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// `channel count` files, calibrated on load
    Raw,
    /// Already calibrated `angle count error [channel]` files
    Processed,
}

/// One acquisition to merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeInput {
    pub path: PathBuf,
    /// Detector encoder position during the acquisition (raw inputs only)
    pub encoder_position: f64,
}

impl MergeInput {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            encoder_position: 0.0,
        }
    }

    pub fn with_encoder_position(mut self, encoder_position: f64) -> Self {
        self.encoder_position = encoder_position;
        self
    }
}

/// Merge pipeline bound to one configuration and loaded calibration.
#[derive(Debug, Clone)]
pub struct MergePipeline {
    config: PipelineConfig,
    calibration: Arc<DetectorCalibration>,
    boundaries: Vec<ModuleBoundary>,
}

impl MergePipeline {
    /// Bind a calibration to a configuration.
    ///
    /// # Errors
    ///
    /// Fails when the detector geometry has no modules or no channels.
    pub fn new(config: PipelineConfig, calibration: Arc<DetectorCalibration>) -> Result<Self> {
        config.detector.validate()?;
        let boundaries = resolve_module_boundaries(
            config.detector.num_modules,
            config.detector.channels_per_module,
            &calibration.bad_channels,
        );
        Ok(Self {
            config,
            calibration,
            boundaries,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn calibration(&self) -> &DetectorCalibration {
        &self.calibration
    }

    pub fn boundaries(&self) -> &[ModuleBoundary] {
        &self.boundaries
    }

    /// Worker pool sized from `processing.worker_threads`.
    pub fn thread_pool(&self) -> Result<ThreadPool> {
        let threads = self.config.processing.worker_threads.max(1);
        Ok(ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("fusion-worker-{}", i))
            .build()?)
    }

    /// Load and calibrate one raw acquisition.
    pub fn calibrate_file(&self, path: &Path, encoder_position: f64) -> Result<ProcessedDataset> {
        let raw = loaders::load_raw_dataset(path)?;
        let offsets = AngleOffsets::from_config(&self.config.calibration, encoder_position);

        ChannelCalibrator::new(
            &self.calibration,
            self.config.detector.channels_per_module,
            offsets,
        )
        .and_then(|calibrator| calibrator.calibrate(&raw))
        .map_err(|source| PipelineError::CalibrateFile {
            path: path.to_path_buf(),
            source,
        })
    }

    fn load_input(&self, input: &MergeInput, kind: InputKind) -> Result<ProcessedDataset> {
        let dataset = match kind {
            InputKind::Raw => self.calibrate_file(&input.path, input.encoder_position)?,
            InputKind::Processed => loaders::load_processed_dataset(&input.path)?,
        };
        info!("Loaded {} ({} points)", dataset.label(), dataset.len());
        Ok(dataset)
    }

    /// Load every input on the calling thread's pool, in input order.
    fn load_all(&self, inputs: &[MergeInput], kind: InputKind) -> Result<Vec<ProcessedDataset>> {
        if inputs.is_empty() {
            return Err(PipelineError::NoInputs);
        }
        inputs
            .par_iter()
            .map(|input| self.load_input(input, kind))
            .collect()
    }

    /// Load every input in parallel on the worker pool.
    pub fn load_inputs(&self, inputs: &[MergeInput], kind: InputKind) -> Result<Vec<ProcessedDataset>> {
        let pool = self.thread_pool()?;
        pool.install(|| self.load_all(inputs, kind))
    }

    fn align_and_aggregate(&self, mut datasets: Vec<ProcessedDataset>) -> Result<MergedPattern> {
        let aligner = GridAligner::new(self.config.alignment.step)?;

        for dataset in &mut datasets {
            sort_within_modules(&mut dataset.points, &self.boundaries);
        }

        let samples = aligner.align_all(&datasets, &self.boundaries)?;
        debug!("{} aligned samples from {} datasets", samples.len(), datasets.len());

        let merged = aggregate(&samples, aligner.step());
        info!(
            "Merged {} datasets into {} points (max coverage {})",
            datasets.len(),
            merged.len(),
            merged.max_contributors
        );
        Ok(merged)
    }

    /// Align and aggregate datasets that are already in memory.
    pub fn merge_datasets(&self, datasets: Vec<ProcessedDataset>) -> Result<MergedPattern> {
        if datasets.is_empty() {
            return Err(PipelineError::NoInputs);
        }
        let pool = self.thread_pool()?;
        pool.install(|| self.align_and_aggregate(datasets))
    }

    /// Run the full merge over files.
    ///
    /// All inputs are loaded before alignment starts, and all alignment
    /// finishes before aggregation. The first failing file aborts the merge.
    pub fn merge(&self, inputs: &[MergeInput], kind: InputKind) -> Result<MergedPattern> {
        let pool = self.thread_pool()?;
        pool.install(|| {
            let datasets = self.load_all(inputs, kind)?;
            self.align_and_aggregate(datasets)
        })
    }

    /// Bin the inputs onto a common grid, optionally restricted to an angle range.
    pub fn overlay(
        &self,
        inputs: &[MergeInput],
        kind: InputKind,
        range: Option<(f64, f64)>,
    ) -> Result<CommonGrid> {
        let binner = Binner::new(self.config.binning.bin_size)?;
        let datasets = self.load_inputs(inputs, kind)?;

        let grid = binner.overlay(&datasets)?;
        let grid = match range {
            Some((min_angle, max_angle)) => grid.slice(min_angle, max_angle),
            None => grid,
        };
        info!(
            "Binned {} datasets into {} bins of {}",
            grid.num_series(),
            grid.len(),
            binner.bin_size()
        );
        Ok(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::calibration::{BadChannelSet, CalibrationModel, ModuleCalibration};
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.detector.num_modules = 2;
        config.detector.channels_per_module = 4;
        config.alignment.step = 0.5;
        config.binning.bin_size = 10.0;
        config.processing.worker_threads = 2;
        config
    }

    fn golden_calibration(bad: &[usize]) -> Arc<DetectorCalibration> {
        let modules: BTreeMap<usize, ModuleCalibration> = (0..2)
            .map(|module| {
                (
                    module,
                    ModuleCalibration {
                        module,
                        center: 1.5,
                        conversion: 1.0,
                        offset: 0.0,
                    },
                )
            })
            .collect();
        Arc::new(DetectorCalibration::new(
            CalibrationModel::Full(modules),
            bad.iter().copied().collect::<BadChannelSet>(),
        ))
    }

    fn write_raw(dir: &Path, name: &str, counts: &[f64]) -> PathBuf {
        let path = dir.join(name);
        let content: String = counts
            .iter()
            .enumerate()
            .map(|(ch, c)| format!("{} {}\n", ch, c))
            .collect();
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_calibrate_file() {
        let dir = TempDir::new().unwrap();
        let path = write_raw(dir.path(), "scan.raw", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let pipeline = MergePipeline::new(test_config(), golden_calibration(&[2])).unwrap();

        let processed = pipeline.calibrate_file(&path, 10.0).unwrap();

        assert_eq!(processed.len(), 7);
        assert!((processed.points[0].angle - (10.0 - 56.309932474020215)).abs() < 1e-9);
        assert_eq!(processed.source_path.as_deref(), Some(path.as_path()));
        assert_eq!(pipeline.boundaries()[1].first, 3);
    }

    #[test]
    fn test_merge_identical_scans_sums_every_module() {
        let dir = TempDir::new().unwrap();
        let counts = [4.0, 4.0, 4.0, 4.0, 9.0, 9.0, 9.0, 9.0];
        let inputs = vec![
            MergeInput::new(write_raw(dir.path(), "a.raw", &counts)),
            MergeInput::new(write_raw(dir.path(), "b.raw", &counts)),
        ];
        let pipeline = MergePipeline::new(test_config(), golden_calibration(&[])).unwrap();

        let merged = pipeline.merge(&inputs, InputKind::Raw).unwrap();

        assert_eq!(merged.max_contributors, 4);
        assert!(!merged.is_empty());
        for window in merged.points.windows(2) {
            assert!(window[0].grid_index < window[1].grid_index);
        }
        // Both modules cover the same angles, flat counts 4 and 9 per scan
        for point in &merged.points {
            assert!((point.count - 26.0).abs() < 1e-9);
            assert!((point.error - point.count.sqrt()).abs() < 1e-12);
        }
    }

    #[test]
    fn test_merge_shifted_scans_rescales_edges() {
        let dir = TempDir::new().unwrap();
        let counts = [2.0; 8];
        let inputs = vec![
            MergeInput::new(write_raw(dir.path(), "a.raw", &counts)),
            MergeInput::new(write_raw(dir.path(), "b.raw", &counts)).with_encoder_position(20.0),
        ];
        let pipeline = MergePipeline::new(test_config(), golden_calibration(&[])).unwrap();

        let merged = pipeline.merge(&inputs, InputKind::Raw).unwrap();

        // Every grid point is rescaled to the best coverage (4 modules overlapping)
        assert_eq!(merged.max_contributors, 4);
        for point in &merged.points {
            assert!((point.count - 8.0).abs() < 1e-9);
        }
        let (min, max) = merged.angle_range().unwrap();
        assert!(min >= -56.31 && max <= 76.31);
    }

    #[test]
    fn test_merge_processed_roundtrip_through_disk() {
        let dir = TempDir::new().unwrap();
        let raw = write_raw(dir.path(), "a.raw", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let pipeline = MergePipeline::new(test_config(), golden_calibration(&[])).unwrap();

        let processed = pipeline.calibrate_file(&raw, 0.0).unwrap();
        let out = dir.path().join("a.dat");
        crate::core::writers::write_processed(&out, &processed, true).unwrap();

        let from_raw = pipeline.merge(&[MergeInput::new(&raw)], InputKind::Raw).unwrap();
        let from_dat = pipeline.merge(&[MergeInput::new(&out)], InputKind::Processed).unwrap();

        assert_eq!(from_raw.len(), from_dat.len());
        for (a, b) in from_raw.points.iter().zip(&from_dat.points) {
            assert_eq!(a.grid_index, b.grid_index);
            assert!((a.count - b.count).abs() < 1e-3);
        }
    }

    #[test]
    fn test_error_kinds() {
        let dir = TempDir::new().unwrap();
        let pipeline = MergePipeline::new(test_config(), golden_calibration(&[])).unwrap();

        let missing = pipeline
            .merge(&[MergeInput::new(dir.path().join("nope.raw"))], InputKind::Raw)
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::Io);

        let bad = dir.path().join("bad.raw");
        fs::write(&bad, "0 1\n1 x\n").unwrap();
        let malformed = pipeline.merge(&[MergeInput::new(&bad)], InputKind::Raw).unwrap_err();
        assert_eq!(malformed.kind(), ErrorKind::DataFormat);

        let too_wide = write_raw(dir.path(), "wide.raw", &[1.0; 12]);
        let err = pipeline.merge(&[MergeInput::new(&too_wide)], InputKind::Raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("wide.raw"));

        assert_eq!(
            pipeline.merge(&[], InputKind::Raw).unwrap_err().kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn test_simple_mode_data_is_degenerate_for_alignment() {
        let dir = TempDir::new().unwrap();
        let raw = write_raw(dir.path(), "a.raw", &[1.0; 8]);

        // On-grid and off-grid module angles are both rejected
        for (angles, step) in [([10.0, 20.0], 0.5), ([12.55, 20.03], 0.1)] {
            let calibration = Arc::new(DetectorCalibration::new(
                CalibrationModel::Simple(angles.into_iter().enumerate().collect()),
                BadChannelSet::new(),
            ));
            let mut config = test_config();
            config.alignment.step = step;
            let pipeline = MergePipeline::new(config, calibration).unwrap();

            let err = pipeline.merge(&[MergeInput::new(&raw)], InputKind::Raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DegenerateInput);
        }
    }

    #[test]
    fn test_empty_detector_geometry_is_a_configuration_error() {
        let mut config = test_config();
        config.detector.channels_per_module = 0;
        config.calibration.mode = crate::config::CalibrationMode::Uncalibrated;
        let calibration = Arc::new(DetectorCalibration::new(
            CalibrationModel::Uncalibrated,
            BadChannelSet::new(),
        ));

        let err = MergePipeline::new(config, calibration).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::NoChannelsPerModule)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_overlay_with_range() {
        let dir = TempDir::new().unwrap();
        let inputs = vec![
            MergeInput::new(write_raw(dir.path(), "a.raw", &[1.0; 8])),
            MergeInput::new(write_raw(dir.path(), "b.raw", &[3.0; 8])).with_encoder_position(30.0),
        ];
        let pipeline = MergePipeline::new(test_config(), golden_calibration(&[])).unwrap();

        let full = pipeline.overlay(&inputs, InputKind::Raw, None).unwrap();
        let sliced = pipeline.overlay(&inputs, InputKind::Raw, Some((0.0, 25.0))).unwrap();

        assert_eq!(full.num_series(), 2);
        assert!(sliced.len() < full.len());
        assert!(sliced.angles.iter().all(|&a| (0.0..=25.0).contains(&a)));
    }
}
