//! Configuration types for the fusion pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Settings that cannot describe a usable pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("detector must have at least one module")]
    NoModules,

    #[error("detector modules must have at least one channel")]
    NoChannelsPerModule,
}

/// Geometry of the segmented strip detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Number of detector modules
    #[serde(default = "default_num_modules")]
    pub num_modules: usize,

    /// Channels in each module (identical for every module)
    #[serde(default = "default_channels_per_module")]
    pub channels_per_module: usize,
}

fn default_num_modules() -> usize {
    24
}

fn default_channels_per_module() -> usize {
    1280
}

impl DetectorConfig {
    /// Total number of hardware channels across all modules.
    pub fn total_channels(&self) -> usize {
        self.num_modules * self.channels_per_module
    }

    /// Reject geometries that leave no channels to calibrate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_modules == 0 {
            return Err(ConfigError::NoModules);
        }
        if self.channels_per_module == 0 {
            return Err(ConfigError::NoChannelsPerModule);
        }
        Ok(())
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            num_modules: default_num_modules(),
            channels_per_module: default_channels_per_module(),
        }
    }
}

/// Angular model used to turn channel numbers into scattering angles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMode {
    /// Per-module center/conversion/offset arctan model
    Full,
    /// One direct angle per module
    Simple,
    /// Angle equals the channel index
    Uncalibrated,
}

impl std::fmt::Display for CalibrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CalibrationMode::Full => "full",
            CalibrationMode::Simple => "simple",
            CalibrationMode::Uncalibrated => "uncalibrated",
        };
        f.write_str(name)
    }
}

/// Key identifying one loaded calibration. It holds every input the loader
/// reads, so two equal descriptors always load the same calibration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CalibrationDescriptor {
    pub mode: CalibrationMode,
    pub folder: PathBuf,
    pub calibration_file: String,
    pub bad_channels_file: String,
    pub flat_field_file: Option<String>,
    pub channels_per_module: usize,
}

/// Calibration folder layout and the additive angle terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Angular model
    #[serde(default = "default_calibration_mode")]
    pub mode: CalibrationMode,

    /// Folder holding the calibration, bad-channel and flat-field files
    #[serde(default = "default_calibration_folder")]
    pub folder: PathBuf,

    /// Module calibration file name inside `folder`
    #[serde(default = "default_calibration_file")]
    pub calibration_file: String,

    /// Bad channel list file name inside `folder`
    #[serde(default = "default_bad_channels_file")]
    pub bad_channels_file: String,

    /// Flat-field reference (raw format) inside `folder`; no correction when unset
    #[serde(default)]
    pub flat_field_file: Option<String>,

    /// Constant added to every calibrated angle (degrees)
    #[serde(default)]
    pub base_angle: f64,

    /// Global detector offset (degrees)
    #[serde(default)]
    pub global_offset: f64,

    /// Beamline-specific offset (degrees)
    #[serde(default)]
    pub beamline_offset: f64,
}

fn default_calibration_mode() -> CalibrationMode {
    CalibrationMode::Full
}

fn default_calibration_folder() -> PathBuf {
    PathBuf::from("calibration")
}

fn default_calibration_file() -> String {
    "angular_calibration.dat".to_string()
}

fn default_bad_channels_file() -> String {
    "bad_channels.txt".to_string()
}

impl CalibrationConfig {
    /// The memoisation key for this calibration on `detector`.
    pub fn descriptor(&self, detector: &DetectorConfig) -> CalibrationDescriptor {
        CalibrationDescriptor {
            mode: self.mode,
            folder: self.folder.clone(),
            calibration_file: self.calibration_file.clone(),
            bad_channels_file: self.bad_channels_file.clone(),
            flat_field_file: self.flat_field_file.clone(),
            channels_per_module: detector.channels_per_module,
        }
    }

    pub fn calibration_path(&self) -> PathBuf {
        self.folder.join(&self.calibration_file)
    }

    pub fn bad_channels_path(&self) -> PathBuf {
        self.folder.join(&self.bad_channels_file)
    }

    pub fn flat_field_path(&self) -> Option<PathBuf> {
        self.flat_field_file.as_ref().map(|name| self.folder.join(name))
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            mode: default_calibration_mode(),
            folder: default_calibration_folder(),
            calibration_file: default_calibration_file(),
            bad_channels_file: default_bad_channels_file(),
            flat_field_file: None,
            base_angle: 0.0,
            global_offset: 0.0,
            beamline_offset: 0.0,
        }
    }
}

/// Configuration for grid alignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Angular step of the shared grid (degrees)
    #[serde(default = "default_step")]
    pub step: f64,
}

fn default_step() -> f64 {
    0.004
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self { step: default_step() }
    }
}

/// Configuration for quick-look binning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinningConfig {
    /// Bin width (degrees)
    #[serde(default = "default_bin_size")]
    pub bin_size: f64,
}

fn default_bin_size() -> f64 {
    0.01
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            bin_size: default_bin_size(),
        }
    }
}

/// Configuration for file processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Size of the worker pool loading files in parallel
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

/// Configuration for written records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Write the 4-column legacy form (with channel column and header block)
    #[serde(default)]
    pub include_channel: bool,
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub alignment: AlignmentConfig,

    #[serde(default)]
    pub binning: BinningConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_pipeline_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.detector.channels_per_module, 1280);
        assert_eq!(config.detector.total_channels(), 24 * 1280);
        assert_eq!(config.calibration.mode, CalibrationMode::Full);
        assert!(config.calibration.flat_field_file.is_none());
        assert!(config.processing.worker_threads >= 1);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "detector:\n  num_modules: 2\n  channels_per_module: 4\ncalibration:\n  mode: simple\n";
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.detector.total_channels(), 8);
        assert_eq!(config.calibration.mode, CalibrationMode::Simple);
        assert_eq!(config.calibration.calibration_file, "angular_calibration.dat");
        assert_eq!(config.alignment.step, 0.004);
    }

    #[test]
    fn test_descriptor_equality_follows_loaded_inputs() {
        let detector = DetectorConfig::default();
        let mut config = CalibrationConfig::default();
        let first = config.descriptor(&detector);
        config.global_offset = 1.5;
        assert_eq!(first, config.descriptor(&detector));

        config.flat_field_file = Some("ff2.raw".to_string());
        assert_ne!(first, config.descriptor(&detector));

        let mut bad = CalibrationConfig::default();
        bad.bad_channels_file = "other_bad.txt".to_string();
        assert_ne!(first, bad.descriptor(&detector));

        let narrow = DetectorConfig {
            num_modules: 24,
            channels_per_module: 640,
        };
        assert_ne!(first, CalibrationConfig::default().descriptor(&narrow));

        config.mode = CalibrationMode::Uncalibrated;
        assert_ne!(first, config.descriptor(&detector));
    }

    #[test]
    fn test_detector_validation() {
        assert!(DetectorConfig::default().validate().is_ok());

        let yaml = "detector:\n  num_modules: 2\n  channels_per_module: 0\n";
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.detector.validate(), Err(ConfigError::NoChannelsPerModule));

        let empty = DetectorConfig {
            num_modules: 0,
            channels_per_module: 4,
        };
        assert_eq!(empty.validate(), Err(ConfigError::NoModules));
    }

    #[test]
    fn test_yaml_roundtrip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        let mut config = PipelineConfig::default();
        config.alignment.step = 0.01;
        config.calibration.flat_field_file = Some("ff.raw".to_string());
        config.to_yaml(&path).unwrap();

        let loaded = PipelineConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded.alignment.step, 0.01);
        assert_eq!(
            loaded.calibration.flat_field_path(),
            Some(PathBuf::from("calibration").join("ff.raw"))
        );
    }
}
