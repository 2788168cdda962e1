//! Detector calibration: angular model, bad channels, flat field and the
//! memoised calibration store.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use crate::config::{CalibrationConfig, CalibrationDescriptor, CalibrationMode, ConfigError, DetectorConfig};
use super::loaders::{self, LoaderError, RawDataset};

/// Errors raised while building or applying a calibration.
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("channel {channel} belongs to module {module}, which has no calibration entry")]
    MissingModule { channel: usize, module: usize },

    #[error("flat field has no factor for channel {channel}")]
    MissingFlatField { channel: usize },

    #[error("flat-field reference count is zero at retained channel {channel}; list it as bad")]
    ZeroFlatFieldReference { channel: usize },

    #[error("flat-field reference has no usable channels")]
    EmptyFlatFieldReference,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Loader(#[from] LoaderError),
}

/// Result type for calibration operations.
pub type Result<T> = std::result::Result<T, CalibrationError>;

/// Arctan calibration of one module.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModuleCalibration {
    pub module: usize,
    /// Channel-in-module position of the module's normal, in `[0, channels_per_module)`.
    pub center: f64,
    pub conversion: f64,
    /// Module angular offset (degrees)
    pub offset: f64,
}

impl ModuleCalibration {
    /// Angle of a channel relative to the detector position, in degrees.
    #[inline]
    pub fn angle_at(&self, channel_in_module: usize) -> f64 {
        let x = (channel_in_module as f64 - self.center) * self.conversion;
        self.offset + x.atan().to_degrees()
    }
}

/// Angular model, chosen once when the calibration is loaded.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationModel {
    Full(BTreeMap<usize, ModuleCalibration>),
    /// One direct angle per module.
    Simple(BTreeMap<usize, f64>),
    /// Angle equals the channel index.
    Uncalibrated,
}

impl CalibrationModel {
    pub fn mode(&self) -> CalibrationMode {
        match self {
            CalibrationModel::Full(_) => CalibrationMode::Full,
            CalibrationModel::Simple(_) => CalibrationMode::Simple,
            CalibrationModel::Uncalibrated => CalibrationMode::Uncalibrated,
        }
    }

    /// Number of calibrated modules (zero when uncalibrated).
    pub fn module_count(&self) -> usize {
        match self {
            CalibrationModel::Full(modules) => modules.len(),
            CalibrationModel::Simple(angles) => angles.len(),
            CalibrationModel::Uncalibrated => 0,
        }
    }
}

/// Absolute channels excluded from every downstream stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BadChannelSet {
    channels: BTreeSet<usize>,
}

impl BadChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_set(channels: BTreeSet<usize>) -> Self {
        Self { channels }
    }

    #[inline]
    pub fn contains(&self, channel: usize) -> bool {
        self.channels.contains(&channel)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Number of bad channels within `range`.
    pub fn count_in(&self, range: Range<usize>) -> usize {
        self.channels.range(range).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.channels.iter().copied()
    }
}

impl FromIterator<usize> for BadChannelSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self {
            channels: iter.into_iter().collect(),
        }
    }
}

/// Per-channel multiplicative correction derived from a reference acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatFieldCorrection {
    factors: BTreeMap<usize, f64>,
}

impl FlatFieldCorrection {
    /// Derive factors `mean / reference[channel]` over the non-bad reference channels.
    ///
    /// # Errors
    ///
    /// Fails when no reference channel survives the bad-channel filter, or
    /// when a retained channel has a zero reference count.
    pub fn from_reference(reference: &RawDataset, bad: &BadChannelSet) -> Result<Self> {
        let retained: Vec<_> = reference
            .samples
            .iter()
            .filter(|s| !bad.contains(s.channel))
            .collect();

        if retained.is_empty() {
            return Err(CalibrationError::EmptyFlatFieldReference);
        }

        let mean = retained.iter().map(|s| s.count).sum::<f64>() / retained.len() as f64;

        let mut factors = BTreeMap::new();
        for sample in retained {
            if sample.count == 0.0 {
                return Err(CalibrationError::ZeroFlatFieldReference {
                    channel: sample.channel,
                });
            }
            factors.insert(sample.channel, mean / sample.count);
        }

        Ok(Self { factors })
    }

    #[inline]
    pub fn factor(&self, channel: usize) -> Option<f64> {
        self.factors.get(&channel).copied()
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }
}

/// Additive angle terms applied on top of the module model (degrees).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AngleOffsets {
    pub base_angle: f64,
    /// Detector encoder position of the acquisition
    pub encoder_position: f64,
    pub global_offset: f64,
    pub beamline_offset: f64,
}

impl AngleOffsets {
    /// Configured offsets combined with one acquisition's encoder position.
    pub fn from_config(config: &CalibrationConfig, encoder_position: f64) -> Self {
        Self {
            base_angle: config.base_angle,
            encoder_position,
            global_offset: config.global_offset,
            beamline_offset: config.beamline_offset,
        }
    }

    #[inline]
    pub fn total(&self) -> f64 {
        self.base_angle + self.encoder_position + self.global_offset + self.beamline_offset
    }
}

/// Loaded, immutable calibration bundle.
#[derive(Debug, Clone)]
pub struct DetectorCalibration {
    pub model: CalibrationModel,
    pub bad_channels: BadChannelSet,
    pub flat_field: Option<FlatFieldCorrection>,
}

impl DetectorCalibration {
    pub fn new(model: CalibrationModel, bad_channels: BadChannelSet) -> Self {
        Self {
            model,
            bad_channels,
            flat_field: None,
        }
    }

    pub fn with_flat_field(mut self, flat_field: FlatFieldCorrection) -> Self {
        self.flat_field = Some(flat_field);
        self
    }

    /// Load the calibration folder described by `config`.
    pub fn load(config: &CalibrationConfig, detector: &DetectorConfig) -> Result<Self> {
        detector.validate()?;
        info!(
            "Loading {} calibration from {}",
            config.mode,
            config.folder.display()
        );

        let model = loaders::load_calibration_model(
            config.calibration_path(),
            config.mode,
            detector.channels_per_module,
        )?;
        let bad_channels = loaders::load_bad_channels(config.bad_channels_path())?;
        debug!(
            "{} module entries, {} bad channels",
            model.module_count(),
            bad_channels.len()
        );

        let mut calibration = Self::new(model, bad_channels);
        if let Some(path) = config.flat_field_path() {
            let reference = loaders::load_raw_dataset(&path)?;
            let flat_field = FlatFieldCorrection::from_reference(&reference, &calibration.bad_channels)?;
            debug!("Flat field covers {} channels", flat_field.len());
            calibration = calibration.with_flat_field(flat_field);
        }

        Ok(calibration)
    }
}

/// Memoises the most recently loaded calibration, keyed by its descriptor.
///
/// The stored value is only replaced when a request arrives with a
/// different descriptor.
#[derive(Debug, Default)]
pub struct CalibrationCache {
    entry: Option<(CalibrationDescriptor, Arc<DetectorCalibration>)>,
}

impl CalibrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached calibration for `descriptor`, running `load` on a miss.
    pub fn get_or_load<F>(
        &mut self,
        descriptor: &CalibrationDescriptor,
        load: F,
    ) -> Result<Arc<DetectorCalibration>>
    where
        F: FnOnce() -> Result<DetectorCalibration>,
    {
        if let Some((key, calibration)) = &self.entry {
            if key == descriptor {
                debug!("Calibration cache hit for {}", descriptor.folder.display());
                return Ok(Arc::clone(calibration));
            }
        }

        let calibration = Arc::new(load()?);
        self.entry = Some((descriptor.clone(), Arc::clone(&calibration)));
        Ok(calibration)
    }

    /// Load through the cache using the calibration folder in `config`.
    pub fn get(
        &mut self,
        config: &CalibrationConfig,
        detector: &DetectorConfig,
    ) -> Result<Arc<DetectorCalibration>> {
        self.get_or_load(&config.descriptor(detector), || DetectorCalibration::load(config, detector))
    }

    pub fn descriptor(&self) -> Option<&CalibrationDescriptor> {
        self.entry.as_ref().map(|(key, _)| key)
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}
