//! Raw channel counts to calibrated angle/count/error points.

use log::debug;

use crate::config::ConfigError;
use crate::core::calibration::{AngleOffsets, CalibrationError, CalibrationModel, DetectorCalibration};
use crate::core::loaders::{ProcessedDataPoint, ProcessedDataset, RawChannelSample, RawDataset};

/// Applies one detector calibration to raw acquisitions.
///
/// The calibrator holds no mutable state; one instance may calibrate many
/// acquisitions concurrently.
#[derive(Debug, Clone, Copy)]
pub struct ChannelCalibrator<'a> {
    calibration: &'a DetectorCalibration,
    channels_per_module: usize,
    offsets: AngleOffsets,
}

impl<'a> ChannelCalibrator<'a> {
    /// # Errors
    ///
    /// Fails when `channels_per_module` is zero.
    pub fn new(
        calibration: &'a DetectorCalibration,
        channels_per_module: usize,
        offsets: AngleOffsets,
    ) -> Result<Self, CalibrationError> {
        if channels_per_module == 0 {
            return Err(ConfigError::NoChannelsPerModule.into());
        }
        Ok(Self {
            calibration,
            channels_per_module,
            offsets,
        })
    }

    /// Angle of an absolute channel under the loaded model.
    ///
    /// # Errors
    ///
    /// Fails when the channel's module has no calibration entry.
    pub fn angle_for(&self, channel: usize) -> Result<f64, CalibrationError> {
        let module = channel / self.channels_per_module;
        let missing = || CalibrationError::MissingModule { channel, module };

        match &self.calibration.model {
            CalibrationModel::Full(modules) => {
                let entry = modules.get(&module).ok_or_else(missing)?;
                let channel_in_module = channel % self.channels_per_module;
                Ok(entry.angle_at(channel_in_module) + self.offsets.total())
            }
            CalibrationModel::Simple(angles) => angles.get(&module).copied().ok_or_else(missing),
            CalibrationModel::Uncalibrated => Ok(channel as f64),
        }
    }

    fn calibrate_sample(&self, sample: &RawChannelSample) -> Result<ProcessedDataPoint, CalibrationError> {
        let count = match &self.calibration.flat_field {
            Some(flat_field) => {
                let factor = flat_field
                    .factor(sample.channel)
                    .ok_or(CalibrationError::MissingFlatField {
                        channel: sample.channel,
                    })?;
                sample.count * factor
            }
            None => sample.count,
        };

        Ok(ProcessedDataPoint {
            angle: self.angle_for(sample.channel)?,
            count,
            error: count.sqrt(),
            channel: Some(sample.channel as i64),
        })
    }

    /// Calibrate one acquisition.
    ///
    /// Bad channels are dropped; every other channel yields exactly one
    /// point, in increasing channel order.
    pub fn calibrate(&self, raw: &RawDataset) -> Result<ProcessedDataset, CalibrationError> {
        let mut samples: Vec<&RawChannelSample> = raw
            .samples
            .iter()
            .filter(|s| !self.calibration.bad_channels.contains(s.channel))
            .collect();
        samples.sort_by_key(|s| s.channel);

        let points = samples
            .into_iter()
            .map(|s| self.calibrate_sample(s))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Calibrated {} of {} channels ({} mode)",
            points.len(),
            raw.len(),
            self.calibration.model.mode()
        );

        Ok(ProcessedDataset {
            points,
            source_path: raw.source_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::calibration::{BadChannelSet, FlatFieldCorrection, ModuleCalibration};
    use std::collections::BTreeMap;

    const OUTER: f64 = 56.309932474020215;
    const INNER: f64 = 26.56505117707799;

    fn golden_calibration() -> DetectorCalibration {
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
        DetectorCalibration::new(CalibrationModel::Full(modules), BadChannelSet::new())
    }

    fn golden_raw() -> RawDataset {
        RawDataset::from_counts(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])
    }

    #[test]
    fn test_golden_fixture() {
        let calibration = golden_calibration();
        let calibrator = ChannelCalibrator::new(&calibration, 4, AngleOffsets::default()).unwrap();

        let processed = calibrator.calibrate(&golden_raw()).unwrap();

        let expected_angles = [-OUTER, -INNER, INNER, OUTER, -OUTER, -INNER, INNER, OUTER];
        assert_eq!(processed.len(), 8);
        for (i, point) in processed.points.iter().enumerate() {
            let count = (i + 1) as f64;
            assert!((point.angle - expected_angles[i]).abs() < 1e-9, "angle at {}", i);
            assert_eq!(point.count, count);
            assert!((point.error - count.sqrt()).abs() < 1e-12);
            assert_eq!(point.channel, Some(i as i64));
        }
    }

    #[test]
    fn test_offsets_shift_every_angle() {
        let calibration = golden_calibration();
        let offsets = AngleOffsets {
            base_angle: 10.0,
            encoder_position: 5.0,
            global_offset: 0.5,
            beamline_offset: 0.25,
        };
        let plain = ChannelCalibrator::new(&calibration, 4, AngleOffsets::default()).unwrap();
        let shifted = ChannelCalibrator::new(&calibration, 4, offsets).unwrap();

        for channel in 0..8 {
            let delta = shifted.angle_for(channel).unwrap() - plain.angle_for(channel).unwrap();
            assert!((delta - 15.75).abs() < 1e-12);
        }
    }

    #[test]
    fn test_bad_channel_is_dropped() {
        let mut calibration = golden_calibration();
        calibration.bad_channels = [2].into_iter().collect();
        let calibrator = ChannelCalibrator::new(&calibration, 4, AngleOffsets::default()).unwrap();

        let processed = calibrator.calibrate(&golden_raw()).unwrap();

        assert_eq!(processed.len(), 7);
        assert!(processed.points.iter().all(|p| p.channel != Some(2)));
        assert_eq!(processed.points[2].channel, Some(3));
    }

    #[test]
    fn test_flat_field_scales_counts_and_errors() {
        let reference = RawDataset::from_counts(&[2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 1.0]);
        let flat = FlatFieldCorrection::from_reference(&reference, &BadChannelSet::new()).unwrap();
        let calibration = golden_calibration().with_flat_field(flat);
        let calibrator = ChannelCalibrator::new(&calibration, 4, AngleOffsets::default()).unwrap();

        let processed = calibrator.calibrate(&golden_raw()).unwrap();

        // mean 1.875; channel 7 factor 1.875, others 0.9375
        let last = processed.points[7];
        assert!((last.count - 8.0 * 1.875).abs() < 1e-12);
        assert!((last.error - (8.0f64 * 1.875).sqrt()).abs() < 1e-12);
        assert!((processed.points[0].count - 0.9375).abs() < 1e-12);
    }

    #[test]
    fn test_missing_flat_field_channel() {
        let reference = RawDataset::from_counts(&[1.0, 1.0, 1.0, 1.0]);
        let flat = FlatFieldCorrection::from_reference(&reference, &BadChannelSet::new()).unwrap();
        let calibration = golden_calibration().with_flat_field(flat);
        let calibrator = ChannelCalibrator::new(&calibration, 4, AngleOffsets::default()).unwrap();

        match calibrator.calibrate(&golden_raw()) {
            Err(CalibrationError::MissingFlatField { channel }) => assert_eq!(channel, 4),
            other => panic!("Expected MissingFlatField, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_module_names_channel_and_module() {
        let calibration = golden_calibration();
        let calibrator = ChannelCalibrator::new(&calibration, 4, AngleOffsets::default()).unwrap();
        let raw = RawDataset::from_counts(&[1.0; 12]);

        match calibrator.calibrate(&raw) {
            Err(CalibrationError::MissingModule { channel, module }) => {
                assert_eq!(channel, 8);
                assert_eq!(module, 2);
            }
            other => panic!("Expected MissingModule, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_and_uncalibrated_modes() {
        let simple = DetectorCalibration::new(
            CalibrationModel::Simple([(0, 12.5), (1, 20.0)].into_iter().collect()),
            BadChannelSet::new(),
        );
        let calibrator = ChannelCalibrator::new(&simple, 4, AngleOffsets::default()).unwrap();
        assert_eq!(calibrator.angle_for(1).unwrap(), 12.5);
        assert_eq!(calibrator.angle_for(6).unwrap(), 20.0);

        let debug = DetectorCalibration::new(CalibrationModel::Uncalibrated, BadChannelSet::new());
        let calibrator = ChannelCalibrator::new(&debug, 4, AngleOffsets::default()).unwrap();
        assert_eq!(calibrator.angle_for(6).unwrap(), 6.0);
    }

    #[test]
    fn test_calibration_is_idempotent_and_non_negative() {
        let calibration = golden_calibration();
        let calibrator = ChannelCalibrator::new(&calibration, 4, AngleOffsets::default()).unwrap();
        let mut raw = golden_raw();
        raw.samples.reverse();

        let first = calibrator.calibrate(&raw).unwrap();
        let second = calibrator.calibrate(&raw).unwrap();

        assert_eq!(first.points, second.points);
        assert!(first.points.iter().all(|p| p.count >= 0.0 && p.error >= 0.0));
        assert_eq!(first.points[0].channel, Some(0));
    }

    #[test]
    fn test_zero_channels_per_module_is_rejected() {
        let calibration = DetectorCalibration::new(CalibrationModel::Uncalibrated, BadChannelSet::new());

        assert!(matches!(
            ChannelCalibrator::new(&calibration, 0, AngleOffsets::default()),
            Err(CalibrationError::Config(ConfigError::NoChannelsPerModule))
        ));
    }
}
