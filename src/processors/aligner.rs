//! Projection of calibrated datasets onto a shared angular grid.
//!
//! Every dataset is interpolated module by module onto grid angles
//! `index * step`. Only grid angles inside a module's observed angular range
//! are produced, so nothing is ever extrapolated.

use log::debug;
use rayon::prelude::*;
use thiserror::Error;

use crate::core::loaders::{ProcessedDataPoint, ProcessedDataset};
use super::boundaries::{retained_channels, ModuleBoundary};

/// Errors that can occur during grid alignment.
#[derive(Error, Debug)]
pub enum AlignmentError {
    #[error("grid step must be positive and finite, got {0}")]
    InvalidStep(f64),

    #[error("dataset {dataset} has {found} points but module boundaries cover {expected} channels")]
    LengthMismatch {
        dataset: usize,
        expected: usize,
        found: usize,
    },

    #[error("dataset {dataset} module {module} is not sorted by angle")]
    UnsortedModule { dataset: usize, module: usize },

    #[error("dataset {dataset} module {module} contains a non-finite angle")]
    NonFiniteAngle { dataset: usize, module: usize },

    #[error("dataset {dataset} module {module}: zero-width interpolation interval at angle {angle}")]
    ZeroWidthInterval {
        dataset: usize,
        module: usize,
        angle: f64,
    },
}

/// Result type for alignment operations.
pub type Result<T> = std::result::Result<T, AlignmentError>;

/// One dataset's interpolated count at one grid point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignedSample {
    /// Signed grid index; the grid angle is `grid_index * step`.
    pub grid_index: i64,
    pub count: f64,
    pub dataset: usize,
    pub module: usize,
}

/// Grid angle of an index.
#[inline]
pub fn grid_angle(grid_index: i64, step: f64) -> f64 {
    grid_index as f64 * step
}

/// Sort each module's points by increasing angle.
///
/// Modules extending past the end of `points` are left untouched; the
/// aligner reports the length mismatch.
pub fn sort_within_modules(points: &mut [ProcessedDataPoint], boundaries: &[ModuleBoundary]) {
    for boundary in boundaries {
        let range = boundary.range();
        if range.end <= points.len() {
            points[range].sort_by(|a, b| a.angle.total_cmp(&b.angle));
        }
    }
}

/// Linear-interpolation aligner with a fixed grid step.
#[derive(Debug, Clone, Copy)]
pub struct GridAligner {
    step: f64,
}

impl GridAligner {
    /// Create an aligner for a positive, finite step (degrees).
    pub fn new(step: f64) -> Result<Self> {
        if !step.is_finite() || step <= 0.0 {
            return Err(AlignmentError::InvalidStep(step));
        }
        Ok(Self { step })
    }

    #[inline]
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Align the points of one module, which must be sorted by angle.
    pub fn align_module(
        &self,
        dataset: usize,
        module: usize,
        points: &[ProcessedDataPoint],
    ) -> Result<Vec<AlignedSample>> {
        let (first, last) = match (points.first(), points.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(Vec::new()),
        };

        if points.iter().any(|p| !p.angle.is_finite()) {
            return Err(AlignmentError::NonFiniteAngle { dataset, module });
        }
        for w in points.windows(2) {
            if w[1].angle < w[0].angle {
                return Err(AlignmentError::UnsortedModule { dataset, module });
            }
            // Repeated angles leave no interval to interpolate across,
            // whether or not a grid point lands on them.
            if w[1].angle == w[0].angle {
                return Err(AlignmentError::ZeroWidthInterval {
                    dataset,
                    module,
                    angle: w[0].angle,
                });
            }
        }

        let min_angle = first.angle;
        let max_angle = last.angle;
        let min_index = (min_angle / self.step).ceil() as i64;
        let max_index = (max_angle / self.step).floor() as i64;

        let mut samples = Vec::with_capacity((max_index - min_index + 1).max(0) as usize);
        let mut cursor = 0;

        for grid_index in min_index..=max_index {
            let g = grid_angle(grid_index, self.step);
            if g < min_angle || g > max_angle {
                continue;
            }

            while cursor + 1 < points.len() && points[cursor + 1].angle < g {
                cursor += 1;
            }

            let lower = &points[cursor];
            let count = match points.get(cursor + 1) {
                None => lower.count,
                Some(upper) => {
                    let width = upper.angle - lower.angle;
                    lower.count + (upper.count - lower.count) * (g - lower.angle) / width
                }
            };

            samples.push(AlignedSample {
                grid_index,
                count,
                dataset,
                module,
            });
        }

        Ok(samples)
    }

    /// Align one dataset, module by module.
    pub fn align_dataset(
        &self,
        dataset: usize,
        data: &ProcessedDataset,
        boundaries: &[ModuleBoundary],
    ) -> Result<Vec<AlignedSample>> {
        let expected = retained_channels(boundaries);
        if data.len() != expected {
            return Err(AlignmentError::LengthMismatch {
                dataset,
                expected,
                found: data.len(),
            });
        }

        let mut samples = Vec::new();
        for boundary in boundaries.iter().filter(|b| !b.is_empty()) {
            let module_samples =
                self.align_module(dataset, boundary.module, &data.points[boundary.range()])?;
            debug!(
                "Dataset {} module {}: {} grid points",
                dataset,
                boundary.module,
                module_samples.len()
            );
            samples.extend(module_samples);
        }
        Ok(samples)
    }

    /// Align every dataset in parallel; dataset ids are positions in `datasets`.
    pub fn align_all(
        &self,
        datasets: &[ProcessedDataset],
        boundaries: &[ModuleBoundary],
    ) -> Result<Vec<AlignedSample>> {
        let per_dataset = datasets
            .par_iter()
            .enumerate()
            .map(|(id, data)| self.align_dataset(id, data, boundaries))
            .collect::<Result<Vec<_>>>()?;

        Ok(per_dataset.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::calibration::BadChannelSet;
    use crate::processors::boundaries::resolve_module_boundaries;

    fn point(angle: f64, count: f64) -> ProcessedDataPoint {
        ProcessedDataPoint {
            angle,
            count,
            error: count.sqrt(),
            channel: None,
        }
    }

    #[test]
    fn test_invalid_step() {
        assert!(matches!(GridAligner::new(0.0), Err(AlignmentError::InvalidStep(_))));
        assert!(matches!(GridAligner::new(-0.1), Err(AlignmentError::InvalidStep(_))));
        assert!(matches!(GridAligner::new(f64::NAN), Err(AlignmentError::InvalidStep(_))));
    }

    #[test]
    fn test_linear_interpolation() {
        let aligner = GridAligner::new(0.5).unwrap();
        let points = vec![point(0.2, 10.0), point(1.2, 20.0)];

        let samples = aligner.align_module(0, 0, &points).unwrap();

        let indices: Vec<i64> = samples.iter().map(|s| s.grid_index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert!((samples[0].count - 13.0).abs() < 1e-12);
        assert!((samples[1].count - 18.0).abs() < 1e-12);
    }

    #[test]
    fn test_grid_point_on_last_sample_uses_its_count() {
        let aligner = GridAligner::new(1.0).unwrap();
        let points = vec![point(-2.0, 4.0), point(-1.5, 6.0), point(-1.0, 8.0)];

        let samples = aligner.align_module(0, 0, &points).unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].grid_index, -2);
        assert_eq!(samples[0].count, 4.0);
        assert_eq!(samples[1].grid_index, -1);
        assert_eq!(samples[1].count, 8.0);
    }

    #[test]
    fn test_zero_width_interval() {
        let aligner = GridAligner::new(1.0).unwrap();
        let points = vec![point(1.0, 4.0), point(1.0, 6.0), point(2.0, 8.0)];

        match aligner.align_module(3, 1, &points) {
            Err(AlignmentError::ZeroWidthInterval { dataset, module, angle }) => {
                assert_eq!(dataset, 3);
                assert_eq!(module, 1);
                assert_eq!(angle, 1.0);
            }
            other => panic!("Expected ZeroWidthInterval, got {:?}", other),
        }
    }

    #[test]
    fn test_repeated_angle_between_grid_points_is_rejected() {
        let aligner = GridAligner::new(0.1).unwrap();
        let points = vec![point(12.55, 4.0), point(12.55, 6.0)];

        match aligner.align_module(0, 0, &points) {
            Err(AlignmentError::ZeroWidthInterval { angle, .. }) => assert_eq!(angle, 12.55),
            other => panic!("Expected ZeroWidthInterval, got {:?}", other),
        }
    }

    #[test]
    fn test_unsorted_module_is_rejected() {
        let aligner = GridAligner::new(0.1).unwrap();
        let points = vec![point(1.0, 4.0), point(0.5, 6.0)];

        assert!(matches!(
            aligner.align_module(0, 2, &points),
            Err(AlignmentError::UnsortedModule { dataset: 0, module: 2 })
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let aligner = GridAligner::new(0.1).unwrap();
        let boundaries = resolve_module_boundaries(2, 4, &BadChannelSet::new());
        let data = ProcessedDataset::new(vec![point(0.0, 1.0); 5]);

        assert!(matches!(
            aligner.align_dataset(0, &data, &boundaries),
            Err(AlignmentError::LengthMismatch {
                expected: 8,
                found: 5,
                ..
            })
        ));
    }

    #[test]
    fn test_no_extrapolation_across_modules() {
        let aligner = GridAligner::new(0.07).unwrap();
        let boundaries = resolve_module_boundaries(2, 4, &BadChannelSet::new());
        let data = ProcessedDataset::new(vec![
            point(-0.93, 1.0),
            point(-0.41, 2.0),
            point(0.12, 3.0),
            point(0.66, 4.0),
            point(3.01, 5.0),
            point(3.33, 6.0),
            point(3.90, 7.0),
            point(4.49, 8.0),
        ]);

        let samples = aligner.align_all(&[data.clone(), data.clone()], &boundaries).unwrap();

        assert!(!samples.is_empty());
        for sample in &samples {
            let boundary = boundaries[sample.module];
            let module_points = &data.points[boundary.range()];
            let g = grid_angle(sample.grid_index, aligner.step());
            assert!(g >= module_points[0].angle && g <= module_points[3].angle);
            assert!(sample.count >= 1.0 && sample.count <= 8.0);
        }
        // The gap between modules is never filled
        assert!(samples.iter().all(|s| {
            let g = grid_angle(s.grid_index, aligner.step());
            g <= 0.66 || g >= 3.01
        }));
        assert_eq!(samples.iter().filter(|s| s.dataset == 1).count() * 2, samples.len());
    }

    #[test]
    fn test_sort_within_modules_keeps_modules_apart() {
        let boundaries = resolve_module_boundaries(2, 2, &BadChannelSet::new());
        let mut points = vec![point(5.0, 1.0), point(4.0, 2.0), point(1.0, 3.0), point(0.0, 4.0)];

        sort_within_modules(&mut points, &boundaries);

        let angles: Vec<f64> = points.iter().map(|p| p.angle).collect();
        assert_eq!(angles, vec![4.0, 5.0, 0.0, 1.0]);
    }
}
