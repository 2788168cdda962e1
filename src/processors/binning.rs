//! Fixed-width binning for quick-look overlays, and angle-range extraction.
//!
//! Unlike grid alignment, binning never interpolates: each point falls into
//! bin `floor(angle / bin_size)` and points sharing a bin keep the largest
//! count.

use std::collections::BTreeMap;
use std::ops::Range;

use thiserror::Error;

use crate::core::loaders::ProcessedDataset;

/// Errors that can occur during binning.
#[derive(Error, Debug)]
pub enum BinningError {
    #[error("bin size must be positive and finite, got {0}")]
    InvalidBinSize(f64),

    #[error("dataset {dataset} point {index} has a non-finite angle")]
    NonFiniteAngle { dataset: usize, index: usize },
}

/// Result type for binning operations.
pub type Result<T> = std::result::Result<T, BinningError>;

/// One occupied bin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinnedPoint {
    pub bin: i64,
    /// Lower edge of the bin, `bin * bin_size`
    pub angle: f64,
    pub count: f64,
}

/// Several datasets sharing one sorted angle axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommonGrid {
    pub angles: Vec<f64>,
    /// One series per dataset, `None` where the dataset has no sample.
    pub series: Vec<Vec<Option<f64>>>,
}

impl CommonGrid {
    #[inline]
    pub fn len(&self) -> usize {
        self.angles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.angles.is_empty()
    }

    #[inline]
    pub fn num_series(&self) -> usize {
        self.series.len()
    }

    /// The part of the grid with `min_angle <= angle <= max_angle`.
    pub fn slice(&self, min_angle: f64, max_angle: f64) -> CommonGrid {
        let range = subset_range(&self.angles, min_angle, max_angle);
        CommonGrid {
            angles: self.angles[range.clone()].to_vec(),
            series: self.series.iter().map(|s| s[range.clone()].to_vec()).collect(),
        }
    }

    /// Largest value across all series at each angle.
    pub fn max_series(&self) -> Vec<Option<f64>> {
        (0..self.len())
            .map(|row| {
                self.series
                    .iter()
                    .filter_map(|s| s[row])
                    .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))))
            })
            .collect()
    }
}

/// Index range of `angles` (sorted ascending) within `[min_angle, max_angle]`.
///
/// The lower bound is the first angle `>= min_angle`, the upper bound the
/// first angle `> max_angle` (exclusive). An inverted range is empty.
pub fn subset_range(angles: &[f64], min_angle: f64, max_angle: f64) -> Range<usize> {
    let lower = angles.partition_point(|&a| a < min_angle);
    let upper = angles.partition_point(|&a| a <= max_angle);
    lower..upper.max(lower)
}

/// Fixed-width max binner.
#[derive(Debug, Clone, Copy)]
pub struct Binner {
    bin_size: f64,
}

impl Binner {
    pub fn new(bin_size: f64) -> Result<Self> {
        if !bin_size.is_finite() || bin_size <= 0.0 {
            return Err(BinningError::InvalidBinSize(bin_size));
        }
        Ok(Self { bin_size })
    }

    #[inline]
    pub fn bin_size(&self) -> f64 {
        self.bin_size
    }

    #[inline]
    pub fn bin_index(&self, angle: f64) -> i64 {
        (angle / self.bin_size).floor() as i64
    }

    /// Per-dataset maximum count per bin.
    fn bin_dataset(&self, dataset: usize, data: &ProcessedDataset) -> Result<BTreeMap<i64, f64>> {
        let mut bins = BTreeMap::new();
        for (index, point) in data.points.iter().enumerate() {
            if !point.angle.is_finite() {
                return Err(BinningError::NonFiniteAngle { dataset, index });
            }
            bins.entry(self.bin_index(point.angle))
                .and_modify(|c: &mut f64| *c = c.max(point.count))
                .or_insert(point.count);
        }
        Ok(bins)
    }

    /// Bin all datasets together, keeping the largest count per bin.
    pub fn combine_max(&self, datasets: &[ProcessedDataset]) -> Result<Vec<BinnedPoint>> {
        let mut combined: BTreeMap<i64, f64> = BTreeMap::new();
        for (dataset, data) in datasets.iter().enumerate() {
            for (bin, count) in self.bin_dataset(dataset, data)? {
                combined
                    .entry(bin)
                    .and_modify(|c| *c = c.max(count))
                    .or_insert(count);
            }
        }

        Ok(combined
            .into_iter()
            .map(|(bin, count)| BinnedPoint {
                bin,
                angle: bin as f64 * self.bin_size,
                count,
            })
            .collect())
    }

    /// Bin each dataset separately onto the union of occupied bins.
    pub fn overlay(&self, datasets: &[ProcessedDataset]) -> Result<CommonGrid> {
        let binned = datasets
            .iter()
            .enumerate()
            .map(|(dataset, data)| self.bin_dataset(dataset, data))
            .collect::<Result<Vec<_>>>()?;

        let mut bins: Vec<i64> = binned.iter().flat_map(|b| b.keys().copied()).collect();
        bins.sort_unstable();
        bins.dedup();

        let series = binned
            .iter()
            .map(|b| bins.iter().map(|bin| b.get(bin).copied()).collect())
            .collect();

        Ok(CommonGrid {
            angles: bins.iter().map(|&bin| bin as f64 * self.bin_size).collect(),
            series,
        })
    }
}
