//! Coverage-normalised combination of aligned samples.

use std::collections::BTreeMap;

use crate::core::loaders::MergedDataPoint;
use super::aligner::{grid_angle, AlignedSample};

/// A merged pattern and the coverage it was normalised to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedPattern {
    /// Points in increasing grid index
    pub points: Vec<MergedDataPoint>,
    /// Largest number of samples sharing any grid index
    pub max_contributors: usize,
    pub step: f64,
}

impl MergedPattern {
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// (min, max) angle, if any points exist.
    pub fn angle_range(&self) -> Option<(f64, f64)> {
        Some((self.points.first()?.angle, self.points.last()?.angle))
    }
}

/// Sum aligned samples per grid index, rescaled to the best-covered index.
///
/// For a grid index with `k` contributors out of a maximum `max_k`:
/// `count = sum * max_k / k` and `error = sqrt(count)`. Indices covered by
/// fewer datasets (pattern edges, module gaps) are scaled up accordingly.
/// All samples must be present; the result is only valid after every
/// dataset has been aligned.
pub fn aggregate(samples: &[AlignedSample], step: f64) -> MergedPattern {
    let mut per_index: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for sample in samples {
        let entry = per_index.entry(sample.grid_index).or_insert((0.0, 0));
        entry.0 += sample.count;
        entry.1 += 1;
    }

    let max_contributors = per_index.values().map(|&(_, k)| k).max().unwrap_or(0);

    let points = per_index
        .into_iter()
        .map(|(grid_index, (sum, k))| {
            let count = sum * max_contributors as f64 / k as f64;
            MergedDataPoint {
                grid_index,
                angle: grid_angle(grid_index, step),
                count,
                error: count.sqrt(),
            }
        })
        .collect();

    MergedPattern {
        points,
        max_contributors,
        step,
    }
}
