//! Per-module channel ranges after bad-channel removal.

use std::ops::Range;

use crate::core::calibration::BadChannelSet;

/// Contiguous range of one module in compacted (bad-channel-free) indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleBoundary {
    pub module: usize,
    /// First compacted index of the module
    pub first: usize,
    /// Number of retained channels
    pub len: usize,
}

impl ModuleBoundary {
    /// Last compacted index (inclusive), `None` when every channel is bad.
    #[inline]
    pub fn last(&self) -> Option<usize> {
        (self.len > 0).then(|| self.first + self.len - 1)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Compacted index range, usable to slice a processed dataset.
    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.first..self.first + self.len
    }
}

/// Resolve module boundaries for a detector geometry and bad-channel set.
///
/// Bad channels outside `[0, num_modules * channels_per_module)` belong to no
/// module and are ignored. The returned boundaries are contiguous and their
/// lengths sum to the number of retained channels.
pub fn resolve_module_boundaries(
    num_modules: usize,
    channels_per_module: usize,
    bad_channels: &BadChannelSet,
) -> Vec<ModuleBoundary> {
    let mut cumulative = 0;

    (0..num_modules)
        .map(|module| {
            let native_start = module * channels_per_module;
            let native = native_start..native_start + channels_per_module;
            let retained = channels_per_module - bad_channels.count_in(native);

            let boundary = ModuleBoundary {
                module,
                first: cumulative,
                len: retained,
            };
            cumulative += retained;
            boundary
        })
        .collect()
}

/// Total retained channels covered by `boundaries`.
pub fn retained_channels(boundaries: &[ModuleBoundary]) -> usize {
    boundaries.iter().map(|b| b.len).sum()
}
