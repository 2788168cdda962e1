//! Data processing modules.

pub mod aggregator;
pub mod aligner;
pub mod binning;
pub mod boundaries;
pub mod calibrator;
pub mod frames;
pub mod pipeline;

// Re-export key types for convenience
pub use aggregator::{aggregate, MergedPattern};
pub use aligner::{AlignedSample, AlignmentError, GridAligner};
pub use binning::{subset_range, BinnedPoint, Binner, BinningError, CommonGrid};
pub use boundaries::{resolve_module_boundaries, ModuleBoundary};
pub use calibrator::ChannelCalibrator;
pub use frames::{convert_frames, find_frame_files, ConversionSummary, FrameFile};
pub use pipeline::{ErrorKind, InputKind, MergeInput, MergePipeline, PipelineError};
