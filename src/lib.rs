//! Angular calibration and multi-scan fusion for segmented strip detectors.
//!
//! This crate provides tools for:
//! - Calibrating raw per-channel counts into angle/count/error points
//!   (bad-channel exclusion, flat-field correction, per-module arctan model)
//! - Tracking module boundaries after bad channels are removed
//! - Aligning several acquisitions on a shared angular grid and summing them
//!   with coverage normalisation
//! - Fixed-width max binning for quick-look overlays and range extraction
//! - Batch conversion of multi-frame acquisitions
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strip_fusion::core::calibration::CalibrationCache;
//! use strip_fusion::processors::pipeline::{InputKind, MergeInput, MergePipeline};
//! use strip_fusion::PipelineConfig;
//!
//! let config = PipelineConfig::default();
//! let mut cache = CalibrationCache::new();
//! let calibration = cache.get(&config.calibration, &config.detector).unwrap();
//! let pipeline = MergePipeline::new(config, Arc::clone(&calibration)).unwrap();
//! let inputs = vec![MergeInput::new("scan_1.raw"), MergeInput::new("scan_2.raw")];
//! let merged = pipeline.merge(&inputs, InputKind::Raw).unwrap();
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;
pub mod visualization;

pub use config::{CalibrationDescriptor, CalibrationMode, PipelineConfig};
pub use crate::core::loaders::{MergedDataPoint, ProcessedDataPoint, ProcessedDataset, RawDataset};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
