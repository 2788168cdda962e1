//! Core data types, calibration and I/O operations.

pub mod calibration;
pub mod loaders;
pub mod writers;

pub use calibration::{
    AngleOffsets, BadChannelSet, CalibrationCache, CalibrationError, CalibrationModel,
    DetectorCalibration, FlatFieldCorrection, ModuleCalibration,
};
pub use loaders::{
    LoaderError, MergedDataPoint, ProcessedDataPoint, ProcessedDataset, RawChannelSample,
    RawDataset,
};
pub use writers::{write_merged, write_merged_csv, write_overlay, write_processed, WriteError};
