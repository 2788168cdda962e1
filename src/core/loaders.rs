//! Record types and loaders for detector data files.
//!
//! This module provides parsers for:
//! - Raw acquisition files (`channel count`, absolute channel numbering)
//! - Processed files (`angle count error [channel]`, optional legacy header block)
//! - Bad channel lists (one absolute channel per line)
//! - Module calibration files (full or simple records)

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::config::CalibrationMode;
use crate::core::calibration::{BadChannelSet, CalibrationModel, ModuleCalibration};

/// Number of header lines (two-line block plus column names) before legacy data.
pub const LEGACY_HEADER_LINES: usize = 3;

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    DataFormat {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{path}:{line}: invalid configuration record: {message}")]
    Configuration {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Empty file: {0}")]
    EmptyFile(PathBuf),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// One raw detector reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawChannelSample {
    /// Absolute channel number across all modules
    pub channel: usize,
    /// Counts recorded by the channel
    pub count: f64,
}

/// Raw counts of a single acquisition.
#[derive(Debug, Clone, Default)]
pub struct RawDataset {
    pub samples: Vec<RawChannelSample>,
    /// Source file path.
    pub source_path: Option<PathBuf>,
}

impl RawDataset {
    pub fn new(samples: Vec<RawChannelSample>) -> Self {
        Self {
            samples,
            source_path: None,
        }
    }

    /// Builds a dataset whose channel numbers are the positions in `counts`.
    pub fn from_counts(counts: &[f64]) -> Self {
        let samples = counts
            .iter()
            .enumerate()
            .map(|(channel, &count)| RawChannelSample { channel, count })
            .collect();
        Self::new(samples)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A calibrated channel reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessedDataPoint {
    /// Scattering angle in degrees.
    pub angle: f64,
    pub count: f64,
    /// Statistical error, never negative.
    pub error: f64,
    /// Fourth legacy column: the absolute channel number of a calibrated
    /// point, or the signed grid index of a merged one.
    pub channel: Option<i64>,
}

/// Calibrated points of a single acquisition, one per retained channel.
#[derive(Debug, Clone, Default)]
pub struct ProcessedDataset {
    pub points: Vec<ProcessedDataPoint>,
    /// Source file path.
    pub source_path: Option<PathBuf>,
}

impl ProcessedDataset {
    pub fn new(points: Vec<ProcessedDataPoint>) -> Self {
        Self {
            points,
            source_path: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Short name of the source file, for logs.
    pub fn label(&self) -> String {
        self.source_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "<memory>".to_string())
    }
}

/// One point of a merged pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedDataPoint {
    /// Index on the shared angular grid.
    pub grid_index: i64,
    /// `grid_index * step`
    pub angle: f64,
    pub count: f64,
    pub error: f64,
}

fn io_error(path: &Path, source: std::io::Error) -> LoaderError {
    LoaderError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn format_error(path: &Path, line: usize, message: String) -> LoaderError {
    LoaderError::DataFormat {
        path: path.to_path_buf(),
        line,
        message,
    }
}

fn config_error(path: &Path, line: usize, message: String) -> LoaderError {
    LoaderError::Configuration {
        path: path.to_path_buf(),
        line,
        message,
    }
}

/// Reads every line of a file, pairing it with its 1-based line number.
fn read_numbered_lines(path: &Path) -> Result<Vec<(usize, String)>> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    let reader = BufReader::with_capacity(64 * 1024, file);

    let mut lines = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| io_error(path, e))?;
        lines.push((idx + 1, line));
    }
    Ok(lines)
}

/// True for lines carrying no record (blank or `#` comments).
fn is_skippable(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn parse_field<T: FromStr>(field: &str, what: &str) -> std::result::Result<T, String> {
    field
        .parse::<T>()
        .map_err(|_| format!("invalid {} value '{}'", what, field))
}

fn parse_count(field: &str, what: &str) -> std::result::Result<f64, String> {
    let value: f64 = parse_field(field, what)?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("{} must be a finite non-negative number, got {}", what, field));
    }
    Ok(value)
}

/// Load a raw acquisition file.
///
/// Each non-blank line holds `channel count`, whitespace-delimited. Any other
/// arity, a non-numeric field, a negative count or a repeated channel is a
/// data format error naming the line.
///
/// # Errors
///
/// Returns an error if the file cannot be read, a record is malformed, or
/// the file holds no records.
pub fn load_raw_dataset<P: AsRef<Path>>(path: P) -> Result<RawDataset> {
    let path = path.as_ref();
    let lines = read_numbered_lines(path)?;

    let mut samples = Vec::with_capacity(lines.len());
    let mut seen = BTreeSet::new();
    for (line_no, line) in &lines {
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(format_error(
                path,
                *line_no,
                format!("expected 2 columns (channel count), found {}", fields.len()),
            ));
        }

        let channel: usize =
            parse_field(fields[0], "channel").map_err(|m| format_error(path, *line_no, m))?;
        let count = parse_count(fields[1], "count").map_err(|m| format_error(path, *line_no, m))?;
        if !seen.insert(channel) {
            return Err(format_error(
                path,
                *line_no,
                format!("channel {} appears more than once", channel),
            ));
        }

        samples.push(RawChannelSample { channel, count });
    }

    if samples.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    Ok(RawDataset {
        samples,
        source_path: Some(path.to_path_buf()),
    })
}

/// Parses one processed record, returning `None` when the line is not numeric.
fn parse_processed_record(fields: &[&str]) -> Option<std::result::Result<ProcessedDataPoint, String>> {
    // A header line is one whose first field is not a number.
    fields.first()?.parse::<f64>().ok()?;

    Some((|| {
        if fields.len() != 3 && fields.len() != 4 {
            return Err(format!(
                "expected 3 or 4 columns (angle count error [channel]), found {}",
                fields.len()
            ));
        }
        let angle: f64 = parse_field(fields[0], "angle")?;
        let count = parse_count(fields[1], "count")?;
        let error = parse_count(fields[2], "error")?;
        let channel = match fields.get(3) {
            Some(field) => Some(parse_field::<i64>(field, "channel")?),
            None => None,
        };
        Ok(ProcessedDataPoint {
            angle,
            count,
            error,
            channel,
        })
    })())
}

/// Load a processed (calibrated) data file.
///
/// Accepts the 3-column `angle count error` form and the 4-column legacy form
/// `angle count error channel`. `#` lines and up to three other header lines
/// (the legacy column names) may precede the first record.
///
/// # Errors
///
/// Returns an error if the file cannot be read, holds a malformed record or
/// too many header lines, or contains no records.
pub fn load_processed_dataset<P: AsRef<Path>>(path: P) -> Result<ProcessedDataset> {
    let path = path.as_ref();
    let lines = read_numbered_lines(path)?;

    let mut points = Vec::with_capacity(lines.len());
    let mut header_lines = 0;

    for (line_no, line) in &lines {
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        match parse_processed_record(&fields) {
            Some(Ok(point)) => points.push(point),
            Some(Err(message)) => return Err(format_error(path, *line_no, message)),
            None if points.is_empty() && line.trim_start().starts_with('#') => {}
            None if points.is_empty() && header_lines < LEGACY_HEADER_LINES => {
                header_lines += 1;
            }
            None => {
                return Err(format_error(
                    path,
                    *line_no,
                    format!("non-numeric record '{}'", line.trim()),
                ));
            }
        }
    }

    if points.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    Ok(ProcessedDataset {
        points,
        source_path: Some(path.to_path_buf()),
    })
}

/// Load a bad channel list.
///
/// One absolute channel number per line; blank and `#` lines are ignored.
/// An empty list is valid.
pub fn load_bad_channels<P: AsRef<Path>>(path: P) -> Result<BadChannelSet> {
    let path = path.as_ref();
    let lines = read_numbered_lines(path)?;

    let mut channels = BTreeSet::new();
    for (line_no, line) in &lines {
        if is_skippable(line) {
            continue;
        }
        let channel: usize = parse_field(line.trim(), "bad channel")
            .map_err(|m| config_error(path, *line_no, m))?;
        channels.insert(channel);
    }

    Ok(BadChannelSet::from_set(channels))
}

/// Load per-module angular calibration for the given mode.
///
/// Full mode expects `module center conversion offset` records, simple mode
/// `module angle`. Uncalibrated mode reads nothing. Each module may appear
/// once. Full-mode centers must lie within `[0, channels_per_module)`.
///
/// # Errors
///
/// Returns a configuration error for malformed, duplicate or out-of-range
/// records, and an I/O error if the file cannot be read.
pub fn load_calibration_model<P: AsRef<Path>>(
    path: P,
    mode: CalibrationMode,
    channels_per_module: usize,
) -> Result<CalibrationModel> {
    let path = path.as_ref();

    match mode {
        CalibrationMode::Uncalibrated => Ok(CalibrationModel::Uncalibrated),
        CalibrationMode::Full => {
            let mut modules = BTreeMap::new();
            for (line_no, line) in read_numbered_lines(path)? {
                if is_skippable(&line) {
                    continue;
                }
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() != 4 {
                    return Err(config_error(
                        path,
                        line_no,
                        format!(
                            "expected 4 columns (module center conversion offset), found {}",
                            fields.len()
                        ),
                    ));
                }

                let parsed = (|| -> std::result::Result<ModuleCalibration, String> {
                    Ok(ModuleCalibration {
                        module: parse_field(fields[0], "module")?,
                        center: parse_field(fields[1], "center")?,
                        conversion: parse_field(fields[2], "conversion")?,
                        offset: parse_field(fields[3], "offset")?,
                    })
                })()
                .map_err(|m| config_error(path, line_no, m))?;

                if !(0.0..channels_per_module as f64).contains(&parsed.center) {
                    return Err(config_error(
                        path,
                        line_no,
                        format!(
                            "module {} center {} outside [0, {})",
                            parsed.module, parsed.center, channels_per_module
                        ),
                    ));
                }
                if modules.insert(parsed.module, parsed).is_some() {
                    return Err(config_error(
                        path,
                        line_no,
                        format!("module {} calibrated twice", parsed.module),
                    ));
                }
            }
            Ok(CalibrationModel::Full(modules))
        }
        CalibrationMode::Simple => {
            let mut angles = BTreeMap::new();
            for (line_no, line) in read_numbered_lines(path)? {
                if is_skippable(&line) {
                    continue;
                }
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() != 2 {
                    return Err(config_error(
                        path,
                        line_no,
                        format!("expected 2 columns (module angle), found {}", fields.len()),
                    ));
                }
                let module: usize =
                    parse_field(fields[0], "module").map_err(|m| config_error(path, line_no, m))?;
                let angle: f64 =
                    parse_field(fields[1], "angle").map_err(|m| config_error(path, line_no, m))?;
                if angles.insert(module, angle).is_some() {
                    return Err(config_error(
                        path,
                        line_no,
                        format!("module {} calibrated twice", module),
                    ));
                }
            }
            Ok(CalibrationModel::Simple(angles))
        }
    }
}
