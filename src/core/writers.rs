//! Data writers for processed, merged and overlay records.
//!
//! This module provides functions for writing calibrated data to various file formats:
//! - Tab-delimited `angle count error` records, optionally in the 4-column legacy form
//! - CSV export of merged patterns
//! - Tab-delimited overlays of several binned datasets on a common grid

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use super::loaders::{MergedDataPoint, ProcessedDataset};

/// Column names of the 4-column legacy form.
const LEGACY_COLUMNS: &str = "angle\tcount\terror\tchannel";

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// A point without a channel number cannot be written in legacy form.
    #[error("point {index} has no channel number; cannot write legacy form to '{path}'")]
    MissingChannel { path: String, index: usize },

    /// Overlay series length differs from the angle axis.
    #[error("overlay series {series} has {series_len} values, angle axis has {angles_len}")]
    LengthMismatch {
        series: usize,
        series_len: usize,
        angles_len: usize,
    },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path.
fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

/// Writes the two-line header block and the column-name line of the legacy form.
fn write_legacy_header<W: Write>(writer: &mut W, kind: &str, points: usize) -> std::io::Result<()> {
    writeln!(writer, "# strip-fusion {} data", kind)?;
    writeln!(writer, "# points {}", points)?;
    writeln!(writer, "{}", LEGACY_COLUMNS)
}

/// Write a calibrated dataset.
///
/// Records are `angle count error`, tab-delimited, in the dataset's order.
/// With `include_channel` the legacy form is written: header block, column
/// names, and the absolute channel number as a fourth column.
///
/// # Errors
///
/// Returns an error if the file cannot be created or written, or if a point
/// lacks a channel number while `include_channel` is set.
pub fn write_processed(path: &Path, dataset: &ProcessedDataset, include_channel: bool) -> Result<()> {
    let path_str = path.display().to_string();

    let channels = if include_channel {
        let channels = dataset
            .points
            .iter()
            .enumerate()
            .map(|(index, p)| {
                p.channel.ok_or_else(|| WriteError::MissingChannel {
                    path: path_str.clone(),
                    index,
                })
            })
            .collect::<Result<Vec<i64>>>()?;
        Some(channels)
    } else {
        None
    };

    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;

    let io_result = (|| -> std::io::Result<()> {
        if let Some(channels) = &channels {
            write_legacy_header(&mut writer, "processed", dataset.len())?;
            for (p, channel) in dataset.points.iter().zip(channels) {
                writeln!(writer, "{:.6}\t{:.4}\t{:.4}\t{}", p.angle, p.count, p.error, channel)?;
            }
        } else {
            for p in &dataset.points {
                writeln!(writer, "{:.6}\t{:.4}\t{:.4}", p.angle, p.count, p.error)?;
            }
        }
        writer.flush()
    })();

    io_result.map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })
}

/// Write a merged pattern as tab-delimited records.
///
/// In the legacy form the fourth column holds the grid index.
pub fn write_merged(path: &Path, points: &[MergedDataPoint], include_channel: bool) -> Result<()> {
    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;

    let io_result = (|| -> std::io::Result<()> {
        if include_channel {
            write_legacy_header(&mut writer, "merged", points.len())?;
        }
        for p in points {
            if include_channel {
                writeln!(writer, "{:.6}\t{:.4}\t{:.4}\t{}", p.angle, p.count, p.error, p.grid_index)?;
            } else {
                writeln!(writer, "{:.6}\t{:.4}\t{:.4}", p.angle, p.count, p.error)?;
            }
        }
        writer.flush()
    })();

    io_result.map_err(|e| WriteError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })
}

/// Write a merged pattern to CSV with `angle,count,error` columns.
pub fn write_merged_csv(path: &Path, points: &[MergedDataPoint]) -> Result<()> {
    ensure_parent_dirs(path)?;

    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut csv_writer = csv::Writer::from_writer(BufWriter::new(file));

    let path_str = path.display().to_string();

    csv_writer
        .write_record(["angle", "count", "error"])
        .map_err(|e| WriteError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;

    for p in points {
        csv_writer
            .write_record(&[
                format!("{:.6}", p.angle),
                format!("{:.4}", p.count),
                format!("{:.4}", p.error),
            ])
            .map_err(|e| WriteError::CsvError {
                path: path_str.clone(),
                source: e,
            })?;
    }

    csv_writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}

/// Write several series sharing one angle axis.
///
/// Each row is `angle count_0 ... count_{n-1} max`, tab-delimited; a series
/// with no value at an angle is written as `NaN`, and `max` is the largest
/// present value (`NaN` if none).
///
/// # Errors
///
/// Returns an error if a series length differs from the angle axis, or if
/// the file cannot be created or written.
pub fn write_overlay(path: &Path, angles: &[f64], series: &[Vec<Option<f64>>]) -> Result<()> {
    if let Some((index, s)) = series.iter().enumerate().find(|(_, s)| s.len() != angles.len()) {
        return Err(WriteError::LengthMismatch {
            series: index,
            series_len: s.len(),
            angles_len: angles.len(),
        });
    }

    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;

    let io_result = (|| -> std::io::Result<()> {
        let mut header = String::from("angle");
        for i in 0..series.len() {
            header.push_str(&format!("\tcount_{}", i));
        }
        header.push_str("\tmax");
        writeln!(writer, "{}", header)?;

        for (row, angle) in angles.iter().enumerate() {
            let mut line = format!("{:.6}", angle);
            let mut max: Option<f64> = None;
            for s in series {
                match s[row] {
                    Some(v) => {
                        line.push_str(&format!("\t{:.4}", v));
                        max = Some(max.map_or(v, |m| m.max(v)));
                    }
                    None => line.push_str("\tNaN"),
                }
            }
            match max {
                Some(m) => line.push_str(&format!("\t{:.4}", m)),
                None => line.push_str("\tNaN"),
            }
            writeln!(writer, "{}", line)?;
        }
        writer.flush()
    })();

    io_result.map_err(|e| WriteError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })
}
