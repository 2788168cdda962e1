//! Multi-frame acquisition discovery and batch raw-to-processed conversion.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use rayon::prelude::*;
use regex::Regex;

use crate::core::writers::write_processed;
use super::pipeline::MergePipeline;

/// Raw frame file naming: `<prefix>_<frame>.raw`, e.g. `1234_mythen_7.raw`.
const FRAME_PATTERN: &str = r"^(?P<prefix>.+)_(?P<frame>\d+)\.raw$";

/// One raw frame found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFile {
    /// File name up to the frame number, e.g. `1234_mythen`
    pub prefix: String,
    pub frame: u32,
    pub path: PathBuf,
}

/// Outcome of a batch conversion.
#[derive(Debug, Default)]
pub struct ConversionSummary {
    /// Written `.dat` files
    pub processed: Vec<PathBuf>,
    /// Failed raw files and the reason
    pub failed: Vec<(PathBuf, String)>,
}

impl ConversionSummary {
    pub fn total(&self) -> usize {
        self.processed.len() + self.failed.len()
    }
}

/// File-name prefix of a scan's detector frames.
pub fn scan_prefix(scan: u64) -> String {
    format!("{}_mythen", scan)
}

/// Processed output path for a raw frame: same directory and stem, `.dat`.
pub fn processed_path_for(raw: &Path) -> PathBuf {
    raw.with_extension("dat")
}

/// Find raw frame files in `dir`, ordered by prefix then frame number.
///
/// With `prefix` set, only frames of that prefix are returned.
pub fn find_frame_files(dir: &Path, prefix: Option<&str>) -> Result<Vec<FrameFile>> {
    let pattern = Regex::new(FRAME_PATTERN)?;

    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read frame directory: {}", dir.display()))?;

    let mut frames: Vec<FrameFile> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let caps = pattern.captures(name)?;
            let frame = caps["frame"].parse().ok()?;
            Some(FrameFile {
                prefix: caps["prefix"].to_string(),
                frame,
                path: path.clone(),
            })
        })
        .filter(|f| prefix.map_or(true, |p| f.prefix == p))
        .collect();

    frames.sort_by(|a, b| a.prefix.cmp(&b.prefix).then(a.frame.cmp(&b.frame)));
    Ok(frames)
}

/// Calibrate one raw frame and write it next to the source.
pub fn convert_frame(
    pipeline: &MergePipeline,
    raw: &Path,
    encoder_position: f64,
    include_channel: bool,
) -> Result<PathBuf> {
    let dataset = pipeline
        .calibrate_file(raw, encoder_position)
        .with_context(|| format!("Failed to calibrate frame: {}", raw.display()))?;

    let output = processed_path_for(raw);
    write_processed(&output, &dataset, include_channel)
        .with_context(|| format!("Failed to write processed frame: {}", output.display()))?;

    Ok(output)
}

/// Convert frames in parallel on the pipeline's worker pool.
///
/// A failing frame is logged and recorded in the summary; the other frames
/// are still converted.
pub fn convert_frames(
    pipeline: &MergePipeline,
    frames: &[FrameFile],
    encoder_position: f64,
    include_channel: bool,
) -> Result<ConversionSummary> {
    let pool = pipeline.thread_pool()?;

    let results: Vec<(PathBuf, Result<PathBuf>)> = pool.install(|| {
        frames
            .par_iter()
            .map(|frame| {
                let result = convert_frame(pipeline, &frame.path, encoder_position, include_channel);
                (frame.path.clone(), result)
            })
            .collect()
    });

    let mut summary = ConversionSummary::default();
    for (raw, result) in results {
        match result {
            Ok(output) => {
                info!(
                    "{} -> {}",
                    raw.file_name().unwrap_or_default().to_string_lossy(),
                    output.display()
                );
                summary.processed.push(output);
            }
            Err(e) => {
                warn!("Skipping frame {}: {:#}", raw.display(), e);
                summary.failed.push((raw, format!("{:#}", e)));
            }
        }
    }

    Ok(summary)
}
