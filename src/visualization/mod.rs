//! Quick-look plots of merged patterns and binned overlays.
//!
//! Plots are rendered to PNG with the plotters bitmap backend. Only data is
//! drawn (no axes or text), so no font backend is required.

use std::path::Path;

use plotters::prelude::*;
use plotters_bitmap::BitMapBackend;
use thiserror::Error;

use crate::core::loaders::MergedDataPoint;
use crate::processors::binning::CommonGrid;

/// Errors that can occur during visualization.
#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plotting error: {0}")]
    PlottingError(String),

    #[error("Nothing to plot")]
    EmptyData,
}

/// Result type for visualization operations.
pub type Result<T> = std::result::Result<T, VisualizationError>;

/// Default plot width in pixels.
const DEFAULT_WIDTH: u32 = 1920;

/// Default plot height in pixels.
const DEFAULT_HEIGHT: u32 = 1080;

/// One color per overlay series, cycled.
const SERIES_COLORS: &[(u8, u8, u8)] = &[
    (228, 26, 28),
    (55, 126, 184),
    (77, 175, 74),
    (152, 78, 163),
    (255, 127, 0),
    (166, 86, 40),
    (247, 129, 191),
    (0, 206, 209),
];

fn plot_error<E: std::fmt::Display>(e: E) -> VisualizationError {
    VisualizationError::PlottingError(e.to_string())
}

/// Bounds of (angle, count) pairs with 5% padding; zero-width axes are widened.
fn padded_bounds(points: impl Iterator<Item = (f64, f64)>) -> (f64, f64, f64, f64) {
    let mut x_min = f64::MAX;
    let mut x_max = f64::MIN;
    let mut y_min = 0.0f64;
    let mut y_max = f64::MIN;

    for (x, y) in points {
        x_min = x_min.min(x);
        x_max = x_max.max(x);
        y_min = y_min.min(y);
        y_max = y_max.max(y);
    }

    if (x_max - x_min).abs() < f64::EPSILON {
        x_min -= 1.0;
        x_max += 1.0;
    }
    if (y_max - y_min).abs() < f64::EPSILON {
        y_max += 1.0;
    }

    let x_padding = (x_max - x_min) * 0.05;
    let y_padding = (y_max - y_min) * 0.05;
    (x_min - x_padding, x_max + x_padding, y_min, y_max + y_padding)
}

/// Plot a merged pattern (angle vs count) as a line, optionally with error bars.
pub fn plot_merged(output_path: &Path, points: &[MergedDataPoint], show_errors: bool) -> Result<()> {
    if points.is_empty() {
        return Err(VisualizationError::EmptyData);
    }

    let (x_min, x_max, y_min, y_max) = padded_bounds(
        points
            .iter()
            .map(|p| (p.angle, if show_errors { p.count + p.error } else { p.count })),
    );

    let root = BitMapBackend::new(output_path, (DEFAULT_WIDTH, DEFAULT_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)
        .map_err(plot_error)?;

    let line_color = RGBColor(55, 126, 184);
    chart
        .draw_series(LineSeries::new(
            points.iter().map(|p| (p.angle, p.count)),
            &line_color,
        ))
        .map_err(plot_error)?;

    if show_errors {
        chart
            .draw_series(points.iter().map(|p| {
                ErrorBar::new_vertical(
                    p.angle,
                    (p.count - p.error).max(0.0),
                    p.count,
                    p.count + p.error,
                    RGBColor(150, 150, 150).filled(),
                    2,
                )
            }))
            .map_err(plot_error)?;
    }

    root.present().map_err(plot_error)?;
    Ok(())
}

/// Plot every series of a binned overlay, one colored line per dataset.
///
/// Missing bins break a series' line rather than being drawn as zero.
pub fn plot_overlay(output_path: &Path, grid: &CommonGrid) -> Result<()> {
    let present = grid.series.iter().flat_map(|s| {
        s.iter()
            .zip(&grid.angles)
            .filter_map(|(v, &a)| v.map(|v| (a, v)))
    });
    if grid.is_empty() || present.clone().next().is_none() {
        return Err(VisualizationError::EmptyData);
    }

    let (x_min, x_max, y_min, y_max) = padded_bounds(present);

    let root = BitMapBackend::new(output_path, (DEFAULT_WIDTH, DEFAULT_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)
        .map_err(plot_error)?;

    for (index, series) in grid.series.iter().enumerate() {
        let (r, g, b) = SERIES_COLORS[index % SERIES_COLORS.len()];
        let color = RGBColor(r, g, b);

        // Split at missing bins
        let mut runs: Vec<Vec<(f64, f64)>> = vec![Vec::new()];
        for (value, &angle) in series.iter().zip(&grid.angles) {
            match value {
                Some(v) => {
                    if let Some(run) = runs.last_mut() {
                        run.push((angle, *v));
                    }
                }
                None => runs.push(Vec::new()),
            }
        }

        for run in runs.into_iter().filter(|r| !r.is_empty()) {
            chart
                .draw_series(LineSeries::new(run, &color))
                .map_err(plot_error)?;
        }
    }

    root.present().map_err(plot_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pattern() -> Vec<MergedDataPoint> {
        (0..50)
            .map(|i| {
                let count = 10.0 + (i % 7) as f64;
                MergedDataPoint {
                    grid_index: i,
                    angle: i as f64 * 0.1,
                    count,
                    error: count.sqrt(),
                }
            })
            .collect()
    }

    #[test]
    fn test_plot_merged_writes_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("merged.png");

        plot_merged(&path, &pattern(), true).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_plot_overlay_writes_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overlay.png");
        let grid = CommonGrid {
            angles: vec![0.0, 1.0, 2.0, 3.0],
            series: vec![
                vec![Some(1.0), Some(2.0), None, Some(4.0)],
                vec![None, Some(3.0), Some(1.0), Some(2.0)],
            ],
        };

        plot_overlay(&path, &grid).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_empty_inputs_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.png");

        assert!(matches!(
            plot_merged(&path, &[], false),
            Err(VisualizationError::EmptyData)
        ));
        let grid = CommonGrid {
            angles: vec![0.0],
            series: vec![vec![None]],
        };
        assert!(matches!(plot_overlay(&path, &grid), Err(VisualizationError::EmptyData)));
    }
}
