//! Training-curve figures.
//!
//! Figures are built as plain data (rows of accuracy/entropy panels) and only
//! handed to `plotters` when rendered, so their layout and labels can be
//! inspected without a drawing backend.

use crate::error::MlError;
use crate::training::metrics::{BINARY_ACCURACY, History, LOSS, VAL_BINARY_ACCURACY, VAL_LOSS};
use crate::training::sweep::{Hyperparameter, SweepResult};
use plotters::coord::Shift;
use plotters::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SINGLE_RUN_TITLE: &str = "CNN training curves";
pub const SWEEP_TITLE: &str = "CNN hyperparameter sweep";
pub const ACCURACY_TITLE: &str = "Accuracy";
pub const ACCURACY_LABEL: &str = "Accuracy (%)";
pub const ENTROPY_TITLE: &str = "Binary cross-entropy";
pub const EPOCH_LABEL: &str = "Epoch";
pub const TRAINING_SERIES: &str = "Training";
pub const VALIDATION_SERIES: &str = "Validation";

const PANEL_WIDTH: u32 = 500;
const ROW_HEIGHT: u32 = 360;
const TITLE_HEIGHT: u32 = 48;
const FONT: &str = "sans-serif";

/// Which metric pair a panel shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelKind {
    Accuracy,
    Entropy,
}

/// One named line, indexed by epoch (1-based on the x axis).
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub label: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Panel {
    pub kind: PanelKind,
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub series: Vec<Series>,
    /// Fixed y range; derived from the data when absent.
    pub y_limits: Option<(f64, f64)>,
}

impl Panel {
    fn accuracy(history: &History) -> Self {
        let percent =
            |name: &str| -> Vec<f64> { history.metric(name).iter().map(|v| v * 100.0).collect() };
        Self {
            kind: PanelKind::Accuracy,
            title: ACCURACY_TITLE.to_string(),
            x_label: EPOCH_LABEL.to_string(),
            y_label: ACCURACY_LABEL.to_string(),
            series: vec![
                Series {
                    label: TRAINING_SERIES.to_string(),
                    values: percent(BINARY_ACCURACY),
                },
                Series {
                    label: VALIDATION_SERIES.to_string(),
                    values: percent(VAL_BINARY_ACCURACY),
                },
            ],
            y_limits: None,
        }
    }

    fn entropy(history: &History) -> Self {
        Self {
            kind: PanelKind::Entropy,
            title: ENTROPY_TITLE.to_string(),
            x_label: EPOCH_LABEL.to_string(),
            y_label: ENTROPY_TITLE.to_string(),
            series: vec![
                Series {
                    label: TRAINING_SERIES.to_string(),
                    values: history.metric(LOSS).to_vec(),
                },
                Series {
                    label: VALIDATION_SERIES.to_string(),
                    values: history.metric(VAL_LOSS).to_vec(),
                },
            ],
            y_limits: None,
        }
    }

    /// Longest series length, at least 1.
    fn epochs(&self) -> usize {
        self.series
            .iter()
            .map(|s| s.values.len())
            .max()
            .unwrap_or(0)
            .max(1)
    }

    /// Y range to draw: the fixed limits, or the finite data range padded so
    /// it is never empty.
    pub fn y_range(&self) -> (f64, f64) {
        if let Some(limits) = self.y_limits {
            return limits;
        }
        let (lo, hi) = self
            .series
            .iter()
            .flat_map(|s| s.values.iter().copied())
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        if lo > hi {
            (0.0, 1.0)
        } else if (hi - lo).abs() < f64::EPSILON {
            (lo - 0.5, hi + 0.5)
        } else {
            let pad = (hi - lo) * 0.05;
            (lo - pad, hi + pad)
        }
    }
}

/// An accuracy panel and an entropy panel, optionally titled.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelRow {
    pub title: Option<String>,
    pub panels: Vec<Panel>,
}

impl PanelRow {
    fn for_history(title: Option<String>, history: &History) -> Self {
        Self {
            title,
            panels: vec![Panel::accuracy(history), Panel::entropy(history)],
        }
    }
}

/// Optional y-axis limits applied to every panel of a kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisLimits {
    /// In percent, matching the accuracy panels.
    pub accuracy: Option<(f64, f64)>,
    pub entropy: Option<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Figure {
    pub title: String,
    pub rows: Vec<PanelRow>,
}

/// Training and validation curves of one run, side by side.
pub fn single_run_figure(history: &History) -> Figure {
    Figure {
        title: SINGLE_RUN_TITLE.to_string(),
        rows: vec![PanelRow::for_history(None, history)],
    }
}

/// One row per sweep run, titled with the `shown` hyperparameter values.
pub fn sweep_figure(result: &SweepResult, shown: &[Hyperparameter]) -> Figure {
    let rows = result
        .runs
        .iter()
        .map(|run| {
            let title = shown
                .iter()
                .map(|h| format!("{}: {}", h.display_name(), h.value_of(&run.config)))
                .collect::<Vec<_>>()
                .join(", ");
            let title = (!title.is_empty()).then_some(title);
            PanelRow::for_history(title, &run.history)
        })
        .collect();
    Figure {
        title: SWEEP_TITLE.to_string(),
        rows,
    }
}

fn plot_err(err: impl std::fmt::Display) -> MlError {
    MlError::plot(err.to_string())
}

impl Figure {
    pub fn with_axis_limits(mut self, limits: &AxisLimits) -> Self {
        for panel in self.rows.iter_mut().flat_map(|r| r.panels.iter_mut()) {
            let fixed = match panel.kind {
                PanelKind::Accuracy => limits.accuracy,
                PanelKind::Entropy => limits.entropy,
            };
            if fixed.is_some() {
                panel.y_limits = fixed;
            }
        }
        self
    }

    /// Pixel size of the rendered figure.
    pub fn size(&self) -> (u32, u32) {
        let columns = self
            .rows
            .iter()
            .map(|r| r.panels.len())
            .max()
            .unwrap_or(1)
            .max(1) as u32;
        (
            PANEL_WIDTH * columns,
            TITLE_HEIGHT + ROW_HEIGHT * self.rows.len().max(1) as u32,
        )
    }

    pub fn render_svg(&self, path: &Path) -> Result<(), MlError> {
        create_parent(path)?;
        let root = SVGBackend::new(path, self.size()).into_drawing_area();
        self.draw(&root)?;
        root.present().map_err(plot_err)
    }

    pub fn render_png(&self, path: &Path) -> Result<(), MlError> {
        create_parent(path)?;
        let root = BitMapBackend::new(path, self.size()).into_drawing_area();
        self.draw(&root)?;
        root.present().map_err(plot_err)
    }

    fn draw<DB: DrawingBackend>(&self, root: &DrawingArea<DB, Shift>) -> Result<(), MlError> {
        if self.rows.is_empty() {
            return Err(MlError::plot("figure has no rows to draw"));
        }
        root.fill(&WHITE).map_err(plot_err)?;
        let body = root.titled(&self.title, (FONT, 28)).map_err(plot_err)?;

        for (row, area) in self.rows.iter().zip(body.split_evenly((self.rows.len(), 1))) {
            let area = match &row.title {
                Some(title) => area.titled(title, (FONT, 18)).map_err(plot_err)?,
                None => area,
            };
            let cells = area.split_evenly((1, row.panels.len().max(1)));
            for (panel, cell) in row.panels.iter().zip(cells.iter()) {
                draw_panel(panel, cell)?;
            }
        }
        Ok(())
    }
}

fn draw_panel<DB: DrawingBackend>(
    panel: &Panel,
    area: &DrawingArea<DB, Shift>,
) -> Result<(), MlError> {
    let (y_lo, y_hi) = panel.y_range();
    let x_hi = panel.epochs().max(2) as f64;

    let mut chart = ChartBuilder::on(area)
        .caption(&panel.title, (FONT, 16))
        .margin(8)
        .x_label_area_size(32)
        .y_label_area_size(48)
        .build_cartesian_2d(1f64..x_hi, y_lo..y_hi)
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc(panel.x_label.as_str())
        .y_desc(panel.y_label.as_str())
        .draw()
        .map_err(plot_err)?;

    for (i, series) in panel.series.iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        let points = series
            .values
            .iter()
            .enumerate()
            .map(|(epoch, v)| ((epoch + 1) as f64, *v));
        chart
            .draw_series(LineSeries::new(points, color.stroke_width(2)))
            .map_err(plot_err)?
            .label(series.label.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2)));
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(plot_err)
}

fn create_parent(path: &Path) -> Result<(), MlError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
