//! Retained line-chart geometry for the ramp preview and live measurements

use serde::{Deserialize, Serialize};
use textplots::{Chart as TextChart, Plot, Shape};

use crate::ramp::Ramp;

/// Smallest canvas the terminal renderer accepts
const MIN_TEXT_WIDTH: u32 = 32;
const MIN_TEXT_HEIGHT: u32 = 3;

/// A single line series with axis ranges and labels.
///
/// The chart holds no drawing surface; it maps data coordinates
/// into whatever drawable area it is asked to render into.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Chart {
    x_range: (f64, f64),
    y_range: (f64, f64),
    y_suffix: String,

    /// Grid rows per y-axis label
    y_density: usize,

    data: Vec<(f64, f64)>,
    x_header: Vec<String>,
}

impl Default for Chart {
    fn default() -> Self {
        Self {
            x_range: (0.0, 1.0),
            y_range: (0.0, 1.0),
            y_suffix: String::new(),
            y_density: 3,
            data: Vec::new(),
            x_header: Vec::new(),
        }
    }
}

impl Chart {
    /// Preview of a ramp: step index against setpoint in milli-units
    pub fn ramp_preview(ramp: &Ramp) -> Self {
        let mut chart = Self::default();
        let steps = ramp.len().saturating_sub(1) as f64;
        let end_milli = ramp
            .points()
            .last()
            .map(|p| (p.value * 1000.0).floor())
            .unwrap_or(1.0);

        chart.set_x_range(0.0, steps);
        chart.set_y_range(0.0, end_milli);
        chart.set_y_suffix(" mA");
        chart.set_data(
            ramp.points()
                .iter()
                .map(|p| (p.index as f64, (p.value * 1000.0).floor()))
                .collect(),
        );
        chart.set_x_header(ramp.points().iter().map(|p| p.index.to_string()).collect());
        chart
    }

    /// Empty sink-test chart: drawn current in mA against terminal voltage in mV
    pub fn sink_run(end_current_a: f64) -> Self {
        let mut chart = Self::default();
        chart.set_x_range(0.0, (end_current_a.abs() * 1000.0).floor());
        chart.set_y_range(0.0, 12_000.0);
        chart.set_y_suffix(" mV");
        chart
    }

    /// Empty supply-test chart: elapsed seconds against current in mA
    pub fn supply_run(duration_s: f64, current_limit_a: f64) -> Self {
        let mut chart = Self::default();
        chart.set_x_range(0.0, duration_s.max(1.0));
        chart.set_y_range(0.0, (current_limit_a.abs() * 1000.0).floor().max(1.0));
        chart.set_y_suffix(" mA");
        chart
    }

    pub fn set_x_range(&mut self, min: f64, max: f64) {
        self.x_range = (min, max);
    }

    pub fn set_y_range(&mut self, min: f64, max: f64) {
        self.y_range = (min, max);
    }

    pub fn set_y_suffix(&mut self, suffix: &str) {
        self.y_suffix = suffix.to_owned();
    }

    pub fn set_data(&mut self, data: Vec<(f64, f64)>) {
        self.data = data;
    }

    pub fn set_x_header(&mut self, header: Vec<String>) {
        self.x_header = header;
    }

    /// Append a point and its x label, growing the x range if needed
    pub fn push(&mut self, point: (f64, f64), label: String) {
        if point.0 > self.x_range.1 {
            self.x_range.1 = point.0;
        }
        self.data.push(point);
        self.x_header.push(label);
    }

    pub fn x_range(&self) -> (f64, f64) {
        self.x_range
    }

    pub fn y_range(&self) -> (f64, f64) {
        self.y_range
    }

    pub fn y_suffix(&self) -> &str {
        &self.y_suffix
    }

    pub fn data(&self) -> &[(f64, f64)] {
        &self.data
    }

    pub fn x_header(&self) -> &[String] {
        &self.x_header
    }

    /// Linear mapping into a drawable area of `width` by `height` units,
    /// leaving `header_width` on the left for y labels and `padding` around the plot
    pub fn viewport(&self, width: f64, height: f64, header_width: f64, padding: f64) -> Viewport {
        let span_x = self.x_range.1 - self.x_range.0;
        let span_y = self.y_range.1 - self.y_range.0;
        let usable_w = (width - header_width - 2.0 * padding).max(0.0);
        let usable_h = (height - 2.0 * padding).max(0.0);

        Viewport {
            x_min: self.x_range.0,
            y_min: self.y_range.0,
            sx: if span_x != 0.0 { usable_w / span_x } else { 0.0 },
            sy: if span_y != 0.0 { usable_h / span_y } else { 0.0 },
            x_offset: header_width,
            height,
            padding,
        }
    }

    /// Y-axis label values for a plot `rows` text rows tall,
    /// one label every `y_density` rows from the bottom of the range
    pub fn y_ticks(&self, rows: usize) -> Vec<f64> {
        let (lo, hi) = self.y_range;
        if self.y_density == 0 || hi <= lo {
            return Vec::new();
        }

        let n = rows / self.y_density;
        if n == 0 {
            return vec![lo];
        }

        let step = (hi - lo) / n as f64;
        (0..=n).map(|i| lo + step * i as f64).collect()
    }

    /// Y-axis label text for a value
    pub fn y_label(&self, y: f64) -> String {
        format!("{}{}", y.round(), self.y_suffix)
    }

    /// Y-axis legend for a plot `rows` text rows tall, top value first
    pub fn y_legend(&self, rows: usize) -> String {
        let labels: Vec<String> = self
            .y_ticks(rows)
            .into_iter()
            .rev()
            .map(|y| self.y_label(y))
            .collect();
        labels.join(" | ")
    }

    /// X labels laid out under a plot `cols` text columns wide.
    /// Each label starts at its point's column; labels that would overlap
    /// the previous one are skipped.
    pub fn x_label_line(&self, cols: usize) -> String {
        let vp = self.viewport(cols as f64, 1.0, 0.0, 0.0);
        let mut line = String::new();

        for (&(x, _), label) in self.data.iter().zip(self.x_header.iter()) {
            let col = vp.map_x(x).round().max(0.0) as usize;
            let col = col.min(cols.saturating_sub(label.len()));
            let free = if line.is_empty() { 0 } else { line.len() + 1 };
            if col < free {
                continue;
            }
            line.push_str(&" ".repeat(col - line.len()));
            line.push_str(label);
        }

        line
    }

    /// Draw the series to stdout as a terminal line plot,
    /// followed by the y legend and x labels
    pub fn plot(&self, width: u32, height: u32) {
        if self.data.len() < 2 {
            return;
        }

        let width = width.max(MIN_TEXT_WIDTH);
        let height = height.max(MIN_TEXT_HEIGHT);
        let points: Vec<(f32, f32)> = self
            .data
            .iter()
            .map(|&(x, y)| (x as f32, y as f32))
            .collect();
        let (x_min, x_max) = self.x_range;
        let (y_min, y_max) = self.y_range;

        TextChart::new_with_y_range(
            width,
            height,
            x_min as f32,
            x_max.max(x_min + 1.0) as f32,
            y_min as f32,
            y_max.max(y_min + 1.0) as f32,
        )
        .lineplot(&Shape::Lines(&points))
        .display();

        // Braille cells are 2 dots wide and 4 tall
        println!("{}", self.x_label_line((width / 2) as usize));
        println!("{}", self.y_legend((height / 4) as usize));
    }
}

/// Linear coordinate transform from data space into a drawing,
/// with y increasing downward as on a screen
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    x_min: f64,
    y_min: f64,
    sx: f64,
    sy: f64,
    x_offset: f64,
    height: f64,
    padding: f64,
}

impl Viewport {
    pub fn map_x(&self, x: f64) -> f64 {
        (x - self.x_min) * self.sx + self.x_offset
    }

    pub fn map_y(&self, y: f64) -> f64 {
        self.height - (y - self.y_min) * self.sy - self.padding
    }

    pub fn map(&self, point: (f64, f64)) -> (f64, f64) {
        (self.map_x(point.0), self.map_y(point.1))
    }
}
