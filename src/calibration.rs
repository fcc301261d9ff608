//! Least-squares calibration lines.
//!
//! Every committed pressure point adds one [`HistoryPoint`] per channel. Once a
//! sweep is done, each channel's history is fitted by ordinary least squares to
//! `average = slope * pressure + intercept`.

use polars::prelude::{Column, DataFrame, NamedFrom, PolarsError, Series};
use std::fmt;

/// Averaged reading of one channel at one reference pressure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryPoint {
    pub pressure: f64,
    pub average: f64,
}

impl HistoryPoint {
    pub fn new(pressure: f64, average: f64) -> Self {
        Self { pressure, average }
    }
}

/// Per-channel history of a sweep.
///
/// Row `i` of every channel belongs to the same pressure point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelHistory {
    channels: Vec<Vec<HistoryPoint>>,
}

impl ChannelHistory {
    pub fn new(num_channels: usize) -> Self {
        Self {
            channels: vec![Vec::new(); num_channels],
        }
    }

    /// Build a history from per-channel point lists, e.g. one restored by a
    /// consumer.
    pub fn from_channels(channels: Vec<Vec<HistoryPoint>>) -> Self {
        Self { channels }
    }

    pub(crate) fn record(&mut self, pressure: f64, averages: &[f64]) {
        for (points, &average) in self.channels.iter_mut().zip(averages) {
            points.push(HistoryPoint::new(pressure, average));
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Number of pressure points recorded.
    pub fn points(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.points() == 0
    }

    pub fn channel(&self, channel: usize) -> Option<&[HistoryPoint]> {
        self.channels.get(channel).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[HistoryPoint]> {
        self.channels.iter().map(Vec::as_slice)
    }

    /// Reference pressures in sweep order.
    pub fn pressures(&self) -> Vec<f64> {
        self.channels
            .first()
            .map(|points| points.iter().map(|p| p.pressure).collect())
            .unwrap_or_default()
    }

    /// One `pressure` column followed by one averages column per channel.
    pub fn to_dataframe(&self, channel_names: &[String]) -> Result<DataFrame, PolarsError> {
        let mut columns: Vec<Column> = Vec::with_capacity(self.channels.len() + 1);
        columns.push(Series::new("pressure".into(), self.pressures()).into());

        for (channel, points) in self.channels.iter().enumerate() {
            let name = channel_names
                .get(channel)
                .cloned()
                .unwrap_or_else(|| format!("channel_{}", channel));
            let averages: Vec<f64> = points.iter().map(|p| p.average).collect();
            columns.push(Series::new(name.into(), averages).into());
        }

        DataFrame::new(columns)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    #[error("Insufficient data: a line needs at least 2 points, got {points}")]
    InsufficientData { points: usize },

    #[error("Degenerate input: every point was taken at pressure {pressure}")]
    DegenerateInput { pressure: f64 },

    #[error("Calibration line is flat, readings do not depend on pressure")]
    ZeroSlope,
}

/// `average = slope * pressure + intercept` for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationCoefficients {
    pub slope: f64,
    pub intercept: f64,
}

impl CalibrationCoefficients {
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    /// Expected raw reading at `pressure`
    pub fn reading_at(&self, pressure: f64) -> f64 {
        self.slope * pressure + self.intercept
    }

    /// Calibrated pressure for a raw reading
    pub fn pressure_at(&self, reading: f64) -> Result<f64, FitError> {
        if self.slope == 0.0 {
            return Err(FitError::ZeroSlope);
        }
        Ok((reading - self.intercept) / self.slope)
    }
}

/// Fit one channel's history by ordinary least squares, pressure on x.
pub fn fit_channel(points: &[HistoryPoint]) -> Result<CalibrationCoefficients, FitError> {
    let Some(first) = points.first() else {
        return Err(FitError::InsufficientData { points: 0 });
    };
    if points.len() < 2 {
        return Err(FitError::InsufficientData {
            points: points.len(),
        });
    }

    let degenerate = || FitError::DegenerateInput {
        pressure: first.pressure,
    };
    if points.iter().all(|p| p.pressure == first.pressure) {
        return Err(degenerate());
    }

    let n = points.len() as f64;
    let (sum_x, sum_y, sum_xy, sum_xx) =
        points
            .iter()
            .fold((0.0, 0.0, 0.0, 0.0), |(sx, sy, sxy, sxx), p| {
                (
                    sx + p.pressure,
                    sy + p.average,
                    sxy + p.pressure * p.average,
                    sxx + p.pressure * p.pressure,
                )
            });

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator == 0.0 || !denominator.is_finite() {
        return Err(degenerate());
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;
    Ok(CalibrationCoefficients::new(slope, intercept))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFitFailure {
    pub channel: usize,
    pub error: FitError,
}

impl fmt::Display for ChannelFitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {}: {}", self.channel, self.error)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("Calibration failed for {}", join_failures(.0))]
    Channels(Vec<ChannelFitFailure>),
}

impl CalibrationError {
    pub fn failures(&self) -> &[ChannelFitFailure] {
        match self {
            Self::Channels(failures) => failures,
        }
    }

    pub fn failed_channels(&self) -> Vec<usize> {
        self.failures().iter().map(|f| f.channel).collect()
    }
}

fn join_failures(failures: &[ChannelFitFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Coefficients of every channel, in channel order.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    coefficients: Vec<CalibrationCoefficients>,
}

impl CalibrationTable {
    pub fn channel(&self, channel: usize) -> Option<&CalibrationCoefficients> {
        self.coefficients.get(channel)
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CalibrationCoefficients> {
        self.coefficients.iter()
    }

    pub fn into_vec(self) -> Vec<CalibrationCoefficients> {
        self.coefficients
    }

    pub fn to_dataframe(&self, channel_names: &[String]) -> Result<DataFrame, PolarsError> {
        let names: Vec<String> = (0..self.coefficients.len())
            .map(|channel| {
                channel_names
                    .get(channel)
                    .cloned()
                    .unwrap_or_else(|| format!("channel_{}", channel))
            })
            .collect();
        let slopes: Vec<f64> = self.coefficients.iter().map(|c| c.slope).collect();
        let intercepts: Vec<f64> = self.coefficients.iter().map(|c| c.intercept).collect();

        DataFrame::new(vec![
            Series::new("channel".into(), names).into(),
            Series::new("slope".into(), slopes).into(),
            Series::new("intercept".into(), intercepts).into(),
        ])
    }
}

/// Fit every channel. Fails if any channel fails, listing all failed channels.
pub fn fit_all(history: &ChannelHistory) -> Result<CalibrationTable, CalibrationError> {
    let mut coefficients = Vec::with_capacity(history.num_channels());
    let mut failures = Vec::new();

    for (channel, points) in history.iter().enumerate() {
        match fit_channel(points) {
            Ok(c) => {
                log::debug!(
                    "Channel {} calibration: slope={}, intercept={}",
                    channel,
                    c.slope,
                    c.intercept
                );
                coefficients.push(c);
            }
            Err(error) => {
                log::warn!("Channel {} could not be calibrated: {}", channel, error);
                failures.push(ChannelFitFailure { channel, error });
            }
        }
    }

    if failures.is_empty() {
        Ok(CalibrationTable { coefficients })
    } else {
        Err(CalibrationError::Channels(failures))
    }
}
