//! Raw-to-engineering scaling
//!
//! Multiplies each reconstructed channel by its variable's scale factor and
//! labels it with the variable's unit. Scaling is pure: the capture time is
//! passed in rather than read from the clock, so the same inputs always give
//! the same dataset.

use super::timeline::{ReconstructedSeries, UnderDelivery};
use crate::types::ScaledVariable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One channel in engineering units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaledChannel {
    pub identifier: String,
    pub label: String,
    pub unit: String,
    /// Factor already applied to `values`
    pub scale_factor: f64,
    pub values: Vec<f64>,
}

impl ScaledChannel {
    pub fn min(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
        }
    }
}

/// Final capture result in engineering units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaledDataset {
    pub captured_at: DateTime<Utc>,
    pub sample_rate_hz: f64,
    pub sample_factor: u32,
    /// Seconds since the first sample
    pub timestamps: Vec<f64>,
    pub channels: Vec<ScaledChannel>,
    pub under_delivery: Option<UnderDelivery>,
}

impl ScaledDataset {
    /// Samples per channel
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Find a channel by identifier or label
    pub fn channel(&self, name: &str) -> Option<&ScaledChannel> {
        self.channels
            .iter()
            .find(|c| c.identifier == name || c.label == name)
    }

    /// Multiply every channel by `factor`
    ///
    /// The recorded scale factors are updated so they keep describing the
    /// total conversion from raw counts.
    pub fn scaled_by(&self, factor: f64) -> Self {
        let mut scaled = self.clone();
        for channel in &mut scaled.channels {
            channel.scale_factor *= factor;
            for value in &mut channel.values {
                *value *= factor;
            }
        }
        scaled
    }

    /// Covered time span in seconds
    pub fn span_seconds(&self) -> f64 {
        self.timestamps.last().copied().unwrap_or(0.0)
    }
}

/// Scale a reconstructed series
///
/// `variables` must be the request's variables in request order; channels
/// without a matching variable are left out.
pub fn scale_series(
    series: &ReconstructedSeries,
    variables: &[Arc<ScaledVariable>],
    captured_at: DateTime<Utc>,
) -> ScaledDataset {
    let channels = series
        .channels
        .iter()
        .zip(variables)
        .map(|(raw, var)| ScaledChannel {
            identifier: var.identifier.clone(),
            label: var.label.clone(),
            unit: var.unit.clone(),
            scale_factor: var.scale_factor,
            values: raw.iter().map(|&v| v as f64 * var.scale_factor).collect(),
        })
        .collect();

    ScaledDataset {
        captured_at,
        sample_rate_hz: series.sample_rate_hz,
        sample_factor: series.sample_factor,
        timestamps: series.timestamps.clone(),
        channels,
        under_delivery: series.under_delivery,
    }
}
