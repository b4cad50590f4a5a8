//! Time-axis reconstruction
//!
//! Device ticks in a raw capture are not trusted for timing: the link delivers
//! samples in bursts and the tick counter may wrap or jump. The reconstructor
//! keeps each channel's samples in arrival order and places sample `k` at
//! exactly `k / Fs` seconds, where `Fs = 20000 / f`.
//!
//! Every channel is cut to the same length, `min(N, shortest channel)` with
//! `N = round(duration × Fs)`. Channels that came up short produce an
//! [`UnderDelivery`] warning instead of padded or interpolated values.

use crate::session::CaptureRequest;
use crate::types::{effective_rate_hz, RawSample};
use serde::{Deserialize, Serialize};

/// Shortfall between the requested and delivered sample count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnderDelivery {
    /// Samples per channel the request asked for
    pub expected: usize,
    /// Samples per channel actually kept
    pub delivered: usize,
    pub missing: usize,
}

impl std::fmt::Display for UnderDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "requested {} samples per channel, delivered {} ({} missing)",
            self.expected, self.delivered, self.missing
        )
    }
}

/// Uniformly timed raw values, one column per requested channel
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedSeries {
    pub sample_factor: u32,
    pub sample_rate_hz: f64,
    /// `round(duration × Fs)`
    pub expected_len: usize,
    /// Seconds since the first sample, `k / Fs`
    pub timestamps: Vec<f64>,
    /// Raw values indexed by channel, all of `timestamps.len()`
    pub channels: Vec<Vec<i32>>,
    pub under_delivery: Option<UnderDelivery>,
    /// Samples dropped because their channel index was not part of the request
    pub discarded: usize,
    /// Raw count of the fullest channel before trimming
    pub longest_channel: usize,
}

impl ReconstructedSeries {
    /// Samples per channel
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Time between consecutive samples
    pub fn sample_period(&self) -> f64 {
        if self.sample_rate_hz > 0.0 {
            1.0 / self.sample_rate_hz
        } else {
            0.0
        }
    }

    /// Samples dropped past the expected length on the fullest channel
    pub fn trimmed(&self) -> usize {
        self.longest_channel.saturating_sub(self.len())
    }
}

/// Rebuild a uniform time axis for the samples of `request`
pub fn reconstruct_request(raw: &[RawSample], request: &CaptureRequest) -> ReconstructedSeries {
    reconstruct(
        raw,
        request.variables().len(),
        request.sample_factor(),
        request.duration_seconds(),
    )
}

/// Rebuild a uniform time axis
///
/// `channel_count` is the number of variables in the request; samples with a
/// larger channel index are discarded and counted.
pub fn reconstruct(
    raw: &[RawSample],
    channel_count: usize,
    sample_factor: u32,
    duration_seconds: f64,
) -> ReconstructedSeries {
    let sample_rate_hz = effective_rate_hz(sample_factor);
    let expected_len = expected_len(duration_seconds, sample_rate_hz);

    let mut per_channel: Vec<Vec<i32>> = vec![Vec::new(); channel_count];
    let mut discarded = 0;
    for sample in raw {
        match per_channel.get_mut(sample.channel_index) {
            Some(values) => values.push(sample.raw_value),
            None => discarded += 1,
        }
    }

    let longest_channel = per_channel.iter().map(Vec::len).max().unwrap_or(0);
    let shortest = per_channel.iter().map(Vec::len).min().unwrap_or(0);
    let len = if channel_count == 0 {
        0
    } else {
        expected_len.min(shortest)
    };

    for values in &mut per_channel {
        values.truncate(len);
    }

    let under_delivery = (channel_count > 0 && len < expected_len).then(|| UnderDelivery {
        expected: expected_len,
        delivered: len,
        missing: expected_len - len,
    });

    let timestamps = (0..len).map(|k| k as f64 / sample_rate_hz).collect();

    ReconstructedSeries {
        sample_factor,
        sample_rate_hz,
        expected_len,
        timestamps,
        channels: per_channel,
        under_delivery,
        discarded,
        longest_channel,
    }
}

fn expected_len(duration_seconds: f64, sample_rate_hz: f64) -> usize {
    let n = (duration_seconds * sample_rate_hz).round();
    if n.is_finite() && n > 0.0 {
        n as usize
    } else {
        0
    }
}
