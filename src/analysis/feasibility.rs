//! Capture feasibility estimation
//!
//! Predicts whether a capture request fits through the serial link before
//! anything is armed. The estimate is pure arithmetic over the request and an
//! optional device buffer size, so it can be recomputed on every parameter
//! change, including while a session is running.
//!
//! ```text
//! Fs               = 20000 / f
//! bytes_per_second = Σ byte_width × Fs
//! uart_capacity    = baud / 10                 (8N1)
//! utilization      = bytes_per_second / uart_capacity
//! buffer_time      = buffer_bytes / bytes_per_second
//! total_bytes      = bytes_per_second × duration
//! ```
//!
//! # Example
//!
//! ```ignore
//! use motorscope::analysis::{estimate, FeasibilityInput, RiskLevel};
//!
//! let input = FeasibilityInput::new(4, 20, 115_200, 2.0);
//! let report = estimate(&input);
//! assert_eq!(report.risk, RiskLevel::Green);
//! ```

use crate::session::CaptureRequest;
use crate::types::{effective_rate_hz, sample_period_ms, CONTROL_TICK_HZ, GUARD_MIN_SAMPLE_FACTOR};
use serde::{Deserialize, Serialize};

/// Bits on the wire per payload byte (start + 8 data + stop)
pub const UART_BITS_PER_BYTE: f64 = 10.0;

/// Utilization from which the link is considered tight
pub const AMBER_UTILIZATION: f64 = 0.4;

/// Utilization above which samples are likely lost
pub const RED_UTILIZATION: f64 = 0.7;

/// Capture size above which exports get a size warning
pub const LARGE_EXPORT_BYTES: f64 = 25e6;

/// Traffic-light rating of link utilization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Green,
    Amber,
    Red,
}

impl RiskLevel {
    /// Rate a utilization ratio; anything that is not a finite number is RED
    pub fn from_utilization(utilization: f64) -> Self {
        if !utilization.is_finite() || utilization > RED_UTILIZATION {
            RiskLevel::Red
        } else if utilization >= AMBER_UTILIZATION {
            RiskLevel::Amber
        } else {
            RiskLevel::Green
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            RiskLevel::Green => "GREEN",
            RiskLevel::Amber => "AMBER",
            RiskLevel::Red => "RED",
        }
    }

    fn advice(&self) -> &'static str {
        match self {
            RiskLevel::Red => {
                "Likely overrun or choppy data; increase the sample factor or raise the baud rate."
            }
            RiskLevel::Amber => "Tight headroom; protocol overhead may drop samples.",
            RiskLevel::Green => "Comfortable headroom.",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Why a report could not be computed meaningfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidInput {
    /// Sample factor of zero, so there is no sample rate
    ZeroSampleFactor,
    /// Baud rate of zero, so the link has no capacity
    ZeroBaudRate,
    /// No channels selected, so there is no payload
    NoChannels,
}

impl std::fmt::Display for InvalidInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidInput::ZeroSampleFactor => write!(f, "sample factor is zero"),
            InvalidInput::ZeroBaudRate => write!(f, "baud rate is zero"),
            InvalidInput::NoChannels => write!(f, "no channels selected"),
        }
    }
}

/// Parameters the estimate depends on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeasibilityInput {
    /// Sum of the byte widths of all selected channels
    pub bytes_per_sample: usize,
    pub sample_factor: u32,
    pub baud_rate: u32,
    pub duration_seconds: f64,
    /// Device sample buffer size, when known
    pub buffer_bytes: Option<usize>,
    pub guard_override: bool,
}

impl FeasibilityInput {
    pub fn new(bytes_per_sample: usize, sample_factor: u32, baud_rate: u32, duration_seconds: f64) -> Self {
        Self {
            bytes_per_sample,
            sample_factor,
            baud_rate,
            duration_seconds,
            buffer_bytes: None,
            guard_override: false,
        }
    }

    pub fn with_buffer(mut self, buffer_bytes: Option<usize>) -> Self {
        self.buffer_bytes = buffer_bytes;
        self
    }

    pub fn with_guard_override(mut self, enabled: bool) -> Self {
        self.guard_override = enabled;
        self
    }

    /// Derive the input from a capture request
    pub fn from_request(request: &CaptureRequest, buffer_bytes: Option<usize>) -> Self {
        let bytes_per_sample = request
            .variables()
            .iter()
            .map(|v| v.byte_width.bytes())
            .sum();
        Self::new(
            bytes_per_sample,
            request.sample_factor(),
            request.baud_rate(),
            request.duration_seconds(),
        )
        .with_buffer(buffer_bytes)
        .with_guard_override(request.guard_override())
    }

    fn invalid_input(&self) -> Option<InvalidInput> {
        if self.sample_factor == 0 {
            Some(InvalidInput::ZeroSampleFactor)
        } else if self.baud_rate == 0 {
            Some(InvalidInput::ZeroBaudRate)
        } else if self.bytes_per_sample == 0 {
            Some(InvalidInput::NoChannels)
        } else {
            None
        }
    }
}

/// Result of a feasibility estimate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeasibilityReport {
    pub sample_factor: u32,
    pub sample_rate_hz: f64,
    pub bytes_per_sample: usize,
    /// Payload the capture produces
    pub bytes_per_second: f64,
    /// What the link can carry at 8N1
    pub uart_capacity_bytes_per_second: f64,
    pub utilization: f64,
    pub risk: RiskLevel,
    /// How long the device buffer can absorb the payload, when its size is known
    pub buffer_time_seconds: Option<f64>,
    /// Payload over the whole capture, unrounded
    pub total_bytes: f64,
    /// Set when the parameters are degenerate; the risk is then RED regardless of load
    pub invalid_input: Option<InvalidInput>,
    /// Human readable advice, one line each
    pub notes: Vec<String>,
}

impl FeasibilityReport {
    /// Whether the report is RED because of the load rather than bad input
    pub fn is_overloaded(&self) -> bool {
        self.invalid_input.is_none() && self.risk == RiskLevel::Red
    }

    /// Whether the device buffer is too small to hold the whole capture
    pub fn requires_streaming(&self, duration_seconds: f64) -> Option<bool> {
        self.buffer_time_seconds.map(|t| t < duration_seconds)
    }
}

/// Smallest sample factor keeping utilization at or below `max_utilization`
///
/// Returns `None` when the link has no capacity or the target is not positive.
pub fn min_sample_factor(bytes_per_sample: usize, baud_rate: u32, max_utilization: f64) -> Option<u32> {
    let capacity = baud_rate as f64 / UART_BITS_PER_BYTE;
    if capacity <= 0.0 || !(max_utilization.is_finite() && max_utilization > 0.0) {
        return None;
    }
    let needed = bytes_per_sample as f64 * CONTROL_TICK_HZ as f64 / (capacity * max_utilization);
    // Ratios that land on an integer must not be pushed up by rounding noise
    let factor = (needed - 1e-9).ceil().max(1.0);
    if factor > u32::MAX as f64 {
        None
    } else {
        Some(factor as u32)
    }
}

/// Estimate whether a capture fits the link
pub fn estimate(input: &FeasibilityInput) -> FeasibilityReport {
    let sample_rate_hz = effective_rate_hz(input.sample_factor);
    let bytes_per_second = input.bytes_per_sample as f64 * sample_rate_hz;
    let uart_capacity = input.baud_rate as f64 / UART_BITS_PER_BYTE;
    let invalid_input = input.invalid_input();

    let utilization = if invalid_input.is_some() {
        0.0
    } else {
        bytes_per_second / uart_capacity
    };
    let risk = if invalid_input.is_some() {
        RiskLevel::Red
    } else {
        RiskLevel::from_utilization(utilization)
    };

    let duration = if input.duration_seconds.is_finite() {
        input.duration_seconds.max(0.0)
    } else {
        0.0
    };
    let total_bytes = bytes_per_second * duration;

    let buffer_time_seconds = match input.buffer_bytes {
        Some(sda) if bytes_per_second > 0.0 => Some(sda as f64 / bytes_per_second),
        _ => None,
    };

    let mut report = FeasibilityReport {
        sample_factor: input.sample_factor,
        sample_rate_hz,
        bytes_per_sample: input.bytes_per_sample,
        bytes_per_second,
        uart_capacity_bytes_per_second: uart_capacity,
        utilization,
        risk,
        buffer_time_seconds,
        total_bytes,
        invalid_input,
        notes: Vec::new(),
    };
    report.notes = notes(input, &report, duration);
    report
}

fn notes(input: &FeasibilityInput, report: &FeasibilityReport, duration: f64) -> Vec<String> {
    let mut notes = Vec::new();

    if let Some(reason) = report.invalid_input {
        notes.push(format!("Cannot estimate: {}.", reason));
        return notes;
    }

    let f = input.sample_factor;
    notes.push(format!(
        "At f = {}, effective Fs = {:.0} Hz ({:.3} ms per sample).",
        f,
        report.sample_rate_hz,
        sample_period_ms(f)
    ));
    notes.push(format!(
        "Payload ≈ {:.0} B/s vs UART ≈ {:.0} B/s ({:.1}% of the link) → {}.",
        report.bytes_per_second,
        report.uart_capacity_bytes_per_second,
        report.utilization * 100.0,
        report.risk
    ));
    notes.push(report.risk.advice().to_string());

    match report.buffer_time_seconds {
        None => notes.push(
            "Buffer size unknown; run the buffer probe to estimate the device capacity.".to_string(),
        ),
        Some(t) if t < duration => notes.push(format!(
            "Estimated buffer time ≈ {:.3} s < duration {:.3} s → streaming required.",
            t, duration
        )),
        Some(t) => notes.push(format!(
            "Estimated buffer time ≈ {:.3} s ≥ duration; the capture fits in the buffer.",
            t
        )),
    }

    if report.total_bytes > LARGE_EXPORT_BYTES {
        notes.push(format!(
            "Total size ≈ {:.1} MB → exports may be large and slow.",
            report.total_bytes / 1e6
        ));
    }

    if f < GUARD_MIN_SAMPLE_FACTOR {
        if input.guard_override {
            notes.push(format!(
                "f = {} is below the guard minimum of {}; allowed by override.",
                f, GUARD_MIN_SAMPLE_FACTOR
            ));
        } else {
            notes.push(format!(
                "f = {} is below the guard minimum of {}; arming will be rejected without an override.",
                f, GUARD_MIN_SAMPLE_FACTOR
            ));
        }
    }

    if let (Some(fits), Some(comfortable)) = (
        min_sample_factor(input.bytes_per_sample, input.baud_rate, 1.0),
        min_sample_factor(input.bytes_per_sample, input.baud_rate, AMBER_UTILIZATION),
    ) {
        notes.push(format!(
            "At {} baud with {} B per sample: f ≥ {} fits the link, f ≥ {} keeps it at or below {:.0}%.",
            input.baud_rate,
            input.bytes_per_sample,
            fits,
            comfortable,
            AMBER_UTILIZATION * 100.0
        ));
    }

    notes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ByteWidth, ScaledVariable, VariableHandle};
    use std::sync::Arc;

    fn request(widths: &[ByteWidth], factor: u32, baud: u32, duration: f64) -> CaptureRequest {
        let vars = widths
            .iter()
            .enumerate()
            .map(|(i, w)| Arc::new(ScaledVariable::new(format!("v{}", i), VariableHandle(i as u32), *w)))
            .collect();
        CaptureRequest::new(vars, factor, duration, baud)
    }

    #[test]
    fn test_two_current_channels_at_1khz() {
        let req = request(&[ByteWidth::Two, ByteWidth::Two], 20, 115_200, 2.0);
        let report = estimate(&FeasibilityInput::from_request(&req, None));

        assert_eq!(report.sample_rate_hz, 1000.0);
        assert_eq!(report.bytes_per_sample, 4);
        assert_eq!(report.bytes_per_second, 4000.0);
        assert_eq!(report.uart_capacity_bytes_per_second, 11_520.0);
        assert!((report.utilization - 0.3472).abs() < 1e-4);
        assert_eq!(report.risk, RiskLevel::Green);
        assert_eq!(report.total_bytes, 8000.0);
        assert_eq!(report.buffer_time_seconds, None);
        assert!(report.invalid_input.is_none());
        assert_eq!(req.expected_samples(), 2000);
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(RiskLevel::from_utilization(0.0), RiskLevel::Green);
        assert_eq!(RiskLevel::from_utilization(0.399), RiskLevel::Green);
        assert_eq!(RiskLevel::from_utilization(0.4), RiskLevel::Amber);
        assert_eq!(RiskLevel::from_utilization(0.7), RiskLevel::Amber);
        assert_eq!(RiskLevel::from_utilization(0.7001), RiskLevel::Red);
        assert_eq!(RiskLevel::from_utilization(f64::NAN), RiskLevel::Red);
        assert_eq!(RiskLevel::from_utilization(f64::INFINITY), RiskLevel::Red);
    }

    #[test]
    fn test_overload_at_full_rate() {
        // 6 channels × 2 B at 20 kHz is 240 kB/s
        let input = FeasibilityInput::new(12, 1, 115_200, 1.0).with_guard_override(true);
        let report = estimate(&input);
        assert_eq!(report.risk, RiskLevel::Red);
        assert!(report.is_overloaded());
        assert!(report.notes.iter().any(|n| n.contains("allowed by override")));
    }

    #[test]
    fn test_degenerate_inputs_are_flagged() {
        let report = estimate(&FeasibilityInput::new(4, 0, 115_200, 1.0));
        assert_eq!(report.invalid_input, Some(InvalidInput::ZeroSampleFactor));
        assert_eq!(report.risk, RiskLevel::Red);
        assert!(!report.is_overloaded());
        assert_eq!(report.sample_rate_hz, 0.0);

        let report = estimate(&FeasibilityInput::new(4, 20, 0, 1.0));
        assert_eq!(report.invalid_input, Some(InvalidInput::ZeroBaudRate));
        assert_eq!(report.risk, RiskLevel::Red);
        assert_eq!(report.utilization, 0.0);

        let report = estimate(&FeasibilityInput::new(0, 20, 115_200, 1.0));
        assert_eq!(report.invalid_input, Some(InvalidInput::NoChannels));
        assert_eq!(report.notes.len(), 1);
    }

    #[test]
    fn test_negative_duration_gives_zero_total() {
        let report = estimate(&FeasibilityInput::new(4, 20, 115_200, -3.0));
        assert_eq!(report.total_bytes, 0.0);
        let report = estimate(&FeasibilityInput::new(4, 20, 115_200, f64::NAN));
        assert_eq!(report.total_bytes, 0.0);
    }

    #[test]
    fn test_fractional_total_is_kept() {
        // 2 B at 20 kHz / 30 for 10 ms is 13⅓ B
        let report = estimate(&FeasibilityInput::new(2, 30, 115_200, 0.01));
        assert!((report.total_bytes - 40.0 / 3.0).abs() < 1e-9);
        assert!(report.total_bytes.fract() > 0.0);
    }

    #[test]
    fn test_buffer_time() {
        let input = FeasibilityInput::new(4, 20, 115_200, 2.0).with_buffer(Some(8000));
        let report = estimate(&input);
        assert_eq!(report.buffer_time_seconds, Some(2.0));
        assert_eq!(report.requires_streaming(2.0), Some(false));
        assert!(report.notes.iter().any(|n| n.contains("fits in the buffer")));

        let input = FeasibilityInput::new(4, 20, 115_200, 5.0).with_buffer(Some(8000));
        let report = estimate(&input);
        assert_eq!(report.requires_streaming(5.0), Some(true));
        assert!(report.notes.iter().any(|n| n.contains("streaming required")));
    }

    #[test]
    fn test_unknown_buffer_suggests_probe() {
        let report = estimate(&FeasibilityInput::new(4, 20, 115_200, 2.0));
        assert!(report.notes.iter().any(|n| n.contains("buffer probe")));
    }

    #[test]
    fn test_large_export_warning() {
        // 24 B at 20 kHz for 60 s is 28.8 MB
        let input = FeasibilityInput::new(24, 1, 921_600, 60.0).with_guard_override(true);
        let report = estimate(&input);
        assert_eq!(report.total_bytes, 28_800_000.0);
        assert!(report.notes.iter().any(|n| n.contains("28.8 MB")));
    }

    #[test]
    fn test_guard_note_without_override() {
        let report = estimate(&FeasibilityInput::new(2, 10, 921_600, 1.0));
        assert!(report.notes.iter().any(|n| n.contains("rejected without an override")));
    }

    #[test]
    fn test_min_sample_factor_rule_of_thumb() {
        // Five 2-byte channels
        assert_eq!(min_sample_factor(10, 115_200, 1.0), Some(18));
        assert_eq!(min_sample_factor(10, 230_400, 1.0), Some(9));
        assert_eq!(min_sample_factor(10, 921_600, 1.0), Some(3));
        assert_eq!(min_sample_factor(4, 115_200, 0.4), Some(18));
        assert_eq!(min_sample_factor(4, 0, 1.0), None);
        assert_eq!(min_sample_factor(0, 115_200, 1.0), Some(1));
    }

    #[test]
    fn test_risk_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&RiskLevel::Amber).unwrap(), "\"AMBER\"");
        let report = estimate(&FeasibilityInput::new(4, 20, 115_200, 2.0));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["risk"], "GREEN");
        assert!(json["buffer_time_seconds"].is_null());
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_risk_monotonic_in_utilization(a in 0.0f64..3.0, b in 0.0f64..3.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(RiskLevel::from_utilization(lo) <= RiskLevel::from_utilization(hi));
        }

        #[test]
        fn test_higher_factor_never_raises_risk(
            bytes in 2usize..=24,
            factor in 1u32..2000,
            baud in prop::sample::select(vec![9_600u32, 115_200, 230_400, 921_600]),
        ) {
            let slow = estimate(&FeasibilityInput::new(bytes, factor + 1, baud, 1.0));
            let fast = estimate(&FeasibilityInput::new(bytes, factor, baud, 1.0));
            prop_assert!(slow.utilization <= fast.utilization);
            prop_assert!(slow.risk <= fast.risk);
        }

        #[test]
        fn test_rate_matches_factor(factor in 1u32..=20_000) {
            let report = estimate(&FeasibilityInput::new(2, factor, 115_200, 1.0));
            prop_assert_eq!(report.sample_rate_hz, 20_000.0 / factor as f64);
        }

        #[test]
        fn test_min_factor_fits(bytes in 1usize..=24, baud in 1_200u32..2_000_000) {
            if let Some(f) = min_sample_factor(bytes, baud, 1.0) {
                let report = estimate(&FeasibilityInput::new(bytes, f, baud, 1.0));
                prop_assert!(report.utilization <= 1.0 + 1e-9);
            }
        }
    }
}
