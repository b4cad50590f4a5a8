//! Core data types for motorscope
//!
//! This module contains the fundamental data structures shared by the
//! planning, acquisition and reconstruction stages.
//!
//! # Main Types
//!
//! - [`ByteWidth`] - Width of a sampled variable on the wire (2 or 4 bytes)
//! - [`VariableHandle`] - Opaque device address of a variable
//! - [`ScaledVariable`] - A variable that can be captured, with its scale factor and unit
//! - [`RawSample`] - One raw value reported by the device for one channel
//!
//! # Sample Rate
//!
//! The firmware samples on a fixed 20 kHz control tick. A capture picks an
//! integer down-sampling factor `f`, giving an effective rate of `20000 / f` Hz.
//! See [`effective_rate_hz`] and [`sample_factor_for_hz`].

use serde::{Deserialize, Serialize};

/// Control loop tick rate of the firmware in Hz
pub const CONTROL_TICK_HZ: u32 = 20_000;

/// Maximum number of channels the device scope can sample at once
pub const MAX_CHANNELS: usize = 6;

/// Highest sample rate allowed without an explicit override
pub const GUARD_MAX_RATE_HZ: f64 = 1_000.0;

/// Smallest sample factor allowed without an explicit override
pub const GUARD_MIN_SAMPLE_FACTOR: u32 = 20;

/// Width of a sampled variable on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ByteWidth {
    /// 16-bit signed value
    Two,
    /// 32-bit signed value
    Four,
}

impl ByteWidth {
    /// Number of bytes
    pub fn bytes(self) -> usize {
        match self {
            ByteWidth::Two => 2,
            ByteWidth::Four => 4,
        }
    }

    /// Decode a little-endian signed value
    pub fn decode(self, bytes: &[u8]) -> Option<i32> {
        match self {
            ByteWidth::Two => bytes
                .get(..2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as i32),
            ByteWidth::Four => bytes
                .get(..4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        }
    }

    /// Encode a value as little-endian bytes, saturating to the width
    pub fn encode(self, value: i32) -> Vec<u8> {
        match self {
            ByteWidth::Two => (self.saturate(value as i64) as i16).to_le_bytes().to_vec(),
            ByteWidth::Four => value.to_le_bytes().to_vec(),
        }
    }

    /// Clamp a value into the representable range of this width
    pub fn saturate(self, value: i64) -> i32 {
        match self {
            ByteWidth::Two => value.clamp(i16::MIN as i64, i16::MAX as i64) as i32,
            ByteWidth::Four => value.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        }
    }
}

impl TryFrom<u8> for ByteWidth {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            2 => Ok(ByteWidth::Two),
            4 => Ok(ByteWidth::Four),
            other => Err(format!("unsupported byte width {} (expected 2 or 4)", other)),
        }
    }
}

impl From<ByteWidth> for u8 {
    fn from(width: ByteWidth) -> Self {
        width.bytes() as u8
    }
}

impl std::fmt::Display for ByteWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}B", self.bytes())
    }
}

/// Opaque device address of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VariableHandle(pub u32);

impl std::fmt::Display for VariableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// A capturable variable with its raw-to-engineering conversion
///
/// Owned by the [`VariableRegistry`](crate::registry::VariableRegistry) and
/// shared by reference (`Arc`) with sessions and datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaledVariable {
    /// Firmware identifier, e.g. `motor.idq.q`
    pub identifier: String,
    /// Short display name, e.g. `Idq_q`
    pub label: String,
    /// Device address
    pub handle: VariableHandle,
    /// Width on the wire
    pub byte_width: ByteWidth,
    /// Multiplier applied to raw counts
    pub scale_factor: f64,
    /// Engineering unit of the scaled value
    pub unit: String,
}

impl ScaledVariable {
    /// Create a variable with unit scale and no unit label
    pub fn new(identifier: impl Into<String>, handle: VariableHandle, byte_width: ByteWidth) -> Self {
        let identifier = identifier.into();
        Self {
            label: identifier.clone(),
            identifier,
            handle,
            byte_width,
            scale_factor: 1.0,
            unit: String::new(),
        }
    }

    /// Set the display label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the raw-to-engineering multiplier
    pub fn with_scale(mut self, scale_factor: f64) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    /// Set the unit label
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Check whether an identifier or label refers to this variable
    pub fn matches(&self, name: &str) -> bool {
        self.identifier == name || self.label == name
    }
}

/// One raw value reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSample {
    /// Position of the variable in the capture request
    pub channel_index: usize,
    /// Device tick (or timestamp) the value was sampled at
    pub device_tick: u64,
    /// Signed raw value, sign-extended from its byte width
    pub raw_value: i32,
}

impl RawSample {
    pub fn new(channel_index: usize, device_tick: u64, raw_value: i32) -> Self {
        Self {
            channel_index,
            device_tick,
            raw_value,
        }
    }
}

/// Effective sample rate for a sample factor
///
/// Returns 0.0 for a factor of 0, which is never a valid request.
pub fn effective_rate_hz(sample_factor: u32) -> f64 {
    if sample_factor == 0 {
        0.0
    } else {
        CONTROL_TICK_HZ as f64 / sample_factor as f64
    }
}

/// Sample period in milliseconds for a sample factor
pub fn sample_period_ms(sample_factor: u32) -> f64 {
    sample_factor as f64 * 1000.0 / CONTROL_TICK_HZ as f64
}

/// Closest sample factor for a desired rate
///
/// The rate is clamped to `1..=20000` Hz and the factor is never below 1.
pub fn sample_factor_for_hz(rate_hz: f64) -> u32 {
    let rate = if rate_hz.is_finite() {
        rate_hz.clamp(1.0, CONTROL_TICK_HZ as f64)
    } else {
        1.0
    };
    ((CONTROL_TICK_HZ as f64 / rate).round() as u32).max(1)
}

/// Whether a sample factor is allowed without a guard override
pub fn within_rate_guard(sample_factor: u32) -> bool {
    sample_factor >= GUARD_MIN_SAMPLE_FACTOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_rate() {
        assert_eq!(effective_rate_hz(1), 20_000.0);
        assert_eq!(effective_rate_hz(20), 1_000.0);
        assert_eq!(effective_rate_hz(200), 100.0);
        assert_eq!(effective_rate_hz(0), 0.0);
    }

    #[test]
    fn test_sample_period() {
        assert!((sample_period_ms(20) - 1.0).abs() < 1e-12);
        assert!((sample_period_ms(1) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_sample_factor_for_hz() {
        assert_eq!(sample_factor_for_hz(1000.0), 20);
        assert_eq!(sample_factor_for_hz(20_000.0), 1);
        assert_eq!(sample_factor_for_hz(50_000.0), 1);
        assert_eq!(sample_factor_for_hz(0.0), 20_000);
        assert_eq!(sample_factor_for_hz(333.0), 60);
        assert_eq!(sample_factor_for_hz(f64::NAN), 20_000);
    }

    #[test]
    fn test_guard_constants() {
        assert_eq!(GUARD_MIN_SAMPLE_FACTOR, 20);
        assert!(within_rate_guard(20));
        assert!(!within_rate_guard(19));
    }

    #[test]
    fn test_byte_width_codec() {
        assert_eq!(ByteWidth::Two.decode(&[0xFF, 0xFF]), Some(-1));
        assert_eq!(ByteWidth::Four.decode(&[0x01, 0x00, 0x00, 0x80]), Some(i32::MIN + 1));
        assert_eq!(ByteWidth::Four.decode(&[0x01, 0x00]), None);
        assert_eq!(ByteWidth::Two.encode(40_000), vec![0xFF, 0x7F]);
        assert_eq!(ByteWidth::Two.saturate(-40_000), i16::MIN as i32);
    }

    #[test]
    fn test_byte_width_serde() {
        let width: ByteWidth = serde_json::from_str("4").unwrap();
        assert_eq!(width, ByteWidth::Four);
        assert!(serde_json::from_str::<ByteWidth>("3").is_err());
        assert_eq!(serde_json::to_string(&ByteWidth::Two).unwrap(), "2");
    }

    #[test]
    fn test_scaled_variable_builder() {
        let var = ScaledVariable::new("motor.idq.q", VariableHandle(0x2000_0010), ByteWidth::Two)
            .with_label("Idq_q")
            .with_scale(0.001)
            .with_unit("A");
        assert!(var.matches("Idq_q"));
        assert!(var.matches("motor.idq.q"));
        assert!(!var.matches("motor.idq.d"));
        assert_eq!(var.handle.to_string(), "0x20000010");
    }
}
