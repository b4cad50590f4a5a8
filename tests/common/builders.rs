//! Test data builders for creating test objects

use motorscope::types::{ByteWidth, RawSample, ScaledVariable, VariableHandle};
use std::sync::Arc;

/// Builder for creating test variables
pub struct VariableBuilder {
    identifier: String,
    address: u32,
    width: ByteWidth,
    scale_factor: f64,
    unit: String,
}

impl VariableBuilder {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            address: 0x2000_0000,
            width: ByteWidth::Two,
            scale_factor: 1.0,
            unit: String::new(),
        }
    }

    pub fn address(mut self, address: u32) -> Self {
        self.address = address;
        self
    }

    pub fn width(mut self, width: ByteWidth) -> Self {
        self.width = width;
        self
    }

    pub fn scale(mut self, scale_factor: f64, unit: &str) -> Self {
        self.scale_factor = scale_factor;
        self.unit = unit.to_string();
        self
    }

    pub fn build(self) -> Arc<ScaledVariable> {
        Arc::new(
            ScaledVariable::new(self.identifier, VariableHandle(self.address), self.width)
                .with_scale(self.scale_factor)
                .with_unit(self.unit),
        )
    }
}

/// Interleaved rows as a device would send them
///
/// Row `k` carries device tick `k * sample_factor` and the value `value(channel, k)`.
pub fn interleaved_rows(
    rows: usize,
    channels: usize,
    sample_factor: u32,
    value: impl Fn(usize, usize) -> i32,
) -> Vec<RawSample> {
    (0..rows)
        .flat_map(|k| {
            let value = &value;
            (0..channels).map(move |c| RawSample::new(c, k as u64 * sample_factor as u64, value(c, k)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_builder() {
        let var = VariableBuilder::new("motor.idq.q")
            .address(0x2000_1000)
            .width(ByteWidth::Four)
            .scale(0.001, "A")
            .build();

        assert_eq!(var.identifier, "motor.idq.q");
        assert_eq!(var.handle, VariableHandle(0x2000_1000));
        assert_eq!(var.byte_width, ByteWidth::Four);
        assert_eq!(var.unit, "A");
    }

    #[test]
    fn test_interleaved_rows() {
        let rows = interleaved_rows(3, 2, 20, |c, k| (c * 100 + k) as i32);
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[3], RawSample::new(1, 20, 101));
    }
}
