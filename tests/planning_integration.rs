//! Integration tests for capture planning and post-processing
//!
//! These tests run the pure pipeline without a link:
//! - Feasibility of requests built from the registry
//! - Reconstruction of device data onto a uniform time axis
//! - Scaling into an engineering-unit dataset

mod common;

use chrono::Utc;
use common::assert_float_eq;
use common::builders::{interleaved_rows, VariableBuilder};
use motorscope::analysis::{estimate, reconstruct_request, scale_series, FeasibilityInput};
use motorscope::registry::{default_definitions, SymbolMap, VariableRegistry};
use motorscope::session::CaptureRequest;
use motorscope::types::{sample_factor_for_hz, ByteWidth, RawSample};
use motorscope::{RiskLevel, ValidationError};

fn registry() -> VariableRegistry {
    let definitions: Vec<_> = default_definitions()
        .into_iter()
        .enumerate()
        .map(|(i, def)| def.with_address(0x2000_0000 + i as u32 * 4))
        .collect();
    VariableRegistry::from_definitions(&definitions, &SymbolMap::new()).unwrap()
}

#[test]
fn test_two_current_channels_at_115200() {
    let vars = registry().select(&["idqCmd_q", "Idq_q"]).unwrap();
    let request = CaptureRequest::new(vars, 20, 2.0, 115_200);
    assert!(request.validate().is_ok());
    assert_eq!(request.expected_samples(), 2000);

    let report = estimate(&FeasibilityInput::from_request(&request, None));
    assert_eq!(report.sample_rate_hz, 1000.0);
    assert_eq!(report.bytes_per_second, 4000.0);
    assert_eq!(report.uart_capacity_bytes_per_second, 11_520.0);
    assert_float_eq(report.utilization, 0.347, 1e-3);
    assert_eq!(report.risk, RiskLevel::Green);
    assert_eq!(report.total_bytes, 8000.0);
    assert!(report.notes.iter().any(|n| n.contains("Buffer size unknown")));
}

#[test]
fn test_rate_change_moves_risk() {
    let vars = registry().select(&["idqCmd_q", "Idq_q", "Idq_d"]).unwrap();
    let risks: Vec<_> = [40, 20, 10, 5]
        .iter()
        .map(|&f| {
            let request = CaptureRequest::new(vars.clone(), f, 1.0, 115_200).with_guard_override(true);
            estimate(&FeasibilityInput::from_request(&request, None)).risk
        })
        .collect();
    assert_eq!(
        risks,
        vec![RiskLevel::Green, RiskLevel::Amber, RiskLevel::Red, RiskLevel::Red]
    );
}

#[test]
fn test_guard_needs_override() {
    let vars = registry().select(&["Idq_q"]).unwrap();
    let request = CaptureRequest::new(vars, sample_factor_for_hz(20_000.0), 0.1, 921_600);
    assert_eq!(request.sample_factor(), 1);
    assert!(matches!(
        request.validate(),
        Err(ValidationError::GuardViolated { .. })
    ));
    assert!(request.with_guard_override(true).validate().is_ok());
}

#[test]
fn test_buffer_estimate_changes_advice() {
    let input = FeasibilityInput::new(4, 20, 115_200, 2.0);
    let small = estimate(&input.with_buffer(Some(2000)));
    assert_eq!(small.buffer_time_seconds, Some(0.5));
    assert_eq!(small.requires_streaming(2.0), Some(true));

    let large = estimate(&input.with_buffer(Some(64 * 1024)));
    assert_eq!(large.requires_streaming(2.0), Some(false));
}

#[test]
fn test_short_delivery_is_not_padded() {
    let vars = registry().select(&["idqCmd_q", "Idq_q"]).unwrap();
    let request = CaptureRequest::new(vars, 20, 2.0, 115_200);

    // 1800 complete rows with irregular device ticks
    let raw: Vec<RawSample> = interleaved_rows(1800, 2, 20, |c, k| (c * 1000 + k) as i32)
        .into_iter()
        .enumerate()
        .map(|(i, s)| RawSample::new(s.channel_index, s.device_tick + (i as u64 % 7), s.raw_value))
        .collect();

    let series = reconstruct_request(&raw, &request);
    assert_eq!(series.len(), 1800);
    assert_eq!(series.channels[0].len(), 1800);
    assert_eq!(series.channels[1][1799], 1000 + 1799);
    let shortfall = series.under_delivery.unwrap();
    assert_eq!(shortfall.expected, 2000);
    assert_eq!(shortfall.missing, 200);
    assert_eq!(series.timestamps[1799], 1799.0 / 1000.0);
    assert!(series.timestamps.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_excess_rows_are_trimmed() {
    let vars = vec![VariableBuilder::new("a").build()];
    let request = CaptureRequest::new(vars, 20, 0.1, 115_200);
    let raw = interleaved_rows(150, 1, 20, |_, k| k as i32);

    let series = reconstruct_request(&raw, &request);
    assert_eq!(series.len(), 100);
    assert_eq!(series.longest_channel, 150);
    assert!(series.under_delivery.is_none());
}

#[test]
fn test_uneven_channels_use_shortest() {
    let vars = registry().select(&["idqCmd_q", "Idq_q"]).unwrap();
    let request = CaptureRequest::new(vars, 20, 1.0, 115_200);
    let mut raw = interleaved_rows(500, 2, 20, |_, k| k as i32);
    raw.push(RawSample::new(0, 500 * 20, 500));

    let series = reconstruct_request(&raw, &request);
    assert_eq!(series.len(), 500);
    assert_eq!(series.longest_channel, 501);
}

#[test]
fn test_end_to_end_scaling() {
    let vars = vec![
        VariableBuilder::new("motor.idq.q").scale(0.001, "A").build(),
        VariableBuilder::new("motor.omegaElectrical")
            .width(ByteWidth::Four)
            .scale(0.1, "RPM")
            .build(),
    ];
    let request = CaptureRequest::new(vars.clone(), 40, 0.05, 921_600);
    let raw = interleaved_rows(25, 2, 40, |c, k| if c == 0 { 1500 } else { k as i32 * 10 });

    let series = reconstruct_request(&raw, &request);
    let captured_at = Utc::now();
    let dataset = scale_series(&series, request.variables(), captured_at);

    assert_eq!(dataset.captured_at, captured_at);
    assert_eq!(dataset.sample_rate_hz, 500.0);
    assert_eq!(dataset.len(), 25);
    assert_float_eq(dataset.span_seconds(), 24.0 / 500.0, 1e-12);

    let current = dataset.channel("motor.idq.q").unwrap();
    assert!(current.values.iter().all(|&v| (v - 1.5).abs() < 1e-12));
    let speed = dataset.channel("motor.omegaElectrical").unwrap();
    assert_eq!(speed.unit, "RPM");
    assert_float_eq(speed.values[24], 24.0, 1e-9);

    let json = serde_json::to_string(&dataset).unwrap();
    assert!(json.contains("\"unit\":\"RPM\""));
}
