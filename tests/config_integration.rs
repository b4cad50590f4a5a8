//! Integration tests for configuration files
//!
//! These tests validate config persistence and its use by the engine:
//! - Save and load round trips through a real file
//! - Partial files filled with defaults
//! - Building an engine from a loaded file

mod common;

use motorscope::config::{AppConfig, TransportKind};
use motorscope::registry::VariableDefinition;
use motorscope::types::ByteWidth;
use motorscope::{CaptureEngine, ScopeError};
use serial_test::serial;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

#[test]
fn test_save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = AppConfig::sample();
    config.link.baud_rate = 460_800;
    config.capture.sample_factor = 40;
    config.motor.speed_rpm = Some(1500.0);
    config.variables.push(
        VariableDefinition::new("app.vbus")
            .with_label("Vbus")
            .with_width(ByteWidth::Four)
            .with_scale(0.01)
            .with_unit("V"),
    );
    config.save_to(&path).unwrap();

    let loaded = AppConfig::load_from(&path).unwrap();
    assert_eq!(loaded, config);
    assert_eq!(loaded.find_variable("Vbus").unwrap().identifier, "app.vbus");
}

#[test]
fn test_partial_file_uses_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[link]
transport = "synthetic"

[capture]
duration_seconds = 0.5

[[variables]]
identifier = "motor.idq.q"
label = "Idq_q"
unit = "A"
scale_factor = 0.001
"#
    )
    .unwrap();

    let config = AppConfig::load_from(file.path()).unwrap();
    assert_eq!(config.link.transport, TransportKind::Synthetic);
    assert_eq!(config.link.baud_rate, 115_200);
    assert_eq!(config.capture.sample_factor, 20);
    assert_eq!(config.variables.len(), 1);
    assert_eq!(config.variables[0].width, ByteWidth::Two);
}

#[test]
fn test_invalid_file_is_config_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[link]\nbaud_rate = 0").unwrap();
    assert!(matches!(
        AppConfig::load_from(file.path()),
        Err(ScopeError::Config(_))
    ));

    let mut garbage = NamedTempFile::new().unwrap();
    writeln!(garbage, "this is = = not toml").unwrap();
    assert!(matches!(
        AppConfig::load_from(garbage.path()),
        Err(ScopeError::Config(_))
    ));
}

#[test]
#[serial]
fn test_engine_from_saved_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("motorscope.toml");
    let mut config = common::mock_helpers::create_test_config(921_600);
    config.variables.push(VariableDefinition::new("app.vbus").with_unit("V"));
    config.save_to(&path).unwrap();

    let engine = CaptureEngine::from_config(&AppConfig::load_from(&path).unwrap()).unwrap();
    assert!(engine.registry().get("app.vbus").is_some());

    let handle = engine
        .start_capture(engine.build_request(&["Idq_q", "app.vbus"], 20, 0.05).unwrap())
        .unwrap();
    engine.wait(&handle).unwrap();
    let result = engine.get_result(&handle).unwrap();
    assert_eq!(result.dataset.channels[1].unit, "V");
}
