//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use motorscope::config::SessionTimeouts;
use std::time::Duration;

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_millis(100)
}

/// Short session timeouts so failing sessions end quickly
pub fn fast_timeouts() -> SessionTimeouts {
    SessionTimeouts {
        arm_timeout_ms: 50,
        drain_grace_ms: 500,
        read_timeout_ms: 5,
    }
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
