//! Session and motor settings
//!
//! Settings that tune how a capture session talks to the target, kept apart
//! from the link and capture defaults in [`AppConfig`](super::AppConfig).
//!
//! # Main Types
//!
//! - [`SessionTimeouts`] - Arm acknowledgement, drain grace and read polling
//! - [`ProbeSettings`] - Length of the buffer probe capture
//! - [`MotorSettings`] - Which registers enable, stop and steer the motor

use crate::registry::{RUN_REQUEST, STOP_REQUEST, VELOCITY_REFERENCE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts used by the acquisition state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimeouts {
    /// How long the target may take to acknowledge a register write while arming
    pub arm_timeout_ms: u64,

    /// How long Stopping waits for the end of the stream
    pub drain_grace_ms: u64,

    /// Upper bound of a single read; bounds stop request latency
    pub read_timeout_ms: u64,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            arm_timeout_ms: 500,
            drain_grace_ms: 1000,
            read_timeout_ms: 20,
        }
    }
}

impl SessionTimeouts {
    pub fn arm_timeout(&self) -> Duration {
        Duration::from_millis(self.arm_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Never zero, so a read always yields
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

/// Buffer probe settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Length of the probe capture in milliseconds
    pub duration_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self { duration_ms: 500 }
    }
}

impl ProbeSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Motor control registers and speed command defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorSettings {
    /// Register written 1 to enable the motor, 0 to release it
    pub run_request: String,

    /// Register written 1 to stop the motor
    pub stop_request: String,

    /// Speed set-point register; speed commands are skipped without it
    pub velocity_reference: Option<String>,

    /// Flag cleared by `prepare_target` so the on-board UI does not fight the host
    pub hardware_ui: Option<String>,

    /// RPM represented by one count of the velocity reference
    pub rpm_per_count: f64,

    /// Speed written before each capture, if any
    pub speed_rpm: Option<f64>,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            run_request: RUN_REQUEST.to_string(),
            stop_request: STOP_REQUEST.to_string(),
            velocity_reference: Some(VELOCITY_REFERENCE.to_string()),
            hardware_ui: None,
            rpm_per_count: 1.0,
            speed_rpm: None,
        }
    }
}
