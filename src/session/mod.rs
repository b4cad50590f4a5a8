//! Capture sessions
//!
//! This module contains the acquisition state machine and the buffer size
//! probe built on top of it.
//!
//! # Features
//!
//! - One [`AcquisitionSession`] per capture attempt, driven through
//!   `Idle → Arming → Streaming → Stopping → Completed | Failed`
//! - Lock-free progress mirror ([`SessionProgress`]) for pollers on other threads
//! - Idempotent early stop ([`StopSignal`])
//! - Device buffer size estimation ([`BufferProbe`])

pub mod acquisition;
pub mod buffer_probe;
pub mod types;

pub use acquisition::{AcquisitionSession, MotorControls};
pub use buffer_probe::{BufferEstimate, BufferProbe, EstimateMethod, PROBE_UNCERTAINTY};
pub use types::{
    CaptureRequest, SessionKind, SessionProgress, SessionState, SessionStatus, SpeedCommand,
    StopReason, StopSignal,
};
