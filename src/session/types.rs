//! Session data types
//!
//! - [`CaptureRequest`] - immutable description of one capture attempt
//! - [`SessionState`] - the acquisition state machine's states
//! - [`StopReason`] - why a session left Streaming or never got there
//! - [`SessionProgress`] - lock-free mirror of a session's state for pollers
//! - [`StopSignal`] - idempotent stop request shared with the session thread

use crate::error::{TransportError, ValidationError};
use crate::types::{
    effective_rate_hz, within_rate_guard, ScaledVariable, GUARD_MAX_RATE_HZ,
    GUARD_MIN_SAMPLE_FACTOR, MAX_CHANNELS,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Speed set-point written before the motor is enabled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedCommand {
    /// Requested mechanical speed
    pub rpm: f64,
    /// RPM represented by one count of the velocity reference register
    pub rpm_per_count: f64,
}

impl SpeedCommand {
    pub fn new(rpm: f64, rpm_per_count: f64) -> Self {
        Self { rpm, rpm_per_count }
    }

    /// Register value for this speed, `round(rpm / rpm_per_count)`
    pub fn counts(&self) -> Option<i32> {
        if !(self.rpm_per_count.is_finite() && self.rpm_per_count > 0.0 && self.rpm.is_finite()) {
            return None;
        }
        let counts = (self.rpm / self.rpm_per_count).round();
        if counts < i32::MIN as f64 || counts > i32::MAX as f64 {
            return None;
        }
        Some(counts as i32)
    }
}

/// Description of one capture attempt
///
/// Built fresh for each capture and never modified afterwards. Construction
/// does not validate; [`CaptureRequest::validate`] runs while arming so that
/// the feasibility estimator can still report on degenerate parameters.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    variables: Vec<Arc<ScaledVariable>>,
    sample_factor: u32,
    duration_seconds: f64,
    baud_rate: u32,
    guard_override: bool,
    speed_command: Option<SpeedCommand>,
}

impl CaptureRequest {
    /// Create a request with the rate guard enforced and no speed command
    pub fn new(
        variables: Vec<Arc<ScaledVariable>>,
        sample_factor: u32,
        duration_seconds: f64,
        baud_rate: u32,
    ) -> Self {
        Self {
            variables,
            sample_factor,
            duration_seconds,
            baud_rate,
            guard_override: false,
            speed_command: None,
        }
    }

    /// Allow sample factors below the guard minimum
    pub fn with_guard_override(mut self, enabled: bool) -> Self {
        self.guard_override = enabled;
        self
    }

    /// Write a speed set-point before enabling the motor
    pub fn with_speed_command(mut self, command: SpeedCommand) -> Self {
        self.speed_command = Some(command);
        self
    }

    pub fn variables(&self) -> &[Arc<ScaledVariable>] {
        &self.variables
    }

    pub fn sample_factor(&self) -> u32 {
        self.sample_factor
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn guard_override(&self) -> bool {
        self.guard_override
    }

    pub fn speed_command(&self) -> Option<SpeedCommand> {
        self.speed_command
    }

    /// Effective sample rate `20000 / f`
    pub fn sample_rate_hz(&self) -> f64 {
        effective_rate_hz(self.sample_factor)
    }

    /// Wall-clock streaming duration
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.duration_seconds).unwrap_or(Duration::ZERO)
    }

    /// Samples per channel the request should produce, `round(duration * Fs)`
    pub fn expected_samples(&self) -> usize {
        let n = (self.duration_seconds * self.sample_rate_hz()).round();
        if n.is_finite() && n > 0.0 {
            n as usize
        } else {
            0
        }
    }

    /// Check every arming invariant, reporting the first violation
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.variables.is_empty() {
            return Err(ValidationError::EmptyChannelList);
        }
        if self.variables.len() > MAX_CHANNELS {
            return Err(ValidationError::TooManyChannels {
                count: self.variables.len(),
                max: MAX_CHANNELS,
            });
        }
        if self.sample_factor == 0 {
            return Err(ValidationError::InvalidSampleFactor(self.sample_factor));
        }
        if !self.guard_override && !within_rate_guard(self.sample_factor) {
            return Err(ValidationError::GuardViolated {
                sample_factor: self.sample_factor,
                rate_hz: self.sample_rate_hz(),
                limit_hz: GUARD_MAX_RATE_HZ,
                min_factor: GUARD_MIN_SAMPLE_FACTOR,
            });
        }
        if !(self.duration_seconds.is_finite() && self.duration_seconds > 0.0) {
            return Err(ValidationError::InvalidDuration(self.duration_seconds));
        }
        if self.baud_rate == 0 {
            return Err(ValidationError::InvalidBaudRate);
        }
        if let Some(cmd) = self.speed_command {
            if cmd.counts().is_none() {
                return Err(ValidationError::InvalidSpeedCommand {
                    rpm: cmd.rpm,
                    rpm_per_count: cmd.rpm_per_count,
                });
            }
        }
        Ok(())
    }
}

/// State of the acquisition state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    /// No resources held
    #[default]
    Idle = 0,
    /// Validating, configuring the scope and enabling the motor
    Arming = 1,
    /// Collecting samples
    Streaming = 2,
    /// Motor disabled, draining samples in flight
    Stopping = 3,
    /// Finished and fully drained
    Completed = 4,
    /// Finished with an error; any samples collected are kept
    Failed = 5,
}

impl SessionState {
    /// Arming, Streaming or Stopping
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Arming | SessionState::Streaming | SessionState::Stopping
        )
    }

    /// Completed or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// Display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Arming => "Arming",
            SessionState::Streaming => "Streaming",
            SessionState::Stopping => "Stopping",
            SessionState::Completed => "Completed",
            SessionState::Failed => "Failed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Arming,
            2 => SessionState::Streaming,
            3 => SessionState::Stopping,
            4 => SessionState::Completed,
            5 => SessionState::Failed,
            _ => SessionState::Idle,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Why a session stopped
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// Requested duration elapsed
    DurationElapsed,
    /// Caller asked to stop early
    StopRequested,
    /// Device ended the stream before the duration elapsed
    DeviceEnded,
    /// Run request was not acknowledged
    ArmTimeout(Duration),
    /// Link failed while arming, streaming or draining
    TransportFailed(TransportError),
    /// End of stream not seen within the drain grace period
    DrainTimeout(Duration),
}

impl StopReason {
    /// Whether this reason ends the session in Failed
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StopReason::ArmTimeout(_) | StopReason::TransportFailed(_) | StopReason::DrainTimeout(_)
        )
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::DurationElapsed => write!(f, "duration elapsed"),
            StopReason::StopRequested => write!(f, "stop requested"),
            StopReason::DeviceEnded => write!(f, "device ended the stream"),
            StopReason::ArmTimeout(t) => write!(f, "run request not acknowledged within {:?}", t),
            StopReason::TransportFailed(e) => write!(f, "transport failed: {}", e),
            StopReason::DrainTimeout(t) => write!(f, "drain did not finish within {:?}", t),
        }
    }
}

/// What a session is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// User capture; drives the motor control registers
    Capture,
    /// Buffer size probe; leaves the motor alone
    Probe,
}

/// Snapshot returned by `poll_status`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub samples_collected: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct Timing {
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// Shared, read-mostly mirror of a session's progress
///
/// Only the thread driving the session writes to it; any number of pollers
/// may read.
#[derive(Debug, Default)]
pub struct SessionProgress {
    state: AtomicU8,
    samples: AtomicUsize,
    timing: Mutex<Timing>,
}

impl SessionProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn samples_collected(&self) -> usize {
        self.samples.load(Ordering::Acquire)
    }

    /// Time since streaming began, frozen once the session finishes
    pub fn elapsed(&self) -> Duration {
        let timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        match (timing.started, timing.finished) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            state: self.state(),
            samples_collected: self.samples_collected(),
            elapsed: self.elapsed(),
        }
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_samples(&self, count: usize) {
        self.samples.store(count, Ordering::Release);
    }

    pub(crate) fn mark_started(&self, at: Instant) {
        let mut timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        timing.started = Some(at);
        timing.finished = None;
    }

    pub(crate) fn mark_finished(&self, at: Instant) {
        let mut timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        if timing.finished.is_none() {
            timing.finished = Some(at);
        }
    }

    pub(crate) fn reset(&self) {
        self.set_state(SessionState::Idle);
        self.set_samples(0);
        *self.timing.lock().unwrap_or_else(PoisonError::into_inner) = Timing::default();
    }
}

/// Idempotent stop request
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to stop; repeated calls have no further effect
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ByteWidth, VariableHandle};

    fn vars(n: usize) -> Vec<Arc<ScaledVariable>> {
        (0..n)
            .map(|i| {
                Arc::new(ScaledVariable::new(
                    format!("v{}", i),
                    VariableHandle(i as u32),
                    ByteWidth::Two,
                ))
            })
            .collect()
    }

    #[test]
    fn test_valid_request() {
        let req = CaptureRequest::new(vars(2), 20, 2.0, 115_200);
        assert!(req.validate().is_ok());
        assert_eq!(req.sample_rate_hz(), 1000.0);
        assert_eq!(req.expected_samples(), 2000);
        assert_eq!(req.duration(), Duration::from_secs(2));
    }

    #[test]
    fn test_each_violation_is_distinct() {
        assert_eq!(
            CaptureRequest::new(vars(0), 20, 1.0, 115_200).validate(),
            Err(ValidationError::EmptyChannelList)
        );
        assert_eq!(
            CaptureRequest::new(vars(7), 20, 1.0, 115_200).validate(),
            Err(ValidationError::TooManyChannels { count: 7, max: 6 })
        );
        assert_eq!(
            CaptureRequest::new(vars(1), 0, 1.0, 115_200).validate(),
            Err(ValidationError::InvalidSampleFactor(0))
        );
        assert!(matches!(
            CaptureRequest::new(vars(1), 19, 1.0, 115_200).validate(),
            Err(ValidationError::GuardViolated { sample_factor: 19, .. })
        ));
        assert!(matches!(
            CaptureRequest::new(vars(1), 20, -1.0, 115_200).validate(),
            Err(ValidationError::InvalidDuration(_))
        ));
        assert!(matches!(
            CaptureRequest::new(vars(1), 20, f64::NAN, 115_200).validate(),
            Err(ValidationError::InvalidDuration(_))
        ));
        assert_eq!(
            CaptureRequest::new(vars(1), 20, 1.0, 0).validate(),
            Err(ValidationError::InvalidBaudRate)
        );
    }

    #[test]
    fn test_guard_override() {
        let req = CaptureRequest::new(vars(6), 1, 0.5, 921_600).with_guard_override(true);
        assert!(req.validate().is_ok());
        assert_eq!(req.sample_rate_hz(), 20_000.0);
        assert_eq!(req.expected_samples(), 10_000);
    }

    #[test]
    fn test_speed_command_counts() {
        assert_eq!(SpeedCommand::new(1500.0, 0.5).counts(), Some(3000));
        assert_eq!(SpeedCommand::new(1000.0, 0.3).counts(), Some(3333));
        assert_eq!(SpeedCommand::new(-10.0, 4.0).counts(), Some(-3));
        assert_eq!(SpeedCommand::new(100.0, 0.0).counts(), None);

        let req = CaptureRequest::new(vars(1), 20, 1.0, 115_200)
            .with_speed_command(SpeedCommand::new(100.0, 0.0));
        assert!(matches!(
            req.validate(),
            Err(ValidationError::InvalidSpeedCommand { .. })
        ));
    }

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Arming.is_active());
        assert!(SessionState::Stopping.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Streaming.is_terminal());
        assert_eq!(SessionState::Completed.to_string(), "Completed");
    }

    #[test]
    fn test_progress_roundtrip() {
        let progress = SessionProgress::new();
        assert_eq!(progress.state(), SessionState::Idle);
        progress.set_state(SessionState::Streaming);
        progress.set_samples(42);
        let start = Instant::now();
        progress.mark_started(start);
        progress.mark_finished(start + Duration::from_millis(250));

        let status = progress.snapshot();
        assert_eq!(status.state, SessionState::Streaming);
        assert_eq!(status.samples_collected, 42);
        assert_eq!(status.elapsed, Duration::from_millis(250));

        progress.reset();
        assert_eq!(progress.snapshot().elapsed, Duration::ZERO);
        assert_eq!(progress.samples_collected(), 0);
    }

    #[test]
    fn test_stop_signal_idempotent() {
        let stop = StopSignal::new();
        let clone = stop.clone();
        assert!(!stop.is_requested());
        clone.request();
        clone.request();
        assert!(stop.is_requested());
        stop.clear();
        assert!(!clone.is_requested());
    }

    #[test]
    fn test_stop_reason_failure() {
        assert!(!StopReason::DurationElapsed.is_failure());
        assert!(!StopReason::StopRequested.is_failure());
        assert!(StopReason::DrainTimeout(Duration::from_secs(1)).is_failure());
        assert!(StopReason::TransportFailed(TransportError::Overrun).is_failure());
    }
}
