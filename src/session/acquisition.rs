//! Acquisition session state machine
//!
//! An [`AcquisitionSession`] drives one capture through
//! `Idle → Arming → Streaming → Stopping → Completed | Failed`:
//!
//! - **Arming** validates the request, configures the scope and, for a user
//!   capture, enables the motor. A missing acknowledgement ends in Failed.
//! - **Streaming** collects raw samples until the duration elapses, a stop is
//!   requested or the link fails.
//! - **Stopping** writes the motor-disable registers, then drains samples in
//!   flight until the device reports end of stream or the grace period ends.
//!
//! Whatever happens after Arming began, the motor-disable write is attempted.
//! A terminal session keeps its raw buffer and stop reason until it is
//! explicitly [discarded](AcquisitionSession::discard).
//!
//! The session itself does no logging and no retries; it is driven by the
//! capture worker, which owns the thread and reports progress.

use super::types::{
    CaptureRequest, SessionKind, SessionProgress, SessionState, SpeedCommand, StopReason,
    StopSignal,
};
use crate::backend::transport_trait::{ReadOutcome, ScopeTransport};
use crate::config::SessionTimeouts;
use crate::error::{Result, ScopeError, TransportError};
use crate::registry::VariableRegistry;
use crate::types::{RawSample, ScaledVariable};
use std::sync::Arc;
use std::time::Instant;

/// Registers the session writes to start and stop the motor
#[derive(Debug, Clone)]
pub struct MotorControls {
    pub run_request: Arc<ScaledVariable>,
    pub stop_request: Arc<ScaledVariable>,
    pub velocity_reference: Option<Arc<ScaledVariable>>,
}

impl MotorControls {
    /// Look the control registers up by identifier or label
    pub fn resolve(
        registry: &VariableRegistry,
        run_request: &str,
        stop_request: &str,
        velocity_reference: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            run_request: registry.require(run_request)?,
            stop_request: registry.require(stop_request)?,
            velocity_reference: velocity_reference
                .map(|name| registry.require(name))
                .transpose()?,
        })
    }
}

/// One capture attempt and its outcome
pub struct AcquisitionSession {
    kind: SessionKind,
    state: SessionState,
    request: Option<CaptureRequest>,
    raw: Vec<RawSample>,
    stop_reason: Option<StopReason>,
    started_at: Option<Instant>,
    controls: Option<MotorControls>,
    timeouts: SessionTimeouts,
    progress: Arc<SessionProgress>,
    stop: StopSignal,
    end_seen: bool,
}

impl AcquisitionSession {
    /// A user capture that drives the motor control registers
    pub fn capture(controls: MotorControls, timeouts: SessionTimeouts) -> Self {
        Self::new(SessionKind::Capture, Some(controls), timeouts)
    }

    /// A buffer probe capture that never touches the motor
    pub fn probe(timeouts: SessionTimeouts) -> Self {
        Self::new(SessionKind::Probe, None, timeouts)
    }

    fn new(kind: SessionKind, controls: Option<MotorControls>, timeouts: SessionTimeouts) -> Self {
        Self {
            kind,
            state: SessionState::Idle,
            request: None,
            raw: Vec::new(),
            stop_reason: None,
            started_at: None,
            controls,
            timeouts,
            progress: Arc::new(SessionProgress::new()),
            stop: StopSignal::new(),
            end_seen: false,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Request of the current attempt; `None` while Idle
    pub fn request(&self) -> Option<&CaptureRequest> {
        self.request.as_ref()
    }

    /// Raw samples in arrival order
    pub fn raw_samples(&self) -> &[RawSample] {
        &self.raw
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    /// Complete rows collected so far
    pub fn samples_collected(&self) -> usize {
        let channels = self.request.as_ref().map_or(0, |r| r.variables().len());
        if channels == 0 {
            0
        } else {
            self.raw.len() / channels
        }
    }

    /// Shared progress mirror for pollers
    pub fn progress(&self) -> Arc<SessionProgress> {
        Arc::clone(&self.progress)
    }

    /// Handle for requesting an early stop
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Arm, stream and drain in one call
    pub fn run(&mut self, request: CaptureRequest, transport: &mut dyn ScopeTransport) -> Result<()> {
        self.arm(request, transport)?;
        self.stream(transport)?;
        self.drain(transport)
    }

    /// Validate the request, configure the scope and enable the motor
    ///
    /// A validation failure leaves the session Idle. Any later failure leaves
    /// it Failed; a missing acknowledgement is reported as
    /// [`ScopeError::ArmTimeout`].
    pub fn arm(&mut self, request: CaptureRequest, transport: &mut dyn ScopeTransport) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(ScopeError::SessionConflict {
                state: self.state.display_name(),
            });
        }
        request.validate()?;

        self.set_state(SessionState::Arming);
        let channels = request.variables().to_vec();
        let sample_factor = request.sample_factor();
        let speed = request.speed_command();
        self.request = Some(request);

        if let Err(e) = transport.configure(&channels, sample_factor) {
            return Err(self.arm_failed(e, transport));
        }
        if let Err(e) = self.enable_motor(speed, transport) {
            return Err(self.arm_failed(e, transport));
        }

        let now = Instant::now();
        self.started_at = Some(now);
        self.progress.mark_started(now);
        self.set_state(SessionState::Streaming);
        Ok(())
    }

    /// Collect samples until the duration elapses or a stop is requested
    ///
    /// Ends in Stopping with the motor disabled, or in Failed when the link
    /// fails.
    pub fn stream(&mut self, transport: &mut dyn ScopeTransport) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Err(ScopeError::SessionConflict {
                state: self.state.display_name(),
            });
        }
        let duration = self.request.as_ref().map(|r| r.duration()).unwrap_or_default();
        let started = self.started_at.unwrap_or_else(Instant::now);
        let read_timeout = self.timeouts.read_timeout();

        let reason = loop {
            if self.stop.is_requested() {
                break StopReason::StopRequested;
            }
            let elapsed = started.elapsed();
            if elapsed >= duration {
                break StopReason::DurationElapsed;
            }

            match transport.read_samples(read_timeout.min(duration - elapsed)) {
                Ok(ReadOutcome::Samples(batch)) => self.push_samples(batch),
                Ok(ReadOutcome::EndOfStream) => {
                    self.end_seen = true;
                    break StopReason::DeviceEnded;
                }
                Err(e) => return Err(self.fail(e, transport)),
            }
        };

        self.stop_reason = Some(reason);
        self.set_state(SessionState::Stopping);
        if let Err(e) = self.disable_motor(transport) {
            return Err(self.fail(e, transport));
        }
        if !self.end_seen {
            if let Err(e) = transport.finish_stream() {
                return Err(self.fail(e, transport));
            }
        }
        Ok(())
    }

    /// Drain samples in flight until end of stream or the grace period ends
    pub fn drain(&mut self, transport: &mut dyn ScopeTransport) -> Result<()> {
        if self.state != SessionState::Stopping {
            return Err(ScopeError::SessionConflict {
                state: self.state.display_name(),
            });
        }
        let grace = self.timeouts.drain_grace();
        let read_timeout = self.timeouts.read_timeout();
        let deadline = Instant::now() + grace;

        while !self.end_seen {
            let now = Instant::now();
            if now >= deadline {
                self.finish(SessionState::Failed, StopReason::DrainTimeout(grace));
                return Err(ScopeError::Transport(TransportError::Timeout(grace)));
            }
            match transport.read_samples(read_timeout.min(deadline - now)) {
                Ok(ReadOutcome::Samples(batch)) => self.push_samples(batch),
                Ok(ReadOutcome::EndOfStream) => self.end_seen = true,
                Err(e) => {
                    self.finish(SessionState::Failed, StopReason::TransportFailed(e.clone()));
                    return Err(ScopeError::Transport(e));
                }
            }
        }

        let reason = self
            .stop_reason
            .take()
            .unwrap_or(StopReason::DurationElapsed);
        self.finish(SessionState::Completed, reason);
        Ok(())
    }

    /// Return a terminal session to Idle, dropping its data
    pub fn discard(&mut self) -> Result<()> {
        if self.state.is_active() {
            return Err(ScopeError::SessionConflict {
                state: self.state.display_name(),
            });
        }
        self.state = SessionState::Idle;
        self.request = None;
        self.raw.clear();
        self.stop_reason = None;
        self.started_at = None;
        self.end_seen = false;
        self.stop.clear();
        self.progress.reset();
        Ok(())
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.progress.set_state(state);
    }

    fn finish(&mut self, state: SessionState, reason: StopReason) {
        self.stop_reason = Some(reason);
        self.progress.mark_finished(Instant::now());
        self.set_state(state);
    }

    fn push_samples(&mut self, batch: Vec<RawSample>) {
        if batch.is_empty() {
            return;
        }
        self.raw.extend(batch);
        self.progress.set_samples(self.samples_collected());
    }

    fn enable_motor(
        &self,
        speed: Option<SpeedCommand>,
        transport: &mut dyn ScopeTransport,
    ) -> std::result::Result<(), TransportError> {
        let Some(controls) = &self.controls else {
            return Ok(());
        };
        let ack = self.timeouts.arm_timeout();

        transport.write_register(&controls.run_request, 0, ack)?;
        transport.write_register(&controls.stop_request, 0, ack)?;
        if let (Some(command), Some(register)) = (speed, &controls.velocity_reference) {
            // Validated while arming
            if let Some(counts) = command.counts() {
                transport.write_register(register, counts, ack)?;
            }
        }
        transport.write_register(&controls.run_request, 1, ack)
    }

    /// Stop then release the motor; both writes are always attempted
    fn disable_motor(&self, transport: &mut dyn ScopeTransport) -> std::result::Result<(), TransportError> {
        let Some(controls) = &self.controls else {
            return Ok(());
        };
        let ack = self.timeouts.arm_timeout();
        let stop = transport.write_register(&controls.stop_request, 1, ack);
        let release = transport.write_register(&controls.run_request, 0, ack);
        stop.and(release)
    }

    fn arm_failed(&mut self, err: TransportError, transport: &mut dyn ScopeTransport) -> ScopeError {
        let _ = self.disable_motor(transport);
        let _ = transport.finish_stream();
        match err {
            TransportError::Timeout(after) => {
                self.finish(SessionState::Failed, StopReason::ArmTimeout(after));
                ScopeError::ArmTimeout(after)
            }
            other => {
                self.finish(SessionState::Failed, StopReason::TransportFailed(other.clone()));
                ScopeError::Transport(other)
            }
        }
    }

    /// Failed with partial data after a best-effort motor disable
    fn fail(&mut self, err: TransportError, transport: &mut dyn ScopeTransport) -> ScopeError {
        if self.state == SessionState::Streaming {
            let _ = self.disable_motor(transport);
        }
        let _ = transport.finish_stream();
        self.finish(SessionState::Failed, StopReason::TransportFailed(err.clone()));
        ScopeError::Transport(err)
    }
}
