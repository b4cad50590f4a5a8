//! Capture engine
//!
//! [`CaptureEngine`] is the API the interactive surface talks to. It owns the
//! transport, the variable registry and the single session slot, and turns a
//! finished session into a scaled dataset.
//!
//! # Session slot
//!
//! At most one capture exists at a time. A new capture is rejected with
//! [`ScopeError::SessionConflict`] while the slot holds a session in any state,
//! including a terminal one that has not been discarded yet, so a result can
//! never be lost by starting over.
//!
//! # Example
//!
//! ```ignore
//! use motorscope::{AppConfig, CaptureEngine};
//!
//! let engine = CaptureEngine::from_config(&AppConfig::sample())?;
//! let request = engine.build_request(&["Idq_q"], 20, 1.0)?;
//! println!("{:?}", engine.get_feasibility(&request).risk);
//!
//! let handle = engine.start_capture(request)?;
//! engine.wait(&handle)?;
//! let result = engine.get_result(&handle)?;
//! engine.discard(&handle)?;
//! ```

use crate::analysis::{
    estimate, reconstruct_request, scale_series, FeasibilityInput, FeasibilityReport,
    ReconstructedSeries, RiskLevel, ScaledDataset, UnderDelivery,
};
use crate::backend::{
    open_transport, share_transport, CaptureWorker, EventSender, LinkStats, ScopeTransport,
    SessionEvent, SharedTransport,
};
use crate::config::{AppConfig, MotorSettings, ProbeSettings, SessionTimeouts};
use crate::error::{Result, ScopeError, TransportError};
use crate::registry::VariableRegistry;
use crate::session::{
    AcquisitionSession, BufferEstimate, BufferProbe, CaptureRequest, MotorControls,
    SessionProgress, SessionState, SessionStatus, SpeedCommand, StopReason, StopSignal,
};
use crate::types::RawSample;
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How often `wait` checks on the worker
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Identifies one capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    id: u64,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Final product of a completed capture
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub dataset: ScaledDataset,
    pub under_delivery: Option<UnderDelivery>,
    pub stop_reason: StopReason,
    /// Samples that did not belong to any requested channel
    pub discarded_samples: usize,
}

/// Raw data of a session in any terminal state
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutcome {
    pub state: SessionState,
    pub stop_reason: Option<StopReason>,
    pub samples: Vec<RawSample>,
    /// Reconstruction of whatever arrived
    pub series: ReconstructedSeries,
}

struct RunningSession {
    id: u64,
    request: CaptureRequest,
    captured_at: DateTime<Utc>,
    progress: Arc<SessionProgress>,
    stop: StopSignal,
    phase: Phase,
}

enum Phase {
    Running(CaptureWorker),
    Finished(AcquisitionSession),
    /// The worker thread panicked and took the session with it
    Lost,
}

/// Presentation-facing capture API
pub struct CaptureEngine {
    transport: SharedTransport,
    registry: VariableRegistry,
    timeouts: SessionTimeouts,
    probe: ProbeSettings,
    motor: MotorSettings,
    baud_rate: u32,
    slot: Mutex<Option<RunningSession>>,
    next_id: AtomicU64,
    events: EventSender,
    event_rx: Receiver<SessionEvent>,
    buffer_estimate: Mutex<Option<BufferEstimate>>,
    /// Set while a buffer measurement owns the link
    measuring: AtomicBool,
}

/// Clears the measurement marker on every exit path
struct MeasuringGuard<'a>(&'a AtomicBool);

impl Drop for MeasuringGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CaptureEngine {
    /// Create an engine over an open transport
    pub fn new(transport: Box<dyn ScopeTransport>, registry: VariableRegistry, config: &AppConfig) -> Self {
        let (events, event_rx) = EventSender::channel(config.capture.event_capacity);
        Self {
            transport: share_transport(transport),
            registry,
            timeouts: config.timeouts,
            probe: config.probe,
            motor: config.motor.clone(),
            baud_rate: config.link.baud_rate,
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
            events,
            event_rx,
            buffer_estimate: Mutex::new(None),
            measuring: AtomicBool::new(false),
        }
    }

    /// Open the configured transport and build the registry from the config
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let (transport, symbols) = open_transport(config)?;
        let registry = VariableRegistry::from_definitions(&config.variables, &symbols)?;
        tracing::info!(
            "Engine ready on {} link with {} variables",
            transport.name(),
            registry.len()
        );
        Ok(Self::new(transport, registry, config))
    }

    pub fn registry(&self) -> &VariableRegistry {
        &self.registry
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Build a request for named variables at the configured baud rate
    ///
    /// The configured speed set-point, if any, is attached.
    pub fn build_request<S: AsRef<str>>(
        &self,
        variables: &[S],
        sample_factor: u32,
        duration_seconds: f64,
    ) -> Result<CaptureRequest> {
        let vars = self.registry.select(variables)?;
        let mut request = CaptureRequest::new(vars, sample_factor, duration_seconds, self.baud_rate);
        if let Some(rpm) = self.motor.speed_rpm {
            request = request.with_speed_command(SpeedCommand::new(rpm, self.motor.rpm_per_count));
        }
        Ok(request)
    }

    /// Predict link load for a request; never fails
    pub fn get_feasibility(&self, request: &CaptureRequest) -> FeasibilityReport {
        let buffer = self.buffer_estimate().map(|e| e.bytes);
        estimate(&FeasibilityInput::from_request(request, buffer))
    }

    /// Validate the request and start a capture on the worker thread
    pub fn start_capture(&self, request: CaptureRequest) -> Result<SessionHandle> {
        let mut slot = self.lock_slot();
        if let Some(current) = slot.as_ref() {
            let state = current.progress.state();
            tracing::warn!("Rejected capture: session {} is {}", current.id, state);
            return Err(ScopeError::SessionConflict {
                state: state.display_name(),
            });
        }
        self.reject_while_measuring()?;
        request.validate()?;

        let controls = MotorControls::resolve(
            &self.registry,
            &self.motor.run_request,
            &self.motor.stop_request,
            self.motor.velocity_reference.as_deref(),
        )?;
        let session = AcquisitionSession::capture(controls, self.timeouts);
        let progress = session.progress();
        let stop = session.stop_signal();

        let report = self.get_feasibility(&request);
        if report.risk > RiskLevel::Green {
            tracing::warn!(
                "Starting capture with {} link risk ({:.0}% utilization)",
                report.risk,
                report.utilization * 100.0
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let worker = CaptureWorker::spawn(
            id,
            session,
            request.clone(),
            Arc::clone(&self.transport),
            self.events.clone(),
        )?;

        *slot = Some(RunningSession {
            id,
            request,
            captured_at: Utc::now(),
            progress,
            stop,
            phase: Phase::Running(worker),
        });
        Ok(SessionHandle { id })
    }

    /// Snapshot of the session's progress
    ///
    /// A session whose worker died shows up as Failed.
    pub fn poll_status(&self, handle: &SessionHandle) -> Result<SessionStatus> {
        let mut slot = self.lock_slot();
        let current = Self::current_mut(&mut slot, handle)?;
        // The panic itself is reported by wait and get_result
        let _ = Self::collect(current, false);
        Ok(current.progress.snapshot())
    }

    /// Ask the session to stop early; repeated calls are harmless
    pub fn request_stop(&self, handle: &SessionHandle) -> Result<()> {
        let slot = self.lock_slot();
        let current = Self::current(&slot, handle)?;
        if !current.stop.is_requested() {
            tracing::info!("Stop requested for session {}", current.id);
        }
        current.stop.request();
        Ok(())
    }

    /// Stop handle that can be used without going through the engine
    pub fn stop_signal(&self, handle: &SessionHandle) -> Result<StopSignal> {
        let slot = self.lock_slot();
        Ok(Self::current(&slot, handle)?.stop.clone())
    }

    /// Block until the session reaches a terminal state
    ///
    /// Returns the worker's panic as an error if the thread dies mid-session.
    pub fn wait(&self, handle: &SessionHandle) -> Result<SessionStatus> {
        loop {
            {
                let mut slot = self.lock_slot();
                let current = Self::current_mut(&mut slot, handle)?;
                let terminal = current.progress.state().is_terminal();
                Self::collect(current, terminal)?;
                if !matches!(current.phase, Phase::Running(_)) {
                    return Ok(current.progress.snapshot());
                }
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Scaled dataset of a completed session
    ///
    /// A failed session returns the error it failed with; its partial data is
    /// available through [`raw_outcome`](Self::raw_outcome).
    pub fn get_result(&self, handle: &SessionHandle) -> Result<CaptureResult> {
        let mut slot = self.lock_slot();
        let current = Self::current_mut(&mut slot, handle)?;
        Self::collect(current, false)?;
        let session = Self::finished(current)?;

        let reason = session.stop_reason().cloned();
        if session.state() == SessionState::Failed {
            return Err(failure_error(reason));
        }

        let series = reconstruct_request(session.raw_samples(), &current.request);
        let dataset = scale_series(&series, current.request.variables(), current.captured_at);
        if let Some(shortfall) = series.under_delivery {
            tracing::warn!("Session {}: {}", current.id, shortfall);
        }
        Ok(CaptureResult {
            under_delivery: series.under_delivery,
            stop_reason: reason.unwrap_or(StopReason::DurationElapsed),
            discarded_samples: series.discarded,
            dataset,
        })
    }

    /// Raw samples and reconstruction of a terminal session, failed or not
    pub fn raw_outcome(&self, handle: &SessionHandle) -> Result<RawOutcome> {
        let mut slot = self.lock_slot();
        let current = Self::current_mut(&mut slot, handle)?;
        Self::collect(current, false)?;
        let session = Self::finished(current)?;
        Ok(RawOutcome {
            state: session.state(),
            stop_reason: session.stop_reason().cloned(),
            samples: session.raw_samples().to_vec(),
            series: reconstruct_request(session.raw_samples(), &current.request),
        })
    }

    /// Drop a terminal session and free the slot
    pub fn discard(&self, handle: &SessionHandle) -> Result<()> {
        let mut slot = self.lock_slot();
        let current = Self::current_mut(&mut slot, handle)?;
        Self::collect(current, false)?;
        match &mut current.phase {
            Phase::Finished(session) => session.discard()?,
            Phase::Lost => {}
            Phase::Running(_) => {
                return Err(ScopeError::SessionConflict {
                    state: current.progress.state().display_name(),
                })
            }
        }
        tracing::info!("Session {} discarded", current.id);
        *slot = None;
        Ok(())
    }

    /// Estimate the device buffer size and remember it for feasibility reports
    ///
    /// The session slot stays usable while the measurement runs; new captures
    /// are rejected until it ends.
    pub fn probe_buffer(&self) -> Result<BufferEstimate> {
        {
            let slot = self.lock_slot();
            if let Some(current) = slot.as_ref() {
                let state = current.progress.state();
                if state.is_active() {
                    return Err(ScopeError::ProbeUnavailable(format!(
                        "capture session {} is {}",
                        current.id, state
                    )));
                }
            }
            if self.measuring.swap(true, Ordering::AcqRel) {
                return Err(ScopeError::ProbeUnavailable(
                    "buffer measurement already running".to_string(),
                ));
            }
        }
        let _measuring = MeasuringGuard(&self.measuring);

        let variable = self.registry.narrowest().ok_or_else(|| {
            ScopeError::ProbeUnavailable("no variables registered".to_string())
        })?;
        let probe = BufferProbe::new(self.timeouts, self.probe.duration());
        tracing::info!("Probing device buffer with {}", variable.identifier);

        let estimate = {
            let mut transport = self.lock_transport();
            probe.run(variable, self.baud_rate, &mut **transport)
        };

        match estimate {
            Ok(estimate) => {
                tracing::info!("Device buffer: {}", estimate);
                self.set_buffer_estimate(Some(estimate));
                Ok(estimate)
            }
            Err(e) => {
                tracing::warn!("Buffer probe failed: {}", e);
                Err(e)
            }
        }
    }

    /// Clear the on-board hardware UI flag so it does not fight the host
    ///
    /// Does nothing when no flag is configured.
    pub fn prepare_target(&self) -> Result<()> {
        let Some(name) = self.motor.hardware_ui.as_deref() else {
            return Ok(());
        };
        let slot = self.lock_slot();
        if let Some(current) = slot.as_ref() {
            if current.progress.state().is_active() {
                return Err(ScopeError::SessionConflict {
                    state: current.progress.state().display_name(),
                });
            }
        }
        self.reject_while_measuring()?;
        let register = self.registry.require(name)?;
        let mut transport = self.lock_transport();
        transport.write_register(&register, 0, self.timeouts.arm_timeout())?;
        tracing::info!("Disabled on-board UI ({})", register.identifier);
        Ok(())
    }

    /// Receiver for session notifications
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.event_rx.clone()
    }

    /// Notifications dropped because nobody drained the channel
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    /// Whether a buffer measurement currently owns the link
    pub fn is_measuring_buffer(&self) -> bool {
        self.measuring.load(Ordering::Acquire)
    }

    /// Last buffer estimate fed into feasibility reports
    pub fn buffer_estimate(&self) -> Option<BufferEstimate> {
        *self
            .buffer_estimate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Override the buffer estimate, e.g. with a size known from the datasheet
    pub fn set_buffer_estimate(&self, estimate: Option<BufferEstimate>) {
        *self
            .buffer_estimate
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = estimate;
    }

    /// Statistics of the link, waiting for a running session to release it
    pub fn link_stats(&self) -> LinkStats {
        self.lock_transport().stats()
    }

    fn reject_while_measuring(&self) -> Result<()> {
        if self.is_measuring_buffer() {
            tracing::warn!("Rejected: buffer measurement in progress");
            return Err(ScopeError::SessionConflict { state: "Measuring" });
        }
        Ok(())
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<RunningSession>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_transport(&self) -> MutexGuard<'_, Box<dyn ScopeTransport>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current<'a>(slot: &'a Option<RunningSession>, handle: &SessionHandle) -> Result<&'a RunningSession> {
        slot.as_ref()
            .filter(|s| s.id == handle.id)
            .ok_or(ScopeError::UnknownSession(handle.id))
    }

    fn current_mut<'a>(
        slot: &'a mut Option<RunningSession>,
        handle: &SessionHandle,
    ) -> Result<&'a mut RunningSession> {
        slot.as_mut()
            .filter(|s| s.id == handle.id)
            .ok_or(ScopeError::UnknownSession(handle.id))
    }

    /// Take the session back from a worker that has returned
    ///
    /// With `block` set, waits for the thread; otherwise a live worker is left
    /// alone. A panicked worker leaves the session Failed and Lost.
    fn collect(current: &mut RunningSession, block: bool) -> Result<()> {
        let done = match &current.phase {
            Phase::Running(worker) => block || worker.is_finished(),
            _ => return Ok(()),
        };
        if !done {
            return Ok(());
        }
        if let Phase::Running(worker) = std::mem::replace(&mut current.phase, Phase::Lost) {
            match worker.join() {
                Ok(session) => current.phase = Phase::Finished(session),
                Err(e) => {
                    current.progress.mark_finished(Instant::now());
                    current.progress.set_state(SessionState::Failed);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn finished(current: &RunningSession) -> Result<&AcquisitionSession> {
        match &current.phase {
            Phase::Finished(session) => Ok(session),
            Phase::Running(_) => Err(ScopeError::SessionNotFinished {
                state: current.progress.state().display_name(),
            }),
            Phase::Lost => Err(ScopeError::Io(std::io::Error::other(
                "capture worker panicked",
            ))),
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = slot.take() {
            if let Phase::Running(worker) = current.phase {
                current.stop.request();
                tracing::debug!("Stopping session {} on shutdown", current.id);
                let _ = worker.join();
            }
        }
    }
}

/// Error a failed session is reported with
fn failure_error(reason: Option<StopReason>) -> ScopeError {
    match reason {
        Some(StopReason::ArmTimeout(after)) => ScopeError::ArmTimeout(after),
        Some(StopReason::TransportFailed(e)) => ScopeError::Transport(e),
        Some(StopReason::DrainTimeout(after)) => ScopeError::Transport(TransportError::Timeout(after)),
        _ => ScopeError::Transport(TransportError::Io("session failed".to_string())),
    }
}
