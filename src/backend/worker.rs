//! Capture worker thread
//!
//! This module contains the thread that drives one acquisition session from
//! arming to its terminal state. It owns the transport for the whole session
//! and reports progress through crossbeam channels, so the caller's thread
//! never blocks on the link.
//!
//! # Responsibilities
//!
//! - **Session driving**: runs arm, stream and drain in order, stopping at the
//!   first failure
//! - **Notification**: publishes a [`SessionEvent`] on every state change and
//!   once when the session finishes
//! - **Logging**: the session core is silent, so the worker logs transitions,
//!   failures and link statistics
//!
//! # Backpressure
//!
//! Events are sent with `try_send`. A full channel drops the event and bumps a
//! counter instead of stalling acquisition; pollers can always fall back to
//! [`SessionProgress`](crate::session::SessionProgress).

use crate::backend::transport_trait::ScopeTransport;
use crate::error::{Result, ScopeError};
use crate::session::{AcquisitionSession, CaptureRequest, SessionState, StopReason};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

/// Transport handle shared between the engine and the worker
pub type SharedTransport = Arc<Mutex<Box<dyn ScopeTransport>>>;

/// Wrap a transport for sharing with the worker
pub fn share_transport(transport: Box<dyn ScopeTransport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

/// Notification sent by the worker
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session entered a new state
    StateChanged { session_id: u64, state: SessionState },
    /// The session reached Completed or Failed
    Finished {
        session_id: u64,
        state: SessionState,
        samples_collected: usize,
        stop_reason: Option<StopReason>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> u64 {
        match self {
            SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::Finished { session_id, .. } => *session_id,
        }
    }
}

/// Non-blocking sender side of the event channel
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<SessionEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Create a bounded event channel
    pub fn channel(capacity: usize) -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Send without blocking; a full channel drops the event
    pub fn send(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Event channel full, dropped {:?}", event);
            }
            // Nobody is listening
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Events dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Handle to a running capture thread
pub struct CaptureWorker {
    session_id: u64,
    handle: JoinHandle<AcquisitionSession>,
}

impl CaptureWorker {
    /// Spawn a thread that runs `session` to completion
    pub fn spawn(
        session_id: u64,
        session: AcquisitionSession,
        request: CaptureRequest,
        transport: SharedTransport,
        events: EventSender,
    ) -> Result<Self> {
        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", session_id))
            .spawn(move || drive(session_id, session, request, &transport, &events))?;
        Ok(Self { session_id, handle })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Whether the thread has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread and take back the session
    pub fn join(self) -> Result<AcquisitionSession> {
        self.handle.join().map_err(|_| {
            tracing::error!("Capture worker {} panicked", self.session_id);
            ScopeError::Io(std::io::Error::other("capture worker panicked"))
        })
    }
}

/// Run one session, publishing each transition
fn drive(
    session_id: u64,
    mut session: AcquisitionSession,
    request: CaptureRequest,
    transport: &SharedTransport,
    events: &EventSender,
) -> AcquisitionSession {
    let mut guard = transport.lock().unwrap_or_else(PoisonError::into_inner);
    let link: &mut dyn ScopeTransport = &mut **guard;

    tracing::info!(
        "Session {} starting on {} link: {} channel(s), f = {}, {:.3} s",
        session_id,
        link.name(),
        request.variables().len(),
        request.sample_factor(),
        request.duration_seconds()
    );

    let mut last = SessionState::Idle;
    let mut publish = |state: SessionState| {
        if state != last {
            tracing::debug!("Session {}: {} -> {}", session_id, last, state);
            events.send(SessionEvent::StateChanged { session_id, state });
            last = state;
        }
    };

    publish(SessionState::Arming);
    let mut outcome = session.arm(request, link);
    publish(session.state());
    if outcome.is_ok() {
        outcome = session.stream(link);
        publish(session.state());
    }
    if outcome.is_ok() {
        outcome = session.drain(link);
        publish(session.state());
    }

    let reason = session.stop_reason().cloned();
    match &outcome {
        Ok(()) => tracing::info!(
            "Session {} completed with {} samples per channel ({})",
            session_id,
            session.samples_collected(),
            reason.as_ref().map(|r| r.to_string()).unwrap_or_default()
        ),
        Err(e) => tracing::error!(
            "Session {} failed after {} samples per channel: {}",
            session_id,
            session.samples_collected(),
            e
        ),
    }

    let stats = link.stats();
    tracing::debug!(
        "Link stats: {} frames, {} bytes in, {} bytes out, {} checksum errors, {} timeouts",
        stats.frames_received,
        stats.bytes_received,
        stats.bytes_sent,
        stats.checksum_errors,
        stats.timeouts
    );
    drop(guard);

    events.send(SessionEvent::Finished {
        session_id,
        state: session.state(),
        samples_collected: session.samples_collected(),
        stop_reason: reason,
    });
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::synthetic::{SyntheticConfig, SyntheticTransport};
    use crate::config::SessionTimeouts;
    use crate::registry::{default_definitions, SymbolMap, VariableRegistry, RUN_REQUEST, STOP_REQUEST};
    use crate::session::MotorControls;

    fn setup(config: SyntheticConfig) -> (SharedTransport, VariableRegistry) {
        let mut synthetic = SyntheticTransport::new(config, 921_600);
        let symbols = SymbolMap::from_entries(synthetic.enumerate_variables().unwrap());
        let registry = VariableRegistry::from_definitions(&default_definitions(), &symbols).unwrap();
        (share_transport(Box::new(synthetic)), registry)
    }

    fn timeouts() -> SessionTimeouts {
        SessionTimeouts {
            arm_timeout_ms: 50,
            drain_grace_ms: 500,
            read_timeout_ms: 5,
        }
    }

    #[test]
    fn test_event_sender_counts_drops() {
        let (tx, rx) = EventSender::channel(1);
        let event = SessionEvent::StateChanged {
            session_id: 1,
            state: SessionState::Arming,
        };
        tx.send(event.clone());
        tx.send(event.clone());
        tx.send(event);
        assert_eq!(tx.dropped(), 2);
        assert_eq!(rx.try_iter().count(), 1);

        drop(rx);
        tx.send(SessionEvent::StateChanged {
            session_id: 1,
            state: SessionState::Idle,
        });
        assert_eq!(tx.dropped(), 2);
    }

    #[test]
    fn test_worker_runs_session_to_completion() {
        let (transport, registry) = setup(SyntheticConfig::default());
        let controls = MotorControls::resolve(&registry, RUN_REQUEST, STOP_REQUEST, None).unwrap();
        let session = AcquisitionSession::capture(controls, timeouts());
        let request = CaptureRequest::new(registry.select(&["Idq_q"]).unwrap(), 20, 0.1, 921_600);
        let (events, rx) = EventSender::channel(16);

        let worker = CaptureWorker::spawn(7, session, request, transport, events).unwrap();
        assert_eq!(worker.session_id(), 7);
        let session = worker.join().unwrap();

        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(session.stop_reason(), Some(&StopReason::DurationElapsed));

        let states: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::Arming,
                SessionState::Streaming,
                SessionState::Stopping,
                SessionState::Completed
            ]
        );
    }

    #[test]
    fn test_worker_reports_failure() {
        let config = SyntheticConfig {
            acknowledge_run: false,
            ..Default::default()
        };
        let (transport, registry) = setup(config);
        let controls = MotorControls::resolve(&registry, RUN_REQUEST, STOP_REQUEST, None).unwrap();
        let session = AcquisitionSession::capture(controls, timeouts());
        let request = CaptureRequest::new(registry.select(&["Idq_q"]).unwrap(), 20, 0.1, 921_600);
        let (events, rx) = EventSender::channel(16);

        let session = CaptureWorker::spawn(1, session, request, transport, events)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(session.state(), SessionState::Failed);

        let finished = rx
            .try_iter()
            .find(|e| matches!(e, SessionEvent::Finished { .. }))
            .unwrap();
        match finished {
            SessionEvent::Finished {
                state, stop_reason, ..
            } => {
                assert_eq!(state, SessionState::Failed);
                assert!(matches!(stop_reason, Some(StopReason::ArmTimeout(_))));
            }
            _ => unreachable!(),
        }
    }
}
