//! Device buffer size probe
//!
//! The feasibility estimator needs the device's sample buffer size (SDA) to
//! predict how long a capture can outrun the link. Devices that report the
//! size answer a capacity query directly. For the rest, a short probe capture
//! at the highest rate (factor 1, guard overridden) on the narrowest variable
//! overflows the buffer on purpose; the bytes delivered before the overrun
//! approximate the buffer size, within ±20%.
//!
//! A probe that ends without an overrun only proves a lower bound and is
//! flagged as such.

use super::acquisition::AcquisitionSession;
use super::types::{CaptureRequest, StopReason};
use crate::backend::transport_trait::ScopeTransport;
use crate::config::SessionTimeouts;
use crate::error::{Result, ScopeError, TransportError};
use crate::types::ScaledVariable;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Relative uncertainty of a measured estimate
pub const PROBE_UNCERTAINTY: f64 = 0.2;

/// How a buffer estimate was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EstimateMethod {
    /// The device reported its buffer size
    Reported,
    /// Inferred from a probe capture
    Measured,
}

/// Estimated device sample buffer size
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BufferEstimate {
    /// Estimated size in bytes
    pub bytes: usize,
    /// Relative uncertainty, 0.0 for a reported size
    pub uncertainty: f64,
    pub method: EstimateMethod,
    /// Whether the probe saw the buffer overflow
    pub overrun_seen: bool,
}

impl BufferEstimate {
    /// A size reported by the device
    pub fn reported(bytes: usize) -> Self {
        Self {
            bytes,
            uncertainty: 0.0,
            method: EstimateMethod::Reported,
            overrun_seen: false,
        }
    }

    /// A size inferred from `samples` values of `width` bytes
    pub fn measured(samples: usize, width: usize, overrun_seen: bool) -> Self {
        Self {
            bytes: samples * width,
            uncertainty: PROBE_UNCERTAINTY,
            method: EstimateMethod::Measured,
            overrun_seen,
        }
    }

    /// Smallest size consistent with the estimate
    pub fn lower(&self) -> usize {
        (self.bytes as f64 * (1.0 - self.uncertainty)).floor() as usize
    }

    /// Largest size consistent with the estimate
    pub fn upper(&self) -> Option<usize> {
        if self.is_lower_bound() {
            None
        } else {
            Some((self.bytes as f64 * (1.0 + self.uncertainty)).ceil() as usize)
        }
    }

    /// The probe never overflowed, so the buffer is at least this large
    pub fn is_lower_bound(&self) -> bool {
        self.method == EstimateMethod::Measured && !self.overrun_seen
    }
}

impl std::fmt::Display for BufferEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.method, self.is_lower_bound()) {
            (EstimateMethod::Reported, _) => write!(f, "{} bytes (reported)", self.bytes),
            (EstimateMethod::Measured, true) => write!(f, "at least {} bytes", self.bytes),
            (EstimateMethod::Measured, false) => write!(
                f,
                "{} bytes ±{:.0}%",
                self.bytes,
                self.uncertainty * 100.0
            ),
        }
    }
}

/// Runs the buffer size probe
#[derive(Debug, Clone, Copy)]
pub struct BufferProbe {
    timeouts: SessionTimeouts,
    duration: Duration,
}

impl BufferProbe {
    pub fn new(timeouts: SessionTimeouts, duration: Duration) -> Self {
        Self { timeouts, duration }
    }

    /// Estimate the buffer size using `variable` as the probe channel
    ///
    /// Fails with [`ScopeError::ProbeUnavailable`] when the link fails for any
    /// reason other than the expected overrun, or when nothing arrives.
    pub fn run(
        &self,
        variable: Arc<ScaledVariable>,
        baud_rate: u32,
        transport: &mut dyn ScopeTransport,
    ) -> Result<BufferEstimate> {
        if let Some(bytes) = transport.probe_capacity() {
            return Ok(BufferEstimate::reported(bytes));
        }

        let width = variable.byte_width.bytes();
        let request = CaptureRequest::new(vec![variable], 1, self.duration.as_secs_f64(), baud_rate)
            .with_guard_override(true);
        let mut session = AcquisitionSession::probe(self.timeouts);

        // A drain timeout only means the backlog outlasted the grace period;
        // what arrived so far still bounds the buffer from below.
        let overrun_seen = match session.run(request, transport) {
            Ok(()) => false,
            Err(e) => match session.stop_reason() {
                Some(StopReason::TransportFailed(TransportError::Overrun)) => true,
                Some(StopReason::DrainTimeout(_)) if !session.raw_samples().is_empty() => false,
                _ => return Err(ScopeError::ProbeUnavailable(e.to_string())),
            },
        };

        let samples = session.raw_samples().len();
        if samples == 0 {
            return Err(ScopeError::ProbeUnavailable(
                "no samples received during probe".to_string(),
            ));
        }
        Ok(BufferEstimate::measured(samples, width, overrun_seen))
    }
}
