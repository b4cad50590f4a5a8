//! ScopeTransport trait for a unified debug link interface
//!
//! This module provides the capability set the acquisition session needs from
//! a debug link, enabling both the real serial link and the synthetic device
//! simulator to be used interchangeably.

use crate::error::TransportError;
use crate::registry::SymbolEntry;
use crate::types::{RawSample, ScaledVariable};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a single `read_samples` call
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Samples received within the timeout; empty when nothing arrived
    Samples(Vec<RawSample>),
    /// Device finished the stream and will send nothing more
    EndOfStream,
}

/// Statistics for link operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkStats {
    /// Frames or sample batches received
    pub frames_received: u64,
    /// Raw samples received
    pub samples_received: u64,
    /// Bytes received from the device
    pub bytes_received: u64,
    /// Bytes sent to the device
    pub bytes_sent: u64,
    /// Register writes acknowledged
    pub register_writes: u64,
    /// Frames dropped because of a bad checksum
    pub checksum_errors: u64,
    /// Reads or acknowledgements that timed out
    pub timeouts: u64,
    /// Device overrun reports
    pub overruns: u64,
}

impl LinkStats {
    /// Record a received batch of samples
    pub fn record_samples(&mut self, samples: usize, bytes: usize) {
        self.frames_received += 1;
        self.samples_received += samples as u64;
        self.bytes_received += bytes as u64;
    }

    /// Record bytes written to the link
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn record_register_write(&mut self) {
        self.register_writes += 1;
    }

    pub fn record_checksum_errors(&mut self, count: u64) {
        self.checksum_errors += count;
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    pub fn record_overrun(&mut self) {
        self.overruns += 1;
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Unified interface for scope-capable debug links
///
/// Implementations must be `Send` so the capture worker thread can own the
/// link while a session runs.
///
/// # Sampling model
///
/// `configure` selects the channels and sample factor and starts sampling on
/// the device. `read_samples` returns whatever arrived within the timeout.
/// `finish_stream` asks the device to stop sampling; it then flushes what it
/// has buffered and reports [`ReadOutcome::EndOfStream`]. A device whose
/// buffer overflows reports [`TransportError::Overrun`].
#[cfg_attr(test, mockall::automock)]
pub trait ScopeTransport: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Select channels and sample factor, and start sampling
    fn configure(
        &mut self,
        channels: &[Arc<ScaledVariable>],
        sample_factor: u32,
    ) -> Result<(), TransportError>;

    /// Write a register and wait for the device to acknowledge it
    fn write_register(
        &mut self,
        register: &ScaledVariable,
        value: i32,
        ack_timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Read samples that arrive within `timeout`
    fn read_samples(&mut self, timeout: Duration) -> Result<ReadOutcome, TransportError>;

    /// Ask the device to stop sampling and flush
    fn finish_stream(&mut self) -> Result<(), TransportError>;

    /// Sample buffer size in bytes, if the device reports it
    fn probe_capacity(&mut self) -> Option<usize>;

    /// Names and addresses of the variables this link knows about
    fn enumerate_variables(&mut self) -> Result<Vec<SymbolEntry>, TransportError>;

    /// Snapshot of link statistics
    fn stats(&self) -> LinkStats;
}
