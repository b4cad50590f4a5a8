//! UART scope transport
//!
//! [`SerialTransport`] speaks the framed scope protocol from
//! [`protocol`](super::protocol) over any byte stream. In production the
//! stream is a `serialport` handle opened with [`SerialTransport::open`]; in
//! tests it is an in-memory port.
//!
//! Requests are answered by ack/nack frames. Scope data can arrive while the
//! transport waits for an acknowledgement (e.g. the motor-disable write during
//! Stopping), so data frames seen while waiting are buffered and returned by
//! the next `read_samples` call.

use super::protocol::{service, DeviceMessage, Frame, FrameDecoder};
use super::transport_trait::{LinkStats, ReadOutcome, ScopeTransport};
use crate::error::TransportError;
use crate::registry::SymbolEntry;
use crate::types::{ByteWidth, RawSample, ScaledVariable};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Read timeout of the underlying port
pub const PORT_READ_TIMEOUT: Duration = Duration::from_millis(5);

/// Default time to wait for a configure or capacity reply
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 1024;

/// Scope transport over a framed UART link
pub struct SerialTransport<P: Read + Write + Send> {
    port: P,
    decoder: FrameDecoder,
    widths: Vec<ByteWidth>,
    sample_factor: u32,
    pending: VecDeque<RawSample>,
    end_seen: bool,
    overrun_seen: bool,
    symbols: Vec<SymbolEntry>,
    command_timeout: Duration,
    stats: LinkStats,
    checksum_errors_seen: u64,
}

#[cfg(feature = "serial")]
impl SerialTransport<Box<dyn serialport::SerialPort>> {
    /// Open a serial port at the given baud rate
    pub fn open(path: &str, baud_rate: u32, command_timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .timeout(PORT_READ_TIMEOUT)
            .open()
            .map_err(|e| TransportError::Io(format!("{}: {}", path, e)))?;
        tracing::info!("Opened {} at {} baud", path, baud_rate);
        Ok(Self::new(port, command_timeout))
    }
}

impl<P: Read + Write + Send> SerialTransport<P> {
    pub fn new(port: P, command_timeout: Duration) -> Self {
        Self {
            port,
            decoder: FrameDecoder::new(),
            widths: Vec::new(),
            sample_factor: 1,
            pending: VecDeque::new(),
            end_seen: false,
            overrun_seen: false,
            symbols: Vec::new(),
            command_timeout,
            stats: LinkStats::default(),
            checksum_errors_seen: 0,
        }
    }

    /// Variables reported by `enumerate_variables`, usually from the firmware ELF
    pub fn with_symbols(mut self, symbols: Vec<SymbolEntry>) -> Self {
        self.symbols = symbols;
        self
    }

    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.encode();
        self.port.write_all(&bytes)?;
        self.port.flush()?;
        self.stats.record_sent(bytes.len());
        Ok(())
    }

    /// Pull whatever the port has; 0 when nothing arrived
    fn fill(&mut self) -> Result<usize, TransportError> {
        let mut buf = [0u8; READ_CHUNK];
        let n = match self.port.read(&mut buf) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                0
            }
            Err(e) => return Err(e.into()),
        };
        self.decoder.push(&buf[..n]);
        Ok(n)
    }

    /// Decode the next buffered frame
    fn next_message(&mut self) -> Result<Option<DeviceMessage>, TransportError> {
        let frame = self.decoder.next_frame();
        let errors = self.decoder.checksum_errors();
        if errors > self.checksum_errors_seen {
            self.stats.record_checksum_errors(errors - self.checksum_errors_seen);
            tracing::warn!("Dropped {} corrupt frame(s)", errors - self.checksum_errors_seen);
            self.checksum_errors_seen = errors;
        }
        match frame {
            Some(frame) => DeviceMessage::parse(&frame, &self.widths).map(Some),
            None => Ok(None),
        }
    }

    /// Buffer stream messages; returns everything else to the caller
    fn absorb(&mut self, msg: DeviceMessage) -> Option<DeviceMessage> {
        match msg {
            DeviceMessage::ScopeData { first_tick, rows } => {
                let row_bytes: usize = self.widths.iter().map(|w| w.bytes()).sum();
                let row_count = rows.len();
                for (i, row) in rows.into_iter().enumerate() {
                    let tick = first_tick as u64 + i as u64 * self.sample_factor as u64;
                    for (channel, value) in row.into_iter().enumerate() {
                        self.pending.push_back(RawSample::new(channel, tick, value));
                    }
                }
                self.stats
                    .record_samples(row_count * self.widths.len(), row_count * row_bytes);
                None
            }
            DeviceMessage::EndOfStream => {
                self.end_seen = true;
                None
            }
            DeviceMessage::Overrun => {
                self.overrun_seen = true;
                None
            }
            other => Some(other),
        }
    }

    /// Wait for the reply to `service`
    fn await_reply(&mut self, request: u8, timeout: Duration) -> Result<DeviceMessage, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(msg) = self.next_message()? {
                match self.absorb(msg) {
                    Some(DeviceMessage::Ack { service: replied, status }) if replied == request => {
                        if status != 0 {
                            return Err(TransportError::Nack { service: replied, status });
                        }
                        return Ok(DeviceMessage::Ack { service: replied, status });
                    }
                    Some(DeviceMessage::Nack { service: replied, status }) if replied == request => {
                        return Err(TransportError::Nack { service: replied, status });
                    }
                    Some(DeviceMessage::Capacity(bytes)) if request == service::CAPACITY => {
                        return Ok(DeviceMessage::Capacity(bytes));
                    }
                    Some(other) => tracing::debug!("Ignoring unsolicited {:?}", other),
                    None => {}
                }
            }
            if Instant::now() >= deadline {
                self.stats.record_timeout();
                return Err(TransportError::Timeout(timeout));
            }
            if self.fill()? == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

impl<P: Read + Write + Send> ScopeTransport for SerialTransport<P> {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn configure(
        &mut self,
        channels: &[Arc<ScaledVariable>],
        sample_factor: u32,
    ) -> Result<(), TransportError> {
        let frame = Frame::configure(channels, sample_factor)?;
        self.decoder.clear();
        self.pending.clear();
        self.end_seen = false;
        self.overrun_seen = false;
        self.widths = channels.iter().map(|v| v.byte_width).collect();
        self.sample_factor = sample_factor;

        self.send(&frame)?;
        if let Err(e) = self.await_reply(service::CONFIGURE, self.command_timeout) {
            self.widths.clear();
            return Err(e);
        }
        tracing::debug!("Scope configured: {} channels, factor {}", channels.len(), sample_factor);
        Ok(())
    }

    fn write_register(
        &mut self,
        register: &ScaledVariable,
        value: i32,
        ack_timeout: Duration,
    ) -> Result<(), TransportError> {
        self.send(&Frame::write_register(register, value))?;
        self.await_reply(service::WRITE_REGISTER, ack_timeout)?;
        self.stats.record_register_write();
        Ok(())
    }

    fn read_samples(&mut self, timeout: Duration) -> Result<ReadOutcome, TransportError> {
        if self.widths.is_empty() {
            return Err(TransportError::NotConfigured);
        }
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(msg) = self.next_message()? {
                if let Some(other) = self.absorb(msg) {
                    tracing::debug!("Ignoring unsolicited {:?}", other);
                }
            }

            if !self.pending.is_empty() {
                return Ok(ReadOutcome::Samples(self.pending.drain(..).collect()));
            }
            if self.overrun_seen {
                self.overrun_seen = false;
                self.stats.record_overrun();
                return Err(TransportError::Overrun);
            }
            if self.end_seen {
                return Ok(ReadOutcome::EndOfStream);
            }
            if Instant::now() >= deadline {
                return Ok(ReadOutcome::Samples(Vec::new()));
            }
            if self.fill()? == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn finish_stream(&mut self) -> Result<(), TransportError> {
        if self.widths.is_empty() {
            return Err(TransportError::NotConfigured);
        }
        self.send(&Frame::stop_stream())
    }

    fn probe_capacity(&mut self) -> Option<usize> {
        if let Err(e) = self.send(&Frame::capacity_query()) {
            tracing::debug!("Capacity query failed: {}", e);
            return None;
        }
        match self.await_reply(service::CAPACITY, self.command_timeout) {
            Ok(DeviceMessage::Capacity(bytes)) if bytes > 0 => Some(bytes as usize),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("Device does not report capacity: {}", e);
                None
            }
        }
    }

    fn enumerate_variables(&mut self) -> Result<Vec<SymbolEntry>, TransportError> {
        Ok(self.symbols.clone())
    }

    fn stats(&self) -> LinkStats {
        self.stats.clone()
    }
}
