//! Synthetic Scope Transport
//!
//! This module provides a simulated motor-control target that can be used to
//! exercise the capture engine without hardware. It streams waveform samples
//! in real time at the configured sample factor and models the device's
//! sample buffer draining over a UART-rate link.
//!
//! # Features
//!
//! - **Pattern-based data generation**: each channel follows a [`SignalPattern`]
//! - **Link model**: samples leave the device no faster than `baud / 10` bytes/s
//! - **Buffer model**: a backlog larger than the buffer capacity causes an overrun
//! - **Fault injection**: under-delivery, link faults, missing run acknowledgement
//!   and a stream that never ends
//!
//! # Data Patterns
//!
//! Channels get a default pattern from their identifier:
//!
//! - `omega*` - 1 Hz sine, 1000 counts amplitude
//! - `idq*` - 5 Hz sine, 500 counts amplitude
//! - anything else - a ramp
//!
//! # Example
//!
//! ```ignore
//! use motorscope::backend::{SyntheticConfig, SyntheticTransport};
//!
//! let mut transport = SyntheticTransport::new(SyntheticConfig::default(), 115_200);
//! let log = transport.register_log();
//!
//! transport.configure(&channels, 20)?;
//! let batch = transport.read_samples(Duration::from_millis(10))?;
//! ```

use super::transport_trait::{LinkStats, ReadOutcome, ScopeTransport};
use crate::error::TransportError;
use crate::registry::{default_definitions, SymbolEntry, RUN_REQUEST, STOP_REQUEST};
use crate::types::{effective_rate_hz, ByteWidth, RawSample, ScaledVariable};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Address of the first simulated variable
pub const SYNTHETIC_BASE_ADDRESS: u32 = 0x2000_0100;

/// Sample buffer size of the simulated device
pub const DEFAULT_BUFFER_CAPACITY: usize = 32 * 1024;

/// Longest sleep between link polls while waiting for samples
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Pattern for generating synthetic samples, in raw counts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPattern {
    /// Constant value
    Constant { value: i32 },
    /// Sine wave with frequency and amplitude
    Sine {
        frequency_hz: f64,
        amplitude: f64,
        offset: f64,
    },
    /// Counter that increments once per sample and wraps
    Ramp { step: i32, min: i32, max: i32 },
    /// Square wave
    Square { period_s: f64, amplitude: f64 },
    /// Triangle wave
    Triangle { period_s: f64, amplitude: f64 },
}

impl SignalPattern {
    /// Default pattern and noise amplitude for a firmware identifier
    pub fn for_identifier(identifier: &str) -> (Self, f64) {
        let lower = identifier.to_ascii_lowercase();
        if lower.contains("omega") {
            (
                SignalPattern::Sine {
                    frequency_hz: 1.0,
                    amplitude: 1000.0,
                    offset: 0.0,
                },
                50.0,
            )
        } else if lower.contains("idq") {
            (
                SignalPattern::Sine {
                    frequency_hz: 5.0,
                    amplitude: 500.0,
                    offset: 0.0,
                },
                100.0,
            )
        } else {
            (
                SignalPattern::Ramp {
                    step: 1,
                    min: 0,
                    max: 1000,
                },
                0.0,
            )
        }
    }

    /// Value of sample `index`, taken at `t` seconds of device time
    pub fn value_at(&self, index: u64, t: f64) -> f64 {
        match *self {
            SignalPattern::Constant { value } => value as f64,
            SignalPattern::Sine {
                frequency_hz,
                amplitude,
                offset,
            } => offset + amplitude * (2.0 * std::f64::consts::PI * frequency_hz * t).sin(),
            SignalPattern::Ramp { step, min, max } => {
                let span = (max as i64 - min as i64 + 1).max(1);
                let pos = (index as i64).wrapping_mul(step as i64).rem_euclid(span);
                (min as i64 + pos) as f64
            }
            SignalPattern::Square { period_s, amplitude } => {
                if period_s <= 0.0 || t % period_s < period_s / 2.0 {
                    amplitude
                } else {
                    -amplitude
                }
            }
            SignalPattern::Triangle { period_s, amplitude } => {
                if period_s <= 0.0 {
                    return 0.0;
                }
                let t = t % period_s;
                let half = period_s / 2.0;
                if t < half {
                    amplitude * (2.0 * t / half - 1.0)
                } else {
                    amplitude * (1.0 - 2.0 * (t - half) / half)
                }
            }
        }
    }
}

/// Knobs of the simulated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Device sample buffer size
    pub buffer_capacity_bytes: usize,
    /// Answer capacity queries directly instead of requiring a probe capture
    pub report_capacity: bool,
    /// Limit delivery to the UART byte rate
    pub link_limited: bool,
    /// Stop delivering after this many samples per channel
    pub max_samples: Option<usize>,
    /// Fail every read after this many samples per channel
    pub fail_after_samples: Option<usize>,
    /// Acknowledge a non-zero run request
    pub acknowledge_run: bool,
    /// Report end of stream once flushed after `finish_stream`
    pub end_of_stream: bool,
    /// Random jitter added to device ticks, in control ticks
    pub tick_jitter: u32,
    /// Add pattern noise
    pub noise: bool,
    /// Seed for noise and jitter
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            buffer_capacity_bytes: DEFAULT_BUFFER_CAPACITY,
            report_capacity: false,
            link_limited: true,
            max_samples: None,
            fail_after_samples: None,
            acknowledge_run: true,
            end_of_stream: true,
            tick_jitter: 0,
            noise: true,
            seed: 0x5EED,
        }
    }
}

/// A register write as seen by the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWrite {
    pub identifier: String,
    pub value: i32,
}

/// Shared log of register writes, readable after the transport is moved
pub type RegisterLog = Arc<Mutex<Vec<RegisterWrite>>>;

/// Simple xorshift generator for noise and jitter
#[derive(Debug, Clone)]
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut s = self.0;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.0 = s;
        s
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() as f64) / (u64::MAX as f64)
    }
}

#[derive(Debug, Clone)]
struct Channel {
    pattern: SignalPattern,
    noise: f64,
    width: ByteWidth,
}

#[derive(Debug, Clone)]
struct Stream {
    started: Instant,
    finished: Option<Instant>,
    rate_hz: f64,
    sample_factor: u32,
    row_bytes: usize,
    delivered: u64,
    /// Rows the device flushes before reporting an overrun
    flush_limit: Option<u64>,
    ended: bool,
}

/// Simulated scope target
pub struct SyntheticTransport {
    config: SyntheticConfig,
    link_bytes_per_second: f64,
    symbols: Vec<SymbolEntry>,
    channels: Vec<Channel>,
    stream: Option<Stream>,
    log: RegisterLog,
    stats: LinkStats,
    rng: XorShift,
    motor_running: bool,
}

impl SyntheticTransport {
    /// Create a simulated target behind a link running at `baud_rate`
    pub fn new(config: SyntheticConfig, baud_rate: u32) -> Self {
        let symbols = default_definitions()
            .iter()
            .enumerate()
            .map(|(i, def)| {
                SymbolEntry::new(
                    &def.identifier,
                    SYNTHETIC_BASE_ADDRESS + i as u32 * 4,
                    def.width.bytes() as u32,
                )
            })
            .collect();

        Self {
            rng: XorShift::new(config.seed),
            config,
            link_bytes_per_second: baud_rate as f64 / 10.0,
            symbols,
            channels: Vec::new(),
            stream: None,
            log: Arc::new(Mutex::new(Vec::new())),
            stats: LinkStats::default(),
            motor_running: false,
        }
    }

    /// Also expose these symbols through `enumerate_variables`
    pub fn with_symbols(mut self, symbols: impl IntoIterator<Item = SymbolEntry>) -> Self {
        self.symbols.extend(symbols);
        self
    }

    /// Handle to the register write log
    pub fn register_log(&self) -> RegisterLog {
        Arc::clone(&self.log)
    }

    /// Whether the last run/stop request left the motor running
    pub fn motor_running(&self) -> bool {
        self.motor_running
    }

    /// Override the pattern of an already configured channel
    pub fn set_pattern(&mut self, channel_index: usize, pattern: SignalPattern, noise: f64) {
        if let Some(channel) = self.channels.get_mut(channel_index) {
            channel.pattern = pattern;
            channel.noise = noise;
        }
    }

    fn produced_rows(&self, stream: &Stream, now: Instant) -> u64 {
        let end = stream.finished.unwrap_or(now).min(now);
        let t = end.saturating_duration_since(stream.started).as_secs_f64();
        let rows = (t * stream.rate_hz).floor() as u64 + 1;
        match self.config.max_samples {
            Some(max) => rows.min(max as u64),
            None => rows,
        }
    }

    fn sendable_rows(&self, stream: &Stream, now: Instant) -> u64 {
        if !self.config.link_limited || stream.row_bytes == 0 {
            return u64::MAX;
        }
        let t = now.saturating_duration_since(stream.started).as_secs_f64();
        (t * self.link_bytes_per_second / stream.row_bytes as f64).floor() as u64
    }

    fn generate_rows(&mut self, from: u64, to: u64, sample_factor: u32, rate_hz: f64) -> Vec<RawSample> {
        let mut samples = Vec::with_capacity(((to - from) as usize) * self.channels.len());
        for k in from..to {
            let t = k as f64 / rate_hz;
            let jitter = if self.config.tick_jitter > 0 {
                self.rng.next_u64() % (self.config.tick_jitter as u64 + 1)
            } else {
                0
            };
            let tick = k * sample_factor as u64 + jitter;
            for (index, channel) in self.channels.iter().enumerate() {
                let mut value = channel.pattern.value_at(k, t);
                if self.config.noise && channel.noise > 0.0 {
                    value += (self.rng.next_f64() - 0.5) * 2.0 * channel.noise;
                }
                let raw = channel.width.saturate(value.round() as i64);
                samples.push(RawSample::new(index, tick, raw));
            }
        }
        samples
    }
}

impl ScopeTransport for SyntheticTransport {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn configure(
        &mut self,
        channels: &[Arc<ScaledVariable>],
        sample_factor: u32,
    ) -> Result<(), TransportError> {
        if channels.is_empty() || sample_factor == 0 {
            return Err(TransportError::Nack {
                service: 0x01,
                status: 1,
            });
        }

        self.channels = channels
            .iter()
            .map(|var| {
                let (pattern, noise) = SignalPattern::for_identifier(&var.identifier);
                Channel {
                    pattern,
                    noise,
                    width: var.byte_width,
                }
            })
            .collect();

        self.stream = Some(Stream {
            started: Instant::now(),
            finished: None,
            rate_hz: effective_rate_hz(sample_factor),
            sample_factor,
            row_bytes: channels.iter().map(|v| v.byte_width.bytes()).sum(),
            delivered: 0,
            flush_limit: None,
            ended: false,
        });
        tracing::debug!(
            "Synthetic scope configured: {} channels, factor {}",
            channels.len(),
            sample_factor
        );
        Ok(())
    }

    fn write_register(
        &mut self,
        register: &ScaledVariable,
        value: i32,
        ack_timeout: Duration,
    ) -> Result<(), TransportError> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RegisterWrite {
                identifier: register.identifier.clone(),
                value,
            });

        if register.identifier == RUN_REQUEST && value != 0 {
            if !self.config.acknowledge_run {
                std::thread::sleep(ack_timeout);
                self.stats.record_timeout();
                return Err(TransportError::Timeout(ack_timeout));
            }
            self.motor_running = true;
        } else if register.identifier == STOP_REQUEST && value != 0 {
            self.motor_running = false;
        }

        self.stats.record_sent(register.byte_width.bytes() + 5);
        self.stats.record_register_write();
        Ok(())
    }

    fn read_samples(&mut self, timeout: Duration) -> Result<ReadOutcome, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let stream = self.stream.clone().ok_or(TransportError::NotConfigured)?;
            if stream.ended {
                return Ok(ReadOutcome::EndOfStream);
            }
            if let Some(limit) = self.config.fail_after_samples {
                if stream.delivered >= limit as u64 {
                    return Err(TransportError::Io("simulated link fault".to_string()));
                }
            }

            let now = Instant::now();
            let produced = self.produced_rows(&stream, now);
            let mut flush_limit = stream.flush_limit;
            let mut target = match flush_limit {
                Some(limit) => {
                    if stream.delivered >= limit {
                        self.stats.record_overrun();
                        return Err(TransportError::Overrun);
                    }
                    limit.min(produced)
                }
                None => {
                    let sendable = self.sendable_rows(&stream, now).min(produced);
                    let backlog = produced - sendable;
                    let capacity_rows = (self.config.buffer_capacity_bytes / stream.row_bytes.max(1)) as u64;
                    if backlog > capacity_rows {
                        let limit = (sendable + capacity_rows).min(produced);
                        flush_limit = Some(limit);
                        limit
                    } else {
                        sendable
                    }
                }
            };
            if let Some(limit) = self.config.fail_after_samples {
                target = target.min(limit as u64);
            }

            if target > stream.delivered {
                let samples =
                    self.generate_rows(stream.delivered, target, stream.sample_factor, stream.rate_hz);
                let bytes = (target - stream.delivered) as usize * stream.row_bytes;
                self.stats.record_samples(samples.len(), bytes);
                if let Some(s) = self.stream.as_mut() {
                    s.delivered = target;
                    s.flush_limit = flush_limit;
                }
                return Ok(ReadOutcome::Samples(samples));
            }
            if let Some(s) = self.stream.as_mut() {
                s.flush_limit = flush_limit;
            }

            let drained = stream.finished.is_some() && flush_limit.is_none() && stream.delivered >= produced;
            if drained && self.config.end_of_stream {
                if let Some(s) = self.stream.as_mut() {
                    s.ended = true;
                }
                return Ok(ReadOutcome::EndOfStream);
            }

            if now >= deadline {
                return Ok(ReadOutcome::Samples(Vec::new()));
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn finish_stream(&mut self) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConfigured)?;
        if stream.finished.is_none() {
            stream.finished = Some(Instant::now());
        }
        Ok(())
    }

    fn probe_capacity(&mut self) -> Option<usize> {
        self.config
            .report_capacity
            .then_some(self.config.buffer_capacity_bytes)
    }

    fn enumerate_variables(&mut self) -> Result<Vec<SymbolEntry>, TransportError> {
        Ok(self.symbols.clone())
    }

    fn stats(&self) -> LinkStats {
        self.stats.clone()
    }
}
