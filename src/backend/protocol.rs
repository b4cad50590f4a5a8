//! Serial scope protocol
//!
//! Frame building and parsing for the scope service of the motor-control
//! firmware's UART debug link.
//!
//! # Frame Layout
//!
//! ```text
//! 0x55 | LEN | SERVICE | PAYLOAD (LEN - 1 bytes) | CHECKSUM
//! ```
//!
//! `CHECKSUM` is the wrapping 8-bit sum of every preceding byte of the frame.
//! All integers are little-endian.
//!
//! # Services
//!
//! | Code | Direction | Payload |
//! |------|-----------|---------|
//! | `0x01` | host → device | `factor u16`, `count u8`, per channel `address u32`, `width u8` |
//! | `0x02` | host → device | `address u32`, `width u8`, `value i32` |
//! | `0x03` | device → host | `first_tick u32`, `count u8`, `count` interleaved rows |
//! | `0x04` | device → host | end of stream |
//! | `0x05` | device → host | sample buffer overrun |
//! | `0x06` | both | capacity query / `u32` reply, 0 = unknown |
//! | `0x07` | host → device | stop sampling and flush |
//! | `0x7E` | device → host | ack: `service u8`, `status u8` |
//! | `0x7F` | device → host | nack: `service u8`, `status u8` |

use crate::error::TransportError;
use crate::types::{ByteWidth, ScaledVariable};
use std::sync::Arc;

/// First byte of every frame
pub const START_OF_FRAME: u8 = 0x55;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD: usize = u8::MAX as usize - 1;

/// Service codes
pub mod service {
    pub const CONFIGURE: u8 = 0x01;
    pub const WRITE_REGISTER: u8 = 0x02;
    pub const SCOPE_DATA: u8 = 0x03;
    pub const END_OF_STREAM: u8 = 0x04;
    pub const OVERRUN: u8 = 0x05;
    pub const CAPACITY: u8 = 0x06;
    pub const STOP_STREAM: u8 = 0x07;
    pub const ACK: u8 = 0x7E;
    pub const NACK: u8 = 0x7F;
}

/// 8-bit wrapping sum
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// A decoded or to-be-encoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub service: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame, rejecting payloads that do not fit the length byte
    pub fn new(service: u8, payload: Vec<u8>) -> Result<Self, TransportError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(TransportError::Protocol(format!(
                "payload of {} bytes exceeds {} byte frame limit",
                payload.len(),
                MAX_PAYLOAD
            )));
        }
        Ok(Self { service, payload })
    }

    /// Scope configuration request
    pub fn configure(channels: &[Arc<ScaledVariable>], sample_factor: u32) -> Result<Self, TransportError> {
        let factor = u16::try_from(sample_factor).map_err(|_| {
            TransportError::Protocol(format!("sample factor {} does not fit the link", sample_factor))
        })?;
        let count = u8::try_from(channels.len())
            .map_err(|_| TransportError::Protocol(format!("{} channels", channels.len())))?;

        let mut payload = Vec::with_capacity(3 + channels.len() * 5);
        payload.extend_from_slice(&factor.to_le_bytes());
        payload.push(count);
        for var in channels {
            payload.extend_from_slice(&var.handle.0.to_le_bytes());
            payload.push(u8::from(var.byte_width));
        }
        Self::new(service::CONFIGURE, payload)
    }

    /// Register write request
    pub fn write_register(register: &ScaledVariable, value: i32) -> Self {
        let mut payload = Vec::with_capacity(9);
        payload.extend_from_slice(&register.handle.0.to_le_bytes());
        payload.push(u8::from(register.byte_width));
        payload.extend_from_slice(&register.byte_width.saturate(value as i64).to_le_bytes());
        Self {
            service: service::WRITE_REGISTER,
            payload,
        }
    }

    pub fn capacity_query() -> Self {
        Self {
            service: service::CAPACITY,
            payload: Vec::new(),
        }
    }

    pub fn stop_stream() -> Self {
        Self {
            service: service::STOP_STREAM,
            payload: Vec::new(),
        }
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 4);
        bytes.push(START_OF_FRAME);
        bytes.push((self.payload.len() + 1) as u8);
        bytes.push(self.service);
        bytes.extend_from_slice(&self.payload);
        bytes.push(checksum(&bytes));
        bytes
    }
}

/// Message sent by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    Ack { service: u8, status: u8 },
    Nack { service: u8, status: u8 },
    /// Rows of interleaved channel values, one row per sample tick
    ScopeData { first_tick: u32, rows: Vec<Vec<i32>> },
    EndOfStream,
    Overrun,
    /// Buffer size in bytes, 0 when unknown
    Capacity(u32),
}

impl DeviceMessage {
    /// Interpret a frame given the widths of the configured channels
    pub fn parse(frame: &Frame, widths: &[ByteWidth]) -> Result<Self, TransportError> {
        let p = &frame.payload;
        match frame.service {
            service::ACK | service::NACK => {
                if p.len() < 2 {
                    return Err(TransportError::Protocol("short acknowledgement".into()));
                }
                Ok(if frame.service == service::ACK {
                    DeviceMessage::Ack {
                        service: p[0],
                        status: p[1],
                    }
                } else {
                    DeviceMessage::Nack {
                        service: p[0],
                        status: p[1],
                    }
                })
            }
            service::SCOPE_DATA => Self::parse_scope_data(p, widths),
            service::END_OF_STREAM => Ok(DeviceMessage::EndOfStream),
            service::OVERRUN => Ok(DeviceMessage::Overrun),
            service::CAPACITY => {
                let bytes: [u8; 4] = p
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| TransportError::Protocol("short capacity reply".into()))?;
                Ok(DeviceMessage::Capacity(u32::from_le_bytes(bytes)))
            }
            other => Err(TransportError::Protocol(format!(
                "unexpected service 0x{:02X}",
                other
            ))),
        }
    }

    fn parse_scope_data(p: &[u8], widths: &[ByteWidth]) -> Result<Self, TransportError> {
        if widths.is_empty() {
            return Err(TransportError::NotConfigured);
        }
        if p.len() < 5 {
            return Err(TransportError::Protocol("short scope data header".into()));
        }
        let first_tick = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
        let count = p[4] as usize;
        let row_bytes: usize = widths.iter().map(|w| w.bytes()).sum();
        let body = &p[5..];
        if body.len() != count * row_bytes {
            return Err(TransportError::Protocol(format!(
                "scope data carries {} bytes, expected {} rows of {} bytes",
                body.len(),
                count,
                row_bytes
            )));
        }

        let mut rows = Vec::with_capacity(count);
        for chunk in body.chunks_exact(row_bytes) {
            let mut offset = 0;
            let mut row = Vec::with_capacity(widths.len());
            for width in widths {
                let value = width
                    .decode(&chunk[offset..])
                    .ok_or_else(|| TransportError::Protocol("truncated row".into()))?;
                row.push(value);
                offset += width.bytes();
            }
            rows.push(row);
        }
        Ok(DeviceMessage::ScopeData { first_tick, rows })
    }
}

/// Incremental frame decoder
///
/// Bytes are pushed as they arrive. Garbage before a start byte is skipped,
/// and a frame with a bad checksum is dropped by resynchronising on the next
/// start byte after it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    checksum_errors: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.buffer.iter().position(|&b| b == START_OF_FRAME) {
                Some(start) => {
                    self.buffer.drain(..start);
                }
                None => {
                    self.buffer.clear();
                    return None;
                }
            }

            if self.buffer.len() < 2 {
                return None;
            }
            let len = self.buffer[1] as usize;
            if len == 0 {
                self.buffer.drain(..1);
                continue;
            }
            let total = len + 3;
            if self.buffer.len() < total {
                return None;
            }
            if checksum(&self.buffer[..total - 1]) != self.buffer[total - 1] {
                self.checksum_errors += 1;
                self.buffer.drain(..1);
                continue;
            }

            let frame = Frame {
                service: self.buffer[2],
                payload: self.buffer[3..total - 1].to_vec(),
            };
            self.buffer.drain(..total);
            return Some(frame);
        }
    }

    /// Frames dropped for a bad checksum since creation
    pub fn checksum_errors(&self) -> u64 {
        self.checksum_errors
    }

    /// Bytes waiting for a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VariableHandle;

    fn scope_frame(first_tick: u32, rows: &[&[i32]], widths: &[ByteWidth]) -> Frame {
        let mut payload = first_tick.to_le_bytes().to_vec();
        payload.push(rows.len() as u8);
        for row in rows {
            for (value, width) in row.iter().zip(widths) {
                payload.extend(width.encode(*value));
            }
        }
        Frame::new(service::SCOPE_DATA, payload).unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let bytes = Frame::stop_stream().encode();
        assert_eq!(bytes, vec![0x55, 0x01, 0x07, 0x5D]);

        let var = ScaledVariable::new("run", VariableHandle(0x2000_0010), ByteWidth::Two);
        let bytes = Frame::write_register(&var, 1).encode();
        assert_eq!(bytes[1] as usize, bytes.len() - 3);
        assert_eq!(&bytes[3..7], &[0x10, 0x00, 0x00, 0x20]);
        assert_eq!(bytes[7], 2);
        assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
        assert_eq!(*bytes.last().unwrap(), checksum(&bytes[..bytes.len() - 1]));
    }

    #[test]
    fn test_configure_frame() {
        let channels = vec![
            Arc::new(ScaledVariable::new("a", VariableHandle(0x100), ByteWidth::Two)),
            Arc::new(ScaledVariable::new("b", VariableHandle(0x200), ByteWidth::Four)),
        ];
        let frame = Frame::configure(&channels, 20).unwrap();
        assert_eq!(frame.payload[..3], [20, 0, 2]);
        assert_eq!(frame.payload.len(), 3 + 10);
        assert_eq!(frame.payload[7], 2);
        assert_eq!(frame.payload[12], 4);

        assert!(matches!(
            Frame::configure(&channels, 70_000),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_decoder_handles_split_and_garbage() {
        let mut wire = vec![0x00, 0xFF, 0x13];
        wire.extend(Frame::capacity_query().encode());
        wire.extend(Frame::stop_stream().encode());

        let mut decoder = FrameDecoder::new();
        let (a, b) = wire.split_at(5);
        decoder.push(a);
        assert_eq!(decoder.next_frame(), None);
        decoder.push(b);
        assert_eq!(decoder.next_frame().unwrap().service, service::CAPACITY);
        assert_eq!(decoder.next_frame().unwrap().service, service::STOP_STREAM);
        assert_eq!(decoder.next_frame(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_resyncs_after_bad_checksum() {
        let mut corrupt = Frame::capacity_query().encode();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;

        let mut decoder = FrameDecoder::new();
        decoder.push(&corrupt);
        decoder.push(&Frame::stop_stream().encode());
        assert_eq!(decoder.next_frame().unwrap(), Frame::stop_stream());
        assert_eq!(decoder.checksum_errors(), 1);
    }

    #[test]
    fn test_parse_scope_data_mixed_widths() {
        let widths = [ByteWidth::Two, ByteWidth::Four];
        let frame = scope_frame(400, &[&[-1, 70_000], &[5, -70_000]], &widths);
        let msg = DeviceMessage::parse(&frame, &widths).unwrap();
        assert_eq!(
            msg,
            DeviceMessage::ScopeData {
                first_tick: 400,
                rows: vec![vec![-1, 70_000], vec![5, -70_000]],
            }
        );
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let frame = scope_frame(0, &[&[1, 2]], &[ByteWidth::Two, ByteWidth::Two]);
        let res = DeviceMessage::parse(&frame, &[ByteWidth::Four, ByteWidth::Four]);
        assert!(matches!(res, Err(TransportError::Protocol(_))));
        assert_eq!(
            DeviceMessage::parse(&frame, &[]),
            Err(TransportError::NotConfigured)
        );
    }

    #[test]
    fn test_parse_control_messages() {
        let ack = Frame::new(service::ACK, vec![service::WRITE_REGISTER, 0]).unwrap();
        assert_eq!(
            DeviceMessage::parse(&ack, &[]).unwrap(),
            DeviceMessage::Ack {
                service: service::WRITE_REGISTER,
                status: 0
            }
        );
        let cap = Frame::new(service::CAPACITY, 4096u32.to_le_bytes().to_vec()).unwrap();
        assert_eq!(
            DeviceMessage::parse(&cap, &[]).unwrap(),
            DeviceMessage::Capacity(4096)
        );
        let unknown = Frame::new(0x42, vec![]).unwrap();
        assert!(DeviceMessage::parse(&unknown, &[]).is_err());
    }
}
