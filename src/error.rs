//! Error handling for motorscope
//!
//! This module defines the error taxonomy of the capture engine and a Result
//! alias for use throughout the crate.
//!
//! - [`ValidationError`] - a capture request violated an arming invariant
//! - [`TransportError`] - the debug link failed while configuring or streaming
//! - [`ScopeError`] - everything the engine can hand back to its caller

use thiserror::Error;

/// A violated capture request invariant, detected while arming
///
/// Each variant maps to exactly one invariant so callers can tell the user
/// which parameter to fix.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// No variables were selected
    #[error("at least one channel must be selected")]
    EmptyChannelList,

    /// More variables than the device scope supports
    #[error("{count} channels requested, at most {max} are supported")]
    TooManyChannels { count: usize, max: usize },

    /// Sample factor below one
    #[error("sample factor must be at least 1, got {0}")]
    InvalidSampleFactor(u32),

    /// Sample factor implies a rate above the guard limit without an override
    #[error(
        "sample factor {sample_factor} gives {rate_hz:.1} Hz, above the {limit_hz:.0} Hz guard (minimum factor {min_factor})"
    )]
    GuardViolated {
        sample_factor: u32,
        rate_hz: f64,
        limit_hz: f64,
        min_factor: u32,
    },

    /// Duration is zero, negative or not a number
    #[error("capture duration must be a positive number of seconds, got {0}")]
    InvalidDuration(f64),

    /// Baud rate of zero
    #[error("baud rate must be positive")]
    InvalidBaudRate,

    /// Speed command cannot be converted to register counts
    #[error("speed command of {rpm} RPM with {rpm_per_count} RPM per count is not representable")]
    InvalidSpeedCommand { rpm: f64, rpm_per_count: f64 },
}

/// Failures of the debug link
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Low level I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Operation did not complete in time
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Device buffer overflowed and samples were lost
    #[error("device sample buffer overrun")]
    Overrun,

    /// Malformed or unexpected frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Device rejected a request
    #[error("device rejected service 0x{service:02X} with status {status}")]
    Nack { service: u8, status: u8 },

    /// Sampling requested before the scope was configured
    #[error("scope channels are not configured")]
    NotConfigured,

    /// The link is gone
    #[error("link disconnected")]
    Disconnected,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => TransportError::Disconnected,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Main error type for motorscope operations
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Request rejected before the session left Idle
    #[error("Invalid capture request: {0}")]
    Validation(#[from] ValidationError),

    /// Target did not acknowledge the run request
    #[error("Target did not acknowledge the run request within {0:?}")]
    ArmTimeout(std::time::Duration),

    /// Debug link failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Buffer size could not be determined
    #[error("Buffer probe unavailable: {0}")]
    ProbeUnavailable(String),

    /// Another session occupies the single session slot
    #[error("Capture session slot is busy ({state})")]
    SessionConflict { state: &'static str },

    /// Result requested before the session reached a terminal state
    #[error("Session is still {state}")]
    SessionNotFinished { state: &'static str },

    /// Handle does not refer to the current session
    #[error("Unknown session {0}")]
    UnknownSession(u64),

    /// Identifier not present in the registry
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    /// Identifier registered twice
    #[error("Variable already registered: {0}")]
    DuplicateVariable(String),

    /// Variable has no address and its symbol could not be found
    #[error("Could not resolve address of {0}")]
    UnresolvedSymbol(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to ELF file parsing
    #[error("ELF parsing error: {0}")]
    ElfParsing(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ScopeError>,
    },
}

impl ScopeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ScopeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip context wrappers down to the underlying error
    pub fn root(&self) -> &ScopeError {
        match self {
            ScopeError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is a request validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self.root(), ScopeError::Validation(_))
    }

    /// Whether this is a session slot conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), ScopeError::SessionConflict { .. })
    }
}

/// Result type alias for motorscope operations
pub type Result<T> = std::result::Result<T, ScopeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, TransportError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ScopeError::Transport(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ScopeError::Transport(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScopeError::UnknownVariable("motor.idq.z".to_string());
        assert_eq!(err.to_string(), "Unknown variable: motor.idq.z");
    }

    #[test]
    fn test_error_with_context() {
        let err = ScopeError::Config("bad baud".to_string());
        let with_ctx = err.with_context("Failed to load config");
        assert!(with_ctx.to_string().contains("Failed to load config"));
        assert!(matches!(with_ctx.root(), ScopeError::Config(_)));
    }

    #[test]
    fn test_guard_violation_message() {
        let err = ValidationError::GuardViolated {
            sample_factor: 10,
            rate_hz: 2000.0,
            limit_hz: 1000.0,
            min_factor: 20,
        };
        let msg = err.to_string();
        assert!(msg.contains("2000.0 Hz"));
        assert!(msg.contains("minimum factor 20"));
    }

    #[test]
    fn test_validation_wraps_into_scope_error() {
        let err: ScopeError = ValidationError::EmptyChannelList.into();
        assert!(err.is_validation());
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_io_error_maps_to_disconnect() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(TransportError::from(io), TransportError::Disconnected);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "framing");
        assert!(matches!(TransportError::from(io), TransportError::Io(_)));
    }

    #[test]
    fn test_transport_result_context() {
        let res: std::result::Result<(), TransportError> = Err(TransportError::Overrun);
        let err = res.context("while draining").unwrap_err();
        assert!(err.to_string().contains("while draining"));
        assert!(matches!(
            err.root(),
            ScopeError::Transport(TransportError::Overrun)
        ));
    }
}
