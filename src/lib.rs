//! # motorscope: Capture Planning & Acquisition Engine
//!
//! Plans, runs and post-processes high-rate captures of motor-control
//! telemetry over a serial debug link. The device samples a handful of
//! firmware variables every `sample_factor` control ticks of a fixed 20 kHz
//! loop and streams the raw values back; the host turns them into a uniform,
//! engineering-unit dataset.
//!
//! ## Architecture
//!
//! - **Registry**: variable identifiers with byte width, address and scale
//! - **Analysis**: feasibility estimation, time-axis reconstruction and
//!   scaling, all pure and thread-safe
//! - **Session**: the arm → stream → stop state machine and the buffer probe
//! - **Backend**: transports (serial, synthetic) and the capture worker thread
//! - **Engine**: the single-session API a front end talks to
//! - **Communication**: Crossbeam channels for session notifications
//!
//! ## Configuration
//!
//! The engine is configured from a TOML file in the platform-appropriate
//! config directory under `motorscope/`:
//!
//! - **Linux**: `~/.config/motorscope/config.toml`
//! - **macOS**: `~/Library/Application Support/motorscope/config.toml`
//! - **Windows**: `%APPDATA%\motorscope\config.toml`
//!
//! ## Example
//!
//! ```ignore
//! use motorscope::{AppConfig, CaptureEngine, RiskLevel};
//!
//! fn main() -> motorscope::Result<()> {
//!     let engine = CaptureEngine::from_config(&AppConfig::sample())?;
//!
//!     let request = engine.build_request(&["idqCmd_q", "Idq_q"], 20, 2.0)?;
//!     let report = engine.get_feasibility(&request);
//!     if report.risk == RiskLevel::Red {
//!         println!("{}", report.notes.join("\n"));
//!     }
//!
//!     let handle = engine.start_capture(request)?;
//!     engine.wait(&handle)?;
//!     let result = engine.get_result(&handle)?;
//!     println!("{} samples per channel", result.dataset.len());
//!     engine.discard(&handle)
//! }
//! ```

pub mod analysis;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use analysis::{FeasibilityReport, RiskLevel, ScaledDataset, UnderDelivery};
pub use backend::{ScopeTransport, SessionEvent};
pub use config::AppConfig;
pub use engine::{CaptureEngine, CaptureResult, RawOutcome, SessionHandle};
pub use error::{Result, ScopeError, TransportError, ValidationError};
pub use registry::VariableRegistry;
pub use session::{CaptureRequest, SessionState, SessionStatus, StopReason};
pub use types::{RawSample, ScaledVariable};
