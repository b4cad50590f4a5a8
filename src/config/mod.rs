//! Configuration module for motorscope
//!
//! This module handles the persistent configuration of the capture engine:
//! - Which transport to use and how to reach the target
//! - Capture defaults (sample factor, duration, selected variables)
//! - Session timeouts, buffer probe and motor register settings
//! - The variable definitions the registry is built from
//!
//! # Config Location
//!
//! The configuration file is stored in the platform-appropriate location:
//! - **Linux**: `~/.config/motorscope/config.toml`
//! - **macOS**: `~/Library/Application Support/motorscope/config.toml`
//! - **Windows**: `%APPDATA%\motorscope\config.toml`
//!
//! Every section and field is optional; missing values take their defaults.
//!
//! # Example
//!
//! ```ignore
//! use motorscope::config::AppConfig;
//!
//! let mut config = AppConfig::load_or_default();
//! config.capture.sample_factor = 40;
//! config.validate()?;
//! config.save()?;
//! ```

pub mod settings;

pub use settings::*;

use crate::backend::SyntheticConfig;
use crate::error::{Result, ScopeError};
use crate::registry::{default_definitions, VariableDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "motorscope";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Baud rates the firmware's debug UART supports
pub const SUPPORTED_BAUD_RATES: [u32; 4] = [115_200, 230_400, 460_800, 921_600];

/// Default baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

// ==================== Config Directory ====================

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Ensure the configuration directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().ok_or_else(|| {
        ScopeError::Config("Could not determine config directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            ScopeError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the default config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Link Config ====================

/// Which transport implementation to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// UART debug link
    #[default]
    Serial,
    /// Simulated target
    Synthetic,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "Serial"),
            TransportKind::Synthetic => write!(f, "Synthetic"),
        }
    }
}

/// Debug link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Transport implementation
    pub transport: TransportKind,

    /// Serial port path (e.g., "/dev/ttyACM0" or "COM3")
    pub port: Option<String>,

    /// UART baud rate
    pub baud_rate: u32,

    /// Firmware ELF used to resolve variable addresses
    pub elf_path: Option<PathBuf>,

    /// Timeout for configure and capacity replies in milliseconds
    pub command_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            elf_path: None,
            command_timeout_ms: 250,
        }
    }
}

impl LinkConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

// ==================== Capture Config ====================

/// Defaults for a capture started from the command line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Control ticks between samples
    pub sample_factor: u32,

    /// Capture length in seconds
    pub duration_seconds: f64,

    /// Allow rates above the guard limit
    pub guard_override: bool,

    /// Variables to capture, by identifier or label
    pub variables: Vec<String>,

    /// Capacity of the session event channel
    pub event_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_factor: 20,
            duration_seconds: 2.0,
            guard_override: false,
            variables: vec!["idqCmd_q".to_string(), "Idq_q".to_string()],
            event_capacity: 64,
        }
    }
}

// ==================== App Config ====================

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub link: LinkConfig,
    pub capture: CaptureConfig,
    pub timeouts: SessionTimeouts,
    pub probe: ProbeSettings,
    pub motor: MotorSettings,
    pub synthetic: SyntheticConfig,

    /// Variables known to the registry
    pub variables: Vec<VariableDefinition>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            capture: CaptureConfig::default(),
            timeouts: SessionTimeouts::default(),
            probe: ProbeSettings::default(),
            motor: MotorSettings::default(),
            synthetic: SyntheticConfig::default(),
            variables: default_definitions(),
        }
    }
}

impl AppConfig {
    /// Configuration that runs against the simulated target out of the box
    pub fn sample() -> Self {
        let mut config = Self::default();
        config.link.transport = TransportKind::Synthetic;
        config
    }

    /// Load the config from the default location
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = config_path().ok_or_else(|| {
            ScopeError::Config("Could not determine config path".to_string())
        })?;

        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load and validate a config file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScopeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            ScopeError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config to the default location
    pub fn save(&self) -> Result<PathBuf> {
        let dir = ensure_config_dir()?;
        let path = dir.join(CONFIG_FILE);
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save the config to a specific file
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ScopeError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| ScopeError::Config(format!("Failed to write config: {}", e)))
    }

    /// Check values that would only fail much later
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_BAUD_RATES.contains(&self.link.baud_rate) {
            tracing::warn!(
                "Baud rate {} is not one of the firmware rates {:?}",
                self.link.baud_rate,
                SUPPORTED_BAUD_RATES
            );
        }
        if self.link.baud_rate == 0 {
            return Err(ScopeError::Config("link.baud_rate must be positive".to_string()));
        }
        if self.link.transport == TransportKind::Serial && self.link.port.is_none() {
            tracing::debug!("No serial port configured; one must be given on the command line");
        }
        if self.capture.event_capacity == 0 {
            return Err(ScopeError::Config(
                "capture.event_capacity must be positive".to_string(),
            ));
        }
        if !(self.motor.rpm_per_count.is_finite() && self.motor.rpm_per_count > 0.0) {
            return Err(ScopeError::Config(
                "motor.rpm_per_count must be a positive number".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for def in &self.variables {
            if !seen.insert(def.identifier.as_str()) {
                return Err(ScopeError::Config(format!(
                    "variable {} is defined twice",
                    def.identifier
                )));
            }
            if !def.scale_factor.is_finite() {
                return Err(ScopeError::Config(format!(
                    "variable {} has a non-finite scale factor",
                    def.identifier
                )));
            }
        }
        Ok(())
    }

    /// Definition of a variable by identifier or label
    pub fn find_variable(&self, name: &str) -> Option<&VariableDefinition> {
        self.variables
            .iter()
            .find(|d| d.identifier == name || d.label.as_deref() == Some(name))
    }
}

// ==================== Utilities ====================

/// Helper to format bytes as human-readable size
pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

// ==================== Tests ====================
