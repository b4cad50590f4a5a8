//! Backend module for the serial debug link
//!
//! This module contains everything that talks to the target: the transport
//! abstraction and its implementations, the wire codec, ELF symbol lookup
//! and the worker thread that drives capture sessions.
//!
//! # Architecture
//!
//! Capture sessions run on a dedicated thread, communicating via channels:
//!
//! - [`CaptureWorker`] - Spawns the thread that owns the transport for one session
//! - [`SessionEvent`] - Notifications sent from the worker to the caller
//! - [`SharedTransport`] - Transport handle shared between engine and worker
//!
//! # Components
//!
//! - [`ScopeTransport`] - Capability set every link implements
//! - [`SerialTransport`] - Framed protocol over a COM port (feature `serial`)
//! - [`SyntheticTransport`] - Simulated target for testing without hardware
//! - [`protocol`] - Frame codec shared by the serial link
//! - [`ElfParser`] - Reads data symbols from a firmware image
//!
//! # Example
//!
//! ```ignore
//! use motorscope::backend::open_transport;
//! use motorscope::config::AppConfig;
//!
//! let config = AppConfig::sample();
//! let (transport, symbols) = open_transport(&config)?;
//! println!("{} link with {} symbols", transport.name(), symbols.len());
//! ```

pub mod elf_parser;
pub mod protocol;
pub mod serial;
pub mod synthetic;
pub mod transport_trait;
pub mod worker;

pub use elf_parser::{ElfParser, ElfSymbols};
pub use serial::SerialTransport;
pub use synthetic::{RegisterLog, RegisterWrite, SignalPattern, SyntheticConfig, SyntheticTransport};
pub use transport_trait::{LinkStats, ReadOutcome, ScopeTransport};
pub use worker::{share_transport, CaptureWorker, EventSender, SessionEvent, SharedTransport};

use crate::config::{AppConfig, TransportKind};
use crate::error::{Result, ResultExt, ScopeError};
use crate::registry::{SymbolEntry, SymbolMap};

/// Construct the configured transport and the symbols to resolve variables with
///
/// Symbols come from the firmware ELF when one is configured, otherwise from
/// the transport's own variable list.
pub fn open_transport(config: &AppConfig) -> Result<(Box<dyn ScopeTransport>, SymbolMap)> {
    let elf_symbols = match &config.link.elf_path {
        Some(path) => {
            let elf = ElfParser::parse(path)?;
            tracing::info!("Loaded {} symbols from {}", elf.len(), path.display());
            Some(elf.entries)
        }
        None => None,
    };

    let mut transport: Box<dyn ScopeTransport> = match config.link.transport {
        TransportKind::Synthetic => {
            tracing::info!("Using synthetic target at {} baud", config.link.baud_rate);
            Box::new(
                SyntheticTransport::new(config.synthetic.clone(), config.link.baud_rate)
                    .with_symbols(extra_synthetic_symbols(config)),
            )
        }
        TransportKind::Serial => open_serial(config, elf_symbols.clone().unwrap_or_default())?,
    };

    let symbols = match elf_symbols {
        Some(entries) => SymbolMap::from_entries(entries),
        None => SymbolMap::from_entries(
            transport
                .enumerate_variables()
                .context("Failed to enumerate target variables")?,
        ),
    };
    Ok((transport, symbols))
}

#[cfg(feature = "serial")]
fn open_serial(config: &AppConfig, symbols: Vec<SymbolEntry>) -> Result<Box<dyn ScopeTransport>> {
    let port = config.link.port.as_deref().ok_or_else(|| {
        ScopeError::Config("link.port must be set for the serial transport".to_string())
    })?;
    let transport = SerialTransport::open(port, config.link.baud_rate, config.link.command_timeout())
        .with_context(|| format!("Failed to open {}", port))?;
    Ok(Box::new(transport.with_symbols(symbols)))
}

#[cfg(not(feature = "serial"))]
fn open_serial(_config: &AppConfig, _symbols: Vec<SymbolEntry>) -> Result<Box<dyn ScopeTransport>> {
    Err(ScopeError::Config(
        "serial transport support is not compiled in (enable the `serial` feature)".to_string(),
    ))
}

/// Addresses for configured variables the simulator does not know by default
fn extra_synthetic_symbols(config: &AppConfig) -> Vec<SymbolEntry> {
    let known = crate::registry::default_definitions();
    let base = synthetic::SYNTHETIC_BASE_ADDRESS + known.len() as u32 * 4;
    config
        .variables
        .iter()
        .filter(|def| def.address.is_none())
        .filter(|def| !known.iter().any(|k| k.identifier == def.identifier))
        .enumerate()
        .map(|(i, def)| {
            SymbolEntry::new(
                def.symbol.as_deref().unwrap_or(&def.identifier),
                base + i as u32 * 4,
                def.width.bytes() as u32,
            )
        })
        .collect()
}
