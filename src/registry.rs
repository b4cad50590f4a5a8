//! Variable registry
//!
//! The registry owns every [`ScaledVariable`] the engine knows about and hands
//! out shared references to them. Capture requests, sessions and datasets all
//! hold `Arc<ScaledVariable>` so a variable's width and scale cannot drift
//! while a capture is running.
//!
//! Variables are described by [`VariableDefinition`]s (usually from the
//! configuration file) and resolved to device addresses through a
//! [`SymbolMap`], which is built either from the firmware ELF or from the
//! transport's own variable enumeration.
//!
//! # Example
//!
//! ```ignore
//! use motorscope::registry::{default_definitions, SymbolMap, VariableRegistry};
//!
//! let symbols = SymbolMap::from_entries(transport.enumerate_variables()?);
//! let registry = VariableRegistry::from_definitions(&default_definitions(), &symbols)?;
//! let channels = registry.select(&["Idq_q", "Idq_d"])?;
//! ```

use crate::error::{Result, ScopeError};
use crate::types::{ByteWidth, ScaledVariable, VariableHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Firmware identifier of the run request register
pub const RUN_REQUEST: &str = "motor.apiData.runMotorRequest";

/// Firmware identifier of the stop request register
pub const STOP_REQUEST: &str = "motor.apiData.stopMotorRequest";

/// Firmware identifier of the velocity reference register
pub const VELOCITY_REFERENCE: &str = "motor.apiData.velocityReference";

/// Firmware identifier of the on-board hardware UI enable flag
pub const HARDWARE_UI_ENABLED: &str = "app.hardwareUiEnabled";

/// A named device address, as reported by an ELF file or a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    /// Symbol or dotted variable name
    pub name: String,
    /// Device address
    pub address: u32,
    /// Size in bytes, 0 when unknown
    pub size: u32,
}

impl SymbolEntry {
    pub fn new(name: impl Into<String>, address: u32, size: u32) -> Self {
        Self {
            name: name.into(),
            address,
            size,
        }
    }
}

/// Name to address lookup table
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    entries: HashMap<String, SymbolEntry>,
}

impl SymbolMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from entries; later duplicates replace earlier ones
    pub fn from_entries(entries: impl IntoIterator<Item = SymbolEntry>) -> Self {
        let mut map = Self::new();
        map.extend(entries);
        map
    }

    /// Merge more entries into the map
    pub fn extend(&mut self, entries: impl IntoIterator<Item = SymbolEntry>) {
        for entry in entries {
            self.entries.insert(entry.name.clone(), entry);
        }
    }

    /// Look up a symbol by name
    pub fn get(&self, name: &str) -> Option<&SymbolEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serializable description of a variable before address resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    /// Firmware identifier
    pub identifier: String,

    /// Short display name (defaults to the identifier)
    #[serde(default)]
    pub label: Option<String>,

    /// Width on the wire
    #[serde(default = "default_width")]
    pub width: ByteWidth,

    /// Raw-to-engineering multiplier
    #[serde(default = "default_scale")]
    pub scale_factor: f64,

    /// Engineering unit
    #[serde(default)]
    pub unit: String,

    /// Fixed address, skips symbol lookup
    #[serde(default)]
    pub address: Option<u32>,

    /// Symbol to resolve (defaults to the identifier)
    #[serde(default)]
    pub symbol: Option<String>,

    /// Byte offset added to the resolved symbol address
    #[serde(default)]
    pub offset: u32,
}

fn default_width() -> ByteWidth {
    ByteWidth::Two
}

fn default_scale() -> f64 {
    1.0
}

impl VariableDefinition {
    /// Create a 2-byte, unit-scale definition
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            label: None,
            width: default_width(),
            scale_factor: default_scale(),
            unit: String::new(),
            address: None,
            symbol: None,
            offset: 0,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_width(mut self, width: ByteWidth) -> Self {
        self.width = width;
        self
    }

    pub fn with_scale(mut self, scale_factor: f64) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    pub fn with_address(mut self, address: u32) -> Self {
        self.address = Some(address);
        self
    }

    /// Resolve the device address of this definition
    pub fn resolve(&self, symbols: &SymbolMap) -> Result<VariableHandle> {
        if let Some(address) = self.address {
            return Ok(VariableHandle(address));
        }
        let name = self.symbol.as_deref().unwrap_or(&self.identifier);
        symbols
            .get(name)
            .map(|entry| VariableHandle(entry.address.wrapping_add(self.offset)))
            .ok_or_else(|| ScopeError::UnresolvedSymbol(self.identifier.clone()))
    }

    /// Resolve into a registry variable
    pub fn to_variable(&self, symbols: &SymbolMap) -> Result<ScaledVariable> {
        let handle = self.resolve(symbols)?;
        let mut var = ScaledVariable::new(&self.identifier, handle, self.width)
            .with_scale(self.scale_factor)
            .with_unit(&self.unit);
        if let Some(label) = &self.label {
            var = var.with_label(label);
        }
        Ok(var)
    }
}

/// Default variable set of a field-oriented motor control application
///
/// Monitored signals first, then the control registers the session writes.
pub fn default_definitions() -> Vec<VariableDefinition> {
    vec![
        VariableDefinition::new("motor.idqCmd.q")
            .with_label("idqCmd_q")
            .with_unit("A"),
        VariableDefinition::new("motor.idq.q")
            .with_label("Idq_q")
            .with_unit("A"),
        VariableDefinition::new("motor.idq.d")
            .with_label("Idq_d")
            .with_unit("A"),
        VariableDefinition::new("motor.omegaElectrical")
            .with_label("OmegaElectrical")
            .with_unit("RPM"),
        VariableDefinition::new("motor.omegaCmd")
            .with_label("OmegaCmd")
            .with_unit("RPM"),
        VariableDefinition::new(HARDWARE_UI_ENABLED),
        VariableDefinition::new(VELOCITY_REFERENCE),
        VariableDefinition::new(RUN_REQUEST),
        VariableDefinition::new(STOP_REQUEST),
    ]
}

/// Registry of capturable variables
#[derive(Debug, Clone, Default)]
pub struct VariableRegistry {
    variables: Vec<Arc<ScaledVariable>>,
}

impl VariableRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve and register every definition
    ///
    /// Fails on the first definition whose address cannot be resolved.
    pub fn from_definitions(definitions: &[VariableDefinition], symbols: &SymbolMap) -> Result<Self> {
        let mut registry = Self::new();
        for def in definitions {
            registry.register(def.to_variable(symbols)?)?;
        }
        Ok(registry)
    }

    /// Add a variable; identifiers and labels must be unique
    pub fn register(&mut self, variable: ScaledVariable) -> Result<Arc<ScaledVariable>> {
        if self.get(&variable.identifier).is_some() || self.get(&variable.label).is_some() {
            return Err(ScopeError::DuplicateVariable(variable.identifier));
        }
        let var = Arc::new(variable);
        self.variables.push(Arc::clone(&var));
        Ok(var)
    }

    /// Look up by identifier or label
    pub fn get(&self, name: &str) -> Option<Arc<ScaledVariable>> {
        self.variables.iter().find(|v| v.matches(name)).cloned()
    }

    /// Look up by identifier or label, failing if absent
    pub fn require(&self, name: &str) -> Result<Arc<ScaledVariable>> {
        self.get(name)
            .ok_or_else(|| ScopeError::UnknownVariable(name.to_string()))
    }

    /// Look up several variables, preserving order
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<ScaledVariable>>> {
        names.iter().map(|n| self.require(n.as_ref())).collect()
    }

    /// Replace a variable's scale factor
    ///
    /// Sessions that already hold the old variable keep the old factor.
    pub fn set_scale(&mut self, name: &str, scale_factor: f64) -> Result<Arc<ScaledVariable>> {
        let slot = self
            .variables
            .iter_mut()
            .find(|v| v.matches(name))
            .ok_or_else(|| ScopeError::UnknownVariable(name.to_string()))?;
        let updated = Arc::new((**slot).clone().with_scale(scale_factor));
        *slot = Arc::clone(&updated);
        Ok(updated)
    }

    /// First variable with the smallest byte width
    pub fn narrowest(&self) -> Option<Arc<ScaledVariable>> {
        self.variables
            .iter()
            .min_by_key(|v| v.byte_width)
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ScaledVariable>> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
