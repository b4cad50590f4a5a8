//! Firmware ELF symbol table
//!
//! Reads the data symbols of the motor-control firmware so variable
//! definitions can be resolved to device addresses without hard-coding them.
//! Only symbols that live in memory (data, bss, and unknown-kind symbols with
//! a size) are kept; functions, sections, files and debug symbols are skipped.

use crate::error::{Result, ScopeError};
use crate::registry::{SymbolEntry, SymbolMap};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use std::fs;
use std::path::Path;

/// Data symbols extracted from an ELF file
#[derive(Debug, Clone, Default)]
pub struct ElfSymbols {
    /// Path the symbols were read from
    pub path: String,
    /// Machine type (e.g., Arm)
    pub machine: String,
    /// Whether this is little-endian
    pub is_little_endian: bool,
    /// Data symbols in file order
    pub entries: Vec<SymbolEntry>,
}

impl ElfSymbols {
    /// Find a symbol by name
    pub fn find(&self, name: &str) -> Option<&SymbolEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookup table for variable resolution
    pub fn to_symbol_map(&self) -> SymbolMap {
        SymbolMap::from_entries(self.entries.iter().cloned())
    }
}

/// ELF parser for extracting data symbols
pub struct ElfParser;

impl ElfParser {
    /// Parse an ELF file from a path
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<ElfSymbols> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| {
            ScopeError::ElfParsing(format!("Failed to read file {}: {}", path.display(), e))
        })?;

        Self::parse_bytes(&data, path.to_string_lossy().as_ref())
    }

    /// Parse ELF data from bytes
    pub fn parse_bytes(data: &[u8], path: &str) -> Result<ElfSymbols> {
        let file = object::File::parse(data)
            .map_err(|e| ScopeError::ElfParsing(format!("Failed to parse ELF: {}", e)))?;

        let mut symbols = ElfSymbols {
            path: path.to_string(),
            machine: format!("{:?}", file.architecture()),
            is_little_endian: file.is_little_endian(),
            entries: Vec::new(),
        };

        for symbol in file.symbols() {
            if let Some(entry) = Self::parse_symbol(&symbol, &file) {
                if symbols.find(&entry.name).is_none() {
                    symbols.entries.push(entry);
                }
            }
        }

        tracing::debug!(
            "Read {} data symbols from {} ({})",
            symbols.len(),
            path,
            symbols.machine
        );
        Ok(symbols)
    }

    /// Parse a single symbol from the symbol table
    fn parse_symbol(symbol: &object::Symbol, file: &object::File) -> Option<SymbolEntry> {
        let name = symbol.name().ok()?;
        if name.is_empty() || symbol.is_undefined() {
            return None;
        }

        match symbol.kind() {
            SymbolKind::Data => {}
            SymbolKind::Unknown if symbol.size() > 0 => {}
            _ => return None,
        }

        let section = symbol
            .section_index()
            .and_then(|idx| file.section_by_index(idx).ok())
            .and_then(|s| s.name().ok())
            .unwrap_or("");
        if section.starts_with(".debug") || section.starts_with(".comment") {
            return None;
        }

        // Targets are 32-bit; anything above that is not device memory
        let address = u32::try_from(symbol.address()).ok()?;
        let size = u32::try_from(symbol.size()).unwrap_or(u32::MAX);
        Some(SymbolEntry::new(name, address, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::write::{self, StandardSection, SymbolSection};
    use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolScope};

    fn firmware_image() -> Vec<u8> {
        let mut obj = write::Object::new(BinaryFormat::Elf, Architecture::Arm, Endianness::Little);
        let data = obj.section_id(StandardSection::Data);
        let text = obj.section_id(StandardSection::Text);

        fn add(
            obj: &mut write::Object,
            name: &str,
            section: write::SectionId,
            size: u64,
            kind: SymbolKind,
        ) {
            let offset = obj.append_section_data(section, &vec![0u8; size as usize], 4);
            obj.add_symbol(write::Symbol {
                name: name.as_bytes().to_vec(),
                value: offset,
                size,
                kind,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(section),
                flags: SymbolFlags::None,
            });
        }
        add(&mut obj, "motor", data, 64, SymbolKind::Data);
        add(&mut obj, "app", data, 8, SymbolKind::Data);
        add(&mut obj, "main", text, 16, SymbolKind::Text);

        obj.write().unwrap()
    }

    #[test]
    fn test_parse_data_symbols() {
        let symbols = ElfParser::parse_bytes(&firmware_image(), "fw.elf").unwrap();
        assert_eq!(symbols.path, "fw.elf");
        assert!(symbols.is_little_endian);

        let motor = symbols.find("motor").unwrap();
        assert_eq!(motor.size, 64);
        let app = symbols.find("app").unwrap();
        assert_eq!(app.address, motor.address + 64);
        assert!(symbols.find("main").is_none());
    }

    #[test]
    fn test_symbol_map_resolves_offsets() {
        use crate::registry::VariableDefinition;

        let map = ElfParser::parse_bytes(&firmware_image(), "fw.elf")
            .unwrap()
            .to_symbol_map();
        let def = VariableDefinition {
            symbol: Some("motor".to_string()),
            offset: 0x10,
            ..VariableDefinition::new("motor.idq.q")
        };
        let base = map.get("motor").unwrap().address;
        assert_eq!(def.resolve(&map).unwrap().0, base + 0x10);
    }

    #[test]
    fn test_rejects_garbage() {
        let err = ElfParser::parse_bytes(b"not an elf", "bad.elf").unwrap_err();
        assert!(matches!(err, ScopeError::ElfParsing(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = ElfParser::parse("/nonexistent/firmware.elf").unwrap_err();
        assert!(err.to_string().contains("Failed to read file"));
    }
}
