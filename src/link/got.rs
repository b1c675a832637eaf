//! The global offset table: the canonical resolution cache built while
//! modules materialize, and the runtime dispatch table the emitted image
//! carries.

use crate::error::{Error, Result};
use crate::store::schema::{SectionKind, SymbolRow};
use crate::strtab::StrtabBuilder;
use log::trace;
use scroll::{Pread, Pwrite, SizeWith};
use std::collections::HashMap;

/// Reserved index of the null entry.
pub const GOT_NULL_INDEX: usize = 0;
/// Reserved index of the entry describing the GOT itself.
pub const GOT_SELF_INDEX: usize = 1;

/// Wire size of one GOT entry.
pub const SIZEOF_GOT_ENTRY: usize = 56;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pread, Pwrite, SizeWith)]
/// One GOT entry, in its fixed on-image layout.
pub struct GotEntry {
    /// Final virtual address of the symbol; filled by the address binder.
    pub entry_value: u64,
    pub resolved: u8,
    pub symbol_type: u8,
    pub symbol_scope: u8,
    /// Which module section the symbol sits in.
    pub section_type: u8,
    pub reserved: u32,
    pub module_id: u64,
    pub symbol_id: u64,
    /// Offset of the symbol within its module section.
    pub symbol_value: u64,
    pub symbol_size: u64,
    /// Offset into the symbol-name table, when one is built.
    pub symbol_name_offset: u64,
}

/// The GOT under construction: an ordered entry buffer plus the
/// symbol-id → index map the patcher resolves through.
#[derive(Debug)]
pub struct GotTable {
    entries: Vec<GotEntry>,
    index_by_symbol: HashMap<u64, usize>,
}

impl Default for GotTable {
    fn default() -> GotTable {
        GotTable::new()
    }
}

impl GotTable {
    /// A fresh table seeded with the null entry and the GOT-self entry.
    pub fn new() -> GotTable {
        GotTable {
            entries: vec![GotEntry::default(), GotEntry::default()],
            index_by_symbol: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[GotEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&GotEntry> {
        self.entries.get(index)
    }

    pub fn entry_mut(&mut self, index: usize) -> Option<&mut GotEntry> {
        self.entries.get_mut(index)
    }

    /// The GOT index of `symbol_id`, if it has been admitted.
    pub fn index_of(&self, symbol_id: u64) -> Option<usize> {
        self.index_by_symbol.get(&symbol_id).copied()
    }

    /// Admit a symbol that has just been placed at `section_offset` within
    /// its module's `section_kind` buffer.
    ///
    /// A stub entry left behind by an earlier relocation harvest is
    /// resolved in place; a new symbol is appended.
    pub fn admit(
        &mut self,
        module_id: u64,
        symbol: &SymbolRow,
        section_kind: SectionKind,
        section_offset: u64,
        names: Option<&mut StrtabBuilder>,
    ) -> Result<usize> {
        if let Some(index) = self.index_of(symbol.id) {
            let entry = &mut self.entries[index];
            if entry.symbol_id != symbol.id || entry.module_id != module_id {
                return Err(Error::Malformed(format!(
                    "GOT entry {index} symbol/module id mismatch for symbol 0x{:x}",
                    symbol.id
                )));
            }
            entry.resolved = 1;
            entry.symbol_type = symbol.kind as u8;
            entry.symbol_scope = symbol.scope as u8;
            entry.symbol_value = symbol.value + section_offset;
            entry.symbol_size = symbol.size;
            entry.section_type = section_kind as u8;
            trace!("symbol 0x{:x} resolved stub GOT entry {index}", symbol.id);
            return Ok(index);
        }
        let mut entry = GotEntry {
            resolved: 1,
            symbol_type: symbol.kind as u8,
            symbol_scope: symbol.scope as u8,
            section_type: section_kind as u8,
            module_id,
            symbol_id: symbol.id,
            symbol_value: symbol.value + section_offset,
            symbol_size: symbol.size,
            ..Default::default()
        };
        if let Some(names) = names {
            entry.symbol_name_offset = names.push(&symbol.name);
        }
        let index = self.entries.len();
        self.entries.push(entry);
        self.index_by_symbol.insert(symbol.id, index);
        trace!(
            "symbol '{}' (0x{:x}) admitted to GOT at index {index}",
            symbol.name, symbol.id
        );
        Ok(index)
    }

    /// Insert an unresolved stub for a symbol whose defining module has not
    /// been visited, so relocations can still compute a GOT index.
    pub fn push_stub(&mut self, module_id: u64, symbol_id: u64) -> usize {
        let entry = GotEntry {
            module_id,
            symbol_id,
            ..Default::default()
        };
        let index = self.entries.len();
        self.entries.push(entry);
        self.index_by_symbol.insert(symbol_id, index);
        trace!("symbol 0x{symbol_id:x} stubbed into GOT at index {index}");
        index
    }

    /// Entries with `resolved == 0`, excluding the two reserved slots.
    pub fn unresolved_count(&self) -> usize {
        self.entries
            .iter()
            .skip(2)
            .filter(|entry| entry.resolved == 0)
            .count()
    }

    /// Serialize the table for the emitted image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.entries.len() * SIZEOF_GOT_ENTRY];
        let mut offset = 0;
        for entry in &self.entries {
            bytes
                .gwrite_with(*entry, &mut offset, scroll::LE)
                .expect("GOT buffer sized from entry count");
        }
        bytes
    }
}
