//! Materialized modules and the builder that drives transitive closure
//! from the entry module.

use crate::error::{Error, Result};
use crate::link::Linker;
use crate::link::reloc::RelocEntry;
use crate::store::schema::{
    GOT_SYMBOL_ID, GOT_SYMBOL_NAME, SECTION_KIND_COUNT, SectionKind, SectionRow,
};
use log::{debug, trace, warn};

/// One per-type section aggregate of a materialized module.
#[derive(Debug, Default, Clone)]
pub struct ModuleSection {
    /// Aggregate size, including alignment padding. For BSS this is the
    /// only record; no bytes are kept.
    pub size: u64,
    pub physical_start: u64,
    pub virtual_start: u64,
    /// Concatenated contents plus padding. Empty for BSS.
    pub data: Vec<u8>,
}

/// A module materialized for one link invocation.
#[derive(Debug, Default, Clone)]
pub struct Module {
    pub id: u64,
    pub physical_start: u64,
    pub virtual_start: u64,
    /// Offset of the module's name in the link-time symbol-name table.
    pub name_offset: u64,
    /// Fixed-size per-type array, indexed by `SectionKind` discriminant.
    pub sections: [ModuleSection; SECTION_KIND_COUNT],
    /// Harvested relocation records; the in-memory form of the
    /// RELOCATION_TABLE section.
    pub relocations: Vec<RelocEntry>,
}

impl Module {
    pub fn new(id: u64) -> Module {
        Module {
            id,
            ..Default::default()
        }
    }

    pub fn section(&self, kind: SectionKind) -> &ModuleSection {
        &self.sections[kind as usize]
    }

    pub fn section_mut(&mut self, kind: SectionKind) -> &mut ModuleSection {
        &mut self.sections[kind as usize]
    }

    /// Byte size of the serialized relocation table.
    pub fn relocation_table_size(&self) -> u64 {
        (self.relocations.len() * crate::link::reloc::SIZEOF_RELOC_ENTRY) as u64
    }
}

/// Whether a recursive descent found the module finished or still on the
/// build stack (a cycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Built,
    InProgress,
}

impl Linker<'_> {
    /// Materialize `module_id` and, in recursive mode, every module
    /// reachable from it.
    pub(crate) fn build_module(&mut self, module_id: u64, recursive: bool) -> Result<BuildStatus> {
        if self.modules.contains_key(&module_id) {
            return Ok(BuildStatus::Built);
        }
        if !self.building.insert(module_id) {
            // cycle: the caller's symbols resolve once this frame returns
            return Ok(BuildStatus::InProgress);
        }

        let mut module = Module::new(module_id);
        if let Some(names) = self.symbol_names.as_mut() {
            let row = self
                .store
                .modules
                .get(module_id)
                .ok_or_else(|| Error::Malformed(format!("no module with id 0x{module_id:x}")))?;
            module.name_offset = names.push(&row.name);
        }

        // by (type, id): per-type aggregation in ingestion order
        let mut section_rows: Vec<&SectionRow> = self.store.sections.find_by_module(module_id);
        if section_rows.is_empty() {
            self.building.remove(&module_id);
            return Err(Error::Malformed(format!(
                "module 0x{module_id:x} has no sections"
            )));
        }
        section_rows.sort_by_key(|row| (row.kind as u8, row.id));
        debug!(
            "module 0x{module_id:x} sections count: {}",
            section_rows.len()
        );

        // clone the rows out so the store borrow does not pin `self`
        let section_rows: Vec<SectionRow> = section_rows.into_iter().cloned().collect();
        for row in &section_rows {
            self.append_section(&mut module, row, recursive)?;
        }

        self.building.remove(&module_id);
        self.module_order.push(module_id);
        self.modules.insert(module_id, module);
        debug!("module 0x{module_id:x} built");
        Ok(BuildStatus::Built)
    }

    /// Append one store section to the module's per-type aggregate, then
    /// admit its symbols and harvest its relocations.
    fn append_section(&mut self, module: &mut Module, row: &SectionRow, recursive: bool) -> Result<()> {
        let kind = row.kind;
        if row.alignment == 0 || !row.alignment.is_power_of_two() {
            return Err(Error::Layout(format!(
                "section 0x{:x} alignment 0x{:x} is not a power of two",
                row.id, row.alignment
            )));
        }

        let aggregate = module.section_mut(kind);
        let mut padding = 0;
        if aggregate.size % row.alignment != 0 {
            padding = row.alignment - (aggregate.size % row.alignment);
        }
        aggregate.size += padding;

        let section_offset;
        if kind == SectionKind::Bss {
            section_offset = aggregate.size;
        } else {
            let bytes = row.bytes.as_deref().ok_or_else(|| {
                Error::Malformed(format!("section 0x{:x} has no contents", row.id))
            })?;
            if bytes.len() as u64 != row.size {
                return Err(Error::Layout(format!(
                    "section 0x{:x} contents are 0x{:x} bytes but the row declares 0x{:x}",
                    row.id,
                    bytes.len(),
                    row.size
                )));
            }
            aggregate.data.resize(aggregate.data.len() + padding as usize, 0);
            section_offset = aggregate.data.len() as u64;
            if section_offset % row.alignment != 0 {
                return Err(Error::Layout(format!(
                    "section 0x{:x} lands misaligned at 0x{section_offset:x}",
                    row.id
                )));
            }
            if section_offset != aggregate.size {
                return Err(Error::Layout(format!(
                    "section 0x{:x} offset 0x{section_offset:x} does not match aggregate size 0x{:x}",
                    row.id, aggregate.size
                )));
            }
            aggregate.data.extend_from_slice(bytes);
        }

        debug!(
            "module 0x{:x} section 0x{:x} '{}' kind {kind:?} offset 0x{section_offset:x} align 0x{:x} size 0x{:x} padding 0x{padding:x}",
            module.id, row.id, row.name, row.alignment, row.size
        );

        self.admit_section_symbols(module.id, row.id, kind, section_offset)?;
        self.harvest_section_relocations(module, row.id, kind, section_offset, recursive)?;

        module.section_mut(kind).size += row.size;
        Ok(())
    }

    /// Admit every symbol of a just-placed section into the GOT.
    fn admit_section_symbols(
        &mut self,
        module_id: u64,
        section_id: u64,
        section_kind: SectionKind,
        section_offset: u64,
    ) -> Result<()> {
        let symbols: Vec<_> = self
            .store
            .symbols
            .find_by_section(section_id)
            .into_iter()
            .cloned()
            .collect();
        debug!("found {} symbols for section 0x{section_id:x}", symbols.len());
        for symbol in &symbols {
            self.got
                .admit(module_id, symbol, section_kind, section_offset, self.symbol_names.as_mut())?;
        }
        Ok(())
    }

    /// Harvest the relocations patching a just-placed section into the
    /// module's relocation table, admitting GOT stubs (or recursing into
    /// defining modules) for symbols not yet seen.
    fn harvest_section_relocations(
        &mut self,
        module: &mut Module,
        section_id: u64,
        section_kind: SectionKind,
        section_offset: u64,
        recursive: bool,
    ) -> Result<()> {
        let relocations: Vec<_> = self
            .store
            .relocations
            .find_by_section(section_id)
            .into_iter()
            .cloned()
            .collect();
        debug!(
            "relocations count of section 0x{section_id:x}: 0x{:x}",
            relocations.len()
        );
        for reloc in &relocations {
            let is_got_symbol = reloc.symbol_name == GOT_SYMBOL_NAME;
            let symbol_id = if is_got_symbol { GOT_SYMBOL_ID } else { reloc.symbol_id };

            // a reference the fixup pass could not resolve: the site
            // dispatches through the null GOT entry and patches to zero
            if !is_got_symbol && (symbol_id == 0 || reloc.symbol_section_id == 0) {
                warn!(
                    "relocation 0x{:x} targets unresolved symbol '{}'",
                    reloc.id, reloc.symbol_name
                );
                module.relocations.push(RelocEntry {
                    section_type: section_kind as u8,
                    relocation_type: reloc.kind as u8,
                    symbol_id: 0,
                    offset: reloc.offset + section_offset,
                    addend: reloc.addend,
                });
                continue;
            }

            // the defining module, for stubbing or recursion
            let mut target_module_id = 0;
            if !is_got_symbol {
                target_module_id = self
                    .store
                    .sections
                    .get(reloc.symbol_section_id)
                    .ok_or_else(|| {
                        Error::Malformed(format!(
                            "relocation 0x{:x} targets section 0x{:x}, which is gone",
                            reloc.id, reloc.symbol_section_id
                        ))
                    })?
                    .module_id;
            }

            module.relocations.push(RelocEntry {
                section_type: section_kind as u8,
                relocation_type: reloc.kind as u8,
                symbol_id,
                offset: reloc.offset + section_offset,
                addend: reloc.addend,
            });

            if is_got_symbol || self.got.index_of(symbol_id).is_some() {
                continue;
            }
            if recursive {
                trace!(
                    "symbol 0x{symbol_id:x} not admitted, descending into module 0x{target_module_id:x}"
                );
                match self.build_module(target_module_id, recursive)? {
                    BuildStatus::InProgress => {
                        trace!("module 0x{target_module_id:x} still building");
                    }
                    BuildStatus::Built => {
                        if self.got.index_of(symbol_id).is_none() {
                            return Err(Error::Malformed(format!(
                                "symbol 0x{symbol_id:x} still unresolved after building module 0x{target_module_id:x}"
                            )));
                        }
                    }
                }
            } else {
                self.got.push_stub(target_module_id, symbol_id);
            }
        }
        Ok(())
    }
}
