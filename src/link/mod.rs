//! The linker core: entry lookup, module materialization, address binding,
//! GOT finalization, and the relocation patch pass.
//!
//! A link is a read-only snapshot operation against the store. The whole
//! context is one owned value passed through the pipeline; nothing here
//! mutates the store.

pub mod got;
pub mod module;
pub mod reloc;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::store::schema::{LAYOUT_ORDER, SECTION_KIND_COUNT, SectionKind};
use crate::strtab::StrtabBuilder;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;

pub use got::{GotEntry, GotTable, SIZEOF_GOT_ENTRY};
pub use module::{Module, ModuleSection};
pub use reloc::{RelocEntry, SIZEOF_RELOC_ENTRY};

/// Alignment every bound section, the GOT, and the image regions are
/// rounded up to.
pub const PAGE_SIZE: u64 = 0x1000;

/// Round `value` up to the next multiple of `align`.
#[inline]
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Options of one link invocation.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Entry point symbol name.
    pub entrypoint: String,
    pub program_start_physical: u64,
    pub program_start_virtual: u64,
    /// Transitive module closure; off links the entry module alone.
    pub recursive: bool,
    /// Build the symbol-name table (module names, GOT symbol names).
    pub with_symbol_names: bool,
}

/// The linker context: every materialized module, the GOT, and the bound
/// layout of one invocation.
#[derive(Debug)]
pub struct Linker<'a> {
    pub(crate) store: &'a Store,
    pub options: LinkOptions,
    /// Materialized modules, keyed by id.
    pub modules: BTreeMap<u64, Module>,
    /// Module ids in materialization order; address binding walks this.
    pub module_order: Vec<u64>,
    /// Modules currently on the recursive build stack.
    pub(crate) building: HashSet<u64>,
    pub got: GotTable,
    pub(crate) symbol_names: Option<StrtabBuilder>,
    pub entrypoint_symbol_id: u64,
    pub entrypoint_address_virtual: u64,
    /// Sum of bound section spans, page-rounded.
    pub program_size: u64,
    pub got_size: u64,
    pub relocation_table_size: u64,
    pub metadata_size: u64,
    pub symbol_table_size: u64,
    pub got_address_physical: u64,
    pub got_address_virtual: u64,
}

impl<'a> Linker<'a> {
    /// Run a complete link: lookup, closure, layout, GOT binding, patch.
    pub fn link(store: &'a Store, options: LinkOptions) -> Result<Linker<'a>> {
        let mut linker = Linker::new(store, options);
        let (symbol_id, module_id) = linker.find_entrypoint()?;
        linker.entrypoint_symbol_id = symbol_id;
        linker.build_module(module_id, linker.options.recursive)?;
        info!("modules built: {}", linker.modules.len());
        linker.calculate_sizes();
        linker.bind_addresses();
        linker.bind_got_entry_values()?;
        linker.patch()?;
        Ok(linker)
    }

    fn new(store: &'a Store, options: LinkOptions) -> Linker<'a> {
        let symbol_names = options.with_symbol_names.then(StrtabBuilder::new);
        Linker {
            store,
            options,
            modules: BTreeMap::new(),
            module_order: Vec::new(),
            building: HashSet::new(),
            got: GotTable::new(),
            symbol_names,
            entrypoint_symbol_id: 0,
            entrypoint_address_virtual: 0,
            program_size: 0,
            got_size: 0,
            relocation_table_size: 0,
            metadata_size: 0,
            symbol_table_size: 0,
            got_address_physical: 0,
            got_address_virtual: 0,
        }
    }

    /// Resolve the entry symbol to `(symbol_id, module_id)`.
    ///
    /// Several definitions of the entry name is a warning; the newest wins.
    fn find_entrypoint(&self) -> Result<(u64, u64)> {
        let matches = self.store.symbols.find_by_name(&self.options.entrypoint);
        let symbol = match matches.len() {
            0 => return Err(Error::EntryNotFound(self.options.entrypoint.clone())),
            1 => matches[0],
            n => {
                warn!(
                    "entry point '{}' has {n} definitions, using the newest",
                    self.options.entrypoint
                );
                matches[n - 1]
            }
        };
        let section = self.store.sections.get(symbol.section_id).ok_or_else(|| {
            Error::Malformed(format!(
                "entry symbol '{}' names section 0x{:x}, which is gone",
                symbol.name, symbol.section_id
            ))
        })?;
        info!(
            "entry point symbol {} id 0x{:x} section id 0x{:x} module id 0x{:x}",
            symbol.name, symbol.id, section.id, section.module_id
        );
        Ok((symbol.id, section.module_id))
    }

    /// Compute the page-rounded sizes of every image region.
    fn calculate_sizes(&mut self) {
        let mut program_size = 0;
        let mut relocation_table_size = 0;
        let mut metadata_size = 0;
        for module in self.modules.values() {
            // id, name offset, physical start, virtual start
            metadata_size += 32;
            for kind in LAYOUT_ORDER {
                let size = module.section(kind).size;
                if size != 0 {
                    // type, physical start, virtual start, size
                    metadata_size += 32;
                    program_size += align_up(size, PAGE_SIZE);
                }
            }
            // per-module terminator
            metadata_size += 32;
            if !module.relocations.is_empty() {
                relocation_table_size += 16 + module.relocation_table_size();
            }
        }
        // table terminator
        metadata_size += 32;

        self.program_size = align_up(program_size, PAGE_SIZE);
        self.got_size = align_up((self.got.len() * SIZEOF_GOT_ENTRY) as u64, PAGE_SIZE);
        self.relocation_table_size = align_up(relocation_table_size, PAGE_SIZE);
        self.metadata_size = align_up(metadata_size, PAGE_SIZE);
        self.symbol_table_size = self
            .symbol_names
            .as_ref()
            .map(|names| align_up(names.len() as u64, PAGE_SIZE))
            .unwrap_or(0);
        info!(
            "program size 0x{:x} got size 0x{:x} relocation table size 0x{:x} metadata size 0x{:x} symbol table size 0x{:x}",
            self.program_size,
            self.got_size,
            self.relocation_table_size,
            self.metadata_size,
            self.symbol_table_size
        );
    }

    /// Assign physical and virtual addresses to every non-empty module
    /// section, walking modules in materialization order and types in
    /// layout order, rounding the cursor up to a page after each section.
    fn bind_addresses(&mut self) {
        let mut physical = self.options.program_start_physical;
        let mut vaddr = self.options.program_start_virtual;
        for module_id in &self.module_order {
            let module = self
                .modules
                .get_mut(module_id)
                .expect("module order only holds materialized ids");
            module.physical_start = physical;
            module.virtual_start = vaddr;
            for kind in LAYOUT_ORDER {
                let section = module.section_mut(kind);
                if section.size == 0 {
                    continue;
                }
                section.physical_start = physical;
                section.virtual_start = vaddr;
                physical = align_up(physical + section.size, PAGE_SIZE);
                vaddr = align_up(vaddr + section.size, PAGE_SIZE);
            }
            debug!(
                "module 0x{module_id:x} bound at physical 0x{:x} virtual 0x{:x}",
                module.physical_start, module.virtual_start
            );
        }
        self.got_address_physical = physical;
        self.got_address_virtual = vaddr;
    }

    /// Fill every resolved GOT entry's final virtual address and record the
    /// entry point address.
    fn bind_got_entry_values(&mut self) -> Result<()> {
        for index in 0..self.got.len() {
            let entry = *self.got.entry(index).expect("index bounded by len");
            if entry.resolved == 0 {
                continue;
            }
            let module = self.modules.get(&entry.module_id).ok_or_else(|| {
                Error::Malformed(format!(
                    "GOT entry {index} names module 0x{:x}, which was never materialized",
                    entry.module_id
                ))
            })?;
            let kind = SectionKind::from_u8(entry.section_type)?;
            let value = module.section(kind).virtual_start + entry.symbol_value;
            self.got.entry_mut(index).expect("index bounded by len").entry_value = value;
        }
        if let Some(entry) = self.got.entry_mut(got::GOT_SELF_INDEX) {
            entry.entry_value = self.got_address_virtual;
        }

        let unresolved = self.got.unresolved_count();
        if unresolved != 0 {
            warn!("{unresolved} GOT entries remain unresolved; their values stay zero");
        }

        let entry_index = self
            .got
            .index_of(self.entrypoint_symbol_id)
            .ok_or_else(|| Error::EntryNotFound(self.options.entrypoint.clone()))?;
        self.entrypoint_address_virtual = self
            .got
            .entry(entry_index)
            .expect("index from the symbol map")
            .entry_value;
        info!(
            "entry point bound at virtual 0x{:x}",
            self.entrypoint_address_virtual
        );
        Ok(())
    }

    /// Apply every module's harvested relocations.
    fn patch(&mut self) -> Result<()> {
        let got_virtual = self.got_address_virtual;
        for module in self.modules.values_mut() {
            reloc::patch_module(module, &self.got, got_virtual)?;
        }
        Ok(())
    }

    /// Whether every GOT entry beyond the two reserved slots resolved.
    pub fn is_fully_resolved(&self) -> bool {
        self.got.unresolved_count() == 0
    }

    /// The finished symbol-name table bytes, if one was built.
    pub fn symbol_names(&self) -> Option<&[u8]> {
        self.symbol_names.as_ref().map(|names| names.as_bytes())
    }

    /// Dump the materialized modules and the GOT, for `--print`.
    pub fn dump<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(
            out,
            "program start physical 0x{:x} virtual 0x{:x}",
            self.options.program_start_physical, self.options.program_start_virtual
        )?;
        writeln!(out, "entrypoint symbol id: 0x{:x}", self.entrypoint_symbol_id)?;
        writeln!(out, "entrypoint virtual address: 0x{:x}", self.entrypoint_address_virtual)?;
        writeln!(out)?;
        writeln!(out, "modules count: {}", self.modules.len())?;
        for module in self.modules.values() {
            writeln!(out)?;
            writeln!(
                out,
                "module id: 0x{:x} physical start: 0x{:x} virtual start: 0x{:x}",
                module.id, module.physical_start, module.virtual_start
            )?;
            writeln!(out, "section kind  virtual start physical start       size")?;
            writeln!(out, "------------ -------------- -------------- ----------")?;
            for kind_index in 0..SECTION_KIND_COUNT {
                let section = &module.sections[kind_index];
                if section.size == 0 {
                    continue;
                }
                writeln!(
                    out,
                    "{:>12} 0x{:012x} 0x{:012x} 0x{:08x}",
                    SectionKind::from_u8(kind_index as u8).expect("index bounded").name(),
                    section.virtual_start,
                    section.physical_start,
                    section.size
                )?;
            }
            writeln!(out)?;
            writeln!(out, "relocations:")?;
            writeln!(out, "section kind relocation kind      symbol id         offset         addend")?;
            writeln!(out, "------------ --------------- -------------- -------------- --------------")?;
            for entry in &module.relocations {
                writeln!(
                    out,
                    "{:>12} {:>15} 0x{:012x} 0x{:012x} {:>14}",
                    entry.section_kind().map(SectionKind::name).unwrap_or("?"),
                    entry
                        .relocation_kind()
                        .map(|kind| format!("{kind:?}"))
                        .unwrap_or_else(|_| "?".into()),
                    entry.symbol_id,
                    entry.offset,
                    entry.addend
                )?;
            }
        }
        writeln!(out)?;
        writeln!(out, "GOT table entry count: {}", self.got.len())?;
        writeln!(
            out,
            "     module id      symbol id section kind    entry value resolved symbol value"
        )?;
        writeln!(
            out,
            "-------------- -------------- ------------ -------------- -------- ------------"
        )?;
        for entry in self.got.entries() {
            writeln!(
                out,
                "0x{:012x} 0x{:012x} {:>12} 0x{:012x} {:>8} 0x{:010x}",
                entry.module_id,
                entry.symbol_id,
                entry.section_type,
                entry.entry_value,
                entry.resolved,
                entry.symbol_value
            )?;
        }
        writeln!(out)?;
        if self.is_fully_resolved() {
            writeln!(out, "all symbols resolved")?;
        } else {
            writeln!(out, "unresolved symbol count: {}", self.got.unresolved_count())?;
        }
        Ok(())
    }
}
