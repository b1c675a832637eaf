//! Object file ingestion: parse one relocatable object and land it in the
//! metadata store as a fresh implementation, replacing any previous
//! implementation of the same name wholesale.
//!
//! Ingestion is two-phase. The whole object is parsed into a staging
//! summary first; the store is only touched once parsing has succeeded, so
//! a malformed object leaves no partial rows behind. The store file itself
//! is rewritten once per object, after the apply phase.

use crate::error::{Error, Result};
use crate::obj::{self, Class, Object};
use crate::store::Store;
use crate::store::schema::{
    GOT_SECTION_ID, GOT_SYMBOL_ID, GOT_SYMBOL_NAME, ImplementationRow, ModuleRow, RelocationKind,
    RelocationRow, SectionKind, SectionRow, SymbolKind, SymbolRow, SymbolScope,
};
use log::{debug, info, trace, warn};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

/// Counts of rows a single ingest added.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub modules: u64,
    pub implementations: u64,
    pub sections: u64,
    pub symbols: u64,
    pub relocations: u64,
}

impl IngestStats {
    pub fn add(&mut self, other: &IngestStats) {
        self.modules += other.modules;
        self.implementations += other.implementations;
        self.sections += other.sections;
        self.symbols += other.symbols;
        self.relocations += other.relocations;
    }
}

/// Outcome of the store-wide relocation fixup pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FixupReport {
    /// Relocations whose target ids were filled in.
    pub fixed: u64,
    /// Names that resolved to no symbol.
    pub unresolved: Vec<String>,
    /// Names that resolved to more than one symbol.
    pub duplicates: Vec<String>,
}

struct StagedSection {
    obj_index: usize,
    name: String,
    kind: SectionKind,
    alignment: u64,
    size: u64,
    bytes: Option<Vec<u8>>,
}

struct StagedSymbol {
    sym_index: usize,
    section_obj_index: usize,
    name: String,
    kind: SymbolKind,
    scope: SymbolScope,
    value: u64,
    size: u64,
}

struct StagedRelocation {
    patched_obj_index: usize,
    sym_index: Option<usize>,
    symbol_name: String,
    symbol_section_obj_index: Option<usize>,
    kind: RelocationKind,
    offset: u64,
    addend: i64,
}

struct Staged {
    module_name: String,
    class: Class,
    sections: Vec<StagedSection>,
    symbols: Vec<StagedSymbol>,
    relocations: Vec<StagedRelocation>,
}

/// Ingest the object file at `path`. The implementation name is the file's
/// base name without its extension.
pub fn ingest_object<P: AsRef<Path>>(store: &mut Store, path: P) -> Result<IngestStats> {
    let path = path.as_ref();
    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| Error::Malformed(format!("cannot derive implementation name from {}", path.display())))?
        .to_string();
    let bytes = fs::read(path)?;
    info!("ingesting {} as implementation '{name}'", path.display());
    let stats = ingest_bytes(store, &name, &bytes)?;
    store.persist()?;
    Ok(stats)
}

/// Ingest object `bytes` under the implementation name `name`.
pub fn ingest_bytes(store: &mut Store, name: &str, bytes: &[u8]) -> Result<IngestStats> {
    let staged = stage(bytes)?;
    apply(store, name, staged)
}

/// Normalize an architecture relocation type onto the linker's taxonomy.
fn normalize_relocation(class: Class, r_type: u32) -> Result<RelocationKind> {
    match class {
        Class::Elf64 => Ok(match r_type {
            obj::reloc::R_X86_64_32 => RelocationKind::Abs32,
            obj::reloc::R_X86_64_32S => RelocationKind::Abs32S,
            obj::reloc::R_X86_64_64 => RelocationKind::Abs64,
            obj::reloc::R_X86_64_PC32 | obj::reloc::R_X86_64_PLT32 => RelocationKind::Pc32,
            obj::reloc::R_X86_64_PC64 => RelocationKind::Pc64,
            obj::reloc::R_X86_64_GOT64 => RelocationKind::Got64,
            obj::reloc::R_X86_64_GOTOFF64 => RelocationKind::GotOff64,
            obj::reloc::R_X86_64_GOTPC64 => RelocationKind::GotPc64,
            other => return Err(Error::UnknownRelocation(other)),
        }),
        Class::Elf32 => Ok(match r_type {
            obj::reloc::R_386_32 => RelocationKind::Abs32,
            obj::reloc::R_386_PC32 => RelocationKind::Pc32,
            other => return Err(Error::UnknownRelocation(other)),
        }),
    }
}

fn symbol_scope(bind: u8) -> Result<SymbolScope> {
    Ok(match bind {
        obj::sym::STB_LOCAL => SymbolScope::Local,
        obj::sym::STB_GLOBAL => SymbolScope::Global,
        obj::sym::STB_WEAK => SymbolScope::Weak,
        other => return Err(Error::Malformed(format!("unknown symbol binding {other}"))),
    })
}

fn symbol_kind(typ: u8) -> Result<SymbolKind> {
    Ok(match typ {
        obj::sym::STT_NOTYPE => SymbolKind::Undef,
        obj::sym::STT_OBJECT => SymbolKind::Object,
        obj::sym::STT_FUNC => SymbolKind::Function,
        obj::sym::STT_SECTION => SymbolKind::Section,
        other => return Err(Error::Malformed(format!("unknown symbol type {other}"))),
    })
}

/// The store name of a symbol: SECTION symbols take their section's name,
/// local symbols are mangled by prepending it, so a uniform name-based
/// lookup works across objects.
fn store_symbol_name(object: &Object, sym: &obj::Sym) -> Result<String> {
    let section_name = object.section_name(sym.st_shndx as usize)?;
    if sym.st_type() == obj::sym::STT_SECTION {
        return Ok(section_name.to_string());
    }
    let name = object.sym_name(sym)?;
    if sym.st_bind() == obj::sym::STB_LOCAL {
        Ok(format!("{section_name}{name}"))
    } else {
        Ok(name.to_string())
    }
}

fn stage(bytes: &[u8]) -> Result<Staged> {
    let object = Object::parse(bytes)?;
    let class = object.header.class;

    let module_name = object
        .module_name()?
        .ok_or_else(|| Error::Malformed("module name marker section not found".into()))?;
    debug!("object provides module '{module_name}'");

    let mut sections = Vec::new();
    let mut materialized: BTreeSet<usize> = BTreeSet::new();
    for (idx, shdr) in object.section_headers.iter().enumerate() {
        if shdr.sh_size == 0 {
            continue;
        }
        let name = object.section_name(idx)?;
        let Some(kind) = SectionKind::for_section_name(name) else {
            continue;
        };
        let bytes = if kind == SectionKind::Bss {
            None
        } else {
            Some(object.section_contents(idx)?.to_vec())
        };
        // alignment participates in modular arithmetic downstream
        let alignment = shdr.sh_addralign.max(1);
        trace!(
            "staging section {idx} '{name}' kind {kind:?} size 0x{:x} align 0x{alignment:x}",
            shdr.sh_size
        );
        sections.push(StagedSection {
            obj_index: idx,
            name: name.to_string(),
            kind,
            alignment,
            size: shdr.sh_size,
            bytes,
        });
        materialized.insert(idx);
    }
    if sections.is_empty() {
        return Err(Error::Malformed("object provides no loadable sections".into()));
    }

    let mut symbols = Vec::new();
    for (sym_index, sym) in object.syms.iter().enumerate() {
        if sym.st_type() > obj::sym::STT_SECTION {
            continue;
        }
        let shndx = sym.st_shndx;
        if shndx == obj::section_header::SHN_UNDEF || shndx >= obj::section_header::SHN_LORESERVE {
            continue;
        }
        let raw_name = object.sym_name(sym)?;
        if raw_name == "___module___" {
            continue;
        }
        if !materialized.contains(&(shndx as usize)) {
            return Err(Error::Malformed(format!(
                "symbol '{raw_name}' lives in section {shndx}, which is not a loadable section"
            )));
        }
        let name = store_symbol_name(&object, sym)?;
        if name.is_empty() {
            return Err(Error::Malformed(format!(
                "symbol {sym_index} has an empty name"
            )));
        }
        symbols.push(StagedSymbol {
            sym_index,
            section_obj_index: shndx as usize,
            name,
            kind: symbol_kind(sym.st_type())?,
            scope: symbol_scope(sym.st_bind())?,
            value: sym.st_value,
            size: sym.st_size,
        });
    }

    let mut relocations = Vec::new();
    for (target, rel_section_name, relocs) in object.relocation_sections()? {
        let patched_name = rel_section_name
            .strip_prefix(".rela")
            .or_else(|| rel_section_name.strip_prefix(".rel"))
            .unwrap_or(rel_section_name);
        if patched_name == ".eh_frame" {
            continue;
        }
        if !materialized.contains(&target) {
            return Err(Error::Malformed(format!(
                "relocation section {rel_section_name} patches section {target}, which is not loadable"
            )));
        }
        if patched_name.starts_with(".data") && !patched_name.starts_with(".data.rel") {
            warn!("relocation against plain data section {patched_name}");
        }
        for reloc in relocs {
            let sym = object.syms.get(reloc.r_sym as usize).ok_or_else(|| {
                Error::Malformed(format!(
                    "relocation in {rel_section_name} names symbol {} out of range",
                    reloc.r_sym
                ))
            })?;
            let symbol_name = store_symbol_name(&object, sym).or_else(|_| {
                object.sym_name(sym).map(str::to_string)
            })?;
            if symbol_name.is_empty() {
                return Err(Error::Malformed(format!(
                    "relocation in {rel_section_name} at 0x{:x} names an empty symbol",
                    reloc.r_offset
                )));
            }
            let kind = normalize_relocation(class, reloc.r_type)?;
            let defined_here = sym.st_shndx != obj::section_header::SHN_UNDEF
                && sym.st_shndx < obj::section_header::SHN_LORESERVE
                && materialized.contains(&(sym.st_shndx as usize));
            relocations.push(StagedRelocation {
                patched_obj_index: target,
                sym_index: defined_here.then_some(reloc.r_sym as usize),
                symbol_name,
                symbol_section_obj_index: defined_here.then_some(sym.st_shndx as usize),
                kind,
                offset: reloc.r_offset,
                addend: reloc.r_addend,
            });
        }
    }

    Ok(Staged {
        module_name,
        class,
        sections,
        symbols,
        relocations,
    })
}

/// Delete every row belonging to `implementation_id`, resetting the target
/// ids of any surviving relocation that pointed into it.
fn clear_implementation(store: &mut Store, implementation_id: u64) -> Result<()> {
    let section_ids: Vec<u64> = store
        .sections
        .find_by_implementation(implementation_id)
        .iter()
        .map(|section| section.id)
        .collect();
    for section_id in section_ids {
        let symbol_ids: Vec<u64> = store
            .symbols
            .find_by_section(section_id)
            .iter()
            .map(|symbol| symbol.id)
            .collect();
        for symbol_id in symbol_ids {
            store.symbols.remove(symbol_id);
        }
        let reloc_ids: Vec<u64> = store
            .relocations
            .find_by_section(section_id)
            .iter()
            .map(|reloc| reloc.id)
            .collect();
        for reloc_id in reloc_ids {
            store.relocations.remove(reloc_id);
            trace!("relocation 0x{reloc_id:x} at section 0x{section_id:x} deleted");
        }
        // relocations elsewhere that targeted a symbol in this section go
        // back to name-only resolution
        let dangling: Vec<u64> = store
            .relocations
            .find_by_symbol_section(section_id)
            .iter()
            .map(|reloc| reloc.id)
            .collect();
        for reloc_id in dangling {
            store.relocations.retarget(reloc_id, 0, 0)?;
            trace!("relocation 0x{reloc_id:x} referencing section 0x{section_id:x} reset");
        }
        store.sections.remove(section_id);
        debug!("section 0x{section_id:x} deleted");
    }
    store.implementations.remove(implementation_id);
    Ok(())
}

fn apply(store: &mut Store, implementation_name: &str, staged: Staged) -> Result<IngestStats> {
    let mut stats = IngestStats::default();

    let module_id = match store.modules.find_by_name(&staged.module_name) {
        Some(module) => module.id,
        None => {
            let id = store.module_seq.next();
            store.modules.insert(ModuleRow {
                id,
                name: staged.module_name.clone(),
            })?;
            stats.modules += 1;
            id
        }
    };

    if let Some(existing) = store.implementations.find_by_name(implementation_name) {
        let existing_id = existing.id;
        info!("implementation '{implementation_name}' already present, replacing");
        clear_implementation(store, existing_id)?;
    }
    let implementation_id = store.implementation_seq.next();
    store.implementations.insert(ImplementationRow {
        id: implementation_id,
        name: implementation_name.to_string(),
    })?;
    stats.implementations += 1;

    let mut section_ids: HashMap<usize, u64> = HashMap::new();
    for section in staged.sections {
        let id = store.section_seq.next();
        section_ids.insert(section.obj_index, id);
        store.sections.insert(SectionRow {
            id,
            module_id,
            implementation_id,
            name: section.name,
            kind: section.kind,
            alignment: section.alignment,
            class: staged.class.ident_byte(),
            size: section.size,
            bytes: section.bytes,
        })?;
        stats.sections += 1;
    }

    let mut symbol_ids: HashMap<usize, u64> = HashMap::new();
    for symbol in staged.symbols {
        let id = store.symbol_seq.next();
        symbol_ids.insert(symbol.sym_index, id);
        let section_id = section_ids[&symbol.section_obj_index];
        store.symbols.insert(SymbolRow {
            id,
            implementation_id,
            section_id,
            name: symbol.name,
            kind: symbol.kind,
            scope: symbol.scope,
            value: symbol.value,
            size: symbol.size,
        })?;
        stats.symbols += 1;
    }

    for reloc in staged.relocations {
        let id = store.relocation_seq.next();
        let section_id = section_ids[&reloc.patched_obj_index];
        let (symbol_id, symbol_section_id) = if reloc.symbol_name == GOT_SYMBOL_NAME {
            (GOT_SYMBOL_ID, GOT_SECTION_ID)
        } else {
            (
                reloc.sym_index.and_then(|idx| symbol_ids.get(&idx).copied()).unwrap_or(0),
                reloc
                    .symbol_section_obj_index
                    .and_then(|idx| section_ids.get(&idx).copied())
                    .unwrap_or(0),
            )
        };
        store.relocations.insert(RelocationRow {
            id,
            section_id,
            symbol_id,
            symbol_name: reloc.symbol_name,
            symbol_section_id,
            kind: reloc.kind,
            offset: reloc.offset,
            addend: reloc.addend,
        })?;
        stats.relocations += 1;
    }

    debug!(
        "implementation '{implementation_name}': +{} sections, +{} symbols, +{} relocations",
        stats.sections, stats.symbols, stats.relocations
    );
    Ok(stats)
}

/// The fixup pass: resolve every relocation still carrying a zero
/// `symbol_section_id` by symbol name.
///
/// A name with no definition is reported as unresolved; a name with
/// several resolves to the highest-id definition and is reported as a
/// duplicate. Neither fails the pass.
pub fn fix_relocation_targets(store: &mut Store) -> Result<FixupReport> {
    let pending: Vec<u64> = store
        .relocations
        .find_by_symbol_section(0)
        .iter()
        .map(|reloc| reloc.id)
        .collect();
    info!("{} relocations may need target fixup", pending.len());

    let mut report = FixupReport::default();
    let mut unresolved: BTreeSet<String> = BTreeSet::new();
    let mut duplicates: BTreeSet<String> = BTreeSet::new();

    for reloc_id in pending {
        let Some(reloc) = store.relocations.get(reloc_id) else {
            continue;
        };
        let symbol_name = reloc.symbol_name.clone();
        if symbol_name == GOT_SYMBOL_NAME {
            continue;
        }
        let matches = store.symbols.find_by_name(&symbol_name);
        match matches.len() {
            0 => {
                unresolved.insert(symbol_name);
            }
            1 => {
                let symbol = matches[0];
                let (symbol_id, section_id) = (symbol.id, symbol.section_id);
                store.relocations.retarget(reloc_id, symbol_id, section_id)?;
                report.fixed += 1;
                trace!("relocation 0x{reloc_id:x} fixed to symbol 0x{symbol_id:x}");
            }
            n => {
                // ascending id order: the last match is the newest
                // definition, which wins deterministically
                let symbol = matches[n - 1];
                let (symbol_id, section_id) = (symbol.id, symbol.section_id);
                warn!("duplicate symbol '{symbol_name}' ({n} definitions), using id 0x{symbol_id:x}");
                store.relocations.retarget(reloc_id, symbol_id, section_id)?;
                duplicates.insert(symbol_name);
                report.fixed += 1;
            }
        }
    }

    for name in &unresolved {
        warn!("cannot find symbol {name}");
    }
    for name in &duplicates {
        warn!("duplicated symbol {name}");
    }
    if report.fixed > 0 {
        info!("fixed relocation count: {}", report.fixed);
    }
    report.unresolved = unresolved.into_iter().collect();
    report.duplicates = duplicates.into_iter().collect();
    Ok(report)
}
