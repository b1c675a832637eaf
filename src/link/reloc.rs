//! Harvested relocation records and the patcher that applies the
//! eight-kind algebra to module section buffers.

use crate::error::{Error, Result};
use crate::link::got::{GOT_NULL_INDEX, GOT_SELF_INDEX, GotTable, SIZEOF_GOT_ENTRY};
use crate::link::module::Module;
use crate::store::schema::{GOT_SYMBOL_ID, RelocationKind, SectionKind};
use log::trace;
use scroll::{Pread, Pwrite, SizeWith};

/// Wire size of one harvested relocation record (packed).
pub const SIZEOF_RELOC_ENTRY: usize = 26;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
/// One relocation harvested out of the store into a module's relocation
/// table: everything the patcher and the self-relocating loader need.
pub struct RelocEntry {
    /// Which per-module section buffer the site lives in.
    pub section_type: u8,
    pub relocation_type: u8,
    pub symbol_id: u64,
    /// Site offset within the owning module's section buffer.
    pub offset: u64,
    pub addend: i64,
}

impl RelocEntry {
    pub fn section_kind(&self) -> Result<SectionKind> {
        SectionKind::from_u8(self.section_type)
    }

    pub fn relocation_kind(&self) -> Result<RelocationKind> {
        RelocationKind::from_u8(self.relocation_type)
    }
}

/// Resolve the GOT index a relocation dispatches through.
///
/// The reserved GOT-self symbol has no admitted entry; the only legal kind
/// against it is `GotPc64`, which reads the GOT base rather than an entry
/// value. A zero symbol id marks a reference that never resolved; it
/// dispatches through the null entry and patches to zero.
pub fn got_index_for(got: &GotTable, entry: &RelocEntry) -> Result<usize> {
    if entry.relocation_kind()? == RelocationKind::GotPc64 && entry.symbol_id != GOT_SYMBOL_ID {
        return Err(Error::Relocation(format!(
            "GotPc64 against symbol 0x{:x}, which is not the GOT itself",
            entry.symbol_id
        )));
    }
    if entry.symbol_id == 0 {
        return Ok(GOT_NULL_INDEX);
    }
    if let Some(index) = got.index_of(entry.symbol_id) {
        return Ok(index);
    }
    if entry.symbol_id != GOT_SYMBOL_ID {
        return Err(Error::Relocation(format!(
            "no GOT index for symbol 0x{:x}",
            entry.symbol_id
        )));
    }
    if entry.relocation_kind()? != RelocationKind::GotPc64 {
        return Err(Error::Relocation(format!(
            "illegal relocation kind {:?} against the GOT itself",
            entry.relocation_kind()?
        )));
    }
    Ok(GOT_SELF_INDEX)
}

/// Apply every harvested relocation of `module`, writing into its section
/// buffers.
///
/// `got_virtual` is the bound virtual address of the GOT.
pub fn patch_module(module: &mut Module, got: &GotTable, got_virtual: u64) -> Result<()> {
    // harvested entries are moved out so the section buffers can be
    // borrowed mutably; they go back untouched
    let entries = core::mem::take(&mut module.relocations);
    for entry in &entries {
        let got_index = got_index_for(got, entry)?;
        let kind = entry.relocation_kind()?;
        let section_kind = entry.section_kind()?;

        let s = got
            .entry(got_index)
            .map(|got_entry| got_entry.entry_value)
            .unwrap_or(0);
        let a = entry.addend;
        let p = module.sections[section_kind as usize]
            .virtual_start
            .wrapping_add(entry.offset);
        let g = (got_index * SIZEOF_GOT_ENTRY) as u64;

        let value = match kind {
            RelocationKind::Abs32 | RelocationKind::Abs32S | RelocationKind::Abs64 => {
                s.wrapping_add_signed(a)
            }
            RelocationKind::Pc32 | RelocationKind::Pc64 => s.wrapping_add_signed(a).wrapping_sub(p),
            RelocationKind::Got64 => g.wrapping_add_signed(a),
            RelocationKind::GotOff64 => s.wrapping_add_signed(a).wrapping_sub(got_virtual),
            RelocationKind::GotPc64 => got_virtual.wrapping_add_signed(a).wrapping_sub(p),
        };

        let data = &mut module.sections[section_kind as usize].data;
        let site = entry.offset as usize;
        if site + kind.width() > data.len() {
            module.relocations = entries;
            return Err(Error::Layout(format!(
                "relocation site 0x{site:x} extends past {section_kind:?} buffer of module 0x{:x}",
                module.id
            )));
        }
        trace!(
            "module 0x{:x} {section_kind:?}+0x{site:x}: {kind:?} <- 0x{value:x}",
            module.id
        );
        match kind.width() {
            4 => {
                data.pwrite_with(value as u32, site, scroll::LE)?;
            }
            _ => {
                data.pwrite_with(value, site, scroll::LE)?;
            }
        }
    }
    module.relocations = entries;
    Ok(())
}

/// Serialize a module's harvested relocation records.
pub fn reloc_entries_to_bytes(entries: &[RelocEntry]) -> Vec<u8> {
    let mut bytes = vec![0u8; entries.len() * SIZEOF_RELOC_ENTRY];
    let mut offset = 0;
    for entry in entries {
        bytes
            .gwrite_with(*entry, &mut offset, scroll::LE)
            .expect("relocation buffer sized from entry count");
    }
    bytes
}

/// Parse a packed relocation record array, as found on a flat image.
pub fn reloc_entries_from_bytes(bytes: &[u8]) -> Result<Vec<RelocEntry>> {
    if bytes.len() % SIZEOF_RELOC_ENTRY != 0 {
        return Err(Error::Malformed(format!(
            "relocation table size 0x{:x} is not a multiple of the record size",
            bytes.len()
        )));
    }
    let mut entries = Vec::with_capacity(bytes.len() / SIZEOF_RELOC_ENTRY);
    let mut offset = 0;
    while offset < bytes.len() {
        entries.push(bytes.gread_with::<RelocEntry>(&mut offset, scroll::LE)?);
    }
    Ok(entries)
}
