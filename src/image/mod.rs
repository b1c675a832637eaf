//! Image emission: the flat self-relocating format and the PE32+ firmware
//! format, plus the region/metadata/relocation-table encodings shared with
//! the loader.

pub mod flat;
pub mod pe;

use crate::error::{Error, Result};
use crate::link::Linker;
use crate::link::reloc::{self, RelocEntry};
use crate::store::schema::{LAYOUT_ORDER, SectionKind};
use scroll::{Pread, Pwrite, SizeWith};

/// Wire size of a region quadruple.
pub const SIZEOF_REGION: usize = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pread, Pwrite, SizeWith)]
/// Where an image region lives: in address space and in the file.
pub struct Region {
    pub virtual_start: u64,
    pub size: u64,
    pub physical_start: u64,
    pub file_offset: u64,
}

/// Per-module placement parsed back out of the metadata region.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ModuleMeta {
    pub module_id: u64,
    pub name_offset: u64,
    pub physical_start: u64,
    pub virtual_start: u64,
    /// `(kind, physical_start, virtual_start, size)` for every non-empty
    /// section.
    pub sections: Vec<(SectionKind, u64, u64, u64)>,
}

impl ModuleMeta {
    pub fn section(&self, kind: SectionKind) -> Option<(u64, u64, u64)> {
        self.sections
            .iter()
            .find(|(section_kind, ..)| *section_kind == kind)
            .map(|&(_, physical, virtual_start, size)| (physical, virtual_start, size))
    }
}

/// Serialize the flat relocation table: for each module with harvested
/// relocations, in ascending module id, `[u64 id][u64 byte_len][records]`.
pub fn build_relocation_table(linker: &Linker) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut offset = 0;
    for module in linker.modules.values() {
        if module.relocations.is_empty() {
            continue;
        }
        let records = reloc::reloc_entries_to_bytes(&module.relocations);
        bytes.resize(bytes.len() + 16 + records.len(), 0);
        bytes
            .gwrite_with(module.id, &mut offset, scroll::LE)
            .expect("sized above");
        bytes
            .gwrite_with(records.len() as u64, &mut offset, scroll::LE)
            .expect("sized above");
        bytes[offset..offset + records.len()].copy_from_slice(&records);
        offset += records.len();
    }
    bytes
}

/// Parse a flat relocation table back into per-module record lists.
pub fn parse_relocation_table(bytes: &[u8]) -> Result<Vec<(u64, Vec<RelocEntry>)>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + 16 <= bytes.len() {
        let module_id: u64 = bytes.gread_with(&mut offset, scroll::LE)?;
        if module_id == 0 {
            break;
        }
        let len: u64 = bytes.gread_with(&mut offset, scroll::LE)?;
        let len = len as usize;
        if offset + len > bytes.len() {
            return Err(Error::Malformed(format!(
                "relocation table entry for module 0x{module_id:x} extends past the region"
            )));
        }
        out.push((module_id, reloc::reloc_entries_from_bytes(&bytes[offset..offset + len])?));
        offset += len;
    }
    Ok(out)
}

/// Serialize the metadata table: per module `[id][name_offset][phys][virt]`
/// and a `{type, phys, virt, size}` row per non-empty section, each module
/// and the table itself terminated by four zero words.
pub fn build_metadata(linker: &Linker) -> Vec<u8> {
    let mut words: Vec<u64> = Vec::new();
    for module in linker.modules.values() {
        words.extend([
            module.id,
            module.name_offset,
            module.physical_start,
            module.virtual_start,
        ]);
        for kind in LAYOUT_ORDER {
            let section = module.section(kind);
            if section.size == 0 {
                continue;
            }
            words.extend([
                kind as u64,
                section.physical_start,
                section.virtual_start,
                section.size,
            ]);
        }
        words.extend([0, 0, 0, 0]);
    }
    words.extend([0, 0, 0, 0]);

    let mut bytes = vec![0u8; words.len() * 8];
    let mut offset = 0;
    for word in words {
        bytes.gwrite_with(word, &mut offset, scroll::LE).expect("sized above");
    }
    bytes
}

/// Parse a metadata table back into per-module placements.
pub fn parse_metadata(bytes: &[u8]) -> Result<Vec<ModuleMeta>> {
    let mut out = Vec::new();
    let mut offset = 0;
    let quad = |offset: &mut usize| -> Result<[u64; 4]> {
        if *offset + 32 > bytes.len() {
            return Err(Error::Malformed("metadata region truncated".into()));
        }
        let mut words = [0u64; 4];
        for word in &mut words {
            *word = bytes.gread_with(offset, scroll::LE)?;
        }
        Ok(words)
    };
    loop {
        let header = quad(&mut offset)?;
        if header == [0, 0, 0, 0] {
            break;
        }
        let mut meta = ModuleMeta {
            module_id: header[0],
            name_offset: header[1],
            physical_start: header[2],
            virtual_start: header[3],
            sections: Vec::new(),
        };
        loop {
            let row = quad(&mut offset)?;
            if row == [0, 0, 0, 0] {
                break;
            }
            let kind = SectionKind::from_u8(u8::try_from(row[0]).map_err(|_| {
                Error::Malformed(format!("metadata names section kind {}", row[0]))
            })?)?;
            meta.sections.push((kind, row[1], row[2], row[3]));
        }
        out.push(meta);
    }
    Ok(out)
}
