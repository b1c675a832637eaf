//! The PE32+ firmware image emitter.
//!
//! Produces a minimal DOS stub, a COFF header, a PE32+ optional header
//! (subsystem EFI application), one section header per non-empty module
//! section plus `.reloc`, the program payload at file offsets equal to the
//! bound physical addresses, and the base-relocation block list.

use crate::error::{Error, Result};
use crate::link::{Linker, PAGE_SIZE, SIZEOF_GOT_ENTRY, align_up};
use crate::store::schema::{LAYOUT_ORDER, RelocationKind, SectionKind};
use log::{debug, info};
use scroll::{Pread, Pwrite, SizeWith};
use std::collections::BTreeMap;

/// `MZ`
pub const DOS_MAGIC: u16 = 0x5a4d;
/// Size of the DOS stub; `e_lfanew` points just past it.
pub const SIZEOF_DOS_STUB: usize = 0x40;
/// File offset of `e_lfanew` inside the DOS stub.
pub const DOS_LFANEW_OFFSET: usize = 0x3c;
/// `PE\0\0`
pub const PE_SIGNATURE: u32 = 0x0000_4550;

pub const COFF_MACHINE_X86_64: u16 = 0x8664;
pub const PE32PLUS_MAGIC: u16 = 0x20b;
pub const SUBSYSTEM_EFI_APPLICATION: u16 = 10;
pub const NUMBER_OF_DATA_DIRECTORIES: u32 = 16;
/// Index of the base relocation table data directory.
pub const BASE_RELOCATION_TABLE: usize = 5;

pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
pub const IMAGE_FILE_LINE_NUMS_STRIPPED: u16 = 0x0004;
pub const IMAGE_FILE_LOCAL_SYMS_STRIPPED: u16 = 0x0008;
pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;
pub const IMAGE_FILE_DEBUG_STRIPPED: u16 = 0x0200;

pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
pub const IMAGE_SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// Base relocation applied to the full 32 bits at the site.
pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
/// Base relocation applied to the full 64 bits at the site.
pub const IMAGE_REL_BASED_DIR64: u16 = 10;
/// Padding entry; skipped by the loader.
pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;

/// PE file alignment.
pub const FILE_ALIGNMENT: u32 = 0x20;

pub const SIZEOF_COFF_HEADER: usize = 20;
pub const SIZEOF_OPTIONAL_HEADER: usize = 112;
pub const SIZEOF_DATA_DIRECTORY: usize = 8;
pub const SIZEOF_SECTION_HEADER: usize = 40;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// A PE section header. The name field is a fixed byte array, so this one
/// is written by hand rather than derived.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    pub fn named(name: &str) -> SectionHeader {
        let mut header = SectionHeader::default();
        let bytes = name.as_bytes();
        header.name[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
        header
    }

    pub fn write_into(&self, buf: &mut [u8], offset: &mut usize) -> Result<()> {
        buf[*offset..*offset + 8].copy_from_slice(&self.name);
        *offset += 8;
        buf.gwrite_with(self.virtual_size, offset, scroll::LE)?;
        buf.gwrite_with(self.virtual_address, offset, scroll::LE)?;
        buf.gwrite_with(self.size_of_raw_data, offset, scroll::LE)?;
        buf.gwrite_with(self.pointer_to_raw_data, offset, scroll::LE)?;
        buf.gwrite_with(self.pointer_to_relocations, offset, scroll::LE)?;
        buf.gwrite_with(self.pointer_to_linenumbers, offset, scroll::LE)?;
        buf.gwrite_with(self.number_of_relocations, offset, scroll::LE)?;
        buf.gwrite_with(self.number_of_linenumbers, offset, scroll::LE)?;
        buf.gwrite_with(self.characteristics, offset, scroll::LE)?;
        Ok(())
    }
}

fn section_flags(kind: SectionKind) -> (&'static str, u32) {
    match kind {
        SectionKind::Text => (
            ".text",
            IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
        ),
        SectionKind::Data | SectionKind::DataReloc => (
            ".data",
            IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
        ),
        SectionKind::Rodata | SectionKind::RodataReloc => (
            ".rdata",
            IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
        ),
        _ => (
            ".bss",
            IMAGE_SCN_CNT_UNINITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
        ),
    }
}

/// Build the `.reloc` block list: absolute sites grouped by 4 KiB page.
///
/// Module sites of the three absolute kinds contribute; every *resolved*
/// GOT slot contributes a DIR64 entry at its `entry_value` field, and
/// unresolved slots are skipped. Blocks are padded to an even entry count.
fn build_base_relocations(linker: &Linker) -> Result<Vec<u8>> {
    let mut sites: Vec<(u64, u16)> = Vec::new();
    for module in linker.modules.values() {
        for entry in &module.relocations {
            let kind = entry.relocation_kind()?;
            if !kind.is_absolute() {
                continue;
            }
            let based = match kind {
                RelocationKind::Abs32 | RelocationKind::Abs32S => IMAGE_REL_BASED_HIGHLOW,
                _ => IMAGE_REL_BASED_DIR64,
            };
            let section = module.section(entry.section_kind()?);
            sites.push((section.virtual_start + entry.offset, based));
        }
    }
    for (index, entry) in linker.got.entries().iter().enumerate() {
        if entry.entry_value == 0 {
            continue;
        }
        let address = linker.got_address_virtual + (index * SIZEOF_GOT_ENTRY) as u64;
        sites.push((address, IMAGE_REL_BASED_DIR64));
    }
    sites.sort_unstable();

    let mut pages: BTreeMap<u64, Vec<u16>> = BTreeMap::new();
    for (address, based) in sites {
        let page = address & !(PAGE_SIZE - 1);
        let offset = (address & (PAGE_SIZE - 1)) as u16;
        pages.entry(page).or_default().push((based << 12) | offset);
    }

    let mut bytes = Vec::new();
    for (page, mut entries) in pages {
        if entries.len() % 2 != 0 {
            entries.push(IMAGE_REL_BASED_ABSOLUTE);
        }
        let block_size = 8 + 2 * entries.len();
        let at = bytes.len();
        bytes.resize(at + block_size, 0);
        let mut offset = at;
        bytes.gwrite_with(page as u32, &mut offset, scroll::LE)?;
        bytes.gwrite_with(block_size as u32, &mut offset, scroll::LE)?;
        for entry in entries {
            bytes.gwrite_with(entry, &mut offset, scroll::LE)?;
        }
        debug!("base relocation block: page 0x{page:x}, 0x{block_size:x} bytes");
    }
    Ok(bytes)
}

/// Emit the PE32+ image for a finished link.
pub fn emit(linker: &Linker) -> Result<Vec<u8>> {
    // one header per non-empty module section, sorted by virtual address,
    // plus .reloc
    let mut section_headers: Vec<SectionHeader> = Vec::new();
    let mut size_of_code = 0u32;
    let mut size_of_initialized_data = 0u32;
    let mut size_of_uninitialized_data = 0u32;
    for module in linker.modules.values() {
        for kind in LAYOUT_ORDER {
            let section = module.section(kind);
            if section.size == 0 {
                continue;
            }
            let aligned = align_up(section.size, PAGE_SIZE);
            let aligned32 = u32::try_from(aligned)
                .map_err(|_| Error::Emit(format!("section of 0x{aligned:x} bytes overflows PE")))?;
            let (name, characteristics) = section_flags(kind);
            let mut header = SectionHeader::named(name);
            header.virtual_size = aligned32;
            header.virtual_address = u32::try_from(section.virtual_start)
                .map_err(|_| Error::Emit("virtual address overflows PE".into()))?;
            header.size_of_raw_data = aligned32;
            header.pointer_to_raw_data = u32::try_from(section.physical_start)
                .map_err(|_| Error::Emit("physical address overflows PE".into()))?;
            header.characteristics = characteristics;
            match kind {
                SectionKind::Text => size_of_code += aligned32,
                SectionKind::Bss => size_of_uninitialized_data += aligned32,
                _ => size_of_initialized_data += aligned32,
            }
            section_headers.push(header);
        }
    }
    section_headers.sort_by_key(|header| header.virtual_address);

    // the GOT rides along as its own section; firmware re-bases its slots
    // through .reloc
    let mut got_header = SectionHeader::named(".got");
    got_header.virtual_size = u32::try_from(linker.got_size)
        .map_err(|_| Error::Emit("GOT size overflows PE".into()))?;
    got_header.virtual_address = u32::try_from(linker.got_address_virtual)
        .map_err(|_| Error::Emit("GOT address overflows PE".into()))?;
    got_header.size_of_raw_data = got_header.virtual_size;
    got_header.pointer_to_raw_data = u32::try_from(linker.got_address_physical)
        .map_err(|_| Error::Emit("GOT offset overflows PE".into()))?;
    got_header.characteristics = IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ;
    size_of_initialized_data += got_header.virtual_size;
    section_headers.push(got_header);

    let relocations = build_base_relocations(linker)?;
    let reloc_len = relocations.len() as u64;
    let reloc_virtual =
        linker.options.program_start_virtual + linker.program_size + linker.got_size;
    let reloc_physical =
        linker.options.program_start_physical + linker.program_size + linker.got_size;
    let mut reloc_header = SectionHeader::named(".reloc");
    reloc_header.virtual_size = reloc_len as u32;
    reloc_header.virtual_address = u32::try_from(reloc_virtual)
        .map_err(|_| Error::Emit("relocation table address overflows PE".into()))?;
    reloc_header.size_of_raw_data = reloc_len as u32;
    reloc_header.pointer_to_raw_data = u32::try_from(reloc_physical)
        .map_err(|_| Error::Emit("relocation table offset overflows PE".into()))?;
    reloc_header.characteristics =
        IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_DISCARDABLE;

    let number_of_sections = section_headers.len() + 1; // plus .reloc
    let size_of_headers = align_up(
        (SIZEOF_DOS_STUB
            + 4
            + SIZEOF_COFF_HEADER
            + SIZEOF_OPTIONAL_HEADER
            + NUMBER_OF_DATA_DIRECTORIES as usize * SIZEOF_DATA_DIRECTORY
            + number_of_sections * SIZEOF_SECTION_HEADER) as u64,
        u64::from(FILE_ALIGNMENT),
    );
    if size_of_headers > linker.options.program_start_physical {
        return Err(Error::Emit(format!(
            "0x{size_of_headers:x} bytes of headers do not fit below the program start"
        )));
    }

    let total = align_up(
        linker.options.program_start_physical + linker.program_size + linker.got_size + reloc_len,
        u64::from(FILE_ALIGNMENT),
    );
    let mut image = vec![0u8; total as usize];
    info!(
        "PE image: 0x{total:x} bytes, {number_of_sections} sections, entry 0x{:x}",
        linker.entrypoint_address_virtual
    );

    // DOS stub
    image.pwrite_with(DOS_MAGIC, 0, scroll::LE)?;
    image.pwrite_with(SIZEOF_DOS_STUB as u32, DOS_LFANEW_OFFSET, scroll::LE)?;

    let mut offset = SIZEOF_DOS_STUB;
    image.gwrite_with(PE_SIGNATURE, &mut offset, scroll::LE)?;
    image.gwrite_with(
        CoffHeader {
            machine: COFF_MACHINE_X86_64,
            number_of_sections: number_of_sections as u16,
            size_of_optional_header: (SIZEOF_OPTIONAL_HEADER
                + NUMBER_OF_DATA_DIRECTORIES as usize * SIZEOF_DATA_DIRECTORY)
                as u16,
            characteristics: IMAGE_FILE_EXECUTABLE_IMAGE
                | IMAGE_FILE_LINE_NUMS_STRIPPED
                | IMAGE_FILE_LOCAL_SYMS_STRIPPED
                | IMAGE_FILE_LARGE_ADDRESS_AWARE
                | IMAGE_FILE_DEBUG_STRIPPED,
            ..Default::default()
        },
        &mut offset,
        scroll::LE,
    )?;
    image.gwrite_with(
        OptionalHeader64 {
            magic: PE32PLUS_MAGIC,
            size_of_code,
            size_of_initialized_data,
            size_of_uninitialized_data,
            address_of_entry_point: u32::try_from(linker.entrypoint_address_virtual)
                .map_err(|_| Error::Emit("entry point address overflows PE".into()))?,
            base_of_code: PAGE_SIZE as u32,
            section_alignment: PAGE_SIZE as u32,
            file_alignment: FILE_ALIGNMENT,
            size_of_image: u32::try_from(total)
                .map_err(|_| Error::Emit("image size overflows PE".into()))?,
            size_of_headers: size_of_headers as u32,
            subsystem: SUBSYSTEM_EFI_APPLICATION,
            number_of_rva_and_sizes: NUMBER_OF_DATA_DIRECTORIES,
            ..Default::default()
        },
        &mut offset,
        scroll::LE,
    )?;
    for index in 0..NUMBER_OF_DATA_DIRECTORIES as usize {
        let directory = if index == BASE_RELOCATION_TABLE {
            DataDirectory {
                virtual_address: reloc_header.virtual_address,
                size: reloc_header.virtual_size,
            }
        } else {
            DataDirectory::default()
        };
        image.gwrite_with(directory, &mut offset, scroll::LE)?;
    }
    for header in &section_headers {
        header.write_into(&mut image, &mut offset)?;
    }
    reloc_header.write_into(&mut image, &mut offset)?;

    // payload: file offsets equal bound physical addresses
    for module in linker.modules.values() {
        for kind in LAYOUT_ORDER {
            let section = module.section(kind);
            if section.size == 0 || kind == SectionKind::Bss {
                continue;
            }
            let at = section.physical_start as usize;
            image[at..at + section.data.len()].copy_from_slice(&section.data);
        }
    }
    let got_bytes = linker.got.to_bytes();
    let at = linker.got_address_physical as usize;
    image[at..at + got_bytes.len()].copy_from_slice(&got_bytes);

    let at = reloc_physical as usize;
    image[at..at + relocations.len()].copy_from_slice(&relocations);

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes_match_the_format() {
        use scroll::ctx::SizeWith;
        assert_eq!(CoffHeader::size_with(&scroll::LE), SIZEOF_COFF_HEADER);
        assert_eq!(OptionalHeader64::size_with(&scroll::LE), SIZEOF_OPTIONAL_HEADER);
        assert_eq!(DataDirectory::size_with(&scroll::LE), SIZEOF_DATA_DIRECTORY);
    }

    #[test]
    fn section_header_writes_forty_bytes() {
        let header = SectionHeader::named(".text");
        let mut buf = vec![0u8; SIZEOF_SECTION_HEADER];
        let mut offset = 0;
        header.write_into(&mut buf, &mut offset).unwrap();
        assert_eq!(offset, SIZEOF_SECTION_HEADER);
        assert_eq!(&buf[..5], b".text");
    }
}
