//! The flat self-relocating image: a 4 KiB program header with an embedded
//! trampoline, the concatenated module sections, the GOT, the relocation
//! table, the metadata table, and optionally the symbol-name table.

use crate::error::{Error, Result};
use crate::image::{self, Region};
use crate::link::{Linker, PAGE_SIZE};
use crate::store::schema::{LAYOUT_ORDER, SectionKind};
use log::{debug, info};
use scroll::{Pread, Pwrite};

/// Identifies the flat image format; written at [`HDR_MAGIC`].
pub const IMAGE_MAGIC: &[u8; 16] = b"HOBGOBLIN-EXEC\0\0";

/// Size of the program header, padded.
pub const SIZEOF_PROGRAM_HEADER: usize = 0x1000;

pub const HDR_JMP: usize = 0x00;
pub const HDR_TRAMPOLINE_REL: usize = 0x01;
pub const HDR_MAGIC: usize = 0x05;
pub const HDR_HEADER_PHYSICAL: usize = 0x18;
pub const HDR_HEADER_VIRTUAL: usize = 0x20;
pub const HDR_PROGRAM_OFFSET: usize = 0x28;
pub const HDR_TOTAL_SIZE: usize = 0x30;
pub const HDR_ENTRY: usize = 0x38;
/// The stack region sits here because the trampoline reads its virtual
/// start at 0x40 and its size at 0x48 off the header base.
pub const HDR_STACK_REGION: usize = 0x40;
pub const HDR_PROGRAM_SIZE: usize = 0x60;
pub const HDR_GOT_ENTRY_COUNT: usize = 0x68;
pub const HDR_PROGRAM_REGION: usize = 0x70;
pub const HDR_GOT_REGION: usize = 0x90;
pub const HDR_RELOC_REGION: usize = 0xb0;
pub const HDR_METADATA_REGION: usize = 0xd0;
/// The trampoline loads CR3 from this slot; zero at emit, the kernel's
/// loader fills it.
pub const HDR_PAGE_TABLE: usize = 0xf0;
pub const HDR_SYMTAB_REGION: usize = 0x100;
pub const HDR_HEAP_REGION: usize = 0x120;
pub const HDR_TRAMPOLINE: usize = 0x140;

/// The `jmp rel32` opcode at offset zero.
pub const JMP_OPCODE: u8 = 0xe9;

/// The boot trampoline: set up the stack, load CR3 from the page-table
/// slot, call the entry point through the header.
pub const TRAMPOLINE: [u8; 41] = [
    0x48, 0x8b, 0x57, 0x48, // mov 0x48(%rdi),%rdx
    0x48, 0x8b, 0x42, 0x40, // mov 0x40(%rdx),%rax
    0x48, 0x03, 0x42, 0x48, // add 0x48(%rdx),%rax
    0x48, 0x83, 0xe8, 0x10, // sub $0x10,%rax
    0x48, 0x89, 0xc4, // mov %rax,%rsp
    0x48, 0x31, 0xed, // xor %rbp,%rbp
    0x48, 0x8b, 0x82, 0xf0, 0x00, 0x00, 0x00, // mov 0xf0(%rdx),%rax
    0x48, 0x8b, 0x00, // mov (%rax),%rax
    0x0f, 0x22, 0xd8, // mov %rax,%cr3
    0x48, 0x8b, 0x42, 0x38, // mov 0x38(%rdx),%rax
    0xff, 0xd0, // call *%rax
];

/// The parsed (or to-be-written) program header of a flat image.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProgramHeader {
    pub header_physical_address: u64,
    pub header_virtual_address: u64,
    pub program_offset: u64,
    pub total_size: u64,
    pub entry_point: u64,
    pub program_size: u64,
    pub got_entry_count: u64,
    pub page_table_address: u64,
    pub stack: Region,
    pub program: Region,
    pub got: Region,
    pub relocation_table: Region,
    pub metadata: Region,
    pub symbol_table: Region,
    pub heap: Region,
}

impl ProgramHeader {
    /// Serialize into the first [`SIZEOF_PROGRAM_HEADER`] bytes of `buf`.
    pub fn write_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < SIZEOF_PROGRAM_HEADER {
            return Err(Error::Emit("buffer too small for the program header".into()));
        }
        buf.pwrite_with(JMP_OPCODE, HDR_JMP, scroll::LE)?;
        buf.pwrite_with((HDR_TRAMPOLINE - 5) as u32, HDR_TRAMPOLINE_REL, scroll::LE)?;
        buf[HDR_MAGIC..HDR_MAGIC + IMAGE_MAGIC.len()].copy_from_slice(IMAGE_MAGIC);
        buf.pwrite_with(self.header_physical_address, HDR_HEADER_PHYSICAL, scroll::LE)?;
        buf.pwrite_with(self.header_virtual_address, HDR_HEADER_VIRTUAL, scroll::LE)?;
        buf.pwrite_with(self.program_offset, HDR_PROGRAM_OFFSET, scroll::LE)?;
        buf.pwrite_with(self.total_size, HDR_TOTAL_SIZE, scroll::LE)?;
        buf.pwrite_with(self.entry_point, HDR_ENTRY, scroll::LE)?;
        buf.pwrite_with(self.stack, HDR_STACK_REGION, scroll::LE)?;
        buf.pwrite_with(self.program_size, HDR_PROGRAM_SIZE, scroll::LE)?;
        buf.pwrite_with(self.got_entry_count, HDR_GOT_ENTRY_COUNT, scroll::LE)?;
        buf.pwrite_with(self.program, HDR_PROGRAM_REGION, scroll::LE)?;
        buf.pwrite_with(self.got, HDR_GOT_REGION, scroll::LE)?;
        buf.pwrite_with(self.relocation_table, HDR_RELOC_REGION, scroll::LE)?;
        buf.pwrite_with(self.metadata, HDR_METADATA_REGION, scroll::LE)?;
        buf.pwrite_with(self.page_table_address, HDR_PAGE_TABLE, scroll::LE)?;
        buf.pwrite_with(self.symbol_table, HDR_SYMTAB_REGION, scroll::LE)?;
        buf.pwrite_with(self.heap, HDR_HEAP_REGION, scroll::LE)?;
        buf[HDR_TRAMPOLINE..HDR_TRAMPOLINE + TRAMPOLINE.len()].copy_from_slice(&TRAMPOLINE);
        Ok(())
    }

    /// Parse and verify a program header off the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<ProgramHeader> {
        if bytes.len() < SIZEOF_PROGRAM_HEADER {
            return Err(Error::Malformed("image too small for a program header".into()));
        }
        if bytes[HDR_JMP] != JMP_OPCODE {
            return Err(Error::BadMagic(u64::from(bytes[HDR_JMP])));
        }
        if &bytes[HDR_MAGIC..HDR_MAGIC + IMAGE_MAGIC.len()] != IMAGE_MAGIC {
            let magic: u64 = bytes.pread_with(HDR_MAGIC, scroll::LE)?;
            return Err(Error::BadMagic(magic));
        }
        Ok(ProgramHeader {
            header_physical_address: bytes.pread_with(HDR_HEADER_PHYSICAL, scroll::LE)?,
            header_virtual_address: bytes.pread_with(HDR_HEADER_VIRTUAL, scroll::LE)?,
            program_offset: bytes.pread_with(HDR_PROGRAM_OFFSET, scroll::LE)?,
            total_size: bytes.pread_with(HDR_TOTAL_SIZE, scroll::LE)?,
            entry_point: bytes.pread_with(HDR_ENTRY, scroll::LE)?,
            program_size: bytes.pread_with(HDR_PROGRAM_SIZE, scroll::LE)?,
            got_entry_count: bytes.pread_with(HDR_GOT_ENTRY_COUNT, scroll::LE)?,
            page_table_address: bytes.pread_with(HDR_PAGE_TABLE, scroll::LE)?,
            stack: bytes.pread_with(HDR_STACK_REGION, scroll::LE)?,
            program: bytes.pread_with(HDR_PROGRAM_REGION, scroll::LE)?,
            got: bytes.pread_with(HDR_GOT_REGION, scroll::LE)?,
            relocation_table: bytes.pread_with(HDR_RELOC_REGION, scroll::LE)?,
            metadata: bytes.pread_with(HDR_METADATA_REGION, scroll::LE)?,
            symbol_table: bytes.pread_with(HDR_SYMTAB_REGION, scroll::LE)?,
            heap: bytes.pread_with(HDR_HEAP_REGION, scroll::LE)?,
        })
    }
}

/// Emit the flat self-relocating image for a finished link.
///
/// `stack_size` lands in the header's stack region for the boot path; the
/// stack itself occupies no file space.
pub fn emit(linker: &Linker, stack_size: u64) -> Result<Vec<u8>> {
    let program_start_physical = linker.options.program_start_physical;
    let program_start_virtual = linker.options.program_start_virtual;
    if program_start_physical < SIZEOF_PROGRAM_HEADER as u64
        || program_start_virtual < SIZEOF_PROGRAM_HEADER as u64
    {
        return Err(Error::Emit(format!(
            "program start 0x{program_start_physical:x}/0x{program_start_virtual:x} leaves no room for the header"
        )));
    }

    let header_physical = program_start_physical - SIZEOF_PROGRAM_HEADER as u64;
    let header_virtual = program_start_virtual - SIZEOF_PROGRAM_HEADER as u64;

    let total = SIZEOF_PROGRAM_HEADER as u64
        + linker.program_size
        + linker.got_size
        + linker.relocation_table_size
        + linker.metadata_size
        + linker.symbol_table_size;
    let mut image = vec![0u8; total as usize];
    info!("flat image: 0x{total:x} bytes, header at physical 0x{header_physical:x}");

    // module sections; file offset tracks physical placement
    for module in linker.modules.values() {
        for kind in LAYOUT_ORDER {
            let section = module.section(kind);
            if section.size == 0 || kind == SectionKind::Bss {
                continue;
            }
            let offset =
                (section.physical_start - header_physical) as usize;
            debug!(
                "copying module 0x{:x} {kind:?} to file offset 0x{offset:x} (0x{:x} bytes)",
                module.id,
                section.data.len()
            );
            image[offset..offset + section.data.len()].copy_from_slice(&section.data);
        }
    }

    let mut cursor = SIZEOF_PROGRAM_HEADER as u64 + linker.program_size;

    let got_bytes = linker.got.to_bytes();
    image[cursor as usize..cursor as usize + got_bytes.len()].copy_from_slice(&got_bytes);
    let got_region = Region {
        virtual_start: linker.got_address_virtual,
        size: linker.got_size,
        physical_start: linker.got_address_physical,
        file_offset: cursor,
    };
    cursor += linker.got_size;

    let reloc_bytes = image::build_relocation_table(linker);
    image[cursor as usize..cursor as usize + reloc_bytes.len()].copy_from_slice(&reloc_bytes);
    let reloc_region = Region {
        virtual_start: header_virtual + cursor,
        size: linker.relocation_table_size,
        physical_start: header_physical + cursor,
        file_offset: cursor,
    };
    cursor += linker.relocation_table_size;

    let metadata_bytes = image::build_metadata(linker);
    image[cursor as usize..cursor as usize + metadata_bytes.len()].copy_from_slice(&metadata_bytes);
    let metadata_region = Region {
        virtual_start: header_virtual + cursor,
        size: linker.metadata_size,
        physical_start: header_physical + cursor,
        file_offset: cursor,
    };
    cursor += linker.metadata_size;

    let symbol_table_region = if let Some(names) = linker.symbol_names() {
        image[cursor as usize..cursor as usize + names.len()].copy_from_slice(names);
        let region = Region {
            virtual_start: header_virtual + cursor,
            size: linker.symbol_table_size,
            physical_start: header_physical + cursor,
            file_offset: cursor,
        };
        cursor += linker.symbol_table_size;
        region
    } else {
        Region::default()
    };
    debug_assert_eq!(cursor, total);

    let header = ProgramHeader {
        header_physical_address: header_physical,
        header_virtual_address: header_virtual,
        program_offset: SIZEOF_PROGRAM_HEADER as u64,
        total_size: total,
        entry_point: linker.entrypoint_address_virtual,
        program_size: linker.program_size,
        got_entry_count: linker.got.len() as u64,
        page_table_address: 0,
        stack: Region {
            virtual_start: 0,
            size: align_stack(stack_size),
            physical_start: 0,
            file_offset: 0,
        },
        program: Region {
            virtual_start: program_start_virtual,
            size: linker.program_size,
            physical_start: program_start_physical,
            file_offset: SIZEOF_PROGRAM_HEADER as u64,
        },
        got: got_region,
        relocation_table: reloc_region,
        metadata: metadata_region,
        symbol_table: symbol_table_region,
        heap: Region::default(),
    };
    header.write_into(&mut image)?;
    Ok(image)
}

fn align_stack(stack_size: u64) -> u64 {
    crate::link::align_up(stack_size.max(PAGE_SIZE), PAGE_SIZE)
}
