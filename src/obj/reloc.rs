//! Relocation entries, with and without addends, and the architecture
//! relocation constants the ingester normalizes from.
//!
//! The following notation describes the computations (cf. the x86_64 psABI):
//!
//!  * A: The addend used to compute the value of the relocatable field.
//!  * G: The offset into the global offset table at which the relocation
//!       entry's symbol resides during execution.
//!  * GOT: The address of the global offset table.
//!  * P: The address of the storage unit being relocated.
//!  * S: The value of the symbol whose index resides in the relocation entry.

use crate::error::{Error, Result};
use crate::obj::header::Class;
use scroll::{Pread, Pwrite, SizeWith};

/// === 64-bit relocations ===
/// Direct 64 bit: S + A
pub const R_X86_64_64: u32 = 1;
/// PC relative 32 bit signed: S + A - P
pub const R_X86_64_PC32: u32 = 2;
/// 32 bit PLT address: L + A - P (folded onto PC32, no PLT is emitted)
pub const R_X86_64_PLT32: u32 = 4;
/// Direct 32 bit zero extended: S + A
pub const R_X86_64_32: u32 = 10;
/// Direct 32 bit sign extended: S + A
pub const R_X86_64_32S: u32 = 11;
/// PC relative 64 bit: S + A - P
pub const R_X86_64_PC64: u32 = 24;
/// 64-bit GOT entry offset: G + A
pub const R_X86_64_GOT64: u32 = 27;
/// 64-bit offset to GOT: S + A - GOT
pub const R_X86_64_GOTOFF64: u32 = 25;
/// 64-bit PC relative offset to GOT: GOT + A - P
pub const R_X86_64_GOTPC64: u32 = 29;

/// === legacy 32-bit relocations ===
/// Direct 32 bit: S + A
pub const R_386_32: u32 = 1;
/// PC relative 32 bit: S + A - P
pub const R_386_PC32: u32 = 2;

pub const SIZEOF_RELA64: usize = 24;
pub const SIZEOF_REL64: usize = 16;
pub const SIZEOF_RELA32: usize = 12;
pub const SIZEOF_REL32: usize = 8;

#[inline]
pub fn r_sym64(info: u64) -> u32 {
    (info >> 32) as u32
}

#[inline]
pub fn r_type64(info: u64) -> u32 {
    (info & 0xffff_ffff) as u32
}

#[inline]
pub fn r_info64(sym: u32, typ: u32) -> u64 {
    (u64::from(sym) << 32) | u64::from(typ)
}

#[inline]
pub fn r_sym32(info: u32) -> u32 {
    info >> 8
}

#[inline]
pub fn r_type32(info: u32) -> u32 {
    info & 0xff
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pread, Pwrite, SizeWith)]
/// 64-bit relocation with an explicit addend.
pub struct Rela64 {
    pub r_offset: u64,
    pub r_info: u64,
    pub r_addend: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pread, Pwrite, SizeWith)]
/// 64-bit relocation without an addend.
pub struct Rel64 {
    pub r_offset: u64,
    pub r_info: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct Rela32 {
    pub r_offset: u32,
    pub r_info: u32,
    pub r_addend: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct Rel32 {
    pub r_offset: u32,
    pub r_info: u32,
}

/// A unified relocation over both classes, with or without addend.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reloc {
    pub r_offset: u64,
    /// Symbol table index of the target symbol.
    pub r_sym: u32,
    /// Architecture relocation type, as found in the file.
    pub r_type: u32,
    /// Explicit addend; zero for REL-style entries.
    pub r_addend: i64,
}

impl From<Rela64> for Reloc {
    fn from(rela: Rela64) -> Reloc {
        Reloc {
            r_offset: rela.r_offset,
            r_sym: r_sym64(rela.r_info),
            r_type: r_type64(rela.r_info),
            r_addend: rela.r_addend,
        }
    }
}

impl From<Rel64> for Reloc {
    fn from(rel: Rel64) -> Reloc {
        Reloc {
            r_offset: rel.r_offset,
            r_sym: r_sym64(rel.r_info),
            r_type: r_type64(rel.r_info),
            r_addend: 0,
        }
    }
}

impl From<Rela32> for Reloc {
    fn from(rela: Rela32) -> Reloc {
        Reloc {
            r_offset: u64::from(rela.r_offset),
            r_sym: r_sym32(rela.r_info),
            r_type: r_type32(rela.r_info),
            r_addend: i64::from(rela.r_addend),
        }
    }
}

impl From<Rel32> for Reloc {
    fn from(rel: Rel32) -> Reloc {
        Reloc {
            r_offset: u64::from(rel.r_offset),
            r_sym: r_sym32(rel.r_info),
            r_type: r_type32(rel.r_info),
            r_addend: 0,
        }
    }
}

impl Reloc {
    /// Parse a relocation section's contents.
    ///
    /// `is_rela` selects the explicit-addend entry layout.
    pub fn parse(bytes: &[u8], class: Class, is_rela: bool) -> Result<Vec<Reloc>> {
        let entsize = match (class, is_rela) {
            (Class::Elf64, true) => SIZEOF_RELA64,
            (Class::Elf64, false) => SIZEOF_REL64,
            (Class::Elf32, true) => SIZEOF_RELA32,
            (Class::Elf32, false) => SIZEOF_REL32,
        };
        if bytes.len() % entsize != 0 {
            return Err(Error::Malformed(format!(
                "relocation section size 0x{:x} is not a multiple of the entry size",
                bytes.len()
            )));
        }
        let count = bytes.len() / entsize;
        let mut relocs = Vec::with_capacity(count);
        let mut at = 0;
        for _ in 0..count {
            let reloc = match (class, is_rela) {
                (Class::Elf64, true) => bytes.gread_with::<Rela64>(&mut at, scroll::LE)?.into(),
                (Class::Elf64, false) => bytes.gread_with::<Rel64>(&mut at, scroll::LE)?.into(),
                (Class::Elf32, true) => bytes.gread_with::<Rela32>(&mut at, scroll::LE)?.into(),
                (Class::Elf32, false) => bytes.gread_with::<Rel32>(&mut at, scroll::LE)?.into(),
            };
            relocs.push(reloc);
        }
        Ok(relocs)
    }
}
