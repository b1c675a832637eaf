//! Symbol table entries.

use crate::error::{Error, Result};
use crate::obj::header::Class;
use scroll::{Pread, Pwrite, SizeWith};

/// === Sym bindings ===
/// Local symbol.
pub const STB_LOCAL: u8 = 0;
/// Global symbol.
pub const STB_GLOBAL: u8 = 1;
/// Weak symbol.
pub const STB_WEAK: u8 = 2;

/// === Sym types ===
/// Symbol type is unspecified.
pub const STT_NOTYPE: u8 = 0;
/// Symbol is a data object.
pub const STT_OBJECT: u8 = 1;
/// Symbol is a code object.
pub const STT_FUNC: u8 = 2;
/// Symbol associated with a section.
pub const STT_SECTION: u8 = 3;
/// Symbol's name is file name.
pub const STT_FILE: u8 = 4;

/// Get the ST binding.
///
/// This is the first four bits of the byte.
#[inline]
pub fn st_bind(info: u8) -> u8 {
    info >> 4
}

/// Get the ST type.
///
/// This is the last four bits of the byte.
#[inline]
pub fn st_type(info: u8) -> u8 {
    info & 0xf
}

/// Pack a binding and type into an info byte.
#[inline]
pub fn st_info(bind: u8, typ: u8) -> u8 {
    (bind << 4) + (typ & 0xf)
}

pub const SIZEOF_SYM64: usize = 24;
pub const SIZEOF_SYM32: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct Sym64 {
    /// Symbol name (string tbl index)
    pub st_name: u32,
    /// Symbol type and binding
    pub st_info: u8,
    /// Symbol visibility
    pub st_other: u8,
    /// Section index
    pub st_shndx: u16,
    /// Symbol value
    pub st_value: u64,
    /// Symbol size
    pub st_size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct Sym32 {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

/// A unified symbol table entry over both classes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sym {
    pub st_name: usize,
    pub st_info: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl From<Sym64> for Sym {
    fn from(sym: Sym64) -> Sym {
        Sym {
            st_name: sym.st_name as usize,
            st_info: sym.st_info,
            st_shndx: sym.st_shndx,
            st_value: sym.st_value,
            st_size: sym.st_size,
        }
    }
}

impl From<Sym32> for Sym {
    fn from(sym: Sym32) -> Sym {
        Sym {
            st_name: sym.st_name as usize,
            st_info: sym.st_info,
            st_shndx: sym.st_shndx,
            st_value: u64::from(sym.st_value),
            st_size: u64::from(sym.st_size),
        }
    }
}

impl Sym {
    pub fn st_bind(&self) -> u8 {
        st_bind(self.st_info)
    }

    pub fn st_type(&self) -> u8 {
        st_type(self.st_info)
    }

    /// Parse the symbol table blob `bytes` (the full contents of an
    /// SHT_SYMTAB section) into entries.
    pub fn parse(bytes: &[u8], class: Class) -> Result<Vec<Sym>> {
        let entsize = match class {
            Class::Elf64 => SIZEOF_SYM64,
            Class::Elf32 => SIZEOF_SYM32,
        };
        if bytes.len() % entsize != 0 {
            return Err(Error::Malformed(format!(
                "symbol table size 0x{:x} is not a multiple of the entry size",
                bytes.len()
            )));
        }
        let count = bytes.len() / entsize;
        let mut syms = Vec::with_capacity(count);
        let mut at = 0;
        for _ in 0..count {
            let sym = match class {
                Class::Elf64 => bytes.gread_with::<Sym64>(&mut at, scroll::LE)?.into(),
                Class::Elf32 => bytes.gread_with::<Sym32>(&mut at, scroll::LE)?.into(),
            };
            syms.push(sym);
        }
        Ok(syms)
    }
}
