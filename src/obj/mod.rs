//! A reader for the relocatable-object subset the toolchain consumes:
//! section headers, the section-name and symbol string tables, the symbol
//! table, and rel/rela sections, over both the 32 and 64-bit classes.

pub mod header;
pub mod reloc;
pub mod section_header;
pub mod sym;

use crate::error::{Error, Result};
use crate::strtab::Strtab;
use log::debug;

pub use header::{Class, Header};
pub use reloc::Reloc;
pub use section_header::SectionHeader;
pub use sym::Sym;

/// The specially-named section whose raw bytes are the module's textual
/// name. Emitted by the front-end compiler into every object.
pub const MODULE_MARKER_SECTION: &str = ".___module___";

/// A parsed object file, borrowing the underlying bytes.
pub struct Object<'a> {
    pub header: Header,
    pub section_headers: Vec<SectionHeader>,
    pub syms: Vec<Sym>,
    bytes: &'a [u8],
    shstrtab: Strtab<'a>,
    strtab: Strtab<'a>,
}

impl<'a> Object<'a> {
    /// Parse an object file out of `bytes`.
    ///
    /// Requires a section header table, a section-name string table, a
    /// `.strtab`, and a symbol table; their absence is malformed input.
    pub fn parse(bytes: &'a [u8]) -> Result<Object<'a>> {
        let header = Header::parse(bytes)?;
        if header.e_shnum == 0 {
            return Err(Error::Malformed("object has no sections".into()));
        }
        let section_headers =
            SectionHeader::parse(bytes, header.e_shoff, header.e_shnum as usize, header.class)?;

        let shstrndx = header.e_shstrndx as usize;
        let shstr_shdr = section_headers
            .get(shstrndx)
            .ok_or_else(|| Error::Malformed("section name string table index out of range".into()))?;
        let shstrtab = Strtab::parse(
            bytes,
            shstr_shdr.sh_offset as usize,
            shstr_shdr.sh_size as usize,
            0x0,
        )?;

        let mut strtab = None;
        let mut syms = None;
        for (idx, shdr) in section_headers.iter().enumerate() {
            let name = shstrtab.get(shdr.sh_name).unwrap_or("");
            if name == ".strtab" {
                strtab = Some(Strtab::parse(
                    bytes,
                    shdr.sh_offset as usize,
                    shdr.sh_size as usize,
                    0x0,
                )?);
            } else if shdr.sh_type == section_header::SHT_SYMTAB {
                debug!("symbol table is section {idx}, 0x{:x} bytes", shdr.sh_size);
                syms = Some(Sym::parse(shdr.contents(bytes)?, header.class)?);
            }
        }
        let strtab = strtab.ok_or_else(|| Error::Malformed("object has no .strtab".into()))?;
        let syms = syms.ok_or_else(|| Error::Malformed("object has no symbol table".into()))?;

        Ok(Object {
            header,
            section_headers,
            syms,
            bytes,
            shstrtab,
            strtab,
        })
    }

    /// The name of the section at `index`.
    pub fn section_name(&self, index: usize) -> Result<&'a str> {
        let shdr = self
            .section_headers
            .get(index)
            .ok_or_else(|| Error::Malformed(format!("section index {index} out of range")))?;
        self.shstrtab.get(shdr.sh_name)
    }

    /// The raw contents of the section at `index`.
    pub fn section_contents(&self, index: usize) -> Result<&'a [u8]> {
        let shdr = self
            .section_headers
            .get(index)
            .ok_or_else(|| Error::Malformed(format!("section index {index} out of range")))?;
        shdr.contents(self.bytes)
    }

    /// The name of the symbol `sym`, resolved against `.strtab`, or for a
    /// SECTION-type symbol, the name of its target section.
    pub fn sym_name(&self, sym: &Sym) -> Result<&'a str> {
        if sym.st_type() == sym::STT_SECTION {
            return self.section_name(sym.st_shndx as usize);
        }
        self.strtab.get(sym.st_name)
    }

    /// The module name carried by the marker section, if present.
    pub fn module_name(&self) -> Result<Option<String>> {
        for (idx, shdr) in self.section_headers.iter().enumerate() {
            if shdr.sh_size == 0 {
                continue;
            }
            if self.section_name(idx)? == MODULE_MARKER_SECTION {
                let contents = self.section_contents(idx)?;
                let end = contents.iter().position(|&b| b == 0).unwrap_or(contents.len());
                let name = core::str::from_utf8(&contents[..end]).map_err(|_| {
                    Error::Malformed("module marker section is not valid UTF-8".into())
                })?;
                return Ok(Some(name.to_string()));
            }
        }
        Ok(None)
    }

    /// Iterate the rel/rela sections: yields `(patched section index,
    /// section name, parsed relocations)`.
    pub fn relocation_sections(&self) -> Result<Vec<(usize, &'a str, Vec<Reloc>)>> {
        let mut out = Vec::new();
        for (idx, shdr) in self.section_headers.iter().enumerate() {
            let is_rela = match shdr.sh_type {
                section_header::SHT_RELA => true,
                section_header::SHT_REL => false,
                _ => continue,
            };
            let name = self.section_name(idx)?;
            let target = shdr.sh_info as usize;
            if target == 0 {
                return Err(Error::Malformed(format!(
                    "relocation section {name} names no patched section"
                )));
            }
            let relocs = Reloc::parse(shdr.contents(self.bytes)?, self.header.class, is_rela)?;
            out.push((target, name, relocs));
        }
        Ok(out)
    }
}
