#![allow(dead_code)]

//! A builder that composes minimal relocatable objects in memory, so the
//! suites can exercise ingestion and linking without an external
//! toolchain. Objects are written with the crate's own wire structs.

use hobgoblin::obj::header::{CLASS_64, ET_REL, Header64, MAGIC, SIZEOF_IDENT};
use hobgoblin::obj::reloc::{Rela64, SIZEOF_RELA64, r_info64};
use hobgoblin::obj::section_header::{
    SHT_NULL, SHT_PROGBITS, SHT_NOBITS, SHT_RELA, SHT_STRTAB, SHT_SYMTAB, SIZEOF_SHDR64,
    SectionHeader64,
};
use hobgoblin::obj::sym::{
    STB_GLOBAL, STB_LOCAL, STT_FUNC, STT_NOTYPE, STT_OBJECT, SIZEOF_SYM64, Sym64, st_info,
};
use scroll::Pwrite;

const EHDR_SIZE: usize = SIZEOF_IDENT + 48;

/// Handle onto a section added to the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionId(usize);

/// Handle onto a symbol added to the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolId(usize);

struct BuildSection {
    name: String,
    sh_type: u32,
    align: u64,
    data: Vec<u8>,
    /// For NOBITS, the declared size.
    bss_size: u64,
}

struct BuildSymbol {
    name: String,
    section: Option<SectionId>,
    bind: u8,
    typ: u8,
    value: u64,
    size: u64,
}

struct BuildRela {
    target: SectionId,
    offset: u64,
    symbol: SymbolId,
    typ: u32,
    addend: i64,
}

/// Composes one relocatable 64-bit object.
pub struct ObjBuilder {
    module: String,
    sections: Vec<BuildSection>,
    symbols: Vec<BuildSymbol>,
    relas: Vec<BuildRela>,
}

impl ObjBuilder {
    pub fn new(module: &str) -> ObjBuilder {
        ObjBuilder {
            module: module.to_string(),
            sections: Vec::new(),
            symbols: Vec::new(),
            relas: Vec::new(),
        }
    }

    /// Add a progbits section with the given contents.
    pub fn section(&mut self, name: &str, align: u64, data: &[u8]) -> SectionId {
        self.sections.push(BuildSection {
            name: name.to_string(),
            sh_type: SHT_PROGBITS,
            align,
            data: data.to_vec(),
            bss_size: 0,
        });
        SectionId(self.sections.len() - 1)
    }

    /// Add a nobits section of the given size.
    pub fn bss(&mut self, name: &str, align: u64, size: u64) -> SectionId {
        self.sections.push(BuildSection {
            name: name.to_string(),
            sh_type: SHT_NOBITS,
            align,
            data: Vec::new(),
            bss_size: size,
        });
        SectionId(self.sections.len() - 1)
    }

    /// Add a defined function symbol.
    pub fn func(&mut self, name: &str, section: SectionId, value: u64, size: u64) -> SymbolId {
        self.symbol(name, Some(section), STB_GLOBAL, STT_FUNC, value, size)
    }

    /// Add a defined data object symbol.
    pub fn object(&mut self, name: &str, section: SectionId, value: u64, size: u64) -> SymbolId {
        self.symbol(name, Some(section), STB_GLOBAL, STT_OBJECT, value, size)
    }

    /// Add a local symbol.
    pub fn local(&mut self, name: &str, section: SectionId, value: u64) -> SymbolId {
        self.symbol(name, Some(section), STB_LOCAL, STT_OBJECT, value, 0)
    }

    /// Add an undefined (external) symbol reference.
    pub fn extern_sym(&mut self, name: &str) -> SymbolId {
        self.symbol(name, None, STB_GLOBAL, STT_NOTYPE, 0, 0)
    }

    fn symbol(
        &mut self,
        name: &str,
        section: Option<SectionId>,
        bind: u8,
        typ: u8,
        value: u64,
        size: u64,
    ) -> SymbolId {
        self.symbols.push(BuildSymbol {
            name: name.to_string(),
            section,
            bind,
            typ,
            value,
            size,
        });
        SymbolId(self.symbols.len() - 1)
    }

    /// Add a relocation with explicit addend against `target`.
    pub fn rela(&mut self, target: SectionId, offset: u64, symbol: SymbolId, typ: u32, addend: i64) {
        self.relas.push(BuildRela {
            target,
            offset,
            symbol,
            typ,
            addend,
        });
    }

    /// Serialize the object.
    pub fn build(&self) -> Vec<u8> {
        // file section indices: 0 null, 1 module marker, then user
        // sections, then one rela section per patched user section, then
        // symtab, strtab, shstrtab
        let user_base = 2;
        let mut patched: Vec<usize> = self
            .relas
            .iter()
            .map(|rela| rela.target.0)
            .collect();
        patched.sort_unstable();
        patched.dedup();
        let rela_base = user_base + self.sections.len();
        let symtab_index = rela_base + patched.len();
        let strtab_index = symtab_index + 1;
        let shstrtab_index = strtab_index + 1;
        let section_count = shstrtab_index + 1;

        // .strtab
        let mut strtab = vec![0u8];
        let mut sym_name_offsets = Vec::new();
        for symbol in &self.symbols {
            sym_name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(symbol.name.as_bytes());
            strtab.push(0);
        }

        // .symtab: null entry first
        let mut symtab = vec![0u8; SIZEOF_SYM64];
        for (index, symbol) in self.symbols.iter().enumerate() {
            let entry = Sym64 {
                st_name: sym_name_offsets[index],
                st_info: st_info(symbol.bind, symbol.typ),
                st_other: 0,
                st_shndx: symbol
                    .section
                    .map(|section| (user_base + section.0) as u16)
                    .unwrap_or(0),
                st_value: symbol.value,
                st_size: symbol.size,
            };
            let at = symtab.len();
            symtab.resize(at + SIZEOF_SYM64, 0);
            symtab.pwrite_with(entry, at, scroll::LE).unwrap();
        }

        // rela section contents, keyed by patched section
        let mut rela_blobs: Vec<(usize, Vec<u8>)> = Vec::new();
        for &target in &patched {
            let mut blob = Vec::new();
            for rela in self.relas.iter().filter(|rela| rela.target.0 == target) {
                let entry = Rela64 {
                    r_offset: rela.offset,
                    r_info: r_info64((1 + rela.symbol.0) as u32, rela.typ),
                    r_addend: rela.addend,
                };
                let at = blob.len();
                blob.resize(at + SIZEOF_RELA64, 0);
                blob.pwrite_with(entry, at, scroll::LE).unwrap();
            }
            rela_blobs.push((target, blob));
        }

        // .shstrtab
        let mut shstrtab = vec![0u8];
        let shstr = |name: &str, table: &mut Vec<u8>| -> u32 {
            let offset = table.len() as u32;
            table.extend_from_slice(name.as_bytes());
            table.push(0);
            offset
        };
        let marker_name_offset = shstr(".___module___", &mut shstrtab);
        let user_name_offsets: Vec<u32> = self
            .sections
            .iter()
            .map(|section| shstr(&section.name, &mut shstrtab))
            .collect();
        let rela_name_offsets: Vec<u32> = patched
            .iter()
            .map(|&target| shstr(&format!(".rela{}", self.sections[target].name), &mut shstrtab))
            .collect();
        let symtab_name_offset = shstr(".symtab", &mut shstrtab);
        let strtab_name_offset = shstr(".strtab", &mut shstrtab);
        let shstrtab_name_offset = shstr(".shstrtab", &mut shstrtab);

        // lay out contents after the file header
        let mut file = vec![0u8; EHDR_SIZE];
        let mut headers = vec![SectionHeader64 { sh_type: SHT_NULL, ..Default::default() }];
        let place = |file: &mut Vec<u8>, data: &[u8], align: u64| -> u64 {
            let align = align.max(1) as usize;
            let at = file.len().next_multiple_of(align);
            file.resize(at, 0);
            file.extend_from_slice(data);
            at as u64
        };

        let marker_offset = place(&mut file, self.module.as_bytes(), 1);
        headers.push(SectionHeader64 {
            sh_name: marker_name_offset,
            sh_type: SHT_PROGBITS,
            sh_offset: marker_offset,
            sh_size: self.module.len() as u64,
            sh_addralign: 1,
            ..Default::default()
        });

        for (index, section) in self.sections.iter().enumerate() {
            if section.sh_type == SHT_NOBITS {
                headers.push(SectionHeader64 {
                    sh_name: user_name_offsets[index],
                    sh_type: SHT_NOBITS,
                    sh_size: section.bss_size,
                    sh_addralign: section.align,
                    ..Default::default()
                });
            } else {
                let offset = place(&mut file, &section.data, section.align);
                headers.push(SectionHeader64 {
                    sh_name: user_name_offsets[index],
                    sh_type: SHT_PROGBITS,
                    sh_offset: offset,
                    sh_size: section.data.len() as u64,
                    sh_addralign: section.align,
                    ..Default::default()
                });
            }
        }

        for (blob_index, (target, blob)) in rela_blobs.iter().enumerate() {
            let offset = place(&mut file, blob, 8);
            headers.push(SectionHeader64 {
                sh_name: rela_name_offsets[blob_index],
                sh_type: SHT_RELA,
                sh_offset: offset,
                sh_size: blob.len() as u64,
                sh_link: symtab_index as u32,
                sh_info: (user_base + target) as u32,
                sh_addralign: 8,
                sh_entsize: SIZEOF_RELA64 as u64,
                ..Default::default()
            });
        }

        let symtab_offset = place(&mut file, &symtab, 8);
        headers.push(SectionHeader64 {
            sh_name: symtab_name_offset,
            sh_type: SHT_SYMTAB,
            sh_offset: symtab_offset,
            sh_size: symtab.len() as u64,
            sh_link: strtab_index as u32,
            sh_info: 1,
            sh_addralign: 8,
            sh_entsize: SIZEOF_SYM64 as u64,
            ..Default::default()
        });

        let strtab_offset = place(&mut file, &strtab, 1);
        headers.push(SectionHeader64 {
            sh_name: strtab_name_offset,
            sh_type: SHT_STRTAB,
            sh_offset: strtab_offset,
            sh_size: strtab.len() as u64,
            sh_addralign: 1,
            ..Default::default()
        });

        let shstrtab_offset = place(&mut file, &shstrtab, 1);
        headers.push(SectionHeader64 {
            sh_name: shstrtab_name_offset,
            sh_type: SHT_STRTAB,
            sh_offset: shstrtab_offset,
            sh_size: shstrtab.len() as u64,
            sh_addralign: 1,
            ..Default::default()
        });

        assert_eq!(headers.len(), section_count);

        // section header table, then the file header
        let shoff = {
            let at = file.len().next_multiple_of(8);
            file.resize(at, 0);
            at as u64
        };
        for header in &headers {
            let at = file.len();
            file.resize(at + SIZEOF_SHDR64, 0);
            file.pwrite_with(*header, at, scroll::LE).unwrap();
        }

        file[..4].copy_from_slice(&MAGIC);
        file[4] = CLASS_64;
        file[5] = 1; // little-endian
        file[6] = 1; // current version
        let ehdr = Header64 {
            e_type: ET_REL,
            e_machine: 0x3e,
            e_version: 1,
            e_shoff: shoff,
            e_ehsize: EHDR_SIZE as u16,
            e_shentsize: SIZEOF_SHDR64 as u16,
            e_shnum: section_count as u16,
            e_shstrndx: shstrtab_index as u16,
            ..Default::default()
        };
        file.pwrite_with(ehdr, SIZEOF_IDENT, scroll::LE).unwrap();
        file
    }
}
