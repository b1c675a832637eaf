//! Row types and the closed taxonomies persisted by the metadata store.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Section types. The first six appear on disk in the store; the last four
/// are synthetic and only exist at link time. This is a closed set; the
/// per-module layout is a fixed-size array indexed by the discriminant.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SectionKind {
    Text = 0,
    Data = 1,
    DataReloc = 2,
    Rodata = 3,
    RodataReloc = 4,
    Bss = 5,
    RelocationTable = 6,
    Got = 7,
    Stack = 8,
    Heap = 9,
}

/// Number of section kinds, including the synthetic link-time ones.
pub const SECTION_KIND_COUNT: usize = 10;

/// The kinds that occupy program address space, in the order the address
/// binder lays them out.
pub const LAYOUT_ORDER: [SectionKind; 6] = [
    SectionKind::Text,
    SectionKind::Rodata,
    SectionKind::Data,
    SectionKind::DataReloc,
    SectionKind::RodataReloc,
    SectionKind::Bss,
];

impl SectionKind {
    pub fn from_u8(raw: u8) -> Result<SectionKind> {
        Ok(match raw {
            0 => SectionKind::Text,
            1 => SectionKind::Data,
            2 => SectionKind::DataReloc,
            3 => SectionKind::Rodata,
            4 => SectionKind::RodataReloc,
            5 => SectionKind::Bss,
            6 => SectionKind::RelocationTable,
            7 => SectionKind::Got,
            8 => SectionKind::Stack,
            9 => SectionKind::Heap,
            other => {
                return Err(Error::Malformed(format!("unknown section kind {other}")));
            }
        })
    }

    /// The conventional name of this section kind.
    pub fn name(self) -> &'static str {
        match self {
            SectionKind::Text => ".text",
            SectionKind::Data => ".data",
            SectionKind::DataReloc => ".datareloc",
            SectionKind::Rodata => ".rodata",
            SectionKind::RodataReloc => ".rodatareloc",
            SectionKind::Bss => ".bss",
            SectionKind::RelocationTable => ".reloc",
            SectionKind::Got => ".got",
            SectionKind::Stack => ".stack",
            SectionKind::Heap => ".heap",
        }
    }

    /// Map an object file section name onto a store section kind, by
    /// prefix. Returns `None` for sections the store does not materialize.
    pub fn for_section_name(name: &str) -> Option<SectionKind> {
        if name.starts_with(".text") {
            Some(SectionKind::Text)
        } else if name.starts_with(".data.rel.ro") {
            Some(SectionKind::RodataReloc)
        } else if name.starts_with(".data.rel") {
            Some(SectionKind::DataReloc)
        } else if name.starts_with(".data") {
            Some(SectionKind::Data)
        } else if name.starts_with(".rodata") {
            Some(SectionKind::Rodata)
        } else if name.starts_with(".bss") {
            Some(SectionKind::Bss)
        } else {
            None
        }
    }
}

/// Symbol types, mirroring the object file taxonomy the ingester accepts.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    Undef = 0,
    Object = 1,
    Function = 2,
    Section = 3,
    /// A synthetic symbol minted at link time (stack top, heap bottom).
    Symbol = 4,
}

impl SymbolKind {
    pub fn from_u8(raw: u8) -> Result<SymbolKind> {
        Ok(match raw {
            0 => SymbolKind::Undef,
            1 => SymbolKind::Object,
            2 => SymbolKind::Function,
            3 => SymbolKind::Section,
            4 => SymbolKind::Symbol,
            other => return Err(Error::Malformed(format!("unknown symbol kind {other}"))),
        })
    }
}

/// Symbol scopes. WEAK is carried through but has no override semantics.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolScope {
    Local = 0,
    Global = 1,
    Weak = 2,
}

impl SymbolScope {
    pub fn from_u8(raw: u8) -> Result<SymbolScope> {
        Ok(match raw {
            0 => SymbolScope::Local,
            1 => SymbolScope::Global,
            2 => SymbolScope::Weak,
            other => return Err(Error::Malformed(format!("unknown symbol scope {other}"))),
        })
    }
}

/// The eight-kind relocation taxonomy. Everything the patcher and the
/// emitters do dispatches over this closed set.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelocationKind {
    /// 32-bit zero-extended absolute: `(u32)(S + A)`
    Abs32 = 0,
    /// 32-bit sign-extended absolute: `(i32)(S + A)`
    Abs32S = 1,
    /// 64-bit absolute: `S + A`
    Abs64 = 2,
    /// 32-bit pc-relative: `(u32)(S + A - P)`
    Pc32 = 3,
    /// 64-bit pc-relative: `S + A - P`
    Pc64 = 4,
    /// 64-bit GOT byte offset: `G + A`
    Got64 = 5,
    /// 64-bit GOT-relative: `S + A - GOT`
    GotOff64 = 6,
    /// 64-bit pc-relative address of the GOT itself: `GOT + A - P`
    GotPc64 = 7,
}

impl RelocationKind {
    pub fn from_u8(raw: u8) -> Result<RelocationKind> {
        Ok(match raw {
            0 => RelocationKind::Abs32,
            1 => RelocationKind::Abs32S,
            2 => RelocationKind::Abs64,
            3 => RelocationKind::Pc32,
            4 => RelocationKind::Pc64,
            5 => RelocationKind::Got64,
            6 => RelocationKind::GotOff64,
            7 => RelocationKind::GotPc64,
            other => return Err(Error::UnknownRelocation(u32::from(other))),
        })
    }

    /// Width in bytes of the patched field.
    pub fn width(self) -> usize {
        match self {
            RelocationKind::Abs32 | RelocationKind::Abs32S | RelocationKind::Pc32 => 4,
            _ => 8,
        }
    }

    /// Whether a site of this kind holds an absolute address that the
    /// self-relocating loader (or a `.reloc` consumer) must re-base.
    pub fn is_absolute(self) -> bool {
        matches!(
            self,
            RelocationKind::Abs32 | RelocationKind::Abs32S | RelocationKind::Abs64
        )
    }
}

/// A logical unit of code; born on first ingestion referencing its name,
/// never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRow {
    pub id: u64,
    pub name: String,
}

/// One compilation output providing a module's contents. Re-ingestion under
/// the same name replaces all dependent rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationRow {
    pub id: u64,
    pub name: String,
}

/// A contiguous run of bytes (or zero-filled space for BSS).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRow {
    pub id: u64,
    pub module_id: u64,
    pub implementation_id: u64,
    pub name: String,
    pub kind: SectionKind,
    /// Power of two.
    pub alignment: u64,
    /// Object class byte the section came from (32 or 64 bit).
    pub class: u8,
    pub size: u64,
    /// Raw bytes; `None` for BSS.
    pub bytes: Option<Vec<u8>>,
}

/// A named reference into a section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRow {
    pub id: u64,
    pub implementation_id: u64,
    pub section_id: u64,
    pub name: String,
    pub kind: SymbolKind,
    pub scope: SymbolScope,
    /// Offset within the owning section.
    pub value: u64,
    pub size: u64,
}

/// A patch instruction against a section.
///
/// `symbol_id`/`symbol_section_id` may be zero at ingest when the target
/// symbol lives in another object; the fixup pass resolves them by
/// `symbol_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationRow {
    pub id: u64,
    /// The section being patched.
    pub section_id: u64,
    pub symbol_id: u64,
    pub symbol_name: String,
    /// The section the target symbol lives in.
    pub symbol_section_id: u64,
    pub kind: RelocationKind,
    /// Offset of the patch site within the patched section.
    pub offset: u64,
    pub addend: i64,
}

/// The sentinel symbol name referring to the GOT itself.
pub const GOT_SYMBOL_NAME: &str = "_GLOBAL_OFFSET_TABLE_";
/// Reserved symbol id for the GOT sentinel. Sequences start above it.
pub const GOT_SYMBOL_ID: u64 = 1;
/// Reserved section id for the GOT sentinel.
pub const GOT_SECTION_ID: u64 = 1;
/// First id handed out by every sequence, keeping the reserved ids free.
pub const FIRST_SEQUENCE_ID: u64 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_kind_round_trips() {
        for raw in 0..SECTION_KIND_COUNT as u8 {
            assert_eq!(SectionKind::from_u8(raw).unwrap() as u8, raw);
        }
        assert!(SectionKind::from_u8(SECTION_KIND_COUNT as u8).is_err());
    }

    #[test]
    fn section_names_map_by_longest_prefix() {
        assert_eq!(SectionKind::for_section_name(".text.unlikely"), Some(SectionKind::Text));
        assert_eq!(
            SectionKind::for_section_name(".data.rel.ro.local"),
            Some(SectionKind::RodataReloc)
        );
        assert_eq!(SectionKind::for_section_name(".data.rel.local"), Some(SectionKind::DataReloc));
        assert_eq!(SectionKind::for_section_name(".data1"), Some(SectionKind::Data));
        assert_eq!(SectionKind::for_section_name(".rodata.str1.1"), Some(SectionKind::Rodata));
        assert_eq!(SectionKind::for_section_name(".bss"), Some(SectionKind::Bss));
        assert_eq!(SectionKind::for_section_name(".comment"), None);
    }

    #[test]
    fn relocation_widths() {
        assert_eq!(RelocationKind::Abs32.width(), 4);
        assert_eq!(RelocationKind::Pc32.width(), 4);
        assert_eq!(RelocationKind::Abs64.width(), 8);
        assert_eq!(RelocationKind::GotPc64.width(), 8);
        assert!(RelocationKind::Abs64.is_absolute());
        assert!(!RelocationKind::Pc32.is_absolute());
    }
}
