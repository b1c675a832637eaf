//! A byte-offset based string table.
//! Object files index symbol and section names by byte offset into a NUL
//! delimited blob; the linker builds the same shape of table for the flat
//! image's symbol-name region.

use crate::error;
use core::fmt;
use scroll::Pread;
use scroll::ctx;

/// A common string table format which is indexed by byte offsets (and not
/// member index).
pub struct Strtab<'a> {
    bytes: &'a [u8],
    delim: ctx::StrCtx,
}

impl<'a> Strtab<'a> {
    /// Wrap `bytes` as a string table with the given delimiter.
    pub fn new(bytes: &'a [u8], delim: u8) -> Self {
        Strtab {
            bytes,
            delim: ctx::StrCtx::Delimiter(delim),
        }
    }

    /// Parse a string table out of `bytes` at `offset`, spanning `len` bytes.
    pub fn parse(bytes: &'a [u8], offset: usize, len: usize, delim: u8) -> error::Result<Strtab<'a>> {
        if offset
            .checked_add(len)
            .is_none_or(|end| end > bytes.len())
        {
            return Err(error::Error::Malformed(format!(
                "string table at 0x{offset:x} with size 0x{len:x} extends past end of file"
            )));
        }
        Ok(Strtab::new(&bytes[offset..offset + len], delim))
    }

    /// The string starting at byte offset `idx`, or an error if the offset
    /// is out of bounds or the entry is not valid UTF-8.
    pub fn get(&self, idx: usize) -> error::Result<&'a str> {
        let bytes: &'a [u8] = self.bytes;
        Ok(bytes.pread_with::<&str>(idx, self.delim)?)
    }

    /// Number of bytes backing this table.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Strtab<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Strtab")
            .field("delim", &self.delim)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Default for Strtab<'_> {
    fn default() -> Strtab<'static> {
        Strtab::new(&[], 0x0)
    }
}

/// An owning, append-only string table builder.
///
/// Names are appended NUL terminated; the returned offset indexes the name
/// for a later [`Strtab`] reader over the finished bytes.
#[derive(Debug, Default)]
pub struct StrtabBuilder {
    bytes: Vec<u8>,
}

impl StrtabBuilder {
    pub fn new() -> Self {
        StrtabBuilder::default()
    }

    /// Append `name` and return its byte offset.
    pub fn push(&mut self, name: &str) -> u64 {
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        offset
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gets_strings_by_offset() {
        let bytes = b"\0printf\0memmove\0busta\0";
        let strtab = Strtab::new(bytes, 0x0);
        assert_eq!(strtab.get(0).unwrap(), "");
        assert_eq!(strtab.get(1).unwrap(), "printf");
        assert_eq!(strtab.get(8).unwrap(), "memmove");
        assert_eq!(strtab.get(16).unwrap(), "busta");
        assert!(strtab.get(100).is_err());
    }

    #[test]
    fn parse_rejects_out_of_bounds() {
        let bytes = b"\0short\0";
        assert!(Strtab::parse(bytes, 4, 100, 0x0).is_err());
        assert!(Strtab::parse(bytes, 0, bytes.len(), 0x0).is_ok());
    }

    #[test]
    fn builder_round_trips() {
        let mut builder = StrtabBuilder::new();
        let a = builder.push("_start");
        let b = builder.push("memory_malloc");
        let strtab = Strtab::new(builder.as_bytes(), 0x0);
        assert_eq!(strtab.get(a as usize).unwrap(), "_start");
        assert_eq!(strtab.get(b as usize).unwrap(), "memory_malloc");
    }
}
