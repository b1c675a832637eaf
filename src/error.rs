//! A custom error type and result alias used throughout the crate.

use core::fmt;
use core::result;
use std::error;
use std::io;

#[derive(Debug)]
/// A custom error covering object parsing, store access, linking, and image
/// emission.
pub enum Error {
    /// The object file magic did not match.
    BadMagic(u64),
    /// The object file class byte was neither 32 nor 64 bit.
    BadClass(u8),
    /// An entity is malformed in some way.
    Malformed(String),
    /// An architecture relocation kind with no counterpart in the linker's
    /// taxonomy, or a harvested kind the patcher does not know.
    UnknownRelocation(u32),
    /// The entry point symbol was not present in the store.
    EntryNotFound(String),
    /// A section layout invariant was violated while aggregating or binding
    /// addresses.
    Layout(String),
    /// A relocation could not be applied.
    Relocation(String),
    /// An image could not be emitted.
    Emit(String),
    /// An IO based error.
    IO(io::Error),
    /// Buffer read/write error from scroll.
    Scroll(scroll::Error),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::IO(ref io) => Some(io),
            Error::Scroll(ref scroll) => Some(scroll),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::BadMagic(magic) => write!(fmt, "Invalid magic number: 0x{magic:x}"),
            Error::BadClass(class) => write!(fmt, "Invalid object class: {class}"),
            Error::Malformed(ref msg) => write!(fmt, "Malformed entity: {msg}"),
            Error::UnknownRelocation(kind) => write!(fmt, "Unknown relocation kind: 0x{kind:x}"),
            Error::EntryNotFound(ref name) => write!(fmt, "Entry point symbol not found: {name}"),
            Error::Layout(ref msg) => write!(fmt, "Layout invariant violated: {msg}"),
            Error::Relocation(ref msg) => write!(fmt, "Relocation error: {msg}"),
            Error::Emit(ref msg) => write!(fmt, "Emit error: {msg}"),
            Error::IO(ref err) => write!(fmt, "{err}"),
            Error::Scroll(ref err) => write!(fmt, "{err}"),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
