//! # hobgoblin
//!
//! An impish link-and-load core for a from-scratch operating system
//! toolchain:
//!
//! - [`ingest`]: parse relocatable object files and land their sections,
//!   symbols, and relocations in a persistent metadata [`store`], keyed and
//!   indexed, with wholesale replacement of re-ingested implementations.
//! - [`link`]: materialize modules transitively from an entry symbol,
//!   build the global offset table, bind addresses, and apply the
//!   eight-kind relocation algebra.
//! - [`image`]: emit either the flat self-relocating boot format or a
//!   PE32+ EFI application.
//! - [`loader`]: re-home a flat image loaded at a different base.
//!
//! ```no_run
//! use hobgoblin::link::{LinkOptions, Linker};
//! use hobgoblin::store::Store;
//!
//! # fn main() -> hobgoblin::error::Result<()> {
//! let mut store = Store::open("link.db")?;
//! hobgoblin::ingest::ingest_object(&mut store, "kernel.o")?;
//! hobgoblin::ingest::fix_relocation_targets(&mut store)?;
//!
//! let linker = Linker::link(
//!     &store,
//!     LinkOptions {
//!         entrypoint: "___kstart64".into(),
//!         program_start_physical: 0x200000,
//!         program_start_virtual: 0x200000,
//!         recursive: true,
//!         with_symbol_names: true,
//!     },
//! )?;
//! let image = hobgoblin::image::flat::emit(&linker, store.stack_size())?;
//! # let _ = image;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod error;
pub mod image;
pub mod ingest;
pub mod link;
pub mod loader;
pub mod obj;
pub mod store;
pub mod strtab;

pub use crate::error::{Error, Result};
