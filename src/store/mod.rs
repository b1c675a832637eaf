//! The persistent metadata store.
//!
//! Five keyed tables (modules, implementations, sections, symbols,
//! relocations) plus a small name→blob config table and one id sequence per
//! table. The whole store loads into memory on open; [`Store::persist`]
//! writes a fresh snapshot atomically (temp file + rename), so a reader
//! observes either the previous snapshot or the new one, never a partial
//! ingest.

pub mod schema;
pub mod tables;

use crate::error::{Error, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use schema::{ImplementationRow, ModuleRow, RelocationRow, SectionRow, SymbolRow};
use tables::{
    ImplementationTable, ModuleTable, RelocationTable, SectionTable, Sequence, SymbolTable,
};

/// Config key holding the entry point symbol name.
pub const CONFIG_ENTRY_POINT: &str = "entry_point";
/// Config key holding the default stack size.
pub const CONFIG_STACK_SIZE: &str = "stack_size";
/// Config key holding the default program base.
pub const CONFIG_PROGRAM_BASE: &str = "program_base";

/// Default stack size written when a store is created.
pub const DEFAULT_STACK_SIZE: u64 = 0x10000;
/// Default program base written when a store is created (2 MiB).
pub const DEFAULT_PROGRAM_BASE: u64 = 0x200000;

/// The serialized shape of a store file. Secondary indexes are rebuilt on
/// load, not stored.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    config: BTreeMap<String, Vec<u8>>,
    modules: Vec<ModuleRow>,
    implementations: Vec<ImplementationRow>,
    sections: Vec<SectionRow>,
    symbols: Vec<SymbolRow>,
    relocations: Vec<RelocationRow>,
    module_seq: Sequence,
    implementation_seq: Sequence,
    section_seq: Sequence,
    symbol_seq: Sequence,
    relocation_seq: Sequence,
}

/// An open metadata store.
#[derive(Debug)]
pub struct Store {
    path: Option<PathBuf>,
    config: BTreeMap<String, Vec<u8>>,
    pub modules: ModuleTable,
    pub implementations: ImplementationTable,
    pub sections: SectionTable,
    pub symbols: SymbolTable,
    pub relocations: RelocationTable,
    pub module_seq: Sequence,
    pub implementation_seq: Sequence,
    pub section_seq: Sequence,
    pub symbol_seq: Sequence,
    pub relocation_seq: Sequence,
}

impl Store {
    /// An empty store with no backing file.
    pub fn in_memory() -> Store {
        Store::from_snapshot(Snapshot::default(), None)
            .expect("empty snapshot is always consistent")
    }

    /// Open a store file, or create an empty one if `path` does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store> {
        let path = path.as_ref();
        if !path.exists() {
            info!("store {} does not exist, starting empty", path.display());
            return Store::from_snapshot(Snapshot::default(), Some(path.to_path_buf()));
        }
        let bytes = fs::read(path)?;
        let snapshot: Snapshot = bincode::deserialize(&bytes)
            .map_err(|err| Error::Malformed(format!("cannot decode store file: {err}")))?;
        debug!(
            "opened store {}: {} modules, {} implementations, {} sections, {} symbols, {} relocations",
            path.display(),
            snapshot.modules.len(),
            snapshot.implementations.len(),
            snapshot.sections.len(),
            snapshot.symbols.len(),
            snapshot.relocations.len()
        );
        Store::from_snapshot(snapshot, Some(path.to_path_buf()))
    }

    fn from_snapshot(snapshot: Snapshot, path: Option<PathBuf>) -> Result<Store> {
        let mut store = Store {
            path,
            config: snapshot.config,
            modules: ModuleTable::default(),
            implementations: ImplementationTable::default(),
            sections: SectionTable::default(),
            symbols: SymbolTable::default(),
            relocations: RelocationTable::default(),
            module_seq: snapshot.module_seq,
            implementation_seq: snapshot.implementation_seq,
            section_seq: snapshot.section_seq,
            symbol_seq: snapshot.symbol_seq,
            relocation_seq: snapshot.relocation_seq,
        };
        for row in snapshot.modules {
            store.modules.insert(row)?;
        }
        for row in snapshot.implementations {
            store.implementations.insert(row)?;
        }
        for row in snapshot.sections {
            store.sections.insert(row)?;
        }
        for row in snapshot.symbols {
            store.symbols.insert(row)?;
        }
        for row in snapshot.relocations {
            store.relocations.insert(row)?;
        }
        Ok(store)
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            config: self.config.clone(),
            modules: self.modules.iter().cloned().collect(),
            implementations: self.implementations.iter().cloned().collect(),
            sections: self.sections.iter().cloned().collect(),
            symbols: self.symbols.iter().cloned().collect(),
            relocations: self.relocations.iter().cloned().collect(),
            module_seq: self.module_seq.clone(),
            implementation_seq: self.implementation_seq.clone(),
            section_seq: self.section_seq.clone(),
            symbol_seq: self.symbol_seq.clone(),
            relocation_seq: self.relocation_seq.clone(),
        }
    }

    /// Write a fresh snapshot to the backing file, atomically.
    ///
    /// A no-op for in-memory stores.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = bincode::serialize(&self.to_snapshot())
            .map_err(|err| Error::Malformed(format!("cannot encode store: {err}")))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        debug!("persisted store {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Rewrite the snapshot, shedding any slack left by deletions. Invoked
    /// explicitly between ingest runs, never during a link.
    pub fn compact(&self) -> Result<()> {
        self.persist()
    }

    /// Raw config blob for `name`.
    pub fn config_get(&self, name: &str) -> Option<&[u8]> {
        self.config.get(name).map(Vec::as_slice)
    }

    /// Insert or replace a config blob.
    pub fn config_set(&mut self, name: &str, value: Vec<u8>) {
        self.config.insert(name.to_string(), value);
    }

    /// The configured entry point symbol name, if any.
    pub fn entry_point(&self) -> Option<String> {
        self.config_get(CONFIG_ENTRY_POINT)
            .and_then(|bytes| core::str::from_utf8(bytes).ok())
            .map(str::to_string)
    }

    pub fn set_entry_point(&mut self, name: &str) {
        self.config_set(CONFIG_ENTRY_POINT, name.as_bytes().to_vec());
    }

    fn config_u64(&self, name: &str) -> Option<u64> {
        let bytes = self.config_get(name)?;
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(u64::from_le_bytes(arr))
    }

    pub fn stack_size(&self) -> u64 {
        self.config_u64(CONFIG_STACK_SIZE).unwrap_or(DEFAULT_STACK_SIZE)
    }

    pub fn set_stack_size(&mut self, size: u64) {
        self.config_set(CONFIG_STACK_SIZE, size.to_le_bytes().to_vec());
    }

    pub fn program_base(&self) -> u64 {
        self.config_u64(CONFIG_PROGRAM_BASE).unwrap_or(DEFAULT_PROGRAM_BASE)
    }

    pub fn set_program_base(&mut self, base: u64) {
        self.config_set(CONFIG_PROGRAM_BASE, base.to_le_bytes().to_vec());
    }
}
