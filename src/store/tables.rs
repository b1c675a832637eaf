//! Keyed tables with primary-key storage, secondary indexes, and monotonic
//! id sequences.
//!
//! Rows live in `BTreeMap`s keyed by id, so every iteration and every
//! secondary-index result comes back in ascending id order, which is the
//! stable order the module builder's determinism contract leans on.
//! Indexes are rebuilt from rows on load and never persisted.

use crate::error::{Error, Result};
use crate::store::schema::{
    FIRST_SEQUENCE_ID, ImplementationRow, ModuleRow, RelocationRow, SectionRow, SymbolRow,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A monotonic id allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    next: u64,
}

impl Default for Sequence {
    fn default() -> Sequence {
        Sequence {
            next: FIRST_SEQUENCE_ID,
        }
    }
}

impl Sequence {
    pub fn next(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// The id the next call to [`next`](Sequence::next) will hand out.
    pub fn peek(&self) -> u64 {
        self.next
    }
}

fn index_insert<K: Ord>(index: &mut BTreeMap<K, BTreeSet<u64>>, key: K, id: u64) {
    index.entry(key).or_default().insert(id);
}

fn index_remove<K: Ord>(index: &mut BTreeMap<K, BTreeSet<u64>>, key: &K, id: u64) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

fn index_get<K: Ord>(index: &BTreeMap<K, BTreeSet<u64>>, key: &K) -> Vec<u64> {
    index.get(key).map(|ids| ids.iter().copied().collect()).unwrap_or_default()
}

/// `modules(id pk, name unique)`.
#[derive(Debug, Default)]
pub struct ModuleTable {
    rows: BTreeMap<u64, ModuleRow>,
    by_name: BTreeMap<String, u64>,
}

impl ModuleTable {
    pub fn insert(&mut self, row: ModuleRow) -> Result<()> {
        if self.rows.contains_key(&row.id) {
            return Err(Error::Malformed(format!("duplicate module id 0x{:x}", row.id)));
        }
        if self.by_name.contains_key(&row.name) {
            return Err(Error::Malformed(format!("duplicate module name {}", row.name)));
        }
        self.by_name.insert(row.name.clone(), row.id);
        self.rows.insert(row.id, row);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<&ModuleRow> {
        self.rows.get(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ModuleRow> {
        self.by_name.get(name).and_then(|id| self.rows.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleRow> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// `implementations(id pk, name unique)`.
#[derive(Debug, Default)]
pub struct ImplementationTable {
    rows: BTreeMap<u64, ImplementationRow>,
    by_name: BTreeMap<String, u64>,
}

impl ImplementationTable {
    pub fn insert(&mut self, row: ImplementationRow) -> Result<()> {
        if self.rows.contains_key(&row.id) {
            return Err(Error::Malformed(format!(
                "duplicate implementation id 0x{:x}",
                row.id
            )));
        }
        if self.by_name.contains_key(&row.name) {
            return Err(Error::Malformed(format!(
                "duplicate implementation name {}",
                row.name
            )));
        }
        self.by_name.insert(row.name.clone(), row.id);
        self.rows.insert(row.id, row);
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<ImplementationRow> {
        let row = self.rows.remove(&id)?;
        self.by_name.remove(&row.name);
        Some(row)
    }

    pub fn get(&self, id: u64) -> Option<&ImplementationRow> {
        self.rows.get(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ImplementationRow> {
        self.by_name.get(name).and_then(|id| self.rows.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImplementationRow> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// `sections(id pk)` with secondary indexes on `implementation_id`, `name`,
/// and `module_id`.
#[derive(Debug, Default)]
pub struct SectionTable {
    rows: BTreeMap<u64, SectionRow>,
    by_implementation: BTreeMap<u64, BTreeSet<u64>>,
    by_module: BTreeMap<u64, BTreeSet<u64>>,
    by_name: BTreeMap<String, BTreeSet<u64>>,
}

impl SectionTable {
    pub fn insert(&mut self, row: SectionRow) -> Result<()> {
        if self.rows.contains_key(&row.id) {
            return Err(Error::Malformed(format!("duplicate section id 0x{:x}", row.id)));
        }
        index_insert(&mut self.by_implementation, row.implementation_id, row.id);
        index_insert(&mut self.by_module, row.module_id, row.id);
        index_insert(&mut self.by_name, row.name.clone(), row.id);
        self.rows.insert(row.id, row);
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<SectionRow> {
        let row = self.rows.remove(&id)?;
        index_remove(&mut self.by_implementation, &row.implementation_id, id);
        index_remove(&mut self.by_module, &row.module_id, id);
        index_remove(&mut self.by_name, &row.name, id);
        Some(row)
    }

    pub fn get(&self, id: u64) -> Option<&SectionRow> {
        self.rows.get(&id)
    }

    pub fn find_by_implementation(&self, implementation_id: u64) -> Vec<&SectionRow> {
        index_get(&self.by_implementation, &implementation_id)
            .into_iter()
            .filter_map(|id| self.rows.get(&id))
            .collect()
    }

    pub fn find_by_module(&self, module_id: u64) -> Vec<&SectionRow> {
        index_get(&self.by_module, &module_id)
            .into_iter()
            .filter_map(|id| self.rows.get(&id))
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Vec<&SectionRow> {
        index_get(&self.by_name, &name.to_string())
            .into_iter()
            .filter_map(|id| self.rows.get(&id))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SectionRow> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// `symbols(id pk)` with secondary indexes on `implementation_id`,
/// `section_id`, and `name`.
#[derive(Debug, Default)]
pub struct SymbolTable {
    rows: BTreeMap<u64, SymbolRow>,
    by_implementation: BTreeMap<u64, BTreeSet<u64>>,
    by_section: BTreeMap<u64, BTreeSet<u64>>,
    by_name: BTreeMap<String, BTreeSet<u64>>,
}

impl SymbolTable {
    pub fn insert(&mut self, row: SymbolRow) -> Result<()> {
        if self.rows.contains_key(&row.id) {
            return Err(Error::Malformed(format!("duplicate symbol id 0x{:x}", row.id)));
        }
        index_insert(&mut self.by_implementation, row.implementation_id, row.id);
        index_insert(&mut self.by_section, row.section_id, row.id);
        index_insert(&mut self.by_name, row.name.clone(), row.id);
        self.rows.insert(row.id, row);
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<SymbolRow> {
        let row = self.rows.remove(&id)?;
        index_remove(&mut self.by_implementation, &row.implementation_id, id);
        index_remove(&mut self.by_section, &row.section_id, id);
        index_remove(&mut self.by_name, &row.name, id);
        Some(row)
    }

    pub fn get(&self, id: u64) -> Option<&SymbolRow> {
        self.rows.get(&id)
    }

    pub fn find_by_implementation(&self, implementation_id: u64) -> Vec<&SymbolRow> {
        index_get(&self.by_implementation, &implementation_id)
            .into_iter()
            .filter_map(|id| self.rows.get(&id))
            .collect()
    }

    pub fn find_by_section(&self, section_id: u64) -> Vec<&SymbolRow> {
        index_get(&self.by_section, &section_id)
            .into_iter()
            .filter_map(|id| self.rows.get(&id))
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Vec<&SymbolRow> {
        index_get(&self.by_name, &name.to_string())
            .into_iter()
            .filter_map(|id| self.rows.get(&id))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolRow> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// `relocations(id pk)` with secondary indexes on `section_id`,
/// `symbol_name`, and `symbol_section_id`.
#[derive(Debug, Default)]
pub struct RelocationTable {
    rows: BTreeMap<u64, RelocationRow>,
    by_section: BTreeMap<u64, BTreeSet<u64>>,
    by_symbol_name: BTreeMap<String, BTreeSet<u64>>,
    by_symbol_section: BTreeMap<u64, BTreeSet<u64>>,
}

impl RelocationTable {
    pub fn insert(&mut self, row: RelocationRow) -> Result<()> {
        if self.rows.contains_key(&row.id) {
            return Err(Error::Malformed(format!(
                "duplicate relocation id 0x{:x}",
                row.id
            )));
        }
        index_insert(&mut self.by_section, row.section_id, row.id);
        index_insert(&mut self.by_symbol_name, row.symbol_name.clone(), row.id);
        index_insert(&mut self.by_symbol_section, row.symbol_section_id, row.id);
        self.rows.insert(row.id, row);
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<RelocationRow> {
        let row = self.rows.remove(&id)?;
        index_remove(&mut self.by_section, &row.section_id, id);
        index_remove(&mut self.by_symbol_name, &row.symbol_name, id);
        index_remove(&mut self.by_symbol_section, &row.symbol_section_id, id);
        Some(row)
    }

    pub fn get(&self, id: u64) -> Option<&RelocationRow> {
        self.rows.get(&id)
    }

    /// Rewrite the target ids of a relocation, keeping indexes consistent.
    pub fn retarget(&mut self, id: u64, symbol_id: u64, symbol_section_id: u64) -> Result<()> {
        let row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| Error::Malformed(format!("no relocation with id 0x{id:x}")))?;
        let old_section = row.symbol_section_id;
        row.symbol_id = symbol_id;
        row.symbol_section_id = symbol_section_id;
        if old_section != symbol_section_id {
            index_remove(&mut self.by_symbol_section, &old_section, id);
            index_insert(&mut self.by_symbol_section, symbol_section_id, id);
        }
        Ok(())
    }

    pub fn find_by_section(&self, section_id: u64) -> Vec<&RelocationRow> {
        index_get(&self.by_section, &section_id)
            .into_iter()
            .filter_map(|id| self.rows.get(&id))
            .collect()
    }

    pub fn find_by_symbol_name(&self, name: &str) -> Vec<&RelocationRow> {
        index_get(&self.by_symbol_name, &name.to_string())
            .into_iter()
            .filter_map(|id| self.rows.get(&id))
            .collect()
    }

    pub fn find_by_symbol_section(&self, symbol_section_id: u64) -> Vec<&RelocationRow> {
        index_get(&self.by_symbol_section, &symbol_section_id)
            .into_iter()
            .filter_map(|id| self.rows.get(&id))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelocationRow> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::{RelocationKind, SectionKind, SymbolKind, SymbolScope};

    fn section(id: u64, implementation_id: u64, module_id: u64, name: &str) -> SectionRow {
        SectionRow {
            id,
            module_id,
            implementation_id,
            name: name.into(),
            kind: SectionKind::Text,
            alignment: 16,
            class: 2,
            size: 0,
            bytes: Some(Vec::new()),
        }
    }

    #[test]
    fn sequences_start_above_the_reserved_ids() {
        let mut seq = Sequence::default();
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.next(), 3);
        assert_eq!(seq.peek(), 4);
    }

    #[test]
    fn unique_names_are_enforced() {
        let mut modules = ModuleTable::default();
        modules.insert(ModuleRow { id: 2, name: "videolib".into() }).unwrap();
        assert!(modules.insert(ModuleRow { id: 3, name: "videolib".into() }).is_err());
        assert!(modules.insert(ModuleRow { id: 2, name: "netlib".into() }).is_err());
        assert_eq!(modules.find_by_name("videolib").unwrap().id, 2);
    }

    #[test]
    fn secondary_indexes_follow_removal() {
        let mut sections = SectionTable::default();
        sections.insert(section(2, 10, 20, ".text")).unwrap();
        sections.insert(section(3, 10, 20, ".data")).unwrap();
        sections.insert(section(4, 11, 20, ".text")).unwrap();
        assert_eq!(sections.find_by_implementation(10).len(), 2);
        assert_eq!(sections.find_by_module(20).len(), 3);
        assert_eq!(sections.find_by_name(".text").len(), 2);

        sections.remove(2).unwrap();
        assert_eq!(sections.find_by_implementation(10).len(), 1);
        assert_eq!(sections.find_by_name(".text").len(), 1);
        assert!(sections.get(2).is_none());
    }

    #[test]
    fn results_come_back_in_ascending_id_order() {
        let mut symbols = SymbolTable::default();
        for id in [9, 3, 7, 5] {
            symbols
                .insert(SymbolRow {
                    id,
                    implementation_id: 1,
                    section_id: 2,
                    name: format!("sym{id}"),
                    kind: SymbolKind::Function,
                    scope: SymbolScope::Global,
                    value: 0,
                    size: 0,
                })
                .unwrap();
        }
        let ids: Vec<u64> = symbols.find_by_section(2).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 5, 7, 9]);
    }

    #[test]
    fn retarget_moves_the_symbol_section_index() {
        let mut relocations = RelocationTable::default();
        relocations
            .insert(RelocationRow {
                id: 2,
                section_id: 5,
                symbol_id: 0,
                symbol_name: "f".into(),
                symbol_section_id: 0,
                kind: RelocationKind::Pc32,
                offset: 4,
                addend: -4,
            })
            .unwrap();
        assert_eq!(relocations.find_by_symbol_section(0).len(), 1);
        relocations.retarget(2, 9, 6).unwrap();
        assert!(relocations.find_by_symbol_section(0).is_empty());
        assert_eq!(relocations.find_by_symbol_section(6).len(), 1);
        assert_eq!(relocations.get(2).unwrap().symbol_id, 9);
    }
}
