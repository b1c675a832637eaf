//! Ingest object files into a metadata store.

use crate::ingest::{IngestStats, fix_relocation_targets, ingest_object};
use crate::store::Store;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Parse object files into the metadata store, then resolve relocation
/// targets by name.
#[derive(Parser, Debug)]
pub struct IngestCommand {
    /// Path to the metadata store; created if absent.
    #[clap(long, short = 'd', value_name = "PATH")]
    db_file: PathBuf,

    /// Entry point symbol recorded in the store config.
    #[clap(long, short = 'e', value_name = "SYMBOL", default_value = "___kstart64")]
    entrypoint: String,

    /// Default stack size recorded in the store config.
    #[clap(long, value_name = "BYTES", default_value_t = 0x10000)]
    stack_size: u64,

    /// Default program base recorded in the store config.
    #[clap(long, value_name = "ADDR", default_value_t = 0x200000)]
    program_base: u64,

    /// Object files to ingest, in order.
    #[clap(required = true, value_name = "OBJECT")]
    objects: Vec<PathBuf>,
}

impl IngestCommand {
    pub fn execute(self) -> Result<()> {
        let mut store = Store::open(&self.db_file)
            .with_context(|| format!("cannot open store {}", self.db_file.display()))?;

        if store.entry_point().is_none() {
            store.set_entry_point(&self.entrypoint);
            store.set_stack_size(self.stack_size);
            store.set_program_base(self.program_base);
        }

        let mut totals = IngestStats::default();
        for object in &self.objects {
            let stats = ingest_object(&mut store, object)
                .with_context(|| format!("cannot ingest {}", object.display()))?;
            totals.add(&stats);
        }
        println!(
            "added\n\tmodules: {}\n\timplementations: {}\n\tsections: {}\n\tsymbols: {}\n\trelocations: {}",
            totals.modules, totals.implementations, totals.sections, totals.symbols, totals.relocations
        );

        let report = fix_relocation_targets(&mut store).context("relocation fixup failed")?;
        if !report.unresolved.is_empty() {
            println!("unresolved symbols: {}", report.unresolved.join(", "));
        }
        if !report.duplicates.is_empty() {
            println!("duplicated symbols: {}", report.duplicates.join(", "));
        }

        store.compact().context("cannot compact store")?;
        Ok(())
    }
}
