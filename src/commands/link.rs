//! Link a store into a bootable image.

use crate::image;
use crate::link::{LinkOptions, Linker};
use crate::store::Store;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Link the program rooted at an entry symbol and emit an image.
#[derive(Parser, Debug)]
pub struct LinkCommand {
    /// Path to the metadata store.
    #[clap(long, short = 'd', value_name = "PATH")]
    db_file: PathBuf,

    /// Entry point symbol; defaults to the store config.
    #[clap(long, short = 'e', value_name = "SYMBOL")]
    entrypoint: Option<String>,

    /// Physical link base.
    #[clap(long, value_name = "ADDR")]
    program_start_physical: Option<u64>,

    /// Virtual link base.
    #[clap(long, value_name = "ADDR")]
    program_start_virtual: Option<u64>,

    /// Close over every module reachable from the entry point.
    #[clap(long, short = 'r')]
    recursive: bool,

    /// Emit a PE32+ EFI application instead of the flat format.
    #[clap(long)]
    for_efi: bool,

    /// Path of the emitted image.
    #[clap(long, short = 'o', value_name = "PATH")]
    output_file: Option<PathBuf>,

    /// Dump the materialized modules and the GOT to stdout.
    #[clap(long)]
    print: bool,
}

impl LinkCommand {
    pub fn execute(self) -> Result<()> {
        let store = Store::open(&self.db_file)
            .with_context(|| format!("cannot open store {}", self.db_file.display()))?;

        let entrypoint = match self.entrypoint.or_else(|| store.entry_point()) {
            Some(name) => name,
            None => bail!("no entry point given and none configured in the store"),
        };
        let base = store.program_base();
        let options = LinkOptions {
            entrypoint,
            program_start_physical: self.program_start_physical.unwrap_or(base),
            program_start_virtual: self.program_start_virtual.unwrap_or(base),
            recursive: self.recursive,
            with_symbol_names: true,
        };
        if self.for_efi && self.output_file.is_none() {
            bail!("--for-efi requires --output-file");
        }

        let linker = Linker::link(&store, options).context("link failed")?;

        if let Some(output) = &self.output_file {
            let image = if self.for_efi {
                image::pe::emit(&linker).context("cannot emit PE image")?
            } else {
                image::flat::emit(&linker, store.stack_size())
                    .context("cannot emit flat image")?
            };
            fs::write(output, &image)
                .with_context(|| format!("cannot write {}", output.display()))?;
            println!("wrote {} ({} bytes)", output.display(), image.len());
        }

        if self.print {
            let stdout = io::stdout();
            linker.dump(&mut stdout.lock()).context("cannot dump context")?;
        }
        Ok(())
    }
}
