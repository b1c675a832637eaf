//! The `hob` driver: ingest object files into a metadata store and link
//! stores into bootable images.

use anyhow::Result;
use clap::Parser;
use hobgoblin::commands::{IngestCommand, LinkCommand};

#[derive(Parser)]
#[clap(name = "hob", version, about = "object ingester and linker")]
struct Hob {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Ingest object files into a metadata store.
    Ingest(IngestCommand),
    /// Link a store into a bootable image.
    Link(LinkCommand),
}

fn main() -> Result<()> {
    env_logger::init();
    match Hob::parse().command {
        Command::Ingest(command) => command.execute(),
        Command::Link(command) => command.execute(),
    }
}
