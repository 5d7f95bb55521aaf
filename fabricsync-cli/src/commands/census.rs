//! `fabricsync census <fabric>`

use anyhow::{Context, Result};
use clap::Args;

use fabricsync_sync::{census, FabricLayout};

use super::{home, load_fabric};

/// Count custom resources per tree of a fabric root.
#[derive(Args, Debug)]
pub struct CensusArgs {
    pub fabric: String,

    #[arg(long)]
    pub json: bool,
}

impl CensusArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let fabric = load_fabric(&home, &self.fabric)?;
        let counts = census(&FabricLayout::for_fabric(&fabric))
            .with_context(|| format!("census failed for '{}'", self.fabric))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&counts).context("failed to serialize census")?
            );
            return Ok(());
        }
        println!("'{}' at {}", fabric.name, fabric.root.display());
        println!("  raw:      {}", counts.raw);
        println!("  managed:  {}", counts.managed);
        println!("  archive:  {}", counts.archive);
        println!("  unique:   {}", counts.unique);
        Ok(())
    }
}
