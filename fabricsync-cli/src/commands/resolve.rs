//! `fabricsync resolve <fabric> <kind> <name> --keep desired|actual`

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};

use fabricsync_core::types::{ConflictResolution, ResourceKey};

use super::{block_on, home, load_fabric, orchestrator, print_operation, CLI_INITIATOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Keep {
    /// Keep the desired spec; it is pushed again on the next cycle.
    Desired,
    /// Adopt the observed actual spec as the new desired spec.
    Actual,
}

/// Close an open conflict on one resource.
#[derive(Args, Debug)]
pub struct ResolveArgs {
    pub fabric: String,
    pub kind: String,
    pub name: String,

    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Which side survives.
    #[arg(long, value_enum)]
    pub keep: Keep,
}

impl ResolveArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        load_fabric(&home, &self.fabric)?;
        let key = ResourceKey::new(
            self.fabric.as_str(),
            self.namespace.as_str(),
            self.kind.as_str(),
            self.name.as_str(),
        );
        let resolution = match self.keep {
            Keep::Desired => ConflictResolution::KeepDesired,
            Keep::Actual => ConflictResolution::TakeActual,
        };
        let operator = std::env::var("USER").unwrap_or_else(|_| CLI_INITIATOR.to_string());

        let orchestrator = orchestrator(&home)?;
        let op = block_on(orchestrator.resolve_conflict(&key, resolution, &operator))?
            .with_context(|| format!("failed to resolve conflict on {key}"))?;
        print_operation(&op);
        Ok(())
    }
}
