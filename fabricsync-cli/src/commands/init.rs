//! `fabricsync init <path> [--name <fabric>] [...]`

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use fabricsync_core::registry::{self, InitOptions};
use fabricsync_core::types::{ClusterRef, FabricName, OperationType, RepositoryRef};

use super::super::{ArchiveArg, PolicyArg, PriorityArg};
use super::{block_on, home, orchestrator, print_operation, CLI_INITIATOR};

/// Register a fabric and create its directory layout.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Fabric root directory (holds raw/, managed/ and the archive).
    pub path: PathBuf,

    /// Fabric name. Defaults to the root directory name.
    #[arg(long, short = 'n')]
    pub name: Option<String>,

    /// Scheduler priority: critical | high | medium | low | maintenance.
    #[arg(long)]
    pub priority: Option<PriorityArg>,

    /// Seconds between scheduled sync cycles.
    #[arg(long)]
    pub interval: Option<u64>,

    /// What happens to raw files after ingestion.
    #[arg(long)]
    pub archive: Option<ArchiveArg>,

    /// Conflict policy: manual | desired_wins | actual_wins.
    #[arg(long)]
    pub policy: Option<PolicyArg>,

    /// Version-control checkout holding the fabric's files.
    #[arg(long)]
    pub repository: Option<String>,

    /// Directory inside the repository for this fabric.
    #[arg(long, requires = "repository", default_value = "")]
    pub repo_path: String,

    #[arg(long, requires = "repository", default_value = "main")]
    pub branch: String,

    /// Cluster endpoint the actual state is collected from.
    #[arg(long)]
    pub cluster: Option<String>,

    /// Resource kinds collected from the cluster.
    #[arg(long, requires = "cluster", value_delimiter = ',')]
    pub kinds: Vec<String>,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        fs::create_dir_all(&self.path)
            .with_context(|| format!("cannot create '{}'", self.path.display()))?;
        let root = self
            .path
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.path.display()))?;

        let name = match self.name {
            Some(name) => name,
            None => root
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .context("cannot derive a fabric name from the path; pass --name")?,
        };
        let name = FabricName::from(name);

        let options = InitOptions {
            priority: self.priority.map(|p| p.0),
            sync_interval_secs: self.interval,
            archive_strategy: self.archive.map(|a| a.0),
            conflict_policy: self.policy.map(|p| p.0),
        };
        registry::init_at(root.clone(), name.clone(), options, &home)
            .with_context(|| format!("failed to register '{}' as '{name}'", root.display()))?;

        let repository = self.repository.map(|location| RepositoryRef {
            location,
            branch: self.branch,
            path: self.repo_path,
        });
        let cluster = self.cluster.map(|server| ClusterRef {
            server,
            kinds: self.kinds,
            credentials_env: None,
        });
        if repository.is_some() || cluster.is_some() {
            registry::update_fabric_at(&home, &name, |f| {
                if repository.is_some() {
                    f.repository = repository;
                }
                if cluster.is_some() {
                    f.cluster = cluster;
                }
            })
            .context("failed to record fabric endpoints")?;
        }

        println!("✓ Registered fabric '{name}' at {}", root.display());
        println!("  Saved to: ~/.fabricsync/fabrics/{name}.yaml");

        let orchestrator = orchestrator(&home)?;
        let op = block_on(orchestrator.run(&name, OperationType::DirectoryInit, CLI_INITIATOR))?
            .context("directory initialisation failed")?;
        print_operation(&op);
        Ok(())
    }
}
