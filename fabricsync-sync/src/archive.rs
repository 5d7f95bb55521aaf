//! What happens to a raw file after it has been ingested.
//!
//! No strategy deletes user data outright: every variant either renames the
//! file, moves it, or copies it before dropping the original.

use std::path::{Path, PathBuf};

use chrono::Utc;

use fabricsync_core::types::ArchiveStrategy;

use crate::error::{io_err, SyncError};
use crate::layout::FabricLayout;

pub const ARCHIVED_SUFFIX: &str = "archived";

pub trait Archiver: Send + Sync {
    /// Archive `file`; returns where it went, or `None` if left in place.
    fn archive(&self, file: &Path) -> Result<Option<PathBuf>, SyncError>;
}

/// `raw/x.yaml` → `raw/x.yaml.archived`
pub struct RenameWithSuffix;

impl Archiver for RenameWithSuffix {
    fn archive(&self, file: &Path) -> Result<Option<PathBuf>, SyncError> {
        let target = unique_destination(PathBuf::from(format!(
            "{}.{ARCHIVED_SUFFIX}",
            file.display()
        )));
        std::fs::rename(file, &target).map_err(|e| io_err(file, e))?;
        Ok(Some(target))
    }
}

/// `raw/a/x.yaml` → `archive/a/x.yaml`
pub struct MoveToArchive {
    raw_root: PathBuf,
    archive_root: PathBuf,
}

impl Archiver for MoveToArchive {
    fn archive(&self, file: &Path) -> Result<Option<PathBuf>, SyncError> {
        let target = unique_destination(mirror(file, &self.raw_root, &self.archive_root));
        create_parent(&target)?;
        if std::fs::rename(file, &target).is_err() {
            // Cross-device: fall back to copy, then drop the original.
            std::fs::copy(file, &target).map_err(|e| io_err(&target, e))?;
            std::fs::remove_file(file).map_err(|e| io_err(file, e))?;
        }
        Ok(Some(target))
    }
}

/// Copy to `archive/a/x.<timestamp>.yaml`, then drop the raw original.
pub struct TimestampedCopy {
    raw_root: PathBuf,
    archive_root: PathBuf,
}

impl Archiver for TimestampedCopy {
    fn archive(&self, file: &Path) -> Result<Option<PathBuf>, SyncError> {
        let mirrored = mirror(file, &self.raw_root, &self.archive_root);
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let stem = mirrored
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match mirrored.extension() {
            Some(ext) => format!("{stem}.{stamp}.{}", ext.to_string_lossy()),
            None => format!("{stem}.{stamp}"),
        };
        let target = unique_destination(mirrored.with_file_name(name));
        create_parent(&target)?;
        std::fs::copy(file, &target).map_err(|e| io_err(&target, e))?;
        std::fs::remove_file(file).map_err(|e| io_err(file, e))?;
        Ok(Some(target))
    }
}

pub struct KeepInPlace;

impl Archiver for KeepInPlace {
    fn archive(&self, _file: &Path) -> Result<Option<PathBuf>, SyncError> {
        Ok(None)
    }
}

pub fn archiver_for(strategy: ArchiveStrategy, layout: &FabricLayout) -> Box<dyn Archiver> {
    match strategy {
        ArchiveStrategy::RenameWithSuffix => Box::new(RenameWithSuffix),
        ArchiveStrategy::MoveToArchive => Box::new(MoveToArchive {
            raw_root: layout.raw.clone(),
            archive_root: layout.archive.clone(),
        }),
        ArchiveStrategy::TimestampedCopy => Box::new(TimestampedCopy {
            raw_root: layout.raw.clone(),
            archive_root: layout.archive.clone(),
        }),
        ArchiveStrategy::None => Box::new(KeepInPlace),
    }
}

fn mirror(file: &Path, from: &Path, to: &Path) -> PathBuf {
    match file.strip_prefix(from) {
        Ok(rel) => to.join(rel),
        Err(_) => to.join(file.file_name().unwrap_or_default()),
    }
}

fn create_parent(path: &Path) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    Ok(())
}

/// `path`, or `path.1`, `path.2`, … if taken.
fn unique_destination(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    (1u32..)
        .map(|n| PathBuf::from(format!("{}.{n}", path.display())))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}
