//! File ingestion: `raw/` → `managed/` → desired state.
//!
//! A pass walks `raw/` recursively, splits each file into documents, keeps
//! the ones that look like custom resources and writes each one as a
//! normalized file under `managed/<namespace>/<kind>/<name>.yaml`. The
//! desired side of the store is updated from the managed copy, and the raw
//! file is archived once every resource in it has landed.
//!
//! Failures are collected per file or per document; one bad file never
//! aborts the batch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use fabricsync_core::types::{Fabric, FabricName, ResourceKey, SyncDirection, DEFAULT_NAMESPACE};

use crate::archive::archiver_for;
use crate::cancel::CancelFlag;
use crate::error::{invalid, io_err, SyncError};
use crate::hash_store::{self, digest_bytes, digest_value, HashStoreFile};
use crate::layout::{slash_path, FabricLayout, KEEP_MARKER, MANAGED_DIR};
use crate::store::{DesiredState, ResourceFilter, ResourceStore};
use crate::writer::{self, WriteResult};

/// File extensions considered during discovery.
pub const RECOGNIZED_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Top-level keys never folded into a spec.
const ENVELOPE_KEYS: [&str; 4] = ["apiVersion", "kind", "metadata", "status"];

// ---------------------------------------------------------------------------
// 1. Discovery
// ---------------------------------------------------------------------------

/// Lazy recursive walk yielding recognized files in sorted order.
///
/// Hidden directories (`.git`, …), keep-markers and writer temp files are
/// skipped. A missing root yields nothing.
pub struct Discover {
    dirs: Vec<PathBuf>,
    files: std::vec::IntoIter<PathBuf>,
}

pub fn discover(root: &Path) -> Discover {
    Discover {
        dirs: vec![root.to_path_buf()],
        files: Vec::new().into_iter(),
    }
}

impl Iterator for Discover {
    type Item = Result<PathBuf, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(file) = self.files.next() {
                return Some(Ok(file));
            }
            let dir = self.dirs.pop()?;
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Some(Err(io_err(dir, e))),
            };

            let mut files = Vec::new();
            let mut subdirs = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                match entry.file_type() {
                    Ok(t) if t.is_dir() && !hidden => subdirs.push(path),
                    Ok(t) if t.is_file() && is_recognized(&path) => files.push(path),
                    _ => {}
                }
            }
            files.sort();
            subdirs.sort();
            subdirs.reverse();
            self.dirs.extend(subdirs);
            self.files = files.into_iter();
        }
    }
}

pub fn is_recognized(path: &Path) -> bool {
    if path.file_name().map_or(true, |n| n == KEEP_MARKER) {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| {
            RECOGNIZED_EXTENSIONS
                .iter()
                .any(|r| r.eq_ignore_ascii_case(e))
        })
}

// ---------------------------------------------------------------------------
// 2. Parsing
// ---------------------------------------------------------------------------

/// Split `content` into documents. `.json` files hold one document or an
/// array of them; anything else is treated as multi-document YAML.
pub fn parse_documents(path: &Path, content: &str) -> Result<Vec<Value>, SyncError> {
    let is_json = path
        .extension()
        .map_or(false, |e| e.eq_ignore_ascii_case("json"));
    if is_json {
        return match serde_json::from_str::<Value>(content) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(doc) => Ok(vec![doc]),
            Err(e) => Err(invalid(path, e.to_string())),
        };
    }

    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document).map_err(|e| invalid(path, e.to_string()))?;
        docs.push(value);
    }
    Ok(docs)
}

/// A document recognised as a custom resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomResource {
    pub api_version: Option<String>,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub spec: Value,
}

impl CustomResource {
    /// `None` unless `doc` is a mapping with `kind` and `metadata.name`.
    pub fn from_document(doc: &Value) -> Option<Self> {
        let obj = doc.as_object()?;
        let kind = non_empty_segment(obj.get("kind")?)?;
        let metadata = obj.get("metadata")?.as_object()?;
        let name = non_empty_segment(metadata.get("name")?)?;
        let namespace = match metadata.get("namespace") {
            Some(ns) => non_empty_segment(ns)?,
            None => DEFAULT_NAMESPACE.to_string(),
        };

        let spec = match obj.get("spec") {
            Some(spec) => spec.clone(),
            None => Value::Object(
                obj.iter()
                    .filter(|(k, _)| !ENVELOPE_KEYS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        };

        Some(Self {
            api_version: obj
                .get("apiVersion")
                .and_then(Value::as_str)
                .map(str::to_string),
            kind,
            namespace,
            name,
            labels: string_map(metadata.get("labels")),
            annotations: string_map(metadata.get("annotations")),
            spec,
        })
    }

    pub fn key(&self, fabric: &FabricName) -> ResourceKey {
        ResourceKey::new(
            fabric.clone(),
            self.namespace.clone(),
            self.kind.clone(),
            self.name.clone(),
        )
    }

    /// `<namespace>/<kind>/<name>.yaml`, relative to `managed/`.
    pub fn managed_relative_path(&self) -> PathBuf {
        managed_relative_path(&self.namespace, &self.kind, &self.name)
    }

    /// The normalized document written to `managed/`.
    pub fn to_document(&self) -> Value {
        let mut metadata = Map::new();
        metadata.insert("name".into(), Value::String(self.name.clone()));
        metadata.insert("namespace".into(), Value::String(self.namespace.clone()));
        if !self.labels.is_empty() {
            metadata.insert("labels".into(), string_map_value(&self.labels));
        }
        if !self.annotations.is_empty() {
            metadata.insert("annotations".into(), string_map_value(&self.annotations));
        }

        let mut doc = Map::new();
        if let Some(api_version) = &self.api_version {
            doc.insert("apiVersion".into(), Value::String(api_version.clone()));
        }
        doc.insert("kind".into(), Value::String(self.kind.clone()));
        doc.insert("metadata".into(), Value::Object(metadata));
        doc.insert("spec".into(), self.spec.clone());
        Value::Object(doc)
    }

    pub fn to_yaml(&self) -> Result<String, SyncError> {
        Ok(serde_yaml::to_string(&self.to_document())?)
    }

    /// Content digest of the normalized document.
    pub fn digest(&self) -> String {
        digest_value(&self.to_document())
    }

    /// Rebuild the desired side of a stored resource as a document.
    pub fn from_resource(r: &fabricsync_core::types::Resource) -> Option<Self> {
        Some(Self {
            api_version: r.api_version.clone(),
            kind: r.kind.clone(),
            namespace: r.namespace.clone(),
            name: r.name.clone(),
            labels: r.labels.clone(),
            annotations: r.annotations.clone(),
            spec: r.desired_spec.clone()?,
        })
    }
}

/// Kind keeps its case: `VPC` and `Vpc` are distinct kinds and must not share
/// a managed file.
pub fn managed_relative_path(namespace: &str, kind: &str, name: &str) -> PathBuf {
    PathBuf::from(namespace)
        .join(kind)
        .join(format!("{name}.yaml"))
}

/// All custom resources in a file; non-CR documents are dropped.
pub fn custom_resources(path: &Path, content: &str) -> Result<(Vec<CustomResource>, u32), SyncError> {
    let docs = parse_documents(path, content)?;
    let total = docs.len();
    let crs: Vec<_> = docs.iter().filter_map(CustomResource::from_document).collect();
    let skipped = u32::try_from(total - crs.len()).unwrap_or(u32::MAX);
    Ok((crs, skipped))
}

/// Identity segments end up in file paths, so separators are rejected.
fn non_empty_segment(v: &Value) -> Option<String> {
    let s = v.as_str()?.trim();
    if s.is_empty() || s == "." || s == ".." || s.contains(['/', '\\']) {
        return None;
    }
    Some(s.to_string())
}

fn string_map(v: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = v else {
        return BTreeMap::new();
    };
    map.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

fn string_map_value(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// 3. Ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub dry_run: bool,
    /// Commit the files came from, if pulled from version control.
    pub commit: Option<String>,
}

/// A file or document that could not be ingested.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestFailure {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub files_discovered: u32,
    pub files_processed: u32,
    /// Raw files whose content was already ingested.
    pub files_unchanged: u32,
    /// Documents that were not custom resources.
    pub documents_skipped: u32,
    pub managed_created: u32,
    pub managed_updated: u32,
    pub managed_unchanged: u32,
    /// Desired-side writes to the store.
    pub upserts: u32,
    pub removals: u32,
    pub archived: Vec<PathBuf>,
    pub failures: Vec<IngestFailure>,
    pub cancelled: bool,
}

impl IngestReport {
    fn fail(&mut self, path: &Path, key: Option<&ResourceKey>, err: &SyncError) {
        tracing::warn!("ingest failure at {}: {err}", path.display());
        self.failures.push(IngestFailure {
            path: path.to_path_buf(),
            key: key.map(ToString::to_string),
            message: err.to_string(),
        });
    }
}

/// One ingestion pass over a fabric.
pub struct Ingestor<'a> {
    home: &'a Path,
    fabric: &'a Fabric,
    store: &'a ResourceStore,
    layout: FabricLayout,
    cancel: CancelFlag,
}

impl<'a> Ingestor<'a> {
    pub fn new(home: &'a Path, fabric: &'a Fabric, store: &'a ResourceStore) -> Self {
        Self {
            home,
            fabric,
            store,
            layout: FabricLayout::for_fabric(fabric),
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Ingest `raw/`, then reconcile the store with `managed/`.
    pub fn run(&self, options: &IngestOptions) -> Result<IngestReport, SyncError> {
        let mut report = IngestReport::default();
        let mut hashes = hash_store::load_at(self.home, &self.fabric.name)?;
        let archiver = archiver_for(self.fabric.archive_strategy, &self.layout);
        let mut seen: HashMap<ResourceKey, PathBuf> = HashMap::new();

        for file in discover(&self.layout.raw) {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let file = match file {
                Ok(file) => file,
                Err(e) => {
                    report.fail(&self.layout.raw, None, &e);
                    continue;
                }
            };
            report.files_discovered += 1;

            let outcome = self.ingest_file(&file, &mut hashes, &mut seen, options, &mut report);
            match outcome {
                Ok(true) if !options.dry_run => match archiver.archive(&file) {
                    Ok(Some(dest)) => {
                        tracing::debug!("archived {} -> {}", file.display(), dest.display());
                        report.archived.push(dest);
                    }
                    Ok(None) => {}
                    Err(e) => report.fail(&file, None, &e),
                },
                Ok(_) => {}
                Err(e) => report.fail(&file, None, &e),
            }
        }

        if !report.cancelled {
            self.reconcile_managed(&mut hashes, options, &mut report)?;
        }

        if !options.dry_run {
            hashes.synced_at = Utc::now();
            hash_store::save_at(self.home, &self.fabric.name, &hashes)?;
        }

        tracing::info!(
            "ingested {}: {} file(s), {} upsert(s), {} failure(s)",
            self.fabric.name,
            report.files_processed,
            report.upserts,
            report.failures.len()
        );
        Ok(report)
    }

    /// Returns `true` when the file should be archived.
    fn ingest_file(
        &self,
        file: &Path,
        hashes: &mut HashStoreFile,
        seen: &mut HashMap<ResourceKey, PathBuf>,
        options: &IngestOptions,
        report: &mut IngestReport,
    ) -> Result<bool, SyncError> {
        let content = std::fs::read_to_string(file).map_err(|e| io_err(file, e))?;
        let rel = self.layout.relative(file);
        let digest = digest_bytes(content.as_bytes());
        if hashes.files.get(&rel) == Some(&digest) {
            report.files_unchanged += 1;
            return Ok(false);
        }

        let (crs, skipped) = custom_resources(file, &content)?;
        report.files_processed += 1;
        report.documents_skipped += skipped;

        let mut clean = true;
        for cr in &crs {
            let key = cr.key(&self.fabric.name);
            if let Some(first) = seen.get(&key) {
                let err = SyncError::Constraint {
                    key: key.clone(),
                    reason: format!("duplicate resource, first defined in {}", first.display()),
                };
                report.fail(file, Some(&key), &err);
                clean = false;
                continue;
            }
            seen.insert(key.clone(), file.to_path_buf());

            if let Err(e) = self.apply(cr, &key, Some(file), hashes, options, report) {
                report.fail(file, Some(&key), &e);
                clean = false;
            }
        }

        if clean && !options.dry_run {
            hashes.files.insert(rel, digest);
        }
        Ok(clean && !crs.is_empty())
    }

    /// Write the managed copy of `cr` and upsert its desired side.
    fn apply(
        &self,
        cr: &CustomResource,
        key: &ResourceKey,
        source: Option<&Path>,
        hashes: &mut HashStoreFile,
        options: &IngestOptions,
        report: &mut IngestReport,
    ) -> Result<(), SyncError> {
        let existing = self.store.get(key).ok();
        if let Some(r) = &existing {
            if r.autosync_halted() {
                return Err(SyncError::Conflict { key: key.clone() });
            }
            if r.sync_direction == SyncDirection::PushOnly && r.has_desired() {
                tracing::debug!("{key} is push-only; keeping local desired state");
                report.managed_unchanged += 1;
                return Ok(());
            }
        }

        let managed = self.layout.managed.join(cr.managed_relative_path());
        let hash_key = self.layout.relative(&managed);
        match writer::atomic_write(&managed, &hash_key, &cr.to_yaml()?, &mut hashes.files, options.dry_run)? {
            WriteResult::Created { .. } => report.managed_created += 1,
            WriteResult::Updated { .. } => report.managed_updated += 1,
            WriteResult::Unchanged { .. } => report.managed_unchanged += 1,
            WriteResult::WouldWrite { .. } if existing.is_some() => report.managed_updated += 1,
            WriteResult::WouldWrite { .. } => report.managed_created += 1,
        }

        let digest = cr.digest();
        if options.dry_run
            || existing.as_ref().and_then(|r| r.file_hash.as_deref()) == Some(digest.as_str())
        {
            return Ok(());
        }

        self.store.upsert_desired(
            key,
            DesiredState {
                spec: cr.spec.clone(),
                commit: options.commit.clone(),
                file_path: source.map(Path::to_path_buf),
                managed_file_path: Some(managed),
                file_hash: Some(digest),
                api_version: cr.api_version.clone(),
                labels: cr.labels.clone(),
                annotations: cr.annotations.clone(),
            },
        )?;
        report.upserts += 1;
        Ok(())
    }

    /// Bring the store in line with `managed/`: load files it has not seen,
    /// and drop desired state whose version-controlled file is gone.
    fn reconcile_managed(
        &self,
        hashes: &mut HashStoreFile,
        options: &IngestOptions,
        report: &mut IngestReport,
    ) -> Result<(), SyncError> {
        let mut present = BTreeSet::new();
        for file in discover(&self.layout.managed) {
            let file = match file {
                Ok(file) => file,
                Err(e) => {
                    report.fail(&self.layout.managed, None, &e);
                    continue;
                }
            };
            let content = match std::fs::read_to_string(&file) {
                Ok(content) => content,
                Err(e) => {
                    report.fail(&file, None, &io_err(&file, e));
                    continue;
                }
            };
            let crs = match custom_resources(&file, &content) {
                Ok((crs, _)) => crs,
                Err(e) => {
                    report.fail(&file, None, &e);
                    continue;
                }
            };
            present.insert(file.clone());
            if !options.dry_run {
                hashes
                    .files
                    .insert(self.layout.relative(&file), digest_bytes(content.as_bytes()));
            }

            for cr in crs {
                let key = cr.key(&self.fabric.name);
                let digest = cr.digest();
                let existing = self.store.get(&key).ok();
                if existing.as_ref().and_then(|r| r.file_hash.as_deref()) == Some(digest.as_str()) {
                    continue;
                }
                if existing.as_ref().map_or(false, |r| r.autosync_halted()) {
                    report.fail(&file, Some(&key), &SyncError::Conflict { key: key.clone() });
                    continue;
                }
                if options.dry_run {
                    continue;
                }
                let result = self.store.upsert_desired(
                    &key,
                    DesiredState {
                        spec: cr.spec.clone(),
                        commit: options.commit.clone(),
                        file_path: None,
                        managed_file_path: Some(file.clone()),
                        file_hash: Some(digest),
                        api_version: cr.api_version.clone(),
                        labels: cr.labels.clone(),
                        annotations: cr.annotations.clone(),
                    },
                );
                match result {
                    Ok(_) => report.upserts += 1,
                    Err(e) => report.fail(&file, Some(&key), &e),
                }
            }
        }

        if options.dry_run {
            return Ok(());
        }
        let managed_root = self.layout.managed.clone();
        for r in self.store.list_by_fabric(&self.fabric.name, &ResourceFilter::default()) {
            let gone = r.has_desired()
                && r.desired_commit.is_some()
                && r.managed_file_path
                    .as_ref()
                    .map_or(false, |p| p.starts_with(&managed_root) && !present.contains(p));
            if gone {
                tracing::info!("{} left managed/; clearing desired side", r.key());
                self.store.remove_desired(&r.key())?;
                report.removals += 1;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 4. Census
// ---------------------------------------------------------------------------

/// Distinct resource identities per tree of a fabric root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Census {
    pub raw: usize,
    pub managed: usize,
    pub archive: usize,
    /// Distinct identities across all three trees.
    pub unique: usize,
}

type Identity = (String, String, String);

pub fn census(layout: &FabricLayout) -> Result<Census, SyncError> {
    let raw = identities(&layout.raw)?;
    let managed = identities(&layout.managed)?;
    let archive = identities(&layout.archive)?;
    let unique = raw.union(&managed).chain(archive.iter()).collect::<BTreeSet<_>>().len();
    Ok(Census {
        raw: raw.len(),
        managed: managed.len(),
        archive: archive.len(),
        unique,
    })
}

/// Unparseable files are ignored; a census never fails on content.
fn identities(root: &Path) -> Result<BTreeSet<Identity>, SyncError> {
    let mut out = BTreeSet::new();
    for file in discover(root) {
        let file = file?;
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue;
        };
        let Ok((crs, _)) = custom_resources(&file, &content) else {
            continue;
        };
        out.extend(crs.into_iter().map(|cr| (cr.namespace, cr.kind, cr.name)));
    }
    Ok(out)
}

/// Managed-tree hash keys (`managed/…`) recorded for a fabric.
pub fn managed_hash_keys(hashes: &HashStoreFile) -> Vec<String> {
    let prefix = format!("{MANAGED_DIR}/");
    let mut keys: Vec<_> = hashes
        .files
        .keys()
        .filter(|k| k.starts_with(&prefix))
        .cloned()
        .collect();
    keys.sort();
    keys
}

/// `managed/<ns>/<kind>/<name>.yaml` as a hash-store key.
pub fn managed_hash_key(namespace: &str, kind: &str, name: &str) -> String {
    format!(
        "{MANAGED_DIR}/{}",
        slash_path(&managed_relative_path(namespace, kind, name))
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
