//! Directory scanning for plugin candidates
//!
//! Discovery never instantiates a plugin. It reads module metadata through
//! [`PluginLoader::inspect`], merges sidecar manifests and reports every
//! module it finds, valid or not.

use crate::error::Result;
use crate::loader::PluginLoader;
use crate::manifest::{PluginManifest, DEFAULT_MANIFEST_NAME};
use keel_plugin_api::{LoadPriority, PluginMetadata};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A module found on disk
#[derive(Debug, Clone, Serialize)]
pub struct PluginCandidate {
    /// Module path (or manifest path when no module was found)
    pub path: PathBuf,
    /// Sidecar manifest, if any
    pub manifest_path: Option<PathBuf>,
    /// Plugin name, or the file stem when metadata is unavailable
    pub name: String,
    /// Merged metadata
    pub metadata: Option<PluginMetadata>,
    /// Whether the candidate can be loaded
    pub valid: bool,
    /// Why it cannot be loaded
    pub error_message: Option<String>,
}

impl PluginCandidate {
    fn invalid(path: PathBuf, name: String, message: impl Into<String>) -> Self {
        Self {
            path,
            manifest_path: None,
            name,
            metadata: None,
            valid: false,
            error_message: Some(message.into()),
        }
    }

    /// Load tier, `normal` when metadata is unavailable
    pub fn priority(&self) -> LoadPriority {
        self.metadata
            .as_ref()
            .map_or(LoadPriority::Normal, PluginMetadata::load_priority)
    }

    /// Whether the merged tags contain `tag`
    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata
            .as_ref()
            .map_or(false, |m| m.tags.contains(tag))
    }
}

/// Candidate ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// Load tier, then name
    Priority,
    /// Name
    Name,
    /// Newest version first, then name
    Version,
}

/// Scans directories for plugin modules and manifests
#[derive(Debug, Clone)]
pub struct PluginDiscovery {
    loader: Arc<PluginLoader>,
    directories: Arc<RwLock<Vec<PathBuf>>>,
    recursive: bool,
    manifest_name: String,
    candidates: Arc<RwLock<Vec<PluginCandidate>>>,
}

impl PluginDiscovery {
    /// Create a discovery over no directories
    pub fn new(loader: Arc<PluginLoader>) -> Self {
        Self {
            loader,
            directories: Arc::new(RwLock::new(Vec::new())),
            recursive: false,
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            candidates: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Descend into subdirectories
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Use a different sidecar manifest name
    pub fn with_manifest_name(mut self, name: impl Into<String>) -> Self {
        self.manifest_name = name.into();
        self
    }

    /// Add a directory to scan
    pub fn add_directory(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        let mut dirs = self.directories.write();
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }

    /// Stop scanning a directory
    pub fn remove_directory(&self, dir: &Path) -> bool {
        let mut dirs = self.directories.write();
        let before = dirs.len();
        dirs.retain(|d| d != dir);
        dirs.len() != before
    }

    /// Directories scanned by [`scan`](Self::scan)
    pub fn directories(&self) -> Vec<PathBuf> {
        self.directories.read().clone()
    }

    /// Rescan all directories, replacing the cached candidates
    pub fn scan(&self) -> Vec<PluginCandidate> {
        let mut found = Vec::new();
        for dir in self.directories() {
            found.extend(self.scan_directory(&dir));
        }

        let mut seen = HashSet::new();
        found.retain(|candidate| {
            if seen.insert(candidate.name.clone()) {
                true
            } else {
                warn!(
                    plugin = %candidate.name,
                    path = %candidate.path.display(),
                    "Duplicate plugin ignored"
                );
                false
            }
        });

        info!(
            total = found.len(),
            valid = found.iter().filter(|c| c.valid).count(),
            "Plugin discovery finished"
        );

        *self.candidates.write() = found.clone();
        found
    }

    /// Scan a single directory without touching the cache
    pub fn scan_directory(&self, dir: &Path) -> Vec<PluginCandidate> {
        let mut candidates = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let entries = match std::fs::read_dir(&current) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %current.display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
            };

            let mut modules = Vec::new();
            let mut subdirs = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    subdirs.push(path);
                } else if is_module_file(&path) {
                    modules.push(path);
                }
            }
            modules.sort();
            subdirs.sort();

            candidates.extend(self.candidates_in(&current, modules));

            if self.recursive {
                pending.extend(subdirs.into_iter().rev());
            }
        }

        candidates
    }

    fn candidates_in(&self, dir: &Path, modules: Vec<PathBuf>) -> Vec<PluginCandidate> {
        let manifest_path = dir.join(&self.manifest_name);
        let manifest = manifest_path
            .is_file()
            .then(|| PluginManifest::load(&manifest_path).map_err(|e| e.to_string()));

        if modules.is_empty() {
            return match manifest {
                Some(Ok(manifest)) => {
                    let name = manifest.name.clone().unwrap_or_else(|| file_stem(dir));
                    let mut candidate = PluginCandidate::invalid(
                        manifest_path.clone(),
                        name,
                        "manifest has no loadable module",
                    );
                    candidate.manifest_path = Some(manifest_path);
                    candidate.metadata = manifest.to_metadata().ok();
                    vec![candidate]
                }
                Some(Err(message)) => {
                    let mut candidate =
                        PluginCandidate::invalid(manifest_path.clone(), file_stem(dir), message);
                    candidate.manifest_path = Some(manifest_path);
                    vec![candidate]
                }
                None => Vec::new(),
            };
        }

        modules
            .into_iter()
            .map(|module| {
                let mut candidate = self.inspect_module(&module);

                match &manifest {
                    Some(Ok(manifest)) if manifest_applies(manifest, &module, &candidate.name) => {
                        candidate.manifest_path = Some(manifest_path.clone());
                        if let Some(metadata) = candidate.metadata.as_mut() {
                            manifest.merge_into(metadata);
                        }
                    }
                    Some(Err(message)) => {
                        candidate.manifest_path = Some(manifest_path.clone());
                        candidate.valid = false;
                        candidate.error_message = Some(message.clone());
                    }
                    _ => {}
                }

                candidate
            })
            .collect()
    }

    fn inspect_module(&self, module: &Path) -> PluginCandidate {
        match self.loader.inspect(module) {
            Ok(metadata) => PluginCandidate {
                path: module.to_path_buf(),
                manifest_path: None,
                name: metadata.name.clone(),
                metadata: Some(metadata),
                valid: true,
                error_message: None,
            },
            Err(e) => {
                debug!(path = %module.display(), error = %e, "Module rejected during discovery");
                PluginCandidate::invalid(module.to_path_buf(), file_stem(module), e.to_string())
            }
        }
    }

    /// Candidates from the last scan
    pub fn candidates(&self) -> Vec<PluginCandidate> {
        self.candidates.read().clone()
    }

    /// Candidate by plugin name
    pub fn find(&self, name: &str) -> Option<PluginCandidate> {
        self.candidates.read().iter().find(|c| c.name == name).cloned()
    }

    /// Candidates carrying `tag`
    pub fn find_by_tag(&self, tag: &str) -> Vec<PluginCandidate> {
        self.filter(|c| c.has_tag(tag))
    }

    /// Candidates matching `predicate`
    pub fn filter<F>(&self, predicate: F) -> Vec<PluginCandidate>
    where
        F: Fn(&PluginCandidate) -> bool,
    {
        self.candidates
            .read()
            .iter()
            .filter(|c| predicate(c))
            .cloned()
            .collect()
    }

    /// Cached candidates sorted by `key`
    pub fn sorted(&self, key: SortKey) -> Vec<PluginCandidate> {
        let mut candidates = self.candidates();
        sort_candidates(&mut candidates, key);
        candidates
    }

    /// Apply the sidecar manifest next to `module`, if one applies to it
    pub fn merge_sidecar(&self, module: &Path, metadata: &mut PluginMetadata) -> Result<bool> {
        let Some(dir) = module.parent() else {
            return Ok(false);
        };
        let manifest_path = dir.join(&self.manifest_name);
        if !manifest_path.is_file() {
            return Ok(false);
        }
        let manifest = PluginManifest::load(&manifest_path)?;
        if !manifest_applies(&manifest, module, &metadata.name) {
            return Ok(false);
        }
        manifest.merge_into(metadata);
        Ok(true)
    }

    /// Write `metadata` as a manifest into `dir`
    pub fn save_manifest(&self, metadata: &PluginMetadata, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(&self.manifest_name);
        PluginManifest::from_metadata(metadata).save(&path)?;
        info!(plugin = %metadata.name, path = %path.display(), "Manifest saved");
        Ok(path)
    }
}

/// Sort candidates in place
pub fn sort_candidates(candidates: &mut [PluginCandidate], key: SortKey) {
    match key {
        SortKey::Priority => candidates.sort_by(|a, b| {
            a.priority()
                .rank()
                .cmp(&b.priority().rank())
                .then_with(|| a.name.cmp(&b.name))
        }),
        SortKey::Name => candidates.sort_by(|a, b| a.name.cmp(&b.name)),
        SortKey::Version => candidates.sort_by(|a, b| {
            let version = |c: &PluginCandidate| c.metadata.as_ref().map(|m| m.version.clone());
            version(b)
                .cmp(&version(a))
                .then_with(|| a.name.cmp(&b.name))
        }),
    }
}

fn is_module_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(std::env::consts::DLL_EXTENSION)
}

/// A manifest names its module through `library`, or else through `name`
fn manifest_applies(manifest: &PluginManifest, module: &Path, plugin: &str) -> bool {
    match &manifest.library {
        Some(library) => module.file_name().and_then(|n| n.to_str()) == Some(library.as_str()),
        None => manifest.name.as_deref() == Some(plugin),
    }
}

fn file_stem(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    if is_module_file(path) {
        stem.strip_prefix("lib").unwrap_or(stem).to_string()
    } else {
        stem.to_string()
    }
}
