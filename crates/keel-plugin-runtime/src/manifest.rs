//! Sidecar `plugin.json` manifests

use crate::error::{Result, RuntimeError};
use keel_plugin_api::{PluginDependency, PluginMetadata, PluginVersion};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default manifest file name
pub const DEFAULT_MANIFEST_NAME: &str = "plugin.json";

/// Flat JSON manifest describing a plugin.
///
/// Every field is optional so partial manifests can fill gaps in a module's
/// embedded metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Human readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Homepage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// `MAJOR.MINOR.PATCH[-PRERELEASE]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// License identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Memory quota in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    /// CPU budget per update in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_limit: Option<u64>,
    /// Run inside a sandbox scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_required: Option<bool>,
    /// Tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PluginDependency>,
    /// Required permission names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_permissions: Vec<String>,
    /// Module file this manifest describes, relative to the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
}

impl PluginManifest {
    /// Read a manifest file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            RuntimeError::config(format!(
                "Failed to parse manifest file {}: {e}",
                path.display()
            ))
        })
    }

    /// Write this manifest as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Manifest describing `metadata` in full
    pub fn from_metadata(metadata: &PluginMetadata) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        Self {
            name: Some(metadata.name.clone()),
            display_name: non_empty(&metadata.display_name),
            description: non_empty(&metadata.description),
            author: non_empty(&metadata.author),
            website: non_empty(&metadata.website),
            version: Some(metadata.version.to_string()),
            license: non_empty(&metadata.license),
            memory_limit: Some(metadata.memory_limit),
            cpu_time_limit: Some(metadata.cpu_time_limit),
            sandbox_required: Some(metadata.sandbox_required),
            tags: metadata.tags.iter().cloned().collect(),
            dependencies: metadata.dependencies.clone(),
            required_permissions: metadata.required_permissions.clone(),
            library: None,
        }
    }

    /// Build metadata from the manifest alone
    pub fn to_metadata(&self) -> Result<PluginMetadata> {
        let name = self
            .name
            .clone()
            .ok_or_else(|| RuntimeError::config("manifest has no name"))?;
        let version: PluginVersion = self
            .version
            .as_deref()
            .ok_or_else(|| RuntimeError::config(format!("manifest of {name} has no version")))?
            .parse()?;

        let mut metadata = PluginMetadata::new(name, version);
        if let Some(display_name) = &self.display_name {
            metadata.display_name = display_name.clone();
        }
        if let Some(license) = &self.license {
            metadata.license = license.clone();
        }
        if let Some(limit) = self.memory_limit {
            metadata.memory_limit = limit;
        }
        if let Some(limit) = self.cpu_time_limit {
            metadata.cpu_time_limit = limit;
        }
        if let Some(sandbox) = self.sandbox_required {
            metadata.sandbox_required = sandbox;
        }
        metadata.dependencies = self.dependencies.clone();
        metadata.required_permissions = self.required_permissions.clone();
        self.merge_into(&mut metadata);

        Ok(metadata)
    }

    /// Fill manifest-only fields into metadata read from a module.
    ///
    /// The module wins for every field it already sets.
    pub fn merge_into(&self, metadata: &mut PluginMetadata) {
        fill(&mut metadata.description, &self.description);
        fill(&mut metadata.author, &self.author);
        fill(&mut metadata.website, &self.website);
        fill(&mut metadata.license, &self.license);
        if metadata.display_name.is_empty() || metadata.display_name == metadata.name {
            if let Some(display_name) = &self.display_name {
                metadata.display_name = display_name.clone();
            }
        }
        metadata.tags.extend(self.tags.iter().cloned());
    }
}

fn fill(target: &mut String, source: &Option<String>) {
    if target.is_empty() {
        if let Some(value) = source {
            target.clone_from(value);
        }
    }
}
