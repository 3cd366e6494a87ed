//! Core plugin trait and types

use crate::context::HostContext;
use crate::error::{PluginError, Result};
use crate::message::SecurityViolation;
use crate::permission::{Permission, UnknownPermission};
use crate::version::PluginVersion;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Largest memory quota a plugin may declare (4 GiB)
pub const MAX_MEMORY_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// Largest per-update CPU budget a plugin may declare, in milliseconds
pub const MAX_CPU_TIME_LIMIT_MS: u64 = 60_000;

/// Whether `name` is a valid plugin identifier (`[A-Za-z0-9_-]+`)
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Core plugin trait that all plugins must implement
#[async_trait]
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Plugin name (must match its metadata)
    fn name(&self) -> &str;

    /// Initialize the plugin with its host context
    ///
    /// Called once during `Loaded -> Initializing -> Active`.
    async fn initialize(&mut self, context: Arc<dyn HostContext>) -> Result<()>;

    /// Release everything acquired in `initialize`
    async fn shutdown(&mut self) -> Result<()>;

    /// Per-tick hook, only called while the plugin is active
    fn update(&mut self, _delta_time: f64) -> Result<()> {
        Ok(())
    }

    /// Called when the plugin moves from active to paused
    async fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the plugin moves from paused to active
    async fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    /// Notification that the runtime recorded a violation against this plugin
    fn on_security_violation(&mut self, _violation: &SecurityViolation) {}

    /// Health check
    ///
    /// Returns the current health status of the plugin.
    async fn health_check(&self) -> Result<HealthStatus> {
        Ok(HealthStatus::Healthy)
    }
}

/// A dependency on another plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    /// Plugin name
    pub name: String,

    /// Lowest acceptable version (compatibility rule applies)
    pub min_version: PluginVersion,

    /// Highest acceptable version, inclusive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<PluginVersion>,

    /// Whether this dependency is optional
    #[serde(default)]
    pub optional: bool,
}

impl PluginDependency {
    /// Create a required dependency
    pub fn required(name: impl Into<String>, min_version: PluginVersion) -> Self {
        Self {
            name: name.into(),
            min_version,
            max_version: None,
            optional: false,
        }
    }

    /// Create an optional dependency
    pub fn optional(name: impl Into<String>, min_version: PluginVersion) -> Self {
        Self {
            optional: true,
            ..Self::required(name, min_version)
        }
    }

    /// Set an inclusive upper bound
    pub fn with_max_version(mut self, max_version: PluginVersion) -> Self {
        self.max_version = Some(max_version);
        self
    }

    /// Check if a version satisfies this dependency
    pub fn is_satisfied_by(&self, version: &PluginVersion) -> bool {
        version.is_compatible_with(&self.min_version)
            && self.max_version.as_ref().map_or(true, |max| version <= max)
    }
}

/// Plugin health status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message")]
pub enum HealthStatus {
    /// Plugin is healthy and operating normally
    Healthy,

    /// Plugin is degraded but still functioning
    Degraded(String),

    /// Plugin is unhealthy and not functioning
    Unhealthy(String),
}

impl HealthStatus {
    /// Check if the plugin is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Get the health message if any
    pub fn message(&self) -> Option<&str> {
        match self {
            HealthStatus::Healthy => None,
            HealthStatus::Degraded(msg) | HealthStatus::Unhealthy(msg) => Some(msg),
        }
    }
}

/// Startup tier derived from a plugin's tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPriority {
    /// Tagged `critical`
    Critical,
    /// Tagged `high`
    High,
    /// Untagged or tagged `normal`
    Normal,
    /// Tagged `low`
    Low,
}

impl LoadPriority {
    /// All tiers, highest first
    pub const ALL: [LoadPriority; 4] = [
        LoadPriority::Critical,
        LoadPriority::High,
        LoadPriority::Normal,
        LoadPriority::Low,
    ];

    /// Sort key used by discovery (lower runs first)
    pub fn rank(&self) -> u32 {
        match self {
            LoadPriority::Critical => 0,
            LoadPriority::High => 100,
            LoadPriority::Normal => 500,
            LoadPriority::Low => 1000,
        }
    }

    /// Pick the highest tier named in `tags`
    pub fn from_tags<'a>(tags: impl IntoIterator<Item = &'a String>) -> Self {
        tags.into_iter()
            .filter_map(|tag| match tag.to_ascii_lowercase().as_str() {
                "critical" => Some(LoadPriority::Critical),
                "high" => Some(LoadPriority::High),
                "normal" => Some(LoadPriority::Normal),
                "low" => Some(LoadPriority::Low),
                _ => None,
            })
            .min()
            .unwrap_or(LoadPriority::Normal)
    }
}

impl fmt::Display for LoadPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadPriority::Critical => "critical",
            LoadPriority::High => "high",
            LoadPriority::Normal => "normal",
            LoadPriority::Low => "low",
        };
        f.write_str(s)
    }
}

fn default_memory_limit() -> u64 {
    64 * 1024 * 1024
}

fn default_cpu_time_limit() -> u64 {
    100
}

/// Plugin metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Plugin name
    pub name: String,

    /// Human readable name
    #[serde(default)]
    pub display_name: String,

    /// Plugin version
    pub version: PluginVersion,

    /// Plugin description
    #[serde(default)]
    pub description: String,

    /// Plugin author
    #[serde(default)]
    pub author: String,

    /// Plugin homepage
    #[serde(default)]
    pub website: String,

    /// License identifier
    #[serde(default)]
    pub license: String,

    /// Plugin dependencies
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,

    /// Free-form tags; `critical`/`high`/`normal`/`low` select the load tier
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Run updates inside a sandbox scope
    #[serde(default)]
    pub sandbox_required: bool,

    /// Memory quota in bytes
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,

    /// CPU budget per update in milliseconds
    #[serde(default = "default_cpu_time_limit")]
    pub cpu_time_limit: u64,

    /// Permission names the plugin needs
    #[serde(default)]
    pub required_permissions: Vec<String>,

    /// Plugins that may not be loaded at the same time
    #[serde(default)]
    pub conflicts: Vec<String>,
}

impl PluginMetadata {
    /// Create metadata with defaults for everything but identity
    pub fn new(name: impl Into<String>, version: PluginVersion) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            version,
            description: String::new(),
            author: String::new(),
            website: String::new(),
            license: String::new(),
            dependencies: Vec::new(),
            tags: BTreeSet::new(),
            sandbox_required: false,
            memory_limit: default_memory_limit(),
            cpu_time_limit: default_cpu_time_limit(),
            required_permissions: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    /// Add a dependency
    pub fn with_dependency(mut self, dependency: PluginDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Require a permission
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.required_permissions.push(permission.as_str().to_string());
        self
    }

    /// Set memory (bytes) and CPU (ms) limits
    pub fn with_limits(mut self, memory_limit: u64, cpu_time_limit: u64) -> Self {
        self.memory_limit = memory_limit;
        self.cpu_time_limit = cpu_time_limit;
        self
    }

    /// Tier selected by tags
    pub fn load_priority(&self) -> LoadPriority {
        LoadPriority::from_tags(&self.tags)
    }

    /// Required permission names resolved to [`Permission`]
    pub fn permissions(&self) -> std::result::Result<Vec<Permission>, UnknownPermission> {
        self.required_permissions
            .iter()
            .map(|name| name.parse())
            .collect()
    }

    /// Names of required (non-optional) dependencies
    pub fn required_dependencies(&self) -> impl Iterator<Item = &PluginDependency> {
        self.dependencies.iter().filter(|d| !d.optional)
    }

    /// Check the metadata invariants
    pub fn validate(&self) -> Result<()> {
        if !is_valid_identifier(&self.name) {
            return Err(PluginError::invalid_metadata(format!(
                "plugin name '{}' must match [A-Za-z0-9_-]+",
                self.name
            )));
        }

        if self.version.is_zero() {
            return Err(PluginError::invalid_metadata(format!(
                "plugin '{}' has version 0.0.0",
                self.name
            )));
        }

        if self.memory_limit == 0 || self.memory_limit > MAX_MEMORY_LIMIT {
            return Err(PluginError::invalid_metadata(format!(
                "plugin '{}' memory limit {} outside (0, 4GiB]",
                self.name, self.memory_limit
            )));
        }

        if self.cpu_time_limit == 0 || self.cpu_time_limit > MAX_CPU_TIME_LIMIT_MS {
            return Err(PluginError::invalid_metadata(format!(
                "plugin '{}' cpu time limit {}ms outside (0, 60000]",
                self.name, self.cpu_time_limit
            )));
        }

        if let Some(dep) = self
            .dependencies
            .iter()
            .find(|d| !is_valid_identifier(&d.name))
        {
            return Err(PluginError::invalid_metadata(format!(
                "plugin '{}' has invalid dependency name '{}'",
                self.name, dep.name
            )));
        }

        Ok(())
    }
}

/// Plugin lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Not loaded
    Unloaded,
    /// Module is being loaded
    Loading,
    /// Module loaded, plugin not initialized
    Loaded,
    /// `initialize` in progress
    Initializing,
    /// Running and receiving updates
    Active,
    /// Initialized but not receiving updates
    Paused,
    /// `shutdown` called
    ShuttingDown,
    /// Module is being released
    Unloading,
    /// Unrecoverable failure; only unload or reload leave this state
    Error,
}

impl PluginState {
    /// Whether the lifecycle allows `self -> next`.
    ///
    /// A plugin that was never started may be unloaded straight from
    /// `Loaded`; it has no `shutdown` to run.
    pub fn can_transition_to(&self, next: PluginState) -> bool {
        use PluginState::*;

        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loading, Error)
                | (Loaded, Initializing)
                | (Loaded, Unloading)
                | (Initializing, Active)
                | (Initializing, Error)
                | (Active, Paused)
                | (Active, ShuttingDown)
                | (Active, Error)
                | (Paused, Active)
                | (Paused, ShuttingDown)
                | (ShuttingDown, Unloading)
                | (Unloading, Unloaded)
                | (Error, Unloading)
        )
    }

    /// Check if the plugin is active
    pub fn is_active(&self) -> bool {
        matches!(self, PluginState::Active)
    }

    /// Check if the plugin has failed
    pub fn is_error(&self) -> bool {
        matches!(self, PluginState::Error)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loading => "loading",
            PluginState::Loaded => "loaded",
            PluginState::Initializing => "initializing",
            PluginState::Active => "active",
            PluginState::Paused => "paused",
            PluginState::ShuttingDown => "shutting_down",
            PluginState::Unloading => "unloading",
            PluginState::Error => "error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> PluginMetadata {
        PluginMetadata::new(name, PluginVersion::new(1, 0, 0))
    }

    #[test]
    fn test_metadata_validation() {
        assert!(meta("physics_debug-2").validate().is_ok());
        assert!(meta("bad name").validate().is_err());
        assert!(meta("").validate().is_err());

        let zero = PluginMetadata::new("zero", PluginVersion::new(0, 0, 0));
        assert!(zero.validate().is_err());

        assert!(meta("mem").with_limits(0, 10).validate().is_err());
        assert!(meta("mem").with_limits(MAX_MEMORY_LIMIT, 10).validate().is_ok());
        assert!(meta("mem").with_limits(MAX_MEMORY_LIMIT + 1, 10).validate().is_err());
        assert!(meta("cpu").with_limits(1024, 60_001).validate().is_err());

        let bad_dep = meta("a").with_dependency(PluginDependency::required(
            "b/c",
            PluginVersion::new(1, 0, 0),
        ));
        assert!(bad_dep.validate().is_err());
    }

    #[test]
    fn test_dependency_satisfaction() {
        let dep = PluginDependency::required("core", PluginVersion::new(1, 2, 0))
            .with_max_version(PluginVersion::new(1, 4, 0));

        assert!(dep.is_satisfied_by(&PluginVersion::new(1, 3, 5)));
        assert!(dep.is_satisfied_by(&PluginVersion::new(1, 4, 0)));
        assert!(!dep.is_satisfied_by(&PluginVersion::new(1, 4, 1)));
        assert!(!dep.is_satisfied_by(&PluginVersion::new(1, 1, 9)));
        assert!(!dep.is_satisfied_by(&PluginVersion::new(2, 3, 0)));
    }

    #[test]
    fn test_load_priority_from_tags() {
        assert_eq!(meta("a").load_priority(), LoadPriority::Normal);
        assert_eq!(
            meta("a").with_tag("low").with_tag("high").load_priority(),
            LoadPriority::High
        );
        assert_eq!(meta("a").with_tag("Critical").load_priority(), LoadPriority::Critical);
    }

    #[test]
    fn test_state_transitions() {
        use PluginState::*;

        assert!(Unloaded.can_transition_to(Loading));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Unloading));
        assert!(Loaded.can_transition_to(Unloading));
        assert!(Error.can_transition_to(Unloading));

        assert!(!Loaded.can_transition_to(Active));
        assert!(!Loaded.can_transition_to(ShuttingDown));
        assert!(!Unloaded.can_transition_to(Active));
        assert!(!Paused.can_transition_to(Error));
        assert!(!Error.can_transition_to(Active));
    }

    #[test]
    fn test_metadata_json_defaults() {
        let json = r#"{"name":"demo","version":"1.2.3"}"#;
        let parsed: PluginMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.memory_limit, 64 * 1024 * 1024);
        assert_eq!(parsed.cpu_time_limit, 100);
        assert!(parsed.validate().is_ok());
    }
}
