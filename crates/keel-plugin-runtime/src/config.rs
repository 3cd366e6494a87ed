//! Runtime configuration
//!
//! Loaded from YAML, TOML or JSON. `${VAR}` and `${VAR:-default}` are
//! expanded from the environment before parsing.

use crate::error::{Result, RuntimeError};
use crate::manifest::DEFAULT_MANIFEST_NAME;
use crate::security::SecurityPolicy;
use keel_plugin_api::Permission;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Plugin locations and admission
    pub plugins: PluginsConfig,
    /// Message router
    pub messaging: MessagingConfig,
    /// Event system
    pub events: EventsConfig,
    /// Permissions, quotas and violations
    pub security: SecurityConfig,
    /// Library file watching
    pub hot_reload: HotReloadConfig,
}

/// Plugin locations and admission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Base directory; per-plugin data and config live beneath it
    pub plugin_dir: PathBuf,
    /// Extra directories searched for modules and discovery
    pub search_paths: Vec<PathBuf>,
    /// Descend into subdirectories during discovery
    pub recursive_discovery: bool,
    /// Manifest file name looked up next to modules
    pub manifest_name: String,
    /// Maximum number of loaded plugins
    pub max_plugins: usize,
    /// Plugin names refused at load
    pub blocked_plugins: BTreeSet<String>,
    /// When non-empty, modules must live under one of these
    pub trusted_directories: Vec<PathBuf>,
    /// Refuse world-writable module files
    pub reject_world_writable: bool,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            search_paths: Vec::new(),
            recursive_discovery: false,
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            max_plugins: 256,
            blocked_plugins: BTreeSet::new(),
            trusted_directories: Vec::new(),
            reject_world_writable: true,
        }
    }
}

/// Message router settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Delivery worker tasks
    pub worker_count: usize,
    /// Per-recipient queue bound
    pub max_queue_size: usize,
    /// Synchronous delivery deadline
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,
    /// Delay before a reliable message is retried
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Retries for reliable messages that do not set their own
    pub default_max_retries: u32,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_queue_size: 1024,
            sync_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(50),
            default_max_retries: 3,
        }
    }
}

/// Event system settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Recent events kept for inspection
    pub history_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { history_size: 128 }
    }
}

/// Security settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Permissions a plugin may receive by declaring them
    pub grantable_permissions: BTreeSet<Permission>,
    /// Multiplier over a quota at which a breach becomes hard
    pub hard_limit_factor: f64,
    /// Violation log capacity
    pub max_violation_records: usize,
    /// Violations after which a plugin is refused
    pub violation_threshold: usize,
    /// Resource sampling interval
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    /// Default file handle quota
    pub default_file_handles: u32,
    /// Default network connection quota
    pub default_network_connections: u32,
    /// Default thread quota
    pub default_threads: u32,
    /// Expected SHA-256 (lowercase hex) of module files, keyed by file name
    pub trusted_checksums: BTreeMap<String, String>,
    /// Refuse modules with no entry in `trusted_checksums`
    pub require_checksums: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        let policy = SecurityPolicy::default();
        Self {
            grantable_permissions: policy.grantable_permissions,
            hard_limit_factor: policy.hard_limit_factor,
            max_violation_records: policy.max_violation_records,
            violation_threshold: policy.violation_threshold,
            monitor_interval: Duration::from_secs(1),
            default_file_handles: policy.default_file_handles,
            default_network_connections: policy.default_network_connections,
            default_threads: policy.default_threads,
            trusted_checksums: BTreeMap::new(),
            require_checksums: false,
        }
    }
}

impl From<&SecurityConfig> for SecurityPolicy {
    fn from(config: &SecurityConfig) -> Self {
        SecurityPolicy {
            grantable_permissions: config.grantable_permissions.clone(),
            hard_limit_factor: config.hard_limit_factor,
            max_violation_records: config.max_violation_records,
            violation_threshold: config.violation_threshold,
            default_file_handles: config.default_file_handles,
            default_network_connections: config.default_network_connections,
            default_threads: config.default_threads,
        }
    }
}

/// Hot reload settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Watch loaded module files
    pub enabled: bool,
    /// Quiet period before a change triggers a reload
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce: Duration::from_secs(1),
        }
    }
}

/// Configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| RuntimeError::config("Unable to detect config format"))?;

        match ext {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(RuntimeError::config(format!(
                "Unsupported config format: {ext}"
            ))),
        }
    }
}

impl RuntimeConfig {
    /// Load and validate configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            RuntimeError::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::load_from_str(&content, ConfigFormat::from_path(path)?)
    }

    /// Load and validate configuration from a string
    pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<Self> {
        let expanded = expand_env_vars(content)?;

        let config: RuntimeConfig = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(&expanded)
                .map_err(|e| RuntimeError::config(format!("Failed to parse YAML: {e}")))?,
            ConfigFormat::Toml => toml::from_str(&expanded)
                .map_err(|e| RuntimeError::config(format!("Failed to parse TOML: {e}")))?,
            ConfigFormat::Json => serde_json::from_str(&expanded)
                .map_err(|e| RuntimeError::config(format!("Failed to parse JSON: {e}")))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.plugins.manifest_name.trim().is_empty() {
            return Err(RuntimeError::config("plugins.manifest_name must not be empty"));
        }
        if self.plugins.max_plugins == 0 {
            return Err(RuntimeError::config("plugins.max_plugins must be greater than 0"));
        }
        if self.messaging.worker_count == 0 {
            return Err(RuntimeError::config("messaging.worker_count must be greater than 0"));
        }
        if self.messaging.max_queue_size == 0 {
            return Err(RuntimeError::config("messaging.max_queue_size must be greater than 0"));
        }
        if self.messaging.sync_timeout.is_zero() {
            return Err(RuntimeError::config("messaging.sync_timeout must be non-zero"));
        }
        if self.security.monitor_interval.is_zero() {
            return Err(RuntimeError::config("security.monitor_interval must be non-zero"));
        }
        if self.security.hard_limit_factor.is_nan() || self.security.hard_limit_factor < 1.0 {
            return Err(RuntimeError::config(format!(
                "security.hard_limit_factor must be at least 1.0, got {}",
                self.security.hard_limit_factor
            )));
        }
        if let Some((file, digest)) = self
            .security
            .trusted_checksums
            .iter()
            .find(|(_, digest)| !is_sha256_hex(digest))
        {
            return Err(RuntimeError::config(format!(
                "security.trusted_checksums.{file} is not a SHA-256 hex digest: {digest}"
            )));
        }
        Ok(())
    }

    /// Security policy derived from the security section
    pub fn security_policy(&self) -> SecurityPolicy {
        SecurityPolicy::from(&self.security)
    }
}

fn is_sha256_hex(digest: &str) -> bool {
    digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit())
}

fn env_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceCell<Regex> = OnceCell::new();
    PATTERN.get_or_try_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
            .map_err(|e| RuntimeError::config(format!("Invalid regex: {e}")))
    })
}

/// Expand `${VAR}` and `${VAR:-default}`
fn expand_env_vars(content: &str) -> Result<String> {
    let re = env_pattern()?;
    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();

        let value = match env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(3) {
                Some(default) => default.as_str().to_string(),
                None => {
                    return Err(RuntimeError::config(format!(
                        "Environment variable '{var_name}' not set and no default provided"
                    )));
                }
            },
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);
    Ok(result)
}
