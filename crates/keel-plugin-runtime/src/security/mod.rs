//! Permissions, quotas, sandboxing and the violation log
//!
//! [`SecurityManager`] is the single authority the rest of the runtime asks
//! before handing out a capability. Permission and sandbox tables sit behind
//! one lock and are only reachable through its methods.

pub mod quota;
pub mod sandbox;

pub use quota::{
    BreachLevel, LimitCallback, LimitExceeded, ResourceKind, ResourceMonitor, ResourceQuota,
    ResourceUsage, UsageSampler,
};
pub use sandbox::{SandboxConfig, SandboxGuard};

use crate::error::{LoadError, LoadResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_plugin_api::{Permission, PluginError, PluginMetadata, SecurityViolation, ViolationSeverity};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Policy knobs applied to every plugin
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    /// Permissions granted at load when a plugin declares them
    pub grantable_permissions: BTreeSet<Permission>,
    /// Hard limit multiplier for the resource monitor
    pub hard_limit_factor: f64,
    /// Violation log capacity
    pub max_violation_records: usize,
    /// Violations after which a plugin is refused
    pub violation_threshold: usize,
    /// Default file handle quota
    pub default_file_handles: u32,
    /// Default network connection quota
    pub default_network_connections: u32,
    /// Default thread quota
    pub default_threads: u32,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            grantable_permissions: Permission::ALL
                .into_iter()
                .filter(|p| !matches!(p, Permission::SystemCalls | Permission::ScriptExecution))
                .collect(),
            hard_limit_factor: 1.5,
            max_violation_records: 1000,
            violation_threshold: 10,
            default_file_handles: 10,
            default_network_connections: 5,
            default_threads: 2,
        }
    }
}

#[derive(Debug, Default)]
struct PluginSecurity {
    permissions: HashMap<Permission, Option<DateTime<Utc>>>,
    sandbox: SandboxConfig,
}

#[derive(Debug)]
struct ViolationLog {
    records: Mutex<VecDeque<SecurityViolation>>,
    counts: DashMap<String, usize>,
    capacity: usize,
}

impl ViolationLog {
    fn record(&self, violation: SecurityViolation) {
        match violation.severity {
            ViolationSeverity::Error | ViolationSeverity::Critical => error!(
                plugin = %violation.plugin_name,
                kind = %violation.kind,
                "{}", violation.description
            ),
            _ => warn!(
                plugin = %violation.plugin_name,
                kind = %violation.kind,
                "{}", violation.description
            ),
        }

        *self
            .counts
            .entry(violation.plugin_name.clone())
            .or_insert(0) += 1;

        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(violation);
    }
}

/// Central security authority
#[derive(Clone, Debug)]
pub struct SecurityManager {
    tables: Arc<RwLock<HashMap<String, PluginSecurity>>>,
    sandbox_depth: Arc<DashMap<String, Arc<AtomicU32>>>,
    violations: Arc<ViolationLog>,
    monitor: ResourceMonitor,
    policy: Arc<SecurityPolicy>,
}

impl SecurityManager {
    /// Create a manager enforcing `policy`
    pub fn new(policy: SecurityPolicy) -> Self {
        let violations = Arc::new(ViolationLog {
            records: Mutex::new(VecDeque::new()),
            counts: DashMap::new(),
            capacity: policy.max_violation_records.max(1),
        });

        let monitor = ResourceMonitor::new(policy.hard_limit_factor);
        let log = Arc::clone(&violations);
        monitor.on_limit_exceeded(move |event| {
            let (kind, severity) = match event.level {
                BreachLevel::Hard => ("hard_resource_limit", ViolationSeverity::Error),
                _ => ("soft_resource_limit", ViolationSeverity::Warning),
            };
            let dims: Vec<String> = event.exceeded.iter().map(ToString::to_string).collect();
            log.record(SecurityViolation::new(
                &event.plugin,
                kind,
                severity,
                format!("resource quota exceeded: {}", dims.join(", ")),
            ));
        });

        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            sandbox_depth: Arc::new(DashMap::new()),
            violations,
            monitor,
            policy: Arc::new(policy),
        }
    }

    /// Policy in force
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// The resource monitor
    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    /// Set up permissions, quota and sandbox for a plugin about to load.
    ///
    /// The sandbox is rooted at `root`, the plugin's private directory,
    /// which stays reachable whether or not the sandbox is enabled. Fails
    /// with `PermissionDenied` when the plugin requires a permission the
    /// policy does not grant or names an unknown one.
    pub fn register_plugin(&self, metadata: &PluginMetadata, root: &Path) -> Result<(), LoadError> {
        let required = metadata.permissions().map_err(|e| {
            LoadError::new(
                LoadResult::PermissionDenied,
                format!("plugin {} requires {e}", metadata.name),
            )
        })?;

        if let Some(denied) = required
            .iter()
            .find(|p| !self.policy.grantable_permissions.contains(p))
        {
            self.record_violation(SecurityViolation::new(
                &metadata.name,
                "permission_denied",
                ViolationSeverity::Warning,
                format!("requires ungrantable permission {denied}"),
            ));
            return Err(LoadError::new(
                LoadResult::PermissionDenied,
                format!("plugin {} requires {denied}, which policy does not grant", metadata.name),
            ));
        }

        let mut entry = PluginSecurity::default();
        for permission in Permission::defaults().into_iter().chain(required) {
            entry.permissions.insert(permission, None);
        }
        entry.sandbox.enabled = metadata.sandbox_required;
        entry.sandbox.root_directory = root.to_path_buf();
        self.tables.write().insert(metadata.name.clone(), entry);

        self.monitor.set_quota(
            &metadata.name,
            ResourceQuota {
                max_memory_bytes: metadata.memory_limit,
                max_cpu_time_ms: metadata.cpu_time_limit,
                max_file_handles: self.policy.default_file_handles,
                max_network_connections: self.policy.default_network_connections,
                max_threads: self.policy.default_threads,
            },
        );

        info!(plugin = %metadata.name, "Security profile registered");
        Ok(())
    }

    /// Drop every table entry for a plugin; the violation log is kept
    pub fn unregister_plugin(&self, plugin: &str) {
        self.tables.write().remove(plugin);
        self.sandbox_depth.remove(plugin);
        self.monitor.remove(plugin);
    }

    /// Whether a plugin currently holds `permission`
    pub fn has_permission(&self, plugin: &str, permission: Permission) -> bool {
        self.tables
            .read()
            .get(plugin)
            .and_then(|entry| entry.permissions.get(&permission))
            .map_or(false, |expiry| expiry.map_or(true, |at| Utc::now() < at))
    }

    /// Grant a permission without expiry
    pub fn grant_permission(&self, plugin: &str, permission: Permission) {
        self.grant(plugin, permission, None);
    }

    /// Grant a permission that lapses after `duration`
    pub fn grant_temporary_permission(&self, plugin: &str, permission: Permission, duration: Duration) {
        let expiry = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self.grant(plugin, permission, expiry);
    }

    fn grant(&self, plugin: &str, permission: Permission, expiry: Option<DateTime<Utc>>) {
        self.tables
            .write()
            .entry(plugin.to_string())
            .or_default()
            .permissions
            .insert(permission, expiry);
        info!(plugin = %plugin, %permission, "Permission granted");
    }

    /// Revoke a permission
    pub fn revoke_permission(&self, plugin: &str, permission: Permission) {
        if let Some(entry) = self.tables.write().get_mut(plugin) {
            if entry.permissions.remove(&permission).is_some() {
                info!(plugin = %plugin, %permission, "Permission revoked");
            }
        }
    }

    /// Currently effective permissions
    pub fn permissions(&self, plugin: &str) -> Vec<Permission> {
        let mut granted: Vec<Permission> = Permission::ALL
            .into_iter()
            .filter(|p| self.has_permission(plugin, *p))
            .collect();
        granted.sort();
        granted
    }

    /// Check a permission, logging and recording a denial
    pub fn check_permission(&self, plugin: &str, permission: Permission) -> Result<(), PluginError> {
        if self.has_permission(plugin, permission) {
            return Ok(());
        }
        self.record_violation(SecurityViolation::new(
            plugin,
            "permission_denied",
            ViolationSeverity::Warning,
            format!("access requiring {permission} denied"),
        ));
        Err(PluginError::PermissionDenied(permission))
    }

    /// Replace a plugin's sandbox configuration
    pub fn set_sandbox_config(&self, plugin: &str, config: SandboxConfig) {
        self.tables
            .write()
            .entry(plugin.to_string())
            .or_default()
            .sandbox = config;
    }

    /// A plugin's sandbox configuration
    pub fn sandbox_config(&self, plugin: &str) -> Option<SandboxConfig> {
        self.tables.read().get(plugin).map(|e| e.sandbox.clone())
    }

    /// Enter the plugin's sandbox until the guard is dropped
    pub fn enter_sandbox(&self, plugin: &str) -> SandboxGuard {
        let depth = Arc::clone(
            self.sandbox_depth
                .entry(plugin.to_string())
                .or_insert_with(|| Arc::new(AtomicU32::new(0)))
                .value(),
        );
        SandboxGuard::enter(plugin, depth)
    }

    /// Current sandbox nesting depth
    pub fn sandbox_depth(&self, plugin: &str) -> u32 {
        self.sandbox_depth
            .get(plugin)
            .map_or(0, |d| d.load(std::sync::atomic::Ordering::SeqCst))
    }

    /// Whether the plugin is currently inside its sandbox
    pub fn is_sandboxed(&self, plugin: &str) -> bool {
        self.sandbox_depth(plugin) > 0
    }

    /// Whether the plugin may read (or write) `path`
    pub fn can_access_path(&self, plugin: &str, path: &Path, write: bool) -> bool {
        let sandbox = self.sandbox_config(plugin).unwrap_or_default();
        if sandbox.contains(path) {
            return true;
        }

        let permission = if write {
            Permission::WriteFiles
        } else {
            Permission::ReadFiles
        };
        let allowed = !sandbox.enabled && self.has_permission(plugin, permission);
        if !allowed {
            self.record_violation(SecurityViolation::new(
                plugin,
                "file_access",
                ViolationSeverity::Warning,
                format!(
                    "{} access to {} denied",
                    if write { "write" } else { "read" },
                    path.display()
                ),
            ));
        }
        allowed
    }

    /// Whether the plugin may issue `call`
    pub fn can_make_system_call(&self, plugin: &str, call: &str) -> bool {
        let sandbox = self.sandbox_config(plugin).unwrap_or_default();
        let allowed = self.has_permission(plugin, Permission::SystemCalls)
            && (!sandbox.enabled || sandbox.allowed_system_calls.iter().any(|c| c == call));
        if !allowed {
            self.record_violation(SecurityViolation::new(
                plugin,
                "system_call",
                ViolationSeverity::Warning,
                format!("system call {call} denied"),
            ));
        }
        allowed
    }

    /// Whether the plugin may open a connection to `host`
    pub fn can_access_network(&self, plugin: &str, host: &str) -> bool {
        let sandbox = self.sandbox_config(plugin).unwrap_or_default();
        let allowed = self.has_permission(plugin, Permission::NetworkAccess)
            && (!sandbox.enabled || sandbox.allow_network);
        if !allowed {
            self.record_violation(SecurityViolation::new(
                plugin,
                "network_access",
                ViolationSeverity::Warning,
                format!("connection to {host} denied"),
            ));
        }
        allowed
    }

    /// Append to the violation log
    pub fn record_violation(&self, violation: SecurityViolation) {
        self.violations.record(violation);
    }

    /// Logged violations for one plugin, oldest first
    pub fn violations(&self, plugin: &str) -> Vec<SecurityViolation> {
        self.violations
            .records
            .lock()
            .iter()
            .filter(|v| v.plugin_name == plugin)
            .cloned()
            .collect()
    }

    /// The whole violation log, oldest first
    pub fn all_violations(&self) -> Vec<SecurityViolation> {
        self.violations.records.lock().iter().cloned().collect()
    }

    /// Violations ever recorded for a plugin, including evicted ones
    pub fn violation_count(&self, plugin: &str) -> usize {
        self.violations.counts.get(plugin).map_or(0, |c| *c)
    }

    /// Forget a plugin's violations
    pub fn clear_violations(&self, plugin: &str) {
        self.violations.counts.remove(plugin);
        self.violations
            .records
            .lock()
            .retain(|v| v.plugin_name != plugin);
    }

    /// Whether the plugin reached the violation threshold
    pub fn should_block_plugin(&self, plugin: &str) -> bool {
        self.violation_count(plugin) >= self.policy.violation_threshold
    }
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new(SecurityPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_plugin_api::PluginVersion;

    const ROOT: &str = "/data/p";

    fn metadata(name: &str) -> PluginMetadata {
        PluginMetadata::new(name, PluginVersion::new(1, 0, 0))
    }

    #[test]
    fn test_default_permissions() {
        let security = SecurityManager::default();
        security.register_plugin(&metadata("p"), Path::new(ROOT)).unwrap();

        assert!(security.has_permission("p", Permission::PluginCommunication));
        for permission in Permission::ALL {
            if permission != Permission::PluginCommunication {
                assert!(!security.has_permission("p", permission));
            }
        }
    }

    #[test]
    fn test_grant_and_revoke() {
        let security = SecurityManager::default();
        security.register_plugin(&metadata("p"), Path::new(ROOT)).unwrap();

        assert!(security.check_permission("p", Permission::RenderingAccess).is_err());
        security.grant_permission("p", Permission::RenderingAccess);
        assert!(security.check_permission("p", Permission::RenderingAccess).is_ok());
        security.revoke_permission("p", Permission::RenderingAccess);
        assert!(!security.has_permission("p", Permission::RenderingAccess));
        assert_eq!(security.violation_count("p"), 1);
    }

    #[test]
    fn test_temporary_grant_expires() {
        let security = SecurityManager::default();
        security.grant_temporary_permission("p", Permission::AssetAccess, Duration::from_millis(20));
        assert!(security.has_permission("p", Permission::AssetAccess));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!security.has_permission("p", Permission::AssetAccess));
    }

    #[test]
    fn test_required_permissions_granted_or_refused() {
        let security = SecurityManager::default();
        security
            .register_plugin(
                &metadata("gfx").with_permission(Permission::RenderingAccess),
                Path::new(ROOT),
            )
            .unwrap();
        assert!(security.has_permission("gfx", Permission::RenderingAccess));

        let err = security
            .register_plugin(
                &metadata("shell").with_permission(Permission::SystemCalls),
                Path::new(ROOT),
            )
            .unwrap_err();
        assert_eq!(err.result, LoadResult::PermissionDenied);

        let mut unknown = metadata("odd");
        unknown.required_permissions.push("Teleport".into());
        assert_eq!(
            security.register_plugin(&unknown, Path::new(ROOT)).unwrap_err().result,
            LoadResult::PermissionDenied
        );
    }

    #[test]
    fn test_path_access() {
        let security = SecurityManager::default();
        security.register_plugin(&metadata("p"), Path::new(ROOT)).unwrap();
        security.set_sandbox_config("p", SandboxConfig::confined("/data/p"));

        assert!(security.can_access_path("p", Path::new("/data/p/save.bin"), true));
        security.grant_permission("p", Permission::ReadFiles);
        assert!(!security.can_access_path("p", Path::new("/etc/hosts"), false));

        security.set_sandbox_config("p", SandboxConfig::default());
        assert!(security.can_access_path("p", Path::new("/etc/hosts"), false));
        assert!(!security.can_access_path("p", Path::new("/etc/hosts"), true));
    }

    #[test]
    fn test_required_sandbox_rooted_at_private_dir() {
        let security = SecurityManager::default();
        let mut boxed = metadata("boxed");
        boxed.sandbox_required = true;
        security
            .register_plugin(&boxed, Path::new("/srv/plugins/boxed"))
            .unwrap();
        security.grant_permission("boxed", Permission::WriteFiles);

        let sandbox = security.sandbox_config("boxed").unwrap();
        assert!(sandbox.enabled);
        assert_eq!(sandbox.root_directory, Path::new("/srv/plugins/boxed"));
        assert!(security.can_access_path(
            "boxed",
            Path::new("/srv/plugins/boxed/data/save.bin"),
            true
        ));
        assert!(!security.can_access_path("boxed", Path::new("/srv/plugins/other/x"), true));
        assert_eq!(security.violation_count("boxed"), 1);
    }

    #[test]
    fn test_network_and_syscalls() {
        let security = SecurityManager::default();
        security.register_plugin(&metadata("p"), Path::new(ROOT)).unwrap();
        assert!(!security.can_access_network("p", "example.org"));

        security.grant_permission("p", Permission::NetworkAccess);
        security.grant_permission("p", Permission::SystemCalls);
        let mut sandbox = SandboxConfig::confined("/data/p");
        sandbox.allowed_system_calls.push("clock_gettime".into());
        security.set_sandbox_config("p", sandbox);

        assert!(!security.can_access_network("p", "example.org"));
        assert!(security.can_make_system_call("p", "clock_gettime"));
        assert!(!security.can_make_system_call("p", "fork"));
    }

    #[test]
    fn test_violation_log_bounded_and_threshold() {
        let security = SecurityManager::new(SecurityPolicy {
            max_violation_records: 3,
            violation_threshold: 4,
            ..SecurityPolicy::default()
        });

        for _ in 0..5 {
            let _ = security.check_permission("p", Permission::GuiAccess);
        }
        assert_eq!(security.all_violations().len(), 3);
        assert_eq!(security.violation_count("p"), 5);
        assert!(security.should_block_plugin("p"));

        security.clear_violations("p");
        assert!(!security.should_block_plugin("p"));
    }

    #[test]
    fn test_breach_recorded_as_violation() {
        let security = SecurityManager::default();
        security
            .register_plugin(&metadata("p").with_limits(1000, 10), Path::new(ROOT))
            .unwrap();

        security.monitor().update("p", ResourceKind::Memory, 2000);
        let violations = security.violations("p");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::Error);
    }

    #[test]
    fn test_sandbox_depth() {
        let security = SecurityManager::default();
        {
            let _outer = security.enter_sandbox("p");
            let _inner = security.enter_sandbox("p");
            assert_eq!(security.sandbox_depth("p"), 2);
        }
        assert!(!security.is_sandboxed("p"));
    }
}
