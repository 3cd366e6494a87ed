//! Sandbox configuration and scoped entry

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Filesystem, network and syscall restrictions for one plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Confine the plugin; when false only permissions apply
    pub enabled: bool,
    /// Private root the plugin may always use
    pub root_directory: PathBuf,
    /// Extra paths the plugin may use
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    /// Whether network access is allowed at all
    #[serde(default)]
    pub allow_network: bool,
    /// System calls the plugin may issue
    #[serde(default)]
    pub allowed_system_calls: Vec<String>,
}

impl SandboxConfig {
    /// An enabled sandbox rooted at `root`
    pub fn confined(root: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            root_directory: root.into(),
            ..Self::default()
        }
    }

    /// Whether `path` lies under the root or an allowed path
    pub fn contains(&self, path: &Path) -> bool {
        let path = normalize(path);
        std::iter::once(&self.root_directory)
            .chain(self.allowed_paths.iter())
            .filter(|base| !base.as_os_str().is_empty())
            .any(|base| path.starts_with(normalize(base)))
    }
}

/// Resolve `.` and `..` without touching the filesystem
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Held while a plugin runs inside its sandbox.
///
/// Guards nest; dropping one (including during unwinding) releases exactly
/// one level.
#[derive(Debug)]
pub struct SandboxGuard {
    plugin: String,
    depth: Arc<AtomicU32>,
}

impl SandboxGuard {
    pub(crate) fn enter(plugin: &str, depth: Arc<AtomicU32>) -> Self {
        let level = depth.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(plugin = %plugin, depth = level, "Entered sandbox");
        Self {
            plugin: plugin.to_string(),
            depth,
        }
    }

    /// Nesting depth including this guard
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        let level = self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        trace!(plugin = %self.plugin, depth = level, "Exited sandbox");
    }
}
