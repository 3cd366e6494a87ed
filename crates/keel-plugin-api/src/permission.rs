//! Capability permissions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A capability a plugin may be granted.
///
/// Everything except [`Permission::PluginCommunication`] is denied by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Read files outside the plugin's private directories
    ReadFiles,
    /// Write files outside the plugin's private directories
    WriteFiles,
    /// Open network connections
    NetworkAccess,
    /// Issue system calls
    SystemCalls,
    /// Access the ECS world
    EngineCoreAccess,
    /// Access the renderer
    RenderingAccess,
    /// Access the asset manager
    AssetAccess,
    /// Access the GUI manager
    GuiAccess,
    /// Send messages and events to other plugins
    PluginCommunication,
    /// Execute scripts
    ScriptExecution,
}

impl Permission {
    /// All permissions in declaration order
    pub const ALL: [Permission; 10] = [
        Permission::ReadFiles,
        Permission::WriteFiles,
        Permission::NetworkAccess,
        Permission::SystemCalls,
        Permission::EngineCoreAccess,
        Permission::RenderingAccess,
        Permission::AssetAccess,
        Permission::GuiAccess,
        Permission::PluginCommunication,
        Permission::ScriptExecution,
    ];

    /// The permission set every plugin starts with
    pub fn defaults() -> Vec<Permission> {
        vec![Permission::PluginCommunication]
    }

    /// Canonical snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ReadFiles => "read_files",
            Permission::WriteFiles => "write_files",
            Permission::NetworkAccess => "network_access",
            Permission::SystemCalls => "system_calls",
            Permission::EngineCoreAccess => "engine_core_access",
            Permission::RenderingAccess => "rendering_access",
            Permission::AssetAccess => "asset_access",
            Permission::GuiAccess => "gui_access",
            Permission::PluginCommunication => "plugin_communication",
            Permission::ScriptExecution => "script_execution",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a permission name is not recognized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown permission: {0}")]
pub struct UnknownPermission(pub String);

impl FromStr for Permission {
    type Err = UnknownPermission;

    /// Accepts `snake_case` and `CamelCase` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();

        Permission::ALL
            .into_iter()
            .find(|p| p.as_str().replace('_', "") == normalized)
            .ok_or_else(|| UnknownPermission(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_both_spellings() {
        assert_eq!(
            "RenderingAccess".parse::<Permission>().unwrap(),
            Permission::RenderingAccess
        );
        assert_eq!(
            "plugin_communication".parse::<Permission>().unwrap(),
            Permission::PluginCommunication
        );
        assert!("Teleport".parse::<Permission>().is_err());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Permission::defaults(), vec![Permission::PluginCommunication]);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Permission::GuiAccess).unwrap();
        assert_eq!(json, "\"gui_access\"");
    }
}
