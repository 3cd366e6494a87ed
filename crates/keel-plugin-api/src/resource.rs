//! Resource dimensions a plugin's usage is measured in

use serde::{Deserialize, Serialize};
use std::fmt;

/// A resource dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Memory in bytes
    Memory,
    /// CPU time in milliseconds
    CpuTime,
    /// File handles
    FileHandles,
    /// Network connections
    NetworkConnections,
    /// Threads
    Threads,
}

impl ResourceKind {
    /// Every dimension
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Memory,
        ResourceKind::CpuTime,
        ResourceKind::FileHandles,
        ResourceKind::NetworkConnections,
        ResourceKind::Threads,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::CpuTime => "cpu_time",
            ResourceKind::FileHandles => "file_handles",
            ResourceKind::NetworkConnections => "network_connections",
            ResourceKind::Threads => "threads",
        };
        f.write_str(s)
    }
}
