//! # Keel Plugin Runtime
//!
//! Discovery, loading, sandboxing and lifecycle management for Keel plugins.
//!
//! ## Features
//!
//! - **Loader**: native modules with an API version handshake
//! - **Discovery**: directory scans with sidecar manifests
//! - **Security**: permissions, resource quotas, sandbox guards, violation log
//! - **Messaging**: prioritized point-to-point queues and glob-matched events
//! - **Registry**: dependency ordering, lifecycle state machine, per-tick updates
//! - **Hot Reload**: swap modules when they change on disk
//!
//! ## Example
//!
//! ```rust,no_run
//! use keel_plugin_runtime::*;
//!
//! # async fn example() -> Result<()> {
//! let config = RuntimeConfig::load_from_file("keel.yaml")?;
//! let registry = PluginRegistry::new(config)?;
//! registry.start();
//!
//! registry.load_directory("plugins").await?;
//! registry.update_plugins(1.0 / 60.0).await;
//!
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod hot_reload;
pub mod loader;
pub mod manifest;
pub mod messaging;
pub mod registry;
pub mod security;

pub use config::{ConfigFormat, RuntimeConfig};
pub use context::{HostServices, PluginContext};
pub use discovery::{PluginCandidate, PluginDiscovery, SortKey};
pub use error::{LoadError, LoadResult, MessagingError, Result, RuntimeError};
pub use hot_reload::{HotReloadWatcher, ReloadEvent};
pub use loader::{LoadInfo, PluginLoader, PluginObject};
pub use manifest::PluginManifest;
pub use messaging::{EventSystem, MessageRouter};
pub use registry::{
    LoadOrder, PluginInstance, PluginRegistry, PluginSource, PluginStats, RegistryStats,
    StaticPlugin,
};
pub use security::{ResourceMonitor, ResourceQuota, SecurityManager, SecurityPolicy};

// Re-export plugin API types for convenience
pub use keel_plugin_api::{
    HealthStatus, Permission, Plugin, PluginDependency, PluginError, PluginMetadata, PluginState,
    PluginVersion,
};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{Result, RuntimeError};
    pub use crate::registry::{PluginRegistry, PluginSource, StaticPlugin};
    pub use keel_plugin_api::prelude::*;
}
