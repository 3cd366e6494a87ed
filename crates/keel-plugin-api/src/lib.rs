//! # Keel Plugin API
//!
//! The SDK native and in-process plugins are written against.
//!
//! ## Contents
//!
//! - **Plugin trait**: lifecycle hooks driven by the runtime registry
//! - **Metadata**: identity, versioning, dependencies, quotas, permissions
//! - **Host context**: permission-gated access to host subsystems and messaging
//! - **ABI**: the export record and [`export_plugin!`] for `cdylib` plugins
//!
//! ## Example
//!
//! ```rust,no_run
//! use keel_plugin_api::prelude::*;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Default)]
//! struct Ticker {
//!     ticks: u64,
//! }
//!
//! #[async_trait]
//! impl Plugin for Ticker {
//!     fn name(&self) -> &str {
//!         "ticker"
//!     }
//!
//!     async fn initialize(&mut self, _context: Arc<dyn HostContext>) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//!
//!     async fn shutdown(&mut self) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//!
//!     fn update(&mut self, _delta_time: f64) -> Result<(), PluginError> {
//!         self.ticks += 1;
//!         Ok(())
//!     }
//! }
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod abi;
pub mod context;
pub mod error;
pub mod host;
pub mod message;
pub mod permission;
pub mod plugin;
pub mod resource;
pub mod version;

#[cfg(feature = "testing")]
pub mod testing;

// Re-export commonly used types
pub use context::{HostContext, Resource};
pub use error::{PluginError, Result};
pub use host::{AssetManager, EcsWorld, GuiManager, Renderer};
pub use message::{
    DeliveryMode, EventCallback, MessageHandler, MessagePriority, PluginEvent, PluginMessage,
    SecurityViolation, ViolationSeverity,
};
pub use permission::{Permission, UnknownPermission};
pub use plugin::{
    is_valid_identifier, HealthStatus, LoadPriority, Plugin, PluginDependency, PluginMetadata,
    PluginState,
};
pub use resource::ResourceKind;
pub use version::PluginVersion;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::context::HostContext;
    pub use crate::error::PluginError;
    pub use crate::message::{MessagePriority, PluginEvent, PluginMessage};
    pub use crate::permission::Permission;
    pub use crate::plugin::{HealthStatus, Plugin, PluginDependency, PluginMetadata};
    pub use crate::version::PluginVersion;
    pub use async_trait::async_trait;
}
