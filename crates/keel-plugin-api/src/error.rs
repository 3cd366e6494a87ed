//! Errors a plugin reports back to the host

use crate::permission::Permission;
use std::fmt;

/// Error returned by plugin hooks and host context calls
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// `initialize` could not complete
    #[error("plugin failed to initialize: {0}")]
    Initialization(String),

    /// Plugin configuration is missing or malformed
    #[error("bad plugin configuration: {0}")]
    Config(String),

    /// Failure inside `update` or another running hook
    #[error("plugin failed while running: {0}")]
    Runtime(String),

    /// A required peer plugin is absent
    #[error("required plugin '{0}' is not available")]
    MissingDependency(String),

    /// The hook is not legal in the plugin's current state
    #[error("operation not allowed in current state: {0}")]
    State(String),

    /// A capability was requested without the matching permission
    #[error("permission denied: {0}")]
    PermissionDenied(Permission),

    /// Metadata failed validation
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Version string could not be parsed
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// Message or event could not be delivered
    #[error("delivery failed: {0}")]
    Messaging(String),

    /// Filesystem access from a plugin directory failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Plugin config or payload could not be (de)serialized
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used across the plugin API
pub type Result<T> = std::result::Result<T, PluginError>;

impl PluginError {
    /// `initialize` failure
    pub fn init(msg: impl fmt::Display) -> Self {
        Self::Initialization(msg.to_string())
    }

    /// Configuration failure
    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Failure while running
    pub fn runtime(msg: impl fmt::Display) -> Self {
        Self::Runtime(msg.to_string())
    }

    /// Missing peer plugin
    pub fn dependency(name: impl fmt::Display) -> Self {
        Self::MissingDependency(name.to_string())
    }

    /// Hook called in the wrong state
    pub fn invalid_state(msg: impl fmt::Display) -> Self {
        Self::State(msg.to_string())
    }

    /// Metadata validation failure
    pub fn invalid_metadata(msg: impl fmt::Display) -> Self {
        Self::InvalidMetadata(msg.to_string())
    }

    /// Delivery failure
    pub fn messaging(msg: impl fmt::Display) -> Self {
        Self::Messaging(msg.to_string())
    }

    /// Whether the error stems from the security layer rather than the plugin
    pub fn is_security(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}
