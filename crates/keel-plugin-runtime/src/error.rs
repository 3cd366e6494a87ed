//! Error types for loading, messaging and lifecycle operations

use keel_plugin_api::PluginError;
use serde::Serialize;
use std::fmt;

/// Outcome of a module load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadResult {
    /// Loaded and validated
    Success,
    /// No file found on any search path
    FileNotFound,
    /// Not a loadable module or metadata is malformed
    InvalidFormat,
    /// ABI version handshake failed
    IncompatibleVersion,
    /// A required export symbol is absent
    MissingSymbols,
    /// The plugin factory or `initialize` failed
    InitializationFailed,
    /// The path was rejected by the security policy
    SecurityViolation,
    /// A required dependency is not loaded
    DependencyMissing,
    /// A plugin with this name is already loaded
    AlreadyLoaded,
    /// The file is unreadable or the plugin needs ungrantable permissions
    PermissionDenied,
}

impl fmt::Display for LoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadResult::Success => "success",
            LoadResult::FileNotFound => "file not found",
            LoadResult::InvalidFormat => "invalid format",
            LoadResult::IncompatibleVersion => "incompatible version",
            LoadResult::MissingSymbols => "missing symbols",
            LoadResult::InitializationFailed => "initialization failed",
            LoadResult::SecurityViolation => "security violation",
            LoadResult::DependencyMissing => "dependency missing",
            LoadResult::AlreadyLoaded => "already loaded",
            LoadResult::PermissionDenied => "permission denied",
        };
        f.write_str(s)
    }
}

/// A failed load, always with a human readable message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{result}: {message}")]
pub struct LoadError {
    /// Failure category
    pub result: LoadResult,
    /// What went wrong
    pub message: String,
}

impl LoadError {
    /// Create a load error
    pub fn new(result: LoadResult, message: impl fmt::Display) -> Self {
        Self {
            result,
            message: message.to_string(),
        }
    }
}

/// Message router and event system errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    /// The recipient queue is at capacity
    #[error("queue for '{0}' is full")]
    QueueFull(String),

    /// Recipient unknown or not accepting deliveries
    #[error("recipient '{0}' is unavailable")]
    RecipientUnavailable(String),

    /// No handler registered for `(recipient, message_type)`
    #[error("'{recipient}' has no handler for '{message_type}'")]
    HandlerMissing {
        /// Recipient plugin
        recipient: String,
        /// Message type
        message_type: String,
    },

    /// Synchronous delivery did not complete in time
    #[error("synchronous delivery timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Handler returned an error or panicked
    #[error("handler failed: {0}")]
    DeliveryFailed(String),

    /// Event pattern could not be compiled
    #[error("invalid event pattern: {0}")]
    InvalidPattern(String),

    /// Worker tasks are not running
    #[error("messaging workers are not running")]
    NotRunning,
}

/// Error returned by registry operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Module load failed
    #[error("load failed: {0}")]
    Load(#[from] LoadError),

    /// A plugin hook returned an error
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// No plugin registered under this name
    #[error("no plugin named '{0}'")]
    PluginNotFound(String),

    /// A plugin with this name is already registered
    #[error("plugin '{0}' is already loaded")]
    AlreadyLoaded(String),

    /// A required dependency is absent or has an incompatible version
    #[error("unsatisfied dependency: {0}")]
    DependencyMissing(String),

    /// Dependency graph contains a cycle
    #[error("dependency cycle: {}", chain.join(" -> "))]
    DependencyCycle {
        /// Plugins forming the cycle, first repeated at the end
        chain: Vec<String>,
    },

    /// Plugin still has dependents
    #[error("plugin '{plugin}' is still required by: {}", dependents.join(", "))]
    HasDependents {
        /// Plugin that was asked to unload
        plugin: String,
        /// Loaded plugins depending on it
        dependents: Vec<String>,
    },

    /// Operation not legal in the current state
    #[error("cannot {operation} plugin '{plugin}' while {state}")]
    InvalidState {
        /// Plugin name
        plugin: String,
        /// Current state
        state: keel_plugin_api::PluginState,
        /// Attempted operation
        operation: &'static str,
    },

    /// Plugins declared as conflicting
    #[error("plugin '{plugin}' conflicts with loaded plugin '{other}'")]
    Conflict {
        /// Plugin being loaded
        plugin: String,
        /// Already loaded plugin
        other: String,
    },

    /// Plugin is on the block list or exceeded the violation threshold
    #[error("plugin '{0}' is blocked")]
    Blocked(String),

    /// Registry is at `max_plugins`
    #[error("registry is full ({0} plugins)")]
    CapacityExceeded(usize),

    /// Security policy refused the operation
    #[error("security policy: {0}")]
    Security(String),

    /// Messaging error
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// Runtime configuration is invalid
    #[error("invalid runtime configuration: {0}")]
    Config(String),

    /// Filesystem access failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Manifest or config JSON could not be (de)serialized
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// Anything else, with context in the message
    #[error("{0}")]
    Other(String),
}

/// Result alias for registry operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    /// Unknown plugin name
    pub fn not_found(name: impl fmt::Display) -> Self {
        Self::PluginNotFound(name.to_string())
    }

    /// Duplicate plugin name
    pub fn already_loaded(name: impl fmt::Display) -> Self {
        Self::AlreadyLoaded(name.to_string())
    }

    /// Unsatisfied dependency
    pub fn dependency_missing(name: impl fmt::Display) -> Self {
        Self::DependencyMissing(name.to_string())
    }

    /// Operation rejected by the lifecycle state machine
    pub fn invalid_state(
        plugin: impl fmt::Display,
        state: keel_plugin_api::PluginState,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            plugin: plugin.to_string(),
            state,
            operation,
        }
    }

    /// Refused by the security layer
    pub fn security(msg: impl fmt::Display) -> Self {
        Self::Security(msg.to_string())
    }

    /// Invalid configuration
    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Free-form error
    pub fn other(msg: impl fmt::Display) -> Self {
        Self::Other(msg.to_string())
    }

    /// Load category if this error came from a module load
    pub fn load_result(&self) -> Option<LoadResult> {
        match self {
            RuntimeError::Load(e) => Some(e.result),
            RuntimeError::AlreadyLoaded(_) => Some(LoadResult::AlreadyLoaded),
            RuntimeError::DependencyMissing(_) => Some(LoadResult::DependencyMissing),
            _ => None,
        }
    }
}
