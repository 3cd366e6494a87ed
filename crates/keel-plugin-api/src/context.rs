//! Capability-scoped view of the host handed to each plugin

use crate::error::Result;
use crate::host::{AssetManager, EcsWorld, GuiManager, Renderer};
use crate::message::{EventCallback, MessageHandler, MessagePriority, PluginEvent, PluginMessage};
use crate::permission::Permission;
use crate::resource::ResourceKind;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opaque value stored in a plugin's resource store
pub type Resource = Arc<dyn Any + Send + Sync>;

/// Everything a plugin may reach in its host.
///
/// Subsystem accessors fail with [`PluginError::PermissionDenied`](crate::PluginError::PermissionDenied)
/// unless the plugin holds the matching permission. Messaging helpers require
/// [`Permission::PluginCommunication`]. Plugins that touch files, sockets or
/// the OS directly are expected to ask the matching `check_*` method first;
/// a denial is recorded against the plugin like any other.
#[async_trait]
pub trait HostContext: Send + Sync + fmt::Debug {
    /// Name of the plugin this context belongs to
    fn plugin_name(&self) -> &str;

    /// Whether the plugin currently holds `permission`
    fn has_permission(&self, permission: Permission) -> bool;

    /// ECS world (`EngineCoreAccess`)
    fn ecs_world(&self) -> Result<Arc<dyn EcsWorld>>;

    /// Renderer (`RenderingAccess`)
    fn renderer(&self) -> Result<Arc<dyn Renderer>>;

    /// Asset manager (`AssetAccess`)
    fn asset_manager(&self) -> Result<Arc<dyn AssetManager>>;

    /// GUI manager (`GuiAccess`)
    fn gui_manager(&self) -> Result<Arc<dyn GuiManager>>;

    /// Store a resource under `key`, replacing any previous value
    fn set_resource(&self, key: &str, value: Resource);

    /// Fetch a resource
    fn resource(&self, key: &str) -> Option<Resource>;

    /// Remove a resource
    fn remove_resource(&self, key: &str) -> Option<Resource>;

    /// Set a configuration value
    fn set_config(&self, key: &str, value: &str);

    /// Read a configuration value
    fn config(&self, key: &str) -> Option<String>;

    /// Private data directory, created on first call
    fn data_dir(&self) -> Result<PathBuf>;

    /// Private configuration directory, created on first call
    fn config_dir(&self) -> Result<PathBuf>;

    /// Whether `path` may be opened, for writing if `write` is set.
    ///
    /// Paths inside the plugin's sandbox are always allowed. Outside it,
    /// unsandboxed plugins need `ReadFiles` or `WriteFiles`.
    fn check_path_access(&self, path: &Path, write: bool) -> Result<()>;

    /// Whether a connection to `host` may be opened (`NetworkAccess`)
    fn check_network_access(&self, host: &str) -> Result<()>;

    /// Whether the system call `call` may be made (`SystemCalls`)
    fn check_system_call(&self, call: &str) -> Result<()>;

    /// Report the plugin's current usage of one resource.
    ///
    /// Usage above the plugin's quota is recorded as a violation. Usage
    /// above the hard limit moves the plugin to `Error` once the current
    /// update returns.
    fn report_resource_usage(&self, kind: ResourceKind, value: u64) -> Result<()>;

    /// Send a message; the sender field is overwritten with this plugin's name
    async fn send_message(&self, message: PluginMessage) -> Result<()>;

    /// Handle messages of `message_type` addressed to this plugin
    fn register_message_handler(&self, message_type: &str, handler: MessageHandler) -> Result<()>;

    /// Subscribe to events whose name matches `pattern` (literal or glob)
    fn subscribe_to_event(&self, pattern: &str, callback: EventCallback) -> Result<u64> {
        self.subscribe_to_event_with_priority(pattern, MessagePriority::Low, callback)
    }

    /// Subscribe to events matching `pattern` whose priority is at least `min_priority`
    fn subscribe_to_event_with_priority(
        &self,
        pattern: &str,
        min_priority: MessagePriority,
        callback: EventCallback,
    ) -> Result<u64>;

    /// Drop a subscription; unknown ids are ignored
    fn unsubscribe_from_event(&self, subscription_id: u64) -> Result<()>;

    /// Publish an event; the source field is overwritten with this plugin's name
    fn emit_event(&self, event: PluginEvent) -> Result<()>;
}

impl dyn HostContext {
    /// Fetch a resource and downcast it
    pub fn resource_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.resource(key)?.downcast::<T>().ok()
    }
}
