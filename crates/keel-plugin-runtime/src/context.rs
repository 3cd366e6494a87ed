//! Per-plugin host context

use crate::messaging::{EventSystem, MessageRouter};
use crate::security::SecurityManager;
use async_trait::async_trait;
use dashmap::DashMap;
use keel_plugin_api::{
    AssetManager, EcsWorld, EventCallback, GuiManager, HostContext, MessageHandler,
    MessagePriority, Permission, PluginError, PluginEvent, PluginMessage, Renderer, Resource,
    ResourceKind, Result,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// File the configuration store is persisted to
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Host subsystems injected once at startup
#[derive(Clone, Default)]
pub struct HostServices {
    /// ECS world
    pub ecs_world: Option<Arc<dyn EcsWorld>>,
    /// Renderer
    pub renderer: Option<Arc<dyn Renderer>>,
    /// Asset manager
    pub asset_manager: Option<Arc<dyn AssetManager>>,
    /// GUI manager
    pub gui_manager: Option<Arc<dyn GuiManager>>,
}

impl HostServices {
    /// No subsystems
    pub fn new() -> Self {
        Self::default()
    }

    /// Provide the ECS world
    pub fn with_ecs_world(mut self, world: Arc<dyn EcsWorld>) -> Self {
        self.ecs_world = Some(world);
        self
    }

    /// Provide the renderer
    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Provide the asset manager
    pub fn with_asset_manager(mut self, assets: Arc<dyn AssetManager>) -> Self {
        self.asset_manager = Some(assets);
        self
    }

    /// Provide the GUI manager
    pub fn with_gui_manager(mut self, gui: Arc<dyn GuiManager>) -> Self {
        self.gui_manager = Some(gui);
        self
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices")
            .field("ecs_world", &self.ecs_world.is_some())
            .field("renderer", &self.renderer.is_some())
            .field("asset_manager", &self.asset_manager.is_some())
            .field("gui_manager", &self.gui_manager.is_some())
            .finish()
    }
}

/// Capability-scoped façade handed to one plugin.
///
/// Every subsystem accessor consults the [`SecurityManager`] first; a denial
/// is recorded as a violation and returned as
/// [`PluginError::PermissionDenied`].
pub struct PluginContext {
    name: String,
    root: PathBuf,
    security: SecurityManager,
    router: MessageRouter,
    events: EventSystem,
    host: HostServices,
    resources: DashMap<String, Resource>,
    config: DashMap<String, String>,
    subscriptions: Mutex<HashSet<u64>>,
    handlers: Mutex<HashSet<String>>,
}

impl PluginContext {
    /// Create the context for `name`; directories live under `plugin_dir/name`
    pub fn new(
        name: impl Into<String>,
        plugin_dir: impl Into<PathBuf>,
        security: SecurityManager,
        router: MessageRouter,
        events: EventSystem,
        host: HostServices,
    ) -> Self {
        let name = name.into();
        let root = Self::private_root(&plugin_dir.into(), &name);
        Self {
            name,
            root,
            security,
            router,
            events,
            host,
            resources: DashMap::new(),
            config: DashMap::new(),
            subscriptions: Mutex::new(HashSet::new()),
            handlers: Mutex::new(HashSet::new()),
        }
    }

    /// Private directory of plugin `name` under `plugin_dir`
    pub fn private_root(plugin_dir: &Path, name: &str) -> PathBuf {
        plugin_dir.join(name)
    }

    /// Root of this plugin's private directories
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the configuration store
    pub fn config_snapshot(&self) -> BTreeMap<String, String> {
        self.config
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Write the configuration store to `config_dir/config.json`
    pub fn save_config(&self) -> Result<PathBuf> {
        let path = self.config_dir()?.join(CONFIG_FILE_NAME);
        let content = serde_json::to_string_pretty(&self.config_snapshot())?;
        fs::write(&path, content)?;
        debug!(plugin = %self.name, path = %path.display(), "Plugin config saved");
        Ok(path)
    }

    /// Merge `config_dir/config.json` into the configuration store.
    ///
    /// Returns the number of keys read; a missing file reads as zero.
    pub fn load_config(&self) -> Result<usize> {
        let path = self.config_dir()?.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(0);
        }
        let content = fs::read_to_string(&path)?;
        let values: BTreeMap<String, String> = serde_json::from_str(&content).map_err(|e| {
            PluginError::config(format!("Failed to parse {}: {e}", path.display()))
        })?;
        let count = values.len();
        for (key, value) in values {
            self.config.insert(key, value);
        }
        Ok(count)
    }

    /// Subscriptions created through this context
    pub fn subscription_ids(&self) -> Vec<u64> {
        self.subscriptions.lock().iter().copied().collect()
    }

    /// Drop every subscription and handler created through this context
    pub fn release_messaging(&self) {
        for id in self.subscriptions.lock().drain() {
            self.events.unsubscribe(id);
        }
        for message_type in self.handlers.lock().drain() {
            self.router.unregister_handler(&self.name, &message_type);
        }
    }

    fn gated<T: ?Sized>(
        &self,
        permission: Permission,
        handle: &Option<Arc<T>>,
        what: &str,
    ) -> Result<Arc<T>> {
        self.security.check_permission(&self.name, permission)?;
        handle.clone().ok_or_else(|| {
            warn!(plugin = %self.name, subsystem = %what, "Host subsystem not available");
            PluginError::runtime(format!("{what} is not available in this host"))
        })
    }

    fn private_dir(&self, leaf: &str) -> Result<PathBuf> {
        let dir = self.root.join(leaf);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            debug!(plugin = %self.name, path = %dir.display(), "Created plugin directory");
        }
        Ok(dir)
    }
}

#[async_trait]
impl HostContext for PluginContext {
    fn plugin_name(&self) -> &str {
        &self.name
    }

    fn has_permission(&self, permission: Permission) -> bool {
        self.security.has_permission(&self.name, permission)
    }

    fn ecs_world(&self) -> Result<Arc<dyn EcsWorld>> {
        self.gated(Permission::EngineCoreAccess, &self.host.ecs_world, "ECS world")
    }

    fn renderer(&self) -> Result<Arc<dyn Renderer>> {
        self.gated(Permission::RenderingAccess, &self.host.renderer, "renderer")
    }

    fn asset_manager(&self) -> Result<Arc<dyn AssetManager>> {
        self.gated(Permission::AssetAccess, &self.host.asset_manager, "asset manager")
    }

    fn gui_manager(&self) -> Result<Arc<dyn GuiManager>> {
        self.gated(Permission::GuiAccess, &self.host.gui_manager, "GUI manager")
    }

    fn set_resource(&self, key: &str, value: Resource) {
        self.resources.insert(key.to_string(), value);
    }

    fn resource(&self, key: &str) -> Option<Resource> {
        self.resources.get(key).map(|r| Arc::clone(r.value()))
    }

    fn remove_resource(&self, key: &str) -> Option<Resource> {
        self.resources.remove(key).map(|(_, v)| v)
    }

    fn set_config(&self, key: &str, value: &str) {
        self.config.insert(key.to_string(), value.to_string());
    }

    fn config(&self, key: &str) -> Option<String> {
        self.config.get(key).map(|v| v.value().clone())
    }

    fn data_dir(&self) -> Result<PathBuf> {
        self.private_dir("data")
    }

    fn config_dir(&self) -> Result<PathBuf> {
        self.private_dir("config")
    }

    fn check_path_access(&self, path: &Path, write: bool) -> Result<()> {
        if self.security.can_access_path(&self.name, path, write) {
            return Ok(());
        }
        Err(PluginError::PermissionDenied(if write {
            Permission::WriteFiles
        } else {
            Permission::ReadFiles
        }))
    }

    fn check_network_access(&self, host: &str) -> Result<()> {
        if self.security.can_access_network(&self.name, host) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied(Permission::NetworkAccess))
        }
    }

    fn check_system_call(&self, call: &str) -> Result<()> {
        if self.security.can_make_system_call(&self.name, call) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied(Permission::SystemCalls))
        }
    }

    fn report_resource_usage(&self, kind: ResourceKind, value: u64) -> Result<()> {
        let monitor = self.security.monitor();
        if monitor.quota(&self.name).is_none() {
            return Err(PluginError::invalid_state(format!(
                "{} has no resource quota",
                self.name
            )));
        }
        if let Some(breach) = monitor.update(&self.name, kind, value) {
            debug!(plugin = %self.name, %kind, value, level = ?breach.level, "Reported usage over quota");
        }
        Ok(())
    }

    async fn send_message(&self, mut message: PluginMessage) -> Result<()> {
        self.security
            .check_permission(&self.name, Permission::PluginCommunication)?;
        message.sender = self.name.clone();
        self.router
            .send(message)
            .await
            .map_err(PluginError::messaging)
    }

    fn register_message_handler(&self, message_type: &str, handler: MessageHandler) -> Result<()> {
        self.security
            .check_permission(&self.name, Permission::PluginCommunication)?;
        self.router.register_handler(&self.name, message_type, handler);
        self.handlers.lock().insert(message_type.to_string());
        Ok(())
    }

    fn subscribe_to_event_with_priority(
        &self,
        pattern: &str,
        min_priority: MessagePriority,
        callback: EventCallback,
    ) -> Result<u64> {
        self.security
            .check_permission(&self.name, Permission::PluginCommunication)?;
        let id = self
            .events
            .subscribe(&self.name, pattern, callback, min_priority)
            .map_err(PluginError::messaging)?;
        self.subscriptions.lock().insert(id);
        Ok(id)
    }

    fn unsubscribe_from_event(&self, subscription_id: u64) -> Result<()> {
        if self.subscriptions.lock().remove(&subscription_id) {
            self.events.unsubscribe(subscription_id);
        }
        Ok(())
    }

    fn emit_event(&self, mut event: PluginEvent) -> Result<()> {
        self.security
            .check_permission(&self.name, Permission::PluginCommunication)?;
        event.source = self.name.clone();
        self.events.emit(event).map_err(PluginError::messaging)
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("host", &self.host)
            .field("resources", &self.resources.len())
            .field("config", &self.config.len())
            .finish()
    }
}
