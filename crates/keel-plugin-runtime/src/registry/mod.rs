//! Plugin registry: load order, lifecycle and per-tick updates
//!
//! The registry owns every [`PluginInstance`] and is the only component that
//! changes a plugin's [`PluginState`]. Its maps sit behind reader/writer
//! locks so queries can run alongside the control task.

mod instance;
mod order;

pub use instance::{PluginInstance, PluginStats};
pub use order::{calculate_load_order, has_circular_dependency, LoadOrder, LoadOrderEntry};

use crate::config::RuntimeConfig;
use crate::context::{HostServices, PluginContext};
use crate::discovery::PluginDiscovery;
use crate::error::{LoadError, LoadResult, Result, RuntimeError};
use crate::loader::{LoadInfo, PluginLoader, PluginObject};
use crate::messaging::{EventStats, EventSystem, MessageRouter, RouterStats};
use crate::security::{BreachLevel, ResourceKind, SecurityManager};
use keel_plugin_api::{
    HealthStatus, HostContext, Plugin, PluginError, PluginEvent, PluginMetadata, PluginState,
    PluginVersion, SecurityViolation, ViolationSeverity,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Source recorded on lifecycle events
pub const RUNTIME_EVENT_SOURCE: &str = "runtime";
/// Emitted after a plugin reaches `Loaded`
pub const EVENT_PLUGIN_LOADED: &str = "plugin.loaded";
/// Emitted after a plugin reaches `Active` from `Loaded`
pub const EVENT_PLUGIN_STARTED: &str = "plugin.started";
/// Emitted after a plugin is paused
pub const EVENT_PLUGIN_PAUSED: &str = "plugin.paused";
/// Emitted after a plugin is resumed
pub const EVENT_PLUGIN_RESUMED: &str = "plugin.resumed";
/// Emitted after a plugin is shut down
pub const EVENT_PLUGIN_STOPPED: &str = "plugin.stopped";
/// Emitted after a plugin is unloaded
pub const EVENT_PLUGIN_UNLOADED: &str = "plugin.unloaded";
/// Emitted when a plugin enters `Error`
pub const EVENT_PLUGIN_ERROR: &str = "plugin.error";

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Creates in-process plugin objects
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// An in-process plugin: metadata plus a factory
#[derive(Clone)]
pub struct StaticPlugin {
    /// Declared metadata
    pub metadata: PluginMetadata,
    /// Object factory, called on every load and reload
    pub factory: PluginFactory,
}

impl StaticPlugin {
    /// Bundle metadata with a factory
    pub fn new<F>(metadata: PluginMetadata, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        Self {
            metadata,
            factory: Arc::new(factory),
        }
    }
}

impl fmt::Debug for StaticPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticPlugin")
            .field("metadata", &self.metadata)
            .field("factory", &"<opaque>")
            .finish()
    }
}

/// Where a plugin comes from
#[derive(Debug, Clone)]
pub enum PluginSource {
    /// A native module, by path or name resolved through the search paths
    Native(PathBuf),
    /// An in-process plugin
    Static(StaticPlugin),
}

impl PluginSource {
    /// Native module source
    pub fn native(path: impl Into<PathBuf>) -> Self {
        PluginSource::Native(path.into())
    }
}

/// Registry-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    /// Loaded plugins
    pub total: usize,
    /// Loaded plugins per state
    pub by_state: BTreeMap<String, usize>,
    /// Successful loads
    pub loads: u64,
    /// Failed loads
    pub load_failures: u64,
    /// Completed unloads
    pub unloads: u64,
    /// Completed reloads
    pub reloads: u64,
    /// `update` calls across all plugins
    pub updates: u64,
    /// Message router counters
    pub router: RouterStats,
    /// Event system counters
    pub events: EventStats,
}

#[derive(Debug, Default)]
struct RegistryCounters {
    loads: AtomicU64,
    load_failures: AtomicU64,
    unloads: AtomicU64,
    reloads: AtomicU64,
    updates: AtomicU64,
}

/// Owns every plugin instance and drives its lifecycle
#[derive(Clone, Debug)]
pub struct PluginRegistry {
    config: Arc<RuntimeConfig>,
    loader: Arc<PluginLoader>,
    discovery: PluginDiscovery,
    security: SecurityManager,
    router: MessageRouter,
    events: EventSystem,
    host: Arc<RwLock<HostServices>>,
    instances: Arc<RwLock<HashMap<String, Arc<PluginInstance>>>>,
    order: Arc<RwLock<Vec<String>>>,
    sources: Arc<RwLock<HashMap<String, PluginSource>>>,
    counters: Arc<RegistryCounters>,
    cancel: Arc<Mutex<CancellationToken>>,
    monitor_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PluginRegistry {
    /// Create a registry from a validated configuration
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let mut loader = PluginLoader::new()
            .with_reject_world_writable(config.plugins.reject_world_writable);
        for path in &config.plugins.search_paths {
            loader.add_search_path(path.clone());
        }
        for dir in &config.plugins.trusted_directories {
            loader = loader.with_trusted_directory(dir.clone());
        }
        for (file, digest) in &config.security.trusted_checksums {
            loader = loader.with_trusted_checksum(file.clone(), digest.clone());
        }
        loader = loader.with_require_checksums(config.security.require_checksums);
        let loader = Arc::new(loader);

        let discovery = PluginDiscovery::new(Arc::clone(&loader))
            .with_recursive(config.plugins.recursive_discovery)
            .with_manifest_name(config.plugins.manifest_name.clone());
        for path in &config.plugins.search_paths {
            discovery.add_directory(path.clone());
        }

        Ok(Self {
            security: SecurityManager::new(config.security_policy()),
            router: MessageRouter::new(config.messaging.clone()),
            events: EventSystem::new(config.events.history_size),
            config: Arc::new(config),
            loader,
            discovery,
            host: Arc::new(RwLock::new(HostServices::default())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            order: Arc::new(RwLock::new(Vec::new())),
            sources: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(RegistryCounters::default()),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            monitor_task: Arc::new(Mutex::new(None)),
        })
    }

    /// Inject host subsystems; contexts created afterwards see them
    pub fn with_host_services(self, host: HostServices) -> Self {
        *self.host.write() = host;
        self
    }

    /// Start messaging workers and the resource monitor.
    ///
    /// Must be called from within a Tokio runtime. A registry that was shut
    /// down can be started again.
    pub fn start(&self) {
        let mut task = self.monitor_task.lock();
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        self.router.start();
        self.events.start();
        *task = Some(
            self.security
                .monitor()
                .spawn(self.config.security.monitor_interval, cancel),
        );
        info!("Plugin registry started");
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Module loader
    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    /// Directory discovery
    pub fn discovery(&self) -> &PluginDiscovery {
        &self.discovery
    }

    /// Security manager
    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    /// Message router
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Event system
    pub fn events(&self) -> &EventSystem {
        &self.events
    }

    /// Look up an instance
    pub fn instance(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.instances.read().get(name).cloned()
    }

    /// Whether `name` is loaded, in any state
    pub fn is_plugin_loaded(&self, name: &str) -> bool {
        self.instances.read().contains_key(name)
    }

    /// Current state of `name`
    pub fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.instance(name).map(|i| i.state())
    }

    /// Loaded plugin names, dependencies first
    pub fn plugin_names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Metadata of every loaded plugin, dependencies first
    pub fn loaded_plugins(&self) -> Vec<PluginMetadata> {
        self.instances_in_order()
            .iter()
            .map(|i| i.metadata().clone())
            .collect()
    }

    /// Counters for one plugin
    pub fn plugin_stats(&self, name: &str) -> Option<PluginStats> {
        self.instance(name).map(|i| i.stats())
    }

    /// Registry-wide counters
    pub fn stats(&self) -> RegistryStats {
        let instances = self.instances_in_order();
        let mut by_state = BTreeMap::new();
        for instance in &instances {
            *by_state.entry(instance.state().to_string()).or_insert(0) += 1;
        }
        RegistryStats {
            total: instances.len(),
            by_state,
            loads: self.counters.loads.load(Ordering::Relaxed),
            load_failures: self.counters.load_failures.load(Ordering::Relaxed),
            unloads: self.counters.unloads.load(Ordering::Relaxed),
            reloads: self.counters.reloads.load(Ordering::Relaxed),
            updates: self.counters.updates.load(Ordering::Relaxed),
            router: self.router.stats(),
            events: self.events.stats(),
        }
    }

    /// Load a plugin into `Loaded`
    pub async fn load_plugin(&self, source: PluginSource) -> Result<String> {
        let result = match self.open(&source) {
            Ok(info) => self.install(source, info).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => {
                self.counters.loads.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Plugin load failed");
            }
        }
        result
    }

    /// Load an in-process plugin
    pub async fn load_static<F>(&self, metadata: PluginMetadata, factory: F) -> Result<String>
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.load_plugin(PluginSource::Static(StaticPlugin::new(metadata, factory)))
            .await
    }

    /// Load a set of plugins in dependency order, then start them.
    ///
    /// Cycles and unsatisfiable dependencies are reported before anything
    /// loads. If a load fails, plugins loaded by this call are unloaded again.
    pub async fn load_plugins_with_dependencies(
        &self,
        sources: Vec<PluginSource>,
    ) -> Result<Vec<String>> {
        let mut metadata = Vec::with_capacity(sources.len());
        let mut by_name = HashMap::with_capacity(sources.len());
        for source in sources {
            let meta = self.describe(&source)?;
            if by_name.contains_key(&meta.name) || self.is_plugin_loaded(&meta.name) {
                return Err(RuntimeError::already_loaded(&meta.name));
            }
            by_name.insert(meta.name.clone(), source);
            metadata.push(meta);
        }

        let available: HashMap<String, PluginVersion> = self
            .instances_in_order()
            .iter()
            .filter(|i| !i.state().is_error())
            .map(|i| (i.name().to_string(), i.metadata().version.clone()))
            .collect();
        let order = calculate_load_order(&metadata, &available)?;
        debug!(order = ?order.names(), "Computed load order");

        let mut loaded = Vec::with_capacity(order.len());
        for name in order.names() {
            let Some(source) = by_name.remove(&name) else {
                continue;
            };
            match self.load_plugin(source).await {
                Ok(name) => loaded.push(name),
                Err(e) => {
                    for name in loaded.iter().rev() {
                        if let Err(rollback) = self.unload_plugin(name, true).await {
                            warn!(plugin = %name, error = %rollback, "Rollback unload failed");
                        }
                    }
                    return Err(e);
                }
            }
        }

        for name in &loaded {
            if self.plugin_state(name) == Some(PluginState::Loaded) {
                self.start_plugin(name).await?;
            }
        }

        Ok(loaded)
    }

    /// Discover, load and start every valid module in `dir`
    pub async fn load_directory(&self, dir: impl AsRef<Path>) -> Result<Vec<String>> {
        let dir = dir.as_ref();
        let candidates = self.discovery.scan_directory(dir);
        let mut sources = Vec::new();
        for candidate in candidates {
            if candidate.valid {
                sources.push(PluginSource::Native(candidate.path));
            } else {
                warn!(
                    plugin = %candidate.name,
                    path = %candidate.path.display(),
                    error = candidate.error_message.as_deref().unwrap_or("invalid"),
                    "Skipping invalid plugin candidate"
                );
            }
        }
        info!(dir = %dir.display(), plugins = sources.len(), "Loading plugin directory");
        self.load_plugins_with_dependencies(sources).await
    }

    /// Initialize and activate a plugin; starts its dependencies first.
    ///
    /// Legal from `Loaded`, or from `Paused` where it resumes.
    pub async fn start_plugin(&self, name: &str) -> Result<()> {
        self.start_internal(name).await
    }

    fn start_internal<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let instance = self.require(name)?;
            match instance.state() {
                PluginState::Loaded => {}
                PluginState::Paused => return self.resume_plugin(name).await,
                state => return Err(RuntimeError::invalid_state(name, state, "start")),
            }

            if self.security.should_block_plugin(name) {
                return Err(RuntimeError::Blocked(format!(
                    "{name} exceeded the security violation threshold"
                )));
            }

            for dep in &instance.metadata().dependencies {
                let state = self.plugin_state(&dep.name);
                match state {
                    Some(PluginState::Active) => {}
                    Some(PluginState::Loaded | PluginState::Paused) => {
                        self.start_internal(&dep.name).await?;
                    }
                    _ if dep.optional => {
                        debug!(plugin = %name, dependency = %dep.name, "Optional dependency not running");
                    }
                    Some(state) => {
                        return Err(RuntimeError::dependency_missing(format!(
                            "{name} requires {} which is {state}",
                            dep.name
                        )));
                    }
                    None => return Err(RuntimeError::dependency_missing(&dep.name)),
                }
            }

            instance.transition(PluginState::Initializing)?;
            let context: Arc<dyn HostContext> = Arc::clone(instance.context()) as _;
            let result = {
                let mut object = instance.object.lock().await;
                match object.as_mut() {
                    Some(object) => {
                        let _sandbox = self.security.enter_sandbox(name);
                        object.plugin_mut().initialize(context).await
                    }
                    None => Err(PluginError::invalid_state("plugin object missing")),
                }
            };

            match result {
                Ok(()) => {
                    instance.transition(PluginState::Active)?;
                    instance.mark_started();
                    self.router.resume_recipient(name);
                    self.events.set_plugin_active(name, true);
                    info!(plugin = %name, "Plugin started");
                    self.emit_lifecycle(EVENT_PLUGIN_STARTED, name);
                    Ok(())
                }
                Err(e) => {
                    error!(plugin = %name, error = %e, "Plugin initialization failed");
                    self.fail(&instance, &e);
                    Err(e.into())
                }
            }
        })
    }

    /// Shut a plugin down; it rests in `ShuttingDown` until unloaded
    pub async fn stop_plugin(&self, name: &str) -> Result<()> {
        let instance = self.require(name)?;
        let state = instance.state();
        if !matches!(state, PluginState::Active | PluginState::Paused) {
            return Err(RuntimeError::invalid_state(name, state, "stop"));
        }

        instance.transition(PluginState::ShuttingDown)?;
        self.router.pause_recipient(name);
        self.events.set_plugin_active(name, false);

        let result = {
            let mut object = instance.object.lock().await;
            match object.as_mut() {
                Some(object) => {
                    let _sandbox = self.security.enter_sandbox(name);
                    object.plugin_mut().shutdown().await
                }
                None => Ok(()),
            }
        };
        if let Err(e) = result {
            warn!(plugin = %name, error = %e, "Plugin shutdown reported an error");
            instance.record_error(&e);
        }

        info!(plugin = %name, "Plugin stopped");
        self.emit_lifecycle(EVENT_PLUGIN_STOPPED, name);
        Ok(())
    }

    /// Move an active plugin to `Paused`
    pub async fn pause_plugin(&self, name: &str) -> Result<()> {
        let instance = self.require(name)?;
        let state = instance.state();
        if state != PluginState::Active {
            return Err(RuntimeError::invalid_state(name, state, "pause"));
        }

        {
            let mut object = instance.object.lock().await;
            if let Some(object) = object.as_mut() {
                object.plugin_mut().pause().await?;
            }
        }
        instance.transition(PluginState::Paused)?;
        self.router.pause_recipient(name);
        self.events.set_plugin_active(name, false);

        info!(plugin = %name, "Plugin paused");
        self.emit_lifecycle(EVENT_PLUGIN_PAUSED, name);
        Ok(())
    }

    /// Move a paused plugin back to `Active`
    pub async fn resume_plugin(&self, name: &str) -> Result<()> {
        let instance = self.require(name)?;
        let state = instance.state();
        if state != PluginState::Paused {
            return Err(RuntimeError::invalid_state(name, state, "resume"));
        }

        {
            let mut object = instance.object.lock().await;
            if let Some(object) = object.as_mut() {
                object.plugin_mut().resume().await?;
            }
        }
        instance.transition(PluginState::Active)?;
        self.router.resume_recipient(name);
        self.events.set_plugin_active(name, true);

        info!(plugin = %name, "Plugin resumed");
        self.emit_lifecycle(EVENT_PLUGIN_RESUMED, name);
        Ok(())
    }

    /// Unload a plugin, stopping it first if it is running.
    ///
    /// Fails with `HasDependents` while loaded plugins depend on it, unless
    /// `cascade` is set, in which case the dependents are unloaded first.
    pub async fn unload_plugin(&self, name: &str, cascade: bool) -> Result<()> {
        self.unload_internal(name, cascade).await
    }

    fn unload_internal<'a>(&'a self, name: &'a str, cascade: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let instance = self.require(name)?;

            let dependents = instance.dependents();
            if !dependents.is_empty() {
                if !cascade {
                    return Err(RuntimeError::HasDependents {
                        plugin: name.to_string(),
                        dependents,
                    });
                }
                for dependent in dependents.iter().rev() {
                    if self.is_plugin_loaded(dependent) {
                        self.unload_internal(dependent, true).await?;
                    }
                }
            }

            match instance.state() {
                PluginState::Active | PluginState::Paused => self.stop_plugin(name).await?,
                PluginState::ShuttingDown | PluginState::Loaded | PluginState::Error => {}
                state => return Err(RuntimeError::invalid_state(name, state, "unload")),
            }

            self.teardown(&instance).await?;

            self.instances.write().remove(name);
            self.order.write().retain(|n| n != name);
            self.sources.write().remove(name);
            for dep in &instance.metadata().dependencies {
                if let Some(dependency) = self.instance(&dep.name) {
                    dependency.remove_dependent(name);
                }
            }

            let info = instance.replace_load_info(LoadInfo::in_process(instance.metadata().clone()));
            if info.module.is_some() {
                self.loader.unload(info);
            }

            self.counters.unloads.fetch_add(1, Ordering::Relaxed);
            info!(plugin = %name, "Plugin unloaded");
            self.emit_lifecycle(EVENT_PLUGIN_UNLOADED, name);
            Ok(())
        })
    }

    /// Replace a plugin with a fresh copy from its source.
    ///
    /// Native modules are reopened from disk. A plugin that was running is
    /// started again. Refused while anything besides the instance itself
    /// still references objects from the old module.
    pub async fn reload_plugin(&self, name: &str) -> Result<()> {
        let instance = self.require(name)?;
        let source = self
            .sources
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::not_found(name))?;

        let foreign = instance.foreign_references();
        if foreign > 0 {
            return Err(LoadError::new(
                LoadResult::AlreadyLoaded,
                format!("{name} still has {foreign} live reference(s) to its module"),
            )
            .into());
        }

        let state = instance.state();
        let was_running = matches!(state, PluginState::Active | PluginState::Paused);
        match state {
            PluginState::Active | PluginState::Paused => self.stop_plugin(name).await?,
            PluginState::ShuttingDown | PluginState::Loaded | PluginState::Error => {}
            state => return Err(RuntimeError::invalid_state(name, state, "reload")),
        }

        self.teardown(&instance).await?;
        self.instances.write().remove(name);
        let dependents = instance.dependents();

        let old = instance.replace_load_info(LoadInfo::in_process(instance.metadata().clone()));
        let reopened = match &source {
            PluginSource::Native(_) if old.module.is_some() => {
                self.loader
                    .reload(old)
                    .map_err(RuntimeError::from)
                    .and_then(|mut info| {
                        let Some(path) = info.path.clone() else {
                            return Ok(info);
                        };
                        match self.merge_sidecar(&path, &mut info.metadata) {
                            Ok(()) => Ok(info),
                            Err(e) => {
                                self.loader.unload(info);
                                Err(e)
                            }
                        }
                    })
            }
            _ => self.open(&source),
        };

        let result = match reopened {
            Ok(info) => self.install(source, info).await,
            Err(e) => Err(e),
        };
        let new_instance = match result {
            Ok(_) => self.require(name)?,
            Err(e) => {
                self.order.write().retain(|n| n != name);
                self.sources.write().remove(name);
                error!(plugin = %name, error = %e, "Plugin reload failed; plugin is unloaded");
                self.emit_lifecycle(EVENT_PLUGIN_UNLOADED, name);
                return Err(e);
            }
        };
        for dependent in &dependents {
            if self.is_plugin_loaded(dependent) {
                new_instance.add_dependent(dependent);
            }
        }

        self.counters.reloads.fetch_add(1, Ordering::Relaxed);
        info!(plugin = %name, version = %new_instance.metadata().version, "Plugin reloaded");

        if was_running {
            self.start_plugin(name).await?;
        }
        Ok(())
    }

    /// Name of the loaded plugin whose module lives at `path`
    pub fn plugin_for_path(&self, path: &Path) -> Option<String> {
        let wanted = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.instances
            .read()
            .values()
            .find(|i| i.load_info().path.as_deref() == Some(wanted.as_path()))
            .map(|i| i.name().to_string())
    }

    /// Ask a plugin for its health
    pub async fn health_check(&self, name: &str) -> Result<HealthStatus> {
        let instance = self.require(name)?;
        match instance.state() {
            PluginState::Error => {
                let reason = instance
                    .stats()
                    .last_error
                    .unwrap_or_else(|| "plugin is in error state".to_string());
                return Ok(HealthStatus::Unhealthy(reason));
            }
            PluginState::Active => {}
            state => return Ok(HealthStatus::Degraded(format!("plugin is {state}"))),
        }

        let object = instance.object.lock().await;
        match object.as_ref() {
            Some(object) => Ok(object.plugin().health_check().await?),
            None => Ok(HealthStatus::Unhealthy("plugin object missing".to_string())),
        }
    }

    /// Health of every loaded plugin
    pub async fn health_check_all(&self) -> BTreeMap<String, HealthStatus> {
        let mut report = BTreeMap::new();
        for name in self.plugin_names() {
            let status = match self.health_check(&name).await {
                Ok(status) => status,
                Err(e) => HealthStatus::Unhealthy(e.to_string()),
            };
            report.insert(name, status);
        }
        report
    }

    /// Call `update` on every active plugin, dependencies first.
    ///
    /// Plugins with a pending hard resource breach, or that reached the
    /// violation threshold, are moved to `Error` instead; the same checks
    /// run again once `update` returns. Returns the number of plugins updated.
    pub async fn update_plugins(&self, delta_time: f64) -> usize {
        let mut updated = 0;

        for instance in self.instances_in_order() {
            if instance.state() != PluginState::Active {
                continue;
            }
            let name = instance.name();
            let monitor = self.security.monitor();

            if self.enforce(&instance).await {
                continue;
            }

            let (outcome, elapsed) = {
                let mut object = instance.object.lock().await;
                let Some(object) = object.as_mut() else {
                    continue;
                };
                let _sandbox = self.security.enter_sandbox(name);
                let started = Instant::now();
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    object.plugin_mut().update(delta_time)
                }));
                (outcome, started.elapsed())
            };

            instance.record_update(elapsed);
            self.counters.updates.fetch_add(1, Ordering::Relaxed);
            updated += 1;
            trace!(plugin = %name, elapsed = ?elapsed, "Plugin updated");

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        plugin = %name,
                        error = %e,
                        security = e.is_security(),
                        "Plugin update failed"
                    );
                    self.fail(&instance, &e);
                    continue;
                }
                Err(_) => {
                    error!(plugin = %name, "Plugin update panicked");
                    self.fail(&instance, &"update panicked");
                    continue;
                }
            }

            let cpu_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            monitor.update(name, ResourceKind::CpuTime, cpu_ms);
            self.enforce(&instance).await;
        }

        updated
    }

    /// Start every `Loaded` plugin in load order; failures are logged
    pub async fn start_all(&self) -> Result<()> {
        for name in self.plugin_names() {
            if self.plugin_state(&name) != Some(PluginState::Loaded) {
                continue;
            }
            if let Err(e) = self.start_plugin(&name).await {
                warn!(plugin = %name, error = %e, "Failed to start plugin");
            }
        }
        Ok(())
    }

    /// Stop every running plugin, dependents first; failures are logged
    pub async fn stop_all(&self) -> Result<()> {
        for name in self.plugin_names().iter().rev() {
            if !matches!(
                self.plugin_state(name),
                Some(PluginState::Active | PluginState::Paused)
            ) {
                continue;
            }
            if let Err(e) = self.stop_plugin(name).await {
                warn!(plugin = %name, error = %e, "Failed to stop plugin");
            }
        }
        Ok(())
    }

    /// Unload everything and stop the background tasks
    pub async fn shutdown(&self) -> Result<()> {
        for name in self.plugin_names().iter().rev() {
            if !self.is_plugin_loaded(name) {
                continue;
            }
            if let Err(e) = self.unload_plugin(name, true).await {
                warn!(plugin = %name, error = %e, "Failed to unload plugin during shutdown");
            }
        }

        self.cancel.lock().cancel();
        let task = self.monitor_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.router.shutdown().await;
        self.events.shutdown().await;
        info!("Plugin registry shut down");
        Ok(())
    }

    fn require(&self, name: &str) -> Result<Arc<PluginInstance>> {
        self.instance(name).ok_or_else(|| RuntimeError::not_found(name))
    }

    fn instances_in_order(&self) -> Vec<Arc<PluginInstance>> {
        let instances = self.instances.read();
        self.order
            .read()
            .iter()
            .filter_map(|name| instances.get(name).cloned())
            .collect()
    }

    /// Metadata of a source without registering anything
    fn describe(&self, source: &PluginSource) -> Result<PluginMetadata> {
        match source {
            PluginSource::Native(path) => {
                let resolved = self.loader.resolve(path)?;
                let mut metadata = self.loader.inspect(&resolved)?;
                self.merge_sidecar(&resolved, &mut metadata)?;
                Ok(metadata)
            }
            PluginSource::Static(plugin) => {
                plugin.metadata.validate().map_err(|e| {
                    LoadError::new(LoadResult::InvalidFormat, e.to_string())
                })?;
                Ok(plugin.metadata.clone())
            }
        }
    }

    /// Open a source into load info
    fn open(&self, source: &PluginSource) -> Result<LoadInfo> {
        match source {
            PluginSource::Native(path) => {
                let mut info = self.loader.load(path)?;
                if let Some(path) = info.path.clone() {
                    if let Err(e) = self.merge_sidecar(&path, &mut info.metadata) {
                        self.loader.unload(info);
                        return Err(e);
                    }
                }
                Ok(info)
            }
            PluginSource::Static(plugin) => {
                plugin.metadata.validate().map_err(|e| {
                    LoadError::new(LoadResult::InvalidFormat, e.to_string())
                })?;
                Ok(LoadInfo::in_process(plugin.metadata.clone()))
            }
        }
    }

    /// Apply the module's sidecar manifest; a malformed one refuses the load
    fn merge_sidecar(&self, module: &Path, metadata: &mut PluginMetadata) -> Result<()> {
        self.discovery.merge_sidecar(module, metadata).map(|_| ()).map_err(|e| {
            error!(path = %module.display(), error = %e, "Plugin manifest rejected");
            RuntimeError::from(LoadError::new(
                LoadResult::InvalidFormat,
                format!("manifest for {}: {e}", module.display()),
            ))
        })
    }

    /// Admit, register and instantiate an opened plugin
    async fn install(&self, source: PluginSource, info: LoadInfo) -> Result<String> {
        let metadata = info.metadata.clone();
        let name = metadata.name.clone();

        if let Err(e) = self.admit(&metadata) {
            self.release_module(info);
            return Err(e);
        }
        let root = PluginContext::private_root(&self.config.plugins.plugin_dir, &name);
        if let Err(e) = self.security.register_plugin(&metadata, &root) {
            self.release_module(info);
            return Err(e.into());
        }

        self.router.register_plugin(&name);
        self.router.pause_recipient(&name);
        self.router.unblock_recipient(&name);
        self.events.set_plugin_active(&name, false);

        let context = Arc::new(PluginContext::new(
            &name,
            &self.config.plugins.plugin_dir,
            self.security.clone(),
            self.router.clone(),
            self.events.clone(),
            self.host.read().clone(),
        ));
        let instance = Arc::new(PluginInstance::new(info, context));

        let object = self.create_object(&source, &instance.load_info());
        let object = match object {
            Ok(object) => object,
            Err(e) => {
                error!(plugin = %name, error = %e, "Plugin instantiation failed");
                let _ = instance.transition(PluginState::Error);
                self.release(&name, instance.context());
                let info = instance.replace_load_info(LoadInfo::in_process(metadata));
                self.release_module(info);
                return Err(e.into());
            }
        };
        *instance.object.lock().await = Some(object);
        instance.transition(PluginState::Loaded)?;

        {
            let mut instances = self.instances.write();
            if instances.contains_key(&name) {
                drop(instances);
                self.release(&name, instance.context());
                let info = instance.replace_load_info(LoadInfo::in_process(metadata));
                self.release_module(info);
                return Err(RuntimeError::already_loaded(&name));
            }
            instances.insert(name.clone(), Arc::clone(&instance));
        }
        {
            let mut order = self.order.write();
            if !order.contains(&name) {
                order.push(name.clone());
            }
        }
        self.sources.write().insert(name.clone(), source);
        for dep in &metadata.dependencies {
            if let Some(dependency) = self.instance(&dep.name) {
                dependency.add_dependent(&name);
            }
        }

        info!(plugin = %name, version = %metadata.version, "Plugin loaded");
        self.emit_lifecycle(EVENT_PLUGIN_LOADED, &name);
        Ok(name)
    }

    /// Registry policy checks for a plugin about to load
    fn admit(&self, metadata: &PluginMetadata) -> Result<()> {
        let name = &metadata.name;
        if self.config.plugins.blocked_plugins.contains(name) {
            return Err(RuntimeError::Blocked(format!("{name} is on the block list")));
        }
        if self.security.should_block_plugin(name) {
            return Err(RuntimeError::Blocked(format!(
                "{name} exceeded the security violation threshold"
            )));
        }

        let instances = self.instances.read();
        if instances.contains_key(name) {
            return Err(RuntimeError::already_loaded(name));
        }
        if instances.len() >= self.config.plugins.max_plugins {
            return Err(RuntimeError::CapacityExceeded(self.config.plugins.max_plugins));
        }

        for (other, instance) in instances.iter() {
            if metadata.conflicts.contains(other) || instance.metadata().conflicts.contains(name) {
                return Err(RuntimeError::Conflict {
                    plugin: name.clone(),
                    other: other.clone(),
                });
            }
        }

        for dep in &metadata.dependencies {
            match instances.get(&dep.name) {
                Some(loaded)
                    if !loaded.state().is_error()
                        && dep.is_satisfied_by(&loaded.metadata().version) => {}
                Some(loaded) if !dep.optional => {
                    return Err(RuntimeError::dependency_missing(format!(
                        "{name} requires {} >= {}, found {} ({})",
                        dep.name,
                        dep.min_version,
                        loaded.metadata().version,
                        loaded.state()
                    )));
                }
                None if !dep.optional => {
                    return Err(RuntimeError::dependency_missing(format!(
                        "{name} requires {} >= {}",
                        dep.name, dep.min_version
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn create_object(
        &self,
        source: &PluginSource,
        info: &LoadInfo,
    ) -> std::result::Result<PluginObject, LoadError> {
        let object = match source {
            PluginSource::Native(_) => self.loader.instantiate(info)?,
            PluginSource::Static(plugin) => {
                let factory = Arc::clone(&plugin.factory);
                let created = std::panic::catch_unwind(AssertUnwindSafe(|| factory()))
                    .map_err(|_| {
                        LoadError::new(
                            LoadResult::InitializationFailed,
                            format!("factory for {} panicked", info.metadata.name),
                        )
                    })?;
                PluginObject::Static(created)
            }
        };

        let reported = object.plugin().name();
        if reported != info.metadata.name {
            return Err(LoadError::new(
                LoadResult::InitializationFailed,
                format!(
                    "plugin object reports name {reported}, expected {}",
                    info.metadata.name
                ),
            ));
        }
        Ok(object)
    }

    /// Move an instance through `Unloading` to `Unloaded`, dropping its object
    async fn teardown(&self, instance: &PluginInstance) -> Result<()> {
        instance.transition(PluginState::Unloading)?;
        let object = instance.object.lock().await.take();
        drop(object);
        self.release(instance.name(), instance.context());
        instance.transition(PluginState::Unloaded)?;
        Ok(())
    }

    /// Drop messaging and security state for a plugin
    fn release(&self, name: &str, context: &PluginContext) {
        context.release_messaging();
        self.events.unsubscribe_all(name);
        self.events.set_plugin_active(name, true);
        self.router.unregister_plugin(name);
        self.security.unregister_plugin(name);
    }

    fn release_module(&self, info: LoadInfo) {
        if info.module.is_some() {
            self.loader.unload(info);
        }
    }

    /// Move a plugin to `Error` and stop deliveries to it
    fn fail(&self, instance: &PluginInstance, reason: &dyn fmt::Display) {
        let name = instance.name();
        instance.record_error(reason);
        if let Err(e) = instance.transition(PluginState::Error) {
            debug!(plugin = %name, error = %e, "Plugin not moved to error state");
            return;
        }
        self.router.block_recipient(name);
        self.events.set_plugin_active(name, false);
        self.emit(
            PluginEvent::new(EVENT_PLUGIN_ERROR, RUNTIME_EVENT_SOURCE)
                .with_data("plugin", name)
                .with_data("reason", reason.to_string()),
        );
    }

    /// Escalate a running plugin past a hard breach or the violation
    /// threshold. Returns whether it was moved to `Error`.
    async fn enforce(&self, instance: &PluginInstance) -> bool {
        let name = instance.name();
        if instance.state() != PluginState::Active {
            return false;
        }

        if self.security.monitor().level(name) == BreachLevel::Hard {
            let violation = self
                .security
                .violations(name)
                .into_iter()
                .rev()
                .find(|v| v.kind == "hard_resource_limit")
                .unwrap_or_else(|| {
                    SecurityViolation::new(
                        name,
                        "hard_resource_limit",
                        ViolationSeverity::Critical,
                        "hard resource limit exceeded",
                    )
                });
            error!(plugin = %name, "Hard resource limit exceeded; moving plugin to error state");
            self.escalate(instance, violation).await;
            return true;
        }

        if self.security.should_block_plugin(name) {
            let violation = SecurityViolation::new(
                name,
                "violation_threshold",
                ViolationSeverity::Critical,
                format!(
                    "{} security violations recorded",
                    self.security.violation_count(name)
                ),
            );
            self.security.record_violation(violation.clone());
            error!(plugin = %name, "Violation threshold reached; moving plugin to error state");
            self.escalate(instance, violation).await;
            return true;
        }
        false
    }

    /// Fail the plugin and notify it of `violation`
    async fn escalate(&self, instance: &PluginInstance, violation: SecurityViolation) {
        let name = instance.name();
        self.fail(instance, &violation.description);

        let mut object = instance.object.lock().await;
        if let Some(object) = object.as_mut() {
            let notified = std::panic::catch_unwind(AssertUnwindSafe(|| {
                object.plugin_mut().on_security_violation(&violation)
            }));
            if notified.is_err() {
                warn!(plugin = %name, "on_security_violation panicked");
            }
        }
    }

    fn emit_lifecycle(&self, event: &str, plugin: &str) {
        self.emit(PluginEvent::new(event, RUNTIME_EVENT_SOURCE).with_data("plugin", plugin));
    }

    fn emit(&self, event: PluginEvent) {
        let name = event.name.clone();
        if let Err(e) = self.events.emit(event) {
            trace!(event = %name, error = %e, "Lifecycle event not published");
        }
    }
}
