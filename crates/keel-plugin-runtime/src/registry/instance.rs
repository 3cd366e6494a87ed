//! A loaded plugin and its bookkeeping

use crate::context::PluginContext;
use crate::error::{Result, RuntimeError};
use crate::loader::{LoadInfo, PluginObject};
use chrono::{DateTime, Utc};
use keel_plugin_api::{PluginMetadata, PluginState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-instance counters
#[derive(Debug, Clone, Serialize)]
pub struct PluginStats {
    /// When the instance finished loading
    pub loaded_at: DateTime<Utc>,
    /// When the instance last became active
    pub started_at: Option<DateTime<Utc>>,
    /// Completed `update` calls
    pub update_count: u64,
    /// Time spent in `update`
    #[serde(with = "humantime_serde")]
    pub total_update_time: Duration,
    /// Duration of the most recent `update`
    #[serde(with = "humantime_serde")]
    pub last_update_time: Duration,
    /// Failed hooks and escalations
    pub error_count: u64,
    /// Most recent failure
    pub last_error: Option<String>,
}

impl PluginStats {
    fn new(loaded_at: DateTime<Utc>) -> Self {
        Self {
            loaded_at,
            started_at: None,
            update_count: 0,
            total_update_time: Duration::ZERO,
            last_update_time: Duration::ZERO,
            error_count: 0,
            last_error: None,
        }
    }

    /// Mean `update` duration
    pub fn average_update_time(&self) -> Duration {
        match u32::try_from(self.update_count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total_update_time / count,
            Err(_) => Duration::from_nanos(
                (self.total_update_time.as_nanos() / u128::from(self.update_count)) as u64,
            ),
        }
    }
}

/// A plugin owned by the registry.
///
/// Only the registry changes the lifecycle state; everything else reads it.
pub struct PluginInstance {
    metadata: PluginMetadata,
    pub(crate) object: tokio::sync::Mutex<Option<PluginObject>>,
    context: Arc<PluginContext>,
    load_info: Mutex<LoadInfo>,
    state: RwLock<PluginState>,
    dependents: RwLock<BTreeSet<String>>,
    stats: Mutex<PluginStats>,
}

impl PluginInstance {
    /// New instance in `Loading`; the registry installs the object
    pub(crate) fn new(load_info: LoadInfo, context: Arc<PluginContext>) -> Self {
        Self {
            metadata: load_info.metadata.clone(),
            object: tokio::sync::Mutex::new(None),
            context,
            stats: Mutex::new(PluginStats::new(load_info.loaded_at)),
            load_info: Mutex::new(load_info),
            state: RwLock::new(PluginState::Loading),
            dependents: RwLock::new(BTreeSet::new()),
        }
    }

    /// Plugin name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Validated metadata
    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Current lifecycle state
    pub fn state(&self) -> PluginState {
        *self.state.read()
    }

    /// The plugin's context
    pub fn context(&self) -> &Arc<PluginContext> {
        &self.context
    }

    /// Copy of the load information
    pub fn load_info(&self) -> LoadInfo {
        self.load_info.lock().clone()
    }

    /// Loaded plugins that depend on this one
    pub fn dependents(&self) -> Vec<String> {
        self.dependents.read().iter().cloned().collect()
    }

    /// Counter snapshot
    pub fn stats(&self) -> PluginStats {
        self.stats.lock().clone()
    }

    pub(crate) fn transition(&self, next: PluginState) -> Result<PluginState> {
        let mut state = self.state.write();
        let current = *state;
        if !current.can_transition_to(next) {
            return Err(RuntimeError::invalid_state(
                &self.metadata.name,
                current,
                transition_name(next),
            ));
        }
        *state = next;
        debug!(plugin = %self.metadata.name, from = %current, to = %next, "State transition");
        Ok(current)
    }

    pub(crate) fn replace_load_info(&self, info: LoadInfo) -> LoadInfo {
        self.stats.lock().loaded_at = info.loaded_at;
        std::mem::replace(&mut *self.load_info.lock(), info)
    }

    /// Live references to the native module beyond this instance's own
    pub(crate) fn foreign_references(&self) -> usize {
        self.load_info
            .lock()
            .module
            .as_ref()
            .map_or(0, |module| module.reference_count().saturating_sub(2))
    }

    pub(crate) fn add_dependent(&self, name: &str) {
        self.dependents.write().insert(name.to_string());
    }

    pub(crate) fn remove_dependent(&self, name: &str) {
        self.dependents.write().remove(name);
    }

    pub(crate) fn mark_started(&self) {
        self.stats.lock().started_at = Some(Utc::now());
    }

    pub(crate) fn record_update(&self, elapsed: Duration) {
        let mut stats = self.stats.lock();
        stats.update_count += 1;
        stats.total_update_time += elapsed;
        stats.last_update_time = elapsed;
    }

    pub(crate) fn record_error(&self, error: impl fmt::Display) {
        let mut stats = self.stats.lock();
        stats.error_count += 1;
        stats.last_error = Some(error.to_string());
    }
}

fn transition_name(next: PluginState) -> &'static str {
    match next {
        PluginState::Unloaded => "finish unloading",
        PluginState::Loading => "load",
        PluginState::Loaded => "finish loading",
        PluginState::Initializing => "initialize",
        PluginState::Active => "activate",
        PluginState::Paused => "pause",
        PluginState::ShuttingDown => "stop",
        PluginState::Unloading => "unload",
        PluginState::Error => "fail",
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.metadata.name)
            .field("version", &self.metadata.version)
            .field("state", &self.state())
            .field("dependents", &*self.dependents.read())
            .finish()
    }
}
