//! Shared helpers for registry integration tests

#![allow(dead_code)]

use keel_plugin_api::testing::{CallLog, MockPlugin};
use keel_plugin_runtime::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn v(major: u64, minor: u64, patch: u64) -> PluginVersion {
    PluginVersion::new(major, minor, patch)
}

pub fn meta(name: &str) -> PluginMetadata {
    PluginMetadata::new(name, v(1, 0, 0))
}

pub fn shared_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Factory handing out clones of `mock`, so the test keeps a view of its log
pub fn factory(mock: &MockPlugin) -> impl Fn() -> Box<dyn Plugin> + Send + Sync + 'static {
    let mock = mock.clone();
    move || Box::new(mock.clone()) as Box<dyn Plugin>
}

pub fn source(metadata: PluginMetadata, mock: &MockPlugin) -> PluginSource {
    PluginSource::Static(StaticPlugin::new(metadata, factory(mock)))
}

pub fn started_registry(config: RuntimeConfig) -> PluginRegistry {
    let registry = PluginRegistry::new(config).expect("valid config");
    registry.start();
    registry
}

pub fn position(log: &CallLog, entry: &str) -> Option<usize> {
    log.lock().unwrap().iter().position(|e| e == entry)
}

pub const IDLE: Duration = Duration::from_secs(2);
