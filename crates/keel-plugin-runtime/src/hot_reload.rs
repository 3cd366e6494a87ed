//! Reload plugins when their module files change on disk

use crate::error::{Result, RuntimeError};
use crate::registry::PluginRegistry;
use chrono::{DateTime, Utc};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Watches plugin directories and hot-swaps changed modules
#[derive(Debug)]
pub struct HotReloadWatcher {
    registry: PluginRegistry,
    directories: Vec<PathBuf>,
    watcher: Option<RecommendedWatcher>,
    changes: Option<mpsc::UnboundedReceiver<notify::Result<Event>>>,
    reports: Option<mpsc::UnboundedSender<ReloadEvent>>,
    debounce: Duration,
}

impl HotReloadWatcher {
    /// Watch the registry's configured search paths
    pub fn new(registry: PluginRegistry) -> Self {
        let directories = registry.config().plugins.search_paths.clone();
        let debounce = registry.config().hot_reload.debounce;
        Self {
            registry,
            directories,
            watcher: None,
            changes: None,
            reports: None,
            debounce,
        }
    }

    /// Watch an additional directory
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directories.push(dir.into());
        self
    }

    /// Ignore repeated writes to one module within `duration`
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Receive a [`ReloadEvent`] for every attempted reload
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<ReloadEvent>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Register watches on every directory
    pub fn start(&mut self) -> Result<()> {
        if self.directories.is_empty() {
            return Err(RuntimeError::config("no directories to watch"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.changes = Some(rx);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| RuntimeError::other(format!("cannot create file watcher: {e}")))?;

        for dir in &self.directories {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .map_err(|e| {
                    RuntimeError::other(format!("cannot watch {}: {e}", dir.display()))
                })?;
        }

        self.watcher = Some(watcher);
        info!(directories = self.directories.len(), "Watching plugin directories");
        Ok(())
    }

    /// Drop the watches; the spawned loop ends once the channel closes
    pub fn stop(&mut self) {
        self.watcher = None;
        self.changes = None;
        info!("Stopped watching plugin directories");
    }

    /// Spawn the event loop; call after [`start`](Self::start)
    pub fn run(&mut self) -> Result<JoinHandle<()>> {
        let mut rx = self
            .changes
            .take()
            .ok_or_else(|| RuntimeError::other("hot reload watcher was not started"))?;

        let debounce = self.debounce;
        let registry = self.registry.clone();
        let reports = self.reports.clone();

        Ok(tokio::spawn(async move {
            let mut reloaded_at: HashMap<PathBuf, Instant> = HashMap::new();
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Watch error");
                        continue;
                    }
                };
                if !touches_module(&event) {
                    continue;
                }

                for path in &event.paths {
                    if reloaded_at
                        .get(path)
                        .is_some_and(|at| at.elapsed() < debounce)
                    {
                        continue;
                    }
                    let Some(report) = reload_for_path(&registry, path).await else {
                        continue;
                    };
                    reloaded_at.insert(path.clone(), Instant::now());
                    if let Some(tx) = &reports {
                        let _ = tx.send(report);
                    }
                }
            }
            debug!("Hot reload loop finished");
        }))
    }
}

/// Whether an event touches a native module
fn touches_module(event: &Event) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event.paths.iter().any(|path| is_module(path))
}

fn is_module(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some(std::env::consts::DLL_EXTENSION)
}

async fn reload_for_path(registry: &PluginRegistry, path: &Path) -> Option<ReloadEvent> {
    if !is_module(path) {
        return None;
    }
    let plugin_name = registry.plugin_for_path(path)?;
    debug!(plugin = %plugin_name, path = %path.display(), "Module changed on disk");

    let result = registry.reload_plugin(&plugin_name).await;
    let error = match &result {
        Ok(()) => {
            info!(plugin = %plugin_name, "Plugin hot-reloaded");
            None
        }
        Err(e) => {
            error!(plugin = %plugin_name, error = %e, "Failed to hot-reload plugin");
            Some(e.to_string())
        }
    };

    Some(ReloadEvent {
        plugin_name,
        path: path.to_path_buf(),
        at: Utc::now(),
        error,
    })
}

impl ReloadEvent {
    /// Whether the new module is running
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of one hot reload
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    /// Plugin whose module changed
    pub plugin_name: String,
    /// Module path reported by the watcher
    pub path: PathBuf,
    /// When the swap was attempted
    pub at: DateTime<Utc>,
    /// Failure reason; `None` when the new module is running
    pub error: Option<String>,
}
