//! Resource quotas and the usage monitor

use dashmap::DashMap;
pub use keel_plugin_api::ResourceKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Numeric ceilings for one plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    /// Resident memory in bytes
    pub max_memory_bytes: u64,
    /// CPU time of a single update in milliseconds
    pub max_cpu_time_ms: u64,
    /// Open file handles
    pub max_file_handles: u32,
    /// Open network connections
    pub max_network_connections: u32,
    /// Threads
    pub max_threads: u32,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            max_cpu_time_ms: 100,
            max_file_handles: 10,
            max_network_connections: 5,
            max_threads: 2,
        }
    }
}

impl ResourceQuota {
    /// Ceiling for one dimension
    pub fn limit(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Memory => self.max_memory_bytes,
            ResourceKind::CpuTime => self.max_cpu_time_ms,
            ResourceKind::FileHandles => u64::from(self.max_file_handles),
            ResourceKind::NetworkConnections => u64::from(self.max_network_connections),
            ResourceKind::Threads => u64::from(self.max_threads),
        }
    }
}

/// Usage snapshot for one plugin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// CPU time of the most recent update in milliseconds
    pub cpu_time_ms: u64,
    /// Open file handles
    pub file_handles: u32,
    /// Open network connections
    pub network_connections: u32,
    /// Threads
    pub threads: u32,
}

impl ResourceUsage {
    /// Value of one dimension
    pub fn get(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Memory => self.memory_bytes,
            ResourceKind::CpuTime => self.cpu_time_ms,
            ResourceKind::FileHandles => u64::from(self.file_handles),
            ResourceKind::NetworkConnections => u64::from(self.network_connections),
            ResourceKind::Threads => u64::from(self.threads),
        }
    }

    /// Set one dimension, saturating the narrow counters
    pub fn set(&mut self, kind: ResourceKind, value: u64) {
        let narrow = u32::try_from(value).unwrap_or(u32::MAX);
        match kind {
            ResourceKind::Memory => self.memory_bytes = value,
            ResourceKind::CpuTime => self.cpu_time_ms = value,
            ResourceKind::FileHandles => self.file_handles = narrow,
            ResourceKind::NetworkConnections => self.network_connections = narrow,
            ResourceKind::Threads => self.threads = narrow,
        }
    }

    /// Every dimension is at or below its quota
    pub fn is_within(&self, quota: &ResourceQuota) -> bool {
        self.exceeded(quota, 1.0).is_empty()
    }

    /// Dimensions strictly above `quota * factor`
    pub fn exceeded(&self, quota: &ResourceQuota, factor: f64) -> Vec<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind) as f64 > quota.limit(*kind) as f64 * factor)
            .collect()
    }
}

/// How far usage is over quota
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreachLevel {
    /// Within quota
    #[default]
    Within,
    /// Above quota
    Soft,
    /// Above quota times the hard limit factor
    Hard,
}

/// Raised when a plugin moves to a higher [`BreachLevel`]
#[derive(Debug, Clone)]
pub struct LimitExceeded {
    /// Plugin name
    pub plugin: String,
    /// New level
    pub level: BreachLevel,
    /// Dimensions over quota
    pub exceeded: Vec<ResourceKind>,
    /// Usage at the time of the transition
    pub usage: ResourceUsage,
    /// Quota in force
    pub quota: ResourceQuota,
}

/// Callback fired on each upward breach transition
pub type LimitCallback = Arc<dyn Fn(&LimitExceeded) + Send + Sync>;

/// Samples a plugin's live usage for the periodic check
pub type UsageSampler = Arc<dyn Fn(&str) -> Option<ResourceUsage> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct MonitorEntry {
    quota: ResourceQuota,
    usage: ResourceUsage,
    level: BreachLevel,
}

/// Tracks usage per plugin and reports quota breaches.
///
/// Callbacks fire once when a plugin's level rises (within to soft, soft to
/// hard, within to hard). Falling back re-arms them.
#[derive(Clone)]
pub struct ResourceMonitor {
    entries: Arc<DashMap<String, MonitorEntry>>,
    callbacks: Arc<RwLock<Vec<LimitCallback>>>,
    sampler: Arc<RwLock<Option<UsageSampler>>>,
    hard_limit_factor: f64,
}

impl ResourceMonitor {
    /// Create a monitor; usage above `quota * hard_limit_factor` is a hard breach
    pub fn new(hard_limit_factor: f64) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            sampler: Arc::new(RwLock::new(None)),
            hard_limit_factor: hard_limit_factor.max(1.0),
        }
    }

    /// Hard limit multiplier
    pub fn hard_limit_factor(&self) -> f64 {
        self.hard_limit_factor
    }

    /// Register a breach callback
    pub fn on_limit_exceeded<F>(&self, callback: F)
    where
        F: Fn(&LimitExceeded) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Install the sampler used by [`spawn`](Self::spawn)
    pub fn set_sampler<F>(&self, sampler: F)
    where
        F: Fn(&str) -> Option<ResourceUsage> + Send + Sync + 'static,
    {
        *self.sampler.write() = Some(Arc::new(sampler));
    }

    /// Set or replace a plugin's quota and re-evaluate it
    pub fn set_quota(&self, plugin: &str, quota: ResourceQuota) -> Option<LimitExceeded> {
        self.entries.entry(plugin.to_string()).or_default().quota = quota;
        self.check(plugin)
    }

    /// Quota for a plugin
    pub fn quota(&self, plugin: &str) -> Option<ResourceQuota> {
        self.entries.get(plugin).map(|e| e.quota)
    }

    /// Last recorded usage
    pub fn usage(&self, plugin: &str) -> Option<ResourceUsage> {
        self.entries.get(plugin).map(|e| e.usage)
    }

    /// Current breach level
    pub fn level(&self, plugin: &str) -> BreachLevel {
        self.entries
            .get(plugin)
            .map(|e| e.level)
            .unwrap_or_default()
    }

    /// Stop tracking a plugin
    pub fn remove(&self, plugin: &str) {
        self.entries.remove(plugin);
    }

    /// Replace the usage snapshot and re-evaluate
    pub fn record_usage(&self, plugin: &str, usage: ResourceUsage) -> Option<LimitExceeded> {
        self.entries.entry(plugin.to_string()).or_default().usage = usage;
        self.check(plugin)
    }

    /// Update one dimension and re-evaluate
    pub fn update(&self, plugin: &str, kind: ResourceKind, value: u64) -> Option<LimitExceeded> {
        self.entries
            .entry(plugin.to_string())
            .or_default()
            .usage
            .set(kind, value);
        self.check(plugin)
    }

    /// Whether the last snapshot is within quota
    pub fn is_within_limits(&self, plugin: &str) -> bool {
        self.entries
            .get(plugin)
            .map_or(true, |e| e.usage.is_within(&e.quota))
    }

    /// Re-evaluate a plugin, firing callbacks on an upward transition
    pub fn check(&self, plugin: &str) -> Option<LimitExceeded> {
        let event = {
            let mut entry = self.entries.get_mut(plugin)?;
            let soft = entry.usage.exceeded(&entry.quota, 1.0);
            let level = if soft.is_empty() {
                BreachLevel::Within
            } else if entry
                .usage
                .exceeded(&entry.quota, self.hard_limit_factor)
                .is_empty()
            {
                BreachLevel::Soft
            } else {
                BreachLevel::Hard
            };

            let previous = entry.level;
            entry.level = level;

            if level <= previous {
                if level < previous {
                    debug!(plugin = %plugin, ?level, "Resource usage back under threshold");
                }
                return None;
            }

            LimitExceeded {
                plugin: plugin.to_string(),
                level,
                exceeded: soft,
                usage: entry.usage,
                quota: entry.quota,
            }
        };

        match event.level {
            BreachLevel::Hard => error!(
                plugin = %plugin,
                exceeded = ?event.exceeded,
                "Hard resource limit exceeded"
            ),
            _ => warn!(
                plugin = %plugin,
                exceeded = ?event.exceeded,
                "Resource quota exceeded"
            ),
        }

        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback(&event);
        }

        Some(event)
    }

    /// Refresh usage through the sampler (if any) and re-evaluate every plugin
    pub fn check_all(&self) -> Vec<LimitExceeded> {
        let plugins: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let sampler = self.sampler.read().clone();

        plugins
            .iter()
            .filter_map(|plugin| {
                if let Some(usage) = sampler.as_ref().and_then(|p| p(plugin)) {
                    if let Some(mut entry) = self.entries.get_mut(plugin) {
                        entry.usage = usage;
                    }
                }
                self.check(plugin)
            })
            .collect()
    }

    /// Run [`check_all`](Self::check_all) every `interval` until cancelled
    pub fn spawn(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.check_all();
                    }
                }
            }
            debug!("Resource monitor stopped");
        })
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(1.5)
    }
}

impl fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("plugins", &self.entries.len())
            .field("callbacks", &self.callbacks.read().len())
            .field("hard_limit_factor", &self.hard_limit_factor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quota() -> ResourceQuota {
        ResourceQuota {
            max_memory_bytes: 1000,
            ..ResourceQuota::default()
        }
    }

    #[test]
    fn test_usage_within_quota() {
        let mut usage = ResourceUsage::default();
        usage.memory_bytes = 1000;
        assert!(usage.is_within(&quota()));
        usage.memory_bytes = 1001;
        assert!(!usage.is_within(&quota()));
        assert_eq!(usage.exceeded(&quota(), 1.0), vec![ResourceKind::Memory]);
    }

    #[test]
    fn test_callback_fires_once_per_transition() {
        let monitor = ResourceMonitor::new(1.5);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        monitor.on_limit_exceeded(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.set_quota("p", quota());
        assert!(monitor.is_within_limits("p"));

        assert!(monitor.update("p", ResourceKind::Memory, 1200).is_some());
        assert!(!monitor.is_within_limits("p"));
        for _ in 0..5 {
            assert!(monitor.check("p").is_none());
        }
        monitor.update("p", ResourceKind::Memory, 1300);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let hard = monitor.update("p", ResourceKind::Memory, 1600).unwrap();
        assert_eq!(hard.level, BreachLevel::Hard);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        monitor.update("p", ResourceKind::Memory, 10);
        assert!(monitor.is_within_limits("p"));
        assert_eq!(monitor.level("p"), BreachLevel::Within);

        monitor.update("p", ResourceKind::Memory, 1100);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_lowering_quota_triggers_breach() {
        let monitor = ResourceMonitor::default();
        monitor.set_quota("p", quota());
        monitor.update("p", ResourceKind::Threads, 2);

        let event = monitor
            .set_quota(
                "p",
                ResourceQuota {
                    max_threads: 1,
                    ..quota()
                },
            )
            .unwrap();
        assert_eq!(event.level, BreachLevel::Hard);
        assert_eq!(event.exceeded, vec![ResourceKind::Threads]);
    }

    #[tokio::test]
    async fn test_periodic_check_uses_sampler() {
        let monitor = ResourceMonitor::default();
        monitor.set_quota("p", quota());
        monitor.set_sampler(|_| {
            Some(ResourceUsage {
                memory_bytes: 5000,
                ..ResourceUsage::default()
            })
        });

        let cancel = CancellationToken::new();
        let handle = monitor.spawn(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(monitor.level("p"), BreachLevel::Hard);
    }
}
