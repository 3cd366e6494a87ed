//! Publish/subscribe events with literal and glob patterns

use crate::error::MessagingError;
use keel_plugin_api::{EventCallback, MessagePriority, PluginEvent};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Event name pattern
#[derive(Debug, Clone)]
pub enum EventPattern {
    /// Exact name
    Literal(String),
    /// Shell-style glob (`*`, `?`, `[...]`)
    Glob(glob::Pattern),
}

impl EventPattern {
    /// Parse a pattern; any glob metacharacter makes it a glob
    pub fn parse(pattern: &str) -> Result<Self, MessagingError> {
        if pattern.is_empty() {
            return Err(MessagingError::InvalidPattern("empty pattern".into()));
        }
        if pattern.contains(['*', '?', '[']) {
            glob::Pattern::new(pattern)
                .map(EventPattern::Glob)
                .map_err(|e| MessagingError::InvalidPattern(format!("{pattern}: {e}")))
        } else {
            Ok(EventPattern::Literal(pattern.to_string()))
        }
    }

    /// Whether `name` matches
    pub fn matches(&self, name: &str) -> bool {
        match self {
            EventPattern::Literal(literal) => literal == name,
            EventPattern::Glob(pattern) => pattern.matches(name),
        }
    }

    /// Source text
    pub fn as_str(&self) -> &str {
        match self {
            EventPattern::Literal(literal) => literal,
            EventPattern::Glob(pattern) => pattern.as_str(),
        }
    }
}

/// A registered subscription
#[derive(Clone)]
pub struct EventSubscription {
    /// Subscription id
    pub subscription_id: u64,
    /// Subscribing plugin
    pub plugin_name: String,
    /// Name pattern
    pub event_pattern: EventPattern,
    /// Callback
    pub callback: EventCallback,
    /// Events below this priority are skipped
    pub min_priority: MessagePriority,
    /// Inactive subscriptions are skipped
    pub active: bool,
}

impl EventSubscription {
    fn accepts(&self, event: &PluginEvent) -> bool {
        self.active
            && event.priority >= self.min_priority
            && event.is_targeted_at(&self.plugin_name)
            && self.event_pattern.matches(&event.name)
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("subscription_id", &self.subscription_id)
            .field("plugin_name", &self.plugin_name)
            .field("event_pattern", &self.event_pattern.as_str())
            .field("min_priority", &self.min_priority)
            .field("active", &self.active)
            .field("callback", &"<opaque>")
            .finish()
    }
}

/// Event counters snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    /// Events accepted by `emit`
    pub emitted: u64,
    /// Callback invocations that returned normally
    pub delivered: u64,
    /// Callback invocations that panicked
    pub failed: u64,
    /// Live subscriptions
    pub subscriptions: usize,
    /// Mean time to dispatch one event to all subscribers
    #[serde(with = "humantime_serde")]
    pub average_processing_time: Duration,
}

struct EventInner {
    subscriptions: RwLock<BTreeMap<u64, EventSubscription>>,
    inactive_plugins: RwLock<HashSet<String>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<PluginEvent>>,
    history_size: usize,
    tx: Mutex<Option<mpsc::UnboundedSender<PluginEvent>>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
    pending: AtomicUsize,
    idle: Notify,
    emitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dispatched: AtomicU64,
    dispatch_nanos: AtomicU64,
}

/// Event bus
#[derive(Clone)]
pub struct EventSystem {
    inner: Arc<EventInner>,
}

impl EventSystem {
    /// Create a stopped event system keeping `history_size` recent events
    pub fn new(history_size: usize) -> Self {
        Self {
            inner: Arc::new(EventInner {
                subscriptions: RwLock::new(BTreeMap::new()),
                inactive_plugins: RwLock::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                history: Mutex::new(VecDeque::with_capacity(history_size)),
                history_size,
                tx: Mutex::new(None),
                running: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                task: Mutex::new(None),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                emitted: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                dispatch_nanos: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the dispatcher; must run inside a Tokio runtime
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.tx.lock() = Some(tx);
        let inner = Arc::clone(&self.inner);
        *self.inner.task.lock() = Some(tokio::spawn(dispatch_loop(inner, rx, cancel)));
        info!("Event system started");
    }

    /// Stop the dispatcher; queued events are discarded
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.lock().cancel();
        self.inner.tx.lock().take();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.pending.store(0, Ordering::SeqCst);
        self.inner.idle.notify_waiters();
        info!("Event system stopped");
    }

    /// Whether the dispatcher is running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Subscribe `plugin` to events matching `pattern`
    pub fn subscribe(
        &self,
        plugin: &str,
        pattern: &str,
        callback: EventCallback,
        min_priority: MessagePriority,
    ) -> Result<u64, MessagingError> {
        let event_pattern = EventPattern::parse(pattern)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscriptions.write().insert(
            id,
            EventSubscription {
                subscription_id: id,
                plugin_name: plugin.to_string(),
                event_pattern,
                callback,
                min_priority,
                active: true,
            },
        );
        debug!(plugin = %plugin, pattern = %pattern, subscription = id, "Subscribed to events");
        Ok(id)
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, subscription_id: u64) -> bool {
        self.inner
            .subscriptions
            .write()
            .remove(&subscription_id)
            .is_some()
    }

    /// Remove every subscription owned by `plugin`
    pub fn unsubscribe_all(&self, plugin: &str) -> usize {
        let mut subscriptions = self.inner.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|_, s| s.plugin_name != plugin);
        let removed = before - subscriptions.len();
        if removed > 0 {
            debug!(plugin = %plugin, removed, "Unsubscribed from all events");
        }
        removed
    }

    /// Toggle one subscription
    pub fn set_subscription_active(&self, subscription_id: u64, active: bool) -> bool {
        match self.inner.subscriptions.write().get_mut(&subscription_id) {
            Some(subscription) => {
                subscription.active = active;
                true
            }
            None => false,
        }
    }

    /// Toggle delivery to every subscription of `plugin`
    pub fn set_plugin_active(&self, plugin: &str, active: bool) {
        let mut inactive = self.inner.inactive_plugins.write();
        if active {
            inactive.remove(plugin);
        } else {
            inactive.insert(plugin.to_string());
        }
    }

    /// Subscriptions owned by `plugin`
    pub fn subscriptions(&self, plugin: &str) -> Vec<EventSubscription> {
        self.inner
            .subscriptions
            .read()
            .values()
            .filter(|s| s.plugin_name == plugin)
            .cloned()
            .collect()
    }

    /// Publish an event for asynchronous dispatch
    pub fn emit(&self, event: PluginEvent) -> Result<(), MessagingError> {
        let tx = self.inner.tx.lock().clone().ok_or(MessagingError::NotRunning)?;

        {
            let mut history = self.inner.history.lock();
            if self.inner.history_size > 0 {
                if history.len() >= self.inner.history_size {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        trace!(event = %event.name, source = %event.source, "Event emitted");
        if tx.send(event).is_err() {
            self.inner.finish_one();
            return Err(MessagingError::NotRunning);
        }
        self.inner.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Recent events, oldest first
    pub fn history(&self) -> Vec<PluginEvent> {
        self.inner.history.lock().iter().cloned().collect()
    }

    /// Forget the history
    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    /// Wait until every emitted event has been dispatched
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.pending.load(Ordering::SeqCst) == 0;
            }
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> EventStats {
        let dispatched = self.inner.dispatched.load(Ordering::Relaxed);
        let nanos = self.inner.dispatch_nanos.load(Ordering::Relaxed);
        EventStats {
            emitted: self.inner.emitted.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            subscriptions: self.inner.subscriptions.read().len(),
            average_processing_time: if dispatched == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(nanos / dispatched)
            },
        }
    }
}

impl EventInner {
    fn dispatch(&self, event: &PluginEvent) {
        let started = Instant::now();
        let targets: Vec<(String, EventCallback)> = {
            let inactive = self.inactive_plugins.read();
            self.subscriptions
                .read()
                .values()
                .filter(|s| !inactive.contains(&s.plugin_name) && s.accepts(event))
                .map(|s| (s.plugin_name.clone(), Arc::clone(&s.callback)))
                .collect()
        };

        for (plugin, callback) in targets {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(plugin = %plugin, event = %event.name, "Event callback panicked");
                }
            }
        }

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.dispatch_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

async fn dispatch_loop(
    inner: Arc<EventInner>,
    mut rx: mpsc::UnboundedReceiver<PluginEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };
        inner.dispatch(&event);
        inner.finish_one();
    }
    debug!("Event dispatcher stopped");
}

impl fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSystem")
            .field("running", &self.is_running())
            .field("history_size", &self.inner.history_size)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collector(log: Arc<StdMutex<Vec<String>>>, tag: &'static str) -> EventCallback {
        Arc::new(move |event: &PluginEvent| {
            log.lock().unwrap().push(format!("{tag}:{}", event.name));
        })
    }

    #[test]
    fn test_pattern_parsing() {
        let literal = EventPattern::parse("entity.spawned").unwrap();
        assert!(literal.matches("entity.spawned"));
        assert!(!literal.matches("entity.spawned.extra"));

        let glob = EventPattern::parse("entity.*").unwrap();
        assert!(glob.matches("entity.spawned"));
        assert!(glob.matches("entity.destroyed"));
        assert!(!glob.matches("physics.step"));

        assert!(EventPattern::parse("").is_err());
        assert!(EventPattern::parse("bad[").is_err());
    }

    #[tokio::test]
    async fn test_matching_priority_and_targets() {
        let events = EventSystem::new(16);
        events.start();
        let log = Arc::new(StdMutex::new(Vec::new()));

        events
            .subscribe("a", "game.*", collector(Arc::clone(&log), "a"), MessagePriority::Low)
            .unwrap();
        events
            .subscribe("b", "game.*", collector(Arc::clone(&log), "b"), MessagePriority::High)
            .unwrap();

        events.emit(PluginEvent::new("game.start", "host")).unwrap();
        events
            .emit(PluginEvent::new("game.alert", "host").with_priority(MessagePriority::Critical))
            .unwrap();
        events
            .emit(PluginEvent::new("game.private", "host").with_target("b").with_priority(MessagePriority::High))
            .unwrap();
        events.emit(PluginEvent::new("audio.start", "host")).unwrap();
        assert!(events.wait_idle(Duration::from_secs(1)).await);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:game.start", "a:game.alert", "b:game.alert", "b:game.private"]
        );
        assert_eq!(events.stats().emitted, 4);
        events.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let events = EventSystem::new(4);
        let log = Arc::new(StdMutex::new(Vec::new()));
        let id = events
            .subscribe("a", "x", collector(log, "a"), MessagePriority::Low)
            .unwrap();

        assert!(events.unsubscribe(id));
        assert!(!events.unsubscribe(id));
        assert!(!events.unsubscribe(9999));
    }

    #[tokio::test]
    async fn test_unsubscribe_all_and_inactive_plugins() {
        let events = EventSystem::new(4);
        events.start();
        let log = Arc::new(StdMutex::new(Vec::new()));
        events
            .subscribe("a", "*", collector(Arc::clone(&log), "a"), MessagePriority::Low)
            .unwrap();
        events
            .subscribe("a", "tick", collector(Arc::clone(&log), "a2"), MessagePriority::Low)
            .unwrap();
        events
            .subscribe("b", "*", collector(Arc::clone(&log), "b"), MessagePriority::Low)
            .unwrap();

        events.set_plugin_active("b", false);
        events.emit(PluginEvent::new("tick", "host")).unwrap();
        assert!(events.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(log.lock().unwrap().len(), 2);

        assert_eq!(events.unsubscribe_all("a"), 2);
        assert_eq!(events.unsubscribe_all("a"), 0);
        events.set_plugin_active("b", true);
        events.emit(PluginEvent::new("tick", "host")).unwrap();
        assert!(events.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("b:tick"));
        events.shutdown().await;
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let events = EventSystem::new(3);
        events.start();
        for i in 0..5 {
            events.emit(PluginEvent::new(format!("e{i}"), "host")).unwrap();
        }
        let names: Vec<_> = events.history().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["e2", "e3", "e4"]);
        events.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let events = EventSystem::new(8);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        events
            .subscribe(
                "a",
                "tick",
                Arc::new(move |_: &PluginEvent| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                MessagePriority::Low,
            )
            .unwrap();

        events.start();
        events.shutdown().await;
        assert!(!events.is_running());

        events.start();
        events.emit(PluginEvent::new("tick", "host")).unwrap();
        assert!(events.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        events.shutdown().await;
    }

    #[tokio::test]
    async fn test_emit_requires_running() {
        let events = EventSystem::new(3);
        assert_eq!(
            events.emit(PluginEvent::new("x", "host")),
            Err(MessagingError::NotRunning)
        );
    }
}
