//! Security and messaging behavior seen through the registry

mod common;

use async_trait::async_trait;
use common::*;
use keel_plugin_api::testing::{CallLog, MockPlugin};
use keel_plugin_api::Result as PluginResult;
use keel_plugin_api::{HostContext, PluginEvent, PluginMessage, Renderer, SecurityViolation};
use keel_plugin_runtime::prelude::*;
use keel_plugin_runtime::security::{BreachLevel, ResourceKind};
use keel_plugin_runtime::{HostServices, PluginState};
use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct TestRenderer;

impl Renderer for TestRenderer {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Burns wall-clock time in every update
#[derive(Debug, Clone)]
struct SlowPlugin {
    log: CallLog,
    per_update: Duration,
}

impl SlowPlugin {
    fn record(&self, call: &str) {
        self.log.lock().unwrap().push(format!("slow:{call}"));
    }
}

#[async_trait]
impl Plugin for SlowPlugin {
    fn name(&self) -> &str {
        "slow"
    }

    async fn initialize(&mut self, _context: Arc<dyn HostContext>) -> PluginResult<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> PluginResult<()> {
        Ok(())
    }

    fn update(&mut self, _delta_time: f64) -> PluginResult<()> {
        self.record("update");
        std::thread::sleep(self.per_update);
        Ok(())
    }

    fn on_security_violation(&mut self, violation: &SecurityViolation) {
        self.record(&format!("violation:{}", violation.kind));
    }
}

type UpdateBody = Arc<dyn Fn(&dyn HostContext) -> PluginResult<()> + Send + Sync>;

/// Runs `body` against its context in every update
#[derive(Clone)]
struct ScriptedPlugin {
    name: &'static str,
    log: CallLog,
    body: UpdateBody,
    context: Arc<Mutex<Option<Arc<dyn HostContext>>>>,
}

impl ScriptedPlugin {
    fn new(name: &'static str, log: CallLog, body: UpdateBody) -> Self {
        Self {
            name,
            log,
            body,
            context: Arc::new(Mutex::new(None)),
        }
    }

    fn record(&self, call: &str) {
        self.log.lock().unwrap().push(format!("{}:{call}", self.name));
    }
}

impl fmt::Debug for ScriptedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedPlugin").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Plugin for ScriptedPlugin {
    fn name(&self) -> &str {
        self.name
    }

    async fn initialize(&mut self, context: Arc<dyn HostContext>) -> PluginResult<()> {
        *self.context.lock().unwrap() = Some(context);
        Ok(())
    }

    async fn shutdown(&mut self) -> PluginResult<()> {
        Ok(())
    }

    fn update(&mut self, _delta_time: f64) -> PluginResult<()> {
        self.record("update");
        let context = self.context.lock().unwrap().clone();
        match context {
            Some(context) => (self.body)(context.as_ref()),
            None => Ok(()),
        }
    }

    fn on_security_violation(&mut self, violation: &SecurityViolation) {
        self.record(&format!("violation:{}", violation.kind));
    }
}

fn count(log: &CallLog, entry: &str) -> usize {
    log.lock().unwrap().iter().filter(|e| *e == entry).count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_accessors_follow_grants() {
    let registry = started_registry(RuntimeConfig::default())
        .with_host_services(HostServices::new().with_renderer(Arc::new(TestRenderer)));
    let mock = MockPlugin::new("viewer");
    registry.load_static(meta("viewer"), factory(&mock)).await.unwrap();
    registry.start_plugin("viewer").await.unwrap();

    let context = mock.context().unwrap();
    assert!(matches!(
        context.renderer(),
        Err(PluginError::PermissionDenied(Permission::RenderingAccess))
    ));
    assert!(context.ecs_world().is_err());
    assert!(context.asset_manager().is_err());
    assert!(context.gui_manager().is_err());
    assert!(registry.security().violation_count("viewer") >= 4);

    registry
        .security()
        .grant_permission("viewer", Permission::RenderingAccess);
    let renderer = context.renderer().unwrap();
    assert!(renderer.as_any().is::<TestRenderer>());

    registry
        .security()
        .revoke_permission("viewer", Permission::RenderingAccess);
    assert!(context.renderer().is_err());

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_declared_permissions_granted_at_load() {
    let registry = started_registry(RuntimeConfig::default());
    let mock = MockPlugin::new("painter");
    registry
        .load_static(
            meta("painter").with_permission(Permission::RenderingAccess),
            factory(&mock),
        )
        .await
        .unwrap();
    assert!(registry
        .security()
        .has_permission("painter", Permission::RenderingAccess));

    // Not grantable under the default policy
    let err = registry
        .load_static(
            meta("shell").with_permission(Permission::SystemCalls),
            factory(&MockPlugin::new("shell")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Load(_)));
    assert!(!registry.is_plugin_loaded("shell"));

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hard_cpu_breach_moves_plugin_to_error() {
    let registry = started_registry(RuntimeConfig::default());
    let log = shared_log();
    let slow = SlowPlugin {
        log: log.clone(),
        per_update: Duration::from_millis(20),
    };
    registry
        .load_static(meta("slow").with_limits(64 * 1024 * 1024, 1), move || {
            Box::new(slow.clone()) as Box<dyn Plugin>
        })
        .await
        .unwrap();
    registry.start_plugin("slow").await.unwrap();

    assert_eq!(registry.update_plugins(0.016).await, 1);
    assert_eq!(registry.plugin_state("slow"), Some(PluginState::Error));
    assert_eq!(
        registry.security().monitor().level("slow"),
        BreachLevel::Hard
    );
    assert!(log
        .lock()
        .unwrap()
        .contains(&"slow:violation:hard_resource_limit".to_string()));
    assert!(registry
        .security()
        .violations("slow")
        .iter()
        .any(|v| v.kind == "hard_resource_limit"));

    // Errored plugins are skipped
    assert_eq!(registry.update_plugins(0.016).await, 0);
    assert_eq!(
        log.lock().unwrap().iter().filter(|e| *e == "slow:update").count(),
        1
    );

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_limit_callback_fires_once_per_breach() {
    let registry = started_registry(RuntimeConfig::default());
    registry
        .load_static(
            meta("hungry").with_limits(1000, 100),
            factory(&MockPlugin::new("hungry")),
        )
        .await
        .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let monitor = registry.security().monitor();
    monitor.on_limit_exceeded(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(monitor.is_within_limits("hungry"));
    monitor.update("hungry", ResourceKind::Memory, 1200);
    monitor.update("hungry", ResourceKind::Memory, 1300);
    monitor.check("hungry");
    assert!(!monitor.is_within_limits("hungry"));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    monitor.update("hungry", ResourceKind::Memory, 500);
    monitor.update("hungry", ResourceKind::Memory, 1200);
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_violation_threshold_blocks_start() {
    let mut config = RuntimeConfig::default();
    config.security.violation_threshold = 2;
    let registry = started_registry(config);
    let mock = MockPlugin::new("noisy");
    registry.load_static(meta("noisy"), factory(&mock)).await.unwrap();

    for _ in 0..2 {
        assert!(registry
            .security()
            .check_permission("noisy", Permission::NetworkAccess)
            .is_err());
    }
    let err = registry.start_plugin("noisy").await.unwrap_err();
    assert!(matches!(err, RuntimeError::Blocked(_)));
    assert_eq!(registry.plugin_state("noisy"), Some(PluginState::Loaded));
    assert_eq!(mock.call_count("initialize"), 0);

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_flow_only_to_active_plugins() {
    let registry = started_registry(RuntimeConfig::default());
    let receiver = MockPlugin::new("receiver");
    let sender = MockPlugin::new("sender");
    registry
        .load_plugins_with_dependencies(vec![
            source(meta("receiver"), &receiver),
            source(meta("sender"), &sender),
        ])
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    receiver
        .context()
        .unwrap()
        .register_message_handler(
            "ping",
            Arc::new(move |msg: &PluginMessage| -> std::result::Result<(), String> {
                sink.lock().unwrap().push((msg.sender.clone(), msg.content.clone()));
                Ok(())
            }),
        )
        .unwrap();

    let out = sender.context().unwrap();
    registry.pause_plugin("receiver").await.unwrap();
    for i in 0..3 {
        out.send_message(PluginMessage::new("spoofed", "receiver", "ping", i.to_string()))
            .await
            .unwrap();
    }
    assert!(!registry.router().wait_idle(Duration::from_millis(100)).await);
    assert!(seen.lock().unwrap().is_empty());

    registry.resume_plugin("receiver").await.unwrap();
    assert!(registry.router().wait_idle(IDLE).await);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("sender".to_string(), "0".to_string()),
            ("sender".to_string(), "1".to_string()),
            ("sender".to_string(), "2".to_string()),
        ]
    );

    registry
        .security()
        .revoke_permission("sender", Permission::PluginCommunication);
    assert!(matches!(
        out.send_message(PluginMessage::new("sender", "receiver", "ping", "x"))
            .await,
        Err(PluginError::PermissionDenied(Permission::PluginCommunication))
    ));

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_event_subscriptions_released_on_unload() {
    let registry = started_registry(RuntimeConfig::default());
    let listener = MockPlugin::new("listener");
    registry
        .load_static(meta("listener"), factory(&listener))
        .await
        .unwrap();
    registry.start_plugin("listener").await.unwrap();
    assert!(registry.events().wait_idle(IDLE).await);

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let context = listener.context().unwrap();
    context
        .subscribe_to_event(
            "plugin.*",
            Arc::new(move |_: &PluginEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    registry
        .load_static(meta("other"), factory(&MockPlugin::new("other")))
        .await
        .unwrap();
    assert!(registry.events().wait_idle(IDLE).await);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    registry.unload_plugin("listener", false).await.unwrap();
    assert!(registry.events().subscriptions("listener").is_empty());
    registry.start_plugin("other").await.unwrap();
    assert!(registry.events().wait_idle(IDLE).await);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_required_sandbox_confines_file_access() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RuntimeConfig::default();
    config.plugins.plugin_dir = dir.path().to_path_buf();
    let registry = started_registry(config);

    let mock = MockPlugin::new("boxed");
    let mut metadata = meta("boxed").with_permission(Permission::ReadFiles);
    metadata.sandbox_required = true;
    registry.load_static(metadata, factory(&mock)).await.unwrap();
    registry.start_plugin("boxed").await.unwrap();

    let context = mock.context().unwrap();
    let save = context.data_dir().unwrap().join("save.bin");
    assert!(save.starts_with(dir.path().join("boxed")));
    assert!(context.check_path_access(&save, true).is_ok());
    assert!(registry.security().can_access_path("boxed", &save, true));
    assert!(context.config_dir().is_ok());

    // ReadFiles does not reach outside an enabled sandbox
    assert!(matches!(
        context.check_path_access(Path::new("/etc/hosts"), false),
        Err(PluginError::PermissionDenied(Permission::ReadFiles))
    ));
    assert!(context
        .check_path_access(&dir.path().join("neighbor").join("data"), true)
        .is_err());
    assert_eq!(registry.security().violation_count("boxed"), 2);

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_violation_threshold_fails_running_plugin() {
    let mut config = RuntimeConfig::default();
    config.security.violation_threshold = 2;
    let registry = started_registry(config)
        .with_host_services(HostServices::new().with_renderer(Arc::new(TestRenderer)));
    let log = shared_log();
    let snoop = ScriptedPlugin::new(
        "snoop",
        log.clone(),
        Arc::new(|context: &dyn HostContext| {
            // Denied, but swallowed by the plugin
            let _ = context.renderer();
            Ok(())
        }),
    );
    registry
        .load_static(meta("snoop"), move || Box::new(snoop.clone()) as Box<dyn Plugin>)
        .await
        .unwrap();
    registry.start_plugin("snoop").await.unwrap();

    assert_eq!(registry.update_plugins(0.016).await, 1);
    assert_eq!(registry.plugin_state("snoop"), Some(PluginState::Active));

    assert_eq!(registry.update_plugins(0.016).await, 1);
    assert_eq!(registry.plugin_state("snoop"), Some(PluginState::Error));
    assert_eq!(count(&log, "snoop:violation:violation_threshold"), 1);
    assert!(registry
        .security()
        .violations("snoop")
        .iter()
        .any(|v| v.kind == "violation_threshold"));

    assert_eq!(registry.update_plugins(0.016).await, 0);
    assert_eq!(count(&log, "snoop:update"), 2);

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_violations_outside_update_fail_before_next_update() {
    let mut config = RuntimeConfig::default();
    config.security.violation_threshold = 2;
    let registry = started_registry(config);
    let mock = MockPlugin::new("noisy");
    registry.load_static(meta("noisy"), factory(&mock)).await.unwrap();
    registry.start_plugin("noisy").await.unwrap();

    let context = mock.context().unwrap();
    for _ in 0..10 {
        assert!(context.renderer().is_err());
    }
    assert!(registry.security().should_block_plugin("noisy"));

    assert_eq!(registry.update_plugins(0.016).await, 0);
    assert_eq!(registry.plugin_state("noisy"), Some(PluginState::Error));
    assert_eq!(mock.call_count("update"), 0);
    assert_eq!(mock.call_count("violation"), 1);

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reported_memory_breach_moves_plugin_to_error() {
    let registry = started_registry(RuntimeConfig::default());
    let log = shared_log();
    let leaky = ScriptedPlugin::new(
        "leaky",
        log.clone(),
        Arc::new(|context: &dyn HostContext| {
            context.report_resource_usage(ResourceKind::Memory, 4_000)
        }),
    );
    registry
        .load_static(meta("leaky").with_limits(1_000, 1_000), move || {
            Box::new(leaky.clone()) as Box<dyn Plugin>
        })
        .await
        .unwrap();
    registry.start_plugin("leaky").await.unwrap();

    assert_eq!(registry.update_plugins(0.016).await, 1);
    assert_eq!(registry.plugin_state("leaky"), Some(PluginState::Error));
    let monitor = registry.security().monitor();
    assert_eq!(monitor.level("leaky"), BreachLevel::Hard);
    assert_eq!(monitor.usage("leaky").unwrap().memory_bytes, 4_000);
    assert_eq!(count(&log, "leaky:violation:hard_resource_limit"), 1);

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_soft_memory_breach_keeps_plugin_running() {
    let registry = started_registry(RuntimeConfig::default());
    let log = shared_log();
    let plump = ScriptedPlugin::new(
        "plump",
        log.clone(),
        Arc::new(|context: &dyn HostContext| {
            context.report_resource_usage(ResourceKind::Memory, 1_200)
        }),
    );
    registry
        .load_static(meta("plump").with_limits(1_000, 1_000), move || {
            Box::new(plump.clone()) as Box<dyn Plugin>
        })
        .await
        .unwrap();
    registry.start_plugin("plump").await.unwrap();

    assert_eq!(registry.update_plugins(0.016).await, 1);
    assert_eq!(registry.plugin_state("plump"), Some(PluginState::Active));
    assert_eq!(registry.security().monitor().level("plump"), BreachLevel::Soft);
    assert!(registry
        .security()
        .violations("plump")
        .iter()
        .any(|v| v.kind == "soft_resource_limit"));

    registry.shutdown().await.unwrap();
}
