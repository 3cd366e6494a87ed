//! # Example Counter Plugin
//!
//! A native plugin that counts updates and talks to its peers.
//!
//! ## Features
//!
//! - Publishes `counter.tick` every `emit_every` updates (context config, default 2)
//! - Handles `increment` messages whose content is an amount
//! - Resets its tick count on `counter.reset`
//!
//! Build it as a `cdylib` and drop the library next to `plugin.json` in a
//! plugin search path.

use async_trait::async_trait;
use keel_plugin_api::prelude::*;
use keel_plugin_api::{export_plugin, Result, SecurityViolation};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Plugin name
pub const NAME: &str = "counter";

/// Event published every `emit_every` ticks
pub const TICK_EVENT: &str = "counter.tick";

/// Event that resets the tick count
pub const RESET_EVENT: &str = "counter.reset";

/// Message type adding to the increment total
pub const INCREMENT_MESSAGE: &str = "increment";

const DEFAULT_EMIT_EVERY: u64 = 2;

/// Counters shared with message and event callbacks
#[derive(Debug, Default)]
pub struct CounterState {
    ticks: AtomicU64,
    increments: AtomicU64,
}

impl CounterState {
    /// Updates since start or the last reset
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Sum of all `increment` amounts received
    pub fn increments(&self) -> u64 {
        self.increments.load(Ordering::SeqCst)
    }
}

/// Counter plugin
#[derive(Debug)]
pub struct CounterPlugin {
    state: Arc<CounterState>,
    context: Option<Arc<dyn HostContext>>,
    emit_every: u64,
    subscription: Option<u64>,
}

impl CounterPlugin {
    /// Create a counter with fresh state
    pub fn new() -> Self {
        Self::with_state(Arc::new(CounterState::default()))
    }

    /// Create a counter reporting into `state`
    pub fn with_state(state: Arc<CounterState>) -> Self {
        Self {
            state,
            context: None,
            emit_every: DEFAULT_EMIT_EVERY,
            subscription: None,
        }
    }

    /// Metadata exported with the module
    pub fn metadata() -> PluginMetadata {
        let mut metadata = PluginMetadata::new(NAME, PluginVersion::new(0, 1, 0))
            .with_tag("normal")
            .with_permission(Permission::PluginCommunication);
        metadata.display_name = "Counter".to_string();
        metadata.description = "Counts updates and publishes a tick event".to_string();
        metadata
    }
}

impl Default for CounterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for CounterPlugin {
    fn name(&self) -> &str {
        NAME
    }

    async fn initialize(&mut self, context: Arc<dyn HostContext>) -> Result<()> {
        if let Some(value) = context.config("emit_every") {
            self.emit_every = value
                .parse()
                .map_err(|_| PluginError::config(format!("emit_every '{value}' is not a number")))?;
        }

        let state = Arc::clone(&self.state);
        context.register_message_handler(
            INCREMENT_MESSAGE,
            Arc::new(move |message: &PluginMessage| -> std::result::Result<(), String> {
                let amount: u64 = if message.content.is_empty() {
                    1
                } else {
                    message
                        .content
                        .parse()
                        .map_err(|_| format!("bad increment '{}'", message.content))?
                };
                state.increments.fetch_add(amount, Ordering::SeqCst);
                Ok(())
            }),
        )?;

        let state = Arc::clone(&self.state);
        let subscription = context.subscribe_to_event(
            RESET_EVENT,
            Arc::new(move |event: &PluginEvent| {
                debug!(source = %event.source, "Counter reset");
                state.ticks.store(0, Ordering::SeqCst);
            }),
        )?;
        self.subscription = Some(subscription);
        self.context = Some(context);

        info!(emit_every = self.emit_every, "Counter plugin initialized");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let (Some(context), Some(id)) = (&self.context, self.subscription.take()) {
            context.unsubscribe_from_event(id)?;
        }
        self.context = None;
        info!(ticks = self.state.ticks(), "Counter plugin shut down");
        Ok(())
    }

    fn update(&mut self, _delta_time: f64) -> Result<()> {
        let ticks = self.state.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if self.emit_every == 0 || ticks % self.emit_every != 0 {
            return Ok(());
        }

        if let Some(context) = &self.context {
            let event = PluginEvent::new(TICK_EVENT, NAME).with_data("ticks", ticks.to_string());
            if let Err(e) = context.emit_event(event) {
                warn!(error = %e, "Failed to publish tick");
            }
        }
        Ok(())
    }

    fn on_security_violation(&mut self, violation: &SecurityViolation) {
        warn!(kind = %violation.kind, "{}", violation.description);
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        if self.context.is_some() {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Degraded("not initialized".to_string()))
        }
    }
}

export_plugin!(CounterPlugin::new(), CounterPlugin::metadata());
