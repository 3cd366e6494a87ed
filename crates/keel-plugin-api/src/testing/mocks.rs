//! Mock implementations for testing

use crate::context::HostContext;
use crate::error::Result;
use crate::message::SecurityViolation;
use crate::plugin::{HealthStatus, Plugin};
use crate::PluginError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Shared, ordered record of `"<plugin>:<call>"` entries
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Mock plugin that records every lifecycle call
#[derive(Debug, Clone)]
pub struct MockPlugin {
    name: String,
    log: CallLog,
    fail_init: bool,
    fail_update: bool,
    context: Arc<Mutex<Option<Arc<dyn HostContext>>>>,
}

impl MockPlugin {
    /// Create a new mock plugin with its own log
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_log(name, Arc::new(Mutex::new(Vec::new())))
    }

    /// Create a mock plugin writing into a shared log
    pub fn with_log(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            log,
            fail_init: false,
            fail_update: false,
            context: Arc::new(Mutex::new(None)),
        }
    }

    /// Make `initialize` fail
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Make `update` fail
    pub fn failing_update(mut self) -> Self {
        self.fail_update = true;
        self
    }

    /// The log this mock writes to
    pub fn log(&self) -> CallLog {
        Arc::clone(&self.log)
    }

    /// Recorded calls so far
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Number of recorded calls named `call` for this plugin
    pub fn call_count(&self, call: &str) -> usize {
        let entry = format!("{}:{}", self.name, call);
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == entry)
            .count()
    }

    /// Context received in `initialize`, if any
    pub fn context(&self) -> Option<Arc<dyn HostContext>> {
        self.context.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, call));
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, context: Arc<dyn HostContext>) -> Result<()> {
        self.record("initialize");
        if self.fail_init {
            return Err(PluginError::init("mock configured to fail"));
        }
        *self.context.lock().unwrap() = Some(context);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.record("shutdown");
        Ok(())
    }

    fn update(&mut self, _delta_time: f64) -> Result<()> {
        self.record("update");
        if self.fail_update {
            return Err(PluginError::runtime("mock update failure"));
        }
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        self.record("pause");
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        self.record("resume");
        Ok(())
    }

    fn on_security_violation(&mut self, _violation: &SecurityViolation) {
        self.record("violation");
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        Ok(HealthStatus::Healthy)
    }
}
