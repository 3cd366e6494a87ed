//! Message, event and violation value types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Scheduling priority; higher tiers are serviced first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Serviced last
    Low,
    /// Default tier
    #[default]
    Normal,
    /// Serviced before normal
    High,
    /// Serviced first
    Critical,
}

impl MessagePriority {
    /// Index into a per-tier array, highest first
    pub fn tier(&self) -> usize {
        match self {
            MessagePriority::Critical => 0,
            MessagePriority::High => 1,
            MessagePriority::Normal => 2,
            MessagePriority::Low => 3,
        }
    }
}

/// How the router delivers a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Enqueue and return
    #[default]
    Asynchronous,
    /// Wait for the handler to finish or a timeout
    Synchronous,
    /// Deliver to every registered plugin except the sender
    Broadcast,
    /// Retry failed deliveries up to `max_retries`
    Reliable,
}

/// A point-to-point or broadcast message between plugins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMessage {
    /// Unique id
    pub id: String,
    /// Sending plugin
    pub sender: String,
    /// Receiving plugin; empty for broadcasts
    pub recipient: String,
    /// Handler selector
    pub message_type: String,
    /// Payload
    pub content: String,
    /// Extra key-value parameters
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Scheduling priority
    #[serde(default)]
    pub priority: MessagePriority,
    /// Delivery semantics
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Deliveries retried so far
    #[serde(default)]
    pub retry_count: u32,
    /// Retry budget for reliable delivery
    #[serde(default)]
    pub max_retries: u32,
}

impl PluginMessage {
    /// Create an asynchronous normal-priority message
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type: message_type.into(),
            content: content.into(),
            parameters: HashMap::new(),
            priority: MessagePriority::Normal,
            delivery_mode: DeliveryMode::Asynchronous,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: 0,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the delivery mode
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Add a parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Whether another retry is allowed
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// A published event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    /// Unique id
    pub id: String,
    /// Event name matched against subscription patterns
    pub name: String,
    /// Emitting plugin
    pub source: String,
    /// Payload
    #[serde(default)]
    pub data: HashMap<String, String>,
    /// Event priority
    #[serde(default)]
    pub priority: MessagePriority,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Restrict delivery to these subscribers; empty means everyone
    #[serde(default)]
    pub targets: Vec<String>,
}

impl PluginEvent {
    /// Create a broadcast event
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            source: source.into(),
            data: HashMap::new(),
            priority: MessagePriority::Normal,
            timestamp: Utc::now(),
            targets: Vec::new(),
        }
    }

    /// Add a data entry
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a target subscriber
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// Whether `plugin` should receive this event
    pub fn is_targeted_at(&self, plugin: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t == plugin)
    }
}

/// How serious a recorded violation is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    /// Informational
    Info,
    /// Soft limit exceeded or access denied
    Warning,
    /// Hard limit exceeded
    Error,
    /// Plugin must be stopped
    Critical,
}

/// An entry in the security violation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityViolation {
    /// Offending plugin
    pub plugin_name: String,
    /// Short category, e.g. `permission_denied` or `memory_limit`
    pub kind: String,
    /// Severity
    pub severity: ViolationSeverity,
    /// Human readable detail
    pub description: String,
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
}

impl SecurityViolation {
    /// Create a violation timestamped now
    pub fn new(
        plugin_name: impl Into<String>,
        kind: impl Into<String>,
        severity: ViolationSeverity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            kind: kind.into(),
            severity,
            description: description.into(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for SecurityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] {}: {} ({})",
            self.severity, self.plugin_name, self.kind, self.description
        )
    }
}

/// Handler invoked by router workers; an `Err` counts as a failed delivery
pub type MessageHandler = Arc<dyn Fn(&PluginMessage) -> Result<(), String> + Send + Sync>;

/// Callback invoked by the event dispatcher
pub type EventCallback = Arc<dyn Fn(&PluginEvent) + Send + Sync>;
