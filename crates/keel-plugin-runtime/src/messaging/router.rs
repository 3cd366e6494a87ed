//! Point-to-point, broadcast and synchronous message delivery
//!
//! Each registered plugin owns a bounded queue split into one FIFO per
//! priority tier. A fixed pool of worker tasks drains the queues; a queue is
//! handled by at most one worker at a time, which keeps per-recipient FIFO
//! order within a tier. Tiers are served strictly by priority.

use crate::config::MessagingConfig;
use crate::error::MessagingError;
use dashmap::DashMap;
use keel_plugin_api::{DeliveryMode, MessageHandler, PluginMessage};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type Reply = oneshot::Sender<Result<(), MessagingError>>;

struct Envelope {
    message: PluginMessage,
    reply: Option<Reply>,
}

#[derive(Default)]
struct RecipientQueue {
    tiers: [VecDeque<Envelope>; 4],
    paused: bool,
    blocked: bool,
    in_flight: bool,
    scheduled: bool,
}

impl RecipientQueue {
    fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    fn pop(&mut self) -> Option<Envelope> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    fn runnable(&self) -> bool {
        !self.paused && !self.blocked && !self.in_flight && self.len() > 0
    }

    fn drain(&mut self) -> Vec<Envelope> {
        self.tiers.iter_mut().flat_map(|tier| tier.drain(..)).collect()
    }
}

#[derive(Default)]
struct RouterState {
    queues: HashMap<String, RecipientQueue>,
    ready: VecDeque<String>,
}

impl RouterState {
    fn schedule(&mut self, recipient: &str) -> bool {
        match self.queues.get_mut(recipient) {
            Some(queue) if queue.runnable() && !queue.scheduled => {
                queue.scheduled = true;
                self.ready.push_back(recipient.to_string());
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    processing_nanos: AtomicU64,
}

/// Router counters snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Messages accepted into a queue
    pub sent: u64,
    /// Successful handler invocations
    pub delivered: u64,
    /// Deliveries given up on
    pub failed: u64,
    /// Reliable deliveries re-enqueued
    pub retried: u64,
    /// Sends refused because a queue was full
    pub rejected: u64,
    /// Messages waiting in queues or retry
    pub pending: usize,
    /// Mean handler time
    #[serde(with = "humantime_serde")]
    pub average_processing_time: Duration,
}

struct RouterInner {
    config: MessagingConfig,
    state: Mutex<RouterState>,
    handlers: DashMap<(String, String), MessageHandler>,
    work: Notify,
    idle: Notify,
    pending: AtomicUsize,
    counters: Counters,
    retry_tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Message router
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl MessageRouter {
    /// Create a stopped router
    pub fn new(config: MessagingConfig) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                config,
                state: Mutex::new(RouterState::default()),
                handlers: DashMap::new(),
                work: Notify::new(),
                idle: Notify::new(),
                pending: AtomicUsize::new(0),
                counters: Counters::default(),
                retry_tx: Mutex::new(None),
                running: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the worker pool and the retry task.
    ///
    /// Must be called inside a Tokio runtime. Calling it twice is a no-op;
    /// calling it after [`shutdown`](Self::shutdown) starts a fresh pool.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();

        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        *self.inner.retry_tx.lock() = Some(retry_tx);

        let mut tasks = self.inner.tasks.lock();
        let workers = self.inner.config.worker_count.max(1);
        for id in 0..workers {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(worker_loop(inner, id, cancel.clone())));
        }
        tasks.push(tokio::spawn(retry_loop(Arc::clone(&self.inner), retry_rx, cancel)));

        info!(workers, "Message router started");
    }

    /// Stop workers; queued messages are dropped and their senders notified
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.lock().cancel();
        self.inner.retry_tx.lock().take();

        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let dropped: Vec<Envelope> = {
            let mut state = self.inner.state.lock();
            state.ready.clear();
            state.queues.values_mut().flat_map(RecipientQueue::drain).collect()
        };
        for envelope in dropped {
            self.inner.finish(envelope, Err(MessagingError::NotRunning));
        }

        info!("Message router stopped");
    }

    /// Whether workers are running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Create a queue for `plugin`
    pub fn register_plugin(&self, plugin: &str) {
        self.inner
            .state
            .lock()
            .queues
            .entry(plugin.to_string())
            .or_default();
        debug!(plugin = %plugin, "Router queue created");
    }

    /// Drop the plugin's queue and handlers
    pub fn unregister_plugin(&self, plugin: &str) {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.ready.retain(|name| name != plugin);
            state
                .queues
                .remove(plugin)
                .map(|mut q| q.drain())
                .unwrap_or_default()
        };
        for envelope in dropped {
            self.inner.finish(
                envelope,
                Err(MessagingError::RecipientUnavailable(plugin.to_string())),
            );
        }
        self.inner.handlers.retain(|(owner, _), _| owner != plugin);
        debug!(plugin = %plugin, "Router queue removed");
    }

    /// Whether `plugin` has a queue
    pub fn is_registered(&self, plugin: &str) -> bool {
        self.inner.state.lock().queues.contains_key(plugin)
    }

    /// Handle `message_type` messages addressed to `plugin`
    pub fn register_handler(&self, plugin: &str, message_type: &str, handler: MessageHandler) {
        self.register_plugin(plugin);
        self.inner
            .handlers
            .insert((plugin.to_string(), message_type.to_string()), handler);
    }

    /// Remove a handler
    pub fn unregister_handler(&self, plugin: &str, message_type: &str) -> bool {
        self.inner
            .handlers
            .remove(&(plugin.to_string(), message_type.to_string()))
            .is_some()
    }

    /// Hold deliveries to `plugin`; sends still queue up to capacity
    pub fn pause_recipient(&self, plugin: &str) {
        if let Some(queue) = self.inner.state.lock().queues.get_mut(plugin) {
            queue.paused = true;
        }
    }

    /// Resume deliveries to `plugin`
    pub fn resume_recipient(&self, plugin: &str) {
        let scheduled = {
            let mut state = self.inner.state.lock();
            if let Some(queue) = state.queues.get_mut(plugin) {
                queue.paused = false;
            }
            state.schedule(plugin)
        };
        if scheduled {
            self.inner.work.notify_one();
        }
    }

    /// Refuse deliveries to `plugin` and drop what is queued
    pub fn block_recipient(&self, plugin: &str) {
        let dropped = {
            let mut state = self.inner.state.lock();
            match state.queues.get_mut(plugin) {
                Some(queue) => {
                    queue.blocked = true;
                    queue.drain()
                }
                None => Vec::new(),
            }
        };
        for envelope in dropped {
            self.inner.finish(
                envelope,
                Err(MessagingError::RecipientUnavailable(plugin.to_string())),
            );
        }
    }

    /// Accept deliveries to `plugin` again
    pub fn unblock_recipient(&self, plugin: &str) {
        if let Some(queue) = self.inner.state.lock().queues.get_mut(plugin) {
            queue.blocked = false;
        }
    }

    /// Messages waiting for `plugin`
    pub fn queue_len(&self, plugin: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(plugin)
            .map_or(0, RecipientQueue::len)
    }

    /// Send a message according to its delivery mode.
    ///
    /// `Synchronous` waits for the handler or the configured timeout. All
    /// other modes return once the message is queued.
    pub async fn send(&self, mut message: PluginMessage) -> Result<(), MessagingError> {
        if !self.is_running() {
            return Err(MessagingError::NotRunning);
        }

        match message.delivery_mode {
            DeliveryMode::Broadcast => {
                self.broadcast(message);
                Ok(())
            }
            DeliveryMode::Synchronous => {
                let (tx, rx) = oneshot::channel();
                self.inner.enqueue(Envelope {
                    message,
                    reply: Some(tx),
                })?;

                let timeout = self.inner.config.sync_timeout;
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(MessagingError::NotRunning),
                    Err(_) => {
                        warn!(timeout = ?timeout, "Synchronous delivery timed out");
                        Err(MessagingError::Timeout(timeout))
                    }
                }
            }
            DeliveryMode::Reliable => {
                if message.max_retries == 0 {
                    message.max_retries = self.inner.config.default_max_retries;
                }
                self.inner.enqueue(Envelope {
                    message,
                    reply: None,
                })
            }
            DeliveryMode::Asynchronous => self.inner.enqueue(Envelope {
                message,
                reply: None,
            }),
        }
    }

    fn broadcast(&self, message: PluginMessage) {
        let recipients: Vec<String> = {
            let state = self.inner.state.lock();
            let mut names: Vec<String> = state
                .queues
                .iter()
                .filter(|(name, queue)| **name != message.sender && !queue.blocked)
                .map(|(name, _)| name.clone())
                .collect();
            names.sort();
            names
        };

        for recipient in recipients {
            let mut copy = message.clone();
            copy.recipient = recipient.clone();
            copy.delivery_mode = DeliveryMode::Asynchronous;
            if let Err(e) = self.inner.enqueue(Envelope {
                message: copy,
                reply: None,
            }) {
                warn!(recipient = %recipient, error = %e, "Broadcast copy rejected");
            }
        }
    }

    /// Wait until nothing is queued, in flight or awaiting retry
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
    pub fn stats(&self) -> RouterStats {
        let c = &self.inner.counters;
        let processed = c.processed.load(Ordering::Relaxed);
        let nanos = c.processing_nanos.load(Ordering::Relaxed);
        RouterStats {
            sent: c.sent.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            pending: self.inner.pending.load(Ordering::SeqCst),
            average_processing_time: if processed == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(nanos / processed)
            },
        }
    }
}

impl RouterInner {
    fn enqueue(&self, envelope: Envelope) -> Result<(), MessagingError> {
        let recipient = envelope.message.recipient.clone();
        let scheduled = {
            let mut state = self.state.lock();
            let queue = state
                .queues
                .get_mut(&recipient)
                .ok_or_else(|| MessagingError::RecipientUnavailable(recipient.clone()))?;

            if queue.blocked {
                return Err(MessagingError::RecipientUnavailable(recipient));
            }
            if queue.len() >= self.config.max_queue_size {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(recipient = %recipient, "Message rejected, queue full");
                return Err(MessagingError::QueueFull(recipient));
            }

            let tier = envelope.message.priority.tier();
            queue.tiers[tier].push_back(envelope);
            self.pending.fetch_add(1, Ordering::SeqCst);
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
            state.schedule(&recipient)
        };

        if scheduled {
            self.work.notify_one();
        }
        Ok(())
    }

    fn next_envelope(&self) -> Option<Envelope> {
        let mut state = self.state.lock();
        while let Some(recipient) = state.ready.pop_front() {
            let Some(queue) = state.queues.get_mut(&recipient) else {
                continue;
            };
            queue.scheduled = false;
            if !queue.runnable() {
                continue;
            }
            if let Some(envelope) = queue.pop() {
                queue.in_flight = true;
                return Some(envelope);
            }
        }
        None
    }

    fn release(&self, recipient: &str) {
        let scheduled = {
            let mut state = self.state.lock();
            if let Some(queue) = state.queues.get_mut(recipient) {
                queue.in_flight = false;
            }
            state.schedule(recipient)
        };
        if scheduled {
            self.work.notify_one();
        }
    }

    fn deliver(&self, mut envelope: Envelope) {
        let message = &envelope.message;
        let handler = self
            .handlers
            .get(&(message.recipient.clone(), message.message_type.clone()))
            .map(|h| Arc::clone(h.value()));

        let started = Instant::now();
        let outcome = match handler {
            None => Err(MessagingError::HandlerMissing {
                recipient: message.recipient.clone(),
                message_type: message.message_type.clone(),
            }),
            Some(handler) => match std::panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(MessagingError::DeliveryFailed(e)),
                Err(_) => Err(MessagingError::DeliveryFailed("handler panicked".into())),
            },
        };
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .processing_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

        if let Err(e) = &outcome {
            if envelope.message.delivery_mode == DeliveryMode::Reliable && envelope.message.can_retry() {
                envelope.message.retry_count += 1;
                debug!(
                    message = %envelope.message.id,
                    attempt = envelope.message.retry_count,
                    error = %e,
                    "Scheduling retry"
                );
                if let Some(tx) = self.retry_tx.lock().as_ref() {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    if let Err(mpsc::error::SendError(envelope)) = tx.send(envelope) {
                        self.finish(envelope, Err(MessagingError::NotRunning));
                    }
                    return;
                }
            }
        }

        self.finish(envelope, outcome);
    }

    fn finish(&self, envelope: Envelope, outcome: Result<(), MessagingError>) {
        match &outcome {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                trace!(message = %envelope.message.id, "Message delivered");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message = %envelope.message.id,
                    sender = %envelope.message.sender,
                    recipient = %envelope.message.recipient,
                    error = %e,
                    "Message delivery failed"
                );
            }
        }

        if let Some(reply) = envelope.reply {
            let _ = reply.send(outcome);
        }

        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

async fn worker_loop(inner: Arc<RouterInner>, id: usize, cancel: CancellationToken) {
    trace!(worker = id, "Router worker started");
    loop {
        if let Some(envelope) = inner.next_envelope() {
            let recipient = envelope.message.recipient.clone();
            inner.deliver(envelope);
            inner.release(&recipient);
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = inner.work.notified() => {}
        }
    }
    trace!(worker = id, "Router worker stopped");
}

async fn retry_loop(
    inner: Arc<RouterInner>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                inner.finish(envelope, Err(MessagingError::NotRunning));
                break;
            }
            _ = tokio::time::sleep(inner.config.retry_delay) => {}
        }

        let Envelope { message, reply } = envelope;
        let recipient = message.recipient.clone();
        let requeue = {
            let mut state = inner.state.lock();
            match state.queues.get_mut(&recipient) {
                Some(queue) if queue.blocked => Err((
                    Envelope { message, reply },
                    MessagingError::RecipientUnavailable(recipient.clone()),
                )),
                Some(queue) if queue.len() >= inner.config.max_queue_size => {
                    inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(recipient = %recipient, "Retry rejected, queue full");
                    Err((
                        Envelope { message, reply },
                        MessagingError::QueueFull(recipient.clone()),
                    ))
                }
                Some(queue) => {
                    queue.tiers[message.priority.tier()].push_back(Envelope { message, reply });
                    Ok(state.schedule(&recipient))
                }
                None => Err((
                    Envelope { message, reply },
                    MessagingError::RecipientUnavailable(recipient.clone()),
                )),
            }
        };

        match requeue {
            Ok(true) => inner.work.notify_one(),
            Ok(false) => {}
            Err((envelope, error)) => inner.finish(envelope, Err(error)),
        }
    }

    while let Ok(envelope) = rx.try_recv() {
        inner.finish(envelope, Err(MessagingError::NotRunning));
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("running", &self.is_running())
            .field("handlers", &self.inner.handlers.len())
            .field("stats", &self.stats())
            .finish()
    }
}
