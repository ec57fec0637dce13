/// Multi-queue work scheduler.
///
/// Each named queue runs one processor loop that selects ready messages by
/// priority, dispatches them to agents through the `TaskDispatcher` seam
/// (normally an event-bus publish), and treats the agent's completion event
/// as success. Failures retry with a per-queue delay until the retry budget
/// is spent, then the message moves to the queue's dead letter queue.
use crate::errors::{QueueError, QueueResult};
use crate::events::{topics, Event, EventData};
use crate::traits::{EventHandler, Lifecycle, MessagePublisher};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Smoothing factor for the processing/wait time moving averages.
const EMA_ALPHA: f64 = 0.2;

/// Message priority. Lower rank dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessagePriority::Critical => write!(f, "critical"),
            MessagePriority::High => write!(f, "high"),
            MessagePriority::Medium => write!(f, "medium"),
            MessagePriority::Low => write!(f, "low"),
        }
    }
}

/// Per-queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Default priority for messages enqueued without one
    #[serde(default = "default_priority")]
    pub priority_class: MessagePriority,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,
    /// Total attempts before a message dead-letters
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Token bucket capacity per second; None disables rate limiting
    #[serde(default)]
    pub rate_per_second: Option<u32>,
    /// Token bucket capacity per minute
    #[serde(default)]
    pub rate_per_minute: Option<u32>,
    /// Reserved: queue contents survive restarts when a backing store is
    /// attached. The in-process build keeps queues memory-only.
    #[serde(default)]
    pub persistence: bool,
    /// Name of the dead letter queue for exhausted messages
    #[serde(default)]
    pub dead_letter_queue: Option<String>,
}

fn default_priority() -> MessagePriority {
    MessagePriority::Medium
}

fn default_max_size() -> usize {
    1000
}

fn default_processing_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    10
}

fn default_concurrency() -> usize {
    4
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority_class: default_priority(),
            max_size: default_max_size(),
            processing_timeout_ms: default_processing_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            rate_per_second: None,
            rate_per_minute: None,
            persistence: false,
            dead_letter_queue: None,
        }
    }
}

/// Built-in queues and their parameters.
pub fn builtin_queues() -> Vec<(&'static str, QueueConfig)> {
    let dlq = |name: &str| Some(format!("{}-dlq", name));
    vec![
        (
            "search-requests",
            QueueConfig {
                priority_class: MessagePriority::High,
                max_size: 500,
                rate_per_second: Some(50),
                rate_per_minute: Some(1000),
                dead_letter_queue: dlq("search-requests"),
                ..Default::default()
            },
        ),
        (
            "candidate-generation",
            QueueConfig {
                concurrency: 8,
                processing_timeout_ms: 45_000,
                dead_letter_queue: dlq("candidate-generation"),
                ..Default::default()
            },
        ),
        (
            "validation-tasks",
            QueueConfig {
                retry_attempts: 2,
                dead_letter_queue: dlq("validation-tasks"),
                ..Default::default()
            },
        ),
        (
            "ranking-tasks",
            QueueConfig {
                dead_letter_queue: dlq("ranking-tasks"),
                ..Default::default()
            },
        ),
        (
            "selection-tasks",
            QueueConfig {
                priority_class: MessagePriority::High,
                dead_letter_queue: dlq("selection-tasks"),
                ..Default::default()
            },
        ),
        (
            "enrichment-tasks",
            QueueConfig {
                concurrency: 8,
                rate_per_second: Some(20),
                dead_letter_queue: dlq("enrichment-tasks"),
                ..Default::default()
            },
        ),
        (
            "output-generation",
            QueueConfig {
                dead_letter_queue: dlq("output-generation"),
                ..Default::default()
            },
        ),
        (
            "booking-requests",
            QueueConfig {
                priority_class: MessagePriority::Critical,
                retry_attempts: 5,
                rate_per_second: Some(10),
                rate_per_minute: Some(200),
                persistence: true,
                dead_letter_queue: dlq("booking-requests"),
                ..Default::default()
            },
        ),
        (
            "notifications",
            QueueConfig {
                priority_class: MessagePriority::Low,
                max_size: 5000,
                ..Default::default()
            },
        ),
        (
            "telemetry-events",
            QueueConfig {
                priority_class: MessagePriority::Low,
                max_size: 10_000,
                batch_size: 50,
                retry_attempts: 1,
                ..Default::default()
            },
        ),
    ]
}

/// Well-known completion topic for a task type. Messages with a completion
/// topic stay in-flight until the agent's event arrives; others succeed as
/// soon as dispatch does.
pub fn completion_topic(task_type: &str) -> Option<&'static str> {
    match task_type {
        "candidate-generation" => Some(topics::CANDIDATES),
        "validation" => Some(topics::CONSTRAINTS),
        "ranking" => Some(topics::SELECTION_PROP),
        "selection" => Some(topics::SELECTION_CONF),
        "enrichment" => Some(topics::AVAILABILITY),
        "itinerary-build" => Some(topics::ITINERARY),
        "output-generation" => Some(topics::OUTPUT),
        _ => None,
    }
}

/// Error recorded against a message attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageError {
    pub error: String,
    pub at: DateTime<Utc>,
}

/// A message inside a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub msg_type: String,
    pub payload: serde_json::Value,
    pub priority: MessagePriority,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_history: Vec<MessageError>,
    pub delay_until: Option<DateTime<Utc>>,
    pub ttl_deadline: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub saga_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub original_queue: Option<String>,
}

/// Options for `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<MessagePriority>,
    pub delay: Option<Duration>,
    pub ttl: Option<Duration>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub saga_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
}

/// Two-window token bucket (per-second and per-minute capacities).
struct TokenBucket {
    per_second: Option<f64>,
    per_minute: Option<f64>,
    second_tokens: f64,
    minute_tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_second: Option<u32>, per_minute: Option<u32>) -> Self {
        Self {
            per_second: per_second.map(f64::from),
            per_minute: per_minute.map(f64::from),
            second_tokens: per_second.map(f64::from).unwrap_or(0.0),
            minute_tokens: per_minute.map(f64::from).unwrap_or(0.0),
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        if let Some(cap) = self.per_second {
            self.second_tokens = (self.second_tokens + elapsed * cap).min(cap);
        }
        if let Some(cap) = self.per_minute {
            self.minute_tokens = (self.minute_tokens + elapsed * cap / 60.0).min(cap);
        }

        let second_ok = self.per_second.map_or(true, |_| self.second_tokens >= 1.0);
        let minute_ok = self.per_minute.map_or(true, |_| self.minute_tokens >= 1.0);
        if second_ok && minute_ok {
            if self.per_second.is_some() {
                self.second_tokens -= 1.0;
            }
            if self.per_minute.is_some() {
                self.minute_tokens -= 1.0;
            }
            true
        } else {
            false
        }
    }
}

/// Per-queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub processed: u64,
    pub failed_attempts: u64,
    pub retries_scheduled: u64,
    pub dead_lettered: u64,
    pub expired: u64,
    pub rate_limit_hits: u64,
    /// Exponential moving averages, milliseconds
    pub avg_processing_ms: f64,
    pub avg_wait_ms: f64,
}

/// Status snapshot for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub depth: usize,
    pub processing: usize,
    pub paused: bool,
    pub stats: QueueStats,
}

/// Dispatch seam: hands a ready message to its agent. The production
/// implementation publishes a task event on the bus.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, queue: &str, message: &QueuedMessage) -> Result<(), String>;
}

/// Dispatcher that publishes each task on a topic named after its type.
pub struct BusTaskDispatcher {
    publisher: Arc<dyn MessagePublisher>,
}

impl BusTaskDispatcher {
    pub fn new(publisher: Arc<dyn MessagePublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl TaskDispatcher for BusTaskDispatcher {
    async fn dispatch(&self, queue: &str, message: &QueuedMessage) -> Result<(), String> {
        let mut event = Event::new(
            message.msg_type.clone(),
            EventData::Signal {
                detail: serde_json::json!({
                    "queue": queue,
                    "message_id": message.id,
                    "payload": message.payload,
                    "attempt": message.attempts + 1,
                }),
            },
        )
        .with_source("queue-manager");
        if let Some(saga_id) = message.saga_id {
            event = event.with_saga(saga_id);
        }
        if let Some(correlation_id) = message.correlation_id {
            event = event.with_correlation(correlation_id);
        }
        self.publisher
            .publish_event(event)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// One named queue.
struct Queue {
    name: String,
    config: QueueConfig,
    messages: Mutex<Vec<QueuedMessage>>,
    processing: DashMap<Uuid, QueuedMessage>,
    paused: AtomicBool,
    limiter: Option<Mutex<TokenBucket>>,
    stats: parking_lot::RwLock<QueueStats>,
    wakeup: Notify,
}

/// In-flight completion waiter.
struct AckWaiter {
    ack_topic: Option<String>,
    saga_id: Option<Uuid>,
    tx: oneshot::Sender<Result<(), String>>,
}

/// The queue manager.
pub struct QueueManager {
    queues: DashMap<String, Arc<Queue>>,
    waiters: Arc<DashMap<Uuid, AckWaiter>>,
    dispatcher: parking_lot::RwLock<Option<Arc<dyn TaskDispatcher>>>,
    publisher: parking_lot::RwLock<Option<Arc<dyn MessagePublisher>>>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl QueueManager {
    /// Create a manager with the given queues. Dead letter queues referenced
    /// by configs are created automatically with a zero retry budget.
    pub fn new(queues: Vec<(String, QueueConfig)>) -> Arc<Self> {
        let manager = Arc::new(Self {
            queues: DashMap::new(),
            waiters: Arc::new(DashMap::new()),
            dispatcher: parking_lot::RwLock::new(None),
            publisher: parking_lot::RwLock::new(None),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        });

        for (name, config) in queues {
            manager.add_queue(&name, config);
        }
        manager
    }

    /// Create a manager with the built-in queue set.
    pub fn with_builtin_queues() -> Arc<Self> {
        Self::new(
            builtin_queues()
                .into_iter()
                .map(|(name, config)| (name.to_string(), config))
                .collect(),
        )
    }

    fn add_queue(&self, name: &str, config: QueueConfig) {
        if let Some(dlq_name) = config.dead_letter_queue.clone() {
            if !self.queues.contains_key(&dlq_name) {
                self.add_queue(
                    &dlq_name,
                    QueueConfig {
                        retry_attempts: 0,
                        dead_letter_queue: None,
                        rate_per_second: None,
                        rate_per_minute: None,
                        max_size: config.max_size,
                        ..Default::default()
                    },
                );
            }
        }
        let limiter = if config.rate_per_second.is_some() || config.rate_per_minute.is_some() {
            Some(Mutex::new(TokenBucket::new(
                config.rate_per_second,
                config.rate_per_minute,
            )))
        } else {
            None
        };
        let queue = Arc::new(Queue {
            name: name.to_string(),
            messages: Mutex::new(Vec::new()),
            processing: DashMap::new(),
            paused: AtomicBool::new(false),
            limiter,
            stats: parking_lot::RwLock::new(QueueStats::default()),
            wakeup: Notify::new(),
            config,
        });
        self.queues.insert(name.to_string(), queue);
    }

    /// Wire in the task dispatcher. Called by the startup wiring step.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn TaskDispatcher>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    /// Wire in the bus publisher for lifecycle signals.
    pub fn set_publisher(&self, publisher: Arc<dyn MessagePublisher>) {
        *self.publisher.write() = Some(publisher);
    }

    fn queue(&self, name: &str) -> QueueResult<Arc<Queue>> {
        self.queues
            .get(name)
            .map(|q| Arc::clone(&q))
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    // ========================================================================
    // Public contract
    // ========================================================================

    /// Enqueue a message. Fails with `QueueFull` when the queue is at
    /// capacity.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        msg_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> QueueResult<Uuid> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        let queue = self.queue(queue_name)?;
        let now = Utc::now();

        let message = QueuedMessage {
            id: Uuid::new_v4(),
            msg_type: msg_type.to_string(),
            payload,
            priority: options.priority.unwrap_or(queue.config.priority_class),
            enqueued_at: now,
            attempts: 0,
            max_attempts: queue.config.retry_attempts,
            error_history: Vec::new(),
            delay_until: options
                .delay
                .and_then(|d| ChronoDuration::from_std(d).ok())
                .map(|d| now + d),
            ttl_deadline: options
                .ttl
                .and_then(|d| ChronoDuration::from_std(d).ok())
                .map(|d| now + d),
            metadata: options.metadata,
            saga_id: options.saga_id,
            correlation_id: options.correlation_id,
            dead_lettered_at: None,
            original_queue: None,
        };
        let message_id = message.id;

        {
            let mut messages = queue.messages.lock().await;
            if messages.len() >= queue.config.max_size {
                return Err(QueueError::QueueFull {
                    queue: queue_name.to_string(),
                    capacity: queue.config.max_size,
                });
            }
            messages.push(message);
        }
        queue.stats.write().enqueued += 1;
        queue.wakeup.notify_one();

        self.emit_signal(
            topics::MESSAGE_ENQUEUED,
            serde_json::json!({
                "queue": queue_name,
                "message_id": message_id,
                "type": msg_type,
            }),
            options.saga_id,
            options.correlation_id,
        );
        debug!(queue = queue_name, message = %message_id, msg_type, "message enqueued");
        Ok(message_id)
    }

    /// Pause dispatch on a queue. Enqueues still succeed.
    pub fn pause(&self, queue_name: &str) -> QueueResult<()> {
        let queue = self.queue(queue_name)?;
        queue.paused.store(true, Ordering::SeqCst);
        self.emit_signal(
            topics::QUEUE_PAUSED,
            serde_json::json!({"queue": queue_name}),
            None,
            None,
        );
        info!(queue = queue_name, "queue paused");
        Ok(())
    }

    /// Resume a paused queue.
    pub fn resume(&self, queue_name: &str) -> QueueResult<()> {
        let queue = self.queue(queue_name)?;
        queue.paused.store(false, Ordering::SeqCst);
        queue.wakeup.notify_one();
        self.emit_signal(
            topics::QUEUE_RESUMED,
            serde_json::json!({"queue": queue_name}),
            None,
            None,
        );
        info!(queue = queue_name, "queue resumed");
        Ok(())
    }

    /// Drop all waiting messages from a queue. In-flight messages finish.
    pub async fn clear(&self, queue_name: &str) -> QueueResult<usize> {
        let queue = self.queue(queue_name)?;
        let cleared = {
            let mut messages = queue.messages.lock().await;
            let count = messages.len();
            messages.clear();
            count
        };
        self.emit_signal(
            topics::QUEUE_CLEARED,
            serde_json::json!({"queue": queue_name, "cleared": cleared}),
            None,
            None,
        );
        info!(queue = queue_name, cleared, "queue cleared");
        Ok(cleared)
    }

    /// Status snapshot for every queue.
    pub async fn statuses(&self) -> Vec<QueueStatus> {
        let mut statuses = Vec::new();
        for entry in self.queues.iter() {
            let queue = entry.value();
            let depth = queue.messages.lock().await.len();
            statuses.push(QueueStatus {
                name: queue.name.clone(),
                depth,
                processing: queue.processing.len(),
                paused: queue.paused.load(Ordering::SeqCst),
                stats: queue.stats.read().clone(),
            });
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Depth of one queue.
    pub async fn depth(&self, queue_name: &str) -> QueueResult<usize> {
        let queue = self.queue(queue_name)?;
        let len = queue.messages.lock().await.len();
        Ok(len)
    }

    /// Resolve an in-flight message directly.
    pub fn acknowledge(&self, message_id: Uuid, result: Result<(), String>) -> bool {
        match self.waiters.remove(&message_id) {
            Some((_, waiter)) => waiter.tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Resolve in-flight messages awaiting a completion event on `topic`
    /// for `saga_id`. Returns how many were completed.
    pub fn acknowledge_completion(&self, topic: &str, saga_id: Uuid) -> usize {
        let matching: Vec<Uuid> = self
            .waiters
            .iter()
            .filter(|w| {
                w.ack_topic.as_deref() == Some(topic) && w.saga_id == Some(saga_id)
            })
            .map(|w| *w.key())
            .collect();
        let count = matching.len();
        for id in matching {
            if let Some((_, waiter)) = self.waiters.remove(&id) {
                let _ = waiter.tx.send(Ok(()));
            }
        }
        count
    }

    /// Fail in-flight messages for a saga with an agent-reported error.
    pub fn fail_in_flight(&self, message_id: Uuid, error: String) -> bool {
        self.acknowledge(message_id, Err(error))
    }

    /// Bus-facing handler translating agent completion events into
    /// acknowledgements; subscribe it to the domain completion topics.
    pub fn ack_handler(self: &Arc<Self>) -> Arc<dyn EventHandler> {
        Arc::new(QueueAckHandler {
            manager: Arc::clone(self),
        })
    }

    // ========================================================================
    // Processor loop
    // ========================================================================

    fn spawn_processor(self: &Arc<Self>, queue: Arc<Queue>) {
        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                if queue.paused.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }

                // Rate limiter gates the whole tick.
                if let Some(limiter) = &queue.limiter {
                    if !limiter.lock().await.try_take() {
                        queue.stats.write().rate_limit_hits += 1;
                        tokio::time::sleep(Duration::from_millis(25)).await;
                        continue;
                    }
                }

                let batch = manager.select_batch(&queue).await;
                if batch.is_empty() {
                    tokio::select! {
                        _ = queue.wakeup.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        _ = shutdown.cancelled() => break,
                    }
                    continue;
                }

                for message in batch {
                    manager.spawn_execution(Arc::clone(&queue), message);
                }
            }
        });
    }

    /// Pull up to batch_size ready messages, best priority first, bounded by
    /// the queue's concurrency budget. Expired messages are discarded here.
    async fn select_batch(&self, queue: &Arc<Queue>) -> Vec<QueuedMessage> {
        let now = Utc::now();
        let slots = queue
            .config
            .concurrency
            .saturating_sub(queue.processing.len());
        if slots == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            return Vec::new();
        }

        let mut messages = queue.messages.lock().await;

        // TTL purge.
        let before = messages.len();
        messages.retain(|m| m.ttl_deadline.map_or(true, |deadline| deadline > now));
        let expired = before - messages.len();
        if expired > 0 {
            queue.stats.write().expired += expired as u64;
            debug!(queue = %queue.name, expired, "discarded expired messages");
        }

        let mut ready_indexes: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.delay_until.map_or(true, |until| until <= now))
            .map(|(i, _)| i)
            .collect();
        ready_indexes.sort_by_key(|&i| (messages[i].priority, messages[i].enqueued_at));
        ready_indexes.truncate(queue.config.batch_size.min(slots));

        // Remove from the back so earlier indexes stay valid.
        ready_indexes.sort_unstable_by(|a, b| b.cmp(a));
        let mut batch: Vec<QueuedMessage> =
            ready_indexes.into_iter().map(|i| messages.remove(i)).collect();
        // Restore dispatch order.
        batch.sort_by_key(|m| (m.priority, m.enqueued_at));
        batch
    }

    /// Run one message: register it as processing, dispatch, await the
    /// completion (when the task type has one), then settle the outcome.
    fn spawn_execution(self: &Arc<Self>, queue: Arc<Queue>, mut message: QueuedMessage) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let wait_ms = (Utc::now() - message.enqueued_at).num_milliseconds().max(0) as f64;
            message.attempts += 1;
            queue.processing.insert(message.id, message.clone());

            let ack_topic = message
                .metadata
                .get("ack_topic")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| completion_topic(&message.msg_type).map(str::to_string));

            let completion_rx = if ack_topic.is_some() {
                let (tx, rx) = oneshot::channel();
                manager.waiters.insert(
                    message.id,
                    AckWaiter {
                        ack_topic: ack_topic.clone(),
                        saga_id: message.saga_id,
                        tx,
                    },
                );
                Some(rx)
            } else {
                None
            };

            let dispatcher = manager.dispatcher.read().clone();
            let dispatch_result = match dispatcher {
                Some(dispatcher) => dispatcher.dispatch(&queue.name, &message).await,
                None => Ok(()),
            };

            let outcome = match (dispatch_result, completion_rx) {
                (Err(e), _) => {
                    manager.waiters.remove(&message.id);
                    Err(e)
                }
                (Ok(()), None) => Ok(()),
                (Ok(()), Some(rx)) => {
                    let timeout = Duration::from_millis(queue.config.processing_timeout_ms);
                    match tokio::time::timeout(timeout, rx).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err("completion channel dropped".to_string()),
                        Err(_) => {
                            manager.waiters.remove(&message.id);
                            Err(format!(
                                "processing timed out after {}ms",
                                queue.config.processing_timeout_ms
                            ))
                        }
                    }
                }
            };

            queue.processing.remove(&message.id);
            {
                let mut stats = queue.stats.write();
                stats.avg_wait_ms = ema(stats.avg_wait_ms, wait_ms);
            }

            match outcome {
                Ok(()) => {
                    let elapsed = started.elapsed().as_millis() as f64;
                    {
                        let mut stats = queue.stats.write();
                        stats.processed += 1;
                        stats.avg_processing_ms = ema(stats.avg_processing_ms, elapsed);
                    }
                    manager.emit_signal(
                        topics::MESSAGE_PROCESSED,
                        serde_json::json!({
                            "queue": queue.name,
                            "message_id": message.id,
                            "attempts": message.attempts,
                        }),
                        message.saga_id,
                        message.correlation_id,
                    );
                }
                Err(error) => {
                    message.error_history.push(MessageError {
                        error: error.clone(),
                        at: Utc::now(),
                    });
                    queue.stats.write().failed_attempts += 1;

                    if message.attempts < message.max_attempts {
                        message.delay_until = Some(
                            Utc::now()
                                + ChronoDuration::milliseconds(
                                    queue.config.retry_delay_ms as i64,
                                ),
                        );
                        queue.stats.write().retries_scheduled += 1;
                        manager.emit_signal(
                            topics::MESSAGE_RETRY_SCHEDULED,
                            serde_json::json!({
                                "queue": queue.name,
                                "message_id": message.id,
                                "attempt": message.attempts,
                                "error": error,
                            }),
                            message.saga_id,
                            message.correlation_id,
                        );
                        debug!(
                            queue = %queue.name,
                            message = %message.id,
                            attempt = message.attempts,
                            "retry scheduled"
                        );
                        queue.messages.lock().await.push(message);
                        queue.wakeup.notify_one();
                    } else {
                        manager.move_to_dlq(&queue, message, error).await;
                    }
                }
            }
        });
    }

    /// Terminal move into the configured dead letter queue.
    async fn move_to_dlq(&self, queue: &Arc<Queue>, mut message: QueuedMessage, error: String) {
        message.dead_lettered_at = Some(Utc::now());
        message.original_queue = Some(queue.name.clone());
        queue.stats.write().dead_lettered += 1;

        let saga_id = message.saga_id;
        let correlation_id = message.correlation_id;
        let message_id = message.id;

        match &queue.config.dead_letter_queue {
            Some(dlq_name) => match self.queue(dlq_name) {
                Ok(dlq) => {
                    let mut messages = dlq.messages.lock().await;
                    if messages.len() >= dlq.config.max_size {
                        warn!(queue = %queue.name, dlq = %dlq_name, "dead letter queue full, dropping message");
                    } else {
                        messages.push(message);
                    }
                }
                Err(_) => {
                    warn!(queue = %queue.name, dlq = %dlq_name, "configured dead letter queue missing");
                }
            },
            None => {
                warn!(queue = %queue.name, message = %message_id, "no dead letter queue configured, dropping message");
            }
        }

        self.emit_signal(
            topics::MESSAGE_DEAD_LETTERED,
            serde_json::json!({
                "queue": queue.name,
                "message_id": message_id,
                "error": error,
            }),
            saga_id,
            correlation_id,
        );
        warn!(queue = %queue.name, message = %message_id, error = %error, "message dead-lettered");
    }

    /// Inspect a dead letter queue's contents.
    pub async fn dead_letters(&self, dlq_name: &str) -> QueueResult<Vec<QueuedMessage>> {
        let queue = self.queue(dlq_name)?;
        let messages = queue.messages.lock().await.clone();
        Ok(messages)
    }

    // ========================================================================
    // Health monitoring
    // ========================================================================

    fn spawn_health_monitor(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.health_pass().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    async fn health_pass(&self) {
        let queues: Vec<Arc<Queue>> = self.queues.iter().map(|q| Arc::clone(&q)).collect();
        for queue in queues {
            let depth = queue.messages.lock().await.len();
            let stats = queue.stats.read().clone();
            let mut warnings = Vec::new();

            let utilization = depth as f64 / queue.config.max_size as f64;
            if utilization > 0.8 {
                warnings.push(format!("utilization {:.0}%", utilization * 100.0));
            }
            if stats.avg_wait_ms > queue.config.processing_timeout_ms as f64 * 0.5 {
                warnings.push(format!("average wait {:.0}ms", stats.avg_wait_ms));
            }
            let attempts = stats.processed + stats.failed_attempts;
            if attempts > 0 {
                let error_rate = stats.failed_attempts as f64 / attempts as f64;
                if error_rate > 0.10 {
                    warnings.push(format!("error rate {:.0}%", error_rate * 100.0));
                }
            }

            if !warnings.is_empty() {
                warn!(queue = %queue.name, warnings = ?warnings, "queue health warning");
                self.emit_signal(
                    topics::QUEUE_HEALTH_WARNING,
                    serde_json::json!({
                        "queue": queue.name,
                        "warnings": warnings,
                        "depth": depth,
                    }),
                    None,
                    None,
                );
            }
        }
    }

    fn emit_signal(
        &self,
        topic: &'static str,
        detail: serde_json::Value,
        saga_id: Option<Uuid>,
        correlation_id: Option<Uuid>,
    ) {
        let Some(publisher) = self.publisher.read().clone() else {
            return;
        };
        let mut event = Event::new(topic, EventData::Signal { detail }).with_source("queue-manager");
        if let Some(saga_id) = saga_id {
            event = event.with_saga(saga_id);
        }
        if let Some(correlation_id) = correlation_id {
            event = event.with_correlation(correlation_id);
        }
        tokio::spawn(async move {
            let _ = publisher.publish_event(event).await;
        });
    }
}

#[async_trait]
impl Lifecycle for Arc<QueueManager> {
    fn name(&self) -> &str {
        "queue-manager"
    }

    async fn start(&self) -> Result<(), String> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let queues: Vec<Arc<Queue>> = self.queues.iter().map(|q| Arc::clone(&q)).collect();
        for queue in queues {
            self.spawn_processor(queue);
        }
        self.spawn_health_monitor();
        info!(queues = self.queues.len(), "queue manager started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.shutdown.cancel();
        info!("queue manager shut down");
        Ok(())
    }
}

/// Resolves in-flight messages when their agents publish completion (or
/// failure) events.
struct QueueAckHandler {
    manager: Arc<QueueManager>,
}

#[async_trait]
impl EventHandler for QueueAckHandler {
    async fn handle(&self, event: Event) -> Result<(), String> {
        match &event.data {
            EventData::TaskFailed {
                message_id, error, ..
            } => {
                self.manager.fail_in_flight(*message_id, error.clone());
            }
            EventData::TaskCompleted { message_id, .. } => {
                self.manager.acknowledge(*message_id, Ok(()));
            }
            _ => {
                if let Some(saga_id) = event.saga_id {
                    self.manager
                        .acknowledge_completion(&event.event_type, saga_id);
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "queue-ack"
    }
}

fn ema(current: f64, sample: f64) -> f64 {
    if current == 0.0 {
        sample
    } else {
        EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Dispatcher that records dispatch order and fails on demand.
    struct ScriptedDispatcher {
        dispatched: parking_lot::Mutex<Vec<(String, String, Uuid)>>,
        failures: parking_lot::Mutex<HashMap<String, u32>>,
    }

    impl ScriptedDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dispatched: parking_lot::Mutex::new(Vec::new()),
                failures: parking_lot::Mutex::new(HashMap::new()),
            })
        }

        fn fail_type(self: &Arc<Self>, msg_type: &str, times: u32) {
            self.failures.lock().insert(msg_type.to_string(), times);
        }
    }

    #[async_trait]
    impl TaskDispatcher for ScriptedDispatcher {
        async fn dispatch(&self, queue: &str, message: &QueuedMessage) -> Result<(), String> {
            self.dispatched
                .lock()
                .push((queue.to_string(), message.msg_type.clone(), message.id));
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&message.msg_type) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err("agent failure".to_string());
                }
            }
            Ok(())
        }
    }

    fn test_queue(config: QueueConfig) -> Arc<QueueManager> {
        QueueManager::new(vec![("work".to_string(), config)])
    }

    async fn start(manager: &Arc<QueueManager>) {
        Lifecycle::start(manager).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_and_process() {
        let manager = test_queue(QueueConfig::default());
        let dispatcher = ScriptedDispatcher::new();
        manager.set_dispatcher(dispatcher.clone());
        start(&manager).await;

        manager
            .enqueue("work", "notify", json!({"n": 1}), EnqueueOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(dispatcher.dispatched.lock().len(), 1);
        let statuses = manager.statuses().await;
        let work = statuses.iter().find(|s| s.name == "work").unwrap();
        assert_eq!(work.stats.processed, 1);
        assert_eq!(work.depth, 0);
        assert_eq!(work.processing, 0);
    }

    #[tokio::test]
    async fn test_queue_full_boundary() {
        let manager = test_queue(QueueConfig {
            max_size: 2,
            ..Default::default()
        });
        // Not started: messages stay queued.
        manager
            .enqueue("work", "t", json!(1), EnqueueOptions::default())
            .await
            .unwrap();
        manager
            .enqueue("work", "t", json!(2), EnqueueOptions::default())
            .await
            .unwrap();
        let result = manager
            .enqueue("work", "t", json!(3), EnqueueOptions::default())
            .await;
        assert!(matches!(result, Err(QueueError::QueueFull { .. })));
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_ties() {
        let manager = test_queue(QueueConfig {
            batch_size: 10,
            concurrency: 1,
            ..Default::default()
        });
        let dispatcher = ScriptedDispatcher::new();
        manager.set_dispatcher(dispatcher.clone());

        let low = manager
            .enqueue(
                "work",
                "low-task",
                json!(1),
                EnqueueOptions {
                    priority: Some(MessagePriority::Low),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let critical = manager
            .enqueue(
                "work",
                "critical-task",
                json!(2),
                EnqueueOptions {
                    priority: Some(MessagePriority::Critical),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let medium_a = manager
            .enqueue("work", "medium-a", json!(3), EnqueueOptions::default())
            .await
            .unwrap();
        let medium_b = manager
            .enqueue("work", "medium-b", json!(4), EnqueueOptions::default())
            .await
            .unwrap();

        start(&manager).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let order: Vec<Uuid> = dispatcher.dispatched.lock().iter().map(|d| d.2).collect();
        assert_eq!(order, vec![critical, medium_a, medium_b, low]);
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let manager = QueueManager::new(vec![(
            "validation-tasks".to_string(),
            QueueConfig {
                retry_attempts: 2,
                retry_delay_ms: 20,
                dead_letter_queue: Some("validation-tasks-dlq".to_string()),
                ..Default::default()
            },
        )]);
        let dispatcher = ScriptedDispatcher::new();
        dispatcher.fail_type("validation", 3);
        manager.set_dispatcher(dispatcher.clone());
        start(&manager).await;

        let id = manager
            .enqueue(
                "validation-tasks",
                "validation",
                json!({"candidate": 7}),
                EnqueueOptions {
                    saga_id: Some(Uuid::new_v4()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;

        let dead = manager.dead_letters("validation-tasks-dlq").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].error_history.len(), 2);
        assert_eq!(dead[0].original_queue.as_deref(), Some("validation-tasks"));
        assert!(dead[0].dead_lettered_at.is_some());

        let statuses = manager.statuses().await;
        let vt = statuses.iter().find(|s| s.name == "validation-tasks").unwrap();
        assert_eq!(vt.stats.dead_lettered, 1);
        assert_eq!(vt.stats.retries_scheduled, 1);
    }

    #[tokio::test]
    async fn test_ttl_discard_before_dispatch() {
        let manager = test_queue(QueueConfig::default());
        let dispatcher = ScriptedDispatcher::new();
        manager.set_dispatcher(dispatcher.clone());

        manager
            .enqueue(
                "work",
                "stale",
                json!(1),
                EnqueueOptions {
                    ttl: Some(Duration::from_millis(20)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        start(&manager).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(dispatcher.dispatched.lock().is_empty());
        let statuses = manager.statuses().await;
        assert_eq!(statuses[0].stats.expired, 1);
    }

    #[tokio::test]
    async fn test_delay_until_defers_dispatch() {
        let manager = test_queue(QueueConfig::default());
        let dispatcher = ScriptedDispatcher::new();
        manager.set_dispatcher(dispatcher.clone());
        start(&manager).await;

        manager
            .enqueue(
                "work",
                "later",
                json!(1),
                EnqueueOptions {
                    delay: Some(Duration::from_millis(150)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(dispatcher.dispatched.lock().is_empty());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(dispatcher.dispatched.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let manager = test_queue(QueueConfig::default());
        let dispatcher = ScriptedDispatcher::new();
        manager.set_dispatcher(dispatcher.clone());
        start(&manager).await;

        manager.pause("work").unwrap();
        manager
            .enqueue("work", "t", json!(1), EnqueueOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(dispatcher.dispatched.lock().is_empty());

        manager.resume("work").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dispatcher.dispatched.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_hits_counted() {
        let manager = test_queue(QueueConfig {
            rate_per_second: Some(1),
            batch_size: 1,
            ..Default::default()
        });
        let dispatcher = ScriptedDispatcher::new();
        manager.set_dispatcher(dispatcher.clone());
        start(&manager).await;

        for i in 0..5 {
            manager
                .enqueue("work", "t", json!(i), EnqueueOptions::default())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        // One token available at startup; the rest wait on refill.
        assert!(dispatcher.dispatched.lock().len() <= 2);
        let statuses = manager.statuses().await;
        assert!(statuses[0].stats.rate_limit_hits > 0);
    }

    #[tokio::test]
    async fn test_completion_waits_for_acknowledge() {
        let manager = test_queue(QueueConfig {
            processing_timeout_ms: 2_000,
            ..Default::default()
        });
        let dispatcher = ScriptedDispatcher::new();
        manager.set_dispatcher(dispatcher.clone());
        start(&manager).await;

        let saga = Uuid::new_v4();
        manager
            .enqueue(
                "work",
                "candidate-generation",
                json!({}),
                EnqueueOptions {
                    saga_id: Some(saga),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Dispatched but still in flight, awaiting the agent's event.
        assert_eq!(dispatcher.dispatched.lock().len(), 1);
        let statuses = manager.statuses().await;
        assert_eq!(statuses.iter().find(|s| s.name == "work").unwrap().processing, 1);

        assert_eq!(manager.acknowledge_completion(topics::CANDIDATES, saga), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let statuses = manager.statuses().await;
        let work = statuses.iter().find(|s| s.name == "work").unwrap();
        assert_eq!(work.processing, 0);
        assert_eq!(work.stats.processed, 1);
    }

    #[tokio::test]
    async fn test_processing_timeout_retries() {
        let manager = test_queue(QueueConfig {
            processing_timeout_ms: 60,
            retry_attempts: 1,
            retry_delay_ms: 10,
            dead_letter_queue: Some("work-dlq".to_string()),
            ..Default::default()
        });
        let dispatcher = ScriptedDispatcher::new();
        manager.set_dispatcher(dispatcher.clone());
        start(&manager).await;

        // Completion never arrives; the waiter times out and the single
        // attempt budget sends it straight to the DLQ.
        manager
            .enqueue(
                "work",
                "candidate-generation",
                json!({}),
                EnqueueOptions {
                    saga_id: Some(Uuid::new_v4()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let dead = manager.dead_letters("work-dlq").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error_history[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_clear_drops_waiting_messages() {
        let manager = test_queue(QueueConfig::default());
        for i in 0..4 {
            manager
                .enqueue("work", "t", json!(i), EnqueueOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(manager.clear("work").await.unwrap(), 4);
        assert_eq!(manager.depth("work").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_builtin_queues_include_spec_set() {
        let manager = QueueManager::with_builtin_queues();
        for name in [
            "search-requests",
            "candidate-generation",
            "validation-tasks",
            "ranking-tasks",
            "selection-tasks",
            "enrichment-tasks",
            "output-generation",
            "booking-requests",
            "notifications",
            "telemetry-events",
            "validation-tasks-dlq",
        ] {
            assert!(manager.queue(name).is_ok(), "missing queue {}", name);
        }
        // DLQs never retry and have no DLQ of their own.
        let dlq = manager.queue("booking-requests-dlq").unwrap();
        assert_eq!(dlq.config.retry_attempts, 0);
        assert!(dlq.config.dead_letter_queue.is_none());
    }

    #[test]
    fn test_token_bucket_refill() {
        let mut bucket = TokenBucket::new(Some(2), None);
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
        std::thread::sleep(Duration::from_millis(600));
        assert!(bucket.try_take());
    }

    #[test]
    fn test_token_bucket_minute_window() {
        let mut bucket = TokenBucket::new(None, Some(1));
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
    }
}
