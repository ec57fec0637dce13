/// Topic-addressed event bus for inter-holon communication.
///
/// Delivery is at-least-once. Each subscriber of a topic gets the event on a
/// serialized dispatch lane keyed by (subscription, saga), which carries the
/// FIFO-per-saga ordering guarantee: deliveries to different subscribers and
/// different sagas run concurrently, deliveries for one saga to one
/// subscriber never reorder. Failed handlers are retried with exponential
/// backoff plus jitter, then routed to the dead letter queue.
use crate::errors::{BusError, BusResult};
use crate::events::{topics, Event, EventData};
use crate::traits::{EventHandler, Lifecycle, MessagePublisher, MessageSubscriber};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lane key for events without a saga id.
const NO_SAGA: Uuid = Uuid::nil();

/// Configuration for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Require saga_id + correlation_id on every published event
    #[serde(default)]
    pub require_correlation: bool,
    /// Delivery retry attempts after the initial failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Bounded history ring capacity
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Dead letter queue capacity
    #[serde(default = "default_dlq_capacity")]
    pub dlq_capacity: usize,
    /// Per-(subscription, saga) lane depth before events drop to the DLQ
    #[serde(default = "default_lane_high_water")]
    pub lane_high_water: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    50
}

fn default_history_capacity() -> usize {
    1000
}

fn default_dlq_capacity() -> usize {
    1000
}

fn default_lane_high_water() -> usize {
    256
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            require_correlation: false,
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            history_capacity: default_history_capacity(),
            dlq_capacity: default_dlq_capacity(),
            lane_high_water: default_lane_high_water(),
        }
    }
}

/// A registered subscription.
struct Subscription {
    topic: String,
    handler: Arc<dyn EventHandler>,
    retry: bool,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Event that exhausted all delivery retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetteredEvent {
    pub original: Event,
    pub subscription_id: Uuid,
    pub handler_name: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    /// Dead-letter routing is terminal; records leave only via explicit ack
    pub requires_manual_ack: bool,
}

/// Filter for history queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub saga_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// Counters exposed by the bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed_deliveries: u64,
    pub dead_lettered: u64,
    pub dropped_to_dlq: u64,
    pub dlq_rejected: u64,
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed_deliveries: AtomicU64,
    dead_lettered: AtomicU64,
    dropped_to_dlq: AtomicU64,
    dlq_rejected: AtomicU64,
}

/// Serialized dispatch lane for one (subscription, saga) pair.
struct Lane {
    tx: mpsc::Sender<Event>,
}

/// Topic registry entry.
#[derive(Default)]
struct TopicEntry {
    subscribers: Vec<Uuid>,
    published: u64,
}

/// The event bus.
pub struct EventBus {
    config: EventBusConfig,
    topics: DashMap<String, TopicEntry>,
    subscriptions: DashMap<Uuid, Arc<Subscription>>,
    lanes: DashMap<(Uuid, Uuid), Lane>,
    history: parking_lot::RwLock<VecDeque<Event>>,
    dlq: Mutex<VecDeque<DeadLetteredEvent>>,
    counters: BusCounters,
    shutdown: CancellationToken,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new(config: EventBusConfig) -> Arc<Self> {
        Arc::new(Self {
            history: parking_lot::RwLock::new(VecDeque::with_capacity(config.history_capacity)),
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            lanes: DashMap::new(),
            dlq: Mutex::new(VecDeque::new()),
            counters: BusCounters::default(),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    /// Subscribe a handler to a topic. Unknown topics are auto-created.
    pub fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        retry: bool,
    ) -> BusResult<Uuid> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::ShutDown);
        }
        let id = Uuid::new_v4();
        if !self.topics.contains_key(topic) {
            warn!(topic, "subscribing to unknown topic, auto-creating");
        }
        let subscription = Arc::new(Subscription {
            topic: topic.to_string(),
            handler,
            retry,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        self.subscriptions.insert(id, subscription);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .push(id);
        debug!(topic, subscription = %id, "subscribed");
        Ok(id)
    }

    /// Remove a subscription and tear down its dispatch lanes.
    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        let Some((_, subscription)) = self.subscriptions.remove(&subscription_id) else {
            return false;
        };
        if let Some(mut entry) = self.topics.get_mut(&subscription.topic) {
            entry.subscribers.retain(|s| *s != subscription_id);
        }
        self.lanes.retain(|(sub, _), _| *sub != subscription_id);
        debug!(subscription = %subscription_id, topic = %subscription.topic, "unsubscribed");
        true
    }

    /// Publish an event. Validates the schema, appends to the history ring,
    /// then fans out to every subscriber's dispatch lane.
    pub async fn publish(self: &Arc<Self>, event: Event) -> BusResult<Uuid> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::ShutDown);
        }
        event.validate_schema(self.config.require_correlation)?;

        let event_id = event.id;
        let topic = event.event_type.clone();

        {
            let mut history = self.history.write();
            if history.len() >= self.config.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let subscriber_ids: Vec<Uuid> = {
            let mut entry = self.topics.entry(topic.clone()).or_insert_with(|| {
                warn!(topic = %topic, "publishing to unknown topic, auto-creating");
                TopicEntry::default()
            });
            entry.published += 1;
            entry.subscribers.clone()
        };

        self.counters.published.fetch_add(1, Ordering::Relaxed);

        for subscriber_id in subscriber_ids {
            self.dispatch(subscriber_id, event.clone()).await;
        }

        Ok(event_id)
    }

    /// Route an event onto the subscriber's FIFO lane for its saga.
    async fn dispatch(self: &Arc<Self>, subscription_id: Uuid, event: Event) {
        let saga_lane = event.saga_id.unwrap_or(NO_SAGA);
        let key = (subscription_id, saga_lane);

        let tx = match self.lanes.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().tx.clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel::<Event>(self.config.lane_high_water);
                entry.insert(Lane { tx: tx.clone() });
                self.spawn_lane_worker(subscription_id, rx);
                tx
            }
        };

        // A full lane means the subscriber cannot keep up for this saga;
        // drop to the DLQ instead of buffering without bound.
        if let Err(err) = tx.try_send(event) {
            let event = match err {
                mpsc::error::TrySendError::Full(e) | mpsc::error::TrySendError::Closed(e) => e,
            };
            self.counters.dropped_to_dlq.fetch_add(1, Ordering::Relaxed);
            warn!(
                subscription = %subscription_id,
                saga = %saga_lane,
                "dispatch lane over high-water mark, dropping event to DLQ"
            );
            self.push_dead_letter(event, subscription_id, "lane high-water exceeded".to_string())
                .await;
        }
    }

    /// Spawn the worker that drains one lane in order.
    fn spawn_lane_worker(self: &Arc<Self>, subscription_id: Uuid, mut rx: mpsc::Receiver<Event>) {
        let bus = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_event = rx.recv() => {
                        let Some(event) = maybe_event else { break };
                        bus.deliver_with_retry(subscription_id, event).await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Deliver one event to one subscription, applying the retry policy.
    async fn deliver_with_retry(self: &Arc<Self>, subscription_id: Uuid, event: Event) {
        let Some(subscription) = self.subscriptions.get(&subscription_id).map(|s| Arc::clone(&s))
        else {
            // Unsubscribed while the event was queued.
            return;
        };

        let max_attempts = if subscription.retry {
            1 + self.config.max_retries
        } else {
            1
        };

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match subscription.handler.handle(event.clone()).await {
                Ok(()) => {
                    subscription.delivered.fetch_add(1, Ordering::Relaxed);
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    subscription.failed.fetch_add(1, Ordering::Relaxed);
                    self.counters.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                    last_error = e;
                    debug!(
                        subscription = %subscription_id,
                        event = %event.id,
                        attempt,
                        error = %last_error,
                        "handler failed"
                    );
                    if attempt < max_attempts {
                        let backoff = self.config.retry_base_ms * (1u64 << (attempt - 1));
                        let jitter = rand::thread_rng().gen_range(0..100);
                        tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                    }
                }
            }
        }

        self.push_dead_letter(event, subscription_id, last_error).await;
    }

    /// Record a dead-lettered event and announce it on the internal channel.
    async fn push_dead_letter(self: &Arc<Self>, event: Event, subscription_id: Uuid, error: String) {
        let handler_name = self
            .subscriptions
            .get(&subscription_id)
            .map(|s| s.handler.name().to_string())
            .unwrap_or_else(|| "<unsubscribed>".to_string());

        let record = DeadLetteredEvent {
            original: event.clone(),
            subscription_id,
            handler_name,
            error: error.clone(),
            timestamp: Utc::now(),
            requires_manual_ack: true,
        };

        {
            let mut dlq = self.dlq.lock().await;
            if dlq.len() >= self.config.dlq_capacity {
                self.counters.dlq_rejected.fetch_add(1, Ordering::Relaxed);
                error!(
                    subscription = %subscription_id,
                    event = %event.id,
                    "event bus DLQ overflow, record rejected"
                );
                return;
            }
            dlq.push_back(record);
        }
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);

        // Announce on the reserved channel, except for dead-lettered
        // announcements themselves (no recursion).
        if event.event_type != topics::DLQ_MESSAGE {
            let mut announcement = Event::new(
                topics::DLQ_MESSAGE,
                EventData::Signal {
                    detail: serde_json::json!({
                        "event_id": event.id,
                        "subscription_id": subscription_id,
                        "error": error,
                    }),
                },
            )
            .with_source("event-bus");
            if let Some(saga_id) = event.saga_id {
                announcement = announcement.with_saga(saga_id);
            }
            if let Some(correlation_id) = event.correlation_id {
                announcement = announcement.with_correlation(correlation_id);
            }
            self.publish_detached(announcement);
        }
    }

    /// Publish from a fresh task. Keeps delivery-path futures from
    /// containing the publish future itself.
    fn publish_detached(self: &Arc<Self>, event: Event) {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = bus.publish(event).await {
                error!(error = %e, "failed to publish detached event");
            }
        });
    }

    /// Query recent events, newest last, capped at 100.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<Event> {
        let history = self.history.read();
        let mut matched: Vec<Event> = history
            .iter()
            .filter(|e| {
                filter.saga_id.map_or(true, |s| e.saga_id == Some(s))
                    && filter
                        .event_type
                        .as_ref()
                        .map_or(true, |t| &e.event_type == t)
                    && filter.since.map_or(true, |since| e.timestamp >= since)
            })
            .cloned()
            .collect();
        if matched.len() > 100 {
            matched.drain(..matched.len() - 100);
        }
        matched
    }

    /// Current dead letter queue contents.
    pub async fn dead_letters(&self) -> Vec<DeadLetteredEvent> {
        self.dlq.lock().await.iter().cloned().collect()
    }

    /// Acknowledge (remove) a dead-lettered event by original event id and
    /// subscription. Returns false when no such record exists.
    pub async fn ack_dead_letter(&self, event_id: Uuid, subscription_id: Uuid) -> bool {
        let mut dlq = self.dlq.lock().await;
        let before = dlq.len();
        dlq.retain(|d| !(d.original.id == event_id && d.subscription_id == subscription_id));
        before != dlq.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed_deliveries: self.counters.failed_deliveries.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            dropped_to_dlq: self.counters.dropped_to_dlq.load(Ordering::Relaxed),
            dlq_rejected: self.counters.dlq_rejected.load(Ordering::Relaxed),
        }
    }

    /// Number of subscribers currently registered on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    /// Wait until every dispatch lane is drained. Test helper; production
    /// shutdown uses the cancellation token.
    pub async fn quiesce(&self) {
        loop {
            let busy = self
                .lanes
                .iter()
                .any(|lane| lane.tx.capacity() < self.config.lane_high_water);
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Lifecycle for EventBus {
    fn name(&self) -> &str {
        "event-bus"
    }

    async fn start(&self) -> Result<(), String> {
        info!("event bus started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.shutdown.cancel();
        self.lanes.clear();
        info!("event bus shut down");
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for Arc<EventBus> {
    async fn publish_event(&self, event: Event) -> BusResult<Uuid> {
        self.publish(event).await
    }
}

#[async_trait]
impl MessageSubscriber for Arc<EventBus> {
    async fn subscribe_topic(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        retry: bool,
    ) -> BusResult<Uuid> {
        self.subscribe(topic, handler, retry)
    }

    async fn unsubscribe_topic(&self, subscription_id: Uuid) -> BusResult<bool> {
        Ok(self.unsubscribe(subscription_id))
    }
}
