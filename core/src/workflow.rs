/// Saga orchestrator driving named state machines over bus events.
///
/// An INTENT event creates a saga from a template; each state's entry action
/// enqueues the matching agent task and the agent's completion event (looked
/// up by saga id) advances the machine. Transitions not listed in the
/// template fail the saga. Per-state timers retry the entry action until the
/// retry budget is spent, then fail the saga with a state timeout.
use crate::errors::{WorkflowError, WorkflowResult};
use crate::events::{topics, Event, EventData};
use crate::policy::PolicyEngine;
use crate::queue_manager::{EnqueueOptions, QueueManager};
use crate::traits::{EventHandler, Lifecycle, MessagePublisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Smoothing factor for the global saga duration average.
const EMA_ALPHA: f64 = 0.2;

/// Saga state names.
pub mod states {
    pub const ADMIT: &str = "ADMIT";
    pub const ANALYZE: &str = "ANALYZE";
    pub const GEN: &str = "GEN";
    pub const VERIFY: &str = "VERIFY";
    pub const RANK: &str = "RANK";
    pub const SELECT: &str = "SELECT";
    pub const ENRICH: &str = "ENRICH";
    pub const BUILD: &str = "BUILD";
    pub const FINAL_VERIFY: &str = "FINAL_VERIFY";
    pub const PACKAGE: &str = "PACKAGE";
    pub const DONE: &str = "DONE";
}

/// What entering a state does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateAction {
    /// No agent work; move straight to the primary next state
    AdvanceImmediately,
    /// Hand a task to an agent and await its completion event
    EnqueueTask {
        queue: &'static str,
        task_type: &'static str,
    },
    /// Terminal state; finish the saga
    Complete,
}

/// A named saga template: ordered states, allowed transitions, timeouts.
#[derive(Debug, Clone)]
pub struct SagaTemplate {
    pub name: String,
    pub states: Vec<&'static str>,
    pub transitions: HashMap<&'static str, Vec<&'static str>>,
    pub timeouts: HashMap<&'static str, Duration>,
    pub actions: HashMap<&'static str, StateAction>,
}

impl SagaTemplate {
    pub fn initial_state(&self) -> &'static str {
        self.states[0]
    }

    /// Whether `from -> to` is listed in the transition table.
    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.transitions
            .get(from)
            .map_or(false, |targets| targets.iter().any(|t| *t == to))
    }

    /// Primary (first listed) successor of a state.
    pub fn primary_next(&self, from: &str) -> Option<&'static str> {
        self.transitions.get(from).and_then(|t| t.first().copied())
    }

    /// Fallback (second listed) successor of a state.
    pub fn fallback_next(&self, from: &str) -> Option<&'static str> {
        self.transitions.get(from).and_then(|t| t.get(1).copied())
    }

    fn timeout_for(&self, state: &str) -> Duration {
        self.timeouts
            .get(state)
            .copied()
            .unwrap_or(Duration::from_secs(30))
    }

    fn action_for(&self, state: &str) -> StateAction {
        self.actions
            .get(state)
            .cloned()
            .unwrap_or(StateAction::AdvanceImmediately)
    }
}

fn shared_pipeline(
    transitions: &mut HashMap<&'static str, Vec<&'static str>>,
    actions: &mut HashMap<&'static str, StateAction>,
    timeouts: &mut HashMap<&'static str, Duration>,
) {
    use states::*;

    transitions.insert(GEN, vec![VERIFY]);
    transitions.insert(VERIFY, vec![RANK, GEN]);
    transitions.insert(RANK, vec![SELECT]);
    transitions.insert(SELECT, vec![ENRICH]);
    transitions.insert(ENRICH, vec![BUILD]);
    transitions.insert(BUILD, vec![FINAL_VERIFY]);
    transitions.insert(FINAL_VERIFY, vec![PACKAGE, BUILD]);
    transitions.insert(PACKAGE, vec![DONE]);
    transitions.insert(DONE, vec![]);

    actions.insert(
        GEN,
        StateAction::EnqueueTask {
            queue: "candidate-generation",
            task_type: "candidate-generation",
        },
    );
    actions.insert(
        VERIFY,
        StateAction::EnqueueTask {
            queue: "validation-tasks",
            task_type: "validation",
        },
    );
    actions.insert(
        RANK,
        StateAction::EnqueueTask {
            queue: "ranking-tasks",
            task_type: "ranking",
        },
    );
    actions.insert(
        SELECT,
        StateAction::EnqueueTask {
            queue: "selection-tasks",
            task_type: "selection",
        },
    );
    actions.insert(
        ENRICH,
        StateAction::EnqueueTask {
            queue: "enrichment-tasks",
            task_type: "enrichment",
        },
    );
    actions.insert(
        BUILD,
        StateAction::EnqueueTask {
            queue: "output-generation",
            task_type: "itinerary-build",
        },
    );
    actions.insert(
        FINAL_VERIFY,
        StateAction::EnqueueTask {
            queue: "validation-tasks",
            task_type: "validation",
        },
    );
    actions.insert(
        PACKAGE,
        StateAction::EnqueueTask {
            queue: "output-generation",
            task_type: "output-generation",
        },
    );
    actions.insert(DONE, StateAction::Complete);

    timeouts.insert(GEN, Duration::from_secs(45));
    timeouts.insert(VERIFY, Duration::from_secs(30));
    timeouts.insert(RANK, Duration::from_secs(30));
    timeouts.insert(SELECT, Duration::from_secs(30));
    timeouts.insert(ENRICH, Duration::from_secs(45));
    timeouts.insert(BUILD, Duration::from_secs(60));
    timeouts.insert(FINAL_VERIFY, Duration::from_secs(30));
    timeouts.insert(PACKAGE, Duration::from_secs(30));
}

/// The CREATE saga: fresh travel-planning runs.
pub fn create_template() -> SagaTemplate {
    use states::*;
    let mut transitions = HashMap::new();
    let mut actions = HashMap::new();
    let mut timeouts = HashMap::new();

    transitions.insert(ADMIT, vec![GEN]);
    actions.insert(ADMIT, StateAction::AdvanceImmediately);
    timeouts.insert(ADMIT, Duration::from_secs(5));
    shared_pipeline(&mut transitions, &mut actions, &mut timeouts);

    SagaTemplate {
        name: "CREATE".to_string(),
        states: vec![
            ADMIT, GEN, VERIFY, RANK, SELECT, ENRICH, BUILD, FINAL_VERIFY, PACKAGE, DONE,
        ],
        transitions,
        timeouts,
        actions,
    }
}

/// The REVISE saga: revision runs against an existing itinerary. The
/// ANALYZE step folds the requested changes into the saga payload inline
/// before regeneration.
pub fn revise_template() -> SagaTemplate {
    use states::*;
    let mut transitions = HashMap::new();
    let mut actions = HashMap::new();
    let mut timeouts = HashMap::new();

    transitions.insert(ADMIT, vec![ANALYZE]);
    transitions.insert(ANALYZE, vec![GEN]);
    actions.insert(ADMIT, StateAction::AdvanceImmediately);
    actions.insert(ANALYZE, StateAction::AdvanceImmediately);
    timeouts.insert(ADMIT, Duration::from_secs(5));
    timeouts.insert(ANALYZE, Duration::from_secs(10));
    shared_pipeline(&mut transitions, &mut actions, &mut timeouts);

    SagaTemplate {
        name: "REVISE".to_string(),
        states: vec![
            ADMIT, ANALYZE, GEN, VERIFY, RANK, SELECT, ENRICH, BUILD, FINAL_VERIFY, PACKAGE, DONE,
        ],
        transitions,
        timeouts,
        actions,
    }
}

/// Saga status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// One recorded state entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransitionRecord {
    pub state: String,
    pub entered_at: DateTime<Utc>,
    pub previous: Option<String>,
}

/// A live saga.
#[derive(Debug, Clone)]
pub struct SagaInstance {
    pub saga_id: Uuid,
    pub correlation_id: Uuid,
    pub template: String,
    pub current_state: &'static str,
    pub state_history: Vec<StateTransitionRecord>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub payload: serde_json::Value,
    pub status: SagaStatus,
    /// Bumped on every state entry so stale timers can tell
    pub entry_seq: u64,
}

/// Workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Per-state retry budget before a timeout fails the saga
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    2
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

/// Aggregate workflow statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub avg_duration_ms: f64,
}

/// The saga orchestrator.
pub struct WorkflowOrchestrator {
    config: WorkflowConfig,
    templates: DashMap<String, Arc<SagaTemplate>>,
    sagas: DashMap<Uuid, SagaInstance>,
    publisher: parking_lot::RwLock<Option<Arc<dyn MessagePublisher>>>,
    queues: parking_lot::RwLock<Option<Arc<QueueManager>>>,
    policy: parking_lot::RwLock<Option<Arc<PolicyEngine>>>,
    stats: parking_lot::Mutex<WorkflowStats>,
    shutdown: CancellationToken,
}

impl WorkflowOrchestrator {
    pub fn new(config: WorkflowConfig) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            config,
            templates: DashMap::new(),
            sagas: DashMap::new(),
            publisher: parking_lot::RwLock::new(None),
            queues: parking_lot::RwLock::new(None),
            policy: parking_lot::RwLock::new(None),
            stats: parking_lot::Mutex::new(WorkflowStats::default()),
            shutdown: CancellationToken::new(),
        });
        orchestrator.register_template(create_template());
        orchestrator.register_template(revise_template());
        orchestrator
    }

    /// Register (or replace) a saga template.
    pub fn register_template(&self, template: SagaTemplate) {
        self.templates
            .insert(template.name.clone(), Arc::new(template));
    }

    /// Startup wiring.
    pub fn wire(
        &self,
        publisher: Arc<dyn MessagePublisher>,
        queues: Arc<QueueManager>,
        policy: Arc<PolicyEngine>,
    ) {
        *self.publisher.write() = Some(publisher);
        *self.queues.write() = Some(queues);
        *self.policy.write() = Some(policy);
    }

    /// Bus-facing handler; subscribe it to INTENT, REVISION, and the domain
    /// completion topics.
    pub fn event_handler(self: &Arc<Self>) -> Arc<dyn EventHandler> {
        Arc::new(WorkflowEventHandler {
            orchestrator: Arc::clone(self),
        })
    }

    /// Number of active sagas.
    pub fn active_count(&self) -> usize {
        self.sagas.len()
    }

    /// Snapshot of a saga.
    pub fn saga(&self, saga_id: Uuid) -> Option<SagaInstance> {
        self.sagas.get(&saga_id).map(|s| s.clone())
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> WorkflowStats {
        self.stats.lock().clone()
    }

    // ========================================================================
    // Saga lifecycle
    // ========================================================================

    /// Create a saga from an INTENT event and drive it into its first state.
    pub async fn start_saga(self: &Arc<Self>, event: &Event) -> WorkflowResult<Uuid> {
        let saga_id = event.saga_id.unwrap_or_else(Uuid::new_v4);
        let correlation_id = event.correlation_id.unwrap_or_else(Uuid::new_v4);

        let has_revisions = matches!(
            &event.data,
            EventData::Intent { revisions, .. } if !revisions.is_empty()
        );
        let template_name = if has_revisions { "REVISE" } else { "CREATE" };
        let template = self.template(template_name)?;

        let payload = serde_json::to_value(&event.data).unwrap_or(serde_json::Value::Null);
        let instance = SagaInstance {
            saga_id,
            correlation_id,
            template: template.name.clone(),
            current_state: template.initial_state(),
            state_history: vec![StateTransitionRecord {
                state: template.initial_state().to_string(),
                entered_at: Utc::now(),
                previous: None,
            }],
            started_at: Utc::now(),
            ended_at: None,
            retry_count: 0,
            max_retries: self.config.max_retries,
            payload,
            status: SagaStatus::Active,
            entry_seq: 0,
        };
        self.sagas.insert(saga_id, instance);
        self.stats.lock().started += 1;
        info!(saga = %saga_id, template = template_name, "saga started");

        self.run_state_entry(saga_id, template.initial_state()).await;
        Ok(saga_id)
    }

    fn template(&self, name: &str) -> WorkflowResult<Arc<SagaTemplate>> {
        self.templates
            .get(name)
            .map(|t| Arc::clone(&t))
            .ok_or_else(|| WorkflowError::TemplateNotFound(name.to_string()))
    }

    /// Perform the entry action of the saga's current state, following
    /// AdvanceImmediately chains until a task is enqueued or the saga
    /// finishes.
    async fn run_state_entry(self: &Arc<Self>, saga_id: Uuid, mut state: &'static str) {
        loop {
            let (template, seq) = {
                let Some(saga) = self.sagas.get(&saga_id) else { return };
                if saga.status != SagaStatus::Active || saga.current_state != state {
                    return;
                }
                match self.template(&saga.template) {
                    Ok(t) => (t, saga.entry_seq),
                    Err(e) => {
                        drop(saga);
                        self.fail_saga(saga_id, &e.to_string()).await;
                        return;
                    }
                }
            };

            match template.action_for(state) {
                StateAction::Complete => {
                    self.complete_saga(saga_id).await;
                    return;
                }
                StateAction::AdvanceImmediately => {
                    let Some(next) = template.primary_next(state) else {
                        self.fail_saga(saga_id, "state has no successor").await;
                        return;
                    };
                    match self.transition(saga_id, next).await {
                        Ok(new_state) => {
                            state = new_state;
                            continue;
                        }
                        Err(_) => return,
                    }
                }
                StateAction::EnqueueTask { queue, task_type } => {
                    self.arm_state_timer(saga_id, state, seq, template.timeout_for(state));
                    let enqueue_result = self.enqueue_task(saga_id, queue, task_type).await;
                    if let Err(e) = enqueue_result {
                        self.fail_saga(saga_id, &format!("task enqueue failed: {}", e))
                            .await;
                    }
                    return;
                }
            }
        }
    }

    async fn enqueue_task(
        &self,
        saga_id: Uuid,
        queue: &str,
        task_type: &str,
    ) -> WorkflowResult<()> {
        let (payload, correlation_id) = {
            let saga = self
                .sagas
                .get(&saga_id)
                .ok_or(WorkflowError::SagaNotFound(saga_id.to_string()))?;
            (saga.payload.clone(), saga.correlation_id)
        };
        let queues = self
            .queues
            .read()
            .clone()
            .ok_or_else(|| WorkflowError::Internal("queue manager not wired".to_string()))?;
        queues
            .enqueue(
                queue,
                task_type,
                payload,
                EnqueueOptions {
                    saga_id: Some(saga_id),
                    correlation_id: Some(correlation_id),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Transition the saga to `to`, validating against the template. An
    /// attempted transition outside the table fails the saga.
    async fn transition(
        self: &Arc<Self>,
        saga_id: Uuid,
        to: &'static str,
    ) -> WorkflowResult<&'static str> {
        let result = {
            let Some(mut saga) = self.sagas.get_mut(&saga_id) else {
                return Err(WorkflowError::SagaNotFound(saga_id.to_string()));
            };
            let template = self.template(&saga.template)?;
            let from = saga.current_state;
            if !template.allows(from, to) {
                Err(WorkflowError::InvalidTransition(
                    from.to_string(),
                    to.to_string(),
                ))
            } else {
                saga.state_history.push(StateTransitionRecord {
                    state: to.to_string(),
                    entered_at: Utc::now(),
                    previous: Some(from.to_string()),
                });
                saga.current_state = to;
                saga.retry_count = 0;
                saga.entry_seq += 1;
                debug!(saga = %saga_id, from, to, "saga transition");
                Ok(to)
            }
        };
        match result {
            Ok(to) => Ok(to),
            Err(WorkflowError::InvalidTransition(from, to)) => {
                self.fail_saga(
                    saga_id,
                    &format!("invalid transition {} -> {}", from, to),
                )
                .await;
                Err(WorkflowError::InvalidTransition(from, to))
            }
            Err(e) => Err(e),
        }
    }

    /// Advance to `to` and run the new state's entry action.
    async fn advance(self: &Arc<Self>, saga_id: Uuid, to: &'static str) {
        if self.transition(saga_id, to).await.is_ok() {
            self.run_state_entry(saga_id, to).await;
        }
    }

    fn arm_state_timer(
        self: &Arc<Self>,
        saga_id: Uuid,
        state: &'static str,
        seq: u64,
        timeout: Duration,
    ) {
        let orchestrator = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    orchestrator.on_state_timeout(saga_id, state, seq).await;
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Timer fired: retry the state's entry action or fail the saga.
    async fn on_state_timeout(self: &Arc<Self>, saga_id: Uuid, state: &'static str, seq: u64) {
        let should_retry = {
            let Some(mut saga) = self.sagas.get_mut(&saga_id) else { return };
            if saga.status != SagaStatus::Active
                || saga.current_state != state
                || saga.entry_seq != seq
            {
                // The saga moved on; stale timer.
                return;
            }
            if saga.retry_count < saga.max_retries {
                saga.retry_count += 1;
                saga.entry_seq += 1;
                warn!(
                    saga = %saga_id,
                    state,
                    retry = saga.retry_count,
                    "state timed out, retrying entry action"
                );
                true
            } else {
                false
            }
        };

        if should_retry {
            self.run_state_entry(saga_id, state).await;
        } else {
            self.fail_saga(saga_id, &format!("state timeout in {}", state))
                .await;
        }
    }

    /// Agent completion event: map it onto the saga's expected prerequisite
    /// state and advance. Late arrivals are dropped.
    pub async fn handle_completion(self: &Arc<Self>, event: &Event) {
        let Some(saga_id) = event.saga_id else {
            debug!(event = %event.id, "completion event without saga id, dropped");
            return;
        };
        // Task acknowledgements are the queue manager's concern, not a
        // state-completion signal.
        if matches!(
            &event.data,
            EventData::TaskCompleted { .. } | EventData::TaskFailed { .. }
        ) {
            return;
        }
        let Some(current) = self.sagas.get(&saga_id).map(|s| s.current_state) else {
            debug!(saga = %saga_id, "completion for unknown saga, dropped");
            return;
        };

        use states::*;
        let next = match (event.event_type.as_str(), current) {
            (topics::CANDIDATES, GEN) => Some(VERIFY),
            (topics::CONSTRAINTS, VERIFY) => {
                if constraint_passed(event) {
                    Some(RANK)
                } else {
                    Some(GEN)
                }
            }
            (topics::SELECTION_PROP, RANK) => Some(SELECT),
            (topics::SELECTION_CONF, SELECT) => Some(ENRICH),
            (topics::AVAILABILITY, ENRICH) => Some(BUILD),
            (topics::ITINERARY, BUILD) => Some(FINAL_VERIFY),
            (topics::CONSTRAINTS, FINAL_VERIFY) => {
                if constraint_passed(event) {
                    Some(PACKAGE)
                } else {
                    Some(BUILD)
                }
            }
            (topics::OUTPUT, PACKAGE) => Some(DONE),
            (topics::FALLBACK, _) => {
                // Agent took its fallback path; the saga keeps waiting for
                // the real completion.
                None
            }
            _ => {
                debug!(
                    saga = %saga_id,
                    topic = %event.event_type,
                    state = current,
                    "late or mismatched completion event, dropped"
                );
                None
            }
        };

        if let Some(next) = next {
            self.advance(saga_id, next).await;
        }
    }

    /// A REVISION against an active saga branches a new REVISE saga sharing
    /// the correlation id; the original saga continues unaffected.
    pub async fn handle_revision(self: &Arc<Self>, event: &Event) -> WorkflowResult<Uuid> {
        let original_id = event
            .saga_id
            .ok_or_else(|| WorkflowError::Internal("revision without saga id".to_string()))?;
        let correlation_id = {
            let saga = self
                .sagas
                .get(&original_id)
                .ok_or(WorkflowError::SagaNotFound(original_id.to_string()))?;
            saga.correlation_id
        };

        let changes = match &event.data {
            EventData::Revision { changes } => changes.clone(),
            _ => serde_json::Value::Null,
        };
        let branched = Event::new(
            topics::INTENT,
            EventData::Intent {
                query: changes.clone(),
                revisions: vec![changes],
                client_ip: None,
            },
        )
        .with_saga(Uuid::new_v4())
        .with_correlation(correlation_id)
        .with_source("workflow");

        let new_id = self.start_saga(&branched).await?;
        info!(original = %original_id, revision = %new_id, "revision branched new saga");
        Ok(new_id)
    }

    async fn complete_saga(self: &Arc<Self>, saga_id: Uuid) {
        let Some((_, mut saga)) = self.sagas.remove(&saga_id) else { return };
        saga.status = SagaStatus::Completed;
        saga.ended_at = Some(Utc::now());
        let duration_ms = (Utc::now() - saga.started_at).num_milliseconds().max(0) as f64;
        {
            let mut stats = self.stats.lock();
            stats.completed += 1;
            stats.avg_duration_ms = if stats.avg_duration_ms == 0.0 {
                duration_ms
            } else {
                EMA_ALPHA * duration_ms + (1.0 - EMA_ALPHA) * stats.avg_duration_ms
            };
        }
        if let Some(policy) = self.policy.read().clone() {
            policy.release(saga_id);
        }
        info!(saga = %saga_id, duration_ms, "saga completed");
        self.emit(
            topics::WORKFLOW_COMPLETE,
            saga_id,
            saga.correlation_id,
            serde_json::json!({"template": saga.template, "duration_ms": duration_ms}),
        );
    }

    async fn fail_saga(self: &Arc<Self>, saga_id: Uuid, reason: &str) {
        let Some((_, mut saga)) = self.sagas.remove(&saga_id) else { return };
        saga.status = SagaStatus::Failed;
        saga.ended_at = Some(Utc::now());
        self.stats.lock().failed += 1;
        if let Some(policy) = self.policy.read().clone() {
            policy.release(saga_id);
        }
        warn!(saga = %saga_id, reason, "saga failed");
        self.emit(
            topics::WORKFLOW_ERROR,
            saga_id,
            saga.correlation_id,
            serde_json::json!({
                "template": saga.template,
                "state": saga.current_state,
                "reason": reason,
            }),
        );
    }

    /// Cancel every active saga (shutdown path).
    pub async fn cancel_all(self: &Arc<Self>) {
        let saga_ids: Vec<Uuid> = self.sagas.iter().map(|s| s.saga_id).collect();
        for saga_id in saga_ids {
            let Some((_, mut saga)) = self.sagas.remove(&saga_id) else { continue };
            saga.status = SagaStatus::Cancelled;
            saga.ended_at = Some(Utc::now());
            self.stats.lock().cancelled += 1;
            if let Some(policy) = self.policy.read().clone() {
                policy.release(saga_id);
            }
            self.emit(
                topics::WORKFLOW_CANCELLED,
                saga_id,
                saga.correlation_id,
                serde_json::json!({"template": saga.template, "state": saga.current_state}),
            );
        }
    }

    fn emit(
        &self,
        topic: &'static str,
        saga_id: Uuid,
        correlation_id: Uuid,
        detail: serde_json::Value,
    ) {
        let Some(publisher) = self.publisher.read().clone() else {
            return;
        };
        let event = Event::new(topic, EventData::Signal { detail })
            .with_saga(saga_id)
            .with_correlation(correlation_id)
            .with_source("workflow");
        tokio::spawn(async move {
            let _ = publisher.publish_event(event).await;
        });
    }
}

fn constraint_passed(event: &Event) -> bool {
    matches!(&event.data, EventData::Constraints { passed: true, .. })
}

#[async_trait]
impl Lifecycle for Arc<WorkflowOrchestrator> {
    fn name(&self) -> &str {
        "workflow-orchestrator"
    }

    async fn start(&self) -> Result<(), String> {
        info!("workflow orchestrator started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.cancel_all().await;
        self.shutdown.cancel();
        info!("workflow orchestrator shut down");
        Ok(())
    }
}

/// Bus-facing adapter: routes INTENT, REVISION, and completion events into
/// the orchestrator.
struct WorkflowEventHandler {
    orchestrator: Arc<WorkflowOrchestrator>,
}

#[async_trait]
impl EventHandler for WorkflowEventHandler {
    async fn handle(&self, event: Event) -> Result<(), String> {
        match event.event_type.as_str() {
            topics::INTENT => {
                self.orchestrator
                    .start_saga(&event)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            topics::REVISION => {
                self.orchestrator
                    .handle_revision(&event)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            _ => {
                self.orchestrator.handle_completion(&event).await;
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        "workflow-orchestrator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_manager::QueueConfig;

    fn orchestrator_with_queues() -> (Arc<WorkflowOrchestrator>, Arc<QueueManager>) {
        let queues = QueueManager::new(
            [
                "candidate-generation",
                "validation-tasks",
                "ranking-tasks",
                "selection-tasks",
                "enrichment-tasks",
                "output-generation",
            ]
            .into_iter()
            .map(|name| (name.to_string(), QueueConfig::default()))
            .collect(),
        );
        let policy = PolicyEngine::new(
            Default::default(),
            Default::default(),
            Default::default(),
        );
        let orchestrator = WorkflowOrchestrator::new(WorkflowConfig::default());
        let bus = crate::event_bus::EventBus::new(Default::default());
        orchestrator.wire(Arc::new(bus), Arc::clone(&queues), policy);
        (orchestrator, queues)
    }

    fn intent(revisions: Vec<serde_json::Value>) -> Event {
        Event::new(
            topics::INTENT,
            EventData::Intent {
                query: serde_json::json!({"destination": "Lisbon"}),
                revisions,
                client_ip: None,
            },
        )
        .with_saga(Uuid::new_v4())
        .with_correlation(Uuid::new_v4())
    }

    fn completion(topic: &str, saga_id: Uuid, data: EventData) -> Event {
        Event::new(topic, data).with_saga(saga_id)
    }

    #[test]
    fn test_template_transition_tables() {
        let create = create_template();
        assert!(create.allows(states::ADMIT, states::GEN));
        assert!(create.allows(states::VERIFY, states::GEN));
        assert!(create.allows(states::FINAL_VERIFY, states::BUILD));
        assert!(!create.allows(states::GEN, states::SELECT));
        assert!(!create.allows(states::DONE, states::ADMIT));

        let revise = revise_template();
        assert!(revise.allows(states::ADMIT, states::ANALYZE));
        assert!(revise.allows(states::ANALYZE, states::GEN));
        assert!(!revise.allows(states::ADMIT, states::GEN));
    }

    #[tokio::test]
    async fn test_intent_starts_create_saga_in_gen() {
        let (orchestrator, _queues) = orchestrator_with_queues();
        let event = intent(vec![]);
        let saga_id = orchestrator.start_saga(&event).await.unwrap();

        let saga = orchestrator.saga(saga_id).unwrap();
        assert_eq!(saga.template, "CREATE");
        // ADMIT advances immediately into GEN, which enqueues and waits.
        assert_eq!(saga.current_state, states::GEN);
        let history: Vec<&str> = saga.state_history.iter().map(|h| h.state.as_str()).collect();
        assert_eq!(history, vec!["ADMIT", "GEN"]);
    }

    #[tokio::test]
    async fn test_intent_with_revisions_selects_revise() {
        let (orchestrator, _queues) = orchestrator_with_queues();
        let event = intent(vec![serde_json::json!({"change": "hotel"})]);
        let saga_id = orchestrator.start_saga(&event).await.unwrap();
        let saga = orchestrator.saga(saga_id).unwrap();
        assert_eq!(saga.template, "REVISE");
        assert_eq!(saga.current_state, states::GEN);
    }

    #[tokio::test]
    async fn test_full_happy_path() {
        let (orchestrator, queues) = orchestrator_with_queues();
        let event = intent(vec![]);
        let saga_id = orchestrator.start_saga(&event).await.unwrap();

        let steps: Vec<(&str, EventData)> = vec![
            (topics::CANDIDATES, EventData::Candidates { items: vec![] }),
            (
                topics::CONSTRAINTS,
                EventData::Constraints {
                    passed: true,
                    violations: vec![],
                },
            ),
            (
                topics::SELECTION_PROP,
                EventData::SelectionProposal {
                    candidate_ids: vec!["c1".to_string()],
                    scores: vec![0.9],
                },
            ),
            (
                topics::SELECTION_CONF,
                EventData::SelectionConfirmation {
                    candidate_id: "c1".to_string(),
                },
            ),
            (topics::AVAILABILITY, EventData::Availability { results: vec![] }),
            (
                topics::ITINERARY,
                EventData::Itinerary {
                    itinerary: serde_json::json!({}),
                },
            ),
            (
                topics::CONSTRAINTS,
                EventData::Constraints {
                    passed: true,
                    violations: vec![],
                },
            ),
            (
                topics::OUTPUT,
                EventData::Output {
                    document: serde_json::json!({}),
                },
            ),
        ];

        let expected_states = [
            states::VERIFY,
            states::RANK,
            states::SELECT,
            states::ENRICH,
            states::BUILD,
            states::FINAL_VERIFY,
            states::PACKAGE,
        ];

        for (i, (topic, data)) in steps.into_iter().enumerate() {
            orchestrator
                .handle_completion(&completion(topic, saga_id, data))
                .await;
            if i < expected_states.len() {
                assert_eq!(
                    orchestrator.saga(saga_id).unwrap().current_state,
                    expected_states[i]
                );
            }
        }

        // Saga finished and was removed.
        assert!(orchestrator.saga(saga_id).is_none());
        let stats = orchestrator.stats();
        assert_eq!(stats.completed, 1);
        assert!(stats.avg_duration_ms > 0.0);
        drop(queues);
    }

    #[tokio::test]
    async fn test_failed_verification_falls_back_to_gen() {
        let (orchestrator, _queues) = orchestrator_with_queues();
        let saga_id = orchestrator.start_saga(&intent(vec![])).await.unwrap();

        orchestrator
            .handle_completion(&completion(
                topics::CANDIDATES,
                saga_id,
                EventData::Candidates { items: vec![] },
            ))
            .await;
        assert_eq!(orchestrator.saga(saga_id).unwrap().current_state, states::VERIFY);

        orchestrator
            .handle_completion(&completion(
                topics::CONSTRAINTS,
                saga_id,
                EventData::Constraints {
                    passed: false,
                    violations: vec!["no availability".to_string()],
                },
            ))
            .await;
        assert_eq!(orchestrator.saga(saga_id).unwrap().current_state, states::GEN);
    }

    #[tokio::test]
    async fn test_late_arrival_is_dropped() {
        let (orchestrator, _queues) = orchestrator_with_queues();
        let saga_id = orchestrator.start_saga(&intent(vec![])).await.unwrap();

        // Saga is in GEN; an OUTPUT completion is out of order.
        orchestrator
            .handle_completion(&completion(
                topics::OUTPUT,
                saga_id,
                EventData::Output {
                    document: serde_json::json!({}),
                },
            ))
            .await;
        let saga = orchestrator.saga(saga_id).unwrap();
        assert_eq!(saga.current_state, states::GEN);
        assert_eq!(saga.status, SagaStatus::Active);
    }

    #[tokio::test]
    async fn test_revision_branches_sibling_saga() {
        let (orchestrator, _queues) = orchestrator_with_queues();
        let saga_id = orchestrator.start_saga(&intent(vec![])).await.unwrap();
        let correlation = orchestrator.saga(saga_id).unwrap().correlation_id;

        let revision = Event::new(
            topics::REVISION,
            EventData::Revision {
                changes: serde_json::json!({"hotel": "upgrade"}),
            },
        )
        .with_saga(saga_id);
        let new_id = orchestrator.handle_revision(&revision).await.unwrap();

        assert_ne!(new_id, saga_id);
        let branched = orchestrator.saga(new_id).unwrap();
        assert_eq!(branched.template, "REVISE");
        assert_eq!(branched.correlation_id, correlation);
        // Original continues unaffected.
        let original = orchestrator.saga(saga_id).unwrap();
        assert_eq!(original.status, SagaStatus::Active);
        assert_eq!(original.current_state, states::GEN);
    }

    #[tokio::test]
    async fn test_state_timeout_retries_then_fails() {
        let queues = QueueManager::new(vec![(
            "candidate-generation".to_string(),
            QueueConfig::default(),
        )]);
        let policy = PolicyEngine::new(
            Default::default(),
            Default::default(),
            Default::default(),
        );
        let orchestrator = WorkflowOrchestrator::new(WorkflowConfig { max_retries: 1 });

        // Template with a very short GEN timeout.
        let mut template = create_template();
        template.timeouts.insert(states::GEN, Duration::from_millis(40));
        orchestrator.register_template(template);

        let bus = crate::event_bus::EventBus::new(Default::default());
        orchestrator.wire(Arc::new(bus), queues, policy);

        let saga_id = orchestrator.start_saga(&intent(vec![])).await.unwrap();
        assert_eq!(orchestrator.saga(saga_id).unwrap().current_state, states::GEN);

        // First timeout retries, second fails the saga.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(orchestrator.saga(saga_id).is_none());
        let stats = orchestrator.stats();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_cancel_all_on_shutdown() {
        let (orchestrator, _queues) = orchestrator_with_queues();
        orchestrator.start_saga(&intent(vec![])).await.unwrap();
        orchestrator.start_saga(&intent(vec![])).await.unwrap();
        assert_eq!(orchestrator.active_count(), 2);

        Lifecycle::shutdown(&orchestrator).await.unwrap();
        assert_eq!(orchestrator.active_count(), 0);
        assert_eq!(orchestrator.stats().cancelled, 2);
    }

    #[tokio::test]
    async fn test_admission_released_on_completion() {
        let (orchestrator, _queues) = orchestrator_with_queues();
        let policy = PolicyEngine::new(
            Default::default(),
            Default::default(),
            Default::default(),
        );
        let bus = crate::event_bus::EventBus::new(Default::default());
        let queues = QueueManager::new(vec![(
            "candidate-generation".to_string(),
            QueueConfig::default(),
        )]);
        orchestrator.wire(Arc::new(bus), queues, Arc::clone(&policy));

        let event = intent(vec![]);
        let saga_id = event.saga_id.unwrap();
        policy.admit(saga_id, "10.0.0.1", 0, 0);
        assert_eq!(policy.active_saga_count(), 1);

        orchestrator.start_saga(&event).await.unwrap();
        Lifecycle::shutdown(&orchestrator).await.unwrap();
        assert_eq!(policy.active_saga_count(), 0);
    }
}
