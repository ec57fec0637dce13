/// Core context: owns the five subsystems plus the coordinator and performs
/// the startup wiring step.
///
/// The source system reached components through global singletons and let
/// them hold each other's concrete types; here construction is explicit and
/// each component receives only the interfaces it needs, so there are no
/// cyclic concrete references.
use crate::config::CoreConfig;
use crate::coordinator::Coordinator;
use crate::event_bus::EventBus;
use crate::events::topics;
use crate::policy::PolicyEngine;
use crate::queue_manager::{BusTaskDispatcher, QueueManager};
use crate::state_manager::{StateManager, StateManagerConfig};
use crate::traits::{Clock, Lifecycle, SystemClock};
use crate::workflow::WorkflowOrchestrator;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Topics whose completion events drive saga progress and queue acks.
const COMPLETION_TOPICS: &[&str] = &[
    topics::CANDIDATES,
    topics::CONSTRAINTS,
    topics::SELECTION_PROP,
    topics::SELECTION_CONF,
    topics::AVAILABILITY,
    topics::ITINERARY,
    topics::OUTPUT,
];

/// The assembled orchestration core.
pub struct CoreContext {
    pub config: CoreConfig,
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<EventBus>,
    pub state: Arc<StateManager>,
    pub queues: Arc<QueueManager>,
    pub policy: Arc<PolicyEngine>,
    pub workflow: Arc<WorkflowOrchestrator>,
    pub coordinator: Arc<Coordinator>,
}

impl CoreContext {
    /// Construct every component and wire them together. Nothing runs until
    /// `start` is called.
    pub fn build(config: CoreConfig) -> Result<Self, String> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let bus = EventBus::new(config.bus.clone());

        // Namespaces come from config so overrides apply; the manager's own
        // builtin creation is turned off.
        let state_config = StateManagerConfig {
            create_builtins: false,
            ..config.state.clone()
        };
        let state = StateManager::new(state_config);
        for (name, ns_config) in config.namespaces.effective_namespaces() {
            state
                .create_namespace(&name, ns_config)
                .map_err(|e| format!("namespace {}: {}", name, e))?;
        }

        let queues = QueueManager::new(config.queues.effective_queues());

        let policy = PolicyEngine::new(
            config.policy.admission.clone(),
            config.policy.compliance.clone(),
            config.policy.circuit_breaker.clone(),
        );

        let workflow = WorkflowOrchestrator::new(config.workflow.clone());

        // Wiring: every component gets the bus through its interface.
        let publisher = Arc::new(Arc::clone(&bus));
        state.set_publisher(publisher.clone());
        queues.set_publisher(publisher.clone());
        queues.set_dispatcher(Arc::new(BusTaskDispatcher::new(publisher.clone())));
        policy.set_publisher(publisher.clone());
        workflow.wire(publisher, Arc::clone(&queues), Arc::clone(&policy));

        // Saga progress: the orchestrator consumes intents, revisions, and
        // completions; retries stay off for it since a failed transition is
        // a saga decision, not a transient fault.
        let workflow_handler = workflow.event_handler();
        bus.subscribe(topics::INTENT, Arc::clone(&workflow_handler), false)
            .map_err(|e| e.to_string())?;
        bus.subscribe(topics::REVISION, Arc::clone(&workflow_handler), false)
            .map_err(|e| e.to_string())?;
        for topic in COMPLETION_TOPICS {
            bus.subscribe(topic, Arc::clone(&workflow_handler), false)
                .map_err(|e| e.to_string())?;
        }

        // Queue acknowledgements ride the same completion topics.
        let ack_handler = queues.ack_handler();
        for topic in COMPLETION_TOPICS {
            bus.subscribe(topic, Arc::clone(&ack_handler), false)
                .map_err(|e| e.to_string())?;
        }

        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&bus),
            Arc::clone(&queues),
            Arc::clone(&policy),
            Arc::clone(&workflow),
        ));

        Ok(Self {
            config,
            clock,
            bus,
            state,
            queues,
            policy,
            workflow,
            coordinator,
        })
    }

    /// Start background work: queue processors, state sweeps, breaker
    /// monitor.
    pub async fn start(&self) -> Result<(), String> {
        Lifecycle::start(self.bus.as_ref()).await?;
        Lifecycle::start(&self.state).await?;
        Lifecycle::start(&self.queues).await?;
        self.policy.breakers().spawn_monitor(Duration::from_secs(5));
        Lifecycle::start(&self.workflow).await?;
        info!("core context started");
        Ok(())
    }

    /// Graceful shutdown: cancel sagas first so their terminal events can
    /// still flow, then stop the lower layers.
    pub async fn shutdown(&self) {
        if let Err(e) = Lifecycle::shutdown(&self.workflow).await {
            warn!(error = %e, "workflow shutdown");
        }
        self.policy.breakers().stop();
        if let Err(e) = Lifecycle::shutdown(&self.queues).await {
            warn!(error = %e, "queue manager shutdown");
        }
        if let Err(e) = Lifecycle::shutdown(&self.state).await {
            warn!(error = %e, "state manager shutdown");
        }
        if let Err(e) = Lifecycle::shutdown(self.bus.as_ref()).await {
            warn!(error = %e, "event bus shutdown");
        }
        info!("core context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> CoreConfig {
        let mut config = CoreConfig::default();
        config.state.persistence_root = dir.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_build_wires_all_components() {
        let dir = tempfile::TempDir::new().unwrap();
        let context = CoreContext::build(test_config(&dir)).unwrap();

        // Built-in namespaces and queues exist.
        assert!(context
            .state
            .list_namespaces()
            .contains(&"search-cache".to_string()));
        assert!(context
            .queues
            .statuses()
            .await
            .iter()
            .any(|s| s.name == "search-requests"));

        // The orchestrator and ack handler are subscribed.
        assert_eq!(context.bus.subscriber_count(topics::INTENT), 1);
        assert_eq!(context.bus.subscriber_count(topics::CANDIDATES), 2);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let context = CoreContext::build(test_config(&dir)).unwrap();
        context.start().await.unwrap();
        context.shutdown().await;
    }
}
