// Itinera: holonic travel-planning orchestration core
// Event bus, state manager, queue manager, policy layer, and workflow
// orchestrator, composed through an explicit core context.

pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod errors;
pub mod event_bus;
pub mod events;
pub mod lock;
pub mod persistence;
pub mod policy;
pub mod queue_manager;
pub mod state_manager;
pub mod state_types;
pub mod traits;
pub mod workflow;

// Re-export commonly used types
pub use errors::{
    BusError, BusResult, CoordinatorError, CoordinatorResult, PolicyError, PolicyResult,
    QueueError, QueueResult, StateError, StateResult, WorkflowError, WorkflowResult,
};

pub use events::{topics, Event, EventData, EVENT_SCHEMA_VERSION};

pub use event_bus::{
    BusStats, DeadLetteredEvent, EventBus, EventBusConfig, HistoryFilter,
};

pub use traits::{
    Cipher, Clock, Codec, EventHandler, GzipCodec, InMemoryReplicator, Lifecycle,
    MessagePublisher, MessageSubscriber, PassthroughCipher, ReplicaRecord, Replicator,
    SystemClock, XorCipher,
};

pub use state_types::{
    builtin_namespaces, ConflictStrategy, ConsistencyClass, GetOptions, NamespaceConfig,
    NamespaceStats, SetOptions, SetReceipt, StateChange, StateChangeKind, StateEntry,
    StateHealth, TxOperation, TxResult, ValueWithMeta,
};

pub use state_manager::{StateManager, StateManagerConfig};

pub use lock::{KeyLock, LockManager};

pub use persistence::{NamespacePersistence, PersistedPayload, PersistedRecord};

pub use queue_manager::{
    builtin_queues, completion_topic, BusTaskDispatcher, EnqueueOptions, MessageError,
    MessagePriority, QueueConfig, QueueManager, QueueStats, QueueStatus, QueuedMessage,
    TaskDispatcher,
};

pub use policy::{
    AdmissionConfig, AdmissionDecision, BusinessRule, ComplianceConfig, ComplianceReport,
    PolicyEngine, PolicyViolation,
};

pub use circuit_breaker::{
    BreakerSnapshot, BreakerState, CircuitBreakerConfig, CircuitBreakerRegistry,
};

pub use workflow::{
    create_template, revise_template, states, SagaInstance, SagaStatus, SagaTemplate,
    StateAction, StateTransitionRecord, WorkflowConfig, WorkflowOrchestrator, WorkflowStats,
};

pub use coordinator::{Coordinator, SubmitReceipt, TravelRequest};

pub use config::{CoreConfig, LoggingConfig, NamespacesConfig, PolicyConfig, QueuesConfig};

pub use context::CoreContext;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
