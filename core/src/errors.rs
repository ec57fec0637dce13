/// Error types for the Itinera orchestration core.
use thiserror::Error;

/// Core error type for event bus operations.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Invalid event schema: {0}")]
    SchemaError(String),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Dead letter queue overflow on {0}")]
    DlqOverflow(String),

    #[error("Delivery failed after {attempts} attempts: {reason}")]
    DeliveryFailed { attempts: u32, reason: String },

    #[error("Event bus is shut down")]
    ShutDown,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal bus error: {0}")]
    Internal(String),
}

/// Result type for event bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Core error type for state manager operations.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Namespace already exists: {0}")]
    NamespaceExists(String),

    #[error("Key not found: {namespace}/{key}")]
    KeyNotFound { namespace: String, key: String },

    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Key locked by another owner: {namespace}/{key}")]
    Locked { namespace: String, key: String },

    #[error("Lock not held: {0}")]
    LockNotHeld(String),

    #[error("Lock acquisition timed out: {namespace}/{key}")]
    LockTimeout { namespace: String, key: String },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Transaction timed out: {0}")]
    TransactionTimeout(String),

    #[error("Write quorum not reached: {acks}/{required} acks")]
    QuorumNotReached { acks: usize, required: usize },

    #[error("Manual conflict resolution required for {0}")]
    ManualConflict(String),

    #[error("Value is not an integer: {0}")]
    NotAnInteger(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Cipher error: {0}")]
    CipherError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal state error: {0}")]
    Internal(String),
}

/// Result type for state manager operations.
pub type StateResult<T> = Result<T, StateError>;

/// Core error type for queue manager operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue full: {queue} at capacity {capacity}")]
    QueueFull { queue: String, capacity: usize },

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Rate limited on queue {0}")]
    RateLimited(String),

    #[error("Message processing timed out after {0:?}")]
    ProcessingTimeout(std::time::Duration),

    #[error("Queue is paused: {0}")]
    Paused(String),

    #[error("Queue manager is shut down")]
    ShutDown,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal queue error: {0}")]
    Internal(String),
}

/// Result type for queue manager operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Core error type for policy operations.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Admission denied: {reason}")]
    AdmissionDenied { reason: String },

    #[error("Rate limit exceeded for client {0}")]
    RateLimited(String),

    #[error("Compliance violation: {rule}: {detail}")]
    ComplianceViolation { rule: String, detail: String },

    #[error("Business rule failed: {rule}: {detail}")]
    RuleFailed { rule: String, detail: String },

    #[error("Circuit breaker open for service {0}")]
    CircuitOpen(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Internal policy error: {0}")]
    Internal(String),
}

/// Result type for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Core error type for workflow orchestration.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid state transition: {0} -> {1}")]
    InvalidTransition(String, String),

    #[error("Saga not found: {0}")]
    SagaNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("State timed out: saga {saga_id} in {state}")]
    StateTimeout { saga_id: String, state: String },

    #[error("Retries exhausted: saga {saga_id} after {retries} retries")]
    RetriesExhausted { saga_id: String, retries: u32 },

    #[error("Saga cancelled: {0}")]
    Cancelled(String),

    #[error("Event bus error: {0}")]
    BusError(#[from] BusError),

    #[error("Queue error: {0}")]
    QueueError(#[from] QueueError),

    #[error("Internal workflow error: {0}")]
    Internal(String),
}

/// Result type for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Core error type for coordinator ingress.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Policy error: {0}")]
    PolicyError(#[from] PolicyError),

    #[error("Queue error: {0}")]
    QueueError(#[from] QueueError),

    #[error("Event bus error: {0}")]
    BusError(#[from] BusError),

    #[error("Internal coordinator error: {0}")]
    Internal(String),
}

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
