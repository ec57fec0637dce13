/// Event model for inter-holon communication.
/// Events are topic-addressed, JSON-serializable records carrying saga and
/// correlation identity for end-to-end tracing across the orchestration core.
use crate::errors::{BusError, BusResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire schema version stamped on every event.
pub const EVENT_SCHEMA_VERSION: &str = "1.0";

/// Reserved topic names.
///
/// Domain topics carry travel-planning traffic between holons; infrastructure
/// topics carry lifecycle signals from the core subsystems themselves.
pub mod topics {
    pub const INTENT: &str = "INTENT";
    pub const CANDIDATES: &str = "CANDIDATES";
    pub const AVAILABILITY: &str = "AVAILABILITY";
    pub const CONSTRAINTS: &str = "CONSTRAINTS";
    pub const SELECTION_PROP: &str = "SELECTION_PROP";
    pub const SELECTION_CONF: &str = "SELECTION_CONF";
    pub const ITINERARY: &str = "ITINERARY";
    pub const REVISION: &str = "REVISION";
    pub const FALLBACK: &str = "FALLBACK";
    pub const OUTPUT: &str = "OUTPUT";

    pub const WORKFLOW_COMPLETE: &str = "workflow-complete";
    pub const WORKFLOW_ERROR: &str = "workflow-error";
    pub const WORKFLOW_CANCELLED: &str = "workflow-cancelled";

    pub const MESSAGE_ENQUEUED: &str = "message-enqueued";
    pub const MESSAGE_PROCESSED: &str = "message-processed";
    pub const MESSAGE_RETRY_SCHEDULED: &str = "message-retry-scheduled";
    pub const MESSAGE_DEAD_LETTERED: &str = "message-dead-lettered";
    pub const QUEUE_PAUSED: &str = "queue-paused";
    pub const QUEUE_RESUMED: &str = "queue-resumed";
    pub const QUEUE_CLEARED: &str = "queue-cleared";
    pub const QUEUE_HEALTH_WARNING: &str = "queue-health-warning";
    pub const DLQ_MESSAGE: &str = "dlq-message";

    pub const ADMISSION_APPROVED: &str = "admission-approved";
    pub const ADMISSION_DENIED: &str = "admission-denied";
    pub const CIRCUIT_BREAKER_OPENED: &str = "circuit-breaker-opened";
    pub const CIRCUIT_BREAKER_CLOSED: &str = "circuit-breaker-closed";
    pub const POLICY_VIOLATION: &str = "policy-violation";
    pub const AUDIT_EVENT: &str = "audit-event";

    pub const STATE_SET_REQUEST: &str = "state-set-request";
    pub const STATE_SET_RESPONSE: &str = "state-set-response";
    pub const STATE_SET_ERROR: &str = "state-set-error";
    pub const STATE_GET_REQUEST: &str = "state-get-request";
    pub const STATE_GET_RESPONSE: &str = "state-get-response";
    pub const STATE_GET_ERROR: &str = "state-get-error";
    pub const STATE_DELETE_REQUEST: &str = "state-delete-request";
    pub const STATE_DELETE_RESPONSE: &str = "state-delete-response";
    pub const STATE_DELETE_ERROR: &str = "state-delete-error";
    pub const STATE_SUBSCRIPTION_EVENT: &str = "state-subscription-event";

    pub const CLUSTER_NODE_JOINED: &str = "cluster-node-joined";
    pub const CLUSTER_NODE_LEFT: &str = "cluster-node-left";

    /// Domain topics that drive saga progress.
    pub const DOMAIN: &[&str] = &[
        INTENT,
        CANDIDATES,
        AVAILABILITY,
        CONSTRAINTS,
        SELECTION_PROP,
        SELECTION_CONF,
        ITINERARY,
        REVISION,
        FALLBACK,
        OUTPUT,
    ];
}

/// Typed event payload, discriminated per topic family.
/// Unknown topic/payload combinations are rejected at the bus boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    /// A travel-planning intent entering the system.
    Intent {
        query: serde_json::Value,
        #[serde(default)]
        revisions: Vec<serde_json::Value>,
        #[serde(default)]
        client_ip: Option<String>,
    },
    /// Generated itinerary candidates.
    Candidates { items: Vec<serde_json::Value> },
    /// Availability check results for candidates.
    Availability { results: Vec<serde_json::Value> },
    /// Constraint verification results.
    Constraints {
        passed: bool,
        #[serde(default)]
        violations: Vec<String>,
    },
    /// Ranked selection proposal.
    SelectionProposal {
        candidate_ids: Vec<String>,
        #[serde(default)]
        scores: Vec<f64>,
    },
    /// Confirmed selection.
    SelectionConfirmation { candidate_id: String },
    /// Assembled itinerary.
    Itinerary { itinerary: serde_json::Value },
    /// Revision request against an active saga.
    Revision { changes: serde_json::Value },
    /// Fallback path taken by an agent.
    Fallback { reason: String },
    /// Final rendered output.
    Output { document: serde_json::Value },
    /// Agent acknowledgement that a queued task finished.
    TaskCompleted {
        task_type: String,
        message_id: Uuid,
        #[serde(default)]
        result: serde_json::Value,
    },
    /// Agent report that a queued task failed.
    TaskFailed {
        task_type: String,
        message_id: Uuid,
        error: String,
    },
    /// Infrastructure signal (queue, state, policy, workflow lifecycle).
    Signal {
        #[serde(default)]
        detail: serde_json::Value,
    },
    /// Free-form payload for non-reserved topics.
    Custom {
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl EventData {
    /// Check that this payload variant is legal on the given topic.
    ///
    /// Domain topics demand their matching variant; infrastructure topics
    /// accept `Signal`; anything else only accepts `Custom`.
    pub fn matches_topic(&self, topic: &str) -> bool {
        match self {
            EventData::Intent { .. } => topic == topics::INTENT,
            EventData::Candidates { .. } => topic == topics::CANDIDATES,
            EventData::Availability { .. } => topic == topics::AVAILABILITY,
            EventData::Constraints { .. } => topic == topics::CONSTRAINTS,
            EventData::SelectionProposal { .. } => topic == topics::SELECTION_PROP,
            EventData::SelectionConfirmation { .. } => topic == topics::SELECTION_CONF,
            EventData::Itinerary { .. } => topic == topics::ITINERARY,
            EventData::Revision { .. } => topic == topics::REVISION,
            EventData::Fallback { .. } => topic == topics::FALLBACK,
            EventData::Output { .. } => topic == topics::OUTPUT,
            EventData::TaskCompleted { .. } | EventData::TaskFailed { .. } => {
                // Task acknowledgements ride on the domain topic that the
                // producing agent serves.
                topics::DOMAIN.contains(&topic)
            }
            EventData::Signal { .. } => !topics::DOMAIN.contains(&topic),
            EventData::Custom { .. } => !topics::DOMAIN.contains(&topic),
        }
    }
}

/// Core event structure carried by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: Uuid,
    /// Topic name (also the event type)
    #[serde(rename = "type")]
    pub event_type: String,
    /// Typed payload
    pub data: EventData,
    /// Creation timestamp (ISO-8601 on the wire)
    pub timestamp: DateTime<Utc>,
    /// Saga this event belongs to
    pub saga_id: Option<Uuid>,
    /// Correlation across related sagas
    pub correlation_id: Option<Uuid>,
    /// Tracing span
    pub span_id: Option<Uuid>,
    /// Originating component name
    pub source: String,
    /// Wire schema version
    pub version: String,
}

impl Event {
    /// Create an event on a topic with the given payload.
    pub fn new(topic: impl Into<String>, data: EventData) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: topic.into(),
            data,
            timestamp: Utc::now(),
            saga_id: None,
            correlation_id: None,
            span_id: None,
            source: "core".to_string(),
            version: EVENT_SCHEMA_VERSION.to_string(),
        }
    }

    /// Set the saga id.
    pub fn with_saga(mut self, saga_id: Uuid) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    /// Set the correlation id.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set the tracing span id.
    pub fn with_span(mut self, span_id: Uuid) -> Self {
        self.span_id = Some(span_id);
        self
    }

    /// Set the source component name.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Validate the event against the wire schema.
    ///
    /// `require_correlation` additionally demands saga and correlation ids,
    /// which deployments with correlation tracking turn on.
    pub fn validate_schema(&self, require_correlation: bool) -> BusResult<()> {
        if self.event_type.is_empty() {
            return Err(BusError::SchemaError("event type is empty".to_string()));
        }
        if self.version != EVENT_SCHEMA_VERSION {
            return Err(BusError::SchemaError(format!(
                "unsupported schema version: {}",
                self.version
            )));
        }
        if !self.data.matches_topic(&self.event_type) {
            return Err(BusError::SchemaError(format!(
                "payload variant not allowed on topic {}",
                self.event_type
            )));
        }
        if require_correlation && (self.saga_id.is_none() || self.correlation_id.is_none()) {
            return Err(BusError::SchemaError(
                "saga_id and correlation_id are required".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize the event to JSON bytes.
    pub fn to_bytes(&self) -> BusResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize an event from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> BusResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
