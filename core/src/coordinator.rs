/// Ingress boundary adapter.
///
/// Converts an external travel request into a saga start: compliance
/// validation (with redaction), admission control, enqueue into the ingress
/// queue, then the INTENT event that the workflow orchestrator consumes.
use crate::errors::{CoordinatorError, CoordinatorResult};
use crate::event_bus::EventBus;
use crate::events::{topics, Event, EventData};
use crate::policy::PolicyEngine;
use crate::queue_manager::{EnqueueOptions, QueueManager};
use crate::workflow::WorkflowOrchestrator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Queue that ingress requests land on.
const INGRESS_QUEUE: &str = "search-requests";

/// External request shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TravelRequest {
    pub query: serde_json::Value,
    #[serde(default)]
    pub revisions: Vec<serde_json::Value>,
    pub client_ip: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Carried through when the caller is continuing earlier work
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

/// Receipt returned to the caller on acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub saga_id: Uuid,
    pub correlation_id: Uuid,
    /// Compliance redactions applied to the accepted payload
    pub redacted_fields: Vec<String>,
}

/// The coordinator.
pub struct Coordinator {
    bus: Arc<EventBus>,
    queues: Arc<QueueManager>,
    policy: Arc<PolicyEngine>,
    workflow: Arc<WorkflowOrchestrator>,
}

impl Coordinator {
    pub fn new(
        bus: Arc<EventBus>,
        queues: Arc<QueueManager>,
        policy: Arc<PolicyEngine>,
        workflow: Arc<WorkflowOrchestrator>,
    ) -> Self {
        Self {
            bus,
            queues,
            policy,
            workflow,
        }
    }

    /// Accept or reject an external request. On acceptance the saga is
    /// admitted, its ingress message is queued, and INTENT is published.
    pub async fn submit(&self, request: TravelRequest) -> CoordinatorResult<SubmitReceipt> {
        let saga_id = Uuid::new_v4();
        let correlation_id = request.correlation_id.unwrap_or_else(Uuid::new_v4);

        // Compliance first: redaction applies to whatever proceeds.
        let mut payload = request.query.clone();
        let report =
            self.policy
                .validate_compliance(&mut payload, "search", request.token.as_deref());
        if !report.is_clean() {
            debug!(
                saga = %saga_id,
                violations = report.violations.len(),
                "compliance violations recorded on ingress"
            );
        }

        // Admission.
        let depth = self.queues.depth(INGRESS_QUEUE).await.unwrap_or(0);
        let active = self.workflow.active_count();
        let decision = self
            .policy
            .admit(saga_id, &request.client_ip, depth, active);
        if !decision.approved {
            let reason = decision.reason.unwrap_or_else(|| "denied".to_string());
            return Err(CoordinatorError::Rejected(reason));
        }

        // Backpressure from the ingress queue surfaces through admission's
        // release so the saga slot is not leaked.
        let enqueue_result = self
            .queues
            .enqueue(
                INGRESS_QUEUE,
                "search-request",
                payload.clone(),
                EnqueueOptions {
                    saga_id: Some(saga_id),
                    correlation_id: Some(correlation_id),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = enqueue_result {
            self.policy.release(saga_id);
            return Err(e.into());
        }

        let event = Event::new(
            topics::INTENT,
            EventData::Intent {
                query: payload,
                revisions: request.revisions,
                client_ip: Some(request.client_ip),
            },
        )
        .with_saga(saga_id)
        .with_correlation(correlation_id)
        .with_source("coordinator");

        if let Err(e) = self.bus.publish(event).await {
            self.policy.release(saga_id);
            return Err(e.into());
        }

        info!(saga = %saga_id, correlation = %correlation_id, "request accepted");
        Ok(SubmitReceipt {
            saga_id,
            correlation_id,
            redacted_fields: report.redacted_fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBusConfig;
    use crate::policy::AdmissionConfig;
    use crate::queue_manager::QueueConfig;
    use crate::workflow::WorkflowConfig;
    use chrono::Utc;
    use serde_json::json;

    fn coordinator_parts(
        admission: AdmissionConfig,
    ) -> (Coordinator, Arc<QueueManager>, Arc<PolicyEngine>) {
        let bus = EventBus::new(EventBusConfig::default());
        let queues = QueueManager::new(vec![(
            INGRESS_QUEUE.to_string(),
            QueueConfig {
                max_size: 4,
                ..Default::default()
            },
        )]);
        let policy = PolicyEngine::new(admission, Default::default(), Default::default());
        let workflow = WorkflowOrchestrator::new(WorkflowConfig::default());
        let coordinator = Coordinator::new(
            bus,
            Arc::clone(&queues),
            Arc::clone(&policy),
            workflow,
        );
        (coordinator, queues, policy)
    }

    fn request(client_ip: &str) -> TravelRequest {
        TravelRequest {
            query: json!({
                "destination": "Lisbon",
                "consents": {"data_processing": true},
            }),
            revisions: vec![],
            client_ip: client_ip.to_string(),
            token: Some(format!("traveler:{}:u1", Utc::now().timestamp() + 600)),
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn test_submit_accepts_and_enqueues() {
        let (coordinator, queues, policy) = coordinator_parts(AdmissionConfig::default());
        let receipt = coordinator.submit(request("10.0.0.1")).await.unwrap();

        assert_eq!(queues.depth(INGRESS_QUEUE).await.unwrap(), 1);
        assert_eq!(policy.active_saga_count(), 1);
        assert!(receipt.redacted_fields.is_empty());
    }

    #[tokio::test]
    async fn test_submit_redacts_forbidden_fields() {
        let (coordinator, _queues, _policy) = coordinator_parts(AdmissionConfig::default());
        let mut req = request("10.0.0.1");
        req.query["passportNumber"] = json!("X123");
        let receipt = coordinator.submit(req).await.unwrap();
        assert_eq!(receipt.redacted_fields, vec!["passportNumber"]);
    }

    #[tokio::test]
    async fn test_submit_denied_by_rate_limit() {
        let (coordinator, _queues, policy) = coordinator_parts(AdmissionConfig {
            max_requests: 1,
            ..Default::default()
        });

        coordinator.submit(request("10.0.0.9")).await.unwrap();
        let result = coordinator.submit(request("10.0.0.9")).await;
        match result {
            Err(CoordinatorError::Rejected(reason)) => {
                assert_eq!(reason, "rate_limit_exceeded");
            }
            other => panic!("expected rejection, got {:?}", other.map(|r| r.saga_id)),
        }
        assert_eq!(policy.active_saga_count(), 1);
        assert_eq!(policy.violations_of_kind("admission_denied").len(), 1);
    }

    #[tokio::test]
    async fn test_queue_full_releases_admission() {
        let (coordinator, _queues, policy) = coordinator_parts(AdmissionConfig {
            max_queue_size: 100,
            max_requests: 100,
            max_per_client: 100,
            ..Default::default()
        });

        // Ingress queue capacity is 4.
        for _ in 0..4 {
            coordinator.submit(request("10.0.0.1")).await.unwrap();
        }
        let result = coordinator.submit(request("10.0.0.1")).await;
        assert!(matches!(result, Err(CoordinatorError::QueueError(_))));
        // The failed submit's admission slot was given back.
        assert_eq!(policy.active_saga_count(), 4);
    }
}
