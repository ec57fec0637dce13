//! End-to-end demo: wires the orchestration core, installs simulated
//! agents for every pipeline stage, submits one travel request, and prints
//! the saga's progress from the event history.
//!
//! Run with: cargo run --example pipeline_demo -p itinera-core

use async_trait::async_trait;
use chrono::Utc;
use itinera_core::{
    topics, CoreConfig, CoreContext, Event, EventData, EventHandler, HistoryFilter, TravelRequest,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Minimal agent: answers its task topic with the matching completion event.
struct StageAgent {
    name: String,
    bus: Arc<itinera_core::EventBus>,
    completion_topic: &'static str,
    make_data: fn() -> EventData,
}

#[async_trait]
impl EventHandler for StageAgent {
    async fn handle(&self, event: Event) -> Result<(), String> {
        let mut completion =
            Event::new(self.completion_topic, (self.make_data)()).with_source(self.name.clone());
        if let Some(saga_id) = event.saga_id {
            completion = completion.with_saga(saga_id);
        }
        if let Some(correlation_id) = event.correlation_id {
            completion = completion.with_correlation(correlation_id);
        }
        self.bus
            .publish(completion)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .compact()
        .init();

    let mut config = CoreConfig::default();
    config.state.persistence_root = std::env::temp_dir().join("itinera-demo-state");
    let context = CoreContext::build(config)?;
    context.start().await?;

    let agents: Vec<(&'static str, &'static str, fn() -> EventData)> = vec![
        ("candidate-generation", topics::CANDIDATES, || {
            EventData::Candidates {
                items: vec![json!({"id": "c1", "city": "Lisbon"})],
            }
        }),
        ("validation", topics::CONSTRAINTS, || EventData::Constraints {
            passed: true,
            violations: vec![],
        }),
        ("ranking", topics::SELECTION_PROP, || {
            EventData::SelectionProposal {
                candidate_ids: vec!["c1".to_string()],
                scores: vec![0.97],
            }
        }),
        ("selection", topics::SELECTION_CONF, || {
            EventData::SelectionConfirmation {
                candidate_id: "c1".to_string(),
            }
        }),
        ("enrichment", topics::AVAILABILITY, || EventData::Availability {
            results: vec![json!({"c1": "available"})],
        }),
        ("itinerary-build", topics::ITINERARY, || EventData::Itinerary {
            itinerary: json!({"days": 4, "city": "Lisbon"}),
        }),
        ("output-generation", topics::OUTPUT, || EventData::Output {
            document: json!({"format": "pdf", "pages": 3}),
        }),
    ];
    for (task_topic, completion, make_data) in agents {
        let agent = Arc::new(StageAgent {
            name: format!("agent-{}", task_topic),
            bus: Arc::clone(&context.bus),
            completion_topic: completion,
            make_data,
        });
        context
            .bus
            .subscribe(task_topic, agent, true)
            .map_err(|e| e.to_string())?;
    }

    let receipt = context
        .coordinator
        .submit(TravelRequest {
            query: json!({
                "destination": "Lisbon",
                "nights": 4,
                "consents": {"data_processing": true},
            }),
            revisions: vec![],
            client_ip: "127.0.0.1".to_string(),
            token: Some(format!("traveler:{}:demo", Utc::now().timestamp() + 600)),
            correlation_id: None,
        })
        .await
        .map_err(|e| e.to_string())?;
    println!("accepted: saga {}", receipt.saga_id);

    // Poll until the saga reports completion.
    for _ in 0..100 {
        let done = context.bus.history(&HistoryFilter {
            saga_id: Some(receipt.saga_id),
            event_type: Some(topics::WORKFLOW_COMPLETE.to_string()),
            ..Default::default()
        });
        if !done.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("\nevent trail for saga {}:", receipt.saga_id);
    let trail = context.bus.history(&HistoryFilter {
        saga_id: Some(receipt.saga_id),
        ..Default::default()
    });
    for event in trail {
        println!("  {}  {}", event.timestamp.format("%H:%M:%S%.3f"), event.event_type);
    }

    let stats = context.workflow.stats();
    println!(
        "\ncompleted={} failed={} avg_duration_ms={:.0}",
        stats.completed, stats.failed, stats.avg_duration_ms
    );

    context.shutdown().await;
    Ok(())
}
