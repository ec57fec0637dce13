/// Policy layer: admission control, compliance validation, business rules,
/// and the violation ledger. Circuit breakers live in `circuit_breaker` and
/// are reachable through the engine.
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::errors::{PolicyError, PolicyResult};
use crate::events::{topics, Event, EventData};
use crate::traits::MessagePublisher;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Ring buffer bound for the violation ledger.
const VIOLATION_LEDGER_CAPACITY: usize = 1000;

/// Admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Sliding-window request budget per client
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Sliding window width, ms
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Deny when the ingress queue is at or past this depth
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Deny when this many sagas are active
    #[serde(default = "default_max_concurrent_sagas")]
    pub max_concurrent_sagas: usize,
    /// Active saga cap per client
    #[serde(default = "default_max_per_client")]
    pub max_per_client: usize,
}

fn default_max_requests() -> u32 {
    30
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_queue_size() -> usize {
    400
}

fn default_max_concurrent_sagas() -> usize {
    100
}

fn default_max_per_client() -> usize {
    5
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            max_queue_size: default_max_queue_size(),
            max_concurrent_sagas: default_max_concurrent_sagas(),
            max_per_client: default_max_per_client(),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub approved: bool,
    pub reason: Option<String>,
}

impl AdmissionDecision {
    fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            approved: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// A recorded policy violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub id: Uuid,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// Compliance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    /// Fields that must never appear in payloads; redacted on sight
    #[serde(default = "default_forbidden_fields")]
    pub forbidden_fields: Vec<String>,
    /// Consent flags that must be present and boolean
    #[serde(default = "default_required_consents")]
    pub required_consents: Vec<String>,
    /// Retention ceiling per operation, days
    #[serde(default = "default_retention_limits")]
    pub retention_limits_days: HashMap<String, i64>,
    /// Roles allowed per operation; empty list admits any valid token
    #[serde(default)]
    pub allowed_roles: HashMap<String, Vec<String>>,
}

fn default_forbidden_fields() -> Vec<String> {
    ["ssn", "passportNumber", "creditCardNumber", "dateOfBirth"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_required_consents() -> Vec<String> {
    vec!["data_processing".to_string()]
}

fn default_retention_limits() -> HashMap<String, i64> {
    [("search", 30), ("booking", 365), ("analytics", 90)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            forbidden_fields: default_forbidden_fields(),
            required_consents: default_required_consents(),
            retention_limits_days: default_retention_limits(),
            allowed_roles: HashMap::new(),
        }
    }
}

/// Result of a compliance pass. Redaction proceeds even when violations are
/// reported, so the caller gets a usable payload either way.
#[derive(Debug, Clone, Default)]
pub struct ComplianceReport {
    pub redacted_fields: Vec<String>,
    pub violations: Vec<String>,
}

impl ComplianceReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// A named business rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "kebab-case")]
pub enum BusinessRule {
    /// Fail when |new - old| / old exceeds the threshold
    PriceDrift { threshold: f64 },
    /// Fail when the confidence score is below the floor
    ConfidenceFloor { min: f64 },
    /// Fail when elapsed time exceeds the budget
    TimeoutOverrun { budget_ms: u64 },
    /// Fail when the revision count exceeds the cap
    RevisionCap { max: u32 },
    /// Fail when the named license field is absent or empty
    LicensePresence { field: String },
}

impl BusinessRule {
    /// Evaluate the rule against its input shape.
    pub fn evaluate(&self, name: &str, input: &serde_json::Value) -> PolicyResult<()> {
        let fail = |detail: String| {
            Err(PolicyError::RuleFailed {
                rule: name.to_string(),
                detail,
            })
        };
        match self {
            BusinessRule::PriceDrift { threshold } => {
                let old = input.get("old_price").and_then(|v| v.as_f64());
                let new = input.get("new_price").and_then(|v| v.as_f64());
                match (old, new) {
                    (Some(old), Some(new)) if old != 0.0 => {
                        let drift = ((new - old) / old).abs();
                        if drift > *threshold {
                            fail(format!("price drift {:.2}% over threshold", drift * 100.0))
                        } else {
                            Ok(())
                        }
                    }
                    _ => fail("missing old_price/new_price".to_string()),
                }
            }
            BusinessRule::ConfidenceFloor { min } => {
                match input.get("confidence").and_then(|v| v.as_f64()) {
                    Some(score) if score >= *min => Ok(()),
                    Some(score) => fail(format!("confidence {} below floor {}", score, min)),
                    None => fail("missing confidence".to_string()),
                }
            }
            BusinessRule::TimeoutOverrun { budget_ms } => {
                match input.get("elapsed_ms").and_then(|v| v.as_u64()) {
                    Some(elapsed) if elapsed <= *budget_ms => Ok(()),
                    Some(elapsed) => {
                        fail(format!("elapsed {}ms over budget {}ms", elapsed, budget_ms))
                    }
                    None => fail("missing elapsed_ms".to_string()),
                }
            }
            BusinessRule::RevisionCap { max } => {
                match input.get("revision_count").and_then(|v| v.as_u64()) {
                    Some(count) if count <= u64::from(*max) => Ok(()),
                    Some(count) => fail(format!("revision count {} over cap {}", count, max)),
                    None => fail("missing revision_count".to_string()),
                }
            }
            BusinessRule::LicensePresence { field } => {
                match input.get(field.as_str()).and_then(|v| v.as_str()) {
                    Some(license) if !license.is_empty() => Ok(()),
                    _ => fail(format!("missing license field {}", field)),
                }
            }
        }
    }
}

/// An admitted saga.
#[derive(Debug, Clone)]
struct ActiveSaga {
    client_ip: String,
}

/// The policy engine.
pub struct PolicyEngine {
    admission: AdmissionConfig,
    compliance: ComplianceConfig,
    rules: DashMap<String, BusinessRule>,
    breakers: Arc<CircuitBreakerRegistry>,
    /// Per-client request timestamps for the sliding window
    windows: DashMap<String, VecDeque<Instant>>,
    active_sagas: DashMap<Uuid, ActiveSaga>,
    violations: parking_lot::Mutex<VecDeque<PolicyViolation>>,
    publisher: parking_lot::RwLock<Option<Arc<dyn MessagePublisher>>>,
}

impl PolicyEngine {
    pub fn new(
        admission: AdmissionConfig,
        compliance: ComplianceConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            admission,
            compliance,
            rules: DashMap::new(),
            breakers: CircuitBreakerRegistry::new(breaker_config),
            windows: DashMap::new(),
            active_sagas: DashMap::new(),
            violations: parking_lot::Mutex::new(VecDeque::with_capacity(
                VIOLATION_LEDGER_CAPACITY,
            )),
            publisher: parking_lot::RwLock::new(None),
        });
        engine.install_default_rules();
        engine
    }

    fn install_default_rules(&self) {
        self.register_rule("price-drift", BusinessRule::PriceDrift { threshold: 0.15 });
        self.register_rule("confidence-floor", BusinessRule::ConfidenceFloor { min: 0.5 });
        self.register_rule(
            "timeout-overrun",
            BusinessRule::TimeoutOverrun { budget_ms: 60_000 },
        );
        self.register_rule("revision-cap", BusinessRule::RevisionCap { max: 5 });
        self.register_rule(
            "license-presence",
            BusinessRule::LicensePresence {
                field: "license".to_string(),
            },
        );
    }

    /// Wire in the bus publisher. Also handed to the breaker registry.
    pub fn set_publisher(&self, publisher: Arc<dyn MessagePublisher>) {
        self.breakers.set_publisher(Arc::clone(&publisher));
        *self.publisher.write() = Some(publisher);
    }

    /// Circuit breakers for outbound calls.
    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Decide whether to admit a new saga. On approval the saga joins the
    /// active set and must be released on completion.
    pub fn admit(
        &self,
        saga_id: Uuid,
        client_ip: &str,
        queue_size: usize,
        active_sagas: usize,
    ) -> AdmissionDecision {
        let decision = self.evaluate_admission(client_ip, queue_size, active_sagas);

        if decision.approved {
            self.active_sagas.insert(
                saga_id,
                ActiveSaga {
                    client_ip: client_ip.to_string(),
                },
            );
            self.emit_signal(
                topics::ADMISSION_APPROVED,
                serde_json::json!({"saga_id": saga_id, "client_ip": client_ip}),
                Some(saga_id),
            );
        } else {
            let reason = decision.reason.clone().unwrap_or_default();
            self.record_violation(
                "admission_denied",
                serde_json::json!({
                    "saga_id": saga_id,
                    "client_ip": client_ip,
                    "reason": reason,
                }),
            );
            self.emit_signal(
                topics::ADMISSION_DENIED,
                serde_json::json!({"saga_id": saga_id, "reason": reason}),
                Some(saga_id),
            );
        }
        decision
    }

    fn evaluate_admission(
        &self,
        client_ip: &str,
        queue_size: usize,
        active_sagas: usize,
    ) -> AdmissionDecision {
        // Per-client sliding window.
        let now = Instant::now();
        let window = Duration::from_millis(self.admission.window_ms);
        {
            let mut timestamps = self.windows.entry(client_ip.to_string()).or_default();
            while timestamps
                .front()
                .map_or(false, |t| now.duration_since(*t) > window)
            {
                timestamps.pop_front();
            }
            if timestamps.len() >= self.admission.max_requests as usize {
                return AdmissionDecision::deny("rate_limit_exceeded");
            }
            timestamps.push_back(now);
        }

        // Per-client concurrency cap.
        let client_active = self
            .active_sagas
            .iter()
            .filter(|saga| saga.client_ip == client_ip)
            .count();
        if client_active >= self.admission.max_per_client {
            return AdmissionDecision::deny("client_concurrency_exceeded");
        }

        if queue_size >= self.admission.max_queue_size {
            return AdmissionDecision::deny("queue_depth_exceeded");
        }

        if active_sagas >= self.admission.max_concurrent_sagas {
            return AdmissionDecision::deny("resource_limit_exceeded");
        }

        AdmissionDecision::approve()
    }

    /// Release an admitted saga (workflow completion or failure).
    pub fn release(&self, saga_id: Uuid) -> bool {
        self.active_sagas.remove(&saga_id).is_some()
    }

    /// Number of sagas currently admitted.
    pub fn active_saga_count(&self) -> usize {
        self.active_sagas.len()
    }

    // ========================================================================
    // Compliance
    // ========================================================================

    /// Validate a payload for an operation: data minimization (redacting
    /// forbidden fields in place), consent flags, retention age, and token
    /// validity. Violations are recorded and reported; redaction proceeds
    /// regardless.
    pub fn validate_compliance(
        &self,
        payload: &mut serde_json::Value,
        operation: &str,
        token: Option<&str>,
    ) -> ComplianceReport {
        let mut report = ComplianceReport::default();

        // Data minimization.
        if let Some(map) = payload.as_object_mut() {
            for field in &self.compliance.forbidden_fields {
                if map.remove(field.as_str()).is_some() {
                    report.redacted_fields.push(field.clone());
                    report
                        .violations
                        .push(format!("forbidden field present: {}", field));
                }
            }
        }

        // Consent flags must be present and boolean.
        let consents = payload.get("consents");
        for flag in &self.compliance.required_consents {
            match consents.and_then(|c| c.get(flag.as_str())) {
                Some(value) if value.is_boolean() => {}
                Some(_) => report
                    .violations
                    .push(format!("consent flag not boolean: {}", flag)),
                None => report
                    .violations
                    .push(format!("missing consent flag: {}", flag)),
            }
        }

        // Retention ceiling.
        if let Some(limit) = self.compliance.retention_limits_days.get(operation) {
            if let Some(days) = payload.get("retention_days").and_then(|v| v.as_i64()) {
                if days > *limit {
                    report.violations.push(format!(
                        "retention {} days over limit {} for {}",
                        days, limit, operation
                    ));
                }
            }
        }

        // Token checks.
        if let Err(e) = self.validate_token(token, operation) {
            report.violations.push(e.to_string());
        }

        for violation in &report.violations {
            self.record_violation(
                "compliance",
                serde_json::json!({"operation": operation, "violation": violation}),
            );
        }
        report
    }

    /// Token format: `role:expiry-unix-seconds:subject`.
    fn validate_token(&self, token: Option<&str>, operation: &str) -> PolicyResult<()> {
        let token = token.ok_or_else(|| PolicyError::InvalidToken("missing token".to_string()))?;
        if token.is_empty() {
            return Err(PolicyError::InvalidToken("empty token".to_string()));
        }
        let parts: Vec<&str> = token.split(':').collect();
        if parts.len() != 3 {
            return Err(PolicyError::InvalidToken("malformed token".to_string()));
        }
        let role = parts[0];
        let expiry: i64 = parts[1]
            .parse()
            .map_err(|_| PolicyError::InvalidToken("unparseable expiry".to_string()))?;
        if expiry < Utc::now().timestamp() {
            return Err(PolicyError::InvalidToken("token expired".to_string()));
        }
        if let Some(roles) = self.compliance.allowed_roles.get(operation) {
            if !roles.is_empty() && !roles.iter().any(|r| r == role) {
                return Err(PolicyError::InvalidToken(format!(
                    "role {} not permitted for {}",
                    role, operation
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Business rules
    // ========================================================================

    /// Register (or replace) a named rule.
    pub fn register_rule(&self, name: &str, rule: BusinessRule) {
        self.rules.insert(name.to_string(), rule);
    }

    /// Evaluate a named rule. Failures are recorded in the ledger.
    pub fn check_rule(&self, name: &str, input: &serde_json::Value) -> PolicyResult<()> {
        let rule = self
            .rules
            .get(name)
            .ok_or_else(|| PolicyError::Internal(format!("unknown rule: {}", name)))?;
        match rule.evaluate(name, input) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_violation(
                    "business_rule",
                    serde_json::json!({"rule": name, "detail": e.to_string()}),
                );
                Err(e)
            }
        }
    }

    // ========================================================================
    // Violation ledger
    // ========================================================================

    /// Append to the bounded ledger and announce on the bus.
    pub fn record_violation(&self, kind: &str, details: serde_json::Value) -> Uuid {
        let violation = PolicyViolation {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            timestamp: Utc::now(),
            details: details.clone(),
        };
        let id = violation.id;
        {
            let mut ledger = self.violations.lock();
            if ledger.len() >= VIOLATION_LEDGER_CAPACITY {
                ledger.pop_front();
            }
            ledger.push_back(violation);
        }
        debug!(kind, "policy violation recorded");
        self.emit_signal(
            topics::POLICY_VIOLATION,
            serde_json::json!({"id": id, "kind": kind, "details": details}),
            None,
        );
        id
    }

    /// Recent violations, oldest first.
    pub fn violations(&self) -> Vec<PolicyViolation> {
        self.violations.lock().iter().cloned().collect()
    }

    /// Violations of one kind.
    pub fn violations_of_kind(&self, kind: &str) -> Vec<PolicyViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    fn emit_signal(
        &self,
        topic: &'static str,
        detail: serde_json::Value,
        saga_id: Option<Uuid>,
    ) {
        let Some(publisher) = self.publisher.read().clone() else {
            return;
        };
        let mut event = Event::new(topic, EventData::Signal { detail }).with_source("policy");
        if let Some(saga_id) = saga_id {
            event = event.with_saga(saga_id);
        }
        tokio::spawn(async move {
            if let Err(e) = publisher.publish_event(event).await {
                warn!(error = %e, "failed to publish policy event");
            }
        });
    }
}
