/// Three-state circuit breakers guarding outbound service calls.
///
/// closed -> open on error rate above threshold or a slow call;
/// open -> half-open after the cooldown; half-open -> closed after enough
/// consecutive probe successes, back to open on a probe failure or probe
/// timeout. Callers consult `check` before making the call and report the
/// outcome afterwards.
use crate::errors::{PolicyError, PolicyResult};
use crate::events::{topics, Event, EventData};
use crate::traits::MessagePublisher;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Breaker configuration. The historical defaults (3% error rate, 5 s slow
/// call, 120 s cooldown, 15 s probe timeout) are preserved but overridable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_error_rate")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_slow_call_ms")]
    pub slow_call_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
}

fn default_error_rate() -> f64 {
    0.03
}

fn default_slow_call_ms() -> u64 {
    5_000
}

fn default_cooldown_ms() -> u64 {
    120_000
}

fn default_probe_timeout_ms() -> u64 {
    15_000
}

fn default_half_open_successes() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_rate_threshold: default_error_rate(),
            slow_call_ms: default_slow_call_ms(),
            cooldown_ms: default_cooldown_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            half_open_successes: default_half_open_successes(),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Per-service breaker bookkeeping.
#[derive(Debug, Clone)]
struct Breaker {
    state: BreakerState,
    failures: u64,
    successes: u64,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    probe_started_at: Option<DateTime<Utc>>,
    consecutive_probe_successes: u32,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            successes: 0,
            last_failure_at: None,
            opened_at: None,
            probe_started_at: None,
            consecutive_probe_successes: 0,
        }
    }

    fn error_rate(&self) -> f64 {
        let total = self.failures + self.successes;
        if total == 0 {
            0.0
        } else {
            self.failures as f64 / total as f64
        }
    }
}

/// Snapshot exposed to callers and monitors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: BreakerState,
    pub failures: u64,
    pub successes: u64,
    pub error_rate: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Registry of breakers, created lazily per service.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Breaker>,
    publisher: parking_lot::RwLock<Option<Arc<dyn MessagePublisher>>>,
    shutdown: CancellationToken,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            breakers: DashMap::new(),
            publisher: parking_lot::RwLock::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Wire in the bus publisher for open/close announcements.
    pub fn set_publisher(&self, publisher: Arc<dyn MessagePublisher>) {
        *self.publisher.write() = Some(publisher);
    }

    /// Consult the breaker before an outbound call. An open breaker past
    /// its cooldown moves to half-open and admits one probe.
    pub fn check(&self, service: &str) -> PolicyResult<()> {
        let now = Utc::now();
        let mut breaker = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(Breaker::new);

        match breaker.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled = breaker.opened_at.map_or(true, |at| {
                    (now - at).num_milliseconds() as u64 >= self.config.cooldown_ms
                });
                if cooled {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.consecutive_probe_successes = 0;
                    breaker.probe_started_at = Some(now);
                    info!(service, "circuit breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(PolicyError::CircuitOpen(service.to_string()))
                }
            }
            BreakerState::HalfOpen => {
                // One probe at a time; a probe that never reports within the
                // probe timeout reopens the breaker (handled by the monitor).
                match breaker.probe_started_at {
                    Some(_) => Err(PolicyError::CircuitOpen(service.to_string())),
                    None => {
                        breaker.probe_started_at = Some(now);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Report a completed call. Calls slower than the slow-call threshold
    /// count as failures even when they returned successfully.
    pub fn record_success(&self, service: &str, duration: Duration) {
        if duration.as_millis() as u64 > self.config.slow_call_ms {
            self.record_failure(service);
            return;
        }
        let mut breaker = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(Breaker::new);
        match breaker.state {
            BreakerState::Closed => {
                breaker.successes += 1;
            }
            BreakerState::HalfOpen => {
                breaker.probe_started_at = None;
                breaker.consecutive_probe_successes += 1;
                if breaker.consecutive_probe_successes >= self.config.half_open_successes {
                    breaker.state = BreakerState::Closed;
                    breaker.failures = 0;
                    breaker.successes = 0;
                    breaker.opened_at = None;
                    info!(service, "circuit breaker closed");
                    self.announce(topics::CIRCUIT_BREAKER_CLOSED, service);
                }
            }
            BreakerState::Open => {
                // Late report from before the trip; ignore.
            }
        }
    }

    /// Report a failed call.
    pub fn record_failure(&self, service: &str) {
        let now = Utc::now();
        let mut breaker = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(Breaker::new);
        breaker.last_failure_at = Some(now);
        match breaker.state {
            BreakerState::Closed => {
                breaker.failures += 1;
                if breaker.error_rate() > self.config.error_rate_threshold {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(now);
                    warn!(
                        service,
                        error_rate = breaker.error_rate(),
                        "circuit breaker opened"
                    );
                    self.announce(topics::CIRCUIT_BREAKER_OPENED, service);
                }
            }
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(now);
                breaker.probe_started_at = None;
                breaker.consecutive_probe_successes = 0;
                warn!(service, "probe failed, circuit breaker reopened");
                self.announce(topics::CIRCUIT_BREAKER_OPENED, service);
            }
            BreakerState::Open => {}
        }
    }

    /// Current state of a service's breaker.
    pub fn state(&self, service: &str) -> BreakerState {
        self.breakers
            .get(service)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Snapshot of every breaker.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                service: entry.key().clone(),
                state: entry.state,
                failures: entry.failures,
                successes: entry.successes,
                error_rate: entry.error_rate(),
                last_failure_at: entry.last_failure_at,
            })
            .collect()
    }

    /// One monitor pass: expire stuck half-open probes and surface
    /// cooled-down breakers.
    pub fn monitor_pass(&self) {
        let now = Utc::now();
        for mut entry in self.breakers.iter_mut() {
            if entry.state == BreakerState::HalfOpen {
                let timed_out = entry.probe_started_at.map_or(false, |at| {
                    (now - at).num_milliseconds() as u64 >= self.config.probe_timeout_ms
                });
                if timed_out {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(now);
                    entry.probe_started_at = None;
                    entry.consecutive_probe_successes = 0;
                    warn!(service = %entry.key(), "probe timed out, circuit breaker reopened");
                }
            }
        }
    }

    /// Spawn the periodic monitor task.
    pub fn spawn_monitor(self: &Arc<Self>, interval: Duration) {
        let registry = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.monitor_pass(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Stop the monitor task.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn announce(&self, topic: &'static str, service: &str) {
        let Some(publisher) = self.publisher.read().clone() else {
            return;
        };
        let event = Event::new(
            topic,
            EventData::Signal {
                detail: serde_json::json!({"service": service}),
            },
        )
        .with_source("policy");
        tokio::spawn(async move {
            let _ = publisher.publish_event(event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(config: CircuitBreakerConfig) -> Arc<CircuitBreakerRegistry> {
        CircuitBreakerRegistry::new(config)
    }

    #[test]
    fn test_exactly_threshold_does_not_open() {
        let breakers = registry(CircuitBreakerConfig::default());
        // 3 failures in 100 calls = exactly 3%.
        for _ in 0..97 {
            breakers.record_success("svc", Duration::from_millis(10));
        }
        for _ in 0..3 {
            breakers.record_failure("svc");
        }
        assert_eq!(breakers.state("svc"), BreakerState::Closed);

        // One more failure pushes the rate above 3%.
        breakers.record_failure("svc");
        assert_eq!(breakers.state("svc"), BreakerState::Open);
    }

    #[test]
    fn test_slow_call_counts_as_failure() {
        let breakers = registry(CircuitBreakerConfig {
            slow_call_ms: 50,
            ..Default::default()
        });
        breakers.record_success("svc", Duration::from_millis(100));
        // 1 failure / 1 call = 100% > 3%.
        assert_eq!(breakers.state("svc"), BreakerState::Open);
    }

    #[test]
    fn test_open_blocks_until_cooldown() {
        let breakers = registry(CircuitBreakerConfig {
            cooldown_ms: 60_000,
            ..Default::default()
        });
        breakers.record_failure("svc");
        assert_eq!(breakers.state("svc"), BreakerState::Open);
        assert!(matches!(
            breakers.check("svc"),
            Err(PolicyError::CircuitOpen(_))
        ));
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes() {
        let breakers = registry(CircuitBreakerConfig {
            cooldown_ms: 0,
            half_open_successes: 3,
            ..Default::default()
        });
        breakers.record_failure("svc");
        assert_eq!(breakers.state("svc"), BreakerState::Open);

        // Cooldown of zero: first check admits a probe.
        for _ in 0..3 {
            breakers.check("svc").unwrap();
            breakers.record_success("svc", Duration::from_millis(5));
        }
        assert_eq!(breakers.state("svc"), BreakerState::Closed);
        breakers.check("svc").unwrap();
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let breakers = registry(CircuitBreakerConfig {
            cooldown_ms: 0,
            ..Default::default()
        });
        breakers.record_failure("svc");
        breakers.check("svc").unwrap();
        assert_eq!(breakers.state("svc"), BreakerState::HalfOpen);
        breakers.record_failure("svc");
        assert_eq!(breakers.state("svc"), BreakerState::Open);
    }

    #[test]
    fn test_single_probe_at_a_time() {
        let breakers = registry(CircuitBreakerConfig {
            cooldown_ms: 0,
            ..Default::default()
        });
        breakers.record_failure("svc");
        breakers.check("svc").unwrap();
        assert!(breakers.check("svc").is_err());
    }

    #[test]
    fn test_probe_timeout_reopens_via_monitor() {
        let breakers = registry(CircuitBreakerConfig {
            cooldown_ms: 0,
            probe_timeout_ms: 0,
            ..Default::default()
        });
        breakers.record_failure("svc");
        breakers.check("svc").unwrap();
        assert_eq!(breakers.state("svc"), BreakerState::HalfOpen);
        breakers.monitor_pass();
        assert_eq!(breakers.state("svc"), BreakerState::Open);
    }

    #[test]
    fn test_unknown_service_is_closed() {
        let breakers = registry(CircuitBreakerConfig::default());
        assert_eq!(breakers.state("never-seen"), BreakerState::Closed);
        breakers.check("never-seen").unwrap();
    }
}
