//! Per-provider circuit breaking.
//!
//! Each provider has its own circuit guarded by its own lock, so one
//! provider's failures never serialize requests touching other providers.
//!
//! # State machine
//!
//! ```text
//! Closed ──(threshold consecutive failures)──► Open
//!   ▲                                            │
//!   └──(trial success)──── HalfOpen ◄──(recovery_timeout elapsed)──┘
//!                              │
//!                              └──(trial failure)──► Open (window restarts)
//! ```
//!
//! Open → HalfOpen is never an explicit transition event: it is computed
//! lazily from `(opened_at, now)` on every query, so there is no background
//! timer. While half-open, exactly one caller may claim the trial slot;
//! everyone else sees the provider as still open until the trial resolves.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Observable health state of a provider circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy — calls permitted.
    Closed,
    /// Tripped — calls denied until the recovery timeout elapses.
    Open,
    /// Recovery window reached — one trial call permitted.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Outcome of asking the registry for permission to call a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Circuit closed — call freely.
    Allowed,
    /// Circuit half-open and this caller won the single trial slot.
    Trial,
    /// Circuit open, or the trial slot is already taken.
    Denied,
}

/// Circuit breaker tuning, shared by all providers in a registry.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before permitting a trial.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    consecutive_failures: u32,
    tripped: bool,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_failure_at: Option<Instant>,
}

impl CircuitInner {
    fn fresh() -> Self {
        Self {
            consecutive_failures: 0,
            tripped: false,
            opened_at: None,
            trial_in_flight: false,
            last_failure_at: None,
        }
    }

    /// Pure function of (tripped, opened_at, now).
    fn state(&self, timeout: Duration) -> CircuitState {
        if !self.tripped {
            return CircuitState::Closed;
        }
        match self.opened_at {
            Some(at) if at.elapsed() >= timeout => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

/// One provider's circuit. Owned by the registry; mutated only through it.
#[derive(Debug)]
struct ProviderCircuit {
    provider_id: String,
    inner: Mutex<CircuitInner>,
}

impl ProviderCircuit {
    fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            inner: Mutex::new(CircuitInner::fresh()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        // A poisoned circuit lock only means a panic elsewhere mid-update;
        // the counters are still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Point-in-time view of one circuit, for operational dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub seconds_since_last_failure: Option<u64>,
}

/// Registry of per-provider circuits.
///
/// Circuits are created lazily on first reference and live for the process
/// lifetime. The outer map lock is held only to fetch a circuit handle; all
/// state changes happen under the individual circuit's lock.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    circuits: RwLock<HashMap<String, Arc<ProviderCircuit>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuit(&self, provider_id: &str) -> Arc<ProviderCircuit> {
        if let Ok(map) = self.circuits.read() {
            if let Some(c) = map.get(provider_id) {
                return Arc::clone(c);
            }
        }
        let mut map = self
            .circuits
            .write()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(provider_id.to_string())
                .or_insert_with(|| Arc::new(ProviderCircuit::new(provider_id))),
        )
    }

    /// Non-claiming eligibility query.
    ///
    /// True when the circuit is closed, or half-open with the trial slot
    /// still free. Does not take the trial slot; dispatchers use
    /// [`CircuitBreakerRegistry::acquire`] for that.
    pub fn is_eligible(&self, provider_id: &str) -> bool {
        let circuit = self.circuit(provider_id);
        let inner = circuit.lock();
        match inner.state(self.config.recovery_timeout) {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !inner.trial_in_flight,
            CircuitState::Open => false,
        }
    }

    /// Claiming eligibility check.
    ///
    /// When the circuit is half-open, at most one concurrent caller receives
    /// [`CircuitDecision::Trial`]; the slot is claimed under the circuit
    /// lock, so racing callers are denied as still-open.
    pub fn acquire(&self, provider_id: &str) -> CircuitDecision {
        let circuit = self.circuit(provider_id);
        let mut inner = circuit.lock();
        match inner.state(self.config.recovery_timeout) {
            CircuitState::Closed => CircuitDecision::Allowed,
            CircuitState::Open => CircuitDecision::Denied,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    CircuitDecision::Denied
                } else {
                    inner.trial_in_flight = true;
                    info!(provider = %circuit.provider_id, "circuit half-open, permitting trial call");
                    CircuitDecision::Trial
                }
            }
        }
    }

    /// Return a claimed trial slot without an outcome.
    ///
    /// Used when a trial candidate is selected and then rejected before any
    /// call happens (e.g. budget denial), so the next caller can probe
    /// instead of waiting out a window that nothing is testing.
    pub fn release_trial(&self, provider_id: &str) {
        let circuit = self.circuit(provider_id);
        let mut inner = circuit.lock();
        inner.trial_in_flight = false;
    }

    /// Record a successful call to a provider.
    pub fn report_success(&self, provider_id: &str) {
        let circuit = self.circuit(provider_id);
        let mut inner = circuit.lock();
        if inner.tripped {
            if inner.trial_in_flight {
                info!(provider = %circuit.provider_id, "trial succeeded, circuit closed");
                *inner = CircuitInner::fresh();
            }
            // Success reported while open with no trial claimed: a straggler
            // from before the trip. The circuit stays as it is.
        } else {
            inner.consecutive_failures = 0;
        }
    }

    /// Record a failed call to a provider.
    pub fn report_failure(&self, provider_id: &str) {
        let circuit = self.circuit(provider_id);
        let mut inner = circuit.lock();
        let now = Instant::now();
        inner.last_failure_at = Some(now);
        if inner.tripped {
            if inner.trial_in_flight {
                warn!(provider = %circuit.provider_id, "trial failed, circuit reopened");
                inner.trial_in_flight = false;
                inner.opened_at = Some(now);
            }
        } else {
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.config.failure_threshold {
                warn!(
                    provider = %circuit.provider_id,
                    failures = inner.consecutive_failures,
                    "failure threshold reached, circuit opened"
                );
                inner.tripped = true;
                inner.opened_at = Some(now);
            }
        }
    }

    /// Operator escape hatch: clear one circuit, or all of them.
    ///
    /// Bypasses normal transition rules; intended for incident recovery.
    pub fn reset(&self, provider_id: Option<&str>) {
        match provider_id {
            Some(id) => {
                let circuit = self.circuit(id);
                let mut inner = circuit.lock();
                *inner = CircuitInner::fresh();
                info!(provider = %id, "circuit manually reset");
            }
            None => {
                let map = self
                    .circuits
                    .read()
                    .unwrap_or_else(|e| e.into_inner());
                for circuit in map.values() {
                    let mut inner = circuit.lock();
                    *inner = CircuitInner::fresh();
                }
                info!("all circuits manually reset");
            }
        }
    }

    /// Current state of one provider's circuit.
    pub fn state_of(&self, provider_id: &str) -> CircuitState {
        let circuit = self.circuit(provider_id);
        let inner = circuit.lock();
        inner.state(self.config.recovery_timeout)
    }

    /// Consecutive failures recorded for a provider.
    pub fn failure_count(&self, provider_id: &str) -> u32 {
        let circuit = self.circuit(provider_id);
        let inner = circuit.lock();
        inner.consecutive_failures
    }

    /// Snapshot of every known circuit, keyed by provider id.
    pub fn snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        let map = self
            .circuits
            .read()
            .unwrap_or_else(|e| e.into_inner());
        map.iter()
            .map(|(id, circuit)| {
                let inner = circuit.lock();
                (
                    id.clone(),
                    CircuitSnapshot {
                        state: inner.state(self.config.recovery_timeout),
                        consecutive_failures: inner.consecutive_failures,
                        seconds_since_last_failure: inner
                            .last_failure_at
                            .map(|t| t.elapsed().as_secs()),
                    },
                )
            })
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
