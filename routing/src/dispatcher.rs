//! Request admission and model selection.
//!
//! The dispatcher walks a tier's candidate row in preference order and
//! admits the first candidate that clears both gates: the provider's
//! circuit permits a call, and every budget scope can absorb the estimated
//! cost. The reservation is held until the caller reports the call's
//! outcome, which settles the budget and feeds the circuit breaker.
//!
//! Selection itself never performs I/O and never blocks on anything but
//! the registry and ledger locks.

use crate::aliases::{SubagentAliasMap, SubagentAliasResolver};
use crate::budget::{micro_to_usd, usd_to_micro, BudgetGovernor, ScopeKey};
use crate::circuit::{CircuitBreakerRegistry, CircuitDecision};
use crate::classifier::{ComplexityClassifier, ComplexityTier, ContextSignals};
use crate::config::{ConfigError, RouterConfig};
use crate::stats::{RouterStats, RouterStatsSnapshot};
use crate::table::{ModelCandidate, RoutingProfile, RoutingTable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Caller identity and context signals accompanying one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub signals: ContextSignals,
}

impl RequestContext {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            signals: ContextSignals::default(),
        }
    }

    pub fn with_signals(mut self, signals: ContextSignals) -> Self {
        self.signals = signals;
        self
    }
}

/// An admitted request: which model to call and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Settlement handle; pass back to
    /// [`FallbackDispatcher::report_outcome`].
    pub request_id: Uuid,
    pub score: u32,
    pub tier: ComplexityTier,
    pub profile: RoutingProfile,
    pub chosen: ModelCandidate,
    /// Position in the candidate row; 0 means the primary was admitted.
    pub fallback_index: usize,
    /// Reserved against the budget until the outcome settles it.
    pub estimated_cost_usd: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Why no candidate in the row could be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DenialReason {
    /// Every candidate's provider circuit refused the call.
    #[error("all candidate provider circuits are open")]
    AllCircuitsOpen,
    /// At least one provider was callable but no budget scope could absorb
    /// the estimated cost.
    #[error("budget exhausted for every callable candidate")]
    BudgetExhausted,
}

#[derive(Debug)]
struct InFlight {
    provider_id: String,
}

/// The routing core: classifier, table, circuits, budget, and telemetry
/// behind one admission call.
#[derive(Debug)]
pub struct FallbackDispatcher {
    classifier: ComplexityClassifier,
    table: RoutingTable,
    profile: RoutingProfile,
    circuits: Arc<CircuitBreakerRegistry>,
    budget: Arc<BudgetGovernor>,
    stats: Arc<RouterStats>,
    base_call_cost_micro: u64,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
}

impl FallbackDispatcher {
    /// Build a dispatcher owning its own circuit registry and budget
    /// governor. Fails on invalid configuration.
    pub fn new(config: RouterConfig) -> Result<Self, ConfigError> {
        let circuits = Arc::new(CircuitBreakerRegistry::new(config.circuit_config()));
        let budget = Arc::new(BudgetGovernor::new(config.budget_limits()));
        Self::with_shared(config, circuits, budget)
    }

    /// Build a dispatcher over externally owned circuit and budget state,
    /// so several dispatchers (e.g. per-tenant profiles) share provider
    /// health and spend accounting.
    pub fn with_shared(
        config: RouterConfig,
        circuits: Arc<CircuitBreakerRegistry>,
        budget: Arc<BudgetGovernor>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let base_call_cost_micro = config.base_call_cost_micro();
        Ok(Self {
            classifier: ComplexityClassifier::new(config.tiers.clone()),
            table: RoutingTable::new(config.tables),
            profile: config.profile,
            circuits,
            budget,
            stats: Arc::new(RouterStats::new()),
            base_call_cost_micro,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn profile(&self) -> RoutingProfile {
        self.profile
    }

    pub fn circuits(&self) -> &CircuitBreakerRegistry {
        &self.circuits
    }

    pub fn budget(&self) -> &BudgetGovernor {
        &self.budget
    }

    /// Admit a request under the configured profile.
    pub fn route(
        &self,
        description: &str,
        ctx: &RequestContext,
    ) -> Result<RoutingDecision, DenialReason> {
        self.route_with_profile(description, ctx, self.profile)
    }

    /// Admit a request under an explicit profile override.
    pub fn route_with_profile(
        &self,
        description: &str,
        ctx: &RequestContext,
        profile: RoutingProfile,
    ) -> Result<RoutingDecision, DenialReason> {
        let classification = self.classifier.classify(description, &ctx.signals);
        let tier = classification.tier;
        let row = self.table.resolve(tier, profile);
        let request_id = Uuid::new_v4();
        let scope_keys = [
            ScopeKey::session(&ctx.session_id),
            ScopeKey::day(&ctx.user_id),
            ScopeKey::user(&ctx.user_id),
        ];

        let mut budget_skips = 0usize;
        for (index, candidate) in row.iter().enumerate() {
            let decision = self.circuits.acquire(&candidate.provider_id);
            if decision == CircuitDecision::Denied {
                debug!(
                    %candidate,
                    "candidate skipped, provider circuit open"
                );
                continue;
            }

            let estimated_micro =
                (self.base_call_cost_micro as f64 * candidate.relative_cost) as u64;
            if !self
                .budget
                .check_and_reserve(request_id, &scope_keys, estimated_micro)
            {
                // Do not strand a claimed trial slot on a call that will
                // never happen.
                if decision == CircuitDecision::Trial {
                    self.circuits.release_trial(&candidate.provider_id);
                }
                debug!(%candidate, "candidate skipped, budget denied");
                budget_skips += 1;
                continue;
            }

            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            in_flight.insert(
                request_id,
                InFlight {
                    provider_id: candidate.provider_id.clone(),
                },
            );
            drop(in_flight);

            self.stats.record_decision(tier, index);
            let reason = if index == 0 {
                format!("score {} placed the task in tier {}", classification.score, tier)
            } else {
                format!(
                    "score {} placed the task in tier {}; {} earlier candidate(s) unavailable",
                    classification.score, tier, index
                )
            };
            info!(
                %request_id,
                %tier,
                %profile,
                chosen = %candidate,
                fallback_index = index,
                trial = decision == CircuitDecision::Trial,
                "request admitted"
            );
            return Ok(RoutingDecision {
                request_id,
                score: classification.score,
                tier,
                profile,
                chosen: candidate.clone(),
                fallback_index: index,
                estimated_cost_usd: micro_to_usd(estimated_micro),
                reason,
                timestamp: Utc::now(),
            });
        }

        // An empty row only happens for an unvalidated table; it reads as
        // every circuit being open.
        if budget_skips > 0 {
            self.stats.record_budget_exhausted();
            warn!(%tier, %profile, "request denied, budget exhausted");
            Err(DenialReason::BudgetExhausted)
        } else {
            self.stats.record_all_circuits_open();
            warn!(%tier, %profile, "request denied, all candidate circuits open");
            Err(DenialReason::AllCircuitsOpen)
        }
    }

    /// Settle an admitted request with the outcome of the provider call.
    ///
    /// Success commits the actual cost and heals the provider's circuit.
    /// Failure counts against the circuit and still commits any cost the
    /// failed call incurred; the reservation is released only when nothing
    /// was billed.
    /// Unknown or already-settled request ids are counted and ignored. The
    /// admitted candidate's provider is authoritative; a `provider_id` that
    /// disagrees with it is logged and the admitted one is settled.
    pub fn report_outcome(
        &self,
        request_id: Uuid,
        provider_id: &str,
        success: bool,
        actual_cost_usd: f64,
    ) {
        let entry = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            in_flight.remove(&request_id)
        };
        let Some(entry) = entry else {
            warn!(%request_id, provider = provider_id, "outcome reported for unknown request");
            self.stats.record_stale_report();
            return;
        };
        if entry.provider_id != provider_id {
            warn!(
                %request_id,
                reported = provider_id,
                admitted = %entry.provider_id,
                "outcome names a different provider than the admitted candidate"
            );
        }

        self.stats.record_outcome(success);
        if success {
            self.circuits.report_success(&entry.provider_id);
            self.budget
                .commit_actual(request_id, usd_to_micro(actual_cost_usd));
        } else {
            self.circuits.report_failure(&entry.provider_id);
            // Failed calls can still bill (e.g. a timeout after tokens
            // streamed); charge whatever was incurred.
            let actual_micro = usd_to_micro(actual_cost_usd);
            if actual_micro > 0 {
                self.budget.commit_actual(request_id, actual_micro);
            } else {
                self.budget.release_reservation(request_id);
            }
        }
    }

    /// Concrete model ids for the child-task capability aliases of an
    /// admitted parent request.
    pub fn subagent_aliases(
        &self,
        parent_tier: ComplexityTier,
        parent_choice: &ModelCandidate,
    ) -> SubagentAliasMap {
        SubagentAliasResolver::new(&self.table, self.profile)
            .resolve_aliases(parent_tier, parent_choice)
    }

    /// Drop a session's budget ledger once the session ends.
    pub fn end_session(&self, session_id: &str) {
        self.budget.end_session(session_id);
    }

    /// Operator escape hatch; see [`CircuitBreakerRegistry::reset`].
    pub fn reset_circuit(&self, provider_id: Option<&str>) {
        self.circuits.reset(provider_id);
    }

    /// Full operational snapshot: counters, circuit states, budget usage.
    pub fn stats_snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            counters: self.stats.counters(),
            circuit_states: self.circuits.snapshot(),
            budget_usage: self.budget.usage(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetScope;
    use crate::circuit::{CircuitBreakerConfig, CircuitState};
    use std::time::Duration;

    fn dispatcher_with(mutate: impl FnOnce(&mut RouterConfig)) -> FallbackDispatcher {
        let mut config = RouterConfig::default();
        mutate(&mut config);
        FallbackDispatcher::new(config).unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext::new("s1", "u1")
    }

    fn trip(d: &FallbackDispatcher, provider: &str) {
        let threshold = d.circuits().config().failure_threshold;
        for _ in 0..threshold {
            d.circuits().report_failure(provider);
        }
    }

    #[test]
    fn test_trivial_request_takes_primary() {
        let d = dispatcher_with(|_| {});
        let decision = d.route("hi", &ctx()).unwrap();
        assert_eq!(decision.tier, ComplexityTier::Trivial);
        assert_eq!(decision.fallback_index, 0);
        assert_eq!(decision.chosen.model_id, "claude-haiku-4-5");
        assert!(decision.estimated_cost_usd > 0.0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RouterConfig::default();
        config.tables.clear();
        assert!(FallbackDispatcher::new(config).is_err());
    }

    #[test]
    fn test_open_circuit_falls_through_to_next_provider() {
        let d = dispatcher_with(|c| c.circuit.failure_threshold = 1);
        trip(&d, "anthropic");
        let decision = d.route("hi", &ctx()).unwrap();
        assert_eq!(decision.fallback_index, 1);
        assert_eq!(decision.chosen.provider_id, "google");
        let counters = d.stats_snapshot().counters;
        assert_eq!(counters.fallback_selections, 1);
    }

    #[test]
    fn test_all_circuits_open_denial() {
        let d = dispatcher_with(|c| c.circuit.failure_threshold = 1);
        trip(&d, "anthropic");
        trip(&d, "google");
        let err = d.route("hi", &ctx()).unwrap_err();
        assert_eq!(err, DenialReason::AllCircuitsOpen);
        assert_eq!(d.stats_snapshot().counters.denied_all_circuits, 1);
    }

    #[test]
    fn test_budget_exhaustion_denial() {
        let d = dispatcher_with(|c| c.budget.session_limit_usd = Some(0.000_001));
        let err = d.route("hi", &ctx()).unwrap_err();
        assert_eq!(err, DenialReason::BudgetExhausted);
        assert_eq!(d.stats_snapshot().counters.denied_budget, 1);
    }

    #[test]
    fn test_budget_denial_outranks_circuit_denial() {
        // One provider is down, the other is callable but unaffordable; the
        // caller should hear about money, not health.
        let d = dispatcher_with(|c| {
            c.circuit.failure_threshold = 1;
            c.budget.session_limit_usd = Some(0.000_001);
        });
        trip(&d, "anthropic");
        let err = d.route("hi", &ctx()).unwrap_err();
        assert_eq!(err, DenialReason::BudgetExhausted);
    }

    #[test]
    fn test_success_outcome_commits_actual_cost() {
        let d = dispatcher_with(|_| {});
        let decision = d.route("hi", &ctx()).unwrap();
        d.report_outcome(decision.request_id, &decision.chosen.provider_id, true, 0.003);

        let usage = d.stats_snapshot().budget_usage;
        let session = usage
            .iter()
            .find(|u| u.scope == BudgetScope::Session)
            .unwrap();
        assert_eq!(session.committed_micro, usd_to_micro(0.003));
        assert_eq!(session.reserved_micro, 0);
        assert_eq!(d.circuits().state_of("anthropic"), CircuitState::Closed);
        assert_eq!(d.stats_snapshot().counters.outcomes_success, 1);
    }

    #[test]
    fn test_failure_outcome_releases_reservation_and_counts() {
        let d = dispatcher_with(|_| {});
        let decision = d.route("hi", &ctx()).unwrap();
        d.report_outcome(decision.request_id, &decision.chosen.provider_id, false, 0.0);

        let usage = d.stats_snapshot().budget_usage;
        let session = usage
            .iter()
            .find(|u| u.scope == BudgetScope::Session)
            .unwrap();
        assert_eq!(session.committed_micro, 0);
        assert_eq!(session.reserved_micro, 0);
        assert_eq!(d.circuits().failure_count("anthropic"), 1);
        assert_eq!(d.stats_snapshot().counters.outcomes_failure, 1);
    }

    #[test]
    fn test_failed_but_billed_outcome_still_charges_budget() {
        // A timeout after tokens streamed fails the call but bills anyway;
        // that spend must count against the ceilings.
        let d = dispatcher_with(|_| {});
        let decision = d.route("hi", &ctx()).unwrap();
        d.report_outcome(decision.request_id, &decision.chosen.provider_id, false, 0.005);

        let usage = d.stats_snapshot().budget_usage;
        let session = usage
            .iter()
            .find(|u| u.scope == BudgetScope::Session)
            .unwrap();
        assert_eq!(session.committed_micro, usd_to_micro(0.005));
        assert_eq!(session.reserved_micro, 0);
        assert_eq!(d.circuits().failure_count("anthropic"), 1);
    }

    #[test]
    fn test_duplicate_outcome_is_stale() {
        let d = dispatcher_with(|_| {});
        let decision = d.route("hi", &ctx()).unwrap();
        d.report_outcome(decision.request_id, &decision.chosen.provider_id, true, 0.003);
        d.report_outcome(decision.request_id, &decision.chosen.provider_id, true, 0.003);
        assert_eq!(d.stats_snapshot().counters.stale_outcome_reports, 1);
    }

    #[test]
    fn test_unknown_outcome_is_stale() {
        let d = dispatcher_with(|_| {});
        d.report_outcome(Uuid::new_v4(), "anthropic", true, 1.0);
        assert_eq!(d.stats_snapshot().counters.stale_outcome_reports, 1);
    }

    #[test]
    fn test_trial_slot_released_on_budget_denial() {
        let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
        }));
        let mut config = RouterConfig::default();
        config.budget.session_limit_usd = Some(0.000_001);
        let budget = Arc::new(BudgetGovernor::new(config.budget_limits()));
        let d = FallbackDispatcher::with_shared(config, Arc::clone(&circuits), budget).unwrap();

        circuits.report_failure("anthropic");
        circuits.report_failure("google");
        std::thread::sleep(Duration::from_millis(30));

        // Both circuits are half-open; budget denies both trials. The slots
        // must come back so later requests can still probe.
        let err = d.route("hi", &ctx()).unwrap_err();
        assert_eq!(err, DenialReason::BudgetExhausted);
        assert_eq!(circuits.acquire("anthropic"), CircuitDecision::Trial);
        assert_eq!(circuits.acquire("google"), CircuitDecision::Trial);
    }

    #[test]
    fn test_trial_success_closes_circuit_through_outcome() {
        let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
        }));
        let config = RouterConfig::default();
        let budget = Arc::new(BudgetGovernor::new(config.budget_limits()));
        let d = FallbackDispatcher::with_shared(config, Arc::clone(&circuits), budget).unwrap();

        circuits.report_failure("anthropic");
        std::thread::sleep(Duration::from_millis(30));

        let decision = d.route("hi", &ctx()).unwrap();
        assert_eq!(decision.chosen.provider_id, "anthropic");
        d.report_outcome(decision.request_id, "anthropic", true, 0.002);
        assert_eq!(circuits.state_of("anthropic"), CircuitState::Closed);
    }

    #[test]
    fn test_profile_override() {
        let d = dispatcher_with(|_| {});
        let decision = d
            .route_with_profile("hi", &ctx(), RoutingProfile::CostOptimised)
            .unwrap();
        assert_eq!(decision.profile, RoutingProfile::CostOptimised);
        assert_eq!(decision.chosen.provider_id, "deepseek");
    }

    #[test]
    fn test_heavy_request_lands_in_higher_tier() {
        let d = dispatcher_with(|_| {});
        let decision = d
            .route(
                "first analyze the failing integration, then design a \
                 migration plan, then refactor the pipeline step by step \
                 and finally debug the remaining workflow issues",
                &ctx(),
            )
            .unwrap();
        assert!(decision.tier >= ComplexityTier::High);
        assert_eq!(decision.chosen.provider_id, "anthropic");
    }

    #[test]
    fn test_end_session_resets_spend_window() {
        let d = dispatcher_with(|c| c.budget.session_limit_usd = Some(0.005));
        let first = d.route("hi", &ctx()).unwrap();
        d.report_outcome(first.request_id, &first.chosen.provider_id, true, 0.005);
        assert!(d.route("hi", &ctx()).is_err());

        d.end_session("s1");
        assert!(d.route("hi", &ctx()).is_ok());
    }

    #[test]
    fn test_subagent_aliases_from_dispatcher() {
        let d = dispatcher_with(|_| {});
        let decision = d.route("hi", &ctx()).unwrap();
        let map = d.subagent_aliases(decision.tier, &decision.chosen);
        assert_eq!(map.inherit, decision.chosen.model_id);
        assert!(!map.opus.is_empty());
    }

    #[test]
    fn test_reset_circuit_restores_routing() {
        let d = dispatcher_with(|c| c.circuit.failure_threshold = 1);
        trip(&d, "anthropic");
        trip(&d, "google");
        assert!(d.route("hi", &ctx()).is_err());
        d.reset_circuit(None);
        let decision = d.route("hi", &ctx()).unwrap();
        assert_eq!(decision.fallback_index, 0);
    }
}
