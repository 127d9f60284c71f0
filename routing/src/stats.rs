//! Telemetry sink for routing decisions.
//!
//! Lock-free counters recorded on the routing hot path, plus snapshot
//! assembly for operational dashboards. Recording never blocks a routing
//! decision; snapshots join the counters with current circuit and budget
//! state.

use crate::budget::BudgetUsage;
use crate::circuit::CircuitSnapshot;
use crate::classifier::ComplexityTier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

fn tier_index(tier: ComplexityTier) -> usize {
    match tier {
        ComplexityTier::Trivial => 0,
        ComplexityTier::Low => 1,
        ComplexityTier::Moderate => 2,
        ComplexityTier::High => 3,
        ComplexityTier::Critical => 4,
    }
}

/// Atomic counters aggregated across all routing decisions.
#[derive(Debug, Default)]
pub struct RouterStats {
    tiers: [AtomicU64; 5],
    routed_total: AtomicU64,
    fallback_selections: AtomicU64,
    denied_all_circuits: AtomicU64,
    denied_budget: AtomicU64,
    outcomes_success: AtomicU64,
    outcomes_failure: AtomicU64,
    stale_outcome_reports: AtomicU64,
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful routing decision.
    pub fn record_decision(&self, tier: ComplexityTier, fallback_index: usize) {
        self.tiers[tier_index(tier)].fetch_add(1, Ordering::Relaxed);
        self.routed_total.fetch_add(1, Ordering::Relaxed);
        if fallback_index > 0 {
            self.fallback_selections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a denial where every candidate circuit was open.
    pub fn record_all_circuits_open(&self) {
        self.denied_all_circuits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a denial where the budget refused every surviving candidate.
    pub fn record_budget_exhausted(&self) {
        self.denied_budget.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed-call outcome report.
    pub fn record_outcome(&self, success: bool) {
        if success {
            self.outcomes_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.outcomes_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an outcome report for an unknown request id.
    pub fn record_stale_report(&self) {
        self.stale_outcome_reports.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    pub fn counters(&self) -> StatsCounters {
        let tier_distribution = ComplexityTier::all()
            .iter()
            .map(|&t| (t, self.tiers[tier_index(t)].load(Ordering::Relaxed)))
            .collect();
        StatsCounters {
            tier_distribution,
            routed_total: self.routed_total.load(Ordering::Relaxed),
            fallback_selections: self.fallback_selections.load(Ordering::Relaxed),
            denied_all_circuits: self.denied_all_circuits.load(Ordering::Relaxed),
            denied_budget: self.denied_budget.load(Ordering::Relaxed),
            outcomes_success: self.outcomes_success.load(Ordering::Relaxed),
            outcomes_failure: self.outcomes_failure.load(Ordering::Relaxed),
            stale_outcome_reports: self.stale_outcome_reports.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsCounters {
    pub tier_distribution: BTreeMap<ComplexityTier, u64>,
    pub routed_total: u64,
    pub fallback_selections: u64,
    pub denied_all_circuits: u64,
    pub denied_budget: u64,
    pub outcomes_success: u64,
    pub outcomes_failure: u64,
    pub stale_outcome_reports: u64,
}

/// Full operational snapshot returned by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStatsSnapshot {
    pub counters: StatsCounters,
    pub circuit_states: BTreeMap<String, CircuitSnapshot>,
    pub budget_usage: Vec<BudgetUsage>,
}

impl std::fmt::Display for StatsCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "routed={} fallbacks={} denied_circuits={} denied_budget={} stale={}",
            self.routed_total,
            self.fallback_selections,
            self.denied_all_circuits,
            self.denied_budget,
            self.stale_outcome_reports,
        )
    }
}
