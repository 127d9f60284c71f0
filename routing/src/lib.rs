//! LLM Request Routing Core
//!
//! This library provides:
//! - Heuristic complexity classification of incoming tasks
//! - Profile-based routing tables mapping complexity tiers to model candidates
//! - Admission control with per-provider circuit breaking and budget governance
//!
//! # Features
//!
//! ## Classification
//! - `ComplexityClassifier`: weighted scoring of free text plus context signals
//! - `TierIntervals`: configurable score-to-tier partition, validated at startup
//!
//! ## Routing
//! - `RoutingTable`: (tier, profile) lookup with configuration-gap fallback
//! - `SubagentAliasResolver`: relative capability aliases for child tasks
//!
//! ## Admission
//! - `CircuitBreakerRegistry`: per-provider closed/open/half-open circuits with
//!   a single-trial recovery slot
//! - `BudgetGovernor`: reserve/commit accounting against session, UTC-day, and
//!   user ceilings
//! - `FallbackDispatcher`: walks a tier's candidate row and admits the first
//!   candidate that clears both gates
//!
//! ## Telemetry
//! - `RouterStats`: lock-free counters plus joined operational snapshots
//!
//! # Usage
//!
//! ```
//! use routing::{FallbackDispatcher, RequestContext, RouterConfig};
//!
//! let dispatcher = FallbackDispatcher::new(RouterConfig::default()).unwrap();
//! let ctx = RequestContext::new("session-1", "user-1");
//!
//! let decision = dispatcher.route("summarize this document", &ctx).unwrap();
//! // ... call decision.chosen, then settle:
//! dispatcher.report_outcome(decision.request_id, &decision.chosen.provider_id, true, 0.004);
//! ```

pub mod aliases;
pub mod budget;
pub mod circuit;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod stats;
pub mod table;

// Re-export key classifier types
pub use classifier::{
    Classification, ComplexityClassifier, ComplexityTier, ContextSignals, TierInterval,
    TierIntervals, Urgency,
};

// Re-export key table types
pub use table::{ModelCandidate, ProfileRows, RoutingProfile, RoutingTable};

// Re-export key alias types
pub use aliases::{alias_tier, CapabilityAlias, SubagentAliasMap, SubagentAliasResolver};

// Re-export key circuit types
pub use circuit::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitDecision, CircuitSnapshot, CircuitState,
};

// Re-export key budget types
pub use budget::{
    micro_to_usd, usd_to_micro, BudgetGovernor, BudgetLimits, BudgetScope, BudgetUsage, ScopeKey,
};

// Re-export key dispatcher types
pub use dispatcher::{DenialReason, FallbackDispatcher, RequestContext, RoutingDecision};

// Re-export key config types
pub use config::{BudgetSettings, CircuitSettings, ConfigError, RouterConfig};

// Re-export telemetry types
pub use stats::{RouterStats, RouterStatsSnapshot, StatsCounters};
