//! Routing table: (tier, profile) → ordered model candidates.
//!
//! A profile selects a row-set; a tier selects a row; a row is an ordered
//! preference list where the first entry is the intended model and later
//! entries are explicit fallbacks, drawn from different providers where
//! possible so one provider outage rarely exhausts the whole row.
//!
//! Lookup never returns an empty list for a configured profile: a missing
//! (tier, profile) row falls back to the profile's `moderate` row, then to
//! the profile's default row, logging a configuration-gap warning.

use crate::classifier::ComplexityTier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Named cost/quality strategy. Loaded from configuration at process start;
/// an unknown profile name fails TOML parsing rather than routing silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingProfile {
    AnthropicOnly,
    QualityFirst,
    Balanced,
    CostOptimised,
    MultiProvider,
    AutoRouter,
}

impl RoutingProfile {
    /// All profiles the table must cover.
    pub fn all() -> &'static [RoutingProfile] {
        &[
            Self::AnthropicOnly,
            Self::QualityFirst,
            Self::Balanced,
            Self::CostOptimised,
            Self::MultiProvider,
            Self::AutoRouter,
        ]
    }
}

impl std::fmt::Display for RoutingProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AnthropicOnly => write!(f, "anthropic_only"),
            Self::QualityFirst => write!(f, "quality_first"),
            Self::Balanced => write!(f, "balanced"),
            Self::CostOptimised => write!(f, "cost_optimised"),
            Self::MultiProvider => write!(f, "multi_provider"),
            Self::AutoRouter => write!(f, "auto_router"),
        }
    }
}

/// An immutable (model, provider) pair eligible for a tier/profile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub model_id: String,
    pub provider_id: String,
    /// Cost multiplier relative to the configured base call cost.
    pub relative_cost: f64,
    #[serde(default)]
    pub supports_enhanced_tool_calling: bool,
}

impl ModelCandidate {
    pub fn new(
        model_id: impl Into<String>,
        provider_id: impl Into<String>,
        relative_cost: f64,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            provider_id: provider_id.into(),
            relative_cost,
            supports_enhanced_tool_calling: false,
        }
    }

    pub fn with_enhanced_tool_calling(mut self) -> Self {
        self.supports_enhanced_tool_calling = true;
        self
    }
}

impl std::fmt::Display for ModelCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

/// Row-set for one profile: per-tier rows plus a default row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileRows {
    #[serde(default)]
    pub tiers: HashMap<ComplexityTier, Vec<ModelCandidate>>,
    /// Used when neither the requested tier nor `moderate` is configured.
    #[serde(default)]
    pub default: Vec<ModelCandidate>,
}

impl ProfileRows {
    pub fn with_tier(mut self, tier: ComplexityTier, row: Vec<ModelCandidate>) -> Self {
        self.tiers.insert(tier, row);
        self
    }

    pub fn with_default(mut self, row: Vec<ModelCandidate>) -> Self {
        self.default = row;
        self
    }
}

/// Immutable lookup table built from validated configuration.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    profiles: HashMap<RoutingProfile, ProfileRows>,
}

const EMPTY_ROW: &[ModelCandidate] = &[];

impl RoutingTable {
    /// Build a table from per-profile row-sets.
    ///
    /// Callers go through [`crate::config::RouterConfig::validate`], which
    /// guarantees every profile is present with a non-empty default row.
    pub fn new(profiles: HashMap<RoutingProfile, ProfileRows>) -> Self {
        Self { profiles }
    }

    /// Ordered candidate list for a (tier, profile) pair.
    pub fn resolve(&self, tier: ComplexityTier, profile: RoutingProfile) -> &[ModelCandidate] {
        let Some(rows) = self.profiles.get(&profile) else {
            warn!(%profile, "routing profile missing from table");
            return EMPTY_ROW;
        };

        if let Some(row) = rows.tiers.get(&tier).filter(|r| !r.is_empty()) {
            return row;
        }

        // Configuration gap: recover locally, never fatal.
        if let Some(row) = rows
            .tiers
            .get(&ComplexityTier::Moderate)
            .filter(|r| !r.is_empty())
        {
            warn!(
                %profile,
                %tier,
                "no routing row for tier, falling back to moderate row"
            );
            return row;
        }

        warn!(
            %profile,
            %tier,
            "no routing row for tier or moderate, falling back to profile default"
        );
        &rows.default
    }

    /// The primary (first-preference) candidate for a (tier, profile) pair.
    pub fn primary(&self, tier: ComplexityTier, profile: RoutingProfile) -> Option<&ModelCandidate> {
        self.resolve(tier, profile).first()
    }

    pub fn profiles(&self) -> &HashMap<RoutingProfile, ProfileRows> {
        &self.profiles
    }
}
