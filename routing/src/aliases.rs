//! Relative capability aliases for subagent (child task) routing.
//!
//! Child tasks request capability *classes* — sonnet-class, opus-class,
//! haiku-class — not concrete models. The resolver maps each alias to a
//! concrete model id proportional to the parent task's tier, so a trivial
//! parent that fans out into several children cannot multiply cost by
//! naively requesting high-capability models for every child.

use crate::classifier::ComplexityTier;
use crate::table::{ModelCandidate, RoutingProfile, RoutingTable};
use serde::{Deserialize, Serialize};

/// A relative capability request made by a child task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityAlias {
    /// Cheapest class.
    Haiku,
    /// Mid class; downgrades to the cheapest class under simple parents.
    Sonnet,
    /// Top class; never resolves below the mid class.
    Opus,
    /// The parent's already-chosen candidate, unchanged.
    Inherit,
}

impl std::fmt::Display for CapabilityAlias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Haiku => write!(f, "haiku"),
            Self::Sonnet => write!(f, "sonnet"),
            Self::Opus => write!(f, "opus"),
            Self::Inherit => write!(f, "inherit"),
        }
    }
}

/// Concrete model ids for every alias, derived for one parent tier.
///
/// Computed on demand from the routing table; never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentAliasMap {
    pub haiku: String,
    pub sonnet: String,
    pub opus: String,
    pub inherit: String,
}

impl SubagentAliasMap {
    pub fn get(&self, alias: CapabilityAlias) -> &str {
        match alias {
            CapabilityAlias::Haiku => &self.haiku,
            CapabilityAlias::Sonnet => &self.sonnet,
            CapabilityAlias::Opus => &self.opus,
            CapabilityAlias::Inherit => &self.inherit,
        }
    }
}

/// The tier whose primary candidate serves an alias under a given parent.
///
/// - `haiku` always maps to the trivial row.
/// - `sonnet` maps to the trivial row for parents at or below `low`
///   (downgrade to the cheapest class), otherwise the moderate row.
/// - `opus` maps to the parent tier, floored at `moderate` — reserved for
///   safety-critical children, it never drops to the cheapest class.
/// - `inherit` has no tier of its own (resolves to the parent's choice).
pub fn alias_tier(alias: CapabilityAlias, parent_tier: ComplexityTier) -> Option<ComplexityTier> {
    match alias {
        CapabilityAlias::Haiku => Some(ComplexityTier::Trivial),
        CapabilityAlias::Sonnet => {
            if parent_tier <= ComplexityTier::Low {
                Some(ComplexityTier::Trivial)
            } else {
                Some(ComplexityTier::Moderate)
            }
        }
        CapabilityAlias::Opus => Some(parent_tier.max(ComplexityTier::Moderate)),
        CapabilityAlias::Inherit => None,
    }
}

/// Resolves capability aliases against a routing table for one profile.
pub struct SubagentAliasResolver<'a> {
    table: &'a RoutingTable,
    profile: RoutingProfile,
}

impl<'a> SubagentAliasResolver<'a> {
    pub fn new(table: &'a RoutingTable, profile: RoutingProfile) -> Self {
        Self { table, profile }
    }

    /// Concrete model id for one alias.
    pub fn resolve(
        &self,
        alias: CapabilityAlias,
        parent_tier: ComplexityTier,
        parent_choice: &ModelCandidate,
    ) -> String {
        match alias_tier(alias, parent_tier) {
            None => parent_choice.model_id.clone(),
            Some(tier) => self
                .table
                .primary(tier, self.profile)
                .map(|c| c.model_id.clone())
                // Validated tables always have a primary; inherit is the
                // only sane recovery if one ever goes missing.
                .unwrap_or_else(|| parent_choice.model_id.clone()),
        }
    }

    /// The full alias map for a parent task.
    pub fn resolve_aliases(
        &self,
        parent_tier: ComplexityTier,
        parent_choice: &ModelCandidate,
    ) -> SubagentAliasMap {
        SubagentAliasMap {
            haiku: self.resolve(CapabilityAlias::Haiku, parent_tier, parent_choice),
            sonnet: self.resolve(CapabilityAlias::Sonnet, parent_tier, parent_choice),
            opus: self.resolve(CapabilityAlias::Opus, parent_tier, parent_choice),
            inherit: parent_choice.model_id.clone(),
        }
    }
}
