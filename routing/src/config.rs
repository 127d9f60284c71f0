//! Startup configuration for the routing core.
//!
//! Loaded once at process start and immutable thereafter. Every field has a
//! built-in default, so an empty TOML file yields a working router; partial
//! files override only what they name.
//!
//! Malformed configuration is the one fatal condition in this crate:
//! overlapping or gapped tier intervals, a profile with no default row, or
//! a non-positive cost multiplier all fail [`RouterConfig::validate`] and
//! must abort startup rather than run with ambiguous routing semantics.

use crate::budget::{usd_to_micro, BudgetLimits};
use crate::circuit::CircuitBreakerConfig;
use crate::classifier::{ComplexityTier, TierIntervals};
use crate::table::{ModelCandidate, ProfileRows, RoutingProfile};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration rejected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("tier intervals must start at score 0 (got {0})")]
    TiersNotStartingAtZero(u32),

    #[error("tier intervals overlap: {lower} ends at {lower_max}, {upper} starts at {upper_min}")]
    TierOverlap {
        lower: ComplexityTier,
        lower_max: u32,
        upper: ComplexityTier,
        upper_min: u32,
    },

    #[error("tier intervals leave a gap: {lower} ends at {lower_max}, {upper} starts at {upper_min}")]
    TierGap {
        lower: ComplexityTier,
        lower_max: u32,
        upper: ComplexityTier,
        upper_min: u32,
    },

    #[error("tier {0} must have an upper bound (only critical is unbounded)")]
    MissingUpperBound(ComplexityTier),

    #[error("the critical tier must be unbounded")]
    BoundedCritical,

    #[error("routing table has no row-set for profile {0}")]
    MissingProfile(RoutingProfile),

    #[error("profile {0} has an empty default row")]
    EmptyDefaultRow(RoutingProfile),

    #[error("candidate {model} in profile {profile} has non-positive relative_cost")]
    NonPositiveCost {
        profile: RoutingProfile,
        model: String,
    },
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

/// Budget ceilings in USD. `None` leaves a scope unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetSettings {
    #[serde(default)]
    pub session_limit_usd: Option<f64>,
    #[serde(default)]
    pub daily_limit_usd: Option<f64>,
    #[serde(default)]
    pub user_limit_usd: Option<f64>,
    /// Estimated cost of one call at relative_cost 1.0.
    #[serde(default = "default_base_call_cost_usd")]
    pub base_call_cost_usd: f64,
}

fn default_base_call_cost_usd() -> f64 {
    0.02
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            session_limit_usd: Some(5.0),
            daily_limit_usd: Some(25.0),
            user_limit_usd: None,
            base_call_cost_usd: default_base_call_cost_usd(),
        }
    }
}

/// Complete routing core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// The active strategy.
    #[serde(default = "default_profile")]
    pub profile: RoutingProfile,
    #[serde(default)]
    pub tiers: TierIntervals,
    #[serde(default)]
    pub circuit: CircuitSettings,
    #[serde(default)]
    pub budget: BudgetSettings,
    /// Per-profile row-sets. When overridden, all profiles must be covered.
    #[serde(default = "default_tables")]
    pub tables: HashMap<RoutingProfile, ProfileRows>,
}

fn default_profile() -> RoutingProfile {
    RoutingProfile::Balanced
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            tiers: TierIntervals::default(),
            circuit: CircuitSettings::default(),
            budget: BudgetSettings::default(),
            tables: default_tables(),
        }
    }
}

impl RouterConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Reject ambiguous or incomplete configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_tiers()?;
        self.validate_tables()
    }

    fn validate_tiers(&self) -> Result<(), ConfigError> {
        let ordered = self.tiers.ordered();

        let (_, first) = ordered[0];
        if first.min != 0 {
            return Err(ConfigError::TiersNotStartingAtZero(first.min));
        }

        for pair in ordered.windows(2) {
            let (lower_tier, lower) = pair[0];
            let (upper_tier, upper) = pair[1];
            let Some(lower_max) = lower.max else {
                return Err(ConfigError::MissingUpperBound(lower_tier));
            };
            if upper.min <= lower_max {
                return Err(ConfigError::TierOverlap {
                    lower: lower_tier,
                    lower_max,
                    upper: upper_tier,
                    upper_min: upper.min,
                });
            }
            if upper.min != lower_max + 1 {
                return Err(ConfigError::TierGap {
                    lower: lower_tier,
                    lower_max,
                    upper: upper_tier,
                    upper_min: upper.min,
                });
            }
        }

        let (_, critical) = ordered[4];
        if critical.max.is_some() {
            return Err(ConfigError::BoundedCritical);
        }
        Ok(())
    }

    fn validate_tables(&self) -> Result<(), ConfigError> {
        for &profile in RoutingProfile::all() {
            let Some(rows) = self.tables.get(&profile) else {
                return Err(ConfigError::MissingProfile(profile));
            };
            if rows.default.is_empty() {
                return Err(ConfigError::EmptyDefaultRow(profile));
            }
            let all_rows = rows.tiers.values().chain(std::iter::once(&rows.default));
            for candidate in all_rows.flatten() {
                if candidate.relative_cost <= 0.0 {
                    return Err(ConfigError::NonPositiveCost {
                        profile,
                        model: candidate.model_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit.failure_threshold,
            recovery_timeout: Duration::from_secs(self.circuit.recovery_timeout_secs),
        }
    }

    pub fn budget_limits(&self) -> BudgetLimits {
        BudgetLimits {
            session_micro: self.budget.session_limit_usd.map(usd_to_micro),
            day_micro: self.budget.daily_limit_usd.map(usd_to_micro),
            user_micro: self.budget.user_limit_usd.map(usd_to_micro),
        }
    }

    pub fn base_call_cost_micro(&self) -> u64 {
        usd_to_micro(self.budget.base_call_cost_usd)
    }
}

// ── Built-in routing tables ──────────────────────────────────────────

fn haiku() -> ModelCandidate {
    ModelCandidate::new("claude-haiku-4-5", "anthropic", 0.25).with_enhanced_tool_calling()
}

fn sonnet() -> ModelCandidate {
    ModelCandidate::new("claude-sonnet-4-5", "anthropic", 1.0).with_enhanced_tool_calling()
}

fn opus() -> ModelCandidate {
    ModelCandidate::new("claude-opus-4-1", "anthropic", 5.0).with_enhanced_tool_calling()
}

fn gpt_mini() -> ModelCandidate {
    ModelCandidate::new("gpt-4.1-mini", "openai", 0.3).with_enhanced_tool_calling()
}

fn gpt() -> ModelCandidate {
    ModelCandidate::new("gpt-4.1", "openai", 1.2).with_enhanced_tool_calling()
}

fn gemini_flash() -> ModelCandidate {
    ModelCandidate::new("gemini-2.5-flash", "google", 0.2)
}

fn gemini_pro() -> ModelCandidate {
    ModelCandidate::new("gemini-2.5-pro", "google", 1.0)
}

fn deepseek() -> ModelCandidate {
    ModelCandidate::new("deepseek-chat", "deepseek", 0.15)
}

/// Default row-sets for every profile.
///
/// Ordering encodes preference: the first entry is the intended model for
/// the tier; later entries are fallbacks from other providers where the
/// profile allows, so one provider outage rarely exhausts the row.
pub fn default_tables() -> HashMap<RoutingProfile, ProfileRows> {
    use ComplexityTier::*;

    let mut tables = HashMap::new();

    tables.insert(
        RoutingProfile::AnthropicOnly,
        ProfileRows::default()
            .with_tier(Trivial, vec![haiku(), sonnet()])
            .with_tier(Low, vec![haiku(), sonnet()])
            .with_tier(Moderate, vec![sonnet(), haiku()])
            .with_tier(High, vec![sonnet(), opus()])
            .with_tier(Critical, vec![opus(), sonnet()])
            .with_default(vec![sonnet(), haiku()]),
    );

    tables.insert(
        RoutingProfile::QualityFirst,
        ProfileRows::default()
            .with_tier(Trivial, vec![sonnet(), gpt()])
            .with_tier(Low, vec![sonnet(), gpt()])
            .with_tier(Moderate, vec![sonnet(), gemini_pro(), gpt()])
            .with_tier(High, vec![opus(), gpt(), gemini_pro()])
            .with_tier(Critical, vec![opus(), gpt(), gemini_pro()])
            .with_default(vec![opus(), sonnet()]),
    );

    tables.insert(
        RoutingProfile::Balanced,
        ProfileRows::default()
            .with_tier(Trivial, vec![haiku(), gemini_flash()])
            .with_tier(Low, vec![haiku(), gpt_mini()])
            .with_tier(Moderate, vec![sonnet(), gpt(), gemini_pro()])
            .with_tier(High, vec![sonnet(), gpt(), gemini_pro()])
            .with_tier(Critical, vec![opus(), gpt(), gemini_pro()])
            .with_default(vec![sonnet(), gpt()]),
    );

    tables.insert(
        RoutingProfile::CostOptimised,
        ProfileRows::default()
            .with_tier(Trivial, vec![deepseek(), gemini_flash(), haiku()])
            .with_tier(Low, vec![deepseek(), gemini_flash(), haiku()])
            .with_tier(Moderate, vec![haiku(), gemini_flash(), gpt_mini()])
            .with_tier(High, vec![sonnet(), gemini_pro(), gpt()])
            .with_tier(Critical, vec![sonnet(), gemini_pro(), gpt()])
            .with_default(vec![haiku(), deepseek()]),
    );

    tables.insert(
        RoutingProfile::MultiProvider,
        ProfileRows::default()
            .with_tier(Trivial, vec![haiku(), gemini_flash(), deepseek()])
            .with_tier(Low, vec![haiku(), gpt_mini(), gemini_flash()])
            .with_tier(Moderate, vec![sonnet(), gemini_pro(), gpt()])
            .with_tier(High, vec![sonnet(), gpt(), gemini_pro()])
            .with_tier(Critical, vec![opus(), gpt(), gemini_pro()])
            .with_default(vec![sonnet(), gpt(), gemini_pro()]),
    );

    tables.insert(
        RoutingProfile::AutoRouter,
        ProfileRows::default()
            .with_tier(Trivial, vec![haiku(), gpt_mini()])
            .with_tier(Low, vec![haiku(), gpt_mini()])
            .with_tier(Moderate, vec![sonnet(), gpt()])
            .with_tier(High, vec![sonnet(), gpt(), opus()])
            .with_tier(Critical, vec![opus(), gpt()])
            .with_default(vec![sonnet(), gpt()]),
    );

    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::TierInterval;
    use std::io::Write;

    #[test]
    fn test_default_config_validates() {
        RouterConfig::default().validate().unwrap();
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = RouterConfig::from_toml_str("").unwrap();
        assert_eq!(config.profile, RoutingProfile::Balanced);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.circuit.recovery_timeout_secs, 60);
        assert_eq!(config.tables.len(), 6);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = RouterConfig::from_toml_str(
            r#"
            profile = "cost_optimised"

            [circuit]
            failure_threshold = 3
            recovery_timeout_secs = 10

            [budget]
            session_limit_usd = 1.5
            "#,
        )
        .unwrap();
        assert_eq!(config.profile, RoutingProfile::CostOptimised);
        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(
            config.budget_limits().session_micro,
            Some(usd_to_micro(1.5))
        );
        // Unspecified budget fields fall back to field defaults.
        assert_eq!(config.budget.base_call_cost_usd, 0.02);
    }

    #[test]
    fn test_unknown_profile_fails_parse() {
        let err = RouterConfig::from_toml_str("profile = \"yolo_mode\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_overlapping_tiers_rejected() {
        let mut config = RouterConfig::default();
        config.tiers.low = TierInterval::bounded(1, 3);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::TierOverlap { .. }));
    }

    #[test]
    fn test_gapped_tiers_rejected() {
        let mut config = RouterConfig::default();
        config.tiers.moderate = TierInterval::bounded(5, 6);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::TierGap { .. }));
    }

    #[test]
    fn test_tiers_must_start_at_zero() {
        let mut config = RouterConfig::default();
        config.tiers.trivial = TierInterval::bounded(1, 1);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::TiersNotStartingAtZero(1)));
    }

    #[test]
    fn test_bounded_critical_rejected() {
        let mut config = RouterConfig::default();
        config.tiers.critical = TierInterval::bounded(11, 99);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::BoundedCritical));
    }

    #[test]
    fn test_unbounded_middle_tier_rejected() {
        let mut config = RouterConfig::default();
        config.tiers.moderate = TierInterval::unbounded(4);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingUpperBound(_)));
    }

    #[test]
    fn test_missing_profile_rejected() {
        let mut config = RouterConfig::default();
        config.tables.remove(&RoutingProfile::AutoRouter);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingProfile(RoutingProfile::AutoRouter)
        ));
    }

    #[test]
    fn test_empty_default_row_rejected() {
        let mut config = RouterConfig::default();
        if let Some(rows) = config.tables.get_mut(&RoutingProfile::Balanced) {
            rows.default.clear();
        }
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::EmptyDefaultRow(RoutingProfile::Balanced)
        ));
    }

    #[test]
    fn test_non_positive_cost_rejected() {
        let mut config = RouterConfig::default();
        if let Some(rows) = config.tables.get_mut(&RoutingProfile::Balanced) {
            rows.default[0].relative_cost = 0.0;
        }
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::NonPositiveCost { .. }));
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "profile = \"multi_provider\"").unwrap();
        let config = RouterConfig::from_path(file.path()).unwrap();
        assert_eq!(config.profile, RoutingProfile::MultiProvider);
    }

    #[test]
    fn test_from_path_missing_file() {
        let err = RouterConfig::from_path("/nonexistent/router.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_tier_interval_override() {
        let config = RouterConfig::from_toml_str(
            r#"
            [tiers.trivial]
            min = 0
            max = 2
            [tiers.low]
            min = 3
            max = 4
            [tiers.moderate]
            min = 5
            max = 6
            [tiers.high]
            min = 7
            max = 9
            [tiers.critical]
            min = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.tiers.tier_for(2), ComplexityTier::Trivial);
        assert_eq!(config.tiers.tier_for(10), ComplexityTier::Critical);
    }

    #[test]
    fn test_table_override_must_cover_all_profiles() {
        // Overriding the tables replaces them wholesale; a single profile
        // is not merged with the built-ins.
        let err = RouterConfig::from_toml_str(
            r#"
            [[tables.balanced.default]]
            model_id = "m1"
            provider_id = "p1"
            relative_cost = 1.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingProfile(_)));
    }

    #[test]
    fn test_table_override_rows_parse() {
        let mut raw = String::new();
        for profile in RoutingProfile::all() {
            raw.push_str(&format!(
                "[[tables.{profile}.default]]\n\
                 model_id = \"m-{profile}\"\n\
                 provider_id = \"p1\"\n\
                 relative_cost = 0.5\n\n"
            ));
        }
        let config = RouterConfig::from_toml_str(&raw).unwrap();
        let rows = &config.tables[&RoutingProfile::QualityFirst];
        assert_eq!(rows.default[0].model_id, "m-quality_first");
        assert!(!rows.default[0].supports_enhanced_tool_calling);
    }

    #[test]
    fn test_tier_keyed_row_override_parses() {
        let mut raw = String::new();
        for profile in RoutingProfile::all() {
            raw.push_str(&format!(
                "[[tables.{profile}.default]]\n\
                 model_id = \"d-{profile}\"\n\
                 provider_id = \"p1\"\n\
                 relative_cost = 0.5\n\n"
            ));
        }
        raw.push_str(
            "[[tables.balanced.tiers.moderate]]\n\
             model_id = \"mid-a\"\n\
             provider_id = \"p1\"\n\
             relative_cost = 1.0\n\
             supports_enhanced_tool_calling = true\n\n\
             [[tables.balanced.tiers.moderate]]\n\
             model_id = \"mid-b\"\n\
             provider_id = \"p2\"\n\
             relative_cost = 0.8\n\n\
             [[tables.balanced.tiers.critical]]\n\
             model_id = \"top\"\n\
             provider_id = \"p1\"\n\
             relative_cost = 4.0\n",
        );
        let config = RouterConfig::from_toml_str(&raw).unwrap();

        let rows = &config.tables[&RoutingProfile::Balanced];
        let moderate = &rows.tiers[&ComplexityTier::Moderate];
        assert_eq!(moderate.len(), 2);
        assert_eq!(moderate[0].model_id, "mid-a");
        assert!(moderate[0].supports_enhanced_tool_calling);
        assert_eq!(moderate[1].provider_id, "p2");
        assert_eq!(rows.tiers[&ComplexityTier::Critical][0].model_id, "top");

        // Unconfigured tiers resolve through the moderate row.
        let table = crate::table::RoutingTable::new(config.tables.clone());
        let low = table.resolve(ComplexityTier::Low, RoutingProfile::Balanced);
        assert_eq!(low[0].model_id, "mid-a");
    }
}
