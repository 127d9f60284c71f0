//! Complexity classification for incoming tasks.
//!
//! Scores a free-text task description plus structured context signals into
//! a discrete [`ComplexityTier`]. Scoring is a weighted sum of per-signal
//! contributions; no signal may subtract from the score. Tier lookup walks
//! the configured score intervals, which partition the non-negative
//! integers, so every score maps to exactly one tier.
//!
//! Classification is pure: no locks, no clocks, no side effects. Identical
//! input always produces the identical result.

use serde::{Deserialize, Serialize};

/// Discrete complexity bucket used to select model capability.
///
/// Ordered from cheapest to most capable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Trivial,
    Low,
    Moderate,
    High,
    Critical,
}

impl ComplexityTier {
    /// All tiers in ascending capability order.
    pub fn all() -> &'static [ComplexityTier] {
        &[
            Self::Trivial,
            Self::Low,
            Self::Moderate,
            Self::High,
            Self::Critical,
        ]
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trivial => write!(f, "trivial"),
            Self::Low => write!(f, "low"),
            Self::Moderate => write!(f, "moderate"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Closed score interval bound to a tier. `max = None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierInterval {
    pub min: u32,
    #[serde(default)]
    pub max: Option<u32>,
}

impl TierInterval {
    pub const fn bounded(min: u32, max: u32) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    pub const fn unbounded(min: u32) -> Self {
        Self { min, max: None }
    }

    fn contains(&self, score: u32) -> bool {
        score >= self.min && self.max.map_or(true, |m| score <= m)
    }
}

/// Score intervals for all five tiers.
///
/// Validated at startup: intervals must be contiguous, non-overlapping, and
/// cover every non-negative integer (see [`crate::config::RouterConfig::validate`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierIntervals {
    pub trivial: TierInterval,
    pub low: TierInterval,
    pub moderate: TierInterval,
    pub high: TierInterval,
    pub critical: TierInterval,
}

impl TierIntervals {
    /// Iterate intervals in ascending tier order.
    pub fn ordered(&self) -> [(ComplexityTier, TierInterval); 5] {
        [
            (ComplexityTier::Trivial, self.trivial),
            (ComplexityTier::Low, self.low),
            (ComplexityTier::Moderate, self.moderate),
            (ComplexityTier::High, self.high),
            (ComplexityTier::Critical, self.critical),
        ]
    }

    /// Map a score to its tier.
    ///
    /// Intervals partition the non-negative integers, so exactly one tier
    /// matches. Scanning from the top tier down means a boundary shared by
    /// two intervals would resolve upward, favoring capability over cost.
    pub fn tier_for(&self, score: u32) -> ComplexityTier {
        for (tier, interval) in self.ordered().into_iter().rev() {
            if interval.contains(score) {
                return tier;
            }
        }
        // Unreachable with validated intervals: critical is unbounded and
        // trivial starts at 0.
        ComplexityTier::Critical
    }
}

impl Default for TierIntervals {
    fn default() -> Self {
        Self {
            trivial: TierInterval::bounded(0, 1),
            low: TierInterval::bounded(2, 3),
            moderate: TierInterval::bounded(4, 6),
            high: TierInterval::bounded(7, 10),
            critical: TierInterval::unbounded(11),
        }
    }
}

/// Explicit urgency hint supplied by the caller (e.g. from channel metadata).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Relaxed,
    #[default]
    Normal,
    Elevated,
    Critical,
}

/// Structured signals accompanying the free-text description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSignals {
    /// Number of attachments (files, images) on the request.
    #[serde(default)]
    pub attachment_count: u32,
    /// Explicit urgency/energy hint from the caller.
    #[serde(default)]
    pub urgency: Urgency,
    /// Depth of the conversation thread this task arrived on.
    #[serde(default)]
    pub thread_depth: u32,
}

/// Result of classifying one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub score: u32,
    pub tier: ComplexityTier,
}

/// Phrases indicating a multi-step request.
const MULTI_STEP_PHRASES: &[&str] = &[
    "step",
    "first",
    "then",
    "after that",
    "finally",
    "workflow",
    "pipeline",
    "checklist",
    "in order",
];

/// Keywords indicating inherently demanding work.
const HEAVY_KEYWORDS: &[&str] = &[
    "analyze",
    "architect",
    "design",
    "refactor",
    "integrate",
    "debug",
    "investigate",
    "optimize",
    "migrate",
    "research",
    "compare",
    "plan",
];

/// Heuristic complexity scorer.
#[derive(Debug, Clone)]
pub struct ComplexityClassifier {
    intervals: TierIntervals,
}

impl ComplexityClassifier {
    pub fn new(intervals: TierIntervals) -> Self {
        Self { intervals }
    }

    pub fn intervals(&self) -> &TierIntervals {
        &self.intervals
    }

    /// Score a task and derive its tier.
    pub fn classify(&self, description: &str, signals: &ContextSignals) -> Classification {
        let score = self.score(description, signals);
        Classification {
            score,
            tier: self.intervals.tier_for(score),
        }
    }

    /// Weighted heuristic score. Every contribution is non-negative.
    fn score(&self, description: &str, signals: &ContextSignals) -> u32 {
        let desc = description.to_lowercase();
        let mut score: u32 = 0;

        // Message length.
        let chars = desc.chars().count();
        if chars > 200 {
            score += 1;
        }
        if chars > 600 {
            score += 2;
        }
        if chars > 1500 {
            score += 2;
        }

        // Multi-step language, capped so list-heavy prose cannot dominate.
        let steps = MULTI_STEP_PHRASES
            .iter()
            .filter(|p| desc.contains(*p))
            .count() as u32;
        score += (steps * 2).min(6);

        // Demanding verbs.
        let heavy = HEAVY_KEYWORDS
            .iter()
            .filter(|k| desc.contains(*k))
            .count() as u32;
        score += heavy.min(5);

        // Attachments.
        score += signals.attachment_count.min(3);

        // Urgency hints push toward capability, never away from it.
        score += match signals.urgency {
            Urgency::Relaxed | Urgency::Normal => 0,
            Urgency::Elevated => 2,
            Urgency::Critical => 4,
        };

        // Deep threads carry accumulated context.
        if signals.thread_depth > 10 {
            score += 1;
        }

        score
    }
}

impl Default for ComplexityClassifier {
    fn default() -> Self {
        Self::new(TierIntervals::default())
    }
}
