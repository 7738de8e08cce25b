//! Reasoning tier resolution and escalation.
//!
//! A caller asks for reasoning either as one fixed tier or as an adaptive
//! range of two or three adjacent tiers. The range collapses to one concrete
//! tier from the effective instruction length, then size-based restrictions
//! may demote it by one step.
//!
//! ```text
//!  spec ──resolve_effective(len)──► tier ──apply_restrictions(size)──► effective tier
//!                                                                         │
//!  spec ──compute_escalated_tier(steps)──► escalated spec (quality retry) ┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use edgequake_economizer::config::ReasoningThresholds;
//! use edgequake_economizer::reasoning::{resolve_effective, ReasoningSpec, ReasoningTier};
//!
//! let thresholds = ReasoningThresholds::default();
//! let tier = resolve_effective(ReasoningSpec::LowMediumOrHigh, 1_000, &thresholds);
//! assert_eq!(tier, ReasoningTier::Medium);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::catalog::SizeTier;
use crate::config::ReasoningThresholds;

// ============================================================================
// Tiers
// ============================================================================

/// One concrete reasoning intensity sent to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasoningTier {
    None,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ReasoningTier {
    /// All tiers, lowest first.
    pub const ALL: [ReasoningTier; 5] = [
        ReasoningTier::None,
        ReasoningTier::Low,
        ReasoningTier::Medium,
        ReasoningTier::High,
        ReasoningTier::VeryHigh,
    ];

    /// Position in [`ReasoningTier::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Tier at a position, if any.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// One step lower, saturating at `None`.
    pub fn demote(self) -> Self {
        Self::from_index(self.index().saturating_sub(1)).unwrap_or(self)
    }

    /// Wire name of the tier.
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningTier::None => "none",
            ReasoningTier::Low => "low",
            ReasoningTier::Medium => "medium",
            ReasoningTier::High => "high",
            ReasoningTier::VeryHigh => "very-high",
        }
    }
}

impl fmt::Display for ReasoningTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Specification
// ============================================================================

/// Requested reasoning: a fixed tier or an adaptive range of adjacent tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReasoningSpec {
    #[default]
    None,
    Low,
    Medium,
    High,
    VeryHigh,
    NoneOrLow,
    LowOrMedium,
    MediumOrHigh,
    HighOrVeryHigh,
    NoneLowOrMedium,
    LowMediumOrHigh,
    MediumHighOrVeryHigh,
}

impl ReasoningSpec {
    /// Spec for exactly one tier.
    pub fn fixed(tier: ReasoningTier) -> Self {
        match tier {
            ReasoningTier::None => ReasoningSpec::None,
            ReasoningTier::Low => ReasoningSpec::Low,
            ReasoningTier::Medium => ReasoningSpec::Medium,
            ReasoningTier::High => ReasoningSpec::High,
            ReasoningTier::VeryHigh => ReasoningSpec::VeryHigh,
        }
    }

    /// Adaptive range starting at `lowest` and spanning `width` tiers.
    ///
    /// Width 1 is a fixed tier. Returns `None` when the range would run past
    /// the top tier or the width is not 1, 2 or 3.
    pub fn range(lowest: ReasoningTier, width: usize) -> Option<Self> {
        use ReasoningTier as T;
        match (width, lowest) {
            (1, tier) => Some(Self::fixed(tier)),
            (2, T::None) => Some(ReasoningSpec::NoneOrLow),
            (2, T::Low) => Some(ReasoningSpec::LowOrMedium),
            (2, T::Medium) => Some(ReasoningSpec::MediumOrHigh),
            (2, T::High) => Some(ReasoningSpec::HighOrVeryHigh),
            (3, T::None) => Some(ReasoningSpec::NoneLowOrMedium),
            (3, T::Low) => Some(ReasoningSpec::LowMediumOrHigh),
            (3, T::Medium) => Some(ReasoningSpec::MediumHighOrVeryHigh),
            _ => None,
        }
    }

    /// Lowest tier covered by this value.
    pub fn floor(self) -> ReasoningTier {
        use ReasoningSpec as S;
        match self {
            S::None | S::NoneOrLow | S::NoneLowOrMedium => ReasoningTier::None,
            S::Low | S::LowOrMedium | S::LowMediumOrHigh => ReasoningTier::Low,
            S::Medium | S::MediumOrHigh | S::MediumHighOrVeryHigh => ReasoningTier::Medium,
            S::High | S::HighOrVeryHigh => ReasoningTier::High,
            S::VeryHigh => ReasoningTier::VeryHigh,
        }
    }

    /// Number of tiers covered (1, 2 or 3).
    pub fn width(self) -> usize {
        use ReasoningSpec as S;
        match self {
            S::None | S::Low | S::Medium | S::High | S::VeryHigh => 1,
            S::NoneOrLow | S::LowOrMedium | S::MediumOrHigh | S::HighOrVeryHigh => 2,
            S::NoneLowOrMedium | S::LowMediumOrHigh | S::MediumHighOrVeryHigh => 3,
        }
    }

    /// Highest tier covered by this value.
    pub fn ceiling(self) -> ReasoningTier {
        ReasoningTier::from_index(self.floor().index() + self.width() - 1)
            .unwrap_or(ReasoningTier::VeryHigh)
    }

    /// Whether this value needs instruction length to pick a tier.
    pub fn is_adaptive(self) -> bool {
        self.width() > 1
    }

    /// Covered tiers, lowest first.
    pub fn tiers(self) -> Vec<ReasoningTier> {
        (self.floor().index()..=self.ceiling().index())
            .filter_map(ReasoningTier::from_index)
            .collect()
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Collapse a spec to one tier from the effective instruction length.
///
/// Two-tier ranges switch at `short_instruction_chars`; three-tier ranges
/// switch at `short_instruction_chars` and `long_instruction_chars`.
pub fn resolve_effective(
    spec: ReasoningSpec,
    instruction_length: usize,
    thresholds: &ReasoningThresholds,
) -> ReasoningTier {
    let tiers = spec.tiers();
    let position = match tiers.len() {
        2 if instruction_length < thresholds.short_instruction_chars => 0,
        2 => 1,
        3 if instruction_length < thresholds.short_instruction_chars => 0,
        3 if instruction_length < thresholds.long_instruction_chars => 1,
        3 => 2,
        _ => 0,
    };
    tiers[position]
}

/// Model sizes a reasoning restriction applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestrictionScope {
    /// Only the smallest models of a family.
    VerySmallOnly,
    /// Small and very small models.
    SmallAndVerySmall,
}

impl RestrictionScope {
    /// Whether a model of this size is covered.
    pub fn applies_to(self, size: SizeTier) -> bool {
        match self {
            RestrictionScope::VerySmallOnly => size == SizeTier::VerySmall,
            RestrictionScope::SmallAndVerySmall => {
                matches!(size, SizeTier::Small | SizeTier::VerySmall)
            }
        }
    }
}

/// Demote a resolved tier by one step for restricted model sizes.
///
/// The high-tier restriction runs first so that a demoted `High` can be
/// demoted again by the medium-tier restriction.
pub fn apply_restrictions(
    tier: ReasoningTier,
    size: SizeTier,
    restriction_at_high: Option<RestrictionScope>,
    restriction_at_medium: Option<RestrictionScope>,
) -> ReasoningTier {
    let mut effective = tier;

    if effective == ReasoningTier::High
        && restriction_at_high.is_some_and(|scope| scope.applies_to(size))
    {
        effective = effective.demote();
        debug!(from = %tier, to = %effective, ?size, "High reasoning restricted");
    }

    if effective == ReasoningTier::Medium
        && restriction_at_medium.is_some_and(|scope| scope.applies_to(size))
    {
        let before = effective;
        effective = effective.demote();
        debug!(from = %before, to = %effective, ?size, "Medium reasoning restricted");
    }

    effective
}

// ============================================================================
// Escalation
// ============================================================================

/// Shift a spec up by `steps` tiers, clamping at the top tier.
///
/// Fixed tiers move up and stop at the top. Ranges move as a block; when the
/// block no longer fits below the top it loses its lower tiers, and once a
/// single tier is left it becomes the fixed top tier.
pub fn compute_escalated_tier(
    current: ReasoningSpec,
    steps: usize,
    model_has_very_high_tier: bool,
) -> ReasoningSpec {
    let declared_top = if model_has_very_high_tier {
        ReasoningTier::VeryHigh
    } else {
        ReasoningTier::High
    };
    // Never demote a spec that already sits above the model's declared top.
    let top = declared_top.max(current.ceiling()).index();

    let low = (current.floor().index() + steps).min(top);
    let high = (current.ceiling().index() + steps).min(top);

    let lowest = ReasoningTier::from_index(low).unwrap_or(ReasoningTier::VeryHigh);
    ReasoningSpec::range(lowest, high - low + 1).unwrap_or(ReasoningSpec::fixed(lowest))
}
