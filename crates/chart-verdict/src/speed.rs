//! Speed tier resolution: user-facing tier names to execution profiles.
//!
//! A tier names a point on the latency/accuracy/cost trade-off. Resolution is
//! total: every input string, including unknown ones, resolves to a profile
//! so that tier handling can never fail an analysis on its own.
//!
//! | Tier            | Effort | Target latency | Cost multiplier |
//! |-----------------|--------|----------------|-----------------|
//! | `super_fast`    | low    | 1–5 s          | 0.5             |
//! | `fast`          | low    | 4–10 s         | 0.75            |
//! | `balanced`      | medium | 8–25 s         | 1.0             |
//! | `high_accuracy` | high   | 20–60 s        | 1.5             |
//!
//! Two legacy names are still accepted: `thorough` (now `balanced`) and
//! `maximum` (now `high_accuracy`). They resolve to their replacements and
//! attach a deprecation notice to the resolution.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// The canonical speed tiers, ordered from cheapest to most thorough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SpeedTier {
    /// Smallest effort, tightest latency target. For live-tape glances.
    SuperFast,
    /// Low effort with a slightly wider latency window.
    Fast,
    /// The default trade-off when no tier is requested.
    Balanced,
    /// Highest effort, widest latency window, premium-priced.
    HighAccuracy,
}

impl SpeedTier {
    pub const ALL: [SpeedTier; 4] = [
        SpeedTier::SuperFast,
        SpeedTier::Fast,
        SpeedTier::Balanced,
        SpeedTier::HighAccuracy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuperFast => "super_fast",
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::HighAccuracy => "high_accuracy",
        }
    }
}

impl fmt::Display for SpeedTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How hard the model should reason on a call. Maps onto the upstream
/// `reasoning_effort` request field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution parameters derived from a tier.
///
/// Profiles are static: resolution never synthesizes values outside the
/// table above. The profile chosen at the start of an analysis is carried
/// through every attempt of that analysis, including a model fallback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedProfile {
    pub tier: SpeedTier,
    pub reasoning_effort: ReasoningEffort,
    /// Target end-to-end latency window in seconds, `[min, max]`.
    pub target_latency_secs: [u64; 2],
    /// Scales the base model price for this tier.
    pub cost_multiplier: f64,
}

const PROFILES: [SpeedProfile; 4] = [
    SpeedProfile {
        tier: SpeedTier::SuperFast,
        reasoning_effort: ReasoningEffort::Low,
        target_latency_secs: [1, 5],
        cost_multiplier: 0.5,
    },
    SpeedProfile {
        tier: SpeedTier::Fast,
        reasoning_effort: ReasoningEffort::Low,
        target_latency_secs: [4, 10],
        cost_multiplier: 0.75,
    },
    SpeedProfile {
        tier: SpeedTier::Balanced,
        reasoning_effort: ReasoningEffort::Medium,
        target_latency_secs: [8, 25],
        cost_multiplier: 1.0,
    },
    SpeedProfile {
        tier: SpeedTier::HighAccuracy,
        reasoning_effort: ReasoningEffort::High,
        target_latency_secs: [20, 60],
        cost_multiplier: 1.5,
    },
];

/// Why a resolution did not match its input verbatim.
///
/// Notices are metadata only. They ride along on the final outcome so the
/// API layer can warn the caller; they never change which profile runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TierNotice {
    /// A legacy tier name was used and mapped to its replacement.
    DeprecatedAlias { alias: String, canonical: SpeedTier },
    /// The requested tier is not recognized; the default tier was used.
    Unrecognized { requested: String },
}

impl fmt::Display for TierNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeprecatedAlias { alias, canonical } => write!(
                f,
                "speed tier '{alias}' is deprecated, use '{canonical}' instead"
            ),
            Self::Unrecognized { requested } => write!(
                f,
                "speed tier '{requested}' is not recognized, using '{}'",
                SpeedTier::Balanced
            ),
        }
    }
}

/// The result of resolving a requested tier string.
#[derive(Debug, Clone, PartialEq)]
pub struct TierResolution {
    pub profile: SpeedProfile,
    pub notice: Option<TierNotice>,
}

/// Namespace for tier resolution. All functions are pure.
pub struct SpeedPolicy;

impl SpeedPolicy {
    /// Resolve a caller-supplied tier string to a profile.
    ///
    /// Matching is case-insensitive and tolerant of hyphens for underscores.
    /// `None`, empty, and unknown inputs all resolve to [`SpeedTier::Balanced`];
    /// unknown inputs additionally carry a [`TierNotice::Unrecognized`].
    pub fn resolve(requested: Option<&str>) -> TierResolution {
        let raw = match requested.map(str::trim) {
            None | Some("") => {
                return TierResolution {
                    profile: *Self::profile(SpeedTier::Balanced),
                    notice: None,
                }
            }
            Some(s) => s,
        };

        let normalized = raw.to_ascii_lowercase().replace('-', "_");
        let (tier, notice) = match normalized.as_str() {
            "super_fast" => (SpeedTier::SuperFast, None),
            "fast" => (SpeedTier::Fast, None),
            "balanced" => (SpeedTier::Balanced, None),
            "high_accuracy" => (SpeedTier::HighAccuracy, None),
            // Legacy names from before the tier rename.
            "thorough" => (
                SpeedTier::Balanced,
                Some(TierNotice::DeprecatedAlias {
                    alias: raw.to_string(),
                    canonical: SpeedTier::Balanced,
                }),
            ),
            "maximum" => (
                SpeedTier::HighAccuracy,
                Some(TierNotice::DeprecatedAlias {
                    alias: raw.to_string(),
                    canonical: SpeedTier::HighAccuracy,
                }),
            ),
            _ => (
                SpeedTier::Balanced,
                Some(TierNotice::Unrecognized {
                    requested: raw.to_string(),
                }),
            ),
        };

        TierResolution {
            profile: *Self::profile(tier),
            notice,
        }
    }

    /// The static profile for a canonical tier.
    pub fn profile(tier: SpeedTier) -> &'static SpeedProfile {
        match tier {
            SpeedTier::SuperFast => &PROFILES[0],
            SpeedTier::Fast => &PROFILES[1],
            SpeedTier::Balanced => &PROFILES[2],
            SpeedTier::HighAccuracy => &PROFILES[3],
        }
    }

    /// All profiles, in tier order. For surfacing tier metadata to API layers.
    pub fn profiles() -> &'static [SpeedProfile; 4] {
        &PROFILES
    }
}
