//! Cost estimation: price table, subscription multipliers, per-request totals.
//!
//! Pricing is `rate × tokens × tier multiplier × subscription multiplier`,
//! computed separately for input and output tokens. Rates are USD per
//! million tokens. Everything here is pure; estimates are advisory numbers
//! for the caller, billing itself lives elsewhere.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::speed::SpeedProfile;
use crate::types::{AttemptRecord, TokenUsage};

/// USD per million tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRates {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Static per-model pricing with a conservative default row.
///
/// Unknown model ids price at the default row rather than failing; an
/// over-estimate is the safe direction for an advisory number.
#[derive(Debug, Clone)]
pub struct PriceTable {
    rates: HashMap<String, ModelRates>,
    default_rates: ModelRates,
}

impl PriceTable {
    /// The built-in table for the models this service routes to.
    pub fn builtin() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            "gpt-4o".to_string(),
            ModelRates {
                input_per_million: 2.50,
                output_per_million: 10.00,
            },
        );
        rates.insert(
            "gpt-4o-mini".to_string(),
            ModelRates {
                input_per_million: 0.15,
                output_per_million: 0.60,
            },
        );
        rates.insert(
            "gpt-4.1".to_string(),
            ModelRates {
                input_per_million: 2.00,
                output_per_million: 8.00,
            },
        );
        rates.insert(
            "gpt-4.1-mini".to_string(),
            ModelRates {
                input_per_million: 0.40,
                output_per_million: 1.60,
            },
        );
        rates.insert(
            "o4-mini".to_string(),
            ModelRates {
                input_per_million: 1.10,
                output_per_million: 4.40,
            },
        );
        Self {
            rates,
            default_rates: ModelRates {
                input_per_million: 5.00,
                output_per_million: 15.00,
            },
        }
    }

    /// Insert or replace the rates for one model.
    pub fn with_rates(mut self, model: impl Into<String>, rates: ModelRates) -> Self {
        self.rates.insert(model.into(), rates);
        self
    }

    pub fn rates_for(&self, model: &str) -> ModelRates {
        self.rates.get(model).copied().unwrap_or(self.default_rates)
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Subscription tiers, ordered from least to most favorable pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Founder,
    Pro,
}

impl SubscriptionTier {
    /// Parse an account tier string leniently. Unknown names price as
    /// `free`, the least favorable multiplier.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "founder" => Self::Founder,
            "pro" => Self::Pro,
            _ => Self::Free,
        }
    }

    pub fn multiplier(self) -> f64 {
        match self {
            Self::Free => 1.0,
            Self::Founder => 0.8,
            Self::Pro => 0.5,
        }
    }
}

/// The estimate surfaced on a successful outcome. Values in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total: f64,
}

impl CostBreakdown {
    pub fn zero() -> Self {
        Self {
            input_cost: 0.0,
            output_cost: 0.0,
            total: 0.0,
        }
    }

    fn accumulate(&mut self, other: CostBreakdown) {
        self.input_cost = round_micro(self.input_cost + other.input_cost);
        self.output_cost = round_micro(self.output_cost + other.output_cost);
        self.total = round_micro(self.input_cost + self.output_cost);
    }
}

// Estimates are stable to a micro-dollar so serialized outcomes compare
// cleanly across runs.
fn round_micro(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Pure cost estimator over a [`PriceTable`].
#[derive(Debug, Clone, Default)]
pub struct CostEstimator {
    table: PriceTable,
}

impl CostEstimator {
    pub fn new(table: PriceTable) -> Self {
        Self { table }
    }

    /// Estimate the cost of one billed call.
    ///
    /// Deterministic and total: zero tokens yields a zero estimate, unknown
    /// models price at the default row, unknown subscription tiers price as
    /// `free`.
    pub fn estimate(
        &self,
        model: &str,
        profile: &SpeedProfile,
        subscription_tier: &str,
        tokens: &TokenUsage,
    ) -> CostBreakdown {
        let rates = self.table.rates_for(model);
        let multiplier = profile.cost_multiplier * SubscriptionTier::parse(subscription_tier).multiplier();

        let input_cost =
            round_micro(tokens.input_tokens as f64 / 1e6 * rates.input_per_million * multiplier);
        let output_cost =
            round_micro(tokens.output_tokens as f64 / 1e6 * rates.output_per_million * multiplier);

        CostBreakdown {
            input_cost,
            output_cost,
            total: round_micro(input_cost + output_cost),
        }
    }

    /// Total the billable cost across a request's attempt trail.
    ///
    /// Each attempt that reported tokens is priced at its own model's rates.
    /// A fallback request can therefore bill on two models when an attempt
    /// failed after consuming tokens.
    pub fn estimate_attempts(
        &self,
        attempts: &[AttemptRecord],
        profile: &SpeedProfile,
        subscription_tier: &str,
    ) -> CostBreakdown {
        let mut total = CostBreakdown::zero();
        for attempt in attempts {
            if let Some(tokens) = &attempt.tokens_used {
                total.accumulate(self.estimate(
                    &attempt.model_used,
                    profile,
                    subscription_tier,
                    tokens,
                ));
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speed::{SpeedPolicy, SpeedTier};
    use crate::types::AttemptOutcome;
    use chrono::Utc;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn known_model_prices_at_table_rates() {
        let estimator = CostEstimator::default();
        let profile = SpeedPolicy::profile(SpeedTier::Balanced);
        let tokens = TokenUsage::new(1_000_000, 0);

        let cost = estimator.estimate("gpt-4o", profile, "free", &tokens);
        assert!(close(cost.input_cost, 2.50));
        assert!(close(cost.output_cost, 0.0));
        assert!(close(cost.total, 2.50));
    }

    #[test]
    fn zero_tokens_is_zero_cost() {
        let estimator = CostEstimator::default();
        let profile = SpeedPolicy::profile(SpeedTier::HighAccuracy);
        let cost = estimator.estimate("gpt-4o", profile, "pro", &TokenUsage::default());
        assert_eq!(cost, CostBreakdown::zero());
    }

    #[test]
    fn unknown_subscription_tier_prices_as_free() {
        let estimator = CostEstimator::default();
        let profile = SpeedPolicy::profile(SpeedTier::Balanced);
        let tokens = TokenUsage::new(1_000_000, 0);

        let unknown = estimator.estimate("gpt-4o", profile, "platinum", &tokens);
        let free = estimator.estimate("gpt-4o", profile, "free", &tokens);
        assert_eq!(unknown, free);
    }

    #[test]
    fn subscription_multipliers_order_correctly() {
        let estimator = CostEstimator::default();
        let profile = SpeedPolicy::profile(SpeedTier::Balanced);
        let tokens = TokenUsage::new(500_000, 100_000);

        let free = estimator.estimate("gpt-4o", profile, "free", &tokens).total;
        let founder = estimator
            .estimate("gpt-4o", profile, "founder", &tokens)
            .total;
        let pro = estimator.estimate("gpt-4o", profile, "pro", &tokens).total;
        assert!(free > founder);
        assert!(founder > pro);
    }

    #[test]
    fn tier_multiplier_scales_the_estimate() {
        let estimator = CostEstimator::default();
        let tokens = TokenUsage::new(1_000_000, 0);

        let fast = estimator.estimate(
            "gpt-4o",
            SpeedPolicy::profile(SpeedTier::SuperFast),
            "free",
            &tokens,
        );
        // super_fast halves the balanced price.
        assert!(close(fast.total, 1.25));
    }

    #[test]
    fn unknown_model_uses_default_row() {
        let estimator = CostEstimator::default();
        let profile = SpeedPolicy::profile(SpeedTier::Balanced);
        let tokens = TokenUsage::new(1_000_000, 1_000_000);

        let cost = estimator.estimate("experimental-v9", profile, "free", &tokens);
        assert!(close(cost.input_cost, 5.00));
        assert!(close(cost.output_cost, 15.00));
    }

    #[test]
    fn estimate_is_idempotent() {
        let estimator = CostEstimator::default();
        let profile = SpeedPolicy::profile(SpeedTier::Fast);
        let tokens = TokenUsage::new(123_456, 7_890);

        let a = estimator.estimate("gpt-4o-mini", profile, "founder", &tokens);
        let b = estimator.estimate("gpt-4o-mini", profile, "founder", &tokens);
        assert_eq!(a, b);
    }

    #[test]
    fn attempt_totals_price_each_model_separately() {
        let estimator = CostEstimator::default();
        let profile = SpeedPolicy::profile(SpeedTier::Balanced);
        let mk = |model: &str, tokens: Option<TokenUsage>| AttemptRecord {
            attempt_number: 1,
            model_used: model.into(),
            started_at: Utc::now(),
            duration_ms: 10,
            outcome: AttemptOutcome::Success,
            tokens_used: tokens,
        };

        let attempts = vec![
            // Timed out before billing: contributes nothing.
            mk("gpt-4o", None),
            // Billed on the primary, then failed validation downstream.
            mk("gpt-4o", Some(TokenUsage::new(1_000_000, 0))),
            // Billed on the fallback.
            mk("gpt-4o-mini", Some(TokenUsage::new(1_000_000, 0))),
        ];

        let cost = estimator.estimate_attempts(&attempts, profile, "free");
        assert!(close(cost.input_cost, 2.65));
        assert!(close(cost.total, 2.65));
    }

    #[test]
    fn config_overrides_replace_builtin_rates() {
        let table = PriceTable::builtin().with_rates(
            "gpt-4o",
            ModelRates {
                input_per_million: 1.00,
                output_per_million: 2.00,
            },
        );
        let estimator = CostEstimator::new(table);
        let profile = SpeedPolicy::profile(SpeedTier::Balanced);
        let cost = estimator.estimate("gpt-4o", profile, "free", &TokenUsage::new(1_000_000, 0));
        assert!(close(cost.total, 1.00));
    }
}
