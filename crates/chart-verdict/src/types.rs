//! Domain types for the analysis pipeline.
//!
//! These types form the handoff layer between the route/upload plumbing,
//! the orchestrator, and whatever recorder persists results downstream.
//!
//! ## Key types
//!
//! | Type              | Produced by      | Consumed by                   |
//! |-------------------|------------------|-------------------------------|
//! | `AnalysisRequest` | Route/auth layer | Orchestrator                  |
//! | `ImageRef`        | Upload plumbing  | Provider pre-flight, dispatch |
//! | `Verdict`         | Provider adapter | Outcome, API formatting       |
//! | `TokenUsage`      | Provider adapter | Cost estimator                |
//! | `AttemptRecord`   | Orchestrator     | Outcome, external recorder    |
//! | `AnalysisOutcome` | Orchestrator     | Caller, external recorder     |

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cost::CostBreakdown;
use crate::errors::ErrorKind;
use crate::orchestrator::PhaseTransition;
use crate::speed::SpeedProfile;

// ── Request side ────────────────────────────────────────────────────────────

/// Reference to an uploaded chart image.
///
/// Carries a location (URL or storage key) plus the metadata the upload
/// layer recorded about it. Pre-flight checks work from this metadata only;
/// nothing in this crate decodes image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// URL or storage key resolvable by the inference provider.
    pub location: String,
    /// Declared mime type, e.g. `"image/png"`.
    pub mime: Option<String>,
    /// Declared size in bytes.
    pub size_bytes: Option<u64>,
}

impl ImageRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            mime: None,
            size_bytes: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }
}

/// Who is asking, as established by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    /// Subscription tier name as stored on the account (`free`, `founder`,
    /// `pro`). Passed through as a string; the cost estimator parses it
    /// leniently.
    pub subscription_tier: String,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, subscription_tier: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            subscription_tier: subscription_tier.into(),
        }
    }

    /// Placeholder context for harness and CLI runs.
    pub fn anonymous() -> Self {
        Self::new("anonymous", "free")
    }
}

/// One analysis request, read-only through the pipeline lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub image: ImageRef,
    /// Optional free-text context from the user ("4h BTC chart, post-FOMC").
    pub description: Option<String>,
    /// Requested speed tier name, resolved leniently by the speed policy.
    pub requested_tier: Option<String>,
    /// Correlation id threading this request through logs and records.
    pub correlation_id: String,
    pub user: UserContext,
}

impl AnalysisRequest {
    pub fn new(image: ImageRef) -> Self {
        Self {
            image,
            description: None,
            requested_tier: None,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            user: UserContext::anonymous(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.requested_tier = Some(tier.into());
        self
    }

    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = user;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }
}

// ── Result side ─────────────────────────────────────────────────────────────

/// The trading verdict extracted from a model reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Buy,
    Sell,
    Hold,
}

impl Verdict {
    /// Parse a verdict word leniently. Models phrase the same call several
    /// ways; map the common synonyms onto the three canonical values.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" | "long" | "bullish" => Some(Self::Buy),
            "sell" | "short" | "bearish" => Some(Self::Sell),
            "hold" | "neutral" | "wait" => Some(Self::Hold),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Hold => "hold",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counts reported by the provider for one billed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

/// How one upstream attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "error_kind")]
pub enum AttemptOutcome {
    Success,
    Failed(ErrorKind),
}

impl AttemptOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn error_kind(self) -> Option<ErrorKind> {
        match self {
            Self::Success => None,
            Self::Failed(kind) => Some(kind),
        }
    }
}

/// One upstream call, recorded immutably after it finishes.
///
/// Appended to the per-request attempt sequence in order; exactly one record
/// exists per upstream invocation, including the failed ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based position in the request's attempt sequence.
    pub attempt_number: u32,
    pub model_used: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
    /// Token usage when the provider reported any, billed or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<TokenUsage>,
}

/// Terminal result of one analysis request. Produced exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum AnalysisOutcome {
    /// A verdict was produced, possibly via the fallback model.
    Success {
        verdict: Verdict,
        /// Model-reported confidence in `[0, 1]`.
        confidence: f64,
        reasoning: String,
        model_used: String,
        /// True iff any attempt ran on a model other than the primary.
        fallback_used: bool,
        attempts: Vec<AttemptRecord>,
        /// The profile that governed every attempt of this request.
        speed_profile: SpeedProfile,
        cost_estimate: CostBreakdown,
        /// Non-fatal tier-resolution warning for the API layer to surface.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tier_notice: Option<String>,
        /// Phase transitions recorded while driving this request.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        phase_log: Vec<PhaseTransition>,
    },
    /// All escalation options were exhausted or the failure was terminal.
    Failure {
        final_error: ErrorKind,
        user_message: String,
        guidance: String,
        /// Always false on a terminal outcome; the kind's own retryability
        /// metadata stays available via [`ErrorKind::metadata`].
        retryable: bool,
        attempts: Vec<AttemptRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tier_notice: Option<String>,
        /// Phase transitions recorded while driving this request.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        phase_log: Vec<PhaseTransition>,
    },
}

impl AnalysisOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::Success { attempts, .. } | Self::Failure { attempts, .. } => attempts,
        }
    }

    /// The classified kind on failure outcomes.
    pub fn final_error(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { final_error, .. } => Some(*final_error),
        }
    }

    /// Whether any attempt ran on a non-primary model.
    pub fn fallback_used(&self) -> bool {
        match self {
            Self::Success { fallback_used, .. } => *fallback_used,
            Self::Failure { attempts, .. } => attempts
                .first()
                .map(|first| {
                    attempts
                        .iter()
                        .any(|a| a.model_used != first.model_used)
                })
                .unwrap_or(false),
        }
    }
}
