//! Resilient chart-analysis pipeline over vision-capable LLM providers.
//!
//! A request carries one chart image plus optional context. The
//! orchestrator classifies every upstream failure into a closed taxonomy,
//! retries with exponential backoff where that can help, falls back to a
//! cheaper secondary model where it cannot, and always returns a single
//! structured outcome: a verdict with cost attribution, or a failure the
//! caller can show to a user without leaking provider internals.
//!
//! ## Modules
//!
//! | Module        | Purpose                                              |
//! |---------------|------------------------------------------------------|
//! | `budget`      | Shared concurrency budget for upstream calls         |
//! | `config`      | Env/TOML configuration and component wiring          |
//! | `cost`        | Per-model pricing and attempt-level cost attribution |
//! | `errors`      | Failure taxonomy with retry/fallback classification  |
//! | `openai_http` | OpenAI-compatible chat-completions provider          |
//! | `orchestrator`| Attempt loop, phase machine, fallback escalation     |
//! | `provider`    | Provider trait, payload preflight, prompt assembly   |
//! | `retry`       | Backoff policy: exponential, jittered, capped        |
//! | `scripted`    | Deterministic scripted provider for tests and demos  |
//! | `speed`       | Speed tiers and their reasoning/latency profiles     |
//! | `types`       | Request, attempt records, and outcome types          |

pub mod budget;
pub mod config;
pub mod cost;
pub mod errors;
pub mod openai_http;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod scripted;
pub mod speed;
pub mod types;

// Convenience re-exports covering the common call path.
pub use budget::{BudgetPermit, RateBudget};
pub use config::{AnalysisConfig, ProviderKind};
pub use cost::{CostBreakdown, CostEstimator, PriceTable, SubscriptionTier};
pub use errors::{ErrorKind, ErrorMeta, RawFailure};
pub use orchestrator::FallbackOrchestrator;
pub use provider::{InferenceCall, InferenceProvider, InferenceReply, PayloadLimits};
pub use retry::{RetryController, RetryPolicy};
pub use scripted::ScriptedProvider;
pub use speed::{SpeedPolicy, SpeedProfile, SpeedTier, TierNotice, TierResolution};
pub use types::{AnalysisOutcome, AnalysisRequest, ImageRef, UserContext, Verdict};
