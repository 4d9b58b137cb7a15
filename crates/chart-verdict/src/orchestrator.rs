//! Fallback orchestration: the top-level coordinator for one analysis.
//!
//! Drives a single request through the attempt/retry/fallback lifecycle and
//! produces exactly one [`AnalysisOutcome`], never an unclassified error.
//!
//! ## Lifecycle
//!
//! ```text
//! analyze(request)
//!   → resolve speed tier (fail-soft, notice kept as metadata)
//!   → PrimaryAttempt:   acquire budget → invoke → classify on failure
//!       retryable, attempts remain        → backoff wait → PrimaryAttempt
//!       exhausted or fallback-eligible    → SecondaryAttempt
//!       neither                           → Failed
//!   → SecondaryAttempt: one attempt, same speed profile
//!       success → Done, failure → Failed (no further escalation)
//! ```
//!
//! Every attempt is recorded before the next decision, so the outcome
//! carries full provenance even on failure. Budget waits, backoff waits and
//! the in-flight call all race against the caller's cancellation token;
//! nothing is retried after a cancellation.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::budget::RateBudget;
use crate::cost::CostEstimator;
use crate::errors::ErrorKind;
use crate::provider::{analysis_prompt, InferenceCall, InferenceProvider};
use crate::retry::RetryController;
use crate::speed::SpeedPolicy;
use crate::types::{AnalysisOutcome, AnalysisRequest, AttemptOutcome, AttemptRecord};

// ── Phase machine ───────────────────────────────────────────────────────────

/// The per-request phases.
///
/// Every request starts at `PrimaryAttempt` and terminates at either `Done`
/// or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    /// Calling the primary model, including its retry loop.
    PrimaryAttempt,
    /// The single permitted call to the secondary model.
    SecondaryAttempt,
    /// A verdict was produced.
    Done,
    /// All options exhausted or the failure was terminal.
    Failed,
}

impl AttemptPhase {
    /// Whether this is a terminal phase (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrimaryAttempt => write!(f, "PrimaryAttempt"),
            Self::SecondaryAttempt => write!(f, "SecondaryAttempt"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Legal transitions between phases.
///
/// ```text
/// PrimaryAttempt   → PrimaryAttempt | SecondaryAttempt | Done | Failed
/// SecondaryAttempt → Done | Failed
/// ```
///
/// `SecondaryAttempt` has no edge back to itself or to `PrimaryAttempt`:
/// one fallback escalation per request, a secondary failure is terminal.
fn is_legal_transition(from: AttemptPhase, to: AttemptPhase) -> bool {
    use AttemptPhase::*;

    // Any non-terminal phase can transition to Failed.
    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        // Retry loop on the primary model.
        (PrimaryAttempt, PrimaryAttempt)
            | (PrimaryAttempt, SecondaryAttempt)
            | (PrimaryAttempt, Done)
            | (SecondaryAttempt, Done)
    )
}

/// A single recorded phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: AttemptPhase,
    pub to: AttemptPhase,
    /// Attempt count at the time of transition.
    pub attempt: u32,
    /// Milliseconds since the phase machine was created.
    pub elapsed_ms: u64,
    /// Optional context about why this transition happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: AttemptPhase,
    pub to: AttemptPhase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal phase transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Tracks the current phase, enforces legal transitions, and keeps a
/// transition log for diagnostics.
pub struct PhaseMachine {
    current: AttemptPhase,
    attempt: u32,
    created_at: Instant,
    transitions: Vec<PhaseTransition>,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: AttemptPhase::PrimaryAttempt,
            attempt: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> AttemptPhase {
        self.current
    }

    /// Set the attempt counter (called by the orchestrator loop).
    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// Attempt to advance to the next phase.
    pub fn advance(
        &mut self,
        to: AttemptPhase,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = PhaseTransition {
            from: self.current,
            to,
            attempt: self.attempt,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };

        tracing::debug!(
            from = %self.current,
            to = %to,
            attempt = self.attempt,
            "phase transition"
        );

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Transition to `Failed`. Always legal from non-terminal phases.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(AttemptPhase::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    /// One-line history of the request's phases.
    pub fn summary(&self) -> String {
        let phases: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        format!(
            "{} -> {} ({}ms, {} transitions)",
            AttemptPhase::PrimaryAttempt,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        ) + if phases.is_empty() {
            String::new()
        } else {
            format!(" [{}]", phases.join(" -> "))
        }
        .as_str()
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn advance_logged(machine: &mut PhaseMachine, to: AttemptPhase, reason: &str) {
    if let Err(err) = machine.advance(to, Some(reason)) {
        tracing::error!(error = %err, "phase transition rejected");
    }
}

fn fail_logged(machine: &mut PhaseMachine, reason: &str) {
    if let Err(err) = machine.fail(reason) {
        tracing::error!(error = %err, "phase transition rejected");
    }
}

// ── Orchestrator ────────────────────────────────────────────────────────────

/// Top-level coordinator for analysis requests.
///
/// Holds the model pair, the retry controller, the cost estimator, and the
/// injected shared rate budget. Per-request state lives on the stack of
/// [`FallbackOrchestrator::analyze_with_cancel`]; an orchestrator is shared
/// freely across concurrent requests.
pub struct FallbackOrchestrator {
    primary_model: String,
    secondary_model: String,
    provider: Arc<dyn InferenceProvider>,
    retry: RetryController,
    estimator: CostEstimator,
    budget: Arc<RateBudget>,
}

impl FallbackOrchestrator {
    pub fn new(provider: Arc<dyn InferenceProvider>, budget: Arc<RateBudget>) -> Self {
        Self {
            primary_model: "gpt-4o".to_string(),
            secondary_model: "gpt-4o-mini".to_string(),
            provider,
            retry: RetryController::default(),
            estimator: CostEstimator::default(),
            budget,
        }
    }

    pub fn with_models(
        mut self,
        primary: impl Into<String>,
        secondary: impl Into<String>,
    ) -> Self {
        self.primary_model = primary.into();
        self.secondary_model = secondary.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryController) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_estimator(mut self, estimator: CostEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn primary_model(&self) -> &str {
        &self.primary_model
    }

    pub fn secondary_model(&self) -> &str {
        &self.secondary_model
    }

    /// Analyze one request to a terminal outcome.
    pub async fn analyze(&self, request: AnalysisRequest) -> AnalysisOutcome {
        self.analyze_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Analyze one request, racing every wait against `cancel`.
    ///
    /// Cancellation is terminal: an in-flight call is recorded as an aborted
    /// attempt, and no retry or fallback is scheduled afterwards.
    pub async fn analyze_with_cancel(
        &self,
        request: AnalysisRequest,
        cancel: CancellationToken,
    ) -> AnalysisOutcome {
        let resolution = SpeedPolicy::resolve(request.requested_tier.as_deref());
        let profile = resolution.profile;
        let tier_notice = resolution.notice.as_ref().map(ToString::to_string);
        if let Some(notice) = &tier_notice {
            tracing::debug!(
                correlation = %request.correlation_id,
                notice = %notice,
                "tier resolved with notice"
            );
        }

        tracing::info!(
            correlation = %request.correlation_id,
            user = %request.user.user_id,
            tier = %profile.tier,
            model = %self.primary_model,
            "analysis starting"
        );

        let prompt = analysis_prompt(request.description.as_deref());
        let mut machine = PhaseMachine::new();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        // Attempts on the model currently in play; resets on escalation.
        let mut local_attempt: u32 = 0;
        let mut last_kind: Option<ErrorKind> = None;

        loop {
            let on_secondary = machine.current() == AttemptPhase::SecondaryAttempt;
            let model = if on_secondary {
                &self.secondary_model
            } else {
                &self.primary_model
            };

            let permit = tokio::select! {
                permit = self.budget.acquire() => permit,
                _ = cancel.cancelled() => {
                    fail_logged(&mut machine, "cancelled while waiting for budget");
                    let kind = last_kind.unwrap_or(ErrorKind::UpstreamTimeout);
                    return self.failure(&request, kind, attempts, tier_notice, &machine);
                }
            };

            local_attempt += 1;
            let attempt_number = attempts.len() as u32 + 1;
            machine.set_attempt(attempt_number);

            let call = InferenceCall {
                model: model.clone(),
                image: request.image.clone(),
                prompt: prompt.clone(),
                effort: profile.reasoning_effort,
            };
            tracing::debug!(
                correlation = %request.correlation_id,
                model = %model,
                attempt = attempt_number,
                effort = %profile.reasoning_effort,
                "dispatching upstream call"
            );

            let started_at = Utc::now();
            let started = Instant::now();
            let result = tokio::select! {
                result = self.provider.invoke(call) => Some(result),
                _ = cancel.cancelled() => None,
            };
            drop(permit);
            let duration_ms = started.elapsed().as_millis() as u64;

            let Some(result) = result else {
                // The call was issued; record the aborted attempt before
                // terminating.
                attempts.push(AttemptRecord {
                    attempt_number,
                    model_used: model.clone(),
                    started_at,
                    duration_ms,
                    outcome: AttemptOutcome::Failed(ErrorKind::UpstreamTimeout),
                    tokens_used: None,
                });
                fail_logged(&mut machine, "cancelled mid-flight");
                return self.failure(
                    &request,
                    ErrorKind::UpstreamTimeout,
                    attempts,
                    tier_notice,
                    &machine,
                );
            };

            match result {
                Ok(reply) => {
                    attempts.push(AttemptRecord {
                        attempt_number,
                        model_used: model.clone(),
                        started_at,
                        duration_ms,
                        outcome: AttemptOutcome::Success,
                        tokens_used: Some(reply.tokens),
                    });
                    advance_logged(&mut machine, AttemptPhase::Done, "verdict produced");

                    let cost_estimate = self.estimator.estimate_attempts(
                        &attempts,
                        &profile,
                        &request.user.subscription_tier,
                    );
                    let fallback_used =
                        attempts.iter().any(|a| a.model_used != self.primary_model);
                    tracing::info!(
                        correlation = %request.correlation_id,
                        model = %model,
                        verdict = %reply.verdict,
                        attempts = attempts.len(),
                        fallback_used,
                        phases = %machine.summary(),
                        "analysis succeeded"
                    );
                    return AnalysisOutcome::Success {
                        verdict: reply.verdict,
                        confidence: reply.confidence,
                        reasoning: reply.reasoning,
                        model_used: model.clone(),
                        fallback_used,
                        attempts,
                        speed_profile: profile,
                        cost_estimate,
                        tier_notice,
                        phase_log: machine.transitions().to_vec(),
                    };
                }
                Err(raw) => {
                    let kind = raw.classify();
                    let retry_after = raw.retry_after();
                    tracing::warn!(
                        correlation = %request.correlation_id,
                        model = %model,
                        attempt = attempt_number,
                        kind = %kind,
                        error = %raw,
                        "upstream attempt failed"
                    );
                    attempts.push(AttemptRecord {
                        attempt_number,
                        model_used: model.clone(),
                        started_at,
                        duration_ms,
                        outcome: AttemptOutcome::Failed(kind),
                        // Schema failures can still have billed tokens.
                        tokens_used: raw.billed_tokens(),
                    });
                    last_kind = Some(kind);

                    // A secondary failure is always terminal.
                    if on_secondary {
                        fail_logged(&mut machine, kind.as_str());
                        return self.failure(&request, kind, attempts, tier_notice, &machine);
                    }

                    let decision = self.retry.decide(kind, local_attempt, retry_after);
                    if decision.should_retry {
                        advance_logged(
                            &mut machine,
                            AttemptPhase::PrimaryAttempt,
                            &format!("retrying after {kind}"),
                        );
                        tracing::debug!(
                            correlation = %request.correlation_id,
                            delay_ms = decision.delay.as_millis() as u64,
                            "waiting before retry"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(decision.delay) => {}
                            _ = cancel.cancelled() => {
                                fail_logged(&mut machine, "cancelled during backoff");
                                return self.failure(&request, kind, attempts, tier_notice, &machine);
                            }
                        }
                        continue;
                    }

                    if kind.is_fallback_eligible() {
                        let reason = if kind.is_retryable() {
                            format!("primary attempts exhausted on {kind}")
                        } else {
                            format!("{kind} cannot be retried on the same model")
                        };
                        advance_logged(&mut machine, AttemptPhase::SecondaryAttempt, &reason);
                        tracing::info!(
                            correlation = %request.correlation_id,
                            model = %self.secondary_model,
                            "escalating to secondary model"
                        );
                        local_attempt = 0;
                        continue;
                    }

                    fail_logged(&mut machine, kind.as_str());
                    return self.failure(&request, kind, attempts, tier_notice, &machine);
                }
            }
        }
    }

    fn failure(
        &self,
        request: &AnalysisRequest,
        kind: ErrorKind,
        attempts: Vec<AttemptRecord>,
        tier_notice: Option<String>,
        machine: &PhaseMachine,
    ) -> AnalysisOutcome {
        let meta = kind.metadata();
        tracing::warn!(
            correlation = %request.correlation_id,
            final_error = %kind,
            attempts = attempts.len(),
            phases = %machine.summary(),
            "analysis failed"
        );
        AnalysisOutcome::Failure {
            final_error: kind,
            user_message: meta.user_message.to_string(),
            guidance: meta.guidance.to_string(),
            retryable: false,
            attempts,
            tier_notice,
            phase_log: machine.transitions().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RawFailure;
    use crate::provider::InferenceReply;
    use crate::scripted::ScriptedProvider;
    use crate::types::{ImageRef, TokenUsage, Verdict};

    // ── Phase machine ───────────────────────────────────────────────────────

    #[test]
    fn test_initial_phase() {
        let machine = PhaseMachine::new();
        assert_eq!(machine.current(), AttemptPhase::PrimaryAttempt);
        assert!(!machine.is_terminal());
        assert_eq!(machine.transitions().len(), 0);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut machine = PhaseMachine::new();
        machine.set_attempt(1);
        machine.advance(AttemptPhase::Done, Some("verdict")).unwrap();
        assert!(machine.is_terminal());
        assert_eq!(machine.transitions().len(), 1);
    }

    #[test]
    fn test_retry_loops_on_primary() {
        let mut machine = PhaseMachine::new();
        machine.set_attempt(1);
        machine
            .advance(AttemptPhase::PrimaryAttempt, Some("retrying"))
            .unwrap();
        machine.set_attempt(2);
        machine
            .advance(AttemptPhase::PrimaryAttempt, Some("retrying"))
            .unwrap();
        machine.set_attempt(3);
        machine.advance(AttemptPhase::Done, None).unwrap();
        assert_eq!(machine.transitions().len(), 3);
    }

    #[test]
    fn test_escalation_path() {
        let mut machine = PhaseMachine::new();
        machine
            .advance(AttemptPhase::SecondaryAttempt, Some("exhausted"))
            .unwrap();
        machine.advance(AttemptPhase::Done, None).unwrap();
        assert!(machine.is_terminal());
    }

    #[test]
    fn test_secondary_cannot_return_to_primary() {
        let mut machine = PhaseMachine::new();
        machine.advance(AttemptPhase::SecondaryAttempt, None).unwrap();

        let err = machine
            .advance(AttemptPhase::PrimaryAttempt, None)
            .unwrap_err();
        assert_eq!(err.from, AttemptPhase::SecondaryAttempt);
        assert_eq!(err.to, AttemptPhase::PrimaryAttempt);

        // Nor may it escalate again.
        assert!(machine
            .advance(AttemptPhase::SecondaryAttempt, None)
            .is_err());
    }

    #[test]
    fn test_failure_from_any_non_terminal_phase() {
        for phase in [AttemptPhase::PrimaryAttempt, AttemptPhase::SecondaryAttempt] {
            let mut machine = PhaseMachine::new();
            if phase == AttemptPhase::SecondaryAttempt {
                machine.advance(phase, None).unwrap();
            }
            assert!(machine.fail("test failure").is_ok());
            assert!(machine.is_terminal());
        }
    }

    #[test]
    fn test_cannot_transition_from_terminal() {
        let mut machine = PhaseMachine::new();
        machine.advance(AttemptPhase::Done, None).unwrap();
        assert!(machine.advance(AttemptPhase::PrimaryAttempt, None).is_err());
        assert!(machine.fail("nope").is_err());
    }

    #[test]
    fn test_transition_record_serde_roundtrip() {
        let record = PhaseTransition {
            from: AttemptPhase::PrimaryAttempt,
            to: AttemptPhase::SecondaryAttempt,
            attempt: 3,
            elapsed_ms: 4200,
            reason: Some("primary attempts exhausted".into()),
        };
        let json = serde_json::to_string(&record).unwrap();
        let restored: PhaseTransition = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.from, AttemptPhase::PrimaryAttempt);
        assert_eq!(restored.to, AttemptPhase::SecondaryAttempt);
        assert_eq!(restored.attempt, 3);
    }

    #[test]
    fn test_summary_mentions_terminal_phase() {
        let mut machine = PhaseMachine::new();
        machine.advance(AttemptPhase::SecondaryAttempt, None).unwrap();
        machine.fail("secondary failed").unwrap();
        let summary = machine.summary();
        assert!(summary.contains("Failed"));
        assert!(summary.contains("2 transitions"));
    }

    // ── Orchestrator ────────────────────────────────────────────────────────

    fn request() -> AnalysisRequest {
        AnalysisRequest::new(
            ImageRef::new("s3://charts/test.png")
                .with_mime("image/png")
                .with_size(250_000),
        )
    }

    fn reply(verdict: Verdict) -> InferenceReply {
        InferenceReply {
            verdict,
            confidence: 0.9,
            reasoning: "test".into(),
            tokens: TokenUsage::new(700, 90),
        }
    }

    #[tokio::test]
    async fn first_attempt_success_uses_primary_only() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_reply(reply(Verdict::Buy));

        let orchestrator = FallbackOrchestrator::new(provider.clone(), RateBudget::new(4));
        let outcome = orchestrator.analyze(request()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts().len(), 1);
        assert!(!outcome.fallback_used());
        assert_eq!(provider.calls()[0].model, "gpt-4o");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_eligible_failure_escalates_without_retry() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure(RawFailure::Http {
            status: 429,
            provider_code: Some("insufficient_quota".into()),
            message: "quota".into(),
            retry_after: None,
        });
        provider.push_reply(reply(Verdict::Hold));

        let orchestrator = FallbackOrchestrator::new(provider.clone(), RateBudget::new(4));
        let outcome = orchestrator.analyze(request()).await;

        assert!(outcome.is_success());
        assert!(outcome.fallback_used());
        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn terminal_failure_skips_retry_and_fallback() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure(RawFailure::Http {
            status: 401,
            provider_code: None,
            message: "bad key".into(),
            retry_after: None,
        });

        let orchestrator = FallbackOrchestrator::new(provider.clone(), RateBudget::new(4));
        let outcome = orchestrator.analyze(request()).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.final_error(), Some(ErrorKind::AuthenticationFailed));
        assert_eq!(outcome.attempts().len(), 1);
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn attempt_numbers_are_sequential() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure(RawFailure::Timeout { elapsed_ms: 100 });
        provider.push_failure(RawFailure::Timeout { elapsed_ms: 100 });
        provider.push_reply(reply(Verdict::Sell));

        let orchestrator = FallbackOrchestrator::new(provider, RateBudget::new(4)).with_retry(
            RetryController::new(crate::retry::RetryPolicy::default().with_max_attempts(3)),
        );

        tokio::time::pause();
        let outcome = orchestrator.analyze(request()).await;
        let numbers: Vec<u32> = outcome.attempts().iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
}
