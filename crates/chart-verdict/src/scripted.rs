//! Scripted inference provider for harness runs and tests.
//!
//! Serves canned outcomes from a queue, optionally after a simulated
//! latency. With an empty queue and heuristics enabled it derives a verdict
//! from keywords in the prompt, which keeps demo runs plausible without any
//! upstream credentials. Selected via `provider = "scripted"` in config;
//! the orchestrator cannot tell it apart from the real client.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::RawFailure;
use crate::provider::{preflight, InferenceCall, InferenceProvider, InferenceReply, PayloadLimits};
use crate::speed::ReasoningEffort;
use crate::types::{TokenUsage, Verdict};

/// One queued response.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Reply(InferenceReply),
    Fail(RawFailure),
}

/// Queue-driven [`InferenceProvider`] implementation.
pub struct ScriptedProvider {
    limits: PayloadLimits,
    latency: Option<Duration>,
    heuristics: bool,
    steps: Mutex<VecDeque<ScriptedStep>>,
    calls: Mutex<Vec<InferenceCall>>,
}

impl ScriptedProvider {
    /// Empty script, no heuristics: invoking past the queue is a failure.
    pub fn new() -> Self {
        Self {
            limits: PayloadLimits::default(),
            latency: None,
            heuristics: false,
            steps: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Empty script with keyword heuristics for open-ended harness runs.
    pub fn heuristic() -> Self {
        Self {
            heuristics: true,
            ..Self::new()
        }
    }

    /// Simulate this much upstream latency per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_limits(mut self, limits: PayloadLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Queue a successful reply.
    pub fn push_reply(&self, reply: InferenceReply) {
        self.lock_steps().push_back(ScriptedStep::Reply(reply));
    }

    /// Queue a failure.
    pub fn push_failure(&self, failure: RawFailure) {
        self.lock_steps().push_back(ScriptedStep::Fail(failure));
    }

    /// Snapshot of every call received so far, in order.
    pub fn calls(&self) -> Vec<InferenceCall> {
        self.lock_calls().clone()
    }

    /// Queued steps not yet consumed.
    pub fn remaining(&self) -> usize {
        self.lock_steps().len()
    }

    fn lock_steps(&self) -> MutexGuard<'_, VecDeque<ScriptedStep>> {
        match self.steps.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<InferenceCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn heuristic_reply(call: &InferenceCall) -> InferenceReply {
        let text = format!("{} {}", call.prompt, call.image.location).to_ascii_lowercase();
        let (verdict, cue) = if text.contains("bull") || text.contains("breakout") {
            (Verdict::Buy, "bullish cue")
        } else if text.contains("bear") || text.contains("breakdown") {
            (Verdict::Sell, "bearish cue")
        } else {
            (Verdict::Hold, "no directional cue")
        };
        let confidence = match call.effort {
            ReasoningEffort::Low => 0.6,
            ReasoningEffort::Medium => 0.7,
            ReasoningEffort::High => 0.8,
        };
        InferenceReply {
            verdict,
            confidence,
            reasoning: format!("Scripted verdict: {cue} in the request text."),
            tokens: TokenUsage::new(850 + call.prompt.len() as u64 / 4, 120),
        }
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, call: InferenceCall) -> Result<InferenceReply, RawFailure> {
        self.lock_calls().push(call.clone());
        preflight(&call.image, &self.limits)?;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let step = self.lock_steps().pop_front();
        match step {
            Some(ScriptedStep::Reply(reply)) => Ok(reply),
            Some(ScriptedStep::Fail(failure)) => Err(failure),
            None if self.heuristics => Ok(Self::heuristic_reply(&call)),
            None => Err(RawFailure::Other {
                detail: "scripted provider: no steps remaining".to_string(),
            }),
        }
    }
}
