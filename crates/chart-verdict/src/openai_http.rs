//! Chat-completions provider over an OpenAI-compatible HTTP API.
//!
//! Sends the chart as an `image_url` content part next to the instruction
//! text, asks for a JSON object reply, and maps every way the exchange can
//! go wrong into a [`RawFailure`] for the classifier: transport errors,
//! non-success statuses with their error bodies and `Retry-After` headers,
//! refusals, truncated generations, and replies that fail the verdict
//! schema.
//!
//! The reasoning-effort knob doubles as the vision detail level: low-effort
//! tiers send the image at low detail, which is the main latency and token
//! saving on vision calls.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use serde_json::json;

use async_trait::async_trait;

use crate::errors::RawFailure;
use crate::provider::{preflight, InferenceCall, InferenceProvider, InferenceReply, PayloadLimits};
use crate::speed::ReasoningEffort;
use crate::types::{TokenUsage, Verdict};

/// Connection settings for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub base_url: String,
    pub api_key: String,
    /// Whole-call deadline enforced by the HTTP client.
    pub timeout: Duration,
}

/// [`InferenceProvider`] backed by a `POST /chat/completions` endpoint.
pub struct ChatCompletionsProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limits: PayloadLimits,
}

impl ChatCompletionsProvider {
    pub fn new(settings: EndpointSettings, limits: PayloadLimits) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key,
            limits,
        })
    }

    fn map_transport_error(err: reqwest::Error, started: Instant) -> RawFailure {
        if err.is_timeout() {
            return RawFailure::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
        }
        let detail = err.to_string();
        RawFailure::Connection {
            refused: err.is_connect() && detail.contains("refused"),
            detail,
        }
    }
}

#[async_trait]
impl InferenceProvider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        "chat_completions"
    }

    async fn invoke(&self, call: InferenceCall) -> Result<InferenceReply, RawFailure> {
        preflight(&call.image, &self.limits)?;

        let payload = json!({
            "model": call.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": call.prompt },
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": call.image.location,
                            "detail": detail_for_effort(call.effort),
                        }
                    }
                ]
            }],
            "reasoning_effort": call.effort.as_str(),
            "response_format": { "type": "json_object" }
        });

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| Self::map_transport_error(err, started))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let (provider_code, message) = parse_error_body(&body, status.as_u16());
            return Err(RawFailure::Http {
                status: status.as_u16(),
                provider_code,
                message,
                retry_after,
            });
        }

        let envelope: ChatCompletion =
            response.json().await.map_err(|err| RawFailure::Schema {
                detail: format!("undecodable response body: {err}"),
                truncated: false,
                tokens: None,
            })?;
        interpret_completion(envelope)
    }
}

fn detail_for_effort(effort: ReasoningEffort) -> &'static str {
    match effort {
        ReasoningEffort::Low => "low",
        ReasoningEffort::Medium => "auto",
        ReasoningEffort::High => "high",
    }
}

/// Seconds-form `Retry-After` header, if present and sane.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Pull the machine code and message out of the provider error body.
fn parse_error_body(body: &str, status: u16) -> (Option<String>, String) {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        if let Some(detail) = envelope.error {
            let code = detail.code.or(detail.kind);
            let message = detail
                .message
                .unwrap_or_else(|| format!("upstream rejected the call with status {status}"));
            return (code, message);
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        (None, format!("upstream returned status {status}"))
    } else {
        (None, trimmed.chars().take(200).collect())
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct VerdictPayload {
    verdict: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

fn default_confidence() -> f64 {
    0.5
}

/// Models wrap JSON-mode replies in markdown fences often enough to matter.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim()
}

/// Turn a decoded completion envelope into a reply or a schema failure.
///
/// Reported usage survives either way: a schema failure carries it so the
/// attempt can still be billed.
fn interpret_completion(envelope: ChatCompletion) -> Result<InferenceReply, RawFailure> {
    let billed = envelope
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));

    let Some(choice) = envelope.choices.into_iter().next() else {
        return Err(RawFailure::Schema {
            detail: "response contained no choices".to_string(),
            truncated: false,
            tokens: billed,
        });
    };

    if let Some(refusal) = choice.refusal_text() {
        return Err(RawFailure::Refusal { message: refusal });
    }

    let truncated = choice.finish_reason.as_deref() == Some("length");
    let Some(content) = choice.message.content else {
        return Err(RawFailure::Schema {
            detail: "choice carried no content".to_string(),
            truncated,
            tokens: billed,
        });
    };

    let payload: VerdictPayload = serde_json::from_str(strip_code_fences(&content))
        .map_err(|_| RawFailure::Schema {
            detail: "reply is not the verdict JSON shape".to_string(),
            truncated,
            tokens: billed,
        })?;

    let Some(verdict) = Verdict::parse(&payload.verdict) else {
        return Err(RawFailure::Schema {
            detail: format!("unrecognized verdict '{}'", payload.verdict),
            truncated,
            tokens: billed,
        });
    };

    Ok(InferenceReply {
        verdict,
        confidence: payload.confidence.clamp(0.0, 1.0),
        reasoning: payload.reasoning,
        tokens: billed.unwrap_or_default(),
    })
}

impl Choice {
    fn refusal_text(&self) -> Option<String> {
        self.message
            .refusal
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(String::from)
    }
}
