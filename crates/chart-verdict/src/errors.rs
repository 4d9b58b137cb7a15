//! Failure taxonomy with retry and fallback classification.
//!
//! Every upstream failure crosses exactly one boundary on its way into the
//! orchestrator: [`RawFailure::classify`]. Downstream logic only ever sees
//! the closed [`ErrorKind`] enumeration, never raw provider payload shapes.
//! Classification is total: any input lands on a kind, the unmatched rest on
//! `unknown_upstream_error`.
//!
//! ## Kinds
//!
//! | Kind                        | Retryable | Fallback-eligible |
//! |-----------------------------|-----------|-------------------|
//! | `rate_limited`              | yes       | yes               |
//! | `upstream_timeout`          | yes       | yes               |
//! | `upstream_unavailable`      | yes       | yes               |
//! | `model_overloaded`          | yes       | yes               |
//! | `network_error`             | yes       | yes               |
//! | `unknown_upstream_error`    | yes       | yes               |
//! | `quota_exceeded`            | no        | yes               |
//! | `malformed_response`        | no        | yes               |
//! | `partial_response`          | no        | yes               |
//! | `generic_server_error`      | no        | yes               |
//! | `invalid_image`             | no        | no                |
//! | `image_too_large`           | no        | no                |
//! | `unsupported_format`        | no        | no                |
//! | `authentication_failed`     | no        | no                |
//! | `content_policy_rejected`   | no        | no                |
//! | `internal_validation_error` | no        | no                |
//!
//! Retryable means a same-model retry may help. Fallback-eligible means a
//! switch to the secondary model may help even when retrying cannot: the
//! failure is tied to the model or its quota pool, not to the request itself.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TokenUsage;

// ── Raw failures ──────────────────────────────────────────────────────────

/// Why an image payload was rejected before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadIssue {
    /// The image bytes or data URL could not be decoded as an image at all.
    Undecodable { detail: String },
    /// Declared size exceeds the configured maximum.
    Oversize { size_bytes: u64, limit_bytes: u64 },
    /// Declared mime type is not on the accepted list.
    UnsupportedMime { mime: String },
    /// The request itself is malformed on our side (empty reference, etc.).
    Invalid { detail: String },
}

impl fmt::Display for PayloadIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undecodable { detail } => write!(f, "undecodable image: {detail}"),
            Self::Oversize {
                size_bytes,
                limit_bytes,
            } => write!(f, "image is {size_bytes} bytes, limit is {limit_bytes}"),
            Self::UnsupportedMime { mime } => write!(f, "unsupported mime type '{mime}'"),
            Self::Invalid { detail } => write!(f, "invalid request: {detail}"),
        }
    }
}

/// A failure as observed at the inference boundary, before classification.
///
/// Providers surface failures in incompatible shapes (status codes, error
/// bodies, transport errors, refusal text). The provider adapter folds each
/// of them into one of these variants; everything else in the crate works
/// from the classified [`ErrorKind`] instead.
#[derive(Debug, Clone, Error)]
pub enum RawFailure {
    /// Non-success HTTP response from the provider.
    #[error("upstream returned HTTP {status}: {message}")]
    Http {
        status: u16,
        /// Machine-readable code from the provider error body, if any.
        provider_code: Option<String>,
        message: String,
        /// Provider-advertised wait before the next attempt.
        retry_after: Option<Duration>,
    },

    /// The call exceeded its deadline or was aborted mid-flight.
    #[error("upstream call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Transport-level failure before any HTTP response arrived.
    #[error("connection to upstream failed: {detail}")]
    Connection { refused: bool, detail: String },

    /// The payload was rejected by pre-flight checks, no call was dispatched.
    #[error("payload rejected: {0}")]
    Payload(PayloadIssue),

    /// A success-shaped response that violates the verdict schema.
    #[error("unusable model response: {detail}")]
    Schema {
        detail: String,
        /// True when the response was cut off (length-limited generation).
        truncated: bool,
        /// Usage the provider reported; the attempt billed despite failing.
        tokens: Option<TokenUsage>,
    },

    /// The provider declined the request on content-policy grounds.
    #[error("provider refused the request: {message}")]
    Refusal { message: String },

    /// Anything the adapter could not shape into the variants above.
    #[error("{detail}")]
    Other { detail: String },
}

fn code_signals_quota(code: &str) -> bool {
    code.contains("quota") || code.contains("billing") || code.contains("insufficient_funds")
}

fn code_signals_rate_limit(code: &str) -> bool {
    code.contains("rate_limit") || code.contains("rate_limited") || code == "requests"
}

fn code_signals_overload(code: &str) -> bool {
    code.contains("overload") || code.contains("capacity")
}

fn code_signals_content_policy(code: &str) -> bool {
    code.contains("content_policy") || code.contains("content_filter") || code.contains("moderation")
}

impl RawFailure {
    /// Map this failure onto the closed [`ErrorKind`] taxonomy.
    ///
    /// First match wins: rate-limit and quota signals, then timeouts, then
    /// auth, then availability (5xx / refused connection), then payload and
    /// response-shape failures, then content policy, then plain network
    /// errors. Anything unmatched is `unknown_upstream_error`; this function
    /// never fails.
    pub fn classify(&self) -> ErrorKind {
        match self {
            Self::Http {
                status,
                provider_code,
                ..
            } => {
                let code = provider_code
                    .as_deref()
                    .unwrap_or_default()
                    .to_ascii_lowercase();

                // Providers deliver exhausted quotas under HTTP 429 as well;
                // the quota code outranks the bare status.
                if *status == 402 || code_signals_quota(&code) {
                    ErrorKind::QuotaExceeded
                } else if *status == 429 || code_signals_rate_limit(&code) {
                    ErrorKind::RateLimited
                } else if *status == 408 {
                    ErrorKind::UpstreamTimeout
                } else if *status == 401 || *status == 403 {
                    ErrorKind::AuthenticationFailed
                } else if *status >= 500 {
                    if *status == 529 || code_signals_overload(&code) {
                        ErrorKind::ModelOverloaded
                    } else {
                        ErrorKind::UpstreamUnavailable
                    }
                } else if code_signals_content_policy(&code) {
                    ErrorKind::ContentPolicyRejected
                } else if *status == 413 || code.contains("too_large") {
                    ErrorKind::ImageTooLarge
                } else if *status == 415 {
                    ErrorKind::UnsupportedFormat
                } else if code.contains("invalid_image") || code.contains("image_parse") {
                    ErrorKind::InvalidImage
                } else if *status >= 400 {
                    ErrorKind::GenericServerError
                } else {
                    ErrorKind::UnknownUpstreamError
                }
            }
            Self::Timeout { .. } => ErrorKind::UpstreamTimeout,
            Self::Connection { refused: true, .. } => ErrorKind::UpstreamUnavailable,
            Self::Connection { refused: false, .. } => ErrorKind::NetworkError,
            Self::Payload(issue) => match issue {
                PayloadIssue::Undecodable { .. } => ErrorKind::InvalidImage,
                PayloadIssue::Oversize { .. } => ErrorKind::ImageTooLarge,
                PayloadIssue::UnsupportedMime { .. } => ErrorKind::UnsupportedFormat,
                PayloadIssue::Invalid { .. } => ErrorKind::InternalValidationError,
            },
            Self::Schema { truncated, .. } => {
                if *truncated {
                    ErrorKind::PartialResponse
                } else {
                    ErrorKind::MalformedResponse
                }
            }
            Self::Refusal { .. } => ErrorKind::ContentPolicyRejected,
            Self::Other { .. } => ErrorKind::UnknownUpstreamError,
        }
    }

    /// Provider-advertised retry delay, when the failure carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Tokens the provider reported billing before the failure, if any.
    pub fn billed_tokens(&self) -> Option<TokenUsage> {
        match self {
            Self::Schema { tokens, .. } => *tokens,
            _ => None,
        }
    }
}

// ── Classified kinds ──────────────────────────────────────────────────────

/// The closed set of classified failure kinds.
///
/// Sixteen variants; nothing in the crate creates failure categories outside
/// this set. Each kind carries static [`ErrorMeta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // ── Retryable ─────────────────────────────────────────────────────────
    /// Provider rate limit hit (HTTP 429 or equivalent code).
    RateLimited,
    /// The upstream call timed out or was aborted.
    UpstreamTimeout,
    /// Provider 5xx or connection refused.
    UpstreamUnavailable,
    /// The specific model is saturated (provider overload signal).
    ModelOverloaded,
    /// Transport-layer failure without a refused connection.
    NetworkError,
    /// No recognizable signal; the catch-all kind.
    UnknownUpstreamError,

    // ── Non-retryable, fallback-eligible ──────────────────────────────────
    /// The account or model quota pool is exhausted.
    QuotaExceeded,
    /// Success-shaped response missing or violating the verdict schema.
    MalformedResponse,
    /// Response truncated before the verdict was complete.
    PartialResponse,
    /// Unclassified upstream 4xx rejection.
    GenericServerError,

    // ── Terminal ──────────────────────────────────────────────────────────
    /// The image could not be decoded.
    InvalidImage,
    /// The image exceeds the size limit.
    ImageTooLarge,
    /// The image mime type is not accepted.
    UnsupportedFormat,
    /// Upstream rejected our credentials (401/403).
    AuthenticationFailed,
    /// Provider content policy declined the request.
    ContentPolicyRejected,
    /// The request was malformed on our side.
    InternalValidationError,
}

/// Static metadata for one [`ErrorKind`].
///
/// `user_message` and `guidance` are the only failure text the caller ever
/// sees; provider-internal messages stay inside logs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ErrorMeta {
    /// Whether a same-model retry may succeed.
    pub retryable: bool,
    /// Whether switching to the secondary model may succeed.
    pub fallback_eligible: bool,
    /// Short user-facing description of what went wrong.
    pub user_message: &'static str,
    /// Actionable next step for the end user.
    pub guidance: &'static str,
    /// Base backoff delay when retrying this kind.
    pub default_delay_ms: u64,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 16] = [
        ErrorKind::RateLimited,
        ErrorKind::UpstreamTimeout,
        ErrorKind::UpstreamUnavailable,
        ErrorKind::ModelOverloaded,
        ErrorKind::NetworkError,
        ErrorKind::UnknownUpstreamError,
        ErrorKind::QuotaExceeded,
        ErrorKind::MalformedResponse,
        ErrorKind::PartialResponse,
        ErrorKind::GenericServerError,
        ErrorKind::InvalidImage,
        ErrorKind::ImageTooLarge,
        ErrorKind::UnsupportedFormat,
        ErrorKind::AuthenticationFailed,
        ErrorKind::ContentPolicyRejected,
        ErrorKind::InternalValidationError,
    ];

    /// Static metadata lookup. Pure, never fails.
    pub fn metadata(self) -> &'static ErrorMeta {
        match self {
            Self::RateLimited => &ErrorMeta {
                retryable: true,
                fallback_eligible: true,
                user_message: "The analysis service is receiving too many requests right now.",
                guidance: "Wait a few seconds and try again.",
                default_delay_ms: 5_000,
            },
            Self::UpstreamTimeout => &ErrorMeta {
                retryable: true,
                fallback_eligible: true,
                user_message: "The analysis took longer than expected and was stopped.",
                guidance: "Try again; a faster speed mode usually completes sooner.",
                default_delay_ms: 1_000,
            },
            Self::UpstreamUnavailable => &ErrorMeta {
                retryable: true,
                fallback_eligible: true,
                user_message: "The analysis service is temporarily unavailable.",
                guidance: "Try again in a minute.",
                default_delay_ms: 2_000,
            },
            Self::ModelOverloaded => &ErrorMeta {
                retryable: true,
                fallback_eligible: true,
                user_message: "The selected model is overloaded right now.",
                guidance: "Try again shortly, or switch to a faster speed mode.",
                default_delay_ms: 3_000,
            },
            Self::NetworkError => &ErrorMeta {
                retryable: true,
                fallback_eligible: true,
                user_message: "A network problem interrupted the analysis.",
                guidance: "Check your connection and try again.",
                default_delay_ms: 750,
            },
            Self::UnknownUpstreamError => &ErrorMeta {
                retryable: true,
                fallback_eligible: true,
                user_message: "Something unexpected went wrong during the analysis.",
                guidance: "Try again in a few seconds.",
                default_delay_ms: 1_500,
            },
            Self::QuotaExceeded => &ErrorMeta {
                retryable: false,
                fallback_eligible: true,
                user_message: "The analysis quota for this model has been used up.",
                guidance: "Upgrade your plan or wait for the quota window to reset.",
                default_delay_ms: 0,
            },
            Self::MalformedResponse => &ErrorMeta {
                retryable: false,
                fallback_eligible: true,
                user_message: "The model returned an answer we could not read.",
                guidance: "Try again; a different model will be used if this persists.",
                default_delay_ms: 0,
            },
            Self::PartialResponse => &ErrorMeta {
                retryable: false,
                fallback_eligible: true,
                user_message: "The model returned an incomplete answer.",
                guidance: "Try again, or pick a higher accuracy mode.",
                default_delay_ms: 0,
            },
            Self::GenericServerError => &ErrorMeta {
                retryable: false,
                fallback_eligible: true,
                user_message: "The analysis request was rejected by the provider.",
                guidance: "Try a different image or speed mode; contact support if it persists.",
                default_delay_ms: 0,
            },
            Self::InvalidImage => &ErrorMeta {
                retryable: false,
                fallback_eligible: false,
                user_message: "The uploaded image could not be read.",
                guidance: "Re-export the chart as PNG or JPEG and upload it again.",
                default_delay_ms: 0,
            },
            Self::ImageTooLarge => &ErrorMeta {
                retryable: false,
                fallback_eligible: false,
                user_message: "The uploaded image is too large to analyze.",
                guidance: "Reduce the image size and try again.",
                default_delay_ms: 0,
            },
            Self::UnsupportedFormat => &ErrorMeta {
                retryable: false,
                fallback_eligible: false,
                user_message: "This image format is not supported.",
                guidance: "Upload the chart as PNG, JPEG, or WebP.",
                default_delay_ms: 0,
            },
            Self::AuthenticationFailed => &ErrorMeta {
                retryable: false,
                fallback_eligible: false,
                user_message: "The analysis service rejected our credentials.",
                guidance: "This is a configuration problem on our side; contact support.",
                default_delay_ms: 0,
            },
            Self::ContentPolicyRejected => &ErrorMeta {
                retryable: false,
                fallback_eligible: false,
                user_message: "The image was declined by the provider's content policy.",
                guidance: "Make sure the upload is a trading chart and try a different image.",
                default_delay_ms: 0,
            },
            Self::InternalValidationError => &ErrorMeta {
                retryable: false,
                fallback_eligible: false,
                user_message: "The analysis request was malformed on our side.",
                guidance: "Contact support if this keeps happening.",
                default_delay_ms: 0,
            },
        }
    }

    /// Whether a same-model retry may succeed for this kind.
    pub fn is_retryable(self) -> bool {
        self.metadata().retryable
    }

    /// Whether escalating to the secondary model may succeed.
    pub fn is_fallback_eligible(self) -> bool {
        self.metadata().fallback_eligible
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::ModelOverloaded => "model_overloaded",
            Self::NetworkError => "network_error",
            Self::UnknownUpstreamError => "unknown_upstream_error",
            Self::QuotaExceeded => "quota_exceeded",
            Self::MalformedResponse => "malformed_response",
            Self::PartialResponse => "partial_response",
            Self::GenericServerError => "generic_server_error",
            Self::InvalidImage => "invalid_image",
            Self::ImageTooLarge => "image_too_large",
            Self::UnsupportedFormat => "unsupported_format",
            Self::AuthenticationFailed => "authentication_failed",
            Self::ContentPolicyRejected => "content_policy_rejected",
            Self::InternalValidationError => "internal_validation_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16, code: Option<&str>) -> RawFailure {
        RawFailure::Http {
            status,
            provider_code: code.map(String::from),
            message: "test".into(),
            retry_after: None,
        }
    }

    #[test]
    fn rate_limit_status_wins() {
        assert_eq!(http(429, None).classify(), ErrorKind::RateLimited);
        assert_eq!(
            http(429, Some("rate_limit_exceeded")).classify(),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn quota_code_outranks_rate_limit_status() {
        assert_eq!(
            http(429, Some("insufficient_quota")).classify(),
            ErrorKind::QuotaExceeded
        );
        assert_eq!(http(402, None).classify(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn timeouts_classify_as_upstream_timeout() {
        let raw = RawFailure::Timeout { elapsed_ms: 45_000 };
        assert_eq!(raw.classify(), ErrorKind::UpstreamTimeout);
        assert_eq!(http(408, None).classify(), ErrorKind::UpstreamTimeout);
    }

    #[test]
    fn auth_statuses_classify_as_authentication_failed() {
        assert_eq!(http(401, None).classify(), ErrorKind::AuthenticationFailed);
        assert_eq!(http(403, None).classify(), ErrorKind::AuthenticationFailed);
    }

    #[test]
    fn five_xx_and_refused_connection_are_unavailable() {
        assert_eq!(http(500, None).classify(), ErrorKind::UpstreamUnavailable);
        assert_eq!(http(502, None).classify(), ErrorKind::UpstreamUnavailable);
        assert_eq!(http(503, None).classify(), ErrorKind::UpstreamUnavailable);

        let refused = RawFailure::Connection {
            refused: true,
            detail: "connection refused".into(),
        };
        assert_eq!(refused.classify(), ErrorKind::UpstreamUnavailable);
    }

    #[test]
    fn overload_signals_refine_unavailability() {
        assert_eq!(http(529, None).classify(), ErrorKind::ModelOverloaded);
        assert_eq!(
            http(503, Some("engine_overloaded")).classify(),
            ErrorKind::ModelOverloaded
        );
    }

    #[test]
    fn payload_issues_map_to_image_kinds() {
        let undecodable = RawFailure::Payload(PayloadIssue::Undecodable {
            detail: "not a png".into(),
        });
        assert_eq!(undecodable.classify(), ErrorKind::InvalidImage);

        let oversize = RawFailure::Payload(PayloadIssue::Oversize {
            size_bytes: 20_000_000,
            limit_bytes: 10_485_760,
        });
        assert_eq!(oversize.classify(), ErrorKind::ImageTooLarge);

        let mime = RawFailure::Payload(PayloadIssue::UnsupportedMime {
            mime: "image/tiff".into(),
        });
        assert_eq!(mime.classify(), ErrorKind::UnsupportedFormat);

        let invalid = RawFailure::Payload(PayloadIssue::Invalid {
            detail: "empty image reference".into(),
        });
        assert_eq!(invalid.classify(), ErrorKind::InternalValidationError);
    }

    #[test]
    fn schema_failures_split_on_truncation() {
        let malformed = RawFailure::Schema {
            detail: "missing verdict field".into(),
            truncated: false,
            tokens: None,
        };
        assert_eq!(malformed.classify(), ErrorKind::MalformedResponse);

        let partial = RawFailure::Schema {
            detail: "finish_reason=length".into(),
            truncated: true,
            tokens: None,
        };
        assert_eq!(partial.classify(), ErrorKind::PartialResponse);
    }

    #[test]
    fn billed_tokens_ride_on_schema_failures_only() {
        let schema = RawFailure::Schema {
            detail: "missing verdict field".into(),
            truncated: false,
            tokens: Some(TokenUsage::new(900, 40)),
        };
        assert_eq!(schema.billed_tokens(), Some(TokenUsage::new(900, 40)));
        assert_eq!(http(500, None).billed_tokens(), None);
        assert_eq!(
            RawFailure::Timeout { elapsed_ms: 10 }.billed_tokens(),
            None
        );
    }

    #[test]
    fn refusals_are_content_policy() {
        let refusal = RawFailure::Refusal {
            message: "cannot analyze this image".into(),
        };
        assert_eq!(refusal.classify(), ErrorKind::ContentPolicyRejected);
        assert_eq!(
            http(400, Some("content_policy_violation")).classify(),
            ErrorKind::ContentPolicyRejected
        );
    }

    #[test]
    fn unrefused_transport_errors_are_network_errors() {
        let raw = RawFailure::Connection {
            refused: false,
            detail: "dns lookup failed".into(),
        };
        assert_eq!(raw.classify(), ErrorKind::NetworkError);
    }

    #[test]
    fn leftover_4xx_is_generic_server_error() {
        assert_eq!(http(400, None).classify(), ErrorKind::GenericServerError);
        assert_eq!(
            http(422, Some("unprocessable")).classify(),
            ErrorKind::GenericServerError
        );
    }

    #[test]
    fn classification_is_total() {
        let raw = RawFailure::Other {
            detail: "???".into(),
        };
        assert_eq!(raw.classify(), ErrorKind::UnknownUpstreamError);
    }

    #[test]
    fn retryable_set_matches_policy() {
        let retryable = [
            ErrorKind::RateLimited,
            ErrorKind::UpstreamTimeout,
            ErrorKind::UpstreamUnavailable,
            ErrorKind::NetworkError,
            ErrorKind::ModelOverloaded,
            ErrorKind::UnknownUpstreamError,
        ];
        for kind in ErrorKind::ALL {
            assert_eq!(
                kind.is_retryable(),
                retryable.contains(&kind),
                "retryability mismatch for {kind}"
            );
        }
    }

    #[test]
    fn retryable_kinds_are_all_fallback_eligible() {
        for kind in ErrorKind::ALL {
            if kind.is_retryable() {
                assert!(kind.is_fallback_eligible(), "{kind} should be eligible");
            }
        }
    }

    #[test]
    fn request_bound_kinds_are_not_fallback_eligible() {
        for kind in [
            ErrorKind::InvalidImage,
            ErrorKind::ImageTooLarge,
            ErrorKind::UnsupportedFormat,
            ErrorKind::AuthenticationFailed,
            ErrorKind::ContentPolicyRejected,
            ErrorKind::InternalValidationError,
        ] {
            assert!(!kind.is_fallback_eligible(), "{kind} should be terminal");
        }
    }

    #[test]
    fn every_kind_has_guidance() {
        for kind in ErrorKind::ALL {
            let meta = kind.metadata();
            assert!(!meta.user_message.is_empty());
            assert!(!meta.guidance.is_empty());
        }
    }

    #[test]
    fn rate_limited_uses_the_largest_base_delay() {
        let rate = ErrorKind::RateLimited.metadata().default_delay_ms;
        for kind in ErrorKind::ALL {
            if kind != ErrorKind::RateLimited && kind.is_retryable() {
                assert!(kind.metadata().default_delay_ms < rate);
            }
        }
    }

    #[test]
    fn retry_after_only_rides_on_http_failures() {
        let raw = RawFailure::Http {
            status: 429,
            provider_code: None,
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(raw.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(RawFailure::Timeout { elapsed_ms: 10 }.retry_after(), None);
    }

    #[test]
    fn kind_serde_uses_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ImageTooLarge).unwrap();
        assert_eq!(json, "\"image_too_large\"");
        let kind: ErrorKind = serde_json::from_str("\"rate_limited\"").unwrap();
        assert_eq!(kind, ErrorKind::RateLimited);
    }
}
