//! The inference invocation boundary.
//!
//! Everything upstream of the orchestrator hides behind [`InferenceProvider`]:
//! the real chat-completions client and the scripted harness implement the
//! same trait, selected by configuration. A provider either returns a usable
//! reply or a [`RawFailure`] for the classifier; it never panics on upstream
//! behavior.
//!
//! Payload pre-flight lives here rather than in the orchestrator: a rejected
//! payload is still one attempt, observed the same way a provider-side
//! rejection would be.

use async_trait::async_trait;

use crate::errors::{PayloadIssue, RawFailure};
use crate::speed::ReasoningEffort;
use crate::types::{ImageRef, TokenUsage, Verdict};

/// One upstream invocation, fully specified.
#[derive(Debug, Clone)]
pub struct InferenceCall {
    pub model: String,
    pub image: ImageRef,
    pub prompt: String,
    pub effort: ReasoningEffort,
}

/// A usable model reply, provider envelope already stripped.
#[derive(Debug, Clone)]
pub struct InferenceReply {
    pub verdict: Verdict,
    /// Model-reported confidence clamped to `[0, 1]`.
    pub confidence: f64,
    pub reasoning: String,
    pub tokens: TokenUsage,
}

/// A backend capable of producing a chart verdict.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// Run one inference call.
    ///
    /// Implementations validate the payload first (see [`preflight`]) and
    /// fold every upstream failure shape into a [`RawFailure`].
    async fn invoke(&self, call: InferenceCall) -> Result<InferenceReply, RawFailure>;
}

/// Payload acceptance rules applied before dispatching upstream.
#[derive(Debug, Clone)]
pub struct PayloadLimits {
    pub max_image_bytes: u64,
    /// Accepted mime types, lowercase.
    pub allowed_mime: Vec<String>,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: 10 * 1024 * 1024,
            allowed_mime: vec![
                "image/png".to_string(),
                "image/jpeg".to_string(),
                "image/webp".to_string(),
            ],
        }
    }
}

/// Validate an image reference against the limits.
///
/// Works from declared metadata only; no image bytes are read here. Absent
/// metadata passes, the provider remains the authority on undeclared
/// payloads.
pub fn preflight(image: &ImageRef, limits: &PayloadLimits) -> Result<(), RawFailure> {
    if image.location.trim().is_empty() {
        return Err(RawFailure::Payload(PayloadIssue::Invalid {
            detail: "empty image reference".to_string(),
        }));
    }
    if let Some(size) = image.size_bytes {
        if size > limits.max_image_bytes {
            return Err(RawFailure::Payload(PayloadIssue::Oversize {
                size_bytes: size,
                limit_bytes: limits.max_image_bytes,
            }));
        }
    }
    if let Some(mime) = &image.mime {
        let mime = mime.to_ascii_lowercase();
        if !limits.allowed_mime.iter().any(|allowed| *allowed == mime) {
            return Err(RawFailure::Payload(PayloadIssue::UnsupportedMime { mime }));
        }
    }
    Ok(())
}

/// Build the analysis instruction for one request.
///
/// Kept minimal on purpose: the fixed task framing plus whatever context the
/// user supplied. Prompt engineering beyond this belongs to the caller.
pub fn analysis_prompt(description: Option<&str>) -> String {
    let mut prompt = String::from(
        "You are analyzing a trading chart image. Reply with a JSON object \
         containing exactly these fields: \"verdict\" (one of \"buy\", \
         \"sell\", \"hold\"), \"confidence\" (a number between 0 and 1), and \
         \"reasoning\" (a short explanation).",
    );
    if let Some(description) = description {
        let description = description.trim();
        if !description.is_empty() {
            prompt.push_str("\n\nContext from the user: ");
            prompt.push_str(description);
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn preflight_accepts_a_well_formed_image() {
        let image = ImageRef::new("s3://charts/a.png")
            .with_mime("image/png")
            .with_size(200_000);
        assert!(preflight(&image, &PayloadLimits::default()).is_ok());
    }

    #[test]
    fn preflight_accepts_undeclared_metadata() {
        // Size and mime unknown at upload time: defer to the provider.
        let image = ImageRef::new("s3://charts/a.png");
        assert!(preflight(&image, &PayloadLimits::default()).is_ok());
    }

    #[test]
    fn preflight_rejects_oversize_images() {
        let image = ImageRef::new("s3://charts/a.png").with_size(11 * 1024 * 1024);
        let err = preflight(&image, &PayloadLimits::default()).unwrap_err();
        assert_eq!(err.classify(), ErrorKind::ImageTooLarge);
    }

    #[test]
    fn preflight_rejects_foreign_mime_types() {
        let image = ImageRef::new("s3://charts/a.tiff").with_mime("image/tiff");
        let err = preflight(&image, &PayloadLimits::default()).unwrap_err();
        assert_eq!(err.classify(), ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn preflight_mime_check_ignores_case() {
        let image = ImageRef::new("s3://charts/a.png").with_mime("IMAGE/PNG");
        assert!(preflight(&image, &PayloadLimits::default()).is_ok());
    }

    #[test]
    fn preflight_rejects_empty_references() {
        let image = ImageRef::new("   ");
        let err = preflight(&image, &PayloadLimits::default()).unwrap_err();
        assert_eq!(err.classify(), ErrorKind::InternalValidationError);
    }

    #[test]
    fn prompt_includes_user_context_when_present() {
        let bare = analysis_prompt(None);
        assert!(bare.contains("verdict"));
        assert!(!bare.contains("Context from the user"));

        let with_context = analysis_prompt(Some("4h BTC, post-FOMC"));
        assert!(with_context.contains("4h BTC, post-FOMC"));

        // Whitespace-only context is the same as none.
        assert_eq!(analysis_prompt(Some("   ")), bare);
    }
}
