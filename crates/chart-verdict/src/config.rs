//! Runtime configuration for the analysis layer.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (e.g. `CHART_VERDICT_PRIMARY_MODEL`)
//! 2. Values from a TOML config file, when one is given
//! 3. Built-in defaults
//!
//! The config also acts as the wiring point: it knows how to build the
//! selected [`InferenceProvider`] and a fully assembled
//! [`FallbackOrchestrator`] from its own values.
//!
//! ```toml
//! provider = "http"
//! primary_model = "gpt-4o"
//! secondary_model = "gpt-4o-mini"
//! max_attempts = 3
//!
//! [endpoint]
//! base_url = "https://api.openai.com/v1"
//! timeout_secs = 45
//!
//! [prices."gpt-4o"]
//! input_per_million = 2.5
//! output_per_million = 10.0
//! ```

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::budget::RateBudget;
use crate::cost::{CostEstimator, ModelRates, PriceTable};
use crate::openai_http::{ChatCompletionsProvider, EndpointSettings};
use crate::orchestrator::FallbackOrchestrator;
use crate::provider::{InferenceProvider, PayloadLimits};
use crate::retry::{RetryController, RetryPolicy};
use crate::scripted::ScriptedProvider;

const DEFAULT_PRIMARY_MODEL: &str = "gpt-4o";
const DEFAULT_SECONDARY_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 45;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_DELAY_CEILING_MS: u64 = 30_000;
const DEFAULT_BUDGET_PERMITS: u32 = 32;
const DEFAULT_MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;

/// Environment-variable names for overrides.
const ENV_PROVIDER: &str = "CHART_VERDICT_PROVIDER";
const ENV_PRIMARY_MODEL: &str = "CHART_VERDICT_PRIMARY_MODEL";
const ENV_SECONDARY_MODEL: &str = "CHART_VERDICT_SECONDARY_MODEL";
const ENV_BASE_URL: &str = "CHART_VERDICT_BASE_URL";
const ENV_API_KEY: &str = "CHART_VERDICT_API_KEY";
const ENV_TIMEOUT_SECS: &str = "CHART_VERDICT_TIMEOUT_SECS";
const ENV_MAX_ATTEMPTS: &str = "CHART_VERDICT_MAX_ATTEMPTS";
const ENV_BUDGET_PERMITS: &str = "CHART_VERDICT_BUDGET_PERMITS";

/// Which [`InferenceProvider`] implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// The real OpenAI-compatible HTTP endpoint.
    Http,
    /// The scripted harness provider; no credentials required.
    Scripted,
}

impl ProviderKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" | "openai" => Some(Self::Http),
            "scripted" | "mock" => Some(Self::Scripted),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Scripted => write!(f, "scripted"),
        }
    }
}

/// Connection settings for the HTTP provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    /// Secret; when empty the provider cannot be built.
    pub api_key: String,
    pub timeout_secs: u64,
}

/// Top-level configuration for the analysis layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub provider: ProviderKind,
    pub primary_model: String,
    pub secondary_model: String,
    pub endpoint: EndpointConfig,
    /// Attempts allowed on the primary model, counting the first.
    pub max_attempts: u32,
    /// Upper bound on any single retry delay.
    pub delay_ceiling_ms: u64,
    /// Concurrent upstream call slots shared by all requests.
    pub budget_permits: u32,
    pub max_image_bytes: u64,
    /// Accepted image mime types, lowercase.
    pub allowed_mime: Vec<String>,
    /// Per-model price overrides layered over the built-in table.
    pub prices: HashMap<String, ModelRates>,
}

impl AnalysisConfig {
    /// Hard defaults, before any file or environment input.
    ///
    /// The one ambient read here is `OPENAI_API_KEY`, which sits below the
    /// file and `CHART_VERDICT_API_KEY` in precedence.
    fn base() -> Self {
        Self {
            provider: ProviderKind::Http,
            primary_model: DEFAULT_PRIMARY_MODEL.to_string(),
            secondary_model: DEFAULT_SECONDARY_MODEL.to_string(),
            endpoint: EndpointConfig {
                base_url: DEFAULT_BASE_URL.to_string(),
                api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                timeout_secs: DEFAULT_TIMEOUT_SECS,
            },
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay_ceiling_ms: DEFAULT_DELAY_CEILING_MS,
            budget_permits: DEFAULT_BUDGET_PERMITS,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            allowed_mime: vec![
                "image/png".to_string(),
                "image/jpeg".to_string(),
                "image/webp".to_string(),
            ],
            prices: HashMap::new(),
        }
    }

    fn apply_env(&mut self) {
        if let Some(provider) = env::var(ENV_PROVIDER).ok().and_then(|v| {
            let parsed = ProviderKind::parse(&v);
            if parsed.is_none() {
                tracing::warn!(value = %v, "ignoring unrecognized provider override");
            }
            parsed
        }) {
            self.provider = provider;
        }
        if let Ok(model) = env::var(ENV_PRIMARY_MODEL) {
            self.primary_model = model;
        }
        if let Ok(model) = env::var(ENV_SECONDARY_MODEL) {
            self.secondary_model = model;
        }
        if let Ok(url) = env::var(ENV_BASE_URL) {
            self.endpoint.base_url = url;
        }
        if let Ok(key) = env::var(ENV_API_KEY) {
            self.endpoint.api_key = key;
        }
        if let Some(secs) = env_u64(ENV_TIMEOUT_SECS) {
            self.endpoint.timeout_secs = secs;
        }
        if let Some(attempts) = env_u32(ENV_MAX_ATTEMPTS) {
            self.max_attempts = attempts;
        }
        if let Some(permits) = env_u32(ENV_BUDGET_PERMITS) {
            self.budget_permits = permits;
        }
    }

    /// Build from environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::base();
        config.apply_env();
        config
    }

    /// Load without validating: defaults, overlaid by `path` when given,
    /// overlaid by environment variables.
    ///
    /// For callers that layer their own overrides on top before validating,
    /// such as the CLI's `--provider` flag; everyone else wants [`Self::load`].
    pub fn load_unvalidated(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::base();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("failed to read config file {}: {e}", path.display())
            })?;
            let file: FileConfig = toml::from_str(&text).map_err(|e| {
                anyhow::anyhow!("failed to parse config file {}: {e}", path.display())
            })?;
            file.overlay(&mut config);
        }
        config.apply_env();
        Ok(config)
    }

    /// Load configuration: defaults, overlaid by `path` when given,
    /// overlaid by environment variables, then validated.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = Self::load_unvalidated(path)?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
        Ok(config)
    }

    /// Validate the config; return an error string if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.primary_model.trim().is_empty() {
            return Err("primary_model must not be empty".to_string());
        }
        if self.secondary_model.trim().is_empty() {
            return Err("secondary_model must not be empty".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".to_string());
        }
        if self.budget_permits == 0 {
            return Err("budget_permits must be > 0".to_string());
        }
        if self.max_image_bytes == 0 {
            return Err("max_image_bytes must be > 0".to_string());
        }
        if self.allowed_mime.is_empty() {
            return Err("allowed_mime must list at least one mime type".to_string());
        }
        if self.provider == ProviderKind::Http {
            if !self.endpoint.base_url.starts_with("http") {
                return Err(format!(
                    "endpoint.base_url must be an http(s) URL, got '{}'",
                    self.endpoint.base_url
                ));
            }
            if self.endpoint.timeout_secs == 0 {
                return Err("endpoint.timeout_secs must be > 0".to_string());
            }
            if self.endpoint.api_key.trim().is_empty() {
                return Err(format!(
                    "the http provider needs an API key ({ENV_API_KEY} or OPENAI_API_KEY)"
                ));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_delay_ceiling(Duration::from_millis(self.delay_ceiling_ms))
    }

    pub fn payload_limits(&self) -> PayloadLimits {
        PayloadLimits {
            max_image_bytes: self.max_image_bytes,
            allowed_mime: self.allowed_mime.clone(),
        }
    }

    /// The built-in price table with file overrides applied.
    pub fn price_table(&self) -> PriceTable {
        let mut table = PriceTable::builtin();
        for (model, rates) in &self.prices {
            table = table.with_rates(model.clone(), *rates);
        }
        table
    }

    /// Build the configured provider implementation.
    pub fn build_provider(&self) -> anyhow::Result<Arc<dyn InferenceProvider>> {
        let limits = self.payload_limits();
        match self.provider {
            ProviderKind::Http => {
                let settings = EndpointSettings {
                    base_url: self.endpoint.base_url.clone(),
                    api_key: self.endpoint.api_key.clone(),
                    timeout: Duration::from_secs(self.endpoint.timeout_secs),
                };
                let provider = ChatCompletionsProvider::new(settings, limits)
                    .map_err(|e| anyhow::anyhow!("failed to build http client: {e}"))?;
                Ok(Arc::new(provider))
            }
            ProviderKind::Scripted => {
                Ok(Arc::new(ScriptedProvider::heuristic().with_limits(limits)))
            }
        }
    }

    /// Build a fully wired orchestrator with its own rate budget.
    pub fn build_orchestrator(&self) -> anyhow::Result<FallbackOrchestrator> {
        let provider = self.build_provider()?;
        Ok(self.orchestrator_with(provider, RateBudget::new(self.budget_permits)))
    }

    /// Wire an orchestrator around an existing provider and budget.
    ///
    /// The API layer uses this to share one budget across workers; tests use
    /// it to inject scripted providers.
    pub fn orchestrator_with(
        &self,
        provider: Arc<dyn InferenceProvider>,
        budget: Arc<RateBudget>,
    ) -> FallbackOrchestrator {
        FallbackOrchestrator::new(provider, budget)
            .with_models(self.primary_model.clone(), self.secondary_model.clone())
            .with_retry(RetryController::new(self.retry_policy()))
            .with_estimator(CostEstimator::new(self.price_table()))
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_u32(name: &str) -> Option<u32> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

// ── File shape ──────────────────────────────────────────────────────────────

/// TOML file shape: every field optional, absent fields keep their defaults.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    provider: Option<ProviderKind>,
    primary_model: Option<String>,
    secondary_model: Option<String>,
    endpoint: Option<FileEndpoint>,
    max_attempts: Option<u32>,
    delay_ceiling_ms: Option<u64>,
    budget_permits: Option<u32>,
    max_image_bytes: Option<u64>,
    allowed_mime: Option<Vec<String>>,
    prices: Option<HashMap<String, ModelRates>>,
}

#[derive(Debug, Default, Deserialize)]
struct FileEndpoint {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

impl FileConfig {
    fn overlay(self, config: &mut AnalysisConfig) {
        if let Some(provider) = self.provider {
            config.provider = provider;
        }
        if let Some(model) = self.primary_model {
            config.primary_model = model;
        }
        if let Some(model) = self.secondary_model {
            config.secondary_model = model;
        }
        if let Some(endpoint) = self.endpoint {
            if let Some(base_url) = endpoint.base_url {
                config.endpoint.base_url = base_url;
            }
            if let Some(api_key) = endpoint.api_key {
                config.endpoint.api_key = api_key;
            }
            if let Some(timeout_secs) = endpoint.timeout_secs {
                config.endpoint.timeout_secs = timeout_secs;
            }
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(ceiling) = self.delay_ceiling_ms {
            config.delay_ceiling_ms = ceiling;
        }
        if let Some(permits) = self.budget_permits {
            config.budget_permits = permits;
        }
        if let Some(bytes) = self.max_image_bytes {
            config.max_image_bytes = bytes;
        }
        if let Some(mime) = self.allowed_mime {
            config.allowed_mime = mime;
        }
        if let Some(prices) = self.prices {
            config.prices = prices;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn scripted_default_validates_without_credentials() {
        let mut config = AnalysisConfig::base();
        config.provider = ProviderKind::Scripted;
        config.endpoint.api_key.clear();
        config.validate().expect("scripted config should be valid");
    }

    #[test]
    fn http_provider_requires_an_api_key() {
        let mut config = AnalysisConfig::base();
        config.provider = ProviderKind::Http;
        config.endpoint.api_key.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_attempt_budget_is_rejected() {
        let mut config = AnalysisConfig::base();
        config.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_mime_list_is_rejected() {
        let mut config = AnalysisConfig::base();
        config.allowed_mime.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_http_base_url_is_rejected() {
        let mut config = AnalysisConfig::base();
        config.provider = ProviderKind::Http;
        config.endpoint.api_key = "sk-test".into();
        config.endpoint.base_url = "ftp://example.com".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_values_overlay_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chart-verdict.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
provider = "scripted"
primary_model = "gpt-4.1"
max_attempts = 5

[endpoint]
timeout_secs = 10

[prices."gpt-4.1"]
input_per_million = 1.0
output_per_million = 2.0
"#
        )
        .unwrap();

        let config = AnalysisConfig::load(Some(&path)).unwrap();
        assert_eq!(config.provider, ProviderKind::Scripted);
        assert_eq!(config.primary_model, "gpt-4.1");
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.endpoint.timeout_secs, 10);
        // Untouched fields keep their defaults.
        assert_eq!(config.secondary_model, DEFAULT_SECONDARY_MODEL);

        let rates = config.price_table().rates_for("gpt-4.1");
        assert!((rates.input_per_million - 1.0).abs() < 1e-9);
    }

    #[test]
    fn provider_override_applies_before_validation() {
        // The CLI overlays --provider on an unvalidated load; an http config
        // with no credentials must not fail the run before the override.
        let mut config = AnalysisConfig::load_unvalidated(None).unwrap();
        config.endpoint.api_key.clear();
        assert!(config.validate().is_err());

        config.provider = ProviderKind::Scripted;
        config
            .validate()
            .expect("scripted override needs no credentials");
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let missing = Path::new("/nonexistent/chart-verdict.toml");
        assert!(AnalysisConfig::load(Some(missing)).is_err());
    }

    #[test]
    fn provider_kind_parses_aliases() {
        assert_eq!(ProviderKind::parse("HTTP"), Some(ProviderKind::Http));
        assert_eq!(ProviderKind::parse("openai"), Some(ProviderKind::Http));
        assert_eq!(ProviderKind::parse("mock"), Some(ProviderKind::Scripted));
        assert_eq!(ProviderKind::parse("carrier-pigeon"), None);
    }

    #[test]
    fn retry_policy_reflects_config() {
        let mut config = AnalysisConfig::base();
        config.max_attempts = 7;
        config.delay_ceiling_ms = 1_000;
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.delay_ceiling, Duration::from_millis(1_000));
    }

    #[test]
    fn scripted_provider_builds_without_credentials() {
        let mut config = AnalysisConfig::base();
        config.provider = ProviderKind::Scripted;
        config.endpoint.api_key.clear();
        let provider = config.build_provider().unwrap();
        assert_eq!(provider.name(), "scripted");
    }
}
