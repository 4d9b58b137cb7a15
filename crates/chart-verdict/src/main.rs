//! One-shot CLI driver for chart analysis.
//!
//! Loads configuration, runs a single request through the fallback
//! orchestrator, and prints the structured outcome as JSON on stdout.
//! Logs go to stderr so stdout stays machine-readable.
//!
//! # Usage
//!
//! ```bash
//! # Analyze a chart at the default balanced tier
//! chart-verdict ./btc-4h.png
//!
//! # Faster pass with extra context for the model
//! chart-verdict ./btc-4h.png --tier super-fast --description "4h BTC/USD, RSI divergence?"
//!
//! # Offline run against the scripted provider, no credentials needed
//! chart-verdict ./btc-4h.png --provider scripted
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use chart_verdict::config::{AnalysisConfig, ProviderKind};
use chart_verdict::speed::SpeedTier;
use chart_verdict::types::{AnalysisRequest, ImageRef, UserContext};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path or URL of the chart image to analyze
    image: String,

    /// Extra text context shown to the model alongside the chart
    #[arg(long)]
    description: Option<String>,

    /// Speed tier for this request (default: balanced)
    #[arg(long, value_enum)]
    tier: Option<SpeedTier>,

    /// Declared mime type of the image, e.g. image/png
    #[arg(long)]
    mime: Option<String>,

    /// Declared size of the image in bytes
    #[arg(long)]
    size_bytes: Option<u64>,

    /// User id recorded on the request (default: anonymous)
    #[arg(long)]
    user: Option<String>,

    /// Subscription tier for cost estimation: free, founder, or pro
    #[arg(long)]
    subscription: Option<String>,

    /// Path to a TOML config file (CHART_VERDICT_* variables still win)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Provider implementation (overrides config file and environment)
    #[arg(long, value_enum)]
    provider: Option<ProviderKind>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // The --provider flag lands before validation, so a scripted run stays
    // credential-free even when the loaded config points at http.
    let mut config = AnalysisConfig::load_unvalidated(args.config.as_deref())?;
    if let Some(provider) = args.provider {
        config.provider = provider;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    info!(
        provider = %config.provider,
        primary = %config.primary_model,
        secondary = %config.secondary_model,
        "chart-verdict starting"
    );

    let orchestrator = config.build_orchestrator()?;

    let mut image = ImageRef::new(&args.image);
    if let Some(mime) = args.mime {
        image = image.with_mime(mime);
    }
    if let Some(size) = args.size_bytes {
        image = image.with_size(size);
    }

    let user = match args.user {
        Some(id) => UserContext::new(id, args.subscription.unwrap_or_else(|| "free".into())),
        None => UserContext::anonymous(),
    };

    let mut request = AnalysisRequest::new(image).with_user(user);
    if let Some(description) = args.description {
        request = request.with_description(description);
    }
    if let Some(tier) = args.tier {
        request = request.with_tier(tier.as_str());
    }

    let outcome = orchestrator.analyze(request).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
