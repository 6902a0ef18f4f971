// =============================================================================
// Signal Forge Main Entry Point
// =============================================================================
//
// Produces one validated signal batch for a submission date.  The run starts
// in `test` mode (offline fixtures + deterministic scorer) unless
// SIGNALS_MODE=production is set explicitly.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod assembler;
mod audit;
mod context;
mod error;
mod inference;
mod orchestrator;
mod pipeline;
mod queue;
mod retry;
mod runtime_config;
mod sources;
mod types;
mod verification;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{NaiveDate, Utc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::inference::{CompositeBackend, InferenceBackend, OllamaBackend};
use crate::pipeline::Pipeline;
use crate::runtime_config::{PipelineConfig, SourceKind};
use crate::sources::finnhub::FinnhubFetcher;
use crate::sources::perplexity::{PerplexityFetcher, SearchMode};
use crate::sources::{FetchClient, Fetcher, RateLimitRegistry};
use crate::types::RunMode;
use crate::verification::ConsistencyChecker;

const DEFAULT_CONFIG_PATH: &str = "signals_config.json";

/// Live providers for every configured source that has credentials.
fn production_client(config: &PipelineConfig) -> anyhow::Result<FetchClient> {
    let finnhub_key = std::env::var("FINNHUB_API_KEY").ok().filter(|k| !k.is_empty());
    let perplexity_key = std::env::var("PERPLEXITY_API_KEY").ok().filter(|k| !k.is_empty());

    let mut client = FetchClient::new(RateLimitRegistry::from_sources(&config.sources));
    for source in &config.sources {
        let fetcher: Arc<dyn Fetcher> = match (source.kind, &finnhub_key, &perplexity_key) {
            (SourceKind::Fundamentals, Some(key), _) => Arc::new(FinnhubFetcher::new(
                source.name.clone(),
                key.clone(),
                source.freshness_secs,
            )?),
            (SourceKind::News, _, Some(key)) => Arc::new(PerplexityFetcher::new(
                source.name.clone(),
                SearchMode::News,
                key.clone(),
                source.freshness_secs,
            )?),
            (SourceKind::Filings, _, Some(key)) => Arc::new(PerplexityFetcher::new(
                source.name.clone(),
                SearchMode::SecFilings,
                key.clone(),
                source.freshness_secs,
            )?),
            (kind, _, _) => {
                warn!(source = %source.name, kind = ?kind, "no API key for source; it will be skipped");
                continue;
            }
        };
        client = client.with_fetcher(fetcher);
    }
    Ok(client)
}

fn parse_as_of() -> anyhow::Result<NaiveDate> {
    match std::env::var("SIGNALS_DATE") {
        Ok(raw) if !raw.trim().is_empty() => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .with_context(|| format!("SIGNALS_DATE '{raw}' is not a YYYY-MM-DD date")),
        _ => Ok(Utc::now().date_naive()),
    }
}

fn write_outputs(pipeline: &Pipeline, dir: &Path, as_of: NaiveDate) {
    let audit_path = dir.join(format!("audit_{as_of}.json"));
    match pipeline.audit().write_json(&audit_path) {
        Ok(()) => info!(
            path = %audit_path.display(),
            records = pipeline.audit().len(),
            dropped = pipeline.audit().dropped(),
            "audit log written"
        ),
        Err(e) => error!(error = %e, "failed to write audit log"),
    }
    pipeline.client().log_health();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Signal Forge starting up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("SIGNALS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = PipelineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        let config = PipelineConfig::default();
        if !Path::new(&config_path).exists() {
            if let Err(e) = config.save(&config_path) {
                warn!(error = %e, "Failed to write default config");
            }
        }
        config
    });

    // Override entities from env if available.
    if let Ok(list) = std::env::var("SIGNALS_ENTITIES") {
        config.entities = list
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.entities.is_empty() {
        bail!("no entities configured");
    }

    let mode: RunMode = match std::env::var("SIGNALS_MODE") {
        Ok(raw) => raw.parse().map_err(anyhow::Error::msg)?,
        Err(_) => RunMode::default(),
    };
    let as_of = parse_as_of()?;

    info!(entities = ?config.entities, "Configured universe");
    info!(mode = %mode, as_of = %as_of, "Run parameters");

    // ── 2. Providers ─────────────────────────────────────────────────────
    let (client, backend) = match mode {
        RunMode::Test => {
            let backend: Arc<dyn InferenceBackend> = Arc::new(CompositeBackend);
            (pipeline::fixture_client(&config), backend)
        }
        RunMode::Production => {
            let ollama = OllamaBackend::new(
                std::env::var("OLLAMA_URL").ok(),
                std::env::var("OLLAMA_MODEL").ok(),
            )?;
            info!(backend = ?ollama, "Using local model backend");
            let backend: Arc<dyn InferenceBackend> = Arc::new(ollama);
            (production_client(&config)?, backend)
        }
    };
    let checker = Arc::new(ConsistencyChecker::new(
        config.numeric_tolerance,
        config.min_token_overlap,
    ));

    // ── 3. Pipeline ──────────────────────────────────────────────────────
    let output_dir = config.output_dir.clone();
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let entities = config.entities.clone();
    let pipeline = Pipeline::new(config, client, backend, checker)?;

    // ── 4. Run (Ctrl+C aborts without emitting) ──────────────────────────
    let result = tokio::select! {
        result = pipeline.run_date(as_of, &entities) => result,
        _ = tokio::signal::ctrl_c() => {
            let progress = pipeline.queue().progress(as_of);
            warn!(
                complete = progress.complete,
                in_flight = progress.in_flight,
                total = progress.total,
                "Shutdown signal received, abandoning run without emitting a batch"
            );
            write_outputs(&pipeline, &output_dir, as_of);
            bail!("run for {as_of} interrupted");
        }
    };

    write_outputs(&pipeline, &output_dir, as_of);

    match result {
        Ok((batch, report)) => {
            let csv_path = output_dir.join(format!("signals_{as_of}.csv"));
            let json_path = output_dir.join(format!("signals_{as_of}.json"));
            batch.write_csv(&csv_path)?;
            batch.write_json(&json_path)?;

            if batch.is_empty() {
                warn!("Signal batch has no entries");
            } else if let Some(top) = batch.entries().first() {
                info!(entity = %top.entity_id, score = top.score, "Top-ranked signal");
            }
            info!(
                batch_id = %batch.id(),
                as_of = %batch.as_of(),
                emitted_at = %batch.emitted_at().to_rfc3339(),
                entries = batch.len(),
                excluded = report.progress.excluded,
                failed = report.progress.failed,
                digest = %batch.digest(),
                csv = %csv_path.display(),
                "Signal batch emitted"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Signal batch rejected");
            Err(e.into())
        }
    }
}
