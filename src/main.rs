//! Demo binary for modelgate
//!
//! Wires a scheduler, generation client, and orchestrator against an
//! in-memory mock server and runs a few quality-gated selections, so the
//! whole admission/eviction/fallback path can be watched offline.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter (default: info)
//!
//! Pass a TOML config path as the first argument to use its VRAM and
//! selection settings; pass `--schema` to print the config JSON Schema.

use async_trait::async_trait;
use modelgate::config::export_schema;
use modelgate::select::Validation;
use modelgate::{
    init_tracing, GateConfig, GateError, GenerationClient, InferenceServer, MockServer,
    SelectionOrchestrator, Validator, VramScheduler,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Demo validator: scores by output length, capped at 100.
struct LengthValidator;

#[async_trait]
impl Validator for LengthValidator {
    async fn validate(&self, content: &str, _: &str) -> Result<Validation, GateError> {
        let score = (content.chars().count() as f64).min(100.0);
        Ok(Validation {
            score,
            is_valid: !content.trim().is_empty(),
            errors: Vec::new(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();

    let mut args = std::env::args().skip(1);
    let first = args.next();
    if first.as_deref() == Some("--schema") {
        println!("{}", export_schema()?);
        return Ok(());
    }

    let config = match first {
        Some(path) => GateConfig::load(&path)?,
        None => {
            info!("no config given, using built-in demo settings");
            toml::from_str(
                r#"
[vram]
limit_gb = 12.0
persistent = ["pinned:7b"]

[selection]
candidates = ["coder:14b", "pinned:7b"]
quality_threshold = 20.0
"#,
            )
            .map_err(|e| GateError::Config(e.to_string()))?
        }
    };

    info!("starting modelgate demo");

    let server = Arc::new(
        MockServer::new()
            .with_model("pinned:7b", 5.0)
            .with_model("coder:14b", 9.0)
            .with_response("coder:14b", "fn main() { println!(\"generated\"); }")
            .with_response("pinned:7b", "short"),
    );
    let server: Arc<dyn InferenceServer> = server;

    let scheduler = Arc::new(
        VramScheduler::new(
            Arc::clone(&server),
            config.vram.limit_gb,
            config.vram.default_model_size_gb,
            config.vram.persistent.clone(),
        )
        .with_policy(config.vram.eviction_policy),
    );
    let client = Arc::new(GenerationClient::new(Arc::clone(&scheduler), server));
    let orchestrator = SelectionOrchestrator::new(client, Arc::new(LengthValidator))
        .with_compression(config.compression.clone());

    let demo_prompts = [
        ("code", "Write a hello-world program."),
        ("code", "Write a function that reverses a string."),
        ("doc", "Describe the module layout of a small library."),
    ];

    let cancel = CancellationToken::new();
    for (artifact_type, prompt) in demo_prompts {
        let result = orchestrator
            .select(
                artifact_type,
                prompt,
                config.selection.quality_threshold,
                &config.selection.candidates,
                &cancel,
            )
            .await;
        info!(
            artifact_type,
            success = result.success,
            model = result.model_used.as_deref().unwrap_or("-"),
            score = result.quality_score,
            attempts = result.attempts.len(),
            "selection finished"
        );
    }

    let snapshot = scheduler.snapshot().await;
    info!(
        used_gb = snapshot.used_gb,
        limit_gb = snapshot.vram_limit_gb,
        resident = snapshot.active.len(),
        "final residency"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&scheduler.metrics().snapshot())?
    );

    Ok(())
}
