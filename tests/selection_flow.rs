//! # End-to-End Quality-Gated Selection
//!
//! Integration tests wiring config, scheduler, generation client, and
//! orchestrator together over the mock server: priority ordering, the
//! lenient fallback tier, prompt compression on the fallback path, and
//! caller-driven cancellation.

use async_trait::async_trait;
use modelgate::compress::CompressionConfig;
use modelgate::select::Validation;
use modelgate::{
    CloudFallback, GateConfig, GateError, GenerationClient, InferenceServer, MockServer,
    SelectionOrchestrator, Validator, VramScheduler,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Scores each known output; unknown content scores zero.
struct TableValidator(HashMap<String, f64>);

impl TableValidator {
    fn new(entries: &[(&str, f64)]) -> Self {
        Self(entries.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }
}

#[async_trait]
impl Validator for TableValidator {
    async fn validate(&self, content: &str, _: &str) -> Result<Validation, GateError> {
        let score = self.0.get(content).copied().unwrap_or(0.0);
        Ok(Validation {
            score,
            is_valid: score > 0.0,
            errors: if score > 0.0 {
                Vec::new()
            } else {
                vec!["unrecognised artifact".to_string()]
            },
        })
    }
}

/// Fallback that records the prompt it received.
struct RecordingFallback {
    response: String,
    seen_prompts: Mutex<Vec<String>>,
}

impl RecordingFallback {
    fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            seen_prompts: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<String> {
        self.seen_prompts.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CloudFallback for RecordingFallback {
    async fn complete(&self, compressed_prompt: &str, _: &str, _: &str) -> Result<String, GateError> {
        if let Ok(mut seen) = self.seen_prompts.lock() {
            seen.push(compressed_prompt.to_string());
        }
        Ok(self.response.clone())
    }
}

/// Fallback that only resolves once the test cancels the selection.
struct HangingFallback;

#[async_trait]
impl CloudFallback for HangingFallback {
    async fn complete(&self, _: &str, _: &str, _: &str) -> Result<String, GateError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(String::new())
    }
}

fn wire(
    server: MockServer,
    scores: &[(&str, f64)],
) -> (SelectionOrchestrator, Arc<MockServer>) {
    let server = Arc::new(server);
    let dyn_server: Arc<dyn InferenceServer> = Arc::clone(&server) as Arc<dyn InferenceServer>;
    let scheduler = Arc::new(VramScheduler::new(Arc::clone(&dyn_server), 24.0, 5.0, vec![]));
    let client = Arc::new(GenerationClient::new(scheduler, dyn_server));
    let orchestrator =
        SelectionOrchestrator::new(client, Arc::new(TableValidator::new(scores)));
    (orchestrator, server)
}

fn candidates(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_priority_order_with_mixed_scores() {
    let server = MockServer::new()
        .with_model("a", 4.0)
        .with_model("b", 4.0)
        .with_response("a", "draft")
        .with_response("b", "polished");
    let (orchestrator, server) = wire(server, &[("draft", 70.0), ("polished", 85.0)]);

    let result = orchestrator
        .select("code", "prompt", 80.0, &candidates(&["a", "b"]), &CancellationToken::new())
        .await;

    assert!(result.success);
    assert_eq!(result.model_used.as_deref(), Some("b"));
    assert_eq!(result.attempts.len(), 2);
    // a was tried first (warm-up + generate), then b.
    let log = server.generate_log();
    let first_a = log.iter().position(|m| m == "a").expect("a was called");
    let first_b = log.iter().position(|m| m == "b").expect("b was called");
    assert!(first_a < first_b, "candidates must run in priority order");
}

#[tokio::test]
async fn test_fallback_receives_compressed_prompt() {
    let server = MockServer::new().with_model("a", 4.0).with_response("a", "weak");
    let (orchestrator, _) = wire(server, &[("weak", 10.0)]);
    let fallback = Arc::new(RecordingFallback::new("cloud answer"));
    let orchestrator = orchestrator
        .with_fallback(Arc::clone(&fallback) as Arc<dyn CloudFallback>)
        .with_compression(CompressionConfig {
            target_chars: 1000,
            ..CompressionConfig::default()
        });

    // 50k characters of filler around one mandatory instruction.
    let filler = "plain filler sentence that can be dropped. ".repeat(600);
    let prompt = format!("{filler}\n\nYou MUST emit valid JSON only.\n\n{filler}");
    assert!(prompt.len() > 50_000);

    let result = orchestrator
        .select("code", &prompt, 80.0, &candidates(&["a"]), &CancellationToken::new())
        .await;

    assert!(result.success);
    assert!(result.used_cloud_fallback);
    let seen = fallback.seen();
    assert_eq!(seen.len(), 1);
    assert!(
        seen[0].chars().count() <= 1500,
        "fallback must see the compressed prompt, got {} chars",
        seen[0].chars().count()
    );
    assert!(
        seen[0].contains("MUST emit valid JSON"),
        "mandatory instruction must survive compression"
    );
}

#[tokio::test]
async fn test_cancellation_mid_fallback_keeps_best_attempt() {
    let server = MockServer::new().with_model("a", 4.0).with_response("a", "partial");
    let (orchestrator, _) = wire(server, &[("partial", 55.0)]);
    let orchestrator = orchestrator.with_fallback(Arc::new(HangingFallback));

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = orchestrator
        .select("code", "prompt", 80.0, &candidates(&["a"]), &cancel)
        .await;

    assert!(!result.success);
    assert_eq!(result.content, "partial", "best attempt survives cancellation");
    assert!((result.quality_score - 55.0).abs() < f64::EPSILON);
    assert!(result
        .error_message
        .expect("aggregate message present")
        .contains("cancelled"));
}

#[tokio::test]
async fn test_config_driven_wiring_runs_selection() {
    let config: GateConfig = toml::from_str(
        r#"
[vram]
limit_gb = 12.0
persistent = ["keep:4b"]

[selection]
candidates = ["keep:4b"]
quality_threshold = 50.0
"#,
    )
    .expect("demo config parses");
    config.validate().expect("demo config is valid");

    let server = MockServer::new()
        .with_model("keep:4b", 4.0)
        .with_response("keep:4b", "good answer");
    let server: Arc<dyn InferenceServer> = Arc::new(server);
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
    let orchestrator = SelectionOrchestrator::new(
        client,
        Arc::new(TableValidator::new(&[("good answer", 90.0)])),
    );

    let result = orchestrator
        .select(
            "code",
            "prompt",
            config.selection.quality_threshold,
            &config.selection.candidates,
            &CancellationToken::new(),
        )
        .await;
    assert!(result.success);
    assert_eq!(result.model_used.as_deref(), Some("keep:4b"));

    let metrics = scheduler.metrics().snapshot();
    assert_eq!(metrics.admissions, 1);
    assert_eq!(metrics.generate_calls, 1);
}
