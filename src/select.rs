//! Quality-gated model selection.
//!
//! The orchestrator drives the scheduler and generation client per
//! candidate, in strict priority order, and accepts the first output that
//! clears the quality bar. First-fit, not best-of-N: once a candidate
//! clears the threshold, no later candidate is tried even if it would
//! have scored higher. On exhaustion the prompt is compressed and handed
//! to the cloud fallback tier, which is intentionally lenient: non-empty
//! fallback content is accepted regardless of its own score.
//!
//! Nothing here raises past the outward boundary. The caller always gets
//! a [`SelectionResult`], success or not, carrying every attempt and an
//! aggregate failure message.

use crate::compress::{compress_prompt, CompressionConfig};
use crate::generation::GenerationClient;
use crate::server::GenerateOptions;
use crate::GateError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Validator verdict for one generated artifact.
#[derive(Debug, Clone)]
pub struct Validation {
    /// Quality score on a 0..100 scale.
    pub score: f64,
    /// Whether the artifact is structurally valid.
    pub is_valid: bool,
    /// Validator findings, empty when clean.
    pub errors: Vec<String>,
}

/// External artifact validator.
///
/// Implemented elsewhere; this core only consumes scores and never
/// interprets artifact content itself.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Score `content` for the given artifact type.
    ///
    /// # Errors
    ///
    /// A validator error is treated as a candidate skip, never as a
    /// selection abort.
    async fn validate(&self, content: &str, artifact_type: &str) -> Result<Validation, GateError>;
}

/// Maps artifact types to candidate orderings and quality bars.
pub trait ArtifactMapper: Send + Sync {
    /// Local candidate models for `artifact_type`, in descending
    /// priority order.
    fn priority_models(&self, artifact_type: &str) -> Vec<String>;
    /// Minimum acceptable score (0..100) for `artifact_type`.
    fn quality_threshold(&self, artifact_type: &str) -> f64;
}

/// Size-limited remote provider used when no local candidate clears the
/// bar. Receives the compressed prompt, never the original.
#[async_trait]
pub trait CloudFallback: Send + Sync {
    /// Provider label recorded on fallback attempts.
    fn name(&self) -> &str {
        "cloud-fallback"
    }

    /// Run a completion against the remote provider.
    ///
    /// # Errors
    ///
    /// Errors and empty responses both demote the selection to its best
    /// local attempt.
    async fn complete(
        &self,
        compressed_prompt: &str,
        system_message: &str,
        artifact_type: &str,
    ) -> Result<String, GateError>;
}

/// One candidate try within a selection. Ephemeral per call.
#[derive(Debug, Clone)]
pub struct ModelAttempt {
    /// Candidate model (or fallback provider label).
    pub model_name: String,
    /// Generated content.
    pub content: String,
    /// Validator score.
    pub quality_score: f64,
    /// Validator structural verdict.
    pub is_valid: bool,
    /// Validator findings.
    pub errors: Vec<String>,
    /// Wall-clock time for the generation step.
    pub generation_time: Duration,
    /// False only for the cloud fallback tier.
    pub is_local: bool,
}

/// Terminal output of one selection. Immutable once produced.
#[derive(Debug, Clone)]
pub struct SelectionResult {
    /// Whether an output was accepted.
    pub success: bool,
    /// Accepted content, or the best attempt's content on failure.
    pub content: String,
    /// Model that produced `content`, when any attempt produced content.
    pub model_used: Option<String>,
    /// Score of `content`.
    pub quality_score: f64,
    /// Every attempt, in try order.
    pub attempts: Vec<ModelAttempt>,
    /// Whether the accepted content came from the fallback tier.
    pub used_cloud_fallback: bool,
    /// Wall-clock duration of the whole selection.
    pub total_time: Duration,
    /// Aggregate human-readable failure description.
    pub error_message: Option<String>,
}

/// Drives candidates through generate-and-validate until one clears the
/// quality bar.
pub struct SelectionOrchestrator {
    client: Arc<GenerationClient>,
    validator: Arc<dyn Validator>,
    fallback: Option<Arc<dyn CloudFallback>>,
    compression: CompressionConfig,
    system_message: String,
    options: GenerateOptions,
}

impl SelectionOrchestrator {
    /// Create an orchestrator with no fallback tier.
    pub fn new(client: Arc<GenerationClient>, validator: Arc<dyn Validator>) -> Self {
        Self {
            client,
            validator,
            fallback: None,
            compression: CompressionConfig::default(),
            system_message: String::new(),
            options: GenerateOptions::default(),
        }
    }

    /// Attach a cloud fallback tier.
    pub fn with_fallback(mut self, fallback: Arc<dyn CloudFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Set the compression tuning used for the fallback prompt.
    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    /// Set the system message passed to models and the fallback.
    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = message.into();
        self
    }

    /// Set generation options applied to every candidate call.
    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    /// Select using an [`ArtifactMapper`] for ordering and threshold.
    pub async fn select_for(
        &self,
        mapper: &dyn ArtifactMapper,
        artifact_type: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> SelectionResult {
        let models = mapper.priority_models(artifact_type);
        let threshold = mapper.quality_threshold(artifact_type);
        self.select(artifact_type, prompt, threshold, &models, cancel)
            .await
    }

    /// Try `priority_models` in order until one clears `quality_threshold`.
    ///
    /// Per-candidate failures (unavailable model, failed or empty
    /// generation, validator error) are logged and skipped. A cancelled
    /// token ends the selection early with the best attempt so far as a
    /// non-success result.
    pub async fn select(
        &self,
        artifact_type: &str,
        prompt: &str,
        quality_threshold: f64,
        priority_models: &[String],
        cancel: &CancellationToken,
    ) -> SelectionResult {
        let started = Instant::now();
        let metrics = self.client.scheduler().metrics();
        let mut attempts: Vec<ModelAttempt> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        tracing::info!(
            artifact_type,
            candidates = priority_models.len(),
            threshold = quality_threshold,
            "starting quality-gated selection"
        );

        for model in priority_models {
            if cancel.is_cancelled() {
                return self.finish(attempts, failures, started, true);
            }

            let system = (!self.system_message.is_empty()).then_some(self.system_message.as_str());
            let outcome = tokio::select! {
                () = cancel.cancelled() => {
                    return self.finish(attempts, failures, started, true);
                }
                outcome = self.client.generate(model, prompt, system, self.options.clone()) => outcome,
            };

            if !outcome.success || outcome.content.trim().is_empty() {
                let reason = outcome
                    .error_message
                    .unwrap_or_else(|| "empty output".to_string());
                tracing::warn!(model = %model, reason = %reason, "candidate skipped");
                failures.push(format!("{model}: {reason}"));
                continue;
            }

            let validation = match self.validator.validate(&outcome.content, artifact_type).await
            {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(model = %model, error = %e, "validator failed, candidate skipped");
                    failures.push(format!("{model}: validation error: {e}"));
                    continue;
                }
            };

            let attempt = ModelAttempt {
                model_name: model.clone(),
                content: outcome.content,
                quality_score: validation.score,
                is_valid: validation.is_valid,
                errors: validation.errors,
                generation_time: outcome.duration,
                is_local: true,
            };

            if attempt.quality_score >= quality_threshold {
                tracing::info!(
                    model = %model,
                    score = attempt.quality_score,
                    "candidate cleared the quality bar"
                );
                let content = attempt.content.clone();
                let score = attempt.quality_score;
                attempts.push(attempt);
                return SelectionResult {
                    success: true,
                    content,
                    model_used: Some(model.clone()),
                    quality_score: score,
                    attempts,
                    used_cloud_fallback: false,
                    total_time: started.elapsed(),
                    error_message: None,
                };
            }

            metrics.record_validation_failure();
            failures.push(format!(
                "{model}: score {:.1} below threshold {:.1}",
                attempt.quality_score, quality_threshold
            ));
            attempts.push(attempt);
        }

        if let Some(fallback) = &self.fallback {
            if cancel.is_cancelled() {
                return self.finish(attempts, failures, started, true);
            }
            metrics.record_cloud_fallback();
            let compressed = compress_prompt(prompt, &self.compression);
            tracing::info!(
                provider = fallback.name(),
                original_chars = prompt.chars().count(),
                compressed_chars = compressed.chars().count(),
                "no local candidate cleared the bar, trying cloud fallback"
            );

            let fallback_started = Instant::now();
            let completion = tokio::select! {
                () = cancel.cancelled() => {
                    return self.finish(attempts, failures, started, true);
                }
                result = fallback.complete(&compressed, &self.system_message, artifact_type) => result,
            };

            match completion {
                Ok(content) if !content.trim().is_empty() => {
                    // The fallback tier is lenient by design: the score is
                    // recorded but never gates acceptance.
                    let validation = self
                        .validator
                        .validate(&content, artifact_type)
                        .await
                        .unwrap_or_else(|e| Validation {
                            score: 0.0,
                            is_valid: false,
                            errors: vec![format!("validation error: {e}")],
                        });
                    attempts.push(ModelAttempt {
                        model_name: fallback.name().to_string(),
                        content: content.clone(),
                        quality_score: validation.score,
                        is_valid: validation.is_valid,
                        errors: validation.errors,
                        generation_time: fallback_started.elapsed(),
                        is_local: false,
                    });
                    return SelectionResult {
                        success: true,
                        content,
                        model_used: Some(fallback.name().to_string()),
                        quality_score: validation.score,
                        attempts,
                        used_cloud_fallback: true,
                        total_time: started.elapsed(),
                        error_message: None,
                    };
                }
                Ok(_) => {
                    failures.push(format!("{}: returned empty content", fallback.name()));
                }
                Err(e) => {
                    failures.push(format!("{}: {e}", fallback.name()));
                }
            }
        }

        self.finish(attempts, failures, started, false)
    }

    /// Build the non-success result: best local attempt's content when
    /// any attempt produced content, empty otherwise. Partial progress is
    /// never silently dropped.
    fn finish(
        &self,
        attempts: Vec<ModelAttempt>,
        mut failures: Vec<String>,
        started: Instant,
        cancelled: bool,
    ) -> SelectionResult {
        if cancelled {
            failures.push("selection cancelled by caller".to_string());
        }
        let best = attempts
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.quality_score
                    .partial_cmp(&b.quality_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i);

        let (content, model_used, score) = match best {
            Some(i) => (
                attempts[i].content.clone(),
                Some(attempts[i].model_name.clone()),
                attempts[i].quality_score,
            ),
            None => (String::new(), None, 0.0),
        };

        let message = if failures.is_empty() {
            "no candidate models configured".to_string()
        } else {
            failures.join("; ")
        };
        tracing::warn!(error = %message, attempts = attempts.len(), "selection did not succeed");

        SelectionResult {
            success: false,
            content,
            model_used,
            quality_score: score,
            attempts,
            used_cloud_fallback: false,
            total_time: started.elapsed(),
            error_message: Some(message),
        }
    }
}
