//! Generation calls against admitted models.
//!
//! The client front-ends the scheduler: every call first guarantees
//! admission, then runs the request with the model marked `InUse`, and
//! returns the model to `Ready` afterwards. Transport and HTTP failures
//! are transient by design: they come back as data in the
//! [`GenerationOutcome`], never as a sticky error on the ledger entry.

use crate::scheduler::VramScheduler;
use crate::server::{DeltaStream, GenerateOptions, GenerateRequest, InferenceServer, StreamEvent};
use crate::GateError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Result of one single-shot generation attempt.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    /// Model the attempt ran against.
    pub model: String,
    /// Generated text; empty on failure.
    pub content: String,
    /// Whether the attempt produced content.
    pub success: bool,
    /// Failure description when `success` is false.
    pub error_message: Option<String>,
    /// Wall-clock duration of the attempt, admission included.
    pub duration: Duration,
}

impl GenerationOutcome {
    fn failure(model: &str, message: String, started: Instant) -> Self {
        Self {
            model: model.to_string(),
            content: String::new(),
            success: false,
            error_message: Some(message),
            duration: started.elapsed(),
        }
    }
}

/// Single-shot and streaming generation against scheduled models.
pub struct GenerationClient {
    scheduler: Arc<VramScheduler>,
    server: Arc<dyn InferenceServer>,
}

impl GenerationClient {
    /// Create a client sharing the scheduler's server handle.
    pub fn new(scheduler: Arc<VramScheduler>, server: Arc<dyn InferenceServer>) -> Self {
        Self { scheduler, server }
    }

    /// Handle to the underlying scheduler.
    pub fn scheduler(&self) -> Arc<VramScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Run one single-shot generation.
    ///
    /// Never returns an error: admission failures and transport failures
    /// both surface as a failed [`GenerationOutcome`]. After a transport
    /// failure the model stays `Ready` and eligible for later attempts.
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: Option<&str>,
        options: GenerateOptions,
    ) -> GenerationOutcome {
        let started = Instant::now();

        if !self.scheduler.ensure_available(model).await {
            let message = self
                .scheduler
                .record(model)
                .await
                .and_then(|r| r.error_message)
                .unwrap_or_else(|| "model unavailable".to_string());
            return GenerationOutcome::failure(model, message, started);
        }

        self.scheduler.begin_generation(model).await;
        let request = GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            system: system.map(String::from),
            options,
        };
        let result = self.server.generate(request).await;
        let success = result.is_ok();
        self.scheduler.finish_generation(model, success).await;
        self.scheduler.metrics().record_generate(success);

        match result {
            Ok(response) => GenerationOutcome {
                model: model.to_string(),
                content: response.response,
                success: true,
                error_message: None,
                duration: started.elapsed(),
            },
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "generation failed (transient)");
                GenerationOutcome::failure(model, e.to_string(), started)
            }
        }
    }

    /// Run a streaming generation.
    ///
    /// The returned stream is lazy, finite, and non-restartable; it always
    /// terminates with [`StreamEvent::Done`], at which point the model has
    /// already been returned to `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Server`] if the model cannot be made
    /// available or the stream cannot be opened. Mid-stream faults do not
    /// error: the stream simply terminates.
    pub async fn generate_stream(
        &self,
        model: &str,
        prompt: &str,
        system: Option<&str>,
        options: GenerateOptions,
    ) -> Result<DeltaStream, GateError> {
        if !self.scheduler.ensure_available(model).await {
            let message = self
                .scheduler
                .record(model)
                .await
                .and_then(|r| r.error_message)
                .unwrap_or_else(|| "model unavailable".to_string());
            return Err(GateError::Server(message));
        }

        self.scheduler.begin_generation(model).await;
        let request = GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            system: system.map(String::from),
            options,
        };
        let inner = match self.server.generate_stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.scheduler.finish_generation(model, false).await;
                self.scheduler.metrics().record_generate(false);
                return Err(e);
            }
        };

        // Forward events and settle the ledger before emitting the
        // sentinel, so consumers observing Done see the model Ready.
        let scheduler = Arc::clone(&self.scheduler);
        let model = model.to_string();
        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            let mut inner = inner;
            let mut completed = false;
            while let Some(event) = inner.next().await {
                match event {
                    StreamEvent::Done => {
                        completed = true;
                        break;
                    }
                    delta => {
                        if tx.send(delta).await.is_err() {
                            break;
                        }
                    }
                }
            }
            scheduler.finish_generation(&model, completed).await;
            scheduler.metrics().record_generate(completed);
            let _ = tx.send(StreamEvent::Done).await;
        });

        Ok(ReceiverStream::new(rx))
    }
}
