//! Inference-server contract and implementations.
//!
//! Provides the [`InferenceServer`] trait and two implementations:
//! - [`OllamaServer`]: the local Ollama HTTP API (`/api/tags`,
//!   `/api/generate`), with NDJSON streaming and `ollama pull` for
//!   out-of-band fetches.
//! - [`MockServer`]: in-memory test double with scriptable inventory,
//!   responses, and failures.
//!
//! Unloading is expressed through the server's own idiom: a generate call
//! with an empty prompt and `keep_alive: 0` tells the server to release
//! the model immediately.
//!
//! ## Environment Variables
//!
//! - `OLLAMA_BASE_URL`: server URL (default: http://localhost:11434)

use crate::GateError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

/// One entry from the server's model inventory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelEntry {
    /// Model name as known to the server.
    pub name: String,
    /// On-disk/loaded size in bytes.
    pub size: u64,
}

/// Generation tuning options carried on every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Sampling temperature. `None` uses the server default.
    pub temperature: Option<f32>,
    /// Context window to allocate, in tokens (`num_ctx`).
    pub context_window_tokens: Option<u32>,
    /// Cap on generated tokens (`num_predict`). `None` is unbounded.
    pub max_output_tokens: Option<u32>,
}

/// A single-shot or streaming generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Target model name.
    pub model: String,
    /// Prompt text.
    pub prompt: String,
    /// Optional system prompt.
    pub system: Option<String>,
    /// Tuning options.
    pub options: GenerateOptions,
}

impl GenerateRequest {
    /// Minimal request with default options and no system prompt.
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            options: GenerateOptions::default(),
        }
    }
}

/// Non-streaming generation response.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    /// Generated text.
    pub response: String,
    /// Whether the server marked the generation complete.
    pub done: bool,
}

/// One event in a streaming generation.
///
/// The stream is lazy, finite, and non-restartable: deltas arrive in
/// order and the stream always terminates with exactly one [`Done`]
/// sentinel, even when the underlying connection ends abruptly.
///
/// [`Done`]: StreamEvent::Done
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// An incremental text fragment.
    Delta(String),
    /// Terminal sentinel; no further events follow.
    Done,
}

/// Stream of generation events.
pub type DeltaStream = ReceiverStream<StreamEvent>;

/// Contract consumed by the scheduler and generation client.
///
/// Implementations must be thread-safe (Send + Sync) for use across
/// tasks; the trait is object-safe to allow `Arc<dyn InferenceServer>`.
#[async_trait]
pub trait InferenceServer: Send + Sync {
    /// Query the inventory: every model the server knows, with sizes.
    async fn list_models(&self) -> Result<Vec<ModelEntry>, GateError>;

    /// Run a single-shot generation.
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, GateError>;

    /// Run a streaming generation. See [`StreamEvent`] for the contract.
    async fn generate_stream(&self, request: GenerateRequest) -> Result<DeltaStream, GateError>;

    /// Tell the server to release `model` from memory immediately.
    async fn unload(&self, model: &str) -> Result<(), GateError>;

    /// Fetch `model` out of band. Bounded by the implementation's pull
    /// timeout; success means a subsequent inventory check will list it.
    async fn pull(&self, model: &str) -> Result<(), GateError>;
}

// ============================================================================
// Ollama HTTP implementation
// ============================================================================

/// Wire format for `/api/tags`.
#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelEntry>,
}

/// Wire format for `/api/generate` request bodies.
#[derive(Debug, Serialize)]
struct OllamaGenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    options: OllamaOptions,
    /// `Some(0)` is the "release immediately" directive used for unload.
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<i64>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl From<&GenerateOptions> for OllamaOptions {
    fn from(o: &GenerateOptions) -> Self {
        Self {
            temperature: o.temperature,
            num_ctx: o.context_window_tokens,
            num_predict: o.max_output_tokens,
        }
    }
}

/// One NDJSON record from a streaming `/api/generate` response.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: Option<bool>,
}

/// Ollama HTTP server client.
///
/// Reads the server URL from `OLLAMA_BASE_URL` via [`OllamaServer::from_env`]
/// or defaults to `http://localhost:11434`.
///
/// ## Example
///
/// ```no_run
/// use modelgate::OllamaServer;
/// use std::time::Duration;
///
/// let server = OllamaServer::new()
///     .with_base_url("http://localhost:11434")
///     .with_request_timeout(Duration::from_secs(120));
/// ```
pub struct OllamaServer {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    pull_timeout: Duration,
}

impl OllamaServer {
    /// Create a client against the default localhost endpoint.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "http://localhost:11434".to_string(),
            request_timeout: Duration::from_secs(120),
            pull_timeout: Duration::from_secs(30 * 60),
        }
    }

    /// Create a client reading `OLLAMA_BASE_URL` from the environment.
    pub fn from_env() -> Self {
        let base_url = std::env::var("OLLAMA_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());
        Self::new().with_base_url(base_url)
    }

    /// Set the server base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the per-request HTTP timeout (non-streaming calls).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the out-of-band fetch timeout (default 30 minutes).
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Default for OllamaServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceServer for OllamaServer {
    async fn list_models(&self) -> Result<Vec<ModelEntry>, GateError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| GateError::Server(format!("inventory request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GateError::Server(format!(
                "inventory query returned {}",
                response.status()
            )));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| GateError::Server(format!("failed to parse inventory: {e}")))?;
        Ok(tags.models)
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, GateError> {
        let body = OllamaGenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
            system: request.system.as_deref(),
            options: OllamaOptions::from(&request.options),
            keep_alive: None,
        };

        let response = self
            .client
            .post(self.url("/api/generate"))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| GateError::Server(format!("generate request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(GateError::Server(format!(
                "generate returned {status}: {error_text}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| GateError::Server(format!("failed to parse generate response: {e}")))
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<DeltaStream, GateError> {
        use futures::StreamExt;

        let body = OllamaGenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            stream: true,
            system: request.system.as_deref(),
            options: OllamaOptions::from(&request.options),
            keep_alive: None,
        };

        // No per-request timeout here: a healthy stream can legitimately
        // outlive the single-shot budget.
        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| GateError::Server(format!("stream request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GateError::Server(format!(
                "stream returned {}",
                response.status()
            )));
        }

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(error = %e, "stream transport error, terminating");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_stream_line(&line) {
                        Some(StreamEvent::Done) => break 'outer,
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                // Receiver dropped; the stream is
                                // non-restartable, nothing to clean up.
                                return;
                            }
                        }
                        None => {} // malformed record, skipped by design
                    }
                }
            }
            let _ = tx.send(StreamEvent::Done).await;
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn unload(&self, model: &str) -> Result<(), GateError> {
        let body = OllamaGenerateBody {
            model,
            prompt: "",
            stream: false,
            system: None,
            options: OllamaOptions {
                temperature: None,
                num_ctx: None,
                num_predict: None,
            },
            keep_alive: Some(0),
        };

        let response = self
            .client
            .post(self.url("/api/generate"))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| GateError::Server(format!("unload request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GateError::Server(format!(
                "unload returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn pull(&self, model: &str) -> Result<(), GateError> {
        let pull = tokio::process::Command::new("ollama")
            .arg("pull")
            .arg(model)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.pull_timeout, pull)
            .await
            .map_err(|_| {
                GateError::Server(format!(
                    "pull of {model} timed out after {:?}",
                    self.pull_timeout
                ))
            })?
            .map_err(|e| GateError::Server(format!("failed to run ollama pull: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GateError::Server(format!(
                "pull of {model} failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Parse one NDJSON line into a stream event.
///
/// Returns `None` for blank or malformed lines — those are skipped, the
/// stream continues.
fn parse_stream_line(line: &[u8]) -> Option<StreamEvent> {
    let trimmed = std::str::from_utf8(line).ok()?.trim();
    if trimmed.is_empty() {
        return None;
    }
    let chunk: StreamChunk = match serde_json::from_str(trimmed) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed stream record");
            return None;
        }
    };
    if chunk.done == Some(true) {
        return Some(StreamEvent::Done);
    }
    match chunk.response {
        Some(text) if !text.is_empty() => Some(StreamEvent::Delta(text)),
        _ => None,
    }
}

// ============================================================================
// Mock server (testing)
// ============================================================================

/// Scriptable in-memory server for tests and demos.
///
/// Records every generate/unload/pull call so tests can assert on
/// interaction order and counts.
#[derive(Default)]
pub struct MockServer {
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    models: Vec<ModelEntry>,
    responses: HashMap<String, String>,
    fail_generate: HashSet<String>,
    fail_unload: HashSet<String>,
    pullable: HashMap<String, u64>,
    generate_delay: Option<Duration>,
    generate_log: Vec<String>,
    unload_log: Vec<String>,
    pull_log: Vec<String>,
}

impl MockServer {
    /// Empty mock: no models, everything succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model to the inventory with a size in GiB.
    pub fn with_model(self, name: impl Into<String>, size_gb: f64) -> Self {
        if let Ok(mut state) = self.inner.lock() {
            state.models.push(ModelEntry {
                name: name.into(),
                size: (size_gb * 1024.0 * 1024.0 * 1024.0) as u64,
            });
        }
        self
    }

    /// Fix the response text for a model (default echoes the prompt).
    pub fn with_response(self, model: impl Into<String>, response: impl Into<String>) -> Self {
        if let Ok(mut state) = self.inner.lock() {
            state.responses.insert(model.into(), response.into());
        }
        self
    }

    /// Make every generate call against `model` fail.
    pub fn failing_generate(self, model: impl Into<String>) -> Self {
        if let Ok(mut state) = self.inner.lock() {
            state.fail_generate.insert(model.into());
        }
        self
    }

    /// Make every unload call against `model` fail.
    pub fn failing_unload(self, model: impl Into<String>) -> Self {
        if let Ok(mut state) = self.inner.lock() {
            state.fail_unload.insert(model.into());
        }
        self
    }

    /// Hold every generate call (warm-ups included) for `delay` before
    /// answering, so tests can observe in-flight generations.
    pub fn with_generate_delay(self, delay: Duration) -> Self {
        if let Ok(mut state) = self.inner.lock() {
            state.generate_delay = Some(delay);
        }
        self
    }

    /// Allow `model` to be pulled; a successful pull adds it to the
    /// inventory with the given size.
    pub fn pullable(self, model: impl Into<String>, size_gb: f64) -> Self {
        if let Ok(mut state) = self.inner.lock() {
            state
                .pullable
                .insert(model.into(), (size_gb * 1024.0 * 1024.0 * 1024.0) as u64);
        }
        self
    }

    /// Models that received generate calls, in order (includes warm-ups).
    pub fn generate_log(&self) -> Vec<String> {
        self.inner.lock().map(|s| s.generate_log.clone()).unwrap_or_default()
    }

    /// Models that received unload calls, in order.
    pub fn unload_log(&self) -> Vec<String> {
        self.inner.lock().map(|s| s.unload_log.clone()).unwrap_or_default()
    }

    /// Models that were pulled, in order.
    pub fn pull_log(&self) -> Vec<String> {
        self.inner.lock().map(|s| s.pull_log.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl InferenceServer for MockServer {
    async fn list_models(&self) -> Result<Vec<ModelEntry>, GateError> {
        self.inner
            .lock()
            .map(|s| s.models.clone())
            .map_err(|_| GateError::Other("mock state poisoned".to_string()))
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, GateError> {
        // Lock released before sleeping; a std mutex guard must not be
        // held across an await point.
        let delay = self.inner.lock().ok().and_then(|s| s.generate_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self
            .inner
            .lock()
            .map_err(|_| GateError::Other("mock state poisoned".to_string()))?;
        state.generate_log.push(request.model.clone());
        if state.fail_generate.contains(&request.model) {
            return Err(GateError::Server(format!(
                "mock generate failure for {}",
                request.model
            )));
        }
        let response = state
            .responses
            .get(&request.model)
            .cloned()
            .unwrap_or_else(|| format!("echo: {}", request.prompt));
        Ok(GenerateResponse {
            response,
            done: true,
        })
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<DeltaStream, GateError> {
        let full = self.generate(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            for word in full.response.split_inclusive(' ') {
                if tx.send(StreamEvent::Delta(word.to_string())).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamEvent::Done).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn unload(&self, model: &str) -> Result<(), GateError> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| GateError::Other("mock state poisoned".to_string()))?;
        state.unload_log.push(model.to_string());
        if state.fail_unload.contains(model) {
            return Err(GateError::Server(format!("mock unload failure for {model}")));
        }
        Ok(())
    }

    async fn pull(&self, model: &str) -> Result<(), GateError> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| GateError::Other("mock state poisoned".to_string()))?;
        state.pull_log.push(model.to_string());
        if let Some(size) = state.pullable.get(model).copied() {
            state.models.push(ModelEntry {
                name: model.to_string(),
                size,
            });
            Ok(())
        } else {
            Err(GateError::Server(format!("mock: model {model} not pullable")))
        }
    }
}
