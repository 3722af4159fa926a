//! # modelgate
//!
//! VRAM-aware model scheduling and quality-gated selection for a local
//! inference server with a size-limited cloud fallback.
//!
//! ## Architecture
//!
//! ```text
//! SelectionOrchestrator
//!   └─ per candidate, in priority order:
//!        VramScheduler.ensure_available → GenerationClient.generate → Validator.validate
//!   └─ on exhaustion:
//!        compress_prompt → CloudFallback.complete → Validator.validate
//! ```
//!
//! The scheduler owns a ledger of model residency against a fixed VRAM
//! budget and evicts non-pinned models to admit new ones. The budget and
//! compression modules are the outbound analogue: they bound request size
//! for small-context remote providers.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod budget;
pub mod compress;
pub mod config;
pub mod generation;
pub mod ledger;
pub mod metrics;
pub mod scheduler;
pub mod select;
pub mod server;

// Re-exports for convenience
pub use budget::{fit_to_budget, ChatMessage, Role};
pub use compress::{compress_prompt, CompressionConfig};
pub use config::GateConfig;
pub use generation::{GenerationClient, GenerationOutcome};
pub use ledger::{EvictionPolicy, ModelRecord, ModelStatus, VramLedger};
pub use scheduler::VramScheduler;
pub use select::{
    ArtifactMapper, CloudFallback, ModelAttempt, SelectionOrchestrator, SelectionResult, Validator,
};
pub use server::{
    GenerateOptions, GenerateRequest, GenerateResponse, InferenceServer, MockServer, ModelEntry,
    OllamaServer, StreamEvent,
};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`GateError::Other`] if the global subscriber has already been
/// set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), GateError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| GateError::Other(format!("tracing init failed: {e}")))
}

/// Top-level errors for the model gate.
///
/// Availability and generation failures deliberately do **not** travel as
/// this type across the admission or selection boundaries — they are
/// converted into result fields (`ensure_available` returns a boolean,
/// [`select::SelectionResult`] carries an aggregate message). This enum
/// covers construction-time and transport-level failures only.
#[derive(Error, Debug)]
pub enum GateError {
    /// The inference server could not be reached or returned a transport
    /// error before any model-level semantics applied.
    #[error("server error: {0}")]
    Server(String),

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first admission.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Convert a raw byte count from the server inventory into GiB for the
/// ledger.
///
/// # Example
///
/// ```rust
/// use modelgate::bytes_to_gib;
/// assert!((bytes_to_gib(4 * 1024 * 1024 * 1024) - 4.0).abs() < 1e-9);
/// ```
pub fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}
