//! TOML configuration for the model gate.
//!
//! Parse, validate, and schema-export gate configuration. Every field has
//! either a required value or a documented default, and all semantic
//! constraints are checked by [`GateConfig::validate`] before a config is
//! accepted.

use crate::compress::CompressionConfig;
use crate::ledger::EvictionPolicy;
use crate::GateError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ── Default value functions ──────────────────────────────────────────────

/// Default inference server URL.
fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

/// Default single-shot request timeout: 120 seconds.
fn default_request_timeout_s() -> u64 {
    120
}

/// Default out-of-band fetch timeout: 30 minutes.
fn default_pull_timeout_s() -> u64 {
    30 * 60
}

/// Default conservative size assumed for undiscovered models: 5 GiB.
fn default_model_size_gb() -> f64 {
    5.0
}

/// Default quality threshold for gated selection, on the validator's
/// 0..100 scale.
fn default_quality_threshold() -> f64 {
    70.0
}

/// Default completion budget reserved out of the context window.
fn default_completion_budget() -> usize {
    1024
}

/// Default safety margin reserved out of the context window.
fn default_safety_margin() -> usize {
    128
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Root configuration for a gate instance.
///
/// # Example
///
/// ```toml
/// [server]
/// base_url = "http://localhost:11434"
///
/// [vram]
/// limit_gb = 12.0
/// persistent = ["llama3:8b"]
///
/// [selection]
/// candidates = ["qwen2.5-coder:14b", "llama3:8b"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GateConfig {
    /// Inference server connection settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// VRAM budget and residency policy.
    pub vram: VramConfig,
    /// Candidate ordering and quality gating.
    pub selection: SelectionConfig,
    /// Prompt compression for the cloud fallback path.
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Outbound token budget for bounded-context providers.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Logging settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Inference server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServerConfig {
    /// Base URL of the inference server.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Timeout (seconds) for single-shot requests.
    #[serde(default = "default_request_timeout_s")]
    pub request_timeout_s: u64,
    /// Timeout (seconds) for out-of-band model fetches.
    #[serde(default = "default_pull_timeout_s")]
    pub pull_timeout_s: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_s: default_request_timeout_s(),
            pull_timeout_s: default_pull_timeout_s(),
        }
    }
}

/// VRAM budget and residency policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct VramConfig {
    /// Hard VRAM budget in GiB. Admission never exceeds it.
    pub limit_gb: f64,
    /// Conservative size (GiB) assumed for models not yet seen in the
    /// server inventory.
    #[serde(default = "default_model_size_gb")]
    pub default_model_size_gb: f64,
    /// Models pinned in memory. Evicted only as a last resort.
    #[serde(default)]
    pub persistent: Vec<String>,
    /// Eviction ordering among resident models.
    #[serde(default)]
    pub eviction_policy: EvictionPolicy,
}

/// Candidate ordering and quality gating.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SelectionConfig {
    /// Local candidate models, in descending priority order.
    pub candidates: Vec<String>,
    /// Minimum validator score (0..100) for a local output to be
    /// accepted.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
}

/// Outbound token budget for bounded-context providers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BudgetConfig {
    /// Provider context window in tokens.
    pub context_window: usize,
    /// Tokens reserved for the completion.
    #[serde(default = "default_completion_budget")]
    pub completion_budget: usize,
    /// Extra tokens held back against estimation error.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            context_window: 8192,
            completion_budget: default_completion_budget(),
            safety_margin: default_safety_margin(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

impl GateConfig {
    /// Load and validate a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] if the file cannot be read, does not
    /// parse, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GateError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GateError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| GateError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.vram.limit_gb <= 0.0 {
            return Err(GateError::Config(
                "vram.limit_gb must be positive".to_string(),
            ));
        }
        if self.vram.default_model_size_gb <= 0.0 {
            return Err(GateError::Config(
                "vram.default_model_size_gb must be positive".to_string(),
            ));
        }
        if self.selection.candidates.is_empty() {
            return Err(GateError::Config(
                "selection.candidates must not be empty".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.selection.quality_threshold) {
            return Err(GateError::Config(
                "selection.quality_threshold must be within 0.0..=100.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.compression.keep_fraction) {
            return Err(GateError::Config(
                "compression.keep_fraction must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.budget.context_window == 0 {
            return Err(GateError::Config(
                "budget.context_window must be positive".to_string(),
            ));
        }
        if self.budget.completion_budget + self.budget.safety_margin >= self.budget.context_window {
            return Err(GateError::Config(
                "budget.completion_budget + budget.safety_margin must leave room in the context window"
                    .to_string(),
            ));
        }
        for pinned in &self.vram.persistent {
            if !self.selection.candidates.contains(pinned) {
                tracing::warn!(model = %pinned, "pinned model is not a selection candidate");
            }
        }
        Ok(())
    }
}

/// Export the JSON Schema for [`GateConfig`].
///
/// Enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(GateConfig);
    serde_json::to_string_pretty(&schema)
}
