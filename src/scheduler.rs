//! VRAM-aware admission control.
//!
//! The scheduler owns the residency ledger behind a single async mutex and
//! guarantees that a named model is resident and warmed up before any
//! generation runs against it, without ever exceeding the VRAM budget.
//! Holding the one lock across the whole admission (decision, eviction,
//! load, warm-up) gives two guarantees at once: concurrent callers cannot
//! both observe headroom and double-admit, and concurrent requests for the
//! same model await the one in-flight load and then hit the idempotent
//! fast path.
//!
//! Generation itself does not hold the admission lock; see
//! [`crate::generation`].

use crate::ledger::{EvictionPolicy, LedgerSnapshot, ModelRecord, ModelStatus, VramLedger};
use crate::metrics::GateMetrics;
use crate::server::{GenerateRequest, InferenceServer};
use crate::{bytes_to_gib, GateError};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Admission controller over a fixed VRAM budget.
///
/// Availability failures never cross this boundary as errors: they are
/// recorded on the model's ledger entry as a sticky [`ModelStatus::Error`]
/// and surfaced as a `false` return from [`ensure_available`].
///
/// [`ensure_available`]: VramScheduler::ensure_available
pub struct VramScheduler {
    server: Arc<dyn InferenceServer>,
    state: Mutex<VramLedger>,
    policy: EvictionPolicy,
    metrics: Arc<GateMetrics>,
}

impl VramScheduler {
    /// Create a scheduler over `server` with a fixed budget.
    pub fn new(
        server: Arc<dyn InferenceServer>,
        vram_limit_gb: f64,
        default_size_gb: f64,
        persistent: Vec<String>,
    ) -> Self {
        Self {
            server,
            state: Mutex::new(VramLedger::new(vram_limit_gb, default_size_gb, persistent)),
            policy: EvictionPolicy::default(),
            metrics: Arc::new(GateMetrics::new()),
        }
    }

    /// Set the eviction ordering.
    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Share an externally owned metrics bundle.
    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Handle to the scheduler's metrics.
    pub fn metrics(&self) -> Arc<GateMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Guarantee `target` is resident and warmed up.
    ///
    /// Idempotent for already-active models. Otherwise runs the full load
    /// sequence under the admission lock: sync the inventory (pulling the
    /// model out of band if it is absent), evict residents per policy
    /// until there is headroom, admit, and warm up with a minimal generate
    /// call. Returns `true` once the model is `Ready`.
    ///
    /// On any failure the model's record is left in sticky
    /// [`ModelStatus::Error`] with a message, and the call returns
    /// `false`. A later call restarts the load from scratch.
    pub async fn ensure_available(&self, target: &str) -> bool {
        let mut state = self.state.lock().await;

        if state.is_active(target)
            && matches!(state.status(target), ModelStatus::Ready | ModelStatus::InUse)
        {
            tracing::debug!(model = %target, "already resident, admission is a no-op");
            return true;
        }

        let started = Instant::now();
        {
            let record = state.record_mut(target);
            record.status = ModelStatus::Loading;
            record.error_message = None;
        }

        let in_inventory = match self.sync_inventory(&mut state).await {
            Ok(names) => names.iter().any(|n| n == target),
            Err(e) => {
                return self.fail_load(&mut state, target, &format!("inventory query failed: {e}"))
            }
        };

        if !in_inventory {
            tracing::info!(model = %target, "model absent from inventory, pulling");
            self.metrics.record_pull();
            if let Err(e) = self.server.pull(target).await {
                return self.fail_load(&mut state, target, &format!("pull failed: {e}"));
            }
            let confirmed = match self.sync_inventory(&mut state).await {
                Ok(names) => names.iter().any(|n| n == target),
                Err(e) => {
                    return self.fail_load(
                        &mut state,
                        target,
                        &format!("inventory re-check failed: {e}"),
                    )
                }
            };
            if !confirmed {
                return self.fail_load(
                    &mut state,
                    target,
                    "model absent from inventory after pull",
                );
            }
        }

        // An already-active entry (e.g. Unknown after a failed unload) is
        // still counted against the budget, so eviction is skipped and the
        // re-probe goes straight to warm-up.
        if !state.is_active(target) {
            let needed = state.size_of(target);
            while state.available_gb() < needed {
                let (victim, pinned) = match state.eviction_candidate(self.policy, false, target) {
                    Some(v) => (v, false),
                    None => {
                        if state.is_persistent(target) {
                            return self.fail_load(
                                &mut state,
                                target,
                                "insufficient VRAM headroom and no evictable residents",
                            );
                        }
                        match state.eviction_candidate(self.policy, true, target) {
                            Some(v) => (v, true),
                            None => {
                                return self.fail_load(
                                    &mut state,
                                    target,
                                    "insufficient VRAM headroom and no evictable residents",
                                )
                            }
                        }
                    }
                };
                tracing::info!(
                    model = %target,
                    victim = %victim,
                    pinned,
                    needed_gb = needed,
                    available_gb = state.available_gb(),
                    "evicting to make headroom"
                );
                match self.server.unload(&victim).await {
                    Ok(()) => {
                        state.remove_active(&victim);
                        state.record_mut(&victim).status = ModelStatus::NotLoaded;
                        self.metrics.record_eviction(pinned);
                    }
                    Err(e) => {
                        // The victim's server-side state is now unknown; it
                        // stays counted against the budget and is excluded
                        // from further candidacy until re-probed.
                        tracing::warn!(victim = %victim, error = %e, "unload failed during eviction");
                        state.record_mut(&victim).status = ModelStatus::Unknown;
                    }
                }
            }
            state.admit(target);
            self.metrics.record_admission();
        }

        // Warm-up: an empty-prompt generate makes the server load the
        // weights without producing output.
        let warmup = GenerateRequest::new(target, "");
        match self.server.generate(warmup).await {
            Ok(_) => {
                let elapsed = started.elapsed();
                let record = state.record_mut(target);
                record.status = ModelStatus::Ready;
                record.load_time = Some(elapsed);
                self.metrics.record_load();
                tracing::info!(model = %target, load_ms = elapsed.as_millis(), "model ready");
                true
            }
            Err(e) => {
                state.remove_active(target);
                self.fail_load(&mut state, target, &format!("warm-up failed: {e}"))
            }
        }
    }

    /// Release `target` from the server and the active set.
    ///
    /// # Errors
    ///
    /// Returns the server error on failure. The ledger entry is then
    /// marked [`ModelStatus::Unknown`] and stays counted against the
    /// budget until a later `ensure_available` re-probes it.
    pub async fn unload(&self, target: &str) -> Result<(), GateError> {
        let mut state = self.state.lock().await;
        match self.server.unload(target).await {
            Ok(()) => {
                state.remove_active(target);
                state.record_mut(target).status = ModelStatus::NotLoaded;
                tracing::info!(model = %target, "model unloaded");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(model = %target, error = %e, "unload failed, entry marked unknown");
                let record = state.record_mut(target);
                record.status = ModelStatus::Unknown;
                record.error_message = Some(format!("unload failed: {e}"));
                Err(e)
            }
        }
    }

    /// Mark the start of a generation call against `target`.
    pub(crate) async fn begin_generation(&self, target: &str) {
        let mut state = self.state.lock().await;
        let record = state.record_mut(target);
        record.status = ModelStatus::InUse;
        record.total_requests += 1;
    }

    /// Mark the end of a generation call. Transient failures are not
    /// sticky: the model returns to `Ready` either way.
    pub(crate) async fn finish_generation(&self, target: &str, success: bool) {
        let mut state = self.state.lock().await;
        let record = state.record_mut(target);
        if record.status == ModelStatus::InUse {
            record.status = ModelStatus::Ready;
        }
        if success {
            record.successful_requests += 1;
            record.last_used = Some(Instant::now());
        }
    }

    /// Current status of `target`.
    pub async fn status(&self, target: &str) -> ModelStatus {
        self.state.lock().await.status(target)
    }

    /// Whether `target` is currently counted as resident.
    pub async fn is_active(&self, target: &str) -> bool {
        self.state.lock().await.is_active(target)
    }

    /// Clone of the ledger record for `target`, if one exists.
    pub async fn record(&self, target: &str) -> Option<ModelRecord> {
        self.state.lock().await.record(target).cloned()
    }

    /// Snapshot of current residency.
    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.state.lock().await.snapshot()
    }

    async fn sync_inventory(&self, state: &mut VramLedger) -> Result<Vec<String>, GateError> {
        let entries = self.server.list_models().await?;
        let mut names = Vec::with_capacity(entries.len());
        for entry in entries {
            state.set_size(&entry.name, bytes_to_gib(entry.size));
            names.push(entry.name);
        }
        Ok(names)
    }

    fn fail_load(&self, state: &mut VramLedger, target: &str, message: &str) -> bool {
        tracing::error!(model = %target, error = message, "model availability failed");
        let record = state.record_mut(target);
        record.status = ModelStatus::Error;
        record.error_message = Some(message.to_string());
        self.metrics.record_admission_failure();
        false
    }
}
