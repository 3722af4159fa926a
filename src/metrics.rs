//! Prometheus metrics for gate activity.
//!
//! Each [`GateMetrics`] bundle owns a private registry, so schedulers can
//! be instantiated side by side (and tested in isolation) without label
//! collisions. Recording is safe from any task at any time; if metric
//! construction ever fails the bundle degrades to no-op counters rather
//! than panicking, and [`gather_metrics`] returns an empty string.
//!
//! No HTTP exporter is wired here: [`gather_metrics`] produces the text
//! exposition format for whatever surface the embedding process provides,
//! and [`snapshot`] gives a structured read-out for logs and demos.
//!
//! [`gather_metrics`]: GateMetrics::gather_metrics
//! [`snapshot`]: GateMetrics::snapshot
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `gate_admissions_total` | Counter | |
//! | `gate_admission_failures_total` | Counter | |
//! | `gate_evictions_total` | Counter | `tier` |
//! | `gate_loads_total` | Counter | |
//! | `gate_pulls_total` | Counter | |
//! | `gate_generate_requests_total` | Counter | `outcome` |
//! | `gate_validation_failures_total` | Counter | |
//! | `gate_cloud_fallbacks_total` | Counter | |

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;

/// All gate counters, registered against one private registry.
struct Bundle {
    registry: Registry,
    admissions: IntCounter,
    admission_failures: IntCounter,
    evictions: IntCounterVec,
    loads: IntCounter,
    pulls: IntCounter,
    generates: IntCounterVec,
    validations_failed: IntCounter,
    cloud_fallbacks: IntCounter,
}

impl Bundle {
    fn try_new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let admissions = IntCounter::new(
            "gate_admissions_total",
            "Models admitted into the active set",
        )?;
        registry.register(Box::new(admissions.clone()))?;

        let admission_failures = IntCounter::new(
            "gate_admission_failures_total",
            "Availability attempts that ended in failure",
        )?;
        registry.register(Box::new(admission_failures.clone()))?;

        let evictions = IntCounterVec::new(
            Opts::new("gate_evictions_total", "Models evicted to make headroom"),
            &["tier"],
        )?;
        registry.register(Box::new(evictions.clone()))?;

        let loads = IntCounter::new(
            "gate_loads_total",
            "Completed load sequences (verify, pull, warm-up)",
        )?;
        registry.register(Box::new(loads.clone()))?;

        let pulls = IntCounter::new("gate_pulls_total", "Out-of-band model fetches issued")?;
        registry.register(Box::new(pulls.clone()))?;

        let generates = IntCounterVec::new(
            Opts::new(
                "gate_generate_requests_total",
                "Generation requests by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(generates.clone()))?;

        let validations_failed = IntCounter::new(
            "gate_validation_failures_total",
            "Candidate outputs rejected by the validator",
        )?;
        registry.register(Box::new(validations_failed.clone()))?;

        let cloud_fallbacks = IntCounter::new(
            "gate_cloud_fallbacks_total",
            "Requests that fell through to the cloud provider",
        )?;
        registry.register(Box::new(cloud_fallbacks.clone()))?;

        Ok(Self {
            registry,
            admissions,
            admission_failures,
            evictions,
            loads,
            pulls,
            generates,
            validations_failed,
            cloud_fallbacks,
        })
    }

    fn labelled(vec: &IntCounterVec, label: &str) -> u64 {
        vec.get_metric_with_label_values(&[label])
            .map(|c| c.get())
            .unwrap_or(0)
    }
}

/// Shared counter bundle for the scheduler, generation client, and
/// orchestrator. Cheap to share behind an `Arc`.
pub struct GateMetrics {
    inner: Option<Bundle>,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Models admitted into the active set.
    pub admissions: u64,
    /// `ensure_available` calls that ended in failure.
    pub admission_failures: u64,
    /// Models evicted to make headroom (all tiers).
    pub evictions: u64,
    /// Evictions that had to reach into the pinned tier.
    pub pinned_evictions: u64,
    /// Successful load sequences (verify, pull if needed, warm-up).
    pub loads: u64,
    /// Out-of-band model fetches issued.
    pub pulls: u64,
    /// Generation requests issued.
    pub generate_calls: u64,
    /// Generation requests that failed.
    pub generate_failures: u64,
    /// Candidate outputs rejected by the validator.
    pub validations_failed: u64,
    /// Requests that fell through to the cloud provider.
    pub cloud_fallbacks: u64,
}

impl GateMetrics {
    /// Fresh zeroed counters against a private registry.
    ///
    /// Metric construction failing (duplicate descriptors cannot occur in
    /// a private registry, so only a prometheus internal error) downgrades
    /// the bundle to no-op counters; observability degrades gracefully
    /// rather than panicking.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn new() -> Self {
        match Bundle::try_new() {
            Ok(bundle) => Self {
                inner: Some(bundle),
            },
            Err(e) => {
                tracing::error!(error = %e, "metrics construction failed, counters disabled");
                Self { inner: None }
            }
        }
    }

    /// Record a completed admission.
    pub fn record_admission(&self) {
        if let Some(b) = &self.inner {
            b.admissions.inc();
        }
    }

    /// Record a failed availability attempt.
    pub fn record_admission_failure(&self) {
        if let Some(b) = &self.inner {
            b.admission_failures.inc();
        }
    }

    /// Record an eviction; `pinned` marks a last-resort pinned victim.
    pub fn record_eviction(&self, pinned: bool) {
        if let Some(b) = &self.inner {
            let tier = if pinned { "pinned" } else { "ordinary" };
            if let Ok(c) = b.evictions.get_metric_with_label_values(&[tier]) {
                c.inc();
            }
        }
    }

    /// Record a completed load sequence.
    pub fn record_load(&self) {
        if let Some(b) = &self.inner {
            b.loads.inc();
        }
    }

    /// Record an out-of-band fetch.
    pub fn record_pull(&self) {
        if let Some(b) = &self.inner {
            b.pulls.inc();
        }
    }

    /// Record a generation attempt and its outcome.
    pub fn record_generate(&self, success: bool) {
        if let Some(b) = &self.inner {
            let outcome = if success { "ok" } else { "error" };
            if let Ok(c) = b.generates.get_metric_with_label_values(&[outcome]) {
                c.inc();
            }
        }
    }

    /// Record a validator rejection.
    pub fn record_validation_failure(&self) {
        if let Some(b) = &self.inner {
            b.validations_failed.inc();
        }
    }

    /// Record a cloud fallback.
    pub fn record_cloud_fallback(&self) {
        if let Some(b) = &self.inner {
            b.cloud_fallbacks.inc();
        }
    }

    /// Read out all counters at once.
    ///
    /// Returns a zeroed snapshot if the bundle was downgraded at
    /// construction time.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let Some(b) = &self.inner else {
            return MetricsSnapshot {
                admissions: 0,
                admission_failures: 0,
                evictions: 0,
                pinned_evictions: 0,
                loads: 0,
                pulls: 0,
                generate_calls: 0,
                generate_failures: 0,
                validations_failed: 0,
                cloud_fallbacks: 0,
            };
        };
        let ordinary = Bundle::labelled(&b.evictions, "ordinary");
        let pinned = Bundle::labelled(&b.evictions, "pinned");
        let ok = Bundle::labelled(&b.generates, "ok");
        let failed = Bundle::labelled(&b.generates, "error");
        MetricsSnapshot {
            admissions: b.admissions.get(),
            admission_failures: b.admission_failures.get(),
            evictions: ordinary + pinned,
            pinned_evictions: pinned,
            loads: b.loads.get(),
            pulls: b.pulls.get(),
            generate_calls: ok + failed,
            generate_failures: failed,
            validations_failed: b.validations_failed.get(),
            cloud_fallbacks: b.cloud_fallbacks.get(),
        }
    }

    /// Gather and encode all metrics in the Prometheus text exposition
    /// format.
    ///
    /// Returns an empty string if the bundle was downgraded or encoding
    /// fails.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn gather_metrics(&self) -> String {
        let Some(b) = &self.inner else {
            return String::new();
        };
        let families = b.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_zeroed() {
        let m = GateMetrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.admissions, 0);
        assert_eq!(snap.evictions, 0);
        assert_eq!(snap.generate_calls, 0);
    }

    #[test]
    fn test_bundles_have_isolated_registries() {
        let a = GateMetrics::new();
        let b = GateMetrics::new();
        a.record_admission();
        assert_eq!(a.snapshot().admissions, 1);
        assert_eq!(b.snapshot().admissions, 0, "registries must not be shared");
    }

    #[test]
    fn test_eviction_counts_pinned_separately() {
        let m = GateMetrics::new();
        m.record_eviction(false);
        m.record_eviction(true);
        let snap = m.snapshot();
        assert_eq!(snap.evictions, 2);
        assert_eq!(snap.pinned_evictions, 1);
    }

    #[test]
    fn test_generate_failure_counts_both_fields() {
        let m = GateMetrics::new();
        m.record_generate(true);
        m.record_generate(false);
        let snap = m.snapshot();
        assert_eq!(snap.generate_calls, 2);
        assert_eq!(snap.generate_failures, 1);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let m = GateMetrics::new();
        m.record_admission();
        m.record_cloud_fallback();
        let json = serde_json::to_value(m.snapshot()).expect("snapshot serializes");
        assert_eq!(json["admissions"], 1);
        assert_eq!(json["cloud_fallbacks"], 1);
    }

    #[test]
    fn test_gather_metrics_emits_text_exposition() {
        let m = GateMetrics::new();
        m.record_admission();
        m.record_eviction(true);
        let text = m.gather_metrics();
        assert!(text.contains("gate_admissions_total"));
        assert!(text.contains("gate_evictions_total"));
        assert!(text.contains("tier=\"pinned\""));
        assert!(
            std::str::from_utf8(text.as_bytes()).is_ok(),
            "exposition output must be valid UTF-8"
        );
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        use std::sync::Arc;
        let m = Arc::new(GateMetrics::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&m);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    m.record_generate(true);
                }
            }));
        }
        for h in handles {
            h.join().expect("counter thread must not panic");
        }
        assert_eq!(m.snapshot().generate_calls, 8000);
    }
}
