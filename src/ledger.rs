//! In-memory model residency ledger.
//!
//! The ledger is the single source of truth for which models are resident
//! in VRAM, how big they are, and what lifecycle state each one is in.
//! It is a plain data structure — all I/O and locking live in
//! [`crate::scheduler`], which owns the ledger behind one mutex so that
//! concurrent admission decisions cannot both observe headroom and
//! double-admit.
//!
//! Invariant: the sum of sizes of all active models never exceeds
//! `vram_limit_gb` after a completed admission.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Lifecycle state of a single model on the inference server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// Not resident; the initial state of every lazily-created record.
    NotLoaded,
    /// A load is in progress (inventory check, pull, warm-up).
    Loading,
    /// Resident and warmed up; eligible for generation.
    Ready,
    /// A generation call is currently running against this model.
    InUse,
    /// A load or availability failure occurred. Sticky: the record stays
    /// in `Error` until a fresh `ensure_available` restarts the load.
    Error,
    /// An unload failed, so the server-side state can no longer be
    /// trusted. The entry must be re-probed against the inventory before
    /// it is treated as resident or absent.
    Unknown,
}

/// Per-model bookkeeping record.
///
/// Created lazily on first reference to a name and kept for the process
/// lifetime. Mutated by the scheduler (status, sizes, load timing) and the
/// generation client (usage counters, `last_used`).
#[derive(Debug, Clone)]
pub struct ModelRecord {
    /// Model name, unique key into the ledger.
    pub name: String,
    /// Current lifecycle state.
    pub status: ModelStatus,
    /// Size in GiB. Discovered from the server inventory; a conservative
    /// default applies until discovery succeeds.
    pub size_gb: f64,
    /// When this model was last used for a successful generation.
    pub last_used: Option<Instant>,
    /// When this model was admitted into the active set.
    pub admitted_at: Option<Instant>,
    /// Wall-clock duration of the most recent successful load.
    pub load_time: Option<Duration>,
    /// Total generation requests issued against this model.
    pub total_requests: u64,
    /// Generation requests that returned content successfully.
    pub successful_requests: u64,
    /// Message from the most recent availability failure, if any.
    pub error_message: Option<String>,
}

impl ModelRecord {
    fn new(name: &str, size_gb: f64) -> Self {
        Self {
            name: name.to_string(),
            status: ModelStatus::NotLoaded,
            size_gb,
            last_used: None,
            admitted_at: None,
            load_time: None,
            total_requests: 0,
            successful_requests: 0,
            error_message: None,
        }
    }
}

/// Order in which resident models are chosen for eviction.
///
/// Applies to the ordinary (non-pinned) tier and, as a last resort, to the
/// pinned tier. The last-resort pinned eviction is an explicit policy
/// choice rather than a hard-coded model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the model that has been resident the longest.
    OldestAdmitted,
    /// Evict the model whose last successful use is furthest in the past.
    /// Models never used sort before models used at any point.
    LeastRecentlyUsed,
    /// Evict the largest resident model first.
    Largest,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::LeastRecentlyUsed
    }
}

/// Serializable snapshot of ledger state for callers and logs.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    /// The fixed VRAM budget in GiB.
    pub vram_limit_gb: f64,
    /// Sum of sizes of all active models in GiB.
    pub used_gb: f64,
    /// Names currently resident, with their ledger sizes.
    pub active: Vec<(String, f64)>,
    /// Names pinned by policy.
    pub persistent: Vec<String>,
}

/// The VRAM residency ledger.
///
/// Pure bookkeeping: admission and eviction decisions are computed here,
/// but every actual load/unload is driven by the scheduler against the
/// inference server.
#[derive(Debug)]
pub struct VramLedger {
    vram_limit_gb: f64,
    default_size_gb: f64,
    persistent: HashSet<String>,
    active: HashSet<String>,
    sizes: HashMap<String, f64>,
    records: HashMap<String, ModelRecord>,
}

impl VramLedger {
    /// Create a ledger with a fixed budget.
    ///
    /// * `vram_limit_gb` — the hard budget; admission never exceeds it.
    /// * `default_size_gb` — conservative size assumed for models whose
    ///   size has not yet been discovered from the inventory.
    /// * `persistent` — names pinned in memory by policy.
    pub fn new(vram_limit_gb: f64, default_size_gb: f64, persistent: Vec<String>) -> Self {
        Self {
            vram_limit_gb,
            default_size_gb,
            persistent: persistent.into_iter().collect(),
            active: HashSet::new(),
            sizes: HashMap::new(),
            records: HashMap::new(),
        }
    }

    /// The fixed VRAM budget in GiB.
    pub fn vram_limit_gb(&self) -> f64 {
        self.vram_limit_gb
    }

    /// Whether `name` is pinned by policy.
    pub fn is_persistent(&self, name: &str) -> bool {
        self.persistent.contains(name)
    }

    /// Whether `name` is currently counted as resident.
    pub fn is_active(&self, name: &str) -> bool {
        self.active.contains(name)
    }

    /// Size in GiB used for admission math: the discovered size, or the
    /// conservative default when the model has not appeared in the
    /// inventory yet.
    pub fn size_of(&self, name: &str) -> f64 {
        self.sizes.get(name).copied().unwrap_or(self.default_size_gb)
    }

    /// Record a size discovered from the server inventory.
    ///
    /// Also backfills the record's `size_gb` so stats reflect reality.
    pub fn set_size(&mut self, name: &str, size_gb: f64) {
        self.sizes.insert(name.to_string(), size_gb);
        if let Some(record) = self.records.get_mut(name) {
            record.size_gb = size_gb;
        }
    }

    /// Whether a size has been discovered for `name`.
    pub fn has_size(&self, name: &str) -> bool {
        self.sizes.contains_key(name)
    }

    /// Sum of sizes of all active models.
    pub fn used_gb(&self) -> f64 {
        self.active.iter().map(|m| self.size_of(m)).sum()
    }

    /// Remaining headroom under the budget. Can be negative if a failed
    /// unload left an `Unknown` entry counted conservatively.
    pub fn available_gb(&self) -> f64 {
        self.vram_limit_gb - self.used_gb()
    }

    /// Mark `name` admitted: insert into the active set and stamp
    /// `admitted_at`. The caller must have verified headroom first.
    pub fn admit(&mut self, name: &str) {
        self.active.insert(name.to_string());
        let size = self.size_of(name);
        let record = self.record_mut(name);
        record.admitted_at = Some(Instant::now());
        record.size_gb = size;
    }

    /// Remove `name` from the active set (after a successful unload).
    pub fn remove_active(&mut self, name: &str) {
        self.active.remove(name);
        if let Some(record) = self.records.get_mut(name) {
            record.admitted_at = None;
        }
    }

    /// Immutable view of a record, if one exists.
    pub fn record(&self, name: &str) -> Option<&ModelRecord> {
        self.records.get(name)
    }

    /// Mutable record access, creating the record lazily on first
    /// reference to a name.
    pub fn record_mut(&mut self, name: &str) -> &mut ModelRecord {
        let default_size = self.size_of(name);
        self.records
            .entry(name.to_string())
            .or_insert_with(|| ModelRecord::new(name, default_size))
    }

    /// Current status of `name`; `NotLoaded` for names never referenced.
    pub fn status(&self, name: &str) -> ModelStatus {
        self.records
            .get(name)
            .map(|r| r.status.clone())
            .unwrap_or(ModelStatus::NotLoaded)
    }

    /// Pick the next eviction victim.
    ///
    /// With `include_pinned == false` only ordinary (non-pinned) residents
    /// are considered; with `true` the pinned tier becomes eligible as the
    /// documented last resort. The `exclude` name (the admission target)
    /// is never chosen.
    ///
    /// Entries in [`ModelStatus::Unknown`] are skipped: their server-side
    /// state cannot be trusted, so issuing another unload against them is
    /// pointless until a re-probe settles them. Entries in
    /// [`ModelStatus::InUse`] are skipped as well: generation runs outside
    /// the admission lock, and unloading a model mid-call would kill the
    /// in-flight request.
    pub fn eviction_candidate(
        &self,
        policy: EvictionPolicy,
        include_pinned: bool,
        exclude: &str,
    ) -> Option<String> {
        let mut candidates: Vec<&str> = self
            .active
            .iter()
            .map(String::as_str)
            .filter(|m| *m != exclude)
            .filter(|m| include_pinned || !self.persistent.contains(*m))
            .filter(|m| {
                !matches!(self.status(m), ModelStatus::Unknown | ModelStatus::InUse)
            })
            .collect();

        if candidates.is_empty() {
            return None;
        }

        match policy {
            EvictionPolicy::OldestAdmitted => {
                candidates.sort_by_key(|m| {
                    self.records
                        .get(*m)
                        .and_then(|r| r.admitted_at)
                        // Missing timestamp sorts first: treat as oldest.
                        .map_or(Duration::MAX, |t| t.elapsed())
                });
                candidates.reverse();
            }
            EvictionPolicy::LeastRecentlyUsed => {
                candidates.sort_by_key(|m| {
                    self.records
                        .get(*m)
                        .and_then(|r| r.last_used)
                        .map_or(Duration::MAX, |t| t.elapsed())
                });
                candidates.reverse();
            }
            EvictionPolicy::Largest => {
                candidates.sort_by(|a, b| {
                    self.size_of(b)
                        .partial_cmp(&self.size_of(a))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }

        candidates.first().map(|m| m.to_string())
    }

    /// Snapshot of current residency for callers and logs.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut active: Vec<(String, f64)> = self
            .active
            .iter()
            .map(|m| (m.clone(), self.size_of(m)))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        let mut persistent: Vec<String> = self.persistent.iter().cloned().collect();
        persistent.sort();
        LedgerSnapshot {
            vram_limit_gb: self.vram_limit_gb,
            used_gb: self.used_gb(),
            active,
            persistent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> VramLedger {
        VramLedger::new(12.0, 5.0, vec!["pinned".to_string()])
    }

    #[test]
    fn test_size_of_unknown_model_uses_default() {
        let l = ledger();
        assert!((l.size_of("mystery") - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_set_size_overrides_default() {
        let mut l = ledger();
        l.set_size("a", 4.0);
        assert!((l.size_of("a") - 4.0).abs() < f64::EPSILON);
        assert!(l.has_size("a"));
    }

    #[test]
    fn test_admit_updates_used_and_active() {
        let mut l = ledger();
        l.set_size("a", 4.0);
        l.admit("a");
        assert!(l.is_active("a"));
        assert!((l.used_gb() - 4.0).abs() < f64::EPSILON);
        assert!((l.available_gb() - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_remove_active_frees_headroom() {
        let mut l = ledger();
        l.set_size("a", 4.0);
        l.admit("a");
        l.remove_active("a");
        assert!(!l.is_active("a"));
        assert!((l.available_gb() - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_created_lazily_with_not_loaded_status() {
        let mut l = ledger();
        assert!(l.record("fresh").is_none());
        let r = l.record_mut("fresh");
        assert_eq!(r.status, ModelStatus::NotLoaded);
        assert_eq!(r.total_requests, 0);
    }

    #[test]
    fn test_status_of_unreferenced_name_is_not_loaded() {
        let l = ledger();
        assert_eq!(l.status("ghost"), ModelStatus::NotLoaded);
    }

    #[test]
    fn test_eviction_skips_pinned_without_last_resort() {
        let mut l = ledger();
        l.set_size("pinned", 4.0);
        l.admit("pinned");
        assert_eq!(
            l.eviction_candidate(EvictionPolicy::OldestAdmitted, false, "target"),
            None
        );
    }

    #[test]
    fn test_eviction_last_resort_includes_pinned() {
        let mut l = ledger();
        l.set_size("pinned", 4.0);
        l.admit("pinned");
        assert_eq!(
            l.eviction_candidate(EvictionPolicy::OldestAdmitted, true, "target"),
            Some("pinned".to_string())
        );
    }

    #[test]
    fn test_eviction_never_selects_the_admission_target() {
        let mut l = ledger();
        l.set_size("b", 5.0);
        l.admit("b");
        assert_eq!(
            l.eviction_candidate(EvictionPolicy::OldestAdmitted, true, "b"),
            None
        );
    }

    #[test]
    fn test_eviction_oldest_admitted_order() {
        let mut l = ledger();
        l.set_size("first", 2.0);
        l.set_size("second", 2.0);
        l.admit("first");
        std::thread::sleep(Duration::from_millis(5));
        l.admit("second");
        assert_eq!(
            l.eviction_candidate(EvictionPolicy::OldestAdmitted, false, "t"),
            Some("first".to_string())
        );
    }

    #[test]
    fn test_eviction_lru_prefers_never_used() {
        let mut l = ledger();
        l.set_size("used", 2.0);
        l.set_size("idle", 2.0);
        l.admit("used");
        l.admit("idle");
        l.record_mut("used").last_used = Some(Instant::now());
        assert_eq!(
            l.eviction_candidate(EvictionPolicy::LeastRecentlyUsed, false, "t"),
            Some("idle".to_string())
        );
    }

    #[test]
    fn test_eviction_largest_first() {
        let mut l = ledger();
        l.set_size("small", 2.0);
        l.set_size("big", 7.0);
        l.admit("small");
        l.admit("big");
        assert_eq!(
            l.eviction_candidate(EvictionPolicy::Largest, false, "t"),
            Some("big".to_string())
        );
    }

    #[test]
    fn test_eviction_skips_unknown_entries() {
        let mut l = ledger();
        l.set_size("stuck", 2.0);
        l.admit("stuck");
        l.record_mut("stuck").status = ModelStatus::Unknown;
        assert_eq!(
            l.eviction_candidate(EvictionPolicy::OldestAdmitted, true, "t"),
            None
        );
    }

    #[test]
    fn test_eviction_skips_in_use_entries() {
        let mut l = ledger();
        l.set_size("busy", 2.0);
        l.set_size("idle", 2.0);
        l.admit("busy");
        l.admit("idle");
        l.record_mut("busy").status = ModelStatus::InUse;
        assert_eq!(
            l.eviction_candidate(EvictionPolicy::OldestAdmitted, true, "t"),
            Some("idle".to_string())
        );
        l.remove_active("idle");
        assert_eq!(
            l.eviction_candidate(EvictionPolicy::OldestAdmitted, true, "t"),
            None,
            "a model serving a request must never be the victim"
        );
    }

    #[test]
    fn test_snapshot_reflects_residency() {
        let mut l = ledger();
        l.set_size("a", 4.0);
        l.admit("a");
        let snap = l.snapshot();
        assert!((snap.vram_limit_gb - 12.0).abs() < f64::EPSILON);
        assert!((snap.used_gb - 4.0).abs() < f64::EPSILON);
        assert_eq!(snap.active, vec![("a".to_string(), 4.0)]);
        assert_eq!(snap.persistent, vec!["pinned".to_string()]);
    }

    #[test]
    fn test_budget_invariant_across_evict_and_admit() {
        // limit 12, sizes A:4 B:5 C:6, A pinned.
        let mut l = VramLedger::new(12.0, 5.0, vec!["A".to_string()]);
        l.set_size("A", 4.0);
        l.set_size("B", 5.0);
        l.set_size("C", 6.0);
        l.admit("A");
        l.admit("B");
        assert!((l.available_gb() - 3.0).abs() < f64::EPSILON);
        // Not enough headroom for C; evict the only ordinary candidate.
        let victim = l
            .eviction_candidate(EvictionPolicy::OldestAdmitted, false, "C")
            .unwrap();
        assert_eq!(victim, "B");
        l.remove_active("B");
        assert!((l.available_gb() - 8.0).abs() < f64::EPSILON);
        l.admit("C");
        assert!(l.used_gb() <= l.vram_limit_gb() + f64::EPSILON);
    }
}
