//! Epoch-based reclamation support for the version-chain read path.
//!
//! Readers traverse group and version chains without locks; reclaimed groups
//! are destroyed only once every reader pinned before the unlink has moved
//! on. This module wraps `crossbeam-epoch` pin/unpin so callers can hold a
//! [`SnapshotGuard`] across several lookups without touching raw epoch
//! internals, and tracks reclamation activity in process-wide counters.

use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

use crossbeam_epoch::{self as epoch, Guard};
use parking_lot::Mutex;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Global version-chain metrics singleton.
///
/// Counters are lock-free `AtomicU64` with `Relaxed` ordering — callers may
/// observe stale reads but never torn values.
pub static GLOBAL_CHAIN_METRICS: ChainMetrics = ChainMetrics::new();

/// Atomic counters for version-chain and reclamation telemetry.
pub struct ChainMetrics {
    /// Total epoch pins created through [`SnapshotGuard::pin`].
    pub guards_pinned_total: AtomicU64,
    /// Total epoch pins dropped.
    pub guards_unpinned_total: AtomicU64,
    /// High-water mark of concurrently active guards observed.
    pub active_guards_high_water: AtomicU64,
    /// Total objects (groups, replaced delta payloads) deferred for
    /// destruction.
    pub retirements_deferred_total: AtomicU64,
    /// Total stale-reader warnings emitted.
    pub stale_reader_warnings_total: AtomicU64,
    /// Total reference groups opened.
    pub groups_opened_total: AtomicU64,
    /// Total reference groups reclaimed.
    pub groups_reclaimed_total: AtomicU64,
    /// Total delta unions applied by finalize merge passes.
    pub merges_applied_total: AtomicU64,
}

impl ChainMetrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            guards_pinned_total: AtomicU64::new(0),
            guards_unpinned_total: AtomicU64::new(0),
            active_guards_high_water: AtomicU64::new(0),
            retirements_deferred_total: AtomicU64::new(0),
            stale_reader_warnings_total: AtomicU64::new(0),
            groups_opened_total: AtomicU64::new(0),
            groups_reclaimed_total: AtomicU64::new(0),
            merges_applied_total: AtomicU64::new(0),
        }
    }

    /// Record a guard pin event and update the high-water mark.
    pub fn record_guard_pinned(&self, current_active: u64) {
        self.guards_pinned_total.fetch_add(1, Ordering::Relaxed);
        loop {
            let prev = self.active_guards_high_water.load(Ordering::Relaxed);
            if current_active <= prev {
                break;
            }
            if self
                .active_guards_high_water
                .compare_exchange_weak(prev, current_active, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Record a guard unpin event.
    pub fn record_guard_unpinned(&self) {
        self.guards_unpinned_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a deferred destruction.
    pub fn record_retirement_deferred(&self) {
        self.retirements_deferred_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record stale-reader warnings emitted.
    pub fn record_stale_warnings(&self, count: u64) {
        self.stale_reader_warnings_total
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Record a newly opened reference group.
    pub fn record_group_opened(&self) {
        self.groups_opened_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reclaimed reference group.
    pub fn record_group_reclaimed(&self) {
        self.groups_reclaimed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one delta union applied during a finalize merge pass.
    pub fn record_merge_applied(&self) {
        self.merges_applied_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ChainMetricsSnapshot {
        ChainMetricsSnapshot {
            guards_pinned_total: self.guards_pinned_total.load(Ordering::Relaxed),
            guards_unpinned_total: self.guards_unpinned_total.load(Ordering::Relaxed),
            active_guards_high_water: self.active_guards_high_water.load(Ordering::Relaxed),
            retirements_deferred_total: self.retirements_deferred_total.load(Ordering::Relaxed),
            stale_reader_warnings_total: self.stale_reader_warnings_total.load(Ordering::Relaxed),
            groups_opened_total: self.groups_opened_total.load(Ordering::Relaxed),
            groups_reclaimed_total: self.groups_reclaimed_total.load(Ordering::Relaxed),
            merges_applied_total: self.merges_applied_total.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero (tests/diagnostics).
    pub fn reset(&self) {
        self.guards_pinned_total.store(0, Ordering::Relaxed);
        self.guards_unpinned_total.store(0, Ordering::Relaxed);
        self.active_guards_high_water.store(0, Ordering::Relaxed);
        self.retirements_deferred_total.store(0, Ordering::Relaxed);
        self.stale_reader_warnings_total.store(0, Ordering::Relaxed);
        self.groups_opened_total.store(0, Ordering::Relaxed);
        self.groups_reclaimed_total.store(0, Ordering::Relaxed);
        self.merges_applied_total.store(0, Ordering::Relaxed);
    }
}

impl Default for ChainMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of [`ChainMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainMetricsSnapshot {
    pub guards_pinned_total: u64,
    pub guards_unpinned_total: u64,
    pub active_guards_high_water: u64,
    pub retirements_deferred_total: u64,
    pub stale_reader_warnings_total: u64,
    pub groups_opened_total: u64,
    pub groups_reclaimed_total: u64,
    pub merges_applied_total: u64,
}

impl std::fmt::Display for ChainMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chain(pinned={} unpinned={} hw={} retired={} stale_warn={} opened={} reclaimed={} merges={})",
            self.guards_pinned_total,
            self.guards_unpinned_total,
            self.active_guards_high_water,
            self.retirements_deferred_total,
            self.stale_reader_warnings_total,
            self.groups_opened_total,
            self.groups_reclaimed_total,
            self.merges_applied_total,
        )
    }
}

// ---------------------------------------------------------------------------
// Stale-reader policy
// ---------------------------------------------------------------------------

/// Configuration for stale-reader detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleReaderConfig {
    /// Reader pins older than this duration are considered stale.
    pub warn_after: Duration,
    /// Minimum interval between repeated warnings for the same guard.
    pub warn_every: Duration,
}

impl Default for StaleReaderConfig {
    fn default() -> Self {
        Self {
            warn_after: Duration::from_secs(30),
            warn_every: Duration::from_secs(5),
        }
    }
}

/// Snapshot of an active stale reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderPinSnapshot {
    /// Stable ID assigned to the pinned guard.
    pub guard_id: u64,
    /// Elapsed pin duration.
    pub pinned_for: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ReaderPinState {
    pinned_at: Instant,
    last_warned_at: Option<Instant>,
}

/// Registry for active reader pins.
///
/// Lock-based and simple; cardinality is bounded by concurrently live
/// readers, which the oracle contract already keeps small.
#[derive(Debug)]
pub struct ReaderRegistry {
    stale_reader: StaleReaderConfig,
    next_guard_id: AtomicU64,
    active: Mutex<HashMap<u64, ReaderPinState>>,
}

impl ReaderRegistry {
    /// Construct a registry with the provided stale-reader policy.
    #[must_use]
    pub fn new(stale_reader: StaleReaderConfig) -> Self {
        Self {
            stale_reader,
            next_guard_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Stale-reader policy currently in use.
    #[must_use]
    pub const fn stale_reader_config(&self) -> StaleReaderConfig {
        self.stale_reader
    }

    /// Number of currently pinned guards.
    #[must_use]
    pub fn active_reader_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Snapshot all stale readers as of `now`.
    #[must_use]
    pub fn stale_readers(&self, now: Instant) -> Vec<ReaderPinSnapshot> {
        self.active
            .lock()
            .iter()
            .filter_map(|(&guard_id, state)| {
                let pinned_for = now.saturating_duration_since(state.pinned_at);
                if pinned_for >= self.stale_reader.warn_after {
                    Some(ReaderPinSnapshot {
                        guard_id,
                        pinned_for,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Emit stale-reader warnings as of `now`.
    ///
    /// Returns the number of warnings emitted.
    pub fn warn_on_stale_readers(&self, now: Instant) -> usize {
        let mut warned = 0_usize;
        let mut active = self.active.lock();
        for (&guard_id, state) in active.iter_mut() {
            let pinned_for = now.saturating_duration_since(state.pinned_at);
            if pinned_for < self.stale_reader.warn_after {
                continue;
            }

            let should_warn = state.last_warned_at.is_none_or(|last| {
                now.saturating_duration_since(last) >= self.stale_reader.warn_every
            });
            if should_warn {
                tracing::warn!(
                    guard_id,
                    pinned_for_ms = pinned_for.as_millis(),
                    stale_warn_after_ms = self.stale_reader.warn_after.as_millis(),
                    "stale snapshot reader pin is blocking epoch advancement"
                );
                state.last_warned_at = Some(now);
                warned += 1;
            }
        }
        drop(active);
        if warned > 0 {
            GLOBAL_CHAIN_METRICS.record_stale_warnings(warned as u64);
        }
        warned
    }

    fn register_guard(&self, pinned_at: Instant) -> u64 {
        let guard_id = self.next_guard_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(
            guard_id,
            ReaderPinState {
                pinned_at,
                last_warned_at: None,
            },
        );
        guard_id
    }

    fn unregister_guard(&self, guard_id: u64) {
        self.active.lock().remove(&guard_id);
    }
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self::new(StaleReaderConfig::default())
    }
}

// ---------------------------------------------------------------------------
// SnapshotGuard
// ---------------------------------------------------------------------------

/// Reader-scoped epoch pin.
///
/// Holding one keeps every group and delta payload observed through it alive;
/// drop it as soon as the batch of lookups is done, or reclamation stalls.
#[derive(Debug)]
pub struct SnapshotGuard {
    registry: Arc<ReaderRegistry>,
    guard_id: u64,
    pinned_at: Instant,
    guard: Guard,
}

impl SnapshotGuard {
    /// Pin the current thread into the epoch domain.
    #[must_use]
    pub fn pin(registry: Arc<ReaderRegistry>) -> Self {
        let pinned_at = Instant::now();
        let guard_id = registry.register_guard(pinned_at);
        let guard = epoch::pin();
        let active_count = registry.active_reader_count() as u64;
        GLOBAL_CHAIN_METRICS.record_guard_pinned(active_count);
        tracing::trace!(guard_id, active_readers = active_count, "reader pinned");
        Self {
            registry,
            guard_id,
            pinned_at,
            guard,
        }
    }

    /// Stable ID for diagnostics and stale-reader reporting.
    #[must_use]
    pub const fn guard_id(&self) -> u64 {
        self.guard_id
    }

    /// Elapsed pin duration.
    #[must_use]
    pub fn pinned_for(&self) -> Duration {
        self.pinned_at.elapsed()
    }

    pub(crate) fn epoch_guard(&self) -> &Guard {
        &self.guard
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.registry.unregister_guard(self.guard_id);
        GLOBAL_CHAIN_METRICS.record_guard_unpinned();
        tracing::trace!(guard_id = self.guard_id, "reader unpinned");
    }
}
