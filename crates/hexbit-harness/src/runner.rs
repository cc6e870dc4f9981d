//! Concurrent insert/read phases, verification, and reporting.
//!
//! Mirrors the store's intended deployment: stage 1 of every insert runs
//! under a shared dispatch lock (the commit sequencer), stage 2 races across
//! writer threads, and readers query the freshest CSN throughout. All workers
//! rally on a barrier before timing starts so throughput numbers are fair.

use std::collections::HashMap;
use std::fmt;
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use hexbit_mvcc::{
    BITMAP_BYTES, BitmapVersionStore, ChainMetricsSnapshot, GLOBAL_CHAIN_METRICS, ReclaimResult,
};

use crate::workload::{self, ActiveCsnList, VersionedBitmap, WorkloadError};

/// Driver configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    /// Insert-phase workers; even slots write, odd slots read.
    pub worker_threads: usize,
    /// Verification-phase lookup threads.
    pub verify_threads: usize,
    /// Versions to generate and insert.
    pub versions: usize,
    /// Bits set between adjacent versions.
    pub hamming_step: usize,
    /// Master seed.
    pub seed: u64,
    /// Active-CSN list capacity; `None` retains every version.
    pub active_cap: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            worker_threads: 16,
            verify_threads: 16,
            versions: 256,
            hamming_step: 1,
            seed: workload::DEFAULT_SEED,
            active_cap: None,
        }
    }
}

/// Entries evicted from a full active list per push.
const ACTIVE_EVICT_BATCH: usize = 10;

/// Errors raised by a driver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// Configuration that cannot drive a run.
    Config(String),
    /// Workload generation failed.
    Workload(WorkloadError),
    /// Verification found wrong or missing snapshots.
    Verification {
        checked: u64,
        missing: u64,
        mismatches: u64,
    },
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(reason) => write!(f, "invalid configuration: {reason}"),
            Self::Workload(inner) => write!(f, "workload generation failed: {inner}"),
            Self::Verification {
                checked,
                missing,
                mismatches,
            } => write!(
                f,
                "verification failed: checked={checked} missing={missing} mismatches={mismatches}"
            ),
        }
    }
}

impl std::error::Error for RunError {}

impl From<WorkloadError> for RunError {
    fn from(inner: WorkloadError) -> Self {
        Self::Workload(inner)
    }
}

/// Results of one driver run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub config: RunConfig,
    pub insert_seconds: f64,
    pub inserts_per_sec: f64,
    pub reads_during_insert: u64,
    pub verify_seconds: f64,
    pub verified_lookups: u64,
    pub verify_per_sec: f64,
    pub oldest_visible_csn: u64,
    pub reclaimed: ReclaimResult,
    pub metrics: ChainMetricsSnapshot,
}

/// Execute the full insert / read / verify / reclaim cycle.
///
/// # Errors
///
/// Returns [`RunError::Config`] for unusable configurations,
/// [`RunError::Workload`] when generation fails, and
/// [`RunError::Verification`] when any retrievable snapshot is missing or
/// differs from the submitted bitmap.
pub fn run(config: RunConfig) -> Result<RunReport, RunError> {
    if config.worker_threads == 0 {
        return Err(RunError::Config("worker_threads must be at least 1".into()));
    }
    if config.versions == 0 {
        return Err(RunError::Config("versions must be at least 1".into()));
    }

    let history = workload::generate::<BITMAP_BYTES>(
        config.seed,
        config.versions,
        config.hamming_step,
    )?;
    let mut active = ActiveCsnList::new(
        config.active_cap.unwrap_or(config.versions + 100),
        ACTIVE_EVICT_BATCH,
        config.seed ^ 1,
    );
    for version in &history {
        active.push(version.csn);
    }

    let store: BitmapVersionStore = BitmapVersionStore::new();
    store.insert(history[0].csn, &history[0].bits);

    let (insert_seconds, reads_during_insert) = insert_phase(&store, &history, &config);
    let inserts_per_sec = config.versions as f64 / insert_seconds.max(f64::EPSILON);

    let (verify_seconds, checked, missing, mismatches) =
        verify_phase(&store, &history, active.csns(), config.verify_threads);
    if missing > 0 || mismatches > 0 {
        return Err(RunError::Verification {
            checked,
            missing,
            mismatches,
        });
    }

    let oldest_visible_csn = active.oldest_visible().unwrap_or(0);
    let reclaimed = store.reclaim(oldest_visible_csn);

    Ok(RunReport {
        config,
        insert_seconds,
        inserts_per_sec,
        reads_during_insert,
        verify_seconds,
        verified_lookups: checked,
        verify_per_sec: checked as f64 / verify_seconds.max(f64::EPSILON),
        oldest_visible_csn,
        reclaimed,
        metrics: GLOBAL_CHAIN_METRICS.snapshot(),
    })
}

fn insert_phase(
    store: &BitmapVersionStore,
    history: &[VersionedBitmap<BITMAP_BYTES>],
    config: &RunConfig,
) -> (f64, u64) {
    // Index 0 went in before the phase; workers dispatch from 1.
    let dispatch = Mutex::new(1usize);
    let rally = Barrier::new(config.worker_threads + 1);
    let done = AtomicBool::new(false);
    let reads = AtomicU64::new(0);
    let latest = AtomicU64::new(history[0].csn);
    let writers_active = AtomicUsize::new(config.worker_threads.div_ceil(2));

    let mut started = Instant::now();
    std::thread::scope(|scope| {
        for worker in 0..config.worker_threads {
            if worker % 2 == 0 {
                scope.spawn(|| {
                    rally.wait();
                    loop {
                        // Stage 1 under the dispatch lock: the sequencer
                        // hands out CSNs in order. Stage 2 runs unlocked.
                        let claimed = {
                            let mut next = dispatch.lock();
                            if *next >= history.len() {
                                None
                            } else {
                                let version = &history[*next];
                                *next += 1;
                                latest.store(version.csn, Ordering::Release);
                                Some((version, store.reserve(version.csn, &version.bits)))
                            }
                        };
                        match claimed {
                            None => break,
                            Some((version, Some(ticket))) => {
                                store.finalize(ticket, &version.bits);
                            }
                            Some((_, None)) => {}
                        }
                    }
                    if writers_active.fetch_sub(1, Ordering::AcqRel) == 1 {
                        done.store(true, Ordering::Release);
                    }
                });
            } else {
                scope.spawn(|| {
                    rally.wait();
                    let mut out = Box::new([0u8; BITMAP_BYTES]);
                    while !done.load(Ordering::Acquire) {
                        let csn = latest.load(Ordering::Acquire);
                        let _ = store.lookup(csn, &mut out);
                        reads.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        }
        rally.wait();
        started = Instant::now();
    });

    (started.elapsed().as_secs_f64(), reads.load(Ordering::Relaxed))
}

fn verify_phase(
    store: &BitmapVersionStore,
    history: &[VersionedBitmap<BITMAP_BYTES>],
    targets: &[u64],
    verify_threads: usize,
) -> (f64, u64, u64, u64) {
    let by_csn: HashMap<u64, &VersionedBitmap<BITMAP_BYTES>> =
        history.iter().map(|version| (version.csn, version)).collect();
    let missing = AtomicU64::new(0);
    let mismatches = AtomicU64::new(0);
    let chunk = targets.len().div_ceil(verify_threads.max(1)).max(1);

    let started = Instant::now();
    std::thread::scope(|scope| {
        let store = &store;
        let by_csn = &by_csn;
        let missing = &missing;
        let mismatches = &mismatches;
        for slice in targets.chunks(chunk) {
            scope.spawn(move || {
                let mut out = Box::new([0u8; BITMAP_BYTES]);
                for &csn in slice {
                    let Some(version) = by_csn.get(&csn) else {
                        missing.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    if !store.lookup(csn, &mut out) {
                        tracing::warn!(csn, "retrievable snapshot went missing");
                        missing.fetch_add(1, Ordering::Relaxed);
                    } else if *out != *version.bits {
                        tracing::warn!(csn, "snapshot bytes diverged from the submitted bitmap");
                        mismatches.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    (
        started.elapsed().as_secs_f64(),
        targets.len() as u64,
        missing.load(Ordering::Relaxed),
        mismatches.load(Ordering::Relaxed),
    )
}
