//! The version-chain controller: two-stage insert and lock-free lookup.
//!
//! Writers run a two-stage protocol. Stage 1 ([`BitmapVersionStore::reserve`])
//! claims a slot under the head-count lock and links a placeholder into the
//! head group — or opens a fresh group when the head is full. Stage 2
//! ([`BitmapVersionStore::finalize`]) computes the delta outside any lock and
//! publishes it under the group lock. Readers
//! ([`BitmapVersionStore::lookup`]) walk the group list and version chains
//! through acquire loads only.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Shared};
use parking_lot::Mutex;

use crate::chain::{ReferenceGroup, VersionNode};
use crate::delta;
use crate::ebr::{GLOBAL_CHAIN_METRICS, ReaderRegistry, SnapshotGuard, StaleReaderConfig};

/// Reference bitmap width in bytes.
pub const BITMAP_BYTES: usize = 7500;

/// Maximum versions per reference group.
pub const GROUP_FANOUT: usize = 9;

/// Multi-version store for fixed-width visibility bitmaps.
///
/// Each committed bitmap is addressed by its commit sequence number (CSN);
/// CSNs are assigned by the caller and strictly increasing. `B` is the bitmap
/// width in bytes, `G` the group fanout.
pub struct BitmapVersionStore<const B: usize = BITMAP_BYTES, const G: usize = GROUP_FANOUT> {
    pub(crate) head: Atomic<ReferenceGroup<B>>,
    /// Versions admitted to the head group so far. Starts saturated so the
    /// first insert opens a group.
    head_count: Mutex<usize>,
    /// Serializes head publication (and list surgery in reclaim).
    pub(crate) head_link: Mutex<()>,
    pub(crate) readers: Arc<ReaderRegistry>,
}

/// Stage-1 handle for a reserved version slot.
///
/// Holds an epoch pin for the reserving thread, so the group and placeholder
/// it points at cannot be reclaimed before [`BitmapVersionStore::finalize`]
/// consumes it. Not `Send`: the reserving thread finalizes its own slot.
pub struct InsertTicket<'store, const B: usize> {
    group: *const ReferenceGroup<B>,
    node: *const VersionNode,
    guard: Guard,
    _store: PhantomData<&'store ()>,
}

impl<const B: usize, const G: usize> BitmapVersionStore<B, G> {
    // Evaluated at monomorphization; rejects configurations the sparse u16
    // position space or the dense byte pairing cannot express.
    const CONFIG_OK: () = {
        assert!(B % 2 == 0, "bitmap width must be an even number of bytes");
        assert!(B * 8 <= 1 << 16, "bit positions must fit in u16");
        assert!(G >= 1, "group fanout must be at least 1");
    };

    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_reader_config(StaleReaderConfig::default())
    }

    /// Create an empty store with a custom stale-reader policy.
    #[must_use]
    pub fn with_reader_config(stale_reader: StaleReaderConfig) -> Self {
        let () = Self::CONFIG_OK;
        Self {
            head: Atomic::null(),
            head_count: Mutex::new(G),
            head_link: Mutex::new(()),
            readers: Arc::new(ReaderRegistry::new(stale_reader)),
        }
    }

    /// Stage 1: reserve a chain slot for `(csn, bitmap)`.
    ///
    /// Returns `None` when the insert opened a new reference group — the
    /// bitmap became the group's reference and is already fully visible, so
    /// there is no stage 2. Otherwise returns the ticket to pass to
    /// [`Self::finalize`].
    ///
    /// Callers supply a strictly increasing CSN sequence and call `reserve`
    /// in CSN order; group boundaries follow that arrival order.
    pub fn reserve(&self, csn: u64, bitmap: &[u8; B]) -> Option<InsertTicket<'_, B>> {
        let guard = epoch::pin();
        let mut open_group = false;
        let mut captured = Shared::null();
        {
            let mut head_count = self.head_count.lock();
            if *head_count == G {
                *head_count = 1;
                open_group = true;
            } else {
                *head_count += 1;
                captured = self.head.load(Ordering::Acquire, &guard);
            }
        }

        if open_group {
            let group = ReferenceGroup::<B>::open(csn, bitmap);
            {
                let _link = self.head_link.lock();
                group
                    .next
                    .store(self.head.load(Ordering::Acquire, &guard), Ordering::Relaxed);
                self.head.store(group, Ordering::Release);
            }
            GLOBAL_CHAIN_METRICS.record_group_opened();
            tracing::debug!(csn, "opened reference group");
            return None;
        }

        // Only the very first batch of inserts can observe a null head: a
        // racing opener has reset the count but not yet published the group.
        // Its critical sections are O(1), so wait it out.
        while captured.is_null() {
            std::hint::spin_loop();
            captured = self.head.load(Ordering::Acquire, &guard);
        }

        let group = unsafe { captured.deref() };
        let node = group.prepend_placeholder(csn, &guard);
        let group_ptr = captured.as_raw();
        let node_ptr = node.as_raw();
        Some(InsertTicket {
            group: group_ptr,
            node: node_ptr,
            guard,
            _store: PhantomData,
        })
    }

    /// Stage 2: encode `bitmap` against the reserved group's reference and
    /// publish it into the placeholder.
    ///
    /// `bitmap` must be the same bitmap passed to the matching
    /// [`Self::reserve`] call.
    pub fn finalize(&self, ticket: InsertTicket<'_, B>, bitmap: &[u8; B]) {
        let InsertTicket {
            group, node, guard, ..
        } = ticket;
        // The ticket's pin has kept both allocations alive since stage 1.
        let group = unsafe { &*group };
        let payload = delta::encode(bitmap, &group.reference);
        group.finalize(Shared::from(node), payload, &guard);
    }

    /// Insert `(csn, bitmap)`, running both stages back to back.
    pub fn insert(&self, csn: u64, bitmap: &[u8; B]) {
        if let Some(ticket) = self.reserve(csn, bitmap) {
            self.finalize(ticket, bitmap);
        }
    }

    /// Reconstruct the bitmap committed at `csn` into `out`.
    ///
    /// Lock-free and best-effort: returns `false` when `csn` is outside every
    /// group's covered range, was reclaimed, or is still a placeholder whose
    /// writer has not published yet (re-query after a short backoff for
    /// must-find semantics).
    pub fn lookup(&self, csn: u64, out: &mut [u8; B]) -> bool {
        let guard = epoch::pin();
        self.lookup_in(csn, out, &guard)
    }

    /// [`Self::lookup`] through a long-lived reader pin.
    pub fn lookup_with(&self, reader: &SnapshotGuard, csn: u64, out: &mut [u8; B]) -> bool {
        self.lookup_in(csn, out, reader.epoch_guard())
    }

    /// Pin a reader for a batch of lookups.
    ///
    /// The pin registers with the store's reader registry; holding it for
    /// long stretches draws stale-reader warnings because it stalls
    /// reclamation.
    #[must_use]
    pub fn reader(&self) -> SnapshotGuard {
        SnapshotGuard::pin(Arc::clone(&self.readers))
    }

    fn lookup_in(&self, csn: u64, out: &mut [u8; B], guard: &Guard) -> bool {
        let mut current = self.head.load(Ordering::Acquire, guard);
        while let Some(group) = unsafe { current.as_ref() } {
            if csn < group.csn_lo {
                current = group.next.load(Ordering::Acquire, guard);
            } else if csn > group.csn_hi.load(Ordering::Acquire) {
                return false;
            } else {
                let mut cursor = group.first.load(Ordering::Acquire, guard);
                while let Some(version) = unsafe { cursor.as_ref() } {
                    if version.csn == csn {
                        let payload = version.delta.load(Ordering::Acquire, guard);
                        return match unsafe { payload.as_ref() } {
                            Some(payload) => {
                                delta::decode(&group.reference, payload, out);
                                true
                            }
                            // Placeholder: the writer publishes imminently.
                            None => false,
                        };
                    }
                    cursor = version.next.load(Ordering::Acquire, guard);
                }
                return false;
            }
        }
        false
    }
}

impl<const B: usize, const G: usize> Default for BitmapVersionStore<B, G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const B: usize, const G: usize> Drop for BitmapVersionStore<B, G> {
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        let mut cursor = self.head.swap(Shared::null(), Ordering::Relaxed, guard);
        while !cursor.is_null() {
            let next = unsafe { cursor.deref() }
                .next
                .swap(Shared::null(), Ordering::Relaxed, guard);
            drop(unsafe { cursor.into_owned() });
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use super::*;

    /// Scenario width: 16 bytes, dense threshold 1, fanout 3.
    type ScenarioStore = BitmapVersionStore<16, 3>;

    fn bitmap_with_bits<const B: usize>(bits: &[usize]) -> [u8; B] {
        let mut out = [0u8; B];
        for &bit in bits {
            out[bit / 8] |= 1u8 << (7 - (bit % 8));
        }
        out
    }

    fn lookup<const B: usize, const G: usize>(
        store: &BitmapVersionStore<B, G>,
        csn: u64,
    ) -> Option<[u8; B]> {
        let mut out = [0u8; B];
        store.lookup(csn, &mut out).then_some(out)
    }

    #[test]
    fn test_lookup_on_empty_store() {
        let store = ScenarioStore::new();
        assert_eq!(lookup(&store, 1), None);
    }

    #[test]
    fn test_incremental_versions_reconstruct_exactly() {
        let store = ScenarioStore::new();
        store.insert(10, &bitmap_with_bits(&[]));
        store.insert(11, &bitmap_with_bits(&[3]));
        store.insert(12, &bitmap_with_bits(&[3, 42]));

        assert_eq!(lookup(&store, 11), Some(bitmap_with_bits::<16>(&[3])));
        assert_eq!(lookup(&store, 12), Some(bitmap_with_bits::<16>(&[3, 42])));
        assert_eq!(lookup(&store, 10), Some(bitmap_with_bits::<16>(&[])));
    }

    #[test]
    fn test_lookup_below_the_oldest_group_misses() {
        let store = ScenarioStore::new();
        store.insert(10, &bitmap_with_bits(&[]));
        store.insert(11, &bitmap_with_bits(&[3]));
        assert_eq!(lookup(&store, 9), None);
    }

    #[test]
    fn test_group_boundary_follows_arrival_order() {
        let store = ScenarioStore::new();
        store.insert(20, &bitmap_with_bits(&[]));
        store.insert(21, &bitmap_with_bits(&[1]));
        store.insert(22, &bitmap_with_bits(&[2]));
        // Fourth arrival trips the fanout of 3 and opens the next group.
        store.insert(23, &bitmap_with_bits(&[3]));

        assert_eq!(lookup(&store, 20), Some(bitmap_with_bits::<16>(&[])));
        assert_eq!(lookup(&store, 23), Some(bitmap_with_bits::<16>(&[3])));
        assert_eq!(lookup(&store, 21), Some(bitmap_with_bits::<16>(&[1])));
        assert_eq!(lookup(&store, 22), Some(bitmap_with_bits::<16>(&[2])));

        // The sealed group kept exactly G versions; the new head holds one.
        let guard = epoch::pin();
        let head = store.head.load(Ordering::Acquire, &guard);
        let head = unsafe { head.deref() };
        assert_eq!(head.csn_lo, 23);
        assert_eq!(head.count.load(Ordering::Relaxed), 1);
        let sealed = head.next.load(Ordering::Acquire, &guard);
        let sealed = unsafe { sealed.deref() };
        assert_eq!(sealed.csn_lo, 20);
        assert_eq!(sealed.count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_all_bits_set_version_takes_the_dense_form() {
        let store = ScenarioStore::new();
        store.insert(29, &bitmap_with_bits(&[0]));
        let everything = [0xFFu8; 16];
        store.insert(30, &everything);
        assert_eq!(lookup(&store, 30), Some(everything));
        assert_eq!(lookup(&store, 29), Some(bitmap_with_bits::<16>(&[0])));
    }

    #[test]
    fn test_unfinalized_placeholder_reads_as_not_found() {
        let store = ScenarioStore::new();
        store.insert(40, &bitmap_with_bits(&[]));
        let pending = bitmap_with_bits(&[5]);
        let newer = bitmap_with_bits(&[5, 6]);
        let ticket = store.reserve(41, &pending).expect("joins the head group");
        // A newer finalized version pulls csn_range.hi over the placeholder,
        // so the miss below comes from the null delta, not the range check.
        store.insert(42, &newer);

        assert_eq!(lookup(&store, 42), Some(newer));
        assert_eq!(lookup(&store, 41), None, "placeholder must stay invisible");
        store.finalize(ticket, &pending);
        assert_eq!(lookup(&store, 41), Some(pending));
    }

    #[test]
    fn test_concurrent_writers_single_reader_exact_snapshots() {
        // Eight writers insert csns 100..=107, each bitmap carrying one
        // distinct bit; one reader hammers csn 103. Stage 1 runs in CSN
        // order under the dispatch lock, stage 2 races freely.
        let store = BitmapVersionStore::<16, 3>::new();
        let expected: Vec<[u8; 16]> = (0..8).map(|i| bitmap_with_bits(&[i])).collect();

        let dispatch = Mutex::new(0usize);
        let rally = Barrier::new(9);
        let done = AtomicBool::new(false);
        let good_reads = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    rally.wait();
                    // Stage 1 under the dispatch lock keeps arrival in CSN
                    // order; stage 2 races across writers.
                    let (bitmap, ticket) = {
                        let mut next = dispatch.lock();
                        let index = *next;
                        *next += 1;
                        let bitmap = &expected[index];
                        (bitmap, store.reserve(100 + index as u64, bitmap))
                    };
                    if let Some(ticket) = ticket {
                        store.finalize(ticket, bitmap);
                    }
                });
            }
            scope.spawn(|| {
                rally.wait();
                let mut out = [0u8; 16];
                while !done.load(Ordering::Acquire) {
                    if store.lookup(103, &mut out) {
                        assert_eq!(out, expected[3], "snapshot for csn 103 must be exact");
                        good_reads.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
            // Wait until every version is visible, then release the reader.
            for csn in 100..108 {
                let mut out = [0u8; 16];
                while !store.lookup(csn, &mut out) {
                    std::thread::yield_now();
                }
            }
            done.store(true, Ordering::Release);
        });

        for (index, bitmap) in expected.iter().enumerate() {
            assert_eq!(lookup(&store, 100 + index as u64), Some(*bitmap));
        }
    }

    #[test]
    fn test_many_writers_monotone_workload_roundtrip() {
        const VERSIONS: usize = 96;
        let store = BitmapVersionStore::<64, 4>::new();

        // Version i sets bit i on top of version i-1.
        let mut bitmaps = Vec::with_capacity(VERSIONS);
        let mut current = [0u8; 64];
        for csn in 0..VERSIONS {
            current[csn / 8] |= 1u8 << (7 - (csn % 8));
            bitmaps.push(current);
        }

        let dispatch = Mutex::new(0usize);
        let rally = Barrier::new(4);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    rally.wait();
                    loop {
                        // Stage 1 under the dispatch lock keeps arrival in
                        // CSN order; stage 2 interleaves across threads.
                        let claimed = {
                            let mut next = dispatch.lock();
                            if *next == VERSIONS {
                                None
                            } else {
                                let index = *next;
                                *next += 1;
                                Some((index as u64, store.reserve(index as u64, &bitmaps[index])))
                            }
                        };
                        match claimed {
                            None => break,
                            Some((csn, Some(ticket))) => {
                                store.finalize(ticket, &bitmaps[csn as usize]);
                            }
                            Some((_, None)) => {}
                        }
                    }
                });
            }
        });

        for (csn, bitmap) in bitmaps.iter().enumerate() {
            assert_eq!(
                lookup(&store, csn as u64),
                Some(*bitmap),
                "csn {csn} must reconstruct exactly"
            );
        }
    }
}
