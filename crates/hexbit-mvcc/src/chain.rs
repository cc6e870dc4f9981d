//! Version nodes and reference groups.
//!
//! A reference group owns one immutable full bitmap and a newest-first chain
//! of version nodes that encode their differences against it. Writers mutate
//! a group only under its lock; readers traverse `first`/`next`/`delta`
//! through acquire loads and never block.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

use crate::delta::{Delta, PositionList, union_positions};
use crate::ebr::GLOBAL_CHAIN_METRICS;

/// One differential bitmap version.
///
/// A null `delta` pointer marks a placeholder: the node is linked at its
/// chain position but its payload has not been computed yet.
pub(crate) struct VersionNode {
    pub(crate) csn: u64,
    pub(crate) next: Atomic<VersionNode>,
    pub(crate) delta: Atomic<Delta>,
}

impl Drop for VersionNode {
    fn drop(&mut self) {
        // Exclusive at this point; the chain links are torn down by the
        // owning group, only the payload is freed here.
        let guard = unsafe { epoch::unprotected() };
        let payload = self.delta.swap(Shared::null(), Ordering::Relaxed, guard);
        if !payload.is_null() {
            drop(unsafe { payload.into_owned() });
        }
    }
}

/// A reference bitmap plus the chain of versions encoded against it.
pub(crate) struct ReferenceGroup<const B: usize> {
    /// Full bitmap of the version that opened the group. Immutable.
    pub(crate) reference: Box<[u8; B]>,
    /// CSN of the opening version.
    pub(crate) csn_lo: u64,
    /// Largest finalized CSN known to be visible through this group.
    pub(crate) csn_hi: AtomicU64,
    /// Finalized versions in the group.
    pub(crate) count: AtomicU32,
    /// Newest version node.
    pub(crate) first: Atomic<VersionNode>,
    /// Next (older) group.
    pub(crate) next: Atomic<ReferenceGroup<B>>,
    /// Guards chain mutation: prepends, finalizes, and the merge pass.
    lock: Mutex<()>,
}

impl<const B: usize> ReferenceGroup<B> {
    /// Open a group around `bitmap`.
    ///
    /// The opening version is finalized on the spot with an empty sparse
    /// delta: the reference bitmap *is* the bitmap at `csn`.
    pub(crate) fn open(csn: u64, bitmap: &[u8; B]) -> Owned<Self> {
        let opener = Owned::new(VersionNode {
            csn,
            next: Atomic::null(),
            delta: Atomic::new(Delta::Sparse(PositionList::new())),
        });
        Owned::new(Self {
            reference: Box::new(*bitmap),
            csn_lo: csn,
            csn_hi: AtomicU64::new(csn),
            count: AtomicU32::new(1),
            first: Atomic::from(opener),
            next: Atomic::null(),
            lock: Mutex::new(()),
        })
    }

    /// Link a placeholder for `csn` as the new chain head.
    ///
    /// Does not count the version; that happens when it is finalized.
    pub(crate) fn prepend_placeholder<'g>(
        &self,
        csn: u64,
        guard: &'g Guard,
    ) -> Shared<'g, VersionNode> {
        let node = Owned::new(VersionNode {
            csn,
            next: Atomic::null(),
            delta: Atomic::null(),
        });
        let _chain = self.lock.lock();
        node.next
            .store(self.first.load(Ordering::Acquire, guard), Ordering::Relaxed);
        let shared = node.into_shared(guard);
        self.first.store(shared, Ordering::Release);
        shared
    }

    /// Fill a placeholder with its encoded delta and run the merge pass.
    ///
    /// The walk goes newest to oldest and stops at `node`. Placeholders reset
    /// the merge start point: their payload is unknown, so nothing may be
    /// merged across them. Dense nodes are also merge barriers (they are
    /// self-sufficient snapshots and never union operands) but, being
    /// finalized, they still extend the trailing visible CSN. If a start
    /// point survives the walk, the freshly finalized sparse delta is
    /// unioned into every finalized sparse node between it and `node`.
    pub(crate) fn finalize(&self, node: Shared<'_, VersionNode>, delta: Delta, guard: &Guard) {
        let _chain = self.lock.lock();
        let target = unsafe { node.deref() };
        debug_assert!(
            target.delta.load(Ordering::Relaxed, guard).is_null(),
            "finalize on an already finalized version"
        );
        target.delta.store(Owned::new(delta), Ordering::Release);
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut start: Shared<'_, VersionNode> = Shared::null();
        let mut trailing_csn: Option<u64> = None;
        let mut cursor = self.first.load(Ordering::Acquire, guard);
        while !cursor.is_null() && !std::ptr::eq(cursor.as_raw(), node.as_raw()) {
            let version = unsafe { cursor.deref() };
            let payload = version.delta.load(Ordering::Acquire, guard);
            match unsafe { payload.as_ref() } {
                None => {
                    start = Shared::null();
                    trailing_csn = None;
                }
                Some(Delta::Sparse(_)) => {
                    start = cursor;
                    trailing_csn = Some(version.csn);
                }
                Some(Delta::Dense(_)) => {
                    start = Shared::null();
                    trailing_csn = Some(version.csn);
                }
            }
            cursor = version.next.load(Ordering::Acquire, guard);
        }

        if !start.is_null() {
            let fresh = target.delta.load(Ordering::Acquire, guard);
            if let Some(Delta::Sparse(fresh_positions)) = unsafe { fresh.as_ref() } {
                let mut cursor = start;
                while !cursor.is_null() && !std::ptr::eq(cursor.as_raw(), node.as_raw()) {
                    let version = unsafe { cursor.deref() };
                    let payload = version.delta.load(Ordering::Acquire, guard);
                    if let Some(Delta::Sparse(existing)) = unsafe { payload.as_ref() } {
                        let merged = union_positions(existing, fresh_positions);
                        let stale = version.delta.swap(
                            Owned::new(Delta::Sparse(merged)),
                            Ordering::AcqRel,
                            guard,
                        );
                        unsafe { guard.defer_destroy(stale) };
                        GLOBAL_CHAIN_METRICS.record_retirement_deferred();
                        GLOBAL_CHAIN_METRICS.record_merge_applied();
                    }
                    cursor = version.next.load(Ordering::Acquire, guard);
                }
            }
        }

        let trailing = trailing_csn.unwrap_or(target.csn);
        self.csn_hi.fetch_max(trailing, Ordering::AcqRel);
        tracing::trace!(csn = target.csn, trailing, "version finalized");
    }
}

impl<const B: usize> Drop for ReferenceGroup<B> {
    fn drop(&mut self) {
        // The group is exclusive once it reaches drop (reclaimed behind the
        // epoch or torn down with the controller). `next` groups are owned
        // and dropped by whoever severed the list, not here.
        let guard = unsafe { epoch::unprotected() };
        let mut cursor = self.first.swap(Shared::null(), Ordering::Relaxed, guard);
        while !cursor.is_null() {
            let node = unsafe { cursor.into_owned() };
            cursor = node.next.swap(Shared::null(), Ordering::Relaxed, guard);
            drop(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{decode, encode};

    fn decode_at<const B: usize>(group: &ReferenceGroup<B>, csn: u64) -> Option<[u8; B]> {
        let guard = epoch::pin();
        let mut cursor = group.first.load(Ordering::Acquire, &guard);
        while let Some(version) = unsafe { cursor.as_ref() } {
            if version.csn == csn {
                let payload = version.delta.load(Ordering::Acquire, &guard);
                let payload = unsafe { payload.as_ref() }?;
                let mut out = [0u8; B];
                decode(&group.reference, payload, &mut out);
                return Some(out);
            }
            cursor = version.next.load(Ordering::Acquire, &guard);
        }
        None
    }

    #[test]
    fn test_open_finalizes_the_reference_version() {
        let mut bitmap = [0u8; 32];
        bitmap[4] = 0xF0;
        let group = ReferenceGroup::<32>::open(7, &bitmap);

        assert_eq!(group.csn_lo, 7);
        assert_eq!(group.csn_hi.load(Ordering::Relaxed), 7);
        assert_eq!(group.count.load(Ordering::Relaxed), 1);
        assert_eq!(decode_at(&group, 7), Some(bitmap));
    }

    #[test]
    fn test_placeholder_is_invisible_until_finalized() {
        let base = [0u8; 32];
        let group = ReferenceGroup::<32>::open(1, &base);
        let guard = epoch::pin();
        let node = group.prepend_placeholder(2, &guard);

        assert_eq!(group.count.load(Ordering::Relaxed), 1);
        assert_eq!(decode_at(&group, 2), None);

        let mut updated = base;
        updated[0] = 0x80;
        group.finalize(node, encode(&updated, &group.reference), &guard);

        assert_eq!(group.count.load(Ordering::Relaxed), 2);
        assert_eq!(group.csn_hi.load(Ordering::Relaxed), 2);
        assert_eq!(decode_at(&group, 2), Some(updated));
        // The opener still decodes to the reference.
        assert_eq!(decode_at(&group, 1), Some(base));
    }

    #[test]
    fn test_out_of_order_finalize_keeps_every_version_exact() {
        // Monotone bitmaps: each version sets one more bit.
        let base = [0u8; 32];
        let group = ReferenceGroup::<32>::open(10, &base);
        let guard = epoch::pin();

        let mut v11 = base;
        v11[1] = 0x80;
        let mut v12 = v11;
        v12[2] = 0x80;

        let n11 = group.prepend_placeholder(11, &guard);
        let n12 = group.prepend_placeholder(12, &guard);

        // Newer version lands first; the later finalize of 11 must union its
        // delta into 12 without disturbing either decode.
        group.finalize(n12, encode(&v12, &group.reference), &guard);
        assert_eq!(group.csn_hi.load(Ordering::Relaxed), 12);

        group.finalize(n11, encode(&v11, &group.reference), &guard);
        assert_eq!(group.csn_hi.load(Ordering::Relaxed), 12);

        assert_eq!(decode_at(&group, 10), Some(base));
        assert_eq!(decode_at(&group, 11), Some(v11));
        assert_eq!(decode_at(&group, 12), Some(v12));
    }

    #[test]
    fn test_placeholder_barrier_survives_interleaved_finalize() {
        // B = 256 keeps the one-bit-per-version deltas sparse.
        let base = [0u8; 256];
        let group = ReferenceGroup::<256>::open(20, &base);
        let guard = epoch::pin();

        let mut v21 = base;
        v21[0] = 0x01;
        let mut v22 = v21;
        v22[1] = 0x01;
        let mut v23 = v22;
        v23[2] = 0x01;

        let n21 = group.prepend_placeholder(21, &guard);
        let n22 = group.prepend_placeholder(22, &guard);
        let n23 = group.prepend_placeholder(23, &guard);

        // 23 finalizes first, then 21 while 22 is still an unfilled barrier
        // between them, then 22 — whose own merge pass propagates into 23.
        group.finalize(n23, encode(&v23, &group.reference), &guard);
        group.finalize(n21, encode(&v21, &group.reference), &guard);
        assert_eq!(
            group.csn_hi.load(Ordering::Relaxed),
            23,
            "trailing CSN resets at the 22 barrier, 21 must not regress hi"
        );
        group.finalize(n22, encode(&v22, &group.reference), &guard);

        assert_eq!(decode_at(&group, 20), Some(base));
        assert_eq!(decode_at(&group, 21), Some(v21));
        assert_eq!(decode_at(&group, 22), Some(v22));
        assert_eq!(decode_at(&group, 23), Some(v23));
        assert_eq!(group.csn_hi.load(Ordering::Relaxed), 23);
        assert_eq!(group.count.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_dense_version_is_self_sufficient() {
        // B = 32 puts the dense threshold at 2 differing bits.
        let base = [0u8; 32];
        let group = ReferenceGroup::<32>::open(30, &base);
        let guard = epoch::pin();

        let mut heavy = base;
        heavy[5] = 0xFF;
        let node = group.prepend_placeholder(31, &guard);
        let payload = encode(&heavy, &group.reference);
        assert!(!payload.is_sparse());
        group.finalize(node, payload, &guard);

        assert_eq!(decode_at(&group, 31), Some(heavy));
        assert_eq!(group.csn_hi.load(Ordering::Relaxed), 31);

        // A later version that is sparse against the reference leaves the
        // dense node untouched (dense payloads are never union targets).
        let mut light = base;
        light[6] = 0x01;
        let tail = group.prepend_placeholder(32, &guard);
        let light_payload = encode(&light, &group.reference);
        assert!(light_payload.is_sparse());
        group.finalize(tail, light_payload, &guard);
        assert_eq!(decode_at(&group, 31), Some(heavy));
        assert_eq!(decode_at(&group, 32), Some(light));
        assert_eq!(group.csn_hi.load(Ordering::Relaxed), 32);
    }
}
