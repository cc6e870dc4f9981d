//! Group reclamation behind the oldest-visible CSN horizon.
//!
//! The active-CSN oracle (an external collaborator) reports the smallest CSN
//! any live reader may still query. Groups whose entire covered range sits
//! below that horizon are unreachable going forward and are severed from the
//! tail of the group list. Destruction is deferred through the epoch so
//! readers and in-flight insert tickets that were pinned before the unlink
//! finish safely.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crossbeam_epoch::{self as epoch, Shared};
use serde::Serialize;

use crate::controller::BitmapVersionStore;
use crate::ebr::GLOBAL_CHAIN_METRICS;

/// Outcome of one [`BitmapVersionStore::reclaim`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimResult {
    /// Reference groups severed and retired.
    pub groups_reclaimed: u64,
    /// Finalized versions retired with them.
    pub versions_retired: u64,
}

impl<const B: usize, const G: usize> BitmapVersionStore<B, G> {
    /// Reclaim every group whose `csn_range.hi` is below `oldest_visible_csn`.
    ///
    /// The head group is never reclaimed: it is the only group still
    /// accepting versions. List surgery runs under the head-link lock;
    /// retired groups are destroyed once all readers pinned before the unlink
    /// have moved on.
    pub fn reclaim(&self, oldest_visible_csn: u64) -> ReclaimResult {
        self.readers.warn_on_stale_readers(Instant::now());

        let mut result = ReclaimResult::default();
        let _link = self.head_link.lock();
        let guard = epoch::pin();

        let head = self.head.load(Ordering::Acquire, &guard);
        let Some(head_group) = (unsafe { head.as_ref() }) else {
            return result;
        };

        // Adjacent group ranges only overlap within the in-flight window, so
        // the first expired group below the head starts an expired suffix.
        let mut predecessor = head_group;
        let mut current = predecessor.next.load(Ordering::Acquire, &guard);
        while let Some(group) = unsafe { current.as_ref() } {
            if group.csn_hi.load(Ordering::Acquire) < oldest_visible_csn {
                predecessor.next.store(Shared::null(), Ordering::Release);
                let mut doomed = current;
                while let Some(dead) = unsafe { doomed.as_ref() } {
                    result.groups_reclaimed += 1;
                    result.versions_retired += u64::from(dead.count.load(Ordering::Relaxed));
                    let next = dead.next.load(Ordering::Acquire, &guard);
                    unsafe { guard.defer_destroy(doomed) };
                    GLOBAL_CHAIN_METRICS.record_group_reclaimed();
                    GLOBAL_CHAIN_METRICS.record_retirement_deferred();
                    doomed = next;
                }
                break;
            }
            predecessor = group;
            current = group.next.load(Ordering::Acquire, &guard);
        }

        if result.groups_reclaimed > 0 {
            tracing::debug!(
                oldest_visible_csn,
                groups = result.groups_reclaimed,
                versions = result.versions_retired,
                "reclaimed expired reference groups"
            );
        }
        result
    }
}
