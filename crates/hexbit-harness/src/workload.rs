//! Deterministic workload generation with seeded RNG.
//!
//! Version `i + 1` is version `i` with a fixed number of previously-unset
//! bits set, so histories are monotone the way visibility bitmaps are: a bit,
//! once published, stays published. The first version is all zeroes.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Master seed default.
pub const DEFAULT_SEED: u64 = 42;

/// Attempts to find an unset bit before giving up on a saturated bitmap.
const MAX_SET_ATTEMPTS: usize = 200;

/// Errors raised during workload generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadError {
    /// Could not find an unset bit; the bitmap is effectively saturated.
    BitBudgetExhausted { csn: u64 },
}

impl fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BitBudgetExhausted { csn } => {
                write!(f, "no unset bit found for version csn={csn}")
            }
        }
    }
}

impl std::error::Error for WorkloadError {}

/// One generated version: the CSN and the full bitmap committed at it.
#[derive(Debug, Clone)]
pub struct VersionedBitmap<const B: usize> {
    pub csn: u64,
    pub bits: Box<[u8; B]>,
}

/// Generate `versions` monotone bitmap versions with CSNs `0..versions`.
///
/// # Errors
///
/// Returns [`WorkloadError::BitBudgetExhausted`] when the random walk cannot
/// place another bit, which only happens for tiny widths or huge histories.
pub fn generate<const B: usize>(
    seed: u64,
    versions: usize,
    hamming_step: usize,
) -> Result<Vec<VersionedBitmap<B>>, WorkloadError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut history = Vec::with_capacity(versions);
    let mut current = Box::new([0u8; B]);
    for csn in 0..versions as u64 {
        if csn > 0 {
            set_unset_bits(&mut rng, &mut current, hamming_step, csn)?;
        }
        history.push(VersionedBitmap {
            csn,
            bits: current.clone(),
        });
    }
    Ok(history)
}

fn set_unset_bits<const B: usize>(
    rng: &mut StdRng,
    bits: &mut [u8; B],
    count: usize,
    csn: u64,
) -> Result<(), WorkloadError> {
    for _ in 0..count {
        let mut placed = false;
        for _ in 0..MAX_SET_ATTEMPTS {
            let byte = rng.gen_range(0..B);
            let mask = 1u8 << rng.gen_range(0..8u32);
            if bits[byte] & mask == 0 {
                bits[byte] |= mask;
                placed = true;
                break;
            }
        }
        if !placed {
            return Err(WorkloadError::BitBudgetExhausted { csn });
        }
    }
    Ok(())
}

/// The active-CSN list standing in for the transaction-list oracle.
///
/// Bounded: when full, a batch of random entries is evicted before the new
/// CSN is pushed to the front. The smallest retained CSN is the
/// oldest-visible horizon handed to the store's reclaimer.
#[derive(Debug)]
pub struct ActiveCsnList {
    max_len: usize,
    evict_batch: usize,
    csns: Vec<u64>,
    rng: StdRng,
}

impl ActiveCsnList {
    #[must_use]
    pub fn new(max_len: usize, evict_batch: usize, seed: u64) -> Self {
        Self {
            max_len,
            evict_batch,
            csns: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Record a newly committed CSN, evicting a random batch when full.
    pub fn push(&mut self, csn: u64) {
        if self.csns.len() >= self.max_len {
            for _ in 0..self.evict_batch.min(self.csns.len()) {
                let evict = self.rng.gen_range(0..self.csns.len());
                self.csns.remove(evict);
            }
        }
        self.csns.insert(0, csn);
    }

    /// CSNs still visible to some reader.
    #[must_use]
    pub fn csns(&self) -> &[u64] {
        &self.csns
    }

    /// The reclamation horizon: the smallest retained CSN.
    #[must_use]
    pub fn oldest_visible(&self) -> Option<u64> {
        self.csns.iter().copied().min()
    }
}
