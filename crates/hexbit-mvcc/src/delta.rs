//! Bit-difference codec for versioned bitmaps.
//!
//! A version's payload is its XOR difference against the reference bitmap of
//! the group it lives in, stored in one of two forms:
//! - Sparse: an ascending list of differing bit positions.
//! - Dense: a verbatim copy of the versioned bitmap itself, packed as
//!   little-endian 16-bit words. Chosen when the difference is too dense for
//!   the sparse form to pay off; dense payloads decode without consulting the
//!   reference.

use std::cmp::Ordering;

use smallvec::SmallVec;

/// Bit positions of a sparse delta. Inline storage covers the common case of
/// a handful of flipped bits per version.
pub type PositionList = SmallVec<[u16; 8]>;

/// Differing-bit count at or above which the dense form is selected, for a
/// bitmap of `width` bytes.
#[must_use]
pub const fn dense_threshold(width: usize) -> usize {
    width / 16
}

/// Encoded difference between a versioned bitmap and its group reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// Strictly ascending bit positions of the XOR against the reference.
    /// Bits are numbered most-significant-first within each byte:
    /// `position = byte_index * 8 + (7 - lsb_index)`.
    Sparse(PositionList),
    /// The versioned bitmap itself, as `B / 2` little-endian byte pairs.
    Dense(Box<[u16]>),
}

impl Delta {
    /// Whether this delta holds the sparse form.
    #[must_use]
    pub const fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse(_))
    }

    /// Payload size in 16-bit words.
    #[must_use]
    pub fn storage_words(&self) -> usize {
        match self {
            Self::Sparse(positions) => positions.len(),
            Self::Dense(words) => words.len(),
        }
    }
}

/// Encode `original` as a difference against `reference`.
///
/// Differences with `dense_threshold(B)` or more set bits in the XOR take the
/// dense form (the threshold is inclusive on the dense side).
#[must_use]
pub fn encode<const B: usize>(original: &[u8; B], reference: &[u8; B]) -> Delta {
    debug_assert!(B % 2 == 0 && B * 8 <= 1 << 16);

    let mut differing = 0usize;
    for (lhs, rhs) in original.iter().zip(reference.iter()) {
        differing += (lhs ^ rhs).count_ones() as usize;
    }

    if differing >= dense_threshold(B) {
        let mut words = Vec::with_capacity(B / 2);
        for pair in original.chunks_exact(2) {
            words.push(u16::from_le_bytes([pair[0], pair[1]]));
        }
        return Delta::Dense(words.into_boxed_slice());
    }

    let mut positions = PositionList::with_capacity(differing);
    for (index, (lhs, rhs)) in original.iter().zip(reference.iter()).enumerate() {
        let diff = lhs ^ rhs;
        if diff == 0 {
            continue;
        }
        for bit in 0..8 {
            if diff & (1u8 << (7 - bit)) != 0 {
                positions.push((index * 8 + bit) as u16);
            }
        }
    }
    debug_assert_eq!(positions.len(), differing);
    debug_assert!(strictly_ascending(&positions));
    Delta::Sparse(positions)
}

/// Reconstruct the versioned bitmap into `out`.
///
/// Sparse deltas flip the listed bits in a copy of `reference`; dense deltas
/// are self-sufficient and overwrite `out` outright.
///
/// # Panics
///
/// Panics on a dense payload whose word count is not `B / 2`; that state is a
/// programming error, not a recoverable condition.
pub fn decode<const B: usize>(reference: &[u8; B], delta: &Delta, out: &mut [u8; B]) {
    match delta {
        Delta::Sparse(positions) => {
            out.copy_from_slice(reference);
            for &position in positions {
                let byte = usize::from(position) / 8;
                let bit = usize::from(position) % 8;
                out[byte] ^= 1u8 << (7 - bit);
            }
        }
        Delta::Dense(words) => {
            assert_eq!(words.len(), B / 2, "dense payload width mismatch");
            for (index, word) in words.iter().enumerate() {
                let [lo, hi] = word.to_le_bytes();
                out[2 * index] = lo;
                out[2 * index + 1] = hi;
            }
        }
    }
}

/// Set union of two ascending position lists.
///
/// This is the merge primitive of the finalize pass: the newly finalized
/// delta is folded into an older-delta operand. Both operands must already be
/// strictly ascending; duplicates collapse to one element. Dense deltas are
/// never merged.
#[must_use]
pub fn union_positions(older: &[u16], newer: &[u16]) -> PositionList {
    debug_assert!(strictly_ascending(older));
    debug_assert!(strictly_ascending(newer));

    let mut merged = PositionList::with_capacity(older.len() + newer.len());
    let mut i = 0;
    let mut j = 0;
    while i < older.len() && j < newer.len() {
        match older[i].cmp(&newer[j]) {
            Ordering::Less => {
                merged.push(older[i]);
                i += 1;
            }
            Ordering::Greater => {
                merged.push(newer[j]);
                j += 1;
            }
            Ordering::Equal => {
                merged.push(older[i]);
                i += 1;
                j += 1;
            }
        }
    }
    merged.extend_from_slice(&older[i..]);
    merged.extend_from_slice(&newer[j..]);
    merged
}

/// True when `positions` is strictly ascending.
#[must_use]
pub fn strictly_ascending(positions: &[u16]) -> bool {
    positions.windows(2).all(|pair| pair[0] < pair[1])
}
