//! [`ActiveJobMask`]: one bit per dynamically spawned job slot.
//!
//! # Invariants
//! - Bits at or above `capacity` are never set.
//! - A bit is set by exactly one successful [`ActiveJobMask::try_claim_below`]
//!   and cleared by exactly one [`ActiveJobMask::release`] from its owner.
//!
//! # Ordering
//! Claims use `AcqRel` so the claiming thread observes everything the
//! previous owner of the slot did before releasing it.

use std::sync::atomic::{AtomicU32, Ordering};

/// Maximum number of slots a mask can track.
pub const MAX_SLOTS: usize = u32::BITS as usize;

/// Result of one claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns `slot`.
    Claimed(usize),
    /// Another thread set the candidate bit first.
    Contended,
    /// Every slot below the requested limit is taken.
    Saturated,
}

/// Atomic bitmap with "claim at most one slot per call" semantics.
pub struct ActiveJobMask {
    bits: AtomicU32,
    capacity: usize,
}

impl ActiveJobMask {
    /// # Panics
    ///
    /// Panics if `capacity` is zero or larger than [`MAX_SLOTS`].
    pub fn new(capacity: usize) -> Self {
        Self::with_initial(capacity, 0)
    }

    /// Creates a mask whose lowest `initial` slots are already claimed.
    pub fn with_initial(capacity: usize, initial: usize) -> Self {
        assert!(
            (1..=MAX_SLOTS).contains(&capacity),
            "active job mask capacity must be in 1..={MAX_SLOTS}, got {capacity}"
        );
        assert!(initial <= capacity, "{initial} initial slots exceed capacity {capacity}");
        ActiveJobMask {
            bits: AtomicU32::new(low_bits(initial)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of currently claimed slots.
    pub fn count(&self) -> usize {
        self.bits.load(Ordering::Acquire).count_ones() as usize
    }

    pub fn is_claimed(&self, slot: usize) -> bool {
        slot < self.capacity && self.bits.load(Ordering::Acquire) & (1 << slot) != 0
    }

    /// Tries to claim the lowest free slot below `limit` (clamped to capacity).
    ///
    /// Makes exactly one test-and-set attempt; a lost race reports
    /// [`Claim::Contended`] rather than retrying.
    pub fn try_claim_below(&self, limit: usize) -> Claim {
        let limit = limit.min(self.capacity);
        let current = self.bits.load(Ordering::Acquire);
        let slot = (!current).trailing_zeros() as usize;
        if slot >= limit {
            return Claim::Saturated;
        }

        let bit = 1u32 << slot;
        if self.bits.fetch_or(bit, Ordering::AcqRel) & bit == 0 {
            Claim::Claimed(slot)
        } else {
            Claim::Contended
        }
    }

    /// Releases `slot`.
    ///
    /// # Panics
    ///
    /// Panics if the slot was not claimed.
    pub fn release(&self, slot: usize) {
        assert!(slot < self.capacity, "slot {slot} out of range");
        let bit = 1u32 << slot;
        let previous = self.bits.fetch_and(!bit, Ordering::AcqRel);
        assert!(previous & bit != 0, "slot {slot} released while not claimed");
    }
}

impl std::fmt::Debug for ActiveJobMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveJobMask")
            .field("bits", &format_args!("{:#034b}", self.bits.load(Ordering::Relaxed)))
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn low_bits(n: usize) -> u32 {
    if n >= MAX_SLOTS {
        u32::MAX
    } else {
        (1u32 << n) - 1
    }
}
