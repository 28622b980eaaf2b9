//! Once-attachable completion slot linking a job to the barrier that tracks it.
//!
//! A slot moves through at most two transitions:
//!
//! ```text
//! Unclaimed ──attach──▶ Attached(barrier) ──finalize──▶ Finalized
//!     └────────────────────finalize─────────────────────────▲
//! ```
//!
//! Both transitions are single atomic operations, so an attach that races with
//! the job finishing either lands before `finalize` (and the barrier is
//! notified) or observes `Finalized` and is rejected (and the barrier never
//! counts the job).

use std::sync::atomic::{AtomicU32, Ordering};

const UNCLAIMED: u32 = 0;
const FINALIZED: u32 = u32::MAX;

/// Observable state of a [`CompletionSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unclaimed,
    Attached(u32),
    Finalized,
}

/// Why an attach was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    /// The job already finished; there is nothing left to track.
    Finalized,
    /// Another barrier already owns the slot.
    AlreadyAttached(u32),
}

/// Atomic once-cell holding the index of the barrier a job reports to.
#[derive(Debug)]
pub struct CompletionSlot {
    // 0 = unclaimed, u32::MAX = finalized, otherwise barrier index + 1.
    raw: AtomicU32,
}

impl CompletionSlot {
    pub const fn new() -> Self {
        CompletionSlot {
            raw: AtomicU32::new(UNCLAIMED),
        }
    }

    fn decode(raw: u32) -> SlotState {
        match raw {
            UNCLAIMED => SlotState::Unclaimed,
            FINALIZED => SlotState::Finalized,
            index => SlotState::Attached(index - 1),
        }
    }

    /// Claims the slot for `barrier`. Succeeds at most once per slot lifetime.
    pub fn try_attach(&self, barrier: u32) -> Result<(), AttachError> {
        assert!(barrier < FINALIZED - 1, "barrier index {barrier} out of range");
        match self.raw.compare_exchange(
            UNCLAIMED,
            barrier + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(FINALIZED) => Err(AttachError::Finalized),
            Err(other) => Err(AttachError::AlreadyAttached(other - 1)),
        }
    }

    /// Seals the slot and returns the barrier that must be notified, if any.
    ///
    /// # Panics
    ///
    /// Panics if the slot was already finalized (a job completing twice).
    pub fn finalize(&self) -> Option<u32> {
        match Self::decode(self.raw.swap(FINALIZED, Ordering::AcqRel)) {
            SlotState::Unclaimed => None,
            SlotState::Attached(barrier) => Some(barrier),
            SlotState::Finalized => panic!("completion slot finalized twice"),
        }
    }

    pub fn state(&self) -> SlotState {
        Self::decode(self.raw.load(Ordering::Acquire))
    }

    /// Re-opens the slot for a recycled job. The caller must own the job exclusively.
    pub(crate) fn reset(&self) {
        self.raw.store(UNCLAIMED, Ordering::Release);
    }
}

impl Default for CompletionSlot {
    fn default() -> Self {
        Self::new()
    }
}
