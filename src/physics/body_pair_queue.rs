//! Per-job rings of body pairs waiting for the narrow phase.
//!
//! Each find-collisions job owns one queue and is its only producer. Any job
//! may consume from any queue: the read cursor is advanced with a CAS, so
//! every pushed pair is popped exactly once.

use super::interfaces::BodyPair;
use crate::allocator::{ScratchSlice, TempAllocator};
use crate::error::StepError;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Cursors {
    write: CachePadded<AtomicUsize>,
    read: CachePadded<AtomicUsize>,
}

pub struct BodyPairQueues {
    cursors: Box<[Cursors]>,
    slots: ScratchSlice<AtomicU64>,
    capacity: usize,
}

impl BodyPairQueues {
    /// `total_capacity` is split evenly over `num_queues`, at least one slot each.
    pub fn new(
        allocator: &Arc<dyn TempAllocator>,
        num_queues: usize,
        total_capacity: usize,
    ) -> Result<Self, StepError> {
        assert!(num_queues > 0, "need at least one body pair queue");
        let capacity = (total_capacity / num_queues).max(1);
        let slots = ScratchSlice::new(allocator, num_queues * capacity)?;
        Ok(BodyPairQueues {
            cursors: (0..num_queues).map(|_| Cursors::default()).collect(),
            slots,
            capacity,
        })
    }

    pub fn num_queues(&self) -> usize {
        self.cursors.len()
    }

    pub fn capacity_per_queue(&self) -> usize {
        self.capacity
    }

    fn slot(&self, queue: usize, position: usize) -> &AtomicU64 {
        &self.slots[queue * self.capacity + position % self.capacity]
    }

    /// Number of pairs waiting in `queue`.
    pub fn len(&self, queue: usize) -> usize {
        let cursors = &self.cursors[queue];
        let read = cursors.read.load(Ordering::Acquire);
        let write = cursors.write.load(Ordering::Acquire);
        write.saturating_sub(read)
    }

    /// Pairs waiting over all queues.
    pub fn backlog(&self) -> usize {
        (0..self.num_queues()).map(|queue| self.len(queue)).sum()
    }

    /// Appends `pair` to `queue`. Only the queue's owner may push.
    ///
    /// A full queue hands the pair back; the caller processes it right away.
    pub fn push(&self, queue: usize, pair: BodyPair) -> Result<(), BodyPair> {
        let cursors = &self.cursors[queue];
        let write = cursors.write.load(Ordering::Relaxed);
        let read = cursors.read.load(Ordering::Acquire);
        if write - read >= self.capacity {
            return Err(pair);
        }
        self.slot(queue, write).store(pair.pack(), Ordering::Relaxed);
        cursors.write.store(write + 1, Ordering::Release);
        Ok(())
    }

    /// Takes the oldest pair of `queue`, retrying on contention.
    pub fn pop(&self, queue: usize) -> Option<BodyPair> {
        let cursors = &self.cursors[queue];
        loop {
            let read = cursors.read.load(Ordering::Acquire);
            let write = cursors.write.load(Ordering::Acquire);
            if read >= write {
                return None;
            }
            let packed = self.slot(queue, read).load(Ordering::Relaxed);
            if cursors
                .read
                .compare_exchange_weak(read, read + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(BodyPair::unpack(packed));
            }
        }
    }

    /// Scans every queue starting after `own`, ending with `own` itself.
    /// `None` means every queue was empty during the scan.
    pub fn pop_any(&self, own: usize) -> Option<BodyPair> {
        let count = self.num_queues();
        (1..=count).find_map(|offset| self.pop((own + offset) % count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HeapTempAllocator;

    fn queues(num_queues: usize, total: usize) -> BodyPairQueues {
        let allocator: Arc<dyn TempAllocator> = Arc::new(HeapTempAllocator);
        BodyPairQueues::new(&allocator, num_queues, total).unwrap()
    }

    #[test]
    fn test_fifo_within_a_queue() {
        let queues = queues(2, 8);
        assert_eq!(queues.capacity_per_queue(), 4);
        queues.push(0, BodyPair::new(1, 2)).unwrap();
        queues.push(0, BodyPair::new(3, 4)).unwrap();
        assert_eq!(queues.backlog(), 2);
        assert_eq!(queues.pop(0), Some(BodyPair::new(1, 2)));
        assert_eq!(queues.pop(0), Some(BodyPair::new(3, 4)));
        assert_eq!(queues.pop(0), None);
    }

    #[test]
    fn test_full_queue_hands_pair_back() {
        let queues = queues(1, 2);
        queues.push(0, BodyPair::new(0, 1)).unwrap();
        queues.push(0, BodyPair::new(0, 2)).unwrap();
        assert_eq!(queues.push(0, BodyPair::new(0, 3)), Err(BodyPair::new(0, 3)));
        queues.pop(0);
        // Space frees up as soon as a slot is consumed, and the ring wraps.
        queues.push(0, BodyPair::new(0, 3)).unwrap();
        assert_eq!(queues.pop(0), Some(BodyPair::new(0, 2)));
        assert_eq!(queues.pop(0), Some(BodyPair::new(0, 3)));
    }

    #[test]
    fn test_pop_any_scans_others_first() {
        let queues = queues(3, 9);
        queues.push(1, BodyPair::new(1, 10)).unwrap();
        queues.push(2, BodyPair::new(2, 20)).unwrap();
        queues.push(0, BodyPair::new(0, 30)).unwrap();
        assert_eq!(queues.pop_any(0), Some(BodyPair::new(1, 10)));
        assert_eq!(queues.pop_any(0), Some(BodyPair::new(2, 20)));
        assert_eq!(queues.pop_any(0), Some(BodyPair::new(0, 30)));
        assert_eq!(queues.pop_any(0), None);
    }

    #[test]
    fn test_scratch_exhaustion_propagates() {
        let allocator: Arc<dyn TempAllocator> =
            Arc::new(crate::allocator::LinearTempAllocator::new(16));
        let err = BodyPairQueues::new(&allocator, 2, 64).err().unwrap();
        assert!(matches!(err, StepError::ScratchExhausted { .. }));
    }
}
