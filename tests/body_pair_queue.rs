use proptest::prelude::*;
use stepfiber::physics::body_pair_queue::BodyPairQueues;
use stepfiber::physics::BodyPair;
use stepfiber::{HeapTempAllocator, LinearTempAllocator, TempAllocator};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const THREADS: usize = 4;
const PAIRS_PER_THREAD: u32 = 5_000;

#[test]
fn test_every_pair_is_popped_exactly_once() {
    let allocator: Arc<dyn TempAllocator> = Arc::new(HeapTempAllocator);
    // Small rings so producers keep running into full queues.
    let queues = Arc::new(BodyPairQueues::new(&allocator, THREADS, 64).unwrap());
    let popped = Arc::new(AtomicUsize::new(0));
    let total = THREADS * PAIRS_PER_THREAD as usize;

    let workers: Vec<_> = (0..THREADS)
        .map(|owner| {
            let queues = queues.clone();
            let popped = popped.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                let take = |seen: &mut Vec<BodyPair>| match queues.pop_any(owner) {
                    Some(pair) => {
                        seen.push(pair);
                        popped.fetch_add(1, Ordering::SeqCst);
                        true
                    }
                    None => false,
                };

                for i in 0..PAIRS_PER_THREAD {
                    let mut pair = BodyPair::new(owner as u32, THREADS as u32 + i);
                    while let Err(rejected) = queues.push(owner, pair) {
                        pair = rejected;
                        take(&mut seen);
                    }
                }
                while popped.load(Ordering::SeqCst) < total {
                    if !take(&mut seen) {
                        thread::yield_now();
                    }
                }
                seen
            })
        })
        .collect();

    let mut all: Vec<BodyPair> = workers
        .into_iter()
        .flat_map(|worker| worker.join().unwrap())
        .collect();
    all.sort();

    let mut expected: Vec<BodyPair> = (0..THREADS as u32)
        .flat_map(|owner| (0..PAIRS_PER_THREAD).map(move |i| BodyPair::new(owner, THREADS as u32 + i)))
        .collect();
    expected.sort();
    assert_eq!(all, expected);
    assert_eq!(queues.backlog(), 0);
}

#[test]
fn test_slots_come_from_the_scratch_allocator() {
    let linear = Arc::new(LinearTempAllocator::new(1024));
    let allocator: Arc<dyn TempAllocator> = linear.clone();
    let queues = BodyPairQueues::new(&allocator, 2, 32).unwrap();
    assert_eq!(linear.used_bytes(), 32 * std::mem::size_of::<u64>());
    assert!(BodyPairQueues::new(&allocator, 2, 1024).is_err());
    drop(queues);
    assert_eq!(linear.used_bytes(), 0);
}

proptest! {
    #[test]
    fn prop_single_queue_is_fifo_across_wraparound(
        ops in prop::collection::vec(prop::option::of(0u32..1000), 1..200)
    ) {
        let allocator: Arc<dyn TempAllocator> = Arc::new(HeapTempAllocator);
        let queues = BodyPairQueues::new(&allocator, 1, 8).unwrap();
        let mut model = std::collections::VecDeque::new();

        for op in ops {
            match op {
                Some(id) => {
                    let pair = BodyPair::new(id, id + 1);
                    let pushed = queues.push(0, pair).is_ok();
                    prop_assert_eq!(pushed, model.len() < 8);
                    if pushed {
                        model.push_back(pair);
                    }
                }
                None => prop_assert_eq!(queues.pop(0), model.pop_front()),
            }
            prop_assert_eq!(queues.len(0), model.len());
        }
    }
}
