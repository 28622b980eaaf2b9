//! Scheduler scenarios exercised end to end through the thread pool.

use crate::{JobHandle, JobState, JobSystem, JobSystemSingleThreaded, JobSystemThreadPool};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn recorder(
    system: &dyn JobSystem,
    log: &Arc<Mutex<Vec<&'static str>>>,
    name: &'static str,
    dependencies: u32,
    next: Option<JobHandle>,
) -> JobHandle {
    let log = log.clone();
    system
        .create_job(
            name,
            dependencies,
            Box::new(move || {
                log.lock().push(name);
                if let Some(next) = next {
                    next.remove_dependency_and_queue(1);
                }
            }),
        )
        .unwrap()
}

#[test]
fn test_chain_runs_in_order_on_one_worker() {
    let system = JobSystemThreadPool::with_threads(1);
    let log = Arc::new(Mutex::new(Vec::new()));

    let c = recorder(&system, &log, "C", 1, None);
    let b = recorder(&system, &log, "B", 1, Some(c.clone()));
    let a = recorder(&system, &log, "A", 0, Some(b.clone()));

    let barrier = system.create_barrier().unwrap();
    barrier.add_jobs(&[a.clone(), b.clone(), c.clone()]);
    system.queue_job(&a);
    system.wait_for_jobs(&barrier);

    assert_eq!(*log.lock(), vec!["A", "B", "C"]);
    assert!([&a, &b, &c].iter().all(|job| job.is_done()));
    system.shutdown().expect("Shutdown failed");
}

#[test]
fn test_independent_jobs_on_four_workers() {
    let system = JobSystemThreadPool::with_threads(4);
    let sum = Arc::new(AtomicUsize::new(0));

    let jobs: Vec<JobHandle> = (1..=8)
        .map(|i| {
            let sum = sum.clone();
            system
                .create_job(
                    "add",
                    0,
                    Box::new(move || {
                        sum.fetch_add(i, Ordering::SeqCst);
                    }),
                )
                .unwrap()
        })
        .collect();

    let barrier = system.create_barrier().unwrap();
    barrier.add_jobs(&jobs);
    system.queue_jobs(&jobs);
    system.wait_for_jobs(&barrier);

    assert_eq!(sum.load(Ordering::SeqCst), 36);
    assert!(jobs.iter().all(JobHandle::is_done));
    system.shutdown().expect("Shutdown failed");
}

#[test]
fn test_concurrent_removal_runs_job_once() {
    let system = JobSystemThreadPool::with_threads(2);
    let runs = Arc::new(AtomicUsize::new(0));
    let x = {
        let runs = runs.clone();
        system
            .create_job(
                "X",
                3,
                Box::new(move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap()
    };
    let barrier = system.create_barrier().unwrap();
    barrier.add_job(&x);

    let releasers: Vec<_> = (0..3)
        .map(|_| {
            let x = x.clone();
            thread::spawn(move || x.remove_dependency_and_queue(1))
        })
        .collect();
    for releaser in releasers {
        releaser.join().unwrap();
    }
    system.wait_for_jobs(&barrier);

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(x.state(), JobState::Done);
    system.shutdown().expect("Shutdown failed");
}

#[test]
fn test_job_added_while_waiting_is_awaited() {
    let system = Arc::new(JobSystemThreadPool::with_threads(2));
    let barrier = Arc::new(system.create_barrier().unwrap());
    let late_ran = Arc::new(AtomicUsize::new(0));

    let spawner = {
        let pool = system.pool().clone();
        let barrier = barrier.clone();
        let late_ran = late_ran.clone();
        system
            .create_job(
                "spawner",
                0,
                Box::new(move || {
                    thread::sleep(Duration::from_millis(20));
                    let late = pool
                        .create_job(
                            "late",
                            0,
                            Box::new(move || {
                                thread::sleep(Duration::from_millis(20));
                                late_ran.fetch_add(1, Ordering::SeqCst);
                            }),
                        )
                        .unwrap();
                    barrier.add_job(&late);
                    pool.queue_job(late);
                }),
            )
            .unwrap()
    };
    barrier.add_job(&spawner);
    system.queue_job(&spawner);
    system.wait_for_jobs(&barrier);

    assert_eq!(late_ran.load(Ordering::SeqCst), 1);
    assert!(barrier.is_done());
}

#[test]
fn test_panicking_job_still_completes_barrier() {
    let system = JobSystemThreadPool::with_threads(2);
    let after = Arc::new(AtomicUsize::new(0));

    let follower = {
        let after = after.clone();
        system
            .create_job(
                "follower",
                1,
                Box::new(move || {
                    after.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap()
    };
    let bad = {
        let follower = follower.clone();
        system
            .create_job(
                "bad",
                0,
                Box::new(move || {
                    follower.remove_dependency_and_queue(1);
                    panic!("job failure");
                }),
            )
            .unwrap()
    };

    let barrier = system.create_barrier().unwrap();
    barrier.add_jobs(&[bad.clone(), follower.clone()]);
    system.queue_job(&bad);
    system.wait_for_jobs(&barrier);

    assert_eq!(after.load(Ordering::SeqCst), 1);
    assert_eq!(system.pool().panicked_jobs(), 1);
    assert!(bad.is_done());
    system.shutdown().expect("a panicking job must not kill its worker");
}

#[test]
fn test_single_threaded_chain_with_fan_out() {
    let system = JobSystemSingleThreaded::new(64, 2);
    let log = Arc::new(Mutex::new(Vec::new()));

    let join = recorder(&system, &log, "join", 4, None);
    let branches: Vec<JobHandle> = (0..4)
        .map(|_| recorder(&system, &log, "branch", 1, Some(join.clone())))
        .collect();
    let root = {
        let branches = branches.clone();
        let log = log.clone();
        system
            .create_job(
                "root",
                0,
                Box::new(move || {
                    log.lock().push("root");
                    JobHandle::remove_dependencies(&branches, 1);
                }),
            )
            .unwrap()
    };

    let barrier = system.create_barrier().unwrap();
    barrier.add_job(&root);
    barrier.add_jobs(&branches);
    barrier.add_job(&join);
    system.queue_job(&root);
    system.wait_for_jobs(&barrier);

    let log = log.lock();
    assert_eq!(log.first(), Some(&"root"));
    assert_eq!(log.last(), Some(&"join"));
    assert_eq!(log.len(), 6);
}
