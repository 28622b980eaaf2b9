//! Job graph benchmarks using criterion.
//!
//! Measures the cost of building, releasing and draining dependency graphs:
//! a wide fan-out/fan-in and a long chain where every job queues the next.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stepfiber::{JobHandle, JobSystem, JobSystemThreadPool};

const FAN_OUT: usize = 1_000;
const CHAIN: usize = 1_000;

fn bench_fan_out_fan_in(c: &mut Criterion) {
    let num_threads = num_cpus::get();
    let system = JobSystemThreadPool::with_threads(num_threads);

    let mut group = c.benchmark_group("job_graph");
    group.throughput(Throughput::Elements(FAN_OUT as u64 + 1));

    group.bench_function(BenchmarkId::new("fan_out_fan_in", num_threads), |b| {
        b.iter(|| {
            let join = system
                .create_job("join", FAN_OUT as u32, Box::new(|| {}))
                .unwrap();
            let leaves: Vec<JobHandle> = (0..FAN_OUT)
                .map(|_| {
                    let join = join.clone();
                    system
                        .create_job(
                            "leaf",
                            0,
                            Box::new(move || {
                                std::hint::black_box(1 + 1);
                                join.remove_dependency_and_queue(1);
                            }),
                        )
                        .unwrap()
                })
                .collect();

            let barrier = system.create_barrier().unwrap();
            barrier.add_jobs(&leaves);
            barrier.add_job(&join);
            system.queue_jobs(&leaves);
            system.wait_for_jobs(&barrier);
        });
    });

    group.finish();
}

fn bench_chain(c: &mut Criterion) {
    let num_threads = num_cpus::get();
    let system = JobSystemThreadPool::with_threads(num_threads);

    let mut group = c.benchmark_group("job_graph");
    group.throughput(Throughput::Elements(CHAIN as u64));

    group.bench_function(BenchmarkId::new("chain", num_threads), |b| {
        b.iter(|| {
            let mut next: Option<JobHandle> = None;
            let mut jobs = Vec::with_capacity(CHAIN);
            for i in (0..CHAIN).rev() {
                let dependencies = u32::from(i > 0);
                let successor = next.take();
                let job = system
                    .create_job(
                        "link",
                        dependencies,
                        Box::new(move || {
                            if let Some(successor) = successor {
                                successor.remove_dependency_and_queue(1);
                            }
                        }),
                    )
                    .unwrap();
                next = Some(job.clone());
                jobs.push(job);
            }

            let barrier = system.create_barrier().unwrap();
            barrier.add_jobs(&jobs);
            if let Some(head) = next {
                system.queue_job(&head);
            }
            system.wait_for_jobs(&barrier);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fan_out_fan_in, bench_chain);
criterion_main!(benches);
