use stepfiber::physics::{ContactCache, PhysicsSettings, PhysicsSystem, SphereDesc, SphereWorld};
use stepfiber::{profiler, JobSystem, JobSystemConfig, JobSystemThreadPool, LinearTempAllocator, TempAllocator};
use std::sync::Arc;
use std::time::Instant;

const FRAMES: usize = 120;
const COLLISION_STEPS: usize = 2;
const FRAME_DT: f32 = 1.0 / 60.0;

/// A grid of spheres above a large static sphere acting as the ground, with
/// every row's first two spheres tied together.
fn build_scene() -> SphereWorld {
    let mut spheres = vec![SphereDesc::fixed([0.0, -100.0, 0.0], 100.0)];
    for x in 0..10 {
        for y in 0..10 {
            for z in 0..10 {
                spheres.push(SphereDesc::dynamic(
                    [x as f32 * 1.1 - 5.0, 1.0 + y as f32 * 1.1, z as f32 * 1.1 - 5.0],
                    0.5,
                ));
            }
        }
    }
    let mut world = SphereWorld::new(&spheres);
    for row in 0..100u32 {
        let first = 1 + row * 10;
        world.add_distance_constraint(first, first + 1);
    }
    world
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("stepfiber - parallel physics step scheduler\n");

    let settings = match std::env::args().nth(1) {
        Some(path) => {
            let json = match std::fs::read_to_string(&path) {
                Ok(json) => json,
                Err(err) => {
                    eprintln!("cannot read {path}: {err}");
                    std::process::exit(1);
                }
            };
            match PhysicsSettings::from_json_str(&json) {
                Ok(settings) => settings,
                Err(err) => {
                    eprintln!("invalid settings in {path}: {err}");
                    std::process::exit(1);
                }
            }
        }
        None => PhysicsSettings::default(),
    };

    let trace_path = std::env::var("STEPFIBER_TRACE").ok();
    let config = JobSystemConfig {
        record_trace: trace_path.is_some(),
        ..JobSystemConfig::default()
    };
    let job_system = Arc::new(JobSystemThreadPool::new(&config));
    println!("Job system: {} worker thread(s)", job_system.max_concurrency());

    let world = Arc::new(build_scene());
    let contacts = Arc::new(ContactCache::new(65536, 65536, 32768));
    let physics = PhysicsSystem::new(
        settings,
        job_system.clone(),
        world.collaborators(contacts.clone()),
    );
    let allocator: Arc<dyn TempAllocator> = Arc::new(LinearTempAllocator::new(16 * 1024 * 1024));

    println!(
        "Scene: {} bodies, simulating {FRAMES} frames with {COLLISION_STEPS} sub-steps\n",
        world.num_bodies()
    );

    let start = Instant::now();
    let mut peak_spawned = 0;
    for frame in 0..FRAMES {
        match physics.update(FRAME_DT, COLLISION_STEPS, &allocator) {
            Ok(errors) if !errors.is_empty() => println!("  frame {frame}: {errors:?}"),
            Ok(_) => {}
            Err(err) => {
                eprintln!("frame {frame} failed: {err}");
                std::process::exit(1);
            }
        }
        let stats = physics.last_update_stats();
        peak_spawned = peak_spawned.max(stats.find_collisions_spawned);
        if frame % 30 == 0 {
            println!(
                "  frame {frame:>3}: {} jobs, {} body pairs, {} manifolds, {:.3} ms",
                stats.jobs_created, stats.body_pairs, stats.manifolds, stats.elapsed_ms
            );
        }
    }
    let elapsed = start.elapsed();

    let lowest = world
        .positions()
        .iter()
        .skip(1)
        .map(|position| position[1])
        .fold(f32::INFINITY, f32::min);
    println!("\nSimulated {FRAMES} frames in {elapsed:?}");
    println!("  lowest sphere center: {lowest:.3}");
    println!("  most find-collisions jobs spawned in one update: {peak_spawned}");
    println!("  cached manifolds: {}", contacts.cached_manifolds());

    drop(physics);
    let job_system = match Arc::try_unwrap(job_system) {
        Ok(job_system) => job_system,
        Err(_) => {
            eprintln!("job system still shared at shutdown");
            std::process::exit(1);
        }
    };
    if let Err(err) = job_system.shutdown() {
        eprintln!("Shutdown error: {err}");
    }

    if let Some(path) = trace_path {
        match profiler::export_chrome_trace(&path) {
            Ok(events) => println!("Wrote {events} trace events to {path}"),
            Err(err) => eprintln!("Failed to write trace to {path}: {err}"),
        }
    }
}
