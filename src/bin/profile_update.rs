#![allow(dead_code, unused_imports)]

use std::{fs::File, time::Instant};

use lattice_ecs::{Scheduler, SystemAllocator, SystemBuilder, ThreadPoolConfig, World};

#[cfg(feature = "profiling")]
use tracing_subscriber::{self, prelude::*};

#[derive(Debug, Clone, Copy)]
struct Position(f32, f32, f32);

#[derive(Debug, Clone, Copy)]
struct Velocity(f32, f32, f32);

#[derive(Debug, Clone, Copy)]
struct Health(u32);

#[cfg(feature = "profiling")]
fn main() {
    // Write spans as JSON lines to a trace file
    let file = File::create("trace.json").unwrap();
    let (non_blocking, _guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .json()
        .init();

    let mut world = World::new();
    {
        let _span = tracing::info_span!("setup").entered();
        for i in 0..10_000 {
            world.spawn((
                Position(i as f32, 0.0, 0.0),
                Velocity(1.0, 0.0, 0.0),
                Health(100),
            ));
        }
    }

    let mut scheduler = Scheduler::new(
        SystemAllocator::shared(),
        ThreadPoolConfig {
            worker_count: 4,
            ..Default::default()
        },
    );
    scheduler.register(
        SystemBuilder::new("integrate")
            .with_query::<(&mut Position, &Velocity)>()
            .build(|world, _| {
                world
                    .query_mut::<(&mut Position, &Velocity)>()
                    .each(|(pos, vel)| {
                        pos.0 += vel.0;
                    });
            }),
    );
    scheduler.register(
        SystemBuilder::new("regen")
            .with_query::<(&mut Health,)>()
            .build(|world, _| {
                world.query_mut::<(&mut Health,)>().each(|(health,)| {
                    health.0 = (health.0 + 1).min(100);
                });
            }),
    );

    println!("Profiling 1000 scheduler updates...");
    let start = Instant::now();
    for _ in 0..1000 {
        scheduler.update(&mut world).unwrap();
    }
    println!("1000 updates complete in: {:?}", start.elapsed());
}

#[cfg(not(feature = "profiling"))]
fn main() {
    println!("profile_update binary requires --features profiling");
}
