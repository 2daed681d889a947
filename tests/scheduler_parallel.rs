use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lattice_ecs::{Scheduler, SystemAllocator, SystemBuilder, ThreadPoolConfig, World};

#[derive(Debug, Clone, Copy)]
struct Position {
    x: f32,
}

#[derive(Debug, Clone, Copy)]
struct Velocity {
    x: f32,
}

#[derive(Debug, Clone, Copy)]
struct Health {
    current: i32,
}

fn pool(workers: usize) -> ThreadPoolConfig {
    ThreadPoolConfig {
        worker_count: workers,
        ..Default::default()
    }
}

#[test]
fn independent_systems_overlap_on_a_four_worker_pool() {
    let mut world = World::new();
    world.spawn((Position { x: 0.0 },));
    world.spawn((Velocity { x: 0.0 },));
    world.spawn((Health { current: 1 },));

    let mut scheduler = Scheduler::new(SystemAllocator::shared(), pool(4));

    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    macro_rules! observer_system {
        ($name:literal, $component:ty) => {{
            let live = live.clone();
            let peak = peak.clone();
            SystemBuilder::new($name)
                .with_query::<(&$component,)>()
                .build(move |world, _| {
                    world.query::<(&$component,)>().each(|_| {});
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    live.fetch_sub(1, Ordering::SeqCst);
                })
        }};
    }

    scheduler.register(observer_system!("read_position", Position));
    scheduler.register(observer_system!("read_velocity", Velocity));
    scheduler.register(observer_system!("read_health", Health));

    scheduler.update(&mut world).unwrap();

    // Three independent systems on four workers: at least two must
    // have been live at the same instant
    assert!(
        peak.load(Ordering::SeqCst) >= 2,
        "no concurrent execution observed (peak {})",
        peak.load(Ordering::SeqCst)
    );
}

#[test]
fn write_chain_executes_in_registration_order() {
    let mut world = World::new();
    world.spawn((Position { x: 0.0 }, Velocity { x: 1.0 }));

    let mut scheduler = Scheduler::new(SystemAllocator::shared(), pool(4));
    let trace = Arc::new(std::sync::Mutex::new(Vec::new()));

    for name in ["integrate", "clamp", "mirror"] {
        let trace = trace.clone();
        scheduler.register(
            SystemBuilder::new(name)
                .with_query::<(&mut Position,)>()
                .build(move |world, _| {
                    world.query_mut::<(&mut Position,)>().each(|(pos,)| {
                        pos.x += 1.0;
                    });
                    trace.lock().unwrap().push(name);
                }),
        );
    }

    for _ in 0..3 {
        scheduler.update(&mut world).unwrap();
    }

    let trace = trace.lock().unwrap();
    assert_eq!(trace.len(), 9);
    for frame in trace.chunks(3) {
        assert_eq!(frame, ["integrate", "clamp", "mirror"]);
    }

    let mut x = 0.0;
    world.query::<(&Position,)>().each(|(pos,)| x = pos.x);
    assert_eq!(x, 9.0);
}

#[test]
fn reap_system_despawns_through_commands() {
    // Three entities, two at zero health; one update leaves one
    let mut world = World::new();
    world.spawn((Health { current: 0 },));
    world.spawn((Health { current: 50 },));
    world.spawn((Health { current: 0 },));

    let mut scheduler = Scheduler::new(SystemAllocator::shared(), pool(4));
    scheduler.register(
        SystemBuilder::new("reap")
            .with_query::<(&Health,)>()
            .build(|world, commands| {
                world
                    .query::<(&Health,)>()
                    .each_with_commands(commands, |entity, (health,), buffer| {
                        if health.current <= 0 {
                            buffer.despawn(entity);
                        }
                    });
            }),
    );

    scheduler.update(&mut world).unwrap();
    assert_eq!(world.entity_count(), 1);
}

#[test]
fn spawning_system_feeds_next_frame() {
    let mut world = World::new();
    world.spawn((Position { x: 0.0 },));

    let mut scheduler = Scheduler::new(SystemAllocator::shared(), pool(2));
    scheduler.register(
        SystemBuilder::new("mitosis")
            .with_query::<(&Position,)>()
            .build(|world, commands| {
                world
                    .query::<(&Position,)>()
                    .each_with_commands(commands, |_, (pos,), buffer| {
                        buffer.spawn().with(Position { x: pos.x + 1.0 });
                    });
            }),
    );

    // Doubles each frame: 1 -> 2 -> 4 -> 8
    for _ in 0..3 {
        scheduler.update(&mut world).unwrap();
    }
    assert_eq!(world.entity_count(), 8);
}

#[test]
fn events_sent_by_systems_reach_next_frame_readers() {
    #[derive(Debug, Clone, PartialEq)]
    struct Collision(u32);

    let mut world = World::new();
    world.spawn((Position { x: 0.0 },));
    let mut reader = world.event_reader::<Collision>();

    let mut scheduler = Scheduler::new(SystemAllocator::shared(), pool(2));
    scheduler.register(SystemBuilder::new("collide").build(|_, commands| {
        // Event sends are a world mutation, so they go through the
        // command buffer and land at flush, before the swap
        commands.current().custom(|world| {
            world.send_event(Collision(17));
        });
    }));

    scheduler.update(&mut world).unwrap();
    let seen: Vec<_> = reader.read(world.events()).cloned().collect();
    assert_eq!(seen, vec![Collision(17)]);

    // Gone after two more frames (retention window)
    scheduler.update(&mut world).unwrap();
    scheduler.update(&mut world).unwrap();
    assert_eq!(reader.read(world.events()).count(), 0);
}

#[test]
fn tick_advances_once_per_update() {
    let mut world = World::new();
    let mut scheduler = Scheduler::new(SystemAllocator::shared(), pool(2));
    scheduler.register(SystemBuilder::new("noop").build(|_, _| {}));

    let start = world.tick();
    for _ in 0..5 {
        scheduler.update(&mut world).unwrap();
    }
    assert_eq!(world.tick(), start + 5);
}

#[test]
fn resource_writer_and_reader_serialise() {
    struct Score(u32);

    let mut world = World::new();
    world.insert_resource(Score(0));
    world.spawn((Position { x: 0.0 },));

    let mut scheduler = Scheduler::new(SystemAllocator::shared(), pool(4));

    scheduler.register(
        SystemBuilder::new("bump_score")
            .writes_resource::<Score>()
            .build(|world, _| {
                world.resource_mut::<Score>().unwrap().0 += 1;
            }),
    );

    let observed = Arc::new(AtomicUsize::new(0));
    {
        let observed = observed.clone();
        scheduler.register(
            SystemBuilder::new("read_score")
                .reads_resource::<Score>()
                .build(move |world, _| {
                    observed.store(
                        world.resource::<Score>().unwrap().0 as usize,
                        Ordering::SeqCst,
                    );
                }),
        );
    }

    scheduler.update(&mut world).unwrap();
    // Reader registered after the writer, so it sees the bumped value
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}
