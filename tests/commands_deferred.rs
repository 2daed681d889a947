use lattice_ecs::{Commands, SystemAllocator, World};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pos {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vel {
    x: f32,
    y: f32,
    z: f32,
}

#[test]
fn deferred_spawn_is_invisible_until_flush() {
    let mut world = World::new();
    let commands = Commands::new(SystemAllocator::shared(), 1);

    let token = {
        let mut buffer = commands.buffer(0);
        buffer
            .spawn()
            .with(Pos {
                x: 1.0,
                y: 2.0,
                z: 3.0,
            })
            .with(Vel {
                x: 0.1,
                y: 0.2,
                z: 0.3,
            })
            .token()
    };

    assert_eq!(world.entity_count(), 0);

    commands.flush_all(&mut world);

    assert_eq!(world.entity_count(), 1);
    let entity = commands.buffer(0).spawned_entity(token).unwrap();
    assert!(world.is_alive(entity));
    assert_eq!(world.get_component::<Pos>(entity).unwrap().x, 1.0);
    assert_eq!(world.get_component::<Vel>(entity).unwrap().z, 0.3);
}

#[test]
fn per_worker_buffers_flush_in_worker_order() {
    let mut world = World::new();
    let commands = Commands::new(SystemAllocator::shared(), 4);
    let entity = world.spawn((0u32,));

    // Recording order is 3, 1, 0; application order is 0, 1, 3
    commands.buffer(3).set(entity, 333u32);
    commands.buffer(1).set(entity, 111u32);
    commands.buffer(0).set(entity, 0u32);

    commands.flush_all(&mut world);
    assert_eq!(world.get_component::<u32>(entity), Some(&333));
}

#[test]
fn mixed_edit_batch_applies_in_insertion_order() {
    let mut world = World::new();
    let commands = Commands::new(SystemAllocator::shared(), 1);

    let a = world.spawn((1u32, 1.0f32));
    let b = world.spawn((2u32,));

    {
        let mut buffer = commands.buffer(0);
        buffer.remove::<f32>(a);
        buffer.add(b, 9.0f32);
        buffer.despawn(a);
        let token = buffer.spawn().with(7u32).token();
        buffer.add(token.pending_entity(), 7.5f32);
    }

    commands.flush_all(&mut world);

    assert!(!world.is_alive(a));
    assert_eq!(world.get_component::<f32>(b), Some(&9.0));
    assert_eq!(world.entity_count(), 2);
}

#[test]
fn despawn_of_pending_spawn_within_same_batch() {
    let mut world = World::new();
    let commands = Commands::new(SystemAllocator::shared(), 1);

    {
        let mut buffer = commands.buffer(0);
        let token = buffer.spawn().with(1u32).token();
        buffer.despawn(token.pending_entity());
    }

    commands.flush_all(&mut world);
    assert_eq!(world.entity_count(), 0);
}

#[test]
fn buffers_are_reusable_across_frames() {
    let mut world = World::new();
    let commands = Commands::new(SystemAllocator::shared(), 2);

    for frame in 0..10u32 {
        commands.buffer(0).spawn().with(frame);
        commands.flush_all(&mut world);
    }
    assert_eq!(world.entity_count(), 10);
}
