use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use lattice_ecs::deque::WorkStealingDeque;
use lattice_ecs::mpmc::MpmcQueue;
use lattice_ecs::{IdleStrategy, SystemAllocator, ThreadPool, ThreadPoolConfig};

#[test]
fn last_element_race_has_exactly_one_winner() {
    // [42] in the deque; owner pop races one stealer; exactly one
    // side gets the element
    for _ in 0..500 {
        let deque = WorkStealingDeque::new(SystemAllocator::shared(), 8);
        let stealer = deque.stealer();
        deque.push(42);

        let barrier = Arc::new(Barrier::new(2));
        let thief_barrier = barrier.clone();
        let thief = std::thread::spawn(move || {
            thief_barrier.wait();
            stealer.steal()
        });

        barrier.wait();
        let popped = deque.pop();
        let stolen = thief.join().unwrap();

        assert!(
            matches!((popped, stolen), (Some(42), None) | (None, Some(42))),
            "popped={popped:?} stolen={stolen:?}"
        );
    }
}

#[test]
fn mpmc_capacity_is_power_of_two_at_least_requested() {
    for (requested, expected) in [(1, 1), (2, 2), (3, 4), (9, 16), (1000, 1024)] {
        assert_eq!(MpmcQueue::<u8>::new(requested).capacity(), expected);
    }
}

#[test]
fn mpmc_full_push_fails_until_pop() {
    let queue = MpmcQueue::new(2);
    queue.push(1).unwrap();
    queue.push(2).unwrap();
    assert!(queue.push(3).is_err());

    assert_eq!(queue.pop(), Some(1));
    queue.push(3).unwrap();
    assert_eq!(queue.pop(), Some(2));
    assert_eq!(queue.pop(), Some(3));
}

#[test]
fn pool_runs_fan_out_across_idle_strategies() {
    for strategy in [IdleStrategy::Spin, IdleStrategy::Yield, IdleStrategy::Park] {
        let mut pool = ThreadPool::new(
            SystemAllocator::shared(),
            ThreadPoolConfig {
                worker_count: 4,
                idle_strategy: strategy,
                deque_capacity: 64,
            },
        );

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5000 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 5000, "strategy {strategy:?}");
        pool.stop();
    }
}

#[test]
fn recursive_fork_join_saturates_workers() {
    let mut pool = ThreadPool::new(
        SystemAllocator::shared(),
        ThreadPoolConfig {
            worker_count: 4,
            ..Default::default()
        },
    );
    let pool_addr = &pool as *const ThreadPool as usize;

    // Each root forks children from inside the pool (worker-local
    // pushes), which other workers then steal
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let done = done.clone();
        pool.submit(move || {
            let pool = unsafe { &*(pool_addr as *const ThreadPool) };
            for _ in 0..64 {
                let done = done.clone();
                pool.submit(move || {
                    done.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
    }

    pool.wait_all();
    assert_eq!(done.load(Ordering::Relaxed), 8 * 64);
    pool.stop();
}

#[test]
fn wait_all_observes_every_published_task() {
    let mut pool = ThreadPool::new(
        SystemAllocator::shared(),
        ThreadPoolConfig {
            worker_count: 2,
            ..Default::default()
        },
    );

    for round in 0..50 {
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 100, "round {round}");
    }
    pool.stop();
}
