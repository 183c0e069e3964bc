#![cfg(target_os = "linux")]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use common::substrate;
use vmsubstrate_core::thread::{PosixThreads, ThreadBackend};
use vmsubstrate_core::{Condition, OsMutex, SleepOutcome};

#[derive(Default)]
struct Gate {
    mutex: OsMutex,
    condition: Condition,
    generation: AtomicUsize,
    woken: AtomicUsize,
    tickets: AtomicUsize,
    wakeups: AtomicUsize,
}

fn wait_until(deadline: Duration, done: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while !done() {
        if started.elapsed() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn timed_wait_elapses_and_reports_success() {
    let gate = Gate::default();
    let mut guard = gate.mutex.lock();
    let started = Instant::now();
    assert!(gate.condition.timed_wait(&mut guard, 30));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(25));
    assert!(waited <= Duration::from_millis(530), "waited {waited:?}");
}

#[test]
fn notify_one_wakes_a_waiter() {
    let gate = Arc::new(Gate::default());
    let (ready_tx, ready_rx) = mpsc::channel();
    let waiter = {
        let gate = Arc::clone(&gate);
        std::thread::spawn(move || {
            let mut guard = gate.mutex.lock();
            ready_tx.send(()).unwrap();
            while gate.generation.load(Ordering::Acquire) == 0 {
                assert!(gate.condition.timed_wait(&mut guard, 2_000));
            }
            gate.woken.fetch_add(1, Ordering::AcqRel);
        })
    };
    ready_rx.recv().unwrap();
    {
        let _guard = gate.mutex.lock();
        gate.generation.store(1, Ordering::Release);
        assert!(gate.condition.notify_one());
    }
    waiter.join().unwrap();
    assert_eq!(gate.woken.load(Ordering::Acquire), 1);
}

#[test]
fn notify_one_wakes_exactly_one_of_several_waiters() {
    const WAITERS: usize = 3;
    let gate = Arc::new(Gate::default());
    let (ready_tx, ready_rx) = mpsc::channel();
    let waiters: Vec<_> = (0..WAITERS)
        .map(|_| {
            let gate = Arc::clone(&gate);
            let ready_tx = ready_tx.clone();
            std::thread::spawn(move || {
                let mut guard = gate.mutex.lock();
                ready_tx.send(()).unwrap();
                while gate.tickets.load(Ordering::Acquire) == 0 {
                    gate.condition.timed_wait(&mut guard, 0);
                    gate.wakeups.fetch_add(1, Ordering::AcqRel);
                }
                gate.tickets.fetch_sub(1, Ordering::AcqRel);
                gate.woken.fetch_add(1, Ordering::AcqRel);
            })
        })
        .collect();
    for _ in 0..WAITERS {
        ready_rx.recv().unwrap();
    }
    // Each waiter holds the mutex until it blocks, so taking it here means
    // all of them are waiting.
    {
        let _guard = gate.mutex.lock();
        gate.tickets.store(1, Ordering::Release);
        assert!(gate.condition.notify_one());
    }
    assert!(wait_until(Duration::from_secs(5), || gate.woken.load(Ordering::Acquire) == 1));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(gate.woken.load(Ordering::Acquire), 1);
    assert_eq!(gate.wakeups.load(Ordering::Acquire), 1);

    {
        let _guard = gate.mutex.lock();
        gate.tickets.store(WAITERS - 1, Ordering::Release);
        assert!(gate.condition.notify_all());
    }
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(gate.woken.load(Ordering::Acquire), WAITERS);
}

#[test]
fn notify_all_wakes_every_waiter() {
    const WAITERS: usize = 4;
    let gate = Arc::new(Gate::default());
    let (ready_tx, ready_rx) = mpsc::channel();
    let waiters: Vec<_> = (0..WAITERS)
        .map(|_| {
            let gate = Arc::clone(&gate);
            let ready_tx = ready_tx.clone();
            std::thread::spawn(move || {
                let mut guard = gate.mutex.lock();
                ready_tx.send(()).unwrap();
                while gate.generation.load(Ordering::Acquire) == 0 {
                    // Untimed: only a broadcast gets us out.
                    gate.condition.timed_wait(&mut guard, 0);
                }
                gate.woken.fetch_add(1, Ordering::AcqRel);
            })
        })
        .collect();
    for _ in 0..WAITERS {
        ready_rx.recv().unwrap();
    }
    {
        let _guard = gate.mutex.lock();
        gate.generation.store(1, Ordering::Release);
        assert!(gate.condition.notify_all());
    }
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(gate.woken.load(Ordering::Acquire), WAITERS);
}

#[test]
fn notify_without_waiters_succeeds() {
    let condition = Condition::new();
    assert!(condition.notify_one());
    assert!(condition.notify_all());
}

#[test]
fn interrupt_cuts_a_sleep_short() {
    let substrate = substrate();
    let (tx, rx) = mpsc::channel();
    let done = Arc::new(AtomicBool::new(false));
    let sleeper = {
        let substrate = Arc::clone(&substrate);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            tx.send(PosixThreads.current()).unwrap();
            let started = Instant::now();
            while substrate.sleep(5_000) != SleepOutcome::Interrupted {}
            done.store(true, Ordering::Release);
            started.elapsed()
        })
    };
    let target = rx.recv().unwrap();
    // The signal may land before the sleep starts; keep sending until it sticks.
    while !done.load(Ordering::Acquire) {
        substrate.interrupt(target);
        std::thread::sleep(Duration::from_millis(20));
    }
    let slept = sleeper.join().unwrap();
    assert!(slept < Duration::from_secs(5));
}

#[test]
fn collector_waits_on_the_registry_lock() {
    let substrate = substrate();
    let condition = Arc::new(Condition::new());
    let released = Arc::new(AtomicBool::new(false));

    let mutator = {
        let substrate = Arc::clone(&substrate);
        let condition = Arc::clone(&condition);
        let released = Arc::clone(&released);
        std::thread::spawn(move || {
            let _guard = substrate.registry().enter();
            released.store(true, Ordering::Release);
            condition.notify_all();
        })
    };

    let mut registry = substrate.registry().enter_for_collection();
    while !released.load(Ordering::Acquire) {
        condition.timed_wait(registry.os_guard(), 50);
    }
    assert!(registry.is_empty());
    drop(registry);
    mutator.join().unwrap();
}
