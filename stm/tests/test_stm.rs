// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use stm::{Cause, Fiber, QueueScheduler, Stm, TRef, ThreadPoolScheduler};
use threadpool::ThreadPool;

#[allow(unused_imports)]
use log::*;

fn init_logger() {
    #[cfg(feature = "verbose")]
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Trace)
        .try_init();
}

#[test]
fn test_stm_basic() {
    init_logger();

    let fiber = Fiber::new(Arc::new(QueueScheduler::new()));

    let bank_alice = TRef::new(10usize);
    let bank_bob = TRef::new(100usize);
    let bank_charly = TRef::new(0usize);

    let transfer_bob_charly = 30;
    let alice_bonus = 40;

    let stm = bank_alice
        .update(move |amt| amt + alice_bonus)
        .zip_right(bank_bob.update(move |amt| amt - transfer_bob_charly))
        .zip_right(bank_charly.update(move |amt| amt + transfer_bob_charly));

    let result = fiber.commit_blocking(stm);
    assert!(result.is_ok(), "Transaction failed");

    assert_eq!(bank_alice.read_atomic(), 50);
    assert_eq!(bank_bob.read_atomic(), 70);
    assert_eq!(bank_charly.read_atomic(), 30);
}

#[test]
fn test_stm_threaded_one_tref() {
    init_logger();

    let scheduler = Arc::new(ThreadPoolScheduler::new(4));
    let counter = TRef::new(0usize);
    let pool = ThreadPool::new(2);

    // two fibers, 500 transactions each, every transaction increments twice
    for _ in 0..2 {
        let fiber = Fiber::new(scheduler.clone());
        let stm = counter.update(|n| n + 1).zip_right(counter.update(|n| n + 1));

        pool.execute(move || {
            for _ in 0..500 {
                assert!(fiber.commit_blocking(stm.clone()).is_ok());
            }
        });
    }

    pool.join();
    assert_eq!(pool.panic_count(), 0);
    assert_eq!(counter.read_atomic(), 2000);
}

#[test]
fn test_stm_threaded_set() {
    use rand::{distributions::Bernoulli, prelude::Distribution};

    init_logger();

    let entries: usize = 1000;

    // bernoulli distribution over insert-only vs insert-and-remove transactions
    let distribution = Bernoulli::new(0.7).unwrap();

    let mut expected: HashSet<String> = (0..entries).map(|e: usize| format!("{:04}", e)).collect();
    let mut removal = HashSet::new();

    let set: TRef<HashSet<String>> = TRef::new(HashSet::new());
    let scheduler = Arc::new(ThreadPoolScheduler::new(2));
    let pool = ThreadPool::new(8);

    for value in expected.iter() {
        let fiber = Fiber::new(scheduler.clone());
        let set = set.clone();
        let value = value.clone();
        let remove = distribution.sample(&mut rand::thread_rng());

        if remove {
            removal.insert(value.clone());
        }

        pool.execute(move || {
            let insert = value.clone();
            let stm = set.update(move |mut inner| {
                inner.insert(insert.clone());
                inner
            });
            assert!(fiber.commit_blocking(stm).is_ok());

            if remove {
                let stm = set.modify(move |mut inner| (inner.remove(&value), inner));
                assert_eq!(fiber.commit_blocking(stm), Ok(true));
            }
        });
    }

    pool.join();
    assert_eq!(pool.panic_count(), 0);

    expected.retain(|value| !removal.contains(value));
    assert_eq!(set.read_atomic(), expected);
}

#[test]
fn test_stm_threaded_consistent_reads() {
    init_logger();

    let scheduler = Arc::new(ThreadPoolScheduler::new(2));
    let a = TRef::new(0usize);
    let b = TRef::new(0usize);
    let done = Arc::new(AtomicBool::new(false));
    let pool = ThreadPool::new(4);

    for _ in 0..3 {
        let fiber = Fiber::new(scheduler.clone());
        let stm = a.get().zip(b.get());
        let done = done.clone();

        pool.execute(move || {
            while !done.load(Ordering::SeqCst) {
                let (a, b) = fiber.commit_blocking(stm.clone()).unwrap();
                assert_eq!(a, b, "observed a partial write");
            }
        });
    }

    let fiber = Fiber::new(scheduler.clone());
    for round in 1..=1000usize {
        let stm = a.set(round).zip_right(b.set(round));
        assert!(fiber.commit_blocking(stm).is_ok());
    }
    done.store(true, Ordering::SeqCst);

    pool.join();
    assert_eq!(pool.panic_count(), 0);
    assert_eq!((a.read_atomic(), b.read_atomic()), (1000, 1000));
}

#[test]
fn test_stm_retry_wakes_blocked_thread() {
    init_logger();

    let scheduler = Arc::new(ThreadPoolScheduler::new(2));
    let tref = TRef::new(0usize);
    let pool = ThreadPool::new(1);

    let fiber = Fiber::new(scheduler.clone());
    let stm = tref.get().retry_until(|n| *n >= 10);
    pool.execute(move || {
        assert_eq!(fiber.commit_blocking(stm), Ok(10));
    });

    let fiber = Fiber::new(scheduler.clone());
    for _ in 0..10 {
        assert!(fiber.commit_blocking(tref.update(|n| n + 1)).is_ok());
    }

    pool.join();
    scheduler.join();
    assert_eq!(pool.panic_count(), 0);
}

#[test]
fn test_stm_panic_is_defect() {
    init_logger();

    let fiber = Fiber::new(Arc::new(QueueScheduler::new()));
    let tref = TRef::new(1usize);

    // the defect is neither caught as a failure nor does it publish the write
    let stm = tref
        .set(2)
        .widen_err::<()>()
        .zip_right(Stm::<usize, String>::sync(|| panic!("x")).catch_all(|_| Stm::<usize, ()>::succeed(0)));

    match fiber.commit_blocking(stm) {
        Err(Cause::Die(defect)) => assert_eq!(defect.message(), "x"),
        other => panic!("expected a defect, got {:?}", other),
    }
    assert_eq!(tref.read_atomic(), 1);
}
