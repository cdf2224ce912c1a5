// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! [`Scheduler`] implementations.

use crate::runtime::{Priority, Scheduler, Task};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, PoisonError},
};

/// A deterministic scheduler. Tasks are queued until the owner drains them
/// with [`QueueScheduler::run_pending`] or [`QueueScheduler::run_next`]. Tasks
/// with a lower priority value run first, tasks of equal priority in FIFO order.
#[derive(Default)]
pub struct QueueScheduler {
    queue: Mutex<BTreeMap<Priority, VecDeque<Task>>>,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to be run
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// Runs the next task, if any. Returns `true` if a task has been run.
    pub fn run_next(&self) -> bool {
        // the queue lock must be released before running the task, as tasks
        // may schedule further tasks
        let task = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let next = queue.iter_mut().find_map(|(_, tasks)| tasks.pop_front());
            queue.retain(|_, tasks| !tasks.is_empty());
            next
        };

        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until the queue is empty, including tasks scheduled while
    /// draining. Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while self.run_next() {
            count += 1;
        }
        count
    }
}

impl Scheduler for QueueScheduler {
    fn schedule_task(&self, task: Task, priority: Priority) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(priority)
            .or_default()
            .push_back(task);
    }
}

#[cfg(feature = "threaded")]
pub use pool::ThreadPoolScheduler;

#[cfg(feature = "threaded")]
mod pool {
    use super::*;
    use threadpool::ThreadPool;

    /// Runs tasks on a fixed size pool of worker threads. Priorities are ignored.
    pub struct ThreadPoolScheduler {
        pool: Mutex<ThreadPool>,
    }

    impl ThreadPoolScheduler {
        pub fn new(workers: usize) -> Self {
            Self {
                pool: Mutex::new(ThreadPool::new(workers)),
            }
        }

        /// Blocks until all queued and running tasks have finished
        pub fn join(&self) {
            // clone the handle, joining while holding the lock would keep
            // running tasks from scheduling new ones
            let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner).clone();
            pool.join();
        }
    }

    impl Scheduler for ThreadPoolScheduler {
        fn schedule_task(&self, task: Task, _priority: Priority) {
            self.pool.lock().unwrap_or_else(PoisonError::into_inner).execute(task);
        }
    }
}

#[cfg(feature = "tokio")]
pub use tokio_rt::TokioScheduler;

#[cfg(feature = "tokio")]
mod tokio_rt {
    use super::*;
    use tokio::runtime::Handle;

    /// Spawns tasks onto a tokio runtime. Priorities are ignored.
    pub struct TokioScheduler {
        handle: Handle,
    }

    impl TokioScheduler {
        pub fn new(handle: Handle) -> Self {
            Self { handle }
        }

        /// Uses the runtime of the current context.
        ///
        /// # Panics
        /// Panics when called outside of a tokio runtime.
        pub fn current() -> Self {
            Self::new(Handle::current())
        }
    }

    impl Scheduler for TokioScheduler {
        fn schedule_task(&self, task: Task, _priority: Priority) {
            self.handle.spawn(async move { task() });
        }
    }
}
