// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The boundary to the surrounding fiber runtime. The engine needs three things
//! from it: the identity of the committing fiber, a way to enqueue work without
//! blocking ([`Scheduler`]), and the ambient [`Context`].

use crate::{context::Context, version::VersionClock};
use std::{fmt, sync::Arc};

static FIBER_IDS: VersionClock = VersionClock::new(0);

/// Identifies the fiber running or interrupting a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl FiberId {
    /// Creates a new unique fiber id
    pub fn fresh() -> Self {
        FiberId(FIBER_IDS.increment())
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scheduling priority of a task. Lower values run first on schedulers that
/// order their queue.
pub type Priority = usize;

pub const DEFAULT_PRIORITY: Priority = 0;

/// A unit of deferred work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Enqueues tasks for later execution. Implementations must never run a task
/// inline in `schedule_task`: the engine relies on it to keep wake-ups off the
/// committing call stack.
pub trait Scheduler: Send + Sync {
    fn schedule_task(&self, task: Task, priority: Priority);
}

/// Runtime handle of one logical fiber. Transactions committed through a
/// [`Fiber`] are tagged with its id, see its context and have their wake-ups
/// scheduled on its scheduler.
#[derive(Clone)]
pub struct Fiber {
    id: FiberId,
    scheduler: Arc<dyn Scheduler>,
    context: Context,
    priority: Priority,
}

impl Fiber {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            id: FiberId::fresh(),
            scheduler,
            context: Context::empty(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Returns a new fiber sharing scheduler, context and priority, but with its own id
    pub fn fork(&self) -> Self {
        Self {
            id: FiberId::fresh(),
            ..self.clone()
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn schedule(&self, task: Task) {
        self.scheduler.schedule_task(task, self.priority);
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::QueueScheduler;

    #[test]
    fn test_fork_keeps_runtime() {
        let fiber = Fiber::new(Arc::new(QueueScheduler::default()))
            .with_priority(3)
            .with_context(Context::empty().add(1u32));
        let forked = fiber.fork();

        assert_ne!(fiber.id(), forked.id());
        assert_eq!(forked.priority(), 3);
        assert_eq!(forked.context().get::<u32>(), Some(&1));
        assert!(Arc::ptr_eq(fiber.scheduler(), forked.scheduler()));
    }
}
