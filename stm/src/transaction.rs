// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The commit protocol.
//!
//! Every attempt runs against a fresh [`Journal`]. The outcome is then validated
//! and, unless the attempt died, the writes of a read-write journal are published
//! inside one global critical section. A retrying transaction registers a todo on every [`crate::TRef`] it
//! read in the same critical section, so a commit changing any of them cannot
//! slip in between validation and registration.
//!
//! A transaction is in one of four states:
//!
//! ```text
//! RUNNING --retry--> SUSPENDED --todo--> RUNNING
//!    |                   |
//!    +--done--> DONE     +--interrupt--> INTERRUPTED
//!    +--interrupt--> INTERRUPTED
//! ```

use crate::{
    driver::{Driver, TExit},
    errors::{Cause, Defect, Exit},
    journal::{Journal, JournalAnalysis},
    primitive::{unbox, Program},
    runtime::{Fiber, FiberId},
    stm::Stm,
    tref::{Todo, TodoRegistry},
    version::TxnId,
};
use lazy_static::lazy_static;
use log::*;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

lazy_static! {
    /// Guards validation, publication and todo registration of all transactions
    static ref COMMIT_LOCK: Mutex<()> = Mutex::new(());
}

fn commit_lock() -> MutexGuard<'static, ()> {
    COMMIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

const RUNNING: u8 = 0;
const SUSPENDED: u8 = 1;
const DONE: u8 = 2;
const INTERRUPTED: u8 = 3;

type OnDone<A, E> = Box<dyn FnOnce(Exit<A, E>) + Send>;
type OnInterrupt = Box<dyn FnOnce(FiberId) + Send>;

/// Todos registered by a suspended transaction
struct Suspension {
    txn_id: TxnId,
    watched: Vec<Arc<dyn TodoRegistry>>,
}

struct PendingTxn<A, E> {
    id: TxnId,
    fiber: Fiber,
    program: Program,
    state: AtomicU8,
    interrupted_by: Mutex<Option<FiberId>>,
    callbacks: Mutex<Option<(OnDone<A, E>, OnInterrupt)>>,
    suspension: Mutex<Option<Suspension>>,
}

impl<A, E> PendingTxn<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    fn new(fiber: Fiber, program: Program, on_done: OnDone<A, E>, on_interrupt: OnInterrupt) -> Self {
        Self {
            id: TxnId::fresh(),
            fiber,
            program,
            state: AtomicU8::new(RUNNING),
            interrupted_by: Mutex::new(None),
            callbacks: Mutex::new(Some((on_done, on_interrupt))),
            suspension: Mutex::new(None),
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Runs attempts until the transaction completes, suspends or is interrupted
    fn attempt(self: &Arc<Self>) {
        loop {
            if self.state.load(Ordering::Acquire) != RUNNING {
                self.finish_interrupted();
                return;
            }

            let mut journal = Journal::default();
            let exit = Driver::new(&mut journal, self.fiber.id(), self.fiber.context().clone()).run(self.program.clone());

            if journal.is_empty() && !self.is_watching() {
                // nothing to validate and nothing to publish
                self.resolve_without_journal(exit);
                return;
            }

            let guard = commit_lock();
            let analysis = journal.analyze();

            if analysis == JournalAnalysis::Invalid {
                drop(guard);
                debug!("TX({}): journal of {} refs is stale, running again", self.id, journal.len());
                continue;
            }

            self.unwatch();

            if exit.is_retry() {
                let txn = self.clone();
                let txn_id = TxnId::fresh();
                let todo: Todo = Arc::new(move || txn.resume(txn_id));
                let watched = journal.add_todo(txn_id, &todo);
                let count = watched.len();
                *self.suspension.lock().unwrap_or_else(PoisonError::into_inner) = Some(Suspension { txn_id, watched });

                if self.transition(RUNNING, SUSPENDED) {
                    trace!("TX({}): suspended, waiting on {} refs", self.id, count);
                } else {
                    self.unwatch();
                    drop(guard);
                    self.finish_interrupted();
                }
                return;
            }

            if !self.transition(RUNNING, DONE) {
                drop(guard);
                self.finish_interrupted();
                return;
            }

            // a defect aborts the transaction, every other outcome publishes its writes
            let publish = analysis == JournalAnalysis::ReadWrite && !exit.is_die();
            let todos = match publish {
                true => {
                    journal.commit();
                    journal.collect_todos()
                }
                false => BTreeMap::new(),
            };
            drop(guard);

            if publish {
                info!(
                    "TX({}): committed {} refs, waking {} transactions",
                    self.id,
                    journal.len(),
                    todos.len()
                );
            }
            self.wake(todos);
            self.finish(exit);
            return;
        }
    }

    fn resolve_without_journal(self: &Arc<Self>, exit: TExit) {
        if exit.is_retry() {
            // no ref to wait on, only an interruption ends this transaction
            if self.transition(RUNNING, SUSPENDED) {
                trace!("TX({}): retried without reading a ref, suspended", self.id);
            } else {
                self.finish_interrupted();
            }
            return;
        }

        match self.transition(RUNNING, DONE) {
            true => self.finish(exit),
            false => self.finish_interrupted(),
        }
    }

    fn is_watching(&self) -> bool {
        self.suspension
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Removes the todos of the last suspension. Must be called with the commit lock held.
    fn unwatch(&self) {
        let suspension = self.suspension.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Suspension { txn_id, watched }) = suspension {
            watched.iter().for_each(|registry| registry.remove_todo(txn_id));
        }
    }

    fn wake(&self, todos: BTreeMap<TxnId, Todo>) {
        if todos.is_empty() {
            return;
        }

        self.fiber.schedule(Box::new(move || {
            for (txn_id, todo) in todos {
                trace!("waking {}", txn_id);
                todo();
            }
        }));
    }

    /// Runs the transaction again, if `txn_id` names its current suspension
    fn resume(self: &Arc<Self>, txn_id: TxnId) {
        let resumed = {
            let suspension = self.suspension.lock().unwrap_or_else(PoisonError::into_inner);
            match &*suspension {
                Some(current) if current.txn_id == txn_id => self.transition(SUSPENDED, RUNNING),
                _ => false,
            }
        };

        match resumed {
            true => {
                trace!("TX({}): resumed by {}", self.id, txn_id);
                self.attempt();
            }
            false => trace!("TX({}): ignoring stale wake-up of {}", self.id, txn_id),
        }
    }

    fn interrupt(&self, by: FiberId) -> bool {
        let mut interrupted_by = self.interrupted_by.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            match self.state.load(Ordering::Acquire) {
                SUSPENDED => {
                    if !self.transition(SUSPENDED, INTERRUPTED) {
                        continue;
                    }
                    *interrupted_by = Some(by);
                    drop(interrupted_by);

                    trace!("TX({}): interrupted by {} while suspended", self.id, by);
                    {
                        let _guard = commit_lock();
                        self.unwatch();
                    }
                    self.finish_interrupted();
                    return true;
                }
                RUNNING => {
                    if !self.transition(RUNNING, INTERRUPTED) {
                        continue;
                    }
                    // the running attempt notices at its next decision point
                    *interrupted_by = Some(by);
                    trace!("TX({}): interrupted by {} while running", self.id, by);
                    return true;
                }
                _ => return false,
            }
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), RUNNING | SUSPENDED)
    }

    fn take_callbacks(&self) -> Option<(OnDone<A, E>, OnInterrupt)> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn finish(&self, exit: TExit) {
        if let Some((on_done, _)) = self.take_callbacks() {
            on_done(into_exit(exit));
        }
    }

    fn finish_interrupted(&self) {
        let by = self
            .interrupted_by
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or_else(|| self.fiber.id());

        if let Some((_, on_interrupt)) = self.take_callbacks() {
            on_interrupt(by);
        }
    }
}

fn into_exit<A, E>(exit: TExit) -> Exit<A, E>
where
    A: 'static,
    E: 'static,
{
    match exit {
        TExit::Succeed(value) => unbox::<A>(value).map_err(Cause::Die),
        TExit::Fail(error) => match unbox::<E>(error) {
            Ok(error) => Err(Cause::Fail(error)),
            Err(defect) => Err(Cause::Die(defect)),
        },
        TExit::Die(defect) => Err(Cause::Die(defect)),
        TExit::Interrupt(fiber_id) => Err(Cause::Interrupt(fiber_id)),
        TExit::Retry => Err(Cause::Die(Defect::new("retry escaped the commit protocol"))),
    }
}

trait Interruptible: Send + Sync {
    fn interrupt(&self, by: FiberId) -> bool;

    fn is_pending(&self) -> bool;
}

impl<A, E> Interruptible for PendingTxn<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    fn interrupt(&self, by: FiberId) -> bool {
        PendingTxn::interrupt(self, by)
    }

    fn is_pending(&self) -> bool {
        PendingTxn::is_pending(self)
    }
}

/// Handle to a transaction started with [`Fiber::atomically`]. Dropping the
/// handle does not interrupt the transaction.
#[derive(Clone)]
pub struct TxnHandle {
    txn: Arc<dyn Interruptible>,
    fiber_id: FiberId,
}

impl TxnHandle {
    /// Interrupts the transaction on behalf of the fiber that started it.
    /// Returns `false` if the transaction has already completed or been interrupted.
    pub fn interrupt(&self) -> bool {
        self.txn.interrupt(self.fiber_id)
    }

    pub fn interrupt_as(&self, fiber_id: FiberId) -> bool {
        self.txn.interrupt(fiber_id)
    }

    /// `true`, if the transaction is running or suspended
    pub fn is_pending(&self) -> bool {
        self.txn.is_pending()
    }
}

impl Fiber {
    /// Runs `stm` to completion. The first attempt runs on the calling thread;
    /// if the transaction does not suspend, `on_done` has been invoked when
    /// this function returns. Otherwise `on_done` is invoked on the scheduler of
    /// the fiber whose commit woke the transaction. `on_interrupt` is invoked
    /// instead, if the transaction gets interrupted before it completes.
    pub fn atomically<A, E, D, I>(&self, stm: Stm<A, E>, on_done: D, on_interrupt: I) -> TxnHandle
    where
        A: Send + 'static,
        E: Send + 'static,
        D: FnOnce(Exit<A, E>) + Send + 'static,
        I: FnOnce(FiberId) + Send + 'static,
    {
        let txn = Arc::new(PendingTxn::new(
            self.clone(),
            stm.program,
            Box::new(on_done),
            Box::new(on_interrupt),
        ));
        txn.attempt();

        TxnHandle {
            txn,
            fiber_id: self.id(),
        }
    }
}

#[cfg(feature = "async")]
pub use self::future::Commit;

#[cfg(feature = "async")]
mod future {
    use super::*;
    use futures::channel::oneshot;
    use std::{
        future::Future,
        pin::Pin,
        task::{Context, Poll},
    };

    /// A transaction in flight. Resolves once the transaction completes;
    /// dropping the future interrupts the transaction.
    pub struct Commit<A, E> {
        receiver: oneshot::Receiver<Exit<A, E>>,
        handle: TxnHandle,
    }

    impl<A, E> Commit<A, E> {
        /// Interrupts the transaction, the future resolves with [`Cause::Interrupt`]
        pub fn interrupt(&self) -> bool {
            self.handle.interrupt()
        }
    }

    impl<A, E> Future for Commit<A, E> {
        type Output = Exit<A, E>;

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            match Pin::new(&mut self.receiver).poll(cx) {
                Poll::Ready(Ok(exit)) => Poll::Ready(exit),
                Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Cause::Interrupt(self.handle.fiber_id))),
                Poll::Pending => Poll::Pending,
            }
        }
    }

    impl<A, E> Drop for Commit<A, E> {
        fn drop(&mut self) {
            self.handle.interrupt();
        }
    }

    impl Fiber {
        /// Lifts `stm` into a future of its outcome
        pub fn commit<A, E>(&self, stm: Stm<A, E>) -> Commit<A, E>
        where
            A: Send + 'static,
            E: Send + 'static,
        {
            let (sender, receiver) = oneshot::channel();
            let sender = Arc::new(Mutex::new(Some(sender)));
            let on_interrupt = sender.clone();

            let handle = self.atomically(
                stm,
                move |exit| {
                    if let Some(sender) = sender.lock().unwrap_or_else(PoisonError::into_inner).take() {
                        let _ = sender.send(exit);
                    }
                },
                move |fiber_id| {
                    if let Some(sender) = on_interrupt.lock().unwrap_or_else(PoisonError::into_inner).take() {
                        let _ = sender.send(Err(Cause::Interrupt(fiber_id)));
                    }
                },
            );

            Commit { receiver, handle }
        }

        /// Blocks the current thread until `stm` completes. A transaction that
        /// suspends is only woken if the scheduler of the committing fiber runs
        /// tasks on other threads.
        pub fn commit_blocking<A, E>(&self, stm: Stm<A, E>) -> Exit<A, E>
        where
            A: Send + 'static,
            E: Send + 'static,
        {
            futures::executor::block_on(self.commit(stm))
        }
    }

    impl<A, E> Stm<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        /// Commits this program on `fiber`, see [`Fiber::commit`]
        pub fn commit(self, fiber: &Fiber) -> Commit<A, E> {
            fiber.commit(self)
        }
    }
}
