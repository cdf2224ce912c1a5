// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Interprets one attempt of a transaction.
//!
//! The [`Driver`] walks the program tree with an explicit stack of frames instead
//! of host recursion, so arbitrarily long chains of continuations run in constant
//! native stack space. User code is never allowed to unwind through the driver:
//! a panic in a thunk, continuation or context transform becomes a defect.

use crate::{
    context::Context,
    errors::Defect,
    journal::Journal,
    primitive::{Continuation, Primitive, Program, RetryContinuation, Value},
    runtime::FiberId,
};
use log::*;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Number of interpreted nodes between two lockless journal validations
const VALIDATION_INTERVAL: usize = 2048;

/// The outcome of one attempt
pub(crate) enum TExit {
    Succeed(Value),
    Fail(Value),
    Die(Defect),
    Interrupt(FiberId),
    Retry,
}

impl TExit {
    pub(crate) fn is_retry(&self) -> bool {
        matches!(self, TExit::Retry)
    }

    pub(crate) fn is_die(&self) -> bool {
        matches!(self, TExit::Die(_))
    }
}

enum Frame {
    OnSuccess(Continuation),
    OnFailure(Continuation),
    OnRetry(RetryContinuation),
    RestoreContext(Context),
}

enum Step {
    Continue(Program),
    Done(TExit),
}

/// Runs `f`, converting a panic into a defect
fn protect<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
    catch_unwind(AssertUnwindSafe(f)).map_err(Defect::from_panic)
}

fn guarded(f: impl FnOnce() -> Program) -> Step {
    match protect(f) {
        Ok(program) => Step::Continue(program),
        Err(defect) => Step::Done(TExit::Die(defect)),
    }
}

pub(crate) struct Driver<'j> {
    journal: &'j mut Journal,
    fiber_id: FiberId,
    context: Context,
    stack: Vec<Frame>,
    ops: usize,
}

impl<'j> Driver<'j> {
    pub(crate) fn new(journal: &'j mut Journal, fiber_id: FiberId, context: Context) -> Self {
        Self {
            journal,
            fiber_id,
            context,
            stack: Vec::new(),
            ops: 0,
        }
    }

    pub(crate) fn journal(&mut self) -> &mut Journal {
        self.journal
    }

    pub(crate) fn fiber_id(&self) -> FiberId {
        self.fiber_id
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    /// Interprets `program` until it produces an outcome
    pub(crate) fn run(mut self, program: Program) -> TExit {
        let mut current = program;

        loop {
            self.ops += 1;
            if self.ops % VALIDATION_INTERVAL == 0 && !self.journal.is_valid() {
                debug!(
                    "fiber {}: journal went stale after {} steps, abandoning attempt",
                    self.fiber_id, self.ops
                );
                return TExit::Retry;
            }

            let step = match &*current {
                Primitive::Succeed(lazy) => match protect(|| lazy.force()) {
                    Ok(Ok(value)) => self.succeed(value),
                    Ok(Err(defect)) | Err(defect) => Step::Done(TExit::Die(defect)),
                },
                Primitive::Sync(thunk) => match protect(|| thunk()) {
                    Ok(value) => self.succeed(value),
                    Err(defect) => Step::Done(TExit::Die(defect)),
                },
                Primitive::Fail(lazy) => match protect(|| lazy.force()) {
                    Ok(Ok(error)) => self.fail(error),
                    Ok(Err(defect)) | Err(defect) => Step::Done(TExit::Die(defect)),
                },
                Primitive::Die(defect) => match protect(|| defect()) {
                    Ok(defect) | Err(defect) => Step::Done(TExit::Die(defect)),
                },
                Primitive::Retry => self.retry(),
                Primitive::Interrupt(fiber_id) => Step::Done(TExit::Interrupt(*fiber_id)),
                Primitive::WithRuntime(f) => {
                    let f = f.clone();
                    guarded(|| f(&mut self))
                }
                Primitive::Provide(inner, f) => match protect(|| f(&self.context)) {
                    Ok(context) => {
                        let previous = std::mem::replace(&mut self.context, context);
                        self.stack.push(Frame::RestoreContext(previous));
                        Step::Continue(inner.clone())
                    }
                    Err(defect) => Step::Done(TExit::Die(defect)),
                },
                Primitive::OnSuccess(inner, k) => {
                    self.stack.push(Frame::OnSuccess(k.clone()));
                    Step::Continue(inner.clone())
                }
                Primitive::OnFailure(inner, k) => {
                    self.stack.push(Frame::OnFailure(k.clone()));
                    Step::Continue(inner.clone())
                }
                Primitive::OnRetry(inner, k) => {
                    self.stack.push(Frame::OnRetry(k.clone()));
                    Step::Continue(inner.clone())
                }
            };

            match step {
                Step::Continue(program) => current = program,
                Step::Done(exit) => return exit,
            }
        }
    }

    fn succeed(&mut self, value: Value) -> Step {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::OnSuccess(k) => return guarded(move || k(value)),
                Frame::RestoreContext(context) => self.context = context,
                Frame::OnFailure(_) | Frame::OnRetry(_) => {}
            }
        }
        Step::Done(TExit::Succeed(value))
    }

    fn fail(&mut self, error: Value) -> Step {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::OnFailure(k) => return guarded(move || k(error)),
                Frame::RestoreContext(context) => self.context = context,
                Frame::OnSuccess(_) | Frame::OnRetry(_) => {}
            }
        }
        Step::Done(TExit::Fail(error))
    }

    fn retry(&mut self) -> Step {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::OnRetry(k) => return guarded(move || k()),
                Frame::RestoreContext(context) => self.context = context,
                Frame::OnSuccess(_) | Frame::OnFailure(_) => {}
            }
        }
        Step::Done(TExit::Retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{primitive::unbox, stm::Stm, tref::TRef};
    use std::convert::Infallible;

    fn run<A, E>(stm: Stm<A, E>) -> TExit {
        let mut journal = Journal::default();
        Driver::new(&mut journal, FiberId::fresh(), Context::empty()).run(stm.program)
    }

    fn succeeded<A: 'static>(exit: TExit) -> A {
        match exit {
            TExit::Succeed(value) => unbox(value).unwrap(),
            _ => panic!("attempt did not succeed"),
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Multiplier(usize);

    #[test]
    fn test_handlers_only_see_their_signal() {
        let stm = Stm::<usize, String>::fail("bad".to_string())
            .or_try(Stm::succeed(1))
            .map(|v| v + 1)
            .catch_all(|e: String| Stm::<usize, String>::succeed(e.len()));
        assert_eq!(succeeded::<usize>(run(stm)), 3);

        let stm = Stm::<usize, String>::retry()
            .catch_all(|_| Stm::<usize, String>::succeed(0))
            .or_try(Stm::succeed(7));
        assert_eq!(succeeded::<usize>(run(stm)), 7);
    }

    #[test]
    fn test_defects_bypass_handlers() {
        let stm = Stm::<usize, String>::die_message("broken")
            .catch_all(|_| Stm::<usize, String>::succeed(0))
            .or_try(Stm::succeed(1))
            .or_else(Stm::succeed(2));

        match run(stm) {
            TExit::Die(defect) => assert_eq!(defect.message(), "broken"),
            _ => panic!("expected a defect"),
        }
    }

    #[test]
    fn test_interrupt_bypasses_handlers() {
        let fiber_id = FiberId::fresh();
        let stm = Stm::<(), String>::interrupt_as(fiber_id).or_else(Stm::succeed(()));

        match run(stm) {
            TExit::Interrupt(id) => assert_eq!(id, fiber_id),
            _ => panic!("expected an interruption"),
        }
    }

    #[test]
    fn test_panics_become_defects() {
        let stm = Stm::<usize, Infallible>::succeed(1).map(|_| -> usize { panic!("in map") });
        match run(stm) {
            TExit::Die(defect) => assert_eq!(defect.message(), "in map"),
            _ => panic!("expected a defect"),
        }

        let stm = Stm::<(), Infallible>::succeed(()).update_context(|_| -> Context { panic!("in context") });
        assert!(matches!(run(stm), TExit::Die(_)));
    }

    #[test]
    fn test_provide_restores_context() {
        let read = Stm::<Multiplier, String>::service().map(|m| m.0);
        let stm = read
            .clone()
            .provide_service(Multiplier(3))
            .zip(Stm::<Context, String>::context().map(|context| context.contains::<Multiplier>()));
        assert_eq!(succeeded::<(usize, bool)>(run(stm)), (3, false));

        // the context is also restored when the scoped program fails
        let stm = Stm::<usize, String>::fail("x".into())
            .provide_service(Multiplier(3))
            .catch_all(move |_| read.clone());
        match run(stm) {
            TExit::Die(defect) => assert!(defect.message().contains("service not found")),
            _ => panic!("expected a missing service"),
        }
    }

    #[test]
    fn test_deep_programs_run_in_constant_stack() {
        let mut stm = Stm::<usize, Infallible>::succeed(0);
        for _ in 0..1_000_000 {
            stm = stm.map(|n| n + 1);
        }
        assert_eq!(succeeded::<usize>(run(stm)), 1_000_000);

        let mut stm = Stm::<usize, Infallible>::succeed(0);
        for _ in 0..2_000 {
            stm = stm.flat_map(|n| Stm::succeed(n + 1));
        }
        assert_eq!(succeeded::<usize>(run(stm)), 2_000);

        let stm = Stm::<usize, Infallible>::iterate(0usize, |n| *n < 200_000, |n| Stm::succeed(n + 1));
        assert_eq!(succeeded::<usize>(run(stm)), 200_000);
    }

    #[test]
    fn test_stale_journal_abandons_long_attempt() {
        let tref = TRef::new(0usize);
        let writer = tref.clone();

        let stm = tref
            .get()
            .zip_right(Stm::sync(move || writer.inner.publish(1)))
            .zip_right(Stm::iterate(0usize, |n| *n < 10_000, |n| Stm::succeed(n + 1)));

        assert!(run(stm).is_retry());
    }
}
