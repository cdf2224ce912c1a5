// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The untyped program tree interpreted by the [`crate::driver::Driver`].
//!
//! Values travel through the tree type erased as [`Value`]. The typed surface in
//! [`crate::Stm`] guarantees that a continuation only ever receives the value type
//! it was built for; a mismatch is an interpreter bug and surfaces as a defect.
//!
//! Trees are shared and re-evaluated on every attempt of a transaction, so every
//! node is immutable and every callback is `Fn`. Trees produced by a continuation
//! during an attempt are evaluated exactly once; those may carry one-shot values
//! ([`Lazy::Once`]) and one-shot continuations ([`continuation_once`]).

use crate::{
    context::Context,
    driver::Driver,
    errors::Defect,
    runtime::FiberId,
};
use lazy_static::lazy_static;
use std::{
    any::{type_name, Any},
    mem,
    sync::{Arc, Mutex, PoisonError},
};

pub(crate) type Value = Box<dyn Any + Send>;

pub(crate) type Program = Arc<Primitive>;

pub(crate) type Thunk = Arc<dyn Fn() -> Value + Send + Sync>;

pub(crate) type Continuation = Arc<dyn Fn(Value) -> Program + Send + Sync>;

pub(crate) type RetryContinuation = Arc<dyn Fn() -> Program + Send + Sync>;

pub(crate) type RuntimeFn = Arc<dyn Fn(&mut Driver<'_>) -> Program + Send + Sync>;

pub(crate) type ContextFn = Arc<dyn Fn(&Context) -> Context + Send + Sync>;

/// A lazily produced value
pub(crate) enum Lazy {
    /// A value that can be taken exactly once
    Once(Mutex<Option<Value>>),

    /// A value that is computed on every evaluation
    Thunk(Thunk),
}

impl Lazy {
    pub(crate) fn force(&self) -> Result<Value, Defect> {
        match self {
            Lazy::Once(slot) => slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or_else(|| Defect::new("one-shot value evaluated twice")),
            Lazy::Thunk(thunk) => Ok(thunk()),
        }
    }
}

pub(crate) enum Primitive {
    Succeed(Lazy),
    Sync(Thunk),
    Fail(Lazy),
    Die(Arc<dyn Fn() -> Defect + Send + Sync>),
    Retry,
    Interrupt(FiberId),
    WithRuntime(RuntimeFn),
    Provide(Program, ContextFn),
    OnSuccess(Program, Continuation),
    OnFailure(Program, Continuation),
    OnRetry(Program, RetryContinuation),
}

impl Primitive {
    pub(crate) fn succeed_now(value: Value) -> Program {
        Arc::new(Primitive::Succeed(Lazy::Once(Mutex::new(Some(value)))))
    }

    pub(crate) fn succeed_with(thunk: Thunk) -> Program {
        Arc::new(Primitive::Succeed(Lazy::Thunk(thunk)))
    }

    pub(crate) fn sync(thunk: Thunk) -> Program {
        Arc::new(Primitive::Sync(thunk))
    }

    pub(crate) fn fail_now(error: Value) -> Program {
        Arc::new(Primitive::Fail(Lazy::Once(Mutex::new(Some(error)))))
    }

    pub(crate) fn fail_with(thunk: Thunk) -> Program {
        Arc::new(Primitive::Fail(Lazy::Thunk(thunk)))
    }

    pub(crate) fn die(defect: Defect) -> Program {
        Arc::new(Primitive::Die(Arc::new(move || defect.clone())))
    }

    pub(crate) fn retry() -> Program {
        Arc::new(Primitive::Retry)
    }

    pub(crate) fn interrupt(fiber_id: FiberId) -> Program {
        Arc::new(Primitive::Interrupt(fiber_id))
    }

    pub(crate) fn with_runtime<F>(f: F) -> Program
    where
        F: Fn(&mut Driver<'_>) -> Program + Send + Sync + 'static,
    {
        Arc::new(Primitive::WithRuntime(Arc::new(f)))
    }

    pub(crate) fn provide<F>(inner: Program, f: F) -> Program
    where
        F: Fn(&Context) -> Context + Send + Sync + 'static,
    {
        Arc::new(Primitive::Provide(inner, Arc::new(f)))
    }

    pub(crate) fn on_success(inner: Program, k: Continuation) -> Program {
        Arc::new(Primitive::OnSuccess(inner, k))
    }

    pub(crate) fn on_failure(inner: Program, k: Continuation) -> Program {
        Arc::new(Primitive::OnFailure(inner, k))
    }

    pub(crate) fn on_retry(inner: Program, k: RetryContinuation) -> Program {
        Arc::new(Primitive::OnRetry(inner, k))
    }
}

lazy_static! {
    /// Stands in for a child that has been unlinked from its parent
    static ref UNLINKED: Program = Arc::new(Primitive::Retry);
}

impl Primitive {
    /// Detaches the inner program of a combinator node
    fn unlink(&mut self) -> Option<Program> {
        match self {
            Primitive::Provide(inner, _)
            | Primitive::OnSuccess(inner, _)
            | Primitive::OnFailure(inner, _)
            | Primitive::OnRetry(inner, _) => {
                if Arc::ptr_eq(inner, &*UNLINKED) {
                    return None;
                }
                Some(mem::replace(inner, UNLINKED.clone()))
            }
            _ => None,
        }
    }
}

// Chains of combinators nest as deep as the program is long. Nodes that are no
// longer shared are taken apart one by one, so dropping never recurses.
impl Drop for Primitive {
    fn drop(&mut self) {
        let mut unlinked: Vec<Program> = self.unlink().into_iter().collect();

        while let Some(program) = unlinked.pop() {
            if let Ok(mut primitive) = Arc::try_unwrap(program) {
                unlinked.extend(primitive.unlink());
            }
        }
    }
}

/// Restores the concrete type of an erased value
pub(crate) fn unbox<A: 'static>(value: Value) -> Result<A, Defect> {
    value
        .downcast::<A>()
        .map(|value| *value)
        .map_err(|_| Defect::new(format!("unexpected value in program tree, expected {}", type_name::<A>())))
}

/// Builds a typed continuation. A value of the wrong type turns into a defect.
pub(crate) fn continuation<A, F>(f: F) -> Continuation
where
    A: 'static,
    F: Fn(A) -> Program + Send + Sync + 'static,
{
    Arc::new(move |value: Value| match unbox::<A>(value) {
        Ok(value) => f(value),
        Err(defect) => Primitive::die(defect),
    })
}

/// Builds a typed continuation that may be invoked once. Only valid inside
/// trees that are produced while an attempt runs.
pub(crate) fn continuation_once<A, F>(f: F) -> Continuation
where
    A: 'static,
    F: FnOnce(A) -> Program + Send + 'static,
{
    let slot = Mutex::new(Some(f));
    Arc::new(move |value: Value| {
        let f = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        match (f, unbox::<A>(value)) {
            (Some(f), Ok(value)) => f(value),
            (None, _) => Primitive::die(Defect::new("one-shot continuation invoked twice")),
            (_, Err(defect)) => Primitive::die(defect),
        }
    })
}
