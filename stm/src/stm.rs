// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The typed surface of transactional programs.
//!
//! An [`Stm<A, E>`] describes a transaction that either succeeds with an `A`,
//! fails with an `E`, dies with a [`Defect`] or retries. Describing a program has
//! no effect: it only runs when committed through a [`crate::Fiber`], and it may
//! run several times until it commits, so every closure handed to a combinator
//! must be free of side effects outside of [`crate::TRef`]s.

use crate::{
    context::Context,
    driver::Driver,
    errors::Defect,
    primitive::{continuation, continuation_once, Primitive, Program, Value},
    runtime::FiberId,
};
use std::{
    any::type_name,
    convert::Infallible,
    fmt,
    marker::PhantomData,
    sync::{Arc, Mutex, PoisonError},
};

/// One of two values, as returned by [`Stm::or_else_either`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either<L, R> {
    Left(L),
    Right(R),
}

/// A transactional program, succeeding with `A` or failing with `E`.
pub struct Stm<A, E = Infallible> {
    pub(crate) program: Program,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self::from_program(self.program.clone())
    }
}

impl<A, E> fmt::Debug for Stm<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stm<{}, {}>", type_name::<A>(), type_name::<E>())
    }
}

impl<A, E> Stm<A, E> {
    pub(crate) fn from_program(program: Program) -> Self {
        Self {
            program,
            _marker: PhantomData,
        }
    }
}

impl<A, E> Stm<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// A program succeeding with `value`
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_program(Primitive::succeed_with(Arc::new(move || Box::new(value.clone()) as Value)))
    }

    /// Succeeds with `value` once. Only valid for programs built during an attempt.
    pub(crate) fn succeed_now(value: A) -> Self {
        Self::from_program(Primitive::succeed_now(Box::new(value)))
    }

    /// A program succeeding with the result of `f`, computed anew on every attempt
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::from_program(Primitive::sync(Arc::new(move || Box::new(f()) as Value)))
    }

    /// Defers building the program to the time it is run
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Stm<A, E> + Send + Sync + 'static,
    {
        Self::from_program(Primitive::with_runtime(move |_| f().program))
    }

    pub fn fail(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::from_program(Primitive::fail_with(Arc::new(move || Box::new(error.clone()) as Value)))
    }

    pub fn fail_sync<F>(f: F) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
    {
        Self::from_program(Primitive::fail_with(Arc::new(move || Box::new(f()) as Value)))
    }

    /// Aborts the transaction with a defect. Defects are not caught by any handler.
    pub fn die(defect: Defect) -> Self {
        Self::from_program(Primitive::die(defect))
    }

    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::new(message))
    }

    /// Abandons the attempt. The transaction is suspended until one of the
    /// [`crate::TRef`]s it has read is changed by another commit.
    pub fn retry() -> Self {
        Self::from_program(Primitive::retry())
    }

    /// Interrupts the transaction on behalf of the committing fiber
    pub fn interrupt() -> Self {
        Self::from_program(Primitive::with_runtime(|driver| Primitive::interrupt(driver.fiber_id())))
    }

    pub fn interrupt_as(fiber_id: FiberId) -> Self {
        Self::from_program(Primitive::interrupt(fiber_id))
    }

    pub(crate) fn with_runtime<F>(f: F) -> Self
    where
        F: Fn(&mut Driver<'_>) -> Stm<A, E> + Send + Sync + 'static,
    {
        Self::from_program(Primitive::with_runtime(move |driver| f(driver).program))
    }

    /// Runs `body` on the state for as long as `cont` holds, starting with `initial`
    pub fn iterate<C, B>(initial: A, cont: C, body: B) -> Self
    where
        A: Clone + Sync,
        C: Fn(&A) -> bool + Send + Sync + 'static,
        B: Fn(A) -> Stm<A, E> + Send + Sync + 'static,
    {
        let cont = Arc::new(cont);
        let body = Arc::new(body);
        Self::from_program(Primitive::with_runtime(move |_| {
            iterate_from(initial.clone(), cont.clone(), body.clone())
        }))
    }

    pub fn map<B, F>(self, f: F) -> Stm<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Stm::from_program(Primitive::on_success(
            self.program,
            continuation(move |value: A| Primitive::succeed_now(Box::new(f(value)))),
        ))
    }

    pub fn flat_map<B, F>(self, f: F) -> Stm<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    {
        Stm::from_program(Primitive::on_success(
            self.program,
            continuation(move |value: A| f(value).program),
        ))
    }

    /// Runs `that` after this program and combines both results with `f`
    pub fn zip_with<B, C, F>(self, that: Stm<B, E>, f: F) -> Stm<C, E>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Stm::from_program(Primitive::on_success(
            self.program,
            continuation(move |a: A| {
                let f = f.clone();
                Primitive::on_success(
                    that.program.clone(),
                    continuation_once(move |b: B| Primitive::succeed_now(Box::new(f(a, b)))),
                )
            }),
        ))
    }

    pub fn zip<B>(self, that: Stm<B, E>) -> Stm<(A, B), E>
    where
        B: Send + 'static,
    {
        self.zip_with(that, |a, b| (a, b))
    }

    pub fn zip_left<B>(self, that: Stm<B, E>) -> Stm<A, E>
    where
        B: Send + 'static,
    {
        self.zip_with(that, |a, _| a)
    }

    pub fn zip_right<B>(self, that: Stm<B, E>) -> Stm<B, E>
    where
        B: Send + 'static,
    {
        self.flat_map(move |_| that.clone())
    }

    pub fn as_unit(self) -> Stm<(), E> {
        self.map(|_| ())
    }

    pub fn map_err<E2, F>(self, f: F) -> Stm<A, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        Stm::from_program(Primitive::on_failure(
            self.program,
            continuation(move |error: E| Primitive::fail_now(Box::new(f(error)))),
        ))
    }

    /// Recovers from a typed failure. Defects, interruptions and retries pass through.
    pub fn catch_all<E2, F>(self, f: F) -> Stm<A, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> Stm<A, E2> + Send + Sync + 'static,
    {
        Stm::from_program(Primitive::on_failure(
            self.program,
            continuation(move |error: E| f(error).program),
        ))
    }

    /// Surfaces the typed failure as a value
    pub fn either<E2>(self) -> Stm<Result<A, E>, E2>
    where
        E2: Send + 'static,
    {
        self.map(Ok).catch_all(|error| Stm::succeed_now(Err(error)))
    }

    /// Runs `that` if this program retries. Writes of this program are kept.
    pub fn or_try(self, that: Stm<A, E>) -> Stm<A, E> {
        Stm::from_program(Primitive::on_retry(self.program, Arc::new(move || that.program.clone())))
    }

    /// Runs `that` if this program retries or fails. All writes of this program
    /// are discarded before `that` runs; its reads are kept, so retrying after
    /// both branches waits on the reads of both.
    pub fn or_else(self, that: Stm<A, E>) -> Stm<A, E> {
        let this = self.program;
        let that = that.program;

        Stm::from_program(Primitive::with_runtime(move |driver| {
            let snapshot = driver.journal().snapshot();
            let that = that.clone();

            Primitive::on_success(
                settle::<A, E>(this.clone()),
                continuation_once(move |settled: Option<A>| match settled {
                    Some(value) => Primitive::succeed_now(Box::new(value)),
                    None => {
                        let snapshot = Mutex::new(Some(snapshot));
                        Primitive::with_runtime(move |driver| {
                            if let Some(snapshot) = snapshot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                                driver.journal().reset(snapshot);
                            }
                            that.clone()
                        })
                    }
                }),
            )
        }))
    }

    /// Like [`Stm::or_else`], but keeps track of which branch produced the value
    pub fn or_else_either<B>(self, that: Stm<B, E>) -> Stm<Either<A, B>, E>
    where
        B: Send + 'static,
    {
        self.map(Either::Left).or_else(that.map(Either::Right))
    }

    /// Retries until `pred` holds for the value
    pub fn retry_until<P>(self, pred: P) -> Stm<A, E>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.flat_map(move |value| match pred(&value) {
            true => Stm::succeed_now(value),
            false => Stm::retry(),
        })
    }

    /// Retries as long as `pred` holds for the value
    pub fn retry_while<P>(self, pred: P) -> Stm<A, E>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.retry_until(move |value| !pred(value))
    }

    /// Runs this program with `context` in place of the current context
    pub fn provide_context(self, context: Context) -> Self {
        self.update_context(move |_| context.clone())
    }

    /// Runs this program with `service` added to the current context
    pub fn provide_service<S>(self, service: S) -> Self
    where
        S: Clone + Send + Sync + 'static,
    {
        self.update_context(move |context| context.add(service.clone()))
    }

    /// Runs this program with the context transformed by `f`. The previous
    /// context is restored when the program completes.
    pub fn update_context<F>(self, f: F) -> Self
    where
        F: Fn(&Context) -> Context + Send + Sync + 'static,
    {
        Self::from_program(Primitive::provide(self.program, f))
    }
}

impl<A> Stm<A, Infallible>
where
    A: Send + 'static,
{
    /// Changes the error type of a program that cannot fail
    pub fn widen_err<E2>(self) -> Stm<A, E2> {
        Stm::from_program(self.program)
    }
}

impl<E> Stm<(), E>
where
    E: Send + 'static,
{
    /// Retries while `pred` does not hold. Meant to be used after reading the
    /// [`crate::TRef`]s the predicate depends on.
    pub fn check<P>(pred: P) -> Self
    where
        P: Fn() -> bool + Send + Sync + 'static,
    {
        Self::suspend(move || match pred() {
            true => Self::succeed_now(()),
            false => Self::retry(),
        })
    }
}

impl<E> Stm<FiberId, E>
where
    E: Send + 'static,
{
    /// The id of the fiber committing the transaction
    pub fn fiber_id() -> Self {
        Self::with_runtime(|driver| Self::succeed_now(driver.fiber_id()))
    }
}

impl<E> Stm<Context, E>
where
    E: Send + 'static,
{
    /// The current context
    pub fn context() -> Self {
        Self::with_runtime(|driver| Self::succeed_now(driver.context().clone()))
    }
}

impl<S, E> Stm<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Send + 'static,
{
    /// Looks up a service in the current context. A missing service is a defect.
    pub fn service() -> Self {
        Self::with_runtime(|driver| match driver.context().get::<S>() {
            Some(service) => Self::succeed_now(service.clone()),
            None => Self::die(Defect::new(format!("service not found: {}", type_name::<S>()))),
        })
    }
}

impl<B, E> Stm<Vec<B>, E>
where
    B: Send + 'static,
    E: Send + 'static,
{
    /// Runs `f` for every item in order and collects the results
    pub fn for_each<X, I, F>(items: I, f: F) -> Self
    where
        I: IntoIterator<Item = X>,
        X: Clone + Send + Sync + 'static,
        F: Fn(X) -> Stm<B, E> + Send + Sync + 'static,
    {
        let items: Arc<Vec<X>> = Arc::new(items.into_iter().collect());
        let f = Arc::new(f);
        Self::from_program(Primitive::with_runtime(move |_| {
            for_each_from(items.clone(), f.clone(), 0, Vec::with_capacity(items.len()))
        }))
    }
}

fn iterate_from<A, E, C, B>(state: A, cont: Arc<C>, body: Arc<B>) -> Program
where
    A: Send + 'static,
    E: Send + 'static,
    C: Fn(&A) -> bool + Send + Sync + 'static,
    B: Fn(A) -> Stm<A, E> + Send + Sync + 'static,
{
    if !cont(&state) {
        return Primitive::succeed_now(Box::new(state));
    }

    let next = body(state).program;
    Primitive::on_success(
        next,
        continuation_once(move |state: A| iterate_from(state, cont, body)),
    )
}

fn for_each_from<X, B, E, F>(items: Arc<Vec<X>>, f: Arc<F>, index: usize, mut results: Vec<B>) -> Program
where
    X: Clone + Send + Sync + 'static,
    B: Send + 'static,
    E: Send + 'static,
    F: Fn(X) -> Stm<B, E> + Send + Sync + 'static,
{
    let item = match items.get(index) {
        Some(item) => item.clone(),
        None => return Primitive::succeed_now(Box::new(results)),
    };

    Primitive::on_success(
        f(item).program,
        continuation_once(move |result: B| {
            results.push(result);
            for_each_from(items, f, index + 1, results)
        }),
    )
}

/// Turns every outcome of `program` a handler can observe into a success:
/// `Some` for a success, `None` for a failure or a retry
fn settle<A, E>(program: Program) -> Program
where
    A: Send + 'static,
    E: Send + 'static,
{
    Primitive::on_retry(
        Primitive::on_failure(
            Primitive::on_success(
                program,
                continuation(|value: A| Primitive::succeed_now(Box::new(Some(value)))),
            ),
            continuation(|_: E| Primitive::succeed_now(Box::new(None::<A>))),
        ),
        Arc::new(|| Primitive::succeed_now(Box::new(None::<A>))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::{Cause, Exit},
        runtime::Fiber,
        scheduler::QueueScheduler,
        tref::TRef,
    };

    fn run<A, E>(stm: Stm<A, E>) -> Exit<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let fiber = Fiber::new(Arc::new(QueueScheduler::new()));
        let slot = Arc::new(Mutex::new(None));
        let done = slot.clone();

        fiber.atomically(stm, move |exit| *done.lock().unwrap() = Some(exit), |_| {});

        let exit = slot.lock().unwrap().take();
        exit.expect("transaction did not complete")
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Greeting(&'static str);

    #[test]
    fn test_sequencing() {
        let stm = Stm::<usize, ()>::succeed(2)
            .map(|n| n * 10)
            .flat_map(|n| Stm::succeed(n + 1))
            .zip(Stm::sync(|| "x"));
        assert_eq!(run(stm), Ok((21, "x")));

        let stm = Stm::<usize, ()>::succeed(1).zip_left(Stm::succeed(2)).zip_right(Stm::succeed(3));
        assert_eq!(run(stm), Ok(3));

        assert_eq!(run(Stm::<usize, ()>::succeed(1).as_unit()), Ok(()));
    }

    #[test]
    fn test_failures() {
        let stm = Stm::<usize, &str>::fail("empty").map_err(|e| e.len());
        assert_eq!(run(stm), Err(Cause::Fail(5)));

        let stm = Stm::<usize, &str>::fail_sync(|| "lazy").either::<()>();
        assert_eq!(run(stm), Ok(Err("lazy")));

        let stm = Stm::<usize, &str>::succeed(4).either::<()>();
        assert_eq!(run(stm), Ok(Ok(4)));

        let stm = Stm::<usize, &str>::fail("x").catch_all(|_| Stm::<usize, String>::fail("y".into()));
        assert_eq!(run(stm), Err(Cause::Fail("y".to_string())));

        let stm = Stm::<usize>::succeed(1).widen_err::<String>();
        assert_eq!(run(stm), Ok(1));
    }

    #[test]
    fn test_die_and_interrupt() {
        let stm = Stm::<usize, ()>::die_message("gone");
        assert_eq!(run(stm), Err(Cause::Die(Defect::new("gone"))));

        let fiber_id = FiberId::fresh();
        assert_eq!(run(Stm::<(), ()>::interrupt_as(fiber_id)), Err(Cause::Interrupt(fiber_id)));

        let fiber = Fiber::new(Arc::new(QueueScheduler::new()));
        let slot = Arc::new(Mutex::new(None));
        let done = slot.clone();
        fiber.atomically(
            Stm::<(), ()>::interrupt(),
            move |exit| *done.lock().unwrap() = Some(exit),
            |_| {},
        );
        assert_eq!(slot.lock().unwrap().take(), Some(Err(Cause::Interrupt(fiber.id()))));
    }

    #[test]
    fn test_or_else_discards_writes_of_failed_branch() {
        let tref = TRef::new(0usize);
        let first = tref.clone();
        let second = tref.clone();

        let stm = first
            .set(1)
            .widen_err::<&str>()
            .zip_right(Stm::fail("abort"))
            .or_else(second.get().widen_err());

        assert_eq!(run(stm), Ok(0));
        assert_eq!(tref.read_atomic(), 0);
    }

    #[test]
    fn test_or_else_propagates_failure_of_alternative() {
        let stm = Stm::<usize, &str>::retry().or_else(Stm::fail("second"));
        assert_eq!(run(stm), Err(Cause::Fail("second")));

        let stm = Stm::<usize, &str>::fail("first").or_else(Stm::retry()).or_else(Stm::succeed(3));
        assert_eq!(run(stm), Ok(3));
    }

    #[test]
    fn test_or_try_keeps_writes() {
        let tref = TRef::new(0usize);
        let first = tref.clone();
        let second = tref.clone();

        let stm = first
            .set(5)
            .zip_right(Stm::retry())
            .or_try(second.get());

        assert_eq!(run(stm), Ok(5));
        assert_eq!(tref.read_atomic(), 5);
    }

    #[test]
    fn test_or_else_either() {
        let stm = Stm::<usize, ()>::retry().or_else_either(Stm::succeed("right"));
        assert_eq!(run(stm), Ok(Either::Right("right")));

        let stm = Stm::<usize, ()>::succeed(1).or_else_either(Stm::<&str, ()>::succeed("right"));
        assert_eq!(run(stm), Ok(Either::Left(1)));
    }

    #[test]
    fn test_retry_until_completes_when_true() {
        let stm = Stm::<usize, ()>::succeed(3).retry_until(|n| *n > 2);
        assert_eq!(run(stm), Ok(3));

        let stm = Stm::<usize, ()>::succeed(3)
            .retry_while(|n| *n > 2)
            .or_try(Stm::succeed(0));
        assert_eq!(run(stm), Ok(0));

        let stm = Stm::<(), ()>::check(|| false).or_try(Stm::check(|| true));
        assert_eq!(run(stm), Ok(()));
    }

    #[test]
    fn test_context_and_services() {
        let stm = Stm::<Greeting, ()>::service()
            .zip(Stm::<FiberId, ()>::fiber_id())
            .map(|(greeting, _)| greeting.0)
            .provide_service(Greeting("hello"));
        assert_eq!(run(stm), Ok("hello"));

        let stm = Stm::<Context, ()>::context()
            .map(|context| context.len())
            .provide_context(Context::empty().add(1u8).add(2u16));
        assert_eq!(run(stm), Ok(2));

        match run(Stm::<Greeting, ()>::service()) {
            Err(Cause::Die(defect)) => assert!(defect.message().starts_with("service not found")),
            other => panic!("unexpected exit {:?}", other),
        }
    }

    #[test]
    fn test_iterate_and_for_each() {
        let stm = Stm::<usize, ()>::iterate(1usize, |n| *n < 1000, |n| Stm::succeed(n * 2));
        assert_eq!(run(stm), Ok(1024));

        let stm = Stm::<Vec<usize>, ()>::for_each(vec![1usize, 2, 3], |n| Stm::succeed(n * n));
        assert_eq!(run(stm), Ok(vec![1, 4, 9]));

        let stm = Stm::<Vec<usize>, ()>::for_each(0..100_000usize, Stm::succeed).map(|v| v.len());
        assert_eq!(run(stm), Ok(100_000));
    }

    #[test]
    fn test_for_each_writes_are_visible() {
        let trefs: Vec<TRef<usize>> = (0..10).map(TRef::new).collect();
        let stm = Stm::<Vec<()>>::for_each(trefs.clone(), |tref| tref.update(|n| n + 1));

        assert!(run(stm).is_ok());
        assert_eq!(
            trefs.iter().map(TRef::read_atomic).collect::<Vec<_>>(),
            (1..11).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_suspend_reevaluates() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let stm = Stm::<usize, ()>::suspend(move || {
            Stm::succeed(c.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
        });

        assert_eq!(run(stm.clone()), Ok(0));
        assert_eq!(run(stm), Ok(1));
    }
}
