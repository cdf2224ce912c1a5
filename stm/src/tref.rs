// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    stm::Stm,
    version::{TRefId, TxnId, Versioned},
};
use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

/// A wake callback re-attempting a suspended transaction
pub(crate) type Todo = Arc<dyn Fn() + Send + Sync>;

/// The per [`TRef`] registry of suspended transactions observing the cell.
/// All mutations happen inside the commit critical section.
pub(crate) trait TodoRegistry: Send + Sync {
    /// Registers `todo` for `txn_id`. Returns `false` if the transaction was
    /// already registered, in which case the registration is left untouched.
    fn add_todo(&self, txn_id: TxnId, todo: &Todo) -> bool;

    fn remove_todo(&self, txn_id: TxnId);

    /// Removes and returns all registered todos
    fn take_todos(&self) -> BTreeMap<TxnId, Todo>;

    fn todo_count(&self) -> usize;
}

pub(crate) struct TRefInner<A> {
    pub(crate) id: TRefId,

    /// the live, committed value
    pub(crate) versioned: RwLock<Versioned<A>>,

    todos: Mutex<BTreeMap<TxnId, Todo>>,
}

impl<A> TRefInner<A> {
    pub(crate) fn live(&self) -> Versioned<A>
    where
        A: Clone,
    {
        self.versioned.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn is_current(&self, expected: &Versioned<A>) -> bool {
        self.versioned.read().unwrap_or_else(PoisonError::into_inner).stamp == expected.stamp
    }

    /// Publishes `value` under a fresh stamp. Must only be called from the
    /// commit critical section.
    pub(crate) fn publish(&self, value: A) {
        *self.versioned.write().unwrap_or_else(PoisonError::into_inner) = Versioned::new(value);
    }
}

impl<A> TodoRegistry for TRefInner<A>
where
    A: Send + Sync,
{
    fn add_todo(&self, txn_id: TxnId, todo: &Todo) -> bool {
        let mut todos = self.todos.lock().unwrap_or_else(PoisonError::into_inner);
        if todos.contains_key(&txn_id) {
            return false;
        }
        todos.insert(txn_id, todo.clone());
        true
    }

    fn remove_todo(&self, txn_id: TxnId) {
        self.todos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&txn_id);
    }

    fn take_todos(&self) -> BTreeMap<TxnId, Todo> {
        std::mem::take(&mut *self.todos.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn todo_count(&self) -> usize {
        self.todos.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A transactional reference. The value of a [`TRef`] can only be observed or
/// changed through [`Stm`] programs; all operations return programs and have no
/// effect until the enclosing transaction commits.
///
/// Clones refer to the same cell.
pub struct TRef<A> {
    pub(crate) inner: Arc<TRefInner<A>>,
}

impl<A> TRef<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Creates a new [`TRef`] outside of any transaction
    pub fn new(value: A) -> Self {
        Self {
            inner: Arc::new(TRefInner {
                id: TRefId::fresh(),
                versioned: RwLock::new(Versioned::new(value)),
                todos: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Creates a new [`TRef`] as part of a transaction. Every attempt of the
    /// transaction creates a fresh cell.
    pub fn make(value: A) -> Stm<TRef<A>> {
        Stm::with_runtime(move |_| Stm::succeed_now(TRef::new(value.clone())))
    }

    /// Reads the last committed value, outside of any transaction
    pub fn read_atomic(&self) -> A {
        self.inner.live().value
    }

    pub fn id(&self) -> TRefId {
        self.inner.id
    }

    pub fn get(&self) -> Stm<A> {
        let tref = self.clone();
        Stm::with_runtime(move |driver| match driver.journal().get(&tref) {
            Ok(value) => Stm::succeed_now(value),
            Err(defect) => Stm::die(defect),
        })
    }

    pub fn set(&self, value: A) -> Stm<()> {
        let tref = self.clone();
        Stm::with_runtime(move |driver| match driver.journal().set(&tref, value.clone()) {
            Ok(()) => Stm::succeed_now(()),
            Err(defect) => Stm::die(defect),
        })
    }

    /// Reads the value, computes a result and a new value with `f`, and writes
    /// the new value back
    pub fn modify<B, F>(&self, f: F) -> Stm<B>
    where
        B: Send + 'static,
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        self.transform(move |value| {
            let (result, next) = f(value);
            (result, Some(next))
        })
    }

    /// Like [`TRef::modify`], but leaves the value untouched and returns `fallback`
    /// where `f` returns `None`
    pub fn modify_some<B, F>(&self, fallback: B, f: F) -> Stm<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(&A) -> Option<(B, A)> + Send + Sync + 'static,
    {
        self.transform(move |value| match f(&value) {
            Some((result, next)) => (result, Some(next)),
            None => (fallback.clone(), None),
        })
    }

    pub fn update<F>(&self, f: F) -> Stm<()>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.transform(move |value| ((), Some(f(value))))
    }

    pub fn update_and_get<F>(&self, f: F) -> Stm<A>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.transform(move |value| {
            let next = f(value);
            (next.clone(), Some(next))
        })
    }

    pub fn get_and_update<F>(&self, f: F) -> Stm<A>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.transform(move |value| {
            let next = f(value.clone());
            (value, Some(next))
        })
    }

    pub fn get_and_set(&self, value: A) -> Stm<A> {
        self.transform(move |previous| (previous, Some(value.clone())))
    }

    /// Updates the value where `f` returns `Some`
    pub fn update_some<F>(&self, f: F) -> Stm<()>
    where
        F: Fn(&A) -> Option<A> + Send + Sync + 'static,
    {
        self.transform(move |value| ((), f(&value)))
    }

    pub fn update_some_and_get<F>(&self, f: F) -> Stm<A>
    where
        F: Fn(&A) -> Option<A> + Send + Sync + 'static,
    {
        self.transform(move |value| match f(&value) {
            Some(next) => (next.clone(), Some(next)),
            None => (value, None),
        })
    }

    pub fn get_and_update_some<F>(&self, f: F) -> Stm<A>
    where
        F: Fn(&A) -> Option<A> + Send + Sync + 'static,
    {
        self.transform(move |value| {
            let next = f(&value);
            (value, next)
        })
    }

    /// Reads the current value and applies `f`. A returned `Some` is written back,
    /// `None` leaves the journal entry unwritten.
    fn transform<B, F>(&self, f: F) -> Stm<B>
    where
        B: Send + 'static,
        F: Fn(A) -> (B, Option<A>) + Send + Sync + 'static,
    {
        let tref = self.clone();
        Stm::with_runtime(move |driver| {
            let journal = driver.journal();
            let value = match journal.get(&tref) {
                Ok(value) => value,
                Err(defect) => return Stm::die(defect),
            };

            let (result, next) = f(value);
            match next.map(|next| journal.set(&tref, next)) {
                None | Some(Ok(())) => Stm::succeed_now(result),
                Some(Err(defect)) => Stm::die(defect),
            }
        })
    }
}

impl<A> Clone for TRef<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> PartialEq for TRef<A> {
    fn eq(&self, other: &Self) -> bool {
        // only the identity is compared, not the contents
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<A> Eq for TRef<A> {}

impl<A> Hash for TRef<A> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<A> fmt::Debug for TRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TRef").field("id", &self.inner.id).finish()
    }
}
