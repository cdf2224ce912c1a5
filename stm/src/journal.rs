// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per attempt transaction log.
//!
//! A [`Journal`] records, for every [`TRef`] an attempt touched, the versioned value
//! observed first (`expected`), the value as seen by the attempt (`current`) and
//! whether the attempt wrote to it. Nothing in here touches shared state except
//! [`Journal::commit`], [`Journal::add_todo`] and [`Journal::collect_todos`], which
//! are only called from the commit critical section.

use crate::{
    errors::Defect,
    tref::{TRef, Todo, TodoRegistry},
    version::{TRefId, TxnId, Versioned},
};
use std::{
    any::{type_name, Any},
    collections::BTreeMap,
    sync::Arc,
};

pub(crate) trait Entry: Send {
    fn registry(&self) -> Arc<dyn TodoRegistry>;

    /// `true`, if the observed version is still the live version
    fn is_valid(&self) -> bool;

    fn is_changed(&self) -> bool;

    /// Publishes the pending value
    fn commit(&self);

    /// Drops a pending write, the entry is kept as a read
    fn discard(&mut self);

    fn copy(&self) -> Box<dyn Entry>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct TypedEntry<A> {
    tref: TRef<A>,
    expected: Versioned<A>,
    current: A,
    written: bool,
}

impl<A> TypedEntry<A>
where
    A: Clone + Send + Sync + 'static,
{
    fn new(tref: &TRef<A>) -> Self {
        let expected = tref.inner.live();
        Self {
            tref: tref.clone(),
            current: expected.value.clone(),
            expected,
            written: false,
        }
    }
}

impl<A> Entry for TypedEntry<A>
where
    A: Clone + Send + Sync + 'static,
{
    fn registry(&self) -> Arc<dyn TodoRegistry> {
        self.tref.inner.clone()
    }

    fn is_valid(&self) -> bool {
        self.tref.inner.is_current(&self.expected)
    }

    fn is_changed(&self) -> bool {
        self.written
    }

    fn commit(&self) {
        self.tref.inner.publish(self.current.clone());
    }

    fn discard(&mut self) {
        self.current = self.expected.value.clone();
        self.written = false;
    }

    fn copy(&self) -> Box<dyn Entry> {
        Box::new(TypedEntry {
            tref: self.tref.clone(),
            expected: self.expected.clone(),
            current: self.current.clone(),
            written: self.written,
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Classification of a journal against the live state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JournalAnalysis {
    /// At least one observed version is stale
    Invalid,

    /// Nothing has been written
    ReadOnly,

    /// At least one entry has been written
    ReadWrite,
}

/// Saved journal state, see [`Journal::snapshot`]
pub(crate) struct JournalSnapshot {
    entries: BTreeMap<TRefId, Box<dyn Entry>>,
}

#[derive(Default)]
pub(crate) struct Journal {
    entries: BTreeMap<TRefId, Box<dyn Entry>>,
}

impl Journal {
    fn entry<A>(&mut self, tref: &TRef<A>) -> Result<&mut TypedEntry<A>, Defect>
    where
        A: Clone + Send + Sync + 'static,
    {
        self.entries
            .entry(tref.id())
            .or_insert_with(|| Box::new(TypedEntry::new(tref)) as Box<dyn Entry>)
            .as_any_mut()
            .downcast_mut::<TypedEntry<A>>()
            .ok_or_else(|| Defect::new(format!("journal entry of {} has unexpected type {}", tref.id(), type_name::<A>())))
    }

    /// Reads `tref` through the journal. The first read records the live value,
    /// later reads return what the attempt has seen or written so far.
    pub(crate) fn get<A>(&mut self, tref: &TRef<A>) -> Result<A, Defect>
    where
        A: Clone + Send + Sync + 'static,
    {
        Ok(self.entry(tref)?.current.clone())
    }

    pub(crate) fn set<A>(&mut self, tref: &TRef<A>, value: A) -> Result<(), Defect>
    where
        A: Clone + Send + Sync + 'static,
    {
        let entry = self.entry(tref)?;
        entry.current = value;
        entry.written = true;
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `true`, if no entry is stale. Without the commit lock this is only a hint.
    pub(crate) fn is_valid(&self) -> bool {
        self.entries.values().all(|entry| entry.is_valid())
    }

    pub(crate) fn analyze(&self) -> JournalAnalysis {
        let mut analysis = JournalAnalysis::ReadOnly;
        for entry in self.entries.values() {
            if !entry.is_valid() {
                return JournalAnalysis::Invalid;
            }
            if entry.is_changed() {
                analysis = JournalAnalysis::ReadWrite;
            }
        }
        analysis
    }

    /// Publishes all written entries. Must only be called inside the commit
    /// critical section, after [`Journal::analyze`] found the journal valid.
    pub(crate) fn commit(&self) {
        self.entries
            .values()
            .filter(|entry| entry.is_changed())
            .for_each(|entry| entry.commit());
    }

    /// Takes the todos of every written [`TRef`], one per transaction
    pub(crate) fn collect_todos(&self) -> BTreeMap<TxnId, Todo> {
        let mut todos = BTreeMap::new();
        for entry in self.entries.values().filter(|entry| entry.is_changed()) {
            todos.extend(entry.registry().take_todos());
        }
        todos
    }

    /// Registers `todo` on every [`TRef`] of the journal and returns the
    /// registries it has been added to.
    pub(crate) fn add_todo(&self, txn_id: TxnId, todo: &Todo) -> Vec<Arc<dyn TodoRegistry>> {
        self.entries
            .values()
            .map(|entry| entry.registry())
            .filter(|registry| registry.add_todo(txn_id, todo))
            .collect()
    }

    pub(crate) fn snapshot(&self) -> JournalSnapshot {
        JournalSnapshot {
            entries: self.entries.iter().map(|(id, entry)| (*id, entry.copy())).collect(),
        }
    }

    /// Rolls the journal back to `snapshot`. Entries added since are kept as
    /// reads, so the transaction still waits on them when it retries.
    pub(crate) fn reset(&mut self, mut snapshot: JournalSnapshot) {
        for (id, entry) in self.entries.iter_mut() {
            match snapshot.entries.remove(id) {
                Some(saved) => *entry = saved,
                None => entry.discard(),
            }
        }
    }
}
