// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Versioning primitives. Every committed write to a [`crate::TRef`] draws a fresh
//! stamp from a process wide [`VersionClock`], so checking whether a journal entry
//! is still current is a single integer comparison.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// An atomic `VersionClock` with a simple interface. The clock only ever moves
/// forward, each call to [`VersionClock::increment`] hands out a value no other
/// caller will see.
#[derive(Debug, Default)]
pub struct VersionClock {
    atomic: AtomicU64,
}

impl VersionClock {
    pub const fn new(version: u64) -> Self {
        Self {
            atomic: AtomicU64::new(version),
        }
    }

    /// Atomically increments the clock and returns the new value
    pub fn increment(&self) -> u64 {
        self.atomic.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the current version
    pub fn version(&self) -> u64 {
        self.atomic.load(Ordering::SeqCst)
    }
}

static STAMPS: VersionClock = VersionClock::new(0);
static TXN_IDS: VersionClock = VersionClock::new(0);
static TREF_IDS: VersionClock = VersionClock::new(0);

/// Write stamp of a [`Versioned`] value. Two stamps are equal only if they
/// were handed out by the same write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(u64);

impl Stamp {
    pub(crate) fn fresh() -> Self {
        Stamp(STAMPS.increment())
    }
}

/// A value paired with the stamp of the write that produced it.
#[derive(Clone, Debug)]
pub struct Versioned<A> {
    pub(crate) value: A,
    pub(crate) stamp: Stamp,
}

impl<A> Versioned<A> {
    /// Wraps `value` with a fresh stamp
    pub fn new(value: A) -> Self {
        Self {
            value,
            stamp: Stamp::fresh(),
        }
    }

    pub fn value(&self) -> &A {
        &self.value
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }
}

/// Identifies a suspended transaction in the todo registries of the
/// [`crate::TRef`]s it waits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(u64);

impl TxnId {
    pub(crate) fn fresh() -> Self {
        TxnId(TXN_IDS.increment())
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Identity of a [`crate::TRef`], shared by all of its clones. Journals are keyed by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TRefId(u64);

impl TRefId {
    pub(crate) fn fresh() -> Self {
        TRefId(TREF_IDS.increment())
    }
}

impl fmt::Display for TRefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tref-{}", self.0)
    }
}
