// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold Fiber Software Transactional Memory
//!
//! Composable transactions over shared [`TRef`] cells for cooperative fiber runtimes.
//!
//! A transaction is described as an [`Stm`] program. Committing it through a
//! [`Fiber`] runs the program against a private journal, validates every value it
//! has read against the live state and publishes its writes in one indivisible
//! step. Conflicting attempts are run again from scratch; a program calling
//! [`Stm::retry`] is suspended until another commit changes one of the cells it
//! has read.
//!
//! ```
//! use std::sync::Arc;
//! use stm::{Fiber, QueueScheduler, Stm, TRef};
//!
//! let fiber = Fiber::new(Arc::new(QueueScheduler::new()));
//! let from = TRef::new(100usize);
//! let to = TRef::new(0usize);
//!
//! let (f, t) = (from.clone(), to.clone());
//! let transfer = from
//!     .get()
//!     .widen_err::<&str>()
//!     .flat_map(move |balance| match balance >= 30 {
//!         true => f.set(balance - 30).zip_right(t.update(|n| n + 30)).widen_err(),
//!         false => Stm::fail("insufficient funds"),
//!     });
//!
//! fiber.atomically(transfer, |exit| assert_eq!(exit, Ok(())), |_| {});
//! assert_eq!((from.read_atomic(), to.read_atomic()), (70, 30));
//! ```

pub mod context;
pub mod errors;
pub mod runtime;
pub mod scheduler;
pub mod stm;
pub mod transaction;
pub mod tref;
pub mod version;

mod driver;
mod journal;
mod primitive;

pub use crate::{
    context::Context,
    errors::{Cause, Defect, Exit},
    runtime::{Fiber, FiberId, Priority, Scheduler, Task, DEFAULT_PRIORITY},
    scheduler::QueueScheduler,
    stm::{Either, Stm},
    transaction::TxnHandle,
    tref::TRef,
    version::{Stamp, TRefId, TxnId, VersionClock, Versioned},
};

#[cfg(feature = "threaded")]
pub use crate::scheduler::ThreadPoolScheduler;

#[cfg(feature = "tokio")]
pub use crate::scheduler::TokioScheduler;

#[cfg(feature = "async")]
pub use crate::transaction::Commit;
