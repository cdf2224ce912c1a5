// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transactional memory benches
//!
//! Bench subjects:
//! - programs touching no ref (fast path)
//! - read-write commits on a single ref
//! - long continuation chains inside one attempt
//! - contended commits from several threads

use commit::*;
use criterion::{criterion_group, criterion_main};

criterion_group!(
    benches,
    bnc_commit_pure,
    bnc_commit_update,
    bnc_commit_transfer,
    bnc_commit_chain,
    bnc_commit_contended
);

criterion_main!(benches);
