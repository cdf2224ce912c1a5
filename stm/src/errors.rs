// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::runtime::FiberId;
use std::any::Any;
use thiserror::Error as DeriveError;

/// An unexpected error. Defects are raised by [`crate::Stm::die`] or by a panic inside
/// user code of a transaction, and are never caught by transactional handlers.
#[derive(DeriveError, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct Defect {
    message: String,
}

impl Defect {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Converts the payload of a caught panic
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_string(),
                Err(_) => "panic with a non string payload".to_string(),
            },
        };

        Self { message }
    }
}

/// The reason a committed transaction did not produce a value.
#[derive(DeriveError, Debug, Clone, PartialEq, Eq)]
pub enum Cause<E> {
    /// The transaction failed with a typed error
    #[error("transaction failed: {0:?}")]
    Fail(E),

    /// The transaction died with a defect
    #[error("transaction died: {0}")]
    Die(Defect),

    /// The transaction was interrupted
    #[error("transaction interrupted by {0}")]
    Interrupt(FiberId),
}

impl<E> Cause<E> {
    pub fn is_failure(&self) -> bool {
        matches!(self, Cause::Fail(_))
    }

    pub fn is_die(&self) -> bool {
        matches!(self, Cause::Die(_))
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Cause::Interrupt(_))
    }

    /// Returns the typed failure, if any
    pub fn failure(self) -> Option<E> {
        match self {
            Cause::Fail(error) => Some(error),
            _ => None,
        }
    }
}

/// The observable outcome of a committed transaction
pub type Exit<A, E> = Result<A, Cause<E>>;
