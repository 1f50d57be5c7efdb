// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{convert::Infallible, time::Duration};
use thiserror::Error as DeriveError;

/// Signals raised by the engine while an attempt is running. These are consumed by
/// the executor and never reach the caller of [`crate::Stm::atomically`] as is.
#[derive(Debug, DeriveError, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    #[error("read set is no longer consistent")]
    Conflict,

    #[error("transaction requested a blocking retry")]
    Retry,

    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("write attempted inside a readonly transaction")]
    ReadonlyTransaction,
}

/// The error type of a transaction body. Either an engine signal, which the
/// executor handles, or a failure, which aborts the transaction and is
/// handed back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum Abort<E> {
    Tx(TxError),

    /// Domain failure raised by the body
    Failure(E),

    /// Error of an independent block started from inside the body
    Nested(StmError),
}

impl<E> From<TxError> for Abort<E> {
    fn from(error: TxError) -> Self {
        Abort::Tx(error)
    }
}

/// Lets a body compose a flattened inner block with `?`.
impl<E> From<StmError<E>> for Abort<E> {
    fn from(error: StmError<E>) -> Self {
        match error {
            StmError::Failure(e) => Abort::Failure(e),
            StmError::NoActiveTransaction => Abort::Tx(TxError::NoActiveTransaction),
            StmError::ReadonlyTransaction => Abort::Tx(TxError::ReadonlyTransaction),
            // the enclosing record has been interrupted, the executor looks at the
            // record once the body returns
            StmError::Interrupted => Abort::Tx(TxError::Conflict),
            StmError::InvalidRetry => Abort::Nested(StmError::InvalidRetry),
            StmError::TooManyRetries { attempts } => Abort::Nested(StmError::TooManyRetries { attempts }),
            StmError::TransactionTimeout(timeout) => Abort::Nested(StmError::TransactionTimeout(timeout)),
            StmError::TransactionNotAllowed => Abort::Nested(StmError::TransactionNotAllowed),
        }
    }
}

/// Result type of transaction bodies
pub type StmResult<T, E = Infallible> = Result<T, Abort<E>>;

/// Errors surfaced by an atomic block
#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum StmError<E = Infallible> {
    #[error("transaction failed: {0:?}")]
    Failure(E),

    #[error("retry called before anything was read")]
    InvalidRetry,

    #[error("transaction gave up after {attempts} attempts")]
    TooManyRetries { attempts: usize },

    #[error("blocking retry timed out after {0:?}")]
    TransactionTimeout(Duration),

    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("write attempted inside a readonly transaction")]
    ReadonlyTransaction,

    #[error("transaction not allowed inside an active transaction")]
    TransactionNotAllowed,

    #[error("enclosing transaction has to restart")]
    Interrupted,
}

impl<E> StmError<E> {
    /// Returns the domain failure, if this is one
    pub fn into_failure(self) -> Option<E> {
        match self {
            StmError::Failure(e) => Some(e),
            _ => None,
        }
    }
}

impl StmError<Infallible> {
    /// Widens an error of an infallible block into any failure type
    pub fn widen<E>(self) -> StmError<E> {
        match self {
            StmError::Failure(never) => match never {},
            StmError::InvalidRetry => StmError::InvalidRetry,
            StmError::TooManyRetries { attempts } => StmError::TooManyRetries { attempts },
            StmError::TransactionTimeout(timeout) => StmError::TransactionTimeout(timeout),
            StmError::NoActiveTransaction => StmError::NoActiveTransaction,
            StmError::ReadonlyTransaction => StmError::ReadonlyTransaction,
            StmError::TransactionNotAllowed => StmError::TransactionNotAllowed,
            StmError::Interrupted => StmError::Interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Overdrawn;

    #[test]
    fn test_failure_converts_back_into_abort() {
        let abort: Abort<Overdrawn> = StmError::Failure(Overdrawn).into();
        assert_eq!(abort, Abort::Failure(Overdrawn));

        let abort: Abort<Overdrawn> = StmError::<Overdrawn>::Interrupted.into();
        assert_eq!(abort, Abort::Tx(TxError::Conflict));

        let abort: Abort<Overdrawn> = StmError::<Overdrawn>::TransactionNotAllowed.into();
        assert_eq!(abort, Abort::Nested(StmError::TransactionNotAllowed));
    }

    #[test]
    fn test_widen() {
        let error: StmError<Overdrawn> = StmError::TooManyRetries { attempts: 3 }.widen();
        assert_eq!(error, StmError::TooManyRetries { attempts: 3 });
        assert_eq!(error.into_failure(), None);
    }
}
