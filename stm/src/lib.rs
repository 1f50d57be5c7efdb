// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Software Transactional Memory
//!
//! Shared state lives in transactional variables ([`TVar`]). Code reading and writing
//! them runs inside atomic blocks, executed by an [`Stm`] engine. A block either takes
//! effect completely or not at all, and no other block ever observes its intermediate
//! state. Blocks that conflict with a concurrent commit are re-run transparently.
//!
//! A block may wait for a condition with [`retry`]. The attempt is discarded and the
//! block sleeps until another transaction writes one of the variables it has read.
//!
//! ```
//! use stm_engine::{guard, Stm};
//!
//! let stm = Stm::default();
//! let queue = stm.create(vec![1usize, 2, 3]);
//!
//! let head = stm
//!     .atomically(|tx| {
//!         let mut items = tx.load(&queue)?;
//!         guard(!items.is_empty())?;
//!         let head = items.remove(0);
//!         tx.store(&queue, items)?;
//!         Ok(head)
//!     })
//!     .expect("transaction failed");
//!
//! assert_eq!(head, 1);
//! assert_eq!(queue.atomic_get(), vec![2, 3]);
//! ```
#![allow(clippy::type_complexity)]

mod breaker;
mod commit;
mod config;
mod context;
mod error;
mod stm;
mod transaction;
mod tvar;
mod waitset;

pub use crate::{
    breaker::{BusyBreaker, BusyBreakerError},
    config::{Propagation, TransactionConfig},
    error::{Abort, StmError, StmResult, TxError},
    stm::{Stats, Stm},
    transaction::{Status, Transaction},
    tvar::TVar,
};

use std::any::Any;

/// Requests a blocking retry of the transaction running on the current thread.
/// Fails with [`TxError::NoActiveTransaction`] when called outside of an atomic block.
pub fn retry<T>() -> Result<T, TxError> {
    Transaction::current()?.retry()
}

/// Retries, unless `condition` holds
pub fn guard(condition: bool) -> Result<(), TxError> {
    match condition {
        true => Ok(()),
        false => retry(),
    }
}

/// Returns the contained value, or retries on `None`
pub fn unwrap_or_retry<T>(option: Option<T>) -> Result<T, TxError> {
    match option {
        Some(value) => Ok(value),
        None => retry(),
    }
}

/// Aborts the running block with a domain failure. Nothing written by the block
/// becomes visible, the failure is returned by the executor.
pub fn abort<T, E>(error: E) -> StmResult<T, E> {
    Err(Abort::Failure(error))
}

/// Reads `tvar` inside the transaction running on the current thread
pub fn load<T>(tvar: &TVar<T>) -> Result<T, TxError>
where
    T: Any + Clone + Send + Sync,
{
    Transaction::current()?.load(tvar)
}

/// Writes `tvar` inside the transaction running on the current thread
pub fn store<T>(tvar: &TVar<T>, value: T) -> Result<(), TxError>
where
    T: Any + Clone + Send + Sync,
{
    Transaction::current()?.store(tvar, value)
}

/// Schedules `task` to run after the transaction bound to the current thread commits
pub fn on_commit<F>(task: F) -> Result<(), TxError>
where
    F: FnOnce() + 'static,
{
    Transaction::current()?.on_commit(task)
}

/// Schedules `task` to run after the current attempt of the transaction bound to the
/// current thread is aborted
pub fn on_abort<F>(task: F) -> Result<(), TxError>
where
    F: FnOnce() + 'static,
{
    Transaction::current()?.on_abort(task)
}
