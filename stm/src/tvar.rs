// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{error::TxError, transaction::Transaction, waitset::Waiter};
use std::{
    any::Any,
    fmt::{self, Debug},
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

/// Type erased value stored inside a [`TVar`]. Values are shared immutably
/// between the committed state and any transaction log that observed them.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// Source of stable identities. Commits lock variables in ascending id order.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The committed `(version, value)` pair of a variable. Both fields are only ever
/// replaced together while the state lock is held.
pub(crate) struct VarState {
    pub version: u64,
    pub value: Value,
}

/// Shared part of a [`TVar`], independent of the value type
pub(crate) struct VarCore {
    pub(crate) id: u64,
    state: Mutex<VarState>,

    /// Blocked transactions that have read this variable
    observers: Mutex<Vec<Weak<Waiter>>>,
}

impl VarCore {
    fn new(value: Value) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(VarState { version: 0, value }),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Locks the committed state. The only user code run under this lock are commuting
    /// functions, which all run before anything is published, so a poisoned lock still
    /// guards a consistent pair.
    pub(crate) fn lock(&self) -> MutexGuard<'_, VarState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns version and value as a matched pair
    pub(crate) fn snapshot(&self) -> (u64, Value) {
        let state = self.lock();
        (state.version, state.value.clone())
    }

    pub(crate) fn version(&self) -> u64 {
        self.lock().version
    }

    fn observers(&self) -> MutexGuard<'_, Vec<Weak<Waiter>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a blocked transaction to the list of observers
    pub(crate) fn subscribe(&self, waiter: &Arc<Waiter>) {
        self.observers().push(Arc::downgrade(waiter));
    }

    /// Removes the given observer and garbage collects all dropped ones
    pub(crate) fn unsubscribe(&self, waiter: &Arc<Waiter>) {
        let target = Arc::downgrade(waiter);
        self.observers()
            .retain(|observer| observer.strong_count() > 0 && !observer.ptr_eq(&target));
    }

    /// Wakes all observers. Called after a commit has published a new value.
    pub(crate) fn notify(&self) {
        let mut observers = self.observers();
        observers.retain(|observer| match observer.upgrade() {
            Some(waiter) => {
                waiter.wake();
                true
            }
            None => false,
        });
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers()
            .iter()
            .filter(|observer| observer.strong_count() > 0)
            .count()
    }
}

/// Casts a logged value back into the type of its variable
pub(crate) fn cast<T>(value: &Value) -> T
where
    T: Any + Clone,
{
    match value.downcast_ref::<T>() {
        Some(inner) => inner.clone(),
        None => unreachable!("a TVar only ever stores values of its own type"),
    }
}

/// A transactional variable. Reading and writing goes through a [`Transaction`],
/// changes become visible to others only when the transaction commits.
///
/// Cloning a [`TVar`] yields another handle to the same variable.
pub struct TVar<T> {
    pub(crate) core: Arc<VarCore>,
    marker: PhantomData<fn() -> T>,
}

impl<T> TVar<T>
where
    T: Any + Clone + Send + Sync,
{
    /// Creates a new transactional variable at version zero
    pub fn new(value: T) -> Self {
        Self {
            core: Arc::new(VarCore::new(Arc::new(value))),
            marker: PhantomData,
        }
    }

    /// Reads the committed value without a transaction. Pending writes of running
    /// transactions are never visible.
    pub fn atomic_get(&self) -> T {
        let (_, value) = self.core.snapshot();
        cast(&value)
    }

    /// Returns the committed version. Every commit writing this variable increments it by one.
    pub fn version(&self) -> u64 {
        self.core.version()
    }

    /// Reads the value through `tx`
    pub fn get(&self, tx: &mut Transaction) -> Result<T, TxError> {
        tx.load(self)
    }

    /// Writes a value through `tx`
    pub fn set(&self, tx: &mut Transaction, value: T) -> Result<(), TxError> {
        tx.store(self, value)
    }

    /// Applies `f` to the current value and stores the result
    pub fn modify<F>(&self, tx: &mut Transaction, f: F) -> Result<(), TxError>
    where
        F: FnOnce(T) -> T,
    {
        let value = tx.load(self)?;
        tx.store(self, f(value))
    }

    /// Applies `f` at commit time without reading the value, see [`Transaction::commute`]
    pub fn commute<F>(&self, tx: &mut Transaction, f: F) -> Result<(), TxError>
    where
        F: Fn(T) -> T + 'static,
    {
        tx.commute(self, f)
    }

    /// Stores `value` and returns the previous one
    pub fn replace(&self, tx: &mut Transaction, value: T) -> Result<T, TxError> {
        let previous = tx.load(self)?;
        tx.store(self, value)?;
        Ok(previous)
    }

    /// Returns the value once `predicate` holds for it, otherwise blocks the
    /// transaction until this variable changes.
    pub fn await_value<P>(&self, tx: &mut Transaction, predicate: P) -> Result<T, TxError>
    where
        P: FnOnce(&T) -> bool,
    {
        let value = tx.load(self)?;
        if predicate(&value) {
            Ok(value)
        } else {
            tx.retry()
        }
    }

    /// Number of blocked transactions currently waiting for a change of this variable
    #[doc(hidden)]
    pub fn observer_count(&self) -> usize {
        self.core.observer_count()
    }
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            marker: PhantomData,
        }
    }
}

impl<T> PartialEq for TVar<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<T> Eq for TVar<T> {}

impl<T> Hash for TVar<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.core.id.hash(state);
    }
}

impl<T> Debug for TVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TVar")
            .field("id", &self.core.id)
            .field("version", &self.core.version())
            .finish()
    }
}

impl<T> Default for TVar<T>
where
    T: Any + Clone + Send + Sync + Default,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}
