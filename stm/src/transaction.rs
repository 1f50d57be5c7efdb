// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    commit::global_version,
    context::{self, SharedRecord},
    error::{Abort, StmResult, TxError},
    tvar::{cast, TVar, Value, VarCore},
    waitset::WaitSet,
};
use std::{any::Any, cell::RefMut, collections::BTreeMap, rc::Rc, sync::Arc};

/// Lifecycle of a single attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Active,
    Committed,
    Aborted,
}

/// A variable as first observed by the attempt
pub(crate) struct ReadEntry {
    pub core: Arc<VarCore>,
    pub version: u64,
    pub value: Value,
}

/// Function deferred to commit time, applied to the committed value of a variable
pub(crate) type Commute = Rc<dyn Fn(&Value) -> Value>;

/// Closure run once the attempt has ended
pub(crate) type Task = Box<dyn FnOnce()>;

/// The private log of one attempt. A fresh record is created for every attempt
/// and discarded afterwards, blocks joining a running transaction share it.
pub(crate) struct TransactionRecord {
    /// Transaction id, shared by all attempts of the same block
    pub(crate) id: usize,

    /// Number of this attempt, starting at one
    pub(crate) attempt: usize,

    readonly: bool,
    status: Status,

    /// Global version at which the read set was last known to be consistent
    sampled_version: u64,

    /// Set, once the attempt cannot succeed anymore. Takes precedence over
    /// whatever the body returns.
    interrupt: Option<TxError>,

    /// Variables read or written, with the version seen on first access.
    /// Ordered by variable id, which is the order commits lock them in.
    pub(crate) reads: BTreeMap<u64, ReadEntry>,

    /// Pending values, invisible to others until commit
    pub(crate) writes: BTreeMap<u64, (Arc<VarCore>, Value)>,

    /// Commuting functions of variables the attempt has not read
    pub(crate) commutes: BTreeMap<u64, (Arc<VarCore>, Vec<Commute>)>,

    on_commit: Vec<Task>,
    on_abort: Vec<Task>,
}

impl TransactionRecord {
    pub(crate) fn new(id: usize, attempt: usize, readonly: bool) -> Self {
        Self {
            id,
            attempt,
            readonly,
            status: Status::Active,
            sampled_version: global_version(),
            interrupt: None,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            commutes: BTreeMap::new(),
            on_commit: Vec::new(),
            on_abort: Vec::new(),
        }
    }

    pub(crate) fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub(crate) fn interrupt(&mut self, signal: TxError) {
        // the first signal wins
        if self.interrupt.is_none() {
            self.interrupt = Some(signal);
        }
    }

    pub(crate) fn take_interrupt(&mut self) -> Option<TxError> {
        self.interrupt.take()
    }

    /// Returns `true`, if no variable of the read set has been committed since it was read.
    /// Variables are checked one after another, but since versions only grow, all of
    /// them were unchanged at the moment the last read happened.
    pub(crate) fn is_consistent(&self) -> bool {
        self.reads.values().all(|entry| entry.core.version() == entry.version)
    }

    /// Adds `core` to the read set and returns its committed value. Fails with a
    /// conflict, if any variable read before has been committed meanwhile, so that
    /// the body never sees old and new state mixed.
    fn observe(&mut self, core: &Arc<VarCore>) -> Result<Value, TxError> {
        let (version, value) = core.snapshot();
        self.reads.insert(
            core.id,
            ReadEntry {
                core: core.clone(),
                version,
                value: value.clone(),
            },
        );

        // nothing has been published since the last check
        let global = global_version();
        if global == self.sampled_version {
            return Ok(value);
        }

        if !self.is_consistent() {
            self.interrupt(TxError::Conflict);
            return Err(TxError::Conflict);
        }
        self.sampled_version = global;

        Ok(value)
    }

    /// Discards the attempt and returns what it has read
    pub(crate) fn abort_into_wait_set(&mut self) -> WaitSet {
        self.status = Status::Aborted;
        self.writes.clear();
        self.commutes.clear();

        let mut wait_set = WaitSet::default();
        for entry in std::mem::take(&mut self.reads).into_values() {
            wait_set.push(entry.core, entry.version);
        }
        wait_set
    }

    pub(crate) fn abort(&mut self) {
        self.status = Status::Aborted;
        self.writes.clear();
        self.reads.clear();
        self.commutes.clear();
    }

    /// Takes the tasks to run for the final status of the attempt, dropping the others
    pub(crate) fn take_tasks(&mut self) -> Vec<Task> {
        let on_commit = std::mem::take(&mut self.on_commit);
        let on_abort = std::mem::take(&mut self.on_abort);

        match self.status {
            Status::Committed => on_commit,
            _ => on_abort,
        }
    }
}

/// Handle to the running attempt of an atomic block. All reads and writes of
/// [`TVar`]s go through it and are kept private until the block commits.
///
/// A handle is only usable while its attempt is active. Using a handle that
/// outlived its attempt fails with [`TxError::NoActiveTransaction`].
#[derive(Clone)]
pub struct Transaction {
    record: SharedRecord,
}

impl Transaction {
    pub(crate) fn from_record(record: SharedRecord) -> Self {
        Self { record }
    }

    /// Returns a handle to the transaction running on the current thread
    pub fn current() -> Result<Self, TxError> {
        context::current()
            .map(Self::from_record)
            .ok_or(TxError::NoActiveTransaction)
    }

    /// Transaction id
    pub fn id(&self) -> usize {
        self.record.borrow().id
    }

    /// The number of the current attempt, starting at one
    pub fn attempt(&self) -> usize {
        self.record.borrow().attempt
    }

    pub fn status(&self) -> Status {
        self.record.borrow().status()
    }

    fn active(&self) -> Result<RefMut<'_, TransactionRecord>, TxError> {
        let record = self.record.borrow_mut();
        match record.status() {
            Status::Active => Ok(record),
            _ => Err(TxError::NoActiveTransaction),
        }
    }

    fn writable(&self) -> Result<RefMut<'_, TransactionRecord>, TxError> {
        let mut record = self.active()?;
        if record.readonly {
            record.interrupt(TxError::ReadonlyTransaction);
            return Err(TxError::ReadonlyTransaction);
        }
        Ok(record)
    }

    /// This function loads the value from the transactional variable ([`TVar`]).
    /// If the value is present in the write set, this to-be-written value
    /// will be returned. A variable read before returns the value seen back then,
    /// otherwise version and value are logged as a matched pair.
    ///
    /// A first read fails with [`TxError::Conflict`], if any variable read so far
    /// has been changed by a commit in the meantime.
    pub fn load<T>(&mut self, tvar: &TVar<T>) -> Result<T, TxError>
    where
        T: Any + Clone + Send + Sync,
    {
        let id = tvar.core.id;
        let value = {
            let mut record = self.active()?;

            let logged = record
                .writes
                .get(&id)
                .map(|(_, value)| value.clone())
                .or_else(|| record.reads.get(&id).map(|entry| entry.value.clone()));

            match logged {
                Some(value) => value,
                None => {
                    let seen = record.observe(&tvar.core)?;

                    // reading a commuted variable turns its functions into a plain update
                    match record.commutes.remove(&id) {
                        Some((core, functions)) => {
                            let value = functions.iter().fold(seen, |value, function| function(&value));
                            record.writes.insert(id, (core, value.clone()));
                            value
                        }
                        None => seen,
                    }
                }
            }
        };

        Ok(cast(&value))
    }

    /// This writes the value into the transactional log. A variable that has not been
    /// read before gets its current version logged, so that concurrent writers are
    /// detected for blind writes as well.
    pub fn store<T>(&mut self, tvar: &TVar<T>, value: T) -> Result<(), TxError>
    where
        T: Any + Clone + Send + Sync,
    {
        let mut record = self.writable()?;

        let id = tvar.core.id;
        if !record.reads.contains_key(&id) {
            record.observe(&tvar.core)?;
        }
        record.commutes.remove(&id);

        let value: Value = Arc::new(value);
        record.writes.insert(id, (tvar.core.clone(), value));

        Ok(())
    }

    /// Applies `function` to the variable at commit time, without making the
    /// transaction depend on its current value. Concurrent commuting transactions
    /// therefore do not conflict on it. If the variable has been read or written
    /// before, or is read afterwards, the function is applied right away instead.
    ///
    /// `function` may be called under the commit locks and must not touch any
    /// transactional state.
    pub fn commute<T, F>(&mut self, tvar: &TVar<T>, function: F) -> Result<(), TxError>
    where
        T: Any + Clone + Send + Sync,
        F: Fn(T) -> T + 'static,
    {
        {
            let mut record = self.writable()?;
            let id = tvar.core.id;

            if !record.reads.contains_key(&id) {
                let function: Commute = Rc::new(move |value: &Value| -> Value { Arc::new(function(cast::<T>(value))) });
                record
                    .commutes
                    .entry(id)
                    .or_insert_with(|| (tvar.core.clone(), Vec::new()))
                    .1
                    .push(function);

                return Ok(());
            }
        }

        let value = self.load(tvar)?;
        self.store(tvar, function(value))
    }

    /// Runs `task` after the transaction has committed. Tasks of attempts that do
    /// not commit are dropped.
    pub fn on_commit<F>(&mut self, task: F) -> Result<(), TxError>
    where
        F: FnOnce() + 'static,
    {
        self.active()?.on_commit.push(Box::new(task));
        Ok(())
    }

    /// Runs `task` after the current attempt has been aborted, be it by a conflict,
    /// a blocking retry or a failure. Tasks of committing attempts are dropped.
    pub fn on_abort<F>(&mut self, task: F) -> Result<(), TxError>
    where
        F: FnOnce() + 'static,
    {
        self.active()?.on_abort.push(Box::new(task));
        Ok(())
    }

    /// Abandons the attempt. The block is run again as soon as any variable read so
    /// far has been changed by another transaction.
    pub fn retry<T>(&mut self) -> Result<T, TxError> {
        self.active()?.interrupt(TxError::Retry);
        Err(TxError::Retry)
    }

    /// Runs `body` as a nested block of this transaction. The block shares the log of
    /// the enclosing transaction and is committed together with it.
    pub fn atomically<R, E, F>(&mut self, body: F) -> StmResult<R, E>
    where
        F: FnOnce(&mut Transaction) -> StmResult<R, E>,
    {
        self.active()?;
        body(self)
    }

    /// Runs `first`. If it requests a blocking retry, its writes are rolled back and
    /// `second` runs instead. Reads of both branches stay logged, so retrying in
    /// `second` waits for a change of any variable either branch has seen.
    ///
    /// Abort tasks registered by a rolled back `first` run right away.
    pub fn or_else<R, E, F, G>(&mut self, first: F, second: G) -> StmResult<R, E>
    where
        F: FnOnce(&mut Transaction) -> StmResult<R, E>,
        G: FnOnce(&mut Transaction) -> StmResult<R, E>,
    {
        let (writes, commutes, on_commit, on_abort) = {
            let record = self.active()?;
            (
                record.writes.clone(),
                record.commutes.clone(),
                record.on_commit.len(),
                record.on_abort.len(),
            )
        };

        let result = first(self);
        if let Err(Abort::Tx(_)) = result {
            let mut record = self.record.borrow_mut();
            if record.interrupt == Some(TxError::Retry) {
                record.interrupt = None;
                record.writes = writes;
                record.commutes = commutes;
                record.on_commit.truncate(on_commit);
                let rolled_back = record.on_abort.split_off(on_abort);
                drop(record);

                for task in rolled_back {
                    task();
                }
                return second(self);
            }
        }

        result
    }

    #[cfg(test)]
    pub(crate) fn detached(id: usize) -> Self {
        Self::from_record(std::rc::Rc::new(std::cell::RefCell::new(TransactionRecord::new(
            id, 1, false,
        ))))
    }

    #[cfg(test)]
    pub(crate) fn with_record<R>(&self, f: impl FnOnce(&mut TransactionRecord) -> R) -> R {
        f(&mut self.record.borrow_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StmResult;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn test_read_your_own_writes() {
        let var = TVar::new(10usize);
        let mut tx = Transaction::detached(1);

        assert_eq!(tx.load(&var), Ok(10));
        tx.store(&var, 20).expect("store failed");
        assert_eq!(tx.load(&var), Ok(20));

        // nothing leaks before commit
        assert_eq!(var.atomic_get(), 10);
        assert_eq!(var.version(), 0);
    }

    #[test]
    fn test_blind_write_logs_version() {
        let var = TVar::new(String::from("a"));
        let mut tx = Transaction::detached(2);

        tx.store(&var, String::from("b")).expect("store failed");

        tx.with_record(|record| {
            assert_eq!(record.reads.len(), 1);
            assert_eq!(record.writes.len(), 1);
            assert_eq!(record.reads.values().next().map(|entry| entry.version), Some(0));
        });
    }

    #[test]
    fn test_readonly_rejects_store() {
        let var = TVar::new(1u8);
        let mut tx = Transaction::from_record(Rc::new(RefCell::new(TransactionRecord::new(3, 1, true))));

        assert_eq!(tx.store(&var, 2), Err(TxError::ReadonlyTransaction));
        tx.with_record(|record| {
            assert_eq!(record.take_interrupt(), Some(TxError::ReadonlyTransaction));
            assert!(record.writes.is_empty());
        });
    }

    #[test]
    fn test_aborted_handle_is_inactive() {
        let var = TVar::new(1u8);
        let mut tx = Transaction::detached(4);
        tx.with_record(|record| record.abort());

        assert_eq!(tx.status(), Status::Aborted);
        assert_eq!(tx.load(&var), Err(TxError::NoActiveTransaction));
        assert_eq!(tx.retry::<()>(), Err(TxError::NoActiveTransaction));
    }

    #[test]
    fn test_or_else_rolls_back_first_branch() {
        let a = TVar::new(1usize);
        let b = TVar::new(2usize);
        let mut tx = Transaction::detached(5);

        let result: StmResult<usize> = tx.or_else(
            |tx| {
                tx.store(&a, 100)?;
                tx.retry::<()>()?;
                Ok(0)
            },
            |tx| Ok(tx.load(&b)?),
        );

        assert_eq!(result, Ok(2));
        assert_eq!(tx.load(&a), Ok(1));
        tx.with_record(|record| {
            assert!(record.writes.is_empty());
            assert_eq!(record.reads.len(), 2);
            assert_eq!(record.take_interrupt(), None);
        });
    }

    #[test]
    fn test_stale_read_set_is_detected() {
        let var = TVar::new(1usize);
        let mut tx = Transaction::detached(6);
        tx.load(&var).expect("load failed");

        tx.with_record(|record| assert!(record.is_consistent()));
        {
            let mut state = var.core.lock();
            state.version += 1;
        }
        tx.with_record(|record| assert!(!record.is_consistent()));
    }

    #[test]
    fn test_first_read_detects_concurrent_commit() {
        let a = TVar::new(5usize);
        let b = TVar::new(5usize);

        let mut reader = Transaction::detached(7);
        assert_eq!(reader.load(&a), Ok(5));

        // moves one unit from a to b behind the reader's back
        let mut writer = Transaction::detached(8);
        writer.store(&a, 4).expect("store failed");
        writer.store(&b, 6).expect("store failed");
        writer
            .with_record(|record| crate::commit::commit(record))
            .expect("commit failed");

        assert_eq!(reader.load(&b), Err(TxError::Conflict));
        reader.with_record(|record| assert_eq!(record.take_interrupt(), Some(TxError::Conflict)));
    }

    #[test]
    fn test_commit_of_unrelated_variable_keeps_reads_valid() {
        let a = TVar::new(1usize);
        let b = TVar::new(2usize);
        let unrelated = TVar::new(0usize);

        let mut reader = Transaction::detached(9);
        assert_eq!(reader.load(&a), Ok(1));

        let mut writer = Transaction::detached(10);
        writer.store(&unrelated, 1).expect("store failed");
        writer
            .with_record(|record| crate::commit::commit(record))
            .expect("commit failed");

        assert_eq!(reader.load(&b), Ok(2));
    }

    #[test]
    fn test_commute_turns_into_update_on_read() {
        let counter = TVar::new(1usize);
        let mut tx = Transaction::detached(11);

        tx.commute(&counter, |v| v + 1).expect("commute failed");
        tx.commute(&counter, |v| v * 10).expect("commute failed");
        tx.with_record(|record| {
            assert!(record.reads.is_empty());
            assert_eq!(record.commutes.values().map(|(_, f)| f.len()).sum::<usize>(), 2);
        });

        assert_eq!(tx.load(&counter), Ok(20));
        tx.with_record(|record| {
            assert!(record.commutes.is_empty());
            assert_eq!(record.writes.len(), 1);
        });

        // with a dependency in place the function applies right away
        tx.commute(&counter, |v| v + 1).expect("commute failed");
        assert_eq!(tx.load(&counter), Ok(21));
    }

    #[test]
    fn test_tasks_follow_final_status() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut tx = Transaction::detached(12);

        let (on_commit, on_abort) = (fired.clone(), fired.clone());
        tx.on_commit(move || on_commit.borrow_mut().push("commit")).expect("register failed");
        tx.on_abort(move || on_abort.borrow_mut().push("abort")).expect("register failed");

        let tasks = tx.with_record(|record| {
            record.abort();
            record.take_tasks()
        });
        for task in tasks {
            task();
        }

        assert_eq!(*fired.borrow(), vec!["abort"]);
        assert_eq!(tx.on_commit(|| {}), Err(TxError::NoActiveTransaction));
    }
}
