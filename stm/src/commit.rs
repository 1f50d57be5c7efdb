// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The commit protocol. A commit
//!
//! 1. locks every variable the attempt has touched, in ascending id order,
//! 2. validates that each read version still is the committed one,
//! 3. applies deferred commuting functions to the committed values,
//! 4. publishes the write set, incrementing the version of every written variable
//!    and the global version,
//! 5. releases the locks and wakes transactions blocked on the written variables.
//!
//! Holding all locks across validation and publication totally orders commits with
//! overlapping variables. The fixed lock order rules out deadlocks between them.

use crate::{
    error::TxError,
    transaction::TransactionRecord,
    tvar::{VarCore, VarState},
};
use log::*;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, MutexGuard,
    },
};

/// Number of commits that have published writes, across all engines. Incremented
/// while the committing transaction still holds its locks.
static GLOBAL_VERSION: AtomicU64 = AtomicU64::new(0);

pub(crate) fn global_version() -> u64 {
    GLOBAL_VERSION.load(Ordering::SeqCst)
}

/// Locks all variables used by the attempt. Every written variable is part of the
/// read set as well, commuted variables are not.
fn lock_tvars_used(record: &TransactionRecord) -> BTreeMap<u64, MutexGuard<'_, VarState>> {
    let mut used: BTreeMap<u64, &Arc<VarCore>> = record.reads.iter().map(|(id, entry)| (*id, &entry.core)).collect();
    used.extend(record.commutes.iter().map(|(id, (core, _))| (*id, core)));

    // BTreeMap iterates in ascending key order
    used.into_iter().map(|(id, core)| (id, core.lock())).collect()
}

/// Checks each variable of the read set against its committed version
fn validate(record: &TransactionRecord, locks: &BTreeMap<u64, MutexGuard<'_, VarState>>) -> Result<(), TxError> {
    for (id, entry) in &record.reads {
        match locks.get(id) {
            Some(state) if state.version == entry.version => {}
            _ => {
                debug!(
                    "TX({}): VALIDATION FAILED FOR TVAR({}), SEEN VERSION ({})",
                    record.id, id, entry.version
                );
                return Err(TxError::Conflict);
            }
        }
    }
    Ok(())
}

/// Validates and publishes the record. Returns the written variables, whose
/// observers still need to be notified.
pub(crate) fn commit(record: &TransactionRecord) -> Result<Vec<Arc<VarCore>>, TxError> {
    // a single read without writes is a consistent snapshot on its own
    if record.writes.is_empty() && record.commutes.is_empty() && record.reads.len() <= 1 {
        return Ok(Vec::new());
    }

    let mut locks = lock_tvars_used(record);
    validate(record, &locks)?;

    // commuting functions run on the latest committed values, all of them before
    // anything gets published
    let mut commuted = Vec::with_capacity(record.commutes.len());
    for (id, (core, functions)) in &record.commutes {
        if let Some(state) = locks.get(id) {
            let value = functions
                .iter()
                .fold(state.value.clone(), |value, function| function(&value));
            commuted.push((*id, core, value));
        }
    }

    let mut written = Vec::with_capacity(record.writes.len() + commuted.len());
    for (id, (core, value)) in &record.writes {
        if let Some(state) = locks.get_mut(id) {
            state.value = value.clone();
            state.version += 1;
            written.push(core.clone());
        }
    }
    for (id, core, value) in commuted {
        if let Some(state) = locks.get_mut(&id) {
            state.value = value;
            state.version += 1;
            written.push(core.clone());
        }
    }

    if !written.is_empty() {
        GLOBAL_VERSION.fetch_add(1, Ordering::SeqCst);
    }

    // release all locks before anyone gets woken up
    drop(locks);

    Ok(written)
}

/// Wakes the observers of all written variables
pub(crate) fn publish(written: &[Arc<VarCore>]) {
    for core in written {
        core.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Transaction, TVar};

    #[test]
    fn test_commit_publishes_all_writes() {
        let a = TVar::new(10usize);
        let b = TVar::new(20usize);

        let mut tx = Transaction::detached(1);
        let amount_a = tx.load(&a).expect("load failed");
        let amount_b = tx.load(&b).expect("load failed");
        tx.store(&a, amount_a - 5).expect("store failed");
        tx.store(&b, amount_b + 5).expect("store failed");

        let written = tx.with_record(|record| commit(record)).expect("commit failed");

        assert_eq!(written.len(), 2);
        assert_eq!((a.atomic_get(), a.version()), (5, 1));
        assert_eq!((b.atomic_get(), b.version()), (25, 1));
    }

    #[test]
    fn test_commit_detects_conflict() {
        let a = TVar::new(10usize);
        let b = TVar::new(0usize);

        let mut loser = Transaction::detached(2);
        let seen = loser.load(&a).expect("load failed");
        loser.store(&b, seen).expect("store failed");

        let mut winner = Transaction::detached(3);
        winner.store(&a, 11).expect("store failed");
        winner.with_record(|record| commit(record)).expect("commit failed");

        assert_eq!(loser.with_record(|record| commit(record)).err(), Some(TxError::Conflict));

        // nothing of the loser is visible
        assert_eq!((b.atomic_get(), b.version()), (0, 0));
        assert_eq!((a.atomic_get(), a.version()), (11, 1));
    }

    #[test]
    fn test_blind_write_conflicts_with_concurrent_writer() {
        let a = TVar::new(1usize);

        let mut first = Transaction::detached(4);
        first.store(&a, 2).expect("store failed");

        let mut second = Transaction::detached(5);
        second.store(&a, 3).expect("store failed");

        assert!(second.with_record(|record| commit(record)).is_ok());
        assert_eq!(first.with_record(|record| commit(record)).err(), Some(TxError::Conflict));
        assert_eq!(a.atomic_get(), 3);
    }

    #[test]
    fn test_commuted_variable_is_not_validated() {
        let counter = TVar::new(1usize);

        let mut commuter = Transaction::detached(6);
        commuter.commute(&counter, |v| v * 10).expect("commute failed");

        let mut writer = Transaction::detached(7);
        writer.store(&counter, 2).expect("store failed");
        writer.with_record(|record| commit(record)).expect("commit failed");

        let version = global_version();
        let written = commuter.with_record(|record| commit(record)).expect("commit failed");

        assert_eq!(written.len(), 1);
        assert_eq!((counter.atomic_get(), counter.version()), (20, 2));
        assert!(global_version() > version);
    }
}
