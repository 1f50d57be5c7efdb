// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Binds the record of the running attempt to the current thread, so that blocks
//! started from inside a transaction body can join it and the free accessors
//! ([`crate::load`], [`crate::store`], [`crate::retry`]) can find it.

use crate::transaction::TransactionRecord;
use std::{cell::RefCell, rc::Rc};

pub(crate) type SharedRecord = Rc<RefCell<TransactionRecord>>;

thread_local! {
    static ACTIVE: RefCell<Option<SharedRecord>> = RefCell::new(None);
}

/// Returns the record bound to the current thread, if any
pub(crate) fn current() -> Option<SharedRecord> {
    ACTIVE.with(|active| active.borrow().clone())
}

/// Keeps a record bound to the current thread for as long as it lives. Dropping the
/// binding restores whatever was bound before, also when the body panics.
pub(crate) struct Binding {
    previous: Option<SharedRecord>,
}

impl Binding {
    pub(crate) fn bind(record: &SharedRecord) -> Self {
        let previous = ACTIVE.with(|active| active.replace(Some(record.clone())));
        Self { previous }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ACTIVE.with(|active| *active.borrow_mut() = previous);
    }
}
