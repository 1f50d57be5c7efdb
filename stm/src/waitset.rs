// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Blocking retry support. A transaction that calls retry registers a [`Waiter`] with
//! every variable it has read and sleeps until one of them is written by a commit.
//! Waking up is only a hint: the transaction re-runs from scratch and may block again.

use crate::tvar::VarCore;
use log::*;
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

#[cfg(feature = "async")]
use futures::task::AtomicWaker;

/// A blocked transaction, observed by the variables of its read set
pub(crate) struct Waiter {
    fired: Mutex<bool>,
    signal: Condvar,

    #[cfg(feature = "async")]
    waker: AtomicWaker,
}

impl Waiter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: Mutex::new(false),
            signal: Condvar::new(),
            #[cfg(feature = "async")]
            waker: AtomicWaker::new(),
        })
    }

    fn fired(&self) -> MutexGuard<'_, bool> {
        self.fired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the waiter as fired and wakes the sleeping thread or task
    pub(crate) fn wake(&self) {
        *self.fired() = true;
        self.signal.notify_all();

        #[cfg(feature = "async")]
        self.waker.wake();
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.fired()
    }
}

/// The variables a retrying transaction has read, together with the versions it observed
#[derive(Default)]
pub(crate) struct WaitSet {
    entries: Vec<(Arc<VarCore>, u64)>,
}

impl WaitSet {
    pub(crate) fn push(&mut self, core: Arc<VarCore>, version: u64) {
        self.entries.push((core, version));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true`, if any variable has been committed since it was read
    pub(crate) fn changed(&self) -> bool {
        self.entries.iter().any(|(core, version)| core.version() != *version)
    }
}

/// Returned by [`Subscription::wait`], if the deadline passed without a relevant commit
#[derive(Debug)]
pub(crate) struct Elapsed;

/// A registered interest in the variables of a [`WaitSet`]. The registration is
/// removed from every variable when the subscription is dropped, no matter if the
/// wait finished, timed out or the waiting future got cancelled.
pub(crate) struct Subscription {
    waiter: Arc<Waiter>,
    wait_set: WaitSet,
}

impl Subscription {
    /// Registers a new waiter with all variables of `wait_set`
    pub(crate) fn register(wait_set: WaitSet) -> Self {
        let waiter = Waiter::new();

        // register first, then compare versions. A commit either happened before the
        // comparison and is detected by it, or it will find the waiter registered.
        for (core, _) in &wait_set.entries {
            core.subscribe(&waiter);
        }
        trace!("WAITSET: SUBSCRIBED TO ({}) VARIABLES", wait_set.len());

        Self { waiter, wait_set }
    }

    /// Blocks the calling thread until a variable of the wait set changes, or until
    /// `deadline` has passed.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> Result<(), Elapsed> {
        if self.wait_set.changed() {
            return Ok(());
        }

        let mut fired = self.waiter.fired();
        loop {
            if *fired {
                return Ok(());
            }

            fired = match deadline {
                None => self.signal_wait(fired),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Elapsed);
                    }
                    self.waiter
                        .signal
                        .wait_timeout(fired, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn signal_wait<'a>(&'a self, fired: MutexGuard<'a, bool>) -> MutexGuard<'a, bool> {
        self.waiter.signal.wait(fired).unwrap_or_else(PoisonError::into_inner)
    }

    /// Suspends the calling task until a variable of the wait set changes
    #[cfg(feature = "async")]
    pub(crate) async fn changed(&self) {
        use std::task::Poll;

        if self.wait_set.changed() {
            return;
        }

        futures::future::poll_fn(|cx| {
            self.waiter.waker.register(cx.waker());
            match self.waiter.is_fired() {
                true => Poll::Ready(()),
                false => Poll::Pending,
            }
        })
        .await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for (core, _) in &self.wait_set.entries {
            core.unsubscribe(&self.waiter);
        }
        trace!("WAITSET: UNSUBSCRIBED FROM ({}) VARIABLES", self.wait_set.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TVar;
    use std::time::Duration;

    fn wait_set_of(var: &TVar<usize>) -> WaitSet {
        let mut wait_set = WaitSet::default();
        wait_set.push(var.core.clone(), var.version());
        wait_set
    }

    #[test]
    fn test_subscription_deregisters_on_drop() {
        let var = TVar::new(0usize);

        let subscription = Subscription::register(wait_set_of(&var));
        assert_eq!(var.observer_count(), 1);

        drop(subscription);
        assert_eq!(var.observer_count(), 0);
    }

    #[test]
    fn test_wait_times_out() {
        let var = TVar::new(0usize);
        let subscription = Subscription::register(wait_set_of(&var));

        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(subscription.wait(Some(deadline)).is_err());
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let var = TVar::new(0usize);
        let subscription = Subscription::register(wait_set_of(&var));

        let core = var.core.clone();
        let notifier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            core.notify();
        });

        assert!(subscription.wait(None).is_ok());
        assert!(subscription.waiter.is_fired());
        notifier.join().expect("Failed to join notifier thread");
    }
}
