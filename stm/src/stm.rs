// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    breaker::BusyBreaker,
    commit::{commit, publish},
    config::{Propagation, TransactionConfig},
    context::{self, Binding, SharedRecord},
    error::{Abort, StmError, StmResult, TxError},
    transaction::{Status, Transaction, TransactionRecord},
    tvar::TVar,
    waitset::{Subscription, WaitSet},
};
use log::*;
use std::{
    any::Any,
    cell::RefCell,
    convert::Infallible,
    rc::Rc,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Counters of an [`Stm`] instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Transaction ids handed out, one per top level block
    pub transactions: usize,

    /// Attempts started
    pub attempts: usize,

    /// Successful commits
    pub commits: usize,

    /// Attempts discarded because of a conflict
    pub conflicts: usize,

    /// Attempts that ended in a blocking retry
    pub blocking_retries: usize,
}

#[derive(Default)]
struct Counters {
    attempts: AtomicUsize,
    commits: AtomicUsize,
    conflicts: AtomicUsize,
    blocking_retries: AtomicUsize,
}

/// What a single attempt ended with
enum Outcome<R, E> {
    Committed(R),
    Conflict,
    Blocked(WaitSet),
    Failed(StmError<E>),
}

/// Per block bookkeeping of the retry loop
struct Schedule {
    tx_id: usize,
    attempt: usize,
    started: Instant,
    breaker: BusyBreaker,
}

impl Schedule {
    fn deadline(&self, config: &TransactionConfig) -> Option<Instant> {
        config.get_timeout().map(|timeout| self.started + timeout)
    }

    /// Fails once the configured number of retries has been used up
    fn check_retries<E>(&self, config: &TransactionConfig) -> Result<(), StmError<E>> {
        match config.get_max_retries() {
            Some(max) if self.attempt > max => {
                debug!("TX({}): GIVING UP AFTER ({}) ATTEMPTS", self.tx_id, self.attempt);
                Err(StmError::TooManyRetries { attempts: self.attempt })
            }
            _ => Ok(()),
        }
    }
}

/// The transactional memory engine. An [`Stm`] runs atomic blocks against
/// [`TVar`]s. Cloning an [`Stm`] yields another handle to the same engine.
///
/// ```
/// use stm_engine::Stm;
///
/// let stm = Stm::default();
/// let account = stm.create(10usize);
///
/// let balance = stm
///     .atomically(|tx| {
///         let balance = tx.load(&account)? + 5;
///         tx.store(&account, balance)?;
///         Ok(balance)
///     })
///     .expect("transaction failed");
///
/// assert_eq!(balance, 15);
/// assert_eq!(account.atomic_get(), 15);
/// ```
#[derive(Clone, Default)]
pub struct Stm {
    // Global clock giving the number of transactions that have committed writes
    clock: Arc<AtomicUsize>,
    transaction_ids: Arc<AtomicUsize>,
    counters: Arc<Counters>,
    config: Arc<TransactionConfig>,
}

impl Stm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine using `config` for every block not run with its own configuration
    pub fn with_config(config: TransactionConfig) -> Self {
        Self {
            config: Arc::new(config),
            ..Self::default()
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn get_clock(&self) -> usize {
        self.clock.load(Ordering::SeqCst)
    }

    fn increment_clock(&self) -> usize {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn increment_tx_ids(&self) -> usize {
        self.transaction_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn stats(&self) -> Stats {
        Stats {
            transactions: self.transaction_ids.load(Ordering::SeqCst),
            attempts: self.counters.attempts.load(Ordering::SeqCst),
            commits: self.counters.commits.load(Ordering::SeqCst),
            conflicts: self.counters.conflicts.load(Ordering::SeqCst),
            blocking_retries: self.counters.blocking_retries.load(Ordering::SeqCst),
        }
    }

    /// This will create a new transactional variable [`TVar`].
    pub fn create<T>(&self, val: T) -> TVar<T>
    where
        T: Any + Clone + Send + Sync,
    {
        TVar::new(val)
    }

    /// Runs `body` atomically. Conflicting attempts are retried silently, a blocking
    /// retry suspends the thread until a variable read by the attempt changes.
    pub fn atomically<R, F>(&self, mut body: F) -> Result<R, StmError>
    where
        F: FnMut(&mut Transaction) -> Result<R, TxError>,
    {
        self.try_atomically::<R, Infallible, _>(|tx| body(tx).map_err(Abort::Tx))
    }

    /// Runs `body` atomically. A domain failure raised by the body aborts the
    /// transaction and is returned as [`StmError::Failure`], it is never retried.
    pub fn try_atomically<R, E, F>(&self, body: F) -> Result<R, StmError<E>>
    where
        F: FnMut(&mut Transaction) -> StmResult<R, E>,
    {
        let config = self.config.clone();
        self.atomically_with(&config, body)
    }

    /// Runs `body` atomically using the given configuration instead of the engine's
    pub fn atomically_with<R, E, F>(&self, config: &TransactionConfig, mut body: F) -> Result<R, StmError<E>>
    where
        F: FnMut(&mut Transaction) -> StmResult<R, E>,
    {
        match (config.get_propagation(), context::current()) {
            (Propagation::Requires | Propagation::Mandatory, Some(enclosing)) => {
                return self.join(enclosing, &mut body);
            }
            (Propagation::Mandatory, None) => return Err(StmError::NoActiveTransaction),
            (Propagation::Never, Some(_)) => return Err(StmError::TransactionNotAllowed),
            _ => {}
        }

        let mut schedule = self.schedule(config);
        let deadline = schedule.deadline(config);

        loop {
            schedule.attempt += 1;
            match self.attempt(&schedule, config, &mut body) {
                Outcome::Committed(result) => return Ok(result),
                Outcome::Failed(error) => return Err(error),
                Outcome::Conflict => {
                    schedule.check_retries(config)?;
                    schedule.breaker.backoff();
                }
                Outcome::Blocked(wait_set) => {
                    schedule.check_retries(config)?;

                    let subscription = Subscription::register(wait_set);
                    if subscription.wait(deadline).is_err() {
                        return Err(self.timed_out(&schedule, config));
                    }
                    debug!("TX({}): WOKEN UP", schedule.tx_id);
                    schedule.breaker.reset();
                }
            }
        }
    }

    /// Runs `body` atomically without blocking the thread on retries. A blocking retry
    /// suspends the returned future instead. Dropping the future while it is suspended
    /// deregisters it from all variables it waits for.
    ///
    /// Async blocks always start their own transaction.
    #[cfg(feature = "async")]
    pub async fn atomically_async<R, E, F>(&self, mut body: F) -> Result<R, StmError<E>>
    where
        F: FnMut(&mut Transaction) -> StmResult<R, E> + Send,
        R: Send,
        E: Send,
    {
        let config = self.config.clone();
        let mut schedule = self.schedule(&config);
        let deadline = schedule.deadline(&config);

        loop {
            schedule.attempt += 1;
            let wait_set = match self.attempt(&schedule, &config, &mut body) {
                Outcome::Committed(result) => return Ok(result),
                Outcome::Failed(error) => return Err(error),
                Outcome::Conflict => {
                    schedule.check_retries(&config)?;
                    schedule.breaker.backoff();
                    continue;
                }
                Outcome::Blocked(wait_set) => wait_set,
            };
            schedule.check_retries(&config)?;

            let subscription = Subscription::register(wait_set);
            match deadline {
                None => subscription.changed().await,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if tokio::time::timeout(remaining, subscription.changed()).await.is_err() {
                        return Err(self.timed_out(&schedule, &config));
                    }
                }
            }
            debug!("TX({}): WOKEN UP", schedule.tx_id);
            schedule.breaker.reset();
        }
    }

    fn schedule(&self, config: &TransactionConfig) -> Schedule {
        Schedule {
            tx_id: self.increment_tx_ids(),
            attempt: 0,
            started: Instant::now(),
            breaker: BusyBreaker::new(config.get_backoff_trips()),
        }
    }

    fn timed_out<E>(&self, schedule: &Schedule, config: &TransactionConfig) -> StmError<E> {
        let timeout = config.get_timeout().unwrap_or(Duration::ZERO);
        debug!("TX({}): TIMED OUT AFTER {:?}", schedule.tx_id, timeout);
        StmError::TransactionTimeout(timeout)
    }

    /// Runs `body` inside the enclosing transaction. Nothing is committed here, engine
    /// signals are left on the shared record for the enclosing executor to act on.
    fn join<R, E, F>(&self, enclosing: SharedRecord, body: &mut F) -> Result<R, StmError<E>>
    where
        F: FnMut(&mut Transaction) -> StmResult<R, E>,
    {
        let mut tx = Transaction::from_record(enclosing.clone());
        trace!("TX({}): JOINED BY NESTED BLOCK", tx.id());

        match body(&mut tx) {
            Ok(result) => Ok(result),
            Err(Abort::Failure(error)) => Err(StmError::Failure(error)),
            Err(Abort::Nested(error)) => Err(error.widen()),
            Err(Abort::Tx(TxError::NoActiveTransaction)) => Err(StmError::NoActiveTransaction),
            Err(Abort::Tx(TxError::ReadonlyTransaction)) => Err(StmError::ReadonlyTransaction),
            Err(Abort::Tx(signal)) => {
                enclosing.borrow_mut().interrupt(signal);
                Err(StmError::Interrupted)
            }
        }
    }

    /// Runs a single attempt with a fresh record and tries to commit it
    fn attempt<R, E, F>(&self, schedule: &Schedule, config: &TransactionConfig, body: &mut F) -> Outcome<R, E>
    where
        F: FnMut(&mut Transaction) -> StmResult<R, E>,
    {
        self.counters.attempts.fetch_add(1, Ordering::SeqCst);
        trace!(
            "TX({}): START ATTEMPT ({}) OF ({}). GLOBAL VERSION ({})",
            schedule.tx_id,
            schedule.attempt,
            config.get_family_name().unwrap_or("anonymous"),
            self.get_clock()
        );

        let record: SharedRecord = Rc::new(RefCell::new(TransactionRecord::new(
            schedule.tx_id,
            schedule.attempt,
            config.is_readonly(),
        )));

        let result = {
            let _binding = Binding::bind(&record);
            let mut tx = Transaction::from_record(record.clone());
            body(&mut tx)
        };

        let mut record = record.borrow_mut();

        // engine signals left on the record win over whatever the body returned
        let result = match record.take_interrupt() {
            Some(signal) => Err(Abort::Tx(signal)),
            None => result,
        };

        let mut written = Vec::new();
        let outcome = match result {
            Err(Abort::Tx(TxError::Retry)) => {
                let wait_set = record.abort_into_wait_set();
                if wait_set.is_empty() {
                    debug!("TX({}): RETRY WITHOUT ANY READS", schedule.tx_id);
                    Outcome::Failed(StmError::InvalidRetry)
                } else {
                    self.counters.blocking_retries.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        "TX({}): BLOCKING RETRY ON ({}) TVARS",
                        schedule.tx_id,
                        wait_set.len()
                    );
                    Outcome::Blocked(wait_set)
                }
            }
            Err(Abort::Tx(TxError::Conflict)) => self.conflict(&mut record),
            Err(Abort::Tx(TxError::ReadonlyTransaction)) => {
                record.abort();
                Outcome::Failed(StmError::ReadonlyTransaction)
            }
            Err(Abort::Tx(TxError::NoActiveTransaction)) => {
                record.abort();
                Outcome::Failed(StmError::NoActiveTransaction)
            }
            // a failure caused by a stale snapshot is a conflict
            Err(Abort::Failure(_)) if !record.is_consistent() => self.conflict(&mut record),
            Err(Abort::Failure(error)) => {
                debug!("TX({}): ABORTED BY BODY", schedule.tx_id);
                record.abort();
                Outcome::Failed(StmError::Failure(error))
            }
            Err(Abort::Nested(error)) => {
                debug!("TX({}): ABORTED BY NESTED BLOCK: {}", schedule.tx_id, error);
                record.abort();
                Outcome::Failed(error.widen())
            }
            Ok(result) => match commit(&record) {
                Ok(published) => {
                    record.set_status(Status::Committed);
                    record.writes.clear();
                    record.reads.clear();
                    record.commutes.clear();
                    written = published;

                    Outcome::Committed(result)
                }
                Err(_) => self.conflict(&mut record),
            },
        };

        let tasks = record.take_tasks();
        drop(record);

        if let Outcome::Committed(_) = outcome {
            if !written.is_empty() {
                let version = self.increment_clock();
                trace!("TX({}): COMMITTED. GLOBAL VERSION ({})", schedule.tx_id, version);
            }
            self.counters.commits.fetch_add(1, Ordering::SeqCst);
            publish(&written);
        }

        // lifecycle tasks run without any transaction bound to the thread
        for task in tasks {
            task();
        }

        outcome
    }

    fn conflict<R, E>(&self, record: &mut TransactionRecord) -> Outcome<R, E> {
        debug!("TX({}): CONFLICT IN ATTEMPT ({}). RETRYING", record.id, record.attempt);
        self.counters.conflicts.fetch_add(1, Ordering::SeqCst);
        record.abort();
        Outcome::Conflict
    }
}
