// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Defines how an atomic block behaves, when it is started while the current
/// thread is already running a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Propagation {
    /// Joins the enclosing transaction, or starts a new one if there is none.
    /// Joined blocks never commit on their own.
    #[default]
    Requires,

    /// Always starts an independent transaction that commits on its own. The
    /// enclosing transaction is suspended meanwhile.
    RequiresNew,

    /// Joins the enclosing transaction and fails with
    /// [`crate::StmError::NoActiveTransaction`] if there is none.
    Mandatory,

    /// Fails with [`crate::StmError::TransactionNotAllowed`] if there is an
    /// enclosing transaction, otherwise starts a new one.
    Never,
}

/// Settings of an atomic block.
///
/// ```
/// use stm_engine::{Propagation, TransactionConfig};
/// use std::time::Duration;
///
/// let config = TransactionConfig::default()
///     .max_retries(100)
///     .timeout(Duration::from_secs(1))
///     .propagation(Propagation::RequiresNew)
///     .family_name("transfer");
///
/// assert_eq!(config.get_max_retries(), Some(100));
/// ```
#[derive(Clone, Debug)]
pub struct TransactionConfig {
    max_retries: Option<usize>,
    timeout: Option<Duration>,
    readonly: bool,
    propagation: Propagation,
    family_name: Option<String>,
    backoff_trips: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            timeout: None,
            readonly: false,
            propagation: Propagation::Requires,
            family_name: None,
            backoff_trips: 7,
        }
    }
}

impl TransactionConfig {
    /// Caps the number of attempts. Conflicting commits as well as blocking retries count
    /// as an attempt. Once exceeded the block fails with [`crate::StmError::TooManyRetries`].
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Retries without limit. This is the default.
    pub fn unbounded_retries(mut self) -> Self {
        self.max_retries = None;
        self
    }

    /// Bounds the total time a block may spend blocked in retries
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Sets a name shown in log output
    pub fn family_name<S>(mut self, name: S) -> Self
    where
        S: Into<String>,
    {
        self.family_name = Some(name.into());
        self
    }

    /// Number of exponential spin rounds after conflicts, before the executor
    /// yields the thread instead
    pub fn backoff_trips(mut self, trips: usize) -> Self {
        self.backoff_trips = trips;
        self
    }

    pub fn get_max_retries(&self) -> Option<usize> {
        self.max_retries
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn get_propagation(&self) -> Propagation {
        self.propagation
    }

    pub fn get_family_name(&self) -> Option<&str> {
        self.family_name.as_deref()
    }

    pub fn get_backoff_trips(&self) -> usize {
        self.backoff_trips
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransactionConfig::default();

        assert_eq!(config.get_max_retries(), None);
        assert_eq!(config.get_timeout(), None);
        assert!(!config.is_readonly());
        assert_eq!(config.get_propagation(), Propagation::Requires);
        assert_eq!(config.get_family_name(), None);
    }

    #[test]
    fn test_builder_overrides() {
        let config = TransactionConfig::default()
            .max_retries(3)
            .unbounded_retries()
            .readonly(true)
            .family_name("audit");

        assert_eq!(config.get_max_retries(), None);
        assert!(config.is_readonly());
        assert_eq!(config.get_family_name(), Some("audit"));
    }
}
