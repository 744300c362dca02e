//! Fault-injecting storage wrapper.

use crate::error::{QuillError, Result};
use crate::storage::LogStorage;
use crate::types::Position;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// When [`FaultyStorage`] makes an append fail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaultPlan {
    /// Never fail.
    None,
    /// Fail only the n-th append attempt (1-based).
    FailNth(u64),
    /// Fail the n-th append attempt and every one after it.
    FailFrom(u64),
    /// Fail each append with the given probability (0.0 - 1.0).
    Random {
        /// Probability of a failure.
        probability: f64,
        /// Random seed for reproducibility.
        seed: u64,
    },
    /// Report a wrong position for the n-th append after storing it.
    WrongPositionAt(u64),
}

/// Wraps a [`LogStorage`] and fails appends according to a [`FaultPlan`].
///
/// Deletes fail while [`set_fail_deletes`](Self::set_fail_deletes) is on.
///
/// # Example
///
/// ```
/// use quill_core::storage::{LogStorage, MemoryLogStorage};
/// use quill_core::testing::{FaultPlan, FaultyStorage};
///
/// let storage = FaultyStorage::new(MemoryLogStorage::new(), FaultPlan::FailNth(2));
/// assert!(storage.append(b"a").is_ok());
/// assert!(storage.append(b"b").is_err());
/// assert!(storage.append(b"c").is_ok());
/// assert_eq!(storage.attempts(), 3);
/// ```
pub struct FaultyStorage<S> {
    inner: S,
    plan: Mutex<FaultPlan>,
    rng: Mutex<StdRng>,
    attempts: AtomicU64,
    failures: AtomicU64,
    fail_deletes: AtomicBool,
}

impl<S: LogStorage> FaultyStorage<S> {
    /// Wrap `inner` with the given plan.
    pub fn new(inner: S, plan: FaultPlan) -> Self {
        let seed = match plan {
            FaultPlan::Random { seed, .. } => seed,
            _ => 0,
        };
        Self {
            inner,
            plan: Mutex::new(plan),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            fail_deletes: AtomicBool::new(false),
        }
    }

    /// Replace the plan. Attempt counting continues.
    pub fn set_plan(&self, plan: FaultPlan) {
        if let FaultPlan::Random { seed, .. } = plan {
            *self.rng.lock() = StdRng::seed_from_u64(seed);
        }
        *self.plan.lock() = plan;
    }

    /// Make [`delete`](LogStorage::delete) fail without touching the data.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Number of append attempts so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of injected failures so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// The wrapped storage.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn should_fail(&self, attempt: u64) -> bool {
        match *self.plan.lock() {
            FaultPlan::None | FaultPlan::WrongPositionAt(_) => false,
            FaultPlan::FailNth(n) => attempt == n,
            FaultPlan::FailFrom(n) => attempt >= n,
            FaultPlan::Random { probability, .. } => {
                self.rng.lock().r#gen::<f64>() < probability
            }
        }
    }
}

impl<S: LogStorage> LogStorage for FaultyStorage<S> {
    fn append(&self, frame: &[u8]) -> Result<Position> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.should_fail(attempt) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            let position = self.inner.last_position()?.next();
            tracing::debug!(attempt, position = %position, "Injecting storage append failure");
            return Err(QuillError::StorageAppend {
                position,
                cause: format!("injected failure on attempt {}", attempt),
            });
        }

        let position = self.inner.append(frame)?;
        if *self.plan.lock() == FaultPlan::WrongPositionAt(attempt) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Ok(Position::new(position.as_u64() + 1));
        }
        Ok(position)
    }

    fn read(&self, position: Position) -> Result<Option<Vec<u8>>> {
        self.inner.read(position)
    }

    fn last_position(&self) -> Result<Position> {
        self.inner.last_position()
    }

    fn first_position(&self) -> Result<Position> {
        self.inner.first_position()
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn reopen(&self) -> Result<()> {
        self.inner.reopen()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn delete(&self) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            tracing::debug!("Injecting storage delete failure");
            return Err(QuillError::Io {
                path: PathBuf::from("faulty-storage"),
                cause: "injected delete failure".to_string(),
            });
        }
        self.inner.delete()
    }
}

impl<S> std::fmt::Debug for FaultyStorage<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyStorage")
            .field("plan", &*self.plan.lock())
            .field("attempts", &self.attempts.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStorage;

    #[test]
    fn fail_from_keeps_failing() {
        let storage = FaultyStorage::new(MemoryLogStorage::new(), FaultPlan::FailFrom(3));
        assert!(storage.append(b"1").is_ok());
        assert!(storage.append(b"2").is_ok());
        for _ in 0..3 {
            let err = storage.append(b"x").unwrap_err();
            assert!(err.is_fatal());
            assert!(matches!(
                err,
                QuillError::StorageAppend { position, .. } if position == Position::new(3)
            ));
        }
        assert_eq!(storage.failures(), 3);
        assert_eq!(storage.inner().len(), 2);
    }

    #[test]
    fn random_plan_is_reproducible() {
        let outcomes = |seed| {
            let storage = FaultyStorage::new(
                MemoryLogStorage::new(),
                FaultPlan::Random {
                    probability: 0.5,
                    seed,
                },
            );
            (0..32)
                .map(|_| storage.append(b"x").is_ok())
                .collect::<Vec<_>>()
        };
        assert_eq!(outcomes(7), outcomes(7));
        assert!(outcomes(7).contains(&false));
    }

    #[test]
    fn injected_delete_failure_keeps_data() {
        let storage = FaultyStorage::new(MemoryLogStorage::new(), FaultPlan::None);
        storage.append(b"a").unwrap();
        storage.set_fail_deletes(true);
        assert!(matches!(storage.delete(), Err(QuillError::Io { .. })));
        assert_eq!(storage.inner().len(), 1);

        storage.set_fail_deletes(false);
        storage.delete().unwrap();
        assert_eq!(storage.last_position().unwrap(), Position::NONE);
    }

    #[test]
    fn wrong_position_is_reported() {
        let storage = FaultyStorage::new(MemoryLogStorage::new(), FaultPlan::WrongPositionAt(2));
        assert_eq!(storage.append(b"a").unwrap(), Position::new(1));
        assert_eq!(storage.append(b"b").unwrap(), Position::new(3));
        assert_eq!(storage.last_position().unwrap(), Position::new(2));
    }
}
