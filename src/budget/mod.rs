//! Budget governance and rate limiting for external invocations.
//!
//! - [`ledger`]: scoped cost accounting with reservations
//! - [`limiter`]: per-channel token buckets and jittered backoff
//!
//! `BudgetGovernor` is the shared, lock-guarded handle the engine and the
//! dispatcher use. Every read-modify-write of the ledger happens under its
//! mutex and is persisted before the lock is released.

pub mod ledger;
pub mod limiter;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::errors::BudgetError;

pub use ledger::{BudgetLedger, BudgetScope, LedgerSnapshot, Reservation, ScopeBalance};
pub use limiter::{BackoffPolicy, RateLimitConfig, RateLimited, RateLimiter, TokenBucket};

/// Shared handle over the persisted ledger.
#[derive(Debug)]
pub struct BudgetGovernor {
    ledger: Mutex<BudgetLedger>,
    path: Option<PathBuf>,
}

impl BudgetGovernor {
    /// An in-memory governor, never persisted.
    pub fn in_memory(ledger: BudgetLedger) -> Self {
        Self {
            ledger: Mutex::new(ledger),
            path: None,
        }
    }

    /// A governor persisted to `path` after every mutation.
    pub fn persistent(path: &Path, ledger: BudgetLedger) -> Self {
        Self {
            ledger: Mutex::new(ledger),
            path: Some(path.to_path_buf()),
        }
    }

    fn with_ledger<T>(
        &self,
        f: impl FnOnce(&mut BudgetLedger) -> Result<T, BudgetError>,
    ) -> Result<T, BudgetError> {
        let mut ledger = self.ledger.lock().map_err(|_| BudgetError::LockPoisoned)?;
        let before = ledger.clone();
        let value = f(&mut ledger);
        if *ledger != before
            && let Some(path) = &self.path
            && let Err(e) = ledger.save(path)
        {
            *ledger = before;
            return Err(BudgetError::Persist(e));
        }
        value
    }

    pub fn can_spend(&self, scope: &BudgetScope, amount: f64) -> Result<bool, BudgetError> {
        let ledger = self.ledger.lock().map_err(|_| BudgetError::LockPoisoned)?;
        Ok(ledger.can_spend(scope, amount))
    }

    /// Reserve `count` invocation ceilings for a task, all or nothing.
    pub fn reserve_cohort(&self, task: &str, count: usize) -> Result<Vec<Reservation>, BudgetError> {
        self.with_ledger(|ledger| {
            let ceiling = ledger.invocation_limit;
            let result = ledger.reserve(task, &vec![ceiling; count]);
            if let Err(e) = &result {
                warn!(task, count, error = %e, "Budget reservation refused");
            }
            result
        })
    }

    /// Settle a reservation with the actual cost. Returns the amount recorded.
    pub fn settle(&self, reservation: &Reservation, actual: f64) -> Result<f64, BudgetError> {
        self.with_ledger(|ledger| {
            if actual > reservation.amount {
                warn!(
                    task = %reservation.task,
                    actual,
                    reserved = reservation.amount,
                    "Reported cost exceeds reservation, capping"
                );
            }
            ledger.settle(reservation, actual)
        })
    }

    pub fn release(&self, reservation: &Reservation) -> Result<(), BudgetError> {
        self.with_ledger(|ledger| {
            ledger.release(reservation);
            Ok(())
        })
    }

    pub fn record_spend(&self, scope: &BudgetScope, amount: f64) -> Result<(), BudgetError> {
        self.with_ledger(|ledger| ledger.record_spend(scope, amount))
    }

    pub fn raise_limit(&self, scope: &BudgetScope, new_limit: f64) -> Result<(), BudgetError> {
        self.with_ledger(|ledger| {
            ledger.raise_limit(scope, new_limit)?;
            info!(%scope, new_limit, "Budget limit raised");
            Ok(())
        })
    }

    pub fn snapshot(&self) -> Result<LedgerSnapshot, BudgetError> {
        let ledger = self.ledger.lock().map_err(|_| BudgetError::LockPoisoned)?;
        Ok(ledger.snapshot())
    }

    pub fn project_spent(&self) -> Result<f64, BudgetError> {
        let ledger = self.ledger.lock().map_err(|_| BudgetError::LockPoisoned)?;
        Ok(ledger.project.spent)
    }
}
