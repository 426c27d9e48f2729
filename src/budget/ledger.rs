//! Scoped cost ledger.
//!
//! Three scopes are tracked: the project, each task, and a per-invocation
//! ceiling. A task spend also counts against the project. `spent` only ever
//! grows through `record_spend`, which re-checks admission, so `spent <= limit`
//! holds for every scope after every step.
//!
//! Reservations hold back budget for in-flight invocations so that concurrent
//! cohorts cannot over-commit. They are not persisted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::errors::BudgetError;

const EPSILON: f64 = 1e-9;

pub const DEFAULT_PROJECT_LIMIT: f64 = 50.0;
pub const DEFAULT_TASK_LIMIT: f64 = 5.0;
pub const DEFAULT_INVOCATION_LIMIT: f64 = 1.0;

/// A ledger scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BudgetScope {
    Project,
    Task(String),
    /// A single invocation belonging to a task.
    Invocation { task: String },
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetScope::Project => write!(f, "project"),
            BudgetScope::Task(id) => write!(f, "task:{}", id),
            BudgetScope::Invocation { task } => write!(f, "invocation:{}", task),
        }
    }
}

impl std::str::FromStr for BudgetScope {
    type Err = BudgetError;

    /// Parses `project`, `task:<id>` or `invocation:<task>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("project") {
            return Ok(BudgetScope::Project);
        }
        match s.split_once(':') {
            Some(("task", id)) if !id.is_empty() => Ok(BudgetScope::Task(id.to_string())),
            Some(("invocation", task)) if !task.is_empty() => Ok(BudgetScope::Invocation {
                task: task.to_string(),
            }),
            _ => Err(BudgetError::UnknownScope(s.to_string())),
        }
    }
}

/// Limit and running totals for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopeBalance {
    pub limit: f64,
    pub spent: f64,
    #[serde(skip)]
    pub reserved: f64,
}

impl ScopeBalance {
    pub fn new(limit: f64) -> Self {
        Self {
            limit,
            spent: 0.0,
            reserved: 0.0,
        }
    }

    /// Unreserved headroom, never negative.
    pub fn remaining(&self) -> f64 {
        (self.limit - self.spent - self.reserved).max(0.0)
    }

    fn admits(&self, amount: f64) -> bool {
        self.spent + self.reserved + amount <= self.limit + EPSILON
    }
}

/// Budget held back for one in-flight invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: u64,
    pub task: String,
    pub amount: f64,
}

/// Serializable view of the ledger, attached to budget escalations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub project: ScopeBalance,
    pub tasks: BTreeMap<String, ScopeBalance>,
    pub invocation_limit: f64,
    pub halted: bool,
    pub reserved: f64,
}

/// The cost ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub project: ScopeBalance,
    #[serde(default)]
    pub tasks: BTreeMap<String, ScopeBalance>,
    pub default_task_limit: f64,
    pub invocation_limit: f64,
    /// Set by a refused project admission; cleared only by `raise_limit`.
    #[serde(default)]
    pub halted: bool,
    #[serde(skip)]
    reservations: BTreeMap<u64, Reservation>,
    #[serde(skip)]
    next_reservation: u64,
}

impl Default for BudgetLedger {
    fn default() -> Self {
        Self::new(
            DEFAULT_PROJECT_LIMIT,
            DEFAULT_TASK_LIMIT,
            DEFAULT_INVOCATION_LIMIT,
        )
    }
}

fn check_amount(amount: f64) -> Result<(), BudgetError> {
    if amount.is_finite() && amount >= 0.0 {
        Ok(())
    } else {
        Err(BudgetError::InvalidAmount(amount))
    }
}

impl BudgetLedger {
    pub fn new(project_limit: f64, task_limit: f64, invocation_limit: f64) -> Self {
        Self {
            project: ScopeBalance::new(project_limit),
            tasks: BTreeMap::new(),
            default_task_limit: task_limit,
            invocation_limit,
            halted: false,
            reservations: BTreeMap::new(),
            next_reservation: 1,
        }
    }

    /// Load from disk, or start fresh with the given limits when no file exists.
    pub fn load_or_new(path: &Path, project: f64, task: f64, invocation: f64) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(project, task, invocation));
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read budget ledger: {}", path.display()))?;
        let mut ledger: BudgetLedger = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse budget ledger: {}", path.display()))?;
        ledger.next_reservation = 1;
        Ok(ledger)
    }

    /// Atomically persist the ledger (temp file, fsync, rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize budget ledger")?;
        crate::checkpoint::write_atomic(path, &json)
            .with_context(|| format!("Failed to write budget ledger: {}", path.display()))
    }

    fn task_balance(&self, task: &str) -> ScopeBalance {
        self.tasks
            .get(task)
            .copied()
            .unwrap_or_else(|| ScopeBalance::new(self.default_task_limit))
    }

    /// Pure admission check, accounting for outstanding reservations.
    pub fn can_spend(&self, scope: &BudgetScope, amount: f64) -> bool {
        self.check(scope, amount).is_ok()
    }

    /// Admission check with the refusing scope in the error.
    pub fn check(&self, scope: &BudgetScope, amount: f64) -> Result<(), BudgetError> {
        check_amount(amount)?;
        if self.halted {
            return Err(BudgetError::Halted);
        }
        let exceeded = |scope: String, balance: &ScopeBalance| BudgetError::Exceeded {
            scope,
            requested: amount,
            remaining: balance.remaining(),
        };
        if let BudgetScope::Invocation { .. } = scope
            && amount > self.invocation_limit + EPSILON
        {
            return Err(BudgetError::Exceeded {
                scope: scope.to_string(),
                requested: amount,
                remaining: self.invocation_limit,
            });
        }
        match scope {
            BudgetScope::Task(task) | BudgetScope::Invocation { task } => {
                let balance = self.task_balance(task);
                if !balance.admits(amount) {
                    return Err(exceeded(format!("task:{}", task), &balance));
                }
            }
            BudgetScope::Project => {}
        }
        if !self.project.admits(amount) {
            return Err(exceeded("project".to_string(), &self.project));
        }
        Ok(())
    }

    /// Record a completed spend. The only way `spent` increases.
    pub fn record_spend(&mut self, scope: &BudgetScope, amount: f64) -> Result<(), BudgetError> {
        self.check(scope, amount)?;
        if let BudgetScope::Task(task) | BudgetScope::Invocation { task } = scope {
            let limit = self.default_task_limit;
            self.tasks
                .entry(task.clone())
                .or_insert_with(|| ScopeBalance::new(limit))
                .spent += amount;
        }
        self.project.spent += amount;
        Ok(())
    }

    /// Reserve one invocation ceiling per entry in `amounts`, all or nothing.
    ///
    /// A refusal at project scope halts the project.
    pub fn reserve(&mut self, task: &str, amounts: &[f64]) -> Result<Vec<Reservation>, BudgetError> {
        for amount in amounts {
            check_amount(*amount)?;
            if *amount > self.invocation_limit + EPSILON {
                return Err(BudgetError::Exceeded {
                    scope: format!("invocation:{}", task),
                    requested: *amount,
                    remaining: self.invocation_limit,
                });
            }
        }
        let total: f64 = amounts.iter().sum();
        if let Err(e) = self.check(&BudgetScope::Task(task.to_string()), total) {
            if matches!(&e, BudgetError::Exceeded { scope, .. } if scope == "project") {
                self.halted = true;
            }
            return Err(e);
        }

        let limit = self.default_task_limit;
        let mut reservations = Vec::with_capacity(amounts.len());
        for amount in amounts {
            let id = self.next_reservation;
            self.next_reservation += 1;
            self.tasks
                .entry(task.to_string())
                .or_insert_with(|| ScopeBalance::new(limit))
                .reserved += amount;
            self.project.reserved += amount;
            let reservation = Reservation {
                id,
                task: task.to_string(),
                amount: *amount,
            };
            self.reservations.insert(id, reservation.clone());
            reservations.push(reservation);
        }
        Ok(reservations)
    }

    fn unreserve(&mut self, reservation: &Reservation) -> bool {
        if self.reservations.remove(&reservation.id).is_none() {
            return false;
        }
        if let Some(task) = self.tasks.get_mut(&reservation.task) {
            task.reserved = (task.reserved - reservation.amount).max(0.0);
        }
        self.project.reserved = (self.project.reserved - reservation.amount).max(0.0);
        true
    }

    /// Release a reservation and record the actual cost, capped at the reservation.
    ///
    /// Returns the amount recorded.
    pub fn settle(&mut self, reservation: &Reservation, actual: f64) -> Result<f64, BudgetError> {
        check_amount(actual)?;
        if !self.unreserve(reservation) {
            return Ok(0.0);
        }
        let amount = actual.min(reservation.amount);
        let was_halted = self.halted;
        self.halted = false;
        let result = self.record_spend(
            &BudgetScope::Invocation {
                task: reservation.task.clone(),
            },
            amount,
        );
        self.halted = was_halted;
        result.map(|_| amount)
    }

    /// Drop a reservation without spending.
    pub fn release(&mut self, reservation: &Reservation) {
        self.unreserve(reservation);
    }

    /// Raise (or set) a limit. Clears the project hard stop.
    pub fn raise_limit(&mut self, scope: &BudgetScope, new_limit: f64) -> Result<(), BudgetError> {
        check_amount(new_limit)?;
        match scope {
            BudgetScope::Project => {
                if new_limit + EPSILON < self.project.spent {
                    return Err(BudgetError::LimitBelowSpent {
                        scope: scope.to_string(),
                        limit: new_limit,
                        spent: self.project.spent,
                    });
                }
                self.project.limit = new_limit;
                self.halted = false;
            }
            BudgetScope::Task(task) => {
                let mut balance = self.task_balance(task);
                if new_limit + EPSILON < balance.spent {
                    return Err(BudgetError::LimitBelowSpent {
                        scope: scope.to_string(),
                        limit: new_limit,
                        spent: balance.spent,
                    });
                }
                balance.limit = new_limit;
                self.tasks.insert(task.clone(), balance);
            }
            BudgetScope::Invocation { .. } => {
                self.invocation_limit = new_limit;
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            project: self.project,
            tasks: self.tasks.clone(),
            invocation_limit: self.invocation_limit,
            halted: self.halted,
            reserved: self.project.reserved,
        }
    }

    pub fn outstanding_reservations(&self) -> usize {
        self.reservations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn task(id: &str) -> BudgetScope {
        BudgetScope::Task(id.to_string())
    }

    fn invocation(id: &str) -> BudgetScope {
        BudgetScope::Invocation {
            task: id.to_string(),
        }
    }

    #[test]
    fn test_scope_parse_and_display() {
        assert_eq!("project".parse::<BudgetScope>().unwrap(), BudgetScope::Project);
        assert_eq!("task:verifying".parse::<BudgetScope>().unwrap(), task("verifying"));
        assert_eq!(invocation("planning").to_string(), "invocation:planning");
        assert!("team:x".parse::<BudgetScope>().is_err());
        assert!("task:".parse::<BudgetScope>().is_err());
    }

    #[test]
    fn test_project_near_limit_rejects_without_spending() {
        let mut ledger = BudgetLedger::new(10.0, 100.0, 1.0);
        ledger.record_spend(&BudgetScope::Project, 9.80).unwrap();

        assert!(!ledger.can_spend(&BudgetScope::Project, 0.50));
        let err = ledger.record_spend(&BudgetScope::Project, 0.50).unwrap_err();
        assert!(matches!(err, BudgetError::Exceeded { ref scope, .. } if scope == "project"));
        assert!((ledger.project.spent - 9.80).abs() < 1e-9);
    }

    #[test]
    fn test_task_spend_counts_against_project() {
        let mut ledger = BudgetLedger::new(3.0, 2.0, 1.0);
        ledger.record_spend(&task("a"), 1.5).unwrap();
        ledger.record_spend(&invocation("b"), 1.0).unwrap();
        assert!((ledger.project.spent - 2.5).abs() < 1e-9);
        assert!(!ledger.can_spend(&task("a"), 0.6));
        assert!(!ledger.can_spend(&task("c"), 0.6));
        assert!(ledger.can_spend(&task("c"), 0.5));
    }

    #[test]
    fn test_invocation_ceiling() {
        let ledger = BudgetLedger::new(10.0, 10.0, 0.25);
        assert!(ledger.can_spend(&invocation("a"), 0.25));
        assert!(!ledger.can_spend(&invocation("a"), 0.26));
    }

    #[test]
    fn test_invalid_amounts_rejected() {
        let mut ledger = BudgetLedger::default();
        assert!(matches!(
            ledger.record_spend(&BudgetScope::Project, -1.0),
            Err(BudgetError::InvalidAmount(_))
        ));
        assert!(!ledger.can_spend(&BudgetScope::Project, f64::NAN));
    }

    #[test]
    fn test_reserve_counts_toward_admission() {
        let mut ledger = BudgetLedger::new(2.0, 10.0, 1.0);
        let held = ledger.reserve("verifying", &[1.0, 1.0]).unwrap();
        assert_eq!(held.len(), 2);
        assert!(!ledger.can_spend(&BudgetScope::Project, 0.1));

        let recorded = ledger.settle(&held[0], 0.4).unwrap();
        assert!((recorded - 0.4).abs() < 1e-9);
        ledger.release(&held[1]);
        assert_eq!(ledger.outstanding_reservations(), 0);
        assert!((ledger.project.spent - 0.4).abs() < 1e-9);
        assert!(ledger.can_spend(&BudgetScope::Project, 1.6));
    }

    #[test]
    fn test_settle_caps_at_reservation_and_is_idempotent() {
        let mut ledger = BudgetLedger::new(10.0, 10.0, 1.0);
        let held = ledger.reserve("implementing", &[1.0]).unwrap();
        assert!((ledger.settle(&held[0], 3.0).unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(ledger.settle(&held[0], 1.0).unwrap(), 0.0);
        assert!((ledger.project.spent - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_project_refusal_halts_until_raised() {
        let mut ledger = BudgetLedger::new(1.0, 10.0, 1.0);
        ledger.record_spend(&BudgetScope::Project, 0.8).unwrap();
        assert!(ledger.reserve("verifying", &[0.5]).is_err());
        assert!(ledger.halted);
        assert!(matches!(
            ledger.check(&BudgetScope::Project, 0.01),
            Err(BudgetError::Halted)
        ));

        ledger.raise_limit(&BudgetScope::Project, 5.0).unwrap();
        assert!(!ledger.halted);
        assert!(ledger.reserve("verifying", &[0.5]).is_ok());
    }

    #[test]
    fn test_task_refusal_does_not_halt() {
        let mut ledger = BudgetLedger::new(10.0, 0.5, 1.0);
        assert!(ledger.reserve("verifying", &[1.0]).is_err());
        assert!(!ledger.halted);
    }

    #[test]
    fn test_raise_limit_below_spent_rejected() {
        let mut ledger = BudgetLedger::new(10.0, 10.0, 1.0);
        ledger.record_spend(&task("a"), 2.0).unwrap();
        assert!(ledger.raise_limit(&BudgetScope::Project, 1.0).is_err());
        assert!(ledger.raise_limit(&task("a"), 1.0).is_err());
        ledger.raise_limit(&task("a"), 4.0).unwrap();
        assert_eq!(ledger.tasks["a"].limit, 4.0);
    }

    #[test]
    fn test_save_and_load_drops_reservations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("budget.json");
        let mut ledger = BudgetLedger::new(10.0, 5.0, 1.0);
        ledger.record_spend(&task("planning"), 0.75).unwrap();
        let _held = ledger.reserve("planning", &[1.0]).unwrap();
        ledger.save(&path).unwrap();

        let loaded = BudgetLedger::load_or_new(&path, 1.0, 1.0, 1.0).unwrap();
        assert!((loaded.project.spent - 0.75).abs() < 1e-9);
        assert_eq!(loaded.project.reserved, 0.0);
        assert_eq!(loaded.project.limit, 10.0);
        assert_eq!(loaded.outstanding_reservations(), 0);
    }

    #[test]
    fn test_load_or_new_without_file_uses_limits() {
        let dir = tempdir().unwrap();
        let ledger = BudgetLedger::load_or_new(&dir.path().join("none.json"), 7.0, 2.0, 0.5).unwrap();
        assert_eq!(ledger.project.limit, 7.0);
        assert_eq!(ledger.default_task_limit, 2.0);
        assert_eq!(ledger.invocation_limit, 0.5);
    }

    fn scope_strategy() -> impl Strategy<Value = BudgetScope> {
        prop_oneof![
            Just(BudgetScope::Project),
            "[ab]".prop_map(BudgetScope::Task),
            "[ab]".prop_map(|task| BudgetScope::Invocation { task }),
        ]
    }

    proptest! {
        #[test]
        fn prop_spent_never_exceeds_limit(
            ops in proptest::collection::vec((scope_strategy(), 0.0f64..3.0), 1..40)
        ) {
            let mut ledger = BudgetLedger::new(10.0, 4.0, 2.0);
            for (scope, amount) in ops {
                let before = ledger.clone();
                let admitted = ledger.can_spend(&scope, amount);
                let result = ledger.record_spend(&scope, amount);
                prop_assert_eq!(admitted, result.is_ok());
                if !admitted {
                    prop_assert_eq!(&ledger, &before);
                }
                prop_assert!(ledger.project.spent <= ledger.project.limit + 1e-9);
                for balance in ledger.tasks.values() {
                    prop_assert!(balance.spent <= balance.limit + 1e-9);
                }
            }
        }
    }
}
