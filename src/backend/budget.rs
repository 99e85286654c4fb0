//! Run-level cost accounting.
//!
//! The ledger is the only mutable state shared across concurrent item
//! processing. `try_charge` is a single compare-exchange step so two
//! backends can never both slip under the budget check at the same time.

use std::sync::atomic::{AtomicU64, Ordering};

const MICROS_PER_USD: f64 = 1_000_000.0;

/// Shared cost counter for one pipeline run, owned by the run.
///
/// Costs are stored as integer micro-dollars so increment-and-check is a
/// single atomic operation.
#[derive(Debug)]
pub struct CostLedger {
    budget_micros: u64,
    spent_micros: AtomicU64,
}

impl CostLedger {
    /// Create a ledger with the given run-level budget in USD.
    pub fn new(budget_usd: f64) -> Self {
        Self {
            budget_micros: (budget_usd.max(0.0) * MICROS_PER_USD).round() as u64,
            spent_micros: AtomicU64::new(0),
        }
    }

    /// Atomically charge `cost_usd` if it fits under the budget.
    ///
    /// Returns false (and charges nothing) when the charge would exceed
    /// the budget. Zero-cost charges always succeed.
    pub fn try_charge(&self, cost_usd: f64) -> bool {
        let cost = (cost_usd.max(0.0) * MICROS_PER_USD).round() as u64;
        if cost == 0 {
            return true;
        }

        self.spent_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |spent| {
                spent
                    .checked_add(cost)
                    .filter(|total| *total <= self.budget_micros)
            })
            .is_ok()
    }

    /// Total spent so far in USD.
    pub fn spent_usd(&self) -> f64 {
        self.spent_micros.load(Ordering::SeqCst) as f64 / MICROS_PER_USD
    }

    /// Remaining budget in USD.
    pub fn remaining_usd(&self) -> f64 {
        let spent = self.spent_micros.load(Ordering::SeqCst);
        self.budget_micros.saturating_sub(spent) as f64 / MICROS_PER_USD
    }

    /// Configured budget in USD.
    pub fn budget_usd(&self) -> f64 {
        self.budget_micros as f64 / MICROS_PER_USD
    }
}
