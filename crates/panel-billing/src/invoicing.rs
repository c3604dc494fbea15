//! Invoice Amount Calculation
//!
//! Turns aggregated usage into money. All arithmetic is exact: whole GB
//! times an integer rate, summed as integers. The carried balance is
//! whatever the root still owes from earlier periods and must be read from
//! the ledger BEFORE this run's total is written back, otherwise the fresh
//! invoice would count itself as its own unpaid remainder. The engine
//! sequences the two steps; this module is pure.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::BalanceSnapshot;
use crate::usage::AdminUsage;

/// One admin's row in a root invoice: usage priced at the root's rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminLine {
    /// The admin that provisioned the usage
    pub admin_uuid: Uuid,
    /// Admin display name
    pub admin_name: String,
    /// Aggregated billable GB
    pub usage_gb: i64,
    /// Rate applied (always the billing root's rate)
    pub price_per_gb: i64,
    /// `usage_gb * price_per_gb`
    pub amount: i64,
}

/// Complete amount calculation for one billing root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceCalculation {
    /// The billing root
    pub root_uuid: Uuid,
    /// Per-admin breakdown, root first then descendants
    pub lines: Vec<AdminLine>,
    /// Sum of all line amounts for this window
    pub current_total: i64,
    /// Unpaid remainder carried from earlier periods, never negative
    pub carried_balance: i64,
    /// `current_total + carried_balance`
    pub payable_total: i64,
}

/// Price the aggregated usage and fold in the carried remainder.
///
/// `prior` must reflect ledger state from before any write of this run.
pub fn calculate_invoice(
    root_uuid: Uuid,
    usages: &[AdminUsage],
    price_per_gb: i64,
    prior: &BalanceSnapshot,
) -> InvoiceCalculation {
    let lines: Vec<AdminLine> = usages
        .iter()
        .map(|usage| AdminLine {
            admin_uuid: usage.admin_uuid,
            admin_name: usage.admin_name.clone(),
            usage_gb: usage.total_gb,
            price_per_gb,
            amount: usage.total_gb * price_per_gb,
        })
        .collect();

    let current_total = lines.iter().map(|l| l.amount).sum();
    let carried_balance = prior.carried();
    InvoiceCalculation {
        root_uuid,
        lines,
        current_total,
        carried_balance,
        payable_total: current_total + carried_balance,
    }
}
